/*!
 * Forwarding of serial requests to a TCP-hosted device.
 *
 * The RTU server calls [`ForwardingHandler::handle`] on its own thread. The
 * request is spawned onto the runtime that owns the TCP link and the server
 * thread waits for the result with a bound. Live answers refresh the cache;
 * failed reads fall back to it.
 *
 * Writes go into the cache before they are forwarded and are acknowledged
 * to the serial master even when the device cannot be reached.
 */
use std::sync::mpsc as std_mpsc;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tracing::warn;

use super::cache::RegisterCache;
use super::server::RequestHandler;
use crate::error::DeviceError;
use crate::link::Link;
use crate::protocol::{ExceptionCode, Request, Response};

/// Default bound on one forwarded request
pub const FORWARD_TIMEOUT: Duration = Duration::from_secs(2);

/// Forwards every request to a live link
pub struct ForwardingHandler {
    link: Arc<Link>,
    runtime: Handle,
    timeout: Duration,
    cache: Mutex<RegisterCache>,
}

impl ForwardingHandler {
    /// Forward to `link`, which lives on `runtime`
    pub fn new(link: Arc<Link>, runtime: Handle, timeout: Duration) -> Self {
        Self {
            link,
            runtime,
            timeout,
            cache: Mutex::new(RegisterCache::new()),
        }
    }

    fn forward(&self, request: &Request) -> Result<Response, DeviceError> {
        let (tx, rx) = std_mpsc::sync_channel(1);
        let link = self.link.clone();
        let request = request.clone();
        self.runtime.spawn(async move {
            let _ = tx.send(link.forward(request).await);
        });

        match rx.recv_timeout(self.timeout) {
            Ok(result) => result,
            Err(std_mpsc::RecvTimeoutError::Timeout) => Err(DeviceError::ForwardTimeout(self.timeout)),
            Err(std_mpsc::RecvTimeoutError::Disconnected) => {
                Err(DeviceError::WorkerGone(self.link.name().to_string()))
            }
        }
    }
}

impl ForwardingHandler {
    fn write_through(&self, request: &Request) -> Result<Response, ExceptionCode> {
        let Some(ack) = Response::write_ack(request) else {
            return Err(ExceptionCode::IllegalFunction);
        };
        self.cache.lock().update(request, &ack);
        match self.forward(request) {
            Ok(response) => Ok(response),
            Err(e) => {
                warn!(device = %self.link.name(), ?request, "Forward of write failed, acknowledged from cache: {}", e);
                Ok(ack)
            }
        }
    }
}

impl RequestHandler for ForwardingHandler {
    fn handle(&self, request: &Request) -> Result<Response, ExceptionCode> {
        if !request.is_read() {
            return self.write_through(request);
        }
        match self.forward(request) {
            Ok(response) => {
                self.cache.lock().update(request, &response);
                Ok(response)
            }
            // the device's own answer is relayed as is
            Err(DeviceError::Protocol(exception)) => Err(exception),
            Err(e) => match self.cache.lock().answer(request) {
                Some(cached) => {
                    warn!(
                        device = %self.link.name(),
                        function = ?request.function_code(),
                        "Forward failed, serving cached values: {}", e
                    );
                    Ok(cached)
                }
                None => {
                    warn!(device = %self.link.name(), "Forward failed with nothing cached: {}", e);
                    Err(ExceptionCode::GatewayTargetFailedToRespond)
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::mock::{MockConnector, MockDevice};

    async fn handler(device: &Arc<MockDevice>, timeout: Duration) -> Arc<ForwardingHandler> {
        let link = Link::tcp_with_connector("target", 1, Duration::from_secs(1), MockConnector::new(device.clone()));
        link.connect().await.unwrap();
        Arc::new(ForwardingHandler::new(Arc::new(link), Handle::current(), timeout))
    }

    async fn handle(handler: &Arc<ForwardingHandler>, request: Request) -> Result<Response, ExceptionCode> {
        let handler = handler.clone();
        tokio::task::spawn_blocking(move || handler.handle(&request)).await.unwrap()
    }

    #[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 2))]
    async fn test_live_values_then_cached_fallback() {
        let device = MockDevice::new();
        device.set_holding(0, &[10, 20]);
        let handler = handler(&device, FORWARD_TIMEOUT).await;
        let request = Request::ReadHoldingRegisters { address: 0, count: 2 };

        assert_eq!(
            handle(&handler, request.clone()).await,
            Ok(Response::ReadHoldingRegisters(vec![10, 20]))
        );

        device.set_offline(true);
        assert_eq!(
            handle(&handler, request).await,
            Ok(Response::ReadHoldingRegisters(vec![10, 20]))
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_uncached_failure_answers_gateway_exception() {
        let device = MockDevice::new();
        device.set_offline(true);
        let handler = handler(&device, FORWARD_TIMEOUT).await;

        assert_eq!(
            handle(&handler, Request::ReadInputRegisters { address: 0, count: 1 }).await,
            Err(ExceptionCode::GatewayTargetFailedToRespond)
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_write_during_outage_is_cached_and_acknowledged() {
        let device = MockDevice::new();
        device.set_holding(0, &[1]);
        let handler = handler(&device, FORWARD_TIMEOUT).await;
        let read = Request::ReadHoldingRegisters { address: 0, count: 1 };
        assert_eq!(handle(&handler, read.clone()).await, Ok(Response::ReadHoldingRegisters(vec![1])));

        device.set_offline(true);
        assert_eq!(
            handle(&handler, Request::WriteSingleRegister { address: 0, value: 99 }).await,
            Ok(Response::WriteSingleRegister { address: 0, value: 99 })
        );
        assert_eq!(handle(&handler, read).await, Ok(Response::ReadHoldingRegisters(vec![99])));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_write_reaches_the_device() {
        let device = MockDevice::new();
        device.set_coils(0, &[false, false]);
        let handler = handler(&device, FORWARD_TIMEOUT).await;

        let write = Request::WriteMultipleCoils { address: 0, values: vec![true, true] };
        assert_eq!(handle(&handler, write.clone()).await, Ok(Response::write_ack(&write).unwrap()));
        assert_eq!(device.coils(0, 2), vec![true, true]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_device_exception_is_relayed() {
        let device = MockDevice::new();
        device.respond_with_exception(Some(ExceptionCode::IllegalDataAddress));
        let handler = handler(&device, FORWARD_TIMEOUT).await;

        assert_eq!(
            handle(&handler, Request::ReadHoldingRegisters { address: 0x9000, count: 1 }).await,
            Err(ExceptionCode::IllegalDataAddress)
        );
    }
}
