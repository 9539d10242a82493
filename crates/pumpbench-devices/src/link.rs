/*!
 * A link is the connection to one device id over one transport.
 *
 * TCP links run on the async runtime and keep a second, blocking socket for
 * callers on dedicated threads. Serial links hand every request to a port
 * worker thread that owns the line, so at most one request is in flight per
 * physical port whichever path it came from. Serial reads are retried inside
 * the worker; nothing else is.
 *
 * Every completed request updates the link's [`DeviceStatus`].
 */
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc as std_mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, info, trace, warn};

use pumpbench_core::config::{LinkConfig, TransportConfig};
use pumpbench_core::utils::retry_blocking;

use crate::error::{DeviceError, Result};
use crate::protocol::{Request, Response};
use crate::status::{DeviceHealth, DeviceStatus};
use crate::transport::{
    BlockingConnector, BlockingTransport, Connector, SerialConnector, TcpConnector, Transport,
};

/// Attempts for a read on a serial link
pub const SERIAL_READ_ATTEMPTS: usize = 3;
/// Delay between serial read attempts
pub const SERIAL_RETRY_DELAY: Duration = Duration::from_millis(100);

/// A connection to one device
#[derive(Debug)]
pub struct Link {
    name: String,
    unit_id: u8,
    timeout: Duration,
    backend: Backend,
    connected: AtomicBool,
    status: Mutex<DeviceStatus>,
}

#[derive(Debug)]
enum Backend {
    Tcp(TcpBackend),
    Serial(SerialBackend),
}

#[derive(Debug)]
struct TcpBackend {
    connector: Arc<dyn Connector>,
    transport: tokio::sync::Mutex<Option<Box<dyn Transport>>>,
    blocking: Mutex<Option<Box<dyn BlockingTransport>>>,
}

#[derive(Debug)]
struct SerialBackend {
    connector: Arc<dyn BlockingConnector>,
    worker: Mutex<Option<PortWorker>>,
}

impl Link {
    /// Build a link from configuration; nothing is opened until [`Link::connect`]
    pub fn from_config<S: AsRef<str>>(name: S, config: &LinkConfig) -> Self {
        match &config.transport {
            TransportConfig::Tcp { host, port } => Self::tcp_with_connector(
                name,
                config.unit_id,
                config.timeout(),
                Arc::new(TcpConnector::new(host, *port, config.timeout())),
            ),
            TransportConfig::Serial { path, uart } => Self::serial_with_connector(
                name,
                config.unit_id,
                config.timeout(),
                Arc::new(SerialConnector::new(path, uart.clone(), config.timeout())),
            ),
        }
    }

    /// A TCP-style link whose transports come from `connector`
    pub fn tcp_with_connector<S: AsRef<str>>(
        name: S,
        unit_id: u8,
        timeout: Duration,
        connector: Arc<dyn Connector>,
    ) -> Self {
        Self::new(
            name,
            unit_id,
            timeout,
            Backend::Tcp(TcpBackend {
                connector,
                transport: tokio::sync::Mutex::new(None),
                blocking: Mutex::new(None),
            }),
        )
    }

    /// A serial-style link whose port worker opens its transport from `connector`
    pub fn serial_with_connector<S: AsRef<str>>(
        name: S,
        unit_id: u8,
        timeout: Duration,
        connector: Arc<dyn BlockingConnector>,
    ) -> Self {
        Self::new(
            name,
            unit_id,
            timeout,
            Backend::Serial(SerialBackend {
                connector,
                worker: Mutex::new(None),
            }),
        )
    }

    fn new<S: AsRef<str>>(name: S, unit_id: u8, timeout: Duration, backend: Backend) -> Self {
        Self {
            name: name.as_ref().to_string(),
            unit_id,
            timeout,
            backend,
            connected: AtomicBool::new(false),
            status: Mutex::new(DeviceStatus::default()),
        }
    }

    /// Name of the link
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Device id addressed by the link
    pub fn unit_id(&self) -> u8 {
        self.unit_id
    }

    /// Endpoint description
    pub fn endpoint(&self) -> String {
        match &self.backend {
            Backend::Tcp(tcp) => tcp.connector.endpoint(),
            Backend::Serial(serial) => serial.connector.endpoint(),
        }
    }

    /// Whether requests go through a port worker
    pub fn is_serial(&self) -> bool {
        matches!(self.backend, Backend::Serial(_))
    }

    /// Whether [`Link::connect`] succeeded and no disconnect followed
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Snapshot of the link status
    pub fn status(&self) -> DeviceStatus {
        self.status.lock().clone()
    }

    /// Current health
    pub fn health(&self) -> DeviceHealth {
        self.status.lock().health
    }

    /// Open the transport; a no-op when already connected
    pub async fn connect(&self) -> Result<()> {
        if self.is_connected() {
            return Ok(());
        }

        let result = match &self.backend {
            Backend::Tcp(tcp) => match tcp.connector.open().await {
                Ok(transport) => {
                    *tcp.transport.lock().await = Some(transport);
                    Ok(())
                }
                Err(e) => Err(e),
            },
            Backend::Serial(serial) => {
                match PortWorker::spawn(&self.name, self.unit_id, serial.connector.clone()).await {
                    Ok(worker) => {
                        *serial.worker.lock() = Some(worker);
                        Ok(())
                    }
                    Err(e) => Err(e),
                }
            }
        };

        match &result {
            Ok(()) => {
                self.connected.store(true, Ordering::SeqCst);
                self.status.lock().record_connected();
                info!(device = %self.name, endpoint = %self.endpoint(), "Link connected");
            }
            Err(e) => {
                self.status.lock().record_connect_error(e.to_string());
                warn!(device = %self.name, endpoint = %self.endpoint(), "Link connect failed: {}", e);
            }
        }
        result
    }

    /// Release the transport; idempotent
    pub async fn disconnect(&self) {
        let was_connected = self.connected.swap(false, Ordering::SeqCst);

        match &self.backend {
            Backend::Tcp(tcp) => {
                if let Some(mut transport) = tcp.transport.lock().await.take() {
                    if let Err(e) = transport.close().await {
                        debug!(device = %self.name, "Error closing transport: {}", e);
                    }
                }
                if let Some(mut blocking) = tcp.blocking.lock().take() {
                    blocking.close();
                }
            }
            Backend::Serial(serial) => {
                let worker = serial.worker.lock().take();
                if let Some(worker) = worker {
                    if let Err(e) = tokio::task::spawn_blocking(move || worker.shutdown()).await {
                        warn!(device = %self.name, "Port worker shutdown failed: {}", e);
                    }
                }
            }
        }

        self.status.lock().record_offline();
        if was_connected {
            info!(device = %self.name, "Link disconnected");
        }
    }

    async fn call(&self, request: Request) -> Result<Response> {
        request.validate()?;
        if !self.is_connected() {
            return Err(DeviceError::NotConnected);
        }

        let result = match &self.backend {
            Backend::Tcp(tcp) => {
                let mut transport = tcp.transport.lock().await;
                match transport.as_mut() {
                    Some(transport) => transport.call(self.unit_id, &request).await,
                    None => return Err(DeviceError::NotConnected),
                }
            }
            Backend::Serial(serial) => {
                let (reply, rx) = oneshot::channel();
                self.submit(serial, request.clone(), request.is_read(), Reply::Async(reply))?;
                match rx.await {
                    Ok(result) => result,
                    Err(_) => Err(DeviceError::WorkerGone(self.name.clone())),
                }
            }
        };

        self.record(&request, &result);
        result
    }

    fn call_blocking(&self, request: Request) -> Result<Response> {
        request.validate()?;
        if !self.is_connected() {
            return Err(DeviceError::NotConnected);
        }

        let result = match &self.backend {
            Backend::Tcp(tcp) => self.tcp_blocking_call(tcp, &request),
            Backend::Serial(serial) => {
                let (reply, rx) = std_mpsc::sync_channel(1);
                self.submit(serial, request.clone(), false, Reply::Blocking(reply))?;
                match rx.recv_timeout(self.blocking_wait()) {
                    Ok(result) => result,
                    Err(std_mpsc::RecvTimeoutError::Timeout) => Err(DeviceError::timeout(format!(
                        "{} port worker did not answer in {:?}",
                        self.name,
                        self.blocking_wait()
                    ))),
                    Err(std_mpsc::RecvTimeoutError::Disconnected) => {
                        Err(DeviceError::WorkerGone(self.name.clone()))
                    }
                }
            }
        };

        self.record(&request, &result);
        result
    }

    // The blocking socket is opened on first use
    fn tcp_blocking_call(&self, tcp: &TcpBackend, request: &Request) -> Result<Response> {
        let mut blocking = tcp.blocking.lock();
        if blocking.is_none() {
            *blocking = Some(tcp.connector.open_blocking()?);
            debug!(device = %self.name, "Blocking socket opened");
        }
        match blocking.as_mut() {
            Some(transport) => transport.call(self.unit_id, request),
            None => Err(DeviceError::NotConnected),
        }
    }

    fn submit(&self, serial: &SerialBackend, request: Request, retry: bool, reply: Reply) -> Result<()> {
        let worker = serial.worker.lock();
        let worker = worker.as_ref().ok_or(DeviceError::NotConnected)?;
        worker
            .jobs
            .send(Job { request, retry, reply })
            .map_err(|_| DeviceError::WorkerGone(self.name.clone()))
    }

    // Worst case a blocking caller queues behind a retried read
    fn blocking_wait(&self) -> Duration {
        let attempts = SERIAL_READ_ATTEMPTS as u32;
        self.timeout * (attempts + 1) + SERIAL_RETRY_DELAY * attempts
    }

    fn record(&self, request: &Request, result: &Result<Response>) {
        let (before, after) = {
            let mut status = self.status.lock();
            let before = status.health;
            match result {
                Ok(_) => status.record_success(),
                Err(e) => status.record_error(e.to_string()),
            }
            (before, status.health)
        };

        if let Err(e) = result {
            debug!(device = %self.name, function = ?request.function_code(), "Request failed: {}", e);
        } else {
            trace!(device = %self.name, function = ?request.function_code(), "Request succeeded");
        }
        if before != after {
            match after {
                DeviceHealth::Healthy => info!(device = %self.name, "Link recovered"),
                _ => warn!(device = %self.name, health = %after, "Link health changed"),
            }
        }
    }

    /// Read holding registers
    pub async fn read_holding_registers(&self, address: u16, count: u16) -> Result<Vec<u16>> {
        into_words(self.call(Request::ReadHoldingRegisters { address, count }).await?)
    }

    /// Read input registers
    pub async fn read_input_registers(&self, address: u16, count: u16) -> Result<Vec<u16>> {
        into_words(self.call(Request::ReadInputRegisters { address, count }).await?)
    }

    /// Read coils
    pub async fn read_coils(&self, address: u16, count: u16) -> Result<Vec<bool>> {
        into_bits(self.call(Request::ReadCoils { address, count }).await?)
    }

    /// Read discrete inputs
    pub async fn read_discrete_inputs(&self, address: u16, count: u16) -> Result<Vec<bool>> {
        into_bits(self.call(Request::ReadDiscreteInputs { address, count }).await?)
    }

    /// Write one coil
    pub async fn write_single_coil(&self, address: u16, value: bool) -> Result<()> {
        self.call(Request::WriteSingleCoil { address, value }).await.map(|_| ())
    }

    /// Write one holding register
    pub async fn write_single_register(&self, address: u16, value: u16) -> Result<()> {
        self.call(Request::WriteSingleRegister { address, value }).await.map(|_| ())
    }

    /// Write consecutive coils
    pub async fn write_multiple_coils(&self, address: u16, values: &[bool]) -> Result<()> {
        self.call(Request::WriteMultipleCoils {
            address,
            values: values.to_vec(),
        })
        .await
        .map(|_| ())
    }

    /// Write consecutive holding registers
    pub async fn write_multiple_registers(&self, address: u16, values: &[u16]) -> Result<()> {
        self.call(Request::WriteMultipleRegisters {
            address,
            values: values.to_vec(),
        })
        .await
        .map(|_| ())
    }

    /// Send any supported request, as the bridge does
    pub async fn forward(&self, request: Request) -> Result<Response> {
        self.call(request).await
    }

    /// Blocking [`Link::read_holding_registers`]
    pub fn read_holding_registers_blocking(&self, address: u16, count: u16) -> Result<Vec<u16>> {
        into_words(self.call_blocking(Request::ReadHoldingRegisters { address, count })?)
    }

    /// Blocking [`Link::read_input_registers`]
    pub fn read_input_registers_blocking(&self, address: u16, count: u16) -> Result<Vec<u16>> {
        into_words(self.call_blocking(Request::ReadInputRegisters { address, count })?)
    }

    /// Blocking [`Link::read_coils`]
    pub fn read_coils_blocking(&self, address: u16, count: u16) -> Result<Vec<bool>> {
        into_bits(self.call_blocking(Request::ReadCoils { address, count })?)
    }

    /// Blocking [`Link::read_discrete_inputs`]
    pub fn read_discrete_inputs_blocking(&self, address: u16, count: u16) -> Result<Vec<bool>> {
        into_bits(self.call_blocking(Request::ReadDiscreteInputs { address, count })?)
    }

    /// Blocking [`Link::write_single_coil`]
    pub fn write_single_coil_blocking(&self, address: u16, value: bool) -> Result<()> {
        self.call_blocking(Request::WriteSingleCoil { address, value }).map(|_| ())
    }

    /// Blocking [`Link::write_single_register`]
    pub fn write_single_register_blocking(&self, address: u16, value: u16) -> Result<()> {
        self.call_blocking(Request::WriteSingleRegister { address, value }).map(|_| ())
    }

    /// Blocking [`Link::write_multiple_coils`]
    pub fn write_multiple_coils_blocking(&self, address: u16, values: &[bool]) -> Result<()> {
        self.call_blocking(Request::WriteMultipleCoils {
            address,
            values: values.to_vec(),
        })
        .map(|_| ())
    }

    /// Blocking [`Link::write_multiple_registers`]
    pub fn write_multiple_registers_blocking(&self, address: u16, values: &[u16]) -> Result<()> {
        self.call_blocking(Request::WriteMultipleRegisters {
            address,
            values: values.to_vec(),
        })
        .map(|_| ())
    }
}

fn into_words(response: Response) -> Result<Vec<u16>> {
    match response {
        Response::ReadHoldingRegisters(words) | Response::ReadInputRegisters(words) => Ok(words),
        other => Err(DeviceError::frame(format!("Expected registers, got {:?}", other.function_code()))),
    }
}

fn into_bits(response: Response) -> Result<Vec<bool>> {
    match response {
        Response::ReadCoils(bits) | Response::ReadDiscreteInputs(bits) => Ok(bits),
        other => Err(DeviceError::frame(format!("Expected bits, got {:?}", other.function_code()))),
    }
}

enum Reply {
    Async(oneshot::Sender<Result<Response>>),
    Blocking(std_mpsc::SyncSender<Result<Response>>),
}

impl Reply {
    fn send(self, result: Result<Response>) {
        // the caller may have given up waiting
        match self {
            Reply::Async(tx) => {
                let _ = tx.send(result);
            }
            Reply::Blocking(tx) => {
                let _ = tx.try_send(result);
            }
        }
    }
}

struct Job {
    request: Request,
    retry: bool,
    reply: Reply,
}

/// The thread that owns a serial line
struct PortWorker {
    jobs: std_mpsc::Sender<Job>,
    thread: JoinHandle<()>,
}

impl std::fmt::Debug for PortWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PortWorker").finish_non_exhaustive()
    }
}

impl PortWorker {
    /// Start the worker; the transport is opened on the worker thread itself
    async fn spawn(name: &str, unit_id: u8, connector: Arc<dyn BlockingConnector>) -> Result<Self> {
        let (jobs, rx) = std_mpsc::channel::<Job>();
        let (opened_tx, opened_rx) = oneshot::channel();
        let thread_name = format!("port-{}", name);
        let device = name.to_string();

        let thread = std::thread::Builder::new()
            .name(thread_name)
            .spawn(move || {
                let mut transport = match connector.open_blocking() {
                    Ok(transport) => {
                        let _ = opened_tx.send(Ok(()));
                        transport
                    }
                    Err(e) => {
                        let _ = opened_tx.send(Err(e));
                        return;
                    }
                };
                Self::run(&device, unit_id, transport.as_mut(), rx);
                transport.close();
                debug!(device = %device, "Port worker stopped");
            })?;

        match opened_rx.await {
            Ok(Ok(())) => Ok(Self { jobs, thread }),
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(e)
            }
            Err(_) => Err(DeviceError::WorkerGone(name.to_string())),
        }
    }

    fn run(device: &str, unit_id: u8, transport: &mut dyn BlockingTransport, jobs: std_mpsc::Receiver<Job>) {
        while let Ok(job) = jobs.recv() {
            let result = if job.retry {
                retry_blocking(SERIAL_READ_ATTEMPTS, SERIAL_RETRY_DELAY, || {
                    transport.call(unit_id, &job.request)
                })
            } else {
                transport.call(unit_id, &job.request)
            };
            if let Err(e) = &result {
                trace!(device = %device, "Port request failed: {}", e);
            }
            job.reply.send(result);
        }
    }

    /// Stop accepting jobs and wait for the queue to drain
    fn shutdown(self) {
        let PortWorker { jobs, thread } = self;
        drop(jobs);
        let _ = thread.join();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockConnector, MockDevice};
    use crate::protocol::ExceptionCode;

    fn tcp_link(device: &Arc<MockDevice>) -> Link {
        Link::tcp_with_connector("test", 1, Duration::from_secs(1), MockConnector::new(device.clone()))
    }

    fn serial_link(device: &Arc<MockDevice>) -> Link {
        Link::serial_with_connector(
            "serial",
            1,
            Duration::from_millis(200),
            MockConnector::new(device.clone()),
        )
    }

    #[tokio::test]
    async fn test_link_starts_offline() {
        let device = MockDevice::new();
        let link = tcp_link(&device);
        assert_eq!(link.health(), DeviceHealth::Offline);
        assert!(matches!(
            link.read_holding_registers(0, 1).await,
            Err(DeviceError::NotConnected)
        ));

        link.connect().await.unwrap();
        assert!(link.is_connected());
        assert_eq!(link.health(), DeviceHealth::Healthy);
    }

    #[tokio::test]
    async fn test_five_failures_make_link_unhealthy() {
        let device = MockDevice::new();
        device.set_holding(0, &[7]);
        let link = tcp_link(&device);
        link.connect().await.unwrap();

        device.set_offline(true);
        for _ in 0..5 {
            assert!(link.read_holding_registers(0, 1).await.is_err());
        }
        let status = link.status();
        assert_eq!(status.health, DeviceHealth::Unhealthy);
        assert_eq!(status.consecutive_errors, 5);

        device.set_offline(false);
        assert_eq!(link.read_holding_registers(0, 1).await.unwrap(), vec![7]);
        let status = link.status();
        assert_eq!(status.consecutive_errors, 0);
        assert_eq!(status.health, DeviceHealth::Healthy);
    }

    #[tokio::test]
    async fn test_tcp_link_does_not_retry() {
        let device = MockDevice::new();
        let link = tcp_link(&device);
        link.connect().await.unwrap();

        device.fail_next(1);
        assert!(link.read_coils(0, 8).await.is_err());
        assert_eq!(device.call_count(), 1);
    }

    #[tokio::test]
    async fn test_protocol_error_counts_against_health() {
        let device = MockDevice::new();
        let link = tcp_link(&device);
        link.connect().await.unwrap();

        device.respond_with_exception(Some(ExceptionCode::IllegalDataAddress));
        assert!(matches!(
            link.write_single_coil(0, true).await,
            Err(DeviceError::Protocol(ExceptionCode::IllegalDataAddress))
        ));
        assert_eq!(link.status().consecutive_errors, 1);
    }

    #[tokio::test]
    async fn test_validation_happens_before_io() {
        let device = MockDevice::new();
        let link = tcp_link(&device);
        link.connect().await.unwrap();

        assert!(matches!(
            link.read_holding_registers(0, 200).await,
            Err(DeviceError::Validation(_))
        ));
        assert_eq!(device.call_count(), 0);
        assert_eq!(link.status().total_requests, 0);
    }

    #[tokio::test]
    async fn test_tcp_blocking_path_shares_the_device() {
        let device = MockDevice::new();
        let link = Arc::new(tcp_link(&device));
        link.connect().await.unwrap();

        let blocking = link.clone();
        tokio::task::spawn_blocking(move || blocking.write_multiple_coils_blocking(0, &[true; 8]))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(link.read_coils(0, 8).await.unwrap(), vec![true; 8]);
        assert_eq!(link.status().successful_requests, 2);
    }

    #[tokio::test]
    async fn test_serial_reads_retry_in_worker() {
        let device = MockDevice::new();
        device.set_holding(0x1000, &[123]);
        let link = serial_link(&device);
        link.connect().await.unwrap();

        device.fail_next(2);
        assert_eq!(link.read_holding_registers(0x1000, 1).await.unwrap(), vec![123]);
        assert_eq!(device.call_count(), 3);
        assert_eq!(link.status().consecutive_errors, 0);

        device.fail_next(3);
        assert!(link.read_holding_registers(0x1000, 1).await.is_err());
        assert_eq!(device.call_count(), 6);
        link.disconnect().await;
    }

    #[tokio::test]
    async fn test_serial_writes_and_blocking_calls_do_not_retry() {
        let device = MockDevice::new();
        let link = Arc::new(serial_link(&device));
        link.connect().await.unwrap();

        device.fail_next(1);
        assert!(link.write_single_coil(3, true).await.is_err());
        assert_eq!(device.call_count(), 1);

        device.fail_next(1);
        let blocking = link.clone();
        let result = tokio::task::spawn_blocking(move || blocking.read_discrete_inputs_blocking(0, 8))
            .await
            .unwrap();
        assert!(result.is_err());
        assert_eq!(device.call_count(), 2);
        link.disconnect().await;
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let device = MockDevice::new();
        let link = serial_link(&device);
        link.connect().await.unwrap();

        link.disconnect().await;
        link.disconnect().await;
        assert!(!link.is_connected());
        assert_eq!(link.health(), DeviceHealth::Offline);
        assert!(matches!(link.read_coils(0, 1).await, Err(DeviceError::NotConnected)));
    }

    #[tokio::test]
    async fn test_connect_failure_is_reported() {
        let device = MockDevice::new();
        let connector = MockConnector::new(device);
        connector.refuse_connections(true);
        let link = Link::serial_with_connector("refused", 1, Duration::from_millis(100), connector);

        assert!(link.connect().await.is_err());
        assert!(link.connect().await.is_err());
        assert!(!link.is_connected());
        let status = link.status();
        assert_eq!(status.health, DeviceHealth::Offline);
        assert_eq!(status.error_count, 2);
    }
}
