/*!
 * Transports carry request PDUs to one device and bring back responses.
 *
 * [`Transport`] is the cooperative flavor used on the async runtime;
 * [`BlockingTransport`] is used from dedicated threads (the serial port
 * worker, the safety sampler, the watchdog fail-safe). Connectors open
 * transports so a link can reconnect and tests can substitute in-memory
 * devices.
 */
use std::fmt;
use std::io::{Read, Write};
use std::net::{TcpStream as StdTcpStream, ToSocketAddrs};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, trace};

use pumpbench_core::config::{Parity, UartConfig};

use crate::error::{DeviceError, Result};
use crate::protocol::tcp::{self as mbap, MbapHeader, TransactionIds, MBAP_HEADER_LEN};
use crate::protocol::{rtu, Request, Response};

/// A transport used from the async runtime
#[async_trait]
pub trait Transport: Send + fmt::Debug {
    /// Send a request to `unit_id` and wait for its response
    async fn call(&mut self, unit_id: u8, request: &Request) -> Result<Response>;

    /// Release the underlying connection
    async fn close(&mut self) -> Result<()>;
}

/// A transport used from a dedicated thread
pub trait BlockingTransport: Send + fmt::Debug {
    /// Send a request to `unit_id` and wait for its response
    fn call(&mut self, unit_id: u8, request: &Request) -> Result<Response>;

    /// Release the underlying connection
    fn close(&mut self) {}
}

/// Opens blocking transports
pub trait BlockingConnector: Send + Sync + fmt::Debug {
    /// Open a new blocking transport
    fn open_blocking(&self) -> Result<Box<dyn BlockingTransport>>;

    /// Endpoint description for logs
    fn endpoint(&self) -> String;
}

/// Opens both transport flavors
#[async_trait]
pub trait Connector: BlockingConnector {
    /// Open a new async transport
    async fn open(&self) -> Result<Box<dyn Transport>>;
}

/// Modbus TCP on the async runtime
#[derive(Debug)]
pub struct TcpTransport {
    endpoint: String,
    stream: Option<TcpStream>,
    timeout: Duration,
    ids: TransactionIds,
}

impl TcpTransport {
    /// Connect to `endpoint` (`host:port`)
    pub async fn connect<S: AsRef<str>>(endpoint: S, timeout: Duration) -> Result<Self> {
        let mut transport = Self {
            endpoint: endpoint.as_ref().to_string(),
            stream: None,
            timeout,
            ids: TransactionIds::default(),
        };
        transport.reconnect().await?;
        Ok(transport)
    }

    async fn reconnect(&mut self) -> Result<()> {
        self.stream = None;
        let stream = tokio::time::timeout(self.timeout, TcpStream::connect(&self.endpoint))
            .await
            .map_err(|_| DeviceError::timeout(format!("Connecting to {} timed out", self.endpoint)))?
            .map_err(|e| DeviceError::transport(format!("Failed to connect to {}: {}", self.endpoint, e)))?;
        stream.set_nodelay(true)?;
        debug!(endpoint = %self.endpoint, "TCP transport connected");
        self.stream = Some(stream);
        Ok(())
    }

    async fn exchange(
        stream: &mut TcpStream,
        transaction_id: u16,
        unit_id: u8,
        request: &Request,
    ) -> Result<Response> {
        let frame = mbap::encode_frame(transaction_id, unit_id, &request.to_pdu());
        trace!(frame = %rtu::hex(&frame), "TCP send");
        stream.write_all(&frame).await?;

        let mut header = [0u8; MBAP_HEADER_LEN];
        stream.read_exact(&mut header).await?;
        let header = MbapHeader::decode(&header)?;
        let mut pdu = vec![0u8; header.pdu_len];
        stream.read_exact(&mut pdu).await?;
        trace!(pdu = %rtu::hex(&pdu), "TCP receive");

        if header.transaction_id != transaction_id {
            return Err(DeviceError::frame(format!(
                "Transaction id mismatch: sent {}, got {}",
                transaction_id, header.transaction_id
            )));
        }
        Response::decode(request, &pdu)
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn call(&mut self, unit_id: u8, request: &Request) -> Result<Response> {
        request.validate()?;
        if self.stream.is_none() {
            self.reconnect().await?;
        }
        let transaction_id = self.ids.next_id();
        let stream = self.stream.as_mut().ok_or(DeviceError::NotConnected)?;

        let result = match tokio::time::timeout(
            self.timeout,
            Self::exchange(stream, transaction_id, unit_id, request),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(DeviceError::timeout(format!(
                "{:?} to {} timed out after {:?}",
                request.function_code(),
                self.endpoint,
                self.timeout
            ))),
        };

        if matches!(&result, Err(e) if e.is_connection_loss()) {
            // the stream may hold a late or partial response
            self.stream = None;
        }
        result
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(mut stream) = self.stream.take() {
            stream.shutdown().await?;
        }
        Ok(())
    }
}

/// Modbus TCP over a blocking socket
#[derive(Debug)]
pub struct BlockingTcpTransport {
    endpoint: String,
    stream: Option<StdTcpStream>,
    timeout: Duration,
    ids: TransactionIds,
}

impl BlockingTcpTransport {
    /// Connect to `endpoint` (`host:port`)
    pub fn connect<S: AsRef<str>>(endpoint: S, timeout: Duration) -> Result<Self> {
        let mut transport = Self {
            endpoint: endpoint.as_ref().to_string(),
            stream: None,
            timeout,
            ids: TransactionIds::default(),
        };
        transport.reconnect()?;
        Ok(transport)
    }

    fn reconnect(&mut self) -> Result<()> {
        self.stream = None;
        let addr = self
            .endpoint
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| DeviceError::transport(format!("Cannot resolve {}", self.endpoint)))?;
        let stream = StdTcpStream::connect_timeout(&addr, self.timeout)
            .map_err(|e| DeviceError::transport(format!("Failed to connect to {}: {}", self.endpoint, e)))?;
        stream.set_read_timeout(Some(self.timeout))?;
        stream.set_write_timeout(Some(self.timeout))?;
        stream.set_nodelay(true)?;
        self.stream = Some(stream);
        Ok(())
    }

    fn exchange(
        stream: &mut StdTcpStream,
        transaction_id: u16,
        unit_id: u8,
        request: &Request,
    ) -> Result<Response> {
        let frame = mbap::encode_frame(transaction_id, unit_id, &request.to_pdu());
        stream.write_all(&frame)?;

        let mut header = [0u8; MBAP_HEADER_LEN];
        stream.read_exact(&mut header)?;
        let header = MbapHeader::decode(&header)?;
        let mut pdu = vec![0u8; header.pdu_len];
        stream.read_exact(&mut pdu)?;

        if header.transaction_id != transaction_id {
            return Err(DeviceError::frame("Transaction id mismatch"));
        }
        Response::decode(request, &pdu)
    }
}

impl BlockingTransport for BlockingTcpTransport {
    fn call(&mut self, unit_id: u8, request: &Request) -> Result<Response> {
        request.validate()?;
        if self.stream.is_none() {
            self.reconnect()?;
        }
        let transaction_id = self.ids.next_id();
        let stream = self.stream.as_mut().ok_or(DeviceError::NotConnected)?;

        let result = Self::exchange(stream, transaction_id, unit_id, request);

        if matches!(&result, Err(e) if e.is_connection_loss()) {
            self.stream = None;
        }
        result
    }

    fn close(&mut self) {
        if let Some(stream) = self.stream.take() {
            let _ = stream.shutdown(std::net::Shutdown::Both);
        }
    }
}

/// A byte port an RTU transport can run on
pub trait RtuPort: Read + Write + Send {
    /// Drop unread input before a new request
    fn discard_input(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl RtuPort for Box<dyn serialport::SerialPort> {
    fn discard_input(&mut self) -> std::io::Result<()> {
        self.clear(serialport::ClearBuffer::Input)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))
    }
}

impl RtuPort for std::os::unix::net::UnixStream {}

/// Modbus RTU over a byte port
pub struct RtuTransport<P: RtuPort> {
    port: P,
    frame_gap: Duration,
}

impl<P: RtuPort> fmt::Debug for RtuTransport<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RtuTransport").field("frame_gap", &self.frame_gap).finish()
    }
}

impl<P: RtuPort> RtuTransport<P> {
    /// Run on an already opened port; `frame_gap` is the silent interval between frames
    pub fn new(port: P, frame_gap: Duration) -> Self {
        Self { port, frame_gap }
    }

    fn read_response(&mut self) -> Result<Vec<u8>> {
        // exception responses, the shortest, are 5 bytes
        let mut frame = vec![0u8; 3];
        self.port.read_exact(&mut frame)?;
        let total = rtu::response_frame_len(&frame)
            .ok_or_else(|| DeviceError::frame("Cannot size response frame"))?;
        if total > rtu::MAX_FRAME_LEN {
            return Err(DeviceError::frame(format!("Response frame of {} bytes", total)));
        }
        frame.resize(total, 0);
        self.port.read_exact(&mut frame[3..])?;
        Ok(frame)
    }
}

impl RtuTransport<Box<dyn serialport::SerialPort>> {
    /// Open a serial device with the given framing
    pub fn open(path: &str, uart: &UartConfig, timeout: Duration) -> Result<Self> {
        let port = serialport::new(path, uart.baud_rate)
            .data_bits(data_bits(uart.data_bits)?)
            .parity(match uart.parity {
                Parity::None => serialport::Parity::None,
                Parity::Even => serialport::Parity::Even,
                Parity::Odd => serialport::Parity::Odd,
            })
            .stop_bits(if uart.stop_bits == 2 {
                serialport::StopBits::Two
            } else {
                serialport::StopBits::One
            })
            .timeout(timeout)
            .open()?;
        debug!(path, baud_rate = uart.baud_rate, "Serial port opened");
        Ok(Self::new(port, uart.char_time() * 7 / 2))
    }
}

impl<P: RtuPort> BlockingTransport for RtuTransport<P> {
    fn call(&mut self, unit_id: u8, request: &Request) -> Result<Response> {
        request.validate()?;
        let frame = rtu::encode_frame(unit_id, &request.to_pdu());
        self.port.discard_input()?;
        trace!(frame = %rtu::hex(&frame), "RTU send");
        self.port.write_all(&frame)?;
        self.port.flush()?;

        let response = self.read_response();
        std::thread::sleep(self.frame_gap);
        let response = response?;
        trace!(frame = %rtu::hex(&response), "RTU receive");

        let (unit, pdu) = rtu::decode_frame(&response)?;
        if unit != unit_id {
            return Err(DeviceError::frame(format!("Response from unit {}, expected {}", unit, unit_id)));
        }
        Response::decode(request, pdu)
    }
}

fn data_bits(bits: u8) -> Result<serialport::DataBits> {
    match bits {
        5 => Ok(serialport::DataBits::Five),
        6 => Ok(serialport::DataBits::Six),
        7 => Ok(serialport::DataBits::Seven),
        8 => Ok(serialport::DataBits::Eight),
        other => Err(DeviceError::validation(format!("Unsupported data bits {}", other))),
    }
}

/// Connects to a TCP-hosted device
#[derive(Debug, Clone)]
pub struct TcpConnector {
    endpoint: String,
    timeout: Duration,
}

impl TcpConnector {
    /// Connector for `host:port`
    pub fn new<S: AsRef<str>>(host: S, port: u16, timeout: Duration) -> Self {
        Self {
            endpoint: format!("{}:{}", host.as_ref(), port),
            timeout,
        }
    }
}

impl BlockingConnector for TcpConnector {
    fn open_blocking(&self) -> Result<Box<dyn BlockingTransport>> {
        Ok(Box::new(BlockingTcpTransport::connect(&self.endpoint, self.timeout)?))
    }

    fn endpoint(&self) -> String {
        self.endpoint.clone()
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn open(&self) -> Result<Box<dyn Transport>> {
        Ok(Box::new(TcpTransport::connect(&self.endpoint, self.timeout).await?))
    }
}

/// Opens a serial device
#[derive(Debug, Clone)]
pub struct SerialConnector {
    path: String,
    uart: UartConfig,
    timeout: Duration,
}

impl SerialConnector {
    /// Connector for the serial device at `path`
    pub fn new<S: AsRef<str>>(path: S, uart: UartConfig, timeout: Duration) -> Self {
        Self {
            path: path.as_ref().to_string(),
            uart,
            timeout,
        }
    }
}

impl BlockingConnector for SerialConnector {
    fn open_blocking(&self) -> Result<Box<dyn BlockingTransport>> {
        Ok(Box::new(RtuTransport::open(&self.path, &self.uart, self.timeout)?))
    }

    fn endpoint(&self) -> String {
        format!("{}@{}", self.path, self.uart.baud_rate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::net::UnixStream;
    use std::thread;

    use bytes::BytesMut;
    use tokio::net::TcpListener;

    use crate::protocol::{encode_exception, ExceptionCode};

    #[test]
    fn test_rtu_transport_over_socket_pair() {
        let (client, mut device) = UnixStream::pair().unwrap();
        client.set_read_timeout(Some(Duration::from_secs(2))).unwrap();

        let device_thread = thread::spawn(move || {
            let mut request = [0u8; 8];
            device.read_exact(&mut request).unwrap();
            let (unit, pdu) = rtu::decode_frame(&request).unwrap();
            assert_eq!(unit, 3);
            assert_eq!(
                Request::decode(pdu),
                Ok(Request::ReadHoldingRegisters { address: 0x1000, count: 1 })
            );
            let reply = Response::ReadHoldingRegisters(vec![5]).to_pdu();
            device.write_all(&rtu::encode_frame(3, &reply)).unwrap();
        });

        let mut transport = RtuTransport::new(client, Duration::ZERO);
        let response = transport
            .call(3, &Request::ReadHoldingRegisters { address: 0x1000, count: 1 })
            .unwrap();
        assert_eq!(response, Response::ReadHoldingRegisters(vec![5]));
        device_thread.join().unwrap();
    }

    #[test]
    fn test_rtu_transport_exception() {
        let (client, mut device) = UnixStream::pair().unwrap();
        client.set_read_timeout(Some(Duration::from_secs(2))).unwrap();

        let device_thread = thread::spawn(move || {
            let mut request = [0u8; 8];
            device.read_exact(&mut request).unwrap();
            let mut pdu = BytesMut::new();
            encode_exception(0x05, ExceptionCode::IllegalDataAddress, &mut pdu);
            device.write_all(&rtu::encode_frame(1, &pdu)).unwrap();
        });

        let mut transport = RtuTransport::new(client, Duration::ZERO);
        let result = transport.call(1, &Request::WriteSingleCoil { address: 40, value: true });
        assert!(matches!(result, Err(DeviceError::Protocol(ExceptionCode::IllegalDataAddress))));
        device_thread.join().unwrap();
    }

    #[test]
    fn test_rtu_transport_times_out() {
        let (client, _device) = UnixStream::pair().unwrap();
        client.set_read_timeout(Some(Duration::from_millis(20))).unwrap();

        let mut transport = RtuTransport::new(client, Duration::ZERO);
        let result = transport.call(1, &Request::ReadCoils { address: 0, count: 8 });
        assert!(matches!(result, Err(DeviceError::Timeout(_))));
    }

    #[tokio::test]
    async fn test_tcp_transport_round_trip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut header = [0u8; MBAP_HEADER_LEN];
            socket.read_exact(&mut header).await.unwrap();
            let header = MbapHeader::decode(&header).unwrap();
            let mut pdu = vec![0u8; header.pdu_len];
            socket.read_exact(&mut pdu).await.unwrap();
            assert_eq!(header.unit_id, 4);

            let reply = Response::ReadHoldingRegisters(vec![10, 20]).to_pdu();
            socket
                .write_all(&mbap::encode_frame(header.transaction_id, 4, &reply))
                .await
                .unwrap();
        });

        let mut transport = TcpTransport::connect(addr.to_string(), Duration::from_secs(1))
            .await
            .unwrap();
        let response = transport
            .call(4, &Request::ReadHoldingRegisters { address: 0, count: 2 })
            .await
            .unwrap();
        assert_eq!(response, Response::ReadHoldingRegisters(vec![10, 20]));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_tcp_connect_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let result = TcpTransport::connect(addr.to_string(), Duration::from_millis(500)).await;
        assert!(matches!(result, Err(DeviceError::Transport(_)) | Err(DeviceError::Timeout(_))));
    }

    #[test]
    fn test_blocking_tcp_transport_round_trip() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let server = thread::spawn(move || {
            let (mut socket, _) = listener.accept().unwrap();
            let mut header = [0u8; MBAP_HEADER_LEN];
            socket.read_exact(&mut header).unwrap();
            let header = MbapHeader::decode(&header).unwrap();
            let mut pdu = vec![0u8; header.pdu_len];
            socket.read_exact(&mut pdu).unwrap();
            let request = Request::decode(&pdu).unwrap();
            let ack = Response::write_ack(&request).unwrap().to_pdu();
            socket
                .write_all(&mbap::encode_frame(header.transaction_id, header.unit_id, &ack))
                .unwrap();
        });

        let connector = TcpConnector::new("127.0.0.1", addr.port(), Duration::from_secs(1));
        let mut transport = connector.open_blocking().unwrap();
        let values = vec![false; 8];
        let response = transport
            .call(1, &Request::WriteMultipleCoils { address: 0, values })
            .unwrap();
        assert_eq!(response, Response::WriteMultipleCoils { address: 0, count: 8 });
        server.join().unwrap();
    }
}
