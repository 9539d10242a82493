/*!
 * In-memory devices for tests.
 *
 * A [`MockDevice`] holds four sparse register tables and answers requests the
 * way a real instrument would. [`MockConnector`] opens transports of both
 * flavors onto the same device, so a link under test behaves the same on
 * its async and blocking paths.
 */
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::{DeviceError, Result};
use crate::protocol::{ExceptionCode, Request, Response};
use crate::transport::{BlockingConnector, BlockingTransport, Connector, Transport};

#[derive(Debug, Default)]
struct MockState {
    holding: HashMap<u16, u16>,
    input: HashMap<u16, u16>,
    coils: HashMap<u16, bool>,
    discrete: HashMap<u16, bool>,
    writes: Vec<Request>,
    calls: usize,
    fail_next: usize,
    offline: bool,
    exception: Option<ExceptionCode>,
}

/// An in-memory instrument
#[derive(Debug, Default)]
pub struct MockDevice {
    state: Mutex<MockState>,
}

impl MockDevice {
    /// A device with every register zero
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Set consecutive holding registers starting at `address`
    pub fn set_holding(&self, address: u16, values: &[u16]) {
        let mut state = self.state.lock();
        for (offset, value) in values.iter().enumerate() {
            state.holding.insert(address.wrapping_add(offset as u16), *value);
        }
    }

    /// Set consecutive input registers starting at `address`
    pub fn set_input(&self, address: u16, values: &[u16]) {
        let mut state = self.state.lock();
        for (offset, value) in values.iter().enumerate() {
            state.input.insert(address.wrapping_add(offset as u16), *value);
        }
    }

    /// Set consecutive coils starting at `address`
    pub fn set_coils(&self, address: u16, values: &[bool]) {
        let mut state = self.state.lock();
        for (offset, value) in values.iter().enumerate() {
            state.coils.insert(address.wrapping_add(offset as u16), *value);
        }
    }

    /// Set consecutive discrete inputs starting at `address`
    pub fn set_discrete(&self, address: u16, values: &[bool]) {
        let mut state = self.state.lock();
        for (offset, value) in values.iter().enumerate() {
            state.discrete.insert(address.wrapping_add(offset as u16), *value);
        }
    }

    /// Current holding registers
    pub fn holding(&self, address: u16, count: u16) -> Vec<u16> {
        read_table(&self.state.lock().holding, address, count, 0)
    }

    /// Current coils
    pub fn coils(&self, address: u16, count: u16) -> Vec<bool> {
        read_table(&self.state.lock().coils, address, count, false)
    }

    /// Fail the next `count` requests with a transport error
    pub fn fail_next(&self, count: usize) {
        self.state.lock().fail_next = count;
    }

    /// Fail every request with a transport error while set
    pub fn set_offline(&self, offline: bool) {
        self.state.lock().offline = offline;
    }

    /// Answer every request with `exception` while set
    pub fn respond_with_exception(&self, exception: Option<ExceptionCode>) {
        self.state.lock().exception = exception;
    }

    /// Successful writes, oldest first
    pub fn writes(&self) -> Vec<Request> {
        self.state.lock().writes.clone()
    }

    /// Forget recorded writes
    pub fn clear_writes(&self) {
        self.state.lock().writes.clear();
    }

    /// Requests received, including failed ones
    pub fn call_count(&self) -> usize {
        self.state.lock().calls
    }

    /// Answer a request
    pub fn handle(&self, request: &Request) -> Result<Response> {
        let mut state = self.state.lock();
        state.calls += 1;

        if state.offline {
            return Err(DeviceError::transport("mock device offline"));
        }
        if state.fail_next > 0 {
            state.fail_next -= 1;
            return Err(DeviceError::transport("mock device failure"));
        }
        if let Some(exception) = state.exception {
            return Err(DeviceError::Protocol(exception));
        }
        request.validate().map_err(|_| DeviceError::Protocol(ExceptionCode::IllegalDataValue))?;

        let response = match request {
            Request::ReadCoils { address, count } => {
                Response::ReadCoils(read_table(&state.coils, *address, *count, false))
            }
            Request::ReadDiscreteInputs { address, count } => {
                Response::ReadDiscreteInputs(read_table(&state.discrete, *address, *count, false))
            }
            Request::ReadHoldingRegisters { address, count } => {
                Response::ReadHoldingRegisters(read_table(&state.holding, *address, *count, 0))
            }
            Request::ReadInputRegisters { address, count } => {
                Response::ReadInputRegisters(read_table(&state.input, *address, *count, 0))
            }
            Request::WriteSingleCoil { address, value } => {
                state.coils.insert(*address, *value);
                state.writes.push(request.clone());
                Response::WriteSingleCoil { address: *address, value: *value }
            }
            Request::WriteSingleRegister { address, value } => {
                state.holding.insert(*address, *value);
                state.writes.push(request.clone());
                Response::WriteSingleRegister { address: *address, value: *value }
            }
            Request::WriteMultipleCoils { address, values } => {
                for (offset, value) in values.iter().enumerate() {
                    state.coils.insert(address.wrapping_add(offset as u16), *value);
                }
                state.writes.push(request.clone());
                Response::WriteMultipleCoils { address: *address, count: values.len() as u16 }
            }
            Request::WriteMultipleRegisters { address, values } => {
                for (offset, value) in values.iter().enumerate() {
                    state.holding.insert(address.wrapping_add(offset as u16), *value);
                }
                state.writes.push(request.clone());
                Response::WriteMultipleRegisters { address: *address, count: values.len() as u16 }
            }
        };
        Ok(response)
    }
}

fn read_table<T: Copy>(table: &HashMap<u16, T>, address: u16, count: u16, default: T) -> Vec<T> {
    (0..count)
        .map(|i| table.get(&address.wrapping_add(i)).copied().unwrap_or(default))
        .collect()
}

/// A transport bound to a [`MockDevice`]
#[derive(Debug, Clone)]
pub struct MockTransport {
    device: Arc<MockDevice>,
}

impl MockTransport {
    /// Transport onto `device`
    pub fn new(device: Arc<MockDevice>) -> Self {
        Self { device }
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn call(&mut self, _unit_id: u8, request: &Request) -> Result<Response> {
        self.device.handle(request)
    }

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

impl BlockingTransport for MockTransport {
    fn call(&mut self, _unit_id: u8, request: &Request) -> Result<Response> {
        self.device.handle(request)
    }
}

/// Opens [`MockTransport`]s onto one device
#[derive(Debug)]
pub struct MockConnector {
    device: Arc<MockDevice>,
    refuse: Mutex<bool>,
    opens: AtomicUsize,
}

impl MockConnector {
    /// Connector for `device`
    pub fn new(device: Arc<MockDevice>) -> Arc<Self> {
        Arc::new(Self {
            device,
            refuse: Mutex::new(false),
            opens: AtomicUsize::new(0),
        })
    }

    /// Refuse new connections while set
    pub fn refuse_connections(&self, refuse: bool) {
        *self.refuse.lock() = refuse;
    }

    /// Transports opened so far
    pub fn open_count(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    fn open_mock(&self) -> Result<MockTransport> {
        if *self.refuse.lock() {
            return Err(DeviceError::transport("mock connection refused"));
        }
        self.opens.fetch_add(1, Ordering::SeqCst);
        Ok(MockTransport::new(self.device.clone()))
    }
}

impl BlockingConnector for MockConnector {
    fn open_blocking(&self) -> Result<Box<dyn BlockingTransport>> {
        Ok(Box::new(self.open_mock()?))
    }

    fn endpoint(&self) -> String {
        "mock".to_string()
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn open(&self) -> Result<Box<dyn Transport>> {
        Ok(Box::new(self.open_mock()?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mock_device_tables() {
        let device = MockDevice::new();
        device.set_holding(0x1000, &[42]);
        let response = device
            .handle(&Request::ReadHoldingRegisters { address: 0x0FFF, count: 2 })
            .unwrap();
        assert_eq!(response, Response::ReadHoldingRegisters(vec![0, 42]));

        device
            .handle(&Request::WriteMultipleCoils { address: 2, values: vec![true, true] })
            .unwrap();
        assert_eq!(device.coils(0, 4), vec![false, false, true, true]);
        assert_eq!(device.writes().len(), 1);
        assert_eq!(device.call_count(), 2);
    }

    #[test]
    fn test_top_of_address_space() {
        let device = MockDevice::new();
        device
            .handle(&Request::WriteMultipleRegisters { address: 0xFFFE, values: vec![7, 8] })
            .unwrap();
        assert_eq!(
            device.handle(&Request::ReadHoldingRegisters { address: 0xFFFE, count: 2 }).unwrap(),
            Response::ReadHoldingRegisters(vec![7, 8])
        );
        assert_eq!(device.holding(0xFFFF, 2), vec![8, 0]);

        device.set_coils(0xFFFF, &[true]);
        assert_eq!(
            device.handle(&Request::ReadCoils { address: 0xFFFF, count: 1 }).unwrap(),
            Response::ReadCoils(vec![true])
        );
    }

    #[test]
    fn test_mock_failure_injection() {
        let device = MockDevice::new();
        device.fail_next(1);
        let request = Request::ReadCoils { address: 0, count: 1 };
        assert!(matches!(device.handle(&request), Err(DeviceError::Transport(_))));
        assert!(device.handle(&request).is_ok());

        device.respond_with_exception(Some(ExceptionCode::ServerDeviceBusy));
        assert!(matches!(
            device.handle(&request),
            Err(DeviceError::Protocol(ExceptionCode::ServerDeviceBusy))
        ));
    }
}
