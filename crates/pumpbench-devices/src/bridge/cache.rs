/*!
 * Last known values seen through a bridge.
 */
use std::collections::HashMap;

use crate::protocol::{Request, Response};

/// Register tables filled from live traffic
#[derive(Debug, Default)]
pub struct RegisterCache {
    coils: HashMap<u16, bool>,
    discrete: HashMap<u16, bool>,
    holding: HashMap<u16, u16>,
    input: HashMap<u16, u16>,
}

fn store<T: Copy>(table: &mut HashMap<u16, T>, address: u16, values: &[T]) {
    for (offset, value) in values.iter().enumerate() {
        table.insert(address.wrapping_add(offset as u16), *value);
    }
}

fn lookup<T: Copy>(table: &HashMap<u16, T>, address: u16, count: u16) -> Option<Vec<T>> {
    (0..count)
        .map(|i| table.get(&address.wrapping_add(i)).copied())
        .collect()
}

impl RegisterCache {
    /// An empty cache
    pub fn new() -> Self {
        Self::default()
    }

    /// Remember the outcome of a successful request
    pub fn update(&mut self, request: &Request, response: &Response) {
        match (request, response) {
            (Request::ReadCoils { address, .. }, Response::ReadCoils(bits)) => {
                store(&mut self.coils, *address, bits)
            }
            (Request::ReadDiscreteInputs { address, .. }, Response::ReadDiscreteInputs(bits)) => {
                store(&mut self.discrete, *address, bits)
            }
            (Request::ReadHoldingRegisters { address, .. }, Response::ReadHoldingRegisters(words)) => {
                store(&mut self.holding, *address, words)
            }
            (Request::ReadInputRegisters { address, .. }, Response::ReadInputRegisters(words)) => {
                store(&mut self.input, *address, words)
            }
            (Request::WriteSingleCoil { address, value }, _) => store(&mut self.coils, *address, &[*value]),
            (Request::WriteSingleRegister { address, value }, _) => {
                store(&mut self.holding, *address, &[*value])
            }
            (Request::WriteMultipleCoils { address, values }, _) => store(&mut self.coils, *address, values),
            (Request::WriteMultipleRegisters { address, values }, _) => {
                store(&mut self.holding, *address, values)
            }
            _ => {}
        }
    }

    /// Answer a read from the cache, if every requested address is known
    pub fn answer(&self, request: &Request) -> Option<Response> {
        match request {
            Request::ReadCoils { address, count } => {
                lookup(&self.coils, *address, *count).map(Response::ReadCoils)
            }
            Request::ReadDiscreteInputs { address, count } => {
                lookup(&self.discrete, *address, *count).map(Response::ReadDiscreteInputs)
            }
            Request::ReadHoldingRegisters { address, count } => {
                lookup(&self.holding, *address, *count).map(Response::ReadHoldingRegisters)
            }
            Request::ReadInputRegisters { address, count } => {
                lookup(&self.input, *address, *count).map(Response::ReadInputRegisters)
            }
            _ => None,
        }
    }

    /// Whether nothing has been cached yet
    pub fn is_empty(&self) -> bool {
        self.coils.is_empty() && self.discrete.is_empty() && self.holding.is_empty() && self.input.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_then_answer() {
        let mut cache = RegisterCache::new();
        let request = Request::ReadHoldingRegisters { address: 10, count: 2 };
        cache.update(&request, &Response::ReadHoldingRegisters(vec![10, 20]));

        assert_eq!(cache.answer(&request), Some(Response::ReadHoldingRegisters(vec![10, 20])));
        assert_eq!(
            cache.answer(&Request::ReadHoldingRegisters { address: 11, count: 1 }),
            Some(Response::ReadHoldingRegisters(vec![20]))
        );
        // partially known ranges are not answered
        assert_eq!(cache.answer(&Request::ReadHoldingRegisters { address: 10, count: 3 }), None);
        assert_eq!(cache.answer(&Request::ReadInputRegisters { address: 10, count: 1 }), None);
    }

    #[test]
    fn test_writes_update_the_tables() {
        let mut cache = RegisterCache::new();
        let write = Request::WriteMultipleCoils { address: 0, values: vec![true, false] };
        let ack = Response::write_ack(&write).unwrap();
        cache.update(&write, &ack);

        assert_eq!(
            cache.answer(&Request::ReadCoils { address: 0, count: 2 }),
            Some(Response::ReadCoils(vec![true, false]))
        );
        assert!(!cache.is_empty());
    }
}
