/*!
 * Field bus protocol data units.
 *
 * Requests and responses are modelled independently of the framing that
 * carries them; [`rtu`] and [`tcp`] add the serial and TCP envelopes. Both the
 * client side (links) and the server side (the bridge) use these types.
 */
use std::fmt;

use bytes::{BufMut, BytesMut};

use crate::codec::{pack_bits, unpack_bits};
use crate::error::{DeviceError, Result};

pub mod rtu;
pub mod tcp;

/// Most coils or discrete inputs one read may request
pub const MAX_READ_BITS: u16 = 2000;
/// Most registers one read may request
pub const MAX_READ_REGISTERS: u16 = 125;
/// Most coils one write may carry
pub const MAX_WRITE_BITS: u16 = 1968;
/// Most registers one write may carry
pub const MAX_WRITE_REGISTERS: u16 = 123;

const COIL_ON: u16 = 0xFF00;
const COIL_OFF: u16 = 0x0000;
const EXCEPTION_FLAG: u8 = 0x80;

/// Supported function codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FunctionCode {
    /// 0x01
    ReadCoils = 0x01,
    /// 0x02
    ReadDiscreteInputs = 0x02,
    /// 0x03
    ReadHoldingRegisters = 0x03,
    /// 0x04
    ReadInputRegisters = 0x04,
    /// 0x05
    WriteSingleCoil = 0x05,
    /// 0x06
    WriteSingleRegister = 0x06,
    /// 0x0F
    WriteMultipleCoils = 0x0F,
    /// 0x10
    WriteMultipleRegisters = 0x10,
}

impl FunctionCode {
    /// Parse a function code byte
    pub fn from_u8(code: u8) -> Option<Self> {
        match code {
            0x01 => Some(FunctionCode::ReadCoils),
            0x02 => Some(FunctionCode::ReadDiscreteInputs),
            0x03 => Some(FunctionCode::ReadHoldingRegisters),
            0x04 => Some(FunctionCode::ReadInputRegisters),
            0x05 => Some(FunctionCode::WriteSingleCoil),
            0x06 => Some(FunctionCode::WriteSingleRegister),
            0x0F => Some(FunctionCode::WriteMultipleCoils),
            0x10 => Some(FunctionCode::WriteMultipleRegisters),
            _ => None,
        }
    }

    /// The function code byte
    pub fn value(self) -> u8 {
        self as u8
    }
}

/// Exception codes carried by exception responses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExceptionCode {
    /// 0x01
    IllegalFunction,
    /// 0x02
    IllegalDataAddress,
    /// 0x03
    IllegalDataValue,
    /// 0x04
    ServerDeviceFailure,
    /// 0x05
    Acknowledge,
    /// 0x06
    ServerDeviceBusy,
    /// 0x0A
    GatewayPathUnavailable,
    /// 0x0B
    GatewayTargetFailedToRespond,
    /// Any other code
    Other(u8),
}

impl ExceptionCode {
    /// Parse an exception code byte
    pub fn from_u8(code: u8) -> Self {
        match code {
            0x01 => ExceptionCode::IllegalFunction,
            0x02 => ExceptionCode::IllegalDataAddress,
            0x03 => ExceptionCode::IllegalDataValue,
            0x04 => ExceptionCode::ServerDeviceFailure,
            0x05 => ExceptionCode::Acknowledge,
            0x06 => ExceptionCode::ServerDeviceBusy,
            0x0A => ExceptionCode::GatewayPathUnavailable,
            0x0B => ExceptionCode::GatewayTargetFailedToRespond,
            other => ExceptionCode::Other(other),
        }
    }

    /// The exception code byte
    pub fn value(self) -> u8 {
        match self {
            ExceptionCode::IllegalFunction => 0x01,
            ExceptionCode::IllegalDataAddress => 0x02,
            ExceptionCode::IllegalDataValue => 0x03,
            ExceptionCode::ServerDeviceFailure => 0x04,
            ExceptionCode::Acknowledge => 0x05,
            ExceptionCode::ServerDeviceBusy => 0x06,
            ExceptionCode::GatewayPathUnavailable => 0x0A,
            ExceptionCode::GatewayTargetFailedToRespond => 0x0B,
            ExceptionCode::Other(code) => code,
        }
    }
}

impl fmt::Display for ExceptionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ExceptionCode::IllegalFunction => "illegal function",
            ExceptionCode::IllegalDataAddress => "illegal data address",
            ExceptionCode::IllegalDataValue => "illegal data value",
            ExceptionCode::ServerDeviceFailure => "server device failure",
            ExceptionCode::Acknowledge => "acknowledge",
            ExceptionCode::ServerDeviceBusy => "server device busy",
            ExceptionCode::GatewayPathUnavailable => "gateway path unavailable",
            ExceptionCode::GatewayTargetFailedToRespond => "gateway target failed to respond",
            ExceptionCode::Other(_) => "unknown exception",
        };
        write!(f, "{} (0x{:02X})", name, self.value())
    }
}

/// A request PDU
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// Read `count` coils starting at `address`
    ReadCoils { address: u16, count: u16 },
    /// Read `count` discrete inputs starting at `address`
    ReadDiscreteInputs { address: u16, count: u16 },
    /// Read `count` holding registers starting at `address`
    ReadHoldingRegisters { address: u16, count: u16 },
    /// Read `count` input registers starting at `address`
    ReadInputRegisters { address: u16, count: u16 },
    /// Write one coil
    WriteSingleCoil { address: u16, value: bool },
    /// Write one holding register
    WriteSingleRegister { address: u16, value: u16 },
    /// Write consecutive coils starting at `address`
    WriteMultipleCoils { address: u16, values: Vec<bool> },
    /// Write consecutive holding registers starting at `address`
    WriteMultipleRegisters { address: u16, values: Vec<u16> },
}

impl Request {
    /// Function code of this request
    pub fn function_code(&self) -> FunctionCode {
        match self {
            Request::ReadCoils { .. } => FunctionCode::ReadCoils,
            Request::ReadDiscreteInputs { .. } => FunctionCode::ReadDiscreteInputs,
            Request::ReadHoldingRegisters { .. } => FunctionCode::ReadHoldingRegisters,
            Request::ReadInputRegisters { .. } => FunctionCode::ReadInputRegisters,
            Request::WriteSingleCoil { .. } => FunctionCode::WriteSingleCoil,
            Request::WriteSingleRegister { .. } => FunctionCode::WriteSingleRegister,
            Request::WriteMultipleCoils { .. } => FunctionCode::WriteMultipleCoils,
            Request::WriteMultipleRegisters { .. } => FunctionCode::WriteMultipleRegisters,
        }
    }

    /// Whether the request only reads
    pub fn is_read(&self) -> bool {
        matches!(
            self,
            Request::ReadCoils { .. }
                | Request::ReadDiscreteInputs { .. }
                | Request::ReadHoldingRegisters { .. }
                | Request::ReadInputRegisters { .. }
        )
    }

    /// Check quantity limits and address overflow before any I/O
    pub fn validate(&self) -> Result<()> {
        let (address, count, max) = match self {
            Request::ReadCoils { address, count } | Request::ReadDiscreteInputs { address, count } => {
                (*address, *count, MAX_READ_BITS)
            }
            Request::ReadHoldingRegisters { address, count }
            | Request::ReadInputRegisters { address, count } => (*address, *count, MAX_READ_REGISTERS),
            Request::WriteSingleCoil { .. } | Request::WriteSingleRegister { .. } => return Ok(()),
            Request::WriteMultipleCoils { address, values } => {
                (*address, quantity(values.len()), MAX_WRITE_BITS)
            }
            Request::WriteMultipleRegisters { address, values } => {
                (*address, quantity(values.len()), MAX_WRITE_REGISTERS)
            }
        };

        if count == 0 || count > max {
            return Err(DeviceError::validation(format!(
                "{:?}: quantity {} outside 1..={}",
                self.function_code(),
                count,
                max
            )));
        }
        if u32::from(address) + u32::from(count) > 0x1_0000 {
            return Err(DeviceError::validation(format!(
                "{:?}: range {}+{} exceeds the address space",
                self.function_code(),
                address,
                count
            )));
        }
        Ok(())
    }

    /// Append the PDU bytes to `buf`
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(self.function_code().value());
        match self {
            Request::ReadCoils { address, count }
            | Request::ReadDiscreteInputs { address, count }
            | Request::ReadHoldingRegisters { address, count }
            | Request::ReadInputRegisters { address, count } => {
                buf.put_u16(*address);
                buf.put_u16(*count);
            }
            Request::WriteSingleCoil { address, value } => {
                buf.put_u16(*address);
                buf.put_u16(if *value { COIL_ON } else { COIL_OFF });
            }
            Request::WriteSingleRegister { address, value } => {
                buf.put_u16(*address);
                buf.put_u16(*value);
            }
            Request::WriteMultipleCoils { address, values } => {
                let packed = pack_bits(values);
                buf.put_u16(*address);
                buf.put_u16(quantity(values.len()));
                buf.put_u8(packed.len() as u8);
                buf.put_slice(&packed);
            }
            Request::WriteMultipleRegisters { address, values } => {
                buf.put_u16(*address);
                buf.put_u16(quantity(values.len()));
                buf.put_u8((values.len() * 2) as u8);
                for value in values {
                    buf.put_u16(*value);
                }
            }
        }
    }

    /// Encode into a fresh buffer
    pub fn to_pdu(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(6 + 2 * MAX_WRITE_REGISTERS as usize);
        self.encode(&mut buf);
        buf
    }

    /// Parse a request PDU, as a server does
    ///
    /// The error is the exception the server should answer with.
    pub fn decode(pdu: &[u8]) -> std::result::Result<Request, ExceptionCode> {
        let code = *pdu.first().ok_or(ExceptionCode::IllegalDataValue)?;
        let function = FunctionCode::from_u8(code).ok_or(ExceptionCode::IllegalFunction)?;
        if pdu.len() < 5 {
            return Err(ExceptionCode::IllegalDataValue);
        }
        let address = be_u16(pdu, 1);
        let word = be_u16(pdu, 3);

        let request = match function {
            FunctionCode::ReadCoils => Request::ReadCoils { address, count: word },
            FunctionCode::ReadDiscreteInputs => Request::ReadDiscreteInputs { address, count: word },
            FunctionCode::ReadHoldingRegisters => Request::ReadHoldingRegisters { address, count: word },
            FunctionCode::ReadInputRegisters => Request::ReadInputRegisters { address, count: word },
            FunctionCode::WriteSingleCoil => match word {
                COIL_ON => Request::WriteSingleCoil { address, value: true },
                COIL_OFF => Request::WriteSingleCoil { address, value: false },
                _ => return Err(ExceptionCode::IllegalDataValue),
            },
            FunctionCode::WriteSingleRegister => Request::WriteSingleRegister { address, value: word },
            FunctionCode::WriteMultipleCoils => {
                let data = multiple_write_data(pdu, (usize::from(word) + 7) / 8)?;
                Request::WriteMultipleCoils {
                    address,
                    values: unpack_bits(data, usize::from(word)),
                }
            }
            FunctionCode::WriteMultipleRegisters => {
                let data = multiple_write_data(pdu, usize::from(word) * 2)?;
                Request::WriteMultipleRegisters {
                    address,
                    values: data.chunks_exact(2).map(|w| u16::from_be_bytes([w[0], w[1]])).collect(),
                }
            }
        };

        request.validate().map_err(|_| ExceptionCode::IllegalDataValue)?;
        Ok(request)
    }
}

/// A response PDU
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    /// Coil states
    ReadCoils(Vec<bool>),
    /// Discrete input states
    ReadDiscreteInputs(Vec<bool>),
    /// Holding register values
    ReadHoldingRegisters(Vec<u16>),
    /// Input register values
    ReadInputRegisters(Vec<u16>),
    /// Echo of a single coil write
    WriteSingleCoil { address: u16, value: bool },
    /// Echo of a single register write
    WriteSingleRegister { address: u16, value: u16 },
    /// Acknowledgement of a multiple coil write
    WriteMultipleCoils { address: u16, count: u16 },
    /// Acknowledgement of a multiple register write
    WriteMultipleRegisters { address: u16, count: u16 },
}

impl Response {
    /// Function code of this response
    pub fn function_code(&self) -> FunctionCode {
        match self {
            Response::ReadCoils(_) => FunctionCode::ReadCoils,
            Response::ReadDiscreteInputs(_) => FunctionCode::ReadDiscreteInputs,
            Response::ReadHoldingRegisters(_) => FunctionCode::ReadHoldingRegisters,
            Response::ReadInputRegisters(_) => FunctionCode::ReadInputRegisters,
            Response::WriteSingleCoil { .. } => FunctionCode::WriteSingleCoil,
            Response::WriteSingleRegister { .. } => FunctionCode::WriteSingleRegister,
            Response::WriteMultipleCoils { .. } => FunctionCode::WriteMultipleCoils,
            Response::WriteMultipleRegisters { .. } => FunctionCode::WriteMultipleRegisters,
        }
    }

    /// The acknowledgement a server sends for a successful write
    pub fn write_ack(request: &Request) -> Option<Response> {
        match request {
            Request::WriteSingleCoil { address, value } => Some(Response::WriteSingleCoil {
                address: *address,
                value: *value,
            }),
            Request::WriteSingleRegister { address, value } => Some(Response::WriteSingleRegister {
                address: *address,
                value: *value,
            }),
            Request::WriteMultipleCoils { address, values } => Some(Response::WriteMultipleCoils {
                address: *address,
                count: quantity(values.len()),
            }),
            Request::WriteMultipleRegisters { address, values } => Some(Response::WriteMultipleRegisters {
                address: *address,
                count: quantity(values.len()),
            }),
            _ => None,
        }
    }

    /// Append the PDU bytes to `buf`
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(self.function_code().value());
        match self {
            Response::ReadCoils(bits) | Response::ReadDiscreteInputs(bits) => {
                let packed = pack_bits(bits);
                buf.put_u8(packed.len() as u8);
                buf.put_slice(&packed);
            }
            Response::ReadHoldingRegisters(words) | Response::ReadInputRegisters(words) => {
                buf.put_u8((words.len() * 2) as u8);
                for word in words {
                    buf.put_u16(*word);
                }
            }
            Response::WriteSingleCoil { address, value } => {
                buf.put_u16(*address);
                buf.put_u16(if *value { COIL_ON } else { COIL_OFF });
            }
            Response::WriteSingleRegister { address, value } => {
                buf.put_u16(*address);
                buf.put_u16(*value);
            }
            Response::WriteMultipleCoils { address, count }
            | Response::WriteMultipleRegisters { address, count } => {
                buf.put_u16(*address);
                buf.put_u16(*count);
            }
        }
    }

    /// Encode into a fresh buffer
    pub fn to_pdu(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(2 + 2 * MAX_READ_REGISTERS as usize);
        self.encode(&mut buf);
        buf
    }

    /// Parse the response to `request`, as a client does
    ///
    /// Exception responses become [`DeviceError::Protocol`].
    pub fn decode(request: &Request, pdu: &[u8]) -> Result<Response> {
        let code = *pdu.first().ok_or_else(|| DeviceError::frame("Empty response"))?;
        let expected = request.function_code().value();

        if code == expected | EXCEPTION_FLAG {
            let exception = pdu.get(1).ok_or_else(|| DeviceError::frame("Truncated exception response"))?;
            return Err(DeviceError::Protocol(ExceptionCode::from_u8(*exception)));
        }
        if code != expected {
            return Err(DeviceError::frame(format!(
                "Function code mismatch: sent 0x{:02X}, got 0x{:02X}",
                expected, code
            )));
        }

        match request {
            Request::ReadCoils { count, .. } | Request::ReadDiscreteInputs { count, .. } => {
                let data = read_data(pdu, (usize::from(*count) + 7) / 8)?;
                let bits = unpack_bits(data, usize::from(*count));
                Ok(if code == FunctionCode::ReadCoils.value() {
                    Response::ReadCoils(bits)
                } else {
                    Response::ReadDiscreteInputs(bits)
                })
            }
            Request::ReadHoldingRegisters { count, .. } | Request::ReadInputRegisters { count, .. } => {
                let data = read_data(pdu, usize::from(*count) * 2)?;
                let words = data.chunks_exact(2).map(|w| u16::from_be_bytes([w[0], w[1]])).collect();
                Ok(if code == FunctionCode::ReadHoldingRegisters.value() {
                    Response::ReadHoldingRegisters(words)
                } else {
                    Response::ReadInputRegisters(words)
                })
            }
            _ => {
                if pdu.len() < 5 {
                    return Err(DeviceError::frame("Truncated write acknowledgement"));
                }
                let response = match request {
                    Request::WriteSingleCoil { .. } => Response::WriteSingleCoil {
                        address: be_u16(pdu, 1),
                        value: be_u16(pdu, 3) == COIL_ON,
                    },
                    Request::WriteSingleRegister { .. } => Response::WriteSingleRegister {
                        address: be_u16(pdu, 1),
                        value: be_u16(pdu, 3),
                    },
                    Request::WriteMultipleCoils { .. } => Response::WriteMultipleCoils {
                        address: be_u16(pdu, 1),
                        count: be_u16(pdu, 3),
                    },
                    _ => Response::WriteMultipleRegisters {
                        address: be_u16(pdu, 1),
                        count: be_u16(pdu, 3),
                    },
                };
                if Some(&response) != Response::write_ack(request).as_ref() {
                    return Err(DeviceError::frame(format!(
                        "Write acknowledgement does not echo the request: {:?}",
                        response
                    )));
                }
                Ok(response)
            }
        }
    }
}

/// Encode an exception response PDU
pub fn encode_exception(function: u8, exception: ExceptionCode, buf: &mut BytesMut) {
    buf.put_u8(function | EXCEPTION_FLAG);
    buf.put_u8(exception.value());
}

/// Length of a complete request PDU, once enough of its prefix is known
///
/// Unknown function codes are assumed to carry an address and a quantity, so
/// the server can consume the frame and answer with an exception.
pub fn request_pdu_len(prefix: &[u8]) -> Option<usize> {
    let code = *prefix.first()?;
    match FunctionCode::from_u8(code) {
        Some(FunctionCode::WriteMultipleCoils) | Some(FunctionCode::WriteMultipleRegisters) => {
            prefix.get(5).map(|byte_count| 6 + usize::from(*byte_count))
        }
        _ => Some(5),
    }
}

/// Length of a complete response PDU, once enough of its prefix is known
pub fn response_pdu_len(prefix: &[u8]) -> Option<usize> {
    let code = *prefix.first()?;
    if code & EXCEPTION_FLAG != 0 {
        return Some(2);
    }
    match FunctionCode::from_u8(code) {
        Some(FunctionCode::ReadCoils)
        | Some(FunctionCode::ReadDiscreteInputs)
        | Some(FunctionCode::ReadHoldingRegisters)
        | Some(FunctionCode::ReadInputRegisters) => prefix.get(1).map(|n| 2 + usize::from(*n)),
        _ => Some(5),
    }
}

fn quantity(len: usize) -> u16 {
    u16::try_from(len).unwrap_or(u16::MAX)
}

fn be_u16(bytes: &[u8], at: usize) -> u16 {
    u16::from_be_bytes([bytes[at], bytes[at + 1]])
}

fn read_data(pdu: &[u8], expected: usize) -> Result<&[u8]> {
    let byte_count = usize::from(*pdu.get(1).ok_or_else(|| DeviceError::frame("Missing byte count"))?);
    if byte_count != expected || pdu.len() < 2 + byte_count {
        return Err(DeviceError::frame(format!(
            "Byte count {} does not match the {} bytes requested",
            byte_count, expected
        )));
    }
    Ok(&pdu[2..2 + byte_count])
}

fn multiple_write_data(pdu: &[u8], expected: usize) -> std::result::Result<&[u8], ExceptionCode> {
    let byte_count = usize::from(*pdu.get(5).ok_or(ExceptionCode::IllegalDataValue)?);
    if byte_count != expected || pdu.len() < 6 + byte_count {
        return Err(ExceptionCode::IllegalDataValue);
    }
    Ok(&pdu[6..6 + byte_count])
}
