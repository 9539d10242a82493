/*!
 * TCP framing: the 7-byte MBAP header followed by the PDU.
 */
use bytes::{BufMut, BytesMut};

use crate::error::{DeviceError, Result};

/// MBAP header size: transaction id, protocol id, length, unit id
pub const MBAP_HEADER_LEN: usize = 7;
/// Largest PDU a TCP frame may carry
pub const MAX_PDU_LEN: usize = 253;

/// Decoded MBAP header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MbapHeader {
    /// Transaction id, echoed by the server
    pub transaction_id: u16,
    /// Unit id
    pub unit_id: u8,
    /// Bytes following the header
    pub pdu_len: usize,
}

impl MbapHeader {
    /// Parse and check a header
    pub fn decode(header: &[u8; MBAP_HEADER_LEN]) -> Result<Self> {
        let protocol_id = u16::from_be_bytes([header[2], header[3]]);
        if protocol_id != 0 {
            return Err(DeviceError::frame(format!("Unexpected protocol id {}", protocol_id)));
        }
        let length = usize::from(u16::from_be_bytes([header[4], header[5]]));
        if length < 2 || length - 1 > MAX_PDU_LEN {
            return Err(DeviceError::frame(format!("Invalid MBAP length {}", length)));
        }
        Ok(Self {
            transaction_id: u16::from_be_bytes([header[0], header[1]]),
            unit_id: header[6],
            pdu_len: length - 1,
        })
    }
}

/// Wrap a PDU into a TCP frame
pub fn encode_frame(transaction_id: u16, unit_id: u8, pdu: &[u8]) -> BytesMut {
    let mut frame = BytesMut::with_capacity(MBAP_HEADER_LEN + pdu.len());
    frame.put_u16(transaction_id);
    frame.put_u16(0);
    frame.put_u16((pdu.len() + 1) as u16);
    frame.put_u8(unit_id);
    frame.put_slice(pdu);
    frame
}

/// Transaction id sequence of one connection, never zero
#[derive(Debug, Default)]
pub struct TransactionIds(u16);

impl TransactionIds {
    /// Next transaction id
    pub fn next_id(&mut self) -> u16 {
        self.0 = self.0.wrapping_add(1);
        if self.0 == 0 {
            self.0 = 1;
        }
        self.0
    }
}
