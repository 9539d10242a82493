/*!
 * RTU framing: `unit id | PDU | CRC-16/MODBUS (low byte first)`.
 */
use bytes::{BufMut, BytesMut};
use crc::{Crc, CRC_16_MODBUS};

use super::{request_pdu_len, response_pdu_len};
use crate::error::{DeviceError, Result};

/// CRC calculator for RTU
const CRC_MODBUS: Crc<u16> = Crc::<u16>::new(&CRC_16_MODBUS);

/// Smallest valid frame: unit id, function code, CRC
pub const MIN_FRAME_LEN: usize = 4;
/// Largest frame on a serial line
pub const MAX_FRAME_LEN: usize = 256;

/// CRC-16/MODBUS of `data`
pub fn crc16(data: &[u8]) -> u16 {
    CRC_MODBUS.checksum(data)
}

/// Wrap a PDU into an RTU frame
pub fn encode_frame(unit_id: u8, pdu: &[u8]) -> BytesMut {
    let mut frame = BytesMut::with_capacity(pdu.len() + 3);
    frame.put_u8(unit_id);
    frame.put_slice(pdu);
    let crc = crc16(&frame);
    frame.put_u16_le(crc);
    frame
}

/// Check the CRC of a complete frame and split it into unit id and PDU
pub fn decode_frame(frame: &[u8]) -> Result<(u8, &[u8])> {
    if frame.len() < MIN_FRAME_LEN {
        return Err(DeviceError::frame(format!("RTU frame too short: {} bytes", frame.len())));
    }
    let data_len = frame.len() - 2;
    let received = u16::from_le_bytes([frame[data_len], frame[data_len + 1]]);
    let calculated = crc16(&frame[..data_len]);
    if received != calculated {
        return Err(DeviceError::frame(format!(
            "CRC mismatch: expected 0x{:04X}, got 0x{:04X}",
            calculated, received
        )));
    }
    Ok((frame[0], &frame[1..data_len]))
}

/// Length of the complete request frame starting at `buf`, once determinable
pub fn request_frame_len(buf: &[u8]) -> Option<usize> {
    buf.get(1..).and_then(request_pdu_len).map(|pdu| pdu + 3)
}

/// Length of the complete response frame starting at `buf`, once determinable
pub fn response_frame_len(buf: &[u8]) -> Option<usize> {
    buf.get(1..).and_then(response_pdu_len).map(|pdu| pdu + 3)
}

/// Render a frame as hex for trace logs
pub fn hex(data: &[u8]) -> String {
    data.iter().map(|b| format!("{:02X}", b)).collect::<Vec<_>>().join(" ")
}
