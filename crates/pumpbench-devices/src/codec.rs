/*!
 * Register codec.
 *
 * Multi-word values are big-endian with the high word first. Scale factors
 * are device constants taken from the instrument register maps.
 */

/// Flow: raw / 10
pub const FLOW_SCALE: f64 = 10.0;
/// Pressure: raw * 0.1 gives MPa
pub const PRESSURE_FACTOR: f64 = 0.1;
/// Voltage: raw / 100
pub const VOLTAGE_SCALE: f64 = 100.0;
/// Current: raw / 1000
pub const CURRENT_SCALE: f64 = 1000.0;
/// Active and reactive power: raw / 100
pub const POWER_SCALE: f64 = 100.0;
/// MPa to kg/cm²
pub const MPA_TO_KGCM2: f64 = 10.1972;

/// Decode one unsigned 16-bit register
#[inline]
pub fn decode_u16(reg: u16) -> u16 {
    reg
}

/// Decode an unsigned 32-bit value from two registers, high word first
#[inline]
pub fn decode_u32(hi: u16, lo: u16) -> u32 {
    (u32::from(hi) << 16) | u32::from(lo)
}

/// Decode a two's-complement 32-bit value from two registers, high word first
#[inline]
pub fn decode_i32(hi: u16, lo: u16) -> i32 {
    decode_u32(hi, lo) as i32
}

/// Encode an unsigned 32-bit value as `[hi, lo]`
#[inline]
pub fn encode_u32(value: u32) -> [u16; 2] {
    [(value >> 16) as u16, value as u16]
}

/// Encode a signed 32-bit value as `[hi, lo]`
#[inline]
pub fn encode_i32(value: i32) -> [u16; 2] {
    encode_u32(value as u32)
}

/// Decode the `i32` at the start of a register slice
///
/// The slice must hold at least two registers.
#[inline]
pub fn i32_at(regs: &[u16]) -> i32 {
    decode_i32(regs[0], regs[1])
}

/// Decode the `u32` at the start of a register slice
///
/// The slice must hold at least two registers.
#[inline]
pub fn u32_at(regs: &[u16]) -> u32 {
    decode_u32(regs[0], regs[1])
}

/// Pack bits LSB-first into bytes, as coils and discrete inputs travel on the wire
pub fn pack_bits(bits: &[bool]) -> Vec<u8> {
    let mut bytes = vec![0u8; (bits.len() + 7) / 8];
    for (i, bit) in bits.iter().enumerate() {
        if *bit {
            bytes[i / 8] |= 1 << (i % 8);
        }
    }
    bytes
}

/// Unpack `count` bits LSB-first from bytes
pub fn unpack_bits(bytes: &[u8], count: usize) -> Vec<bool> {
    (0..count)
        .map(|i| bytes.get(i / 8).map_or(false, |b| b & (1 << (i % 8)) != 0))
        .collect()
}

/// Fold up to eight bits into an integer, bit 0 first
pub fn bits_to_u8(bits: &[bool]) -> u8 {
    bits.iter()
        .take(8)
        .enumerate()
        .fold(0u8, |acc, (i, bit)| if *bit { acc | (1 << i) } else { acc })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_u32_round_trip_edges() {
        for value in [0u32, 1, 0xFFFF, 0x1_0000, 0x8000_0000, u32::MAX] {
            let [hi, lo] = encode_u32(value);
            assert_eq!(decode_u32(hi, lo), value);
        }
    }

    #[test]
    fn test_i32_round_trip_edges() {
        for value in [0i32, 1, -1, i32::MIN, i32::MAX, -123_456, 65_536] {
            let [hi, lo] = encode_i32(value);
            assert_eq!(decode_i32(hi, lo), value);
        }
    }

    #[test]
    fn test_i32_round_trip_sweep() {
        // stride through the whole 32-bit space, hitting both signs
        let mut value: u32 = 0;
        loop {
            let signed = value as i32;
            assert_eq!(i32_at(&encode_i32(signed)), signed);
            assert_eq!(u32_at(&encode_u32(value)), value);
            match value.checked_add(0x0001_0003) {
                Some(next) => value = next,
                None => break,
            }
        }
    }

    #[test]
    fn test_sign_bit() {
        assert_eq!(decode_i32(0xFFFF, 0xFFFF), -1);
        assert_eq!(decode_i32(0x8000, 0x0000), i32::MIN);
        assert_eq!(decode_i32(0x0000, 0x03E8), 1000);
        assert_eq!(decode_u32(0x0000, 0x03E8), 1000);
    }

    #[test]
    fn test_pack_bits() {
        let bits = [true, false, true, true, false, false, false, false, true];
        let packed = pack_bits(&bits);
        assert_eq!(packed, vec![0b0000_1101, 0b0000_0001]);
        assert_eq!(unpack_bits(&packed, bits.len()), bits.to_vec());
        assert_eq!(bits_to_u8(&bits[..8]), 0b0000_1101);
        assert_eq!(bits_to_u8(&[false, true]), 0b10);
    }
}
