//! Wire codec for beacons and data frames.
//!
//! Layouts (all multi-byte integers little-endian):
//!
//! ```text
//! STRP beacon:  0x47 | parent:u8 | parent_rssi:i8
//! SMRP beacon:  0x47
//! STRP data:    0x45 | dest:u8 | src:u8 | seq:u16 | len:u16 | payload[len]
//! SMRP data:    0x45 | dest:u8 | src:u8 |           len:u16 | payload[len]
//! ```
//!
//! Decoding only borrows from the input frame; the receive path forwards the
//! original byte buffer unchanged, so nothing here ever re-serialises a
//! frame in transit.

use crate::{Addr, MIN_RSSI};

/// Control flag of a data frame.
pub const CTRL_DATA: u8 = 0x45;
/// Control flag of a beacon.
pub const CTRL_BEACON: u8 = 0x47;

/// STRP data-frame header: ctrl, dest, src, seq, len.
pub const STRP_HEADER_LEN: usize = 7;
/// SMRP data-frame header: ctrl, dest, src, len.
pub const SMRP_HEADER_LEN: usize = 5;
/// STRP beacon: ctrl, parent, parent RSSI.
pub const STRP_BEACON_LEN: usize = 3;
/// SMRP beacon: ctrl only.
pub const SMRP_BEACON_LEN: usize = 1;

/// Whether `ctrl` marks a data frame (as opposed to a beacon).
pub fn is_data_frame(ctrl: u8) -> bool {
    ctrl == CTRL_DATA
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("frame too short: need {need} bytes, got {actual}")]
    Short { need: usize, actual: usize },
    #[error("payload length {len} exceeds frame remainder {max}")]
    LengthOutOfBounds { len: usize, max: usize },
    #[error("unexpected control flag {0:#04x}")]
    WrongCtrl(u8),
}

/// Decoded STRP beacon.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StrpBeacon {
    /// Advertised parent; `0x00` while the sender has none.
    pub parent: Addr,
    /// Sender's link quality to that parent.
    pub parent_rssi: i16,
}

/// Encode an STRP beacon. A node without a parent advertises the
/// unassigned sentinel `0x00` and [`MIN_RSSI`].
pub fn encode_strp_beacon(parent: Option<Addr>, parent_rssi: i16) -> [u8; STRP_BEACON_LEN] {
    let rssi = parent.map_or(MIN_RSSI, |_| parent_rssi);
    [
        CTRL_BEACON,
        parent.unwrap_or(0),
        rssi.clamp(i8::MIN as i16, i8::MAX as i16) as i8 as u8,
    ]
}

pub fn parse_strp_beacon(frame: &[u8]) -> Result<StrpBeacon, DecodeError> {
    if frame.len() < STRP_BEACON_LEN {
        return Err(DecodeError::Short {
            need: STRP_BEACON_LEN,
            actual: frame.len(),
        });
    }
    if frame[0] != CTRL_BEACON {
        return Err(DecodeError::WrongCtrl(frame[0]));
    }
    Ok(StrpBeacon {
        parent: frame[1],
        parent_rssi: frame[2] as i8 as i16,
    })
}

/// Encode an SMRP beacon (a bare control flag).
pub fn encode_smrp_beacon() -> [u8; SMRP_BEACON_LEN] {
    [CTRL_BEACON]
}

/// Decoded view of an STRP data frame; the payload borrows from the frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StrpData<'a> {
    pub dest: Addr,
    pub src: Addr,
    pub seq: u16,
    pub payload: &'a [u8],
}

/// Decoded view of an SMRP data frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SmrpData<'a> {
    pub dest: Addr,
    pub src: Addr,
    pub payload: &'a [u8],
}

pub fn encode_data_strp(dest: Addr, src: Addr, seq: u16, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(STRP_HEADER_LEN + payload.len());
    frame.push(CTRL_DATA);
    frame.push(dest);
    frame.push(src);
    frame.extend_from_slice(&seq.to_le_bytes());
    frame.extend_from_slice(&(payload.len() as u16).to_le_bytes());
    frame.extend_from_slice(payload);
    frame
}

pub fn parse_data_strp(frame: &[u8]) -> Result<StrpData<'_>, DecodeError> {
    if frame.len() < STRP_HEADER_LEN {
        return Err(DecodeError::Short {
            need: STRP_HEADER_LEN,
            actual: frame.len(),
        });
    }
    if frame[0] != CTRL_DATA {
        return Err(DecodeError::WrongCtrl(frame[0]));
    }
    let seq = u16::from_le_bytes([frame[3], frame[4]]);
    let len = u16::from_le_bytes([frame[5], frame[6]]) as usize;
    let max = frame.len() - STRP_HEADER_LEN;
    if len > max {
        return Err(DecodeError::LengthOutOfBounds { len, max });
    }
    Ok(StrpData {
        dest: frame[1],
        src: frame[2],
        seq,
        payload: &frame[STRP_HEADER_LEN..STRP_HEADER_LEN + len],
    })
}

pub fn encode_data_smrp(dest: Addr, src: Addr, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(SMRP_HEADER_LEN + payload.len());
    frame.push(CTRL_DATA);
    frame.push(dest);
    frame.push(src);
    frame.extend_from_slice(&(payload.len() as u16).to_le_bytes());
    frame.extend_from_slice(payload);
    frame
}

pub fn parse_data_smrp(frame: &[u8]) -> Result<SmrpData<'_>, DecodeError> {
    if frame.len() < SMRP_HEADER_LEN {
        return Err(DecodeError::Short {
            need: SMRP_HEADER_LEN,
            actual: frame.len(),
        });
    }
    if frame[0] != CTRL_DATA {
        return Err(DecodeError::WrongCtrl(frame[0]));
    }
    let len = u16::from_le_bytes([frame[3], frame[4]]) as usize;
    let max = frame.len() - SMRP_HEADER_LEN;
    if len > max {
        return Err(DecodeError::LengthOutOfBounds { len, max });
    }
    Ok(SmrpData {
        dest: frame[1],
        src: frame[2],
        payload: &frame[SMRP_HEADER_LEN..SMRP_HEADER_LEN + len],
    })
}

/// Hex rendering of a frame for trace logs, header and payload separated by
/// a bar.
pub(crate) fn hex_dump(frame: &[u8], header_len: usize) -> String {
    use core::fmt::Write;

    let mut out = String::with_capacity(frame.len() * 3 + 1);
    for (i, byte) in frame.iter().enumerate() {
        if i == header_len {
            out.push_str("| ");
        }
        let _ = write!(out, "{byte:02X} ");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strp_data_round_trip() {
        let frame = encode_data_strp(0x0D, 0x05, 1, b"hello");
        assert_eq!(frame[0], CTRL_DATA);
        assert_eq!(frame.len(), STRP_HEADER_LEN + 5);
        // seq and len are explicit little-endian
        assert_eq!(&frame[3..5], &[1, 0]);
        assert_eq!(&frame[5..7], &[5, 0]);

        let decoded = parse_data_strp(&frame).unwrap();
        assert_eq!(decoded.dest, 0x0D);
        assert_eq!(decoded.src, 0x05);
        assert_eq!(decoded.seq, 1);
        assert_eq!(decoded.payload, b"hello");
    }

    #[test]
    fn smrp_data_round_trip() {
        let frame = encode_data_smrp(0x0D, 0x09, b"abcd");
        assert_eq!(frame.len(), SMRP_HEADER_LEN + 4);
        let decoded = parse_data_smrp(&frame).unwrap();
        assert_eq!(decoded.dest, 0x0D);
        assert_eq!(decoded.src, 0x09);
        assert_eq!(decoded.payload, b"abcd");
    }

    #[test]
    fn strp_beacon_round_trip() {
        let frame = encode_strp_beacon(Some(0x0D), -71);
        let decoded = parse_strp_beacon(&frame).unwrap();
        assert_eq!(decoded.parent, 0x0D);
        assert_eq!(decoded.parent_rssi, -71);
    }

    #[test]
    fn parentless_beacon_advertises_sentinel() {
        let frame = encode_strp_beacon(None, -40);
        let decoded = parse_strp_beacon(&frame).unwrap();
        assert_eq!(decoded.parent, 0);
        assert_eq!(decoded.parent_rssi, MIN_RSSI);
    }

    #[test]
    fn short_frames_rejected() {
        assert!(matches!(
            parse_data_strp(&[CTRL_DATA, 1, 2]),
            Err(DecodeError::Short { need: 7, actual: 3 })
        ));
        assert!(matches!(
            parse_strp_beacon(&[CTRL_BEACON]),
            Err(DecodeError::Short { .. })
        ));
    }

    #[test]
    fn oversized_length_rejected() {
        // len claims 200 bytes but only 5 follow the header
        let mut frame = encode_data_strp(0x0D, 0x05, 7, b"hello");
        frame[5..7].copy_from_slice(&200u16.to_le_bytes());
        assert!(matches!(
            parse_data_strp(&frame),
            Err(DecodeError::LengthOutOfBounds { len: 200, max: 5 })
        ));
    }

    #[test]
    fn wrong_ctrl_rejected() {
        let frame = encode_data_strp(0x0D, 0x05, 1, b"x");
        assert!(matches!(
            parse_strp_beacon(&frame),
            Err(DecodeError::WrongCtrl(CTRL_DATA))
        ));
        assert!(is_data_frame(frame[0]));
        assert!(!is_data_frame(CTRL_BEACON));
    }
}
