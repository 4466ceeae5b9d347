//! Wire protocol: CRC-8, frame encoding and per-family opcode tables.
//!
//! Both device generations frame commands the same way:
//!
//! ```text
//! ┌─────────┬───────────┬──────┬────────────┬─────────┬────────┬──────┐
//! │ Sync(2) │ Opcode(1) │ 0x00 │ Len u16 LE │ Payload │ CRC(1) │ 0xFF │
//! └─────────┴───────────┴──────┴────────────┴─────────┴────────┴──────┘
//! ```
//!
//! The CRC covers the payload only, never the header or terminator. The two
//! families differ in sync bytes and opcode assignment; the same numeric
//! opcode means different things on each, so the tables are kept separate.

use once_cell::sync::Lazy;
use tracing::debug;

use crate::error::PrinterError;

/// Sync bytes for GB-series firmwares.
pub const SYNC_LEGACY: [u8; 2] = [0x51, 0x78];
/// Sync bytes for the MXW01 firmware.
pub const SYNC_NEXTGEN: [u8; 2] = [0x22, 0x21];

const TERMINATOR: u8 = 0xFF;

/// Smallest decodable frame: 6-byte header, empty payload, CRC, terminator.
pub const MIN_FRAME_LEN: usize = 8;

static CRC8_TABLE: Lazy<[u8; 256]> = Lazy::new(|| {
    let mut table = [0u8; 256];
    for (i, slot) in table.iter_mut().enumerate() {
        let mut crc = i as u8;
        for _ in 0..8 {
            crc = if crc & 0x80 != 0 {
                (crc << 1) ^ 0x07
            } else {
                crc << 1
            };
        }
        *slot = crc;
    }
    table
});

/// Computes the CRC-8 of a byte slice (poly 0x07, init 0, no reflection).
///
/// Empty input returns 0.
pub fn crc8(data: &[u8]) -> u8 {
    let mut crc: u8 = 0;
    for &b in data {
        crc = CRC8_TABLE[(crc ^ b) as usize];
    }
    crc
}

/// The two supported device generations.
///
/// Selected once per session, from the advertised device name, and never
/// changed mid-session. Opcodes must not be mixed across families.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolFamily {
    /// GB01/GB02/GB03 and friends: single write channel, per-line streaming.
    Legacy,
    /// MXW01: separate command and data channels, upfront line count.
    NextGen,
}

impl ProtocolFamily {
    pub fn sync_bytes(self) -> [u8; 2] {
        match self {
            ProtocolFamily::Legacy => SYNC_LEGACY,
            ProtocolFamily::NextGen => SYNC_NEXTGEN,
        }
    }

    /// Picks the family from the advertised BLE name. MXW-prefixed devices
    /// speak the next-gen protocol; everything else advertising the cat
    /// printer service is treated as GB-series.
    pub fn from_device_name(name: &str) -> Self {
        if name.starts_with("MXW") {
            ProtocolFamily::NextGen
        } else {
            ProtocolFamily::Legacy
        }
    }
}

/// GB-series opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LegacyCommand {
    Retract = 0xA0,
    Feed = 0xA1,
    DrawLine = 0xA2,
    GetStatus = 0xA3,
    Lattice = 0xA6,
    SetEnergy = 0xAF,
    SetSpeed = 0xBD,
    ApplyEnergy = 0xBE,
}

/// MXW01 opcodes. Note the numeric overlap with [`LegacyCommand`]: 0xA1 is
/// "feed" on GB firmwares but "get status" here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum NextGenCommand {
    GetStatus = 0xA1,
    SetIntensity = 0xA2,
    Feed = 0xA3,
    Retract = 0xA4,
    PrintRequest = 0xA9,
    PrintComplete = 0xAA,
    GetBattery = 0xAB,
    FlushData = 0xAD,
}

/// Magic payload marking the start of a GB print session.
pub const LATTICE_START: [u8; 11] = [
    0xAA, 0x55, 0x17, 0x38, 0x44, 0x5F, 0x5F, 0x5F, 0x44, 0x38, 0x2C,
];
/// Magic payload marking the end of a GB print session.
pub const LATTICE_FINISH: [u8; 11] = [
    0xAA, 0x55, 0x17, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x17,
];

/// A decoded wire frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub opcode: u8,
    pub payload: Vec<u8>,
    pub checksum: u8,
}

/// Builds a complete wire frame for the given family.
///
/// The payload length must fit the 16-bit length field; anything larger is a
/// caller error, not something to truncate.
pub fn encode(family: ProtocolFamily, opcode: u8, payload: &[u8]) -> Result<Vec<u8>, PrinterError> {
    if payload.len() > u16::MAX as usize {
        return Err(PrinterError::PayloadTooLarge(payload.len()));
    }
    let sync = family.sync_bytes();
    let mut out = Vec::with_capacity(MIN_FRAME_LEN + payload.len());
    out.push(sync[0]);
    out.push(sync[1]);
    out.push(opcode);
    out.push(0x00);
    out.extend_from_slice(&(payload.len() as u16).to_le_bytes());
    out.extend_from_slice(payload);
    out.push(crc8(payload));
    out.push(TERMINATOR);
    Ok(out)
}

/// Parses one raw frame received from the device.
///
/// Partial and noise frames are expected on a live link, so anything that
/// fails to parse is dropped with a debug log rather than reported as an
/// error.
pub fn parse_frame(family: ProtocolFamily, data: &[u8]) -> Option<Frame> {
    if data.len() < MIN_FRAME_LEN {
        debug!(len = data.len(), "dropping short frame");
        return None;
    }
    let sync = family.sync_bytes();
    if data[0] != sync[0] || data[1] != sync[1] {
        debug!(sync = ?&data[..2], "dropping frame with unexpected sync bytes");
        return None;
    }
    let payload_len = u16::from_le_bytes([data[4], data[5]]) as usize;
    if data.len() < 6 + payload_len + 2 {
        debug!(
            len = data.len(),
            payload_len, "dropping frame shorter than its claimed payload"
        );
        return None;
    }
    let payload = data[6..6 + payload_len].to_vec();
    let checksum = data[6 + payload_len];
    if checksum != crc8(&payload) {
        debug!(opcode = data[2], "dropping frame with bad checksum");
        return None;
    }
    Some(Frame {
        opcode: data[2],
        payload,
        checksum,
    })
}

/// A typed status update parsed from a device notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusUpdate {
    Status {
        has_paper: bool,
        battery: Option<u8>,
        temperature: Option<u8>,
    },
    Battery(u8),
    PrintComplete,
}

/// Decodes an asynchronous notification frame into a typed update.
///
/// Unknown opcodes are logged and ignored: newer firmwares emit frames this
/// library does not know about, and that is not a failure.
pub fn decode(family: ProtocolFamily, raw: &[u8]) -> Option<StatusUpdate> {
    let frame = parse_frame(family, raw)?;
    match family {
        ProtocolFamily::Legacy => decode_legacy(&frame),
        ProtocolFamily::NextGen => decode_nextgen(&frame),
    }
}

fn decode_legacy(frame: &Frame) -> Option<StatusUpdate> {
    if frame.opcode == LegacyCommand::GetStatus as u8 {
        let flags = *frame.payload.first()?;
        // bit 0: paper out
        Some(StatusUpdate::Status {
            has_paper: flags & 0x01 == 0,
            battery: None,
            temperature: None,
        })
    } else {
        debug!(opcode = frame.opcode, "ignoring unknown GB notification");
        None
    }
}

fn decode_nextgen(frame: &Frame) -> Option<StatusUpdate> {
    if frame.opcode == NextGenCommand::GetStatus as u8 {
        nextgen_status(&frame.payload)
    } else if frame.opcode == NextGenCommand::GetBattery as u8 {
        Some(StatusUpdate::Battery(*frame.payload.first()?))
    } else if frame.opcode == NextGenCommand::PrintComplete as u8 {
        Some(StatusUpdate::PrintComplete)
    } else {
        debug!(opcode = frame.opcode, "ignoring unknown MXW01 notification");
        None
    }
}

/// MXW01 status payload layout: byte 6 is the state flag, byte 9 the battery
/// percentage, byte 10 the head temperature, byte 12 an overall ok flag and
/// byte 13 the error code when the ok flag is nonzero (0x01 = no paper).
fn nextgen_status(payload: &[u8]) -> Option<StatusUpdate> {
    if payload.len() < 13 {
        debug!(len = payload.len(), "status payload too short");
        return None;
    }
    let no_paper = payload[12] != 0 && payload.get(13) == Some(&0x01);
    Some(StatusUpdate::Status {
        has_paper: !no_paper,
        battery: Some(payload[9]),
        temperature: Some(payload[10]),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn crc8_empty_is_zero() {
        assert_eq!(crc8(&[]), 0);
    }

    #[test]
    fn crc8_matches_standard_check_value() {
        // CRC-8 poly 0x07, init 0: check value for "123456789"
        assert_eq!(crc8(b"123456789"), 0xF4);
    }

    #[test]
    fn crc8_table_spot_values() {
        assert_eq!(crc8(&[0x00]), 0x00);
        assert_eq!(crc8(&[0x01]), 0x07);
        assert_eq!(crc8(&[0x02]), 0x0E);
        assert_eq!(crc8(&[0xFF]), 0xF3);
    }

    #[test]
    fn encode_layout_legacy() {
        let frame = encode(ProtocolFamily::Legacy, 0xA2, &[0xAB, 0xCD]).unwrap();
        assert_eq!(
            frame,
            vec![0x51, 0x78, 0xA2, 0x00, 0x02, 0x00, 0xAB, 0xCD, crc8(&[0xAB, 0xCD]), 0xFF]
        );
    }

    #[test]
    fn encode_layout_nextgen() {
        let frame = encode(ProtocolFamily::NextGen, 0xA1, &[0x00]).unwrap();
        assert_eq!(&frame[..2], &SYNC_NEXTGEN);
        assert_eq!(frame[frame.len() - 1], 0xFF);
        assert_eq!(frame[frame.len() - 2], crc8(&[0x00]));
    }

    #[test]
    fn encode_rejects_oversized_payload() {
        let payload = vec![0u8; 65536];
        assert!(matches!(
            encode(ProtocolFamily::Legacy, 0xA2, &payload),
            Err(PrinterError::PayloadTooLarge(65536))
        ));
    }

    #[test]
    fn roundtrip_both_families() {
        for family in [ProtocolFamily::Legacy, ProtocolFamily::NextGen] {
            let payload: Vec<u8> = (0..48).collect();
            let bytes = encode(family, 0xA9, &payload).unwrap();
            let frame = parse_frame(family, &bytes).unwrap();
            assert_eq!(frame.opcode, 0xA9);
            assert_eq!(frame.payload, payload);
            assert_eq!(frame.checksum, crc8(&payload));
        }
    }

    #[test]
    fn parse_drops_short_frames() {
        assert_eq!(parse_frame(ProtocolFamily::Legacy, &[0x51, 0x78, 0xA3]), None);
        assert_eq!(parse_frame(ProtocolFamily::NextGen, &[]), None);
    }

    #[test]
    fn parse_drops_wrong_sync() {
        let bytes = encode(ProtocolFamily::Legacy, 0xA3, &[0x00]).unwrap();
        assert_eq!(parse_frame(ProtocolFamily::NextGen, &bytes), None);
    }

    #[test]
    fn parse_drops_corrupt_checksum() {
        let mut bytes = encode(ProtocolFamily::Legacy, 0xA3, &[0x00]).unwrap();
        let crc_pos = bytes.len() - 2;
        bytes[crc_pos] ^= 0xFF;
        assert_eq!(parse_frame(ProtocolFamily::Legacy, &bytes), None);
    }

    #[test]
    fn decode_legacy_paper_flag() {
        let bytes = encode(ProtocolFamily::Legacy, LegacyCommand::GetStatus as u8, &[0x01]).unwrap();
        assert_eq!(
            decode(ProtocolFamily::Legacy, &bytes),
            Some(StatusUpdate::Status {
                has_paper: false,
                battery: None,
                temperature: None,
            })
        );
    }

    #[test]
    fn decode_nextgen_status() {
        let mut payload = vec![0u8; 16];
        payload[9] = 80; // battery
        payload[10] = 28; // temperature
        payload[12] = 1; // error flag
        payload[13] = 0x01; // no paper
        let bytes = encode(ProtocolFamily::NextGen, NextGenCommand::GetStatus as u8, &payload).unwrap();
        assert_eq!(
            decode(ProtocolFamily::NextGen, &bytes),
            Some(StatusUpdate::Status {
                has_paper: false,
                battery: Some(80),
                temperature: Some(28),
            })
        );
    }

    #[test]
    fn decode_nextgen_battery() {
        let bytes = encode(ProtocolFamily::NextGen, NextGenCommand::GetBattery as u8, &[77]).unwrap();
        assert_eq!(decode(ProtocolFamily::NextGen, &bytes), Some(StatusUpdate::Battery(77)));
    }

    #[test]
    fn decode_ignores_unknown_opcode() {
        let bytes = encode(ProtocolFamily::NextGen, 0xE0, &[0x00]).unwrap();
        assert_eq!(decode(ProtocolFamily::NextGen, &bytes), None);
    }

    #[test]
    fn family_from_name() {
        assert_eq!(ProtocolFamily::from_device_name("MXW01"), ProtocolFamily::NextGen);
        assert_eq!(ProtocolFamily::from_device_name("GB03"), ProtocolFamily::Legacy);
    }
}
