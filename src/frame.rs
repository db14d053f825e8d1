//! Frame level codec: checksum, length field and the ASCII-hex armor.
//!
//! A frame on the wire looks like
//!
//! ```text
//! '~' VER ADR CID1 CID2 LEN INFO CHK '\r'
//! ```
//!
//! where every field is rendered as uppercase hex text. `LEN` carries the
//! number of ASCII characters in `INFO` plus a check nibble and `CHK` covers
//! everything between `~` and the checksum itself.

use crate::{Error, Result};

pub const START_OF_FRAME: u8 = b'~';
pub const END_OF_FRAME: u8 = b'\r';

/// Protocol version byte sent with every command.
pub const VERSION: u8 = 0x20;
/// Command group identifier of every host originated command.
pub const CID1: u8 = 0x46;

/// The largest value the 12 length bits can carry.
pub const MAX_INFO_LENGTH: usize = 0x0FFF;

// ver, adr, cid1, cid2 (2 chars each) + length field (4 chars)
const HEADER_LENGTH: usize = 12;
const CHECKSUM_LENGTH: usize = 4;
const MIN_FRAME_LENGTH: usize = 1 + HEADER_LENGTH + CHECKSUM_LENGTH + 1;

/// Computes the additive complement checksum of `bytes`.
///
/// The bytes are summed without wraparound, the sum is inverted, reduced
/// modulo `0x10000` and incremented by one.
pub fn checksum(bytes: &[u8]) -> u16 {
    let sum: u64 = bytes.iter().map(|b| u64::from(*b)).sum();
    ((!sum % 0x10000) as u16).wrapping_add(1)
}

pub fn validate_checksum(bytes: &[u8], expected: u16) -> bool {
    checksum(bytes) == expected
}

fn length_check_nibble(length: u16) -> u16 {
    let nibble_sum = (length & 0xF) + ((length >> 4) & 0xF) + ((length >> 8) & 0xF);
    (0xF - nibble_sum % 16 + 1) & 0xF
}

/// Encodes a payload length into the 16 bit length descriptor.
///
/// A zero length is sent as an all-zero field without check nibble.
pub fn encode_length(length: usize) -> Result<u16> {
    if length > MAX_INFO_LENGTH {
        log::warn!("Info length {length} exceeds {MAX_INFO_LENGTH}");
        return Err(Error::RangeError);
    }
    let length = length as u16;
    if length == 0 {
        return Ok(0);
    }
    Ok((length_check_nibble(length) << 12) | length)
}

/// Splits a length descriptor into its length bits and whether the check
/// nibble matches them.
pub fn decode_length(field: u16) -> (u16, bool) {
    let length = field & 0x0FFF;
    let check = field >> 12;
    let valid = if length == 0 {
        check == 0
    } else {
        check == length_check_nibble(length)
    };
    (length, valid)
}

/// One decoded protocol message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub version: u8,
    pub address: u8,
    pub cid1: u8,
    pub cid2: u8,
    /// The raw length descriptor, check nibble included.
    pub info_length: u16,
    /// The hex decoded info payload.
    pub info: Vec<u8>,
}

impl Frame {
    /// Builds a frame around a binary info payload, filling in the length field.
    pub fn new(address: u8, cid1: u8, cid2: u8, info: Vec<u8>) -> Result<Self> {
        Ok(Self {
            version: VERSION,
            address,
            cid1,
            cid2,
            info_length: encode_length(info.len() * 2)?,
            info,
        })
    }

    /// Renders the frame with its info payload armored as hex text.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let info = hex::encode_upper(&self.info);
        encode_frame(self.version, self.address, self.cid1, self.cid2, info.as_bytes())
    }
}

fn encode_frame(version: u8, address: u8, cid1: u8, cid2: u8, info: &[u8]) -> Result<Vec<u8>> {
    let length = encode_length(info.len())?;

    let mut body =
        format!("{version:02X}{address:02X}{cid1:02X}{cid2:02X}{length:04X}").into_bytes();
    body.extend_from_slice(info);

    let mut raw = Vec::with_capacity(body.len() + CHECKSUM_LENGTH + 2);
    raw.push(START_OF_FRAME);
    raw.extend_from_slice(&body);
    raw.extend_from_slice(format!("{:04X}", checksum(&body)).as_bytes());
    raw.push(END_OF_FRAME);
    Ok(raw)
}

/// Assembles a command frame.
///
/// `info` is appended verbatim, any binary sub-payload has to be hex text already.
pub fn encode_command(address: u8, cid2: u8, info: &[u8]) -> Result<Vec<u8>> {
    encode_frame(VERSION, address, CID1, cid2, info)
}

fn parse_hex_u16(text: &[u8]) -> Result<u16> {
    let mut value = [0u8; 2];
    hex::decode_to_slice(text, &mut value).map_err(|err| {
        Error::MalformedFrame(format!("invalid checksum text {:?}: {err}", String::from_utf8_lossy(text)))
    })?;
    Ok(u16::from_be_bytes(value))
}

/// Parses and validates one response line.
pub fn decode_response(raw: &[u8]) -> Result<Frame> {
    if raw.len() < MIN_FRAME_LENGTH {
        return Err(Error::MalformedFrame(format!(
            "frame too short - required={} received={}",
            MIN_FRAME_LENGTH,
            raw.len()
        )));
    }
    if raw[0] != START_OF_FRAME {
        return Err(Error::MalformedFrame(format!(
            "missing start byte, got {:02X}",
            raw[0]
        )));
    }
    if raw[raw.len() - 1] != END_OF_FRAME {
        return Err(Error::MalformedFrame(format!(
            "missing end byte, got {:02X}",
            raw[raw.len() - 1]
        )));
    }

    let body = &raw[1..raw.len() - 1 - CHECKSUM_LENGTH];
    let received = parse_hex_u16(&raw[raw.len() - 1 - CHECKSUM_LENGTH..raw.len() - 1])?;
    let calculated = checksum(body);
    if calculated != received {
        log::warn!(
            "Invalid checksum - calculated={calculated:04X} received={received:04X} frame={:?}",
            String::from_utf8_lossy(raw)
        );
        return Err(Error::ChecksumMismatch {
            calculated,
            received,
        });
    }

    let decoded = hex::decode(body).map_err(|err| {
        Error::MalformedFrame(format!("invalid hex body {:?}: {err}", String::from_utf8_lossy(body)))
    })?;
    let (header, info) = decoded.split_at(HEADER_LENGTH / 2);

    let info_length = u16::from_be_bytes([header[4], header[5]]);
    let (length, valid) = decode_length(info_length);
    if !valid {
        log::warn!("Invalid length field {info_length:04X}");
        return Err(Error::InvalidLengthField(info_length));
    }
    // The length counts hex characters, two per decoded byte.
    if usize::from(length) != info.len() * 2 {
        return Err(Error::PayloadLengthMismatch {
            expected: usize::from(length),
            actual: info.len() * 2,
        });
    }

    Ok(Frame {
        version: header[0],
        address: header[1],
        cid1: header[2],
        cid2: header[3],
        info_length,
        info: info.to_vec(),
    })
}
