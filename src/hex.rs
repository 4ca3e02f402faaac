//! Intel HEX decoding.
//!
//! A line has the shape `:LLAAAATT[DD...]CC` where `LL` is the data byte
//! count, `AAAA` the 16-bit load offset, `TT` the record type and `CC` the
//! two's complement of the sum of all preceding bytes.

use std::fmt;
use std::fmt::Write as _;

use thiserror::Error;

/// ':' + count(2) + address(4) + type(2) + checksum(2)
pub const MIN_LINE_LEN: usize = 11;

/// Data bytes per record produced by [`records_from_binary`]
const BINARY_RECORD_LEN: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RecordType {
    Data = 0x00,
    EndOfFile = 0x01,
    ExtendedSegmentAddress = 0x02,
    StartSegmentAddress = 0x03,
    ExtendedLinearAddress = 0x04,
    StartLinearAddress = 0x05,
}

impl RecordType {
    fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            0x00 => RecordType::Data,
            0x01 => RecordType::EndOfFile,
            0x02 => RecordType::ExtendedSegmentAddress,
            0x03 => RecordType::StartSegmentAddress,
            0x04 => RecordType::ExtendedLinearAddress,
            0x05 => RecordType::StartLinearAddress,
            _ => return None,
        })
    }

    /// Payload length the record type mandates, if any
    fn fixed_len(self) -> Option<usize> {
        match self {
            RecordType::Data => None,
            RecordType::EndOfFile => Some(0),
            RecordType::ExtendedSegmentAddress | RecordType::ExtendedLinearAddress => Some(2),
            RecordType::StartSegmentAddress | RecordType::StartLinearAddress => Some(4),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HexError {
    #[error("malformed line: {0}")]
    MalformedLine(&'static str),
    #[error("checksum mismatch: line says 0x{found:02X}, record sums to 0x{expected:02X}")]
    ChecksumMismatch { expected: u8, found: u8 },
}

/// A [`HexError`] tagged with the 1-based line it came from
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("line {line}: {error}")]
pub struct LineError {
    pub line: usize,
    #[source]
    pub error: HexError,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HexRecord {
    pub address: u16,
    pub kind: RecordType,
    pub data: Vec<u8>,
}

impl HexRecord {
    pub fn data(address: u16, data: Vec<u8>) -> Self {
        Self {
            address,
            kind: RecordType::Data,
            data,
        }
    }

    pub fn end_of_file() -> Self {
        Self {
            address: 0,
            kind: RecordType::EndOfFile,
            data: Vec::new(),
        }
    }

    pub fn extended_linear_address(upper: u16) -> Self {
        Self {
            address: 0,
            kind: RecordType::ExtendedLinearAddress,
            data: upper.to_be_bytes().to_vec(),
        }
    }

    /// Upper address half carried by an extended linear address record
    pub fn upper_address(&self) -> Option<u16> {
        match (self.kind, self.data.as_slice()) {
            (RecordType::ExtendedLinearAddress, [hi, lo, ..]) => Some(u16::from_be_bytes([*hi, *lo])),
            _ => None,
        }
    }

    pub fn checksum(&self) -> u8 {
        let [addr_hi, addr_lo] = self.address.to_be_bytes();
        let sum = [self.data.len() as u8, addr_hi, addr_lo, self.kind as u8]
            .iter()
            .chain(self.data.iter())
            .fold(0u8, |sum, byte| sum.wrapping_add(*byte));
        sum.wrapping_neg()
    }

    /// Renders the record as one HEX line, without line terminator.
    pub fn encode(&self) -> String {
        let mut line = String::with_capacity(MIN_LINE_LEN + self.data.len() * 2);
        let _ = write!(
            line,
            ":{:02X}{:04X}{:02X}",
            self.data.len(),
            self.address,
            self.kind as u8
        );
        for byte in &self.data {
            let _ = write!(line, "{:02X}", byte);
        }
        let _ = write!(line, "{:02X}", self.checksum());
        line
    }
}

impl fmt::Display for HexRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

fn hex_digit(c: u8) -> Option<u8> {
    match c {
        b'0'..=b'9' => Some(c - b'0'),
        b'a'..=b'f' => Some(c - b'a' + 10),
        b'A'..=b'F' => Some(c - b'A' + 10),
        _ => None,
    }
}

/// Decodes the byte at pair index `index` of `digits`.
fn byte_at(digits: &[u8], index: usize) -> Result<u8, HexError> {
    let pair = digits
        .get(index * 2..index * 2 + 2)
        .ok_or(HexError::MalformedLine("record is shorter than its byte count"))?;
    match (hex_digit(pair[0]), hex_digit(pair[1])) {
        (Some(hi), Some(lo)) => Ok(hi << 4 | lo),
        _ => Err(HexError::MalformedLine("invalid hex digit")),
    }
}

/// Parses one Intel HEX line into a record, validating its checksum.
pub fn parse_line(line: &str) -> Result<HexRecord, HexError> {
    let line = line.trim();
    if line.len() < MIN_LINE_LEN {
        return Err(HexError::MalformedLine("line is too short"));
    }
    let digits = line
        .as_bytes()
        .strip_prefix(b":")
        .ok_or(HexError::MalformedLine("missing start code"))?;

    let count = byte_at(digits, 0)? as usize;
    let address = u16::from_be_bytes([byte_at(digits, 1)?, byte_at(digits, 2)?]);
    let kind = RecordType::from_u8(byte_at(digits, 3)?)
        .ok_or(HexError::MalformedLine("unknown record type"))?;

    let data = (0..count)
        .map(|i| byte_at(digits, 4 + i))
        .collect::<Result<Vec<u8>, _>>()?;
    let found = byte_at(digits, 4 + count)?;
    if digits.len() != (5 + count) * 2 {
        return Err(HexError::MalformedLine("trailing characters after checksum"));
    }

    if let Some(len) = kind.fixed_len() {
        if len != count {
            return Err(HexError::MalformedLine("wrong payload length for record type"));
        }
    }

    let record = HexRecord {
        address,
        kind,
        data,
    };
    let expected = record.checksum();
    if expected != found {
        return Err(HexError::ChecksumMismatch { expected, found });
    }

    Ok(record)
}

/// Lazily parsed records of a HEX text, in file order.
///
/// Blank lines and lines without a start code are skipped. Iteration does
/// not stop at an EOF record; that is left to the consumer.
pub struct Records<'a> {
    lines: std::str::Lines<'a>,
    line: usize,
}

impl<'a> Iterator for Records<'a> {
    type Item = Result<HexRecord, LineError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let text = self.lines.next()?.trim();
            self.line += 1;
            if text.is_empty() || !text.starts_with(':') {
                continue;
            }
            return Some(parse_line(text).map_err(|error| LineError {
                line: self.line,
                error,
            }));
        }
    }
}

pub fn records(text: &str) -> Records<'_> {
    Records {
        lines: text.lines(),
        line: 0,
    }
}

/// Number of data bytes the text describes, up to its EOF record.
/// Lines that fail to parse are not counted.
pub fn data_len(text: &str) -> usize {
    records(text)
        .filter_map(Result::ok)
        .take_while(|record| record.kind != RecordType::EndOfFile)
        .filter(|record| record.kind == RecordType::Data)
        .map(|record| record.data.len())
        .sum()
}

/// Turns a raw image loaded at `base` into data records, so binary files
/// take the same path through the programmer as HEX files.
pub fn records_from_binary(data: &[u8], base: u32) -> Vec<HexRecord> {
    let mut out = Vec::with_capacity(data.len() / BINARY_RECORD_LEN + 2);
    let mut upper = 0u16;
    let mut pos = 0usize;

    while pos < data.len() {
        let address = base + pos as u32;
        let segment = (address >> 16) as u16;
        if segment != upper {
            out.push(HexRecord::extended_linear_address(segment));
            upper = segment;
        }

        // Records never cross a 64K boundary
        let to_boundary = 0x1_0000 - (address & 0xFFFF) as usize;
        let len = BINARY_RECORD_LEN.min(data.len() - pos).min(to_boundary);
        out.push(HexRecord::data(address as u16, data[pos..pos + len].to_vec()));
        pos += len;
    }

    out.push(HexRecord::end_of_file());
    out
}
