//! Intel HEX reader.

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum HexError {
    #[error("line {line}: record does not start with ':'")]
    MissingColon { line: usize },
    #[error("line {line}: invalid hex digits")]
    BadDigit { line: usize },
    #[error("line {line}: record length mismatch")]
    Length { line: usize },
    #[error("line {line}: checksum 0x{found:02X}, expected 0x{expected:02X}")]
    Checksum { line: usize, expected: u8, found: u8 },
    #[error("line {line}: unsupported record type {kind:02X}")]
    UnknownRecord { line: usize, kind: u8 },
    #[error("no end-of-file record")]
    MissingEof,
}

/// A contiguous run of bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub address: u32,
    pub data: Vec<u8>,
}

impl Segment {
    pub fn end(&self) -> u32 {
        self.address + self.data.len() as u32
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HexImage {
    pub segments: Vec<Segment>,
    pub start_address: Option<u32>,
}

impl HexImage {
    pub fn parse(text: &str) -> Result<Self, HexError> {
        let mut image = HexImage::default();
        let mut base: u32 = 0;

        for (index, raw) in text.lines().enumerate() {
            let line = index + 1;
            let record = raw.trim();
            if record.is_empty() {
                continue;
            }
            let hex = record.strip_prefix(':').ok_or(HexError::MissingColon { line })?;
            let bytes = decode_hex(hex).ok_or(HexError::BadDigit { line })?;
            if bytes.len() < 5 || bytes.len() != bytes[0] as usize + 5 {
                return Err(HexError::Length { line });
            }

            let (body, checksum) = bytes.split_at(bytes.len() - 1);
            let expected = body.iter().fold(0u8, |acc, b| acc.wrapping_add(*b)).wrapping_neg();
            if expected != checksum[0] {
                return Err(HexError::Checksum {
                    line,
                    expected,
                    found: checksum[0],
                });
            }

            let offset = u32::from(u16::from_be_bytes([body[1], body[2]]));
            let kind = body[3];
            let data = &body[4..];
            match kind {
                0x00 => image.insert(base.wrapping_add(offset), data),
                0x01 => return Ok(image),
                0x02 => base = u32::from(be16(data, line)?) << 4,
                0x03 => {
                    let cs = u32::from(be16(data, line)?);
                    let ip = u32::from(be16(data.get(2..).unwrap_or_default(), line)?);
                    image.start_address = Some((cs << 4) + ip);
                }
                0x04 => base = u32::from(be16(data, line)?) << 16,
                0x05 => {
                    let word: [u8; 4] = data.try_into().map_err(|_| HexError::Length { line })?;
                    image.start_address = Some(u32::from_be_bytes(word));
                }
                _ => return Err(HexError::UnknownRecord { line, kind }),
            }
        }
        Err(HexError::MissingEof)
    }

    fn insert(&mut self, address: u32, data: &[u8]) {
        if let Some(last) = self.segments.last_mut() {
            if last.end() == address {
                last.data.extend_from_slice(data);
                return;
            }
        }
        self.segments.push(Segment {
            address,
            data: data.to_vec(),
        });
    }

    pub fn len(&self) -> usize {
        self.segments.iter().map(|s| s.data.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn be16(data: &[u8], line: usize) -> Result<u16, HexError> {
    match data {
        [hi, lo, ..] => Ok(u16::from_be_bytes([*hi, *lo])),
        _ => Err(HexError::Length { line }),
    }
}

fn decode_hex(text: &str) -> Option<Vec<u8>> {
    if text.len() % 2 != 0 {
        return None;
    }
    (0..text.len())
        .step_by(2)
        .map(|i| text.get(i..i + 2).and_then(|pair| u8::from_str_radix(pair, 16).ok()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_data_and_eof() {
        let text = ":0300300002337A1E\n:00000001FF\n";
        let image = HexImage::parse(text).unwrap();
        assert_eq!(image.segments.len(), 1);
        assert_eq!(image.segments[0].address, 0x30);
        assert_eq!(image.segments[0].data, vec![0x02, 0x33, 0x7A]);
    }

    #[test]
    fn test_extended_linear_address() {
        let text = ":020000040001F9\n:0100000055AA\n:00000001FF\n";
        let image = HexImage::parse(text).unwrap();
        assert_eq!(image.segments[0].address, 0x0001_0000);
    }

    #[test]
    fn test_contiguous_records_merge() {
        let text = ":0100000011EE\n:0100010022DC\n:00000001FF\n";
        let image = HexImage::parse(text).unwrap();
        assert_eq!(image.segments.len(), 1);
        assert_eq!(image.len(), 2);
    }

    #[test]
    fn test_bad_checksum() {
        let err = HexImage::parse(":0300300002337A1F\n:00000001FF\n").unwrap_err();
        assert!(matches!(err, HexError::Checksum { line: 1, .. }));
    }

    #[test]
    fn test_missing_eof() {
        assert_eq!(HexImage::parse(":0100000011EE\n"), Err(HexError::MissingEof));
    }
}
