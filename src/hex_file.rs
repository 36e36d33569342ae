use crate::board::BoardDescriptor;
use byteorder::{BE, ByteOrder};
use log::{debug, trace};
use std::io::BufRead;
use std::path::Path;
use thiserror::Error;

/// Images are padded to whole USB packets, not to the smaller write block.
pub const IMAGE_ALIGN: u32 = 64;

/// Record types understood by the uploader. Anything else is carried as [RecordType::Other] so
/// that it can be reported with its raw value.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum RecordType {
    Data,
    EndOfFile,
    ExtendedLinearAddress,
    Other(u8),
}

impl From<u8> for RecordType {
    fn from(val: u8) -> Self {
        match val {
            0x00 => RecordType::Data,
            0x01 => RecordType::EndOfFile,
            0x04 => RecordType::ExtendedLinearAddress,
            other => RecordType::Other(other),
        }
    }
}

/// One decoded line of a HEX file.
#[derive(Clone, Debug)]
pub struct HexRecord {
    /// 1-based line number in the source file.
    pub line: usize,
    pub kind: RecordType,
    /// Effective 32-bit address: the last extended linear address in effect, combined with this
    /// record's 16-bit offset.
    pub address: u32,
    pub data: Vec<u8>,
    pub checksum: u8,
}

impl HexRecord {
    /// Decode a `:BBAAAATTDD..CC` line. `upper` is the high 16 bits already shifted into place.
    fn decode(line: usize, text: &str, upper: u32) -> Result<Self, HexFormatError> {
        let malformed = || HexFormatError::MalformedRecord { line };

        let digits = text.strip_prefix(':').ok_or_else(malformed)?;
        let bytes = decode_hex(digits).ok_or_else(malformed)?;

        // Smallest record: count, address (2), type, checksum.
        if bytes.len() < 5 {
            return Err(malformed());
        }

        // The checksum covers every byte, so check it before trusting the count field.
        let (body, checksum) = bytes.split_at(bytes.len() - 1);
        let expected = checksum[0];
        let actual = checksum_of(body);
        if expected != actual {
            return Err(HexFormatError::ChecksumMismatch {
                line,
                expected,
                actual,
            });
        }

        let byte_count = body[0] as usize;
        if body.len() != 4 + byte_count {
            return Err(malformed());
        }

        Ok(Self {
            line,
            kind: body[3].into(),
            address: upper | BE::read_u16(&body[1..3]) as u32,
            data: body[4..].to_vec(),
            checksum: expected,
        })
    }

    pub fn end(&self) -> u32 {
        self.address.saturating_add(self.data.len() as u32)
    }
}

/// Two's complement of the byte sum, as stored in the last field of each record.
pub fn checksum_of(bytes: &[u8]) -> u8 {
    bytes
        .iter()
        .fold(0u8, |acc, &b| acc.wrapping_add(b))
        .wrapping_neg()
}

fn decode_hex(digits: &str) -> Option<Vec<u8>> {
    let nibbles = digits
        .chars()
        .map(|c| c.to_digit(16).map(|d| d as u8))
        .collect::<Option<Vec<u8>>>()?;

    if nibbles.len() % 2 != 0 {
        return None;
    }

    Some(nibbles.chunks(2).map(|p| (p[0] << 4) | p[1]).collect())
}

/// A flat copy of program flash starting at the board's `memstart`. Unwritten bytes hold 0xFF,
/// the value of erased flash.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct MemoryImage {
    memstart: u32,
    data: Vec<u8>,
}

impl MemoryImage {
    /// Wrap raw bytes, padding with 0xFF up to the next [IMAGE_ALIGN] boundary.
    pub fn from_bytes(memstart: u32, mut data: Vec<u8>) -> Self {
        let len = (data.len() as u32).div_ceil(IMAGE_ALIGN) * IMAGE_ALIGN;
        data.resize(len as usize, 0xff);
        Self { memstart, data }
    }

    pub fn memstart(&self) -> u32 {
        self.memstart
    }

    /// One past the last address covered by the image.
    pub fn end_address(&self) -> u32 {
        self.memstart + self.data.len() as u32
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Bytes for the absolute address range `start..end`. Panics if the range is not inside the
    /// image.
    pub fn slice(&self, start: u32, end: u32) -> &[u8] {
        &self.data[(start - self.memstart) as usize..(end - self.memstart) as usize]
    }
}

/// Parse errors for a HEX file. Line numbers are 1-based.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum HexFormatError {
    #[error("line {line}: bad checksum: expected {expected:#04x}, got {actual:#04x}")]
    ChecksumMismatch { line: usize, expected: u8, actual: u8 },

    #[error("line {line}: unsupported record type {record_type:#04x}")]
    UnsupportedRecordType { line: usize, record_type: u8 },

    #[error("line {line}: not a valid Intel HEX record")]
    MalformedRecord { line: usize },
}

/// All errors (parse and I/O) that can happen while reading a HEX file.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error("invalid HEX file")]
    FormatError(#[from] HexFormatError),

    #[error("I/O error")]
    IoError(#[from] std::io::Error),
}

/// Read and parse the HEX file at `path`. See [parse].
pub fn load(path: impl AsRef<Path>, board: &BoardDescriptor) -> Result<MemoryImage, Error> {
    let file = std::fs::File::open(path)?;
    let lines = std::io::BufReader::new(file)
        .lines()
        .collect::<Result<Vec<_>, _>>()?;

    parse(&lines, board).map_err(Into::into)
}

/// Build the image of `[board.memstart, board.memend)` described by the HEX `lines`.
///
/// The first pass validates every line's checksum and sizes the image from the highest in-range
/// data record before the end-of-file record. The second pass overlays data records onto a
/// 0xFF-filled buffer and stops at end-of-file. Data outside the board's range is dropped.
pub fn parse<S: AsRef<str>>(
    lines: &[S],
    board: &BoardDescriptor,
) -> Result<MemoryImage, HexFormatError> {
    let mut records = Vec::with_capacity(lines.len());
    let mut upper = 0u32;
    let mut max_end: Option<u32> = None;
    let mut seen_eof = false;

    for (idx, text) in lines.iter().enumerate() {
        let text = text.as_ref().trim();
        if text.is_empty() {
            continue;
        }

        let record = HexRecord::decode(idx + 1, text, upper)?;
        match record.kind {
            RecordType::ExtendedLinearAddress => {
                if record.data.len() != 2 {
                    return Err(HexFormatError::MalformedRecord { line: record.line });
                }
                upper = (BE::read_u16(&record.data) as u32) << 16;
            }
            RecordType::Data if !seen_eof && board.contains(record.address) => {
                let end = record.end().min(board.memend);
                max_end = Some(max_end.map_or(end, |m| m.max(end)));
            }
            RecordType::EndOfFile => seen_eof = true,
            _ => {}
        }
        records.push(record);
    }

    let used = max_end.map_or(0, |end| end - board.memstart);
    let len = used.div_ceil(IMAGE_ALIGN) * IMAGE_ALIGN;
    let mut data = vec![0xffu8; len as usize];

    let mut dropped = 0;
    for record in &records {
        match record.kind {
            RecordType::Data => {
                if !board.contains(record.address) {
                    dropped += 1;
                    continue;
                }
                let offset = (record.address - board.memstart) as usize;
                let keep = record.data.len().min((board.memend - record.address) as usize);
                data[offset..offset + keep].copy_from_slice(&record.data[..keep]);
                trace!(
                    "line {}: {} bytes at {:#08x}",
                    record.line,
                    keep,
                    record.address
                );
            }
            RecordType::EndOfFile => break,
            RecordType::ExtendedLinearAddress => {}
            RecordType::Other(record_type) => {
                return Err(HexFormatError::UnsupportedRecordType {
                    line: record.line,
                    record_type,
                });
            }
        }
    }

    debug!(
        "Parsed {} records into {} byte image at {:#06x} ({} out-of-range records dropped)",
        records.len(),
        len,
        board.memstart,
        dropped
    );

    Ok(MemoryImage {
        memstart: board.memstart,
        data,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn board() -> BoardDescriptor {
        BoardDescriptor::new("18f2550", 0x2000, 0x8000)
    }

    fn record(kind: u8, address: u16, data: &[u8]) -> String {
        let mut bytes = vec![data.len() as u8, (address >> 8) as u8, address as u8, kind];
        bytes.extend_from_slice(data);
        let checksum = checksum_of(&bytes);
        bytes.push(checksum);
        let digits: String = bytes.iter().map(|b| format!("{b:02X}")).collect();
        format!(":{digits}")
    }

    fn eof() -> String {
        record(0x01, 0, &[])
    }

    fn upper(high: u16) -> String {
        record(0x04, 0, &high.to_be_bytes())
    }

    #[test]
    fn known_checksum() {
        assert_eq!(checksum_of(&[0x03, 0x00, 0x30, 0x00, 0x02, 0x33, 0x7a]), 0x1e);
        assert_eq!(eof(), ":00000001FF");
    }

    #[test]
    fn parses_data_into_padded_image() {
        let lines = [
            record(0x00, 0x2000, &[0x01, 0x02, 0x03, 0x04]),
            record(0x00, 0x2010, &[0xaa, 0xbb]),
            eof(),
        ];
        let image = parse(&lines, &board()).unwrap();

        assert_eq!(image.memstart(), 0x2000);
        assert_eq!(image.len(), 64);
        assert_eq!(image.end_address(), 0x2040);
        assert_eq!(&image.as_bytes()[..4], &[1, 2, 3, 4]);
        assert_eq!(&image.as_bytes()[0x10..0x12], &[0xaa, 0xbb]);
        assert!(image.as_bytes()[4..0x10].iter().all(|&b| b == 0xff));
        assert!(image.as_bytes()[0x12..].iter().all(|&b| b == 0xff));
    }

    #[test]
    fn length_is_packet_aligned_and_covers_data() {
        for end in [1u16, 63, 64, 65, 127, 128, 200] {
            let data = vec![0u8; (end as usize).min(0xff)];
            let lines = [record(0x00, 0x2000, &data), eof()];
            let image = parse(&lines, &board()).unwrap();
            assert_eq!(image.len() % IMAGE_ALIGN as usize, 0);
            assert!(image.len() >= data.len());
        }
    }

    #[test]
    fn corrupted_byte_names_its_line() {
        let good = record(0x00, 0x2000, &[0x10, 0x20, 0x30]);
        for pos in (1..good.len()).step_by(2) {
            let mut bad = good.clone().into_bytes();
            bad[pos] = if bad[pos] == b'F' { b'E' } else { b'F' };
            let bad = String::from_utf8(bad).unwrap();

            let lines = [upper(0), bad, eof()];
            match parse(&lines, &board()) {
                Err(HexFormatError::ChecksumMismatch { line, .. }) => assert_eq!(line, 2),
                other => panic!("corruption at {pos} gave {other:?}"),
            }
        }
    }

    #[test]
    fn checksum_is_checked_after_end_of_file() {
        let mut bad = record(0x00, 0x2000, &[0x10]);
        bad.replace_range(bad.len() - 2.., "00");
        let lines = [eof(), bad];
        assert!(matches!(
            parse(&lines, &board()),
            Err(HexFormatError::ChecksumMismatch { line: 2, .. })
        ));
    }

    #[test]
    fn unsupported_record_type() {
        let lines = [
            record(0x00, 0x2000, &[0x01]),
            record(0x03, 0x0000, &[0, 0, 0, 0]),
            eof(),
        ];
        assert!(matches!(
            parse(&lines, &board()),
            Err(HexFormatError::UnsupportedRecordType {
                line: 2,
                record_type: 0x03
            })
        ));
    }

    #[test]
    fn records_after_end_of_file_are_ignored() {
        let lines = [
            record(0x00, 0x2000, &[0x01]),
            eof(),
            record(0x00, 0x2100, &[0x02]),
            record(0x05, 0x0000, &[0, 0, 0, 0]),
        ];
        let image = parse(&lines, &board()).unwrap();
        assert_eq!(image.len(), 64);
        assert_eq!(image.as_bytes()[0], 0x01);
    }

    #[test]
    fn out_of_range_records_are_dropped() {
        let lines = [
            // Bootloader area and config words are not part of the image.
            record(0x00, 0x0000, &[0xde, 0xad]),
            record(0x00, 0x1ff0, &[0x11; 16]),
            record(0x00, 0x2000, &[0x01]),
            upper(0x0030),
            record(0x00, 0x0000, &[0x0e, 0x0f]),
            eof(),
        ];
        let image = parse(&lines, &board()).unwrap();
        assert_eq!(image.len(), 64);
        assert_eq!(image.as_bytes()[0], 0x01);
        assert!(image.as_bytes()[1..].iter().all(|&b| b == 0xff));
    }

    #[test]
    fn record_straddling_memend_is_truncated() {
        let board = BoardDescriptor::new("18f2550", 0x2000, 0x2048);
        let lines = [record(0x00, 0x2040, &[0x55; 16]), eof()];
        let image = parse(&lines, &board).unwrap();
        assert_eq!(image.len(), 128);
        assert_eq!(&image.as_bytes()[0x40..0x48], &[0x55; 8]);
        assert!(image.as_bytes()[0x48..].iter().all(|&b| b == 0xff));
    }

    #[test]
    fn extended_linear_address_selects_upper_bits() {
        let board = BoardDescriptor::new("18f2550", 0x1_0000, 0x2_0000);
        let lines = [
            record(0x00, 0x0000, &[0x99]),
            upper(0x0001),
            record(0x00, 0x0004, &[0x42]),
            eof(),
        ];
        let image = parse(&lines, &board).unwrap();
        assert_eq!(image.as_bytes()[0], 0xff);
        assert_eq!(image.as_bytes()[4], 0x42);
    }

    #[test]
    fn empty_file_gives_empty_image() {
        let image = parse(&[eof()], &board()).unwrap();
        assert!(image.is_empty());
        assert_eq!(image.end_address(), 0x2000);
    }

    #[test]
    fn blank_lines_and_line_endings_are_tolerated() {
        let lines = [
            format!("{}\r", record(0x00, 0x2000, &[0x01])),
            String::new(),
            eof(),
        ];
        assert_eq!(parse(&lines, &board()).unwrap().as_bytes()[0], 0x01);
    }

    #[test]
    fn malformed_lines() {
        for bad in ["0000000001FF", ":0000000", ":00000001FG", ":000001FF", ":01000000FF"] {
            assert!(
                matches!(
                    parse(&[bad], &board()),
                    Err(HexFormatError::MalformedRecord { line: 1 })
                        | Err(HexFormatError::ChecksumMismatch { line: 1, .. })
                ),
                "{bad} was accepted"
            );
        }
        // Count field disagrees with the payload, checksum consistent.
        let mut bytes = vec![0x02, 0x20, 0x00, 0x00, 0xaa];
        bytes.push(checksum_of(&bytes));
        let line: String = std::iter::once(":".to_string())
            .chain(bytes.iter().map(|b| format!("{b:02X}")))
            .collect();
        assert!(matches!(
            parse(&[line], &board()),
            Err(HexFormatError::MalformedRecord { line: 1 })
        ));
    }

    #[test]
    fn round_trip_through_hex_records() {
        let board = BoardDescriptor::new("18f2550", 0x0c00, 0x8000);
        let original: Vec<u8> = (0..0x1a3u32).map(|i| (i * 7 + 3) as u8).collect();
        let image = MemoryImage::from_bytes(board.memstart, original.clone());

        let mut lines = vec![upper(0)];
        for (n, chunk) in image.as_bytes().chunks(16).enumerate() {
            let address = board.memstart + (n * 16) as u32;
            lines.push(record(0x00, address as u16, chunk));
        }
        lines.push(eof());

        let parsed = parse(&lines, &board).unwrap();
        assert_eq!(parsed, image);
        assert_eq!(&parsed.as_bytes()[..original.len()], &original[..]);
    }

    #[test]
    fn load_reports_missing_file() {
        let err = load("/nonexistent/firmware.hex", &board()).unwrap_err();
        assert!(matches!(err, Error::IoError(_)));
    }
}
