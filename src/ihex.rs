//! Intel HEX codec
//!
//! Only data (`00`) records and the literal end-of-file record are supported.
//! Records are loaded into a flat buffer, and every run of contiguous records
//! becomes one [`AddressRange`](crate::blocks::AddressRange) in the returned [`BlockList`].

use std::io::{self, BufRead, Write};

use thiserror::Error;

use crate::blocks::BlockList;
use crate::hextext::{decode_byte, decode_word, HexError};

pub const START_CODE: u8 = b':';

/// The only accepted end-of-file record
pub const EOF_RECORD: &str = ":00000001FF";

/// Payload bytes per emitted data record
pub const BYTES_PER_LINE: usize = 32;

/// ':' + byte count + address + record type + checksum
const RECORD_OVERHEAD: usize = 11;

const DATA_OFFSET: usize = 9;

/// A failure while loading a hex file, with the 1-based line it occurred on
#[derive(Debug, Error)]
#[error("malformed hex file at line {line}: {kind}")]
pub struct Error {
    pub line: usize,
    #[source]
    pub kind: ErrorKind,
}

#[derive(Debug, Error)]
pub enum ErrorKind {
    #[error("missing start code")]
    MissingStartCode,

    #[error("invalid record length")]
    InvalidByteCount(#[source] HexError),

    #[error("line is too short")]
    LineTooShort,

    #[error("invalid record")]
    InvalidRecord,

    #[error("invalid load address")]
    InvalidLoadAddress,

    #[error("invalid or unsupported record type")]
    UnsupportedRecordType,

    #[error("invalid byte")]
    InvalidByte(#[source] HexError),

    #[error("can't get checksum")]
    MissingChecksum(#[source] HexError),

    #[error("bad checksum (expected 0x{expected:02X}, found 0x{found:02X})")]
    BadChecksum { expected: u8, found: u8 },

    #[error("record overlaps previously loaded data")]
    Overlap,

    #[error("unexpected end of hex file")]
    UnexpectedEof,

    #[error("read error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum RecordType {
    Data = 0x00,
    EndOfFile = 0x01,
}

/// One validated line of a hex file
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Record {
    pub record_type: RecordType,
    pub address: u16,
    pub data: Vec<u8>,
    pub checksum: u8,
}

/// Two's complement of the 8-bit sum of `bytes`
pub fn checksum<I: IntoIterator<Item = u8>>(bytes: I) -> u8 {
    let sum = bytes.into_iter().fold(0u8, |acc, b| acc.wrapping_add(b));
    (!sum).wrapping_add(1)
}

impl Record {
    /// Parse and validate a single line, without its line terminator.
    ///
    /// Data records must fit entirely below `capacity`.
    pub fn parse(line: &[u8], capacity: usize) -> Result<Self, ErrorKind> {
        if line.first() != Some(&START_CODE) {
            return Err(ErrorKind::MissingStartCode);
        }

        let byte_count = decode_byte(&line[1..]).map_err(ErrorKind::InvalidByteCount)?;
        let len = byte_count as usize;

        if line.len() < RECORD_OVERHEAD + 2 * len {
            return Err(ErrorKind::LineTooShort);
        }

        if byte_count == 0 {
            if line.starts_with(EOF_RECORD.as_bytes()) {
                return Ok(Self {
                    record_type: RecordType::EndOfFile,
                    address: 0,
                    data: Vec::new(),
                    checksum: 0xFF,
                });
            }
            return Err(ErrorKind::InvalidRecord);
        }

        let address = decode_word(&line[3..]).map_err(|_| ErrorKind::InvalidLoadAddress)?;
        if address as usize >= capacity || address as usize + len > capacity {
            return Err(ErrorKind::InvalidLoadAddress);
        }

        match decode_byte(&line[7..]) {
            Ok(t) if t == RecordType::Data as u8 => (),
            _ => return Err(ErrorKind::UnsupportedRecordType),
        }

        let mut data = Vec::with_capacity(len);
        for i in 0..len {
            let b = decode_byte(&line[DATA_OFFSET + 2 * i..]).map_err(ErrorKind::InvalidByte)?;
            data.push(b);
        }

        let found = decode_byte(&line[DATA_OFFSET + 2 * len..]).map_err(ErrorKind::MissingChecksum)?;

        let header = [byte_count, (address >> 8) as u8, address as u8, RecordType::Data as u8];
        let expected = checksum(header.iter().chain(data.iter()).copied());
        if found != expected {
            return Err(ErrorKind::BadChecksum { expected, found });
        }

        Ok(Self { record_type: RecordType::Data, address, data, checksum: found })
    }
}

/// Incremental loader, fed one line at a time
struct Loader<'a> {
    // Set once the end-of-file record is seen
    complete: bool,
    buffer: &'a mut [u8],
    blocks: BlockList,
    // Address following the last byte written, out of range until the first record
    current_addr: u32,
}

impl<'a> Loader<'a> {
    fn new(buffer: &'a mut [u8]) -> Self {
        Self { complete: false, buffer, blocks: BlockList::new(), current_addr: u32::MAX }
    }

    fn feed(&mut self, line: &[u8]) -> Result<(), ErrorKind> {
        let record = Record::parse(line, self.buffer.len())?;

        if record.record_type == RecordType::EndOfFile {
            self.complete = true;
            return Ok(());
        }

        let count = record.data.len() as u16;
        if self.blocks.overlaps(record.address, count) {
            return Err(ErrorKind::Overlap);
        }

        if record.address as u32 != self.current_addr {
            trace!("New block at 0x{:04X}", record.address);
            self.blocks.append(record.address, 0);
        }

        let start = record.address as usize;
        self.buffer[start..start + record.data.len()].copy_from_slice(&record.data);
        if let Some(block) = self.blocks.last_mut() {
            block.count += count;
        }
        self.current_addr = record.address as u32 + count as u32;

        Ok(())
    }
}

/// Load a hex file into `buffer`, returning the ranges it covered.
///
/// Lines after the end-of-file record are ignored. On any failure no ranges are returned,
/// though bytes from records before the failing line may already be in `buffer`.
pub fn read<R: BufRead>(reader: R, buffer: &mut [u8]) -> Result<BlockList, Error> {
    let mut loader = Loader::new(buffer);
    let mut line_no = 0;

    for line in reader.split(b'\n') {
        line_no += 1;

        let mut line = line.map_err(|e| Error { line: line_no, kind: e.into() })?;
        if line.last() == Some(&b'\r') {
            line.pop();
        }

        loader.feed(&line).map_err(|kind| Error { line: line_no, kind })?;

        if loader.complete {
            break;
        }
    }

    if !loader.complete {
        return Err(Error { line: line_no, kind: ErrorKind::UnexpectedEof });
    }

    debug!("Loaded {} bytes in {} blocks", loader.blocks.total_bytes(), loader.blocks.len());

    Ok(loader.blocks)
}

/// Write `data` as data records starting at `base_addr`, followed by the end-of-file record.
///
/// Only the low 16 bits of the running address are encoded in each record.
pub fn write<W: Write>(writer: &mut W, data: &[u8], base_addr: u64) -> io::Result<()> {
    let mut address = base_addr;

    for chunk in data.chunks(BYTES_PER_LINE) {
        let a = address as u16;
        let header = [chunk.len() as u8, (a >> 8) as u8, a as u8, RecordType::Data as u8];
        let sum = checksum(header.iter().chain(chunk.iter()).copied());

        writeln!(
            writer,
            "{}{}{}{:02X}",
            START_CODE as char,
            ::hex::encode_upper(header),
            ::hex::encode_upper(chunk),
            sum
        )?;

        address = address.wrapping_add(chunk.len() as u64);
    }

    writeln!(writer, "{}", EOF_RECORD)
}
