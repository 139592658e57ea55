//! Programmer wire protocol
//!
//! Requests are ASCII lines of space separated hex fields terminated by `\n`,
//! responses are a hex value followed by `\r\n<status>\r\n`.

use std::convert::TryFrom;
use std::fmt;
use std::str::FromStr;

use thiserror::Error;

use crate::hextext::{decode_hex_digits, Width};

/// Version query, sent without a line terminator
pub const VERSION_QUERY: &[u8] = b"V";

/// `V` + three two digit fields + CRLF + status + CRLF
pub const VERSION_RESPONSE_LEN: usize = 12;

/// Status marker for a successful exchange
pub const STATUS_READY: u8 = b'R';

pub const LINE_END: &[u8] = b"\r\n";

/// Size of the largest supported chip
pub const MAX_CHIP_SIZE: usize = 512;

/// Supported PROM types, indexed by chip selector
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum Chip {
    /// 74S471, 256 x 8
    S471 = 0,
    /// 74S472, 512 x 8
    S472 = 1,
}

impl Chip {
    pub fn selector(self) -> u8 {
        self as u8
    }

    /// Number of cells on the chip
    pub fn size(self) -> u16 {
        match self {
            Chip::S471 => 256,
            Chip::S472 => 512,
        }
    }

    pub fn last_address(self) -> u16 {
        self.size() - 1
    }
}

impl Default for Chip {
    fn default() -> Self {
        Chip::S471
    }
}

impl TryFrom<u8> for Chip {
    type Error = InvalidChip;

    fn try_from(selector: u8) -> Result<Self, Self::Error> {
        match selector {
            0 => Ok(Chip::S471),
            1 => Ok(Chip::S472),
            _ => Err(InvalidChip(selector.to_string())),
        }
    }
}

impl FromStr for Chip {
    type Err = InvalidChip;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "0" | "74s471" => Ok(Chip::S471),
            "1" | "74s472" => Ok(Chip::S472),
            _ => Err(InvalidChip(s.to_string())),
        }
    }
}

impl fmt::Display for Chip {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Chip::S471 => write!(f, "74S471"),
            Chip::S472 => write!(f, "74S472"),
        }
    }
}

#[derive(Clone, PartialEq, Debug, Error)]
#[error("invalid chip '{0}', expected 0 (74S471) or 1 (74S472)")]
pub struct InvalidChip(pub String);

/// Per-address programmer commands
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum Command {
    /// Whole chip blank test
    Blank = b'K' as isize,
    /// Read cells
    Read = b'r' as isize,
    /// Burn a cell
    Write = b'w' as isize,
    /// Go through the write cycle without burning
    Simulate = b's' as isize,
    /// Compare a cell with an expected value
    Verify = b'v' as isize,
}

impl Command {
    pub fn code(self) -> char {
        self as u8 as char
    }

    /// Verb used when reporting a failure for this command
    pub fn action(self) -> &'static str {
        match self {
            Command::Blank => "blank testing",
            Command::Read => "reading",
            Command::Write => "writing to",
            Command::Simulate => "writing (simulated) to",
            Command::Verify => "verifying",
        }
    }
}

/// One encoded programmer request
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct Request {
    pub command: Command,
    pub chip: Chip,
    pub address: u16,
    /// Byte value for write/simulate/verify, cell count for read
    pub value: u16,
}

impl Request {
    pub fn blank(chip: Chip) -> Self {
        Self { command: Command::Blank, chip, address: 0, value: 0 }
    }

    pub fn read(chip: Chip, address: u16, count: u16) -> Self {
        Self { command: Command::Read, chip, address, value: count }
    }

    pub fn cell(command: Command, chip: Chip, address: u16, value: u8) -> Self {
        Self { command, chip, address, value: value as u16 }
    }

    pub fn encode(&self) -> String {
        match self.command {
            Command::Blank => format!("{} {:x}\n", self.command.code(), self.chip.selector()),
            _ => format!(
                "{} {:x} {:x} {:x}\n",
                self.command.code(),
                self.chip.selector(),
                self.address,
                self.value
            ),
        }
    }
}

#[derive(Clone, PartialEq, Debug, Error)]
pub enum ResponseError {
    #[error("malformed response: {0}")]
    Malformed(&'static str),

    #[error("programmer not ready (status {0:?})")]
    NotReady(char),
}

/// Decoded reply to a [`Request`]
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct Response {
    pub value: u16,
    pub status: u8,
}

impl Response {
    /// Parse `<hex value>\r\n<status>\r\n`, requiring a ready status
    pub fn parse(buff: &[u8]) -> Result<Self, ResponseError> {
        let split = find(buff, LINE_END).ok_or(ResponseError::Malformed("missing value terminator"))?;
        let (field, trailer) = (&buff[..split], &buff[split + LINE_END.len()..]);

        if field.is_empty() || field.len() > Width::Word.digits() {
            return Err(ResponseError::Malformed("bad value length"));
        }

        // Left pad to a full word so one to four digits decode the same way
        let mut padded = [b'0'; 4];
        padded[4 - field.len()..].copy_from_slice(field);
        let value = decode_hex_digits(&padded, Width::Word)
            .map_err(|_| ResponseError::Malformed("invalid value"))?;

        let status = match trailer {
            [s, b'\r', b'\n'] => *s,
            _ => return Err(ResponseError::Malformed("bad status trailer")),
        };

        if status != STATUS_READY {
            return Err(ResponseError::NotReady(status as char));
        }

        Ok(Self { value, status })
    }
}

/// Whether `buff` holds a full `...\r\n<status>\r\n` frame
pub fn is_complete(buff: &[u8]) -> bool {
    buff.ends_with(LINE_END) && buff.windows(2).filter(|w| *w == LINE_END).count() >= 2
}

fn find(buff: &[u8], needle: &[u8]) -> Option<usize> {
    buff.windows(needle.len()).position(|w| w == needle)
}

/// Programmer firmware version
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct Version {
    pub major: u8,
    pub minor: u8,
    pub patch: u8,
}

impl Version {
    /// Parse the version query reply `Vxxyyzz\r\n<status>\r\n`, fields in decimal
    pub fn parse(buff: &[u8]) -> Result<Self, ResponseError> {
        if buff.len() != VERSION_RESPONSE_LEN {
            return Err(ResponseError::Malformed("bad version length"));
        }
        if buff[0] != b'V' || &buff[7..9] != LINE_END || &buff[10..12] != LINE_END {
            return Err(ResponseError::Malformed("bad version framing"));
        }

        let mut fields = [0u8; 3];
        for (i, f) in fields.iter_mut().enumerate() {
            let digits = &buff[1 + 2 * i..3 + 2 * i];
            if !digits.iter().all(u8::is_ascii_digit) {
                return Err(ResponseError::Malformed("bad version digits"));
            }
            *f = (digits[0] - b'0') * 10 + (digits[1] - b'0');
        }

        if buff[9] != STATUS_READY {
            return Err(ResponseError::NotReady(buff[9] as char));
        }

        Ok(Self { major: fields[0], minor: fields[1], patch: fields[2] })
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "V{:02}.{:02}.{:02}", self.major, self.minor, self.patch)
    }
}
