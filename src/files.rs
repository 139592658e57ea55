//! Image file formats

use std::fmt;
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use thiserror::Error;

use crate::blocks::BlockList;
use crate::{binfile, ihex};

#[derive(Debug, Error)]
pub enum Error {
    #[error("error opening file '{}': {source}", .path.display())]
    Open { path: PathBuf, source: std::io::Error },

    #[error("error writing file '{}': {source}", .path.display())]
    Write { path: PathBuf, source: std::io::Error },

    #[error("error loading binary file '{}': {source}", .path.display())]
    Bin { path: PathBuf, source: binfile::Error },

    #[error("error loading hex file '{}': {source}", .path.display())]
    Hex { path: PathBuf, source: ihex::Error },

    #[error("invalid format '{0}', expected bin or ihex")]
    InvalidFormat(String),
}

/// Supported file formats
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum Format {
    /// Raw binary
    Bin,
    /// Intel HEX
    IHex,
}

impl Default for Format {
    fn default() -> Self {
        Format::Bin
    }
}

impl FromStr for Format {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "bin" => Ok(Format::Bin),
            "ihex" => Ok(Format::IHex),
            _ => Err(Error::InvalidFormat(s.to_string())),
        }
    }
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Format::Bin => write!(f, "bin"),
            Format::IHex => write!(f, "ihex"),
        }
    }
}

impl Format {
    /// Load `path` into `buffer`, returning the ranges that were filled
    pub fn read<P: AsRef<Path>>(self, path: P, buffer: &mut [u8]) -> Result<BlockList, Error> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|source| Error::Open { path: path.into(), source })?;

        debug!("Loading {} file '{}'", self, path.display());

        match self {
            Format::Bin => binfile::read(file, buffer).map_err(|source| Error::Bin { path: path.into(), source }),
            Format::IHex => {
                ihex::read(BufReader::new(file), buffer).map_err(|source| Error::Hex { path: path.into(), source })
            }
        }
    }

    /// Save `data`, which starts at `base_addr` in the chip, to `path`
    pub fn write<P: AsRef<Path>>(self, path: P, data: &[u8], base_addr: u64) -> Result<(), Error> {
        let path = path.as_ref();
        let file = File::create(path).map_err(|source| Error::Open { path: path.into(), source })?;
        let mut w = BufWriter::new(file);

        debug!("Saving {} bytes at 0x{:03X} as {} to '{}'", data.len(), base_addr, self, path.display());

        let res = match self {
            Format::Bin => binfile::write(&mut w, data),
            Format::IHex => ihex::write(&mut w, data, base_addr),
        };

        res.and_then(|_| w.flush()).map_err(|source| Error::Write { path: path.into(), source })
    }
}
