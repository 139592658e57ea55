//! Raw binary images, no header

use std::convert::TryFrom;
use std::io::{self, Read, Write};

use thiserror::Error;

use crate::blocks::{AddressRange, BlockList};

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid file size, image is empty")]
    Empty,

    #[error("invalid file size, image is larger than {capacity} bytes")]
    TooLarge { capacity: usize },

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Load a whole image into the start of `buffer`.
///
/// The image must be non-empty and fit in `buffer`.
pub fn read<R: Read>(reader: R, buffer: &mut [u8]) -> Result<BlockList, Error> {
    let capacity = buffer.len();

    // One extra byte is enough to tell an oversized image
    let mut data = Vec::with_capacity(capacity + 1);
    reader.take(capacity as u64 + 1).read_to_end(&mut data)?;

    if data.is_empty() {
        return Err(Error::Empty);
    }
    if data.len() > capacity {
        return Err(Error::TooLarge { capacity });
    }

    // Ranges count in u16
    let count = u16::try_from(data.len()).map_err(|_| Error::TooLarge { capacity: u16::MAX as usize })?;
    buffer[..data.len()].copy_from_slice(&data);

    Ok(BlockList::from(AddressRange::new(0, count)))
}

/// Write `data` as is
pub fn write<W: Write>(writer: &mut W, data: &[u8]) -> io::Result<()> {
    writer.write_all(data)
}
