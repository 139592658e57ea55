//! Hex dump of chip contents

use std::io::{self, Write};

const COLUMNS: usize = 16;
const HALF_COLUMNS: usize = COLUMNS / 2;

/// Print `data` sixteen bytes per row, labelled from `base_addr`, with an ascii column
pub fn hexdump<W: Write>(w: &mut W, data: &[u8], base_addr: u16) -> io::Result<()> {
    for (row, chunk) in data.chunks(COLUMNS).enumerate() {
        write!(w, "{:03X}  ", base_addr as usize + row * COLUMNS)?;

        for (i, b) in chunk.iter().enumerate() {
            if i == HALF_COLUMNS {
                write!(w, " ")?;
            }
            write!(w, "{:02x} ", b)?;
        }

        // Pad short rows so the ascii column lines up
        for i in chunk.len()..COLUMNS {
            if i == HALF_COLUMNS {
                write!(w, " ")?;
            }
            write!(w, "   ")?;
        }

        let ascii: String = chunk
            .iter()
            .map(|b| if b.is_ascii_graphic() || *b == b' ' { *b as char } else { '.' })
            .collect();
        writeln!(w, " |{:<16}|", ascii)?;
    }

    Ok(())
}
