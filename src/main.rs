#[macro_use]
extern crate log;

extern crate structopt;
use structopt::StructOpt;

extern crate simplelog;
use simplelog::{Config, LevelFilter, SimpleLogger};

use std::io::{self, BufRead, Write};
use std::path::PathBuf;

use anyhow::{anyhow, Context};
use indicatif::{ProgressBar, ProgressStyle};

use prom_loader::dump::hexdump;
use prom_loader::linux::{LinuxPort, DEFAULT_BAUD};
use prom_loader::{
    AddressRange, BlankStatus, BlockList, Chip, Format, Image, Options, Programmer, MAX_CHIP_SIZE,
};

#[derive(Clone, Debug, StructOpt)]
pub struct Args {
    /// Serial port to connect to
    #[structopt(long, default_value = "/dev/ttyUSB0")]
    port: String,

    /// Serial port baud rate
    #[structopt(long, default_value = "57600")]
    baud: usize,

    /// Chip to program: 0 == 74S471, 1 == 74S472
    #[structopt(long, short = "c", default_value = "0")]
    chip: Chip,

    #[structopt(flatten)]
    options: Options,

    /// Log level for console output
    #[structopt(long, default_value = "info")]
    log_level: LevelFilter,

    #[structopt(subcommand)]
    operation: Operation,
}

#[derive(Clone, Debug, StructOpt)]
pub enum Operation {
    /// Do a whole chip blank test
    Blank,

    /// Read the chip, or a single cell, and dump it to the screen or a file
    Read {
        /// Read just this cell
        #[structopt(long, short, parse(try_from_str = parse_address))]
        address: Option<u16>,

        /// File to save the contents to
        #[structopt(long, short, conflicts_with = "address")]
        output: Option<PathBuf>,

        /// Output file format, bin or ihex
        #[structopt(long, short, requires = "output")]
        format: Option<Format>,
    },

    /// Program the chip. This burns fuses and cannot be undone
    Write {
        #[structopt(flatten)]
        target: Target,

        /// Do not ask for confirmation
        #[structopt(long)]
        yes: bool,
    },

    /// Go through a write without burning anything
    Simulate(Target),

    /// Compare the chip contents with a byte or file
    Verify(Target),
}

#[derive(Clone, Debug, StructOpt)]
pub struct Target {
    /// Single cell to operate on, with --data
    #[structopt(long, short, parse(try_from_str = parse_address), requires = "data", conflicts_with = "input")]
    address: Option<u16>,

    /// Byte for the cell at --address
    #[structopt(long, short, parse(try_from_str = parse_byte), requires = "address")]
    data: Option<u8>,

    /// File to read the data from
    #[structopt(long, short, required_unless = "address")]
    input: Option<PathBuf>,

    /// Input file format, bin or ihex
    #[structopt(long, short, requires = "input")]
    format: Option<Format>,
}

fn parse_number(s: &str) -> Result<u64, String> {
    let r = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(h) => u64::from_str_radix(h, 16),
        None => s.parse::<u64>(),
    };
    r.map_err(|e| format!("invalid number '{}': {}", s, e))
}

fn parse_address(s: &str) -> Result<u16, String> {
    match parse_number(s)? {
        a if a < MAX_CHIP_SIZE as u64 => Ok(a as u16),
        _ => Err(format!("invalid memory address: {}", s)),
    }
}

fn parse_byte(s: &str) -> Result<u8, String> {
    match parse_number(s)? {
        v if v <= 0xFF => Ok(v as u8),
        _ => Err(format!("invalid data value: {}", s)),
    }
}

fn main() {
    // Parse out arguments
    let o = Args::from_args();

    // Configure logger
    let _ = SimpleLogger::init(o.log_level, Config::default());

    if let Err(e) = run(o) {
        error!("{:#}", e);
        std::process::exit(1);
    }
}

fn run(o: Args) -> anyhow::Result<()> {
    let mut image: Image = [0u8; MAX_CHIP_SIZE];

    // Load and check any input before touching the programmer
    let blocks = match &o.operation {
        Operation::Write { target, .. } | Operation::Simulate(target) | Operation::Verify(target) => {
            Some(load(target, &mut image)?)
        }
        _ => None,
    };

    if let Operation::Write { yes: false, .. } = o.operation {
        if !confirm()? {
            info!("Write cancelled");
            return Ok(());
        }
    }

    info!("Connecting to serial port {}", o.port);
    if o.baud != DEFAULT_BAUD {
        warn!("Programmer firmware expects {} baud", DEFAULT_BAUD);
    }

    let mut p = Programmer::linux(&o.port, o.baud, o.options.clone())
        .with_context(|| format!("error connecting to serial port {}", o.port))?;

    let version = p.init()?;
    info!("Programmer firmware {}, chip {} ({} cells)", version, o.chip, o.chip.size());

    match o.operation {
        Operation::Blank => match p.blank_check(o.chip)? {
            BlankStatus::Blank => println!("Chip is blank."),
            BlankStatus::NotBlank(a) => println!("Chip is not blank. Found non-zero data at address 0x{:x}.", a),
        },
        Operation::Read { address, output, format } => {
            let range = match address {
                Some(a) => AddressRange::new(a, 1),
                None => AddressRange::new(0, o.chip.size()),
            };

            info!("Reading");
            let pb = progress(&mut p, range.count as u64, "Reading");
            p.read(o.chip, range, &mut image)?;
            pb.finish_and_clear();

            let data = &image[range.indices()];
            match output {
                Some(path) => {
                    let format = format.unwrap_or_default();
                    format.write(&path, data, range.start as u64)?;
                    info!("Saved {} to '{}'", bytefmt::format(data.len() as u64), path.display());
                }
                None => hexdump(&mut io::stdout(), data, range.start)?,
            }
        }
        Operation::Write { .. } => {
            let blocks = blocks.ok_or_else(|| anyhow!("nothing to write"))?;

            info!("Writing");
            let pb = progress(&mut p, blocks.total_bytes() as u64, "Writing");
            if let Err(e) = p.write(o.chip, &blocks, &image) {
                pb.abandon();
                warn!("{} cells were burnt before the failure and stay programmed", pb.position());
                return Err(e.into());
            }
            pb.finish_and_clear();
        }
        Operation::Simulate(_) => {
            let blocks = blocks.ok_or_else(|| anyhow!("nothing to simulate"))?;

            info!("Performing a write simulation");
            let pb = progress(&mut p, blocks.total_bytes() as u64, "Simulating");
            p.simulate(o.chip, &blocks, &image)?;
            pb.finish_and_clear();
        }
        Operation::Verify(_) => {
            let blocks = blocks.ok_or_else(|| anyhow!("nothing to verify"))?;

            info!("Verifying");
            let pb = progress(&mut p, blocks.total_bytes() as u64, "Verifying");
            p.verify(o.chip, &blocks, &image)?;
            pb.finish_and_clear();
        }
    }

    info!("Success");

    Ok(())
}

/// Fill `image` from the target's file or single byte
fn load(target: &Target, image: &mut Image) -> anyhow::Result<BlockList> {
    if let Some(path) = &target.input {
        let format = target.format.unwrap_or_default();
        let blocks = format.read(path, &mut image[..])?;
        info!(
            "Loaded {} in {} block(s) from '{}'",
            bytefmt::format(blocks.total_bytes() as u64),
            blocks.len(),
            path.display()
        );
        return Ok(blocks);
    }

    match (target.address, target.data) {
        (Some(address), Some(data)) => {
            image[address as usize] = data;
            Ok(BlockList::from(AddressRange::new(address, 1)))
        }
        _ => Err(anyhow!("either --address with --data, or --input, is required")),
    }
}

/// Ask before burning anything
fn confirm() -> anyhow::Result<bool> {
    print!("Burn the PROM? This cannot be undone [y/N] ");
    io::stdout().flush()?;

    let mut answer = String::new();
    io::stdin().lock().read_line(&mut answer)?;

    Ok(matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes"))
}

fn progress(p: &mut Programmer<LinuxPort>, len: u64, msg: &str) -> ProgressBar {
    let pb = ProgressBar::new(len);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{msg} [{bar:40}] {pos}/{len} ({eta})")
            .progress_chars("=> "),
    );
    pb.set_message(msg);

    let bar = pb.clone();
    p.set_progress(move |_| bar.inc(1));

    pb
}
