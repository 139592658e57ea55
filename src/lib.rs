//! Bipolar PROM programmer.
//!
//! Drives the National/TI bipolar PROM programmer over a serial line, one
//! command/response exchange per cell, and converts between the flat memory
//! image and binary or Intel HEX files.
//!
//! Writes burn fuses and cannot be undone. Operations abort at the first
//! failing cell and cells burnt before the failure stay burnt.

use core::fmt::Debug;

#[macro_use]
extern crate log;

#[macro_use(block)]
extern crate nb;

extern crate embedded_hal;

#[cfg(feature = "linux")]
extern crate linux_embedded_hal;

#[cfg(feature = "linux")]
pub mod linux;

pub mod binfile;
pub mod blocks;
pub mod dump;
pub mod files;
pub mod hextext;
pub mod ihex;
pub mod protocol;
pub mod transport;

pub use blocks::{AddressRange, BlockList};
pub use files::Format;
pub use protocol::{Chip, Command, Version, MAX_CHIP_SIZE};
pub use transport::{Port, Transport};

use protocol::{is_complete, Request, Response, ResponseError, VERSION_QUERY, VERSION_RESPONSE_LEN};

/// Upper bound on polls while assembling one response
pub const MAX_RESPONSE_POLLS: usize = 1000;

const RESPONSE_BUFF_LEN: usize = 100;

/// Memory image sized for the largest supported chip
pub type Image = [u8; MAX_CHIP_SIZE];

#[derive(Copy, Clone, PartialEq, Debug)]
pub enum State {
    Init,
    Connected(Version),
}

#[derive(Debug, thiserror::Error)]
pub enum Error<E: Debug> {
    #[error("serial error: {0:?}")]
    Serial(E),

    #[error("programmer not detected")]
    NotDetected,

    #[error("programmer not initialised")]
    NotConnected,

    #[error("no response from programmer")]
    NoResponse,

    #[error("bad programmer response {action} address 0x{address:03X}: {reason}")]
    BadResponse { action: &'static str, address: u16, reason: ResponseError },

    #[error("address 0x{address:X} is larger than last chip cell (0x{last:X})")]
    AddressOutOfRange { address: u16, last: u16 },

    #[error("error {action} prom address 0x{address:03X}: read 0x{read:02x}, expected 0x{expected:02x}")]
    Mismatch { action: &'static str, address: u16, read: u8, expected: u8 },
}

/// Result of a blank test
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum BlankStatus {
    Blank,
    /// First cell holding non-zero data
    NotBlank(u16),
}

#[derive(Clone, PartialEq, Debug)]
#[cfg_attr(feature = "structopt", derive(structopt::StructOpt))]
pub struct Options {
    /// Time to wait for each programmer response attempt
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "2000"))]
    pub response_timeout_ms: u32,

    /// Empty response attempts before giving up on the programmer
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "5"))]
    pub response_attempts: u32,

    /// Period to poll the serial port for data
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "1"))]
    pub poll_delay_ms: u32,

    /// Quiet period that ends a burst of received bytes
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "20"))]
    pub inter_byte_timeout_ms: u32,
}

impl Default for Options {
    fn default() -> Self {
        Self { response_timeout_ms: 2000, response_attempts: 5, poll_delay_ms: 1, inter_byte_timeout_ms: 20 }
    }
}

pub struct Programmer<T> {
    state: State,
    options: Options,
    transport: T,
    progress: Option<Box<dyn FnMut(u16)>>,
}

impl<T> Programmer<T>
where
    T: Transport,
{
    /// Create a new programmer instance
    pub fn new(transport: T, options: Options) -> Self {
        Self { state: State::Init, options, transport, progress: None }
    }

    /// Fetch the programmer state
    pub fn state(&self) -> State {
        self.state
    }

    /// Called with each address once its exchange completes
    pub fn set_progress<F: FnMut(u16) + 'static>(&mut self, f: F) {
        self.progress = Some(Box::new(f));
    }

    /// Release the underlying transport
    pub fn free(self) -> T {
        self.transport
    }

    /// Query the firmware version to make sure a programmer is listening
    pub fn init(&mut self) -> Result<Version, Error<T::Error>> {
        let mut resp = Vec::new();

        // Stale bytes can't be flushed on USB adapters, so keep asking until a reply has the right shape
        for attempt in 0..self.options.response_attempts {
            debug!("Sending version query (attempt {})", attempt + 1);
            self.transport.write(VERSION_QUERY).map_err(Error::Serial)?;

            resp = self.poll_frame()?;
            if resp.len() == VERSION_RESPONSE_LEN {
                break;
            }
            debug!("Discarding {} byte reply: {:02x?}", resp.len(), resp);
        }

        match Version::parse(&resp) {
            Ok(v) => {
                info!("Connected to programmer, firmware {}", v);
                self.state = State::Connected(v);
                Ok(v)
            }
            Err(e) => {
                error!("Programmer not detected: {}", e);
                Err(Error::NotDetected)
            }
        }
    }

    /// Run a whole chip blank test
    pub fn blank_check(&mut self, chip: Chip) -> Result<BlankStatus, Error<T::Error>> {
        self.ensure_connected()?;

        let resp = self.exchange(Request::blank(chip))?;
        if resp.value >= chip.size() {
            Ok(BlankStatus::Blank)
        } else {
            Ok(BlankStatus::NotBlank(resp.value))
        }
    }

    /// Read `range` from the chip into the same addresses of `image`
    pub fn read(&mut self, chip: Chip, range: AddressRange, image: &mut [u8]) -> Result<(), Error<T::Error>> {
        self.ensure_connected()?;

        for address in range.addresses() {
            self.check_bounds(chip, address, image.len())?;

            let resp = self.exchange(Request::read(chip, address, 1))?;
            if resp.value > 0xFF {
                return Err(Error::BadResponse {
                    action: Command::Read.action(),
                    address,
                    reason: ResponseError::Malformed("value wider than a byte"),
                });
            }
            image[address as usize] = resp.value as u8;
            self.report(address);
        }

        Ok(())
    }

    /// Burn every range of `blocks` with the matching bytes of `image`
    pub fn write(&mut self, chip: Chip, blocks: &BlockList, image: &[u8]) -> Result<(), Error<T::Error>> {
        self.execute(Command::Write, chip, blocks, image)
    }

    /// Same as [`Programmer::write`] without burning anything
    pub fn simulate(&mut self, chip: Chip, blocks: &BlockList, image: &[u8]) -> Result<(), Error<T::Error>> {
        self.execute(Command::Simulate, chip, blocks, image)
    }

    /// Compare every range of `blocks` against the chip contents
    pub fn verify(&mut self, chip: Chip, blocks: &BlockList, image: &[u8]) -> Result<(), Error<T::Error>> {
        self.execute(Command::Verify, chip, blocks, image)
    }

    /// Run a per-cell command over `blocks`, stopping at the first failing cell.
    ///
    /// Cells processed before a failure are not rolled back.
    fn execute(
        &mut self,
        command: Command,
        chip: Chip,
        blocks: &BlockList,
        image: &[u8],
    ) -> Result<(), Error<T::Error>> {
        self.ensure_connected()?;

        for range in blocks {
            debug!("{} 0x{:03X}..0x{:03X}", command.action(), range.start, range.end());

            for address in range.addresses() {
                self.check_bounds(chip, address, image.len())?;

                let expected = image[address as usize];
                let resp = self.exchange(Request::cell(command, chip, address, expected))?;

                // The programmer echoes what the cell holds afterwards
                if resp.value != expected as u16 {
                    let err = Error::Mismatch {
                        action: command.action(),
                        address,
                        read: resp.value as u8,
                        expected,
                    };
                    error!("{}", err);
                    return Err(err);
                }
                self.report(address);
            }
        }

        Ok(())
    }

    fn ensure_connected(&self) -> Result<(), Error<T::Error>> {
        match self.state {
            State::Connected(_) => Ok(()),
            State::Init => Err(Error::NotConnected),
        }
    }

    /// Addresses must lie on the chip and inside the caller's image
    fn check_bounds(&self, chip: Chip, address: u16, image_len: usize) -> Result<(), Error<T::Error>> {
        let limit = image_len.min(chip.size() as usize);
        if address as usize >= limit {
            let err = Error::AddressOutOfRange { address, last: limit.saturating_sub(1) as u16 };
            error!("{}", err);
            return Err(err);
        }
        Ok(())
    }

    fn report(&mut self, address: u16) {
        if let Some(f) = self.progress.as_mut() {
            f(address);
        }
    }

    /// Send one request and decode its reply
    fn exchange(&mut self, req: Request) -> Result<Response, Error<T::Error>> {
        let line = req.encode();
        debug!("Sending: {:?}", line);
        self.transport.write(line.as_bytes()).map_err(Error::Serial)?;

        let resp = self.receive()?;
        debug!("Received: {:?}", String::from_utf8_lossy(&resp));

        Response::parse(&resp).map_err(|reason| {
            error!("Bad programmer response: {}", reason);
            Error::BadResponse { action: req.command.action(), address: req.address, reason }
        })
    }

    /// Wait for a reply, retrying empty polls up to the configured attempts
    fn receive(&mut self) -> Result<Vec<u8>, Error<T::Error>> {
        for attempt in 0..self.options.response_attempts {
            let resp = self.poll_frame()?;
            if !resp.is_empty() {
                return Ok(resp);
            }
            warn!("No response from programmer (attempt {})", attempt + 1);
        }

        error!("No response from programmer");
        Err(Error::NoResponse)
    }

    /// One response attempt: empty if nothing arrives in time, otherwise bytes
    /// are collected until the status trailer is complete or the line goes quiet
    fn poll_frame(&mut self) -> Result<Vec<u8>, Error<T::Error>> {
        let mut resp = Vec::new();
        let mut buff = [0u8; RESPONSE_BUFF_LEN];

        for _ in 0..MAX_RESPONSE_POLLS {
            let n = self
                .transport
                .poll_read(&mut buff, self.options.response_timeout_ms)
                .map_err(Error::Serial)?;

            if n == 0 {
                break;
            }

            resp.extend_from_slice(&buff[..n]);
            if is_complete(&resp) {
                break;
            }
        }

        Ok(resp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::collections::VecDeque;
    use std::rc::Rc;

    enum Poll {
        Data(Vec<u8>),
        Timeout,
        Broken,
    }

    /// Replays canned replies, one per `poll_read`
    #[derive(Default)]
    struct Scripted {
        sent: Vec<String>,
        replies: VecDeque<Poll>,
        // Writes fail once this many requests went out
        write_limit: Option<usize>,
    }

    impl Scripted {
        fn reply(mut self, r: &[u8]) -> Self {
            self.replies.push_back(Poll::Data(r.to_vec()));
            self
        }

        fn silence(mut self, polls: usize) -> Self {
            for _ in 0..polls {
                self.replies.push_back(Poll::Timeout);
            }
            self
        }

        fn broken_read(mut self) -> Self {
            self.replies.push_back(Poll::Broken);
            self
        }

        fn write_limit(mut self, n: usize) -> Self {
            self.write_limit = Some(n);
            self
        }
    }

    impl Transport for Scripted {
        type Error = ();

        fn write(&mut self, data: &[u8]) -> Result<(), ()> {
            if self.write_limit.map_or(false, |n| self.sent.len() >= n) {
                return Err(());
            }
            self.sent.push(String::from_utf8_lossy(data).into_owned());
            Ok(())
        }

        fn poll_read(&mut self, buf: &mut [u8], _timeout_ms: u32) -> Result<usize, ()> {
            match self.replies.pop_front() {
                Some(Poll::Data(r)) => {
                    buf[..r.len()].copy_from_slice(&r);
                    Ok(r.len())
                }
                Some(Poll::Broken) => Err(()),
                Some(Poll::Timeout) | None => Ok(0),
            }
        }
    }

    fn connected(mut script: Scripted) -> Programmer<Scripted> {
        script.replies.push_front(Poll::Data(b"V010000\r\nR\r\n".to_vec()));
        let mut p = Programmer::new(script, Options::default());
        p.init().unwrap();
        p
    }

    #[test]
    fn init_reads_version() {
        let mut p = Programmer::new(Scripted::default().reply(b"V020105\r\nR\r\n"), Options::default());
        assert_eq!(p.init().unwrap(), Version { major: 2, minor: 1, patch: 5 });
        assert_eq!(p.state(), State::Connected(Version { major: 2, minor: 1, patch: 5 }));
        assert_eq!(p.free().sent, vec!["V"]);
    }

    #[test]
    fn init_discards_stale_data() {
        let script = Scripted::default().reply(b"00\r\nR\r\n").reply(b"V010203\r\nR\r\n");
        let mut p = Programmer::new(script, Options::default());
        assert!(p.init().is_ok());
        assert_eq!(p.free().sent, vec!["V", "V"]);
    }

    #[test]
    fn init_fails_without_programmer() {
        let mut p = Programmer::new(Scripted::default(), Options::default());
        assert!(matches!(p.init(), Err(Error::NotDetected)));
        assert_eq!(p.state(), State::Init);
        assert_eq!(p.free().sent.len(), 5);
    }

    #[test]
    fn init_rejects_busy_status() {
        let mut p = Programmer::new(Scripted::default().reply(b"V010203\r\nB\r\n"), Options::default());
        assert!(matches!(p.init(), Err(Error::NotDetected)));
    }

    #[test]
    fn commands_require_init() {
        let mut p = Programmer::new(Scripted::default(), Options::default());
        assert!(matches!(p.blank_check(Chip::S471), Err(Error::NotConnected)));
    }

    #[test]
    fn read_decodes_value() {
        let mut p = connected(Scripted::default().reply(b"2A\r\nR\r\n"));
        let mut image = [0u8; MAX_CHIP_SIZE];
        p.read(Chip::S471, AddressRange::new(0x10, 1), &mut image).unwrap();
        assert_eq!(image[0x10], 0x2A);
        assert_eq!(p.free().sent[1], "r 0 10 1\n");
    }

    #[test]
    fn response_split_across_polls() {
        let mut p = connected(Scripted::default().reply(b"2").reply(b"A\r\nR").reply(b"\r\n"));
        let mut image = [0u8; MAX_CHIP_SIZE];
        p.read(Chip::S471, AddressRange::new(0, 1), &mut image).unwrap();
        assert_eq!(image[0], 0x2A);
    }

    #[test]
    fn not_ready_status_fails() {
        let mut p = connected(Scripted::default().reply(b"2A\r\nX\r\n"));
        let mut image = [0u8; MAX_CHIP_SIZE];
        let err = p.read(Chip::S471, AddressRange::new(0, 1), &mut image).unwrap_err();
        assert!(matches!(err, Error::BadResponse { reason: ResponseError::NotReady('X'), .. }));
    }

    #[test]
    fn silence_fails_after_five_attempts() {
        let mut p = connected(Scripted::default().silence(5).reply(b"2A\r\nR\r\n"));
        let mut image = [0u8; MAX_CHIP_SIZE];
        let err = p.read(Chip::S471, AddressRange::new(0, 1), &mut image).unwrap_err();
        assert!(matches!(err, Error::NoResponse));
    }

    #[test]
    fn empty_polls_are_retried() {
        let mut p = connected(Scripted::default().silence(4).reply(b"33\r\nR\r\n"));
        let mut image = [0u8; MAX_CHIP_SIZE];
        p.read(Chip::S471, AddressRange::new(7, 1), &mut image).unwrap();
        assert_eq!(image[7], 0x33);
    }

    #[test]
    fn blank_check_reports_first_used_cell() {
        let mut p = connected(Scripted::default().reply(b"100\r\nR\r\n").reply(b"1f\r\nR\r\n"));
        assert_eq!(p.blank_check(Chip::S471).unwrap(), BlankStatus::Blank);
        assert_eq!(p.blank_check(Chip::S472).unwrap(), BlankStatus::NotBlank(0x1F));

        let sent = p.free().sent;
        assert_eq!(sent[1], "K 0\n");
        assert_eq!(sent[2], "K 1\n");
    }

    #[test]
    fn mismatch_aborts_remaining_ranges() {
        let mut blocks = BlockList::new();
        blocks.append(0x20, 1);
        blocks.append(0x40, 1);

        let mut image = [0u8; MAX_CHIP_SIZE];
        image[0x20] = 0x02;
        image[0x40] = 0x03;

        let mut p = connected(Scripted::default().reply(b"01\r\nR\r\n").reply(b"03\r\nR\r\n"));
        let err = p.verify(Chip::S471, &blocks, &image).unwrap_err();
        assert!(matches!(
            err,
            Error::Mismatch { address: 0x20, read: 0x01, expected: 0x02, .. }
        ));

        // Version query plus the failing cell only
        let sent = p.free().sent;
        assert_eq!(sent, vec!["V", "v 0 20 2\n"]);
    }

    #[test]
    fn out_of_range_address_is_not_sent() {
        let mut blocks = BlockList::new();
        blocks.append(0xFE, 4);
        let image = [0u8; MAX_CHIP_SIZE];

        let mut p = connected(Scripted::default().reply(b"0\r\nR\r\n").reply(b"0\r\nR\r\n"));
        let err = p.simulate(Chip::S471, &blocks, &image).unwrap_err();
        assert!(matches!(err, Error::AddressOutOfRange { address: 0x100, last: 0xFF }));

        let sent = p.free().sent;
        assert_eq!(sent, vec!["V", "s 0 fe 0\n", "s 0 ff 0\n"]);
    }

    #[test]
    fn progress_is_reported_per_cell() {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let mut p = connected(Scripted::default().reply(b"AA\r\nR\r\n").reply(b"BB\r\nR\r\n"));
        let s = seen.clone();
        p.set_progress(move |a| s.borrow_mut().push(a));

        let mut image = [0u8; MAX_CHIP_SIZE];
        image[1] = 0xAA;
        image[2] = 0xBB;
        p.write(Chip::S472, &BlockList::from(AddressRange::new(1, 2)), &image).unwrap();

        assert_eq!(*seen.borrow(), vec![1, 2]);
    }

    #[test]
    fn oversized_read_value_is_rejected() {
        let mut p = connected(Scripted::default().reply(b"1FF\r\nR\r\n"));
        let mut image = [0u8; MAX_CHIP_SIZE];
        let err = p.read(Chip::S472, AddressRange::new(3, 1), &mut image).unwrap_err();
        assert!(matches!(err, Error::BadResponse { address: 3, reason: ResponseError::Malformed(_), .. }));
        assert_eq!(image[3], 0);
    }

    #[test]
    fn short_image_is_out_of_range() {
        let mut p = connected(Scripted::default());

        let blocks = BlockList::from(AddressRange::new(0x100, 1));
        let err = p.write(Chip::S472, &blocks, &[0u8; 256]).unwrap_err();
        assert!(matches!(err, Error::AddressOutOfRange { address: 0x100, last: 0xFF }));

        let mut short = [0u8; 256];
        let err = p.read(Chip::S472, AddressRange::new(0x100, 1), &mut short).unwrap_err();
        assert!(matches!(err, Error::AddressOutOfRange { address: 0x100, last: 0xFF }));

        assert_eq!(p.free().sent, vec!["V"]);
    }

    #[test]
    fn write_failure_during_init() {
        let mut p = Programmer::new(Scripted::default().write_limit(0), Options::default());
        assert!(matches!(p.init(), Err(Error::Serial(()))));
        assert_eq!(p.state(), State::Init);
        assert!(p.free().sent.is_empty());
    }

    #[test]
    fn write_failure_aborts_operation() {
        let mut blocks = BlockList::new();
        blocks.append(0x10, 2);
        blocks.append(0x40, 1);
        let image = [0u8; MAX_CHIP_SIZE];

        // Version query and the first cell go out, the second cell fails
        let mut p = connected(Scripted::default().reply(b"0\r\nR\r\n").write_limit(2));
        let err = p.verify(Chip::S471, &blocks, &image).unwrap_err();
        assert!(matches!(err, Error::Serial(())));
        assert_eq!(p.free().sent, vec!["V", "v 0 10 0\n"]);
    }

    #[test]
    fn read_failure_aborts_operation() {
        let mut blocks = BlockList::new();
        blocks.append(0x10, 1);
        blocks.append(0x40, 1);
        let image = [0u8; MAX_CHIP_SIZE];

        let mut p = connected(Scripted::default().silence(1).broken_read().reply(b"0\r\nR\r\n"));
        let err = p.write(Chip::S471, &blocks, &image).unwrap_err();
        assert!(matches!(err, Error::Serial(())));
        assert_eq!(p.free().sent, vec!["V", "w 0 10 0\n"]);
    }
}
