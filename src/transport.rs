//! Byte transport used by the [`Programmer`](crate::Programmer)

use core::fmt::Debug;
use core::marker::PhantomData;
use std::time::Instant;

use embedded_hal::blocking::delay::DelayMs;
use embedded_hal::serial::{Read, Write};

use crate::Options;

/// Transport trait for talking to the programmer
pub trait Transport {
    type Error: Debug;

    /// Write all bytes to the transport
    fn write(&mut self, data: &[u8]) -> Result<(), Self::Error>;

    /// Read whatever arrives within `timeout_ms`.
    ///
    /// Returns the number of bytes read, or 0 on timeout. A timeout is not an error.
    fn poll_read(&mut self, buf: &mut [u8], timeout_ms: u32) -> Result<usize, Self::Error>;
}

/// Any embedded-hal serial port
pub trait SerialPort<E>: Write<u8, Error = E> + Read<u8, Error = E> {}

impl<T, E> SerialPort<E> for T where T: Write<u8, Error = E> + Read<u8, Error = E> {}

/// [`Transport`] over a non-blocking embedded-hal serial port and a delay source
pub struct Port<P, D, E> {
    port: P,
    delay: D,
    poll_delay_ms: u32,
    inter_byte_timeout_ms: u32,
    _err: PhantomData<E>,
}

impl<P, D, E> Port<P, D, E>
where
    P: SerialPort<E>,
    D: DelayMs<u32>,
    E: Debug,
{
    pub fn new(port: P, delay: D, options: &Options) -> Self {
        Self {
            port,
            delay,
            poll_delay_ms: options.poll_delay_ms.max(1),
            inter_byte_timeout_ms: options.inter_byte_timeout_ms,
            _err: PhantomData,
        }
    }

    /// Release the underlying port and delay
    pub fn free(self) -> (P, D) {
        (self.port, self.delay)
    }
}

impl<P, D, E> Transport for Port<P, D, E>
where
    P: SerialPort<E>,
    D: DelayMs<u32>,
    E: Debug,
{
    type Error = E;

    fn write(&mut self, data: &[u8]) -> Result<(), E> {
        for b in data {
            block!(self.port.write(*b))?;
        }
        block!(self.port.flush())
    }

    fn poll_read(&mut self, buf: &mut [u8], timeout_ms: u32) -> Result<usize, E> {
        let mut n = 0;
        let start = Instant::now();
        let mut last_byte = start;

        // Sleeps are counted as well as wall time, since the port read may block on its own
        let mut waited = 0;
        let mut idle = 0;

        while n < buf.len() {
            match self.port.read() {
                Ok(b) => {
                    buf[n] = b;
                    n += 1;
                    idle = 0;
                    last_byte = Instant::now();
                    continue;
                }
                Err(nb::Error::WouldBlock) => (),
                Err(nb::Error::Other(e)) => return Err(e),
            }

            // Stop once a started burst goes quiet, or nothing arrived at all
            if n > 0 && idle.max(elapsed_ms(last_byte)) >= self.inter_byte_timeout_ms {
                break;
            }
            if n == 0 && waited.max(elapsed_ms(start)) >= timeout_ms {
                break;
            }

            self.delay.delay_ms(self.poll_delay_ms);
            waited += self.poll_delay_ms;
            idle += self.poll_delay_ms;
        }

        Ok(n)
    }
}

fn elapsed_ms(since: Instant) -> u32 {
    since.elapsed().as_millis().min(u32::MAX as u128) as u32
}
