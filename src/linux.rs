use std::io::ErrorKind as IoErrorKind;
use std::path::Path;
use std::time::Duration;

use serial_core::{
    BaudRate, CharSize, Error as SerialError, FlowControl, Parity, SerialDevice as _,
    SerialPortSettings as _, StopBits,
};
use linux_embedded_hal::{Delay, Serial};

use crate::{Options, Port, Programmer};

/// Default programmer line speed
pub const DEFAULT_BAUD: usize = 57600;

/// Serial transport on a linux tty
pub type LinuxPort = Port<Serial, Delay, IoErrorKind>;

impl Programmer<LinuxPort> {
    /// Create a new linux serial port programmer instance
    pub fn linux<P: AsRef<Path>>(
        port: P,
        baud: usize,
        options: Options,
    ) -> Result<Self, SerialError> {
        debug!("Opening {} at {} baud", port.as_ref().display(), baud);

        // Open port
        let mut port = Serial::open(port.as_ref())?;

        // Raw 8N1, no flow control
        let mut settings = port.0.read_settings()?;

        settings.set_char_size(CharSize::Bits8);
        settings.set_stop_bits(StopBits::Stop1);
        settings.set_baud_rate(BaudRate::from_speed(baud))?;
        settings.set_flow_control(FlowControl::FlowNone);
        settings.set_parity(Parity::ParityNone);

        port.0.write_settings(&settings)?;

        // Reads give up quickly so the port can be polled
        port.0.set_timeout(Duration::from_millis(options.poll_delay_ms.max(1) as u64))?;

        // Return instance
        let transport = Port::new(port, Delay {}, &options);
        Ok(Self::new(transport, options))
    }
}
