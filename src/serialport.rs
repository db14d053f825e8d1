use crate::session::{self, Channel};
use crate::Result;
use std::time::Duration;

pub use serialport::{ClearBuffer, SerialPort};

/// Default read timeout of a freshly opened port.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(2);

/// A BMS session on a serial port.
pub type PylontechBms = session::PylontechBms<Box<dyn SerialPort>>;

/// Opens `port` with 8N1 framing and no flow control.
pub fn open_port(port: &str, baud_rate: u32) -> Result<Box<dyn SerialPort>> {
    log::trace!("open {port} with {baud_rate} baud");
    Ok(serialport::new(port, baud_rate)
        .data_bits(serialport::DataBits::Eight)
        .parity(serialport::Parity::None)
        .stop_bits(serialport::StopBits::One)
        .flow_control(serialport::FlowControl::None)
        .timeout(DEFAULT_TIMEOUT)
        .open()?)
}

impl Channel for Box<dyn SerialPort> {
    fn discard_input(&mut self) -> Result<()> {
        let pending = self.bytes_to_read()?;
        if pending > 0 {
            log::trace!("Clear {pending} pending bytes of the port");
        }
        self.clear(ClearBuffer::Input)?;
        Ok(())
    }
}

impl PylontechBms {
    pub fn open(port: &str, baud_rate: u32) -> Result<Self> {
        Ok(Self::new(open_port(port, baud_rate)?))
    }

    /// Sets how long a read waits for the response line.
    pub fn set_timeout(&mut self, timeout: Duration) -> Result<()> {
        log::trace!("set timeout to {timeout:?}");
        Ok(self.get_mut().set_timeout(timeout)?)
    }
}
