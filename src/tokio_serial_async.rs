//! Provides an asynchronous client for interacting with a Pylontech BMS
//! using Tokio and the `tokio-serial` crate for serial communication.
//!
//! This module is suitable for applications built on the Tokio runtime.
//!
//! # Example
//!
//! ```no_run
//! use pylontech_lib::tokio_serial_async::PylontechBms;
//! use std::time::Duration;
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> Result<(), pylontech_lib::Error> {
//!     let mut bms = PylontechBms::open("/dev/ttyUSB0", 9600)?;
//!     bms.set_timeout(Duration::from_millis(500));
//!
//!     let analog = bms.get_system_analog_data(None).await?;
//!     println!("Analog data: {:?}", analog);
//!
//!     let batteries = bms.scan(0, 16).await?;
//!     println!("Batteries: {:?}", batteries);
//!
//!     Ok(())
//! }
//! ```

use crate::frame::{self, Frame, END_OF_FRAME};
use crate::protocol::*;
use crate::session::record_battery;
use crate::{Error, Result};
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio_serial::SerialPortBuilderExt;

/// The main struct for interacting asynchronously with a Pylontech BMS using Tokio.
///
/// It handles sending commands and receiving/decoding responses from the BMS
/// in an asynchronous manner. Every method requires a mutable reference, so
/// only one request is ever in flight.
#[derive(Debug)]
pub struct PylontechBms<C> {
    channel: BufReader<C>,
    last_execution: Instant,
    io_timeout: Duration, // Timeout for individual I/O operations
    delay: Duration,      // Delay between commands
}

impl PylontechBms<tokio_serial::SerialStream> {
    /// Opens `port` with 8N1 framing for asynchronous operation.
    pub fn open(port: &str, baud_rate: u32) -> Result<Self> {
        let serial = tokio_serial::new(port, baud_rate)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .flow_control(tokio_serial::FlowControl::None)
            .open_native_async()
            .map_err(|err| Error::Io(err.into()))?;
        Ok(Self::new(serial))
    }
}

impl<C: AsyncRead + AsyncWrite + Unpin> PylontechBms<C> {
    pub fn new(channel: C) -> Self {
        Self {
            channel: BufReader::new(channel),
            last_execution: Instant::now(),
            io_timeout: Duration::from_secs(2),
            delay: MINIMUM_DELAY,
        }
    }

    pub fn into_inner(self) -> C {
        self.channel.into_inner()
    }

    /// Sets how long a single read or write may take.
    pub fn set_timeout(&mut self, timeout: Duration) {
        log::trace!("set timeout to {timeout:?}");
        self.io_timeout = timeout;
    }

    /// Sets the minimum delay between sending commands to the BMS.
    ///
    /// If the provided `delay` is less than `MINIMUM_DELAY` from the `protocol` module,
    /// `MINIMUM_DELAY` will be used.
    pub fn set_delay(&mut self, delay: Duration) {
        if delay < MINIMUM_DELAY {
            log::warn!("delay {delay:?} lower minimum {MINIMUM_DELAY:?}, use minimum");
            self.delay = MINIMUM_DELAY;
        } else {
            self.delay = delay;
        }
        log::trace!("set delay to {:?}", self.delay);
    }

    async fn await_delay(&self) {
        let last_exec_diff = Instant::now().duration_since(self.last_execution);
        if let Some(time_until_delay_reached) = self.delay.checked_sub(last_exec_diff) {
            tokio::time::sleep(time_until_delay_reached).await;
        }
    }

    async fn send_bytes(&mut self, tx_buffer: &[u8]) -> Result<()> {
        // Leftovers of a timed out response must not be taken for the next answer.
        let pending = self.channel.buffer().len();
        if pending > 0 {
            log::trace!("Discard {pending} pending bytes");
            self.channel.consume(pending);
        }
        self.await_delay().await;

        log::trace!("send: {:?}", String::from_utf8_lossy(tx_buffer));
        tokio::time::timeout(self.io_timeout, self.channel.get_mut().write_all(tx_buffer))
            .await
            .map_err(|_| Error::ChannelTimeout)??;
        Ok(())
    }

    async fn read_line(&mut self) -> Result<Vec<u8>> {
        let mut rx_buffer = Vec::new();
        let result = tokio::time::timeout(
            self.io_timeout,
            self.channel.read_until(END_OF_FRAME, &mut rx_buffer),
        )
        .await;
        self.last_execution = Instant::now();
        match result {
            Ok(read) => {
                read?;
            }
            Err(_) => log::trace!("read timed out after {} bytes", rx_buffer.len()),
        }
        if rx_buffer.is_empty() {
            return Err(Error::ChannelTimeout);
        }
        log::trace!("receive: {:?}", String::from_utf8_lossy(&rx_buffer));
        Ok(rx_buffer)
    }

    async fn request(&mut self, address: u8, tx_buffer: &[u8]) -> Result<Frame> {
        self.send_bytes(tx_buffer).await?;
        let response = frame::decode_response(&self.read_line().await?)?;
        if response.address != address {
            log::warn!(
                "Response address mismatch - requested={address} received={}",
                response.address
            );
        }
        Ok(response)
    }

    /// Asynchronously retrieves the protocol version byte of the BMS.
    pub async fn get_protocol_version(&mut self) -> Result<ProtocolVersion> {
        log::trace!("get protocol version");
        let request = ProtocolVersion::request()?;
        ProtocolVersion::decode(&self.request(0, &request).await?)
    }

    pub async fn get_manufacturer_info(&mut self) -> Result<ManufacturerInfo> {
        log::trace!("get manufacturer info");
        let request = ManufacturerInfo::request()?;
        ManufacturerInfo::decode(&self.request(0, &request).await?)
    }

    pub async fn get_system_parameters(&mut self, dev_id: Option<u8>) -> Result<SystemParameters> {
        log::trace!("get system parameters");
        let request = SystemParameters::request(dev_id)?;
        SystemParameters::decode(&self.request(dev_id.unwrap_or(DEFAULT_ADDRESS), &request).await?)
    }

    pub async fn get_management_info(&mut self, dev_id: u8) -> Result<ManagementInfo> {
        log::trace!("get management info of {dev_id}");
        let request = ManagementInfo::request(dev_id)?;
        ManagementInfo::decode(&self.request(dev_id, &request).await?)
    }

    pub async fn get_module_serial_number(
        &mut self,
        dev_id: Option<u8>,
    ) -> Result<ModuleSerialNumber> {
        log::trace!("get module serial number");
        let request = ModuleSerialNumber::request(dev_id)?;
        let response = self.request(dev_id.unwrap_or(DEFAULT_ADDRESS), &request).await?;
        ModuleSerialNumber::decode(&response)
    }

    /// Asynchronously retrieves the analog values of all modules.
    ///
    /// The answer carries the summed power and the combined state of charge.
    pub async fn get_values(&mut self) -> Result<Values> {
        log::trace!("get values");
        let request = Values::request()?;
        Values::decode(&self.request(DEFAULT_ADDRESS, &request).await?)
    }

    pub async fn get_values_single(&mut self, dev_id: u8) -> Result<ValuesSingle> {
        log::trace!("get values of {dev_id}");
        let request = ValuesSingle::request(dev_id)?;
        ValuesSingle::decode(&self.request(dev_id, &request).await?)
    }

    pub async fn get_alarm_info(&mut self, dev_id: Option<u8>) -> Result<AlarmInfo> {
        log::trace!("get alarm info");
        let request = AlarmInfo::request(dev_id)?;
        AlarmInfo::decode(&self.request(dev_id.unwrap_or(DEFAULT_ADDRESS), &request).await?)
    }

    pub async fn get_system_analog_data(&mut self, dev_id: Option<u8>) -> Result<SystemAnalogData> {
        log::trace!("get system analog data");
        let request = SystemAnalogData::request(dev_id)?;
        SystemAnalogData::decode(&self.request(dev_id.unwrap_or(DEFAULT_ADDRESS), &request).await?)
    }

    pub async fn get_charge_discharge_management_info(
        &mut self,
        dev_id: Option<u8>,
    ) -> Result<ChargeDischargeManagementInfo> {
        log::trace!("get charge discharge management info");
        let request = ChargeDischargeManagementInfo::request(dev_id)?;
        let response = self.request(dev_id.unwrap_or(DEFAULT_ADDRESS), &request).await?;
        ChargeDischargeManagementInfo::decode(&response)
    }

    /// Asynchronously queries every address in `start..end` for a module serial number.
    ///
    /// Silent addresses are skipped, any other failure aborts the scan.
    /// Serial numbers are keyed by the address that answered.
    pub async fn scan(&mut self, start: u8, end: u8) -> Result<BTreeMap<u8, String>> {
        let mut batteries = BTreeMap::new();
        for address in start..end {
            let request = ModuleSerialNumber::request(Some(address))?;
            match self.request(address, &request).await {
                Ok(response) => {
                    let serial = ModuleSerialNumber::decode(&response)?;
                    record_battery(&mut batteries, start..end, address, &response, serial);
                }
                Err(Error::ChannelTimeout) => {
                    log::debug!("No battery found at address {address}");
                }
                Err(err) => return Err(err),
            }
        }
        Ok(batteries)
    }
}
