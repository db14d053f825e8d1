//! Synchronous request/response session over any byte channel.
//!
//! The channel is usually a serial port (see the `serialport` feature) but any
//! `Read + Write` implementation of [`Channel`] works, which is how the tests
//! drive the session against the [`Emulator`](crate::emulator::Emulator).

use crate::frame::{self, Frame, END_OF_FRAME};
use crate::protocol::*;
use crate::{Error, Result};
use std::collections::BTreeMap;
use std::io::{BufRead, BufReader, ErrorKind, Read, Write};
use std::time::{Duration, Instant};

/// A byte channel a session can talk through.
///
/// `discard_input` drops whatever the device sent before the next request,
/// channels without an input queue of their own keep the default.
pub trait Channel: Read + Write {
    fn discard_input(&mut self) -> Result<()> {
        Ok(())
    }
}

/// A Pylontech BMS reached through an exclusively owned channel.
#[derive(Debug)]
pub struct PylontechBms<C> {
    channel: BufReader<C>,
    last_execution: Instant,
    delay: Duration,
}

impl<C: Channel> PylontechBms<C> {
    pub fn new(channel: C) -> Self {
        Self {
            channel: BufReader::new(channel),
            last_execution: Instant::now(),
            delay: MINIMUM_DELAY,
        }
    }

    pub fn get_ref(&self) -> &C {
        self.channel.get_ref()
    }

    pub fn get_mut(&mut self) -> &mut C {
        self.channel.get_mut()
    }

    pub fn into_inner(self) -> C {
        self.channel.into_inner()
    }

    pub fn set_delay(&mut self, delay: Duration) {
        if delay < MINIMUM_DELAY {
            log::warn!("delay {delay:?} lower minimum {MINIMUM_DELAY:?}, use minimum");
            self.delay = MINIMUM_DELAY;
        } else {
            self.delay = delay;
        }
        log::trace!("set delay to {:?}", self.delay);
    }

    fn await_delay(&self) {
        let last_exec_diff = Instant::now().duration_since(self.last_execution);
        if let Some(time_until_delay_reached) = self.delay.checked_sub(last_exec_diff) {
            std::thread::sleep(time_until_delay_reached);
        }
    }

    fn send_bytes(&mut self, tx_buffer: &[u8]) -> Result<()> {
        // drop whatever is left of an earlier response to avoid data collision
        let pending = self.channel.buffer().len();
        if pending > 0 {
            log::trace!("Discard {pending} pending bytes");
            self.channel.consume(pending);
        }
        self.channel.get_mut().discard_input()?;
        self.await_delay();

        log::trace!("send: {:?}", String::from_utf8_lossy(tx_buffer));
        self.channel.get_mut().write_all(tx_buffer)?;
        Ok(())
    }

    /// Reads one `\r` terminated line.
    ///
    /// A timeout before the first byte is reported as [`Error::ChannelTimeout`];
    /// a partial line is handed to the frame decoder which rejects it.
    fn read_line(&mut self) -> Result<Vec<u8>> {
        let mut rx_buffer = Vec::new();
        let result = self.channel.read_until(END_OF_FRAME, &mut rx_buffer);
        self.last_execution = Instant::now();
        match result {
            Ok(_) => {}
            Err(err) if matches!(err.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock) => {
                log::trace!("read timed out after {} bytes", rx_buffer.len());
            }
            Err(err) => return Err(err.into()),
        }
        if rx_buffer.is_empty() {
            return Err(Error::ChannelTimeout);
        }
        log::trace!("receive: {:?}", String::from_utf8_lossy(&rx_buffer));
        Ok(rx_buffer)
    }

    fn request(&mut self, address: u8, tx_buffer: &[u8]) -> Result<Frame> {
        self.send_bytes(tx_buffer)?;
        let response = frame::decode_response(&self.read_line()?)?;
        if response.address != address {
            log::warn!(
                "Response address mismatch - requested={address} received={}",
                response.address
            );
        }
        Ok(response)
    }

    pub fn get_protocol_version(&mut self) -> Result<ProtocolVersion> {
        log::trace!("get protocol version");
        let request = ProtocolVersion::request()?;
        ProtocolVersion::decode(&self.request(0, &request)?)
    }

    pub fn get_manufacturer_info(&mut self) -> Result<ManufacturerInfo> {
        log::trace!("get manufacturer info");
        let request = ManufacturerInfo::request()?;
        ManufacturerInfo::decode(&self.request(0, &request)?)
    }

    pub fn get_system_parameters(&mut self, dev_id: Option<u8>) -> Result<SystemParameters> {
        log::trace!("get system parameters");
        let request = SystemParameters::request(dev_id)?;
        SystemParameters::decode(&self.request(dev_id.unwrap_or(DEFAULT_ADDRESS), &request)?)
    }

    pub fn get_management_info(&mut self, dev_id: u8) -> Result<ManagementInfo> {
        log::trace!("get management info of {dev_id}");
        let request = ManagementInfo::request(dev_id)?;
        ManagementInfo::decode(&self.request(dev_id, &request)?)
    }

    pub fn get_module_serial_number(&mut self, dev_id: Option<u8>) -> Result<ModuleSerialNumber> {
        log::trace!("get module serial number");
        let request = ModuleSerialNumber::request(dev_id)?;
        ModuleSerialNumber::decode(&self.request(dev_id.unwrap_or(DEFAULT_ADDRESS), &request)?)
    }

    pub fn get_values(&mut self) -> Result<Values> {
        log::trace!("get values");
        let request = Values::request()?;
        Values::decode(&self.request(DEFAULT_ADDRESS, &request)?)
    }

    pub fn get_values_single(&mut self, dev_id: u8) -> Result<ValuesSingle> {
        log::trace!("get values of {dev_id}");
        let request = ValuesSingle::request(dev_id)?;
        ValuesSingle::decode(&self.request(dev_id, &request)?)
    }

    pub fn get_alarm_info(&mut self, dev_id: Option<u8>) -> Result<AlarmInfo> {
        log::trace!("get alarm info");
        let request = AlarmInfo::request(dev_id)?;
        AlarmInfo::decode(&self.request(dev_id.unwrap_or(DEFAULT_ADDRESS), &request)?)
    }

    pub fn get_system_analog_data(&mut self, dev_id: Option<u8>) -> Result<SystemAnalogData> {
        log::trace!("get system analog data");
        let request = SystemAnalogData::request(dev_id)?;
        SystemAnalogData::decode(&self.request(dev_id.unwrap_or(DEFAULT_ADDRESS), &request)?)
    }

    pub fn get_charge_discharge_management_info(
        &mut self,
        dev_id: Option<u8>,
    ) -> Result<ChargeDischargeManagementInfo> {
        log::trace!("get charge discharge management info");
        let request = ChargeDischargeManagementInfo::request(dev_id)?;
        let response = self.request(dev_id.unwrap_or(DEFAULT_ADDRESS), &request)?;
        ChargeDischargeManagementInfo::decode(&response)
    }

    /// Queries every address in `start..end` for a module serial number.
    ///
    /// Addresses that stay silent until the read timeout are skipped, any
    /// other failure aborts the scan. A serial number is keyed by the address
    /// of the frame carrying it, so a late reply is not taken for the queried
    /// address.
    pub fn scan(&mut self, start: u8, end: u8) -> Result<BTreeMap<u8, String>> {
        let mut batteries = BTreeMap::new();
        for address in start..end {
            match self.request(address, &ModuleSerialNumber::request(Some(address))?) {
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

/// Stores the serial number of a scan response under the address that sent it.
pub(crate) fn record_battery(
    batteries: &mut BTreeMap<u8, String>,
    range: std::ops::Range<u8>,
    queried: u8,
    response: &Frame,
    serial: ModuleSerialNumber,
) {
    let address = response.address;
    if !range.contains(&address) {
        log::warn!("Ignore reply from address {address} outside of the scan range, queried {queried}");
        return;
    }
    if address != queried {
        log::debug!("Late reply from address {address} while querying {queried}");
    }
    log::debug!(
        "Found battery at address {address} with serial {}",
        serial.module_serial_number
    );
    batteries.insert(address, serial.module_serial_number);
}
