//! A simulated BMS answering requests from canned payloads.

use crate::frame::{self, Frame, END_OF_FRAME};
use crate::protocol::*;
use crate::{Error, Result};
use std::collections::HashMap;
use std::io::{BufRead, BufReader, ErrorKind, Read, Write};

/// Return code of a successfully answered command.
pub const RETURN_NORMAL: u8 = 0x00;

#[derive(Debug, Clone, Default)]
pub struct Emulator {
    // keyed by (address, cid2), `None` answers on every address
    responses: HashMap<(Option<u8>, u8), Vec<u8>>,
}

impl Emulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// An emulator serving sample analog data and charge/discharge limits on every address.
    pub fn with_sample_data() -> Result<Self> {
        let mut emulator = Self::new();
        emulator.insert(
            None,
            Command::SystemAnalogData,
            sample_system_analog_data().encode()?,
        );
        emulator.insert(
            None,
            Command::ChargeDischargeManagementInfo,
            sample_charge_discharge_management_info().encode()?,
        );
        Ok(emulator)
    }

    /// Registers the binary info payload returned for `command` at `address`.
    pub fn insert(&mut self, address: Option<u8>, command: Command, info: Vec<u8>) {
        self.responses.insert((address, command as u8), info);
    }

    /// Answers one encoded request, `None` when the emulated device stays silent.
    pub fn respond(&self, request: &[u8]) -> Result<Option<Vec<u8>>> {
        let request = frame::decode_response(request)?;
        let info = self
            .responses
            .get(&(Some(request.address), request.cid2))
            .or_else(|| self.responses.get(&(None, request.cid2)));

        let command = Command::try_from(request.cid2)
            .map(|command| command.to_string())
            .unwrap_or_else(|cid2| format!("unknown command {cid2:02X}h"));
        match info {
            Some(info) => {
                log::debug!("{command} received at address {}", request.address);
                let response = Frame::new(request.address, frame::CID1, RETURN_NORMAL, info.clone())?;
                Ok(Some(response.encode()?))
            }
            None => {
                log::debug!("{command} at address {} not emulated", request.address);
                Ok(None)
            }
        }
    }

    /// Answers requests arriving on `channel` until it reaches end of file.
    pub fn run<C: Read + Write>(&self, channel: C) -> Result<()> {
        let mut channel = BufReader::new(channel);
        loop {
            let mut request = Vec::new();
            match channel.read_until(END_OF_FRAME, &mut request) {
                Ok(0) => return Ok(()),
                Ok(_) => {}
                Err(err) if matches!(err.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock) => {
                    if request.is_empty() {
                        continue;
                    }
                }
                Err(err) => return Err(err.into()),
            }
            log::trace!("receive: {:?}", String::from_utf8_lossy(&request));

            match self.respond(&request) {
                Ok(Some(response)) => {
                    log::trace!("send: {:?}", String::from_utf8_lossy(&response));
                    channel.get_mut().write_all(&response)?;
                }
                Ok(None) => {}
                Err(err @ Error::Io(_)) => return Err(err),
                Err(err) => log::warn!("Ignore request: {err}"),
            }
        }
    }
}

pub fn sample_system_analog_data() -> SystemAnalogData {
    SystemAnalogData {
        total_average_voltage: 52.6,
        total_current: 25.0,
        system_soc: 99,
        average_number_of_cycles: 3,
        maximum_number_of_cycles: 4,
        average_soh: 98,
        minimum_soh: 97,
        single_core_maximum_voltage: 3.512,
        module_with_highest_voltage_of_single_core: 52,
        single_core_minimum_voltage: 3.509,
        module_with_lowest_voltage_of_single_core: 20,
        single_core_average_temperature: 25.5,
        single_core_maximum_temperature: 26.8,
        module_with_highest_temperature_of_single_core: 53,
        single_core_minimum_temperature: 24.2,
        module_with_lowest_temperature_of_single_core: 21,
        mosfet_average_temperature: 25.5,
        mosfet_maximum_temperature: 26.9,
        mosfet_highest_temperature_module: 54,
        mosfet_minimum_temperature: 24.1,
        mosfet_lowest_temperature_module: 22,
        bms_average_temperature: 25.5,
        bms_maximum_temperature: 26.7,
        bms_highest_temperature_module: 55,
        bms_minimum_temperature: 24.3,
        bms_lowest_temperature_module: 23,
    }
}

pub fn sample_charge_discharge_management_info() -> ChargeDischargeManagementInfo {
    ChargeDischargeManagementInfo {
        charge_voltage_limit: 53.0,
        discharge_voltage_limit: 48.0,
        charge_current_limit: 25.0,
        discharge_current_limit: 24.0,
        status: ChargeDischargeStatus {
            charge_enable: true,
            discharge_enable: true,
            charge_immediately: false,
            full_charge_request: false,
        },
    }
}
