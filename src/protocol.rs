use crate::frame::{self, Frame};
use crate::{Error, Result};
use std::fmt;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

// https://minimalmodbus.readthedocs.io/en/stable/serialcommunication.html#timing-of-the-serial-communications
// minimum delay 4ms by baud rate 9600
pub const MINIMUM_DELAY: std::time::Duration = std::time::Duration::from_millis(4);

/// Address used by commands that are not sent to a specific module.
pub const DEFAULT_ADDRESS: u8 = 2;

/// Command codes (CID2) understood by the BMS.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Command {
    GetValues = 0x42,
    AlarmInfo = 0x44,
    SystemParameters = 0x47,
    ProtocolVersion = 0x4F,
    ManufacturerInfo = 0x51,
    SystemAnalogData = 0x61,
    ChargeDischargeManagementInfo = 0x63,
    ManagementInfo = 0x92,
    ModuleSerialNumber = 0x93,
}

impl TryFrom<u8> for Command {
    type Error = u8;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        Ok(match value {
            0x42 => Command::GetValues,
            0x44 => Command::AlarmInfo,
            0x47 => Command::SystemParameters,
            0x4F => Command::ProtocolVersion,
            0x51 => Command::ManufacturerInfo,
            0x61 => Command::SystemAnalogData,
            0x63 => Command::ChargeDischargeManagementInfo,
            0x92 => Command::ManagementInfo,
            0x93 => Command::ModuleSerialNumber,
            other => return Err(other),
        })
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Command::GetValues => write!(f, "get values (42h)"),
            Command::AlarmInfo => write!(f, "alarm info (44h)"),
            Command::SystemParameters => write!(f, "system parameters (47h)"),
            Command::ProtocolVersion => write!(f, "protocol version (4Fh)"),
            Command::ManufacturerInfo => write!(f, "manufacturer info (51h)"),
            Command::SystemAnalogData => write!(f, "system analog data (61h)"),
            Command::ChargeDischargeManagementInfo => {
                write!(f, "charge discharge management info (63h)")
            }
            Command::ManagementInfo => write!(f, "management info (92h)"),
            Command::ModuleSerialNumber => write!(f, "module serial number (93h)"),
        }
    }
}

fn create_request(address: u8, command: Command, info: &[u8]) -> Result<Vec<u8>> {
    frame::encode_command(address, command as u8, info)
}

/// Addressed commands carry their device id as two hex characters in the info field.
fn create_device_request(dev_id: u8, command: Command) -> Result<Vec<u8>> {
    create_request(dev_id, command, format!("{dev_id:02X}").as_bytes())
}

/// Linear transform between a raw wire integer and a physical value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Scale {
    divisor: f32,
    offset: i32,
}

impl Scale {
    pub const fn new(divisor: f32, offset: i32) -> Self {
        Self { divisor, offset }
    }

    pub fn decode(&self, raw: i32) -> f32 {
        (raw - self.offset) as f32 / self.divisor
    }

    pub fn encode(&self, value: f32) -> i32 {
        (value * self.divisor).round() as i32 + self.offset
    }
}

pub const DIVIDE_BY_1000: Scale = Scale::new(1000.0, 0);
pub const DIVIDE_BY_100: Scale = Scale::new(100.0, 0);
pub const DIVIDE_BY_10: Scale = Scale::new(10.0, 0);
pub const TO_VOLT: Scale = Scale::new(1000.0, 0);
pub const TO_AMP: Scale = Scale::new(10.0, 0);
// Temperatures are sent in 0.1 Kelvin
pub const TO_CELSIUS: Scale = Scale::new(10.0, 2731);

macro_rules! read_bit {
    ($byte:expr,$position:expr) => {
        ($byte >> $position) & 1 != 0
    };
}

macro_rules! set_bit {
    ($flag:expr,$position:expr) => {
        (u8::from($flag) << $position)
    };
}

/// Big-endian cursor over an info payload.
struct PayloadReader<'a> {
    buffer: &'a [u8],
    position: usize,
}

impl<'a> PayloadReader<'a> {
    fn new(buffer: &'a [u8]) -> Self {
        Self {
            buffer,
            position: 0,
        }
    }

    fn take(&mut self, size: usize) -> Result<&'a [u8]> {
        let remaining = self.buffer.len() - self.position;
        if remaining < size {
            log::warn!("Truncated payload - required={size} remaining={remaining}");
            return Err(Error::TruncatedPayload {
                needed: size,
                remaining,
            });
        }
        let field = &self.buffer[self.position..self.position + size];
        self.position += size;
        Ok(field)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn i16(&mut self) -> Result<i16> {
        let b = self.take(2)?;
        Ok(i16::from_be_bytes([b[0], b[1]]))
    }

    fn u24(&mut self) -> Result<u32> {
        let b = self.take(3)?;
        Ok(u32::from_be_bytes([0, b[0], b[1], b[2]]))
    }

    fn scaled_u16(&mut self, scale: Scale) -> Result<f32> {
        Ok(scale.decode(i32::from(self.u16()?)))
    }

    fn scaled_i16(&mut self, scale: Scale) -> Result<f32> {
        Ok(scale.decode(i32::from(self.i16()?)))
    }

    fn scaled_u24(&mut self, scale: Scale) -> Result<f32> {
        Ok(scale.decode(self.u24()? as i32))
    }

    /// Reads `size` bytes as Latin-1 text without trailing padding.
    fn text(&mut self, size: usize) -> Result<String> {
        let text: String = self.take(size)?.iter().map(|b| char::from(*b)).collect();
        Ok(text.trim_end_matches(['\0', ' ']).to_string())
    }

    fn finish(self) -> Result<()> {
        if self.position != self.buffer.len() {
            log::warn!(
                "Unconsumed payload bytes - consumed={} received={}",
                self.position,
                self.buffer.len()
            );
            return Err(Error::PayloadLengthMismatch {
                expected: self.position,
                actual: self.buffer.len(),
            });
        }
        Ok(())
    }
}

#[derive(Default)]
struct PayloadWriter(Vec<u8>);

impl PayloadWriter {
    fn u8(&mut self, value: u8) {
        self.0.push(value);
    }

    fn u16(&mut self, value: u16) {
        self.0.extend_from_slice(&value.to_be_bytes());
    }

    fn scaled_u16(&mut self, scale: Scale, value: f32) -> Result<()> {
        let raw = u16::try_from(scale.encode(value)).map_err(|_| Error::RangeError)?;
        self.u16(raw);
        Ok(())
    }

    fn scaled_i16(&mut self, scale: Scale, value: f32) -> Result<()> {
        let raw = i16::try_from(scale.encode(value)).map_err(|_| Error::RangeError)?;
        self.0.extend_from_slice(&raw.to_be_bytes());
        Ok(())
    }

    /// Writes Latin-1 text padded with NUL to exactly `size` bytes.
    fn text(&mut self, text: &str, size: usize) -> Result<()> {
        let mut bytes = text
            .chars()
            .map(|c| u8::try_from(c).map_err(|_| Error::RangeError))
            .collect::<Result<Vec<u8>>>()?;
        if bytes.len() > size {
            return Err(Error::RangeError);
        }
        bytes.resize(size, 0);
        self.0.extend_from_slice(&bytes);
        Ok(())
    }

    fn into_inner(self) -> Vec<u8> {
        self.0
    }
}

/// Removes the leading info flag byte some responses carry.
fn strip_info_flag(info: &[u8]) -> Result<&[u8]> {
    match info.split_first() {
        Some((flag, rest)) => {
            log::trace!("Info flag {flag:02X}");
            Ok(rest)
        }
        None => Err(Error::TruncatedPayload {
            needed: 1,
            remaining: 0,
        }),
    }
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ProtocolVersion {
    pub version: u8,
}

impl ProtocolVersion {
    pub fn request() -> Result<Vec<u8>> {
        create_request(0, Command::ProtocolVersion, &[])
    }

    pub fn decode(frame: &Frame) -> Result<Self> {
        Ok(Self {
            version: frame.version,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ManufacturerInfo {
    pub device_name: String,
    pub software_version: [u8; 2],
    pub manufacturer_name: String,
}

impl ManufacturerInfo {
    pub fn request() -> Result<Vec<u8>> {
        create_request(0, Command::ManufacturerInfo, &[])
    }

    pub fn decode(frame: &Frame) -> Result<Self> {
        Self::decode_info(&frame.info)
    }

    pub fn decode_info(info: &[u8]) -> Result<Self> {
        let mut reader = PayloadReader::new(info);
        let device_name = reader.text(10)?;
        let software_version = [reader.u8()?, reader.u8()?];
        let manufacturer_name = reader.text(20)?;
        reader.finish()?;
        Ok(Self {
            device_name,
            software_version,
            manufacturer_name,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct SystemParameters {
    pub cell_high_voltage_limit: f32,
    pub cell_low_voltage_limit: f32,
    pub cell_under_voltage_limit: f32,
    pub charge_high_temperature_limit: f32,
    pub charge_low_temperature_limit: f32,
    pub charge_current_limit: f32,
    pub module_high_voltage_limit: f32,
    pub module_low_voltage_limit: f32,
    pub module_under_voltage_limit: f32,
    pub discharge_high_temperature_limit: f32,
    pub discharge_low_temperature_limit: f32,
    pub discharge_current_limit: f32,
}

impl SystemParameters {
    pub fn request(dev_id: Option<u8>) -> Result<Vec<u8>> {
        match dev_id {
            Some(dev_id) => create_device_request(dev_id, Command::SystemParameters),
            None => create_request(DEFAULT_ADDRESS, Command::SystemParameters, &[]),
        }
    }

    pub fn decode(frame: &Frame) -> Result<Self> {
        Self::decode_info(strip_info_flag(&frame.info)?)
    }

    pub fn decode_info(info: &[u8]) -> Result<Self> {
        let mut reader = PayloadReader::new(info);
        let parameters = Self {
            cell_high_voltage_limit: reader.scaled_u16(TO_VOLT)?,
            cell_low_voltage_limit: reader.scaled_u16(TO_VOLT)?,
            cell_under_voltage_limit: reader.scaled_i16(TO_VOLT)?,
            charge_high_temperature_limit: reader.scaled_i16(TO_CELSIUS)?,
            charge_low_temperature_limit: reader.scaled_i16(TO_CELSIUS)?,
            charge_current_limit: reader.scaled_i16(DIVIDE_BY_10)?,
            module_high_voltage_limit: reader.scaled_u16(TO_VOLT)?,
            module_low_voltage_limit: reader.scaled_u16(TO_VOLT)?,
            module_under_voltage_limit: reader.scaled_u16(TO_VOLT)?,
            discharge_high_temperature_limit: reader.scaled_i16(TO_CELSIUS)?,
            discharge_low_temperature_limit: reader.scaled_i16(TO_CELSIUS)?,
            discharge_current_limit: reader.scaled_i16(DIVIDE_BY_10)?,
        };
        reader.finish()?;
        Ok(parameters)
    }
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ManagementStatus {
    pub charge_enable: bool,
    pub discharge_enable: bool,
    pub charge_immediately2: bool,
    pub charge_immediately1: bool,
    pub full_charge_request: bool,
    /// Set when any of the charge requests is raised.
    pub should_charge: bool,
}

impl From<u8> for ManagementStatus {
    fn from(byte: u8) -> Self {
        let charge_immediately2 = read_bit!(byte, 5);
        let charge_immediately1 = read_bit!(byte, 4);
        let full_charge_request = read_bit!(byte, 3);
        Self {
            charge_enable: read_bit!(byte, 7),
            discharge_enable: read_bit!(byte, 6),
            charge_immediately2,
            charge_immediately1,
            full_charge_request,
            should_charge: charge_immediately2 || charge_immediately1 || full_charge_request,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ManagementInfo {
    pub charge_voltage_limit: f32,
    pub discharge_voltage_limit: f32,
    pub charge_current_limit: f32,
    pub discharge_current_limit: f32,
    pub status: ManagementStatus,
}

impl ManagementInfo {
    pub fn request(dev_id: u8) -> Result<Vec<u8>> {
        create_device_request(dev_id, Command::ManagementInfo)
    }

    pub fn decode(frame: &Frame) -> Result<Self> {
        Self::decode_info(strip_info_flag(&frame.info)?)
    }

    pub fn decode_info(info: &[u8]) -> Result<Self> {
        let mut reader = PayloadReader::new(info);
        let management_info = Self {
            charge_voltage_limit: reader.scaled_u16(DIVIDE_BY_1000)?,
            discharge_voltage_limit: reader.scaled_u16(DIVIDE_BY_1000)?,
            charge_current_limit: reader.scaled_i16(TO_AMP)?,
            discharge_current_limit: reader.scaled_i16(TO_AMP)?,
            status: ManagementStatus::from(reader.u8()?),
        };
        reader.finish()?;
        Ok(management_info)
    }
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ModuleSerialNumber {
    pub command_value: u8,
    pub module_serial_number: String,
}

impl ModuleSerialNumber {
    const SERIAL_NUMBER_LENGTH: usize = 16;

    pub fn request(dev_id: Option<u8>) -> Result<Vec<u8>> {
        match dev_id {
            Some(dev_id) => create_device_request(dev_id, Command::ModuleSerialNumber),
            None => create_request(DEFAULT_ADDRESS, Command::ModuleSerialNumber, &[]),
        }
    }

    pub fn decode(frame: &Frame) -> Result<Self> {
        Self::decode_info(&frame.info)
    }

    pub fn decode_info(info: &[u8]) -> Result<Self> {
        let mut reader = PayloadReader::new(info);
        let command_value = reader.u8()?;
        let module_serial_number = reader.text(Self::SERIAL_NUMBER_LENGTH)?;
        reader.finish()?;
        Ok(Self {
            command_value,
            module_serial_number,
        })
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut writer = PayloadWriter::default();
        writer.u8(self.command_value);
        writer.text(&self.module_serial_number, Self::SERIAL_NUMBER_LENGTH)?;
        Ok(writer.into_inner())
    }
}

/// Analog values of one battery module.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ModuleValues {
    pub cell_voltages: Vec<f32>,
    pub average_bms_temperature: f32,
    pub grouped_cells_temperatures: Vec<f32>,
    pub current: f32, // negative=discharging, positive=charging
    pub voltage: f32,
    pub power: f32,
    /// Remaining capacity in Ah, taken from the extended fields when present.
    pub remaining_capacity: f32,
    /// Total capacity in Ah, taken from the extended fields when present.
    pub total_capacity: f32,
    pub cycle_number: u16,
}

impl ModuleValues {
    fn read(reader: &mut PayloadReader) -> Result<Self> {
        let n_cells = reader.u8()?;
        let cell_voltages = (0..n_cells)
            .map(|_| reader.scaled_i16(TO_VOLT))
            .collect::<Result<Vec<f32>>>()?;

        // The average BMS temperature is counted in the number of temperatures
        let n_temperatures = reader.u8()?;
        let average_bms_temperature = reader.scaled_i16(TO_CELSIUS)?;
        let grouped_cells_temperatures = (0..n_temperatures.saturating_sub(1))
            .map(|_| reader.scaled_i16(TO_CELSIUS))
            .collect::<Result<Vec<f32>>>()?;

        let current = reader.scaled_i16(TO_AMP)?;
        let voltage = reader.scaled_u16(TO_VOLT)?;
        let mut remaining_capacity = reader.scaled_u16(DIVIDE_BY_1000)?;
        let user_defined_items = reader.u8()?;
        let mut total_capacity = reader.scaled_u16(DIVIDE_BY_1000)?;
        let cycle_number = reader.u16()?;

        // Modules above 65 Ah report their capacities in additional 24 bit fields
        if user_defined_items > 2 {
            remaining_capacity = reader.scaled_u24(DIVIDE_BY_1000)?;
            total_capacity = reader.scaled_u24(DIVIDE_BY_1000)?;
        }

        Ok(Self {
            cell_voltages,
            average_bms_temperature,
            grouped_cells_temperatures,
            current,
            voltage,
            power: current * voltage,
            remaining_capacity,
            total_capacity,
            cycle_number,
        })
    }
}

fn state_of_charge<'a>(modules: impl Iterator<Item = &'a ModuleValues> + Clone) -> f32 {
    let remaining: f32 = modules.clone().map(|m| m.remaining_capacity).sum();
    let total: f32 = modules.map(|m| m.total_capacity).sum();
    if total == 0.0 {
        0.0
    } else {
        remaining / total
    }
}

/// Analog values of all modules, answered by the master module.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Values {
    pub modules: Vec<ModuleValues>,
    pub total_power: f32,
    /// Remaining capacity over total capacity of all modules, `0.0..=1.0`.
    pub state_of_charge: f32,
}

impl Values {
    pub fn request() -> Result<Vec<u8>> {
        create_request(DEFAULT_ADDRESS, Command::GetValues, b"FF")
    }

    pub fn decode(frame: &Frame) -> Result<Self> {
        Self::decode_info(strip_info_flag(&frame.info)?)
    }

    pub fn decode_info(info: &[u8]) -> Result<Self> {
        let mut reader = PayloadReader::new(info);
        let n_modules = reader.u8()?;
        let modules = (0..n_modules)
            .map(|_| ModuleValues::read(&mut reader))
            .collect::<Result<Vec<ModuleValues>>>()?;
        reader.finish()?;
        Ok(Self {
            total_power: modules.iter().map(|m| m.power).sum(),
            state_of_charge: state_of_charge(modules.iter()),
            modules,
        })
    }
}

/// Analog values of a single module.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ValuesSingle {
    pub number_of_module: u8,
    pub module: ModuleValues,
    pub total_power: f32,
    pub state_of_charge: f32,
}

impl ValuesSingle {
    pub fn request(dev_id: u8) -> Result<Vec<u8>> {
        create_device_request(dev_id, Command::GetValues)
    }

    pub fn decode(frame: &Frame) -> Result<Self> {
        Self::decode_info(strip_info_flag(&frame.info)?)
    }

    pub fn decode_info(info: &[u8]) -> Result<Self> {
        let mut reader = PayloadReader::new(info);
        let number_of_module = reader.u8()?;
        let module = ModuleValues::read(&mut reader)?;
        reader.finish()?;
        Ok(Self {
            number_of_module,
            total_power: module.power,
            state_of_charge: state_of_charge(std::iter::once(&module)),
            module,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ProtectionStatus {
    pub pack_under_voltage: bool,
    pub charge_temperature_protection: bool,
    pub discharge_temperature_protection: bool,
    pub discharge_overcurrent: bool,
    pub charge_overcurrent: bool,
    pub cell_lower_limit_voltage: bool,
    pub over_voltage: bool,
}

impl From<u8> for ProtectionStatus {
    fn from(byte: u8) -> Self {
        Self {
            pack_under_voltage: read_bit!(byte, 7),
            charge_temperature_protection: read_bit!(byte, 6),
            discharge_temperature_protection: read_bit!(byte, 5),
            discharge_overcurrent: read_bit!(byte, 4),
            charge_overcurrent: read_bit!(byte, 2),
            cell_lower_limit_voltage: read_bit!(byte, 1),
            over_voltage: read_bit!(byte, 0),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct SwitchStatus {
    pub use_the_pack_power: bool,
    pub discharge_fet: bool,
    pub charge_fet: bool,
    pub pre_fet: bool,
}

impl From<u8> for SwitchStatus {
    fn from(byte: u8) -> Self {
        Self {
            use_the_pack_power: read_bit!(byte, 3),
            discharge_fet: read_bit!(byte, 2),
            charge_fet: read_bit!(byte, 1),
            pre_fet: read_bit!(byte, 0),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct SystemStatus {
    pub effective_charge_current: bool,
    pub effective_discharge_current: bool,
    pub start_up_heater: bool,
    pub fully_charged: bool,
    pub buzzer: bool,
}

impl From<u8> for SystemStatus {
    fn from(byte: u8) -> Self {
        Self {
            effective_charge_current: read_bit!(byte, 7),
            effective_discharge_current: read_bit!(byte, 6),
            start_up_heater: read_bit!(byte, 5),
            fully_charged: read_bit!(byte, 3),
            buzzer: read_bit!(byte, 0),
        }
    }
}

fn bit_array(byte: u8) -> [bool; 8] {
    std::array::from_fn(|i| read_bit!(byte, 7 - i))
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct AlarmInfo {
    pub number_of_module: u8,
    /// Raw alarm state per cell.
    pub cell_voltages: Vec<u8>,
    /// Raw alarm state per temperature sensor.
    pub temperatures: Vec<u8>,
    pub charge_current: u8,
    pub pack_voltage: u8,
    pub discharge_current: u8,
    pub status1: ProtectionStatus,
    pub status2: SwitchStatus,
    pub status3: SystemStatus,
    /// Cell threshold flags in wire order, cell 8 first.
    pub check_cells_8_to_1: [bool; 8],
    /// Cell threshold flags in wire order, cell 16 first.
    pub check_cells_16_to_9: [bool; 8],
}

impl AlarmInfo {
    pub fn request(dev_id: Option<u8>) -> Result<Vec<u8>> {
        create_device_request(dev_id.unwrap_or(DEFAULT_ADDRESS), Command::AlarmInfo)
    }

    pub fn decode(frame: &Frame) -> Result<Self> {
        Self::decode_info(strip_info_flag(&frame.info)?)
    }

    pub fn decode_info(info: &[u8]) -> Result<Self> {
        let mut reader = PayloadReader::new(info);
        let number_of_module = reader.u8()?;
        let n_cells = usize::from(reader.u8()?);
        let cell_voltages = reader.take(n_cells)?.to_vec();
        let n_temperatures = usize::from(reader.u8()?);
        let temperatures = reader.take(n_temperatures)?.to_vec();
        let alarm_info = Self {
            number_of_module,
            cell_voltages,
            temperatures,
            charge_current: reader.u8()?,
            pack_voltage: reader.u8()?,
            discharge_current: reader.u8()?,
            status1: ProtectionStatus::from(reader.u8()?),
            status2: SwitchStatus::from(reader.u8()?),
            status3: SystemStatus::from(reader.u8()?),
            check_cells_8_to_1: bit_array(reader.u8()?),
            check_cells_16_to_9: bit_array(reader.u8()?),
        };
        reader.finish()?;
        Ok(alarm_info)
    }

    /// Threshold flag of `cell`, counted from 1.
    pub fn cell_check(&self, cell: usize) -> Option<bool> {
        match cell {
            1..=8 => Some(self.check_cells_8_to_1[8 - cell]),
            9..=16 => Some(self.check_cells_16_to_9[16 - cell]),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct SystemAnalogData {
    pub total_average_voltage: f32,
    pub total_current: f32,
    pub system_soc: u8,
    pub average_number_of_cycles: u16,
    pub maximum_number_of_cycles: u16,
    pub average_soh: u8,
    pub minimum_soh: u8,
    pub single_core_maximum_voltage: f32,
    pub module_with_highest_voltage_of_single_core: u16,
    pub single_core_minimum_voltage: f32,
    pub module_with_lowest_voltage_of_single_core: u16,
    pub single_core_average_temperature: f32,
    pub single_core_maximum_temperature: f32,
    pub module_with_highest_temperature_of_single_core: u16,
    pub single_core_minimum_temperature: f32,
    pub module_with_lowest_temperature_of_single_core: u16,
    pub mosfet_average_temperature: f32,
    pub mosfet_maximum_temperature: f32,
    pub mosfet_highest_temperature_module: u16,
    pub mosfet_minimum_temperature: f32,
    pub mosfet_lowest_temperature_module: u16,
    pub bms_average_temperature: f32,
    pub bms_maximum_temperature: f32,
    pub bms_highest_temperature_module: u16,
    pub bms_minimum_temperature: f32,
    pub bms_lowest_temperature_module: u16,
}

impl SystemAnalogData {
    pub fn request(dev_id: Option<u8>) -> Result<Vec<u8>> {
        create_request(
            dev_id.unwrap_or(DEFAULT_ADDRESS),
            Command::SystemAnalogData,
            &[],
        )
    }

    pub fn decode(frame: &Frame) -> Result<Self> {
        Self::decode_info(&frame.info)
    }

    pub fn decode_info(info: &[u8]) -> Result<Self> {
        let mut reader = PayloadReader::new(info);
        let data = Self {
            total_average_voltage: reader.scaled_u16(TO_VOLT)?,
            total_current: reader.scaled_i16(DIVIDE_BY_1000)?,
            system_soc: reader.u8()?,
            average_number_of_cycles: reader.u16()?,
            maximum_number_of_cycles: reader.u16()?,
            average_soh: reader.u8()?,
            minimum_soh: reader.u8()?,
            single_core_maximum_voltage: reader.scaled_u16(TO_VOLT)?,
            module_with_highest_voltage_of_single_core: reader.u16()?,
            single_core_minimum_voltage: reader.scaled_u16(TO_VOLT)?,
            module_with_lowest_voltage_of_single_core: reader.u16()?,
            single_core_average_temperature: reader.scaled_i16(TO_CELSIUS)?,
            single_core_maximum_temperature: reader.scaled_i16(TO_CELSIUS)?,
            module_with_highest_temperature_of_single_core: reader.u16()?,
            single_core_minimum_temperature: reader.scaled_i16(TO_CELSIUS)?,
            module_with_lowest_temperature_of_single_core: reader.u16()?,
            mosfet_average_temperature: reader.scaled_i16(TO_CELSIUS)?,
            mosfet_maximum_temperature: reader.scaled_i16(TO_CELSIUS)?,
            mosfet_highest_temperature_module: reader.u16()?,
            mosfet_minimum_temperature: reader.scaled_i16(TO_CELSIUS)?,
            mosfet_lowest_temperature_module: reader.u16()?,
            bms_average_temperature: reader.scaled_i16(TO_CELSIUS)?,
            bms_maximum_temperature: reader.scaled_i16(TO_CELSIUS)?,
            bms_highest_temperature_module: reader.u16()?,
            bms_minimum_temperature: reader.scaled_i16(TO_CELSIUS)?,
            bms_lowest_temperature_module: reader.u16()?,
        };
        reader.finish()?;
        Ok(data)
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut writer = PayloadWriter::default();
        writer.scaled_u16(TO_VOLT, self.total_average_voltage)?;
        writer.scaled_i16(DIVIDE_BY_1000, self.total_current)?;
        writer.u8(self.system_soc);
        writer.u16(self.average_number_of_cycles);
        writer.u16(self.maximum_number_of_cycles);
        writer.u8(self.average_soh);
        writer.u8(self.minimum_soh);
        writer.scaled_u16(TO_VOLT, self.single_core_maximum_voltage)?;
        writer.u16(self.module_with_highest_voltage_of_single_core);
        writer.scaled_u16(TO_VOLT, self.single_core_minimum_voltage)?;
        writer.u16(self.module_with_lowest_voltage_of_single_core);
        writer.scaled_i16(TO_CELSIUS, self.single_core_average_temperature)?;
        writer.scaled_i16(TO_CELSIUS, self.single_core_maximum_temperature)?;
        writer.u16(self.module_with_highest_temperature_of_single_core);
        writer.scaled_i16(TO_CELSIUS, self.single_core_minimum_temperature)?;
        writer.u16(self.module_with_lowest_temperature_of_single_core);
        writer.scaled_i16(TO_CELSIUS, self.mosfet_average_temperature)?;
        writer.scaled_i16(TO_CELSIUS, self.mosfet_maximum_temperature)?;
        writer.u16(self.mosfet_highest_temperature_module);
        writer.scaled_i16(TO_CELSIUS, self.mosfet_minimum_temperature)?;
        writer.u16(self.mosfet_lowest_temperature_module);
        writer.scaled_i16(TO_CELSIUS, self.bms_average_temperature)?;
        writer.scaled_i16(TO_CELSIUS, self.bms_maximum_temperature)?;
        writer.u16(self.bms_highest_temperature_module);
        writer.scaled_i16(TO_CELSIUS, self.bms_minimum_temperature)?;
        writer.u16(self.bms_lowest_temperature_module);
        Ok(writer.into_inner())
    }
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ChargeDischargeStatus {
    pub charge_enable: bool,
    pub discharge_enable: bool,
    pub charge_immediately: bool,
    pub full_charge_request: bool,
}

impl From<u8> for ChargeDischargeStatus {
    fn from(byte: u8) -> Self {
        Self {
            charge_enable: read_bit!(byte, 7),
            discharge_enable: read_bit!(byte, 6),
            charge_immediately: read_bit!(byte, 5),
            full_charge_request: read_bit!(byte, 4),
        }
    }
}

impl From<&ChargeDischargeStatus> for u8 {
    fn from(status: &ChargeDischargeStatus) -> Self {
        set_bit!(status.charge_enable, 7)
            | set_bit!(status.discharge_enable, 6)
            | set_bit!(status.charge_immediately, 5)
            | set_bit!(status.full_charge_request, 4)
    }
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ChargeDischargeManagementInfo {
    pub charge_voltage_limit: f32,
    pub discharge_voltage_limit: f32,
    pub charge_current_limit: f32,
    pub discharge_current_limit: f32,
    pub status: ChargeDischargeStatus,
}

impl ChargeDischargeManagementInfo {
    pub fn request(dev_id: Option<u8>) -> Result<Vec<u8>> {
        create_request(
            dev_id.unwrap_or(DEFAULT_ADDRESS),
            Command::ChargeDischargeManagementInfo,
            &[],
        )
    }

    pub fn decode(frame: &Frame) -> Result<Self> {
        Self::decode_info(&frame.info)
    }

    pub fn decode_info(info: &[u8]) -> Result<Self> {
        let mut reader = PayloadReader::new(info);
        let management_info = Self {
            charge_voltage_limit: reader.scaled_u16(TO_VOLT)?,
            discharge_voltage_limit: reader.scaled_u16(TO_VOLT)?,
            charge_current_limit: reader.scaled_i16(DIVIDE_BY_100)?,
            discharge_current_limit: reader.scaled_i16(DIVIDE_BY_100)?,
            status: ChargeDischargeStatus::from(reader.u8()?),
        };
        reader.finish()?;
        Ok(management_info)
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut writer = PayloadWriter::default();
        writer.scaled_u16(TO_VOLT, self.charge_voltage_limit)?;
        writer.scaled_u16(TO_VOLT, self.discharge_voltage_limit)?;
        writer.scaled_i16(DIVIDE_BY_100, self.charge_current_limit)?;
        writer.scaled_i16(DIVIDE_BY_100, self.discharge_current_limit)?;
        writer.u8(u8::from(&self.status));
        Ok(writer.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn be16(value: i32) -> [u8; 2] {
        (value as u16).to_be_bytes()
    }

    #[test]
    fn scaling_laws() {
        assert_eq!(TO_VOLT.decode(1000), 1.0);
        assert_eq!(TO_AMP.decode(10), 1.0);
        assert_eq!(TO_CELSIUS.decode(2731), 0.0);
        assert_eq!(TO_CELSIUS.decode(2741), 1.0);
        assert_eq!(TO_CELSIUS.decode(2631), -10.0);
        assert_eq!(DIVIDE_BY_100.decode(2500), 25.0);
        assert_eq!(TO_CELSIUS.encode(25.5), 2986);
        assert_eq!(TO_VOLT.encode(3.512), 3512);
        assert_eq!(DIVIDE_BY_1000.encode(-1.5), -1500);
    }

    #[test]
    fn command_codes() {
        assert_eq!(Command::ProtocolVersion as u8, 0x4F);
        assert_eq!(Command::try_from(0x93), Ok(Command::ModuleSerialNumber));
        assert_eq!(Command::try_from(0x00), Err(0x00));
    }

    #[test]
    fn requests() {
        assert_eq!(
            ProtocolVersion::request().unwrap(),
            b"~2000464F0000FD9A\r".to_vec()
        );
        assert_eq!(
            Values::request().unwrap(),
            frame::encode_command(2, 0x42, b"FF").unwrap()
        );
        assert_eq!(
            ManagementInfo::request(0x12).unwrap(),
            frame::encode_command(0x12, 0x92, b"12").unwrap()
        );
        assert_eq!(
            SystemParameters::request(None).unwrap(),
            frame::encode_command(2, 0x47, &[]).unwrap()
        );
        assert_eq!(
            AlarmInfo::request(None).unwrap(),
            frame::encode_command(2, 0x44, b"02").unwrap()
        );
        assert_eq!(
            ChargeDischargeManagementInfo::request(Some(0x12)).unwrap(),
            frame::encode_command(0x12, 0x63, &[]).unwrap()
        );
    }

    #[test]
    fn manufacturer_info() {
        let mut info = b"US2000C\0\0\0".to_vec();
        info.extend_from_slice(&[0x01, 0x02]);
        let mut manufacturer = b"PYLON".to_vec();
        manufacturer.resize(20, b' ');
        info.extend_from_slice(&manufacturer);
        let decoded = ManufacturerInfo::decode_info(&info).unwrap();
        assert_eq!(decoded.device_name, "US2000C");
        assert_eq!(decoded.software_version, [1, 2]);
        assert_eq!(decoded.manufacturer_name, "PYLON");
    }

    #[test]
    fn manufacturer_info_truncated() {
        assert!(matches!(
            ManufacturerInfo::decode_info(b"US2000C\0\0\0\x01"),
            Err(Error::TruncatedPayload {
                needed: 1,
                remaining: 0
            })
        ));
    }

    #[test]
    fn system_parameters() {
        let mut info = vec![0x11];
        for raw in [
            3700, 3050, 2900, 3331, 2731, 1020, 54000, 48000, 45000, 3331, 2631, -1020,
        ] {
            info.extend_from_slice(&be16(raw));
        }
        let frame = Frame::new(2, frame::CID1, 0, info).unwrap();
        let parameters = SystemParameters::decode(&frame).unwrap();
        assert_eq!(parameters.cell_high_voltage_limit, 3.7);
        assert_eq!(parameters.cell_low_voltage_limit, 3.05);
        assert_eq!(parameters.cell_under_voltage_limit, 2.9);
        assert_eq!(parameters.charge_high_temperature_limit, 60.0);
        assert_eq!(parameters.charge_low_temperature_limit, 0.0);
        assert_eq!(parameters.charge_current_limit, 102.0);
        assert_eq!(parameters.module_high_voltage_limit, 54.0);
        assert_eq!(parameters.module_low_voltage_limit, 48.0);
        assert_eq!(parameters.module_under_voltage_limit, 45.0);
        assert_eq!(parameters.discharge_high_temperature_limit, 60.0);
        assert_eq!(parameters.discharge_low_temperature_limit, -10.0);
        assert_eq!(parameters.discharge_current_limit, -102.0);
    }

    #[test]
    fn management_info_should_charge() {
        let mut info = vec![0x00];
        info.extend_from_slice(&be16(53250));
        info.extend_from_slice(&be16(47000));
        info.extend_from_slice(&be16(250));
        info.extend_from_slice(&be16(-250));
        info.push(0b1101_0000);
        let frame = Frame::new(2, frame::CID1, 0, info.clone()).unwrap();
        let decoded = ManagementInfo::decode(&frame).unwrap();
        assert_eq!(decoded.charge_voltage_limit, 53.25);
        assert_eq!(decoded.discharge_voltage_limit, 47.0);
        assert_eq!(decoded.charge_current_limit, 25.0);
        assert_eq!(decoded.discharge_current_limit, -25.0);
        assert_eq!(
            decoded.status,
            ManagementStatus {
                charge_enable: true,
                discharge_enable: true,
                charge_immediately2: false,
                charge_immediately1: true,
                full_charge_request: false,
                should_charge: true,
            }
        );

        *info.last_mut().unwrap() = 0b1100_0111;
        let decoded = ManagementInfo::decode_info(&info[1..]).unwrap();
        assert!(!decoded.status.should_charge);
    }

    #[test]
    fn management_info_trailing_bytes() {
        let info = [0u8; 10];
        assert!(matches!(
            ManagementInfo::decode_info(&info),
            Err(Error::PayloadLengthMismatch {
                expected: 9,
                actual: 10
            })
        ));
    }

    #[test]
    fn missing_info_flag() {
        let frame = Frame::new(2, frame::CID1, 0, vec![]).unwrap();
        assert!(matches!(
            ManagementInfo::decode(&frame),
            Err(Error::TruncatedPayload {
                needed: 1,
                remaining: 0
            })
        ));
    }

    #[test]
    fn module_serial_number_round_trip() {
        let serial = ModuleSerialNumber {
            command_value: 0x02,
            module_serial_number: "PPTAP0102305123".to_string(),
        };
        let info = serial.encode().unwrap();
        assert_eq!(info.len(), 17);
        assert_eq!(ModuleSerialNumber::decode_info(&info).unwrap(), serial);

        let too_long = ModuleSerialNumber {
            command_value: 0x02,
            module_serial_number: "X".repeat(17),
        };
        assert!(matches!(too_long.encode(), Err(Error::RangeError)));
    }

    fn module_info(user_defined_items: u8, remaining: u16, total: u16) -> Vec<u8> {
        let mut info = vec![3];
        for mv in [3300, 3310, 3320] {
            info.extend_from_slice(&be16(mv));
        }
        info.push(3);
        for t in [2981, 2991, 3001] {
            info.extend_from_slice(&be16(t));
        }
        info.extend_from_slice(&be16(-20)); // -2.0 A
        info.extend_from_slice(&be16(50000)); // 50.0 V
        info.extend_from_slice(&remaining.to_be_bytes());
        info.push(user_defined_items);
        info.extend_from_slice(&total.to_be_bytes());
        info.extend_from_slice(&be16(42));
        if user_defined_items > 2 {
            info.extend_from_slice(&[0x01, 0x86, 0xA0]); // 100000
            info.extend_from_slice(&[0x01, 0xD4, 0xC0]); // 120000
        }
        info
    }

    #[test]
    fn values_single_primary_capacity() {
        let mut info = vec![0x02];
        info.extend(module_info(2, 25000, 50000));
        let values = ValuesSingle::decode_info(&info).unwrap();
        assert_eq!(values.number_of_module, 2);
        let module = &values.module;
        assert_eq!(module.cell_voltages, vec![3.3f32, 3.31, 3.32]);
        assert_eq!(module.average_bms_temperature, 25.0);
        assert_eq!(module.grouped_cells_temperatures, vec![26.0f32, 27.0]);
        assert_eq!(module.current, -2.0);
        assert_eq!(module.voltage, 50.0);
        assert_eq!(module.power, -100.0);
        assert_eq!(module.remaining_capacity, 25.0);
        assert_eq!(module.total_capacity, 50.0);
        assert_eq!(module.cycle_number, 42);
        assert_eq!(values.total_power, -100.0);
        assert_eq!(values.state_of_charge, 0.5);
    }

    #[test]
    fn values_single_extended_capacity_overrides_primary() {
        let mut info = vec![0x02];
        info.extend(module_info(4, 0xFFFF, 0xFFFF));
        let values = ValuesSingle::decode_info(&info).unwrap();
        assert_eq!(values.module.remaining_capacity, 100.0);
        assert_eq!(values.module.total_capacity, 120.0);
    }

    #[test]
    fn values_single_missing_extended_capacity() {
        let mut info = vec![0x02];
        let mut module = module_info(3, 1000, 2000);
        module.truncate(module.len() - 6);
        info.extend(module);
        assert!(matches!(
            ValuesSingle::decode_info(&info),
            Err(Error::TruncatedPayload {
                needed: 3,
                remaining: 0
            })
        ));
    }

    #[test]
    fn values_batch_aggregates() {
        let mut info = vec![0x11, 2];
        info.extend(module_info(2, 25000, 50000));
        info.extend(module_info(3, 0, 0));
        let frame = Frame::new(2, frame::CID1, 0, info).unwrap();
        let values = Values::decode(&frame).unwrap();
        assert_eq!(values.modules.len(), 2);
        assert_eq!(values.total_power, -200.0);
        // (25 + 100) / (50 + 120)
        assert_eq!(values.state_of_charge, 125.0f32 / 170.0);
    }

    #[test]
    fn values_batch_without_capacity() {
        let info = [0u8];
        let values = Values::decode_info(&info).unwrap();
        assert!(values.modules.is_empty());
        assert_eq!(values.total_power, 0.0);
        assert_eq!(values.state_of_charge, 0.0);
    }

    #[test]
    fn alarm_info() {
        let info = [
            0x00, // info flag
            0x02, // module
            0x03, 0x00, 0x01, 0x02, // cells
            0x02, 0x00, 0xF0, // temperatures
            0x00, 0x01, 0x02, // charge, pack voltage, discharge
            0b1001_0101,
            0b0000_0110,
            0b1000_1001,
            0b1000_0001,
            0b0100_0000,
        ];
        let frame = Frame::new(2, frame::CID1, 0, info.to_vec()).unwrap();
        let alarm = AlarmInfo::decode(&frame).unwrap();
        assert_eq!(alarm.number_of_module, 2);
        assert_eq!(alarm.cell_voltages, vec![0, 1, 2]);
        assert_eq!(alarm.temperatures, vec![0x00, 0xF0]);
        assert_eq!(alarm.pack_voltage, 1);
        assert_eq!(alarm.discharge_current, 2);
        assert_eq!(
            alarm.status1,
            ProtectionStatus {
                pack_under_voltage: true,
                charge_temperature_protection: false,
                discharge_temperature_protection: false,
                discharge_overcurrent: true,
                charge_overcurrent: true,
                cell_lower_limit_voltage: false,
                over_voltage: true,
            }
        );
        assert!(alarm.status2.discharge_fet);
        assert!(alarm.status2.charge_fet);
        assert!(!alarm.status2.pre_fet);
        assert!(alarm.status3.effective_charge_current);
        assert!(alarm.status3.fully_charged);
        assert!(alarm.status3.buzzer);
        assert!(!alarm.status3.start_up_heater);
        assert_eq!(
            alarm.check_cells_8_to_1,
            [true, false, false, false, false, false, false, true]
        );
        assert_eq!(alarm.cell_check(8), Some(true));
        assert_eq!(alarm.cell_check(1), Some(true));
        assert_eq!(alarm.cell_check(2), Some(false));
        assert_eq!(alarm.cell_check(15), Some(true));
        assert_eq!(alarm.cell_check(16), Some(false));
        assert_eq!(alarm.cell_check(17), None);
    }

    #[test]
    fn system_analog_data_encoding() {
        let info = crate::emulator::sample_system_analog_data().encode().unwrap();
        assert_eq!(info.len(), 49);
        assert_eq!(&info[..5], &[0xCD, 0x78, 0x61, 0xA8, 99]);
        let decoded = SystemAnalogData::decode_info(&info).unwrap();
        assert_eq!(decoded.module_with_lowest_voltage_of_single_core, 20);
        assert_eq!(decoded.bms_lowest_temperature_module, 23);
        assert_eq!(decoded.system_soc, 99);
        assert!((decoded.single_core_maximum_temperature - 26.8).abs() < 1e-4);
        assert!((decoded.total_average_voltage - 52.6).abs() < 1e-4);
    }

    #[test]
    fn system_analog_data_out_of_range() {
        let mut data = crate::emulator::sample_system_analog_data();
        data.total_current = 40.0; // 40000 does not fit a signed 16 bit field
        assert!(matches!(data.encode(), Err(Error::RangeError)));
    }

    #[test]
    fn charge_discharge_management_info() {
        let info = ChargeDischargeManagementInfo {
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
        };
        let encoded = info.encode().unwrap();
        assert_eq!(
            encoded,
            vec![0xCF, 0x08, 0xBB, 0x80, 0x09, 0xC4, 0x09, 0x60, 0xC0]
        );
        assert_eq!(
            ChargeDischargeManagementInfo::decode_info(&encoded).unwrap(),
            info
        );
    }
}
