use anyhow::{Context, Result};
use clap::Parser;
use commandline::{CliArgs, CliCommands, OutputFormat};
use flexi_logger::{Logger, LoggerHandle};
use log::*;
use pylontech_lib::emulator::Emulator;
use pylontech_lib::serialport::{open_port, PylontechBms};
use serde::Serialize;
use std::{fmt::Debug, ops::Deref, panic};

mod commandline;

fn logging_init(loglevel: LevelFilter) -> LoggerHandle {
    let log_handle = Logger::try_with_env_or_str(loglevel.as_str())
        .expect("Cannot init logging")
        .start()
        .expect("Cannot start logging");

    panic::set_hook(Box::new(|panic_info| {
        let (filename, line, column) = panic_info
            .location()
            .map(|loc| (loc.file(), loc.line(), loc.column()))
            .unwrap_or(("<unknown>", 0, 0));
        let cause = panic_info
            .payload()
            .downcast_ref::<String>()
            .map(String::deref);
        let cause = cause.unwrap_or_else(|| {
            panic_info
                .payload()
                .downcast_ref::<&str>()
                .copied()
                .unwrap_or("<cause unknown>")
        });

        error!(
            "Thread '{}' panicked at {}:{}:{}: {}",
            std::thread::current().name().unwrap_or("<unknown>"),
            filename,
            line,
            column,
            cause
        );
    }));
    log_handle
}

fn print_record<T: Debug + Serialize>(format: OutputFormat, label: &str, record: &T) -> Result<()> {
    match format {
        OutputFormat::Debug => println!("{label}: {record:?}"),
        OutputFormat::Json => println!(
            "{}",
            serde_json::to_string_pretty(record)
                .with_context(|| format!("Cannot serialize {label}"))?
        ),
    }
    Ok(())
}

macro_rules! print_protocol_version {
    ($bms:expr, $format:expr) => {
        print_record(
            $format,
            "Protocol version",
            &$bms
                .get_protocol_version()
                .with_context(|| "Cannot get protocol version")?,
        )?
    };
}
macro_rules! print_manufacturer_info {
    ($bms:expr, $format:expr) => {
        print_record(
            $format,
            "Manufacturer info",
            &$bms
                .get_manufacturer_info()
                .with_context(|| "Cannot get manufacturer info")?,
        )?
    };
}
macro_rules! print_system_parameters {
    ($bms:expr, $format:expr, $dev_id:expr) => {
        print_record(
            $format,
            "System parameters",
            &$bms
                .get_system_parameters($dev_id)
                .with_context(|| "Cannot get system parameters")?,
        )?
    };
}
macro_rules! print_management_info {
    ($bms:expr, $format:expr, $dev_id:expr) => {
        print_record(
            $format,
            "Management info",
            &$bms
                .get_management_info($dev_id)
                .with_context(|| "Cannot get management info")?,
        )?
    };
}
macro_rules! print_serial_number {
    ($bms:expr, $format:expr, $dev_id:expr) => {
        print_record(
            $format,
            "Serial number",
            &$bms
                .get_module_serial_number($dev_id)
                .with_context(|| "Cannot get module serial number")?,
        )?
    };
}
macro_rules! print_values {
    ($bms:expr, $format:expr) => {
        print_record(
            $format,
            "Values",
            &$bms.get_values().with_context(|| "Cannot get values")?,
        )?
    };
}
macro_rules! print_values_single {
    ($bms:expr, $format:expr, $dev_id:expr) => {
        print_record(
            $format,
            "Values",
            &$bms
                .get_values_single($dev_id)
                .with_context(|| "Cannot get module values")?,
        )?
    };
}
macro_rules! print_alarm_info {
    ($bms:expr, $format:expr, $dev_id:expr) => {
        print_record(
            $format,
            "Alarm info",
            &$bms
                .get_alarm_info($dev_id)
                .with_context(|| "Cannot get alarm info")?,
        )?
    };
}
macro_rules! print_analog_data {
    ($bms:expr, $format:expr, $dev_id:expr) => {
        print_record(
            $format,
            "Analog data",
            &$bms
                .get_system_analog_data($dev_id)
                .with_context(|| "Cannot get system analog data")?,
        )?
    };
}
macro_rules! print_charge_discharge_info {
    ($bms:expr, $format:expr, $dev_id:expr) => {
        print_record(
            $format,
            "Charge/discharge info",
            &$bms
                .get_charge_discharge_management_info($dev_id)
                .with_context(|| "Cannot get charge/discharge management info")?,
        )?
    };
}

fn open_bms(args: &CliArgs) -> Result<PylontechBms> {
    let mut bms = PylontechBms::open(&args.device, args.baud_rate)
        .with_context(|| format!("Cannot open serial port '{}'", args.device))?;
    bms.set_timeout(args.timeout)?;
    bms.set_delay(args.delay);
    Ok(bms)
}

fn main() -> Result<()> {
    let args = CliArgs::parse();

    let _log_handle = logging_init(args.verbose.log_level_filter());

    let format = args.format;
    match args.command.clone() {
        CliCommands::ProtocolVersion => print_protocol_version!(open_bms(&args)?, format),
        CliCommands::ManufacturerInfo => print_manufacturer_info!(open_bms(&args)?, format),
        CliCommands::SystemParameters { dev_id } => {
            print_system_parameters!(open_bms(&args)?, format, dev_id)
        }
        CliCommands::ManagementInfo { dev_id } => {
            print_management_info!(open_bms(&args)?, format, dev_id)
        }
        CliCommands::SerialNumber { dev_id } => {
            print_serial_number!(open_bms(&args)?, format, dev_id)
        }
        CliCommands::Values => print_values!(open_bms(&args)?, format),
        CliCommands::ValuesSingle { dev_id } => {
            print_values_single!(open_bms(&args)?, format, dev_id)
        }
        CliCommands::AlarmInfo { dev_id } => print_alarm_info!(open_bms(&args)?, format, dev_id),
        CliCommands::AnalogData { dev_id } => {
            print_analog_data!(open_bms(&args)?, format, dev_id)
        }
        CliCommands::ChargeDischargeInfo { dev_id } => {
            print_charge_discharge_info!(open_bms(&args)?, format, dev_id)
        }
        CliCommands::Scan { start, end } => {
            let batteries = open_bms(&args)?
                .scan(start, end)
                .with_context(|| format!("Cannot scan addresses {start}..{end}"))?;
            info!("Found {} batteries", batteries.len());
            print_record(format, "Batteries", &batteries)?;
        }
        CliCommands::All { dev_id } => {
            let mut bms = open_bms(&args)?;
            print_protocol_version!(bms, format);
            print_manufacturer_info!(bms, format);
            print_system_parameters!(bms, format, Some(dev_id));
            print_management_info!(bms, format, dev_id);
            print_serial_number!(bms, format, Some(dev_id));
            print_values_single!(bms, format, dev_id);
            print_alarm_info!(bms, format, Some(dev_id));
            print_analog_data!(bms, format, Some(dev_id));
            print_charge_discharge_info!(bms, format, Some(dev_id));
        }
        CliCommands::Emulate => {
            let port = open_port(&args.device, args.baud_rate)
                .with_context(|| format!("Cannot open serial port '{}'", args.device))?;
            info!("Emulating BMS on {}", args.device);
            Emulator::with_sample_data()?
                .run(port)
                .with_context(|| "Emulator stopped")?;
        }
    }

    Ok(())
}
