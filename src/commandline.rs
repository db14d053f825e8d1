use clap::{Parser, Subcommand};
use clap_verbosity_flag::{InfoLevel, Verbosity};
use std::time::Duration;

fn default_device_name() -> String {
    if cfg!(target_os = "windows") {
        String::from("COM1")
    } else {
        String::from("/dev/ttyUSB0")
    }
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum CliCommands {
    /// Show the protocol version reported by the BMS
    ProtocolVersion,
    /// Show device name, software version and manufacturer
    ManufacturerInfo,
    /// Show cell, module and temperature limits
    SystemParameters {
        /// Address of the battery module
        #[arg(long)]
        dev_id: Option<u8>,
    },
    /// Show charge/discharge voltage and current limits of one module
    ManagementInfo {
        /// Address of the battery module
        #[arg(long)]
        dev_id: u8,
    },
    /// Show the serial number of a module
    SerialNumber {
        /// Address of the battery module
        #[arg(long)]
        dev_id: Option<u8>,
    },
    /// Show analog values of all modules with total power and state of charge
    Values,
    /// Show analog values of one module
    ValuesSingle {
        /// Address of the battery module
        #[arg(long)]
        dev_id: u8,
    },
    /// Show alarm and protection state
    AlarmInfo {
        /// Address of the battery module
        #[arg(long)]
        dev_id: Option<u8>,
    },
    /// Show aggregated system analog data
    AnalogData {
        /// Address of the battery module
        #[arg(long)]
        dev_id: Option<u8>,
    },
    /// Show charge/discharge management limits and flags
    ChargeDischargeInfo {
        /// Address of the battery module
        #[arg(long)]
        dev_id: Option<u8>,
    },
    /// Query a range of addresses for battery modules
    Scan {
        /// First address to query
        #[arg(long, default_value = "0")]
        start: u8,
        /// Address after the last one to query
        #[arg(long, default_value = "255")]
        end: u8,
    },
    /// Show all available information of one module by running every read command
    All {
        /// Address of the battery module
        #[arg(long)]
        dev_id: u8,
    },
    /// Emulate a BMS on the serial port, answering with sample data
    Emulate,
}

#[derive(clap::ValueEnum, Debug, Clone, Copy, PartialEq)]
pub enum OutputFormat {
    /// Rust debug representation
    Debug,
    /// Pretty printed JSON
    Json,
}

const fn about_text() -> &'static str {
    "pylontech bms command line tool"
}

#[derive(Parser, Debug)]
#[command(version, about=about_text(), long_about = None)]
pub struct CliArgs {
    #[command(flatten)]
    pub verbose: Verbosity<InfoLevel>,

    /// Serial port device path (e.g., /dev/ttyUSB0 on Linux, COM1 on Windows)
    #[arg(short, long, default_value_t = default_device_name())]
    pub device: String,

    /// Serial port baud rate
    #[arg(short, long, default_value = "9600")]
    pub baud_rate: u32,

    #[command(subcommand)]
    pub command: CliCommands,

    /// Timeout for reading a response (e.g., "500ms", "1s", "2s 500ms")
    #[arg(value_parser = humantime::parse_duration, long, default_value = "2s")]
    pub timeout: Duration,

    // RS485 dongles need some time to switch between TX and RX
    /// Delay between sending multiple commands to the BMS (e.g., "50ms", "100ms")
    /// (useful for some serial adapters that need time to switch between TX/RX)
    #[arg(value_parser = humantime::parse_duration, long, default_value = "50ms")]
    pub delay: Duration,

    /// Output format of the decoded records
    #[arg(short, long, value_enum, default_value_t = OutputFormat::Debug)]
    pub format: OutputFormat,
}
