//! In-memory serial port backed by the emulator, shared by the integration tests.

// Shared across test files, not every item is used in each of them.
#![allow(dead_code)]

use pylontech_lib::emulator::Emulator;
use pylontech_lib::frame::END_OF_FRAME;
use pylontech_lib::protocol::*;
use pylontech_lib::session::Channel;
use std::collections::VecDeque;
use std::io::{self, Read, Write};

/// A byte channel answering every complete request line through an [`Emulator`].
///
/// Reading with nothing queued fails with `TimedOut`, the way a serial port
/// with a read timeout behaves when the device stays silent.
pub struct EmulatedPort {
    emulator: Emulator,
    request: Vec<u8>,
    responses: VecDeque<u8>,
    /// Every request line written so far.
    pub sent: Vec<Vec<u8>>,
    /// Applied to each response before it is queued.
    pub tamper: Option<fn(Vec<u8>) -> Vec<u8>>,
    /// Hold every response back until the next request has been written.
    pub late_replies: bool,
    held: Option<Vec<u8>>,
}

impl EmulatedPort {
    pub fn new(emulator: Emulator) -> Self {
        Self {
            emulator,
            request: Vec::new(),
            responses: VecDeque::new(),
            sent: Vec::new(),
            tamper: None,
            late_replies: false,
            held: None,
        }
    }

    /// Queues bytes as if the device had sent them unasked.
    pub fn inject(&mut self, bytes: &[u8]) {
        self.responses.extend(bytes);
    }
}

impl Read for EmulatedPort {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.responses.is_empty() {
            return Err(io::Error::new(io::ErrorKind::TimedOut, "no response"));
        }
        let count = buf.len().min(self.responses.len());
        for (slot, byte) in buf.iter_mut().zip(self.responses.drain(..count)) {
            *slot = byte;
        }
        Ok(count)
    }
}

impl Write for EmulatedPort {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        for &byte in buf {
            self.request.push(byte);
            if byte == END_OF_FRAME {
                let request = std::mem::take(&mut self.request);
                let mut response = self.emulator.respond(&request).ok().flatten();
                if let Some(tamper) = self.tamper {
                    response = response.map(tamper);
                }
                if self.late_replies {
                    response = std::mem::replace(&mut self.held, response);
                }
                if let Some(response) = response {
                    self.responses.extend(response);
                }
                self.sent.push(request);
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Channel for EmulatedPort {
    fn discard_input(&mut self) -> pylontech_lib::Result<()> {
        self.responses.clear();
        Ok(())
    }
}

pub fn be16(value: i32) -> [u8; 2] {
    (value as u16).to_be_bytes()
}

pub fn manufacturer_info() -> Vec<u8> {
    let mut info = b"US2000C\0\0\0".to_vec();
    info.extend_from_slice(&[0x01, 0x02]);
    let mut manufacturer = b"PYLON".to_vec();
    manufacturer.resize(20, b' ');
    info.extend_from_slice(&manufacturer);
    info
}

pub fn system_parameters() -> Vec<u8> {
    let mut info = vec![0x11];
    for raw in [
        3700, 3050, 2900, 3331, 2731, 1020, 54000, 48000, 45000, 3331, 2631, -1020,
    ] {
        info.extend_from_slice(&be16(raw));
    }
    info
}

pub fn management_info() -> Vec<u8> {
    let mut info = vec![0x00];
    info.extend_from_slice(&be16(53250));
    info.extend_from_slice(&be16(47000));
    info.extend_from_slice(&be16(250));
    info.extend_from_slice(&be16(-250));
    info.push(0b1100_1000);
    info
}

/// One module record of three cells, -2.0 A at 50.0 V.
pub fn module_record(remaining: u16, total: u16) -> Vec<u8> {
    let mut info = vec![3];
    for mv in [3300, 3310, 3320] {
        info.extend_from_slice(&be16(mv));
    }
    info.push(3);
    for t in [2981, 2991, 3001] {
        info.extend_from_slice(&be16(t));
    }
    info.extend_from_slice(&be16(-20));
    info.extend_from_slice(&be16(50000));
    info.extend_from_slice(&remaining.to_be_bytes());
    info.push(2);
    info.extend_from_slice(&total.to_be_bytes());
    info.extend_from_slice(&be16(42));
    info
}

pub fn alarm_info() -> Vec<u8> {
    vec![
        0x00, 0x02, 0x03, 0x00, 0x01, 0x02, 0x02, 0x00, 0xF0, 0x00, 0x01, 0x02, 0b1001_0101,
        0b0000_0110, 0b1000_1001, 0b1000_0001, 0b0100_0000,
    ]
}

pub fn serial_number(serial: &str) -> Vec<u8> {
    ModuleSerialNumber {
        command_value: 0x02,
        module_serial_number: serial.to_string(),
    }
    .encode()
    .expect("serial number fits")
}

/// An emulator answering every supported command.
pub fn full_emulator() -> Emulator {
    let mut emulator = Emulator::with_sample_data().expect("sample data encodes");
    emulator.insert(None, Command::ProtocolVersion, Vec::new());
    emulator.insert(None, Command::ManufacturerInfo, manufacturer_info());
    emulator.insert(None, Command::SystemParameters, system_parameters());
    emulator.insert(None, Command::ManagementInfo, management_info());
    emulator.insert(
        None,
        Command::ModuleSerialNumber,
        serial_number("PPTAP0102305123"),
    );
    let mut values = vec![0x11, 2];
    values.extend(module_record(25000, 50000));
    values.extend(module_record(15000, 50000));
    emulator.insert(None, Command::GetValues, values);
    let mut single = vec![0x11, 3];
    single.extend(module_record(10000, 50000));
    emulator.insert(Some(3), Command::GetValues, single);
    emulator.insert(None, Command::AlarmInfo, alarm_info());
    emulator
}
