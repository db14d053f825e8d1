#![cfg_attr(docsrs, feature(doc_cfg))]
//! # pylontech_lib
//!
//! This crate provides a library for talking to Pylontech battery management
//! systems over their ASCII-hex armored serial protocol.
//! It offers the frame codec, the per-command payload decoders and both
//! synchronous and asynchronous sessions.
//!
//! ## Features
//!
//! This crate uses a feature-based system to keep dependencies minimal.
//! You need to enable the client you want to use.
//!
//! - `default`: Enables `bin-dependencies`, which is intended for compiling the `pylontech` command-line tool and pulls in `serialport` and `serde`.
//!
//! ### Client Features
//! - `serialport`: Opens **synchronous** sessions on serial ports using the `serialport` crate.
//! - `tokio-serial-async`: Enables the **asynchronous** client using `tokio` and `tokio-serial`.
//!
//! The synchronous [`session::PylontechBms`] itself works on any `Read + Write`
//! channel and is always available.
//!
//! ### Utility Features
//! - `serde`: Enables `serde` support for serializing/deserializing the decoded records.
//! - `bin-dependencies`: Enables all features required by the `pylontech` binary executable.

/// Simulated BMS used by the `emulate` command and the tests.
pub mod emulator;
/// Contains error types for the library.
mod error;
/// Checksum, length field and frame armor.
pub mod frame;
/// Command codes and payload layouts of the Pylontech protocol.
pub mod protocol;
/// Synchronous request/response session.
pub mod session;

pub use error::{Error, Result};

/// Serial port support for the synchronous session.
#[cfg_attr(docsrs, doc(cfg(feature = "serialport")))]
#[cfg(feature = "serialport")]
pub mod serialport;

/// Asynchronous client for Pylontech BMS communication.
#[cfg_attr(docsrs, doc(cfg(feature = "tokio-serial-async")))]
#[cfg(feature = "tokio-serial-async")]
pub mod tokio_serial_async;
