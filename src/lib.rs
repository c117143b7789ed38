//! Read status telemetry from ANT Battery Management Systems over Bluetooth Low Energy
//!
//! The BMS pushes status frames as BLE notifications on characteristic `0xffe1`
//! of service `0xffe0`. A frame is spread over any number of notifications, so
//! decoding happens in two steps:
//!
//! 1. [`FrameAssembler`] rebuilds complete frames from the raw notification chunks.
//! 2. [`decode_status_frame`] turns a complete frame into a [`BmsData`] record.
//!
//! Both steps are free of I/O and can be used without the BLE client, for
//! example on chunks captured from another transport.
//!
//! Currently the following data can be accessed:
//!
//! - Total voltage (V)
//! - Current (A)
//! - State of charge (%)
//! - Capacity and remaining charge (Ah)
//! - MOS and balancer temperature
//! - Cell voltages (mV)
//!
//! # Example
//!
//! ```rust
//! use antread::{decode_status_frame, FrameAssembler};
//!
//! let mut assembler = FrameAssembler::new();
//! for chunk in [&[0x7E, 0xA1, 0x11][..], &[0x00, 0x55][..]] {
//!     for frame in assembler.push(chunk) {
//!         // Too short to be a status frame
//!         assert!(decode_status_frame(frame.as_bytes()).is_err());
//!     }
//! }
//! ```

mod bms_client;
mod bms_data;
mod error;
mod frame_assembler;
mod message;
#[cfg(test)]
mod test_utils;

pub use bms_client::{scan_devices, BmsClient, DiscoveredDevice};
pub use bms_data::BmsData;
pub use error::DecodeError;
pub use frame_assembler::{
    AssemblerStats, CompleteFrame, FrameAssembler, DEFAULT_MAX_FRAME_LEN, END_MARKER, START_MARKER,
};
pub use message::{decode_status_frame, try_decode_status_frame, StatusMessage};
