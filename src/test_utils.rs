//! Frame fixtures shared by the unit tests.

use crate::frame_assembler::{END_MARKER, START_MARKER};
use crate::message::status_message::{FUNCTION_CODE_STATUS, PAYLOAD_OFFSET};

/// Builds status frames field by field.
///
/// The defaults avoid bytes equal to the end marker so that the frames
/// survive reassembly intact.
#[derive(Debug, Clone)]
pub struct StatusFrameBuilder {
    function_code: u8,
    cells: Vec<u16>,
    temps: Vec<u16>,
    mos_temp: u16,
    balancer_temp: u16,
    voltage_raw: u16,
    current_raw: i16,
    soc_pct: u16,
    capacity_raw: u32,
    remaining_raw: u32,
}

impl Default for StatusFrameBuilder {
    fn default() -> Self {
        Self {
            function_code: FUNCTION_CODE_STATUS,
            cells: vec![3300, 3310, 3290, 3305],
            temps: vec![25, 26],
            mos_temp: 30,
            balancer_temp: 28,
            voltage_raw: 5096,
            current_raw: -50,
            soc_pct: 87,
            capacity_raw: 100_000_000,
            remaining_raw: 87_000_000,
        }
    }
}

impl StatusFrameBuilder {
    pub fn function_code(mut self, code: u8) -> Self {
        self.function_code = code;
        self
    }

    pub fn cells(mut self, cells: &[u16]) -> Self {
        self.cells = cells.to_vec();
        self
    }

    pub fn temps(mut self, temps: &[u16]) -> Self {
        self.temps = temps.to_vec();
        self
    }

    pub fn soc_pct(mut self, soc_pct: u16) -> Self {
        self.soc_pct = soc_pct;
        self
    }

    pub fn current_raw(mut self, current_raw: i16) -> Self {
        self.current_raw = current_raw;
        self
    }

    pub fn build(&self) -> Vec<u8> {
        let mut frame = vec![0u8; PAYLOAD_OFFSET];
        frame[..2].copy_from_slice(&START_MARKER);
        frame[2] = self.function_code;
        frame[8] = self.temps.len() as u8;
        frame[9] = self.cells.len() as u8;

        for value in self.cells.iter().chain(&self.temps) {
            frame.extend_from_slice(&value.to_le_bytes());
        }
        for value in [
            self.mos_temp,
            self.balancer_temp,
            self.voltage_raw,
            self.current_raw as u16,
            self.soc_pct,
        ] {
            frame.extend_from_slice(&value.to_le_bytes());
        }
        frame.extend_from_slice(&[0u8; 6]);
        frame.extend_from_slice(&self.capacity_raw.to_le_bytes());
        frame.extend_from_slice(&self.remaining_raw.to_le_bytes());
        frame.push(END_MARKER);
        frame
    }
}
