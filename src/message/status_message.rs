use crate::bms_data::BmsData;
use crate::error::{DecodeError, Result};

/// The function code carried by frames that report battery status
pub(crate) const FUNCTION_CODE_STATUS: u8 = 0x11;

/// Frames shorter than this cannot hold the header fields
const MIN_FRAME_LEN: usize = 10;

const FUNCTION_CODE_OFFSET: usize = 2;
const NUM_TEMP_OFFSET: usize = 8;
const NUM_CELL_OFFSET: usize = 9;

/// Offset of the first cell voltage
pub(crate) const PAYLOAD_OFFSET: usize = 34;

/// State of health, discharge MOS, charge MOS and balance flags plus one spare byte
const RESERVED_LEN: usize = 6;

/// A status frame whose header has been checked.
///
/// Layout after the header, starting at byte 34:
///
/// Field                 | Width        | Encoding
/// --------------------- | ------------ | -----------------------------
/// Cell voltages (mV)    | 2 * numCell  | u16 LE each
/// Sensor temperatures   | 2 * numTemp  | u16 LE each, not surfaced
/// MOS temperature       | 2            | u16 LE
/// Balancer temperature  | 2            | u16 LE
/// Total voltage (V/100) | 2            | u16 LE
/// Current (A/10)        | 2            | i16 LE
/// State of charge (%)   | 2            | u16 LE
/// Reserved              | 6            | skipped
/// Capacity (uAh)        | 4            | two u16 LE words, low first
/// Remaining (uAh)       | 4            | two u16 LE words, low first
pub struct StatusMessage<'a>(&'a [u8]);

impl<'a> StatusMessage<'a> {
    pub fn new(frame: &'a [u8]) -> Result<Self> {
        if frame.len() < MIN_FRAME_LEN {
            return Err(DecodeError::TruncatedFrame {
                needed: MIN_FRAME_LEN,
                len: frame.len(),
            });
        }

        let function_code = frame[FUNCTION_CODE_OFFSET];
        if function_code != FUNCTION_CODE_STATUS {
            return Err(DecodeError::UnsupportedFunctionCode(function_code));
        }

        Ok(Self(frame))
    }

    /// Number of temperature sensors declared in the header
    pub fn num_temp(&self) -> usize {
        self.0[NUM_TEMP_OFFSET] as usize
    }

    /// Number of cells declared in the header
    pub fn num_cell(&self) -> usize {
        self.0[NUM_CELL_OFFSET] as usize
    }

    pub fn decode(&self) -> Result<BmsData> {
        let mut reader = Reader::new(self.0, PAYLOAD_OFFSET);

        let cell_voltage_mv = (0..self.num_cell())
            .map(|_| reader.u16())
            .collect::<Result<Vec<u16>>>()?;
        for _ in 0..self.num_temp() {
            reader.u16()?;
        }

        let mos_temp = reader.u16()?;
        let balancer_temp = reader.u16()?;
        let total_voltage_v = reader.u16()? as f64 / 100.0;
        let current_a = reader.i16()? as f64 / 10.0;
        let soc_pct = reader.u16()?;
        reader.skip(RESERVED_LEN)?;
        let capacity_ah = reader.u32_words()? as f64 / 1_000_000.0;
        let remaining_charge_ah = reader.u32_words()? as f64 / 1_000_000.0;

        Ok(BmsData {
            total_voltage_v,
            current_a,
            soc_pct,
            capacity_ah,
            remaining_charge_ah,
            mos_temp,
            balancer_temp,
            cell_voltage_mv,
        })
    }
}

/// Sequential bounds-checked reads over a frame
struct Reader<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8], offset: usize) -> Self {
        Self { data, offset }
    }

    fn take(&mut self, width: usize) -> Result<&'a [u8]> {
        let end = self.offset + width;
        let bytes = self.data.get(self.offset..end).ok_or(DecodeError::TruncatedFrame {
            needed: end,
            len: self.data.len(),
        })?;
        self.offset = end;
        Ok(bytes)
    }

    fn skip(&mut self, width: usize) -> Result<()> {
        self.take(width).map(|_| ())
    }

    fn u16(&mut self) -> Result<u16> {
        let bytes = self.take(2)?;
        Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
    }

    fn i16(&mut self) -> Result<i16> {
        self.u16().map(|raw| raw as i16)
    }

    /// Two 16-bit little endian words, the first one being the low half
    fn u32_words(&mut self) -> Result<u32> {
        let low = self.u16()? as u32;
        let high = self.u16()? as u32;
        Ok(low | (high << 16))
    }
}

#[cfg(test)]
use crate::test_utils::StatusFrameBuilder;

#[cfg(test)]
fn decode(frame: &[u8]) -> Result<BmsData> {
    StatusMessage::new(frame)?.decode()
}

#[test]
fn test_decode_happy() {
    let frame = StatusFrameBuilder::default().build();
    let data = decode(&frame).unwrap();

    assert_eq!(data.cell_voltage_mv, vec![3300, 3310, 3290, 3305]);
    assert_eq!(data.mos_temp, 30);
    assert_eq!(data.balancer_temp, 28);
    assert_eq!(data.total_voltage_v, 50.96);
    assert_eq!(data.current_a, -5.0);
    assert_eq!(data.soc_pct, 87);
    assert_eq!(data.capacity_ah, 100.0);
    assert_eq!(data.remaining_charge_ah, 87.0);
}

#[test]
fn test_decode_hex_frame() {
    // 4 cells, 2 sensors. Offsets past 34: cells 34..42, temps 42..46,
    // mos 46, balancer 48, voltage 50, current 52, soc 54, reserved 56..62,
    // capacity 62..66, remaining 66..70, end marker 70.
    let frame = hex::decode(concat!(
        "7ea1110000000000020400000000000000000000000000000000000000000000",
        "0000",
        "e40cee0cda0ce90c",
        "19001a00",
        "1e00",
        "1c00",
        "e813",
        "ceff",
        "5700",
        "000000000000",
        "00e1f505",
        "c0832f05",
        "55",
    ))
    .unwrap();
    assert_eq!(frame.len(), 71);

    let message = StatusMessage::new(&frame).unwrap();
    assert_eq!(message.num_temp(), 2);
    assert_eq!(message.num_cell(), 4);

    let data = message.decode().unwrap();
    assert_eq!(data.cell_count(), 4);
    assert_eq!(data.cell_voltage_mv, vec![3300, 3310, 3290, 3305]);
    assert_eq!(data.mos_temp, 30);
    assert_eq!(data.balancer_temp, 28);
    assert_eq!(data.total_voltage_v, 50.96);
    assert_eq!(data.current_a, -5.0);
    assert_eq!(data.soc_pct, 87);
    assert_eq!(data.capacity_ah, 100.0);
    assert_eq!(data.remaining_charge_ah, 87.0);
}

#[test]
fn test_capacity_words_are_low_then_high() {
    let mut frame = StatusFrameBuilder::default().cells(&[]).temps(&[]).build();
    // capacity starts at 34 + 10 + 6
    frame[50..54].copy_from_slice(&[0x34, 0x12, 0x02, 0x00]);

    let data = decode(&frame).unwrap();

    assert_eq!(data.capacity_ah, 0x0002_1234 as f64 / 1_000_000.0);
}

#[test]
fn test_decode_positive_current() {
    let frame = StatusFrameBuilder::default().current_raw(123).build();
    assert_eq!(decode(&frame).unwrap().current_a, 12.3);
}

#[test]
fn test_decode_no_cells() {
    let frame = StatusFrameBuilder::default().cells(&[]).temps(&[]).build();
    let data = decode(&frame).unwrap();
    assert!(data.cell_voltage_mv.is_empty());
    assert_eq!(data.total_voltage_v, 50.96);
}

#[test]
fn test_decode_is_idempotent() {
    let frame = StatusFrameBuilder::default().build();
    assert_eq!(decode(&frame).unwrap(), decode(&frame).unwrap());
}

#[test]
fn test_decode_too_short() {
    let frame = hex::decode("7ea1110000000055").unwrap();
    assert_eq!(
        decode(&frame),
        Err(DecodeError::TruncatedFrame { needed: 10, len: 8 })
    );
}

#[test]
fn test_decode_unsupported_function_code() {
    let frame = StatusFrameBuilder::default().function_code(0x12).build();
    assert_eq!(
        decode(&frame),
        Err(DecodeError::UnsupportedFunctionCode(0x12))
    );
}

#[test]
fn test_decode_header_only() {
    // Valid header that declares cells but carries no payload
    let frame = hex::decode("7ea111000000000002045555").unwrap();
    assert_eq!(
        decode(&frame),
        Err(DecodeError::TruncatedFrame { needed: 36, len: 12 })
    );
}

#[test]
fn test_decode_counts_exceed_frame() {
    let mut frame = StatusFrameBuilder::default().build();
    frame[9] = 200;
    assert!(matches!(
        decode(&frame),
        Err(DecodeError::TruncatedFrame { .. })
    ));
}

#[test]
fn test_decode_every_truncation() {
    let frame = StatusFrameBuilder::default().build();
    // The last byte is the end marker, which is never read
    for len in 0..frame.len() - 1 {
        assert!(decode(&frame[..len]).is_err(), "len {len}");
    }
    assert!(decode(&frame[..frame.len() - 1]).is_ok());
}
