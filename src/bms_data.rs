/// The reported status of the battery, decoded from one status frame
#[derive(Debug, Clone, PartialEq)]
pub struct BmsData {
    /// The battery voltage in V
    pub total_voltage_v: f64,
    /// The battery current in A. Positive while charging, negative while discharging
    pub current_a: f64,
    /// The state of charge of the battery in %
    pub soc_pct: u16,
    /// The full capacity of the battery in Ah
    pub capacity_ah: f64,
    /// The remaining charge of the battery in Ah
    pub remaining_charge_ah: f64,
    /// Temperature of the MOS switches, raw units as reported by the BMS
    pub mos_temp: u16,
    /// Temperature of the balancer, raw units as reported by the BMS
    pub balancer_temp: u16,
    /// The voltage of each cell in mV, one entry per cell declared in the frame header
    pub cell_voltage_mv: Vec<u16>,
}

impl BmsData {
    /// The number of cells reported
    pub fn cell_count(&self) -> usize {
        self.cell_voltage_mv.len()
    }
}
