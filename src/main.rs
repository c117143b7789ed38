use std::ops::ControlFlow;
use std::time::Duration;

use anyhow::Context;
use antread::{decode_status_frame, scan_devices, BmsClient, BmsData};
use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "antread", version, about = "Read status telemetry from an ANT BMS")]
struct Cli {
    /// Minimum log level (stderr). Overridden by RUST_LOG.
    #[arg(long, value_name = "LEVEL", default_value = "info", global = true)]
    log_level: LogLevel,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List nearby BLE devices, strongest signal first
    Scan {
        /// How long to scan for
        #[arg(long, default_value_t = 5)]
        seconds: u64,
    },
    /// Connect to a BMS and print every status report it sends
    Listen {
        /// Advertised name (or name prefix) of the BMS
        #[arg(long, env = "ANTREAD_DEVICE", default_value = BmsClient::BLE_DEVICE_NAME)]
        device: String,
        /// Seconds without notifications before giving up
        #[arg(long, default_value_t = BmsClient::NOTIFICATION_TIMEOUT_S)]
        idle_timeout: u64,
    },
    /// Decode a single status frame given as hex
    Decode {
        /// The frame, start marker through end marker
        frame: String,
    },
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    fn as_directive(self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

fn init_logging(level: LogLevel) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.as_directive()));
    let _ = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

#[tokio::main]
pub async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log_level);

    match cli.command {
        Command::Scan { seconds } => {
            for device in scan_devices(Duration::from_secs(seconds)).await? {
                let rssi = device
                    .rssi
                    .map(|r| format!("{r} dBm"))
                    .unwrap_or_else(|| "n/a".to_string());
                println!("{:<24} {:<10} {}", device.name, rssi, device.id);
            }
        }
        Command::Listen {
            device,
            idle_timeout,
        } => {
            let mut client = BmsClient::new(&device)
                .await?
                .with_idle_timeout(Duration::from_secs(idle_timeout));
            client
                .listen(|data| {
                    println!("{}", status_report(&data));
                    ControlFlow::Continue(())
                })
                .await?;
            client.stop().await?;
        }
        Command::Decode { frame } => {
            let bytes = hex::decode(frame.trim()).context("frame is not valid hex")?;
            let data = decode_status_frame(&bytes)?;
            println!("{}", status_report(&data));
        }
    }

    Ok(())
}

fn status_report(data: &BmsData) -> String {
    let cells: String = data
        .cell_voltage_mv
        .iter()
        .enumerate()
        .map(|(index, voltage)| format!("Cell {:02}: {} mV\n", index + 1, voltage))
        .collect();

    format!(
        "--- BMS Status ---\n\
         Total Voltage: {:.2} V\n\
         Current:       {:.1} A\n\
         SOC:           {} %\n\
         Capacity:      {:.2} Ah\n\
         Remaining:     {:.2} Ah\n\
         MOS Temp:      {}\n\
         Balancer Temp: {}\n\
         \n\
         --- Cell Voltages ---\n\
         {}",
        data.total_voltage_v,
        data.current_a,
        data.soc_pct,
        data.capacity_ah,
        data.remaining_charge_ah,
        data.mos_temp,
        data.balancer_temp,
        cells,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_listen_defaults() {
        let cli = Cli::try_parse_from(["antread", "listen"]).expect("listen args should parse");
        match cli.command {
            Command::Listen { idle_timeout, .. } => {
                assert_eq!(idle_timeout, BmsClient::NOTIFICATION_TIMEOUT_S)
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn decode_requires_frame() {
        let err = Cli::try_parse_from(["antread", "decode"]).expect_err("frame is required");
        assert_eq!(
            err.kind(),
            clap::error::ErrorKind::MissingRequiredArgument
        );
    }

    #[test]
    fn report_lists_every_cell() {
        let data = BmsData {
            total_voltage_v: 50.96,
            current_a: -5.0,
            soc_pct: 87,
            capacity_ah: 100.0,
            remaining_charge_ah: 87.0,
            mos_temp: 30,
            balancer_temp: 28,
            cell_voltage_mv: vec![3300, 3310],
        };

        let report = status_report(&data);

        assert!(report.contains("Total Voltage: 50.96 V"));
        assert!(report.contains("Current:       -5.0 A"));
        assert!(report.contains("Cell 01: 3300 mV"));
        assert!(report.contains("Cell 02: 3310 mV"));
        assert!(!report.contains("Cell 03"));
        assert!(report.starts_with("--- BMS Status ---\nTotal Voltage"));
        assert!(report.contains("Balancer Temp: 28\n\n--- Cell Voltages ---\nCell 01"));
    }
}
