use std::ops::ControlFlow;

use anyhow::anyhow;
use bluest::Adapter;
use bluest::AdvertisingDevice;
use bluest::Characteristic;
use bluest::Device;
use bluest::Uuid;
use futures_util::Stream;
use futures_util::StreamExt;
use tokio::time::timeout;
use tokio::time::timeout_at;
use tokio::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::bms_data::BmsData;
use crate::frame_assembler::FrameAssembler;
use crate::message::try_decode_status_frame;

/// A connection to an ANT BMS which streams decoded status records.
///
/// The BMS pushes status frames as notifications on a single characteristic
/// without being asked. Each client owns the assembler for its connection.
pub struct BmsClient {
    adapter: Adapter,
    device: Device,
    notify: Characteristic,
    assembler: FrameAssembler,
    idle_timeout: Duration,
}

impl BmsClient {
    /// Advertised name prefix of ANT BMS boards
    pub const BLE_DEVICE_NAME: &'static str = "ANT-BLE";
    const ANT_SERVICE_ID: Uuid = Uuid::from_u128(0x0000ffe0_0000_1000_8000_00805f9b34fb);
    const ANT_NOTIFY_CHARACTERISTIC_ID: Uuid =
        Uuid::from_u128(0x0000ffe1_0000_1000_8000_00805f9b34fb);
    // How long to scan for the device before giving up
    pub const DISCOVERY_TIMEOUT_S: u64 = 30;
    // How long the device may stay silent before the connection is considered dead
    pub const NOTIFICATION_TIMEOUT_S: u64 = 10;

    /// Disconnect from the battery
    pub async fn stop(self) -> anyhow::Result<()> {
        self.adapter.disconnect_device(&self.device).await?;
        Ok(())
    }

    pub async fn new_default_name() -> anyhow::Result<Self> {
        Self::new(Self::BLE_DEVICE_NAME).await
    }

    /// Create a new `BmsClient`, which includes attempting to discover the device.
    ///
    /// A device matches if its advertised name starts with `ble_device_name`.
    pub async fn new(ble_device_name: &str) -> anyhow::Result<Self> {
        let adapter = default_adapter().await?;

        let device = timeout(
            Duration::from_secs(Self::DISCOVERY_TIMEOUT_S),
            Self::discover_device(ble_device_name, &adapter),
        )
        .await
        .map_err(|_| anyhow!("Device not found"))??;

        adapter.connect_device(&device).await?;
        info!(name = ble_device_name, "connected");

        let service = device
            .discover_services_with_uuid(Self::ANT_SERVICE_ID)
            .await?
            .first()
            .ok_or(anyhow!("The specified device does not support the ANT BMS service."))?
            .clone();
        let notify = service
            .discover_characteristics_with_uuid(Self::ANT_NOTIFY_CHARACTERISTIC_ID)
            .await?
            .first()
            .ok_or(anyhow!("The specified device does not support the ANT BMS notify characteristic."))?
            .clone();

        Ok(Self {
            adapter,
            device,
            notify,
            assembler: FrameAssembler::new(),
            idle_timeout: Duration::from_secs(Self::NOTIFICATION_TIMEOUT_S),
        })
    }

    /// Change how long the device may stay silent before [`BmsClient::listen`] fails
    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    /// Subscribe to notifications and hand every decoded record to `on_record`.
    ///
    /// Returns `Ok(())` once `on_record` breaks, or an error when the device
    /// goes silent or the notification stream ends.
    pub async fn listen<F>(&mut self, on_record: F) -> anyhow::Result<()>
    where
        F: FnMut(BmsData) -> ControlFlow<()>,
    {
        if self.try_connect().await? {
            // Whatever was buffered belongs to the old connection
            self.assembler.reset();
        }

        let reader = self.notify.notify().await?;
        pump_notifications(reader, &mut self.assembler, self.idle_timeout, on_record).await
    }

    async fn discover_device(name: &str, adapter: &Adapter) -> anyhow::Result<Device> {
        let mut adapter_events = adapter.scan(&[]).await?;
        while let Some(found) = adapter_events.next().await {
            if let Some(device_name) = advertised_name(&found).await {
                debug!(name = %device_name, rssi = ?found.rssi, "saw device");
                if device_name.starts_with(name) {
                    return Ok(found.device);
                }
            }
        }

        Err(anyhow!("Device not found"))
    }

    /// Reconnect if the link dropped. Returns whether a reconnect happened.
    async fn try_connect(&self) -> anyhow::Result<bool> {
        if !self.device.is_connected().await {
            let mut retries = 2;
            loop {
                match self.adapter.connect_device(&self.device).await {
                    Ok(()) => return Ok(true),
                    Err(err) if retries > 0 => {
                        warn!(error = %err, "failed to connect");
                        retries -= 1;
                    }
                    Err(err) => return Err(err.into()),
                }
            }
        }

        Ok(false)
    }
}

/// Feed notification chunks through the assembler and decoder.
///
/// Frames that do not decode are dropped. The consumer only ever sees
/// complete records.
async fn pump_notifications<T, E, F>(
    mut reader: T,
    assembler: &mut FrameAssembler,
    idle_timeout: Duration,
    mut on_record: F,
) -> anyhow::Result<()>
where
    T: Stream<Item = Result<Vec<u8>, E>> + Unpin,
    E: std::error::Error + Send + Sync + 'static,
    F: FnMut(BmsData) -> ControlFlow<()>,
{
    loop {
        match timeout(idle_timeout, reader.next()).await {
            Err(_) => {
                return Err(anyhow!(
                    "No notifications for {}ms",
                    idle_timeout.as_millis()
                ));
            }
            Ok(None) => {
                debug!(stats = ?assembler.stats(), "end of notification stream");
                return Err(anyhow!("end of notification stream"));
            }
            Ok(Some(Err(err))) => {
                warn!(error = %err, "notification error");
                return Err(err.into());
            }
            Ok(Some(Ok(chunk))) => {
                for frame in assembler.push(&chunk) {
                    let Some(data) = try_decode_status_frame(frame.as_bytes()) else {
                        continue;
                    };
                    if on_record(data).is_break() {
                        return Ok(());
                    }
                }
            }
        }
    }
}

/// A device seen while scanning
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredDevice {
    pub name: String,
    pub id: String,
    pub rssi: Option<i16>,
}

/// Scan for advertising devices for `duration`, strongest signal first.
pub async fn scan_devices(duration: Duration) -> anyhow::Result<Vec<DiscoveredDevice>> {
    let adapter = default_adapter().await?;
    let mut adapter_events = adapter.scan(&[]).await?;
    let deadline = Instant::now() + duration;
    let mut devices = Vec::new();

    while let Ok(Some(found)) = timeout_at(deadline, adapter_events.next()).await {
        let name = advertised_name(&found)
            .await
            .unwrap_or_else(|| "Unknown Device".to_string());
        record_discovery(
            &mut devices,
            DiscoveredDevice {
                name,
                id: format!("{:?}", found.device.id()),
                rssi: found.rssi,
            },
        );
    }

    info!(count = devices.len(), "scan finished");
    Ok(devices)
}

/// Insert or refresh a device, keeping the list ordered by RSSI, strongest first.
fn record_discovery(devices: &mut Vec<DiscoveredDevice>, found: DiscoveredDevice) {
    match devices.iter_mut().find(|d| d.id == found.id) {
        Some(existing) => {
            existing.rssi = found.rssi;
            if existing.name == "Unknown Device" {
                existing.name = found.name;
            }
        }
        None => devices.push(found),
    }
    devices.sort_by(|a, b| b.rssi.cmp(&a.rssi));
}

async fn default_adapter() -> anyhow::Result<Adapter> {
    let adapter = Adapter::default()
        .await
        .ok_or(anyhow!("Default adapter not found"))?;
    adapter.wait_available().await?;
    Ok(adapter)
}

async fn advertised_name(found: &AdvertisingDevice) -> Option<String> {
    match &found.adv_data.local_name {
        Some(name) => Some(name.clone()),
        None => found.device.name_async().await.ok(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::StatusFrameBuilder;
    use futures_util::stream;
    use std::io;

    fn chunked(wire: &[u8], size: usize) -> Vec<Result<Vec<u8>, io::Error>> {
        wire.chunks(size).map(|c| Ok(c.to_vec())).collect()
    }

    #[tokio::test]
    async fn test_pump_delivers_records_until_break() {
        let mut wire = StatusFrameBuilder::default().build();
        wire.extend(StatusFrameBuilder::default().soc_pct(12).build());
        wire.extend(StatusFrameBuilder::default().soc_pct(13).build());
        let reader = stream::iter(chunked(&wire, 20));
        let mut assembler = FrameAssembler::new();
        let mut socs = Vec::new();

        let result = pump_notifications(reader, &mut assembler, Duration::from_secs(1), |data| {
            socs.push(data.soc_pct);
            if socs.len() == 2 {
                ControlFlow::Break(())
            } else {
                ControlFlow::Continue(())
            }
        })
        .await;

        assert!(result.is_ok());
        assert_eq!(socs, vec![87, 12]);
    }

    #[tokio::test]
    async fn test_pump_skips_undecodable_frames() {
        let mut wire = StatusFrameBuilder::default().function_code(0x12).build();
        wire.extend(StatusFrameBuilder::default().build());
        let reader = stream::iter(chunked(&wire, 7));
        let mut assembler = FrameAssembler::new();
        let mut records = Vec::new();

        let result = pump_notifications(reader, &mut assembler, Duration::from_secs(1), |data| {
            records.push(data);
            ControlFlow::Continue(())
        })
        .await;

        // The stream ends after the second frame
        assert!(result.is_err());
        assert_eq!(records.len(), 1);
        assert_eq!(assembler.stats().frames_emitted, 2);
    }

    #[tokio::test]
    async fn test_pump_propagates_stream_error() {
        let items = vec![
            Ok(vec![0x7E, 0xA1, 0x11]),
            Err(io::Error::new(io::ErrorKind::BrokenPipe, "link lost")),
        ];
        let mut assembler = FrameAssembler::new();

        let result = pump_notifications(
            stream::iter(items),
            &mut assembler,
            Duration::from_secs(1),
            |_| ControlFlow::Continue(()),
        )
        .await;

        assert!(result.unwrap_err().to_string().contains("link lost"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pump_times_out_when_silent() {
        let reader = stream::pending::<Result<Vec<u8>, io::Error>>();
        let mut assembler = FrameAssembler::new();

        let result = pump_notifications(reader, &mut assembler, Duration::from_secs(5), |_| {
            ControlFlow::Continue(())
        })
        .await;

        assert!(result.unwrap_err().to_string().contains("No notifications"));
    }

    #[test]
    fn test_record_discovery_ranks_by_rssi() {
        let mut devices = Vec::new();
        let device = |name: &str, id: &str, rssi| DiscoveredDevice {
            name: name.to_string(),
            id: id.to_string(),
            rssi,
        };

        record_discovery(&mut devices, device("ANT-BLE16", "a", Some(-80)));
        record_discovery(&mut devices, device("Unknown Device", "b", Some(-60)));
        record_discovery(&mut devices, device("phone", "c", None));
        record_discovery(&mut devices, device("ANT-BLE16", "a", Some(-40)));
        record_discovery(&mut devices, device("speaker", "b", Some(-70)));

        assert_eq!(
            devices,
            vec![
                device("ANT-BLE16", "a", Some(-40)),
                device("speaker", "b", Some(-70)),
                device("phone", "c", None),
            ]
        );
    }
}
