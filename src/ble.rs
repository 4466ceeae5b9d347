//! BLE transport: scan for cat printers, connect, and expose the write
//! primitives and notification stream the session layer consumes.
//!
//! Both families sit behind the same GATT service. Commands go to 0xAE01,
//! notifications arrive on 0xAE02, and the MXW01 takes bulk image data on a
//! third characteristic, 0xAE03.

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use btleplug::api::{
    Central, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType,
    bleuuid::uuid_from_u16,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::{Stream, StreamExt};
use once_cell::sync::Lazy;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::PrinterError;
use crate::protocol::ProtocolFamily;
use crate::session::{DeviceStateHandle, Transport, pump_notifications};

/// Service UUID present in printer advertisements.
static ADVERTISED_SERVICE: Lazy<Uuid> = Lazy::new(|| uuid_from_u16(0xAF30));
/// Service holding the print characteristics.
static PRINT_SERVICE: Lazy<Uuid> = Lazy::new(|| uuid_from_u16(0xAE30));
static COMMAND_CHAR: Lazy<Uuid> = Lazy::new(|| uuid_from_u16(0xAE01));
static NOTIFY_CHAR: Lazy<Uuid> = Lazy::new(|| uuid_from_u16(0xAE02));
static DATA_CHAR: Lazy<Uuid> = Lazy::new(|| uuid_from_u16(0xAE03));

/// A printer seen during scanning.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub id: String,
    pub name: Option<String>,
    /// Family inferred from the advertised name, when one was present.
    pub family: Option<ProtocolFamily>,
}

async fn default_adapter() -> Result<Adapter, PrinterError> {
    let manager = Manager::new().await?;
    manager
        .adapters()
        .await?
        .into_iter()
        .next()
        .ok_or(PrinterError::NoAdapter)
}

/// Scans for advertising printers for the given duration.
pub async fn scan(timeout: Duration) -> Result<Vec<DeviceInfo>, PrinterError> {
    let adapter = default_adapter().await?;
    adapter
        .start_scan(ScanFilter {
            services: vec![*ADVERTISED_SERVICE],
        })
        .await?;
    tokio::time::sleep(timeout).await;
    let _ = adapter.stop_scan().await;

    let mut found = Vec::new();
    for peripheral in adapter.peripherals().await? {
        let name = peripheral
            .properties()
            .await?
            .and_then(|props| props.local_name);
        let info = DeviceInfo {
            id: format!("{:?}", peripheral.id()),
            family: name.as_deref().map(ProtocolFamily::from_device_name),
            name,
        };
        debug!(id = %info.id, name = ?info.name, "discovered printer");
        found.push(info);
    }
    Ok(found)
}

/// A connected printer. Implements [`Transport`] so it plugs straight into
/// a [`crate::session::Session`].
pub struct BlePrinter {
    peripheral: Peripheral,
    family: ProtocolFamily,
    command_char: Characteristic,
    notify_char: Characteristic,
    data_char: Option<Characteristic>,
}

/// Connects to a device found by [`scan`], inferring the protocol family
/// from its advertised name.
pub async fn connect(id: &str, timeout: Duration) -> Result<BlePrinter, PrinterError> {
    connect_inner(id, None, timeout).await
}

/// Connects with an explicit family, for hosts that know their firmware
/// better than the advertised name does.
pub async fn connect_with_family(
    id: &str,
    family: ProtocolFamily,
    timeout: Duration,
) -> Result<BlePrinter, PrinterError> {
    connect_inner(id, Some(family), timeout).await
}

async fn connect_inner(
    id: &str,
    family: Option<ProtocolFamily>,
    timeout: Duration,
) -> Result<BlePrinter, PrinterError> {
    let adapter = default_adapter().await?;
    adapter.start_scan(ScanFilter::default()).await?;
    let deadline = tokio::time::Instant::now() + timeout;
    let peripheral = loop {
        let found = adapter
            .peripherals()
            .await?
            .into_iter()
            .find(|p| format!("{:?}", p.id()) == id);
        if let Some(p) = found {
            break p;
        }
        if tokio::time::Instant::now() >= deadline {
            let _ = adapter.stop_scan().await;
            return Err(PrinterError::DeviceNotFound(id.to_string()));
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    };
    let _ = adapter.stop_scan().await;

    peripheral.connect().await?;
    peripheral.discover_services().await?;

    let family = match family {
        Some(family) => family,
        None => {
            let name = peripheral
                .properties()
                .await?
                .and_then(|props| props.local_name);
            match name {
                Some(name) => ProtocolFamily::from_device_name(&name),
                None => {
                    warn!("device has no advertised name, assuming GB series");
                    ProtocolFamily::Legacy
                }
            }
        }
    };
    info!(id, ?family, "connected");

    let characteristics = peripheral.characteristics();
    let find = |uuid: Uuid| {
        characteristics
            .iter()
            .find(|c| c.uuid == uuid && c.service_uuid == *PRINT_SERVICE)
            .or_else(|| characteristics.iter().find(|c| c.uuid == uuid))
            .cloned()
    };
    let command_char =
        find(*COMMAND_CHAR).ok_or(PrinterError::CharacteristicNotFound(0xAE01))?;
    let notify_char = find(*NOTIFY_CHAR).ok_or(PrinterError::CharacteristicNotFound(0xAE02))?;
    let data_char = find(*DATA_CHAR);
    if family == ProtocolFamily::NextGen && data_char.is_none() {
        return Err(PrinterError::CharacteristicNotFound(0xAE03));
    }

    peripheral.subscribe(&notify_char).await?;

    Ok(BlePrinter {
        peripheral,
        family,
        command_char,
        notify_char,
        data_char,
    })
}

impl BlePrinter {
    pub fn family(&self) -> ProtocolFamily {
        self.family
    }

    /// Raw frames from the notification characteristic, one buffer per
    /// received frame (possibly partial or noise).
    pub async fn notifications(
        &self,
    ) -> Result<Pin<Box<dyn Stream<Item = Vec<u8>> + Send>>, PrinterError> {
        let uuid = self.notify_char.uuid;
        let stream = self.peripheral.notifications().await?;
        Ok(Box::pin(stream.filter_map(move |n| async move {
            if n.uuid == uuid { Some(n.value) } else { None }
        })))
    }

    /// Spawns the notification pump writing into `handle`. Returns the task
    /// handle; the task ends when the device disconnects.
    pub async fn spawn_state_pump(
        &self,
        handle: DeviceStateHandle,
    ) -> Result<tokio::task::JoinHandle<()>, PrinterError> {
        let family = self.family;
        let stream = self.notifications().await?;
        Ok(tokio::spawn(pump_notifications(family, stream, handle)))
    }

    pub async fn disconnect(&self) -> Result<(), PrinterError> {
        self.peripheral.disconnect().await?;
        Ok(())
    }
}

#[async_trait]
impl Transport for BlePrinter {
    async fn write_command(&mut self, bytes: &[u8]) -> Result<(), PrinterError> {
        self.peripheral
            .write(&self.command_char, bytes, WriteType::WithoutResponse)
            .await?;
        Ok(())
    }

    async fn write_data(&mut self, bytes: &[u8]) -> Result<(), PrinterError> {
        let characteristic = self.data_char.as_ref().unwrap_or(&self.command_char);
        self.peripheral
            .write(characteristic, bytes, WriteType::WithoutResponse)
            .await?;
        Ok(())
    }
}
