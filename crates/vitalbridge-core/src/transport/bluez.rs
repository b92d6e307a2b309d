//! BlueZ transport over D-Bus (Linux only).

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use bluer::gatt::remote::Characteristic;
use bluer::{Adapter, AdapterEvent, Address, Device, Session};
use futures::StreamExt;
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::{Advertisement, NotificationHandler, Transport, TransportError};
use crate::profile::BATTERY_LEVEL;

/// Transport backed by the system BlueZ daemon.
pub struct BluezTransport {
    _session: Session,
    adapter: Adapter,
    notify_tasks: Mutex<HashMap<(String, Uuid), JoinHandle<()>>>,
}

impl BluezTransport {
    /// Open a session on the default adapter.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::AdapterNotFound`] when BlueZ is unreachable or
    /// has no adapter, and [`TransportError::AdapterPoweredOff`] when the
    /// adapter is off.
    pub async fn new() -> Result<Self, TransportError> {
        let session = Session::new().await.map_err(|e| {
            tracing::error!(error = %e, "Failed to open BlueZ session");
            TransportError::AdapterNotFound
        })?;
        let adapter = session
            .default_adapter()
            .await
            .map_err(|_| TransportError::AdapterNotFound)?;

        if !adapter.is_powered().await.unwrap_or(false) {
            return Err(TransportError::AdapterPoweredOff);
        }
        tracing::info!(adapter = adapter.name(), "BlueZ adapter ready");

        Ok(Self {
            _session: session,
            adapter,
            notify_tasks: Mutex::new(HashMap::new()),
        })
    }

    fn device(&self, address: &str) -> Result<Device, TransportError> {
        let parsed: Address = address.parse().map_err(|_| TransportError::ConnectFailed {
            address: address.to_string(),
            message: "invalid Bluetooth address".to_string(),
        })?;
        self.adapter
            .device(parsed)
            .map_err(|e| TransportError::ConnectFailed {
                address: address.to_string(),
                message: e.to_string(),
            })
    }

    async fn characteristic(
        &self,
        address: &str,
        uuid: Uuid,
    ) -> Result<Option<Characteristic>, TransportError> {
        let device = self.device(address)?;
        let gatt = |e: bluer::Error| TransportError::GattFailed {
            address: address.to_string(),
            message: e.to_string(),
        };

        for service in device.services().await.map_err(gatt)? {
            for characteristic in service.characteristics().await.map_err(gatt)? {
                if characteristic.uuid().await.map_err(gatt)? == uuid {
                    return Ok(Some(characteristic));
                }
            }
        }
        Ok(None)
    }

    fn abort_notify(&self, address: &str, characteristic: Option<Uuid>) {
        let mut tasks = self
            .notify_tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        tasks.retain(|(addr, uuid), task| {
            let matches = addr == address && characteristic.map_or(true, |c| c == *uuid);
            if matches {
                task.abort();
            }
            !matches
        });
    }
}

#[async_trait]
impl Transport for BluezTransport {
    async fn scan(&self, duration: Duration) -> Result<Vec<Advertisement>, TransportError> {
        let scan_failed = |e: bluer::Error| TransportError::ScanFailed {
            message: e.to_string(),
        };

        let events = self.adapter.discover_devices().await.map_err(scan_failed)?;
        futures::pin_mut!(events);

        let mut seen = HashSet::new();
        let deadline = tokio::time::sleep(duration);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                () = &mut deadline => break,
                event = events.next() => match event {
                    Some(AdapterEvent::DeviceAdded(address)) => {
                        seen.insert(address);
                    }
                    Some(_) => {}
                    None => break,
                },
            }
        }

        let mut found = Vec::with_capacity(seen.len());
        for address in seen {
            let Ok(device) = self.adapter.device(address) else {
                continue;
            };
            found.push(Advertisement {
                address: address.to_string(),
                name: device.name().await.ok().flatten(),
                rssi: device.rssi().await.ok().flatten(),
                service_uuids: device
                    .uuids()
                    .await
                    .ok()
                    .flatten()
                    .map(|uuids| uuids.into_iter().collect())
                    .unwrap_or_default(),
            });
        }
        tracing::debug!(count = found.len(), "BlueZ scan complete");
        Ok(found)
    }

    async fn connect(&self, address: &str) -> Result<(), TransportError> {
        let device = self.device(address)?;
        if device.is_connected().await.unwrap_or(false) {
            return Ok(());
        }
        device
            .connect()
            .await
            .map_err(|e| TransportError::ConnectFailed {
                address: address.to_string(),
                message: e.to_string(),
            })
    }

    async fn subscribe(
        &self,
        address: &str,
        characteristic: Uuid,
        handler: NotificationHandler,
    ) -> Result<(), TransportError> {
        let subscribe_failed = |message: String| TransportError::SubscribeFailed {
            address: address.to_string(),
            characteristic,
            message,
        };

        let target = self
            .characteristic(address, characteristic)
            .await?
            .ok_or_else(|| subscribe_failed("characteristic not found".to_string()))?;
        let stream = target
            .notify()
            .await
            .map_err(|e| subscribe_failed(e.to_string()))?;

        let task = tokio::spawn(async move {
            futures::pin_mut!(stream);
            while let Some(value) = stream.next().await {
                handler(&value);
            }
        });

        let previous = self
            .notify_tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert((address.to_string(), characteristic), task);
        if let Some(previous) = previous {
            previous.abort();
        }
        Ok(())
    }

    async fn unsubscribe(&self, address: &str, characteristic: Uuid) -> Result<(), TransportError> {
        // Dropping the notify stream disables notifications.
        self.abort_notify(address, Some(characteristic));
        Ok(())
    }

    async fn disconnect(&self, address: &str) -> Result<(), TransportError> {
        self.abort_notify(address, None);

        let device = self.device(address)?;
        if !device.is_connected().await.unwrap_or(false) {
            return Ok(());
        }
        device
            .disconnect()
            .await
            .map_err(|e| TransportError::DisconnectFailed {
                address: address.to_string(),
                message: e.to_string(),
            })
    }

    async fn read_battery_level(&self, address: &str) -> Result<Option<u8>, TransportError> {
        let Some(characteristic) = self.characteristic(address, BATTERY_LEVEL).await? else {
            return Ok(None);
        };
        let value = characteristic
            .read()
            .await
            .map_err(|e| TransportError::GattFailed {
                address: address.to_string(),
                message: e.to_string(),
            })?;
        Ok(value.first().copied())
    }
}
