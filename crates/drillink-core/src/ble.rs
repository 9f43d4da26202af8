//! BLE transport to a target proxy.
//!
//! Outbound commands are written as JSON to one GATT characteristic and
//! inbound payloads arrive as notifications on another. Notifications are
//! MTU-sized chunks and are reassembled with [`FrameAssembler`].
//!
//! Requires the `bluetooth` feature and BlueZ (Linux only).

use std::sync::{Arc, Mutex};

use bluer::gatt::remote::Characteristic;
use bluer::{Address, Device};
use futures::{pin_mut, StreamExt};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::channel::{lock, ChannelError, ChannelEvent, ChannelEvents, MessageChannel, Subscriber};
use crate::config::BleSettings;
use crate::wire::{FrameAssembler, OutboundMessage};

/// Errors establishing a BLE link.
#[derive(Debug, Error)]
pub enum BleError {
    /// One of the BLE settings is missing.
    #[error("BLE link is not configured: {0} is missing")]
    NotConfigured(&'static str),

    /// A setting could not be parsed.
    #[error("invalid BLE setting {field}: {value}")]
    InvalidSetting {
        /// Setting name.
        field: &'static str,
        /// Value as configured.
        value: String,
    },

    /// The proxy does not expose the expected characteristic.
    #[error("characteristic {0} not found")]
    CharacteristicNotFound(Uuid),

    /// BlueZ reported an error.
    #[error("bluetooth error: {0}")]
    Bluetooth(#[from] bluer::Error),
}

#[derive(Debug, Default)]
struct BleState {
    connected: bool,
    subscriber: Subscriber,
}

impl BleState {
    fn mark_disconnected(&mut self) {
        if self.connected {
            self.connected = false;
            self.subscriber.deliver(ChannelEvent::Disconnected);
        }
    }
}

/// [`MessageChannel`] over a BLE write/notify characteristic pair.
#[derive(Debug)]
pub struct BleChannel {
    device: Device,
    state: Arc<Mutex<BleState>>,
    outbound: mpsc::UnboundedSender<Vec<u8>>,
    tasks: Vec<JoinHandle<()>>,
}

fn required<'a>(value: Option<&'a String>, field: &'static str) -> Result<&'a str, BleError> {
    value.map(String::as_str).ok_or(BleError::NotConfigured(field))
}

fn configured_uuid(value: Option<&String>, field: &'static str) -> Result<Uuid, BleError> {
    let value = required(value, field)?;
    Uuid::parse_str(value).map_err(|_| BleError::InvalidSetting {
        field,
        value: value.to_string(),
    })
}

async fn find_characteristic(
    device: &Device,
    service: Uuid,
    characteristic: Uuid,
) -> Result<Characteristic, BleError> {
    for candidate in device.services().await? {
        if candidate.uuid().await? != service {
            continue;
        }
        for found in candidate.characteristics().await? {
            if found.uuid().await? == characteristic {
                return Ok(found);
            }
        }
    }
    Err(BleError::CharacteristicNotFound(characteristic))
}

impl BleChannel {
    /// Connects to the proxy described by `settings`.
    ///
    /// # Errors
    ///
    /// Returns a [`BleError`] if the settings are incomplete, the adapter or
    /// device is unavailable, or the characteristics cannot be found.
    pub async fn connect(settings: &BleSettings) -> Result<Self, BleError> {
        let address = required(settings.address.as_ref(), "address")?;
        let address: Address = address.parse().map_err(|_| BleError::InvalidSetting {
            field: "address",
            value: address.to_string(),
        })?;
        let service = configured_uuid(settings.service_uuid.as_ref(), "service_uuid")?;
        let write_uuid = configured_uuid(settings.write_uuid.as_ref(), "write_uuid")?;
        let notify_uuid = configured_uuid(settings.notify_uuid.as_ref(), "notify_uuid")?;

        let session = bluer::Session::new().await?;
        let adapter = session.default_adapter().await?;
        adapter.set_powered(true).await?;

        let device = adapter.device(address)?;
        if !device.is_connected().await? {
            info!(%address, "Connecting to BLE proxy");
            device.connect().await?;
        }

        let writer = find_characteristic(&device, service, write_uuid).await?;
        let notifier = find_characteristic(&device, service, notify_uuid).await?;
        let notifications = notifier.notify().await?;

        let state = Arc::new(Mutex::new(BleState {
            connected: true,
            subscriber: Subscriber::default(),
        }));
        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<Vec<u8>>();

        let write_state = Arc::clone(&state);
        let write_task = tokio::spawn(async move {
            while let Some(bytes) = outbound_rx.recv().await {
                if let Err(err) = writer.write(&bytes).await {
                    warn!(error = %err, "BLE write failed");
                    lock(&write_state).mark_disconnected();
                    break;
                }
            }
        });

        let notify_state = Arc::clone(&state);
        let notify_task = tokio::spawn(async move {
            let mut frames = FrameAssembler::new();
            pin_mut!(notifications);
            while let Some(chunk) = notifications.next().await {
                for payload in frames.push(&chunk) {
                    debug!(payload = %payload, "BLE notification");
                    lock(&notify_state).subscriber.deliver(ChannelEvent::Message(payload));
                }
            }
            info!("BLE notification stream ended");
            lock(&notify_state).mark_disconnected();
        });

        info!(%address, "BLE link established");
        Ok(Self {
            device,
            state,
            outbound,
            tasks: vec![write_task, notify_task],
        })
    }
}

impl MessageChannel for BleChannel {
    fn send(&self, message: &OutboundMessage) -> Result<(), ChannelError> {
        if !lock(&self.state).connected {
            return Err(ChannelError::Disconnected);
        }
        self.outbound
            .send(message.to_json().into_bytes())
            .map_err(|_| ChannelError::Disconnected)
    }

    fn subscribe(&self) -> ChannelEvents {
        lock(&self.state).subscriber.replace()
    }

    fn is_connected(&self) -> bool {
        lock(&self.state).connected
    }

    fn disconnect(&self) {
        lock(&self.state).mark_disconnected();
        for task in &self.tasks {
            task.abort();
        }
        let device = self.device.clone();
        tokio::spawn(async move {
            if let Err(err) = device.disconnect().await {
                warn!(error = %err, "BLE disconnect failed");
            }
        });
    }
}

impl Drop for BleChannel {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}
