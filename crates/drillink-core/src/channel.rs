//! Transport abstraction between the link protocol and target devices.
//!
//! A [`MessageChannel`] sends structured commands and delivers raw inbound
//! payloads to a single subscriber. Payloads are passed through undecoded so
//! that the protocol decides what to do with malformed records.
//!
//! Implementations:
//! - [`MemoryChannel`] - in-process pair used by tests and local harnesses
//! - `BleChannel` - BLE characteristic write/notify (feature `bluetooth`)
//! - `DeviceHub` - WebSocket devices (in `drillink-server`)

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::wire::OutboundMessage;

/// Errors raised by a transport.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ChannelError {
    /// The link is down.
    #[error("channel is disconnected")]
    Disconnected,

    /// The transport rejected the message.
    #[error("send failed: {0}")]
    SendFailed(String),
}

/// Something that happened on the link.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    /// A raw inbound payload.
    Message(Value),
    /// One device dropped off a multi-device transport; the link is still up.
    DeviceDisconnected(String),
    /// The link went down.
    Disconnected,
}

/// Receiving half of a channel subscription.
pub type ChannelEvents = mpsc::UnboundedReceiver<ChannelEvent>;

/// Bidirectional message link to one or more target devices.
///
/// Sending never blocks; transports queue outbound messages. Only one
/// subscriber receives events at a time: subscribing again replaces it, and
/// dropping the receiver releases the subscription.
pub trait MessageChannel: Send + Sync {
    /// Queues a message for delivery.
    ///
    /// A message addressed to a device the transport cannot reach is dropped
    /// rather than rejected, so the protocol reports it as a missing ack.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::Disconnected`] if the link is down.
    fn send(&self, message: &OutboundMessage) -> Result<(), ChannelError>;

    /// Starts receiving inbound events.
    fn subscribe(&self) -> ChannelEvents;

    /// Whether the link is currently up.
    fn is_connected(&self) -> bool;

    /// Tears the link down.
    fn disconnect(&self);
}

/// Locks a mutex, recovering the data if a holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Subscriber slot shared by transports.
#[derive(Debug, Default)]
pub(crate) struct Subscriber {
    tx: Option<mpsc::UnboundedSender<ChannelEvent>>,
}

impl Subscriber {
    pub(crate) fn replace(&mut self) -> ChannelEvents {
        let (tx, rx) = mpsc::unbounded_channel();
        self.tx = Some(tx);
        rx
    }

    /// Delivers an event; returns `false` if nobody is listening.
    pub(crate) fn deliver(&mut self, event: ChannelEvent) -> bool {
        match &self.tx {
            Some(tx) if tx.send(event).is_ok() => true,
            Some(_) => {
                self.tx = None;
                false
            }
            None => false,
        }
    }
}

#[derive(Debug)]
struct MemoryState {
    connected: bool,
    subscriber: Subscriber,
    outbound: mpsc::UnboundedSender<OutboundMessage>,
}

/// In-process transport. The protocol side holds the [`MemoryChannel`];
/// the device side holds the matching [`DeviceEndpoint`].
#[derive(Debug, Clone)]
pub struct MemoryChannel {
    state: Arc<Mutex<MemoryState>>,
}

/// Device side of a [`MemoryChannel`].
#[derive(Debug)]
pub struct DeviceEndpoint {
    state: Arc<Mutex<MemoryState>>,
    outbound: mpsc::UnboundedReceiver<OutboundMessage>,
}

impl MemoryChannel {
    /// Creates a connected channel and its device endpoint.
    #[must_use]
    pub fn pair() -> (Self, DeviceEndpoint) {
        let (tx, rx) = mpsc::unbounded_channel();
        let state = Arc::new(Mutex::new(MemoryState {
            connected: true,
            subscriber: Subscriber::default(),
            outbound: tx,
        }));
        (
            Self {
                state: Arc::clone(&state),
            },
            DeviceEndpoint {
                state,
                outbound: rx,
            },
        )
    }
}

impl MessageChannel for MemoryChannel {
    fn send(&self, message: &OutboundMessage) -> Result<(), ChannelError> {
        let state = lock(&self.state);
        if !state.connected {
            return Err(ChannelError::Disconnected);
        }
        state
            .outbound
            .send(message.clone())
            .map_err(|_| ChannelError::Disconnected)
    }

    fn subscribe(&self) -> ChannelEvents {
        lock(&self.state).subscriber.replace()
    }

    fn is_connected(&self) -> bool {
        lock(&self.state).connected
    }

    fn disconnect(&self) {
        let mut state = lock(&self.state);
        if state.connected {
            state.connected = false;
            state.subscriber.deliver(ChannelEvent::Disconnected);
        }
    }
}

impl DeviceEndpoint {
    /// Waits for the next message sent by the protocol.
    pub async fn recv(&mut self) -> Option<OutboundMessage> {
        self.outbound.recv().await
    }

    /// Returns the next message if one is already queued.
    pub fn try_recv(&mut self) -> Option<OutboundMessage> {
        self.outbound.try_recv().ok()
    }

    /// Drains every queued message.
    pub fn drain(&mut self) -> Vec<OutboundMessage> {
        std::iter::from_fn(|| self.try_recv()).collect()
    }

    /// Delivers a payload to the subscriber. Returns `false` if nobody is
    /// subscribed or the link is down.
    pub fn deliver(&self, payload: Value) -> bool {
        let mut state = lock(&self.state);
        state.connected && state.subscriber.deliver(ChannelEvent::Message(payload))
    }

    /// Simulates one device leaving while the link stays up.
    pub fn drop_device(&self, name: &str) -> bool {
        let mut state = lock(&self.state);
        state.connected
            && state
                .subscriber
                .deliver(ChannelEvent::DeviceDisconnected(name.to_string()))
    }

    /// Simulates the link dropping.
    pub fn drop_link(&self) {
        let mut state = lock(&self.state);
        state.connected = false;
        state.subscriber.deliver(ChannelEvent::Disconnected);
    }
}
