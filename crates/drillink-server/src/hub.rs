//! WebSocket device hub.
//!
//! Target devices (or a proxy speaking for them) connect over WebSocket and
//! register under a target name. The hub routes addressed commands to the
//! matching socket, broadcasts the rest, and funnels every inbound frame into
//! a single [`MessageChannel`] subscription for the running drill.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use drillink_core::channel::{ChannelError, ChannelEvent, ChannelEvents, MessageChannel};
use drillink_core::wire::OutboundMessage;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use utoipa::ToSchema;

/// Errors registering a device connection.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum HubError {
    /// Another socket is already registered under this name.
    #[error("device '{0}' is already connected")]
    DuplicateDevice(String),
}

/// A connected device as reported by the API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ConnectedDevice {
    /// Target name the socket registered under.
    #[schema(example = "t1")]
    pub name: String,
    /// When the socket connected.
    pub connected_at: DateTime<Utc>,
}

#[derive(Debug)]
struct DeviceConnection {
    id: u64,
    connected_at: DateTime<Utc>,
    outbound: mpsc::UnboundedSender<String>,
}

#[derive(Debug, Default)]
struct HubInner {
    next_id: u64,
    devices: BTreeMap<String, DeviceConnection>,
    subscriber: Option<mpsc::UnboundedSender<ChannelEvent>>,
}

impl HubInner {
    fn notify(&mut self, event: ChannelEvent) {
        if let Some(tx) = &self.subscriber {
            if tx.send(event).is_err() {
                self.subscriber = None;
            }
        }
    }
}

/// Registration of one socket with the hub.
#[derive(Debug)]
pub struct Registration {
    /// Connection id, passed back to [`DeviceHub::unregister`].
    pub id: u64,
    /// Frames to write to the socket.
    pub outbound: mpsc::UnboundedReceiver<String>,
}

/// [`MessageChannel`] over a set of WebSocket-connected devices.
#[derive(Debug, Default)]
pub struct DeviceHub {
    inner: Mutex<HubInner>,
}

impl DeviceHub {
    /// Creates an empty hub.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HubInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers a socket under `name`.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::DuplicateDevice`] if the name is taken.
    pub fn register(&self, name: &str) -> Result<Registration, HubError> {
        let mut inner = self.lock();
        if inner.devices.contains_key(name) {
            return Err(HubError::DuplicateDevice(name.to_string()));
        }
        inner.next_id += 1;
        let id = inner.next_id;
        let (tx, rx) = mpsc::unbounded_channel();
        inner.devices.insert(
            name.to_string(),
            DeviceConnection {
                id,
                connected_at: Utc::now(),
                outbound: tx,
            },
        );
        info!(device = name, "Device connected");
        Ok(Registration { id, outbound: rx })
    }

    /// Removes a socket.
    ///
    /// The subscriber sees the device leave; a drill only fails if the device
    /// is one of its targets. Losing the last socket takes the link down.
    pub fn unregister(&self, name: &str, id: u64) {
        let mut inner = self.lock();
        if inner.devices.get(name).is_some_and(|conn| conn.id == id) {
            inner.devices.remove(name);
            info!(device = name, "Device disconnected");
            inner.notify(ChannelEvent::DeviceDisconnected(name.to_string()));
            if inner.devices.is_empty() {
                inner.notify(ChannelEvent::Disconnected);
            }
        }
    }

    /// Feeds a text frame received from `name` to the subscriber.
    ///
    /// Payloads without a device identifier are attributed to the socket's
    /// registered name. Frames that are not JSON are dropped.
    pub fn inbound(&self, name: &str, text: &str) {
        let mut payload: Value = match serde_json::from_str(text) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(device = name, error = %err, "Dropping non-JSON frame");
                return;
            }
        };
        if let Some(object) = payload.as_object_mut() {
            let identified = ["device", "target_id", "name"]
                .iter()
                .any(|key| object.get(*key).is_some_and(Value::is_string));
            if !identified {
                object.insert("device".to_string(), Value::String(name.to_string()));
            }
        }
        debug!(device = name, "Inbound frame");
        self.lock().notify(ChannelEvent::Message(payload));
    }

    /// Connected devices, sorted by name.
    #[must_use]
    pub fn devices(&self) -> Vec<ConnectedDevice> {
        self.lock()
            .devices
            .iter()
            .map(|(name, conn)| ConnectedDevice {
                name: name.clone(),
                connected_at: conn.connected_at,
            })
            .collect()
    }

    /// Number of connected devices.
    #[must_use]
    pub fn device_count(&self) -> usize {
        self.lock().devices.len()
    }
}

impl MessageChannel for DeviceHub {
    fn send(&self, message: &OutboundMessage) -> Result<(), ChannelError> {
        let inner = self.lock();
        if inner.devices.is_empty() {
            return Err(ChannelError::Disconnected);
        }
        let frame = message.to_json();
        match message.dest() {
            Some(dest) => {
                // The protocol reports the device as a missing ack.
                let Some(conn) = inner.devices.get(dest) else {
                    warn!(device = dest, "Dropping message for unconnected device");
                    return Ok(());
                };
                conn.outbound.send(frame).map_err(|_| {
                    ChannelError::SendFailed(format!("socket for '{dest}' is closed"))
                })
            }
            None => {
                for (name, conn) in &inner.devices {
                    if conn.outbound.send(frame.clone()).is_err() {
                        warn!(device = %name, "Broadcast to closed socket");
                    }
                }
                Ok(())
            }
        }
    }

    fn subscribe(&self) -> ChannelEvents {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().subscriber = Some(tx);
        rx
    }

    fn is_connected(&self) -> bool {
        !self.lock().devices.is_empty()
    }

    fn disconnect(&self) {
        let mut inner = self.lock();
        // Dropping the senders ends each socket's writer task.
        inner.devices.clear();
        inner.notify(ChannelEvent::Disconnected);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use drillink_core::wire::Command;
    use serde_json::json;

    fn ready(dest: &str) -> OutboundMessage {
        OutboundMessage::Forward {
            dest: Some(dest.into()),
            content: Command::Ready {
                is_first: true,
                is_last: true,
                target_type: "ipsc".into(),
                timeout: 30.0,
                delay: 0.0,
            },
        }
    }

    #[test]
    fn test_register_rejects_duplicate_names() {
        let hub = DeviceHub::new();
        let _t1 = hub.register("t1").unwrap();
        assert_eq!(
            hub.register("t1").unwrap_err(),
            HubError::DuplicateDevice("t1".into())
        );
        assert_eq!(hub.device_count(), 1);
    }

    #[test]
    fn test_addressed_messages_reach_one_socket() {
        let hub = DeviceHub::new();
        let mut t1 = hub.register("t1").unwrap();
        let mut t2 = hub.register("t2").unwrap();

        tokio_test::assert_ok!(hub.send(&ready("t2")));
        assert!(t1.outbound.try_recv().is_err());
        let frame: Value = serde_json::from_str(&t2.outbound.try_recv().unwrap()).unwrap();
        assert_eq!(frame["dest"], "t2");
        assert_eq!(frame["content"]["command"], "ready");
    }

    #[test]
    fn test_broadcast_reaches_every_socket() {
        let hub = DeviceHub::new();
        let mut t1 = hub.register("t1").unwrap();
        let mut t2 = hub.register("t2").unwrap();

        hub.send(&OutboundMessage::Forward {
            dest: None,
            content: Command::Start { repeat: 1 },
        })
        .unwrap();
        assert!(t1.outbound.try_recv().unwrap().contains("start"));
        assert!(t2.outbound.try_recv().unwrap().contains("start"));
    }

    #[test]
    fn test_send_errors() {
        let hub = DeviceHub::new();
        assert_eq!(hub.send(&ready("t1")), Err(ChannelError::Disconnected));
        let mut t1 = hub.register("t1").unwrap();
        assert_eq!(hub.send(&ready("t9")), Ok(()));
        assert!(t1.outbound.try_recv().is_err());

        let t2 = hub.register("t2").unwrap();
        drop(t2.outbound);
        assert!(matches!(hub.send(&ready("t2")), Err(ChannelError::SendFailed(_))));
    }

    #[tokio::test]
    async fn test_inbound_frames_are_attributed() {
        let hub = DeviceHub::new();
        let _t1 = hub.register("t1").unwrap();
        let mut events = hub.subscribe();

        hub.inbound("t1", r#"{"content":{"ack":"ready"}}"#);
        hub.inbound("t1", "not json");
        hub.inbound("t1", r#"{"device":"proxied","content":{}}"#);

        assert_eq!(
            events.recv().await,
            Some(ChannelEvent::Message(json!({"device": "t1", "content": {"ack": "ready"}})))
        );
        assert_eq!(
            events.recv().await,
            Some(ChannelEvent::Message(json!({"device": "proxied", "content": {}})))
        );
    }

    #[tokio::test]
    async fn test_unregister_signals_disconnect() {
        let hub = DeviceHub::new();
        let t1 = hub.register("t1").unwrap();
        let t2 = hub.register("t2").unwrap();
        let mut events = hub.subscribe();

        hub.unregister("t1", t1.id + 5);
        assert_eq!(hub.device_count(), 2);

        hub.unregister("t1", t1.id);
        assert!(hub.is_connected());
        assert_eq!(
            events.recv().await,
            Some(ChannelEvent::DeviceDisconnected("t1".into()))
        );

        hub.unregister("t2", t2.id);
        assert!(!hub.is_connected());
        assert_eq!(
            events.recv().await,
            Some(ChannelEvent::DeviceDisconnected("t2".into()))
        );
        assert_eq!(events.recv().await, Some(ChannelEvent::Disconnected));
    }

    mod drills {
        use super::*;
        use std::sync::Arc;

        use drillink_core::wire::{ack_payload, AckKind};
        use drillink_core::{
            run_repeat, DrillMode, DrillSetup, LinkFailure, LinkSettings, ShotEvent,
            TargetConfig, TargetType,
        };

        fn setup(names: &[&str]) -> DrillSetup {
            DrillSetup {
                name: "hub drill".into(),
                mode: DrillMode::Ipsc,
                targets: names
                    .iter()
                    .zip(1..)
                    .map(|(name, seq)| TargetConfig::new(seq, *name, TargetType::Ipsc))
                    .collect(),
                repeats: 1,
            }
        }

        fn settings() -> LinkSettings {
            LinkSettings {
                ready_ack_timeout_secs: 2.0,
                end_ack_grace_secs: 1.0,
                max_duration_secs: 5.0,
                auto_end_on_counted_shots: false,
                ..LinkSettings::default()
            }
        }

        fn command(frame: &str) -> String {
            let frame: Value = serde_json::from_str(frame).unwrap();
            frame["content"]["command"].as_str().unwrap_or_default().to_string()
        }

        /// Plays `name` over the hub: acks ready, fires one shot on start
        /// (after running `on_start`), and acks end.
        async fn play_target(
            hub: Arc<DeviceHub>,
            name: &'static str,
            mut registration: Registration,
            on_start: impl FnOnce(&DeviceHub) + Send + 'static,
        ) {
            let mut on_start = Some(on_start);
            while let Some(frame) = registration.outbound.recv().await {
                match command(&frame).as_str() {
                    "ready" => hub.inbound(name, &ack_payload(name, AckKind::Ready).to_string()),
                    "start" => {
                        if let Some(hook) = on_start.take() {
                            hook(hub.as_ref());
                        }
                        let shot = ShotEvent::new(name, "azone", 0.6, "ipsc").to_wire();
                        hub.inbound(name, &shot.to_string());
                    }
                    "end" => {
                        hub.inbound(name, &ack_payload(name, AckKind::End).to_string());
                        break;
                    }
                    _ => {}
                }
            }
        }

        #[tokio::test(start_paused = true)]
        async fn test_bystander_leaving_does_not_fail_repeat() {
            let hub = Arc::new(DeviceHub::new());
            let t1 = hub.register("t1").unwrap();
            let bystander = hub.register("bystander").unwrap();
            let bystander_id = bystander.id;

            let device = tokio::spawn(play_target(Arc::clone(&hub), "t1", t1, move |hub| {
                hub.unregister("bystander", bystander_id);
            }));

            let summary = run_repeat(hub.as_ref(), &setup(&["t1"]), &settings(), 1, None)
                .await
                .unwrap();
            assert_eq!(summary.shots.len(), 1);
            assert_eq!(hub.device_count(), 1);
            device.await.unwrap();
        }

        #[tokio::test(start_paused = true)]
        async fn test_target_leaving_fails_repeat() {
            let hub = Arc::new(DeviceHub::new());
            let t1 = hub.register("t1").unwrap();
            let t2 = hub.register("t2").unwrap();
            let t2_id = t2.id;

            let t2_hub = Arc::clone(&hub);
            let t2_task = tokio::spawn(async move {
                let mut t2 = t2;
                while let Some(frame) = t2.outbound.recv().await {
                    if command(&frame) == "ready" {
                        t2_hub.inbound("t2", &ack_payload("t2", AckKind::Ready).to_string());
                    }
                }
            });
            let t1_task = tokio::spawn(play_target(Arc::clone(&hub), "t1", t1, move |hub| {
                hub.unregister("t2", t2_id);
            }));

            let drill = setup(&["t1", "t2"]);
            let result = run_repeat(hub.as_ref(), &drill, &settings(), 1, None).await;
            assert_eq!(result, Err(LinkFailure::Disconnected));
            t2_task.abort();
            t1_task.abort();
        }

        #[tokio::test(start_paused = true)]
        async fn test_unconnected_target_times_out_on_ready() {
            let hub = Arc::new(DeviceHub::new());
            let t1 = hub.register("t1").unwrap();
            let device = tokio::spawn(play_target(Arc::clone(&hub), "t1", t1, |_| {}));

            let failure = run_repeat(hub.as_ref(), &setup(&["t1", "t2"]), &settings(), 1, None)
                .await
                .unwrap_err();
            assert_eq!(
                failure,
                LinkFailure::AckTimeout {
                    missing: vec!["t2".to_string()]
                }
            );
            assert!(failure.is_actionable());
            device.abort();
        }
    }
}
