//! Node presence oracle.
//!
//! A node is online when anything at all was heard from it (text, telemetry, position,
//! routing, nodeinfo) within the configured window. When the passive record is stale and
//! probing is enabled, a want-ack ping is sent through the radio writer's control channel
//! and a timely ACK counts as a fresh sighting.

use chrono::{DateTime, Duration, Utc};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::RwLock;
use tokio::sync::{mpsc, oneshot};

use crate::meshtastic::{format_node_id, ControlMessage};

/// Probe wiring: where to send pings and how long to wait for the ACK.
#[derive(Debug, Clone)]
pub struct ProbeConfig {
    pub control_tx: mpsc::UnboundedSender<ControlMessage>,
    pub channel: u32,
    pub timeout: std::time::Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSighting {
    pub node_id: u32,
    pub last_seen: DateTime<Utc>,
    pub first_seen: DateTime<Utc>,
    /// Label of the packet kind that produced the latest sighting
    pub last_kind: String,
}

/// Serialized form of the sightings table.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct PresenceSnapshot {
    pub nodes: HashMap<u32, NodeSighting>,
    pub saved_at: Option<DateTime<Utc>>,
}

pub struct NodePresence {
    window: Duration,
    sightings: RwLock<HashMap<u32, NodeSighting>>,
    probe: Option<ProbeConfig>,
}

impl NodePresence {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            sightings: RwLock::new(HashMap::new()),
            probe: None,
        }
    }

    pub fn with_probe(mut self, probe: ProbeConfig) -> Self {
        self.probe = Some(probe);
        self
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Record that a packet of `kind` was heard from `node`.
    pub fn observe(&self, node: u32, kind: &str) {
        self.observe_at(node, kind, Utc::now());
    }

    pub fn observe_at(&self, node: u32, kind: &str, at: DateTime<Utc>) {
        let mut guard = match self.sightings.write() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard
            .entry(node)
            .and_modify(|s| {
                if at > s.last_seen {
                    s.last_seen = at;
                    s.last_kind = kind.to_string();
                }
            })
            .or_insert_with(|| NodeSighting {
                node_id: node,
                last_seen: at,
                first_seen: at,
                last_kind: kind.to_string(),
            });
    }

    pub fn last_seen(&self, node: u32) -> Option<DateTime<Utc>> {
        let guard = match self.sightings.read() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.get(&node).map(|s| s.last_seen)
    }

    /// Passive check only: heard within the window as of `now`.
    pub fn is_recent_at(&self, node: u32, now: DateTime<Utc>) -> bool {
        match self.last_seen(node) {
            Some(seen) => now.signed_duration_since(seen) <= self.window,
            None => false,
        }
    }

    /// Every node ever heard, most recently seen first.
    pub fn known_nodes(&self) -> Vec<u32> {
        let guard = match self.sightings.read() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut nodes: Vec<(u32, DateTime<Utc>)> =
            guard.values().map(|s| (s.node_id, s.last_seen)).collect();
        nodes.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        nodes.into_iter().map(|(id, _)| id).collect()
    }

    /// Is `node` reachable right now? Falls back to an active probe when configured.
    pub async fn is_online(&self, node: u32) -> bool {
        self.is_online_at(node, Utc::now()).await
    }

    pub async fn is_online_at(&self, node: u32, now: DateTime<Utc>) -> bool {
        if self.is_recent_at(node, now) {
            return true;
        }
        match &self.probe {
            Some(probe) => {
                if self.probe_node(probe, node).await {
                    self.observe_at(node, "probe", now);
                    true
                } else {
                    false
                }
            }
            None => false,
        }
    }

    async fn probe_node(&self, probe: &ProbeConfig, node: u32) -> bool {
        let (response_tx, response_rx) = oneshot::channel();
        let ping = ControlMessage::SendPing {
            to: node,
            channel: probe.channel,
            response_tx,
        };
        if probe.control_tx.send(ping).is_err() {
            warn!("Presence probe for {} not sent: control channel closed", format_node_id(node));
            return false;
        }
        match tokio::time::timeout(probe.timeout, response_rx).await {
            Ok(Ok(true)) => {
                debug!("Presence probe ACKed by {}", format_node_id(node));
                true
            }
            Ok(Ok(false)) => {
                debug!("Presence probe to {} failed", format_node_id(node));
                false
            }
            Ok(Err(_)) => {
                warn!("Presence probe response channel closed for {}", format_node_id(node));
                false
            }
            Err(_) => {
                debug!("Presence probe to {} timed out", format_node_id(node));
                false
            }
        }
    }

    pub fn snapshot(&self) -> PresenceSnapshot {
        let guard = match self.sightings.read() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        PresenceSnapshot {
            nodes: guard.clone(),
            saved_at: Some(Utc::now()),
        }
    }

    /// Merge a persisted snapshot; newer in-memory sightings win.
    pub fn restore(&self, snapshot: PresenceSnapshot) {
        for sighting in snapshot.nodes.into_values() {
            let kind = sighting.last_kind.clone();
            self.observe_at(sighting.node_id, &kind, sighting.last_seen);
            let mut guard = match self.sightings.write() {
                Ok(g) => g,
                Err(poisoned) => poisoned.into_inner(),
            };
            if let Some(s) = guard.get_mut(&sighting.node_id) {
                if sighting.first_seen < s.first_seen {
                    s.first_seen = sighting.first_seen;
                }
            }
        }
    }

    pub fn load_from_file<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<usize> {
        let content = std::fs::read_to_string(path)?;
        // Guard against accidental leading NULs from previous partial writes
        let cleaned = content.trim_start_matches('\0');
        let snapshot: PresenceSnapshot = serde_json::from_str(cleaned)?;
        let count = snapshot.nodes.len();
        self.restore(snapshot);
        Ok(count)
    }

    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let content = serde_json::to_string_pretty(&self.snapshot())?;
        crate::storage::write_atomic(path.as_ref(), content.as_bytes())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recency_window_decides_online() {
        let presence = NodePresence::new(Duration::seconds(1800));
        let t0 = Utc::now();
        assert!(!presence.is_recent_at(0xbeef, t0));
        presence.observe_at(0xbeef, "telemetry", t0);
        assert!(presence.is_recent_at(0xbeef, t0 + Duration::seconds(1800)));
        assert!(!presence.is_recent_at(0xbeef, t0 + Duration::seconds(1801)));
    }

    #[test]
    fn older_observations_do_not_rewind_last_seen() {
        let presence = NodePresence::new(Duration::seconds(60));
        let t0 = Utc::now();
        presence.observe_at(1, "text", t0);
        presence.observe_at(1, "position", t0 - Duration::seconds(30));
        assert_eq!(presence.last_seen(1), Some(t0));
    }

    #[test]
    fn known_nodes_sorted_by_recency() {
        let presence = NodePresence::new(Duration::seconds(60));
        let t0 = Utc::now();
        presence.observe_at(1, "text", t0 - Duration::seconds(10));
        presence.observe_at(2, "nodeinfo", t0);
        assert_eq!(presence.known_nodes(), vec![2, 1]);
    }

    #[tokio::test]
    async fn probe_ack_marks_node_online() {
        let (control_tx, mut control_rx) = mpsc::unbounded_channel();
        let presence = NodePresence::new(Duration::seconds(60)).with_probe(ProbeConfig {
            control_tx,
            channel: 0,
            timeout: std::time::Duration::from_secs(5),
        });
        tokio::spawn(async move {
            if let Some(ControlMessage::SendPing { response_tx, .. }) = control_rx.recv().await {
                let _ = response_tx.send(true);
            }
        });
        assert!(presence.is_online(0xabc).await);
        assert!(presence.last_seen(0xabc).is_some());
    }

    #[tokio::test]
    async fn stale_node_without_probe_is_offline() {
        let presence = NodePresence::new(Duration::seconds(60));
        presence.observe_at(7, "text", Utc::now() - Duration::seconds(120));
        assert!(!presence.is_online(7).await);
    }

    #[test]
    fn snapshot_survives_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("presence.json");
        let presence = NodePresence::new(Duration::seconds(60));
        presence.observe_at(42, "routing", Utc::now());
        presence.save_to_file(&path).unwrap();

        let restored = NodePresence::new(Duration::seconds(60));
        assert_eq!(restored.load_from_file(&path).unwrap(), 1);
        assert_eq!(restored.last_seen(42), presence.last_seen(42));
    }
}
