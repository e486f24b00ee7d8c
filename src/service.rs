//! Relay service: the single driver that owns presence, delivery and FiMesh.
//!
//! One task runs [`RelayService::run`]. Each inbound packet refreshes presence (every
//! packet kind counts), FiMesh frames go to the transfer engine, and any other text is
//! handed back to the caller as a [`ChatMessage`]. Periodic timers advance transfer
//! sessions, scan the outbox, run resend passes and do housekeeping.

use anyhow::{anyhow, Result};
use chrono::{Duration as ChronoDuration, Utc};
use log::{debug, info, warn};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;

use crate::config::Config;
use crate::delivery::{DeliveryManager, SendOutcome, SendPacer};
use crate::fimesh::{FiMesh, FrameSender};
use crate::logutil::preview_frame;
use crate::meshtastic::{format_node_id, ControlMessage, Destination, InboundPacket, PacketKind, Transmitter};
use crate::metrics;
use crate::presence::{NodePresence, ProbeConfig};
use crate::storage::JsonStore;

const HOUSEKEEPING_SECS: u64 = 300;
const PRESENCE_FILE: &str = "presence.json";

/// A non-FiMesh text addressed to us or the channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    pub from: u32,
    pub to: Destination,
    pub channel: u32,
    pub interface: u8,
    pub text: String,
}

pub struct RelayService {
    config: Config,
    store: Arc<JsonStore>,
    presence: Arc<NodePresence>,
    delivery: Arc<DeliveryManager>,
    fimesh: Option<FiMesh>,
    presence_path: PathBuf,
    radio_control_tx: Option<mpsc::UnboundedSender<ControlMessage>>,
}

impl RelayService {
    /// Wire up storage, presence, delivery and (when enabled) FiMesh.
    ///
    /// `radio_control_tx` reaches the radio writer; it carries presence probes and the
    /// shutdown notice.
    pub async fn new(
        config: Config,
        transmitter: Arc<dyn Transmitter>,
        radio_control_tx: Option<mpsc::UnboundedSender<ControlMessage>>,
    ) -> Result<Self> {
        let store = Arc::new(
            JsonStore::open(&config.storage.data_dir)
                .map_err(|e| anyhow!("Failed to open store at {}: {}", config.storage.data_dir, e))?,
        );

        let mut presence = NodePresence::new(ChronoDuration::seconds(config.presence.online_window_secs as i64));
        if config.presence.use_probe {
            match &radio_control_tx {
                Some(tx) => {
                    presence = presence.with_probe(ProbeConfig {
                        control_tx: tx.clone(),
                        channel: config.node.channel,
                        timeout: Duration::from_secs(config.presence.probe_timeout_secs),
                    });
                }
                None => warn!("Presence probing enabled but no radio control channel; using passive presence only"),
            }
        }
        let presence_path = PathBuf::from(&config.storage.data_dir).join(PRESENCE_FILE);
        if presence_path.exists() {
            match presence.load_from_file(&presence_path) {
                Ok(n) => info!("Restored {} node sightings from {}", n, presence_path.display()),
                Err(e) => warn!("Ignoring unreadable presence cache {}: {}", presence_path.display(), e),
            }
        }
        let presence = Arc::new(presence);

        let pacer = Arc::new(SendPacer::new(
            Duration::from_millis(config.delivery.send_gap_ms),
            config.delivery.send_burst,
        ));
        let delivery = Arc::new(
            DeliveryManager::new(
                transmitter,
                store.clone(),
                presence.clone(),
                config.node.own_ids(),
                config.delivery.to_tuning(),
                pacer,
            )
            .with_frame_route(config.node.channel, config.node.interface),
        );

        let fimesh = if config.fimesh.enabled {
            let sender: Arc<dyn FrameSender> = delivery.clone();
            Some(
                FiMesh::new(sender, store.clone(), &config.fimesh.base_dir, config.fimesh.to_tuning())
                    .map_err(|e| anyhow!("Failed to set up FiMesh in {}: {}", config.fimesh.base_dir, e))?,
            )
        } else {
            None
        };

        Ok(Self {
            config,
            store,
            presence,
            delivery,
            fimesh,
            presence_path,
            radio_control_tx,
        })
    }

    pub fn delivery(&self) -> Arc<DeliveryManager> {
        self.delivery.clone()
    }

    pub fn presence(&self) -> Arc<NodePresence> {
        self.presence.clone()
    }

    pub fn fimesh(&self) -> Option<&FiMesh> {
        self.fimesh.as_ref()
    }

    pub fn store(&self) -> Arc<JsonStore> {
        self.store.clone()
    }

    /// Send a chat text on the configured channel and interface.
    pub async fn send_text(&self, text: &str, to: Destination) -> SendOutcome {
        self.delivery
            .send(text, self.config.node.channel, to, self.config.node.interface)
            .await
    }

    /// Route one inbound packet; returns the chat message when it is ordinary text.
    pub async fn handle_inbound(&mut self, packet: InboundPacket) -> Option<ChatMessage> {
        self.presence.observe(packet.from, packet.kind.label());
        match packet.kind {
            PacketKind::Text { channel, to, text } => {
                if let Some(fimesh) = self.fimesh.as_mut() {
                    if fimesh.handle_text(&text, packet.from).await {
                        return None;
                    }
                }
                debug!("Chat from {}: {}", format_node_id(packet.from), preview_frame(&text));
                Some(ChatMessage {
                    from: packet.from,
                    to,
                    channel,
                    interface: packet.interface,
                    text,
                })
            }
            _ => None,
        }
    }

    /// Save presence and prune old terminal message records.
    pub fn housekeeping(&self) {
        if let Err(e) = self.presence.save_to_file(&self.presence_path) {
            warn!("Presence cache not saved: {}", e);
        }
        let cutoff = Utc::now() - ChronoDuration::hours(self.config.delivery.prune_after_hours as i64);
        self.delivery.prune_terminal(cutoff);
    }

    /// Drive everything until a shutdown control message, channel close or Ctrl-C.
    pub async fn run(
        mut self,
        mut inbound_rx: mpsc::UnboundedReceiver<InboundPacket>,
        chat_tx: mpsc::UnboundedSender<ChatMessage>,
        mut control_rx: mpsc::UnboundedReceiver<ControlMessage>,
    ) -> Result<()> {
        let fcfg = self.config.fimesh.clone();
        let mut tick = tokio::time::interval(Duration::from_millis(fcfg.tick_ms.max(50)));
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut scan = tokio::time::interval(Duration::from_secs(fcfg.scan_interval_secs.max(1)));
        scan.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut resend =
            tokio::time::interval(Duration::from_secs(self.config.delivery.resend_interval_secs.max(1)));
        resend.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut housekeeping = tokio::time::interval(Duration::from_secs(HOUSEKEEPING_SECS));
        housekeeping.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            "Relay service running (FiMesh {}, own ids {:?})",
            if self.fimesh.is_some() { "enabled" } else { "disabled" },
            self.config.node.own_ids().into_iter().map(format_node_id).collect::<Vec<_>>()
        );

        loop {
            tokio::select! {
                _ = tick.tick() => {
                    if let Some(fimesh) = self.fimesh.as_mut() {
                        fimesh.tick().await;
                    }
                }
                _ = scan.tick() => {
                    if let Some(fimesh) = self.fimesh.as_mut() {
                        let started = fimesh.scan_outbox().await;
                        if started > 0 {
                            info!("Outbox scan started {} upload(s)", started);
                        }
                    }
                }
                _ = resend.tick() => {
                    let report = self.delivery.resend_all_known().await;
                    if report.attempted > 0 {
                        debug!("Resend sweep: {:?}", report);
                    }
                }
                _ = housekeeping.tick() => {
                    self.housekeeping();
                }
                packet = inbound_rx.recv() => {
                    match packet {
                        Some(packet) => {
                            if let Some(chat) = self.handle_inbound(packet).await {
                                if chat_tx.send(chat).is_err() {
                                    debug!("Chat consumer gone; dropping message");
                                }
                            }
                        }
                        None => {
                            info!("Inbound channel closed");
                            break;
                        }
                    }
                }
                ctrl = control_rx.recv() => {
                    match ctrl {
                        Some(ControlMessage::Shutdown) | None => {
                            info!("Shutdown requested");
                            break;
                        }
                        Some(other) => {
                            // Only the radio writer services pings
                            if let Some(tx) = &self.radio_control_tx {
                                let _ = tx.send(other);
                            }
                        }
                    }
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("Received shutdown signal");
                    break;
                }
            }
        }

        self.shutdown();
        Ok(())
    }

    fn shutdown(&mut self) {
        info!("Shutting down relay service...");
        self.housekeeping();
        if let Some(tx) = &self.radio_control_tx {
            let _ = tx.send(ControlMessage::Shutdown);
        }
        let m = metrics::snapshot();
        info!(
            "Session totals: {} delivered, {} deferred, {} undelivered, {} frames, {} retransmits, uploads {}/{} ok/failed, downloads {}/{} ok/failed",
            m.messages_delivered,
            m.messages_deferred,
            m.messages_undelivered,
            m.frames_sent,
            m.chunk_retransmits,
            m.uploads_completed,
            m.uploads_failed,
            m.downloads_assembled,
            m.downloads_failed
        );
        if let Some(ratio) = m.failure_ratio() {
            info!("Transmit failure ratio {:.2}", ratio);
        }
        info!("Relay service shutdown complete");
    }
}
