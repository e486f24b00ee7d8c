//! # Delivery Manager - Reliable Text Delivery
//!
//! Turns "send this text to this destination" into an at-least-once, retried and
//! eventually terminal operation. Every outbound text in the process goes through
//! [`DeliveryManager`]: chat replies, broadcasts and FiMesh frames share one retry path
//! and one [`SendPacer`], so bulk transfers are throttled exactly like chat traffic.
//!
//! ## Message life cycle
//!
//! ```text
//! send() ──offline──► queued (attempt_count = 0)
//!   │
//!   └──online──► sent ──ok──► delivered
//!                  │
//!                  └─ max_direct_attempts failures ─► queued (defer_count += 1,
//!                                                     next_retry = now + step·defer_count)
//! resend_pass() ─► queued/sent ─► delivered | queued | undelivered (lifetime ceiling)
//! ```
//!
//! `delivered` and `undelivered` are terminal. The lifetime ceiling counts every attempt
//! the message ever made, across calls and restarts.
//!
//! ## Crash accounting
//!
//! `attempt_count` and `last_attempt_time` are persisted before each transmit, so a crash
//! mid-send over-counts an attempt rather than losing one.

mod pacer;

pub use pacer::SendPacer;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use log::{debug, error, info, warn};
use std::sync::Arc;

use crate::codec::chunk_text;
use crate::fimesh::FrameSender;
use crate::logutil::preview_frame;
use crate::meshtastic::{format_node_id, Destination, TransmitError, Transmitter};
use crate::metrics;
use crate::presence::NodePresence;
use crate::storage::{MessageRecord, MessageStatus, MessageStore, StorageError};

/// Plain-valued retry and sizing knobs, usually built from `[delivery]` config.
#[derive(Debug, Clone)]
pub struct DeliveryTuning {
    pub max_direct_attempts: u32,
    pub max_total_attempts: u32,
    /// Sleep after the n-th failed attempt within one call (last value repeats)
    pub direct_backoff: Vec<std::time::Duration>,
    pub defer_step: Duration,
    pub resend_min_age: Duration,
    pub max_text_bytes: usize,
}

impl Default for DeliveryTuning {
    fn default() -> Self {
        Self {
            max_direct_attempts: 3,
            max_total_attempts: 9,
            direct_backoff: vec![
                std::time::Duration::from_secs(1),
                std::time::Duration::from_secs(2),
                std::time::Duration::from_secs(4),
            ],
            defer_step: Duration::seconds(60),
            resend_min_age: Duration::seconds(30),
            max_text_bytes: 200,
        }
    }
}

impl DeliveryTuning {
    /// Same policy with every backoff sleep removed.
    pub fn without_backoff(mut self) -> Self {
        self.direct_backoff = vec![std::time::Duration::ZERO];
        self
    }

    fn backoff_after(&self, failures: u32) -> std::time::Duration {
        if self.direct_backoff.is_empty() {
            return std::time::Duration::ZERO;
        }
        let idx = (failures.saturating_sub(1) as usize).min(self.direct_backoff.len() - 1);
        self.direct_backoff[idx]
    }
}

/// Result of a send or redelivery attempt, as observed by the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    Delivered(String),
    /// Persisted for a later resend pass (destination offline or direct attempts exhausted)
    Queued(String),
    /// Lifetime attempt ceiling reached
    Undelivered(String),
    /// Nothing was persisted or sent
    Rejected(&'static str),
}

impl SendOutcome {
    pub fn is_delivered(&self) -> bool {
        matches!(self, SendOutcome::Delivered(_))
    }

    pub fn message_id(&self) -> Option<&str> {
        match self {
            SendOutcome::Delivered(id) | SendOutcome::Queued(id) | SendOutcome::Undelivered(id) => {
                Some(id)
            }
            SendOutcome::Rejected(_) => None,
        }
    }
}

/// Summary of one resend pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ResendReport {
    pub attempted: usize,
    pub delivered: usize,
    pub requeued: usize,
    pub undelivered: usize,
}

impl ResendReport {
    fn record(&mut self, outcome: &SendOutcome) {
        self.attempted += 1;
        match outcome {
            SendOutcome::Delivered(_) => self.delivered += 1,
            SendOutcome::Queued(_) => self.requeued += 1,
            SendOutcome::Undelivered(_) => self.undelivered += 1,
            SendOutcome::Rejected(_) => {}
        }
    }

    fn merge(&mut self, other: &ResendReport) {
        self.attempted += other.attempted;
        self.delivered += other.delivered;
        self.requeued += other.requeued;
        self.undelivered += other.undelivered;
    }
}

pub struct DeliveryManager {
    transmitter: Arc<dyn Transmitter>,
    store: Arc<dyn MessageStore>,
    presence: Arc<NodePresence>,
    own_ids: Vec<u32>,
    tuning: DeliveryTuning,
    pacer: Arc<SendPacer>,
    frame_channel: u32,
    frame_interface: u8,
}

impl DeliveryManager {
    pub fn new(
        transmitter: Arc<dyn Transmitter>,
        store: Arc<dyn MessageStore>,
        presence: Arc<NodePresence>,
        own_ids: Vec<u32>,
        tuning: DeliveryTuning,
        pacer: Arc<SendPacer>,
    ) -> Self {
        Self {
            transmitter,
            store,
            presence,
            own_ids,
            tuning,
            pacer,
            frame_channel: 0,
            frame_interface: 1,
        }
    }

    /// Channel and interface used for FiMesh frames.
    pub fn with_frame_route(mut self, channel: u32, interface: u8) -> Self {
        self.frame_channel = channel;
        self.frame_interface = interface;
        self
    }

    pub fn tuning(&self) -> &DeliveryTuning {
        &self.tuning
    }

    pub fn is_own_node(&self, node: u32) -> bool {
        self.own_ids.contains(&node)
    }

    /// Send `text` to `destination`. Never propagates transport errors: the outcome and
    /// the persisted record are the only results.
    pub async fn send(
        &self,
        text: &str,
        channel: u32,
        destination: Destination,
        interface: u8,
    ) -> SendOutcome {
        self.send_inner(text, channel, destination, interface, false, Utc::now()).await
    }

    pub async fn send_at(
        &self,
        text: &str,
        channel: u32,
        destination: Destination,
        interface: u8,
        now: DateTime<Utc>,
    ) -> SendOutcome {
        self.send_inner(text, channel, destination, interface, false, now).await
    }

    /// Send one FiMesh frame as a single radio message (no chat chunking).
    pub async fn send_frame(&self, text: &str, node: u32) -> SendOutcome {
        let outcome = self
            .send_inner(
                text,
                self.frame_channel,
                Destination::Node(node),
                self.frame_interface,
                true,
                Utc::now(),
            )
            .await;
        if let SendOutcome::Delivered(id) = &outcome {
            metrics::inc_frames_sent();
            // Frames are acknowledged at the transfer layer; their records are not kept once on air
            if let Err(e) = self.store.delete_message(id) {
                warn!("Could not drop frame record {}: {}", id, e);
            }
        }
        outcome
    }

    async fn send_inner(
        &self,
        text: &str,
        channel: u32,
        destination: Destination,
        interface: u8,
        bypass_chunking: bool,
        now: DateTime<Utc>,
    ) -> SendOutcome {
        if text.trim().is_empty() {
            debug!("Rejecting empty message to {}", destination);
            return SendOutcome::Rejected("empty message");
        }
        if let Destination::Node(node) = destination {
            if self.is_own_node(node) {
                warn!(
                    "Purging message addressed to own node {}: {}",
                    format_node_id(node),
                    preview_frame(text)
                );
                return SendOutcome::Rejected("addressed to own node");
            }
        }

        let mut record = MessageRecord {
            id: uuid::Uuid::new_v4().to_string(),
            from_node: self.own_ids.first().copied(),
            to_node: destination.node(),
            channel,
            interface,
            text: text.to_string(),
            created_at: now,
            status: MessageStatus::Queued,
            attempt_count: 0,
            defer_count: 0,
            delivered: false,
            last_attempt_time: None,
            next_retry_time: None,
            error_message: None,
            bypass_chunking,
        };

        if let Destination::Node(node) = destination {
            if !self.presence.is_online_at(node, now).await {
                info!(
                    "{} offline; queued message {} for later delivery",
                    format_node_id(node),
                    record.id
                );
                if let Err(e) = self.store.save_message(&record) {
                    error!("Failed to persist queued message {}: {}", record.id, e);
                }
                return SendOutcome::Queued(record.id);
            }
        }

        record.status = MessageStatus::Sent;
        self.deliver(record, now).await
    }

    /// The attempt loop shared by first sends and resend passes.
    async fn deliver(&self, mut record: MessageRecord, now: DateTime<Utc>) -> SendOutcome {
        let destination = Destination::from_raw(record.to_node.unwrap_or(crate::meshtastic::BROADCAST_ADDR));
        let mut failures: u32 = 0;

        loop {
            if record.attempt_count >= self.tuning.max_total_attempts {
                return self.mark_undelivered(record, "attempt ceiling reached");
            }

            record.attempt_count += 1;
            record.last_attempt_time = Some(now);
            self.persist(&record);

            match self.transmit_record(&record, destination).await {
                Ok(()) => {
                    record.status = MessageStatus::Delivered;
                    record.delivered = true;
                    record.error_message = None;
                    record.next_retry_time = None;
                    self.persist(&record);
                    metrics::inc_messages_delivered();
                    debug!(
                        "Delivered {} to {} on attempt {}",
                        record.id, destination, record.attempt_count
                    );
                    return SendOutcome::Delivered(record.id);
                }
                Err(e) => {
                    failures += 1;
                    warn!(
                        "Transmit to {} failed (attempt {}/{} lifetime, {} this call): {}",
                        destination, record.attempt_count, self.tuning.max_total_attempts, failures, e
                    );
                    record.error_message = Some(e.to_string());

                    if record.attempt_count >= self.tuning.max_total_attempts {
                        return self.mark_undelivered(record, "attempt ceiling reached");
                    }
                    if failures >= self.tuning.max_direct_attempts {
                        record.status = MessageStatus::Queued;
                        record.defer_count += 1;
                        record.next_retry_time =
                            Some(now + self.tuning.defer_step * record.defer_count as i32);
                        self.persist(&record);
                        metrics::inc_messages_deferred();
                        info!(
                            "Deferred {} to {} (defer #{}, next retry {})",
                            record.id,
                            destination,
                            record.defer_count,
                            record.next_retry_time.map(|t| t.to_rfc3339()).unwrap_or_default()
                        );
                        return SendOutcome::Queued(record.id);
                    }
                    let backoff = self.tuning.backoff_after(failures);
                    if !backoff.is_zero() {
                        tokio::time::sleep(backoff).await;
                    }
                }
            }
        }
    }

    async fn transmit_record(
        &self,
        record: &MessageRecord,
        destination: Destination,
    ) -> Result<(), TransmitError> {
        let chunks = if record.bypass_chunking {
            vec![record.text.clone()]
        } else {
            chunk_text(&record.text, self.tuning.max_text_bytes)
        };
        for chunk in &chunks {
            self.pacer.acquire().await;
            metrics::inc_transmit_attempts();
            if let Err(e) = self
                .transmitter
                .transmit(chunk, record.channel, destination, record.interface)
            {
                metrics::inc_transmit_failures();
                if e.needs_reconnect() {
                    debug!("Transport for interface {} reports link loss", record.interface);
                }
                return Err(e);
            }
            debug!("TX {} -> {}", preview_frame(chunk), destination);
        }
        Ok(())
    }

    fn mark_undelivered(&self, mut record: MessageRecord, reason: &str) -> SendOutcome {
        record.status = MessageStatus::Undelivered;
        record.next_retry_time = None;
        if record.error_message.is_none() {
            record.error_message = Some(reason.to_string());
        }
        self.persist(&record);
        metrics::inc_messages_undelivered();
        error!(
            "Message {} undelivered after {} attempts: {}",
            record.id,
            record.attempt_count,
            record.error_message.as_deref().unwrap_or(reason)
        );
        SendOutcome::Undelivered(record.id)
    }

    fn persist(&self, record: &MessageRecord) {
        if let Err(e) = self.store.save_message(record) {
            error!("Failed to persist message {}: {}", record.id, e);
        }
    }

    /// Retry pending messages to `node` (stale `sent` and due `queued`).
    pub async fn resend_pass(&self, node: u32) -> ResendReport {
        self.resend_pass_at(node, Utc::now()).await
    }

    pub async fn resend_pass_at(&self, node: u32, now: DateTime<Utc>) -> ResendReport {
        let mut report = ResendReport::default();
        if self.is_own_node(node) {
            return report;
        }
        if !self.presence.is_online_at(node, now).await {
            debug!("Resend pass skipped: {} offline", format_node_id(node));
            return report;
        }

        let mut pending = match self.collect_pending(node, now) {
            Ok(p) => p,
            Err(e) => {
                error!("Resend pass for {} could not read store: {}", format_node_id(node), e);
                return report;
            }
        };
        pending.sort_by(|a, b| a.created_at.cmp(&b.created_at));

        for record in pending {
            let is_frame = record.bypass_chunking;
            let outcome = self.deliver(record, now).await;
            if let (true, SendOutcome::Delivered(id)) = (is_frame, &outcome) {
                metrics::inc_frames_sent();
                if let Err(e) = self.store.delete_message(id) {
                    warn!("Could not drop frame record {}: {}", id, e);
                }
            }
            report.record(&outcome);
        }
        if report.attempted > 0 {
            info!(
                "Resend pass for {}: {} attempted, {} delivered, {} requeued, {} undelivered",
                format_node_id(node),
                report.attempted,
                report.delivered,
                report.requeued,
                report.undelivered
            );
        }
        report
    }

    fn collect_pending(&self, node: u32, now: DateTime<Utc>) -> Result<Vec<MessageRecord>, StorageError> {
        let mut pending = self.store.pending_sent(
            node,
            now - self.tuning.resend_min_age,
            self.tuning.max_direct_attempts,
        )?;
        pending.extend(self.store.due_queued(node, now, self.tuning.max_total_attempts)?);
        Ok(pending)
    }

    /// Retry due `queued` broadcasts. Broadcasts have no presence gate.
    pub async fn resend_broadcasts_at(&self, now: DateTime<Utc>) -> ResendReport {
        let mut report = ResendReport::default();
        let mut pending = match self.store.due_queued_broadcasts(now, self.tuning.max_total_attempts) {
            Ok(p) => p,
            Err(e) => {
                error!("Broadcast resend could not read store: {}", e);
                return report;
            }
        };
        pending.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        for record in pending {
            let outcome = self.deliver(record, now).await;
            report.record(&outcome);
        }
        if report.attempted > 0 {
            info!(
                "Broadcast resend: {} attempted, {} delivered, {} requeued, {} undelivered",
                report.attempted, report.delivered, report.requeued, report.undelivered
            );
        }
        report
    }

    /// Resend pass over every node the presence oracle has heard, except our own ids,
    /// followed by any due broadcasts.
    pub async fn resend_all_known(&self) -> ResendReport {
        self.resend_all_known_at(Utc::now()).await
    }

    pub async fn resend_all_known_at(&self, now: DateTime<Utc>) -> ResendReport {
        let mut total = ResendReport::default();
        for node in self.presence.known_nodes() {
            if self.is_own_node(node) {
                continue;
            }
            let report = self.resend_pass_at(node, now).await;
            total.merge(&report);
        }
        total.merge(&self.resend_broadcasts_at(now).await);
        total
    }

    /// Drop terminal records created before `older_than`.
    pub fn prune_terminal(&self, older_than: DateTime<Utc>) -> usize {
        match self.store.prune_terminal(older_than) {
            Ok(n) => {
                if n > 0 {
                    info!("Pruned {} terminal message records", n);
                }
                n
            }
            Err(e) => {
                error!("Pruning message records failed: {}", e);
                0
            }
        }
    }
}

#[async_trait]
impl FrameSender for DeliveryManager {
    async fn send_frame(&self, text: &str, node: u32) -> bool {
        DeliveryManager::send_frame(self, text, node).await.is_delivered()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::JsonStore;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        sent: Mutex<Vec<String>>,
    }

    impl Transmitter for Recorder {
        fn transmit(&self, text: &str, _: u32, _: Destination, _: u8) -> Result<(), TransmitError> {
            self.sent.lock().unwrap().push(text.to_string());
            Ok(())
        }
    }

    fn manager(dir: &std::path::Path, tx: Arc<Recorder>, presence: Arc<NodePresence>) -> DeliveryManager {
        let store = Arc::new(JsonStore::open(dir).unwrap());
        DeliveryManager::new(
            tx,
            store,
            presence,
            vec![0x1111],
            DeliveryTuning::default().without_backoff(),
            Arc::new(SendPacer::unlimited()),
        )
    }

    #[tokio::test]
    async fn long_text_is_chunked_but_frames_are_not() {
        let dir = tempfile::tempdir().unwrap();
        let tx = Arc::new(Recorder::default());
        let presence = Arc::new(NodePresence::new(Duration::seconds(600)));
        presence.observe(0x2222, "text");
        let mut dm = manager(dir.path(), tx.clone(), presence);
        dm.tuning.max_text_bytes = 20;

        let text = "one two three four five six seven eight nine ten";
        assert!(dm.send(text, 0, Destination::Node(0x2222), 1).await.is_delivered());
        assert!(tx.sent.lock().unwrap().len() > 1);

        tx.sent.lock().unwrap().clear();
        assert!(dm.send_frame(text, 0x2222).await.is_delivered());
        assert_eq!(tx.sent.lock().unwrap().as_slice(), &[text.to_string()]);
    }

    #[tokio::test]
    async fn empty_and_self_addressed_messages_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let tx = Arc::new(Recorder::default());
        let presence = Arc::new(NodePresence::new(Duration::seconds(600)));
        let dm = manager(dir.path(), tx.clone(), presence);
        assert_eq!(
            dm.send("   ", 0, Destination::Broadcast, 1).await,
            SendOutcome::Rejected("empty message")
        );
        assert!(matches!(
            dm.send("hi", 0, Destination::Node(0x1111), 1).await,
            SendOutcome::Rejected(_)
        ));
        assert!(tx.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn broadcast_skips_presence_gate() {
        let dir = tempfile::tempdir().unwrap();
        let tx = Arc::new(Recorder::default());
        let presence = Arc::new(NodePresence::new(Duration::seconds(600)));
        let dm = manager(dir.path(), tx.clone(), presence);
        assert!(dm.send("net check", 0, Destination::Broadcast, 1).await.is_delivered());
        assert_eq!(tx.sent.lock().unwrap().len(), 1);
    }

    #[test]
    fn backoff_index_repeats_last_value() {
        let t = DeliveryTuning::default();
        assert_eq!(t.backoff_after(1), std::time::Duration::from_secs(1));
        assert_eq!(t.backoff_after(3), std::time::Duration::from_secs(4));
        assert_eq!(t.backoff_after(7), std::time::Duration::from_secs(4));
    }
}
