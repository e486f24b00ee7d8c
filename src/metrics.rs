//! Process-wide delivery and transfer counters.
//!
//! Counters are monotonic for the life of the process; `snapshot()` is what `status`
//! output and tests read.
use std::sync::atomic::{AtomicU64, Ordering};

static TRANSMIT_ATTEMPTS: AtomicU64 = AtomicU64::new(0);
static TRANSMIT_FAILURES: AtomicU64 = AtomicU64::new(0);
static MESSAGES_DELIVERED: AtomicU64 = AtomicU64::new(0);
static MESSAGES_DEFERRED: AtomicU64 = AtomicU64::new(0);
static MESSAGES_UNDELIVERED: AtomicU64 = AtomicU64::new(0);
static FRAMES_SENT: AtomicU64 = AtomicU64::new(0);
static CHUNK_RETRANSMITS: AtomicU64 = AtomicU64::new(0);
static UPLOADS_COMPLETED: AtomicU64 = AtomicU64::new(0);
static UPLOADS_FAILED: AtomicU64 = AtomicU64::new(0);
static DOWNLOADS_ASSEMBLED: AtomicU64 = AtomicU64::new(0);
static DOWNLOADS_FAILED: AtomicU64 = AtomicU64::new(0);

pub fn inc_transmit_attempts() {
    TRANSMIT_ATTEMPTS.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_transmit_failures() {
    TRANSMIT_FAILURES.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_messages_delivered() {
    MESSAGES_DELIVERED.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_messages_deferred() {
    MESSAGES_DEFERRED.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_messages_undelivered() {
    MESSAGES_UNDELIVERED.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_frames_sent() {
    FRAMES_SENT.fetch_add(1, Ordering::Relaxed);
}
pub fn add_chunk_retransmits(n: u64) {
    CHUNK_RETRANSMITS.fetch_add(n, Ordering::Relaxed);
}
pub fn inc_uploads_completed() {
    UPLOADS_COMPLETED.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_uploads_failed() {
    UPLOADS_FAILED.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_downloads_assembled() {
    DOWNLOADS_ASSEMBLED.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_downloads_failed() {
    DOWNLOADS_FAILED.fetch_add(1, Ordering::Relaxed);
}

#[derive(Debug, Default, Clone)]
pub struct Snapshot {
    pub transmit_attempts: u64,
    pub transmit_failures: u64,
    pub messages_delivered: u64,
    pub messages_deferred: u64,
    pub messages_undelivered: u64,
    pub frames_sent: u64,
    pub chunk_retransmits: u64,
    pub uploads_completed: u64,
    pub uploads_failed: u64,
    pub downloads_assembled: u64,
    pub downloads_failed: u64,
}

impl Snapshot {
    /// Fraction of transmit calls that failed, if any were made.
    pub fn failure_ratio(&self) -> Option<f64> {
        if self.transmit_attempts == 0 {
            None
        } else {
            Some(self.transmit_failures as f64 / self.transmit_attempts as f64)
        }
    }
}

pub fn snapshot() -> Snapshot {
    Snapshot {
        transmit_attempts: TRANSMIT_ATTEMPTS.load(Ordering::Relaxed),
        transmit_failures: TRANSMIT_FAILURES.load(Ordering::Relaxed),
        messages_delivered: MESSAGES_DELIVERED.load(Ordering::Relaxed),
        messages_deferred: MESSAGES_DEFERRED.load(Ordering::Relaxed),
        messages_undelivered: MESSAGES_UNDELIVERED.load(Ordering::Relaxed),
        frames_sent: FRAMES_SENT.load(Ordering::Relaxed),
        chunk_retransmits: CHUNK_RETRANSMITS.load(Ordering::Relaxed),
        uploads_completed: UPLOADS_COMPLETED.load(Ordering::Relaxed),
        uploads_failed: UPLOADS_FAILED.load(Ordering::Relaxed),
        downloads_assembled: DOWNLOADS_ASSEMBLED.load(Ordering::Relaxed),
        downloads_failed: DOWNLOADS_FAILED.load(Ordering::Relaxed),
    }
}
