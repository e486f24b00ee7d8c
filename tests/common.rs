//! Test utilities & fixtures shared by the integration tests.
#![allow(dead_code)] // Each test binary uses a different subset

use async_trait::async_trait;
use chrono::Duration;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use meshrelay::delivery::{DeliveryManager, DeliveryTuning, SendPacer};
use meshrelay::fimesh::{FiMesh, FimeshTuning, FrameSender};
use meshrelay::meshtastic::{Destination, TransmitError, Transmitter};
use meshrelay::presence::NodePresence;
use meshrelay::storage::JsonStore;

/// Transmitter that records every text and can be switched into failure mode.
#[derive(Default)]
pub struct RecordingTransmitter {
    sent: Mutex<Vec<(String, Destination)>>,
    failing: AtomicBool,
    calls: AtomicUsize,
}

impl RecordingTransmitter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Transmit calls, successful or not.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn texts(&self) -> Vec<String> {
        self.sent.lock().unwrap().iter().map(|(t, _)| t.clone()).collect()
    }
}

impl Transmitter for RecordingTransmitter {
    fn transmit(&self, text: &str, _channel: u32, destination: Destination, _interface: u8) -> Result<(), TransmitError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(TransmitError::BrokenPipe("radio unplugged".into()));
        }
        self.sent.lock().unwrap().push((text.to_string(), destination));
        Ok(())
    }
}

/// FrameSender that keeps frames in an outbox for the test to relay by hand.
#[derive(Default)]
pub struct FrameLog {
    frames: Mutex<Vec<(String, u32)>>,
    all: Mutex<Vec<String>>,
}

impl FrameLog {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Take frames not yet relayed.
    pub fn drain(&self) -> Vec<(String, u32)> {
        std::mem::take(&mut *self.frames.lock().unwrap())
    }

    /// Every frame ever sent.
    pub fn history(&self) -> Vec<String> {
        self.all.lock().unwrap().clone()
    }

    pub fn count_type(&self, tag: &str) -> usize {
        let needle = format!(":{}:", tag);
        self.history().iter().filter(|f| f.contains(&needle)).count()
    }
}

#[async_trait]
impl FrameSender for FrameLog {
    async fn send_frame(&self, text: &str, node: u32) -> bool {
        self.frames.lock().unwrap().push((text.to_string(), node));
        self.all.lock().unwrap().push(text.to_string());
        true
    }
}

pub fn presence() -> Arc<NodePresence> {
    Arc::new(NodePresence::new(Duration::seconds(1800)))
}

pub fn delivery(
    store: Arc<JsonStore>,
    transmitter: Arc<RecordingTransmitter>,
    presence: Arc<NodePresence>,
    own_ids: Vec<u32>,
) -> DeliveryManager {
    DeliveryManager::new(
        transmitter,
        store,
        presence,
        own_ids,
        DeliveryTuning::default().without_backoff(),
        Arc::new(SendPacer::unlimited()),
    )
}

pub fn engine(root: &Path, sender: Arc<dyn FrameSender>) -> (FiMesh, Arc<JsonStore>) {
    let store = Arc::new(JsonStore::open(root.join("data")).unwrap());
    let engine = FiMesh::new(sender, store.clone(), root.join("fimesh"), FimeshTuning::default()).unwrap();
    (engine, store)
}

/// Deterministic, poorly compressible bytes.
pub fn noise(len: usize, seed: u32) -> Vec<u8> {
    let mut x = seed.max(1);
    (0..len)
        .map(|_| {
            x ^= x << 13;
            x ^= x >> 17;
            x ^= x << 5;
            (x & 0xff) as u8
        })
        .collect()
}
