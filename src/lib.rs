//! # Meshrelay - Reliable Delivery and File Transfer for Meshtastic Bots
//!
//! Meshrelay gives a long-running mesh bot two things the radio does not: at-least-once
//! delivery of short texts, and whole-file transfer (FiMesh) on top of the same
//! "send text, maybe receive text" primitive.
//!
//! ## Features
//!
//! - **Delivery Manager**: retry with backoff, offline queuing, deferral and a lifetime
//!   attempt ceiling, with every attempt persisted before it is made.
//! - **Presence Oracle**: a node is online when anything was heard from it recently,
//!   optionally confirmed with an active probe.
//! - **FiMesh**: PING/PONG discovery, segmented manifest, AIMD-windowed chunks with
//!   per-chunk digests, timeout backoff and atomic assembly into an inbox.
//! - **Pacing**: one token bucket shared by chat, broadcasts and transfer frames.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use meshrelay::config::Config;
//! use meshrelay::meshtastic::QueueTransmitter;
//! use meshrelay::service::RelayService;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("config.toml").await?;
//!     let (outgoing_tx, _outgoing_rx) = tokio::sync::mpsc::unbounded_channel();
//!     let (_inbound_tx, inbound_rx) = tokio::sync::mpsc::unbounded_channel();
//!     let (chat_tx, _chat_rx) = tokio::sync::mpsc::unbounded_channel();
//!     let (_control_tx, control_rx) = tokio::sync::mpsc::unbounded_channel();
//!
//!     let service = RelayService::new(config, Arc::new(QueueTransmitter::new(outgoing_tx)), None).await?;
//!     service.run(inbound_rx, chat_tx, control_rx).await
//! }
//! ```
//!
//! ## Module Organization
//!
//! - [`codec`] - FiMesh frame format, payload packing, digests and chat chunking
//! - [`presence`] - Node reachability from observed traffic
//! - [`delivery`] - Retried, persisted text delivery
//! - [`fimesh`] - File transfer sessions and the outbox/inbox directories
//! - [`storage`] - Message and transfer record persistence
//! - [`meshtastic`] - Transport seam: destinations, transmitter, inbound packets
//! - [`service`] - The driver loop tying everything together
//! - [`config`] - Configuration management
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────┐
//! │  FiMesh engine  │ ← sessions, manifest, window
//! └─────────────────┘
//!          │ frames
//! ┌─────────────────┐
//! │ Delivery Manager│ ← retry, queue, pacing ──► Presence Oracle
//! └─────────────────┘
//!          │ transmit
//! ┌─────────────────┐
//! │   Transmitter   │ ← radio writer
//! └─────────────────┘
//! ```

pub mod codec;
pub mod config;
pub mod delivery;
pub mod fimesh;
pub mod logutil;
pub mod meshtastic;
pub mod metrics;
pub mod presence;
pub mod service;
pub mod storage;
