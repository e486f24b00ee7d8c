//! Binary entrypoint for the Meshrelay CLI.
//!
//! Commands:
//! - `start` - run the relay service with a console bridge (frames printed to stdout,
//!   inbound packets read from stdin)
//! - `init` - create a starter `config.toml` plus the data and FiMesh directories
//! - `status` - print message counts per status and transfer records
//! - `queue-file <path> --node <id>` - place a file in the FiMesh outbox for a node
//!
//! Console input for `start`, one packet per line:
//!
//! ```text
//! !a1b2c3d4 hello bot               text from a node
//! !a1b2c3d4 @telemetry              any non-text packet kind (telemetry, position, routing, nodeinfo)
//! send !a1b2c3d4 some reply         send a text through the delivery manager
//! send all net check                channel broadcast
//! quit                              stop the service
//! ```
//!
//! See the library crate docs for module-level details: `meshrelay::`.
use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use log::{info, warn};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

use meshrelay::config::Config;
use meshrelay::delivery::DeliveryManager;
use meshrelay::fimesh::FimeshDirs;
use meshrelay::meshtastic::{
    format_node_id, parse_node_id, ControlMessage, Destination, InboundPacket, OutgoingMessage, PacketKind,
    QueueTransmitter,
};
use meshrelay::service::{ChatMessage, RelayService};
use meshrelay::storage::{JsonStore, MessageStore, TransferStore};

#[derive(Parser)]
#[command(name = "meshrelay")]
#[command(about = "Reliable delivery and FiMesh file transfer for Meshtastic mesh bots")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path (can be used before or after subcommand)
    #[arg(short, long, default_value = "config.toml", global = true)]
    config: String,

    /// Verbose logging (-v, -vv for more; may appear before or after subcommand)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the relay service with a stdin/stdout console bridge
    Start,
    /// Initialize a new configuration and directory layout
    Init,
    /// Show message and transfer records
    Status,
    /// Queue a file for FiMesh upload to a node
    QueueFile {
        /// File to send
        path: PathBuf,
        /// Target node id (e.g. !a1b2c3d4)
        #[arg(short, long)]
        node: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Init writes the config, so there is nothing to load yet
    let pre_config = match cli.command {
        Commands::Init => None,
        _ => Config::load(&cli.config).await.ok(),
    };
    init_logging(&pre_config, cli.verbose);

    match cli.command {
        Commands::Start => {
            let config = match pre_config {
                Some(c) => c,
                None => Config::load(&cli.config).await?,
            };
            info!("Starting Meshrelay v{}", env!("CARGO_PKG_VERSION"));
            run_console(config).await?;
        }
        Commands::Init => {
            info!("Initializing new Meshrelay configuration");
            Config::create_default(&cli.config).await?;
            info!("Configuration file created at {}", cli.config);
            let cfg = Config::default();
            tokio::fs::create_dir_all(&cfg.storage.data_dir).await?;
            FimeshDirs::new(&cfg.fimesh.base_dir).create()?;
            info!(
                "Created data directory {} and FiMesh directories under {}",
                cfg.storage.data_dir, cfg.fimesh.base_dir
            );
        }
        Commands::Status => {
            let config = match pre_config {
                Some(c) => c,
                None => Config::load(&cli.config).await?,
            };
            show_status(&config)?;
        }
        Commands::QueueFile { path, node } => {
            let config = match pre_config {
                Some(c) => c,
                None => Config::load(&cli.config).await?,
            };
            let node_id = parse_node_id(&node).ok_or_else(|| anyhow!("Invalid node id '{}'", node))?;
            let dirs = FimeshDirs::new(&config.fimesh.base_dir);
            let dest = dirs.queue_file(&path, node_id)?;
            println!("Queued {} for {} as {}", path.display(), format_node_id(node_id), dest.display());
        }
    }

    Ok(())
}

fn show_status(config: &Config) -> Result<()> {
    let store = JsonStore::open(&config.storage.data_dir)?;
    println!("Meshrelay v{}", env!("CARGO_PKG_VERSION"));
    println!("Data directory: {}", config.storage.data_dir);
    println!("Messages:");
    let counts = store.count_by_status()?;
    if counts.is_empty() {
        println!("  (none)");
    }
    for (status, count) in counts {
        println!("  {:<12} {}", status.to_string(), count);
    }
    let transfers = store.list_transfers()?;
    println!("Transfers: {}", transfers.len());
    for t in transfers {
        println!(
            "  {} {:?} {:<24} {:>8}B {:>3}% {:?} peer {}{}",
            t.session_id,
            t.direction,
            t.file_name,
            t.file_size,
            t.progress,
            t.status,
            format_node_id(t.peer),
            t.error.map(|e| format!(" ({})", e)).unwrap_or_default()
        );
    }
    Ok(())
}

async fn run_console(config: Config) -> Result<()> {
    let own_id = config.node.own_ids().first().copied();
    let route = (config.node.channel, config.node.interface);
    let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel::<OutgoingMessage>();
    let (radio_control_tx, radio_control_rx) = mpsc::unbounded_channel::<ControlMessage>();
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<InboundPacket>();
    let (chat_tx, mut chat_rx) = mpsc::unbounded_channel::<ChatMessage>();
    let (control_tx, control_rx) = mpsc::unbounded_channel::<ControlMessage>();

    let service = RelayService::new(
        config,
        Arc::new(QueueTransmitter::new(outgoing_tx)),
        Some(radio_control_tx),
    )
    .await?;

    tokio::spawn(console_writer(outgoing_rx, radio_control_rx));
    tokio::spawn(async move {
        while let Some(chat) = chat_rx.recv().await {
            println!("RX {} -> {}: {}", format_node_id(chat.from), chat.to, chat.text);
        }
    });
    let reader = tokio::spawn(console_reader(inbound_tx.clone(), service.delivery(), own_id, route, control_tx));

    let result = service.run(inbound_rx, chat_tx, control_rx).await;
    reader.abort();
    drop(inbound_tx);
    result
}

/// Stand-in for the radio writer: prints what would go on the air.
async fn console_writer(
    mut outgoing_rx: mpsc::UnboundedReceiver<OutgoingMessage>,
    mut control_rx: mpsc::UnboundedReceiver<ControlMessage>,
) {
    loop {
        tokio::select! {
            msg = outgoing_rx.recv() => {
                match msg {
                    Some(m) => {
                        let dest = m.to_node.map(format_node_id).unwrap_or_else(|| "^all".to_string());
                        println!("TX {} ch{} if{} {:?}: {}", dest, m.channel, m.interface, m.priority, m.content);
                    }
                    None => break,
                }
            }
            ctrl = control_rx.recv() => {
                match ctrl {
                    Some(ControlMessage::SendPing { to, response_tx, .. }) => {
                        // No radio, so no routing ACK will ever arrive
                        println!("TX PING {}", format_node_id(to));
                        let _ = response_tx.send(false);
                    }
                    Some(ControlMessage::Shutdown) | None => break,
                }
            }
        }
    }
}

async fn console_reader(
    inbound_tx: mpsc::UnboundedSender<InboundPacket>,
    delivery: Arc<DeliveryManager>,
    own_id: Option<u32>,
    (channel, interface): (u32, u8),
    control_tx: mpsc::UnboundedSender<ControlMessage>,
) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(l)) => l,
            Ok(None) => break,
            Err(e) => {
                warn!("Console read failed: {}", e);
                break;
            }
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line == "quit" {
            let _ = control_tx.send(ControlMessage::Shutdown);
            break;
        }
        let (head, rest) = line.split_once(' ').unwrap_or((line, ""));
        if head == "send" {
            let (target, text) = rest.split_once(' ').unwrap_or((rest, ""));
            let dest = if target == "all" {
                Some(Destination::Broadcast)
            } else {
                parse_node_id(target).map(Destination::Node)
            };
            match dest {
                Some(dest) => {
                    let outcome = delivery.send(text, channel, dest, interface).await;
                    println!("SEND {} -> {:?}", dest, outcome);
                }
                None => println!("Unknown destination '{}'", target),
            }
            continue;
        }
        let from = match parse_node_id(head) {
            Some(id) => id,
            None => {
                println!("Expected '<node> <text>', '<node> @kind' or 'send <node|all> <text>'");
                continue;
            }
        };
        let kind = match rest {
            "@telemetry" => PacketKind::Telemetry,
            "@position" => PacketKind::Position,
            "@routing" => PacketKind::Routing,
            "@nodeinfo" => PacketKind::NodeInfo,
            text => PacketKind::Text {
                channel,
                to: own_id.map(Destination::Node).unwrap_or(Destination::Broadcast),
                text: text.to_string(),
            },
        };
        if inbound_tx.send(InboundPacket { from, interface, kind }).is_err() {
            break;
        }
    }
}

fn init_logging(config: &Option<Config>, verbosity: u8) {
    use std::io::Write;
    let mut builder = env_logger::Builder::new();
    // Base level from CLI verbosity overrides config
    let base_level = match verbosity {
        0 => config
            .as_ref()
            .and_then(|c| c.logging.level.parse::<log::LevelFilter>().ok())
            .unwrap_or(log::LevelFilter::Info),
        1 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    builder.filter_level(base_level);
    let log_file = config.as_ref().and_then(|c| c.logging.file.clone());
    match log_file.and_then(|file| std::fs::OpenOptions::new().create(true).append(true).open(file).ok()) {
        Some(f) => {
            let write_mutex = std::sync::Arc::new(std::sync::Mutex::new(f));
            // Echo to the console only when attached to a terminal
            let is_tty = atty::is(atty::Stream::Stdout);
            builder.format(move |fmt, record| {
                let ts = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ");
                let line = format!("{} [{}] {}", ts, record.level(), record.args());
                if let Ok(mut guard) = write_mutex.lock() {
                    let _ = writeln!(guard, "{}", line);
                }
                if is_tty {
                    writeln!(fmt, "{}", line)
                } else {
                    Ok(())
                }
            });
        }
        None => {
            builder.format(|fmt, record| {
                let ts = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ");
                writeln!(fmt, "{} [{}] {}", ts, record.level(), record.args())
            });
        }
    }
    let _ = builder.try_init();
}
