mod common;

use chrono::{DateTime, Duration, Utc};
use std::path::Path;
use std::sync::Arc;

use common::{engine, noise, FrameLog};
use meshrelay::codec::{self, Frame, Packet};
use meshrelay::fimesh::manifest::Manifest;
use meshrelay::fimesh::naming::outbox_name;
use meshrelay::fimesh::{FiMesh, FimeshTuning};
use meshrelay::storage::{JsonStore, TransferDirection, TransferStatus, TransferStore};

const NODE_A: u32 = 0x0000_000a;
const NODE_B: u32 = 0x0000_000b;

/// Hand everything `log` sent to `to`, as if it arrived from `from_node`.
async fn relay(log: &FrameLog, from_node: u32, to: &mut FiMesh, now: DateTime<Utc>) -> usize {
    let frames = log.drain();
    for (text, _) in &frames {
        assert!(to.handle_text_at(text, from_node, now).await);
    }
    frames.len()
}

fn files_in(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.path().is_file())
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}

fn first_session_id(log: &FrameLog) -> String {
    let first = log.history().into_iter().next().expect("a frame was sent");
    codec::parse_frame(&first).unwrap().session_id
}

#[tokio::test]
async fn file_moves_between_two_engines() {
    let dir_a = tempfile::tempdir().unwrap();
    let dir_b = tempfile::tempdir().unwrap();
    let log_a = FrameLog::new();
    let log_b = FrameLog::new();
    let (mut a, store_a) = engine(dir_a.path(), log_a.clone());
    let (mut b, store_b) = engine(dir_b.path(), log_b.clone());

    let data = noise(1000, 7);
    let queued = a.dirs().outbox.join(outbox_name("notes.bin", NODE_B));
    std::fs::write(&queued, &data).unwrap();

    let mut now = Utc::now();
    assert_eq!(a.scan_outbox_at(now).await, 1);
    let sid = first_session_id(&log_a);
    // A second scan must not start a duplicate session for the same file
    assert_eq!(a.scan_outbox_at(now).await, 0);

    for _ in 0..100 {
        a.tick_at(now).await;
        relay(&log_a, NODE_A, &mut b, now).await;
        b.tick_at(now).await;
        relay(&log_b, NODE_B, &mut a, now).await;
        if a.sessions().upload_count() == 0 && b.sessions().download_count() == 0 {
            break;
        }
        now += Duration::seconds(1);
    }
    assert_eq!(a.sessions().upload_count(), 0);
    assert_eq!(b.sessions().download_count(), 0);

    let expected_chunks = codec::compress(&data).unwrap().len().div_ceil(codec::MAX_CHUNK_PAYLOAD);
    assert!(expected_chunks > 1);
    assert_eq!(log_a.count_type("DAT"), expected_chunks);
    assert_eq!(log_b.count_type("ACK"), expected_chunks);
    assert_eq!(log_a.count_type("PING"), 1);
    assert_eq!(log_b.count_type("PONG"), 1);

    let up = store_a.get_transfer(&sid).unwrap().unwrap();
    assert_eq!(up.direction, TransferDirection::Upload);
    assert_eq!(up.status, TransferStatus::Completed);
    assert_eq!(up.progress, 100);
    assert_eq!(up.total_chunks as usize, expected_chunks);
    assert!(!queued.exists());
    assert_eq!(files_in(&a.dirs().sent), vec!["notes___0000000b.bin".to_string()]);

    let down = store_b.get_transfer(&sid).unwrap().unwrap();
    assert_eq!(down.direction, TransferDirection::Download);
    assert_eq!(down.status, TransferStatus::Completed);
    assert_eq!(down.file_name, "notes.bin");
    assert_eq!(down.peer, NODE_A);
    assert_eq!(std::fs::read(b.dirs().inbox.join("notes.bin")).unwrap(), data);
    assert!(files_in(&b.dirs().inbox_temp).is_empty());
}

#[tokio::test]
async fn silent_target_fails_upload_without_data() {
    let dir = tempfile::tempdir().unwrap();
    let log = FrameLog::new();
    let (mut a, store) = engine(dir.path(), log.clone());
    let queued = a.dirs().outbox.join(outbox_name("map.png", NODE_B));
    std::fs::write(&queued, noise(400, 1)).unwrap();

    let now = Utc::now();
    assert_eq!(a.scan_outbox_at(now).await, 1);
    let sid = first_session_id(&log);

    a.tick_at(now + Duration::seconds(30)).await;
    assert_eq!(a.sessions().upload_count(), 1);
    assert_eq!(store.get_transfer(&sid).unwrap().unwrap().status, TransferStatus::Connecting);

    a.tick_at(now + Duration::seconds(61)).await;
    assert_eq!(a.sessions().upload_count(), 0);
    let rec = store.get_transfer(&sid).unwrap().unwrap();
    assert_eq!(rec.status, TransferStatus::Failed);
    assert_eq!(rec.error.as_deref(), Some("target did not answer PING"));
    assert_eq!(log.count_type("DAT"), 0);
    assert_eq!(log.count_type("MAN"), 0);
    assert!(!queued.exists());
    assert_eq!(files_in(&a.dirs().outbox), vec!["map___0000000b.png___failed".to_string()]);

    // Failed files stay put
    assert_eq!(a.scan_outbox_at(now + Duration::seconds(120)).await, 0);
}

struct PreparedFile {
    data: Vec<u8>,
    chunks: Vec<Vec<u8>>,
    manifest_frames: Vec<Frame>,
}

fn prepare(sid: &str, name: &str, seed: u32) -> PreparedFile {
    let data = noise(600, seed);
    let compressed = codec::compress(&data).unwrap();
    let chunks = codec::split_bytes(&compressed, compressed.len().div_ceil(5));
    assert_eq!(chunks.len(), 5);
    let manifest = Manifest::for_chunks(name, data.len() as u64, &chunks);
    let manifest_frames = manifest.to_frames(sid, 64).unwrap();
    assert!(manifest_frames.len() > 1);
    PreparedFile {
        data,
        chunks,
        manifest_frames,
    }
}

fn data_frame(sid: &str, seq: u32, bytes: &[u8]) -> Frame {
    Frame::new(
        sid,
        Packet::Data {
            seq,
            payload: codec::encode_payload(bytes),
        },
    )
}

#[tokio::test]
async fn corrupted_chunk_is_never_written() {
    let dir = tempfile::tempdir().unwrap();
    let log = FrameLog::new();
    let (mut b, store) = engine(dir.path(), log.clone());
    let sid = "c0ffee01";
    let file = prepare(sid, "report.txt", 3);
    let now = Utc::now();

    for frame in file.manifest_frames.clone() {
        b.handle_frame_at(frame, NODE_A, now).await;
    }
    for (i, chunk) in file.chunks.iter().enumerate() {
        let mut bytes = chunk.clone();
        if i == 3 {
            bytes[0] ^= 0xff;
        }
        b.handle_frame_at(data_frame(sid, i as u32, &bytes), NODE_A, now).await;
    }
    // Every chunk is acknowledged on receipt, good or bad
    assert_eq!(log.count_type("ACK"), 5);

    b.tick_at(now).await;
    assert!(files_in(&b.dirs().inbox).is_empty());
    assert!(files_in(&b.dirs().inbox_temp).is_empty());
    let rec = store.get_transfer(sid).unwrap().unwrap();
    assert_eq!(rec.status, TransferStatus::HashMismatch);
    assert_eq!(rec.file_name, "report.txt");
    assert_eq!(b.sessions().download_count(), 1);

    // Left to the idle timeout
    b.tick_at(now + Duration::seconds(301)).await;
    assert_eq!(b.sessions().download_count(), 0);
    assert_eq!(store.get_transfer(sid).unwrap().unwrap().status, TransferStatus::TimedOut);
    assert!(files_in(&b.dirs().inbox).is_empty());
}

#[tokio::test]
async fn download_tolerates_any_arrival_order() {
    let dir = tempfile::tempdir().unwrap();
    let log = FrameLog::new();
    let (mut b, store) = engine(dir.path(), log.clone());
    let now = Utc::now();

    // Same name twice: the second copy must not overwrite the first
    for (sid, seed) in [("0badcafe", 11u32), ("0badcaff", 12u32)] {
        let file = prepare(sid, "report.txt", seed);
        let mut man = file.manifest_frames.clone();
        let last = man.pop().unwrap();

        b.handle_frame_at(last, NODE_A, now).await;
        for (i, chunk) in file.chunks.iter().enumerate().rev() {
            b.handle_frame_at(data_frame(sid, i as u32, chunk), NODE_A, now).await;
        }
        b.tick_at(now).await;
        assert!(!b.sessions().download(sid).unwrap().is_ready());
        for frame in man.into_iter().rev() {
            b.handle_frame_at(frame, NODE_A, now).await;
        }
        // A duplicate chunk changes nothing
        b.handle_frame_at(data_frame(sid, 0, &file.chunks[0]), NODE_A, now).await;
        b.tick_at(now + Duration::seconds(1)).await;

        assert_eq!(store.get_transfer(sid).unwrap().unwrap().status, TransferStatus::Completed);
        let expected = if seed == 11 { "report.txt" } else { "report-1.txt" };
        assert_eq!(std::fs::read(b.dirs().inbox.join(expected)).unwrap(), file.data);
    }
    assert_eq!(files_in(&b.dirs().inbox), vec!["report-1.txt".to_string(), "report.txt".to_string()]);
}

#[tokio::test]
async fn late_duplicates_do_not_reopen_a_finished_download() {
    let dir = tempfile::tempdir().unwrap();
    let log = FrameLog::new();
    let (mut b, store) = engine(dir.path(), log.clone());
    let sid = "5eed0001";
    let file = prepare(sid, "r.txt", 21);
    let now = Utc::now();

    for frame in file.manifest_frames.clone() {
        b.handle_frame_at(frame, NODE_A, now).await;
    }
    for (i, chunk) in file.chunks.iter().enumerate() {
        b.handle_frame_at(data_frame(sid, i as u32, chunk), NODE_A, now).await;
    }
    b.tick_at(now).await;
    assert_eq!(store.get_transfer(sid).unwrap().unwrap().status, TransferStatus::Completed);
    assert_eq!(b.sessions().download_count(), 0);
    log.drain();

    // The uploader never saw our ACKs and replays the whole session
    let later = now + Duration::seconds(30);
    for frame in file.manifest_frames.clone() {
        b.handle_frame_at(frame, NODE_A, later).await;
    }
    for (i, chunk) in file.chunks.iter().enumerate() {
        b.handle_frame_at(data_frame(sid, i as u32, chunk), NODE_A, later).await;
    }
    assert_eq!(b.sessions().download_count(), 0);
    // Every replayed chunk is ACKed again so the uploader can finish
    assert_eq!(log.count_type("ACK"), 10);
    assert_eq!(log.count_type("MAN"), 0);

    b.tick_at(later + Duration::seconds(301)).await;
    let rec = store.get_transfer(sid).unwrap().unwrap();
    assert_eq!(rec.status, TransferStatus::Completed);
    assert_eq!(rec.progress, 100);
    assert_eq!(files_in(&b.dirs().inbox), vec!["r.txt".to_string()]);
    assert_eq!(std::fs::read(b.dirs().inbox.join("r.txt")).unwrap(), file.data);
}

#[tokio::test]
async fn timed_out_download_ignores_stragglers() {
    let dir = tempfile::tempdir().unwrap();
    let log = FrameLog::new();
    let (mut b, store) = engine(dir.path(), log.clone());
    let sid = "5eed0002";
    let file = prepare(sid, "late.txt", 22);
    let now = Utc::now();

    for frame in file.manifest_frames.clone() {
        b.handle_frame_at(frame, NODE_A, now).await;
    }
    b.tick_at(now + Duration::seconds(301)).await;
    assert_eq!(store.get_transfer(sid).unwrap().unwrap().status, TransferStatus::TimedOut);
    log.drain();

    let later = now + Duration::seconds(310);
    for frame in file.manifest_frames.clone() {
        b.handle_frame_at(frame, NODE_A, later).await;
    }
    for (i, chunk) in file.chunks.iter().enumerate() {
        b.handle_frame_at(data_frame(sid, i as u32, chunk), NODE_A, later).await;
    }
    b.tick_at(later).await;
    assert_eq!(b.sessions().download_count(), 0);
    assert!(log.drain().is_empty());
    assert_eq!(store.get_transfer(sid).unwrap().unwrap().status, TransferStatus::TimedOut);
    assert!(files_in(&b.dirs().inbox).is_empty());
}

#[tokio::test]
async fn ping_is_answered_and_strays_are_ignored() {
    let dir = tempfile::tempdir().unwrap();
    let log = FrameLog::new();
    let (mut b, store) = engine(dir.path(), log.clone());
    let now = Utc::now();

    let ping = Frame::new("feed0001", Packet::Ping).encode();
    assert!(b.handle_text_at(&ping, NODE_A, now).await);
    let replies = log.drain();
    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0].1, NODE_A);
    assert_eq!(codec::parse_frame(&replies[0].0).unwrap(), Frame::new("feed0001", Packet::Pong));

    // DAT for a session we never heard of: no ACK, no record
    let stray = data_frame("feed0002", 0, b"abc").encode();
    assert!(b.handle_text_at(&stray, NODE_A, now).await);
    assert!(log.drain().is_empty());
    assert!(store.list_transfers().unwrap().is_empty());

    assert!(b.handle_text_at("fmsh:broken", NODE_A, now).await);
    assert!(!b.handle_text_at("hello bot", NODE_A, now).await);
    assert!(log.drain().is_empty());
}

fn tight_tuning() -> FimeshTuning {
    FimeshTuning {
        base_timeout: Duration::seconds(10),
        max_timeout: Duration::seconds(40),
        max_retries: 2,
        ..FimeshTuning::default()
    }
}

#[tokio::test]
async fn unacknowledged_upload_backs_off_then_fails() {
    let dir = tempfile::tempdir().unwrap();
    let log = FrameLog::new();
    let store = Arc::new(JsonStore::open(dir.path().join("data")).unwrap());
    let mut a = FiMesh::new(log.clone(), store.clone(), dir.path().join("fimesh"), tight_tuning()).unwrap();
    let queued = a.dirs().outbox.join(outbox_name("log.txt", NODE_B));
    std::fs::write(&queued, noise(1000, 5)).unwrap();

    let start = Utc::now();
    a.scan_outbox_at(start).await;
    let sid = first_session_id(&log);
    let pong = Frame::new(sid.clone(), Packet::Pong).encode();
    a.handle_text_at(&pong, NODE_B, start).await;

    let mut saw_retrying = false;
    for s in 0..120 {
        a.tick_at(start + Duration::seconds(s)).await;
        if let Some(rec) = store.get_transfer(&sid).unwrap() {
            saw_retrying |= rec.status == TransferStatus::Retrying;
        }
        if a.sessions().upload_count() == 0 {
            break;
        }
    }
    assert!(saw_retrying);
    assert_eq!(a.sessions().upload_count(), 0);

    let rec = store.get_transfer(&sid).unwrap().unwrap();
    assert_eq!(rec.status, TransferStatus::Failed);
    assert_eq!(rec.error.as_deref(), Some("retry budget exhausted"));
    // Two first sends in the initial window, then one per retry once the window is down to 1
    assert_eq!(log.count_type("DAT"), 4);
    assert!(files_in(&a.dirs().outbox).iter().all(|n| n.ends_with("___failed")));
}

#[tokio::test]
async fn oversized_file_is_rejected_up_front() {
    let dir = tempfile::tempdir().unwrap();
    let log = FrameLog::new();
    let store = Arc::new(JsonStore::open(dir.path().join("data")).unwrap());
    let tuning = FimeshTuning {
        max_file_bytes: 100,
        ..FimeshTuning::default()
    };
    let mut a = FiMesh::new(log.clone(), store.clone(), dir.path().join("fimesh"), tuning).unwrap();
    std::fs::write(a.dirs().outbox.join(outbox_name("big.bin", NODE_B)), noise(101, 9)).unwrap();

    assert_eq!(a.scan_outbox_at(Utc::now()).await, 0);
    assert!(log.history().is_empty());
    let records = store.list_transfers().unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status, TransferStatus::Failed);
    assert_eq!(files_in(&a.dirs().outbox), vec!["big___0000000b.bin___failed".to_string()]);
}
