//! End-to-end tests: two pipe pairs talking over in-process tokio streams.

use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use uuid::Uuid;
use wanproxy_transport::{run_session, Message, PipePair, PipePairConfig, SessionStats};
use wanproxy_xcodec::{CacheConfig, CacheRegistry, SEGMENT_LENGTH};

const PIPE_CAPACITY: usize = 64 * 1024;

fn memory_registry(id: u128) -> Arc<CacheRegistry> {
    Arc::new(CacheRegistry::new(CacheConfig::default(), Uuid::from_u128(id)).unwrap())
}

fn data(len: usize) -> Vec<u8> {
    let blocks: Vec<Vec<u8>> = (0..3u64)
        .map(|seed| {
            let mut state = (seed + 1).wrapping_mul(0x9e37_79b9_7f4a_7c15);
            (0..SEGMENT_LENGTH)
                .map(|_| {
                    state ^= state << 13;
                    state ^= state >> 7;
                    state ^= state << 17;
                    (state >> 40) as u8
                })
                .collect()
        })
        .collect();
    let mut out = Vec::with_capacity(len);
    let mut i = 0;
    while out.len() < len {
        out.extend_from_slice(&blocks[i % blocks.len()]);
        out.extend_from_slice(format!("record {}\n", i).as_bytes());
        i += 1;
    }
    out.truncate(len);
    out
}

/// Send `input` from A to B through two sessions and return what B produced.
async fn loopback(
    reg_a: Arc<CacheRegistry>,
    reg_b: Arc<CacheRegistry>,
    input: Vec<u8>,
) -> (Vec<u8>, SessionStats, SessionStats) {
    let (wire_a, wire_b) = tokio::io::duplex(PIPE_CAPACITY);
    let (app_a, plain_a) = tokio::io::duplex(PIPE_CAPACITY);
    let (app_b, plain_b) = tokio::io::duplex(PIPE_CAPACITY);

    let pair_a = PipePair::new(reg_a, PipePairConfig::default()).unwrap();
    let pair_b = PipePair::new(reg_b, PipePairConfig::default()).unwrap();
    let session_a = tokio::spawn(run_session(pair_a, plain_a, wire_a));
    let session_b = tokio::spawn(run_session(pair_b, plain_b, wire_b));

    let (mut a_read, mut a_write) = tokio::io::split(app_a);
    let (mut b_read, mut b_write) = tokio::io::split(app_b);
    let writer = tokio::spawn(async move {
        a_write.write_all(&input).await.unwrap();
        a_write.shutdown().await.unwrap();
    });
    b_write.shutdown().await.unwrap();

    let mut received = Vec::new();
    b_read.read_to_end(&mut received).await.unwrap();
    let mut echoed = Vec::new();
    a_read.read_to_end(&mut echoed).await.unwrap();
    assert!(echoed.is_empty());

    writer.await.unwrap();
    let stats_a = session_a.await.unwrap().unwrap();
    let stats_b = session_b.await.unwrap().unwrap();
    (received, stats_a, stats_b)
}

#[tokio::test]
async fn test_session_memory_caches() {
    let input = data(300 * 1024);
    let (received, stats_a, stats_b) =
        loopback(memory_registry(1), memory_registry(2), input.clone()).await;
    assert_eq!(received, input);
    assert_eq!(stats_a.pipe.plaintext_in, input.len() as u64);
    assert_eq!(stats_b.pipe.plaintext_out, input.len() as u64);
    assert!(stats_a.pipe.wire_out < input.len() as u64 / 2);
    assert_eq!(stats_a.pipe.outstanding_frames, 0);
}

fn noise(len: usize, seed: u64) -> Vec<u8> {
    let mut state = seed.wrapping_mul(0x9e37_79b9_7f4a_7c15) | 1;
    (0..len)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            (state >> 40) as u8
        })
        .collect()
}

#[tokio::test]
async fn test_session_both_directions_at_once() {
    // incompressible, so each wire carries far more than the pipe buffers
    let to_b = noise(2 << 20, 1);
    let to_a = noise(2 << 20, 2);

    let (wire_a, wire_b) = tokio::io::duplex(PIPE_CAPACITY);
    let (app_a, plain_a) = tokio::io::duplex(PIPE_CAPACITY);
    let (app_b, plain_b) = tokio::io::duplex(PIPE_CAPACITY);
    let pair_a = PipePair::new(memory_registry(1), PipePairConfig::default()).unwrap();
    let pair_b = PipePair::new(memory_registry(2), PipePairConfig::default()).unwrap();
    let session_a = tokio::spawn(run_session(pair_a, plain_a, wire_a));
    let session_b = tokio::spawn(run_session(pair_b, plain_b, wire_b));

    let (mut a_read, mut a_write) = tokio::io::split(app_a);
    let (mut b_read, mut b_write) = tokio::io::split(app_b);
    let send_a = {
        let input = to_b.clone();
        tokio::spawn(async move {
            a_write.write_all(&input).await.unwrap();
            a_write.shutdown().await.unwrap();
        })
    };
    let send_b = {
        let input = to_a.clone();
        tokio::spawn(async move {
            b_write.write_all(&input).await.unwrap();
            b_write.shutdown().await.unwrap();
        })
    };
    let recv_a = tokio::spawn(async move {
        let mut out = Vec::new();
        a_read.read_to_end(&mut out).await.unwrap();
        out
    });
    let recv_b = tokio::spawn(async move {
        let mut out = Vec::new();
        b_read.read_to_end(&mut out).await.unwrap();
        out
    });

    let (got_a, got_b) = tokio::time::timeout(Duration::from_secs(60), async {
        send_a.await.unwrap();
        send_b.await.unwrap();
        (recv_a.await.unwrap(), recv_b.await.unwrap())
    })
    .await
    .expect("sessions stalled");
    assert_eq!(got_b.len(), to_b.len());
    assert!(got_b == to_b);
    assert!(got_a == to_a);

    let stats_a = session_a.await.unwrap().unwrap();
    let stats_b = session_b.await.unwrap().unwrap();
    assert_eq!(stats_a.pipe.plaintext_in, to_b.len() as u64);
    assert_eq!(stats_b.pipe.plaintext_in, to_a.len() as u64);
    assert!(stats_a.pipe.wire_out > to_b.len() as u64);
}

#[tokio::test]
async fn test_session_empty_stream() {
    let (received, _, stats_b) =
        loopback(memory_registry(1), memory_registry(2), Vec::new()).await;
    assert!(received.is_empty());
    assert_eq!(stats_b.pipe.frames_received, 0);
}

#[tokio::test]
async fn test_session_disk_caches_ask_for_segments() {
    let dir = tempfile::tempdir().unwrap();
    let disk = |name: &str, id: u128| {
        let config = CacheConfig::Disk {
            path: dir.path().join(name),
            size_bytes: 8 << 20,
        };
        Arc::new(CacheRegistry::new(config, Uuid::from_u128(id)).unwrap())
    };
    let input = data(100 * 1024);
    let (received, stats_a, stats_b) =
        loopback(disk("a.xcd", 1), disk("b.xcd", 2), input.clone()).await;
    assert_eq!(received, input);
    assert!(stats_b.pipe.asks_sent > 0);
    assert_eq!(stats_a.pipe.learns_sent, stats_b.pipe.learns_received);
}

#[tokio::test]
async fn test_session_wire_dropped_early() {
    let (wire_session, mut wire_test) = tokio::io::duplex(PIPE_CAPACITY);
    let (plain_session, plain_test) = tokio::io::duplex(PIPE_CAPACITY);
    let pair = PipePair::new(memory_registry(1), PipePairConfig::default()).unwrap();
    let session = tokio::spawn(run_session(pair, plain_session, wire_session));

    let mut hello = BytesMut::new();
    Message::Hello(Uuid::from_u128(2)).encode(&mut hello);
    wire_test.write_all(&hello).await.unwrap();
    drop(wire_test);
    drop(plain_test);

    assert!(session.await.unwrap().is_err());
}

#[tokio::test]
async fn test_session_rejects_garbage() {
    let (wire_session, mut wire_test) = tokio::io::duplex(PIPE_CAPACITY);
    let (plain_session, _plain_test) = tokio::io::duplex(PIPE_CAPACITY);
    let pair = PipePair::new(memory_registry(1), PipePairConfig::default()).unwrap();
    let session = tokio::spawn(run_session(pair, plain_session, wire_session));

    wire_test.write_all(&[0x42, 0x00, 0x01]).await.unwrap();
    let err = session.await.unwrap().unwrap_err();
    assert!(err.to_string().contains("unknown opcode"));
    drop(wire_test);
}
