//! Integration tests for the batched metadata writer against SQLite.

mod common;

use common::TestServer;
use fleet_core::NodeChannel;
use fleet_core::config::WriterConfig;
use fleet_server::{CheckIn, MetadataWriter};
use std::time::{Duration, Instant};

const N1: &str = "0a0a0a0a-1111-4111-8111-111111111111";
const N2: &str = "0b0b0b0b-2222-4222-8222-222222222222";
const N3: &str = "0c0c0c0c-3333-4333-8333-333333333333";

fn writer_config() -> WriterConfig {
    WriterConfig {
        batch_size: 100,
        flush_interval_secs: 3600,
        buffer_size: 100,
    }
}

#[tokio::test]
async fn test_check_ins_coalesce_until_flush() {
    let server = TestServer::new().await;
    let env = server.create_environment("dev").await;
    server.enroll(&env, N1, "linux").await;
    server.enroll(&env, N2, "windows").await;
    let n1 = server.node(&env, N1).await;
    let n2 = server.node(&env, N2).await;

    let writer = MetadataWriter::spawn(server.metadata(), &writer_config());
    assert!(writer.submit(CheckIn {
        node_id: n1.node_id,
        ip_address: Some("10.0.0.1".to_string()),
        channel: NodeChannel::Config,
        bytes: 10,
    }));
    assert!(writer.submit(CheckIn {
        node_id: n1.node_id,
        ip_address: None,
        channel: NodeChannel::Log,
        bytes: 5,
    }));
    assert!(writer.submit(CheckIn {
        node_id: n2.node_id,
        ip_address: Some("10.0.0.2".to_string()),
        channel: NodeChannel::QueryWrite,
        bytes: 7,
    }));

    // Nothing is written before the batch fills or the interval elapses.
    tokio::task::yield_now().await;
    assert!(server.node(&env, N1).await.last_config.is_none());

    writer.flush().await;

    let updated = server.node(&env, N1).await;
    assert_eq!(updated.ip_address, "10.0.0.1");
    assert!(updated.last_config.is_some());
    assert!(updated.last_log.is_some());
    assert!(updated.last_query_read.is_none());
    assert_eq!(updated.bytes_received, n1.bytes_received + 15);
    assert!(updated.last_seen >= n1.last_seen);

    let updated = server.node(&env, N2).await;
    assert_eq!(updated.ip_address, "10.0.0.2");
    assert!(updated.last_query_write.is_some());
    assert!(updated.last_config.is_none());
    assert_eq!(updated.bytes_received, n2.bytes_received + 7);

    writer.shutdown().await;
}

#[tokio::test]
async fn test_unknown_address_keeps_stored_one() {
    let server = TestServer::new().await;
    let env = server.create_environment("dev").await;
    server.enroll(&env, N1, "linux").await;
    let n1 = server.node(&env, N1).await;

    let writer = MetadataWriter::spawn(server.metadata(), &writer_config());
    writer.submit(CheckIn {
        node_id: n1.node_id,
        ip_address: Some("192.168.1.5".to_string()),
        channel: NodeChannel::Carve,
        bytes: 0,
    });
    writer.flush().await;

    writer.submit(CheckIn {
        node_id: n1.node_id,
        ip_address: None,
        channel: NodeChannel::QueryRead,
        bytes: 0,
    });
    writer.flush().await;

    let updated = server.node(&env, N1).await;
    assert_eq!(updated.ip_address, "192.168.1.5");
    assert!(updated.last_carve.is_some());
    assert!(updated.last_query_read.is_some());
    assert_eq!(updated.bytes_received, n1.bytes_received);

    writer.shutdown().await;
}

#[tokio::test]
async fn test_latest_address_in_window_is_stored() {
    let server = TestServer::new().await;
    let env = server.create_environment("dev").await;
    server.enroll(&env, N1, "linux").await;
    let n1 = server.node(&env, N1).await;

    let writer = MetadataWriter::spawn(server.metadata(), &writer_config());
    let check_in = |ip: &str| CheckIn {
        node_id: n1.node_id,
        ip_address: Some(ip.to_string()),
        channel: NodeChannel::Config,
        bytes: 0,
    };
    writer.submit(check_in("10.1.0.1"));
    writer.flush().await;
    assert_eq!(server.node(&env, N1).await.ip_address, "10.1.0.1");

    // The node moves away and back within one flush window.
    writer.submit(check_in("10.1.0.2"));
    writer.submit(check_in("10.1.0.1"));
    writer.flush().await;
    assert_eq!(server.node(&env, N1).await.ip_address, "10.1.0.1");

    writer.submit(check_in("10.1.0.2"));
    writer.flush().await;
    assert_eq!(server.node(&env, N1).await.ip_address, "10.1.0.2");

    writer.shutdown().await;
}

#[tokio::test]
async fn test_full_queue_drops_and_counts() {
    let server = TestServer::new().await;
    let env = server.create_environment("dev").await;
    server.enroll(&env, N1, "linux").await;
    let n1 = server.node(&env, N1).await;

    let writer = MetadataWriter::spawn(
        server.metadata(),
        &WriterConfig {
            buffer_size: 1,
            ..writer_config()
        },
    );
    let check_in = || CheckIn {
        node_id: n1.node_id,
        ip_address: None,
        channel: NodeChannel::Log,
        bytes: 1,
    };

    // The worker has not run yet on this single-threaded runtime, so the
    // first check-in fills the queue.
    let dropped_before = fleet_server::metrics::WRITER_DROPPED.get();
    assert!(writer.submit(check_in()));
    assert!(!writer.submit(check_in()));
    assert!(fleet_server::metrics::WRITER_DROPPED.get() > dropped_before);

    writer.flush().await;
    let updated = server.node(&env, N1).await;
    assert!(updated.last_log.is_some());
    assert_eq!(updated.bytes_received, n1.bytes_received + 1);

    writer.shutdown().await;
}

#[tokio::test]
async fn test_size_flush_restarts_interval() {
    let server = TestServer::new().await;
    let env = server.create_environment("dev").await;
    for node in [N1, N2, N3] {
        server.enroll(&env, node, "linux").await;
    }
    let n1 = server.node(&env, N1).await;
    let n2 = server.node(&env, N2).await;
    let n3 = server.node(&env, N3).await;

    let start = Instant::now();
    let writer = MetadataWriter::spawn(
        server.metadata(),
        &WriterConfig {
            batch_size: 2,
            flush_interval_secs: 2,
            buffer_size: 100,
        },
    );
    let check_in = |node_id| CheckIn {
        node_id,
        ip_address: None,
        channel: NodeChannel::Log,
        bytes: 1,
    };

    tokio::time::sleep_until((start + Duration::from_millis(1500)).into()).await;
    writer.submit(check_in(n1.node_id));
    writer.submit(check_in(n2.node_id));
    while server.node(&env, N2).await.last_log.is_none() {
        assert!(start.elapsed() < Duration::from_secs(2), "size flush did not happen");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    writer.submit(check_in(n3.node_id));

    // The original tick at two seconds no longer flushes.
    tokio::time::sleep_until((start + Duration::from_millis(2700)).into()).await;
    assert!(server.node(&env, N3).await.last_log.is_none());

    // A full interval after the size flush does.
    while server.node(&env, N3).await.last_log.is_none() {
        assert!(start.elapsed() < Duration::from_secs(6), "interval flush did not happen");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    writer.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_writes_pending_check_ins() {
    let server = TestServer::new().await;
    let env = server.create_environment("dev").await;
    server.enroll(&env, N1, "linux").await;
    let n1 = server.node(&env, N1).await;

    let writer = MetadataWriter::spawn(server.metadata(), &writer_config());
    assert!(writer.submit(CheckIn {
        node_id: n1.node_id,
        ip_address: None,
        channel: NodeChannel::Config,
        bytes: 3,
    }));

    writer.shutdown().await;
    // Idempotent.
    writer.shutdown().await;

    let updated = server.node(&env, N1).await;
    assert!(updated.last_config.is_some());
    assert_eq!(updated.bytes_received, n1.bytes_received + 3);

    assert!(!writer.submit(CheckIn {
        node_id: n1.node_id,
        ip_address: None,
        channel: NodeChannel::Log,
        bytes: 1,
    }));
}

#[tokio::test]
async fn test_batch_size_triggers_flush() {
    let server = TestServer::new().await;
    let env = server.create_environment("dev").await;
    server.enroll(&env, N1, "linux").await;
    server.enroll(&env, N2, "linux").await;
    let n1 = server.node(&env, N1).await;
    let n2 = server.node(&env, N2).await;

    let writer = MetadataWriter::spawn(
        server.metadata(),
        &WriterConfig {
            batch_size: 2,
            ..writer_config()
        },
    );
    for node_id in [n1.node_id, n2.node_id] {
        writer.submit(CheckIn {
            node_id,
            ip_address: None,
            channel: NodeChannel::Log,
            bytes: 1,
        });
    }

    // The second distinct node fills the batch; poll for the write.
    let mut written = false;
    for _ in 0..50 {
        if server.node(&env, N2).await.last_log.is_some() {
            written = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(written);
    assert!(server.node(&env, N1).await.last_log.is_some());

    writer.shutdown().await;
}
