mod common;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use common::{file_body, MockCluster, MockTransport, Offer};
use snapshot_finder::artifact::{ArtifactKind, FULL_SNAPSHOT_PATH};
use snapshot_finder::config::ConfigBuilder;
use snapshot_finder::finder::AttemptFailure;
use snapshot_finder::peers::Peer;
use snapshot_finder::rank::REPORT_FILE_NAME;
use snapshot_finder::rpc::ClusterNode;
use snapshot_finder::{Config, FindStatus, FinderError, SnapshotFinder};

const PEER_A: &str = "10.0.0.1:8899";
const PEER_B: &str = "10.0.0.2:8899";

fn config(dir: &Path) -> ConfigBuilder {
    Config::builder()
        .snapshot_dir(dir)
        .sleep_before_retry(1)
        .measurement_time(3)
        .min_download_speed(1)
}

fn finder(
    config: ConfigBuilder,
    cluster: &Arc<MockCluster>,
    transport: &Arc<MockTransport>,
) -> SnapshotFinder {
    SnapshotFinder::with_components(
        config.build().unwrap(),
        cluster.clone(),
        cluster.clone(),
        transport.clone(),
    )
    .unwrap()
}

fn read_report(dir: &Path) -> serde_json::Value {
    serde_json::from_slice(&std::fs::read(dir.join(REPORT_FILE_NAME)).unwrap()).unwrap()
}

fn temp_files(dir: &Path) -> Vec<String> {
    std::fs::read_dir(dir)
        .unwrap()
        .flatten()
        .filter_map(|e| e.file_name().to_str().map(str::to_string))
        .filter(|name| name.starts_with("tmp-"))
        .collect()
}

#[tokio::test(start_paused = true)]
async fn test_empty_peer_list_fails_without_probing() {
    let dir = TempDir::new().unwrap();
    let cluster = Arc::new(MockCluster::new(1050));
    let transport = Arc::new(MockTransport::new());

    let outcome = finder(config(dir.path()).max_attempts(2), &cluster, &transport)
        .run(CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(outcome.status, FindStatus::Exhausted);
    assert_eq!(outcome.attempts, 2);
    assert_eq!(cluster.node_calls(), 2);
    assert!(transport.locate_calls().is_empty());
    assert!(outcome
        .attempt_log
        .iter()
        .all(|s| s.failure == Some(AttemptFailure::NoPeers)));
}

#[tokio::test(start_paused = true)]
async fn test_recent_full_snapshot_is_downloaded() {
    let dir = TempDir::new().unwrap();
    let cluster = Arc::new(MockCluster::new(1050).public(PEER_A));
    let transport = Arc::new(
        MockTransport::new().peer(PEER_A, Offer::full("/snapshot-1000-AbC.tar.zst", 12).fast()),
    );

    let outcome = finder(config(dir.path()), &cluster, &transport)
        .run(CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(outcome.status, FindStatus::Success);
    assert_eq!(outcome.attempts, 1);

    let path = dir.path().join("snapshot-1000-AbC.tar.zst");
    assert_eq!(std::fs::read(&path).unwrap(), file_body("/snapshot-1000-AbC.tar.zst"));
    assert_eq!(outcome.downloaded(), &[path]);
    assert!(temp_files(dir.path()).is_empty());

    let report = read_report(dir.path());
    assert_eq!(report["last_update_slot"], 1050);
    assert_eq!(report["total_rpc_nodes_scanned"], 1);
    assert_eq!(report["rpc_nodes"][0]["snapshot_address"], PEER_A);
    assert_eq!(report["rpc_nodes"][0]["slots_diff"], 50);
}

#[tokio::test(start_paused = true)]
async fn test_stale_full_snapshot_is_discarded() {
    let dir = TempDir::new().unwrap();
    let cluster = Arc::new(MockCluster::new(3000).public(PEER_A));
    let transport = Arc::new(
        MockTransport::new().peer(PEER_A, Offer::full("/snapshot-1000-AbC.tar.zst", 12).fast()),
    );

    let outcome = finder(config(dir.path()).max_attempts(1), &cluster, &transport)
        .run(CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(outcome.status, FindStatus::Exhausted);
    let summary = &outcome.attempt_log[0];
    assert_eq!(summary.failure, Some(AttemptFailure::NoCandidates));
    assert_eq!(summary.candidates, 0);
    assert_eq!(summary.discarded.slot_age, 1);
    assert!(transport.open_calls().is_empty());
    assert_eq!(read_report(dir.path())["rpc_nodes"].as_array().unwrap().len(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_incremental_on_local_base_skips_full_probe() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("snapshot-500-LocalHash.tar.zst"), b"local").unwrap();

    const INC: &str = "/incremental-snapshot-500-600-IncHash.tar.zst";
    let cluster = Arc::new(MockCluster::new(650).public(PEER_A));
    let transport = Arc::new(MockTransport::new().peer(
        PEER_A,
        Offer::incremental(INC, 8)
            .with_full("/snapshot-600-FullHash.tar.zst", 8)
            .fast(),
    ));

    let outcome = finder(config(dir.path()), &cluster, &transport)
        .run(CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(outcome.status, FindStatus::Success);
    assert!(transport
        .locate_calls()
        .iter()
        .all(|(_, kind)| *kind == ArtifactKind::Incremental));
    assert_eq!(transport.transfers(), vec![(Peer::new(PEER_A), INC.to_string())]);
    assert!(dir
        .path()
        .join("incremental-snapshot-500-600-IncHash.tar.zst")
        .exists());
    assert!(!dir.path().join("snapshot-600-FullHash.tar.zst").exists());
}

#[tokio::test(start_paused = true)]
async fn test_paired_snapshot_downloads_full_first() {
    let dir = TempDir::new().unwrap();

    const INC: &str = "/incremental-snapshot-1000-1040-IncHash.tar.zst";
    const FULL: &str = "/snapshot-1000-FullHash.tar.zst";
    let cluster = Arc::new(MockCluster::new(1050).public(PEER_A));
    let transport = Arc::new(
        MockTransport::new().peer(PEER_A, Offer::incremental(INC, 8).with_full(FULL, 9).fast()),
    );

    let outcome = finder(config(dir.path()), &cluster, &transport)
        .run(CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(outcome.status, FindStatus::Success);
    let peer = Peer::new(PEER_A);
    assert_eq!(
        transport.transfers(),
        vec![(peer.clone(), FULL.to_string()), (peer, INC.to_string())]
    );
    assert_eq!(outcome.downloaded().len(), 2);
    assert_eq!(read_report(dir.path())["rpc_nodes"][0]["slots_diff"], 10);
}

#[tokio::test(start_paused = true)]
async fn test_slow_first_peer_falls_through_to_second() {
    let dir = TempDir::new().unwrap();
    let cluster = Arc::new(MockCluster::new(1050).public(PEER_A).public(PEER_B));
    let transport = Arc::new(
        MockTransport::new()
            .peer(PEER_A, Offer::full("/snapshot-1000-AaA.tar.zst", 5))
            .peer(PEER_B, Offer::full("/snapshot-1000-BbB.tar.zst", 20).fast()),
    );

    let outcome = finder(config(dir.path()), &cluster, &transport)
        .run(CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(outcome.status, FindStatus::Success);
    assert_eq!(outcome.attempts, 1);

    let (a, b) = (Peer::new(PEER_A), Peer::new(PEER_B));
    assert_eq!(
        transport.open_calls(),
        vec![
            (a, FULL_SNAPSHOT_PATH.to_string()),
            (b.clone(), FULL_SNAPSHOT_PATH.to_string()),
            (b, "/snapshot-1000-BbB.tar.zst".to_string()),
        ]
    );
    assert!(dir.path().join("snapshot-1000-BbB.tar.zst").exists());
    assert_eq!(read_report(dir.path())["rpc_nodes"][0]["snapshot_address"], PEER_A);
}

#[tokio::test(start_paused = true)]
async fn test_no_fast_peer_fails_attempt() {
    let dir = TempDir::new().unwrap();
    let cluster = Arc::new(MockCluster::new(1050).public(PEER_A));
    let transport = Arc::new(
        MockTransport::new().peer(PEER_A, Offer::full("/snapshot-1000-AaA.tar.zst", 5)),
    );

    let outcome = finder(config(dir.path()).max_attempts(1), &cluster, &transport)
        .run(CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(outcome.status, FindStatus::Exhausted);
    assert_eq!(outcome.attempt_log[0].failure, Some(AttemptFailure::NoFastPeer));
    assert!(transport.transfers().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_all_attempts_fail_with_escalation_after_first() {
    let dir = TempDir::new().unwrap();
    let cluster = Arc::new(
        MockCluster::new(3000)
            .public(PEER_A)
            .private("10.0.0.9:8001"),
    );
    let transport = Arc::new(
        MockTransport::new().peer(PEER_A, Offer::full("/snapshot-100-Old.tar.zst", 5).fast()),
    );

    let outcome = finder(config(dir.path()), &cluster, &transport)
        .run(CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(outcome.status, FindStatus::Exhausted);
    assert_eq!(outcome.attempts, 5);
    assert_eq!(outcome.attempt_log.len(), 5);
    assert_eq!(cluster.node_calls(), 5);

    let first = &outcome.attempt_log[0];
    assert!(!first.private_included);
    assert_eq!(first.peers, 1);

    for summary in &outcome.attempt_log[1..] {
        assert!(summary.private_included);
        assert_eq!(summary.peers, 2);
        assert_eq!(summary.discarded.timeout, 1);
        assert_eq!(summary.discarded.slot_age, 1);
    }

    let private = Peer::new("10.0.0.9:8899");
    assert!(transport.locate_calls().iter().any(|(peer, _)| *peer == private));
}

#[tokio::test(start_paused = true)]
async fn test_initial_private_inclusion_stays_enabled() {
    let dir = TempDir::new().unwrap();
    let cluster = Arc::new(MockCluster::new(1050).private("10.0.0.9:8001"));
    let transport = Arc::new(MockTransport::new());

    let outcome = finder(
        config(dir.path()).with_private_rpc(true).max_attempts(2),
        &cluster,
        &transport,
    )
    .run(CancellationToken::new())
    .await
    .unwrap();

    assert!(outcome.attempt_log.iter().all(|s| s.private_included));
    assert!(outcome.attempt_log.iter().all(|s| s.peers == 1));
}

#[tokio::test(start_paused = true)]
async fn test_oracle_failure_fails_attempt_before_discovery() {
    let dir = TempDir::new().unwrap();
    let cluster = Arc::new(MockCluster::unreachable().public(PEER_A));
    let transport = Arc::new(MockTransport::new());

    let outcome = finder(config(dir.path()).max_attempts(2), &cluster, &transport)
        .run(CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(outcome.status, FindStatus::Exhausted);
    assert_eq!(cluster.slot_calls(), 2);
    assert_eq!(cluster.node_calls(), 0);
    assert!(outcome
        .attempt_log
        .iter()
        .all(|s| s.failure == Some(AttemptFailure::HeightUnavailable)));
}

#[tokio::test(start_paused = true)]
async fn test_pinned_slot_bypasses_oracle() {
    let dir = TempDir::new().unwrap();
    let cluster = Arc::new(MockCluster::unreachable().public(PEER_A));
    let transport = Arc::new(
        MockTransport::new().peer(PEER_A, Offer::full("/snapshot-1000-AbC.tar.zst", 12).fast()),
    );

    let outcome = finder(config(dir.path()).slot(1020), &cluster, &transport)
        .run(CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(outcome.status, FindStatus::Success);
    assert_eq!(cluster.slot_calls(), 0);
    assert_eq!(outcome.attempt_log[0].current_slot, Some(1020));
}

#[tokio::test(start_paused = true)]
async fn test_rerun_with_snapshot_present_transfers_nothing() {
    let dir = TempDir::new().unwrap();
    let cluster = Arc::new(MockCluster::new(1050).public(PEER_A));
    let transport = Arc::new(
        MockTransport::new().peer(PEER_A, Offer::full("/snapshot-1000-AbC.tar.zst", 12).fast()),
    );

    let first = finder(config(dir.path()), &cluster, &transport)
        .run(CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(first.status, FindStatus::Success);
    assert_eq!(transport.transfers().len(), 1);

    let second = finder(config(dir.path()), &cluster, &transport)
        .run(CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(second.status, FindStatus::Success);
    assert!(second.downloaded().is_empty());
    assert_eq!(transport.transfers().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_version_filter_discards_other_versions() {
    let dir = TempDir::new().unwrap();
    let cluster = Arc::new(
        MockCluster::new(1050).public(PEER_A).node(ClusterNode {
            pubkey: Some("other".into()),
            gossip: Some("10.0.0.3:8001".into()),
            rpc: Some("10.0.0.3:8899".into()),
            version: Some("1.17.0".into()),
        }),
    );
    let transport = Arc::new(
        MockTransport::new().peer(PEER_A, Offer::full("/snapshot-1000-AbC.tar.zst", 12).fast()),
    );

    let outcome = finder(config(dir.path()).version("1.18.22"), &cluster, &transport)
        .run(CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(outcome.status, FindStatus::Success);
    assert_eq!(outcome.attempt_log[0].peers, 1);
    assert_eq!(outcome.attempt_log[0].discarded.version, 1);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_mid_transfer_removes_temp_file() {
    let dir = TempDir::new().unwrap();
    let cancel = CancellationToken::new();
    let cluster = Arc::new(MockCluster::new(1050).public(PEER_A));
    let transport = Arc::new(MockTransport::new().peer(
        PEER_A,
        Offer::full("/snapshot-1000-AbC.tar.zst", 12)
            .fast()
            .cancel_mid_transfer(cancel.clone()),
    ));

    let outcome = finder(config(dir.path()), &cluster, &transport)
        .run(cancel)
        .await
        .unwrap();

    assert_eq!(outcome.status, FindStatus::Cancelled);
    assert_eq!(outcome.attempts, 1);
    assert!(temp_files(dir.path()).is_empty());
    assert!(!dir.path().join("snapshot-1000-AbC.tar.zst").exists());
}

#[tokio::test(start_paused = true)]
async fn test_cancel_during_retry_delay() {
    let dir = TempDir::new().unwrap();
    let cluster = Arc::new(MockCluster::new(1050));
    let transport = Arc::new(MockTransport::new());
    let cancel = CancellationToken::new();

    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(3)).await;
        trigger.cancel();
    });

    let outcome = finder(config(dir.path()).sleep_before_retry(7), &cluster, &transport)
        .run(cancel)
        .await
        .unwrap();

    assert_eq!(outcome.status, FindStatus::Cancelled);
    assert_eq!(outcome.attempts, 1);
    assert_eq!(cluster.node_calls(), 1);
}

#[tokio::test]
async fn test_unusable_snapshot_dir_is_fatal() {
    let dir = TempDir::new().unwrap();
    let not_a_dir = dir.path().join("file");
    std::fs::write(&not_a_dir, b"x").unwrap();

    let cluster = Arc::new(MockCluster::new(1050).public(PEER_A));
    let transport = Arc::new(MockTransport::new());

    let err = finder(config(&not_a_dir), &cluster, &transport)
        .run(CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, FinderError::Resource { .. }));
    assert_eq!(cluster.node_calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_scan_once_reports_without_downloading() {
    let dir = TempDir::new().unwrap();
    let cluster = Arc::new(MockCluster::new(1050).public(PEER_A).public(PEER_B));
    let transport = Arc::new(
        MockTransport::new()
            .peer(PEER_A, Offer::full("/snapshot-1000-AaA.tar.zst", 30).fast())
            .peer(PEER_B, Offer::full("/snapshot-1010-BbB.tar.zst", 10).fast()),
    );

    let outcome = finder(config(dir.path()), &cluster, &transport)
        .scan_once()
        .await
        .unwrap();

    assert!(outcome.summary.failure.is_none());
    assert_eq!(outcome.candidates.len(), 2);
    assert_eq!(outcome.candidates[0].snapshot_address, Peer::new(PEER_B));
    assert!(transport.open_calls().is_empty());
    assert_eq!(read_report(dir.path())["rpc_nodes_with_potential_snapshot"], 2);
}
