//! Log replication tests: committed commands reach every state machine in
//! order, exactly once, and only through the leader.


use std::time::Duration;

use raftlet::RaftError;
use test_harness::{assert_eventually, TestCluster};

/// Test 1: A committed command is applied on every node.
#[tokio::test]
async fn test_basic_replication() {
    let cluster = TestCluster::new(3).await;
    cluster
        .wait_for_leader(Duration::from_secs(5))
        .await
        .expect("leader");

    let index = cluster.propose(b"set x 1").await.expect("proposal accepted");

    assert!(
        cluster
            .wait_for_applied_on_all(index, Duration::from_secs(5))
            .await,
        "all nodes should apply the command"
    );

    for node in cluster.nodes.values() {
        let applied = node.applied_commands();
        let found = applied
            .iter()
            .any(|(i, cmd)| *i == index && cmd == b"set x 1");
        assert!(found, "node {} missing the command", node.node_id);
    }
}

/// Test 2: Commands are applied in index order with no gaps or repeats.
#[tokio::test]
async fn test_ordered_exactly_once_delivery() {
    let cluster = TestCluster::new(3).await;
    cluster
        .wait_for_leader(Duration::from_secs(5))
        .await
        .expect("leader");

    let mut last = 0;
    for i in 0..20u8 {
        last = cluster.propose(&[i]).await.expect("proposal accepted");
    }

    assert!(
        cluster
            .wait_for_applied_on_all(last, Duration::from_secs(10))
            .await,
        "all nodes should catch up"
    );

    for node in cluster.nodes.values() {
        let applied = node.applied_commands();
        let indices: Vec<u64> = applied.iter().map(|(i, _)| *i).collect();
        let expected: Vec<u64> = (1..=indices.len() as u64).collect();
        assert_eq!(
            indices, expected,
            "node {} applied out of order or with gaps",
            node.node_id
        );
    }
    assert!(cluster.verify_applied_consistency());
}

/// Test 3: Followers refuse proposals and point at the leader.
#[tokio::test]
async fn test_follower_rejects_proposals() {
    let cluster = TestCluster::new(3).await;
    let leader = cluster
        .wait_for_leader(Duration::from_secs(5))
        .await
        .expect("leader");

    // Give heartbeats a moment to spread the leader's identity.
    tokio::time::sleep(Duration::from_millis(200)).await;

    for node in cluster.nodes.values() {
        if node.node_id == leader {
            continue;
        }
        match node.raft.start(b"nope").await {
            Err(RaftError::NotLeader(hint)) => {
                assert_eq!(hint, Some(leader), "follower should name the leader");
            }
            other => panic!("expected NotLeader, got {:?}", other.map(|_| ())),
        }
    }
}

/// Test 4: The commit watch observes the committed index.
#[tokio::test]
async fn test_commit_subscription() {
    let cluster = TestCluster::new(3).await;
    let leader = cluster
        .wait_for_leader(Duration::from_secs(5))
        .await
        .expect("leader");

    let mut commits = cluster.get_node(leader).unwrap().raft.subscribe_commits();
    let index = cluster.propose(b"watched").await.expect("proposal accepted");

    let reached = tokio::time::timeout(Duration::from_secs(5), async {
        while *commits.borrow() < index {
            if commits.changed().await.is_err() {
                return false;
            }
        }
        true
    })
    .await
    .unwrap_or(false);

    assert!(reached, "commit watch should reach the proposed index");
}

/// Test 5: Replication catches a lagging follower back up.
#[tokio::test]
async fn test_lagging_follower_catches_up() {
    let mut cluster = TestCluster::new(3).await;
    let leader = cluster
        .wait_for_leader(Duration::from_secs(5))
        .await
        .expect("leader");

    let follower = cluster
        .active_node_ids()
        .into_iter()
        .find(|&id| id != leader)
        .unwrap();
    cluster.crash_node(follower);

    let mut last = 0;
    for i in 0..10u8 {
        last = cluster.propose(&[i]).await.expect("proposal accepted");
    }
    let remaining = cluster.active_node_ids();
    assert!(
        cluster
            .wait_for_applied_on(&remaining, last, Duration::from_secs(5))
            .await
    );

    cluster.restart_node(follower);

    assert!(
        cluster
            .wait_for_applied_on(&[follower], last, Duration::from_secs(10))
            .await,
        "restarted follower should replay the committed log"
    );
    assert!(cluster.verify_applied_consistency());
}

/// Test 6: Proposals after leader failover still commit.
#[tokio::test]
async fn test_replication_across_failover() {
    let mut cluster = TestCluster::new(3).await;
    let leader = cluster
        .wait_for_leader(Duration::from_secs(5))
        .await
        .expect("leader");

    let before = cluster.propose(b"before").await.expect("proposal accepted");
    assert!(
        cluster
            .wait_for_applied_on_all(before, Duration::from_secs(5))
            .await
    );

    cluster.crash_node(leader);
    cluster
        .wait_for_new_leader(leader, Duration::from_secs(5))
        .await
        .expect("new leader");

    let after = cluster.propose(b"after").await.expect("proposal accepted");
    assert!(after > before);

    let remaining = cluster.active_node_ids();
    assert!(
        cluster
            .wait_for_applied_on(&remaining, after, Duration::from_secs(5))
            .await,
        "survivors should commit under the new leader"
    );

    assert_eventually(
        || async { cluster.verify_applied_consistency() },
        Duration::from_secs(2),
        "applied logs must agree",
    )
    .await;
}
