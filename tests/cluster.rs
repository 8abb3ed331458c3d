//! End-to-end cluster scenarios over the in-process transport.
//!
//! Each node gets its own sled directory and a mailbox on a shared
//! [`LocalNetwork`]; a pump task feeds received messages into the engine.
//! Tests poll with explicit timeouts rather than assuming election timing.

use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use raftkit::{
    Config, ConfChangeType, Engine, Fallback, InitCluster, Join, KvCommand, KvStateMachine,
    LocalNetwork, MemberInfo, MemberKind, Operator, Pool, RaftError, Restart, SledStorage,
};

const TICK: Duration = Duration::from_millis(10);

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("raftkit=debug")
        .with_test_writer()
        .try_init();
}

struct Node {
    engine: Arc<Engine>,
    fsm: Arc<KvStateMachine>,
    pool: Arc<Pool>,
    storage: Arc<SledStorage>,
    runner: JoinHandle<raftkit::Result<()>>,
    pump: JoinHandle<()>,
}

impl Node {
    async fn spawn(
        net: &LocalNetwork,
        dir: &TempDir,
        id: u64,
        snap_interval: u64,
        operators: Vec<Box<dyn Operator>>,
    ) -> Node {
        let storage = Arc::new(SledStorage::open(dir.path(), 3).unwrap());
        let fsm = Arc::new(KvStateMachine::new());
        let pool = Pool::new(Arc::new(net.clone()));
        let engine = Engine::new(
            Config {
                id,
                tick_interval: TICK,
                snap_interval,
                ..Config::default()
            },
            fsm.clone(),
            Arc::clone(&storage) as Arc<dyn raftkit::Storage>,
            Arc::clone(&pool),
        );

        let mut mailbox = net.register(id, 4096);
        let pump = {
            let engine = Arc::clone(&engine);
            tokio::spawn(async move {
                while let Some(msg) = mailbox.recv().await {
                    let _ = engine.push(msg);
                }
            })
        };

        let runner = {
            let engine = Arc::clone(&engine);
            let addr = addr_of(id);
            tokio::spawn(async move { engine.start(&addr, operators).await })
        };

        Node {
            engine,
            fsm,
            pool,
            storage,
            runner,
            pump,
        }
    }

    async fn stop(&self) {
        let _ = self.engine.shutdown(Duration::from_secs(2)).await;
    }
}

fn addr_of(id: u64) -> String {
    format!("127.0.0.1:{}", 9000 + id)
}

fn voters(ids: &[u64]) -> Vec<MemberInfo> {
    ids.iter().map(|id| MemberInfo::voter(*id, addr_of(*id))).collect()
}

fn set_cmd(key: &str, value: &[u8]) -> Vec<u8> {
    KvCommand::Set {
        key: key.to_string(),
        value: value.to_vec(),
    }
    .encode()
    .unwrap()
}

async fn wait_until(mut cond: impl FnMut() -> bool, timeout: Duration, what: &str) {
    let start = Instant::now();
    while !cond() {
        if start.elapsed() > timeout {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

async fn wait_for_leader(nodes: &[&Node], timeout: Duration) -> u64 {
    let start = Instant::now();
    loop {
        for node in nodes {
            if let Ok(status) = node.engine.status() {
                if status.is_leader() {
                    return status.id;
                }
            }
        }
        if start.elapsed() > timeout {
            panic!("leader election timed out after {timeout:?}");
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn single_node_propose_and_read() {
    init_tracing();
    let net = LocalNetwork::new();
    let dir = TempDir::new().unwrap();
    let node = Node::spawn(
        &net,
        &dir,
        1,
        1000,
        vec![Box::new(InitCluster { peers: vec![] })],
    )
    .await;

    wait_for_leader(&[&node], Duration::from_secs(10)).await;

    node.engine
        .propose_replicate(set_cmd("greeting", b"hello"))
        .await
        .unwrap();
    assert_eq!(node.fsm.get("greeting"), Some(b"hello".to_vec()));

    node.engine.linearizable_read().await.unwrap();

    let status = node.engine.status().unwrap();
    assert!(status.applied_index >= 1);
    assert!(status.applied_index >= status.snapshot_index);

    node.engine.shutdown(Duration::from_secs(2)).await.unwrap();

    // The loop exits with the stopped error, and every public operation
    // fails fast afterwards.
    let run_result = node.runner.await.unwrap();
    assert!(matches!(run_result, Err(RaftError::Stopped)));
    assert!(matches!(
        node.engine.propose_replicate(vec![1]).await,
        Err(RaftError::Stopped)
    ));
    assert!(matches!(
        node.engine.linearizable_read().await,
        Err(RaftError::Stopped)
    ));
    assert!(matches!(node.engine.status(), Err(RaftError::Stopped)));
    assert!(matches!(
        node.engine.shutdown(Duration::from_secs(1)).await,
        Err(RaftError::Stopped)
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn graceful_shutdown_with_inflight_proposal() {
    init_tracing();
    let net = LocalNetwork::new();
    let dir = TempDir::new().unwrap();
    let node = Node::spawn(
        &net,
        &dir,
        1,
        1000,
        vec![Box::new(InitCluster { peers: vec![] })],
    )
    .await;
    wait_for_leader(&[&node], Duration::from_secs(10)).await;

    let proposal = {
        let engine = Arc::clone(&node.engine);
        tokio::spawn(async move { engine.propose_replicate(set_cmd("k", b"v")).await })
    };

    node.engine
        .shutdown(Duration::from_millis(500))
        .await
        .unwrap();

    // The in-flight proposal either completed or observed the stop.
    let outcome = proposal.await.unwrap();
    assert!(matches!(outcome, Ok(()) | Err(RaftError::Stopped)));
    assert!(matches!(
        node.engine.shutdown(Duration::from_millis(100)).await,
        Err(RaftError::Stopped)
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn snapshot_cadence_and_compaction() {
    init_tracing();
    let net = LocalNetwork::new();
    let dir = TempDir::new().unwrap();
    let node = Node::spawn(
        &net,
        &dir,
        1,
        10,
        vec![Box::new(InitCluster { peers: vec![] })],
    )
    .await;
    wait_for_leader(&[&node], Duration::from_secs(10)).await;

    for i in 0..25 {
        node.engine
            .propose_replicate(set_cmd(&format!("key-{i}"), b"x"))
            .await
            .unwrap();
    }

    // Snapshots lag one ready cycle behind the gate; push a few more
    // entries through while polling.
    wait_until(
        || {
            node.engine
                .status()
                .map(|s| s.snapshot_index >= 11 && s.applied_index >= s.snapshot_index)
                .unwrap_or(false)
        },
        Duration::from_secs(10),
        "an automatic snapshot",
    )
    .await;

    wait_until(
        || {
            use raftkit::Storage;
            node.storage.first_index().map(|i| i > 1).unwrap_or(false)
        },
        Duration::from_secs(10),
        "log compaction",
    )
    .await;

    let header = node.engine.create_snapshot().await.unwrap();
    assert!(header.get_metadata().index >= 11);

    node.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn restart_restores_state_machine() {
    init_tracing();
    let net = LocalNetwork::new();
    let dir = TempDir::new().unwrap();

    {
        let node = Node::spawn(
            &net,
            &dir,
            1,
            10,
            vec![Box::new(InitCluster { peers: vec![] })],
        )
        .await;
        wait_for_leader(&[&node], Duration::from_secs(10)).await;

        for i in 0..25 {
            node.engine
                .propose_replicate(set_cmd(&format!("key-{i}"), &[i]))
                .await
                .unwrap();
        }
        wait_until(
            || {
                node.engine
                    .status()
                    .map(|s| s.snapshot_index >= 11)
                    .unwrap_or(false)
            },
            Duration::from_secs(10),
            "a snapshot before restart",
        )
        .await;

        node.stop().await;
        let _ = node.runner.await;

        // Release the sled lock before reopening the directory: the pump
        // task holds the last engine handle.
        net.unregister(1);
        node.pump.abort();
        let _ = node.pump.await;
    }

    // Same directory, fresh process state: restart-or-init picks restart.
    let node = Node::spawn(
        &net,
        &dir,
        0,
        10,
        vec![Box::new(Fallback::new(Restart, InitCluster { peers: vec![] }))],
    )
    .await;
    wait_for_leader(&[&node], Duration::from_secs(10)).await;

    let status = node.engine.status().unwrap();
    assert_eq!(status.id, 1, "identity is recovered from storage");
    assert!(status.applied_index >= status.snapshot_index);
    assert!(status.snapshot_index >= 11);

    // Everything proposed before the restart is visible again.
    node.engine.linearizable_read().await.unwrap();
    for i in 0..25u8 {
        assert_eq!(node.fsm.get(&format!("key-{i}")), Some(vec![i]));
    }

    node.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn three_node_replication_and_leader_loss() {
    init_tracing();
    let net = LocalNetwork::new();
    let dirs: Vec<TempDir> = (0..3).map(|_| TempDir::new().unwrap()).collect();
    let roster = voters(&[1, 2, 3]);

    let mut nodes = Vec::new();
    for id in 1..=3u64 {
        nodes.push(
            Node::spawn(
                &net,
                &dirs[(id - 1) as usize],
                id,
                1000,
                vec![Box::new(InitCluster {
                    peers: roster.clone(),
                })],
            )
            .await,
        );
    }

    let refs: Vec<&Node> = nodes.iter().collect();
    let leader_id = wait_for_leader(&refs, Duration::from_secs(20)).await;
    let leader = &nodes[(leader_id - 1) as usize];

    leader
        .engine
        .propose_replicate(set_cmd("shared", b"value"))
        .await
        .unwrap();

    for node in &nodes {
        let fsm = Arc::clone(&node.fsm);
        wait_until(
            move || fsm.get("shared") == Some(b"value".to_vec()),
            Duration::from_secs(10),
            "replication to every member",
        )
        .await;
    }

    // Take the leader down and propose on a survivor while it still points
    // at the dead leader: the waiter is woken as soon as the survivor
    // notices the leader is gone.
    net.unregister(leader_id);
    leader.stop().await;

    let survivor = nodes
        .iter()
        .find(|n| n.engine.status().map(|s| s.id != leader_id).unwrap_or(false))
        .unwrap();
    let pending = survivor
        .engine
        .propose_replicate(set_cmd("orphan", b"x"))
        .await;
    assert!(
        matches!(pending, Err(RaftError::NoLeader) | Err(RaftError::Protocol(_))),
        "pending proposal must fail on leader loss, got {pending:?}"
    );

    // The survivors elect a fresh leader and make progress again.
    let survivors: Vec<&Node> = nodes
        .iter()
        .filter(|n| n.engine.status().map(|s| s.id != leader_id).unwrap_or(false))
        .collect();
    let new_leader_id = wait_for_leader(&survivors, Duration::from_secs(20)).await;
    assert_ne!(new_leader_id, leader_id);

    let new_leader = survivors
        .iter()
        .find(|n| n.engine.status().map(|s| s.id == new_leader_id).unwrap_or(false))
        .unwrap();
    new_leader
        .engine
        .propose_replicate(set_cmd("after-failover", b"y"))
        .await
        .unwrap();

    for node in &survivors {
        node.stop().await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn staging_member_is_promoted_to_voter() {
    init_tracing();
    let net = LocalNetwork::new();
    let dir1 = TempDir::new().unwrap();
    let dir2 = TempDir::new().unwrap();

    let leader = Node::spawn(
        &net,
        &dir1,
        1,
        1000,
        vec![Box::new(InitCluster { peers: vec![] })],
    )
    .await;
    wait_for_leader(&[&leader], Duration::from_secs(10)).await;

    for i in 0..100 {
        leader
            .engine
            .propose_replicate(set_cmd(&format!("key-{i}"), b"x"))
            .await
            .unwrap();
    }

    // A blank node joins and is announced as a staging member.
    let joiner = Node::spawn(
        &net,
        &dir2,
        2,
        1000,
        vec![Box::new(Join {
            peers: vec![MemberInfo::voter(1, addr_of(1))],
        })],
    )
    .await;
    leader
        .engine
        .propose_conf_change(
            &MemberInfo::staging(2, addr_of(2)),
            ConfChangeType::AddLearnerNode,
        )
        .await
        .unwrap();

    // Once the joiner's log catches up, the engine proposes the promotion
    // on its own and the member becomes a voter.
    wait_until(
        || {
            leader
                .pool
                .get(2)
                .map(|m| m.kind() == MemberKind::Voter)
                .unwrap_or(false)
        },
        Duration::from_secs(30),
        "automatic staging promotion",
    )
    .await;

    wait_until(
        || joiner.fsm.get("key-99").is_some(),
        Duration::from_secs(10),
        "joiner catch-up",
    )
    .await;

    // Writes keep committing with the promoted voter in the quorum.
    leader
        .engine
        .propose_replicate(set_cmd("post-promotion", b"z"))
        .await
        .unwrap();

    joiner.stop().await;
    leader.stop().await;
}
