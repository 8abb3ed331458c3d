//! The engine: drives a single raft node through its life cycle.
//!
//! The engine binds four collaborators together — the protocol core
//! (`raft::RawNode`), durable storage, the membership pool, and the
//! application state machine — and owns the event loop that keeps them
//! consistent: it persists ready batches in order, applies committed
//! entries, resolves waiting proposals over the message bus, ships outbound
//! messages, and manages snapshots.
//!
//! ```text
//!  propose_replicate ─┐                       ┌─> storage (entries, hard state)
//!  propose_conf_change┤   ┌───────────────┐   ├─> state machine (committed)
//!  linearizable_read ─┼──>│  event loop   │───┼─> message bus (waiter wakeups)
//!  push (peer msgs) ──┘   │ owns RawNode  │   ├─> pool members (outbound)
//!                         └───────────────┘   └─> snapshots
//! ```
//!
//! All protocol-state mutations happen on the single event-loop task; public
//! operations communicate with it through bounded channels and wait on the
//! message bus.

mod event_loop;
mod operator;
mod snapshot;

pub use operator::{Fallback, InitCluster, Join, Operator, OperatorState, Restart};

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use protobuf::Message as PbMessage;
use raft::eraftpb::{ConfChange, ConfChangeType, Entry, EntryType, Message, MessageType, Snapshot};
use raft::SnapshotStatus;
use tokio::sync::{mpsc, oneshot, watch};

use crate::config::Config;
use crate::error::{RaftError, Result};
use crate::idgen::IdGenerator;
use crate::membership::Pool;
use crate::msgbus::{MsgBus, Subscription};
use crate::state_machine::StateMachine;
use crate::storage::{SnapshotFile, Storage};
use crate::types::{MemberInfo, RaftStatus, Replicate};
use crate::waitgroup::WaitGroup;

use event_loop::EventLoop;

/// Requests routed to the event loop that need `&mut RawNode`.
pub(crate) enum Report {
    Unreachable(u64),
    SnapshotStatus(u64, SnapshotStatus),
    ForgetLeader,
}

/// Channel endpoints handed out to public operations. Senders are dropped
/// one by one during shutdown to close the matching receivers in order.
pub(crate) struct Channels {
    propose_tx: Option<mpsc::Sender<Message>>,
    msg_tx: Option<mpsc::Sender<Message>>,
    snapshot_tx: Option<mpsc::Sender<oneshot::Sender<Result<()>>>>,
    report_tx: mpsc::Sender<Report>,
}

/// The raft node engine.
///
/// Construct with [`Engine::new`], boot with [`Engine::start`] (which blocks
/// on the event loop until shutdown), and submit work from any task. Every
/// public operation fails fast with [`RaftError::Stopped`] before start and
/// after shutdown.
pub struct Engine {
    pub(crate) cfg: Config,
    pub(crate) fsm: Arc<dyn StateMachine>,
    pub(crate) storage: Arc<dyn Storage>,
    pub(crate) pool: Arc<Pool>,
    pub(crate) msgbus: MsgBus,

    pub(crate) started: AtomicBool,
    pub(crate) snapshotting: AtomicBool,
    pub(crate) applied_index: AtomicU64,
    pub(crate) snap_index: AtomicU64,
    pub(crate) conf_state: Mutex<raft::eraftpb::ConfState>,

    pub(crate) local: OnceLock<MemberInfo>,
    pub(crate) idgen: OnceLock<IdGenerator>,
    chans: RwLock<Option<Channels>>,
    shutdown_tx: Arc<watch::Sender<bool>>,
    status_rx: OnceLock<watch::Receiver<RaftStatus>>,

    // propwg counts in-flight public operations, processwg the ingress
    // drain, wg the event loop and background workers.
    pub(crate) propwg: WaitGroup,
    pub(crate) processwg: WaitGroup,
    pub(crate) wg: WaitGroup,
}

impl Engine {
    /// Create an engine from its collaborators. Nothing runs until
    /// [`start`](Engine::start).
    pub fn new(
        cfg: Config,
        fsm: Arc<dyn StateMachine>,
        storage: Arc<dyn Storage>,
        pool: Arc<Pool>,
    ) -> Arc<Self> {
        let (shutdown_tx, _) = watch::channel(false);
        Arc::new(Self {
            cfg,
            fsm,
            storage,
            pool,
            msgbus: MsgBus::new(),
            started: AtomicBool::new(false),
            snapshotting: AtomicBool::new(false),
            applied_index: AtomicU64::new(0),
            snap_index: AtomicU64::new(0),
            conf_state: Mutex::new(Default::default()),
            local: OnceLock::new(),
            idgen: OnceLock::new(),
            chans: RwLock::new(None),
            shutdown_tx: Arc::new(shutdown_tx),
            status_rx: OnceLock::new(),
            propwg: WaitGroup::new(),
            processwg: WaitGroup::new(),
            wg: WaitGroup::new(),
        })
    }

    /// Boot the node through the operator chain and run the event loop.
    ///
    /// Blocks until shutdown (returning [`RaftError::Stopped`]) or until a
    /// persistence failure terminates the loop (returning that error).
    pub async fn start(
        self: &Arc<Self>,
        addr: &str,
        operators: Vec<Box<dyn Operator>>,
    ) -> Result<()> {
        if self.local.get().is_some() {
            return Err(RaftError::Stopped);
        }

        let mut ost = operator::invoke(self, addr, operators)?;
        let node = ost.node.take().ok_or(RaftError::NotInitialized)?;
        let local = ost.local.take().ok_or(RaftError::NotInitialized)?;

        let _ = self.idgen.set(IdGenerator::new(local.id as u16));
        let _ = self.local.set(local.clone());

        let (propose_tx, propose_rx) = mpsc::channel(self.cfg.ingress_capacity);
        let (msg_tx, msg_rx) = mpsc::channel(self.cfg.ingress_capacity);
        let (snapshot_tx, snapshot_rx) = mpsc::channel(1);
        let (report_tx, report_rx) = mpsc::channel(1024);

        let (status_tx, status_rx) = watch::channel(RaftStatus {
            id: local.id,
            term: node.raft.term,
            leader_id: None,
            role: node.raft.state.into(),
            applied_index: self.applied_index.load(Ordering::Acquire),
            snapshot_index: self.snap_index.load(Ordering::Acquire),
            progress: Default::default(),
        });
        let _ = self.status_rx.set(status_rx);

        *self.chans.write() = Some(Channels {
            propose_tx: Some(propose_tx),
            msg_tx: Some(msg_tx),
            snapshot_tx: Some(snapshot_tx),
            report_tx,
        });
        self.started.store(true, Ordering::Release);

        tracing::info!("engine started, member {:x} at {}", local.id, local.address);

        let hard_state = ost
            .boot
            .as_ref()
            .map(|b| b.hard_state.clone())
            .unwrap_or_default();

        EventLoop::new(
            Arc::clone(self),
            node,
            propose_rx,
            msg_rx,
            snapshot_rx,
            report_rx,
            status_tx,
            hard_state,
            ost.campaign,
        )
        .run()
        .await
    }

    /// Gracefully stop the engine.
    ///
    /// Waits for in-flight operations, drains the ingress queues, stops the
    /// event loop and background workers, then releases the message bus and
    /// the pool. If the grace period expires first, the engine context is
    /// cancelled and the remaining waits collapse.
    pub async fn shutdown(&self, grace: Duration) -> Result<()> {
        if !self.started.swap(false, Ordering::AcqRel) {
            return Err(RaftError::Stopped);
        }

        tracing::info!("engine shutting down");

        let force = {
            let shutdown_tx = Arc::clone(&self.shutdown_tx);
            tokio::spawn(async move {
                tokio::time::sleep(grace).await;
                let _ = shutdown_tx.send(true);
            })
        };

        // In-flight public operations first, so no proposal is lost mid-wait.
        self.propwg.wait().await;

        {
            let mut chans = self.chans.write();
            if let Some(ch) = chans.as_mut() {
                ch.propose_tx.take();
                ch.msg_tx.take();
            }
        }
        self.processwg.wait().await;

        let _ = self.shutdown_tx.send(true);
        self.wg.wait().await;

        {
            let mut chans = self.chans.write();
            if let Some(ch) = chans.as_mut() {
                ch.snapshot_tx.take();
            }
        }

        self.msgbus.close();
        self.pool.tear_down();
        force.abort();
        Ok(())
    }

    /// Queue a protocol message from a peer (or from the local dispatcher).
    ///
    /// Non-blocking: a full ingress buffer surfaces
    /// [`RaftError::BufferFull`] instead of applying backpressure upstream.
    pub fn push(&self, msg: Message) -> Result<()> {
        if !self.started.load(Ordering::Acquire) {
            return Err(RaftError::Stopped);
        }
        let _guard = self.propwg.token().ok_or(RaftError::Stopped)?;

        let proposal = msg.get_msg_type() == MessageType::MsgPropose;
        let tx = self.ingress_sender(proposal)?;
        match tx.try_send(msg) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => Err(RaftError::BufferFull),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(RaftError::Stopped),
        }
    }

    /// Replicate `data` to the cluster and wait until it is applied to the
    /// local state machine.
    pub async fn propose_replicate(&self, data: Vec<u8>) -> Result<()> {
        if !self.started.load(Ordering::Acquire) {
            return Err(RaftError::Stopped);
        }
        let _guard = self.propwg.token().ok_or(RaftError::Stopped)?;

        let cid = self.id_gen()?.next();
        let payload = bincode::serialize(&Replicate { cid, data })?;
        tracing::debug!("proposing replicate data, change id {cid}");

        let mut entry = Entry::default();
        entry.data = payload.into();
        let msg = self.propose_message(vec![entry])?;

        let mut sub = self.msgbus.subscribe_once(cid);
        let tx = self.ingress_sender(true)?;
        tx.send(msg).await.map_err(|_| RaftError::Stopped)?;

        self.wait_on(&mut sub).await.map(|_| ())
    }

    /// Propose a membership change and wait until it commits.
    ///
    /// `AddNode` also updates an existing member in place; staging members
    /// are promoted through the same path once caught up.
    pub async fn propose_conf_change(
        &self,
        info: &MemberInfo,
        change_type: ConfChangeType,
    ) -> Result<()> {
        if !self.started.load(Ordering::Acquire) {
            return Err(RaftError::Stopped);
        }
        let _guard = self.propwg.token().ok_or(RaftError::Stopped)?;

        let cc = self.make_conf_change(info, change_type)?;
        let id = cc.id;
        tracing::debug!("proposing conf change, change id {id}");

        let mut entry = Entry::default();
        entry.set_entry_type(EntryType::EntryConfChange);
        entry.data = cc.write_to_bytes()?.into();
        let msg = self.propose_message(vec![entry])?;

        let mut sub = self.msgbus.subscribe_once(id);
        let tx = self.ingress_sender(true)?;
        tx.send(msg).await.map_err(|_| RaftError::Stopped)?;

        self.wait_on(&mut sub).await.map(|_| ())
    }

    /// A read barrier: returns once the local state machine has applied
    /// everything committed before this call.
    pub async fn linearizable_read(&self) -> Result<()> {
        if !self.started.load(Ordering::Acquire) {
            return Err(RaftError::Stopped);
        }
        let _guard = self.propwg.token().ok_or(RaftError::Stopped)?;

        let id = self.id_gen()?.next();
        let rctx = id.to_be_bytes().to_vec();
        let mut sub = self.msgbus.subscribe_once(id);
        let tx = self.ingress_sender(false)?;
        let mut shutdown = self.shutdown_rx();

        // Re-issue the read request every few ticks until the leader
        // answers; a request sent while there is no leader vanishes.
        let retry = self.cfg.tick_interval * 5;
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + retry, retry);

        let index = loop {
            let mut entry = Entry::default();
            entry.data = rctx.clone().into();
            let mut msg = Message::default();
            msg.set_msg_type(MessageType::MsgReadIndex);
            msg.set_entries(vec![entry].into());
            tx.send(msg).await.map_err(|_| RaftError::Stopped)?;

            tokio::select! {
                _ = ticker.tick() => continue,
                v = sub.chan() => {
                    let payload = v.map_err(|_| RaftError::Stopped)?;
                    break payload?;
                }
                _ = shutdown.wait_for(|s| *s) => return Err(RaftError::Stopped),
            }
        };

        // Up to date already.
        if index <= self.applied_index.load(Ordering::Acquire) {
            return Ok(());
        }

        let mut sub = self.msgbus.subscribe_once(index);
        if index <= self.applied_index.load(Ordering::Acquire) {
            return Ok(());
        }
        self.wait_on(&mut sub).await.map(|_| ())
    }

    /// Hand leadership to `transferee` and wait until it takes over.
    pub async fn transfer_leadership(&self, transferee: u64) -> Result<()> {
        if !self.started.load(Ordering::Acquire) {
            return Err(RaftError::Stopped);
        }
        let _guard = self.propwg.token().ok_or(RaftError::Stopped)?;

        let lead = self.status()?.leader_id.unwrap_or(0);
        tracing::info!("transferring leadership {lead:x} -> {transferee:x}");

        let mut msg = Message::default();
        msg.set_msg_type(MessageType::MsgTransferLeader);
        msg.from = transferee;
        let tx = self.ingress_sender(false)?;
        tx.send(msg).await.map_err(|_| RaftError::Stopped)?;

        let period = (self.cfg.tick_interval / 10).max(Duration::from_millis(1));
        let mut ticker = tokio::time::interval(period);
        let mut shutdown = self.shutdown_rx();
        loop {
            if self.status()?.leader_id == Some(transferee) {
                return Ok(());
            }
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.wait_for(|s| *s) => return Err(RaftError::Stopped),
            }
        }
    }

    /// Drop the follower's notion of the current leader until the next
    /// heartbeat arrives.
    pub fn forget_leader(&self) -> Result<()> {
        if !self.started.load(Ordering::Acquire) {
            return Err(RaftError::Stopped);
        }
        self.report(Report::ForgetLeader);
        Ok(())
    }

    /// Current view of the node.
    pub fn status(&self) -> Result<RaftStatus> {
        if !self.started.load(Ordering::Acquire) {
            return Err(RaftError::Stopped);
        }
        let rx = self.status_rx.get().ok_or(RaftError::Stopped)?;
        Ok(rx.borrow().clone())
    }

    /// Return the latest snapshot header, rendezvousing with the event loop
    /// when the applied index has moved past the snapshot index.
    pub async fn create_snapshot(&self) -> Result<Snapshot> {
        if !self.started.load(Ordering::Acquire) {
            return Err(RaftError::Stopped);
        }

        let applied = self.applied_index.load(Ordering::Acquire);
        let snap_index = self.snap_index.load(Ordering::Acquire);
        if applied == snap_index {
            return self.storage.snapshot_header();
        }

        let (reply_tx, reply_rx) = oneshot::channel();
        let tx = {
            let chans = self.chans.read();
            chans
                .as_ref()
                .and_then(|ch| ch.snapshot_tx.clone())
                .ok_or(RaftError::Stopped)?
        };
        tx.send(reply_tx).await.map_err(|_| RaftError::Stopped)?;
        reply_rx.await.map_err(|_| RaftError::Stopped)??;

        self.storage.snapshot_header()
    }

    /// Report that `id` did not receive the last send.
    pub fn report_unreachable(&self, id: u64) {
        if !self.started.load(Ordering::Acquire) {
            return;
        }
        self.report(Report::Unreachable(id));
    }

    /// Report the outcome of a snapshot transfer to `id`.
    pub fn report_snapshot(&self, id: u64, status: SnapshotStatus) {
        if !self.started.load(Ordering::Acquire) {
            return;
        }
        self.report(Report::SnapshotStatus(id, status));
    }

    /// Called when this member learns it was removed from the cluster:
    /// drains and shuts down within the configured timeout.
    pub async fn report_shutdown(&self) {
        if !self.started.load(Ordering::Acquire) {
            return;
        }
        tracing::info!("this member was removed from the cluster, shutting down");
        if let Err(e) = self.shutdown(self.cfg.drain_timeout).await {
            tracing::error!("shutdown after removal: {e}");
        }
    }

    // ---- internals shared with the event loop ----

    pub(crate) fn id_gen(&self) -> Result<&IdGenerator> {
        self.idgen.get().ok_or(RaftError::Stopped)
    }

    pub(crate) fn local_info(&self) -> Result<&MemberInfo> {
        self.local.get().ok_or(RaftError::Stopped)
    }

    pub(crate) fn shutdown_rx(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    pub(crate) fn make_conf_change(
        &self,
        info: &MemberInfo,
        change_type: ConfChangeType,
    ) -> Result<ConfChange> {
        let mut cc = ConfChange::default();
        cc.id = self.id_gen()?.next();
        cc.set_change_type(change_type);
        cc.node_id = info.id;
        cc.context = bincode::serialize(info)?.into();
        Ok(cc)
    }

    /// Install a snapshot file: storage first, then the pool roster, then
    /// the application, then the engine indices.
    pub(crate) fn publish_snapshot_file(&self, sf: &SnapshotFile) -> Result<()> {
        self.storage.apply_snapshot(&sf.raw)?;
        self.pool.restore(sf.members.clone());
        self.fsm.restore(&sf.data).map_err(|e| match e {
            RaftError::Restore(_) => e,
            other => RaftError::Restore(other.to_string()),
        })?;

        let meta = sf.raw.get_metadata();
        *self.conf_state.lock() = meta.get_conf_state().clone();
        self.snap_index.store(meta.index, Ordering::Release);
        self.applied_index.store(meta.index, Ordering::Release);
        Ok(())
    }

    fn propose_message(&self, entries: Vec<Entry>) -> Result<Message> {
        let local = self.local_info()?;
        let mut msg = Message::default();
        msg.set_msg_type(MessageType::MsgPropose);
        msg.from = local.id;
        msg.to = local.id;
        msg.set_entries(entries.into());
        Ok(msg)
    }

    fn ingress_sender(&self, proposal: bool) -> Result<mpsc::Sender<Message>> {
        let chans = self.chans.read();
        let ch = chans.as_ref().ok_or(RaftError::Stopped)?;
        let tx = if proposal {
            ch.propose_tx.as_ref()
        } else {
            ch.msg_tx.as_ref()
        };
        tx.cloned().ok_or(RaftError::Stopped)
    }

    fn report(&self, report: Report) {
        let tx = {
            let chans = self.chans.read();
            chans.as_ref().map(|ch| ch.report_tx.clone())
        };
        if let Some(tx) = tx {
            let _ = tx.try_send(report);
        }
    }

    /// Wait until the id behind `sub` resolves, the waiter is cancelled by
    /// its caller (future drop), or the engine stops.
    async fn wait_on(&self, sub: &mut Subscription) -> Result<u64> {
        let mut shutdown = self.shutdown_rx();
        tokio::select! {
            v = sub.chan() => v.map_err(|_| RaftError::Stopped)?,
            _ = shutdown.wait_for(|s| *s) => Err(RaftError::Stopped),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state_machine::KvStateMachine;
    use crate::storage::SledStorage;
    use crate::transport::LocalNetwork;
    use tempfile::TempDir;

    fn test_engine() -> (Arc<Engine>, TempDir) {
        let dir = TempDir::new().unwrap();
        let storage = Arc::new(SledStorage::open(dir.path(), 3).unwrap());
        let pool = Pool::new(Arc::new(LocalNetwork::new()));
        let engine = Engine::new(
            Config::default(),
            Arc::new(KvStateMachine::new()),
            storage,
            pool,
        );
        (engine, dir)
    }

    /// Wire ingress channels without running the event loop, so queue
    /// behavior is observable in isolation.
    fn install_channels(engine: &Arc<Engine>, capacity: usize) -> mpsc::Receiver<Report> {
        let (propose_tx, propose_rx) = mpsc::channel(capacity);
        let (msg_tx, msg_rx) = mpsc::channel(capacity);
        let (snapshot_tx, snapshot_rx) = mpsc::channel(1);
        let (report_tx, report_rx) = mpsc::channel(16);
        std::mem::forget((propose_rx, msg_rx, snapshot_rx));
        *engine.chans.write() = Some(Channels {
            propose_tx: Some(propose_tx),
            msg_tx: Some(msg_tx),
            snapshot_tx: Some(snapshot_tx),
            report_tx,
        });
        engine.started.store(true, Ordering::Release);
        report_rx
    }

    #[tokio::test]
    async fn operations_fail_before_start() {
        let (engine, _dir) = test_engine();
        assert!(matches!(
            engine.push(Message::default()),
            Err(RaftError::Stopped)
        ));
        assert!(matches!(
            engine.propose_replicate(vec![1]).await,
            Err(RaftError::Stopped)
        ));
        assert!(matches!(engine.status(), Err(RaftError::Stopped)));
        assert!(matches!(
            engine.shutdown(Duration::from_millis(10)).await,
            Err(RaftError::Stopped)
        ));
    }

    #[tokio::test]
    async fn push_routes_by_message_type_and_reports_backpressure() {
        let (engine, _dir) = test_engine();
        let _reports = install_channels(&engine, 2);

        let mut prop = Message::default();
        prop.set_msg_type(MessageType::MsgPropose);
        let mut beat = Message::default();
        beat.set_msg_type(MessageType::MsgHeartbeat);

        // Each queue holds `capacity` messages before refusing.
        engine.push(prop.clone()).unwrap();
        engine.push(prop.clone()).unwrap();
        assert!(matches!(
            engine.push(prop.clone()),
            Err(RaftError::BufferFull)
        ));

        // The other queue is unaffected.
        engine.push(beat.clone()).unwrap();
        engine.push(beat.clone()).unwrap();
        assert!(matches!(engine.push(beat), Err(RaftError::BufferFull)));
    }

    #[tokio::test]
    async fn reports_reach_the_loop_channel() {
        let (engine, _dir) = test_engine();
        let mut reports = install_channels(&engine, 4);

        engine.report_unreachable(7);
        engine.report_snapshot(7, SnapshotStatus::Failure);
        engine.forget_leader().unwrap();

        assert!(matches!(
            reports.recv().await.unwrap(),
            Report::Unreachable(7)
        ));
        assert!(matches!(
            reports.recv().await.unwrap(),
            Report::SnapshotStatus(7, SnapshotStatus::Failure)
        ));
        assert!(matches!(reports.recv().await.unwrap(), Report::ForgetLeader));
    }
}
