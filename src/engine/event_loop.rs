//! The event loop: single owner of the protocol core.
//!
//! One task holds the `RawNode` and serializes every protocol-state
//! mutation: ticks, stepping ingress messages, ready processing, reports.
//! Nothing else in the process touches the core, so no lock guards it.
//!
//! Ready processing is strictly ordered. Entries and hard state are durable
//! before any commit is applied or any waiter is woken, and a follower's
//! outbound messages leave only after that write. A leader overlaps its
//! outbound replication with its own disk write: the majority-ack rule only
//! needs the entries durable somewhere, and the network dominates latency.

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use protobuf::Message as PbMessage;
use raft::eraftpb::{
    ConfChange, ConfChangeType, Entry, EntryType, HardState, Message, MessageType, Snapshot,
};
use raft::{RawNode, SnapshotStatus, StateRole};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::MissedTickBehavior;

use crate::error::{RaftError, Result};
use crate::msgbus::Payload;
use crate::storage::{SharedStorage, SnapshotFile};
use crate::types::{MemberInfo, MemberKind, NodeRole, PeerProgress, RaftStatus, Replicate};
use crate::waitgroup::WaitToken;

use super::{Engine, Report};

pub(crate) struct EventLoop {
    eng: Arc<Engine>,
    raw: RawNode<SharedStorage>,
    propose_rx: mpsc::Receiver<Message>,
    msg_rx: mpsc::Receiver<Message>,
    snapshot_rx: mpsc::Receiver<oneshot::Sender<Result<()>>>,
    report_rx: mpsc::Receiver<Report>,
    status_tx: watch::Sender<RaftStatus>,
    last_hard_state: HardState,
    campaign: bool,
    is_leader: bool,
}

impl EventLoop {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        eng: Arc<Engine>,
        raw: RawNode<SharedStorage>,
        propose_rx: mpsc::Receiver<Message>,
        msg_rx: mpsc::Receiver<Message>,
        snapshot_rx: mpsc::Receiver<oneshot::Sender<Result<()>>>,
        report_rx: mpsc::Receiver<Report>,
        status_tx: watch::Sender<RaftStatus>,
        last_hard_state: HardState,
        campaign: bool,
    ) -> Self {
        Self {
            eng,
            raw,
            propose_rx,
            msg_rx,
            snapshot_rx,
            report_rx,
            status_tx,
            last_hard_state,
            campaign,
            is_leader: false,
        }
    }

    pub(crate) async fn run(mut self) -> Result<()> {
        let _loop_token = self.eng.wg.token();
        let mut propose_token = self.eng.processwg.token();
        let mut msg_token = self.eng.processwg.token();
        let mut propose_open = true;
        let mut msg_open = true;

        if self.campaign {
            if let Err(e) = self.raw.campaign() {
                tracing::warn!("campaigning as founding voter: {e}");
            }
        }

        let mut ticker = tokio::time::interval(self.eng.cfg.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut shutdown = self.eng.shutdown_rx();

        let failure = loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.raw.tick();
                }
                m = self.propose_rx.recv(), if propose_open => match m {
                    Some(m) => self.step_batched(m),
                    None => {
                        propose_open = false;
                        propose_token.take();
                    }
                },
                m = self.msg_rx.recv(), if msg_open => match m {
                    Some(m) => self.step_batched(m),
                    None => {
                        msg_open = false;
                        msg_token.take();
                    }
                },
                r = self.report_rx.recv() => {
                    if let Some(report) = r {
                        self.handle_report(report);
                    }
                }
                c = self.snapshot_rx.recv() => {
                    // Best effort: the ready path drives real snapshot work.
                    if let Some(reply) = c {
                        let _ = reply.send(Ok(()));
                    }
                }
                _ = shutdown.wait_for(|s| *s) => break None,
            }

            if self.raw.has_ready() {
                if let Err(e) = self.on_ready().await {
                    tracing::error!("event loop terminating: {e}");
                    break Some(e);
                }
            }
            self.publish_status();
        };

        match failure {
            Some(e) => Err(e),
            None => Err(RaftError::Stopped),
        }
    }

    /// Step the received message plus anything else already buffered.
    fn step_batched(&mut self, first: Message) {
        self.step(first);
        while let Ok(m) = self.propose_rx.try_recv() {
            self.step(m);
        }
        while let Ok(m) = self.msg_rx.try_recv() {
            self.step(m);
        }
    }

    fn step(&mut self, m: Message) {
        let waiting = self.local_proposal_ids(&m);
        if let Err(e) = self.raw.step(m) {
            tracing::warn!("processing raft message: {e}");
            // Fail the waiters behind a rejected local proposal instead of
            // leaving them to a timeout.
            for id in waiting {
                self.eng
                    .msgbus
                    .broadcast(id, Err(RaftError::Protocol(e.to_string())));
            }
        }
    }

    /// Change ids carried by a proposal that originated on this node.
    fn local_proposal_ids(&self, m: &Message) -> Vec<u64> {
        let local = self.eng.local.get().map(|l| l.id).unwrap_or(0);
        if m.get_msg_type() != MessageType::MsgPropose || m.from != local {
            return Vec::new();
        }

        let mut ids = Vec::new();
        for entry in m.get_entries() {
            match entry.get_entry_type() {
                EntryType::EntryNormal if !entry.data.is_empty() => {
                    if let Ok(r) = bincode::deserialize::<Replicate>(&entry.data) {
                        ids.push(r.cid);
                    }
                }
                EntryType::EntryConfChange => {
                    let mut cc = ConfChange::default();
                    if cc.merge_from_bytes(&entry.data).is_ok() {
                        ids.push(cc.id);
                    }
                }
                _ => {}
            }
        }
        ids
    }

    fn handle_report(&mut self, report: Report) {
        match report {
            Report::Unreachable(id) => self.raw.report_unreachable(id),
            Report::SnapshotStatus(id, status) => self.raw.report_snapshot(id, status),
            Report::ForgetLeader => {
                if self.raw.raft.state != StateRole::Leader {
                    self.raw.raft.leader_id = raft::INVALID_ID;
                }
            }
        }
    }

    async fn on_ready(&mut self) -> Result<()> {
        let mut ready = self.raw.ready();
        let prev_applied = self.eng.applied_index.load(Ordering::Acquire);

        if let Some(ss) = ready.ss() {
            self.is_leader = ss.raft_state == StateRole::Leader;
            if ss.leader_id == raft::INVALID_ID {
                self.eng.msgbus.broadcast_err_to_all(RaftError::NoLeader);
            }
            if let Some(statec) = &self.eng.cfg.state_change {
                let _ = statec.send(NodeRole::from(ss.raft_state));
            }
        }

        // Leader: replication overlaps the local disk write. Follower:
        // nothing leaves until the write below completes.
        let mut inflight = None;
        let mut held = Vec::new();
        if !ready.messages().is_empty() {
            let msgs = ready.take_messages();
            if self.is_leader {
                let eng = Arc::clone(&self.eng);
                inflight = Some(tokio::spawn(async move { eng.send_messages(msgs).await }));
            } else {
                held = msgs;
            }
        }

        let hs = ready.hs().cloned();
        if let Some(hs) = &hs {
            self.last_hard_state = hs.clone();
        }
        self.eng.storage.save_entries(hs.as_ref(), ready.entries())?;

        let snapshot = ready.snapshot().clone();
        self.publish_snapshot(&snapshot)?;

        self.publish_committed(ready.take_committed_entries());
        self.publish_read_states(ready.take_read_states());
        self.publish_applied_indices(prev_applied, self.eng.applied_index.load(Ordering::Acquire));
        self.promotions();
        self.eng.maybe_create_snapshot();

        if !held.is_empty() {
            self.eng.send_messages(held).await;
        }
        let persisted = ready.take_persisted_messages();
        if !persisted.is_empty() {
            self.eng.send_messages(persisted).await;
        }
        if let Some(handle) = inflight {
            let _ = handle.await;
        }

        let mut light = self.raw.advance(ready);
        if let Some(commit) = light.commit_index() {
            self.last_hard_state.commit = commit;
            let hs = self.last_hard_state.clone();
            self.eng.storage.save_entries(Some(&hs), &[])?;
        }
        let prev = self.eng.applied_index.load(Ordering::Acquire);
        let msgs = light.take_messages();
        if !msgs.is_empty() {
            self.eng.send_messages(msgs).await;
        }
        self.publish_committed(light.take_committed_entries());
        self.publish_applied_indices(prev, self.eng.applied_index.load(Ordering::Acquire));
        self.raw.advance_apply();
        Ok(())
    }

    fn publish_snapshot(&mut self, snap: &Snapshot) -> Result<()> {
        if *snap == Snapshot::default() {
            return Ok(());
        }

        let index = snap.get_metadata().index;
        let applied = self.eng.applied_index.load(Ordering::Acquire);
        if index <= applied {
            return Err(RaftError::Storage(format!(
                "snapshot index {index} must be greater than applied index {applied}"
            )));
        }

        let file = SnapshotFile::decode(snap.get_data())?;
        self.eng.storage.snapshotter().write(&file)?;
        self.eng.storage.save_snapshot(snap)?;
        self.eng.publish_snapshot_file(&file)?;
        tracing::info!("installed snapshot at index {index}");
        Ok(())
    }

    fn publish_committed(&mut self, entries: Vec<Entry>) {
        for entry in entries {
            match entry.get_entry_type() {
                EntryType::EntryNormal if !entry.data.is_empty() => {
                    self.publish_replicate(&entry)
                }
                EntryType::EntryConfChange => self.publish_conf_change(&entry),
                _ => {}
            }
            self.eng.applied_index.store(entry.index, Ordering::Release);
        }
    }

    fn publish_replicate(&self, entry: &Entry) {
        let r: Replicate = match bincode::deserialize(&entry.data) {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!("decoding replicate entry {}: {e}", entry.index);
                return;
            }
        };
        tracing::debug!("publishing replicate data, change id {}", r.cid);

        let result: Payload = match self.eng.fsm.apply(&r.data) {
            Ok(()) => Ok(0),
            Err(e) => {
                tracing::warn!("publishing replicate data: {e}");
                Err(match e {
                    RaftError::Apply(_) => e,
                    other => RaftError::Apply(other.to_string()),
                })
            }
        };
        self.eng.msgbus.broadcast(r.cid, result);
    }

    fn publish_conf_change(&mut self, entry: &Entry) {
        let mut cc = ConfChange::default();
        if let Err(e) = cc.merge_from_bytes(&entry.data) {
            tracing::warn!("decoding conf change entry {}: {e}", entry.index);
            return;
        }
        tracing::debug!("publishing conf change, change id {}", cc.id);

        let mut result: Result<()> = Ok(());

        if !cc.context.is_empty() {
            match bincode::deserialize::<MemberInfo>(&cc.context) {
                Ok(info) => match cc.get_change_type() {
                    ConfChangeType::AddNode | ConfChangeType::AddLearnerNode => {
                        result = self.eng.pool.add(info);
                    }
                    ConfChangeType::RemoveNode => self.schedule_removal(info),
                },
                Err(e) => result = Err(RaftError::Serialization(e.to_string())),
            }
        }

        match self.raw.apply_conf_change(&cc) {
            Ok(cs) => *self.eng.conf_state.lock() = cs,
            Err(e) => {
                if result.is_ok() {
                    result = Err(e.into());
                }
            }
        }

        if let Err(e) = &result {
            tracing::warn!("publishing conf change: {e}");
        }
        self.eng.msgbus.broadcast(cc.id, result.map(|()| 0));
    }

    /// Removal waits two ticks so the outgoing member receives its commit
    /// ack before the connection goes away.
    fn schedule_removal(&self, info: MemberInfo) {
        let delay = self.eng.cfg.tick_interval * 2;
        let eng = Arc::clone(&self.eng);
        let token: Option<WaitToken> = self.eng.wg.token();
        let mut shutdown = self.eng.shutdown_rx();
        tokio::spawn(async move {
            let _token = token;
            tokio::select! {
                _ = tokio::time::sleep(delay) => {
                    if let Err(e) = eng.pool.remove(info.id) {
                        tracing::error!("removing member {:x}: {e}", info.id);
                    }
                }
                _ = shutdown.wait_for(|s| *s) => {}
            }
        });
    }

    fn publish_read_states(&self, states: Vec<raft::ReadState>) {
        for rs in states {
            let Ok(buf) = <[u8; 8]>::try_from(rs.request_ctx.as_slice()) else {
                continue;
            };
            self.eng
                .msgbus
                .broadcast(u64::from_be_bytes(buf), Ok(rs.index));
        }
    }

    fn publish_applied_indices(&self, prev: u64, curr: u64) {
        for index in prev + 1..=curr {
            self.eng.msgbus.broadcast(index, Ok(index));
        }
    }

    /// Propose promotion for staging members whose log has caught up with
    /// the leader's.
    fn promotions(&mut self) {
        if self.raw.raft.state != StateRole::Leader {
            return;
        }

        let leader_match = self
            .raw
            .raft
            .prs()
            .get(self.raw.raft.id)
            .map(|pr| pr.matched)
            .unwrap_or(0);

        let mut voters = 0usize;
        let mut reachable = 0usize;
        let mut promotions = Vec::new();

        for member in self.eng.pool.members() {
            let mut info = member.raw();
            if info.kind == MemberKind::Voter {
                voters += 1;
                if member.is_active() {
                    reachable += 1;
                }
            }
            if info.kind != MemberKind::Staging {
                continue;
            }

            let staging_match = self
                .raw
                .raft
                .prs()
                .get(info.id)
                .map(|pr| pr.matched)
                .unwrap_or(0);

            // Not caught up with the leader yet.
            if (staging_match as f64) < leader_match as f64 * 0.9 {
                continue;
            }

            info.kind = MemberKind::Voter;
            promotions.push(info);
        }

        // Quorum lost: no promotion could commit anyway.
        if reachable < voters / 2 + 1 {
            return;
        }

        for info in promotions {
            tracing::info!("promoting staging member {:x}", info.id);
            let proposed = self
                .eng
                .make_conf_change(&info, ConfChangeType::AddNode)
                .and_then(|cc| {
                    self.raw
                        .propose_conf_change(Vec::new(), cc)
                        .map_err(RaftError::from)
                });
            if let Err(e) = proposed {
                tracing::warn!("promoting staging member {:x}: {e}", info.id);
            }
        }
    }

    fn publish_status(&mut self) {
        let raft = &self.raw.raft;
        let mut progress = HashMap::new();
        if raft.state == StateRole::Leader {
            for member in self.eng.pool.members() {
                if let Some(pr) = raft.prs().get(member.id()) {
                    progress.insert(member.id(), PeerProgress { matched: pr.matched });
                }
            }
        }

        let status = RaftStatus {
            id: raft.id,
            term: raft.term,
            leader_id: (raft.leader_id != raft::INVALID_ID).then_some(raft.leader_id),
            role: raft.state.into(),
            applied_index: self.eng.applied_index.load(Ordering::Acquire),
            snapshot_index: self.eng.snap_index.load(Ordering::Acquire),
            progress,
        };
        self.status_tx.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });
    }
}

impl Engine {
    /// Route a batch of outbound messages: local ones re-enter the ingress
    /// queue, the rest go to pool members.
    pub(crate) async fn send_messages(self: &Arc<Self>, msgs: Vec<Message>) {
        for msg in msgs {
            self.send_message(msg).await;
        }
    }

    async fn send_message(self: &Arc<Self>, msg: Message) {
        let Ok(local) = self.local_info() else {
            return;
        };

        if msg.to == local.id {
            if let Err(e) = self.push(msg) {
                tracing::warn!("stepping local message: {e}");
            }
            return;
        }

        let Some(member) = self.pool.get(msg.to) else {
            tracing::warn!("sending message to unknown member {:x}", msg.to);
            return;
        };

        if self.maybe_force_snapshot(&msg) {
            return;
        }

        let (kind, to) = (msg.get_msg_type(), msg.to);
        if let Err(e) = member.send(msg).await {
            tracing::warn!("sending {kind:?} to member {to:x}: {e}");
        }
    }

    /// A snapshot aimed at a member outside its own conf state can never be
    /// applied there; rebuild a fresh one and fail this transfer so the
    /// core retries with it.
    fn maybe_force_snapshot(self: &Arc<Self>, msg: &Message) -> bool {
        if msg.get_msg_type() != MessageType::MsgSnapshot {
            return false;
        }

        let cs = msg.get_snapshot().get_metadata().get_conf_state();
        // LearnersNext is always a subset of VotersOutgoing.
        let known = [&cs.voters, &cs.learners, &cs.voters_outgoing]
            .iter()
            .any(|set| set.contains(&msg.to));
        if known {
            return false;
        }

        tracing::debug!(
            "member {:x} is outside the snapshot conf state, forcing a new snapshot",
            msg.to
        );
        if let Err(e) = self.create_snapshot_now() {
            if !matches!(
                e,
                RaftError::AlreadySnapshotting | RaftError::FailedPrecondition
            ) {
                tracing::warn!("forcing new snapshot: {e}");
            }
        }
        self.report_snapshot(msg.to, SnapshotStatus::Failure);
        true
    }
}
