//! Start-time operators.
//!
//! `Engine::start` runs a chain of operators over a shared [`OperatorState`]
//! in two phases: every `before` in order (validation, storage boot), then
//! every `after` in order (seeding, node construction, state restore).
//! Callers pick how the node comes up — [`InitCluster`], [`Join`],
//! [`Restart`], or [`Fallback`] combining two of them — and the engine
//! appends its own required operators at the end of the chain.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use protobuf::Message as PbMessage;
use raft::eraftpb::{ConfChange, ConfChangeType, ConfState, Entry, EntryType, HardState};
use raft::RawNode;
use slog::o;

use crate::error::{RaftError, Result};
use crate::storage::{BootInfo, SharedStorage};
use crate::types::{MemberInfo, MemberKind};

use super::Engine;

/// Shared state threaded through the operator chain.
pub struct OperatorState {
    pub(crate) eng: Arc<Engine>,
    pub(crate) addr: String,
    pub(crate) local: Option<MemberInfo>,
    pub(crate) members: Vec<MemberInfo>,
    pub(crate) boot: Option<BootInfo>,
    pub(crate) node: Option<RawNode<SharedStorage>>,
    pub(crate) campaign: bool,
}

impl std::fmt::Debug for OperatorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperatorState")
            .field("addr", &self.addr)
            .field("local", &self.local)
            .field("members", &self.members)
            .field("boot", &self.boot)
            .field("node", &self.node.is_some())
            .field("campaign", &self.campaign)
            .finish()
    }
}

/// A bootstrap step.
pub trait Operator: Send {
    /// Validation phase, runs before any `after`.
    fn before(&mut self, ost: &mut OperatorState) -> Result<()>;
    /// Execution phase.
    fn after(&mut self, ost: &mut OperatorState) -> Result<()>;
}

/// Bootstrap a brand-new cluster with this node and the given peers.
///
/// Fails when the storage already holds state; combine with [`Restart`]
/// through [`Fallback`] for restart-or-init behavior.
pub struct InitCluster {
    /// Other founding members. The local member is added implicitly as a
    /// voter.
    pub peers: Vec<MemberInfo>,
}

/// Boot as a blank node waiting to be adopted into an existing cluster via
/// a conf change proposed on a current member.
///
/// `peers` are the cluster members known at join time (out-of-band
/// discovery); they are registered in the pool so the node can answer the
/// leader before the replicated log teaches it the membership.
pub struct Join {
    pub peers: Vec<MemberInfo>,
}

/// Recover a previously started node from its storage.
pub struct Restart;

/// Run `primary` if its validation passes, otherwise `secondary`.
pub struct Fallback {
    primary: Box<dyn Operator>,
    secondary: Box<dyn Operator>,
    chosen: Option<Choice>,
}

enum Choice {
    Primary,
    Secondary,
}

impl Fallback {
    pub fn new(primary: impl Operator + 'static, secondary: impl Operator + 'static) -> Self {
        Self {
            primary: Box::new(primary),
            secondary: Box::new(secondary),
            chosen: None,
        }
    }
}

impl Operator for InitCluster {
    fn before(&mut self, ost: &mut OperatorState) -> Result<()> {
        if ost.eng.storage.exist() {
            return Err(RaftError::Storage(
                "cluster already exists, restart it instead".into(),
            ));
        }
        Ok(())
    }

    fn after(&mut self, ost: &mut OperatorState) -> Result<()> {
        let local = ost.local.clone().ok_or(RaftError::NotInitialized)?;

        let mut members = vec![local.clone()];
        members.extend(self.peers.iter().filter(|p| p.id != local.id).cloned());
        // Founding members boot with identical logs, so the bootstrap
        // entries below must come out in the same order on every node.
        members.sort_by_key(|m| m.id);

        // The founding roster is written both as the initial conf state
        // (raft is operational immediately) and as committed conf-change
        // entries, so members that join later replay who everyone is.
        let mut cs = ConfState::default();
        let mut entries = Vec::new();
        for member in &members {
            let change_type = match member.kind {
                MemberKind::Voter => {
                    cs.voters.push(member.id);
                    ConfChangeType::AddNode
                }
                MemberKind::Staging | MemberKind::Learner => {
                    cs.learners.push(member.id);
                    ConfChangeType::AddLearnerNode
                }
                MemberKind::Removed => continue,
            };

            let mut cc = ConfChange::default();
            cc.set_change_type(change_type);
            cc.node_id = member.id;
            cc.context = bincode::serialize(member)?.into();

            let mut entry = Entry::default();
            entry.set_entry_type(EntryType::EntryConfChange);
            entry.index = entries.len() as u64 + 1;
            entry.term = 1;
            entry.data = cc.write_to_bytes()?.into();
            entries.push(entry);
        }

        ost.eng.storage.initialize_with_conf_state(&cs)?;

        let mut hs = HardState::default();
        hs.term = 1;
        hs.commit = entries.len() as u64;
        ost.eng.storage.save_entries(Some(&hs), &entries)?;

        // A sole founding voter elects itself right away.
        ost.campaign = cs.voters == [local.id];
        ost.members = members;
        Ok(())
    }
}

impl Operator for Join {
    fn before(&mut self, ost: &mut OperatorState) -> Result<()> {
        if ost.eng.storage.exist() {
            return Err(RaftError::Storage(
                "storage already holds state, restart it instead".into(),
            ));
        }
        Ok(())
    }

    fn after(&mut self, ost: &mut OperatorState) -> Result<()> {
        // No configuration is seeded; raft learns the membership from the
        // cluster through a snapshot or replicated conf changes. The known
        // peers only prime the pool for outbound replies.
        let local_id = ost.local.as_ref().map(|l| l.id).unwrap_or(0);
        ost.members = self
            .peers
            .iter()
            .filter(|p| p.id != local_id)
            .cloned()
            .collect();
        Ok(())
    }
}

impl Operator for Restart {
    fn before(&mut self, ost: &mut OperatorState) -> Result<()> {
        if !ost.eng.storage.exist() {
            return Err(RaftError::Storage(
                "no existing state to restart from".into(),
            ));
        }
        Ok(())
    }

    fn after(&mut self, _ost: &mut OperatorState) -> Result<()> {
        Ok(())
    }
}

impl Operator for Fallback {
    fn before(&mut self, ost: &mut OperatorState) -> Result<()> {
        match self.primary.before(ost) {
            Ok(()) => {
                self.chosen = Some(Choice::Primary);
                Ok(())
            }
            Err(primary_err) => match self.secondary.before(ost) {
                Ok(()) => {
                    self.chosen = Some(Choice::Secondary);
                    Ok(())
                }
                Err(secondary_err) => Err(RaftError::Storage(format!(
                    "no fallback applies: {primary_err}; {secondary_err}"
                ))),
            },
        }
    }

    fn after(&mut self, ost: &mut OperatorState) -> Result<()> {
        match self.chosen {
            Some(Choice::Primary) => self.primary.after(ost),
            Some(Choice::Secondary) => self.secondary.after(ost),
            None => Err(RaftError::NotInitialized),
        }
    }
}

/// Implicit: discovers the local identity and boots storage, then builds
/// the protocol node over the recovered state.
struct Setup;

/// Implicit: restores the newest snapshot file into the application and the
/// pool, seeding the applied and snapshot indices.
struct StateSetup;

/// Implicit: registers boot members into the pool, tombstones first so a
/// removed member never comes back through a stale record.
struct RemovedMembers;

impl Operator for Setup {
    fn before(&mut self, ost: &mut OperatorState) -> Result<()> {
        let existing = ost.eng.storage.exist();

        let id = match ost.eng.cfg.id {
            0 => derive_id(&ost.addr),
            id => id,
        };
        let mut local = MemberInfo::voter(id, ost.addr.clone());

        let meta = bincode::serialize(&local)?;
        let boot = ost.eng.storage.boot(&meta)?;

        if existing {
            match bincode::deserialize::<MemberInfo>(&boot.meta) {
                Ok(mut stored) => {
                    // The member keeps its identity across restarts; only
                    // the address may move.
                    stored.address = ost.addr.clone();
                    local = stored;
                }
                Err(e) => {
                    return Err(RaftError::Storage(format!(
                        "boot metadata is not a member record: {e}"
                    )))
                }
            }
        }

        ost.eng.pool.set_local_id(local.id);
        ost.local = Some(local);
        ost.boot = Some(boot);
        Ok(())
    }

    fn after(&mut self, ost: &mut OperatorState) -> Result<()> {
        let local = ost.local.as_ref().ok_or(RaftError::NotInitialized)?;
        let applied = ost
            .boot
            .as_ref()
            .and_then(|b| b.snapshot.as_ref())
            .map(|s| s.index())
            .unwrap_or(0);

        let raft_config = ost.eng.cfg.to_raft_config(local.id, applied);
        let logger = slog::Logger::root(slog::Discard, o!());
        let node = RawNode::new(
            &raft_config,
            SharedStorage(Arc::clone(&ost.eng.storage)),
            &logger,
        )
        .map_err(|e| RaftError::Protocol(e.to_string()))?;
        ost.node = Some(node);

        let cs = ost.eng.storage.initial_state()?.conf_state;
        *ost.eng.conf_state.lock() = cs;
        Ok(())
    }
}

impl Operator for StateSetup {
    fn before(&mut self, _ost: &mut OperatorState) -> Result<()> {
        Ok(())
    }

    fn after(&mut self, ost: &mut OperatorState) -> Result<()> {
        let Some(boot) = ost.boot.as_ref() else {
            return Ok(());
        };
        if let Some(snapshot) = boot.snapshot.as_ref() {
            tracing::info!(
                "restoring from snapshot at index {} (term {})",
                snapshot.index(),
                snapshot.term()
            );
            ost.eng.publish_snapshot_file(snapshot)?;
        }
        Ok(())
    }
}

impl Operator for RemovedMembers {
    fn before(&mut self, _ost: &mut OperatorState) -> Result<()> {
        Ok(())
    }

    fn after(&mut self, ost: &mut OperatorState) -> Result<()> {
        let local = ost.local.clone().ok_or(RaftError::NotInitialized)?;
        let mut roster = ost.members.clone();
        if !roster.iter().any(|m| m.id == local.id) {
            roster.push(local);
        }

        roster.sort_by_key(|m| m.kind != MemberKind::Removed);
        for info in roster {
            if let Err(e) = ost.eng.pool.add(info) {
                tracing::warn!("registering boot member: {e}");
            }
        }
        Ok(())
    }
}

/// Run the chain: caller operators first, then the engine's own.
pub(crate) fn invoke(
    eng: &Arc<Engine>,
    addr: &str,
    mut operators: Vec<Box<dyn Operator>>,
) -> Result<OperatorState> {
    operators.push(Box::new(Setup));
    operators.push(Box::new(StateSetup));
    operators.push(Box::new(RemovedMembers));

    let mut ost = OperatorState {
        eng: Arc::clone(eng),
        addr: addr.to_string(),
        local: None,
        members: Vec::new(),
        boot: None,
        node: None,
        campaign: false,
    };

    for op in operators.iter_mut() {
        op.before(&mut ost)?;
    }
    for op in operators.iter_mut() {
        op.after(&mut ost)?;
    }
    Ok(ost)
}

fn derive_id(addr: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    addr.hash(&mut hasher);
    hasher.finish().max(1)
}
