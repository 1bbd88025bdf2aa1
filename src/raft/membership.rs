use super::{Content, FollowerStates, Index, LogCommand, MemberId, MemberSet, Role, NO_INDEX};
use crate::encoding;
use crate::error::{Error, Result};
use crate::storage::StateStorage;

use itertools::Itertools as _;
use log::{info, warn};
use serde::{Deserialize, Serialize};

/// A membership configuration and the log index it was appended at.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MembershipEntry {
    pub log_index: Index,
    pub members: MemberSet,
}

/// The durable membership state: the last committed configuration and, if
/// any, an appended configuration that isn't committed yet. The ordinal is
/// bumped on every change.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MembershipState {
    committed: Option<MembershipEntry>,
    appended: Option<MembershipEntry>,
    ordinal: u64,
}

impl encoding::Value for MembershipState {}

impl MembershipState {
    /// Creates a state with the given initial members, as if committed before
    /// the first log entry.
    pub fn bootstrap(members: MemberSet) -> Self {
        Self { committed: Some(MembershipEntry { log_index: NO_INDEX, members }), appended: None, ordinal: 1 }
    }

    pub fn committed(&self) -> Option<&MembershipEntry> {
        self.committed.as_ref()
    }

    pub fn appended(&self) -> Option<&MembershipEntry> {
        self.appended.as_ref()
    }

    pub fn ordinal(&self) -> u64 {
        self.ordinal
    }

    /// Returns the committed members.
    pub fn committed_members(&self) -> MemberSet {
        self.committed.as_ref().map(|e| e.members.clone()).unwrap_or_default()
    }

    /// Returns the latest members, appended or committed.
    pub fn latest(&self) -> MemberSet {
        self.appended.as_ref().or(self.committed.as_ref()).map(|e| e.members.clone()).unwrap_or_default()
    }

    /// Returns true if there's an appended configuration that isn't committed.
    pub fn uncommitted_member_change_in_log(&self) -> bool {
        self.appended.is_some()
    }

    /// Records a configuration appended at the given index. Returns false if
    /// it was already known. A leader only appends a change once the previous
    /// one committed, so an uncommitted entry followed by another one must
    /// have been committed.
    pub fn append(&mut self, log_index: Index, members: MemberSet) -> bool {
        let latest_index = self.appended.as_ref().or(self.committed.as_ref()).map(|e| e.log_index);
        if latest_index.is_some_and(|index| log_index <= index) {
            return false;
        }
        if let Some(appended) = self.appended.take() {
            warn!("Membership change at {} follows uncommitted change at {}", log_index, appended.log_index);
            self.committed = Some(appended);
        }
        self.appended = Some(MembershipEntry { log_index, members });
        self.ordinal += 1;
        true
    }

    /// Handles a log truncation from the given index. Returns true if the
    /// appended configuration was truncated away. Truncating a committed
    /// configuration is an error.
    pub fn truncate(&mut self, from_index: Index) -> Result<bool> {
        if self.committed.as_ref().is_some_and(|c| c.log_index >= from_index && c.log_index > NO_INDEX) {
            return Err(Error::Internal(format!(
                "Can't truncate committed membership entry at {} from {}",
                self.committed.as_ref().map_or(NO_INDEX, |c| c.log_index),
                from_index
            )));
        }
        if self.appended.as_ref().is_some_and(|a| a.log_index >= from_index) {
            self.appended = None;
            self.ordinal += 1;
            return Ok(true);
        }
        Ok(false)
    }

    /// Commits the appended configuration if the commit index has reached it.
    pub fn commit(&mut self, commit_index: Index) -> bool {
        match self.appended.take() {
            Some(appended) if appended.log_index <= commit_index => {
                self.committed = Some(appended);
                self.ordinal += 1;
                true
            }
            appended => {
                self.appended = appended;
                false
            }
        }
    }
}

/// Tracks the cluster membership as recorded in the log, and drives
/// membership changes towards a target member set while leader.
///
/// Configurations take effect as they commit: the voters are the committed
/// configuration, while replication also covers an appended configuration,
/// so a member being removed keeps receiving entries until its removal
/// commits. Learners are target members that aren't voting yet. The leader
/// replicates to them, and once a learner has caught up to the commit index
/// it is added as a voter. Voters that aren't in the target set are removed,
/// but never the local member. Only one change is in flight at a time.
pub struct MembershipManager {
    me: MemberId,
    state: MembershipState,
    storage: Box<dyn StateStorage<MembershipState>>,
    target: MemberSet,
    learners: MemberSet,
}

impl MembershipManager {
    /// Creates a membership manager, loading the state from storage.
    pub fn new(me: MemberId, mut storage: Box<dyn StateStorage<MembershipState>>) -> Result<Self> {
        let state = storage.initial_state()?;
        Ok(Self { me, state, storage, target: MemberSet::new(), learners: MemberSet::new() })
    }

    /// The voting members: the committed configuration.
    pub fn voting_members(&self) -> MemberSet {
        self.state.committed_members()
    }

    /// The members to replicate to: the committed and appended
    /// configurations, and any learners.
    pub fn replication_members(&self) -> MemberSet {
        let mut members = self.state.latest();
        members.extend(self.voting_members());
        members.extend(self.learners.iter().copied());
        members
    }

    pub fn learners(&self) -> &MemberSet {
        &self.learners
    }

    /// Sets the member set to converge on.
    pub fn set_target_members(&mut self, target: MemberSet) {
        info!("Target members set to {:?}", target);
        self.target = target;
    }

    /// Learners are only tracked by the leader.
    pub fn on_role(&mut self, role: Role) {
        if role != Role::Leader {
            self.learners.clear();
        }
    }

    /// Processes appends and truncations of membership entries. Returns true if
    /// the membership changed.
    pub fn process_log_commands(&mut self, commands: &[LogCommand]) -> Result<bool> {
        let mut changed = false;
        for command in commands {
            match command {
                LogCommand::Append { index, entry } => {
                    if let Content::Membership(members) = &entry.content {
                        changed |= self.state.append(*index, members.clone());
                    }
                }
                LogCommand::BatchAppend { base_index, offset, entries } => {
                    for (i, entry) in entries.iter().enumerate().skip(*offset) {
                        if let Content::Membership(members) = &entry.content {
                            changed |= self.state.append(base_index + i as Index, members.clone());
                        }
                    }
                }
                LogCommand::Truncate { from_index } => changed |= self.state.truncate(*from_index)?,
                LogCommand::Prune { .. } => {}
            }
        }
        if changed {
            info!("Membership log changed, latest members are now {:?}", self.state.latest());
            self.storage.persist(&self.state)?;
        }
        Ok(changed)
    }

    /// Commits the appended configuration once the commit index reaches it.
    pub fn process_commit(&mut self, commit_index: Index) -> Result<bool> {
        if !self.state.commit(commit_index) {
            return Ok(false);
        }
        info!("Committed membership {:?} at {}", self.voting_members(), commit_index);
        self.storage.persist(&self.state)?;
        Ok(true)
    }

    /// Decides on the next membership change while leader, if any. Learners
    /// are updated as a side effect, and the returned member set should be
    /// appended to the log.
    pub fn propose(&mut self, follower_states: &FollowerStates, commit_index: Index) -> Option<MemberSet> {
        if self.target.is_empty() || self.state.uncommitted_member_change_in_log() {
            return None;
        }
        let voting = self.voting_members();
        self.learners = self.target.difference(&voting).copied().collect();

        let caught_up = self.learners.iter().copied().find(|learner| {
            follower_states.get(learner).is_some_and(|state| state.match_index >= commit_index)
        });
        if let Some(learner) = caught_up {
            info!("Adding caught up learner {} to voting members {:?}", learner, voting);
            self.learners.remove(&learner);
            return Some(voting.iter().copied().chain([learner]).collect());
        }

        let superfluous = voting.iter().copied().find(|m| *m != self.me && !self.target.contains(m));
        if let Some(member) = superfluous {
            info!("Removing member {} from voting members {:?}", member, voting);
            return Some(voting.iter().copied().filter(|m| *m != member).collect());
        }
        None
    }

    /// Installs a membership state, e.g. from a snapshot.
    pub fn install(&mut self, state: MembershipState) -> Result<()> {
        info!(
            "Installing membership state with members {}",
            state.latest().iter().map(|m| m.to_string()).join(",")
        );
        self.state = state;
        self.storage.persist(&self.state)
    }

    /// Returns a copy of the membership state, e.g. for a snapshot.
    pub fn core_state(&self) -> MembershipState {
        self.state.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::super::{Entry, FollowerState};
    use super::*;
    use crate::storage::Memory;
    use pretty_assertions::assert_eq;

    fn members(ids: &[MemberId]) -> MemberSet {
        ids.iter().copied().collect()
    }

    fn membership_entry(term: i64, ids: &[MemberId]) -> Entry {
        Entry::new(term, Content::Membership(members(ids)))
    }

    #[test]
    fn state_append_commit_truncate() -> Result<()> {
        let mut state = MembershipState::bootstrap(members(&[1, 2, 3]));
        assert_eq!(state.latest(), members(&[1, 2, 3]));

        assert!(state.append(4, members(&[1, 2, 3, 4])));
        assert!(!state.append(4, members(&[1, 2, 3, 4])));
        assert!(state.uncommitted_member_change_in_log());
        assert_eq!(state.latest(), members(&[1, 2, 3, 4]));

        // Truncation reverts to the committed configuration.
        assert!(!state.truncate(5)?);
        assert!(state.truncate(3)?);
        assert_eq!(state.latest(), members(&[1, 2, 3]));

        assert!(state.append(6, members(&[1, 2])));
        assert!(!state.commit(5));
        assert!(state.commit(6));
        assert!(!state.uncommitted_member_change_in_log());
        assert_eq!(state.committed().map(|c| c.log_index), Some(6));
        assert!(state.truncate(6).is_err());
        Ok(())
    }

    #[test]
    fn state_append_over_uncommitted() {
        let mut state = MembershipState::bootstrap(members(&[1, 2, 3]));
        assert!(state.append(4, members(&[1, 2])));
        assert!(state.append(7, members(&[1])));
        assert_eq!(state.committed().map(|c| c.log_index), Some(4));
        assert_eq!(state.appended().map(|a| a.log_index), Some(7));
    }

    #[test]
    fn manager_processes_log() -> Result<()> {
        let storage = Memory::new(MembershipState::bootstrap(members(&[1, 2, 3])));
        let mut manager = MembershipManager::new(1, Box::new(storage.clone()))?;
        assert_eq!(manager.voting_members(), members(&[1, 2, 3]));

        let commands = vec![LogCommand::BatchAppend {
            base_index: 0,
            offset: 1,
            entries: vec![membership_entry(1, &[1, 2]), membership_entry(1, &[1, 2, 3, 4])],
        }];
        assert!(manager.process_log_commands(&commands)?);
        assert_eq!(manager.voting_members(), members(&[1, 2, 3]));
        assert_eq!(manager.replication_members(), members(&[1, 2, 3, 4]));
        assert_eq!(storage.get()?.appended().map(|a| a.log_index), Some(1));

        assert!(!manager.process_commit(0)?);
        assert!(manager.process_commit(1)?);
        assert_eq!(manager.voting_members(), members(&[1, 2, 3, 4]));
        assert_eq!(storage.get()?.committed().map(|c| c.log_index), Some(1));

        let commands = vec![
            LogCommand::Append { index: 2, entry: membership_entry(2, &[1, 2, 3]) },
            LogCommand::Truncate { from_index: 2 },
        ];
        assert!(manager.process_log_commands(&commands)?);
        assert_eq!(manager.voting_members(), members(&[1, 2, 3, 4]));
        assert_eq!(manager.replication_members(), members(&[1, 2, 3, 4]));
        Ok(())
    }

    #[test]
    fn manager_proposes_changes() -> Result<()> {
        let storage = Memory::new(MembershipState::bootstrap(members(&[1, 2, 3])));
        let mut manager = MembershipManager::new(1, Box::new(storage))?;
        let mut follower_states = FollowerStates::new();
        assert_eq!(manager.propose(&follower_states, 5), None);

        // A new member is a learner until it catches up.
        manager.set_target_members(members(&[1, 2, 3, 4]));
        assert_eq!(manager.propose(&follower_states, 5), None);
        assert_eq!(manager.replication_members(), members(&[1, 2, 3, 4]));
        follower_states.insert(4, FollowerState::new(4, 5));
        assert_eq!(manager.propose(&follower_states, 5), None);
        follower_states.insert(4, FollowerState::new(5, 6));
        assert_eq!(manager.propose(&follower_states, 5), Some(members(&[1, 2, 3, 4])));

        // Nothing else is proposed while the change is uncommitted.
        manager.process_log_commands(&[LogCommand::Append {
            index: 6,
            entry: membership_entry(1, &[1, 2, 3, 4]),
        }])?;
        manager.set_target_members(members(&[1, 2, 4]));
        assert_eq!(manager.propose(&follower_states, 5), None);
        assert_eq!(manager.voting_members(), members(&[1, 2, 3]));

        // Members are removed one at a time, but never ourself.
        manager.process_commit(6)?;
        manager.set_target_members(members(&[2, 4]));
        assert_eq!(manager.propose(&follower_states, 6), Some(members(&[1, 2, 4])));
        manager.process_log_commands(&[LogCommand::Append {
            index: 7,
            entry: membership_entry(1, &[1, 2, 4]),
        }])?;
        // The removed member counts and is replicated to until the removal commits.
        assert_eq!(manager.voting_members(), members(&[1, 2, 3, 4]));
        assert_eq!(manager.replication_members(), members(&[1, 2, 3, 4]));
        manager.process_commit(7)?;
        assert_eq!(manager.replication_members(), members(&[1, 2, 4]));
        assert_eq!(manager.propose(&follower_states, 7), None);

        manager.on_role(Role::Follower);
        assert!(manager.learners().is_empty());
        Ok(())
    }
}
