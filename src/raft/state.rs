use super::{Index, InFlightCache, MemberId, MemberSet, Outcome, RaftLog, Role, Term, NO_INDEX};
use crate::config::RaftConfig;
use crate::encoding;
use crate::error::{Error, Result};
use crate::storage::StateStorage;

use log::info;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// The durable current term.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TermState {
    term: Term,
}

impl encoding::Value for TermState {}

impl TermState {
    /// Returns the current term.
    pub fn term(&self) -> Term {
        self.term
    }

    /// Updates the term, returning true if it changed and must be persisted.
    /// Terms never regress.
    pub fn update(&mut self, term: Term) -> Result<bool> {
        if term < self.term {
            return Err(Error::Internal(format!(
                "Term can't regress from {} to {}",
                self.term, term
            )));
        }
        let changed = term != self.term;
        self.term = term;
        Ok(changed)
    }
}

/// The durable vote in the current term. A member votes at most once per term.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteState {
    term: Term,
    voted_for: Option<MemberId>,
}

impl encoding::Value for VoteState {}

impl VoteState {
    /// Returns the term of the vote.
    pub fn term(&self) -> Term {
        self.term
    }

    /// Returns the member voted for in the term, if any.
    pub fn voted_for(&self) -> Option<MemberId> {
        self.voted_for
    }

    /// Updates the vote, returning true if it changed and must be persisted. A
    /// new term replaces the vote, but within a term the vote can't change
    /// once cast.
    pub fn update(&mut self, voted_for: Option<MemberId>, term: Term) -> Result<bool> {
        if term < self.term {
            return Err(Error::Internal(format!(
                "Vote term can't regress from {} to {}",
                self.term, term
            )));
        }
        if term > self.term {
            self.term = term;
            self.voted_for = voted_for;
            return Ok(true);
        }
        match (self.voted_for, voted_for) {
            (current, new) if current == new => Ok(false),
            (None, Some(_)) => {
                self.voted_for = voted_for;
                Ok(true)
            }
            (current, new) => Err(Error::Internal(format!(
                "Can only vote once per term: voted for {:?} in term {}, now {:?}",
                current, term, new
            ))),
        }
    }
}

/// A leader's view of a follower's replication progress.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FollowerState {
    /// The highest index known to be replicated to the follower.
    pub match_index: Index,
    /// The next index to send to the follower.
    pub next_index: Index,
}

impl Default for FollowerState {
    fn default() -> Self {
        Self { match_index: NO_INDEX, next_index: 0 }
    }
}

impl FollowerState {
    pub fn new(match_index: Index, next_index: Index) -> Self {
        Self { match_index, next_index }
    }

    /// Records a successful append response. The match index never regresses,
    /// since responses may arrive out of order.
    pub fn on_success(self, match_index: Index) -> Self {
        let match_index = self.match_index.max(match_index);
        Self { match_index, next_index: match_index + 1 }
    }
}

/// Follower states, by member.
pub type FollowerStates = BTreeMap<MemberId, FollowerState>;

/// A read-only copy of the Raft state, for external consumers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExposedRaftState {
    pub me: MemberId,
    pub role: Role,
    pub term: Term,
    pub voted_for: Option<MemberId>,
    pub leader: Option<MemberId>,
    pub leader_commit: Index,
    pub commit_index: Index,
    pub append_index: Index,
    pub voting_members: MemberSet,
    pub replication_members: MemberSet,
}

/// A member's Raft state. There is exactly one mutable copy, owned by the
/// RaftMachine. Roles only ever read it, and describe changes as an Outcome
/// which the machine applies via update().
pub struct RaftState {
    /// The local member.
    me: MemberId,
    /// The current term and its storage.
    term_state: TermState,
    term_storage: Box<dyn StateStorage<TermState>>,
    /// The vote in the current term and its storage.
    vote_state: VoteState,
    vote_storage: Box<dyn StateStorage<VoteState>>,
    /// The Raft log.
    log: Box<dyn RaftLog>,
    /// Recently appended entries, read by log shippers.
    cache: InFlightCache,
    /// The current role.
    role: Role,
    /// The current leader, if known.
    leader: Option<MemberId>,
    /// The leader's commit index, as last heard from the leader.
    leader_commit: Index,
    /// The local commit index.
    commit_index: Index,
    /// Replication progress of followers, when leader.
    follower_states: FollowerStates,
    /// The voting members, as given by the membership manager.
    voting_members: MemberSet,
    /// The members to replicate to, as given by the membership manager.
    replication_members: MemberSet,
    /// True while the member has lost its leader and is probing for an
    /// election via pre-votes.
    is_pre_election: bool,
    /// Granted votes in the current election.
    votes_for_me: MemberSet,
    /// Granted pre-votes in the current pre-election.
    pre_votes_for_me: MemberSet,
    /// Members that responded to heartbeats in the current check-quorum window.
    heartbeat_responses: MemberSet,
    /// The append index when we were last elected.
    last_log_index_before_we_became_leader: Index,
    /// Whether to hold pre-votes before elections.
    supports_pre_voting: bool,
    /// Whether this member refuses to start elections.
    refuse_to_be_leader: bool,
}

impl RaftState {
    /// Creates a new Raft state, loading the term and vote from storage.
    pub fn new(
        me: MemberId,
        config: &RaftConfig,
        log: Box<dyn RaftLog>,
        mut term_storage: Box<dyn StateStorage<TermState>>,
        mut vote_storage: Box<dyn StateStorage<VoteState>>,
    ) -> Result<Self> {
        let term_state = term_storage.initial_state()?;
        let vote_state = vote_storage.initial_state()?;
        let cache = InFlightCache::new(
            config.in_flight_cache_enabled,
            config.in_flight_cache_max_entries,
            config.in_flight_cache_max_bytes,
        );
        Ok(Self {
            me,
            term_state,
            term_storage,
            vote_state,
            vote_storage,
            log,
            cache,
            role: Role::Follower,
            leader: None,
            leader_commit: NO_INDEX,
            commit_index: NO_INDEX,
            follower_states: FollowerStates::new(),
            voting_members: MemberSet::new(),
            replication_members: MemberSet::new(),
            is_pre_election: false,
            votes_for_me: MemberSet::new(),
            pre_votes_for_me: MemberSet::new(),
            heartbeat_responses: MemberSet::new(),
            last_log_index_before_we_became_leader: NO_INDEX,
            supports_pre_voting: config.enable_pre_voting,
            refuse_to_be_leader: config.refuse_to_be_leader,
        })
    }

    pub fn me(&self) -> MemberId {
        self.me
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn term(&self) -> Term {
        self.term_state.term()
    }

    pub fn voted_for(&self) -> Option<MemberId> {
        // The vote only applies to the term it was cast in.
        if self.vote_state.term() == self.term() {
            self.vote_state.voted_for()
        } else {
            None
        }
    }

    pub fn leader(&self) -> Option<MemberId> {
        self.leader
    }

    pub fn leader_commit(&self) -> Index {
        self.leader_commit
    }

    pub fn commit_index(&self) -> Index {
        self.commit_index
    }

    /// Returns the Raft log.
    pub fn entry_log(&self) -> &dyn RaftLog {
        self.log.as_ref()
    }

    /// Returns the in-flight entry cache.
    pub fn in_flight_cache(&self) -> &InFlightCache {
        &self.cache
    }

    pub fn follower_states(&self) -> &FollowerStates {
        &self.follower_states
    }

    pub fn voting_members(&self) -> &MemberSet {
        &self.voting_members
    }

    pub fn replication_members(&self) -> &MemberSet {
        &self.replication_members
    }

    pub fn is_pre_election(&self) -> bool {
        self.is_pre_election
    }

    pub fn votes_for_me(&self) -> &MemberSet {
        &self.votes_for_me
    }

    pub fn pre_votes_for_me(&self) -> &MemberSet {
        &self.pre_votes_for_me
    }

    pub fn heartbeat_responses(&self) -> &MemberSet {
        &self.heartbeat_responses
    }

    pub fn last_log_index_before_we_became_leader(&self) -> Index {
        self.last_log_index_before_we_became_leader
    }

    pub fn supports_pre_voting(&self) -> bool {
        self.supports_pre_voting
    }

    pub fn refuses_to_be_leader(&self) -> bool {
        self.refuse_to_be_leader
    }

    /// Returns the index and term of the last log entry.
    pub fn last_log(&self) -> Result<(Index, Term)> {
        let index = self.log.append_index();
        Ok((index, self.log.read_entry_term(index)?))
    }

    /// Updates the member sets, as decided by the membership manager. Follower
    /// states are only retained for replication members.
    pub fn set_members(&mut self, voting: MemberSet, replication: MemberSet) {
        self.follower_states.retain(|member, _| replication.contains(member));
        self.voting_members = voting;
        self.replication_members = replication;
    }

    /// Applies an outcome. Log commands are applied first, then the term and
    /// vote are persisted, and finally the volatile state is replaced. Any
    /// error here means durability may have been lost, and is fatal.
    pub fn update(&mut self, outcome: &Outcome) -> Result<()> {
        for command in &outcome.log_commands {
            command.apply_to(self.log.as_mut())?;
            command.apply_to_cache(&mut self.cache);
        }

        if self.term_state.update(outcome.term)? {
            self.term_storage.persist(&self.term_state)?;
        }
        if self.vote_state.update(outcome.voted_for, outcome.term)? {
            self.vote_storage.persist(&self.vote_state)?;
        }

        if self.leader != outcome.leader {
            match outcome.leader {
                Some(leader) => info!("Leader changed to {} in term {}", leader, outcome.term),
                None => info!("Lost leader in term {}", outcome.term),
            }
        }
        self.role = outcome.role;
        self.leader = outcome.leader;
        self.leader_commit = outcome.leader_commit;
        self.commit_index = outcome.commit_index;
        self.follower_states = outcome.follower_states.clone();
        self.is_pre_election = outcome.is_pre_election;
        self.votes_for_me = outcome.votes_for_me.clone();
        self.pre_votes_for_me = outcome.pre_votes_for_me.clone();
        self.heartbeat_responses = outcome.heartbeat_responses.clone();
        self.last_log_index_before_we_became_leader = outcome.last_log_index_before_we_became_leader;
        Ok(())
    }

    /// Returns a read-only copy of the state.
    pub fn exposed(&self) -> ExposedRaftState {
        ExposedRaftState {
            me: self.me,
            role: self.role,
            term: self.term(),
            voted_for: self.voted_for(),
            leader: self.leader,
            leader_commit: self.leader_commit,
            commit_index: self.commit_index,
            append_index: self.log.append_index(),
            voting_members: self.voting_members.clone(),
            replication_members: self.replication_members.clone(),
        }
    }
}

/// Builds a RaftState for tests, with in-memory storage and an in-memory log.
#[cfg(test)]
pub(crate) struct RaftStateBuilder {
    me: MemberId,
    term: Term,
    voted_for: Option<MemberId>,
    role: Role,
    leader: Option<MemberId>,
    commit_index: Index,
    entries: Vec<super::Entry>,
    voting_members: MemberSet,
    follower_states: FollowerStates,
    is_pre_election: bool,
    votes_for_me: MemberSet,
    heartbeat_responses: MemberSet,
    config: RaftConfig,
}

#[cfg(test)]
impl RaftStateBuilder {
    pub fn new(me: MemberId) -> Self {
        Self {
            me,
            term: 0,
            voted_for: None,
            role: Role::Follower,
            leader: None,
            commit_index: NO_INDEX,
            entries: Vec::new(),
            voting_members: MemberSet::from([me]),
            follower_states: FollowerStates::new(),
            is_pre_election: false,
            votes_for_me: MemberSet::new(),
            heartbeat_responses: MemberSet::new(),
            config: RaftConfig::default(),
        }
    }

    pub fn term(mut self, term: Term) -> Self {
        self.term = term;
        self
    }

    pub fn voted_for(mut self, voted_for: Option<MemberId>) -> Self {
        self.voted_for = voted_for;
        self
    }

    pub fn role(mut self, role: Role) -> Self {
        self.role = role;
        self
    }

    pub fn leader(mut self, leader: Option<MemberId>) -> Self {
        self.leader = leader;
        self
    }

    pub fn commit_index(mut self, commit_index: Index) -> Self {
        self.commit_index = commit_index;
        self
    }

    pub fn entries(mut self, entries: Vec<super::Entry>) -> Self {
        self.entries = entries;
        self
    }

    pub fn voting_members(mut self, members: &[MemberId]) -> Self {
        self.voting_members = members.iter().copied().collect();
        self
    }

    pub fn follower_state(mut self, member: MemberId, state: FollowerState) -> Self {
        self.follower_states.insert(member, state);
        self
    }

    pub fn pre_election(mut self, is_pre_election: bool) -> Self {
        self.is_pre_election = is_pre_election;
        self
    }

    pub fn votes_for_me(mut self, members: &[MemberId]) -> Self {
        self.votes_for_me = members.iter().copied().collect();
        self
    }

    pub fn heartbeat_responses(mut self, members: &[MemberId]) -> Self {
        self.heartbeat_responses = members.iter().copied().collect();
        self
    }

    pub fn pre_voting(mut self, enabled: bool) -> Self {
        self.config.enable_pre_voting = enabled;
        self
    }

    pub fn refuse_to_be_leader(mut self, refuse: bool) -> Self {
        self.config.refuse_to_be_leader = refuse;
        self
    }

    pub fn build(self) -> Result<RaftState> {
        let mut log = super::MemoryLog::new();
        log.append(&self.entries)?;
        let mut state = RaftState::new(
            self.me,
            &self.config,
            Box::new(log),
            Box::new(crate::storage::Memory::new(TermState::default())),
            Box::new(crate::storage::Memory::new(VoteState::default())),
        )?;
        state.set_members(self.voting_members.clone(), self.voting_members);
        let mut outcome = Outcome::new(self.role, &state);
        outcome.term = self.term;
        outcome.voted_for = self.voted_for;
        outcome.leader = self.leader;
        outcome.leader_commit = self.commit_index;
        outcome.commit_index = self.commit_index;
        outcome.follower_states = self.follower_states;
        outcome.is_pre_election = self.is_pre_election;
        outcome.votes_for_me = self.votes_for_me;
        outcome.heartbeat_responses = self.heartbeat_responses;
        state.update(&outcome)?;
        Ok(state)
    }
}
