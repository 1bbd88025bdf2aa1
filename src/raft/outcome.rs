use super::{
    Directed, Entry, FollowerStates, InFlightCache, Index, MemberId, MemberSet, Message, RaftLog,
    RaftState, Role, Term,
};
use crate::error::{Error, Result};

/// The result of handling a single message: the next state, and the side
/// effects to perform. Produced by a role, applied by the RaftMachine.
///
/// An outcome starts out as a copy of the current state, and roles adjust it.
#[derive(Clone, Debug, PartialEq)]
pub struct Outcome {
    /// The next role.
    pub role: Role,
    /// The next term.
    pub term: Term,
    /// The next leader, if known.
    pub leader: Option<MemberId>,
    /// The leader's commit index.
    pub leader_commit: Index,
    /// The local commit index.
    pub commit_index: Index,
    /// The vote in the next term.
    pub voted_for: Option<MemberId>,
    /// Log mutations, applied in order before anything else.
    pub log_commands: Vec<LogCommand>,
    /// Messages to send.
    pub outgoing: Vec<Directed>,
    /// Whether to renew the election timeout.
    pub election_timeout_renewed: bool,
    /// Whether the leader no longer has the entries we need, so we must
    /// download a snapshot.
    pub needs_fresh_snapshot: bool,
    /// Whether we're in a pre-election.
    pub is_pre_election: bool,
    /// Set when a leader steps down, to the term it led.
    pub step_down_term: Option<Term>,
    /// Set when we were just elected leader.
    pub elected_leader: bool,
    /// The append index when we were last elected.
    pub last_log_index_before_we_became_leader: Index,
    /// Follower replication progress.
    pub follower_states: FollowerStates,
    /// Commands for the log shipping manager.
    pub ship_commands: Vec<ShipCommand>,
    /// Granted votes in the current election.
    pub votes_for_me: MemberSet,
    /// Granted pre-votes in the current pre-election.
    pub pre_votes_for_me: MemberSet,
    /// Heartbeat responses in the current check-quorum window.
    pub heartbeat_responses: MemberSet,
}

impl Outcome {
    /// Creates an outcome for the given role, initialized from the current
    /// state with no side effects.
    pub fn new(role: Role, state: &RaftState) -> Self {
        Self {
            role,
            term: state.term(),
            leader: state.leader(),
            leader_commit: state.leader_commit(),
            commit_index: state.commit_index(),
            voted_for: state.voted_for(),
            log_commands: Vec::new(),
            outgoing: Vec::new(),
            election_timeout_renewed: false,
            needs_fresh_snapshot: false,
            is_pre_election: state.is_pre_election(),
            step_down_term: None,
            elected_leader: false,
            last_log_index_before_we_became_leader: state.last_log_index_before_we_became_leader(),
            follower_states: state.follower_states().clone(),
            ship_commands: Vec::new(),
            votes_for_me: state.votes_for_me().clone(),
            pre_votes_for_me: state.pre_votes_for_me().clone(),
            heartbeat_responses: state.heartbeat_responses().clone(),
        }
    }

    /// Moves to the given term. A new term clears the vote, and we don't know
    /// its leader yet.
    pub fn set_next_term(&mut self, term: Term) {
        if term > self.term {
            self.voted_for = None;
            self.leader = None;
        }
        self.term = term;
    }

    /// Steps down from leadership of the given term to follower, with no known
    /// leader. Follower progress is only tracked while leader.
    pub fn step_down(&mut self, term: Term) {
        self.step_down_term = Some(term);
        self.role = Role::Follower;
        self.leader = None;
        self.follower_states.clear();
    }

    /// Sets the commit index. It never regresses.
    pub fn set_commit_index(&mut self, commit_index: Index) {
        if commit_index > self.commit_index {
            self.commit_index = commit_index;
        }
    }

    /// Adds an outbound message.
    pub fn send(&mut self, to: MemberId, message: Message) {
        self.outgoing.push(Directed::new(to, message));
    }
}

/// A log mutation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LogCommand {
    /// Appends a single entry at the given index.
    Append { index: Index, entry: Entry },
    /// Appends entries[offset..], where entries[0] belongs at base_index.
    BatchAppend { base_index: Index, offset: usize, entries: Vec<Entry> },
    /// Truncates the log from the given index.
    Truncate { from_index: Index },
    /// Prunes the log up to the given index.
    Prune { prune_index: Index },
}

impl LogCommand {
    /// Applies the command to a log.
    pub fn apply_to(&self, log: &mut dyn RaftLog) -> Result<()> {
        match self {
            Self::Append { index, entry } => {
                Self::check_append(log, *index)?;
                log.append(std::slice::from_ref(entry))?;
            }
            Self::BatchAppend { base_index, offset, entries } => {
                Self::check_append(log, base_index + *offset as Index)?;
                log.append(&entries[*offset..])?;
            }
            Self::Truncate { from_index } => log.truncate(*from_index)?,
            Self::Prune { prune_index } => {
                log.prune(*prune_index)?;
            }
        }
        Ok(())
    }

    /// Applies the command to the in-flight cache.
    pub fn apply_to_cache(&self, cache: &mut InFlightCache) {
        match self {
            Self::Append { index, entry } => cache.put(*index, entry.clone()),
            Self::BatchAppend { base_index, offset, entries } => {
                for (i, entry) in entries.iter().enumerate().skip(*offset) {
                    cache.put(base_index + i as Index, entry.clone());
                }
            }
            Self::Truncate { from_index } => cache.truncate(*from_index),
            Self::Prune { prune_index } => cache.prune(*prune_index),
        }
    }

    /// Appends must directly follow the current append index.
    fn check_append(log: &dyn RaftLog, index: Index) -> Result<()> {
        if index != log.append_index() + 1 {
            return Err(Error::Internal(format!(
                "Can't append at index {}, append index is {}",
                index,
                log.append_index()
            )));
        }
        Ok(())
    }
}

/// A command for the leader's log shipping manager.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ShipCommand {
    /// The target follower's log matches ours up to the given index.
    Match { index: Index, target: MemberId },
    /// The target follower's log doesn't match ours at the index we tried.
    Mismatch { last_remote_append_index: Index, target: MemberId },
    /// New entries were appended after the given previous entry.
    NewEntries { prev_log_index: Index, prev_log_term: Term, entries: Vec<Entry> },
    /// The commit index advanced.
    CommitUpdate,
}
