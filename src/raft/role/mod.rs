//! The Raft roles. Each role is a pure function from an inbound message and
//! the current state to an Outcome. The helpers in this module implement the
//! parts of the protocol that are shared between roles, e.g. a candidate or
//! leader that discovers a newer leader handles its append request exactly
//! like a follower would.

mod candidate;
mod follower;
mod leader;

use super::{
    is_quorum_of, Content, Entry, Index, LogCommand, MemberId, Message, Outcome, RaftMessage,
    RaftState, ShipCommand, Term, NO_INDEX,
};
use crate::error::{Error, Result};

use log::{debug, info};

/// A Raft role.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Role {
    Follower,
    Candidate,
    Leader,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Self::Follower => write!(f, "follower"),
            Self::Candidate => write!(f, "candidate"),
            Self::Leader => write!(f, "leader"),
        }
    }
}

impl Role {
    /// Handles a message in this role, returning the outcome. The state is
    /// not modified.
    pub fn handle(self, message: &RaftMessage, state: &RaftState) -> Result<Outcome> {
        match self {
            Self::Follower => follower::handle(message, state),
            Self::Candidate => candidate::handle(message, state),
            Self::Leader => leader::handle(message, state),
        }
    }
}

/// Decides whether to vote for a candidate. The candidate's term must not be
/// behind ours, and its log must be at least as up-to-date as ours: either it
/// ends at a higher term, or at the same term with at least as many entries.
/// We also can't already have voted for someone else in this term.
pub(super) fn should_vote_for(
    term: Term,
    request_term: Term,
    last_log_term: Term,
    request_last_log_term: Term,
    last_log_index: Index,
    request_last_log_index: Index,
    voted_for_another: bool,
) -> bool {
    if request_term < term {
        return false;
    }
    let ends_at_higher_term = request_last_log_term > last_log_term;
    let ends_at_same_term = request_last_log_term == last_log_term;
    let at_least_as_long = request_last_log_index >= last_log_index;
    let up_to_date = ends_at_higher_term || (ends_at_same_term && at_least_as_long);
    up_to_date && !voted_for_another
}

/// Handles a vote request, granting or denying the vote. A newer term is
/// adopted first, which clears any previous vote.
fn handle_vote_request(
    state: &RaftState,
    outcome: &mut Outcome,
    from: MemberId,
    term: Term,
    candidate: MemberId,
    last_log_index: Index,
    last_log_term: Term,
) -> Result<()> {
    if term > outcome.term {
        outcome.set_next_term(term);
    }
    let voted_for_another = outcome.voted_for.is_some_and(|voted_for| voted_for != candidate);
    let (local_index, local_term) = state.last_log()?;
    let granted = should_vote_for(
        outcome.term,
        term,
        local_term,
        last_log_term,
        local_index,
        last_log_index,
        voted_for_another,
    );
    if granted {
        info!("Voting for {} in term {} election", candidate, term);
        outcome.voted_for = Some(candidate);
    }
    outcome.send(from, Message::VoteResponse { term: outcome.term, granted });
    Ok(())
}

/// Handles a pre-vote request, granted only once we're in a pre-election or
/// have no leader. A granted pre-vote echoes the requester's term, and
/// nothing about our own state changes.
fn handle_pre_vote_request(
    state: &RaftState,
    outcome: &mut Outcome,
    from: MemberId,
    term: Term,
    last_log_index: Index,
    last_log_term: Term,
) -> Result<()> {
    let (local_index, local_term) = state.last_log()?;
    let granted = should_vote_for(
        state.term(),
        term,
        local_term,
        last_log_term,
        local_index,
        last_log_index,
        false,
    );
    let term = if granted { term } else { outcome.term };
    outcome.send(from, Message::PreVoteResponse { term, granted });
    Ok(())
}

/// Declines a pre-vote request, with our own term.
fn decline_pre_vote_request(outcome: &mut Outcome, from: MemberId) {
    outcome.send(from, Message::PreVoteResponse { term: outcome.term, granted: false });
}

/// Checks whether our log contains the leader's entry at the given index and
/// term. An index at or before our prev index is compacted history, which is
/// taken to match. The term of a missing entry is -1, which never matches a
/// real entry.
fn log_history_matches(state: &RaftState, prev_log_index: Index, prev_log_term: Term) -> Result<bool> {
    let log = state.entry_log();
    Ok(prev_log_index <= log.prev_index() || log.read_entry_term(prev_log_index)? == prev_log_term)
}

/// Advances the commit index up to the last new entry, bounded by the
/// leader's commit index.
fn commit_to_log_on_update(outcome: &mut Outcome, index_of_last_new_entry: Index, leader_commit: Index) {
    outcome.set_commit_index(leader_commit.min(index_of_last_new_entry));
}

/// Handles a heartbeat from a leader in our term or a newer one: follows the
/// leader, acknowledges the heartbeat, and commits up to the leader's commit
/// index if we have that entry.
fn heartbeat(
    state: &RaftState,
    outcome: &mut Outcome,
    from: MemberId,
    leader_term: Term,
    commit_index: Index,
    commit_index_term: Term,
) -> Result<()> {
    if leader_term < outcome.term {
        return Ok(());
    }
    outcome.is_pre_election = false;
    outcome.set_next_term(leader_term);
    outcome.leader = Some(from);
    outcome.leader_commit = commit_index;
    outcome.election_timeout_renewed = true;
    outcome.send(from, Message::HeartbeatResponse);

    if log_history_matches(state, commit_index, commit_index_term)? {
        commit_to_log_on_update(outcome, commit_index, commit_index);
    }
    Ok(())
}

/// Handles an append request from a leader. Stale requests are rejected with
/// our term. Otherwise we follow the leader, and check that our log matches
/// the leader's at the previous entry. If it does, entries we already have
/// are skipped, the log is truncated at the first conflicting entry, and the
/// rest are appended.
#[allow(clippy::too_many_arguments)]
fn handle_append_entries_request(
    state: &RaftState,
    outcome: &mut Outcome,
    from: MemberId,
    leader_term: Term,
    prev_log_index: Index,
    prev_log_term: Term,
    entries: &[Entry],
    leader_commit: Index,
) -> Result<()> {
    let log = state.entry_log();
    if leader_term < outcome.term {
        outcome.send(
            from,
            Message::AppendEntriesResponse {
                term: outcome.term,
                success: false,
                match_index: NO_INDEX,
                append_index: log.append_index(),
            },
        );
        return Ok(());
    }

    outcome.is_pre_election = false;
    outcome.set_next_term(leader_term);
    outcome.leader = Some(from);
    outcome.leader_commit = leader_commit;
    outcome.election_timeout_renewed = true;

    if !log_history_matches(state, prev_log_index, prev_log_term)? {
        debug!(
            "Rejecting append from {}, no entry {} in term {}",
            from, prev_log_index, prev_log_term
        );
        outcome.send(
            from,
            Message::AppendEntriesResponse {
                term: leader_term,
                success: false,
                match_index: NO_INDEX,
                append_index: log.append_index(),
            },
        );
        return Ok(());
    }

    let base_index = prev_log_index + 1;
    let mut offset = 0;
    while offset < entries.len() {
        let index = base_index + offset as Index;
        if index > log.append_index() {
            break;
        }
        if index > log.prev_index() && log.read_entry_term(index)? != entries[offset].term {
            if index <= state.commit_index() {
                return Err(Error::Internal(format!(
                    "Attempted to truncate committed entry {}, commit index is {}",
                    index,
                    state.commit_index()
                )));
            }
            info!("Truncating log from {} due to conflicting entries from {}", index, from);
            outcome.log_commands.push(LogCommand::Truncate { from_index: index });
            break;
        }
        offset += 1;
    }
    if offset < entries.len() {
        outcome.log_commands.push(LogCommand::BatchAppend {
            base_index,
            offset,
            entries: entries.to_vec(),
        });
    }

    let match_index = prev_log_index + entries.len() as Index;
    commit_to_log_on_update(outcome, match_index, leader_commit);
    outcome.send(
        from,
        Message::AppendEntriesResponse {
            term: leader_term,
            success: true,
            match_index,
            append_index: match_index,
        },
    );
    Ok(())
}

/// Handles a log compaction notice from the leader. If the leader has pruned
/// entries we haven't got, we can only catch up by downloading a snapshot.
fn handle_log_compaction_info(
    state: &RaftState,
    outcome: &mut Outcome,
    leader_term: Term,
    prev_index: Index,
) {
    if leader_term < outcome.term {
        return;
    }
    let append_index = state.entry_log().append_index();
    if append_index <= NO_INDEX || prev_index > append_index {
        info!("Leader log compacted to {}, past our append index {}", prev_index, append_index);
        outcome.needs_fresh_snapshot = true;
    }
}

/// Starts a pre-election, asking the other voting members whether they would
/// vote for us, without bumping our term. Returns false if we're not a voting
/// member. If we're the only voting member, we go straight to a real election.
fn start_pre_election(state: &RaftState, outcome: &mut Outcome) -> Result<bool> {
    let me = state.me();
    if !state.voting_members().contains(&me) {
        info!("Not starting pre-election, {} is not in voting members {:?}", me, state.voting_members());
        return Ok(false);
    }
    let (last_log_index, last_log_term) = state.last_log()?;
    info!("Starting pre-election in term {}", outcome.term);
    outcome.is_pre_election = true;
    outcome.pre_votes_for_me.clear();
    let request =
        Message::PreVoteRequest { term: outcome.term, candidate: me, last_log_index, last_log_term };
    for member in state.voting_members().iter().filter(|m| **m != me) {
        outcome.send(*member, request.clone());
    }
    if is_quorum_of(state.voting_members(), &outcome.pre_votes_for_me) {
        outcome.is_pre_election = false;
        start_real_election(state, outcome)?;
    }
    Ok(true)
}

/// Starts a real election: bumps the term, votes for ourself, and solicits
/// votes from the other voting members. Returns false if we're not a voting
/// member. If we're the only voting member, we win immediately.
fn start_real_election(state: &RaftState, outcome: &mut Outcome) -> Result<bool> {
    let me = state.me();
    if !state.voting_members().contains(&me) {
        info!("Not starting election, {} is not in voting members {:?}", me, state.voting_members());
        return Ok(false);
    }
    let (last_log_index, last_log_term) = state.last_log()?;
    outcome.set_next_term(outcome.term + 1);
    outcome.voted_for = Some(me);
    outcome.votes_for_me.clear();
    outcome.is_pre_election = false;
    outcome.role = Role::Candidate;
    info!("Starting election for term {}", outcome.term);

    let request =
        Message::VoteRequest { term: outcome.term, candidate: me, last_log_index, last_log_term };
    for member in state.voting_members().iter().filter(|m| **m != me) {
        outcome.send(*member, request.clone());
    }
    if is_quorum_of(state.voting_members(), &outcome.votes_for_me) {
        become_leader(state, outcome)?;
    }
    Ok(true)
}

/// Transitions to leader after winning an election: initializes follower
/// progress, appends a NewLeaderBarrier entry and asserts leadership with
/// heartbeats.
fn become_leader(state: &RaftState, outcome: &mut Outcome) -> Result<()> {
    let me = state.me();
    let append_index = state.entry_log().append_index();
    info!("Won election for term {}, becoming leader (votes from {:?})", outcome.term, outcome.votes_for_me);

    outcome.role = Role::Leader;
    outcome.leader = Some(me);
    outcome.is_pre_election = false;
    outcome.elected_leader = true;
    outcome.election_timeout_renewed = true;
    outcome.last_log_index_before_we_became_leader = append_index;
    outcome.heartbeat_responses.clear();
    outcome.follower_states = state
        .replication_members()
        .iter()
        .filter(|m| **m != me)
        .map(|m| (*m, super::FollowerState::new(NO_INDEX, append_index + 1)))
        .collect();

    append_new_entry(state, outcome, Content::NewLeaderBarrier)?;
    send_heartbeats(state, outcome)?;
    Ok(())
}

/// Sends heartbeats to all replication members.
fn send_heartbeats(state: &RaftState, outcome: &mut Outcome) -> Result<()> {
    let commit_index = state.commit_index();
    let commit_index_term = state.entry_log().read_entry_term(commit_index)?;
    let heartbeat = Message::Heartbeat { leader_term: outcome.term, commit_index, commit_index_term };
    for member in state.replication_members().iter().filter(|m| **m != state.me()) {
        outcome.send(*member, heartbeat.clone());
    }
    Ok(())
}

/// Appends a new entry in the outcome's term, and tells the log shippers.
fn append_new_entry(state: &RaftState, outcome: &mut Outcome, content: Content) -> Result<()> {
    let log = state.entry_log();
    let prev_log_index = log.append_index();
    let prev_log_term = log.read_entry_term(prev_log_index)?;
    let entry = Entry::new(outcome.term, content);
    outcome.ship_commands.push(ShipCommand::NewEntries {
        prev_log_index,
        prev_log_term,
        entries: vec![entry.clone()],
    });
    outcome.log_commands.push(LogCommand::Append { index: prev_log_index + 1, entry });
    commit_if_sole_voter(state, outcome, prev_log_index + 1);
    Ok(())
}

/// Appends a batch of new entries in the outcome's term, and tells the log
/// shippers.
fn append_new_entries(state: &RaftState, outcome: &mut Outcome, contents: &[Content]) -> Result<()> {
    if contents.is_empty() {
        return Ok(());
    }
    let log = state.entry_log();
    let prev_log_index = log.append_index();
    let prev_log_term = log.read_entry_term(prev_log_index)?;
    let entries: Vec<Entry> =
        contents.iter().map(|content| Entry::new(outcome.term, content.clone())).collect();
    let last_index = prev_log_index + entries.len() as Index;
    outcome.ship_commands.push(ShipCommand::NewEntries {
        prev_log_index,
        prev_log_term,
        entries: entries.clone(),
    });
    outcome.log_commands.push(LogCommand::BatchAppend {
        base_index: prev_log_index + 1,
        offset: 0,
        entries,
    });
    commit_if_sole_voter(state, outcome, last_index);
    Ok(())
}

/// A leader that is the only voting member commits appended entries
/// immediately, since no responses will ever arrive.
fn commit_if_sole_voter(state: &RaftState, outcome: &mut Outcome, index: Index) {
    let voting = state.voting_members();
    if voting.len() == 1 && voting.contains(&state.me()) {
        outcome.leader_commit = index;
        outcome.set_commit_index(index);
        outcome.ship_commands.push(ShipCommand::CommitUpdate);
    }
}

/// Handles a prune request, in any role.
fn handle_prune_request(outcome: &mut Outcome, prune_index: Index) {
    outcome.log_commands.push(LogCommand::Prune { prune_index });
}
