use super::super::{
    is_quorum_of, quorum_append_index, Index, MemberId, Message, Outcome, RaftMessage, RaftState,
    ShipCommand, Term,
};
use super::{
    append_new_entries, append_new_entry, decline_pre_vote_request, handle_append_entries_request,
    handle_log_compaction_info, handle_prune_request, handle_vote_request, heartbeat, send_heartbeats,
    Role,
};
use crate::error::{Error, Result};

use log::{debug, info, warn};

/// Handles a message as a leader.
pub(super) fn handle(message: &RaftMessage, state: &RaftState) -> Result<Outcome> {
    let mut outcome = Outcome::new(Role::Leader, state);
    let from = message.from;
    match &message.message {
        Message::Heartbeat { leader_term, commit_index, commit_index_term } => {
            if *leader_term >= outcome.term {
                info!("Heartbeat from {} in term {}, stepping down", from, leader_term);
                outcome.step_down(state.term());
                heartbeat(state, &mut outcome, from, *leader_term, *commit_index, *commit_index_term)?;
            }
        }

        Message::HeartbeatTimeout => send_heartbeats(state, &mut outcome)?,

        Message::HeartbeatResponse => {
            outcome.heartbeat_responses.insert(from);
        }

        // Check quorum: if a quorum of voters hasn't responded to heartbeats
        // since the last election timeout, we may have been partitioned away.
        Message::ElectionTimeout => {
            if is_quorum_of(state.voting_members(), &outcome.heartbeat_responses) {
                outcome.heartbeat_responses.clear();
            } else {
                info!(
                    "Stepping down in term {}, heartbeat responses only from {:?}",
                    outcome.term, outcome.heartbeat_responses
                );
                outcome.step_down(state.term());
            }
        }

        Message::AppendEntriesRequest {
            leader_term,
            prev_log_index,
            prev_log_term,
            entries,
            leader_commit,
        } => {
            if *leader_term == outcome.term {
                return Err(Error::Internal(format!(
                    "Append request from {} as leader in our term {}",
                    from, leader_term
                )));
            }
            if *leader_term > outcome.term {
                info!("Append request from {} in term {}, stepping down", from, leader_term);
                outcome.step_down(state.term());
            }
            handle_append_entries_request(
                state,
                &mut outcome,
                from,
                *leader_term,
                *prev_log_index,
                *prev_log_term,
                entries,
                *leader_commit,
            )?
        }

        Message::AppendEntriesResponse { term, success, match_index, append_index } => {
            handle_append_entries_response(
                state,
                &mut outcome,
                from,
                *term,
                *success,
                *match_index,
                *append_index,
            )?
        }

        Message::VoteRequest { term, candidate, last_log_index, last_log_term } => {
            if *term > outcome.term {
                info!("Vote request from {} in term {}, stepping down", from, term);
                outcome.step_down(state.term());
                handle_vote_request(
                    state,
                    &mut outcome,
                    from,
                    *term,
                    *candidate,
                    *last_log_index,
                    *last_log_term,
                )?
            } else {
                outcome.send(from, Message::VoteResponse { term: outcome.term, granted: false });
            }
        }

        Message::VoteResponse { term, .. } => {
            if *term > outcome.term {
                info!("Vote response from {} in term {}, stepping down", from, term);
                outcome.step_down(state.term());
                outcome.set_next_term(*term);
            }
        }

        Message::PreVoteResponse { term, .. } => {
            if *term > outcome.term {
                info!("Pre-vote response from {} in term {}, stepping down", from, term);
                outcome.step_down(state.term());
                outcome.set_next_term(*term);
            }
        }

        Message::LogCompactionInfo { leader_term, prev_index } => {
            if *leader_term > outcome.term {
                info!("Log compaction info from {} in term {}, stepping down", from, leader_term);
                outcome.step_down(state.term());
                outcome.set_next_term(*leader_term);
                handle_log_compaction_info(state, &mut outcome, *leader_term, *prev_index);
            }
        }

        Message::PreVoteRequest { .. } => decline_pre_vote_request(&mut outcome, from),

        Message::NewEntryRequest { content } => {
            if state.refuses_to_be_leader() {
                warn!("Dropping new entry request, refusing to be leader");
            } else {
                append_new_entry(state, &mut outcome, content.clone())?
            }
        }

        Message::NewEntryBatchRequest { contents } => {
            if state.refuses_to_be_leader() {
                warn!("Dropping new entry batch request, refusing to be leader");
            } else {
                append_new_entries(state, &mut outcome, contents)?
            }
        }

        Message::PruneRequest { prune_index } => handle_prune_request(&mut outcome, *prune_index),
    }
    Ok(outcome)
}

/// Handles an append response from a follower. A success records the
/// follower's progress and may advance the commit index. A failure means the
/// follower's log diverges from ours, and we either search further back or tell
/// it that the entries it needs are gone.
#[allow(clippy::too_many_arguments)]
fn handle_append_entries_response(
    state: &RaftState,
    outcome: &mut Outcome,
    from: MemberId,
    term: Term,
    success: bool,
    match_index: Index,
    append_index: Index,
) -> Result<()> {
    if term < outcome.term {
        debug!("Ignoring append response from {} in old term {}", from, term);
        return Ok(());
    }
    if term > outcome.term {
        info!("Append response from {} in term {}, stepping down", from, term);
        outcome.step_down(state.term());
        outcome.set_next_term(term);
        return Ok(());
    }

    let log = state.entry_log();
    if !success {
        if append_index >= log.prev_index() {
            outcome.ship_commands.push(ShipCommand::Mismatch {
                last_remote_append_index: append_index,
                target: from,
            });
        } else {
            outcome.send(
                from,
                Message::LogCompactionInfo { leader_term: outcome.term, prev_index: log.prev_index() },
            );
        }
        return Ok(());
    }

    // The shipper is told about every match, since even a non-progressing one
    // ends the search. Responses may arrive out of order, so the follower state
    // never regresses.
    let follower = outcome.follower_states.get(&from).copied().unwrap_or_default();
    let progressed = match_index > follower.match_index;
    outcome.ship_commands.push(ShipCommand::Match { index: match_index, target: from });
    outcome.follower_states.insert(from, follower.on_success(match_index));
    if !progressed {
        return Ok(());
    }

    // Only entries from our own term are committed by counting replicas. Earlier
    // entries are committed along with them.
    let quorum_index = quorum_append_index(state.voting_members(), &outcome.follower_states)
        .min(log.append_index());
    if quorum_index > outcome.commit_index && log.read_entry_term(quorum_index)? == outcome.term {
        debug!("Committing up to {} in term {}", quorum_index, outcome.term);
        outcome.leader_commit = quorum_index;
        outcome.set_commit_index(quorum_index);
        outcome.ship_commands.push(ShipCommand::CommitUpdate);
    }
    Ok(())
}
