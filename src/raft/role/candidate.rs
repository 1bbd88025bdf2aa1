use super::super::{is_quorum_of, Message, Outcome, RaftMessage, RaftState};
use super::{
    become_leader, decline_pre_vote_request, handle_append_entries_request,
    handle_log_compaction_info, handle_prune_request, handle_vote_request, heartbeat,
    start_real_election, Role,
};
use crate::error::Result;

use log::info;

/// Handles a message as a candidate.
pub(super) fn handle(message: &RaftMessage, state: &RaftState) -> Result<Outcome> {
    let mut outcome = Outcome::new(Role::Candidate, state);
    let from = message.from;
    match &message.message {
        // A leader in our term or later won, so follow it.
        Message::Heartbeat { leader_term, commit_index, commit_index_term } => {
            if *leader_term >= outcome.term {
                outcome.role = Role::Follower;
                heartbeat(state, &mut outcome, from, *leader_term, *commit_index, *commit_index_term)?;
            }
        }

        Message::AppendEntriesRequest {
            leader_term,
            prev_log_index,
            prev_log_term,
            entries,
            leader_commit,
        } => {
            if *leader_term >= outcome.term {
                outcome.role = Role::Follower;
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

        Message::VoteResponse { term, granted } => {
            if *term > outcome.term {
                info!("Found newer term {} in vote response, moving to follower", term);
                outcome.set_next_term(*term);
                outcome.role = Role::Follower;
            } else if *term == outcome.term && *granted {
                if from != state.me() {
                    outcome.votes_for_me.insert(from);
                }
                if is_quorum_of(state.voting_members(), &outcome.votes_for_me) {
                    become_leader(state, &mut outcome)?;
                }
            }
        }

        Message::VoteRequest { term, candidate, last_log_index, last_log_term } => {
            if *term > outcome.term {
                outcome.votes_for_me.clear();
                outcome.role = Role::Follower;
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

        Message::PreVoteRequest { .. } => decline_pre_vote_request(&mut outcome, from),

        Message::PreVoteResponse { term, .. } | Message::AppendEntriesResponse { term, .. } => {
            if *term > outcome.term {
                outcome.set_next_term(*term);
                outcome.role = Role::Follower;
            }
        }

        Message::ElectionTimeout => {
            if !start_real_election(state, &mut outcome)? {
                info!("Failed to start election, moving to follower");
                outcome.role = Role::Follower;
            }
        }

        Message::PruneRequest { prune_index } => handle_prune_request(&mut outcome, *prune_index),

        Message::LogCompactionInfo { leader_term, prev_index } => {
            if *leader_term > outcome.term {
                info!("Found newer term {} in log compaction info, moving to follower", leader_term);
                outcome.set_next_term(*leader_term);
                outcome.role = Role::Follower;
                handle_log_compaction_info(state, &mut outcome, *leader_term, *prev_index);
            }
        }

        Message::HeartbeatResponse
        | Message::HeartbeatTimeout
        | Message::NewEntryRequest { .. }
        | Message::NewEntryBatchRequest { .. } => {}
    }
    Ok(outcome)
}
