use super::super::{is_quorum_of, Message, Outcome, RaftMessage, RaftState};
use super::{
    decline_pre_vote_request, handle_append_entries_request, handle_log_compaction_info,
    handle_pre_vote_request, handle_prune_request, handle_vote_request, heartbeat,
    start_pre_election, start_real_election, Role,
};
use crate::error::Result;

use log::{debug, info};

/// Handles a message as a follower.
pub(super) fn handle(message: &RaftMessage, state: &RaftState) -> Result<Outcome> {
    let mut outcome = Outcome::new(Role::Follower, state);
    let from = message.from;
    match &message.message {
        Message::Heartbeat { leader_term, commit_index, commit_index_term } => {
            heartbeat(state, &mut outcome, from, *leader_term, *commit_index, *commit_index_term)?
        }

        Message::AppendEntriesRequest {
            leader_term,
            prev_log_index,
            prev_log_term,
            entries,
            leader_commit,
        } => handle_append_entries_request(
            state,
            &mut outcome,
            from,
            *leader_term,
            *prev_log_index,
            *prev_log_term,
            entries,
            *leader_commit,
        )?,

        Message::VoteRequest { term, candidate, last_log_index, last_log_term } => {
            handle_vote_request(
                state,
                &mut outcome,
                from,
                *term,
                *candidate,
                *last_log_index,
                *last_log_term,
            )?
        }

        // Pre-votes are only granted once we've lost our leader, or never had
        // one, so a live leader can't be disrupted.
        Message::PreVoteRequest { term, last_log_index, last_log_term, .. } => {
            if state.supports_pre_voting() && (state.is_pre_election() || state.leader().is_none()) {
                handle_pre_vote_request(
                    state,
                    &mut outcome,
                    from,
                    *term,
                    *last_log_index,
                    *last_log_term,
                )?
            } else {
                decline_pre_vote_request(&mut outcome, from)
            }
        }

        Message::PreVoteResponse { term, granted } => {
            if *term > outcome.term {
                outcome.set_next_term(*term);
                outcome.is_pre_election = false;
            } else if *term == outcome.term && *granted && state.is_pre_election() {
                outcome.pre_votes_for_me.insert(from);
                if is_quorum_of(state.voting_members(), &outcome.pre_votes_for_me) {
                    info!("Won pre-election in term {}", outcome.term);
                    outcome.election_timeout_renewed = true;
                    outcome.is_pre_election = false;
                    start_real_election(state, &mut outcome)?;
                }
            }
        }

        // Responses from an earlier incarnation as candidate or leader only
        // matter for their term.
        Message::VoteResponse { term, .. } | Message::AppendEntriesResponse { term, .. } => {
            if *term > outcome.term {
                outcome.set_next_term(*term);
            }
        }

        Message::LogCompactionInfo { leader_term, prev_index } => {
            handle_log_compaction_info(state, &mut outcome, *leader_term, *prev_index)
        }

        Message::ElectionTimeout => match (state.supports_pre_voting(), state.refuses_to_be_leader()) {
            // Still take part in pre-elections, so other members can win one.
            (true, true) => outcome.is_pre_election = true,
            (true, false) => {
                start_pre_election(state, &mut outcome)?;
            }
            (false, false) => {
                start_real_election(state, &mut outcome)?;
            }
            (false, true) => debug!("Election timeout, but refusing to be leader"),
        },

        Message::NewEntryRequest { .. } | Message::NewEntryBatchRequest { .. } => {
            debug!("Dropping new entry request, not leader (leader is {:?})", state.leader())
        }

        Message::PruneRequest { prune_index } => handle_prune_request(&mut outcome, *prune_index),

        Message::HeartbeatResponse | Message::HeartbeatTimeout => {}
    }
    Ok(outcome)
}
