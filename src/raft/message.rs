use super::{Content, Entry, Index, MemberId, Term};
use crate::encoding;

use serde::{Deserialize, Serialize};
use std::time::Instant;

/// A message received from (or sent to) a cluster member, tagged with the
/// sender's identity.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RaftMessage {
    /// The sender.
    pub from: MemberId,
    /// The message payload.
    pub message: Message,
}

impl encoding::Value for RaftMessage {}

impl RaftMessage {
    /// Creates a new message from the given sender.
    pub fn new(from: MemberId, message: Message) -> Self {
        Self { from, message }
    }

    /// Returns the message type.
    pub fn message_type(&self) -> MessageType {
        self.message.message_type()
    }
}

/// The Raft protocol messages. The set is closed: every role handles every
/// variant via an exhaustive match, with at worst a no-op outcome.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Message {
    /// Candidates solicit votes from all voting members after bumping their
    /// term.
    VoteRequest {
        /// The candidate's term.
        term: Term,
        /// The candidate requesting the vote.
        candidate: MemberId,
        /// The index of the candidate's last log entry.
        last_log_index: Index,
        /// The term of the candidate's last log entry.
        last_log_term: Term,
    },
    /// A vote response. A member grants at most one vote per term.
    VoteResponse {
        /// The voter's term.
        term: Term,
        /// Whether the vote was granted.
        granted: bool,
    },

    /// Like VoteRequest, but checks whether an election could be won without
    /// bumping the term.
    PreVoteRequest { term: Term, candidate: MemberId, last_log_index: Index, last_log_term: Term },
    /// A pre-vote response. Granting a pre-vote has no lasting effect.
    PreVoteResponse { term: Term, granted: bool },

    /// Leaders replicate entries to followers. Entries may be empty, to search
    /// for a matching log prefix.
    AppendEntriesRequest {
        /// The leader's term.
        leader_term: Term,
        /// The index of the entry immediately preceding the given entries.
        prev_log_index: Index,
        /// The term of the entry immediately preceding the given entries.
        prev_log_term: Term,
        /// The entries to append.
        entries: Vec<Entry>,
        /// The leader's commit index.
        leader_commit: Index,
    },
    /// A follower's response to AppendEntriesRequest.
    AppendEntriesResponse {
        /// The follower's term.
        term: Term,
        /// Whether the entries were appended.
        success: bool,
        /// The last index known to match the leader's log, or -1 on failure.
        match_index: Index,
        /// The follower's last appended index.
        append_index: Index,
    },

    /// Leaders send periodic heartbeats to assert leadership and propagate the
    /// commit index.
    Heartbeat {
        /// The leader's term.
        leader_term: Term,
        /// The leader's commit index.
        commit_index: Index,
        /// The term of the entry at the commit index.
        commit_index_term: Term,
    },
    /// Followers acknowledge heartbeats, which lets the leader verify that it
    /// still has a quorum.
    HeartbeatResponse,

    /// Tells a follower that the leader no longer has the entries it needs,
    /// since they have been pruned from the leader's log.
    LogCompactionInfo {
        /// The leader's term.
        leader_term: Term,
        /// The leader's log prev index, i.e. the last pruned index.
        prev_index: Index,
    },

    /// The local election timer fired.
    ElectionTimeout,
    /// The local heartbeat timer fired.
    HeartbeatTimeout,

    /// A client proposes a new entry. Only leaders act on it.
    NewEntryRequest { content: Content },
    /// A client proposes a batch of new entries.
    NewEntryBatchRequest { contents: Vec<Content> },

    /// Prunes the local log up to the given index, typically after a snapshot.
    PruneRequest { prune_index: Index },
}

impl Message {
    /// Returns the message type.
    pub fn message_type(&self) -> MessageType {
        match self {
            Self::VoteRequest { .. } => MessageType::VoteRequest,
            Self::VoteResponse { .. } => MessageType::VoteResponse,
            Self::PreVoteRequest { .. } => MessageType::PreVoteRequest,
            Self::PreVoteResponse { .. } => MessageType::PreVoteResponse,
            Self::AppendEntriesRequest { .. } => MessageType::AppendEntriesRequest,
            Self::AppendEntriesResponse { .. } => MessageType::AppendEntriesResponse,
            Self::Heartbeat { .. } => MessageType::Heartbeat,
            Self::HeartbeatResponse => MessageType::HeartbeatResponse,
            Self::LogCompactionInfo { .. } => MessageType::LogCompactionInfo,
            Self::ElectionTimeout => MessageType::ElectionTimeout,
            Self::HeartbeatTimeout => MessageType::HeartbeatTimeout,
            Self::NewEntryRequest { .. } => MessageType::NewEntryRequest,
            Self::NewEntryBatchRequest { .. } => MessageType::NewEntryBatchRequest,
            Self::PruneRequest { .. } => MessageType::PruneRequest,
        }
    }

    /// Returns the term carried by the message, if any. Timeouts, client
    /// requests and heartbeat responses carry no term.
    pub fn term(&self) -> Option<Term> {
        match self {
            Self::VoteRequest { term, .. }
            | Self::VoteResponse { term, .. }
            | Self::PreVoteRequest { term, .. }
            | Self::PreVoteResponse { term, .. }
            | Self::AppendEntriesResponse { term, .. } => Some(*term),
            Self::AppendEntriesRequest { leader_term, .. }
            | Self::Heartbeat { leader_term, .. }
            | Self::LogCompactionInfo { leader_term, .. } => Some(*leader_term),
            Self::HeartbeatResponse
            | Self::ElectionTimeout
            | Self::HeartbeatTimeout
            | Self::NewEntryRequest { .. }
            | Self::NewEntryBatchRequest { .. }
            | Self::PruneRequest { .. } => None,
        }
    }
}

/// A message type tag. The order is part of the wire format and must not
/// change.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum MessageType {
    VoteRequest,
    VoteResponse,
    AppendEntriesRequest,
    AppendEntriesResponse,
    Heartbeat,
    HeartbeatResponse,
    LogCompactionInfo,
    ElectionTimeout,
    HeartbeatTimeout,
    NewEntryRequest,
    NewEntryBatchRequest,
    PruneRequest,
    PreVoteRequest,
    PreVoteResponse,
}

/// An outbound message produced by a role handler, addressed to a member. The
/// machine stamps it with the local member as sender.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Directed {
    /// The recipient.
    pub to: MemberId,
    /// The message.
    pub message: Message,
}

impl Directed {
    pub fn new(to: MemberId, message: Message) -> Self {
        Self { to, message }
    }
}

/// A message in transit between members, as handed to the outbound transport.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Envelope {
    /// The recipient.
    pub to: MemberId,
    /// The message, including the sender.
    pub message: RaftMessage,
}

impl encoding::Value for Envelope {}

/// Identifies a cluster. Members only accept messages for the cluster they
/// are bound to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClusterId(pub uuid::Uuid);

impl ClusterId {
    /// Generates a new random cluster ID.
    pub fn random() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl std::fmt::Display for ClusterId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An inbound message as delivered by the transport, with its receive time and
/// the cluster it was sent for.
#[derive(Clone, Debug, PartialEq)]
pub struct Received {
    /// The message.
    pub message: RaftMessage,
    /// When the message was received.
    pub received_at: Instant,
    /// The cluster the sender believes it belongs to.
    pub cluster_id: ClusterId,
}

impl Received {
    pub fn new(message: RaftMessage, cluster_id: ClusterId) -> Self {
        Self { message, received_at: Instant::now(), cluster_id }
    }
}
