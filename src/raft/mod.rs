//! The Raft consensus core of a replicated database cluster.
//!
//! For background, see Diego Ongaro's original writings:
//!
//! * Raft paper: <https://raft.github.io/raft.pdf>
//! * Raft thesis: <https://web.stanford.edu/~ouster/cgi-bin/papers/OngaroPhD.pdf>
//!
//! A set of core members agree on a single ordered log of replicated entries.
//! At most one leader exists per term, and an entry that has been committed
//! survives the failure of any minority of members.
//!
//! STRUCTURE
//! =========
//!
//! Message handling is split into a pure part and a side-effecting part:
//!
//! * Roles (`Role::Follower`, `Role::Candidate`, `Role::Leader`) take an
//!   inbound `RaftMessage` and a read-only `RaftState`, and return an
//!   `Outcome`. They never mutate state or perform I/O. This makes each
//!   transition easy to test in isolation.
//!
//! * The `RaftMachine` owns the `RaftState`. It handles one message at a time
//!   under a mutex, asks the current role for an `Outcome`, applies it to the
//!   state (log commands first, then term and vote, then volatile fields) and
//!   then dispatches the side effects: outbound messages, timer renewals, log
//!   shipping commands, membership updates and leader listener callbacks.
//!
//! Timers (`LeaderAvailabilityTimers`) fire on their own threads, but only
//! ever feed `ElectionTimeout` and `HeartbeatTimeout` messages back into the
//! machine. They never touch state directly.
//!
//! ELECTIONS
//! =========
//!
//! Members start out as leaderless followers. When a follower hasn't heard from
//! a leader within its randomized election timeout, it first holds a pre-vote:
//! it asks the other voting members whether they would vote for it, without
//! bumping its term. Members only grant a pre-vote if they have themselves lost
//! contact with the leader, or don't know of one yet. This prevents a member
//! that rejoins after a partition from disrupting a healthy leader with a
//! needlessly high term.
//!
//! Once a quorum has granted the pre-vote, the member becomes a candidate,
//! increments its term, votes for itself and solicits real votes. A candidate
//! that wins a quorum becomes leader and appends a `NewLeaderBarrier` entry,
//! which lets it commit entries from previous terms.
//!
//! Leaders send periodic heartbeats, and record heartbeat responses. If a
//! leader hasn't heard from a quorum within an election timeout it steps down
//! (check-quorum), since it is likely partitioned away from the majority.
//!
//! REPLICATION
//! ===========
//!
//! Leaders append new entries locally and hand them to the `LogShipping`
//! manager, which runs one shipper per follower. A shipper searches for a
//! matching log prefix when the follower's log diverges, pipelines new entries
//! when the follower is up to date, and sends bounded catch-up batches when it
//! lags behind. Entries are read from an in-flight cache before falling back
//! to the log store. If the entries a follower needs have been pruned, the
//! follower is told to download a snapshot instead.
//!
//! Followers reply with their match index, and the leader advances the commit
//! index to the highest index appended by a quorum of voting members, as long
//! as that entry is from the leader's own term.
//!
//! MEMBERSHIP
//! ==========
//!
//! Membership entries take effect as they commit: the voting set is the
//! committed configuration, and a member being removed still counts towards
//! quorums and is replicated to until its removal commits. The leader moves
//! the voting set towards a target set (supplied by discovery) one member at a
//! time, and never proposes a change
//! while another is uncommitted. New members are first caught up as
//! non-voting learners, and the leader never removes itself.

mod cache;
mod log;
mod machine;
mod membership;
mod message;
mod outcome;
mod quorum;
mod role;
mod shipping;
mod state;
mod timers;
mod transport;

pub use cache::InFlightCache;
pub use log::{Content, Entry, MemoryLog, RaftLog};
pub use machine::{
    LeaderCell, LeaderInfo, LeaderListener, RaftCoreState, RaftMachine, SnapshotDownloader, Stores,
};
pub use membership::{MembershipEntry, MembershipManager, MembershipState};
pub use message::{
    ClusterId, Directed, Envelope, Message, MessageType, RaftMessage, Received,
};
pub use outcome::{LogCommand, Outcome, ShipCommand};
pub use quorum::{is_quorum, is_quorum_of, is_quorum_with_min, quorum_append_index, MIN_QUORUM};
pub use role::Role;
pub use shipping::{LeaderContext, LogShipper, LogShipping, ShipperMode};
pub use state::{ExposedRaftState, FollowerState, FollowerStates, RaftState, TermState, VoteState};
pub use timers::{LeaderAvailabilityTimers, Timer};
pub use transport::{InboundHandler, Outbound};

use std::collections::BTreeSet;

/// A cluster member ID.
pub type MemberId = u64;

/// A set of cluster members. Ordered, for deterministic iteration.
pub type MemberSet = BTreeSet<MemberId>;

/// A leader term. Starts at 0, or -1 for an unknown term (e.g. the term of an
/// entry that does not exist).
pub type Term = i64;

/// A log index. The first entry has index 0, and -1 means no index.
pub type Index = i64;

/// The index of a nonexistent log entry.
pub const NO_INDEX: Index = -1;

/// The term of a nonexistent log entry.
pub const NO_TERM: Term = -1;
