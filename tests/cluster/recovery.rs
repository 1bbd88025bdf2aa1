use super::TestCluster;
use raftcore::error::Result;
use raftcore::raft::{
    Envelope, MemberSet, MemoryLog, Message, RaftMessage, Role, SnapshotDownloader, Stores,
};
use raftcore::RaftConfig;

use pretty_assertions::assert_eq;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

fn on_disk(dir: &Path, id: u64) -> Result<Stores> {
    Stores::on_disk(dir.join(id.to_string()), Box::new(MemoryLog::new()), [1, 2, 3].into())
}

#[test]
fn restart_restores_term_vote_and_membership() -> Result<()> {
    let dir = tempfile::TempDir::with_prefix("raftcore")?;
    let mut cluster = TestCluster::new(&[], RaftConfig::default())?;
    for id in [1, 2, 3] {
        cluster.add(id, on_disk(dir.path(), id)?)?;
    }
    cluster.elect(1)?;

    cluster.add(2, on_disk(dir.path(), 2)?)?;
    let state = cluster.state(2)?;
    assert_eq!((state.role, state.term, state.voted_for, state.leader), (Role::Follower, 1, Some(1), None));
    assert_eq!(state.voting_members, MemberSet::from([1, 2, 3]));

    // The durable vote keeps the restarted member from voting twice in a term.
    let request = Message::VoteRequest { term: 1, candidate: 3, last_log_index: 5, last_log_term: 1 };
    cluster.deliver(Envelope { to: 2, message: RaftMessage::new(3, request) })?;
    let response = cluster.take(0).map(|envelope| (envelope.to, envelope.message));
    assert_eq!(response, Some((3, RaftMessage::new(2, Message::VoteResponse { term: 1, granted: false }))));
    Ok(())
}

struct Downloads(AtomicUsize);

impl SnapshotDownloader for Downloads {
    fn schedule_download(&self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn lagging_follower_downloads_snapshot_after_prune() -> Result<()> {
    let config = RaftConfig { log_shipping_retry_ms: 0, ..Default::default() };
    let mut cluster = TestCluster::new(&[1, 2, 3], config)?;
    let downloads = Arc::new(Downloads(AtomicUsize::new(0)));
    cluster.machine(3).set_snapshot_downloader(downloads.clone())?;
    cluster.elect(1)?;

    cluster.isolate(3);
    cluster.propose(1, &["a", "b", "c"])?;
    cluster.local(1, Message::PruneRequest { prune_index: 2 })?;
    assert_eq!(downloads.0.load(Ordering::SeqCst), 0);

    cluster.heal();
    cluster.heartbeat(1)?;
    assert_eq!(downloads.0.load(Ordering::SeqCst), 1);
    assert_eq!(cluster.state(3)?.append_index, 0);
    Ok(())
}
