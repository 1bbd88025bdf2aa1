use super::TestCluster;
use raftcore::error::Result;
use raftcore::raft::{Content, Message, Role};
use raftcore::RaftConfig;

use pretty_assertions::assert_eq;

#[test]
fn replicates_and_commits() -> Result<()> {
    let mut cluster = TestCluster::new(&[1, 2, 3], RaftConfig::default())?;

    // 1 times out first, wins the pre-vote and the election in term 1, and
    // appends the barrier at index 0.
    cluster.election_timeout(1)?;
    assert_eq!(cluster.leader(), Some(1));
    assert_eq!(cluster.state(1)?.term, 1);
    for id in [1, 2, 3] {
        assert_eq!(cluster.state(id)?.commit_index, 0, "member {id}");
    }

    // "x" is shipped at index 1 and committed once both followers have it.
    cluster.propose(1, &["x"])?;
    let shipped = cluster
        .delivered
        .iter()
        .filter(|e| matches!(&e.message.message, Message::AppendEntriesRequest { prev_log_index: 0, entries, .. } if entries.len() == 1))
        .map(|e| e.to)
        .collect::<Vec<_>>();
    assert_eq!(shipped, vec![2, 3]);
    for id in [1, 2, 3] {
        let state = cluster.state(id)?;
        assert_eq!((state.append_index, state.commit_index), (1, 1), "member {id}");
    }

    cluster.propose(1, &["a", "b"])?;
    assert_eq!(cluster.commit_indexes()?.into_values().collect::<Vec<_>>(), vec![3, 3, 3]);
    Ok(())
}

#[test]
fn followers_ignore_proposals() -> Result<()> {
    let mut cluster = TestCluster::new(&[1, 2, 3], RaftConfig::default())?;
    cluster.elect(1)?;
    cluster.propose(2, &["a"])?;
    for id in [1, 2, 3] {
        assert_eq!(cluster.state(id)?.append_index, 0);
    }
    Ok(())
}

#[test]
fn batch_proposal() -> Result<()> {
    let mut cluster = TestCluster::new(&[1, 2, 3], RaftConfig::default())?;
    cluster.elect(1)?;
    let contents = ["a", "b", "c", "d"].iter().map(|v| Content::Data(v.as_bytes().to_vec())).collect();
    cluster.local(1, Message::NewEntryBatchRequest { contents })?;
    cluster.settle()?;
    assert_eq!(cluster.commit_indexes()?.into_values().collect::<Vec<_>>(), vec![4, 4, 4]);
    Ok(())
}

#[test]
fn commits_with_minority_down() -> Result<()> {
    let mut cluster = TestCluster::new(&[1, 2, 3], RaftConfig::default())?;
    cluster.elect(1)?;
    cluster.isolate(3);
    cluster.propose(1, &["a", "b"])?;
    assert_eq!(cluster.state(1)?.commit_index, 2);
    assert_eq!(cluster.state(2)?.commit_index, 2);
    assert_eq!(cluster.state(3)?.append_index, 0);
    Ok(())
}

#[test]
fn does_not_commit_without_majority() -> Result<()> {
    let mut cluster = TestCluster::new(&[1, 2, 3], RaftConfig::default())?;
    cluster.elect(1)?;
    cluster.isolate(2);
    cluster.isolate(3);
    cluster.propose(1, &["a"])?;
    let state = cluster.state(1)?;
    assert_eq!((state.role, state.append_index, state.commit_index), (Role::Leader, 1, 0));
    Ok(())
}

#[test]
fn lagging_follower_catches_up() -> Result<()> {
    // Shippers resend on every heartbeat tick.
    let config = RaftConfig {
        catchup_batch_size: 2,
        max_allowed_shipping_lag: 2,
        log_shipping_retry_ms: 0,
        ..Default::default()
    };
    let mut cluster = TestCluster::new(&[1, 2, 3], config)?;
    cluster.elect(1)?;

    // While 3 is away, the shipper keeps pipelining until 3 falls too far
    // behind, and then stops streaming to it.
    cluster.isolate(3);
    cluster.propose(1, &["a", "b", "c", "d", "e", "f"])?;
    assert_eq!(cluster.state(3)?.append_index, 0);

    // Once back, the shipper resends on the next tick, and 3 catches up in
    // batches.
    cluster.heal();
    cluster.propose(1, &["g"])?;
    for _ in 0..10 {
        cluster.heartbeat(1)?;
    }
    let state = cluster.state(3)?;
    assert_eq!((state.append_index, state.commit_index), (7, 7));
    Ok(())
}

#[test]
fn new_leader_overwrites_uncommitted_entries() -> Result<()> {
    let config = RaftConfig { log_shipping_retry_ms: 0, ..Default::default() };
    let mut cluster = TestCluster::new(&[1, 2, 3], config)?;
    cluster.elect(1)?;
    cluster.propose(1, &["a"])?;

    // The old leader appends entries that never reach the others.
    cluster.isolate(1);
    cluster.propose(1, &["lost", "lost"])?;
    assert_eq!(cluster.state(1)?.append_index, 3);

    cluster.elect(2)?;
    cluster.propose(2, &["b"])?;
    // The old leader steps down on its second check-quorum timeout.
    cluster.heal();
    cluster.local(1, Message::ElectionTimeout)?;
    cluster.local(1, Message::ElectionTimeout)?;
    cluster.settle()?;
    assert_eq!(cluster.state(1)?.role, Role::Follower);
    for _ in 0..5 {
        cluster.heartbeat(2)?;
    }

    // 1 now has the new leader's log: a, barrier of term 2, and b.
    for id in [1, 2, 3] {
        let state = cluster.state(id)?;
        assert_eq!((state.term, state.append_index, state.commit_index), (2, 3, 3), "member {id}");
    }
    Ok(())
}

#[test]
fn duplicate_append_is_idempotent() -> Result<()> {
    let mut cluster = TestCluster::new(&[1, 2, 3], RaftConfig::default())?;
    cluster.elect(1)?;
    cluster.propose(1, &["a", "b"])?;
    let summary = |cluster: &TestCluster| -> Result<_> {
        let state = cluster.state(2)?;
        Ok((state.term, state.leader, state.append_index, state.commit_index))
    };
    let before = summary(&cluster)?;

    let appends: Vec<_> = cluster
        .delivered
        .iter()
        .filter(|e| e.to == 2 && matches!(&e.message.message, Message::AppendEntriesRequest { entries, .. } if !entries.is_empty()))
        .cloned()
        .collect();
    assert!(!appends.is_empty());
    for append in appends {
        cluster.deliver(append)?;
    }
    cluster.settle()?;
    assert_eq!(summary(&cluster)?, before);
    assert_eq!(cluster.state(1)?.commit_index, 2);
    Ok(())
}

#[test]
fn ships_new_entries_once_per_follower() -> Result<()> {
    let mut cluster = TestCluster::new(&[1, 2, 3], RaftConfig::default())?;
    cluster.elect(1)?;
    cluster.propose(1, &["a"])?;
    assert_eq!(cluster.state(1)?.replication_members, [1, 2, 3].into());

    let sent = cluster
        .delivered
        .iter()
        .filter(|e| matches!(&e.message.message, Message::AppendEntriesRequest { prev_log_index: 0, entries, .. } if entries.len() == 1))
        .count();
    assert_eq!(sent, 2);
    Ok(())
}
