use super::TestCluster;
use raftcore::error::Result;
use raftcore::raft::{MemberSet, Stores};
use raftcore::RaftConfig;

use pretty_assertions::assert_eq;

/// A three-member cluster with a fourth member that isn't a voter yet.
fn cluster_with_spare() -> Result<TestCluster> {
    let mut cluster = TestCluster::new(&[1, 2, 3], RaftConfig::default())?;
    cluster.add(4, Stores::in_memory([1, 2, 3].into()))?;
    cluster.elect(1)?;
    cluster.propose(1, &["a"])?;
    assert_eq!(cluster.state(4)?.append_index, -1);
    Ok(cluster)
}

#[test]
fn adds_member_once_caught_up() -> Result<()> {
    let mut cluster = cluster_with_spare()?;
    cluster.machine(1).set_target_members([1, 2, 3, 4].into())?;
    cluster.heartbeat(1)?;

    // 4 is caught up as a learner, then the leader appends the new membership
    // at index 2 and commits it with the old majority.
    for id in [1, 2, 3, 4] {
        let state = cluster.state(id)?;
        assert_eq!(state.voting_members, MemberSet::from([1, 2, 3, 4]), "member {id}");
        assert_eq!((state.append_index, state.commit_index), (2, 2), "member {id}");
    }
    let core = cluster.machine(1).core_state()?;
    assert_eq!(core.membership.committed().map(|e| e.log_index), Some(2));
    assert_eq!(core.membership.appended(), None);

    // Further ticks change nothing.
    cluster.heartbeat(1)?;
    assert_eq!(cluster.state(1)?.append_index, 2);
    Ok(())
}

#[test]
fn removes_members_but_never_the_leader() -> Result<()> {
    let mut cluster = cluster_with_spare()?;
    cluster.machine(1).set_target_members([1, 2, 3, 4].into())?;
    cluster.heartbeat(1)?;

    cluster.machine(1).set_target_members([2, 3].into())?;
    cluster.heartbeat(1)?;
    cluster.heartbeat(1)?;

    // 4 is removed at index 3. The leader itself stays.
    let state = cluster.state(1)?;
    assert_eq!(state.voting_members, MemberSet::from([1, 2, 3]));
    assert_eq!(state.replication_members, MemberSet::from([1, 2, 3]));
    assert_eq!((state.append_index, state.commit_index), (3, 3));
    for id in [2, 3, 4] {
        let state = cluster.state(id)?;
        assert_eq!(state.voting_members, MemberSet::from([1, 2, 3]), "member {id}");
        assert_eq!(state.commit_index, 3, "member {id}");
    }

    // The removed member learned of its removal, and stays quiet.
    cluster.election_timeout(4)?;
    assert_eq!(cluster.state(4)?.term, 1);
    assert_eq!(cluster.leader(), Some(1));
    Ok(())
}

#[test]
fn removed_member_counts_until_removal_commits() -> Result<()> {
    let mut cluster = cluster_with_spare()?;
    cluster.machine(1).set_target_members([1, 2, 3, 4].into())?;
    cluster.heartbeat(1)?;

    // With 3 and 4 away, the removal of 4 can't reach a majority of the old
    // configuration, so it stays uncommitted and 4 still votes.
    cluster.isolate(3);
    cluster.isolate(4);
    cluster.machine(1).set_target_members([1, 2, 3].into())?;
    cluster.heartbeat(1)?;
    let state = cluster.state(1)?;
    assert_eq!((state.append_index, state.commit_index), (3, 2));
    assert_eq!(state.voting_members, MemberSet::from([1, 2, 3, 4]));
    assert_eq!(state.replication_members, MemberSet::from([1, 2, 3, 4]));
    assert!(cluster.machine(1).core_state()?.membership.uncommitted_member_change_in_log());

    cluster.heal();
    cluster.propose(1, &["b"])?;
    let state = cluster.state(1)?;
    assert_eq!((state.commit_index, state.voting_members), (4, MemberSet::from([1, 2, 3])));
    Ok(())
}

#[test]
fn non_voter_never_starts_elections() -> Result<()> {
    let mut cluster = TestCluster::new(&[1, 2, 3], RaftConfig::default())?;
    cluster.add(4, Stores::in_memory([1, 2, 3].into()))?;
    for _ in 0..3 {
        cluster.election_timeout(4)?;
    }
    let state = cluster.state(4)?;
    assert_eq!((state.term, state.leader), (0, None));
    assert_eq!(cluster.pending(), 0);
    Ok(())
}

#[test]
fn installs_core_state() -> Result<()> {
    let mut cluster = cluster_with_spare()?;
    cluster.machine(1).set_target_members([1, 2, 3, 4].into())?;
    cluster.heartbeat(1)?;

    // A fresh member installs the membership from the leader's snapshot.
    let core = cluster.machine(1).core_state()?;
    cluster.add(5, Stores::in_memory(MemberSet::new()))?;
    cluster.machine(5).install_core_state(core.clone())?;
    assert_eq!(cluster.machine(5).core_state()?, core);
    assert_eq!(cluster.state(5)?.voting_members, MemberSet::from([1, 2, 3, 4]));
    Ok(())
}
