use super::TestCluster;
use raftcore::error::Result;
use raftcore::raft::{Envelope, Message, Role};
use raftcore::RaftConfig;

use pretty_assertions::assert_eq;
use rand::{Rng as _, SeedableRng as _};

#[test]
fn elects_leader() -> Result<()> {
    let mut cluster = TestCluster::new(&[1, 2, 3], RaftConfig::default())?;
    cluster.elect(1)?;

    for id in [1, 2, 3] {
        let state = cluster.state(id)?;
        assert_eq!((state.term, state.leader, state.commit_index), (1, Some(1), 0), "member {id}");
    }
    assert_eq!(cluster.state(2)?.role, Role::Follower);
    assert_eq!(cluster.machine(3).leader_info()?.member, Some(1));
    Ok(())
}

#[test]
fn fresh_cluster_elects_first_to_time_out() -> Result<()> {
    let mut cluster = TestCluster::new(&[1, 2, 3], RaftConfig::default())?;

    // Nobody has a leader yet, so a single timeout wins the pre-vote, and then
    // the election in term 1.
    cluster.election_timeout(1)?;
    assert_eq!(cluster.leader(), Some(1));
    for id in [1, 2, 3] {
        let state = cluster.state(id)?;
        assert_eq!((state.term, state.leader), (1, Some(1)), "member {id}");
    }
    Ok(())
}

#[test]
fn pre_vote_requires_leaderless_majority() -> Result<()> {
    let mut cluster = TestCluster::new(&[1, 2, 3], RaftConfig::default())?;
    cluster.elect(1)?;
    cluster.isolate(1);

    // 3 still follows 1, so it declines 2's pre-vote.
    cluster.election_timeout(2)?;
    for id in [2, 3] {
        let state = cluster.state(id)?;
        assert_eq!((state.role, state.term), (Role::Follower, 1), "member {id}");
    }

    // Once 3 times out too, 2 grants its pre-vote and 3 is elected.
    cluster.election_timeout(3)?;
    assert_eq!(cluster.leader(), Some(3));
    assert_eq!(cluster.state(2)?.term, 2);
    Ok(())
}

#[test]
fn pre_vote_keeps_rejoining_member_from_disrupting() -> Result<()> {
    let mut cluster = TestCluster::new(&[1, 2, 3], RaftConfig::default())?;
    cluster.elect(1)?;

    cluster.isolate(3);
    for _ in 0..5 {
        cluster.election_timeout(3)?;
    }
    assert_eq!(cluster.state(3)?.term, 1);

    // When it rejoins, the leader is undisturbed and simply picks it back up.
    cluster.heal();
    cluster.election_timeout(3)?;
    cluster.heartbeat(1)?;
    assert_eq!(cluster.leader(), Some(1));
    for id in [1, 2, 3] {
        assert_eq!(cluster.state(id)?.term, 1, "member {id}");
    }
    Ok(())
}

#[test]
fn without_pre_vote_isolated_member_bumps_term() -> Result<()> {
    let config = RaftConfig { enable_pre_voting: false, ..Default::default() };
    let mut cluster = TestCluster::new(&[1, 2, 3], config)?;
    cluster.elect(1)?;

    cluster.isolate(3);
    cluster.election_timeout(3)?;
    cluster.election_timeout(3)?;
    let state = cluster.state(3)?;
    assert_eq!((state.role, state.term), (Role::Candidate, 3));
    Ok(())
}

#[test]
fn leader_steps_down_without_quorum() -> Result<()> {
    let mut cluster = TestCluster::new(&[1, 2, 3], RaftConfig::default())?;
    cluster.elect(1)?;
    cluster.heartbeat(1)?;

    // Heartbeat responses from before the partition last one election timeout.
    cluster.isolate(1);
    cluster.heartbeat(1)?;
    cluster.election_timeout(1)?;
    assert_eq!(cluster.state(1)?.role, Role::Leader);
    cluster.election_timeout(1)?;
    let state = cluster.state(1)?;
    assert_eq!((state.role, state.leader), (Role::Follower, None));
    assert!(cluster.machine(1).leader_info()?.stepping_down);

    // The majority elects a new leader, which the old one follows once healed.
    cluster.elect(2)?;
    cluster.heal();
    cluster.heartbeat(2)?;
    let state = cluster.state(1)?;
    assert_eq!((state.term, state.leader), (2, Some(2)));
    Ok(())
}

#[test]
fn members_refusing_to_lead_still_vote() -> Result<()> {
    let config = RaftConfig { refuse_to_be_leader: true, ..Default::default() };
    let mut cluster = TestCluster::new(&[1, 2, 3], config)?;
    for _ in 0..3 {
        for id in [1, 2, 3] {
            cluster.election_timeout(id)?;
        }
    }
    assert_eq!(cluster.leader(), None);
    for id in [1, 2, 3] {
        assert_eq!(cluster.state(id)?.term, 0);
    }

    // A single member willing to lead is elected with their votes.
    cluster.config.refuse_to_be_leader = false;
    let stores = raftcore::raft::Stores::in_memory([1, 2, 3].into());
    cluster.add(1, stores)?;
    cluster.election_timeout(1)?;
    assert_eq!(cluster.leader(), Some(1));
    Ok(())
}

/// Delivers messages in random order with random drops and duplicates, and
/// random timeouts, and checks that there is never more than one leader per
/// term and that commit indexes never regress.
#[test]
fn election_safety_under_chaos() -> Result<()> {
    for seed in 0..20 {
        let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
        let ids = [1, 2, 3, 4, 5];
        let mut cluster = TestCluster::new(&ids, RaftConfig::default())?;
        let mut commits = cluster.commit_indexes()?;
        let mut term_leaders = std::collections::BTreeMap::new();

        for step in 0..2000 {
            let id = ids[rng.gen_range(0..ids.len())];
            match rng.gen_range(0..100) {
                0..=2 => cluster.local(id, Message::ElectionTimeout)?,
                3..=7 => cluster.local(id, Message::HeartbeatTimeout)?,
                8..=9 => {
                    let content = raftcore::raft::Content::Data(format!("{seed}/{step}").into_bytes());
                    cluster.local(id, Message::NewEntryRequest { content })?;
                }
                _ => {
                    let pending = cluster.pending();
                    if pending > 0 {
                        let envelope: Envelope =
                            cluster.take(rng.gen_range(0..pending)).expect("pending message");
                        match rng.gen_range(0..10) {
                            0 => {}
                            1 => {
                                cluster.deliver(envelope.clone())?;
                                cluster.deliver(envelope)?;
                            }
                            _ => {
                                cluster.deliver(envelope)?;
                            }
                        }
                    }
                }
            }

            for (term, leaders) in cluster.leaders()? {
                for leader in leaders {
                    let known = *term_leaders.entry(term).or_insert(leader);
                    assert_eq!(known, leader, "two leaders in term {term} (seed {seed})");
                }
            }
            let current = cluster.commit_indexes()?;
            for (id, commit) in &current {
                assert!(*commit >= commits[id], "commit index of {id} regressed (seed {seed})");
            }
            commits = current;
        }
    }
    Ok(())
}
