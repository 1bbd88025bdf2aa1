//! Cluster tests. These run several Raft machines in-process, connected by a
//! shared message queue that the test pumps by hand. Timers are never started:
//! election and heartbeat timeouts are injected explicitly, so every test is
//! deterministic.

mod election;
mod membership;
mod recovery;
mod replication;

use raftcore::error::Result;
use raftcore::raft::{
    Content, Envelope, ExposedRaftState, MemberId, MemberSet, Message, RaftMachine, RaftMessage,
    Role, Stores, Term,
};
use raftcore::RaftConfig;

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

/// A test cluster with a hand-pumped network.
pub struct TestCluster {
    pub config: RaftConfig,
    pub machines: BTreeMap<MemberId, Arc<RaftMachine>>,
    tx: crossbeam::channel::Sender<Envelope>,
    rx: crossbeam::channel::Receiver<Envelope>,
    /// Messages taken off the channel but not yet delivered.
    queue: VecDeque<Envelope>,
    /// Isolated members. Messages to or from them are dropped.
    isolated: MemberSet,
    /// Every delivered message, in delivery order.
    pub delivered: Vec<Envelope>,
}

impl TestCluster {
    /// Creates a cluster of in-memory members, all bootstrapped with the given
    /// member set.
    pub fn new(ids: &[MemberId], config: RaftConfig) -> Result<Self> {
        let (tx, rx) = crossbeam::channel::unbounded();
        let mut cluster = Self {
            config,
            machines: BTreeMap::new(),
            tx,
            rx,
            queue: VecDeque::new(),
            isolated: MemberSet::new(),
            delivered: Vec::new(),
        };
        let members: MemberSet = ids.iter().copied().collect();
        for id in ids {
            cluster.add(*id, Stores::in_memory(members.clone()))?;
        }
        Ok(cluster)
    }

    /// Adds (or replaces) a member with the given stores.
    pub fn add(&mut self, id: MemberId, stores: Stores) -> Result<()> {
        let machine = RaftMachine::new(id, &self.config, stores, Arc::new(self.tx.clone()))?;
        self.machines.insert(id, Arc::new(machine));
        Ok(())
    }

    pub fn machine(&self, id: MemberId) -> &RaftMachine {
        &self.machines[&id]
    }

    pub fn state(&self, id: MemberId) -> Result<ExposedRaftState> {
        self.machine(id).state()
    }

    pub fn isolate(&mut self, id: MemberId) {
        self.isolated.insert(id);
    }

    pub fn heal(&mut self) {
        self.isolated.clear();
    }

    /// Moves sent messages from the channel into the queue.
    fn collect(&mut self) {
        self.queue.extend(self.rx.try_iter());
    }

    /// Returns the number of queued messages.
    pub fn pending(&mut self) -> usize {
        self.collect();
        self.queue.len()
    }

    /// Drops all queued messages.
    pub fn drop_pending(&mut self) {
        self.collect();
        self.queue.clear();
    }

    /// Takes the queued message at the given position, if any.
    pub fn take(&mut self, position: usize) -> Option<Envelope> {
        self.collect();
        self.queue.remove(position)
    }

    /// Delivers a message, unless either end is isolated. Returns true if it
    /// was delivered.
    pub fn deliver(&mut self, envelope: Envelope) -> Result<bool> {
        if self.isolated.contains(&envelope.to) || self.isolated.contains(&envelope.message.from) {
            return Ok(false);
        }
        let Some(machine) = self.machines.get(&envelope.to) else {
            return Ok(false);
        };
        machine.handle(envelope.message.clone())?;
        self.delivered.push(envelope);
        Ok(true)
    }

    /// Delivers messages in order until none are left.
    pub fn settle(&mut self) -> Result<()> {
        while let Some(envelope) = self.take(0) {
            self.deliver(envelope)?;
        }
        Ok(())
    }

    /// Injects a local message, such as a timeout, into a member.
    pub fn local(&self, id: MemberId, message: Message) -> Result<()> {
        self.machine(id).handle(RaftMessage::new(id, message))
    }

    /// Fires an election timeout and settles.
    pub fn election_timeout(&mut self, id: MemberId) -> Result<()> {
        self.local(id, Message::ElectionTimeout)?;
        self.settle()
    }

    /// Fires a heartbeat timeout and settles.
    pub fn heartbeat(&mut self, id: MemberId) -> Result<()> {
        self.local(id, Message::HeartbeatTimeout)?;
        self.settle()
    }

    /// Elects the given member. With pre-voting, connected members that still
    /// follow a leader decline pre-votes until they've lost that leader, so
    /// their election timeouts fire first, with their own pre-vote requests
    /// lost. Leaderless members need no help.
    pub fn elect(&mut self, id: MemberId) -> Result<()> {
        self.settle()?;
        if self.config.enable_pre_voting {
            let mut others = Vec::new();
            for (other, machine) in &self.machines {
                if *other != id && !self.isolated.contains(other) && machine.state()?.leader.is_some() {
                    others.push(*other);
                }
            }
            for other in others {
                self.local(other, Message::ElectionTimeout)?;
                self.drop_pending();
            }
        }
        self.election_timeout(id)?;
        assert_eq!(self.leader(), Some(id), "member {} was not elected", id);
        Ok(())
    }

    /// Proposes entries at the given member and settles.
    pub fn propose(&mut self, id: MemberId, values: &[&str]) -> Result<()> {
        for value in values {
            let content = Content::Data(value.as_bytes().to_vec());
            self.local(id, Message::NewEntryRequest { content })?;
        }
        self.settle()
    }

    /// Returns the current leader, if exactly one connected member is leader in
    /// the highest term.
    pub fn leader(&self) -> Option<MemberId> {
        let leaders = self.leaders().ok()?;
        let term = leaders.keys().next_back()?;
        match leaders[term].as_slice() {
            [leader] if !self.isolated.contains(leader) => Some(*leader),
            _ => None,
        }
    }

    /// Returns the members that consider themselves leader, by term.
    pub fn leaders(&self) -> Result<BTreeMap<Term, Vec<MemberId>>> {
        let mut leaders: BTreeMap<Term, Vec<MemberId>> = BTreeMap::new();
        for (id, machine) in &self.machines {
            let state = machine.state()?;
            if state.role == Role::Leader {
                leaders.entry(state.term).or_default().push(*id);
            }
        }
        Ok(leaders)
    }

    /// Returns the commit index of every member.
    pub fn commit_indexes(&self) -> Result<BTreeMap<MemberId, i64>> {
        self.machines.iter().map(|(id, m)| Ok((*id, m.state()?.commit_index))).collect()
    }
}
