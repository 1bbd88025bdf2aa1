use super::{
    Content, ExposedRaftState, LeaderAvailabilityTimers, LeaderContext, LogShipping, MemberId,
    MemberSet, MembershipManager, MembershipState, MemoryLog, Message, Outbound, RaftLog,
    RaftMessage, RaftState, Role, Term, TermState, VoteState,
};
use crate::config::RaftConfig;
use crate::error::{Error, Result};
use crate::storage::{File, Memory, StateStorage};

use log::{debug, error, info, warn};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::time::{Duration, Instant};

/// The durable stores of a member.
pub struct Stores {
    pub log: Box<dyn RaftLog>,
    pub term: Box<dyn StateStorage<TermState>>,
    pub vote: Box<dyn StateStorage<VoteState>>,
    pub membership: Box<dyn StateStorage<MembershipState>>,
}

impl Stores {
    /// In-memory stores, bootstrapped with the given members.
    pub fn in_memory(members: MemberSet) -> Self {
        Self {
            log: Box::new(MemoryLog::new()),
            term: Box::new(Memory::<TermState>::default()),
            vote: Box::new(Memory::<VoteState>::default()),
            membership: Box::new(Memory::new(MembershipState::bootstrap(members))),
        }
    }

    /// File-backed term, vote and membership stores in the given directory,
    /// using the given log. The membership is bootstrapped with the given
    /// members, unless one is already stored.
    pub fn on_disk(dir: impl AsRef<Path>, log: Box<dyn RaftLog>, members: MemberSet) -> Result<Self> {
        let dir = dir.as_ref();
        let mut membership = File::<MembershipState>::new(dir.join("membership"))?;
        if membership.initial_state()? == MembershipState::default() {
            membership.persist(&MembershipState::bootstrap(members))?;
        }
        Ok(Self {
            log,
            term: Box::new(File::<TermState>::new(dir.join("term"))?),
            vote: Box::new(File::<VoteState>::new(dir.join("vote"))?),
            membership: Box::new(membership),
        })
    }
}

/// The known leader as of a term.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LeaderInfo {
    /// The leader, if known.
    pub member: Option<MemberId>,
    /// The term.
    pub term: Term,
    /// True if the leader of the term has stepped down.
    pub stepping_down: bool,
}

impl LeaderInfo {
    pub const INITIAL: Self = Self { member: None, term: -1, stepping_down: false };

    pub fn new(member: Option<MemberId>, term: Term) -> Self {
        Self { member, term, stepping_down: false }
    }

    /// Returns the info of a leader that stepped down.
    pub fn step_down(&self) -> Self {
        Self { member: None, term: self.term, stepping_down: true }
    }
}

/// Holds the current leader info, and lets callers wait for a leader.
pub struct LeaderCell {
    info: Mutex<LeaderInfo>,
    changed: Condvar,
}

impl LeaderCell {
    fn new() -> Self {
        Self { info: Mutex::new(LeaderInfo::INITIAL), changed: Condvar::new() }
    }

    pub fn get(&self) -> Result<LeaderInfo> {
        Ok(self.info.lock()?.clone())
    }

    fn set(&self, info: LeaderInfo) -> Result<()> {
        *self.info.lock()? = info;
        self.changed.notify_all();
        Ok(())
    }

    /// Waits for a leader to become known, up to the given timeout.
    pub fn await_leader(&self, timeout: Duration) -> Result<MemberId> {
        let info = self.info.lock()?;
        let (info, _) = self.changed.wait_timeout_while(info, timeout, |info| info.member.is_none())?;
        info.member.ok_or(Error::NoLeader)
    }
}

/// Notified of leader changes. Listeners are called while the machine
/// handles a message, and must not call back into the machine.
pub trait LeaderListener: Send + Sync {
    /// Called when a new leader becomes known.
    fn on_leader_switch(&self, info: &LeaderInfo);

    /// Called when the local leader of the given term steps down.
    fn on_leader_step_down(&self, _step_down_term: Term) {}
}

/// Downloads a snapshot from the leader, when our log is too far behind to
/// catch up via log shipping. The download happens asynchronously.
pub trait SnapshotDownloader: Send + Sync {
    fn schedule_download(&self);
}

/// The Raft state that travels with snapshots.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RaftCoreState {
    pub membership: MembershipState,
}

/// State guarded by the machine's mutex.
struct Inner {
    state: RaftState,
    membership: MembershipManager,
    shipping: LogShipping,
    outbound: Arc<dyn Outbound>,
}

/// The Raft machine drives a single member. Messages, including timeouts,
/// are handled one at a time: the current role decides on an outcome, which
/// is applied to the state before its side effects are performed.
///
/// An error while handling a message means that durable state may be
/// inconsistent, so the machine stops handling messages altogether.
pub struct RaftMachine {
    me: MemberId,
    inner: Mutex<Inner>,
    timers: LeaderAvailabilityTimers,
    leader: LeaderCell,
    listeners: Mutex<Vec<Arc<dyn LeaderListener>>>,
    downloader: Mutex<Option<Arc<dyn SnapshotDownloader>>>,
    stopped: AtomicBool,
}

impl RaftMachine {
    /// Creates a Raft machine, recovering the term, vote and membership from
    /// the stores. Timers aren't started until post_recovery_actions().
    pub fn new(me: MemberId, config: &RaftConfig, stores: Stores, outbound: Arc<dyn Outbound>) -> Result<Self> {
        config.validate()?;
        let timers = LeaderAvailabilityTimers::new(config.election_timeout(), config.heartbeat_interval())?;
        let mut state = RaftState::new(me, config, stores.log, stores.term, stores.vote)?;
        let membership = MembershipManager::new(me, stores.membership)?;
        state.set_members(membership.voting_members(), membership.replication_members());
        info!(
            "Recovered member {} in term {} with voting members {:?}",
            me,
            state.term(),
            state.voting_members()
        );
        let shipping = LogShipping::new(me, config, outbound.clone());
        Ok(Self {
            me,
            inner: Mutex::new(Inner { state, membership, shipping, outbound }),
            timers,
            leader: LeaderCell::new(),
            listeners: Mutex::new(Vec::new()),
            downloader: Mutex::new(None),
            stopped: AtomicBool::new(false),
        })
    }

    pub fn me(&self) -> MemberId {
        self.me
    }

    /// Starts the election and heartbeat timers. The timers only hold a weak
    /// reference to the machine. A stopped machine can't be restarted.
    pub fn post_recovery_actions(self: &Arc<Self>) -> Result<()> {
        let _inner = self.inner.lock()?;
        if self.is_stopped() {
            return Err(Error::Stopped);
        }
        let election = Arc::downgrade(self);
        let heartbeat = Arc::downgrade(self);
        self.timers.start(
            move || Self::on_election_timeout(&election),
            move || Self::on_timeout(&heartbeat, Message::HeartbeatTimeout),
        )
    }

    fn on_election_timeout(machine: &Weak<Self>) {
        let Some(machine) = machine.upgrade() else {
            return;
        };
        match machine.timers.is_election_timed_out() {
            Ok(true) => Self::on_timeout(&Arc::downgrade(&machine), Message::ElectionTimeout),
            Ok(false) => {}
            Err(err) => error!("Failed checking election timeout: {}", err),
        }
    }

    fn on_timeout(machine: &Weak<Self>, message: Message) {
        let Some(machine) = machine.upgrade() else {
            return;
        };
        match machine.handle(RaftMessage::new(machine.me, message)) {
            Ok(()) | Err(Error::Stopped) => {}
            Err(err) => error!("Failed handling timeout: {}", err),
        }
    }

    /// Handles an inbound message.
    pub fn handle(&self, message: RaftMessage) -> Result<()> {
        if self.is_stopped() {
            return Err(Error::Stopped);
        }
        let mut inner = self.inner.lock()?;
        if let Err(err) = self.process(&mut inner, message) {
            error!("Raft machine {} failed, stopping: {}", self.me, err);
            self.stop(&mut inner);
            return Err(err);
        }
        Ok(())
    }

    /// Permanently stops the machine after a fatal local error, e.g. a failed
    /// write elsewhere in the member. Later messages and restarts of the
    /// timers fail with Error::Stopped.
    pub fn panic(&self) -> Result<()> {
        let mut inner = self.inner.lock()?;
        error!("Raft machine {} panicked, stopping", self.me);
        self.stop(&mut inner);
        Ok(())
    }

    fn stop(&self, inner: &mut Inner) {
        self.stopped.store(true, Ordering::SeqCst);
        inner.shipping.pause();
        if let Err(err) = self.timers.stop() {
            error!("Failed stopping timers: {}", err);
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    fn process(&self, inner: &mut Inner, message: RaftMessage) -> Result<()> {
        let Inner { state, membership, shipping, outbound } = &mut *inner;
        debug!("Member {} handling {:?} as {}", self.me, message, state.role());

        let mut outcome = state.role().handle(&message, state)?;
        state.update(&outcome)?;

        for directed in std::mem::take(&mut outcome.outgoing) {
            outbound.send(directed.to, RaftMessage::new(self.me, directed.message));
        }
        if outcome.election_timeout_renewed {
            self.timers.renew_election()?;
        }

        // Log shipping runs while we're leader.
        let context = LeaderContext::new(state.term(), state.commit_index());
        if outcome.elected_leader {
            shipping.resume(context, state)?;
        }
        if outcome.step_down_term.is_some() || state.role() != Role::Leader {
            shipping.pause();
        }
        if state.role() == Role::Leader {
            shipping.handle_commands(&outcome.ship_commands, context, state)?;
            if message.message == Message::HeartbeatTimeout {
                shipping.on_tick(Instant::now(), state)?;
            }
        }

        // Membership follows the log, and the leader drives it towards the
        // target members.
        membership.on_role(state.role());
        membership.process_log_commands(&outcome.log_commands)?;
        membership.process_commit(state.commit_index())?;
        let proposal = match state.role() {
            Role::Leader => membership.propose(state.follower_states(), state.commit_index()),
            Role::Follower | Role::Candidate => None,
        };
        state.set_members(membership.voting_members(), membership.replication_members());
        shipping.on_membership_changed(state)?;

        if outcome.needs_fresh_snapshot {
            match self.downloader.lock()?.as_ref() {
                Some(downloader) => downloader.schedule_download(),
                None => warn!("Member {} needs a snapshot, but has no snapshot downloader", self.me),
            }
        }

        if let Some(term) = outcome.step_down_term {
            self.leader.set(LeaderInfo::new(None, term).step_down())?;
            for listener in self.listeners.lock()?.iter() {
                listener.on_leader_step_down(term);
            }
        }
        let info = LeaderInfo::new(state.leader(), state.term());
        let current = self.leader.get()?;
        if info.member.is_none() && info.term > current.term && outcome.step_down_term.is_none() {
            // A new term without a known leader yet.
            self.leader.set(info)?;
        } else if info.member.is_some() && current != info {
            self.leader.set(info.clone())?;
            for listener in self.listeners.lock()?.iter() {
                listener.on_leader_switch(&info);
            }
        }

        if let Some(members) = proposal {
            info!("Proposing membership {:?}", members);
            let request = Message::NewEntryRequest { content: Content::Membership(members) };
            self.process(inner, RaftMessage::new(self.me, request))?;
        }
        Ok(())
    }

    /// Returns a read-only copy of the Raft state.
    pub fn state(&self) -> Result<ExposedRaftState> {
        Ok(self.inner.lock()?.state.exposed())
    }

    /// Returns the core state, for inclusion in snapshots.
    pub fn core_state(&self) -> Result<RaftCoreState> {
        Ok(RaftCoreState { membership: self.inner.lock()?.membership.core_state() })
    }

    /// Installs the core state from a snapshot.
    pub fn install_core_state(&self, core_state: RaftCoreState) -> Result<()> {
        let mut inner = self.inner.lock()?;
        let Inner { state, membership, shipping, .. } = &mut *inner;
        membership.install(core_state.membership)?;
        state.set_members(membership.voting_members(), membership.replication_members());
        shipping.on_membership_changed(state)
    }

    /// Sets the target members, e.g. as found by discovery. The leader moves
    /// the voting members towards them one change at a time.
    pub fn set_target_members(&self, members: MemberSet) -> Result<()> {
        self.inner.lock()?.membership.set_target_members(members);
        Ok(())
    }

    /// Registers a leader listener. It is immediately told about the current
    /// leader, if any.
    pub fn register_listener(&self, listener: Arc<dyn LeaderListener>) -> Result<()> {
        let info = self.leader.get()?;
        if info.member.is_some() {
            listener.on_leader_switch(&info);
        }
        self.listeners.lock()?.push(listener);
        Ok(())
    }

    pub fn set_snapshot_downloader(&self, downloader: Arc<dyn SnapshotDownloader>) -> Result<()> {
        *self.downloader.lock()? = Some(downloader);
        Ok(())
    }

    /// Waits for a leader to become known.
    pub fn await_leader(&self, timeout: Duration) -> Result<MemberId> {
        self.leader.await_leader(timeout)
    }

    pub fn leader_info(&self) -> Result<LeaderInfo> {
        self.leader.get()
    }

    /// Stops the timers, e.g. on shutdown.
    pub fn stop_timers(&self) -> Result<()> {
        self.timers.stop()
    }
}
