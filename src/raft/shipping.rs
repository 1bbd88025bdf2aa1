use super::{
    Entry, Index, MemberId, Message, Outbound, RaftMessage, RaftState, ShipCommand, Term, NO_INDEX,
    NO_TERM,
};
use crate::config::RaftConfig;
use crate::error::Result;

use log::{debug, error, info, warn};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// The leader's term and commit index, as of the latest shipping command.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LeaderContext {
    pub term: Term,
    pub commit_index: Index,
}

impl LeaderContext {
    pub fn new(term: Term, commit_index: Index) -> Self {
        Self { term, commit_index }
    }
}

/// A log shipper's mode.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ShipperMode {
    /// Probing backwards with empty appends for the last matching entry.
    Mismatch,
    /// Streaming new entries as they're appended.
    Pipeline,
    /// Sending batches of existing entries, one per matched batch.
    Catchup,
}

/// Shipper tuning parameters.
#[derive(Clone, Copy, Debug)]
struct ShipperOptions {
    catchup_batch_size: usize,
    max_allowed_shipping_lag: Index,
    retry_interval: Duration,
}

impl From<&RaftConfig> for ShipperOptions {
    fn from(config: &RaftConfig) -> Self {
        Self {
            catchup_batch_size: config.catchup_batch_size,
            max_allowed_shipping_lag: config.max_allowed_shipping_lag as Index,
            retry_interval: config.log_shipping_retry(),
        }
    }
}

/// Replicates the leader's log to a single follower.
///
/// A shipper starts out in Mismatch mode, probing with empty append requests
/// until the follower accepts one. It then sends the entries the follower is
/// missing in batches (Catchup), and once caught up streams new entries as
/// they're appended (Pipeline). A follower that falls too far behind, or stops
/// responding, drops back to Catchup. Any mismatch drops back to Mismatch.
pub struct LogShipper {
    me: MemberId,
    target: MemberId,
    outbound: Arc<dyn Outbound>,
    options: ShipperOptions,
    mode: ShipperMode,
    match_index: Index,
    last_sent_index: Index,
    timeout_at: Option<Instant>,
    context: LeaderContext,
}

impl LogShipper {
    fn new(
        me: MemberId,
        target: MemberId,
        outbound: Arc<dyn Outbound>,
        options: ShipperOptions,
        context: LeaderContext,
    ) -> Self {
        Self {
            me,
            target,
            outbound,
            options,
            mode: ShipperMode::Mismatch,
            match_index: NO_INDEX,
            last_sent_index: NO_INDEX,
            timeout_at: None,
            context,
        }
    }

    pub fn target(&self) -> MemberId {
        self.target
    }

    pub fn mode(&self) -> ShipperMode {
        self.mode
    }

    pub fn match_index(&self) -> Index {
        self.match_index
    }

    pub fn last_sent_index(&self) -> Index {
        self.last_sent_index
    }

    /// Starts shipping by probing at our append index.
    fn start(&mut self, state: &RaftState) -> Result<()> {
        info!("Starting log shipper to {} in term {}", self.target, self.context.term);
        self.send_empty(state.entry_log().append_index(), state)
    }

    fn on_mismatch(&mut self, last_remote_append_index: Index, context: LeaderContext, state: &RaftState) -> Result<()> {
        self.context = context;
        match self.mode {
            ShipperMode::Mismatch => {
                let index =
                    (self.last_sent_index - 1).min(last_remote_append_index).max(self.match_index);
                self.send_empty(index, state)
            }
            ShipperMode::Pipeline | ShipperMode::Catchup => {
                info!("Mismatch from {} in mode {:?}, moving to mismatch mode", self.target, self.mode);
                self.mode = ShipperMode::Mismatch;
                self.send_empty(self.last_sent_index, state)
            }
        }
    }

    fn on_match(&mut self, match_index: Index, context: LeaderContext, state: &RaftState) -> Result<()> {
        self.context = context;
        let progress = match_index > self.match_index;
        if progress {
            self.match_index = match_index;
        } else {
            debug!("Match index of {} not progressing at {}", self.target, match_index);
        }
        match self.mode {
            ShipperMode::Mismatch => {
                self.mode = if self.send_next_batch_after_match(state)? {
                    ShipperMode::Pipeline
                } else {
                    ShipperMode::Catchup
                };
                debug!("Shipper to {} moved to {:?} mode", self.target, self.mode);
            }
            ShipperMode::Catchup => {
                if self.match_index >= self.last_sent_index && self.send_next_batch_after_match(state)? {
                    debug!("Shipper to {} caught up, moving to pipeline mode", self.target);
                    self.mode = ShipperMode::Pipeline;
                }
            }
            ShipperMode::Pipeline => {
                if self.match_index == self.last_sent_index {
                    self.timeout_at = None;
                } else if progress {
                    self.schedule_timeout();
                }
            }
        }
        Ok(())
    }

    fn on_new_entries(
        &mut self,
        prev_log_index: Index,
        prev_log_term: Term,
        entries: &[Entry],
        context: LeaderContext,
    ) {
        self.context = context;
        if self.mode != ShipperMode::Pipeline {
            return;
        }
        if prev_log_index - self.match_index <= self.options.max_allowed_shipping_lag {
            self.schedule_timeout();
            self.last_sent_index = prev_log_index + entries.len() as Index;
            self.send(Message::AppendEntriesRequest {
                leader_term: context.term,
                prev_log_index,
                prev_log_term,
                entries: entries.to_vec(),
                leader_commit: context.commit_index,
            });
        } else {
            info!(
                "Follower {} has fallen behind (prev index {}, match index {}), moving to catchup mode",
                self.target, prev_log_index, self.match_index
            );
            self.mode = ShipperMode::Catchup;
        }
    }

    fn on_commit_update(&mut self, context: LeaderContext, state: &RaftState) -> Result<()> {
        self.context = context;
        if self.mode == ShipperMode::Pipeline {
            let commit_index_term = state.entry_log().read_entry_term(context.commit_index)?;
            self.send(Message::Heartbeat {
                leader_term: context.term,
                commit_index: context.commit_index,
                commit_index_term,
            });
        }
        Ok(())
    }

    /// Resends if the follower hasn't responded within the retry interval.
    fn on_tick(&mut self, now: Instant, state: &RaftState) -> Result<()> {
        if !self.timeout_at.is_some_and(|at| at <= now) {
            return Ok(());
        }
        debug!("Shipper to {} timed out in mode {:?}", self.target, self.mode);
        if self.mode == ShipperMode::Pipeline {
            // The follower seems unresponsive, so stop streaming to it.
            self.mode = ShipperMode::Catchup;
        }
        match self.mode {
            ShipperMode::Mismatch => self.send_empty(self.last_sent_index, state),
            ShipperMode::Catchup | ShipperMode::Pipeline => {
                self.send_next_batch_after_match(state)?;
                Ok(())
            }
        }
    }

    /// Sends the next batch after the match index. Returns true if the batch
    /// reaches our append index, i.e. the follower will be caught up.
    fn send_next_batch_after_match(&mut self, state: &RaftState) -> Result<bool> {
        let append_index = state.entry_log().append_index();
        if append_index <= self.match_index {
            return Ok(true);
        }
        let end_index = append_index.min(self.match_index + self.options.catchup_batch_size as Index);
        self.schedule_timeout();
        self.send_range(self.match_index + 1, end_index, state)?;
        Ok(end_index == append_index)
    }

    /// Sends an empty append request, probing whether the follower has the
    /// entry before the given index.
    fn send_empty(&mut self, index: Index, state: &RaftState) -> Result<()> {
        let log = state.entry_log();
        self.schedule_timeout();
        let index = index.max(log.prev_index() + 1);
        self.last_sent_index = index;

        let prev_log_index = index - 1;
        let prev_log_term = log.read_entry_term(prev_log_index)?;
        if prev_log_term > self.context.term {
            warn!("Aborting send to {}, entry {} is from a later term {}", self.target, prev_log_index, prev_log_term);
            return Ok(());
        }
        if Self::missing(prev_log_index, prev_log_term) {
            warn!("Entry {} was pruned before probing {}", prev_log_index, self.target);
            return Ok(());
        }
        self.send(Message::AppendEntriesRequest {
            leader_term: self.context.term,
            prev_log_index,
            prev_log_term,
            entries: Vec::new(),
            leader_commit: self.context.commit_index,
        });
        Ok(())
    }

    /// Sends entries in the given inclusive range, reading them from the
    /// in-flight cache where possible. If they've been pruned, the follower is
    /// told to fetch a snapshot instead.
    fn send_range(&mut self, start_index: Index, end_index: Index, state: &RaftState) -> Result<()> {
        if start_index > end_index {
            return Ok(());
        }
        self.last_sent_index = end_index;
        let log = state.entry_log();
        let cache = state.in_flight_cache();
        let prev_log_index = start_index - 1;
        let prev_log_term = log.read_entry_term(prev_log_index)?;
        if prev_log_term > self.context.term {
            warn!("Aborting send to {}, entry {} is from a later term {}", self.target, prev_log_index, prev_log_term);
            return Ok(());
        }

        let mut entries = Vec::with_capacity((end_index - start_index + 1) as usize);
        let mut entry_missing = false;
        for index in start_index..=end_index {
            let entry = match cache.get(index) {
                Some(entry) => Some(entry.clone()),
                None => log.read(index)?,
            };
            let Some(entry) = entry else {
                entry_missing = true;
                break;
            };
            if entry.term > self.context.term {
                warn!("Aborting send to {}, entry {} is from a later term {}", self.target, index, entry.term);
                return Ok(());
            }
            entries.push(entry);
        }

        if entry_missing || Self::missing(prev_log_index, prev_log_term) {
            if log.prev_index() >= prev_log_index {
                self.send(Message::LogCompactionInfo {
                    leader_term: self.context.term,
                    prev_index: log.prev_index(),
                });
            } else {
                error!(
                    "Entries {}..={} for {} are missing, but the log is not compacted past {}",
                    start_index, end_index, self.target, prev_log_index
                );
            }
            return Ok(());
        }

        self.send(Message::AppendEntriesRequest {
            leader_term: self.context.term,
            prev_log_index,
            prev_log_term,
            entries,
            leader_commit: self.context.commit_index,
        });
        Ok(())
    }

    /// The term of an entry that isn't in the log is unknown, except for the
    /// entry before the first one.
    fn missing(index: Index, term: Term) -> bool {
        term == NO_TERM && index != NO_INDEX
    }

    fn schedule_timeout(&mut self) {
        self.timeout_at = Some(Instant::now() + self.options.retry_interval);
    }

    fn send(&self, message: Message) {
        self.outbound.send(self.target, RaftMessage::new(self.me, message));
    }
}

/// Manages the log shippers of a leader: one per replication member other
/// than ourself. Shipping runs while we're leader, and is paused otherwise.
pub struct LogShipping {
    me: MemberId,
    outbound: Arc<dyn Outbound>,
    options: ShipperOptions,
    shippers: BTreeMap<MemberId, LogShipper>,
    context: Option<LeaderContext>,
}

impl LogShipping {
    pub fn new(me: MemberId, config: &RaftConfig, outbound: Arc<dyn Outbound>) -> Self {
        Self { me, outbound, options: config.into(), shippers: BTreeMap::new(), context: None }
    }

    /// Returns true if shipping is running, i.e. we're leader.
    pub fn is_running(&self) -> bool {
        self.context.is_some()
    }

    /// Returns the shipper for the given member, if any.
    pub fn shipper(&self, member: MemberId) -> Option<&LogShipper> {
        self.shippers.get(&member)
    }

    /// Starts shipping to all replication members after being elected.
    pub fn resume(&mut self, context: LeaderContext, state: &RaftState) -> Result<()> {
        info!("Resuming log shipping in term {}", context.term);
        self.context = Some(context);
        self.shippers.clear();
        self.on_membership_changed(state)
    }

    /// Stops all shipping after stepping down.
    pub fn pause(&mut self) {
        if self.context.take().is_some() {
            info!("Pausing log shipping");
        }
        self.shippers.clear();
    }

    /// Starts shippers for new replication members and stops shippers for
    /// removed ones.
    pub fn on_membership_changed(&mut self, state: &RaftState) -> Result<()> {
        let Some(context) = self.context else {
            return Ok(());
        };
        let members = state.replication_members();
        self.shippers.retain(|member, _| members.contains(member));
        for member in members.iter().copied().filter(|m| *m != self.me) {
            if self.shippers.contains_key(&member) {
                continue;
            }
            let mut shipper =
                LogShipper::new(self.me, member, self.outbound.clone(), self.options, context);
            shipper.start(state)?;
            self.shippers.insert(member, shipper);
        }
        Ok(())
    }

    /// Applies ship commands from an outcome.
    pub fn handle_commands(
        &mut self,
        commands: &[ShipCommand],
        context: LeaderContext,
        state: &RaftState,
    ) -> Result<()> {
        if self.context.is_none() {
            return Ok(());
        }
        self.context = Some(context);
        for command in commands {
            match command {
                ShipCommand::Match { index, target } => {
                    if let Some(shipper) = self.shippers.get_mut(target) {
                        shipper.on_match(*index, context, state)?;
                    }
                }
                ShipCommand::Mismatch { last_remote_append_index, target } => {
                    if let Some(shipper) = self.shippers.get_mut(target) {
                        shipper.on_mismatch(*last_remote_append_index, context, state)?;
                    }
                }
                ShipCommand::NewEntries { prev_log_index, prev_log_term, entries } => {
                    for shipper in self.shippers.values_mut() {
                        shipper.on_new_entries(*prev_log_index, *prev_log_term, entries, context);
                    }
                }
                ShipCommand::CommitUpdate => {
                    for shipper in self.shippers.values_mut() {
                        shipper.on_commit_update(context, state)?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Resends to unresponsive followers.
    pub fn on_tick(&mut self, now: Instant, state: &RaftState) -> Result<()> {
        for shipper in self.shippers.values_mut() {
            shipper.on_tick(now, state)?;
        }
        Ok(())
    }
}
