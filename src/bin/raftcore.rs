//! Runs an in-process Raft cluster: starts the given number of members,
//! connected via channels, waits for a leader, replicates a number of
//! entries and prints the resulting state of each member.

#![warn(clippy::all)]

use clap::Parser;
use raftcore::error::{Error, Result};
use raftcore::raft::{
    ClusterId, Content, Envelope, InboundHandler, MemberSet, Message, RaftMachine,
    RaftMessage, Received, Stores,
};
use raftcore::RaftConfig;

use log::{error, info};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Parser)]
#[command(name = "raftcore")]
#[command(about = "Runs an in-process Raft cluster")]
struct Args {
    /// Configuration file
    #[arg(short, long)]
    config: Option<String>,

    /// Number of cluster members
    #[arg(short, long, default_value = "3")]
    nodes: u64,

    /// Number of entries to replicate
    #[arg(short, long, default_value = "10")]
    entries: u64,
}

fn main() -> Result<()> {
    let args = Args::parse();
    let cfg = RaftConfig::load(args.config.as_deref())?;

    let loglevel = cfg.log_level.parse::<simplelog::LevelFilter>()?;
    let mut logconfig = simplelog::ConfigBuilder::new();
    if loglevel != simplelog::LevelFilter::Debug {
        logconfig.add_filter_allow_str("raftcore");
    }
    simplelog::SimpleLogger::init(loglevel, logconfig.build())?;

    if args.nodes == 0 {
        return Err(Error::Config("at least one member is required".into()));
    }
    let members: MemberSet = (1..=args.nodes).collect();
    let cluster_id = ClusterId::random();
    let (tx, rx) = crossbeam::channel::unbounded::<Envelope>();

    let mut handlers = BTreeMap::new();
    let mut machines = BTreeMap::new();
    for id in members.iter().copied() {
        let stores = Stores::in_memory(members.clone());
        let machine = Arc::new(RaftMachine::new(id, &cfg, stores, Arc::new(tx.clone()))?);
        let handler = InboundHandler::new(machine.clone());
        handler.bind(cluster_id)?;
        machine.post_recovery_actions()?;
        handlers.insert(id, handler);
        machines.insert(id, machine);
    }
    drop(tx);

    // Route messages between members. The router holds the members, and thus
    // the outbound senders, so it runs until the process exits.
    std::thread::Builder::new().name("router".into()).spawn(move || {
        for envelope in rx {
            let Some(handler) = handlers.get(&envelope.to) else {
                error!("Dropping message for unknown member {}", envelope.to);
                continue;
            };
            match handler.handle(Received::new(envelope.message, cluster_id)) {
                Ok(()) | Err(Error::Stopped) => {}
                Err(err) => error!("Member {} failed: {}", envelope.to, err),
            }
        }
    })?;

    let timeout = cfg.election_timeout() * 20;
    let leader = machines[&1].await_leader(timeout)?;
    info!("Member {} is leader", leader);

    for i in 0..args.entries {
        let content = Content::Data(format!("entry {}", i).into_bytes());
        machines[&leader].handle(RaftMessage::new(leader, Message::NewEntryRequest { content }))?;
    }

    // Wait for every member to commit the leader's log.
    let target = machines[&leader].state()?.append_index;
    let deadline = Instant::now() + timeout;
    for machine in machines.values() {
        while machine.state()?.commit_index < target {
            if Instant::now() > deadline {
                return Err(Error::Internal(format!("member {} did not commit index {}", machine.me(), target)));
            }
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    for machine in machines.values() {
        let state = machine.state()?;
        println!(
            "member={} role={} term={} leader={:?} commit={} append={}",
            state.me, state.role, state.term, state.leader, state.commit_index, state.append_index
        );
        machine.stop_timers()?;
    }
    Ok(())
}
