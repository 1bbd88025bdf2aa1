use crate::error::{Error, Result};

use log::debug;
use rand::Rng as _;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Timer control messages.
enum Control {
    Reset,
    Stop,
}

/// A repeating timer running on its own thread. The delay before each firing
/// is drawn from a delay function, so it can be randomized per period. The
/// handler runs on the timer thread.
pub struct Timer {
    name: &'static str,
    control_tx: crossbeam::channel::Sender<Control>,
}

impl Timer {
    /// Starts a timer which calls the handler every time the delay elapses.
    pub fn start<D, H>(name: &'static str, delay: D, handler: H) -> Result<Self>
    where
        D: Fn() -> Duration + Send + 'static,
        H: Fn() + Send + 'static,
    {
        let (control_tx, control_rx) = crossbeam::channel::unbounded();
        std::thread::Builder::new()
            .name(format!("{}-timer", name))
            .spawn(move || Self::run(control_rx, delay, handler))?;
        Ok(Self { name, control_tx })
    }

    fn run<D, H>(control_rx: crossbeam::channel::Receiver<Control>, delay: D, handler: H)
    where
        D: Fn() -> Duration,
        H: Fn(),
    {
        let mut deadline = Instant::now() + delay();
        loop {
            crossbeam::select! {
                recv(control_rx) -> control => match control {
                    Ok(Control::Reset) => deadline = Instant::now() + delay(),
                    Ok(Control::Stop) | Err(_) => return,
                },
                recv(crossbeam::channel::at(deadline)) -> _ => {
                    handler();
                    deadline = Instant::now() + delay();
                }
            }
        }
    }

    /// Restarts the current period.
    pub fn reset(&self) -> Result<()> {
        Ok(self.control_tx.send(Control::Reset)?)
    }

    /// Stops the timer. The handler may still be running if it already fired,
    /// but won't be called again.
    pub fn stop(&self) {
        debug!("Stopping {} timer", self.name);
        // The thread may already be gone, which is fine.
        let _ = self.control_tx.send(Control::Stop);
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        let _ = self.control_tx.send(Control::Stop);
    }
}

/// The election and heartbeat timers of a member.
///
/// The election timer fires after a random delay in [T, 2T] where T is the
/// election timeout, and is reset whenever the election timeout is renewed
/// (e.g. on hearing from the leader). The heartbeat timer fires every
/// heartbeat interval. Both timers keep firing until stopped: a candidate
/// that doesn't win keeps starting new elections, and a leader checks its
/// quorum on every election timeout.
pub struct LeaderAvailabilityTimers {
    election_timeout: Duration,
    heartbeat_interval: Duration,
    last_election_renewal: Mutex<Instant>,
    timers: Mutex<Option<(Timer, Timer)>>,
}

impl LeaderAvailabilityTimers {
    /// Creates the timers, without starting them. The election timeout can't
    /// be shorter than the heartbeat interval, or followers would time out
    /// between heartbeats.
    pub fn new(election_timeout: Duration, heartbeat_interval: Duration) -> Result<Self> {
        if election_timeout < heartbeat_interval {
            return Err(Error::Config(format!(
                "election timeout {:?} is shorter than heartbeat interval {:?}",
                election_timeout, heartbeat_interval
            )));
        }
        Ok(Self {
            election_timeout,
            heartbeat_interval,
            last_election_renewal: Mutex::new(Instant::now()),
            timers: Mutex::new(None),
        })
    }

    /// Starts the timers with the given handlers. Restarting replaces any
    /// running timers.
    pub fn start<E, H>(&self, on_election_timeout: E, on_heartbeat_timeout: H) -> Result<()>
    where
        E: Fn() + Send + 'static,
        H: Fn() + Send + 'static,
    {
        let timeout = self.election_timeout;
        let interval = self.heartbeat_interval;
        let election = Timer::start(
            "election",
            move || rand::thread_rng().gen_range(timeout..=timeout * 2),
            on_election_timeout,
        )?;
        let heartbeat = Timer::start("heartbeat", move || interval, on_heartbeat_timeout)?;
        *self.last_election_renewal.lock()? = Instant::now();
        if let Some((election, heartbeat)) = self.timers.lock()?.replace((election, heartbeat)) {
            election.stop();
            heartbeat.stop();
        }
        Ok(())
    }

    /// Stops the timers.
    pub fn stop(&self) -> Result<()> {
        if let Some((election, heartbeat)) = self.timers.lock()?.take() {
            election.stop();
            heartbeat.stop();
        }
        Ok(())
    }

    /// Renews the election timeout, postponing the next election.
    pub fn renew_election(&self) -> Result<()> {
        *self.last_election_renewal.lock()? = Instant::now();
        if let Some((election, _)) = self.timers.lock()?.as_ref() {
            election.reset()?;
        }
        Ok(())
    }

    /// Returns true if the election timeout has elapsed since it was last
    /// renewed.
    pub fn is_election_timed_out(&self) -> Result<bool> {
        Ok(self.last_election_renewal.lock()?.elapsed() >= self.election_timeout)
    }

    pub fn election_timeout(&self) -> Duration {
        self.election_timeout
    }

    pub fn heartbeat_interval(&self) -> Duration {
        self.heartbeat_interval
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timer_fires_repeatedly() -> Result<()> {
        let (tx, rx) = crossbeam::channel::unbounded();
        let timer = Timer::start("test", || Duration::from_millis(5), move || tx.send(()).unwrap())?;
        for _ in 0..3 {
            rx.recv_timeout(Duration::from_secs(5)).expect("timer didn't fire");
        }
        timer.stop();
        Ok(())
    }

    #[test]
    fn timer_stop() -> Result<()> {
        let (tx, rx) = crossbeam::channel::unbounded();
        let timer = Timer::start("test", || Duration::from_millis(200), move || {
            let _ = tx.send(());
        })?;
        timer.stop();
        assert!(rx.recv_timeout(Duration::from_millis(500)).is_err());
        Ok(())
    }

    #[test]
    fn rejects_election_timeout_below_heartbeat() {
        let result = LeaderAvailabilityTimers::new(Duration::from_millis(10), Duration::from_millis(20));
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn election_timed_out() -> Result<()> {
        let timers = LeaderAvailabilityTimers::new(Duration::ZERO, Duration::ZERO)?;
        assert!(timers.is_election_timed_out()?);

        let timers = LeaderAvailabilityTimers::new(Duration::from_secs(3600), Duration::from_secs(1))?;
        assert!(!timers.is_election_timed_out()?);
        timers.renew_election()?;
        assert!(!timers.is_election_timed_out()?);
        Ok(())
    }

    #[test]
    fn fires_election_and_heartbeat_timeouts() -> Result<()> {
        let timers = LeaderAvailabilityTimers::new(Duration::from_millis(20), Duration::from_millis(5))?;
        let (election_tx, election_rx) = crossbeam::channel::unbounded();
        let (heartbeat_tx, heartbeat_rx) = crossbeam::channel::unbounded();
        timers.start(
            move || {
                let _ = election_tx.send(());
            },
            move || {
                let _ = heartbeat_tx.send(());
            },
        )?;
        heartbeat_rx.recv_timeout(Duration::from_secs(5)).expect("no heartbeat timeout");
        election_rx.recv_timeout(Duration::from_secs(5)).expect("no election timeout");
        timers.stop()?;
        Ok(())
    }
}
