/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Thread that turns timeout requests into timeout events.
//!
//! The consensus state machine asks for a timeout by calling [`TimeoutTicker::schedule_timeout`].
//! The ticker keeps exactly one timer armed: a new request replaces the armed timer, but only if the
//! request is for a `(height, round, step)` strictly later than the last one scheduled. Requests for
//! earlier positions are dropped, so a late request can never shadow a timeout that the state machine
//! is already waiting on.
//!
//! When the timer fires, the [`TimeoutInfo`] is sent to the consumer's channel. The ticker thread never
//! blocks on this channel: if it is full, the send is handed off to a detached thread.

use std::{
    sync::mpsc::{self, RecvTimeoutError, Sender, SyncSender, TrySendError},
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use crate::{
    consensus::round_state::RoundStepType,
    types::data_types::{Height, Round},
};

/// A timeout for a specific step of a specific round.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TimeoutInfo {
    pub duration: Duration,
    pub height: Height,
    pub round: Round,
    pub step: RoundStepType,
}

impl TimeoutInfo {
    fn is_after(&self, other: &TimeoutInfo) -> bool {
        (self.height, self.round, self.step) > (other.height, other.round, other.step)
    }
}

enum TickerCommand {
    Schedule(TimeoutInfo),
    Stop,
}

/// Handle to the ticker thread. Dropping it stops the thread.
pub struct TimeoutTicker {
    commands: Sender<TickerCommand>,
    thread: Option<JoinHandle<()>>,
}

impl TimeoutTicker {
    /// Spawn the ticker thread. Fired timeouts are converted into `T` and sent into `output`.
    pub fn start<T>(output: SyncSender<T>) -> TimeoutTicker
    where
        T: From<TimeoutInfo> + Send + 'static,
    {
        let (commands, command_receiver) = mpsc::channel();
        let thread = thread::spawn(move || {
            let mut last_scheduled: Option<TimeoutInfo> = None;
            let mut armed: Option<(Instant, TimeoutInfo)> = None;

            loop {
                let command = match armed {
                    Some((deadline, _)) => {
                        let now = Instant::now();
                        if deadline <= now {
                            Err(RecvTimeoutError::Timeout)
                        } else {
                            command_receiver.recv_timeout(deadline - now)
                        }
                    }
                    None => command_receiver
                        .recv()
                        .map_err(|_| RecvTimeoutError::Disconnected),
                };

                match command {
                    Ok(TickerCommand::Schedule(timeout)) => {
                        if let Some(last) = &last_scheduled {
                            if !timeout.is_after(last) {
                                log::debug!(
                                    "Ignoring timeout {}/{}/{}, last scheduled is {}/{}/{}",
                                    timeout.height,
                                    timeout.round,
                                    timeout.step.name(),
                                    last.height,
                                    last.round,
                                    last.step.name()
                                );
                                continue;
                            }
                        }
                        last_scheduled = Some(timeout);
                        armed = Some((Instant::now() + timeout.duration, timeout));
                    }
                    Ok(TickerCommand::Stop) | Err(RecvTimeoutError::Disconnected) => return,
                    Err(RecvTimeoutError::Timeout) => {
                        if let Some((_, timeout)) = armed.take() {
                            fire(&output, timeout);
                        }
                    }
                }
            }
        });

        TimeoutTicker {
            commands,
            thread: Some(thread),
        }
    }

    /// Ask for `timeout` to fire after `timeout.duration`. A zero duration fires immediately.
    pub fn schedule_timeout(&self, timeout: TimeoutInfo) {
        if self.commands.send(TickerCommand::Schedule(timeout)).is_err() {
            log::warn!("Timeout ticker has stopped; dropping timeout {:?}", timeout);
        }
    }
}

fn fire<T: From<TimeoutInfo> + Send + 'static>(output: &SyncSender<T>, timeout: TimeoutInfo) {
    match output.try_send(T::from(timeout)) {
        Ok(()) => (),
        Err(TrySendError::Full(event)) => {
            let output = output.clone();
            thread::spawn(move || {
                let _ = output.send(event);
            });
        }
        Err(TrySendError::Disconnected(_)) => {
            log::debug!("Timeout consumer is gone; dropping timeout {:?}", timeout)
        }
    }
}

impl Drop for TimeoutTicker {
    fn drop(&mut self) {
        let _ = self.commands.send(TickerCommand::Stop);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn timeout(millis: u64, height: i64, round: i32, step: RoundStepType) -> TimeoutInfo {
        TimeoutInfo {
            duration: Duration::from_millis(millis),
            height: Height::new(height),
            round: Round::new(round),
            step,
        }
    }

    #[test]
    fn zero_duration_fires_immediately() {
        let (sender, receiver) = mpsc::sync_channel::<TimeoutInfo>(10);
        let ticker = TimeoutTicker::start(sender);
        let expected = timeout(0, 1, 0, RoundStepType::NewHeight);
        ticker.schedule_timeout(expected);
        assert_eq!(receiver.recv_timeout(Duration::from_secs(2)), Ok(expected));
    }

    #[test]
    fn later_request_replaces_armed_timer() {
        let (sender, receiver) = mpsc::sync_channel::<TimeoutInfo>(10);
        let ticker = TimeoutTicker::start(sender);
        ticker.schedule_timeout(timeout(10_000, 1, 0, RoundStepType::Propose));
        let later = timeout(10, 1, 0, RoundStepType::PrevoteWait);
        ticker.schedule_timeout(later);

        assert_eq!(receiver.recv_timeout(Duration::from_secs(2)), Ok(later));
        assert!(receiver.recv_timeout(Duration::from_millis(200)).is_err());
    }

    #[test]
    fn earlier_or_equal_requests_are_dropped() {
        let (sender, receiver) = mpsc::sync_channel::<TimeoutInfo>(10);
        let ticker = TimeoutTicker::start(sender);
        let first = timeout(50, 2, 1, RoundStepType::Prevote);
        ticker.schedule_timeout(first);
        ticker.schedule_timeout(timeout(0, 2, 1, RoundStepType::Propose));
        ticker.schedule_timeout(timeout(0, 2, 0, RoundStepType::Commit));
        ticker.schedule_timeout(timeout(0, 1, 5, RoundStepType::Commit));

        assert_eq!(receiver.recv_timeout(Duration::from_secs(2)), Ok(first));

        // The same position cannot be scheduled twice.
        ticker.schedule_timeout(first);
        assert!(receiver.recv_timeout(Duration::from_millis(200)).is_err());

        let next_round = timeout(0, 2, 2, RoundStepType::NewRound);
        ticker.schedule_timeout(next_round);
        assert_eq!(receiver.recv_timeout(Duration::from_secs(2)), Ok(next_round));
    }

    #[test]
    fn full_output_does_not_block_the_ticker() {
        let (sender, receiver) = mpsc::sync_channel::<TimeoutInfo>(1);
        let ticker = TimeoutTicker::start(sender);
        for round in 0..3 {
            ticker.schedule_timeout(timeout(0, 1, round, RoundStepType::NewRound));
            thread::sleep(Duration::from_millis(50));
        }
        let mut rounds: Vec<i32> = (0..3)
            .map(|_| receiver.recv_timeout(Duration::from_secs(2)).unwrap().round.int())
            .collect();
        rounds.sort();
        assert_eq!(rounds, vec![0, 1, 2]);
    }
}
