// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Periodic scheduler for registered behaviours.
//!
//! One monotonic clock drives everything. On each `advance` call, all
//! entries whose deadline has passed run serially, ordered by ascending
//! deadline with ties broken by registration order. Tickers never overlap:
//! ticks that fall due while an invocation is still running are dropped and
//! counted, and the next deadline is re-anchored on the invocation start so
//! two invocations are never closer together than the interval.

use std::time::Duration;

use tokio::time::Instant;
use tracing::warn;

use crate::behaviour::{Behaviour, BehaviourState};
use crate::error::RuntimeError;
use crate::skill::SkillContext;

/// How a behaviour is driven.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Schedule {
    /// Fire every `interval`, first at `start_at` (or `now + interval`).
    Ticker {
        interval: Duration,
        start_at: Option<Instant>,
    },
    /// Fire exactly once after `delay`.
    OneShot { delay: Duration },
    /// Run on every scheduler pass until `is_done()` reports true.
    Cyclic,
}

struct Entry {
    skill: String,
    name: String,
    behaviour: Box<dyn Behaviour>,
    ctx: SkillContext,
    schedule: Schedule,
    deadline: Instant,
    seq: u64,
    state: BehaviourState,
    setup_done: bool,
    invocations: u64,
    dropped_ticks: u64,
    aborted: u64,
    execution_timeout: Option<Duration>,
}

pub struct Scheduler {
    entries: Vec<Entry>,
    next_seq: u64,
    default_timeout: Option<Duration>,
    stopping: bool,
}

impl Scheduler {
    /// `default_timeout` caps each invocation unless the behaviour was
    /// registered with its own; `None` (or zero) disables the cap.
    pub fn new(default_timeout: Option<Duration>) -> Self {
        Self {
            entries: Vec::new(),
            next_seq: 0,
            default_timeout,
            stopping: false,
        }
    }

    /// Register a behaviour under `(skill, name)`.
    pub fn register(
        &mut self,
        skill: &str,
        name: &str,
        behaviour: Box<dyn Behaviour>,
        ctx: SkillContext,
        schedule: Schedule,
        execution_timeout: Option<Duration>,
    ) -> Result<(), RuntimeError> {
        if self
            .entries
            .iter()
            .any(|e| e.skill == skill && e.name == name)
        {
            return Err(RuntimeError::DuplicateBehaviour {
                skill: skill.to_string(),
                name: name.to_string(),
            });
        }
        let now = Instant::now();
        let deadline = match schedule {
            Schedule::Ticker { interval, start_at } => start_at.unwrap_or(now + interval),
            Schedule::OneShot { delay } => now + delay,
            Schedule::Cyclic => now,
        };
        self.entries.push(Entry {
            skill: skill.to_string(),
            name: name.to_string(),
            behaviour,
            ctx,
            schedule,
            deadline,
            seq: self.next_seq,
            state: BehaviourState::Scheduled,
            setup_done: false,
            invocations: 0,
            dropped_ticks: 0,
            aborted: 0,
            execution_timeout,
        });
        self.next_seq += 1;
        Ok(())
    }

    /// Remove a behaviour without running its teardown.
    pub fn remove(&mut self, skill: &str, name: &str) -> Option<Box<dyn Behaviour>> {
        let idx = self
            .entries
            .iter()
            .position(|e| e.skill == skill && e.name == name)?;
        Some(self.entries.remove(idx).behaviour)
    }

    /// Run every behaviour whose deadline has passed. Returns how many ran.
    pub async fn advance(&mut self) -> usize {
        let now = Instant::now();
        let mut due: Vec<(Instant, u64, usize)> = self
            .entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.state != BehaviourState::Done && e.deadline <= now)
            .map(|(i, e)| (e.deadline, e.seq, i))
            .collect();
        due.sort();

        let mut ran = 0;
        for (_, _, idx) in due {
            if self.stopping {
                break;
            }
            let default_timeout = self.default_timeout;
            let entry = &mut self.entries[idx];
            entry.state = BehaviourState::Running;

            if !entry.setup_done {
                if let Err(e) = entry.behaviour.setup(&entry.ctx).await {
                    warn!(skill = %entry.skill, behaviour = %entry.name, "setup failed: {e}");
                    entry.state = BehaviourState::Done;
                    continue;
                }
                entry.setup_done = true;
            }

            let started = Instant::now();
            entry.invocations += 1;
            let limit = entry.execution_timeout.or(default_timeout);
            let result = match limit {
                Some(limit) if !limit.is_zero() => {
                    match tokio::time::timeout(limit, entry.behaviour.act(&entry.ctx)).await {
                        Ok(result) => result,
                        Err(_) => {
                            entry.aborted += 1;
                            warn!(
                                skill = %entry.skill,
                                behaviour = %entry.name,
                                "invocation exceeded {limit:?}; aborted"
                            );
                            Ok(())
                        }
                    }
                }
                _ => entry.behaviour.act(&entry.ctx).await,
            };
            if let Err(e) = result {
                warn!(skill = %entry.skill, behaviour = %entry.name, "behaviour error: {e}");
            }
            ran += 1;

            let finished = Instant::now();
            match entry.schedule {
                Schedule::Ticker { interval, .. } => {
                    // Anchor on the invocation start so successive
                    // invocations are never closer together than `interval`.
                    entry.deadline = started + interval;
                    while entry.deadline < finished {
                        entry.dropped_ticks += 1;
                        entry.deadline += interval;
                    }
                    entry.state = BehaviourState::Scheduled;
                }
                Schedule::OneShot { .. } => {
                    entry.behaviour.teardown(&entry.ctx).await;
                    entry.state = BehaviourState::Done;
                }
                Schedule::Cyclic => {
                    if entry.behaviour.is_done() {
                        entry.behaviour.teardown(&entry.ctx).await;
                        entry.state = BehaviourState::Done;
                    } else {
                        entry.deadline = finished;
                        entry.state = BehaviourState::Scheduled;
                    }
                }
            }
        }
        ran
    }

    /// Stop scheduling further invocations. Cancellation is cooperative:
    /// a behaviour mid-invocation finishes its current unit of work.
    pub fn stop(&mut self) {
        self.stopping = true;
    }

    /// Tear down every behaviour that was set up and is not yet done.
    pub async fn teardown(&mut self) {
        self.stopping = true;
        for entry in &mut self.entries {
            if entry.setup_done && entry.state != BehaviourState::Done {
                entry.behaviour.teardown(&entry.ctx).await;
                entry.state = BehaviourState::Done;
            }
        }
    }

    pub fn behaviour_state(&self, skill: &str, name: &str) -> Option<BehaviourState> {
        self.find(skill, name).map(|e| e.state)
    }

    pub fn dropped_ticks(&self, skill: &str, name: &str) -> Option<u64> {
        self.find(skill, name).map(|e| e.dropped_ticks)
    }

    pub fn invocations(&self, skill: &str, name: &str) -> Option<u64> {
        self.find(skill, name).map(|e| e.invocations)
    }

    pub fn aborted(&self, skill: &str, name: &str) -> Option<u64> {
        self.find(skill, name).map(|e| e.aborted)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn find(&self, skill: &str, name: &str) -> Option<&Entry> {
        self.entries
            .iter()
            .find(|e| e.skill == skill && e.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{noop_context, CountingBehaviour};
    use std::sync::{atomic::AtomicU32, Arc};

    #[tokio::test(start_paused = true)]
    async fn ticker_fires_nine_to_ten_times_per_second() {
        let mut sched = Scheduler::new(None);
        let counter = Arc::new(AtomicU32::new(0));
        sched
            .register(
                "s",
                "tick",
                Box::new(CountingBehaviour::endless(Arc::clone(&counter))),
                noop_context("s"),
                Schedule::Ticker {
                    interval: Duration::from_millis(100),
                    start_at: None,
                },
                None,
            )
            .unwrap();

        let start = Instant::now();
        while start.elapsed() < Duration::from_secs(1) {
            sched.advance().await;
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        let n = counter.load(std::sync::atomic::Ordering::SeqCst);
        assert!((9..=10).contains(&n), "expected 9-10 invocations, got {n}");
        assert_eq!(sched.dropped_ticks("s", "tick"), Some(0));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_invocation_drops_exactly_two_ticks() {
        let mut sched = Scheduler::new(None);
        let behaviour =
            CountingBehaviour::endless(Arc::new(AtomicU32::new(0)))
                .with_delay(Duration::from_millis(300));
        sched
            .register(
                "s",
                "tick",
                Box::new(behaviour),
                noop_context("s"),
                Schedule::Ticker {
                    interval: Duration::from_millis(100),
                    start_at: None,
                },
                None,
            )
            .unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        sched.advance().await; // runs for 300 ms; ticks at +100 and +200 drop
        assert_eq!(sched.dropped_ticks("s", "tick"), Some(2));
    }

    #[tokio::test(start_paused = true)]
    async fn invocations_never_closer_than_interval() {
        let mut sched = Scheduler::new(None);
        let counter = Arc::new(AtomicU32::new(0));
        sched
            .register(
                "s",
                "tick",
                Box::new(CountingBehaviour::endless(Arc::clone(&counter))),
                noop_context("s"),
                Schedule::Ticker {
                    interval: Duration::from_millis(100),
                    start_at: None,
                },
                None,
            )
            .unwrap();

        // Advance on an awkward cadence (70 ms) and record invocation times.
        let mut last_count = 0;
        let mut last_time = None;
        for _ in 0..20 {
            sched.advance().await;
            let count = counter.load(std::sync::atomic::Ordering::SeqCst);
            if count > last_count {
                let now = Instant::now();
                if let Some(prev) = last_time {
                    assert!(now - prev >= Duration::from_millis(100));
                }
                last_time = Some(now);
                last_count = count;
            }
            tokio::time::sleep(Duration::from_millis(70)).await;
        }
        assert!(last_count > 2);
    }

    #[tokio::test(start_paused = true)]
    async fn one_shot_runs_once_and_is_done()  {
        let mut sched = Scheduler::new(None);
        let counter = Arc::new(AtomicU32::new(0));
        sched
            .register(
                "s",
                "once",
                Box::new(CountingBehaviour::endless(Arc::clone(&counter))),
                noop_context("s"),
                Schedule::OneShot {
                    delay: Duration::from_millis(10),
                },
                None,
            )
            .unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        sched.advance().await;
        sched.advance().await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        sched.advance().await;

        assert_eq!(counter.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert_eq!(
            sched.behaviour_state("s", "once"),
            Some(BehaviourState::Done)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn cyclic_runs_until_done() {
        let mut sched = Scheduler::new(None);
        let behaviour = CountingBehaviour::done_after(3, None);
        let counter = behaviour.counter();
        sched
            .register(
                "s",
                "cycle",
                Box::new(behaviour),
                noop_context("s"),
                Schedule::Cyclic,
                None,
            )
            .unwrap();

        for _ in 0..6 {
            sched.advance().await;
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        assert_eq!(counter.load(std::sync::atomic::Ordering::SeqCst), 3);
        assert_eq!(
            sched.behaviour_state("s", "cycle"),
            Some(BehaviourState::Done)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn execution_timeout_aborts_long_invocation() {
        let mut sched = Scheduler::new(None);
        let behaviour = CountingBehaviour::endless(Arc::new(AtomicU32::new(0)))
            .with_delay(Duration::from_secs(60));
        sched
            .register(
                "s",
                "slow",
                Box::new(behaviour),
                noop_context("s"),
                Schedule::Ticker {
                    interval: Duration::from_millis(100),
                    start_at: None,
                },
                Some(Duration::from_millis(50)),
            )
            .unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        sched.advance().await;
        assert_eq!(sched.aborted("s", "slow"), Some(1));
    }

    #[tokio::test]
    async fn duplicate_registration_rejected() {
        let mut sched = Scheduler::new(None);
        sched
            .register(
                "s",
                "b",
                Box::new(CountingBehaviour::done_after(1, None)),
                noop_context("s"),
                Schedule::Cyclic,
                None,
            )
            .unwrap();
        assert!(matches!(
            sched.register(
                "s",
                "b",
                Box::new(CountingBehaviour::done_after(1, None)),
                noop_context("s"),
                Schedule::Cyclic,
                None,
            ),
            Err(RuntimeError::DuplicateBehaviour { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn ties_broken_by_registration_order() {
        let mut sched = Scheduler::new(None);
        let order: Arc<std::sync::Mutex<Vec<&'static str>>> =
            Arc::new(std::sync::Mutex::new(Vec::new()));

        struct Recorder {
            tag: &'static str,
            order: Arc<std::sync::Mutex<Vec<&'static str>>>,
        }
        #[async_trait::async_trait]
        impl Behaviour for Recorder {
            async fn act(&mut self, _ctx: &SkillContext) -> Result<(), RuntimeError> {
                self.order.lock().unwrap().push(self.tag);
                Ok(())
            }
        }

        for tag in ["first", "second", "third"] {
            sched
                .register(
                    "s",
                    tag,
                    Box::new(Recorder {
                        tag,
                        order: Arc::clone(&order),
                    }),
                    noop_context("s"),
                    Schedule::Cyclic,
                    None,
                )
                .unwrap();
        }
        sched.advance().await;
        assert_eq!(*order.lock().unwrap(), vec!["first", "second", "third"]);
    }
}
