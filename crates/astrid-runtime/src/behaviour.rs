// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Behaviours: units of periodic or one-shot work owned by skills.
//!
//! The simple kinds (ticker, one-shot, cyclic) are scheduling modes, not
//! types: any [`Behaviour`] can be registered under any
//! [`crate::scheduler::Schedule`].
//! The composite kinds live here: [`SequenceBehaviour`] runs sub-behaviours
//! serially and [`FsmBehaviour`] walks a labelled-transition graph.

use std::collections::{HashMap, HashSet, VecDeque};

use async_trait::async_trait;
use tracing::warn;

use crate::error::RuntimeError;
use crate::skill::SkillContext;

/// Lifecycle of a registered behaviour.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BehaviourState {
    Idle,
    Scheduled,
    Running,
    Done,
}

/// A unit of work driven by the scheduler.
///
/// Implementations must be cooperative: long work should be split across
/// `act` calls, and [`SkillContext::is_stopping`] checked between yieldable
/// units.
#[async_trait]
pub trait Behaviour: Send {
    /// Called once before the first `act`.
    async fn setup(&mut self, _ctx: &SkillContext) -> Result<(), RuntimeError> {
        Ok(())
    }

    /// One unit of work.
    async fn act(&mut self, ctx: &SkillContext) -> Result<(), RuntimeError>;

    /// Called once after the behaviour completes or the runtime stops.
    async fn teardown(&mut self, _ctx: &SkillContext) {}

    /// Polled by the scheduler after each invocation of a cyclic behaviour,
    /// and by composites to advance past a finished sub-behaviour.
    fn is_done(&self) -> bool {
        false
    }

    /// The event a finished state emits, selecting the outgoing transition
    /// in an [`FsmBehaviour`].
    fn event(&self) -> Option<&str> {
        None
    }
}

// ── Sequence ──────────────────────────────────────────────────────────────────

/// Runs a list of sub-behaviours serially, advancing when the current one
/// reports done.
pub struct SequenceBehaviour {
    pending: VecDeque<Box<dyn Behaviour>>,
    current: Option<Box<dyn Behaviour>>,
    current_setup: bool,
}

impl SequenceBehaviour {
    pub fn new(steps: Vec<Box<dyn Behaviour>>) -> Self {
        Self {
            pending: steps.into(),
            current: None,
            current_setup: false,
        }
    }

    /// Steps not yet started (excludes the currently running one).
    pub fn remaining(&self) -> usize {
        self.pending.len()
    }
}

#[async_trait]
impl Behaviour for SequenceBehaviour {
    async fn act(&mut self, ctx: &SkillContext) -> Result<(), RuntimeError> {
        if self.current.is_none() {
            self.current = self.pending.pop_front();
            self.current_setup = false;
        }
        let Some(current) = self.current.as_mut() else {
            return Ok(());
        };
        if !self.current_setup {
            current.setup(ctx).await?;
            self.current_setup = true;
        }
        current.act(ctx).await?;
        if current.is_done() {
            current.teardown(ctx).await;
            self.current = None;
        }
        Ok(())
    }

    async fn teardown(&mut self, ctx: &SkillContext) {
        if let Some(mut current) = self.current.take() {
            if self.current_setup {
                current.teardown(ctx).await;
            }
        }
    }

    fn is_done(&self) -> bool {
        self.current.is_none() && self.pending.is_empty()
    }
}

// ── Finite-state machine ──────────────────────────────────────────────────────

/// A labelled-transition graph over state behaviours.
///
/// A state runs until its `is_done()` reports true; its last `event` then
/// selects the outgoing edge `(state, event) → destination`. Reaching a
/// registered final state ends the machine. Cycles are allowed.
pub struct FsmBehaviour {
    states: HashMap<String, Box<dyn Behaviour>>,
    transitions: HashMap<(String, String), String>,
    finals: HashSet<String>,
    initial: Option<String>,
    current: Option<String>,
    current_setup: bool,
    done: bool,
}

impl Default for FsmBehaviour {
    fn default() -> Self {
        Self::new()
    }
}

impl FsmBehaviour {
    pub fn new() -> Self {
        Self {
            states: HashMap::new(),
            transitions: HashMap::new(),
            finals: HashSet::new(),
            initial: None,
            current: None,
            current_setup: false,
            done: false,
        }
    }

    /// Register a state. The first registered state becomes the initial one
    /// unless [`Self::set_initial_state`] overrides it.
    pub fn register_state(
        &mut self,
        name: impl Into<String>,
        behaviour: Box<dyn Behaviour>,
    ) -> Result<(), RuntimeError> {
        let name = name.into();
        if self.states.contains_key(&name) {
            return Err(RuntimeError::DuplicateState(name));
        }
        if self.initial.is_none() {
            self.initial = Some(name.clone());
        }
        self.states.insert(name, behaviour);
        Ok(())
    }

    /// Register a state whose completion ends the machine.
    pub fn register_final_state(
        &mut self,
        name: impl Into<String>,
        behaviour: Box<dyn Behaviour>,
    ) -> Result<(), RuntimeError> {
        let name = name.into();
        self.register_state(name.clone(), behaviour)?;
        self.finals.insert(name);
        Ok(())
    }

    pub fn set_initial_state(&mut self, name: &str) -> Result<(), RuntimeError> {
        if !self.states.contains_key(name) {
            return Err(RuntimeError::UnknownState(name.to_string()));
        }
        self.initial = Some(name.to_string());
        Ok(())
    }

    /// Register the edge `(source, event) → destination`.
    pub fn register_transition(
        &mut self,
        source: impl Into<String>,
        event: impl Into<String>,
        destination: impl Into<String>,
    ) -> Result<(), RuntimeError> {
        let source = source.into();
        let event = event.into();
        let destination = destination.into();
        if !self.states.contains_key(&source) {
            return Err(RuntimeError::UnknownState(source));
        }
        if !self.states.contains_key(&destination) {
            return Err(RuntimeError::UnknownState(destination));
        }
        let key = (source, event);
        if self.transitions.contains_key(&key) {
            return Err(RuntimeError::DuplicateTransition {
                state: key.0,
                event: key.1,
            });
        }
        self.transitions.insert(key, destination);
        Ok(())
    }

    /// Remove a state together with every edge that touches it. Registering
    /// and then unregistering a state leaves the machine equivalent to never
    /// having registered it.
    pub fn unregister_state(&mut self, name: &str) -> Option<Box<dyn Behaviour>> {
        let behaviour = self.states.remove(name)?;
        self.finals.remove(name);
        self.transitions
            .retain(|(source, _), dest| source != name && dest != name);
        if self.initial.as_deref() == Some(name) {
            self.initial = None;
        }
        if self.current.as_deref() == Some(name) {
            self.current = None;
            self.current_setup = false;
        }
        Some(behaviour)
    }

    pub fn states(&self) -> impl Iterator<Item = &str> {
        self.states.keys().map(String::as_str)
    }

    pub fn transition_count(&self) -> usize {
        self.transitions.len()
    }

    pub fn current_state(&self) -> Option<&str> {
        self.current.as_deref()
    }
}

#[async_trait]
impl Behaviour for FsmBehaviour {
    async fn act(&mut self, ctx: &SkillContext) -> Result<(), RuntimeError> {
        if self.done {
            return Ok(());
        }
        if self.current.is_none() {
            match &self.initial {
                Some(initial) => {
                    self.current = Some(initial.clone());
                    self.current_setup = false;
                }
                None => {
                    warn!("finite-state machine has no initial state");
                    self.done = true;
                    return Ok(());
                }
            }
        }
        let name = self.current.clone().expect("current state set above");
        let state = self
            .states
            .get_mut(&name)
            .ok_or_else(|| RuntimeError::UnknownState(name.clone()))?;

        if !self.current_setup {
            state.setup(ctx).await?;
            self.current_setup = true;
        }
        state.act(ctx).await?;

        if state.is_done() {
            let event = state.event().map(str::to_string);
            state.teardown(ctx).await;
            if self.finals.contains(&name) {
                self.done = true;
                return Ok(());
            }
            let next = event
                .as_ref()
                .and_then(|e| self.transitions.get(&(name.clone(), e.clone())));
            match next {
                Some(next) => {
                    self.current = Some(next.clone());
                    self.current_setup = false;
                }
                None => {
                    warn!(
                        state = %name,
                        event = event.as_deref().unwrap_or("<none>"),
                        "no outgoing transition; ending finite-state machine"
                    );
                    self.done = true;
                }
            }
        }
        Ok(())
    }

    async fn teardown(&mut self, ctx: &SkillContext) {
        if let (Some(name), true) = (self.current.clone(), self.current_setup) {
            if let Some(state) = self.states.get_mut(&name) {
                state.teardown(ctx).await;
            }
        }
    }

    fn is_done(&self) -> bool {
        self.done
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{noop_context, CountingBehaviour};

    #[tokio::test]
    async fn sequence_advances_through_steps() {
        let ctx = noop_context("seq");
        let mut seq = SequenceBehaviour::new(vec![
            Box::new(CountingBehaviour::done_after(2, None)),
            Box::new(CountingBehaviour::done_after(1, None)),
        ]);

        // Step 1 needs two acts, step 2 one.
        assert!(!seq.is_done());
        seq.act(&ctx).await.unwrap();
        assert!(!seq.is_done());
        seq.act(&ctx).await.unwrap();
        assert!(!seq.is_done());
        seq.act(&ctx).await.unwrap();
        assert!(seq.is_done());
    }

    #[tokio::test]
    async fn fsm_follows_events_and_stops_at_final_state() {
        let ctx = noop_context("fsm");
        let mut fsm = FsmBehaviour::new();
        fsm.register_state("start", Box::new(CountingBehaviour::done_after(1, Some("go"))))
            .unwrap();
        fsm.register_state("work", Box::new(CountingBehaviour::done_after(2, Some("finish"))))
            .unwrap();
        fsm.register_final_state("end", Box::new(CountingBehaviour::done_after(1, None)))
            .unwrap();
        fsm.register_transition("start", "go", "work").unwrap();
        fsm.register_transition("work", "finish", "end").unwrap();

        fsm.act(&ctx).await.unwrap(); // start completes, event "go"
        assert_eq!(fsm.current_state(), Some("work"));
        fsm.act(&ctx).await.unwrap();
        fsm.act(&ctx).await.unwrap(); // work completes, event "finish"
        assert_eq!(fsm.current_state(), Some("end"));
        assert!(!fsm.is_done());
        fsm.act(&ctx).await.unwrap(); // final state completes
        assert!(fsm.is_done());
    }

    #[test]
    fn duplicate_transition_rejected() {
        let mut fsm = FsmBehaviour::new();
        fsm.register_state("a", Box::new(CountingBehaviour::done_after(1, None)))
            .unwrap();
        fsm.register_state("b", Box::new(CountingBehaviour::done_after(1, None)))
            .unwrap();
        fsm.register_transition("a", "x", "b").unwrap();
        assert!(matches!(
            fsm.register_transition("a", "x", "b"),
            Err(RuntimeError::DuplicateTransition { .. })
        ));
    }

    #[test]
    fn transition_requires_known_states() {
        let mut fsm = FsmBehaviour::new();
        fsm.register_state("a", Box::new(CountingBehaviour::done_after(1, None)))
            .unwrap();
        assert!(matches!(
            fsm.register_transition("a", "x", "ghost"),
            Err(RuntimeError::UnknownState(_))
        ));
    }

    #[test]
    fn unregister_restores_equivalence() {
        let mut fsm = FsmBehaviour::new();
        fsm.register_state("a", Box::new(CountingBehaviour::done_after(1, None)))
            .unwrap();
        fsm.register_state("b", Box::new(CountingBehaviour::done_after(1, None)))
            .unwrap();
        fsm.register_transition("a", "x", "b").unwrap();
        let before: Vec<String> = {
            let mut s: Vec<_> = fsm.states().map(str::to_string).collect();
            s.sort();
            s
        };
        let edges_before = fsm.transition_count();

        fsm.register_state("c", Box::new(CountingBehaviour::done_after(1, None)))
            .unwrap();
        fsm.register_transition("a", "y", "c").unwrap();
        fsm.register_transition("c", "z", "b").unwrap();
        fsm.unregister_state("c");

        let after: Vec<String> = {
            let mut s: Vec<_> = fsm.states().map(str::to_string).collect();
            s.sort();
            s
        };
        assert_eq!(before, after);
        assert_eq!(edges_before, fsm.transition_count());
        // The freed (source, event) pair is registrable again.
        fsm.register_state("c2", Box::new(CountingBehaviour::done_after(1, None)))
            .unwrap();
        fsm.register_transition("a", "y", "c2").unwrap();
    }
}
