// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Skills: named bundles of handlers, behaviours, and shared state.

use std::{
    any::Any,
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use tokio_util::sync::CancellationToken;

use crate::behaviour::Behaviour;
use crate::context::AgentContext;
use crate::dispatcher::Handler;
use crate::error::RuntimeError;
use crate::scheduler::Schedule;
use crate::tasks::TaskManager;

// ── Skill context ─────────────────────────────────────────────────────────────

/// Per-skill execution context: the agent identity, the skill's shared
/// state, the task manager, and the cooperative stop flag.
///
/// Shared state is only ever touched from the agent loop (handlers and
/// behaviours run serially), but it sits behind a mutex so the context can
/// be cloned freely into scheduler entries and dispatcher entries.
#[derive(Clone)]
pub struct SkillContext {
    skill: String,
    agent: AgentContext,
    state: Arc<Mutex<HashMap<String, Box<dyn Any + Send>>>>,
    tasks: TaskManager,
    cancel: CancellationToken,
}

impl SkillContext {
    pub(crate) fn new(
        skill: String,
        agent: AgentContext,
        tasks: TaskManager,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            skill,
            agent,
            state: Arc::new(Mutex::new(HashMap::new())),
            tasks,
            cancel,
        }
    }

    pub fn skill_name(&self) -> &str {
        &self.skill
    }

    pub fn agent(&self) -> &AgentContext {
        &self.agent
    }

    pub fn tasks(&self) -> &TaskManager {
        &self.tasks
    }

    /// Behaviours must poll this between yieldable units of work and return
    /// early when it reports `true`.
    pub fn is_stopping(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Store a value in the skill's shared state.
    pub fn set<T: Any + Send>(&self, key: &str, value: T) {
        self.state
            .lock()
            .expect("skill state lock")
            .insert(key.to_string(), Box::new(value));
    }

    /// Clone a value out of the shared state.
    pub fn get<T: Any + Send + Clone>(&self, key: &str) -> Option<T> {
        self.state
            .lock()
            .expect("skill state lock")
            .get(key)
            .and_then(|v| v.downcast_ref::<T>())
            .cloned()
    }

    /// Mutate a value in place; returns `None` when the key is absent or of
    /// a different type.
    pub fn update<T: Any + Send, R>(&self, key: &str, f: impl FnOnce(&mut T) -> R) -> Option<R> {
        self.state
            .lock()
            .expect("skill state lock")
            .get_mut(key)
            .and_then(|v| v.downcast_mut::<T>())
            .map(f)
    }

    /// Remove and return a value from the shared state.
    pub fn take<T: Any + Send>(&self, key: &str) -> Option<T> {
        let mut state = self.state.lock().expect("skill state lock");
        let value = state.remove(key)?;
        match value.downcast::<T>() {
            Ok(v) => Some(*v),
            Err(v) => {
                // Wrong type requested; put it back untouched.
                state.insert(key.to_string(), v);
                None
            }
        }
    }
}

// ── Skill definition ──────────────────────────────────────────────────────────

pub(crate) struct BehaviourSpec {
    pub name: String,
    pub behaviour: Box<dyn Behaviour>,
    pub schedule: Schedule,
    pub execution_timeout: Option<Duration>,
}

/// A skill as registered with the runtime: handlers and behaviours are
/// collected here and wired into the dispatcher and scheduler at startup.
pub struct Skill {
    name: String,
    pub(crate) handlers: Vec<(String, Box<dyn Handler>)>,
    pub(crate) behaviours: Vec<BehaviourSpec>,
}

impl Skill {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            handlers: Vec::new(),
            behaviours: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Register a handler under a name unique within this skill.
    pub fn add_handler(
        &mut self,
        name: impl Into<String>,
        handler: Box<dyn Handler>,
    ) -> Result<(), RuntimeError> {
        let name = name.into();
        if self.handlers.iter().any(|(n, _)| *n == name) {
            return Err(RuntimeError::DuplicateHandler {
                skill: self.name.clone(),
                name,
            });
        }
        self.handlers.push((name, handler));
        Ok(())
    }

    /// Register a behaviour under a name unique within this skill.
    pub fn add_behaviour(
        &mut self,
        name: impl Into<String>,
        behaviour: Box<dyn Behaviour>,
        schedule: Schedule,
    ) -> Result<(), RuntimeError> {
        self.add_behaviour_with_timeout(name, behaviour, schedule, None)
    }

    /// Like [`Self::add_behaviour`] with a per-behaviour execution timeout;
    /// `None` inherits the runtime default.
    pub fn add_behaviour_with_timeout(
        &mut self,
        name: impl Into<String>,
        behaviour: Box<dyn Behaviour>,
        schedule: Schedule,
        execution_timeout: Option<Duration>,
    ) -> Result<(), RuntimeError> {
        let name = name.into();
        if self.behaviours.iter().any(|b| b.name == name) {
            return Err(RuntimeError::DuplicateBehaviour {
                skill: self.name.clone(),
                name,
            });
        }
        self.behaviours.push(BehaviourSpec {
            name,
            behaviour,
            schedule,
            execution_timeout,
        });
        Ok(())
    }

    pub(crate) fn into_parts(
        self,
    ) -> (
        String,
        Vec<(String, Box<dyn Handler>)>,
        Vec<BehaviourSpec>,
    ) {
        (self.name, self.handlers, self.behaviours)
    }
}
