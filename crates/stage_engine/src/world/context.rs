use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::entity::EntityTemplate;
use super::environment::Environment;

/// Progress value at which a gated load waits for activation.
pub const ACTIVATION_GATE_PROGRESS: f32 = 0.9;
pub const DEFAULT_LOAD_PROGRESS_STEP: f32 = 0.25;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContextHandle(pub String);

impl ContextHandle {
    pub fn new(handle: impl Into<String>) -> Self {
        Self(handle.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContextHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Authored top-level entities of one loadable context.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContextContent {
    #[serde(default)]
    pub roots: Vec<EntityTemplate>,
}

#[derive(Debug, Clone, Default)]
pub struct ContextLibrary {
    contents: HashMap<ContextHandle, ContextContent>,
}

impl ContextLibrary {
    pub fn insert(&mut self, handle: ContextHandle, content: ContextContent) {
        self.contents.insert(handle, content);
    }

    pub fn with_context(mut self, handle: &str, roots: Vec<EntityTemplate>) -> Self {
        self.insert(ContextHandle::new(handle), ContextContent { roots });
        self
    }

    pub fn get(&self, handle: &ContextHandle) -> Option<&ContextContent> {
        self.contents.get(handle)
    }

    pub fn contains(&self, handle: &ContextHandle) -> bool {
        self.contents.contains_key(handle)
    }

    pub fn len(&self) -> usize {
        self.contents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contents.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadMode {
    /// Replace the active context wholesale.
    Single,
    /// Add the content to the active context.
    Additive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LoadTicket(pub u64);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ContextError {
    #[error("unknown context '{0}'")]
    UnknownContext(ContextHandle),
    #[error("load ticket {0:?} is not pending")]
    UnknownTicket(LoadTicket),
}

#[derive(Debug, Clone)]
pub(crate) struct PendingLoad {
    pub(crate) ticket: LoadTicket,
    pub(crate) handle: ContextHandle,
    pub(crate) mode: LoadMode,
    pub(crate) progress: f32,
    pub(crate) allow_activation: bool,
}

impl PendingLoad {
    /// Advances progress by one step. Progress never passes the activation
    /// gate until activation has been allowed.
    pub(crate) fn step(&mut self, amount: f32) {
        self.progress = (self.progress + amount).min(ACTIVATION_GATE_PROGRESS);
    }

    pub(crate) fn ready_to_activate(&self) -> bool {
        self.allow_activation && self.progress >= ACTIVATION_GATE_PROGRESS
    }
}

/// Notification channels fired while a load completes.
///
/// `context_unloading` runs synchronously before teardown; entities still in
/// the active context when it returns are destroyed.
pub trait ContextHooks {
    fn context_unloading(&mut self, env: &mut Environment, outgoing: &ContextHandle);
    fn context_loaded(
        &mut self,
        env: &mut Environment,
        loaded: &ContextHandle,
        ticket: LoadTicket,
        mode: LoadMode,
    );
}

/// Hooks that ignore every notification.
pub struct NoHooks;

impl ContextHooks for NoHooks {
    fn context_unloading(&mut self, _env: &mut Environment, _outgoing: &ContextHandle) {}

    fn context_loaded(
        &mut self,
        _env: &mut Environment,
        _loaded: &ContextHandle,
        _ticket: LoadTicket,
        _mode: LoadMode,
    ) {
    }
}
