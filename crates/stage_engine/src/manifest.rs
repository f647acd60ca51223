use std::collections::{BTreeMap, HashSet};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::flow::{FlowConfig, StageDescriptor};
use crate::persistence::{DuplicatePolicy, RegistryConfig, DEFAULT_SETTLE_TICKS};
use crate::session::SessionConfig;
use crate::world::{
    ContextContent, ContextError, ContextHandle, ContextLibrary, EntityQuery, EntityTemplate,
    Environment, DEFAULT_LOAD_PROGRESS_STEP,
};

/// Authored description of a whole session: context library, registry
/// targets, and the stage table.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionManifest {
    pub initial_context: ContextHandle,
    pub contexts: BTreeMap<ContextHandle, ContextContent>,
    #[serde(default)]
    pub registry: RegistryManifest,
    pub flow: FlowManifest,
    #[serde(default = "default_load_step")]
    pub load_step: f32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RegistryManifest {
    #[serde(default)]
    pub targets: Vec<EntityQuery>,
    #[serde(default = "default_watchdog_period_seconds")]
    pub watchdog_period_seconds: f32,
    #[serde(default = "default_settle_ticks")]
    pub settle_ticks: u32,
    #[serde(default = "default_push_healing")]
    pub push_healing: bool,
}

impl Default for RegistryManifest {
    fn default() -> Self {
        Self {
            targets: Vec::new(),
            watchdog_period_seconds: default_watchdog_period_seconds(),
            settle_ticks: default_settle_ticks(),
            push_healing: default_push_healing(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct FlowManifest {
    pub idle_context: ContextHandle,
    pub stages: Vec<StageDescriptor>,
    #[serde(default)]
    pub persistent_templates: Vec<EntityTemplate>,
    #[serde(default)]
    pub desk_templates: Vec<EntityTemplate>,
    #[serde(default)]
    pub initial_desk: Vec<EntityQuery>,
    #[serde(default)]
    pub bootstrap_policy: DuplicatePolicy,
}

fn default_load_step() -> f32 {
    DEFAULT_LOAD_PROGRESS_STEP
}

fn default_watchdog_period_seconds() -> f32 {
    0.5
}

fn default_settle_ticks() -> u32 {
    DEFAULT_SETTLE_TICKS
}

fn default_push_healing() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ManifestError {
    #[error("initial context '{0}' is not defined in contexts")]
    UnknownInitialContext(ContextHandle),
    #[error("idle context '{0}' is not defined in contexts")]
    UnknownIdleContext(ContextHandle),
    #[error("stage '{stage}' references undefined context '{context}'")]
    UnknownStageContext {
        stage: String,
        context: ContextHandle,
    },
    #[error("stage at index {0} has an empty name")]
    EmptyStageName(usize),
    #[error("stage name '{0}' is used more than once")]
    DuplicateStageName(String),
    #[error("manifest defines no stages")]
    NoStages,
    #[error("watchdog period must be a positive number of seconds, got {0}")]
    InvalidWatchdogPeriod(f32),
    #[error("load step must be in (0, 1], got {0}")]
    InvalidLoadStep(f32),
    #[error(transparent)]
    Context(#[from] ContextError),
}

impl SessionManifest {
    pub fn validate(&self) -> Result<(), ManifestError> {
        if !self.contexts.contains_key(&self.initial_context) {
            return Err(ManifestError::UnknownInitialContext(
                self.initial_context.clone(),
            ));
        }
        if !self.contexts.contains_key(&self.flow.idle_context) {
            return Err(ManifestError::UnknownIdleContext(
                self.flow.idle_context.clone(),
            ));
        }
        if self.flow.stages.is_empty() {
            return Err(ManifestError::NoStages);
        }

        let mut seen = HashSet::new();
        for (index, stage) in self.flow.stages.iter().enumerate() {
            if stage.name.trim().is_empty() {
                return Err(ManifestError::EmptyStageName(index));
            }
            if !seen.insert(stage.name.as_str()) {
                return Err(ManifestError::DuplicateStageName(stage.name.clone()));
            }
            if !self.contexts.contains_key(&stage.context) {
                return Err(ManifestError::UnknownStageContext {
                    stage: stage.name.clone(),
                    context: stage.context.clone(),
                });
            }
        }

        let period = self.registry.watchdog_period_seconds;
        if !period.is_finite() || period <= 0.0 {
            return Err(ManifestError::InvalidWatchdogPeriod(period));
        }
        if !self.load_step.is_finite() || self.load_step <= 0.0 || self.load_step > 1.0 {
            return Err(ManifestError::InvalidLoadStep(self.load_step));
        }
        Ok(())
    }

    pub fn context_library(&self) -> ContextLibrary {
        let mut library = ContextLibrary::default();
        for (handle, content) in &self.contexts {
            library.insert(handle.clone(), content.clone());
        }
        library
    }

    /// Validates the manifest and opens its initial context.
    pub fn build_environment(&self) -> Result<Environment, ManifestError> {
        self.validate()?;
        let mut env = Environment::new(self.context_library()).with_load_step(self.load_step);
        env.open_initial_context(&self.initial_context)?;
        Ok(env)
    }

    pub fn session_config(&self) -> SessionConfig {
        let registry = RegistryConfig {
            targets: self.registry.targets.clone(),
            watchdog_period: Duration::from_secs_f32(self.registry.watchdog_period_seconds),
            settle_ticks: self.registry.settle_ticks,
            push_healing: self.registry.push_healing,
        };
        let flow = FlowConfig {
            stages: self.flow.stages.clone(),
            idle_context: self.flow.idle_context.clone(),
            persistent_templates: self.flow.persistent_templates.clone(),
            desk_templates: self.flow.desk_templates.clone(),
            initial_desk: self.flow.initial_desk.clone(),
            bootstrap_policy: self.flow.bootstrap_policy,
        };
        SessionConfig { registry, flow }
    }
}
