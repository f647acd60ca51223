use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::world::{ContextHandle, EntityTemplate};

/// One configured stage: the context it loads and the stage-scoped entities
/// instantiated once that context is live.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageDescriptor {
    pub name: String,
    pub context: ContextHandle,
    #[serde(default)]
    pub templates: Vec<EntityTemplate>,
}

impl StageDescriptor {
    pub fn new(name: impl Into<String>, context: &str) -> Self {
        Self {
            name: name.into(),
            context: ContextHandle::new(context),
            templates: Vec::new(),
        }
    }

    pub fn with_template(mut self, template: EntityTemplate) -> Self {
        self.templates.push(template);
        self
    }
}

/// FIFO of stages selected for the current playthrough.
#[derive(Debug, Clone, Default)]
pub struct StageQueue {
    stages: VecDeque<StageDescriptor>,
}

impl StageQueue {
    /// Builds a queue from `indices` in caller order. Indices outside `table`
    /// are skipped with a warning.
    pub fn from_selection(table: &[StageDescriptor], indices: &[usize]) -> Self {
        let mut stages = VecDeque::with_capacity(indices.len());
        for &index in indices {
            match table.get(index) {
                Some(stage) => stages.push_back(stage.clone()),
                None => warn!(index, table_len = table.len(), "stage_index_out_of_range"),
            }
        }
        Self { stages }
    }

    pub fn pop_next(&mut self) -> Option<StageDescriptor> {
        self.stages.pop_front()
    }

    pub fn clear(&mut self) {
        self.stages.clear();
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.stages.iter().map(|stage| stage.name.as_str())
    }
}
