use std::collections::{BTreeMap, VecDeque};

use thiserror::Error;
use tracing::{debug, info};

use super::context::{
    ContextError, ContextHandle, ContextHooks, ContextLibrary, LoadMode, LoadTicket, PendingLoad,
    DEFAULT_LOAD_PROGRESS_STEP,
};
use super::entity::{
    Entity, EntityId, EntityIdAllocator, EntityQuery, EntityTemplate, Residence, INSTANCE_SUFFIX,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum EntityError {
    #[error("entity {0:?} no longer exists")]
    Gone(EntityId),
    #[error("entity {0:?} must be a root entity for this operation")]
    NotRoot(EntityId),
    #[error("parenting {child:?} under {parent:?} would create a cycle")]
    ParentCycle { child: EntityId, parent: EntityId },
}

impl EntityError {
    /// The operation was skipped because its target had already been destroyed.
    pub fn is_gone(&self) -> bool {
        matches!(self, Self::Gone(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupScope {
    ActiveContext,
    Persistent,
    Everywhere,
}

impl LookupScope {
    fn includes(self, residence: Residence) -> bool {
        match self {
            Self::ActiveContext => residence == Residence::Context,
            Self::Persistent => residence == Residence::Persistent,
            Self::Everywhere => true,
        }
    }
}

/// Containment change observed by the environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResidenceChange {
    pub entity: EntityId,
    pub from: Residence,
    pub to: Residence,
}

impl ResidenceChange {
    pub fn left_persistent(&self) -> bool {
        self.from == Residence::Persistent && self.to != Residence::Persistent
    }
}

/// The host environment graph: entities, the active context, the persistent
/// container, and gated asynchronous context loads.
#[derive(Debug)]
pub struct Environment {
    allocator: EntityIdAllocator,
    entities: BTreeMap<EntityId, Entity>,
    library: ContextLibrary,
    active_context: Option<ContextHandle>,
    pending_loads: VecDeque<PendingLoad>,
    next_ticket: u64,
    load_step: f32,
    residence_changes: Vec<ResidenceChange>,
}

impl Environment {
    pub fn new(library: ContextLibrary) -> Self {
        Self {
            allocator: EntityIdAllocator::default(),
            entities: BTreeMap::new(),
            library,
            active_context: None,
            pending_loads: VecDeque::new(),
            next_ticket: 0,
            load_step: DEFAULT_LOAD_PROGRESS_STEP,
            residence_changes: Vec::new(),
        }
    }

    pub fn with_load_step(mut self, load_step: f32) -> Self {
        if load_step.is_finite() && load_step > 0.0 {
            self.load_step = load_step;
        }
        self
    }

    pub fn library(&self) -> &ContextLibrary {
        &self.library
    }

    pub fn active_context(&self) -> Option<&ContextHandle> {
        self.active_context.as_ref()
    }

    /// Opens the first context synchronously, without notifications.
    pub fn open_initial_context(&mut self, handle: &ContextHandle) -> Result<(), ContextError> {
        let roots = self
            .library
            .get(handle)
            .map(|content| content.roots.clone())
            .ok_or_else(|| ContextError::UnknownContext(handle.clone()))?;
        self.teardown_active_context();
        self.active_context = Some(handle.clone());
        for template in &roots {
            self.spawn_tree(template, None, Residence::Context, false);
        }
        info!(context = %handle, entity_count = self.entity_count(), "initial_context_opened");
        Ok(())
    }

    /// Creates a fresh copy of `template` at the root of the active context.
    /// The root's name receives the instancing suffix.
    pub fn instantiate(&mut self, template: &EntityTemplate) -> EntityId {
        self.spawn_tree(template, None, Residence::Context, true)
    }

    fn spawn_tree(
        &mut self,
        template: &EntityTemplate,
        parent: Option<EntityId>,
        residence: Residence,
        as_instance: bool,
    ) -> EntityId {
        let id = self.allocator.allocate();
        let name = if as_instance {
            format!("{}{INSTANCE_SUFFIX}", template.name)
        } else {
            template.name.clone()
        };
        self.entities.insert(
            id,
            Entity {
                id,
                name,
                stable_key: template.key.clone(),
                active: template.active,
                components: template.components.clone(),
                transform: template.transform,
                parent,
                residence,
            },
        );
        for child in &template.children {
            self.spawn_tree(child, Some(id), residence, false);
        }
        id
    }

    /// Destroys `id` and its whole subtree, returning how many entities were removed.
    pub fn destroy(&mut self, id: EntityId) -> Result<usize, EntityError> {
        if !self.entities.contains_key(&id) {
            return Err(EntityError::Gone(id));
        }
        let doomed = self.subtree_of(id);
        for entity in &doomed {
            self.entities.remove(entity);
        }
        Ok(doomed.len())
    }

    pub fn is_alive(&self, id: EntityId) -> bool {
        self.entities.contains_key(&id)
    }

    pub fn entity(&self, id: EntityId) -> Option<&Entity> {
        self.entities.get(&id)
    }

    pub fn entity_mut(&mut self, id: EntityId) -> Option<&mut Entity> {
        self.entities.get_mut(&id)
    }

    pub fn entity_count(&self) -> usize {
        self.entities.len()
    }

    pub fn residence_of(&self, id: EntityId) -> Option<Residence> {
        self.entities.get(&id).map(|entity| entity.residence)
    }

    pub fn is_persistent(&self, id: EntityId) -> bool {
        self.residence_of(id) == Some(Residence::Persistent)
    }

    pub fn children_of(&self, id: EntityId) -> Vec<EntityId> {
        self.entities
            .values()
            .filter(|entity| entity.parent == Some(id))
            .map(|entity| entity.id)
            .collect()
    }

    fn subtree_of(&self, id: EntityId) -> Vec<EntityId> {
        let mut subtree = vec![id];
        let mut cursor = 0;
        while cursor < subtree.len() {
            let current = subtree[cursor];
            subtree.extend(self.children_of(current));
            cursor += 1;
        }
        subtree
    }

    /// Re-parents `child`. Attaching moves the subtree into the parent's
    /// container; detaching keeps the container the subtree was already in.
    pub fn set_parent(
        &mut self,
        child: EntityId,
        parent: Option<EntityId>,
    ) -> Result<(), EntityError> {
        if !self.is_alive(child) {
            return Err(EntityError::Gone(child));
        }
        let Some(parent) = parent else {
            if let Some(entity) = self.entities.get_mut(&child) {
                entity.parent = None;
            }
            return Ok(());
        };

        let parent_residence = self.residence_of(parent).ok_or(EntityError::Gone(parent))?;
        let mut ancestor = Some(parent);
        while let Some(current) = ancestor {
            if current == child {
                return Err(EntityError::ParentCycle { child, parent });
            }
            ancestor = self.entities.get(&current).and_then(|entity| entity.parent);
        }

        if let Some(entity) = self.entities.get_mut(&child) {
            entity.parent = Some(parent);
        }
        self.set_subtree_residence(child, parent_residence);
        Ok(())
    }

    /// Moves a root entity into the persistent container. Returns whether
    /// anything changed.
    pub fn move_to_persistent(&mut self, id: EntityId) -> Result<bool, EntityError> {
        self.move_root(id, Residence::Persistent)
    }

    /// Moves a root entity back into the active context.
    pub fn move_to_context(&mut self, id: EntityId) -> Result<bool, EntityError> {
        self.move_root(id, Residence::Context)
    }

    fn move_root(&mut self, id: EntityId, residence: Residence) -> Result<bool, EntityError> {
        let entity = self.entities.get(&id).ok_or(EntityError::Gone(id))?;
        if !entity.is_root() {
            return Err(EntityError::NotRoot(id));
        }
        if entity.residence == residence {
            return Ok(false);
        }
        self.set_subtree_residence(id, residence);
        Ok(true)
    }

    fn set_subtree_residence(&mut self, id: EntityId, residence: Residence) {
        for member in self.subtree_of(id) {
            if let Some(entity) = self.entities.get_mut(&member) {
                if entity.residence != residence {
                    self.residence_changes.push(ResidenceChange {
                        entity: member,
                        from: entity.residence,
                        to: residence,
                    });
                    entity.residence = residence;
                }
            }
        }
    }

    pub fn set_active(&mut self, id: EntityId, active: bool) -> Result<(), EntityError> {
        let entity = self.entities.get_mut(&id).ok_or(EntityError::Gone(id))?;
        entity.active = active;
        Ok(())
    }

    pub fn rename(&mut self, id: EntityId, name: impl Into<String>) -> Result<(), EntityError> {
        let entity = self.entities.get_mut(&id).ok_or(EntityError::Gone(id))?;
        entity.name = name.into();
        Ok(())
    }

    /// Finds entities at any depth, including inactive ones.
    pub fn find(&self, query: &EntityQuery, scope: LookupScope) -> Vec<EntityId> {
        let matches: Vec<EntityId> = self
            .entities
            .values()
            .filter(|entity| scope.includes(entity.residence) && query.matches(entity))
            .map(|entity| entity.id)
            .collect();
        if query.key.is_none() && !matches.is_empty() {
            debug!(name = %query.name, count = matches.len(), "lookup_by_name_fallback");
        }
        matches
    }

    pub fn find_by_name(&self, name: &str, scope: LookupScope) -> Vec<EntityId> {
        self.find(&EntityQuery::by_name(name), scope)
    }

    pub fn context_roots(&self) -> Vec<EntityId> {
        self.roots_in(Residence::Context)
    }

    pub fn persistent_roots(&self) -> Vec<EntityId> {
        self.roots_in(Residence::Persistent)
    }

    fn roots_in(&self, residence: Residence) -> Vec<EntityId> {
        self.entities
            .values()
            .filter(|entity| entity.is_root() && entity.residence == residence)
            .map(|entity| entity.id)
            .collect()
    }

    pub fn drain_residence_changes(&mut self) -> Vec<ResidenceChange> {
        std::mem::take(&mut self.residence_changes)
    }

    /// Queues an asynchronous load. The load is held at the activation gate
    /// until [`Environment::allow_activation`] is called for its ticket.
    pub fn load_context(
        &mut self,
        handle: &ContextHandle,
        mode: LoadMode,
    ) -> Result<LoadTicket, ContextError> {
        if !self.library.contains(handle) {
            return Err(ContextError::UnknownContext(handle.clone()));
        }
        let ticket = LoadTicket(self.next_ticket);
        self.next_ticket = self.next_ticket.saturating_add(1);
        self.pending_loads.push_back(PendingLoad {
            ticket,
            handle: handle.clone(),
            mode,
            progress: 0.0,
            allow_activation: false,
        });
        debug!(context = %handle, ?mode, ticket = ticket.0, "context_load_queued");
        Ok(ticket)
    }

    /// Current progress of a pending load, or `None` once it has completed.
    pub fn load_progress(&self, ticket: LoadTicket) -> Option<f32> {
        self.pending_loads
            .iter()
            .find(|load| load.ticket == ticket)
            .map(|load| load.progress)
    }

    pub fn allow_activation(&mut self, ticket: LoadTicket) -> Result<(), ContextError> {
        let load = self
            .pending_loads
            .iter_mut()
            .find(|load| load.ticket == ticket)
            .ok_or(ContextError::UnknownTicket(ticket))?;
        load.allow_activation = true;
        Ok(())
    }

    pub fn pending_load_count(&self) -> usize {
        self.pending_loads.len()
    }

    /// Advances the front pending load by one step and completes it when its
    /// activation gate is open. Returns the handle of a completed load.
    pub fn advance_loads(&mut self, hooks: &mut dyn ContextHooks) -> Option<ContextHandle> {
        let step = self.load_step;
        let front = self.pending_loads.front_mut()?;
        front.step(step);
        if !front.ready_to_activate() {
            return None;
        }
        let load = self.pending_loads.pop_front()?;
        self.complete_load(load, hooks)
    }

    fn complete_load(
        &mut self,
        load: PendingLoad,
        hooks: &mut dyn ContextHooks,
    ) -> Option<ContextHandle> {
        let roots = self.library.get(&load.handle)?.roots.clone();
        if load.mode == LoadMode::Single {
            if let Some(outgoing) = self.active_context.clone() {
                hooks.context_unloading(self, &outgoing);
            }
            let destroyed = self.teardown_active_context();
            self.active_context = Some(load.handle.clone());
            debug!(context = %load.handle, destroyed, "context_torn_down");
        }
        for template in &roots {
            self.spawn_tree(template, None, Residence::Context, false);
        }
        info!(
            context = %load.handle,
            mode = ?load.mode,
            entity_count = self.entity_count(),
            "context_loaded"
        );
        hooks.context_loaded(self, &load.handle, load.ticket, load.mode);
        Some(load.handle)
    }

    fn teardown_active_context(&mut self) -> usize {
        let before = self.entities.len();
        self.entities
            .retain(|_, entity| entity.residence == Residence::Persistent);
        before - self.entities.len()
    }
}
