use tracing::{debug, warn};

use crate::world::{EntityId, Environment};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntitySetKind {
    /// Registered into the persistent registry.
    Persistent,
    /// Destroyed when the current stage completes.
    Stage,
    /// Desk/base furniture, destroyed only on a full reset.
    Desk,
}

/// The orchestrator's three tracked entity sets. An entity belongs to at
/// most one set at a time.
#[derive(Debug, Default)]
pub struct EntitySets {
    persistent: Vec<EntityId>,
    stage: Vec<EntityId>,
    desk: Vec<EntityId>,
}

impl EntitySets {
    fn set_mut(&mut self, kind: EntitySetKind) -> &mut Vec<EntityId> {
        match kind {
            EntitySetKind::Persistent => &mut self.persistent,
            EntitySetKind::Stage => &mut self.stage,
            EntitySetKind::Desk => &mut self.desk,
        }
    }

    pub fn get(&self, kind: EntitySetKind) -> &[EntityId] {
        match kind {
            EntitySetKind::Persistent => &self.persistent,
            EntitySetKind::Stage => &self.stage,
            EntitySetKind::Desk => &self.desk,
        }
    }

    pub fn kind_of(&self, id: EntityId) -> Option<EntitySetKind> {
        [
            EntitySetKind::Persistent,
            EntitySetKind::Stage,
            EntitySetKind::Desk,
        ]
        .into_iter()
        .find(|kind| self.get(*kind).contains(&id))
    }

    /// Adds `id` to `kind`, moving it out of any other set.
    pub fn insert(&mut self, kind: EntitySetKind, id: EntityId) {
        match self.kind_of(id) {
            Some(current) if current == kind => return,
            Some(current) => {
                debug!(entity = id.0, from = ?current, to = ?kind, "entity_set_moved");
                self.set_mut(current).retain(|tracked| *tracked != id);
            }
            None => {}
        }
        self.set_mut(kind).push(id);
    }

    pub fn len(&self, kind: EntitySetKind) -> usize {
        self.get(kind).len()
    }

    pub fn is_empty(&self) -> bool {
        self.persistent.is_empty() && self.stage.is_empty() && self.desk.is_empty()
    }

    /// Empties `kind`, destroying each member. Already-destroyed members are skipped.
    pub fn destroy_all(&mut self, kind: EntitySetKind, env: &mut Environment) -> usize {
        let members = std::mem::take(self.set_mut(kind));
        let mut destroyed = 0;
        for id in members {
            match env.destroy(id) {
                Ok(_) => destroyed += 1,
                Err(error) if error.is_gone() => {
                    debug!(entity = id.0, set = ?kind, "stale_reference_skipped");
                }
                Err(error) => warn!(entity = id.0, error = %error, "entity_destroy_failed"),
            }
        }
        destroyed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::world::{ContextHandle, ContextLibrary, EntityTemplate};

    #[test]
    fn insert_keeps_entity_in_a_single_set() {
        let mut sets = EntitySets::default();
        sets.insert(EntitySetKind::Stage, EntityId(4));
        sets.insert(EntitySetKind::Desk, EntityId(4));
        sets.insert(EntitySetKind::Desk, EntityId(4));

        assert_eq!(sets.kind_of(EntityId(4)), Some(EntitySetKind::Desk));
        assert_eq!(sets.len(EntitySetKind::Stage), 0);
        assert_eq!(sets.len(EntitySetKind::Desk), 1);
    }

    #[test]
    fn destroy_all_tolerates_missing_entities() {
        let library =
            ContextLibrary::default().with_context("office", vec![EntityTemplate::named("Prop")]);
        let mut env = Environment::new(library);
        env.open_initial_context(&ContextHandle::new("office"))
            .expect("office");
        let prop = env.context_roots()[0];

        let mut sets = EntitySets::default();
        sets.insert(EntitySetKind::Stage, prop);
        sets.insert(EntitySetKind::Stage, EntityId(999));

        assert_eq!(sets.destroy_all(EntitySetKind::Stage, &mut env), 1);
        assert!(sets.is_empty());
        assert!(!env.is_alive(prop));
    }
}
