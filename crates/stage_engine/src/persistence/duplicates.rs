use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::world::{EntityId, Environment};

/// Which candidate survives when several entities claim one logical identity.
///
/// Only the persistent-entity bootstrap consults this policy. The registry's
/// post-load scan always keeps the persistent original.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DuplicatePolicy {
    #[default]
    PreferPersistent,
    PreferNewest,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DuplicateResolution {
    pub kept: Option<EntityId>,
    pub destroyed: Vec<EntityId>,
}

/// Picks the survivor among `candidates` without touching the environment.
pub fn pick_survivor(
    env: &Environment,
    candidates: &[EntityId],
    policy: DuplicatePolicy,
) -> Option<EntityId> {
    let alive = candidates.iter().copied().filter(|id| env.is_alive(*id));
    match policy {
        DuplicatePolicy::PreferNewest => alive.max(),
        DuplicatePolicy::PreferPersistent => {
            let alive: Vec<EntityId> = alive.collect();
            alive
                .iter()
                .copied()
                .filter(|id| env.is_persistent(*id))
                .min()
                .or_else(|| alive.iter().copied().min())
        }
    }
}

/// Keeps one survivor per `policy` and destroys the remaining candidates.
pub fn resolve_duplicates(
    env: &mut Environment,
    candidates: &[EntityId],
    policy: DuplicatePolicy,
) -> DuplicateResolution {
    let Some(kept) = pick_survivor(env, candidates, policy) else {
        return DuplicateResolution::default();
    };

    let mut destroyed = Vec::new();
    for &candidate in candidates {
        if candidate == kept {
            continue;
        }
        match env.destroy(candidate) {
            Ok(_) => destroyed.push(candidate),
            Err(error) if error.is_gone() => {
                debug!(entity = candidate.0, "duplicate_already_gone");
            }
            Err(error) => warn!(entity = candidate.0, error = %error, "duplicate_destroy_failed"),
        }
    }
    if !destroyed.is_empty() {
        debug!(kept = kept.0, destroyed = destroyed.len(), ?policy, "duplicates_resolved");
    }
    DuplicateResolution {
        kept: Some(kept),
        destroyed,
    }
}
