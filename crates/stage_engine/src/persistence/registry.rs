use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::schedule::{Scheduler, Wake};
use crate::session::SessionTask;
use crate::world::{same_identity, EntityError, EntityId, EntityQuery, Environment, LookupScope};

pub const DEFAULT_WATCHDOG_PERIOD: Duration = Duration::from_millis(500);
pub const DEFAULT_SETTLE_TICKS: u32 = 2;

#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Entities looked up and registered once the initial context settles.
    pub targets: Vec<EntityQuery>,
    pub watchdog_period: Duration,
    pub settle_ticks: u32,
    /// Heal containment changes reported by the environment every frame,
    /// ahead of the watchdog.
    pub push_healing: bool,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            targets: Vec::new(),
            watchdog_period: DEFAULT_WATCHDOG_PERIOD,
            settle_ticks: DEFAULT_SETTLE_TICKS,
            push_healing: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryTask {
    InitialRegistration,
    WatchdogSweep,
    DuplicateScan,
    ValidatePostLoad,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistenceState {
    Untracked,
    Persistent,
    /// Tracked but currently outside the persistent container.
    Evicted,
    /// Tracked reference whose entity no longer exists.
    Destroyed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterOutcome {
    Registered,
    AlreadyRegistered,
    Rejected,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub checked: usize,
    pub healed: usize,
    pub skipped_gone: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ValidationReport {
    pub valid: usize,
    pub missing: usize,
    pub purged: usize,
}

impl ValidationReport {
    pub fn is_consistent(&self) -> bool {
        self.purged == self.missing
    }
}

/// Keeps registered entities resident in the persistent container across
/// context resets and resolves identity collisions after each load.
#[derive(Debug)]
pub struct PersistentRegistry {
    config: RegistryConfig,
    // Insertion order matters only for self-collision resolution.
    tracked: Vec<EntityId>,
    attached: bool,
    initialized: bool,
    initial_pending: bool,
}

impl PersistentRegistry {
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            config,
            tracked: Vec::new(),
            attached: false,
            initialized: false,
            initial_pending: false,
        }
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    pub fn len(&self) -> usize {
        self.tracked.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracked.is_empty()
    }

    pub fn contains(&self, id: EntityId) -> bool {
        self.tracked.contains(&id)
    }

    pub fn is_attached(&self) -> bool {
        self.attached
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Starts the startup sequence: the settle-delayed initial registration
    /// and the watchdog. Must run before any other service initialises.
    pub fn attach(&mut self, scheduler: &mut Scheduler<SessionTask>) {
        if self.attached {
            return;
        }
        self.attached = true;
        self.schedule_initial_registration(scheduler);
        scheduler.schedule(
            SessionTask::Registry(RegistryTask::WatchdogSweep),
            Wake::After(self.config.watchdog_period),
        );
        info!(
            targets = self.config.targets.len(),
            watchdog_period_ms = self.config.watchdog_period.as_millis() as u64,
            settle_ticks = self.config.settle_ticks,
            "registry_attached"
        );
    }

    fn schedule_initial_registration(&mut self, scheduler: &mut Scheduler<SessionTask>) {
        if self.initial_pending {
            return;
        }
        self.initial_pending = true;
        scheduler.schedule(
            SessionTask::Registry(RegistryTask::InitialRegistration),
            Wake::Ticks(self.config.settle_ticks),
        );
    }

    pub fn run_task(
        &mut self,
        task: RegistryTask,
        env: &mut Environment,
        scheduler: &mut Scheduler<SessionTask>,
    ) {
        match task {
            RegistryTask::InitialRegistration => {
                self.initial_pending = false;
                self.register_targets(env);
            }
            RegistryTask::WatchdogSweep => {
                let report = self.force_protect_all(env);
                if report.healed > 0 {
                    info!(healed = report.healed, "watchdog_healed");
                }
                scheduler.schedule(
                    SessionTask::Registry(RegistryTask::WatchdogSweep),
                    Wake::After(self.config.watchdog_period),
                );
            }
            RegistryTask::DuplicateScan => {
                self.resolve_collisions(env);
            }
            RegistryTask::ValidatePostLoad => {
                self.validate(env);
            }
        }
    }

    /// Looks up and registers every configured target. Misses are logged and skipped.
    pub fn register_targets(&mut self, env: &mut Environment) -> usize {
        let mut registered = 0;
        for target in self.config.targets.clone() {
            let matches = env.find(&target, LookupScope::Everywhere);
            let Some(&first) = matches.first() else {
                error!(name = %target.name, "persistent_target_missing");
                continue;
            };
            if matches.len() > 1 {
                warn!(name = %target.name, count = matches.len(), "persistent_target_ambiguous");
            }
            if self.register(env, Some(first)) == RegisterOutcome::Registered {
                registered += 1;
            }
        }
        self.initialized = true;
        info!(registered, tracked = self.tracked.len(), "initial_registration_complete");
        registered
    }

    /// Looks up `query` and registers the first match.
    pub fn register_by_query(
        &mut self,
        env: &mut Environment,
        query: &EntityQuery,
    ) -> RegisterOutcome {
        let found = env.find(query, LookupScope::Everywhere).first().copied();
        if found.is_none() {
            error!(name = %query.name, "persistent_target_missing");
        }
        self.register(env, found)
    }

    /// Tracks `entity` and pins it into the persistent container, detaching it
    /// from any parent first.
    pub fn register(&mut self, env: &mut Environment, entity: Option<EntityId>) -> RegisterOutcome {
        let Some(id) = entity else {
            error!("register_null_entity");
            return RegisterOutcome::Rejected;
        };
        if !env.is_alive(id) {
            error!(entity = id.0, "register_destroyed_entity");
            return RegisterOutcome::Rejected;
        }
        if self.contains(id) {
            debug!(entity = id.0, "register_already_tracked");
            return RegisterOutcome::AlreadyRegistered;
        }

        self.tracked.push(id);
        let pinned = env
            .set_parent(id, None)
            .and_then(|()| env.move_to_persistent(id));
        if let Err(error) = pinned {
            warn!(entity = id.0, error = %error, "register_pin_failed");
        }
        info!(
            entity = id.0,
            name = env.entity(id).map(|entity| entity.name.as_str()).unwrap_or(""),
            tracked = self.tracked.len(),
            "entity_registered"
        );
        RegisterOutcome::Registered
    }

    /// Re-pins every tracked entity that has left the persistent container.
    /// Iterates over a snapshot of the registry.
    pub fn force_protect_all(&mut self, env: &mut Environment) -> SweepReport {
        let snapshot = self.tracked.clone();
        let mut report = SweepReport {
            checked: snapshot.len(),
            ..SweepReport::default()
        };
        for id in snapshot {
            match pin_persistent(env, id) {
                Ok(true) => report.healed += 1,
                Ok(false) => {}
                Err(error) if error.is_gone() => {
                    debug!(entity = id.0, "stale_reference_skipped");
                    report.skipped_gone += 1;
                }
                Err(error) => {
                    warn!(entity = id.0, error = %error, "protect_failed");
                    report.failed += 1;
                }
            }
        }
        report
    }

    /// Heals containment changes reported by the environment since the last call.
    pub fn heal_evictions(&mut self, env: &mut Environment) -> usize {
        let changes = env.drain_residence_changes();
        if !self.config.push_healing {
            return 0;
        }
        let mut healed = 0;
        for change in changes {
            if !change.left_persistent() || !self.contains(change.entity) {
                continue;
            }
            match pin_persistent(env, change.entity) {
                Ok(true) => {
                    healed += 1;
                    info!(entity = change.entity.0, "eviction_healed");
                }
                Ok(false) => {}
                Err(error) if error.is_gone() => {
                    debug!(entity = change.entity.0, "stale_reference_skipped");
                }
                Err(error) => warn!(entity = change.entity.0, error = %error, "protect_failed"),
            }
        }
        healed
    }

    /// Snapshot of tracked entities that still exist.
    pub fn list_persistent(&self, env: &Environment) -> Vec<EntityId> {
        self.tracked
            .iter()
            .copied()
            .filter(|id| env.is_alive(*id))
            .collect()
    }

    pub fn state_of(&self, env: &Environment, id: EntityId) -> PersistenceState {
        if !self.contains(id) {
            PersistenceState::Untracked
        } else if !env.is_alive(id) {
            PersistenceState::Destroyed
        } else if env.is_persistent(id) {
            PersistenceState::Persistent
        } else {
            PersistenceState::Evicted
        }
    }

    /// Destroys every tracked entity, clears the registry, and resets the
    /// startup state so a later load can repopulate it.
    pub fn unregister_all(&mut self, env: &mut Environment) {
        let tracked = std::mem::take(&mut self.tracked);
        let mut destroyed = 0;
        for id in &tracked {
            match env.destroy(*id) {
                Ok(_) => destroyed += 1,
                Err(error) if error.is_gone() => {
                    debug!(entity = id.0, "stale_reference_skipped");
                }
                Err(error) => warn!(entity = id.0, error = %error, "unregister_destroy_failed"),
            }
        }
        self.initialized = false;
        info!(released = tracked.len(), destroyed, "registry_cleared");
    }

    pub fn context_unloading(&mut self, env: &mut Environment) {
        let report = self.force_protect_all(env);
        debug!(
            checked = report.checked,
            healed = report.healed,
            skipped_gone = report.skipped_gone,
            "unload_protection_sweep"
        );
    }

    pub fn context_loaded(&mut self, scheduler: &mut Scheduler<SessionTask>) {
        scheduler.schedule(
            SessionTask::Registry(RegistryTask::DuplicateScan),
            Wake::EndOfFrame,
        );
        scheduler.schedule(
            SessionTask::Registry(RegistryTask::ValidatePostLoad),
            Wake::EndOfFrame,
        );
        if self.attached && !self.initialized {
            self.schedule_initial_registration(scheduler);
        }
    }

    /// Destroys context roots that collide with a tracked entity, and later
    /// registry entries that collide with an earlier one.
    pub fn resolve_collisions(&mut self, env: &mut Environment) -> usize {
        let mut keepers: Vec<EntityId> = Vec::new();
        let mut doomed: Vec<EntityId> = Vec::new();
        for id in self.list_persistent(env) {
            let collides = env.entity(id).is_some_and(|entity| {
                keepers.iter().any(|kept| {
                    env.entity(*kept)
                        .is_some_and(|kept| same_identity(kept, entity))
                })
            });
            if collides {
                warn!(entity = id.0, "registry_self_collision");
                doomed.push(id);
            } else {
                keepers.push(id);
            }
        }

        for root in env.context_roots() {
            if self.contains(root) {
                continue;
            }
            let collides = env.entity(root).is_some_and(|entity| {
                keepers.iter().any(|kept| {
                    env.entity(*kept)
                        .is_some_and(|kept| same_identity(kept, entity))
                })
            });
            if collides {
                doomed.push(root);
            }
        }

        let mut destroyed = 0;
        for id in doomed {
            let name = env.entity(id).map(|entity| entity.name.clone()).unwrap_or_default();
            match env.destroy(id) {
                Ok(_) => {
                    destroyed += 1;
                    info!(entity = id.0, name = %name, "duplicate_destroyed");
                }
                Err(error) if error.is_gone() => {
                    debug!(entity = id.0, "stale_reference_skipped");
                }
                Err(error) => warn!(entity = id.0, error = %error, "duplicate_destroy_failed"),
            }
        }
        destroyed
    }

    /// Purges references to destroyed entities and cross-checks the purge
    /// against a tally taken through [`PersistentRegistry::state_of`].
    ///
    /// The tally and the purge agree by construction within one
    /// single-threaded pass; a mismatch means the two predicates have drifted
    /// apart, or an entry was tracked twice.
    pub fn validate(&mut self, env: &Environment) -> ValidationReport {
        let mut report = ValidationReport::default();
        let mut seen = Vec::with_capacity(self.tracked.len());
        for &id in &self.tracked {
            if seen.contains(&id) {
                continue;
            }
            seen.push(id);
            match self.state_of(env, id) {
                PersistenceState::Destroyed => report.missing += 1,
                _ => report.valid += 1,
            }
        }
        let before = self.tracked.len();
        self.tracked.retain(|id| env.is_alive(*id));
        report.purged = before - self.tracked.len();

        if !report.is_consistent() {
            warn!(
                purged = report.purged,
                missing = report.missing,
                "registry_consistency_mismatch"
            );
        } else if report.purged > 0 {
            info!(purged = report.purged, valid = report.valid, "stale_references_purged");
        }
        report
    }
}

/// Detaches `id` and moves it into the persistent container unless it is
/// already there. Returns whether anything changed.
pub fn pin_persistent(env: &mut Environment, id: EntityId) -> Result<bool, EntityError> {
    if env.is_persistent(id) {
        return Ok(false);
    }
    env.set_parent(id, None)?;
    env.move_to_persistent(id)
}
