use std::time::Duration;

use tracing::{debug, error, info, warn};

use super::entity_sets::{EntitySetKind, EntitySets};
use super::session_id::SessionId;
use super::stage::{StageDescriptor, StageQueue};
use crate::persistence::{pin_persistent, resolve_duplicates, DuplicatePolicy, PersistentRegistry};
use crate::progress::ProgressStore;
use crate::schedule::{Scheduler, Wake};
use crate::session::SessionTask;
use crate::world::{
    normalize_instance_name, ContextHandle, EntityId, EntityQuery, EntityTemplate, Environment,
    LoadMode, LoadTicket, LookupScope, ACTIVATION_GATE_PROGRESS,
};

#[derive(Debug, Clone)]
pub struct FlowConfig {
    pub stages: Vec<StageDescriptor>,
    pub idle_context: ContextHandle,
    /// Registered into the persistent registry on the first playthrough.
    pub persistent_templates: Vec<EntityTemplate>,
    /// Base furniture kept across stages and destroyed on a full reset.
    pub desk_templates: Vec<EntityTemplate>,
    /// Authored entities hidden while a stage loads.
    pub initial_desk: Vec<EntityQuery>,
    pub bootstrap_policy: DuplicatePolicy,
}

impl FlowConfig {
    pub fn new(idle_context: &str) -> Self {
        Self {
            stages: Vec::new(),
            idle_context: ContextHandle::new(idle_context),
            persistent_templates: Vec::new(),
            desk_templates: Vec::new(),
            initial_desk: Vec::new(),
            bootstrap_policy: DuplicatePolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowTask {
    PollLoad,
    InstantiateStage,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum StagePhase {
    Loading { ticket: LoadTicket },
    Active { started_at: Duration },
}

#[derive(Debug, Clone)]
struct CurrentStage {
    descriptor: StageDescriptor,
    phase: StagePhase,
}

/// Services the orchestrator drives during one call.
pub struct FlowContext<'a> {
    pub env: &'a mut Environment,
    pub registry: &'a mut PersistentRegistry,
    pub scheduler: &'a mut Scheduler<SessionTask>,
    pub progress: &'a mut dyn ProgressStore,
}

/// Runs the stage queue: context resets, stage-scoped entities, and the
/// persistent/desk entity bootstrap.
#[derive(Debug)]
pub struct StageFlow {
    config: FlowConfig,
    queue: StageQueue,
    current: Option<CurrentStage>,
    session_id: SessionId,
    sets: EntitySets,
    bootstrapped: bool,
    // Single-shot "finished loading" subscription for the stage in flight.
    awaiting_load: Option<LoadTicket>,
    return_context: Option<ContextHandle>,
}

impl StageFlow {
    pub fn new(config: FlowConfig) -> Self {
        Self {
            config,
            queue: StageQueue::default(),
            current: None,
            session_id: SessionId::default(),
            sets: EntitySets::default(),
            bootstrapped: false,
            awaiting_load: None,
            return_context: None,
        }
    }

    pub fn config(&self) -> &FlowConfig {
        &self.config
    }

    pub fn remaining_stages(&self) -> usize {
        self.queue.len()
    }

    pub fn current_stage_name(&self) -> Option<&str> {
        self.current
            .as_ref()
            .map(|current| current.descriptor.name.as_str())
    }

    pub fn is_stage_active(&self) -> bool {
        matches!(
            self.current,
            Some(CurrentStage {
                phase: StagePhase::Active { .. },
                ..
            })
        )
    }

    pub fn is_stage_loading(&self) -> bool {
        matches!(
            self.current,
            Some(CurrentStage {
                phase: StagePhase::Loading { .. },
                ..
            })
        )
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub fn entity_sets(&self) -> &EntitySets {
        &self.sets
    }

    pub fn is_bootstrapped(&self) -> bool {
        self.bootstrapped
    }

    /// Starts a playthrough over `indices` in the given order. An empty or
    /// entirely invalid selection leaves everything unchanged.
    pub fn start_playthrough(
        &mut self,
        cx: &mut FlowContext<'_>,
        indices: &[usize],
        return_context: Option<ContextHandle>,
    ) -> bool {
        if indices.is_empty() {
            warn!("playthrough_empty_selection");
            return false;
        }
        let queue = StageQueue::from_selection(&self.config.stages, indices);
        if queue.is_empty() {
            warn!(requested = indices.len(), "playthrough_no_valid_stages");
            return false;
        }

        self.release_abandoned_load(cx.env);
        if let Some(current) = self.current.take() {
            warn!(stage = %current.descriptor.name, "playthrough_restarted");
            self.awaiting_load = None;
            cx.scheduler
                .cancel_where(|task| matches!(task, SessionTask::Flow(_)));
            self.sets.destroy_all(EntitySetKind::Stage, cx.env);
        }

        self.queue = queue;
        self.return_context = return_context;
        self.session_id = self.session_id.next();
        info!(
            session_id = self.session_id.0,
            stages = self.queue.len(),
            "playthrough_started"
        );

        self.bootstrap_entities(cx);
        self.advance(cx);
        true
    }

    /// Records the finished stage, discards its entities, and moves on.
    pub fn complete_current_stage(&mut self, cx: &mut FlowContext<'_>) -> bool {
        let (name, started_at) = match &self.current {
            Some(CurrentStage {
                descriptor,
                phase: StagePhase::Active { started_at },
            }) => (descriptor.name.clone(), *started_at),
            Some(current) => {
                warn!(stage = %current.descriptor.name, "complete_while_loading");
                return false;
            }
            None => {
                warn!("complete_without_active_stage");
                return false;
            }
        };

        let elapsed = cx.scheduler.now().saturating_sub(started_at);
        cx.progress
            .record_stage_complete(&name, elapsed.as_secs_f64());
        let destroyed = self.sets.destroy_all(EntitySetKind::Stage, cx.env);
        self.current = None;
        info!(
            stage = %name,
            elapsed_ms = elapsed.as_millis() as u64,
            destroyed,
            remaining = self.queue.len(),
            "stage_completed"
        );

        self.advance(cx);
        true
    }

    /// Abandons the playthrough, releases every tracked entity, and loads the
    /// idle context.
    pub fn return_to_idle(&mut self, cx: &mut FlowContext<'_>) {
        self.release_abandoned_load(cx.env);
        self.queue.clear();
        self.current = None;
        self.awaiting_load = None;
        cx.scheduler
            .cancel_where(|task| matches!(task, SessionTask::Flow(_)));

        let stage = self.sets.destroy_all(EntitySetKind::Stage, cx.env);
        let persistent = self.sets.destroy_all(EntitySetKind::Persistent, cx.env);
        let desk = self.sets.destroy_all(EntitySetKind::Desk, cx.env);
        cx.registry.unregister_all(cx.env);
        self.bootstrapped = false;
        cx.progress.mark_not_first_time();

        let target = self
            .return_context
            .take()
            .unwrap_or_else(|| self.config.idle_context.clone());
        let loaded = cx
            .env
            .load_context(&target, LoadMode::Single)
            .and_then(|ticket| cx.env.allow_activation(ticket));
        match loaded {
            Ok(()) => info!(
                context = %target,
                session_id = self.session_id.0,
                stage,
                persistent,
                desk,
                "returning_to_idle"
            ),
            Err(error) => error!(context = %target, error = %error, "idle_load_failed"),
        }
    }

    pub fn run_task(&mut self, task: FlowTask, cx: &mut FlowContext<'_>) {
        match task {
            FlowTask::PollLoad => self.poll_load(cx),
            FlowTask::InstantiateStage => self.instantiate_stage(cx),
        }
    }

    /// Single-shot "finished loading" handler for the stage in flight.
    /// Completions of abandoned loads carry another ticket and are ignored.
    pub fn context_loaded(&mut self, scheduler: &mut Scheduler<SessionTask>, ticket: LoadTicket) {
        if self.awaiting_load != Some(ticket) {
            return;
        }
        self.awaiting_load = None;
        scheduler.schedule(
            SessionTask::Flow(FlowTask::InstantiateStage),
            Wake::EndOfFrame,
        );
    }

    /// Re-pins desk entities that have left the persistent container.
    /// They are not registered, so the registry's sweeps never see them.
    pub fn protect_desk(&self, env: &mut Environment) -> usize {
        let mut healed = 0;
        for &id in self.sets.get(EntitySetKind::Desk) {
            match pin_persistent(env, id) {
                Ok(true) => {
                    healed += 1;
                    info!(entity = id.0, "desk_entity_healed");
                }
                Ok(false) => {}
                Err(error) if error.is_gone() => {
                    debug!(entity = id.0, "stale_reference_skipped");
                }
                Err(error) => warn!(entity = id.0, error = %error, "desk_protect_failed"),
            }
        }
        healed
    }

    /// Lets the load of an abandoned stage run to completion so later loads
    /// are not queued behind it at the activation gate.
    fn release_abandoned_load(&self, env: &mut Environment) {
        let Some(CurrentStage {
            descriptor,
            phase: StagePhase::Loading { ticket },
        }) = &self.current
        else {
            return;
        };
        match env.allow_activation(*ticket) {
            Ok(()) => {
                info!(stage = %descriptor.name, ticket = ticket.0, "abandoned_load_released")
            }
            Err(error) => {
                debug!(stage = %descriptor.name, error = %error, "abandoned_load_not_pending")
            }
        }
    }

    fn advance(&mut self, cx: &mut FlowContext<'_>) {
        loop {
            let Some(stage) = self.queue.pop_next() else {
                info!(session_id = self.session_id.0, "playthrough_finished");
                self.return_to_idle(cx);
                return;
            };
            if self.begin_transition(cx, stage) {
                return;
            }
        }
    }

    fn begin_transition(&mut self, cx: &mut FlowContext<'_>, stage: StageDescriptor) -> bool {
        let sweep = cx.registry.force_protect_all(cx.env);
        let desk_healed = self.protect_desk(cx.env);
        debug!(
            healed = sweep.healed,
            checked = sweep.checked,
            desk_healed,
            "transition_protection_sweep"
        );
        self.hide_initial_desk(cx.env);

        let ticket = match cx.env.load_context(&stage.context, LoadMode::Single) {
            Ok(ticket) => ticket,
            Err(error) => {
                error!(stage = %stage.name, error = %error, "stage_load_failed");
                return false;
            }
        };
        self.awaiting_load = Some(ticket);
        info!(
            stage = %stage.name,
            context = %stage.context,
            session_id = self.session_id.0,
            remaining = self.queue.len(),
            "stage_loading"
        );
        self.current = Some(CurrentStage {
            descriptor: stage,
            phase: StagePhase::Loading { ticket },
        });
        cx.scheduler
            .schedule(SessionTask::Flow(FlowTask::PollLoad), Wake::Ticks(1));
        true
    }

    fn hide_initial_desk(&self, env: &mut Environment) {
        for query in &self.config.initial_desk {
            for id in env.find(query, LookupScope::Everywhere) {
                if env.is_persistent(id) {
                    debug!(entity = id.0, name = %query.name, "initial_desk_kept_visible");
                    continue;
                }
                if let Err(error) = env.set_active(id, false) {
                    debug!(entity = id.0, error = %error, "initial_desk_hide_skipped");
                }
            }
        }
    }

    fn poll_load(&mut self, cx: &mut FlowContext<'_>) {
        let Some(CurrentStage {
            phase: StagePhase::Loading { ticket },
            ..
        }) = self.current
        else {
            return;
        };
        match cx.env.load_progress(ticket) {
            Some(progress) if progress >= ACTIVATION_GATE_PROGRESS => {
                if let Err(error) = cx.env.allow_activation(ticket) {
                    warn!(error = %error, "stage_load_release_failed");
                }
                debug!(ticket = ticket.0, "stage_load_released");
            }
            Some(_) => cx
                .scheduler
                .schedule(SessionTask::Flow(FlowTask::PollLoad), Wake::Ticks(1)),
            None => {}
        }
    }

    fn instantiate_stage(&mut self, cx: &mut FlowContext<'_>) {
        let Some(current) = self.current.as_mut() else {
            return;
        };
        if !matches!(current.phase, StagePhase::Loading { .. }) {
            return;
        }
        for template in &current.descriptor.templates {
            let id = cx.env.instantiate(template);
            self.sets.insert(EntitySetKind::Stage, id);
        }
        cx.progress.record_stage_start(&current.descriptor.name);
        current.phase = StagePhase::Active {
            started_at: cx.scheduler.now(),
        };
        info!(
            stage = %current.descriptor.name,
            session_id = self.session_id.0,
            stage_entities = self.sets.len(EntitySetKind::Stage),
            "stage_loaded"
        );
    }

    /// Adopts or spawns the persistent entities, then spawns the desk set.
    /// Runs once until the next return to idle.
    fn bootstrap_entities(&mut self, cx: &mut FlowContext<'_>) {
        if self.bootstrapped {
            return;
        }
        for template in &self.config.persistent_templates {
            let candidates = cx.env.find(&template.query(), LookupScope::Everywhere);
            let resolution = resolve_duplicates(cx.env, &candidates, self.config.bootstrap_policy);
            let id = match resolution.kept {
                Some(existing) => {
                    info!(entity = existing.0, name = %template.name, "persistent_entity_adopted");
                    existing
                }
                None => {
                    let spawned = spawn_normalized(cx.env, template);
                    info!(entity = spawned.0, name = %template.name, "persistent_entity_spawned");
                    spawned
                }
            };
            cx.registry.register(cx.env, Some(id));
            self.sets.insert(EntitySetKind::Persistent, id);
        }

        for template in &self.config.desk_templates {
            let id = spawn_normalized(cx.env, template);
            if let Err(error) = cx.env.move_to_persistent(id) {
                warn!(entity = id.0, error = %error, "desk_pin_failed");
            }
            self.sets.insert(EntitySetKind::Desk, id);
        }
        self.bootstrapped = true;
        info!(
            persistent = self.sets.len(EntitySetKind::Persistent),
            desk = self.sets.len(EntitySetKind::Desk),
            "entity_bootstrap_complete"
        );
    }
}

fn spawn_normalized(env: &mut Environment, template: &EntityTemplate) -> EntityId {
    let id = env.instantiate(template);
    let normalized = env
        .entity(id)
        .map(|entity| normalize_instance_name(&entity.name).to_string());
    if let Some(name) = normalized {
        if let Err(error) = env.rename(id, name) {
            warn!(entity = id.0, error = %error, "rename_failed");
        }
    }
    id
}
