use std::time::Duration;

use tracing::{info, warn};

use crate::flow::{FlowConfig, FlowContext, FlowTask, SessionId, StageFlow};
use crate::persistence::{
    PersistentRegistry, RegisterOutcome, RegistryConfig, RegistryTask, SweepReport,
};
use crate::progress::ProgressStore;
use crate::schedule::{FrameClock, FramePhase, Scheduler};
use crate::world::{
    ContextHandle, ContextHooks, EntityId, EntityQuery, Environment, LoadMode, LoadTicket,
};

const MAX_END_OF_FRAME_PASSES: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionTask {
    Registry(RegistryTask),
    Flow(FlowTask),
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub registry: RegistryConfig,
    pub flow: FlowConfig,
}

/// Composition root: owns the environment, the scheduler, the persistent
/// registry, the stage flow, and the progress store, and runs frames.
pub struct Session {
    clock: Box<dyn FrameClock>,
    env: Environment,
    scheduler: Scheduler<SessionTask>,
    registry: PersistentRegistry,
    flow: StageFlow,
    progress: Box<dyn ProgressStore>,
}

impl Session {
    pub fn new(
        env: Environment,
        config: SessionConfig,
        clock: Box<dyn FrameClock>,
        progress: Box<dyn ProgressStore>,
    ) -> Self {
        let mut scheduler = Scheduler::default();
        let mut registry = PersistentRegistry::new(config.registry);
        // Subscribed before anything else: teardown can start before the
        // rest of startup completes.
        registry.attach(&mut scheduler);
        let flow = StageFlow::new(config.flow);
        info!(
            context = %env.active_context().map(ContextHandle::as_str).unwrap_or("<none>"),
            stages = flow.config().stages.len(),
            "session_created"
        );
        Self {
            clock,
            env,
            scheduler,
            registry,
            flow,
            progress,
        }
    }

    /// Runs one frame: update-phase tasks, push healing, load progress and
    /// notifications, then end-of-frame tasks.
    pub fn run_frame(&mut self) {
        let now = self.clock.now();
        self.scheduler.begin_frame(now);

        for task in self.scheduler.take_due(FramePhase::Update) {
            self.dispatch(task);
        }

        self.registry.heal_evictions(&mut self.env);

        let mut hooks = SessionHooks {
            registry: &mut self.registry,
            flow: &mut self.flow,
            scheduler: &mut self.scheduler,
        };
        self.env.advance_loads(&mut hooks);

        for _ in 0..MAX_END_OF_FRAME_PASSES {
            let due = self.scheduler.take_due(FramePhase::EndOfFrame);
            if due.is_empty() {
                return;
            }
            for task in due {
                self.dispatch(task);
            }
        }
        warn!(frame = self.scheduler.frame(), "end_of_frame_pass_limit");
    }

    pub fn run_frames(&mut self, frames: usize) {
        for _ in 0..frames {
            self.run_frame();
        }
    }

    fn dispatch(&mut self, task: SessionTask) {
        match task {
            SessionTask::Registry(task) => {
                self.registry.run_task(task, &mut self.env, &mut self.scheduler);
            }
            SessionTask::Flow(task) => self.with_flow(|flow, cx| flow.run_task(task, cx)),
        }
    }

    fn with_flow<R>(&mut self, f: impl FnOnce(&mut StageFlow, &mut FlowContext<'_>) -> R) -> R {
        let mut cx = FlowContext {
            env: &mut self.env,
            registry: &mut self.registry,
            scheduler: &mut self.scheduler,
            progress: self.progress.as_mut(),
        };
        f(&mut self.flow, &mut cx)
    }

    pub fn start_playthrough(
        &mut self,
        indices: &[usize],
        return_context: Option<ContextHandle>,
    ) -> bool {
        self.with_flow(|flow, cx| flow.start_playthrough(cx, indices, return_context))
    }

    pub fn complete_current_stage(&mut self) -> bool {
        self.with_flow(|flow, cx| flow.complete_current_stage(cx))
    }

    pub fn return_to_idle(&mut self) {
        self.with_flow(|flow, cx| flow.return_to_idle(cx));
    }

    pub fn register(&mut self, entity: Option<EntityId>) -> RegisterOutcome {
        self.registry.register(&mut self.env, entity)
    }

    pub fn register_by_query(&mut self, query: &EntityQuery) -> RegisterOutcome {
        self.registry.register_by_query(&mut self.env, query)
    }

    pub fn force_protect_all(&mut self) -> SweepReport {
        self.registry.force_protect_all(&mut self.env)
    }

    pub fn unregister_all(&mut self) {
        self.registry.unregister_all(&mut self.env);
    }

    pub fn list_persistent(&self) -> Vec<EntityId> {
        self.registry.list_persistent(&self.env)
    }

    pub fn remaining_stages(&self) -> usize {
        self.flow.remaining_stages()
    }

    pub fn current_stage_name(&self) -> Option<&str> {
        self.flow.current_stage_name()
    }

    pub fn is_stage_active(&self) -> bool {
        self.flow.is_stage_active()
    }

    pub fn session_id(&self) -> SessionId {
        self.flow.session_id()
    }

    pub fn now(&self) -> Duration {
        self.scheduler.now()
    }

    pub fn frame(&self) -> u64 {
        self.scheduler.frame()
    }

    pub fn env(&self) -> &Environment {
        &self.env
    }

    pub fn env_mut(&mut self) -> &mut Environment {
        &mut self.env
    }

    pub fn registry(&self) -> &PersistentRegistry {
        &self.registry
    }

    pub fn flow(&self) -> &StageFlow {
        &self.flow
    }
}

struct SessionHooks<'a> {
    registry: &'a mut PersistentRegistry,
    flow: &'a mut StageFlow,
    scheduler: &'a mut Scheduler<SessionTask>,
}

impl ContextHooks for SessionHooks<'_> {
    fn context_unloading(&mut self, env: &mut Environment, _outgoing: &ContextHandle) {
        self.registry.context_unloading(env);
        self.flow.protect_desk(env);
    }

    fn context_loaded(
        &mut self,
        _env: &mut Environment,
        _loaded: &ContextHandle,
        ticket: LoadTicket,
        _mode: LoadMode,
    ) {
        // Registry scans are scheduled first so they run before stage
        // instantiation at the end of this frame.
        self.registry.context_loaded(self.scheduler);
        self.flow.context_loaded(self.scheduler, ticket);
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use super::*;
    use crate::flow::{EntitySetKind, StageDescriptor};
    use crate::persistence::PersistenceState;
    use crate::schedule::ManualClock;
    use crate::world::{ContextLibrary, EntityTemplate, LookupScope};

    const FRAME: Duration = Duration::from_micros(16_667);

    #[derive(Debug, Clone, PartialEq)]
    enum ProgressEvent {
        Start(String),
        Complete(String, f64),
        NotFirstTime,
    }

    #[derive(Clone, Default)]
    struct RecordingProgress {
        events: Rc<RefCell<Vec<ProgressEvent>>>,
    }

    impl ProgressStore for RecordingProgress {
        fn record_stage_start(&mut self, stage: &str) {
            self.events
                .borrow_mut()
                .push(ProgressEvent::Start(stage.to_string()));
        }

        fn record_stage_complete(&mut self, stage: &str, elapsed_seconds: f64) {
            self.events
                .borrow_mut()
                .push(ProgressEvent::Complete(stage.to_string(), elapsed_seconds));
        }

        fn mark_not_first_time(&mut self) {
            self.events.borrow_mut().push(ProgressEvent::NotFirstTime);
        }
    }

    struct Harness {
        session: Session,
        clock: ManualClock,
        progress: RecordingProgress,
    }

    impl Harness {
        fn new(push_healing: bool) -> Self {
            let library = ContextLibrary::default()
                .with_context(
                    "office",
                    vec![
                        EntityTemplate::named("Desk").with_child(EntityTemplate::named("Monitor")),
                        EntityTemplate::named("Lamp").with_position(3.0, -1.0),
                        EntityTemplate::named("Poster"),
                    ],
                )
                .with_context(
                    "stage_a",
                    vec![EntityTemplate::named("Lamp"), EntityTemplate::named("Floor")],
                )
                .with_context("stage_b", vec![EntityTemplate::named("Floor")])
                .with_context("stage_c", vec![EntityTemplate::named("Floor")])
                .with_context("lobby", vec![EntityTemplate::named("Bench")]);
            let mut env = Environment::new(library);
            env.open_initial_context(&ContextHandle::new("office"))
                .expect("office");

            let mut flow = FlowConfig::new("office");
            flow.stages = vec![
                StageDescriptor::new("alpha", "stage_a")
                    .with_template(EntityTemplate::named("Puzzle")),
                StageDescriptor::new("beta", "stage_b"),
                StageDescriptor::new("gamma", "stage_c"),
            ];
            flow.persistent_templates = vec![EntityTemplate::named("Desk")];
            flow.desk_templates = vec![EntityTemplate::named("Tray")];
            flow.initial_desk = vec![EntityQuery::by_name("Poster")];

            let config = SessionConfig {
                registry: RegistryConfig {
                    targets: vec![EntityQuery::by_name("Lamp")],
                    push_healing,
                    ..RegistryConfig::default()
                },
                flow,
            };
            let clock = ManualClock::default();
            let progress = RecordingProgress::default();
            let session = Session::new(
                env,
                config,
                Box::new(clock.clone()),
                Box::new(progress.clone()),
            );
            Self {
                session,
                clock,
                progress,
            }
        }

        fn step(&mut self) {
            self.clock.advance(FRAME);
            self.session.run_frame();
        }

        fn steps(&mut self, frames: usize) {
            for _ in 0..frames {
                self.step();
            }
        }

        fn run_until_active(&mut self) {
            for _ in 0..30 {
                if self.session.is_stage_active() {
                    return;
                }
                self.step();
            }
            panic!("stage never became active");
        }

        fn first(&self, name: &str) -> EntityId {
            self.session.env().find_by_name(name, LookupScope::Everywhere)[0]
        }

        fn count(&self, name: &str) -> usize {
            self.session
                .env()
                .find_by_name(name, LookupScope::Everywhere)
                .len()
        }
    }

    #[test]
    fn initial_registration_waits_for_settle_ticks() {
        let mut harness = Harness::new(true);
        harness.step();
        assert!(harness.session.registry().is_empty());
        harness.step();
        assert_eq!(harness.session.list_persistent(), vec![harness.first("Lamp")]);
        assert!(harness.session.env().is_persistent(harness.first("Lamp")));
    }

    #[test]
    fn queue_drains_in_selection_order_and_routes_to_idle() {
        let mut harness = Harness::new(true);
        assert!(harness.session.start_playthrough(&[2, 0, 1], None));
        assert_eq!(harness.session.current_stage_name(), Some("gamma"));

        let mut observed = Vec::new();
        for expected in ["gamma", "alpha", "beta"] {
            harness.run_until_active();
            assert_eq!(harness.session.current_stage_name(), Some(expected));
            observed.push(harness.session.remaining_stages());
            assert!(harness.session.complete_current_stage());
        }

        assert_eq!(observed, vec![2, 1, 0]);
        assert_eq!(harness.session.current_stage_name(), None);
        assert!(!harness.session.is_stage_active());
        assert!(harness
            .progress
            .events
            .borrow()
            .contains(&ProgressEvent::NotFirstTime));
    }

    #[test]
    fn empty_selection_is_a_no_op() {
        let mut harness = Harness::new(true);
        let before = harness.session.session_id();

        assert!(!harness.session.start_playthrough(&[], None));
        assert!(!harness.session.start_playthrough(&[9], None));
        assert_eq!(harness.session.session_id(), before);
        assert_eq!(harness.session.remaining_stages(), 0);
        assert_eq!(harness.session.current_stage_name(), None);
        assert_eq!(harness.session.env().pending_load_count(), 0);
    }

    #[test]
    fn session_id_increases_across_playthroughs_and_idle() {
        let mut harness = Harness::new(true);
        let mut last = harness.session.session_id();
        for _ in 0..3 {
            assert!(harness.session.start_playthrough(&[1], None));
            let started = harness.session.session_id();
            assert!(started > last);

            harness.run_until_active();
            harness.session.return_to_idle();
            assert_eq!(harness.session.session_id(), started);
            harness.steps(10);
            last = started;
        }
    }

    #[test]
    fn bootstrap_adopts_pre_placed_desk() {
        let mut harness = Harness::new(true);
        let desk = harness.first("Desk");

        harness.session.start_playthrough(&[1], None);
        let sets = harness.session.flow().entity_sets();
        assert_eq!(sets.get(EntitySetKind::Persistent), &[desk]);
        assert_eq!(harness.count("Desk"), 1);
        assert!(harness.session.registry().contains(desk));

        harness.run_until_active();
        assert!(harness.session.env().is_alive(desk));
        assert_eq!(harness.count("Monitor"), 1);
    }

    #[test]
    fn bootstrap_spawns_desk_set_with_normalized_names() {
        let mut harness = Harness::new(true);
        harness.session.start_playthrough(&[1], None);

        let tray = harness.first("Tray");
        let sets = harness.session.flow().entity_sets();
        assert_eq!(sets.get(EntitySetKind::Desk), &[tray]);
        assert!(harness.session.env().is_persistent(tray));
        assert!(!harness.session.registry().contains(tray));

        harness.run_until_active();
        assert!(harness.session.env().is_alive(tray));
    }

    #[test]
    fn reload_collision_keeps_persistent_original() {
        let mut harness = Harness::new(true);
        harness.steps(3);
        let lamp = harness.first("Lamp");

        harness.session.start_playthrough(&[0], None);
        harness.run_until_active();

        assert_eq!(
            harness
                .session
                .env()
                .find_by_name("Lamp", LookupScope::Everywhere),
            vec![lamp]
        );
        let original = harness.session.env().entity(lamp).expect("lamp");
        assert!(original.is_root());
        assert_eq!(original.transform.position.x, 3.0);
        assert_eq!(original.transform.position.y, -1.0);
        assert!(harness.session.env().is_persistent(lamp));
        assert_eq!(harness.count("Floor"), 1);
    }

    #[test]
    fn stage_entities_are_instantiated_on_load_and_destroyed_on_complete() {
        let mut harness = Harness::new(true);
        harness.session.start_playthrough(&[0, 1], None);
        assert_eq!(harness.count("Puzzle (Clone)"), 0);

        harness.run_until_active();
        let puzzle = harness.first("Puzzle (Clone)");
        assert_eq!(
            harness.session.flow().entity_sets().get(EntitySetKind::Stage),
            &[puzzle]
        );
        assert!(harness
            .progress
            .events
            .borrow()
            .contains(&ProgressEvent::Start("alpha".to_string())));

        harness.steps(30);
        assert!(harness.session.complete_current_stage());
        assert!(!harness.session.env().is_alive(puzzle));
        assert_eq!(
            harness.session.flow().entity_sets().len(EntitySetKind::Stage),
            0
        );

        let events = harness.progress.events.borrow();
        let elapsed = events
            .iter()
            .find_map(|event| match event {
                ProgressEvent::Complete(stage, elapsed) if stage == "alpha" => Some(*elapsed),
                _ => None,
            })
            .expect("completion recorded");
        assert!((elapsed - 0.5).abs() < 0.01);
    }

    #[test]
    fn complete_without_active_stage_is_rejected() {
        let mut harness = Harness::new(true);
        assert!(!harness.session.complete_current_stage());

        harness.session.start_playthrough(&[0], None);
        assert!(!harness.session.complete_current_stage());
        assert_eq!(harness.session.current_stage_name(), Some("alpha"));
    }

    #[test]
    fn initial_desk_is_hidden_unless_persistent() {
        let mut harness = Harness::new(true);
        let poster = harness.first("Poster");
        harness.session.start_playthrough(&[1], None);
        assert!(!harness.session.env().entity(poster).expect("poster").active);

        let mut harness = Harness::new(true);
        let poster = harness.first("Poster");
        harness.session.register(Some(poster));
        harness.session.start_playthrough(&[1], None);
        assert!(harness.session.env().entity(poster).expect("poster").active);
    }

    #[test]
    fn return_to_idle_empties_every_set_and_the_registry() {
        let mut harness = Harness::new(true);
        harness.steps(3);
        harness.session.start_playthrough(&[0, 1], None);
        harness.run_until_active();
        assert!(!harness.session.registry().is_empty());

        harness.session.return_to_idle();
        let sets = harness.session.flow().entity_sets();
        assert!(sets.is_empty());
        assert!(harness.session.registry().is_empty());
        assert_eq!(harness.session.remaining_stages(), 0);
        assert!(!harness.session.flow().is_bootstrapped());
        assert_eq!(harness.count("Tray"), 0);
        assert_eq!(harness.count("Desk"), 0);
    }

    #[test]
    fn registry_repopulates_after_idle_context_reloads() {
        let mut harness = Harness::new(true);
        harness.steps(3);
        harness.session.start_playthrough(&[1], None);
        harness.run_until_active();
        harness.session.return_to_idle();

        harness.steps(12);
        assert_eq!(
            harness.session.env().active_context(),
            Some(&ContextHandle::new("office"))
        );
        assert!(harness.session.registry().is_initialized());
        assert_eq!(harness.session.list_persistent(), vec![harness.first("Lamp")]);
    }

    #[test]
    fn return_context_overrides_idle_context() {
        let mut harness = Harness::new(true);
        harness
            .session
            .start_playthrough(&[1], Some(ContextHandle::new("lobby")));
        harness.run_until_active();
        assert!(harness.session.complete_current_stage());

        harness.steps(10);
        assert_eq!(
            harness.session.env().active_context(),
            Some(&ContextHandle::new("lobby"))
        );
    }

    #[test]
    fn watchdog_heals_eviction_within_one_period() {
        let mut harness = Harness::new(false);
        harness.steps(3);
        let lamp = harness.first("Lamp");
        let poster = harness.first("Poster");

        harness
            .session
            .env_mut()
            .set_parent(lamp, Some(poster))
            .expect("evict");
        let evicted_at = harness.session.now();
        assert_eq!(
            harness.session.registry().state_of(harness.session.env(), lamp),
            PersistenceState::Evicted
        );

        while harness.session.now() < evicted_at + DEFAULT_PERIOD {
            harness.step();
        }
        assert_eq!(
            harness.session.registry().state_of(harness.session.env(), lamp),
            PersistenceState::Persistent
        );
        assert!(harness.session.env().entity(lamp).expect("lamp").is_root());
    }

    const DEFAULT_PERIOD: Duration = crate::persistence::DEFAULT_WATCHDOG_PERIOD;

    #[test]
    fn push_healing_repairs_eviction_on_next_frame() {
        let mut harness = Harness::new(true);
        harness.steps(3);
        let lamp = harness.first("Lamp");
        harness
            .session
            .env_mut()
            .move_to_context(lamp)
            .expect("evict");

        harness.step();
        assert!(harness.session.env().is_persistent(lamp));
    }

    #[test]
    fn evicted_entity_is_protected_before_stage_load_tears_down() {
        let mut harness = Harness::new(false);
        harness.steps(3);
        let lamp = harness.first("Lamp");
        harness
            .session
            .env_mut()
            .move_to_context(lamp)
            .expect("evict");

        harness.session.start_playthrough(&[1], None);
        assert!(harness.session.env().is_persistent(lamp));
        harness.run_until_active();
        assert!(harness.session.env().is_alive(lamp));
    }

    #[test]
    fn restarting_mid_stage_discards_stage_entities() {
        let mut harness = Harness::new(true);
        harness.session.start_playthrough(&[0], None);
        harness.run_until_active();
        let puzzle = harness.first("Puzzle (Clone)");

        assert!(harness.session.start_playthrough(&[1, 2], None));
        assert!(!harness.session.env().is_alive(puzzle));
        assert_eq!(harness.session.current_stage_name(), Some("beta"));
        harness.run_until_active();
        assert_eq!(harness.session.remaining_stages(), 1);
    }

    #[test]
    fn restarting_while_loading_lets_abandoned_load_finish() {
        let mut harness = Harness::new(true);
        assert!(harness.session.start_playthrough(&[0], None));
        assert!(harness.session.start_playthrough(&[1], None));

        harness.run_until_active();
        assert_eq!(harness.session.current_stage_name(), Some("beta"));
        assert_eq!(harness.session.env().pending_load_count(), 0);
        assert_eq!(
            harness.session.env().active_context(),
            Some(&ContextHandle::new("stage_b"))
        );
        assert_eq!(harness.count("Puzzle (Clone)"), 0);
    }

    #[test]
    fn restarting_same_stage_while_loading_waits_for_its_own_load() {
        let mut harness = Harness::new(true);
        assert!(harness.session.start_playthrough(&[0], None));
        assert!(harness.session.start_playthrough(&[0], None));

        harness.run_until_active();
        assert_eq!(harness.session.env().pending_load_count(), 0);
        assert_eq!(harness.count("Puzzle (Clone)"), 1);
        assert_eq!(
            harness.session.env().active_context(),
            Some(&ContextHandle::new("stage_a"))
        );
    }

    #[test]
    fn return_to_idle_while_loading_reaches_return_context() {
        let mut harness = Harness::new(true);
        harness
            .session
            .start_playthrough(&[1], Some(ContextHandle::new("lobby")));
        harness.session.return_to_idle();

        harness.steps(20);
        assert_eq!(harness.session.env().pending_load_count(), 0);
        assert_eq!(
            harness.session.env().active_context(),
            Some(&ContextHandle::new("lobby"))
        );
        assert_eq!(harness.session.current_stage_name(), None);
    }

    #[test]
    fn evicted_desk_entity_is_repinned_before_next_stage() {
        let mut harness = Harness::new(true);
        harness.session.start_playthrough(&[0, 1], None);
        harness.run_until_active();
        let tray = harness.first("Tray");
        let floor = harness
            .session
            .env()
            .find_by_name("Floor", LookupScope::ActiveContext)[0];
        harness
            .session
            .env_mut()
            .set_parent(tray, Some(floor))
            .expect("evict");
        assert!(!harness.session.env().is_persistent(tray));

        assert!(harness.session.complete_current_stage());
        harness.run_until_active();
        assert_eq!(harness.session.current_stage_name(), Some("beta"));
        assert!(harness.session.env().is_persistent(tray));
        assert!(harness.session.env().entity(tray).expect("tray").is_root());
    }

    #[test]
    fn desk_entity_evicted_during_load_survives_teardown() {
        let mut harness = Harness::new(true);
        harness.session.start_playthrough(&[1], None);
        let tray = harness.first("Tray");
        let poster = harness.first("Poster");
        harness
            .session
            .env_mut()
            .set_parent(tray, Some(poster))
            .expect("evict");

        harness.run_until_active();
        assert!(harness.session.env().is_alive(tray));
        assert!(harness.session.env().is_persistent(tray));
        assert_eq!(
            harness.session.flow().entity_sets().get(EntitySetKind::Desk),
            &[tray]
        );
    }
}
