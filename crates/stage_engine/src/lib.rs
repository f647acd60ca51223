pub mod flow;
pub mod manifest;
pub mod persistence;
pub mod progress;
pub mod schedule;
pub mod session;
pub mod world;

pub use flow::{
    EntitySetKind, EntitySets, FlowConfig, FlowContext, FlowTask, SessionId, SessionWatcher,
    StageDescriptor, StageFlow, StageQueue,
};
pub use manifest::{FlowManifest, ManifestError, RegistryManifest, SessionManifest};
pub use persistence::{
    pick_survivor, pin_persistent, resolve_duplicates, DuplicatePolicy, DuplicateResolution,
    PersistenceState, PersistentRegistry, RegisterOutcome, RegistryConfig, RegistryTask,
    SweepReport, ValidationReport, DEFAULT_SETTLE_TICKS, DEFAULT_WATCHDOG_PERIOD,
};
pub use progress::{
    JsonFileProgressStore, MemoryProgressStore, ProgressRecord, ProgressStore,
    ProgressStoreError, StageProgress,
};
pub use schedule::{FramePhase, FrameClock, ManualClock, Scheduler, SystemClock, Wake};
pub use session::{Session, SessionConfig, SessionTask};
pub use world::{
    normalize_instance_name, same_identity, ContextContent, ContextError, ContextHandle,
    ContextHooks, ContextLibrary, Entity, EntityError, EntityId, EntityIdAllocator, EntityQuery,
    EntityTemplate, Environment, LoadMode, LoadTicket, LookupScope, NoHooks, Residence,
    ResidenceChange, StableKey, Transform, Vec2, ACTIVATION_GATE_PROGRESS,
    DEFAULT_LOAD_PROGRESS_STEP, INSTANCE_SUFFIX,
};
