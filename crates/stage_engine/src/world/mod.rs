mod context;
mod entity;
mod environment;

pub use context::{
    ContextContent, ContextError, ContextHandle, ContextHooks, ContextLibrary, LoadMode,
    LoadTicket, NoHooks, ACTIVATION_GATE_PROGRESS, DEFAULT_LOAD_PROGRESS_STEP,
};
pub use entity::{
    normalize_instance_name, same_identity, Entity, EntityId, EntityIdAllocator, EntityQuery,
    EntityTemplate, Residence, StableKey, Transform, Vec2, INSTANCE_SUFFIX,
};
pub use environment::{Environment, EntityError, LookupScope, ResidenceChange};
