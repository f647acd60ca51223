mod entity_sets;
mod orchestrator;
mod session_id;
mod stage;

pub use entity_sets::{EntitySetKind, EntitySets};
pub use orchestrator::{FlowConfig, FlowContext, FlowTask, StageFlow};
pub use session_id::{SessionId, SessionWatcher};
pub use stage::{StageDescriptor, StageQueue};
