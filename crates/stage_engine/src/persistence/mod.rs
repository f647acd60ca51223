mod duplicates;
mod registry;

pub use duplicates::{pick_survivor, resolve_duplicates, DuplicatePolicy, DuplicateResolution};
pub use registry::{
    pin_persistent, PersistenceState, PersistentRegistry, RegisterOutcome, RegistryConfig,
    RegistryTask, SweepReport, ValidationReport, DEFAULT_SETTLE_TICKS, DEFAULT_WATCHDOG_PERIOD,
};
