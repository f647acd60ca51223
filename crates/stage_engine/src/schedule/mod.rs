mod clock;
mod scheduler;

pub use clock::{FrameClock, ManualClock, SystemClock};
pub use scheduler::{FramePhase, Scheduler, Wake};
