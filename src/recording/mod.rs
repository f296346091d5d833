//! Recording session lifecycle and its timers

mod scheduler;
mod session;

pub use scheduler::{Scheduler, SessionTimer};
pub use session::{RecordingSession, SessionStatus, StopOutcome, StopReason};
