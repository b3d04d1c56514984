// Error types and exit codes
pub mod error;
pub use error::{ConfigError, ExitCode};

// Core data types
pub mod types;
pub use types::{
    AbortReason, FailureReason, RunConfig, RunStatus, SessionOutcome, SessionReport, StartMode,
};

// Control channel protocol
pub mod protocol;
pub use protocol::{
    event_count_from_reply, extract_reply, run_status_from_reply, scan_run_status,
    CommandErrorKind, CommandResult, ControlCommand,
};
