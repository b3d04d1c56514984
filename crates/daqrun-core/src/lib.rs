// DAQ control channel client and capture session orchestration
pub mod capture;
pub mod control;
pub mod interrupt;
pub mod orchestrator;

pub use capture::{CaptureCommand, CaptureProcess, StopSignal};
pub use control::{ControlChannel, ControlClient, DEFAULT_COMMAND_TIMEOUT, STATUS_TIMEOUT};
pub use interrupt::{Interrupt, InterruptTrigger};
pub use orchestrator::Orchestrator;
