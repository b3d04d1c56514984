use crate::error::{ConfigError, ExitCode};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Run state reported by the DAQ control process, normalized to uppercase
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct RunStatus(String);

impl RunStatus {
    pub const IDLE: &'static str = "IDLE";
    pub const UNKNOWN: &'static str = "UNKNOWN";

    pub fn new(raw: &str) -> Self {
        Self(raw.trim().to_uppercase())
    }

    pub fn unknown() -> Self {
        Self(Self::UNKNOWN.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Only an idle DAQ is safe to start.
    pub fn is_idle(&self) -> bool {
        self.0 == Self::IDLE
    }

    pub fn is_unknown(&self) -> bool {
        self.0 == Self::UNKNOWN
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// How the DAQ run is started
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum StartMode {
    /// Data flows but is not recorded on the DAQ side (`nssta`)
    #[default]
    #[serde(rename = "nssta")]
    NoSave,
    /// Regular recorded run (`start`)
    #[serde(rename = "start")]
    Save,
}

impl StartMode {
    pub fn is_no_save(&self) -> bool {
        matches!(self, StartMode::NoSave)
    }
}

impl fmt::Display for StartMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StartMode::NoSave => f.write_str("nssta"),
            StartMode::Save => f.write_str("start"),
        }
    }
}

/// Everything one capture session needs, built by the CLI from flags and an
/// optional JSON config file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RunConfig {
    /// Host handed to the control binary (default: localhost)
    pub eb_host: String,
    /// Path to the DAQ control binary
    pub control_binary: PathBuf,
    /// Host the analyzer reads online data from (default: localhost)
    pub online_host: String,
    /// Path to the capture (analyzer) binary
    pub capture_binary: PathBuf,
    /// Events the analyzer collects before it exits on its own
    pub max_events: u64,
    /// Output file written by the analyzer
    pub output: PathBuf,
    /// DAQ start mode (default: nssta)
    pub start_mode: StartMode,
    /// How long to wait for the first trigger after the start command
    #[serde(with = "humantime_serde")]
    pub trigger_timeout: Duration,
    /// Interval between event counter reads while waiting for the trigger
    #[serde(with = "humantime_serde")]
    pub trigger_poll: Duration,
    /// Pause between spawning the analyzer and sending the start command
    #[serde(with = "humantime_serde")]
    pub settle_delay: Duration,
    /// How long a signalled analyzer may take to exit before it is killed
    #[serde(with = "humantime_serde")]
    pub kill_grace: Duration,
    /// Ender text sent with the stop command
    pub ender: String,
    /// Proceed even when the DAQ is not idle
    pub force_if_active: bool,
    /// Never send the stop command
    pub no_stop: bool,
}

impl RunConfig {
    /// Load a configuration from a JSON file. Missing fields keep their
    /// defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Preflight checks done before any process is touched.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_events == 0 {
            return Err(ConfigError::InvalidEventLimit(self.max_events));
        }
        if !self.capture_binary.is_file() {
            return Err(ConfigError::CaptureNotFound(self.capture_binary.clone()));
        }
        if !is_executable(&self.capture_binary) {
            return Err(ConfigError::CaptureNotExecutable(self.capture_binary.clone()));
        }
        Ok(())
    }

    /// Arguments for the analyzer in online batch mode.
    pub fn capture_args(&self) -> Vec<String> {
        vec![
            "--online".to_string(),
            "-b".to_string(),
            "-n".to_string(),
            self.max_events.to_string(),
            self.online_host.clone(),
            "-o".to_string(),
            self.output.to_string_lossy().into_owned(),
        ]
    }
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            eb_host: "localhost".to_string(),
            control_binary: PathBuf::from("/usr/babirl/babicon/babiconjson"),
            online_host: "localhost".to_string(),
            capture_binary: PathBuf::from("bin/rfsoc_ridf_analyzer"),
            max_events: 200,
            output: PathBuf::from("online_capture.root"),
            start_mode: StartMode::NoSave,
            trigger_timeout: Duration::from_secs(15),
            trigger_poll: Duration::from_millis(500),
            settle_delay: Duration::from_millis(500),
            kill_grace: Duration::from_secs(3),
            ender: "online_take_and_save".to_string(),
            force_if_active: false,
            no_stop: false,
        }
    }
}

/// Whether the current user may execute `path`, as decided by `access(2)`.
#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    let Ok(c_path) = CString::new(path.as_os_str().as_bytes()) else {
        return false;
    };
    // SAFETY: c_path is a valid NUL-terminated string that outlives the call
    unsafe { libc::access(c_path.as_ptr(), libc::X_OK) == 0 }
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

/// Why a session stopped before doing any capture work
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AbortReason {
    /// The DAQ was not idle and no override was given
    DaqActive(RunStatus),
    /// An interrupt signal arrived
    Interrupted,
}

/// Why a session failed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    /// The capture process could not be started
    SpawnFailed(String),
    /// The start command returned an error result
    StartRejected(String),
    /// The capture process exited before the first trigger
    EarlyExit(i32),
    /// The capture process finished with a non-zero code after the trigger
    CaptureFailed(i32),
    /// The capture process could no longer be waited on
    CaptureLost(String),
}

/// Terminal state of one capture session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutcome {
    Completed,
    Aborted(AbortReason),
    TimedOut,
    Failed(FailureReason),
}

impl SessionOutcome {
    /// Process exit code for this outcome.
    pub fn exit_code(&self) -> i32 {
        match self {
            SessionOutcome::Completed => ExitCode::Success.code(),
            SessionOutcome::Aborted(AbortReason::DaqActive(_)) => ExitCode::DaqActive.code(),
            SessionOutcome::Aborted(AbortReason::Interrupted) => ExitCode::Interrupted.code(),
            SessionOutcome::TimedOut => ExitCode::TriggerTimeout.code(),
            SessionOutcome::Failed(FailureReason::SpawnFailed(_)) => ExitCode::Precondition.code(),
            SessionOutcome::Failed(FailureReason::StartRejected(_)) => {
                ExitCode::StartRejected.code()
            }
            SessionOutcome::Failed(FailureReason::EarlyExit(0)) => ExitCode::EarlyExit.code(),
            SessionOutcome::Failed(FailureReason::EarlyExit(code)) => *code,
            SessionOutcome::Failed(FailureReason::CaptureFailed(code)) => *code,
            SessionOutcome::Failed(FailureReason::CaptureLost(_)) => 1,
        }
    }
}

impl fmt::Display for SessionOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionOutcome::Completed => f.write_str("completed"),
            SessionOutcome::Aborted(AbortReason::DaqActive(status)) => {
                write!(f, "aborted: DAQ already active (runstatus={})", status)
            }
            SessionOutcome::Aborted(AbortReason::Interrupted) => f.write_str("aborted: interrupted"),
            SessionOutcome::TimedOut => f.write_str("timed out waiting for trigger"),
            SessionOutcome::Failed(FailureReason::SpawnFailed(e)) => {
                write!(f, "failed: analyzer did not start: {}", e)
            }
            SessionOutcome::Failed(FailureReason::StartRejected(reply)) => {
                write!(f, "failed: start rejected: {}", reply)
            }
            SessionOutcome::Failed(FailureReason::EarlyExit(code)) => {
                write!(f, "failed: analyzer exited early with code {}", code)
            }
            SessionOutcome::Failed(FailureReason::CaptureFailed(code)) => {
                write!(f, "failed: analyzer exited with code {}", code)
            }
            SessionOutcome::Failed(FailureReason::CaptureLost(e)) => {
                write!(f, "failed: analyzer status unavailable: {}", e)
            }
        }
    }
}

/// What the orchestrator observed during one session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionReport {
    /// Run status read during preflight
    pub run_status: RunStatus,
    /// Event counter read during preflight; the trigger threshold
    pub baseline: u64,
    /// Last event counter value seen while waiting for the trigger
    pub last_event_count: u64,
    /// Whether the counter moved past the baseline
    pub triggered: bool,
    pub outcome: SessionOutcome,
}

impl SessionReport {
    pub fn exit_code(&self) -> i32 {
        self.outcome.exit_code()
    }
}
