use std::path::PathBuf;
use thiserror::Error;

/// Process exit codes of a capture session. The numeric values are a stable
/// contract with the scripts that wrap `daqrun`.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum ExitCode {
    #[error("session completed")]
    Success,
    #[error("no trigger within the trigger timeout")]
    TriggerTimeout,
    #[error("configuration or precondition error")]
    Precondition,
    #[error("DAQ already active")]
    DaqActive,
    #[error("start command rejected")]
    StartRejected,
    #[error("capture process exited before any trigger")]
    EarlyExit,
    #[error("interrupted")]
    Interrupted,
}

impl ExitCode {
    pub fn code(&self) -> i32 {
        match self {
            ExitCode::Success => 0,
            ExitCode::TriggerTimeout => 1,
            ExitCode::Precondition => 2,
            ExitCode::DaqActive => 3,
            ExitCode::StartRejected => 4,
            ExitCode::EarlyExit => 5,
            ExitCode::Interrupted => 130,
        }
    }
}

/// Problems with a run configuration detected before anything is started.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("--maxevt must be > 0, got {0}")]
    InvalidEventLimit(u64),
    #[error("analyzer not found: {}", .0.display())]
    CaptureNotFound(PathBuf),
    #[error("analyzer is not executable: {}", .0.display())]
    CaptureNotExecutable(PathBuf),
    #[error("failed to read config file {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

impl ConfigError {
    /// Every configuration problem maps to the precondition exit code.
    pub fn exit_code(&self) -> ExitCode {
        ExitCode::Precondition
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_code_values() {
        assert_eq!(ExitCode::Success.code(), 0);
        assert_eq!(ExitCode::TriggerTimeout.code(), 1);
        assert_eq!(ExitCode::Precondition.code(), 2);
        assert_eq!(ExitCode::DaqActive.code(), 3);
        assert_eq!(ExitCode::StartRejected.code(), 4);
        assert_eq!(ExitCode::EarlyExit.code(), 5);
        assert_eq!(ExitCode::Interrupted.code(), 130);
    }

    #[test]
    fn test_config_error_display() {
        let err = ConfigError::CaptureNotFound(PathBuf::from("/opt/analyzer"));
        assert_eq!(err.to_string(), "analyzer not found: /opt/analyzer");
        assert_eq!(err.exit_code(), ExitCode::Precondition);

        let err = ConfigError::InvalidEventLimit(0);
        assert!(err.to_string().contains("must be > 0"));
    }
}
