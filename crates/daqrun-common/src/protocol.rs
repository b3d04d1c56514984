use crate::types::RunStatus;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Matches a `"runstatus":"<value>"` fragment anywhere in raw output.
static RUNSTATUS_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#""runstatus"\s*:\s*"([^"]+)""#).expect("runstatus pattern is valid")
});

/// Commands understood by the DAQ control binary. Each one is sent as a
/// single line on stdin of a fresh invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlCommand {
    /// Start the run; `no_save` selects `nssta` over `start`
    Start { no_save: bool },
    /// Stop the run with an operator supplied ender tag
    Stop { ender: String },
    /// Query the built-event counter
    GetEventNumber,
    /// Query the run configuration, including the run status
    GetConfig,
    /// Any other command line, sent verbatim
    Raw(String),
}

impl fmt::Display for ControlCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControlCommand::Start { no_save: true } => f.write_str("nssta"),
            ControlCommand::Start { no_save: false } => f.write_str("start"),
            ControlCommand::Stop { ender } => write!(f, "stop {}", ender),
            ControlCommand::GetEventNumber => f.write_str("getevtnumber"),
            ControlCommand::GetConfig => f.write_str("getconfig"),
            ControlCommand::Raw(line) => f.write_str(line.trim_end()),
        }
    }
}

/// Why a command exchange produced no usable reply.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CommandErrorKind {
    /// No `{` in the output started a parseable JSON value
    NoJsonResponse,
    /// The first parseable value was not a JSON object
    InvalidJsonResponse,
    /// The control binary could not be located or executed
    ProcessNotFound,
}

impl CommandErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandErrorKind::NoJsonResponse => "no_json_response",
            CommandErrorKind::InvalidJsonResponse => "invalid_json_response",
            CommandErrorKind::ProcessNotFound => "process_not_found",
        }
    }
}

impl fmt::Display for CommandErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one command exchange with the control binary.
#[derive(Debug, Clone, PartialEq)]
pub enum CommandResult {
    /// The first JSON object found in the output, keys in reply order
    Reply(Map<String, Value>),
    /// No reply; `raw` keeps the unparsed text (or a diagnostic) for logs
    Error { kind: CommandErrorKind, raw: String },
}

impl CommandResult {
    pub fn error(kind: CommandErrorKind, raw: impl Into<String>) -> Self {
        Self::Error {
            kind,
            raw: raw.into(),
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, CommandResult::Error { .. })
    }

    pub fn reply(&self) -> Option<&Map<String, Value>> {
        match self {
            CommandResult::Reply(map) => Some(map),
            CommandResult::Error { .. } => None,
        }
    }

    /// Look up a top-level field of the reply.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.reply().and_then(|map| map.get(key))
    }

    /// The result in the shape the control tooling prints: the reply itself,
    /// or `{"error": <kind>, "raw": <text>}`.
    pub fn to_value(&self) -> Value {
        match self {
            CommandResult::Reply(map) => Value::Object(map.clone()),
            CommandResult::Error { kind, raw } => serde_json::json!({
                "error": kind.as_str(),
                "raw": raw,
            }),
        }
    }
}

impl fmt::Display for CommandResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_value())
    }
}

/// Extract the first JSON object from noisy command output.
///
/// Every `{` is tried in order as the start of exactly one JSON value; text
/// before and after that value is ignored. A position that fails to parse is
/// skipped and the scan continues forward. The first value that parses wins:
/// an object becomes the reply, anything else is reported as
/// `invalid_json_response`. Output without any parseable value yields
/// `no_json_response` with the whole trimmed text.
pub fn extract_reply(raw: &str) -> CommandResult {
    for (idx, _) in raw.match_indices('{') {
        let tail = &raw[idx..];
        let mut values = serde_json::Deserializer::from_str(tail).into_iter::<Value>();
        match values.next() {
            Some(Ok(Value::Object(map))) => return CommandResult::Reply(map),
            Some(Ok(_)) => {
                return CommandResult::error(CommandErrorKind::InvalidJsonResponse, tail.trim())
            }
            Some(Err(_)) | None => continue,
        }
    }
    CommandResult::error(CommandErrorKind::NoJsonResponse, raw.trim())
}

/// Pattern probe for a run status directly in raw output. Works on replies
/// that are readable but not valid JSON.
pub fn scan_run_status(raw: &str) -> Option<RunStatus> {
    RUNSTATUS_RE
        .captures(raw)
        .and_then(|caps| caps.get(1))
        .map(|m| RunStatus::new(m.as_str()))
}

/// Run status from a parsed `getconfig` reply: `runinfo.runstatus` first,
/// then a flat `runstatus`, else `UNKNOWN`.
pub fn run_status_from_reply(result: &CommandResult) -> RunStatus {
    let nested = result
        .get("runinfo")
        .and_then(Value::as_object)
        .and_then(|runinfo| runinfo.get("runstatus"))
        .and_then(Value::as_str);

    nested
        .or_else(|| result.get("runstatus").and_then(Value::as_str))
        .map(RunStatus::new)
        .unwrap_or_else(RunStatus::unknown)
}

/// Built-event count from a `getevtnumber` reply. Missing or non-numeric
/// values count as zero.
pub fn event_count_from_reply(result: &CommandResult) -> u64 {
    match result.get("eventbuiltnumber") {
        Some(Value::Number(n)) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| *f >= 0.0).map(|f| f as u64))
            .unwrap_or(0),
        Some(Value::String(s)) => s.trim().parse().unwrap_or(0),
        _ => 0,
    }
}
