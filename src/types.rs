//! Core type definitions for the taskwheel scheduler.
//!
//! This module defines the canonical task descriptor that flows between the
//! broker and the workers, the result report written back to the store, the
//! wire codec for the KVS hash representation, and the crate error type.
//!
//! Everything stored in the KVS is a flat string-to-string hash; integers are
//! decimal-encoded and the back-off schedule is a space-joined list. The
//! field names are part of the wire contract and must not change.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result alias used across the crate.
pub type SchedulerResult<T> = Result<T, SchedulerError>;

/// Hash field names of a pending task (`t_<uuid>`), in HMGET order.
pub const TASK_FIELDS: [&str; 8] = [
    "uuid",
    "bin_name",
    "args",
    "start_time",
    "time_interval",
    "index",
    "max_run_time",
    "task_type",
];

/// Number of fields in a task hash. Result hashes carry two more
/// (`is_success`, `result`).
pub const TASK_FIELD_COUNT: usize = 8;

/// What a task executes.
///
/// A closed set: either a local executable resolved under the worker's
/// binary root, or an outbound HTTP call. The discriminant values are the
/// wire encoding of the `task_type` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskKind {
    /// Run a binary from the worker's configured root.
    Script = 1,
    /// HTTP GET against an absolute URL.
    HttpGet = 2,
    /// HTTP POST with `args` as the request body.
    HttpPost = 3,
    /// HTTP PUT with `args` as the request body.
    HttpPut = 4,
    /// HTTP DELETE against an absolute URL.
    HttpDelete = 5,
}

impl TaskKind {
    /// Wire encoding of the kind.
    pub fn wire_code(self) -> u8 {
        self as u8
    }

    /// Decode a wire `task_type` value.
    pub fn from_wire(code: u8) -> SchedulerResult<Self> {
        match code {
            1 => Ok(TaskKind::Script),
            2 => Ok(TaskKind::HttpGet),
            3 => Ok(TaskKind::HttpPost),
            4 => Ok(TaskKind::HttpPut),
            5 => Ok(TaskKind::HttpDelete),
            _ => Err(SchedulerError::MessageType),
        }
    }

    /// Map an HTTP method name to the matching kind.
    pub fn from_http_method(method: &str) -> SchedulerResult<Self> {
        match method {
            "GET" => Ok(TaskKind::HttpGet),
            "POST" => Ok(TaskKind::HttpPost),
            "PUT" => Ok(TaskKind::HttpPut),
            "DELETE" => Ok(TaskKind::HttpDelete),
            _ => Err(SchedulerError::MessageType),
        }
    }

    /// The HTTP method for an HTTP kind; `None` for scripts.
    pub fn http_method(self) -> Option<reqwest::Method> {
        match self {
            TaskKind::Script => None,
            TaskKind::HttpGet => Some(reqwest::Method::GET),
            TaskKind::HttpPost => Some(reqwest::Method::POST),
            TaskKind::HttpPut => Some(reqwest::Method::PUT),
            TaskKind::HttpDelete => Some(reqwest::Method::DELETE),
        }
    }
}

/// The canonical in-flight task record.
///
/// Created once at admission with a fresh uuid and `attempt_index` 0;
/// retries re-enqueue the same record with only `attempt_index` advanced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskDescriptor {
    /// Opaque identifier, stable across all attempts of this task.
    pub uuid: String,
    /// Script or HTTP variant.
    pub kind: TaskKind,
    /// Binary name (relative, resolved under the worker's root) for scripts;
    /// absolute URL for HTTP kinds. Stored as `bin_name` on the wire.
    pub target: String,
    /// Space-separated argument string for scripts; request body for HTTP.
    pub args: String,
    /// Absolute epoch seconds at which the task becomes eligible.
    /// Zero or in the past means eligible immediately.
    pub start_time: i64,
    /// Delays (seconds) between successive attempts. Stored space-joined
    /// as `time_interval` on the wire. Empty means no retries.
    pub backoff_schedule: Vec<u64>,
    /// 0-based attempt number; stored as `index` on the wire.
    pub attempt_index: usize,
    /// Per-attempt hard timeout in seconds; zero means the worker default.
    pub max_run_time: u64,
}

impl TaskDescriptor {
    /// Serialize to the field/value pairs of a `t_<uuid>` hash.
    pub fn to_fields(&self) -> Vec<(&'static str, String)> {
        vec![
            ("uuid", self.uuid.clone()),
            ("bin_name", self.target.clone()),
            ("args", self.args.clone()),
            ("start_time", self.start_time.to_string()),
            ("time_interval", join_schedule(&self.backoff_schedule)),
            ("index", self.attempt_index.to_string()),
            ("max_run_time", self.max_run_time.to_string()),
            ("task_type", self.kind.wire_code().to_string()),
        ]
    }

    /// Rebuild a descriptor from an HMGET over [`TASK_FIELDS`].
    ///
    /// `values[0]` being absent means the hash itself is gone (expired or
    /// concurrently deleted) and is reported as [`SchedulerError::ResultNotExist`].
    pub fn from_fields(values: &[Option<String>]) -> SchedulerResult<Self> {
        if values.len() != TASK_FIELD_COUNT {
            return Err(SchedulerError::InvalidArgument);
        }
        if values[0].is_none() {
            return Err(SchedulerError::ResultNotExist);
        }
        let field = |i: usize| -> SchedulerResult<&str> {
            values[i]
                .as_deref()
                .ok_or(SchedulerError::InvalidArgument)
        };
        Ok(TaskDescriptor {
            uuid: field(0)?.to_string(),
            target: field(1)?.to_string(),
            args: field(2)?.to_string(),
            start_time: field(3)?.parse()?,
            backoff_schedule: parse_schedule(field(4)?)?,
            attempt_index: field(5)?.parse()?,
            max_run_time: field(6)?.parse()?,
            kind: TaskKind::from_wire(field(7)?.parse()?)?,
        })
    }

    /// Key of the pending-task hash for this uuid.
    pub fn task_key(&self) -> String {
        task_key(&self.uuid)
    }

    /// Key of the result hash for this uuid.
    pub fn result_key(&self) -> String {
        result_key(&self.uuid)
    }
}

/// The outcome of one attempt, written to `r_<uuid>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskReport {
    /// The descriptor the attempt ran with.
    pub task: TaskDescriptor,
    /// Whether the attempt succeeded.
    pub is_success: bool,
    /// Trimmed stdout / response body on success; error message on failure.
    pub result: String,
}

impl TaskReport {
    /// Serialize to the field/value pairs of an `r_<uuid>` hash:
    /// the full descriptor plus `is_success` and `result`.
    pub fn to_fields(&self) -> Vec<(&'static str, String)> {
        let mut fields = self.task.to_fields();
        fields.push(("is_success", if self.is_success { "1" } else { "0" }.to_string()));
        fields.push(("result", self.result.clone()));
        fields
    }
}

/// Reply payload for result queries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultReply {
    /// 1 when a result hash exists for the uuid, 0 otherwise.
    pub is_result_exist: u8,
    /// 1 when the recorded attempt succeeded.
    pub is_success: u8,
    /// Result value, or the error message when unsuccessful.
    pub result: String,
}

/// Parse a space-joined back-off schedule. Empty input is an empty schedule.
pub fn parse_schedule(raw: &str) -> SchedulerResult<Vec<u64>> {
    if raw.is_empty() {
        return Ok(Vec::new());
    }
    raw.split(' ')
        .map(|s| s.parse::<u64>().map_err(SchedulerError::from))
        .collect()
}

/// Join a back-off schedule into its wire form.
pub fn join_schedule(schedule: &[u64]) -> String {
    schedule
        .iter()
        .map(u64::to_string)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Pending-task hash key for a uuid.
pub fn task_key(uuid: &str) -> String {
    format!("t_{uuid}")
}

/// Result hash key for a uuid.
pub fn result_key(uuid: &str) -> String {
    format!("r_{uuid}")
}

/// Errors surfaced by the scheduler core.
///
/// The display strings are part of the operator-facing contract: execution
/// failures are recorded verbatim in result hashes and admission rejections
/// are returned to callers as these strings.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Malformed submission or wire record.
    #[error("invalid argument")]
    InvalidArgument,

    /// Unrecognized task kind or HTTP method.
    #[error("message type error")]
    MessageType,

    /// Back-off schedule exhausted.
    #[error("retry task max time")]
    TryMaxTimes,

    /// Script target missing under the worker's binary root.
    #[error("file not exist")]
    FileNotFound,

    /// Result queried for an unknown uuid.
    #[error("result not exist")]
    ResultNotExist,

    /// Attempt exceeded its hard timeout and was killed.
    #[error("exec time out")]
    ExecTimeout,

    /// KVS I/O failure.
    #[error("bad net connection: {0}")]
    BadConnection(String),

    /// Execution failure with the subprocess / HTTP error text.
    #[error("{0}")]
    Execution(String),
}

impl From<redis::RedisError> for SchedulerError {
    fn from(err: redis::RedisError) -> Self {
        SchedulerError::BadConnection(err.to_string())
    }
}

impl From<std::num::ParseIntError> for SchedulerError {
    fn from(_: std::num::ParseIntError) -> Self {
        SchedulerError::InvalidArgument
    }
}
