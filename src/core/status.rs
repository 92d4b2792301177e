//! Execution status state machine.
//!
//! Every callback invocation reports exactly one [`Status`]. The value is
//! also persisted on the task record as its last exit code, so the integer
//! representation is part of the storage format.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Error returned when decoding a status from its persisted form.
#[derive(Debug, Error)]
#[error("unknown status code: {0}")]
pub struct UnknownStatus(pub i64);

/// Outcome of a single callback invocation.
///
/// The lifecycle of a task record is
/// `InitialSchedule → Running → {WillResume → Running}* → {Ok, Error}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    /// The task has been scheduled but never run.
    InitialSchedule,
    /// The task is currently executing; doubles as a lock indicator on the
    /// persisted record.
    Running,
    /// Partial progress was made; the same callback must be invoked again
    /// with the same state bag before the run is complete.
    WillResume,
    /// The run finished successfully.
    Ok,
    /// The run failed. The record stays eligible for its next scheduled
    /// occurrence; it is not retried immediately.
    Error,
}

impl Status {
    /// Integer exit code stored on the task record.
    ///
    /// Codes above 120 follow shell exit-code conventions for abnormal
    /// termination; the initial-schedule sentinel is negative so it can
    /// never collide with a real exit code.
    pub fn code(&self) -> i64 {
        match self {
            Status::InitialSchedule => -100,
            Status::Ok => 0,
            Status::WillResume => 123,
            Status::Running => 124,
            Status::Error => 125,
        }
    }

    /// Decode a persisted exit code back into a status.
    pub fn from_code(code: i64) -> Result<Self, UnknownStatus> {
        match code {
            -100 => Ok(Status::InitialSchedule),
            0 => Ok(Status::Ok),
            123 => Ok(Status::WillResume),
            124 => Ok(Status::Running),
            125 => Ok(Status::Error),
            other => Err(UnknownStatus(other)),
        }
    }

    /// Whether this status ends the current run.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Status::Ok | Status::Error)
    }

    /// Whether a record with this status is pending or active, and must
    /// therefore not be reused by the enqueue helper.
    pub fn is_pending(&self) -> bool {
        matches!(
            self,
            Status::InitialSchedule | Status::WillResume | Status::Running
        )
    }

    /// Map a terminal status to a driver process outcome.
    pub fn is_success(&self) -> bool {
        matches!(self, Status::Ok)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Status::InitialSchedule => "initial_schedule",
            Status::Running => "running",
            Status::WillResume => "will_resume",
            Status::Ok => "ok",
            Status::Error => "error",
        };
        write!(f, "{}", name)
    }
}
