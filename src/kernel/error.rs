//! Kernel call errors
//!
//! Two tiers of failure:
//! - Recoverable misuse (bad argument, call not allowed in the current
//!   state) returns a [`SyscallError`] and leaves the kernel unchanged
//! - Internal inconsistency (time running backwards, an empty calendar,
//!   a task in a state no handler expects) aborts the simulation

use std::borrow::Cow;

/// Result type for kernel calls
pub type SyscallResult<T> = Result<T, SyscallError>;

/// Errors returned by kernel calls
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SyscallError {
    /// An argument was out of range or named a dead object
    #[error("{call}: Invalid '{param}' parameter")]
    BadParam {
        call: &'static str,
        param: &'static str,
    },
    /// The call is not allowed in the current state
    #[error("{call}: {reason}")]
    BadCall {
        call: &'static str,
        reason: Cow<'static, str>,
    },
}

impl SyscallError {
    pub fn bad_param(call: &'static str, param: &'static str) -> Self {
        SyscallError::BadParam { call, param }
    }

    pub fn bad_call(call: &'static str, reason: impl Into<Cow<'static, str>>) -> Self {
        SyscallError::BadCall {
            call,
            reason: reason.into(),
        }
    }

    /// Name of the kernel call that failed
    pub fn call(&self) -> &'static str {
        match self {
            SyscallError::BadParam { call, .. } | SyscallError::BadCall { call, .. } => call,
        }
    }
}

/// Stop the simulation on an internal inconsistency
#[track_caller]
pub fn abort(msg: &str) -> ! {
    panic!("PARASOL ABORT: {msg}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bad_param_message() {
        let err = SyscallError::bad_param("compute", "delta");
        assert_eq!(err.to_string(), "compute: Invalid 'delta' parameter");
        assert_eq!(err.call(), "compute");
    }

    #[test]
    fn test_bad_call_message() {
        let err = SyscallError::bad_call("resume", "Task is not suspended");
        assert_eq!(err.to_string(), "resume: Task is not suspended");
    }

    #[test]
    #[should_panic(expected = "PARASOL ABORT: Empty calendar")]
    fn test_abort_prefix() {
        abort("Empty calendar");
    }
}
