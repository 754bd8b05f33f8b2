//! Fatal-error policy applied by the embedding application
//!
//! The controller always returns device failures as [`Error`]. A caller that
//! wants the classic behavior (terminate on any device failure) runs results
//! through [`FailurePolicy::check`] with [`FailurePolicy::Abort`]; a service
//! that must keep running uses [`FailurePolicy::Propagate`] and fails the
//! request instead.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tracing::error;

/// Exit status used when a fatal error aborts the process
pub const FATAL_EXIT_CODE: i32 = 1;

/// What to do with a fatal pipeline error
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    /// Log and terminate the process
    #[default]
    Abort,
    /// Hand the error back to the caller
    Propagate,
}

impl FailurePolicy {
    /// Apply the policy to a pipeline result
    ///
    /// Non-fatal errors (caller-contract and configuration errors) are always
    /// returned, whatever the policy.
    pub fn check<T>(self, result: Result<T>) -> Result<T> {
        match result {
            Err(err) if err.is_fatal() && self == FailurePolicy::Abort => {
                error!(kind = ?err.kind(), "fatal pipeline error: {err}");
                std::process::exit(FATAL_EXIT_CODE);
            }
            other => other,
        }
    }

    /// Whether a fatal error ends the process under this policy
    #[must_use]
    pub fn terminates(&self) -> bool {
        matches!(self, FailurePolicy::Abort)
    }
}

impl fmt::Display for FailurePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailurePolicy::Abort => write!(f, "abort"),
            FailurePolicy::Propagate => write!(f, "propagate"),
        }
    }
}

impl FromStr for FailurePolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "abort" | "exit" => Ok(FailurePolicy::Abort),
            "propagate" | "return" => Ok(FailurePolicy::Propagate),
            _ => Err(Error::InvalidConfig(format!(
                "unknown failure policy: {s}"
            ))),
        }
    }
}
