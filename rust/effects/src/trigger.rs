//! Mapping run outcomes to replies for an inbound trigger.
//!
//! | Outcome | Reply |
//! |---------|-------|
//! | `Success(value)` | 200 with the value as JSON |
//! | `Failure(error)` | status from [`ErrorClass`], error class and message |
//! | `Defect(defect)` | 500 with a generic body; the cause is only logged |
//! | `Interrupted` | no reply |

use std::fmt;

use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, error};
use weft_types::Outcome;

use crate::errors::{Classify, ErrorClass};

/// What an inbound trigger sends back.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "reply", rename_all = "snake_case")]
pub enum Reply {
    Respond { status: u16, body: Value },
    /// The caller went away or the run was cancelled.
    NoReply,
}

impl Reply {
    pub fn from_outcome<A, E>(outcome: Outcome<A, E>) -> Self
    where
        A: Serialize,
        E: Classify + fmt::Display,
    {
        match outcome {
            Outcome::Success(value) => match serde_json::to_value(&value) {
                Ok(body) => Reply::Respond { status: 200, body },
                Err(err) => {
                    error!(error = %err, "response body failed to serialize");
                    internal_error()
                }
            },
            Outcome::Failure(failure) => {
                let class = failure.class();
                debug!(class = ?class, error = %failure, "request failed");
                Reply::Respond {
                    status: status_for(class),
                    body: json!({
                        "error": class,
                        "message": failure.to_string(),
                    }),
                }
            }
            Outcome::Defect(defect) => {
                error!(
                    kind = %defect.kind(),
                    cause = ?defect.cause(),
                    "request died: {defect}"
                );
                internal_error()
            }
            Outcome::Interrupted => {
                debug!("request interrupted, not replying");
                Reply::NoReply
            }
        }
    }

    #[must_use]
    pub fn status(&self) -> Option<u16> {
        match self {
            Reply::Respond { status, .. } => Some(*status),
            Reply::NoReply => None,
        }
    }

    #[must_use]
    pub fn body(&self) -> Option<&Value> {
        match self {
            Reply::Respond { body, .. } => Some(body),
            Reply::NoReply => None,
        }
    }
}

/// HTTP-style status code for a failure class.
#[must_use]
pub fn status_for(class: ErrorClass) -> u16 {
    match class {
        ErrorClass::Validation => 400,
        ErrorClass::Unauthorized => 401,
        ErrorClass::NotFound => 404,
        ErrorClass::Upstream => 502,
        ErrorClass::Timeout => 504,
    }
}

fn internal_error() -> Reply {
    Reply::Respond {
        status: 500,
        body: json!({
            "error": "internal",
            "message": "internal error",
        }),
    }
}
