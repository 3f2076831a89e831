//! Ordered "first success" evaluation over alternative requests.
//!
//! Some resources are served from different paths depending on the backend
//! deployment. Instead of nesting retries, callers build an ordered list of
//! labelled candidates and let [`first_success`] try them one at a time.

use std::fmt;

use futures::future::BoxFuture;
use tracing::{debug, warn};

use super::error::is_auth_rejection;

/// A labelled request that has not been started yet
pub struct Candidate<'a, T> {
    pub label: String,
    pub request: BoxFuture<'a, anyhow::Result<T>>,
}

impl<'a, T> Candidate<'a, T> {
    pub fn new(label: impl Into<String>, request: BoxFuture<'a, anyhow::Result<T>>) -> Self {
        Self {
            label: label.into(),
            request,
        }
    }
}

/// One failed candidate
#[derive(Debug)]
pub struct Attempt {
    pub label: String,
    pub error: anyhow::Error,
}

/// Every candidate failed (or one was rejected for auth and the rest skipped)
#[derive(Debug)]
pub struct FallbackError {
    pub attempts: Vec<Attempt>,
}

impl FallbackError {
    /// True when the chain stopped because the credentials were rejected
    pub fn is_auth_rejection(&self) -> bool {
        self.attempts
            .last()
            .map(|a| is_auth_rejection(&a.error))
            .unwrap_or(false)
    }
}

impl fmt::Display for FallbackError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.attempts.is_empty() {
            return write!(f, "no candidates to try");
        }
        write!(f, "all {} candidates failed", self.attempts.len())?;
        for attempt in &self.attempts {
            write!(f, "; {}: {:#}", attempt.label, attempt.error)?;
        }
        Ok(())
    }
}

impl std::error::Error for FallbackError {}

/// Run candidates in order and return the label and value of the first success.
///
/// Failures are logged and collected. A 401/403 ends the chain early: the
/// remaining candidates would present the same credentials.
pub async fn first_success<T>(
    candidates: Vec<Candidate<'_, T>>,
) -> Result<(String, T), FallbackError> {
    let mut attempts = Vec::new();

    for candidate in candidates {
        match candidate.request.await {
            Ok(value) => {
                if !attempts.is_empty() {
                    debug!(label = %candidate.label, failed = attempts.len(), "Fallback candidate succeeded");
                }
                return Ok((candidate.label, value));
            }
            Err(error) => {
                warn!(label = %candidate.label, error = %format!("{:#}", error), "Fallback candidate failed");
                let rejected = is_auth_rejection(&error);
                attempts.push(Attempt {
                    label: candidate.label,
                    error,
                });
                if rejected {
                    break;
                }
            }
        }
    }

    Err(FallbackError { attempts })
}
