//! Retry policy data model (spec §3 "Retry policy", §4.4).
//!
//! A policy is either absent, a boolean, an integer, a structured record, or
//! a unified when/then list. `#[serde(untagged)]` lets a playbook author
//! write any of these four shapes under the same `retry:` key.

use serde::{Deserialize, Serialize};

fn default_max_attempts() -> u32 {
    3
}
fn default_initial_delay() -> f64 {
    1.0
}
fn default_backoff_multiplier() -> f64 {
    2.0
}
fn default_max_delay() -> f64 {
    3600.0
}

/// The structured record form of a retry policy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BackoffPolicy {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_delay")]
    pub initial_delay: f64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    #[serde(default = "default_max_delay")]
    pub max_delay: f64,
    #[serde(default)]
    pub jitter: bool,
    /// Truthy on a failure this policy should retry; defaults to "retry on
    /// any error" when absent (spec §4.4 step 3).
    #[serde(default)]
    pub retry_when: Option<String>,
    /// Truthy short-circuits to "do not retry" before `retry_when` is
    /// consulted (spec §4.4 step 2).
    #[serde(default)]
    pub stop_when: Option<String>,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay: default_initial_delay(),
            backoff_multiplier: default_backoff_multiplier(),
            max_delay: default_max_delay(),
            jitter: false,
            retry_when: None,
            stop_when: None,
        }
    }
}

impl BackoffPolicy {
    pub fn with_max_attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..Default::default()
        }
    }
}

/// `then` payload of a success-path when/then entry: pagination/continuation
/// (spec §4.5.5 "Pagination/continuation").
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ContinuationSpec {
    /// Overrides merged into the context for the next invocation of the
    /// same action.
    #[serde(default)]
    pub next_call: Option<serde_json::Value>,
    /// Aggregator the worker accumulates results into across iterations.
    #[serde(default)]
    pub collect: Option<CollectSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CollectSpec {
    pub into: String,
}

/// What a when/then entry does once matched: either an error backoff, or a
/// success-path continuation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum ThenClause {
    Continuation(ContinuationSpec),
    Backoff(BackoffPolicy),
}

/// One entry of the unified when/then list form.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WhenThenEntry {
    /// `None` means unconditional — matches whatever wasn't matched above it
    /// (the `else` case described in spec §3/§4.4).
    #[serde(default)]
    pub when: Option<String>,
    pub then: ThenClause,
}

/// A retry policy as attached to a step (spec §3 "Retry policy").
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum RetryPolicy {
    Bool(bool),
    Count(u32),
    Structured(BackoffPolicy),
    List(Vec<WhenThenEntry>),
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy::Bool(false)
    }
}

impl RetryPolicy {
    /// Normalise the four accepted shapes to a single effective backoff
    /// policy for the simple error-retry path. Returns `None` when the
    /// policy is absent/false (no retries) or is a when/then list (handled
    /// separately by [`crate::eval::evaluate_failure`]).
    pub fn as_backoff(&self) -> Option<BackoffPolicy> {
        match self {
            RetryPolicy::Bool(false) => None,
            RetryPolicy::Bool(true) => Some(BackoffPolicy::default()),
            RetryPolicy::Count(n) => Some(BackoffPolicy::with_max_attempts(*n)),
            RetryPolicy::Structured(b) => Some(b.clone()),
            RetryPolicy::List(_) => None,
        }
    }
}
