//! The retry evaluator (spec §4.4).

use minijinja::value::Value as MjValue;
use minijinja::Environment;
use rand::Rng;

use crate::error::RetryError;
use crate::policy::{BackoffPolicy, RetryPolicy, ThenClause};

/// Outcome of evaluating a failure against a retry policy.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FailureOutcome {
    pub should_retry: bool,
    pub delay_seconds: f64,
}

impl FailureOutcome {
    fn stop() -> Self {
        Self {
            should_retry: false,
            delay_seconds: 0.0,
        }
    }
}

/// Outcome of evaluating the success-path when/then form for pagination.
#[derive(Debug, Clone, PartialEq)]
pub struct ContinuationOutcome {
    pub next_call: Option<serde_json::Value>,
    pub collect_into: Option<String>,
}

fn eval_bool(expr: &str, ctx: &serde_json::Value) -> Result<bool, RetryError> {
    let env = Environment::new();
    let compiled = env
        .compile_expression(expr)
        .map_err(|source| RetryError::Expression {
            expr: expr.to_string(),
            source,
        })?;
    let value = compiled
        .eval(MjValue::from_serialize(ctx))
        .map_err(|source| RetryError::Expression {
            expr: expr.to_string(),
            source,
        })?;
    Ok(value.is_true())
}

fn compute_delay(policy: &BackoffPolicy, attempts_made: u32) -> f64 {
    let exponent = attempts_made.saturating_sub(1) as i32;
    let raw = policy.initial_delay * policy.backoff_multiplier.powi(exponent);
    let mut delay = raw.min(policy.max_delay);
    if policy.jitter {
        let factor = rand::thread_rng().gen_range(0.5..=1.5);
        delay *= factor;
    }
    delay
}

/// Evaluate the simple (non-list) backoff form against `ctx`
/// (result, error, status_code, attempt, execution_id, node_id — whatever
/// the caller assembled) and the number of attempts already made.
///
/// Implements spec §4.4's five-step algorithm exactly, including the
/// attempts-already-made correctness rule: `attempts_made` must be the
/// counter `lease()` already incremented, not attempt-about-to-run.
fn evaluate_backoff(
    policy: &BackoffPolicy,
    ctx: &serde_json::Value,
    attempts_made: u32,
) -> Result<FailureOutcome, RetryError> {
    if attempts_made >= policy.max_attempts {
        return Ok(FailureOutcome::stop());
    }

    if let Some(stop_when) = &policy.stop_when {
        if eval_bool(stop_when, ctx)? {
            return Ok(FailureOutcome::stop());
        }
    }

    let should_retry = match &policy.retry_when {
        Some(expr) => eval_bool(expr, ctx)?,
        // Default: truthy on any error being evaluated at all.
        None => true,
    };
    if !should_retry {
        return Ok(FailureOutcome::stop());
    }

    Ok(FailureOutcome {
        should_retry: true,
        delay_seconds: compute_delay(policy, attempts_made),
    })
}

/// Evaluate a failing event against a retry policy of any of the four
/// accepted shapes (spec §3, §4.4).
pub fn evaluate_failure(
    policy: &RetryPolicy,
    ctx: &serde_json::Value,
    attempts_made: u32,
) -> Result<FailureOutcome, RetryError> {
    match policy {
        RetryPolicy::List(entries) => {
            for entry in entries {
                let matched = match &entry.when {
                    Some(expr) => eval_bool(expr, ctx)?,
                    None => true,
                };
                if !matched {
                    continue;
                }
                return match &entry.then {
                    ThenClause::Backoff(backoff) => evaluate_backoff(backoff, ctx, attempts_made),
                    // A continuation entry describes a success-path
                    // pagination step, not an error backoff; matching it on
                    // the failure path means "no retry, this wasn't meant
                    // to run here".
                    ThenClause::Continuation(_) => Ok(FailureOutcome::stop()),
                };
            }
            // An unmatched list means no retry (spec §4.4 "Unified when/then").
            Ok(FailureOutcome::stop())
        }
        other => match other.as_backoff() {
            Some(backoff) => evaluate_backoff(&backoff, ctx, attempts_made),
            None => Ok(FailureOutcome::stop()),
        },
    }
}

/// Evaluate the unified when/then list on the success path, looking for a
/// continuation entry (spec §4.5.5 "Pagination/continuation"). Returns
/// `None` when the policy isn't a list, or no entry matches — i.e. the
/// worker should emit a final `action_completed` rather than re-invoking.
pub fn evaluate_continuation(
    policy: &RetryPolicy,
    ctx: &serde_json::Value,
) -> Result<Option<ContinuationOutcome>, RetryError> {
    let RetryPolicy::List(entries) = policy else {
        return Ok(None);
    };

    for entry in entries {
        let matched = match &entry.when {
            Some(expr) => eval_bool(expr, ctx)?,
            None => true,
        };
        if !matched {
            continue;
        }
        if let ThenClause::Continuation(spec) = &entry.then {
            return Ok(Some(ContinuationOutcome {
                next_call: spec.next_call.clone(),
                collect_into: spec.collect.as_ref().map(|c| c.into.clone()),
            }));
        }
        return Ok(None);
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn max_attempts_one_never_retries() {
        let policy = RetryPolicy::Count(1);
        let outcome = evaluate_failure(&policy, &json!({}), 1).unwrap();
        assert!(!outcome.should_retry);
    }

    #[test]
    fn zero_delay_constant_multiplier_is_immediate() {
        let policy = RetryPolicy::Structured(BackoffPolicy {
            max_attempts: 5,
            initial_delay: 0.0,
            backoff_multiplier: 1.0,
            max_delay: 3600.0,
            jitter: false,
            retry_when: None,
            stop_when: None,
        });
        for attempt in 1..=3 {
            let outcome = evaluate_failure(&policy, &json!({}), attempt).unwrap();
            assert!(outcome.should_retry);
            assert_eq!(outcome.delay_seconds, 0.0);
        }
    }

    #[test]
    fn attempts_already_made_compared_directly_to_max() {
        // attempts_made == max_attempts must stop, not attempts_made + 1.
        let policy = RetryPolicy::Count(3);
        let outcome = evaluate_failure(&policy, &json!({}), 3).unwrap();
        assert!(!outcome.should_retry);
        let outcome = evaluate_failure(&policy, &json!({}), 2).unwrap();
        assert!(outcome.should_retry);
    }

    #[test]
    fn stop_when_short_circuits_before_retry_when() {
        let policy = RetryPolicy::Structured(BackoffPolicy {
            stop_when: Some("status_code == 404".to_string()),
            retry_when: Some("true".to_string()),
            ..Default::default()
        });
        let outcome = evaluate_failure(&policy, &json!({"status_code": 404}), 1).unwrap();
        assert!(!outcome.should_retry);
    }

    #[test]
    fn exponential_backoff_matches_the_documented_formula() {
        let policy = BackoffPolicy {
            max_attempts: 10,
            initial_delay: 1.0,
            backoff_multiplier: 2.0,
            max_delay: 3600.0,
            jitter: false,
            retry_when: None,
            stop_when: None,
        };
        assert_eq!(compute_delay(&policy, 1), 1.0);
        assert_eq!(compute_delay(&policy, 2), 2.0);
        assert_eq!(compute_delay(&policy, 3), 4.0);
    }

    #[test]
    fn max_delay_caps_the_backoff() {
        let policy = BackoffPolicy {
            max_attempts: 10,
            initial_delay: 100.0,
            backoff_multiplier: 10.0,
            max_delay: 150.0,
            jitter: false,
            retry_when: None,
            stop_when: None,
        };
        assert_eq!(compute_delay(&policy, 3), 150.0);
    }

    #[test]
    fn when_then_list_first_match_wins() {
        let policy = RetryPolicy::List(vec![
            crate::policy::WhenThenEntry {
                when: Some("status_code == 429".to_string()),
                then: ThenClause::Backoff(BackoffPolicy::with_max_attempts(5)),
            },
            crate::policy::WhenThenEntry {
                when: None,
                then: ThenClause::Backoff(BackoffPolicy::with_max_attempts(1)),
            },
        ]);
        let outcome = evaluate_failure(&policy, &json!({"status_code": 429}), 1).unwrap();
        assert!(outcome.should_retry);

        let outcome = evaluate_failure(&policy, &json!({"status_code": 500}), 1).unwrap();
        // Falls to the unconditional entry with max_attempts=1; attempts_made=1 stops.
        assert!(!outcome.should_retry);
    }

    #[test]
    fn unmatched_list_means_no_retry() {
        let policy = RetryPolicy::List(vec![crate::policy::WhenThenEntry {
            when: Some("status_code == 429".to_string()),
            then: ThenClause::Backoff(BackoffPolicy::default()),
        }]);
        let outcome = evaluate_failure(&policy, &json!({"status_code": 500}), 1).unwrap();
        assert!(!outcome.should_retry);
    }

    #[test]
    fn continuation_entry_extracted_on_success_path() {
        let policy = RetryPolicy::List(vec![crate::policy::WhenThenEntry {
            when: Some("has_more == true".to_string()),
            then: ThenClause::Continuation(crate::policy::ContinuationSpec {
                next_call: Some(json!({"page": 2})),
                collect: Some(crate::policy::CollectSpec {
                    into: "items".to_string(),
                }),
            }),
        }]);
        let outcome = evaluate_continuation(&policy, &json!({"has_more": true}))
            .unwrap()
            .expect("continuation should match");
        assert_eq!(outcome.collect_into.as_deref(), Some("items"));
    }

    #[test]
    fn no_retry_false_policy_is_inert() {
        let outcome = evaluate_failure(&RetryPolicy::Bool(false), &json!({}), 0).unwrap();
        assert!(!outcome.should_retry);
    }
}
