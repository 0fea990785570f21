//! Execution state reconstruction from the event log (spec §4.5.2 "fold the
//! event stream for this execution into a compact per-step state").

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use db::models::EventRow;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// High-level execution state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionState {
    Initial,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// State of a single workflow step, per spec §4.5.2's
/// `{not_started, in_flight, completed, failed, iterating}` set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepState {
    NotStarted,
    InFlight,
    Completed,
    Failed,
    Iterating,
}

/// Step information including state and result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepInfo {
    pub name: String,
    pub state: StepState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    pub attempt: i32,
    /// Number of inline/sub-playbook iterations expected, once a
    /// `loop_started`/`iterator_started` event has fixed the collection size.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expected_count: Option<usize>,
    #[serde(default)]
    pub completed_count: usize,
    #[serde(default)]
    pub failed_count: usize,
    /// Per-iteration results keyed by loop index, for an iterator step
    /// (spec §4.5.5 "order preserved via iteration index").
    #[serde(default)]
    pub iteration_results: std::collections::BTreeMap<usize, Value>,
    /// True between this step's `save_started` and its `save_completed`/
    /// `save_failed`/`save_error` (spec §4.5.7 sinks are part of the same
    /// transactional boundary as their owning step, so finalisation must
    /// wait on them too).
    #[serde(default)]
    pub sink_pending: bool,
}

impl StepInfo {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            state: StepState::NotStarted,
            result: None,
            error: None,
            started_at: None,
            completed_at: None,
            attempt: 0,
            expected_count: None,
            completed_count: 0,
            failed_count: 0,
            iteration_results: std::collections::BTreeMap::new(),
            sink_pending: false,
        }
    }
}

/// Complete workflow state reconstructed from events (spec §3 "Invariants":
/// fold order matches total event order per execution).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowState {
    pub execution_id: i64,
    pub catalog_id: i64,
    pub state: ExecutionState,
    pub steps: HashMap<String, StepInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_execution_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_step: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_event_id: Option<i64>,
    /// Set when this execution was spawned for one index of a sub-playbook
    /// iterator, so completion can be folded back under the iterator's
    /// `-iter-` node id (spec §4.5.5).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_loop_index: Option<usize>,
}

impl WorkflowState {
    pub fn new(execution_id: i64, catalog_id: i64) -> Self {
        Self {
            execution_id,
            catalog_id,
            state: ExecutionState::Initial,
            steps: HashMap::new(),
            started_at: None,
            completed_at: None,
            parent_execution_id: None,
            parent_step: None,
            parent_event_id: None,
            parent_loop_index: None,
        }
    }

    /// Reconstruct state by folding every event of an execution, in event
    /// order. Returns `None` for an execution with no events yet.
    pub fn from_events(events: &[EventRow]) -> Option<Self> {
        let first = events.first()?;
        let mut state = Self::new(first.execution_id, first.catalog_id);
        for event in events {
            state.apply_event(event);
        }
        state
    }

    fn step_mut(&mut self, name: &str) -> &mut StepInfo {
        self.steps
            .entry(name.to_string())
            .or_insert_with(|| StepInfo::new(name))
    }

    /// Apply a single event's effect on the folded state (spec §6.4's event
    /// taxonomy).
    pub fn apply_event(&mut self, event: &EventRow) {
        match event.event_type.as_str() {
            "execution_start" => {
                self.state = ExecutionState::InProgress;
                self.started_at = Some(event.created_at);
                self.parent_execution_id = event.parent_execution_id;
                self.parent_step = event.parent_step.clone();
                self.parent_event_id = event.parent_event_id;
                self.parent_loop_index = event
                    .meta
                    .as_ref()
                    .and_then(|m| m.get("parent_loop_index"))
                    .and_then(|v| v.as_u64())
                    .map(|n| n as usize);
            }
            "execution_complete" => {
                self.state = ExecutionState::Completed;
                self.completed_at = Some(event.created_at);
            }
            "execution_failed" => {
                self.state = ExecutionState::Failed;
                self.completed_at = Some(event.created_at);
            }
            "cancel_requested" => {
                self.state = ExecutionState::Cancelled;
                self.completed_at = Some(event.created_at);
            }
            "step_started" | "action_started" => {
                if let Some(name) = &event.node_name {
                    let step = self.step_mut(name);
                    step.state = StepState::InFlight;
                    step.started_at.get_or_insert(event.created_at);
                    if let Some(attempt) = event.attempt {
                        step.attempt = attempt;
                    }
                }
            }
            "loop_started" | "iterator_started" => {
                if let Some(name) = &event.node_name {
                    let expected = event
                        .meta
                        .as_ref()
                        .and_then(|m| m.get("expected_count"))
                        .and_then(|v| v.as_u64())
                        .map(|n| n as usize);
                    let step = self.step_mut(name);
                    step.state = StepState::Iterating;
                    step.started_at.get_or_insert(event.created_at);
                    step.expected_count = expected;
                }
            }
            "iteration_completed" => {
                if let Some(name) = &event.node_name {
                    let index = event
                        .meta
                        .as_ref()
                        .and_then(|m| m.get("loop_index"))
                        .and_then(|v| v.as_u64())
                        .map(|n| n as usize);
                    let result = event.result.clone().unwrap_or(Value::Null);
                    let step = self.step_mut(name);
                    step.completed_count += 1;
                    if let Some(index) = index {
                        step.iteration_results.insert(index, result);
                    }
                }
            }
            "iteration_failed" => {
                if let Some(name) = &event.node_name {
                    let step = self.step_mut(name);
                    step.failed_count += 1;
                }
            }
            "loop_completed" | "step_completed" => {
                if let Some(name) = &event.node_name {
                    let step = self.step_mut(name);
                    step.state = StepState::Completed;
                    step.completed_at = Some(event.created_at);
                    step.result = event.result.clone();
                }
            }
            "step_failed" | "action_error" => {
                if let Some(name) = &event.node_name {
                    let step = self.step_mut(name);
                    step.state = StepState::Failed;
                    step.completed_at = Some(event.created_at);
                    step.error = event
                        .result
                        .as_ref()
                        .and_then(|r| r.get("error"))
                        .and_then(|v| v.as_str())
                        .map(str::to_string);
                }
            }
            "save_started" => {
                if let Some(owner) = event.node_name.as_deref().and_then(|n| n.strip_suffix("-sink")) {
                    self.step_mut(owner).sink_pending = true;
                }
            }
            "save_completed" | "save_failed" | "save_error" => {
                if let Some(owner) = event.node_name.as_deref().and_then(|n| n.strip_suffix("-sink")) {
                    self.step_mut(owner).sink_pending = false;
                }
            }
            _ => {}
        }
    }

    pub fn get_step_result(&self, step_name: &str) -> Option<&Value> {
        self.steps.get(step_name).and_then(|s| s.result.as_ref())
    }

    pub fn is_step_done(&self, step_name: &str) -> bool {
        self.steps
            .get(step_name)
            .map(|s| matches!(s.state, StepState::Completed | StepState::Failed))
            .unwrap_or(false)
    }

    pub fn is_step_completed(&self, step_name: &str) -> bool {
        self.steps
            .get(step_name)
            .map(|s| matches!(s.state, StepState::Completed))
            .unwrap_or(false)
    }

    pub fn is_step_failed(&self, step_name: &str) -> bool {
        self.steps
            .get(step_name)
            .map(|s| matches!(s.state, StepState::Failed))
            .unwrap_or(false)
    }

    pub fn completed_steps(&self) -> Vec<&str> {
        self.steps
            .iter()
            .filter(|(_, info)| matches!(info.state, StepState::Completed))
            .map(|(name, _)| name.as_str())
            .collect()
    }

    pub fn running_steps(&self) -> Vec<&str> {
        self.steps
            .iter()
            .filter(|(_, info)| matches!(info.state, StepState::InFlight | StepState::Iterating))
            .map(|(name, _)| name.as_str())
            .collect()
    }

    pub fn has_running_steps(&self) -> bool {
        !self.running_steps().is_empty() || self.steps.values().any(|s| s.sink_pending)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn event(execution_id: i64, event_type: &str, node_name: Option<&str>) -> EventRow {
        EventRow {
            id: 1,
            event_id: 1,
            execution_id,
            catalog_id: 1,
            parent_event_id: None,
            parent_execution_id: None,
            parent_step: None,
            event_type: event_type.to_string(),
            status: "ok".to_string(),
            node_id: node_name.map(|n| n.to_string()),
            node_name: node_name.map(|n| n.to_string()),
            node_type: None,
            context: None,
            result: None,
            meta: None,
            worker_id: None,
            attempt: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn no_events_yields_no_state() {
        assert!(WorkflowState::from_events(&[]).is_none());
    }

    #[test]
    fn execution_start_then_step_lifecycle() {
        let events = vec![
            event(1, "execution_start", None),
            event(1, "action_started", Some("a")),
            event(1, "action_completed", Some("a")),
            event(1, "execution_complete", None),
        ];
        let state = WorkflowState::from_events(&events).unwrap();
        assert_eq!(state.state, ExecutionState::Completed);
        assert!(state.is_step_completed("a"));
        assert!(!state.has_running_steps());
    }

    #[test]
    fn in_flight_step_is_running() {
        let events = vec![event(1, "execution_start", None), event(1, "action_started", Some("a"))];
        let state = WorkflowState::from_events(&events).unwrap();
        assert!(state.has_running_steps());
        assert!(!state.is_step_done("a"));
    }

    #[test]
    fn pending_sink_keeps_step_running_even_after_completion() {
        let events = vec![
            event(1, "execution_start", None),
            event(1, "action_started", Some("a")),
            event(1, "action_completed", Some("a")),
            event(1, "save_started", Some("a-sink")),
        ];
        let state = WorkflowState::from_events(&events).unwrap();
        assert!(state.is_step_done("a"));
        assert!(state.has_running_steps());
    }

    #[test]
    fn save_completed_clears_sink_pending() {
        let events = vec![
            event(1, "execution_start", None),
            event(1, "action_started", Some("a")),
            event(1, "action_completed", Some("a")),
            event(1, "save_started", Some("a-sink")),
            event(1, "save_completed", Some("a-sink")),
        ];
        let state = WorkflowState::from_events(&events).unwrap();
        assert!(!state.has_running_steps());
    }
}
