//! Core domain models for the broker: playbooks, steps, transitions.
//!
//! These types are the in-memory shape of a catalog document (spec §3
//! "Playbook"). They are parsed straight from the JSON stored in
//! `noetl.catalog.content`; no business behaviour beyond simple lookups
//! lives on them — the broker owns behaviour.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// ---------------------------------------------------------------------------
// Playbook
// ---------------------------------------------------------------------------

/// An immutable document fetched from the catalog by (path, version)
/// (spec §3 "Playbook").
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Playbook {
    #[serde(default)]
    pub metadata: Value,
    /// Default parameter mapping, overridden by the caller's workload at
    /// submission time.
    #[serde(default)]
    pub workload: Value,
    /// Named, reusable action definitions a step can reference by name.
    #[serde(default)]
    pub workbook: Map<String, Value>,
    pub workflow: Vec<Step>,
}

impl Playbook {
    pub fn find_step(&self, name: &str) -> Option<&Step> {
        self.workflow.iter().find(|s| s.name == name)
    }

    pub fn start_step(&self) -> Option<&Step> {
        self.find_step("start")
    }
}

// ---------------------------------------------------------------------------
// Step
// ---------------------------------------------------------------------------

/// A node in the workflow graph (spec §3 "Step").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub name: String,
    /// http|python|postgres|duckdb|secrets|workbook|playbook|iterator|
    /// start|end, or absent = router. Kept as a raw tag (rather than a
    /// closed enum) since concrete executors are out of scope and new
    /// action types are a worker-side concern.
    #[serde(rename = "type", default)]
    pub action_type: Option<String>,
    #[serde(default)]
    pub retry: Option<retry::RetryPolicy>,
    #[serde(default)]
    pub sink: Option<SinkSpec>,
    #[serde(default, rename = "loop")]
    pub loop_spec: Option<LoopSpec>,
    #[serde(default)]
    pub next: Vec<NextEntry>,
    /// Action-specific configuration: everything not already a reserved
    /// key above (url, method, code, query, workbook ref, …).
    #[serde(flatten)]
    pub config: Map<String, Value>,
}

impl Step {
    /// A step is actionable iff it has a real action type; steps with no
    /// type or type ∈ {start, end, route} are routers (spec §4.5.3).
    pub fn is_actionable(&self) -> bool {
        match &self.action_type {
            None => false,
            Some(t) => !matches!(t.as_str(), "start" | "end" | "route"),
        }
    }

    pub fn is_iterator(&self) -> bool {
        self.loop_spec.is_some()
    }
}

// ---------------------------------------------------------------------------
// Sink
// ---------------------------------------------------------------------------

/// A secondary action executed after its owning scope completes
/// (spec §4.5.7).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SinkSpec {
    #[serde(rename = "type")]
    pub action_type: String,
    #[serde(flatten)]
    pub config: Map<String, Value>,
}

// ---------------------------------------------------------------------------
// Loop
// ---------------------------------------------------------------------------

/// Iteration mode: children run one at a time, or with bounded parallelism
/// (spec §4.5.5 "Async mode"/"Sequential mode").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LoopMode {
    #[default]
    Sequential,
    Async,
}

/// What happens to the owning step when one child iteration fails
/// (spec §8 scenario 5).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OnError {
    #[default]
    Stop,
    Continue,
}

/// Iteration descriptor attached to a step (spec §3 "optional loop
/// descriptor").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopSpec {
    /// Template expression (or literal JSON array) yielding the collection
    /// to iterate over.
    pub collection: String,
    /// Alias the current element is bound to in the rendering context,
    /// e.g. `city` (spec §4.3 "the current element alias").
    #[serde(rename = "as")]
    pub alias: String,
    #[serde(default)]
    pub mode: LoopMode,
    #[serde(default)]
    pub on_error: OnError,
    /// When set, each child is a fresh sub-playbook execution rather than
    /// an inline action run by a worker (spec §4.5.5 "Sub-playbook
    /// iterator").
    #[serde(default)]
    pub playbook: Option<PlaybookRef>,
}

// ---------------------------------------------------------------------------
// Transitions
// ---------------------------------------------------------------------------

/// One successor of a transition rule: a target step name plus an optional
/// override mapping (spec §3 "Transition rule").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransitionTarget {
    pub step: String,
    #[serde(default)]
    pub args: Option<Value>,
}

/// An entry of a step's `next` list (spec §3, §4.5.4).
///
/// `Else` (has an `else` key) is tried only when no prior entry in the same
/// `next` list matched; `When` entries are tried in order; `Unconditional`
/// entries (no `when`/`else` key at all) always match. Declared in this
/// match-priority order so untagged deserialization picks the right shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum NextEntry {
    Else {
        #[serde(rename = "else")]
        else_: Vec<TransitionTarget>,
    },
    When {
        when: String,
        #[serde(default)]
        then: Vec<TransitionTarget>,
    },
    Unconditional {
        then: Vec<TransitionTarget>,
    },
}

// ---------------------------------------------------------------------------
// Catalog reference
// ---------------------------------------------------------------------------

/// How a playbook is looked up: explicit catalog id, or (path, version),
/// or path alone defaulting to "latest" (spec §6.1).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PlaybookRef {
    #[serde(default)]
    pub catalog_id: Option<i64>,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
}

/// Identity of the parent execution/step/event when this execution was
/// spawned by another one (spec §3 "Execution").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParentRef {
    pub parent_execution_id: i64,
    pub parent_step: Option<String>,
    pub parent_event_id: i64,
    /// Set when the parent is itself an iterator step, so the completion
    /// this spawns can be folded back under the iterator's usual
    /// `{execution_id}-{step}-iter-{index}` node id rather than a step-level
    /// one (spec §4.5.5).
    pub loop_index: Option<usize>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn untagged_next_entry_distinguishes_else_when_and_unconditional() {
        let json = serde_json::json!([
            { "when": "{{ x > 0 }}", "then": [{ "step": "pos" }] },
            { "else": [{ "step": "neg" }] },
        ]);
        let entries: Vec<NextEntry> = serde_json::from_value(json).unwrap();
        assert!(matches!(entries[0], NextEntry::When { .. }));
        assert!(matches!(entries[1], NextEntry::Else { .. }));
    }

    #[test]
    fn step_without_type_is_a_router() {
        let step: Step = serde_json::from_value(serde_json::json!({ "name": "start" })).unwrap();
        assert!(!step.is_actionable());
    }

    #[test]
    fn start_step_with_real_type_is_actionable() {
        let step: Step =
            serde_json::from_value(serde_json::json!({ "name": "start", "type": "python" }))
                .unwrap();
        assert!(step.is_actionable());
    }

    #[test]
    fn route_typed_step_is_a_router() {
        let step: Step =
            serde_json::from_value(serde_json::json!({ "name": "mid", "type": "route" })).unwrap();
        assert!(!step.is_actionable());
    }
}
