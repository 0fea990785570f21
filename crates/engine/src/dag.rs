//! DAG validation — run this before accepting a playbook into the catalog.
//!
//! Rules enforced:
//! 1. Step names must be unique within the workflow.
//! 2. Every `next` entry must target a step name that exists.
//! 3. The playbook must declare a `start` step.
//! 4. The transition graph must be acyclic (topological sort must succeed).
//!
//! Returns a topologically-sorted list of step names on success. Loop-back
//! edges used purely for per-iteration retries are not modelled here —
//! iteration is a runtime concept (spec §4.5.5), not a structural one.

use std::collections::{HashMap, HashSet, VecDeque};

use crate::{
    models::{NextEntry, Playbook},
    EngineError,
};

fn targets_of(entry: &NextEntry) -> &[crate::models::TransitionTarget] {
    match entry {
        NextEntry::Else { else_ } => else_,
        NextEntry::When { then, .. } => then,
        NextEntry::Unconditional { then } => then,
    }
}

/// Validate the playbook's DAG and return step names in topological order.
pub fn validate_dag(playbook: &Playbook) -> Result<Vec<String>, EngineError> {
    let mut seen_names: HashSet<&str> = HashSet::new();
    for step in &playbook.workflow {
        if !seen_names.insert(step.name.as_str()) {
            return Err(EngineError::DuplicateNodeId(step.name.clone()));
        }
    }

    if !seen_names.contains("start") {
        return Err(EngineError::MissingStartStep);
    }

    let step_set: HashSet<&str> = playbook.workflow.iter().map(|s| s.name.as_str()).collect();

    for step in &playbook.workflow {
        for entry in &step.next {
            for target in targets_of(entry) {
                if !step_set.contains(target.step.as_str()) {
                    return Err(EngineError::UnknownNodeReference {
                        node_id: target.step.clone(),
                        side: "next",
                    });
                }
            }
        }
    }

    let mut adjacency: HashMap<&str, Vec<&str>> = HashMap::new();
    let mut in_degree: HashMap<&str, usize> = HashMap::new();

    for step in &playbook.workflow {
        adjacency.entry(step.name.as_str()).or_default();
        in_degree.entry(step.name.as_str()).or_insert(0);
    }

    for step in &playbook.workflow {
        for entry in &step.next {
            for target in targets_of(entry) {
                adjacency
                    .entry(step.name.as_str())
                    .or_default()
                    .push(target.step.as_str());
                *in_degree.entry(target.step.as_str()).or_insert(0) += 1;
            }
        }
    }

    let mut queue: VecDeque<&str> = in_degree
        .iter()
        .filter(|(_, &d)| d == 0)
        .map(|(&id, _)| id)
        .collect();

    let mut sorted: Vec<String> = Vec::with_capacity(playbook.workflow.len());

    while let Some(name) = queue.pop_front() {
        sorted.push(name.to_owned());

        if let Some(neighbours) = adjacency.get(name) {
            for &neighbour in neighbours {
                let deg = in_degree.entry(neighbour).or_insert(0);
                *deg -= 1;
                if *deg == 0 {
                    queue.push_back(neighbour);
                }
            }
        }
    }

    if sorted.len() != playbook.workflow.len() {
        return Err(EngineError::CycleDetected);
    }

    Ok(sorted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{NextEntry, Playbook, Step, TransitionTarget};
    use serde_json::Map;

    fn make_step(name: &str, next: Vec<&str>) -> Step {
        Step {
            name: name.to_string(),
            action_type: Some("python".into()),
            retry: None,
            sink: None,
            loop_spec: None,
            next: if next.is_empty() {
                vec![]
            } else {
                vec![NextEntry::Unconditional {
                    then: next
                        .into_iter()
                        .map(|s| TransitionTarget {
                            step: s.to_string(),
                            args: None,
                        })
                        .collect(),
                }]
            },
            config: Map::new(),
        }
    }

    fn make_playbook(steps: Vec<Step>) -> Playbook {
        Playbook {
            metadata: serde_json::Value::Null,
            workload: serde_json::Value::Null,
            workbook: Map::new(),
            workflow: steps,
        }
    }

    #[test]
    fn valid_linear_dag_returns_sorted_order() {
        let playbook = make_playbook(vec![
            make_step("start", vec!["b"]),
            make_step("b", vec!["end"]),
            make_step("end", vec![]),
        ]);

        let sorted = validate_dag(&playbook).expect("should be valid");
        assert_eq!(sorted, vec!["start", "b", "end"]);
    }

    #[test]
    fn valid_diamond_dag() {
        let playbook = make_playbook(vec![
            make_step("start", vec!["b", "c"]),
            make_step("b", vec!["end"]),
            make_step("c", vec!["end"]),
            make_step("end", vec![]),
        ]);

        let sorted = validate_dag(&playbook).expect("should be valid");
        assert_eq!(sorted.first().unwrap(), "start");
        assert_eq!(sorted.last().unwrap(), "end");
        assert_eq!(sorted.len(), 4);
    }

    #[test]
    fn duplicate_step_name_is_rejected() {
        let playbook = make_playbook(vec![make_step("start", vec![]), make_step("start", vec![])]);
        assert!(matches!(
            validate_dag(&playbook),
            Err(EngineError::DuplicateNodeId(name)) if name == "start"
        ));
    }

    #[test]
    fn missing_start_step_is_rejected() {
        let playbook = make_playbook(vec![make_step("mid", vec![])]);
        assert!(matches!(validate_dag(&playbook), Err(EngineError::MissingStartStep)));
    }

    #[test]
    fn transition_to_missing_step_is_rejected() {
        let playbook = make_playbook(vec![make_step("start", vec!["ghost"])]);
        assert!(matches!(
            validate_dag(&playbook),
            Err(EngineError::UnknownNodeReference { node_id, .. }) if node_id == "ghost"
        ));
    }

    #[test]
    fn cycle_is_detected() {
        let playbook = make_playbook(vec![
            make_step("start", vec!["b"]),
            make_step("b", vec!["c"]),
            make_step("c", vec!["start"]),
        ]);
        assert!(matches!(validate_dag(&playbook), Err(EngineError::CycleDetected)));
    }

    #[test]
    fn single_step_no_transitions_is_valid() {
        let playbook = make_playbook(vec![make_step("start", vec![])]);
        let sorted = validate_dag(&playbook).expect("single step should be valid");
        assert_eq!(sorted, vec!["start"]);
    }
}
