//! A dispatch table from action type tag to executor (spec §9
//! "Polymorphism over action types").

use std::collections::HashMap;
use std::sync::Arc;

use crate::ActionExecutor;

pub type ExecutorRegistry = HashMap<String, Arc<dyn ActionExecutor>>;

pub fn registry_with(entries: Vec<(&str, Arc<dyn ActionExecutor>)>) -> ExecutorRegistry {
    entries
        .into_iter()
        .map(|(tag, exec)| (tag.to_string(), exec))
        .collect()
}
