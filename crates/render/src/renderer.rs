//! Template/expression rendering (spec §4.3 "Rendering rules").

use minijinja::value::Value as MjValue;
use minijinja::{Environment, ErrorKind, UndefinedBehavior};
use serde_json::Value;

use crate::error::RenderError;
use crate::policy::UndefinedPolicy;

fn env_for(policy: UndefinedPolicy) -> Environment<'static> {
    let mut env = Environment::new();
    let behavior = match policy {
        UndefinedPolicy::Strict => UndefinedBehavior::Strict,
        UndefinedPolicy::Lenient => UndefinedBehavior::Lenient,
        // KeepLiteral renders strictly and falls back to the original text
        // on an undefined-variable error; see render_leaf below.
        UndefinedPolicy::KeepLiteral => UndefinedBehavior::Strict,
    };
    env.set_undefined_behavior(behavior);
    env
}

fn available_keys(ctx: &Value) -> Vec<String> {
    ctx.as_object()
        .map(|o| o.keys().cloned().collect())
        .unwrap_or_default()
}

fn looks_like_template(s: &str) -> bool {
    s.contains("{{") || s.contains("{%")
}

fn render_leaf(template: &str, ctx: &Value, policy: UndefinedPolicy) -> Result<String, RenderError> {
    if !looks_like_template(template) {
        return Ok(template.to_string());
    }

    let env = env_for(policy);
    let mj_ctx = MjValue::from_serialize(ctx);
    match env.render_str(template, mj_ctx) {
        Ok(rendered) => Ok(rendered),
        Err(err) if policy == UndefinedPolicy::KeepLiteral && err.kind() == ErrorKind::UndefinedError => {
            Ok(template.to_string())
        }
        Err(err) => Err(RenderError::TemplateRendering {
            template: template.to_string(),
            available_keys: available_keys(ctx),
            source: err,
        }),
    }
}

/// Render every template string in a JSON tree, recursing into arrays and
/// objects. A `work` key switches its entire subtree to
/// [`UndefinedPolicy::Lenient`]; a `task` key switches its subtree to
/// [`UndefinedPolicy::KeepLiteral`] — both per spec §4.3's dual rendering
/// rule for the reserved `work`/`task` mapping keys. Every other key
/// inherits the ambient policy passed in.
pub fn render_tree(value: &Value, ctx: &Value, policy: UndefinedPolicy) -> Result<Value, RenderError> {
    match value {
        Value::String(s) => Ok(Value::String(render_leaf(s, ctx, policy)?)),
        Value::Array(items) => {
            let rendered = items
                .iter()
                .map(|item| render_tree(item, ctx, policy))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Value::Array(rendered))
        }
        Value::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (k, v) in map {
                let child_policy = match k.as_str() {
                    "work" => UndefinedPolicy::Lenient,
                    "task" => UndefinedPolicy::KeepLiteral,
                    _ => policy,
                };
                out.insert(k.clone(), render_tree(v, ctx, child_policy)?);
            }
            Ok(Value::Object(out))
        }
        other => Ok(other.clone()),
    }
}

/// Render a step's action configuration tree with the ambient default of
/// strict evaluation, honouring the `work`/`task` dual policy wherever
/// those keys occur.
pub fn render_step_inputs(value: &Value, ctx: &Value) -> Result<Value, RenderError> {
    render_tree(value, ctx, UndefinedPolicy::Strict)
}

/// If `s` parses as JSON after rendering, return the parsed value;
/// otherwise return the rendered string unchanged (spec §4.3 "Strings that
/// parse as JSON after rendering are returned as parsed values when the
/// caller opts in").
pub fn maybe_parse_json(rendered: &str) -> Value {
    serde_json::from_str(rendered).unwrap_or_else(|_| Value::String(rendered.to_string()))
}

/// Evaluate a boolean expression (a transition's `when`, a retry policy's
/// `retry_when`/`stop_when`) against a context, strictly.
pub fn eval_bool(expr: &str, ctx: &Value) -> Result<bool, RenderError> {
    Ok(eval_value(expr, ctx)?.is_true())
}

/// Evaluate an arbitrary expression (e.g. an iterator's `collection`) against
/// a context, strictly, returning the JSON value it produces.
pub fn eval_value(expr: &str, ctx: &Value) -> Result<MjValueWrapper, RenderError> {
    let env = env_for(UndefinedPolicy::Strict);
    let compiled = env
        .compile_expression(expr)
        .map_err(|source| RenderError::TemplateRendering {
            template: expr.to_string(),
            available_keys: available_keys(ctx),
            source,
        })?;
    let value = compiled
        .eval(MjValue::from_serialize(ctx))
        .map_err(|source| RenderError::TemplateRendering {
            template: expr.to_string(),
            available_keys: available_keys(ctx),
            source,
        })?;
    Ok(MjValueWrapper(value))
}

/// Thin wrapper so callers can convert a minijinja value back to
/// `serde_json::Value` with `.into_json()` without depending on minijinja
/// directly.
pub struct MjValueWrapper(MjValue);

impl MjValueWrapper {
    pub fn is_true(&self) -> bool {
        self.0.is_true()
    }

    pub fn into_json(self) -> Value {
        serde_json::to_value(&self.0).unwrap_or(Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn non_template_strings_pass_through() {
        let ctx = json!({});
        let out = render_tree(&json!("plain"), &ctx, UndefinedPolicy::Strict).unwrap();
        assert_eq!(out, json!("plain"));
    }

    #[test]
    fn substitutes_defined_variables() {
        let ctx = json!({"name": "world"});
        let out = render_tree(&json!("hello {{ name }}"), &ctx, UndefinedPolicy::Strict).unwrap();
        assert_eq!(out, json!("hello world"));
    }

    #[test]
    fn strict_undefined_is_an_error() {
        let ctx = json!({});
        let err = render_tree(&json!("{{ missing }}"), &ctx, UndefinedPolicy::Strict).unwrap_err();
        assert!(matches!(err, RenderError::TemplateRendering { .. }));
    }

    #[test]
    fn lenient_undefined_becomes_empty_string() {
        let ctx = json!({});
        let out = render_tree(&json!("x{{ missing }}y"), &ctx, UndefinedPolicy::Lenient).unwrap();
        assert_eq!(out, json!("xy"));
    }

    #[test]
    fn keep_literal_falls_back_to_original_text_on_undefined() {
        let ctx = json!({});
        let template = json!("{{ missing }}");
        let out = render_tree(&template, &ctx, UndefinedPolicy::KeepLiteral).unwrap();
        assert_eq!(out, template);
    }

    #[test]
    fn work_and_task_subtrees_use_their_own_policy() {
        let ctx = json!({"known": "value"});
        let tree = json!({
            "work": {"a": "{{ known }}", "b": "{{ missing }}"},
            "task": {"c": "{{ missing }}"},
        });
        let out = render_tree(&tree, &ctx, UndefinedPolicy::Strict).unwrap();
        assert_eq!(out["work"]["a"], json!("value"));
        assert_eq!(out["work"]["b"], json!(""));
        assert_eq!(out["task"]["c"], json!("{{ missing }}"));
    }

    #[test]
    fn eval_bool_evaluates_comparisons() {
        let ctx = json!({"x": 5});
        assert!(eval_bool("x > 0", &ctx).unwrap());
        assert!(!eval_bool("x < 0", &ctx).unwrap());
    }

    #[test]
    fn maybe_parse_json_parses_valid_json_strings() {
        assert_eq!(maybe_parse_json("42"), json!(42));
        assert_eq!(maybe_parse_json("{\"a\": 1}"), json!({"a": 1}));
        assert_eq!(maybe_parse_json("not json"), json!("not json"));
    }
}
