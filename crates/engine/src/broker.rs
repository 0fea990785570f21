//! The broker (spec §4.5) — the stateless, event-driven orchestrator.
//!
//! Every public entry point folds the execution's event stream into a
//! [`WorkflowState`] and reacts to exactly one triggering event; the broker
//! holds no state of its own between calls beyond the database and the id
//! generator. Re-running `evaluate_execution` for an execution that has
//! already progressed past the triggering event is a no-op, by construction
//! of the idempotence checks below (spec §3 "Invariants").

use db::models::EventRow;
use db::repository::events::NewEvent;
use db::{DbPool, Snowflake};
use serde_json::{json, Value};

use crate::dag::validate_dag;
use crate::models::{LoopMode, LoopSpec, NextEntry, OnError, Playbook, PlaybookRef, Step, TransitionTarget};
use crate::state::{StepState, WorkflowState};
use crate::EngineError;

/// Identity of the parent execution/step/event when this execution was
/// spawned by another one — re-exported here for callers of [`Broker::submit`].
pub use crate::models::ParentRef;

pub struct Broker {
    pool: DbPool,
    ids: Snowflake,
}

impl Broker {
    pub fn new(pool: DbPool, ids: Snowflake) -> Self {
        Self { pool, ids }
    }

    /// The execution/event id generator this broker was constructed with —
    /// exposed so callers outside the broker (e.g. the event API) can mint
    /// ids for events they append directly.
    pub fn ids(&self) -> &Snowflake {
        &self.ids
    }

    /// The pool this broker was constructed with, for callers that need to
    /// issue their own queries alongside a broker evaluation.
    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    // -----------------------------------------------------------------
    // Entry points (spec §4.5.1)
    // -----------------------------------------------------------------

    /// Register a fresh execution and dispatch the first actionable step.
    pub async fn submit(
        &self,
        playbook_ref: &PlaybookRef,
        workload: Value,
        parent: Option<ParentRef>,
    ) -> Result<i64, EngineError> {
        let catalog_row = self.resolve_catalog(playbook_ref).await?;
        let playbook = parse_playbook(&catalog_row.content)?;
        validate_dag(&playbook)?;

        let execution_id = self.ids.next_id();
        db::repository::workload::insert(&self.pool, execution_id, workload.clone()).await?;

        db::repository::events::append(
            &self.pool,
            &self.ids,
            NewEvent {
                execution_id,
                catalog_id: catalog_row.id,
                parent_event_id: parent.as_ref().map(|p| p.parent_event_id),
                parent_execution_id: parent.as_ref().map(|p| p.parent_execution_id),
                parent_step: parent.as_ref().and_then(|p| p.parent_step.clone()),
                event_type: "execution_start".to_string(),
                status: "ok".to_string(),
                node_id: None,
                node_name: None,
                node_type: None,
                context: Some(workload),
                result: None,
                meta: parent
                    .as_ref()
                    .and_then(|p| p.loop_index)
                    .map(|i| json!({ "parent_loop_index": i })),
                worker_id: None,
                attempt: None,
            },
        )
        .await?;

        self.evaluate_execution(execution_id, "execution_start").await?;
        Ok(execution_id)
    }

    /// Re-evaluate an execution in reaction to the most recent event of
    /// `trigger_event_type`. Safe to call more than once for the same
    /// trigger; every handler below is idempotent against already-folded
    /// state.
    pub async fn evaluate_execution(
        &self,
        execution_id: i64,
        trigger_event_type: &str,
    ) -> Result<(), EngineError> {
        let events = db::repository::events::stream(&self.pool, execution_id).await?;
        let Some(state) = WorkflowState::from_events(&events) else {
            return Ok(());
        };
        if state.state.is_terminal() {
            return Ok(());
        }

        let playbook = self.load_playbook(state.catalog_id).await?;

        let trigger = events
            .iter()
            .rev()
            .find(|e| e.event_type == trigger_event_type);
        let Some(trigger) = trigger else {
            return Ok(());
        };

        match trigger_event_type {
            "execution_start" => self.dispatch(&playbook, &state, "start", None).await?,
            "action_completed" => self.on_action_completed(&playbook, &state, trigger).await?,
            "action_error" => self.on_action_error(&playbook, &state, trigger).await?,
            _ => {}
        }
        Ok(())
    }

    /// Return expired leases to `queued`. Reclaiming a lease does not by
    /// itself change any step's folded state — it only makes the task
    /// visible to another `lease()` call — so no evaluation is triggered.
    pub async fn reclaim_and_evaluate(&self) -> Result<usize, EngineError> {
        let rows = queue::reclaim(&self.pool).await?;
        Ok(rows.len())
    }

    // -----------------------------------------------------------------
    // Catalog resolution
    // -----------------------------------------------------------------

    async fn resolve_catalog(&self, r: &PlaybookRef) -> Result<db::models::CatalogRow, EngineError> {
        if let Some(id) = r.catalog_id {
            return Ok(db::repository::catalog::get_by_id(&self.pool, id).await?);
        }
        let path = r.path.as_deref().ok_or_else(|| {
            EngineError::InvariantViolation("playbook reference needs catalog_id or path".into())
        })?;
        match &r.version {
            Some(v) => Ok(db::repository::catalog::get_by_path_version(&self.pool, path, v).await?),
            None => Ok(db::repository::catalog::get_latest(&self.pool, path).await?),
        }
    }

    async fn load_playbook(&self, catalog_id: i64) -> Result<Playbook, EngineError> {
        let row = db::repository::catalog::get_by_id(&self.pool, catalog_id).await?;
        parse_playbook(&row.content)
    }

    // -----------------------------------------------------------------
    // Dispatch / transition evaluation (spec §4.5.3, §4.5.4)
    // -----------------------------------------------------------------

    /// Evaluate `from_step`'s `next` list through router chains down to
    /// every actionable step reached, carrying `args` overrides along the
    /// way (spec §4.5.3/§4.5.4), and enqueue each one. With no actionable
    /// successor, finalises the execution if nothing else is still running.
    ///
    /// `from_step == "start"` gets one special case: when `start` itself
    /// carries a real action type (spec's "start step with a real type is
    /// actionable" shape) it is dispatched directly rather than through its
    /// `next`, since step-completion dispatch (the general case here) will
    /// walk `start`'s `next` once the worker reports it done.
    async fn dispatch(
        &self,
        playbook: &Playbook,
        state: &WorkflowState,
        from_step: &str,
        extra_args: Option<Value>,
    ) -> Result<(), EngineError> {
        let step = playbook.find_step(from_step).ok_or_else(|| EngineError::UnknownNodeReference {
            node_id: from_step.to_string(),
            side: "dispatch",
        })?;

        if from_step == "start" && step.is_actionable() {
            return self.enqueue_step(playbook, state, "start", extra_args).await;
        }

        let ctx = render::build_context(&self.pool, state.execution_id, None, None).await?;
        let initial: Vec<(String, Option<Value>)> = evaluate_next(&step.next, &ctx)?
            .into_iter()
            .map(|t| (t.step, merge_args(extra_args.clone(), t.args)))
            .collect();

        let targets = self.resolve_actionable(playbook, &ctx, initial)?;
        if targets.is_empty() {
            self.finalize_if_done(playbook, state).await?;
            return Ok(());
        }
        for (step_name, args) in targets {
            self.enqueue_step(playbook, state, &step_name, args).await?;
        }
        Ok(())
    }

    /// Iterative worklist over router chains: each item is a target reached
    /// via some `next` entry; routers get expanded through their own
    /// `next`, actionable steps are collected as leaves. Iterative (not
    /// recursive) to sidestep `async fn` recursion.
    fn resolve_actionable(
        &self,
        playbook: &Playbook,
        ctx: &Value,
        initial: Vec<(String, Option<Value>)>,
    ) -> Result<Vec<(String, Option<Value>)>, EngineError> {
        let mut worklist = initial;
        let mut out = Vec::new();

        while let Some((name, args)) = worklist.pop() {
            let step = playbook.find_step(&name).ok_or_else(|| EngineError::UnknownNodeReference {
                node_id: name.clone(),
                side: "dispatch",
            })?;

            if step.is_actionable() {
                out.push((name, args));
                continue;
            }

            for target in evaluate_next(&step.next, ctx)? {
                worklist.push((target.step.clone(), merge_args(args.clone(), target.args.clone())));
            }
        }

        Ok(out)
    }

    async fn enqueue_step(
        &self,
        playbook: &Playbook,
        state: &WorkflowState,
        step_name: &str,
        args: Option<Value>,
    ) -> Result<(), EngineError> {
        let step = playbook.find_step(step_name).ok_or_else(|| EngineError::UnknownNodeReference {
            node_id: step_name.to_string(),
            side: "enqueue",
        })?;

        if db::repository::events::has_node_event(&self.pool, state.execution_id, step_name, "step_started")
            .await?
        {
            return Ok(());
        }

        self.append_node_event(
            state.execution_id,
            state.catalog_id,
            "step_started",
            None,
            Some(step_name.to_string()),
            None,
            None,
            None,
        )
        .await?;

        if let Some(loop_spec) = step.loop_spec.clone() {
            self.start_iteration(playbook, state, step, &loop_spec, args).await
        } else {
            let ctx = render::build_context(&self.pool, state.execution_id, None, args.as_ref()).await?;
            let Some(rendered) = self
                .render_with_retry(playbook, state, step_name, &Value::Object(step.config.clone()), &ctx)
                .await?
            else {
                return Ok(());
            };
            let node_id = step_node_id(state.execution_id, step_name);
            let payload = encode_payload(&rendered);
            queue::enqueue(
                &self.pool,
                &self.ids,
                queue::NewTask::new(state.execution_id, state.catalog_id, node_id, step_name, payload, ctx),
            )
            .await?;
            Ok(())
        }
    }

    /// Render a step's inputs, applying its retry policy (spec §4.4) to
    /// rendering failures the same way action failures are retried —
    /// spec.md's failure semantics treat a template error as "surfaces as
    /// `action_error` on the task whose inputs couldn't be rendered", not as
    /// a class of its own. Returns `Ok(None)` once the step has been failed
    /// outright and the caller should simply stop (no task to enqueue).
    async fn render_with_retry(
        &self,
        playbook: &Playbook,
        state: &WorkflowState,
        step_name: &str,
        config: &Value,
        ctx: &Value,
    ) -> Result<Option<Value>, EngineError> {
        let step = playbook.find_step(step_name).ok_or_else(|| EngineError::UnknownNodeReference {
            node_id: step_name.to_string(),
            side: "render",
        })?;
        let policy = step.retry.clone().unwrap_or_default();
        let mut attempts: u32 = 0;

        loop {
            match render::render_step_inputs(config, ctx) {
                Ok(rendered) => return Ok(Some(rendered)),
                Err(err) => {
                    render::log_failure(&self.pool, state.execution_id, Some(step_name), &err)
                        .await
                        .ok();
                    self.append_node_event(
                        state.execution_id,
                        state.catalog_id,
                        "action_error",
                        None,
                        Some(step_name.to_string()),
                        None,
                        Some(json!({ "error": err.to_string() })),
                        None,
                    )
                    .await?;

                    attempts += 1;
                    let retry_ctx = json!({
                        "error": err.to_string(),
                        "attempt": attempts,
                        "execution_id": state.execution_id,
                        "node_id": step_name,
                    });
                    let outcome = retry::evaluate_failure(&policy, &retry_ctx, attempts)?;

                    if !outcome.should_retry {
                        self.append_node_event(
                            state.execution_id,
                            state.catalog_id,
                            "step_failed",
                            None,
                            Some(step_name.to_string()),
                            None,
                            Some(json!({ "error": err.to_string() })),
                            None,
                        )
                        .await?;
                        let refreshed = self.reload(state.execution_id).await?;
                        self.finalize_if_done(playbook, &refreshed).await?;
                        return Ok(None);
                    }

                    tokio::time::sleep(std::time::Duration::from_secs_f64(outcome.delay_seconds)).await;
                }
            }
        }
    }

    // -----------------------------------------------------------------
    // Step completion / error handling (spec §4.5.2)
    // -----------------------------------------------------------------

    async fn on_action_completed(
        &self,
        playbook: &Playbook,
        state: &WorkflowState,
        trigger: &EventRow,
    ) -> Result<(), EngineError> {
        let Some(step_name) = trigger.node_name.clone() else {
            return Ok(());
        };

        if let Some(owner) = step_name.strip_suffix("-sink") {
            return self.on_sink_completed(playbook, state, trigger, owner).await;
        }

        if is_iteration_node(trigger.node_id.as_deref()) {
            return self.on_iteration_completed(playbook, state, trigger, &step_name).await;
        }

        if state.is_step_done(&step_name) {
            return Ok(());
        }

        self.append_node_event(
            state.execution_id,
            state.catalog_id,
            "step_completed",
            None,
            Some(step_name.clone()),
            None,
            trigger.result.clone(),
            None,
        )
        .await?;

        let refreshed = self.reload(state.execution_id).await?;
        if self.run_sink_if_any(playbook, &refreshed, &step_name).await? {
            // Sink enqueued (or already failed the step outright); the
            // transition waits for its own `action_completed`/`action_error`.
            return Ok(());
        }

        self.dispatch(playbook, &refreshed, &step_name, None).await
    }

    async fn on_action_error(
        &self,
        playbook: &Playbook,
        state: &WorkflowState,
        trigger: &EventRow,
    ) -> Result<(), EngineError> {
        let Some(step_name) = trigger.node_name.clone() else {
            return Ok(());
        };

        if let Some(owner) = step_name.strip_suffix("-sink") {
            return self.on_sink_failed(playbook, state, trigger, owner).await;
        }

        if is_iteration_node(trigger.node_id.as_deref()) {
            return self.on_iteration_failed(playbook, state, trigger, &step_name).await;
        }

        let step = playbook.find_step(&step_name).ok_or_else(|| EngineError::UnknownNodeReference {
            node_id: step_name.clone(),
            side: "error",
        })?;

        let queue_id = trigger
            .meta
            .as_ref()
            .and_then(|m| m.get("queue_id"))
            .and_then(|v| v.as_i64());
        let Some(queue_id) = queue_id else {
            return Err(EngineError::InvariantViolation(format!(
                "action_error for '{step_name}' carries no queue_id in meta"
            )));
        };

        let current = queue::get(&self.pool, queue_id).await?;
        let error_message = trigger
            .result
            .as_ref()
            .and_then(|r| r.get("error"))
            .and_then(|v| v.as_str())
            .unwrap_or("action error")
            .to_string();

        // Widen the context beyond `error`/`attempt` so `status_code`-keyed
        // `stop_when`/`retry_when` expressions (spec §4.4) can see whatever
        // the failing action's result payload carried.
        let mut retry_ctx = json!({
            "error": error_message,
            "attempt": current.attempts,
            "execution_id": state.execution_id,
            "node_id": step_name,
        });
        if let Some(result) = &trigger.result {
            if let (Some(map), Some(extra)) = (retry_ctx.as_object_mut(), result.as_object()) {
                for (k, v) in extra {
                    map.entry(k.clone()).or_insert_with(|| v.clone());
                }
            }
            retry_ctx["result"] = result.clone();
        }
        let policy = step.retry.clone().unwrap_or_default();
        let outcome = retry::evaluate_failure(&policy, &retry_ctx, current.attempts as u32)?;

        let decision = if outcome.should_retry {
            queue::RetryDecision::Retry {
                delay_seconds: outcome.delay_seconds,
            }
        } else {
            queue::RetryDecision::Dead
        };
        let worker_id = trigger.worker_id.clone().unwrap_or_default();
        queue::fail(&self.pool, queue_id, &worker_id, &error_message, decision).await?;

        if !outcome.should_retry {
            self.append_node_event(
                state.execution_id,
                state.catalog_id,
                "step_failed",
                None,
                Some(step_name.clone()),
                None,
                Some(json!({ "error": error_message })),
                None,
            )
            .await?;
            let refreshed = self.reload(state.execution_id).await?;
            self.finalize_if_done(playbook, &refreshed).await?;
        }
        Ok(())
    }

    // -----------------------------------------------------------------
    // Iteration (spec §4.5.5)
    // -----------------------------------------------------------------

    async fn start_iteration(
        &self,
        playbook: &Playbook,
        state: &WorkflowState,
        step: &Step,
        loop_spec: &LoopSpec,
        args: Option<Value>,
    ) -> Result<(), EngineError> {
        let ctx = render::build_context(&self.pool, state.execution_id, None, args.as_ref()).await?;
        let items = render::eval_value(&loop_spec.collection, &ctx)?
            .into_json()
            .as_array()
            .cloned()
            .unwrap_or_default();

        self.append_node_event(
            state.execution_id,
            state.catalog_id,
            "loop_started",
            None,
            Some(step.name.clone()),
            None,
            None,
            Some(json!({ "expected_count": items.len() })),
        )
        .await?;

        if items.is_empty() {
            let refreshed = self.reload(state.execution_id).await?;
            return self.finish_loop(playbook, &refreshed, step).await;
        }

        match loop_spec.mode {
            LoopMode::Async => {
                for i in 0..items.len() {
                    self.enqueue_iteration(playbook, state, step, loop_spec, i).await?;
                }
            }
            LoopMode::Sequential => {
                self.enqueue_iteration(playbook, state, step, loop_spec, 0).await?;
            }
        }
        Ok(())
    }

    async fn enqueue_iteration(
        &self,
        playbook: &Playbook,
        state: &WorkflowState,
        step: &Step,
        loop_spec: &LoopSpec,
        index: usize,
    ) -> Result<(), EngineError> {
        let base_ctx = render::build_context(&self.pool, state.execution_id, None, None).await?;
        let items = render::eval_value(&loop_spec.collection, &base_ctx)?
            .into_json()
            .as_array()
            .cloned()
            .unwrap_or_default();
        let Some(element) = items.get(index).cloned() else {
            let refreshed = self.reload(state.execution_id).await?;
            return self.finish_loop(playbook, &refreshed, step).await;
        };

        let scope = render::IterationScope {
            alias: loop_spec.alias.clone(),
            element,
            this: json!({ "node": step.name }),
            loop_index: index,
            loop_count: items.len(),
        };

        if let Some(pb_ref) = &loop_spec.playbook {
            let iter_ctx = render::build_context(&self.pool, state.execution_id, Some(&scope), None).await?;
            let loop_started_id = self
                .latest_node_event_id(state.execution_id, &step.name, "loop_started")
                .await?;
            let parent = ParentRef {
                parent_execution_id: state.execution_id,
                parent_step: Some(step.name.clone()),
                parent_event_id: loop_started_id.unwrap_or(0),
                loop_index: Some(index),
            };
            // `submit` can reach back here for a nested sub-playbook
            // iterator; box it to avoid an unbounded async recursion cycle
            // with `evaluate_execution`/`dispatch`/`enqueue_step`.
            Box::pin(self.submit(pb_ref, iter_ctx, Some(parent))).await?;
        } else {
            let iter_ctx = render::build_context(&self.pool, state.execution_id, Some(&scope), None).await?;
            match render::render_step_inputs(&Value::Object(step.config.clone()), &iter_ctx) {
                Ok(rendered) => {
                    let node_id = iter_node_id(state.execution_id, &step.name, index);
                    let payload = encode_payload(&rendered);
                    queue::enqueue(
                        &self.pool,
                        &self.ids,
                        queue::NewTask::new(state.execution_id, state.catalog_id, node_id, step.name.clone(), payload, iter_ctx),
                    )
                    .await?;
                }
                Err(err) => {
                    self.fail_iteration_render(playbook, state, step, index, err).await?;
                }
            }
        }
        Ok(())
    }

    /// Render failure for a single iteration item (spec.md's "surfaces as
    /// `action_error`" rule applies per-item too). Individual iteration
    /// items have no retry of their own today — same as a worker-reported
    /// iteration failure, it is recorded and handed to the loop's
    /// `on_error` policy (continue to the next index, or stop the loop).
    async fn fail_iteration_render(
        &self,
        playbook: &Playbook,
        state: &WorkflowState,
        step: &Step,
        index: usize,
        err: render::RenderError,
    ) -> Result<(), EngineError> {
        render::log_failure(&self.pool, state.execution_id, Some(&step.name), &err)
            .await
            .ok();

        let trigger = self
            .append_node_event(
                state.execution_id,
                state.catalog_id,
                "action_error",
                Some(iter_node_id(state.execution_id, &step.name, index)),
                Some(step.name.clone()),
                None,
                Some(json!({ "error": err.to_string() })),
                Some(json!({ "loop_index": index })),
            )
            .await?;

        self.on_iteration_failed(playbook, state, &trigger, &step.name).await
    }

    async fn on_iteration_completed(
        &self,
        playbook: &Playbook,
        state: &WorkflowState,
        trigger: &EventRow,
        step_name: &str,
    ) -> Result<(), EngineError> {
        let index = iteration_index(trigger);
        if state
            .steps
            .get(step_name)
            .map(|s| s.iteration_results.contains_key(&index))
            .unwrap_or(false)
        {
            return Ok(());
        }

        self.append_node_event(
            state.execution_id,
            state.catalog_id,
            "iteration_completed",
            None,
            Some(step_name.to_string()),
            None,
            trigger.result.clone(),
            Some(json!({ "loop_index": index })),
        )
        .await?;
        self.advance_iteration(playbook, state, step_name).await
    }

    async fn on_iteration_failed(
        &self,
        playbook: &Playbook,
        state: &WorkflowState,
        trigger: &EventRow,
        step_name: &str,
    ) -> Result<(), EngineError> {
        let step = playbook.find_step(step_name).ok_or_else(|| EngineError::UnknownNodeReference {
            node_id: step_name.to_string(),
            side: "iteration",
        })?;
        let loop_spec = step
            .loop_spec
            .clone()
            .ok_or_else(|| EngineError::InvariantViolation(format!("'{step_name}' has no loop spec")))?;
        let index = iteration_index(trigger);

        self.append_node_event(
            state.execution_id,
            state.catalog_id,
            "iteration_failed",
            None,
            Some(step_name.to_string()),
            None,
            trigger.result.clone(),
            Some(json!({ "loop_index": index })),
        )
        .await?;

        if loop_spec.on_error == OnError::Stop {
            self.append_node_event(
                state.execution_id,
                state.catalog_id,
                "step_failed",
                None,
                Some(step_name.to_string()),
                None,
                trigger.result.clone(),
                None,
            )
            .await?;
            let refreshed = self.reload(state.execution_id).await?;
            self.finalize_if_done(playbook, &refreshed).await?;
            return Ok(());
        }

        self.advance_iteration(playbook, state, step_name).await
    }

    /// Common continuation logic after an iteration completes or fails with
    /// `on_error: continue`: enqueue the next index (sequential) or check
    /// whether every iteration has now reported in (loop_completed).
    async fn advance_iteration(
        &self,
        playbook: &Playbook,
        state: &WorkflowState,
        step_name: &str,
    ) -> Result<(), EngineError> {
        let refreshed = self.reload(state.execution_id).await?;
        let step = playbook.find_step(step_name).ok_or_else(|| EngineError::UnknownNodeReference {
            node_id: step_name.to_string(),
            side: "iteration",
        })?;
        let loop_spec = step
            .loop_spec
            .clone()
            .ok_or_else(|| EngineError::InvariantViolation(format!("'{step_name}' has no loop spec")))?;

        let info = refreshed.steps.get(step_name);
        let expected = info.and_then(|i| i.expected_count).unwrap_or(0);
        let done = info.map(|i| i.completed_count + i.failed_count).unwrap_or(0);

        if done >= expected {
            return self.finish_loop(playbook, &refreshed, step).await;
        }
        if loop_spec.mode == LoopMode::Sequential {
            self.enqueue_iteration(playbook, &refreshed, step, &loop_spec, done).await?;
        }
        Ok(())
    }

    async fn finish_loop(&self, playbook: &Playbook, state: &WorkflowState, step: &Step) -> Result<(), EngineError> {
        if db::repository::events::has_node_event(&self.pool, state.execution_id, &step.name, "loop_completed")
            .await?
        {
            return Ok(());
        }

        let info = state.steps.get(&step.name);
        let items: Vec<Value> = info
            .map(|i| i.iteration_results.values().cloned().collect())
            .unwrap_or_default();
        let failed_count = info.map(|i| i.failed_count).unwrap_or(0);
        let result = json!({ "items": items, "stats": { "completed": items.len(), "failed": failed_count } });

        self.append_node_event(
            state.execution_id,
            state.catalog_id,
            "loop_completed",
            None,
            Some(step.name.clone()),
            None,
            Some(result.clone()),
            None,
        )
        .await?;

        // spec §8 Scenario 4's literal event sequence for an iterator step
        // is `loop_completed` followed by `step_completed` — state folding
        // already treats the two as equivalent, this is for external
        // consumers of the raw event stream.
        self.append_node_event(
            state.execution_id,
            state.catalog_id,
            "step_completed",
            None,
            Some(step.name.clone()),
            None,
            Some(result),
            None,
        )
        .await?;

        let refreshed = self.reload(state.execution_id).await?;
        if self.run_sink_if_any(playbook, &refreshed, &step.name).await? {
            return Ok(());
        }

        // A loop's successor can itself be an iterator step, which loops
        // back through `dispatch`/`enqueue_step`/`start_iteration` into
        // this same function; box to avoid an unbounded async recursion
        // cycle.
        Box::pin(self.dispatch(playbook, &refreshed, &step.name, None)).await
    }

    // -----------------------------------------------------------------
    // Sinks (spec §4.5.7)
    // -----------------------------------------------------------------

    /// Runs a step's (or loop's) sink if it has one (spec §4.5.7). Returns
    /// `true` when the caller must stop and wait — either a sink task was
    /// enqueued (its own `action_completed`/`action_error` drives the rest)
    /// or the sink failed to render and already failed the owning step
    /// outright. Returns `false` when there is no sink, so the caller should
    /// dispatch the step's transitions immediately.
    async fn run_sink_if_any(&self, playbook: &Playbook, state: &WorkflowState, step_name: &str) -> Result<bool, EngineError> {
        let step = playbook.find_step(step_name).ok_or_else(|| EngineError::UnknownNodeReference {
            node_id: step_name.to_string(),
            side: "sink",
        })?;
        let Some(sink) = &step.sink else {
            return Ok(false);
        };

        let sink_name = format!("{step_name}-sink");
        if db::repository::events::has_node_event(&self.pool, state.execution_id, &sink_name, "save_started").await? {
            return Ok(true);
        }

        self.append_node_event(
            state.execution_id,
            state.catalog_id,
            "save_started",
            None,
            Some(sink_name.clone()),
            None,
            None,
            None,
        )
        .await?;

        let ctx = render::build_context(&self.pool, state.execution_id, None, None).await?;
        match render::render_step_inputs(&Value::Object(sink.config.clone()), &ctx) {
            Ok(rendered) => {
                let node_id = format!("{}-{}", state.execution_id, sink_name);
                let payload = encode_payload(&rendered);
                queue::enqueue(
                    &self.pool,
                    &self.ids,
                    queue::NewTask::new(state.execution_id, state.catalog_id, node_id, sink_name, payload, ctx),
                )
                .await?;
                Ok(true)
            }
            Err(err) => {
                render::log_failure(&self.pool, state.execution_id, Some(step_name), &err)
                    .await
                    .ok();
                self.append_node_event(
                    state.execution_id,
                    state.catalog_id,
                    "save_failed",
                    None,
                    Some(sink_name),
                    None,
                    Some(json!({ "error": err.to_string() })),
                    None,
                )
                .await?;
                // Sink failures fail the owning step (transactional
                // semantics, spec §7 "Propagation").
                self.append_node_event(
                    state.execution_id,
                    state.catalog_id,
                    "step_failed",
                    None,
                    Some(step_name.to_string()),
                    None,
                    Some(json!({ "error": err.to_string() })),
                    None,
                )
                .await?;
                let refreshed = self.reload(state.execution_id).await?;
                self.finalize_if_done(playbook, &refreshed).await?;
                Ok(true)
            }
        }
    }

    async fn on_sink_completed(
        &self,
        playbook: &Playbook,
        state: &WorkflowState,
        trigger: &EventRow,
        owner_step: &str,
    ) -> Result<(), EngineError> {
        let sink_name = format!("{owner_step}-sink");
        if db::repository::events::has_node_event(&self.pool, state.execution_id, &sink_name, "save_completed").await? {
            return Ok(());
        }

        self.append_node_event(
            state.execution_id,
            state.catalog_id,
            "save_completed",
            None,
            Some(sink_name),
            None,
            trigger.result.clone(),
            None,
        )
        .await?;

        let refreshed = self.reload(state.execution_id).await?;
        Box::pin(self.dispatch(playbook, &refreshed, owner_step, None)).await
    }

    async fn on_sink_failed(
        &self,
        playbook: &Playbook,
        state: &WorkflowState,
        trigger: &EventRow,
        owner_step: &str,
    ) -> Result<(), EngineError> {
        let sink_name = format!("{owner_step}-sink");
        if db::repository::events::has_node_event(&self.pool, state.execution_id, &sink_name, "save_error").await? {
            return Ok(());
        }

        let error_message = trigger
            .result
            .as_ref()
            .and_then(|r| r.get("error"))
            .and_then(|v| v.as_str())
            .unwrap_or("sink error")
            .to_string();

        self.append_node_event(
            state.execution_id,
            state.catalog_id,
            "save_error",
            None,
            Some(sink_name),
            None,
            Some(json!({ "error": error_message.clone() })),
            None,
        )
        .await?;

        // Sink failures fail the owning step outright (no retry of the
        // owning action; spec §7 "Sink failures fail the owning step").
        self.append_node_event(
            state.execution_id,
            state.catalog_id,
            "step_failed",
            None,
            Some(owner_step.to_string()),
            None,
            Some(json!({ "error": error_message })),
            None,
        )
        .await?;

        let refreshed = self.reload(state.execution_id).await?;
        self.finalize_if_done(playbook, &refreshed).await
    }

    // -----------------------------------------------------------------
    // Finalisation (spec §4.5.6)
    // -----------------------------------------------------------------

    async fn finalize_if_done(&self, _playbook: &Playbook, state: &WorkflowState) -> Result<(), EngineError> {
        if db::repository::events::has_event_type(&self.pool, state.execution_id, "execution_complete").await?
            || db::repository::events::has_event_type(&self.pool, state.execution_id, "execution_failed").await?
        {
            return Ok(());
        }
        if state.has_running_steps() {
            return Ok(());
        }

        let any_failed = state.steps.values().any(|s| s.state == StepState::Failed);
        let event_type = if any_failed { "execution_failed" } else { "execution_complete" };

        let result: Value = Value::Object(
            state
                .steps
                .iter()
                .filter_map(|(k, v)| v.result.clone().map(|r| (k.clone(), r)))
                .collect(),
        );

        self.append_node_event(
            state.execution_id,
            state.catalog_id,
            event_type,
            None,
            None,
            None,
            Some(result),
            None,
        )
        .await?;

        if let Some(parent_execution_id) = state.parent_execution_id {
            self.propagate_to_parent(state, parent_execution_id, event_type).await?;
        }
        Ok(())
    }

    async fn propagate_to_parent(
        &self,
        state: &WorkflowState,
        parent_execution_id: i64,
        event_type: &str,
    ) -> Result<(), EngineError> {
        let parent_events = db::repository::events::stream(&self.pool, parent_execution_id).await?;
        // `has_node_event` keys on node_name, which for a sub-playbook
        // iterator is shared across every index (the real step name) — so
        // dedupe on the child execution id recorded in `parent_execution_id`
        // instead, which is unique per spawned child.
        let already_propagated = parent_events
            .iter()
            .any(|e| e.event_type == "action_completed" && e.parent_execution_id == Some(state.execution_id));
        if already_propagated {
            return Ok(());
        }

        let Some(parent_state) = WorkflowState::from_events(&parent_events) else {
            return Ok(());
        };

        let result: Value = Value::Object(
            state
                .steps
                .iter()
                .filter_map(|(k, v)| v.result.clone().map(|r| (k.clone(), r)))
                .collect(),
        );

        // The real step name and node id this child execution stands in
        // for, using the same `{execution_id}-{step}-iter-{i}` convention as
        // inline iteration so `on_action_completed` routes this back through
        // `is_iteration_node`/`on_iteration_completed` instead of failing to
        // find a literal step named after the child.
        let (node_id, node_name) = match &state.parent_step {
            Some(step) => {
                let id = match state.parent_loop_index {
                    Some(index) => iter_node_id(parent_execution_id, step, index),
                    None => step_node_id(parent_execution_id, step),
                };
                (id, step.clone())
            }
            None => {
                let synthetic = format!("child-{}", state.execution_id);
                (synthetic.clone(), synthetic)
            }
        };

        db::repository::events::append(
            &self.pool,
            &self.ids,
            NewEvent {
                execution_id: parent_execution_id,
                catalog_id: parent_state.catalog_id,
                parent_event_id: state.parent_event_id,
                parent_execution_id: Some(state.execution_id),
                parent_step: state.parent_step.clone(),
                event_type: "action_completed".to_string(),
                status: if event_type == "execution_complete" { "ok" } else { "error" }.to_string(),
                node_id: Some(node_id),
                node_name: Some(node_name),
                node_type: None,
                context: None,
                result: Some(result),
                meta: None,
                worker_id: None,
                attempt: None,
            },
        )
        .await?;

        // `evaluate_execution` can reach `propagate_to_parent` again for a
        // grandparent execution; box this call so the two don't form an
        // unbounded async recursion in the compiler's eyes.
        Box::pin(self.evaluate_execution(parent_execution_id, "action_completed")).await
    }

    // -----------------------------------------------------------------
    // Small shared helpers
    // -----------------------------------------------------------------

    async fn reload(&self, execution_id: i64) -> Result<WorkflowState, EngineError> {
        let events = db::repository::events::stream(&self.pool, execution_id).await?;
        WorkflowState::from_events(&events)
            .ok_or_else(|| EngineError::InvariantViolation(format!("no events for execution {execution_id}")))
    }

    async fn latest_node_event_id(
        &self,
        execution_id: i64,
        node_name: &str,
        event_type: &str,
    ) -> Result<Option<i64>, EngineError> {
        let events = db::repository::events::by_types(&self.pool, execution_id, &[event_type]).await?;
        Ok(events
            .into_iter()
            .rev()
            .find(|e| e.node_name.as_deref() == Some(node_name))
            .map(|e| e.event_id))
    }

    #[allow(clippy::too_many_arguments)]
    async fn append_node_event(
        &self,
        execution_id: i64,
        catalog_id: i64,
        event_type: &str,
        node_id: Option<String>,
        node_name: Option<String>,
        parent_step: Option<String>,
        result: Option<Value>,
        meta: Option<Value>,
    ) -> Result<EventRow, EngineError> {
        Ok(db::repository::events::append(
            &self.pool,
            &self.ids,
            NewEvent {
                execution_id,
                catalog_id,
                parent_event_id: None,
                parent_execution_id: None,
                parent_step,
                event_type: event_type.to_string(),
                status: "ok".to_string(),
                node_id,
                node_name,
                node_type: None,
                context: None,
                result,
                meta,
                worker_id: None,
                attempt: None,
            },
        )
        .await?)
    }
}

// ---------------------------------------------------------------------------
// Free functions
// ---------------------------------------------------------------------------

/// Parse a catalog row's stored document into a [`Playbook`]. Exposed for
/// callers outside the broker that need to resolve a step's action type
/// against the same catalog content the broker itself dispatches from
/// (e.g. a worker deciding which executor handles a leased task).
pub fn parse_playbook(content: &Value) -> Result<Playbook, EngineError> {
    serde_json::from_value(content.clone())
        .map_err(|e| EngineError::InvariantViolation(format!("invalid playbook document: {e}")))
}

fn step_node_id(execution_id: i64, step_name: &str) -> String {
    format!("{execution_id}-{step_name}")
}

fn iter_node_id(execution_id: i64, step_name: &str, index: usize) -> String {
    format!("{execution_id}-{step_name}-iter-{index}")
}

fn is_iteration_node(node_id: Option<&str>) -> bool {
    node_id.map(|id| id.contains("-iter-")).unwrap_or(false)
}

fn iteration_index(event: &EventRow) -> usize {
    event
        .meta
        .as_ref()
        .and_then(|m| m.get("loop_index"))
        .and_then(|v| v.as_u64())
        .map(|n| n as usize)
        .or_else(|| {
            event
                .node_id
                .as_deref()
                .and_then(|id| id.rsplit("-iter-").next())
                .and_then(|s| s.parse().ok())
        })
        .unwrap_or(0)
}

fn encode_payload(value: &Value) -> String {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD.encode(value.to_string())
}

fn merge_args(base: Option<Value>, override_: Option<Value>) -> Option<Value> {
    match (base, override_) {
        (None, None) => None,
        (Some(b), None) => Some(b),
        (None, Some(o)) => Some(o),
        (Some(Value::Object(mut b)), Some(Value::Object(o))) => {
            for (k, v) in o {
                b.insert(k, v);
            }
            Some(Value::Object(b))
        }
        (_, Some(o)) => Some(o),
    }
}

/// First-match evaluation of a step's `next` list (spec §4.5.4): every
/// `when` whose condition is true, plus every unconditional entry,
/// contributes its targets (fan-out); `else` only contributes when nothing
/// else matched.
fn evaluate_next(next: &[NextEntry], ctx: &Value) -> Result<Vec<TransitionTarget>, EngineError> {
    let mut matched = Vec::new();
    let mut else_targets = Vec::new();

    for entry in next {
        match entry {
            NextEntry::When { when, then } => {
                if render::eval_bool(when, ctx)? {
                    matched.extend(then.iter().cloned());
                }
            }
            NextEntry::Unconditional { then } => matched.extend(then.iter().cloned()),
            NextEntry::Else { else_ } => else_targets.extend(else_.iter().cloned()),
        }
    }

    if matched.is_empty() {
        matched = else_targets;
    }
    Ok(matched)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn target(step: &str) -> TransitionTarget {
        TransitionTarget { step: step.to_string(), args: None }
    }

    fn event(node_id: Option<&str>, meta: Option<Value>) -> EventRow {
        EventRow {
            id: 1,
            event_id: 1,
            execution_id: 1,
            catalog_id: 1,
            parent_event_id: None,
            parent_execution_id: None,
            parent_step: None,
            event_type: "iteration_completed".to_string(),
            status: "ok".to_string(),
            node_id: node_id.map(str::to_string),
            node_name: None,
            node_type: None,
            context: None,
            result: None,
            meta,
            worker_id: None,
            attempt: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn merge_args_none_none_is_none() {
        assert_eq!(merge_args(None, None), None);
    }

    #[test]
    fn merge_args_override_wins_on_key_collision() {
        let base = Some(json!({"a": 1, "b": 2}));
        let over = Some(json!({"b": 3, "c": 4}));
        assert_eq!(merge_args(base, over), Some(json!({"a": 1, "b": 3, "c": 4})));
    }

    #[test]
    fn merge_args_non_object_override_replaces_outright() {
        let base = Some(json!({"a": 1}));
        let over = Some(json!("replacement"));
        assert_eq!(merge_args(base, over), Some(json!("replacement")));
    }

    #[test]
    fn merge_args_base_only() {
        assert_eq!(merge_args(Some(json!({"a": 1})), None), Some(json!({"a": 1})));
    }

    #[test]
    fn evaluate_next_when_true_matches_and_skips_else() {
        let next = vec![
            NextEntry::When { when: "x > 0".to_string(), then: vec![target("a")] },
            NextEntry::Else { else_: vec![target("fallback")] },
        ];
        let ctx = json!({"x": 5});
        let targets = evaluate_next(&next, &ctx).unwrap();
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].step, "a");
    }

    #[test]
    fn evaluate_next_falls_back_to_else_when_nothing_matches() {
        let next = vec![
            NextEntry::When { when: "x > 0".to_string(), then: vec![target("a")] },
            NextEntry::Else { else_: vec![target("fallback")] },
        ];
        let ctx = json!({"x": -1});
        let targets = evaluate_next(&next, &ctx).unwrap();
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].step, "fallback");
    }

    #[test]
    fn evaluate_next_fans_out_across_multiple_matching_whens() {
        let next = vec![
            NextEntry::When { when: "x > 0".to_string(), then: vec![target("a")] },
            NextEntry::When { when: "y > 0".to_string(), then: vec![target("b")] },
            NextEntry::Unconditional { then: vec![target("c")] },
        ];
        let ctx = json!({"x": 5, "y": 5});
        let targets = evaluate_next(&next, &ctx).unwrap();
        let names: Vec<&str> = targets.iter().map(|t| t.step.as_str()).collect();
        assert_eq!(names, vec!["a", "b", "c"]);
    }

    #[test]
    fn is_iteration_node_detects_iter_marker() {
        assert!(is_iteration_node(Some("42-fetch-iter-3")));
        assert!(!is_iteration_node(Some("42-fetch")));
        assert!(!is_iteration_node(None));
    }

    #[test]
    fn iteration_index_prefers_meta_loop_index() {
        let e = event(Some("42-fetch-iter-7"), Some(json!({"loop_index": 2})));
        assert_eq!(iteration_index(&e), 2);
    }

    #[test]
    fn iteration_index_falls_back_to_node_id_suffix() {
        let e = event(Some("42-fetch-iter-7"), None);
        assert_eq!(iteration_index(&e), 7);
    }

    #[test]
    fn iteration_index_defaults_to_zero() {
        let e = event(None, None);
        assert_eq!(iteration_index(&e), 0);
    }

    #[test]
    fn encode_payload_round_trips_through_base64() {
        use base64::Engine;
        let value = json!({"a": 1});
        let encoded = encode_payload(&value);
        let decoded = base64::engine::general_purpose::STANDARD.decode(encoded).unwrap();
        let parsed: Value = serde_json::from_slice(&decoded).unwrap();
        assert_eq!(parsed, value);
    }
}
