//! In-process flow engine on tokio
//!
//! Each runnable flow gets one runner task. The runner executes ready actions
//! one at a time in declaration order, applies each action's retry policy,
//! and settles the flow when every action succeeded, the flow was cancelled,
//! the flow timed out, or a failed action was not retried within the failure
//! grace window.

use crate::contract::{
    ActionRun, CustomFlowSpec, FlowEngine, FlowSnapshot, FlowStateReader, TemplateFlowSpec,
};
use crate::error::{EngineError, Result};
use crate::executor::{ActionContext, ActionOutcome, ExecutorRegistry};
use async_trait::async_trait;
use flowgate_core::{
    Action, ActionId, ActionIdSeq, ActionState, Flow, FlowId, FlowState, validate_graph,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, RwLock, watch};
use tokio::time::Instant;

const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

/// Tunables of the local engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineOptions {
    /// Default limit on a flow's `Executing` phase
    pub flow_timeout: Duration,
    /// How long a flow with a failed action waits for a retry before failing
    pub failure_grace: Duration,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            flow_timeout: Duration::from_secs(3600),
            failure_grace: Duration::from_secs(300),
        }
    }
}

struct FlowEntry {
    flow: Flow,
    runs: Vec<ActionRun>,
    timeout: Duration,
    failed_since: Option<Instant>,
    state_tx: watch::Sender<FlowState>,
    cancel_tx: watch::Sender<bool>,
    wake: Arc<Notify>,
}

impl FlowEntry {
    fn new(flow: Flow, timeout: Duration) -> Self {
        let runs = flow.actions.iter().map(ActionRun::pending).collect();
        let (state_tx, _) = watch::channel(flow.state);
        let (cancel_tx, _) = watch::channel(false);
        Self {
            flow,
            runs,
            timeout,
            failed_since: None,
            state_tx,
            cancel_tx,
            wake: Arc::new(Notify::new()),
        }
    }

    fn set_state(&mut self, target: FlowState) -> Result<()> {
        self.flow.transition(target)?;
        self.state_tx.send_replace(target);
        Ok(())
    }

    /// Publish the current state to waiters
    fn publish(&self) {
        self.state_tx.send_replace(self.flow.state);
    }

    /// First pending action, in declaration order, whose dependencies all succeeded
    fn next_ready(&self) -> Option<usize> {
        self.runs.iter().enumerate().find_map(|(i, run)| {
            let ready = run.state == ActionState::Pending
                && self.flow.actions[i].depends_on.iter().all(|dep| {
                    self.runs
                        .iter()
                        .any(|r| &r.action_id == dep && r.state == ActionState::Success)
                });
            ready.then_some(i)
        })
    }

    fn index_of(&self, action_id: &ActionId) -> Option<usize> {
        self.runs.iter().position(|r| &r.action_id == action_id)
    }
}

enum Step {
    Run(usize, Action),
    Done,
    Blocked(Instant),
}

struct EngineInner {
    flows: RwLock<HashMap<FlowId, FlowEntry>>,
    registry: ExecutorRegistry,
    options: EngineOptions,
}

/// Flow engine that runs flows as tokio tasks in this process
#[derive(Clone)]
pub struct LocalFlowEngine {
    inner: Arc<EngineInner>,
}

impl LocalFlowEngine {
    pub fn new(registry: ExecutorRegistry, options: EngineOptions) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                flows: RwLock::new(HashMap::new()),
                registry,
                options,
            }),
        }
    }

    pub fn registry(&self) -> &ExecutorRegistry {
        &self.inner.registry
    }

    pub fn options(&self) -> EngineOptions {
        self.inner.options
    }

    /// Number of flows known to the engine
    pub async fn flow_count(&self) -> usize {
        self.inner.flows.read().await.len()
    }

    fn check_kinds(&self, actions: &[Action]) -> Result<()> {
        for action in actions {
            if !self.inner.registry.contains(&action.kind) {
                return Err(EngineError::UnsupportedKind(action.kind.clone()));
            }
        }
        Ok(())
    }

    async fn insert(&self, flow: Flow, timeout: Duration) -> FlowId {
        let id = flow.id.clone();
        let entry = FlowEntry::new(flow, timeout);
        self.inner.flows.write().await.insert(id.clone(), entry);
        id
    }

    fn spawn_runner(&self, flow_id: FlowId) {
        let engine = self.clone();
        tokio::spawn(async move {
            if let Err(e) = engine.run_flow(&flow_id).await {
                tracing::error!(flow_id = %flow_id, error = %e, "flow runner stopped");
            }
        });
    }

    async fn run_flow(&self, flow_id: &FlowId) -> Result<()> {
        let (mut cancel_rx, wake, deadline) = {
            let mut flows = self.inner.flows.write().await;
            let entry = flows
                .get_mut(flow_id)
                .ok_or_else(|| EngineError::FlowNotFound(flow_id.clone()))?;
            entry.set_state(FlowState::Executing)?;
            (
                entry.cancel_tx.subscribe(),
                entry.wake.clone(),
                deadline_after(Instant::now(), entry.timeout),
            )
        };
        tracing::info!(flow_id = %flow_id, "flow executing");

        loop {
            match self.next_step(flow_id).await? {
                Step::Done => return self.settle(flow_id, FlowState::Success).await,
                Step::Run(index, action) => {
                    tokio::select! {
                        result = self.run_action(flow_id, index, &action) => result?,
                        _ = cancelled(&mut cancel_rx) => {
                            return self.settle(flow_id, FlowState::Cancelled).await;
                        }
                        _ = tokio::time::sleep_until(deadline) => {
                            return self.settle(flow_id, FlowState::TimedOut).await;
                        }
                    }
                }
                Step::Blocked(grace_end) => {
                    let timed_out = deadline <= grace_end;
                    tokio::select! {
                        _ = wake.notified() => {}
                        _ = cancelled(&mut cancel_rx) => {
                            return self.settle(flow_id, FlowState::Cancelled).await;
                        }
                        _ = tokio::time::sleep_until(deadline.min(grace_end)) => {
                            let state = if timed_out {
                                FlowState::TimedOut
                            } else {
                                FlowState::Failed
                            };
                            return self.settle(flow_id, state).await;
                        }
                    }
                }
            }
        }
    }

    async fn next_step(&self, flow_id: &FlowId) -> Result<Step> {
        let flows = self.inner.flows.read().await;
        let entry = flows
            .get(flow_id)
            .ok_or_else(|| EngineError::FlowNotFound(flow_id.clone()))?;

        if let Some(index) = entry.next_ready() {
            return Ok(Step::Run(index, entry.flow.actions[index].clone()));
        }
        if entry.runs.iter().all(|r| r.state == ActionState::Success) {
            return Ok(Step::Done);
        }
        let since = entry.failed_since.unwrap_or_else(Instant::now);
        Ok(Step::Blocked(deadline_after(since, self.inner.options.failure_grace)))
    }

    async fn context(
        &self,
        flow_id: &FlowId,
        action: &Action,
        attempt: u32,
    ) -> Result<ActionContext> {
        let flows = self.inner.flows.read().await;
        let entry = flows
            .get(flow_id)
            .ok_or_else(|| EngineError::FlowNotFound(flow_id.clone()))?;
        Ok(ActionContext {
            flow_id: flow_id.clone(),
            action_id: action.id.clone(),
            kind: action.kind.clone(),
            attempt,
            share_data: entry.flow.share_data.clone(),
            flows: Arc::new(self.clone()),
        })
    }

    async fn update_run<F>(&self, flow_id: &FlowId, index: usize, f: F) -> Result<()>
    where
        F: FnOnce(&mut FlowEntry, usize),
    {
        let mut flows = self.inner.flows.write().await;
        let entry = flows
            .get_mut(flow_id)
            .ok_or_else(|| EngineError::FlowNotFound(flow_id.clone()))?;
        f(entry, index);
        Ok(())
    }

    /// Run one action through its retry policy
    async fn run_action(&self, flow_id: &FlowId, index: usize, action: &Action) -> Result<()> {
        let executor = self.inner.registry.resolve(&action.kind)?;
        let mut failures = 0u32;

        loop {
            let attempt = failures + 1;
            self.update_run(flow_id, index, |entry, i| {
                entry.runs[i].state = ActionState::Running;
                entry.runs[i].attempts += 1;
            })
            .await?;

            let ctx = self.context(flow_id, action, attempt).await?;
            tracing::debug!(
                flow_id = %flow_id,
                action_id = %action.id,
                kind = %action.kind,
                attempt,
                "running action"
            );

            match executor.execute(&ctx, &action.params).await {
                Ok(output) => {
                    self.update_run(flow_id, index, |entry, i| {
                        entry.runs[i].state = ActionState::Success;
                        entry.runs[i].output = Some(output.clone());
                    })
                    .await?;
                    executor
                        .on_settled(&ctx, &ActionOutcome::Succeeded(output))
                        .await;
                    return Ok(());
                }
                Err(e) => {
                    failures += 1;
                    let message = e.to_string();
                    if e.is_retryable() && action.retry.should_retry(failures) {
                        let delay = action.retry.backoff();
                        tracing::warn!(
                            flow_id = %flow_id,
                            action_id = %action.id,
                            attempt,
                            delay_ms = delay.as_millis() as u64,
                            error = %message,
                            "action attempt failed, retrying"
                        );
                        self.update_run(flow_id, index, |entry, i| {
                            entry.runs[i].last_error = Some(message);
                        })
                        .await?;
                        tokio::time::sleep(delay).await;
                        continue;
                    }

                    tracing::warn!(
                        flow_id = %flow_id,
                        action_id = %action.id,
                        attempt,
                        error = %message,
                        "action failed"
                    );
                    self.update_run(flow_id, index, |entry, i| {
                        entry.runs[i].state = ActionState::Failed;
                        entry.runs[i].last_error = Some(message);
                        entry.failed_since.get_or_insert_with(Instant::now);
                    })
                    .await?;
                    return Ok(());
                }
            }
        }
    }

    /// Move the flow to a terminal state and notify executors of final failures
    ///
    /// Waiters only observe the terminal state once every `on_settled` call
    /// has returned.
    async fn settle(&self, flow_id: &FlowId, state: FlowState) -> Result<()> {
        let failed = {
            let mut flows = self.inner.flows.write().await;
            let entry = flows
                .get_mut(flow_id)
                .ok_or_else(|| EngineError::FlowNotFound(flow_id.clone()))?;

            if state != FlowState::Success {
                for run in entry.runs.iter_mut() {
                    if matches!(run.state, ActionState::Pending | ActionState::Running) {
                        run.state = ActionState::Cancelled;
                    }
                }
            }
            entry.flow.transition(state)?;

            entry
                .flow
                .actions
                .iter()
                .zip(entry.runs.iter())
                .filter(|(_, run)| run.state == ActionState::Failed)
                .map(|(action, run)| {
                    (
                        action.clone(),
                        run.attempts,
                        run.last_error.clone().unwrap_or_default(),
                    )
                })
                .collect::<Vec<_>>()
        };
        tracing::info!(flow_id = %flow_id, state = %state, "flow settled");

        let notified = if state == FlowState::Failed {
            self.notify_failed(flow_id, failed).await
        } else {
            Ok(())
        };

        self.inner
            .flows
            .read()
            .await
            .get(flow_id)
            .ok_or_else(|| EngineError::FlowNotFound(flow_id.clone()))?
            .publish();
        notified
    }

    async fn notify_failed(
        &self,
        flow_id: &FlowId,
        failed: Vec<(Action, u32, String)>,
    ) -> Result<()> {
        for (action, attempts, error) in failed {
            let executor = self.inner.registry.resolve(&action.kind)?;
            let ctx = self.context(flow_id, &action, attempts).await?;
            executor
                .on_settled(&ctx, &ActionOutcome::Failed(error))
                .await;
        }
        Ok(())
    }

    async fn create(&self, flow: Flow, timeout: Option<Duration>) -> Result<FlowId> {
        let runnable = flow.state == FlowState::Pending;
        let name = flow.name.clone();
        let action_count = flow.actions.len();
        let timeout = timeout.unwrap_or(self.inner.options.flow_timeout);
        let id = self.insert(flow, timeout).await;
        tracing::debug!(
            flow_id = %id,
            name = %name,
            actions = action_count,
            runnable,
            "flow created"
        );
        if runnable {
            self.spawn_runner(id.clone());
        }
        Ok(id)
    }
}

/// Resolves once the cancel flag is raised; never resolves if the sender is gone
/// `start + after`, capped roughly 30 years out for durations too large to add
fn deadline_after(start: Instant, after: Duration) -> Instant {
    start.checked_add(after).unwrap_or_else(|| start + FAR_FUTURE)
}

async fn cancelled(rx: &mut watch::Receiver<bool>) {
    loop {
        let raised = *rx.borrow_and_update();
        if raised {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

#[async_trait]
impl FlowStateReader for LocalFlowEngine {
    async fn flow_state(&self, flow_id: &FlowId) -> Result<FlowState> {
        self.inner
            .flows
            .read()
            .await
            .get(flow_id)
            .map(|e| e.flow.state)
            .ok_or_else(|| EngineError::FlowNotFound(flow_id.clone()))
    }

    async fn wait_terminal(
        &self,
        flow_id: &FlowId,
        _poll_interval: Duration,
        max_wait: Duration,
    ) -> Result<FlowState> {
        let mut rx = self
            .inner
            .flows
            .read()
            .await
            .get(flow_id)
            .map(|e| e.state_tx.subscribe())
            .ok_or_else(|| EngineError::FlowNotFound(flow_id.clone()))?;

        let wait = async {
            loop {
                let state = *rx.borrow_and_update();
                if state.is_terminal() {
                    return Some(state);
                }
                if rx.changed().await.is_err() {
                    return None;
                }
            }
        };
        match tokio::time::timeout(max_wait, wait).await {
            Ok(Some(state)) => Ok(state),
            Ok(None) => Err(EngineError::FlowNotFound(flow_id.clone())),
            Err(_) => Err(EngineError::WaitTimeout(flow_id.clone())),
        }
    }
}

#[async_trait]
impl FlowEngine for LocalFlowEngine {
    fn name(&self) -> &str {
        "local"
    }

    async fn create_custom_flow(&self, spec: CustomFlowSpec) -> Result<FlowId> {
        validate_graph(&spec.actions)?;
        self.check_kinds(&spec.actions)?;

        let mut flow = Flow::new(spec.name, spec.actions, spec.share_data);
        if !spec.init_state {
            flow.transition(FlowState::Pending)?;
        }
        self.create(flow, spec.timeout).await
    }

    async fn create_template_flow(&self, spec: TemplateFlowSpec) -> Result<FlowId> {
        let (id, _) = ActionIdSeq::new().take();
        let action = Action::new(id, spec.kind)
            .with_params(spec.params)
            .with_retry(spec.retry);
        self.check_kinds(std::slice::from_ref(&action))?;

        let mut flow = Flow::new(spec.name, vec![action], spec.share_data);
        flow.transition(FlowState::Pending)?;
        self.create(flow, spec.timeout).await
    }

    async fn update_flow_state(
        &self,
        flow_id: &FlowId,
        source: FlowState,
        target: FlowState,
    ) -> Result<()> {
        if (source, target) != (FlowState::Init, FlowState::Pending) {
            return Err(EngineError::TransitionNotAllowed {
                from: source,
                to: target,
            });
        }
        {
            let mut flows = self.inner.flows.write().await;
            let entry = flows
                .get_mut(flow_id)
                .ok_or_else(|| EngineError::FlowNotFound(flow_id.clone()))?;
            if entry.flow.state != source {
                return Err(EngineError::StateMismatch {
                    flow_id: flow_id.clone(),
                    expected: source,
                    actual: entry.flow.state,
                });
            }
            entry.set_state(target)?;
        }
        tracing::debug!(flow_id = %flow_id, "flow armed");
        self.spawn_runner(flow_id.clone());
        Ok(())
    }

    async fn cancel_flow(&self, flow_id: &FlowId) -> Result<()> {
        let flows = self.inner.flows.read().await;
        let entry = flows
            .get(flow_id)
            .ok_or_else(|| EngineError::FlowNotFound(flow_id.clone()))?;
        if entry.flow.state != FlowState::Executing {
            return Err(EngineError::InvalidState {
                flow_id: flow_id.clone(),
                operation: "cancel",
                state: entry.flow.state,
            });
        }
        entry.cancel_tx.send_replace(true);
        tracing::info!(flow_id = %flow_id, "flow cancellation requested");
        Ok(())
    }

    async fn retry_action(&self, flow_id: &FlowId, action_id: &ActionId) -> Result<()> {
        let mut flows = self.inner.flows.write().await;
        let entry = flows
            .get_mut(flow_id)
            .ok_or_else(|| EngineError::FlowNotFound(flow_id.clone()))?;
        if entry.flow.state != FlowState::Executing {
            return Err(EngineError::InvalidState {
                flow_id: flow_id.clone(),
                operation: "retry",
                state: entry.flow.state,
            });
        }
        let index = entry
            .index_of(action_id)
            .ok_or_else(|| EngineError::ActionNotFound {
                flow_id: flow_id.clone(),
                action_id: action_id.clone(),
            })?;
        let state = entry.runs[index].state;
        if state != ActionState::Failed {
            return Err(EngineError::ActionNotRetryable {
                flow_id: flow_id.clone(),
                action_id: action_id.clone(),
                state: state.to_string(),
            });
        }

        entry.runs[index].state = ActionState::Pending;
        if !entry.runs.iter().any(|r| r.state == ActionState::Failed) {
            entry.failed_since = None;
        }
        entry.wake.notify_one();
        tracing::info!(flow_id = %flow_id, action_id = %action_id, "action retry requested");
        Ok(())
    }

    async fn clone_flow(&self, flow_id: &FlowId, memo: Option<String>) -> Result<FlowId> {
        let (source, timeout) = {
            let flows = self.inner.flows.read().await;
            let entry = flows
                .get(flow_id)
                .ok_or_else(|| EngineError::FlowNotFound(flow_id.clone()))?;
            if !entry.flow.state.is_cloneable() {
                return Err(EngineError::InvalidState {
                    flow_id: flow_id.clone(),
                    operation: "clone",
                    state: entry.flow.state,
                });
            }
            (entry.flow.clone(), entry.timeout)
        };

        let mut flow = Flow::new(source.name, source.actions, source.share_data);
        flow.memo = memo;
        flow.cloned_from = Some(flow_id.clone());
        let id = self.create(flow, Some(timeout)).await?;
        tracing::info!(flow_id = %id, source_flow_id = %flow_id, "flow cloned");
        Ok(id)
    }

    async fn get_flow(&self, flow_id: &FlowId) -> Result<FlowSnapshot> {
        self.inner
            .flows
            .read()
            .await
            .get(flow_id)
            .map(|e| FlowSnapshot {
                flow: e.flow.clone(),
                runs: e.runs.clone(),
            })
            .ok_or_else(|| EngineError::FlowNotFound(flow_id.clone()))
    }
}
