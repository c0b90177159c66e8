//! Executor wrapper that mirrors action progress onto task details

use crate::task::TaskTracker;
use async_trait::async_trait;
use flowgate_engine::{ActionContext, ActionExecutor, ActionOutcome, ExecutorError};
use std::sync::Arc;

/// Moves an action's task details to `Running` before it runs and to
/// `Success`/`Failed` once the action's outcome is final
pub struct TrackedExecutor {
    inner: Arc<dyn ActionExecutor>,
    tasks: TaskTracker,
}

impl TrackedExecutor {
    pub fn new(inner: Arc<dyn ActionExecutor>, tasks: TaskTracker) -> Self {
        Self { inner, tasks }
    }
}

#[async_trait]
impl ActionExecutor for TrackedExecutor {
    async fn execute(
        &self,
        ctx: &ActionContext,
        params: &serde_json::Value,
    ) -> Result<serde_json::Value, ExecutorError> {
        if let Err(e) = self.tasks.mark_running(&ctx.flow_id, &ctx.action_id).await {
            tracing::warn!(
                flow_id = %ctx.flow_id,
                action_id = %ctx.action_id,
                error = %e,
                "could not mark task details running"
            );
        }
        self.inner.execute(ctx, params).await
    }

    async fn on_settled(&self, ctx: &ActionContext, outcome: &ActionOutcome) {
        let result = match outcome {
            ActionOutcome::Succeeded(_) => Ok(()),
            ActionOutcome::Failed(error) => Err(error.clone()),
        };
        if let Err(e) = self
            .tasks
            .settle_action(&ctx.flow_id, &ctx.action_id, result)
            .await
        {
            tracing::warn!(
                flow_id = %ctx.flow_id,
                action_id = %ctx.action_id,
                error = %e,
                "could not settle task details"
            );
        }
        self.inner.on_settled(ctx, outcome).await;
    }
}
