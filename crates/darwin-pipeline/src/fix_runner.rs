use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use darwin_core::{Category, FixStatus, Result, Rule, SuccessfulFix, Task};
use darwin_store::Store;
use tracing::{error, info, warn};

use crate::learning::LearningStore;

/// Fix context handed to the external coding agent: similar past fixes and
/// applicable style rules, plus any reviewer feedback on a re-iteration
/// (spec §4.5 step 2, §4.7 auto-iterate).
#[derive(Debug, Clone, Default)]
pub struct FixContext {
    pub task: Option<Task>,
    pub similar_fixes: Vec<SuccessfulFix>,
    pub rules: Vec<Rule>,
    pub reviewer_feedback: Option<String>,
}

/// Outcome of one agent invocation.
#[derive(Debug, Clone)]
pub struct FixOutcome {
    pub branch: String,
    pub pr_url: String,
    pub pr_title: String,
    pub files_changed: Vec<String>,
}

/// The boundary to the external coding agent: a sandboxed executor that
/// clones a repository, runs tools, and produces a pull request. Everything
/// past `(task, context) -> outcome` — filesystem sandboxing, tool calls,
/// commit/push — lives outside the core (spec §4.5).
#[async_trait]
pub trait ForgeAgent: Send + Sync {
    async fn run_fix(&self, task: &Task, context: &FixContext) -> anyhow::Result<FixOutcome>;

    /// Opens a tracking issue for a task, independent of the fix pipeline
    /// (spec §6.1 `POST /tasks/{id}/create-issue`).
    async fn create_issue(&self, task: &Task) -> anyhow::Result<(String, u64)>;
}

const TOP_RULES_K: usize = 20;

/// Coordinates fix attempts: CAS transition guard, fix-context assembly via
/// [`LearningStore`], agent invocation, and result persistence (spec §4.5).
pub struct FixRunner {
    store: Arc<dyn Store>,
    learning: Arc<LearningStore>,
    forge: Arc<dyn ForgeAgent>,
    agent_timeout: Duration,
}

impl FixRunner {
    pub fn new(store: Arc<dyn Store>, learning: Arc<LearningStore>, forge: Arc<dyn ForgeAgent>, agent_timeout: Duration) -> Self {
        Self {
            store,
            learning,
            forge,
            agent_timeout,
        }
    }

    /// Attempts to start a fix for `task_id`. Returns `Ok(false)` if another
    /// run is already in flight or completed (at-most-one concurrent fix,
    /// spec §4.5 step 1 / §8 "Fix at-most-once").
    pub async fn start_fix(&self, task_id: uuid::Uuid, reviewer_feedback: Option<String>) -> Result<bool> {
        let task = match self.store.get_task(task_id).await? {
            Some(t) => t,
            None => {
                warn!(%task_id, "fix requested for unknown task");
                return Ok(false);
            }
        };

        let started = self
            .store
            .cas_fix_status(task_id, FixStatus::None, FixStatus::Running)
            .await?
            || self
                .store
                .cas_fix_status(task_id, FixStatus::Failed, FixStatus::Running)
                .await?;

        if !started {
            info!(%task_id, fix_status = %task.fix_status, "fix already running or completed, rejecting");
            return Ok(false);
        }

        self.run(task, reviewer_feedback).await;
        Ok(true)
    }

    async fn run(&self, task: Task, reviewer_feedback: Option<String>) {
        let task_id = task.id;
        let context = match self.build_context(&task, reviewer_feedback).await {
            Ok(ctx) => ctx,
            Err(e) => {
                error!(%task_id, error = %e, "failed to assemble fix context");
                self.fail(task_id, &e.to_string()).await;
                return;
            }
        };

        let invocation = tokio::time::timeout(self.agent_timeout, self.forge.run_fix(&task, &context)).await;

        match invocation {
            Ok(Ok(outcome)) => self.succeed(&task, &context, outcome).await,
            Ok(Err(e)) => {
                warn!(%task_id, error = %e, "agent invocation failed");
                self.fail(task_id, &e.to_string()).await;
            }
            Err(_) => {
                warn!(%task_id, "agent invocation timed out");
                self.fail(task_id, "agent invocation timed out").await;
            }
        }
    }

    async fn build_context(&self, task: &Task, reviewer_feedback: Option<String>) -> anyhow::Result<FixContext> {
        let embedding = self
            .learning
            .similar_fixes_embedding(task)
            .await
            .map_err(|e| anyhow::anyhow!(e))?;
        let similar_fixes = self
            .learning
            .similar_fixes(&embedding, &task.product)
            .await
            .map_err(|e| anyhow::anyhow!(e))?;
        let rules = self.learning.top_rules(&task.product).await.map_err(|e| anyhow::anyhow!(e))?;

        Ok(FixContext {
            task: Some(task.clone()),
            similar_fixes,
            rules: rules.into_iter().take(TOP_RULES_K).collect(),
            reviewer_feedback,
        })
    }

    async fn succeed(&self, task: &Task, context: &FixContext, outcome: FixOutcome) {
        let task_id = task.id;
        let mut updated = task.clone();
        updated.fix_status = FixStatus::Completed;
        updated.pr_url = Some(outcome.pr_url.clone());
        updated.branch = Some(outcome.branch.clone());
        updated.updated_at = chrono::Utc::now();

        if let Err(e) = self.store.update_task(updated).await {
            error!(%task_id, error = %e, "failed to persist completed fix");
            return;
        }

        for rule in &context.rules {
            if let Err(e) = self.store.bump_rule_applied(rule.id, &task.product, chrono::Utc::now()).await {
                warn!(%task_id, rule_id = %rule.id, error = %e, "failed to bump rule usage");
            }
        }

        info!(%task_id, pr_url = %outcome.pr_url, "fix completed");
    }

    async fn fail(&self, task_id: uuid::Uuid, reason: &str) {
        if let Err(e) = self.store.cas_fix_status(task_id, FixStatus::Running, FixStatus::Failed).await {
            error!(%task_id, error = %e, "failed to record fix failure");
        }
        warn!(%task_id, reason, "fix marked failed");
    }
}
