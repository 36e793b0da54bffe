//! Goal orchestrator.
//!
//! Drives goals from `submitted` to `complete | failed`: dequeues them,
//! decomposes them into a task DAG through the LLM, submits the tasks in
//! topological order, watches completions on the bus, and verifies the
//! outcome with a capped retry loop.
//!
//! `tick()` is called by the hub FSM once per second while executing and
//! never blocks: LLM calls run as detached tasks that post their result
//! back through a channel, and at most one call is in flight at a time.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, Mutex};
use uuid::Uuid;

use crate::domain::errors::{DomainResult, LlmError};
use crate::domain::models::dag::{self, PlannedTask};
use crate::domain::models::repo::local_path_for;
use crate::domain::models::{GoalStatus, TaskStatus};
use crate::domain::ports::{
    DecomposeRequest, DecompositionPlan, GapSeverity, LlmClient, TaskResultSummary,
    VerificationOutcome, Verdict,
};
use crate::services::budget::{BudgetCheck, BudgetLedger};
use crate::services::event_bus::{EventBus, EventPayload, HubEvent};
use crate::services::goal_backlog::GoalBacklog;
use crate::services::task_queue::{SubmitTask, TaskQueue};

/// Directories never included in the decomposition file tree.
const EXCLUDED_DIRS: &[&str] = &["_build", "deps", "node_modules", ".git", "target"];
/// Extensions treated as binary and skipped.
const BINARY_EXTENSIONS: &[&str] =
    &["png", "jpg", "jpeg", "gif", "ico", "pdf", "zip", "tar", "gz", "so", "dylib", "bin", "wasm"];
/// File-tree listing cap.
const MAX_TREE_ENTRIES: usize = 500;
/// Plans larger than this log a warning but are submitted anyway.
const PLAN_SIZE_WARNING: usize = 10;

/// Orchestrator tuning.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub workspace_root: PathBuf,
    pub llm_timeout: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            workspace_root: PathBuf::from(".agentcom/workspaces"),
            llm_timeout: Duration::from_secs(120),
        }
    }
}

#[derive(Debug)]
enum LlmOutcome {
    Decomposed { goal_id: Uuid, result: Result<DecompositionPlan, LlmError> },
    Verified { goal_id: Uuid, result: Result<VerificationOutcome, LlmError> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WorkKind {
    Decompose,
    Verify,
}

/// Per-goal orchestration state while the goal is non-terminal.
struct ActiveGoal {
    /// Corrective re-prompts already spent on DAG validation.
    dag_reprompts: u32,
    /// Corrective re-prompts already spent on missing file references.
    file_reprompts: u32,
    /// Feedback to embed in the next decompose dispatch.
    feedback: Option<String>,
    /// File tree captured at first dispatch; used for reference checks.
    file_tree: Vec<String>,
}

impl ActiveGoal {
    fn new() -> Self {
        Self { dag_reprompts: 0, file_reprompts: 0, feedback: None, file_tree: Vec::new() }
    }
}

struct State {
    active: HashMap<Uuid, ActiveGoal>,
    pending: VecDeque<(Uuid, WorkKind)>,
    in_flight: Option<(Uuid, WorkKind)>,
    results_rx: mpsc::UnboundedReceiver<LlmOutcome>,
    events_rx: broadcast::Receiver<HubEvent>,
}

pub struct GoalOrchestrator {
    backlog: Arc<GoalBacklog>,
    queue: Arc<TaskQueue>,
    llm: Arc<dyn LlmClient>,
    budget: Arc<BudgetLedger>,
    config: OrchestratorConfig,
    results_tx: mpsc::UnboundedSender<LlmOutcome>,
    state: Mutex<State>,
}

impl GoalOrchestrator {
    pub fn new(
        backlog: Arc<GoalBacklog>,
        queue: Arc<TaskQueue>,
        llm: Arc<dyn LlmClient>,
        budget: Arc<BudgetLedger>,
        bus: &EventBus,
        config: OrchestratorConfig,
    ) -> Self {
        let (results_tx, results_rx) = mpsc::unbounded_channel();
        Self {
            backlog,
            queue,
            llm,
            budget,
            config,
            results_tx,
            state: Mutex::new(State {
                active: HashMap::new(),
                pending: VecDeque::new(),
                in_flight: None,
                results_rx,
                events_rx: bus.subscribe(),
            }),
        }
    }

    /// Advance orchestration by one step. Non-blocking: drains posted LLM
    /// results and bus events, then dispatches at most one new LLM call.
    pub async fn tick(&self) -> DomainResult<()> {
        let mut state = self.state.lock().await;

        // 1. Finished LLM calls.
        while let Ok(outcome) = state.results_rx.try_recv() {
            self.handle_outcome(&mut state, outcome).await?;
        }

        // 2. Bus events: task completions re-evaluate goal progress.
        loop {
            match state.events_rx.try_recv() {
                Ok(event) => self.handle_event(&mut state, &event).await?,
                Err(broadcast::error::TryRecvError::Empty) => break,
                Err(broadcast::error::TryRecvError::Lagged(n)) => {
                    tracing::warn!(missed = n, "Orchestrator lagged on the event bus; rescanning goals");
                    self.rescan_executing_goals(&mut state).await?;
                }
                Err(broadcast::error::TryRecvError::Closed) => break,
            }
        }

        // 3. One in-flight call at most.
        if state.in_flight.is_some() {
            return Ok(());
        }

        // 4. Dispatch queued work first, then pull a fresh goal.
        if let Some((goal_id, kind)) = state.pending.pop_front() {
            self.dispatch(&mut state, goal_id, kind).await?;
            return Ok(());
        }

        if let Some(goal) = self.backlog.dequeue().await? {
            let mut active = ActiveGoal::new();
            active.file_tree = self.gather_file_tree(goal.repo.as_deref());
            state.active.insert(goal.id, active);
            self.dispatch(&mut state, goal.id, WorkKind::Decompose).await?;
        }

        Ok(())
    }

    async fn handle_event(&self, state: &mut State, event: &HubEvent) -> DomainResult<()> {
        match &event.payload {
            EventPayload::TaskCompleted { goal_id: Some(goal_id), .. }
            | EventPayload::TaskDeadLettered { goal_id: Some(goal_id), .. } => {
                self.check_goal_progress(state, *goal_id).await?;
            }
            EventPayload::GoalDeleted { goal_id } => {
                // Cancel future steps; in-flight results become no-ops.
                state.active.remove(goal_id);
                state.pending.retain(|(id, _)| id != goal_id);
            }
            _ => {}
        }
        Ok(())
    }

    /// Fallback after bus lag: poll every executing goal directly.
    async fn rescan_executing_goals(&self, state: &mut State) -> DomainResult<()> {
        for goal in self.backlog.list().await? {
            if goal.status == GoalStatus::Executing {
                self.check_goal_progress(state, goal.id).await?;
            }
        }
        Ok(())
    }

    async fn check_goal_progress(&self, state: &mut State, goal_id: Uuid) -> DomainResult<()> {
        let Some(goal) = self.backlog.get(goal_id).await? else {
            return Ok(());
        };
        if goal.status != GoalStatus::Executing {
            return Ok(());
        }

        let progress = self.queue.goal_progress(goal_id).await?;
        if progress.pending > 0 {
            return Ok(());
        }

        if progress.failed > 0 {
            tracing::warn!(goal_id = %goal_id, failed = progress.failed, "Goal has dead-lettered children");
            self.backlog
                .transition(goal_id, GoalStatus::Failed, "child_tasks_failed")
                .await?;
            state.active.remove(&goal_id);
            return Ok(());
        }

        if progress.completed == 0 {
            // Nothing was ever submitted; leave the goal alone.
            return Ok(());
        }

        self.backlog
            .transition(goal_id, GoalStatus::Verifying, "all tasks completed")
            .await?;
        state.active.entry(goal_id).or_insert_with(ActiveGoal::new);
        if !state.pending.iter().any(|(id, kind)| *id == goal_id && *kind == WorkKind::Verify) {
            state.pending.push_back((goal_id, WorkKind::Verify));
        }
        Ok(())
    }

    async fn dispatch(&self, state: &mut State, goal_id: Uuid, kind: WorkKind) -> DomainResult<()> {
        if self.budget.check() == BudgetCheck::Exhausted {
            // Leave the work queued; the hub FSM sees exhaustion and
            // transitions out of executing.
            tracing::warn!(goal_id = %goal_id, "Budget exhausted; deferring LLM work");
            state.pending.push_front((goal_id, kind));
            return Ok(());
        }

        let Some(goal) = self.backlog.get(goal_id).await? else {
            state.active.remove(&goal_id);
            return Ok(());
        };

        match kind {
            WorkKind::Decompose => {
                let active = state.active.entry(goal_id).or_insert_with(ActiveGoal::new);
                let request = DecomposeRequest {
                    goal_title: goal.title.clone(),
                    goal_description: goal.description.clone(),
                    success_criteria: goal.success_criteria.clone(),
                    repo: goal.repo.clone(),
                    file_tree: active.file_tree.clone(),
                    feedback: active.feedback.take(),
                };

                let llm = Arc::clone(&self.llm);
                let tx = self.results_tx.clone();
                let timeout = self.config.llm_timeout;
                tokio::spawn(async move {
                    let result = run_with_timeout(timeout, llm.decompose(request)).await;
                    let _ = tx.send(LlmOutcome::Decomposed { goal_id, result });
                });
            }
            WorkKind::Verify => {
                let tasks = self.queue.tasks_for_goal(goal_id).await?;
                let results_summary = tasks
                    .iter()
                    .filter(|t| t.status == TaskStatus::Completed)
                    .map(|t| TaskResultSummary {
                        description: t.description.clone(),
                        status: t.status.as_str().to_string(),
                        result: t.result.as_ref().map(std::string::ToString::to_string),
                        file_hints: t.file_hints.iter().map(|h| h.path.clone()).collect(),
                    })
                    .collect();

                let request = crate::domain::ports::VerifyRequest {
                    goal_title: goal.title.clone(),
                    goal_description: goal.description.clone(),
                    success_criteria: goal.success_criteria.clone(),
                    results_summary,
                };

                let llm = Arc::clone(&self.llm);
                let tx = self.results_tx.clone();
                let timeout = self.config.llm_timeout;
                tokio::spawn(async move {
                    let result = run_with_timeout(timeout, llm.verify(request)).await;
                    let _ = tx.send(LlmOutcome::Verified { goal_id, result });
                });
            }
        }

        state.in_flight = Some((goal_id, kind));
        Ok(())
    }

    async fn handle_outcome(&self, state: &mut State, outcome: LlmOutcome) -> DomainResult<()> {
        state.in_flight = None;
        match outcome {
            LlmOutcome::Decomposed { goal_id, result } => {
                if !state.active.contains_key(&goal_id) {
                    tracing::debug!(goal_id = %goal_id, "Dropping decomposition for a removed goal");
                    return Ok(());
                }
                match result {
                    Ok(plan) => self.handle_plan(state, goal_id, plan).await,
                    Err(LlmError::BudgetExhausted) => {
                        state.pending.push_front((goal_id, WorkKind::Decompose));
                        Ok(())
                    }
                    Err(err) => {
                        tracing::error!(goal_id = %goal_id, error = %err, "Decomposition failed");
                        self.backlog
                            .transition(goal_id, GoalStatus::Failed, &format!("decomposition_error: {err}"))
                            .await?;
                        state.active.remove(&goal_id);
                        Ok(())
                    }
                }
            }
            LlmOutcome::Verified { goal_id, result } => {
                if !state.active.contains_key(&goal_id) {
                    tracing::debug!(goal_id = %goal_id, "Dropping verdict for a removed goal");
                    return Ok(());
                }
                match result {
                    Ok(outcome) => {
                        self.budget.record(outcome.tokens_used);
                        self.handle_verdict(state, goal_id, outcome.verdict).await
                    }
                    Err(LlmError::BudgetExhausted) => {
                        state.pending.push_front((goal_id, WorkKind::Verify));
                        Ok(())
                    }
                    Err(err) => {
                        tracing::error!(goal_id = %goal_id, error = %err, "Verification failed");
                        self.backlog
                            .transition(goal_id, GoalStatus::Failed, &format!("verification_error: {err}"))
                            .await?;
                        state.active.remove(&goal_id);
                        Ok(())
                    }
                }
            }
        }
    }

    async fn handle_plan(
        &self,
        state: &mut State,
        goal_id: Uuid,
        plan: DecompositionPlan,
    ) -> DomainResult<()> {
        self.budget.record(plan.tokens_used);
        let mut tasks = plan.tasks;
        dag::normalize_indices(&mut tasks);

        // Structural validation with one corrective re-prompt.
        let order = match dag::topological_order(&tasks) {
            Ok(order) => order,
            Err(err) => {
                let Some(active) = state.active.get_mut(&goal_id) else {
                    return Ok(());
                };
                if active.dag_reprompts == 0 {
                    active.dag_reprompts = 1;
                    active.feedback = Some(format!("The task plan is invalid: {err}"));
                    tracing::warn!(goal_id = %goal_id, error = %err, "Invalid plan; re-prompting once");
                    state.pending.push_back((goal_id, WorkKind::Decompose));
                    return Ok(());
                }
                self.backlog
                    .transition(goal_id, GoalStatus::Failed, &format!("decomposition_invalid: {err}"))
                    .await?;
                state.active.remove(&goal_id);
                return Ok(());
            }
        };

        // File-reference validation: one re-prompt, then strip-and-proceed.
        {
            let Some(active) = state.active.get_mut(&goal_id) else {
                return Ok(());
            };
            let known: HashSet<&str> = active.file_tree.iter().map(String::as_str).collect();
            let missing: Vec<String> = tasks
                .iter()
                .flat_map(|t| t.file_paths.iter())
                .filter(|p| !known.contains(p.as_str()))
                .cloned()
                .collect();

            if !missing.is_empty() && !active.file_tree.is_empty() {
                if active.file_reprompts == 0 {
                    active.file_reprompts = 1;
                    active.feedback = Some(format!(
                        "These referenced files do not exist in the repository: {}",
                        missing.join(", ")
                    ));
                    tracing::warn!(goal_id = %goal_id, missing = ?missing, "Plan references missing files; re-prompting once");
                    state.pending.push_back((goal_id, WorkKind::Decompose));
                    return Ok(());
                }
                tracing::warn!(goal_id = %goal_id, missing = ?missing, "Stripping unknown file references from plan");
                for task in &mut tasks {
                    task.file_paths.retain(|p| known.contains(p.as_str()));
                }
            }
        }

        if tasks.len() > PLAN_SIZE_WARNING {
            tracing::warn!(goal_id = %goal_id, count = tasks.len(), "Decomposition produced an unusually large plan");
        }

        self.submit_plan(goal_id, &tasks, &order).await?;
        self.backlog
            .transition(goal_id, GoalStatus::Executing, &format!("{} tasks submitted", tasks.len()))
            .await?;
        Ok(())
    }

    /// Submit planned tasks in topological order, mapping plan indices to
    /// real task ids as they are created.
    async fn submit_plan(
        &self,
        goal_id: Uuid,
        tasks: &[PlannedTask],
        order: &[usize],
    ) -> DomainResult<()> {
        let goal = self.backlog.get(goal_id).await?;
        let (repo, priority) = goal.map_or((None, None), |g| (g.repo, Some(g.priority)));

        let mut id_by_index: HashMap<usize, Uuid> = HashMap::new();
        for &index in order {
            let planned = &tasks[index];
            let depends_on = planned
                .depends_on
                .iter()
                .map(|dep| id_by_index[dep])
                .collect();

            let (task, _) = self
                .queue
                .submit(SubmitTask {
                    description: planned.description.clone(),
                    goal_id: Some(goal_id),
                    depends_on,
                    repo: repo.clone(),
                    file_hints: planned
                        .file_paths
                        .iter()
                        .map(|p| crate::domain::models::task::FileHint {
                            path: p.clone(),
                            reason: "referenced by decomposition".to_string(),
                        })
                        .collect(),
                    success_criteria: planned.success_criteria.clone(),
                    priority: priority.map(goal_priority_to_task),
                    ..Default::default()
                })
                .await?;
            id_by_index.insert(index, task.id);
        }
        Ok(())
    }

    async fn handle_verdict(
        &self,
        state: &mut State,
        goal_id: Uuid,
        verdict: Verdict,
    ) -> DomainResult<()> {
        match verdict {
            Verdict::Pass => {
                self.backlog
                    .transition(goal_id, GoalStatus::Complete, "verification passed")
                    .await?;
                state.active.remove(&goal_id);
                Ok(())
            }
            Verdict::Fail { gaps } => {
                let Some(mut goal) = self.backlog.get(goal_id).await? else {
                    state.active.remove(&goal_id);
                    return Ok(());
                };

                if !goal.can_retry_verification() {
                    self.backlog
                        .transition(goal_id, GoalStatus::Failed, "needs_human_review")
                        .await?;
                    state.active.remove(&goal_id);
                    return Ok(());
                }

                for gap in &gaps {
                    let priority = if gap.severity == GapSeverity::Critical {
                        goal_priority_to_task(goal.priority).bumped()
                    } else {
                        goal_priority_to_task(goal.priority)
                    };
                    self.queue
                        .submit(SubmitTask {
                            description: gap.description.clone(),
                            goal_id: Some(goal_id),
                            repo: goal.repo.clone(),
                            priority: Some(priority),
                            ..Default::default()
                        })
                        .await?;
                }

                goal.verification_retries += 1;
                self.backlog.update(&goal).await?;
                self.backlog
                    .transition(
                        goal_id,
                        GoalStatus::Executing,
                        &format!("verification found {} gaps", gaps.len()),
                    )
                    .await?;
                Ok(())
            }
        }
    }

    /// Bounded recursive listing of the goal's repo checkout.
    fn gather_file_tree(&self, repo: Option<&str>) -> Vec<String> {
        let Some(repo) = repo else {
            return Vec::new();
        };
        let root = local_path_for(&self.config.workspace_root, repo);
        let mut entries = Vec::new();
        collect_files(&root, &root, &mut entries);
        entries.sort();
        entries.truncate(MAX_TREE_ENTRIES);
        entries
    }

    /// Number of goals this orchestrator currently tracks.
    pub async fn active_goal_count(&self) -> usize {
        self.state.lock().await.active.len()
    }
}

async fn run_with_timeout<T>(
    timeout: Duration,
    future: impl std::future::Future<Output = Result<T, LlmError>>,
) -> Result<T, LlmError> {
    match tokio::time::timeout(timeout, future).await {
        Ok(result) => result,
        Err(_) => Err(LlmError::Timeout(timeout.as_secs())),
    }
}

fn goal_priority_to_task(
    priority: crate::domain::models::GoalPriority,
) -> crate::domain::models::TaskPriority {
    use crate::domain::models::{GoalPriority, TaskPriority};
    match priority {
        GoalPriority::Low => TaskPriority::Low,
        GoalPriority::Normal => TaskPriority::Normal,
        GoalPriority::High => TaskPriority::High,
        GoalPriority::Urgent => TaskPriority::Urgent,
    }
}

fn collect_files(root: &Path, dir: &Path, entries: &mut Vec<String>) {
    if entries.len() >= MAX_TREE_ENTRIES {
        return;
    }
    let Ok(read_dir) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in read_dir.flatten() {
        if entries.len() >= MAX_TREE_ENTRIES {
            return;
        }
        let path = entry.path();
        let name = entry.file_name().to_string_lossy().to_string();

        if path.is_dir() {
            if EXCLUDED_DIRS.contains(&name.as_str()) {
                continue;
            }
            collect_files(root, &path, entries);
        } else {
            let extension = path.extension().and_then(|e| e.to_str()).unwrap_or("");
            if BINARY_EXTENSIONS.contains(&extension) {
                continue;
            }
            if let Ok(relative) = path.strip_prefix(root) {
                entries.push(relative.to_string_lossy().replace('\\', "/"));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::llm::MockLlmClient;
    use crate::adapters::sqlite::{
        create_migrated_test_pool, SqliteGoalRepository, SqliteRepoRegistryStore,
        SqliteTaskRepository,
    };
    use crate::domain::models::config::BudgetConfig;
    use crate::domain::models::TaskPriority;
    use crate::domain::ports::VerificationGap;
    use crate::services::goal_backlog::SubmitGoal;
    use crate::services::repo_registry::RepoRegistry;

    struct Fixture {
        orchestrator: GoalOrchestrator,
        backlog: Arc<GoalBacklog>,
        queue: Arc<TaskQueue>,
        llm: MockLlmClient,
    }

    async fn setup() -> Fixture {
        let pool = create_migrated_test_pool().await.unwrap();
        let bus = Arc::new(EventBus::default());
        let repos = Arc::new(RepoRegistry::new(
            Arc::new(SqliteRepoRegistryStore::new(pool.clone())),
            None,
        ));
        let backlog = Arc::new(GoalBacklog::new(
            Arc::new(SqliteGoalRepository::new(pool.clone())),
            bus.clone(),
            repos.clone(),
        ));
        let queue = Arc::new(TaskQueue::new(
            Arc::new(SqliteTaskRepository::new(pool)),
            bus.clone(),
            repos,
        ));
        let llm = MockLlmClient::new();
        let orchestrator = GoalOrchestrator::new(
            backlog.clone(),
            queue.clone(),
            Arc::new(llm.clone()),
            Arc::new(BudgetLedger::new(&BudgetConfig::default())),
            &bus,
            OrchestratorConfig::default(),
        );
        Fixture { orchestrator, backlog, queue, llm }
    }

    fn plan(tasks: Vec<(&str, Vec<usize>)>) -> DecompositionPlan {
        DecompositionPlan {
            tasks: tasks
                .into_iter()
                .map(|(desc, deps)| PlannedTask {
                    description: desc.to_string(),
                    depends_on: deps,
                    file_paths: vec![],
                    success_criteria: vec![],
                })
                .collect(),
            tokens_used: 100,
        }
    }

    /// Tick until the in-flight detached LLM task has posted its result.
    async fn tick_until_settled(fixture: &Fixture) {
        for _ in 0..20 {
            fixture.orchestrator.tick().await.unwrap();
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    async fn submit_goal(fixture: &Fixture, title: &str) -> Uuid {
        fixture
            .backlog
            .submit(SubmitGoal {
                title: title.to_string(),
                description: "desc".to_string(),
                ..Default::default()
            })
            .await
            .unwrap()
            .id
    }

    #[tokio::test]
    async fn test_decomposition_submits_dag_in_order() {
        let fixture = setup().await;
        fixture
            .llm
            .push_decompose(Ok(plan(vec![("a", vec![]), ("b", vec![0]), ("c", vec![1])])))
            .await;
        let goal_id = submit_goal(&fixture, "g").await;

        tick_until_settled(&fixture).await;

        let goal = fixture.backlog.get(goal_id).await.unwrap().unwrap();
        assert_eq!(goal.status, GoalStatus::Executing);

        let tasks = fixture.queue.tasks_for_goal(goal_id).await.unwrap();
        assert_eq!(tasks.len(), 3);
        // Dependencies resolved to real ids: "b" depends on "a"'s id.
        let a = tasks.iter().find(|t| t.description == "a").unwrap();
        let b = tasks.iter().find(|t| t.description == "b").unwrap();
        assert_eq!(b.depends_on, vec![a.id]);
    }

    #[tokio::test]
    async fn test_invalid_dag_reprompts_once_then_fails() {
        let fixture = setup().await;
        // Both responses carry a cycle.
        fixture.llm.push_decompose(Ok(plan(vec![("a", vec![1]), ("b", vec![0])]))).await;
        fixture.llm.push_decompose(Ok(plan(vec![("a", vec![1]), ("b", vec![0])]))).await;
        let goal_id = submit_goal(&fixture, "g").await;

        tick_until_settled(&fixture).await;

        assert_eq!(fixture.llm.decompose_call_count().await, 2);
        let requests = fixture.llm.decompose_requests().await;
        assert!(requests[1].feedback.as_deref().unwrap().contains("invalid"));

        let goal = fixture.backlog.get(goal_id).await.unwrap().unwrap();
        assert_eq!(goal.status, GoalStatus::Failed);
    }

    #[tokio::test]
    async fn test_second_valid_plan_after_reprompt_succeeds() {
        let fixture = setup().await;
        fixture.llm.push_decompose(Ok(plan(vec![("a", vec![0])]))).await; // self-dep
        fixture.llm.push_decompose(Ok(plan(vec![("a", vec![])]))).await;
        let goal_id = submit_goal(&fixture, "g").await;

        tick_until_settled(&fixture).await;

        let goal = fixture.backlog.get(goal_id).await.unwrap().unwrap();
        assert_eq!(goal.status, GoalStatus::Executing);
        assert_eq!(fixture.queue.tasks_for_goal(goal_id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_verification_pass_completes_goal() {
        let fixture = setup().await;
        fixture.llm.push_decompose(Ok(plan(vec![("a", vec![])]))).await;
        fixture
            .llm
            .push_verify(Ok(VerificationOutcome { verdict: Verdict::Pass, tokens_used: 50 }))
            .await;
        let goal_id = submit_goal(&fixture, "g").await;

        tick_until_settled(&fixture).await;

        // Complete the single child task.
        let task = &fixture.queue.tasks_for_goal(goal_id).await.unwrap()[0];
        let assigned = fixture.queue.assign(task.id, "a-1", 0).await.unwrap();
        fixture.queue.complete(task.id, assigned.generation, None).await.unwrap();

        tick_until_settled(&fixture).await;

        let goal = fixture.backlog.get(goal_id).await.unwrap().unwrap();
        assert_eq!(goal.status, GoalStatus::Complete);
        assert_eq!(fixture.llm.verify_call_count().await, 1);
    }

    #[tokio::test]
    async fn test_verification_retry_cap() {
        let fixture = setup().await;
        fixture.llm.push_decompose(Ok(plan(vec![("a", vec![])]))).await;
        // Three failing verdicts: initial plus the two retries.
        for _ in 0..3 {
            fixture
                .llm
                .push_verify(Ok(VerificationOutcome {
                    verdict: Verdict::Fail {
                        gaps: vec![VerificationGap {
                            description: "missing tests".to_string(),
                            severity: GapSeverity::Critical,
                        }],
                    },
                    tokens_used: 50,
                }))
                .await;
        }
        let goal_id = submit_goal(&fixture, "g").await;
        tick_until_settled(&fixture).await;

        // Drive every child task to completion after each round.
        for round in 0..3 {
            let tasks = fixture.queue.tasks_for_goal(goal_id).await.unwrap();
            for task in tasks.iter().filter(|t| t.status == TaskStatus::Queued) {
                let assigned = fixture.queue.assign(task.id, "a-1", task.generation).await.unwrap();
                fixture.queue.complete(task.id, assigned.generation, None).await.unwrap();
            }
            tick_until_settled(&fixture).await;

            let goal = fixture.backlog.get(goal_id).await.unwrap().unwrap();
            if round < 2 {
                assert_eq!(goal.status, GoalStatus::Executing, "round {round}");
                // Critical gap bumps the follow-up priority one lane.
                let follow_ups: Vec<_> = fixture
                    .queue
                    .tasks_for_goal(goal_id)
                    .await
                    .unwrap()
                    .into_iter()
                    .filter(|t| t.description == "missing tests")
                    .collect();
                assert!(!follow_ups.is_empty());
                assert!(follow_ups.iter().all(|t| t.priority == TaskPriority::High));
            }
        }

        let goal = fixture.backlog.get(goal_id).await.unwrap().unwrap();
        assert_eq!(goal.status, GoalStatus::Failed);
        assert_eq!(goal.verification_retries, 2);
        assert!(goal.history.iter().any(|h| h.reason == "needs_human_review"));
        // Exactly three verifications: no fourth attempt.
        assert_eq!(fixture.llm.verify_call_count().await, 3);
    }

    #[tokio::test]
    async fn test_dead_lettered_child_fails_goal() {
        let fixture = setup().await;
        fixture.llm.push_decompose(Ok(plan(vec![("a", vec![])]))).await;
        let goal_id = submit_goal(&fixture, "g").await;
        tick_until_settled(&fixture).await;

        let task = &fixture.queue.tasks_for_goal(goal_id).await.unwrap()[0];
        // Exhaust the retry budget.
        let mut generation = 0;
        for _ in 0..=task.max_retries {
            let assigned = fixture.queue.assign(task.id, "a-1", generation).await.unwrap();
            fixture.queue.fail(task.id, assigned.generation, "boom").await.unwrap();
            generation = assigned.generation + 1;
        }

        tick_until_settled(&fixture).await;
        let goal = fixture.backlog.get(goal_id).await.unwrap().unwrap();
        assert_eq!(goal.status, GoalStatus::Failed);
    }

    #[tokio::test]
    async fn test_llm_error_fails_goal() {
        let fixture = setup().await;
        fixture
            .llm
            .push_decompose(Err(LlmError::InvalidResponse("garbage".to_string())))
            .await;
        let goal_id = submit_goal(&fixture, "g").await;

        tick_until_settled(&fixture).await;
        let goal = fixture.backlog.get(goal_id).await.unwrap().unwrap();
        assert_eq!(goal.status, GoalStatus::Failed);
        assert!(goal.history.last().unwrap().reason.contains("decomposition_error"));
    }

    #[tokio::test]
    async fn test_goal_deletion_cancels_future_steps() {
        let fixture = setup().await;
        fixture.llm.push_decompose(Ok(plan(vec![("a", vec![])]))).await;
        let goal_id = submit_goal(&fixture, "g").await;
        tick_until_settled(&fixture).await;

        fixture.backlog.delete(goal_id).await.unwrap();
        tick_until_settled(&fixture).await;

        assert_eq!(fixture.orchestrator.active_goal_count().await, 0);
    }
}
