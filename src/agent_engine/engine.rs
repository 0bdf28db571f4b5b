use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::agent_engine::decomposer::{subtask_context, TaskDecomposer};
use crate::agent_engine::history::{EntryKind, HistoryEntry, SessionHistory};
use crate::agent_engine::loop_control::LoopController;
use crate::agent_engine::planner::{ActionKind, ActionPlanner, PlanningContext, ProposedAction};
use crate::agent_engine::state::{AgentStatus, RunReport, SessionState, StopHandle};
use crate::agent_engine::verifier::{Verification, Verifier};
use crate::config::AppConfig;
use crate::errors::{PilotError, PilotResult};
use crate::executor::action::Action;
use crate::executor::input::InputExecutor;
use crate::grounding::description::ElementDescription;
use crate::grounding::grounder::{Grounder, METHOD_CACHE};
use crate::llm::vision::VisionModel;
use crate::memory::cache::ElementCache;
use crate::memory::store::{MemoryContext, MemoryStore, SessionOutcome};
use crate::perception::annotator::Annotator;
use crate::perception::detector::HybridDetector;
use crate::perception::screenshot::Screenshot;
use crate::perception::traits::{AccessibilitySource, PageSource, ScreenCapture};
use crate::perception::types::{ElementTree, Point};
use crate::perception::ui_automation::TreeCache;
use crate::recovery::classifier::{analyze_error, ErrorEvent, ErrorKind};
use crate::recovery::planner::{RecoveryPlanner, StrategyTable};
use crate::reflection::workflow::{ReflectionResult, ReflectionWorkflow};
use crate::skills::registry::SkillRegistry;

const MAX_PROMPT_ELEMENTS: usize = 60;

/// How one step ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StepOutcome {
    Progress,
    /// Marks were installed; nothing was dispatched.
    Annotated,
    /// The model or the verifier reported the task (or subtask) done.
    Done,
    Failed,
    /// The run is over: a terminal error or a loop limit.
    Aborted,
}

/// Where a target description resolved to.
struct Located {
    point: Point,
    confidence: f64,
    method: String,
}

/// Per-run bookkeeping that does not belong in [`SessionState`].
struct Run {
    state: SessionState,
    history: SessionHistory,
    control: LoopController,
    memory: Option<MemoryContext>,
    /// Actions before this index are hidden from planning prompts.
    history_floor: usize,
    learned_patterns: Vec<String>,
    started: Instant,
}

impl Run {
    fn log(&mut self, kind: EntryKind, content: impl Into<String>) {
        let step = self.state.step;
        self.history.record(HistoryEntry::new(step, kind, content));
    }

    fn record_error(&mut self, event: ErrorEvent) {
        self.log(EntryKind::Error, format!("{}: {}", event.kind, event.action));
        self.state.error_history.push(event);
    }

    /// The task text the verifier judges against.
    fn verify_goal(&self) -> String {
        self.state
            .plan
            .as_ref()
            .and_then(|p| p.current())
            .map_or_else(|| self.state.task.clone(), |s| s.description.clone())
    }
}

/// The observe / plan / act / verify loop with recovery and subtask
/// reflection.
pub struct Engine {
    config: AppConfig,
    capture: Arc<dyn ScreenCapture>,
    input: Arc<dyn InputExecutor>,
    model: Arc<dyn VisionModel>,
    accessibility: Option<Arc<dyn AccessibilitySource>>,
    detector: HybridDetector,
    annotator: Annotator,
    grounder: Grounder,
    tree_cache: TreeCache,
    element_cache: ElementCache,
    planner: ActionPlanner,
    verifier: Verifier,
    decomposer: TaskDecomposer,
    recovery: RecoveryPlanner,
    reflection: ReflectionWorkflow,
    memory: Option<Arc<dyn MemoryStore>>,
    skills: SkillRegistry,
    stop: StopHandle,
}

impl Engine {
    pub fn new(
        config: AppConfig,
        capture: Arc<dyn ScreenCapture>,
        input: Arc<dyn InputExecutor>,
        model: Arc<dyn VisionModel>,
    ) -> Self {
        Self {
            detector: HybridDetector::new(None, config.detector.clone()),
            annotator: Annotator::new(config.annotator.clone()),
            grounder: Grounder::new(config.grounding.clone()),
            tree_cache: TreeCache::new(Duration::from_millis(config.detector.tree_cache_ms)),
            element_cache: ElementCache::new(
                Duration::from_secs(config.memory.cache_ttl_secs),
                config.memory.cache_capacity,
            ),
            planner: ActionPlanner::new(Arc::clone(&model)),
            verifier: Verifier::new(Arc::clone(&model)),
            decomposer: TaskDecomposer::new(Arc::clone(&model), config.agent.max_subtasks),
            recovery: RecoveryPlanner::new(StrategyTable::default(), &config.recovery),
            reflection: ReflectionWorkflow::new(Arc::clone(&model), None, &config.reflection),
            memory: None,
            skills: SkillRegistry::new(),
            stop: StopHandle::new(),
            accessibility: None,
            capture,
            input,
            model,
            config,
        }
    }

    pub fn with_accessibility(mut self, source: Arc<dyn AccessibilitySource>) -> Self {
        self.accessibility = Some(source);
        self
    }

    pub fn with_page_source(mut self, source: Arc<dyn PageSource>) -> Self {
        self.detector = HybridDetector::new(Some(source), self.config.detector.clone());
        self
    }

    pub fn with_memory(mut self, memory: Arc<dyn MemoryStore>) -> Self {
        self.reflection = ReflectionWorkflow::new(
            Arc::clone(&self.model),
            Some(Arc::clone(&memory)),
            &self.config.reflection,
        );
        self.memory = Some(memory);
        self
    }

    pub fn with_skills(mut self, skills: SkillRegistry) -> Self {
        self.skills = skills;
        self
    }

    pub fn with_strategies(mut self, table: StrategyTable) -> Self {
        self.recovery = RecoveryPlanner::new(table, &self.config.recovery);
        self
    }

    pub fn with_stop_handle(mut self, stop: StopHandle) -> Self {
        self.stop = stop;
        self
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    pub fn element_cache(&self) -> &ElementCache {
        &self.element_cache
    }

    /// Runs `task` to completion, failure, or a loop limit.
    pub async fn run(&mut self, task: &str) -> RunReport {
        let max_steps = self.config.agent.max_steps;
        let mut run = Run {
            state: SessionState::new(task, max_steps),
            history: SessionHistory::new(self.config.agent.history_dir.as_deref()),
            control: LoopController::new(&self.config.agent, max_steps, self.stop.clone()),
            memory: None,
            history_floor: 0,
            learned_patterns: Vec::new(),
            started: Instant::now(),
        };
        tracing::info!(task, session = %run.history.session_id, max_steps, "run started");
        run.log(EntryKind::Task, task);
        self.recovery.reset_attempt_counts();
        self.reflection.reset();

        if let Some(memory) = &self.memory {
            let context = memory.context_for(task);
            tracing::debug!(
                similar = context.similar_tasks.len(),
                patterns = context.success_patterns.len(),
                "memory context loaded"
            );
            run.memory = Some(context);
        }

        run.state.set_status(AgentStatus::Planning);
        if self.config.agent.enable_task_planning && TaskDecomposer::should_decompose(task) {
            run.state.set_status(AgentStatus::Decomposing);
            let screenshot = match self.capture.capture().await {
                Ok(shot) => Some(shot),
                Err(e) => {
                    tracing::warn!(error = %e, "capture before decomposition failed");
                    None
                }
            };
            let mut plan = self.decomposer.decompose(task, screenshot.as_ref()).await;
            if plan.len() > 1 {
                plan.start();
                run.state.plan = Some(plan);
            }
        }

        if run.state.plan.is_some() {
            self.run_subtasks(&mut run).await;
        } else {
            self.run_direct(&mut run).await;
        }
        self.finish(run)
    }

    async fn run_direct(&mut self, run: &mut Run) {
        loop {
            match self.guarded_step(run).await {
                StepOutcome::Done => {
                    run.state.complete();
                    return;
                }
                StepOutcome::Aborted => return,
                _ => {}
            }
        }
    }

    async fn run_subtasks(&mut self, run: &mut Run) {
        let max_attempts = self.reflection.max_retries() + 1;
        let per_block = self.config.agent.steps_per_subtask.max(1);

        while let Some(subtask) = run.state.plan.as_ref().and_then(|p| p.current()).cloned() {
            tracing::info!(
                id = %subtask.id,
                description = %subtask.description,
                progress = %run.state.plan.as_ref().map(|p| p.progress()).unwrap_or_default(),
                "starting subtask"
            );
            let mut attempt = 0;
            let mut completed = false;
            let mut last_result = ReflectionResult::default();

            while attempt < max_attempts {
                attempt += 1;
                run.state.subtask_actions.clear();

                let mut steps = 0;
                let mut aborted = false;
                while steps < per_block {
                    steps += 1;
                    match self.guarded_step(run).await {
                        StepOutcome::Done => break,
                        StepOutcome::Aborted => {
                            aborted = true;
                            break;
                        }
                        _ => {}
                    }
                }
                if let Some(current) = run.state.plan.as_mut().and_then(|p| p.current_mut()) {
                    current.actual_steps += steps;
                }
                if aborted {
                    break;
                }

                let screenshot = match self.capture.capture().await {
                    Ok(shot) => shot,
                    Err(e) => {
                        tracing::warn!(error = %e, "capture for subtask verification failed");
                        last_result = ReflectionResult {
                            observation: format!("capture failed: {e}"),
                            failure_reason: Some(e.to_string()),
                            should_retry: true,
                            ..ReflectionResult::default()
                        };
                        continue;
                    }
                };
                let actions = run.state.subtask_actions.clone();
                last_result = self.reflection.verify_subtask(&subtask, &screenshot, &actions).await;
                if last_result.subtask_completed {
                    completed = true;
                    break;
                }
                if attempt >= max_attempts {
                    break;
                }

                let reflection = self
                    .reflection
                    .reflect_on_failure(&subtask, &screenshot, &actions, &last_result)
                    .await;
                self.reflection.note_suggestion(&subtask, &reflection);
                if !reflection.should_retry {
                    tracing::info!(id = %subtask.id, "reflection advises against retrying");
                    if reflection.failure_reason.is_some() {
                        last_result.failure_reason = reflection.failure_reason;
                    }
                    break;
                }
                run.state.subtask_actions.clear();
                run.history_floor = run.state.action_history.len();
                run.state.reflection_hint = reflection
                    .suggested_approach
                    .or(reflection.failure_reason.map(|r| format!("Avoid the previous failure: {r}")));
                tracing::info!(id = %subtask.id, attempt, "retrying subtask with reflection hint");
            }

            if run.state.failed {
                let reason = run.state.last_error.clone().unwrap_or_else(|| "run aborted".into());
                if let Some(current) = run.state.plan.as_mut().and_then(|p| p.current_mut()) {
                    current.fail(reason);
                }
                self.reflection.record_outcome(&subtask, false, attempt);
                return;
            }

            if let Some(pattern) = self.reflection.record_outcome(&subtask, completed, attempt) {
                run.learned_patterns.push(pattern);
            }
            run.state.reflection_hint = None;
            run.history_floor = run.state.action_history.len();

            let Some(plan) = run.state.plan.as_mut() else {
                return;
            };
            if !completed {
                let reason = last_result
                    .failure_reason
                    .unwrap_or_else(|| "success criterion not met".to_string());
                if let Some(current) = plan.current_mut() {
                    current.fail(reason.clone());
                }
                run.state.fail(format!("subtask {} failed: {reason}", subtask.id));
                return;
            }
            if !plan.advance() {
                tracing::info!(progress = %plan.progress(), "all subtasks completed");
                run.state.complete();
                return;
            }
        }
    }

    /// Checks loop limits, runs one step, and feeds the failure counter.
    async fn guarded_step(&mut self, run: &mut Run) -> StepOutcome {
        if let Some(reason) = run.control.should_stop(run.state.step) {
            run.state.fail(reason.message());
            return StepOutcome::Aborted;
        }
        let outcome = self.step(run).await;
        match outcome {
            StepOutcome::Progress | StepOutcome::Done => run.control.record_success(),
            StepOutcome::Failed => run.control.record_failure(),
            StepOutcome::Annotated | StepOutcome::Aborted => {}
        }
        if run.state.failed {
            return StepOutcome::Aborted;
        }
        if !matches!(outcome, StepOutcome::Done) {
            run.state.set_status(AgentStatus::Planning);
        }
        outcome
    }

    async fn snapshot(&self) -> Arc<ElementTree> {
        match &self.accessibility {
            Some(source) => self.tree_cache.get(source.as_ref()).await,
            None => Arc::new(ElementTree::new()),
        }
    }

    async fn step(&mut self, run: &mut Run) -> StepOutcome {
        run.state.step += 1;
        run.state.recovery_attempts = 0;
        self.recovery.reset_attempt_counts();
        let step = run.state.step;
        run.state.set_status(AgentStatus::Planning);

        let screenshot = match self.capture.capture().await {
            Ok(shot) => shot,
            Err(e) => return self.step_failed(run, "capture", &e),
        };
        let tree = self.snapshot().await;
        let screen = screenshot.size();

        // The model sees the numbered overlay while marks are live.
        let planning_shot = match run.state.marks.current() {
            Some(marks) if !marks.is_empty() => self.annotator.render(&screenshot, marks).unwrap_or_else(|e| {
                tracing::warn!(error = %e, "mark overlay failed; planning on raw screenshot");
                screenshot.clone()
            }),
            _ => screenshot.clone(),
        };

        let proposal = {
            let elements = tree.to_text_representation(MAX_PROMPT_ELEMENTS);
            let marks = run.state.marks.current().filter(|m| !m.is_empty()).map(|m| m.describe());
            let subtask = run.state.plan.as_ref().map(subtask_context);
            let memory = run.memory.as_mut().map(|m| {
                m.cached_elements = self.element_cache.snapshot();
                m.format_for_prompt()
            });
            let skills = self.skills.describe_for_planner();
            let window = self.config.reflection.action_window.max(1);
            let visible = &run.state.action_history[run.history_floor.min(run.state.action_history.len())..];
            let history = &visible[visible.len().saturating_sub(window)..];
            let ctx = PlanningContext {
                task: &run.state.task,
                subtask: subtask.as_deref(),
                history,
                elements: &elements,
                marks: marks.as_deref(),
                reflection_hint: run.state.reflection_hint.as_deref(),
                memory: memory.as_deref(),
                skills: &skills,
                screen,
            };
            self.planner.propose(&planning_shot, &ctx).await
        };
        let proposal = match proposal {
            Ok((proposal, reply)) => {
                run.log(EntryKind::Model, reply);
                proposal
            }
            Err(e) => return self.step_failed(run, "plan", &e),
        };
        tracing::info!(step, action = %proposal.summary(), reasoning = %proposal.reasoning, "action proposed");

        match proposal.kind {
            ActionKind::Done => {
                run.log(EntryKind::Action, "done");
                return StepOutcome::Done;
            }
            ActionKind::Annotate => return self.annotate(run, &screenshot, &tree).await,
            ActionKind::UseSkill => return self.use_skill(run, &proposal).await,
            _ => {}
        }

        let action = match self.resolve(run, &proposal, &tree, screen) {
            Ok(action) => action,
            Err(e) => return self.step_failed(run, &proposal.summary(), &e),
        };
        let target = proposal.kind.needs_target().then_some(&proposal.target);
        let mark = proposal.mark_id.filter(|_| proposal.kind == ActionKind::ClickMark);
        self.execute_and_verify(run, action, target, mark).await
    }

    /// Planning-phase failure: logged and recorded, no recovery.
    fn step_failed(&self, run: &mut Run, what: &str, error: &PilotError) -> StepOutcome {
        tracing::warn!(step = run.state.step, what, error = %error, "step failed before dispatch");
        run.state.last_error = Some(error.to_string());
        run.record_error(ErrorEvent::new(ErrorKind::Unknown, what).with_context("error", error.to_string()));
        StepOutcome::Failed
    }

    async fn annotate(&self, run: &mut Run, screenshot: &Screenshot, tree: &ElementTree) -> StepOutcome {
        let elements = self.detector.detect(tree).await;
        let marks = self.annotator.annotate(screenshot.size(), elements);
        tracing::info!(step = run.state.step, marks = marks.len(), "screen annotated");
        run.log(EntryKind::Action, format!("annotate ({} marks)", marks.len()));
        run.state.marks.install(marks);
        StepOutcome::Annotated
    }

    fn locate(&self, target: &ElementDescription, tree: &ElementTree, screen: (u32, u32)) -> Option<Located> {
        let result = self.grounder.ground_cached(target, tree, screen, &self.element_cache);
        let trusted = result.success() || result.match_method == METHOD_CACHE;
        if let Some(point) = result.coordinates.filter(|_| trusted) {
            tracing::debug!(
                target_desc = %target.label(),
                element = result.element_name().unwrap_or("-"),
                candidates = result.candidates.len(),
                "target grounded"
            );
            return Some(Located {
                point,
                confidence: result.confidence,
                method: result.match_method,
            });
        }
        target.approximate_coords.map(|point| {
            tracing::warn!(target_desc = %target.label(), %point, "grounding failed; using model coordinates");
            Located {
                point,
                confidence: 0.0,
                method: "raw_coordinates".to_string(),
            }
        })
    }

    fn resolve(
        &self,
        run: &Run,
        proposal: &ProposedAction,
        tree: &ElementTree,
        screen: (u32, u32),
    ) -> PilotResult<Action> {
        let located = || {
            let l = self.locate(&proposal.target, tree, screen).ok_or_else(|| {
                PilotError::Grounding(format!("could not locate {}", proposal.target.label()))
            })?;
            tracing::debug!(confidence = l.confidence, method = %l.method, point = %l.point, "target located");
            Ok::<Point, PilotError>(l.point)
        };
        let action = match proposal.kind {
            ActionKind::Click => Action::Click { point: located()? },
            ActionKind::DoubleClick => Action::DoubleClick { point: located()? },
            ActionKind::RightClick => Action::RightClick { point: located()? },
            ActionKind::Move => Action::Move { point: located()? },
            ActionKind::ClickMark => {
                let id = proposal
                    .mark_id
                    .ok_or_else(|| PilotError::Planning("click_mark without mark_id".into()))?;
                let mark = run.state.marks.resolve(id)?;
                tracing::debug!(id, name = %mark.name, "mark resolved");
                Action::Click { point: mark.center() }
            }
            ActionKind::Type => Action::Type {
                text: proposal.text.clone().unwrap_or_default(),
            },
            ActionKind::Hotkey => Action::Hotkey {
                keys: proposal.keys.clone(),
            },
            ActionKind::Scroll => {
                let point = if proposal.target.is_empty() {
                    None
                } else {
                    self.locate(&proposal.target, tree, screen).map(|l| l.point)
                };
                Action::Scroll {
                    amount: proposal.scroll_amount.unwrap_or(-3),
                    point,
                }
            }
            ActionKind::Wait => Action::Wait {
                duration_ms: proposal.duration_ms.unwrap_or(1000),
            },
            ActionKind::Done | ActionKind::Annotate | ActionKind::UseSkill => {
                return Err(PilotError::Planning(format!("{} has no direct action", proposal.kind)));
            }
        };
        Ok(action)
    }

    /// Sends one action to the input backend. State-changing actions drop
    /// the mark table first and expire the tree snapshot afterwards.
    async fn dispatch(&self, run: &mut Run, action: &Action) -> Result<(), String> {
        if action.is_state_changing() {
            run.state.marks.invalidate();
        }
        let result = self.input.execute(action).await;
        if action.is_state_changing() {
            self.tree_cache.invalidate();
        }
        run.state.record_action(action.to_string());
        run.log(EntryKind::Action, action.to_string());
        match result {
            Ok(true) => Ok(()),
            Ok(false) => Err(format!("input backend could not perform {action}")),
            Err(e) => Err(e.to_string()),
        }
    }

    async fn verify(&self, run: &mut Run, label: &str) -> Verification {
        run.state.set_status(AgentStatus::Verifying);
        tokio::time::sleep(Duration::from_millis(self.config.agent.settle_delay_ms)).await;
        if !self.config.agent.verify_each_step {
            return Verification::assumed_ok();
        }
        let goal = run.verify_goal();
        let verification = match self.capture.capture().await {
            Ok(shot) => self.verifier.verify_action(&shot, &goal, label).await,
            Err(e) => Err(e),
        };
        let verification = verification.unwrap_or_else(|e| {
            tracing::warn!(error = %e, "verification call failed");
            Verification::dispatch_failed(format!("verification unavailable: {e}"))
        });
        run.log(EntryKind::Verification, verification.observation.clone());
        run.state.last_verification = Some(verification.clone());
        verification
    }

    async fn dispatch_and_verify(&self, run: &mut Run, action: &Action) -> Verification {
        run.state.set_status(AgentStatus::Executing);
        match self.dispatch(run, action).await {
            Ok(()) => self.verify(run, &action.to_string()).await,
            Err(message) => {
                tracing::warn!(action = %action, error = %message, "dispatch failed");
                let verification = Verification::dispatch_failed(message);
                run.state.last_verification = Some(verification.clone());
                verification
            }
        }
    }

    fn settle_success(&self, run: &mut Run, verification: &Verification, action: &Action, target: Option<&ElementDescription>) -> StepOutcome {
        if let (Some(name), Some(point)) = (target.and_then(|t| t.name.as_deref()), action.point()) {
            self.element_cache.put(name, point);
        }
        run.state.last_error = None;
        if verification.task_completed {
            StepOutcome::Done
        } else {
            StepOutcome::Progress
        }
    }

    /// `mark` is the id a `click_mark` action was resolved from.
    async fn execute_and_verify(
        &mut self,
        run: &mut Run,
        action: Action,
        target: Option<&ElementDescription>,
        mark: Option<u32>,
    ) -> StepOutcome {
        let verification = self.dispatch_and_verify(run, &action).await;
        if !verification.has_issues() {
            return self.settle_success(run, &verification, &action, target);
        }
        self.recover(run, action, target, mark, verification).await
    }

    /// Bounded recovery for a failed action. Every attempt is recorded as an
    /// [`ErrorEvent`].
    async fn recover(
        &mut self,
        run: &mut Run,
        mut action: Action,
        target: Option<&ElementDescription>,
        mark: Option<u32>,
        mut verification: Verification,
    ) -> StepOutcome {
        run.state.set_status(AgentStatus::Recovering);
        loop {
            let kind = analyze_error(&action, &verification);
            let issue = verification.issue_text().to_string();
            tracing::info!(step = run.state.step, kind = %kind, issue = %issue, "action failed");

            if kind.is_terminal() {
                run.record_error(ErrorEvent::new(kind, action.to_string()).with_context("observation", issue.clone()));
                run.state.fail(format!("{kind}: {issue}"));
                return StepOutcome::Aborted;
            }
            let strategy = if self.recovery.can_recover(kind, run.state.recovery_attempts) {
                self.recovery
                    .get_recovery_strategy(kind, &action, run.state.recovery_attempts)
            } else {
                None
            };
            let Some(strategy) = strategy else {
                if run.state.recovery_attempts == 0 {
                    run.record_error(ErrorEvent::new(kind, action.to_string()).with_context("observation", issue.clone()));
                }
                run.state.last_error = Some(format!("{action} failed: {issue}"));
                return StepOutcome::Failed;
            };

            if strategy.pre_actions.iter().any(Action::is_state_changing) {
                run.state.marks.invalidate();
                self.tree_cache.invalidate();
            }
            self.recovery.execute_recovery(&strategy, self.input.as_ref()).await;
            run.state.recovery_attempts += 1;

            let mut event = ErrorEvent::new(kind, action.to_string()).with_context("observation", issue);
            event.recovery_attempted = true;
            event.strategy = Some(strategy.name.clone());

            if !strategy.retry_original {
                run.record_error(event);
                continue;
            }

            // A mark point is only valid while its table is live.
            if let Some(id) = mark {
                match run.state.marks.resolve(id) {
                    Ok(m) => action = action.retargeted(m.center()),
                    Err(e) => {
                        tracing::info!(id, error = %e, "mark expired; not retrying its point");
                        run.record_error(event.with_context("error", e.to_string()));
                        run.state.last_error = Some(format!("{action} failed: {e}"));
                        return StepOutcome::Failed;
                    }
                }
            }
            if let Some(target) = target {
                self.tree_cache.invalidate();
                let tree = self.snapshot().await;
                let screen = match self.capture.capture().await {
                    Ok(shot) => shot.size(),
                    Err(_) => (0, 0),
                };
                if let Some(located) = self.locate(target, &tree, screen) {
                    action = action.retargeted(located.point);
                }
            }
            tracing::info!(strategy = %strategy.name, action = %action, attempt = run.state.recovery_attempts, "retrying action");
            verification = self.dispatch_and_verify(run, &action).await;
            event.recovery_succeeded = !verification.has_issues();
            run.record_error(event);
            if !verification.has_issues() {
                tracing::info!(strategy = %strategy.name, "recovery succeeded");
                return self.settle_success(run, &verification, &action, target);
            }
            run.state.set_status(AgentStatus::Recovering);
        }
    }

    /// Expands a skill and dispatches its actions in order, then verifies the
    /// whole sequence once. Skill failures end the step without recovery.
    async fn use_skill(&mut self, run: &mut Run, proposal: &ProposedAction) -> StepOutcome {
        let name = proposal.skill.clone().unwrap_or_default();
        let actions = match self.skills.expand(&name, &proposal.params) {
            Ok(actions) => actions,
            Err(e) => return self.step_failed(run, &proposal.summary(), &e),
        };
        tracing::info!(step = run.state.step, skill = %name, actions = actions.len(), "running skill");
        run.state.set_status(AgentStatus::Executing);
        // Skills change the screen even when every step is a wait.
        run.state.marks.invalidate();

        let label = format!("use_skill {name}");
        for action in &actions {
            if let Err(message) = self.dispatch(run, action).await {
                let verification = Verification::dispatch_failed(message);
                return self.skill_failed(run, action, &label, verification);
            }
        }
        let verification = self.verify(run, &label).await;
        if verification.has_issues() {
            let last = actions.last().cloned().unwrap_or(Action::Done);
            return self.skill_failed(run, &last, &label, verification);
        }
        self.settle_success(run, &verification, &Action::Done, None)
    }

    fn skill_failed(&self, run: &mut Run, action: &Action, label: &str, verification: Verification) -> StepOutcome {
        let kind = analyze_error(action, &verification);
        let issue = verification.issue_text().to_string();
        run.record_error(ErrorEvent::new(kind, label).with_context("observation", issue.clone()));
        if kind.is_terminal() {
            run.state.fail(format!("{kind}: {issue}"));
            return StepOutcome::Aborted;
        }
        run.state.last_error = Some(format!("{label} failed: {issue}"));
        StepOutcome::Failed
    }

    fn finish(&self, mut run: Run) -> RunReport {
        if !run.state.is_finished() {
            run.state.fail("run ended without completion");
        }
        let report = run.state.report();
        let summary = RecoveryPlanner::summarize(&run.state.error_history);
        tracing::info!(
            success = report.success,
            steps = report.steps,
            errors = summary.total_errors,
            recovery_rate = summary.recovery_rate,
            elapsed_secs = run.started.elapsed().as_secs(),
            "run finished"
        );
        run.log(
            EntryKind::Outcome,
            if report.success { "completed" } else { report.last_error.as_deref().unwrap_or("failed") },
        );

        if let Some(memory) = &self.memory {
            let mut error_kinds: Vec<String> =
                run.state.error_history.iter().map(|e| e.kind.as_str().to_string()).collect();
            error_kinds.sort();
            error_kinds.dedup();
            let outcome = SessionOutcome {
                task: run.state.task.clone(),
                success: report.success,
                steps: report.steps,
                actions: run.state.action_history.clone(),
                duration_secs: run.started.elapsed().as_secs_f64(),
                learned_patterns: std::mem::take(&mut run.learned_patterns),
                error_kinds,
            };
            if let Err(e) = memory.record_session(outcome) {
                tracing::warn!(error = %e, "failed to save session to memory");
            }
        }
        report
    }
}
