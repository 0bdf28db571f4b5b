use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use screen_pilot::agent_engine::{AgentStatus, Engine, StopHandle, SubtaskStatus};
use screen_pilot::config::AppConfig;
use screen_pilot::errors::{PilotError, PilotResult};
use screen_pilot::executor::{Action, InputExecutor};
use screen_pilot::llm::VisionModel;
use screen_pilot::memory::{JsonMemoryStore, MemoryStore};
use screen_pilot::perception::screenshot::Screenshot;
use screen_pilot::perception::traits::{AccessibilitySource, ScreenCapture};
use screen_pilot::perception::types::{BoundingRect, ControlType, ElementTree, Point, UIElement};
use screen_pilot::recovery::ErrorKind;
use screen_pilot::skills::SkillRegistry;

const DONE: &str = r#"{"action": "done", "reasoning": "finished"}"#;
const VERIFY_OK: &str = r#"{"action_successful": true, "task_completed": false, "observation": "as expected", "issues": null}"#;

struct BlankScreen;

#[async_trait]
impl ScreenCapture for BlankScreen {
    async fn capture(&self) -> PilotResult<Screenshot> {
        Screenshot::blank(400, 300)
    }
}

/// Small enough that a 120px miss is too far to score spatially.
struct TinyScreen;

#[async_trait]
impl ScreenCapture for TinyScreen {
    async fn capture(&self) -> PilotResult<Screenshot> {
        Screenshot::blank(200, 150)
    }
}

struct EditorWindow;

#[async_trait]
impl AccessibilitySource for EditorWindow {
    async fn get_element_tree(&self) -> PilotResult<ElementTree> {
        let mut tree = ElementTree::new();
        let win = tree.push(
            None,
            UIElement::new("Untitled - Editor", ControlType::Window, Some(BoundingRect::new(0, 0, 400, 300))),
        );
        tree.push(
            Some(win),
            UIElement::new("Save", ControlType::Button, Some(BoundingRect::new(100, 200, 140, 220))),
        );
        Ok(tree)
    }
}

/// Records every action; optionally trips a stop handle on the first one.
#[derive(Default)]
struct RecordingInput {
    actions: Mutex<Vec<Action>>,
    stop_on_first: Option<StopHandle>,
}

impl RecordingInput {
    fn actions(&self) -> Vec<Action> {
        self.actions.lock().unwrap().clone()
    }
}

#[async_trait]
impl InputExecutor for RecordingInput {
    async fn execute(&self, action: &Action) -> PilotResult<bool> {
        self.actions.lock().unwrap().push(action.clone());
        if let Some(stop) = &self.stop_on_first {
            stop.stop();
        }
        Ok(true)
    }
}

/// Answers each prompt family from its own queue. Planning falls back to
/// `done`, verification to success, subtask checks to complete.
#[derive(Default)]
struct ScriptedModel {
    plans: Mutex<VecDeque<&'static str>>,
    verifications: Mutex<VecDeque<&'static str>>,
    verify_default: Option<&'static str>,
    subtask_checks: Mutex<VecDeque<&'static str>>,
    reflections: Mutex<VecDeque<&'static str>>,
    decomposition: Option<&'static str>,
    planning_prompts: Mutex<Vec<String>>,
}

impl ScriptedModel {
    fn pop(queue: &Mutex<VecDeque<&'static str>>, fallback: &'static str) -> String {
        queue.lock().unwrap().pop_front().unwrap_or(fallback).to_string()
    }

    fn with_plans(plans: &[&'static str]) -> Self {
        Self {
            plans: Mutex::new(plans.iter().copied().collect()),
            ..Self::default()
        }
    }
}

#[async_trait]
impl VisionModel for ScriptedModel {
    async fn analyze(&self, _screenshot: &Screenshot, prompt: &str, _system: &str) -> PilotResult<String> {
        if prompt.starts_with("TASK:") {
            self.planning_prompts.lock().unwrap().push(prompt.to_string());
            return Ok(Self::pop(&self.plans, DONE));
        }
        if prompt.starts_with("Task:") {
            return Ok(Self::pop(&self.verifications, self.verify_default.unwrap_or(VERIFY_OK)));
        }
        if prompt.starts_with("Check whether this subtask") {
            return Ok(Self::pop(
                &self.subtask_checks,
                r#"{"subtask_completed": true, "confidence": 0.9, "observation": "done"}"#,
            ));
        }
        if prompt.starts_with("A subtask failed") {
            return Ok(Self::pop(
                &self.reflections,
                r#"{"should_retry": true, "suggested_approach": "try again", "confidence": 0.5}"#,
            ));
        }
        if prompt.starts_with("Decide whether") {
            return self
                .decomposition
                .map(str::to_string)
                .ok_or_else(|| PilotError::LlmProvider("no plan scripted".into()));
        }
        Err(PilotError::LlmProvider(format!("unexpected prompt: {}", &prompt[..prompt.len().min(40)])))
    }

    async fn reason(&self, prompt: &str, system: &str) -> PilotResult<String> {
        let shot = Screenshot::blank(1, 1)?;
        self.analyze(&shot, prompt, system).await
    }
}

fn test_config() -> AppConfig {
    let mut config = AppConfig::default();
    config.agent.settle_delay_ms = 0;
    config.agent.enable_task_planning = false;
    config.agent.max_steps = 10;
    config.memory.enabled = false;
    config
}

fn engine(config: AppConfig, model: Arc<ScriptedModel>, input: Arc<RecordingInput>) -> Engine {
    Engine::new(config, Arc::new(BlankScreen), input, model).with_accessibility(Arc::new(EditorWindow))
}

#[tokio::test]
async fn second_subtask_failing_after_retries_fails_the_run() {
    let mut config = test_config();
    config.agent.enable_task_planning = true;
    config.reflection.max_retries = 2;
    let model = Arc::new(ScriptedModel {
        decomposition: Some(
            r#"{"needs_decomposition": true, "subtasks": [
                {"id": "1", "description": "open the editor", "success_criteria": "editor visible"},
                {"id": "2", "description": "type the greeting", "success_criteria": "greeting visible"},
                {"id": "3", "description": "save the file", "success_criteria": "title has no asterisk"}
            ]}"#,
        ),
        subtask_checks: Mutex::new(VecDeque::from([
            r#"{"subtask_completed": true, "confidence": 0.9, "observation": "editor open"}"#,
            r#"{"subtask_completed": false, "confidence": 0.2, "failure_reason": "no text typed"}"#,
            r#"{"subtask_completed": false, "confidence": 0.2, "failure_reason": "still no text"}"#,
            r#"{"subtask_completed": false, "confidence": 0.1, "failure_reason": "field not focused"}"#,
        ])),
        reflections: Mutex::new(VecDeque::from([
            r#"{"should_retry": true, "suggested_approach": "click the text area first", "confidence": 0.6}"#,
            r#"{"should_retry": true, "suggested_approach": "use the keyboard", "confidence": 0.5}"#,
        ])),
        ..ScriptedModel::default()
    });
    let input = Arc::new(RecordingInput::default());
    let mut engine = engine(config, Arc::clone(&model), input);

    let report = engine.run("open the editor then type hello and save the file").await;

    assert!(!report.success);
    assert_eq!(report.status, AgentStatus::Failed);
    let plan = report.plan.expect("plan kept in report");
    assert_eq!(
        plan.statuses(),
        vec![SubtaskStatus::Completed, SubtaskStatus::Failed, SubtaskStatus::Pending]
    );
    assert_eq!(plan.subtasks[1].error_message.as_deref(), Some("field not focused"));
    assert!(report.last_error.unwrap().starts_with("subtask 2 failed"));
    // one step for the first subtask, three attempts of one step for the second
    assert_eq!(report.steps, 4);

    let prompts = model.planning_prompts.lock().unwrap();
    assert!(prompts[2].contains("TRY THIS INSTEAD:\nclick the text area first"));
    assert!(prompts[3].contains("TRY THIS INSTEAD:\nuse the keyboard"));
    assert!(prompts[1].contains("CURRENT SUBTASK (1/3)"));
}

#[tokio::test]
async fn marks_are_single_use_after_a_click() {
    let model = Arc::new(ScriptedModel::with_plans(&[
        r#"{"action": "annotate"}"#,
        r#"{"action": "click_mark", "mark_id": 1}"#,
        r#"{"action": "click_mark", "mark_id": 1}"#,
    ]));
    let input = Arc::new(RecordingInput::default());
    let mut engine = engine(test_config(), Arc::clone(&model), Arc::clone(&input));

    let report = engine.run("press save").await;

    assert!(report.success);
    assert_eq!(input.actions(), vec![Action::Click { point: Point::new(120, 210) }]);
    assert_eq!(report.error_history.len(), 1);
    let event = &report.error_history[0];
    assert_eq!(event.kind, ErrorKind::Unknown);
    assert!(!event.recovery_attempted);
    assert!(event.context["error"].to_lowercase().contains("no marks"));

    let prompts = model.planning_prompts.lock().unwrap();
    assert!(prompts[1].contains("NUMBERED MARKS"));
    assert!(!prompts[2].contains("NUMBERED MARKS"));
}

#[tokio::test]
async fn recovery_stops_at_the_attempt_ceiling() {
    let mut config = test_config();
    config.agent.max_steps = 1;
    let model = Arc::new(ScriptedModel {
        plans: Mutex::new(VecDeque::from([
            r#"{"action": "click", "target": {"name": "Save", "type": "button"}}"#,
        ])),
        verify_default: Some(
            r#"{"action_successful": false, "task_completed": false, "observation": "a dialog", "issues": "popup blocking view"}"#,
        ),
        ..ScriptedModel::default()
    });
    let input = Arc::new(RecordingInput::default());
    let mut engine = engine(config, model, Arc::clone(&input));

    let report = engine.run("press save").await;

    assert!(!report.success);
    assert_eq!(report.last_error.as_deref(), Some("step budget of 1 exhausted"));
    let strategies: Vec<&str> = report
        .error_history
        .iter()
        .map(|e| e.strategy.as_deref().unwrap_or("-"))
        .collect();
    assert_eq!(strategies, vec!["dismiss_with_escape", "click_outside", "dismiss_with_escape"]);
    assert!(report.error_history.iter().all(|e| e.kind == ErrorKind::PopupBlocked));
    assert!(report.error_history.iter().all(|e| e.recovery_attempted && !e.recovery_succeeded));

    let actions = input.actions();
    assert_eq!(actions.len(), 7);
    let save = Action::Click { point: Point::new(120, 210) };
    assert_eq!(actions.iter().filter(|a| **a == save).count(), 4);
    assert_eq!(actions.iter().filter(|a| **a == Action::hotkey("escape")).count(), 2);
}

#[tokio::test]
async fn permission_denied_ends_the_run() {
    let model = Arc::new(ScriptedModel {
        plans: Mutex::new(VecDeque::from([r#"{"action": "hotkey", "keys": "ctrl+s"}"#])),
        verify_default: Some(
            r#"{"action_successful": false, "observation": "access denied dialog", "error_type": "permission_denied"}"#,
        ),
        ..ScriptedModel::default()
    });
    let input = Arc::new(RecordingInput::default());
    let mut engine = engine(test_config(), model, Arc::clone(&input));

    let report = engine.run("save").await;

    assert!(!report.success);
    assert_eq!(report.steps, 1);
    assert_eq!(input.actions().len(), 1);
    assert_eq!(report.error_history.len(), 1);
    assert_eq!(report.error_history[0].kind, ErrorKind::PermissionDenied);
    assert!(!report.error_history[0].recovery_attempted);
}

#[tokio::test]
async fn stop_handle_halts_at_the_next_step() {
    let model = Arc::new(ScriptedModel::with_plans(&[
        r#"{"action": "hotkey", "keys": "ctrl+s"}"#,
        r#"{"action": "hotkey", "keys": "ctrl+s"}"#,
        r#"{"action": "hotkey", "keys": "ctrl+s"}"#,
    ]));
    let stop = StopHandle::new();
    let input = Arc::new(RecordingInput {
        stop_on_first: Some(stop.clone()),
        ..RecordingInput::default()
    });
    let mut engine = engine(test_config(), model, Arc::clone(&input)).with_stop_handle(stop);

    let report = engine.run("save repeatedly").await;

    assert!(!report.success);
    assert_eq!(report.steps, 1);
    assert_eq!(report.last_error.as_deref(), Some("stopped by user"));
    assert_eq!(input.actions().len(), 1);
}

#[tokio::test]
async fn grounded_click_is_cached_and_session_remembered() {
    let model = Arc::new(ScriptedModel::with_plans(&[
        r#"{"action": "click", "target": {"name": "Save", "type": "button"}}"#,
    ]));
    let input = Arc::new(RecordingInput::default());
    let memory = Arc::new(JsonMemoryStore::in_memory());
    let mut engine = engine(test_config(), model, Arc::clone(&input)).with_memory(Arc::clone(&memory) as Arc<dyn MemoryStore>);

    let report = engine.run("press save").await;

    assert!(report.success);
    assert_eq!(report.steps, 2);
    assert_eq!(engine.element_cache().get("save"), Some(Point::new(120, 210)));
    assert_eq!(memory.len(), 1);
    let similar = memory.similar_tasks("press save", 1);
    assert_eq!(similar[0].actions, vec!["click at (120, 210)"]);
}

#[tokio::test]
async fn skills_expand_into_actions() {
    let model = Arc::new(ScriptedModel::with_plans(&[
        r#"{"action": "use_skill", "skill": "type_and_enter", "params": {"text": "hello"}}"#,
    ]));
    let input = Arc::new(RecordingInput::default());
    let mut engine = engine(test_config(), model, Arc::clone(&input)).with_skills(SkillRegistry::with_builtins());

    let report = engine.run("search hello").await;

    assert!(report.success);
    let actions = input.actions();
    assert_eq!(actions.first(), Some(&Action::Type { text: "hello".into() }));
    assert_eq!(actions.last(), Some(&Action::hotkey("enter")));
}

#[tokio::test]
async fn failed_mark_click_is_not_retried_at_the_old_point() {
    let model = Arc::new(ScriptedModel {
        plans: Mutex::new(VecDeque::from([
            r#"{"action": "annotate"}"#,
            r#"{"action": "click_mark", "mark_id": 1}"#,
        ])),
        verifications: Mutex::new(VecDeque::from([
            r#"{"action_successful": false, "observation": "nothing happened", "issues": "target not found"}"#,
        ])),
        ..ScriptedModel::default()
    });
    let input = Arc::new(RecordingInput::default());
    let mut engine = engine(test_config(), model, Arc::clone(&input));

    let report = engine.run("press save").await;

    assert!(report.success);
    let mark_point = Action::Click { point: Point::new(120, 210) };
    assert_eq!(input.actions(), vec![mark_point, Action::Wait { duration_ms: 1500 }]);
    assert_eq!(report.error_history.len(), 1);
    let event = &report.error_history[0];
    assert_eq!(event.kind, ErrorKind::ElementNotFound);
    assert_eq!(event.strategy.as_deref(), Some("wait_and_retry"));
    assert!(event.recovery_attempted && !event.recovery_succeeded);
    assert!(event.context["error"].contains("no marks"));
}

#[tokio::test]
async fn weak_spatial_match_uses_model_coordinates() {
    let model = Arc::new(ScriptedModel::with_plans(&[
        r#"{"action": "click", "target": {"name": "Publish", "approximate_coordinates": [120, 330]}}"#,
    ]));
    let input = Arc::new(RecordingInput::default());
    let mut engine = Engine::new(test_config(), Arc::new(TinyScreen), Arc::clone(&input) as Arc<dyn InputExecutor>, model)
        .with_accessibility(Arc::new(EditorWindow));

    let report = engine.run("publish the post").await;

    assert!(report.success);
    assert_eq!(input.actions(), vec![Action::Click { point: Point::new(120, 330) }]);
}
