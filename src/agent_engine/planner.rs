use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::{PilotError, PilotResult};
use crate::executor::action::split_hotkey;
use crate::grounding::description::ElementDescription;
use crate::llm::json::{extract_json_object, get_f64, get_string};
use crate::llm::vision::VisionModel;
use crate::perception::screenshot::Screenshot;

const PLANNING_SYSTEM: &str = "You operate a desktop computer one action at a time. \
Describe the control you want to act on; a separate locator finds its exact position. \
Never close windows you did not open. Reply with a single JSON object.";

/// Action kinds the model may propose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Click,
    DoubleClick,
    RightClick,
    Type,
    Hotkey,
    Scroll,
    Move,
    Wait,
    Done,
    /// Detect and number the interactive controls on screen.
    Annotate,
    ClickMark,
    UseSkill,
}

impl ActionKind {
    pub const ALL: [ActionKind; 12] = [
        ActionKind::Click,
        ActionKind::DoubleClick,
        ActionKind::RightClick,
        ActionKind::Type,
        ActionKind::Hotkey,
        ActionKind::Scroll,
        ActionKind::Move,
        ActionKind::Wait,
        ActionKind::Done,
        ActionKind::Annotate,
        ActionKind::ClickMark,
        ActionKind::UseSkill,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::Click => "click",
            ActionKind::DoubleClick => "double_click",
            ActionKind::RightClick => "right_click",
            ActionKind::Type => "type",
            ActionKind::Hotkey => "hotkey",
            ActionKind::Scroll => "scroll",
            ActionKind::Move => "move",
            ActionKind::Wait => "wait",
            ActionKind::Done => "done",
            ActionKind::Annotate => "annotate",
            ActionKind::ClickMark => "click_mark",
            ActionKind::UseSkill => "use_skill",
        }
    }

    pub fn parse(name: &str) -> PilotResult<Self> {
        let normalized = name.trim().to_lowercase().replace([' ', '-'], "_");
        Self::ALL
            .into_iter()
            .find(|k| k.as_str() == normalized)
            .ok_or_else(|| PilotError::Planning(format!("unknown action kind '{name}'")))
    }

    /// Kinds that act on a located control.
    pub fn needs_target(&self) -> bool {
        matches!(
            self,
            ActionKind::Click | ActionKind::DoubleClick | ActionKind::RightClick | ActionKind::Move
        )
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One action as the model proposed it, before grounding.
#[derive(Debug, Clone, PartialEq)]
pub struct ProposedAction {
    pub kind: ActionKind,
    pub target: ElementDescription,
    pub text: Option<String>,
    pub keys: Vec<String>,
    pub scroll_amount: Option<i32>,
    pub duration_ms: Option<u64>,
    pub mark_id: Option<u32>,
    pub skill: Option<String>,
    pub params: HashMap<String, String>,
    pub reasoning: String,
}

impl ProposedAction {
    pub fn new(kind: ActionKind) -> Self {
        Self {
            kind,
            target: ElementDescription::default(),
            text: None,
            keys: Vec::new(),
            scroll_amount: None,
            duration_ms: None,
            mark_id: None,
            skill: None,
            params: HashMap::new(),
            reasoning: String::new(),
        }
    }

    pub fn summary(&self) -> String {
        match self.kind {
            k if k.needs_target() => format!("{k} {}", self.target.label()),
            ActionKind::Type => format!("type \"{}\"", self.text.as_deref().unwrap_or_default()),
            ActionKind::Hotkey => format!("hotkey {}", self.keys.join("+")),
            ActionKind::ClickMark => format!("click_mark {}", self.mark_id.unwrap_or_default()),
            ActionKind::UseSkill => format!("use_skill {}", self.skill.as_deref().unwrap_or("?")),
            k => k.to_string(),
        }
    }
}

fn param_value(v: &Value) -> Option<String> {
    match v {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Parses the model's planning reply. A missing JSON object or an unknown
/// action kind is a planning error.
pub fn parse_proposal(reply: &str) -> PilotResult<ProposedAction> {
    let map = extract_json_object(reply)
        .ok_or_else(|| PilotError::Planning("no JSON object in planning reply".into()))?;
    let kind_name = get_string(&map, "action")
        .or_else(|| get_string(&map, "action_type"))
        .ok_or_else(|| PilotError::Planning("planning reply has no action".into()))?;
    let mut proposal = ProposedAction::new(ActionKind::parse(&kind_name)?);

    proposal.target = match map.get("target").or_else(|| map.get("element")) {
        Some(v) => ElementDescription::from_json(v),
        None => ElementDescription::default(),
    };
    proposal.text = map.get("text").and_then(Value::as_str).map(str::to_string);
    proposal.keys = match map.get("keys") {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(Value::as_str)
            .map(|k| k.trim().to_lowercase())
            .filter(|k| !k.is_empty())
            .collect(),
        Some(Value::String(combo)) => split_hotkey(combo),
        _ => Vec::new(),
    };
    proposal.scroll_amount = get_f64(&map, "scroll_amount")
        .or_else(|| get_f64(&map, "amount"))
        .map(|v| v.round() as i32);
    proposal.duration_ms = get_f64(&map, "duration_ms")
        .map(|v| v.max(0.0) as u64)
        .or_else(|| get_f64(&map, "duration").map(|secs| (secs.max(0.0) * 1000.0) as u64));
    proposal.mark_id = get_f64(&map, "mark_id")
        .or_else(|| get_f64(&map, "mark"))
        .filter(|v| *v >= 0.0)
        .map(|v| v as u32);
    proposal.skill = get_string(&map, "skill");
    if let Some(Value::Object(params)) = map.get("params") {
        proposal.params = params
            .iter()
            .filter_map(|(k, v)| Some((k.clone(), param_value(v)?)))
            .collect();
    }
    proposal.reasoning = get_string(&map, "reasoning").unwrap_or_default();

    match proposal.kind {
        ActionKind::Type if proposal.text.is_none() => {
            return Err(PilotError::Planning("type action without text".into()));
        }
        ActionKind::Hotkey if proposal.keys.is_empty() => {
            return Err(PilotError::Planning("hotkey action without keys".into()));
        }
        ActionKind::ClickMark if proposal.mark_id.is_none() => {
            return Err(PilotError::Planning("click_mark action without mark_id".into()));
        }
        ActionKind::UseSkill if proposal.skill.is_none() => {
            return Err(PilotError::Planning("use_skill action without skill".into()));
        }
        k if k.needs_target() && proposal.target.is_empty() => {
            return Err(PilotError::Planning(format!("{k} action without target")));
        }
        _ => {}
    }
    Ok(proposal)
}

/// Everything the planning prompt is built from.
#[derive(Debug, Default)]
pub struct PlanningContext<'a> {
    pub task: &'a str,
    pub subtask: Option<&'a str>,
    pub history: &'a [String],
    pub elements: &'a str,
    pub marks: Option<&'a str>,
    pub reflection_hint: Option<&'a str>,
    pub memory: Option<&'a str>,
    pub skills: &'a str,
    pub screen: (u32, u32),
}

pub fn build_prompt(ctx: &PlanningContext<'_>) -> String {
    let mut sections = vec![format!("TASK: {}", ctx.task)];
    if let Some(sub) = ctx.subtask.filter(|s| !s.is_empty()) {
        sections.push(sub.to_string());
    }
    if let Some(hint) = ctx.reflection_hint {
        sections.push(format!("PREVIOUS ATTEMPT FAILED. TRY THIS INSTEAD:\n{hint}"));
    }
    if let Some(memory) = ctx.memory.filter(|m| !m.is_empty()) {
        sections.push(memory.to_string());
    }
    sections.push(if ctx.history.is_empty() {
        "RECENT ACTIONS: none yet".to_string()
    } else {
        let lines: Vec<String> = ctx
            .history
            .iter()
            .enumerate()
            .map(|(i, a)| format!("  {}. {a}", i + 1))
            .collect();
        format!("RECENT ACTIONS:\n{}", lines.join("\n"))
    });
    sections.push(format!("SCREEN: {}x{} pixels", ctx.screen.0, ctx.screen.1));
    sections.push(if ctx.elements.is_empty() {
        "UI ELEMENTS: none detected".to_string()
    } else {
        format!("UI ELEMENTS:\n{}", ctx.elements)
    });
    if let Some(marks) = ctx.marks {
        sections.push(format!("NUMBERED MARKS (use click_mark with mark_id):\n{marks}"));
    }
    if !ctx.skills.is_empty() {
        sections.push(ctx.skills.trim_end().to_string());
    }
    sections.push(
        "Choose the single next action. Reply with JSON only:\n\
         {\"action\": \"click|double_click|right_click|type|hotkey|scroll|move|wait|done|annotate|click_mark|use_skill\",\n \
         \"target\": {\"name\": \"...\", \"type\": \"button|edit|...\", \"text\": \"...\", \"parent\": \"...\", \
         \"position\": \"...\", \"approximate_coordinates\": [x, y]},\n \
         \"text\": \"for type\", \"keys\": [\"ctrl\", \"s\"], \"scroll_amount\": 3, \"duration_ms\": 500,\n \
         \"mark_id\": 1, \"skill\": \"name\", \"params\": {}, \"reasoning\": \"why\"}"
            .to_string(),
    );
    sections.join("\n\n")
}

/// Asks the model for the next action.
pub struct ActionPlanner {
    model: Arc<dyn VisionModel>,
}

impl ActionPlanner {
    pub fn new(model: Arc<dyn VisionModel>) -> Self {
        Self { model }
    }

    /// Returns the parsed proposal and the raw reply.
    pub async fn propose(&self, screenshot: &Screenshot, ctx: &PlanningContext<'_>) -> PilotResult<(ProposedAction, String)> {
        let prompt = build_prompt(ctx);
        let reply = self.model.analyze(screenshot, &prompt, PLANNING_SYSTEM).await?;
        tracing::debug!(reply = %reply.chars().take(200).collect::<String>(), "planning reply");
        let proposal = parse_proposal(&reply)?;
        Ok((proposal, reply))
    }
}
