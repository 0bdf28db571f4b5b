use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::errors::{PilotError, PilotResult};
use crate::executor::action::Action;
use crate::perception::types::Point;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkillParam {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Used when the caller omits the parameter. Without one the parameter
    /// is required.
    #[serde(default)]
    pub default: Option<String>,
}

impl SkillParam {
    pub fn required(name: &str, description: &str) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            default: None,
        }
    }

    pub fn optional(name: &str, description: &str, default: &str) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            default: Some(default.into()),
        }
    }
}

/// One templated step. Strings may reference parameters as `{name}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum SkillStep {
    Hotkey { keys: String },
    Type { text: String },
    Click { x: String, y: String },
    Wait { ms: u64 },
    /// Presses the combo mapped to the parameter's value.
    Choose {
        param: String,
        options: HashMap<String, String>,
    },
    /// Runs `steps` only when the parameter is truthy.
    When { param: String, steps: Vec<SkillStep> },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Skill {
    pub name: String,
    pub description: String,
    #[serde(default)]
    pub params: Vec<SkillParam>,
    pub steps: Vec<SkillStep>,
}

fn substitute(template: &str, values: &HashMap<String, String>) -> PilotResult<String> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        let Some(close) = after.find('}') else {
            out.push_str(&rest[open..]);
            return Ok(out);
        };
        let key = &after[..close];
        let value = values
            .get(key)
            .ok_or_else(|| PilotError::Skills(format!("template references unknown parameter '{key}'")))?;
        out.push_str(value);
        rest = &after[close + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

fn truthy(value: &str) -> bool {
    matches!(value.trim().to_lowercase().as_str(), "true" | "yes" | "1" | "on")
}

fn coordinate(template: &str, values: &HashMap<String, String>) -> PilotResult<i32> {
    let raw = substitute(template, values)?;
    raw.trim()
        .parse::<f64>()
        .map(|v| v.round() as i32)
        .map_err(|_| PilotError::Skills(format!("'{raw}' is not a coordinate")))
}

impl Skill {
    /// Parameter values with defaults filled in. Missing required values are
    /// an error.
    fn bind(&self, given: &HashMap<String, String>) -> PilotResult<HashMap<String, String>> {
        let mut values = HashMap::new();
        for p in &self.params {
            let value = given
                .get(&p.name)
                .cloned()
                .or_else(|| p.default.clone())
                .ok_or_else(|| {
                    PilotError::Skills(format!("skill '{}' needs parameter '{}'", self.name, p.name))
                })?;
            values.insert(p.name.clone(), value);
        }
        Ok(values)
    }

    fn expand_steps(&self, steps: &[SkillStep], values: &HashMap<String, String>, out: &mut Vec<Action>) -> PilotResult<()> {
        for step in steps {
            match step {
                SkillStep::Hotkey { keys } => out.push(Action::hotkey(&substitute(keys, values)?)),
                SkillStep::Type { text } => out.push(Action::Type {
                    text: substitute(text, values)?,
                }),
                SkillStep::Click { x, y } => out.push(Action::Click {
                    point: Point::new(coordinate(x, values)?, coordinate(y, values)?),
                }),
                SkillStep::Wait { ms } => out.push(Action::Wait { duration_ms: *ms }),
                SkillStep::Choose { param, options } => {
                    let chosen = values.get(param).map(|v| v.trim().to_lowercase()).unwrap_or_default();
                    let combo = options.get(&chosen).ok_or_else(|| {
                        let mut allowed: Vec<&str> = options.keys().map(String::as_str).collect();
                        allowed.sort_unstable();
                        PilotError::Skills(format!(
                            "'{chosen}' is not a valid {param} for skill '{}' (expected one of {})",
                            self.name,
                            allowed.join(", ")
                        ))
                    })?;
                    out.push(Action::hotkey(combo));
                }
                SkillStep::When { param, steps } => {
                    if values.get(param).is_some_and(|v| truthy(v)) {
                        self.expand_steps(steps, values, out)?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Concrete actions for this skill with `params` applied.
    pub fn expand(&self, params: &HashMap<String, String>) -> PilotResult<Vec<Action>> {
        let values = self.bind(params)?;
        let mut actions = Vec::new();
        self.expand_steps(&self.steps, &values, &mut actions)?;
        Ok(actions)
    }

    /// One-line signature for planning prompts, e.g. `save_file(filename, dialog=save)`.
    pub fn signature(&self) -> String {
        let params: Vec<String> = self
            .params
            .iter()
            .map(|p| match &p.default {
                Some(d) => format!("{}={d}", p.name),
                None => p.name.clone(),
            })
            .collect();
        format!("{}({})", self.name, params.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn substitution_and_unknown_reference() {
        let values = params(&[("name", "notes.txt")]);
        assert_eq!(substitute("save {name} now", &values).unwrap(), "save notes.txt now");
        assert_eq!(substitute("no braces", &values).unwrap(), "no braces");
        assert!(matches!(substitute("{missing}", &values), Err(PilotError::Skills(_))));
    }

    #[test]
    fn conditional_and_choice_steps() {
        let skill = Skill {
            name: "demo".into(),
            description: String::new(),
            params: vec![
                SkillParam::optional("mode", "", "a"),
                SkillParam::optional("extra", "", "false"),
            ],
            steps: vec![
                SkillStep::Choose {
                    param: "mode".into(),
                    options: HashMap::from([("a".into(), "ctrl+a".into()), ("b".into(), "ctrl+b".into())]),
                },
                SkillStep::When {
                    param: "extra".into(),
                    steps: vec![SkillStep::Wait { ms: 5 }],
                },
            ],
        };
        assert_eq!(skill.expand(&HashMap::new()).unwrap(), vec![Action::hotkey("ctrl+a")]);
        let both = skill.expand(&params(&[("mode", "B"), ("extra", "yes")])).unwrap();
        assert_eq!(both, vec![Action::hotkey("ctrl+b"), Action::Wait { duration_ms: 5 }]);
        assert!(skill.expand(&params(&[("mode", "c")])).is_err());
    }

    #[test]
    fn signature_lists_defaults() {
        let skill = Skill {
            name: "save_file".into(),
            description: String::new(),
            params: vec![
                SkillParam::required("filename", ""),
                SkillParam::optional("dialog", "", "save"),
            ],
            steps: Vec::new(),
        };
        assert_eq!(skill.signature(), "save_file(filename, dialog=save)");
    }
}
