use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use crate::errors::{PilotError, PilotResult};
use crate::executor::action::Action;
use crate::skills::types::{Skill, SkillParam, SkillStep};

/// Named skills available to the planner. Built once at startup and handed
/// to the engine.
#[derive(Debug, Clone, Default)]
pub struct SkillRegistry {
    skills: BTreeMap<String, Skill>,
}

fn step_hotkey(keys: &str) -> SkillStep {
    SkillStep::Hotkey { keys: keys.into() }
}

fn step_type(text: &str) -> SkillStep {
    SkillStep::Type { text: text.into() }
}

fn step_wait(ms: u64) -> SkillStep {
    SkillStep::Wait { ms }
}

fn builtin_skills() -> Vec<Skill> {
    vec![
        Skill {
            name: "open_application".into(),
            description: "Open an application through the system search".into(),
            params: vec![SkillParam::required("app_name", "application to launch, e.g. Notepad")],
            steps: vec![
                step_hotkey("win"),
                step_wait(500),
                step_type("{app_name}"),
                step_wait(800),
                step_hotkey("enter"),
                step_wait(1000),
            ],
        },
        Skill {
            name: "save_file".into(),
            description: "Save the current document under a file name".into(),
            params: vec![
                SkillParam::required("filename", "file name to type into the save dialog"),
                SkillParam::optional("dialog", "save or save_as", "save"),
            ],
            steps: vec![
                SkillStep::Choose {
                    param: "dialog".into(),
                    options: HashMap::from([
                        ("save".into(), "ctrl+s".into()),
                        ("save_as".into(), "ctrl+shift+s".into()),
                    ]),
                },
                step_wait(800),
                step_type("{filename}"),
                step_wait(300),
                step_hotkey("enter"),
            ],
        },
        Skill {
            name: "new_document".into(),
            description: "Create a blank document in the focused application".into(),
            params: vec![SkillParam::optional(
                "discard_changes",
                "answer 'no' to a save prompt",
                "true",
            )],
            steps: vec![
                step_hotkey("ctrl+n"),
                step_wait(500),
                SkillStep::When {
                    param: "discard_changes".into(),
                    steps: vec![step_hotkey("n"), step_wait(300)],
                },
            ],
        },
        Skill {
            name: "type_and_enter".into(),
            description: "Type text and press Enter, e.g. for searches".into(),
            params: vec![
                SkillParam::required("text", "text to type"),
                SkillParam::optional("clear_first", "select all before typing", "false"),
            ],
            steps: vec![
                SkillStep::When {
                    param: "clear_first".into(),
                    steps: vec![step_hotkey("ctrl+a"), step_wait(100)],
                },
                step_type("{text}"),
                step_wait(200),
                step_hotkey("enter"),
            ],
        },
        Skill {
            name: "confirm_dialog".into(),
            description: "Answer a confirmation dialog".into(),
            params: vec![SkillParam::required("choice", "yes, no, ok or cancel")],
            steps: vec![SkillStep::Choose {
                param: "choice".into(),
                options: HashMap::from([
                    ("yes".into(), "y".into()),
                    ("no".into(), "n".into()),
                    ("ok".into(), "enter".into()),
                    ("cancel".into(), "escape".into()),
                ]),
            }],
        },
        Skill {
            name: "copy_paste".into(),
            description: "Copy the selection and paste it at a screen position".into(),
            params: vec![
                SkillParam::required("target_x", "paste target x"),
                SkillParam::required("target_y", "paste target y"),
            ],
            steps: vec![
                step_hotkey("ctrl+c"),
                step_wait(200),
                SkillStep::Click {
                    x: "{target_x}".into(),
                    y: "{target_y}".into(),
                },
                step_wait(200),
                step_hotkey("ctrl+v"),
            ],
        },
        Skill {
            name: "navigate_to_url".into(),
            description: "Open a URL in the focused browser tab".into(),
            params: vec![SkillParam::required("url", "address to open")],
            steps: vec![
                step_hotkey("ctrl+l"),
                step_wait(300),
                step_type("{url}"),
                step_wait(200),
                step_hotkey("enter"),
                step_wait(1500),
            ],
        },
    ]
}

impl SkillRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        for skill in builtin_skills() {
            registry.register(skill);
        }
        registry
    }

    /// Replaces any skill with the same name.
    pub fn register(&mut self, skill: Skill) {
        if self.skills.insert(skill.name.clone(), skill).is_some() {
            tracing::debug!("skill overridden");
        }
    }

    pub fn get(&self, name: &str) -> Option<&Skill> {
        self.skills.get(name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.skills.keys().map(String::as_str).collect()
    }

    pub fn len(&self) -> usize {
        self.skills.len()
    }

    pub fn is_empty(&self) -> bool {
        self.skills.is_empty()
    }

    pub fn expand(&self, name: &str, params: &HashMap<String, String>) -> PilotResult<Vec<Action>> {
        let skill = self
            .get(name)
            .ok_or_else(|| PilotError::Skills(format!("unknown skill '{name}'")))?;
        let actions = skill.expand(params)?;
        tracing::debug!(skill = name, actions = actions.len(), "skill expanded");
        Ok(actions)
    }

    /// Skill list for the planning prompt.
    pub fn describe_for_planner(&self) -> String {
        if self.skills.is_empty() {
            return String::new();
        }
        let mut text = String::from("AVAILABLE SKILLS (use_skill with skill + params):\n");
        for skill in self.skills.values() {
            text.push_str(&format!("- {}: {}\n", skill.signature(), skill.description));
        }
        text
    }

    /// Loads every `*.toml` file under `dir` (recursively) as one skill.
    /// Unreadable files are logged and skipped. Returns how many loaded.
    pub async fn load_dir(&mut self, dir: &Path) -> PilotResult<usize> {
        if !dir.exists() {
            tracing::warn!(dir = %dir.display(), "skills directory does not exist");
            return Ok(0);
        }
        let mut entries = tokio::fs::read_dir(dir).await?;
        let mut loaded = 0;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.is_dir() {
                loaded += Box::pin(self.load_dir(&path)).await?;
            } else if path.extension().is_some_and(|ext| ext == "toml") {
                match Self::load_file(&path).await {
                    Ok(skill) => {
                        tracing::info!(skill = %skill.name, path = %path.display(), "loaded skill");
                        self.register(skill);
                        loaded += 1;
                    }
                    Err(e) => tracing::warn!(path = %path.display(), error = %e, "skipping skill file"),
                }
            }
        }
        Ok(loaded)
    }

    async fn load_file(path: &Path) -> PilotResult<Skill> {
        let content = tokio::fs::read_to_string(path).await?;
        let skill: Skill = toml::from_str(&content)?;
        if skill.name.trim().is_empty() {
            return Err(PilotError::Skills(format!("{} has no skill name", path.display())));
        }
        Ok(skill)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::perception::types::Point;

    fn params(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn builtins_are_registered() {
        let reg = SkillRegistry::with_builtins();
        for name in [
            "open_application",
            "save_file",
            "new_document",
            "type_and_enter",
            "confirm_dialog",
            "copy_paste",
            "navigate_to_url",
        ] {
            assert!(reg.get(name).is_some(), "{name}");
        }
        assert!(reg.describe_for_planner().contains("save_file(filename, dialog=save)"));
    }

    #[test]
    fn open_application_substitutes_name() {
        let reg = SkillRegistry::with_builtins();
        let actions = reg.expand("open_application", &params(&[("app_name", "Notepad")])).unwrap();
        assert_eq!(actions[0], Action::hotkey("win"));
        assert!(actions.contains(&Action::Type { text: "Notepad".into() }));
        assert_eq!(actions.last(), Some(&Action::Wait { duration_ms: 1000 }));
    }

    #[test]
    fn missing_parameter_is_an_error() {
        let reg = SkillRegistry::with_builtins();
        let err = reg.expand("save_file", &HashMap::new()).unwrap_err();
        assert!(err.to_string().contains("filename"));
        assert!(reg.expand("no_such_skill", &HashMap::new()).is_err());
    }

    #[test]
    fn copy_paste_clicks_target() {
        let reg = SkillRegistry::with_builtins();
        let actions = reg
            .expand("copy_paste", &params(&[("target_x", "120"), ("target_y", "48.6")]))
            .unwrap();
        assert!(actions.contains(&Action::Click { point: Point::new(120, 49) }));
    }

    #[test]
    fn confirm_dialog_maps_choice() {
        let reg = SkillRegistry::with_builtins();
        let actions = reg.expand("confirm_dialog", &params(&[("choice", "Cancel")])).unwrap();
        assert_eq!(actions, vec![Action::hotkey("escape")]);
    }

    #[tokio::test]
    async fn loads_skills_from_toml() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("office");
        std::fs::create_dir_all(&nested).unwrap();
        std::fs::write(
            nested.join("print.toml"),
            r#"
name = "print_document"
description = "Print the current document"

[[steps]]
op = "hotkey"
keys = "ctrl+p"

[[steps]]
op = "wait"
ms = 700

[[steps]]
op = "hotkey"
keys = "enter"
"#,
        )
        .unwrap();
        std::fs::write(dir.path().join("broken.toml"), "name = ").unwrap();
        std::fs::write(dir.path().join("notes.md"), "# ignored").unwrap();

        let mut reg = SkillRegistry::new();
        let loaded = reg.load_dir(dir.path()).await.unwrap();
        assert_eq!(loaded, 1);
        let actions = reg.expand("print_document", &HashMap::new()).unwrap();
        assert_eq!(actions.len(), 3);
        assert_eq!(actions[0], Action::hotkey("ctrl+p"));
    }
}
