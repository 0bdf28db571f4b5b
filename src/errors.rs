use thiserror::Error;

#[derive(Debug, Error)]
pub enum PilotError {
    #[error("config: {0}")]
    Config(String),

    /// Transport or protocol failure talking to a model endpoint.
    #[error("model provider: {0}")]
    LlmProvider(String),

    #[error("event stream: {0}")]
    SseParsing(String),

    /// Screen capture or accessibility read failed.
    #[error("perception: {0}")]
    Perception(String),

    #[error("input: {0}")]
    Executor(String),

    #[error("grounding: {0}")]
    Grounding(String),

    /// The mark table is empty or was invalidated by a state-changing action.
    #[error("no marks available; annotate the screen first")]
    NoMarks,

    #[error("mark {id} does not exist ({available} marks available)")]
    UnknownMark { id: u32, available: usize },

    /// The model's proposal could not be turned into an action.
    #[error("planning: {0}")]
    Planning(String),

    #[error("skill: {0}")]
    Skills(String),

    #[error("memory store: {0}")]
    Memory(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("http: {0}")]
    Http(#[from] reqwest::Error),

    #[error("config parse: {0}")]
    TomlDe(#[from] toml::de::Error),

    #[error("config write: {0}")]
    TomlSer(#[from] toml::ser::Error),

    #[error("{0}")]
    Agent(String),
}

impl serde::Serialize for PilotError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::ser::Serializer,
    {
        serializer.collect_str(self)
    }
}

pub type PilotResult<T> = Result<T, PilotError>;
