use thiserror::Error;

#[derive(Debug, Error)]
pub enum TowerError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Probe failure: {0}")]
    Probe(String),

    #[error("No target found after {probes} probe(s)")]
    NoTargetFound { probes: usize },

    #[error("Agent error: {0}")]
    Agent(String),

    #[error("Library error: {0}")]
    Library(#[from] libloading::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML deserialize error: {0}")]
    TomlDe(#[from] toml::de::Error),
}

impl serde::Serialize for TowerError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::ser::Serializer,
    {
        serializer.serialize_str(self.to_string().as_str())
    }
}

pub type TowerResult<T> = Result<T, TowerError>;
