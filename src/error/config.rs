//! Configuration load error types.

/// Errors that can occur while loading the JSON configuration file.
///
/// Per the fail-soft-at-load policy, callers log this and fall back to
/// `Config::default()` rather than propagating it further.
#[derive(Debug)]
pub enum ConfigError {
    /// The configuration file could not be read from disk.
    Io(std::io::Error),
    /// The configuration file's contents could not be parsed as JSON.
    Parse(serde_json::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(err) => write!(f, "error reading config: {}", err),
            Self::Parse(err) => write!(f, "error parsing config: {}", err),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err)
    }
}

impl From<serde_json::Error> for ConfigError {
    fn from(err: serde_json::Error) -> Self {
        Self::Parse(err)
    }
}
