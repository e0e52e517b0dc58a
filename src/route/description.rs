use serde::{Deserialize, Serialize};

/// Textual route description as produced by operator tooling.
///
/// ```yaml
/// version: 12
/// numbucket: 16
/// main:
///   - addr: 10.0.0.1:7900
///     buckets: [0, 1, 2, 3]
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RouteDescription {
    pub version: u64,
    pub numbucket: u32,
    #[serde(default)]
    pub main: Vec<ServerEntry>,
}

/// One storage node and the buckets it serves.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServerEntry {
    pub addr: String,
    #[serde(default)]
    pub buckets: Vec<u32>,
}

impl RouteDescription {
    pub fn from_yaml(text: &str) -> crate::core::Result<Self> {
        Ok(serde_yaml::from_str(text)?)
    }

    pub fn to_yaml(&self) -> crate::core::Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }
}
