//! # Task Step-List Configuration
//!
//! A task's `config` column holds an ordered list of steps. The canonical form
//! is TOML with one `[[step]]` table per step:
//!
//! ```toml
//! [[step]]
//! ServerID = "5f0c1a9e-8d3b-4c52-9a51-0f4f5a6e2d11"
//! Path = "/srv/app"
//! CMD = "git pull"
//! ```
//!
//! A JSON document `{"steps": [{"server_id": ..., "path": ..., "cmd": ...}]}`
//! is accepted as well.

use crate::error::{PlumberError, Result};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One configured step, validated
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskStep {
    pub agent_id: Uuid,
    pub path: String,
    pub command: String,
}

/// Parsed, validated step list
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskConfig {
    pub steps: Vec<TaskStep>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct TomlDocument {
    #[serde(default)]
    step: Vec<TomlStep>,
}

#[derive(Debug, Serialize, Deserialize)]
struct TomlStep {
    #[serde(rename = "ServerID")]
    server_id: String,
    #[serde(rename = "Path", default)]
    path: String,
    #[serde(rename = "CMD")]
    cmd: String,
}

#[derive(Debug, Deserialize)]
struct JsonDocument {
    #[serde(default)]
    steps: Vec<JsonStep>,
}

#[derive(Debug, Deserialize)]
struct JsonStep {
    server_id: String,
    #[serde(default)]
    path: String,
    cmd: String,
}

impl TaskConfig {
    /// Parse and validate a step-list document
    pub fn parse(raw: &str) -> Result<Self> {
        let trimmed = raw.trim();
        let raw_steps: Vec<(String, String, String)> = if trimmed.starts_with('{') {
            let doc: JsonDocument = serde_json::from_str(trimmed).map_err(|e| {
                PlumberError::validation(format!("failed to parse task config: {e}"))
            })?;
            doc.steps
                .into_iter()
                .map(|s| (s.server_id, s.path, s.cmd))
                .collect()
        } else {
            let doc: TomlDocument = toml::from_str(trimmed).map_err(|e| {
                PlumberError::validation(format!("failed to parse task config: {e}"))
            })?;
            doc.step
                .into_iter()
                .map(|s| (s.server_id, s.path, s.cmd))
                .collect()
        };

        if raw_steps.is_empty() {
            return Err(PlumberError::validation(
                "task config must define at least one step",
            ));
        }

        let steps = raw_steps
            .into_iter()
            .enumerate()
            .map(|(index, (server_id, path, cmd))| {
                let agent_id = Uuid::parse_str(server_id.trim()).map_err(|e| {
                    PlumberError::validation(format!(
                        "step {index}: invalid ServerID '{server_id}': {e}"
                    ))
                })?;
                if cmd.trim().is_empty() {
                    return Err(PlumberError::validation(format!(
                        "step {index}: CMD is required"
                    )));
                }
                Ok(TaskStep {
                    agent_id,
                    path,
                    command: cmd,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self { steps })
    }

    /// Render back to the canonical TOML form
    pub fn to_toml_string(&self) -> Result<String> {
        let doc = TomlDocument {
            step: self
                .steps
                .iter()
                .map(|s| TomlStep {
                    server_id: s.agent_id.to_string(),
                    path: s.path.clone(),
                    cmd: s.command.clone(),
                })
                .collect(),
        };
        toml::to_string(&doc)
            .map_err(|e| PlumberError::Internal(format!("failed to render task config: {e}")))
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const AGENT_A: &str = "5f0c1a9e-8d3b-4c52-9a51-0f4f5a6e2d11";
    const AGENT_B: &str = "0b7e3c52-1d2f-4e8a-b6a4-3c9d8e7f6a50";

    #[test]
    fn test_parse_toml_steps_in_order() {
        let raw = format!(
            r#"
            [[step]]
            ServerID = "{AGENT_A}"
            Path = "/srv/app"
            CMD = "git pull"

            [[step]]
            ServerID = "{AGENT_B}"
            CMD = "systemctl restart app"
            "#
        );

        let config = TaskConfig::parse(&raw).unwrap();
        assert_eq!(config.len(), 2);
        assert_eq!(config.steps[0].agent_id.to_string(), AGENT_A);
        assert_eq!(config.steps[0].path, "/srv/app");
        assert_eq!(config.steps[1].command, "systemctl restart app");
        assert_eq!(config.steps[1].path, "");
    }

    #[test]
    fn test_parse_json_document() {
        let raw = format!(
            r#"{{"steps":[{{"server_id":"{AGENT_A}","path":"/tmp","cmd":"ls"}}]}}"#
        );
        let config = TaskConfig::parse(&raw).unwrap();
        assert_eq!(config.steps[0].command, "ls");
    }

    #[test]
    fn test_rejects_invalid_documents() {
        assert!(matches!(
            TaskConfig::parse("this is not toml ["),
            Err(PlumberError::Validation(_))
        ));
        assert!(matches!(
            TaskConfig::parse(""),
            Err(PlumberError::Validation(_))
        ));

        let bad_id = "[[step]]\nServerID = \"not-a-uuid\"\nCMD = \"ls\"\n";
        let err = TaskConfig::parse(bad_id).unwrap_err();
        assert!(err.to_string().contains("step 0"));

        let empty_cmd = format!("[[step]]\nServerID = \"{AGENT_A}\"\nCMD = \"  \"\n");
        assert!(TaskConfig::parse(&empty_cmd).is_err());
    }

    #[test]
    fn test_toml_rendering_parses_back() {
        let config = TaskConfig {
            steps: vec![TaskStep {
                agent_id: Uuid::parse_str(AGENT_B).unwrap(),
                path: "/opt".to_string(),
                command: "make deploy".to_string(),
            }],
        };
        let rendered = config.to_toml_string().unwrap();
        assert!(rendered.contains("ServerID"));
        assert_eq!(TaskConfig::parse(&rendered).unwrap(), config);
    }
}
