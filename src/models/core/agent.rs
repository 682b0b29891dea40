use crate::state_machine::AgentStatus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// How the operator reaches the agent host over SSH
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SshAuthType {
    #[default]
    None,
    Password,
    Key,
}

impl SshAuthType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Password => "password",
            Self::Key => "key",
        }
    }
}

impl std::str::FromStr for SshAuthType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "" | "none" => Ok(Self::None),
            "password" => Ok(Self::Password),
            "key" => Ok(Self::Key),
            _ => Err(format!("Invalid ssh auth type: {s}")),
        }
    }
}

/// A remote execution node. Maps to the `plumber_agents` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Agent {
    pub id: Uuid,
    pub name: String,
    pub ssh_host: Option<String>,
    pub ssh_port: i32,
    pub ssh_user: Option<String>,
    pub ssh_auth_type: SshAuthType,
    #[serde(skip_serializing, default)]
    pub ssh_password: Option<String>,
    #[serde(skip_serializing, default)]
    pub ssh_private_key: Option<String>,
    /// Reported by the agent on registration
    pub hostname: Option<String>,
    pub ip: Option<String>,
    pub status: AgentStatus,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip)]
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Agent {
    pub fn is_online(&self) -> bool {
        self.status == AgentStatus::Online
    }

    /// True when the agent is online but has not been heard from since `cutoff`
    pub fn is_stale(&self, cutoff: DateTime<Utc>) -> bool {
        self.is_online() && self.last_heartbeat.is_some_and(|hb| hb < cutoff)
    }
}

/// Operator-declared agent (without generated fields)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewAgent {
    pub name: String,
    pub ssh_host: Option<String>,
    pub ssh_port: Option<i32>,
    pub ssh_user: Option<String>,
    pub ssh_auth_type: Option<SshAuthType>,
    pub ssh_password: Option<String>,
    pub ssh_private_key: Option<String>,
}

impl NewAgent {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub(crate) fn into_agent(self, now: DateTime<Utc>) -> Agent {
        Agent {
            id: Uuid::new_v4(),
            name: self.name,
            ssh_host: self.ssh_host,
            ssh_port: self.ssh_port.unwrap_or(22),
            ssh_user: self.ssh_user,
            ssh_auth_type: self.ssh_auth_type.unwrap_or_default(),
            ssh_password: self.ssh_password,
            ssh_private_key: self.ssh_private_key,
            hostname: None,
            ip: None,
            status: AgentStatus::Offline,
            last_heartbeat: None,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        }
    }
}
