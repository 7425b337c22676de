use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const DEFAULT_SSH_PORT: u16 = 22;
pub const DEFAULT_REMOTE_BIND_HOST: &str = "127.0.0.1";

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum RuleStatus {
    #[default]
    Stopped,
    Running,
    Error,
}

impl RuleStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuleStatus::Stopped => "stopped",
            RuleStatus::Running => "running",
            RuleStatus::Error => "error",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "stopped" => Some(RuleStatus::Stopped),
            "running" => Some(RuleStatus::Running),
            "error" => Some(RuleStatus::Error),
            _ => None,
        }
    }
}

impl std::fmt::Display for RuleStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AuthType {
    Password,
    Key,
}

impl AuthType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthType::Password => "password",
            AuthType::Key => "key",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "password" => Some(AuthType::Password),
            "key" => Some(AuthType::Key),
            _ => None,
        }
    }
}

/// Local listener relaying to `remote_host:remote_port`.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ForwardSpec {
    pub remote_host: String,
    pub remote_port: u16,
    pub local_port: u16,
}

impl ForwardSpec {
    pub fn new(remote_host: impl Into<String>, remote_port: u16, local_port: u16) -> Self {
        Self {
            remote_host: remote_host.into(),
            remote_port,
            local_port,
        }
    }

    pub fn derive_id(&self) -> String {
        format!("{}:{}->{}", self.remote_host, self.remote_port, self.local_port)
    }
}

/// Remote listener on the SSH server relaying back to `127.0.0.1:local_port`.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ReverseSpec {
    pub ssh_host: String,
    #[serde(default = "default_ssh_port")]
    pub ssh_port: u16,
    pub ssh_user: String,
    pub auth_type: AuthType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_key_path: Option<String>,
    #[serde(default = "default_remote_bind_host")]
    pub remote_bind_host: String,
    pub remote_port: u16,
    pub local_port: u16,
}

fn default_ssh_port() -> u16 {
    DEFAULT_SSH_PORT
}

fn default_remote_bind_host() -> String {
    DEFAULT_REMOTE_BIND_HOST.to_string()
}

impl ReverseSpec {
    pub fn derive_id(&self) -> String {
        format!("{}:{}<-{}", self.ssh_host, self.remote_port, self.local_port)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(tag = "type")]
pub enum RuleSpec {
    #[serde(rename = "forward")]
    Forward(ForwardSpec),
    #[serde(rename = "reverse-ssh")]
    ReverseSsh(ReverseSpec),
}

impl RuleSpec {
    pub fn kind(&self) -> &'static str {
        match self {
            RuleSpec::Forward(_) => "forward",
            RuleSpec::ReverseSsh(_) => "reverse-ssh",
        }
    }

    pub fn derive_id(&self) -> String {
        match self {
            RuleSpec::Forward(spec) => spec.derive_id(),
            RuleSpec::ReverseSsh(spec) => spec.derive_id(),
        }
    }

    pub fn local_port(&self) -> u16 {
        match self {
            RuleSpec::Forward(spec) => spec.local_port,
            RuleSpec::ReverseSsh(spec) => spec.local_port,
        }
    }

    /// Address sanity checks that must pass before any socket is touched.
    pub fn validate(&self) -> Result<(), String> {
        fn host(name: &str, value: &str) -> Result<(), String> {
            if value.trim().is_empty() {
                Err(format!("{name} must not be empty"))
            } else {
                Ok(())
            }
        }
        fn port(name: &str, value: u16) -> Result<(), String> {
            if value == 0 {
                Err(format!("{name} must be between 1 and 65535"))
            } else {
                Ok(())
            }
        }

        match self {
            RuleSpec::Forward(spec) => {
                host("remoteHost", &spec.remote_host)?;
                port("remotePort", spec.remote_port)?;
                port("localPort", spec.local_port)
            }
            RuleSpec::ReverseSsh(spec) => {
                host("sshHost", &spec.ssh_host)?;
                host("sshUser", &spec.ssh_user)?;
                host("remoteBindHost", &spec.remote_bind_host)?;
                port("sshPort", spec.ssh_port)?;
                port("remotePort", spec.remote_port)?;
                port("localPort", spec.local_port)
            }
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Rule {
    pub id: String,
    #[serde(flatten)]
    pub spec: RuleSpec,
    #[serde(default)]
    pub status: RuleStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Rule {
    /// A fresh `stopped` record.
    pub fn new(id: impl Into<String>, spec: RuleSpec) -> Self {
        Self {
            id: id.into(),
            spec,
            status: RuleStatus::Stopped,
            error: None,
            created_at: Utc::now(),
        }
    }

    pub fn is_running(&self) -> bool {
        self.status == RuleStatus::Running
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct AppSettings {
    pub connect_timeout_secs: u32,
    pub ssh_timeout_secs: u32,
    pub keep_alive_interval: u32,
    pub keep_alive_max: u32,
    pub shutdown_grace_secs: u32,
    pub forward_bind_host: String,
    pub replay_on_startup: bool,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 5,
            ssh_timeout_secs: 10,
            keep_alive_interval: 60,
            keep_alive_max: 3,
            shutdown_grace_secs: 3,
            forward_bind_host: "0.0.0.0".to_string(),
            replay_on_startup: true,
        }
    }
}

impl AppSettings {
    pub fn connect_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(u64::from(self.connect_timeout_secs.max(1)))
    }

    pub fn ssh_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(u64::from(self.ssh_timeout_secs.max(1)))
    }

    pub fn keep_alive(&self) -> std::time::Duration {
        std::time::Duration::from_secs(u64::from(self.keep_alive_interval.max(1)))
    }

    pub fn shutdown_grace(&self) -> std::time::Duration {
        std::time::Duration::from_secs(u64::from(self.shutdown_grace_secs))
    }
}
