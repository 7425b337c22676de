use crate::database::models::{AuthType, ReverseSpec};
use crate::error::{TunnelError, TunnelResult};
use std::fs::File;
use std::path::PathBuf;

#[derive(Clone)]
pub enum TunnelAuth {
    Password(String),
    Key(PathBuf),
}

impl std::fmt::Debug for TunnelAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TunnelAuth::Password(_) => f.write_str("Password(..)"),
            TunnelAuth::Key(path) => f.debug_tuple("Key").field(path).finish(),
        }
    }
}

/// Everything needed to open and authenticate one reverse-tunnel session.
#[derive(Clone, Debug)]
pub struct SshConnectConfig {
    pub ssh_host: String,
    pub ssh_port: u16,
    pub ssh_user: String,
    pub auth: TunnelAuth,
    pub remote_bind_host: String,
    pub remote_port: u16,
    pub local_port: u16,
}

impl SshConnectConfig {
    pub fn target(&self) -> String {
        format!("{}:{}", self.ssh_host, self.ssh_port)
    }
}

impl TryFrom<&ReverseSpec> for SshConnectConfig {
    type Error = TunnelError;

    /// Fails without touching the network when the credential for the chosen
    /// auth type is missing or the key file cannot be read.
    fn try_from(spec: &ReverseSpec) -> TunnelResult<Self> {
        let auth = match spec.auth_type {
            AuthType::Password => match spec.password.as_deref() {
                Some(password) if !password.is_empty() => TunnelAuth::Password(password.into()),
                _ => {
                    return Err(TunnelError::Config(
                        "Password authentication requires a password".into(),
                    ))
                }
            },
            AuthType::Key => {
                let path = match spec.private_key_path.as_deref().map(str::trim) {
                    Some(path) if !path.is_empty() => PathBuf::from(path),
                    _ => {
                        return Err(TunnelError::Config(
                            "Key authentication requires a private key path".into(),
                        ))
                    }
                };
                if !path.is_file() {
                    return Err(TunnelError::Config(format!(
                        "Private key file not found: {}",
                        path.display()
                    )));
                }
                File::open(&path).map_err(|e| {
                    TunnelError::Config(format!(
                        "Private key file {} is not readable: {}",
                        path.display(),
                        e
                    ))
                })?;
                TunnelAuth::Key(path)
            }
        };

        Ok(Self {
            ssh_host: spec.ssh_host.clone(),
            ssh_port: spec.ssh_port,
            ssh_user: spec.ssh_user.clone(),
            auth,
            remote_bind_host: spec.remote_bind_host.clone(),
            remote_port: spec.remote_port,
            local_port: spec.local_port,
        })
    }
}
