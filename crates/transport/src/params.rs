use crate::TransportError;
use std::fmt;
use std::path::PathBuf;

/// How to prove our identity to the server.
#[derive(Clone, PartialEq, Eq)]
pub enum AuthMethod {
    Password(String),
    KeyFile {
        path: PathBuf,
        passphrase: Option<String>,
    },
    /// Every identity held by the running SSH agent, in agent order.
    Agent,
}

impl AuthMethod {
    /// Short label for logs and status payloads. Never includes secrets.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Password(_) => "password",
            Self::KeyFile { .. } => "key-file",
            Self::Agent => "agent",
        }
    }
}

impl fmt::Debug for AuthMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Password(_) => f.write_str("Password(<redacted>)"),
            Self::KeyFile { path, passphrase } => f
                .debug_struct("KeyFile")
                .field("path", path)
                .field("passphrase", &passphrase.as_ref().map(|_| "<redacted>"))
                .finish(),
            Self::Agent => f.write_str("Agent"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectParams {
    pub hostname: String,
    pub port: u16,
    pub username: String,
    pub auth: AuthMethod,
}

impl ConnectParams {
    pub fn new(hostname: impl Into<String>, port: u16, username: impl Into<String>, auth: AuthMethod) -> Self {
        Self {
            hostname: hostname.into(),
            port,
            username: username.into(),
            auth,
        }
    }

    /// Reject parameters no server could accept, before touching the network.
    pub fn validate(&self) -> Result<(), TransportError> {
        if self.hostname.trim().is_empty() {
            return Err(TransportError::MissingField("hostname"));
        }
        if self.username.trim().is_empty() {
            return Err(TransportError::MissingField("username"));
        }
        if self.port == 0 {
            return Err(TransportError::InvalidParams("port must be between 1 and 65535".into()));
        }
        if self.hostname.chars().any(|c| c.is_whitespace() || c.is_control()) {
            return Err(TransportError::InvalidParams(format!(
                "hostname {:?} contains whitespace",
                self.hostname
            )));
        }
        if let AuthMethod::KeyFile { path, .. } = &self.auth {
            if path.as_os_str().is_empty() {
                return Err(TransportError::MissingField("keyPath"));
            }
        }
        Ok(())
    }

    /// `host:port`, bracketing IPv6 literals.
    pub fn target(&self) -> String {
        if self.hostname.contains(':') {
            format!("[{}]:{}", self.hostname, self.port)
        } else {
            format!("{}:{}", self.hostname, self.port)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn params(hostname: &str, username: &str) -> ConnectParams {
        ConnectParams::new(hostname, 22, username, AuthMethod::Password("p".into()))
    }

    #[test]
    fn valid_params_pass() {
        assert!(params("example.com", "deploy").validate().is_ok());
    }

    #[test]
    fn empty_hostname_is_reported_by_name() {
        let error = params("  ", "deploy").validate().unwrap_err();
        assert_eq!(error.to_string(), "Missing required field: hostname");
    }

    #[test]
    fn empty_username_is_reported_by_name() {
        let error = params("example.com", "").validate().unwrap_err();
        assert_eq!(error.to_string(), "Missing required field: username");
    }

    #[test]
    fn port_zero_is_rejected() {
        let mut p = params("example.com", "deploy");
        p.port = 0;
        assert!(matches!(p.validate(), Err(TransportError::InvalidParams(_))));
    }

    #[test]
    fn empty_key_path_is_rejected() {
        let p = ConnectParams::new(
            "example.com",
            22,
            "deploy",
            AuthMethod::KeyFile {
                path: PathBuf::new(),
                passphrase: None,
            },
        );
        assert_eq!(p.validate().unwrap_err().to_string(), "Missing required field: keyPath");
    }

    #[test]
    fn debug_output_hides_secrets() {
        let p = ConnectParams::new("h", 22, "u", AuthMethod::Password("hunter2".into()));
        assert!(!format!("{p:?}").contains("hunter2"));
    }

    #[test]
    fn target_brackets_ipv6() {
        let mut p = params("::1", "u");
        p.port = 2222;
        assert_eq!(p.target(), "[::1]:2222");
        assert_eq!(params("example.com", "u").target(), "example.com:22");
    }
}
