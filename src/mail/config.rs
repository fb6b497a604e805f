//! IMAP Configuration Module

use serde::{Deserialize, Serialize};

/// Security type for IMAP connections
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum SecurityType {
    #[default]
    SSL,
    STARTTLS,
    NONE,
}

impl SecurityType {
    pub fn default_imap_port(&self) -> u16 {
        match self {
            SecurityType::SSL => 993,
            SecurityType::STARTTLS => 143,
            SecurityType::NONE => 143,
        }
    }
}

/// IMAP server configuration
///
/// Credentials arrive already decrypted from the account service; this
/// crate never touches credential storage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImapConfig {
    pub host: String,
    pub port: u16,
    pub security: SecurityType,
    pub username: String,
    pub password: String,
    #[serde(default)]
    pub accept_invalid_certs: bool,
}

impl Default for ImapConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: 993,
            security: SecurityType::SSL,
            username: String::new(),
            password: String::new(),
            accept_invalid_certs: false, // Secure by default
        }
    }
}

impl ImapConfig {
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.host.is_empty() {
            errors.push("IMAP host is required".to_string());
        }
        if self.username.is_empty() {
            errors.push("IMAP username is required".to_string());
        }
        if self.security == SecurityType::NONE {
            errors.push("Insecure connections are not supported".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_ports() {
        assert_eq!(SecurityType::SSL.default_imap_port(), 993);
        assert_eq!(SecurityType::STARTTLS.default_imap_port(), 143);
    }

    #[test]
    fn test_validate_rejects_empty_host() {
        let config = ImapConfig {
            username: "user@example.com".into(),
            ..Default::default()
        };
        let errors = config.validate().unwrap_err();
        assert!(errors.iter().any(|e| e.contains("host")));
    }
}
