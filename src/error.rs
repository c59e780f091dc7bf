//! Tunnel lifecycle errors.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TunnelError {
    /// Dialing or authenticating the pooled connection failed.
    #[error("connect to {host}: {reason}")]
    Connect { host: String, reason: String },

    /// The remote endpoint lookup failed or printed nothing.
    #[error("resolve endpoint for {key}: {reason}")]
    Resolve { key: String, reason: String },

    #[error("listen on 127.0.0.1:{port}: {reason}")]
    Listen { port: u16, reason: String },

    /// The tunnel's forwarding loop ended on its own.
    #[error("forwarding for {key} stopped: {reason}")]
    Forward { key: String, reason: String },

    #[error("connection to {host} lost")]
    LostConnection { host: String },

    #[error("tunnel {key} is already connected")]
    AlreadyConnected { key: String },
}

impl TunnelError {
    /// Whether retrying the same operation later could succeed.
    ///
    /// Authentication and permission failures never fix themselves, and a
    /// local port that is taken by another program will stay taken for the
    /// lifetime of that program.
    pub fn is_retriable(&self) -> bool {
        match self {
            TunnelError::Connect { reason, .. } => !is_auth_failure(reason),
            TunnelError::Listen { .. } | TunnelError::AlreadyConnected { .. } => false,
            TunnelError::Resolve { .. }
            | TunnelError::Forward { .. }
            | TunnelError::LostConnection { .. } => true,
        }
    }
}

/// Recognise OpenSSH authentication failures from their error text.
pub(crate) fn is_auth_failure(reason: &str) -> bool {
    const AUTH_PATTERNS: [&str; 8] = [
        "permission denied",
        "authentication failed",
        "host key verification failed",
        "no supported authentication",
        "too many authentication failures",
        "invalid password",
        "key rejected",
        "publickey denied",
    ];

    let reason = reason.to_lowercase();
    AUTH_PATTERNS.iter().any(|pattern| reason.contains(pattern))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages_carry_cause() {
        let err = TunnelError::Resolve {
            key: "db1:acme".to_string(),
            reason: "empty container address".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "resolve endpoint for db1:acme: empty container address"
        );

        let err = TunnelError::Listen {
            port: 12345,
            reason: "Address already in use".to_string(),
        };
        assert!(err.to_string().contains("127.0.0.1:12345"));
        assert!(err.to_string().contains("Address already in use"));
    }

    #[test]
    fn test_auth_failures_are_not_retriable() {
        let auth = TunnelError::Connect {
            host: "db1".to_string(),
            reason: "deploy@db1: Permission denied (publickey)".to_string(),
        };
        assert!(!auth.is_retriable());

        let host_key = TunnelError::Connect {
            host: "db1".to_string(),
            reason: "Host key verification failed.".to_string(),
        };
        assert!(!host_key.is_retriable());

        let refused = TunnelError::Connect {
            host: "db1".to_string(),
            reason: "connect to host db1 port 22: Connection refused".to_string(),
        };
        assert!(refused.is_retriable());
    }

    #[test]
    fn test_lost_connection_is_retriable() {
        let lost = TunnelError::LostConnection {
            host: "db1".to_string(),
        };
        assert!(lost.is_retriable());
        assert_eq!(lost.to_string(), "connection to db1 lost");

        let listen = TunnelError::Listen {
            port: 10001,
            reason: "in use".to_string(),
        };
        assert!(!listen.is_retriable());
    }
}
