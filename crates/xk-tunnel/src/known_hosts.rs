//! Host key verification against a known_hosts file

use std::path::Path;

use russh_keys::key::PublicKey;
use xk_core::config::HostKeyPolicy;
use xk_core::error::ConnectionError;

/// What the known_hosts file says about a presented key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostKeyStatus {
    /// The key is recorded for this host
    Known,
    /// Nothing is recorded for this host
    Unknown,
    /// A different key is recorded on `line`
    Changed { line: usize },
}

/// Outcome of applying a policy to a [`HostKeyStatus`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostKeyDecision {
    Accept,
    /// Accept and record the key
    Learn,
    Reject(String),
}

/// Apply the host key policy
pub fn decide(policy: HostKeyPolicy, status: HostKeyStatus) -> HostKeyDecision {
    match (status, policy) {
        (HostKeyStatus::Known, _) => HostKeyDecision::Accept,
        (HostKeyStatus::Unknown, HostKeyPolicy::TrustOnFirstUse) => HostKeyDecision::Learn,
        (HostKeyStatus::Unknown, HostKeyPolicy::Strict) => {
            HostKeyDecision::Reject("host is not in known_hosts".to_string())
        }
        (HostKeyStatus::Changed { line }, _) => HostKeyDecision::Reject(format!(
            "host key differs from the one recorded on line {}",
            line
        )),
    }
}

/// Look the key up in `path`
pub fn lookup(
    path: &Path,
    host: &str,
    port: u16,
    key: &PublicKey,
) -> Result<HostKeyStatus, ConnectionError> {
    match russh_keys::check_known_hosts_path(host, port, key, path) {
        Ok(true) => Ok(HostKeyStatus::Known),
        Ok(false) => Ok(HostKeyStatus::Unknown),
        Err(russh_keys::Error::KeyChanged { line }) => Ok(HostKeyStatus::Changed { line }),
        Err(e) => Err(ConnectionError::HostKeyRejected {
            host: host.to_string(),
            reason: format!("failed to read {}: {}", path.display(), e),
        }),
    }
}

/// Check `key` for `host:port` under `policy`, recording it when trusted on first use
pub fn verify(
    path: &Path,
    policy: HostKeyPolicy,
    host: &str,
    port: u16,
    key: &PublicKey,
) -> Result<(), ConnectionError> {
    let status = lookup(path, host, port, key)?;
    match decide(policy, status) {
        HostKeyDecision::Accept => {
            tracing::debug!("Host key for {}:{} verified", host, port);
            Ok(())
        }
        HostKeyDecision::Learn => {
            tracing::warn!(
                "Unknown host key for {}:{} ({}), adding to {}",
                host,
                port,
                key.fingerprint(),
                path.display()
            );
            prepare(path)?;
            russh_keys::learn_known_hosts_path(host, port, key, path).map_err(|e| {
                ConnectionError::HostKeyRejected {
                    host: host.to_string(),
                    reason: format!("failed to record key in {}: {}", path.display(), e),
                }
            })
        }
        HostKeyDecision::Reject(reason) => {
            tracing::error!(
                "Rejecting host key {} for {}:{}: {}",
                key.fingerprint(),
                host,
                port,
                reason
            );
            Err(ConnectionError::HostKeyRejected {
                host: host.to_string(),
                reason,
            })
        }
    }
}

/// Make sure the directory holding the known_hosts file exists
pub fn prepare(path: &Path) -> Result<(), ConnectionError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_keys_always_accepted() {
        assert_eq!(
            decide(HostKeyPolicy::Strict, HostKeyStatus::Known),
            HostKeyDecision::Accept
        );
        assert_eq!(
            decide(HostKeyPolicy::TrustOnFirstUse, HostKeyStatus::Known),
            HostKeyDecision::Accept
        );
    }

    #[test]
    fn test_unknown_keys_depend_on_policy() {
        assert_eq!(
            decide(HostKeyPolicy::TrustOnFirstUse, HostKeyStatus::Unknown),
            HostKeyDecision::Learn
        );
        assert!(matches!(
            decide(HostKeyPolicy::Strict, HostKeyStatus::Unknown),
            HostKeyDecision::Reject(_)
        ));
    }

    #[test]
    fn test_changed_keys_always_rejected() {
        for policy in [HostKeyPolicy::Strict, HostKeyPolicy::TrustOnFirstUse] {
            match decide(policy, HostKeyStatus::Changed { line: 4 }) {
                HostKeyDecision::Reject(reason) => assert!(reason.contains("line 4")),
                other => panic!("expected rejection, got {:?}", other),
            }
        }
    }

    const NODE_KEY: &str = "AAAAC3NzaC1lZDI1NTE5AAAAIJpubytEsth9aOt5wLpyJUIMyRKp+BS3ngwONknfkW68";
    const OTHER_KEY: &str = "AAAAC3NzaC1lZDI1NTE5AAAAIAurBIOziQDM9nChyWxKAAy+F9JlS9bUZawADmJFgTyq";

    fn key(base64: &str) -> PublicKey {
        russh_keys::parse_public_key_base64(base64).unwrap()
    }

    #[test]
    fn test_strict_rejects_unrecorded_host() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("known_hosts");

        let result = verify(&path, HostKeyPolicy::Strict, "203.0.113.7", 22, &key(NODE_KEY));
        assert!(matches!(result, Err(ConnectionError::HostKeyRejected { .. })));
        assert!(!path.exists());
    }

    #[test]
    fn test_first_use_records_key() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("known_hosts");
        let node_key = key(NODE_KEY);

        verify(&path, HostKeyPolicy::TrustOnFirstUse, "203.0.113.7", 2222, &node_key).unwrap();
        assert_eq!(
            lookup(&path, "203.0.113.7", 2222, &node_key).unwrap(),
            HostKeyStatus::Known
        );

        // Once recorded, strict mode accepts it too
        verify(&path, HostKeyPolicy::Strict, "203.0.113.7", 2222, &node_key).unwrap();
        // Other hosts are still unknown
        assert_eq!(
            lookup(&path, "203.0.113.8", 2222, &node_key).unwrap(),
            HostKeyStatus::Unknown
        );
    }

    #[test]
    fn test_changed_key_rejected_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("known_hosts");
        verify(&path, HostKeyPolicy::TrustOnFirstUse, "203.0.113.7", 22, &key(NODE_KEY)).unwrap();

        let other = key(OTHER_KEY);
        assert!(matches!(
            lookup(&path, "203.0.113.7", 22, &other).unwrap(),
            HostKeyStatus::Changed { .. }
        ));
        let result = verify(&path, HostKeyPolicy::TrustOnFirstUse, "203.0.113.7", 22, &other);
        match result {
            Err(ConnectionError::HostKeyRejected { host, reason }) => {
                assert_eq!(host, "203.0.113.7");
                assert!(reason.contains("differs"));
            }
            other => panic!("expected rejection, got {:?}", other),
        }
    }

    #[test]
    fn test_prepare_creates_parent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x-keeper").join("known_hosts");
        prepare(&path).unwrap();
        assert!(path.parent().unwrap().is_dir());
        assert!(!path.exists());
    }
}
