//! Credentials letting a container call back into the host.
//!
//! The side-channel server itself lives outside this crate; the container
//! runtime only mints a one-shot credential per run, hands it to the
//! container through environment variables and revokes it afterwards.

use crate::RuntimeError;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};
use tracing::debug;

pub const ENV_SSH_HOST: &str = "HATCH_SSH_HOST";
pub const ENV_SSH_PORT: &str = "HATCH_SSH_PORT";
pub const ENV_SSH_USER: &str = "HATCH_SSH_USER";
pub const ENV_SSH_TOKEN: &str = "HATCH_SSH_TOKEN";
pub const ENV_SSH_ENABLED: &str = "HATCH_SSH_ENABLED";

/// `--add-host` entry resolving the conventional gateway name to the host.
pub const HOST_GATEWAY_MAPPING: &str = "host.docker.internal:host-gateway";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub port: u16,
    pub user: String,
    pub token: String,
    pub run_id: String,
}

pub trait HostAccessServer: Send + Sync {
    fn is_running(&self) -> bool;

    /// Mint a credential scoped to `run_id`.
    fn connection_info(&self, run_id: &str) -> Result<ConnectionInfo, RuntimeError>;

    /// Invalidate one token. Other tokens stay valid.
    fn revoke_token(&self, token: &str);
}

/// Variables telling the container how to reach the host.
pub fn inject_env(env: &mut BTreeMap<String, String>, info: &ConnectionInfo, host: &str) {
    env.insert(ENV_SSH_HOST.to_owned(), host.to_owned());
    env.insert(ENV_SSH_PORT.to_owned(), info.port.to_string());
    env.insert(ENV_SSH_USER.to_owned(), info.user.clone());
    env.insert(ENV_SSH_TOKEN.to_owned(), info.token.clone());
    env.insert(ENV_SSH_ENABLED.to_owned(), "true".to_owned());
}

/// In-process credential issuer.
#[derive(Debug)]
pub struct LocalHostAccess {
    port: u16,
    user: String,
    running: AtomicBool,
    tokens: Mutex<HashMap<String, String>>,
}

impl LocalHostAccess {
    pub fn new(port: u16, user: impl Into<String>) -> Self {
        Self {
            port,
            user: user.into(),
            running: AtomicBool::new(false),
            tokens: Mutex::new(HashMap::new()),
        }
    }

    pub fn start(&self) {
        self.running.store(true, Ordering::SeqCst);
    }

    /// Stop issuing credentials and drop every outstanding token.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.tokens
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// Run id a token was minted for, if it is still valid.
    pub fn validate(&self, token: &str) -> Option<String> {
        self.tokens
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(token)
            .cloned()
    }

    pub fn active_tokens(&self) -> usize {
        self.tokens
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl HostAccessServer for LocalHostAccess {
    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn connection_info(&self, run_id: &str) -> Result<ConnectionInfo, RuntimeError> {
        if !self.is_running() {
            return Err(RuntimeError::HostAccess("server is not running".to_owned()));
        }
        let token = uuid::Uuid::new_v4().simple().to_string();
        self.tokens
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(token.clone(), run_id.to_owned());
        debug!("issued host access token for {run_id}");
        Ok(ConnectionInfo {
            port: self.port,
            user: self.user.clone(),
            token,
            run_id: run_id.to_owned(),
        })
    }

    fn revoke_token(&self, token: &str) {
        if let Some(run_id) = self
            .tokens
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(token)
        {
            debug!("revoked host access token for {run_id}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn stopped_server_refuses_credentials() {
        let server = LocalHostAccess::new(2222, "hatch");
        assert!(matches!(
            server.connection_info("run"),
            Err(RuntimeError::HostAccess(_))
        ));
    }

    #[test]
    fn revocation_is_per_token() {
        let server = LocalHostAccess::new(2222, "hatch");
        server.start();
        let a = server.connection_info("a").unwrap();
        let b = server.connection_info("b").unwrap();
        assert_ne!(a.token, b.token);
        server.revoke_token(&a.token);
        assert_eq!(server.validate(&a.token), None);
        assert_eq!(server.validate(&b.token).as_deref(), Some("b"));
    }

    #[test]
    fn concurrent_mint_and_revoke() {
        let server = Arc::new(LocalHostAccess::new(2222, "hatch"));
        server.start();
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let server = Arc::clone(&server);
                std::thread::spawn(move || {
                    let info = server.connection_info(&format!("run-{i}")).unwrap();
                    server.revoke_token(&info.token);
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(server.active_tokens(), 0);
    }

    #[test]
    fn env_injection() {
        let info = ConnectionInfo {
            port: 2222,
            user: "hatch".into(),
            token: "t0k".into(),
            run_id: "r".into(),
        };
        let mut env = BTreeMap::new();
        inject_env(&mut env, &info, "host.containers.internal");
        assert_eq!(env[ENV_SSH_HOST], "host.containers.internal");
        assert_eq!(env[ENV_SSH_PORT], "2222");
        assert_eq!(env[ENV_SSH_TOKEN], "t0k");
        assert_eq!(env[ENV_SSH_ENABLED], "true");
    }
}
