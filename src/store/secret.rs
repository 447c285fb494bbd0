//! Master key read/write paths.
//!
//! Writing a key replaces the agent process and records the new agent token;
//! reading asks the running agent for the key with that token.

use tracing::{error, info};
use zeroize::Zeroizing;

use super::config::{StoreConfig, KEY_AGENT_TOKEN};
use super::{connect, SharedKvStore};
use crate::config::Config;
use crate::error::{RelayError, Result};
use crate::process::{AgentHandle, AgentProcessManager, AgentStatus, SpawnedAgent};
use crate::relay::RelayClient;
use crate::util;

pub struct SecretStore {
    kv: SharedKvStore,
    manager: AgentProcessManager,
}

impl SecretStore {
    pub fn new(kv: SharedKvStore, manager: AgentProcessManager) -> Self {
        Self { kv, manager }
    }

    /// Connect to the configured store and manage agents per `config`.
    pub async fn open(config: &Config) -> Result<Self> {
        let kv = connect(&config.db_url).await?;
        Ok(Self::new(kv, AgentProcessManager::new(config)))
    }

    pub fn kv(&self) -> &SharedKvStore {
        &self.kv
    }

    pub async fn load_config(&self) -> Result<StoreConfig> {
        StoreConfig::load(self.kv.as_ref()).await
    }

    /// Recover the plaintext master key from the running agent.
    ///
    /// # Errors
    ///
    /// `ExpiredCredential` when the upstream session is missing or expired.
    /// An unreachable agent or an error reply yields `Ok(None)` and a log line.
    pub async fn get_master_key(&self) -> Result<Option<Zeroizing<Vec<u8>>>> {
        let config = self.load_config().await?;
        check_session(&config, util::unix_now())?;

        let Some(agent_token) = config.agent_token else {
            error!("No agent token stored, set the master key first");
            return Ok(None);
        };

        let client = RelayClient::new(config.agent_port)?;
        let response = match client.query(&agent_token).await {
            Ok(response) => response,
            Err(e) => {
                error!("Agent at {} did not answer: {}", client.endpoint(), e);
                return Ok(None);
            }
        };
        match response.into_master_key() {
            Ok(key) => Ok(Some(key)),
            Err(e) => {
                error!("Expected master_key but agent returned: {}", e);
                Ok(None)
            }
        }
    }

    /// Start a fresh agent holding `plaintext` and persist its token.
    ///
    /// The agent times out when the upstream session expires; without a
    /// session it runs until stopped.
    pub async fn set_master_key(&self, plaintext: &[u8]) -> Result<SpawnedAgent> {
        let config = self.load_config().await?;
        let timeout = match &config.client_token {
            Some(token) => {
                let secs = token.expires_in(util::unix_now());
                if secs <= 0 {
                    return Err(RelayError::ExpiredCredential(
                        "upstream session has expired, log in again".to_string(),
                    ));
                }
                Some(secs as u64)
            }
            None => None,
        };

        let manager = self.manager.clone();
        let key = Zeroizing::new(plaintext.to_vec());
        let port = config.agent_port;
        let (lock, spawned) = tokio::task::spawn_blocking(move || {
            let lock = manager.lock()?;
            let spawned = manager.ensure_fresh_agent_locked(&lock, &key, port, timeout)?;
            Ok::<_, RelayError>((lock, spawned))
        })
        .await
        .map_err(|e| std::io::Error::other(format!("Task join error: {}", e)))??;

        // The stored token must belong to the last agent spawned under the lock.
        let recorded = self
            .kv
            .set(KEY_AGENT_TOKEN, spawned.agent_token.as_str())
            .await;
        drop(lock);
        recorded?;
        info!("Recorded token for agent pid {}", spawned.handle.pid);
        Ok(spawned)
    }

    /// The running agent, if the marker names a live process.
    pub async fn agent_handle(&self) -> Result<Option<AgentHandle>> {
        let config = self.load_config().await?;
        Ok(match self.agent_status().await? {
            AgentStatus::Running { pid } => Some(AgentHandle {
                pid,
                listen_port: config.agent_port,
            }),
            _ => None,
        })
    }

    pub async fn agent_status(&self) -> Result<AgentStatus> {
        let manager = self.manager.clone();
        tokio::task::spawn_blocking(move || manager.status())
            .await
            .map_err(|e| std::io::Error::other(format!("Task join error: {}", e)))?
    }

    /// Stop the running agent. Returns the stopped PID.
    pub async fn stop_agent(&self) -> Result<Option<u32>> {
        let manager = self.manager.clone();
        tokio::task::spawn_blocking(move || manager.stop_agent())
            .await
            .map_err(|e| std::io::Error::other(format!("Task join error: {}", e)))?
    }
}

fn check_session(config: &StoreConfig, now: i64) -> Result<()> {
    match &config.client_token {
        None => Err(RelayError::ExpiredCredential(
            "no upstream session, log in first".to_string(),
        )),
        Some(token) if token.is_expired(now) => Err(RelayError::ExpiredCredential(
            "upstream session has expired, log in again".to_string(),
        )),
        Some(_) => Ok(()),
    }
}

impl std::fmt::Debug for SecretStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretStore")
            .field("manager", &self.manager)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{Agent, AgentPhase};
    use crate::relay::AcceptedBundle;
    use crate::relay::AgentToken;
    use crate::store::{ClientToken, KvStore, MemoryStore};
    use std::path::PathBuf;
    use std::sync::Arc;
    use tokio::net::TcpListener;

    fn manager(dir: &std::path::Path, program: &str) -> AgentProcessManager {
        AgentProcessManager::new(&Config::new(dir.to_path_buf(), PathBuf::from(program)))
    }

    async fn store_with(
        dir: &std::path::Path,
        program: &str,
        setup: impl FnOnce(&mut StoreConfig),
    ) -> SecretStore {
        let kv = Arc::new(MemoryStore::new());
        let mut config = StoreConfig::default();
        setup(&mut config);
        config.save(kv.as_ref()).await.unwrap();
        SecretStore::new(kv, manager(dir, program))
    }

    async fn serve_agent(token: &str, key: &[u8]) -> (u16, tokio_util::sync::CancellationToken) {
        let agent = Agent::new(AcceptedBundle {
            agent_token: AgentToken::from(token.to_string()),
            master_key: Zeroizing::new(key.to_vec()),
            timeout: None,
            foreground: true,
        });
        let shutdown = agent.shutdown_token();
        let mut phase = agent.phase();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(agent.serve(listener));
        phase.wait_for(|p| *p == AgentPhase::Serving).await.unwrap();
        (port, shutdown)
    }

    fn live_session() -> Option<ClientToken> {
        Some(ClientToken::expiring_at(util::unix_now() + 3600))
    }

    #[tokio::test]
    async fn get_master_key_from_running_agent() {
        let temp = tempfile::tempdir().expect("tempdir");
        let (port, shutdown) = serve_agent("T", b"k1").await;
        let store = store_with(temp.path(), "true", |c| {
            c.agent_port = port;
            c.agent_token = Some("T".to_string());
            c.client_token = live_session();
        })
        .await;

        let key = store.get_master_key().await.unwrap().expect("key");
        assert_eq!(key.as_slice(), b"k1");
        shutdown.cancel();
    }

    #[tokio::test]
    async fn get_master_key_with_stale_token_is_none() {
        let temp = tempfile::tempdir().expect("tempdir");
        let (port, shutdown) = serve_agent("current", b"k1").await;
        let store = store_with(temp.path(), "true", |c| {
            c.agent_port = port;
            c.agent_token = Some("previous".to_string());
            c.client_token = live_session();
        })
        .await;

        assert!(store.get_master_key().await.unwrap().is_none());
        shutdown.cancel();
    }

    #[tokio::test]
    async fn get_master_key_without_agent_is_none() {
        let temp = tempfile::tempdir().expect("tempdir");
        let unused = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = unused.local_addr().unwrap().port();
        drop(unused);

        let store = store_with(temp.path(), "true", |c| {
            c.agent_port = port;
            c.agent_token = Some("T".to_string());
            c.client_token = live_session();
        })
        .await;
        assert!(store.get_master_key().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn expired_session_blocks_reads_and_writes() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = store_with(temp.path(), "/nonexistent/agent", |c| {
            c.agent_token = Some("T".to_string());
            c.client_token = Some(ClientToken::expiring_at(util::unix_now() - 10));
        })
        .await;

        assert!(matches!(
            store.get_master_key().await,
            Err(RelayError::ExpiredCredential(_))
        ));
        assert!(matches!(
            store.set_master_key(b"k").await,
            Err(RelayError::ExpiredCredential(_))
        ));
    }

    #[tokio::test]
    async fn missing_session_blocks_reads() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = store_with(temp.path(), "true", |_| {}).await;
        assert!(matches!(
            store.get_master_key().await,
            Err(RelayError::ExpiredCredential(_))
        ));
    }

    #[tokio::test]
    async fn set_master_key_spawn_failure_surfaces() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = store_with(temp.path(), "/nonexistent/agent", |c| {
            c.client_token = live_session();
        })
        .await;

        assert!(matches!(
            store.set_master_key(b"k").await,
            Err(RelayError::SpawnFailure { .. })
        ));
        assert_eq!(store.kv().get(KEY_AGENT_TOKEN).await.unwrap(), None);
    }

    #[tokio::test]
    async fn set_master_key_records_new_token() {
        let temp = tempfile::tempdir().expect("tempdir");
        let script = temp.path().join("fake-agent.sh");
        std::fs::write(&script, "#!/bin/sh\ncat > /dev/null\n").unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        }

        let store = store_with(temp.path(), script.to_str().unwrap(), |c| {
            c.client_token = live_session();
            c.agent_token = Some("old".to_string());
        })
        .await;

        let mut spawned = store.set_master_key(b"k1").await.unwrap();
        spawned.wait().unwrap();
        let stored = store.kv().get(KEY_AGENT_TOKEN).await.unwrap().unwrap();
        assert_eq!(stored, spawned.agent_token.as_str());
        assert_ne!(stored, "old");
    }

    /// Delays the first agent token write, as a busy database would.
    struct SlowFirstTokenWrite {
        inner: MemoryStore,
        delayed: std::sync::atomic::AtomicBool,
    }

    #[async_trait::async_trait]
    impl KvStore for SlowFirstTokenWrite {
        async fn get(&self, key: &str) -> Result<Option<String>> {
            self.inner.get(key).await
        }

        async fn set(&self, key: &str, value: &str) -> Result<()> {
            use std::sync::atomic::Ordering;
            if key == KEY_AGENT_TOKEN && !self.delayed.swap(true, Ordering::SeqCst) {
                tokio::time::sleep(std::time::Duration::from_millis(1500)).await;
            }
            self.inner.set(key, value).await
        }
    }

    #[tokio::test]
    async fn concurrent_rotations_record_the_live_agents_token() {
        let temp = tempfile::tempdir().expect("tempdir");
        let script = temp.path().join("fake-agent.sh");
        std::fs::write(
            &script,
            "#!/bin/sh\ncat > /dev/null\nwhile :; do sleep 1; done\n",
        )
        .unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        }

        let kv = Arc::new(SlowFirstTokenWrite {
            inner: MemoryStore::new(),
            delayed: std::sync::atomic::AtomicBool::new(false),
        });
        let mut config = StoreConfig::default();
        config.client_token = live_session();
        config.save(kv.as_ref()).await.unwrap();

        let program = script.to_str().unwrap();
        let first = SecretStore::new(kv.clone(), manager(temp.path(), program));
        let second = SecretStore::new(kv.clone(), manager(temp.path(), program));

        let (a, b) = tokio::join!(first.set_master_key(b"k1"), async {
            tokio::time::sleep(std::time::Duration::from_millis(300)).await;
            second.set_master_key(b"k2").await
        });
        let (a, b) = (a.unwrap(), b.unwrap());

        assert!(!crate::process::pid::is_alive(a.handle.pid));
        assert_eq!(
            second.agent_status().await.unwrap(),
            AgentStatus::Running { pid: b.handle.pid }
        );
        let stored = kv.get(KEY_AGENT_TOKEN).await.unwrap().unwrap();
        assert_eq!(stored, b.agent_token.as_str());

        assert_eq!(second.stop_agent().await.unwrap(), Some(b.handle.pid));
    }
}
