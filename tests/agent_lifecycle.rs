//! End-to-end tests against the real `keyrelay-agent` binary.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use keyrelay::process::{pid, AgentProcessManager, AgentStatus};
use keyrelay::relay::{RelayClient, RelayResponse};
use keyrelay::store::{ClientToken, StoreConfig};
use keyrelay::{util, Config, RelayError, SecretStore};

const AGENT_BIN: &str = env!("CARGO_BIN_EXE_keyrelay-agent");

fn config_in(dir: &Path) -> Config {
    Config::new(dir.to_path_buf(), PathBuf::from(AGENT_BIN))
}

fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
    listener.local_addr().expect("local addr").port()
}

/// Query until the agent answers or ten seconds pass.
async fn query_when_ready(port: u16, token: &str) -> RelayResponse {
    let client = RelayClient::new(port).expect("client");
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        match client.query(token).await {
            Ok(resp) => return resp,
            Err(e) if Instant::now() >= deadline => panic!("agent never answered: {}", e),
            Err(_) => tokio::time::sleep(Duration::from_millis(50)).await,
        }
    }
}

fn wait_until_dead(pid: u32, within: Duration) -> bool {
    let deadline = Instant::now() + within;
    while Instant::now() < deadline {
        if !pid::is_alive(pid) {
            return true;
        }
        std::thread::sleep(Duration::from_millis(50));
    }
    !pid::is_alive(pid)
}

#[tokio::test]
async fn key_is_served_until_timeout() {
    let temp = tempfile::tempdir().expect("tempdir");
    let manager = AgentProcessManager::new(&config_in(temp.path()));
    let port = free_port();

    let spawned = manager
        .ensure_fresh_agent(b"k1", port, Some(2))
        .expect("spawn agent");

    let resp = query_when_ready(port, spawned.agent_token.as_str()).await;
    assert_eq!(resp, RelayResponse::master_key(b"k1"));
    assert_eq!(resp.into_master_key().unwrap().as_slice(), b"k1");

    assert!(
        wait_until_dead(spawned.handle.pid, Duration::from_secs(8)),
        "agent should exit after its timeout"
    );
    let fresh = RelayClient::new(port).unwrap();
    assert!(fresh.query(spawned.agent_token.as_str()).await.is_err());
    assert_eq!(manager.marker().read().unwrap(), None);
}

#[tokio::test]
async fn stale_marker_is_replaced_by_fresh_agent() {
    let temp = tempfile::tempdir().expect("tempdir");
    let manager = AgentProcessManager::new(&config_in(temp.path()));
    let port = free_port();

    let mut exited = Command::new("true").spawn().expect("spawn true");
    exited.wait().unwrap();
    manager.marker().write(exited.id()).unwrap();
    assert_eq!(
        manager.status().unwrap(),
        AgentStatus::Stale { pid: exited.id() }
    );

    let spawned = manager
        .ensure_fresh_agent(b"k2", port, None)
        .expect("stale marker must not block a new agent");
    assert_eq!(manager.marker().read().unwrap(), Some(spawned.handle.pid));

    let resp = query_when_ready(port, spawned.agent_token.as_str()).await;
    assert_eq!(resp, RelayResponse::master_key(b"k2"));

    assert_eq!(manager.stop_agent().unwrap(), Some(spawned.handle.pid));
    assert!(wait_until_dead(spawned.handle.pid, Duration::from_secs(5)));
}

#[tokio::test]
async fn second_spawn_supersedes_first() {
    let temp = tempfile::tempdir().expect("tempdir");
    let manager = AgentProcessManager::new(&config_in(temp.path()));
    let port = free_port();

    let first = manager.ensure_fresh_agent(b"old", port, None).unwrap();
    query_when_ready(port, first.agent_token.as_str()).await;

    let second = manager.ensure_fresh_agent(b"new", port, None).unwrap();
    assert!(!pid::is_alive(first.handle.pid));
    assert_eq!(manager.status().unwrap(), AgentStatus::Running { pid: second.handle.pid });

    let resp = query_when_ready(port, second.agent_token.as_str()).await;
    assert_eq!(resp, RelayResponse::master_key(b"new"));

    let client = RelayClient::new(port).unwrap();
    let rejected = client.query(first.agent_token.as_str()).await.unwrap();
    assert!(matches!(
        rejected.into_master_key(),
        Err(RelayError::AuthenticationFailure)
    ));

    manager.stop_agent().unwrap();
    assert!(wait_until_dead(second.handle.pid, Duration::from_secs(5)));
}

#[test]
fn malformed_startup_exits_with_status_1() {
    let temp = tempfile::tempdir().expect("tempdir");
    let port = free_port();
    let inputs = [
        "not-json\n".to_string(),
        format!("{{\"master_key\":\"{}\"}}\n", BASE64.encode(b"k")),
        "{\"agent_token\":\"T\"}\n".to_string(),
        String::new(),
    ];

    for input in inputs {
        let mut child = Command::new(AGENT_BIN)
            .arg(format!("127.0.0.1:{}", port))
            .arg("--log-file")
            .arg(temp.path().join("agent.log"))
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .expect("spawn agent");
        {
            let mut stdin = child.stdin.take().unwrap();
            stdin.write_all(input.as_bytes()).unwrap();
        }
        let status = child.wait().unwrap();
        assert_eq!(status.code(), Some(1), "input {:?}", input);
    }
}

#[test]
fn non_loopback_listen_address_is_refused() {
    let temp = tempfile::tempdir().expect("tempdir");
    let mut child = Command::new(AGENT_BIN)
        .arg("0.0.0.0:0")
        .arg("--log-file")
        .arg(temp.path().join("agent.log"))
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn agent");
    {
        let mut stdin = child.stdin.take().unwrap();
        let line = format!(
            "{{\"agent_token\":\"T\",\"master_key\":\"{}\",\"foreground\":true}}\n",
            BASE64.encode(b"k")
        );
        stdin.write_all(line.as_bytes()).unwrap();
    }
    assert_eq!(child.wait().unwrap().code(), Some(1));
}

#[tokio::test]
async fn secret_store_round_trip_through_agent() {
    let temp = tempfile::tempdir().expect("tempdir");
    let config = config_in(temp.path());
    let store = SecretStore::open(&config).await.expect("open store");

    let mut stored = StoreConfig::load(store.kv().as_ref()).await.unwrap();
    stored.agent_port = free_port();
    stored.client_token = Some(ClientToken::expiring_at(util::unix_now() + 60));
    stored.save(store.kv().as_ref()).await.unwrap();

    let key = [0u8, 1, 2, 254, 255];
    let spawned = store.set_master_key(&key).await.expect("set key");
    query_when_ready(stored.agent_port, spawned.agent_token.as_str()).await;

    let fetched = store.get_master_key().await.unwrap().expect("key from agent");
    assert_eq!(fetched.as_slice(), &key);

    let handle = store.agent_handle().await.unwrap().expect("running agent");
    assert_eq!(handle.pid, spawned.handle.pid);
    assert_eq!(handle.listen_port, stored.agent_port);

    assert_eq!(store.stop_agent().await.unwrap(), Some(spawned.handle.pid));
    assert!(wait_until_dead(spawned.handle.pid, Duration::from_secs(5)));
    assert!(store.get_master_key().await.unwrap().is_none());
}
