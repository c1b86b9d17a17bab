//! End-to-end tests of the daemon event loop over its command channel.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use keyward_keystore::keystore_file::KeystoreDir;
use keyward_node::approval::{ApprovalGate, MessagePrompt, TransactionPrompt};
use keyward_node::command::DaemonCommand;
use keyward_node::events::DaemonEvent;
use keyward_node::Daemon;
use keyward_protocol::request::{Origin, Request, RequestType};
use keyward_types::config::AppConfig;
use keyward_types::{KeywardError, ValidationCode};
use serde_json::{json, Value};
use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use zeroize::Zeroizing;

type TestResult = std::result::Result<(), KeywardError>;

const PASSWORD: &str = "correct horse battery";
const APP: &str = "https://app.example";

// ---------------------------------------------------------------------------
// Scripted approval gate
// ---------------------------------------------------------------------------

struct ScriptedGate {
    approve: bool,
    password: Option<String>,
    calls: AtomicUsize,
}

impl ScriptedGate {
    fn new(approve: bool) -> Arc<Self> {
        Arc::new(Self {
            approve,
            password: Some(PASSWORD.into()),
            calls: AtomicUsize::new(0),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ApprovalGate for ScriptedGate {
    async fn prompt_unlock(&self, _origin: &Origin) -> keyward_types::Result<Zeroizing<String>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.password
            .clone()
            .map(Zeroizing::new)
            .ok_or(KeywardError::UserRejected)
    }

    async fn prompt_transaction_approval(&self, _prompt: &TransactionPrompt) -> keyward_types::Result<bool> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.approve)
    }

    async fn prompt_message_signature(&self, _prompt: &MessagePrompt) -> keyward_types::Result<bool> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.approve)
    }

    async fn prompt_account_access(&self, _origin: &Origin) -> keyward_types::Result<bool> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.approve)
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

struct Harness {
    dir: TempDir,
    daemon: Daemon,
    tx: mpsc::Sender<DaemonCommand>,
    handle: JoinHandle<()>,
    gate: Arc<ScriptedGate>,
}

fn fast_config() -> AppConfig {
    AppConfig {
        scrypt_n: 1024,
        scrypt_r: 8,
        scrypt_p: 1,
        keystore_poll_interval_ms: 50,
        ..AppConfig::default()
    }
}

fn start(config: AppConfig, gate: Arc<ScriptedGate>) -> std::result::Result<Harness, KeywardError> {
    let dir = tempfile::tempdir().map_err(|e| KeywardError::StorageError { reason: e.to_string() })?;
    let mut daemon = Daemon::new(config, KeystoreDir::new(dir.path()), gate.clone())?;
    let handle = daemon.start()?;
    Ok(Harness {
        tx: daemon.command_sender(),
        dir,
        daemon,
        handle,
        gate,
    })
}

impl Harness {
    async fn call_as(&self, origin: Origin, kind: RequestType, data: Value) -> keyward_types::Result<Value> {
        let (cmd, rx) = DaemonCommand::request(Request::new("t", kind, data, origin));
        self.tx.send(cmd).await.map_err(|_| KeywardError::ConnectionClosed)?;
        rx.await.map_err(|_| KeywardError::ConnectionClosed)?
    }

    async fn call(&self, kind: RequestType, data: Value) -> keyward_types::Result<Value> {
        self.call_as(Origin::Cli, kind, data).await
    }

    async fn state(&self) -> keyward_types::Result<String> {
        let status = self.call(RequestType::GetStatus, json!({})).await?;
        Ok(status["state"].as_str().unwrap_or_default().to_string())
    }

    async fn create(&self) -> keyward_types::Result<String> {
        let created = self
            .call(RequestType::CreateKeystore, json!({ "password": PASSWORD }))
            .await?;
        Ok(created["address"].as_str().unwrap_or_default().to_string())
    }

    /// Polls status until `state` is reached or two seconds pass.
    async fn wait_for_state(&self, state: &str) -> keyward_types::Result<bool> {
        for _ in 0..40 {
            if self.state().await? == state {
                return Ok(true);
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        Ok(false)
    }
}

fn legacy_tx() -> Value {
    json!({
        "to": "0x70997970C51812dc3A010C7d01b50e0d17dc79C8",
        "value": "0x0",
        "nonce": 0,
        "gas": 21000,
        "gasPrice": "0x3b9aca00",
        "chainId": 1
    })
}

fn validation_code(result: &keyward_types::Result<Value>) -> Option<ValidationCode> {
    match result {
        Err(KeywardError::Validation { code, .. }) => Some(*code),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

#[tokio::test]
async fn starts_ready_without_keystore() -> TestResult {
    let h = start(fast_config(), ScriptedGate::new(true))?;
    let status = h.call(RequestType::GetStatus, json!({})).await?;
    assert_eq!(status["state"], "READY");
    assert_eq!(status["hasKeystore"], false);
    assert_eq!(status["isUnlocked"], false);

    let accounts = h.call(RequestType::GetAccounts, json!({})).await;
    assert_eq!(validation_code(&accounts), Some(ValidationCode::WalletLocked));
    Ok(())
}

#[tokio::test]
async fn create_lock_unlock_cycle() -> TestResult {
    let h = start(fast_config(), ScriptedGate::new(true))?;

    let created = h
        .call(RequestType::CreateKeystore, json!({ "password": PASSWORD }))
        .await?;
    let words = created["mnemonic"].as_str().unwrap_or_default().split_whitespace().count();
    assert_eq!(words, 12);
    assert_eq!(h.state().await?, "UNLOCKED");

    h.call(RequestType::LockKeystore, json!({})).await?;
    assert_eq!(h.state().await?, "LOCKED");

    let wrong = h
        .call(RequestType::UnlockKeystore, json!({ "password": "not the password" }))
        .await?;
    assert_eq!(wrong["success"], false);
    assert_eq!(h.state().await?, "LOCKED");

    let right = h
        .call(RequestType::UnlockKeystore, json!({ "password": PASSWORD }))
        .await?;
    assert_eq!(right["success"], true);
    assert_eq!(right["accounts"], json!([created["address"]]));
    assert_eq!(h.state().await?, "UNLOCKED");
    Ok(())
}

#[tokio::test]
async fn restart_finds_existing_keystore_locked() -> TestResult {
    let dir = tempfile::tempdir().map_err(|e| KeywardError::StorageError { reason: e.to_string() })?;
    let gate = ScriptedGate::new(true);

    {
        let mut daemon = Daemon::new(fast_config(), KeystoreDir::new(dir.path()), gate.clone())?;
        let handle = daemon.start()?;
        let (cmd, rx) = DaemonCommand::request(Request::new(
            "1",
            RequestType::CreateKeystore,
            json!({ "password": PASSWORD }),
            Origin::Cli,
        ));
        daemon.command_sender().send(cmd).await.map_err(|_| KeywardError::ConnectionClosed)?;
        rx.await.map_err(|_| KeywardError::ConnectionClosed)??;
        daemon.shutdown()?;
        let _ = handle.await;
    }

    let mut daemon = Daemon::new(fast_config(), KeystoreDir::new(dir.path()), gate)?;
    let _handle = daemon.start()?;
    let (cmd, rx) = DaemonCommand::request(Request::new("2", RequestType::GetStatus, json!({}), Origin::Cli));
    daemon.command_sender().send(cmd).await.map_err(|_| KeywardError::ConnectionClosed)?;
    let status = rx.await.map_err(|_| KeywardError::ConnectionClosed)??;
    assert_eq!(status["state"], "LOCKED");
    assert_eq!(status["hasKeystore"], true);
    Ok(())
}

#[tokio::test]
async fn shutdown_request_exits_and_signals() -> TestResult {
    let h = start(fast_config(), ScriptedGate::new(true))?;
    h.create().await?;
    let signal = h.daemon.shutdown_signal();

    let reply = h.call(RequestType::Shutdown, json!({})).await?;
    assert_eq!(reply["success"], true);
    let _ = h.handle.await;
    assert!(*signal.borrow());
    Ok(())
}

// ---------------------------------------------------------------------------
// Signing
// ---------------------------------------------------------------------------

#[tokio::test]
async fn locked_signing_never_reaches_the_gate() -> TestResult {
    let h = start(fast_config(), ScriptedGate::new(true))?;
    let address = h.create().await?;
    h.call(RequestType::LockKeystore, json!({})).await?;

    let result = h
        .call(
            RequestType::SignTransaction,
            json!({ "transaction": legacy_tx(), "address": address }),
        )
        .await;
    assert_eq!(validation_code(&result), Some(ValidationCode::WalletLocked));
    assert_eq!(h.gate.calls(), 0);
    Ok(())
}

#[tokio::test]
async fn eleventh_transaction_in_window_is_rate_limited() -> TestResult {
    let h = start(fast_config(), ScriptedGate::new(true))?;
    let address = h.create().await?;
    let data = json!({ "transaction": legacy_tx(), "address": address });

    for _ in 0..10 {
        let signed = h.call(RequestType::SignTransaction, data.clone()).await?;
        assert!(signed["rawTransaction"].as_str().unwrap_or_default().starts_with("0x"));
    }
    let eleventh = h.call(RequestType::SignTransaction, data).await;
    assert_eq!(validation_code(&eleventh), Some(ValidationCode::RateLimited));
    assert_eq!(h.gate.calls(), 10);
    Ok(())
}

#[tokio::test]
async fn declined_approval_is_user_rejected() -> TestResult {
    let h = start(fast_config(), ScriptedGate::new(false))?;
    let address = h.create().await?;

    let result = h
        .call(RequestType::SignMessage, json!({ "message": "hello", "address": address }))
        .await;
    assert!(matches!(result, Err(KeywardError::UserRejected)));

    let status = h.call(RequestType::GetStatus, json!({})).await?;
    assert_eq!(status["errorCount"], 0);
    assert_eq!(status["state"], "UNLOCKED");
    Ok(())
}

#[tokio::test]
async fn unknown_account_fails_without_prompt() -> TestResult {
    let h = start(fast_config(), ScriptedGate::new(true))?;
    h.create().await?;

    let result = h
        .call(
            RequestType::SignMessage,
            json!({ "message": "hello", "address": "0x0000000000000000000000000000000000000001" }),
        )
        .await;
    assert!(matches!(result, Err(KeywardError::AccountNotFound { .. })));
    assert_eq!(h.gate.calls(), 0);
    Ok(())
}

// ---------------------------------------------------------------------------
// Browser origins
// ---------------------------------------------------------------------------

#[tokio::test]
async fn connect_grants_origin_access() -> TestResult {
    let config = AppConfig {
        allowed_origins: Some(Vec::new()),
        ..fast_config()
    };
    let h = start(config, ScriptedGate::new(true))?;
    let address = h.create().await?;
    let app = Origin::Browser(APP.into());

    let denied = h.call_as(app.clone(), RequestType::EthAccounts, json!({ "params": [] })).await;
    assert_eq!(validation_code(&denied), Some(ValidationCode::PermissionDenied));

    let connected = h
        .call_as(app.clone(), RequestType::EthRequestAccounts, json!({ "params": [] }))
        .await?;
    assert_eq!(connected, json!([address]));
    assert_eq!(h.gate.calls(), 1);

    let accounts = h.call_as(app, RequestType::EthAccounts, json!({ "params": [] })).await?;
    assert_eq!(accounts, json!([address]));
    Ok(())
}

#[tokio::test]
async fn connect_while_locked_prompts_for_password() -> TestResult {
    let h = start(fast_config(), ScriptedGate::new(true))?;
    let address = h.create().await?;
    h.call(RequestType::LockKeystore, json!({})).await?;

    let connected = h
        .call_as(
            Origin::Browser(APP.into()),
            RequestType::EthRequestAccounts,
            json!({ "params": [] }),
        )
        .await?;
    assert_eq!(connected, json!([address]));
    assert_eq!(h.state().await?, "UNLOCKED");
    // Unlock prompt, then account access prompt.
    assert_eq!(h.gate.calls(), 2);
    Ok(())
}

#[tokio::test]
async fn personal_sign_from_browser() -> TestResult {
    let config = AppConfig {
        allowed_origins: Some(vec![APP.into()]),
        ..fast_config()
    };
    let h = start(config, ScriptedGate::new(true))?;
    let address = h.create().await?;

    let signature = h
        .call_as(
            Origin::Browser(APP.into()),
            RequestType::PersonalSign,
            json!({ "params": ["0x68656c6c6f", address] }),
        )
        .await?;
    let hex = signature.as_str().unwrap_or_default();
    assert!(hex.starts_with("0x"));
    assert_eq!(hex.len(), 2 + 130);
    Ok(())
}

// ---------------------------------------------------------------------------
// Keystore jobs
// ---------------------------------------------------------------------------

#[tokio::test]
async fn queued_account_creations_derive_distinct_accounts() -> TestResult {
    let h = start(fast_config(), ScriptedGate::new(true))?;
    h.create().await?;

    let (first, rx1) = DaemonCommand::request(Request::new(
        "a",
        RequestType::CreateAccount,
        json!({ "password": PASSWORD }),
        Origin::Cli,
    ));
    let (second, rx2) = DaemonCommand::request(Request::new(
        "b",
        RequestType::CreateAccount,
        json!({ "password": PASSWORD }),
        Origin::Cli,
    ));
    h.tx.send(first).await.map_err(|_| KeywardError::ConnectionClosed)?;
    h.tx.send(second).await.map_err(|_| KeywardError::ConnectionClosed)?;
    let a = rx1.await.map_err(|_| KeywardError::ConnectionClosed)??;
    let b = rx2.await.map_err(|_| KeywardError::ConnectionClosed)??;
    assert_ne!(a["address"], b["address"]);

    let listed = h.call(RequestType::GetAccounts, json!({})).await?;
    assert_eq!(listed["accounts"].as_array().map(Vec::len), Some(3));
    Ok(())
}

#[tokio::test]
async fn mutation_with_wrong_password_is_refused() -> TestResult {
    let h = start(fast_config(), ScriptedGate::new(true))?;
    h.create().await?;

    let result = h
        .call(RequestType::CreateAccount, json!({ "password": "not the password" }))
        .await;
    assert!(matches!(result, Err(KeywardError::InvalidPassword)));

    let listed = h.call(RequestType::GetAccounts, json!({})).await?;
    assert_eq!(listed["accounts"].as_array().map(Vec::len), Some(1));
    Ok(())
}

#[tokio::test]
async fn delete_returns_to_ready() -> TestResult {
    let h = start(fast_config(), ScriptedGate::new(true))?;
    h.create().await?;

    h.call(RequestType::DeleteKeystore, json!({})).await?;
    let status = h.call(RequestType::GetStatus, json!({})).await?;
    assert_eq!(status["state"], "READY");
    assert_eq!(status["hasKeystore"], false);
    assert_eq!(status["isUnlocked"], false);
    Ok(())
}

#[tokio::test]
async fn external_removal_locks_and_returns_to_ready() -> TestResult {
    let mut h = start(fast_config(), ScriptedGate::new(true))?;
    let mut events = h
        .daemon
        .take_event_receiver()
        .ok_or(KeywardError::ConnectionClosed)?;
    h.create().await?;

    for entry in std::fs::read_dir(h.dir.path()).map_err(|e| KeywardError::StorageError { reason: e.to_string() })? {
        let path = entry.map_err(|e| KeywardError::StorageError { reason: e.to_string() })?.path();
        std::fs::remove_file(path).map_err(|e| KeywardError::StorageError { reason: e.to_string() })?;
    }

    assert!(h.wait_for_state("READY").await?);
    let status = h.call(RequestType::GetStatus, json!({})).await?;
    assert_eq!(status["isUnlocked"], false);

    let mut saw_lock = false;
    while let Ok(event) = events.try_recv() {
        if event == (DaemonEvent::Locked { reason: "removed" }) {
            saw_lock = true;
        }
    }
    assert!(saw_lock);
    Ok(())
}

#[tokio::test]
async fn auto_lock_fires_after_inactivity() -> TestResult {
    let config = AppConfig {
        auto_lock_enabled: true,
        auto_lock_timeout_ms: 200,
        ..fast_config()
    };
    let h = start(config, ScriptedGate::new(true))?;
    h.create().await?;

    tokio::time::sleep(Duration::from_millis(500)).await;
    let status = h.call(RequestType::GetStatus, json!({})).await?;
    assert_eq!(status["state"], "LOCKED");
    assert_eq!(status["isUnlocked"], false);
    Ok(())
}

#[tokio::test]
async fn rejected_requests_do_not_delay_auto_lock() -> TestResult {
    let config = AppConfig {
        auto_lock_enabled: true,
        auto_lock_timeout_ms: 300,
        allowed_origins: Some(Vec::new()),
        ..fast_config()
    };
    let h = start(config, ScriptedGate::new(true))?;
    h.create().await?;
    let stranger = Origin::Browser("https://stranger.example".into());

    for _ in 0..10 {
        let result = h.call_as(stranger.clone(), RequestType::EthAccounts, json!({ "params": [] })).await;
        assert_eq!(validation_code(&result), Some(ValidationCode::PermissionDenied));
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    let status = h.call(RequestType::GetStatus, json!({})).await?;
    assert_eq!(status["state"], "LOCKED");
    assert_eq!(status["isUnlocked"], false);
    assert_eq!(status["hasKeystore"], true);
    assert_eq!(status["errorCount"], 0);
    assert_eq!(status["breakerTripped"], false);
    assert_eq!(h.gate.calls(), 0);
    Ok(())
}

// ---------------------------------------------------------------------------
// Circuit breaker
// ---------------------------------------------------------------------------

#[tokio::test]
async fn corrupt_keystore_trips_breaker() -> TestResult {
    let config = AppConfig {
        breaker_threshold: 3,
        ..fast_config()
    };
    let h = start(config, ScriptedGate::new(true))?;
    h.create().await?;
    h.call(RequestType::LockKeystore, json!({})).await?;

    for entry in std::fs::read_dir(h.dir.path()).map_err(|e| KeywardError::StorageError { reason: e.to_string() })? {
        let path = entry.map_err(|e| KeywardError::StorageError { reason: e.to_string() })?.path();
        std::fs::write(path, b"{ not json").map_err(|e| KeywardError::StorageError { reason: e.to_string() })?;
    }

    for _ in 0..3 {
        let result = h
            .call(RequestType::UnlockKeystore, json!({ "password": PASSWORD }))
            .await;
        assert!(matches!(result, Err(KeywardError::Corrupt { .. })));
    }

    let status = h.call(RequestType::GetStatus, json!({})).await?;
    assert_eq!(status["state"], "ERROR");
    assert_eq!(status["breakerTripped"], true);

    let after = h
        .call(RequestType::UnlockKeystore, json!({ "password": PASSWORD }))
        .await;
    assert_eq!(validation_code(&after), Some(ValidationCode::DaemonNotReady));
    Ok(())
}
