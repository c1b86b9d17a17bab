//! The human-approval capability.
//!
//! The event loop never decides on its own whether to unlock for a web
//! page, sign, or expose accounts: it asks an [`ApprovalGate`] and
//! waits. Prompts run in their own tasks, so a slow human only delays
//! the request that is waiting on them.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use keyward_crypto::transaction::{FeeModel, TransactionRequest};
use keyward_protocol::request::Origin;
use keyward_types::{KeywardError, Result};
use zeroize::Zeroizing;

// ---------------------------------------------------------------------------
// Prompt payloads
// ---------------------------------------------------------------------------

/// A transaction awaiting approval.
#[derive(Clone, Debug)]
pub struct TransactionPrompt {
    /// Requesting origin.
    pub origin: Origin,
    /// Signing account.
    pub address: String,
    /// The parsed transaction.
    pub tx: TransactionRequest,
}

impl TransactionPrompt {
    /// Human-readable summary lines.
    pub fn summary(&self) -> Vec<String> {
        let to = self
            .tx
            .to
            .map(|a| a.to_string())
            .unwrap_or_else(|| "(contract creation)".into());
        let fee = match self.tx.fee {
            FeeModel::Legacy { gas_price } => format!("gasPrice {gas_price} wei"),
            FeeModel::Dynamic {
                max_fee_per_gas,
                max_priority_fee_per_gas,
            } => format!("maxFee {max_fee_per_gas} wei, tip {max_priority_fee_per_gas} wei"),
        };
        vec![
            format!("origin:   {}", self.origin),
            format!("from:     {}", self.address),
            format!("to:       {to}"),
            format!("value:    {} wei", self.tx.value),
            format!("chain:    {}", self.tx.chain_id),
            format!("nonce:    {}", self.tx.nonce),
            format!("gas:      {} ({fee})", self.tx.gas_limit),
            format!("data:     {} bytes", self.tx.data.len()),
        ]
    }
}

/// A message awaiting a signature.
#[derive(Clone, Debug)]
pub struct MessagePrompt {
    /// Requesting origin.
    pub origin: Origin,
    /// Signing account.
    pub address: String,
    /// Raw message bytes.
    pub message: Vec<u8>,
}

impl MessagePrompt {
    /// The message as text if it is UTF-8, otherwise as `0x` hex.
    pub fn display_text(&self) -> String {
        match std::str::from_utf8(&self.message) {
            Ok(text) if !text.chars().any(|c| c.is_control() && c != '\n') => text.to_string(),
            _ => format!("0x{}", hex::encode(&self.message)),
        }
    }
}

// ---------------------------------------------------------------------------
// ApprovalGate
// ---------------------------------------------------------------------------

/// Human-in-the-loop decisions.
///
/// Implementations may take arbitrarily long. A declined prompt is
/// `Ok(false)`; [`ApprovalGate::prompt_unlock`] signals a decline with
/// [`KeywardError::UserRejected`].
#[async_trait]
pub trait ApprovalGate: Send + Sync {
    /// Asks for the keystore password on behalf of `origin`.
    async fn prompt_unlock(&self, origin: &Origin) -> Result<Zeroizing<String>>;

    /// Asks whether to sign a transaction.
    async fn prompt_transaction_approval(&self, prompt: &TransactionPrompt) -> Result<bool>;

    /// Asks whether to sign a message.
    async fn prompt_message_signature(&self, prompt: &MessagePrompt) -> Result<bool>;

    /// Asks whether `origin` may see the wallet's accounts.
    async fn prompt_account_access(&self, origin: &Origin) -> Result<bool>;
}

/// Shared handle to the gate.
pub type SharedGate = Arc<dyn ApprovalGate>;

/// Awaits a prompt, auto-rejecting once `timeout` elapses.
///
/// # Errors
///
/// [`KeywardError::UserRejected`] on timeout, otherwise whatever the
/// prompt returns.
pub async fn with_timeout<T, F>(timeout: Option<Duration>, prompt: F) -> Result<T>
where
    F: std::future::Future<Output = Result<T>>,
{
    match timeout {
        None => prompt.await,
        Some(limit) => match tokio::time::timeout(limit, prompt).await {
            Ok(result) => result,
            Err(_) => {
                tracing::info!(timeout_ms = limit.as_millis() as u64, "approval prompt expired");
                Err(KeywardError::UserRejected)
            }
        },
    }
}

/// Converts a yes/no decision into a result.
///
/// # Errors
///
/// [`KeywardError::UserRejected`] for `false`.
pub fn require_approval(approved: bool) -> Result<()> {
    if approved {
        Ok(())
    } else {
        Err(KeywardError::UserRejected)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn timeout_rejects() {
        let never = std::future::pending::<Result<bool>>();
        let r = with_timeout(Some(Duration::from_secs(30)), never).await;
        assert!(matches!(r, Err(KeywardError::UserRejected)));
    }

    #[tokio::test]
    async fn no_timeout_passes_through() {
        let r = with_timeout(None, async { Ok::<_, KeywardError>(true) }).await;
        assert!(matches!(r, Ok(true)));
    }

    #[test]
    fn decline_is_user_rejected() {
        assert!(require_approval(true).is_ok());
        assert!(matches!(require_approval(false), Err(KeywardError::UserRejected)));
    }

    #[test]
    fn message_display() {
        let text = MessagePrompt {
            origin: Origin::Cli,
            address: "0xabc".into(),
            message: b"Sign in\nnonce 7".to_vec(),
        };
        assert_eq!(text.display_text(), "Sign in\nnonce 7");

        let binary = MessagePrompt {
            message: vec![0x00, 0xff],
            ..text
        };
        assert_eq!(binary.display_text(), "0x00ff");
    }
}
