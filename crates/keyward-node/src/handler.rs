//! Request parameter parsing and response shaping.
//!
//! Everything here is pure: the event loop decides *when* something
//! runs, these helpers decide *what* a request means and what its reply
//! looks like on the wire.

use keyward_crypto::signing::to_checksum_address;
use keyward_crypto::transaction::{SignedTransaction, TransactionRequest};
use keyward_keystore::account::AccountSummary;
use keyward_protocol::request::{Request, RequestType};
use keyward_types::{KeywardError, Result, ValidationCode};
use serde_json::{json, Value};

// ---------------------------------------------------------------------------
// Routing
// ---------------------------------------------------------------------------

/// How the event loop executes a request type.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Route {
    /// Answered synchronously from in-memory state.
    Immediate,
    /// Needs an scrypt job off the event loop.
    Job,
    /// Needs a human approval, then a signature.
    Sign,
    /// The `eth_requestAccounts` connect flow.
    Connect,
}

/// Classifies a request type.
pub fn route(kind: RequestType) -> Route {
    match kind {
        RequestType::UnlockKeystore
        | RequestType::CreateKeystore
        | RequestType::ImportKeystore
        | RequestType::CreateAccount
        | RequestType::HideAccount
        | RequestType::ShowAccount
        | RequestType::SetAccountLabel => Route::Job,
        RequestType::SignTransaction
        | RequestType::SignMessage
        | RequestType::EthSendTransaction
        | RequestType::EthSignTransaction
        | RequestType::PersonalSign
        | RequestType::EthSign => Route::Sign,
        RequestType::EthRequestAccounts => Route::Connect,
        _ => Route::Immediate,
    }
}

// ---------------------------------------------------------------------------
// Signing requests
// ---------------------------------------------------------------------------

/// What a signing request asks for.
#[derive(Clone, Debug)]
pub enum SignPlan {
    /// Sign a transaction.
    Transaction {
        /// Parsed transaction.
        tx: TransactionRequest,
        /// Signing account.
        address: String,
    },
    /// Sign a message with EIP-191.
    Message {
        /// Raw message bytes.
        message: Vec<u8>,
        /// Signing account.
        address: String,
    },
}

impl SignPlan {
    /// The signing account.
    pub fn address(&self) -> &str {
        match self {
            Self::Transaction { address, .. } | Self::Message { address, .. } => address,
        }
    }
}

fn invalid(message: impl Into<String>) -> KeywardError {
    KeywardError::validation(ValidationCode::InvalidRequest, message)
}

fn param(req: &Request, index: usize) -> Option<&Value> {
    req.data.get("params").and_then(Value::as_array).and_then(|p| p.get(index))
}

fn param_str(req: &Request, index: usize) -> Result<&str> {
    param(req, index)
        .and_then(Value::as_str)
        .ok_or_else(|| invalid(format!("{}: params[{index}] must be a string", req.kind)))
}

/// Decodes a message parameter: `0x` hex becomes bytes, anything else
/// is taken as UTF-8 text.
pub fn decode_message(message: &str) -> Vec<u8> {
    if let Some(body) = message.strip_prefix("0x") {
        if body.len() % 2 == 0 {
            if let Ok(bytes) = hex::decode(body) {
                return bytes;
            }
        }
    }
    message.as_bytes().to_vec()
}

/// Extracts the signing plan from a signing request.
///
/// | type | parameters |
/// |------|------------|
/// | `sign_transaction` | `data.transaction`, `data.address` |
/// | `sign_message` | `data.message`, `data.address` |
/// | `eth_sendTransaction`, `eth_signTransaction` | `params[0]` transaction with `from` |
/// | `personal_sign` | `params = [message, address]` |
/// | `eth_sign` | `params = [address, message]` |
///
/// # Errors
///
/// Returns an `invalid_request` validation error for malformed input.
pub fn sign_plan(req: &Request) -> Result<SignPlan> {
    match req.kind {
        RequestType::SignTransaction => {
            let tx = TransactionRequest::from_json(req.data.get("transaction").unwrap_or(&Value::Null))?;
            let address = req.require_str("address")?.to_string();
            Ok(SignPlan::Transaction { tx, address })
        }
        RequestType::SignMessage => Ok(SignPlan::Message {
            message: decode_message(req.require_str("message")?),
            address: req.require_str("address")?.to_string(),
        }),
        RequestType::EthSendTransaction | RequestType::EthSignTransaction => {
            let tx = TransactionRequest::from_json(param(req, 0).unwrap_or(&Value::Null))?;
            let from = tx
                .from
                .ok_or_else(|| invalid(format!("{}: transaction.from is required", req.kind)))?;
            Ok(SignPlan::Transaction {
                address: to_checksum_address(&from),
                tx,
            })
        }
        RequestType::PersonalSign => Ok(SignPlan::Message {
            message: decode_message(param_str(req, 0)?),
            address: param_str(req, 1)?.to_string(),
        }),
        RequestType::EthSign => Ok(SignPlan::Message {
            message: decode_message(param_str(req, 1)?),
            address: param_str(req, 0)?.to_string(),
        }),
        other => Err(invalid(format!("{other} is not a signing request"))),
    }
}

/// Shapes a signed transaction for `kind`.
pub fn transaction_response(kind: RequestType, signed: &SignedTransaction) -> Value {
    match kind {
        RequestType::EthSignTransaction => json!(signed.raw_transaction),
        _ => json!({ "rawTransaction": signed.raw_transaction, "hash": signed.hash }),
    }
}

/// Shapes a message signature for `kind`.
pub fn message_response(kind: RequestType, signature: String) -> Value {
    match kind {
        RequestType::SignMessage => json!({ "signature": signature }),
        _ => json!(signature),
    }
}

// ---------------------------------------------------------------------------
// Other responses
// ---------------------------------------------------------------------------

/// Shapes an account listing for `kind`.
pub fn accounts_response(kind: RequestType, summaries: &[AccountSummary]) -> Value {
    let addresses: Vec<&str> = summaries.iter().map(|s| s.address.as_str()).collect();
    if kind.is_native() {
        json!(addresses)
    } else {
        json!({ "accounts": addresses, "details": summaries })
    }
}

/// `unlock_response` payload.
pub fn unlock_response(unlocked: bool, accounts: &[String]) -> Value {
    if unlocked {
        json!({ "success": true, "accounts": accounts })
    } else {
        json!({ "success": false, "error": KeywardError::InvalidPassword.to_string() })
    }
}

/// Plain acknowledgement.
pub fn success() -> Value {
    json!({ "success": true })
}

/// `ping` / `wallet_ping` payload.
pub fn pong(kind: RequestType) -> Value {
    if kind.is_native() {
        json!("pong")
    } else {
        json!({ "pong": true, "timestamp": chrono::Utc::now().timestamp_millis() })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use keyward_protocol::request::Origin;

    const ADDR: &str = "0xf39Fd6e51aad88F6F4ce6aB8827279cffFb92266";

    fn native(kind: RequestType, params: Value) -> Request {
        Request::new("1", kind, json!({ "params": params }), Origin::Browser("https://app.example".into()))
    }

    #[test]
    fn routes() {
        assert_eq!(route(RequestType::UnlockKeystore), Route::Job);
        assert_eq!(route(RequestType::HideAccount), Route::Job);
        assert_eq!(route(RequestType::PersonalSign), Route::Sign);
        assert_eq!(route(RequestType::EthRequestAccounts), Route::Connect);
        assert_eq!(route(RequestType::GetAccounts), Route::Immediate);
        assert_eq!(route(RequestType::DeleteKeystore), Route::Immediate);
    }

    #[test]
    fn message_decoding() {
        assert_eq!(decode_message("0x68656c6c6f"), b"hello".to_vec());
        assert_eq!(decode_message("hello"), b"hello".to_vec());
        assert_eq!(decode_message("0xzz"), b"0xzz".to_vec());
        assert_eq!(decode_message("0x123"), b"0x123".to_vec());
    }

    #[test]
    fn personal_sign_and_eth_sign_param_order() -> std::result::Result<(), KeywardError> {
        let personal = sign_plan(&native(RequestType::PersonalSign, json!(["0x6869", ADDR])))?;
        let eth = sign_plan(&native(RequestType::EthSign, json!([ADDR, "0x6869"])))?;
        for plan in [personal, eth] {
            match plan {
                SignPlan::Message { message, address } => {
                    assert_eq!(message, b"hi".to_vec());
                    assert_eq!(address, ADDR);
                }
                SignPlan::Transaction { .. } => panic!("expected message plan"),
            }
        }
        Ok(())
    }

    #[test]
    fn send_transaction_needs_from() {
        let tx = json!({"to": ADDR, "nonce": 0, "gas": 21000, "gasPrice": 1, "chainId": 1});
        let result = sign_plan(&native(RequestType::EthSendTransaction, json!([tx])));
        assert!(matches!(
            result,
            Err(KeywardError::Validation { code: ValidationCode::InvalidRequest, .. })
        ));
    }

    #[test]
    fn send_transaction_uses_from() -> std::result::Result<(), KeywardError> {
        let tx = json!({"from": ADDR.to_lowercase(), "to": ADDR, "nonce": 0, "gas": 21000, "gasPrice": 1, "chainId": 1});
        let plan = sign_plan(&native(RequestType::EthSendTransaction, json!([tx])))?;
        assert_eq!(plan.address(), ADDR);
        Ok(())
    }

    #[test]
    fn response_shapes() {
        let summaries = vec![AccountSummary {
            address: ADDR.into(),
            index: 0,
            label: "Account 1".into(),
            visible: true,
            derivation_path: Some("m/44'/60'/0'/0/0".into()),
        }];
        assert_eq!(accounts_response(RequestType::EthAccounts, &summaries), json!([ADDR]));
        assert_eq!(accounts_response(RequestType::GetAccounts, &summaries)["accounts"], json!([ADDR]));
        assert_eq!(message_response(RequestType::PersonalSign, "0x01".into()), json!("0x01"));
        assert_eq!(
            message_response(RequestType::SignMessage, "0x01".into()),
            json!({"signature": "0x01"})
        );
        assert_eq!(unlock_response(false, &[])["success"], json!(false));
        assert_eq!(pong(RequestType::WalletPing), json!("pong"));
    }
}
