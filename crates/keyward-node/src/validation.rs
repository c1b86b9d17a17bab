//! Admission control.
//!
//! [`ValidationPipeline::validate`] runs six checks in a fixed order
//! and stops at the first failure:
//!
//! 1. **Daemon state** — `daemon_not_ready` while `STARTING` or
//!    `ERROR`, except for status / ping / shutdown.
//! 2. **Keystore existence** — `no_keystore` for types that need one.
//! 3. **Session** — `wallet_locked` for types that need `UNLOCKED`.
//! 4. **Permission** — `permission_denied` if an authority is
//!    installed and the (non-CLI) origin is not permitted.
//! 5. **Rate limit** — `rate_limited` past the per-type quota.
//! 6. **Schema** — `invalid_request` when a required field is missing.
//!
//! A rejection never mutates daemon, session or keystore state.
//! Requests rejected before the rate-limit check consume no budget.

use keyward_protocol::request::{Request, RequestType};
use keyward_types::config::AppConfig;
use keyward_types::{KeywardError, Result, ValidationCode};
use serde_json::Value;
use std::time::Duration;

use crate::permissions::PermissionAuthority;
use crate::rate_limiter::RateLimiter;
use crate::state::DaemonState;

// ---------------------------------------------------------------------------
// Context
// ---------------------------------------------------------------------------

/// Daemon facts the pipeline judges against.
#[derive(Clone, Copy, Debug)]
pub struct ValidationContext {
    /// Current lifecycle state.
    pub state: DaemonState,
    /// Whether a keystore file exists.
    pub has_keystore: bool,
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

/// The ordered admission checks.
pub struct ValidationPipeline {
    rate_limiter: RateLimiter,
    authority: Option<Box<dyn PermissionAuthority>>,
}

impl ValidationPipeline {
    /// Creates a pipeline.
    pub fn new(rate_limiter: RateLimiter, authority: Option<Box<dyn PermissionAuthority>>) -> Self {
        Self {
            rate_limiter,
            authority,
        }
    }

    /// Creates a pipeline from configuration, without an authority.
    pub fn from_config(config: &AppConfig) -> Self {
        Self::new(
            RateLimiter::new(
                Duration::from_millis(config.rate_window_ms),
                config.rate_quotas.clone(),
            ),
            None,
        )
    }

    /// The installed permission authority.
    pub fn authority(&self) -> Option<&dyn PermissionAuthority> {
        self.authority.as_deref()
    }

    /// The installed permission authority, mutably.
    pub fn authority_mut(&mut self) -> Option<&mut (dyn PermissionAuthority + 'static)> {
        self.authority.as_deref_mut()
    }

    /// The rate limiter.
    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.rate_limiter
    }

    /// Runs all six checks.
    ///
    /// # Errors
    ///
    /// Returns [`KeywardError::Validation`] carrying the code of the
    /// first failing check.
    pub fn validate(&self, req: &Request, ctx: &ValidationContext) -> Result<()> {
        check_daemon_state(req, ctx)?;
        check_keystore(req, ctx)?;
        check_session(req, ctx)?;
        self.check_permission(req)?;
        self.rate_limiter.check(&req.origin, req.kind)?;
        check_schema(req)
    }

    fn check_permission(&self, req: &Request) -> Result<()> {
        let Some(authority) = self.authority.as_deref() else {
            return Ok(());
        };
        if req.origin.is_cli() || authority.is_permitted(&req.origin, req.kind) {
            return Ok(());
        }
        Err(reject(
            ValidationCode::PermissionDenied,
            format!("{} is not permitted to call {}", req.origin, req.kind),
        ))
    }
}

fn reject(code: ValidationCode, message: impl Into<String>) -> KeywardError {
    KeywardError::validation(code, message)
}

// ---------------------------------------------------------------------------
// Checks 1-3
// ---------------------------------------------------------------------------

fn check_daemon_state(req: &Request, ctx: &ValidationContext) -> Result<()> {
    let blocked = matches!(ctx.state, DaemonState::Starting | DaemonState::Error);
    if blocked && !req.kind.always_allowed() {
        return Err(reject(
            ValidationCode::DaemonNotReady,
            format!("daemon is {}", ctx.state),
        ));
    }
    Ok(())
}

fn check_keystore(req: &Request, ctx: &ValidationContext) -> Result<()> {
    if req.kind.requires_keystore() && !ctx.has_keystore {
        return Err(reject(ValidationCode::NoKeystore, "no keystore found; create or import one first"));
    }
    Ok(())
}

fn check_session(req: &Request, ctx: &ValidationContext) -> Result<()> {
    if req.kind.requires_unlocked() && ctx.state != DaemonState::Unlocked {
        return Err(reject(ValidationCode::WalletLocked, "wallet is locked"));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Check 6: schema
// ---------------------------------------------------------------------------

/// Required `data` fields per IPC type.
fn required_fields(kind: RequestType) -> &'static [&'static str] {
    match kind {
        RequestType::UnlockKeystore => &["password"],
        RequestType::CreateKeystore => &["password"],
        RequestType::ImportKeystore => &["secret", "password"],
        RequestType::CreateAccount => &["password"],
        RequestType::HideAccount | RequestType::ShowAccount => &["address", "password"],
        RequestType::SetAccountLabel => &["address", "label", "password"],
        RequestType::SignTransaction => &["transaction", "address"],
        RequestType::SignMessage => &["message", "address"],
        _ => &[],
    }
}

/// Minimum positional parameters per native method.
fn required_params(kind: RequestType) -> usize {
    match kind {
        RequestType::EthSendTransaction | RequestType::EthSignTransaction => 1,
        RequestType::PersonalSign | RequestType::EthSign => 2,
        _ => 0,
    }
}

fn check_schema(req: &Request) -> Result<()> {
    if let Some(missing) = required_fields(req.kind).iter().find(|f| !req.has_field(f)) {
        return Err(reject(
            ValidationCode::InvalidRequest,
            format!("{} requires data.{missing}", req.kind),
        ));
    }

    let needed = required_params(req.kind);
    if needed > 0 {
        let params = req.data.get("params").and_then(Value::as_array);
        let present = params.map(|p| p.iter().take(needed).filter(|v| !v.is_null()).count());
        if present != Some(needed) {
            return Err(reject(
                ValidationCode::InvalidRequest,
                format!("{} requires {needed} params", req.kind),
            ));
        }
        let tx_is_object = params
            .and_then(|p| p.first())
            .map(Value::is_object)
            .unwrap_or(false);
        if needed == 1 && !tx_is_object {
            return Err(reject(
                ValidationCode::InvalidRequest,
                format!("{} requires a transaction object", req.kind),
            ));
        }
    }

    if req.kind == RequestType::SignTransaction
        && !req.data.get("transaction").map(Value::is_object).unwrap_or(false)
    {
        return Err(reject(
            ValidationCode::InvalidRequest,
            "sign_transaction requires data.transaction to be an object",
        ));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::permissions::OriginAllowList;
    use keyward_protocol::request::Origin;
    use keyward_types::config::RateQuotas;
    use serde_json::json;

    fn pipeline() -> ValidationPipeline {
        ValidationPipeline::new(RateLimiter::new(Duration::from_secs(60), RateQuotas::default()), None)
    }

    fn ctx(state: DaemonState, has_keystore: bool) -> ValidationContext {
        ValidationContext { state, has_keystore }
    }

    fn code_of(r: Result<()>) -> Option<ValidationCode> {
        match r {
            Err(KeywardError::Validation { code, .. }) => Some(code),
            _ => None,
        }
    }

    fn cli(kind: RequestType, data: Value) -> Request {
        Request::new("1", kind, data, Origin::Cli)
    }

    #[test]
    fn starting_blocks_all_but_allow_list() {
        let p = pipeline();
        let c = ctx(DaemonState::Starting, true);
        assert_eq!(
            code_of(p.validate(&cli(RequestType::UnlockKeystore, json!({"password": "x"})), &c)),
            Some(ValidationCode::DaemonNotReady)
        );
        for kind in [RequestType::GetStatus, RequestType::Ping, RequestType::Shutdown] {
            assert!(p.validate(&cli(kind, json!({})), &c).is_ok(), "{kind}");
        }
    }

    #[test]
    fn error_state_blocks() {
        let p = pipeline();
        let c = ctx(DaemonState::Error, true);
        assert_eq!(
            code_of(p.validate(&cli(RequestType::LockKeystore, json!({})), &c)),
            Some(ValidationCode::DaemonNotReady)
        );
        assert!(p.validate(&cli(RequestType::GetStatus, json!({})), &c).is_ok());
    }

    #[test]
    fn missing_keystore() {
        let p = pipeline();
        let req = cli(RequestType::UnlockKeystore, json!({"password": "x"}));
        assert_eq!(
            code_of(p.validate(&req, &ctx(DaemonState::Ready, false))),
            Some(ValidationCode::NoKeystore)
        );
        let create = cli(RequestType::CreateKeystore, json!({"password": "password123"}));
        assert!(p.validate(&create, &ctx(DaemonState::Ready, false)).is_ok());
    }

    #[test]
    fn locked_wallet() {
        let p = pipeline();
        let req = cli(
            RequestType::SignTransaction,
            json!({"transaction": {}, "address": "0xabc"}),
        );
        assert_eq!(
            code_of(p.validate(&req, &ctx(DaemonState::Locked, true))),
            Some(ValidationCode::WalletLocked)
        );
        assert!(p.validate(&req, &ctx(DaemonState::Unlocked, true)).is_ok());
    }

    #[test]
    fn permission_denied_for_unknown_origin() {
        let p = ValidationPipeline::new(
            RateLimiter::new(Duration::from_secs(60), RateQuotas::default()),
            Some(Box::new(OriginAllowList::default())),
        );
        let page = Origin::Browser("https://evil.example".into());
        let req = Request::new("1", RequestType::EthAccounts, json!({"params": []}), page.clone());
        assert_eq!(
            code_of(p.validate(&req, &ctx(DaemonState::Unlocked, true))),
            Some(ValidationCode::PermissionDenied)
        );
        let connect = Request::new("2", RequestType::EthRequestAccounts, json!({"params": []}), page);
        assert!(p.validate(&connect, &ctx(DaemonState::Unlocked, true)).is_ok());
    }

    #[test]
    fn no_authority_is_open() {
        let p = pipeline();
        let page = Origin::Browser("https://any.example".into());
        let req = Request::new("1", RequestType::EthAccounts, json!({"params": []}), page);
        assert!(p.validate(&req, &ctx(DaemonState::Unlocked, true)).is_ok());
    }

    #[test]
    fn schema_checked_last() {
        let p = pipeline();
        let bad = cli(RequestType::UnlockKeystore, json!({}));
        assert_eq!(
            code_of(p.validate(&bad, &ctx(DaemonState::Locked, true))),
            Some(ValidationCode::InvalidRequest)
        );
        assert_eq!(
            code_of(p.validate(&bad, &ctx(DaemonState::Starting, true))),
            Some(ValidationCode::DaemonNotReady)
        );
    }

    #[test]
    fn schema_rules() {
        let p = pipeline();
        let c = ctx(DaemonState::Unlocked, true);
        let cases = [
            (RequestType::SignTransaction, json!({"address": "0xabc"})),
            (RequestType::SignTransaction, json!({"transaction": "0x00", "address": "0xabc"})),
            (RequestType::SignMessage, json!({"message": "hi"})),
            (RequestType::SetAccountLabel, json!({"address": "0xabc", "password": "x"})),
            (RequestType::ImportKeystore, json!({"password": "x"})),
        ];
        for (kind, data) in cases {
            assert_eq!(
                code_of(p.validate(&cli(kind, data), &c)),
                Some(ValidationCode::InvalidRequest),
                "{kind}"
            );
        }

        let page = Origin::Browser("https://app.example".into());
        let personal = Request::new("1", RequestType::PersonalSign, json!({"params": ["0x68"]}), page.clone());
        assert_eq!(code_of(p.validate(&personal, &c)), Some(ValidationCode::InvalidRequest));
        let send = Request::new("2", RequestType::EthSendTransaction, json!({"params": ["0x00"]}), page);
        assert_eq!(code_of(p.validate(&send, &c)), Some(ValidationCode::InvalidRequest));
    }

    #[test]
    fn rejection_does_not_consume_budget() {
        let p = pipeline();
        let locked = ctx(DaemonState::Locked, true);
        let req = cli(RequestType::UnlockKeystore, json!({}));
        for _ in 0..20 {
            let _ = p.validate(&req, &ctx(DaemonState::Starting, true));
        }
        let ok = cli(RequestType::UnlockKeystore, json!({"password": "x"}));
        for _ in 0..5 {
            assert!(p.validate(&ok, &locked).is_ok());
        }
        assert_eq!(
            code_of(p.validate(&ok, &locked)),
            Some(ValidationCode::RateLimited)
        );
    }
}
