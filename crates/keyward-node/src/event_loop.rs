//! Main event loop driving the daemon.
//!
//! [`run_event_loop`] is spawned as a tokio task by `Daemon::start`. It
//! is the only owner of the keystore, the state machine and the
//! session, so every mutation is serialized here. `tokio::select!`
//! multiplexes:
//!
//! 1. **Commands** — requests and session notifications from the
//!    transports.
//! 2. **Continuations** — results of work that left the loop: scrypt
//!    jobs on the blocking pool and human approval prompts.
//! 3. **Keystore watcher** — files appearing or disappearing on disk.
//! 4. **Auto-lock deadline** — armed only while unlocked with
//!    auto-lock enabled.
//! 5. **Shutdown signal** — graceful exit via `watch` channel.
//!
//! Slow work never runs inline. At most one scrypt job is in flight;
//! further job requests wait in a FIFO queue so an account mutation
//! always starts from the payload its predecessor committed.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use keyward_keystore::job::{SealJob, SealKind, SealedWallet, UnlockJob, UnlockedWallet};
use keyward_keystore::{AccountChange, KeystoreEvent};
use keyward_protocol::request::{Request, RequestType};
use keyward_types::{KeywardError, Result, ValidationCode};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::time::Instant;
use zeroize::Zeroizing;

use crate::approval::{require_approval, with_timeout, MessagePrompt, TransactionPrompt};
use crate::command::{DaemonCommand, DaemonStatus, Reply};
use crate::daemon::DaemonRuntime;
use crate::events::DaemonEvent;
use crate::handler::{
    accounts_response, message_response, pong, route, sign_plan, success, transaction_response,
    unlock_response, Route, SignPlan,
};
use crate::state::DaemonState;
use crate::validation::ValidationContext;

// ---------------------------------------------------------------------------
// Off-loop work
// ---------------------------------------------------------------------------

/// A scrypt-bound keystore job ready to run.
enum Work {
    Unlock(UnlockJob),
    Seal(SealJob),
}

enum JobOutput {
    Unlocked(UnlockedWallet),
    Sealed(SealedWallet),
}

impl Work {
    fn run(self) -> Result<JobOutput> {
        match self {
            Self::Unlock(job) => job.run().map(JobOutput::Unlocked),
            Self::Seal(job) => job.run().map(JobOutput::Sealed),
        }
    }
}

/// A request waiting for the job slot.
struct PendingJob {
    request: Request,
    reply: Reply,
    /// Password collected by a connect-flow unlock prompt.
    prompted_password: Option<Zeroizing<String>>,
}

/// Results flowing back into the loop from spawned tasks.
enum Continuation {
    JobDone {
        request: Request,
        reply: Reply,
        result: Result<JobOutput>,
    },
    SignDecision {
        request: Request,
        reply: Reply,
        plan: SignPlan,
        decision: Result<bool>,
    },
    UnlockPrompted {
        request: Request,
        reply: Reply,
        password: Result<Zeroizing<String>>,
    },
    AccessDecision {
        request: Request,
        reply: Reply,
        decision: Result<bool>,
    },
}

// ---------------------------------------------------------------------------
// Event loop entry point
// ---------------------------------------------------------------------------

/// Runs the daemon event loop until shutdown.
///
/// On exit the keystore is locked and the shared shutdown signal is
/// raised so the transports stop as well.
pub(crate) async fn run_event_loop(rt: DaemonRuntime) {
    tracing::info!("daemon event loop started");

    let (internal_tx, internal_rx) = mpsc::unbounded_channel();
    let mut orch = Orchestrator {
        rt,
        internal_tx,
        internal_rx,
        job_in_flight: false,
        deferred: VecDeque::new(),
    };

    orch.transition(DaemonState::Ready, json!({ "reason": "startup" }));
    if orch.rt.keystore.has_keystore() {
        orch.transition(DaemonState::Locked, json!({ "reason": "keystore found" }));
    }

    loop {
        let deadline = orch.rt.session.deadline();

        tokio::select! {
            // ---------------------------------------------------------------
            // 1. Commands from the transports.
            // ---------------------------------------------------------------
            Some(cmd) = orch.rt.command_rx.recv() => {
                if orch.handle_command(cmd) {
                    tracing::info!("shutdown requested -- exiting event loop");
                    break;
                }
            }

            // ---------------------------------------------------------------
            // 2. Finished jobs and answered prompts.
            // ---------------------------------------------------------------
            Some(cont) = orch.internal_rx.recv() => {
                orch.handle_continuation(cont);
            }

            // ---------------------------------------------------------------
            // 3. Keystore directory changes.
            // ---------------------------------------------------------------
            Some(event) = orch.rt.keystore_rx.recv() => {
                orch.handle_keystore_event(event);
            }

            // ---------------------------------------------------------------
            // 4. Auto-lock deadline.
            // ---------------------------------------------------------------
            _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                if orch.rt.session.is_expired(Instant::now()) {
                    tracing::info!("auto-lock timeout elapsed");
                    orch.emit(DaemonEvent::AutoLockFired);
                    orch.lock("auto_lock");
                }
            }

            // ---------------------------------------------------------------
            // 5. Shutdown signal via watch channel.
            // ---------------------------------------------------------------
            res = orch.rt.shutdown_rx.changed() => {
                if res.is_err() || *orch.rt.shutdown_rx.borrow() {
                    tracing::info!("shutdown signal received -- exiting event loop");
                    break;
                }
            }
        }
    }

    orch.lock("shutdown");
    let _ = orch.rt.shutdown_tx.send(true);
    tracing::info!("daemon event loop exited");
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

struct Orchestrator {
    rt: DaemonRuntime,
    internal_tx: mpsc::UnboundedSender<Continuation>,
    internal_rx: mpsc::UnboundedReceiver<Continuation>,
    job_in_flight: bool,
    deferred: VecDeque<PendingJob>,
}

impl Orchestrator {
    // -- Commands ---------------------------------------------------------

    /// Returns `true` if the loop should exit.
    fn handle_command(&mut self, cmd: DaemonCommand) -> bool {
        match cmd {
            DaemonCommand::Request { request, reply } => self.handle_request(request, reply),
            DaemonCommand::SessionOpened => {
                let active = self.rt.session.add_session(Instant::now());
                tracing::debug!(active, "session opened");
                self.emit(DaemonEvent::SessionsChanged { active });
                false
            }
            DaemonCommand::SessionClosed => {
                let active = self.rt.session.remove_session(Instant::now());
                tracing::debug!(active, "session closed");
                self.emit(DaemonEvent::SessionsChanged { active });
                false
            }
            DaemonCommand::Shutdown => true,
        }
    }

    fn handle_request(&mut self, request: Request, reply: Reply) -> bool {
        let ctx = ValidationContext {
            state: self.rt.state.current(),
            has_keystore: self.rt.keystore.has_keystore(),
        };
        if let Err(err) = self.rt.pipeline.validate(&request, &ctx) {
            tracing::debug!(id = %request.id, kind = %request.kind, origin = %request.origin, %err, "request rejected");
            let _ = reply.send(Err(err));
            return false;
        }
        tracing::debug!(id = %request.id, kind = %request.kind, origin = %request.origin, "request admitted");
        // Only admitted requests count as activity for auto-lock.
        self.rt.session.touch(Instant::now());

        match route(request.kind) {
            Route::Immediate if request.kind == RequestType::Shutdown => {
                let _ = reply.send(Ok(success()));
                return true;
            }
            // Deleting under a running job would race its file write.
            Route::Immediate if request.kind == RequestType::DeleteKeystore && self.job_in_flight => {
                self.deferred.push_back(PendingJob {
                    request,
                    reply,
                    prompted_password: None,
                });
            }
            Route::Immediate => {
                let result = self.immediate(&request);
                self.finish(reply, result);
            }
            Route::Job => self.schedule(PendingJob {
                request,
                reply,
                prompted_password: None,
            }),
            Route::Sign => self.begin_sign(request, reply),
            Route::Connect => self.begin_connect(request, reply),
        }
        false
    }

    fn handle_continuation(&mut self, cont: Continuation) {
        match cont {
            Continuation::JobDone { request, reply, result } => {
                self.job_in_flight = false;
                self.on_job_done(request, reply, result);
                self.drain_deferred();
            }
            Continuation::SignDecision {
                request,
                reply,
                plan,
                decision,
            } => {
                let result = decision
                    .and_then(require_approval)
                    .and_then(|()| self.sign(&request, &plan));
                self.finish(reply, result);
            }
            Continuation::UnlockPrompted {
                request,
                reply,
                password,
            } => match password {
                Ok(password) => self.schedule(PendingJob {
                    request,
                    reply,
                    prompted_password: Some(password),
                }),
                Err(err) => self.finish(reply, Err(err)),
            },
            Continuation::AccessDecision {
                request,
                reply,
                decision,
            } => {
                let result = decision.and_then(require_approval).and_then(|()| {
                    if !self.rt.keystore.is_unlocked() {
                        return Err(KeywardError::Locked);
                    }
                    if let Some(authority) = self.rt.pipeline.authority_mut() {
                        authority.grant(&request.origin);
                    }
                    Ok(self.visible_accounts(request.kind))
                });
                self.finish(reply, result);
            }
        }
    }

    /// Records the outcome against the breaker and replies.
    fn finish(&mut self, reply: Reply, result: Result<Value>) {
        match &result {
            Ok(_) => self.rt.state.record_success(),
            Err(err) if !err.is_expected() => {
                if let Some(from) = self.rt.state.handle_error(err) {
                    let errors = self.rt.state.error_count();
                    self.rt.keystore.lock();
                    self.rt.session.on_locked();
                    self.emit(DaemonEvent::StateChanged {
                        from,
                        to: DaemonState::Error,
                    });
                    self.emit(DaemonEvent::BreakerTripped { errors });
                }
            }
            Err(_) => {}
        }
        let _ = reply.send(result);
    }

    // -- Immediate requests -----------------------------------------------

    fn immediate(&mut self, request: &Request) -> Result<Value> {
        match request.kind {
            RequestType::GetStatus | RequestType::WalletGetStatus => {
                serde_json::to_value(self.status()).map_err(|e| KeywardError::ProtocolError {
                    reason: format!("status serialization failed: {e}"),
                })
            }
            RequestType::Ping | RequestType::WalletPing => Ok(pong(request.kind)),
            RequestType::LockKeystore => {
                self.lock("request");
                Ok(success())
            }
            RequestType::GetAccounts => Ok(accounts_response(
                request.kind,
                &self.rt.keystore.account_summaries(request.bool_field("includeHidden")),
            )),
            RequestType::EthAccounts => Ok(self.visible_accounts(request.kind)),
            RequestType::DeleteKeystore => self.delete_keystore(),
            other => Err(KeywardError::ProtocolError {
                reason: format!("{other} has no immediate handler"),
            }),
        }
    }

    fn status(&self) -> DaemonStatus {
        let snapshot = self.rt.session.snapshot();
        DaemonStatus {
            state: self.rt.state.current(),
            previous_state: self.rt.state.previous(),
            breaker_tripped: self.rt.state.is_breaker_tripped(),
            error_count: self.rt.state.error_count(),
            has_keystore: self.rt.keystore.has_keystore(),
            is_unlocked: snapshot.is_unlocked,
            accounts: snapshot.accounts,
            active_session_count: snapshot.active_session_count,
            auto_lock_enabled: snapshot.auto_lock_enabled,
            auto_lock_timeout_ms: snapshot.auto_lock_timeout_ms,
            unlock_timestamp: snapshot.unlock_timestamp,
            version: env!("CARGO_PKG_VERSION"),
        }
    }

    fn visible_accounts(&self, kind: RequestType) -> Value {
        accounts_response(kind, &self.rt.keystore.account_summaries(false))
    }

    fn delete_keystore(&mut self) -> Result<Value> {
        let was_unlocked = self.rt.keystore.is_unlocked();
        self.rt.keystore.delete_keystore()?;
        self.rt.session.on_locked();
        if was_unlocked {
            self.emit(DaemonEvent::Locked { reason: "deleted" });
        }
        if matches!(self.rt.state.current(), DaemonState::Locked | DaemonState::Unlocked) {
            self.transition(DaemonState::Ready, json!({ "reason": "keystore deleted" }));
        }
        Ok(success())
    }

    // -- Keystore jobs ----------------------------------------------------

    fn schedule(&mut self, job: PendingJob) {
        if self.job_in_flight {
            tracing::debug!(kind = %job.request.kind, queued = self.deferred.len() + 1, "keystore job queued");
            self.deferred.push_back(job);
        } else {
            self.start_job(job);
        }
    }

    fn drain_deferred(&mut self) {
        while !self.job_in_flight {
            let Some(job) = self.deferred.pop_front() else {
                break;
            };
            if job.request.kind == RequestType::DeleteKeystore {
                let result = self.immediate(&job.request);
                self.finish(job.reply, result);
            } else {
                self.start_job(job);
            }
        }
    }

    fn start_job(&mut self, job: PendingJob) {
        let PendingJob {
            request,
            reply,
            prompted_password,
        } = job;

        let work = match self.prepare(&request, prompted_password) {
            Ok(work) => work,
            Err(err) => return self.finish(reply, Err(err)),
        };

        self.job_in_flight = true;
        let internal = self.internal_tx.clone();
        tokio::spawn(async move {
            let result = match tokio::task::spawn_blocking(move || work.run()).await {
                Ok(result) => result,
                Err(err) => Err(KeywardError::CryptoError {
                    reason: format!("keystore job failed to complete: {err}"),
                }),
            };
            let _ = internal.send(Continuation::JobDone { request, reply, result });
        });
    }

    fn prepare(&self, request: &Request, prompted: Option<Zeroizing<String>>) -> Result<Work> {
        let keystore = &self.rt.keystore;
        let password = match &prompted {
            Some(password) => password.as_str(),
            None => request.require_str("password")?,
        };
        let address = || request.require_str("address").map(str::to_string);

        match request.kind {
            RequestType::UnlockKeystore | RequestType::EthRequestAccounts => {
                keystore.prepare_unlock(password).map(Work::Unlock)
            }
            RequestType::CreateKeystore => keystore.prepare_create(password).map(Work::Seal),
            RequestType::ImportKeystore => keystore
                .prepare_import(request.require_str("secret")?, password)
                .map(Work::Seal),
            RequestType::CreateAccount => keystore
                .prepare_update(&AccountChange::CreateNext, password)
                .map(Work::Seal),
            RequestType::HideAccount => keystore
                .prepare_update(&AccountChange::Hide { address: address()? }, password)
                .map(Work::Seal),
            RequestType::ShowAccount => keystore
                .prepare_update(&AccountChange::Show { address: address()? }, password)
                .map(Work::Seal),
            RequestType::SetAccountLabel => {
                let change = AccountChange::SetLabel {
                    address: address()?,
                    label: request.require_str("label")?.to_string(),
                };
                keystore.prepare_update(&change, password).map(Work::Seal)
            }
            other => Err(KeywardError::ProtocolError {
                reason: format!("{other} is not a keystore job"),
            }),
        }
    }

    fn on_job_done(&mut self, request: Request, reply: Reply, result: Result<JobOutput>) {
        // The breaker may have tripped while the job ran.
        if self.rt.state.current() == DaemonState::Error {
            drop(result);
            let err = KeywardError::validation(ValidationCode::DaemonNotReady, "daemon is in the ERROR state");
            return self.finish(reply, Err(err));
        }

        match result {
            Ok(JobOutput::Unlocked(wallet)) => {
                if let Err(err) = self.install_unlocked(wallet) {
                    return self.finish(reply, Err(err));
                }
                if request.kind == RequestType::EthRequestAccounts {
                    self.ensure_access(request, reply);
                } else {
                    let response = unlock_response(true, self.rt.session.accounts());
                    self.finish(reply, Ok(response));
                }
            }
            Ok(JobOutput::Sealed(sealed)) => {
                let response = self.install_sealed(request.kind, sealed);
                self.finish(reply, Ok(response));
            }
            Err(KeywardError::InvalidPassword) if request.kind == RequestType::UnlockKeystore => {
                tracing::warn!(origin = %request.origin, "unlock failed: invalid password");
                self.finish(reply, Ok(unlock_response(false, &[])));
            }
            Err(err) => {
                tracing::warn!(kind = %request.kind, %err, "keystore job failed");
                self.finish(reply, Err(err));
            }
        }
    }

    fn install_unlocked(&mut self, wallet: UnlockedWallet) -> Result<()> {
        match self.rt.state.current() {
            DaemonState::Locked | DaemonState::Unlocked => {
                self.rt.keystore.commit_unlock(wallet);
                self.mark_unlocked("unlock");
                Ok(())
            }
            other => Err(KeywardError::validation(
                ValidationCode::DaemonNotReady,
                format!("daemon is {other}; unlock discarded"),
            )),
        }
    }

    fn install_sealed(&mut self, kind: RequestType, sealed: SealedWallet) -> Value {
        let install = sealed.kind() == SealKind::Install;
        let created = self.rt.keystore.commit_seal(sealed);
        if install {
            self.mark_unlocked(kind.as_str());
        } else {
            let accounts = self.rt.keystore.get_accounts(false);
            self.rt.session.set_accounts(accounts);
        }

        match kind {
            RequestType::CreateKeystore => json!({
                "success": true,
                "address": created.address,
                "mnemonic": created.mnemonic.as_ref().map(|m| m.as_str()),
            }),
            RequestType::ImportKeystore | RequestType::CreateAccount => json!({
                "success": true,
                "address": created.address,
            }),
            _ => success(),
        }
    }

    /// Walks the state machine to `UNLOCKED` and starts the session.
    fn mark_unlocked(&mut self, reason: &str) {
        if self.rt.state.current() == DaemonState::Ready {
            self.transition(DaemonState::Locked, json!({ "reason": reason }));
        }
        let accounts = self.rt.keystore.get_accounts(false);
        if self.rt.state.current() != DaemonState::Unlocked {
            self.transition(
                DaemonState::Unlocked,
                json!({ "reason": reason, "accounts": accounts.len() }),
            );
        }
        self.rt.session.on_unlocked(accounts.clone(), Instant::now());
        self.emit(DaemonEvent::Unlocked { accounts });
    }

    /// Drops keys from memory. Idempotent.
    fn lock(&mut self, reason: &'static str) {
        let was_unlocked = self.rt.keystore.is_unlocked();
        self.rt.keystore.lock();
        self.rt.session.on_locked();
        if self.rt.state.current() == DaemonState::Unlocked {
            self.transition(DaemonState::Locked, json!({ "reason": reason }));
        }
        if was_unlocked {
            tracing::info!(reason, "keystore locked");
            self.emit(DaemonEvent::Locked { reason });
        }
    }

    // -- Signing ----------------------------------------------------------

    fn begin_sign(&mut self, request: Request, reply: Reply) {
        let plan = match sign_plan(&request) {
            Ok(plan) => plan,
            Err(err) => return self.finish(reply, Err(err)),
        };

        // Unknown accounts fail without bothering the human.
        let known = self
            .rt
            .keystore
            .account_summaries(true)
            .iter()
            .any(|s| s.address.eq_ignore_ascii_case(plan.address()));
        if !known {
            let err = KeywardError::AccountNotFound {
                address: plan.address().to_string(),
            };
            return self.finish(reply, Err(err));
        }

        let gate = Arc::clone(&self.rt.gate);
        let timeout = self.approval_timeout();
        let internal = self.internal_tx.clone();
        tokio::spawn(async move {
            let decision = match &plan {
                SignPlan::Transaction { tx, address } => {
                    let prompt = TransactionPrompt {
                        origin: request.origin.clone(),
                        address: address.clone(),
                        tx: tx.clone(),
                    };
                    with_timeout(timeout, gate.prompt_transaction_approval(&prompt)).await
                }
                SignPlan::Message { message, address } => {
                    let prompt = MessagePrompt {
                        origin: request.origin.clone(),
                        address: address.clone(),
                        message: message.clone(),
                    };
                    with_timeout(timeout, gate.prompt_message_signature(&prompt)).await
                }
            };
            let _ = internal.send(Continuation::SignDecision {
                request,
                reply,
                plan,
                decision,
            });
        });
    }

    fn sign(&self, request: &Request, plan: &SignPlan) -> Result<Value> {
        let response = match plan {
            SignPlan::Transaction { tx, address } => {
                let signed = self.rt.keystore.sign_transaction(tx, address)?;
                transaction_response(request.kind, &signed)
            }
            SignPlan::Message { message, address } => {
                let signature = self.rt.keystore.sign_message(message, address)?;
                message_response(request.kind, signature)
            }
        };
        tracing::info!(kind = %request.kind, origin = %request.origin, address = plan.address(), "request signed");
        Ok(response)
    }

    // -- Connect ----------------------------------------------------------

    fn begin_connect(&mut self, request: Request, reply: Reply) {
        if self.rt.state.current() == DaemonState::Unlocked {
            return self.ensure_access(request, reply);
        }

        let gate = Arc::clone(&self.rt.gate);
        let timeout = self.approval_timeout();
        let internal = self.internal_tx.clone();
        tokio::spawn(async move {
            let password = with_timeout(timeout, gate.prompt_unlock(&request.origin)).await;
            let _ = internal.send(Continuation::UnlockPrompted {
                request,
                reply,
                password,
            });
        });
    }

    /// Answers a connect with the accounts, prompting for access unless
    /// the origin already holds a grant.
    fn ensure_access(&mut self, request: Request, reply: Reply) {
        let granted = request.origin.is_cli()
            || self
                .rt
                .pipeline
                .authority()
                .map(|a| a.is_granted(&request.origin))
                .unwrap_or(false);
        if granted {
            let response = self.visible_accounts(request.kind);
            return self.finish(reply, Ok(response));
        }

        let gate = Arc::clone(&self.rt.gate);
        let timeout = self.approval_timeout();
        let internal = self.internal_tx.clone();
        tokio::spawn(async move {
            let decision = with_timeout(timeout, gate.prompt_account_access(&request.origin)).await;
            let _ = internal.send(Continuation::AccessDecision {
                request,
                reply,
                decision,
            });
        });
    }

    // -- Keystore watcher -------------------------------------------------

    fn handle_keystore_event(&mut self, event: KeystoreEvent) {
        match event {
            KeystoreEvent::Appeared => {
                self.emit(DaemonEvent::KeystoreAppeared);
                if self.rt.keystore.refresh_presence() && self.rt.state.current() == DaemonState::Ready {
                    self.transition(DaemonState::Locked, json!({ "reason": "keystore appeared" }));
                }
            }
            KeystoreEvent::Removed => {
                // Stale if a new generation was written since.
                if self.rt.keystore.refresh_presence() {
                    return;
                }
                self.emit(DaemonEvent::KeystoreRemoved);
                if self.rt.keystore.handle_removed() {
                    self.rt.session.on_locked();
                    self.emit(DaemonEvent::Locked { reason: "removed" });
                }
                if matches!(self.rt.state.current(), DaemonState::Locked | DaemonState::Unlocked) {
                    self.transition(DaemonState::Ready, json!({ "reason": "keystore removed" }));
                }
            }
        }
    }

    // -- Helpers ----------------------------------------------------------

    fn approval_timeout(&self) -> Option<Duration> {
        self.rt.config.approval_timeout_ms.map(Duration::from_millis)
    }

    fn transition(&mut self, to: DaemonState, metadata: Value) {
        match self.rt.state.transition(to, metadata) {
            Ok(from) => self.emit(DaemonEvent::StateChanged { from, to }),
            Err(err) => tracing::warn!(%err, "state transition refused"),
        }
    }

    /// Non-blocking; drops the event if the consumer is behind.
    fn emit(&self, event: DaemonEvent) {
        if let Err(mpsc::error::TrySendError::Full(event)) = self.rt.event_tx.try_send(event) {
            tracing::debug!(?event, "event channel full, dropping event");
        }
    }
}
