//! Terminal approval gate.
//!
//! Prompts on the controlling terminal, never on stdin/stdout: in
//! native-host mode those carry the browser's frames. Prompts are
//! serialized so two pending requests never interleave on screen.
//! Passwords are read with echo off. Without a terminal every prompt
//! is declined.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use keyward_node::approval::{ApprovalGate, MessagePrompt, TransactionPrompt};
use keyward_protocol::request::Origin;
use keyward_types::{KeywardError, Result};
use tokio::sync::Mutex;
use zeroize::Zeroizing;

#[cfg(unix)]
const TTY_PATH: &str = "/dev/tty";
#[cfg(windows)]
const TTY_PATH: &str = "CON";

/// How a reply is read back.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Echo {
    Visible,
    Hidden,
}

/// [`ApprovalGate`] that asks the human at the terminal.
pub struct TerminalApprovalGate {
    device: PathBuf,
    turn: Mutex<()>,
}

impl TerminalApprovalGate {
    /// A gate on the process's controlling terminal.
    pub fn new() -> Self {
        Self::with_device(TTY_PATH)
    }

    /// A gate on an explicit terminal device.
    pub fn with_device(device: impl Into<PathBuf>) -> Self {
        Self {
            device: device.into(),
            turn: Mutex::new(()),
        }
    }

    async fn ask(&self, lines: Vec<String>, question: String, echo: Echo) -> Result<Zeroizing<String>> {
        let _turn = self.turn.lock().await;
        let device = self.device.clone();
        tokio::task::spawn_blocking(move || converse(&device, &lines, &question, echo))
            .await
            .map_err(|e| KeywardError::ProtocolError {
                reason: format!("approval prompt task failed: {e}"),
            })?
    }

    async fn confirm(&self, lines: Vec<String>, question: &str) -> Result<bool> {
        let answer = self.ask(lines, format!("{question} [y/N] "), Echo::Visible).await?;
        Ok(is_yes(&answer))
    }
}

impl Default for TerminalApprovalGate {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ApprovalGate for TerminalApprovalGate {
    async fn prompt_unlock(&self, origin: &Origin) -> Result<Zeroizing<String>> {
        let lines = vec![format!("{origin} wants to unlock the wallet.")];
        let password = self
            .ask(lines, "Keystore password (empty to decline): ".into(), Echo::Hidden)
            .await?;
        if password.is_empty() {
            return Err(KeywardError::UserRejected);
        }
        Ok(password)
    }

    async fn prompt_transaction_approval(&self, prompt: &TransactionPrompt) -> Result<bool> {
        let mut lines = vec!["Transaction signature requested:".to_string()];
        lines.extend(prompt.summary().into_iter().map(|l| format!("  {l}")));
        self.confirm(lines, "Sign this transaction?").await
    }

    async fn prompt_message_signature(&self, prompt: &MessagePrompt) -> Result<bool> {
        let lines = vec![
            "Message signature requested:".to_string(),
            format!("  origin:   {}", prompt.origin),
            format!("  account:  {}", prompt.address),
            format!("  message:  {}", prompt.display_text()),
        ];
        self.confirm(lines, "Sign this message?").await
    }

    async fn prompt_account_access(&self, origin: &Origin) -> Result<bool> {
        let lines = vec![format!("{origin} wants to see your accounts.")];
        self.confirm(lines, "Allow?").await
    }
}

/// Prints `lines` and `question`, then reads one line of reply.
fn converse(device: &Path, lines: &[String], question: &str, echo: Echo) -> Result<Zeroizing<String>> {
    let tty = OpenOptions::new()
        .read(true)
        .write(true)
        .open(device)
        .map_err(|e| {
            tracing::warn!(%e, device = %device.display(), "no terminal for approval; declining");
            KeywardError::UserRejected
        })?;

    write_prompt(&tty, lines, question).map_err(|e| {
        tracing::warn!(%e, "failed to write approval prompt; declining");
        KeywardError::UserRejected
    })?;

    read_reply(device, &tty, echo)
        .map(|raw| Zeroizing::new(raw.trim_end_matches(['\r', '\n']).to_string()))
        .map_err(|e| {
            tracing::warn!(%e, "failed to read approval reply; declining");
            KeywardError::UserRejected
        })
}

fn read_reply(device: &Path, tty: &File, echo: Echo) -> std::io::Result<Zeroizing<String>> {
    match echo {
        // rpassword turns echo off on the controlling terminal itself.
        Echo::Hidden if device == Path::new(TTY_PATH) => rpassword::read_password().map(Zeroizing::new),
        Echo::Hidden => rpassword::read_password_from_bufread(&mut BufReader::new(tty)).map(Zeroizing::new),
        Echo::Visible => {
            let mut raw = Zeroizing::new(String::new());
            BufReader::new(tty).read_line(&mut raw)?;
            Ok(raw)
        }
    }
}

fn write_prompt(mut tty: &File, lines: &[String], question: &str) -> std::io::Result<()> {
    writeln!(tty)?;
    writeln!(tty, "============================================================")?;
    for line in lines {
        writeln!(tty, "  {line}")?;
    }
    writeln!(tty, "============================================================")?;
    write!(tty, "{question}")?;
    tty.flush()
}

fn is_yes(answer: &str) -> bool {
    matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_explicit_yes_approves() {
        assert!(is_yes("y"));
        assert!(is_yes(" YES "));
        assert!(!is_yes(""));
        assert!(!is_yes("n"));
        assert!(!is_yes("yeah"));
    }

    #[test]
    fn replies_read_from_a_device() -> std::result::Result<(), KeywardError> {
        let io = |e: std::io::Error| KeywardError::StorageError { reason: e.to_string() };
        let dir = tempfile::tempdir().map_err(io)?;
        let device = dir.path().join("tty");
        std::fs::write(&device, "correct horse battery\nyes\n").map_err(io)?;

        let tty = File::open(&device).map_err(io)?;
        let password = read_reply(&device, &tty, Echo::Hidden).map_err(io)?;
        assert_eq!(password.trim_end(), "correct horse battery");

        let tty = File::open(&device).map_err(io)?;
        let answer = read_reply(&device, &tty, Echo::Visible).map_err(io)?;
        assert_eq!(answer.as_str(), "correct horse battery\n");
        Ok(())
    }

    #[tokio::test]
    async fn missing_terminal_declines() {
        let gate = TerminalApprovalGate::with_device("/nonexistent/keyward-tty");
        let origin = Origin::Browser("https://app.example".into());
        assert!(matches!(
            gate.prompt_account_access(&origin).await,
            Err(KeywardError::UserRejected)
        ));
        assert!(matches!(gate.prompt_unlock(&origin).await, Err(KeywardError::UserRejected)));
    }
}
