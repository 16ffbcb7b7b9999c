//! Outbound mutation requests.
//!
//! A [`Command`] is a titled block the client sends to the device. It is
//! resolved exactly once: `on_success` after an `ACK`, `on_failure` after
//! a `NAK`, a lost connection or an unrenderable frame. Every enqueued
//! command also hands back a [`CommandTicket`] that can be awaited.

use std::fmt;
use std::fmt::Write as _;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::oneshot;

use crate::block::FieldKey;
use crate::error::HubError;
use crate::message::{BlockTitle, LOCKED, UNLOCKED};

type Callback = Box<dyn FnOnce() + Send + 'static>;

/// How field lines are rendered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldFormat {
    /// `key: value`
    Colon,
    /// `key value`
    Space,
}

/// Final state of a command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandOutcome {
    Acknowledged,
    Rejected,
    ConnectionLost,
    Invalid(String),
}

impl CommandOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, CommandOutcome::Acknowledged)
    }
}

// ── Command ──────────────────────────────────────────────────────

pub struct Command {
    title: String,
    fields: Vec<(FieldKey, String)>,
    format: FieldFormat,
    on_success: Option<Callback>,
    on_failure: Option<Callback>,
    completion: Option<oneshot::Sender<CommandOutcome>>,
}

impl Command {
    pub fn new(title: impl Into<String>, format: FieldFormat) -> Self {
        Self {
            title: title.into(),
            fields: Vec::new(),
            format,
            on_success: None,
            on_failure: None,
            completion: None,
        }
    }

    /// Append a field line.
    pub fn with_field(mut self, key: impl Into<FieldKey>, value: impl Into<String>) -> Self {
        self.fields.push((key.into(), value.into()));
        self
    }

    /// Called once if the device acknowledges the command.
    pub fn on_success(mut self, f: impl FnOnce() + Send + 'static) -> Self {
        self.on_success = Some(Box::new(f));
        self
    }

    /// Called once if the command is rejected or never acknowledged.
    pub fn on_failure(mut self, f: impl FnOnce() + Send + 'static) -> Self {
        self.on_failure = Some(Box::new(f));
        self
    }

    // ── Builders for the standard mutations ──────────────────────

    /// Route each destination output to a source input.
    pub fn route(mapping: impl IntoIterator<Item = (u32, u32)>) -> Self {
        let mut cmd = Self::new(BlockTitle::VideoOutputRouting.as_str(), FieldFormat::Space);
        for (dst, src) in mapping {
            cmd.fields.push((dst.into(), src.to_string()));
        }
        cmd
    }

    pub fn input_labels<L: Into<String>>(labels: impl IntoIterator<Item = (u32, L)>) -> Self {
        Self::labels(BlockTitle::InputLabels, labels)
    }

    pub fn output_labels<L: Into<String>>(labels: impl IntoIterator<Item = (u32, L)>) -> Self {
        Self::labels(BlockTitle::OutputLabels, labels)
    }

    fn labels<L: Into<String>>(
        title: BlockTitle,
        labels: impl IntoIterator<Item = (u32, L)>,
    ) -> Self {
        let mut cmd = Self::new(title.as_str(), FieldFormat::Space);
        for (port, label) in labels {
            cmd.fields.push((port.into(), label.into()));
        }
        cmd
    }

    /// Lock (`true`) or unlock (`false`) outputs.
    pub fn locks(locks: impl IntoIterator<Item = (u32, bool)>) -> Self {
        let mut cmd = Self::new(BlockTitle::VideoOutputLocks.as_str(), FieldFormat::Space);
        for (port, locked) in locks {
            let value = if locked { LOCKED } else { UNLOCKED };
            cmd.fields.push((port.into(), value.to_string()));
        }
        cmd
    }

    // ── Accessors ────────────────────────────────────────────────

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn fields(&self) -> &[(FieldKey, String)] {
        &self.fields
    }

    pub fn format(&self) -> FieldFormat {
        self.format
    }

    /// Render the complete outbound frame, delimiter included.
    pub fn serialize(&self) -> Result<Bytes, HubError> {
        check_text("title", &self.title)?;
        let mut text = format!("{}:\n", self.title);
        for (key, value) in &self.fields {
            let key = key.to_string();
            check_text("key", &key)?;
            check_text("value", value)?;
            let _ = match self.format {
                FieldFormat::Colon => writeln!(text, "{key}: {value}"),
                FieldFormat::Space => writeln!(text, "{key} {value}"),
            };
        }
        text.push('\n');
        Ok(Bytes::from(text))
    }

    /// Install the completion channel and return its receiving side.
    pub(crate) fn ticket(&mut self) -> CommandTicket {
        let (tx, rx) = oneshot::channel();
        self.completion = Some(tx);
        CommandTicket {
            title: self.title.clone(),
            rx,
        }
    }

    /// Run the matching callback and notify the ticket.
    pub(crate) fn resolve(mut self, outcome: CommandOutcome) {
        let callback = if outcome.is_success() {
            self.on_success.take()
        } else {
            self.on_failure.take()
        };
        if let Some(callback) = callback {
            callback();
        }
        if let Some(tx) = self.completion.take() {
            let _ = tx.send(outcome);
        }
    }
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Command")
            .field("title", &self.title)
            .field("fields", &self.fields)
            .field("format", &self.format)
            .finish()
    }
}

fn check_text(what: &str, text: &str) -> Result<(), HubError> {
    if !text.is_ascii() {
        return Err(HubError::InvalidCommand(format!("{what} {text:?} is not ASCII")));
    }
    if text.contains(['\n', '\r']) {
        return Err(HubError::InvalidCommand(format!("{what} {text:?} contains a line break")));
    }
    Ok(())
}

// ── CommandTicket ────────────────────────────────────────────────

/// Awaitable completion of an enqueued command.
#[derive(Debug)]
pub struct CommandTicket {
    title: String,
    rx: oneshot::Receiver<CommandOutcome>,
}

impl CommandTicket {
    pub fn title(&self) -> &str {
        &self.title
    }

    /// Wait until the device acknowledges or the command fails.
    pub async fn wait(self) -> Result<(), HubError> {
        let outcome = self.rx.await.unwrap_or(CommandOutcome::ConnectionLost);
        match outcome {
            CommandOutcome::Acknowledged => Ok(()),
            CommandOutcome::Rejected => Err(HubError::Rejected { title: self.title }),
            CommandOutcome::ConnectionLost => Err(HubError::ConnectionLost),
            CommandOutcome::Invalid(reason) => Err(HubError::InvalidCommand(reason)),
        }
    }

    pub async fn wait_timeout(self, timeout: Duration) -> Result<(), HubError> {
        tokio::time::timeout(timeout, self.wait())
            .await
            .map_err(|_| HubError::Timeout(timeout))?
    }
}
