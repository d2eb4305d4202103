//! Hand-written fakes.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use zeroize::Zeroizing;

use crate::bootstrap::{BootstrapContext, Stage};
use crate::errors::{BootstrapError, CodedError, ErrorCode};
use crate::repository::{EncryptionError, KdfParams, KeyDerivation, PassphrasePrompt};
use crate::reporting::{Emitter, EmitterResolver, Report, ReportResult};

/// Answers passphrase prompts from a fixed script and records each prompt.
///
/// Running out of answers fails like a closed terminal.
#[derive(Debug, Default)]
pub struct ScriptedPrompt {
    answers: Mutex<VecDeque<String>>,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedPrompt {
    /// Creates a prompt answering with `answers` in order.
    pub fn new<I, S>(answers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            answers: Mutex::new(answers.into_iter().map(Into::into).collect()),
            prompts: Mutex::new(Vec::new()),
        }
    }

    /// Purposes prompted for so far.
    #[must_use]
    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().clone()
    }
}

impl PassphrasePrompt for ScriptedPrompt {
    fn read_passphrase(&self, purpose: &str) -> Result<Zeroizing<String>, BootstrapError> {
        self.prompts.lock().push(purpose.to_string());
        self.answers
            .lock()
            .pop_front()
            .map(Zeroizing::new)
            .ok_or_else(|| BootstrapError::Passphrase("no more scripted answers".into()))
    }
}

/// Counts derivations made through the wrapped KDF.
#[derive(Debug, Default)]
pub struct CountingKdf<K> {
    inner: K,
    calls: AtomicUsize,
}

impl<K: KeyDerivation> CountingKdf<K> {
    /// Wraps `inner`.
    pub fn new(inner: K) -> Self {
        Self {
            inner,
            calls: AtomicUsize::new(0),
        }
    }

    /// Number of `derive_key` calls.
    #[must_use]
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl<K: KeyDerivation> KeyDerivation for CountingKdf<K> {
    fn derive_key(&self, params: &KdfParams, secret: &[u8]) -> Result<Zeroizing<Vec<u8>>, EncryptionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.derive_key(params, secret)
    }
}

/// Records the task name of every emitted report.
#[derive(Debug, Default)]
pub struct RecordingEmitter {
    delay: Duration,
    names: Mutex<Vec<String>>,
}

impl RecordingEmitter {
    /// Creates an emitter that accepts everything immediately.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleeps `delay` before accepting each report.
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Task names in emission order.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.names.lock().clone()
    }
}

#[async_trait]
impl Emitter for RecordingEmitter {
    async fn emit(&self, report: &Report) -> ReportResult<()> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let name = report.task.as_ref().map(|t| t.name.clone()).unwrap_or_default();
        self.names.lock().push(name);
        Ok(())
    }
}

/// Rejects every report.
#[derive(Debug, Default)]
pub struct FailingEmitter {
    calls: AtomicUsize,
}

impl FailingEmitter {
    /// Creates the emitter.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of emission attempts.
    #[must_use]
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Emitter for FailingEmitter {
    async fn emit(&self, _report: &Report) -> ReportResult<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(CodedError::new(ErrorCode("test.unavailable"), "endpoint unavailable"))
    }
}

/// Always resolves to the same emitter and counts resolutions.
#[derive(Debug)]
pub struct CountingResolver {
    emitter: Arc<dyn Emitter>,
    calls: AtomicUsize,
}

impl CountingResolver {
    /// Resolves to `emitter`.
    pub fn new(emitter: Arc<dyn Emitter>) -> Self {
        Self {
            emitter,
            calls: AtomicUsize::new(0),
        }
    }

    /// Number of resolutions.
    #[must_use]
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EmitterResolver for CountingResolver {
    async fn resolve(&self) -> Arc<dyn Emitter> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.emitter.clone()
    }
}

/// Logs its execution and registers a cleanup that logs `close:<name>`.
#[derive(Debug)]
pub struct RecordingStage {
    name: String,
    log: Arc<Mutex<Vec<String>>>,
}

impl RecordingStage {
    /// Creates a stage appending to `log`.
    pub fn new(name: impl Into<String>, log: Arc<Mutex<Vec<String>>>) -> Self {
        Self { name: name.into(), log }
    }
}

#[async_trait]
impl Stage for RecordingStage {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, ctx: &mut BootstrapContext) -> Result<(), BootstrapError> {
        self.log.lock().push(self.name.clone());
        let log = self.log.clone();
        let name = self.name.clone();
        ctx.cleanup().register(format!("close {}", self.name), move || {
            log.lock().push(format!("close:{name}"));
            Ok(())
        });
        Ok(())
    }
}

/// Fails with a configuration error.
#[derive(Debug)]
pub struct FailingStage {
    name: String,
    message: String,
}

impl FailingStage {
    /// Creates a stage failing with `message`.
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
        }
    }
}

#[async_trait]
impl Stage for FailingStage {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, _ctx: &mut BootstrapContext) -> Result<(), BootstrapError> {
        Err(BootstrapError::Config(self.message.clone()))
    }
}

/// Requests an early exit.
#[derive(Debug)]
pub struct ExitStage {
    name: String,
    code: i32,
}

impl ExitStage {
    /// Creates a stage exiting with `code`.
    pub fn new(name: impl Into<String>, code: i32) -> Self {
        Self { name: name.into(), code }
    }
}

#[async_trait]
impl Stage for ExitStage {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, ctx: &mut BootstrapContext) -> Result<(), BootstrapError> {
        ctx.exit_with(self.code);
        Ok(())
    }
}
