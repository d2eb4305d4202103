//! Testing utilities.
//!
//! This module provides:
//! - Fakes for the passphrase, key derivation and emitter seams
//! - Recording, failing and early-exit bootstrap stages
//! - A one-shot HTTP server and on-disk repository fixtures

mod fixtures;
mod mocks;

pub use fixtures::{serve_once, serve_sequence, test_host, CannedResponse, CommandFixture, TestEnvironment, TestRepository};
pub use mocks::{
    CountingKdf, CountingResolver, ExitStage, FailingEmitter, FailingStage, RecordingEmitter, RecordingStage,
    ScriptedPrompt,
};
