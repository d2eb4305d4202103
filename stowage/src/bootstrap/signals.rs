//! Signals stage: turns the first interrupt into a cancellation.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;

use super::context::BootstrapContext;
use super::pipeline::Stage;
use crate::cancellation::{Signal, SignalHandler};
use crate::errors::BootstrapError;

/// Installs the interrupt handler last, once everything it would clean up exists.
#[derive(Debug, Default, Clone, Copy)]
pub struct SignalsStage;

#[async_trait]
impl Stage for SignalsStage {
    fn name(&self) -> &str {
        "signals"
    }

    async fn execute(&self, ctx: &mut BootstrapContext) -> Result<(), BootstrapError> {
        let cancel = ctx.cancel.clone();
        let on_interrupt = move |signal: Signal| {
            info!(%signal, "cancelling running command");
            cancel.cancel(signal.to_string());
        };

        let handler = if ctx.os_signals {
            SignalHandler::start(ctx.console.clone(), on_interrupt)?
        } else {
            SignalHandler::detached(ctx.console.clone(), on_interrupt)
        };
        let handler = Arc::new(handler);

        let registered = handler.clone();
        ctx.cleanup().register_infallible("stop signals", move || registered.stop());
        ctx.signals = Some(handler);
        Ok(())
    }
}
