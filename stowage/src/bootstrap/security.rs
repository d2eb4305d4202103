//! Security stage: first-run notice and update check.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, warn};

use super::context::BootstrapContext;
use super::pipeline::Stage;
use crate::errors::BootstrapError;
use crate::updates::{HttpUpdateChecker, UpdateChecker};
use crate::utils::VERSION;

const WELCOME: &[&str] = &[
    "Welcome to stowage !",
    "By default, stowage checks for security updates on the releases feed once every 24h.",
    "It will notify you if there are important updates that you need to install.",
    "If you prefer to watch yourself, you can disable this permanently by running:",
    "\tstowage -disable-security-check",
    "If you change your mind, run:",
    "\tstowage -enable-security-check",
];

/// Never fails: cookie and feed errors are logged and swallowed.
#[derive(Debug, Default, Clone, Copy)]
pub struct SecurityStage;

#[async_trait]
impl Stage for SecurityStage {
    fn name(&self) -> &str {
        "security"
    }

    async fn execute(&self, ctx: &mut BootstrapContext) -> Result<(), BootstrapError> {
        let Some(cookies) = ctx.cookies.clone() else {
            return Ok(());
        };
        let disabled = ctx.settings.security_check_disabled;

        if cookies.is_first_run() {
            if let Err(e) = cookies.set_first_run() {
                warn!(error = %e, "could not record first run");
            }
            if !disabled {
                ctx.console.println(WELCOME.join("\n\n"));
            }
            return Ok(());
        }
        if disabled {
            debug!("security check disabled");
            return Ok(());
        }

        let checker: Arc<dyn UpdateChecker> = match &ctx.update_checker {
            Some(checker) => checker.clone(),
            None => Arc::new(HttpUpdateChecker::new(&ctx.settings.cache_dir)),
        };
        match checker.check(VERSION).await {
            Ok(summary) => {
                if let Some(warning) = summary.warning() {
                    ctx.console.eprintln(warning);
                }
            }
            Err(e) => debug!(error = %e, "update check failed"),
        }
        Ok(())
    }
}
