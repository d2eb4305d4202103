//! Configuration stage: options, host, directories, persisted state and target.

use async_trait::async_trait;
use clap::error::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use super::context::{BootstrapContext, Settings, Target};
use super::pipeline::Stage;
use crate::config::{
    read_key_file, resolve_passphrase, resolve_repository, Config, Directories, GlobalArgs, HostInfo,
};
use crate::cookies::CookieManager;
use crate::errors::BootstrapError;
use crate::logging;
use crate::security::{sanitize_path, validate_file_permissions};

/// Resolves everything the later stages need from the invocation.
#[derive(Debug, Default, Clone, Copy)]
pub struct ConfigStage;

#[async_trait]
impl Stage for ConfigStage {
    fn name(&self) -> &str {
        "config"
    }

    async fn execute(&self, ctx: &mut BootstrapContext) -> Result<(), BootstrapError> {
        let mut options = match GlobalArgs::parse_args(&ctx.program, &ctx.args) {
            Ok(options) => options,
            Err(e) if matches!(e.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) => {
                ctx.console.println(e.render().to_string().trim_end());
                if e.kind() == ErrorKind::DisplayHelp {
                    ctx.console.println("\nCommands:");
                    ctx.console.println(ctx.registry.usage("  ").trim_end());
                }
                ctx.exit_with(0);
                return Ok(());
            }
            Err(e) => return Err(BootstrapError::FlagParse(e.render().to_string().trim_end().to_string())),
        };
        logging::init(options.quiet, options.trace.as_deref());

        let host = match ctx.host.clone() {
            Some(host) => host,
            None => {
                let host = HostInfo::detect()?;
                ctx.host = Some(host.clone());
                host
            }
        };
        let dirs = match ctx.dirs.clone() {
            Some(dirs) => dirs,
            None => {
                let dirs = Directories::detect()?;
                ctx.dirs = Some(dirs.clone());
                dirs
            }
        };

        let (cpu, max_concurrency) = cpu_limits(options.cpu, host.num_cpus)?;

        options.profile_cpu = options.profile_cpu.as_deref().map(checked_path).transpose()?;
        options.profile_mem = options.profile_mem.as_deref().map(checked_path).transpose()?;

        let config_dir = options.config.clone().unwrap_or_else(|| dirs.config.clone());
        let config = Config::load(&config_dir)?;

        let cookies = CookieManager::new(dirs.cookies_cache()?)?;
        ctx.cookies = Some(cookies.clone());

        if options.disable_security_check {
            cookies.set_disabled_security_check()?;
            ctx.console.println("security check disabled !");
            ctx.exit_with(1);
            return Ok(());
        }
        let security_check_disabled = cookies.is_disabled_security_check();
        if options.enable_security_check {
            cookies.remove_disabled_security_check()?;
            ctx.console.println("security check enabled !");
            ctx.exit_with(1);
            return Ok(());
        }

        let key_from_file = options.keyfile.as_deref().map(load_key_file).transpose()?;

        let agentless = options.no_agent || ctx.env.agentless || cfg!(windows);
        let cache_dir = dirs.cache(agentless)?;

        let (reference, command_args, at_syntax) = resolve_repository(&options.rest, &ctx.env, &config, &host.home_dir)?;
        let mut store_config = config.get_repository(&reference)?;
        if let Some(key) = resolve_passphrase(key_from_file, &mut store_config, ctx.env.passphrase.as_deref())? {
            ctx.security.set_key_from_file(&key);
        }

        let command = ctx.registry.lookup(&command_args).ok_or_else(|| {
            BootstrapError::CommandNotFound(command_args.first().cloned().unwrap_or_default())
        })?;

        debug!(
            cpu,
            max_concurrency,
            agentless,
            repository = %reference,
            at_syntax,
            command = %command.name.join(" "),
            "configuration resolved"
        );
        if options.cpu.is_some() {
            info!(cpu, "limiting usable cores");
        }

        ctx.settings = Settings {
            config_dir,
            cache_dir,
            cpu,
            max_concurrency,
            agentless,
            security_check_disabled,
        };
        ctx.target = Target {
            repository: reference,
            at_syntax,
            store_config,
            command: Some(command),
        };
        ctx.config = config;
        ctx.options = options;
        Ok(())
    }
}

/// Validates the `-cpu` value and returns `(cpu, max_concurrency)`.
///
/// Without a value, all cores but one are used.
pub fn cpu_limits(requested: Option<i64>, available: usize) -> Result<(usize, usize), BootstrapError> {
    let cpu = match requested {
        None => available.saturating_sub(1).max(1),
        Some(n) if n <= 0 => return Err(BootstrapError::InvalidCpu(n)),
        Some(n) => {
            let cpu = usize::try_from(n).map_err(|_| BootstrapError::InvalidCpu(n))?;
            if cpu > available {
                return Err(BootstrapError::TooManyCpus { requested: n, available });
            }
            cpu
        }
    };
    Ok((cpu, 2 * cpu + 1))
}

fn checked_path(path: &Path) -> Result<PathBuf, BootstrapError> {
    sanitize_path(&path.to_string_lossy())
        .map_err(|e| BootstrapError::Config(format!("{}: {e}", path.display())))
}

fn load_key_file(path: &Path) -> Result<String, BootstrapError> {
    let path = checked_path(path)?;
    validate_file_permissions(&path).map_err(|e| BootstrapError::Config(format!("key file rejected: {e}")))?;
    read_key_file(&path)
}
