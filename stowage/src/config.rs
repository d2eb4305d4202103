//! Configuration sources: command line, configuration file, environment and host.

use crate::errors::BootstrapError;
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use uuid::Uuid;

/// Environment variable overriding the repository location.
pub const ENV_REPOSITORY: &str = "STOWAGE_REPOSITORY";
/// Environment variable supplying the passphrase.
pub const ENV_PASSPHRASE: &str = "STOWAGE_PASSPHRASE";
/// Environment variable forcing agentless mode. Presence is enough.
pub const ENV_AGENTLESS: &str = "STOWAGE_AGENTLESS";
/// Environment variable overriding the reporting endpoint.
pub const ENV_API_URL: &str = "STOWAGE_API_URL";

/// Name of the configuration file inside the configuration directory.
pub const CONFIG_FILE: &str = "config.json";

const APP_DIR: &str = "stowage";
const AGENTLESS_CACHE_DIR: &str = "stowage-agentless";

/// Key/value description of a store (`location` plus backend parameters).
pub type StoreConfig = BTreeMap<String, String>;

/// Global options, given before `[at REPOSITORY] COMMAND`.
#[derive(Debug, Clone, Default, Parser)]
#[command(
    name = "stowage",
    version,
    about = "Encrypted, deduplicated backups",
    override_usage = "stowage [OPTIONS] [at REPOSITORY] COMMAND [COMMAND_OPTIONS]...",
    after_help = "By default, the repository is $STOWAGE_REPOSITORY or $HOME/.stowage."
)]
pub struct GlobalArgs {
    /// Configuration directory
    #[arg(long, value_name = "DIR")]
    pub config: Option<PathBuf>,

    /// Limit the number of usable cores
    #[arg(long, allow_negative_numbers = true)]
    pub cpu: Option<i64>,

    /// Profile CPU usage
    #[arg(long = "profile-cpu", value_name = "PATH")]
    pub profile_cpu: Option<PathBuf>,

    /// Profile memory usage
    #[arg(long = "profile-mem", value_name = "PATH")]
    pub profile_mem: Option<PathBuf>,

    /// Display command execution time
    #[arg(long)]
    pub time: bool,

    /// Display trace logs, comma-separated (all, trace, repository, snapshot, server, reporting)
    #[arg(long, value_name = "SELECTORS")]
    pub trace: Option<String>,

    /// No output except errors
    #[arg(long)]
    pub quiet: bool,

    /// Use passphrase from key file when prompted
    #[arg(long, value_name = "PATH")]
    pub keyfile: Option<PathBuf>,

    /// Run without agent
    #[arg(long = "no-agent")]
    pub no_agent: bool,

    /// Enable update check
    #[arg(long = "enable-security-check", conflicts_with = "disable_security_check")]
    pub enable_security_check: bool,

    /// Disable update check
    #[arg(long = "disable-security-check")]
    pub disable_security_check: bool,

    /// `[at REPOSITORY] COMMAND [COMMAND_OPTIONS]...`
    #[arg(trailing_var_arg = true, hide = true)]
    pub rest: Vec<String>,
}

/// Global options that take a value.
const VALUE_OPTIONS: &[&str] = &["config", "cpu", "profile-cpu", "profile-mem", "trace", "keyfile"];

impl GlobalArgs {
    /// Parses the arguments following the program name.
    ///
    /// Single-dash long options (`-cpu 2`) are accepted.
    pub fn parse_args(program: &str, args: &[String]) -> Result<Self, clap::Error> {
        let argv = std::iter::once(program.to_string()).chain(normalize_args(args));
        Self::try_parse_from(argv)
    }
}

/// Rewrites `-name` to `--name` up to the first positional argument.
#[must_use]
pub fn normalize_args(args: &[String]) -> Vec<String> {
    let mut out = Vec::with_capacity(args.len());
    let mut iter = args.iter();

    while let Some(arg) = iter.next() {
        let long = if let Some(stripped) = arg.strip_prefix("--") {
            if stripped.is_empty() {
                out.push(arg.clone());
                break;
            }
            arg.clone()
        } else if arg.len() > 2 && arg.starts_with('-') {
            format!("-{arg}")
        } else if arg.starts_with('-') && arg.len() == 2 {
            out.push(arg.clone());
            continue;
        } else {
            out.push(arg.clone());
            break;
        };

        let name = long.trim_start_matches('-');
        let takes_value = !name.contains('=') && VALUE_OPTIONS.contains(&name);
        out.push(long);
        if takes_value {
            if let Some(value) = iter.next() {
                out.push(value.clone());
            }
        }
    }

    out.extend(iter.cloned());
    out
}

/// Persisted configuration file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// Repository used when neither `at` nor the environment names one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_repository: Option<String>,

    /// Named repositories, referenced as `@name`.
    #[serde(default)]
    pub repositories: BTreeMap<String, StoreConfig>,
}

impl Config {
    /// Loads `config.json` from `dir`. A missing file yields an empty configuration.
    pub fn load(dir: &Path) -> Result<Self, BootstrapError> {
        let path = dir.join(CONFIG_FILE);
        match fs::read(&path) {
            Ok(data) => serde_json::from_slice(&data).map_err(|e| {
                BootstrapError::Config(format!("could not parse {}: {e}", path.display()))
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(BootstrapError::Config(format!(
                "could not read {}: {e}",
                path.display()
            ))),
        }
    }

    /// Writes `config.json` into `dir`.
    pub fn save(&self, dir: &Path) -> Result<(), BootstrapError> {
        fs::create_dir_all(dir)?;
        let data = serde_json::to_vec_pretty(self)
            .map_err(|e| BootstrapError::Config(e.to_string()))?;
        fs::write(dir.join(CONFIG_FILE), data)?;
        Ok(())
    }

    /// Resolves a repository reference into a store configuration.
    ///
    /// `@name` is looked up in the configuration; anything else is a location.
    pub fn get_repository(&self, reference: &str) -> Result<StoreConfig, BootstrapError> {
        if let Some(name) = reference.strip_prefix('@') {
            let entry = self
                .repositories
                .get(name)
                .ok_or_else(|| BootstrapError::Config(format!("could not resolve repository: {name}")))?;
            if !entry.contains_key("location") {
                return Err(BootstrapError::Config(format!(
                    "repository {name} has no location"
                )));
            }
            return Ok(entry.clone());
        }

        let mut config = StoreConfig::new();
        config.insert("location".to_string(), reference.to_string());
        Ok(config)
    }
}

/// Environment values consulted during bootstrap, captured once.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvOverrides {
    /// `STOWAGE_REPOSITORY`.
    pub repository: Option<String>,
    /// `STOWAGE_PASSPHRASE`.
    pub passphrase: Option<String>,
    /// `STOWAGE_AGENTLESS` is set.
    pub agentless: bool,
}

impl EnvOverrides {
    /// Reads the process environment.
    #[must_use]
    pub fn from_process() -> Self {
        Self {
            repository: std::env::var(ENV_REPOSITORY).ok().filter(|s| !s.is_empty()),
            passphrase: std::env::var(ENV_PASSPHRASE).ok(),
            agentless: std::env::var_os(ENV_AGENTLESS).is_some(),
        }
    }
}

/// Identity of the machine and user running the command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostInfo {
    /// Login name.
    pub username: String,
    /// Host name.
    pub hostname: String,
    /// Lower-cased stable machine identifier.
    pub machine_id: String,
    /// Home directory.
    pub home_dir: PathBuf,
    /// Operating system (`std::env::consts::OS`).
    pub operating_system: String,
    /// CPU architecture (`std::env::consts::ARCH`).
    pub architecture: String,
    /// Cores available to this process.
    pub num_cpus: usize,
}

impl HostInfo {
    /// Detects the current host.
    pub fn detect() -> Result<Self, BootstrapError> {
        let home_dir = dirs::home_dir()
            .ok_or_else(|| BootstrapError::Config("could not determine home directory".into()))?;

        let username = ["USER", "USERNAME", "LOGNAME"]
            .iter()
            .find_map(|var| std::env::var(var).ok().filter(|v| !v.is_empty()))
            .or_else(|| {
                home_dir
                    .file_name()
                    .map(|name| name.to_string_lossy().into_owned())
            })
            .ok_or_else(|| BootstrapError::Config("could not determine current user".into()))?;

        let hostname = sysinfo::System::host_name()
            .filter(|h| !h.is_empty())
            .unwrap_or_else(|| "localhost".to_string());

        let machine_id = read_machine_id().unwrap_or_else(|| fallback_machine_id(&hostname));

        Ok(Self {
            username,
            hostname,
            machine_id,
            home_dir,
            operating_system: std::env::consts::OS.to_string(),
            architecture: std::env::consts::ARCH.to_string(),
            num_cpus: available_cpus(),
        })
    }
}

/// Number of cores this process may use.
#[must_use]
pub fn available_cpus() -> usize {
    std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get)
}

fn read_machine_id() -> Option<String> {
    ["/etc/machine-id", "/var/lib/dbus/machine-id"]
        .iter()
        .find_map(|path| fs::read_to_string(path).ok())
        .map(|id| id.trim().to_lowercase())
        .filter(|id| !id.is_empty())
}

/// Deterministic machine id derived from the hostname.
#[must_use]
pub fn fallback_machine_id(hostname: &str) -> String {
    Uuid::new_v5(&Uuid::nil(), hostname.as_bytes())
        .to_string()
        .to_lowercase()
}

/// Base directories used by the process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Directories {
    /// Default configuration directory (`<config_dir>/stowage`).
    pub config: PathBuf,
    /// Platform cache root; application caches live below it.
    pub cache_root: PathBuf,
}

impl Directories {
    /// Resolves the platform directories.
    pub fn detect() -> Result<Self, BootstrapError> {
        let config = dirs::config_dir()
            .ok_or_else(|| BootstrapError::Config("could not get config directory".into()))?
            .join(APP_DIR);
        let cache_root = dirs::cache_dir()
            .ok_or_else(|| BootstrapError::Config("could not get cache directory".into()))?;
        Ok(Self { config, cache_root })
    }

    /// Cache directory holding cookies; shared by both execution modes.
    pub fn cookies_cache(&self) -> Result<PathBuf, BootstrapError> {
        ensure_dir(self.cache_root.join(APP_DIR))
    }

    /// Cache directory for the given execution mode.
    pub fn cache(&self, agentless: bool) -> Result<PathBuf, BootstrapError> {
        let sub = if agentless { AGENTLESS_CACHE_DIR } else { APP_DIR };
        ensure_dir(self.cache_root.join(sub))
    }
}

fn ensure_dir(path: PathBuf) -> Result<PathBuf, BootstrapError> {
    let mut builder = fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(0o700);
    }
    builder.create(&path)?;
    Ok(path)
}

/// Picks the repository reference and the remaining command line.
///
/// Order: `at <repo>`, then the environment, then the configured default,
/// then `fs:<home>/.stowage`. Returns `(reference, command args, at_syntax)`.
pub fn resolve_repository(
    args: &[String],
    env: &EnvOverrides,
    config: &Config,
    home: &Path,
) -> Result<(String, Vec<String>, bool), BootstrapError> {
    match args.first().map(String::as_str) {
        None => Err(BootstrapError::MissingSubcommand),
        Some("at") => match args {
            [_, repo, rest @ ..] if !rest.is_empty() => Ok((repo.clone(), rest.to_vec(), true)),
            [_, _] => Err(BootstrapError::MissingSubcommand),
            _ => Err(BootstrapError::Config("missing repository after 'at'".into())),
        },
        Some(_) => {
            if let Some(repo) = &env.repository {
                return Ok((repo.clone(), args.to_vec(), false));
            }
            if let Some(default) = config.default_repository.as_deref().filter(|d| !d.is_empty()) {
                return Ok((format!("@{default}"), args.to_vec(), false));
            }
            let fallback = format!("fs:{}", home.join(".stowage").display());
            Ok((fallback, args.to_vec(), false))
        }
    }
}

/// Finds the passphrase for non-interactive unlock.
///
/// Order: key file, `passphrase` store key, `passphrase_cmd` store key, environment.
/// Consumed store keys are removed from `store`.
pub fn resolve_passphrase(
    key_from_file: Option<String>,
    store: &mut StoreConfig,
    env_passphrase: Option<&str>,
) -> Result<Option<String>, BootstrapError> {
    if let Some(key) = key_from_file.filter(|k| !k.is_empty()) {
        return Ok(Some(key));
    }
    if let Some(pass) = store.remove("passphrase") {
        return Ok(Some(pass));
    }
    if let Some(cmd) = store.remove("passphrase_cmd") {
        return passphrase_from_command(&cmd).map(Some);
    }
    Ok(env_passphrase.map(str::to_string))
}

/// Runs `cmd` through the shell and returns its trimmed standard output.
pub fn passphrase_from_command(cmd: &str) -> Result<String, BootstrapError> {
    #[cfg(unix)]
    let output = Command::new("sh").arg("-c").arg(cmd).output();
    #[cfg(not(unix))]
    let output = Command::new("cmd").arg("/C").arg(cmd).output();

    let output = output.map_err(|e| BootstrapError::Passphrase(e.to_string()))?;
    if !output.status.success() {
        return Err(BootstrapError::Passphrase(format!(
            "passphrase command exited with {}",
            output.status
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// Reads a key file, dropping one trailing newline.
pub fn read_key_file(path: &Path) -> Result<String, BootstrapError> {
    let data = fs::read_to_string(path).map_err(|e| {
        BootstrapError::Config(format!("could not read key file: {e}"))
    })?;
    Ok(data.strip_suffix('\n').unwrap_or(&data).to_string())
}
