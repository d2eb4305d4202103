//! Test fixtures: a one-shot HTTP server, on-disk repositories and
//! bootstrap environments rooted in a temporary directory.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use zeroize::Zeroizing;

use super::mocks::ScriptedPrompt;
use crate::bootstrap::BootstrapContext;
use crate::cancellation::CancellationToken;
use crate::commands::CommandContext;
use crate::config::{fallback_machine_id, Directories, EnvOverrides, HostInfo, StoreConfig};
use crate::cookies::CookieManager;
use crate::repository::{
    Argon2Kdf, DefaultBackend, EncryptionConfig, KdfParams, OpenMode, Repository, StorageConfiguration, Store,
    StoreBackend,
};
use crate::security::SecurityContext;
use crate::updates::{MockUpdateChecker, UpdateSummary};
use crate::utils::{CapturedOutput, Console};

/// A canned HTTP response.
#[derive(Debug, Clone)]
pub struct CannedResponse {
    status: u16,
    body: String,
}

impl CannedResponse {
    /// JSON response with `body`.
    pub fn json(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    /// Response without a body.
    #[must_use]
    pub fn empty(status: u16) -> Self {
        Self {
            status,
            body: String::new(),
        }
    }

    fn to_bytes(&self) -> Vec<u8> {
        let reason = reqwest::StatusCode::from_u16(self.status)
            .ok()
            .and_then(|s| s.canonical_reason())
            .unwrap_or("Status");
        let mut head = format!("HTTP/1.1 {} {reason}\r\nConnection: close\r\n", self.status);
        if self.status != 204 {
            if !self.body.is_empty() {
                head.push_str("Content-Type: application/json\r\n");
            }
            head.push_str(&format!("Content-Length: {}\r\n", self.body.len()));
        }
        head.push_str("\r\n");
        let mut out = head.into_bytes();
        if self.status != 204 {
            out.extend_from_slice(self.body.as_bytes());
        }
        out
    }
}

/// Serves `response` to the first connection on a loopback port.
///
/// Returns the base URL and a receiver yielding the raw request (head and body).
pub async fn serve_once(response: CannedResponse) -> (String, oneshot::Receiver<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}", listener.local_addr().unwrap());
    let (tx, rx) = oneshot::channel();

    tokio::spawn(async move {
        let Ok((mut socket, _)) = listener.accept().await else {
            return;
        };
        let _ = tx.send(answer(&mut socket, &response).await);
    });

    (url, rx)
}

/// Serves `responses` in order, one connection each.
///
/// The receiver yields each raw request as it is answered.
pub async fn serve_sequence(responses: Vec<CannedResponse>) -> (String, mpsc::UnboundedReceiver<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}", listener.local_addr().unwrap());
    let (tx, rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        for response in responses {
            let Ok((mut socket, _)) = listener.accept().await else {
                return;
            };
            let _ = tx.send(answer(&mut socket, &response).await);
        }
    });

    (url, rx)
}

async fn answer(socket: &mut TcpStream, response: &CannedResponse) -> String {
    let mut data = Vec::new();
    let mut chunk = [0u8; 4096];
    let mut expected: Option<usize> = None;
    loop {
        if let Some(total) = expected {
            if data.len() >= total {
                break;
            }
        }
        let n = match socket.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        data.extend_from_slice(&chunk[..n]);
        if expected.is_none() {
            if let Some(end) = find_head_end(&data) {
                expected = Some(end + content_length(&data[..end]));
            }
        }
    }

    let _ = socket.write_all(&response.to_bytes()).await;
    let _ = socket.shutdown().await;
    String::from_utf8_lossy(&data).into_owned()
}

fn find_head_end(data: &[u8]) -> Option<usize> {
    data.windows(4).position(|w| w == b"\r\n\r\n").map(|p| p + 4)
}

fn content_length(head: &[u8]) -> usize {
    String::from_utf8_lossy(head)
        .lines()
        .find_map(|line| {
            let (name, value) = line.split_once(':')?;
            name.eq_ignore_ascii_case("content-length")
                .then(|| value.trim().parse().ok())
                .flatten()
        })
        .unwrap_or(0)
}

/// Host identity for tests.
#[must_use]
pub fn test_host(home: &Path) -> HostInfo {
    HostInfo {
        username: "tester".into(),
        hostname: "testhost".into(),
        machine_id: fallback_machine_id("testhost"),
        home_dir: home.to_path_buf(),
        operating_system: std::env::consts::OS.into(),
        architecture: std::env::consts::ARCH.into(),
        num_cpus: 4,
    }
}

/// A filesystem repository in a temporary directory.
pub struct TestRepository {
    tmp: TempDir,
    root: PathBuf,
    store_config: StoreConfig,
    configuration: StorageConfiguration,
    key: Option<Zeroizing<Vec<u8>>>,
}

impl TestRepository {
    /// Unencrypted repository.
    #[must_use]
    pub fn plaintext() -> Self {
        Self::create(None)
    }

    /// Repository encrypted with `passphrase`, using cheap KDF costs.
    #[must_use]
    pub fn encrypted(passphrase: &str) -> Self {
        let (config, key) =
            EncryptionConfig::generate(&Argon2Kdf, KdfParams::argon2id_with_cost(64, 1, 1), passphrase.as_bytes())
                .unwrap();
        let mut repo = Self::create(Some(config));
        repo.key = Some(key);
        repo
    }

    fn create(encryption: Option<EncryptionConfig>) -> Self {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("repo");
        let mut store_config = StoreConfig::new();
        store_config.insert("location".into(), format!("fs:{}", root.display()));

        let configuration = StorageConfiguration::new(encryption);
        let store = DefaultBackend
            .create(&store_config, &configuration.to_bytes().unwrap())
            .unwrap();
        store.close().unwrap();

        Self {
            tmp,
            root,
            store_config,
            configuration,
            key: None,
        }
    }

    /// Directory of the store.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// `fs:` location of the store.
    #[must_use]
    pub fn location(&self) -> String {
        format!("fs:{}", self.root.display())
    }

    /// Store configuration pointing at the repository.
    #[must_use]
    pub fn store_config(&self) -> &StoreConfig {
        &self.store_config
    }

    /// Header written at creation.
    #[must_use]
    pub fn configuration(&self) -> &StorageConfiguration {
        &self.configuration
    }

    /// Opens a handle, caching state under the fixture's directory.
    #[must_use]
    pub fn open(&self, mode: OpenMode) -> Repository {
        let (store, header) = DefaultBackend.open(&self.store_config).unwrap();
        Repository::open(
            store,
            &header,
            self.store_config.clone(),
            self.key.as_ref().map(|k| k.as_slice()),
            &self.tmp.path().join("cache"),
            mode,
        )
        .unwrap()
    }
}

/// Everything a [`CommandContext`] borrows, with captured output.
pub struct CommandFixture {
    tmp: TempDir,
    /// Captured console.
    pub console: Console,
    stdout: CapturedOutput,
    stderr: CapturedOutput,
    /// Security context handed to commands.
    pub security: SecurityContext,
    /// Cancellation token handed to commands.
    pub cancel: CancellationToken,
    /// Host identity.
    pub host: HostInfo,
    /// Store configuration for `<tmp>/repo`, which does not exist yet.
    pub store_config: StoreConfig,
    /// Passphrase prompt; empty unless replaced.
    pub prompt: ScriptedPrompt,
    /// Cookie store in `<tmp>/cookies`, logged out.
    pub cookies: CookieManager,
    /// Account services endpoint; unroutable unless replaced.
    pub services_endpoint: String,
}

impl CommandFixture {
    /// Creates a fixture in a fresh temporary directory.
    #[must_use]
    pub fn new() -> Self {
        let tmp = TempDir::new().unwrap();
        let (console, stdout, stderr) = Console::captured();
        let mut store_config = StoreConfig::new();
        store_config.insert("location".into(), format!("fs:{}", tmp.path().join("repo").display()));
        let host = test_host(tmp.path());
        let cookies = CookieManager::new(tmp.path().join("cookies")).unwrap();
        Self {
            tmp,
            console,
            stdout,
            stderr,
            security: SecurityContext::new(),
            cancel: CancellationToken::new(),
            host,
            store_config,
            prompt: ScriptedPrompt::default(),
            cookies,
            services_endpoint: "http://127.0.0.1:9".into(),
        }
    }

    /// Context borrowing the fixture.
    #[must_use]
    pub fn ctx(&self) -> CommandContext<'_> {
        CommandContext {
            console: &self.console,
            security: &self.security,
            cancel: &self.cancel,
            host: &self.host,
            cwd: self.tmp.path(),
            command_line: "stowage test",
            store_config: &self.store_config,
            backend: &DefaultBackend,
            kdf: &Argon2Kdf,
            prompt: &self.prompt,
            cookies: Some(&self.cookies),
            services_endpoint: &self.services_endpoint,
        }
    }

    /// Opens the store at the fixture's location.
    #[must_use]
    pub fn open_store(&self) -> (Arc<dyn Store>, Vec<u8>) {
        DefaultBackend.open(&self.store_config).unwrap()
    }

    /// Standard output so far.
    #[must_use]
    pub fn stdout(&self) -> String {
        self.stdout.contents()
    }

    /// Standard error so far.
    #[must_use]
    pub fn stderr(&self) -> String {
        self.stderr.contents()
    }
}

impl Default for CommandFixture {
    fn default() -> Self {
        Self::new()
    }
}

/// Directories, host and environment for a bootstrap run in a temporary directory.
pub struct TestEnvironment {
    tmp: TempDir,
    /// Home directory of the test user.
    pub home: PathBuf,
    /// Configuration and cache directories.
    pub dirs: Directories,
    /// Host identity.
    pub host: HostInfo,
    /// Environment overrides; agentless by default.
    pub env: EnvOverrides,
}

impl TestEnvironment {
    /// Creates the environment.
    #[must_use]
    pub fn new() -> Self {
        let tmp = TempDir::new().unwrap();
        let home = tmp.path().join("home");
        std::fs::create_dir_all(&home).unwrap();
        let dirs = Directories {
            config: tmp.path().join("config"),
            cache_root: tmp.path().join("cache"),
        };
        let host = test_host(&home);
        Self {
            tmp,
            home,
            dirs,
            host,
            env: EnvOverrides {
                agentless: true,
                ..EnvOverrides::default()
            },
        }
    }

    /// Root of the temporary directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        self.tmp.path()
    }

    /// `fs:` location of `<tmp>/<name>`.
    #[must_use]
    pub fn location(&self, name: &str) -> String {
        format!("fs:{}", self.tmp.path().join(name).display())
    }

    /// Cookie store shared with bootstrap runs in this environment.
    #[must_use]
    pub fn cookies(&self) -> CookieManager {
        CookieManager::new(self.dirs.cookies_cache().unwrap()).unwrap()
    }

    /// Bootstrap context for `stowage <args>`, with captured output, no OS
    /// signal handlers and an update feed reporting nothing new.
    #[must_use]
    pub fn context(&self, args: &[&str]) -> (BootstrapContext, CapturedOutput, CapturedOutput) {
        let (console, stdout, stderr) = Console::captured();
        let mut checker = MockUpdateChecker::new();
        checker.expect_check().returning(|_| Ok(UpdateSummary::default()));

        let ctx = BootstrapContext::new("stowage", args.iter().map(|a| (*a).to_string()).collect())
            .with_env(self.env.clone())
            .with_directories(self.dirs.clone())
            .with_host(self.host.clone())
            .with_console(console)
            .with_prompt(Arc::new(ScriptedPrompt::default()))
            .with_update_checker(Arc::new(checker))
            .without_os_signals();
        (ctx, stdout, stderr)
    }
}

impl Default for TestEnvironment {
    fn default() -> Self {
        Self::new()
    }
}
