//! File-backed persisted state.
//!
//! Cookies are small marker or value files kept under
//! `<cache>/cookies/<COOKIES_VERSION>/`. Bumping the version starts from a
//! clean slate without touching older files.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Version tag of the cookie directory layout.
pub const COOKIES_VERSION: &str = "v1.0.0";

const AUTH_TOKEN: &str = ".auth-token";
const FIRST_RUN: &str = ".first-run";
const SECURITY_CHECK_DISABLED: &str = ".security-check-disabled";

/// Reads and writes persisted markers and values.
#[derive(Debug, Clone)]
pub struct CookieManager {
    root: PathBuf,
}

impl CookieManager {
    /// Opens (creating if needed) the cookie directory under `cache_dir`.
    pub fn new(cache_dir: impl AsRef<Path>) -> io::Result<Self> {
        let root = cache_dir.as_ref().join("cookies").join(COOKIES_VERSION);
        create_private_dir(&root)?;
        Ok(Self { root })
    }

    /// Directory holding this version's cookies.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Returns the stored authentication token.
    pub fn get_auth_token(&self) -> io::Result<String> {
        let data = fs::read_to_string(self.root.join(AUTH_TOKEN))?;
        Ok(data.trim_end().to_string())
    }

    /// Stores the authentication token.
    pub fn put_auth_token(&self, token: &str) -> io::Result<()> {
        write_private(&self.root.join(AUTH_TOKEN), token.as_bytes())
    }

    /// Returns whether an authentication token is stored.
    #[must_use]
    pub fn has_auth_token(&self) -> bool {
        self.root.join(AUTH_TOKEN).is_file()
    }

    /// Removes the authentication token.
    pub fn delete_auth_token(&self) -> io::Result<()> {
        fs::remove_file(self.root.join(AUTH_TOKEN))
    }

    /// Returns true until [`CookieManager::set_first_run`] has been called.
    #[must_use]
    pub fn is_first_run(&self) -> bool {
        !self.root.join(FIRST_RUN).exists()
    }

    /// Records that the first run has completed.
    pub fn set_first_run(&self) -> io::Result<()> {
        write_private(&self.root.join(FIRST_RUN), b"")
    }

    /// Returns whether the remote security check has been disabled.
    #[must_use]
    pub fn is_disabled_security_check(&self) -> bool {
        self.root.join(SECURITY_CHECK_DISABLED).exists()
    }

    /// Disables the remote security check.
    pub fn set_disabled_security_check(&self) -> io::Result<()> {
        write_private(&self.root.join(SECURITY_CHECK_DISABLED), b"")
    }

    /// Re-enables the remote security check. Succeeds if it was not disabled.
    pub fn remove_disabled_security_check(&self) -> io::Result<()> {
        match fs::remove_file(self.root.join(SECURITY_CHECK_DISABLED)) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }
}

fn create_private_dir(path: &Path) -> io::Result<()> {
    let mut builder = fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(0o700);
    }
    builder.create(path)
}

fn write_private(path: &Path, data: &[u8]) -> io::Result<()> {
    let mut options = fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    io::Write::write_all(&mut options.open(path)?, data)
}
