use std::io;
use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::crypto::{Crypto, ImportedKey};
use crate::error::{Error, ImportError, Result, VerifyError};
use crate::parse::{
    classify_verification, only_fingerprint_is, parse_gpg_version, parse_import_status, parse_keys,
    parse_verify_status,
};
use crate::types::Key;
use crate::validation::Fingerprint;

const DEFAULT_PROGRAM: &str = "gpg";
const MAX_STDERR: usize = 2048;

/// [`Crypto`] implementation that drives the `gpg` binary.
///
/// # Example
///
/// ```no_run
/// # async fn example() -> gpgsync::Result<()> {
/// use gpgsync::{Crypto, Gpg};
///
/// let gpg = Gpg::new().key_cache_dir("/var/lib/gpgsync/keys");
/// if !gpg.is_available().await {
///     return Err(gpgsync::Error::ToolUnavailable);
/// }
/// for key in gpg.list_keys(None).await? {
///     println!("{} {}", key.fingerprint, key.uid);
/// }
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct Gpg {
    program: String,
    homedir: Option<PathBuf>,
    key_cache_dir: Option<PathBuf>,
}

impl Default for Gpg {
    fn default() -> Self {
        Self::new()
    }
}

impl Gpg {
    /// Uses `gpg` from `PATH` with its default home directory.
    #[must_use]
    pub fn new() -> Self {
        Self {
            program: DEFAULT_PROGRAM.to_string(),
            homedir: None,
            key_cache_dir: None,
        }
    }

    /// Uses a specific GnuPG home directory instead of the user's default.
    #[must_use]
    pub fn with_homedir(path: impl Into<PathBuf>) -> Self {
        Self {
            homedir: Some(path.into()),
            ..Self::new()
        }
    }

    /// Overrides the binary name, e.g. `gpg2`.
    #[must_use]
    pub fn program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    /// Directory holding saved authority keys as `<FINGERPRINT>.asc`.
    #[must_use]
    pub fn key_cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.key_cache_dir = Some(dir.into());
        self
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.env("LC_ALL", "C").args(["--batch", "--no-tty"]);
        if let Some(homedir) = &self.homedir {
            cmd.arg(format!("--homedir={}", homedir.display()));
        }
        cmd
    }

    /// Runs gpg with `args`, feeding `input` on stdin.
    ///
    /// Read-only invocations are killed if the caller is dropped. Imports
    /// are left to finish so a cancelled run never interrupts gpg halfway
    /// through writing the keyring.
    async fn run(&self, args: &[&str], input: Option<&[u8]>, read_only: bool) -> io::Result<Output> {
        let mut child = self
            .command()
            .args(args)
            .stdin(if input.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(read_only)
            .spawn()?;

        let stdin = child.stdin.take();
        let write = async move {
            if let (Some(mut pipe), Some(bytes)) = (stdin, input) {
                pipe.write_all(bytes).await?;
                pipe.shutdown().await?;
            }
            Ok::<(), io::Error>(())
        };

        let (written, output) = tokio::join!(write, child.wait_with_output());
        let output = output?;

        // gpg may exit before reading all of stdin, e.g. on garbage input.
        if let Err(e) = written
            && e.kind() != io::ErrorKind::BrokenPipe
        {
            return Err(e);
        }

        Ok(output)
    }

    /// Lists keys in the keyring, or only `fingerprint` if given.
    pub async fn list_keys(&self, fingerprint: Option<&Fingerprint>) -> Result<Vec<Key>> {
        let mut args = vec!["--with-colons", "--list-keys"];
        if let Some(fp) = fingerprint {
            args.push(fp.as_str());
        }

        let output = self.run(&args, None, true).await?;
        if !output.status.success() {
            return Err(GpgFailure::from_output(&output).into());
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(parse_keys(&stdout))
    }

    fn cache_path(&self, fingerprint: &Fingerprint) -> Option<PathBuf> {
        self.key_cache_dir
            .as_deref()
            .map(|dir| dir.join(format!("{fingerprint}.asc")))
    }
}

#[async_trait]
impl Crypto for Gpg {
    async fn is_available(&self) -> bool {
        match self.run(&["--version"], None, true).await {
            Ok(output) if output.status.success() => {
                let version = parse_gpg_version(&String::from_utf8_lossy(&output.stdout));
                debug!(?version, program = %self.program, "detected gpg");
                matches!(version, Some(major) if major >= 2)
            }
            Ok(output) => {
                debug!(status = ?output.status.code(), "gpg --version failed");
                false
            }
            Err(e) => {
                debug!(error = %e, program = %self.program, "gpg not found");
                false
            }
        }
    }

    async fn import_key(&self, fingerprint: &Fingerprint) -> std::result::Result<ImportedKey, ImportError> {
        let path = self
            .cache_path(fingerprint)
            .ok_or_else(|| ImportError::NotCached(fingerprint.to_string()))?;

        let material = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(ImportError::NotCached(fingerprint.to_string()));
            }
            Err(e) => return Err(e.into()),
        };

        if !self.fingerprint_matches(&material, fingerprint).await {
            warn!(path = %path.display(), "cached key does not match its file name");
            return Err(ImportError::FingerprintMismatch {
                requested: fingerprint.to_string(),
            });
        }

        self.import_key_material(&material, fingerprint).await
    }

    async fn save_key(&self, fingerprint: &Fingerprint) -> std::result::Result<(), ImportError> {
        let Some(path) = self.cache_path(fingerprint) else {
            return Ok(());
        };

        let material = self.export_key(fingerprint).await?;
        if let Some(dir) = path.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }
        write_replace(&path, &material).await?;
        debug!(%fingerprint, path = %path.display(), "saved key to cache");
        Ok(())
    }

    async fn export_key(&self, fingerprint: &Fingerprint) -> std::result::Result<Vec<u8>, ImportError> {
        let output = self
            .run(&["--armor", "--export", fingerprint.as_str()], None, true)
            .await?;
        if !output.status.success() {
            return Err(GpgFailure::from_output(&output).into());
        }
        if output.stdout.is_empty() {
            return Err(ImportError::NoKeyMaterial);
        }
        Ok(output.stdout)
    }

    async fn verify_detached_signature(
        &self,
        data: &[u8],
        signature: &[u8],
        expected_signer: &Fingerprint,
    ) -> std::result::Result<(), VerifyError> {
        let workdir = tempfile::tempdir().map_err(io_to_verify)?;
        let data_path = workdir.path().join("keylist");
        let sig_path = workdir.path().join("keylist.sig");
        tokio::fs::write(&data_path, data).await.map_err(io_to_verify)?;
        tokio::fs::write(&sig_path, signature).await.map_err(io_to_verify)?;

        let sig_arg = sig_path.to_string_lossy().into_owned();
        let data_arg = data_path.to_string_lossy().into_owned();
        let output = self
            .run(
                &["--status-fd", "1", "--verify", sig_arg.as_str(), data_arg.as_str()],
                None,
                true,
            )
            .await
            .map_err(io_to_verify)?;

        let status = parse_verify_status(&String::from_utf8_lossy(&output.stdout));
        debug!(?status, exit = ?output.status.code(), "gpg --verify");
        classify_verification(&status, expected_signer)
    }

    async fn fingerprint_matches(&self, key_material: &[u8], expected: &Fingerprint) -> bool {
        let output = match self
            .run(
                &["--with-colons", "--import-options", "show-only", "--import"],
                Some(key_material),
                true,
            )
            .await
        {
            Ok(output) => output,
            Err(e) => {
                warn!(error = %e, "failed to inspect key material");
                return false;
            }
        };

        let keys = parse_keys(&String::from_utf8_lossy(&output.stdout));
        only_fingerprint_is(&keys, expected)
    }

    async fn import_key_material(
        &self,
        key_material: &[u8],
        expected: &Fingerprint,
    ) -> std::result::Result<ImportedKey, ImportError> {
        let output = self
            .run(&["--status-fd", "1", "--import"], Some(key_material), false)
            .await?;

        let imported = parse_import_status(&String::from_utf8_lossy(&output.stdout));
        if imported.is_empty() {
            if output.status.success() {
                return Err(ImportError::NoKeyMaterial);
            }
            return Err(GpgFailure::from_output(&output).into());
        }
        if imported.iter().any(|fpr| fpr != expected.as_str()) {
            warn!(%expected, ?imported, "gpg imported an unexpected key");
            return Err(ImportError::FingerprintMismatch {
                requested: expected.to_string(),
            });
        }

        Ok(ImportedKey {
            fingerprint: expected.clone(),
            uid: self.get_uid(expected).await,
        })
    }

    async fn get_uid(&self, fingerprint: &Fingerprint) -> String {
        match self.list_keys(Some(fingerprint)).await {
            Ok(keys) => keys
                .into_iter()
                .find(|k| k.fingerprint.eq_ignore_ascii_case(fingerprint.as_str()))
                .map(|k| k.uid)
                .unwrap_or_default(),
            Err(e) => {
                debug!(%fingerprint, error = %e, "uid lookup failed");
                String::new()
            }
        }
    }
}

async fn write_replace(path: &Path, contents: &[u8]) -> io::Result<()> {
    let tmp = path.with_extension("asc.tmp");
    tokio::fs::write(&tmp, contents).await?;
    tokio::fs::rename(&tmp, path).await
}

fn io_to_verify(err: io::Error) -> VerifyError {
    VerifyError::Gpg {
        status: -1,
        stderr: err.to_string(),
    }
}

/// A non-zero gpg exit, with stderr trimmed to a bounded length.
#[derive(Debug, Clone, PartialEq, Eq)]
struct GpgFailure {
    status: i32,
    stderr: String,
}

impl GpgFailure {
    fn from_output(output: &Output) -> Self {
        Self::new(output.status.code().unwrap_or(-1), &output.stderr)
    }

    fn new(status: i32, stderr: &[u8]) -> Self {
        let msg = String::from_utf8_lossy(stderr);
        let mut stderr = msg.trim().to_string();
        if stderr.len() > MAX_STDERR {
            let mut end = MAX_STDERR;
            while !stderr.is_char_boundary(end) {
                end -= 1;
            }
            stderr.truncate(end);
        }
        Self { status, stderr }
    }
}

impl From<GpgFailure> for Error {
    fn from(f: GpgFailure) -> Self {
        Error::Gpg {
            status: f.status,
            stderr: f.stderr,
        }
    }
}

impl From<GpgFailure> for ImportError {
    fn from(f: GpgFailure) -> Self {
        ImportError::Gpg {
            status: f.status,
            stderr: f.stderr,
        }
    }
}
