use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Child, Command};
use std::time::{Duration, Instant};

use serde::Deserialize;

use crate::error::PrecacheError;

pub const EMBEDDED_VERSION: &str = env!("CARGO_PKG_VERSION");
pub const DEFAULT_DECLARATION: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/Cargo.toml");
pub const DEFAULT_REBUILD_TIMEOUT: Duration = Duration::from_secs(600);

/// Set on the restarted process so a rebuild that is still stale can't loop.
pub const RESTART_MARKER: &str = "GTFS_PRECACHE_RESTARTED";

const BINARY_NAME: &str = env!("CARGO_PKG_NAME");

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VersionCheck {
    Current,
    Stale { embedded: String, declared: String },
    Undeclared,
}

#[derive(Debug, Deserialize)]
struct Manifest {
    package: Option<Package>,
}

#[derive(Debug, Deserialize)]
struct Package {
    // A table when inherited with `version.workspace = true`.
    version: Option<toml::Value>,
}

/// The literal `version` of the `[package]` table of a Cargo manifest.
pub fn declared_version(manifest: &str) -> Option<String> {
    let manifest: Manifest = match toml::from_str(manifest) {
        Ok(manifest) => manifest,
        Err(err) => {
            log::debug!("Unreadable manifest: {err}");
            return None;
        }
    };
    manifest.package?.version?.as_str().map(str::to_owned)
}

pub fn check(embedded: &str, declaration: &Path) -> VersionCheck {
    let declared = fs::read_to_string(declaration)
        .ok()
        .and_then(|manifest| declared_version(&manifest));

    match declared {
        None => VersionCheck::Undeclared,
        Some(declared) if declared == embedded => VersionCheck::Current,
        Some(declared) => VersionCheck::Stale {
            embedded: embedded.to_owned(),
            declared,
        },
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GuardPolicy {
    /// Rebuild and restart on a stale binary instead of refusing to run.
    pub rebuild: bool,
    /// This process is already the product of a rebuild.
    pub restarted: bool,
}

pub trait Rebuilder {
    /// Builds a fresh binary, installs it and returns the installed path.
    fn rebuild(&mut self) -> Result<PathBuf, PrecacheError>;

    /// Replaces the running process. Returns only on failure.
    fn restart(&mut self, binary: &Path, args: &[OsString]) -> PrecacheError;
}

pub fn enforce(
    check: VersionCheck,
    policy: GuardPolicy,
    rebuilder: &mut impl Rebuilder,
    args: &[OsString],
) -> Result<(), PrecacheError> {
    let (embedded, declared) = match check {
        VersionCheck::Current => return Ok(()),
        VersionCheck::Undeclared => {
            log::warn!("Could not read the declared version, skipping version check");
            return Ok(());
        }
        VersionCheck::Stale { embedded, declared } => (embedded, declared),
    };

    if !policy.rebuild {
        return Err(PrecacheError::VersionMismatch { embedded, declared });
    }
    if policy.restarted {
        return Err(PrecacheError::RebuildFailure(format!(
            "rebuilt binary still reports {embedded}, expected {declared}"
        )));
    }

    log::info!("Version mismatch: binary={embedded}, declared={declared}");
    log::info!("Rebuilding...");
    let binary = rebuilder.rebuild()?;
    log::info!("Rebuild successful, restarting...");
    Err(rebuilder.restart(&binary, args))
}

/// Runs `cargo build --release` against the declaring manifest. Success means
/// exit status 0 and a binary at `<target dir>/release/gtfs-precache`, which
/// is then moved over the running executable.
#[derive(Debug, Clone)]
pub struct CargoRebuilder {
    manifest: PathBuf,
    timeout: Duration,
}

impl CargoRebuilder {
    pub fn new(manifest: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            manifest: manifest.into(),
            timeout,
        }
    }

    fn artifact(&self) -> PathBuf {
        let target_dir = std::env::var_os("CARGO_TARGET_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                self.manifest
                    .parent()
                    .unwrap_or(Path::new("."))
                    .join("target")
            });
        target_dir
            .join("release")
            .join(format!("{BINARY_NAME}{}", std::env::consts::EXE_SUFFIX))
    }

    fn install(&self, artifact: &Path) -> Result<PathBuf, PrecacheError> {
        let exe = std::env::current_exe()
            .map_err(|err| PrecacheError::RebuildFailure(format!("no executable path: {err}")))?;
        install_over(artifact, &exe)?;
        Ok(exe)
    }
}

// Renaming over a running binary is allowed where overwriting it is not.
fn install_over(artifact: &Path, exe: &Path) -> Result<(), PrecacheError> {
    let staged = exe.with_extension("rebuilt");
    if let Err(err) = fs::copy(artifact, &staged).and_then(|_| fs::rename(&staged, exe)) {
        let _ = fs::remove_file(&staged);
        return Err(PrecacheError::RebuildFailure(format!(
            "could not install {artifact:?}: {err}"
        )));
    }
    Ok(())
}

impl Rebuilder for CargoRebuilder {
    fn rebuild(&mut self) -> Result<PathBuf, PrecacheError> {
        let child = Command::new("cargo")
            .arg("build")
            .arg("--release")
            .arg("--manifest-path")
            .arg(&self.manifest)
            .spawn()
            .map_err(|err| PrecacheError::RebuildFailure(format!("could not run cargo: {err}")))?;

        wait_with_timeout(child, self.timeout)?;

        let artifact = self.artifact();
        if !artifact.is_file() {
            return Err(PrecacheError::RebuildFailure(format!(
                "build succeeded but {artifact:?} is missing"
            )));
        }
        self.install(&artifact)
    }

    #[cfg(unix)]
    fn restart(&mut self, binary: &Path, args: &[OsString]) -> PrecacheError {
        use std::os::unix::process::CommandExt;

        let err = Command::new(binary)
            .args(args)
            .env(RESTART_MARKER, "1")
            .exec();
        PrecacheError::RebuildFailure(format!("failed to restart after rebuild: {err}"))
    }

    #[cfg(not(unix))]
    fn restart(&mut self, binary: &Path, args: &[OsString]) -> PrecacheError {
        match Command::new(binary)
            .args(args)
            .env(RESTART_MARKER, "1")
            .status()
        {
            Ok(status) => std::process::exit(status.code().unwrap_or(1)),
            Err(err) => {
                PrecacheError::RebuildFailure(format!("failed to restart after rebuild: {err}"))
            }
        }
    }
}

fn wait_with_timeout(mut child: Child, timeout: Duration) -> Result<(), PrecacheError> {
    let deadline = Instant::now() + timeout;
    loop {
        let status = child
            .try_wait()
            .map_err(|err| PrecacheError::RebuildFailure(format!("lost build process: {err}")))?;
        if let Some(status) = status {
            if status.success() {
                return Ok(());
            }
            return Err(PrecacheError::RebuildFailure(format!("build exited with {status}")));
        }
        if Instant::now() >= deadline {
            // Best effort; the build is abandoned either way.
            let _ = child.kill();
            let _ = child.wait();
            return Err(PrecacheError::RebuildFailure(format!(
                "build did not finish within {timeout:?}"
            )));
        }
        std::thread::sleep(Duration::from_millis(100));
    }
}
