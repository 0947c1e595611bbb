//! Endpoint transport (C1, §4.1).
//!
//! POSIX only: the endpoint is a Unix domain socket path under the
//! system temp directory. Windows named pipes are the spec's intended
//! analogue but are not implemented here — see the module-level note in
//! `DESIGN.md` on the residual risk this leaves on that platform.

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::net::{UnixListener, UnixStream};

/// `sun_path` limit on common Linux/BSD systems, applied conservatively.
const MAX_SUN_PATH: usize = 107;

const STALE_PROBE_TIMEOUT: Duration = Duration::from_millis(200);

/// Generate a random endpoint path: `broker-<12 hex chars>.sock` under
/// the system temp directory, or `BROKER_PIPE_ID` if set (§6).
#[must_use]
pub fn random_path(pipe_id: Option<&str>) -> PathBuf {
    let suffix = pipe_id.map(ToString::to_string).unwrap_or_else(random_hex_suffix);
    std::env::temp_dir().join(format!("broker-{suffix}.sock"))
}

fn random_hex_suffix() -> String {
    (0..12).map(|_| char::from_digit(u32::from(rand::random::<u8>()) % 16, 16).unwrap()).collect()
}

fn validate_path_len(path: &Path) -> Result<()> {
    let len = path.as_os_str().len();
    if len > MAX_SUN_PATH {
        bail!(
            "socket path too long ({len} bytes, max {}): {}; set BROKER_PIPE_ID to a shorter value or use a shorter temp dir",
            MAX_SUN_PATH,
            path.display()
        );
    }
    Ok(())
}

/// Bind the endpoint, recovering a stale socket file left by a crashed
/// prior instance and rejecting a genuinely live one (§4.1).
pub async fn bind(path: &Path) -> Result<UnixListener> {
    validate_path_len(path)?;

    if path.exists() {
        match tokio::time::timeout(STALE_PROBE_TIMEOUT, UnixStream::connect(path)).await {
            Ok(Ok(_stream)) => bail!("already_running: a broker is already listening on {}", path.display()),
            _ => {
                std::fs::remove_file(path)
                    .with_context(|| format!("failed to remove stale endpoint: {}", path.display()))?;
            }
        }
    }

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create endpoint directory: {}", parent.display()))?;
    }

    let listener = std::os::unix::net::UnixListener::bind(path)
        .with_context(|| format!("failed to bind endpoint: {}", path.display()))?;

    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700))
        .with_context(|| format!("failed to set endpoint permissions: {}", path.display()))?;

    listener.set_nonblocking(true)?;
    let listener = UnixListener::from_std(listener)?;
    log::info!("endpoint bound at {}", path.display());
    Ok(listener)
}

/// Remove the endpoint file on stop. Idempotent — a missing file is not
/// an error.
pub fn unlink(path: &Path) {
    if let Err(err) = std::fs::remove_file(path) {
        if err.kind() != std::io::ErrorKind::NotFound {
            log::warn!("failed to unlink endpoint {}: {err}", path.display());
        }
    }
}
