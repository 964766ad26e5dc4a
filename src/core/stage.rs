// Payload staging: copy a bundled artifact into a writable directory with
// per-target locking and write-to-temp-then-rename replacement.
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use fs2::FileExt;
use serde::Serialize;
use sha2::{Digest, Sha256};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tracing::{debug, info, warn};

use crate::core::error::{Error, ErrorKind};
use crate::core::store::{ArtifactStore, SCRATCH_PREFIX, validate_artifact_name};

const COPY_BUF_SIZE: usize = 64 * 1024;
const SCRATCH_KEY_LEN: usize = 16;
#[cfg(unix)]
const STAGED_MODE: u32 = 0o755;

#[derive(Clone, Copy, Debug)]
pub struct StageOptions {
    /// Log every artifact name the store can see before copying.
    pub list_inventory: bool,
}

impl Default for StageOptions {
    fn default() -> Self {
        Self {
            list_inventory: true,
        }
    }
}

/// Result of a successful staging call.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct StagedArtifact {
    pub name: String,
    pub path: PathBuf,
    pub bytes: u64,
    pub sha256: String,
    pub staged_at: String,
}

/// Destination path for `name` inside `writable_dir`.
pub fn staging_target(name: &str, writable_dir: &Path) -> Result<PathBuf, Error> {
    validate_artifact_name(name)?;
    Ok(writable_dir.join(name))
}

/// Copy artifact `name` from `store` to `writable_dir/name`, replacing any
/// previous copy.
///
/// The destination is only ever replaced by a rename of a fully written and
/// synced sibling file, so readers see the old or the new artifact and
/// never a mixture. On failure the previous destination is left untouched.
pub fn stage(
    store: &dyn ArtifactStore,
    name: &str,
    writable_dir: &Path,
    options: StageOptions,
) -> Result<StagedArtifact, Error> {
    let target = staging_target(name, writable_dir)?;

    if options.list_inventory {
        log_inventory(store);
    }

    info!(artifact = name, "opening artifact");
    let mut reader = store.open(name)?;

    ensure_writable_dir(writable_dir)?;
    let key = scratch_key(name);
    let _lock = StageLock::acquire(&key, writable_dir)?;

    let mut tmp = tempfile::Builder::new()
        .prefix(&format!("{SCRATCH_PREFIX}{key}."))
        .suffix(".tmp")
        .tempfile_in(writable_dir)
        .map_err(|err| {
            Error::new(ErrorKind::DestinationWrite)
                .with_message("failed to create temporary staging file")
                .with_path(writable_dir)
                .with_source(err)
        })?;
    debug!(temp = %tmp.path().display(), "writing staged copy");

    let (bytes, sha256) = copy_artifact(&mut reader, tmp.as_file_mut(), &target)?;

    tmp.as_file().sync_all().map_err(|err| {
        Error::new(ErrorKind::DestinationWrite)
            .with_message("failed to sync staged artifact")
            .with_path(&target)
            .with_source(err)
    })?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tmp.as_file()
            .set_permissions(fs::Permissions::from_mode(STAGED_MODE))
            .map_err(|err| {
                Error::new(ErrorKind::DestinationWrite)
                    .with_message("failed to set staged artifact permissions")
                    .with_path(&target)
                    .with_source(err)
            })?;
    }

    let staged_at = OffsetDateTime::now_utc().format(&Rfc3339).map_err(|err| {
        Error::new(ErrorKind::Internal)
            .with_message("failed to format staging time")
            .with_source(err)
    })?;

    // Nothing may fail after the rename.
    tmp.persist(&target).map_err(|err| {
        Error::new(ErrorKind::DestinationWrite)
            .with_message("failed to move staged artifact into place")
            .with_path(&target)
            .with_source(err.error)
    })?;

    info!(
        artifact = name,
        path = %target.display(),
        bytes,
        "staged artifact"
    );
    Ok(StagedArtifact {
        name: name.to_string(),
        path: target,
        bytes,
        sha256,
        staged_at,
    })
}

fn log_inventory(store: &dyn ArtifactStore) {
    match store.list() {
        Ok(names) => info!(artifacts = ?names, "available artifacts"),
        Err(err) => warn!(error = %err, "failed to list available artifacts"),
    }
}

fn ensure_writable_dir(dir: &Path) -> Result<(), Error> {
    let meta = fs::metadata(dir).map_err(|err| {
        Error::new(ErrorKind::DestinationWrite)
            .with_message("staging directory is not accessible")
            .with_path(dir)
            .with_source(err)
    })?;
    if !meta.is_dir() {
        return Err(Error::new(ErrorKind::DestinationWrite)
            .with_message("staging directory is not a directory")
            .with_path(dir));
    }
    Ok(())
}

fn copy_artifact(
    reader: &mut dyn Read,
    writer: &mut File,
    target: &Path,
) -> Result<(u64, String), Error> {
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; COPY_BUF_SIZE];
    let mut total = 0u64;
    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => {
                return Err(Error::new(ErrorKind::SourceRead)
                    .with_message("failed to read artifact")
                    .with_source(err));
            }
        };
        writer.write_all(&buf[..n]).map_err(|err| {
            Error::new(ErrorKind::DestinationWrite)
                .with_message("failed to write staged artifact")
                .with_path(target)
                .with_source(err)
        })?;
        hasher.update(&buf[..n]);
        total += n as u64;
    }
    Ok((total, hex_encode(&hasher.finalize())))
}

/// Fixed-length stand-in for `name` in lock and temp file names, so scratch
/// files never exceed the filesystem's name limit when the target does not.
fn scratch_key(name: &str) -> String {
    let mut key = hex_encode(&Sha256::digest(name.as_bytes()));
    key.truncate(SCRATCH_KEY_LEN);
    key
}

fn hex_encode(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

/// Exclusive advisory lock on `<dir>/.stage-<key>.lock`, held for one staging call.
struct StageLock {
    file: File,
}

impl StageLock {
    fn acquire(key: &str, dir: &Path) -> Result<Self, Error> {
        let path = dir.join(format!("{SCRATCH_PREFIX}{key}.lock"));
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|err| {
                Error::new(ErrorKind::DestinationWrite)
                    .with_message("failed to open staging lock")
                    .with_path(&path)
                    .with_source(err)
            })?;
        file.lock_exclusive().map_err(|err| {
            Error::new(ErrorKind::DestinationWrite)
                .with_message("failed to lock staging target")
                .with_path(&path)
                .with_source(err)
        })?;
        debug!(lock = %path.display(), "acquired staging lock");
        Ok(Self { file })
    }
}

impl Drop for StageLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}
