// Read-only artifact stores: by-name lookup plus enumeration for diagnostics.
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, Cursor, Read};
use std::path::{Path, PathBuf};

use crate::core::error::{Error, ErrorKind};

/// Source of bundled artifacts. Stores are never written through this trait.
pub trait ArtifactStore {
    /// Names of every artifact the store can open, sorted.
    fn list(&self) -> Result<Vec<String>, Error>;

    /// Open an artifact for reading.
    ///
    /// Returns `ArtifactNotFound` when no artifact carries `name` and
    /// `SourceRead` for any other failure.
    fn open(&self, name: &str) -> Result<Box<dyn Read + '_>, Error>;
}

/// Leading component of the stager's lock and temp file names.
pub const SCRATCH_PREFIX: &str = ".stage-";

/// Artifact names are single path components outside the stager's
/// scratch namespace.
pub fn validate_artifact_name(name: &str) -> Result<(), Error> {
    let reason = if name.is_empty() {
        Some("artifact name is empty")
    } else if name == "." || name == ".." {
        Some("artifact name may not be `.` or `..`")
    } else if name.contains('/') || name.contains('\\') {
        Some("artifact name may not contain path separators")
    } else if name.contains('\0') {
        Some("artifact name may not contain NUL")
    } else if name.starts_with(SCRATCH_PREFIX) {
        Some("artifact name may not start with the reserved `.stage-` prefix")
    } else {
        None
    };
    match reason {
        Some(reason) => Err(Error::new(ErrorKind::Usage)
            .with_message(reason)
            .with_hint("Use the bare file name of a bundled artifact, e.g. `libpayload.so`.")),
        None => Ok(()),
    }
}

/// A directory of bundled artifacts on disk.
#[derive(Clone, Debug)]
pub struct DirStore {
    root: PathBuf,
}

impl DirStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl ArtifactStore for DirStore {
    fn list(&self) -> Result<Vec<String>, Error> {
        let entries = fs::read_dir(&self.root).map_err(|err| {
            Error::new(source_error_kind(&err))
                .with_message("failed to list artifact store")
                .with_path(&self.root)
                .with_source(err)
        })?;

        let mut names = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|err| {
                Error::new(ErrorKind::SourceRead)
                    .with_path(&self.root)
                    .with_source(err)
            })?;
            // Follows symlinks, matching `open`.
            if !entry.path().is_file() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                names.push(name.to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    fn open(&self, name: &str) -> Result<Box<dyn Read + '_>, Error> {
        validate_artifact_name(name)?;
        let path = self.root.join(name);
        let file = File::open(&path).map_err(|err| {
            Error::new(source_error_kind(&err))
                .with_message("failed to open artifact")
                .with_path(&path)
                .with_source(err)
        })?;
        // Opening a directory succeeds on unix; reject it before the first read.
        let is_file = file.metadata().map(|meta| meta.is_file()).unwrap_or(false);
        if !is_file {
            return Err(Error::new(ErrorKind::ArtifactNotFound)
                .with_message("artifact is not a regular file")
                .with_path(&path));
        }
        Ok(Box::new(file))
    }
}

fn source_error_kind(err: &io::Error) -> ErrorKind {
    match err.kind() {
        io::ErrorKind::NotFound => ErrorKind::ArtifactNotFound,
        _ => ErrorKind::SourceRead,
    }
}

/// Artifacts held in memory, e.g. payloads compiled in with `include_bytes!`.
#[derive(Clone, Debug, Default)]
pub struct MemoryStore {
    artifacts: BTreeMap<String, Vec<u8>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_artifact(mut self, name: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        self.insert(name, bytes);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, bytes: impl Into<Vec<u8>>) {
        self.artifacts.insert(name.into(), bytes.into());
    }
}

impl ArtifactStore for MemoryStore {
    fn list(&self) -> Result<Vec<String>, Error> {
        Ok(self.artifacts.keys().cloned().collect())
    }

    fn open(&self, name: &str) -> Result<Box<dyn Read + '_>, Error> {
        validate_artifact_name(name)?;
        match self.artifacts.get(name) {
            Some(bytes) => Ok(Box::new(Cursor::new(bytes.as_slice()))),
            None => Err(Error::new(ErrorKind::ArtifactNotFound)
                .with_message(format!("no bundled artifact named `{name}`"))),
        }
    }
}
