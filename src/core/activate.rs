// One activation: stage the artifact, then launch with it preloaded.
use std::path::PathBuf;

use serde::Serialize;

use crate::core::error::Error;
use crate::core::launch::{LaunchSpec, ProcessHandle, launch};
use crate::core::stage::{StageOptions, StagedArtifact, stage};
use crate::core::store::ArtifactStore;

/// Everything one activation needs; no state is shared between activations.
#[derive(Clone, Debug)]
pub struct ActivationRequest {
    pub artifact: String,
    pub writable_dir: PathBuf,
    pub stage: StageOptions,
    pub launch: LaunchSpec,
}

impl ActivationRequest {
    pub fn new(artifact: impl Into<String>, writable_dir: impl Into<PathBuf>) -> Self {
        Self {
            artifact: artifact.into(),
            writable_dir: writable_dir.into(),
            stage: StageOptions::default(),
            launch: LaunchSpec::default(),
        }
    }

    pub fn with_stage_options(mut self, options: StageOptions) -> Self {
        self.stage = options;
        self
    }

    pub fn with_launch(mut self, launch: LaunchSpec) -> Self {
        self.launch = launch;
        self
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct Activation {
    pub staged: StagedArtifact,
    pub process: ProcessHandle,
}

/// Stage then launch. A staging failure returns before any spawn attempt.
pub fn activate(
    store: &dyn ArtifactStore,
    request: &ActivationRequest,
) -> Result<Activation, Error> {
    let staged = stage(
        store,
        &request.artifact,
        &request.writable_dir,
        request.stage,
    )?;
    let process = launch(&staged.path, &request.writable_dir, &request.launch)?;
    Ok(Activation { staged, process })
}

#[cfg(test)]
mod tests {
    use super::{ActivationRequest, activate};
    use crate::core::error::ErrorKind;
    use crate::core::launch::{LaunchOutput, LaunchSpec};
    use crate::core::store::MemoryStore;

    #[test]
    fn activation_stages_then_launches() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = MemoryStore::new().with_artifact("libpayload.so", b"payload".to_vec());
        let request = ActivationRequest::new("libpayload.so", dir.path())
            .with_launch(LaunchSpec::default().with_target("true", Vec::<String>::new()));

        let activation = activate(&store, &request).expect("activate");
        assert_eq!(activation.staged.path, dir.path().join("libpayload.so"));
        assert!(activation.process.pid > 0);
    }

    #[test]
    fn staging_failure_prevents_launch() {
        let dir = tempfile::tempdir().expect("tempdir");
        let marker = dir.path().join("spawned.log");
        let store = MemoryStore::new();
        let request = ActivationRequest::new("libmissing.so", dir.path()).with_launch(
            LaunchSpec::default()
                .with_target("true", Vec::<String>::new())
                .with_output(LaunchOutput::MergedFile(marker.clone())),
        );

        let err = activate(&store, &request).expect_err("missing artifact");
        assert_eq!(err.kind(), ErrorKind::ArtifactNotFound);
        assert!(!marker.exists());
    }
}
