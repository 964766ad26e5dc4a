// Injected launcher: spawn a detached child with the staged object preloaded.
use std::ffi::OsString;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use serde::Serialize;
use tracing::info;

use crate::core::error::{Error, ErrorKind};

pub const LIBRARY_PATH_VAR: &str = "LD_LIBRARY_PATH";
pub const PRELOAD_VAR: &str = "LD_PRELOAD";
pub const DEFAULT_SHELL: &str = "/bin/sh";

/// Shell program that execs its positional parameters verbatim.
const EXEC_ARGS_SCRIPT: &str = "exec \"$@\"";
const SCRIPT_ARGV0: &str = "stageload";

/// Where the child's stdout and stderr go.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub enum LaunchOutput {
    #[default]
    Discard,
    /// Both streams appended to one file.
    MergedFile(PathBuf),
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LaunchSpec {
    pub shell: PathBuf,
    pub program: OsString,
    pub args: Vec<OsString>,
    pub output: LaunchOutput,
}

impl Default for LaunchSpec {
    fn default() -> Self {
        Self {
            shell: PathBuf::from(DEFAULT_SHELL),
            program: OsString::from("sleep"),
            args: vec![OsString::from("1")],
            output: LaunchOutput::Discard,
        }
    }
}

impl LaunchSpec {
    pub fn with_shell(mut self, shell: impl Into<PathBuf>) -> Self {
        self.shell = shell.into();
        self
    }

    pub fn with_target<I, S>(mut self, program: impl Into<OsString>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.program = program.into();
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_output(mut self, output: LaunchOutput) -> Self {
        self.output = output;
        self
    }
}

/// Identifier of a spawned child. The launcher does not own the child's
/// lifecycle: nothing waits on it, reaps it, or kills it.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
pub struct ProcessHandle {
    pub pid: u32,
}

/// Start `spec` with `LD_LIBRARY_PATH=writable_dir` and `LD_PRELOAD=staged_path`
/// and return as soon as the OS has created the process.
///
/// Failures inside the child after spawn (including the loader refusing the
/// preload) are not observed.
pub fn launch(
    staged_path: &Path,
    writable_dir: &Path,
    spec: &LaunchSpec,
) -> Result<ProcessHandle, Error> {
    validate_loader_paths(staged_path, writable_dir)?;

    let mut command = build_command(staged_path, writable_dir, spec);
    let (stdout, stderr) = output_stdio(&spec.output)?;
    command.stdin(Stdio::null()).stdout(stdout).stderr(stderr);

    let child = command.spawn().map_err(|err| {
        Error::new(ErrorKind::Spawn)
            .with_message("failed to spawn launcher shell")
            .with_path(&spec.shell)
            .with_source(err)
    })?;
    let handle = ProcessHandle { pid: child.id() };
    drop(child);

    info!(
        pid = handle.pid,
        preload = %staged_path.display(),
        program = ?spec.program,
        "launched preloaded process"
    );
    Ok(handle)
}

fn build_command(staged_path: &Path, writable_dir: &Path, spec: &LaunchSpec) -> Command {
    let mut command = Command::new(&spec.shell);
    command
        .arg("-c")
        .arg(EXEC_ARGS_SCRIPT)
        .arg(SCRIPT_ARGV0)
        .arg(&spec.program)
        .args(&spec.args)
        .env(LIBRARY_PATH_VAR, writable_dir)
        .env(PRELOAD_VAR, staged_path);
    command
}

fn output_stdio(output: &LaunchOutput) -> Result<(Stdio, Stdio), Error> {
    match output {
        LaunchOutput::Discard => Ok((Stdio::null(), Stdio::null())),
        LaunchOutput::MergedFile(path) => {
            let file = open_output(path)?;
            let err_file = file.try_clone().map_err(|err| {
                Error::new(ErrorKind::Spawn)
                    .with_message("failed to duplicate launch output handle")
                    .with_path(path)
                    .with_source(err)
            })?;
            Ok((Stdio::from(file), Stdio::from(err_file)))
        }
    }
}

fn open_output(path: &Path) -> Result<File, Error> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|err| {
            Error::new(ErrorKind::Spawn)
                .with_message("failed to open launch output file")
                .with_path(path)
                .with_source(err)
        })
}

/// The loader splits `LD_PRELOAD` on colons and whitespace and
/// `LD_LIBRARY_PATH` on colons and semicolons.
fn validate_loader_paths(staged_path: &Path, writable_dir: &Path) -> Result<(), Error> {
    let Some(preload) = staged_path.to_str() else {
        return Err(Error::new(ErrorKind::Usage)
            .with_message("staged artifact path is not valid UTF-8")
            .with_path(staged_path));
    };
    if preload.contains(':') || preload.chars().any(char::is_whitespace) {
        return Err(Error::new(ErrorKind::Usage)
            .with_message("staged artifact path contains a loader list separator")
            .with_path(staged_path)
            .with_hint("Stage into a directory whose path has no colons or whitespace."));
    }
    let Some(search) = writable_dir.to_str() else {
        return Err(Error::new(ErrorKind::Usage)
            .with_message("library search directory is not valid UTF-8")
            .with_path(writable_dir));
    };
    if search.contains(':') || search.contains(';') {
        return Err(Error::new(ErrorKind::Usage)
            .with_message("library search directory contains a loader list separator")
            .with_path(writable_dir));
    }

    let is_file = staged_path.metadata().map(|meta| meta.is_file()).unwrap_or(false);
    if !is_file {
        return Err(Error::new(ErrorKind::Usage)
            .with_message("staged artifact does not exist")
            .with_path(staged_path)
            .with_hint("Stage the artifact before launching it."));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{LaunchOutput, LaunchSpec, build_command, launch};
    use crate::core::error::ErrorKind;
    use std::ffi::OsStr;
    use std::path::Path;
    use std::time::{Duration, Instant};

    fn staged_file(dir: &Path) -> std::path::PathBuf {
        let path = dir.join("libpayload.so");
        std::fs::write(&path, b"not really an elf").expect("write");
        path
    }

    fn wait_for_line(path: &Path, line: &str, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if let Ok(text) = std::fs::read_to_string(path) {
                if text.lines().any(|candidate| candidate == line) {
                    return true;
                }
            }
            std::thread::sleep(Duration::from_millis(20));
        }
        false
    }

    #[test]
    fn command_passes_target_as_arguments_not_script() {
        let spec = LaunchSpec::default().with_target("echo", ["$(id)", "; rm -rf /"]);
        let command = build_command(Path::new("/data/lib.so"), Path::new("/data"), &spec);

        let args = command.get_args().collect::<Vec<_>>();
        assert_eq!(
            args,
            vec![
                OsStr::new("-c"),
                OsStr::new("exec \"$@\""),
                OsStr::new("stageload"),
                OsStr::new("echo"),
                OsStr::new("$(id)"),
                OsStr::new("; rm -rf /"),
            ]
        );
        let envs = command.get_envs().collect::<Vec<_>>();
        assert!(envs.contains(&(OsStr::new("LD_LIBRARY_PATH"), Some(OsStr::new("/data")))));
        assert!(envs.contains(&(OsStr::new("LD_PRELOAD"), Some(OsStr::new("/data/lib.so")))));
    }

    #[test]
    fn launch_returns_before_child_exits() {
        let dir = tempfile::tempdir().expect("tempdir");
        let staged = staged_file(dir.path());
        let spec = LaunchSpec::default().with_target("sleep", ["3"]);

        let started = Instant::now();
        let handle = launch(&staged, dir.path(), &spec).expect("launch");
        assert!(started.elapsed() < Duration::from_secs(3));
        assert!(handle.pid > 0);
    }

    #[test]
    fn missing_shell_is_a_spawn_failure() {
        let dir = tempfile::tempdir().expect("tempdir");
        let staged = staged_file(dir.path());
        let spec = LaunchSpec::default().with_shell(dir.path().join("no-such-shell"));

        let err = launch(&staged, dir.path(), &spec).expect_err("spawn failure");
        assert_eq!(err.kind(), ErrorKind::Spawn);
    }

    #[test]
    fn child_sees_loader_environment() {
        let dir = tempfile::tempdir().expect("tempdir");
        let staged = staged_file(dir.path());
        let log = dir.path().join("launch.log");
        let spec = LaunchSpec::default()
            .with_target("printenv", ["LD_LIBRARY_PATH", "LD_PRELOAD"])
            .with_output(LaunchOutput::MergedFile(log.clone()));

        launch(&staged, dir.path(), &spec).expect("launch");

        let timeout = Duration::from_secs(5);
        assert!(wait_for_line(&log, dir.path().to_str().expect("utf8"), timeout));
        assert!(wait_for_line(&log, staged.to_str().expect("utf8"), timeout));
    }

    #[test]
    fn separators_in_paths_are_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let odd = dir.path().join("with space");
        std::fs::create_dir(&odd).expect("mkdir");
        let staged = staged_file(&odd);

        let err = launch(&staged, &odd, &LaunchSpec::default()).expect_err("whitespace");
        assert_eq!(err.kind(), ErrorKind::Usage);

        let colon = dir.path().join("a:b");
        std::fs::create_dir(&colon).expect("mkdir");
        let staged = staged_file(&colon);
        let err = launch(&staged, &colon, &LaunchSpec::default()).expect_err("colon");
        assert_eq!(err.kind(), ErrorKind::Usage);
    }

    #[test]
    fn unstaged_artifact_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let err = launch(&dir.path().join("libmissing.so"), dir.path(), &LaunchSpec::default())
            .expect_err("missing");
        assert_eq!(err.kind(), ErrorKind::Usage);
    }
}
