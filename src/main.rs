//! Purpose: `stageload` CLI entry point.
//! Role: Binary crate root; parses args, runs commands, emits JSON on stdout.
//! Invariants: Command results are emitted as one JSON document on stdout.
//! Invariants: Non-interactive errors are emitted as JSON on stderr.
//! Invariants: Process exit code is derived from `stageload::to_exit_code`.
//! Invariants: Diagnostics go through `tracing` to stderr, filtered by `RUST_LOG`.
use std::ffi::OsString;
use std::io::{self, IsTerminal};
use std::path::PathBuf;

use clap::{Args, CommandFactory, Parser, Subcommand, ValueHint, error::ErrorKind as ClapErrorKind};
use clap_complete::aot::Shell;
use serde_json::{Map, Value, json};
use std::error::Error as StdError;
use tracing_subscriber::EnvFilter;

mod command_dispatch;
mod data_paths;

use data_paths::{default_data_dir, default_store_dir};
use stageload::{Error, ErrorKind, LaunchOutput, LaunchSpec, to_exit_code};

#[derive(Copy, Clone, Debug)]
struct RunOutcome {
    exit_code: i32,
}

impl RunOutcome {
    fn ok() -> Self {
        Self { exit_code: 0 }
    }
}

fn main() {
    let exit_code = match run() {
        Ok(outcome) => outcome.exit_code,
        Err(err) => {
            emit_error(&err);
            to_exit_code(err.kind())
        }
    };
    std::process::exit(exit_code);
}

fn run() -> Result<RunOutcome, Error> {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => match err.kind() {
            ClapErrorKind::DisplayHelp
            | ClapErrorKind::DisplayVersion
            | ClapErrorKind::DisplayHelpOnMissingArgumentOrSubcommand => {
                err.print().map_err(|io_err| {
                    Error::new(ErrorKind::Internal)
                        .with_message("failed to write help")
                        .with_source(io_err)
                })?;
                let exit_code = if matches!(
                    err.kind(),
                    ClapErrorKind::DisplayHelpOnMissingArgumentOrSubcommand
                ) {
                    2
                } else {
                    0
                };
                return Ok(RunOutcome { exit_code });
            }
            _ => {
                return Err(Error::new(ErrorKind::Usage)
                    .with_message(clap_error_summary(&err))
                    .with_hint("Run `stageload --help` for usage."));
            }
        },
    };

    init_tracing();

    let context = CommandContext {
        store_dir: cli.store.unwrap_or_else(default_store_dir),
        data_dir: cli.dir.unwrap_or_else(default_data_dir),
        list_inventory: !cli.quiet_inventory,
    };

    command_dispatch::dispatch_command(cli.command, &context).map_err(add_hint)
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(io::stderr)
        .try_init();
}

#[derive(Parser)]
#[command(
    name = "stageload",
    version,
    about = "Stage a bundled shared object and launch a process with it preloaded",
    long_about = None,
    after_help = r#"EXAMPLES
  $ stageload --store ./assets list
  $ stageload --store ./assets --dir /data/app stage libpayload.so
  $ stageload --store ./assets --dir /data/app run libpayload.so -- sleep 1

NOTES
  - Staging replaces any previous copy atomically.
  - Launching returns once the child exists; it is never waited on.
  - Set RUST_LOG=debug for lock and temp-file details."#,
    arg_required_else_help = true
)]
struct Cli {
    #[arg(
        long,
        global = true,
        help = "Directory of bundled artifacts (default: ./assets)",
        value_hint = ValueHint::DirPath
    )]
    store: Option<PathBuf>,
    #[arg(
        long,
        global = true,
        help = "Writable staging directory, also the library search path (default: ~/.stageload/data)",
        value_hint = ValueHint::DirPath
    )]
    dir: Option<PathBuf>,
    #[arg(
        long,
        global = true,
        help = "Skip logging the artifact inventory before staging"
    )]
    quiet_inventory: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    #[command(about = "List artifacts in the store")]
    List,
    #[command(
        arg_required_else_help = true,
        about = "Copy an artifact into the staging directory",
        after_help = r#"EXAMPLES
  $ stageload --dir /data/app stage libpayload.so"#
    )]
    Stage {
        #[arg(help = "Artifact name (a bare file name)")]
        name: String,
    },
    #[command(
        arg_required_else_help = true,
        about = "Launch a process with an already-staged object preloaded",
        after_help = r#"EXAMPLES
  $ stageload --dir /data/app launch /data/app/libpayload.so -- sleep 5
  $ stageload --dir /data/app launch /data/app/libpayload.so --output /data/app/run.log -- id"#
    )]
    Launch {
        #[arg(help = "Path of the staged shared object", value_hint = ValueHint::FilePath)]
        path: PathBuf,
        #[command(flatten)]
        target: TargetArgs,
    },
    #[command(
        arg_required_else_help = true,
        about = "Stage an artifact, then launch with it preloaded",
        after_help = r#"EXAMPLES
  $ stageload --dir /data/app run libpayload.so
  $ stageload --dir /data/app run libpayload.so --output /data/app/run.log -- sleep 1

NOTES
  - Nothing is launched if staging fails."#
    )]
    Run {
        #[arg(help = "Artifact name (a bare file name)")]
        name: String,
        #[command(flatten)]
        target: TargetArgs,
    },
    #[command(
        arg_required_else_help = true,
        about = "Generate shell completions",
        after_help = r#"EXAMPLES
  $ stageload completion bash > ~/.local/share/bash-completion/completions/stageload"#
    )]
    Completion {
        #[arg(help = "Shell to generate completions for")]
        shell: Shell,
    },
}

#[derive(Args, Debug)]
struct TargetArgs {
    #[arg(
        long,
        default_value = stageload::core::launch::DEFAULT_SHELL,
        help = "Interpreter used to exec the target",
        value_hint = ValueHint::FilePath
    )]
    shell: PathBuf,
    #[arg(
        long,
        help = "Append the child's stdout and stderr to this file (default: discard)",
        value_hint = ValueHint::FilePath
    )]
    output: Option<PathBuf>,
    #[arg(
        last = true,
        help = "Target program and arguments (default: sleep 1)"
    )]
    target: Vec<OsString>,
}

impl TargetArgs {
    fn into_spec(self) -> LaunchSpec {
        let mut spec = LaunchSpec::default().with_shell(self.shell);
        let mut target = self.target.into_iter();
        if let Some(program) = target.next() {
            spec = spec.with_target(program, target);
        }
        if let Some(path) = self.output {
            spec = spec.with_output(LaunchOutput::MergedFile(path));
        }
        spec
    }
}

struct CommandContext {
    store_dir: PathBuf,
    data_dir: PathBuf,
    list_inventory: bool,
}

fn clap_error_summary(err: &clap::Error) -> String {
    let text = err.to_string();
    text.lines()
        .find(|line| !line.trim().is_empty())
        .map(|line| line.trim_start_matches("error:").trim().to_string())
        .unwrap_or_else(|| "invalid arguments".to_string())
}

fn add_hint(err: Error) -> Error {
    if err.hint().is_some() {
        return err;
    }
    match err.kind() {
        ErrorKind::ArtifactNotFound => err.with_hint(
            "Run `stageload list` to see bundled artifacts, or point --store at the asset directory.",
        ),
        ErrorKind::SourceRead => err.with_hint("The artifact store could not be read. Check --store."),
        ErrorKind::DestinationWrite if err.is_permission_denied() => err.with_hint(
            "Permission denied. Use --dir to point at a writable directory.",
        ),
        ErrorKind::DestinationWrite => {
            err.with_hint("Check that --dir exists and the filesystem has space.")
        }
        ErrorKind::Spawn => err.with_hint("Check that --shell names an executable interpreter."),
        ErrorKind::Internal => err.with_hint(
            "Unexpected internal failure. Retry with RUST_BACKTRACE=1 and share command/context if it persists.",
        ),
        ErrorKind::Usage => err,
    }
}

fn emit_json(value: Value) {
    let json = if io::stdout().is_terminal() {
        serde_json::to_string_pretty(&value)
    } else {
        serde_json::to_string(&value)
    }
    .unwrap_or_else(|_| "{\"error\":\"json encode failed\"}".to_string());
    println!("{json}");
}

fn emit_error(err: &Error) {
    if io::stderr().is_terminal() {
        eprintln!("{}", error_text(err));
        return;
    }

    let json = serde_json::to_string(&error_json(err)).unwrap_or_else(|_| {
        "{\"error\":{\"kind\":\"Internal\",\"message\":\"json encode failed\"}}".to_string()
    });
    eprintln!("{json}");
}

fn error_message(err: &Error) -> String {
    if let Some(message) = err.message() {
        return message.to_string();
    }
    match err.kind() {
        ErrorKind::Internal => "internal error".to_string(),
        ErrorKind::Usage => "usage error".to_string(),
        ErrorKind::ArtifactNotFound => "artifact not found".to_string(),
        ErrorKind::SourceRead => "failed to read artifact".to_string(),
        ErrorKind::DestinationWrite => "failed to write staged artifact".to_string(),
        ErrorKind::Spawn => "failed to spawn process".to_string(),
    }
}

fn error_causes(err: &Error) -> Vec<String> {
    let mut causes = Vec::new();
    let mut cur = err.source();
    while let Some(source) = cur {
        causes.push(source.to_string());
        cur = source.source();
    }
    causes
}

fn error_json(err: &Error) -> Value {
    let mut inner = Map::new();
    inner.insert("kind".to_string(), json!(format!("{:?}", err.kind())));
    inner.insert("message".to_string(), json!(error_message(err)));
    if let Some(hint) = err.hint() {
        inner.insert("hint".to_string(), json!(hint));
    }
    if let Some(path) = err.path() {
        inner.insert("path".to_string(), json!(path.display().to_string()));
    }
    let causes = error_causes(err);
    if !causes.is_empty() {
        inner.insert("causes".to_string(), json!(causes));
    }

    let mut outer = Map::new();
    outer.insert("error".to_string(), Value::Object(inner));
    Value::Object(outer)
}

fn error_text(err: &Error) -> String {
    let mut lines = vec![format!("error: {}", error_message(err))];
    if let Some(hint) = err.hint() {
        lines.push(format!("hint: {hint}"));
    }
    if let Some(path) = err.path() {
        lines.push(format!("path: {}", path.display()));
    }
    for cause in error_causes(err) {
        lines.push(format!("caused by: {cause}"));
    }
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::{Cli, Command, TargetArgs, add_hint, error_json, error_text};
    use clap::Parser;
    use stageload::{Error, ErrorKind, LaunchOutput};
    use std::ffi::OsString;
    use std::path::PathBuf;

    #[test]
    fn trailing_args_become_the_target() {
        let cli = Cli::try_parse_from([
            "stageload",
            "--dir",
            "/data/app",
            "run",
            "libpayload.so",
            "--output",
            "/data/app/run.log",
            "--",
            "sleep",
            "5",
        ])
        .expect("parse");
        assert_eq!(cli.dir, Some(PathBuf::from("/data/app")));
        let Command::Run { name, target } = cli.command else {
            panic!("expected run");
        };
        assert_eq!(name, "libpayload.so");

        let spec = target.into_spec();
        assert_eq!(spec.program, OsString::from("sleep"));
        assert_eq!(spec.args, vec![OsString::from("5")]);
        assert_eq!(
            spec.output,
            LaunchOutput::MergedFile(PathBuf::from("/data/app/run.log"))
        );
    }

    #[test]
    fn empty_target_keeps_default_invocation() {
        let args = TargetArgs {
            shell: PathBuf::from("/bin/sh"),
            output: None,
            target: Vec::new(),
        };
        let spec = args.into_spec();
        assert_eq!(spec.program, OsString::from("sleep"));
        assert_eq!(spec.args, vec![OsString::from("1")]);
        assert_eq!(spec.output, LaunchOutput::Discard);
    }

    #[test]
    fn hints_are_added_per_kind_without_overriding() {
        let err = add_hint(Error::new(ErrorKind::ArtifactNotFound));
        assert!(err.hint().expect("hint").contains("stageload list"));

        let err = add_hint(Error::new(ErrorKind::Spawn).with_hint("custom"));
        assert_eq!(err.hint(), Some("custom"));

        let err = add_hint(Error::new(ErrorKind::Usage));
        assert!(err.hint().is_none());
    }

    #[test]
    fn error_json_carries_kind_path_and_causes() {
        let err = Error::new(ErrorKind::DestinationWrite)
            .with_path("/data/app/libpayload.so")
            .with_source(std::io::Error::other("disk full"));
        let value = error_json(&err);
        let inner = &value["error"];
        assert_eq!(inner["kind"], "DestinationWrite");
        assert_eq!(inner["message"], "failed to write staged artifact");
        assert_eq!(inner["path"], "/data/app/libpayload.so");
        assert_eq!(inner["causes"][0], "disk full");
    }

    #[test]
    fn error_text_lists_hint_and_path() {
        let err = Error::new(ErrorKind::Usage)
            .with_message("bad input")
            .with_hint("try again")
            .with_path("/tmp/x");
        let text = error_text(&err);
        assert_eq!(text, "error: bad input\nhint: try again\npath: /tmp/x");
    }
}
