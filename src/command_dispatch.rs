//! Purpose: Hold top-level CLI command dispatch for `stageload`.
//! Exports: `dispatch_command`.
//! Role: Keep `main.rs` focused on parse/bootstrap and delegate command execution.
//! Invariants: Each command emits exactly one JSON document on success.
//! Invariants: `run` never launches when staging fails.

use super::*;

use stageload::{
    ActivationRequest, ArtifactStore, DirStore, StageOptions, activate, launch, stage,
};

pub(super) fn dispatch_command(
    command: Command,
    context: &CommandContext,
) -> Result<RunOutcome, Error> {
    let store = DirStore::new(&context.store_dir);
    let options = StageOptions {
        list_inventory: context.list_inventory,
    };

    match command {
        Command::Completion { shell } => {
            let mut cmd = Cli::command();
            clap_complete::aot::generate(shell, &mut cmd, "stageload", &mut io::stdout());
            Ok(RunOutcome::ok())
        }
        Command::List => {
            let artifacts = store.list()?;
            emit_json(json!({
                "store": store.root().display().to_string(),
                "artifacts": artifacts,
            }));
            Ok(RunOutcome::ok())
        }
        Command::Stage { name } => {
            let staged = stage(&store, &name, &context.data_dir, options)?;
            emit_json(json!({ "staged": to_value(&staged)? }));
            Ok(RunOutcome::ok())
        }
        Command::Launch { path, target } => {
            let process = launch(&path, &context.data_dir, &target.into_spec())?;
            emit_json(json!({ "process": to_value(&process)? }));
            Ok(RunOutcome::ok())
        }
        Command::Run { name, target } => {
            let request = ActivationRequest::new(name, &context.data_dir)
                .with_stage_options(options)
                .with_launch(target.into_spec());
            let activation = activate(&store, &request)?;
            emit_json(to_value(&activation)?);
            Ok(RunOutcome::ok())
        }
    }
}

fn to_value(value: &impl serde::Serialize) -> Result<Value, Error> {
    serde_json::to_value(value).map_err(|err| {
        Error::new(ErrorKind::Internal)
            .with_message("failed to encode result")
            .with_source(err)
    })
}
