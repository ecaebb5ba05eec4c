//! `flow` - run and validate serialized workflows from the command line.
//!
//! Exit codes: 0 success, 2 validation error, 3 missing required field,
//! 4 block failed, 5 timeout, 6 cancelled.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use serde_json::Value;
use tracing::error;

use flowrunner_core::{
    Engine, EngineError, ErrorKind, HandlerRegistry, RunOptions, RunStatus, SerializedWorkflow,
    ValidateOptions,
};

#[derive(Parser)]
#[command(name = "flow", version, about = "Run and validate workflow files")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Validate a workflow file without running it.
    Validate {
        file: PathBuf,
        /// Also check fields marked user-only required.
        #[arg(long)]
        required: bool,
    },
    /// Execute a workflow file and print the structured run report.
    Run {
        file: PathBuf,
        /// Workflow input as inline JSON.
        #[arg(long, conflicts_with = "input_file")]
        input: Option<String>,
        /// Workflow input read from a JSON file.
        #[arg(long)]
        input_file: Option<PathBuf>,
        /// Environment values for {{ env.KEY }} references.
        #[arg(long = "env", value_name = "KEY=VALUE")]
        env: Vec<String>,
        /// Whole-workflow timeout in seconds.
        #[arg(long)]
        timeout_secs: Option<u64>,
    },
}

const EXIT_VALIDATION: u8 = 2;
const EXIT_MISSING_FIELD: u8 = 3;
const EXIT_BLOCK_FAILED: u8 = 4;
const EXIT_TIMEOUT: u8 = 5;
const EXIT_CANCELLED: u8 = 6;

fn exit_for(error: &EngineError) -> u8 {
    match error.kind {
        ErrorKind::InvalidBlockKind | ErrorKind::InvalidWorkflow => EXIT_VALIDATION,
        ErrorKind::MissingRequiredField => EXIT_MISSING_FIELD,
        ErrorKind::BlockTimeout | ErrorKind::WorkflowTimeout => EXIT_TIMEOUT,
        ErrorKind::Cancelled => EXIT_CANCELLED,
        _ => EXIT_BLOCK_FAILED,
    }
}

fn build_engine() -> Engine {
    let mut registry = HandlerRegistry::with_control_handlers();
    flowrunner_blocks::register_builtins(&mut registry);
    Engine::new(Arc::new(registry))
}

fn load_workflow(file: &PathBuf) -> Result<SerializedWorkflow, String> {
    let raw = std::fs::read_to_string(file)
        .map_err(|e| format!("cannot read {}: {e}", file.display()))?;
    serde_json::from_str(&raw).map_err(|e| format!("cannot parse {}: {e}", file.display()))
}

fn parse_env(pairs: &[String]) -> Result<HashMap<String, String>, String> {
    let mut env = HashMap::new();
    for pair in pairs {
        let (key, value) = pair
            .split_once('=')
            .ok_or_else(|| format!("--env expects KEY=VALUE, got {pair:?}"))?;
        env.insert(key.to_string(), value.to_string());
    }
    Ok(env)
}

fn validate(file: PathBuf, required: bool) -> u8 {
    let workflow = match load_workflow(&file) {
        Ok(w) => w,
        Err(message) => {
            error!(%message, "failed to load workflow");
            eprintln!("{message}");
            return EXIT_VALIDATION;
        }
    };
    let issues = build_engine().validate(
        &workflow,
        ValidateOptions {
            validate_required: required,
        },
    );
    println!("{}", serde_json::to_string_pretty(&issues).expect("issues serialize"));
    if issues.is_empty() {
        0
    } else if issues
        .iter()
        .any(|i| i.kind == ErrorKind::MissingRequiredField)
    {
        EXIT_MISSING_FIELD
    } else {
        EXIT_VALIDATION
    }
}

async fn run(
    file: PathBuf,
    input: Option<String>,
    input_file: Option<PathBuf>,
    env: Vec<String>,
    timeout_secs: Option<u64>,
) -> u8 {
    let workflow = match load_workflow(&file) {
        Ok(w) => w,
        Err(message) => {
            error!(%message, "failed to load workflow");
            eprintln!("{message}");
            return EXIT_VALIDATION;
        }
    };
    let raw_input = match (input, input_file) {
        (Some(inline), _) => inline,
        (None, Some(path)) => match std::fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(e) => {
                eprintln!("cannot read {}: {e}", path.display());
                return EXIT_VALIDATION;
            }
        },
        (None, None) => "null".to_string(),
    };
    let input: Value = match serde_json::from_str(&raw_input) {
        Ok(v) => v,
        Err(e) => {
            eprintln!("input is not valid JSON: {e}");
            return EXIT_VALIDATION;
        }
    };
    let env = match parse_env(&env) {
        Ok(env) => env,
        Err(message) => {
            eprintln!("{message}");
            return EXIT_VALIDATION;
        }
    };

    let report = build_engine()
        .run(
            &workflow,
            input,
            RunOptions {
                cancel: None,
                timeout: timeout_secs.map(Duration::from_secs),
                env,
            },
        )
        .await;
    println!("{}", serde_json::to_string_pretty(&report).expect("report serializes"));
    match report.status {
        RunStatus::Completed => 0,
        RunStatus::Cancelled => EXIT_CANCELLED,
        RunStatus::Failed => report.error.as_ref().map(exit_for).unwrap_or(EXIT_BLOCK_FAILED),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    flowrunner_core::observability::init_observability();
    let cli = Cli::parse();
    let code = match cli.command {
        Command::Validate { file, required } => validate(file, required),
        Command::Run {
            file,
            input,
            input_file,
            env,
            timeout_secs,
        } => run(file, input, input_file, env, timeout_secs).await,
    };
    ExitCode::from(code)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_follow_error_taxonomy() {
        let cases = [
            (ErrorKind::InvalidWorkflow, 2),
            (ErrorKind::InvalidBlockKind, 2),
            (ErrorKind::MissingRequiredField, 3),
            (ErrorKind::BlockFailed, 4),
            (ErrorKind::HandlerNotRegistered, 4),
            (ErrorKind::BlockTimeout, 5),
            (ErrorKind::WorkflowTimeout, 5),
            (ErrorKind::Cancelled, 6),
        ];
        for (kind, expected) in cases {
            assert_eq!(exit_for(&EngineError::new(kind, "x")), expected, "{kind}");
        }
    }

    #[test]
    fn parse_env_splits_pairs() {
        let env = parse_env(&["A=1".into(), "B=two=parts".into()]).unwrap();
        assert_eq!(env["A"], "1");
        assert_eq!(env["B"], "two=parts");
        assert!(parse_env(&["broken".into()]).is_err());
    }
}
