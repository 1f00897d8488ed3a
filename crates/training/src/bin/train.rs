use std::{
    path::{Path, PathBuf},
    str::FromStr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use clap::Parser;
use serde_json::{Number, Value};
use tracing::{error, info};
use training::{launch, logging::init_tracing, TrainingConfig, TrainingError};

#[derive(Parser, Debug)]
#[command(author, version, about = "Resumable language-model training", long_about = None)]
struct Args {
    #[arg(short, long, value_name = "PATH", help = "Training config (TOML, YAML or JSON)")]
    config: PathBuf,

    #[arg(
        long = "set",
        value_name = "KEY=VALUE",
        help = "Override a configuration value using a dot-separated path"
    )]
    overrides: Vec<OverrideArg>,

    #[arg(long, value_name = "STEP", help = "Resume from the checkpoint of this step")]
    resume: Option<u64>,

    #[arg(long, conflicts_with = "resume", help = "Ignore existing checkpoints")]
    fresh: bool,

    #[arg(long, value_name = "LEVEL", env = "TRAIN_LOG_LEVEL", help = "Log level or filter")]
    log_level: Option<String>,
}

#[derive(Debug, Clone)]
struct OverrideArg {
    path: String,
    value: String,
}

impl FromStr for OverrideArg {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (path, value) = s
            .split_once('=')
            .ok_or_else(|| "override must be in the form key=value".to_string())?;
        if path.trim().is_empty() {
            return Err("override key must not be empty".into());
        }
        Ok(Self {
            path: path.trim().to_string(),
            value: value.trim().to_string(),
        })
    }
}

fn main() {
    let args = Args::parse();
    if let Err(err) = run(args) {
        let step = err
            .context()
            .map_or_else(|| "-".to_string(), |(step, _)| step.to_string());
        let rank = err
            .context()
            .map_or_else(|| "-".to_string(), |(_, rank)| rank.to_string());
        error!(kind = %err.kind(), step = %step, rank = %rank, "{err}");
        eprintln!("training failed: kind={} step={step} rank={rank}: {err}", err.kind());
        std::process::exit(err.exit_code());
    }
}

fn run(args: Args) -> Result<(), TrainingError> {
    let mut value = TrainingConfig::load_value(&args.config)?;
    for override_arg in &args.overrides {
        let new_value = parse_override_value(&override_arg.value);
        set_value_at_path(&mut value, &override_arg.path, new_value)?;
    }
    let base_dir = args.config.parent().unwrap_or_else(|| Path::new("."));
    let mut config = TrainingConfig::from_value(value, base_dir)?;
    config.apply_environment()?;
    if let Some(step) = args.resume {
        config.checkpointing.resume_from = Some(step);
    }
    if args.fresh {
        config.checkpointing.auto_resume = false;
        config.checkpointing.resume_from = None;
    }

    let level = args
        .log_level
        .clone()
        .unwrap_or_else(|| config.logging.level.clone());
    init_tracing(&level);

    let stop = Arc::new(AtomicBool::new(false));
    let handler_flag = Arc::clone(&stop);
    ctrlc::set_handler(move || {
        handler_flag.store(true, Ordering::Relaxed);
    })
    .map_err(|err| TrainingError::runtime(format!("failed to install signal handler: {err}")))?;

    let outcome = launch::run(config, &stop)?;
    info!(
        final_step = outcome.final_step,
        tokens = outcome.state.tokens_seen,
        checkpoint = outcome.last_manifest.as_ref().map(|m| m.step),
        "run terminated"
    );
    Ok(())
}

fn parse_override_value(raw: &str) -> Value {
    let trimmed = raw.trim();
    if trimmed.eq_ignore_ascii_case("true") {
        return Value::Bool(true);
    }
    if trimmed.eq_ignore_ascii_case("false") {
        return Value::Bool(false);
    }
    if trimmed.eq_ignore_ascii_case("null") {
        return Value::Null;
    }
    if let Ok(int_val) = trimmed.parse::<i64>() {
        return Value::Number(Number::from(int_val));
    }
    if let Ok(float_val) = trimmed.parse::<f64>() {
        if let Some(number) = Number::from_f64(float_val) {
            return Value::Number(number);
        }
    }
    if trimmed.starts_with('[') || trimmed.starts_with('{') {
        if let Ok(json_val) = serde_json::from_str::<Value>(trimmed) {
            return json_val;
        }
    }
    Value::String(trimmed.to_string())
}

/// Sets `path` (`a.b.c`) inside `value`, creating intermediate tables.
fn set_value_at_path(value: &mut Value, path: &str, new_value: Value) -> Result<(), TrainingError> {
    let segments: Vec<&str> = path.split('.').map(str::trim).collect();
    if segments.iter().any(|segment| segment.is_empty()) {
        return Err(TrainingError::configuration(format!(
            "invalid override path '{path}'"
        )));
    }

    let mut current = value;
    for (index, segment) in segments.iter().enumerate() {
        if current.is_null() {
            *current = Value::Object(serde_json::Map::new());
        }
        let Some(map) = current.as_object_mut() else {
            return Err(TrainingError::configuration(format!(
                "override path '{path}' crosses a non-table value at '{segment}'"
            )));
        };
        if index + 1 == segments.len() {
            map.insert(segment.to_string(), new_value);
            return Ok(());
        }
        current = map.entry(segment.to_string()).or_insert(Value::Null);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overrides_create_nested_tables() {
        let mut value = serde_json::json!({ "training": { "max_steps": 10 } });
        set_value_at_path(&mut value, "training.max_steps", parse_override_value("20")).unwrap();
        set_value_at_path(&mut value, "checkpointing.publish.enabled", parse_override_value("true"))
            .unwrap();
        assert_eq!(value["training"]["max_steps"], 20);
        assert_eq!(value["checkpointing"]["publish"]["enabled"], true);
    }

    #[test]
    fn override_into_scalar_is_rejected() {
        let mut value = serde_json::json!({ "training": 3 });
        let err = set_value_at_path(&mut value, "training.max_steps", Value::Null).unwrap_err();
        assert!(err.to_string().contains("non-table"));
    }
}
