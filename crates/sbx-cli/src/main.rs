use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use sbx_runner::{
    BatchReport, CatalogEntry, CommandReport, Engine, EngineConfig, FailurePolicy,
};
use serde_json::{json, Value};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "sbx", version, about = "Local sandbox orchestration")]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct GlobalArgs {
    /// Echo command output and log each completed command
    #[arg(long, global = true)]
    verbose: bool,
    /// Log scheduler and worker internals
    #[arg(long, global = true)]
    debug: bool,
    /// Do not read or write the sandbox catalog
    #[arg(long, global = true)]
    skip_catalog: bool,
    #[arg(long, global = true)]
    max_workers: Option<usize>,
    /// Kill any command still running after this many seconds
    #[arg(long, global = true)]
    command_timeout: Option<u64>,
    #[arg(long, global = true)]
    lock_timeout_ms: Option<u64>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a deployment plan and register its sandbox on success
    Run {
        plan: PathBuf,
        #[arg(long)]
        stop_on_failure: bool,
        #[arg(long)]
        json: bool,
    },
    /// Run a script in every cataloged sandbox at once
    Global {
        script: String,
        /// Passed to the script verbatim, so sbx flags such as --json must
        /// come before the script name
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
        #[arg(long)]
        json: bool,
    },
    /// List cataloged sandboxes
    Sandboxes {
        #[arg(long)]
        header: bool,
        #[arg(long)]
        json: bool,
    },
    /// Stop and remove sandboxes (use ALL for every sandbox)
    Delete {
        #[arg(required = true)]
        targets: Vec<String>,
        #[arg(long)]
        skip_stop: bool,
        #[arg(long)]
        json: bool,
    },
    CatalogShow {
        key: String,
        #[arg(long)]
        json: bool,
    },
    CatalogRegister {
        entry: PathBuf,
        #[arg(long)]
        key: Option<String>,
        #[arg(long)]
        json: bool,
    },
    CatalogRemove {
        key: String,
        #[arg(long)]
        json: bool,
    },
}

/// Error carrying a JSON payload already describing the failure.
#[derive(Debug)]
struct BatchFailed(Value);

impl std::fmt::Display for BatchFailed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "one or more commands failed")
    }
}

impl std::error::Error for BatchFailed {}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let json_mode = command_json_mode(&cli.command);
    let result = build_config(&cli.global).and_then(|config| {
        init_tracing(&config);
        debug!(
            home = %config.home_dir.display(),
            catalog = %config.catalog_path.display(),
            lock = %config.lock_path.display(),
            strategy = config.lock_strategy.as_str(),
            catalog_enabled = config.catalog_enabled,
            max_workers = ?config.max_workers,
            "engine configuration"
        );
        run_command(config, cli.command)
    });
    match result {
        Ok(Some(payload)) => {
            emit_json(&payload);
            Ok(())
        }
        Ok(None) => Ok(()),
        Err(err) => {
            if let Some(BatchFailed(payload)) = err.downcast_ref::<BatchFailed>() {
                if json_mode {
                    emit_json(payload);
                }
                std::process::exit(1);
            }
            if json_mode {
                emit_json(&json_error("command_failed", format!("{:#}", err), json!({})));
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

fn build_config(args: &GlobalArgs) -> Result<EngineConfig> {
    let mut config = EngineConfig::load()?;
    if args.verbose {
        config.verbose = true;
    }
    if args.debug {
        config.debug = true;
    }
    if args.skip_catalog {
        config.catalog_enabled = false;
    }
    if let Some(n) = args.max_workers {
        config.max_workers = Some(n).filter(|n| *n > 0);
    }
    if let Some(secs) = args.command_timeout {
        config.command_timeout = Some(Duration::from_secs(secs)).filter(|d| !d.is_zero());
    }
    if let Some(ms) = args.lock_timeout_ms {
        config.lock_timeout = Duration::from_millis(ms);
    }
    Ok(config)
}

fn init_tracing(config: &EngineConfig) {
    let default_level = if config.debug {
        "debug"
    } else if config.verbose {
        "info"
    } else {
        "warn"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

fn run_command(config: EngineConfig, command: Commands) -> Result<Option<Value>> {
    match command {
        Commands::Run {
            plan,
            stop_on_failure,
            json,
        } => {
            let policy = if stop_on_failure {
                FailurePolicy::StopAfterFailedLevel
            } else {
                FailurePolicy::Continue
            };
            let engine = Engine::new(config).with_policy(policy);
            let loaded = sbx_runner::load_plan(&plan)?;
            let outcome = engine.run_plan(loaded)?;
            let payload = json!({
                "ok": outcome.batch.is_success(),
                "command": "run",
                "batch": batch_to_json(&outcome.batch),
                "registered": outcome.registered.as_ref().map(|(key, entry)| json!({
                    "key": key,
                    "entry": entry,
                })),
            });
            if !outcome.batch.is_success() {
                if !json {
                    print_batch(&outcome.batch);
                }
                return Err(BatchFailed(payload).into());
            }
            if json {
                return Ok(Some(payload));
            }
            print_batch(&outcome.batch);
            match &outcome.registered {
                Some((key, _)) => println!("registered: {}", key),
                None => println!("registered: none"),
            }
        }
        Commands::Global { script, args, json } => {
            let engine = Engine::new(config);
            let outcome = engine.global(&script, &args)?;
            let payload = json!({
                "ok": outcome.batch.is_success(),
                "command": "global",
                "script": script,
                "batch": batch_to_json(&outcome.batch),
                "skipped": outcome.skipped,
            });
            if !json {
                print_batch(&outcome.batch);
                for key in &outcome.skipped {
                    println!("skipped: {} (no {} script)", key, script);
                }
            }
            if !outcome.batch.is_success() {
                return Err(BatchFailed(payload).into());
            }
            if json {
                return Ok(Some(payload));
            }
        }
        Commands::Sandboxes { header, json } => {
            let engine = Engine::new(config);
            let listed = engine.list()?;
            if json {
                let entries: Vec<Value> = listed
                    .iter()
                    .map(|(key, entry)| json!({ "key": key, "entry": entry }))
                    .collect();
                return Ok(Some(json!({
                    "ok": true,
                    "command": "sandboxes",
                    "sandboxes": entries,
                })));
            }
            if header {
                println!(
                    "{:<40} {:<14} {:<12} {:<20} {}",
                    "name", "type", "version", "ports", "destination"
                );
            }
            for (key, entry) in &listed {
                print_entry_line(key, entry);
            }
        }
        Commands::Delete {
            targets,
            skip_stop,
            json,
        } => {
            let engine = Engine::new(config);
            let outcome = engine.delete_sandboxes(&targets, skip_stop)?;
            let payload = json!({
                "ok": outcome.is_success(),
                "command": "delete",
                "batch": batch_to_json(&outcome.batch),
                "removed": outcome.removed,
                "kept": outcome.kept,
                "failed": outcome
                    .failed
                    .iter()
                    .map(|(key, error)| json!({ "key": key, "error": error }))
                    .collect::<Vec<_>>(),
            });
            if !json {
                for key in &outcome.removed {
                    println!("removed: {}", key);
                }
                for key in &outcome.kept {
                    println!("kept (stop failed): {}", key);
                }
                for (key, error) in &outcome.failed {
                    println!("failed: {}: {}", key, error);
                }
            }
            if !outcome.is_success() {
                return Err(BatchFailed(payload).into());
            }
            if json {
                return Ok(Some(payload));
            }
        }
        Commands::CatalogShow { key, json } => {
            let engine = Engine::new(config);
            let entry = engine
                .catalog()
                .get(&key)?
                .ok_or_else(|| anyhow!("no catalog entry for {}", key))?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "catalog-show",
                    "key": key,
                    "entry": entry,
                })));
            }
            println!("{}", serde_json::to_string_pretty(&entry)?);
        }
        Commands::CatalogRegister { entry, key, json } => {
            let raw = fs::read_to_string(&entry)
                .with_context(|| format!("failed to read {}", entry.display()))?;
            let parsed: CatalogEntry = serde_json::from_str(&raw)
                .with_context(|| format!("invalid catalog entry in {}", entry.display()))?;
            let key = key.unwrap_or_else(|| parsed.destination.clone());
            if key.is_empty() {
                return Err(anyhow!("entry has no destination; pass --key"));
            }
            let engine = Engine::new(config);
            let written = engine.catalog().update(&key, parsed)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "catalog-register",
                    "key": key,
                    "entry": written,
                })));
            }
            println!("registered: {}", key);
        }
        Commands::CatalogRemove { key, json } => {
            let engine = Engine::new(config);
            let removed = engine.catalog().delete(&key)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "catalog-remove",
                    "key": key,
                    "removed": removed,
                })));
            }
            println!("removed: {}", removed);
        }
    }
    Ok(None)
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\",\"details\":{{}}}}}}"
        ),
    }
}

fn json_error(code: &str, message: String, details: Value) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message,
            "details": details
        }
    })
}

fn command_json_mode(command: &Commands) -> bool {
    match command {
        Commands::Run { json, .. }
        | Commands::Global { json, .. }
        | Commands::Sandboxes { json, .. }
        | Commands::Delete { json, .. }
        | Commands::CatalogShow { json, .. }
        | Commands::CatalogRegister { json, .. }
        | Commands::CatalogRemove { json, .. } => *json,
    }
}

fn report_to_json(report: &CommandReport) -> Value {
    json!({
        "index": report.index,
        "operation_id": report.operation_id,
        "level": report.level,
        "identity": report.identity,
        "outcome": report.outcome,
        "started_at": report.started_at.to_rfc3339(),
        "finished_at": report.finished_at.to_rfc3339(),
        "output": report.output,
    })
}

fn batch_to_json(batch: &BatchReport) -> Value {
    json!({
        "levels_run": batch.levels_run,
        "skipped": batch.skipped,
        "failed": batch.failures().len(),
        "reports": batch.reports.iter().map(report_to_json).collect::<Vec<_>>(),
    })
}

fn print_batch(batch: &BatchReport) {
    for report in &batch.reports {
        println!(
            "level {} [{}] {}: {}",
            report.level, report.operation_id, report.identity, report.outcome
        );
        if !report.is_success() && !report.output.is_empty() {
            for line in report.output.lines() {
                println!("    {}", line);
            }
        }
    }
    if !batch.skipped.is_empty() {
        println!("skipped after failure: {} command(s)", batch.skipped.len());
    }
}

fn print_entry_line(key: &str, entry: &CatalogEntry) {
    let name = std::path::Path::new(key)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(key);
    let ports = entry
        .port
        .iter()
        .map(|p| p.to_string())
        .collect::<Vec<_>>()
        .join(",");
    println!(
        "{:<40} {:<14} {:<12} {:<20} {}",
        name, entry.kind.as_str(), entry.version, ports, entry.destination
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn global_flags_work_after_subcommand() {
        let cli = Cli::try_parse_from([
            "sbx",
            "run",
            "plan.yaml",
            "--max-workers",
            "3",
            "--skip-catalog",
            "--json",
        ])
        .expect("parse");
        assert_eq!(cli.global.max_workers, Some(3));
        assert!(cli.global.skip_catalog);
        assert!(command_json_mode(&cli.command));
    }

    #[test]
    fn global_passes_trailing_script_args() {
        let cli = Cli::try_parse_from(["sbx", "global", "use", "-e", "select 1"]).expect("parse");
        match cli.command {
            Commands::Global { script, args, json } => {
                assert_eq!(script, "use");
                assert_eq!(args, vec!["-e".to_string(), "select 1".to_string()]);
                assert!(!json);
            }
            _ => panic!("expected global"),
        }
    }

    #[test]
    fn global_json_flag_goes_before_the_script() {
        let cli = Cli::try_parse_from(["sbx", "global", "--json", "status", "-x"]).expect("parse");
        assert!(command_json_mode(&cli.command));

        let cli = Cli::try_parse_from(["sbx", "global", "status", "-x", "--json"]).expect("parse");
        assert!(!command_json_mode(&cli.command));
        match cli.command {
            Commands::Global { args, .. } => {
                assert_eq!(args, vec!["-x".to_string(), "--json".to_string()])
            }
            _ => panic!("expected global"),
        }
    }

    #[test]
    fn delete_requires_a_target() {
        assert!(Cli::try_parse_from(["sbx", "delete"]).is_err());
    }
}
