use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::catalog::{CatalogEntry, CatalogStore};
use crate::command::{ExecutionItem, OperationLog, RunnableCommand};
use crate::config::EngineConfig;
use crate::scheduler::{BatchReport, FailurePolicy, PriorityScheduler};

/// Target name that selects every catalog entry in `delete_sandboxes`.
pub const ALL_SANDBOXES: &str = "ALL";

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Plan {
    #[serde(default)]
    pub steps: Vec<PlanStep>,
    #[serde(default)]
    pub register: Option<Registration>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PlanStep {
    #[serde(default)]
    pub level: u32,
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub workdir: Option<PathBuf>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub log: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Registration {
    pub key: String,
    pub entry: CatalogEntry,
}

/// Loads a plan from YAML (`.yaml`/`.yml`) or JSON. Relative `workdir` and
/// `log` paths resolve against the plan file's directory.
pub fn load_plan(path: &Path) -> Result<Plan> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read plan {}", path.display()))?;
    let is_yaml = matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("yaml") | Some("yml")
    );
    let json_value: Value = if is_yaml {
        let yaml_value: serde_yaml::Value = serde_yaml::from_str(&raw)
            .with_context(|| format!("invalid YAML in plan {}", path.display()))?;
        serde_json::to_value(yaml_value)?
    } else {
        serde_json::from_str(&raw)
            .with_context(|| format!("invalid JSON in plan {}", path.display()))?
    };
    let mut plan: Plan = serde_json::from_value(json_value)
        .with_context(|| format!("plan {} does not match the plan format", path.display()))?;
    let base = path.parent().unwrap_or(Path::new("."));
    for step in &mut plan.steps {
        if let Some(dir) = step.workdir.take() {
            step.workdir = Some(resolve_against(base, dir));
        }
        if let Some(log) = step.log.take() {
            step.log = Some(resolve_against(base, log));
        }
    }
    Ok(plan)
}

fn resolve_against(base: &Path, path: PathBuf) -> PathBuf {
    if path.is_absolute() {
        path
    } else {
        base.join(path)
    }
}

#[derive(Debug)]
pub struct PlanOutcome {
    pub batch: BatchReport,
    pub registered: Option<(String, CatalogEntry)>,
}

#[derive(Debug)]
pub struct GlobalOutcome {
    pub batch: BatchReport,
    /// Catalog keys with no runnable script.
    pub skipped: Vec<String>,
}

#[derive(Debug)]
pub struct DeleteOutcome {
    pub batch: BatchReport,
    pub removed: Vec<String>,
    /// Sandboxes left in place because their stop script failed.
    pub kept: Vec<String>,
    /// Stopped sandboxes whose directory or catalog entry could not be
    /// removed, with the error.
    pub failed: Vec<(String, String)>,
}

impl DeleteOutcome {
    pub fn is_success(&self) -> bool {
        self.kept.is_empty() && self.failed.is_empty()
    }
}

/// Scheduler and catalog bound to one engine context.
#[derive(Debug, Clone)]
pub struct Engine {
    config: EngineConfig,
    scheduler: PriorityScheduler,
    catalog: CatalogStore,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Self {
        let scheduler = PriorityScheduler::from_config(&config);
        let catalog = CatalogStore::from_config(&config);
        Self {
            config,
            scheduler,
            catalog,
        }
    }

    pub fn with_policy(mut self, policy: FailurePolicy) -> Self {
        self.scheduler = self.scheduler.with_policy(policy);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn catalog(&self) -> &CatalogStore {
        &self.catalog
    }

    pub fn scheduler(&self) -> &PriorityScheduler {
        &self.scheduler
    }

    /// Runs every step, then registers the plan's catalog entry if and only
    /// if all of them succeeded.
    pub fn run_plan(&self, plan: Plan) -> Result<PlanOutcome> {
        let mut logs: BTreeMap<PathBuf, OperationLog> = BTreeMap::new();
        let items: Vec<ExecutionItem> = plan
            .steps
            .into_iter()
            .map(|step| {
                let mut command = RunnableCommand::new(step.program).args(step.args);
                if let Some(label) = step.label {
                    command = command.label(label);
                }
                if let Some(dir) = step.workdir {
                    command = command.current_dir(dir);
                }
                for (k, v) in step.env {
                    command = command.env(k, v);
                }
                let mut item = ExecutionItem::new(step.level, command);
                if let Some(path) = step.log {
                    let log = logs
                        .entry(path.clone())
                        .or_insert_with(|| OperationLog::new(path))
                        .clone();
                    item = item.with_log(log);
                }
                item
            })
            .collect();

        let batch = self.scheduler.run(items);
        let registered = match plan.register {
            Some(registration) if batch.is_success() => {
                let entry = self
                    .catalog
                    .update(&registration.key, registration.entry)
                    .with_context(|| format!("failed to register {} in catalog", registration.key))?;
                info!(key = %registration.key, "sandbox registered in catalog");
                Some((registration.key, entry))
            }
            Some(registration) => {
                warn!(
                    key = %registration.key,
                    failed = batch.failures().len(),
                    skipped = batch.skipped.len(),
                    "plan had failures; catalog left unchanged"
                );
                None
            }
            None => None,
        };
        Ok(PlanOutcome { batch, registered })
    }

    /// Runs `script` in every cataloged sandbox at once.
    pub fn global(&self, script: &str, args: &[String]) -> Result<GlobalOutcome> {
        let catalog = self.catalog.read().context("failed to read catalog")?;
        let mut items = Vec::new();
        let mut skipped = Vec::new();
        for (key, entry) in &catalog {
            match resolve_script(entry, script) {
                Some(path) => {
                    let command = RunnableCommand::new(path.to_string_lossy())
                        .args(args.iter().cloned())
                        .label(format!("{} {}", key, script))
                        .current_dir(&entry.destination);
                    items.push(ExecutionItem::new(0, command));
                }
                None => {
                    warn!(key = %key, script, "no such script in sandbox; skipping");
                    skipped.push(key.clone());
                }
            }
        }
        let batch = self.scheduler.run(items);
        Ok(GlobalOutcome { batch, skipped })
    }

    /// Stops the targeted sandboxes concurrently, then removes each one's
    /// directory and catalog entry.
    pub fn delete_sandboxes(&self, targets: &[String], skip_stop: bool) -> Result<DeleteOutcome> {
        let catalog = self.catalog.read().context("failed to read catalog")?;
        let mut selected: Vec<(String, CatalogEntry)> = Vec::new();
        let mut unknown = Vec::new();
        for target in targets {
            if target == ALL_SANDBOXES {
                selected.extend(catalog.iter().map(|(k, v)| (k.clone(), v.clone())));
                continue;
            }
            match find_entry(&catalog, target) {
                Some((key, entry)) => selected.push((key.to_string(), entry.clone())),
                None => unknown.push(target.clone()),
            }
        }
        if !unknown.is_empty() {
            return Err(anyhow!("no sandbox in catalog for: {}", unknown.join(", ")));
        }
        selected.sort_by(|a, b| a.0.cmp(&b.0));
        selected.dedup_by(|a, b| a.0 == b.0);

        let mut stop_index: BTreeMap<usize, String> = BTreeMap::new();
        let mut items = Vec::new();
        if !skip_stop {
            for (key, entry) in &selected {
                if let Some(path) = resolve_script(entry, "stop") {
                    stop_index.insert(items.len(), key.clone());
                    let command = RunnableCommand::new(path.to_string_lossy())
                        .label(format!("{} stop", key))
                        .current_dir(&entry.destination);
                    items.push(ExecutionItem::new(0, command));
                }
            }
        }
        let batch = self.scheduler.run(items);

        let mut kept = Vec::new();
        let mut removed = Vec::new();
        let mut failed = Vec::new();
        for (key, entry) in selected {
            let stop_failed = batch
                .reports
                .iter()
                .any(|r| !r.is_success() && stop_index.get(&r.index) == Some(&key));
            if stop_failed {
                warn!(key = %key, "stop failed; leaving sandbox in place");
                kept.push(key);
                continue;
            }
            match self.remove_sandbox(&key, &entry) {
                Ok(()) => {
                    info!(key = %key, "sandbox deleted");
                    removed.push(key);
                }
                Err(e) => {
                    let message = format!("{:#}", e);
                    warn!(key = %key, err = %message, "failed to delete sandbox");
                    failed.push((key, message));
                }
            }
        }
        Ok(DeleteOutcome {
            batch,
            removed,
            kept,
            failed,
        })
    }

    fn remove_sandbox(&self, key: &str, entry: &CatalogEntry) -> Result<()> {
        let dest = Path::new(&entry.destination);
        if !entry.destination.is_empty() && dest.exists() {
            fs::remove_dir_all(dest)
                .with_context(|| format!("failed to remove {}", dest.display()))?;
        }
        self.catalog
            .delete(key)
            .with_context(|| format!("failed to remove {} from catalog", key))?;
        Ok(())
    }

    pub fn list(&self) -> Result<Vec<(String, CatalogEntry)>> {
        let catalog = self.catalog.read().context("failed to read catalog")?;
        Ok(catalog.into_iter().collect())
    }
}

fn find_entry<'a>(
    catalog: &'a BTreeMap<String, CatalogEntry>,
    target: &str,
) -> Option<(&'a str, &'a CatalogEntry)> {
    if let Some((key, entry)) = catalog.get_key_value(target) {
        return Some((key.as_str(), entry));
    }
    catalog
        .iter()
        .find(|(_, entry)| {
            Path::new(&entry.destination)
                .file_name()
                .and_then(|n| n.to_str())
                == Some(target)
        })
        .map(|(key, entry)| (key.as_str(), entry))
}

/// Multi-node sandboxes prefer `<script>_all` when it exists.
fn resolve_script(entry: &CatalogEntry, script: &str) -> Option<PathBuf> {
    let dest = Path::new(&entry.destination);
    if entry.destination.is_empty() || !dest.is_dir() {
        return None;
    }
    if entry.kind.is_multi_node() {
        let all = dest.join(format!("{}_all", script));
        if all.is_file() {
            return Some(all);
        }
    }
    let single = dest.join(script);
    single.is_file().then_some(single)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::SandboxKind;

    #[test]
    fn yaml_and_json_plans_parse_the_same() {
        let root = tempfile::tempdir().expect("tempdir");
        let yaml = root.path().join("plan.yaml");
        fs::write(
            &yaml,
            "steps:\n  - level: 1\n    program: ./start\n    args: [\"--all\"]\n    workdir: sb\n    log: logs/sb.log\nregister:\n  key: /s/sb\n  entry:\n    type: multiple\n    version: 8.0.32\n    port: [1, 2]\n    destination: /s/sb\n",
        )
        .expect("write yaml");
        let json = root.path().join("plan.json");
        fs::write(
            &json,
            r#"{"steps":[{"level":1,"program":"./start","args":["--all"],"workdir":"sb","log":"logs/sb.log"}],
               "register":{"key":"/s/sb","entry":{"type":"multiple","version":"8.0.32","port":[1,2],"destination":"/s/sb"}}}"#,
        )
        .expect("write json");
        for path in [&yaml, &json] {
            let plan = load_plan(path).expect("plan");
            assert_eq!(plan.steps.len(), 1);
            let step = &plan.steps[0];
            assert_eq!(step.level, 1);
            assert_eq!(step.args, vec!["--all".to_string()]);
            assert_eq!(step.workdir.as_deref(), Some(root.path().join("sb").as_path()));
            assert_eq!(step.log.as_deref(), Some(root.path().join("logs/sb.log").as_path()));
            let reg = plan.register.as_ref().expect("register");
            assert_eq!(reg.entry.kind, SandboxKind::Multiple);
            assert_eq!(reg.entry.port, vec![1, 2]);
        }
    }

    #[test]
    fn plan_rejects_unknown_step_fields() {
        let root = tempfile::tempdir().expect("tempdir");
        let path = root.path().join("plan.json");
        fs::write(&path, r#"{"steps":[{"program":"true","priority":2}]}"#).expect("write");
        let err = load_plan(&path).expect_err("should fail");
        assert!(err.to_string().contains("plan format"), "unexpected: {:#}", err);
    }

    #[test]
    fn script_resolution_prefers_all_variant_for_multi_node() {
        let root = tempfile::tempdir().expect("tempdir");
        let dest = root.path().join("multi_msb");
        fs::create_dir_all(&dest).expect("mkdir");
        fs::write(dest.join("start"), "#!/bin/sh\n").expect("write");
        fs::write(dest.join("start_all"), "#!/bin/sh\n").expect("write");
        let dest_str = dest.to_string_lossy().to_string();

        let multi = CatalogEntry::new(SandboxKind::Multiple, "8.0", dest_str.clone());
        assert_eq!(resolve_script(&multi, "start"), Some(dest.join("start_all")));
        let single = CatalogEntry::new(SandboxKind::Single, "8.0", dest_str);
        assert_eq!(resolve_script(&single, "start"), Some(dest.join("start")));
        assert_eq!(resolve_script(&single, "restart"), None);
        let gone = CatalogEntry::new(SandboxKind::Single, "8.0", "/nonexistent/sbx/msb");
        assert_eq!(resolve_script(&gone, "start"), None);
    }

    #[test]
    fn targets_match_key_or_directory_name() {
        let mut catalog = BTreeMap::new();
        catalog.insert(
            "/s/msb_8_0_32".to_string(),
            CatalogEntry::new(SandboxKind::Single, "8.0.32", "/s/msb_8_0_32"),
        );
        assert_eq!(find_entry(&catalog, "/s/msb_8_0_32").map(|(k, _)| k), Some("/s/msb_8_0_32"));
        assert_eq!(find_entry(&catalog, "msb_8_0_32").map(|(k, _)| k), Some("/s/msb_8_0_32"));
        assert!(find_entry(&catalog, "msb_5_7").is_none());
    }
}
