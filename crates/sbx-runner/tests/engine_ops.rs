#![cfg(unix)]

use sbx_runner::{
    load_plan, CatalogEntry, CommandOutcome, Engine, EngineConfig, FailurePolicy, SandboxKind,
    ALL_SANDBOXES,
};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

// Scripts written by this process are exec'd right away; keep tests that do
// so from forking concurrently (ETXTBSY).
static SERIAL: Mutex<()> = Mutex::new(());

fn engine_in(home: &Path) -> Engine {
    let mut config = EngineConfig::with_home(home);
    config.command_line = "sbx test".to_string();
    config.lock_timeout = Duration::from_secs(5);
    Engine::new(config)
}

fn write_script(dir: &Path, name: &str, body: &str) {
    let path = dir.join(name);
    fs::write(&path, format!("#!/bin/sh\n{}\n", body)).expect("write script");
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).expect("chmod");
}

fn make_sandbox(engine: &Engine, root: &Path, name: &str, kind: SandboxKind) -> (String, PathBuf) {
    let dest = root.join(name);
    fs::create_dir_all(&dest).expect("mkdir sandbox");
    let key = dest.to_string_lossy().to_string();
    engine
        .catalog()
        .update(&key, CatalogEntry::new(kind, "8.0.32", key.clone()))
        .expect("register");
    (key, dest)
}

#[test]
fn plan_registers_sandbox_after_all_levels_succeed() {
    let _serial = SERIAL.lock().unwrap_or_else(|e| e.into_inner());
    let home = tempfile::tempdir().expect("home");
    let work = tempfile::tempdir().expect("work");
    let dest = work.path().join("msb_8_0_32");
    let plan_path = work.path().join("deploy.yaml");
    fs::write(
        &plan_path,
        format!(
            r#"steps:
  - level: 0
    program: sh
    args: ["-c", "mkdir -p {dest} && printf '#!/bin/sh\necho started\n' > {dest}/start && chmod +x {dest}/start"]
    label: provision
    log: logs/deploy.log
  - level: 1
    program: {dest}/start
    workdir: {dest}
    label: start
    log: logs/deploy.log
register:
  key: {dest}
  entry:
    origin: /opt/binaries/8.0.32
    type: single
    version: 8.0.32
    port: [8032]
    nodes: []
    destination: {dest}
"#,
            dest = dest.display()
        ),
    )
    .expect("write plan");

    let engine = engine_in(home.path());
    let plan = load_plan(&plan_path).expect("plan");
    let outcome = engine.run_plan(plan).expect("run plan");
    assert!(outcome.batch.is_success(), "failures: {:?}", outcome.batch.failures());
    assert_eq!(outcome.batch.levels_run, vec![0, 1]);
    let start = outcome.batch.find(1).expect("start report");
    assert!(start.output.contains("started"));

    let (key, written) = outcome.registered.expect("registered");
    assert_eq!(key, dest.to_string_lossy());
    assert_eq!(written.command_line, "sbx test");
    let listed = engine.list().expect("list");
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].1, written);

    let log = fs::read_to_string(work.path().join("logs").join("deploy.log")).expect("log");
    assert!(log.contains("provision -> ok"), "log: {}", log);
    assert!(log.contains("start -> ok"), "log: {}", log);
}

#[test]
fn failed_plan_leaves_catalog_untouched() {
    let _serial = SERIAL.lock().unwrap_or_else(|e| e.into_inner());
    let home = tempfile::tempdir().expect("home");
    let work = tempfile::tempdir().expect("work");
    let plan_path = work.path().join("deploy.json");
    fs::write(
        &plan_path,
        r#"{
  "steps": [
    {"level": 0, "program": "sh", "args": ["-c", "exit 2"], "label": "A"},
    {"level": 0, "program": "true", "label": "B"},
    {"level": 0, "program": "true", "label": "C"},
    {"level": 1, "program": "true", "label": "D"},
    {"level": 2, "program": "true", "label": "E"},
    {"level": 2, "program": "true", "label": "F"}
  ],
  "register": {"key": "/s/broken", "entry": {"type": "multiple", "destination": "/s/broken"}}
}"#,
    )
    .expect("write plan");

    let engine = engine_in(home.path());
    let outcome = engine
        .run_plan(load_plan(&plan_path).expect("plan"))
        .expect("run plan");
    assert_eq!(outcome.batch.reports.len(), 6);
    let failures = outcome.batch.failures();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].identity, "A");
    assert_eq!(failures[0].outcome, CommandOutcome::Failed { code: Some(2) });
    assert!(outcome.registered.is_none());
    assert!(engine.list().expect("list").is_empty());
}

#[test]
fn stop_policy_skips_later_levels() {
    let _serial = SERIAL.lock().unwrap_or_else(|e| e.into_inner());
    let home = tempfile::tempdir().expect("home");
    let work = tempfile::tempdir().expect("work");
    let plan_path = work.path().join("deploy.json");
    fs::write(
        &plan_path,
        r#"{"steps": [
    {"level": 0, "program": "false", "label": "init"},
    {"level": 1, "program": "true", "label": "replicate"}
  ]}"#,
    )
    .expect("write plan");
    let engine = engine_in(home.path()).with_policy(FailurePolicy::StopAfterFailedLevel);
    let outcome = engine
        .run_plan(load_plan(&plan_path).expect("plan"))
        .expect("run plan");
    assert_eq!(outcome.batch.levels_run, vec![0]);
    assert_eq!(outcome.batch.skipped, vec![1]);
}

#[test]
fn global_runs_script_in_every_sandbox() {
    let _serial = SERIAL.lock().unwrap_or_else(|e| e.into_inner());
    let home = tempfile::tempdir().expect("home");
    let work = tempfile::tempdir().expect("work");
    let engine = engine_in(home.path());
    let (single_key, single) = make_sandbox(&engine, work.path(), "msb_8_0_32", SandboxKind::Single);
    let (multi_key, multi) = make_sandbox(&engine, work.path(), "multi_msb_8_0_32", SandboxKind::Multiple);
    let (bare_key, _) = make_sandbox(&engine, work.path(), "msb_bare", SandboxKind::Single);
    write_script(&single, "status", "echo single $1 > status.out");
    write_script(&multi, "status", "echo wrong > status.out");
    write_script(&multi, "status_all", "echo multi $1 > status.out");

    let outcome = engine
        .global("status", &["--quiet".to_string()])
        .expect("global");
    assert_eq!(outcome.batch.reports.len(), 2);
    assert!(outcome.batch.is_success(), "failures: {:?}", outcome.batch.failures());
    assert_eq!(outcome.skipped, vec![bare_key]);
    assert_eq!(
        fs::read_to_string(single.join("status.out")).expect("single out").trim(),
        "single --quiet"
    );
    assert_eq!(
        fs::read_to_string(multi.join("status.out")).expect("multi out").trim(),
        "multi --quiet"
    );
    let identities: Vec<_> = outcome.batch.reports.iter().map(|r| r.identity.clone()).collect();
    assert!(identities.contains(&format!("{} status", single_key)));
    assert!(identities.contains(&format!("{} status", multi_key)));
}

#[test]
fn delete_stops_removes_and_forgets_sandboxes() {
    let _serial = SERIAL.lock().unwrap_or_else(|e| e.into_inner());
    let home = tempfile::tempdir().expect("home");
    let work = tempfile::tempdir().expect("work");
    let engine = engine_in(home.path());
    let marker = work.path().join("stopped.txt");
    let (a_key, a) = make_sandbox(&engine, work.path(), "msb_a", SandboxKind::Single);
    let (b_key, b) = make_sandbox(&engine, work.path(), "msb_b", SandboxKind::Single);
    let (c_key, c) = make_sandbox(&engine, work.path(), "msb_c", SandboxKind::Single);
    write_script(&a, "stop", &format!("echo a >> {}", marker.display()));
    write_script(&b, "stop", "exit 1");
    write_script(&c, "stop", &format!("echo c >> {}", marker.display()));

    let outcome = engine
        .delete_sandboxes(&["msb_a".to_string(), b_key.clone(), c_key.clone()], false)
        .expect("delete");
    assert_eq!(outcome.batch.reports.len(), 3);
    assert_eq!(outcome.removed, vec![a_key.clone(), c_key.clone()]);
    assert_eq!(outcome.kept, vec![b_key.clone()]);
    assert!(outcome.failed.is_empty());
    assert!(!outcome.is_success());
    assert!(!a.exists());
    assert!(b.exists());
    assert!(!c.exists());
    let stopped = fs::read_to_string(&marker).expect("marker");
    assert!(stopped.contains('a') && stopped.contains('c'));

    let remaining: Vec<String> = engine.list().expect("list").into_iter().map(|(k, _)| k).collect();
    assert_eq!(remaining, vec![b_key.clone()]);

    let outcome = engine
        .delete_sandboxes(&[ALL_SANDBOXES.to_string()], true)
        .expect("delete all");
    assert!(outcome.batch.reports.is_empty());
    assert_eq!(outcome.removed, vec![b_key]);
    assert!(!b.exists());
    assert!(engine.list().expect("list").is_empty());
}

#[test]
fn delete_rejects_unknown_targets_before_touching_anything() {
    let _serial = SERIAL.lock().unwrap_or_else(|e| e.into_inner());
    let home = tempfile::tempdir().expect("home");
    let work = tempfile::tempdir().expect("work");
    let engine = engine_in(home.path());
    let (_, a) = make_sandbox(&engine, work.path(), "msb_a", SandboxKind::Single);
    let err = engine
        .delete_sandboxes(&["msb_a".to_string(), "msb_missing".to_string()], true)
        .expect_err("unknown target");
    assert!(err.to_string().contains("msb_missing"));
    assert!(a.exists());
    assert_eq!(engine.list().expect("list").len(), 1);
}

#[test]
fn skipped_catalog_makes_engine_catalog_inert() {
    let _serial = SERIAL.lock().unwrap_or_else(|e| e.into_inner());
    let home = tempfile::tempdir().expect("home");
    let mut config = EngineConfig::with_home(home.path());
    config.catalog_enabled = false;
    let engine = Engine::new(config);
    engine
        .catalog()
        .update("/s/x", CatalogEntry::new(SandboxKind::Single, "8.0", "/s/x"))
        .expect("no-op update");
    assert!(engine.list().expect("list").is_empty());
    assert!(!home.path().join("sandboxes.json").exists());
}

#[test]
fn delete_keeps_going_when_one_sandbox_cannot_be_removed() {
    let _serial = SERIAL.lock().unwrap_or_else(|e| e.into_inner());
    let home = tempfile::tempdir().expect("home");
    let work = tempfile::tempdir().expect("work");
    let engine = engine_in(home.path());

    // A destination that is a plain file cannot be removed as a directory.
    let broken = work.path().join("msb_broken");
    fs::write(&broken, b"not a sandbox").expect("write file");
    let broken_key = broken.to_string_lossy().to_string();
    engine
        .catalog()
        .update(&broken_key, CatalogEntry::new(SandboxKind::Single, "8.0.32", broken_key.clone()))
        .expect("register broken");
    let (ok_key, ok_dest) = make_sandbox(&engine, work.path(), "msb_ok", SandboxKind::Single);

    let outcome = engine
        .delete_sandboxes(&[ALL_SANDBOXES.to_string()], true)
        .expect("delete reports per-sandbox failures");
    assert_eq!(outcome.removed, vec![ok_key]);
    assert!(!ok_dest.exists());
    assert_eq!(outcome.failed.len(), 1);
    assert_eq!(outcome.failed[0].0, broken_key);
    assert!(outcome.failed[0].1.contains("msb_broken"), "error: {}", outcome.failed[0].1);
    assert!(!outcome.is_success());

    let remaining: Vec<String> = engine.list().expect("list").into_iter().map(|(k, _)| k).collect();
    assert_eq!(remaining, vec![broken_key]);
}
