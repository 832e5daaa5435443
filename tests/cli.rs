use assert_cmd::Command;
use predicates::prelude::*;
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::tempdir;

fn bin() -> Command {
    let path = assert_cmd::cargo::cargo_bin!("kvlaunch");
    let mut cmd = Command::new(path);
    cmd.env_remove("KVLAUNCH_CONFIG")
        .env_remove("KVLAUNCH_TMUX")
        .env("KVCACHED_LOG_COLOR", "false");
    cmd
}

fn parse_json(bytes: &[u8]) -> Value {
    serde_json::from_slice(bytes).expect("json output")
}

const TWO_INSTANCES: &str = r#"
version: 1
tmux:
  session: serve-test
instances:
  - name: engine-a
    command: [vllm, serve, "my model"]
    engine_env: [A=1, SHARED=engine]
    kvcached_env: [SHARED=kvcached, B=it's]
  - name: engine-b
    command: [python, -m, server]
"#;

fn write_config(dir: &Path, content: &str) -> PathBuf {
    let path = dir.join("config.yaml");
    fs::write(&path, content).unwrap();
    path
}

#[test]
fn config_init_creates_and_preserves_existing() {
    let dir = tempdir().unwrap();
    let config_dir = dir.path().join("config");

    let output = bin()
        .env("KVLAUNCH_CONFIG_DIR", &config_dir)
        .arg("--json")
        .arg("config")
        .arg("init")
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();

    let value = parse_json(&output);
    assert!(value["ok"].as_bool().unwrap());
    assert!(value["result"]["created"].as_bool().unwrap());

    let config_path = config_dir.join("config.yaml");
    assert!(config_path.exists());

    fs::write(&config_path, "sentinel: true\n").unwrap();

    let output = bin()
        .env("KVLAUNCH_CONFIG_DIR", &config_dir)
        .arg("--json")
        .arg("config")
        .arg("init")
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();

    let value = parse_json(&output);
    assert!(!value["result"]["created"].as_bool().unwrap());
    assert_eq!(fs::read_to_string(&config_path).unwrap(), "sentinel: true\n");
}

#[test]
fn config_validate_rejects_unknown_fields() {
    let dir = tempdir().unwrap();
    let config_path = write_config(dir.path(), "version: 1\nunknown_field: true\n");

    let output = bin()
        .arg("--json")
        .arg("--config")
        .arg(&config_path)
        .arg("config")
        .arg("validate")
        .assert()
        .failure()
        .get_output()
        .stdout
        .clone();

    let value = parse_json(&output);
    assert!(!value["ok"].as_bool().unwrap());
    assert!(value["error"].as_str().unwrap().contains("unknown_field"));
}

#[test]
fn env_prints_merged_mapping() {
    let dir = tempdir().unwrap();
    let config_path = write_config(dir.path(), TWO_INSTANCES);

    let output = bin()
        .arg("--json")
        .arg("--config")
        .arg(&config_path)
        .arg("env")
        .arg("engine-a")
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();

    let value = parse_json(&output);
    let env = &value["result"]["env"];
    assert_eq!(env["A"], "1");
    assert_eq!(env["SHARED"], "kvcached");
    assert_eq!(env["B"], "it's");
}

#[test]
fn env_rejects_entry_without_equals() {
    let dir = tempdir().unwrap();
    let config_path = write_config(
        dir.path(),
        "version: 1\ninstances:\n  - name: a\n    command: [x]\n    engine_env: [GOOD=1, BAD]\n",
    );

    bin()
        .arg("--config")
        .arg(&config_path)
        .arg("env")
        .arg("a")
        .assert()
        .failure()
        .stderr(predicate::str::contains("BAD"));
}

#[test]
fn dry_run_composes_commands_without_tmux() {
    let dir = tempdir().unwrap();
    let config_path = write_config(dir.path(), TWO_INSTANCES);

    let output = bin()
        .env("PATH", "")
        .arg("--json")
        .arg("--config")
        .arg(&config_path)
        .arg("launch")
        .arg("--dry-run")
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();

    let value = parse_json(&output);
    let result = &value["result"];
    assert_eq!(result["session"], "serve-test");
    let windows = result["windows"].as_array().unwrap();
    assert_eq!(windows.len(), 2);
    assert_eq!(windows[0]["window"], "engine-a");
    assert_eq!(
        windows[0]["command"],
        "ulimit -n 1048576; export A=1; export SHARED=kvcached; export B='it'\\''s'; vllm serve 'my model'"
    );
    assert_eq!(windows[1]["command"], "ulimit -n 1048576; python -m server");
}

#[test]
fn settings_reflect_environment() {
    let output = bin()
        .env("KVCACHED_IPC_NAME", "deploy_x")
        .env("KVCACHED_MIN_RESERVED_PAGES", "3")
        .arg("--json")
        .arg("settings")
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();

    let value = parse_json(&output);
    let result = &value["result"];
    assert_eq!(result["ipc_path"], "/dev/shm/deploy_x");
    assert_eq!(result["min_reserved_pages"], 3);
    assert_eq!(result["max_reserved_pages"], 10);
    assert_eq!(result["page_size"], 2 * 1024 * 1024);
}

#[test]
fn align_rounds_to_whole_pages() {
    let output = bin()
        .arg("--json")
        .arg("align")
        .arg("513")
        .arg("--cell-size")
        .arg("4096")
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();

    let value = parse_json(&output);
    assert_eq!(value["result"]["aligned_cells"], 1024);
    assert_eq!(value["result"]["pages"], 2);
}

#[test]
fn align_reports_overflow_instead_of_wrapping() {
    let output = bin()
        .arg("--json")
        .arg("align")
        .arg("18446744073709551615")
        .arg("--cell-size")
        .arg("4096")
        .assert()
        .failure()
        .get_output()
        .stdout
        .clone();

    let value = parse_json(&output);
    assert!(!value["ok"].as_bool().unwrap());
    assert!(value["error"].as_str().unwrap().contains("too large"));
}

#[cfg(unix)]
mod fake_tmux {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    /// Writes a stand-in tmux that logs each invocation and reports the
    /// session as present when `FAKE_TMUX_HAS_SESSION=0`.
    pub fn install(dir: &Path) -> (PathBuf, PathBuf) {
        let script = dir.join("tmux");
        let log = dir.join("tmux.log");
        fs::write(
            &script,
            "#!/bin/sh\nprintf '%s\\n' \"$*\" >> \"$FAKE_TMUX_LOG\"\n\
             if [ \"$1\" = \"has-session\" ]; then exit \"${FAKE_TMUX_HAS_SESSION:-1}\"; fi\n\
             exit 0\n",
        )
        .unwrap();
        fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();
        (script, log)
    }

    pub fn calls(log: &Path) -> Vec<String> {
        fs::read_to_string(log)
            .unwrap_or_default()
            .lines()
            .map(str::to_string)
            .collect()
    }

    #[test]
    fn launch_issues_expected_tmux_sequence() {
        let dir = tempdir().unwrap();
        let config_path = write_config(dir.path(), TWO_INSTANCES);
        let (script, log) = install(dir.path());

        let output = bin()
            .env("KVLAUNCH_TMUX", &script)
            .env("FAKE_TMUX_LOG", &log)
            .arg("--json")
            .arg("--config")
            .arg(&config_path)
            .arg("launch")
            .assert()
            .success()
            .get_output()
            .stdout
            .clone();

        let value = parse_json(&output);
        assert!(value["result"]["launched"].as_bool().unwrap());
        assert_eq!(value["result"]["windows"][1], "engine-b");

        let calls = calls(&log);
        assert_eq!(calls.len(), 7);
        assert_eq!(calls[0], "has-session -t =serve-test");
        assert_eq!(calls[1], "new-session -d -s serve-test -x 120 -y 30");
        assert_eq!(calls[2], "set-option -t =serve-test: history-limit 999999");
        assert_eq!(calls[3], "set-option -t =serve-test: mouse on");
        assert!(calls[4].starts_with("new-window -t =serve-test: -n engine-a bash -c echo 'Starting engine-a...'; ulimit -n 1048576;"));
        assert!(calls[4].ends_with("echo 'Press Enter to close...'; read"));
        assert_eq!(calls[5], "kill-window -t =serve-test:0");
        assert!(calls[6].starts_with("new-window -t =serve-test: -n engine-b"));
        let kills = calls.iter().filter(|c| c.starts_with("kill-window")).count();
        assert_eq!(kills, 1);
    }

    #[test]
    fn existing_session_declined_is_left_alone() {
        let dir = tempdir().unwrap();
        let config_path = write_config(dir.path(), TWO_INSTANCES);
        let (script, log) = install(dir.path());

        let output = bin()
            .env("KVLAUNCH_TMUX", &script)
            .env("FAKE_TMUX_LOG", &log)
            .env("FAKE_TMUX_HAS_SESSION", "0")
            .arg("--json")
            .arg("--config")
            .arg(&config_path)
            .arg("launch")
            .write_stdin("n\n")
            .assert()
            .success()
            .get_output()
            .stdout
            .clone();

        let value = parse_json(&output);
        assert!(!value["result"]["launched"].as_bool().unwrap());
        assert_eq!(calls(&log), vec!["has-session -t =serve-test".to_string()]);
    }

    #[test]
    fn existing_session_restarted_on_y() {
        let dir = tempdir().unwrap();
        let config_path = write_config(dir.path(), TWO_INSTANCES);
        let (script, log) = install(dir.path());

        bin()
            .env("KVLAUNCH_TMUX", &script)
            .env("FAKE_TMUX_LOG", &log)
            .env("FAKE_TMUX_HAS_SESSION", "0")
            .arg("--config")
            .arg(&config_path)
            .arg("launch")
            .arg("--session")
            .arg("other")
            .write_stdin("Y\n")
            .assert()
            .success();

        let calls = calls(&log);
        assert_eq!(calls[0], "has-session -t =other");
        assert_eq!(calls[1], "kill-session -t =other");
        assert_eq!(calls[2], "new-session -d -s other -x 120 -y 30");
    }

    #[test]
    fn malformed_env_fails_before_any_tmux_call() {
        let dir = tempdir().unwrap();
        let config_path = write_config(
            dir.path(),
            "version: 1\ninstances:\n  - name: a\n    command: [x]\n  - name: b\n    command: [y]\n    kvcached_env: [NOPE]\n",
        );
        let (script, log) = install(dir.path());

        bin()
            .env("KVLAUNCH_TMUX", &script)
            .env("FAKE_TMUX_LOG", &log)
            .arg("--config")
            .arg(&config_path)
            .arg("launch")
            .assert()
            .failure()
            .stderr(predicate::str::contains("instance b"));

        assert!(calls(&log).is_empty());
    }
}
