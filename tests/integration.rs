use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

const CHAT: &str = concat!(
    "{\"role\":\"user\",\"content\":\"why does the build fail?\",\"session_id\":\"s-1\"}\n",
    "{\"role\":\"assistant\",\"content\":\"missing feature flag\",\"session_id\":\"s-1\"}\n",
    "{\"role\":\"user\",\"content\":\"thanks\",\"session_id\":\"s-1\"}\n",
);

fn convo_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("convo");
    path
}

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();
    fs::create_dir_all(root.join("logs")).unwrap();
    fs::write(root.join("logs/chat.jsonl"), CHAT).unwrap();
    fs::write(root.join("logs/notes.txt"), "just some notes\n").unwrap();

    let config_content = format!(
        r#"[db]
path = "{}/data/convo.sqlite"

[server]
bind = "127.0.0.1:7399"

[logging]
level = "warn"
"#,
        root.display()
    );
    let config_path = config_dir.join("convo.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_convo(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = convo_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("Failed to run convo binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (stdout, stderr, output.status.success())
}

fn logs(config_path: &Path) -> PathBuf {
    config_path.parent().unwrap().parent().unwrap().join("logs")
}

#[test]
fn test_init_creates_database() {
    let (tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) = run_convo(&config_path, &["init"]);
    assert!(success, "init failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("Migrations complete."));
    assert!(tmp.path().join("data/convo.sqlite").exists());
}

#[test]
fn test_init_idempotent() {
    let (_tmp, config_path) = setup_test_env();

    let (_, _, first) = run_convo(&config_path, &["init"]);
    assert!(first, "First init failed");
    let (_, _, second) = run_convo(&config_path, &["init"]);
    assert!(second, "Second init failed (not idempotent)");
}

#[test]
fn test_ingest_then_duplicate() {
    let (_tmp, config_path) = setup_test_env();
    let file = logs(&config_path).join("chat.jsonl");
    let file = file.to_str().unwrap();

    let (stdout, stderr, success) = run_convo(&config_path, &["ingest", file]);
    assert!(success, "ingest failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("status: success"), "{}", stdout);
    assert!(stdout.contains("messages added: 3"), "{}", stdout);

    let (stdout, _, success) = run_convo(&config_path, &["ingest", file]);
    assert!(success);
    assert!(stdout.contains("status: duplicate"), "{}", stdout);
    assert!(stdout.contains("messages added: 0"), "{}", stdout);
}

#[test]
fn test_ingest_unknown_format_is_skipped() {
    let (_tmp, config_path) = setup_test_env();
    let file = logs(&config_path).join("notes.txt");

    let (stdout, stderr, success) = run_convo(&config_path, &["ingest", file.to_str().unwrap()]);
    assert!(success, "ingest failed: stderr={}", stderr);
    assert!(stdout.contains("status: skipped"), "{}", stdout);
    assert!(stdout.contains("format unrecognized"), "{}", stdout);
}

#[test]
fn test_ingest_missing_file_fails() {
    let (_tmp, config_path) = setup_test_env();
    let (_, stderr, success) = run_convo(&config_path, &["ingest", "/nonexistent/chat.jsonl"]);
    assert!(!success);
    assert!(stderr.contains("cannot resolve"), "{}", stderr);
}

#[test]
fn test_ingest_update_modes() {
    let (_tmp, config_path) = setup_test_env();
    let file = logs(&config_path).join("chat.jsonl");
    let path = file.to_str().unwrap();
    run_convo(&config_path, &["ingest", path]);

    let mut grown = CHAT.to_string();
    grown.push_str("{\"role\":\"assistant\",\"content\":\"anytime\",\"session_id\":\"s-1\"}\n");
    fs::write(&file, grown).unwrap();

    // Default mode leaves the stored conversation alone.
    let (stdout, _, _) = run_convo(&config_path, &["ingest", path]);
    assert!(stdout.contains("status: skipped"), "{}", stdout);

    let (stdout, _, success) = run_convo(&config_path, &["ingest", path, "--mode", "append"]);
    assert!(success);
    assert!(stdout.contains("status: success"), "{}", stdout);
    assert!(stdout.contains("messages added: 1"), "{}", stdout);
}

#[test]
fn test_jobs_lists_history() {
    let (_tmp, config_path) = setup_test_env();
    let file = logs(&config_path).join("chat.jsonl");
    run_convo(&config_path, &["ingest", file.to_str().unwrap()]);
    run_convo(&config_path, &["ingest", file.to_str().unwrap()]);

    let (stdout, stderr, success) = run_convo(&config_path, &["jobs"]);
    assert!(success, "jobs failed: {}", stderr);
    assert!(stdout.contains("success"));
    assert!(stdout.contains("duplicate"));

    let (stdout, _, _) = run_convo(&config_path, &["jobs", "--status", "duplicate"]);
    assert!(!stdout.contains(" success "), "{}", stdout);
}

#[test]
fn test_watch_lifecycle() {
    let (_tmp, config_path) = setup_test_env();
    let dir = logs(&config_path);

    let (stdout, stderr, success) =
        run_convo(&config_path, &["watch", "add", dir.to_str().unwrap(), "--auto-tag"]);
    assert!(success, "watch add failed: {}", stderr);
    let id = stdout
        .split_whitespace()
        .nth(2)
        .expect("watch id in output")
        .to_string();

    let (stdout, _, _) = run_convo(&config_path, &["watch", "list"]);
    assert!(stdout.contains(&id));
    assert!(stdout.contains("inactive"));
    assert!(stdout.contains("[auto-tag]"));

    let (_, _, success) = run_convo(&config_path, &["watch", "start", &id]);
    assert!(success);
    let (_, stderr, success) = run_convo(&config_path, &["watch", "remove", &id]);
    assert!(!success, "remove must be refused while active");
    assert!(stderr.contains("stop it before removing"), "{}", stderr);

    run_convo(&config_path, &["watch", "stop", &id]);
    let (stdout, _, success) = run_convo(&config_path, &["watch", "remove", &id]);
    assert!(success);
    assert!(stdout.contains("Removed watch"));
}

#[test]
fn test_collector_register_prints_key_once() {
    let (_tmp, config_path) = setup_test_env();
    let (stdout, stderr, success) = run_convo(
        &config_path,
        &[
            "collector",
            "register",
            "--workspace",
            "W",
            "--type",
            "claude-code",
            "--version",
            "1.0.0",
            "--hostname",
            "devbox",
        ],
    );
    assert!(success, "register failed: {}", stderr);
    assert!(stdout.contains("api key:   cik_"), "{}", stdout);
    assert!(stdout.contains("workspace: W"));
}
