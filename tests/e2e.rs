//! End-to-end tests that invoke the compiled `schemalog` binary as a subprocess.
//!
//! These tests exercise CLI argument parsing, config loading, report output
//! and exit codes against a SQLite file in a temporary directory.

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

/// Locate the compiled binary built by `cargo test`.
fn binary_path() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_schemalog"))
}

fn toml_path(path: &Path) -> String {
    path.display().to_string().replace('\\', "/")
}

/// A temp project: config, changelog directory and database file.
struct Project {
    dir: tempfile::TempDir,
}

impl Project {
    fn new(changelog: &str) -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let changes = dir.path().join("db");
        std::fs::create_dir_all(&changes).expect("mkdir");
        std::fs::write(changes.join("main.xml"), changelog).expect("write changelog");

        let config = format!(
            r#"[database]
path = "{}"

[changelog]
file = "main.xml"
search_path = "{}"

[lock]
wait_timeout_secs = 1
poll_interval_ms = 50

[parameters]
table = "widget"
"#,
            toml_path(&dir.path().join("app.db")),
            toml_path(&changes)
        );
        std::fs::write(dir.path().join("schemalog.toml"), config).expect("write config");
        Self { dir }
    }

    fn write_changelog(&self, changelog: &str) {
        std::fs::write(self.dir.path().join("db/main.xml"), changelog).expect("write changelog");
    }

    fn run(&self, args: &[&str]) -> Output {
        let config = self.dir.path().join("schemalog.toml");
        Command::new(binary_path())
            .arg("--config")
            .arg(&config)
            .args(args)
            .env_remove("RUST_LOG")
            .output()
            .expect("failed to execute schemalog binary")
    }
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).to_string()
}

const CHANGELOG: &str = r#"<databaseChangeLog>
    <changeSet id="1" author="alice">
        <createTable tableName="${table}">
            <column name="id" type="INTEGER"/>
        </createTable>
    </changeSet>
    <changeSet id="2" author="alice">
        <tagDatabase tag="v1"/>
    </changeSet>
    <changeSet id="3" author="alice" context="test">
        <sql>INSERT INTO widget VALUES (42)</sql>
        <rollback>DELETE FROM widget WHERE id = 42</rollback>
    </changeSet>
</databaseChangeLog>"#;

#[test]
fn test_update_then_status_exit_zero() {
    let project = Project::new(CHANGELOG);

    let output = project.run(&["update"]);
    assert_eq!(
        output.status.code(),
        Some(0),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    let text = stdout(&output);
    assert!(text.contains("applied      main.xml::1::alice"), "{}", text);
    assert!(text.contains("3 applied"), "{}", text);

    let output = project.run(&["status"]);
    assert_eq!(output.status.code(), Some(0));
    assert!(stdout(&output).contains("0 changeset(s) would run"));
}

#[test]
fn test_contexts_flag_filters_changesets() {
    let project = Project::new(CHANGELOG);

    let output = project.run(&["--contexts", "prod", "update"]);
    assert_eq!(output.status.code(), Some(0));
    let text = stdout(&output);
    assert!(text.contains("skipped      main.xml::3::alice"), "{}", text);
    assert!(text.contains("2 applied"), "{}", text);
}

#[test]
fn test_define_overrides_config_parameter() {
    let project = Project::new(
        r#"<databaseChangeLog>
            <changeSet id="1" author="alice"><sql>CREATE TABLE ${table} (id INTEGER)</sql></changeSet>
        </databaseChangeLog>"#,
    );

    let output = project.run(&["-D", "table=gadget", "--format", "json", "update"]);
    assert_eq!(output.status.code(), Some(0));
    let report: serde_json::Value = serde_json::from_slice(&output.stdout).expect("json");
    assert_eq!(report["succeeded"], true);
    assert_eq!(report["summary"]["applied"], 1);

    let db = rusqlite::Connection::open(project.dir.path().join("app.db")).expect("open");
    let count: i64 = db
        .query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = 'gadget'",
            [],
            |r| r.get(0),
        )
        .expect("query");
    assert_eq!(count, 1);
}

#[test]
fn test_drift_exits_one() {
    let project = Project::new(CHANGELOG);
    assert_eq!(project.run(&["update"]).status.code(), Some(0));

    project.write_changelog(&CHANGELOG.replace("VALUES (42)", "VALUES (43)"));
    let output = project.run(&["update"]);
    assert_eq!(output.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&output.stderr).contains("checksum"));

    assert_eq!(project.run(&["validate"]).status.code(), Some(1));
}

#[test]
fn test_malformed_changelog_exits_two() {
    let project = Project::new("<databaseChangeLog><changeSet id=\"1\"");
    let output = project.run(&["update"]);
    assert_eq!(output.status.code(), Some(2));
}

#[test]
fn test_missing_config_exits_two() {
    let output = Command::new(binary_path())
        .args(["--config", "/nonexistent/schemalog.toml", "status"])
        .output()
        .expect("run");
    assert_eq!(output.status.code(), Some(2));
    assert!(String::from_utf8_lossy(&output.stderr).contains("Config file not found"));
}

#[test]
fn test_failed_changeset_exits_one() {
    let project = Project::new(
        r#"<databaseChangeLog>
            <changeSet id="1" author="alice" failOnError="false"><sql>INSERT INTO nowhere VALUES (1)</sql></changeSet>
        </databaseChangeLog>"#,
    );
    let output = project.run(&["update"]);
    assert_eq!(output.status.code(), Some(1));
    assert!(stdout(&output).contains("1 failed"));
}

#[test]
fn test_tag_and_rollback_commands() {
    let project = Project::new(CHANGELOG);
    assert_eq!(project.run(&["update"]).status.code(), Some(0));

    let output = project.run(&["tag-exists", "v1"]);
    assert_eq!(stdout(&output).trim(), "true");

    let output = project.run(&["rollback", "v1"]);
    assert_eq!(output.status.code(), Some(0));
    let text = stdout(&output);
    assert!(text.contains("rolled back  main.xml::3::alice"), "{}", text);
    assert!(text.contains("1 rolled back"), "{}", text);

    let output = project.run(&["rollback", "v7"]);
    assert_eq!(output.status.code(), Some(1));

    let output = project.run(&["rollback-count", "2"]);
    assert_eq!(output.status.code(), Some(0));
    assert!(stdout(&output).contains("2 rolled back"));
}

#[test]
fn test_lock_commands() {
    let project = Project::new(CHANGELOG);

    let output = project.run(&["list-locks"]);
    assert_eq!(output.status.code(), Some(0));
    assert!(stdout(&output).contains("no lock table"));

    assert_eq!(project.run(&["release-locks"]).status.code(), Some(0));
    let output = project.run(&["--format", "json", "list-locks"]);
    let locks: serde_json::Value = serde_json::from_slice(&output.stdout).expect("json");
    assert_eq!(locks[0]["locked"], false);
}

#[test]
fn test_changelog_sync_and_clear_checksums() {
    let project = Project::new(CHANGELOG);

    let output = project.run(&["changelog-sync"]);
    assert_eq!(output.status.code(), Some(0));
    assert!(stdout(&output).contains("3 marked ran"));

    let output = project.run(&["clear-checksums"]);
    assert_eq!(stdout(&output).trim(), "cleared 3 checksum(s)");

    let output = project.run(&["update"]);
    assert_eq!(output.status.code(), Some(0));
    assert!(stdout(&output).contains("3 already ran"));
}
