//! Integration tests for the studio CLI.

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use std::fs;
use tempfile::TempDir;

/// Helper to create a studio Command with a quiet, deterministic environment
fn studio(dir: &TempDir) -> Command {
    let mut cmd = cargo_bin_cmd!("studio");
    cmd.current_dir(dir.path())
        .env("STUDIO_LOG", "off")
        .env_remove("CLAUDE_CMD")
        .env_remove("STUDIO_WORKSPACES")
        .env_remove("STUDIO_PROJECT_DIR");
    cmd
}

fn create_temp_project() -> TempDir {
    TempDir::new().unwrap()
}

// =============================================================================
// Basic CLI Tests
// =============================================================================

mod cli_basics {
    use super::*;

    #[test]
    fn test_studio_help() {
        let dir = create_temp_project();
        studio(&dir)
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("approve"))
            .stdout(predicate::str::contains("repair"));
    }

    #[test]
    fn test_studio_version() {
        let dir = create_temp_project();
        studio(&dir).arg("--version").assert().success();
    }

    #[test]
    fn test_unknown_framework_rejected() {
        let dir = create_temp_project();
        studio(&dir)
            .args(["plan", "s1", "Create a todo app", "--framework", "angular"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Invalid framework"));
    }
}

// =============================================================================
// Configuration Tests
// =============================================================================

mod configuration {
    use super::*;

    #[test]
    fn test_config_show_defaults() {
        let dir = create_temp_project();
        studio(&dir)
            .args(["config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("claude_cmd = \"claude\""))
            .stdout(predicate::str::contains("max_processes = 5"))
            .stdout(predicate::str::contains("studio config init"));
    }

    #[test]
    fn test_config_init_creates_file_once() {
        let dir = create_temp_project();
        studio(&dir)
            .args(["config", "init"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Created studio.toml"));
        assert!(dir.path().join(".studio/studio.toml").exists());

        studio(&dir)
            .args(["config", "init"])
            .assert()
            .success()
            .stdout(predicate::str::contains("already exists"));
    }

    #[test]
    fn test_config_validate_defaults() {
        let dir = create_temp_project();
        studio(&dir)
            .args(["config", "validate"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Using defaults (valid)"));
    }

    #[test]
    fn test_config_validate_reports_warnings() {
        let dir = create_temp_project();
        fs::create_dir_all(dir.path().join(".studio")).unwrap();
        fs::write(
            dir.path().join(".studio/studio.toml"),
            "[preview]\nmax_processes = 0\n\n[preview.frameworks.angular]\ndev = \"ng serve\"\n",
        )
        .unwrap();

        studio(&dir)
            .args(["config", "validate"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Configuration warnings"))
            .stdout(predicate::str::contains("max_processes is 0"))
            .stdout(predicate::str::contains("angular"));
    }

    #[test]
    fn test_config_show_reads_file_values() {
        let dir = create_temp_project();
        fs::create_dir_all(dir.path().join(".studio")).unwrap();
        fs::write(
            dir.path().join(".studio/studio.toml"),
            "[generation]\nclaude_cmd = \"my-claude\"\n",
        )
        .unwrap();

        studio(&dir)
            .args(["config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("claude_cmd = \"my-claude\""));
    }
}

// =============================================================================
// Session Workflow Tests
// =============================================================================

mod workflow {
    use super::*;

    #[test]
    fn test_approve_without_plan_fails() {
        let dir = create_temp_project();
        studio(&dir)
            .args(["approve", "s1"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("No plan found for session s1"));
    }

    #[test]
    fn test_repair_without_project_fails() {
        let dir = create_temp_project();
        studio(&dir)
            .args(["repair", "ghost"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("does not exist"));
    }

    #[test]
    fn test_invalid_session_id_rejected() {
        let dir = create_temp_project();
        studio(&dir)
            .args(["reset", "../escape"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Invalid session id"));
    }

    #[cfg(unix)]
    #[test]
    fn test_plan_with_fake_generator_persists_pending_plan() {
        use std::os::unix::fs::PermissionsExt;

        let dir = create_temp_project();
        let script = dir.path().join("fake-claude");
        fs::write(
            &script,
            "#!/bin/bash\ncat > /dev/null\n\
             echo '{\"type\":\"assistant\",\"message\":{\"content\":[{\"type\":\"text\",\"text\":\"## Steps\\n1. Build the todo list\\n2. Wire the page\"}]}}'\n\
             echo '{\"type\":\"result\",\"subtype\":\"success\",\"result\":\"\",\"is_error\":false}'\n",
        )
        .unwrap();
        fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();

        studio(&dir)
            .env("CLAUDE_CMD", &script)
            .args(["plan", "s1", "Create a todo app"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Build the todo list"))
            .stdout(predicate::str::contains("awaiting_approval"))
            .stdout(predicate::str::contains("studio approve s1"));

        assert!(dir.path().join(".studio/workspaces/s1/package.json").exists());
        assert!(dir.path().join(".studio/sessions").is_dir());

        studio(&dir)
            .args(["reset", "s1"])
            .assert()
            .success()
            .stdout(predicate::str::contains("awaiting_approval"));
    }
}
