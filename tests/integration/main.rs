//! Integration tests for cigate

mod cli_tests {
    use assert_cmd::{cargo::cargo_bin_cmd, Command};
    use predicates::prelude::*;
    use std::fs;
    use std::path::Path;
    use std::time::{Duration, SystemTime};
    use tempfile::TempDir;

    /// Workspace with a config pointing caches and locks into the temp dir
    struct Workspace {
        dir: TempDir,
    }

    impl Workspace {
        fn new() -> Self {
            let dir = TempDir::new().unwrap();
            let config = format!(
                "[cache]\ndir = \"{}\"\n\n[lock]\ndir = \"{}\"\n",
                dir.path().join("cache").display(),
                dir.path().join("locks").display()
            );
            fs::write(dir.path().join("config.toml"), config).unwrap();
            Self { dir }
        }

        fn path(&self) -> &Path {
            self.dir.path()
        }

        fn write(&self, name: &str, content: &str) {
            fs::write(self.path().join(name), content).unwrap();
        }

        fn cigate(&self) -> Command {
            let mut cmd = cargo_bin_cmd!("cigate");
            cmd.current_dir(self.path())
                .env("CI", "1")
                .env_remove("CIGATE_LOG")
                .arg("--no-local")
                .arg("--config")
                .arg(self.path().join("config.toml"));
            cmd
        }
    }

    #[test]
    fn help_displays() {
        cargo_bin_cmd!("cigate")
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("Incremental execution engine for CI"));
    }

    #[test]
    fn version_displays() {
        cargo_bin_cmd!("cigate")
            .arg("--version")
            .assert()
            .success()
            .stdout(predicate::str::contains("cigate"));
    }

    #[test]
    fn check_commit_check_settles() {
        let ws = Workspace::new();
        ws.write("main.cpp", "int main() {}");

        ws.cigate()
            .args(["check", "build", "main.cpp"])
            .assert()
            .success()
            .stdout("changed\n");
        ws.cigate().args(["commit", "build"]).assert().success();
        ws.cigate()
            .args(["check", "build", "main.cpp"])
            .assert()
            .success()
            .stdout("unchanged\n");

        ws.write("main.cpp", "int main() { return 1; }");
        fs::OpenOptions::new()
            .write(true)
            .open(ws.path().join("main.cpp"))
            .unwrap()
            .set_modified(SystemTime::now() + Duration::from_secs(5))
            .unwrap();
        ws.cigate()
            .args(["check", "build", "main.cpp"])
            .assert()
            .success()
            .stdout("changed\n");
    }

    #[test]
    fn check_exit_code_when_unchanged() {
        let ws = Workspace::new();
        ws.write("lib.cpp", "void f() {}");

        ws.cigate()
            .args(["check", "lib", "lib.cpp", "--strategy", "per-file"])
            .assert()
            .success();
        ws.cigate()
            .args(["commit", "lib", "--strategy", "per-file"])
            .assert()
            .success();
        ws.cigate()
            .args(["check", "lib", "lib.cpp", "--strategy", "per-file", "--exit-code"])
            .assert()
            .code(1)
            .stdout("unchanged\n");
    }

    #[test]
    fn commit_without_check_fails() {
        let ws = Workspace::new();
        ws.cigate()
            .args(["commit", "never-checked"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("cigate check"));
    }

    #[test]
    fn invalidate_forces_change() {
        let ws = Workspace::new();
        ws.write("a.txt", "a");

        ws.cigate().args(["check", "docs", "a.txt"]).assert().success();
        ws.cigate().args(["commit", "docs"]).assert().success();
        ws.cigate().args(["invalidate", "docs"]).assert().success();
        ws.cigate()
            .args(["check", "docs", "a.txt"])
            .assert()
            .success()
            .stdout("changed\n");
    }

    #[test]
    fn run_jobs_succeeds() {
        let ws = Workspace::new();
        ws.write(
            "jobs.toml",
            r#"
mode = "dependency"

[[job]]
id = "first"
command = ["sh", "-c", "echo one > first.out"]

[[job]]
id = "second"
command = ["sh", "-c", "test -f first.out"]
depends_on = ["first"]
"#,
        );

        ws.cigate()
            .args(["run", "jobs.toml"])
            .assert()
            .success()
            .stdout(predicate::str::contains("2 job(s) passed"));
    }

    #[test]
    fn run_failing_job_reports_summary() {
        let ws = Workspace::new();
        ws.write(
            "jobs.toml",
            r#"
[[job]]
id = "ok"
command = ["true"]

[[job]]
id = "broken"
command = ["sh", "-c", "echo 'assertion failed'; exit 3"]
"#,
        );

        ws.cigate()
            .args(["run", "jobs.toml", "--threshold", "5"])
            .assert()
            .failure()
            .stdout(predicate::str::contains("broken").and(predicate::str::contains("assertion failed")))
            .stderr(predicate::str::contains("1 failed job(s)"));
    }

    #[test]
    fn run_skips_when_inputs_unchanged() {
        let ws = Workspace::new();
        ws.write("input.txt", "v1");
        ws.write(
            "jobs.toml",
            "[[job]]\nid = \"count\"\ncommand = [\"sh\", \"-c\", \"echo run >> runs.log\"]\n",
        );

        for _ in 0..2 {
            ws.cigate()
                .args(["run", "jobs.toml", "--cache", "gate", "--inputs", "input.txt"])
                .assert()
                .success();
        }
        let runs = fs::read_to_string(ws.path().join("runs.log")).unwrap();
        assert_eq!(runs.lines().count(), 1);
    }

    #[test]
    fn run_under_lock() {
        let ws = Workspace::new();
        ws.write("jobs.toml", "[[job]]\nid = \"a\"\ncommand = [\"true\"]\n");

        ws.cigate()
            .args(["run", "jobs.toml", "--lock", "device", "--lock-timeout", "5"])
            .assert()
            .success();
        assert!(!ws.path().join("locks").join("device.lock").exists());
    }

    #[test]
    fn run_rejects_unknown_dependency() {
        let ws = Workspace::new();
        ws.write(
            "jobs.toml",
            "[[job]]\nid = \"a\"\ncommand = [\"true\"]\ndepends_on = [\"ghost\"]\n",
        );

        ws.cigate()
            .args(["run", "jobs.toml"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("ghost"));
    }

    #[test]
    fn status_lists_caches() {
        let ws = Workspace::new();
        ws.write("a.txt", "a");
        ws.cigate().args(["check", "docs", "a.txt"]).assert().success();

        ws.cigate()
            .arg("status")
            .assert()
            .success()
            .stdout(predicate::str::contains("[group]").and(predicate::str::contains("docs")));
    }

    #[test]
    fn init_writes_local_config() {
        let ws = Workspace::new();
        ws.cigate().args(["init", "--local"]).assert().success();
        let written = fs::read_to_string(ws.path().join(".cigate.toml")).unwrap();
        assert!(written.contains("failure_threshold"));

        ws.cigate()
            .args(["init", "--local"])
            .assert()
            .success()
            .stdout(predicate::str::contains("already exists"));
    }

    #[test]
    fn invalid_strategy_rejected() {
        let ws = Workspace::new();
        ws.cigate()
            .args(["check", "c", "f", "--strategy", "bogus"])
            .assert()
            .failure();
    }
}
