//! End-to-end tests against the `keel` binary with the offline provider.

use assert_cmd::Command;
use predicates::prelude::*;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

const NETWORK_AND_APP: &str = r#"
Stacks:
  - Id: app
    Imports: [vpc-id]
    Exports:
      app-url: https://app.internal
    Resources:
      web:
        Type: Compute::CapacityGroup
        BacksExports: [app-url]
        CapacityGroup:
          MinSize: 1
          MaxSize: 4
          DesiredCapacity: 2
          LaunchVersion: web-v1
          HealthCheckGracePeriod: 0
          HealthCheckType: Instance
          UpdatePolicy:
            MinInstancesInService: 1
            MaxBatchSize: 1
            PauseTime: 0
  - Id: network
    Exports:
      vpc-id: vpc-0a1b
    Resources:
      vpc:
        Type: Network::Vpc
        Properties:
          CidrBlock: CIDR
        ImmutableProperties: [CidrBlock]
        BacksExports: [vpc-id]
"#;

const NETWORK_ONLY: &str = r#"
Stacks:
  - Id: network
    Exports:
      vpc-id: vpc-0a1b
    Resources:
      vpc:
        Type: Network::Vpc
        Properties:
          CidrBlock: 10.0.0.0/16
        ImmutableProperties: [CidrBlock]
        BacksExports: [vpc-id]
"#;

const CYCLE: &str = r#"
Stacks:
  - Id: a
    Imports: [from-b]
    Exports: { from-a: "1" }
  - Id: b
    Imports: [from-a]
    Exports: { from-b: "2" }
"#;

struct Env {
    dir: TempDir,
}

impl Env {
    fn new() -> Self {
        let env = Self {
            dir: tempfile::tempdir().unwrap(),
        };
        env.write(
            "config.toml",
            &format!(
                "state_dir = {:?}\n\n[rollout]\npoll_interval_ms = 10\nmax_polls = 50\nbatch_wait_ceiling_secs = 30\n",
                env.path("state")
            ),
        );
        env
    }

    fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    fn write(&self, name: &str, contents: &str) -> PathBuf {
        let path = self.path(name);
        std::fs::write(&path, contents).unwrap();
        path
    }

    fn stack_set(&self, name: &str, cidr: &str) -> PathBuf {
        self.write(name, &NETWORK_AND_APP.replace("CIDR", cidr))
    }

    fn keel(&self) -> Command {
        let mut cmd = Command::cargo_bin("keel").unwrap();
        cmd.env_remove("KEEL_STATE_DIR")
            .env("KEEL_CONFIG", self.path("config.toml"))
            .env("NO_COLOR", "1")
            .write_stdin("");
        cmd
    }
}

fn arg(path: &Path) -> &str {
    path.to_str().unwrap()
}

#[test]
fn test_help_lists_commands() {
    Command::cargo_bin("keel")
        .unwrap()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("deploy"))
        .stdout(predicate::str::contains("teardown"))
        .stdout(predicate::str::contains("plan"))
        .stdout(predicate::str::contains("status"));
}

#[test]
fn test_deploy_status_teardown() {
    let env = Env::new();
    let set = env.stack_set("stacks.yaml", "10.0.0.0/16");

    env.keel()
        .args(["deploy", arg(&set)])
        .assert()
        .code(0)
        .stdout(predicate::str::contains("network"))
        .stdout(predicate::str::contains("deployed"));

    env.keel()
        .arg("status")
        .assert()
        .success()
        .stdout(predicate::str::contains("vpc-id"))
        .stdout(predicate::str::contains("web 2/2 @ web-v1"));

    env.keel()
        .args(["plan", arg(&set), "--stack", "app"])
        .assert()
        .success()
        .stdout(predicate::str::contains("no changes"));

    env.keel()
        .args(["teardown", arg(&set), "--yes"])
        .assert()
        .code(0)
        .stdout(predicate::str::contains("Removed 2 stack(s)"));

    let status = env.keel().args(["status", "--output", "json"]).assert().success();
    let doc: serde_json::Value = serde_json::from_slice(&status.get_output().stdout).unwrap();
    assert_eq!(doc["stacks"].as_array().unwrap().len(), 0);
}

#[test]
fn test_missing_rollout_settings_is_a_config_error() {
    let env = Env::new();
    let config = env.write("bare.toml", &format!("state_dir = {:?}\n", env.path("state")));
    let set = env.stack_set("stacks.yaml", "10.0.0.0/16");

    env.keel()
        .env("KEEL_CONFIG", &config)
        .args(["deploy", arg(&set)])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("rollout.poll_interval_ms is not set"));
}

#[test]
fn test_cycle_exits_with_dependency_code() {
    let env = Env::new();
    let set = env.write("cycle.yaml", CYCLE);

    env.keel()
        .args(["deploy", arg(&set)])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("cycle"));
    assert!(!env.path("state/stacks/a.json").exists());
}

#[test]
fn test_risky_change_needs_fingerprint_approval() {
    let env = Env::new();
    let v1 = env.stack_set("v1.yaml", "10.0.0.0/16");
    let v2 = env.stack_set("v2.yaml", "10.1.0.0/16");
    env.keel().args(["deploy", arg(&v1)]).assert().code(0);

    env.keel()
        .args(["deploy", arg(&v2)])
        .assert()
        .code(3)
        .stderr(predicate::str::contains("--approve"));

    let plan = env
        .keel()
        .args(["plan", arg(&v2), "--stack", "network", "--output", "json"])
        .assert()
        .success();
    let change_set: serde_json::Value = serde_json::from_slice(&plan.get_output().stdout).unwrap();
    let fingerprint = change_set["fingerprint"].as_str().unwrap().to_string();

    env.keel()
        .args(["deploy", arg(&v2), "--approve", &fingerprint])
        .assert()
        .code(0);
}

#[test]
fn test_teardown_blocked_by_outside_consumer() {
    let env = Env::new();
    let set = env.stack_set("stacks.yaml", "10.0.0.0/16");
    let network = env.write("network.yaml", NETWORK_ONLY);
    env.keel().args(["deploy", arg(&set)]).assert().code(0);

    env.keel()
        .args(["teardown", arg(&network), "--yes"])
        .assert()
        .code(6)
        .stderr(predicate::str::contains("imported by app"));
}

#[test]
fn test_config_shows_effective_settings() {
    let env = Env::new();
    env.keel()
        .arg("config")
        .assert()
        .success()
        .stdout(predicate::str::contains("poll_interval_ms = 10"));
}
