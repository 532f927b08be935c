//! Subprocess tests for the `tl` binary.
//!
//! - `check` exits 0 on a valid file and 1 with remediation otherwise
//! - `tiers` prints every tier, addresses and age selection
//! - `replay` prints stats JSON on stdout and keeps logs on stderr

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

use tierline_core::protocol::{MetricSubmit, encode_connect, encode_ping, encode_submit};
use tierline_core::types::{MetricType, NO_TOKEN};

const T0: i64 = 1_700_000_000_000;

fn tl() -> Command {
    let mut cmd = Command::cargo_bin("tl").expect("tl binary");
    cmd.env_remove("TIERLINE_CONFIG").env_remove("RUST_LOG");
    cmd
}

fn write_config(dir: &TempDir, body: &str) -> String {
    let path = dir.path().join("tierline.toml");
    std::fs::write(&path, body).expect("write config");
    path.to_string_lossy().to_string()
}

// =============================================================================
// check
// =============================================================================

#[test]
fn check_accepts_valid_config() {
    let dir = TempDir::new().expect("temp dir");
    let path = write_config(
        &dir,
        r#"
[server]
host_name = "apm-1"

[tiers]
model = "raw=1s:60, 1m:60"
"#,
    );

    tl().args(["check", "--config", &path])
        .assert()
        .success()
        .stdout(predicate::str::contains("server: apm-1/core"))
        .stdout(predicate::str::contains("tiers: raw=1s:60"))
        .stdout(predicate::str::contains("OK"));
}

#[test]
fn check_rejects_bad_tier_model_with_remediation() {
    let dir = TempDir::new().expect("temp dir");
    let path = write_config(&dir, "[tiers]\nmodel = \"15s:10, 40s:10\"\n");

    tl().args(["check", "--config", &path])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("error:"))
        .stderr(predicate::str::contains("To fix:"));
}

#[test]
fn check_reports_missing_explicit_file() {
    let dir = TempDir::new().expect("temp dir");
    let path = dir.path().join("absent.toml");

    tl().args(["check", "--config", &path.to_string_lossy()])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("not found"));
}

// =============================================================================
// tiers
// =============================================================================

#[test]
fn tiers_prints_addresses_and_age_choice() {
    tl().args([
        "tiers",
        "raw=1s:10, 10s:6, 1m:60",
        "--at",
        "1700000012345",
        "--age",
        "15000",
    ])
    .assert()
    .success()
    .stdout(predicate::str::contains("address 1700000012000"))
    .stdout(predicate::str::contains("address 1700000010000"))
    .stdout(predicate::str::contains("address 1699999980000"))
    .stdout(predicate::str::contains("finest tier for age 15000ms: 1 (t1)"))
    .stdout(predicate::str::contains("coarsest tier for age 15000ms: 2 (t2)"));
}

#[test]
fn tiers_rejects_unsorted_model() {
    tl().args(["tiers", "1m:10, 1s:10"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("To fix:"));
}

#[test]
fn unknown_log_level_is_a_usage_error() {
    tl().args(["tiers", "1s:10", "--log-level", "loud"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("unknown log level"));
}

// =============================================================================
// replay
// =============================================================================

fn submit(ts: i64) -> Vec<u8> {
    encode_submit(&MetricSubmit {
        token: NO_TOKEN,
        host: "web-1".into(),
        agent: "jvm".into(),
        metric_type: MetricType::LongGauge,
        namespace: vec!["jvm".into(), "heap".into()],
        name: "used".into(),
        timestamp_ms: ts,
        value: 42,
    })
}

#[test]
fn replay_prints_stats_json() {
    let dir = TempDir::new().expect("temp dir");
    let frames = dir.path().join("frames.hex");
    let body = format!(
        "# web-1 session\n{}\n\n{}\n{}\n{}\nff00\n",
        hex::encode(encode_connect("web-1", "jvm", "tcp://web-1:9000")),
        hex::encode(submit(T0 - 1_000)),
        hex::encode(submit(T0)),
        hex::encode(encode_ping("web-1", "jvm")),
    );
    std::fs::write(&frames, body).expect("write frames");

    let output = tl()
        .args(["replay", "--now", &T0.to_string()])
        .arg(&frames)
        .output()
        .expect("run tl");
    assert!(output.status.success(), "stderr: {}", String::from_utf8_lossy(&output.stderr));

    let stats: serde_json::Value = serde_json::from_slice(&output.stdout).expect("stats json");
    assert_eq!(stats["dispatcher"]["received"], 5);
    assert_eq!(stats["dispatcher"]["completed"], 4);
    assert_eq!(stats["dispatcher"]["unknown_opcodes"], 1);
    assert_eq!(stats["catalog"]["record_count"], 1);
    assert_eq!(stats["registry"]["active"], 1);
}

#[test]
fn replay_rejects_bad_hex() {
    let dir = TempDir::new().expect("temp dir");
    let frames = dir.path().join("frames.hex");
    std::fs::write(&frames, "00\nnot-hex\n").expect("write frames");

    tl().arg("replay")
        .arg(&frames)
        .assert()
        .failure()
        .stderr(predicate::str::contains("line 2"));
}

#[test]
fn replay_reads_stdin() {
    tl().args(["replay", "--now", &T0.to_string(), "-"])
        .write_stdin(format!("{}\n", hex::encode(encode_ping("web-1", "jvm"))))
        .assert()
        .success()
        .stdout(predicate::str::contains("\"received\": 1"));
}
