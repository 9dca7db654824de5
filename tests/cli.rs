mod openai_stub;
mod site_stub;

use predicates::prelude::*;

use openai_stub::{OpenAiStub, OpenAiStubConfig};
use site_stub::{Route, SiteStub, article};

fn cmd() -> assert_cmd::Command {
    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("webcontent-analyzer");
    cmd.env_remove("WCA_ALLOW_PRIVATE_NETWORKS")
        .env_remove("WCA_CACHE_DIR")
        .env_remove("WCA_USAGE_LEDGER");
    cmd
}

#[test]
fn help_lists_commands() {
    cmd()
        .arg("--help")
        .assert()
        .success()
        .stdout(
            predicate::str::contains("analyze")
                .and(predicate::str::contains("validate"))
                .and(predicate::str::contains("usage"))
                .and(predicate::str::contains("cache")),
        );
}

#[test]
fn validate_rejects_private_network_target() {
    cmd()
        .args(["validate", "--url", "http://127.0.0.1/admin"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("private_network"));
}

#[test]
fn validate_rejects_traversal_and_bad_scheme() {
    cmd()
        .args(["validate", "--url", "http://example.com/../../etc/passwd"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("traversal"));
    cmd()
        .args(["validate", "--url", "file:///etc/passwd"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("malformed"));
}

#[test]
fn validate_accepts_public_ip_literal() {
    cmd()
        .args(["validate", "--url", "http://93.184.216.34/index.html"])
        .assert()
        .success()
        .stdout(predicate::str::starts_with("ok http://93.184.216.34/index.html"));
}

#[test]
fn rust_log_debug_emits_debug_line_to_stderr() {
    cmd()
        .env("RUST_LOG", "debug")
        .args(["validate", "--url", "http://93.184.216.34/"])
        .assert()
        .success()
        .stderr(predicate::str::contains("parsed cli"));
}

#[test]
fn analyze_prints_json_and_records_usage() {
    let llm = OpenAiStub::spawn(OpenAiStubConfig::default());
    let site = SiteStub::spawn(vec![(
        "/article",
        Route::Html(article("Garden Notes", &["Oak", "Maple"])),
    )]);
    let dir = tempfile::tempdir().expect("tempdir");
    let ledger = dir.path().join("usage.jsonl");
    let cache_dir = dir.path().join("cache");

    let output = cmd()
        .env("WCA_LLM_BASE_URL", &llm.base_url)
        .env("WCA_ALLOW_PRIVATE_NETWORKS", "true")
        .env("WCA_USAGE_LEDGER", &ledger)
        .env("WCA_CACHE_DIR", &cache_dir)
        .args(["analyze", "--url", site.url("/article").as_str()])
        .args(["--analysis-type", "detailed", "--max-chunk-chars", "500"])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();

    let analysis: serde_json::Value = serde_json::from_slice(&output).expect("json on stdout");
    assert_eq!(analysis["analysis_type"], "detailed");
    assert_eq!(analysis["cache"], "miss");
    assert_eq!(analysis["title"], "Garden Notes");
    assert!(
        analysis["result"]["summary"]
            .as_str()
            .unwrap_or("")
            .contains("Stub summary")
    );
    let chunks = analysis["chunks_total"].as_u64().expect("chunks_total");
    assert_eq!(llm.calls() as u64, chunks);

    let totals = cmd()
        .env("WCA_USAGE_LEDGER", &ledger)
        .args(["usage", "show"])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let totals: serde_json::Value = serde_json::from_slice(&totals).expect("totals json");
    assert_eq!(totals["calls"].as_u64(), Some(chunks));

    // A fresh process finds the persistent cache entry.
    let again = cmd()
        .env("WCA_LLM_BASE_URL", &llm.base_url)
        .env("WCA_ALLOW_PRIVATE_NETWORKS", "true")
        .env("WCA_USAGE_LEDGER", &ledger)
        .env("WCA_CACHE_DIR", &cache_dir)
        .args(["analyze", "--url", site.url("/article").as_str()])
        .args(["--analysis-type", "detailed", "--max-chunk-chars", "500"])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let again: serde_json::Value = serde_json::from_slice(&again).expect("json on stdout");
    assert_eq!(again["cache"], "hit");
    assert_eq!(llm.calls() as u64, chunks);

    cmd()
        .env("WCA_CACHE_DIR", &cache_dir)
        .args(["cache", "purge"])
        .assert()
        .success()
        .stdout(predicate::str::contains("removed"));

    cmd()
        .env("WCA_USAGE_LEDGER", &ledger)
        .args(["usage", "reset"])
        .assert()
        .success();
    assert!(!ledger.exists());
}

#[test]
fn analyze_rejects_bad_option_before_fetching() {
    cmd()
        .args(["analyze", "--url", "https://example.com/", "--timeout-secs", "0"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("timeout_secs"));
}
