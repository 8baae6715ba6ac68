use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn tpipe_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("tpipe");
    path
}

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();

    let payload_dir = root.join("payloads");
    fs::create_dir_all(&payload_dir).unwrap();
    fs::write(
        payload_dir.join("batch-001.jsonl"),
        concat!(
            r#"{"paper_id":"2401.00001","title":"Sparse attention","abstract":"We study sparse attention.","source":"arxiv"}"#,
            "\n",
            r#"{"paper_id":"2401.00002","title":"Graph transformers","abstract":"Graphs meet transformers.","source":"arxiv"}"#,
            "\n",
            r#"{"paper_id":"2401.00001","title":"Sparse attention (dup)","source":"arxiv"}"#,
            "\n",
        ),
    )
    .unwrap();
    fs::write(payload_dir.join("garbage.jsonl"), "this is not json\n").unwrap();

    let config_content = format!(
        r#"[store]
backend = "sqlite"

[store.sqlite]
path = "{}/data/pipeline.sqlite"

[writer]
retry_base_delay_ms = 1

[embedding]
provider = "hash"
dims = 32

[logging]
level = "warn"
"#,
        root.display()
    );

    let config_path = config_dir.join("tpipe.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_tpipe(config_path: &Path, args: &[&str]) -> (String, String, Option<i32>) {
    let binary = tpipe_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .env_remove("PAPERS_TABLE_NAME")
        .env_remove("TRACE_ID_INDEX_NAME")
        .env_remove("VECTORS_TABLE_NAME")
        .env_remove("EMBEDDING_API_URL")
        .output()
        .unwrap_or_else(|e| panic!("Failed to run tpipe binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (stdout, stderr, output.status.code())
}

fn payload(config_path: &Path, name: &str) -> String {
    config_path
        .parent()
        .unwrap()
        .parent()
        .unwrap()
        .join("payloads")
        .join(name)
        .display()
        .to_string()
}

#[test]
fn test_init_creates_database() {
    let (tmp, config_path) = setup_test_env();

    let (stdout, stderr, code) = run_tpipe(&config_path, &["init"]);
    assert_eq!(code, Some(0), "init failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("initialized"));
    assert!(tmp.path().join("data/pipeline.sqlite").exists());

    let (_, _, code) = run_tpipe(&config_path, &["init"]);
    assert_eq!(code, Some(0), "Second init failed (not idempotent)");
}

#[test]
fn test_ingest_then_vectorize() {
    let (_tmp, config_path) = setup_test_env();
    run_tpipe(&config_path, &["init"]);

    let batch = payload(&config_path, "batch-001.jsonl");
    let (stdout, stderr, code) = run_tpipe(&config_path, &["ingest", &batch]);
    assert_eq!(code, Some(0), "ingest failed: stdout={}, stderr={}", stdout, stderr);

    let output: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(output["status"], "completed");
    assert_eq!(output["total"], 2);
    assert_eq!(output["succeeded"], 2);
    assert_eq!(output["duplicate_count"], 1);
    let trace_id = output["trace_id"].as_str().unwrap().to_string();

    let (stdout, stderr, code) = run_tpipe(&config_path, &["vectorize", "--trace-id", &trace_id]);
    assert_eq!(code, Some(0), "vectorize failed: stdout={}, stderr={}", stdout, stderr);

    let output: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(output["trace_id"], trace_id.as_str());
    assert_eq!(output["status"], "completed");
    assert_eq!(output["succeeded"], 2);
    assert_eq!(output["embeddings_generated"], 2);
}

#[test]
fn test_run_reports_both_stages() {
    let (_tmp, config_path) = setup_test_env();

    let batch = payload(&config_path, "batch-001.jsonl");
    let (stdout, stderr, code) = run_tpipe(&config_path, &["run", &batch]);
    assert_eq!(code, Some(0), "run failed: stdout={}, stderr={}", stdout, stderr);

    let output: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(output["ingestion"]["status"], "completed");
    assert_eq!(output["vectorization"]["status"], "completed");
    assert_eq!(
        output["ingestion"]["trace_id"],
        output["vectorization"]["trace_id"]
    );
}

#[test]
fn test_partial_ingest_exits_with_two() {
    let (_tmp, config_path) = setup_test_env();

    let batch = payload(&config_path, "batch-001.jsonl");
    let garbage = payload(&config_path, "garbage.jsonl");
    let (stdout, stderr, code) = run_tpipe(&config_path, &["ingest", &batch, &garbage]);
    assert_eq!(code, Some(2), "stdout={}, stderr={}", stdout, stderr);

    let output: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(output["status"], "partial");
    let trace_id = output["trace_id"].as_str().unwrap();
    assert!(stderr.contains(trace_id));
}

#[test]
fn test_failed_ingest_exits_with_one() {
    let (_tmp, config_path) = setup_test_env();

    let garbage = payload(&config_path, "garbage.jsonl");
    let (stdout, stderr, code) = run_tpipe(&config_path, &["ingest", &garbage]);
    assert_eq!(code, Some(1), "stdout={}, stderr={}", stdout, stderr);
    assert!(stderr.contains("error:"));
}

#[test]
fn test_vectorize_unknown_trace_completes_empty() {
    let (_tmp, config_path) = setup_test_env();
    run_tpipe(&config_path, &["init"]);

    let (stdout, _, code) = run_tpipe(&config_path, &["vectorize", "--trace-id", "no-such-trace"]);
    assert_eq!(code, Some(0));
    let output: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(output["total"], 0);
}

#[test]
fn test_missing_config_fails() {
    let tmp = TempDir::new().unwrap();
    let (_, stderr, code) = run_tpipe(&tmp.path().join("missing.toml"), &["init"]);
    assert_ne!(code, Some(0));
    assert!(stderr.contains("Failed to read config file"));
}
