use serde_json::json;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn aemrag_binary() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_aemrag"))
}

/// Write a config whose storage lives under `root/data`, plus `extra` TOML.
fn setup_test_env(extra: &str) -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();
    fs::create_dir_all(root.join("data")).unwrap();

    let config_content = format!(
        r#"api_key_env = "AEMRAG_TEST_KEY_THAT_IS_NEVER_SET"

[storage]
corpus_path = "{root}/data/corpus.jsonl"
index_path = "{root}/data/index.vec"
metadata_path = "{root}/data/meta.json"
checkpoint_path = "{root}/data/state.json"

{extra}
"#,
        root = root.display(),
        extra = extra,
    );

    let config_path = config_dir.join("aemrag.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_aemrag(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = aemrag_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path)
        .arg("--progress")
        .arg("off")
        .args(args)
        .env_remove("AEMRAG_TEST_KEY_THAT_IS_NEVER_SET")
        .output()
        .unwrap_or_else(|e| panic!("Failed to run aemrag binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (stdout, stderr, output.status.success())
}

fn write_corpus(config_path: &Path) {
    let data = config_path.parent().unwrap().parent().unwrap().join("data");
    let lines = [
        json!({"path": "/content/shop/boots", "content": "jcr:title: Winter boots"}),
        json!({"path": "/content/shop/spring", "content": "jcr:title: Spring collection"}),
    ];
    let body: String = lines.iter().map(|l| format!("{}\n", l)).collect();
    fs::write(data.join("corpus.jsonl"), body).unwrap();
}

#[test]
fn test_flatten_works_without_config_file() {
    let tmp = TempDir::new().unwrap();
    let export = tmp.path().join("page.json");
    fs::write(
        &export,
        r#"{"jcr:primaryType": "cq:Page", "jcr:title": "Home", "hero": {"text": "Welcome"}}"#,
    )
    .unwrap();

    let missing = tmp.path().join("no-such-config.toml");
    let (stdout, stderr, success) = run_aemrag(
        &missing,
        &["flatten", export.to_str().unwrap(), "--path", "/content/site"],
    );
    assert!(success, "flatten failed: stdout={}, stderr={}", stdout, stderr);

    let records: Vec<serde_json::Value> = stdout
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect();
    assert_eq!(records.len(), 2);
    assert_eq!(records[0]["path"], "/content/site");
    assert_eq!(records[0]["metadata"]["primaryType"], "cq:Page");
    assert_eq!(records[1]["path"], "/content/site/hero");
    assert_eq!(records[1]["content"], "text: Welcome");
}

#[test]
fn test_index_status_without_checkpoint() {
    let (_tmp, config_path) = setup_test_env("");

    let (stdout, stderr, success) = run_aemrag(&config_path, &["index", "status"]);
    assert!(success, "status failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("checkpoint: none"));
    assert!(stdout.contains("vectors: 0"));
    assert!(stdout.contains("locked: false"));
}

#[test]
fn test_missing_credential_is_fatal() {
    let (_tmp, config_path) = setup_test_env("");
    write_corpus(&config_path);

    let (_, stderr, success) = run_aemrag(&config_path, &["index", "build"]);
    assert!(!success, "index build should fail without a credential");
    assert!(stderr.contains("AEMRAG_TEST_KEY_THAT_IS_NEVER_SET"));
}

#[test]
fn test_invalid_config_is_rejected() {
    let (_tmp, config_path) = setup_test_env("[embedding]\nbatch_size = 0\n");

    let (_, stderr, success) = run_aemrag(&config_path, &["index", "status"]);
    assert!(!success);
    assert!(stderr.contains("batch_size"));
}

#[test]
fn test_ask_without_index_fails() {
    let (_tmp, config_path) = setup_test_env(
        "[embedding]\nprovider = \"ollama\"\nurl = \"http://127.0.0.1:9\"\n\n[llm]\nprovider = \"disabled\"\n",
    );

    let (_, stderr, success) = run_aemrag(&config_path, &["ask", "what is on the home page?"]);
    assert!(!success);
    assert!(stderr.contains("aemrag index build"));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_build_status_and_search_with_ollama() {
    let ollama = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/embed"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "embeddings": [[1.0, 0.0, 0.5]]
        })))
        .mount(&ollama)
        .await;

    let (_tmp, config_path) = setup_test_env(&format!(
        "[embedding]\nprovider = \"ollama\"\nmodel = \"nomic-embed-text\"\nurl = \"{}\"\nbatch_size = 1\nsave_every_batches = 1\n",
        ollama.uri()
    ));
    write_corpus(&config_path);

    let (stdout, stderr, success) = run_aemrag(&config_path, &["index", "build"]);
    assert!(success, "build failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("processed: 2"));

    let (stdout, _, success) = run_aemrag(&config_path, &["index", "status"]);
    assert!(success);
    assert!(stdout.contains("complete: true"));
    assert!(stdout.contains("entries: 2"));
    assert!(stdout.contains("dims: 3"));

    // A second build finds nothing left to do.
    let (_, _, success) = run_aemrag(&config_path, &["index", "build"]);
    assert!(success);
    assert_eq!(ollama.received_requests().await.unwrap().len(), 2);

    let (stdout, stderr, success) = run_aemrag(&config_path, &["search", "boots"]);
    assert!(success, "search failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("dense #1"));
    assert!(stdout.contains("sparse #1  /content/shop/boots"));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_crawl_writes_corpus() {
    let aem = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/content/shop.infinity.json"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "jcr:primaryType": "cq:Page",
            "jcr:title": "Shop"
        })))
        .mount(&aem)
        .await;
    Mock::given(method("GET"))
        .and(path("/content/shop.1.json"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "jcr:primaryType": "cq:Page",
            "jcr:content": { "jcr:primaryType": "cq:PageContent" }
        })))
        .mount(&aem)
        .await;

    let (tmp, config_path) = setup_test_env(&format!(
        "[source]\nbase_url = \"{}\"\nroots = [\"/content/shop\"]\n",
        aem.uri()
    ));

    let (stdout, stderr, success) = run_aemrag(&config_path, &["crawl"]);
    assert!(success, "crawl failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("visited: 1"));
    assert!(stdout.contains("records: 1"));

    let corpus = fs::read_to_string(tmp.path().join("data/corpus.jsonl")).unwrap();
    assert_eq!(corpus.lines().count(), 1);
    assert!(corpus.contains("jcr:title: Shop"));
}
