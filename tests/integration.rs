use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

const TEST_KEY_ENV: &str = "TAKEOUT_IT_API_KEY";

fn takeout_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("takeout-ingest");
    path
}

struct TestEnv {
    tmp: TempDir,
    config_path: PathBuf,
}

impl TestEnv {
    fn new() -> Self {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();

        fs::create_dir_all(root.join("config")).unwrap();
        let config_path = root.join("config").join("takeout.toml");
        fs::write(
            &config_path,
            format!(
                r#"[store]
home = "{}/home"

[chunking]
max_tokens = 200

[media]
api_key_env = "{}"
"#,
                root.display(),
                TEST_KEY_ENV
            ),
        )
        .unwrap();

        Self { tmp, config_path }
    }

    fn root(&self) -> &Path {
        self.tmp.path()
    }

    fn write(&self, rel: &str, content: &str) -> PathBuf {
        let path = self.root().join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(&path, content).unwrap();
        path
    }

    fn run(&self, args: &[&str]) -> (String, String, bool) {
        let binary = takeout_binary();
        let output = Command::new(&binary)
            .current_dir(self.root())
            .env_remove("TAKEOUT_HOME")
            .env_remove(TEST_KEY_ENV)
            .env_remove("RUST_LOG")
            .arg("--config")
            .arg(&self.config_path)
            .arg("--progress")
            .arg("off")
            .args(args)
            .output()
            .unwrap_or_else(|e| panic!("Failed to run takeout-ingest at {:?}: {}", binary, e));

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        (stdout, stderr, output.status.success())
    }

    fn run_json(&self, args: &[&str]) -> serde_json::Value {
        let (stdout, stderr, success) = self.run(args);
        assert!(success, "{:?} failed: stdout={}, stderr={}", args, stdout, stderr);
        serde_json::from_str(&stdout)
            .unwrap_or_else(|e| panic!("{:?} printed invalid JSON ({}): {}", args, e, stdout))
    }
}

const CONVERSATIONS_JSON: &str = r#"[
  {
    "uuid": "conv-lisbon",
    "name": "Lisbon trip planning",
    "created_at": "2024-04-02T09:15:00Z",
    "updated_at": "2024-04-02T09:40:00Z",
    "chat_messages": [
      { "sender": "human", "text": "Which tram goes up to the castle in Lisbon?" },
      { "sender": "assistant", "text": "Tram 28 passes close to Castelo de Sao Jorge." }
    ]
  },
  {
    "uuid": "conv-sourdough",
    "name": "Sourdough starter",
    "created_at": "2024-05-10T18:00:00Z",
    "chat_messages": [
      { "sender": "human", "text": "My starter smells like acetone." },
      { "sender": "assistant", "text": "Feed it more often; it is hungry." }
    ]
  }
]"#;

fn ingest_conversations(env: &TestEnv) -> serde_json::Value {
    let path = env.write("exports/conversations.json", CONVERSATIONS_JSON);
    env.run_json(&["ingest", path.to_str().unwrap(), "--json"])
}

fn first_result_id(search_stdout: &str) -> String {
    search_stdout
        .lines()
        .find_map(|l| l.trim().strip_prefix("id: "))
        .map(|s| s.trim().to_string())
        .expect("search output has an id line")
}

#[test]
fn test_setup_creates_library() {
    let env = TestEnv::new();

    let (stdout, stderr, success) = env.run(&["setup"]);
    assert!(success, "setup failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("✓ migrations"));
    assert!(stdout.contains("✓ database probe"));
    assert!(stdout.contains(&format!("{} not set", TEST_KEY_ENV)));
    assert!(env.root().join("home").join("takeout.sqlite").exists());
}

#[test]
fn test_setup_idempotent() {
    let env = TestEnv::new();
    assert!(env.run(&["setup"]).2, "first setup failed");
    assert!(env.run(&["setup"]).2, "second setup failed");
}

#[test]
fn test_setup_fails_on_unusable_home() {
    let env = TestEnv::new();
    let blocker = env.write("blocker", "not a directory");
    let home = blocker.join("home");

    let (stdout, _stderr, success) = env.run(&["--home", home.to_str().unwrap(), "setup"]);
    assert!(!success);
    assert!(stdout.contains("✗ storage home"));
}

#[test]
fn test_list_ingestors() {
    let env = TestEnv::new();
    let (stdout, _stderr, success) = env.run(&["list-ingestors"]);
    assert!(success);
    for name in ["takeout", "claude", "artifacts"] {
        assert!(stdout.contains(name), "missing {} in {}", name, stdout);
    }
}

#[test]
fn test_ingest_claude_text_export() {
    let env = TestEnv::new();
    let path = env.write(
        "exports/chat.txt",
        "Human: What should I pack for Iceland in March?\n\nAssistant: Layers, a waterproof shell, and crampons.",
    );

    let summary = env.run_json(&["ingest", path.to_str().unwrap(), "--json"]);
    assert_eq!(summary["ingestor"], "claude");
    assert_eq!(summary["total_records"], 1);
    assert_eq!(summary["processed_records"], 1);
    assert_eq!(summary["failed_records"], 0);
    assert_eq!(summary["table_name"], "doc_search.all_documents");
    assert_eq!(summary["progress"]["status"], "completed");
}

#[test]
fn test_ingest_claude_json_reingest_is_unchanged() {
    let env = TestEnv::new();

    let first = ingest_conversations(&env);
    assert_eq!(first["processed_records"], 2);
    assert_eq!(first["unchanged_records"], 0);
    assert_eq!(first["success_rate"], 100.0);

    let second = ingest_conversations(&env);
    assert_eq!(second["processed_records"], 2);
    assert_eq!(second["unchanged_records"], 2);
    assert_eq!(second["chunks_written"], 0);
}

#[test]
fn test_ingest_export_directory() {
    let env = TestEnv::new();
    env.write("claude-export/conversations.json", CONVERSATIONS_JSON);
    let dir = env.root().join("claude-export");

    let summary = env.run_json(&["ingest", dir.to_str().unwrap(), "--type", "claude", "--json"]);
    assert_eq!(summary["processed_records"], 2);
}

#[test]
fn test_ingest_validate_writes_nothing() {
    let env = TestEnv::new();
    let path = env.write("exports/conversations.json", CONVERSATIONS_JSON);

    let report = env.run_json(&["ingest", path.to_str().unwrap(), "--validate", "--json"]);
    assert_eq!(report["validation"], "passed");
    assert_eq!(report["record_count"], 2);
    assert_eq!(report["sample_record"]["title"], "Lisbon trip planning");

    let (stdout, _stderr, success) = env.run(&["search", "tram"]);
    assert!(success);
    assert!(stdout.contains("No results."));
}

#[test]
fn test_ingest_human_summary() {
    let env = TestEnv::new();
    let path = env.write("exports/conversations.json", CONVERSATIONS_JSON);

    let (stdout, stderr, success) = env.run(&["ingest", path.to_str().unwrap()]);
    assert!(success, "ingest failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("processed: 2"));
    assert!(stdout.contains("ok"));
}

#[test]
fn test_ingest_unknown_type() {
    let env = TestEnv::new();
    let path = env.write("exports/chat.txt", "Human: hi");

    let (_stdout, stderr, success) = env.run(&["ingest", path.to_str().unwrap(), "--type", "mbox"]);
    assert!(!success);
    assert!(stderr.contains("Unknown ingestor: 'mbox'"), "stderr={}", stderr);
}

#[test]
fn test_ingest_invalid_source() {
    let env = TestEnv::new();
    let path = env.write("exports/broken.json", "{ not json");

    let (_stdout, stderr, success) = env.run(&["ingest", path.to_str().unwrap(), "-t", "claude"]);
    assert!(!success);
    assert!(stderr.contains("Source validation failed"), "stderr={}", stderr);
}

#[test]
fn test_ingest_zero_batch_size() {
    let env = TestEnv::new();
    let path = env.write("exports/chat.txt", "Human: hi\n\nAssistant: hello");

    let (_stdout, stderr, success) = env.run(&["ingest", path.to_str().unwrap(), "--batch-size", "0"]);
    assert!(!success);
    assert!(stderr.contains("batch size must be > 0"));
}

#[test]
fn test_ingest_takeout_directory() {
    let env = TestEnv::new();
    env.write("dump/Takeout/Drive/itinerary.md", "# Porto\n\nRibeira walk and a port cellar visit.");
    env.write(
        "dump/Takeout/Keep/Shopping.json",
        r#"{"title": "Shopping", "textContent": "olive oil, sardines", "isTrashed": false}"#,
    );
    let dir = env.root().join("dump");

    let summary = env.run_json(&["ingest", dir.to_str().unwrap(), "--json"]);
    assert_eq!(summary["ingestor"], "takeout");
    assert_eq!(summary["processed_records"], 2);

    let (stdout, _stderr, success) = env.run(&["search", "sardines", "--source", "takeout"]);
    assert!(success);
    assert!(stdout.contains("Shopping"), "stdout={}", stdout);
}

#[test]
fn test_ingest_artifacts() {
    let env = TestEnv::new();
    env.write(
        "artifacts/widget.html",
        "<html><head><title>Tip Calculator</title></head><body><p>Split the bill</p></body></html>",
    );
    env.write("artifacts/plot.py", "import matplotlib\n# plot monthly rainfall\n");
    let dir = env.root().join("artifacts");

    let summary = env.run_json(&["ingest", dir.to_str().unwrap(), "-t", "artifacts", "--json"]);
    assert_eq!(summary["processed_records"], 2);

    let (stdout, _stderr, _) = env.run(&["search", "rainfall"]);
    assert!(stdout.contains("plot.py"), "stdout={}", stdout);
}

#[test]
fn test_search_and_get() {
    let env = TestEnv::new();
    ingest_conversations(&env);

    let (stdout, stderr, success) = env.run(&["search", "tram castle"]);
    assert!(success, "search failed: {}", stderr);
    assert!(stdout.contains("Lisbon trip planning"));
    assert!(!stdout.contains("Sourdough starter"));

    let id = first_result_id(&stdout);
    let (stdout, _stderr, success) = env.run(&["get", &id]);
    assert!(success);
    assert!(stdout.contains("Lisbon trip planning [documents]"), "stdout={}", stdout);
    assert!(stdout.contains(&format!("  id        {}", id)));
    assert!(stdout.contains("== Text =="));
    assert!(stdout.contains("Human: Which tram goes up to the castle in Lisbon?"));
    assert!(stdout.contains("#0 ("));
}

#[test]
fn test_search_punctuation_is_safe() {
    let env = TestEnv::new();
    ingest_conversations(&env);

    let (stdout, stderr, success) = env.run(&["search", "acetone? (AND) \"starter"]);
    assert!(success, "stderr={}", stderr);
    assert!(stdout.contains("Sourdough starter"));
}

#[test]
fn test_search_media_filter() {
    let env = TestEnv::new();
    ingest_conversations(&env);

    let (stdout, _stderr, success) = env.run(&["search", "tram", "--media", "images"]);
    assert!(success);
    assert!(stdout.contains("No results."));

    let (_stdout, stderr, success) = env.run(&["search", "tram", "--media", "podcasts"]);
    assert!(!success);
    assert!(stderr.contains("Unknown media kind"));
}

#[test]
fn test_search_semantic_errors_when_disabled() {
    let env = TestEnv::new();
    let (_stdout, stderr, success) = env.run(&["search", "tram", "--mode", "semantic"]);
    assert!(!success);
    assert!(stderr.contains("requires embeddings"));
}

#[test]
fn test_get_missing_document() {
    let env = TestEnv::new();
    let (_stdout, stderr, success) = env.run(&["get", "00000000-0000-0000-0000-000000000000"]);
    assert!(!success);
    assert!(stderr.contains("document not found"));
}

#[test]
fn test_status_reports_media_and_runs() {
    let env = TestEnv::new();
    ingest_conversations(&env);

    let (stdout, _stderr, success) = env.run(&["status"]);
    assert!(success);
    assert!(stdout.contains("Documents:   2"));
    for kind in ["documents", "audio", "video", "images"] {
        assert!(stdout.contains(kind));
    }
    assert!(stdout.contains("Recent runs:"));
    assert!(stdout.contains("claude"));
}

#[test]
fn test_embed_pending_errors_when_disabled() {
    let env = TestEnv::new();
    let (_stdout, stderr, success) = env.run(&["embed", "pending"]);
    assert!(!success);
    assert!(stderr.contains("disabled"));
}

#[test]
fn test_mcp_config_lists_four_servers() {
    let env = TestEnv::new();
    let value = env.run_json(&["mcp-config"]);
    let servers = value["mcpServers"].as_object().unwrap();
    assert_eq!(servers.len(), 4);
    assert_eq!(servers["takeout-documents"]["command"], "npx");
    assert_eq!(
        servers["takeout-video"]["args"],
        serde_json::json!(["-y", "mcp-remote", "http://localhost:8081/sse"])
    );
}

#[test]
fn test_serve_media_without_key_refuses_to_start() {
    let env = TestEnv::new();
    let (_stdout, stderr, success) = env.run(&["serve", "images", "--port", "0"]);
    assert!(!success);
    assert!(stderr.contains(&format!("{} is not set", TEST_KEY_ENV)), "stderr={}", stderr);
}

#[test]
fn test_serve_unknown_kind() {
    let env = TestEnv::new();
    let (_stdout, stderr, success) = env.run(&["serve", "podcasts"]);
    assert!(!success);
    assert!(stderr.contains("Unknown media kind"));
}

#[test]
fn test_completions() {
    let env = TestEnv::new();
    let (stdout, _stderr, success) = env.run(&["completions", "bash"]);
    assert!(success);
    assert!(stdout.contains("takeout-ingest"));
}
