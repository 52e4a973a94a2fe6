use serde_json::json;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn fpub_binary() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_fpub"))
}

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let store = tmp.path().join("data/publish.sqlite");
    let config_path = write_config(tmp.path(), &store);
    (tmp, config_path)
}

fn write_config(root: &Path, store: &Path) -> PathBuf {
    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();
    fs::create_dir_all(root.join("projects")).unwrap();

    let config_content = format!(
        r#"[store]
path = "{store}"

[publish]
root = "{root}/projects"
user = "ana"
host_error_trigger = "FPUB_FATAL"

[contractors.local.inline]
executable = "{exe}"
"#,
        store = store.display(),
        root = root.display(),
        exe = fpub_binary().display(),
    );

    let config_path = config_dir.join("fpub.toml");
    fs::write(&config_path, config_content).unwrap();
    config_path
}

fn write_manifest(dir: &Path, contractor: Option<&str>, members: &[&str]) -> PathBuf {
    let mut instance = json!({
        "name": "modelDefault",
        "family": "model",
        "members": members,
        "representations": [{
            "name": "Metadata",
            "func": "write_json",
            "kwargs": { "filename": "meta.json", "content": { "polys": 1200 } }
        }]
    });
    if let Some(c) = contractor {
        instance["contractor"] = json!(c);
    }
    let manifest = json!({
        "project": "show",
        "asset": "chair",
        "instances": [instance],
    });
    let path = dir.join("chair.publish.json");
    fs::write(&path, manifest.to_string()).unwrap();
    path
}

fn run_fpub(config_path: &Path, args: &[&str]) -> (String, String, Option<i32>) {
    let binary = fpub_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .env("FPUB_LOG", "warn")
        .output()
        .unwrap_or_else(|e| panic!("Failed to run fpub binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (stdout, stderr, output.status.code())
}

#[test]
fn test_init_creates_store() {
    let (tmp, config) = setup_test_env();
    let (stdout, _, code) = run_fpub(&config, &["init"]);
    assert_eq!(code, Some(0));
    assert!(stdout.contains("Store initialized"));
    assert!(tmp.path().join("data/publish.sqlite").exists());

    // Idempotent
    let (_, _, code) = run_fpub(&config, &["init"]);
    assert_eq!(code, Some(0));
}

#[test]
fn test_local_publish_and_versions() {
    let (tmp, config) = setup_test_env();
    let manifest = write_manifest(tmp.path(), None, &["|chair_GEO"]);

    let (stdout, stderr, code) = run_fpub(
        &config,
        &["publish", manifest.to_str().unwrap(), "--comment", "first pass"],
    );
    assert_eq!(code, Some(0), "stderr: {}", stderr);
    assert!(stdout.contains("done"));
    assert!(stdout.contains("modelDefault v001"));
    assert!(tmp
        .path()
        .join("projects/show/chair/publish/modelDefault/v001/Metadata/meta.json")
        .is_file());

    let (stdout, _, code) = run_fpub(&config, &["versions", "show", "chair", "modelDefault"]);
    assert_eq!(code, Some(0));
    assert!(stdout.contains("v001  ana"));
    assert!(!stdout.contains("pending"));
}

#[test]
fn test_validation_failure_exit_code_and_trigger() {
    let (tmp, config) = setup_test_env();
    let manifest = write_manifest(tmp.path(), None, &[]);

    let (_, stderr, code) = run_fpub(&config, &["publish", manifest.to_str().unwrap()]);
    assert_eq!(code, Some(3));
    assert!(stderr.contains("FPUB_FATAL: validation failure"));
    assert!(stderr.contains("has no members"));
}

#[test]
fn test_delegated_publish_through_local_contractor() {
    let (tmp, config) = setup_test_env();
    let manifest = write_manifest(tmp.path(), Some("inline"), &["|chair_GEO"]);

    let (stdout, stderr, code) = run_fpub(&config, &["publish", manifest.to_str().unwrap()]);
    assert_eq!(code, Some(0), "stderr: {}", stderr);
    assert!(stdout.contains("delegated"));
    assert!(stdout.contains("context dump:"));
    assert!(stdout.contains("inline Extraction job local-"));
    assert!(stdout.contains("inline Integration job local-"));

    // The contractor's resume steps integrated the version.
    assert!(tmp
        .path()
        .join("projects/show/chair/publish/modelDefault/v001/Metadata/meta.json")
        .is_file());
    let (stdout, _, _) = run_fpub(&config, &["versions", "show", "chair", "modelDefault"]);
    assert!(stdout.contains("v001"));
    assert!(!stdout.contains("pending"));

    let (stdout, _, code) = run_fpub(&config, &["dumps"]);
    assert_eq!(code, Some(0));
    assert!(stdout.contains("by ana  [extracted]"));
    assert!(stdout.contains("modelDefault v001"));
}

#[test]
fn test_resume_rejects_unknown_dump() {
    let (tmp, config) = setup_test_env();
    let bogus = tmp.path().join("notes.json");
    fs::write(&bogus, "{}").unwrap();

    let (_, stderr, code) = run_fpub(&config, &["resume", bogus.to_str().unwrap()]);
    assert_eq!(code, Some(6));
    assert!(stderr.contains("neither an instance dump nor a context dump"));
}

#[test]
fn test_extract_without_dump_fails() {
    let (tmp, config) = setup_test_env();
    let stage = tmp.path().join("stage");
    fs::create_dir_all(&stage).unwrap();

    let (_, stderr, code) = run_fpub(&config, &["extract", stage.to_str().unwrap()]);
    assert_eq!(code, Some(6));
    assert!(stderr.contains("cannot read dump"));
}

#[test]
fn test_missing_config_fails() {
    let (_, stderr, code) = run_fpub(Path::new("/definitely/not/fpub.toml"), &["dumps"]);
    assert_eq!(code, Some(1));
    assert!(stderr.contains("Failed to read config file"));
}

#[test]
fn test_resume_with_unusable_store_is_resume_failure() {
    let tmp = TempDir::new().unwrap();
    // A plain file where the store directory should be.
    let blocker = tmp.path().join("blocker");
    fs::write(&blocker, "not a directory").unwrap();
    let config = write_config(tmp.path(), &blocker.join("publish.sqlite"));
    let dump = tmp.path().join("projects/dumps/.context.ana.x.json");

    let (_, stderr, code) = run_fpub(&config, &["resume", dump.to_str().unwrap()]);
    assert_eq!(code, Some(6));
    assert!(stderr.contains("FPUB_FATAL: resume failure"));
    assert!(stderr.contains("Failed to create store directory"));

    // Outside resume the same failure is internal, and still signalled.
    let (_, stderr, code) = run_fpub(&config, &["versions", "show", "chair", "modelDefault"]);
    assert_eq!(code, Some(1));
    assert!(stderr.contains("FPUB_FATAL: internal error"));
}

#[test]
fn test_resume_with_missing_config_is_resume_failure() {
    let tmp = TempDir::new().unwrap();
    let (_, stderr, code) = run_fpub(
        &tmp.path().join("absent.toml"),
        &["resume", "/nowhere/.instance.json"],
    );
    assert_eq!(code, Some(6));
    assert!(stderr.contains("Failed to read config file"));
}
