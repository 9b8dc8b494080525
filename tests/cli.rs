mod common;

use common::{catalog_path, seeded_db_file};
use std::path::Path;
use std::process::{Command, Output};

fn course_metrics(db: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_course-metrics"))
        .args(args)
        .arg("--db")
        .arg(db)
        .arg("--metrics")
        .arg(catalog_path())
        .env_remove("COURSE_METRICS_LOG_DIR")
        .env_remove("LLAMA_API_BASE")
        .env_remove("LLAMA_API_KEY")
        .env("RUST_LOG", "off")
        .output()
        .expect("run course-metrics")
}

#[test]
fn answer_goes_to_stdout_and_trailer_to_stderr() {
    let (_dir, db) = seeded_db_file();
    let output = course_metrics(&db, &["ask", "--rules-only", "How many students are enrolled?"]);
    assert!(output.status.success());
    assert_eq!(String::from_utf8_lossy(&output.stdout).trim(), "8");

    let trailer: serde_json::Value = serde_json::from_slice(&output.stderr).expect("trailer json");
    assert_eq!(trailer["metric"], "enrollment_count");
    assert_eq!(trailer["source"], "rules");
    assert_eq!(trailer["params"], serde_json::json!({}));
}

#[test]
fn unquoted_question_words_are_joined() {
    let (_dir, db) = seeded_db_file();
    let output = course_metrics(
        &db,
        &["ask", "--rules-only", "What", "is", "student", "7's", "average", "score?"],
    );
    assert!(output.status.success());
    assert_eq!(String::from_utf8_lossy(&output.stdout).trim(), "71");
}

#[test]
fn unanswerable_and_query_errors_are_distinct() {
    let (_dir, db) = seeded_db_file();
    let unanswerable = course_metrics(&db, &["ask", "--rules-only", "What's the weather like?"]);
    assert_eq!(unanswerable.status.code(), Some(2));
    assert!(unanswerable.stdout.is_empty());
    assert!(String::from_utf8_lossy(&unanswerable.stderr).contains("Could not understand the question"));

    let unresolved = course_metrics(
        &db,
        &["ask", "--rules-only", "How many students completed module Advanced Basket Weaving?"],
    );
    assert_eq!(unresolved.status.code(), Some(2));
    assert!(String::from_utf8_lossy(&unresolved.stderr).contains("Could not resolve"));

    let empty_db = db.with_file_name("empty.db");
    rusqlite::Connection::open(&empty_db)
        .and_then(|conn| conn.execute_batch("CREATE TABLE unrelated (x INTEGER);"))
        .expect("empty db");
    let broken = course_metrics(&empty_db, &["ask", "--rules-only", "How many students are enrolled?"]);
    assert_eq!(broken.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&broken.stderr);
    assert!(stderr.contains("Database/query error"));
    assert!(!stderr.contains("Could not understand"));
}

#[test]
fn broken_registry_is_a_setup_error() {
    let (dir, db) = seeded_db_file();
    let registry = dir.path().join("metrics.json");
    std::fs::write(
        &registry,
        r#"[{"name": "bad", "params": [], "sql": "SELECT COUNT(*) FROM students WHERE student_id = :student_id"}]"#,
    )
    .expect("write registry");

    let output = Command::new(env!("CARGO_BIN_EXE_course-metrics"))
        .args(["ask", "--rules-only", "How many students are enrolled?"])
        .arg("--db")
        .arg(&db)
        .arg("--metrics")
        .arg(&registry)
        .env("RUST_LOG", "off")
        .output()
        .expect("run course-metrics");
    assert_eq!(output.status.code(), Some(3));
    assert!(String::from_utf8_lossy(&output.stderr).contains("REGISTRY_PLACEHOLDER_MISMATCH"));
}

#[test]
fn metrics_listing_shows_signatures_not_sql() {
    let (_dir, db) = seeded_db_file();
    let output = course_metrics(&db, &["metrics"]);
    assert!(output.status.success());
    let listing = String::from_utf8_lossy(&output.stdout);
    assert!(listing.contains("- module_completions_since(module_id: module_id, since: date)"));
    assert!(!listing.contains("SELECT"));
}

#[test]
fn feedback_module_prints_json_report() {
    let (_dir, db) = seeded_db_file();
    let output = course_metrics(&db, &["feedback-module", "1", "--no-insights"]);
    assert!(output.status.success());
    let report: serde_json::Value = serde_json::from_slice(&output.stdout).expect("report json");
    assert_eq!(report["module_name"], "Foundations of Education");
    assert_eq!(report["quantitative"]["count"], 5);
    assert_eq!(report["comments"].as_array().map(Vec::len), Some(3));
    assert!(report.get("insights").is_none());
}
