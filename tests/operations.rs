//! Delete, count, fetch, and validate runs against a mock API.

mod common;

use std::fs;
use std::sync::Arc;

use serde_json::json;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, ResponseTemplate};

use common::{engine, mount_token, rig, write_data_file};
use uplink::delete::Deleter;
use uplink::fetch::{Counter, Fetcher};
use uplink::hashlog::{ChangeLog, LogEntry};
use uplink::payload::fingerprint;
use uplink::truncate::Truncator;
use uplink::validate::Validator;

#[tokio::test]
async fn delete_removes_exact_matches_and_skips_ambiguous_ones() {
    let rig = rig().await;
    mount_token(&rig.server, "t1").await;
    write_data_file(
        rig.data_dir.path(),
        "schools.jsonl",
        &[
            r#"{"schoolId": 1, "nameOfInstitution": "Duplicated School"}"#,
            r#"{"schoolId": 2, "nameOfInstitution": "Unique School"}"#,
        ],
    );

    // schoolId 1 matches two server records, schoolId 2 exactly one
    Mock::given(method("GET"))
        .and(path("/data/v3/ed-fi/schools"))
        .and(query_param("schoolId", "1"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!([{"id": "aaa"}, {"id": "bbb"}])),
        )
        .mount(&rig.server)
        .await;
    Mock::given(method("GET"))
        .and(path("/data/v3/ed-fi/schools"))
        .and(query_param("schoolId", "2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([{"id": "xyz"}])))
        .mount(&rig.server)
        .await;
    Mock::given(method("DELETE"))
        .and(path("/data/v3/ed-fi/schools/xyz"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&rig.server)
        .await;

    let engine = Arc::new(engine(&rig, "delete", "*", "[run]\nforce_delete = true\n").await);
    Deleter::new(engine.clone()).delete().await.unwrap();

    let totals = engine.reporter.totals();
    assert_eq!(totals.processed, 1);
    assert_eq!(totals.skipped, 1);
    assert_eq!(totals.failed, 0);
}

#[tokio::test]
async fn count_reads_the_total_count_header_in_dependency_order() {
    let rig = rig().await;
    mount_token(&rig.server, "t1").await;

    Mock::given(method("GET"))
        .and(path("/data/v3/ed-fi/schools"))
        .and(query_param("limit", "0"))
        .and(query_param("totalCount", "true"))
        .respond_with(ResponseTemplate::new(200).insert_header("Total-Count", "42"))
        .mount(&rig.server)
        .await;
    Mock::given(method("GET"))
        .and(path("/data/v3/ed-fi/students"))
        .and(query_param("limit", "0"))
        .and(query_param("totalCount", "true"))
        .respond_with(ResponseTemplate::new(200).insert_header("Total-Count", "7"))
        .mount(&rig.server)
        .await;

    let engine = Arc::new(engine(&rig, "count", "students,schools", "").await);
    let rows = Counter::new(engine).counts().await.unwrap();

    // selector order does not matter, dependency order does
    assert_eq!(
        rows,
        vec![("schools".to_string(), 42), ("students".to_string(), 7)]
    );
}

#[tokio::test]
async fn fetch_pages_records_into_a_local_file() {
    let rig = rig().await;
    mount_token(&rig.server, "t1").await;

    Mock::given(method("GET"))
        .and(path("/data/v3/ed-fi/schools"))
        .and(query_param("limit", "0"))
        .and(query_param("totalCount", "true"))
        .respond_with(ResponseTemplate::new(200).insert_header("Total-Count", "2"))
        .mount(&rig.server)
        .await;
    Mock::given(method("GET"))
        .and(path("/data/v3/ed-fi/schools"))
        .and(query_param("limit", "500"))
        .and(query_param("offset", "0"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            {"schoolId": 1, "nameOfInstitution": "A", "_etag": "abc"},
            {"schoolId": 2, "nameOfInstitution": "B", "_etag": "def"},
        ])))
        .expect(1)
        .mount(&rig.server)
        .await;

    let mut engine = engine(&rig, "fetch", "schools", "").await;
    engine.drop_keys = vec!["_etag".to_string()];
    let engine = Arc::new(engine);
    Fetcher::new(engine.clone()).fetch().await.unwrap();

    let written = fs::read_to_string(rig.data_dir.path().join("schools.jsonl")).unwrap();
    let lines: Vec<&str> = written.lines().collect();
    assert_eq!(lines.len(), 2);
    assert!(!written.contains("_etag"));
    assert!(written.contains("nameOfInstitution"));

    let totals = engine.reporter.totals();
    assert_eq!(totals.processed, 2);
}

#[tokio::test]
async fn truncate_deletes_every_remote_record_and_clears_the_log() {
    let rig = rig().await;
    mount_token(&rig.server, "t1").await;

    // a leftover change-log entry from an earlier send must not survive
    let changelog = ChangeLog::load(rig.state_dir.path(), "schools").unwrap();
    changelog.record(
        fingerprint(r#"{"schoolId": 9, "nameOfInstitution": "Old"}"#),
        LogEntry {
            last_sent: 1,
            status: 201,
        },
    );
    changelog.save().unwrap();

    Mock::given(method("GET"))
        .and(path("/data/v3/ed-fi/schools"))
        .and(query_param("limit", "0"))
        .and(query_param("totalCount", "true"))
        .respond_with(ResponseTemplate::new(200).insert_header("Total-Count", "2"))
        .mount(&rig.server)
        .await;
    Mock::given(method("GET"))
        .and(path("/data/v3/ed-fi/schools"))
        .and(query_param("limit", "500"))
        .and(query_param("offset", "0"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!([{"id": "aaa"}, {"id": "bbb"}])),
        )
        .mount(&rig.server)
        .await;
    Mock::given(method("DELETE"))
        .and(path("/data/v3/ed-fi/schools/aaa"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&rig.server)
        .await;
    Mock::given(method("DELETE"))
        .and(path("/data/v3/ed-fi/schools/bbb"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&rig.server)
        .await;

    let engine = Arc::new(engine(&rig, "truncate", "schools", "[run]\nforce_delete = true\n").await);
    Truncator::new(engine.clone()).truncate().await.unwrap();

    let totals = engine.reporter.totals();
    assert_eq!(totals.processed, 2);
    assert_eq!(totals.failed, 0);

    let changelog = ChangeLog::load(rig.state_dir.path(), "schools").unwrap();
    assert!(changelog.is_empty());
}

#[tokio::test]
async fn validate_flags_bad_json_schema_violations_and_duplicates() {
    let rig = rig().await;
    mount_token(&rig.server, "t1").await;
    write_data_file(
        rig.data_dir.path(),
        "schools.jsonl",
        &[
            r#"{"schoolId": 1, "nameOfInstitution": "Grand Bend High School"}"#,
            r#"{"schoolId": 1, "nameOfInstitution": "Grand Bend High School"}"#,
            r#"{"schoolId": 2}"#,
            r#"not json {"#,
        ],
    );

    let engine = Arc::new(
        engine(
            &rig,
            "validate",
            "*",
            "[validate]\nchecks = [\"json\", \"schema\", \"uniqueness\"]\n",
        )
        .await,
    );
    let validator = Validator::build(engine.clone()).await.unwrap();
    validator.validate().await.unwrap();

    let totals = engine.reporter.totals();
    assert_eq!(totals.processed, 1);
    assert_eq!(totals.failed, 3);
    assert_eq!(totals.skipped, 0);
}
