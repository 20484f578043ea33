//! The read paths: count and fetch.
//!
//! Count sizes each collection with a single metadata-only request (limit 0
//! plus a total-count header). Fetch uses that size to fan out limit/offset
//! page requests concurrently, applies the keep/drop field filters, and
//! either streams records to a local NDJSON file or accumulates them in
//! memory for internal reuse (descriptor bootstrap, truncate id harvesting).

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::uplink::dispatch::{Engine, RunCounters, RunResult};
use crate::uplink::metadata::pluralize;
use crate::uplink::payload::linearize;

/// Field-selection filter applied to every fetched record, top-level keys
/// only. A non-empty keep list wins over the drop list.
pub fn filter_keys(record: &mut Value, keep: &[String], drop: &[String]) {
    if let Some(map) = record.as_object_mut() {
        if !keep.is_empty() {
            map.retain(|key, _| keep.iter().any(|k| k == key));
        } else if !drop.is_empty() {
            map.retain(|key, _| !drop.iter().any(|k| k == key));
        }
    }
}

enum RecordSink {
    File(Arc<Mutex<BufWriter<File>>>),
    Memory(Arc<Mutex<Vec<Value>>>),
}

impl RecordSink {
    fn push(&self, record: &Value) -> io::Result<()> {
        match self {
            RecordSink::File(writer) => {
                // serialize outside the lock; a partial write would leave a
                // broken line in the NDJSON file
                let line = serde_json::to_string(record)
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
                let mut writer = writer.lock();
                writeln!(writer, "{line}")
            }
            RecordSink::Memory(records) => {
                records.lock().push(record.clone());
                Ok(())
            }
        }
    }
}

pub struct Counter {
    engine: Arc<Engine>,
}

impl Counter {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self { engine }
    }

    /// Total record count for one resource, from the total-count response
    /// header of a zero-limit request.
    pub async fn record_count(&self, resource: &str) -> RunResult<Option<u64>> {
        let query = vec![
            ("limit".to_string(), "0".to_string()),
            ("totalCount".to_string(), "true".to_string()),
        ];
        let response = self.engine.api.get_collection(resource, &query).await?;
        let status = response.status();
        if !status.is_success() {
            warn!(
                "unable to load count for {resource}... {} API response",
                status.as_u16()
            );
            return Ok(None);
        }
        let total = response
            .headers()
            .get("total-count")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());
        if total.is_none() {
            warn!("unable to load count for {resource}... no total-count header");
        }
        Ok(total)
    }

    /// Counts every selected resource, preserving dependency order.
    pub async fn counts(&self) -> RunResult<Vec<(String, u64)>> {
        let mut rows = Vec::new();
        for resource in &self.engine.resources {
            if let Some(total) = self.record_count(resource).await? {
                rows.push((resource.clone(), total));
            }
        }
        Ok(rows)
    }

    /// The count operation: rows to the results file when configured,
    /// otherwise to stdout (console output hides empty collections).
    pub async fn count(&self, results_file: Option<&std::path::Path>) -> RunResult<()> {
        let rows = self.counts().await?;
        let separator = &self.engine.config.count.separator;
        match results_file {
            Some(path) => {
                if let Some(parent) = path.parent() {
                    if !parent.as_os_str().is_empty() {
                        std::fs::create_dir_all(parent)?;
                    }
                }
                let mut out = BufWriter::new(File::create(path)?);
                writeln!(out, "Records{separator}Resource")?;
                for (resource, total) in &rows {
                    writeln!(out, "{total}{separator}{resource}")?;
                }
                out.flush()?;
            }
            None => {
                println!("Records{separator}Resource");
                for (resource, total) in &rows {
                    if *total > 0 {
                        println!("{total}{separator}{resource}");
                    }
                }
            }
        }
        Ok(())
    }
}

/// Pending referenced-record lookups, deduplicated by (resource, key tuple).
type ReferenceSet = Arc<DashMap<(String, String), BTreeMap<String, String>>>;

pub struct Fetcher {
    engine: Arc<Engine>,
}

impl Fetcher {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self { engine }
    }

    /// The fetch operation: page every selected resource into
    /// `<data_dir>/<resource>.jsonl`, then optionally chase references.
    pub async fn fetch(&self) -> RunResult<()> {
        std::fs::create_dir_all(&self.engine.config.data_dir)?;
        let references: ReferenceSet = Arc::new(DashMap::new());

        for resource in &self.engine.resources {
            info!("fetching records for {resource} ...");
            let path = self.engine.config.data_dir.join(format!("{resource}.jsonl"));
            let writer = Arc::new(Mutex::new(BufWriter::new(File::create(&path)?)));
            let counters = self.engine.counters();
            let collector = self
                .engine
                .config
                .fetch
                .follow_references
                .then(|| references.clone());
            self.fetch_resource(
                resource,
                RecordSink::File(writer.clone()),
                &self.engine.keep_keys,
                &self.engine.drop_keys,
                collector,
                &counters,
            )
            .await?;
            writer.lock().flush()?;
            self.engine.finish_resource(resource, &counters)?;
        }

        if self.engine.config.fetch.follow_references {
            self.follow_references(references).await?;
        }
        Ok(())
    }

    /// Fetches one resource entirely into memory; used internally when the
    /// records are inputs to another operation rather than outputs.
    pub async fn collect(
        &self,
        resource: &str,
        keep: &[String],
        drop: &[String],
    ) -> RunResult<Vec<Value>> {
        let records = Arc::new(Mutex::new(Vec::new()));
        let counters = Arc::new(RunCounters::new(0));
        self.fetch_resource(
            resource,
            RecordSink::Memory(records.clone()),
            keep,
            drop,
            None,
            &counters,
        )
        .await?;
        let records = std::mem::take(&mut *records.lock());
        Ok(records)
    }

    async fn fetch_resource(
        &self,
        resource: &str,
        sink: RecordSink,
        keep: &[String],
        drop: &[String],
        references: Option<ReferenceSet>,
        counters: &Arc<RunCounters>,
    ) -> RunResult<()> {
        let limit = self.engine.config.fetch.page_size.max(1) as u64;
        let total = Counter::new(self.engine.clone())
            .record_count(resource)
            .await?
            .unwrap_or(0);
        let pages = total.div_ceil(limit);
        debug!("{resource}: {total} records across {pages} page(s)");

        let sink = Arc::new(sink);
        let mut pool = self.engine.pool();
        for page in 0..pages {
            let engine = self.engine.clone();
            let resource = resource.to_string();
            let sink = sink.clone();
            let counters = counters.clone();
            let keep = keep.to_vec();
            let drop = drop.to_vec();
            let references = references.clone();
            pool.spawn(async move {
                fetch_page(
                    engine,
                    resource,
                    sink,
                    keep,
                    drop,
                    references,
                    counters,
                    limit,
                    page * limit,
                )
                .await;
            });
        }
        pool.drain(counters, total as usize).await;
        Ok(())
    }

    /// Breadth-first chase of `*Reference` objects discovered during fetch,
    /// bounded by the configured depth and deduplicated by key tuple.
    async fn follow_references(&self, references: ReferenceSet) -> RunResult<()> {
        let mut writers: HashMap<String, BufWriter<File>> = HashMap::new();
        let mut queue: VecDeque<(String, BTreeMap<String, String>, usize)> = references
            .iter()
            .map(|e| (e.key().0.clone(), e.value().clone(), 1))
            .collect();

        while let Some((resource, params, depth)) = queue.pop_front() {
            if self.engine.meta.dependency_rank(&resource).is_none() {
                continue;
            }
            let query: Vec<(String, String)> =
                params.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
            let response = self.engine.api.get_collection(&resource, &query).await?;
            if !response.status().is_success() {
                warn!(
                    "reference lookup on {resource} returned {}",
                    response.status().as_u16()
                );
                continue;
            }
            let records: Vec<Value> = response.json().await.unwrap_or_default();

            let writer = match writers.entry(resource.clone()) {
                std::collections::hash_map::Entry::Occupied(e) => e.into_mut(),
                std::collections::hash_map::Entry::Vacant(e) => {
                    let path = self.engine.config.data_dir.join(format!("{resource}.jsonl"));
                    let file = OpenOptions::new().create(true).append(true).open(&path)?;
                    e.insert(BufWriter::new(file))
                }
            };
            for mut record in records {
                if depth < self.engine.config.fetch.max_reference_depth {
                    let nested = collect_references(&record);
                    for (child_resource, child_params) in nested {
                        let key = (child_resource.clone(), reference_key(&child_params));
                        if references
                            .insert(key, child_params.clone())
                            .is_none()
                        {
                            queue.push_back((child_resource, child_params, depth + 1));
                        }
                    }
                }
                filter_keys(&mut record, &self.engine.keep_keys, &self.engine.drop_keys);
                if let Ok(line) = serde_json::to_string(&record) {
                    writeln!(writer, "{line}")?;
                }
            }
        }
        for (_, mut writer) in writers {
            writer.flush()?;
        }
        Ok(())
    }
}

#[allow(clippy::too_many_arguments)]
async fn fetch_page(
    engine: Arc<Engine>,
    resource: String,
    sink: Arc<RecordSink>,
    keep: Vec<String>,
    drop: Vec<String>,
    references: Option<ReferenceSet>,
    counters: Arc<RunCounters>,
    limit: u64,
    offset: u64,
) {
    let query = vec![
        ("limit".to_string(), limit.to_string()),
        ("offset".to_string(), offset.to_string()),
    ];
    match engine.api.get_collection(&resource, &query).await {
        Ok(response) => {
            let status = response.status().as_u16();
            if !(200..300).contains(&status) {
                let body = response.text().await.unwrap_or_default();
                counters.increment_status(status);
                counters.record_failure(
                    status,
                    linearize(&body),
                    resource.clone(),
                    (offset / limit.max(1)) as usize + 1,
                );
                return;
            }
            let records: Vec<Value> = match response.json().await {
                Ok(records) => records,
                Err(_) => {
                    warn!("unable to load records for {resource}... response was not a JSON list");
                    return;
                }
            };
            for mut record in records {
                if let Some(references) = &references {
                    for (ref_resource, params) in collect_references(&record) {
                        references.insert((ref_resource, reference_key(&params)), params);
                    }
                }
                filter_keys(&mut record, &keep, &drop);
                match sink.push(&record) {
                    Ok(()) => {
                        counters.increment_status(status);
                        counters.mark_succeeded();
                    }
                    Err(e) => {
                        counters.record_failure(
                            0,
                            e.to_string(),
                            resource.clone(),
                            (offset / limit.max(1)) as usize + 1,
                        );
                    }
                }
            }
        }
        Err(e) => {
            counters.record_failure(
                0,
                e.to_string(),
                resource.clone(),
                (offset / limit.max(1)) as usize + 1,
            );
        }
    }
}

fn reference_key(params: &BTreeMap<String, String>) -> String {
    serde_json::to_string(params).unwrap_or_default()
}

/// Finds every `*Reference` object in a record (recursively) and maps it to
/// the referenced resource plus the identity values the reference carries.
/// The API's `link` metadata is not part of the identity.
pub fn collect_references(record: &Value) -> Vec<(String, BTreeMap<String, String>)> {
    let mut found = Vec::new();
    walk_references(record, &mut found);
    found
}

fn walk_references(value: &Value, found: &mut Vec<(String, BTreeMap<String, String>)>) {
    match value {
        Value::Object(map) => {
            for (key, child) in map {
                if let Some(stem) = key.strip_suffix("Reference") {
                    if let Some(object) = child.as_object() {
                        let mut params = BTreeMap::new();
                        for (field, field_value) in object {
                            if field == "link" {
                                continue;
                            }
                            match field_value {
                                Value::String(s) => {
                                    params.insert(field.clone(), s.clone());
                                }
                                Value::Number(n) => {
                                    params.insert(field.clone(), n.to_string());
                                }
                                Value::Bool(b) => {
                                    params.insert(field.clone(), b.to_string());
                                }
                                _ => {}
                            }
                        }
                        if !params.is_empty() {
                            found.push((pluralize(stem), params));
                        }
                    }
                }
                walk_references(child, found);
            }
        }
        Value::Array(items) => {
            for item in items {
                walk_references(item, found);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn keep_keys_win_over_drop_keys() {
        let mut record = json!({"id": "abc", "name": "x", "_etag": "123"});
        filter_keys(
            &mut record,
            &["id".to_string()],
            &["name".to_string()],
        );
        assert_eq!(record, json!({"id": "abc"}));
    }

    #[test]
    fn drop_keys_remove_metadata_fields() {
        let mut record = json!({"id": "abc", "name": "x", "_etag": "123"});
        filter_keys(&mut record, &[], &["_etag".to_string(), "id".to_string()]);
        assert_eq!(record, json!({"name": "x"}));
    }

    #[test]
    fn file_sink_write_errors_surface() {
        // a file opened read-only rejects writes; zero buffering makes the
        // failure show up on push instead of at flush
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.jsonl");
        std::fs::write(&path, "").unwrap();
        let file = File::open(&path).unwrap();
        let sink = RecordSink::File(Arc::new(Mutex::new(BufWriter::with_capacity(0, file))));
        assert!(sink.push(&json!({"id": "abc"})).is_err());

        let records = Arc::new(Mutex::new(Vec::new()));
        let sink = RecordSink::Memory(records.clone());
        sink.push(&json!({"id": "abc"})).unwrap();
        assert_eq!(records.lock().len(), 1);
    }

    #[test]
    fn references_are_collected_recursively() {
        let record = json!({
            "studentReference": {"studentUniqueId": "604821", "link": {"rel": "Student"}},
            "schoolReference": {"schoolId": 255901},
            "terms": [
                {"schoolYearTypeReference": {"schoolYear": 2026}}
            ]
        });
        let mut refs = collect_references(&record);
        refs.sort();
        assert_eq!(refs.len(), 3);
        assert_eq!(refs[0].0, "schoolYearTypes");
        assert_eq!(refs[1].0, "schools");
        assert_eq!(refs[2].0, "students");
        assert_eq!(refs[2].1["studentUniqueId"], "604821");
        assert!(!refs[2].1.contains_key("link"));
    }
}
