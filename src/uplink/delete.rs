//! The delete operation: remove previously-sent payloads from the API.
//!
//! Deletion walks the working set in reverse dependency order so dependents
//! go before the resources they reference. Each local payload is resolved to
//! a server id first (an identity search for regular resources, a local
//! match on namespace and code value for descriptors) and only an exact
//! single match is deleted; everything else is skipped with a reason.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::sync::Arc;

use dialoguer::Confirm;
use serde_json::Value;
use tracing::{info, warn};

use crate::uplink::api::ApiClient;
use crate::uplink::directory;
use crate::uplink::dispatch::{Engine, MAX_TASK_QUEUE_SIZE, RunCounters, RunError, RunResult};
use crate::uplink::fetch::Fetcher;
use crate::uplink::hashlog::ChangeLog;
use crate::uplink::metadata::is_descriptor;
use crate::uplink::payload::{Payload, interpolate_params, linearize};

/// Deleting student records cascades through enrollment and assessment data
/// on the server side; it is never done from local payload files.
const PROTECTED_RESOURCES: &[&str] = &["students"];

pub struct Deleter {
    engine: Arc<Engine>,
}

impl Deleter {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self { engine }
    }

    pub async fn delete(&self) -> RunResult<()> {
        let mut resources = directory::with_local_data(
            &self.engine.config.data_dir,
            &self.engine.resources,
        )?;
        resources.retain(|resource| {
            if PROTECTED_RESOURCES.contains(&resource.as_str()) {
                warn!("refusing to delete {resource}; remove them through the API directly");
                false
            } else {
                true
            }
        });
        if resources.is_empty() {
            info!("nothing to delete");
            return Ok(());
        }
        resources.reverse();
        self.confirm(&resources)?;

        for resource in &resources {
            info!("deleting local payloads from {resource} ...");
            if is_descriptor(resource) {
                self.delete_descriptors(resource).await?;
            } else {
                self.delete_resource(resource).await?;
            }
        }
        Ok(())
    }

    fn confirm(&self, resources: &[String]) -> RunResult<()> {
        if self.engine.config.run.force_delete {
            return Ok(());
        }
        let confirmed = Confirm::new()
            .with_prompt(format!(
                "Delete every local payload from {} resource(s) ({}) on the API?",
                resources.len(),
                resources.join(", ")
            ))
            .default(false)
            .interact()
            .unwrap_or(false);
        if confirmed {
            Ok(())
        } else {
            Err(RunError::NotConfirmed)
        }
    }

    /// Regular resources: one identity search per payload, then a delete of
    /// the single matching record.
    async fn delete_resource(&self, resource: &str) -> RunResult<()> {
        let changelog = Arc::new(ChangeLog::load(&self.engine.config.state_dir, resource)?);
        let identity = Arc::new(self.engine.meta.identity_fields(resource)?);
        let counters = self.engine.counters();
        let mut pool = self.engine.pool();
        let mut total = 0usize;

        'files: for file in directory::data_files_for(&self.engine.config.data_dir, resource) {
            let reader = BufReader::new(File::open(&file)?);
            for (index, line) in reader.lines().enumerate() {
                let line = line?;
                let data = line.trim();
                if data.is_empty() {
                    continue;
                }
                total += 1;

                pool.spawn(delete_payload(
                    self.engine.api.clone(),
                    resource.to_string(),
                    identity.clone(),
                    Payload::new(file.clone(), index + 1, data.to_string()),
                    counters.clone(),
                    changelog.clone(),
                ));

                if total % MAX_TASK_QUEUE_SIZE == 0 {
                    pool.drain(&counters, total).await;
                }
                if counters.aborted() {
                    break 'files;
                }
            }
        }
        pool.drain(&counters, total).await;

        changelog.save()?;
        self.engine.finish_resource(resource, &counters)
    }

    /// Descriptors: the whole collection is small, so it is fetched once and
    /// payloads are matched locally by namespace and code value instead of
    /// searched one by one.
    async fn delete_descriptors(&self, resource: &str) -> RunResult<()> {
        let changelog = Arc::new(ChangeLog::load(&self.engine.config.state_dir, resource)?);
        let records = Fetcher::new(self.engine.clone())
            .collect(resource, &[], &[])
            .await?;

        let mut index: HashMap<(String, String), Vec<String>> = HashMap::new();
        for record in &records {
            let (Some(namespace), Some(code_value), Some(id)) = (
                record.get("namespace").and_then(Value::as_str),
                record.get("codeValue").and_then(Value::as_str),
                record.get("id").and_then(Value::as_str),
            ) else {
                continue;
            };
            index
                .entry((namespace.to_string(), code_value.to_string()))
                .or_default()
                .push(id.to_string());
        }

        let counters = self.engine.counters();
        let mut pool = self.engine.pool();
        let mut total = 0usize;

        'files: for file in directory::data_files_for(&self.engine.config.data_dir, resource) {
            let reader = BufReader::new(File::open(&file)?);
            for (index_in_file, line) in reader.lines().enumerate() {
                let line = line?;
                let data = line.trim();
                if data.is_empty() {
                    continue;
                }
                total += 1;
                let payload = Payload::new(file.clone(), index_in_file + 1, data.to_string());

                let parsed: Value = match serde_json::from_str(&payload.data) {
                    Ok(parsed) => parsed,
                    Err(e) => {
                        counters.record_failure(0, e.to_string(), payload.file_name(), payload.line);
                        continue;
                    }
                };
                let key = (
                    parsed
                        .get("namespace")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    parsed
                        .get("codeValue")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                );
                match index.get(&key).map(Vec::as_slice) {
                    None | Some([]) => counters.skip_with_reason("payload not found in API"),
                    Some([id]) => {
                        let id = id.clone();
                        let api = self.engine.api.clone();
                        let resource = resource.to_string();
                        let counters = counters.clone();
                        let changelog = changelog.clone();
                        pool.spawn(async move {
                            if counters.aborted() {
                                counters.skip_with_reason("run aborted after too many failures");
                                return;
                            }
                            let deleted = delete_record_by_id(
                                &api,
                                &resource,
                                &id,
                                &counters,
                                payload.file_name(),
                                payload.line,
                            )
                            .await;
                            if deleted {
                                changelog.remove(&payload.fingerprint);
                            }
                        });
                    }
                    Some(_) => {
                        counters.skip_with_reason("multiple matching payloads found in API")
                    }
                }

                if total % MAX_TASK_QUEUE_SIZE == 0 {
                    pool.drain(&counters, total).await;
                }
                if counters.aborted() {
                    break 'files;
                }
            }
        }
        pool.drain(&counters, total).await;

        changelog.save()?;
        self.engine.finish_resource(resource, &counters)
    }
}

/// Searches the API for the payload's identity values and deletes the record
/// when exactly one matches.
async fn delete_payload(
    api: Arc<ApiClient>,
    resource: String,
    identity: Arc<std::collections::BTreeMap<String, String>>,
    payload: Payload,
    counters: Arc<RunCounters>,
    changelog: Arc<ChangeLog>,
) {
    if counters.aborted() {
        counters.skip_with_reason("run aborted after too many failures");
        return;
    }
    let parsed: Value = match serde_json::from_str(&payload.data) {
        Ok(parsed) => parsed,
        Err(e) => {
            counters.record_failure(0, e.to_string(), payload.file_name(), payload.line);
            return;
        }
    };
    let params = match interpolate_params(&identity, &parsed) {
        Ok(params) => params,
        Err(e) => {
            counters.record_failure(0, e.to_string(), payload.file_name(), payload.line);
            return;
        }
    };
    let query: Vec<(String, String)> = params.into_iter().collect();

    let records: Vec<Value> = match api.get_collection(&resource, &query).await {
        Ok(response) => {
            let status = response.status().as_u16();
            if !(200..300).contains(&status) {
                counters.skip_with_reason(&format!(
                    "searching API for payload returned a {status} response"
                ));
                return;
            }
            response.json().await.unwrap_or_default()
        }
        Err(e) => {
            counters.record_failure(0, e.to_string(), payload.file_name(), payload.line);
            return;
        }
    };

    match records.as_slice() {
        [] => counters.skip_with_reason("payload not found in API"),
        [record] => {
            let Some(id) = record.get("id").and_then(Value::as_str) else {
                counters.skip_with_reason("matching API record carries no id");
                return;
            };
            let deleted = delete_record_by_id(
                &api,
                &resource,
                id,
                &counters,
                payload.file_name(),
                payload.line,
            )
            .await;
            if deleted {
                changelog.remove(&payload.fingerprint);
            }
        }
        _ => counters.skip_with_reason("multiple matching payloads found in API"),
    }
}

/// Issues the DELETE and accounts for the response. Returns whether the
/// record is gone. Shared with truncation.
pub(crate) async fn delete_record_by_id(
    api: &ApiClient,
    resource: &str,
    id: &str,
    counters: &RunCounters,
    file: String,
    line: usize,
) -> bool {
    match api.delete_by_id(resource, id).await {
        Ok(response) => {
            let status = response.status().as_u16();
            counters.increment_status(status);
            if (200..300).contains(&status) {
                counters.mark_succeeded();
                true
            } else {
                let body = response.text().await.unwrap_or_default();
                counters.record_failure(status, linearize(&body), file, line);
                false
            }
        }
        Err(e) => {
            counters.record_failure(0, e.to_string(), file, line);
            false
        }
    }
}
