//! The validate operation: check local payloads without sending anything.
//!
//! Checks run in the configured order and the first failing check decides a
//! payload's verdict. Available checks:
//!
//!   json        the line parses as a JSON object
//!   schema      the payload matches the API's schema for the resource
//!   descriptors every `*Descriptor` value is defined locally or on the API
//!   uniqueness  no earlier payload in the run has the same identity
//!   references  every `*Reference` resolves locally or on the API
//!
//! Descriptor resources are validated too, but never reference-checked:
//! they sit at the bottom of the dependency order and carry no references.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::sync::atomic::AtomicUsize;

use jsonschema::{Draft, JSONSchema};
use lru::LruCache;
use parking_lot::Mutex;
use serde_json::Value;
use tracing::{info, warn};

use crate::uplink::directory;
use crate::uplink::dispatch::{Engine, RunCounters, RunResult};
use crate::uplink::fetch::{Fetcher, collect_references};
use crate::uplink::metadata::{
    DESCRIPTOR_CACHE_TTL, DescriptorCache, DescriptorValue, is_descriptor,
};
use crate::uplink::payload::{Fingerprint, fingerprint, interpolate_params, linearize};

/// Individual failures logged per file before the rest is summarized.
const DETAILED_FAILURES_PER_FILE: usize = 10;

const REFERENCE_MEMO_SIZE: usize = 50_000;

pub struct Validator {
    engine: Arc<Engine>,
    checks: Vec<String>,
    /// Descriptor values defined in local data files.
    local_descriptors: HashSet<(String, String)>,
    /// Descriptor values defined on the API.
    remote_descriptors: DescriptorCache,
    /// Identity tuples of local payloads, per resource; `None` marks a
    /// resource with no local data at all.
    local_identities: Mutex<HashMap<String, Option<Arc<HashSet<String>>>>>,
    /// Remote reference lookups already answered this run.
    reference_memo: Mutex<LruCache<String, bool>>,
    /// Cumulative failure count; the validate threshold spans the whole run.
    run_failed: Arc<AtomicUsize>,
}

impl Validator {
    pub async fn build(engine: Arc<Engine>) -> RunResult<Self> {
        let checks = engine.config.validate.checks.clone();
        let wants_descriptors = checks.iter().any(|c| c == "descriptors");
        let local_descriptors = if wants_descriptors {
            local_descriptor_values(&engine)?
        } else {
            HashSet::new()
        };
        let remote_descriptors = if wants_descriptors {
            remote_descriptor_values(&engine).await?
        } else {
            DescriptorCache::new(Vec::new())
        };
        Ok(Self {
            engine,
            checks,
            local_descriptors,
            remote_descriptors,
            local_identities: Mutex::new(HashMap::new()),
            reference_memo: Mutex::new(
                LruCache::new(NonZeroUsize::new(REFERENCE_MEMO_SIZE).unwrap_or(NonZeroUsize::MIN)),
            ),
            run_failed: Arc::new(AtomicUsize::new(0)),
        })
    }

    pub async fn validate(&self) -> RunResult<()> {
        let resources = directory::with_local_data(
            &self.engine.config.data_dir,
            &self.engine.resources,
        )?;
        for resource in &resources {
            info!("validating payloads for {resource} ...");
            self.validate_resource(resource).await?;
        }
        Ok(())
    }

    async fn validate_resource(&self, resource: &str) -> RunResult<()> {
        let counters = Arc::new(RunCounters::shared(
            self.engine.config.validate.max_failures,
            self.run_failed.clone(),
        ));
        let schema = if self.checks.iter().any(|c| c == "schema") {
            let schema = self.engine.meta.validation_schema(resource)?;
            match JSONSchema::options().with_draft(Draft::Draft4).compile(&schema) {
                Ok(compiled) => Some(compiled),
                Err(e) => {
                    warn!("schema for {resource} did not compile, skipping the check: {e}");
                    None
                }
            }
        } else {
            None
        };
        let identity = self.engine.meta.identity_fields(resource)?;
        let mut seen_identities: HashSet<Fingerprint> = HashSet::new();

        'files: for file in directory::data_files_for(&self.engine.config.data_dir, resource) {
            let mut detailed = 0usize;
            let reader = BufReader::new(File::open(&file)?);
            for (index, line) in reader.lines().enumerate() {
                let line = line?;
                let data = line.trim();
                if data.is_empty() {
                    continue;
                }
                let verdict = self
                    .check_payload(resource, data, schema.as_ref(), &identity, &mut seen_identities)
                    .await;
                match verdict {
                    Ok(()) => counters.mark_succeeded(),
                    Err(message) => {
                        if detailed < DETAILED_FAILURES_PER_FILE {
                            warn!("  {}:{}: {message}", file.display(), index + 1);
                            detailed += 1;
                        }
                        let file_name = file
                            .file_name()
                            .map(|n| n.to_string_lossy().into_owned())
                            .unwrap_or_default();
                        counters.record_failure(0, message, file_name, index + 1);
                    }
                }
                if counters.aborted() {
                    break 'files;
                }
            }
        }
        self.engine.finish_resource(resource, &counters)
    }

    /// Runs the configured checks in order; the first failure wins.
    async fn check_payload(
        &self,
        resource: &str,
        data: &str,
        schema: Option<&JSONSchema>,
        identity: &BTreeMap<String, String>,
        seen_identities: &mut HashSet<Fingerprint>,
    ) -> Result<(), String> {
        let parsed: Value = match serde_json::from_str(data) {
            Ok(parsed) => parsed,
            Err(e) => return Err(format!("not valid JSON: {e}")),
        };
        for check in &self.checks {
            match check.as_str() {
                // parsing already happened; a non-object is the remaining
                // way this check can fail
                "json" => {
                    if !parsed.is_object() {
                        return Err("payload is not a JSON object".to_string());
                    }
                }
                "schema" => {
                    if let Some(schema) = schema {
                        if let Err(errors) = schema.validate(&parsed) {
                            let first = errors
                                .into_iter()
                                .next()
                                .map(|e| e.to_string())
                                .unwrap_or_else(|| "schema violation".to_string());
                            return Err(format!("does not match schema: {}", linearize(&first)));
                        }
                    }
                }
                "descriptors" => self.check_descriptors(&parsed)?,
                "uniqueness" => {
                    let params = interpolate_params(identity, &parsed)
                        .map_err(|e| format!("missing identity value: {e}"))?;
                    let key = fingerprint(&serialize_params(&params));
                    if !seen_identities.insert(key) {
                        return Err(
                            "payload identity duplicates an earlier payload".to_string()
                        );
                    }
                }
                "references" => {
                    if !is_descriptor(resource) {
                        self.check_references(&parsed).await?;
                    }
                }
                other => {
                    warn!("unknown validation check '{other}' ignored");
                }
            }
        }
        Ok(())
    }

    fn check_descriptors(&self, payload: &Value) -> Result<(), String> {
        for (key, value) in descriptor_values(payload) {
            let Some((namespace, code_value)) = value.split_once('#') else {
                return Err(format!(
                    "descriptor value '{value}' for {key} is not in namespace#codeValue form"
                ));
            };
            let defined_locally = self
                .local_descriptors
                .contains(&(namespace.to_string(), code_value.to_string()));
            if !defined_locally && !self.remote_descriptors.is_valid(namespace, code_value) {
                return Err(format!(
                    "descriptor value '{value}' for {key} is not defined locally or on the API"
                ));
            }
        }
        Ok(())
    }

    async fn check_references(&self, payload: &Value) -> Result<(), String> {
        for (ref_resource, params) in collect_references(payload) {
            if self.engine.meta.dependency_rank(&ref_resource).is_none() {
                continue;
            }
            if self.resolves_locally(&ref_resource, &params)? {
                continue;
            }
            if !self.resolves_remotely(&ref_resource, &params).await {
                return Err(format!(
                    "reference to {ref_resource} ({}) does not match any local or API record",
                    serialize_params(&params)
                ));
            }
        }
        Ok(())
    }

    /// Checks the reference against the referenced resource's local data,
    /// building that resource's identity index on first use.
    fn resolves_locally(
        &self,
        resource: &str,
        params: &BTreeMap<String, String>,
    ) -> Result<bool, String> {
        let identities = {
            let mut cache = self.local_identities.lock();
            match cache.get(resource) {
                Some(entry) => entry.clone(),
                None => {
                    let built = self
                        .build_local_identities(resource)
                        .map_err(|e| e.to_string())?;
                    cache.insert(resource.to_string(), built.clone());
                    built
                }
            }
        };
        let Some(identities) = identities else {
            return Ok(false);
        };
        // a reference carries exactly the identity fields, so a serialized
        // subset match is a serialized equality match
        let identity_fields = self
            .engine
            .meta
            .identity_fields(resource)
            .map_err(|e| e.to_string())?;
        let relevant: BTreeMap<String, String> = params
            .iter()
            .filter(|(k, _)| identity_fields.contains_key(*k))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        Ok(identities.contains(&serialize_params(&relevant)))
    }

    fn build_local_identities(
        &self,
        resource: &str,
    ) -> RunResult<Option<Arc<HashSet<String>>>> {
        let files = directory::data_files_for(&self.engine.config.data_dir, resource);
        if files.is_empty() {
            return Ok(None);
        }
        let identity = self.engine.meta.identity_fields(resource)?;
        let mut identities = HashSet::new();
        for file in files {
            let reader = BufReader::new(File::open(&file)?);
            for line in reader.lines() {
                let line = line?;
                let data = line.trim();
                if data.is_empty() {
                    continue;
                }
                let Ok(parsed) = serde_json::from_str::<Value>(data) else {
                    continue;
                };
                if let Ok(params) = interpolate_params(&identity, &parsed) {
                    identities.insert(serialize_params(&params));
                }
            }
        }
        Ok(Some(Arc::new(identities)))
    }

    /// Asks the API whether the referenced record exists, memoizing answers
    /// so repeated references cost one request.
    async fn resolves_remotely(&self, resource: &str, params: &BTreeMap<String, String>) -> bool {
        let memo_key = format!("{resource}?{}", serialize_params(params));
        if let Some(answer) = self.reference_memo.lock().get(&memo_key) {
            return *answer;
        }
        let mut query: Vec<(String, String)> =
            params.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        query.push(("limit".to_string(), "1".to_string()));
        let exists = match self.engine.api.get_collection(resource, &query).await {
            Ok(response) if response.status().is_success() => response
                .json::<Vec<Value>>()
                .await
                .map(|records| !records.is_empty())
                .unwrap_or(false),
            _ => false,
        };
        self.reference_memo.lock().put(memo_key, exists);
        exists
    }
}

fn serialize_params(params: &BTreeMap<String, String>) -> String {
    serde_json::to_string(params).unwrap_or_default()
}

/// Every `*Descriptor` string value in the payload, recursively.
fn descriptor_values(payload: &Value) -> Vec<(String, String)> {
    let mut found = Vec::new();
    walk_descriptors(payload, &mut found);
    found
}

fn walk_descriptors(value: &Value, found: &mut Vec<(String, String)>) {
    match value {
        Value::Object(map) => {
            for (key, child) in map {
                if key.ends_with("Descriptor") {
                    if let Some(text) = child.as_str() {
                        found.push((key.clone(), text.to_string()));
                    }
                }
                walk_descriptors(child, found);
            }
        }
        Value::Array(items) => {
            for item in items {
                walk_descriptors(item, found);
            }
        }
        _ => {}
    }
}

/// Descriptor values defined by local data files of descriptor resources.
fn local_descriptor_values(engine: &Arc<Engine>) -> RunResult<HashSet<(String, String)>> {
    let mut values = HashSet::new();
    for resource in engine.meta.resources() {
        if !is_descriptor(resource) {
            continue;
        }
        for file in directory::data_files_for(&engine.config.data_dir, resource) {
            let reader = BufReader::new(File::open(&file)?);
            for line in reader.lines() {
                let line = line?;
                let data = line.trim();
                if data.is_empty() {
                    continue;
                }
                let Ok(parsed) = serde_json::from_str::<Value>(data) else {
                    continue;
                };
                if let (Some(namespace), Some(code_value)) = (
                    parsed.get("namespace").and_then(Value::as_str),
                    parsed.get("codeValue").and_then(Value::as_str),
                ) {
                    values.insert((namespace.to_string(), code_value.to_string()));
                }
            }
        }
    }
    Ok(values)
}

/// Descriptor values defined on the API, from the on-disk cache when it is
/// still fresh, otherwise refetched from every descriptor collection.
async fn remote_descriptor_values(engine: &Arc<Engine>) -> RunResult<DescriptorCache> {
    let cache_path = DescriptorCache::cache_path(
        &engine.config.state_dir,
        &engine.config.api.base_url,
    );
    if !engine.wipe_cache {
        if let Some(cache) = DescriptorCache::load_fresh(&cache_path, DESCRIPTOR_CACHE_TTL) {
            info!("loaded {} descriptor values from cache", cache.len());
            return Ok(cache);
        }
    }

    info!("fetching descriptor values from the API ...");
    let fetcher = Fetcher::new(engine.clone());
    let mut values = Vec::new();
    for resource in engine.meta.resources() {
        if !is_descriptor(resource) {
            continue;
        }
        for record in fetcher.collect(resource, &[], &[]).await? {
            let (Some(namespace), Some(code_value)) = (
                record.get("namespace").and_then(Value::as_str),
                record.get("codeValue").and_then(Value::as_str),
            ) else {
                continue;
            };
            values.push(DescriptorValue {
                descriptor: resource.clone(),
                namespace: namespace.to_string(),
                code_value: code_value.to_string(),
                short_description: record
                    .get("shortDescription")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
            });
        }
    }
    let cache = DescriptorCache::new(values);
    cache.save(&cache_path)?;
    info!("cached {} descriptor values", cache.len());
    Ok(cache)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn descriptor_values_are_found_recursively() {
        let payload = json!({
            "gradeLevelDescriptor": "uri://ed-fi.org/GradeLevelDescriptor#Ninth grade",
            "addresses": [
                {"addressTypeDescriptor": "uri://ed-fi.org/AddressTypeDescriptor#Home"}
            ],
            "name": "not a descriptor"
        });
        let mut found = descriptor_values(&payload);
        found.sort();
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].0, "addressTypeDescriptor");
        assert_eq!(found[1].0, "gradeLevelDescriptor");
    }

    #[test]
    fn serialized_params_are_order_stable() {
        let mut a = BTreeMap::new();
        a.insert("schoolId".to_string(), "255901".to_string());
        a.insert("schoolYear".to_string(), "2026".to_string());
        let mut b = BTreeMap::new();
        b.insert("schoolYear".to_string(), "2026".to_string());
        b.insert("schoolId".to_string(), "255901".to_string());
        assert_eq!(serialize_params(&a), serialize_params(&b));
    }
}
