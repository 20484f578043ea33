//! Remote schema metadata: dependency order, required fields, identity
//! fields, and descriptor values.
//!
//! The API publishes an interface-description document per resource group
//! (regular resources and descriptors). Both are fetched once per run and
//! cached on disk with a one-month TTL. From a resource's schema definition
//! we derive the required-field map — dotted paths into a payload — by
//! recursing through `$ref` properties; those doubles as the identity fields
//! used for search-before-delete and uniqueness validation.
//!
//! Descriptor resources (enumeration values) do not get derived identity
//! fields: their identity shape is fixed (namespace, codeValue,
//! shortDescription).

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use thiserror::Error;
use tracing::{debug, info};

use crate::uplink::api::{ApiClient, ApiError};
use crate::uplink::payload::fingerprint_hex;

/// Schema documents and descriptor values are re-fetched after a month.
pub const SCHEMA_CACHE_TTL: Duration = Duration::from_secs(2_629_800);
pub const DESCRIPTOR_CACHE_TTL: Duration = Duration::from_secs(2_629_800);

#[derive(Error, Debug)]
pub enum SchemaError {
    #[error("API error: {0}")]
    Api(#[from] ApiError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(
        "schema document has neither `definitions` nor `components.schemas`; \
         cannot interpret it"
    )]
    UnsupportedDialect,

    #[error("schema document has no definition named `{0}`")]
    MissingDefinition(String),

    #[error("dependencies endpoint returned an unusable response: {0}")]
    BadDependencies(String),
}

pub type SchemaResult<T> = Result<T, SchemaError>;

/// Which schema document a resource belongs to.
pub fn is_descriptor(resource: &str) -> bool {
    resource.ends_with("Descriptors")
}

/// `localEducationAgencies` -> `localEducationAgency`, `people` -> `person`,
/// `students` -> `student`.
pub fn singularize(resource: &str) -> String {
    if let Some(stem) = resource.strip_suffix("ies") {
        format!("{stem}y")
    } else if resource == "people" {
        "person".to_string()
    } else {
        resource.strip_suffix('s').unwrap_or(resource).to_string()
    }
}

/// Inverse of [`singularize`], for mapping reference names back to
/// resources: `schoolYearType` -> `schoolYearTypes`, `person` -> `people`.
pub fn pluralize(singular: &str) -> String {
    if singular == "person" {
        "people".to_string()
    } else if let Some(stem) = singular.strip_suffix('y') {
        if stem
            .chars()
            .last()
            .map(|c| !"aeiou".contains(c))
            .unwrap_or(false)
        {
            format!("{stem}ies")
        } else {
            format!("{singular}s")
        }
    } else {
        format!("{singular}s")
    }
}

/// `ed-fi` -> `edFi`.
pub fn camel_case(name: &str) -> String {
    let mut out = String::new();
    for (i, part) in name.split(['-', '_']).filter(|p| !p.is_empty()).enumerate() {
        let mut chars = part.chars();
        let first = chars.next().unwrap_or_default();
        if i == 0 {
            out.extend(first.to_lowercase());
        } else {
            out.extend(first.to_uppercase());
        }
        out.push_str(chars.as_str());
    }
    out
}

/// The definition table of a schema document, handling both supported
/// dialects: swagger-2 (`definitions`) and openapi-3 (`components.schemas`).
pub fn definitions_of(doc: &Value) -> SchemaResult<&Map<String, Value>> {
    if let Some(defs) = doc.get("definitions").and_then(Value::as_object) {
        return Ok(defs);
    }
    if let Some(defs) = doc
        .pointer("/components/schemas")
        .and_then(Value::as_object)
    {
        return Ok(defs);
    }
    Err(SchemaError::UnsupportedDialect)
}

fn ref_target(reference: &str) -> &str {
    reference
        .trim_start_matches("#/definitions/")
        .trim_start_matches("#/components/schemas/")
}

/// Walks a definition's required properties, inlining `$ref` targets with a
/// dotted prefix and skipping array-typed properties (arrays cannot be used
/// as scalar query parameters).
pub fn required_fields_from(
    doc: &Value,
    definition: &str,
    prefix: &str,
) -> SchemaResult<BTreeMap<String, String>> {
    let defs = definitions_of(doc)?;
    let def = defs
        .get(definition)
        .ok_or_else(|| SchemaError::MissingDefinition(definition.to_string()))?;

    let mut fields = BTreeMap::new();
    let required = match def.get("required").and_then(Value::as_array) {
        Some(required) => required,
        None => return Ok(fields),
    };
    let properties = def.get("properties").and_then(Value::as_object);

    for name in required.iter().filter_map(Value::as_str) {
        let property = match properties.and_then(|p| p.get(name)) {
            Some(property) => property,
            None => continue,
        };
        if let Some(reference) = property.get("$ref").and_then(Value::as_str) {
            let nested = required_fields_from(
                doc,
                ref_target(reference),
                &format!("{prefix}{name}."),
            )?;
            fields.extend(nested);
        } else if property.get("type").and_then(Value::as_str) != Some("array") {
            fields.insert(name.to_string(), format!("{prefix}{name}"));
        }
    }
    Ok(fields)
}

/// One flattened descriptor value, as consulted by the validation path.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DescriptorValue {
    pub descriptor: String,
    pub namespace: String,
    pub code_value: String,
    pub short_description: String,
}

/// Read-only lookup table of known descriptor values, cached on disk.
#[derive(Debug, Default)]
pub struct DescriptorCache {
    values: Vec<DescriptorValue>,
}

impl DescriptorCache {
    pub fn new(values: Vec<DescriptorValue>) -> Self {
        Self { values }
    }

    pub fn cache_path(state_dir: &Path, base_url: &str) -> PathBuf {
        state_dir
            .join("cache")
            .join(format!("descriptor-values-{}.json", fingerprint_hex(base_url)))
    }

    /// Loads the cache file when present and not expired.
    pub fn load_fresh(path: &Path, ttl: Duration) -> Option<Self> {
        let age = fs::metadata(path)
            .and_then(|m| m.modified())
            .ok()
            .and_then(|t| SystemTime::now().duration_since(t).ok())?;
        if age >= ttl {
            return None;
        }
        let raw = fs::read_to_string(path).ok()?;
        let values = serde_json::from_str(&raw).ok()?;
        Some(Self { values })
    }

    pub fn save(&self, path: &Path) -> SchemaResult<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_string(&self.values)?)?;
        Ok(())
    }

    pub fn is_valid(&self, namespace: &str, code_value: &str) -> bool {
        self.values
            .iter()
            .any(|v| v.namespace == namespace && v.code_value == code_value)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

#[derive(Deserialize)]
struct DependencyEntry {
    resource: String,
    order: i64,
    operations: Vec<String>,
}

pub struct MetadataProvider {
    api: Arc<ApiClient>,
    namespace: String,
    resources: Vec<String>,
    resources_schema: Value,
    descriptors_schema: Value,
}

impl MetadataProvider {
    /// Fetches the dependency list and both schema documents (or reuses the
    /// on-disk cache). `wipe_cache` forces a refetch.
    pub async fn discover(
        api: Arc<ApiClient>,
        namespace: &str,
        state_dir: &Path,
        wipe_cache: bool,
    ) -> SchemaResult<Self> {
        let resources = Self::fetch_dependency_order(&api, namespace).await?;

        debug!("fetching schema metadata descriptor...");
        let metadata = api.get_json(&api.urls.open_api_metadata.clone()).await?;
        let entries = metadata
            .as_array()
            .ok_or(SchemaError::UnsupportedDialect)?;

        let mut resources_schema = None;
        let mut descriptors_schema = None;
        for entry in entries {
            let name = entry
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_lowercase();
            let url = match entry.get("endpointUri").and_then(Value::as_str) {
                Some(url) => url,
                None => continue,
            };
            match name.as_str() {
                "resources" => {
                    resources_schema =
                        Some(Self::schema_doc(&api, state_dir, "resources", url, wipe_cache).await?)
                }
                "descriptors" => {
                    descriptors_schema = Some(
                        Self::schema_doc(&api, state_dir, "descriptors", url, wipe_cache).await?,
                    )
                }
                _ => {}
            }
        }
        let resources_schema = resources_schema.ok_or(SchemaError::UnsupportedDialect)?;
        let descriptors_schema = descriptors_schema.ok_or(SchemaError::UnsupportedDialect)?;

        // Fail fast if a document has an unexpected top-level shape.
        definitions_of(&resources_schema)?;
        definitions_of(&descriptors_schema)?;

        Ok(Self {
            api,
            namespace: namespace.to_string(),
            resources,
            resources_schema,
            descriptors_schema,
        })
    }

    async fn fetch_dependency_order(
        api: &ApiClient,
        namespace: &str,
    ) -> SchemaResult<Vec<String>> {
        debug!("fetching resource dependencies...");
        let body = api.get_json(&api.urls.dependencies.clone()).await?;
        let mut entries: Vec<DependencyEntry> = serde_json::from_value(body)
            .map_err(|e| SchemaError::BadDependencies(e.to_string()))?;
        entries.retain(|e| e.operations.iter().any(|op| op == "Create"));
        // not sorted by default in all API versions
        entries.sort_by_key(|e| e.order);

        let prefix = format!("/{namespace}/");
        let ordered: Vec<String> = entries
            .iter()
            .filter_map(|e| e.resource.strip_prefix(&prefix))
            .map(str::to_string)
            .collect();
        if ordered.is_empty() {
            return Err(SchemaError::BadDependencies(format!(
                "no resources under namespace {namespace}"
            )));
        }
        Ok(ordered)
    }

    /// Fetches one schema document, reusing the disk cache when fresh.
    async fn schema_doc(
        api: &ApiClient,
        state_dir: &Path,
        kind: &str,
        url: &str,
        wipe_cache: bool,
    ) -> SchemaResult<Value> {
        let cache_dir = state_dir.join("cache");
        let cache_file = cache_dir.join(format!("schema-{kind}-{}.json", fingerprint_hex(url)));

        if !wipe_cache && cache_file.is_file() {
            let fresh = fs::metadata(&cache_file)
                .and_then(|m| m.modified())
                .ok()
                .and_then(|t| SystemTime::now().duration_since(t).ok())
                .map(|age| age < SCHEMA_CACHE_TTL)
                .unwrap_or(false);
            if fresh {
                debug!("re-using cached {kind} schema (from {})", cache_file.display());
                return Ok(serde_json::from_str(&fs::read_to_string(&cache_file)?)?);
            }
        }

        info!("fetching {kind} schema document...");
        let doc = api.get_json(url).await?;
        fs::create_dir_all(&cache_dir)?;
        fs::write(&cache_file, serde_json::to_string(&doc)?)?;
        Ok(doc)
    }

    /// All resources, in dependency order. The rank of a resource is its
    /// index in this list.
    pub fn resources(&self) -> &[String] {
        &self.resources
    }

    pub fn dependency_rank(&self, resource: &str) -> Option<usize> {
        self.resources.iter().position(|r| r == resource)
    }

    fn schema_for(&self, resource: &str) -> &Value {
        if is_descriptor(resource) {
            &self.descriptors_schema
        } else {
            &self.resources_schema
        }
    }

    /// Schema definition name for a resource: camelCased namespace + `_` +
    /// singularized resource name.
    pub fn definition_name(&self, resource: &str) -> String {
        format!("{}_{}", camel_case(&self.namespace), singularize(resource))
    }

    /// Required-field map for a resource (field name -> dotted path).
    pub fn required_fields(&self, resource: &str) -> SchemaResult<BTreeMap<String, String>> {
        required_fields_from(self.schema_for(resource), &self.definition_name(resource), "")
    }

    /// Identity-field map: the fixed descriptor shape for descriptor
    /// resources, otherwise the required fields.
    pub fn identity_fields(&self, resource: &str) -> SchemaResult<BTreeMap<String, String>> {
        if is_descriptor(resource) {
            let mut fields = BTreeMap::new();
            for name in ["namespace", "codeValue", "shortDescription"] {
                fields.insert(name.to_string(), name.to_string());
            }
            return Ok(fields);
        }
        self.required_fields(resource)
    }

    /// A self-contained schema value for structural validation of one
    /// resource: the full document with a `$ref` at the root, so nested
    /// references resolve in-document.
    pub fn validation_schema(&self, resource: &str) -> SchemaResult<Value> {
        let doc = self.schema_for(resource);
        let definition = self.definition_name(resource);
        let defs = definitions_of(doc)?;
        if !defs.contains_key(&definition) {
            return Err(SchemaError::MissingDefinition(definition));
        }
        let pointer = if doc.get("definitions").is_some() {
            format!("#/definitions/{definition}")
        } else {
            format!("#/components/schemas/{definition}")
        };
        let mut schema = doc.clone();
        if let Some(root) = schema.as_object_mut() {
            root.insert("$ref".to_string(), json!(pointer));
        }
        Ok(schema)
    }

    pub fn api(&self) -> &Arc<ApiClient> {
        &self.api
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn singularize_covers_the_irregulars() {
        assert_eq!(singularize("students"), "student");
        assert_eq!(singularize("localEducationAgencies"), "localEducationAgency");
        assert_eq!(singularize("people"), "person");
    }

    #[test]
    fn pluralize_inverts_singularize() {
        for resource in ["students", "localEducationAgencies", "people", "schools"] {
            assert_eq!(pluralize(&singularize(resource)), resource);
        }
    }

    #[test]
    fn camel_case_namespaces() {
        assert_eq!(camel_case("ed-fi"), "edFi");
        assert_eq!(camel_case("my_extension"), "myExtension");
    }

    fn fixture_schema() -> Value {
        json!({
            "definitions": {
                "edFi_assessmentItem": {
                    "required": ["identificationCode", "assessmentReference", "gradeLevels"],
                    "properties": {
                        "identificationCode": {"type": "string"},
                        "assessmentReference": {"$ref": "#/definitions/edFi_assessmentReference"},
                        "gradeLevels": {"type": "array", "items": {"type": "string"}}
                    }
                },
                "edFi_assessmentReference": {
                    "required": ["assessmentIdentifier", "namespace"],
                    "properties": {
                        "assessmentIdentifier": {"type": "string"},
                        "namespace": {"type": "string"}
                    }
                }
            }
        })
    }

    #[test]
    fn required_fields_inline_refs_and_skip_arrays() {
        let fields = required_fields_from(&fixture_schema(), "edFi_assessmentItem", "").unwrap();
        assert_eq!(fields["identificationCode"], "identificationCode");
        assert_eq!(
            fields["assessmentIdentifier"],
            "assessmentReference.assessmentIdentifier"
        );
        assert_eq!(fields["namespace"], "assessmentReference.namespace");
        assert!(!fields.contains_key("gradeLevels"));
    }

    #[test]
    fn openapi3_dialect_is_supported() {
        let doc = json!({
            "components": {"schemas": {
                "edFi_school": {
                    "required": ["schoolId"],
                    "properties": {"schoolId": {"type": "integer"}}
                }
            }}
        });
        let fields = required_fields_from(&doc, "edFi_school", "").unwrap();
        assert_eq!(fields["schoolId"], "schoolId");
    }

    #[test]
    fn unknown_dialect_is_fatal() {
        let doc = json!({"swagger": "4.0"});
        assert!(matches!(
            definitions_of(&doc).unwrap_err(),
            SchemaError::UnsupportedDialect
        ));
    }

    #[test]
    fn descriptor_cache_lookup() {
        let cache = DescriptorCache::new(vec![DescriptorValue {
            descriptor: "gradeLevelDescriptor".to_string(),
            namespace: "uri://ed-fi.org/GradeLevelDescriptor".to_string(),
            code_value: "Seventh grade".to_string(),
            short_description: "Seventh grade".to_string(),
        }]);
        assert!(cache.is_valid("uri://ed-fi.org/GradeLevelDescriptor", "Seventh grade"));
        assert!(!cache.is_valid("uri://ed-fi.org/GradeLevelDescriptor", "Eighth grade"));
    }
}
