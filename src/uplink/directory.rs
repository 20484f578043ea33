//! Resource selection and local data-file discovery.
//!
//! Resources arrive from the metadata provider already in dependency order.
//! This module narrows that list with include/exclude selectors (exact names,
//! comma lists, and single-sided wildcards), always re-projecting the result
//! onto the original order, and finds the newline-delimited JSON files that
//! hold local data for each resource.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use thiserror::Error;
use walkdir::WalkDir;

#[derive(Error, Debug)]
pub enum SelectionError {
    #[error("no match for selector(s) [{0}] to any resource in the API; check for typos?")]
    UnknownSelectors(String),

    #[error("selector filtering left no resources to process; check your selector for typos?")]
    EmptySelection,

    #[error("`data_dir` {0} is not a directory")]
    BadDataDir(String),

    #[error("`data_dir` {0} has no data files for the selected resources")]
    NoData(String),
}

pub type SelectionResult<T> = Result<T, SelectionError>;

const DATA_EXTENSIONS: [&str; 2] = ["jsonl", "ndjson"];

/// Expands a selector string against a universe of resource names.
///
/// Accepted forms: `students`, `students,schools`, `student*`,
/// `*Descriptors`, `student*,schools`. An empty string or `*` expands to the
/// whole universe when `all_on_empty` is set, nothing otherwise. Exact names
/// are returned even when absent from the universe so the caller can tell a
/// typo apart from "no data present".
pub fn parse_selector(spec: &str, universe: &[String], all_on_empty: bool) -> Vec<String> {
    if spec.is_empty() {
        return if all_on_empty {
            universe.to_vec()
        } else {
            Vec::new()
        };
    }
    if spec == "*" {
        return universe.to_vec();
    }

    let mut matched = Vec::new();
    let mut seen = HashSet::new();
    let mut push = |name: String, matched: &mut Vec<String>| {
        if seen.insert(name.clone()) {
            matched.push(name);
        }
    };

    for part in spec.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        if let Some(suffix) = part.strip_prefix('*') {
            for name in universe.iter().filter(|n| n.ends_with(suffix)) {
                push(name.clone(), &mut matched);
            }
        } else if let Some(prefix) = part.strip_suffix('*') {
            for name in universe.iter().filter(|n| n.starts_with(prefix)) {
                push(name.clone(), &mut matched);
            }
        } else {
            push(part.to_string(), &mut matched);
        }
    }
    matched
}

/// Applies include and exclude selectors to the dependency-ordered resource
/// list. Set arithmetic happens on the side; the output keeps the original
/// order.
pub fn resolve(
    ordered: &[String],
    include: &str,
    exclude: &str,
) -> SelectionResult<Vec<String>> {
    let selected = parse_selector(include, ordered, true);

    let known: HashSet<&String> = ordered.iter().collect();
    let unknown: Vec<&String> = selected.iter().filter(|n| !known.contains(n)).collect();
    if !unknown.is_empty() {
        let names: Vec<String> = unknown.into_iter().cloned().collect();
        return Err(SelectionError::UnknownSelectors(names.join(", ")));
    }

    // excludes get the same typo check as includes; excluding a known
    // resource that was never selected stays a no-op
    let excluded_names = parse_selector(exclude, ordered, false);
    let unknown: Vec<&String> = excluded_names.iter().filter(|n| !known.contains(n)).collect();
    if !unknown.is_empty() {
        let names: Vec<String> = unknown.into_iter().cloned().collect();
        return Err(SelectionError::UnknownSelectors(names.join(", ")));
    }

    let excluded: HashSet<String> = excluded_names.into_iter().collect();
    let selected: HashSet<String> = selected.into_iter().collect();

    let final_resources: Vec<String> = ordered
        .iter()
        .filter(|n| selected.contains(*n) && !excluded.contains(*n))
        .cloned()
        .collect();
    if final_resources.is_empty() {
        return Err(SelectionError::EmptySelection);
    }
    Ok(final_resources)
}

/// Returns the data files for one resource: `<data_dir>/<resource>.jsonl`
/// (or `.ndjson`), plus every such file inside `<data_dir>/<resource>/`.
/// File order is stable so payload line numbering is reproducible.
pub fn data_files_for(data_dir: &Path, resource: &str) -> Vec<PathBuf> {
    let mut files = Vec::new();
    for ext in DATA_EXTENSIONS {
        let candidate = data_dir.join(format!("{resource}.{ext}"));
        if candidate.is_file() {
            files.push(candidate);
        }
    }

    let subdir = data_dir.join(resource);
    if subdir.is_dir() {
        let mut nested: Vec<PathBuf> = WalkDir::new(&subdir)
            .into_iter()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().is_file())
            .map(|entry| entry.into_path())
            .filter(|path| {
                path.extension()
                    .and_then(|e| e.to_str())
                    .map(|e| DATA_EXTENSIONS.contains(&e))
                    .unwrap_or(false)
            })
            .collect();
        nested.sort();
        files.extend(nested);
    }
    files
}

/// Narrows a resource list to those with at least one local data file,
/// preserving order.
pub fn with_local_data(data_dir: &Path, resources: &[String]) -> SelectionResult<Vec<String>> {
    if !data_dir.is_dir() {
        return Err(SelectionError::BadDataDir(data_dir.display().to_string()));
    }
    let present: Vec<String> = resources
        .iter()
        .filter(|r| !data_files_for(data_dir, r).is_empty())
        .cloned()
        .collect();
    if present.is_empty() {
        return Err(SelectionError::NoData(data_dir.display().to_string()));
    }
    Ok(present)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn universe() -> Vec<String> {
        [
            "schools",
            "students",
            "studentSchoolAssociations",
            "gradeLevelDescriptors",
            "schoolTypeDescriptors",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect()
    }

    #[test]
    fn prefix_wildcard_matches_all_starting_names() {
        let matched = parse_selector("student*", &universe(), true);
        assert_eq!(matched, vec!["students", "studentSchoolAssociations"]);
    }

    #[test]
    fn suffix_wildcard_preserves_order() {
        let matched = parse_selector("*Descriptors", &universe(), true);
        assert_eq!(matched, vec!["gradeLevelDescriptors", "schoolTypeDescriptors"]);
    }

    #[test]
    fn exact_selector_only_matches_itself() {
        let resolved = resolve(&universe(), "students", "").unwrap();
        assert_eq!(resolved, vec!["students"]);
    }

    #[test]
    fn resolve_keeps_dependency_order_after_set_operations() {
        let resolved = resolve(&universe(), "studentSchoolAssociations,schools,students", "").unwrap();
        assert_eq!(
            resolved,
            vec!["schools", "students", "studentSchoolAssociations"]
        );
    }

    #[test]
    fn exclude_is_subtracted() {
        let resolved = resolve(&universe(), "student*", "studentSchoolAssociations").unwrap();
        assert_eq!(resolved, vec!["students"]);
    }

    #[test]
    fn unknown_exact_selector_is_a_typo_error() {
        let err = resolve(&universe(), "studnets", "").unwrap_err();
        assert!(matches!(err, SelectionError::UnknownSelectors(_)));
    }

    #[test]
    fn unknown_exclude_selector_is_a_typo_error() {
        let err = resolve(&universe(), "", "studnets").unwrap_err();
        assert!(matches!(err, SelectionError::UnknownSelectors(_)));
    }

    #[test]
    fn excluding_an_unselected_resource_is_not_an_error() {
        let resolved = resolve(&universe(), "students", "schools").unwrap();
        assert_eq!(resolved, vec!["students"]);
    }

    #[test]
    fn filtering_everything_away_is_an_error() {
        let err = resolve(&universe(), "students", "students").unwrap_err();
        assert!(matches!(err, SelectionError::EmptySelection));
    }

    #[test]
    fn empty_include_selects_all() {
        let resolved = resolve(&universe(), "", "").unwrap();
        assert_eq!(resolved, universe());
    }
}
