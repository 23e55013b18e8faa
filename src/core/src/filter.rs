//! Module filter expressions.
//!
//! A filter restricts which add-on modules, and which of their releases, are
//! mirrored. The textual form is a semicolon-separated list of `name:tag`
//! entries, e.g. `admin:v1;admin:v2;monitoring:v9`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{MirrorError, Result};

/// Mapping from module name to the release tags required for it.
///
/// An empty filter matches every module and every release.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ModuleFilter {
    modules: BTreeMap<String, Vec<String>>,
}

impl ModuleFilter {
    /// Parse a filter expression.
    ///
    /// Malformed entries are logged and dropped; they never fail the parse.
    pub fn parse(expression: &str) -> Self {
        let mut filter = Self::default();
        for entry in expression.split(';') {
            let entry = entry.trim();
            if entry.is_empty() {
                continue;
            }
            match parse_entry(entry) {
                Ok((name, tag)) => filter.insert(name, tag),
                Err(e) => tracing::warn!(entry = %entry, error = %e, "Ignoring module filter entry"),
            }
        }
        filter
    }

    /// Add a required release for a module.
    pub fn insert(&mut self, module: impl Into<String>, tag: impl Into<String>) {
        let tags = self.modules.entry(module.into()).or_default();
        let tag = tag.into();
        if !tags.contains(&tag) {
            tags.push(tag);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    /// Required tags for a module, if the filter names it.
    pub fn tags(&self, module: &str) -> Option<&[String]> {
        self.modules.get(module).map(Vec::as_slice)
    }

    /// Module names mentioned in the filter.
    pub fn modules(&self) -> impl Iterator<Item = &str> {
        self.modules.keys().map(String::as_str)
    }

    /// Whether a module with the given releases should be mirrored.
    pub fn matches(&self, module: &str, releases: &[String]) -> bool {
        if self.is_empty() {
            return true;
        }
        match self.modules.get(module) {
            Some(required) => releases.iter().any(|r| required.contains(r)),
            None => false,
        }
    }

    /// The releases of a matching module that survive the filter.
    pub fn filter_releases(&self, module: &str, releases: &[String]) -> Vec<String> {
        if self.is_empty() {
            return releases.to_vec();
        }
        match self.modules.get(module) {
            Some(required) => releases
                .iter()
                .filter(|r| required.contains(r))
                .cloned()
                .collect(),
            None => Vec::new(),
        }
    }
}

impl std::str::FromStr for ModuleFilter {
    type Err = MirrorError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self::parse(s))
    }
}

fn parse_entry(entry: &str) -> Result<(String, String)> {
    let (name, tag) = entry
        .split_once(':')
        .ok_or_else(|| MirrorError::BadFilterExpression(format!("missing ':' in '{entry}'")))?;
    let (name, tag) = (name.trim(), tag.trim());
    if name.is_empty() || tag.is_empty() || tag.contains(':') {
        return Err(MirrorError::BadFilterExpression(format!(
            "expected name:tag, got '{entry}'"
        )));
    }
    Ok((name.to_string(), tag.to_string()))
}
