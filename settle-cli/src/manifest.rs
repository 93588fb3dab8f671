//! Manifest - resources to rehearse against the simulated cloud
//!
//! ```json
//! { "resources": [ { "kind": "database", "name": "main", "attributes": { "db_name": "app" } } ] }
//! ```

use std::collections::HashSet;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result, bail};
use serde::Deserialize;
use settle_core::resource::{Resource, Value};
use settle_provider_sim::resources::kind_profile;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Manifest {
    pub resources: Vec<ManifestResource>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ManifestResource {
    pub kind: String,
    pub name: String,
    #[serde(default)]
    pub attributes: serde_json::Map<String, serde_json::Value>,
}

impl Manifest {
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))
    }

    /// Convert to resources, checking kinds, names and attributes
    pub fn resources(&self) -> Result<Vec<Resource>> {
        let mut seen = HashSet::new();
        let mut resources = Vec::with_capacity(self.resources.len());
        let mut errors = Vec::new();

        for entry in &self.resources {
            let mut resource = Resource::new(&entry.kind, &entry.name);
            if !seen.insert(resource.id.clone()) {
                errors.push(format!("{}: defined more than once", resource.id));
                continue;
            }
            for (key, value) in &entry.attributes {
                match Value::from_json(value) {
                    Some(value) => {
                        resource.attributes.insert(key.clone(), value);
                    }
                    None => errors.push(format!(
                        "{}: attribute {} must not be null or fractional",
                        resource.id, key
                    )),
                }
            }
            match kind_profile(&entry.kind) {
                Some(profile) => {
                    if let Err(e) = (profile.validate)(&resource) {
                        errors.push(format!("{}: {}", resource.id, e));
                    }
                }
                None => errors.push(format!("{}: unknown kind {}", resource.id, entry.kind)),
            }
            resources.push(resource);
        }

        if !errors.is_empty() {
            bail!("Validation failed:\n  {}", errors.join("\n  "));
        }
        Ok(resources)
    }
}
