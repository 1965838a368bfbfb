// Manifest document parsing.
//
// {"bundles": {"<name>": {"hash": "<32 hex>", "dependencies": ["<name>", ...]}}}

use std::collections::BTreeMap;

use serde::Deserialize;

use super::{Catalog, CatalogEntry, ContentHash};
use crate::error::{BundleError, BundleResult};

#[derive(Debug, Deserialize)]
struct ManifestDocument {
    bundles: BTreeMap<String, ManifestBundle>,
}

#[derive(Debug, Deserialize)]
struct ManifestBundle {
    hash: ContentHash,
    #[serde(default)]
    dependencies: Vec<String>,
}

/// Parse a manifest for `target`. Dependencies that name a bundle absent
/// from the manifest make the whole document unusable.
pub fn parse_manifest(target: &str, data: &[u8]) -> BundleResult<Catalog> {
    let doc: ManifestDocument = serde_json::from_slice(data)
        .map_err(|e| BundleError::ManifestUnavailable(format!("malformed manifest: {}", e)))?;

    for (name, bundle) in &doc.bundles {
        if let Some(missing) = bundle
            .dependencies
            .iter()
            .find(|dep| !doc.bundles.contains_key(dep.as_str()))
        {
            return Err(BundleError::ManifestUnavailable(format!(
                "bundle '{}' depends on unknown bundle '{}'",
                name, missing
            )));
        }
    }

    let entries = doc.bundles.into_iter().map(|(name, bundle)| CatalogEntry {
        name,
        hash: bundle.hash,
        dependencies: bundle.dependencies,
    });

    Ok(Catalog::new(target, entries))
}
