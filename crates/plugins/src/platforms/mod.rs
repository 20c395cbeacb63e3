//! Built-in plugins.
//!
//! `plugins.json` carries the matchers and arguments of every built-in so the
//! registry can match URLs without constructing any plugin. The file is only
//! trusted while its hash equals [`BUILTIN_METADATA_SHA256`]; otherwise all
//! built-ins are loaded eagerly.

pub mod declarative;
pub mod hls;
pub mod nicolive;

use crate::error::PluginError;
use crate::plugin::PluginSpec;
use crate::registry::BuiltinPlugins;

pub const BUILTIN_METADATA: &str = include_str!("plugins.json");

pub const BUILTIN_METADATA_SHA256: &str =
    "fee0b064c99c64cfa64baf3fae27fe27a7fe410eeb938f3ccaeaaad9d29fcb61";

pub const BUILTIN_NAMES: &[&str] = &[hls::NAME, nicolive::NAME];

pub fn load_builtin(name: &str) -> Result<PluginSpec, PluginError> {
    match name {
        hls::NAME => hls::spec(),
        nicolive::NAME => nicolive::spec(),
        other => Err(PluginError::load(other, "no such built-in plugin")),
    }
}

pub fn builtins() -> BuiltinPlugins {
    BuiltinPlugins {
        metadata: BUILTIN_METADATA,
        sha256: BUILTIN_METADATA_SHA256,
        names: BUILTIN_NAMES,
        loader: load_builtin,
    }
}

#[cfg(test)]
mod tests {
    use sha2::{Digest, Sha256};

    use super::*;
    use crate::registry::PluginManifest;

    #[test]
    fn metadata_hash_is_current() {
        let digest = hex::encode(Sha256::digest(BUILTIN_METADATA.as_bytes()));
        assert_eq!(digest, BUILTIN_METADATA_SHA256);
    }

    #[test]
    fn metadata_agrees_with_the_plugins() {
        let manifests: Vec<PluginManifest> = serde_json::from_str(BUILTIN_METADATA).unwrap();
        let names: Vec<&str> = manifests.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, BUILTIN_NAMES);

        for manifest in &manifests {
            let spec = load_builtin(&manifest.name).unwrap();
            let patterns: Vec<&str> = spec.matchers.iter().map(|m| m.pattern.as_str()).collect();
            let declared: Vec<&str> = manifest.matchers.iter().map(|m| m.pattern.as_str()).collect();
            assert_eq!(patterns, declared, "{}", manifest.name);

            let priorities: Vec<_> = spec.matchers.iter().map(|m| m.priority).collect();
            let declared: Vec<_> = manifest.matchers.iter().map(|m| m.priority).collect();
            assert_eq!(priorities, declared, "{}", manifest.name);
            assert_eq!(
                spec.arguments.iter().map(|a| a.name.as_str()).collect::<Vec<_>>(),
                manifest.arguments.iter().map(|a| a.name.as_str()).collect::<Vec<_>>()
            );
        }
        assert!(load_builtin("missing").is_err());
    }
}
