//! Block registry with a copy-on-write resolved cache.
//!
//! Lookups run against an immutable snapshot behind an `Arc`; registration
//! re-resolves the whole definition set and swaps the snapshot in one write,
//! so executing steps never observe a half-rebuilt view.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::Value;
use uuid::Uuid;

use super::resolver::resolve_all;
use crate::error::EngineError;
use crate::model::{BlockDefinition, ErrorCodeDef};
use crate::sandbox::validate_snippet;

/// A block definition with its inheritance-derived fields. Never
/// user-edited; rebuilt whenever any definition changes.
#[derive(Debug, Clone)]
pub struct ResolvedBlock {
    pub definition: BlockDefinition,
    pub resolved_code: String,
    pub resolved_config_defaults: Value,
    /// Child-to-root order; runs first to last.
    pub pre_process_chain: Vec<String>,
    /// Root-to-child order; runs first to last.
    pub post_process_chain: Vec<String>,
    /// Chain-merged error code table used for retry classification.
    pub error_codes: Vec<ErrorCodeDef>,
    pub depth: usize,
}

#[derive(Default)]
struct Snapshot {
    by_id: HashMap<Uuid, Arc<ResolvedBlock>>,
    by_slug: HashMap<String, Arc<ResolvedBlock>>,
}

pub struct BlockRegistry {
    definitions: RwLock<Vec<BlockDefinition>>,
    snapshot: RwLock<Arc<Snapshot>>,
    max_depth: usize,
}

impl BlockRegistry {
    pub fn new(max_depth: usize) -> Self {
        Self {
            definitions: RwLock::new(Vec::new()),
            snapshot: RwLock::new(Arc::new(Snapshot::default())),
            max_depth,
        }
    }

    /// Registry preloaded with the builtin system blocks.
    pub fn with_system_blocks(max_depth: usize) -> Result<Self, EngineError> {
        let registry = Self::new(max_depth);
        registry.register_many(super::seed::system_blocks())?;
        Ok(registry)
    }

    /// Register or replace one definition (matched by id, then by slug for
    /// same-tenant replacements) and rebuild the resolved cache.
    pub fn register(&self, definition: BlockDefinition) -> Result<(), EngineError> {
        self.register_many(vec![definition])
    }

    pub fn register_many(&self, incoming: Vec<BlockDefinition>) -> Result<(), EngineError> {
        for def in &incoming {
            validate_definition(def)?;
        }

        let mut definitions = self.definitions.write();
        let mut next = definitions.clone();
        for def in incoming {
            match next
                .iter()
                .position(|d| d.id == def.id || (d.slug == def.slug && d.tenant_id == def.tenant_id))
            {
                Some(pos) => next[pos] = def,
                None => next.push(def),
            }
        }

        // Resolve before committing; a bad definition leaves the registry
        // unchanged.
        let resolved = resolve_all(&next, self.max_depth)?;
        let mut snapshot = Snapshot::default();
        for view in resolved.into_values() {
            let view = Arc::new(view);
            snapshot.by_slug.insert(view.definition.slug.clone(), view.clone());
            snapshot.by_id.insert(view.definition.id, view);
        }

        *definitions = next;
        *self.snapshot.write() = Arc::new(snapshot);
        Ok(())
    }

    pub fn get_by_id(&self, id: Uuid) -> Option<Arc<ResolvedBlock>> {
        self.snapshot.read().by_id.get(&id).cloned()
    }

    pub fn get_by_slug(&self, slug: &str) -> Option<Arc<ResolvedBlock>> {
        self.snapshot.read().by_slug.get(slug).cloned()
    }

    pub fn slugs(&self) -> Vec<String> {
        let mut slugs: Vec<String> = self.snapshot.read().by_slug.keys().cloned().collect();
        slugs.sort();
        slugs
    }

    pub fn len(&self) -> usize {
        self.snapshot.read().by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn validate_definition(def: &BlockDefinition) -> Result<(), EngineError> {
    let invalid = |reason: String| EngineError::InvalidBlock {
        slug: def.slug.clone(),
        reason,
    };

    if def.slug.trim().is_empty() {
        return Err(invalid("slug is empty".into()));
    }
    for (label, code) in [
        ("code", &def.code),
        ("pre_process", &def.pre_process),
        ("post_process", &def.post_process),
    ] {
        if !code.trim().is_empty() {
            validate_snippet(code).map_err(|e| invalid(format!("{label}: {e}")))?;
        }
    }
    for (label, schema) in [
        ("config_schema", &def.config_schema),
        ("input_schema", &def.input_schema),
        ("output_schema", &def.output_schema),
    ] {
        if !schema.is_null() {
            jsonschema::JSONSchema::compile(schema)
                .map_err(|e| invalid(format!("{label} is not a valid JSON Schema: {e}")))?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::BlockCategory;
    use serde_json::json;

    fn block(slug: &str) -> BlockDefinition {
        BlockDefinition::new(slug, slug, BlockCategory::Integration)
    }

    #[test]
    fn test_register_and_lookup() {
        let registry = BlockRegistry::new(50);
        let http = block("http").with_code("return input;");
        let id = http.id;
        registry.register(http).unwrap();

        assert!(registry.get_by_slug("http").is_some());
        assert!(registry.get_by_id(id).is_some());
        assert!(registry.get_by_slug("missing").is_none());
    }

    #[test]
    fn test_register_rejects_await() {
        let registry = BlockRegistry::new(50);
        let bad = block("bad").with_code("var x = await fetch('u'); return x;");
        let err = registry.register(bad).unwrap_err();
        assert!(matches!(err, EngineError::InvalidBlock { .. }));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_register_rejects_invalid_schema() {
        let registry = BlockRegistry::new(50);
        let bad = block("bad")
            .with_code("return input;")
            .with_config_schema(json!({"type": "nonsense"}));
        assert!(registry.register(bad).is_err());
    }

    #[test]
    fn test_failed_rebuild_leaves_registry_unchanged() {
        let registry = BlockRegistry::new(50);
        let root = block("root").with_code("return input;");
        registry.register(root).unwrap();
        assert_eq!(registry.len(), 1);

        let orphan = block("orphan").with_parent(Uuid::new_v4());
        assert!(registry.register(orphan).is_err());
        assert_eq!(registry.len(), 1);
        assert!(registry.get_by_slug("orphan").is_none());
    }

    #[test]
    fn test_replace_by_slug_rebuilds_children() {
        let registry = BlockRegistry::new(50);
        let root = block("root").with_code("return 'v1';");
        let child = block("child").with_parent(root.id);
        registry.register_many(vec![root.clone(), child.clone()]).unwrap();
        assert_eq!(registry.get_by_id(child.id).unwrap().resolved_code, "return 'v1';");

        let mut updated = root.clone();
        updated.code = "return 'v2';".to_string();
        updated.version += 1;
        registry.register(updated).unwrap();

        assert_eq!(registry.get_by_id(child.id).unwrap().resolved_code, "return 'v2';");
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_system_blocks_load() {
        let registry = BlockRegistry::with_system_blocks(50).unwrap();
        for slug in ["start", "code", "http", "llm", "condition", "switch", "router", "map", "wait", "subflow", "human_in_loop", "log", "tool"] {
            assert!(registry.get_by_slug(slug).is_some(), "missing system block {slug}");
        }
    }
}
