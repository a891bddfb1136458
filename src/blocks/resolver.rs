//! Inheritance resolution over the block definition graph.
//!
//! Blocks form a forest where `parent_block_id` is an edge toward the root.
//! A single Kahn pass over in-degrees resolves every block exactly once: a
//! block is processed only after its parent, so each resolved view is
//! derived in O(1) from the parent's. Failure to drain the queue means a
//! cycle; depth is measured as the pass walks down.

use std::collections::HashMap;

use serde_json::Value;
use uuid::Uuid;

use super::registry::ResolvedBlock;
use crate::error::EngineError;
use crate::model::{BlockDefinition, ErrorCodeDef};

/// Resolve every definition, returning resolved views keyed by block id.
pub fn resolve_all(
    definitions: &[BlockDefinition],
    max_depth: usize,
) -> Result<HashMap<Uuid, ResolvedBlock>, EngineError> {
    let by_id: HashMap<Uuid, &BlockDefinition> =
        definitions.iter().map(|d| (d.id, d)).collect();

    let mut children: HashMap<Uuid, Vec<Uuid>> = HashMap::new();
    let mut queue: Vec<Uuid> = Vec::new();
    for def in definitions {
        match def.parent_block_id {
            Some(parent_id) => {
                if !by_id.contains_key(&parent_id) {
                    return Err(EngineError::UnknownParent(def.slug.clone()));
                }
                children.entry(parent_id).or_default().push(def.id);
            }
            None => queue.push(def.id),
        }
    }

    let mut resolved: HashMap<Uuid, ResolvedBlock> = HashMap::with_capacity(definitions.len());
    let mut cursor = 0;
    while cursor < queue.len() {
        let id = queue[cursor];
        cursor += 1;
        let def = by_id[&id];

        let view = match def.parent_block_id.map(|pid| &resolved[&pid]) {
            None => ResolvedBlock::root(def),
            Some(parent) => {
                let depth = parent.depth + 1;
                if depth > max_depth {
                    return Err(EngineError::DepthExceeded {
                        slug: def.slug.clone(),
                        depth,
                        max: max_depth,
                    });
                }
                ResolvedBlock::inherit(def, parent)
            }
        };
        resolved.insert(id, view);

        if let Some(kids) = children.get(&id) {
            queue.extend(kids.iter().copied());
        }
    }

    if resolved.len() != definitions.len() {
        let stuck = definitions
            .iter()
            .find(|d| !resolved.contains_key(&d.id))
            .map(|d| d.slug.clone())
            .unwrap_or_default();
        return Err(EngineError::CircularInheritance(stuck));
    }

    // A chain is executable only when some ancestor defines code.
    for def in definitions {
        if def.parent_block_id.is_some() {
            let view = &resolved[&def.id];
            if view.resolved_code.trim().is_empty() {
                return Err(EngineError::NotInheritable(def.slug.clone()));
            }
        }
    }

    Ok(resolved)
}

impl ResolvedBlock {
    fn root(def: &BlockDefinition) -> Self {
        ResolvedBlock {
            definition: def.clone(),
            resolved_code: def.code.clone(),
            resolved_config_defaults: if def.config_defaults.is_object() {
                def.config_defaults.clone()
            } else {
                Value::Object(Default::default())
            },
            pre_process_chain: non_empty(&def.pre_process).into_iter().collect(),
            post_process_chain: non_empty(&def.post_process).into_iter().collect(),
            error_codes: def.error_codes.clone(),
            depth: 0,
        }
    }

    fn inherit(def: &BlockDefinition, parent: &ResolvedBlock) -> Self {
        let resolved_code = if def.has_own_code() {
            def.code.clone()
        } else {
            parent.resolved_code.clone()
        };

        let mut defaults = parent.resolved_config_defaults.clone();
        deep_merge(&mut defaults, &def.config_defaults);

        // pre chain runs child-first, post chain root-first.
        let mut pre_process_chain: Vec<String> = non_empty(&def.pre_process).into_iter().collect();
        pre_process_chain.extend(parent.pre_process_chain.iter().cloned());
        let mut post_process_chain = parent.post_process_chain.clone();
        post_process_chain.extend(non_empty(&def.post_process));

        let mut definition = def.clone();
        if is_empty_schema(&definition.config_schema) {
            definition.config_schema = parent.definition.config_schema.clone();
        }
        if is_empty_schema(&definition.input_schema) {
            definition.input_schema = parent.definition.input_schema.clone();
        }
        if is_empty_schema(&definition.output_schema) {
            definition.output_schema = parent.definition.output_schema.clone();
        }

        ResolvedBlock {
            definition,
            resolved_code,
            resolved_config_defaults: defaults,
            pre_process_chain,
            post_process_chain,
            error_codes: merge_error_codes(&parent.error_codes, &def.error_codes),
            depth: parent.depth + 1,
        }
    }
}

fn non_empty(code: &str) -> Option<String> {
    if code.trim().is_empty() {
        None
    } else {
        Some(code.to_string())
    }
}

fn is_empty_schema(schema: &Value) -> bool {
    match schema {
        Value::Null => true,
        Value::Object(map) => map.is_empty(),
        _ => false,
    }
}

/// Ancestor codes are kept unless the child redeclares the same code.
fn merge_error_codes(parent: &[ErrorCodeDef], child: &[ErrorCodeDef]) -> Vec<ErrorCodeDef> {
    let mut merged: Vec<ErrorCodeDef> = parent
        .iter()
        .filter(|p| !child.iter().any(|c| c.code == p.code))
        .cloned()
        .collect();
    merged.extend(child.iter().cloned());
    merged
}

/// Merge `overlay` into `base`: objects merge recursively, anything else in
/// the overlay replaces the base value.
pub fn deep_merge(base: &mut Value, overlay: &Value) {
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                match base_map.get_mut(key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        base_map.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (base, overlay) => {
            if !overlay.is_null() {
                *base = overlay.clone();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::BlockCategory;
    use serde_json::json;

    fn block(slug: &str) -> BlockDefinition {
        BlockDefinition::new(slug, slug, BlockCategory::Integration)
    }

    fn chain_of(depth: usize) -> Vec<BlockDefinition> {
        let mut blocks = vec![block("root").with_code("return input;")];
        for i in 1..depth {
            let parent_id = blocks[i - 1].id;
            blocks.push(block(&format!("level{i}")).with_parent(parent_id));
        }
        blocks
    }

    #[test]
    fn test_root_resolves_to_itself() {
        let root = block("http").with_code("return ctx.http.get(config.url);");
        let resolved = resolve_all(&[root.clone()], 50).unwrap();
        let view = &resolved[&root.id];
        assert_eq!(view.resolved_code, root.code);
        assert_eq!(view.depth, 0);
        assert!(view.pre_process_chain.is_empty());
    }

    #[test]
    fn test_code_comes_from_nearest_ancestor_with_code() {
        let root = block("http").with_code("return 'root';");
        let middle = block("rest-api").with_parent(root.id);
        let leaf = block("github-api")
            .with_parent(middle.id)
            .with_code("return 'leaf';");

        let resolved = resolve_all(&[root.clone(), middle.clone(), leaf.clone()], 50).unwrap();
        assert_eq!(resolved[&middle.id].resolved_code, "return 'root';");
        assert_eq!(resolved[&leaf.id].resolved_code, "return 'leaf';");
    }

    #[test]
    fn test_chain_order() {
        let root = block("http")
            .with_code("return input;")
            .with_pre_process("/* root pre */")
            .with_post_process("/* root post */");
        let mid = block("rest-api")
            .with_parent(root.id)
            .with_pre_process("/* mid pre */");
        let leaf = block("github")
            .with_parent(mid.id)
            .with_pre_process("/* leaf pre */")
            .with_post_process("/* leaf post */");

        let resolved = resolve_all(&[root, mid, leaf.clone()], 50).unwrap();
        let view = &resolved[&leaf.id];
        // Pre runs child-first up to the root.
        assert_eq!(
            view.pre_process_chain,
            vec!["/* leaf pre */", "/* mid pre */", "/* root pre */"]
        );
        // Post runs root-first down to the child.
        assert_eq!(view.post_process_chain, vec!["/* root post */", "/* leaf post */"]);
    }

    #[test]
    fn test_config_defaults_child_overrides() {
        let root = block("http")
            .with_code("return input;")
            .with_config_defaults(json!({"timeout_ms": 30000, "retries": {"max": 3, "delay": 100}}));
        let leaf = block("github")
            .with_parent(root.id)
            .with_config_defaults(json!({"base_url": "https://api.github.com", "retries": {"max": 5}}));

        let resolved = resolve_all(&[root, leaf.clone()], 50).unwrap();
        let defaults = &resolved[&leaf.id].resolved_config_defaults;
        assert_eq!(defaults["timeout_ms"], json!(30000));
        assert_eq!(defaults["base_url"], json!("https://api.github.com"));
        // Nested objects merge rather than replace.
        assert_eq!(defaults["retries"]["max"], json!(5));
        assert_eq!(defaults["retries"]["delay"], json!(100));
    }

    #[test]
    fn test_circular_inheritance_detected() {
        let mut a = block("a").with_code("return 1;");
        let mut b = block("b");
        a.parent_block_id = Some(b.id);
        b.parent_block_id = Some(a.id);
        let err = resolve_all(&[a, b], 50).unwrap_err();
        assert!(matches!(err, EngineError::CircularInheritance(_)));
    }

    #[test]
    fn test_depth_limit() {
        let blocks = chain_of(10);
        assert!(resolve_all(&blocks, 50).is_ok());
        let err = resolve_all(&blocks, 5).unwrap_err();
        assert!(matches!(err, EngineError::DepthExceeded { .. }));
    }

    #[test]
    fn test_unknown_parent() {
        let orphan = block("orphan").with_parent(Uuid::new_v4());
        let err = resolve_all(&[orphan], 50).unwrap_err();
        assert!(matches!(err, EngineError::UnknownParent(_)));
    }

    #[test]
    fn test_codeless_chain_is_not_inheritable() {
        let root = block("empty-root");
        let leaf = block("leaf").with_parent(root.id);
        let err = resolve_all(&[root, leaf], 50).unwrap_err();
        assert!(matches!(err, EngineError::NotInheritable(slug) if slug == "leaf"));
    }

    #[test]
    fn test_schema_inherited_when_empty() {
        let root = block("http")
            .with_code("return input;")
            .with_config_schema(json!({"type": "object", "properties": {"url": {"type": "string"}}}));
        let leaf = block("github").with_parent(root.id);

        let resolved = resolve_all(&[root.clone(), leaf.clone()], 50).unwrap();
        assert_eq!(
            resolved[&leaf.id].definition.config_schema,
            root.config_schema
        );
    }

    #[test]
    fn test_resolution_is_deterministic() {
        let blocks = chain_of(6);
        let first = resolve_all(&blocks, 50).unwrap();
        let second = resolve_all(&blocks, 50).unwrap();
        for def in &blocks {
            let a = &first[&def.id];
            let b = &second[&def.id];
            assert_eq!(a.resolved_code, b.resolved_code);
            assert_eq!(a.resolved_config_defaults, b.resolved_config_defaults);
            assert_eq!(a.pre_process_chain, b.pre_process_chain);
            assert_eq!(a.post_process_chain, b.post_process_chain);
        }
    }

    #[test]
    fn test_deep_merge_scalars_and_arrays_replace() {
        let mut base = json!({"a": [1, 2], "b": "keep", "c": {"x": 1}});
        deep_merge(&mut base, &json!({"a": [3], "c": {"y": 2}}));
        assert_eq!(base["a"], json!([3]));
        assert_eq!(base["b"], json!("keep"));
        assert_eq!(base["c"], json!({"x": 1, "y": 2}));
    }
}
