//! Walks driver cursors and materializes result objects per result map:
//! discriminator resolution, constructor and property mappings, nested
//! selects and nested result maps, auto-mapping, row bounds and linked
//! result sets.

use crate::cache::CacheKey;
use crate::executor::{
    Executor, NestedState, ResultContext, ResultHandler, RowBounds, SessionExecutor,
};
use crate::mapping::{MappedStatement, ResultMap, ResultMapping};
use crate::meta::{self, MetaObject};
use crate::registry::{AutoMappingBehavior, AutoMappingUnknownColumnBehavior, Configuration};
use crate::{Error, Result};
use driver::{ColumnMeta, DriverType, PreparedStatement, ResultCursor, Value};
use log::{debug, warn};
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Column-metadata snapshot for one result set.
struct Columns {
    metas: Vec<ColumnMeta>,
    use_label: bool,
}

impl Columns {
    fn of(cursor: &dyn ResultCursor, use_label: bool) -> Columns {
        Columns {
            metas: cursor.metadata().to_vec(),
            use_label,
        }
    }

    fn name_of<'a>(&self, meta: &'a ColumnMeta) -> &'a str {
        if self.use_label {
            &meta.label
        } else {
            &meta.name
        }
    }

    fn labels(&self) -> impl Iterator<Item = &str> {
        self.metas.iter().map(|m| self.name_of(m))
    }

    fn driver_type(&self, label: &str) -> Option<DriverType> {
        self.metas
            .iter()
            .find(|m| self.name_of(m).eq_ignore_ascii_case(label))
            .map(|m| m.driver_type)
    }

    fn has(&self, label: &str) -> bool {
        self.metas
            .iter()
            .any(|m| self.name_of(m).eq_ignore_ascii_case(label))
    }
}

fn prefixed(prefix: Option<&str>, column: &str) -> String {
    match prefix {
        Some(prefix) => format!("{prefix}{column}"),
        None => column.to_string(),
    }
}

fn strip_prefix_ci<'a>(label: &'a str, prefix: &str) -> Option<&'a str> {
    let head = label.get(..prefix.len())?;
    if head.eq_ignore_ascii_case(prefix) {
        Some(&label[prefix.len()..])
    } else {
        None
    }
}

fn decode_column(
    config: &Configuration,
    cursor: &dyn ResultCursor,
    columns: &Columns,
    label: &str,
    app_type: Option<&str>,
    converter_name: Option<&str>,
) -> Result<Value> {
    if !columns.has(label) {
        return Ok(Value::Null);
    }
    let converter = match converter_name {
        Some(name) => config
            .type_converters
            .named(name)
            .unwrap_or_else(|| config.type_converters.unknown_converter()),
        None => {
            let resolved = app_type.map(|t| config.resolve_type(t));
            config
                .type_converters
                .resolve_or_unknown(resolved.as_deref(), columns.driver_type(label))
        }
    };
    converter.decode_by_name(cursor, label)
}

/// Follow the discriminator chain to the effective result map for this row,
/// guarding against cycles.
fn resolve_discriminated(
    config: &Configuration,
    cursor: &dyn ResultCursor,
    columns: &Columns,
    start: Arc<ResultMap>,
    prefix: Option<&str>,
) -> Result<Arc<ResultMap>> {
    let mut current = start;
    let mut visited = HashSet::new();
    visited.insert(current.id.clone());
    while let Some(discriminator) = current.discriminator.clone() {
        let label = prefixed(prefix, &discriminator.column);
        let value = decode_column(
            config,
            cursor,
            columns,
            &label,
            discriminator.app_type.as_deref(),
            discriminator.converter.as_deref(),
        )?;
        let Some(case_id) = discriminator.cases.get(&crate::sql::value_to_text(&value)) else {
            break;
        };
        let Some(next) = config.result_map(case_id) else {
            break;
        };
        if !visited.insert(next.id.clone()) {
            break;
        }
        current = next;
    }
    Ok(current)
}

/// The row key for nested aggregation: result map id plus every ID column's
/// decoded value. `has_values` is false when every key column was null.
fn create_row_key(
    config: &Configuration,
    cursor: &dyn ResultCursor,
    columns: &Columns,
    result_map: &ResultMap,
    prefix: Option<&str>,
) -> Result<(CacheKey, bool)> {
    let mut key = CacheKey::new();
    key.update(Value::String(result_map.id.clone()));
    let mut has_values = false;
    let mappings = result_map.row_key_mappings();
    if mappings.is_empty() {
        for label in columns.labels().map(str::to_string).collect::<Vec<_>>() {
            let stripped = match prefix {
                Some(p) => match strip_prefix_ci(&label, p) {
                    Some(s) => s.to_string(),
                    None => continue,
                },
                None => label.clone(),
            };
            let value = decode_column(config, cursor, columns, &label, None, None)?;
            if !value.is_null() {
                has_values = true;
                key.update(Value::String(stripped));
                key.update(value);
            }
        }
        return Ok((key, has_values));
    }
    for mapping in mappings {
        let Some(column) = &mapping.column else { continue };
        let label = prefixed(prefix, column);
        let value = decode_column(
            config,
            cursor,
            columns,
            &label,
            mapping.app_type.as_deref(),
            mapping.converter.as_deref(),
        )?;
        if !value.is_null() {
            has_values = true;
            key.update(Value::String(column.clone()));
            key.update(value);
        }
    }
    Ok((key, has_values))
}

/// A property filled from a later, named result set.
struct PendingRelation {
    row_index: usize,
    property: String,
    many: bool,
    result_map_id: String,
    foreign_columns: Vec<String>,
    key_values: Vec<Value>,
}

/// Entry point: iterate every result set the statement expects.
pub(crate) fn handle_results(
    exec: &mut SessionExecutor,
    ms: &Arc<MappedStatement>,
    stmt: &mut dyn PreparedStatement,
    row_bounds: &RowBounds,
    mut handler: Option<&mut dyn ResultHandler>,
    allow_defer: bool,
) -> Result<Vec<Value>> {
    let mut cursor = stmt
        .execute_query()
        .map_err(|e| Error::execution(&ms.id, "<execute>", e))?;

    let mut pending: HashMap<String, Vec<PendingRelation>> = HashMap::new();
    let mut out = Vec::new();
    // a statement mapping several result sets yields one list per set
    let multi_mapped = ms.result_map_ids.len() > 1;
    let mut set_index = 0;
    loop {
        if let Some(map_id) = ms.result_map_ids.get(set_index) {
            let result_map =
                exec.config()
                    .result_map(map_id)
                    .ok_or_else(|| Error::ResultMaterialization {
                        statement: ms.id.clone(),
                        reason: format!("unknown result map '{map_id}'"),
                    })?;
            let rows = handle_result_set(
                exec,
                ms,
                cursor.as_mut(),
                &result_map,
                row_bounds,
                if set_index == 0 {
                    handler.take()
                } else {
                    None
                },
                allow_defer && set_index == 0,
                &mut pending,
            )?;
            if multi_mapped {
                out.push(Value::Array(rows));
            } else {
                out = rows;
            }
        } else if let Some(set_name) = ms.result_sets.get(set_index) {
            match pending.remove(set_name) {
                Some(relations) => {
                    attach_linked_set(exec, ms, cursor.as_mut(), relations, &mut out)?;
                }
                None => debug!(
                    "result set '{set_name}' of '{}' has no pending relations",
                    ms.id
                ),
            }
        } else {
            break;
        }
        set_index += 1;

        let expects_more =
            set_index < ms.result_map_ids.len() || set_index < ms.result_sets.len();
        if !expects_more || !exec.config().settings.multiple_result_sets_enabled {
            break;
        }
        match stmt.more_results()? {
            Some(next) => cursor = next,
            None => {
                // the driver produced fewer result sets than declared
                debug!(
                    "statement '{}' produced {set_index} result set(s), fewer than declared",
                    ms.id
                );
                break;
            }
        }
    }
    Ok(out)
}

#[allow(clippy::too_many_arguments)]
fn handle_result_set(
    exec: &mut SessionExecutor,
    ms: &Arc<MappedStatement>,
    cursor: &mut dyn ResultCursor,
    result_map: &Arc<ResultMap>,
    row_bounds: &RowBounds,
    mut handler: Option<&mut dyn ResultHandler>,
    allow_defer: bool,
    pending: &mut HashMap<String, Vec<PendingRelation>>,
) -> Result<Vec<Value>> {
    let config = exec.config();
    let columns = Columns::of(cursor, config.settings.use_column_label);

    skip_rows(cursor, row_bounds)?;

    let mut out: Vec<Value> = Vec::new();
    // row key -> index into `out`, reusing ancestors across rows
    let mut ancestors: HashMap<String, usize> = HashMap::new();
    // combined nested identity -> element index within its parent collection
    let mut positions: HashMap<String, usize> = HashMap::new();
    let mut context = ResultContext::new();

    while context.result_count() < row_bounds.limit && cursor.next()? {
        let row_map =
            resolve_discriminated(&config, cursor, &columns, result_map.clone(), None)?;
        if row_map.has_nested_result_maps {
            if config.settings.safe_row_bounds_enabled && !row_bounds.is_default() {
                return Err(Error::ResultMaterialization {
                    statement: ms.id.clone(),
                    reason: "row bounds cannot safely constrain nested result maps".to_string(),
                });
            }
            if config.settings.safe_result_handler_enabled && handler.is_some() {
                return Err(Error::ResultMaterialization {
                    statement: ms.id.clone(),
                    reason: "a result handler cannot safely consume nested result maps"
                        .to_string(),
                });
            }
            let (row_key, _) = create_row_key(&config, cursor, &columns, &row_map, None)?;
            let key_text = row_key.to_string();
            if let Some(&index) = ancestors.get(&key_text) {
                let mut existing = std::mem::take(&mut out[index]);
                apply_nested_result_maps(
                    exec, ms, cursor, &columns, &row_map, &mut existing, &key_text,
                    &mut positions,
                )?;
                out[index] = existing;
                continue;
            }
            let mut object = build_row(
                exec,
                ms,
                cursor,
                &columns,
                &row_map,
                None,
                false,
                allow_defer,
                out.len(),
                pending,
            )?;
            apply_nested_result_maps(
                exec, ms, cursor, &columns, &row_map, &mut object, &key_text, &mut positions,
            )?;
            ancestors.insert(key_text, out.len());
            store(&mut context, &mut handler, &mut out, object);
        } else {
            let object = build_row(
                exec,
                ms,
                cursor,
                &columns,
                &row_map,
                None,
                false,
                allow_defer,
                out.len(),
                pending,
            )?;
            store(&mut context, &mut handler, &mut out, object);
        }
        if context.is_stopped() {
            break;
        }
    }
    Ok(out)
}

fn store(
    context: &mut ResultContext,
    handler: &mut Option<&mut dyn ResultHandler>,
    out: &mut Vec<Value>,
    object: Value,
) {
    context.next(object);
    match handler {
        Some(handler) => handler.handle_result(context),
        None => out.push(context.object().clone()),
    }
}

pub(crate) fn skip_rows(cursor: &mut dyn ResultCursor, row_bounds: &RowBounds) -> Result<()> {
    if row_bounds.offset == 0 {
        return Ok(());
    }
    if cursor.supports_absolute() {
        cursor.absolute(row_bounds.offset)?;
    } else {
        for _ in 0..row_bounds.offset {
            if !cursor.next()? {
                break;
            }
        }
    }
    Ok(())
}

/// Materialize one object from the current row: constructor args first, then
/// explicit property mappings (columns and nested selects), then
/// auto-mapping of leftover columns. Nested result maps are applied by the
/// aggregation pass, not here.
#[allow(clippy::too_many_arguments)]
fn build_row(
    exec: &mut SessionExecutor,
    ms: &Arc<MappedStatement>,
    cursor: &mut dyn ResultCursor,
    columns: &Columns,
    result_map: &Arc<ResultMap>,
    prefix: Option<&str>,
    nested: bool,
    allow_defer: bool,
    row_index: usize,
    pending: &mut HashMap<String, Vec<PendingRelation>>,
) -> Result<Value> {
    let config = exec.config();
    let target_type = config.resolve_type(&result_map.type_name);
    let mut found_values = false;

    let mut object = if result_map.constructor_mappings.is_empty() {
        json!({})
    } else {
        let mut names = Vec::new();
        let mut args = Vec::new();
        for mapping in &result_map.constructor_mappings.clone() {
            let value = if mapping.nested_select.is_some() {
                run_nested_select(exec, ms, cursor, columns, mapping, prefix, false, 0)?
                    .unwrap_or(Value::Null)
            } else if let Some(nested_id) = &mapping.nested_result_map {
                let nested_map = config.result_map(nested_id).ok_or_else(|| {
                    Error::ResultMaterialization {
                        statement: ms.id.clone(),
                        reason: format!("unknown nested result map '{nested_id}'"),
                    }
                })?;
                let nested_prefix = join_prefix(prefix, mapping.column_prefix.as_deref());
                build_nested_object(
                    exec, ms, cursor, columns, &nested_map, nested_prefix.as_deref(),
                )?
                .unwrap_or(Value::Null)
            } else {
                let label =
                    prefixed(prefix, mapping.column.as_deref().unwrap_or_default());
                decode_column(
                    &config,
                    cursor,
                    columns,
                    &label,
                    mapping.app_type.as_deref(),
                    mapping.converter.as_deref(),
                )?
            };
            found_values |= !value.is_null();
            names.push(mapping.property.clone());
            args.push(value);
        }
        construct(&target_type, names, args, &ms.id)?
    };

    for mapping in &result_map.mappings.clone() {
        if mapping.nested_result_map.is_some() && mapping.result_set.is_none() {
            if mapping.many {
                if let Some(property) = &mapping.property {
                    ensure_array(&mut object, property)?;
                }
            }
            continue;
        }
        if let Some(set_name) = &mapping.result_set {
            queue_pending_relation(
                &config, cursor, columns, mapping, set_name, prefix, row_index, pending,
            )?;
            if mapping.many {
                if let Some(property) = &mapping.property {
                    ensure_array(&mut object, property)?;
                }
            }
            continue;
        }
        let Some(property) = &mapping.property else { continue };
        if mapping.nested_select.is_some() {
            if let Some(value) = run_nested_select(
                exec, ms, cursor, columns, mapping, prefix, allow_defer, row_index,
            )? {
                found_values |= !value.is_null();
                MetaObject::set(&mut object, property, value)?;
            }
            continue;
        }
        let label = prefixed(prefix, mapping.column.as_deref().unwrap_or(property));
        let value = decode_column(
            &config,
            cursor,
            columns,
            &label,
            mapping.app_type.as_deref(),
            mapping.converter.as_deref(),
        )?;
        if !value.is_null() {
            found_values = true;
            MetaObject::set_checked(&mut object, &target_type, property, value)?;
        } else if config.settings.call_setters_on_nulls {
            MetaObject::set_checked(&mut object, &target_type, property, Value::Null)?;
        }
    }

    found_values |= auto_map(
        &config, cursor, columns, result_map, &target_type, prefix, nested, &mut object, &ms.id,
    )?;

    if !found_values && !config.settings.return_instance_for_empty_row {
        return Ok(Value::Null);
    }
    Ok(object)
}

fn join_prefix(outer: Option<&str>, inner: Option<&str>) -> Option<String> {
    match (outer, inner) {
        (None, None) => None,
        (Some(o), None) => Some(o.to_string()),
        (None, Some(i)) => Some(i.to_string()),
        (Some(o), Some(i)) => Some(format!("{o}{i}")),
    }
}

fn ensure_array(object: &mut Value, property: &str) -> Result<()> {
    if MetaObject::get(object, property).is_null() {
        MetaObject::set(object, property, Value::Array(Vec::new()))?;
    }
    Ok(())
}

/// Instantiate through the registered constructor when the type has one;
/// otherwise constructor mappings populate the object by property name.
fn construct(
    target_type: &str,
    names: Vec<Option<String>>,
    args: Vec<Value>,
    statement_id: &str,
) -> Result<Value> {
    if let Some(descriptor) = meta::descriptor_for(target_type) {
        if let Some(factory) = descriptor.constructor() {
            return Ok(factory(args));
        }
    }
    let mut object = json!({});
    for (name, value) in names.into_iter().zip(args) {
        let Some(name) = name else {
            return Err(Error::ResultMaterialization {
                statement: statement_id.to_string(),
                reason: format!(
                    "constructor mapping for type '{target_type}' needs a property name or a registered constructor"
                ),
            });
        };
        MetaObject::set(&mut object, &name, value)?;
    }
    Ok(object)
}

/// Decode leftover columns into properties when auto-mapping applies.
#[allow(clippy::too_many_arguments)]
fn auto_map(
    config: &Configuration,
    cursor: &mut dyn ResultCursor,
    columns: &Columns,
    result_map: &Arc<ResultMap>,
    target_type: &str,
    prefix: Option<&str>,
    nested: bool,
    object: &mut Value,
    statement_id: &str,
) -> Result<bool> {
    let apply = match result_map.auto_mapping {
        Some(explicit) => explicit,
        None => match config.settings.auto_mapping_behavior {
            AutoMappingBehavior::None => false,
            AutoMappingBehavior::Partial => !nested && !result_map.has_nested_result_maps,
            AutoMappingBehavior::Full => true,
        },
    };
    if !apply {
        return Ok(false);
    }

    let descriptor = meta::descriptor_for(target_type);
    let mut found = false;
    for label in columns.labels().map(str::to_string).collect::<Vec<_>>() {
        let unprefixed = match prefix {
            Some(p) => match strip_prefix_ci(&label, p) {
                Some(stripped) => stripped.to_string(),
                None => continue,
            },
            None => label.clone(),
        };
        if result_map
            .mapped_columns
            .contains(&unprefixed.to_uppercase())
        {
            continue;
        }
        let candidate = if config.settings.map_underscore_to_camel_case {
            meta::underscore_to_camel(&unprefixed)
        } else {
            unprefixed.clone()
        };
        let property = match &descriptor {
            Some(descriptor) => match descriptor.find_property(&candidate) {
                Some(found) => found.to_string(),
                None => {
                    match config.settings.auto_mapping_unknown_column_behavior {
                        AutoMappingUnknownColumnBehavior::None => {}
                        AutoMappingUnknownColumnBehavior::Warning => warn!(
                            "unknown column '{label}' while auto-mapping onto '{target_type}'"
                        ),
                        AutoMappingUnknownColumnBehavior::Failing => {
                            return Err(Error::ResultMaterialization {
                                statement: statement_id.to_string(),
                                reason: format!(
                                    "column '{label}' does not map onto '{target_type}'"
                                ),
                            });
                        }
                    }
                    continue;
                }
            },
            None => candidate,
        };
        if result_map.mapped_properties.contains(&property) {
            continue;
        }
        let value = decode_column(config, cursor, columns, &label, None, None)?;
        if !value.is_null() {
            found = true;
            MetaObject::set(object, &property, value)?;
        } else if config.settings.call_setters_on_nulls {
            MetaObject::set(object, &property, Value::Null)?;
        }
    }
    Ok(found)
}

/// Build (or merge into) nested objects fed from the same row, preserving
/// identity by row key and appending to collection-valued parents.
#[allow(clippy::too_many_arguments)]
fn apply_nested_result_maps(
    exec: &mut SessionExecutor,
    ms: &Arc<MappedStatement>,
    cursor: &mut dyn ResultCursor,
    columns: &Columns,
    result_map: &Arc<ResultMap>,
    parent: &mut Value,
    parent_key: &str,
    positions: &mut HashMap<String, usize>,
) -> Result<()> {
    let config = exec.config();
    for mapping in result_map.mappings.clone() {
        let Some(nested_id) = &mapping.nested_result_map else { continue };
        if mapping.result_set.is_some() {
            continue;
        }
        let Some(property) = mapping.property.clone() else { continue };
        let nested_prefix = mapping.column_prefix.clone();
        let nested_map =
            config
                .result_map(nested_id)
                .ok_or_else(|| Error::ResultMaterialization {
                    statement: ms.id.clone(),
                    reason: format!("unknown nested result map '{nested_id}'"),
                })?;
        if !not_null_columns_present(&config, cursor, columns, &mapping, nested_prefix.as_deref())?
        {
            continue;
        }
        let nested_map = resolve_discriminated(
            &config,
            cursor,
            columns,
            nested_map,
            nested_prefix.as_deref(),
        )?;
        let (nested_key, has_values) = create_row_key(
            &config,
            cursor,
            columns,
            &nested_map,
            nested_prefix.as_deref(),
        )?;
        if !has_values {
            if mapping.many {
                ensure_array(parent, &property)?;
            }
            continue;
        }
        let combined = format!("{parent_key}|{property}|{nested_key}");
        if mapping.many {
            ensure_array(parent, &property)?;
            if let Some(&index) = positions.get(&combined) {
                // same nested row again: only its deeper collections can grow
                let slot = format!("{property}[{index}]");
                let mut element = MetaObject::get(parent, &slot);
                apply_nested_result_maps(
                    exec, ms, cursor, columns, &nested_map, &mut element, &combined, positions,
                )?;
                MetaObject::set(parent, &slot, element)?;
            } else if let Some(mut object) = build_nested_object(
                exec,
                ms,
                cursor,
                columns,
                &nested_map,
                nested_prefix.as_deref(),
            )? {
                apply_nested_result_maps(
                    exec, ms, cursor, columns, &nested_map, &mut object, &combined, positions,
                )?;
                let index = MetaObject::get(parent, &property)
                    .as_array()
                    .map(Vec::len)
                    .unwrap_or(0);
                push_to_array(parent, &property, object)?;
                positions.insert(combined, index);
            }
        } else if MetaObject::get(parent, &property).is_null() {
            if let Some(mut object) = build_nested_object(
                exec,
                ms,
                cursor,
                columns,
                &nested_map,
                nested_prefix.as_deref(),
            )? {
                apply_nested_result_maps(
                    exec, ms, cursor, columns, &nested_map, &mut object, &combined, positions,
                )?;
                MetaObject::set(parent, &property, object)?;
            }
        } else {
            // already present: deeper nested collections may still grow
            let mut existing = MetaObject::get(parent, &property);
            apply_nested_result_maps(
                exec, ms, cursor, columns, &nested_map, &mut existing, &combined, positions,
            )?;
            MetaObject::set(parent, &property, existing)?;
        }
    }
    Ok(())
}

fn push_to_array(parent: &mut Value, property: &str, object: Value) -> Result<()> {
    let mut items = MetaObject::get(parent, property);
    match items.as_array_mut() {
        Some(array) => {
            array.push(object);
            MetaObject::set(parent, property, items)
        }
        None => MetaObject::set(parent, property, Value::Array(vec![object])),
    }
}

fn not_null_columns_present(
    config: &Configuration,
    cursor: &mut dyn ResultCursor,
    columns: &Columns,
    mapping: &ResultMapping,
    prefix: Option<&str>,
) -> Result<bool> {
    for column in &mapping.not_null_columns {
        let label = prefixed(prefix, column);
        if decode_column(config, cursor, columns, &label, None, None)?.is_null() {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Build a nested object from the current row. No deferral and no linked
/// result sets at nested levels.
fn build_nested_object(
    exec: &mut SessionExecutor,
    ms: &Arc<MappedStatement>,
    cursor: &mut dyn ResultCursor,
    columns: &Columns,
    result_map: &Arc<ResultMap>,
    prefix: Option<&str>,
) -> Result<Option<Value>> {
    let mut pending = HashMap::new();
    let object = build_row(
        exec, ms, cursor, columns, result_map, prefix, true, false, 0, &mut pending,
    )?;
    Ok(if object.is_null() { None } else { Some(object) })
}

/// Execute (or defer) the nested select feeding one property. `Ok(None)`
/// means the value arrives later through the deferred-load queue.
#[allow(clippy::too_many_arguments)]
fn run_nested_select(
    exec: &mut SessionExecutor,
    ms: &Arc<MappedStatement>,
    cursor: &mut dyn ResultCursor,
    columns: &Columns,
    mapping: &ResultMapping,
    prefix: Option<&str>,
    allow_defer: bool,
    row_index: usize,
) -> Result<Option<Value>> {
    let config = exec.config();
    let nested_id = mapping.nested_select.clone().unwrap();

    // composite column bindings build the nested parameter; a single column
    // passes its value directly
    let parameter = if mapping.composites.is_empty() {
        let label = prefixed(prefix, mapping.column.as_deref().unwrap_or_default());
        decode_column(&config, cursor, columns, &label, None, None)?
    } else {
        let mut object = json!({});
        for (property, column) in &mapping.composites {
            let label = prefixed(prefix, column);
            let value = decode_column(&config, cursor, columns, &label, None, None)?;
            MetaObject::set(&mut object, property, value)?;
        }
        object
    };
    if parameter.is_null() {
        return Ok(Some(Value::Null));
    }

    let nested_ms = config.mapped_statement(&nested_id)?;
    let lazy = mapping.lazy
        || (config.settings.lazy_loading_enabled && !config.settings.aggressive_lazy_loading);

    match exec.nested_select_state(&nested_ms, &parameter)? {
        NestedState::Cached(rows) => Ok(Some(extract_nested(rows.as_ref(), mapping, &ms.id)?)),
        NestedState::Executing => {
            if allow_defer {
                exec.defer_load(
                    row_index,
                    mapping.property.clone().unwrap_or_default(),
                    nested_id,
                    parameter,
                    mapping.many,
                );
                Ok(None)
            } else {
                debug!(
                    "breaking circular nested select '{nested_id}' inside '{}'",
                    ms.id
                );
                Ok(Some(Value::Null))
            }
        }
        NestedState::Absent => {
            if lazy && allow_defer {
                exec.defer_load(
                    row_index,
                    mapping.property.clone().unwrap_or_default(),
                    nested_id,
                    parameter,
                    mapping.many,
                );
                return Ok(None);
            }
            let mut nested_parameter = parameter;
            let rows = exec.query(
                &nested_ms,
                &mut nested_parameter,
                &RowBounds::default(),
                None,
            )?;
            Ok(Some(extract_nested(rows.as_ref(), mapping, &ms.id)?))
        }
    }
}

pub(crate) fn extract_nested(
    rows: &[Value],
    mapping: &ResultMapping,
    statement_id: &str,
) -> Result<Value> {
    if mapping.many {
        return Ok(Value::Array(rows.to_vec()));
    }
    match rows.len() {
        0 => Ok(Value::Null),
        1 => Ok(rows[0].clone()),
        n => Err(Error::ResultMaterialization {
            statement: statement_id.to_string(),
            reason: format!("nested select returned {n} rows where one was expected"),
        }),
    }
}

#[allow(clippy::too_many_arguments)]
fn queue_pending_relation(
    config: &Configuration,
    cursor: &mut dyn ResultCursor,
    columns: &Columns,
    mapping: &ResultMapping,
    set_name: &str,
    prefix: Option<&str>,
    row_index: usize,
    pending: &mut HashMap<String, Vec<PendingRelation>>,
) -> Result<()> {
    let Some(property) = &mapping.property else {
        return Ok(());
    };
    let Some(result_map_id) = &mapping.nested_result_map else {
        return Ok(());
    };
    let parent_columns: Vec<String> = split_columns(mapping.column.as_deref());
    let foreign_columns: Vec<String> = split_columns(mapping.foreign_column.as_deref());
    let mut key_values = Vec::new();
    for column in &parent_columns {
        let label = prefixed(prefix, column);
        key_values.push(decode_column(config, cursor, columns, &label, None, None)?);
    }
    pending
        .entry(set_name.to_string())
        .or_default()
        .push(PendingRelation {
            row_index,
            property: property.clone(),
            many: mapping.many,
            result_map_id: result_map_id.clone(),
            foreign_columns,
            key_values,
        });
    Ok(())
}

fn split_columns(spec: Option<&str>) -> Vec<String> {
    spec.unwrap_or_default()
        .split(',')
        .map(|c| c.trim().to_string())
        .filter(|c| !c.is_empty())
        .collect()
}

/// Row materialization for lazy cursors: flat result maps only (columns,
/// constructor args, discriminator, auto-mapping). Nested selects and
/// nested result maps need executor re-entry, which a detached cursor
/// cannot provide.
pub(crate) struct FlatRowReader {
    columns: Columns,
    result_map: Arc<ResultMap>,
    statement_id: String,
}

impl FlatRowReader {
    pub(crate) fn new(
        config: &Configuration,
        cursor: &dyn ResultCursor,
        result_map: Arc<ResultMap>,
        statement_id: &str,
    ) -> Result<FlatRowReader> {
        Self::ensure_flat(&result_map, statement_id)?;
        Ok(FlatRowReader {
            columns: Columns::of(cursor, config.settings.use_column_label),
            result_map,
            statement_id: statement_id.to_string(),
        })
    }

    fn ensure_flat(result_map: &ResultMap, statement_id: &str) -> Result<()> {
        if result_map.has_nested_result_maps || result_map.has_nested_queries {
            return Err(Error::ResultMaterialization {
                statement: statement_id.to_string(),
                reason: "cursors do not support nested result maps or nested selects"
                    .to_string(),
            });
        }
        Ok(())
    }

    pub(crate) fn read(
        &self,
        config: &Configuration,
        cursor: &mut dyn ResultCursor,
    ) -> Result<Value> {
        let row_map = resolve_discriminated(
            config,
            cursor,
            &self.columns,
            self.result_map.clone(),
            None,
        )?;
        Self::ensure_flat(&row_map, &self.statement_id)?;
        let target_type = config.resolve_type(&row_map.type_name);
        let mut found_values = false;

        let mut object = if row_map.constructor_mappings.is_empty() {
            json!({})
        } else {
            let mut names = Vec::new();
            let mut args = Vec::new();
            for mapping in &row_map.constructor_mappings {
                let label = mapping.column.as_deref().unwrap_or_default();
                let value = decode_column(
                    config,
                    cursor,
                    &self.columns,
                    label,
                    mapping.app_type.as_deref(),
                    mapping.converter.as_deref(),
                )?;
                found_values |= !value.is_null();
                names.push(mapping.property.clone());
                args.push(value);
            }
            construct(&target_type, names, args, &self.statement_id)?
        };
        for mapping in &row_map.mappings {
            let Some(property) = &mapping.property else { continue };
            let label = mapping.column.as_deref().unwrap_or(property);
            let value = decode_column(
                config,
                cursor,
                &self.columns,
                label,
                mapping.app_type.as_deref(),
                mapping.converter.as_deref(),
            )?;
            if !value.is_null() {
                found_values = true;
                MetaObject::set_checked(&mut object, &target_type, property, value)?;
            } else if config.settings.call_setters_on_nulls {
                MetaObject::set_checked(&mut object, &target_type, property, Value::Null)?;
            }
        }
        found_values |= auto_map(
            config,
            cursor,
            &self.columns,
            &row_map,
            &target_type,
            None,
            false,
            &mut object,
            &self.statement_id,
        )?;
        if !found_values && !config.settings.return_instance_for_empty_row {
            return Ok(Value::Null);
        }
        Ok(object)
    }
}

/// Fill parent properties from a later result set, matching rows by their
/// foreign columns against the parents' recorded key values.
fn attach_linked_set(
    exec: &mut SessionExecutor,
    ms: &Arc<MappedStatement>,
    cursor: &mut dyn ResultCursor,
    relations: Vec<PendingRelation>,
    out: &mut [Value],
) -> Result<()> {
    let config = exec.config();
    let columns = Columns::of(cursor, config.settings.use_column_label);
    while cursor.next()? {
        for relation in &relations {
            let result_map = config.result_map(&relation.result_map_id).ok_or_else(|| {
                Error::ResultMaterialization {
                    statement: ms.id.clone(),
                    reason: format!("unknown result map '{}'", relation.result_map_id),
                }
            })?;
            let mut foreign_values = Vec::new();
            for column in &relation.foreign_columns {
                foreign_values.push(decode_column(&config, cursor, &columns, column, None, None)?);
            }
            if foreign_values != relation.key_values {
                continue;
            }
            let Some(object) =
                build_nested_object(exec, ms, cursor, &columns, &result_map, None)?
            else {
                continue;
            };
            let Some(parent) = out.get_mut(relation.row_index) else {
                continue;
            };
            if relation.many {
                push_to_array(parent, &relation.property, object)?;
            } else {
                MetaObject::set(parent, &relation.property, object)?;
            }
        }
    }
    Ok(())
}
