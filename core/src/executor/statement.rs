//! Statement preparation and parameter binding: the bridge between a
//! compiled statement plus its bound SQL and a live driver statement.

use crate::mapping::{MappedStatement, ParameterMode, StatementKind};
use crate::meta::MetaObject;
use crate::registry::Configuration;
use crate::sql::{value_to_text, BoundSql};
use crate::{Error, Result};
use driver::{Connection, DriverType, PreparedStatement, StatementConfig, Value};
use log::debug;

/// Create and configure the driver statement for one execution: statement
/// kind, generated-keys request, fetch size, and the shortest applicable
/// query timeout.
pub(crate) fn prepare(
    connection: &mut dyn Connection,
    config: &Configuration,
    ms: &MappedStatement,
    bound: &BoundSql,
    scrollable: bool,
    tx_timeout: Option<u64>,
) -> Result<Box<dyn PreparedStatement>> {
    let sql = match ms.kind {
        // plain statements carry their parameters inline
        StatementKind::Statement => inline_parameters(bound),
        _ => bound.sql.clone(),
    };
    debug!("==> preparing: {sql}");
    let statement_config = StatementConfig {
        return_generated_keys: ms.key_generator.wants_driver_keys(),
        callable: ms.kind == StatementKind::Callable,
        scrollable,
    };
    let mut stmt = connection
        .prepare(&sql, &statement_config)
        .map_err(|e| Error::execution(&ms.id, &sql, e))?;

    let outcome = configure(stmt.as_mut(), config, ms, tx_timeout);
    if let Err(e) = outcome {
        stmt.close();
        return Err(e);
    }
    Ok(stmt)
}

fn configure(
    stmt: &mut dyn PreparedStatement,
    config: &Configuration,
    ms: &MappedStatement,
    tx_timeout: Option<u64>,
) -> Result<()> {
    if let Some(fetch_size) = ms.fetch_size.or(config.settings.default_fetch_size) {
        stmt.set_fetch_size(fetch_size)?;
    }
    let statement_timeout = ms.timeout.or(config.settings.default_statement_timeout);
    let timeout = match (statement_timeout, tx_timeout) {
        (Some(s), Some(t)) => Some(s.min(t)),
        (s, t) => s.or(t),
    };
    if let Some(timeout) = timeout {
        stmt.set_query_timeout(timeout)?;
    }
    Ok(())
}

/// Bind every parameter mapping positionally. OUT parameters of callable
/// statements are registered instead of bound; binding failures close the
/// statement at the caller.
pub(crate) fn parameterize(
    stmt: &mut dyn PreparedStatement,
    config: &Configuration,
    ms: &MappedStatement,
    bound: &BoundSql,
) -> Result<()> {
    if ms.kind == StatementKind::Statement {
        return Ok(());
    }
    for (position, mapping) in bound.parameter_mappings.iter().enumerate() {
        let index = position + 1;
        if mapping.mode.is_out() {
            stmt.register_out(
                index,
                mapping.driver_type.unwrap_or(DriverType::Other),
            )?;
        }
        if !mapping.mode.is_in() {
            continue;
        }
        let value = bound.value_of(&mapping.property);
        let driver_type = mapping.driver_type.unwrap_or_else(|| {
            if value.is_null() {
                config.settings.jdbc_type_for_null
            } else {
                DriverType::Undefined
            }
        });
        let converter = match &mapping.converter {
            Some(name) => config.type_converters.named(name).ok_or_else(|| {
                Error::malformed(format!(
                    "statement '{}' references unknown typeHandler '{name}'",
                    ms.id
                ))
            })?,
            None => {
                let app_type = mapping
                    .app_type
                    .as_deref()
                    .map(|t| config.resolve_type(t));
                config
                    .type_converters
                    .resolve_or_unknown(app_type.as_deref(), mapping.driver_type)
            }
        };
        debug!("==> parameter {index} ({}) = {value}", mapping.property);
        converter.bind(stmt, index, &value, driver_type)?;
    }
    Ok(())
}

/// Read callable OUT parameters back into the caller's parameter object.
pub(crate) fn handle_out_parameters(
    stmt: &mut dyn PreparedStatement,
    config: &Configuration,
    bound: &BoundSql,
    parameter: &mut Value,
) -> Result<()> {
    for (position, mapping) in bound.parameter_mappings.iter().enumerate() {
        if !mapping.mode.is_out() {
            continue;
        }
        let converter = config.type_converters.resolve_or_unknown(
            mapping
                .app_type
                .as_deref()
                .map(|t| config.resolve_type(t))
                .as_deref(),
            mapping.driver_type,
        );
        let value = converter.decode_out(stmt, position + 1)?;
        MetaObject::set(parameter, &mapping.property, value)?;
    }
    Ok(())
}

/// Retrieve driver-generated keys and assign them to the key properties of
/// the parameter object; collection parameters get row-aligned assignment.
pub(crate) fn assign_generated_keys(
    stmt: &mut dyn PreparedStatement,
    ms: &MappedStatement,
    parameter: &mut Value,
) -> Result<()> {
    if ms.key_properties.is_empty() {
        return Ok(());
    }
    let mut cursor = stmt
        .generated_keys()
        .map_err(|e| Error::execution(&ms.id, "<generated keys>", e))?;
    let mut key_rows = Vec::new();
    while cursor.next()? {
        let mut row = Vec::new();
        for (i, property) in ms.key_properties.iter().enumerate() {
            let value = if let Some(column) = ms.key_columns.get(i) {
                match cursor.column_index(column) {
                    Some(index) => cursor.get(index)?,
                    None => Value::Null,
                }
            } else {
                cursor.get(i + 1)?
            };
            row.push((property.clone(), value));
        }
        key_rows.push(row);
    }
    if key_rows.is_empty() {
        return Ok(());
    }

    match collection_target(parameter) {
        Some(items) => {
            for (item, row) in items.iter_mut().zip(key_rows) {
                for (property, value) in row {
                    MetaObject::set(item, &property, value)?;
                }
            }
        }
        None => {
            for (property, value) in key_rows.into_iter().next().unwrap() {
                MetaObject::set(parameter, &property, value)?;
            }
        }
    }
    Ok(())
}

// A packed collection parameter receives keys per element.
fn collection_target(parameter: &mut Value) -> Option<&mut Vec<Value>> {
    match parameter {
        Value::Array(items) => Some(items),
        Value::Object(map) => {
            for key in ["list", "collection", "array"] {
                if map.contains_key(key) {
                    return map.get_mut(key).and_then(Value::as_array_mut);
                }
            }
            None
        }
        _ => None,
    }
}

// Render parameter values as SQL literals for STATEMENT-kind execution.
fn inline_parameters(bound: &BoundSql) -> String {
    let mut sql = String::with_capacity(bound.sql.len());
    let mut values = bound
        .parameter_mappings
        .iter()
        .map(|m| bound.value_of(&m.property));
    let mut rest = bound.sql.as_str();
    while let Some(at) = rest.find('?') {
        sql.push_str(&rest[..at]);
        match values.next() {
            Some(Value::Null) | None => sql.push_str("NULL"),
            Some(Value::String(s)) => {
                sql.push('\'');
                sql.push_str(&s.replace('\'', "''"));
                sql.push('\'');
            }
            Some(other) => sql.push_str(&value_to_text(&other)),
        }
        rest = &rest[at + 1..];
    }
    sql.push_str(rest);
    sql
}

#[cfg(test)]
mod unit {
    use super::*;
    use crate::mapping::{CommandKind, ParameterMapping};
    use crate::sql::StaticSqlSource;
    use driver::testing;
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::Arc;

    fn bound(sql: &str, props: &[&str], parameter: Value) -> BoundSql {
        BoundSql {
            sql: sql.to_string(),
            parameter_mappings: props.iter().map(|p| ParameterMapping::of(p)).collect(),
            parameter,
            additional_parameters: HashMap::new(),
        }
    }

    fn statement(id: &str) -> MappedStatement {
        let source: Arc<dyn crate::sql::SqlSource> =
            Arc::new(StaticSqlSource::new(String::new(), Vec::new()));
        MappedStatement::builder(id, CommandKind::Select, source).build()
    }

    #[test]
    fn parameters_bind_in_positional_order() {
        let script = testing::install("mem://stmt-bind");
        script
            .when("SELECT * FROM t WHERE a = ? AND b = ?")
            .returns(&[("a", DriverType::Integer)], vec![]);
        let mut conn = driver::manager::connect("mem://stmt-bind", &HashMap::new()).unwrap();
        let config = Configuration::new();
        let ms = statement("n.s");
        let b = bound(
            "SELECT * FROM t WHERE a = ? AND b = ?",
            &["a", "b"],
            json!({"a": 1, "b": "x"}),
        );
        let mut stmt = prepare(conn.as_mut(), &config, &ms, &b, false, None).unwrap();
        parameterize(stmt.as_mut(), &config, &ms, &b).unwrap();
        stmt.execute_query().unwrap();
        assert_eq!(
            script.executions()[0].parameters,
            vec![json!(1), json!("x")]
        );
    }

    #[test]
    fn statement_kind_inlines_literals() {
        let b = bound(
            "SELECT * FROM t WHERE a = ? AND b = ?",
            &["a", "b"],
            json!({"a": 1, "b": "O'Neil"}),
        );
        assert_eq!(
            inline_parameters(&b),
            "SELECT * FROM t WHERE a = 1 AND b = 'O''Neil'"
        );
    }

    #[test]
    fn generated_keys_assign_to_collections() {
        let script = testing::install("mem://stmt-keys");
        script
            .when("INSERT INTO t (name) VALUES (?)")
            .generated_keys(
                &[("id", DriverType::BigInt)],
                vec![vec![json!(11)], vec![json!(12)]],
            );
        let mut conn = driver::manager::connect("mem://stmt-keys", &HashMap::new()).unwrap();
        let mut stmt = conn
            .prepare(
                "INSERT INTO t (name) VALUES (?)",
                &StatementConfig {
                    return_generated_keys: true,
                    ..StatementConfig::default()
                },
            )
            .unwrap();
        let source: Arc<dyn crate::sql::SqlSource> =
            Arc::new(StaticSqlSource::new(String::new(), Vec::new()));
        let ms = MappedStatement::builder("n.ins", CommandKind::Insert, source)
            .key_properties(vec!["id".to_string()])
            .build();
        let mut parameter = json!({"list": [{"name": "a"}, {"name": "b"}]});
        assign_generated_keys(stmt.as_mut(), &ms, &mut parameter).unwrap();
        assert_eq!(
            parameter,
            json!({"list": [{"name": "a", "id": 11}, {"name": "b", "id": 12}]})
        );
    }
}
