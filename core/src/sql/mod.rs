//! Dynamic SQL assembly: evaluating a statement's SQL tree against a
//! parameter binding to produce the final SQL text, the ordered parameter
//! mappings, and the scoped variables the rendering declared.

pub mod expr;
mod node;
pub use node::{DynamicContext, SqlNode, DATABASE_ID_KEY, PARAMETER_KEY};
pub mod tokens;

use crate::mapping::ParameterMapping;
use crate::meta::{MetaObject, PropertyTokenizer};
use crate::{Error, Result};
use driver::Value;
use std::collections::HashMap;

/// Final SQL text with positional placeholders, the parameter mappings in
/// placeholder order, the parameter object it was rendered against, and any
/// variables the rendering bound.
#[derive(Clone, Debug)]
pub struct BoundSql {
    pub sql: String,
    pub parameter_mappings: Vec<ParameterMapping>,
    pub parameter: Value,
    pub additional_parameters: HashMap<String, Value>,
}

impl BoundSql {
    /// Resolve a parameter mapping's property against the scoped variables
    /// first, then the parameter object (scalars bind themselves).
    pub fn value_of(&self, property: &str) -> Value {
        if let Some(exact) = self.additional_parameters.get(property) {
            return exact.clone();
        }
        let root = PropertyTokenizer::new(property);
        if let Some(base) = self.additional_parameters.get(root.name()) {
            let mut scoped = base.clone();
            if let Some(index) = root.index() {
                scoped = MetaObject::get(&scoped, &format!("[{index}]"));
            }
            return match root.children() {
                Some(rest) => MetaObject::get(&scoped, rest),
                None => scoped,
            };
        }
        match &self.parameter {
            Value::Object(_) => MetaObject::get(&self.parameter, property),
            scalar => scalar.clone(),
        }
    }
}

/// Produces a [`BoundSql`] for a parameter object. Raw statements compute
/// once; dynamic statements re-render per invocation.
pub trait SqlSource: Send + Sync {
    fn bound_sql(&self, parameter: &Value) -> Result<BoundSql>;
}

/// Pre-rendered SQL whose placeholder pass already ran.
pub struct StaticSqlSource {
    sql: String,
    parameter_mappings: Vec<ParameterMapping>,
}

impl StaticSqlSource {
    pub fn new(sql: String, parameter_mappings: Vec<ParameterMapping>) -> StaticSqlSource {
        StaticSqlSource {
            sql,
            parameter_mappings,
        }
    }

    /// Run the placeholder pass over already-final SQL text.
    pub fn parse(sql: &str) -> Result<StaticSqlSource> {
        let (sql, parameter_mappings) = build_placeholders(sql)?;
        Ok(StaticSqlSource {
            sql,
            parameter_mappings,
        })
    }
}

impl SqlSource for StaticSqlSource {
    fn bound_sql(&self, parameter: &Value) -> Result<BoundSql> {
        Ok(BoundSql {
            sql: self.sql.clone(),
            parameter_mappings: self.parameter_mappings.clone(),
            parameter: parameter.clone(),
            additional_parameters: HashMap::new(),
        })
    }
}

/// A statement without dynamic nodes: rendered and placeholder-parsed once
/// at build time.
pub struct RawSqlSource {
    inner: StaticSqlSource,
}

impl RawSqlSource {
    pub fn new(root: &SqlNode, database_id: Option<&str>) -> Result<RawSqlSource> {
        let mut ctx = DynamicContext::new(Value::Null, database_id);
        root.apply(&mut ctx)?;
        Ok(RawSqlSource {
            inner: StaticSqlSource::parse(ctx.sql())?,
        })
    }
}

impl SqlSource for RawSqlSource {
    fn bound_sql(&self, parameter: &Value) -> Result<BoundSql> {
        self.inner.bound_sql(parameter)
    }
}

/// A statement with dynamic nodes: the tree re-renders against every
/// parameter object, then the placeholder pass runs on the result.
pub struct DynamicSqlSource {
    root: SqlNode,
    database_id: Option<String>,
}

impl DynamicSqlSource {
    pub fn new(root: SqlNode, database_id: Option<String>) -> DynamicSqlSource {
        DynamicSqlSource { root, database_id }
    }
}

impl SqlSource for DynamicSqlSource {
    fn bound_sql(&self, parameter: &Value) -> Result<BoundSql> {
        let mut ctx = DynamicContext::new(parameter.clone(), self.database_id.as_deref());
        self.root.apply(&mut ctx)?;
        let (sql, parameter_mappings) = build_placeholders(ctx.sql())?;
        Ok(BoundSql {
            sql,
            parameter_mappings,
            parameter: parameter.clone(),
            additional_parameters: ctx.into_bindings(),
        })
    }
}

/// Build a [`SqlSource`] from a parsed tree: raw trees collapse to a
/// one-time render, dynamic trees re-render per call.
pub fn source_for(root: SqlNode, database_id: Option<&str>) -> Result<Box<dyn SqlSource>> {
    if root.is_dynamic() {
        Ok(Box::new(DynamicSqlSource::new(
            root,
            database_id.map(str::to_string),
        )))
    } else {
        Ok(Box::new(RawSqlSource::new(&root, database_id)?))
    }
}

/// The secondary pass: replace `#{...}` placeholders with positional markers
/// and record their parameter mappings in declaration order.
pub fn build_placeholders(sql: &str) -> Result<(String, Vec<ParameterMapping>)> {
    let mut mappings = Vec::new();
    let mut failure: Option<Error> = None;
    let replaced = tokens::parse_tokens(sql, "#{", "}", &mut |content| {
        match ParameterMapping::parse(content) {
            Ok(mapping) => {
                mappings.push(mapping);
                "?".to_string()
            }
            Err(e) => {
                failure.get_or_insert(e);
                String::new()
            }
        }
    });
    match failure {
        Some(e) => Err(e),
        None => Ok((replaced, mappings)),
    }
}

/// Text form used by `${}` substitution and string concatenation: strings
/// render bare, everything else renders as its JSON form.
pub fn value_to_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
