use crate::sql::expr::{self, Bindings};
use crate::sql::{tokens, value_to_text};
use crate::meta::MetaObject;
use crate::{Error, Result};
use driver::Value;
use std::collections::HashMap;

pub const PARAMETER_KEY: &str = "_parameter";
pub const DATABASE_ID_KEY: &str = "_databaseId";

/// Rendering state for one evaluation of a dynamic SQL tree: the SQL being
/// built, the binding variables visible to expressions, and a counter for
/// unique foreach parameter names.
pub struct DynamicContext {
    bindings: HashMap<String, Value>,
    sql: String,
    unique_number: u32,
}

impl DynamicContext {
    pub fn new(parameter: Value, database_id: Option<&str>) -> DynamicContext {
        let mut bindings = HashMap::new();
        bindings.insert(PARAMETER_KEY.to_string(), parameter);
        bindings.insert(
            DATABASE_ID_KEY.to_string(),
            database_id.map(|id| Value::String(id.to_string())).unwrap_or(Value::Null),
        );
        DynamicContext {
            bindings,
            sql: String::new(),
            unique_number: 0,
        }
    }

    pub fn bind(&mut self, name: &str, value: Value) {
        self.bindings.insert(name.to_string(), value);
    }

    pub fn append_sql(&mut self, part: &str) {
        if part.is_empty() {
            return;
        }
        if !self.sql.is_empty() && !self.sql.ends_with(' ') {
            self.sql.push(' ');
        }
        self.sql.push_str(part);
    }

    pub fn sql(&self) -> &str {
        self.sql.trim()
    }

    pub fn into_bindings(self) -> HashMap<String, Value> {
        self.bindings
    }

    fn next_unique(&mut self) -> u32 {
        let n = self.unique_number;
        self.unique_number += 1;
        n
    }

    fn mark(&self) -> usize {
        self.sql.len()
    }

    fn take_from(&mut self, mark: usize) -> String {
        self.sql.split_off(mark)
    }
}

impl Bindings for DynamicContext {
    fn resolve(&self, name: &str) -> Value {
        if let Some(bound) = self.bindings.get(name) {
            return bound.clone();
        }
        // unqualified names fall through to the parameter object
        self.bindings
            .get(PARAMETER_KEY)
            .map(|p| MetaObject::get(p, name))
            .unwrap_or(Value::Null)
    }
}

/// One fragment of a dynamic SQL tree. `apply` appends to the context's SQL,
/// may bind variables, and reports whether it contributed any text.
#[derive(Clone, Debug)]
pub enum SqlNode {
    StaticText(String),
    /// Text carrying `${...}` substitutions, expanded per evaluation.
    Text(String),
    If {
        test: String,
        contents: Box<SqlNode>,
    },
    Choose {
        whens: Vec<(String, SqlNode)>,
        otherwise: Option<Box<SqlNode>>,
    },
    Trim {
        contents: Box<SqlNode>,
        prefix: Option<String>,
        prefix_overrides: Vec<String>,
        suffix: Option<String>,
        suffix_overrides: Vec<String>,
    },
    ForEach {
        collection: String,
        item: Option<String>,
        index: Option<String>,
        open: Option<String>,
        close: Option<String>,
        separator: Option<String>,
        contents: Box<SqlNode>,
    },
    /// `<bind>`: evaluate an expression and name the result.
    Bind { name: String, expression: String },
    Mixed(Vec<SqlNode>),
}

impl SqlNode {
    /// `<where>` is trim with a `WHERE` prefix stripping leading AND/OR.
    pub fn where_node(contents: SqlNode) -> SqlNode {
        SqlNode::Trim {
            contents: Box::new(contents),
            prefix: Some("WHERE".to_string()),
            prefix_overrides: ["AND ", "OR ", "AND\t", "OR\t", "AND\n", "OR\n"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            suffix: None,
            suffix_overrides: Vec::new(),
        }
    }

    /// `<set>` is trim with a `SET` prefix dropping stray commas.
    pub fn set_node(contents: SqlNode) -> SqlNode {
        SqlNode::Trim {
            contents: Box::new(contents),
            prefix: Some("SET".to_string()),
            prefix_overrides: vec![",".to_string()],
            suffix: None,
            suffix_overrides: vec![",".to_string()],
        }
    }

    /// True when this subtree must be re-evaluated per invocation.
    pub fn is_dynamic(&self) -> bool {
        match self {
            SqlNode::StaticText(_) => false,
            SqlNode::Mixed(children) => children.iter().any(SqlNode::is_dynamic),
            _ => true,
        }
    }

    pub fn apply(&self, ctx: &mut DynamicContext) -> Result<bool> {
        match self {
            SqlNode::StaticText(text) => {
                ctx.append_sql(text);
                Ok(true)
            }
            SqlNode::Text(text) => {
                let mut failure: Option<Error> = None;
                let rendered = tokens::parse_tokens(text, "${", "}", &mut |content| {
                    match expr::eval(content, &*ctx) {
                        Ok(value) => value_to_text(&value),
                        Err(e) => {
                            failure.get_or_insert(e);
                            String::new()
                        }
                    }
                });
                if let Some(e) = failure {
                    return Err(e);
                }
                ctx.append_sql(&rendered);
                Ok(true)
            }
            SqlNode::If { test, contents } => {
                if expr::eval_bool(test, &*ctx)? {
                    contents.apply(ctx)?;
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            SqlNode::Choose { whens, otherwise } => {
                for (test, node) in whens {
                    if expr::eval_bool(test, &*ctx)? {
                        node.apply(ctx)?;
                        return Ok(true);
                    }
                }
                if let Some(node) = otherwise {
                    node.apply(ctx)?;
                    return Ok(true);
                }
                Ok(false)
            }
            SqlNode::Trim {
                contents,
                prefix,
                prefix_overrides,
                suffix,
                suffix_overrides,
            } => {
                let mark = ctx.mark();
                let contributed = contents.apply(ctx)?;
                let body = ctx.take_from(mark);
                let mut text = body.trim().to_string();
                for over in prefix_overrides {
                    let matched = text
                        .get(..over.len())
                        .is_some_and(|head| head.eq_ignore_ascii_case(over));
                    if matched {
                        text = text[over.len()..].trim_start().to_string();
                        break;
                    }
                }
                for over in suffix_overrides {
                    let matched = text
                        .len()
                        .checked_sub(over.len())
                        .and_then(|at| text.get(at..))
                        .is_some_and(|tail| tail.eq_ignore_ascii_case(over));
                    if matched {
                        text.truncate(text.len() - over.len());
                        text = text.trim_end().to_string();
                        break;
                    }
                }
                if !text.is_empty() {
                    if let Some(prefix) = prefix {
                        ctx.append_sql(prefix);
                    }
                    ctx.append_sql(&text);
                    if let Some(suffix) = suffix {
                        ctx.append_sql(suffix);
                    }
                }
                Ok(contributed)
            }
            SqlNode::ForEach {
                collection,
                item,
                index,
                open,
                close,
                separator,
                contents,
            } => apply_foreach(
                ctx, collection, item.as_deref(), index.as_deref(), open.as_deref(),
                close.as_deref(), separator.as_deref(), contents,
            ),
            SqlNode::Bind { name, expression } => {
                let value = expr::eval(expression, &*ctx)?;
                ctx.bind(name, value);
                Ok(true)
            }
            SqlNode::Mixed(children) => {
                let mut contributed = false;
                for child in children {
                    contributed |= child.apply(ctx)?;
                }
                Ok(contributed)
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn apply_foreach(
    ctx: &mut DynamicContext,
    collection: &str,
    item: Option<&str>,
    index: Option<&str>,
    open: Option<&str>,
    close: Option<&str>,
    separator: Option<&str>,
    contents: &SqlNode,
) -> Result<bool> {
    let source = expr::eval(collection, &*ctx)?;
    let entries: Vec<(Value, Value)> = match source {
        Value::Array(items) => items
            .into_iter()
            .enumerate()
            .map(|(i, v)| (Value::from(i as u64), v))
            .collect(),
        Value::Object(map) => map
            .into_iter()
            .map(|(k, v)| (Value::String(k), v))
            .collect(),
        Value::Null => Vec::new(),
        other => {
            return Err(Error::malformed(format!(
                "foreach collection '{collection}' is not an array or map (got {other})"
            )));
        }
    };

    let mut body = String::new();
    let mut contributed = false;
    for (index_value, item_value) in entries {
        let unique = ctx.next_unique();
        let item_key = item.map(|name| {
            let key = format!("__frch_{name}_{unique}");
            ctx.bind(name, item_value.clone());
            ctx.bind(&key, item_value.clone());
            (name.to_string(), key)
        });
        let index_key = index.map(|name| {
            let key = format!("__frch_{name}_{unique}");
            ctx.bind(name, index_value.clone());
            ctx.bind(&key, index_value.clone());
            (name.to_string(), key)
        });

        let mark = ctx.mark();
        contents.apply(ctx)?;
        let mut rendered = ctx.take_from(mark).trim().to_string();
        // placeholders referring to the loop variables are renamed to the
        // iteration's unique bindings
        if let Some((name, key)) = &item_key {
            rendered = rename_placeholder_root(&rendered, name, key);
        }
        if let Some((name, key)) = &index_key {
            rendered = rename_placeholder_root(&rendered, name, key);
        }
        if rendered.is_empty() {
            continue;
        }
        if contributed {
            if let Some(separator) = separator {
                body.push_str(separator);
            }
        }
        body.push_str(&rendered);
        contributed = true;
    }

    let mut assembled = String::new();
    if let Some(open) = open {
        assembled.push_str(open);
    }
    assembled.push_str(&body);
    if let Some(close) = close {
        assembled.push_str(close);
    }
    ctx.append_sql(&assembled);
    Ok(contributed)
}

// Rewrite `#{name...}` roots to the unique per-iteration binding.
fn rename_placeholder_root(text: &str, name: &str, unique: &str) -> String {
    tokens::parse_tokens(text, "#{", "}", &mut |content| {
        let (path, attrs) = match content.find(',') {
            Some(at) => (&content[..at], &content[at..]),
            None => (content, ""),
        };
        let path = path.trim();
        let renamed = if path == name {
            format!("{unique}{attrs}")
        } else if let Some(rest) = path.strip_prefix(name) {
            if rest.starts_with('.') || rest.starts_with('[') {
                format!("{unique}{rest}{attrs}")
            } else {
                content.to_string()
            }
        } else {
            content.to_string()
        };
        format!("#{{{renamed}}}")
    })
}

#[cfg(test)]
mod unit {
    use super::*;
    use serde_json::json;

    fn render(node: &SqlNode, parameter: Value) -> String {
        let mut ctx = DynamicContext::new(parameter, None);
        node.apply(&mut ctx).unwrap();
        ctx.sql().to_string()
    }

    fn text(s: &str) -> SqlNode {
        SqlNode::StaticText(s.to_string())
    }

    #[test]
    fn where_drops_leading_and() {
        let node = SqlNode::Mixed(vec![
            text("SELECT * FROM orders"),
            SqlNode::where_node(SqlNode::Mixed(vec![
                SqlNode::If {
                    test: "uid != null".to_string(),
                    contents: Box::new(text("AND user_id=#{uid}")),
                },
                SqlNode::If {
                    test: "min != null".to_string(),
                    contents: Box::new(text("AND amount >= #{min}")),
                },
            ])),
        ]);
        assert_eq!(
            render(&node, json!({"uid": 3, "min": null})),
            "SELECT * FROM orders WHERE user_id=#{uid}"
        );
        assert_eq!(
            render(&node, json!({"uid": null, "min": null})),
            "SELECT * FROM orders"
        );
        assert_eq!(
            render(&node, json!({"uid": 3, "min": 10})),
            "SELECT * FROM orders WHERE user_id=#{uid} AND amount >= #{min}"
        );
    }

    #[test]
    fn set_drops_trailing_comma() {
        let node = SqlNode::Mixed(vec![
            text("UPDATE users"),
            SqlNode::set_node(SqlNode::Mixed(vec![
                SqlNode::If {
                    test: "name != null".to_string(),
                    contents: Box::new(text("name=#{name},")),
                },
                SqlNode::If {
                    test: "age != null".to_string(),
                    contents: Box::new(text("age=#{age},")),
                },
            ])),
            text("WHERE id=#{id}"),
        ]);
        assert_eq!(
            render(&node, json!({"name": "Ann", "age": null, "id": 1})),
            "UPDATE users SET name=#{name} WHERE id=#{id}"
        );
    }

    #[test]
    fn foreach_renders_separators_and_unique_names() {
        let node = SqlNode::ForEach {
            collection: "list".to_string(),
            item: Some("k".to_string()),
            index: None,
            open: Some("(".to_string()),
            close: Some(")".to_string()),
            separator: Some(",".to_string()),
            contents: Box::new(text("#{k}")),
        };
        assert_eq!(
            render(&node, json!({"list": [1, 2, 3]})),
            "(#{__frch_k_0},#{__frch_k_1},#{__frch_k_2})"
        );
    }

    #[test]
    fn foreach_over_empty_collection() {
        let bare = SqlNode::ForEach {
            collection: "list".to_string(),
            item: Some("k".to_string()),
            index: None,
            open: None,
            close: None,
            separator: Some(",".to_string()),
            contents: Box::new(text("#{k}")),
        };
        assert_eq!(render(&bare, json!({"list": []})), "");
        let wrapped = SqlNode::ForEach {
            collection: "list".to_string(),
            item: Some("k".to_string()),
            index: None,
            open: Some("(".to_string()),
            close: Some(")".to_string()),
            separator: Some(",".to_string()),
            contents: Box::new(text("#{k}")),
        };
        assert_eq!(render(&wrapped, json!({"list": []})), "()");
    }

    #[test]
    fn foreach_over_map_binds_keys() {
        let node = SqlNode::ForEach {
            collection: "_parameter".to_string(),
            item: Some("v".to_string()),
            index: Some("key".to_string()),
            open: None,
            close: None,
            separator: Some(" AND ".to_string()),
            contents: Box::new(SqlNode::Text("${key} = #{v}".to_string())),
        };
        assert_eq!(
            render(&node, json!({"a": 1, "b": 2})),
            "a = #{__frch_v_0} AND b = #{__frch_v_1}"
        );
    }

    #[test]
    fn choose_picks_first_truthy_when() {
        let node = SqlNode::Choose {
            whens: vec![
                ("kind == 'x'".to_string(), text("BY X")),
                ("kind == 'y'".to_string(), text("BY Y")),
            ],
            otherwise: Some(Box::new(text("BY DEFAULT"))),
        };
        assert_eq!(render(&node, json!({"kind": "y"})), "BY Y");
        assert_eq!(render(&node, json!({"kind": "z"})), "BY DEFAULT");
    }

    #[test]
    fn bind_declares_variables() {
        let node = SqlNode::Mixed(vec![
            SqlNode::Bind {
                name: "pattern".to_string(),
                expression: "'%' + name + '%'".to_string(),
            },
            SqlNode::Text("LIKE '${pattern}'".to_string()),
        ]);
        assert_eq!(render(&node, json!({"name": "Ann"})), "LIKE '%Ann%'");
    }

    #[test]
    fn text_substitution_marks_dynamic() {
        assert!(SqlNode::Text("ORDER BY ${col}".to_string()).is_dynamic());
        assert!(!SqlNode::StaticText("ORDER BY id".to_string()).is_dynamic());
    }
}
