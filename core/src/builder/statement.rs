//! Compiles `select|insert|update|delete` elements: include expansion,
//! selectKey extraction, dynamic SQL tree construction and statement
//! registration.

use crate::builder::{apply_namespace, deferred, malformed};
use crate::mapping::{CommandKind, KeyGeneratorKind, MappedStatement, ResultMap, StatementKind};
use crate::registry::Configuration;
use crate::sql::{self, tokens, SqlNode};
use crate::Result;
use roxmltree::{Document, Node};
use std::collections::HashMap;

pub(crate) fn build_statement(
    config: &mut Configuration,
    node: &Node,
    namespace: &str,
    resource: &str,
) -> Result<()> {
    let id = node
        .attribute("id")
        .ok_or_else(|| malformed(resource, "statement requires an id"))?;
    super::check_identifier(id, "statement", resource)?;
    let full_id = apply_namespace(namespace, id);
    let declared_database_id = node.attribute("databaseId");
    if !config.accepts_statement(&full_id, declared_database_id) {
        return Ok(());
    }

    let command = match node.tag_name().name() {
        "select" => CommandKind::Select,
        "insert" => CommandKind::Insert,
        "update" => CommandKind::Update,
        "delete" => CommandKind::Delete,
        other => {
            return Err(malformed(
                resource,
                format!("unexpected statement element <{other}>"),
            ));
        }
    };

    // selectKey before the body so its key generator wins
    let mut key_generator = KeyGeneratorKind::None;
    let mut key_properties = split_list(node.attribute("keyProperty"));
    let mut key_columns = split_list(node.attribute("keyColumn"));
    for child in node.children().filter(Node::is_element) {
        if child.tag_name().name() != "selectKey" {
            continue;
        }
        let key_id = format!("{full_id}!selectKey");
        build_select_key(config, &child, namespace, resource, &key_id)?;
        key_generator = KeyGeneratorKind::SelectKey {
            statement_id: key_id,
            before: child.attribute("order").map(str::to_uppercase).as_deref()
                == Some("BEFORE"),
        };
        if key_properties.is_empty() {
            key_properties = split_list(child.attribute("keyProperty"));
        }
        if key_columns.is_empty() {
            key_columns = split_list(child.attribute("keyColumn"));
        }
    }
    if key_generator == KeyGeneratorKind::None {
        let wants_driver_keys = node.attribute("useGeneratedKeys") == Some("true")
            || (config.settings.use_generated_keys && command == CommandKind::Insert);
        if wants_driver_keys {
            key_generator = KeyGeneratorKind::DriverGenerated;
        }
    }

    let root = parse_body(config, node, namespace, resource, &HashMap::new())?;
    let sql_source = sql::source_for(root, config.database_id.as_deref())?;

    // result shape: explicit result maps, or an inline one from resultType
    let mut result_map_ids: Vec<String> = split_list(node.attribute("resultMap"))
        .into_iter()
        .map(|id| apply_namespace(namespace, &id))
        .collect();
    if result_map_ids.is_empty() {
        if let Some(result_type) = node.attribute("resultType") {
            let inline_id = format!("{full_id}-Inline");
            config.add_result_map(ResultMap::new(&inline_id, result_type, Vec::new(), None, None));
            result_map_ids.push(inline_id);
        }
    }

    let kind = match node.attribute("statementType") {
        Some(name) => StatementKind::from_name(name)
            .ok_or_else(|| malformed(resource, format!("unknown statementType '{name}'")))?,
        None => StatementKind::Prepared,
    };
    let flush_cache = match node.attribute("flushCache") {
        Some(v) => v == "true",
        None => command.is_write(),
    };
    let use_cache = match node.attribute("useCache") {
        Some(v) => v == "true",
        None => !command.is_write(),
    };
    let cache_id = config
        .effective_cache(namespace)
        .map(|cache| cache.id().to_string());

    let statement = MappedStatement::builder(&full_id, command, sql_source.into())
        .resource(resource)
        .kind(kind)
        .parameter_map(
            node.attribute("parameterMap")
                .map(|id| apply_namespace(namespace, id)),
        )
        .parameter_type(node.attribute("parameterType").map(str::to_string))
        .result_map_ids(result_map_ids)
        .fetch_size(parse_optional(node, "fetchSize", resource)?)
        .timeout(parse_optional(node, "timeout", resource)?)
        .flush_cache(flush_cache)
        .use_cache(use_cache)
        .cache_id(cache_id)
        .key_generator(key_generator.clone())
        .key_properties(key_properties)
        .key_columns(key_columns)
        .database_id(declared_database_id.map(str::to_string))
        .result_sets(split_list(node.attribute("resultSets")))
        .build();
    config.add_key_generator(&full_id, key_generator);
    config.add_mapped_statement(statement);
    Ok(())
}

fn build_select_key(
    config: &mut Configuration,
    node: &Node,
    namespace: &str,
    resource: &str,
    key_id: &str,
) -> Result<()> {
    let root = parse_body(config, node, namespace, resource, &HashMap::new())?;
    let sql_source = sql::source_for(root, config.database_id.as_deref())?;
    let mut result_map_ids = Vec::new();
    if let Some(result_type) = node.attribute("resultType") {
        let inline_id = format!("{key_id}-Inline");
        config.add_result_map(ResultMap::new(&inline_id, result_type, Vec::new(), None, None));
        result_map_ids.push(inline_id);
    }
    let statement = MappedStatement::builder(key_id, CommandKind::Select, sql_source.into())
        .resource(resource)
        .result_map_ids(result_map_ids)
        .key_properties(split_list(node.attribute("keyProperty")))
        .key_columns(split_list(node.attribute("keyColumn")))
        .flush_cache(false)
        .use_cache(false)
        .build();
    config.add_mapped_statement(statement);
    Ok(())
}

fn parse_optional<T: std::str::FromStr>(
    node: &Node,
    attribute: &str,
    resource: &str,
) -> Result<Option<T>> {
    match node.attribute(attribute) {
        None => Ok(None),
        Some(value) => value.parse().map(Some).map_err(|_| {
            malformed(resource, format!("bad {attribute} '{value}'"))
        }),
    }
}

fn split_list(value: Option<&str>) -> Vec<String> {
    value
        .unwrap_or_default()
        .split(',')
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .collect()
}

// trim override tokens keep their spacing: `prefixOverrides="AND |OR "`
fn split_overrides(value: Option<&str>) -> Vec<String> {
    value
        .unwrap_or_default()
        .split('|')
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .collect()
}

/// Parse an element's mixed content into a dynamic SQL tree, expanding
/// `<include>` fragments (with their `<property>` substitutions) inline.
pub(crate) fn parse_body(
    config: &Configuration,
    node: &Node,
    namespace: &str,
    resource: &str,
    include_vars: &HashMap<String, String>,
) -> Result<SqlNode> {
    let mut children = Vec::new();
    for child in node.children() {
        if child.is_text() {
            if let Some(text) = child.text() {
                push_text(&mut children, text, include_vars);
            }
            continue;
        }
        if !child.is_element() {
            continue;
        }
        match child.tag_name().name() {
            "selectKey" => {} // compiled separately
            "include" => {
                let refid = child
                    .attribute("refid")
                    .ok_or_else(|| malformed(resource, "<include> requires refid"))?;
                // refid itself may carry substitutions from an outer include
                let refid = substitute_vars(refid, include_vars);
                let full = apply_namespace(namespace, &refid);
                let Some(fragment_xml) = config
                    .sql_fragment(&full)
                    .or_else(|| config.sql_fragment(&refid))
                    .map(str::to_string)
                else {
                    return Err(deferred(&format!("sql fragment '{full}'")));
                };
                let mut vars = include_vars.clone();
                for property in child.children().filter(Node::is_element) {
                    if property.tag_name().name() == "property" {
                        let (name, value) = super::property_pair(&property, resource)?;
                        vars.insert(name, substitute_vars(&value, include_vars));
                    }
                }
                let fragment_doc = Document::parse(&fragment_xml).map_err(|e| {
                    malformed(resource, format!("unparsable sql fragment '{refid}': {e}"))
                })?;
                children.push(parse_body(
                    config,
                    &fragment_doc.root_element(),
                    namespace,
                    resource,
                    &vars,
                )?);
            }
            "if" => {
                let test = child
                    .attribute("test")
                    .ok_or_else(|| malformed(resource, "<if> requires test"))?;
                children.push(SqlNode::If {
                    test: test.to_string(),
                    contents: Box::new(parse_body(
                        config, &child, namespace, resource, include_vars,
                    )?),
                });
            }
            "where" => {
                children.push(SqlNode::where_node(parse_body(
                    config, &child, namespace, resource, include_vars,
                )?));
            }
            "set" => {
                children.push(SqlNode::set_node(parse_body(
                    config, &child, namespace, resource, include_vars,
                )?));
            }
            "trim" => {
                children.push(SqlNode::Trim {
                    contents: Box::new(parse_body(
                        config, &child, namespace, resource, include_vars,
                    )?),
                    prefix: child.attribute("prefix").map(str::to_string),
                    prefix_overrides: split_overrides(child.attribute("prefixOverrides")),
                    suffix: child.attribute("suffix").map(str::to_string),
                    suffix_overrides: split_overrides(child.attribute("suffixOverrides")),
                });
            }
            "foreach" => {
                let collection = child
                    .attribute("collection")
                    .ok_or_else(|| malformed(resource, "<foreach> requires collection"))?;
                children.push(SqlNode::ForEach {
                    collection: collection.to_string(),
                    item: child.attribute("item").map(str::to_string),
                    index: child.attribute("index").map(str::to_string),
                    open: child.attribute("open").map(str::to_string),
                    close: child.attribute("close").map(str::to_string),
                    separator: child.attribute("separator").map(str::to_string),
                    contents: Box::new(parse_body(
                        config, &child, namespace, resource, include_vars,
                    )?),
                });
            }
            "choose" => {
                let mut whens = Vec::new();
                let mut otherwise = None;
                for branch in child.children().filter(Node::is_element) {
                    match branch.tag_name().name() {
                        "when" => {
                            let test = branch
                                .attribute("test")
                                .ok_or_else(|| malformed(resource, "<when> requires test"))?;
                            whens.push((
                                test.to_string(),
                                parse_body(config, &branch, namespace, resource, include_vars)?,
                            ));
                        }
                        "otherwise" => {
                            otherwise = Some(Box::new(parse_body(
                                config, &branch, namespace, resource, include_vars,
                            )?));
                        }
                        other => {
                            return Err(malformed(
                                resource,
                                format!("unexpected element <{other}> in choose"),
                            ));
                        }
                    }
                }
                children.push(SqlNode::Choose { whens, otherwise });
            }
            "bind" => {
                let name = child
                    .attribute("name")
                    .ok_or_else(|| malformed(resource, "<bind> requires name"))?;
                let value = child
                    .attribute("value")
                    .ok_or_else(|| malformed(resource, "<bind> requires value"))?;
                children.push(SqlNode::Bind {
                    name: name.to_string(),
                    expression: value.to_string(),
                });
            }
            other => {
                return Err(malformed(
                    resource,
                    format!("unexpected element <{other}> in statement body"),
                ));
            }
        }
    }
    Ok(SqlNode::Mixed(children))
}

fn push_text(children: &mut Vec<SqlNode>, text: &str, include_vars: &HashMap<String, String>) {
    let substituted = substitute_vars(text, include_vars);
    let trimmed = substituted.trim();
    if trimmed.is_empty() {
        return;
    }
    if tokens::contains_token(trimmed, "${", "}") {
        children.push(SqlNode::Text(trimmed.to_string()));
    } else {
        children.push(SqlNode::StaticText(trimmed.to_string()));
    }
}

// Include-property substitution happens at compile time; unknown tokens are
// left for the runtime ${} pass.
fn substitute_vars(text: &str, vars: &HashMap<String, String>) -> String {
    if vars.is_empty() || !text.contains("${") {
        return text.to_string();
    }
    tokens::parse_tokens(text, "${", "}", &mut |content| {
        match vars.get(content.trim()) {
            Some(value) => value.clone(),
            None => format!("${{{content}}}"),
        }
    })
}
