//! The mapping compiler: parses configuration and mapper markup into the
//! registry. Forward references (cache-ref, resultMap extends, include
//! fragments) are queued as pending items, retried after every source, and
//! fail the build only at the end.

mod config;
pub use config::XmlConfigBuilder;
mod statement;

use crate::cache::CacheBuilder;
use crate::mapping::{Discriminator, ParameterMap, ParameterMapping, ParameterMode, ResultMap, ResultMapping};
use crate::registry::Configuration;
use crate::{Error, Result};
use driver::DriverType;
use once_cell::sync::Lazy;
use regex::Regex;
use roxmltree::{Document, Node};
use std::collections::HashMap;
use std::time::Duration;

// declared ids are single segments; namespaces may be dotted paths
static IDENTIFIER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_$]*$").unwrap());
static NAMESPACE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z_][A-Za-z0-9_$]*(\.[A-Za-z_][A-Za-z0-9_$]*)*$").unwrap()
});

pub(crate) fn check_identifier(id: &str, what: &str, resource: &str) -> Result<()> {
    if IDENTIFIER.is_match(id) {
        return Ok(());
    }
    Err(malformed(resource, format!("invalid {what} name: '{id}'")))
}

fn check_namespace(namespace: &str, resource: &str) -> Result<()> {
    if NAMESPACE.is_match(namespace) {
        return Ok(());
    }
    Err(malformed(
        resource,
        format!("invalid namespace: '{namespace}'"),
    ))
}

pub(crate) fn apply_namespace(namespace: &str, id: &str) -> String {
    if id.contains(constants::NAMESPACE_SEPARATOR) {
        id.to_string()
    } else {
        format!("{namespace}{}{id}", constants::NAMESPACE_SEPARATOR)
    }
}

pub(crate) fn malformed(resource: &str, message: impl Into<String>) -> Error {
    Error::malformed_in(resource, message)
}

// Internal marker for "cannot resolve yet, retry after more sources load".
pub(crate) fn deferred(what: &str) -> Error {
    Error::ConfigIncomplete(vec![what.to_string()])
}

struct PendingElement {
    namespace: String,
    xml: String,
    resource: String,
}

#[derive(Default)]
struct BuildState {
    cache_refs: Vec<(String, String)>,
    result_maps: Vec<PendingElement>,
    statements: Vec<PendingElement>,
}

/// Parses mapper sources (one namespace each) into a configuration,
/// carrying unresolved forward references across sources.
#[derive(Default)]
pub struct XmlMapperBuilder {
    state: BuildState,
}

impl XmlMapperBuilder {
    pub fn new() -> XmlMapperBuilder {
        XmlMapperBuilder::default()
    }

    pub fn parse(
        &mut self,
        config: &mut Configuration,
        xml: &str,
        resource: &str,
    ) -> Result<()> {
        if !config.mark_resource_loaded(resource) {
            return Ok(());
        }
        let doc = Document::parse(xml)
            .map_err(|e| malformed(resource, format!("unparsable mapper markup: {e}")))?;
        let root = doc.root_element();
        if root.tag_name().name() != "mapper" {
            return Err(malformed(resource, "root element must be <mapper>"));
        }
        let namespace = root
            .attribute("namespace")
            .filter(|ns| !ns.is_empty())
            .ok_or_else(|| malformed(resource, "<mapper> requires a namespace"))?
            .to_string();
        check_namespace(&namespace, resource)?;

        // two passes: shared declarations (cache, fragments, maps) first, so
        // statements see them regardless of document order
        let mut statement_nodes = Vec::new();
        for child in root.children().filter(Node::is_element) {
            match child.tag_name().name() {
                "cache-ref" => {
                    let referenced = child
                        .attribute("namespace")
                        .ok_or_else(|| malformed(resource, "<cache-ref> requires namespace"))?;
                    if config.effective_cache(referenced).is_some() {
                        config.add_cache_ref(&namespace, referenced);
                    } else {
                        self.state
                            .cache_refs
                            .push((namespace.clone(), referenced.to_string()));
                    }
                }
                "cache" => build_cache(config, &child, &namespace, resource)?,
                "parameterMap" => build_parameter_map(config, &child, &namespace, resource)?,
                "resultMap" => {
                    match build_result_map(config, &child, &namespace, resource, None) {
                        Err(Error::ConfigIncomplete(_)) => {
                            self.state.result_maps.push(PendingElement {
                                namespace: namespace.clone(),
                                xml: xml[child.range()].to_string(),
                                resource: resource.to_string(),
                            });
                        }
                        Err(e) => return Err(e),
                        Ok(_) => {}
                    }
                }
                "sql" => {
                    let id = child
                        .attribute("id")
                        .ok_or_else(|| malformed(resource, "<sql> requires an id"))?;
                    config.add_sql_fragment(
                        &apply_namespace(&namespace, id),
                        &xml[child.range()],
                    );
                }
                "select" | "insert" | "update" | "delete" => statement_nodes.push(child),
                other => {
                    return Err(malformed(
                        resource,
                        format!("unexpected element <{other}> in mapper"),
                    ));
                }
            }
        }
        // statements wait for the namespace's cache-ref: their cache binding
        // is fixed at build time
        let cache_ref_unresolved = self
            .state
            .cache_refs
            .iter()
            .any(|(ns, _)| ns == &namespace);
        for child in statement_nodes {
            let outcome = if cache_ref_unresolved {
                Err(deferred(&format!("cache-ref of namespace '{namespace}'")))
            } else {
                statement::build_statement(config, &child, &namespace, resource)
            };
            match outcome {
                Err(Error::ConfigIncomplete(_)) => {
                    self.state.statements.push(PendingElement {
                        namespace: namespace.clone(),
                        xml: xml[child.range()].to_string(),
                        resource: resource.to_string(),
                    });
                }
                other => other?,
            }
        }

        self.retry_pending(config);
        Ok(())
    }

    /// Re-attempt everything pending; keeps whatever still cannot resolve.
    fn retry_pending(&mut self, config: &mut Configuration) {
        loop {
            let before = self.pending_count();

            let cache_refs = std::mem::take(&mut self.state.cache_refs);
            for (namespace, referenced) in cache_refs {
                if config.effective_cache(&referenced).is_some() {
                    config.add_cache_ref(&namespace, &referenced);
                } else {
                    self.state.cache_refs.push((namespace, referenced));
                }
            }

            let result_maps = std::mem::take(&mut self.state.result_maps);
            for pending in result_maps {
                if !self.retry_element(config, &pending, false) {
                    self.state.result_maps.push(pending);
                }
            }

            let statements = std::mem::take(&mut self.state.statements);
            for pending in statements {
                if !self.retry_element(config, &pending, true) {
                    self.state.statements.push(pending);
                }
            }

            if self.pending_count() == before {
                return;
            }
        }
    }

    fn retry_element(
        &self,
        config: &mut Configuration,
        pending: &PendingElement,
        is_statement: bool,
    ) -> bool {
        if is_statement
            && self
                .state
                .cache_refs
                .iter()
                .any(|(ns, _)| ns == &pending.namespace)
        {
            return false;
        }
        let Ok(doc) = Document::parse(&pending.xml) else {
            return false;
        };
        let node = doc.root_element();
        let outcome = if is_statement {
            statement::build_statement(config, &node, &pending.namespace, &pending.resource)
        } else {
            build_result_map(config, &node, &pending.namespace, &pending.resource, None)
                .map(|_| ())
        };
        !matches!(outcome, Err(Error::ConfigIncomplete(_)))
    }

    fn pending_count(&self) -> usize {
        self.state.cache_refs.len() + self.state.result_maps.len() + self.state.statements.len()
    }

    /// End of build: leftovers are fatal, and every statement's result map
    /// references must resolve.
    pub fn finish(&mut self, config: &mut Configuration) -> Result<()> {
        self.retry_pending(config);
        let mut unresolved: Vec<String> = Vec::new();
        for (namespace, referenced) in &self.state.cache_refs {
            unresolved.push(format!("cache-ref {namespace} -> {referenced}"));
        }
        for pending in &self.state.result_maps {
            unresolved.push(format!("resultMap in {}", pending.resource));
        }
        for pending in &self.state.statements {
            unresolved.push(format!("statement in {}", pending.resource));
        }
        let statement_ids: Vec<String> =
            config.statement_ids().map(str::to_string).collect();
        for id in statement_ids {
            let statement = config.mapped_statement(&id)?;
            for map_id in &statement.result_map_ids {
                if !config.has_result_map(map_id) {
                    unresolved.push(format!("result map '{map_id}' referenced by '{id}'"));
                }
            }
        }
        if !unresolved.is_empty() {
            return Err(Error::ConfigIncomplete(unresolved));
        }
        Ok(())
    }
}

fn build_cache(
    config: &mut Configuration,
    node: &Node,
    namespace: &str,
    resource: &str,
) -> Result<()> {
    let mut builder = CacheBuilder::new(namespace);
    if let Some(eviction) = node.attribute("eviction") {
        builder = builder.eviction_name(eviction)?;
    }
    if let Some(size) = node.attribute("size") {
        builder = builder.size(
            size.parse()
                .map_err(|_| malformed(resource, format!("bad cache size '{size}'")))?,
        );
    }
    if let Some(interval) = node.attribute("flushInterval") {
        let millis: u64 = interval
            .parse()
            .map_err(|_| malformed(resource, format!("bad flushInterval '{interval}'")))?;
        builder = builder.clear_interval(Duration::from_millis(millis));
    }
    // readOnly caches hand out the stored instance; everything else gets
    // serialized copies
    let read_only = node.attribute("readOnly") == Some("true");
    builder = builder.read_write(!read_only);
    builder = builder.blocking(node.attribute("blocking") == Some("true"));
    for property in node.children().filter(Node::is_element) {
        if property.tag_name().name() != "property" {
            continue;
        }
        let (name, value) = property_pair(&property, resource)?;
        if name == "blockingTimeout" {
            let millis: u64 = value
                .parse()
                .map_err(|_| malformed(resource, format!("bad blockingTimeout '{value}'")))?;
            builder = builder.blocking_timeout(Some(Duration::from_millis(millis)));
        }
    }
    config.add_cache(builder.build());
    Ok(())
}

pub(crate) fn property_pair(node: &Node, resource: &str) -> Result<(String, String)> {
    let name = node
        .attribute("name")
        .ok_or_else(|| malformed(resource, "<property> requires name"))?;
    let value = node
        .attribute("value")
        .ok_or_else(|| malformed(resource, "<property> requires value"))?;
    Ok((name.to_string(), value.to_string()))
}

fn build_parameter_map(
    config: &mut Configuration,
    node: &Node,
    namespace: &str,
    resource: &str,
) -> Result<()> {
    let id = node
        .attribute("id")
        .ok_or_else(|| malformed(resource, "<parameterMap> requires an id"))?;
    let mut mappings = Vec::new();
    for parameter in node.children().filter(Node::is_element) {
        if parameter.tag_name().name() != "parameter" {
            continue;
        }
        let property = parameter
            .attribute("property")
            .ok_or_else(|| malformed(resource, "<parameter> requires property"))?;
        let mut mapping = ParameterMapping::of(property);
        mapping.app_type = parameter.attribute("javaType").map(str::to_string);
        mapping.driver_type = parse_driver_type(&parameter, resource)?;
        if let Some(mode) = parameter.attribute("mode") {
            mapping.mode = ParameterMode::from_name(mode)
                .ok_or_else(|| malformed(resource, format!("unknown parameter mode '{mode}'")))?;
        }
        if let Some(scale) = parameter.attribute("numericScale") {
            mapping.numeric_scale = Some(
                scale
                    .parse()
                    .map_err(|_| malformed(resource, format!("bad numericScale '{scale}'")))?,
            );
        }
        mapping.converter = parameter.attribute("typeHandler").map(str::to_string);
        mapping.result_map_id = parameter
            .attribute("resultMap")
            .map(|id| apply_namespace(namespace, id));
        mappings.push(mapping);
    }
    config.add_parameter_map(ParameterMap {
        id: apply_namespace(namespace, id),
        app_type: node.attribute("type").map(str::to_string),
        mappings,
    });
    Ok(())
}

pub(crate) fn parse_driver_type(node: &Node, resource: &str) -> Result<Option<DriverType>> {
    match node.attribute("jdbcType") {
        None => Ok(None),
        Some(name) => Ok(Some(DriverType::from_name(name).ok_or_else(|| {
            malformed(resource, format!("unknown jdbcType '{name}'"))
        })?)),
    }
}

/// Build one result map (top-level or inline); returns its full id.
/// Unresolvable `extends` or nested references defer.
pub(crate) fn build_result_map(
    config: &mut Configuration,
    node: &Node,
    namespace: &str,
    resource: &str,
    inline_id: Option<String>,
) -> Result<String> {
    let id = match inline_id {
        Some(id) => id,
        None => {
            let id = node
                .attribute("id")
                .ok_or_else(|| malformed(resource, "<resultMap> requires an id"))?;
            apply_namespace(namespace, id)
        }
    };
    let type_name = node
        .attribute("type")
        .or_else(|| node.attribute("ofType"))
        .or_else(|| node.attribute("resultType"))
        .or_else(|| node.attribute("javaType"))
        .unwrap_or("map")
        .to_string();
    let auto_mapping = node.attribute("autoMapping").map(|v| v == "true");

    let mut mappings: Vec<ResultMapping> = Vec::new();
    let mut discriminator = None;
    for child in node.children().filter(Node::is_element) {
        match child.tag_name().name() {
            "constructor" => {
                for arg in child.children().filter(Node::is_element) {
                    let tag = arg.tag_name().name();
                    if tag != "arg" && tag != "idArg" {
                        continue;
                    }
                    let mut mapping =
                        build_result_mapping(config, &arg, namespace, resource, &id)?;
                    mapping.constructor_flag = true;
                    mapping.id_flag = tag == "idArg";
                    mapping.property = arg.attribute("name").map(str::to_string);
                    mappings.push(mapping);
                }
            }
            "id" | "result" => {
                let mut mapping = build_result_mapping(config, &child, namespace, resource, &id)?;
                mapping.id_flag = child.tag_name().name() == "id";
                mappings.push(mapping);
            }
            "association" | "collection" => {
                let mut mapping = build_result_mapping(config, &child, namespace, resource, &id)?;
                mapping.many = child.tag_name().name() == "collection";
                mappings.push(mapping);
            }
            "discriminator" => {
                discriminator = Some(build_discriminator(
                    config, &child, namespace, resource, &id,
                )?);
            }
            other => {
                return Err(malformed(
                    resource,
                    format!("unexpected element <{other}> in resultMap"),
                ));
            }
        }
    }

    // merge an extended parent, child declarations winning
    if let Some(extends) = node.attribute("extends") {
        let parent_id = apply_namespace(namespace, extends);
        let Some(parent) = config.result_map(&parent_id) else {
            return Err(deferred(&format!("resultMap extends '{parent_id}'")));
        };
        let child_declares_constructor = mappings.iter().any(|m| m.constructor_flag);
        let declared: Vec<Option<String>> =
            mappings.iter().map(|m| m.property.clone()).collect();
        for inherited in parent
            .constructor_mappings
            .iter()
            .chain(parent.mappings.iter())
        {
            if inherited.constructor_flag && child_declares_constructor {
                continue;
            }
            if inherited.property.is_some() && declared.contains(&inherited.property) {
                continue;
            }
            mappings.push(inherited.clone());
        }
        if discriminator.is_none() {
            discriminator = parent.discriminator.clone();
        }
    }

    config.add_result_map(ResultMap::new(
        &id,
        &type_name,
        mappings,
        discriminator,
        auto_mapping,
    ));
    Ok(id)
}

fn build_result_mapping(
    config: &mut Configuration,
    node: &Node,
    namespace: &str,
    resource: &str,
    owner_id: &str,
) -> Result<ResultMapping> {
    let mut mapping = ResultMapping {
        property: node.attribute("property").map(str::to_string),
        app_type: node
            .attribute("javaType")
            .or_else(|| node.attribute("ofType"))
            .map(str::to_string),
        driver_type: parse_driver_type(node, resource)?,
        converter: node.attribute("typeHandler").map(str::to_string),
        nested_select: node
            .attribute("select")
            .map(|id| apply_namespace(namespace, id)),
        column_prefix: node.attribute("columnPrefix").map(str::to_string),
        foreign_column: node.attribute("foreignColumn").map(str::to_string),
        result_set: node.attribute("resultSet").map(str::to_string),
        lazy: node.attribute("fetchType") == Some("lazy"),
        ..ResultMapping::default()
    };
    if let Some(columns) = node.attribute("notNullColumn") {
        mapping.not_null_columns = columns
            .split(',')
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty())
            .collect();
    }
    if let Some(column) = node.attribute("column") {
        if let Some(composites) = parse_composites(column) {
            mapping.composites = composites;
        } else {
            mapping.column = Some(column.to_string());
        }
    }
    if let Some(nested) = node.attribute("resultMap") {
        let nested_id = apply_namespace(namespace, nested);
        if !config.has_result_map(&nested_id) {
            return Err(deferred(&format!("nested resultMap '{nested_id}'")));
        }
        mapping.nested_result_map = Some(nested_id);
    } else if node.children().any(|c| c.is_element())
        && matches!(node.tag_name().name(), "association" | "collection" | "case")
    {
        // inline nested result map
        let property = mapping.property.clone().unwrap_or_default();
        let inline = format!("{owner_id}!{property}");
        let built = build_result_map(config, node, namespace, resource, Some(inline))?;
        mapping.nested_result_map = Some(built);
    }
    Ok(mapping)
}

/// `{prop=col,prop2=col2}` composite column bindings.
fn parse_composites(column: &str) -> Option<Vec<(String, String)>> {
    let inner = column.strip_prefix('{')?.strip_suffix('}')?;
    let mut composites = Vec::new();
    for pair in inner.split(',') {
        let (property, column) = pair.split_once('=')?;
        composites.push((property.trim().to_string(), column.trim().to_string()));
    }
    Some(composites)
}

fn build_discriminator(
    config: &mut Configuration,
    node: &Node,
    namespace: &str,
    resource: &str,
    owner_id: &str,
) -> Result<Discriminator> {
    let column = node
        .attribute("column")
        .ok_or_else(|| malformed(resource, "<discriminator> requires column"))?;
    let mut cases = HashMap::new();
    for case in node.children().filter(Node::is_element) {
        if case.tag_name().name() != "case" {
            continue;
        }
        let value = case
            .attribute("value")
            .ok_or_else(|| malformed(resource, "<case> requires value"))?;
        let map_id = match case.attribute("resultMap") {
            Some(id) => {
                let full = apply_namespace(namespace, id);
                if !config.has_result_map(&full) {
                    return Err(deferred(&format!("discriminator case resultMap '{full}'")));
                }
                full
            }
            None => {
                let inline = format!("{owner_id}!case[{value}]");
                build_result_map(config, &case, namespace, resource, Some(inline))?
            }
        };
        cases.insert(value.to_string(), map_id);
    }
    Ok(Discriminator {
        column: column.to_string(),
        app_type: node.attribute("javaType").map(str::to_string),
        driver_type: parse_driver_type(node, resource)?,
        converter: node.attribute("typeHandler").map(str::to_string),
        cases,
    })
}
