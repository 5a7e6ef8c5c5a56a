//! Builds a [`Configuration`] from configuration markup: settings, type
//! aliases, converter registrations, the selected environment, the database
//! id, and every referenced mapper source.

use crate::builder::{malformed, property_pair, XmlMapperBuilder};
use crate::pool::{PoolConfig, PooledDataSource, UnpooledDataSource};
use crate::registry::{Configuration, Environment};
use crate::transaction::TransactionFactory;
use crate::{Error, Result};
use driver::{DataSource, DriverType};
use log::warn;
use roxmltree::{Document, Node};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

const CONFIG_RESOURCE: &str = "<configuration>";

pub struct XmlConfigBuilder {
    config: Configuration,
    mappers: XmlMapperBuilder,
    base_dir: PathBuf,
    // preloaded sources consulted before the filesystem, keyed by resource
    inline_sources: HashMap<String, String>,
}

impl Default for XmlConfigBuilder {
    fn default() -> XmlConfigBuilder {
        XmlConfigBuilder::new()
    }
}

impl XmlConfigBuilder {
    pub fn new() -> XmlConfigBuilder {
        XmlConfigBuilder {
            config: Configuration::new(),
            mappers: XmlMapperBuilder::new(),
            base_dir: PathBuf::new(),
            inline_sources: HashMap::new(),
        }
    }

    pub fn base_dir(mut self, dir: impl Into<PathBuf>) -> XmlConfigBuilder {
        self.base_dir = dir.into();
        self
    }

    /// Preload a mapper source under a resource name, so `<mapper
    /// resource="...">` resolves without touching the filesystem.
    pub fn mapper_source(mut self, resource: &str, xml: &str) -> XmlConfigBuilder {
        self.inline_sources
            .insert(resource.to_string(), xml.to_string());
        self
    }

    pub fn parse(mut self, xml: &str) -> Result<Configuration> {
        let doc = Document::parse(xml)
            .map_err(|e| malformed(CONFIG_RESOURCE, format!("unparsable configuration: {e}")))?;
        let root = doc.root_element();
        if root.tag_name().name() != "configuration" {
            return Err(malformed(CONFIG_RESOURCE, "root element must be <configuration>"));
        }

        // fixed processing order, independent of document order
        if let Some(node) = child(&root, "settings") {
            self.parse_settings(&node)?;
        }
        if let Some(node) = child(&root, "typeAliases") {
            self.parse_type_aliases(&node)?;
        }
        if let Some(node) = child(&root, "typeHandlers") {
            self.parse_type_handlers(&node)?;
        }
        if let Some(node) = child(&root, "environments") {
            self.parse_environments(&node)?;
        }
        if let Some(node) = child(&root, "databaseIdProvider") {
            self.parse_database_id_provider(&node)?;
        }
        if let Some(node) = child(&root, "mappers") {
            self.parse_mappers(&node)?;
        }

        self.mappers.finish(&mut self.config)?;
        Ok(self.config)
    }

    fn parse_settings(&mut self, node: &Node) -> Result<()> {
        for setting in node.children().filter(Node::is_element) {
            if setting.tag_name().name() != "setting" {
                continue;
            }
            let (name, value) = property_pair(&setting, CONFIG_RESOURCE)?;
            self.config.settings.apply(&name, &value)?;
        }
        Ok(())
    }

    fn parse_type_aliases(&mut self, node: &Node) -> Result<()> {
        for alias in node.children().filter(Node::is_element) {
            match alias.tag_name().name() {
                "typeAlias" => {
                    let name = alias
                        .attribute("alias")
                        .ok_or_else(|| malformed(CONFIG_RESOURCE, "<typeAlias> requires alias"))?;
                    let type_name = alias
                        .attribute("type")
                        .ok_or_else(|| malformed(CONFIG_RESOURCE, "<typeAlias> requires type"))?;
                    self.config.register_alias(name, type_name);
                }
                "package" => warn!("typeAlias package scan is not supported; ignoring"),
                other => {
                    return Err(malformed(
                        CONFIG_RESOURCE,
                        format!("unexpected element <{other}> in typeAliases"),
                    ));
                }
            }
        }
        Ok(())
    }

    /// `<typeHandler handler= javaType= jdbcType=>` binds an already
    /// registered named converter onto the two-axis table.
    fn parse_type_handlers(&mut self, node: &Node) -> Result<()> {
        for handler in node.children().filter(Node::is_element) {
            if handler.tag_name().name() != "typeHandler" {
                continue;
            }
            let name = handler
                .attribute("handler")
                .ok_or_else(|| malformed(CONFIG_RESOURCE, "<typeHandler> requires handler"))?;
            let converter = self.config.type_converters.named(name).ok_or_else(|| {
                malformed(
                    CONFIG_RESOURCE,
                    format!("typeHandler '{name}' is not registered"),
                )
            })?;
            let app_type = handler
                .attribute("javaType")
                .ok_or_else(|| malformed(CONFIG_RESOURCE, "<typeHandler> requires javaType"))?;
            let driver_type = match handler.attribute("jdbcType") {
                None => None,
                Some(dt) => Some(DriverType::from_name(dt).ok_or_else(|| {
                    malformed(CONFIG_RESOURCE, format!("unknown jdbcType '{dt}'"))
                })?),
            };
            let app_type = self.config.resolve_type(app_type);
            self.config
                .type_converters
                .register(&app_type, driver_type, converter);
        }
        Ok(())
    }

    fn parse_environments(&mut self, node: &Node) -> Result<()> {
        let default_id = node
            .attribute("default")
            .ok_or_else(|| malformed(CONFIG_RESOURCE, "<environments> requires default"))?;
        for environment in node.children().filter(Node::is_element) {
            if environment.tag_name().name() != "environment" {
                continue;
            }
            let id = environment
                .attribute("id")
                .ok_or_else(|| malformed(CONFIG_RESOURCE, "<environment> requires an id"))?;
            if id != default_id {
                continue;
            }
            let tx_node = child(&environment, "transactionManager").ok_or_else(|| {
                malformed(CONFIG_RESOURCE, "<environment> requires transactionManager")
            })?;
            let tx_type = tx_node
                .attribute("type")
                .ok_or_else(|| malformed(CONFIG_RESOURCE, "transactionManager requires type"))?;
            let transaction_factory = TransactionFactory::from_name(tx_type).ok_or_else(|| {
                malformed(
                    CONFIG_RESOURCE,
                    format!("unknown transaction manager '{tx_type}'"),
                )
            })?;
            let ds_node = child(&environment, "dataSource").ok_or_else(|| {
                malformed(CONFIG_RESOURCE, "<environment> requires dataSource")
            })?;
            let data_source = build_data_source(&ds_node)?;
            self.config
                .set_environment(Environment::new(id, transaction_factory, data_source));
            return Ok(());
        }
        Err(malformed(
            CONFIG_RESOURCE,
            format!("default environment '{default_id}' is not declared"),
        ))
    }

    fn parse_database_id_provider(&mut self, node: &Node) -> Result<()> {
        let mut vendors = HashMap::new();
        for property in node.children().filter(Node::is_element) {
            if property.tag_name().name() == "property" {
                let (name, value) = property_pair(&property, CONFIG_RESOURCE)?;
                vendors.insert(name, value);
            }
        }
        let Some(environment) = self.config.environment() else {
            return Ok(());
        };
        let mut connection = environment.data_source.connection()?;
        let product = connection.product_name()?;
        let _ = connection.close();
        self.config.database_id = vendors.get(&product).cloned();
        Ok(())
    }

    fn parse_mappers(&mut self, node: &Node) -> Result<()> {
        for mapper in node.children().filter(Node::is_element) {
            match mapper.tag_name().name() {
                "mapper" => {
                    let resource = mapper
                        .attribute("resource")
                        .ok_or_else(|| malformed(CONFIG_RESOURCE, "<mapper> requires resource"))?;
                    let xml = match self.inline_sources.get(resource) {
                        Some(xml) => xml.clone(),
                        None => {
                            let path = self.base_dir.join(resource);
                            std::fs::read_to_string(&path).map_err(|e| {
                                Error::ConfigMalformed {
                                    resource: Some(resource.to_string()),
                                    message: format!("cannot read mapper resource: {e}"),
                                }
                            })?
                        }
                    };
                    self.mappers.parse(&mut self.config, &xml, resource)?;
                }
                "package" => warn!("mapper package scan is not supported; ignoring"),
                other => {
                    return Err(malformed(
                        CONFIG_RESOURCE,
                        format!("unexpected element <{other}> in mappers"),
                    ));
                }
            }
        }
        Ok(())
    }
}

fn child<'a, 'input>(node: &Node<'a, 'input>, name: &str) -> Option<Node<'a, 'input>> {
    node.children()
        .find(|c| c.is_element() && c.tag_name().name() == name)
}

fn build_data_source(node: &Node) -> Result<Arc<dyn DataSource>> {
    let ds_type = node
        .attribute("type")
        .ok_or_else(|| malformed(CONFIG_RESOURCE, "dataSource requires type"))?;
    let mut url = None;
    let mut username = String::new();
    let mut password = String::new();
    let mut pool = PoolConfig::default();
    let mut driver_properties = HashMap::new();
    for property in node.children().filter(Node::is_element) {
        if property.tag_name().name() != "property" {
            continue;
        }
        let (name, value) = property_pair(&property, CONFIG_RESOURCE)?;
        match name.as_str() {
            "url" => url = Some(value),
            "username" => username = value,
            "password" => password = value,
            "poolMaximumActiveConnections" => pool.max_active = parse_num(&name, &value)?,
            "poolMaximumIdleConnections" => pool.max_idle = parse_num(&name, &value)?,
            "poolMaximumCheckoutTime" => {
                pool.max_checkout_time = Duration::from_millis(parse_num(&name, &value)?);
            }
            "poolTimeToWait" => {
                pool.time_to_wait = Duration::from_millis(parse_num(&name, &value)?);
            }
            "poolMaximumLocalBadConnectionTolerance" => {
                pool.bad_connection_tolerance = parse_num(&name, &value)?;
            }
            "poolPingQuery" => pool.ping_query = value,
            "poolPingEnabled" => pool.ping_enabled = value == "true",
            "poolPingConnectionsNotUsedFor" => {
                pool.ping_not_used_for = Duration::from_millis(parse_num(&name, &value)?);
            }
            _ => {
                driver_properties.insert(name, value);
            }
        }
    }
    let url = url.ok_or_else(|| malformed(CONFIG_RESOURCE, "dataSource requires a url property"))?;
    let unpooled = UnpooledDataSource::new(&url, &username, &password)
        .with_properties(driver_properties);
    match ds_type.to_uppercase().as_str() {
        "POOLED" => Ok(Arc::new(PooledDataSource::new(unpooled, pool))),
        "UNPOOLED" => Ok(Arc::new(unpooled)),
        other => Err(malformed(
            CONFIG_RESOURCE,
            format!("unknown dataSource type '{other}'"),
        )),
    }
}

fn parse_num<T: std::str::FromStr>(name: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| malformed(CONFIG_RESOURCE, format!("bad {name} '{value}'")))
}
