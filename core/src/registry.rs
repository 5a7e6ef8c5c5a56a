//! The statement registry: every compiled descriptor a mapping build
//! produces, plus the global settings. Built single-threaded by the mapping
//! compiler, then frozen behind an `Arc` and shared by every session.

use crate::cache::Cache;
use crate::mapping::{KeyGeneratorKind, MappedStatement, ParameterMap, ResultMap};
use crate::transaction::TransactionFactory;
use crate::types::TypeConverterRegistry;
use crate::{Error, Result};
use driver::{DataSource, DriverType};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ExecutorType {
    #[default]
    Simple,
    Reuse,
    Batch,
}

impl ExecutorType {
    pub fn from_name(name: &str) -> Option<ExecutorType> {
        Some(match name.to_uppercase().as_str() {
            "SIMPLE" => ExecutorType::Simple,
            "REUSE" => ExecutorType::Reuse,
            "BATCH" => ExecutorType::Batch,
            _ => return None,
        })
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum AutoMappingBehavior {
    None,
    #[default]
    Partial,
    Full,
}

impl AutoMappingBehavior {
    pub fn from_name(name: &str) -> Option<AutoMappingBehavior> {
        Some(match name.to_uppercase().as_str() {
            "NONE" => AutoMappingBehavior::None,
            "PARTIAL" => AutoMappingBehavior::Partial,
            "FULL" => AutoMappingBehavior::Full,
            _ => return None,
        })
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum AutoMappingUnknownColumnBehavior {
    #[default]
    None,
    Warning,
    Failing,
}

impl AutoMappingUnknownColumnBehavior {
    pub fn from_name(name: &str) -> Option<AutoMappingUnknownColumnBehavior> {
        Some(match name.to_uppercase().as_str() {
            "NONE" => AutoMappingUnknownColumnBehavior::None,
            "WARNING" => AutoMappingUnknownColumnBehavior::Warning,
            "FAILING" => AutoMappingUnknownColumnBehavior::Failing,
            _ => return None,
        })
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LocalCacheScope {
    #[default]
    Session,
    Statement,
}

impl LocalCacheScope {
    pub fn from_name(name: &str) -> Option<LocalCacheScope> {
        Some(match name.to_uppercase().as_str() {
            "SESSION" => LocalCacheScope::Session,
            "STATEMENT" => LocalCacheScope::Statement,
            _ => return None,
        })
    }
}

/// The recognized global settings, with their documented defaults.
#[derive(Clone, Debug)]
pub struct Settings {
    pub cache_enabled: bool,
    pub lazy_loading_enabled: bool,
    pub aggressive_lazy_loading: bool,
    pub multiple_result_sets_enabled: bool,
    pub use_column_label: bool,
    pub use_generated_keys: bool,
    pub auto_mapping_behavior: AutoMappingBehavior,
    pub auto_mapping_unknown_column_behavior: AutoMappingUnknownColumnBehavior,
    pub default_executor_type: ExecutorType,
    pub default_statement_timeout: Option<u64>,
    pub default_fetch_size: Option<u32>,
    pub map_underscore_to_camel_case: bool,
    pub safe_row_bounds_enabled: bool,
    pub safe_result_handler_enabled: bool,
    pub local_cache_scope: LocalCacheScope,
    pub jdbc_type_for_null: DriverType,
    pub lazy_load_trigger_methods: HashSet<String>,
    pub call_setters_on_nulls: bool,
    pub return_instance_for_empty_row: bool,
    pub use_actual_param_name: bool,
}

impl Default for Settings {
    fn default() -> Settings {
        Settings {
            cache_enabled: true,
            lazy_loading_enabled: false,
            aggressive_lazy_loading: false,
            multiple_result_sets_enabled: true,
            use_column_label: true,
            use_generated_keys: false,
            auto_mapping_behavior: AutoMappingBehavior::Partial,
            auto_mapping_unknown_column_behavior: AutoMappingUnknownColumnBehavior::None,
            default_executor_type: ExecutorType::Simple,
            default_statement_timeout: None,
            default_fetch_size: None,
            map_underscore_to_camel_case: false,
            safe_row_bounds_enabled: false,
            safe_result_handler_enabled: true,
            local_cache_scope: LocalCacheScope::Session,
            jdbc_type_for_null: DriverType::Other,
            lazy_load_trigger_methods: ["equals", "clone", "hashCode", "toString"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            call_setters_on_nulls: false,
            return_instance_for_empty_row: false,
            use_actual_param_name: true,
        }
    }
}

fn parse_bool(name: &str, value: &str) -> Result<bool> {
    match value {
        "true" => Ok(true),
        "false" => Ok(false),
        _ => Err(Error::malformed(format!(
            "setting '{name}' expects true/false, got '{value}'"
        ))),
    }
}

impl Settings {
    /// Apply one `<setting name value>` pair; unrecognized names fail.
    pub fn apply(&mut self, name: &str, value: &str) -> Result<()> {
        match name {
            "cacheEnabled" => self.cache_enabled = parse_bool(name, value)?,
            "lazyLoadingEnabled" => self.lazy_loading_enabled = parse_bool(name, value)?,
            "aggressiveLazyLoading" => self.aggressive_lazy_loading = parse_bool(name, value)?,
            "multipleResultSetsEnabled" => {
                self.multiple_result_sets_enabled = parse_bool(name, value)?;
            }
            "useColumnLabel" => self.use_column_label = parse_bool(name, value)?,
            "useGeneratedKeys" => self.use_generated_keys = parse_bool(name, value)?,
            "autoMappingBehavior" => {
                self.auto_mapping_behavior = AutoMappingBehavior::from_name(value)
                    .ok_or_else(|| Error::malformed(format!("bad autoMappingBehavior '{value}'")))?;
            }
            "autoMappingUnknownColumnBehavior" => {
                self.auto_mapping_unknown_column_behavior =
                    AutoMappingUnknownColumnBehavior::from_name(value).ok_or_else(|| {
                        Error::malformed(format!("bad autoMappingUnknownColumnBehavior '{value}'"))
                    })?;
            }
            "defaultExecutorType" => {
                self.default_executor_type = ExecutorType::from_name(value)
                    .ok_or_else(|| Error::malformed(format!("bad defaultExecutorType '{value}'")))?;
            }
            "defaultStatementTimeout" => {
                self.default_statement_timeout = Some(value.parse().map_err(|_| {
                    Error::malformed(format!("bad defaultStatementTimeout '{value}'"))
                })?);
            }
            "defaultFetchSize" => {
                self.default_fetch_size = Some(value.parse().map_err(|_| {
                    Error::malformed(format!("bad defaultFetchSize '{value}'"))
                })?);
            }
            "mapUnderscoreToCamelCase" => {
                self.map_underscore_to_camel_case = parse_bool(name, value)?;
            }
            "safeRowBoundsEnabled" => self.safe_row_bounds_enabled = parse_bool(name, value)?,
            "safeResultHandlerEnabled" => {
                self.safe_result_handler_enabled = parse_bool(name, value)?;
            }
            "localCacheScope" => {
                self.local_cache_scope = LocalCacheScope::from_name(value)
                    .ok_or_else(|| Error::malformed(format!("bad localCacheScope '{value}'")))?;
            }
            "jdbcTypeForNull" => {
                self.jdbc_type_for_null = DriverType::from_name(value)
                    .ok_or_else(|| Error::malformed(format!("bad jdbcTypeForNull '{value}'")))?;
            }
            "lazyLoadTriggerMethods" => {
                self.lazy_load_trigger_methods =
                    value.split(',').map(|m| m.trim().to_string()).collect();
            }
            "callSettersOnNulls" => self.call_setters_on_nulls = parse_bool(name, value)?,
            "returnInstanceForEmptyRow" => {
                self.return_instance_for_empty_row = parse_bool(name, value)?;
            }
            "useActualParamName" => self.use_actual_param_name = parse_bool(name, value)?,
            unknown => return Err(Error::UnknownSetting(unknown.to_string())),
        }
        Ok(())
    }
}

/// A transaction factory paired with the datasource it drives.
#[derive(Clone)]
pub struct Environment {
    pub id: String,
    pub transaction_factory: TransactionFactory,
    pub data_source: Arc<dyn DataSource>,
}

impl Environment {
    pub fn new(
        id: &str,
        transaction_factory: TransactionFactory,
        data_source: Arc<dyn DataSource>,
    ) -> Environment {
        Environment {
            id: id.to_string(),
            transaction_factory,
            data_source,
        }
    }
}

#[derive(Default)]
pub struct Configuration {
    pub settings: Settings,
    pub database_id: Option<String>,
    environment: Option<Environment>,
    type_aliases: HashMap<String, String>,
    pub type_converters: TypeConverterRegistry,
    mapped_statements: HashMap<String, Arc<MappedStatement>>,
    result_maps: HashMap<String, Arc<ResultMap>>,
    parameter_maps: HashMap<String, Arc<ParameterMap>>,
    key_generators: HashMap<String, KeyGeneratorKind>,
    caches: HashMap<String, Arc<dyn Cache>>,
    cache_refs: HashMap<String, String>,
    sql_fragments: HashMap<String, String>,
    loaded_resources: HashSet<String>,
}

impl std::fmt::Debug for Configuration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Configuration").finish_non_exhaustive()
    }
}

impl Configuration {
    pub fn new() -> Configuration {
        Configuration::default()
    }

    pub fn environment(&self) -> Option<&Environment> {
        self.environment.as_ref()
    }

    pub fn set_environment(&mut self, environment: Environment) {
        self.environment = Some(environment);
    }

    pub fn register_alias(&mut self, alias: &str, type_name: &str) {
        self.type_aliases
            .insert(alias.to_string(), type_name.to_string());
    }

    /// Resolve a declared type name through the alias table; unknown names
    /// pass through unchanged.
    pub fn resolve_type(&self, name: &str) -> String {
        match self.type_aliases.get(name) {
            Some(resolved) => resolved.clone(),
            None => match name {
                "String" => "string".to_string(),
                "Integer" | "Int" => "int".to_string(),
                "Long" => "long".to_string(),
                "Short" => "short".to_string(),
                "Byte" => "byte".to_string(),
                "Float" => "float".to_string(),
                "Double" => "double".to_string(),
                "Boolean" => "boolean".to_string(),
                "Map" | "HashMap" => "map".to_string(),
                "List" | "ArrayList" => "list".to_string(),
                "Object" => "object".to_string(),
                other => other.to_string(),
            },
        }
    }

    /// Whether a statement declared with `declared_database_id` may register
    /// under the configured global database id, honoring the priority of
    /// database-id-matched statements.
    pub fn accepts_statement(&self, id: &str, declared_database_id: Option<&str>) -> bool {
        match (&self.database_id, declared_database_id) {
            (Some(current), Some(declared)) => current == declared,
            (Some(_), None) => {
                // an id-less statement must not displace a databaseId match
                !self
                    .mapped_statements
                    .get(id)
                    .is_some_and(|existing| existing.database_id.is_some())
            }
            (None, Some(_)) => false,
            (None, None) => true,
        }
    }

    pub fn add_mapped_statement(&mut self, statement: MappedStatement) {
        self.mapped_statements
            .insert(statement.id.clone(), Arc::new(statement));
    }

    pub fn mapped_statement(&self, id: &str) -> Result<Arc<MappedStatement>> {
        self.mapped_statements
            .get(id)
            .cloned()
            .ok_or_else(|| Error::StatementNotFound(id.to_string()))
    }

    pub fn has_statement(&self, id: &str) -> bool {
        self.mapped_statements.contains_key(id)
    }

    pub fn statement_ids(&self) -> impl Iterator<Item = &str> {
        self.mapped_statements.keys().map(String::as_str)
    }

    pub fn add_result_map(&mut self, result_map: ResultMap) {
        self.result_maps
            .insert(result_map.id.clone(), Arc::new(result_map));
    }

    pub fn result_map(&self, id: &str) -> Option<Arc<ResultMap>> {
        self.result_maps.get(id).cloned()
    }

    pub fn has_result_map(&self, id: &str) -> bool {
        self.result_maps.contains_key(id)
    }

    pub fn add_parameter_map(&mut self, parameter_map: ParameterMap) {
        self.parameter_maps
            .insert(parameter_map.id.clone(), Arc::new(parameter_map));
    }

    pub fn parameter_map(&self, id: &str) -> Option<Arc<ParameterMap>> {
        self.parameter_maps.get(id).cloned()
    }

    pub fn add_key_generator(&mut self, id: &str, kind: KeyGeneratorKind) {
        self.key_generators.insert(id.to_string(), kind);
    }

    pub fn key_generator(&self, id: &str) -> Option<&KeyGeneratorKind> {
        self.key_generators.get(id)
    }

    pub fn add_cache(&mut self, cache: Arc<dyn Cache>) {
        self.caches.insert(cache.id().to_string(), cache);
    }

    pub fn cache(&self, namespace: &str) -> Option<Arc<dyn Cache>> {
        self.caches.get(namespace).cloned()
    }

    pub fn add_cache_ref(&mut self, namespace: &str, referenced: &str) {
        self.cache_refs
            .insert(namespace.to_string(), referenced.to_string());
    }

    /// The cache a namespace uses: its own, or the one its `cache-ref`
    /// chain points at.
    pub fn effective_cache(&self, namespace: &str) -> Option<Arc<dyn Cache>> {
        let mut current = namespace;
        // bounded walk in case a build left a reference cycle behind
        for _ in 0..16 {
            if let Some(cache) = self.caches.get(current) {
                return Some(cache.clone());
            }
            match self.cache_refs.get(current) {
                Some(referenced) => current = referenced,
                None => return None,
            }
        }
        None
    }

    pub fn add_sql_fragment(&mut self, id: &str, raw_xml: &str) {
        self.sql_fragments.insert(id.to_string(), raw_xml.to_string());
    }

    pub fn sql_fragment(&self, id: &str) -> Option<&str> {
        self.sql_fragments.get(id).map(String::as_str)
    }

    pub fn mark_resource_loaded(&mut self, resource: &str) -> bool {
        self.loaded_resources.insert(resource.to_string())
    }
}
