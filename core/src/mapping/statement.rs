use crate::mapping::{CommandKind, KeyGeneratorKind, StatementKind};
use crate::sql::SqlSource;
use std::sync::Arc;

/// A compiled SQL operation, uniquely identified by `namespace.id`. Created
/// once at registry build time and immutable for the process lifetime.
#[derive(Clone)]
pub struct MappedStatement {
    pub id: String,
    /// Where the statement was declared, for diagnostics.
    pub resource: String,
    pub command: CommandKind,
    pub kind: StatementKind,
    pub sql_source: Arc<dyn SqlSource>,
    pub parameter_map: Option<String>,
    pub parameter_type: Option<String>,
    pub result_map_ids: Vec<String>,
    pub fetch_size: Option<u32>,
    pub timeout: Option<u64>,
    pub flush_cache: bool,
    pub use_cache: bool,
    /// Namespace cache this statement participates in.
    pub cache_id: Option<String>,
    pub key_generator: KeyGeneratorKind,
    pub key_properties: Vec<String>,
    pub key_columns: Vec<String>,
    pub database_id: Option<String>,
    /// Names for the statement's result sets, in cursor order.
    pub result_sets: Vec<String>,
}

impl MappedStatement {
    pub fn builder(id: &str, command: CommandKind, sql_source: Arc<dyn SqlSource>) -> MappedStatementBuilder {
        MappedStatementBuilder {
            statement: MappedStatement {
                id: id.to_string(),
                resource: String::new(),
                command,
                kind: StatementKind::Prepared,
                sql_source,
                parameter_map: None,
                parameter_type: None,
                result_map_ids: Vec::new(),
                fetch_size: None,
                timeout: None,
                // selects cache by default; writes flush by default
                flush_cache: command.is_write(),
                use_cache: !command.is_write(),
                cache_id: None,
                key_generator: KeyGeneratorKind::None,
                key_properties: Vec::new(),
                key_columns: Vec::new(),
                database_id: None,
                result_sets: Vec::new(),
            },
        }
    }

    pub fn namespace(&self) -> &str {
        self.id
            .rsplit_once(constants::NAMESPACE_SEPARATOR)
            .map(|(ns, _)| ns)
            .unwrap_or("")
    }
}

pub struct MappedStatementBuilder {
    statement: MappedStatement,
}

impl MappedStatementBuilder {
    pub fn resource(mut self, resource: &str) -> Self {
        self.statement.resource = resource.to_string();
        self
    }

    pub fn kind(mut self, kind: StatementKind) -> Self {
        self.statement.kind = kind;
        self
    }

    pub fn parameter_map(mut self, id: Option<String>) -> Self {
        self.statement.parameter_map = id;
        self
    }

    pub fn parameter_type(mut self, name: Option<String>) -> Self {
        self.statement.parameter_type = name;
        self
    }

    pub fn result_map_ids(mut self, ids: Vec<String>) -> Self {
        self.statement.result_map_ids = ids;
        self
    }

    pub fn fetch_size(mut self, size: Option<u32>) -> Self {
        self.statement.fetch_size = size;
        self
    }

    pub fn timeout(mut self, timeout: Option<u64>) -> Self {
        self.statement.timeout = timeout;
        self
    }

    pub fn flush_cache(mut self, flush: bool) -> Self {
        self.statement.flush_cache = flush;
        self
    }

    pub fn use_cache(mut self, use_cache: bool) -> Self {
        self.statement.use_cache = use_cache;
        self
    }

    pub fn cache_id(mut self, cache_id: Option<String>) -> Self {
        self.statement.cache_id = cache_id;
        self
    }

    pub fn key_generator(mut self, kind: KeyGeneratorKind) -> Self {
        self.statement.key_generator = kind;
        self
    }

    pub fn key_properties(mut self, properties: Vec<String>) -> Self {
        self.statement.key_properties = properties;
        self
    }

    pub fn key_columns(mut self, columns: Vec<String>) -> Self {
        self.statement.key_columns = columns;
        self
    }

    pub fn database_id(mut self, database_id: Option<String>) -> Self {
        self.statement.database_id = database_id;
        self
    }

    pub fn result_sets(mut self, names: Vec<String>) -> Self {
        self.statement.result_sets = names;
        self
    }

    pub fn build(self) -> MappedStatement {
        self.statement
    }
}
