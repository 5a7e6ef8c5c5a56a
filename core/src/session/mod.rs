//! The programmatic surface: a factory that builds sessions from a frozen
//! configuration, the session itself, parameter packing, and the
//! namespace-bound mapper facade.

mod cursor;
pub use cursor::SessionCursor;
mod params;
pub use params::{pack_args, pack_named};

use crate::builder::XmlConfigBuilder;
use crate::executor::{
    BatchResult, CachingExecutor, Executor, ResultHandler, RowBounds, SessionExecutor,
};
use crate::meta::MetaObject;
use crate::registry::{Configuration, ExecutorType};
use crate::sql::value_to_text;
use crate::{Error, Result};
use driver::Value;
use std::sync::Arc;

/// Builds sessions over one configuration. Cheap to clone and share.
#[derive(Clone)]
pub struct SqlSessionFactory {
    config: Arc<Configuration>,
}

impl SqlSessionFactory {
    pub fn new(config: Configuration) -> SqlSessionFactory {
        SqlSessionFactory {
            config: Arc::new(config),
        }
    }

    pub fn from_xml(xml: &str) -> Result<SqlSessionFactory> {
        Ok(SqlSessionFactory::new(XmlConfigBuilder::new().parse(xml)?))
    }

    pub fn configuration(&self) -> &Arc<Configuration> {
        &self.config
    }

    pub fn open_session(&self) -> Result<SqlSession> {
        self.open_session_with(self.config.settings.default_executor_type, false)
    }

    pub fn open_session_with(
        &self,
        executor_type: ExecutorType,
        auto_commit: bool,
    ) -> Result<SqlSession> {
        let environment = self.config.environment().ok_or_else(|| {
            Error::malformed("configuration has no environment to open a session against")
        })?;
        let tx = environment.transaction_factory.new_transaction(
            &environment.data_source,
            None,
            auto_commit,
        )?;
        let delegate = SessionExecutor::new(self.config.clone(), tx, executor_type);
        let executor: Box<dyn Executor> = if self.config.settings.cache_enabled {
            Box::new(CachingExecutor::new(delegate))
        } else {
            Box::new(delegate)
        };
        Ok(SqlSession {
            config: self.config.clone(),
            executor,
            auto_commit,
            dirty: false,
        })
    }
}

/// A short-lived facade over one executor and one transaction. Owned by one
/// caller at a time; not safe for concurrent use.
pub struct SqlSession {
    config: Arc<Configuration>,
    executor: Box<dyn Executor>,
    auto_commit: bool,
    dirty: bool,
}

impl SqlSession {
    pub fn configuration(&self) -> &Arc<Configuration> {
        &self.config
    }

    pub fn select_list(&mut self, id: &str, parameter: Value) -> Result<Vec<Value>> {
        self.select_list_bounds(id, parameter, RowBounds::default())
    }

    pub fn select_list_bounds(
        &mut self,
        id: &str,
        parameter: Value,
        row_bounds: RowBounds,
    ) -> Result<Vec<Value>> {
        let ms = self.config.mapped_statement(id)?;
        let mut parameter = parameter;
        let rows = self
            .executor
            .query(&ms, &mut parameter, &row_bounds, None)?;
        Ok(rows.as_ref().clone())
    }

    pub fn select_one(&mut self, id: &str, parameter: Value) -> Result<Option<Value>> {
        let mut rows = self.select_list(id, parameter)?;
        match rows.len() {
            0 => Ok(None),
            1 => Ok(Some(rows.remove(0))),
            n => Err(Error::ResultMaterialization {
                statement: id.to_string(),
                reason: format!("expected one result (or none) but found {n}"),
            }),
        }
    }

    /// Collect results into a map keyed by one property of each row.
    pub fn select_map(
        &mut self,
        id: &str,
        parameter: Value,
        map_key: &str,
    ) -> Result<serde_json::Map<String, Value>> {
        let rows = self.select_list(id, parameter)?;
        let mut out = serde_json::Map::new();
        for row in rows {
            let key = MetaObject::get(&row, map_key);
            out.insert(value_to_text(&key), row);
        }
        Ok(out)
    }

    /// Stream results through a caller-supplied handler instead of
    /// collecting a list.
    pub fn select(
        &mut self,
        id: &str,
        parameter: Value,
        row_bounds: RowBounds,
        handler: &mut dyn ResultHandler,
    ) -> Result<()> {
        let ms = self.config.mapped_statement(id)?;
        let mut parameter = parameter;
        self.executor
            .query(&ms, &mut parameter, &row_bounds, Some(handler))?;
        Ok(())
    }

    /// A lazy row iterator owning its own driver statement; supports flat
    /// result maps only.
    pub fn select_cursor(
        &mut self,
        id: &str,
        parameter: Value,
        row_bounds: RowBounds,
    ) -> Result<SessionCursor<'_>> {
        let ms = self.config.mapped_statement(id)?;
        let (stmt, cursor) = self.executor.open_cursor(&ms, &parameter, &row_bounds)?;
        SessionCursor::new(self.config.clone(), &ms, stmt, cursor, row_bounds.limit)
    }

    pub fn insert(&mut self, id: &str, parameter: &mut Value) -> Result<u64> {
        self.run_update(id, parameter)
    }

    pub fn update(&mut self, id: &str, parameter: &mut Value) -> Result<u64> {
        self.run_update(id, parameter)
    }

    pub fn delete(&mut self, id: &str, parameter: &mut Value) -> Result<u64> {
        self.run_update(id, parameter)
    }

    fn run_update(&mut self, id: &str, parameter: &mut Value) -> Result<u64> {
        let ms = self.config.mapped_statement(id)?;
        self.dirty = true;
        self.executor.update(&ms, parameter)
    }

    pub fn flush_statements(&mut self) -> Result<Vec<BatchResult>> {
        self.executor.flush_statements()
    }

    pub fn commit(&mut self, force: bool) -> Result<()> {
        let required = self.commit_or_rollback_required(force);
        self.executor.commit(required)?;
        self.dirty = false;
        Ok(())
    }

    pub fn rollback(&mut self, force: bool) -> Result<()> {
        let required = self.commit_or_rollback_required(force);
        self.executor.rollback(required)?;
        self.dirty = false;
        Ok(())
    }

    fn commit_or_rollback_required(&self, force: bool) -> bool {
        (!self.auto_commit && self.dirty) || force
    }

    pub fn clear_cache(&mut self) {
        self.executor.clear_local_cache();
    }

    pub fn close(&mut self) {
        let force_rollback = self.commit_or_rollback_required(false);
        self.executor.close(force_rollback);
        self.dirty = false;
    }

    pub fn is_closed(&self) -> bool {
        self.executor.is_closed()
    }

    /// Namespace-bound facade resolving `namespace.method` statement ids
    /// and applying the parameter packing rules.
    pub fn mapper(&mut self, namespace: &str) -> Mapper<'_> {
        Mapper {
            session: self,
            namespace: namespace.to_string(),
        }
    }
}

impl Drop for SqlSession {
    fn drop(&mut self) {
        if !self.is_closed() {
            self.close();
        }
    }
}

/// Statement invocations addressed by method name within one namespace,
/// with positional/named arguments packed per the framework rules.
pub struct Mapper<'a> {
    session: &'a mut SqlSession,
    namespace: String,
}

impl Mapper<'_> {
    fn statement_id(&self, method: &str) -> String {
        format!(
            "{}{}{method}",
            self.namespace,
            constants::NAMESPACE_SEPARATOR
        )
    }

    pub fn select_list(&mut self, method: &str, args: &[Value]) -> Result<Vec<Value>> {
        let id = self.statement_id(method);
        self.session.select_list(&id, pack_args(args))
    }

    pub fn select_one(&mut self, method: &str, args: &[Value]) -> Result<Option<Value>> {
        let id = self.statement_id(method);
        self.session.select_one(&id, pack_args(args))
    }

    pub fn select_one_named(
        &mut self,
        method: &str,
        args: &[(&str, Value)],
    ) -> Result<Option<Value>> {
        let id = self.statement_id(method);
        self.session.select_one(&id, pack_named(args))
    }

    pub fn select_list_named(
        &mut self,
        method: &str,
        args: &[(&str, Value)],
    ) -> Result<Vec<Value>> {
        let id = self.statement_id(method);
        self.session.select_list(&id, pack_named(args))
    }

    pub fn insert(&mut self, method: &str, parameter: &mut Value) -> Result<u64> {
        let id = self.statement_id(method);
        self.session.insert(&id, parameter)
    }

    pub fn update(&mut self, method: &str, parameter: &mut Value) -> Result<u64> {
        let id = self.statement_id(method);
        self.session.update(&id, parameter)
    }

    pub fn delete(&mut self, method: &str, args: &[Value]) -> Result<u64> {
        let id = self.statement_id(method);
        let mut packed = pack_args(args);
        self.session.delete(&id, &mut packed)
    }
}
