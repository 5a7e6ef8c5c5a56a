//! The layered executor runtime: local caching with recursion sentinels,
//! deferred loads, statement reuse and batching, and the cross-session
//! caching decorator.

mod caching;
pub use caching::CachingExecutor;
pub(crate) mod results;
mod statement;

use crate::cache::CacheKey;
use crate::mapping::{CommandKind, KeyGeneratorKind, MappedStatement, ResultMapping, StatementKind};
use crate::meta::MetaObject;
use crate::registry::{Configuration, ExecutorType, LocalCacheScope};
use crate::sql::BoundSql;
use crate::transaction::Transaction;
use crate::{Error, Result};
use driver::{PreparedStatement, Value};
use log::debug;
use std::collections::HashMap;
use std::sync::Arc;

/// A row range applied to a query: skip `offset` rows, stop after `limit`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RowBounds {
    pub offset: usize,
    pub limit: usize,
}

impl Default for RowBounds {
    fn default() -> RowBounds {
        RowBounds {
            offset: 0,
            limit: usize::MAX,
        }
    }
}

impl RowBounds {
    pub fn new(offset: usize, limit: usize) -> RowBounds {
        RowBounds { offset, limit }
    }

    pub fn is_default(&self) -> bool {
        *self == RowBounds::default()
    }
}

/// Outcome of one batched statement group after a flush.
#[derive(Clone, Debug)]
pub struct BatchResult {
    pub statement_id: String,
    pub sql: String,
    pub parameters: Vec<Value>,
    pub update_counts: Vec<u64>,
}

/// Passed to a [`ResultHandler`] once per produced object.
pub struct ResultContext {
    object: Value,
    result_count: usize,
    stopped: bool,
}

impl Default for ResultContext {
    fn default() -> ResultContext {
        ResultContext::new()
    }
}

impl ResultContext {
    pub fn new() -> ResultContext {
        ResultContext {
            object: Value::Null,
            result_count: 0,
            stopped: false,
        }
    }

    fn next(&mut self, object: Value) {
        self.object = object;
        self.result_count += 1;
    }

    pub fn object(&self) -> &Value {
        &self.object
    }

    pub fn result_count(&self) -> usize {
        self.result_count
    }

    /// Ask the result set walk to stop after this object.
    pub fn stop(&mut self) {
        self.stopped = true;
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }
}

/// Row-by-row consumer of query results.
pub trait ResultHandler {
    fn handle_result(&mut self, context: &mut ResultContext);
}

/// The default handler: collect everything into a list.
#[derive(Default)]
pub struct ListResultHandler {
    pub list: Vec<Value>,
}

impl ResultHandler for ListResultHandler {
    fn handle_result(&mut self, context: &mut ResultContext) {
        self.list.push(context.object().clone());
    }
}

/// The session-facing executor contract.
pub trait Executor {
    fn query(
        &mut self,
        ms: &Arc<MappedStatement>,
        parameter: &mut Value,
        row_bounds: &RowBounds,
        handler: Option<&mut dyn ResultHandler>,
    ) -> Result<Arc<Vec<Value>>>;
    /// Prepare and execute a statement for lazy row-by-row consumption;
    /// the caller owns the statement/cursor pair. Cursor reads bypass both
    /// cache tiers.
    fn open_cursor(
        &mut self,
        ms: &Arc<MappedStatement>,
        parameter: &Value,
        row_bounds: &RowBounds,
    ) -> Result<(Box<dyn PreparedStatement>, Box<dyn driver::ResultCursor>)>;
    fn update(&mut self, ms: &Arc<MappedStatement>, parameter: &mut Value) -> Result<u64>;
    fn flush_statements(&mut self) -> Result<Vec<BatchResult>>;
    fn commit(&mut self, required: bool) -> Result<()>;
    fn rollback(&mut self, required: bool) -> Result<()>;
    fn clear_local_cache(&mut self);
    fn close(&mut self, force_rollback: bool);
    fn is_closed(&self) -> bool;
}

#[derive(Clone)]
enum LocalValue {
    /// Recursion sentinel: the statement for this key is mid-execution.
    Executing,
    Done(Arc<Vec<Value>>),
}

pub(crate) enum NestedState {
    Cached(Arc<Vec<Value>>),
    Executing,
    Absent,
}

struct DeferredLoad {
    row_index: usize,
    property: String,
    statement_id: String,
    parameter: Value,
    many: bool,
}

struct BatchGroup {
    statement_id: String,
    sql: String,
    statement: Box<dyn PreparedStatement>,
    parameters: Vec<Value>,
    wants_keys: bool,
    key_properties: Vec<String>,
    key_columns: Vec<String>,
}

enum Variant {
    Simple,
    Reuse(HashMap<String, Box<dyn PreparedStatement>>),
    Batch {
        groups: Vec<BatchGroup>,
        current_sql: Option<String>,
        current_id: Option<String>,
    },
}

/// One session's executor: a transaction, a session-local cache, the
/// deferred-load queue, and the variant-specific statement strategy.
pub struct SessionExecutor {
    config: Arc<Configuration>,
    tx: Box<dyn Transaction>,
    variant: Variant,
    local_cache: HashMap<CacheKey, LocalValue>,
    out_cache: HashMap<CacheKey, Value>,
    deferred: Vec<DeferredLoad>,
    query_stack: u32,
    closed: bool,
}

impl SessionExecutor {
    pub fn new(
        config: Arc<Configuration>,
        tx: Box<dyn Transaction>,
        executor_type: ExecutorType,
    ) -> SessionExecutor {
        let variant = match executor_type {
            ExecutorType::Simple => Variant::Simple,
            ExecutorType::Reuse => Variant::Reuse(HashMap::new()),
            ExecutorType::Batch => Variant::Batch {
                groups: Vec::new(),
                current_sql: None,
                current_id: None,
            },
        };
        SessionExecutor {
            config,
            tx,
            variant,
            local_cache: HashMap::new(),
            out_cache: HashMap::new(),
            deferred: Vec::new(),
            query_stack: 0,
            closed: false,
        }
    }

    pub(crate) fn config(&self) -> Arc<Configuration> {
        self.config.clone()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            return Err(Error::Driver(driver::Error::General(
                "executor was closed".to_string(),
            )));
        }
        Ok(())
    }

    /// Cache key of one query invocation: statement id, row range, final
    /// SQL, every bound parameter value, and the environment id.
    pub fn create_cache_key(
        &self,
        ms: &MappedStatement,
        row_bounds: &RowBounds,
        bound: &BoundSql,
    ) -> CacheKey {
        let mut key = CacheKey::new();
        key.update(Value::String(ms.id.clone()));
        key.update(Value::from(row_bounds.offset as u64));
        key.update(Value::from(row_bounds.limit as u64));
        key.update(Value::String(bound.sql.clone()));
        for mapping in &bound.parameter_mappings {
            if mapping.mode.is_in() {
                key.update(bound.value_of(&mapping.property));
            }
        }
        if let Some(environment) = self.config.environment() {
            key.update(Value::String(environment.id.clone()));
        }
        key
    }

    pub(crate) fn nested_select_state(
        &mut self,
        ms: &Arc<MappedStatement>,
        parameter: &Value,
    ) -> Result<NestedState> {
        let bound = ms.sql_source.bound_sql(parameter)?;
        let key = self.create_cache_key(ms, &RowBounds::default(), &bound);
        Ok(match self.local_cache.get(&key) {
            Some(LocalValue::Done(rows)) => NestedState::Cached(rows.clone()),
            Some(LocalValue::Executing) => NestedState::Executing,
            None => NestedState::Absent,
        })
    }

    pub(crate) fn defer_load(
        &mut self,
        row_index: usize,
        property: String,
        statement_id: String,
        parameter: Value,
        many: bool,
    ) {
        self.deferred.push(DeferredLoad {
            row_index,
            property,
            statement_id,
            parameter,
            many,
        });
    }

    /// The base query algorithm with a precomputed key and bound SQL (the
    /// caching decorator computes these once and passes them down).
    pub(crate) fn query_with(
        &mut self,
        ms: &Arc<MappedStatement>,
        parameter: &mut Value,
        row_bounds: &RowBounds,
        handler: Option<&mut dyn ResultHandler>,
        key: CacheKey,
        bound: BoundSql,
    ) -> Result<Arc<Vec<Value>>> {
        self.ensure_open()?;
        if self.query_stack == 0 && ms.flush_cache {
            self.clear_local_cache();
        }
        let use_local = handler.is_none();
        if use_local {
            match self.local_cache.get(&key) {
                Some(LocalValue::Done(rows)) => {
                    debug!("local cache hit for '{}'", ms.id);
                    let rows = rows.clone();
                    if ms.kind == StatementKind::Callable {
                        if let Some(cached) = self.out_cache.get(&key) {
                            *parameter = cached.clone();
                        }
                    }
                    if self.query_stack == 0
                        && self.config.settings.local_cache_scope == LocalCacheScope::Statement
                    {
                        self.clear_local_cache();
                    }
                    return Ok(rows);
                }
                // a nested select re-entered the statement that is being
                // executed: break the recursion
                Some(LocalValue::Executing) => return Ok(Arc::new(Vec::new())),
                None => {}
            }
        }

        self.query_stack += 1;
        if use_local {
            self.local_cache
                .insert(key.clone(), LocalValue::Executing);
        }
        let outcome = self
            .do_query(ms, parameter, row_bounds, handler, &bound)
            .map_err(|e| contextualize(e, &ms.id, &bound.sql));
        if use_local {
            self.local_cache.remove(&key);
        }
        let mut rows = match outcome {
            Ok(rows) => rows,
            Err(e) => {
                self.query_stack -= 1;
                return Err(e);
            }
        };
        if self.query_stack == 1 {
            if let Err(e) = self.run_deferred(&mut rows) {
                self.query_stack -= 1;
                return Err(e);
            }
        }
        let rows = Arc::new(rows);
        if use_local {
            self.local_cache
                .insert(key.clone(), LocalValue::Done(rows.clone()));
            if ms.kind == StatementKind::Callable {
                self.out_cache.insert(key, parameter.clone());
            }
        }
        self.query_stack -= 1;
        if self.query_stack == 0
            && self.config.settings.local_cache_scope == LocalCacheScope::Statement
        {
            self.clear_local_cache();
        }
        Ok(rows)
    }

    fn do_query(
        &mut self,
        ms: &Arc<MappedStatement>,
        parameter: &mut Value,
        row_bounds: &RowBounds,
        handler: Option<&mut dyn ResultHandler>,
        bound: &BoundSql,
    ) -> Result<Vec<Value>> {
        let allow_defer = self.query_stack == 1;
        let reuse = matches!(self.variant, Variant::Reuse(_));
        let mut stmt = match self.take_reusable(&bound.sql) {
            Some(stmt) => stmt,
            None => {
                let tx_timeout = self.tx.timeout();
                let connection = self.tx.connection()?;
                statement::prepare(
                    connection,
                    &self.config,
                    ms,
                    bound,
                    row_bounds.offset > 0,
                    tx_timeout,
                )?
            }
        };
        let outcome = statement::parameterize(stmt.as_mut(), &self.config, ms, bound).and_then(
            |()| results::handle_results(self, ms, stmt.as_mut(), row_bounds, handler, allow_defer),
        );
        let rows = match outcome {
            Ok(rows) => rows,
            Err(e) => {
                stmt.close();
                return Err(e);
            }
        };
        if ms.kind == StatementKind::Callable {
            statement::handle_out_parameters(stmt.as_mut(), &self.config, bound, parameter)?;
        }
        if reuse {
            self.store_reusable(bound.sql.clone(), stmt);
        } else {
            stmt.close();
        }
        Ok(rows)
    }

    fn take_reusable(&mut self, sql: &str) -> Option<Box<dyn PreparedStatement>> {
        match &mut self.variant {
            Variant::Reuse(statements) => statements.remove(sql),
            _ => None,
        }
    }

    fn store_reusable(&mut self, sql: String, stmt: Box<dyn PreparedStatement>) {
        if let Variant::Reuse(statements) = &mut self.variant {
            statements.insert(sql, stmt);
        }
    }

    fn run_deferred(&mut self, rows: &mut [Value]) -> Result<()> {
        while !self.deferred.is_empty() {
            let load = self.deferred.remove(0);
            let ms = self.config.mapped_statement(&load.statement_id)?;
            let mut parameter = load.parameter.clone();
            let loaded = self.query(&ms, &mut parameter, &RowBounds::default(), None)?;
            let shape = ResultMapping {
                many: load.many,
                ..ResultMapping::default()
            };
            let value = results::extract_nested(loaded.as_ref(), &shape, &load.statement_id)?;
            if let Some(row) = rows.get_mut(load.row_index) {
                MetaObject::set(row, &load.property, value)?;
            }
        }
        Ok(())
    }

    fn do_update(
        &mut self,
        ms: &Arc<MappedStatement>,
        parameter: &mut Value,
        bound: &BoundSql,
    ) -> Result<u64> {
        if let Variant::Batch { .. } = self.variant {
            return self.batch_update(ms, parameter, bound);
        }
        let reuse = matches!(self.variant, Variant::Reuse(_));
        let mut stmt = match self.take_reusable(&bound.sql) {
            Some(stmt) => stmt,
            None => {
                let tx_timeout = self.tx.timeout();
                let connection = self.tx.connection()?;
                statement::prepare(connection, &self.config, ms, bound, false, tx_timeout)?
            }
        };
        let outcome = statement::parameterize(stmt.as_mut(), &self.config, ms, bound)
            .and_then(|()| stmt.execute_update().map_err(Error::from));
        let count = match outcome {
            Ok(count) => count,
            Err(e) => {
                stmt.close();
                return Err(e);
            }
        };
        if ms.kind == StatementKind::Callable {
            statement::handle_out_parameters(stmt.as_mut(), &self.config, bound, parameter)?;
        }
        if ms.key_generator.wants_driver_keys() {
            statement::assign_generated_keys(stmt.as_mut(), ms, parameter)?;
        }
        if reuse {
            self.store_reusable(bound.sql.clone(), stmt);
        } else {
            stmt.close();
        }
        debug!("<== updates: {count}");
        Ok(count)
    }

    /// Group consecutive updates sharing SQL and statement id into one
    /// driver batch; counts arrive at flush.
    fn batch_update(
        &mut self,
        ms: &Arc<MappedStatement>,
        parameter: &mut Value,
        bound: &BoundSql,
    ) -> Result<u64> {
        let same_group = match &self.variant {
            Variant::Batch {
                current_sql,
                current_id,
                ..
            } => {
                current_sql.as_deref() == Some(bound.sql.as_str())
                    && current_id.as_deref() == Some(ms.id.as_str())
            }
            _ => false,
        };
        if !same_group {
            let tx_timeout = self.tx.timeout();
            let connection = self.tx.connection()?;
            let stmt =
                statement::prepare(connection, &self.config, ms, bound, false, tx_timeout)?;
            if let Variant::Batch {
                groups,
                current_sql,
                current_id,
            } = &mut self.variant
            {
                groups.push(BatchGroup {
                    statement_id: ms.id.clone(),
                    sql: bound.sql.clone(),
                    statement: stmt,
                    parameters: Vec::new(),
                    wants_keys: ms.key_generator.wants_driver_keys(),
                    key_properties: ms.key_properties.clone(),
                    key_columns: ms.key_columns.clone(),
                });
                *current_sql = Some(bound.sql.clone());
                *current_id = Some(ms.id.clone());
            }
        }
        if let Variant::Batch { groups, .. } = &mut self.variant {
            let group = groups.last_mut().unwrap();
            statement::parameterize(group.statement.as_mut(), &self.config, ms, bound)?;
            group.statement.add_batch()?;
            group.parameters.push(parameter.clone());
        }
        Ok(0)
    }

    fn do_flush(&mut self, is_rollback: bool) -> Result<Vec<BatchResult>> {
        match &mut self.variant {
            Variant::Simple => Ok(Vec::new()),
            Variant::Reuse(statements) => {
                for (_, mut stmt) in statements.drain() {
                    stmt.close();
                }
                Ok(Vec::new())
            }
            Variant::Batch {
                groups,
                current_sql,
                current_id,
            } => {
                *current_sql = None;
                *current_id = None;
                let mut results = Vec::new();
                let groups = std::mem::take(groups);
                for mut group in groups {
                    if is_rollback {
                        group.statement.close();
                        continue;
                    }
                    let counts = group
                        .statement
                        .execute_batch()
                        .map_err(|e| Error::execution(&group.statement_id, &group.sql, e))?;
                    let mut parameters = group.parameters;
                    if group.wants_keys {
                        // rows align with the batched inputs
                        let mut aligned = Value::Array(std::mem::take(&mut parameters));
                        let shape = MappedStatement::builder(
                            &group.statement_id,
                            CommandKind::Insert,
                            Arc::new(crate::sql::StaticSqlSource::new(
                                String::new(),
                                Vec::new(),
                            )),
                        )
                        .key_generator(KeyGeneratorKind::DriverGenerated)
                        .key_properties(group.key_properties.clone())
                        .key_columns(group.key_columns.clone())
                        .build();
                        statement::assign_generated_keys(
                            group.statement.as_mut(),
                            &shape,
                            &mut aligned,
                        )?;
                        if let Value::Array(items) = aligned {
                            parameters = items;
                        }
                    }
                    group.statement.close();
                    results.push(BatchResult {
                        statement_id: group.statement_id,
                        sql: group.sql,
                        parameters,
                        update_counts: counts,
                    });
                }
                Ok(results)
            }
        }
    }

    fn run_select_key(
        &mut self,
        key_statement_id: &str,
        parameter: &mut Value,
    ) -> Result<()> {
        let key_ms = self.config.mapped_statement(key_statement_id)?;
        let mut key_parameter = parameter.clone();
        let rows = self.query(&key_ms, &mut key_parameter, &RowBounds::default(), None)?;
        let Some(row) = rows.first() else {
            return Ok(());
        };
        for property in &key_ms.key_properties.clone() {
            let value = match row {
                Value::Object(map) => {
                    let direct = MetaObject::get(row, property);
                    if direct.is_null() && map.len() == 1 && key_ms.key_properties.len() == 1 {
                        map.values().next().cloned().unwrap_or(Value::Null)
                    } else {
                        direct
                    }
                }
                scalar => scalar.clone(),
            };
            MetaObject::set(parameter, property, value)?;
        }
        Ok(())
    }
}

fn contextualize(e: Error, statement_id: &str, sql: &str) -> Error {
    match e {
        Error::Driver(d) => Error::execution(statement_id, sql, d),
        other => other,
    }
}

impl Executor for SessionExecutor {
    fn query(
        &mut self,
        ms: &Arc<MappedStatement>,
        parameter: &mut Value,
        row_bounds: &RowBounds,
        handler: Option<&mut dyn ResultHandler>,
    ) -> Result<Arc<Vec<Value>>> {
        self.ensure_open()?;
        let bound = ms.sql_source.bound_sql(parameter)?;
        let key = self.create_cache_key(ms, row_bounds, &bound);
        self.query_with(ms, parameter, row_bounds, handler, key, bound)
    }

    fn open_cursor(
        &mut self,
        ms: &Arc<MappedStatement>,
        parameter: &Value,
        row_bounds: &RowBounds,
    ) -> Result<(Box<dyn PreparedStatement>, Box<dyn driver::ResultCursor>)> {
        self.ensure_open()?;
        let bound = ms.sql_source.bound_sql(parameter)?;
        let tx_timeout = self.tx.timeout();
        let connection = self.tx.connection()?;
        let mut stmt = statement::prepare(
            connection,
            &self.config,
            ms,
            &bound,
            row_bounds.offset > 0,
            tx_timeout,
        )?;
        if let Err(e) = statement::parameterize(stmt.as_mut(), &self.config, ms, &bound) {
            stmt.close();
            return Err(e);
        }
        let mut cursor = match stmt.execute_query() {
            Ok(cursor) => cursor,
            Err(e) => {
                stmt.close();
                return Err(Error::execution(&ms.id, &bound.sql, e));
            }
        };
        results::skip_rows(cursor.as_mut(), row_bounds)?;
        Ok((stmt, cursor))
    }

    fn update(&mut self, ms: &Arc<MappedStatement>, parameter: &mut Value) -> Result<u64> {
        self.ensure_open()?;
        self.clear_local_cache();
        if let KeyGeneratorKind::SelectKey {
            statement_id,
            before: true,
        } = &ms.key_generator
        {
            self.run_select_key(&statement_id.clone(), parameter)?;
        }
        let bound = ms.sql_source.bound_sql(parameter)?;
        let count = self
            .do_update(ms, parameter, &bound)
            .map_err(|e| contextualize(e, &ms.id, &bound.sql))?;
        if let KeyGeneratorKind::SelectKey {
            statement_id,
            before: false,
        } = &ms.key_generator
        {
            self.run_select_key(&statement_id.clone(), parameter)?;
        }
        Ok(count)
    }

    fn flush_statements(&mut self) -> Result<Vec<BatchResult>> {
        self.ensure_open()?;
        self.do_flush(false)
    }

    fn commit(&mut self, required: bool) -> Result<()> {
        self.ensure_open()?;
        self.clear_local_cache();
        self.do_flush(false)?;
        if required {
            self.tx.commit()?;
        }
        Ok(())
    }

    fn rollback(&mut self, required: bool) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.clear_local_cache();
        self.do_flush(true)?;
        if required {
            self.tx.rollback()?;
        }
        Ok(())
    }

    fn clear_local_cache(&mut self) {
        if !self.closed {
            self.local_cache.clear();
            self.out_cache.clear();
        }
    }

    fn close(&mut self, force_rollback: bool) {
        if self.closed {
            return;
        }
        if let Err(e) = self.rollback(force_rollback) {
            debug!("error rolling back while closing executor: {e}");
        }
        if let Err(e) = self.tx.close() {
            debug!("error closing transaction: {e}");
        }
        self.local_cache.clear();
        self.out_cache.clear();
        self.deferred.clear();
        self.closed = true;
    }

    fn is_closed(&self) -> bool {
        self.closed
    }
}
