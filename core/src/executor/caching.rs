use crate::cache::tx::TransactionalCacheManager;
use crate::executor::{
    BatchResult, Executor, ResultHandler, RowBounds, SessionExecutor,
};
use crate::mapping::MappedStatement;
use crate::Result;
use driver::Value;
use log::debug;
use std::sync::Arc;

/// The second-tier decorator: consults the statement's namespace cache
/// through the per-session staging manager, falls through to the wrapped
/// executor on a miss, and stages the result for commit.
pub struct CachingExecutor {
    delegate: SessionExecutor,
    tcm: TransactionalCacheManager,
}

impl CachingExecutor {
    pub fn new(delegate: SessionExecutor) -> CachingExecutor {
        CachingExecutor {
            delegate,
            tcm: TransactionalCacheManager::new(),
        }
    }
}

impl Executor for CachingExecutor {
    fn query(
        &mut self,
        ms: &Arc<MappedStatement>,
        parameter: &mut Value,
        row_bounds: &RowBounds,
        handler: Option<&mut dyn ResultHandler>,
    ) -> Result<Arc<Vec<Value>>> {
        let bound = ms.sql_source.bound_sql(parameter)?;
        let key = self.delegate.create_cache_key(ms, row_bounds, &bound);
        let cache = ms
            .cache_id
            .as_deref()
            .and_then(|id| self.delegate.config().cache(id));
        if let Some(cache) = cache {
            if ms.flush_cache {
                self.tcm.clear(&cache);
            }
            if ms.use_cache && handler.is_none() {
                if let Some(cached) = self.tcm.get(&cache, &key)? {
                    // a null entry is the released-lock marker, not a result
                    if let Value::Array(rows) = cached.as_ref() {
                        debug!("second-tier cache hit for '{}'", ms.id);
                        return Ok(Arc::new(rows.clone()));
                    }
                }
                let rows = self
                    .delegate
                    .query_with(ms, parameter, row_bounds, handler, key.clone(), bound)?;
                self.tcm
                    .put(&cache, key, Arc::new(Value::Array(rows.as_ref().clone())));
                return Ok(rows);
            }
        }
        self.delegate
            .query_with(ms, parameter, row_bounds, handler, key, bound)
    }

    fn open_cursor(
        &mut self,
        ms: &Arc<MappedStatement>,
        parameter: &Value,
        row_bounds: &RowBounds,
    ) -> Result<(
        Box<dyn driver::PreparedStatement>,
        Box<dyn driver::ResultCursor>,
    )> {
        self.delegate.open_cursor(ms, parameter, row_bounds)
    }

    fn update(&mut self, ms: &Arc<MappedStatement>, parameter: &mut Value) -> Result<u64> {
        if ms.flush_cache {
            if let Some(cache) = ms
                .cache_id
                .as_deref()
                .and_then(|id| self.delegate.config().cache(id))
            {
                self.tcm.clear(&cache);
            }
        }
        self.delegate.update(ms, parameter)
    }

    fn flush_statements(&mut self) -> Result<Vec<BatchResult>> {
        self.delegate.flush_statements()
    }

    fn commit(&mut self, required: bool) -> Result<()> {
        self.delegate.commit(required)?;
        self.tcm.commit()
    }

    fn rollback(&mut self, required: bool) -> Result<()> {
        let outcome = self.delegate.rollback(required);
        let staged = self.tcm.rollback();
        outcome?;
        staged
    }

    fn clear_local_cache(&mut self) {
        self.delegate.clear_local_cache();
    }

    fn close(&mut self, force_rollback: bool) {
        let staged = if force_rollback {
            self.tcm.rollback()
        } else {
            self.tcm.commit()
        };
        if let Err(e) = staged {
            debug!("error settling staged cache changes on close: {e}");
        }
        self.delegate.close(force_rollback);
    }

    fn is_closed(&self) -> bool {
        self.delegate.is_closed()
    }
}
