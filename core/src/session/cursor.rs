use crate::executor::results::FlatRowReader;
use crate::mapping::MappedStatement;
use crate::registry::Configuration;
use crate::{Error, Result};
use driver::{PreparedStatement, ResultCursor, Value};
use std::marker::PhantomData;
use std::sync::Arc;

/// A lazy sequence over one query's rows. Owns its driver statement and
/// cursor; the borrow on the session keeps the underlying connection alive
/// until the cursor is dropped.
pub struct SessionCursor<'a> {
    _session: PhantomData<&'a mut ()>,
    config: Arc<Configuration>,
    statement: Box<dyn PreparedStatement>,
    cursor: Box<dyn ResultCursor>,
    reader: FlatRowReader,
    remaining: usize,
    exhausted: bool,
}

impl<'a> SessionCursor<'a> {
    pub(crate) fn new(
        config: Arc<Configuration>,
        ms: &Arc<MappedStatement>,
        statement: Box<dyn PreparedStatement>,
        cursor: Box<dyn ResultCursor>,
        limit: usize,
    ) -> Result<SessionCursor<'a>> {
        let map_id = ms.result_map_ids.first().ok_or_else(|| {
            Error::ResultMaterialization {
                statement: ms.id.clone(),
                reason: "statement declares no result shape".to_string(),
            }
        })?;
        let result_map =
            config
                .result_map(map_id)
                .ok_or_else(|| Error::ResultMaterialization {
                    statement: ms.id.clone(),
                    reason: format!("unknown result map '{map_id}'"),
                })?;
        let reader = FlatRowReader::new(&config, cursor.as_ref(), result_map, &ms.id)?;
        Ok(SessionCursor {
            _session: PhantomData,
            config,
            statement,
            cursor,
            reader,
            remaining: limit,
            exhausted: false,
        })
    }
}

impl Iterator for SessionCursor<'_> {
    type Item = Result<Value>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.exhausted || self.remaining == 0 {
            return None;
        }
        match self.cursor.next() {
            Ok(true) => {
                self.remaining -= 1;
                Some(self.reader.read(&self.config, self.cursor.as_mut()))
            }
            Ok(false) => {
                self.exhausted = true;
                None
            }
            Err(e) => {
                self.exhausted = true;
                Some(Err(Error::from(e)))
            }
        }
    }
}

impl Drop for SessionCursor<'_> {
    fn drop(&mut self) {
        self.cursor.close();
        self.statement.close();
    }
}
