mod err;
pub use err::{Error, Result};
mod types;
pub use types::{DriverType, IsolationLevel};
pub mod manager;
pub mod testing;

pub use serde_json::Value;

use std::collections::HashMap;

/// Metadata for one column of a result cursor.
#[derive(Clone, Debug)]
pub struct ColumnMeta {
    /// The underlying column name.
    pub name: String,
    /// The column label (alias); equal to `name` when the statement did not
    /// alias the column.
    pub label: String,
    pub driver_type: DriverType,
    /// Driver-reported class of the values in this column.
    pub class_name: String,
}

impl ColumnMeta {
    pub fn new(label: &str, driver_type: DriverType, class_name: &str) -> ColumnMeta {
        ColumnMeta {
            name: label.to_string(),
            label: label.to_string(),
            driver_type,
            class_name: class_name.to_string(),
        }
    }
}

/// Per-statement options supplied at prepare time.
#[derive(Clone, Copy, Debug, Default)]
pub struct StatementConfig {
    /// Ask the driver to make generated keys retrievable after execute.
    pub return_generated_keys: bool,
    /// Prepare a callable (stored-procedure) statement.
    pub callable: bool,
    /// Ask for a cursor that supports absolute positioning.
    pub scrollable: bool,
}

/// A connector registered with the driver manager. Accepts urls it
/// understands and opens real connections for them.
pub trait Driver: Send + Sync {
    fn accepts(&self, url: &str) -> bool;
    fn connect(
        &self,
        url: &str,
        properties: &HashMap<String, String>,
    ) -> Result<Box<dyn Connection>>;
}

/// A factory for connections. The framework's unpooled and pooled
/// datasources both implement this.
pub trait DataSource: Send + Sync {
    fn connection(&self) -> Result<Box<dyn Connection>>;
    fn url(&self) -> &str;
    fn username(&self) -> &str;
    fn password(&self) -> &str;
}

/// One live driver connection. Connections are owned by a single caller at a
/// time and are not required to be thread-safe; they are `Send` so a pool may
/// hand them across threads.
pub trait Connection: Send {
    fn prepare(&mut self, sql: &str, config: &StatementConfig)
        -> Result<Box<dyn PreparedStatement>>;
    fn auto_commit(&mut self) -> Result<bool>;
    fn set_auto_commit(&mut self, auto_commit: bool) -> Result<()>;
    fn set_isolation(&mut self, level: IsolationLevel) -> Result<()>;
    fn commit(&mut self) -> Result<()>;
    fn rollback(&mut self) -> Result<()>;
    fn is_closed(&self) -> bool;
    /// Name of the database product this connection talks to, used by the
    /// databaseId provider.
    fn product_name(&mut self) -> Result<String>;
    fn close(&mut self) -> Result<()>;
}

/// A prepared driver statement. Parameter and column indices are 1-based.
pub trait PreparedStatement {
    fn set_fetch_size(&mut self, rows: u32) -> Result<()>;
    fn set_query_timeout(&mut self, seconds: u64) -> Result<()>;
    fn bind(&mut self, index: usize, value: Value, driver_type: DriverType) -> Result<()>;
    /// Register an OUT parameter of a callable statement.
    fn register_out(&mut self, index: usize, driver_type: DriverType) -> Result<()>;
    /// Read back an OUT parameter after execute.
    fn take_out(&mut self, index: usize) -> Result<Value>;
    fn execute_query(&mut self) -> Result<Box<dyn ResultCursor>>;
    fn execute_update(&mut self) -> Result<u64>;
    /// Queue the currently bound parameters as one batch entry.
    fn add_batch(&mut self) -> Result<()>;
    fn execute_batch(&mut self) -> Result<Vec<u64>>;
    /// Cursor over keys the database generated for the last execute. Only
    /// meaningful when the statement was prepared with
    /// `return_generated_keys`.
    fn generated_keys(&mut self) -> Result<Box<dyn ResultCursor>>;
    /// Advance to the next result set of a multi-result statement.
    fn more_results(&mut self) -> Result<Option<Box<dyn ResultCursor>>>;
    fn close(&mut self);
}

/// A forward (optionally scrollable) cursor over one result set.
pub trait ResultCursor {
    fn metadata(&self) -> &[ColumnMeta];
    /// Advance to the next row. Returns false when the cursor is exhausted.
    fn next(&mut self) -> Result<bool>;
    /// Read a cell of the current row by 1-based column index.
    fn get(&self, index: usize) -> Result<Value>;
    /// Resolve a column label to its 1-based index, case-insensitively.
    fn column_index(&self, label: &str) -> Option<usize> {
        self.metadata()
            .iter()
            .position(|c| c.label.eq_ignore_ascii_case(label))
            .map(|i| i + 1)
    }
    fn supports_absolute(&self) -> bool {
        false
    }
    /// Position on the 1-based row number. Returns false when the result set
    /// has fewer rows.
    fn absolute(&mut self, _row: usize) -> Result<bool> {
        Err(Error::Unsupported("absolute positioning"))
    }
    fn close(&mut self) {}
}
