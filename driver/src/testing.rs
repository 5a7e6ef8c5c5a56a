//! An in-memory scripted driver.
//!
//! Tests install a [`Script`] under a `mem:` url, declare the result sets,
//! update counts and generated keys each SQL text produces, and assert
//! afterwards on the exact statements and parameters the framework sent.
//! Executing a query the script does not know is an error, the same way a
//! real driver rejects SQL against a missing table.

use crate::{
    manager, ColumnMeta, Connection, Driver, DriverType, Error, IsolationLevel, PreparedStatement,
    Result, ResultCursor, StatementConfig,
};
use lazy_static::lazy_static;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, Once};

lazy_static! {
    static ref SCENARIOS: Mutex<HashMap<String, Script>> = Mutex::new(HashMap::new());
}

static REGISTER: Once = Once::new();

/// Install a fresh scenario under the given url and make sure the in-memory
/// driver is registered with the driver manager. Any prior scenario for the
/// url is discarded.
pub fn install(url: &str) -> Script {
    REGISTER.call_once(|| manager::register_driver(Arc::new(MemDriver)));
    let script = Script::default();
    SCENARIOS
        .lock()
        .unwrap()
        .insert(url.to_string(), script.clone());
    script
}

/// One SQL statement recorded by the scripted driver, with its bound
/// parameters in positional order.
#[derive(Clone, Debug, PartialEq)]
pub struct Execution {
    pub sql: String,
    pub parameters: Vec<Value>,
}

#[derive(Clone, Default)]
struct ResultSpec {
    columns: Vec<ColumnMeta>,
    rows: Vec<Vec<Value>>,
}

#[derive(Default)]
struct ScriptInner {
    results: HashMap<String, Vec<ResultSpec>>,
    update_counts: HashMap<String, u64>,
    keys: HashMap<String, ResultSpec>,
    outs: HashMap<String, HashMap<usize, Value>>,
    failures: HashMap<String, String>,
    executions: Vec<Execution>,
    open_connections: usize,
    total_connections: usize,
    commits: usize,
    rollbacks: usize,
}

/// Handle on a scripted scenario, shared with every connection the driver
/// opens for its url.
#[derive(Clone, Default)]
pub struct Script {
    inner: Arc<Mutex<ScriptInner>>,
}

impl Script {
    /// Start scripting the behavior of one SQL text.
    pub fn when(&self, sql: &str) -> When {
        When {
            script: self.clone(),
            sql: sql.to_string(),
        }
    }

    pub fn executions(&self) -> Vec<Execution> {
        self.inner.lock().unwrap().executions.clone()
    }

    pub fn execution_count(&self, sql: &str) -> usize {
        self.inner
            .lock()
            .unwrap()
            .executions
            .iter()
            .filter(|e| e.sql == sql)
            .count()
    }

    pub fn clear_executions(&self) {
        self.inner.lock().unwrap().executions.clear();
    }

    pub fn open_connections(&self) -> usize {
        self.inner.lock().unwrap().open_connections
    }

    pub fn total_connections(&self) -> usize {
        self.inner.lock().unwrap().total_connections
    }

    pub fn commits(&self) -> usize {
        self.inner.lock().unwrap().commits
    }

    pub fn rollbacks(&self) -> usize {
        self.inner.lock().unwrap().rollbacks
    }
}

/// Builder for the scripted behavior of one SQL text.
pub struct When {
    script: Script,
    sql: String,
}

impl When {
    /// Append a result set. Call more than once to script a multi-result
    /// statement.
    pub fn returns(self, columns: &[(&str, DriverType)], rows: Vec<Vec<Value>>) -> When {
        let spec = ResultSpec {
            columns: columns.iter().map(|(n, t)| meta(n, *t)).collect(),
            rows,
        };
        self.script
            .inner
            .lock()
            .unwrap()
            .results
            .entry(self.sql.clone())
            .or_default()
            .push(spec);
        self
    }

    pub fn update_count(self, count: u64) -> When {
        self.script
            .inner
            .lock()
            .unwrap()
            .update_counts
            .insert(self.sql.clone(), count);
        self
    }

    pub fn generated_keys(self, columns: &[(&str, DriverType)], rows: Vec<Vec<Value>>) -> When {
        let spec = ResultSpec {
            columns: columns.iter().map(|(n, t)| meta(n, *t)).collect(),
            rows,
        };
        self.script
            .inner
            .lock()
            .unwrap()
            .keys
            .insert(self.sql.clone(), spec);
        self
    }

    /// Script an OUT parameter value produced by a callable statement.
    pub fn out_value(self, index: usize, value: Value) -> When {
        self.script
            .inner
            .lock()
            .unwrap()
            .outs
            .entry(self.sql.clone())
            .or_default()
            .insert(index, value);
        self
    }

    pub fn fails(self, message: &str) -> When {
        self.script
            .inner
            .lock()
            .unwrap()
            .failures
            .insert(self.sql.clone(), message.to_string());
        self
    }
}

fn meta(label: &str, driver_type: DriverType) -> ColumnMeta {
    let class_name = match driver_type {
        DriverType::TinyInt
        | DriverType::SmallInt
        | DriverType::Integer
        | DriverType::BigInt => "i64",
        DriverType::Float | DriverType::Real | DriverType::Double => "f64",
        DriverType::Numeric | DriverType::Decimal => "f64",
        DriverType::Boolean | DriverType::Bit => "bool",
        DriverType::Binary | DriverType::VarBinary | DriverType::LongVarBinary
        | DriverType::Blob => "bytes",
        _ => "string",
    };
    ColumnMeta::new(label, driver_type, class_name)
}

struct MemDriver;

impl Driver for MemDriver {
    fn accepts(&self, url: &str) -> bool {
        url.starts_with("mem:")
    }

    fn connect(
        &self,
        url: &str,
        _properties: &HashMap<String, String>,
    ) -> Result<Box<dyn Connection>> {
        let script = SCENARIOS
            .lock()
            .unwrap()
            .get(url)
            .cloned()
            .ok_or_else(|| Error::General(format!("no scripted scenario installed for {url}")))?;
        {
            let mut inner = script.inner.lock().unwrap();
            inner.open_connections += 1;
            inner.total_connections += 1;
        }
        Ok(Box::new(MemConnection {
            script,
            closed: false,
            auto_commit: true,
        }))
    }
}

struct MemConnection {
    script: Script,
    closed: bool,
    auto_commit: bool,
}

impl MemConnection {
    fn check_open(&self) -> Result<()> {
        if self.closed {
            return Err(Error::ConnectionClosed);
        }
        Ok(())
    }
}

impl Connection for MemConnection {
    fn prepare(
        &mut self,
        sql: &str,
        config: &StatementConfig,
    ) -> Result<Box<dyn PreparedStatement>> {
        self.check_open()?;
        Ok(Box::new(MemStatement {
            script: self.script.clone(),
            sql: sql.to_string(),
            config: *config,
            bound: BTreeMap::new(),
            batch: Vec::new(),
            pending_results: Vec::new(),
        }))
    }

    fn auto_commit(&mut self) -> Result<bool> {
        self.check_open()?;
        Ok(self.auto_commit)
    }

    fn set_auto_commit(&mut self, auto_commit: bool) -> Result<()> {
        self.check_open()?;
        self.auto_commit = auto_commit;
        Ok(())
    }

    fn set_isolation(&mut self, _level: IsolationLevel) -> Result<()> {
        self.check_open()
    }

    fn commit(&mut self) -> Result<()> {
        self.check_open()?;
        self.script.inner.lock().unwrap().commits += 1;
        Ok(())
    }

    fn rollback(&mut self) -> Result<()> {
        self.check_open()?;
        self.script.inner.lock().unwrap().rollbacks += 1;
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed
    }

    fn product_name(&mut self) -> Result<String> {
        self.check_open()?;
        Ok("mem".to_string())
    }

    fn close(&mut self) -> Result<()> {
        if !self.closed {
            self.closed = true;
            self.script.inner.lock().unwrap().open_connections -= 1;
        }
        Ok(())
    }
}

impl Drop for MemConnection {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

struct MemStatement {
    script: Script,
    sql: String,
    config: StatementConfig,
    bound: BTreeMap<usize, Value>,
    batch: Vec<Vec<Value>>,
    pending_results: Vec<ResultSpec>,
}

impl MemStatement {
    fn record(&self, parameters: Vec<Value>) {
        self.script
            .inner
            .lock()
            .unwrap()
            .executions
            .push(Execution {
                sql: self.sql.clone(),
                parameters,
            });
    }

    fn check_failure(&self) -> Result<()> {
        if let Some(message) = self
            .script
            .inner
            .lock()
            .unwrap()
            .failures
            .get(&self.sql)
        {
            return Err(Error::Statement(message.clone()));
        }
        Ok(())
    }

    fn ordered_params(&mut self) -> Vec<Value> {
        std::mem::take(&mut self.bound).into_values().collect()
    }
}

impl PreparedStatement for MemStatement {
    fn set_fetch_size(&mut self, _rows: u32) -> Result<()> {
        Ok(())
    }

    fn set_query_timeout(&mut self, _seconds: u64) -> Result<()> {
        Ok(())
    }

    fn bind(&mut self, index: usize, value: Value, _driver_type: DriverType) -> Result<()> {
        self.bound.insert(index, value);
        Ok(())
    }

    fn register_out(&mut self, index: usize, _driver_type: DriverType) -> Result<()> {
        if !self.config.callable {
            return Err(Error::Unsupported("out parameters on a plain statement"));
        }
        self.bound.insert(index, Value::Null);
        Ok(())
    }

    fn take_out(&mut self, index: usize) -> Result<Value> {
        let inner = self.script.inner.lock().unwrap();
        inner
            .outs
            .get(&self.sql)
            .and_then(|m| m.get(&index))
            .cloned()
            .ok_or(Error::UnregisteredOutParameter(index))
    }

    fn execute_query(&mut self) -> Result<Box<dyn ResultCursor>> {
        self.check_failure()?;
        let parameters = self.ordered_params();
        self.record(parameters);
        let mut specs = self
            .script
            .inner
            .lock()
            .unwrap()
            .results
            .get(&self.sql)
            .cloned()
            .ok_or_else(|| Error::Statement(format!("no scripted result for: {}", self.sql)))?;
        let first = specs.remove(0);
        self.pending_results = specs;
        Ok(Box::new(MemCursor::new(first)))
    }

    fn execute_update(&mut self) -> Result<u64> {
        self.check_failure()?;
        let parameters = self.ordered_params();
        self.record(parameters);
        Ok(self
            .script
            .inner
            .lock()
            .unwrap()
            .update_counts
            .get(&self.sql)
            .copied()
            .unwrap_or(1))
    }

    fn add_batch(&mut self) -> Result<()> {
        let parameters = self.ordered_params();
        self.batch.push(parameters);
        Ok(())
    }

    fn execute_batch(&mut self) -> Result<Vec<u64>> {
        self.check_failure()?;
        let count = self
            .script
            .inner
            .lock()
            .unwrap()
            .update_counts
            .get(&self.sql)
            .copied()
            .unwrap_or(1);
        let mut counts = Vec::with_capacity(self.batch.len());
        for parameters in std::mem::take(&mut self.batch) {
            self.record(parameters);
            counts.push(count);
        }
        Ok(counts)
    }

    fn generated_keys(&mut self) -> Result<Box<dyn ResultCursor>> {
        let spec = self
            .script
            .inner
            .lock()
            .unwrap()
            .keys
            .get(&self.sql)
            .cloned()
            .unwrap_or_default();
        Ok(Box::new(MemCursor::new(spec)))
    }

    fn more_results(&mut self) -> Result<Option<Box<dyn ResultCursor>>> {
        if self.pending_results.is_empty() {
            return Ok(None);
        }
        let spec = self.pending_results.remove(0);
        Ok(Some(Box::new(MemCursor::new(spec))))
    }

    fn close(&mut self) {}
}

struct MemCursor {
    columns: Vec<ColumnMeta>,
    rows: Vec<Vec<Value>>,
    // Index of the current row; None while positioned before the first row.
    position: Option<usize>,
}

impl MemCursor {
    fn new(spec: ResultSpec) -> MemCursor {
        MemCursor {
            columns: spec.columns,
            rows: spec.rows,
            position: None,
        }
    }
}

impl ResultCursor for MemCursor {
    fn metadata(&self) -> &[ColumnMeta] {
        &self.columns
    }

    fn next(&mut self) -> Result<bool> {
        let next = self.position.map_or(0, |p| p + 1);
        if next < self.rows.len() {
            self.position = Some(next);
            Ok(true)
        } else {
            Ok(false)
        }
    }

    fn get(&self, index: usize) -> Result<Value> {
        let row = self
            .position
            .and_then(|p| self.rows.get(p))
            .ok_or(Error::InvalidCursorState)?;
        row.get(index - 1)
            .cloned()
            .ok_or(Error::ColIndexOutOfBounds(index))
    }

    fn supports_absolute(&self) -> bool {
        true
    }

    fn absolute(&mut self, row: usize) -> Result<bool> {
        if row == 0 {
            self.position = None;
            return Ok(true);
        }
        if row <= self.rows.len() {
            self.position = Some(row - 1);
            Ok(true)
        } else {
            Ok(false)
        }
    }
}

#[cfg(test)]
mod unit {
    use super::*;
    use serde_json::json;

    #[test]
    fn scripted_query_records_execution() {
        let script = install("mem://unit-script");
        script
            .when("SELECT id FROM t WHERE id = ?")
            .returns(&[("id", DriverType::Integer)], vec![vec![json!(7)]]);

        let mut conn =
            manager::connect("mem://unit-script", &HashMap::new()).expect("connect mem driver");
        let mut stmt = conn
            .prepare("SELECT id FROM t WHERE id = ?", &StatementConfig::default())
            .unwrap();
        stmt.bind(1, json!(7), DriverType::Integer).unwrap();
        let mut cursor = stmt.execute_query().unwrap();
        assert!(cursor.next().unwrap());
        assert_eq!(cursor.get(1).unwrap(), json!(7));
        assert!(!cursor.next().unwrap());

        assert_eq!(
            script.executions(),
            vec![Execution {
                sql: "SELECT id FROM t WHERE id = ?".to_string(),
                parameters: vec![json!(7)],
            }]
        );
    }

    #[test]
    fn unscripted_query_is_rejected() {
        let _ = install("mem://unit-unscripted");
        let mut conn = manager::connect("mem://unit-unscripted", &HashMap::new()).unwrap();
        let mut stmt = conn
            .prepare("SELECT nope", &StatementConfig::default())
            .unwrap();
        assert!(stmt.execute_query().is_err());
    }

    #[test]
    fn connection_counters() {
        let script = install("mem://unit-counters");
        let mut a = manager::connect("mem://unit-counters", &HashMap::new()).unwrap();
        let b = manager::connect("mem://unit-counters", &HashMap::new()).unwrap();
        assert_eq!(script.open_connections(), 2);
        assert_eq!(script.total_connections(), 2);
        a.close().unwrap();
        drop(b);
        assert_eq!(script.open_connections(), 0);
        assert_eq!(script.total_connections(), 2);
    }
}
