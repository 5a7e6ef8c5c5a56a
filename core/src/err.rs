use itertools::Itertools;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("malformed mapping source{}: {message}", resource_suffix(.resource))]
    ConfigMalformed {
        resource: Option<String>,
        message: String,
    },
    #[error("mapping build ended with unresolved references: {}", .0.join(", "))]
    ConfigIncomplete(Vec<String>),
    #[error("configuration setting is not recognized: {0}")]
    UnknownSetting(String),
    #[error("property '{property}' of type '{type_name}' is ambiguous")]
    AmbiguousProperty { type_name: String, property: String },
    #[error("type '{type_name}' does not expose property '{property}'")]
    UnknownProperty { type_name: String, property: String },
    #[error("could not convert value for '{context}': {reason}")]
    ConversionFailed { context: String, reason: String },
    #[error("no statement registered under id '{0}'")]
    StatementNotFound(String),
    #[error("driver rejected transaction configuration")]
    TransactionConfig(#[source] driver::Error),
    #[error("connection pool exhausted: {0}")]
    PoolExhausted(String),
    #[error("timed out waiting for cache lock on key {0}")]
    CacheLockTimeout(String),
    #[error("cache value for '{cache}' is not serializable: {reason}")]
    CacheSerialization { cache: String, reason: String },
    #[error("statement '{statement}' failed [sql: {sql}]")]
    ExecutionFailed {
        statement: String,
        sql: String,
        #[source]
        source: driver::Error,
    },
    #[error("could not materialize result for '{statement}': {reason}")]
    ResultMaterialization { statement: String, reason: String },
    #[error(transparent)]
    Driver(driver::Error),
}

impl From<driver::Error> for Error {
    fn from(e: driver::Error) -> Error {
        match e {
            // a pooled datasource surfaces exhaustion through the driver
            // contract; keep the kind
            driver::Error::PoolExhausted(message) => Error::PoolExhausted(message),
            other => Error::Driver(other),
        }
    }
}

fn resource_suffix(resource: &Option<String>) -> String {
    match resource {
        Some(r) => format!(" ({r})"),
        None => String::new(),
    }
}

impl Error {
    pub fn malformed(message: impl Into<String>) -> Error {
        Error::ConfigMalformed {
            resource: None,
            message: message.into(),
        }
    }

    pub fn malformed_in(resource: &str, message: impl Into<String>) -> Error {
        Error::ConfigMalformed {
            resource: Some(resource.to_string()),
            message: message.into(),
        }
    }

    /// Wrap a driver failure with the statement id and an excerpt of the SQL
    /// that was being executed.
    pub fn execution(statement: &str, sql: &str, source: driver::Error) -> Error {
        Error::ExecutionFailed {
            statement: statement.to_string(),
            sql: excerpt(sql),
            source,
        }
    }
}

// Keeps error messages readable when statements carry long SQL bodies.
fn excerpt(sql: &str) -> String {
    let flat = sql.split_whitespace().join(" ");
    if flat.chars().count() > 120 {
        let cut: String = flat.chars().take(120).collect();
        format!("{cut}...")
    } else {
        flat
    }
}

#[cfg(test)]
mod unit {
    use super::*;

    #[test]
    fn execution_error_carries_statement_and_sql() {
        let err = Error::execution(
            "users.findById",
            "SELECT id, name\n  FROM users\n  WHERE id = ?",
            driver::Error::Statement("boom".to_string()),
        );
        let text = err.to_string();
        assert!(text.contains("users.findById"));
        assert!(text.contains("SELECT id, name FROM users WHERE id = ?"));
    }

    #[test]
    fn long_sql_is_excerpted() {
        let sql = "SELECT ".to_string() + &"c, ".repeat(100);
        let err = Error::execution("x.y", &sql, driver::Error::Statement("e".to_string()));
        assert!(err.to_string().contains("..."));
    }
}
