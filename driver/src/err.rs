use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("no registered driver accepts url: {0}")]
    NoSuitableDriver(String),
    #[error("connection is closed")]
    ConnectionClosed,
    #[error("invalid column index: {0}")]
    ColIndexOutOfBounds(usize),
    #[error("no column named: {0}")]
    UnknownColumn(String),
    #[error("invalid cursor state: next must be called before reading")]
    InvalidCursorState,
    #[error("parameter index {0} was not bound")]
    UnboundParameter(usize),
    #[error("no out parameter registered at index {0}")]
    UnregisteredOutParameter(usize),
    #[error("statement failed: {0}")]
    Statement(String),
    #[error("connection pool exhausted: {0}")]
    PoolExhausted(String),
    #[error("driver does not support {0}")]
    Unsupported(&'static str),
    #[error("{0}")]
    General(String),
}
