use num_derive::FromPrimitive;

/// Driver-side type codes for parameter binding and column metadata.
///
/// The numeric values follow the usual SQL type-code convention so that a
/// driver reporting raw codes can be mapped with `from_i32`.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Hash, FromPrimitive)]
#[repr(i32)]
pub enum DriverType {
    Bit = -7,
    TinyInt = -6,
    SmallInt = 5,
    Integer = 4,
    BigInt = -5,
    Float = 6,
    Real = 7,
    Double = 8,
    Numeric = 2,
    Decimal = 3,
    Char = 1,
    Varchar = 12,
    LongVarchar = -1,
    Date = 91,
    Time = 92,
    Timestamp = 93,
    Binary = -2,
    VarBinary = -3,
    LongVarBinary = -4,
    Null = 0,
    Other = 1111,
    Blob = 2004,
    Clob = 2005,
    Boolean = 16,
    Cursor = -10,
    Array = 2003,
    Struct = 2002,
    Undefined = i32::MIN + 1000,
    /// Reported by drivers for columns they cannot classify.
    Unsupported = i32::MIN + 1001,
}

impl DriverType {
    /// Parse the uppercase name used by mapping markup (e.g. `jdbcType=NUMERIC`).
    pub fn from_name(name: &str) -> Option<DriverType> {
        use DriverType::*;
        Some(match name.to_uppercase().as_str() {
            "BIT" => Bit,
            "TINYINT" => TinyInt,
            "SMALLINT" => SmallInt,
            "INTEGER" | "INT" => Integer,
            "BIGINT" => BigInt,
            "FLOAT" => Float,
            "REAL" => Real,
            "DOUBLE" => Double,
            "NUMERIC" => Numeric,
            "DECIMAL" => Decimal,
            "CHAR" => Char,
            "VARCHAR" => Varchar,
            "LONGVARCHAR" => LongVarchar,
            "DATE" => Date,
            "TIME" => Time,
            "TIMESTAMP" => Timestamp,
            "BINARY" => Binary,
            "VARBINARY" => VarBinary,
            "LONGVARBINARY" => LongVarBinary,
            "NULL" => Null,
            "OTHER" => Other,
            "BLOB" => Blob,
            "CLOB" => Clob,
            "BOOLEAN" => Boolean,
            "CURSOR" => Cursor,
            "ARRAY" => Array,
            "STRUCT" => Struct,
            "UNDEFINED" => Undefined,
            _ => return None,
        })
    }

    pub fn is_numeric(&self) -> bool {
        use DriverType::*;
        matches!(
            self,
            TinyInt | SmallInt | Integer | BigInt | Float | Real | Double | Numeric | Decimal
        )
    }
}

/// Transaction isolation levels a connection may be configured with.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum IsolationLevel {
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl IsolationLevel {
    pub fn from_name(name: &str) -> Option<IsolationLevel> {
        Some(match name.to_uppercase().as_str() {
            "READ_UNCOMMITTED" => IsolationLevel::ReadUncommitted,
            "READ_COMMITTED" => IsolationLevel::ReadCommitted,
            "REPEATABLE_READ" => IsolationLevel::RepeatableRead,
            "SERIALIZABLE" => IsolationLevel::Serializable,
            _ => return None,
        })
    }
}
