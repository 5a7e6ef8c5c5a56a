//! The two-axis type conversion registry.
//!
//! Converters are looked up by `(application type, driver type)`. Within one
//! application type the explicit driver type wins, then the `None` default,
//! then a unique-converter fallback across whatever is registered. A miss on
//! the application axis is memoized with a sentinel empty table so repeated
//! lookups stay cheap, and falls through to the per-driver-type table. The
//! unknown converter serves `object`/`map` and columns whose driver type is
//! reported unsupported.

mod converters;
pub use converters::{
    BooleanConverter, BytesConverter, DateConverter, DoubleConverter, IntegerConverter,
    StringConverter, TimeConverter, TimestampConverter, UnknownConverter,
};

use crate::Result;
use driver::{DriverType, PreparedStatement, ResultCursor, Value};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

/// Binds parameter values and decodes row columns for one application type.
pub trait TypeConverter: Send + Sync {
    fn bind(
        &self,
        stmt: &mut dyn PreparedStatement,
        index: usize,
        value: &Value,
        driver_type: DriverType,
    ) -> Result<()>;

    fn decode_by_index(&self, cursor: &dyn ResultCursor, index: usize) -> Result<Value>;

    fn decode_by_name(&self, cursor: &dyn ResultCursor, column: &str) -> Result<Value> {
        match cursor.column_index(column) {
            Some(index) => self.decode_by_index(cursor, index),
            None => Ok(Value::Null),
        }
    }

    /// Decode a callable-statement OUT parameter.
    fn decode_out(&self, stmt: &mut dyn PreparedStatement, index: usize) -> Result<Value>;
}

type ConverterTable = HashMap<Option<DriverType>, Arc<dyn TypeConverter>>;

pub struct TypeConverterRegistry {
    by_app_type: RwLock<HashMap<String, ConverterTable>>,
    by_driver_type: HashMap<DriverType, Arc<dyn TypeConverter>>,
    named: RwLock<HashMap<String, Arc<dyn TypeConverter>>>,
    enums: RwLock<HashSet<String>>,
    default_enum: Arc<dyn TypeConverter>,
    unknown: Arc<dyn TypeConverter>,
}

impl Default for TypeConverterRegistry {
    fn default() -> TypeConverterRegistry {
        TypeConverterRegistry::new()
    }
}

impl TypeConverterRegistry {
    pub fn new() -> TypeConverterRegistry {
        let string: Arc<dyn TypeConverter> = Arc::new(StringConverter);
        let integer: Arc<dyn TypeConverter> = Arc::new(IntegerConverter);
        let double: Arc<dyn TypeConverter> = Arc::new(DoubleConverter);
        let boolean: Arc<dyn TypeConverter> = Arc::new(BooleanConverter);
        let bytes: Arc<dyn TypeConverter> = Arc::new(BytesConverter);
        let date: Arc<dyn TypeConverter> = Arc::new(DateConverter);
        let time: Arc<dyn TypeConverter> = Arc::new(TimeConverter);
        let timestamp: Arc<dyn TypeConverter> = Arc::new(TimestampConverter);
        let unknown: Arc<dyn TypeConverter> = Arc::new(UnknownConverter);

        let registry = TypeConverterRegistry {
            by_app_type: RwLock::new(HashMap::new()),
            by_driver_type: HashMap::from([
                (DriverType::Char, string.clone()),
                (DriverType::Varchar, string.clone()),
                (DriverType::LongVarchar, string.clone()),
                (DriverType::Clob, string.clone()),
                (DriverType::TinyInt, integer.clone()),
                (DriverType::SmallInt, integer.clone()),
                (DriverType::Integer, integer.clone()),
                (DriverType::BigInt, integer.clone()),
                (DriverType::Float, double.clone()),
                (DriverType::Real, double.clone()),
                (DriverType::Double, double.clone()),
                (DriverType::Numeric, double.clone()),
                (DriverType::Decimal, double.clone()),
                (DriverType::Bit, boolean.clone()),
                (DriverType::Boolean, boolean.clone()),
                (DriverType::Binary, bytes.clone()),
                (DriverType::VarBinary, bytes.clone()),
                (DriverType::LongVarBinary, bytes.clone()),
                (DriverType::Blob, bytes.clone()),
                (DriverType::Date, date.clone()),
                (DriverType::Time, time.clone()),
                (DriverType::Timestamp, timestamp.clone()),
            ]),
            named: RwLock::new(HashMap::new()),
            enums: RwLock::new(HashSet::new()),
            default_enum: string.clone(),
            unknown,
        };

        let string_types = [
            DriverType::Char,
            DriverType::Varchar,
            DriverType::LongVarchar,
            DriverType::Clob,
        ];
        let integer_types = [
            DriverType::TinyInt,
            DriverType::SmallInt,
            DriverType::Integer,
            DriverType::BigInt,
            DriverType::Numeric,
        ];
        let float_types = [
            DriverType::Float,
            DriverType::Real,
            DriverType::Double,
            DriverType::Numeric,
            DriverType::Decimal,
        ];
        let binary_types = [
            DriverType::Binary,
            DriverType::VarBinary,
            DriverType::LongVarBinary,
            DriverType::Blob,
        ];

        registry.register_family("string", &string, &string_types);
        for name in ["int", "integer", "long", "short", "byte"] {
            registry.register_family(name, &integer, &integer_types);
        }
        for name in ["float", "double", "decimal"] {
            registry.register_family(name, &double, &float_types);
        }
        registry.register_family(
            "boolean",
            &boolean,
            &[DriverType::Bit, DriverType::Boolean],
        );
        registry.register_family("bytes", &bytes, &binary_types);
        registry.register_family("date", &date, &[DriverType::Date]);
        registry.register_family("time", &time, &[DriverType::Time]);
        registry.register_family("timestamp", &timestamp, &[DriverType::Timestamp]);
        let unknown = registry.unknown.clone();
        registry.register("object", None, unknown.clone());
        registry.register("map", None, unknown.clone());
        registry.register("list", None, unknown);
        registry
    }

    fn register_family(
        &self,
        app_type: &str,
        converter: &Arc<dyn TypeConverter>,
        driver_types: &[DriverType],
    ) {
        self.register(app_type, None, converter.clone());
        for dt in driver_types {
            self.register(app_type, Some(*dt), converter.clone());
        }
    }

    pub fn register(
        &self,
        app_type: &str,
        driver_type: Option<DriverType>,
        converter: Arc<dyn TypeConverter>,
    ) {
        self.by_app_type
            .write()
            .unwrap()
            .entry(app_type.to_string())
            .or_default()
            .insert(driver_type, converter);
    }

    /// Register a converter under a name so mapping markup can reference it
    /// with `typeHandler=`.
    pub fn register_named(&self, name: &str, converter: Arc<dyn TypeConverter>) {
        self.named
            .write()
            .unwrap()
            .insert(name.to_string(), converter);
    }

    pub fn named(&self, name: &str) -> Option<Arc<dyn TypeConverter>> {
        self.named.read().unwrap().get(name).cloned()
    }

    /// Mark an application type name as an enum; misses on it resolve to the
    /// configured default enum converter.
    pub fn register_enum(&self, app_type: &str) {
        self.enums.write().unwrap().insert(app_type.to_string());
    }

    pub fn has_converter_for(&self, app_type: &str) -> bool {
        self.by_app_type
            .read()
            .unwrap()
            .get(app_type)
            .is_some_and(|t| !t.is_empty())
    }

    pub fn unknown_converter(&self) -> Arc<dyn TypeConverter> {
        self.unknown.clone()
    }

    /// Resolve `(application type, driver type)` to a converter.
    pub fn resolve(
        &self,
        app_type: Option<&str>,
        driver_type: Option<DriverType>,
    ) -> Option<Arc<dyn TypeConverter>> {
        if driver_type == Some(DriverType::Unsupported) {
            return Some(self.unknown.clone());
        }
        let app_type = match app_type {
            Some(t) => t,
            None => return driver_type.and_then(|dt| self.by_driver_type.get(&dt).cloned()),
        };
        if app_type == "object" {
            return Some(self.unknown.clone());
        }

        if let Some(table) = self.by_app_type.read().unwrap().get(app_type) {
            if !table.is_empty() {
                return pick(table, driver_type);
            }
            // sentinel empty table: a prior lookup already missed
            return driver_type.and_then(|dt| self.by_driver_type.get(&dt).cloned());
        }

        // First miss for this application type. Enums fall back to the
        // default enum converter and are registered on demand; anything else
        // is memoized as absent.
        if self.enums.read().unwrap().contains(app_type) {
            self.register(app_type, None, self.default_enum.clone());
            return Some(self.default_enum.clone());
        }
        self.by_app_type
            .write()
            .unwrap()
            .entry(app_type.to_string())
            .or_default();
        driver_type.and_then(|dt| self.by_driver_type.get(&dt).cloned())
    }

    /// Resolve like [`TypeConverterRegistry::resolve`] but never fail; the
    /// unknown converter is the last resort.
    pub fn resolve_or_unknown(
        &self,
        app_type: Option<&str>,
        driver_type: Option<DriverType>,
    ) -> Arc<dyn TypeConverter> {
        self.resolve(app_type, driver_type)
            .unwrap_or_else(|| self.unknown.clone())
    }
}

fn pick(table: &ConverterTable, driver_type: Option<DriverType>) -> Option<Arc<dyn TypeConverter>> {
    if let Some(found) = table.get(&driver_type) {
        return Some(found.clone());
    }
    if let Some(found) = table.get(&None) {
        return Some(found.clone());
    }
    // unique-converter fallback: when every registered alternative is the
    // same converter, that converter serves any driver type
    let mut unique: Option<&Arc<dyn TypeConverter>> = None;
    for candidate in table.values() {
        match unique {
            None => unique = Some(candidate),
            Some(existing) if Arc::ptr_eq(existing, candidate) => {}
            Some(_) => return None,
        }
    }
    unique.cloned()
}

#[cfg(test)]
mod unit {
    use super::*;

    #[test]
    fn explicit_driver_type_wins() {
        let registry = TypeConverterRegistry::new();
        assert!(registry
            .resolve(Some("string"), Some(DriverType::Varchar))
            .is_some());
    }

    #[test]
    fn none_default_serves_unlisted_driver_types() {
        let registry = TypeConverterRegistry::new();
        // no string converter is registered under DATE, the None default
        // must serve it
        assert!(registry
            .resolve(Some("string"), Some(DriverType::Date))
            .is_some());
    }

    #[test]
    fn absence_is_memoized_and_falls_back_to_driver_axis() {
        let registry = TypeConverterRegistry::new();
        assert!(registry.resolve(Some("Widget"), None).is_none());
        // second lookup hits the sentinel
        assert!(registry.resolve(Some("Widget"), None).is_none());
        assert!(registry
            .resolve(Some("Widget"), Some(DriverType::Varchar))
            .is_some());
    }

    #[test]
    fn enums_get_default_converter_on_demand() {
        let registry = TypeConverterRegistry::new();
        registry.register_enum("Color");
        assert!(registry.resolve(Some("Color"), None).is_some());
        // registered on demand: now present in the app-type table
        assert!(registry.has_converter_for("Color"));
    }

    #[test]
    fn unsupported_driver_type_uses_unknown_converter() {
        let registry = TypeConverterRegistry::new();
        assert!(registry
            .resolve(Some("string"), Some(DriverType::Unsupported))
            .is_some());
    }
}
