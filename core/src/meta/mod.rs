//! Metadata over application objects.
//!
//! Application values flow through the framework as `serde_json::Value`
//! trees. A [`TypeDescriptor`] describes the shape of a named application
//! type (declared properties, a case-insensitive name index, an optional
//! constructor); descriptors are held in a process-wide cache. [`MetaObject`]
//! walks value trees through dotted/indexed property paths, auto-creating
//! intermediate objects on writes and yielding `Null` when reading through a
//! missing link.

mod path;
pub use path::PropertyTokenizer;

use crate::{Error, Result};
use driver::Value;
use lazy_static::lazy_static;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

pub type ConstructorFn = Arc<dyn Fn(Vec<Value>) -> Value + Send + Sync>;

/// Compiled descriptor for one named application type.
pub struct TypeDescriptor {
    name: String,
    // property name -> application type name
    properties: HashMap<String, String>,
    // UPPERCASE property name -> original
    upper_index: HashMap<String, String>,
    constructor: Option<ConstructorFn>,
}

impl std::fmt::Debug for TypeDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TypeDescriptor")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl TypeDescriptor {
    pub fn new(name: &str) -> TypeDescriptorBuilder {
        TypeDescriptorBuilder {
            name: name.to_string(),
            properties: Vec::new(),
            constructor: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn has_property(&self, property: &str) -> bool {
        self.properties.contains_key(property)
    }

    pub fn property_type(&self, property: &str) -> Option<&str> {
        self.properties.get(property).map(String::as_str)
    }

    /// Resolve a name case-insensitively to the declared property name.
    pub fn find_property(&self, name: &str) -> Option<&str> {
        self.upper_index
            .get(&name.to_uppercase())
            .map(String::as_str)
    }

    pub fn properties(&self) -> impl Iterator<Item = &str> {
        self.properties.keys().map(String::as_str)
    }

    pub fn constructor(&self) -> Option<&ConstructorFn> {
        self.constructor.as_ref()
    }
}

pub struct TypeDescriptorBuilder {
    name: String,
    properties: Vec<(String, String)>,
    constructor: Option<ConstructorFn>,
}

impl TypeDescriptorBuilder {
    pub fn property(mut self, name: &str, app_type: &str) -> TypeDescriptorBuilder {
        self.properties.push((name.to_string(), app_type.to_string()));
        self
    }

    pub fn constructor(mut self, f: ConstructorFn) -> TypeDescriptorBuilder {
        self.constructor = Some(f);
        self
    }

    pub fn build(self) -> Result<TypeDescriptor> {
        let mut properties = HashMap::new();
        let mut upper_index = HashMap::new();
        for (name, app_type) in self.properties {
            if upper_index
                .insert(name.to_uppercase(), name.clone())
                .is_some()
            {
                return Err(Error::AmbiguousProperty {
                    type_name: self.name,
                    property: name,
                });
            }
            properties.insert(name, app_type);
        }
        Ok(TypeDescriptor {
            name: self.name,
            properties,
            upper_index,
            constructor: self.constructor,
        })
    }
}

lazy_static! {
    // Process-wide descriptor cache, keyed by application type name.
    static ref DESCRIPTORS: RwLock<HashMap<String, Arc<TypeDescriptor>>> =
        RwLock::new(HashMap::new());
}

pub fn register_type(descriptor: TypeDescriptor) {
    DESCRIPTORS
        .write()
        .unwrap()
        .insert(descriptor.name.clone(), Arc::new(descriptor));
}

pub fn descriptor_for(type_name: &str) -> Option<Arc<TypeDescriptor>> {
    DESCRIPTORS.read().unwrap().get(type_name).cloned()
}

/// Convert an underscored column name to the camelCase property it maps to
/// when `mapUnderscoreToCamelCase` is on.
pub fn underscore_to_camel(column: &str) -> String {
    let mut out = String::with_capacity(column.len());
    let mut upper_next = false;
    for ch in column.chars() {
        if ch == '_' {
            upper_next = true;
        } else if upper_next {
            out.extend(ch.to_uppercase());
            upper_next = false;
        } else {
            out.extend(ch.to_lowercase());
        }
    }
    out
}

/// Property-path navigation over `Value` trees.
pub struct MetaObject;

impl MetaObject {
    /// Read through a property path. Reading through a missing link yields
    /// `Null`.
    pub fn get(object: &Value, path: &str) -> Value {
        let mut current = object;
        let mut token = PropertyTokenizer::new(path);
        loop {
            let base = match step(current, token.name()) {
                Some(v) => v,
                None => return Value::Null,
            };
            let stepped = match token.index() {
                Some(index) => match index_step(base, index) {
                    Some(v) => v,
                    None => return Value::Null,
                },
                None => base,
            };
            if !token.has_next() {
                return stepped.clone();
            }
            current = stepped;
            token = token.next();
        }
    }

    /// Write through a property path, creating intermediate objects (or
    /// arrays, for numeric indexes) as needed.
    pub fn set(object: &mut Value, path: &str, value: Value) -> Result<()> {
        let token = PropertyTokenizer::new(path);
        let slot = slot_for(object, &token)?;
        if token.has_next() {
            return MetaObject::set(slot, token.children().unwrap_or(""), value);
        }
        *slot = value;
        Ok(())
    }

    /// Like [`MetaObject::set`], but validates the first path segment
    /// against the registered descriptor of `type_name` when one exists.
    pub fn set_checked(
        object: &mut Value,
        type_name: &str,
        path: &str,
        value: Value,
    ) -> Result<()> {
        if let Some(descriptor) = descriptor_for(type_name) {
            let first = PropertyTokenizer::new(path);
            if !descriptor.has_property(first.name()) {
                return Err(Error::UnknownProperty {
                    type_name: type_name.to_string(),
                    property: first.name().to_string(),
                });
            }
        }
        MetaObject::set(object, path, value)
    }
}

fn step<'a>(value: &'a Value, name: &str) -> Option<&'a Value> {
    if name.is_empty() {
        return Some(value);
    }
    value.as_object().and_then(|map| map.get(name))
}

fn index_step<'a>(value: &'a Value, index: &str) -> Option<&'a Value> {
    match value {
        Value::Array(items) => index.parse::<usize>().ok().and_then(|i| items.get(i)),
        Value::Object(map) => map.get(index),
        _ => None,
    }
}

// Resolve the mutable slot one token addresses, materializing missing
// containers along the way.
fn slot_for<'a>(object: &'a mut Value, token: &PropertyTokenizer) -> Result<&'a mut Value> {
    let base: &mut Value = if token.name().is_empty() {
        object
    } else {
        if object.is_null() {
            *object = Value::Object(serde_json::Map::new());
        }
        let kind = value_kind(object);
        let map = object.as_object_mut().ok_or(Error::UnknownProperty {
            type_name: kind,
            property: token.name().to_string(),
        })?;
        map.entry(token.name().to_string()).or_insert(Value::Null)
    };
    match token.index() {
        None => Ok(base),
        Some(index) => match index.parse::<usize>() {
            Ok(i) => {
                if base.is_null() {
                    *base = Value::Array(Vec::new());
                }
                let kind = value_kind(base);
                let items = base.as_array_mut().ok_or(Error::UnknownProperty {
                    type_name: kind,
                    property: token.indexed_name().to_string(),
                })?;
                while items.len() <= i {
                    items.push(Value::Null);
                }
                Ok(&mut items[i])
            }
            Err(_) => {
                if base.is_null() {
                    *base = Value::Object(serde_json::Map::new());
                }
                let kind = value_kind(base);
                let map = base.as_object_mut().ok_or(Error::UnknownProperty {
                    type_name: kind,
                    property: token.indexed_name().to_string(),
                })?;
                Ok(map.entry(index.to_string()).or_insert(Value::Null))
            }
        },
    }
}

fn value_kind(value: &Value) -> String {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
    .to_string()
}

#[cfg(test)]
mod unit {
    use super::*;
    use serde_json::json;

    #[test]
    fn get_walks_nested_paths() {
        let v = json!({"order": {"items": [{"name": "pen"}, {"name": "ink"}]}});
        assert_eq!(MetaObject::get(&v, "order.items[1].name"), json!("ink"));
        assert_eq!(MetaObject::get(&v, "order.items[9].name"), Value::Null);
        assert_eq!(MetaObject::get(&v, "order.missing.deep"), Value::Null);
    }

    #[test]
    fn get_supports_map_keys() {
        let v = json!({"lookup": {"k1": 10}});
        assert_eq!(MetaObject::get(&v, "lookup[k1]"), json!(10));
    }

    #[test]
    fn set_auto_creates_intermediates() {
        let mut v = json!({});
        MetaObject::set(&mut v, "order.items[1].name", json!("ink")).unwrap();
        assert_eq!(
            v,
            json!({"order": {"items": [null, {"name": "ink"}]}})
        );
    }

    #[test]
    fn set_checked_rejects_undeclared_property() {
        register_type(
            TypeDescriptor::new("StrictUser")
                .property("id", "long")
                .property("name", "string")
                .build()
                .unwrap(),
        );
        let mut v = json!({});
        assert!(MetaObject::set_checked(&mut v, "StrictUser", "name", json!("Ann")).is_ok());
        let err = MetaObject::set_checked(&mut v, "StrictUser", "age", json!(4)).unwrap_err();
        assert!(matches!(err, Error::UnknownProperty { .. }));
    }

    #[test]
    fn descriptor_detects_case_collision() {
        let err = TypeDescriptor::new("Collides")
            .property("userName", "string")
            .property("USERNAME", "string")
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::AmbiguousProperty { .. }));
    }

    #[test]
    fn camel_casing() {
        assert_eq!(underscore_to_camel("USER_NAME"), "userName");
        assert_eq!(underscore_to_camel("amount"), "amount");
    }
}
