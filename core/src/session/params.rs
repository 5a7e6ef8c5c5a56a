//! The parameter packing rules: how a method-style argument list becomes
//! the single parameter object a statement binds against.

use driver::Value;
use serde_json::Map;

/// Pack positional arguments:
/// - zero arguments become `Null`;
/// - a single non-collection argument is the parameter itself;
/// - a single collection argument is exposed under `collection`, `list`
///   and `array`;
/// - multiple arguments pack as `{param1: .., param2: ..}`.
pub fn pack_args(args: &[Value]) -> Value {
    match args {
        [] => Value::Null,
        [single] if !single.is_array() => single.clone(),
        [collection] => {
            let mut map = Map::new();
            map.insert("collection".to_string(), collection.clone());
            map.insert("list".to_string(), collection.clone());
            map.insert("array".to_string(), collection.clone());
            Value::Object(map)
        }
        many => {
            let mut map = Map::new();
            for (i, value) in many.iter().enumerate() {
                map.insert(format!("param{}", i + 1), value.clone());
            }
            Value::Object(map)
        }
    }
}

/// Pack explicitly named arguments; `paramN` entries are added alongside
/// the names, and a lone collection argument keeps its collection aliases.
pub fn pack_named(args: &[(&str, Value)]) -> Value {
    let mut map = Map::new();
    for (i, (name, value)) in args.iter().enumerate() {
        map.insert(name.to_string(), value.clone());
        map.insert(format!("param{}", i + 1), value.clone());
    }
    if args.len() == 1 && args[0].1.is_array() {
        map.insert("collection".to_string(), args[0].1.clone());
        map.insert("list".to_string(), args[0].1.clone());
        map.insert("array".to_string(), args[0].1.clone());
    }
    Value::Object(map)
}
