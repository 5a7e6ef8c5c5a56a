use driver::DriverType;
use std::collections::{HashMap, HashSet};

/// One column-to-property rule of a result map.
#[derive(Clone, Debug, Default)]
pub struct ResultMapping {
    pub property: Option<String>,
    pub column: Option<String>,
    pub app_type: Option<String>,
    pub driver_type: Option<DriverType>,
    /// Named converter override.
    pub converter: Option<String>,
    /// Statement id fetched to produce this property (nested query).
    pub nested_select: Option<String>,
    /// Result map materialized from the same cursor (nested mapping).
    pub nested_result_map: Option<String>,
    pub not_null_columns: HashSet<String>,
    pub column_prefix: Option<String>,
    pub id_flag: bool,
    pub constructor_flag: bool,
    /// `{prop=col,...}` bindings feeding a nested select or a foreign link.
    pub composites: Vec<(String, String)>,
    /// Name of the later result set this mapping is filled from.
    pub result_set: Option<String>,
    pub foreign_column: Option<String>,
    pub lazy: bool,
    /// Collection-valued property (built from `<collection>`).
    pub many: bool,
}

impl ResultMapping {
    pub fn column_or_property(&self) -> Option<&str> {
        self.column.as_deref().or(self.property.as_deref())
    }
}

/// Column-driven subtype selector.
#[derive(Clone, Debug)]
pub struct Discriminator {
    pub column: String,
    pub app_type: Option<String>,
    pub driver_type: Option<DriverType>,
    pub converter: Option<String>,
    // decoded column value (as text) -> result map id
    pub cases: HashMap<String, String>,
}

/// Declarative mapping from result columns to one object shape.
#[derive(Clone, Debug, Default)]
pub struct ResultMap {
    pub id: String,
    pub type_name: String,
    pub mappings: Vec<ResultMapping>,
    pub constructor_mappings: Vec<ResultMapping>,
    pub id_mappings: Vec<ResultMapping>,
    /// Uppercased column names claimed by explicit mappings.
    pub mapped_columns: HashSet<String>,
    pub mapped_properties: HashSet<String>,
    pub discriminator: Option<Discriminator>,
    pub auto_mapping: Option<bool>,
    pub has_nested_result_maps: bool,
    pub has_nested_queries: bool,
}

impl ResultMap {
    pub fn new(
        id: &str,
        type_name: &str,
        all_mappings: Vec<ResultMapping>,
        discriminator: Option<Discriminator>,
        auto_mapping: Option<bool>,
    ) -> ResultMap {
        let mut map = ResultMap {
            id: id.to_string(),
            type_name: type_name.to_string(),
            discriminator,
            auto_mapping,
            ..ResultMap::default()
        };
        for mapping in all_mappings {
            map.has_nested_queries |= mapping.nested_select.is_some();
            map.has_nested_result_maps |=
                mapping.nested_result_map.is_some() && mapping.result_set.is_none();
            if let Some(column) = &mapping.column {
                map.mapped_columns.insert(column.to_uppercase());
            }
            for (_, column) in &mapping.composites {
                map.mapped_columns.insert(column.to_uppercase());
            }
            if let Some(property) = &mapping.property {
                map.mapped_properties.insert(property.clone());
            }
            if mapping.id_flag {
                map.id_mappings.push(mapping.clone());
            }
            if mapping.constructor_flag {
                map.constructor_mappings.push(mapping.clone());
            } else {
                map.mappings.push(mapping);
            }
        }
        map
    }

    /// Mappings that drive the row key; when nothing is flagged ID the whole
    /// property set identifies the row.
    pub fn row_key_mappings(&self) -> &[ResultMapping] {
        if self.id_mappings.is_empty() {
            &self.mappings
        } else {
            &self.id_mappings
        }
    }
}
