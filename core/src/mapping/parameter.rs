use crate::{Error, Result};
use driver::DriverType;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ParameterMode {
    #[default]
    In,
    Out,
    InOut,
}

impl ParameterMode {
    pub fn from_name(name: &str) -> Option<ParameterMode> {
        Some(match name.to_uppercase().as_str() {
            "IN" => ParameterMode::In,
            "OUT" => ParameterMode::Out,
            "INOUT" => ParameterMode::InOut,
            _ => return None,
        })
    }

    pub fn is_out(&self) -> bool {
        matches!(self, ParameterMode::Out | ParameterMode::InOut)
    }

    pub fn is_in(&self) -> bool {
        matches!(self, ParameterMode::In | ParameterMode::InOut)
    }
}

/// One positional binding of a prepared statement: where the value comes
/// from and how it converts.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ParameterMapping {
    pub property: String,
    pub mode: ParameterMode,
    pub app_type: Option<String>,
    pub driver_type: Option<DriverType>,
    pub numeric_scale: Option<u32>,
    /// Named converter override (`typeHandler=`).
    pub converter: Option<String>,
    /// Result map decoding an OUT cursor parameter.
    pub result_map_id: Option<String>,
}

impl ParameterMapping {
    pub fn of(property: &str) -> ParameterMapping {
        ParameterMapping {
            property: property.to_string(),
            ..ParameterMapping::default()
        }
    }

    /// Parse inline placeholder content:
    /// `property[,javaType=..][,jdbcType=..][,mode=..][,numericScale=..][,typeHandler=..][,resultMap=..]`.
    pub fn parse(content: &str) -> Result<ParameterMapping> {
        let mut parts = content.split(',');
        let property = parts
            .next()
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .ok_or_else(|| Error::malformed(format!("empty parameter expression: #{{{content}}}")))?;
        let mut mapping = ParameterMapping::of(property);
        for attribute in parts {
            let (name, value) = attribute.split_once('=').ok_or_else(|| {
                Error::malformed(format!(
                    "bad attribute '{attribute}' in parameter expression #{{{content}}}"
                ))
            })?;
            let (name, value) = (name.trim(), value.trim());
            match name {
                "javaType" => mapping.app_type = Some(value.to_string()),
                "jdbcType" => {
                    mapping.driver_type = Some(DriverType::from_name(value).ok_or_else(|| {
                        Error::malformed(format!("unknown jdbcType '{value}' in #{{{content}}}"))
                    })?);
                }
                "mode" => {
                    mapping.mode = ParameterMode::from_name(value).ok_or_else(|| {
                        Error::malformed(format!("unknown mode '{value}' in #{{{content}}}"))
                    })?;
                }
                "numericScale" => {
                    mapping.numeric_scale = Some(value.parse().map_err(|_| {
                        Error::malformed(format!("bad numericScale '{value}' in #{{{content}}}"))
                    })?);
                }
                "typeHandler" => mapping.converter = Some(value.to_string()),
                "resultMap" => mapping.result_map_id = Some(value.to_string()),
                other => {
                    return Err(Error::malformed(format!(
                        "unknown attribute '{other}' in parameter expression #{{{content}}}"
                    )));
                }
            }
        }
        Ok(mapping)
    }
}

/// An explicitly declared, reusable ordered parameter list.
#[derive(Clone, Debug, Default)]
pub struct ParameterMap {
    pub id: String,
    pub app_type: Option<String>,
    pub mappings: Vec<ParameterMapping>,
}

#[cfg(test)]
mod unit {
    use super::*;

    #[test]
    fn bare_property() {
        let m = ParameterMapping::parse("id").unwrap();
        assert_eq!(m.property, "id");
        assert_eq!(m.mode, ParameterMode::In);
        assert!(m.driver_type.is_none());
    }

    #[test]
    fn full_attribute_set() {
        let m = ParameterMapping::parse(
            "amount, javaType=decimal, jdbcType=NUMERIC, mode=INOUT, numericScale=2, typeHandler=money",
        )
        .unwrap();
        assert_eq!(m.property, "amount");
        assert_eq!(m.app_type.as_deref(), Some("decimal"));
        assert_eq!(m.driver_type, Some(DriverType::Numeric));
        assert_eq!(m.mode, ParameterMode::InOut);
        assert_eq!(m.numeric_scale, Some(2));
        assert_eq!(m.converter.as_deref(), Some("money"));
    }

    #[test]
    fn unknown_attribute_is_rejected() {
        assert!(ParameterMapping::parse("id, wat=1").is_err());
        assert!(ParameterMapping::parse("id, jdbcType=NOPE").is_err());
    }
}
