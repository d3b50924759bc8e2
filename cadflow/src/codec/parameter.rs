//! Named design parameters and ordered parameter sets.

use crate::errors::ValidationError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

/// The type of a design parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamType {
    /// Floating-point number.
    #[serde(alias = "float")]
    Number,
    /// Integer.
    #[serde(alias = "int")]
    Integer,
    /// Text.
    #[serde(alias = "str")]
    String,
    /// True/false flag.
    #[serde(alias = "bool")]
    Boolean,
    /// Three-component point.
    #[serde(alias = "pt")]
    Point,
    /// Three-component vector.
    #[serde(alias = "vt")]
    Vector,
    /// Sequence of scalars.
    #[serde(alias = "lt")]
    List,
}

impl ParamType {
    /// The `(Prefix) ` written before typed expressions, empty for numerics.
    #[must_use]
    pub fn prefix(&self) -> &'static str {
        match self {
            Self::Number | Self::Integer => "",
            Self::String => "(String) ",
            Self::Boolean => "(Boolean) ",
            Self::Point => "(Point) ",
            Self::Vector => "(Vector) ",
            Self::List => "(List) ",
        }
    }
}

impl FromStr for ParamType {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "number" | "float" => Ok(Self::Number),
            "integer" | "int" => Ok(Self::Integer),
            "string" | "str" => Ok(Self::String),
            "boolean" | "bool" => Ok(Self::Boolean),
            "point" | "pt" => Ok(Self::Point),
            "vector" | "vt" => Ok(Self::Vector),
            "list" | "lt" => Ok(Self::List),
            _ => Err(ValidationError::unknown_type(s)),
        }
    }
}

impl fmt::Display for ParamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number => write!(f, "number"),
            Self::Integer => write!(f, "integer"),
            Self::String => write!(f, "string"),
            Self::Boolean => write!(f, "boolean"),
            Self::Point => write!(f, "point"),
            Self::Vector => write!(f, "vector"),
            Self::List => write!(f, "list"),
        }
    }
}

/// A single named design parameter.
///
/// Equality compares numbers by value, so `3` and `3.0` are the same.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Parameter {
    /// Expression name (identifier).
    pub name: String,
    /// Parameter type.
    #[serde(rename = "type")]
    pub param_type: ParamType,
    /// The value; its accepted shape depends on the type.
    pub value: serde_json::Value,
    /// Optional unit, e.g. `mm` or `Degrees`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
}

impl Parameter {
    /// Creates a parameter, checking the name.
    ///
    /// # Errors
    ///
    /// Returns a validation error if the name is not an identifier.
    pub fn new(
        name: impl Into<String>,
        param_type: ParamType,
        value: serde_json::Value,
    ) -> Result<Self, ValidationError> {
        let name = name.into();
        if !is_identifier(&name) {
            return Err(ValidationError::invalid_value(
                &name,
                "parameter names must start with a letter or '_' and contain only letters, digits and '_'",
            ));
        }
        Ok(Self {
            name,
            param_type,
            value,
            unit: None,
        })
    }

    /// Creates a parameter from a textual type name.
    ///
    /// # Errors
    ///
    /// Returns a validation error for unknown type names or bad names.
    pub fn parse(
        name: impl Into<String>,
        type_name: &str,
        value: serde_json::Value,
    ) -> Result<Self, ValidationError> {
        let param_type = type_name.parse::<ParamType>()?;
        Self::new(name, param_type, value)
    }

    /// Sets the unit. An empty unit is the same as no unit.
    #[must_use]
    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        let unit = unit.into();
        self.unit = if unit.is_empty() { None } else { Some(unit) };
        self
    }

    /// Shorthand for a number parameter.
    pub fn number(name: impl Into<String>, value: f64) -> Result<Self, ValidationError> {
        Self::new(name, ParamType::Number, serde_json::json!(value))
    }

    /// Returns the unit, if one is set and non-empty.
    #[must_use]
    pub fn unit(&self) -> Option<&str> {
        self.unit.as_deref().filter(|u| !u.is_empty())
    }

    /// Checks that the unit fits between the `[` `]` of an expression line.
    ///
    /// # Errors
    ///
    /// Returns a validation error for brackets or control characters.
    pub fn check_unit(&self) -> Result<(), ValidationError> {
        match self.unit() {
            Some(unit) if unit.chars().any(|c| matches!(c, '[' | ']') || c.is_control()) => {
                Err(ValidationError::invalid_value(
                    &self.name,
                    format!(
                        "unit '{}' must not contain brackets or control characters",
                        unit.escape_default()
                    ),
                ))
            }
            _ => Ok(()),
        }
    }
}

impl PartialEq for Parameter {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
            && self.param_type == other.param_type
            && self.unit() == other.unit()
            && same_value(&self.value, &other.value)
    }
}

fn same_value(a: &serde_json::Value, b: &serde_json::Value) -> bool {
    use serde_json::Value;
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_i64(), y.as_i64()) {
            (Some(x), Some(y)) => x == y,
            _ => x.as_f64() == y.as_f64(),
        },
        (Value::Array(x), Value::Array(y)) => {
            x.len() == y.len() && x.iter().zip(y).all(|(x, y)| same_value(x, y))
        }
        _ => a == b,
    }
}

pub(crate) fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Wire shape of a parameter before its type name has been checked.
#[derive(Debug, Clone, Deserialize)]
struct RawParameter {
    name: String,
    #[serde(rename = "type", default = "default_type_name")]
    type_name: String,
    #[serde(default)]
    value: serde_json::Value,
    #[serde(default)]
    unit: Option<String>,
}

fn default_type_name() -> String {
    "number".to_string()
}

/// An ordered set of parameters with unique names.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<Parameter>", into = "Vec<Parameter>")]
pub struct ParameterSet {
    params: Vec<Parameter>,
    index: HashMap<String, usize>,
}

impl ParameterSet {
    /// Creates an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a parameter.
    ///
    /// # Errors
    ///
    /// Returns a validation error if the name is already present.
    pub fn insert(&mut self, param: Parameter) -> Result<(), ValidationError> {
        if self.index.contains_key(&param.name) {
            return Err(ValidationError::duplicate("parameter", &param.name));
        }
        self.index.insert(param.name.clone(), self.params.len());
        self.params.push(param);
        Ok(())
    }

    /// Builder-style insert.
    pub fn with(mut self, param: Parameter) -> Result<Self, ValidationError> {
        self.insert(param)?;
        Ok(self)
    }

    /// Looks a parameter up by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Parameter> {
        self.index.get(name).map(|&i| &self.params[i])
    }

    /// Returns true if a parameter with this name exists.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    /// Iterates in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &Parameter> {
        self.params.iter()
    }

    /// Parameter names in insertion order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.params.iter().map(|p| p.name.as_str())
    }

    /// Number of parameters.
    #[must_use]
    pub fn len(&self) -> usize {
        self.params.len()
    }

    /// Returns true if the set is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    /// Parses a JSON array of `{name, type, value, unit}` objects.
    ///
    /// Type names are checked here so an unknown type surfaces as a
    /// validation error rather than a generic deserialization failure.
    ///
    /// # Errors
    ///
    /// Returns a validation error for malformed JSON, unknown types or
    /// duplicate names.
    pub fn from_json_str(json: &str) -> Result<Self, ValidationError> {
        let raw: Vec<RawParameter> = serde_json::from_str(json).map_err(|e| {
            ValidationError::new(
                crate::errors::ValidationCode::Syntax,
                format!("Invalid parameter file: {e}"),
            )
        })?;

        let mut set = Self::new();
        for item in raw {
            let mut param = Parameter::parse(item.name, &item.type_name, item.value)?;
            if let Some(unit) = item.unit {
                param = param.with_unit(unit);
                param.check_unit()?;
            }
            set.insert(param)?;
        }
        Ok(set)
    }
}

impl TryFrom<Vec<Parameter>> for ParameterSet {
    type Error = ValidationError;

    fn try_from(params: Vec<Parameter>) -> Result<Self, Self::Error> {
        let mut set = Self::new();
        for param in params {
            set.insert(param)?;
        }
        Ok(set)
    }
}

impl From<ParameterSet> for Vec<Parameter> {
    fn from(set: ParameterSet) -> Self {
        set.params
    }
}

impl<'a> IntoIterator for &'a ParameterSet {
    type Item = &'a Parameter;
    type IntoIter = std::slice::Iter<'a, Parameter>;

    fn into_iter(self) -> Self::IntoIter {
        self.params.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ValidationCode;
    use serde_json::json;

    #[test]
    fn test_param_type_aliases() {
        assert_eq!("pt".parse::<ParamType>().unwrap(), ParamType::Point);
        assert_eq!("int".parse::<ParamType>().unwrap(), ParamType::Integer);
        assert_eq!("Boolean".parse::<ParamType>().unwrap(), ParamType::Boolean);
        assert_eq!("lt".parse::<ParamType>().unwrap(), ParamType::List);
    }

    #[test]
    fn test_unknown_type_is_validation_error() {
        let err = "matrix".parse::<ParamType>().unwrap_err();
        assert_eq!(err.code, ValidationCode::UnknownType);
        assert!(Parameter::parse("m", "matrix", json!(1)).is_err());
    }

    #[test]
    fn test_parameter_name_must_be_identifier() {
        assert!(Parameter::number("L4", 2.0).is_ok());
        assert!(Parameter::number("_x", 2.0).is_ok());
        assert!(Parameter::number("4L", 2.0).is_err());
        assert!(Parameter::number("a b", 2.0).is_err());
        assert!(Parameter::number("", 2.0).is_err());
    }

    #[test]
    fn test_empty_unit_is_none() {
        let p = Parameter::number("L4", 2.0).unwrap().with_unit("");
        assert!(p.unit().is_none());
    }

    #[test]
    fn test_unit_rejects_brackets() {
        let p = Parameter::number("L4", 2.0).unwrap().with_unit("mm]x");
        assert_eq!(p.check_unit().unwrap_err().code, ValidationCode::InvalidValue);
        let p = Parameter::number("L4", 2.0).unwrap().with_unit("m\ns");
        assert!(p.check_unit().is_err());
        assert!(Parameter::number("L4", 2.0).unwrap().with_unit("N/mm^2").check_unit().is_ok());

        let err = ParameterSet::from_json_str(r#"[{"name": "a", "value": 1.0, "unit": "[mm]"}]"#)
            .unwrap_err();
        assert_eq!(err.code, ValidationCode::InvalidValue);
    }

    #[test]
    fn test_equality_compares_numbers_by_value() {
        let int = Parameter::new("a", ParamType::Number, json!(3)).unwrap();
        let float = Parameter::new("a", ParamType::Number, json!(3.0)).unwrap();
        assert_eq!(int, float);
        assert_ne!(int, Parameter::number("a", 3.5).unwrap());
        assert_ne!(int, float.clone().with_unit("mm"));
    }

    #[test]
    fn test_set_rejects_duplicates_and_keeps_order() {
        let mut set = ParameterSet::new();
        set.insert(Parameter::number("b", 1.0).unwrap()).unwrap();
        set.insert(Parameter::number("a", 2.0).unwrap()).unwrap();

        let err = set.insert(Parameter::number("a", 3.0).unwrap()).unwrap_err();
        assert_eq!(err.code, ValidationCode::Duplicate);
        assert_eq!(set.names().collect::<Vec<_>>(), vec!["b", "a"]);
        assert_eq!(set.get("a").unwrap().value, json!(2.0));
    }

    #[test]
    fn test_from_json_str() {
        let set = ParameterSet::from_json_str(
            r#"[
                {"name": "L4", "type": "number", "value": 2.0, "unit": "mm"},
                {"name": "shape", "type": "pt", "value": [0, 0, 0]}
            ]"#,
        )
        .unwrap();

        assert_eq!(set.len(), 2);
        assert_eq!(set.get("L4").unwrap().unit(), Some("mm"));
        assert_eq!(set.get("shape").unwrap().param_type, ParamType::Point);
    }

    #[test]
    fn test_from_json_str_unknown_type() {
        let err = ParameterSet::from_json_str(r#"[{"name": "x", "type": "tensor", "value": 1}]"#)
            .unwrap_err();
        assert_eq!(err.code, ValidationCode::UnknownType);
    }

    #[test]
    fn test_serde_round_trip_rejects_duplicates() {
        let json = r#"[{"name":"a","type":"number","value":1.0},{"name":"a","type":"number","value":2.0}]"#;
        assert!(serde_json::from_str::<ParameterSet>(json).is_err());
    }
}
