//! Typed, ordered operator parameters.

use std::fmt;

use crate::types::{DataType, Device, Shape};

/// A single operator parameter value.
#[derive(Debug, Clone, PartialEq)]
pub enum ParamValue {
    Int(i64),
    Float(f64),
    Bool(bool),
    Str(String),
    Shape(Shape),
    DataType(DataType),
    Device(Device),
}

impl fmt::Display for ParamValue {
    /// Renders the value the way the native engine parses it.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Bool(v) => f.write_str(if *v { "True" } else { "False" }),
            Self::Str(v) => f.write_str(v),
            Self::Shape(v) => write!(f, "{v}"),
            Self::DataType(v) => write!(f, "{v}"),
            Self::Device(v) => write!(f, "{v}"),
        }
    }
}

impl From<i64> for ParamValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<i32> for ParamValue {
    fn from(v: i32) -> Self {
        Self::Int(v.into())
    }
}

impl From<f64> for ParamValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<bool> for ParamValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<&str> for ParamValue {
    fn from(v: &str) -> Self {
        Self::Str(v.to_owned())
    }
}

impl From<Shape> for ParamValue {
    fn from(v: Shape) -> Self {
        Self::Shape(v)
    }
}

/// Ordered name → value list handed to the dispatch service.
///
/// Insertion order is preserved; setting a name twice replaces the earlier
/// value in place.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OpParams {
    entries: Vec<(String, ParamValue)>,
}

impl OpParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_param(
        &mut self,
        name: impl Into<String>,
        value: impl Into<ParamValue>,
    ) -> &mut Self {
        let name = name.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| *k == name) {
            Some(slot) => slot.1 = value,
            None => self.entries.push((name, value)),
        }
        self
    }

    /// Sets the target shape under the conventional `shape` key.
    pub fn set_shape(&mut self, shape: &Shape) -> &mut Self {
        self.set_shape_named("shape", shape)
    }

    /// Sets a shape under a custom key (sampling ops use `size`).
    pub fn set_shape_named(&mut self, name: &str, shape: &Shape) -> &mut Self {
        self.add_param(name, ParamValue::Shape(shape.clone()))
    }

    pub fn set_data_type(&mut self, dtype: DataType) -> &mut Self {
        self.add_param("dtype", ParamValue::DataType(dtype))
    }

    pub fn set_device(&mut self, device: Device) -> &mut Self {
        self.add_param("ctx", ParamValue::Device(device))
    }

    pub fn get(&self, name: &str) -> Option<&ParamValue> {
        self.entries.iter().find(|(k, _)| k == name).map(|(_, v)| v)
    }

    pub fn get_int(&self, name: &str) -> Option<i64> {
        match self.get(name)? {
            ParamValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// Numeric lookup; integers widen to `f64`.
    pub fn get_float(&self, name: &str) -> Option<f64> {
        match self.get(name)? {
            ParamValue::Float(v) => Some(*v),
            ParamValue::Int(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn get_bool(&self, name: &str) -> Option<bool> {
        match self.get(name)? {
            ParamValue::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn get_shape(&self, name: &str) -> Option<&Shape> {
        match self.get(name)? {
            ParamValue::Shape(v) => Some(v),
            _ => None,
        }
    }

    pub fn data_type(&self) -> Option<DataType> {
        match self.get("dtype")? {
            ParamValue::DataType(v) => Some(*v),
            _ => None,
        }
    }

    pub fn device(&self) -> Option<Device> {
        match self.get("ctx")? {
            ParamValue::Device(v) => Some(*v),
            _ => None,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ParamValue)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_params_preserve_order_and_replace() {
        let mut params = OpParams::new();
        params.add_param("start", 0).add_param("stop", 10).add_param("start", 2);
        let keys: Vec<_> = params.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["start", "stop"]);
        assert_eq!(params.get_int("start"), Some(2));
        assert_eq!(params.len(), 2);
    }

    #[test]
    fn test_typed_accessors() {
        let mut params = OpParams::new();
        params
            .set_shape(&Shape::from([2, 3]))
            .set_data_type(DataType::Int32)
            .set_device(Device::gpu(1))
            .add_param("endpoint", true)
            .add_param("num", 5);
        assert_eq!(params.get_shape("shape"), Some(&Shape::from([2, 3])));
        assert_eq!(params.data_type(), Some(DataType::Int32));
        assert_eq!(params.device(), Some(Device::gpu(1)));
        assert_eq!(params.get_bool("endpoint"), Some(true));
        assert_eq!(params.get_float("num"), Some(5.0));
        assert_eq!(params.get_int("endpoint"), None);
    }

    #[test]
    fn test_engine_string_forms() {
        assert_eq!(ParamValue::Bool(false).to_string(), "False");
        assert_eq!(ParamValue::Shape(Shape::from([4])).to_string(), "(4)");
        assert_eq!(ParamValue::Device(Device::cpu()).to_string(), "cpu(0)");
        assert_eq!(ParamValue::Float(0.5).to_string(), "0.5");
    }
}
