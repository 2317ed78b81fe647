//! Execution context, element types and shapes.
//!
//! These are plain values passed to the dispatch service.  Their `Display`
//! forms are the strings the native engine expects as operator parameters
//! (`cpu(0)`, `float32`, `(2,3)`).

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ScopeError;

/// Kind of device an array lives on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceType {
    Cpu,
    Gpu,
    CpuPinned,
}

impl DeviceType {
    /// Device type code used by the native C API.
    pub fn code(self) -> i32 {
        match self {
            Self::Cpu => 1,
            Self::Gpu => 2,
            Self::CpuPinned => 3,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            1 => Some(Self::Cpu),
            2 => Some(Self::Gpu),
            3 => Some(Self::CpuPinned),
            _ => None,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            Self::Cpu => "cpu",
            Self::Gpu => "gpu",
            Self::CpuPinned => "cpu_pinned",
        }
    }
}

/// Execution context: which device an array is allocated on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Device {
    pub device_type: DeviceType,
    pub device_id: u32,
}

impl Device {
    pub const fn cpu() -> Self {
        Self {
            device_type: DeviceType::Cpu,
            device_id: 0,
        }
    }

    pub const fn gpu(device_id: u32) -> Self {
        Self {
            device_type: DeviceType::Gpu,
            device_id,
        }
    }
}

impl Default for Device {
    fn default() -> Self {
        Self::cpu()
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.device_type.as_str(), self.device_id)
    }
}

impl FromStr for Device {
    type Err = ScopeError;

    /// Parses `cpu`, `gpu(1)`, `cpu_pinned(0)` and friends.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (kind, id) = match s.find('(') {
            Some(open) => {
                let close = s
                    .strip_suffix(')')
                    .ok_or_else(|| ScopeError::invalid(format!("malformed device `{s}`")))?;
                let id = close[open + 1..]
                    .trim()
                    .parse::<u32>()
                    .map_err(|e| ScopeError::invalid(format!("bad device id in `{s}`: {e}")))?;
                (&s[..open], id)
            }
            None => (s, 0),
        };
        let device_type = match kind.trim().to_ascii_lowercase().as_str() {
            "cpu" => DeviceType::Cpu,
            "gpu" => DeviceType::Gpu,
            "cpu_pinned" => DeviceType::CpuPinned,
            other => {
                return Err(ScopeError::invalid(format!("unknown device type `{other}`")));
            }
        };
        Ok(Self {
            device_type,
            device_id: id,
        })
    }
}

/// Element data type of an array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    Float32,
    Float64,
    Uint8,
    Int8,
    Int32,
    Int64,
}

impl DataType {
    /// Type flag used by the native C API.
    pub fn code(self) -> i32 {
        match self {
            Self::Float32 => 0,
            Self::Float64 => 1,
            Self::Uint8 => 3,
            Self::Int32 => 4,
            Self::Int8 => 5,
            Self::Int64 => 6,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(Self::Float32),
            1 => Some(Self::Float64),
            3 => Some(Self::Uint8),
            4 => Some(Self::Int32),
            5 => Some(Self::Int8),
            6 => Some(Self::Int64),
            _ => None,
        }
    }

    /// Size of one element in bytes.
    pub fn num_bytes(self) -> usize {
        match self {
            Self::Uint8 | Self::Int8 => 1,
            Self::Float32 | Self::Int32 => 4,
            Self::Float64 | Self::Int64 => 8,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Float32 => "float32",
            Self::Float64 => "float64",
            Self::Uint8 => "uint8",
            Self::Int8 => "int8",
            Self::Int32 => "int32",
            Self::Int64 => "int64",
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Dimensions of an array.  The empty shape is a scalar.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Shape(Vec<usize>);

impl Shape {
    pub fn new(dims: impl Into<Vec<usize>>) -> Self {
        Self(dims.into())
    }

    pub fn scalar() -> Self {
        Self(Vec::new())
    }

    /// Number of dimensions.
    pub fn dimension(&self) -> usize {
        self.0.len()
    }

    /// Total number of elements.  Saturates at `usize::MAX`; use
    /// [`checked_size`](Self::checked_size) where the shape is untrusted.
    pub fn size(&self) -> usize {
        self.checked_size().unwrap_or(usize::MAX)
    }

    /// Total number of elements, or `None` if it overflows `usize`.
    pub fn checked_size(&self) -> Option<usize> {
        self.0.iter().try_fold(1usize, |acc, &d| acc.checked_mul(d))
    }

    /// Bytes needed to hold this shape in `dtype`, or `None` on overflow.
    pub fn checked_byte_len(&self, dtype: DataType) -> Option<usize> {
        self.checked_size()?.checked_mul(dtype.num_bytes())
    }

    pub fn dims(&self) -> &[usize] {
        &self.0
    }

    /// Concatenate two shapes, `self` first.
    pub fn concat(&self, other: &Shape) -> Shape {
        let mut dims = self.0.clone();
        dims.extend_from_slice(&other.0);
        Shape(dims)
    }
}

impl From<Vec<usize>> for Shape {
    fn from(dims: Vec<usize>) -> Self {
        Self(dims)
    }
}

impl<const N: usize> From<[usize; N]> for Shape {
    fn from(dims: [usize; N]) -> Self {
        Self(dims.to_vec())
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("(")?;
        for (i, d) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{d}")?;
        }
        f.write_str(")")
    }
}

/// Everything needed to allocate an array, with an optional shape.
///
/// Descriptors often come from model metadata where the shape is only
/// known later; creators that need a shape reject a descriptor without one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArrayDesc {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub device: Device,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shape: Option<Shape>,
    pub dtype: DataType,
}

impl ArrayDesc {
    pub fn new(device: Device, shape: Shape, dtype: DataType) -> Self {
        Self {
            name: None,
            device,
            shape: Some(shape),
            dtype,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}
