use std::collections::HashMap;
use serde::{Deserialize, Serialize};

/// Element type of a tensor stored in the arena.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DType {
    F32,
    F16,
    BF16,
    U8,
    I32,
    I64,
}

impl DType {
    /// Width of a single element in bytes.
    pub fn size_bytes(&self) -> u64 {
        match self {
            DType::F32 | DType::I32 => 4,
            DType::F16 | DType::BF16 => 2,
            DType::U8 => 1,
            DType::I64 => 8,
        }
    }
}

/// Non-owning reference to a byte range in the arena's tensor region.
///
/// `offset` is absolute from the start of the mapped region. The arena owns
/// the bytes; a handle stays valid only until the producing job's output is
/// overwritten or the arena is reset.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct TensorHandle {
    pub offset: u64,
    pub size_bytes: u64,
    pub dtype: DType,
    pub shape: Vec<u64>,
}

impl TensorHandle {
    pub fn element_count(&self) -> u64 {
        self.shape.iter().product()
    }
}

/// Expected output of a job, as declared by the submitter.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct OutputSpec {
    pub name: String,
    pub dtype: DType,
    pub shape_hint: Vec<u64>,
}

/// Literal configuration value carried in a job's parameter map.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub enum Value {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl Value {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(value) => Some(*value),
            Value::Int(value) => Some(*value as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(value) => Some(value),
            _ => None,
        }
    }
}

pub type Params = HashMap<String, Value>;
