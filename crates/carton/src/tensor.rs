use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::{CartonError, CartonResult};

/// Element type of a tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    Float32,
    Float64,
    String,
    Int8,
    Int16,
    Int32,
    Int64,
    Uint8,
    Uint16,
    Uint32,
    Uint64,
}

impl DataType {
    /// Size of one element in bytes, `None` for strings.
    pub fn element_size(self) -> Option<usize> {
        match self {
            Self::Int8 | Self::Uint8 => Some(1),
            Self::Int16 | Self::Uint16 => Some(2),
            Self::Float32 | Self::Int32 | Self::Uint32 => Some(4),
            Self::Float64 | Self::Int64 | Self::Uint64 => Some(8),
            Self::String => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Float32 => "float32",
            Self::Float64 => "float64",
            Self::String => "string",
            Self::Int8 => "int8",
            Self::Int16 => "int16",
            Self::Int32 => "int32",
            Self::Int64 => "int64",
            Self::Uint8 => "uint8",
            Self::Uint16 => "uint16",
            Self::Uint32 => "uint32",
            Self::Uint64 => "uint64",
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TensorData {
    /// Little-endian element bytes.
    Numeric(Bytes),
    Strings(Vec<String>),
}

/// A dense, possibly strided tensor. Strides are counted in elements.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tensor {
    dtype: DataType,
    shape: Vec<u64>,
    strides: Vec<u64>,
    data: TensorData,
}

impl Tensor {
    /// Row-major tensor over little-endian element bytes.
    pub fn from_bytes(dtype: DataType, shape: Vec<u64>, data: impl Into<Bytes>) -> CartonResult<Self> {
        let strides = contiguous_strides(&shape).ok_or_else(|| too_large(&shape))?;
        Self::with_strides(dtype, shape, strides, TensorData::Numeric(data.into()))
    }

    pub fn from_strings(shape: Vec<u64>, values: Vec<String>) -> CartonResult<Self> {
        let strides = contiguous_strides(&shape).ok_or_else(|| too_large(&shape))?;
        Self::with_strides(DataType::String, shape, strides, TensorData::Strings(values))
    }

    pub fn from_f32(shape: Vec<u64>, values: &[f32]) -> CartonResult<Self> {
        let bytes: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        Self::from_bytes(DataType::Float32, shape, bytes)
    }

    pub fn from_i64(shape: Vec<u64>, values: &[i64]) -> CartonResult<Self> {
        let bytes: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        Self::from_bytes(DataType::Int64, shape, bytes)
    }

    /// Build a tensor with explicit strides, checking that the buffer covers
    /// every addressed element.
    pub fn with_strides(
        dtype: DataType,
        shape: Vec<u64>,
        strides: Vec<u64>,
        data: TensorData,
    ) -> CartonResult<Self> {
        if shape.len() != strides.len() {
            return Err(CartonError::validation(format!(
                "tensor rank {} does not match {} strides",
                shape.len(),
                strides.len()
            )));
        }
        if element_count(&shape).is_none() {
            return Err(too_large(&shape));
        }
        let required = required_elements(&shape, &strides).ok_or_else(|| {
            CartonError::validation(format!(
                "strides {strides:?} address more elements than fit in u64 for shape {shape:?}"
            ))
        })?;
        let available = match (&data, dtype.element_size()) {
            (TensorData::Numeric(bytes), Some(size)) => {
                if bytes.len() % size != 0 {
                    return Err(CartonError::validation(format!(
                        "{dtype} buffer of {} bytes is not a whole number of elements",
                        bytes.len()
                    )));
                }
                (bytes.len() / size) as u64
            }
            (TensorData::Strings(values), None) => values.len() as u64,
            _ => {
                return Err(CartonError::validation(format!(
                    "tensor data does not match dtype {dtype}"
                )));
            }
        };
        if available < required {
            return Err(CartonError::validation(format!(
                "tensor of shape {shape:?} needs {required} elements but buffer holds {available}"
            )));
        }
        Ok(Self {
            dtype,
            shape,
            strides,
            data,
        })
    }

    pub fn dtype(&self) -> DataType {
        self.dtype
    }

    pub fn shape(&self) -> &[u64] {
        &self.shape
    }

    pub fn strides(&self) -> &[u64] {
        &self.strides
    }

    pub fn data(&self) -> &TensorData {
        &self.data
    }

    pub fn numel(&self) -> u64 {
        // Checked at construction.
        element_count(&self.shape).unwrap_or(u64::MAX)
    }

    pub fn is_contiguous(&self) -> bool {
        contiguous_strides(&self.shape).is_some_and(|strides| strides == self.strides)
    }
}

fn too_large(shape: &[u64]) -> CartonError {
    CartonError::validation(format!("tensor shape {shape:?} has more elements than fit in u64"))
}

fn element_count(shape: &[u64]) -> Option<u64> {
    if shape.contains(&0) {
        return Some(0);
    }
    shape.iter().try_fold(1u64, |acc, dim| acc.checked_mul(*dim))
}

/// Row-major strides, `None` when they overflow.
pub(crate) fn contiguous_strides(shape: &[u64]) -> Option<Vec<u64>> {
    let mut strides = vec![1u64; shape.len()];
    for idx in (0..shape.len().saturating_sub(1)).rev() {
        strides[idx] = strides[idx + 1].checked_mul(shape[idx + 1].max(1))?;
    }
    Some(strides)
}

fn required_elements(shape: &[u64], strides: &[u64]) -> Option<u64> {
    if shape.contains(&0) {
        return Some(0);
    }
    shape
        .iter()
        .zip(strides)
        .try_fold(1u64, |acc, (dim, stride)| {
            (dim - 1).checked_mul(*stride)?.checked_add(acc)
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn contiguous_strides_are_row_major() {
        assert_eq!(contiguous_strides(&[2, 3, 4]), Some(vec![12, 4, 1]));
        assert_eq!(contiguous_strides(&[]), Some(Vec::new()));
        assert_eq!(contiguous_strides(&[2, u64::MAX, 2]), None);
    }

    #[test]
    fn oversized_shapes_are_rejected() {
        let huge = (1u64 << 63) + 1;
        let err = Tensor::with_strides(
            DataType::Uint8,
            vec![huge, 2],
            vec![2, 1],
            TensorData::Numeric(Bytes::from_static(&[1, 2])),
        )
        .unwrap_err();
        assert!(matches!(err, CartonError::ValidationFailed { .. }), "{err}");

        let err = Tensor::with_strides(
            DataType::Uint8,
            vec![huge, 2],
            vec![0, 0],
            TensorData::Numeric(Bytes::from_static(&[1])),
        )
        .unwrap_err();
        assert!(matches!(err, CartonError::ValidationFailed { .. }), "{err}");

        let err = Tensor::from_bytes(DataType::Uint8, vec![u64::MAX, u64::MAX], vec![0u8]).unwrap_err();
        assert!(matches!(err, CartonError::ValidationFailed { .. }), "{err}");
    }

    #[test]
    fn rejects_short_buffers() {
        let err = Tensor::from_f32(vec![2, 2], &[1.0, 2.0, 3.0]).unwrap_err();
        assert!(matches!(err, CartonError::ValidationFailed { .. }));
    }

    #[test]
    fn accepts_broadcast_strides() {
        let tensor = Tensor::with_strides(
            DataType::Uint8,
            vec![4, 3],
            vec![0, 1],
            TensorData::Numeric(Bytes::from_static(&[1, 2, 3])),
        )
        .unwrap();
        assert_eq!(tensor.numel(), 12);
        assert!(!tensor.is_contiguous());
    }

    #[test]
    fn string_tensors_need_string_data() {
        let err = Tensor::with_strides(
            DataType::String,
            vec![1],
            vec![1],
            TensorData::Numeric(Bytes::from_static(b"x")),
        )
        .unwrap_err();
        assert!(matches!(err, CartonError::ValidationFailed { .. }));

        let ok = Tensor::from_strings(vec![2], vec!["a".into(), "b".into()]).unwrap();
        assert_eq!(ok.dtype(), DataType::String);
    }

    #[test]
    fn dtype_names_match_wire_strings() {
        let json = serde_json::to_string(&DataType::Uint16).unwrap();
        assert_eq!(json, "\"uint16\"");
        assert_eq!(DataType::Float32.to_string(), "float32");
    }
}
