// rust/batcher-core/src/array/mod.rs

//! Dense row-major arrays as loaded from shard files.
//!
//! An [`Array`] is an untyped little-endian buffer plus a dtype and shape.
//! Batching only ever works along the leading (row) axis, so the row
//! operations here are byte copies that never need to know the element type.

mod npy;

pub use npy::{decode_npy, encode_npy, write_npy};

use std::ops::Range;

use crate::error::{BatcherError, Result};

/// Element type of an [`Array`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DType {
    U8,
    I32,
    I64,
    F32,
    F64,
}

impl DType {
    /// Size of one element in bytes.
    pub fn size(self) -> usize {
        match self {
            DType::U8 => 1,
            DType::I32 | DType::F32 => 4,
            DType::I64 | DType::F64 => 8,
        }
    }

    /// The numpy type descriptor for this dtype.
    pub fn descr(self) -> &'static str {
        match self {
            DType::U8 => "|u1",
            DType::I32 => "<i4",
            DType::I64 => "<i8",
            DType::F32 => "<f4",
            DType::F64 => "<f8",
        }
    }

    /// Parses a numpy type descriptor such as `<f4`.
    pub fn from_descr(descr: &str) -> Result<Self> {
        let (order, kind) = match descr.chars().next() {
            Some(c @ ('<' | '>' | '|' | '=')) => (c, &descr[1..]),
            _ => ('|', descr),
        };
        if order == '>' {
            return Err(BatcherError::array(format!(
                "big-endian dtype '{descr}' is not supported"
            )));
        }
        match kind {
            "u1" | "b1" => Ok(DType::U8),
            "i4" => Ok(DType::I32),
            "i8" => Ok(DType::I64),
            "f4" => Ok(DType::F32),
            "f8" => Ok(DType::F64),
            _ => Err(BatcherError::array(format!("unsupported dtype '{descr}'"))),
        }
    }
}

/// A primitive that can be stored in an [`Array`].
pub trait Element: Copy + Send + Sync + 'static {
    const DTYPE: DType;

    fn extend_le(self, out: &mut Vec<u8>);

    fn from_le(bytes: &[u8]) -> Self;
}

macro_rules! impl_element {
    ($ty:ty, $dtype:expr) => {
        impl Element for $ty {
            const DTYPE: DType = $dtype;

            fn extend_le(self, out: &mut Vec<u8>) {
                out.extend_from_slice(&self.to_le_bytes());
            }

            fn from_le(bytes: &[u8]) -> Self {
                let mut raw = [0u8; std::mem::size_of::<$ty>()];
                raw.copy_from_slice(bytes);
                <$ty>::from_le_bytes(raw)
            }
        }
    };
}

impl_element!(u8, DType::U8);
impl_element!(i32, DType::I32);
impl_element!(i64, DType::I64);
impl_element!(f32, DType::F32);
impl_element!(f64, DType::F64);

/// A dense, row-major array with at least one dimension.
#[derive(Debug, Clone, PartialEq)]
pub struct Array {
    dtype: DType,
    shape: Vec<usize>,
    data: Vec<u8>,
}

impl Array {
    /// Wraps a little-endian byte buffer.
    ///
    /// # Errors
    ///
    /// Returns an error if the shape has no dimensions or the buffer length
    /// does not match the shape.
    pub fn from_bytes(dtype: DType, shape: Vec<usize>, data: Vec<u8>) -> Result<Self> {
        if shape.is_empty() {
            return Err(BatcherError::array("arrays must have at least one dimension"));
        }
        let expected = shape.iter().product::<usize>() * dtype.size();
        if data.len() != expected {
            return Err(BatcherError::array(format!(
                "shape {:?} of {:?} needs {} bytes, got {}",
                shape,
                dtype,
                expected,
                data.len()
            )));
        }
        Ok(Self { dtype, shape, data })
    }

    /// Builds an array from typed values.
    pub fn from_vec<T: Element>(shape: Vec<usize>, values: Vec<T>) -> Result<Self> {
        let mut data = Vec::with_capacity(values.len() * T::DTYPE.size());
        for value in values {
            value.extend_le(&mut data);
        }
        Self::from_bytes(T::DTYPE, shape, data)
    }

    /// Copies the elements out as typed values.
    ///
    /// # Errors
    ///
    /// Returns an error if `T` does not match the array's dtype.
    pub fn to_vec<T: Element>(&self) -> Result<Vec<T>> {
        if T::DTYPE != self.dtype {
            return Err(BatcherError::array(format!(
                "requested {:?} elements from a {:?} array",
                T::DTYPE,
                self.dtype
            )));
        }
        Ok(self
            .data
            .chunks_exact(self.dtype.size())
            .map(T::from_le)
            .collect())
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    /// Length of the leading dimension.
    pub fn rows(&self) -> usize {
        self.shape[0]
    }

    /// Bytes occupied by one row.
    pub fn row_bytes(&self) -> usize {
        self.shape[1..].iter().product::<usize>() * self.dtype.size()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }

    /// Copies out the rows in `range`.
    ///
    /// # Errors
    ///
    /// Returns an error if the range is reversed or extends past the last row.
    pub fn slice_rows(&self, range: Range<usize>) -> Result<Array> {
        if range.start > range.end || range.end > self.rows() {
            return Err(BatcherError::array(format!(
                "row range {}..{} out of bounds for {} rows",
                range.start,
                range.end,
                self.rows()
            )));
        }
        let row_bytes = self.row_bytes();
        let mut shape = self.shape.clone();
        shape[0] = range.len();
        Ok(Array {
            dtype: self.dtype,
            shape,
            data: self.data[range.start * row_bytes..range.end * row_bytes].to_vec(),
        })
    }

    /// Gathers rows in the given order, e.g. to apply a permutation.
    pub fn take_rows(&self, indices: &[usize]) -> Result<Array> {
        let rows = self.rows();
        let row_bytes = self.row_bytes();
        let mut data = Vec::with_capacity(indices.len() * row_bytes);
        for &idx in indices {
            if idx >= rows {
                return Err(BatcherError::array(format!(
                    "row index {idx} out of bounds for {rows} rows"
                )));
            }
            data.extend_from_slice(&self.data[idx * row_bytes..(idx + 1) * row_bytes]);
        }
        let mut shape = self.shape.clone();
        shape[0] = indices.len();
        Ok(Array {
            dtype: self.dtype,
            shape,
            data,
        })
    }

    /// Appends the rows of `other` after the rows of `self`.
    ///
    /// For 1-D arrays this is a flat concatenation; for higher ranks the
    /// arrays are stacked along axis 0 and every trailing dimension must
    /// agree. Both come down to appending row-major buffers.
    pub fn concat_rows(&self, other: &Array) -> Result<Array> {
        if self.dtype != other.dtype {
            return Err(BatcherError::array(format!(
                "cannot concatenate {:?} rows onto a {:?} array",
                other.dtype, self.dtype
            )));
        }
        if self.shape[1..] != other.shape[1..] {
            return Err(BatcherError::array(format!(
                "cannot concatenate shape {:?} onto shape {:?}",
                other.shape, self.shape
            )));
        }
        let mut data = Vec::with_capacity(self.data.len() + other.data.len());
        data.extend_from_slice(&self.data);
        data.extend_from_slice(&other.data);
        let mut shape = self.shape.clone();
        shape[0] += other.shape[0];
        Ok(Array {
            dtype: self.dtype,
            shape,
            data,
        })
    }
}
