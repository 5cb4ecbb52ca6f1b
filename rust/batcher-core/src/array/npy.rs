// rust/batcher-core/src/array/npy.rs

//! Reading and writing `.npy` array files.
//!
//! Only little-endian, C-ordered arrays of the dtypes in [`DType`] are
//! supported, which covers what preprocessing pipelines write for training
//! shards.

use std::io::Write;
use std::path::Path;

use super::{Array, DType};
use crate::error::{BatcherError, Result};
use crate::storage::StorageBackend;

const MAGIC: &[u8] = b"\x93NUMPY";

/// Header plus preamble is padded to a multiple of this.
const HEADER_ALIGN: usize = 64;

/// Decodes an `.npy` file image.
///
/// # Errors
///
/// Returns an error for a bad magic string, an unsupported version, dtype
/// or memory order, or a payload that does not match the declared shape.
pub fn decode_npy(bytes: &[u8]) -> Result<Array> {
    if bytes.len() < 10 || &bytes[..6] != MAGIC {
        return Err(BatcherError::array("not an npy file (bad magic)"));
    }

    let major = bytes[6];
    let (header_len, header_start) = match major {
        1 => (u16::from_le_bytes([bytes[8], bytes[9]]) as usize, 10),
        2 | 3 => {
            if bytes.len() < 12 {
                return Err(BatcherError::array("truncated npy preamble"));
            }
            let len = u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]);
            (len as usize, 12)
        }
        _ => {
            return Err(BatcherError::array(format!(
                "unsupported npy format version {major}"
            )))
        }
    };

    let data_start = header_start + header_len;
    if bytes.len() < data_start {
        return Err(BatcherError::array("truncated npy header"));
    }
    let header = std::str::from_utf8(&bytes[header_start..data_start])
        .map_err(|_| BatcherError::array("npy header is not valid text"))?;
    let header = NpyHeader::parse(header)?;

    if header.fortran_order {
        return Err(BatcherError::array("fortran-ordered arrays are not supported"));
    }

    Array::from_bytes(header.dtype, header.shape, bytes[data_start..].to_vec())
}

/// Encodes an array as a version 1.0 `.npy` file image.
pub fn encode_npy(array: &Array) -> Vec<u8> {
    let shape = match array.shape() {
        [rows] => format!("({rows},)"),
        dims => format!(
            "({})",
            dims.iter()
                .map(|d| d.to_string())
                .collect::<Vec<_>>()
                .join(", ")
        ),
    };
    let mut header = format!(
        "{{'descr': '{}', 'fortran_order': False, 'shape': {}, }}",
        array.dtype().descr(),
        shape
    );

    // magic (6) + version (2) + header length (2) + header + '\n'
    let unpadded = 10 + header.len() + 1;
    let padding = (HEADER_ALIGN - unpadded % HEADER_ALIGN) % HEADER_ALIGN;
    header.extend(std::iter::repeat(' ').take(padding));
    header.push('\n');

    let mut out = Vec::with_capacity(10 + header.len() + array.as_bytes().len());
    out.extend_from_slice(MAGIC);
    out.extend_from_slice(&[1, 0]);
    out.extend_from_slice(&(header.len() as u16).to_le_bytes());
    out.extend_from_slice(header.as_bytes());
    out.extend_from_slice(array.as_bytes());
    out
}

/// Writes an array to `path` through a storage backend.
pub fn write_npy(storage: &dyn StorageBackend, path: &Path, array: &Array) -> Result<()> {
    let mut writer = storage.open_write(path)?;
    writer
        .write_all(&encode_npy(array))
        .map_err(|e| BatcherError::storage_with_source(path, "failed to write npy file", e))?;
    writer.finish()
}

#[derive(Debug)]
struct NpyHeader {
    dtype: DType,
    fortran_order: bool,
    shape: Vec<usize>,
}

impl NpyHeader {
    /// Parses the python dict literal numpy writes, e.g.
    /// `{'descr': '<f4', 'fortran_order': False, 'shape': (10, 3), }`.
    fn parse(text: &str) -> Result<Self> {
        let text = text.replace('"', "'");

        let descr = value_after(&text, "'descr'")?;
        let descr = descr
            .strip_prefix('\'')
            .and_then(|rest| rest.split('\'').next())
            .ok_or_else(|| BatcherError::array("npy header has a malformed descr"))?;
        let dtype = DType::from_descr(descr)?;

        let fortran_order = value_after(&text, "'fortran_order'")?.starts_with("True");

        let shape_text = value_after(&text, "'shape'")?;
        let shape_text = shape_text
            .strip_prefix('(')
            .and_then(|rest| rest.split(')').next())
            .ok_or_else(|| BatcherError::array("npy header has a malformed shape"))?;
        let shape = shape_text
            .split(',')
            .map(str::trim)
            .filter(|dim| !dim.is_empty())
            .map(|dim| {
                dim.trim_end_matches('L').parse::<usize>().map_err(|_| {
                    BatcherError::array(format!("npy header has a bad dimension '{dim}'"))
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            dtype,
            fortran_order,
            shape,
        })
    }
}

fn value_after<'a>(text: &'a str, key: &str) -> Result<&'a str> {
    let pos = text
        .find(key)
        .ok_or_else(|| BatcherError::array(format!("npy header is missing {key}")))?;
    let rest = &text[pos + key.len()..];
    let rest = rest
        .trim_start()
        .strip_prefix(':')
        .ok_or_else(|| BatcherError::array(format!("npy header has no value for {key}")))?;
    Ok(rest.trim_start())
}
