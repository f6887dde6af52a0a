// ============================================================
// Layer 4 — MATLAB Level 5 Reader
// ============================================================
// Just enough of the MAT v5 container to pull point matrices
// out of crowd-counting ground-truth files:
//
//   [128-byte header: text | subsys | version | "IM"/"MI"]
//   data element*
//
//   data element = tag (type u32, size u32) + payload, padded to 8
//                  small form: size in the tag's upper 16 bits,
//                              payload in the tag's second word
//
//   miCOMPRESSED  zlib stream holding one more data element
//   miMATRIX      flags, dims, name, then by class:
//                   numeric  real part (imaginary part ignored)
//                   cell     one miMATRIX per element
//                   struct   field-name width, names, then one
//                            miMATRIX per element per field
//
// Arrays are column-major, as MATLAB stores them. Numeric data
// is widened to f64 whatever type it was stored in. Char,
// sparse and object arrays are read past and left opaque.
// MATLAB 7.3 files are HDF5 underneath and are rejected.
//
// Reference: MATLAB "MAT-File Format" (Level 5), flate2 ZlibDecoder

use flate2::read::ZlibDecoder;
use std::io::Read;
use thiserror::Error;

const HEADER_LEN: usize = 128;

// Data types
const MI_INT8: u32 = 1;
const MI_UINT8: u32 = 2;
const MI_INT16: u32 = 3;
const MI_UINT16: u32 = 4;
const MI_INT32: u32 = 5;
const MI_UINT32: u32 = 6;
const MI_SINGLE: u32 = 7;
const MI_DOUBLE: u32 = 9;
const MI_INT64: u32 = 12;
const MI_UINT64: u32 = 13;
const MI_MATRIX: u32 = 14;
const MI_COMPRESSED: u32 = 15;

// Array classes
const MX_CELL: u32 = 1;
const MX_STRUCT: u32 = 2;
const MX_DOUBLE: u32 = 6;
const MX_UINT64: u32 = 15;

#[derive(Debug, Error)]
pub enum MatError {
    #[error("not a MAT v5 file: {0}")]
    Header(String),

    #[error("truncated element at byte {0}")]
    Truncated(usize),

    #[error("unexpected data type {found} for {what}")]
    DataType { what: &'static str, found: u32 },

    #[error("malformed array: {0}")]
    Malformed(String),

    #[error("cannot inflate compressed element: {0}")]
    Inflate(#[from] std::io::Error),
}

/// One MATLAB value, reduced to what point extraction needs.
#[derive(Debug, Clone, PartialEq)]
pub enum MatValue {
    Numeric { dims: Vec<usize>, data: Vec<f64> },
    Cell { dims: Vec<usize>, items: Vec<MatValue> },
    /// `items[element][field]`
    Struct { dims: Vec<usize>, fields: Vec<String>, items: Vec<Vec<MatValue>> },
    Opaque,
}

impl MatValue {
    /// First element of a cell, or the value itself.
    pub fn first_cell(&self) -> Option<&MatValue> {
        match self {
            MatValue::Cell { items, .. } => items.first(),
            other => Some(other),
        }
    }

    /// `name` on the first element of a struct array.
    pub fn field(&self, name: &str) -> Option<&MatValue> {
        match self {
            MatValue::Struct { fields, items, .. } => {
                let i = fields.iter().position(|f| f == name)?;
                items.first()?.get(i)
            }
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct MatFile {
    vars: Vec<(String, MatValue)>,
}

impl MatFile {
    pub fn parse(bytes: &[u8]) -> Result<Self, MatError> {
        if bytes.len() < HEADER_LEN {
            return Err(MatError::Header(format!("{} bytes is shorter than the header", bytes.len())));
        }
        if bytes.starts_with(b"MATLAB 7.3") {
            return Err(MatError::Header("MATLAB 7.3 files are HDF5; save with -v7".into()));
        }
        let big_endian = match &bytes[126..128] {
            b"IM" => false,
            b"MI" => true,
            other => return Err(MatError::Header(format!("bad endian indicator {other:?}"))),
        };

        let mut vars = Vec::new();
        let mut cur = Cursor { buf: bytes, pos: HEADER_LEN, big_endian };
        while cur.pos < bytes.len() {
            let (ty, payload) = cur.element()?;
            match ty {
                MI_MATRIX => vars.push(parse_matrix(payload, big_endian)?),
                MI_COMPRESSED => {
                    let mut inflated = Vec::new();
                    ZlibDecoder::new(payload).read_to_end(&mut inflated)?;
                    let mut inner = Cursor { buf: &inflated, pos: 0, big_endian };
                    let (ty, payload) = inner.element()?;
                    if ty == MI_MATRIX {
                        vars.push(parse_matrix(payload, big_endian)?);
                    }
                }
                _ => {}
            }
        }
        Ok(Self { vars })
    }

    pub fn get(&self, name: &str) -> Option<&MatValue> {
        self.vars.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.vars.iter().map(|(n, _)| n.as_str())
    }
}

// ─── Element cursor ───────────────────────────────────────────────────────────
struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
    big_endian: bool,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], MatError> {
        let end = self.pos.checked_add(n).filter(|&e| e <= self.buf.len());
        let end = end.ok_or(MatError::Truncated(self.pos))?;
        let out = &self.buf[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    fn u32(&mut self) -> Result<u32, MatError> {
        let bytes = self.take(4)?;
        Ok(u32::from_le_bytes(ordered::<4>(bytes, self.big_endian)))
    }

    /// Next data element as (type, payload).
    fn element(&mut self) -> Result<(u32, &'a [u8]), MatError> {
        let word = self.u32()?;
        if word >> 16 != 0 {
            let (ty, size) = (word & 0xFFFF, (word >> 16) as usize);
            if size > 4 {
                return Err(MatError::Malformed(format!("small element claims {size} bytes")));
            }
            let payload = self.take(4)?;
            return Ok((ty, &payload[..size]));
        }

        let size = self.u32()? as usize;
        let payload = self.take(size)?;
        if word != MI_COMPRESSED {
            self.pos = (self.pos + 7) & !7;
        }
        Ok((word, payload))
    }
}

/// Copy `N` bytes into little-endian order.
fn ordered<const N: usize>(bytes: &[u8], big_endian: bool) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&bytes[..N]);
    if big_endian {
        out.reverse();
    }
    out
}

fn numbers(ty: u32, bytes: &[u8], big: bool) -> Result<Vec<f64>, MatError> {
    let width = match ty {
        MI_INT8 | MI_UINT8 => 1,
        MI_INT16 | MI_UINT16 => 2,
        MI_INT32 | MI_UINT32 | MI_SINGLE => 4,
        MI_DOUBLE | MI_INT64 | MI_UINT64 => 8,
        found => return Err(MatError::DataType { what: "numeric data", found }),
    };
    if bytes.len() % width != 0 {
        return Err(MatError::Malformed(format!("{} bytes is not a multiple of {width}", bytes.len())));
    }

    Ok(bytes
        .chunks_exact(width)
        .map(|c| match ty {
            MI_INT8 => c[0] as i8 as f64,
            MI_UINT8 => c[0] as f64,
            MI_INT16 => i16::from_le_bytes(ordered(c, big)) as f64,
            MI_UINT16 => u16::from_le_bytes(ordered(c, big)) as f64,
            MI_INT32 => i32::from_le_bytes(ordered(c, big)) as f64,
            MI_UINT32 => u32::from_le_bytes(ordered(c, big)) as f64,
            MI_SINGLE => f32::from_le_bytes(ordered(c, big)) as f64,
            MI_INT64 => i64::from_le_bytes(ordered(c, big)) as f64,
            MI_UINT64 => u64::from_le_bytes(ordered(c, big)) as f64,
            _ => f64::from_le_bytes(ordered(c, big)),
        })
        .collect())
}

fn parse_matrix(payload: &[u8], big_endian: bool) -> Result<(String, MatValue), MatError> {
    // MATLAB writes empty cell slots as zero-length matrices
    if payload.is_empty() {
        return Ok((String::new(), MatValue::Numeric { dims: vec![0, 0], data: Vec::new() }));
    }
    let mut cur = Cursor { buf: payload, pos: 0, big_endian };

    let (ty, flags) = cur.element()?;
    if ty != MI_UINT32 || flags.len() < 4 {
        return Err(MatError::DataType { what: "array flags", found: ty });
    }
    let class = u32::from_le_bytes(ordered::<4>(flags, big_endian)) & 0xFF;

    let (ty, raw_dims) = cur.element()?;
    if ty != MI_INT32 {
        return Err(MatError::DataType { what: "dimensions", found: ty });
    }
    let dims = numbers(ty, raw_dims, big_endian)?
        .into_iter()
        .map(|d| if d < 0.0 { Err(MatError::Malformed(format!("negative dimension {d}"))) } else { Ok(d as usize) })
        .collect::<Result<Vec<_>, _>>()?;
    let len: usize = dims.iter().product();

    let (_, raw_name) = cur.element()?;
    let name = String::from_utf8_lossy(raw_name).into_owned();

    let value = match class {
        MX_DOUBLE..=MX_UINT64 => {
            let (ty, real) = cur.element()?;
            let data = numbers(ty, real, big_endian)?;
            if data.len() != len {
                return Err(MatError::Malformed(format!(
                    "'{name}' is {dims:?} but holds {} values",
                    data.len()
                )));
            }
            MatValue::Numeric { dims, data }
        }
        MX_CELL => {
            let items = (0..len)
                .map(|_| nested_matrix(&mut cur, big_endian))
                .collect::<Result<Vec<_>, _>>()?;
            MatValue::Cell { dims, items }
        }
        MX_STRUCT => {
            let (_, raw_width) = cur.element()?;
            let width = numbers(MI_INT32, raw_width, big_endian)?
                .first()
                .map(|&w| w as usize)
                .filter(|&w| w > 0)
                .ok_or_else(|| MatError::Malformed("struct field name width is zero".into()))?;
            let (_, raw_fields) = cur.element()?;
            let fields: Vec<String> = raw_fields
                .chunks(width)
                .map(|c| String::from_utf8_lossy(c).trim_end_matches('\0').to_string())
                .collect();
            let items = (0..len)
                .map(|_| {
                    (0..fields.len())
                        .map(|_| nested_matrix(&mut cur, big_endian))
                        .collect::<Result<Vec<_>, _>>()
                })
                .collect::<Result<Vec<_>, _>>()?;
            MatValue::Struct { dims, fields, items }
        }
        _ => MatValue::Opaque,
    };
    Ok((name, value))
}

fn nested_matrix(cur: &mut Cursor<'_>, big_endian: bool) -> Result<MatValue, MatError> {
    let (ty, payload) = cur.element()?;
    if ty != MI_MATRIX {
        return Err(MatError::DataType { what: "cell or field content", found: ty });
    }
    parse_matrix(payload, big_endian).map(|(_, v)| v)
}
