use std::fmt;
use std::str::FromStr;

use half::{bf16, f16};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::tensor::Storage;

// DType: Element data types
//
// Every tensor carries a DType that determines its element size. The dtype is
// also one component of the kernel dispatch key, so kernels are registered
// once per concrete Rust element type and picked at call time.
//
//   F16    16-bit IEEE half float
//   BF16   16-bit brain float
//   F32    32-bit float, the default workhorse
//   F64    64-bit float
//   I32    signed 32-bit int, CSR offsets/columns and indices
//   I64    signed 64-bit int, indices
//   U8     unsigned byte, raw masks

/// Enum of all supported element data types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum DType {
    F16,
    BF16,
    F32,
    F64,
    I32,
    I64,
    U8,
}

impl DType {
    pub const ALL: [DType; 7] = [
        DType::F16,
        DType::BF16,
        DType::F32,
        DType::F64,
        DType::I32,
        DType::I64,
        DType::U8,
    ];

    /// Size of one element in bytes.
    pub fn size_in_bytes(&self) -> usize {
        match self {
            DType::F16 | DType::BF16 => 2,
            DType::F32 | DType::I32 => 4,
            DType::F64 | DType::I64 => 8,
            DType::U8 => 1,
        }
    }

    pub fn is_float(&self) -> bool {
        matches!(self, DType::F16 | DType::BF16 | DType::F32 | DType::F64)
    }

    /// Whether this is a half-precision type (F16 or BF16).
    pub fn is_half(&self) -> bool {
        matches!(self, DType::F16 | DType::BF16)
    }

    /// Integer types accepted as gather/scatter indices.
    pub fn is_index(&self) -> bool {
        matches!(self, DType::I32 | DType::I64)
    }

    /// Canonical declaration spelling ("float32", "bfloat16", ...).
    pub fn as_str(&self) -> &'static str {
        match self {
            DType::F16 => "float16",
            DType::BF16 => "bfloat16",
            DType::F32 => "float32",
            DType::F64 => "float64",
            DType::I32 => "int32",
            DType::I64 => "int64",
            DType::U8 => "uint8",
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DType {
    type Err = Error;

    /// Accepts "float32", "f32", "FLOAT32" and "DataType::FLOAT32".
    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let s = s.strip_prefix("DataType::").unwrap_or(s);
        let dtype = match s.to_ascii_lowercase().as_str() {
            "float16" | "f16" | "half" => DType::F16,
            "bfloat16" | "bf16" => DType::BF16,
            "float32" | "f32" | "float" => DType::F32,
            "float64" | "f64" | "double" => DType::F64,
            "int32" | "i32" => DType::I32,
            "int64" | "i64" => DType::I64,
            "uint8" | "u8" => DType::U8,
            other => return Err(Error::invalid(format!("unknown dtype '{other}'"))),
        };
        Ok(dtype)
    }
}

impl TryFrom<String> for DType {
    type Error = Error;
    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<DType> for String {
    fn from(d: DType) -> Self {
        d.as_str().to_string()
    }
}

// WithDType: Bridge between Rust element types and the DType enum
//
// Kernels are written once as generic functions over `T: WithDType` and
// registered per concrete T. The trait also knows how to find a `Vec<T>`
// inside the type-erased `Storage` enum, which is what makes typed buffer
// access checked rather than a reinterpret cast.

/// Trait implemented by Rust types that can be stored in a tensor.
pub trait WithDType:
    Copy + Send + Sync + PartialEq + 'static + num_traits::NumCast + fmt::Debug
{
    /// The corresponding DType enum variant.
    const DTYPE: DType;

    fn to_f64(self) -> f64;

    fn from_f64(v: f64) -> Self;

    fn zero() -> Self {
        Self::from_f64(0.0)
    }

    fn one() -> Self {
        Self::from_f64(1.0)
    }

    /// Addition that is defined for every input: integers wrap on overflow,
    /// floats add normally.
    fn wrapping_add(self, rhs: Self) -> Self;

    /// Borrow the storage as `&[Self]` if it holds this element type.
    fn slice(storage: &Storage) -> Option<&[Self]>;

    fn slice_mut(storage: &mut Storage) -> Option<&mut [Self]>;

    fn into_storage(data: Vec<Self>) -> Storage;

    /// Take the vector back out of a storage of this element type.
    fn from_storage(storage: Storage) -> Option<Vec<Self>>;
}

macro_rules! impl_with_dtype {
    ($ty:ty, $dtype:ident, $variant:ident, $to:expr, $from:expr, $add:expr) => {
        impl WithDType for $ty {
            const DTYPE: DType = DType::$dtype;

            fn to_f64(self) -> f64 {
                $to(self)
            }

            fn from_f64(v: f64) -> Self {
                $from(v)
            }

            fn wrapping_add(self, rhs: Self) -> Self {
                $add(self, rhs)
            }

            fn slice(storage: &Storage) -> Option<&[Self]> {
                match storage {
                    Storage::$variant(v) => Some(v.as_slice()),
                    _ => None,
                }
            }

            fn slice_mut(storage: &mut Storage) -> Option<&mut [Self]> {
                match storage {
                    Storage::$variant(v) => Some(v.as_mut_slice()),
                    _ => None,
                }
            }

            fn into_storage(data: Vec<Self>) -> Storage {
                Storage::$variant(data)
            }

            fn from_storage(storage: Storage) -> Option<Vec<Self>> {
                match storage {
                    Storage::$variant(v) => Some(v),
                    _ => None,
                }
            }
        }
    };
}

impl_with_dtype!(f16, F16, F16, |v: f16| v.to_f64(), f16::from_f64, |a: f16, b: f16| a + b);
impl_with_dtype!(bf16, BF16, BF16, |v: bf16| v.to_f64(), bf16::from_f64, |a: bf16, b: bf16| a + b);
impl_with_dtype!(f32, F32, F32, |v: f32| v as f64, |v: f64| v as f32, |a: f32, b: f32| a + b);
impl_with_dtype!(f64, F64, F64, |v: f64| v, |v: f64| v, |a: f64, b: f64| a + b);
impl_with_dtype!(i32, I32, I32, |v: i32| v as f64, |v: f64| v as i32, i32::wrapping_add);
impl_with_dtype!(i64, I64, I64, |v: i64| v as f64, |v: f64| v as i64, i64::wrapping_add);
impl_with_dtype!(u8, U8, U8, |v: u8| v as f64, |v: f64| v as u8, u8::wrapping_add);

// FloatDType: Floating element types with a wider accumulator
//
// Reduced-precision storage types accumulate in f32; f64 accumulates in f64.
// Kernels widen every operand, accumulate, and narrow once when writing the
// output, so the rounding error of a long reduction is bounded by the
// accumulator precision rather than the storage precision.

/// Float element type paired with the accumulator kernels reduce in.
pub trait FloatDType: WithDType {
    type Accum: num_traits::Float
        + std::ops::AddAssign
        + std::iter::Sum
        + WithDType
        + Send
        + Sync;

    fn widen(self) -> Self::Accum;

    fn narrow(acc: Self::Accum) -> Self;
}

impl FloatDType for f16 {
    type Accum = f32;
    fn widen(self) -> f32 {
        self.to_f32()
    }
    fn narrow(acc: f32) -> Self {
        f16::from_f32(acc)
    }
}

impl FloatDType for bf16 {
    type Accum = f32;
    fn widen(self) -> f32 {
        self.to_f32()
    }
    fn narrow(acc: f32) -> Self {
        bf16::from_f32(acc)
    }
}

impl FloatDType for f32 {
    type Accum = f32;
    fn widen(self) -> f32 {
        self
    }
    fn narrow(acc: f32) -> Self {
        acc
    }
}

impl FloatDType for f64 {
    type Accum = f64;
    fn widen(self) -> f64 {
        self
    }
    fn narrow(acc: f64) -> Self {
        acc
    }
}

/// Integer element types usable as indices.
pub trait IndexDType: WithDType {
    fn as_i64(self) -> i64;
}

impl IndexDType for i32 {
    fn as_i64(self) -> i64 {
        self as i64
    }
}

impl IndexDType for i64 {
    fn as_i64(self) -> i64 {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dtype_size() {
        assert_eq!(DType::F16.size_in_bytes(), 2);
        assert_eq!(DType::BF16.size_in_bytes(), 2);
        assert_eq!(DType::F32.size_in_bytes(), 4);
        assert_eq!(DType::I64.size_in_bytes(), 8);
        assert_eq!(DType::U8.size_in_bytes(), 1);
    }

    #[test]
    fn test_dtype_parse_spellings() {
        assert_eq!("float32".parse::<DType>().unwrap(), DType::F32);
        assert_eq!("DataType::BFLOAT16".parse::<DType>().unwrap(), DType::BF16);
        assert_eq!("i64".parse::<DType>().unwrap(), DType::I64);
        assert!("complex64".parse::<DType>().is_err());
        for d in DType::ALL {
            assert_eq!(d.as_str().parse::<DType>().unwrap(), d);
        }
    }

    #[test]
    fn test_index_dtypes() {
        assert!(DType::I32.is_index());
        assert!(DType::I64.is_index());
        assert!(!DType::F32.is_index());
        assert!(!DType::U8.is_index());
    }

    #[test]
    fn test_wrapping_add_is_defined_on_overflow() {
        assert_eq!(WithDType::wrapping_add(i32::MAX, 1), i32::MIN);
        assert_eq!(WithDType::wrapping_add(i64::MAX, 2), i64::MIN + 1);
        assert_eq!(WithDType::wrapping_add(255u8, 1), 0);
        assert_eq!(WithDType::wrapping_add(1.5f32, 2.0), 3.5);
        assert_eq!(WithDType::wrapping_add(f16::MAX, f16::MAX), f16::INFINITY);
    }

    #[test]
    fn test_storage_roundtrip_is_typed() {
        let s = f32::into_storage(vec![1.0, 2.0]);
        assert_eq!(f32::slice(&s), Some(&[1.0f32, 2.0][..]));
        assert!(f64::slice(&s).is_none());
        assert_eq!(f32::from_storage(s), Some(vec![1.0, 2.0]));
    }

    #[test]
    fn test_half_widens_to_f32() {
        let h = f16::from_f32(1.5);
        assert_eq!(h.widen(), 1.5f32);
        assert_eq!(<bf16 as FloatDType>::narrow(2.0), bf16::from_f32(2.0));
    }
}
