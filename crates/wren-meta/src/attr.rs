use std::collections::BTreeMap;
use std::fmt;

use wren_core::{DType, Error, Result};

// Attributes: Typed non-tensor operator arguments
//
// Declarations spell attribute types the way the original framework does
// (`int`, `int64_t`, `float`, `int[]`, `str`, `DataType`, ...) and give
// defaults as C++-flavoured literals (`1`, `0.5f`, `"EXPLICIT"`, `{1, 1}`,
// `{}`). Parsing a default must yield a value of exactly the declared type,
// so a bad literal is caught when the schema is loaded, not when the op
// first runs.

/// Declared type of an attribute argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AttrType {
    Int,
    Float,
    Bool,
    Str,
    IntArray,
    FloatArray,
    BoolArray,
    StrArray,
    DataType,
}

impl AttrType {
    /// Parse a declaration type spelling. Returns `None` for unknown types.
    pub fn parse(ty: &str) -> Option<AttrType> {
        let t = match ty.trim() {
            "int" | "int64_t" | "int32_t" | "long" => AttrType::Int,
            "float" | "double" => AttrType::Float,
            "bool" => AttrType::Bool,
            "str" | "string" | "std::string" => AttrType::Str,
            "int[]" | "int64_t[]" | "IntArray" => AttrType::IntArray,
            "float[]" | "double[]" => AttrType::FloatArray,
            "bool[]" => AttrType::BoolArray,
            "str[]" | "string[]" => AttrType::StrArray,
            "DataType" => AttrType::DataType,
            _ => return None,
        };
        Some(t)
    }

    pub fn is_array(&self) -> bool {
        matches!(
            self,
            AttrType::IntArray | AttrType::FloatArray | AttrType::BoolArray | AttrType::StrArray
        )
    }

    fn element(&self) -> AttrType {
        match self {
            AttrType::IntArray => AttrType::Int,
            AttrType::FloatArray => AttrType::Float,
            AttrType::BoolArray => AttrType::Bool,
            AttrType::StrArray => AttrType::Str,
            other => *other,
        }
    }
}

impl fmt::Display for AttrType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AttrType::Int => "int",
            AttrType::Float => "float",
            AttrType::Bool => "bool",
            AttrType::Str => "str",
            AttrType::IntArray => "int[]",
            AttrType::FloatArray => "float[]",
            AttrType::BoolArray => "bool[]",
            AttrType::StrArray => "str[]",
            AttrType::DataType => "DataType",
        };
        f.write_str(s)
    }
}

/// A concrete attribute value.
#[derive(Debug, Clone, PartialEq)]
pub enum AttrValue {
    Int(i64),
    Float(f64),
    Bool(bool),
    Str(String),
    IntArray(Vec<i64>),
    FloatArray(Vec<f64>),
    BoolArray(Vec<bool>),
    StrArray(Vec<String>),
    DataType(DType),
}

impl AttrValue {
    pub fn attr_type(&self) -> AttrType {
        match self {
            AttrValue::Int(_) => AttrType::Int,
            AttrValue::Float(_) => AttrType::Float,
            AttrValue::Bool(_) => AttrType::Bool,
            AttrValue::Str(_) => AttrType::Str,
            AttrValue::IntArray(_) => AttrType::IntArray,
            AttrValue::FloatArray(_) => AttrType::FloatArray,
            AttrValue::BoolArray(_) => AttrType::BoolArray,
            AttrValue::StrArray(_) => AttrType::StrArray,
            AttrValue::DataType(_) => AttrType::DataType,
        }
    }

    /// Convert to `ty` where the conversion is lossless: an int where a
    /// float is declared, int arrays to float arrays. Everything else must
    /// already match.
    pub fn coerce(self, ty: AttrType) -> Option<AttrValue> {
        match (self, ty) {
            (v, t) if v.attr_type() == t => Some(v),
            (AttrValue::Int(i), AttrType::Float) => Some(AttrValue::Float(i as f64)),
            (AttrValue::IntArray(v), AttrType::FloatArray) => {
                Some(AttrValue::FloatArray(v.into_iter().map(|i| i as f64).collect()))
            }
            (AttrValue::Str(s), AttrType::DataType) => s.parse().ok().map(AttrValue::DataType),
            _ => None,
        }
    }

    /// Parse a default literal of declared type `ty`.
    pub fn parse_literal(ty: AttrType, literal: &str) -> Result<AttrValue> {
        let lit = literal.trim();
        if ty.is_array() {
            let inner = lit
                .strip_prefix('{')
                .and_then(|s| s.strip_suffix('}'))
                .or_else(|| lit.strip_prefix('[').and_then(|s| s.strip_suffix(']')))
                .ok_or_else(|| {
                    Error::invalid(format!("array literal must be '{{..}}' or '[..]', got '{lit}'"))
                })?;
            let elem_ty = ty.element();
            let items = split_top_level(inner)
                .into_iter()
                .filter(|s| !s.trim().is_empty())
                .map(|s| parse_scalar(elem_ty, s))
                .collect::<Result<Vec<_>>>()?;
            return Ok(match ty {
                AttrType::IntArray => AttrValue::IntArray(items.into_iter().filter_map(|v| v.as_int()).collect()),
                AttrType::FloatArray => {
                    AttrValue::FloatArray(items.into_iter().filter_map(|v| v.as_float()).collect())
                }
                AttrType::BoolArray => {
                    AttrValue::BoolArray(items.into_iter().filter_map(|v| v.as_bool()).collect())
                }
                _ => AttrValue::StrArray(
                    items
                        .into_iter()
                        .filter_map(|v| v.as_str().map(str::to_string))
                        .collect(),
                ),
            });
        }
        parse_scalar(ty, lit)
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            AttrValue::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            AttrValue::Float(f) => Some(*f),
            AttrValue::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            AttrValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            AttrValue::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_ints(&self) -> Option<&[i64]> {
        match self {
            AttrValue::IntArray(v) => Some(v),
            _ => None,
        }
    }
}

fn parse_scalar(ty: AttrType, lit: &str) -> Result<AttrValue> {
    let lit = lit.trim();
    let bad = || Error::invalid(format!("'{lit}' is not a valid {ty} literal"));
    match ty {
        AttrType::Int => lit.parse::<i64>().map(AttrValue::Int).map_err(|_| bad()),
        AttrType::Float => {
            let num = lit.trim_end_matches(['f', 'F']);
            num.parse::<f64>().map(AttrValue::Float).map_err(|_| bad())
        }
        AttrType::Bool => match lit {
            "true" => Ok(AttrValue::Bool(true)),
            "false" => Ok(AttrValue::Bool(false)),
            _ => Err(bad()),
        },
        AttrType::Str => unquote(lit).map(|s| AttrValue::Str(s.to_string())).ok_or_else(bad),
        AttrType::DataType => lit.parse::<DType>().map(AttrValue::DataType).map_err(|_| bad()),
        _ => Err(bad()),
    }
}

fn unquote(lit: &str) -> Option<&str> {
    lit.strip_prefix('"')
        .and_then(|s| s.strip_suffix('"'))
        .or_else(|| lit.strip_prefix('\'').and_then(|s| s.strip_suffix('\'')))
}

/// Split on commas that are not inside quotes, braces, brackets or parens.
pub(crate) fn split_top_level(s: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0i32;
    let mut quote: Option<char> = None;
    let mut start = 0;
    for (i, c) in s.char_indices() {
        match (quote, c) {
            (Some(q), c) if c == q => quote = None,
            (Some(_), _) => {}
            (None, '"' | '\'') => quote = Some(c),
            (None, '{' | '[' | '(' | '<') => depth += 1,
            (None, '}' | ']' | ')' | '>') => depth -= 1,
            (None, ',') if depth == 0 => {
                parts.push(&s[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(&s[start..]);
    parts
}

impl From<i64> for AttrValue {
    fn from(v: i64) -> Self {
        AttrValue::Int(v)
    }
}

impl From<i32> for AttrValue {
    fn from(v: i32) -> Self {
        AttrValue::Int(v as i64)
    }
}

impl From<f64> for AttrValue {
    fn from(v: f64) -> Self {
        AttrValue::Float(v)
    }
}

impl From<bool> for AttrValue {
    fn from(v: bool) -> Self {
        AttrValue::Bool(v)
    }
}

impl From<&str> for AttrValue {
    fn from(v: &str) -> Self {
        AttrValue::Str(v.to_string())
    }
}

impl From<String> for AttrValue {
    fn from(v: String) -> Self {
        AttrValue::Str(v)
    }
}

impl From<Vec<i64>> for AttrValue {
    fn from(v: Vec<i64>) -> Self {
        AttrValue::IntArray(v)
    }
}

impl<const N: usize> From<[i64; N]> for AttrValue {
    fn from(v: [i64; N]) -> Self {
        AttrValue::IntArray(v.to_vec())
    }
}

impl From<Vec<f64>> for AttrValue {
    fn from(v: Vec<f64>) -> Self {
        AttrValue::FloatArray(v)
    }
}

impl From<DType> for AttrValue {
    fn from(v: DType) -> Self {
        AttrValue::DataType(v)
    }
}

/// Resolved attributes of one call, keyed by name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AttrMap(BTreeMap<String, AttrValue>);

impl AttrMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<AttrValue>) {
        self.0.insert(name.into(), value.into());
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<AttrValue>) -> Self {
        self.insert(name, value);
        self
    }

    pub fn get(&self, name: &str) -> Option<&AttrValue> {
        self.0.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &AttrValue)> {
        self.0.iter()
    }

    fn require(&self, name: &str) -> Result<&AttrValue> {
        self.0
            .get(name)
            .ok_or_else(|| Error::invalid(format!("missing attribute '{name}'")))
    }

    fn typed<'a, T>(&'a self, name: &str, ty: AttrType, f: impl Fn(&'a AttrValue) -> Option<T>) -> Result<T> {
        let v = self.require(name)?;
        f(v).ok_or_else(|| {
            Error::invalid(format!(
                "attribute '{name}' is {}, expected {ty}",
                v.attr_type()
            ))
        })
    }

    pub fn int(&self, name: &str) -> Result<i64> {
        self.typed(name, AttrType::Int, AttrValue::as_int)
    }

    pub fn float(&self, name: &str) -> Result<f64> {
        self.typed(name, AttrType::Float, AttrValue::as_float)
    }

    pub fn bool(&self, name: &str) -> Result<bool> {
        self.typed(name, AttrType::Bool, AttrValue::as_bool)
    }

    pub fn str(&self, name: &str) -> Result<&str> {
        self.typed(name, AttrType::Str, AttrValue::as_str)
    }

    pub fn ints(&self, name: &str) -> Result<&[i64]> {
        self.typed(name, AttrType::IntArray, AttrValue::as_ints)
    }

    /// Integer array attribute whose entries must all be non-negative.
    pub fn usizes(&self, name: &str) -> Result<Vec<usize>> {
        self.ints(name)?
            .iter()
            .map(|&v| {
                usize::try_from(v)
                    .map_err(|_| Error::invalid(format!("attribute '{name}' has negative entry {v}")))
            })
            .collect()
    }

    pub fn dtype(&self, name: &str) -> Result<DType> {
        self.typed(name, AttrType::DataType, |v| match v {
            AttrValue::DataType(d) => Some(*d),
            _ => None,
        })
    }
}
