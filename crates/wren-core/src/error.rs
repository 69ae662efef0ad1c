use crate::dtype::DType;
use crate::shape::Shape;

/// All errors that can occur within wren.
///
/// Every failure is raised synchronously where it is detected and travels up
/// to the operator-invocation boundary unchanged. Kernels never retry: a
/// failure is deterministic for a given set of inputs.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Malformed or unsupported attribute, shape, layout or dtype combination.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Two shapes that must be compatible (broadcast, elementwise) are not.
    #[error("shape mismatch: {lhs} vs {rhs}: {reason}")]
    ShapeMismatch {
        lhs: Shape,
        rhs: Shape,
        reason: String,
    },

    /// `lookup` of an operator name that was never registered.
    #[error("unknown operator '{0}'")]
    UnknownOperator(String),

    /// `register` of an operator name that is already registered.
    #[error("operator '{0}' is already registered")]
    DuplicateOperator(String),

    /// Two kernels registered under the same dispatch key.
    #[error("kernel already registered for {key}")]
    DuplicateKernel { key: String },

    /// No kernel exists for the operator on the requested backend.
    #[error("no kernel for '{op}' on {backend} (dtype {dtype}, layout {layout})")]
    NoKernel {
        op: String,
        backend: String,
        dtype: DType,
        layout: String,
    },

    /// The backend has kernels for the operator, but not for this dtype.
    #[error("'{op}' on {backend} does not support dtype {dtype} (supported: {supported:?})")]
    UnsupportedDType {
        op: String,
        backend: String,
        dtype: DType,
        supported: Vec<DType>,
    },

    /// Feature compiled out or unavailable for the active hardware/toolkit.
    #[error("unimplemented: {0}")]
    Unimplemented(String),

    /// An operator declaration failed validation.
    #[error("invalid schema for '{op}': {reason}")]
    InvalidSchema { op: String, reason: String },

    /// DType mismatch between a buffer and the type a kernel asked for.
    #[error("dtype mismatch: expected {expected}, got {got}")]
    DTypeMismatch { expected: DType, got: DType },

    /// Dimension index out of range for the tensor's rank.
    #[error("dimension out of range: dim {dim} for tensor with {rank} dimensions")]
    DimOutOfRange { dim: i64, rank: usize },

    /// Element count mismatch when creating a tensor from a vec.
    #[error("element count mismatch: shape {shape} requires {expected} elements, got {got}")]
    ElementCountMismatch {
        shape: Shape,
        expected: usize,
        got: usize,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create an `InvalidArgument` error from any string message.
    pub fn invalid(s: impl Into<String>) -> Self {
        Error::InvalidArgument(s.into())
    }

    pub fn schema(op: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::InvalidSchema {
            op: op.into(),
            reason: reason.into(),
        }
    }
}

/// Convenience Result type used throughout wren.
pub type Result<T> = std::result::Result<T, Error>;

/// Early return with a formatted `InvalidArgument` error.
/// Usage: `bail!("axis {} out of range", axis)`
#[macro_export]
macro_rules! bail {
    ($($arg:tt)*) => {
        return Err($crate::Error::InvalidArgument(format!($($arg)*)))
    };
}

/// Return an `InvalidArgument` error unless the condition holds.
#[macro_export]
macro_rules! ensure {
    ($cond:expr, $($arg:tt)*) => {
        if !$cond {
            $crate::bail!($($arg)*);
        }
    };
}
