use std::collections::{BTreeSet, HashMap};
use std::fmt;

use wren_core::{Backend, DType, DataLayout, DeviceContext, Error, Result, Tensor};
use wren_meta::AttrMap;

// Kernel Dispatch: Choosing one implementation per call
//
// A kernel is registered under a key
//
//   (operator, backend, layout class, dtype)
//
// where the layout class is either one exact `DataLayout` or the `All`
// wildcard. Generic kernels are written once over `T` and registered per
// element type, so every entry is a plain monomorphised `fn` pointer.
//
// Lookup for (op, backend, dtype, layout):
//   1. exact layout entry
//   2. `All` entry
//   3. nothing on this backend for op          -> NoKernel
//      the dtype exists only for other layouts -> NoKernel
//      the backend has op, never this dtype    -> UnsupportedDType

/// Layout component of a kernel key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum KernelLayout {
    /// Matches any layout.
    All,
    Exact(DataLayout),
}

impl fmt::Display for KernelLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KernelLayout::All => f.write_str("ALL_LAYOUT"),
            KernelLayout::Exact(l) => write!(f, "{l}"),
        }
    }
}

/// Full registration key of one kernel.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct KernelKey {
    pub op: String,
    pub backend: Backend,
    pub layout: KernelLayout,
    pub dtype: DType,
}

impl KernelKey {
    pub fn new(op: impl Into<String>, backend: Backend, layout: KernelLayout, dtype: DType) -> Self {
        KernelKey {
            op: op.into(),
            backend,
            layout,
            dtype,
        }
    }
}

impl fmt::Display for KernelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {}, {}, {})", self.op, self.backend, self.layout, self.dtype)
    }
}

/// Arguments of one kernel call, in declaration order.
///
/// Inputs are borrowed and never written. Outputs were created unallocated
/// from the inferred descriptors; `None` marks an output the caller did not
/// request, which the kernel must skip.
pub struct KernelArgs<'a> {
    pub inputs: Vec<Option<&'a Tensor>>,
    pub attrs: &'a AttrMap,
    pub outputs: Vec<Option<&'a mut Tensor>>,
}

impl<'a> KernelArgs<'a> {
    pub fn new(
        inputs: Vec<Option<&'a Tensor>>,
        attrs: &'a AttrMap,
        outputs: Vec<Option<&'a mut Tensor>>,
    ) -> Self {
        KernelArgs {
            inputs,
            attrs,
            outputs,
        }
    }

    /// Required input `i`.
    pub fn input(&self, i: usize) -> Result<&'a Tensor> {
        self.inputs
            .get(i)
            .copied()
            .flatten()
            .ok_or_else(|| Error::invalid(format!("kernel input {i} is missing")))
    }

    pub fn optional_input(&self, i: usize) -> Option<&'a Tensor> {
        self.inputs.get(i).copied().flatten()
    }

    /// Take output `i` out of the argument list. Returns `None` when it was
    /// not requested (or already taken).
    pub fn take_output(&mut self, i: usize) -> Option<&'a mut Tensor> {
        self.outputs.get_mut(i).and_then(Option::take)
    }

    /// Output `i`, which the caller must have requested.
    pub fn required_output(&mut self, i: usize) -> Result<&'a mut Tensor> {
        self.take_output(i)
            .ok_or_else(|| Error::invalid(format!("kernel output {i} was not requested")))
    }

    pub fn attrs(&self) -> &'a AttrMap {
        self.attrs
    }
}

/// A registered kernel entry point.
pub type KernelFn = fn(&DeviceContext, &mut KernelArgs<'_>) -> Result<()>;

type Slot = (Backend, KernelLayout, DType);

/// Every registered kernel, grouped by operator.
#[derive(Debug, Clone, Default)]
pub struct KernelTable {
    ops: HashMap<String, HashMap<Slot, KernelFn>>,
}

impl KernelTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, key: KernelKey, kernel: KernelFn) -> Result<()> {
        let slots = self.ops.entry(key.op.clone()).or_default();
        let slot = (key.backend, key.layout, key.dtype);
        if slots.contains_key(&slot) {
            return Err(Error::DuplicateKernel {
                key: key.to_string(),
            });
        }
        tracing::trace!(key = %key, "registered kernel");
        slots.insert(slot, kernel);
        Ok(())
    }

    /// Select the kernel for a call.
    pub fn dispatch(
        &self,
        op: &str,
        backend: Backend,
        dtype: DType,
        layout: DataLayout,
    ) -> Result<KernelFn> {
        let no_kernel = || Error::NoKernel {
            op: op.to_string(),
            backend: backend.to_string(),
            dtype,
            layout: layout.to_string(),
        };
        let slots = self.ops.get(op).ok_or_else(no_kernel)?;
        if let Some(k) = slots
            .get(&(backend, KernelLayout::Exact(layout), dtype))
            .or_else(|| slots.get(&(backend, KernelLayout::All, dtype)))
        {
            tracing::debug!(op, %backend, %dtype, %layout, "dispatch");
            return Ok(*k);
        }

        let on_backend: Vec<&Slot> = slots.keys().filter(|(b, _, _)| *b == backend).collect();
        if on_backend.is_empty() || on_backend.iter().any(|(_, _, d)| *d == dtype) {
            return Err(no_kernel());
        }
        Err(Error::UnsupportedDType {
            op: op.to_string(),
            backend: backend.to_string(),
            dtype,
            supported: self.supported_dtypes(op, backend),
        })
    }

    /// Dtypes with at least one kernel for `op` on `backend`, sorted.
    pub fn supported_dtypes(&self, op: &str, backend: Backend) -> Vec<DType> {
        self.ops
            .get(op)
            .map(|slots| {
                slots
                    .keys()
                    .filter(|(b, _, _)| *b == backend)
                    .map(|(_, _, d)| *d)
                    .collect::<BTreeSet<_>>()
                    .into_iter()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn has_kernel(&self, op: &str, backend: Backend) -> bool {
        self.ops
            .get(op)
            .is_some_and(|slots| slots.keys().any(|(b, _, _)| *b == backend))
    }

    /// Number of registered (op, backend, layout, dtype) entries.
    pub fn len(&self) -> usize {
        self.ops.values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Operators with at least one kernel, sorted.
    pub fn ops(&self) -> Vec<&str> {
        let mut ops: Vec<&str> = self.ops.keys().map(String::as_str).collect();
        ops.sort_unstable();
        ops
    }
}

/// Register one generic kernel for a list of element types.
///
/// ```ignore
/// register_kernel!(table, "transpose", Backend::Cpu, KernelLayout::All,
///                  transpose::transpose, [f32, f64])?;
/// ```
#[macro_export]
macro_rules! register_kernel {
    (@each $table:ident, $op:expr, $backend:expr, $layout:expr, ($($kernel:ident)::+), $ty:ty $(, $rest:ty)*) => {
        $table.register(
            $crate::KernelKey::new(
                $op,
                $backend,
                $layout,
                <$ty as $crate::wren_core::WithDType>::DTYPE,
            ),
            $($kernel)::+::<$ty>,
        )?;
        $crate::register_kernel!(@each $table, $op, $backend, $layout, ($($kernel)::+) $(, $rest)*);
    };
    (@each $table:ident, $op:expr, $backend:expr, $layout:expr, ($($kernel:ident)::+)) => {};
    ($table:expr, $op:expr, $backend:expr, $layout:expr, $($kernel:ident)::+, [$($ty:ty),+ $(,)?]) => {{
        let table: &mut $crate::KernelTable = &mut $table;
        (|| -> $crate::wren_core::Result<()> {
            $crate::register_kernel!(@each table, $op, $backend, $layout, ($($kernel)::+), $($ty),+);
            Ok(())
        })()
    }};
}
