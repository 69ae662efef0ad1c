use half::{bf16, f16};

use crate::backend::Device;
use crate::dtype::{DType, WithDType};
use crate::error::{Error, Result};
use crate::layout::DataLayout;
use crate::shape::Shape;

// Tensor: Buffer model of the kernel layer
//
// A kernel call sees two kinds of tensors:
//
//   inputs     borrowed (`&Tensor`), never written; optional inputs are
//              `Option<&Tensor>` and kernels branch on presence
//   outputs    owned by the invocation, created *unallocated* from the
//              descriptor shape inference produced; the kernel that writes
//              an output allocates it with `alloc::<T>()`, so an output a
//              kernel skips stays unallocated
//
// Storage is an enum over typed vectors. Typed access checks the dtype
// instead of reinterpreting bytes.

/// Type-erased element storage.
#[derive(Debug, Clone, PartialEq)]
pub enum Storage {
    F16(Vec<f16>),
    BF16(Vec<bf16>),
    F32(Vec<f32>),
    F64(Vec<f64>),
    I32(Vec<i32>),
    I64(Vec<i64>),
    U8(Vec<u8>),
}

macro_rules! with_storage {
    ($storage:expr, $v:ident => $body:expr) => {
        match $storage {
            Storage::F16($v) => $body,
            Storage::BF16($v) => $body,
            Storage::F32($v) => $body,
            Storage::F64($v) => $body,
            Storage::I32($v) => $body,
            Storage::I64($v) => $body,
            Storage::U8($v) => $body,
        }
    };
}

impl Storage {
    pub fn dtype(&self) -> DType {
        match self {
            Storage::F16(_) => DType::F16,
            Storage::BF16(_) => DType::BF16,
            Storage::F32(_) => DType::F32,
            Storage::F64(_) => DType::F64,
            Storage::I32(_) => DType::I32,
            Storage::I64(_) => DType::I64,
            Storage::U8(_) => DType::U8,
        }
    }

    pub fn len(&self) -> usize {
        with_storage!(self, v => v.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Allocate `n` zeroed elements of `dtype`.
    pub fn zeros(dtype: DType, n: usize) -> Storage {
        match dtype {
            DType::F16 => Storage::F16(vec![f16::ZERO; n]),
            DType::BF16 => Storage::BF16(vec![bf16::ZERO; n]),
            DType::F32 => Storage::F32(vec![0.0; n]),
            DType::F64 => Storage::F64(vec![0.0; n]),
            DType::I32 => Storage::I32(vec![0; n]),
            DType::I64 => Storage::I64(vec![0; n]),
            DType::U8 => Storage::U8(vec![0; n]),
        }
    }

    /// Convert an f64 slice to storage of the target dtype.
    pub fn from_f64_slice(data: &[f64], dtype: DType) -> Storage {
        fn conv<T: WithDType>(data: &[f64]) -> Vec<T> {
            data.iter().map(|&v| T::from_f64(v)).collect()
        }
        match dtype {
            DType::F16 => Storage::F16(conv(data)),
            DType::BF16 => Storage::BF16(conv(data)),
            DType::F32 => Storage::F32(conv(data)),
            DType::F64 => Storage::F64(conv(data)),
            DType::I32 => Storage::I32(conv(data)),
            DType::I64 => Storage::I64(conv(data)),
            DType::U8 => Storage::U8(conv(data)),
        }
    }

    pub fn to_f64_vec(&self) -> Vec<f64> {
        with_storage!(self, v => v.iter().map(|x| x.to_f64()).collect())
    }
}

/// Shape, dtype, layout and placement of a tensor, without its data.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TensorDesc {
    pub shape: Shape,
    pub dtype: DType,
    pub layout: DataLayout,
    pub device: Device,
}

impl TensorDesc {
    /// Plain-layout CPU descriptor.
    pub fn new(shape: impl Into<Shape>, dtype: DType) -> Self {
        TensorDesc {
            shape: shape.into(),
            dtype,
            layout: DataLayout::Plain,
            device: Device::Cpu,
        }
    }

    pub fn with_layout(mut self, layout: DataLayout) -> Self {
        self.layout = layout;
        self
    }

    pub fn with_device(mut self, device: Device) -> Self {
        self.device = device;
        self
    }

    pub fn with_dtype(mut self, dtype: DType) -> Self {
        self.dtype = dtype;
        self
    }

    pub fn with_shape(mut self, shape: impl Into<Shape>) -> Self {
        self.shape = shape.into();
        self
    }

    pub fn dims(&self) -> &[usize] {
        self.shape.dims()
    }

    pub fn rank(&self) -> usize {
        self.shape.rank()
    }

    pub fn numel(&self) -> usize {
        self.shape.elem_count()
    }

    pub fn strides(&self) -> Vec<usize> {
        self.shape.stride_contiguous()
    }

    pub fn size_in_bytes(&self) -> usize {
        self.numel() * self.dtype.size_in_bytes()
    }
}

/// A tensor: a descriptor plus (once allocated) its storage.
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    desc: TensorDesc,
    storage: Option<Storage>,
}

impl Tensor {
    /// An output slot: described, not yet allocated.
    pub fn uninit(desc: TensorDesc) -> Self {
        Tensor {
            desc,
            storage: None,
        }
    }

    pub fn zeros(desc: TensorDesc) -> Self {
        let storage = Storage::zeros(desc.dtype, desc.numel());
        Tensor {
            desc,
            storage: Some(storage),
        }
    }

    /// Build a tensor from typed data. The element count must match the shape.
    pub fn from_vec<T: WithDType>(data: Vec<T>, shape: impl Into<Shape>) -> Result<Self> {
        let shape = shape.into();
        let expected = shape.elem_count();
        if data.len() != expected {
            return Err(Error::ElementCountMismatch {
                shape,
                expected,
                got: data.len(),
            });
        }
        Ok(Tensor {
            desc: TensorDesc::new(shape, T::DTYPE),
            storage: Some(T::into_storage(data)),
        })
    }

    /// Build a tensor from f64 values converted to `dtype`.
    pub fn from_f64_slice(data: &[f64], shape: impl Into<Shape>, dtype: DType) -> Result<Self> {
        let shape = shape.into();
        let expected = shape.elem_count();
        if data.len() != expected {
            return Err(Error::ElementCountMismatch {
                shape,
                expected,
                got: data.len(),
            });
        }
        Ok(Tensor {
            desc: TensorDesc::new(shape, dtype),
            storage: Some(Storage::from_f64_slice(data, dtype)),
        })
    }

    pub fn with_layout(mut self, layout: DataLayout) -> Self {
        self.desc.layout = layout;
        self
    }

    /// Re-tag the placement of this tensor.
    pub fn to_device(mut self, device: Device) -> Self {
        self.desc.device = device;
        self
    }

    pub fn desc(&self) -> &TensorDesc {
        &self.desc
    }

    pub fn shape(&self) -> &Shape {
        &self.desc.shape
    }

    pub fn dims(&self) -> &[usize] {
        self.desc.dims()
    }

    pub fn rank(&self) -> usize {
        self.desc.rank()
    }

    pub fn dtype(&self) -> DType {
        self.desc.dtype
    }

    pub fn layout(&self) -> DataLayout {
        self.desc.layout
    }

    pub fn device(&self) -> Device {
        self.desc.device
    }

    pub fn numel(&self) -> usize {
        self.desc.numel()
    }

    pub fn is_allocated(&self) -> bool {
        self.storage.is_some()
    }

    pub fn storage(&self) -> Option<&Storage> {
        self.storage.as_ref()
    }

    fn check_dtype<T: WithDType>(&self) -> Result<()> {
        if self.desc.dtype != T::DTYPE {
            return Err(Error::DTypeMismatch {
                expected: self.desc.dtype,
                got: T::DTYPE,
            });
        }
        Ok(())
    }

    /// Typed read access. Fails on an unallocated tensor or wrong `T`.
    pub fn data<T: WithDType>(&self) -> Result<&[T]> {
        self.check_dtype::<T>()?;
        let storage = self
            .storage
            .as_ref()
            .ok_or_else(|| Error::invalid("tensor is not allocated"))?;
        T::slice(storage).ok_or(Error::DTypeMismatch {
            expected: storage.dtype(),
            got: T::DTYPE,
        })
    }

    /// Allocate (zeroed) if needed and return the mutable buffer.
    pub fn alloc<T: WithDType>(&mut self) -> Result<&mut [T]> {
        self.check_dtype::<T>()?;
        let n = self.desc.numel();
        let storage = self
            .storage
            .get_or_insert_with(|| T::into_storage(vec![T::zero(); n]));
        let got = storage.dtype();
        T::slice_mut(storage).ok_or(Error::DTypeMismatch {
            expected: got,
            got: T::DTYPE,
        })
    }

    /// Copy the data out as f64 (for inspection and tests).
    pub fn to_f64_vec(&self) -> Result<Vec<f64>> {
        self.storage
            .as_ref()
            .map(Storage::to_f64_vec)
            .ok_or_else(|| Error::invalid("tensor is not allocated"))
    }
}
