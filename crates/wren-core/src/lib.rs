//! # wren-core
//!
//! Buffer model and execution primitives shared by every wren crate.
//!
//! - [`Tensor`] / [`TensorDesc`]: typed buffers with explicit allocation
//! - [`Shape`] / [`Layout`] / [`DataLayout`]: dims, strides, channel order
//! - [`DType`]: element types (F16, BF16, F32, F64, I32, I64, U8)
//! - [`Backend`] / [`Device`] / [`BackendCaps`]: hardware families and
//!   what they support
//! - [`DeviceContext`]: the launch interface kernels execute through
//! - [`ScratchArena`]: scoped scratch allocation
//! - [`warp`]: 32-lane register-exchange reductions
//! - [`Error`]: the error taxonomy every layer reports through

pub mod arena;
pub mod backend;
pub mod dtype;
pub mod error;
pub mod layout;
pub mod shape;
pub mod tensor;
pub mod warp;

pub use arena::{ArenaStats, ScratchArena, ScratchBuf, ScratchGuard};
pub use backend::{Backend, BackendCaps, Device, DeviceContext};
pub use dtype::{DType, FloatDType, IndexDType, WithDType};
pub use error::{Error, Result};
pub use layout::{DataLayout, Layout};
pub use shape::Shape;
pub use tensor::{Storage, Tensor, TensorDesc};
