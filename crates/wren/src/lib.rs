//! # wren
//!
//! Operator dispatch and kernel execution.
//!
//! An operator is declared once (typed arguments, an inference function and
//! a kernel name), and each call is matched at runtime to the kernel
//! registered for the caller's backend, element type and layout:
//!
//! ```ignore
//! use wren::prelude::*;
//!
//! let rt = OpRuntime::cpu()?;
//! let x = Tensor::from_vec(vec![1.0f32, 2.0, 3.0, 4.0, 5.0, 6.0], (2, 3))?;
//! let out = rt.invoke("transpose", OpCall::new().input("x", &x).attr("perm", [1i64, 0]))?;
//! assert_eq!(out.first().unwrap().dims(), &[3, 2]);
//! ```
//!
//! Crates:
//! - [`wren_core`]: buffers, dtypes, layouts, devices, launch contexts
//! - [`wren_meta`]: declarations, schemas, attribute resolution, inference
//! - [`wren_kernels`]: the dispatch table and the kernels
//!
//! This crate adds the built-in operator catalogue, capability-driven
//! kernel registration, [`RuntimeConfig`] and the [`OpRuntime`] call
//! boundary.

pub mod builtin;
pub mod config;
pub mod logging;
pub mod runtime;

pub use config::RuntimeConfig;
pub use runtime::{OpCall, OpOutputs, OpRuntime};

pub use wren_core;
pub use wren_kernels;
pub use wren_meta;

pub mod prelude {
    pub use crate::{OpCall, OpOutputs, OpRuntime, RuntimeConfig};
    pub use wren_core::{
        Backend, BackendCaps, DType, DataLayout, Device, DeviceContext, Error, Result, Shape, Tensor,
        TensorDesc,
    };
    pub use wren_meta::{AttrMap, AttrValue};
}
