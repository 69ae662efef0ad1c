//! # wren-kernels
//!
//! The kernel dispatch table and the numeric kernels it selects between.
//!
//! - [`KernelTable`]: (op, backend, layout, dtype) -> kernel entry
//! - [`conv`]: 2-D/3-D/depthwise convolution forward and gradient
//! - [`index_add`]: scatter-add along an axis and its gradient
//! - [`sparse_attention`]: block-sparse attention forward and backward
//! - [`transpose`], [`elementwise`]: layout and utility kernels
//!
//! Every kernel has the signature [`KernelFn`] and is written once over its
//! element type; [`register_kernel!`] instantiates it per dtype.

pub mod conv;
pub mod dispatch;
pub mod elementwise;
pub mod index_add;
pub mod sparse_attention;
pub mod transpose;

pub use dispatch::{KernelArgs, KernelFn, KernelKey, KernelLayout, KernelTable};

// Used by `register_kernel!` expansions in downstream crates.
pub use wren_core;
