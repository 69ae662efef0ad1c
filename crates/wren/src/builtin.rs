use half::{bf16, f16};
use wren_core::{BackendCaps, Result};
use wren_kernels::{conv, elementwise, index_add, register_kernel, sparse_attention, transpose};
use wren_kernels::{KernelLayout, KernelTable};

/// Forward operator declarations shipped with the runtime.
pub const OPS_YAML: &str = include_str!("../ops/ops.yaml");

/// Gradient operator declarations shipped with the runtime.
pub const BACKWARD_YAML: &str = include_str!("../ops/backward.yaml");

// Built-in kernel registration
//
// What a backend gets depends on its capability descriptor:
//
//   f16 variants     only if `supports_f16`
//   bf16 variants    only if `supports_bf16`
//   sparse attention real kernels if `sparse_matmul`, otherwise an entry
//                    that fails with `Unimplemented` so the call reports
//                    the missing toolkit rather than a missing kernel
//
// Every kernel here handles both channel orders itself, so all of them are
// registered under the `All` layout class.

/// Register `kernel` for f32/f64 and the half types `caps` allows.
macro_rules! register_floats {
    ($table:expr, $caps:expr, $op:expr, $($kernel:ident)::+) => {{
        let caps: &BackendCaps = $caps;
        register_kernel!($table, $op, caps.backend, KernelLayout::All, $($kernel)::+, [f32, f64])?;
        if caps.supports_f16 {
            register_kernel!($table, $op, caps.backend, KernelLayout::All, $($kernel)::+, [f16])?;
        }
        if caps.supports_bf16 {
            register_kernel!($table, $op, caps.backend, KernelLayout::All, $($kernel)::+, [bf16])?;
        }
    }};
}

/// Floats as above plus the integer element types.
macro_rules! register_numeric {
    ($table:expr, $caps:expr, $op:expr, $($kernel:ident)::+) => {{
        register_floats!($table, $caps, $op, $($kernel)::+);
        register_kernel!($table, $op, $caps.backend, KernelLayout::All, $($kernel)::+, [i32, i64])?;
    }};
}

/// Numeric plus `u8`: kernels that only move data.
macro_rules! register_any {
    ($table:expr, $caps:expr, $op:expr, $($kernel:ident)::+) => {{
        register_numeric!($table, $caps, $op, $($kernel)::+);
        register_kernel!($table, $op, $caps.backend, KernelLayout::All, $($kernel)::+, [u8])?;
    }};
}

/// Register every built-in kernel for one backend.
pub fn register_backend_kernels(table: &mut KernelTable, caps: &BackendCaps) -> Result<()> {
    let before = table.len();

    register_floats!(*table, caps, "conv2d", conv::conv2d);
    register_floats!(*table, caps, "conv2d_grad", conv::conv2d_grad);
    register_floats!(*table, caps, "conv3d", conv::conv3d);
    register_floats!(*table, caps, "conv3d_grad", conv::conv3d_grad);
    register_floats!(*table, caps, "depthwise_conv2d", conv::depthwise_conv2d);
    register_floats!(*table, caps, "depthwise_conv2d_grad", conv::depthwise_conv2d_grad);

    register_numeric!(*table, caps, "index_add", index_add::index_add);
    register_numeric!(*table, caps, "index_add_grad", index_add::index_add_grad);

    if caps.sparse_matmul {
        register_kernel!(
            *table,
            "sparse_attention",
            caps.backend,
            KernelLayout::All,
            sparse_attention::sparse_attention,
            [f32, f64]
        )?;
        register_kernel!(
            *table,
            "sparse_attention_grad",
            caps.backend,
            KernelLayout::All,
            sparse_attention::sparse_attention_grad,
            [f32, f64]
        )?;
    } else {
        tracing::warn!(backend = %caps.backend, "sparse matmul unavailable, sparse attention disabled");
        for op in ["sparse_attention", "sparse_attention_grad"] {
            register_kernel!(
                *table,
                op,
                caps.backend,
                KernelLayout::All,
                sparse_attention::sparse_attention_unavailable,
                [f32, f64]
            )?;
        }
    }

    register_any!(*table, caps, "transpose", transpose::transpose);
    register_any!(*table, caps, "transpose_grad", transpose::transpose_grad);
    register_numeric!(*table, caps, "add", elementwise::add);
    register_any!(*table, caps, "cast", elementwise::cast);
    register_any!(*table, caps, "assign", elementwise::assign);

    tracing::debug!(
        backend = %caps.backend,
        bf16 = caps.supports_bf16,
        sparse_matmul = caps.sparse_matmul,
        kernels = table.len() - before,
        "registered built-in kernels"
    );
    Ok(())
}
