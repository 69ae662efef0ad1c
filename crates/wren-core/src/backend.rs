use std::fmt;
use std::str::FromStr;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::arena::{ScratchArena, ScratchGuard};
use crate::error::{Error, Result};

// Backend: Hardware families kernels are registered against
//
// The driver/runtime APIs of each family are not bound here. A backend is
// described by a capability descriptor (`BackendCaps`) and driven through a
// `DeviceContext`, the opaque "launch a parallel kernel over N work items"
// interface. Registration consults the descriptor to decide which kernel
// variants exist for the family, so one binary serves every hardware
// generation without compile-time branching.

/// Hardware family a kernel is compiled for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    Cpu,
    Gpu,
    Xpu,
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Backend::Cpu => "CPU",
            Backend::Gpu => "GPU",
            Backend::Xpu => "XPU",
        };
        f.write_str(s)
    }
}

impl FromStr for Backend {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cpu" => Ok(Backend::Cpu),
            "gpu" | "cuda" => Ok(Backend::Gpu),
            "xpu" => Ok(Backend::Xpu),
            other => Err(Error::invalid(format!("unknown backend '{other}'"))),
        }
    }
}

/// A concrete device a tensor is placed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Device {
    #[default]
    Cpu,
    Gpu(u32),
    Xpu(u32),
}

impl Device {
    pub fn backend(&self) -> Backend {
        match self {
            Device::Cpu => Backend::Cpu,
            Device::Gpu(_) => Backend::Gpu,
            Device::Xpu(_) => Backend::Xpu,
        }
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Cpu => write!(f, "cpu"),
            Device::Gpu(i) => write!(f, "gpu:{i}"),
            Device::Xpu(i) => write!(f, "xpu:{i}"),
        }
    }
}

/// What a backend can do, queried when kernels are registered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendCaps {
    pub backend: Backend,
    /// Half-precision arithmetic is available.
    #[serde(default = "default_true")]
    pub supports_f16: bool,
    /// bfloat16 arithmetic is available (newer hardware generations only).
    #[serde(default)]
    pub supports_bf16: bool,
    /// The sparse-matmul primitive is available (minimum toolkit version).
    #[serde(default)]
    pub sparse_matmul: bool,
    /// Lanes per cooperating execution group.
    #[serde(default = "default_warp_size")]
    pub warp_size: usize,
}

fn default_true() -> bool {
    true
}

fn default_warp_size() -> usize {
    crate::warp::WARP_SIZE
}

impl BackendCaps {
    pub fn cpu() -> Self {
        BackendCaps {
            backend: Backend::Cpu,
            supports_f16: true,
            supports_bf16: true,
            sparse_matmul: true,
            warp_size: crate::warp::WARP_SIZE,
        }
    }

    pub fn gpu() -> Self {
        BackendCaps {
            backend: Backend::Gpu,
            supports_f16: true,
            supports_bf16: true,
            sparse_matmul: true,
            warp_size: crate::warp::WARP_SIZE,
        }
    }

    /// An XPU without the newer runtime: no bf16, no sparse matmul.
    pub fn xpu() -> Self {
        BackendCaps {
            backend: Backend::Xpu,
            supports_f16: true,
            supports_bf16: false,
            sparse_matmul: false,
            warp_size: crate::warp::WARP_SIZE,
        }
    }

    pub fn with_bf16(mut self, enabled: bool) -> Self {
        self.supports_bf16 = enabled;
        self
    }

    pub fn with_sparse_matmul(mut self, enabled: bool) -> Self {
        self.sparse_matmul = enabled;
        self
    }

    /// Default descriptor for a backend family.
    pub fn for_backend(backend: Backend) -> Self {
        match backend {
            Backend::Cpu => Self::cpu(),
            Backend::Gpu => Self::gpu(),
            Backend::Xpu => Self::xpu(),
        }
    }
}

// DeviceContext: The launch interface kernels execute through
//
// A launch maps logical work items onto the execution units of the device.
// Every work item owns exactly one output element (`launch_map`) or one
// output row (`launch_rows`), so a launch never has two writers for the same
// location. Launches are executed on the host thread pool and have completed
// when the call returns; `synchronize` is the explicit barrier callers use
// before reading results.

/// Execution context handed to every kernel invocation.
#[derive(Debug)]
pub struct DeviceContext {
    device: Device,
    caps: BackendCaps,
    arena: ScratchArena,
    parallel: bool,
}

impl DeviceContext {
    pub fn new(device: Device, caps: BackendCaps) -> Self {
        DeviceContext {
            device,
            caps,
            arena: ScratchArena::new(),
            parallel: true,
        }
    }

    pub fn cpu() -> Self {
        Self::new(Device::Cpu, BackendCaps::cpu())
    }

    /// Run launches on the thread pool (default) or sequentially.
    pub fn with_parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    /// Bound the scratch cache to `bytes`; `None` leaves it unbounded.
    pub fn with_scratch_limit(mut self, bytes: Option<usize>) -> Self {
        self.arena = bytes.map_or_else(ScratchArena::new, ScratchArena::with_limit);
        self
    }

    pub fn device(&self) -> Device {
        self.device
    }

    pub fn backend(&self) -> Backend {
        self.device.backend()
    }

    pub fn caps(&self) -> &BackendCaps {
        &self.caps
    }

    pub fn arena(&self) -> &ScratchArena {
        &self.arena
    }

    /// Open a scratch scope. Buffers allocated through it are returned to the
    /// arena when they drop, at the latest when the kernel call returns.
    pub fn scratch(&self) -> ScratchGuard<'_> {
        self.arena.guard()
    }

    /// One work item per output element: `out[i] = f(i)`.
    pub fn launch_map<T, F>(&self, out: &mut [T], f: F)
    where
        T: Send,
        F: Fn(usize) -> T + Sync + Send,
    {
        tracing::trace!(device = %self.device, items = out.len(), "launch_map");
        if self.parallel {
            out.par_iter_mut().enumerate().for_each(|(i, o)| *o = f(i));
        } else {
            out.iter_mut().enumerate().for_each(|(i, o)| *o = f(i));
        }
    }

    /// Fallible variant of [`DeviceContext::launch_map`]; the first error
    /// aborts the launch and the output contents are unspecified.
    pub fn try_launch_map<T, F>(&self, out: &mut [T], f: F) -> Result<()>
    where
        T: Send,
        F: Fn(usize) -> Result<T> + Sync + Send,
    {
        tracing::trace!(device = %self.device, items = out.len(), "try_launch_map");
        if self.parallel {
            out.par_iter_mut().enumerate().try_for_each(|(i, o)| {
                *o = f(i)?;
                Ok(())
            })
        } else {
            out.iter_mut().enumerate().try_for_each(|(i, o)| {
                *o = f(i)?;
                Ok(())
            })
        }
    }

    /// One work item per row of `row_len` elements: `f(row, &mut out[row])`.
    pub fn launch_rows<T, F>(&self, out: &mut [T], row_len: usize, f: F)
    where
        T: Send,
        F: Fn(usize, &mut [T]) + Sync + Send,
    {
        if row_len == 0 || out.is_empty() {
            return;
        }
        tracing::trace!(device = %self.device, rows = out.len() / row_len, row_len, "launch_rows");
        if self.parallel {
            out.par_chunks_mut(row_len)
                .enumerate()
                .for_each(|(r, row)| f(r, row));
        } else {
            out.chunks_mut(row_len)
                .enumerate()
                .for_each(|(r, row)| f(r, row));
        }
    }

    /// Fallible variant of [`DeviceContext::launch_rows`].
    pub fn try_launch_rows<T, F>(&self, out: &mut [T], row_len: usize, f: F) -> Result<()>
    where
        T: Send,
        F: Fn(usize, &mut [T]) -> Result<()> + Sync + Send,
    {
        if row_len == 0 || out.is_empty() {
            return Ok(());
        }
        tracing::trace!(device = %self.device, rows = out.len() / row_len, row_len, "try_launch_rows");
        if self.parallel {
            out.par_chunks_mut(row_len)
                .enumerate()
                .try_for_each(|(r, row)| f(r, row))
        } else {
            out.chunks_mut(row_len)
                .enumerate()
                .try_for_each(|(r, row)| f(r, row))
        }
    }

    /// Completion barrier. Results written by earlier launches are visible
    /// once this returns.
    pub fn synchronize(&self) -> Result<()> {
        tracing::trace!(device = %self.device, "synchronize");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_launch_map_writes_every_item() {
        let ctx = DeviceContext::cpu();
        let mut out = vec![0usize; 100];
        ctx.launch_map(&mut out, |i| i * 2);
        assert!(out.iter().enumerate().all(|(i, &v)| v == i * 2));
    }

    #[test]
    fn test_sequential_matches_parallel() {
        let par = DeviceContext::cpu();
        let seq = DeviceContext::cpu().with_parallel(false);
        let mut a = vec![0.0f64; 64];
        let mut b = vec![0.0f64; 64];
        par.launch_rows(&mut a, 8, |r, row| row.iter_mut().for_each(|v| *v = r as f64));
        seq.launch_rows(&mut b, 8, |r, row| row.iter_mut().for_each(|v| *v = r as f64));
        assert_eq!(a, b);
    }

    #[test]
    fn test_try_launch_propagates_error() {
        let ctx = DeviceContext::cpu();
        let mut out = vec![0i32; 10];
        let r = ctx.try_launch_map(&mut out, |i| {
            if i == 7 {
                Err(Error::invalid("bad item"))
            } else {
                Ok(i as i32)
            }
        });
        assert!(matches!(r, Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn test_empty_row_launch_is_noop() {
        let ctx = DeviceContext::cpu();
        let mut out: Vec<f32> = vec![];
        ctx.launch_rows(&mut out, 0, |_, _| unreachable!());
    }

    #[test]
    fn test_device_backend() {
        assert_eq!(Device::Gpu(1).backend(), Backend::Gpu);
        assert_eq!("xpu".parse::<Backend>().unwrap(), Backend::Xpu);
        assert!(!BackendCaps::xpu().supports_bf16);
    }
}
