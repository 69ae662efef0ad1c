use std::ops::Range;

use num_traits::Float;
use wren_core::warp::{elems_per_lane, Warp, WARP_SIZE};
use wren_core::{ensure, DType, DeviceContext, Error, FloatDType, Result, Tensor, WithDType};

use crate::dispatch::KernelArgs;

// Block-sparse attention: Forward and backward over a CSR score pattern
//
// Each (batch, head) pair is one independent instance with q/k/v of shape
// [M, D]. The materialised scores of row r are the columns
//
//   columns[offset[r] .. offset[r + 1]]
//
// Forward, per instance:
//
//   sdd[j]   = scale * <Q[r], K[c_j]>           DotSdd, scale = 1/sqrt(D)
//   p        = softmax over the row's entries  masked entries -> -inf
//   out[r]   = sum_j p[j] * V[c_j]             DotDsd
//
// Backward, per instance:
//
//   dV[c_j] += p[j] * dOut[r]                  DotDsd transposed
//   g[j]     = <dOut[r], V[c_j]>               DotSdd on the pattern
//   dS[j]    = scale * p[j] * (g[j] - sum_j p[j] g[j])
//   dQ[r]    = sum_j dS[j] * K[c_j]
//   dK[c_j] += dS[j] * Q[r]
//
// Row softmax runs as one emulated warp: lane l owns entries l, l + 32, ...
// and max/sum are reduced with xor-shuffle butterflies. The number of entries
// a warp handles per row is fixed per call to the smallest budget in
// {4, 8, ..., 512} covering the widest row; wider rows are rejected.

/// Widest row (nonzero count) the softmax warp handles.
pub const MAX_ROW_NNZ: usize = 512;

const ROW_BUDGETS: [usize; 8] = [4, 8, 16, 32, 64, 128, 256, 512];

/// Per-call row budget for a pattern whose widest row has `max_nnz` entries.
pub fn row_budget(max_nnz: usize) -> Result<usize> {
    ROW_BUDGETS
        .iter()
        .copied()
        .find(|&b| b >= max_nnz)
        .ok_or_else(|| {
            Error::invalid(format!(
                "sparse attention rows hold at most {MAX_ROW_NNZ} nonzeros, got a row with {max_nnz}"
            ))
        })
}

#[derive(Debug, Clone, Copy)]
struct AttentionDims {
    batch: usize,
    heads: usize,
    m: usize,
    d: usize,
}

impl AttentionDims {
    fn new(q: &Tensor, k: &Tensor, v: &Tensor) -> Result<Self> {
        ensure!(q.rank() == 4, "query must be [B, H, M, D], got {}", q.shape());
        for (name, t) in [("key", k), ("value", v)] {
            if t.dims() != q.dims() {
                return Err(Error::ShapeMismatch {
                    lhs: q.shape().clone(),
                    rhs: t.shape().clone(),
                    reason: format!("{name} must match query"),
                });
            }
        }
        let d = q.dims();
        Ok(AttentionDims {
            batch: d[0],
            heads: d[1],
            m: d[2],
            d: d[3],
        })
    }

    fn instances(&self) -> usize {
        self.batch * self.heads
    }

    /// Elements of one instance's q/k/v block.
    fn block(&self) -> usize {
        self.m * self.d
    }

    fn scale<A: WithDType>(&self) -> A {
        A::from_f64(1.0 / (self.d.max(1) as f64).sqrt())
    }
}

/// A validated CSR pattern, one per instance.
struct Pattern<'a> {
    offset: &'a [i32],
    columns: &'a [i32],
    m: usize,
    nnz: usize,
}

impl<'a> Pattern<'a> {
    fn new(offset: &'a Tensor, columns: &'a Tensor, dims: &AttentionDims) -> Result<Self> {
        ensure!(
            offset.dtype() == DType::I32 && columns.dtype() == DType::I32,
            "offset and columns must be int32, got {} and {}",
            offset.dtype(),
            columns.dtype()
        );
        let (instances, m) = (dims.instances(), dims.m);
        ensure!(
            offset.numel() == instances * (m + 1),
            "offset {} does not hold {instances} row pointers of length {}",
            offset.shape(),
            m + 1
        );
        ensure!(
            columns.rank() == 3 && columns.numel() == instances * columns.dims()[2],
            "columns must be [B, H, nnz], got {}",
            columns.shape()
        );
        let pattern = Pattern {
            offset: offset.data::<i32>()?,
            columns: columns.data::<i32>()?,
            m,
            nnz: columns.dims()[2],
        };
        for inst in 0..instances {
            pattern.validate(inst)?;
        }
        Ok(pattern)
    }

    fn validate(&self, inst: usize) -> Result<()> {
        let offs = &self.offset[inst * (self.m + 1)..][..self.m + 1];
        ensure!(offs[0] == 0, "instance {inst}: offset must start at 0, got {}", offs[0]);
        ensure!(
            offs.windows(2).all(|w| w[0] <= w[1]),
            "instance {inst}: offset must be non-decreasing"
        );
        ensure!(
            offs[self.m] as usize == self.nnz,
            "instance {inst}: offset ends at {} but columns hold {} entries",
            offs[self.m],
            self.nnz
        );
        let cols = &self.columns[inst * self.nnz..][..self.nnz];
        if let Some(bad) = cols.iter().find(|&&c| c < 0 || c as usize >= self.m) {
            return Err(Error::invalid(format!(
                "instance {inst}: column {bad} is out of range for {} keys",
                self.m
            )));
        }
        Ok(())
    }

    /// Instance-local entry range of row `r`.
    fn row(&self, inst: usize, r: usize) -> Range<usize> {
        let offs = &self.offset[inst * (self.m + 1)..];
        offs[r] as usize..offs[r + 1] as usize
    }

    fn col(&self, inst: usize, j: usize) -> usize {
        self.columns[inst * self.nnz + j] as usize
    }

    fn max_row_nnz(&self) -> usize {
        let rows = self.offset.len() / (self.m + 1);
        (0..rows)
            .flat_map(|inst| (0..self.m).map(move |r| (inst, r)))
            .map(|(inst, r)| self.row(inst, r).len())
            .max()
            .unwrap_or(0)
    }
}

/// Which masks a call forwards to the softmax. A zero entry masks.
#[derive(Clone, Copy)]
enum Masks<'a, T> {
    None,
    KeyPadding(&'a [T]),
    Attention(&'a [T]),
    Both(&'a [T], &'a [T]),
}

impl<'a, T: WithDType> Masks<'a, T> {
    fn new(
        key_padding: Option<&'a Tensor>,
        attention: Option<&'a Tensor>,
        dims: &AttentionDims,
    ) -> Result<Self> {
        let check = |t: &'a Tensor, name: &str, expected: usize| -> Result<&'a [T]> {
            ensure!(
                t.dtype() == T::DTYPE,
                "{name} must have the value dtype {}, got {}",
                T::DTYPE,
                t.dtype()
            );
            ensure!(
                t.numel() == expected,
                "{name} must hold {expected} entries, got shape {}",
                t.shape()
            );
            t.data::<T>()
        };
        let m = dims.m;
        Ok(match (key_padding, attention) {
            (Some(kp), Some(am)) => Masks::Both(
                check(kp, "key_padding_mask", dims.batch * m)?,
                check(am, "attn_mask", m * m)?,
            ),
            (Some(kp), None) => Masks::KeyPadding(check(kp, "key_padding_mask", dims.batch * m)?),
            (None, Some(am)) => Masks::Attention(check(am, "attn_mask", m * m)?),
            (None, None) => Masks::None,
        })
    }

    fn is_masked(&self, batch: usize, m: usize, r: usize, c: usize) -> bool {
        let zero = |v: T| v.to_f64() == 0.0;
        match *self {
            Masks::None => false,
            Masks::KeyPadding(kp) => zero(kp[batch * m + c]),
            Masks::Attention(am) => zero(am[r * m + c]),
            Masks::Both(kp, am) => zero(kp[batch * m + c]) || zero(am[r * m + c]),
        }
    }
}

fn dot<T: FloatDType>(a: &[T], b: &[T]) -> T::Accum {
    a.iter().zip(b).map(|(&x, &y)| x.widen() * y.widen()).sum()
}

/// Softmax of one row of `out.len()` entries; `score(j)` is `None` for a
/// masked entry. A row with no unmasked entry is all zero.
pub fn softmax_row<A: Float>(budget: usize, score: impl Fn(usize) -> Option<A>, out: &mut [A]) {
    let n = out.len();
    let per_lane = elems_per_lane(budget);

    let mut max = Warp::splat(A::neg_infinity());
    for k in 0..per_lane {
        for lane in 0..WARP_SIZE {
            let j = k * WARP_SIZE + lane;
            if let Some(s) = (j < n).then(|| score(j)).flatten() {
                max.update(lane, s, |a, b| a.max(b));
            }
        }
    }
    let row_max = max.all_reduce(|a, b| a.max(b));
    if row_max == A::neg_infinity() {
        out.fill(A::zero());
        return;
    }

    let mut sum = Warp::splat(A::zero());
    for k in 0..per_lane {
        for lane in 0..WARP_SIZE {
            let j = k * WARP_SIZE + lane;
            if j < n {
                let e = score(j).map_or(A::zero(), |s| (s - row_max).exp());
                out[j] = e;
                sum.update(lane, e, |a, b| a + b);
            }
        }
    }
    let total = sum.all_reduce(|a, b| a + b);
    for v in out.iter_mut() {
        *v = *v / total;
    }
}

/// In place: `g[j] <- scale * p[j] * (g[j] - sum_j p[j] g[j])`.
pub fn softmax_grad_row<A: Float>(budget: usize, scale: A, p: impl Fn(usize) -> A, g: &mut [A]) {
    let n = g.len();
    let mut acc = Warp::splat(A::zero());
    for k in 0..elems_per_lane(budget) {
        for lane in 0..WARP_SIZE {
            let j = k * WARP_SIZE + lane;
            if j < n {
                acc.update(lane, p(j) * g[j], |a, b| a + b);
            }
        }
    }
    let pg = acc.all_reduce(|a, b| a + b);
    for (j, gj) in g.iter_mut().enumerate() {
        *gj = scale * p(j) * (*gj - pg);
    }
}

fn check_same_dtype<T: WithDType>(tensors: &[(&str, &Tensor)]) -> Result<()> {
    for (name, t) in tensors {
        ensure!(
            t.dtype() == T::DTYPE,
            "{name} dtype must be {}, got {}",
            T::DTYPE,
            t.dtype()
        );
    }
    Ok(())
}

/// `sparse_attention(q, k, v, offset, columns, key_padding_mask?, attn_mask?)
/// -> out, sparse_dot_sdd, softmax`.
pub fn sparse_attention<T: FloatDType>(ctx: &DeviceContext, args: &mut KernelArgs<'_>) -> Result<()> {
    let q = args.input(0)?;
    let k = args.input(1)?;
    let v = args.input(2)?;
    let dims = AttentionDims::new(q, k, v)?;
    check_same_dtype::<T>(&[("query", q), ("key", k), ("value", v)])?;
    let pattern = Pattern::new(args.input(3)?, args.input(4)?, &dims)?;
    let budget = row_budget(pattern.max_row_nnz())?;
    let masks = Masks::<T>::new(args.optional_input(5), args.optional_input(6), &dims)?;

    let out = args.required_output(0)?;
    let sdd = args.required_output(1)?;
    let softmax = args.required_output(2)?;
    tracing::debug!(
        instances = dims.instances(),
        rows = dims.m,
        nnz = pattern.nnz,
        budget,
        "sparse_attention"
    );

    let (qs, ks, vs) = (q.data::<T>()?, k.data::<T>()?, v.data::<T>()?);
    let (block, d, nnz) = (dims.block(), dims.d, pattern.nnz);
    let scale: T::Accum = dims.scale();

    ctx.launch_rows(sdd.alloc::<T>()?, nnz, |inst, row| {
        let (qi, ki) = (&qs[inst * block..][..block], &ks[inst * block..][..block]);
        for r in 0..dims.m {
            for j in pattern.row(inst, r) {
                let c = pattern.col(inst, j);
                row[j] = T::narrow(scale * dot(&qi[r * d..][..d], &ki[c * d..][..d]));
            }
        }
    });

    let scores = sdd.data::<T>()?;
    ctx.launch_rows(softmax.alloc::<T>()?, nnz, |inst, row| {
        let batch = inst / dims.heads;
        let scores = &scores[inst * nnz..][..nnz];
        let scratch = ctx.scratch();
        let mut probs = scratch.alloc::<T::Accum>(budget);
        for r in 0..dims.m {
            let range = pattern.row(inst, r);
            let n = range.len();
            let start = range.start;
            softmax_row(
                budget,
                |j| {
                    let c = pattern.col(inst, start + j);
                    (!masks.is_masked(batch, dims.m, r, c)).then(|| scores[start + j].widen())
                },
                &mut probs[..n],
            );
            for (dst, &p) in row[range].iter_mut().zip(probs.iter()) {
                *dst = T::narrow(p);
            }
        }
    });

    let probs = softmax.data::<T>()?;
    ctx.launch_rows(out.alloc::<T>()?, block, |inst, row| {
        let vi = &vs[inst * block..][..block];
        let probs = &probs[inst * nnz..][..nnz];
        let scratch = ctx.scratch();
        let mut acc = scratch.alloc::<T::Accum>(d);
        for r in 0..dims.m {
            acc.fill(T::Accum::from_f64(0.0));
            for j in pattern.row(inst, r) {
                let p = probs[j].widen();
                let c = pattern.col(inst, j);
                for (a, &x) in acc.iter_mut().zip(&vi[c * d..][..d]) {
                    *a += p * x.widen();
                }
            }
            for (dst, &a) in row[r * d..][..d].iter_mut().zip(acc.iter()) {
                *dst = T::narrow(a);
            }
        }
    });
    Ok(())
}

/// `sparse_attention_grad(q, k, v, offset, columns, sparse_dot_sdd, softmax,
/// out_grad) -> q_grad, k_grad, v_grad`, each optional.
pub fn sparse_attention_grad<T: FloatDType>(ctx: &DeviceContext, args: &mut KernelArgs<'_>) -> Result<()> {
    let q = args.input(0)?;
    let k = args.input(1)?;
    let v = args.input(2)?;
    let dims = AttentionDims::new(q, k, v)?;
    let pattern = Pattern::new(args.input(3)?, args.input(4)?, &dims)?;
    let budget = row_budget(pattern.max_row_nnz())?;
    let softmax = args.input(6)?;
    let out_grad = args.input(7)?;
    check_same_dtype::<T>(&[
        ("query", q),
        ("key", k),
        ("value", v),
        ("softmax", softmax),
        ("out_grad", out_grad),
    ])?;
    ensure!(
        softmax.numel() == dims.instances() * pattern.nnz,
        "softmax {} does not match the pattern ({} entries per instance)",
        softmax.shape(),
        pattern.nnz
    );
    if out_grad.dims() != q.dims() {
        return Err(Error::ShapeMismatch {
            lhs: q.shape().clone(),
            rhs: out_grad.shape().clone(),
            reason: "out_grad must match query".into(),
        });
    }

    let q_grad = args.take_output(0);
    let k_grad = args.take_output(1);
    let v_grad = args.take_output(2);
    if q_grad.is_none() && k_grad.is_none() && v_grad.is_none() {
        return Ok(());
    }

    let (qs, ks, vs) = (q.data::<T>()?, k.data::<T>()?, v.data::<T>()?);
    let (probs, dout) = (softmax.data::<T>()?, out_grad.data::<T>()?);
    let (block, d, nnz) = (dims.block(), dims.d, pattern.nnz);
    let scale: T::Accum = dims.scale();

    if let Some(v_grad) = v_grad {
        ctx.launch_rows(v_grad.alloc::<T>()?, block, |inst, row| {
            let scratch = ctx.scratch();
            let mut acc = scratch.alloc::<T::Accum>(block);
            let (probs, dout) = (&probs[inst * nnz..][..nnz], &dout[inst * block..][..block]);
            for r in 0..dims.m {
                for j in pattern.row(inst, r) {
                    let (p, c) = (probs[j].widen(), pattern.col(inst, j));
                    for (a, &g) in acc[c * d..][..d].iter_mut().zip(&dout[r * d..][..d]) {
                        *a += p * g.widen();
                    }
                }
            }
            for (dst, &a) in row.iter_mut().zip(acc.iter()) {
                *dst = T::narrow(a);
            }
        });
    }

    if q_grad.is_none() && k_grad.is_none() {
        return Ok(());
    }

    let scratch = ctx.scratch();
    let mut ds = scratch.alloc::<T::Accum>(dims.instances() * nnz);
    ctx.launch_rows(&mut ds, nnz, |inst, row| {
        let (probs, dout) = (&probs[inst * nnz..][..nnz], &dout[inst * block..][..block]);
        let vi = &vs[inst * block..][..block];
        for r in 0..dims.m {
            let range = pattern.row(inst, r);
            let start = range.start;
            for j in range.clone() {
                let c = pattern.col(inst, j);
                row[j] = dot(&dout[r * d..][..d], &vi[c * d..][..d]);
            }
            softmax_grad_row(budget, scale, |j| probs[start + j].widen(), &mut row[range]);
        }
    });

    if let Some(q_grad) = q_grad {
        ctx.launch_rows(q_grad.alloc::<T>()?, block, |inst, row| {
            let (ds, ki) = (&ds[inst * nnz..][..nnz], &ks[inst * block..][..block]);
            let scratch = ctx.scratch();
            let mut acc = scratch.alloc::<T::Accum>(d);
            for r in 0..dims.m {
                acc.fill(T::Accum::from_f64(0.0));
                for j in pattern.row(inst, r) {
                    let c = pattern.col(inst, j);
                    for (a, &x) in acc.iter_mut().zip(&ki[c * d..][..d]) {
                        *a += ds[j] * x.widen();
                    }
                }
                for (dst, &a) in row[r * d..][..d].iter_mut().zip(acc.iter()) {
                    *dst = T::narrow(a);
                }
            }
        });
    }

    if let Some(k_grad) = k_grad {
        ctx.launch_rows(k_grad.alloc::<T>()?, block, |inst, row| {
            let (ds, qi) = (&ds[inst * nnz..][..nnz], &qs[inst * block..][..block]);
            let scratch = ctx.scratch();
            let mut acc = scratch.alloc::<T::Accum>(block);
            for r in 0..dims.m {
                for j in pattern.row(inst, r) {
                    let c = pattern.col(inst, j);
                    for (a, &x) in acc[c * d..][..d].iter_mut().zip(&qi[r * d..][..d]) {
                        *a += ds[j] * x.widen();
                    }
                }
            }
            for (dst, &a) in row.iter_mut().zip(acc.iter()) {
                *dst = T::narrow(a);
            }
        });
    }
    Ok(())
}

/// Entry registered for backends whose toolkit lacks the sparse matmul
/// primitives.
pub fn sparse_attention_unavailable<T: WithDType>(ctx: &DeviceContext, _args: &mut KernelArgs<'_>) -> Result<()> {
    Err(Error::Unimplemented(format!(
        "block-sparse attention on {} requires sparse matmul support",
        ctx.backend()
    )))
}
