use std::ops::AddAssign;

use num_traits::Float;
use wren_core::{
    bail, ensure, DataLayout, DeviceContext, Error, FloatDType, Result, ScratchBuf, ScratchGuard, Tensor,
};
use wren_meta::{ConvAttrs, ConvGeometry};

use crate::dispatch::KernelArgs;
use crate::transpose::permute_into;

// Convolution: Forward and gradient kernels (2-D, 3-D, depthwise)
//
// Every entry point funnels into one channel-first numeric core:
//
//   1. widen      storage T -> accumulator A (f32 for half types, f64 for f64)
//   2. reorder    channel-last input/filter/out_grad are permuted to
//                 channel-first scratch copies ([N,H,W,C] -> [N,C,H,W],
//                 filter [F,kh,kw,C/g] -> [F,C/g,kh,kw])
//   3. compute    im2col + GEMM, per group, 2-D treated as depth 1
//   4. write      permute back if channel-last, narrow A -> T once
//
// Work is split so every output row has one writer: the forward pass runs
// one item per (sample, filter), filter_grad one item per filter (summing
// over the batch), input_grad one item per sample.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConvKind {
    Conv2d,
    Conv3d,
    Depthwise,
}

impl ConvKind {
    fn name(&self) -> &'static str {
        match self {
            ConvKind::Conv2d => "conv2d",
            ConvKind::Conv3d => "conv3d",
            ConvKind::Depthwise => "depthwise_conv2d",
        }
    }

    fn rank(&self) -> usize {
        match self {
            ConvKind::Conv3d => 5,
            _ => 4,
        }
    }
}

/// Channel-first problem dimensions; 2-D problems get depth 1.
#[derive(Debug, Clone)]
struct ConvPlan {
    batch: usize,
    in_c: usize,
    out_c: usize,
    groups: usize,
    in_sp: [usize; 3],
    k: [usize; 3],
    out_sp: [usize; 3],
    stride: [usize; 3],
    dil: [usize; 3],
    pad: [usize; 3],
}

fn lift(v: &[usize], fill: usize) -> [usize; 3] {
    match v {
        [d, h, w] => [*d, *h, *w],
        [h, w] => [fill, *h, *w],
        _ => [fill, fill, fill],
    }
}

impl ConvPlan {
    fn new(g: &ConvGeometry) -> Self {
        let before: Vec<usize> = g.pads.iter().map(|p| p.0).collect();
        ConvPlan {
            batch: g.batch,
            in_c: g.in_channels,
            out_c: g.out_channels,
            groups: g.groups,
            in_sp: lift(&g.in_spatial, 1),
            k: lift(&g.kernel, 1),
            out_sp: lift(&g.out_spatial, 1),
            stride: lift(&g.strides, 1),
            dil: lift(&g.dilations, 1),
            pad: lift(&before, 0),
        }
    }

    fn cg(&self) -> usize {
        self.in_c / self.groups
    }

    fn fg(&self) -> usize {
        self.out_c / self.groups
    }

    fn in_vol(&self) -> usize {
        self.in_sp.iter().product()
    }

    fn out_vol(&self) -> usize {
        self.out_sp.iter().product()
    }

    /// Rows of one group's column matrix: C/g * kd * kh * kw.
    fn col_rows(&self) -> usize {
        self.cg() * self.k.iter().product::<usize>()
    }

    fn col_size(&self) -> usize {
        self.col_rows() * self.out_vol()
    }

    fn in_sample(&self) -> usize {
        self.in_c * self.in_vol()
    }

    /// Input position read by output `o` through kernel tap `k` along `axis`.
    #[inline]
    fn tap(&self, axis: usize, o: usize, k: usize) -> Option<usize> {
        let i = (o * self.stride[axis] + k * self.dil[axis]) as isize - self.pad[axis] as isize;
        (i >= 0 && (i as usize) < self.in_sp[axis]).then_some(i as usize)
    }

    /// Call `f(column_entry, input_element)` for every in-bounds tap of one
    /// group.
    #[inline]
    fn for_each_tap(&self, mut f: impl FnMut(usize, usize)) {
        let [id, ih, iw] = self.in_sp;
        let [kd, kh, kw] = self.k;
        let [od, oh, ow] = self.out_sp;
        let cols = self.out_vol();
        for c in 0..self.cg() {
            for a in 0..kd {
                for b in 0..kh {
                    for e in 0..kw {
                        let row = ((c * kd + a) * kh + b) * kw + e;
                        for z in 0..od {
                            let Some(iz) = self.tap(0, z, a) else { continue };
                            for y in 0..oh {
                                let Some(iy) = self.tap(1, y, b) else { continue };
                                for x in 0..ow {
                                    let Some(ix) = self.tap(2, x, e) else { continue };
                                    let col = (z * oh + y) * ow + x;
                                    f(row * cols + col, ((c * id + iz) * ih + iy) * iw + ix);
                                }
                            }
                        }
                    }
                }
            }
        }
    }
}

/// columns[C/g * k, out_vol] of one (sample, group) input slice `[C/g, in_vol]`.
fn im2col<A: Float>(plan: &ConvPlan, input: &[A], columns: &mut [A]) {
    columns.fill(A::zero());
    plan.for_each_tap(|c, i| columns[c] = input[i]);
}

/// Scatter-add columns back into an input-shaped slice.
fn col2im<A: Float + AddAssign>(plan: &ConvPlan, columns: &[A], out: &mut [A]) {
    plan.for_each_tap(|c, i| out[i] += columns[c]);
}

/// Copy `t` into accumulator scratch, channel-first.
fn widen_channel_first<'s, T: FloatDType>(
    ctx: &DeviceContext,
    scratch: &ScratchGuard<'s>,
    t: &Tensor,
    channel_last: bool,
) -> Result<ScratchBuf<'s, T::Accum>> {
    let data = t.data::<T>()?;
    let mut wide = scratch.alloc::<T::Accum>(data.len());
    ctx.launch_map(&mut wide, |i| data[i].widen());
    if !channel_last {
        return Ok(wide);
    }
    let mut first = scratch.alloc::<T::Accum>(data.len());
    permute_into(
        ctx,
        &wide,
        t.dims(),
        &DataLayout::to_channel_first_perm(t.rank()),
        &mut first,
    )?;
    Ok(first)
}

/// Narrow channel-first accumulators (`cf_dims`) into `out`, permuting
/// back to channel-last when needed.
fn narrow_into<T: FloatDType>(
    ctx: &DeviceContext,
    scratch: &ScratchGuard<'_>,
    acc: &[T::Accum],
    cf_dims: &[usize],
    channel_last: bool,
    out: &mut Tensor,
) -> Result<()> {
    ensure!(
        out.numel() == acc.len(),
        "output {} cannot hold {} elements",
        out.shape(),
        acc.len()
    );
    let dst = out.alloc::<T>()?;
    if channel_last {
        let mut last = scratch.alloc::<T::Accum>(acc.len());
        permute_into(
            ctx,
            acc,
            cf_dims,
            &DataLayout::to_channel_last_perm(cf_dims.len()),
            &mut last,
        )?;
        let last: &[T::Accum] = &last;
        ctx.launch_map(dst, |i| T::narrow(last[i]));
    } else {
        ctx.launch_map(dst, |i| T::narrow(acc[i]));
    }
    Ok(())
}

/// Column matrices of every (sample, group), `[batch * groups, col_size]`.
fn build_columns<'s, A: Float + Send + Sync + wren_core::WithDType>(
    ctx: &DeviceContext,
    scratch: &ScratchGuard<'s>,
    plan: &ConvPlan,
    x: &[A],
) -> ScratchBuf<'s, A> {
    let mut cols = scratch.alloc::<A>(plan.batch * plan.groups * plan.col_size());
    let group_len = plan.cg() * plan.in_vol();
    ctx.launch_rows(&mut cols, plan.col_size(), |r, row| {
        let (n, g) = (r / plan.groups, r % plan.groups);
        let start = n * plan.in_sample() + g * group_len;
        im2col(plan, &x[start..start + group_len], row);
    });
    cols
}

fn check_entry(kind: ConvKind, attrs: &ConvAttrs, input: &Tensor, filter: &Tensor) -> Result<()> {
    if attrs.data_format == "NDHWC" {
        bail!("{} does not support data_format NDHWC", kind.name());
    }
    ensure!(
        input.rank() == kind.rank(),
        "{} expects a rank-{} input, got {}",
        kind.name(),
        kind.rank(),
        input.shape()
    );
    ensure!(
        input.dtype() == filter.dtype(),
        "{} input dtype {} differs from filter dtype {}",
        kind.name(),
        input.dtype(),
        filter.dtype()
    );
    Ok(())
}

fn geometry(kind: ConvKind, attrs: &ConvAttrs, input: &Tensor, filter: &Tensor) -> Result<ConvGeometry> {
    let geom = ConvGeometry::new(input.dims(), filter.dims(), attrs)?;
    if kind == ConvKind::Depthwise {
        ensure!(
            geom.groups == geom.in_channels,
            "depthwise_conv2d needs groups == input channels, got groups {} for {} channels",
            geom.groups,
            geom.in_channels
        );
    }
    Ok(geom)
}

/// Channel-first dims of the filter: [F, C/g, k..].
fn filter_cf_dims(geom: &ConvGeometry) -> Vec<usize> {
    let mut d = vec![geom.out_channels, geom.in_channels / geom.groups];
    d.extend(&geom.kernel);
    d
}

fn input_cf_dims(geom: &ConvGeometry) -> Vec<usize> {
    let mut d = vec![geom.batch, geom.in_channels];
    d.extend(&geom.in_spatial);
    d
}

fn output_cf_dims(geom: &ConvGeometry) -> Vec<usize> {
    let mut d = vec![geom.batch, geom.out_channels];
    d.extend(&geom.out_spatial);
    d
}

fn conv_forward<T: FloatDType>(ctx: &DeviceContext, args: &mut KernelArgs<'_>, kind: ConvKind) -> Result<()> {
    let input = args.input(0)?;
    let filter = args.input(1)?;
    let attrs = ConvAttrs::from_attrs(args.attrs())?;
    check_entry(kind, &attrs, input, filter)?;
    let geom = geometry(kind, &attrs, input, filter)?;
    let out = args.required_output(0)?;
    ensure!(
        out.dims() == geom.output_dims().as_slice(),
        "{} output {} does not match inferred {:?}",
        kind.name(),
        out.shape(),
        geom.output_dims()
    );

    let plan = ConvPlan::new(&geom);
    let scratch = ctx.scratch();
    let x = widen_channel_first::<T>(ctx, &scratch, input, geom.channel_last)?;
    let w = widen_channel_first::<T>(ctx, &scratch, filter, geom.channel_last)?;
    let cols = build_columns(ctx, &scratch, &plan, &x);
    let (cols, w): (&[T::Accum], &[T::Accum]) = (&cols, &w);

    let (col_rows, out_vol, col_size) = (plan.col_rows(), plan.out_vol(), plan.col_size());
    let mut y = scratch.alloc::<T::Accum>(plan.batch * plan.out_c * out_vol);
    ctx.launch_rows(&mut y, out_vol, |r, row| {
        let (n, f) = (r / plan.out_c, r % plan.out_c);
        let g = f / plan.fg();
        let col = &cols[(n * plan.groups + g) * col_size..][..col_size];
        let wrow = &w[f * col_rows..][..col_rows];
        for (k, &wv) in wrow.iter().enumerate() {
            let crow = &col[k * out_vol..][..out_vol];
            for (o, &c) in row.iter_mut().zip(crow) {
                *o += wv * c;
            }
        }
    });
    narrow_into::<T>(ctx, &scratch, &y, &output_cf_dims(&geom), geom.channel_last, out)?;
    tracing::trace!(op = kind.name(), out = %out.shape(), "conv forward");
    Ok(())
}

fn conv_backward<T: FloatDType>(ctx: &DeviceContext, args: &mut KernelArgs<'_>, kind: ConvKind) -> Result<()> {
    let input_grad = args.take_output(0);
    let filter_grad = args.take_output(1);
    if input_grad.is_none() && filter_grad.is_none() {
        return Ok(());
    }
    let input = args.input(0)?;
    let filter = args.input(1)?;
    let out_grad = args.input(2)?;
    let attrs = ConvAttrs::from_attrs(args.attrs())?;
    check_entry(kind, &attrs, input, filter)?;
    let geom = geometry(kind, &attrs, input, filter)?;
    if out_grad.dims() != geom.output_dims().as_slice() {
        return Err(Error::ShapeMismatch {
            lhs: out_grad.shape().clone(),
            rhs: geom.output_dims().into(),
            reason: format!("{}_grad out_grad must match the forward output", kind.name()),
        });
    }

    let plan = ConvPlan::new(&geom);
    let scratch = ctx.scratch();
    let dy = widen_channel_first::<T>(ctx, &scratch, out_grad, geom.channel_last)?;
    let dy: &[T::Accum] = &dy;
    let (col_rows, out_vol, col_size) = (plan.col_rows(), plan.out_vol(), plan.col_size());

    if let Some(filter_grad) = filter_grad {
        let x = widen_channel_first::<T>(ctx, &scratch, input, geom.channel_last)?;
        let cols = build_columns(ctx, &scratch, &plan, &x);
        let cols: &[T::Accum] = &cols;
        let mut dw = scratch.alloc::<T::Accum>(plan.out_c * col_rows);
        // dW[f] = sum_n dY[n, f] x columns[n, g]^T
        ctx.launch_rows(&mut dw, col_rows, |f, row| {
            let g = f / plan.fg();
            for n in 0..plan.batch {
                let dyrow = &dy[(n * plan.out_c + f) * out_vol..][..out_vol];
                let col = &cols[(n * plan.groups + g) * col_size..][..col_size];
                for (r, acc) in row.iter_mut().enumerate() {
                    let crow = &col[r * out_vol..][..out_vol];
                    *acc += dyrow.iter().zip(crow).map(|(&a, &b)| a * b).sum::<T::Accum>();
                }
            }
        });
        narrow_into::<T>(ctx, &scratch, &dw, &filter_cf_dims(&geom), geom.channel_last, filter_grad)?;
    }

    if let Some(input_grad) = input_grad {
        let w = widen_channel_first::<T>(ctx, &scratch, filter, geom.channel_last)?;
        let w: &[T::Accum] = &w;
        let group_len = plan.cg() * plan.in_vol();
        let mut dx = scratch.alloc::<T::Accum>(plan.batch * plan.in_sample());
        // dX[n, g] = col2im(W_g^T x dY[n, g])
        ctx.launch_rows(&mut dx, plan.in_sample(), |n, row| {
            let mut col = ctx.scratch().alloc::<T::Accum>(col_size);
            for g in 0..plan.groups {
                col.fill(<T::Accum as num_traits::Zero>::zero());
                for f in g * plan.fg()..(g + 1) * plan.fg() {
                    let wrow = &w[f * col_rows..][..col_rows];
                    let dyrow = &dy[(n * plan.out_c + f) * out_vol..][..out_vol];
                    for (r, &wv) in wrow.iter().enumerate() {
                        for (c, &d) in col[r * out_vol..][..out_vol].iter_mut().zip(dyrow) {
                            *c += wv * d;
                        }
                    }
                }
                col2im(&plan, &col, &mut row[g * group_len..][..group_len]);
            }
        });
        narrow_into::<T>(ctx, &scratch, &dx, &input_cf_dims(&geom), geom.channel_last, input_grad)?;
    }
    tracing::trace!(op = kind.name(), "conv backward");
    Ok(())
}

pub fn conv2d<T: FloatDType>(ctx: &DeviceContext, args: &mut KernelArgs<'_>) -> Result<()> {
    conv_forward::<T>(ctx, args, ConvKind::Conv2d)
}

pub fn conv3d<T: FloatDType>(ctx: &DeviceContext, args: &mut KernelArgs<'_>) -> Result<()> {
    conv_forward::<T>(ctx, args, ConvKind::Conv3d)
}

pub fn depthwise_conv2d<T: FloatDType>(ctx: &DeviceContext, args: &mut KernelArgs<'_>) -> Result<()> {
    conv_forward::<T>(ctx, args, ConvKind::Depthwise)
}

/// Gradients of `conv2d`. Inputs `input, filter, out_grad`; outputs
/// `input_grad, filter_grad`, each optional. With neither requested the
/// call returns immediately.
pub fn conv2d_grad<T: FloatDType>(ctx: &DeviceContext, args: &mut KernelArgs<'_>) -> Result<()> {
    conv_backward::<T>(ctx, args, ConvKind::Conv2d)
}

pub fn conv3d_grad<T: FloatDType>(ctx: &DeviceContext, args: &mut KernelArgs<'_>) -> Result<()> {
    conv_backward::<T>(ctx, args, ConvKind::Conv3d)
}

pub fn depthwise_conv2d_grad<T: FloatDType>(ctx: &DeviceContext, args: &mut KernelArgs<'_>) -> Result<()> {
    conv_backward::<T>(ctx, args, ConvKind::Depthwise)
}
