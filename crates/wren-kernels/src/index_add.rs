use wren_core::{bail, ensure, DType, DeviceContext, IndexDType, Result, Tensor, WithDType};

use crate::dispatch::KernelArgs;

// Index-add: Scatter-add along one axis and its gradient
//
// With x viewed as [outer, dim, inner] around `axis`:
//
//   forward   out[o, index[i], n] = x[o, index[i], n] + add_value[o, i, n]
//   backward  x_grad = out_grad
//             add_value_grad[o, i, n] = out_grad[o, index[i], n]
//
// The backward gather is written in flat form: for flat position p of
// add_value_grad with stride = inner and size = len(index),
//
//   outer = p / (stride * size)
//   sel   = (p % (stride * size)) / stride
//   src   = p + (delta * outer + index[sel] - sel) * stride
//
// where delta = out_grad.dim(axis) - size. Index values may be negative and
// count from the end of the axis.

fn normalize_axis(axis: i64, rank: usize) -> Result<usize> {
    let a = if axis < 0 { axis + rank as i64 } else { axis };
    ensure!(
        a >= 0 && (a as usize) < rank,
        "axis {axis} is out of range for a rank-{rank} tensor"
    );
    Ok(a as usize)
}

/// Index values as in-range positions along an axis of length `dim`.
fn normalized_indices<I: IndexDType>(index: &[I], dim: usize) -> Result<Vec<usize>> {
    index
        .iter()
        .map(|&v| {
            let raw = v.as_i64();
            let i = if raw < 0 { raw + dim as i64 } else { raw };
            ensure!(
                i >= 0 && (i as usize) < dim,
                "index {raw} is out of range for an axis of size {dim}"
            );
            Ok(i as usize)
        })
        .collect()
}

fn read_indices(index: &Tensor, dim: usize) -> Result<Vec<usize>> {
    ensure!(index.rank() <= 1, "index must be 1-D, got shape {}", index.shape());
    match index.dtype() {
        DType::I32 => normalized_indices(index.data::<i32>()?, dim),
        DType::I64 => normalized_indices(index.data::<i64>()?, dim),
        other => bail!("index dtype must be int32 or int64, got {other}"),
    }
}

fn check_index_dtype(index: &Tensor) -> Result<()> {
    ensure!(
        index.dtype().is_index(),
        "index dtype must be int32 or int64, got {}",
        index.dtype()
    );
    Ok(())
}

/// `index_add(x, index, add_value, axis) -> out`. Integer sums wrap on
/// overflow.
pub fn index_add<T: WithDType>(ctx: &DeviceContext, args: &mut KernelArgs<'_>) -> Result<()> {
    let x = args.input(0)?;
    let index = args.input(1)?;
    let add_value = args.input(2)?;
    check_index_dtype(index)?;
    let axis = normalize_axis(args.attrs().int("axis")?, x.rank())?;
    let out = args.required_output(0)?;

    let dim = x.dims()[axis];
    let idx = read_indices(index, dim)?;
    let size = idx.len();
    let inner = x.shape().inner_size(axis);
    let outer = x.shape().outer_size(axis);
    ensure!(
        add_value.numel() == outer * size * inner,
        "add_value {} does not match x {} with {size} indices on axis {axis}",
        add_value.shape(),
        x.shape()
    );

    // Positions i of add_value that land on each slot of the axis, in order.
    let mut sources: Vec<Vec<usize>> = vec![Vec::new(); dim];
    for (i, &slot) in idx.iter().enumerate() {
        sources[slot].push(i);
    }

    let xs = x.data::<T>()?;
    let vs = add_value.data::<T>()?;
    ctx.launch_map(out.alloc::<T>()?, |p| {
        let o = p / (dim * inner);
        let slot = (p / inner) % dim;
        let n = p % inner;
        sources[slot]
            .iter()
            .fold(xs[p], |acc, &i| acc.wrapping_add(vs[(o * size + i) * inner + n]))
    });
    Ok(())
}

/// `index_add_grad(index, add_value, out_grad, axis) -> x_grad, add_value_grad`.
///
/// An empty `add_value` returns immediately and leaves both outputs
/// unallocated.
pub fn index_add_grad<T: WithDType>(ctx: &DeviceContext, args: &mut KernelArgs<'_>) -> Result<()> {
    let index = args.input(0)?;
    let add_value = args.input(1)?;
    let out_grad = args.input(2)?;
    check_index_dtype(index)?;
    if add_value.numel() == 0 {
        return Ok(());
    }
    let axis = normalize_axis(args.attrs().int("axis")?, out_grad.rank())?;
    let x_grad = args.take_output(0);
    let add_value_grad = args.take_output(1);

    let g = out_grad.data::<T>()?;
    if let Some(x_grad) = x_grad {
        x_grad.alloc::<T>()?.copy_from_slice(g);
    }

    if let Some(add_value_grad) = add_value_grad {
        let idx = read_indices(index, out_grad.dims()[axis])?;
        let stride = out_grad.shape().inner_size(axis);
        let size = idx.len();
        let delta = out_grad.dims()[axis] as i64 - size as i64;
        ensure!(
            add_value_grad.numel() == out_grad.shape().outer_size(axis) * size * stride,
            "add_value_grad {} does not match {size} indices on axis {axis} of {}",
            add_value_grad.shape(),
            out_grad.shape()
        );
        ctx.launch_map(add_value_grad.alloc::<T>()?, |p| {
            let outer = (p / (stride * size)) as i64;
            let sel = (p % (stride * size)) / stride;
            let src = p as i64 + (delta * outer + idx[sel] as i64 - sel as i64) * stride as i64;
            g[src as usize]
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use wren_core::{Error, TensorDesc};
    use wren_meta::AttrMap;

    #[test]
    fn test_forward_accumulates_duplicates() {
        let x = Tensor::from_vec(vec![0.0f32; 6], (2, 3)).unwrap();
        let index = Tensor::from_vec(vec![2i64, 2, -3], 3).unwrap();
        let add = Tensor::from_vec(vec![1.0f32, 2.0, 3.0, 4.0, 5.0, 6.0], (2, 3)).unwrap();
        let attrs = AttrMap::new().with("axis", 1i64);
        let mut out = Tensor::uninit(x.desc().clone());
        let ctx = DeviceContext::cpu();
        let mut args = KernelArgs::new(vec![Some(&x), Some(&index), Some(&add)], &attrs, vec![Some(&mut out)]);
        index_add::<f32>(&ctx, &mut args).unwrap();
        assert_eq!(out.data::<f32>().unwrap(), &[3.0, 0.0, 3.0, 6.0, 0.0, 9.0]);
    }

    #[test]
    fn test_integer_overflow_wraps() {
        let x = Tensor::from_vec(vec![i32::MAX, 0], 2).unwrap();
        let index = Tensor::from_vec(vec![0i64, 0], 2).unwrap();
        let add = Tensor::from_vec(vec![1i32, 1], 2).unwrap();
        let attrs = AttrMap::new().with("axis", 0i64);
        let mut out = Tensor::uninit(x.desc().clone());
        let ctx = DeviceContext::cpu();
        let mut args = KernelArgs::new(vec![Some(&x), Some(&index), Some(&add)], &attrs, vec![Some(&mut out)]);
        index_add::<i32>(&ctx, &mut args).unwrap();
        assert_eq!(out.data::<i32>().unwrap(), &[i32::MIN + 1, 0]);
    }

    #[test]
    fn test_grad_gathers_selected_slices() {
        // out_grad [2, 4], index [3, 0] along axis 1
        let out_grad = Tensor::from_vec((0..8).map(|v| v as f64).collect::<Vec<_>>(), (2, 4)).unwrap();
        let index = Tensor::from_vec(vec![3i32, 0], 2).unwrap();
        let add = Tensor::zeros(TensorDesc::new((2, 2), DType::F64));
        let attrs = AttrMap::new().with("axis", -1i64);
        let mut xg = Tensor::uninit(out_grad.desc().clone());
        let mut ag = Tensor::uninit(add.desc().clone());
        let ctx = DeviceContext::cpu();
        let mut args = KernelArgs::new(
            vec![Some(&index), Some(&add), Some(&out_grad)],
            &attrs,
            vec![Some(&mut xg), Some(&mut ag)],
        );
        index_add_grad::<f64>(&ctx, &mut args).unwrap();
        assert_eq!(xg.data::<f64>().unwrap(), out_grad.data::<f64>().unwrap());
        assert_eq!(ag.data::<f64>().unwrap(), &[3.0, 0.0, 7.0, 4.0]);
    }

    #[test]
    fn test_float_index_rejected() {
        let out_grad = Tensor::zeros(TensorDesc::new(4, DType::F32));
        let index = Tensor::zeros(TensorDesc::new(2, DType::F32));
        let add = Tensor::zeros(TensorDesc::new(2, DType::F32));
        let attrs = AttrMap::new().with("axis", 0i64);
        let mut xg = Tensor::uninit(out_grad.desc().clone());
        let ctx = DeviceContext::cpu();
        let mut args = KernelArgs::new(
            vec![Some(&index), Some(&add), Some(&out_grad)],
            &attrs,
            vec![Some(&mut xg), None],
        );
        assert!(matches!(index_add_grad::<f32>(&ctx, &mut args), Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn test_out_of_range_index_rejected() {
        let out_grad = Tensor::zeros(TensorDesc::new(4, DType::F32));
        let index = Tensor::from_vec(vec![4i64], 1).unwrap();
        let add = Tensor::zeros(TensorDesc::new(1, DType::F32));
        let attrs = AttrMap::new().with("axis", 0i64);
        let mut ag = Tensor::uninit(add.desc().clone());
        let ctx = DeviceContext::cpu();
        let mut args = KernelArgs::new(
            vec![Some(&index), Some(&add), Some(&out_grad)],
            &attrs,
            vec![None, Some(&mut ag)],
        );
        assert!(matches!(index_add_grad::<f32>(&ctx, &mut args), Err(Error::InvalidArgument(_))));
    }
}
