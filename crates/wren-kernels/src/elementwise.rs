use half::{bf16, f16};
use num_traits::NumCast;
use wren_core::{DType, DeviceContext, Result, Shape, Tensor, WithDType};
use wren_meta::infer::broadcast_with_axis;

use crate::dispatch::KernelArgs;

/// Strides that read an operand of shape `dims`, aligned at output dim
/// `start`, in output coordinates. Broadcast dims get stride 0.
fn broadcast_strides(out: &Shape, dims: &[usize], start: usize) -> Vec<usize> {
    let own = Shape::from(dims).stride_contiguous();
    (0..out.rank())
        .map(|k| match k.checked_sub(start) {
            Some(i) if i < dims.len() && dims[i] != 1 => own[i],
            _ => 0,
        })
        .collect()
}

fn gather_offset(mut p: usize, out_dims: &[usize], strides: &[usize]) -> usize {
    let mut off = 0;
    for k in (0..out_dims.len()).rev() {
        off += (p % out_dims[k]) * strides[k];
        p /= out_dims[k];
    }
    off
}

/// `add(x, y, axis = -1)`: broadcasting addition, `y` aligned at `axis` of
/// the larger operand. Integer sums wrap on overflow.
pub fn add<T: WithDType>(ctx: &DeviceContext, args: &mut KernelArgs<'_>) -> Result<()> {
    let x = args.input(0)?;
    let y = args.input(1)?;
    let axis = if args.attrs().contains("axis") {
        args.attrs().int("axis")?
    } else {
        -1
    };
    let shape = broadcast_with_axis(x.shape(), y.shape(), axis)?;
    let out = args.required_output(0)?;

    let diff = x.rank().abs_diff(y.rank());
    let start = if axis == -1 { diff } else { axis as usize };
    let (x_start, y_start) = if x.rank() >= y.rank() { (0, start) } else { (start, 0) };
    let xs_strides = broadcast_strides(&shape, x.dims(), x_start);
    let ys_strides = broadcast_strides(&shape, y.dims(), y_start);

    let (xs, ys) = (x.data::<T>()?, y.data::<T>()?);
    let dims = shape.dims();
    ctx.launch_map(out.alloc::<T>()?, |p| {
        xs[gather_offset(p, dims, &xs_strides)].wrapping_add(ys[gather_offset(p, dims, &ys_strides)])
    });
    Ok(())
}

/// Exact where the value fits the target. Values out of range (or NaN into
/// an integer) saturate through f64.
fn convert<S: WithDType, D: WithDType>(ctx: &DeviceContext, src: &[S], out: &mut Tensor) -> Result<()> {
    ctx.launch_map(out.alloc::<D>()?, |i| {
        <D as NumCast>::from(src[i]).unwrap_or_else(|| D::from_f64(src[i].to_f64()))
    });
    Ok(())
}

/// `cast(x, out_dtype)`. Registered per source dtype; the target comes from
/// the output descriptor.
pub fn cast<T: WithDType>(ctx: &DeviceContext, args: &mut KernelArgs<'_>) -> Result<()> {
    let src = args.input(0)?.data::<T>()?;
    let out = args.required_output(0)?;
    match out.dtype() {
        DType::F16 => convert::<T, f16>(ctx, src, out),
        DType::BF16 => convert::<T, bf16>(ctx, src, out),
        DType::F32 => convert::<T, f32>(ctx, src, out),
        DType::F64 => convert::<T, f64>(ctx, src, out),
        DType::I32 => convert::<T, i32>(ctx, src, out),
        DType::I64 => convert::<T, i64>(ctx, src, out),
        DType::U8 => convert::<T, u8>(ctx, src, out),
    }
}

/// `assign(x)`: copy into a fresh output.
pub fn assign<T: WithDType>(_ctx: &DeviceContext, args: &mut KernelArgs<'_>) -> Result<()> {
    let src = args.input(0)?.data::<T>()?;
    args.required_output(0)?.alloc::<T>()?.copy_from_slice(src);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use wren_core::TensorDesc;
    use wren_meta::AttrMap;

    fn run_add(x: &Tensor, y: &Tensor, attrs: &AttrMap, out_dims: &[usize]) -> Vec<f32> {
        let mut out = Tensor::uninit(TensorDesc::new(out_dims, DType::F32));
        let ctx = DeviceContext::cpu();
        let mut args = KernelArgs::new(vec![Some(x), Some(y)], attrs, vec![Some(&mut out)]);
        add::<f32>(&ctx, &mut args).unwrap();
        out.data::<f32>().unwrap().to_vec()
    }

    #[test]
    fn test_add_trailing_broadcast() {
        let x = Tensor::from_vec(vec![0.0f32, 1.0, 2.0, 3.0, 4.0, 5.0], (2, 3)).unwrap();
        let y = Tensor::from_vec(vec![10.0f32, 20.0, 30.0], 3).unwrap();
        let out = run_add(&x, &y, &AttrMap::new(), &[2, 3]);
        assert_eq!(out, vec![10.0, 21.0, 32.0, 13.0, 24.0, 35.0]);
    }

    #[test]
    fn test_add_axis_alignment() {
        let x = Tensor::from_vec(vec![0.0f32; 6], (2, 3)).unwrap();
        let y = Tensor::from_vec(vec![1.0f32, 2.0], 2).unwrap();
        let attrs = AttrMap::new().with("axis", 0i64);
        let out = run_add(&x, &y, &attrs, &[2, 3]);
        assert_eq!(out, vec![1.0, 1.0, 1.0, 2.0, 2.0, 2.0]);
    }

    #[test]
    fn test_add_when_y_is_larger() {
        let x = Tensor::from_vec(vec![1.0f32, 2.0], 2).unwrap();
        let y = Tensor::from_vec(vec![0.0f32, 100.0], (2, 1)).unwrap();
        let out = run_add(&x, &y, &AttrMap::new(), &[2, 2]);
        assert_eq!(out, vec![1.0, 2.0, 101.0, 102.0]);
    }

    #[test]
    fn test_cast_follows_output_dtype() {
        let x = Tensor::from_vec(vec![1.5f32, -2.0, 3.25], 3).unwrap();
        let attrs = AttrMap::new();
        let mut out = Tensor::uninit(TensorDesc::new(3, DType::F16));
        let ctx = DeviceContext::cpu();
        let mut args = KernelArgs::new(vec![Some(&x)], &attrs, vec![Some(&mut out)]);
        cast::<f32>(&ctx, &mut args).unwrap();
        assert_eq!(out.to_f64_vec().unwrap(), vec![1.5, -2.0, 3.25]);
    }

    fn run_cast<T: WithDType>(x: &Tensor, to: DType) -> Tensor {
        let attrs = AttrMap::new();
        let mut out = Tensor::uninit(TensorDesc::new(x.dims(), to));
        let ctx = DeviceContext::cpu();
        let mut args = KernelArgs::new(vec![Some(x)], &attrs, vec![Some(&mut out)]);
        cast::<T>(&ctx, &mut args).unwrap();
        out
    }

    #[test]
    fn test_integer_add_wraps() {
        let x = Tensor::from_vec(vec![i32::MAX, 5], 2).unwrap();
        let y = Tensor::from_vec(vec![1i32], 1).unwrap();
        let attrs = AttrMap::new();
        let mut out = Tensor::uninit(TensorDesc::new(2, DType::I32));
        let ctx = DeviceContext::cpu();
        let mut args = KernelArgs::new(vec![Some(&x), Some(&y)], &attrs, vec![Some(&mut out)]);
        add::<i32>(&ctx, &mut args).unwrap();
        assert_eq!(out.data::<i32>().unwrap(), &[i32::MIN, 6]);
    }

    #[test]
    fn test_cast_keeps_wide_integers_exact() {
        let big = (1i64 << 53) + 1;
        let x = Tensor::from_vec(vec![big, -big, i64::MAX], 3).unwrap();
        let out = run_cast::<i64>(&x, DType::I64);
        assert_eq!(out.data::<i64>().unwrap(), &[big, -big, i64::MAX]);

        let small = Tensor::from_vec(vec![7i32, -3], 2).unwrap();
        let out = run_cast::<i32>(&small, DType::I64);
        assert_eq!(out.data::<i64>().unwrap(), &[7, -3]);
    }

    #[test]
    fn test_cast_out_of_range_saturates() {
        let x = Tensor::from_vec(vec![1e10f64, -1e10, f64::NAN, 300.0, -2.7], 5).unwrap();
        let out = run_cast::<f64>(&x, DType::I32);
        assert_eq!(out.data::<i32>().unwrap(), &[i32::MAX, i32::MIN, 0, 300, -2]);
        let out = run_cast::<f64>(&x, DType::U8);
        assert_eq!(out.data::<u8>().unwrap(), &[255, 0, 0, 255, 0]);
    }

    #[test]
    fn test_assign_copies() {
        let x = Tensor::from_vec(vec![7i64, 8, 9], 3).unwrap();
        let attrs = AttrMap::new();
        let mut out = Tensor::uninit(x.desc().clone());
        let ctx = DeviceContext::cpu();
        let mut args = KernelArgs::new(vec![Some(&x)], &attrs, vec![Some(&mut out)]);
        assign::<i64>(&ctx, &mut args).unwrap();
        assert_eq!(out.data::<i64>().unwrap(), &[7, 8, 9]);
    }
}
