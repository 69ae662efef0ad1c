use wren_core::layout::{inverse_perm, validate_perm};
use wren_core::{DeviceContext, Layout, Result, Shape, WithDType};

use crate::dispatch::KernelArgs;

/// Gather `src` (contiguous, `dims`) into `dst` in the order of `perm`:
/// output dim `i` is input dim `perm[i]`. Pure data movement.
pub fn permute_into<T>(ctx: &DeviceContext, src: &[T], dims: &[usize], perm: &[usize], dst: &mut [T]) -> Result<()>
where
    T: Copy + Send + Sync,
{
    let view = Layout::contiguous(Shape::from(dims)).permute(perm)?;
    let gather: Vec<usize> = view.strided_indices().collect();
    wren_core::ensure!(
        gather.len() == dst.len() && src.len() == dst.len(),
        "permute of {} elements into {}",
        src.len(),
        dst.len()
    );
    ctx.launch_map(dst, |i| src[gather[i]]);
    Ok(())
}

/// Dims after applying `perm`.
pub fn permuted_dims(dims: &[usize], perm: &[usize]) -> Vec<usize> {
    perm.iter().map(|&p| dims[p]).collect()
}

fn perm_attr(args: &KernelArgs<'_>, rank: usize) -> Result<Vec<usize>> {
    let perm = args
        .attrs()
        .ints("perm")?
        .iter()
        .map(|&p| if p < 0 { p + rank as i64 } else { p })
        .map(|p| usize::try_from(p).unwrap_or(usize::MAX))
        .collect::<Vec<_>>();
    validate_perm(&perm, rank)?;
    Ok(perm)
}

/// `transpose(x, perm)`.
pub fn transpose<T: WithDType>(ctx: &DeviceContext, args: &mut KernelArgs<'_>) -> Result<()> {
    let x = args.input(0)?;
    let perm = perm_attr(args, x.rank())?;
    let out = args.required_output(0)?;
    permute_into(ctx, x.data::<T>()?, x.dims(), &perm, out.alloc::<T>()?)
}

/// `transpose_grad(out_grad, perm)`: applies the inverse permutation.
pub fn transpose_grad<T: WithDType>(ctx: &DeviceContext, args: &mut KernelArgs<'_>) -> Result<()> {
    let g = args.input(0)?;
    let perm = perm_attr(args, g.rank())?;
    let inv = inverse_perm(&perm);
    let x_grad = args.required_output(0)?;
    permute_into(ctx, g.data::<T>()?, g.dims(), &inv, x_grad.alloc::<T>()?)
}
