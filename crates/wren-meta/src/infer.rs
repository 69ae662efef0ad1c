use std::collections::HashMap;

use wren_core::layout::{inverse_perm, validate_perm};
use wren_core::{bail, ensure, DType, DataLayout, Error, Result, Shape, TensorDesc};

use crate::attr::{AttrMap, AttrValue};
use crate::padding::{ConvAttrs, ConvGeometry};
use crate::schema::OperatorSchema;

// Shape/Type Inference: Output descriptors before any kernel runs
//
// Each operator names an inference function in its declaration. The
// function sees the descriptors of the tensor params it listed (absent
// optional inputs are `None`) and the resolved attributes, and returns one
// descriptor per declared output. Inference never touches data, so a bad
// call fails here before any buffer is allocated.

/// One inference param, in declaration order.
#[derive(Debug, Clone, Copy)]
pub enum InferParam<'a> {
    Tensor(Option<&'a TensorDesc>),
    Attr(&'a AttrValue),
}

/// Everything an inference function may read.
#[derive(Debug, Clone)]
pub struct InferContext<'a> {
    op: &'a str,
    params: Vec<(&'a str, InferParam<'a>)>,
    attrs: &'a AttrMap,
    num_outputs: usize,
}

impl<'a> InferContext<'a> {
    pub fn new(op: &'a str, attrs: &'a AttrMap, num_outputs: usize) -> Self {
        InferContext {
            op,
            params: Vec::new(),
            attrs,
            num_outputs,
        }
    }

    /// Context for `schema`'s declared params. `input` returns the
    /// descriptor passed for a tensor arg, if any.
    pub fn from_schema(
        schema: &'a OperatorSchema,
        attrs: &'a AttrMap,
        input: impl Fn(&str) -> Option<&'a TensorDesc>,
    ) -> Result<Self> {
        let mut ctx = Self::new(&schema.name, attrs, schema.outputs.len());
        for p in &schema.infer_meta.params {
            let arg = schema
                .arg(p)
                .ok_or_else(|| Error::schema(&schema.name, format!("unknown infer param '{p}'")))?;
            if arg.is_tensor() {
                let desc = input(p);
                ensure!(
                    desc.is_some() || arg.optional,
                    "missing required input '{p}' of '{}'",
                    schema.name
                );
                ctx = ctx.tensor(p.as_str(), desc);
            } else {
                let value = attrs
                    .get(p)
                    .ok_or_else(|| Error::invalid(format!("attribute '{p}' was not resolved")))?;
                ctx.params.push((p.as_str(), InferParam::Attr(value)));
            }
        }
        Ok(ctx)
    }

    pub fn tensor(mut self, name: &'a str, desc: Option<&'a TensorDesc>) -> Self {
        self.params.push((name, InferParam::Tensor(desc)));
        self
    }

    pub fn op(&self) -> &str {
        self.op
    }

    pub fn attrs(&self) -> &AttrMap {
        self.attrs
    }

    pub fn num_outputs(&self) -> usize {
        self.num_outputs
    }

    pub fn params(&self) -> &[(&'a str, InferParam<'a>)] {
        &self.params
    }

    fn tensor_params(&self) -> impl Iterator<Item = (&'a str, Option<&'a TensorDesc>)> + '_ {
        self.params.iter().filter_map(|(n, p)| match p {
            InferParam::Tensor(d) => Some((*n, *d)),
            InferParam::Attr(_) => None,
        })
    }

    /// The `i`-th tensor param, which must be present.
    pub fn input(&self, i: usize) -> Result<&'a TensorDesc> {
        match self.tensor_params().nth(i) {
            Some((_, Some(d))) => Ok(d),
            Some((name, None)) => bail!("'{}' needs input '{name}'", self.op),
            None => bail!("'{}' declares fewer than {} tensor params", self.op, i + 1),
        }
    }

    /// The `i`-th tensor param, which may be absent.
    pub fn optional_input(&self, i: usize) -> Option<&'a TensorDesc> {
        self.tensor_params().nth(i).and_then(|(_, d)| d)
    }

    /// Number of tensor params.
    pub fn num_inputs(&self) -> usize {
        self.tensor_params().count()
    }
}

/// An inference function.
pub type InferMetaFn = fn(&InferContext<'_>) -> Result<Vec<TensorDesc>>;

/// Name-keyed inference functions.
#[derive(Debug, Clone)]
pub struct InferMetaRegistry {
    fns: HashMap<String, InferMetaFn>,
}

impl Default for InferMetaRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

impl InferMetaRegistry {
    pub fn empty() -> Self {
        InferMetaRegistry { fns: HashMap::new() }
    }

    /// Registry holding every built-in function.
    pub fn builtin() -> Self {
        let mut reg = Self::empty();
        let builtins: [(&str, InferMetaFn); 12] = [
            ("UnchangedInferMeta", unchanged),
            ("UnchangedExceptDtypeInferMeta", unchanged_except_dtype),
            ("ElementwiseInferMeta", elementwise),
            ("TransposeInferMeta", transpose),
            ("TransposeGradInferMeta", transpose_grad),
            ("ConvInferMeta", conv),
            ("GeneralBinaryGradInferMeta", general_binary_grad),
            ("IndexAddInferMeta", index_add),
            ("IndexAddGradInferMeta", index_add_grad),
            ("SparseAttentionInferMeta", sparse_attention),
            ("SparseAttentionGradInferMeta", sparse_attention_grad),
            ("GeneralTernaryGradInferMeta", general_ternary_grad),
        ];
        for (name, f) in builtins {
            reg.fns.insert(name.to_string(), f);
        }
        reg
    }

    pub fn register(&mut self, name: impl Into<String>, f: InferMetaFn) -> Result<()> {
        let name = name.into();
        if self.fns.contains_key(&name) {
            bail!("inference function '{name}' is already registered");
        }
        self.fns.insert(name, f);
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.fns.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Result<InferMetaFn> {
        self.fns
            .get(name)
            .copied()
            .ok_or_else(|| Error::invalid(format!("unknown inference function '{name}'")))
    }

    /// Run the function `schema` names and check it produced one descriptor
    /// per declared output.
    pub fn run(&self, schema: &OperatorSchema, ctx: &InferContext<'_>) -> Result<Vec<TensorDesc>> {
        let f = self.get(&schema.infer_meta.func)?;
        let outs = f(ctx)?;
        if outs.len() != schema.outputs.len() {
            return Err(Error::schema(
                &schema.name,
                format!(
                    "{} produced {} descriptors for {} outputs",
                    schema.infer_meta.func,
                    outs.len(),
                    schema.outputs.len()
                ),
            ));
        }
        tracing::trace!(op = %schema.name, outputs = ?outs.iter().map(|d| d.shape.to_string()).collect::<Vec<_>>(), "inferred");
        Ok(outs)
    }
}

// Built-in functions

/// Every output copies the first input.
pub fn unchanged(ctx: &InferContext<'_>) -> Result<Vec<TensorDesc>> {
    let x = ctx.input(0)?;
    Ok(vec![x.clone(); ctx.num_outputs()])
}

/// Like `unchanged`, with the dtype taken from an `out_dtype` or `dtype`
/// attribute when one is declared.
pub fn unchanged_except_dtype(ctx: &InferContext<'_>) -> Result<Vec<TensorDesc>> {
    let x = ctx.input(0)?;
    let attrs = ctx.attrs();
    let dtype = if attrs.contains("out_dtype") {
        attrs.dtype("out_dtype")?
    } else if attrs.contains("dtype") {
        attrs.dtype("dtype")?
    } else {
        x.dtype
    };
    Ok(vec![x.clone().with_dtype(dtype); ctx.num_outputs()])
}

/// Broadcast two shapes, aligning the smaller one at `axis` of the larger.
/// `axis == -1` aligns trailing dims.
pub fn broadcast_with_axis(x: &Shape, y: &Shape, axis: i64) -> Result<Shape> {
    let (big, small) = if x.rank() >= y.rank() { (x, y) } else { (y, x) };
    let diff = big.rank() - small.rank();
    let axis = if axis == -1 { diff as i64 } else { axis };
    ensure!(
        axis >= 0 && axis as usize <= diff,
        "axis {axis} does not align {} inside {}",
        small,
        big
    );
    let axis = axis as usize;
    let mut dims = big.dims().to_vec();
    for (i, &s) in small.dims().iter().enumerate() {
        let b = big.dims()[axis + i];
        dims[axis + i] = if b == s || s == 1 {
            b
        } else if b == 1 {
            s
        } else {
            return Err(Error::ShapeMismatch {
                lhs: x.clone(),
                rhs: y.clone(),
                reason: format!("dim {} is {b} vs {s}", axis + i),
            });
        };
    }
    Ok(Shape::new(dims))
}

pub fn elementwise(ctx: &InferContext<'_>) -> Result<Vec<TensorDesc>> {
    let x = ctx.input(0)?;
    let y = ctx.input(1)?;
    ensure!(
        x.dtype == y.dtype,
        "'{}' operands differ in dtype: {} vs {}",
        ctx.op(),
        x.dtype,
        y.dtype
    );
    let axis = if ctx.attrs().contains("axis") {
        ctx.attrs().int("axis")?
    } else {
        -1
    };
    let shape = broadcast_with_axis(&x.shape, &y.shape, axis)?;
    let primary = if x.rank() >= y.rank() { x } else { y };
    Ok(vec![primary.clone().with_shape(shape); ctx.num_outputs()])
}

fn normalized_perm(ctx: &InferContext<'_>, rank: usize) -> Result<Vec<usize>> {
    let perm = ctx
        .attrs()
        .ints("perm")?
        .iter()
        .map(|&p| {
            let q = if p < 0 { p + rank as i64 } else { p };
            ensure!(q >= 0 && (q as usize) < rank, "perm entry {p} out of range for rank {rank}");
            Ok(q as usize)
        })
        .collect::<Result<Vec<_>>>()?;
    validate_perm(&perm, rank)?;
    Ok(perm)
}

/// Output dim `i` is input dim `perm[i]`. Negative entries count from the
/// back. The result carries no channel semantics.
pub fn transpose(ctx: &InferContext<'_>) -> Result<Vec<TensorDesc>> {
    let x = ctx.input(0)?;
    let perm = normalized_perm(ctx, x.rank())?;
    let dims: Vec<usize> = perm.iter().map(|&p| x.dims()[p]).collect();
    Ok(vec![
        x.clone().with_shape(dims).with_layout(DataLayout::Plain);
        ctx.num_outputs()
    ])
}

/// Gradient of transpose: undo `perm`.
pub fn transpose_grad(ctx: &InferContext<'_>) -> Result<Vec<TensorDesc>> {
    let g = ctx.input(0)?;
    let perm = normalized_perm(ctx, g.rank())?;
    let inv = inverse_perm(&perm);
    let dims: Vec<usize> = inv.iter().map(|&p| g.dims()[p]).collect();
    Ok(vec![
        g.clone().with_shape(dims).with_layout(DataLayout::Plain);
        ctx.num_outputs()
    ])
}

/// 2-D and 3-D convolution forward.
pub fn conv(ctx: &InferContext<'_>) -> Result<Vec<TensorDesc>> {
    let input = ctx.input(0)?;
    let filter = ctx.input(1)?;
    ensure!(
        input.dtype == filter.dtype,
        "conv input dtype {} differs from filter dtype {}",
        input.dtype,
        filter.dtype
    );
    let attrs = ConvAttrs::from_attrs(ctx.attrs())?;
    let geom = ConvGeometry::new(input.dims(), filter.dims(), &attrs)?;
    let layout = match (geom.spatial_rank(), geom.channel_last) {
        (2, false) => DataLayout::Nchw,
        (2, true) => DataLayout::Nhwc,
        (_, false) => DataLayout::Ncdhw,
        (_, true) => DataLayout::Ndhwc,
    };
    Ok(vec![input
        .clone()
        .with_shape(geom.output_dims())
        .with_layout(layout)])
}

/// Outputs take the descriptors of the first two inputs (`dx`, `dy`).
pub fn general_binary_grad(ctx: &InferContext<'_>) -> Result<Vec<TensorDesc>> {
    ensure!(
        ctx.num_outputs() == 2,
        "GeneralBinaryGradInferMeta needs 2 outputs, '{}' has {}",
        ctx.op(),
        ctx.num_outputs()
    );
    Ok(vec![ctx.input(0)?.clone(), ctx.input(1)?.clone()])
}

/// Outputs take the descriptors of the first three inputs.
pub fn general_ternary_grad(ctx: &InferContext<'_>) -> Result<Vec<TensorDesc>> {
    ensure!(
        ctx.num_outputs() == 3,
        "GeneralTernaryGradInferMeta needs 3 outputs, '{}' has {}",
        ctx.op(),
        ctx.num_outputs()
    );
    Ok(vec![
        ctx.input(0)?.clone(),
        ctx.input(1)?.clone(),
        ctx.input(2)?.clone(),
    ])
}

fn check_index_add(op: &str, x: &Shape, index: &TensorDesc, add_value: &Shape, axis: i64) -> Result<usize> {
    let axis = x
        .normalize_axis(axis)
        .map_err(|e| Error::invalid(format!("'{op}': {e}")))?;
    ensure!(
        index.dtype.is_index(),
        "'{op}' index must be int32 or int64, got {}",
        index.dtype
    );
    ensure!(
        index.rank() == 1,
        "'{op}' index must be 1-D, got shape {}",
        index.shape
    );
    ensure!(
        add_value.rank() == x.rank(),
        "'{op}' add_value rank {} differs from x rank {}",
        add_value.rank(),
        x.rank()
    );
    for d in 0..x.rank() {
        let expected = if d == axis { index.dims()[0] } else { x.dims()[d] };
        if add_value.dims()[d] != expected {
            return Err(Error::ShapeMismatch {
                lhs: x.clone(),
                rhs: add_value.clone(),
                reason: format!("add_value dim {d} must be {expected}"),
            });
        }
    }
    Ok(axis)
}

/// `out` has the descriptor of `x`.
pub fn index_add(ctx: &InferContext<'_>) -> Result<Vec<TensorDesc>> {
    let x = ctx.input(0)?;
    let index = ctx.input(1)?;
    let add_value = ctx.input(2)?;
    check_index_add(ctx.op(), &x.shape, index, &add_value.shape, ctx.attrs().int("axis")?)?;
    Ok(vec![x.clone()])
}

/// `x_grad` like `out_grad`, `add_value_grad` like `add_value` in the
/// gradient dtype. Params: index, add_value, out_grad.
pub fn index_add_grad(ctx: &InferContext<'_>) -> Result<Vec<TensorDesc>> {
    let index = ctx.input(0)?;
    let add_value = ctx.input(1)?;
    let out_grad = ctx.input(2)?;
    check_index_add(
        ctx.op(),
        &out_grad.shape,
        index,
        &add_value.shape,
        ctx.attrs().int("axis")?,
    )?;
    Ok(vec![
        out_grad.clone(),
        add_value.clone().with_dtype(out_grad.dtype),
    ])
}

/// Checks q/k/v `[B, H, M, D]`, offset `[B, H, M+1]`, columns `[B, H, nnz]`
/// and returns `(q, nnz)`.
fn check_sparse_attention<'a>(ctx: &InferContext<'a>) -> Result<(&'a TensorDesc, usize)> {
    let q = ctx.input(0)?;
    let k = ctx.input(1)?;
    let v = ctx.input(2)?;
    let offset = ctx.input(3)?;
    let columns = ctx.input(4)?;
    ensure!(q.rank() == 4, "query must be [B, H, M, D], got {}", q.shape);
    for (name, t) in [("key", k), ("value", v)] {
        if t.shape != q.shape {
            return Err(Error::ShapeMismatch {
                lhs: q.shape.clone(),
                rhs: t.shape.clone(),
                reason: format!("{name} must match query"),
            });
        }
        ensure!(t.dtype == q.dtype, "{name} dtype {} differs from query {}", t.dtype, q.dtype);
    }
    let (b, h, m) = (q.dims()[0], q.dims()[1], q.dims()[2]);
    ensure!(
        offset.dtype == DType::I32 && offset.dims() == [b, h, m + 1],
        "offset must be int32 [{b}, {h}, {}], got {} {}",
        m + 1,
        offset.dtype,
        offset.shape
    );
    ensure!(
        columns.dtype == DType::I32 && columns.rank() == 3 && columns.dims()[..2] == [b, h],
        "columns must be int32 [{b}, {h}, nnz], got {} {}",
        columns.dtype,
        columns.shape
    );
    Ok((q, columns.dims()[2]))
}

/// Outputs `out [B,H,M,D]`, `sparse_dot_sdd [B,H,nnz]`, `softmax [B,H,nnz]`.
pub fn sparse_attention(ctx: &InferContext<'_>) -> Result<Vec<TensorDesc>> {
    let (q, nnz) = check_sparse_attention(ctx)?;
    let (b, h) = (q.dims()[0], q.dims()[1]);
    let pattern = q.clone().with_shape(vec![b, h, nnz]).with_layout(DataLayout::Plain);
    Ok(vec![q.clone(), pattern.clone(), pattern])
}

/// Outputs `query_grad`, `key_grad`, `value_grad`, shaped like q/k/v.
pub fn sparse_attention_grad(ctx: &InferContext<'_>) -> Result<Vec<TensorDesc>> {
    let (q, _) = check_sparse_attention(ctx)?;
    Ok(vec![q.clone(); 3])
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn desc(dims: &[usize]) -> TensorDesc {
        TensorDesc::new(dims, DType::F32)
    }

    #[test]
    fn test_elementwise_axis_alignment() {
        let x = desc(&[2, 3, 4, 5]);
        let y = desc(&[3, 4]);
        let attrs = AttrMap::new().with("axis", 1i64);
        let ctx = InferContext::new("add", &attrs, 1).tensor("x", Some(&x)).tensor("y", Some(&y));
        assert_eq!(elementwise(&ctx).unwrap()[0].dims(), &[2, 3, 4, 5]);

        // trailing alignment fails: 4 vs 3 at dim 2
        let attrs = AttrMap::new();
        let ctx = InferContext::new("add", &attrs, 1).tensor("x", Some(&x)).tensor("y", Some(&y));
        assert!(matches!(elementwise(&ctx), Err(Error::ShapeMismatch { .. })));
    }

    #[test]
    fn test_elementwise_symmetric_when_y_larger() {
        let x = desc(&[4]);
        let y = desc(&[3, 1]);
        let attrs = AttrMap::new();
        let ctx = InferContext::new("add", &attrs, 1).tensor("x", Some(&x)).tensor("y", Some(&y));
        assert_eq!(elementwise(&ctx).unwrap()[0].dims(), &[3, 4]);
    }

    #[test]
    fn test_transpose_normalizes_negative_perm() {
        let x = desc(&[2, 3, 4]).with_layout(DataLayout::Nchw);
        let attrs = AttrMap::new().with("perm", [0i64, -1, 1]);
        let ctx = InferContext::new("transpose", &attrs, 1).tensor("x", Some(&x));
        let out = transpose(&ctx).unwrap();
        assert_eq!(out[0].dims(), &[2, 4, 3]);
        assert_eq!(out[0].layout, DataLayout::Plain);

        let bad = AttrMap::new().with("perm", [0i64, 0, 1]);
        let ctx = InferContext::new("transpose", &bad, 1).tensor("x", Some(&x));
        assert!(matches!(transpose(&ctx), Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn test_transpose_grad_inverts() {
        let g = desc(&[4, 2, 3]);
        let attrs = AttrMap::new().with("perm", [2i64, 0, 1]);
        let ctx = InferContext::new("transpose_grad", &attrs, 1).tensor("out_grad", Some(&g));
        assert_eq!(transpose_grad(&ctx).unwrap()[0].dims(), &[2, 3, 4]);
    }

    fn conv_attrs(stride: i64, pad: i64) -> AttrMap {
        AttrMap::new()
            .with("strides", [stride, stride])
            .with("paddings", [pad, pad])
            .with("padding_algorithm", "EXPLICIT")
            .with("dilations", [1i64, 1])
            .with("groups", 1i64)
            .with("data_format", "NCHW")
    }

    #[test]
    fn test_conv_output_shape() {
        let input = desc(&[1, 3, 7, 7]);
        let filter = desc(&[8, 3, 3, 3]);
        let attrs = conv_attrs(2, 1);
        let ctx = InferContext::new("conv2d", &attrs, 1)
            .tensor("input", Some(&input))
            .tensor("filter", Some(&filter));
        let out = conv(&ctx).unwrap();
        assert_eq!(out[0].dims(), &[1, 8, 4, 4]);
        assert_eq!(out[0].layout, DataLayout::Nchw);
    }

    #[test]
    fn test_conv_rejects_empty_output() {
        let input = desc(&[1, 3, 2, 2]);
        let filter = desc(&[8, 3, 5, 5]);
        let attrs = conv_attrs(1, 0);
        let ctx = InferContext::new("conv2d", &attrs, 1)
            .tensor("input", Some(&input))
            .tensor("filter", Some(&filter));
        assert!(matches!(conv(&ctx), Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn test_index_add_grad_descriptors() {
        let index = TensorDesc::new(2, DType::I64);
        let add_value = desc(&[3, 2]);
        let out_grad = desc(&[3, 5]);
        let attrs = AttrMap::new().with("axis", -1i64);
        let ctx = InferContext::new("index_add_grad", &attrs, 2)
            .tensor("index", Some(&index))
            .tensor("add_value", Some(&add_value))
            .tensor("out_grad", Some(&out_grad));
        let outs = index_add_grad(&ctx).unwrap();
        assert_eq!(outs[0].dims(), &[3, 5]);
        assert_eq!(outs[1].dims(), &[3, 2]);
    }

    #[test]
    fn test_sparse_attention_descriptors() {
        let q = desc(&[2, 1, 4, 8]);
        let offset = TensorDesc::new((2, 1, 5), DType::I32);
        let columns = TensorDesc::new((2, 1, 7), DType::I32);
        let attrs = AttrMap::new();
        let ctx = InferContext::new("sparse_attention", &attrs, 3)
            .tensor("q", Some(&q))
            .tensor("k", Some(&q))
            .tensor("v", Some(&q))
            .tensor("offset", Some(&offset))
            .tensor("columns", Some(&columns));
        let outs = sparse_attention(&ctx).unwrap();
        assert_eq!(outs[0].dims(), &[2, 1, 4, 8]);
        assert_eq!(outs[1].dims(), &[2, 1, 7]);

        let bad_offset = TensorDesc::new((2, 1, 4), DType::I32);
        let ctx = InferContext::new("sparse_attention", &attrs, 3)
            .tensor("q", Some(&q))
            .tensor("k", Some(&q))
            .tensor("v", Some(&q))
            .tensor("offset", Some(&bad_offset))
            .tensor("columns", Some(&columns));
        assert!(sparse_attention(&ctx).is_err());
    }

    #[test]
    fn test_registry_lookup_and_duplicates() {
        let reg = InferMetaRegistry::builtin();
        assert!(reg.get("ConvInferMeta").is_ok());
        assert!(reg.get("NoSuchInferMeta").is_err());
        let mut reg = reg;
        assert!(reg.register("UnchangedInferMeta", unchanged).is_err());
    }

    proptest! {
        #[test]
        fn prop_broadcast_is_symmetric_and_absorbs_ones(
            dims in proptest::collection::vec(1usize..5, 0..4),
            mask in proptest::collection::vec(any::<bool>(), 0..4),
        ) {
            let x = Shape::new(dims.clone());
            let y = Shape::new(
                dims.iter()
                    .zip(mask.iter().chain(std::iter::repeat(&false)))
                    .map(|(&d, &one)| if one { 1 } else { d })
                    .collect(),
            );
            let xy = broadcast_with_axis(&x, &y, -1).unwrap();
            let yx = broadcast_with_axis(&y, &x, -1).unwrap();
            prop_assert_eq!(&xy, &yx);
            prop_assert_eq!(&xy, &x);
            prop_assert_eq!(Shape::broadcast_shape(&x, &y).unwrap(), xy);
        }
    }
}
