use proptest::prelude::*;
use wren::prelude::*;

fn rt() -> OpRuntime {
    OpRuntime::cpu().unwrap()
}

fn values(out: &OpOutputs, name: &str) -> Vec<f64> {
    out.get(name).unwrap().to_f64_vec().unwrap()
}

// conv

#[test]
fn test_conv2d_grad_nhwc_through_runtime() {
    let rt = rt();
    let nchw: Vec<f64> = (0..2 * 3 * 3).map(|i| i as f64 * 0.1).collect();
    // [1, 2, 3, 3] NCHW -> [1, 3, 3, 2] NHWC
    let mut nhwc = vec![0.0; nchw.len()];
    for c in 0..2 {
        for p in 0..9 {
            nhwc[p * 2 + c] = nchw[c * 9 + p];
        }
    }
    let x_nchw = Tensor::from_vec(nchw, (1, 2, 3, 3)).unwrap();
    let x_nhwc = Tensor::from_vec(nhwc, (1, 3, 3, 2)).unwrap().with_layout(DataLayout::Nhwc);
    // one output channel, 2x2 taps of ones: filter is [1, 2, 2, 2] in both
    // orders since every entry is equal
    let w = Tensor::from_vec(vec![1.0f64; 8], (1, 2, 2, 2)).unwrap();
    let dy = Tensor::from_vec(vec![1.0f64; 4], (1, 1, 2, 2)).unwrap();
    let dy_nhwc = Tensor::from_vec(vec![1.0f64; 4], (1, 2, 2, 1)).unwrap().with_layout(DataLayout::Nhwc);

    let first = rt
        .invoke(
            "conv2d_grad",
            OpCall::new().input("input", &x_nchw).input("filter", &w).input("out_grad", &dy),
        )
        .unwrap();
    let second = rt
        .invoke(
            "conv2d_grad",
            OpCall::new()
                .input("input", &x_nhwc)
                .input("filter", &w)
                .input("out_grad", &dy_nhwc)
                .attr("data_format", "NHWC"),
        )
        .unwrap();

    // centre pixel is covered by all four output positions
    let dx = values(&first, "input_grad");
    assert_eq!(dx[4], 4.0);
    assert_eq!(dx[0], 1.0);
    let dx_nhwc = values(&second, "input_grad");
    assert_eq!(dx_nhwc[4 * 2], 4.0);
    assert_eq!(dx_nhwc[4 * 2 + 1], 4.0);

    // filter_grad sums the channel's 2x2 windows; both layouts agree on the
    // channel-0 top-left tap (x[0,0] + x[0,1] + x[1,0] + x[1,1])
    let dw = values(&first, "filter_grad");
    let expected = 0.0 + 0.1 + 0.3 + 0.4;
    assert!((dw[0] - expected).abs() < 1e-12);
    let dw_nhwc = values(&second, "filter_grad");
    assert!((dw_nhwc[0] - expected).abs() < 1e-12);
}

#[test]
fn test_conv2d_grad_optional_outputs() {
    let rt = rt();
    let x = Tensor::from_vec(vec![1.0f32; 16], (1, 1, 4, 4)).unwrap();
    let w = Tensor::from_vec(vec![1.0f32; 9], (1, 1, 3, 3)).unwrap();
    let dy = Tensor::from_vec(vec![1.0f32; 4], (1, 1, 2, 2)).unwrap();
    let call = || OpCall::new().input("input", &x).input("filter", &w).input("out_grad", &dy);

    let out = rt.invoke("conv2d_grad", call().outputs(["filter_grad"])).unwrap();
    assert!(out.get("input_grad").is_none());
    assert_eq!(values(&out, "filter_grad"), vec![4.0; 9]);

    let mut out = rt.invoke("conv2d_grad", call().outputs(["input_grad"])).unwrap();
    assert!(out.get("filter_grad").is_none());
    assert_eq!(out.take("input_grad").unwrap().dims(), &[1, 1, 4, 4]);

    let err = rt.invoke("conv2d_grad", call().outputs(["bias_grad"])).unwrap_err();
    assert!(matches!(err, Error::InvalidArgument(_)));
}

#[test]
fn test_depthwise_and_conv3d_forward() {
    let rt = rt();
    let x = Tensor::from_vec(vec![1.0f64; 2 * 9], (1, 2, 3, 3)).unwrap();
    let w = Tensor::from_vec(vec![1.0f64, 1.0, 1.0, 1.0, 2.0, 2.0, 2.0, 2.0], (2, 1, 2, 2)).unwrap();
    let out = rt
        .invoke(
            "depthwise_conv2d",
            OpCall::new().input("input", &x).input("filter", &w).attr("groups", 2i64),
        )
        .unwrap();
    let y = out.first().unwrap();
    assert_eq!(y.dims(), &[1, 2, 2, 2]);
    assert_eq!(y.to_f64_vec().unwrap(), vec![4.0, 4.0, 4.0, 4.0, 8.0, 8.0, 8.0, 8.0]);

    let x = Tensor::from_vec(vec![1.0f32; 27], [1, 1, 3, 3, 3]).unwrap();
    let w = Tensor::from_vec(vec![1.0f32; 8], [1, 1, 2, 2, 2]).unwrap();
    let out = rt
        .invoke(
            "conv3d",
            OpCall::new()
                .input("input", &x)
                .input("filter", &w)
                .attr("paddings", vec![1i64, 1, 1])
                .attr("strides", vec![2i64, 2, 2]),
        )
        .unwrap();
    let y = out.first().unwrap();
    assert_eq!(y.dims(), &[1, 1, 2, 2, 2]);
    assert_eq!(y.layout(), DataLayout::Ncdhw);
    // each output sees exactly one in-bounds voxel per axis at the corners
    assert_eq!(y.data::<f32>().unwrap()[0], 1.0);
}

// index_add

#[test]
fn test_index_add_forward_and_grad() {
    let rt = rt();
    let x = Tensor::from_vec(vec![0.0f32; 6], (3, 2)).unwrap();
    let index = Tensor::from_vec(vec![0i64, 2, 0], 3).unwrap();
    let add_value = Tensor::from_vec(vec![1.0f32, 2.0, 3.0, 4.0, 5.0, 6.0], (3, 2)).unwrap();
    let out = rt
        .invoke(
            "index_add",
            OpCall::new().input("x", &x).input("index", &index).input("add_value", &add_value),
        )
        .unwrap();
    assert_eq!(values(&out, "out"), vec![6.0, 8.0, 0.0, 0.0, 3.0, 4.0]);

    let out_grad = Tensor::from_vec(vec![1.0f32, 2.0, 3.0, 4.0, 5.0, 6.0], (3, 2)).unwrap();
    let grads = rt
        .invoke(
            "index_add_grad",
            OpCall::new()
                .input("index", &index)
                .input("add_value", &add_value)
                .input("out_grad", &out_grad),
        )
        .unwrap();
    assert_eq!(values(&grads, "x_grad"), vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
    assert_eq!(values(&grads, "add_value_grad"), vec![1.0, 2.0, 5.0, 6.0, 1.0, 2.0]);
}

#[test]
fn test_index_add_inner_axis_with_int32_index() {
    let rt = rt();
    let x = Tensor::from_vec(vec![10i64, 20, 30, 40], (2, 2)).unwrap();
    let index = Tensor::from_vec(vec![1i32], 1).unwrap();
    let add_value = Tensor::from_vec(vec![1i64, 2], (2, 1)).unwrap();
    let out = rt
        .invoke(
            "index_add",
            OpCall::new()
                .input("x", &x)
                .input("index", &index)
                .input("add_value", &add_value)
                .attr("axis", -1i64),
        )
        .unwrap();
    assert_eq!(out.first().unwrap().data::<i64>().unwrap(), &[10, 21, 30, 42]);
}

#[test]
fn test_index_add_grad_empty_add_value() {
    let rt = rt();
    let index = Tensor::from_vec(Vec::<i64>::new(), 0usize).unwrap();
    let add_value = Tensor::zeros(TensorDesc::new((0, 2), DType::F32));
    let out_grad = Tensor::from_vec(vec![1.0f32; 6], (3, 2)).unwrap();
    let grads = rt
        .invoke(
            "index_add_grad",
            OpCall::new()
                .input("index", &index)
                .input("add_value", &add_value)
                .input("out_grad", &out_grad),
        )
        .unwrap();
    assert!(!grads.get("x_grad").unwrap().is_allocated());
    assert!(!grads.get("add_value_grad").unwrap().is_allocated());
}

#[test]
fn test_index_add_shape_errors() {
    let rt = rt();
    let x = Tensor::from_vec(vec![0.0f32; 6], (3, 2)).unwrap();
    let index = Tensor::from_vec(vec![0i64, 1], 2).unwrap();
    let add_value = Tensor::from_vec(vec![0.0f32; 6], (3, 2)).unwrap();
    let err = rt
        .invoke(
            "index_add",
            OpCall::new().input("x", &x).input("index", &index).input("add_value", &add_value),
        )
        .unwrap_err();
    assert!(matches!(err, Error::ShapeMismatch { .. }), "{err}");

    let index = Tensor::from_vec(vec![0.0f32, 1.0, 2.0], 3).unwrap();
    let err = rt
        .invoke(
            "index_add",
            OpCall::new().input("x", &x).input("index", &index).input("add_value", &add_value),
        )
        .unwrap_err();
    assert!(matches!(err, Error::InvalidArgument(_)), "{err}");
}

// sparse attention

#[test]
fn test_sparse_attention_through_runtime() {
    let rt = rt();
    let q = Tensor::from_vec(vec![1.0f32, 0.0, 0.0, 1.0], (1, 1, 2, 2)).unwrap();
    let v = Tensor::from_vec(vec![1.0f32, 2.0, 3.0, 4.0], (1, 1, 2, 2)).unwrap();
    let offset = Tensor::from_vec(vec![0i32, 1, 3], (1, 1, 3)).unwrap();
    let columns = Tensor::from_vec(vec![0i32, 0, 1], (1, 1, 3)).unwrap();
    let out = rt
        .invoke(
            "sparse_attention",
            OpCall::new()
                .input("q", &q)
                .input("k", &q)
                .input("v", &v)
                .input("offset", &offset)
                .input("columns", &columns),
        )
        .unwrap();
    assert_eq!(out.names(), &["out", "sparse_dot_sdd", "softmax"]);
    assert_eq!(out.get("softmax").unwrap().dims(), &[1, 1, 3]);

    // row 0 attends only to key 0
    let y = values(&out, "out");
    assert_eq!(&y[..2], &[1.0, 2.0]);
    let p = values(&out, "softmax");
    assert_eq!(p[0], 1.0);
    assert!((p[1] + p[2] - 1.0).abs() < 1e-6);
    // row 1 scores: q1.k0 = 0, q1.k1 = 1, scaled by 1/sqrt(2)
    let s = values(&out, "sparse_dot_sdd");
    assert!(s[1].abs() < 1e-7);
    assert!((s[2] - 1.0 / 2f64.sqrt()).abs() < 1e-6);

    let sdd = out.get("sparse_dot_sdd").unwrap();
    let softmax = out.get("softmax").unwrap();
    let dout = Tensor::from_vec(vec![1.0f32; 4], (1, 1, 2, 2)).unwrap();
    let grads = rt
        .invoke(
            "sparse_attention_grad",
            OpCall::new()
                .input("q", &q)
                .input("k", &q)
                .input("v", &v)
                .input("offset", &offset)
                .input("columns", &columns)
                .input("sparse_dot_sdd", sdd)
                .input("softmax", softmax)
                .input("out_grad", &dout)
                .outputs(["v_grad"]),
        )
        .unwrap();
    assert!(grads.get("q_grad").is_none());
    // column sums of the probability matrix, repeated over d
    let dv = values(&grads, "v_grad");
    assert!((dv[0] - (1.0 + p[1])).abs() < 1e-6);
    assert!((dv[2] - p[2]).abs() < 1e-6);
}

#[test]
fn test_sparse_attention_mask_shape_checked() {
    let rt = rt();
    let q = Tensor::zeros(TensorDesc::new((1, 1, 2, 2), DType::F32));
    let offset = Tensor::from_vec(vec![0i32, 1, 2], (1, 1, 3)).unwrap();
    let columns = Tensor::from_vec(vec![0i32, 1], (1, 1, 2)).unwrap();
    let mask = Tensor::from_vec(vec![1.0f32; 3], 3).unwrap();
    let err = rt
        .invoke(
            "sparse_attention",
            OpCall::new()
                .input("q", &q)
                .input("k", &q)
                .input("v", &q)
                .input("offset", &offset)
                .input("columns", &columns)
                .input("attn_mask", &mask),
        )
        .unwrap_err();
    assert!(matches!(err, Error::InvalidArgument(_)), "{err}");
}

// utility operators

#[test]
fn test_add_broadcast() {
    let rt = rt();
    let x = Tensor::from_vec(vec![0.0f64; 6], (2, 3)).unwrap();
    let y = Tensor::from_vec(vec![1.0f64, 2.0], 2).unwrap();
    let out = rt
        .invoke("add", OpCall::new().input("x", &x).input("y", &y).attr("axis", 0i64))
        .unwrap();
    assert_eq!(values(&out, "out"), vec![1.0, 1.0, 1.0, 2.0, 2.0, 2.0]);

    let err = rt.invoke("add", OpCall::new().input("x", &x).input("y", &y)).unwrap_err();
    assert!(matches!(err, Error::ShapeMismatch { .. }), "{err}");
}

#[test]
fn test_cast_and_assign() {
    let rt = rt();
    let x = Tensor::from_vec(vec![1.0f32, -2.0, 300.0], 3).unwrap();
    let out = rt
        .invoke("cast", OpCall::new().input("x", &x).attr("out_dtype", DType::I32))
        .unwrap();
    let y = out.first().unwrap();
    assert_eq!(y.dtype(), DType::I32);
    assert_eq!(y.data::<i32>().unwrap(), &[1, -2, 300]);

    let out = rt.invoke("assign", OpCall::new().input("x", y)).unwrap();
    assert_eq!(out.first().unwrap(), y);
}

#[test]
fn test_integer_add_and_index_add_wrap() {
    let rt = rt();
    let x = Tensor::from_vec(vec![i32::MAX], 1).unwrap();
    let y = Tensor::from_vec(vec![1i32], 1).unwrap();
    let out = rt.invoke("add", OpCall::new().input("x", &x).input("y", &y)).unwrap();
    assert_eq!(out.first().unwrap().data::<i32>().unwrap(), &[i32::MIN]);

    let x = Tensor::from_vec(vec![i32::MAX, 0], 2).unwrap();
    let index = Tensor::from_vec(vec![0i64], 1).unwrap();
    let add_value = Tensor::from_vec(vec![1i32], 1).unwrap();
    let out = rt
        .invoke(
            "index_add",
            OpCall::new().input("x", &x).input("index", &index).input("add_value", &add_value),
        )
        .unwrap();
    assert_eq!(out.first().unwrap().data::<i32>().unwrap(), &[i32::MIN, 0]);
}

#[test]
fn test_cast_int64_above_f64_mantissa() {
    let rt = rt();
    let big = (1i64 << 53) + 1;
    let x = Tensor::from_vec(vec![big], 1).unwrap();
    let out = rt
        .invoke("cast", OpCall::new().input("x", &x).attr("out_dtype", DType::I64))
        .unwrap();
    assert_eq!(out.first().unwrap().data::<i64>().unwrap(), &[big]);
}

#[test]
fn test_transpose_clears_channel_layout() {
    let rt = rt();
    let x = Tensor::from_vec(vec![0.0f32; 24], (1, 2, 3, 4)).unwrap().with_layout(DataLayout::Nchw);
    let out = rt
        .invoke("transpose", OpCall::new().input("x", &x).attr("perm", vec![0i64, 2, 3, 1]))
        .unwrap();
    let y = out.first().unwrap();
    assert_eq!(y.dims(), &[1, 3, 4, 2]);
    assert_eq!(y.layout(), DataLayout::Plain);
}

fn dims_and_perm() -> impl Strategy<Value = (Vec<usize>, Vec<usize>)> {
    prop::collection::vec(1usize..4, 1..5).prop_flat_map(|dims| {
        let rank = dims.len();
        (Just(dims), Just((0..rank).collect::<Vec<_>>()).prop_shuffle())
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_transpose_grad_inverts_transpose((dims, perm) in dims_and_perm()) {
        let rt = rt();
        let n: usize = dims.iter().product();
        let data: Vec<f32> = (0..n).map(|i| i as f32 * 0.37 - 1.5).collect();
        let x = Tensor::from_vec(data.clone(), dims.as_slice()).unwrap();
        let perm: Vec<i64> = perm.iter().map(|&p| p as i64).collect();

        let y = rt
            .invoke("transpose", OpCall::new().input("x", &x).attr("perm", perm.clone()))
            .unwrap()
            .into_vec()
            .remove(0)
            .unwrap();
        let back = rt
            .invoke("transpose_grad", OpCall::new().input("out_grad", &y).attr("perm", perm))
            .unwrap()
            .into_vec()
            .remove(0)
            .unwrap();
        prop_assert_eq!(back.dims(), x.dims());
        prop_assert_eq!(back.data::<f32>().unwrap(), data.as_slice());
    }
}
