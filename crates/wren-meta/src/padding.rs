use std::str::FromStr;

use wren_core::{bail, ensure, DataLayout, Error, Result};

use crate::attr::AttrMap;

// Convolution geometry
//
// Every convolution entry point (inference, forward kernel, gradient
// kernels) resolves its attributes through `ConvGeometry::new`, so the
// padding rule and the output-size formula exist once:
//
//   out = (in + pad_before + pad_after - (dilation * (k - 1) + 1)) / stride + 1
//
// Padding resolution:
//   EXPLICIT  paddings as given, one value per spatial dim (symmetric) or
//             one (before, after) pair per spatial dim
//   VALID     no padding
//   SAME      out = ceil(in / stride); the total padding needed to reach it
//             is split with the smaller half before; dilations become 1

/// How the `paddings` attribute is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PaddingAlgorithm {
    #[default]
    Explicit,
    Same,
    Valid,
}

impl FromStr for PaddingAlgorithm {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "" | "EXPLICIT" => Ok(PaddingAlgorithm::Explicit),
            "SAME" => Ok(PaddingAlgorithm::Same),
            "VALID" => Ok(PaddingAlgorithm::Valid),
            other => Err(Error::invalid(format!("unknown padding_algorithm '{other}'"))),
        }
    }
}

/// Resolve paddings and dilations for `input` spatial dims and kernel
/// sizes `ksize`. Returns `(pads, dilations)` with one `(before, after)`
/// pair per spatial dim.
pub fn update_padding_and_dilation(
    paddings: &[i64],
    dilations: &[usize],
    algo: PaddingAlgorithm,
    input: &[usize],
    strides: &[usize],
    ksize: &[usize],
) -> Result<(Vec<(usize, usize)>, Vec<usize>)> {
    let n = input.len();
    ensure!(
        ksize.len() == n && strides.len() == n && dilations.len() == n,
        "expected {n} spatial entries, got ksize {}, strides {}, dilations {}",
        ksize.len(),
        strides.len(),
        dilations.len()
    );
    if let Some(p) = paddings.iter().find(|&&p| p < 0) {
        bail!("paddings must be non-negative, got {p}");
    }
    let pairs: Vec<(usize, usize)> = if paddings.len() == n {
        paddings.iter().map(|&p| (p as usize, p as usize)).collect()
    } else if paddings.len() == 2 * n {
        paddings
            .chunks(2)
            .map(|c| (c[0] as usize, c[1] as usize))
            .collect()
    } else {
        bail!(
            "paddings must have {n} or {} entries, got {}",
            2 * n,
            paddings.len()
        );
    };

    match algo {
        PaddingAlgorithm::Explicit => Ok((pairs, dilations.to_vec())),
        PaddingAlgorithm::Valid => Ok((vec![(0, 0); n], dilations.to_vec())),
        PaddingAlgorithm::Same => {
            let mut pads = Vec::with_capacity(n);
            for i in 0..n {
                ensure!(strides[i] > 0, "strides must be positive");
                let out = input[i].div_ceil(strides[i]);
                let needed = (out.saturating_sub(1) * strides[i] + ksize[i]) as i64 - input[i] as i64;
                let sum = needed.max(0) as usize;
                let before = sum / 2;
                pads.push((before, sum - before));
            }
            Ok((pads, vec![1; n]))
        }
    }
}

/// Output size of one spatial dim. Fails when the result would be empty.
pub fn conv_output_size(
    input: usize,
    ksize: usize,
    dilation: usize,
    pads: (usize, usize),
    stride: usize,
) -> Result<usize> {
    ensure!(stride > 0, "strides must be positive");
    ensure!(dilation > 0, "dilations must be positive");
    ensure!(ksize > 0, "kernel size must be positive");
    let padded = input + pads.0 + pads.1;
    let span = dilation * (ksize - 1) + 1;
    ensure!(
        padded >= span,
        "output size is not positive: input {input} padded by {pads:?} is smaller than the dilated kernel {span}"
    );
    Ok((padded - span) / stride + 1)
}

/// Convolution attributes as declared on every conv operator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConvAttrs {
    pub strides: Vec<usize>,
    pub paddings: Vec<i64>,
    pub padding_algorithm: PaddingAlgorithm,
    pub dilations: Vec<usize>,
    pub groups: usize,
    pub data_format: String,
}

impl ConvAttrs {
    pub fn from_attrs(attrs: &AttrMap) -> Result<Self> {
        let padding_algorithm = match attrs.get("padding_algorithm") {
            Some(_) => attrs.str("padding_algorithm")?.parse()?,
            None => PaddingAlgorithm::Explicit,
        };
        let groups = attrs.int("groups")?;
        ensure!(groups >= 1, "groups must be >= 1, got {groups}");
        let data_format = match attrs.get("data_format") {
            Some(_) => attrs.str("data_format")?.to_string(),
            None => "NCHW".to_string(),
        };
        Ok(ConvAttrs {
            strides: attrs.usizes("strides")?,
            paddings: attrs.ints("paddings")?.to_vec(),
            padding_algorithm,
            dilations: attrs.usizes("dilations")?,
            groups: groups as usize,
            data_format,
        })
    }

    /// Channel order named by `data_format`. `AnyLayout` is channel-first.
    pub fn layout(&self) -> Result<DataLayout> {
        match self.data_format.as_str() {
            "AnyLayout" | "ANY" => Ok(DataLayout::Nchw),
            s => s.parse(),
        }
    }
}

/// Fully resolved shape arithmetic of one convolution, channel-first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConvGeometry {
    pub batch: usize,
    pub in_channels: usize,
    pub out_channels: usize,
    pub groups: usize,
    /// Spatial dims of the input (D, H, W or H, W).
    pub in_spatial: Vec<usize>,
    pub kernel: Vec<usize>,
    pub out_spatial: Vec<usize>,
    pub strides: Vec<usize>,
    pub dilations: Vec<usize>,
    pub pads: Vec<(usize, usize)>,
    pub channel_last: bool,
}

impl ConvGeometry {
    /// `input` and `filter` are the dims as stored. A channel-last filter is
    /// `[F, k.., C/g]`, a channel-first one `[F, C/g, k..]`.
    pub fn new(input: &[usize], filter: &[usize], attrs: &ConvAttrs) -> Result<Self> {
        let rank = input.len();
        ensure!(
            rank == 4 || rank == 5,
            "convolution input must be 4-D or 5-D, got rank {rank}"
        );
        ensure!(
            filter.len() == rank,
            "filter rank {} does not match input rank {rank}",
            filter.len()
        );
        let spatial = rank - 2;
        let channel_last = attrs.layout()?.is_channel_last();

        let (batch, in_channels, in_spatial) = if channel_last {
            (input[0], input[rank - 1], input[1..rank - 1].to_vec())
        } else {
            (input[0], input[1], input[2..].to_vec())
        };
        let (out_channels, filter_channels, kernel) = if channel_last {
            (filter[0], filter[rank - 1], filter[1..rank - 1].to_vec())
        } else {
            (filter[0], filter[1], filter[2..].to_vec())
        };

        let groups = attrs.groups;
        ensure!(
            in_channels == filter_channels * groups,
            "input channels {in_channels} must equal filter channels {filter_channels} * groups {groups}"
        );
        ensure!(
            out_channels % groups == 0,
            "filter count {out_channels} is not divisible by groups {groups}"
        );
        ensure!(
            attrs.strides.len() == spatial,
            "strides must have {spatial} entries, got {}",
            attrs.strides.len()
        );

        let (pads, dilations) = update_padding_and_dilation(
            &attrs.paddings,
            &attrs.dilations,
            attrs.padding_algorithm,
            &in_spatial,
            &attrs.strides,
            &kernel,
        )?;
        let out_spatial = (0..spatial)
            .map(|i| conv_output_size(in_spatial[i], kernel[i], dilations[i], pads[i], attrs.strides[i]))
            .collect::<Result<Vec<_>>>()?;

        Ok(ConvGeometry {
            batch,
            in_channels,
            out_channels,
            groups,
            in_spatial,
            kernel,
            out_spatial,
            strides: attrs.strides.clone(),
            dilations,
            pads,
            channel_last,
        })
    }

    pub fn spatial_rank(&self) -> usize {
        self.in_spatial.len()
    }

    /// Output dims in the storage order of the input.
    pub fn output_dims(&self) -> Vec<usize> {
        let mut dims = vec![self.batch];
        if self.channel_last {
            dims.extend(&self.out_spatial);
            dims.push(self.out_channels);
        } else {
            dims.push(self.out_channels);
            dims.extend(&self.out_spatial);
        }
        dims
    }
}
