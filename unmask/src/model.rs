use std::collections::{HashMap, HashSet};

use ndarray::{s, Array, Array1, Array2, Array3, ArrayD, ArrayViewD, Axis, Dimension, Ix1, Ix2, Ix3};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// A positional scoring model.
///
/// Given the full id sequence and the visibility mask, returns a score for
/// every class at every position, shaped `[ids.len(), C]`. Scores need not be
/// normalized. Implementations may read the content of hidden positions.
pub trait Scorer {
    fn score(&self, ids: &[usize], visible: &[bool]) -> Array2<f32>;
}

impl<T: Scorer + ?Sized> Scorer for &T {
    fn score(&self, ids: &[usize], visible: &[bool]) -> Array2<f32> {
        (**self).score(ids, visible)
    }
}

/// Non-linearity used inside the ByteNet blocks.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Activation {
    #[default]
    Relu,
    Gelu,
}

impl Activation {
    fn apply(self, x: &Array2<f32>) -> Array2<f32> {
        match self {
            Activation::Relu => x.mapv(|v| v.max(0.0)),
            Activation::Gelu => x.mapv(|v| {
                // tanh approximation
                let c = (2.0 / std::f32::consts::PI).sqrt();
                0.5 * v * (1.0 + (c * (v + 0.044715 * v * v * v)).tanh())
            }),
        }
    }
}

/// Hyper-parameters of the dilated convolutional scorer.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ByteNetArgs {
    /// Number of classes, specials included.
    pub n_tokens: usize,
    /// Embedding dimension.
    pub d_embed: usize,
    /// Hidden dimension of the residual stream.
    pub d_model: usize,
    /// Number of residual blocks.
    pub n_layers: usize,
    /// Convolution width; must be odd.
    pub kernel_size: usize,
    /// Largest dilation rate.
    pub r: usize,
    /// Class whose embedding row is kept at zero.
    pub padding_idx: Option<usize>,
    /// Halve the block bottleneck width.
    pub slim: bool,
    pub activation: Activation,
    /// Apply a LayerNorm before the decoder.
    pub final_norm: bool,
    /// Share the embedding matrix with the decoder.
    pub tie_weights: bool,
}

impl Default for ByteNetArgs {
    fn default() -> Self {
        Self {
            n_tokens: 29,
            d_embed: 8,
            d_model: 64,
            n_layers: 4,
            kernel_size: 5,
            r: 8,
            padding_idx: Some(28),
            slim: true,
            activation: Activation::Relu,
            final_norm: false,
            tie_weights: false,
        }
    }
}

impl ByteNetArgs {
    pub fn validate(&self) -> Result<()> {
        let dims = [
            ("n_tokens", self.n_tokens),
            ("d_embed", self.d_embed),
            ("d_model", self.d_model),
            ("n_layers", self.n_layers),
            ("kernel_size", self.kernel_size),
            ("r", self.r),
        ];
        if let Some((name, _)) = dims.iter().find(|(_, v)| *v == 0) {
            return Err(Error::InvalidConfig(format!("{name} must be positive")));
        }
        if self.kernel_size % 2 == 0 {
            return Err(Error::InvalidConfig(format!(
                "kernel_size must be odd, got {}",
                self.kernel_size
            )));
        }
        if self.slim && self.d_model < 2 {
            return Err(Error::InvalidConfig("slim blocks need d_model >= 2".into()));
        }
        if self.tie_weights && self.d_embed != self.d_model {
            return Err(Error::InvalidConfig(format!(
                "tie_weights needs d_embed == d_model, got {} and {}",
                self.d_embed, self.d_model
            )));
        }
        if let Some(idx) = self.padding_idx {
            if idx >= self.n_tokens {
                return Err(Error::InvalidConfig(format!(
                    "padding_idx {idx} out of range for {} tokens",
                    self.n_tokens
                )));
            }
        }
        Ok(())
    }

    /// Dilation of each block, cycling through powers of two up to `r`.
    pub fn dilations(&self) -> Vec<usize> {
        let cycle = self.r.max(1).ilog2() as usize + 1;
        (0..self.n_layers).map(|n| 1 << (n % cycle)).collect()
    }

    fn hidden_dim(&self) -> usize {
        if self.slim {
            self.d_model / 2
        } else {
            self.d_model
        }
    }
}

type Tensors<'a> = HashMap<&'a str, &'a ArrayD<f32>>;

fn assign<D: Dimension>(target: &mut Array<f32, D>, name: &str, tensors: &Tensors<'_>) -> Result<()> {
    let source = tensors
        .get(name)
        .ok_or_else(|| Error::MissingParameter(name.to_string()))?;
    let shape_error = || Error::ParameterShape {
        name: name.to_string(),
        expected: target.shape().to_vec(),
        found: source.shape().to_vec(),
    };
    if source.shape() != target.shape() {
        return Err(shape_error());
    }
    let source = source
        .view()
        .into_dimensionality::<D>()
        .map_err(|_| shape_error())?;
    target.assign(&source);
    Ok(())
}

fn init_uniform<D: Dimension, R: Rng + ?Sized>(shape: D, rng: &mut R) -> Array<f32, D> {
    Array::from_shape_simple_fn(shape, || rng.gen_range(-0.1..0.1))
}

/// Embedding layer mapping token ids to vectors.
pub struct Embedding {
    weight: Array2<f32>, // vocab_size x dim
}

impl Embedding {
    pub fn new<R: Rng + ?Sized>(vocab_size: usize, dim: usize, padding_idx: Option<usize>, rng: &mut R) -> Self {
        let mut weight = init_uniform(Ix2(vocab_size, dim), rng);
        if let Some(idx) = padding_idx {
            weight.row_mut(idx).fill(0.0);
        }
        Self { weight }
    }

    pub fn weight(&self) -> &Array2<f32> {
        &self.weight
    }

    pub fn forward(&self, tokens: &[usize]) -> Array2<f32> {
        let mut out = Array2::<f32>::zeros((tokens.len(), self.weight.ncols()));
        for (i, &tok) in tokens.iter().enumerate() {
            out.row_mut(i).assign(&self.weight.row(tok));
        }
        out
    }
}

/// Fully connected layer applied independently at every position.
pub struct Linear {
    weight: Array2<f32>, // out x in
    bias: Option<Array1<f32>>,
}

impl Linear {
    pub fn new<R: Rng + ?Sized>(in_features: usize, out_features: usize, bias: bool, rng: &mut R) -> Self {
        let weight = init_uniform(Ix2(out_features, in_features), rng);
        let bias = bias.then(|| init_uniform(Ix1(out_features), rng));
        Self { weight, bias }
    }

    pub fn weight(&self) -> &Array2<f32> {
        &self.weight
    }

    pub fn bias(&self) -> Option<&Array1<f32>> {
        self.bias.as_ref()
    }

    pub fn forward(&self, x: &Array2<f32>) -> Array2<f32> {
        let mut y = x.dot(&self.weight.t());
        if let Some(b) = &self.bias {
            y += &b.view().insert_axis(Axis(0));
        }
        y
    }

    fn visit(&self, prefix: &str, f: &mut dyn FnMut(String, ArrayViewD<'_, f32>)) {
        f(format!("{prefix}.weight"), self.weight.view().into_dyn());
        if let Some(b) = &self.bias {
            f(format!("{prefix}.bias"), b.view().into_dyn());
        }
    }

    fn load(&mut self, prefix: &str, tensors: &Tensors<'_>) -> Result<()> {
        assign(&mut self.weight, &format!("{prefix}.weight"), tensors)?;
        if let Some(b) = &mut self.bias {
            assign(b, &format!("{prefix}.bias"), tensors)?;
        }
        Ok(())
    }
}

/// Layer normalization over the channel axis.
pub struct LayerNorm {
    weight: Array1<f32>,
    bias: Array1<f32>,
    eps: f32,
}

impl LayerNorm {
    pub fn new(dim: usize) -> Self {
        Self {
            weight: Array1::ones(dim),
            bias: Array1::zeros(dim),
            eps: 1e-5,
        }
    }

    pub fn forward(&self, x: &Array2<f32>) -> Array2<f32> {
        let mut out = x.clone();
        for mut row in out.axis_iter_mut(Axis(0)) {
            let n = row.len() as f32;
            let mean = row.sum() / n;
            let var = row.iter().map(|v| (v - mean) * (v - mean)).sum::<f32>() / n;
            let denom = (var + self.eps).sqrt();
            row.mapv_inplace(|v| (v - mean) / denom);
        }
        out *= &self.weight.view().insert_axis(Axis(0));
        out += &self.bias.view().insert_axis(Axis(0));
        out
    }

    fn visit(&self, prefix: &str, f: &mut dyn FnMut(String, ArrayViewD<'_, f32>)) {
        f(format!("{prefix}.weight"), self.weight.view().into_dyn());
        f(format!("{prefix}.bias"), self.bias.view().into_dyn());
    }

    fn load(&mut self, prefix: &str, tensors: &Tensors<'_>) -> Result<()> {
        assign(&mut self.weight, &format!("{prefix}.weight"), tensors)?;
        assign(&mut self.bias, &format!("{prefix}.bias"), tensors)
    }
}

/// Dilated 1-D convolution with "same" padding that ignores hidden positions.
pub struct MaskedConv1d {
    weight: Array3<f32>, // out x in x kernel
    bias: Array1<f32>,
    dilation: usize,
}

impl MaskedConv1d {
    pub fn new<R: Rng + ?Sized>(channels: usize, kernel_size: usize, dilation: usize, rng: &mut R) -> Self {
        Self {
            weight: init_uniform(Ix3(channels, channels, kernel_size), rng),
            bias: init_uniform(Ix1(channels), rng),
            dilation,
        }
    }

    pub fn forward(&self, x: &Array2<f32>, visible: &[bool]) -> Array2<f32> {
        let len = x.nrows() as isize;
        let (out_channels, _, kernel) = self.weight.dim();
        let pad = (self.dilation * (kernel - 1) / 2) as isize;

        let mut input = x.clone();
        for (mut row, &shown) in input.axis_iter_mut(Axis(0)).zip(visible) {
            if !shown {
                row.fill(0.0);
            }
        }

        let mut out = Array2::<f32>::zeros((x.nrows(), out_channels));
        out += &self.bias.view().insert_axis(Axis(0));
        for j in 0..kernel {
            // output t reads input t + shift
            let shift = (j * self.dilation) as isize - pad;
            if shift.abs() >= len {
                continue;
            }
            let proj = input.dot(&self.weight.slice(s![.., .., j]).t());
            let (dst, src) = if shift >= 0 {
                (s![0..len - shift, ..], s![shift..len, ..])
            } else {
                (s![-shift..len, ..], s![0..len + shift, ..])
            };
            let mut target = out.slice_mut(dst);
            target += &proj.slice(src);
        }
        out
    }

    fn visit(&self, prefix: &str, f: &mut dyn FnMut(String, ArrayViewD<'_, f32>)) {
        f(format!("{prefix}.weight"), self.weight.view().into_dyn());
        f(format!("{prefix}.bias"), self.bias.view().into_dyn());
    }

    fn load(&mut self, prefix: &str, tensors: &Tensors<'_>) -> Result<()> {
        assign(&mut self.weight, &format!("{prefix}.weight"), tensors)?;
        assign(&mut self.bias, &format!("{prefix}.bias"), tensors)
    }
}

/// Residual block: bottleneck projection around a dilated convolution.
pub struct ByteNetBlock {
    norm1: LayerNorm,
    proj_in: Linear,
    norm2: LayerNorm,
    conv: MaskedConv1d,
    norm3: LayerNorm,
    proj_out: Linear,
    activation: Activation,
}

impl ByteNetBlock {
    pub fn new<R: Rng + ?Sized>(args: &ByteNetArgs, dilation: usize, rng: &mut R) -> Self {
        let d_h = args.hidden_dim();
        Self {
            norm1: LayerNorm::new(args.d_model),
            proj_in: Linear::new(args.d_model, d_h, true, rng),
            norm2: LayerNorm::new(d_h),
            conv: MaskedConv1d::new(d_h, args.kernel_size, dilation, rng),
            norm3: LayerNorm::new(d_h),
            proj_out: Linear::new(d_h, args.d_model, true, rng),
            activation: args.activation,
        }
    }

    pub fn forward(&self, x: &Array2<f32>, visible: &[bool]) -> Array2<f32> {
        let h = self.activation.apply(&self.norm1.forward(x));
        let h = self.proj_in.forward(&h);
        let h = self.activation.apply(&self.norm2.forward(&h));
        let h = self.conv.forward(&h, visible);
        let h = self.activation.apply(&self.norm3.forward(&h));
        let h = self.proj_out.forward(&h);
        x + &h
    }

    fn visit(&self, prefix: &str, f: &mut dyn FnMut(String, ArrayViewD<'_, f32>)) {
        self.norm1.visit(&format!("{prefix}.norm1"), f);
        self.proj_in.visit(&format!("{prefix}.proj_in"), f);
        self.norm2.visit(&format!("{prefix}.norm2"), f);
        self.conv.visit(&format!("{prefix}.conv"), f);
        self.norm3.visit(&format!("{prefix}.norm3"), f);
        self.proj_out.visit(&format!("{prefix}.proj_out"), f);
    }

    fn load(&mut self, prefix: &str, tensors: &Tensors<'_>) -> Result<()> {
        self.norm1.load(&format!("{prefix}.norm1"), tensors)?;
        self.proj_in.load(&format!("{prefix}.proj_in"), tensors)?;
        self.norm2.load(&format!("{prefix}.norm2"), tensors)?;
        self.conv.load(&format!("{prefix}.conv"), tensors)?;
        self.norm3.load(&format!("{prefix}.norm3"), tensors)?;
        self.proj_out.load(&format!("{prefix}.proj_out"), tensors)
    }
}

/// Non-causal ByteNet masked language model.
pub struct ByteNetLM {
    pub args: ByteNetArgs,
    embedder: Embedding,
    up_embedder: Linear,
    layers: Vec<ByteNetBlock>,
    final_norm: Option<LayerNorm>,
    decoder: Linear,
}

impl ByteNetLM {
    pub fn new<R: Rng + ?Sized>(args: ByteNetArgs, rng: &mut R) -> Result<Self> {
        args.validate()?;
        let embedder = Embedding::new(args.n_tokens, args.d_embed, args.padding_idx, rng);
        let up_embedder = Linear::new(args.d_embed, args.d_model, true, rng);
        let layers = args
            .dilations()
            .into_iter()
            .map(|d| ByteNetBlock::new(&args, d, rng))
            .collect();
        let final_norm = args.final_norm.then(|| LayerNorm::new(args.d_model));
        let mut decoder = Linear::new(args.d_model, args.n_tokens, true, rng);
        if args.tie_weights {
            decoder.weight.assign(&embedder.weight);
        }
        Ok(Self {
            args,
            embedder,
            up_embedder,
            layers,
            final_norm,
            decoder,
        })
    }

    pub fn embed(&self) -> &Embedding {
        &self.embedder
    }

    pub fn head(&self) -> &Linear {
        &self.decoder
    }

    pub fn forward(&self, tokens: &[usize], visible: &[bool]) -> Array2<f32> {
        let mut e = self.embedder.forward(tokens);
        for (mut row, &shown) in e.axis_iter_mut(Axis(0)).zip(visible) {
            if !shown {
                row.fill(0.0);
            }
        }
        let mut h = self.up_embedder.forward(&e);
        for layer in &self.layers {
            h = layer.forward(&h, visible);
        }
        if let Some(norm) = &self.final_norm {
            h = norm.forward(&h);
        }
        self.decoder.forward(&h)
    }

    /// Call `f` with every named parameter. A tied decoder weight is omitted.
    pub fn visit_parameters(&self, f: &mut dyn FnMut(String, ArrayViewD<'_, f32>)) {
        f("embedder.weight".to_string(), self.embedder.weight.view().into_dyn());
        self.up_embedder.visit("up_embedder", f);
        for (n, layer) in self.layers.iter().enumerate() {
            layer.visit(&format!("layers.{n}"), f);
        }
        if let Some(norm) = &self.final_norm {
            norm.visit("final_norm", f);
        }
        if !self.args.tie_weights {
            f("decoder.weight".to_string(), self.decoder.weight.view().into_dyn());
        }
        if let Some(b) = &self.decoder.bias {
            f("decoder.bias".to_string(), b.view().into_dyn());
        }
    }

    /// Overwrite every parameter from `tensors`.
    ///
    /// Names may carry a leading `module.` prefix. A tensor the model has no
    /// parameter for is an error, checked before anything is overwritten.
    pub fn load_parameters(&mut self, tensors: &HashMap<String, ArrayD<f32>>) -> Result<()> {
        let tensors: Tensors<'_> = tensors
            .iter()
            .map(|(name, t)| (name.strip_prefix("module.").unwrap_or(name.as_str()), t))
            .collect();

        let mut expected = HashSet::new();
        self.visit_parameters(&mut |name, _| {
            expected.insert(name);
        });
        let mut names: Vec<&str> = tensors.keys().copied().collect();
        names.sort_unstable();
        if let Some(extra) = names.into_iter().find(|name| !expected.contains(*name)) {
            return Err(Error::UnexpectedParameter(extra.to_string()));
        }

        assign(&mut self.embedder.weight, "embedder.weight", &tensors)?;
        self.up_embedder.load("up_embedder", &tensors)?;
        for (n, layer) in self.layers.iter_mut().enumerate() {
            layer.load(&format!("layers.{n}"), &tensors)?;
        }
        if let Some(norm) = &mut self.final_norm {
            norm.load("final_norm", &tensors)?;
        }
        if self.args.tie_weights {
            self.decoder.weight.assign(&self.embedder.weight);
        } else {
            assign(&mut self.decoder.weight, "decoder.weight", &tensors)?;
        }
        if let Some(b) = &mut self.decoder.bias {
            assign(b, "decoder.bias", &tensors)?;
        }
        Ok(())
    }
}

impl Scorer for ByteNetLM {
    fn score(&self, ids: &[usize], visible: &[bool]) -> Array2<f32> {
        self.forward(ids, visible)
    }
}
