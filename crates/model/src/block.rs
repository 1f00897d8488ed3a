use std::fmt;

use candle_core::{DType, Device, Result, Tensor, Var, D};
use candle_nn::Module;
use rand::{rngs::StdRng, Rng};

use crate::{
    config::ModelConfig,
    observer::{report, ActivationObserver},
};

/// Allocates named parameters from a seeded generator so two builds with the
/// same seed produce bit-identical weights.
pub(crate) struct ParameterFactory<'a> {
    rng: &'a mut StdRng,
    device: &'a Device,
    registry: &'a mut Vec<(String, Var)>,
}

impl<'a> ParameterFactory<'a> {
    pub(crate) fn new(
        rng: &'a mut StdRng,
        device: &'a Device,
        registry: &'a mut Vec<(String, Var)>,
    ) -> Self {
        Self {
            rng,
            device,
            registry,
        }
    }

    /// Xavier-uniform matrix shaped `(rows, cols)`.
    pub(crate) fn matrix(&mut self, name: &str, rows: usize, cols: usize) -> Result<Var> {
        let bound = (6.0 / (rows + cols) as f32).sqrt();
        let data: Vec<f32> = (0..rows * cols)
            .map(|_| self.rng.gen_range(-bound..bound))
            .collect();
        self.register(name, Var::from_vec(data, (rows, cols), self.device)?)
    }

    pub(crate) fn ones(&mut self, name: &str, size: usize) -> Result<Var> {
        self.register(name, Var::ones(size, DType::F32, self.device)?)
    }

    fn register(&mut self, name: &str, var: Var) -> Result<Var> {
        self.registry.push((name.to_string(), var.clone()));
        Ok(var)
    }
}

/// Weight-only projection applied to the last dimension.
pub(crate) struct Projection {
    name: String,
    linear: candle_nn::Linear,
}

impl Projection {
    pub(crate) fn new(
        factory: &mut ParameterFactory<'_>,
        name: String,
        in_dim: usize,
        out_dim: usize,
    ) -> Result<Self> {
        let weight = factory.matrix(&format!("{name}.weight"), out_dim, in_dim)?;
        let linear = candle_nn::Linear::new(weight.as_tensor().clone(), None);
        Ok(Self { name, linear })
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn forward(
        &self,
        xs: &Tensor,
        observer: &mut dyn ActivationObserver,
    ) -> Result<Tensor> {
        let out = self.linear.forward(xs)?;
        report(observer, &self.name, &out)?;
        Ok(out)
    }
}

/// Root-mean-square normalization with a learned gain.
pub(crate) struct RmsNorm {
    name: String,
    weight: Var,
    eps: f64,
}

impl RmsNorm {
    pub(crate) fn new(
        factory: &mut ParameterFactory<'_>,
        name: String,
        size: usize,
        eps: f64,
    ) -> Result<Self> {
        let weight = factory.ones(&format!("{name}.weight"), size)?;
        Ok(Self { name, weight, eps })
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn forward(
        &self,
        xs: &Tensor,
        observer: &mut dyn ActivationObserver,
    ) -> Result<Tensor> {
        let variance = xs.sqr()?.mean_keepdim(D::Minus1)?;
        let normed = xs.broadcast_div(&variance.affine(1.0, self.eps)?.sqrt()?)?;
        let out = normed.broadcast_mul(self.weight.as_tensor())?;
        report(observer, &self.name, &out)?;
        Ok(out)
    }
}

struct Attention {
    name: String,
    heads: usize,
    head_dim: usize,
    q_proj: Projection,
    k_proj: Projection,
    v_proj: Projection,
    o_proj: Projection,
}

impl Attention {
    fn new(factory: &mut ParameterFactory<'_>, name: String, config: &ModelConfig) -> Result<Self> {
        let hidden = config.hidden_dim;
        Ok(Self {
            q_proj: Projection::new(factory, format!("{name}.q_proj"), hidden, hidden)?,
            k_proj: Projection::new(factory, format!("{name}.k_proj"), hidden, hidden)?,
            v_proj: Projection::new(factory, format!("{name}.v_proj"), hidden, hidden)?,
            o_proj: Projection::new(factory, format!("{name}.o_proj"), hidden, hidden)?,
            heads: config.n_heads,
            head_dim: config.head_dim(),
            name,
        })
    }

    fn split_heads(&self, xs: &Tensor, batch: usize, seq: usize) -> Result<Tensor> {
        xs.reshape((batch, seq, self.heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()
    }

    fn forward(
        &self,
        xs: &Tensor,
        mask: &Tensor,
        observer: &mut dyn ActivationObserver,
    ) -> Result<Tensor> {
        let (batch, seq, hidden) = xs.dims3()?;
        let q = self.split_heads(&self.q_proj.forward(xs, observer)?, batch, seq)?;
        let k = self.split_heads(&self.k_proj.forward(xs, observer)?, batch, seq)?;
        let v = self.split_heads(&self.v_proj.forward(xs, observer)?, batch, seq)?;

        let scale = 1.0 / (self.head_dim as f64).sqrt();
        let scores = q
            .matmul(&k.t()?.contiguous()?)?
            .affine(scale, 0.0)?
            .broadcast_add(mask)?;
        let probs = candle_nn::ops::softmax(&scores, D::Minus1)?;
        let context = probs
            .matmul(&v)?
            .transpose(1, 2)?
            .contiguous()?
            .reshape((batch, seq, hidden))?;

        let out = self.o_proj.forward(&context, observer)?;
        report(observer, &self.name, &out)?;
        Ok(out)
    }

    fn projections(&self) -> [&Projection; 4] {
        [&self.q_proj, &self.k_proj, &self.v_proj, &self.o_proj]
    }
}

/// Gated feed-forward: `w_2(silu(w_0 x) * w_1 x)`.
struct SwiGlu {
    name: String,
    w_0: Projection,
    w_1: Projection,
    w_2: Projection,
}

impl SwiGlu {
    fn new(factory: &mut ParameterFactory<'_>, name: String, config: &ModelConfig) -> Result<Self> {
        Ok(Self {
            w_0: Projection::new(factory, format!("{name}.w_0"), config.hidden_dim, config.ff_dim)?,
            w_1: Projection::new(factory, format!("{name}.w_1"), config.hidden_dim, config.ff_dim)?,
            w_2: Projection::new(factory, format!("{name}.w_2"), config.ff_dim, config.hidden_dim)?,
            name,
        })
    }

    fn forward(&self, xs: &Tensor, observer: &mut dyn ActivationObserver) -> Result<Tensor> {
        let gate = self.w_0.forward(xs, observer)?.silu()?;
        let up = self.w_1.forward(xs, observer)?;
        let out = self.w_2.forward(&(gate * up)?, observer)?;
        report(observer, &self.name, &out)?;
        Ok(out)
    }

    fn projections(&self) -> [&Projection; 3] {
        [&self.w_0, &self.w_1, &self.w_2]
    }
}

/// Pre-norm residual decoder block.
pub struct DecoderBlock {
    name: String,
    attention_norm: RmsNorm,
    attention: Attention,
    swiglu_norm: RmsNorm,
    swiglu: SwiGlu,
}

impl fmt::Debug for DecoderBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DecoderBlock")
            .field("name", &self.name)
            .field("heads", &self.attention.heads)
            .field("head_dim", &self.attention.head_dim)
            .finish()
    }
}

impl DecoderBlock {
    pub(crate) fn new(
        factory: &mut ParameterFactory<'_>,
        index: usize,
        config: &ModelConfig,
    ) -> Result<Self> {
        let name = format!("layers.{index}");
        Ok(Self {
            attention_norm: RmsNorm::new(
                factory,
                format!("{name}.attention_norm"),
                config.hidden_dim,
                config.norm_eps,
            )?,
            attention: Attention::new(factory, format!("{name}.attention"), config)?,
            swiglu_norm: RmsNorm::new(
                factory,
                format!("{name}.swiglu_norm"),
                config.hidden_dim,
                config.norm_eps,
            )?,
            swiglu: SwiGlu::new(factory, format!("{name}.swiglu"), config)?,
            name,
        })
    }

    pub(crate) fn forward(
        &self,
        xs: &Tensor,
        mask: &Tensor,
        observer: &mut dyn ActivationObserver,
    ) -> Result<Tensor> {
        let attended = self
            .attention
            .forward(&self.attention_norm.forward(xs, observer)?, mask, observer)?;
        let hidden = (xs + attended)?;
        let fed = self
            .swiglu
            .forward(&self.swiglu_norm.forward(&hidden, observer)?, observer)?;
        let out = (hidden + fed)?;
        report(observer, &self.name, &out)?;
        Ok(out)
    }

    /// Observable modules of this block, outermost first.
    pub(crate) fn module_names(&self) -> Vec<String> {
        let mut names = vec![
            self.name.clone(),
            self.attention_norm.name().to_string(),
            self.attention.name.clone(),
        ];
        names.extend(
            self.attention
                .projections()
                .iter()
                .map(|proj| proj.name().to_string()),
        );
        names.push(self.swiglu_norm.name().to_string());
        names.push(self.swiglu.name.clone());
        names.extend(
            self.swiglu
                .projections()
                .iter()
                .map(|proj| proj.name().to_string()),
        );
        names
    }

    pub(crate) fn projection(&self, module: &str) -> Option<&Projection> {
        self.attention
            .projections()
            .into_iter()
            .chain(self.swiglu.projections())
            .find(|proj| proj.name() == module)
    }

    pub(crate) fn norm(&self, module: &str) -> Option<&RmsNorm> {
        [&self.attention_norm, &self.swiglu_norm]
            .into_iter()
            .find(|norm| norm.name() == module)
    }
}

impl RmsNorm {
    pub(crate) fn weight_name(&self) -> String {
        format!("{}.weight", self.name)
    }
}

impl Projection {
    pub(crate) fn weight_name(&self) -> String {
        format!("{}.weight", self.name)
    }
}

/// Additive causal mask shaped `(seq, seq)`: zero on and below the diagonal,
/// negative infinity above it.
pub(crate) fn causal_mask(seq: usize, device: &Device) -> Result<Tensor> {
    let data: Vec<f32> = (0..seq)
        .flat_map(|row| (0..seq).map(move |col| if col > row { f32::NEG_INFINITY } else { 0.0 }))
        .collect();
    Tensor::from_vec(data, (seq, seq), device)
}
