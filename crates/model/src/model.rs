use candle_core::{Error, Result, Tensor, Var};
use candle_nn::Module;
use rand::{rngs::StdRng, SeedableRng};

use crate::{
    block::{causal_mask, DecoderBlock, ParameterFactory, Projection, RmsNorm},
    config::ModelConfig,
    observer::{report, ActivationObserver, LanguageModel},
};

const EMBEDDING: &str = "embedding";
const OUTPUT_NORM: &str = "output_norm";
const DE_EMBEDDING: &str = "de_embedding";

/// Decoder-only transformer used as the reference trainee.
pub struct DecoderModel {
    config: ModelConfig,
    embedding: candle_nn::Embedding,
    blocks: Vec<DecoderBlock>,
    output_norm: RmsNorm,
    de_embedding: Projection,
    parameters: Vec<(String, Var)>,
}

impl DecoderModel {
    /// Builds the model with weights drawn from `config.init_seed`.
    pub fn new(config: ModelConfig) -> Result<Self> {
        config.validate()?;

        let mut rng = StdRng::seed_from_u64(config.init_seed);
        let mut parameters = Vec::new();
        let device = config.device.clone();
        let mut factory = ParameterFactory::new(&mut rng, &device, &mut parameters);

        let table = factory.matrix(
            &format!("{EMBEDDING}.weight"),
            config.vocab_size,
            config.hidden_dim,
        )?;
        let embedding = candle_nn::Embedding::new(table.as_tensor().clone(), config.hidden_dim);

        let mut blocks = Vec::with_capacity(config.n_layers);
        for layer in 0..config.n_layers {
            blocks.push(DecoderBlock::new(&mut factory, layer, &config)?);
        }

        let output_norm = RmsNorm::new(
            &mut factory,
            OUTPUT_NORM.to_string(),
            config.hidden_dim,
            config.norm_eps,
        )?;
        let de_embedding = Projection::new(
            &mut factory,
            DE_EMBEDDING.to_string(),
            config.hidden_dim,
            config.vocab_size,
        )?;

        Ok(Self {
            config,
            embedding,
            blocks,
            output_norm,
            de_embedding,
            parameters,
        })
    }

    /// Returns the model configuration.
    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn blocks(&self) -> &[DecoderBlock] {
        &self.blocks
    }
}

impl LanguageModel for DecoderModel {
    fn forward(&self, token_ids: &Tensor, observer: &mut dyn ActivationObserver) -> Result<Tensor> {
        let (_, seq) = token_ids.dims2()?;
        if seq == 0 || seq > self.config.max_seq_len {
            return Err(Error::Msg(format!(
                "sequence length {seq} outside 1..={}",
                self.config.max_seq_len
            )));
        }

        let mut hidden = self.embedding.forward(token_ids)?;
        report(observer, EMBEDDING, &hidden)?;

        let mask = causal_mask(seq, token_ids.device())?;
        for block in &self.blocks {
            hidden = block.forward(&hidden, &mask, observer)?;
        }

        let normalized = self.output_norm.forward(&hidden, observer)?;
        self.de_embedding.forward(&normalized, observer)
    }

    fn named_parameters(&self) -> Vec<(String, Var)> {
        self.parameters.clone()
    }

    fn module_names(&self) -> Vec<String> {
        let mut names = vec![EMBEDDING.to_string()];
        for block in &self.blocks {
            names.extend(block.module_names());
        }
        names.push(OUTPUT_NORM.to_string());
        names.push(DE_EMBEDDING.to_string());
        names
    }

    fn module_parameter(&self, module: &str) -> Option<String> {
        match module {
            EMBEDDING => Some(format!("{EMBEDDING}.weight")),
            OUTPUT_NORM => Some(self.output_norm.weight_name()),
            DE_EMBEDDING => Some(self.de_embedding.weight_name()),
            _ => self.blocks.iter().find_map(|block| {
                block
                    .projection(module)
                    .map(Projection::weight_name)
                    .or_else(|| block.norm(module).map(RmsNorm::weight_name))
            }),
        }
    }

    fn vocab_size(&self) -> usize {
        self.config.vocab_size
    }
}
