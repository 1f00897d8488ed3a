use candle_core::{Device, Error, Result};

/// High-level configuration for assembling the reference decoder.
#[derive(Debug, Clone)]
pub struct ModelConfig {
    pub vocab_size: usize,
    pub hidden_dim: usize,
    pub n_layers: usize,
    pub n_heads: usize,
    pub ff_dim: usize,
    pub max_seq_len: usize,
    pub norm_eps: f64,
    /// Seed for deterministic parameter initialization.
    pub init_seed: u64,
    pub device: Device,
}

impl ModelConfig {
    pub fn head_dim(&self) -> usize {
        self.hidden_dim / self.n_heads.max(1)
    }

    /// Validate structural invariants before any parameter is allocated.
    pub fn validate(&self) -> Result<()> {
        if self.vocab_size == 0 {
            return Err(Error::Msg("vocab_size must be greater than zero".into()));
        }
        if self.hidden_dim == 0 {
            return Err(Error::Msg("hidden_dim must be greater than zero".into()));
        }
        if self.n_layers == 0 {
            return Err(Error::Msg("n_layers must be greater than zero".into()));
        }
        if self.n_heads == 0 {
            return Err(Error::Msg("n_heads must be greater than zero".into()));
        }
        if self.hidden_dim % self.n_heads != 0 {
            return Err(Error::Msg(format!(
                "hidden_dim ({}) must be divisible by n_heads ({})",
                self.hidden_dim, self.n_heads
            )));
        }
        if self.ff_dim == 0 {
            return Err(Error::Msg("ff_dim must be greater than zero".into()));
        }
        if self.max_seq_len == 0 {
            return Err(Error::Msg("max_seq_len must be greater than zero".into()));
        }
        if self.norm_eps.is_nan() || self.norm_eps <= 0.0 {
            return Err(Error::Msg("norm_eps must be positive".into()));
        }
        Ok(())
    }
}
