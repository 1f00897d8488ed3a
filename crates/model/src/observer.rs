use candle_core::{Result, Tensor, Var};

/// Receives module outputs during a forward pass.
///
/// Observers only see tensors; they cannot replace them, so attaching one
/// never changes the numerical result of the pass.
pub trait ActivationObserver {
    /// Whether the output of `module` should be reported.
    fn wants(&self, module: &str) -> bool;

    fn observe(&mut self, module: &str, output: &Tensor) -> Result<()>;
}

/// Observer that records nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl ActivationObserver for NoopObserver {
    fn wants(&self, _module: &str) -> bool {
        false
    }

    fn observe(&mut self, _module: &str, _output: &Tensor) -> Result<()> {
        Ok(())
    }
}

/// Contract between the training engine and a language model.
pub trait LanguageModel {
    /// Produces logits shaped `(batch, seq, vocab)` for `(batch, seq)` token ids.
    fn forward(&self, token_ids: &Tensor, observer: &mut dyn ActivationObserver) -> Result<Tensor>;

    /// Trainable parameters in a stable order.
    fn named_parameters(&self) -> Vec<(String, Var)>;

    /// Identifiers of every module whose output can be observed.
    fn module_names(&self) -> Vec<String>;

    /// Name of the weight parameter owned by `module`, if it has one.
    fn module_parameter(&self, module: &str) -> Option<String>;

    fn vocab_size(&self) -> usize;
}

/// Reports `output` to `observer` when it asked for `module`.
pub(crate) fn report(
    observer: &mut dyn ActivationObserver,
    module: &str,
    output: &Tensor,
) -> Result<()> {
    if observer.wants(module) {
        observer.observe(module, output)?;
    }
    Ok(())
}
