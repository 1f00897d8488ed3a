//! Reference decoder-only transformer and the model contract the training
//! engine drives.

pub mod block;
pub mod config;
pub mod model;
pub mod observer;

pub use block::DecoderBlock;
pub use config::ModelConfig;
pub use model::DecoderModel;
pub use observer::{ActivationObserver, LanguageModel, NoopObserver};
