//! Pre-tokenized corpus access for the training engine.
//!
//! A corpus is a fixed-length sequence store addressed by index. The training
//! side decides the order; this crate only guarantees that index `i` always
//! yields the same tokens.

pub mod corpora;
pub mod sharding;

pub use corpora::{InMemoryCorpus, TokenCorpus, TokenShardCorpus, TOKEN_BYTES};
pub use sharding::{shard_path, write_token_shards};
