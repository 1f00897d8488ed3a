//! Deterministic, seekable batch order over a pre-tokenized corpus.
//!
//! Logical position `p = step * batch_size + i` maps to epoch `p / N` and to
//! the example `perm(epoch)[p % N]`, where `perm(epoch)` is a seeded shuffle
//! of the corpus. Every rank derives the same logical batch and keeps only
//! its own contiguous slice, so the stream is a pure function of
//! `(seed, step)` and seeking never replays earlier steps.

use std::{path::Path, sync::Arc};

use candle_core::{Device, Tensor};
use pretraining_data::{TokenCorpus, TokenShardCorpus};
use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};

use crate::{config::TrainingConfig, TrainingError};

/// Result alias for data pipeline fallible operations.
pub type Result<T> = std::result::Result<T, TrainingError>;

/// Batch geometry and ordering inputs of a sequencer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SequencerSettings {
    pub seed: u64,
    /// Global batch size across all ranks.
    pub batch_size: usize,
    pub gradient_accumulation_steps: usize,
    pub world_size: usize,
    pub rank: usize,
    pub wrap_around: bool,
}

impl SequencerSettings {
    pub fn from_config(config: &TrainingConfig, rank: usize, world_size: usize) -> Self {
        Self {
            seed: config.data.seed,
            batch_size: config.data.batch_size,
            gradient_accumulation_steps: config.data.gradient_accumulation_steps,
            world_size,
            rank,
            wrap_around: config.data.wrap_around,
        }
    }

    pub fn local_batch_size(&self) -> usize {
        self.batch_size / self.world_size
    }

    pub fn micro_batch_size(&self) -> usize {
        self.local_batch_size() / self.gradient_accumulation_steps
    }
}

/// One gradient-accumulation slice of a rank's batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MicroBatch {
    /// Row-major `rows x seq_len` token ids.
    pub tokens: Vec<u32>,
    pub rows: usize,
    pub seq_len: usize,
}

impl MicroBatch {
    /// Model input: every row without its final token.
    pub fn inputs(&self, device: &Device) -> Result<Tensor> {
        self.window(0, device)
    }

    /// Next-token targets: every row without its first token.
    pub fn targets(&self, device: &Device) -> Result<Tensor> {
        self.window(1, device)
    }

    pub fn predicted_tokens(&self) -> usize {
        self.rows * (self.seq_len - 1)
    }

    fn window(&self, offset: usize, device: &Device) -> Result<Tensor> {
        let width = self.seq_len - 1;
        let mut values = Vec::with_capacity(self.rows * width);
        for row in self.tokens.chunks(self.seq_len) {
            values.extend_from_slice(&row[offset..offset + width]);
        }
        Ok(Tensor::from_vec(values, (self.rows, width), device)?)
    }
}

/// The share of logical batch `step` that belongs to one rank.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataBatch {
    pub step: u64,
    /// Epoch of the batch's first example.
    pub epoch: u64,
    pub rank: usize,
    /// Corpus indices of this rank's examples, in micro-batch order.
    pub example_indices: Vec<u64>,
    pub micro_batches: Vec<MicroBatch>,
}

impl DataBatch {
    pub fn predicted_tokens(&self) -> usize {
        self.micro_batches
            .iter()
            .map(MicroBatch::predicted_tokens)
            .sum()
    }
}

/// Lazy, restartable batch stream for one rank.
pub struct DataSequencer {
    corpus: Arc<dyn TokenCorpus>,
    settings: SequencerSettings,
    next_step: u64,
    permutation: Option<(u64, Vec<u64>)>,
}

impl DataSequencer {
    pub fn new(
        corpus: Arc<dyn TokenCorpus>,
        settings: SequencerSettings,
        start_step: u64,
    ) -> Result<Self> {
        let SequencerSettings {
            batch_size,
            gradient_accumulation_steps,
            world_size,
            rank,
            ..
        } = settings;
        if world_size == 0 || rank >= world_size {
            return Err(TrainingError::configuration(format!(
                "rank {rank} is outside a world of size {world_size}"
            )));
        }
        if batch_size == 0 || batch_size % world_size != 0 {
            return Err(TrainingError::configuration(format!(
                "batch size {batch_size} cannot be split evenly across {world_size} ranks"
            )));
        }
        let local = batch_size / world_size;
        if gradient_accumulation_steps == 0 || local % gradient_accumulation_steps != 0 {
            return Err(TrainingError::configuration(format!(
                "per-rank batch {local} cannot be split into {gradient_accumulation_steps} micro-batches"
            )));
        }
        if corpus.is_empty() {
            return Err(TrainingError::configuration("training corpus has no sequences"));
        }
        if corpus.sequence_length() < 2 {
            return Err(TrainingError::configuration(
                "corpus sequences need at least two tokens",
            ));
        }

        Ok(Self {
            corpus,
            settings,
            next_step: start_step,
            permutation: None,
        })
    }

    /// Opens the corpus at `path` and checks its sequence length.
    pub fn open(
        path: &Path,
        sequence_length: usize,
        settings: SequencerSettings,
        start_step: u64,
    ) -> Result<Self> {
        let corpus = TokenShardCorpus::open_path(path, sequence_length).map_err(|err| {
            TrainingError::configuration(format!(
                "failed to open token corpus {}: {err}",
                path.display()
            ))
        })?;
        Self::new(Arc::new(corpus), settings, start_step)
    }

    pub fn settings(&self) -> &SequencerSettings {
        &self.settings
    }

    pub fn corpus_len(&self) -> u64 {
        self.corpus.len()
    }

    pub fn sequence_length(&self) -> usize {
        self.corpus.sequence_length()
    }

    /// Step whose batch `next_batch` returns next.
    pub fn cursor(&self) -> u64 {
        self.next_step
    }

    /// Positions the stream at `step` without reading earlier batches.
    pub fn seek(&mut self, step: u64) {
        self.next_step = step;
    }

    pub fn next_batch(&mut self) -> Result<DataBatch> {
        let batch = self.batch_for_step(self.next_step)?;
        self.next_step += 1;
        Ok(batch)
    }

    /// Logical position of the first example of `step`.
    pub fn sample_position(&self, step: u64) -> u64 {
        step * self.settings.batch_size as u64
    }

    pub fn epoch_of_step(&self, step: u64) -> u64 {
        self.sample_position(step) / self.corpus.len()
    }

    /// Builds this rank's share of batch `step`. Does not move the cursor.
    pub fn batch_for_step(&mut self, step: u64) -> Result<DataBatch> {
        let settings = self.settings;
        let available = self.corpus.len();
        let local = settings.local_batch_size();
        let first = self.sample_position(step) + (settings.rank * local) as u64;

        let mut example_indices = Vec::with_capacity(local);
        for position in first..first + local as u64 {
            let epoch = position / available;
            if epoch > 0 && !settings.wrap_around {
                return Err(TrainingError::DataExhausted {
                    step,
                    position,
                    available,
                });
            }
            let permutation = self.permutation(epoch);
            example_indices.push(permutation[(position % available) as usize]);
        }

        let seq_len = self.corpus.sequence_length();
        let rows = settings.micro_batch_size();
        let mut micro_batches = Vec::with_capacity(settings.gradient_accumulation_steps);
        let mut row = Vec::with_capacity(seq_len);
        for chunk in example_indices.chunks(rows) {
            let mut tokens = Vec::with_capacity(rows * seq_len);
            for &index in chunk {
                row.clear();
                self.corpus.read_sequence(index, &mut row).map_err(|err| {
                    TrainingError::runtime(format!("failed to read sequence {index}: {err}"))
                })?;
                tokens.extend_from_slice(&row);
            }
            micro_batches.push(MicroBatch {
                tokens,
                rows: chunk.len(),
                seq_len,
            });
        }

        Ok(DataBatch {
            step,
            epoch: self.epoch_of_step(step),
            rank: settings.rank,
            example_indices,
            micro_batches,
        })
    }

    fn permutation(&mut self, epoch: u64) -> &[u64] {
        let stale = !matches!(&self.permutation, Some((cached, _)) if *cached == epoch);
        if stale {
            let mut order: Vec<u64> = (0..self.corpus.len()).collect();
            let mut rng = StdRng::seed_from_u64(self.settings.seed.wrapping_add(epoch));
            order.shuffle(&mut rng);
            self.permutation = Some((epoch, order));
        }
        match &self.permutation {
            Some((_, order)) => order,
            None => &[],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretraining_data::InMemoryCorpus;
    use std::collections::BTreeSet;

    fn corpus(count: usize) -> Arc<dyn TokenCorpus> {
        let sequences = (0..count as u32).map(|i| vec![i, i + 1, i + 2]).collect();
        Arc::new(InMemoryCorpus::new(sequences).unwrap())
    }

    fn settings(world_size: usize, rank: usize) -> SequencerSettings {
        SequencerSettings {
            seed: 42,
            batch_size: 4,
            gradient_accumulation_steps: 1,
            world_size,
            rank,
            wrap_around: true,
        }
    }

    #[test]
    fn ranks_receive_disjoint_slices_of_one_logical_batch() {
        let mut single = DataSequencer::new(corpus(16), settings(1, 0), 0).unwrap();
        let whole = single.batch_for_step(3).unwrap();

        let mut seen = Vec::new();
        for rank in 0..2 {
            let mut seq = DataSequencer::new(corpus(16), settings(2, rank), 0).unwrap();
            let part = seq.batch_for_step(3).unwrap();
            assert_eq!(part.example_indices.len(), 2);
            seen.extend(part.example_indices);
        }
        assert_eq!(seen, whole.example_indices);
        assert_eq!(seen.iter().collect::<BTreeSet<_>>().len(), 4);
    }

    #[test]
    fn seek_matches_sequential_reads() {
        let mut replay = DataSequencer::new(corpus(10), settings(1, 0), 0).unwrap();
        let batches: Vec<_> = (0..8).map(|_| replay.next_batch().unwrap()).collect();

        let mut resumed = DataSequencer::new(corpus(10), settings(1, 0), 0).unwrap();
        resumed.seek(5);
        assert_eq!(resumed.cursor(), 5);
        for expected in &batches[5..] {
            assert_eq!(&resumed.next_batch().unwrap(), expected);
        }
    }

    #[test]
    fn epochs_cover_every_example_once() {
        let mut seq = DataSequencer::new(corpus(8), settings(1, 0), 0).unwrap();
        let first: BTreeSet<u64> = (0..2)
            .flat_map(|step| seq.batch_for_step(step).unwrap().example_indices)
            .collect();
        assert_eq!(first.len(), 8);
        assert_eq!(seq.batch_for_step(2).unwrap().epoch, 1);
    }

    #[test]
    fn exhaustion_without_wrap_around() {
        let mut settings = settings(1, 0);
        settings.wrap_around = false;
        let mut seq = DataSequencer::new(corpus(6), settings, 0).unwrap();
        seq.next_batch().unwrap();
        let err = seq.next_batch().unwrap_err();
        match err {
            TrainingError::DataExhausted {
                step,
                position,
                available,
            } => assert_eq!((step, position, available), (1, 6, 6)),
            other => panic!("unexpected error {other}"),
        }
    }

    #[test]
    fn micro_batches_split_the_local_share() {
        let mut settings = settings(2, 1);
        settings.batch_size = 8;
        settings.gradient_accumulation_steps = 2;
        let mut seq = DataSequencer::new(corpus(32), settings, 0).unwrap();
        let batch = seq.next_batch().unwrap();
        assert_eq!(batch.micro_batches.len(), 2);
        assert!(batch.micro_batches.iter().all(|mb| mb.rows == 2));
        assert_eq!(batch.predicted_tokens(), 8);

        let first = &batch.micro_batches[0];
        let inputs = first.inputs(&Device::Cpu).unwrap().to_vec2::<u32>().unwrap();
        let targets = first.targets(&Device::Cpu).unwrap().to_vec2::<u32>().unwrap();
        assert_eq!(inputs[0][1], targets[0][0]);
    }

    #[test]
    fn invalid_geometry_is_a_configuration_error() {
        let mut bad = settings(3, 0);
        bad.batch_size = 4;
        assert!(DataSequencer::new(corpus(8), bad, 0).is_err());

        let mut bad = settings(1, 0);
        bad.gradient_accumulation_steps = 3;
        let err = DataSequencer::new(corpus(8), bad, 0).err().unwrap();
        assert_eq!(err.kind(), crate::ErrorKind::Configuration);
    }
}
