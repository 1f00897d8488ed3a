use std::{collections::BTreeSet, sync::Arc};

use pretraining_data::{InMemoryCorpus, TokenCorpus};
use training::{
    data::{DataSequencer, SequencerSettings},
    ErrorKind,
};

fn corpus(count: u32) -> Arc<dyn TokenCorpus> {
    let sequences = (0..count).map(|i| vec![i, i + 1, i + 2, i + 3]).collect();
    Arc::new(InMemoryCorpus::new(sequences).unwrap())
}

fn settings(world_size: usize, rank: usize) -> SequencerSettings {
    SequencerSettings {
        seed: 42,
        batch_size: 4,
        gradient_accumulation_steps: 2,
        world_size,
        rank,
        wrap_around: true,
    }
}

#[test]
fn seeking_matches_replay_across_epochs() {
    let data = corpus(10);
    let mut replay = DataSequencer::new(Arc::clone(&data), settings(1, 0), 0).unwrap();
    let batches: Vec<_> = (0..12).map(|_| replay.next_batch().unwrap()).collect();

    for resume_at in [0u64, 3, 5, 11] {
        let mut resumed = DataSequencer::new(Arc::clone(&data), settings(1, 0), 0).unwrap();
        resumed.seek(resume_at);
        for expected in &batches[resume_at as usize..] {
            assert_eq!(&resumed.next_batch().unwrap(), expected);
        }
    }
    assert!(batches.iter().any(|batch| batch.epoch > 0));
}

#[test]
fn ranks_partition_the_global_batch() {
    let data = corpus(16);
    let mut single = DataSequencer::new(Arc::clone(&data), settings(1, 0), 0).unwrap();
    let mut rank0 = DataSequencer::new(Arc::clone(&data), settings(2, 0), 0).unwrap();
    let mut rank1 = DataSequencer::new(Arc::clone(&data), settings(2, 1), 0).unwrap();
    for _ in 0..6 {
        let global = single.next_batch().unwrap();
        let a = rank0.next_batch().unwrap();
        let b = rank1.next_batch().unwrap();
        let mut joined = a.example_indices.clone();
        joined.extend(&b.example_indices);
        assert_eq!(joined, global.example_indices);
        let distinct: BTreeSet<_> = joined.iter().collect();
        assert_eq!(distinct.len(), joined.len());
    }
}

#[test]
fn exhaustion_without_wrap_around_is_reported() {
    let mut settings = settings(1, 0);
    settings.wrap_around = false;
    let mut sequencer = DataSequencer::new(corpus(10), settings, 0).unwrap();
    sequencer.next_batch().unwrap();
    sequencer.next_batch().unwrap();
    let err = sequencer.next_batch().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::DataExhausted);
}
