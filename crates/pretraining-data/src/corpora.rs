use std::fs::{self, File};
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Width of one token on disk (little-endian `u32`).
pub const TOKEN_BYTES: usize = 4;

/// Random-access store of fixed-length token sequences.
///
/// Implementations must return identical tokens for a given index for the
/// lifetime of the corpus; the data order is decided by the caller.
pub trait TokenCorpus: Send + Sync {
    /// Number of tokens in every sequence.
    fn sequence_length(&self) -> usize;

    /// Number of sequences available.
    fn len(&self) -> u64;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Appends the tokens of sequence `index` to `out`.
    fn read_sequence(&self, index: u64, out: &mut Vec<u32>) -> io::Result<()>;
}

/// Sequences kept in memory, mostly for tests and synthetic runs.
#[derive(Clone, Debug)]
pub struct InMemoryCorpus {
    sequence_length: usize,
    tokens: Vec<u32>,
}

impl InMemoryCorpus {
    pub fn new(sequences: Vec<Vec<u32>>) -> io::Result<Self> {
        let sequence_length = sequences.first().map(Vec::len).unwrap_or(0);
        if sequence_length == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "in-memory corpus needs at least one non-empty sequence",
            ));
        }
        let mut tokens = Vec::with_capacity(sequence_length * sequences.len());
        for (index, sequence) in sequences.into_iter().enumerate() {
            if sequence.len() != sequence_length {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!(
                        "sequence {index} has {} tokens, expected {sequence_length}",
                        sequence.len()
                    ),
                ));
            }
            tokens.extend(sequence);
        }
        Ok(Self {
            sequence_length,
            tokens,
        })
    }

    /// Builds `count` sequences of `sequence_length` tokens following a simple
    /// counting pattern modulo `vocab_size`.
    pub fn synthetic(count: usize, sequence_length: usize, vocab_size: u32) -> io::Result<Self> {
        if vocab_size == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "vocab_size must be greater than zero",
            ));
        }
        let sequences = (0..count)
            .map(|row| {
                (0..sequence_length)
                    .map(|col| ((row * 7 + col * 3 + row * col) as u32) % vocab_size)
                    .collect()
            })
            .collect();
        Self::new(sequences)
    }
}

impl TokenCorpus for InMemoryCorpus {
    fn sequence_length(&self) -> usize {
        self.sequence_length
    }

    fn len(&self) -> u64 {
        (self.tokens.len() / self.sequence_length) as u64
    }

    fn read_sequence(&self, index: u64, out: &mut Vec<u32>) -> io::Result<()> {
        if index >= self.len() {
            return Err(out_of_range(index, self.len()));
        }
        let start = index as usize * self.sequence_length;
        out.extend_from_slice(&self.tokens[start..start + self.sequence_length]);
        Ok(())
    }
}

#[derive(Debug)]
struct Shard {
    path: PathBuf,
    first_sequence: u64,
    sequences: u64,
    file: Mutex<File>,
}

/// Corpus backed by one or more raw token shard files.
///
/// Each shard is a flat run of little-endian `u32` token ids whose length is
/// a whole number of sequences. Shards are concatenated in the order given.
#[derive(Debug)]
pub struct TokenShardCorpus {
    sequence_length: usize,
    shards: Vec<Shard>,
    total: u64,
}

impl TokenShardCorpus {
    pub fn open(paths: &[PathBuf], sequence_length: usize) -> io::Result<Self> {
        if paths.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "expected at least one shard for corpus",
            ));
        }
        if sequence_length == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "sequence_length must be greater than zero",
            ));
        }

        let record_bytes = (sequence_length * TOKEN_BYTES) as u64;
        let mut shards = Vec::with_capacity(paths.len());
        let mut total = 0u64;
        for path in paths {
            let file = File::open(path).map_err(|err| annotate(path, err))?;
            let bytes = file.metadata().map_err(|err| annotate(path, err))?.len();
            if bytes % record_bytes != 0 {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!(
                        "shard {} holds {bytes} bytes, not a multiple of {record_bytes} \
                         ({sequence_length} tokens per sequence)",
                        path.display()
                    ),
                ));
            }
            let sequences = bytes / record_bytes;
            shards.push(Shard {
                path: path.clone(),
                first_sequence: total,
                sequences,
                file: Mutex::new(file),
            });
            total += sequences;
        }

        tracing::debug!(
            shards = shards.len(),
            sequences = total,
            sequence_length,
            "opened token shard corpus"
        );

        Ok(Self {
            sequence_length,
            shards,
            total,
        })
    }

    /// Opens every `*.tokens` file of `dir` in lexical order.
    pub fn open_dir(dir: &Path, sequence_length: usize) -> io::Result<Self> {
        let mut paths = Vec::new();
        for entry in fs::read_dir(dir).map_err(|err| annotate(dir, err))? {
            let path = entry?.path();
            if path.extension().and_then(|ext| ext.to_str()) == Some("tokens") {
                paths.push(path);
            }
        }
        paths.sort();
        Self::open(&paths, sequence_length)
    }

    /// Opens a directory of shards or a single shard file.
    pub fn open_path(path: &Path, sequence_length: usize) -> io::Result<Self> {
        if path.is_dir() {
            Self::open_dir(path, sequence_length)
        } else {
            Self::open(&[path.to_path_buf()], sequence_length)
        }
    }

    fn locate(&self, index: u64) -> Option<&Shard> {
        let position = self
            .shards
            .partition_point(|shard| shard.first_sequence + shard.sequences <= index);
        self.shards.get(position)
    }
}

impl TokenCorpus for TokenShardCorpus {
    fn sequence_length(&self) -> usize {
        self.sequence_length
    }

    fn len(&self) -> u64 {
        self.total
    }

    fn read_sequence(&self, index: u64, out: &mut Vec<u32>) -> io::Result<()> {
        let shard = self
            .locate(index)
            .ok_or_else(|| out_of_range(index, self.total))?;
        let local = index - shard.first_sequence;
        let record_bytes = self.sequence_length * TOKEN_BYTES;
        let mut buffer = vec![0u8; record_bytes];
        {
            let mut file = shard
                .file
                .lock()
                .map_err(|_| io::Error::new(io::ErrorKind::Other, "shard handle poisoned"))?;
            file.seek(SeekFrom::Start(local * record_bytes as u64))?;
            file.read_exact(&mut buffer)
                .map_err(|err| annotate(&shard.path, err))?;
        }
        out.extend(
            buffer
                .chunks_exact(TOKEN_BYTES)
                .map(|chunk| u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]])),
        );
        Ok(())
    }
}

fn out_of_range(index: u64, len: u64) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidInput,
        format!("sequence index {index} out of range for corpus of {len} sequences"),
    )
}

fn annotate(path: &Path, err: io::Error) -> io::Error {
    io::Error::new(err.kind(), format!("{}: {err}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sharding::write_token_shards;

    #[test]
    fn in_memory_rejects_ragged_sequences() {
        let err = InMemoryCorpus::new(vec![vec![1, 2, 3], vec![4, 5]]).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[test]
    fn shard_corpus_reads_across_shard_boundaries() {
        let dir = tempfile::tempdir().unwrap();
        let tokens: Vec<u32> = (0..40).collect();
        let paths = write_token_shards(&tokens, 4, 3, dir.path(), "train").unwrap();
        assert_eq!(paths.len(), 4);

        let corpus = TokenShardCorpus::open_dir(dir.path(), 4).unwrap();
        assert_eq!(corpus.len(), 10);

        let mut out = Vec::new();
        corpus.read_sequence(3, &mut out).unwrap();
        assert_eq!(out, vec![12, 13, 14, 15]);

        out.clear();
        corpus.read_sequence(9, &mut out).unwrap();
        assert_eq!(out, vec![36, 37, 38, 39]);

        assert!(corpus.read_sequence(10, &mut out).is_err());
    }

    #[test]
    fn shard_corpus_rejects_partial_sequences() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.tokens");
        fs::write(&path, [0u8; 10]).unwrap();

        let err = TokenShardCorpus::open(&[path], 2).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn synthetic_corpus_respects_vocab() {
        let corpus = InMemoryCorpus::synthetic(5, 8, 11).unwrap();
        let mut out = Vec::new();
        for index in 0..corpus.len() {
            corpus.read_sequence(index, &mut out).unwrap();
        }
        assert_eq!(out.len(), 40);
        assert!(out.iter().all(|&token| token < 11));
    }
}
