use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

/// Splits a flat token stream into fixed-length sequences and writes them to
/// numbered shard files of at most `sequences_per_shard` sequences each.
///
/// A trailing partial sequence is dropped. Returns the ordered shard paths.
pub fn write_token_shards(
    tokens: &[u32],
    sequence_length: usize,
    sequences_per_shard: usize,
    destination: &Path,
    prefix: &str,
) -> io::Result<Vec<PathBuf>> {
    if sequence_length == 0 || sequences_per_shard == 0 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "sequence_length and sequences_per_shard must be greater than zero",
        ));
    }

    fs::create_dir_all(destination)?;

    let dropped = tokens.len() % sequence_length;
    if dropped > 0 {
        tracing::debug!(dropped, "dropping trailing partial sequence");
    }

    let mut shards = Vec::new();
    for (index, chunk) in tokens
        .chunks_exact(sequence_length * sequences_per_shard)
        .map(Some)
        .chain(std::iter::once(None))
        .enumerate()
    {
        let chunk = match chunk {
            Some(chunk) => chunk,
            None => {
                let full = tokens.len() - dropped;
                let written = index * sequence_length * sequences_per_shard;
                if written >= full {
                    break;
                }
                &tokens[written..full]
            }
        };
        let (mut writer, path) = open_shard(destination, prefix, index)?;
        for token in chunk {
            writer.write_all(&token.to_le_bytes())?;
        }
        writer.flush()?;
        writer.into_inner().map_err(|err| err.into_error())?.sync_all()?;
        shards.push(path);
    }

    Ok(shards)
}

/// Path of shard `index` for `prefix` inside `destination`.
pub fn shard_path(destination: &Path, prefix: &str, index: usize) -> PathBuf {
    destination.join(format!("{prefix}-{index:05}.tokens"))
}

fn open_shard(
    destination: &Path,
    prefix: &str,
    index: usize,
) -> io::Result<(BufWriter<File>, PathBuf)> {
    let path = shard_path(destination, prefix, index);
    let file = File::create(&path)?;
    Ok((BufWriter::new(file), path))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shards_respect_sequence_cap() {
        let dir = tempfile::tempdir().unwrap();
        let tokens: Vec<u32> = (0..22).collect();

        let shards = write_token_shards(&tokens, 4, 2, dir.path(), "train").unwrap();

        // 5 whole sequences, 2 per shard, 2 tokens dropped.
        assert_eq!(shards.len(), 3);
        let sizes: Vec<u64> = shards
            .iter()
            .map(|path| fs::metadata(path).unwrap().len())
            .collect();
        assert_eq!(sizes, vec![32, 32, 16]);
        assert!(shards[0].ends_with("train-00000.tokens"));
    }

    #[test]
    fn exact_multiple_writes_no_trailing_shard() {
        let dir = tempfile::tempdir().unwrap();
        let tokens: Vec<u32> = (0..16).collect();

        let shards = write_token_shards(&tokens, 4, 2, dir.path(), "val").unwrap();
        assert_eq!(shards.len(), 2);
    }

    #[test]
    fn reject_zero_sequence_cap() {
        let dir = tempfile::tempdir().unwrap();
        let err = write_token_shards(&[1, 2, 3], 3, 0, dir.path(), "train").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }
}
