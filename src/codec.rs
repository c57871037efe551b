//! Chunk codec: splitting content into bounded chunks and the per-chunk
//! compression applied before storage.
//!
//! Each compressed chunk is an independent zstd frame carrying its own
//! content size, so any chunk can be restored without its neighbours.

use crate::error::{FsError, Result};
use bytes::Bytes;
use futures::Stream;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Upper bound on the decoded size of a single stored chunk (1 GiB)
const MAX_DECODED_CHUNK: u64 = 1024 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkCodec {
    compress: bool,
    level: i32,
}

impl ChunkCodec {
    pub fn new(compress: bool, level: i32) -> Self {
        Self { compress, level }
    }

    pub fn is_compressed(&self) -> bool {
        self.compress
    }

    /// Split in-memory content into chunks of at most `chunk_size` bytes.
    ///
    /// The chunks share the buffer of `content`; empty content yields no chunks.
    pub fn split_bytes(content: Bytes, chunk_size: usize) -> impl Iterator<Item = Bytes> {
        let len = content.len();
        (0..len)
            .step_by(chunk_size.max(1))
            .map(move |start| content.slice(start..(start + chunk_size).min(len)))
    }

    /// Lazily split a reader into chunks of at most `chunk_size` bytes.
    ///
    /// Only the chunk being filled is resident. Every chunk except the last is
    /// exactly `chunk_size` bytes; an empty reader yields no chunks.
    pub fn split_reader<R>(mut reader: R, chunk_size: usize) -> impl Stream<Item = Result<Bytes>> + Send
    where
        R: AsyncRead + Unpin + Send,
    {
        async_stream::try_stream! {
            loop {
                let mut buf = vec![0u8; chunk_size];
                let mut filled = 0;
                while filled < chunk_size {
                    let n = reader.read(&mut buf[filled..]).await?;
                    if n == 0 {
                        break;
                    }
                    filled += n;
                }

                if filled == 0 {
                    break;
                }
                let eof = filled < chunk_size;
                buf.truncate(filled);
                yield Bytes::from(buf);

                if eof {
                    break;
                }
            }
        }
    }

    /// Turn a logical chunk into its stored payload
    pub fn encode(&self, chunk: Bytes) -> Result<Bytes> {
        if !self.compress {
            return Ok(chunk);
        }
        let compressed = zstd::bulk::compress(&chunk, self.level)?;
        Ok(Bytes::from(compressed))
    }

    /// Restore a logical chunk from its stored payload
    pub fn decode(&self, path_id: i64, chunk_no: i64, stored: Vec<u8>) -> Result<Bytes> {
        if !self.compress {
            return Ok(Bytes::from(stored));
        }
        decompress(&stored).map_err(|reason| FsError::CorruptChunk {
            path_id,
            chunk_no,
            reason,
        })
    }
}

/// Decompress one stored frame; the frame header must declare its size.
fn decompress(stored: &[u8]) -> std::result::Result<Bytes, String> {
    let size = match zstd::zstd_safe::get_frame_content_size(stored) {
        Ok(Some(size)) => size,
        Ok(None) => return Err("frame does not declare its content size".to_string()),
        Err(_) => return Err("not a zstd frame".to_string()),
    };
    if size > MAX_DECODED_CHUNK {
        return Err(format!("declared content size {size} exceeds chunk limit"));
    }

    let decoded = zstd::bulk::decompress(stored, size as usize).map_err(|e| e.to_string())?;
    if decoded.len() as u64 != size {
        return Err(format!(
            "decoded {} bytes, frame declared {size}",
            decoded.len()
        ));
    }
    Ok(Bytes::from(decoded))
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;

    fn sample(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 31 % 251) as u8).collect()
    }

    #[test]
    fn test_split_bytes_boundaries() {
        let content = Bytes::from(sample(10));
        let chunks: Vec<Bytes> = ChunkCodec::split_bytes(content.clone(), 4).collect();
        assert_eq!(chunks.iter().map(Bytes::len).collect::<Vec<_>>(), vec![4, 4, 2]);
        assert_eq!(chunks.concat(), content.to_vec());

        let chunks: Vec<Bytes> = ChunkCodec::split_bytes(content, 5).collect();
        assert_eq!(chunks.len(), 2);

        assert_eq!(ChunkCodec::split_bytes(Bytes::new(), 4).count(), 0);
    }

    #[tokio::test]
    async fn test_split_reader_matches_split_bytes() {
        let content = sample(10_000);
        for chunk_size in [1, 7, 1024, 10_000, 20_000] {
            let chunks: Vec<Bytes> = ChunkCodec::split_reader(&content[..], chunk_size)
                .try_collect()
                .await
                .unwrap();
            let expected: Vec<Bytes> =
                ChunkCodec::split_bytes(Bytes::from(content.clone()), chunk_size).collect();
            assert_eq!(chunks, expected, "chunk_size {chunk_size}");
        }
    }

    #[tokio::test]
    async fn test_split_reader_empty() {
        let chunks: Vec<Bytes> = ChunkCodec::split_reader(tokio::io::empty(), 16)
            .try_collect()
            .await
            .unwrap();
        assert!(chunks.is_empty());
    }

    #[tokio::test]
    async fn test_split_reader_short_reads() {
        // A reader that returns at most 3 bytes per read still fills whole chunks
        let (client, mut server) = tokio::io::duplex(3);
        let content = sample(100);
        let writer = {
            let content = content.clone();
            tokio::spawn(async move {
                use tokio::io::AsyncWriteExt;
                server.write_all(&content).await.unwrap();
            })
        };

        let chunks: Vec<Bytes> = ChunkCodec::split_reader(client, 32)
            .try_collect()
            .await
            .unwrap();
        writer.await.unwrap();

        assert_eq!(chunks.iter().map(Bytes::len).collect::<Vec<_>>(), vec![32, 32, 32, 4]);
        assert_eq!(chunks.concat(), content);
    }

    #[test]
    fn test_compression_round_trip() {
        let codec = ChunkCodec::new(true, zstd::DEFAULT_COMPRESSION_LEVEL);
        for len in [0, 1, 10, 10 * 1024] {
            let chunk = Bytes::from(sample(len));
            let stored = codec.encode(chunk.clone()).unwrap();
            let restored = codec.decode(1, 0, stored.to_vec()).unwrap();
            assert_eq!(restored, chunk, "len {len}");
        }
    }

    #[test]
    fn test_uncompressed_is_passthrough() {
        let codec = ChunkCodec::new(false, 0);
        let chunk = Bytes::from_static(b"plain bytes");
        assert_eq!(codec.encode(chunk.clone()).unwrap(), chunk);
        assert_eq!(codec.decode(1, 0, chunk.to_vec()).unwrap(), chunk);
    }

    #[test]
    fn test_corrupt_chunk_detected() {
        let codec = ChunkCodec::new(true, 3);
        let stored = codec.encode(Bytes::from(sample(4096))).unwrap();

        let truncated = stored[..stored.len() / 2].to_vec();
        assert!(matches!(
            codec.decode(7, 3, truncated),
            Err(FsError::CorruptChunk { path_id: 7, chunk_no: 3, .. })
        ));

        assert!(matches!(
            codec.decode(7, 0, b"definitely not zstd".to_vec()),
            Err(FsError::CorruptChunk { .. })
        ));
    }
}
