use std::time::Duration;

/// Default chunk size: 4 MiB plaintext per document.
pub const DEFAULT_CHUNK_SIZE: u64 = 4 * 1024 * 1024;

/// Files at or below this many bytes ship as a single document.
pub const DEFAULT_CHUNK_THRESHOLD: u64 = 4 * 1024 * 1024;

/// Default cap on concurrent chunk workers per transfer.
pub const DEFAULT_MAX_PARALLEL_CHUNKS: usize = 5;

/// Default send/fetch attempts per chunk before the transfer fails.
pub const DEFAULT_MAX_RETRIES_PER_CHUNK: u32 = 3;

/// Tunables for the chunked transfer engines.
#[derive(Debug, Clone)]
pub struct TransferSettings {
    /// Bytes per chunk.
    pub chunk_size: u64,
    /// Direct/chunked boundary: `size > chunk_threshold` means chunked.
    pub chunk_threshold: u64,
    pub max_parallel_chunks: usize,
    pub max_retries_per_chunk: u32,
    /// Linear backoff unit: attempt `n` sleeps `n * retry_backoff`.
    pub retry_backoff: Duration,
}

impl Default for TransferSettings {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            chunk_threshold: DEFAULT_CHUNK_THRESHOLD,
            max_parallel_chunks: DEFAULT_MAX_PARALLEL_CHUNKS,
            max_retries_per_chunk: DEFAULT_MAX_RETRIES_PER_CHUNK,
            retry_backoff: Duration::from_secs(1),
        }
    }
}

impl TransferSettings {
    /// Chunk count for a file of `size` bytes.
    pub fn chunk_count(&self, size: u64) -> u64 {
        if size == 0 {
            0
        } else {
            size.div_ceil(self.chunk_size)
        }
    }

    /// Worker count for one transfer: bounded by the configured cap,
    /// twice the pool size, and the work actually remaining.
    pub fn worker_count(&self, pool_size: usize, pending_chunks: usize) -> usize {
        self.max_parallel_chunks
            .min(pool_size.saturating_mul(2).max(1))
            .min(pending_chunks.max(1))
    }

    /// True when a file of `size` bytes takes the chunked path.
    pub fn is_chunked(&self, size: u64) -> bool {
        size > self.chunk_threshold
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_count_rounds_up() {
        let s = TransferSettings {
            chunk_size: 4,
            ..Default::default()
        };
        assert_eq!(s.chunk_count(0), 0);
        assert_eq!(s.chunk_count(1), 1);
        assert_eq!(s.chunk_count(4), 1);
        assert_eq!(s.chunk_count(5), 2);
        assert_eq!(s.chunk_count(9), 3);
    }

    #[test]
    fn threshold_boundary_is_direct() {
        let s = TransferSettings::default();
        assert!(!s.is_chunked(DEFAULT_CHUNK_THRESHOLD));
        assert!(s.is_chunked(DEFAULT_CHUNK_THRESHOLD + 1));
    }

    #[test]
    fn worker_count_respects_all_caps() {
        let s = TransferSettings::default();
        assert_eq!(s.worker_count(3, 100), 5);
        assert_eq!(s.worker_count(1, 100), 2);
        assert_eq!(s.worker_count(4, 2), 2);
        // a pool always yields at least one worker
        assert_eq!(s.worker_count(0, 10), 1);
    }
}
