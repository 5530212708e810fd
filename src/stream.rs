//! Paced byte source.
//!
//! Produces a synthetic, zero-filled payload of a fixed length, one chunk
//! at a time, with:
//! - An optional startup delay before the first byte
//! - Optional rate limiting (bytes per second)
//! - One-time stalls once the emitted byte count crosses a threshold
//! - Cooperative cancellation, checked once per chunk

use crate::cancel::CancelToken;
use bytes::{Bytes, BytesMut};
use std::collections::VecDeque;
use std::time::Duration;
use tracing::{debug, trace};

/// Default total payload size (1 MiB)
pub const DEFAULT_SIZE: u64 = 1024 * 1024;

/// A one-time stall applied once `after` bytes have been emitted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stall {
    /// Byte offset that arms the stall
    pub after: u64,
    /// How long to stall
    pub time: Duration,
}

/// Configuration of a single paced stream
#[derive(Debug, Clone, PartialEq)]
pub struct StreamConfig {
    /// Total number of bytes to emit
    pub size: u64,
    /// Emission rate in bytes per second (None = unthrottled)
    pub rate: Option<f64>,
    /// Delay before the first chunk is computed
    pub startup_delay: Option<Duration>,
    /// Threshold stalls, in any order
    pub stalls: Vec<Stall>,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            size: DEFAULT_SIZE,
            rate: None,
            startup_delay: None,
            stalls: Vec::new(),
        }
    }
}

/// Lazily produces the bytes described by a `StreamConfig`
#[derive(Debug)]
pub struct PacedSource {
    size: u64,
    rate: Option<f64>,
    /// Taken on the first call
    startup_delay: Option<Duration>,
    /// Pending stalls, earliest offset first
    stalls: VecDeque<Stall>,
    transferred: u64,
    finished: bool,
    cancel: CancelToken,
}

impl PacedSource {
    pub fn new(config: StreamConfig) -> Self {
        Self::with_token(config, CancelToken::new())
    }

    /// Create a source that observes an externally owned token
    pub fn with_token(config: StreamConfig, cancel: CancelToken) -> Self {
        let mut stalls = config.stalls;
        stalls.sort_by_key(|stall| stall.after);

        PacedSource {
            size: config.size,
            rate: config.rate.filter(|rate| *rate > 0.0),
            startup_delay: config.startup_delay.filter(|delay| !delay.is_zero()),
            stalls: stalls.into(),
            transferred: 0,
            finished: false,
            cancel,
        }
    }

    /// Produce the next chunk of at most `requested` bytes.
    ///
    /// Returns `None` at end of data, after which every further call
    /// returns `None` immediately. Delays already in progress run to
    /// completion even if the source is cancelled meanwhile; the chunk
    /// is then dropped instead of emitted.
    pub async fn next_chunk(&mut self, requested: usize) -> Option<Bytes> {
        if self.finished {
            return None;
        }

        if let Some(delay) = self.startup_delay.take() {
            trace!(delay_ms = as_millis_u64(delay), "Startup delay");
            tokio::time::sleep(delay).await;
        }

        let requested = requested.max(1) as u64;
        let to_transfer = self.remaining().min(requested);
        if to_transfer == 0 {
            self.finish();
            return None;
        }

        if let Some(delay) = self.pacing_delay(to_transfer) {
            tokio::time::sleep(delay).await;
        }

        if self
            .stalls
            .front()
            .is_some_and(|stall| stall.after <= self.transferred)
        {
            if let Some(stall) = self.stalls.pop_front() {
                debug!(
                    after = stall.after,
                    transferred = self.transferred,
                    time_ms = as_millis_u64(stall.time),
                    "Stalling stream"
                );
                tokio::time::sleep(stall.time).await;
            }
        }

        if self.cancel.is_cancelled() {
            debug!(transferred = self.transferred, "Stream cancelled");
            self.finish();
            return None;
        }

        // to_transfer <= requested, which came from a usize
        let chunk = BytesMut::zeroed(to_transfer as usize).freeze();
        self.transferred += to_transfer;

        if self.transferred >= self.size {
            self.finish();
        }

        Some(chunk)
    }

    /// Time it takes to send `bytes` at the configured rate.
    ///
    /// Rates so low that the delay does not fit a `Duration` saturate to
    /// `Duration::MAX`; tokio clamps such sleeps to the far future.
    fn pacing_delay(&self, bytes: u64) -> Option<Duration> {
        self.rate.map(|rate| {
            Duration::try_from_secs_f64(bytes as f64 / rate).unwrap_or(Duration::MAX)
        })
    }

    /// Token observed by this source; cancelling it stops the stream
    pub fn token(&self) -> &CancelToken {
        &self.cancel
    }

    pub fn transferred(&self) -> u64 {
        self.transferred
    }

    pub fn remaining(&self) -> u64 {
        self.size - self.transferred
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    fn finish(&mut self) {
        if !self.finished {
            self.finished = true;
            debug!(
                size = self.size,
                transferred = self.transferred,
                "Stream finished"
            );
        }
    }
}

/// Whole milliseconds of `duration`, saturating at `u64::MAX`
pub fn as_millis_u64(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::Instant;

    fn config(size: u64) -> StreamConfig {
        StreamConfig {
            size,
            ..Default::default()
        }
    }

    fn assert_waited(start: Instant, ms: u64) {
        let elapsed = start.elapsed();
        let expected = Duration::from_millis(ms);
        assert!(
            elapsed >= expected && elapsed < expected + Duration::from_millis(5),
            "waited {elapsed:?}, expected {expected:?}"
        );
    }

    async fn drain(source: &mut PacedSource, chunk: usize) -> u64 {
        let mut total = 0;
        while let Some(bytes) = source.next_chunk(chunk).await {
            assert!(bytes.len() <= chunk);
            assert!(bytes.iter().all(|b| *b == 0));
            total += bytes.len() as u64;
        }
        total
    }

    #[tokio::test]
    async fn test_emits_exactly_size_bytes() {
        for size in [0, 1, 500, 16 * 1024, 16 * 1024 + 1, DEFAULT_SIZE] {
            let mut source = PacedSource::new(config(size));
            assert_eq!(drain(&mut source, 16 * 1024).await, size);
            assert!(source.is_finished());
            assert_eq!(source.transferred(), size);
        }
    }

    #[tokio::test]
    async fn test_finishes_on_last_chunk() {
        let mut source = PacedSource::new(config(10));

        let chunk = source.next_chunk(4).await.unwrap();
        assert_eq!(chunk.len(), 4);
        assert!(!source.is_finished());

        source.next_chunk(4).await.unwrap();
        let last = source.next_chunk(4).await.unwrap();
        assert_eq!(last.len(), 2);
        assert!(source.is_finished());

        assert!(source.next_chunk(4).await.is_none());
    }

    #[tokio::test]
    async fn test_zero_request_still_makes_progress() {
        let mut source = PacedSource::new(config(3));
        assert_eq!(source.next_chunk(0).await.unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_after_completion_returns_immediately() {
        let mut source = PacedSource::new(StreamConfig {
            size: 4,
            rate: Some(1.0),
            startup_delay: Some(Duration::from_secs(1)),
            stalls: vec![Stall {
                after: 4,
                time: Duration::from_secs(10),
            }],
        });
        assert_eq!(source.next_chunk(16).await.unwrap().len(), 4);

        let start = Instant::now();
        assert!(source.next_chunk(16).await.is_none());
        assert!(source.next_chunk(16).await.is_none());
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_startup_delay_applies_once() {
        let mut source = PacedSource::new(StreamConfig {
            size: 20,
            startup_delay: Some(Duration::from_millis(250)),
            ..Default::default()
        });

        let start = Instant::now();
        source.next_chunk(10).await.unwrap();
        assert_waited(start, 250);

        let start = Instant::now();
        source.next_chunk(10).await.unwrap();
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_startup_delay_applies_to_empty_stream() {
        let mut source = PacedSource::new(StreamConfig {
            size: 0,
            startup_delay: Some(Duration::from_millis(100)),
            ..Default::default()
        });

        let start = Instant::now();
        assert!(source.next_chunk(10).await.is_none());
        assert_waited(start, 100);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_paces_each_chunk() {
        let mut source = PacedSource::new(StreamConfig {
            size: 3000,
            rate: Some(1000.0),
            ..Default::default()
        });

        let start = Instant::now();
        source.next_chunk(500).await.unwrap();
        assert_waited(start, 500);

        let start = Instant::now();
        assert_eq!(drain(&mut source, 1000).await, 2500);
        assert_waited(start, 2500);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_rate_is_unthrottled() {
        let mut source = PacedSource::new(StreamConfig {
            size: 1000,
            rate: Some(0.0),
            ..Default::default()
        });

        let start = Instant::now();
        assert_eq!(drain(&mut source, 100).await, 1000);
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stall_delays_chunk_after_threshold() {
        let mut source = PacedSource::new(StreamConfig {
            size: 2048,
            stalls: vec![Stall {
                after: 500,
                time: Duration::from_millis(5000),
            }],
            ..Default::default()
        });

        // First chunk starts at offset 0, below the threshold
        let start = Instant::now();
        assert_eq!(source.next_chunk(512).await.unwrap().len(), 512);
        assert_eq!(start.elapsed(), Duration::ZERO);

        // Offset 512 >= 500, so this chunk waits first
        let start = Instant::now();
        assert_eq!(source.next_chunk(512).await.unwrap().len(), 512);
        assert_waited(start, 5000);

        // Consumed: no further stall
        let start = Instant::now();
        assert_eq!(drain(&mut source, 512).await, 1024);
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_one_stall_per_chunk_in_offset_order() {
        let mut source = PacedSource::new(StreamConfig {
            size: 300,
            stalls: vec![
                Stall {
                    after: 0,
                    time: Duration::from_millis(300),
                },
                Stall {
                    after: 0,
                    time: Duration::from_millis(200),
                },
                Stall {
                    after: 0,
                    time: Duration::from_millis(100),
                },
            ],
            ..Default::default()
        });

        for expected in [300, 200, 100] {
            let start = Instant::now();
            source.next_chunk(100).await.unwrap();
            assert_waited(start, expected);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalls_are_sorted_by_offset() {
        let mut source = PacedSource::new(StreamConfig {
            size: 300,
            stalls: vec![
                Stall {
                    after: 200,
                    time: Duration::from_millis(50),
                },
                Stall {
                    after: 100,
                    time: Duration::from_millis(70),
                },
            ],
            ..Default::default()
        });

        for expected in [0, 70, 50] {
            let start = Instant::now();
            source.next_chunk(100).await.unwrap();
            assert_waited(start, expected);
        }
        assert!(source.next_chunk(100).await.is_none());
    }

    #[test]
    fn test_pacing_delay_saturates_for_tiny_rates() {
        let source = PacedSource::new(StreamConfig {
            size: 16 * 1024,
            rate: Some(1e-300),
            ..Default::default()
        });
        assert_eq!(source.pacing_delay(16 * 1024), Some(Duration::MAX));

        let source = PacedSource::new(StreamConfig {
            size: 1000,
            rate: Some(4000.0),
            ..Default::default()
        });
        assert_eq!(source.pacing_delay(1000), Some(Duration::from_millis(250)));
        assert_eq!(PacedSource::new(config(10)).pacing_delay(10), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tiny_rate_waits_instead_of_panicking() {
        let mut source = PacedSource::new(StreamConfig {
            size: 16 * 1024,
            rate: Some(1e-300),
            ..Default::default()
        });

        let mut chunk = tokio_test::task::spawn(source.next_chunk(16 * 1024));
        tokio_test::assert_pending!(chunk.poll());
    }

    #[test]
    fn test_as_millis_u64() {
        assert_eq!(as_millis_u64(Duration::from_millis(1500)), 1500);
        assert_eq!(as_millis_u64(Duration::from_micros(999)), 0);
        assert_eq!(as_millis_u64(Duration::MAX), u64::MAX);
    }

    #[tokio::test]
    async fn test_cancel_ends_stream_without_bytes() {
        let mut source = PacedSource::new(config(DEFAULT_SIZE));
        source.next_chunk(1024).await.unwrap();

        source.token().cancel();
        source.token().cancel();
        assert!(source.next_chunk(1024).await.is_none());
        assert_eq!(source.transferred(), 1024);
        assert!(source.is_finished());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_does_not_cut_delay_short() {
        let mut source = PacedSource::new(StreamConfig {
            size: 100,
            stalls: vec![Stall {
                after: 0,
                time: Duration::from_millis(1000),
            }],
            ..Default::default()
        });

        let token = source.token().clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            token.cancel();
        });

        let start = Instant::now();
        assert!(source.next_chunk(100).await.is_none());
        assert_waited(start, 1000);
        assert_eq!(source.transferred(), 0);
    }
}
