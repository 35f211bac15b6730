//! Division and stripe geometry.
//!
//! A file of `size` bytes is split across `divisions` streams. With a
//! non-zero interleave factor `I` the streams take turns: stripe `s` covers
//! `[s*N*I, (s+1)*N*I)` and division `i` owns the `I` bytes at
//! `s*N*I + i*I` of every stripe. With interleave 0 each division owns one
//! contiguous, page-aligned range instead.

use crate::error::{ReplError, Result};

/// The only striping algorithm version this build implements.
pub const ALGORITHM_LATEST: i32 = 0;

/// Files get one more division per this many bytes, at most.
pub const MINIMUM_DIVISION_SIZE: u64 = 65536;

/// Alignment of contiguous division boundaries.
pub const IOSIZE_ALIGNMENT: u64 = 4096;

/// Largest interleave factor accepted from configuration or a peer.
pub const MAX_INTERLEAVE: u64 = 64 << 20;

/// Largest full stripe of a stripe-synchronized transfer. The sender holds
/// two stripes in memory at a time.
pub const MAX_SYNC_STRIPE_SIZE: u64 = 256 << 20;

/// Bounds the division count by file size: no division smaller than
/// [`MINIMUM_DIVISION_SIZE`], and always at least one.
pub fn limit_divisions(algorithm_version: i32, divisions: usize, size: u64) -> Result<usize> {
    if algorithm_version != ALGORITHM_LATEST {
        return Err(ReplError::UnknownAlgorithm {
            version: algorithm_version,
        });
    }
    let cap = size / MINIMUM_DIVISION_SIZE;
    if divisions as u64 > cap {
        return Ok(cap.max(1) as usize);
    }
    Ok(divisions.max(1))
}

/// Layout of one file transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StripeLayout {
    size: u64,
    divisions: usize,
    interleave: u64,
}

impl StripeLayout {
    /// Creates a layout. `divisions` is clamped to at least one.
    pub fn new(size: u64, divisions: usize, interleave: u64) -> Self {
        Self {
            size,
            divisions: divisions.max(1),
            interleave,
        }
    }

    /// File size.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Division count.
    pub fn divisions(&self) -> usize {
        self.divisions
    }

    /// Interleave factor; 0 for contiguous division.
    pub fn interleave(&self) -> u64 {
        self.interleave
    }

    /// Whether divisions take turns stripe by stripe.
    pub fn is_striped(&self) -> bool {
        self.interleave > 0
    }

    /// Bytes in one full stripe (`divisions * interleave`).
    pub fn full_stripe_size(&self) -> u64 {
        self.divisions as u64 * self.interleave
    }

    /// Number of stripes, counting a trailing partial one.
    pub fn stripe_count(&self) -> u64 {
        let fs = self.full_stripe_size();
        if fs == 0 {
            return 0;
        }
        self.size.div_ceil(fs)
    }

    /// Number of stripes that are completely filled.
    pub fn full_stripes(&self) -> u64 {
        match self.full_stripe_size() {
            0 => 0,
            fs => self.size / fs,
        }
    }

    /// Builds the cursor for every division.
    pub fn cursors(&self) -> Vec<DivisionCursor> {
        if self.is_striped() {
            self.striped_cursors()
        } else {
            self.contiguous_cursors()
        }
    }

    fn striped_cursors(&self) -> Vec<DivisionCursor> {
        let n = self.divisions as u64;
        let il = self.interleave;
        let fs = self.full_stripe_size();
        let stripes = self.size / fs;
        let residual = self.size - fs * stripes;
        let chunks_on_last = residual / il;
        let last_chunk = residual % il;

        (0..n)
            .map(|i| {
                let mut size = il * stripes;
                if i < chunks_on_last {
                    size += il;
                } else if i == chunks_on_last {
                    size += last_chunk;
                }
                let chunk_residual = if stripes > 0 || i < chunks_on_last {
                    il
                } else if i == chunks_on_last {
                    last_chunk
                } else {
                    0
                };
                DivisionCursor {
                    size,
                    interleave: il,
                    full_stripe_size: fs,
                    offset: i * il,
                    chunk_offset: 0,
                    transferred: 0,
                    chunk_residual,
                }
            })
            .collect()
    }

    fn contiguous_cursors(&self) -> Vec<DivisionCursor> {
        let n = self.divisions as u64;
        let per = self.size.div_ceil(n).next_multiple_of(IOSIZE_ALIGNMENT);
        (0..n)
            .map(|i| {
                let start = (i * per).min(self.size);
                let end = ((i + 1) * per).min(self.size);
                let size = end - start;
                DivisionCursor {
                    size,
                    interleave: size,
                    full_stripe_size: size,
                    offset: start,
                    chunk_offset: start,
                    transferred: 0,
                    chunk_residual: size,
                }
            })
            .collect()
    }
}

/// Progress of one division through its share of the file.
///
/// `offset` is the absolute file offset of the next byte, `chunk_residual`
/// the bytes left in the current stripe's chunk and `chunk_offset` the start
/// of the current stripe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DivisionCursor {
    size: u64,
    interleave: u64,
    full_stripe_size: u64,
    offset: u64,
    chunk_offset: u64,
    transferred: u64,
    chunk_residual: u64,
}

impl DivisionCursor {
    /// Bytes this division carries in total.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Bytes carried so far.
    pub fn transferred(&self) -> u64 {
        self.transferred
    }

    /// All of this division's bytes are done.
    pub fn is_finished(&self) -> bool {
        self.transferred >= self.size
    }

    /// This division's chunk of the current stripe is done.
    pub fn is_stripe_finished(&self) -> bool {
        self.chunk_residual == 0
    }

    /// Length of the next transfer, at most `bound`.
    pub fn next_len(&self, bound: usize) -> usize {
        self.chunk_residual.min(bound as u64) as usize
    }

    /// Absolute file offset of the next byte.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Offset of the next byte relative to the start of the current stripe.
    pub fn stripe_offset(&self) -> u64 {
        self.offset - self.chunk_offset
    }

    /// Records `n` bytes moved within the current chunk.
    pub fn advance(&mut self, n: u64) {
        debug_assert!(n <= self.chunk_residual);
        self.offset += n;
        self.transferred += n;
        self.chunk_residual -= n;
    }

    /// Moves to this division's chunk of the next stripe once the current
    /// chunk is done. No-op otherwise.
    pub fn next_stripe(&mut self) {
        if self.chunk_residual == 0 && self.transferred < self.size {
            self.offset += self.full_stripe_size - self.interleave;
            self.chunk_offset += self.full_stripe_size;
            self.chunk_residual = (self.size - self.transferred).min(self.interleave);
        }
    }

    /// [`DivisionCursor::advance`] then [`DivisionCursor::next_stripe`], for
    /// variants without a stripe barrier.
    pub fn progress(&mut self, n: u64) {
        self.advance(n);
        self.next_stripe();
    }
}
