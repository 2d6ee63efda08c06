//! Byte-Bounded Batch Splitting
//!
//! ## Overview
//!
//! After a long outage the local buffer can hold more readings than fit in one
//! broker message. The splitter cuts an ordered slice of readings into
//! contiguous chunks whose JSON array encoding stays under a byte ceiling.
//!
//! ## Algorithm
//!
//! ```text
//! quantity = max(1, ceil(total_encoded_size / ceiling))
//! split len items into `quantity` runs, as even as possible,
//! the first (len % quantity) runs getting one extra item
//! ```
//!
//! Even runs by count assume similarly sized items. Readings are, but a run can
//! still end up over the ceiling when sizes vary, so the partition is checked
//! against exact encoded sizes and `quantity` grows until every multi-item run
//! fits. The search doubles its step past the estimate and then bisects back.
//! An item that alone exceeds the ceiling is emitted in a run of its own.
//!
//! ## Guarantees
//!
//! - At least one chunk is returned, even for an empty input (one empty chunk)
//! - Concatenating the chunks reproduces the input in order
//! - Chunks borrow from the input; nothing is copied
//!
//! The default ceiling (255 MiB) sits far above everyday payloads; the mechanism
//! exists for pathological backlogs, not routine delivery. It stays below the
//! 256 MiB MQTT packet limit so one chunk plus its envelope is still publishable.

use crate::context::LogContext;
use serde::Serialize;
use std::io;
use std::ops::Range;

/// Default chunk ceiling in bytes (255 MiB)
pub const DEFAULT_BATCH_CEILING: usize = 255 * 1024 * 1024;

/// Splits readings into transmit-sized chunks
#[derive(Debug, Clone)]
pub struct BatchSplitter {
    ceiling: usize,
    log: LogContext,
}

impl BatchSplitter {
    /// Create a splitter; a zero ceiling is treated as one byte
    pub fn new(ceiling: usize, log: LogContext) -> Self {
        Self {
            ceiling: ceiling.max(1),
            log,
        }
    }

    pub fn ceiling(&self) -> usize {
        self.ceiling
    }

    /// Partition `items` into ordered chunks under the byte ceiling
    pub fn split<'a, T: Serialize>(&self, items: &'a [T]) -> Vec<&'a [T]> {
        if items.is_empty() {
            return vec![items];
        }

        let sizes = PrefixSizes::new(items);
        let quantity = self.quantity(&sizes, items.len());
        let runs = partition(items.len(), quantity);

        for run in runs.iter().filter(|run| sizes.array_len((*run).clone()) > self.ceiling) {
            log::warn!(
                target: self.log.target(),
                "item at index {} encodes to {} bytes, above the {} byte ceiling",
                run.start,
                sizes.array_len(run.clone()),
                self.ceiling
            );
        }
        if runs.len() > 1 {
            log::debug!(
                target: self.log.target(),
                "split {} items into {} chunks",
                items.len(),
                runs.len()
            );
        }
        runs.into_iter().map(|run| &items[run]).collect()
    }

    /// Run count at or above the size estimate whose multi-item runs fit
    ///
    /// Gallops past the estimate and then bisects. When the estimate itself
    /// falls short, the result fits and one fewer does not.
    fn quantity(&self, sizes: &PrefixSizes, len: usize) -> usize {
        let mut low = sizes.array_len(0..len).div_ceil(self.ceiling).clamp(1, len);
        if self.fits(sizes, len, low) {
            return low;
        }

        let mut step = 1;
        let mut high = (low + step).min(len);
        while !self.fits(sizes, len, high) {
            low = high;
            step *= 2;
            high = (low + step).min(len);
        }

        while high - low > 1 {
            let mid = low + (high - low) / 2;
            if self.fits(sizes, len, mid) {
                high = mid;
            } else {
                low = mid;
            }
        }
        high
    }

    /// Whether every multi-item run of the partition stays under the ceiling
    ///
    /// One item per run always fits; oversized items go out alone.
    fn fits(&self, sizes: &PrefixSizes, len: usize, quantity: usize) -> bool {
        quantity >= len
            || partition(len, quantity)
                .into_iter()
                .all(|run| run.len() <= 1 || sizes.array_len(run) <= self.ceiling)
    }
}

/// Split `0..len` into `quantity` runs, remainder front-loaded
fn partition(len: usize, quantity: usize) -> Vec<Range<usize>> {
    let base = len / quantity;
    let remainder = len % quantity;
    let mut runs = Vec::with_capacity(quantity);
    let mut start = 0;
    for i in 0..quantity {
        let size = base + usize::from(i < remainder);
        runs.push(start..start + size);
        start += size;
    }
    runs
}

/// Prefix sums of item encodings for O(1) run sizes
struct PrefixSizes {
    prefix: Vec<usize>,
}

impl PrefixSizes {
    fn new<T: Serialize>(items: &[T]) -> Self {
        let mut prefix = Vec::with_capacity(items.len() + 1);
        prefix.push(0);
        let mut total = 0;
        for item in items {
            total += encoded_len(item);
            prefix.push(total);
        }
        Self { prefix }
    }

    /// Encoded size of `[a,b,c]` for the run: brackets, items and separators
    fn array_len(&self, run: Range<usize>) -> usize {
        let items = self.prefix[run.end] - self.prefix[run.start];
        2 + items + run.len().saturating_sub(1)
    }
}

/// JSON size of one item without materialising the bytes
///
/// Items that cannot be encoded count as zero bytes; the publisher rejects them.
pub fn encoded_len<T: Serialize + ?Sized>(item: &T) -> usize {
    let mut counter = ByteCounter(0);
    match serde_json::to_writer(&mut counter, item) {
        Ok(()) => counter.0,
        Err(_) => 0,
    }
}

struct ByteCounter(usize);

impl io::Write for ByteCounter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0 += buf.len();
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn splitter(ceiling: usize) -> BatchSplitter {
        BatchSplitter::new(ceiling, LogContext::new("test").scoped("splitter"))
    }

    fn words(n: usize, len: usize) -> Vec<String> {
        (0..n).map(|_| "a".repeat(len)).collect()
    }

    #[test]
    fn empty_input_yields_one_empty_chunk() {
        let items: Vec<String> = Vec::new();
        let chunks = splitter(100).split(&items);
        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].is_empty());
    }

    #[test]
    fn small_input_is_one_chunk() {
        let items = words(3, 4);
        let chunks = splitter(DEFAULT_BATCH_CEILING).split(&items);
        assert_eq!(chunks, vec![&items[..]]);
    }

    #[test]
    fn remainder_is_front_loaded() {
        // each item encodes to 6 bytes; whole array = 2 + 60 + 9 = 71
        let items = words(10, 4);
        let chunks = splitter(30).split(&items);
        let lens: Vec<usize> = chunks.iter().map(|c| c.len()).collect();
        assert_eq!(lens, vec![4, 3, 3]);
    }

    #[test]
    fn uneven_sizes_grow_quantity() {
        let mut items = words(4, 1);
        items[0] = "b".repeat(40);
        // total = 2 + 42 + 3*3 + 3 = 56 -> ceil(56/50) = 2 -> [big, x] is 2+42+3+1 = 48 fits
        let chunks = splitter(50).split(&items);
        assert_eq!(chunks.concat(), items);
        for chunk in &chunks {
            assert!(PrefixSizes::new(chunk).array_len(0..chunk.len()) <= 50);
        }

        // tighter ceiling forces the big item into its own chunk
        let chunks = splitter(45).split(&items);
        assert_eq!(chunks[0].len(), 1);
        assert_eq!(chunks.concat(), items);
    }

    #[test]
    fn oversized_item_stands_alone() {
        let items = vec!["x".to_string(), "y".repeat(500), "z".to_string()];
        let chunks = splitter(64).split(&items);
        assert!(chunks.iter().any(|c| c.len() == 1 && c[0].len() == 500));
        assert_eq!(chunks.concat(), items);
    }

    #[test]
    fn oversized_item_among_many_small_ones() {
        let mut items = words(5000, 1);
        items[2500] = "y".repeat(200);
        let split = splitter(64);
        let chunks = split.split(&items);

        assert_eq!(chunks.concat(), items);
        for chunk in &chunks {
            let size = PrefixSizes::new(chunk).array_len(0..chunk.len());
            assert!(chunk.len() == 1 || size <= 64, "chunk of {} items, {size} bytes", chunk.len());
        }
        let sizes = PrefixSizes::new(&items);
        assert!(!split.fits(&sizes, items.len(), chunks.len() - 1));
    }

    #[test]
    fn encoded_len_matches_serde_json() {
        let value = serde_json::json!({"time": "2024-01-01T00:00:00Z", "temperature": 21.5});
        assert_eq!(encoded_len(&value), serde_json::to_vec(&value).unwrap().len());
    }

    proptest! {
        #[test]
        fn chunks_concatenate_and_respect_ceiling(
            items in prop::collection::vec("[a-z]{0,40}", 0..200),
            ceiling in 64usize..2048,
        ) {
            let split = splitter(ceiling);
            let chunks = split.split(&items);
            prop_assert!(!chunks.is_empty());
            if chunks.len() > 1 {
                let sizes = PrefixSizes::new(&items);
                prop_assert!(!split.fits(&sizes, items.len(), chunks.len() - 1));
            }
            prop_assert_eq!(chunks.concat(), items.clone());
            for chunk in &chunks {
                let encoded = serde_json::to_vec(chunk).unwrap().len();
                prop_assert!(encoded <= ceiling, "chunk of {} bytes over {}", encoded, ceiling);
            }
        }
    }
}
