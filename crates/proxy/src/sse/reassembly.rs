//! Ordered reassembly of stream chunks.
//!
//! The bus delivers chunks of one correlation in publish order, but the
//! receive side may process them concurrently and redeliver after
//! failures. This buffer restores the publisher's dense `0..N` run:
//! duplicates are dropped, early arrivals wait in a min-heap bounded by
//! the out-of-order window, and everything is emitted in strict
//! sequence order.

use std::cmp::Reverse;
use std::collections::BinaryHeap;

use super::StreamChunk;

/// Result of offering one chunk to the buffer.
#[derive(Debug, PartialEq)]
pub enum Push {
    /// Zero or more chunks became emittable, in sequence order.
    Ready(Vec<StreamChunk>),
    /// The chunk (or its sequence) was already seen.
    Duplicate,
    /// The chunk arrived early and is parked in the heap.
    Buffered,
    /// The out-of-order window is full; the stream is broken.
    WindowExceeded,
}

/// Heap entry ordered by sequence.
struct Parked(StreamChunk);

impl PartialEq for Parked {
    fn eq(&self, other: &Self) -> bool {
        self.0.sequence == other.0.sequence
    }
}
impl Eq for Parked {}
impl PartialOrd for Parked {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for Parked {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.sequence.cmp(&other.0.sequence)
    }
}

/// Per-correlation reassembly state.
pub struct ReassemblyBuffer {
    next_expected: u64,
    heap: BinaryHeap<Reverse<Parked>>,
    window: usize,
}

impl ReassemblyBuffer {
    pub fn new(window: usize) -> Self {
        Self {
            next_expected: 0,
            heap: BinaryHeap::new(),
            window,
        }
    }

    pub fn next_expected(&self) -> u64 {
        self.next_expected
    }

    /// Number of chunks parked out of order.
    pub fn parked(&self) -> usize {
        self.heap.len()
    }

    /// Offer one chunk.
    pub fn push(&mut self, chunk: StreamChunk) -> Push {
        if chunk.sequence < self.next_expected {
            return Push::Duplicate;
        }

        if chunk.sequence == self.next_expected {
            let mut ready = vec![chunk];
            self.next_expected += 1;
            // Drain every parked chunk that is now in order; equal
            // sequences in the heap are redelivered duplicates.
            while let Some(Reverse(parked)) = self.heap.peek() {
                if parked.0.sequence < self.next_expected {
                    self.heap.pop();
                } else if parked.0.sequence == self.next_expected {
                    if let Some(Reverse(next)) = self.heap.pop() {
                        ready.push(next.0);
                        self.next_expected += 1;
                    }
                } else {
                    break;
                }
            }
            return Push::Ready(ready);
        }

        if self
            .heap
            .iter()
            .any(|Reverse(parked)| parked.0.sequence == chunk.sequence)
        {
            return Push::Duplicate;
        }
        if self.heap.len() >= self.window {
            return Push::WindowExceeded;
        }
        self.heap.push(Reverse(Parked(chunk)));
        Push::Buffered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_bus::{ChunkPayload, ChunkType, StreamMetadata};
    use proptest::prelude::*;

    fn chunk(sequence: u64) -> StreamChunk {
        StreamChunk {
            sequence,
            payload: ChunkPayload {
                data: Some(format!("d{sequence}")),
                ..Default::default()
            },
            metadata: StreamMetadata {
                stream_id: "s".to_string(),
                chunk_type: ChunkType::Data,
                event_name: None,
                retry: None,
                last_event_id: None,
                is_final: false,
            },
        }
    }

    fn sequences(push: Push) -> Vec<u64> {
        match push {
            Push::Ready(chunks) => chunks.iter().map(|c| c.sequence).collect(),
            _ => panic!("expected Ready, got {push:?}"),
        }
    }

    #[test]
    fn test_in_order_passthrough() {
        let mut buffer = ReassemblyBuffer::new(8);
        assert_eq!(sequences(buffer.push(chunk(0))), vec![0]);
        assert_eq!(sequences(buffer.push(chunk(1))), vec![1]);
        assert_eq!(buffer.next_expected(), 2);
        assert_eq!(buffer.parked(), 0);
    }

    #[test]
    fn test_out_of_order_buffers_then_drains() {
        let mut buffer = ReassemblyBuffer::new(8);
        assert_eq!(buffer.push(chunk(2)), Push::Buffered);
        assert_eq!(buffer.push(chunk(1)), Push::Buffered);
        assert_eq!(sequences(buffer.push(chunk(0))), vec![0, 1, 2]);
    }

    #[test]
    fn test_duplicate_of_emitted_chunk_dropped() {
        let mut buffer = ReassemblyBuffer::new(8);
        let _ = buffer.push(chunk(0));
        let _ = buffer.push(chunk(1));
        assert_eq!(buffer.push(chunk(1)), Push::Duplicate);
        assert_eq!(buffer.push(chunk(0)), Push::Duplicate);
    }

    #[test]
    fn test_duplicate_of_parked_chunk_dropped() {
        let mut buffer = ReassemblyBuffer::new(8);
        assert_eq!(buffer.push(chunk(3)), Push::Buffered);
        assert_eq!(buffer.push(chunk(3)), Push::Duplicate);
        assert_eq!(buffer.parked(), 1);
    }

    #[test]
    fn test_window_exceeded() {
        let mut buffer = ReassemblyBuffer::new(2);
        assert_eq!(buffer.push(chunk(5)), Push::Buffered);
        assert_eq!(buffer.push(chunk(6)), Push::Buffered);
        assert_eq!(buffer.push(chunk(7)), Push::WindowExceeded);
    }

    #[test]
    fn test_duplicate_in_heap_skipped_on_drain() {
        let mut buffer = ReassemblyBuffer::new(8);
        assert_eq!(buffer.push(chunk(1)), Push::Buffered);
        // A second copy is rejected before it reaches the heap, so the
        // drain emits sequence 1 exactly once.
        assert_eq!(buffer.push(chunk(1)), Push::Duplicate);
        assert_eq!(sequences(buffer.push(chunk(0))), vec![0, 1]);
    }

    proptest! {
        /// Any arrival permutation (with injected duplicates) inside the
        /// window yields the dense run 0..n exactly once, in order.
        #[test]
        fn prop_reassembly_restores_dense_order(
            order in (2usize..24).prop_flat_map(|n| {
                Just((0..n as u64).collect::<Vec<u64>>()).prop_shuffle()
            }),
            dup_index in any::<prop::sample::Index>(),
        ) {
            let n = order.len();
            let mut arrivals = order.clone();
            // Inject a duplicate of an arbitrary sequence at the end.
            arrivals.push(order[dup_index.index(n)]);

            let mut buffer = ReassemblyBuffer::new(n);
            let mut emitted = Vec::new();
            for sequence in arrivals {
                match buffer.push(chunk(sequence)) {
                    Push::Ready(chunks) => {
                        emitted.extend(chunks.into_iter().map(|c| c.sequence))
                    }
                    Push::Buffered | Push::Duplicate => {}
                    Push::WindowExceeded => prop_assert!(false, "window must fit n"),
                }
            }
            let expected: Vec<u64> = (0..n as u64).collect();
            prop_assert_eq!(emitted, expected);
        }
    }
}
