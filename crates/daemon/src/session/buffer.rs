//! Bounded, sequence-numbered output and media history.
//!
//! Each session keeps two independent rings: decoded text output and
//! structured media events. Every appended entry gets the next sequence
//! number of its ring, starting at 1. When a ring is full the oldest entry
//! is evicted; sequence numbers are never reused, so a client polling with
//! `since` can detect that it fell behind by comparing against the first
//! returned seq.

use std::collections::VecDeque;

use protocol::{MediaEntry, MediaEvent, OutputEntry};

/// A FIFO ring that stamps each item with a monotonic sequence number.
#[derive(Debug)]
pub struct SequencedRing<T> {
    entries: VecDeque<(u64, T)>,
    capacity: usize,
    last_seq: u64,
}

impl<T: Clone> SequencedRing<T> {
    /// Creates an empty ring holding at most `capacity` items (minimum 1).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
            last_seq: 0,
        }
    }

    /// Appends `item`, evicting the oldest entry if full. Returns its seq.
    pub fn push(&mut self, item: T) -> u64 {
        self.last_seq += 1;
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back((self.last_seq, item));
        self.last_seq
    }

    /// Returns every retained entry with a seq strictly greater than `since`,
    /// in ascending order.
    pub fn since(&self, since: u64) -> Vec<(u64, T)> {
        let Some(&(first_seq, _)) = self.entries.front() else {
            return Vec::new();
        };

        // Retained seqs are contiguous, so the start index is arithmetic.
        let skip = since.saturating_sub(first_seq - 1);
        if skip >= self.entries.len() as u64 {
            return Vec::new();
        }

        self.entries.iter().skip(skip as usize).cloned().collect()
    }

    /// Seq of the most recent entry ever appended (0 if none).
    pub fn last_seq(&self) -> u64 {
        self.last_seq
    }

    /// Seq of the oldest retained entry.
    pub fn first_seq(&self) -> Option<u64> {
        self.entries.front().map(|(seq, _)| *seq)
    }

    /// Number of retained entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if nothing is retained.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Maximum number of retained entries.
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// The output and media history of one session.
#[derive(Debug)]
pub struct OutputBuffer {
    output: SequencedRing<String>,
    media: SequencedRing<MediaEvent>,
}

impl OutputBuffer {
    /// Creates empty rings with the given capacities.
    pub fn new(output_capacity: usize, media_capacity: usize) -> Self {
        Self {
            output: SequencedRing::new(output_capacity),
            media: SequencedRing::new(media_capacity),
        }
    }

    /// Appends a chunk of decoded text.
    pub fn append_output(&mut self, text: String) -> OutputEntry {
        let seq = self.output.push(text.clone());
        OutputEntry { seq, text }
    }

    /// Appends a media event.
    pub fn append_media(&mut self, event: MediaEvent) -> MediaEntry {
        let seq = self.media.push(event.clone());
        MediaEntry { seq, event }
    }

    /// Output entries with seq greater than `since`.
    pub fn output_since(&self, since: u64) -> Vec<OutputEntry> {
        self.output
            .since(since)
            .into_iter()
            .map(|(seq, text)| OutputEntry { seq, text })
            .collect()
    }

    /// Media entries with seq greater than `since`.
    pub fn media_since(&self, since: u64) -> Vec<MediaEntry> {
        self.media
            .since(since)
            .into_iter()
            .map(|(seq, event)| MediaEntry { seq, event })
            .collect()
    }

    /// Seq of the latest output entry.
    pub fn latest_output_seq(&self) -> u64 {
        self.output.last_seq()
    }

    /// Seq of the latest media entry.
    pub fn latest_media_seq(&self) -> u64 {
        self.media.last_seq()
    }

    /// Number of retained output entries.
    pub fn output_len(&self) -> usize {
        self.output.len()
    }

    /// Number of retained media entries.
    pub fn media_len(&self) -> usize {
        self.media.len()
    }
}
