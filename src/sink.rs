//! Chunked hand-off from a blocking parser to its consumer.

use crate::models::{ParseSummary, RecordBatch};

/// Buffers records and emits them as [`RecordBatch`]es of `chunk_size`.
///
/// `emit` returns `false` once the consumer is gone; the sink then reports
/// `stopped` and every later push returns `false`.
pub struct ChunkSink<'a, T> {
    buffer: Vec<T>,
    chunk_size: usize,
    wrap: fn(Vec<T>) -> RecordBatch,
    emit: &'a mut dyn FnMut(RecordBatch) -> bool,
    pub summary: ParseSummary,
}

impl<'a, T> ChunkSink<'a, T> {
    pub fn new(
        chunk_size: usize,
        wrap: fn(Vec<T>) -> RecordBatch,
        emit: &'a mut dyn FnMut(RecordBatch) -> bool,
    ) -> Self {
        Self {
            buffer: Vec::new(),
            chunk_size: chunk_size.max(1),
            wrap,
            emit,
            summary: ParseSummary::default(),
        }
    }

    pub fn push(&mut self, record: T) -> bool {
        self.extend(vec![record])
    }

    pub fn extend(&mut self, records: Vec<T>) -> bool {
        if self.summary.stopped {
            return false;
        }
        self.summary.records += records.len() as u64;
        self.buffer.extend(records);
        if self.buffer.len() >= self.chunk_size {
            return self.flush();
        }
        true
    }

    pub fn skip(&mut self) {
        self.summary.skipped += 1;
    }

    fn flush(&mut self) -> bool {
        if self.buffer.is_empty() {
            return true;
        }
        let chunk = std::mem::take(&mut self.buffer);
        if !(self.emit)((self.wrap)(chunk)) {
            self.summary.stopped = true;
            return false;
        }
        true
    }

    /// Emit whatever is buffered and return the summary.
    pub fn finish(mut self) -> ParseSummary {
        if !self.summary.stopped {
            self.flush();
        }
        self.summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emits_full_chunks_then_remainder() {
        let mut sizes = Vec::new();
        let mut emit = |b: RecordBatch| {
            sizes.push(b.len());
            true
        };
        let mut sink = ChunkSink::new(2, RecordBatch::Companies, &mut emit);
        for _ in 0..5 {
            assert!(sink.push(Default::default()));
        }
        let summary = sink.finish();
        assert_eq!(summary.records, 5);
        assert!(!summary.stopped);
        assert_eq!(sizes, vec![2, 2, 1]);
    }

    #[test]
    fn stops_when_consumer_is_gone() {
        let mut emit = |_: RecordBatch| false;
        let mut sink = ChunkSink::new(1, RecordBatch::Companies, &mut emit);
        assert!(!sink.push(Default::default()));
        assert!(!sink.push(Default::default()));
        let summary = sink.finish();
        assert!(summary.stopped);
        assert_eq!(summary.records, 1);
    }
}
