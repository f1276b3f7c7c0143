//! Metrics descriptions and helpers
//!
//! Counters and histograms are emitted through the `metrics` facade. No
//! recorder is installed here; embedders pick their own exporter.

use metrics::{describe_counter, describe_histogram, histogram};
use std::time::Instant;

/// Register descriptions for every metric the crate emits
pub fn init_metrics() {
    // Store metrics
    describe_counter!("store.operations.read", "Document and stream reads");
    describe_counter!("store.operations.write", "Document and stream writes");
    describe_counter!("store.operations.delete", "Bucket removals");
    describe_counter!("store.operations.rotate", "Completed key rotations");
    describe_counter!("store.read.fallback", "Tolerant reads that returned an empty document");
    describe_counter!("store.files.orphaned", "Data files that could not be deleted");
    describe_counter!("store.bytes.written", "Envelope bytes written to data files");
    describe_histogram!("store.operation.duration_ms", "Store operation duration in milliseconds");

    // Broadcast metrics
    describe_counter!("broadcast.requests", "Broadcast requests received");
    describe_counter!("broadcast.rejected", "Broadcasts rejected by a size or count limit");
    describe_counter!("broadcast.recipient.errors", "Recipients that produced an error entry");
    describe_counter!("broadcast.recipient.timeouts", "Recipients that exceeded their deadline");
    describe_histogram!("broadcast.recipients", "Recipients per broadcast");
    describe_histogram!("broadcast.duration_ms", "Broadcast duration in milliseconds");
}

/// Timer for measuring operation duration
pub struct Timer {
    name: &'static str,
    start: Instant,
}

impl Timer {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            start: Instant::now(),
        }
    }

    /// Stop the timer and record the duration in milliseconds
    pub fn stop(self) {
        let elapsed = self.start.elapsed();
        histogram!(self.name).record(elapsed.as_secs_f64() * 1000.0);
    }
}
