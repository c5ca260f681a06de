use std::sync::atomic::{AtomicU64, Ordering};

use buffer_protocol::Nanos;
use crossbeam_queue::ArrayQueue;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterSample {
    pub at: Nanos,
    pub value: u64,
}

/// Bounded history of counter changes for an external tracer. When full the
/// oldest sample is evicted and the newest kept.
#[derive(Debug)]
pub struct CounterTrace {
    samples: ArrayQueue<CounterSample>,
    dropped: AtomicU64,
    pushed: AtomicU64,
}

impl CounterTrace {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "counter trace capacity must be greater than zero");
        Self {
            samples: ArrayQueue::new(capacity),
            dropped: AtomicU64::new(0),
            pushed: AtomicU64::new(0),
        }
    }

    fn record(&self, sample: CounterSample) {
        let mut pending_sample = sample;
        loop {
            match self.samples.push(pending_sample) {
                Ok(()) => {
                    self.pushed.fetch_add(1, Ordering::Relaxed);
                    return;
                }
                Err(returned_sample) => {
                    pending_sample = returned_sample;
                    if self.samples.pop().is_some() {
                        self.dropped.fetch_add(1, Ordering::Relaxed);
                    } else {
                        std::thread::yield_now();
                    }
                }
            }
        }
    }

    /// Appends every buffered sample to `output`, oldest first. `output` is
    /// not cleared.
    pub fn drain_into(&self, output: &mut Vec<CounterSample>) -> usize {
        let mut drained = 0;
        while let Some(sample) = self.samples.pop() {
            output.push(sample);
            drained += 1;
        }
        drained
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn dropped_samples(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn pushed_samples(&self) -> u64 {
        self.pushed.load(Ordering::Relaxed)
    }
}

/// Number of submitted buffers not yet latched or dropped. Diagnostic only.
#[derive(Debug)]
pub struct PendingBufferCounter {
    name: String,
    value: AtomicU64,
    trace: CounterTrace,
}

impl PendingBufferCounter {
    pub fn new(surface_name: &str, trace_capacity: usize) -> Self {
        Self {
            name: format!("BufferTX - {surface_name}"),
            value: AtomicU64::new(0),
            trace: CounterTrace::new(trace_capacity),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn value(&self) -> u64 {
        self.value.load(Ordering::Acquire)
    }

    pub fn trace(&self) -> &CounterTrace {
        &self.trace
    }

    pub fn increment(&self, at: Nanos) -> u64 {
        let value = self.value.fetch_add(1, Ordering::AcqRel) + 1;
        self.trace.record(CounterSample { at, value });
        value
    }

    /// Returns the new value, or `None` when the counter was already zero.
    pub fn decrement(&self, at: Nanos) -> Option<u64> {
        match self
            .value
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |value| {
                value.checked_sub(1)
            }) {
            Ok(previous) => {
                let value = previous - 1;
                self.trace.record(CounterSample { at, value });
                Some(value)
            }
            Err(_) => {
                tracing::error!(counter = %self.name, "pending buffer counter underflow");
                None
            }
        }
    }
}
