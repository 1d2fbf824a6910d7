//! Lock-free SPSC ring buffer for audio samples.
//!
//! Uses the `ringbuf` crate to pass f32 samples from the cpal callback
//! thread to the capture thread without locks. Capacity bounds how much
//! audio can sit between the two threads; overflow discards the oldest
//! samples.

use ringbuf::{
    traits::{Consumer, Observer, Producer, Split},
    HeapRb,
};

/// Default capacity: ~2 seconds of 16 kHz mono audio. Sized for scheduling
/// jitter, not for history — stale audio must not survive a handoff.
const DEFAULT_CAPACITY: usize = 32_000;

/// Producer half — lives in the cpal audio callback.
pub struct SampleProducer {
    inner: ringbuf::HeapProd<f32>,
}

/// Consumer half — lives in the capture thread.
pub struct SampleConsumer {
    inner: ringbuf::HeapCons<f32>,
}

/// Create a matched producer/consumer pair backed by a lock-free ring buffer.
pub fn sample_ring_buffer(capacity: Option<usize>) -> (SampleProducer, SampleConsumer) {
    let cap = capacity.unwrap_or(DEFAULT_CAPACITY);
    let rb = HeapRb::<f32>::new(cap);
    let (prod, cons) = rb.split();
    (
        SampleProducer { inner: prod },
        SampleConsumer { inner: cons },
    )
}

impl SampleProducer {
    /// Push a slice of samples. Returns how many were actually written
    /// (less than `samples.len()` when the buffer is full).
    pub fn push_slice(&mut self, samples: &[f32]) -> usize {
        self.inner.push_slice(samples)
    }
}

// Safety: the producer is only ever used from one thread at a time — it
// moves into the cpal callback, which runs on a single dedicated audio
// thread.
unsafe impl Send for SampleProducer {}

impl SampleConsumer {
    /// Pop up to `buf.len()` samples into `buf`. Returns how many were read.
    pub fn pop_slice(&mut self, buf: &mut [f32]) -> usize {
        self.inner.pop_slice(buf)
    }

    /// Number of samples currently available for reading.
    pub fn available(&self) -> usize {
        self.inner.occupied_len()
    }
}

// Safety: the consumer stays on the capture thread that opened the stream.
unsafe impl Send for SampleConsumer {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_then_pop_round_trips() {
        let (mut prod, mut cons) = sample_ring_buffer(Some(8));
        assert_eq!(prod.push_slice(&[0.1, 0.2, 0.3]), 3);
        assert_eq!(cons.available(), 3);

        let mut buf = [0.0f32; 3];
        assert_eq!(cons.pop_slice(&mut buf), 3);
        assert_eq!(buf, [0.1, 0.2, 0.3]);
        assert_eq!(cons.available(), 0);
    }

    #[test]
    fn full_buffer_reports_short_write() {
        let (mut prod, _cons) = sample_ring_buffer(Some(4));
        assert_eq!(prod.push_slice(&[1.0; 6]), 4);
    }
}
