// SPDX-License-Identifier: GPL-3.0-only

//! Bounded frame queue between a provider and the capture worker
//!
//! The provider side ([`FrameProducer`]) submits images as they arrive and a
//! listener posts a frame-available message to the worker. At most one such
//! notification is outstanding: submissions made before the worker acquires
//! do not notify again. The worker side
//! ([`FrameReader`]) acquires only the newest queued image; everything older
//! is dropped. An acquired image is held by an [`AcquiredImage`] guard and
//! handed back when the guard goes out of scope, including during unwinding.

use super::types::{FrameFormat, PreviewSize, RawImage};
use std::collections::VecDeque;
use std::ops::Deref;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, trace};

/// Called when a submission finds no notification outstanding
pub type FrameListener = Arc<dyn Fn() + Send + Sync>;

#[derive(Default)]
struct QueueState {
    queue: VecDeque<RawImage>,
    acquired: usize,
    closed: bool,
    notify_pending: bool,
    submitted: u64,
    dropped: u64,
    released: u64,
}

struct ReaderShared {
    size: PreviewSize,
    format: FrameFormat,
    max_images: usize,
    state: Mutex<QueueState>,
    listener: FrameListener,
}

impl ReaderShared {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Queue counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReaderStats {
    /// Images accepted from the provider
    pub submitted: u64,
    /// Images discarded without being acquired
    pub dropped: u64,
    /// Acquired images handed back
    pub released: u64,
    /// Images waiting in the queue
    pub pending: usize,
    /// Images currently held by the worker
    pub acquired: usize,
}

/// Worker side of the queue
pub struct FrameReader {
    shared: Arc<ReaderShared>,
}

impl FrameReader {
    /// Create a reader for one session
    ///
    /// `max_images` counts queued and acquired images together and is
    /// clamped to at least one.
    pub fn new(
        size: PreviewSize,
        format: FrameFormat,
        max_images: usize,
        listener: FrameListener,
    ) -> Self {
        debug!(size = %size, format = %format, max_images, "Creating frame reader");
        Self {
            shared: Arc::new(ReaderShared {
                size,
                format,
                max_images: max_images.max(1),
                state: Mutex::new(QueueState::default()),
                listener,
            }),
        }
    }

    /// Provider handle feeding this reader
    pub fn producer(&self) -> FrameProducer {
        FrameProducer {
            shared: Arc::clone(&self.shared),
        }
    }

    pub fn size(&self) -> PreviewSize {
        self.shared.size
    }

    pub fn format(&self) -> FrameFormat {
        self.shared.format
    }

    /// Take the newest queued image, dropping any older ones
    ///
    /// Returns `None` when the queue is empty or the reader is closed. Either
    /// way the next submission notifies the listener again.
    pub fn acquire_latest(&self) -> Option<AcquiredImage<'_>> {
        let mut state = self.shared.lock();
        state.notify_pending = false;
        if state.closed {
            return None;
        }
        let latest = state.queue.pop_back()?;
        let stale = state.queue.len() as u64;
        if stale > 0 {
            trace!(stale, "Dropping stale frames");
            state.dropped += stale;
            state.queue.clear();
        }
        state.acquired += 1;
        Some(AcquiredImage {
            image: latest,
            shared: &self.shared,
        })
    }

    /// Stop accepting images and discard the queue
    pub fn close(&self) {
        let mut state = self.shared.lock();
        if state.closed {
            return;
        }
        state.closed = true;
        state.dropped += state.queue.len() as u64;
        state.queue.clear();
        debug!(
            submitted = state.submitted,
            dropped = state.dropped,
            "Frame reader closed"
        );
    }

    pub fn is_closed(&self) -> bool {
        self.shared.lock().closed
    }

    pub fn stats(&self) -> ReaderStats {
        stats_of(&self.shared.lock())
    }
}

impl Drop for FrameReader {
    fn drop(&mut self) {
        self.close();
    }
}

/// Provider side of the queue
#[derive(Clone)]
pub struct FrameProducer {
    shared: Arc<ReaderShared>,
}

impl FrameProducer {
    pub fn size(&self) -> PreviewSize {
        self.shared.size
    }

    pub fn format(&self) -> FrameFormat {
        self.shared.format
    }

    pub fn is_closed(&self) -> bool {
        self.shared.lock().closed
    }

    /// Queue an image for the worker
    ///
    /// When the queue is full the oldest queued image makes room. If every
    /// slot is held by the worker the new image is dropped. Returns false
    /// once the reader is closed.
    pub fn submit(&self, image: RawImage) -> bool {
        let notify = {
            let mut state = self.shared.lock();
            if state.closed {
                return false;
            }
            while state.queue.len() + state.acquired >= self.shared.max_images
                && state.queue.pop_front().is_some()
            {
                state.dropped += 1;
            }
            if state.queue.len() + state.acquired >= self.shared.max_images {
                state.dropped += 1;
                return true;
            }
            state.queue.push_back(image);
            state.submitted += 1;
            !std::mem::replace(&mut state.notify_pending, true)
        };
        if notify {
            (self.shared.listener)();
        }
        true
    }

    pub fn stats(&self) -> ReaderStats {
        stats_of(&self.shared.lock())
    }
}

fn stats_of(state: &QueueState) -> ReaderStats {
    ReaderStats {
        submitted: state.submitted,
        dropped: state.dropped,
        released: state.released,
        pending: state.queue.len(),
        acquired: state.acquired,
    }
}

/// An image on loan from the reader
///
/// The slot is handed back on drop.
pub struct AcquiredImage<'r> {
    image: RawImage,
    shared: &'r ReaderShared,
}

impl Deref for AcquiredImage<'_> {
    type Target = RawImage;

    fn deref(&self) -> &RawImage {
        &self.image
    }
}

impl Drop for AcquiredImage<'_> {
    fn drop(&mut self) {
        let mut state = self.shared.lock();
        state.acquired = state.acquired.saturating_sub(1);
        state.released += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::camera::types::Plane;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;

    fn image(sequence: u64) -> RawImage {
        RawImage {
            width: 2,
            height: 2,
            format: FrameFormat::Nv21,
            planes: vec![Plane {
                data: vec![0; 6],
                row_stride: 2,
                pixel_stride: 1,
            }],
            sequence,
            captured_at: Instant::now(),
        }
    }

    fn reader(max_images: usize) -> (FrameReader, Arc<AtomicUsize>) {
        let notified = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&notified);
        let reader = FrameReader::new(
            PreviewSize::new(2, 2),
            FrameFormat::Nv21,
            max_images,
            Arc::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );
        (reader, notified)
    }

    #[test]
    fn test_acquire_latest_drops_older() {
        let (reader, notified) = reader(2);
        let producer = reader.producer();

        for seq in 0..5 {
            assert!(producer.submit(image(seq)));
        }
        assert_eq!(notified.load(Ordering::SeqCst), 1);

        let latest = reader.acquire_latest().unwrap();
        assert_eq!(latest.sequence, 4);
        drop(latest);

        assert!(reader.acquire_latest().is_none());
        let stats = reader.stats();
        assert_eq!(stats.submitted, 5);
        assert_eq!(stats.dropped, 4);
        assert_eq!(stats.released, 1);
    }

    #[test]
    fn test_one_notification_outstanding_until_acquire() {
        let (reader, notified) = reader(2);
        let producer = reader.producer();

        producer.submit(image(0));
        producer.submit(image(1));
        assert_eq!(notified.load(Ordering::SeqCst), 1);

        let held = reader.acquire_latest().unwrap();
        producer.submit(image(2));
        producer.submit(image(3));
        assert_eq!(notified.load(Ordering::SeqCst), 2);
        drop(held);

        // An empty acquire also rearms the listener
        let _ = reader.acquire_latest();
        assert!(reader.acquire_latest().is_none());
        producer.submit(image(4));
        assert_eq!(notified.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_acquired_slot_counts_against_capacity() {
        let (reader, _) = reader(2);
        let producer = reader.producer();

        producer.submit(image(0));
        let held = reader.acquire_latest().unwrap();

        producer.submit(image(1));
        producer.submit(image(2));
        assert_eq!(reader.stats().pending, 1);
        assert_eq!(reader.stats().acquired, 1);
        drop(held);

        assert_eq!(reader.acquire_latest().unwrap().sequence, 2);
    }

    #[test]
    fn test_full_of_acquired_images_drops_new() {
        let (reader, notified) = reader(1);
        let producer = reader.producer();

        producer.submit(image(0));
        let _held = reader.acquire_latest().unwrap();
        assert!(producer.submit(image(1)));

        assert_eq!(notified.load(Ordering::SeqCst), 1);
        assert_eq!(reader.stats().dropped, 1);
    }

    #[test]
    fn test_release_on_panic() {
        let (reader, _) = reader(2);
        reader.producer().submit(image(7));

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _image = reader.acquire_latest().unwrap();
            panic!("consumer failure");
        }));

        assert!(result.is_err());
        assert_eq!(reader.stats().acquired, 0);
        assert_eq!(reader.stats().released, 1);
    }

    #[test]
    fn test_closed_reader_rejects_submissions() {
        let (reader, notified) = reader(2);
        let producer = reader.producer();
        producer.submit(image(0));

        reader.close();
        assert!(reader.acquire_latest().is_none());
        assert!(!producer.submit(image(1)));
        assert!(producer.is_closed());
        assert_eq!(notified.load(Ordering::SeqCst), 1);
    }
}
