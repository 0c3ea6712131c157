use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};

/// A connector's dedicated pair of bounded queues: raw items flow
/// out towards consumers, processed items flow back in.
///
/// The port owns both ends of both channels, so queue operations can
/// never observe a disconnect while the port is alive. Exactly one
/// connector owns a port; consumers hold weak handles through the
/// broker's registry.
pub struct BufferPort<T> {
    raw_tx: Sender<T>,
    raw_rx: Receiver<T>,
    processed_tx: Sender<T>,
    processed_rx: Receiver<T>,
}

impl<T> BufferPort<T> {
    /// Create a port whose queues each hold up to `capacity` items.
    pub fn new(capacity: usize) -> Self {
        let (raw_tx, raw_rx) = bounded(capacity);
        let (processed_tx, processed_rx) = bounded(capacity);
        BufferPort {
            raw_tx,
            raw_rx,
            processed_tx,
            processed_rx,
        }
    }

    /// Enqueue an item for processing. Returns immediately unless the
    /// raw queue is at capacity, in which case the call blocks until
    /// a consumer makes room.
    pub fn push_raw(&self, item: T) {
        self.raw_tx
            .send(item)
            .expect("buffer port owns both channel ends");
    }

    /// Consumer side: take the next raw item, waiting at most
    /// `timeout`.
    pub fn pop_raw_timed(&self, timeout: Duration) -> Option<T> {
        match self.raw_rx.recv_timeout(timeout) {
            Ok(item) => Some(item),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => {
                unreachable!("buffer port owns both channel ends")
            }
        }
    }

    /// Consumer side: hand back a processed item. Blocks only when
    /// the processed queue is at capacity.
    pub fn push_processed(&self, item: T) {
        self.processed_tx
            .send(item)
            .expect("buffer port owns both channel ends");
    }

    /// Take the next processed item, waiting indefinitely.
    pub fn pop_processed_blocking(&self) -> T {
        self.processed_rx
            .recv()
            .expect("buffer port owns both channel ends")
    }

    /// Take the next processed item, waiting at most `timeout`.
    /// Returns `None` on timeout.
    pub fn pop_processed_timed(&self, timeout: Duration) -> Option<T> {
        match self.processed_rx.recv_timeout(timeout) {
            Ok(item) => Some(item),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => {
                unreachable!("buffer port owns both channel ends")
            }
        }
    }
}
