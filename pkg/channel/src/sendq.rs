//! Watermarked outbound queue for one session.
//!
//! Each session's socket writer is the sole consumer; any task may enqueue.
//! Above the high-water mark the queue is congested: normal frames are
//! dropped (counted), critical frames — auth responses, pings, scheduler
//! commands — still go through. Congestion clears when the writer drains
//! the queue below the low-water mark.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use tokio::sync::mpsc;

use pkg_constants::channel::{
    SEND_QUEUE_HIGH_WATER_BYTES, SEND_QUEUE_HIGH_WATER_MSGS, SEND_QUEUE_LOW_WATER_MSGS,
};
use pkg_types::error::Error;

/// Criticality of an outbound frame under congestion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameClass {
    /// Dropped when the session is congested.
    Normal,
    /// Always queued: auth responses, pings, scheduler commands.
    Critical,
}

/// Outcome of an enqueue attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueued {
    Queued,
    /// The session was congested and the frame was not critical.
    DroppedCongested,
}

struct Shared {
    msgs: AtomicUsize,
    bytes: AtomicUsize,
    congested: AtomicBool,
    dropped: AtomicU64,
}

#[derive(Clone)]
pub struct SendQueue {
    tx: mpsc::UnboundedSender<String>,
    shared: Arc<Shared>,
}

pub struct SendQueueRx {
    rx: mpsc::UnboundedReceiver<String>,
    shared: Arc<Shared>,
}

pub fn send_queue() -> (SendQueue, SendQueueRx) {
    let (tx, rx) = mpsc::unbounded_channel();
    let shared = Arc::new(Shared {
        msgs: AtomicUsize::new(0),
        bytes: AtomicUsize::new(0),
        congested: AtomicBool::new(false),
        dropped: AtomicU64::new(0),
    });
    (
        SendQueue {
            tx,
            shared: shared.clone(),
        },
        SendQueueRx { rx, shared },
    )
}

impl SendQueue {
    pub fn enqueue(&self, frame: String, class: FrameClass) -> Result<Enqueued, Error> {
        if self.shared.congested.load(Ordering::Acquire) && class == FrameClass::Normal {
            self.shared.dropped.fetch_add(1, Ordering::Relaxed);
            return Ok(Enqueued::DroppedCongested);
        }
        let len = frame.len();
        self.tx
            .send(frame)
            .map_err(|_| Error::NotConnected("send queue closed".into()))?;
        let msgs = self.shared.msgs.fetch_add(1, Ordering::AcqRel) + 1;
        let bytes = self.shared.bytes.fetch_add(len, Ordering::AcqRel) + len;
        if msgs > SEND_QUEUE_HIGH_WATER_MSGS || bytes > SEND_QUEUE_HIGH_WATER_BYTES {
            self.shared.congested.store(true, Ordering::Release);
        }
        Ok(Enqueued::Queued)
    }

    pub fn is_congested(&self) -> bool {
        self.shared.congested.load(Ordering::Acquire)
    }

    /// Frames dropped so far because of congestion.
    pub fn dropped(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }

    pub fn queued_msgs(&self) -> usize {
        self.shared.msgs.load(Ordering::Acquire)
    }
}

impl SendQueueRx {
    /// Next frame to write, or `None` once every sender is gone.
    pub async fn recv(&mut self) -> Option<String> {
        let frame = self.rx.recv().await?;
        let msgs = self.shared.msgs.fetch_sub(1, Ordering::AcqRel) - 1;
        self.shared.bytes.fetch_sub(frame.len(), Ordering::AcqRel);
        if msgs < SEND_QUEUE_LOW_WATER_MSGS {
            self.shared.congested.store(false, Ordering::Release);
        }
        Some(frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn queue_passes_frames_in_order() {
        let (q, mut rx) = send_queue();
        q.enqueue("a".into(), FrameClass::Normal).unwrap();
        q.enqueue("b".into(), FrameClass::Critical).unwrap();
        assert_eq!(rx.recv().await.as_deref(), Some("a"));
        assert_eq!(rx.recv().await.as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn congestion_drops_normal_keeps_critical() {
        let (q, mut rx) = send_queue();
        for i in 0..=SEND_QUEUE_HIGH_WATER_MSGS {
            q.enqueue(format!("frame-{i}"), FrameClass::Normal).unwrap();
        }
        assert!(q.is_congested());

        assert_eq!(
            q.enqueue("dropped".into(), FrameClass::Normal).unwrap(),
            Enqueued::DroppedCongested
        );
        assert_eq!(q.dropped(), 1);
        assert_eq!(
            q.enqueue("ping".into(), FrameClass::Critical).unwrap(),
            Enqueued::Queued
        );

        // Drain below the low-water mark; congestion clears.
        while q.queued_msgs() >= SEND_QUEUE_LOW_WATER_MSGS {
            rx.recv().await.unwrap();
        }
        assert!(!q.is_congested());
        assert_eq!(
            q.enqueue("again".into(), FrameClass::Normal).unwrap(),
            Enqueued::Queued
        );
    }

    #[tokio::test]
    async fn byte_watermark_triggers_congestion() {
        let (q, _rx) = send_queue();
        let big = "x".repeat(SEND_QUEUE_HIGH_WATER_BYTES + 1);
        q.enqueue(big, FrameClass::Normal).unwrap();
        assert!(q.is_congested());
    }

    #[tokio::test]
    async fn closed_queue_reports_not_connected() {
        let (q, rx) = send_queue();
        drop(rx);
        assert!(matches!(
            q.enqueue("x".into(), FrameClass::Normal),
            Err(Error::NotConnected(_))
        ));
    }
}
