//! The scheduler: the external "timed callback" collaborator. Spec.md names
//! this as out of scope for the connection engine's own logic: the engine
//! only ever asks "call me back about `kind` for `conn` after `delay`" or
//! "never mind that", but a concrete implementation is needed for the
//! crate to run standalone, so [`TokioScheduler`] provides one over
//! `tokio::time::sleep`.

use crate::address::ConnectionKey;
use async_trait::async_trait;
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};
use tokio::sync::{mpsc, oneshot};

/// Which timer fired. A connection runs several independent timers at once,
/// so the fired event needs to say which.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    SendDelay,
    AckDelay,
    Retransmit,
    TimeWait,
    HalfClose,
}

/// A timer-fired event, delivered back to whatever is driving the
/// connection engine's event loop (normally a [`crate::multiplexer::Multiplexer`]).
#[derive(Debug, Clone, Copy)]
pub struct TimerFired {
    pub conn: ConnectionKey,
    pub kind: TimerKind,
}

/// An opaque handle to a scheduled, not-yet-fired timer, used only to
/// cancel it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerHandle(u64);

/// The scheduler trait a [`crate::multiplexer::Multiplexer`] is built with.
/// Modeled as `schedule(delay, callback) -> cancel_handle` per spec.md's
/// design notes, specialized here to fire into an event channel rather than
/// taking a literal closure, since the connection engine has no thread of
/// its own to call a closure back on.
#[async_trait]
pub trait Scheduler: Send + Sync {
    fn schedule(&self, delay: Duration, conn: ConnectionKey, kind: TimerKind) -> TimerHandle;
    fn cancel(&self, handle: TimerHandle);
}

/// A [`Scheduler`] backed by `tokio::time::sleep`, delivering fired timers
/// on an internal channel that the multiplexer's event loop polls alongside
/// inbound datagrams.
pub struct TokioScheduler {
    tx: mpsc::UnboundedSender<TimerFired>,
    next_id: AtomicU64,
    pending: Mutex<HashMap<u64, oneshot::Sender<()>>>,
}

impl TokioScheduler {
    /// Creates a scheduler and the receiving half of its fired-timer
    /// channel, which the multiplexer's event loop should poll.
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<TimerFired>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                tx,
                next_id: AtomicU64::new(0),
                pending: Mutex::new(HashMap::new()),
            }),
            rx,
        )
    }
}

#[async_trait]
impl Scheduler for TokioScheduler {
    fn schedule(&self, delay: Duration, conn: ConnectionKey, kind: TimerKind) -> TimerHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (cancel_tx, mut cancel_rx) = oneshot::channel();
        self.pending.lock().unwrap().insert(id, cancel_tx);

        let tx = self.tx.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {
                    let _ = tx.send(TimerFired { conn, kind });
                }
                _ = &mut cancel_rx => {}
            }
        });

        TimerHandle(id)
    }

    fn cancel(&self, handle: TimerHandle) {
        if let Some(cancel_tx) = self.pending.lock().unwrap().remove(&handle.0) {
            let _ = cancel_tx.send(());
        }
    }
}
