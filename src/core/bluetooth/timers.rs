//! Cancellable session timers
//! Each armed timer runs as a small task that reports back into the session
//! queue. Re-arming or cancelling a kind invalidates the earlier task, and the
//! generation carried by the report lets the receiver drop anything stale.
//! Timers only hold a weak handle on the queue, so they never keep it open.

use std::collections::HashMap;
use std::time::Duration;

use log::debug;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    ScanTimeout,
    ScanBatch,
    ConnectTimeout,
    ReconnectBackoff,
    DisconnectTimeout,
}

/// Report sent when a timer elapses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerFired {
    pub kind: TimerKind,
    pub generation: u64,
}

pub struct Timers<T> {
    armed: HashMap<TimerKind, (u64, CancellationToken)>,
    next_generation: u64,
    sink: mpsc::WeakUnboundedSender<T>,
}

impl<T> Timers<T>
where
    T: From<TimerFired> + Send + 'static,
{
    pub fn new(sink: mpsc::WeakUnboundedSender<T>) -> Self {
        Self {
            armed: HashMap::new(),
            next_generation: 0,
            sink,
        }
    }

    /// Arms `kind`, replacing any pending timer of the same kind.
    pub fn arm(&mut self, kind: TimerKind, delay: Duration) {
        self.cancel(kind);
        self.next_generation += 1;
        let generation = self.next_generation;
        let token = CancellationToken::new();
        let token_for_task = token.clone();
        let sink = self.sink.clone();

        debug!("Arming {:?} for {:?}", kind, delay);
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {
                    match sink.upgrade() {
                        Some(sink) => {
                            let _ = sink.send(T::from(TimerFired { kind, generation }));
                        }
                        None => debug!("{:?} elapsed after the queue closed", kind),
                    }
                }
                _ = token_for_task.cancelled() => {}
            }
        });
        self.armed.insert(kind, (generation, token));
    }

    pub fn is_armed(&self, kind: TimerKind) -> bool {
        self.armed.contains_key(&kind)
    }

    pub fn cancel(&mut self, kind: TimerKind) {
        if let Some((_, token)) = self.armed.remove(&kind) {
            debug!("Cancelling {:?}", kind);
            token.cancel();
        }
    }

    pub fn cancel_all(&mut self) {
        for (_, (_, token)) in self.armed.drain() {
            token.cancel();
        }
    }

    /// Consumes a fired report. Returns false when it belongs to a timer that
    /// has since been cancelled or re-armed.
    pub fn accept(&mut self, fired: TimerFired) -> bool {
        match self.armed.get(&fired.kind) {
            Some((generation, _)) if *generation == fired.generation => {
                self.armed.remove(&fired.kind);
                true
            }
            _ => {
                debug!("Dropping stale {:?}", fired.kind);
                false
            }
        }
    }
}

impl<T> Drop for Timers<T> {
    fn drop(&mut self) {
        for (_, (_, token)) in self.armed.drain() {
            token.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn rearming_invalidates_the_earlier_timer() {
        let (tx, mut rx) = mpsc::unbounded_channel::<TimerFired>();
        let mut timers = Timers::new(tx.downgrade());

        timers.arm(TimerKind::ConnectTimeout, Duration::from_secs(1));
        timers.arm(TimerKind::ConnectTimeout, Duration::from_secs(5));

        let fired = rx.recv().await.unwrap();
        assert!(timers.accept(fired));
        assert!(!timers.is_armed(TimerKind::ConnectTimeout));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_timer_never_fires() {
        let (tx, mut rx) = mpsc::unbounded_channel::<TimerFired>();
        let mut timers = Timers::new(tx.downgrade());

        timers.arm(TimerKind::ScanTimeout, Duration::from_millis(100));
        timers.cancel(TimerKind::ScanTimeout);
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn stale_report_is_rejected() {
        let (tx, _rx) = mpsc::unbounded_channel::<TimerFired>();
        let mut timers = Timers::new(tx.downgrade());
        let stale = TimerFired {
            kind: TimerKind::ReconnectBackoff,
            generation: 42,
        };
        assert!(!timers.accept(stale));
    }

    #[tokio::test(start_paused = true)]
    async fn pending_timer_does_not_hold_the_queue_open() {
        let (tx, mut rx) = mpsc::unbounded_channel::<TimerFired>();
        let mut timers = Timers::new(tx.downgrade());
        timers.arm(TimerKind::ReconnectBackoff, Duration::from_secs(30));
        drop(tx);

        assert!(rx.recv().await.is_none());
    }
}
