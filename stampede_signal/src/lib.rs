//! Phase signalling for stampede.
//!
//! A stampede run moves through a small number of one-shot phases: the run
//! timer expires, the operator hits ctrl-c, the simulated users are told to
//! stop. Each phase is modeled by a pair made of one [`Broadcaster`] and any
//! number of [`Watcher`] instances.
//!
//! Watchers come in two kinds. A watcher obtained from [`signal`] or
//! [`Watcher::register`] is counted by the broadcaster, and
//! [`Broadcaster::signal_and_wait`] will not return until every counted watcher
//! has observed the signal or been dropped. A watcher obtained by `clone` is
//! not counted and may observe the signal without holding up the broadcaster.

#![deny(clippy::all)]
#![deny(clippy::cargo)]
#![deny(clippy::pedantic)]
#![deny(clippy::print_stdout)]
#![deny(clippy::print_stderr)]
#![deny(clippy::dbg_macro)]
#![deny(clippy::unwrap_used)]
#![deny(unused_extern_crates)]
#![deny(unreachable_pub)]
#![deny(missing_docs)]
#![deny(missing_debug_implementations)]
#![allow(clippy::multiple_crate_versions)]

use std::sync::{
    Arc,
    atomic::{AtomicU32, Ordering},
};

use tokio::sync::{Notify, watch};
use tracing::{debug, info};

/// Construct a `Watcher` and `Broadcaster` pair.
///
/// The returned `Watcher` is registered.
#[must_use]
pub fn signal() -> (Watcher, Broadcaster) {
    let (sender, receiver) = watch::channel(false);
    let peers = Arc::new(AtomicU32::new(1));
    let notify = Arc::new(Notify::new());

    let watcher = Watcher {
        receiver,
        peers: Arc::clone(&peers),
        notify: Arc::clone(&notify),
        registered: true,
        acknowledged: false,
        signal_received: false,
    };
    let broadcaster = Broadcaster {
        sender,
        peers,
        notify,
    };

    (watcher, broadcaster)
}

/// Errors for [`Watcher::register`].
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterError {
    /// The signal was already observed by the watcher used to register.
    #[error("signal has been received")]
    SignalReceived,
}

/// Errors for [`Watcher::try_recv`].
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TryRecvError {
    /// The signal was already observed by this watcher.
    #[error("signal has been received")]
    SignalReceived,
}

#[derive(Debug)]
/// Fires a phase change to every `Watcher` of the same pair.
pub struct Broadcaster {
    sender: watch::Sender<bool>,
    /// Count of registered watchers that have not yet acknowledged.
    peers: Arc<AtomicU32>,
    /// Woken every time a registered watcher acknowledges.
    notify: Arc<Notify>,
}

impl Broadcaster {
    /// Fire the signal. Does not wait for watchers.
    pub fn signal(self) {
        self.sender.send_replace(true);
    }

    /// Fire the signal and wait until every registered watcher has observed
    /// it or been dropped.
    pub async fn signal_and_wait(self) {
        self.sender.send_replace(true);

        loop {
            // Register interest before reading the count, otherwise an
            // acknowledgement landing between the two is lost.
            let notified = self.notify.notified();
            let peers = self.peers.load(Ordering::SeqCst);
            if peers == 0 {
                break;
            }
            info!("Waiting for {peers} peers");
            notified.await;
        }
    }

    /// The number of registered watchers that have not yet acknowledged.
    #[must_use]
    pub fn outstanding(&self) -> u32 {
        self.peers.load(Ordering::SeqCst)
    }
}

#[derive(Debug)]
/// Observes the phase change fired by a `Broadcaster`.
pub struct Watcher {
    receiver: watch::Receiver<bool>,
    peers: Arc<AtomicU32>,
    notify: Arc<Notify>,
    /// Whether the broadcaster counts this instance.
    registered: bool,
    /// Whether this instance already removed itself from the count.
    acknowledged: bool,
    signal_received: bool,
}

impl Watcher {
    fn acknowledge(&mut self) {
        if !self.registered || self.acknowledged {
            return;
        }
        // Saturating decrement: the count must never wrap to u32::MAX.
        let _ = self
            .peers
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |peers| {
                peers.checked_sub(1)
            });
        self.acknowledged = true;
        self.notify.notify_waiters();
    }

    /// Wait for the signal. Returns immediately if the signal was already
    /// fired, or if the `Broadcaster` was dropped without firing.
    pub async fn recv(mut self) {
        if self.signal_received {
            // Keep a `select!` arm built on an already-fired watcher from
            // starving its siblings.
            tokio::task::yield_now().await;
            return;
        }
        if self.receiver.wait_for(|fired| *fired).await.is_err() {
            debug!("broadcaster dropped without signalling");
        }
        self.signal_received = true;
        self.acknowledge();
    }

    /// Check for the signal without blocking.
    ///
    /// # Errors
    ///
    /// Returns [`TryRecvError::SignalReceived`] if a previous call already
    /// reported the signal.
    pub fn try_recv(&mut self) -> Result<bool, TryRecvError> {
        if self.signal_received {
            return Err(TryRecvError::SignalReceived);
        }
        let fired = match self.receiver.has_changed() {
            Ok(_) => *self.receiver.borrow(),
            Err(_) => true,
        };
        if fired {
            self.signal_received = true;
            self.acknowledge();
        }
        Ok(fired)
    }

    /// Produce a new registered `Watcher`.
    ///
    /// # Errors
    ///
    /// Returns [`RegisterError::SignalReceived`] if this watcher has already
    /// observed the signal.
    pub fn register(&self) -> Result<Self, RegisterError> {
        if self.signal_received {
            return Err(RegisterError::SignalReceived);
        }
        self.peers.fetch_add(1, Ordering::SeqCst);

        Ok(Self {
            receiver: self.receiver.clone(),
            peers: Arc::clone(&self.peers),
            notify: Arc::clone(&self.notify),
            registered: true,
            acknowledged: false,
            signal_received: false,
        })
    }
}

impl Clone for Watcher {
    fn clone(&self) -> Self {
        Self {
            receiver: self.receiver.clone(),
            peers: Arc::clone(&self.peers),
            notify: Arc::clone(&self.notify),
            registered: false,
            acknowledged: false,
            signal_received: self.signal_received,
        }
    }
}

impl Drop for Watcher {
    fn drop(&mut self) {
        self.acknowledge();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::time::timeout;

    use super::*;

    const PATIENCE: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn watcher_observes_signal() {
        let (watcher, broadcaster) = signal();
        let handle = tokio::spawn(watcher.recv());
        broadcaster.signal();
        timeout(PATIENCE, handle)
            .await
            .expect("watcher never observed the signal")
            .expect("watcher task panicked");
    }

    #[tokio::test]
    async fn dropped_broadcaster_releases_watchers() {
        let (watcher, broadcaster) = signal();
        drop(broadcaster);
        timeout(PATIENCE, watcher.recv())
            .await
            .expect("watcher hung on a dropped broadcaster");
    }

    #[tokio::test]
    async fn signal_and_wait_waits_for_registered_peers() {
        let (watcher, broadcaster) = signal();
        let peers: Vec<Watcher> = (0..8)
            .map(|_| watcher.register().expect("register before signal"))
            .collect();
        assert_eq!(broadcaster.outstanding(), 9);

        let mut handles = Vec::new();
        for peer in peers {
            handles.push(tokio::spawn(async move {
                peer.recv().await;
            }));
        }
        handles.push(tokio::spawn(watcher.recv()));

        timeout(PATIENCE, broadcaster.signal_and_wait())
            .await
            .expect("signal_and_wait never returned");
        for handle in handles {
            handle.await.expect("peer task panicked");
        }
    }

    #[tokio::test]
    async fn unregistered_clone_does_not_block_broadcaster() {
        let (watcher, broadcaster) = signal();
        let _lingering = watcher.clone();
        drop(watcher);
        assert_eq!(broadcaster.outstanding(), 0);
        timeout(PATIENCE, broadcaster.signal_and_wait())
            .await
            .expect("unregistered clone held up the broadcaster");
    }

    #[test]
    fn try_recv_reports_once() {
        let (mut watcher, broadcaster) = signal();
        assert_eq!(watcher.try_recv(), Ok(false));
        broadcaster.signal();
        assert_eq!(watcher.try_recv(), Ok(true));
        assert_eq!(watcher.try_recv(), Err(TryRecvError::SignalReceived));
        assert_eq!(
            watcher.register().map(|_| ()),
            Err(RegisterError::SignalReceived)
        );
    }
}
