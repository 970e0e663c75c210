//! Singleton coordination across replicas.
//!
//! Only the elected replica forwards events. The reconciler consults
//! [`Leadership::is_leader`] once per event at entry; the runtime subscribes
//! to [`Leadership::on_leadership_lost`] to drop in-flight work when the
//! lease moves elsewhere.

mod lease;

pub use lease::{LeaseConfig, LeaseDecision, LeaseElector, decide, default_identity};

use std::sync::{Arc, Mutex};

use tokio::sync::watch;
use tracing::info;

pub type LostCallback = Box<dyn Fn() + Send + Sync>;

pub trait Leadership: Send + Sync {
    fn is_leader(&self) -> bool;

    /// Register a callback fired on every leader → follower transition.
    fn on_leadership_lost(&self, callback: LostCallback);
}

struct Shared {
    tx: watch::Sender<bool>,
    callbacks: Mutex<Vec<LostCallback>>,
}

/// Read side of the process-wide leadership flag.
#[derive(Clone)]
pub struct LeaderState {
    shared: Arc<Shared>,
}

/// The single writer of the leadership flag.
pub struct LeadershipWriter {
    state: LeaderState,
}

impl LeaderState {
    /// Create the flag, starting as follower.
    pub fn channel() -> (LeadershipWriter, LeaderState) {
        let (tx, _rx) = watch::channel(false);
        let state = LeaderState {
            shared: Arc::new(Shared {
                tx,
                callbacks: Mutex::new(Vec::new()),
            }),
        };
        (
            LeadershipWriter {
                state: state.clone(),
            },
            state,
        )
    }

    /// Permanently leader, for single-replica deployments without election.
    pub fn always() -> LeaderState {
        let (writer, state) = Self::channel();
        writer.set_leader(true);
        state
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.shared.tx.subscribe()
    }

    /// Resolve once this instance holds leadership.
    pub async fn wait_for_leader(&self) {
        let mut rx = self.subscribe();
        let _ = rx.wait_for(|leader| *leader).await;
    }
}

impl Leadership for LeaderState {
    fn is_leader(&self) -> bool {
        *self.shared.tx.borrow()
    }

    fn on_leadership_lost(&self, callback: LostCallback) {
        self.shared
            .callbacks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(callback);
    }
}

impl LeadershipWriter {
    pub fn set_leader(&self, leader: bool) {
        let was_leader = self.state.shared.tx.send_replace(leader);
        match (was_leader, leader) {
            (false, true) => info!("leadership acquired"),
            (true, false) => {
                info!("leadership lost");
                let callbacks = self
                    .state
                    .shared
                    .callbacks
                    .lock()
                    .unwrap_or_else(|e| e.into_inner());
                for cb in callbacks.iter() {
                    cb();
                }
            }
            _ => {}
        }
    }

    pub fn is_leader(&self) -> bool {
        self.state.is_leader()
    }

    pub fn state(&self) -> LeaderState {
        self.state.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    #[test]
    fn starts_as_follower() {
        let (_w, state) = LeaderState::channel();
        assert!(!state.is_leader());
        assert!(LeaderState::always().is_leader());
    }

    #[test]
    fn callbacks_fire_only_on_loss() {
        let (w, state) = LeaderState::channel();
        let fired = Arc::new(AtomicU32::new(0));
        let f = fired.clone();
        state.on_leadership_lost(Box::new(move || {
            f.fetch_add(1, Ordering::SeqCst);
        }));

        w.set_leader(false);
        w.set_leader(true);
        w.set_leader(true);
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        w.set_leader(false);
        w.set_leader(false);
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        w.set_leader(true);
        w.set_leader(false);
        assert_eq!(fired.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn wait_for_leader_resolves_on_acquire() {
        let (w, state) = LeaderState::channel();
        let waiter = tokio::spawn({
            let state = state.clone();
            async move { state.wait_for_leader().await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        w.set_leader(true);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter resolves")
            .unwrap();
    }
}
