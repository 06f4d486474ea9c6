use std::sync::Arc;

use tokio::sync::watch;

/// Shared online/offline flag. The gateway transport flips it as the socket
/// comes and goes; the send queue drains on every offline-to-online edge.
#[derive(Debug, Clone)]
pub struct Connectivity {
    tx: Arc<watch::Sender<bool>>,
}

impl Connectivity {
    pub fn new(online: bool) -> Self {
        let (tx, _rx) = watch::channel(online);
        Self { tx: Arc::new(tx) }
    }

    /// Returns `true` if the flag changed.
    pub fn set_online(&self, online: bool) -> bool {
        self.tx.send_if_modified(|current| {
            if *current == online {
                false
            } else {
                *current = online;
                true
            }
        })
    }

    pub fn is_online(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_transitions_notify_subscribers() {
        let connectivity = Connectivity::new(false);
        let mut rx = connectivity.subscribe();

        assert!(connectivity.set_online(true));
        rx.changed().await.unwrap();
        assert!(*rx.borrow());

        assert!(!connectivity.set_online(true));
        assert!(connectivity.is_online());
    }
}
