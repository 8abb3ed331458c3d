//! Counting of in-flight operations and background tasks.
//!
//! Holders keep a [`WaitToken`]; `wait` resolves once every token has been
//! dropped. Built on the all-senders-dropped property of an mpsc channel.

use std::sync::{Mutex, PoisonError};

use tokio::sync::mpsc;

pub(crate) struct WaitGroup {
    tx: Mutex<Option<mpsc::Sender<()>>>,
    rx: Mutex<Option<mpsc::Receiver<()>>>,
}

/// Held by a task or operation counted by the group.
#[derive(Clone)]
pub(crate) struct WaitToken(#[allow(dead_code)] mpsc::Sender<()>);

impl WaitGroup {
    pub(crate) fn new() -> Self {
        let (tx, rx) = mpsc::channel(1);
        Self {
            tx: Mutex::new(Some(tx)),
            rx: Mutex::new(Some(rx)),
        }
    }

    /// Mint a token, or `None` once the group has begun waiting.
    pub(crate) fn token(&self) -> Option<WaitToken> {
        self.tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .cloned()
            .map(WaitToken)
    }

    /// Resolve once all outstanding tokens are dropped. Later calls return
    /// immediately.
    pub(crate) async fn wait(&self) {
        drop(
            self.tx
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take(),
        );
        let rx = self
            .rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(mut rx) = rx {
            // recv yields None once every sender clone is gone.
            let _ = rx.recv().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn wait_returns_once_tokens_drop() {
        let wg = WaitGroup::new();
        let token = wg.token().unwrap();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            drop(token);
        });
        wg.wait().await;
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn wait_with_no_tokens_is_immediate() {
        let wg = WaitGroup::new();
        wg.wait().await;
        assert!(wg.token().is_none());
    }
}
