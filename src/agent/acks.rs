use std::collections::HashMap;
use tokio::sync::oneshot;

/// Pending telephony acknowledgements keyed by verb id.
///
/// A waiter resolves once the platform reports the verb `finished`; dropping
/// the registry (or [`AckRegistry::cancel_all`]) wakes every waiter with an
/// error instead.
#[derive(Debug, Default)]
pub struct AckRegistry {
    waiters: HashMap<String, oneshot::Sender<()>>,
}

impl AckRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register interest in `id`. Without an id the waiter is already resolved.
    pub fn register(&mut self, id: Option<&str>) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        match id {
            Some(id) => {
                if self.waiters.insert(id.to_string(), tx).is_some() {
                    tracing::warn!(id, "replaced an outstanding ack waiter");
                }
            }
            None => {
                let _ = tx.send(());
            }
        }
        rx
    }

    /// Resolve and forget the waiter for `id`. Returns whether one existed.
    pub fn resolve(&mut self, id: &str) -> bool {
        self.waiters.remove(id).is_some_and(|tx| {
            let _ = tx.send(());
            true
        })
    }

    pub fn cancel_all(&mut self) {
        if !self.waiters.is_empty() {
            tracing::debug!(count = self.waiters.len(), "cancelling outstanding ack waiters");
        }
        self.waiters.clear();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.waiters.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.waiters.is_empty()
    }
}
