//! Observable state cell

use tokio::sync::watch;

/// Holds the latest value and notifies subscribers on every change
#[derive(Debug)]
pub struct Observable<T> {
    tx: watch::Sender<T>,
}

impl<T> Observable<T> {
    pub fn new(initial: T) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self { tx }
    }

    /// Current value
    pub fn get(&self) -> T
    where
        T: Clone,
    {
        self.tx.borrow().clone()
    }

    /// Replace the value, returning the previous one
    pub fn set(&self, value: T) -> T {
        self.tx.send_replace(value)
    }

    /// Compute the next value from the current one under the channel lock,
    /// so no other writer can interleave. Returns the value stored.
    pub fn replace_with(&self, f: impl FnOnce(&T) -> T) -> T
    where
        T: Clone,
    {
        let mut stored = None;
        self.tx.send_modify(|value| {
            let next = f(value);
            stored = Some(next.clone());
            *value = next;
        });
        stored.unwrap_or_else(|| self.get())
    }

    pub fn subscribe(&self) -> Subscription<T> {
        Subscription {
            rx: self.tx.subscribe(),
        }
    }
}

/// Receiving side of an [`Observable`]
#[derive(Debug, Clone)]
pub struct Subscription<T> {
    rx: watch::Receiver<T>,
}

impl<T: Clone> Subscription<T> {
    pub fn current(&self) -> T {
        self.rx.borrow().clone()
    }

    /// Wait for the next change and return the newest value.
    ///
    /// Intermediate values may be skipped. Returns `None` once the
    /// observable is gone.
    pub async fn changed(&mut self) -> Option<T> {
        self.rx.changed().await.ok()?;
        Some(self.rx.borrow_and_update().clone())
    }
}
