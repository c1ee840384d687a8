//! Correlation engine — matches replies to outstanding requests by uuid.
//!
//! Each outstanding request owns exactly one slot. A slot is resolved at
//! most once; after a timeout (or when the waiting future is dropped) the
//! slot is gone and a tardy reply reports [`ClientError::UnknownCorrelation`].

use crate::error::ClientError;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;

type Slot<T> = oneshot::Sender<Result<T, ClientError>>;

/// Table of outstanding requests.
#[derive(Debug)]
pub struct Correlator<T> {
    slots: Arc<DashMap<String, Slot<T>>>,
}

impl<T> Clone for Correlator<T> {
    fn clone(&self) -> Self {
        Self {
            slots: Arc::clone(&self.slots),
        }
    }
}

impl<T> Default for Correlator<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Correlator<T> {
    pub fn new() -> Self {
        Self {
            slots: Arc::new(DashMap::new()),
        }
    }

    /// Open a slot for `uuid`. Register before sending the request so a
    /// fast reply always finds it.
    pub fn register(&self, uuid: &str, timeout: Duration) -> Result<Pending<T>, ClientError> {
        match self.slots.entry(uuid.to_string()) {
            Entry::Occupied(_) => Err(ClientError::DuplicateCorrelation(uuid.to_string())),
            Entry::Vacant(entry) => {
                let (tx, rx) = oneshot::channel();
                entry.insert(tx);
                Ok(Pending {
                    uuid: uuid.to_string(),
                    timeout,
                    rx: Some(rx),
                    slots: Arc::clone(&self.slots),
                })
            }
        }
    }

    /// Complete the slot for `uuid` with a value.
    pub fn resolve(&self, uuid: &str, value: T) -> Result<(), ClientError> {
        self.complete(uuid, Ok(value))
    }

    /// Complete the slot for `uuid` with a failure.
    pub fn reject(&self, uuid: &str, error: ClientError) -> Result<(), ClientError> {
        self.complete(uuid, Err(error))
    }

    fn complete(&self, uuid: &str, result: Result<T, ClientError>) -> Result<(), ClientError> {
        let (_, tx) = self
            .slots
            .remove(uuid)
            .ok_or_else(|| ClientError::UnknownCorrelation(uuid.to_string()))?;
        // The waiter may have given up in the same instant; nothing to do then.
        let _ = tx.send(result);
        Ok(())
    }

    /// Fail every outstanding slot. Returns how many were failed.
    pub fn fail_all(&self, make_error: impl Fn() -> ClientError) -> usize {
        let uuids: Vec<String> = self.slots.iter().map(|e| e.key().clone()).collect();
        let mut failed = 0;
        for uuid in uuids {
            if let Some((_, tx)) = self.slots.remove(&uuid) {
                let _ = tx.send(Err(make_error()));
                failed += 1;
            }
        }
        failed
    }

    pub fn contains(&self, uuid: &str) -> bool {
        self.slots.contains_key(uuid)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

/// A registered slot awaiting its reply.
///
/// Dropping it (or timing out) removes the slot.
#[derive(Debug)]
pub struct Pending<T> {
    uuid: String,
    timeout: Duration,
    rx: Option<oneshot::Receiver<Result<T, ClientError>>>,
    slots: Arc<DashMap<String, Slot<T>>>,
}

impl<T> Pending<T> {
    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    /// Wait for the reply, at most the registered timeout.
    pub async fn wait(mut self) -> Result<T, ClientError> {
        let Some(rx) = self.rx.take() else {
            return Err(ClientError::ConnectionLost);
        };
        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ClientError::ConnectionLost),
            Err(_) => Err(ClientError::Timeout(self.timeout)),
        }
    }
}

impl<T> Drop for Pending<T> {
    fn drop(&mut self) {
        self.slots.remove(&self.uuid);
    }
}
