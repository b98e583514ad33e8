//! Bounded model-endpoint pool.
//!
//! Model endpoints are the engine's true bottleneck: each endpoint serves
//! one model with a small per-endpoint concurrency cap. [`ModelPool`] hands
//! out RAII [`PoolSlot`]s — acquiring blocks (up to a timeout) until an
//! endpoint serving the requested model has free capacity; dropping the
//! slot releases the capacity and wakes waiters.
//!
//! Fairness: waiters wake in FIFO order. A waiter for a model whose
//! endpoints are all busy does not block a later waiter for a different
//! model that has capacity. Endpoint selection among eligible endpoints is
//! least-loaded first, ties broken by configured order.
//!
//! # Example
//!
//! ```rust
//! use swarmllm::config::EndpointConfig;
//! use swarmllm::model_pool::ModelPool;
//! use std::time::Duration;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let pool = ModelPool::new(vec![
//!     EndpointConfig::new("http://localhost:11434", "qwen2.5:7b").with_max_concurrent(2),
//! ]);
//!
//! let slot = pool.acquire("qwen2.5:7b", Duration::from_secs(1)).await.unwrap();
//! assert_eq!(pool.in_flight_total(), 1);
//! drop(slot);
//! assert_eq!(pool.in_flight_total(), 0);
//! # }
//! ```

use crate::swarmllm::config::EndpointConfig;
use std::collections::VecDeque;
use std::error::Error;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;

/// Errors from slot acquisition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    /// No slot for the model became free within the timeout.
    AcquireTimeout(String),
    /// No configured endpoint serves the requested model at all.
    NoEndpoint(String),
}

impl fmt::Display for PoolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PoolError::AcquireTimeout(model) => {
                write!(f, "timed out waiting for a '{}' slot", model)
            }
            PoolError::NoEndpoint(model) => {
                write!(f, "no endpoint serves model '{}'", model)
            }
        }
    }
}

impl Error for PoolError {}

#[derive(Debug)]
struct EndpointState {
    config: EndpointConfig,
    in_flight: usize,
}

#[derive(Debug)]
struct Waiter {
    id: u64,
    model: String,
    grant: oneshot::Sender<usize>,
}

#[derive(Debug)]
struct PoolInner {
    endpoints: Vec<EndpointState>,
    waiters: VecDeque<Waiter>,
    next_waiter_id: u64,
}

impl PoolInner {
    /// Least-loaded endpoint with free capacity serving `model`, ties broken
    /// by configured order. Increments `in_flight` on success.
    fn try_reserve(&mut self, model: &str) -> Option<usize> {
        let mut best: Option<usize> = None;
        for (index, endpoint) in self.endpoints.iter().enumerate() {
            if endpoint.config.model != model || endpoint.in_flight >= endpoint.config.max_concurrent
            {
                continue;
            }
            match best {
                Some(current) if self.endpoints[current].in_flight <= endpoint.in_flight => {}
                _ => best = Some(index),
            }
        }
        if let Some(index) = best {
            self.endpoints[index].in_flight += 1;
        }
        best
    }

    fn serves(&self, model: &str) -> bool {
        self.endpoints.iter().any(|e| e.config.model == model)
    }

    /// Wake waiters, FIFO, as long as capacity allows. Called after every
    /// release with the lock held.
    fn wake_waiters(&mut self) {
        let mut index = 0;
        while index < self.waiters.len() {
            let model = self.waiters[index].model.clone();
            match self.try_reserve(&model) {
                Some(endpoint_index) => {
                    let waiter = self.waiters.remove(index).expect("index in range");
                    if waiter.grant.send(endpoint_index).is_err() {
                        // Receiver gave up (acquire timed out); undo.
                        self.endpoints[endpoint_index].in_flight -= 1;
                    }
                    // Do not advance: the next waiter shifted into `index`.
                }
                None => index += 1,
            }
        }
    }
}

/// N endpoints × per-endpoint concurrency, with blocking FIFO acquisition.
#[derive(Clone)]
pub struct ModelPool {
    inner: Arc<Mutex<PoolInner>>,
}

impl ModelPool {
    /// Pool over the configured endpoints, in configured order.
    pub fn new(endpoints: Vec<EndpointConfig>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(PoolInner {
                endpoints: endpoints
                    .into_iter()
                    .map(|config| EndpointState {
                        config,
                        in_flight: 0,
                    })
                    .collect(),
                waiters: VecDeque::new(),
                next_waiter_id: 0,
            })),
        }
    }

    /// Total capacity across all endpoints.
    pub fn total_slots(&self) -> usize {
        self.inner
            .lock()
            .expect("pool lock")
            .endpoints
            .iter()
            .map(|e| e.config.max_concurrent)
            .sum()
    }

    /// Currently in-flight calls across all endpoints.
    pub fn in_flight_total(&self) -> usize {
        self.inner
            .lock()
            .expect("pool lock")
            .endpoints
            .iter()
            .map(|e| e.in_flight)
            .sum()
    }

    /// Block until an endpoint serving `model` has capacity, up to `timeout`.
    pub async fn acquire(&self, model: &str, timeout: Duration) -> Result<PoolSlot, PoolError> {
        let (waiter_id, mut receiver) = {
            let mut inner = self.inner.lock().expect("pool lock");
            if !inner.serves(model) {
                return Err(PoolError::NoEndpoint(model.to_string()));
            }
            if let Some(endpoint_index) = inner.try_reserve(model) {
                return Ok(self.slot(endpoint_index, &inner.endpoints[endpoint_index]));
            }
            let (grant, receiver) = oneshot::channel();
            let waiter_id = inner.next_waiter_id;
            inner.next_waiter_id += 1;
            inner.waiters.push_back(Waiter {
                id: waiter_id,
                model: model.to_string(),
                grant,
            });
            (waiter_id, receiver)
        };

        match tokio::time::timeout(timeout, &mut receiver).await {
            Ok(Ok(endpoint_index)) => {
                let inner = self.inner.lock().expect("pool lock");
                Ok(self.slot(endpoint_index, &inner.endpoints[endpoint_index]))
            }
            Ok(Err(_)) => Err(PoolError::AcquireTimeout(model.to_string())),
            Err(_) => {
                let mut inner = self.inner.lock().expect("pool lock");
                let position = inner.waiters.iter().position(|w| w.id == waiter_id);
                if let Some(position) = position {
                    inner.waiters.remove(position);
                    return Err(PoolError::AcquireTimeout(model.to_string()));
                }
                // Lost the race: a grant landed between timer expiry and the
                // lock. Use it rather than leaking the reservation.
                match receiver.try_recv() {
                    Ok(endpoint_index) => {
                        Ok(self.slot(endpoint_index, &inner.endpoints[endpoint_index]))
                    }
                    Err(_) => Err(PoolError::AcquireTimeout(model.to_string())),
                }
            }
        }
    }

    fn slot(&self, endpoint_index: usize, endpoint: &EndpointState) -> PoolSlot {
        PoolSlot {
            pool: self.inner.clone(),
            endpoint_index,
            url: endpoint.config.url.clone(),
            model: endpoint.config.model.clone(),
        }
    }
}

/// RAII capacity grant: dropping releases the endpoint slot and wakes the
/// next eligible waiter.
#[derive(Debug)]
pub struct PoolSlot {
    pool: Arc<Mutex<PoolInner>>,
    endpoint_index: usize,
    url: String,
    model: String,
}

impl PoolSlot {
    /// URL of the granted endpoint.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Model served by the granted endpoint.
    pub fn model(&self) -> &str {
        &self.model
    }
}

impl Drop for PoolSlot {
    fn drop(&mut self) {
        let mut inner = self.pool.lock().expect("pool lock");
        inner.endpoints[self.endpoint_index].in_flight -= 1;
        inner.wake_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_slot_pool() -> ModelPool {
        ModelPool::new(vec![
            EndpointConfig::new("http://a", "m").with_max_concurrent(1),
            EndpointConfig::new("http://b", "m").with_max_concurrent(1),
        ])
    }

    #[tokio::test]
    async fn acquire_prefers_least_loaded_in_configured_order() {
        let pool = two_slot_pool();
        let first = pool.acquire("m", Duration::from_secs(1)).await.unwrap();
        assert_eq!(first.url(), "http://a");
        let second = pool.acquire("m", Duration::from_secs(1)).await.unwrap();
        assert_eq!(second.url(), "http://b");
        assert_eq!(pool.in_flight_total(), 2);
    }

    #[tokio::test]
    async fn cap_is_never_exceeded_and_drop_releases() {
        let pool = ModelPool::new(vec![
            EndpointConfig::new("http://a", "m").with_max_concurrent(2)
        ]);
        let a = pool.acquire("m", Duration::from_millis(50)).await.unwrap();
        let b = pool.acquire("m", Duration::from_millis(50)).await.unwrap();
        assert_eq!(pool.in_flight_total(), 2);

        // Third acquire must time out while both slots are held.
        let err = pool.acquire("m", Duration::from_millis(50)).await.unwrap_err();
        assert_eq!(err, PoolError::AcquireTimeout("m".to_string()));

        drop(a);
        assert_eq!(pool.in_flight_total(), 1);
        let c = pool.acquire("m", Duration::from_millis(50)).await.unwrap();
        assert_eq!(pool.in_flight_total(), 2);
        drop(b);
        drop(c);
        assert_eq!(pool.in_flight_total(), 0);
    }

    #[tokio::test]
    async fn waiters_wake_in_fifo_order() {
        let pool = ModelPool::new(vec![
            EndpointConfig::new("http://a", "m").with_max_concurrent(1)
        ]);
        let held = pool.acquire("m", Duration::from_secs(1)).await.unwrap();
        let order = Arc::new(Mutex::new(Vec::new()));

        let mut handles = Vec::new();
        for label in ["first", "second", "third"] {
            let pool = pool.clone();
            let order = order.clone();
            handles.push(tokio::spawn(async move {
                let slot = pool.acquire("m", Duration::from_secs(5)).await.unwrap();
                order.lock().unwrap().push(label);
                drop(slot);
            }));
            // Enqueue deterministically.
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        drop(held);
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(*order.lock().unwrap(), vec!["first", "second", "third"]);
        assert_eq!(pool.in_flight_total(), 0);
    }

    #[tokio::test]
    async fn unknown_model_fails_fast() {
        let pool = two_slot_pool();
        assert_eq!(
            pool.acquire("other", Duration::from_secs(1)).await.unwrap_err(),
            PoolError::NoEndpoint("other".to_string())
        );
    }

    #[tokio::test]
    async fn different_model_waiter_is_not_blocked_by_busy_head() {
        let pool = ModelPool::new(vec![
            EndpointConfig::new("http://a", "m1").with_max_concurrent(1),
            EndpointConfig::new("http://b", "m2").with_max_concurrent(1),
        ]);
        let m1_held = pool.acquire("m1", Duration::from_secs(1)).await.unwrap();
        let m2_held = pool.acquire("m2", Duration::from_secs(1)).await.unwrap();

        // Head waiter wants m1 (still busy); the m2 waiter behind it must be
        // served when m2 frees up.
        let pool_m1 = pool.clone();
        let blocked = tokio::spawn(async move {
            pool_m1.acquire("m1", Duration::from_millis(500)).await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        let pool_m2 = pool.clone();
        let waiting = tokio::spawn(async move {
            pool_m2.acquire("m2", Duration::from_secs(5)).await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        drop(m2_held);
        assert!(waiting.await.unwrap().is_ok());
        drop(m1_held);
        assert!(blocked.await.unwrap().is_ok());
    }
}
