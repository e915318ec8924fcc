//! Bounded, breaker-guarded dispatch of model calls.
//!
//! Two limits apply to every call: a global semaphore of `concurrency` permits
//! and a single-slot lock per base model id. Holding the model's lock for the
//! whole call serializes that model, so the consecutive-failure counter is
//! checked, updated and compared by one task at a time and the breaker trips
//! after exactly `failure_threshold` real failures.
//!
//! The model lock is taken before the global permit; a task waiting on a busy
//! model never holds global capacity.

use crate::errors::CallError;
use crate::model_id::base_model_id;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, warn};

/// Consecutive failures after which a model is skipped for the rest of the run
pub const FAILURE_THRESHOLD: u32 = 10;

pub const DEFAULT_CONCURRENCY: usize = 20;

/// Breaker bookkeeping for one base model
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CircuitBreakerState {
    pub consecutive_failures: u32,
    pub tripped: bool,
}

pub struct CircuitBreakerScheduler {
    global: Semaphore,
    models: std::sync::Mutex<HashMap<String, Arc<Mutex<CircuitBreakerState>>>>,
    failure_threshold: u32,
}

impl CircuitBreakerScheduler {
    pub fn new(concurrency: usize) -> Self {
        Self {
            global: Semaphore::new(concurrency.max(1)),
            models: std::sync::Mutex::new(HashMap::new()),
            failure_threshold: FAILURE_THRESHOLD,
        }
    }

    #[cfg(test)]
    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold.max(1);
        self
    }

    /// The serialization slot for a base model, created on first use
    fn model_slot(&self, base_id: &str) -> Arc<Mutex<CircuitBreakerState>> {
        let mut models = self
            .models
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        models.entry(base_id.to_string()).or_default().clone()
    }

    /// Run one call attempt sequence for `model_id` under both limits.
    ///
    /// `task` is not invoked when the model's breaker is open; a
    /// [`CallError::CircuitOpen`] is returned instead and not counted.
    pub async fn submit<T, F, Fut>(&self, model_id: &str, task: F) -> Result<T, CallError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, CallError>>,
    {
        let base_id = base_model_id(model_id);
        let slot = self.model_slot(&base_id);
        let mut state = slot.lock().await;

        if state.tripped || state.consecutive_failures >= self.failure_threshold {
            debug!(model = %base_id, "Circuit open, skipping call");
            return Err(CallError::CircuitOpen {
                model: base_id,
                failures: state.consecutive_failures,
            });
        }

        let _permit = self
            .global
            .acquire()
            .await
            .map_err(|_| CallError::Config("scheduler closed".to_string()))?;

        let result = task().await;

        match &result {
            Ok(_) => {
                if state.consecutive_failures > 0 {
                    debug!(
                        model = %base_id,
                        previous_failures = state.consecutive_failures,
                        "Call succeeded, resetting failure counter"
                    );
                    state.consecutive_failures = 0;
                }
            }
            Err(err) => {
                state.consecutive_failures += 1;
                if state.consecutive_failures >= self.failure_threshold && !state.tripped {
                    state.tripped = true;
                    warn!(
                        model = %base_id,
                        failures = state.consecutive_failures,
                        error = %err,
                        "Circuit breaker tripped; remaining calls for this model will be skipped"
                    );
                }
            }
        }

        result
    }

    pub async fn breaker_state(&self, model_id: &str) -> CircuitBreakerState {
        let slot = self.model_slot(&base_model_id(model_id));
        let state = slot.lock().await;
        *state
    }

    pub async fn failure_count(&self, model_id: &str) -> u32 {
        self.breaker_state(model_id).await.consecutive_failures
    }

    #[cfg(test)]
    pub async fn is_tripped(&self, model_id: &str) -> bool {
        self.breaker_state(model_id).await.tripped
    }

    /// Base model ids whose breaker is open, sorted
    pub async fn tripped_models(&self) -> Vec<String> {
        let slots: Vec<(String, Arc<Mutex<CircuitBreakerState>>)> = {
            let models = self
                .models
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            models.iter().map(|(id, slot)| (id.clone(), slot.clone())).collect()
        };

        let mut tripped = Vec::new();
        for (id, slot) in slots {
            if slot.lock().await.tripped {
                tripped.push(id);
            }
        }
        tripped.sort();
        tripped
    }
}

impl Default for CircuitBreakerScheduler {
    fn default() -> Self {
        Self::new(DEFAULT_CONCURRENCY)
    }
}
