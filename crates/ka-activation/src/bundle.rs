//! Per-key bookkeeping for multi-key products.

use ka_common::{BundleResult, KeyFailure, KeyState, KeyStatus};
use ka_config::BundleConfig;
use rand::Rng;
use std::collections::HashSet;
use std::time::Duration;

use crate::error::ActivationError;

/// Bundle classification of a key's final error.
impl From<&ActivationError> for KeyStatus {
    fn from(error: &ActivationError) -> Self {
        match error.root() {
            ActivationError::AlreadyOwned(products) => KeyStatus::AlreadyOwned {
                products: products.clone(),
            },
            ActivationError::AlreadyRedeemed => KeyStatus::AlreadyRedeemed,
            ActivationError::ConversionRequired => KeyStatus::ConversionRequired,
            _ => KeyStatus::Failed {
                reason: error.to_string(),
            },
        }
    }
}

/// One [`KeyState`] per key, in product order.
#[derive(Debug, Clone)]
pub struct BundleTracker {
    states: Vec<KeyState>,
    restored: Vec<bool>,
}

impl BundleTracker {
    /// Keys found in `already_succeeded` start as `Succeeded` and are skipped.
    pub fn new(keys: &[String], already_succeeded: &HashSet<String>) -> Self {
        let mut states = Vec::with_capacity(keys.len());
        let mut restored = Vec::with_capacity(keys.len());
        for key in keys {
            let mut state = KeyState::new(key.clone());
            let done = already_succeeded.contains(key);
            if done {
                state.transition(KeyStatus::Succeeded);
            }
            states.push(state);
            restored.push(done);
        }
        Self { states, restored }
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    pub fn states(&self) -> &[KeyState] {
        &self.states
    }

    pub fn state(&self, index: usize) -> Option<&KeyState> {
        self.states.get(index)
    }

    pub fn state_mut(&mut self, index: usize) -> Option<&mut KeyState> {
        self.states.get_mut(index)
    }

    /// Succeeded in an earlier run of the same session.
    pub fn is_restored(&self, index: usize) -> bool {
        self.restored.get(index).copied().unwrap_or(false)
    }

    /// Whether any key after `index` still needs work.
    pub fn has_pending_after(&self, index: usize) -> bool {
        (index + 1..self.len()).any(|i| !self.is_restored(i))
    }

    /// Whether any key has ended without succeeding.
    pub fn any_failure(&self) -> bool {
        self.states
            .iter()
            .any(|s| s.status.is_terminal() && s.status != KeyStatus::Succeeded)
    }

    pub fn succeeded_keys(&self) -> Vec<String> {
        self.states
            .iter()
            .filter(|s| s.status == KeyStatus::Succeeded)
            .map(|s| s.key.clone())
            .collect()
    }

    /// Aggregate view; every key lands in exactly one of the two lists.
    pub fn result(&self) -> BundleResult {
        let mut result = BundleResult::default();
        for state in &self.states {
            if state.status == KeyStatus::Succeeded {
                result.succeeded.push(state.key.clone());
            } else {
                let reason = state
                    .status
                    .failure_reason()
                    .or_else(|| state.last_error.clone())
                    .unwrap_or_else(|| "not attempted".to_string());
                result.failed.push(KeyFailure {
                    key: state.key.clone(),
                    reason,
                });
            }
        }
        result
    }
}

/// Pause before the next key: base, plus a penalty once anything failed, plus
/// symmetric jitter, never below the floor.
pub fn inter_key_delay(config: &BundleConfig, any_failure: bool) -> Duration {
    let mut millis = config.inter_key_delay_ms as i64;
    if any_failure {
        millis += config.failure_penalty_ms as i64;
    }
    if config.jitter_ms > 0 {
        let spread = config.jitter_ms as i64;
        millis += rand::rng().random_range(-spread..=spread);
    }
    Duration::from_millis(millis.max(config.min_delay_ms as i64) as u64)
}
