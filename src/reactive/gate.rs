use crate::error::AppError;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

/// Per-service capture state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureState {
    Idle,
    /// A photo capture is running; refreshes wait for it
    Capturing,
    /// Cooling down after a user edit or capture
    Settling { until: Instant },
}

/// When a held-back refresh may run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Quiet {
    Now,
    At(Instant),
    /// Ends when the capture guard is dropped
    WhileCapturing,
}

/// Tracks [`CaptureState`] for every service
pub struct SettleGate {
    cooldown: Duration,
    states: Mutex<HashMap<String, CaptureState>>,
}

impl SettleGate {
    pub fn new(cooldown: Duration) -> Self {
        Self {
            cooldown,
            states: Mutex::new(HashMap::new()),
        }
    }

    pub fn cooldown(&self) -> Duration {
        self.cooldown
    }

    fn with_states<T>(&self, f: impl FnOnce(&mut HashMap<String, CaptureState>) -> T) -> T {
        let mut states = self.states.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut states)
    }

    pub fn state(&self, service_id: &str) -> CaptureState {
        let now = Instant::now();
        self.with_states(|states| match states.get(service_id).copied() {
            Some(CaptureState::Settling { until }) if until <= now => {
                states.remove(service_id);
                CaptureState::Idle
            }
            Some(state) => state,
            None => CaptureState::Idle,
        })
    }

    /// Restarts the cooldown; a running capture keeps its state
    pub fn note_user_mutation(&self, service_id: &str) {
        let until = Instant::now() + self.cooldown;
        self.with_states(|states| {
            if states.get(service_id) != Some(&CaptureState::Capturing) {
                states.insert(service_id.to_string(), CaptureState::Settling { until });
            }
        });
    }

    /// Enters `Capturing`; the returned guard moves on to `Settling` when dropped
    pub fn begin_capture(self: &Arc<Self>, service_id: &str) -> Result<CaptureGuard, AppError> {
        self.with_states(|states| {
            if states.get(service_id) == Some(&CaptureState::Capturing) {
                return Err(AppError::Validation(
                    "A photo capture is already in progress".to_string(),
                ));
            }
            states.insert(service_id.to_string(), CaptureState::Capturing);
            Ok(())
        })?;
        log::debug!("Capture started for {}", service_id);

        Ok(CaptureGuard {
            gate: Arc::clone(self),
            service_id: service_id.to_string(),
        })
    }

    fn end_capture(&self, service_id: &str) {
        let until = Instant::now() + self.cooldown;
        self.with_states(|states| {
            states.insert(service_id.to_string(), CaptureState::Settling { until });
        });
        log::debug!("Capture finished for {}", service_id);
    }

    pub fn quiet(&self, service_id: &str) -> Quiet {
        match self.state(service_id) {
            CaptureState::Idle => Quiet::Now,
            CaptureState::Capturing => Quiet::WhileCapturing,
            CaptureState::Settling { until } => Quiet::At(until),
        }
    }
}

/// Held while a photo is being captured for one service
pub struct CaptureGuard {
    gate: Arc<SettleGate>,
    service_id: String,
}

impl CaptureGuard {
    pub fn service_id(&self) -> &str {
        &self.service_id
    }
}

impl Drop for CaptureGuard {
    fn drop(&mut self) {
        self.gate.end_capture(&self.service_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gate() -> Arc<SettleGate> {
        Arc::new(SettleGate::new(Duration::from_millis(2500)))
    }

    #[tokio::test(start_paused = true)]
    async fn test_capture_state_machine() {
        let gate = gate();
        assert_eq!(gate.state("svc-1"), CaptureState::Idle);

        let guard = gate.begin_capture("svc-1").unwrap();
        assert_eq!(gate.state("svc-1"), CaptureState::Capturing);
        assert_eq!(gate.quiet("svc-1"), Quiet::WhileCapturing);
        assert!(gate.begin_capture("svc-1").is_err());
        // Other services are independent
        assert_eq!(gate.state("svc-2"), CaptureState::Idle);

        // Edits during a capture do not end it
        gate.note_user_mutation("svc-1");
        assert_eq!(gate.state("svc-1"), CaptureState::Capturing);

        drop(guard);
        assert!(matches!(gate.state("svc-1"), CaptureState::Settling { .. }));

        tokio::time::advance(Duration::from_millis(2600)).await;
        assert_eq!(gate.state("svc-1"), CaptureState::Idle);
        assert_eq!(gate.quiet("svc-1"), Quiet::Now);
    }

    #[tokio::test(start_paused = true)]
    async fn test_user_mutation_extends_cooldown() {
        let gate = gate();
        gate.note_user_mutation("svc-1");
        tokio::time::advance(Duration::from_millis(2000)).await;
        gate.note_user_mutation("svc-1");
        tokio::time::advance(Duration::from_millis(2000)).await;

        // 4s after the first edit, 2s after the second
        assert!(matches!(gate.state("svc-1"), CaptureState::Settling { .. }));
        tokio::time::advance(Duration::from_millis(600)).await;
        assert_eq!(gate.state("svc-1"), CaptureState::Idle);
    }
}
