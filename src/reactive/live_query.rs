use super::bus::{ChangeEvent, Scope};
use super::gate::{Quiet, SettleGate};
use crate::error::AppError;
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

/// Query result that follows the store
///
/// Emissions are settled: edits, captures and their cooldown collapse into
/// one update carrying the final state. Identical results are not emitted.
/// Dropping the handle stops the background task.
pub struct LiveQuery<T> {
    rx: watch::Receiver<T>,
    task: JoinHandle<()>,
}

impl<T: Clone> LiveQuery<T> {
    pub fn current(&self) -> T {
        self.rx.borrow().clone()
    }

    /// Waits for the next emission; `None` once the query has stopped
    pub async fn changed(&mut self) -> Option<T> {
        self.rx.changed().await.ok()?;
        Some(self.rx.borrow_and_update().clone())
    }

    pub fn subscribe(&self) -> watch::Receiver<T> {
        self.rx.clone()
    }
}

impl<T> Drop for LiveQuery<T> {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Runs `query` once now and again after matching changes settle
///
/// Must be called within a tokio runtime.
pub(crate) fn spawn_live_query<T, F>(
    mut events: broadcast::Receiver<ChangeEvent>,
    gate: Arc<SettleGate>,
    scope: Scope,
    query: F,
) -> Result<LiveQuery<T>, AppError>
where
    T: Clone + PartialEq + Send + Sync + 'static,
    F: Fn() -> Result<T, AppError> + Send + 'static,
{
    let initial = query()?;
    let (tx, rx) = watch::channel(initial);

    let task = tokio::spawn(async move {
        let mut stale = false;
        loop {
            if !stale {
                let event = events.recv().await;
                if !absorb(event, &scope, &mut stale) {
                    break;
                }
                continue;
            }

            let event = match gate.quiet(&scope.service_id) {
                Quiet::Now => {
                    stale = false;
                    refresh(&tx, &query);
                    continue;
                }
                Quiet::At(deadline) => tokio::select! {
                    _ = tokio::time::sleep_until(deadline) => continue,
                    event = events.recv() => event,
                },
                // Poll while a capture holds the gate
                Quiet::WhileCapturing => tokio::select! {
                    _ = tokio::time::sleep(gate.cooldown()) => continue,
                    event = events.recv() => event,
                },
            };
            if !absorb(event, &scope, &mut stale) {
                break;
            }
        }
    });

    Ok(LiveQuery { rx, task })
}

/// Marks the query stale for matching events; false once the bus is gone
fn absorb(
    event: Result<ChangeEvent, broadcast::error::RecvError>,
    scope: &Scope,
    stale: &mut bool,
) -> bool {
    match event {
        Ok(event) => {
            if scope.matches(&event) {
                *stale = true;
            }
            true
        }
        Err(broadcast::error::RecvError::Lagged(missed)) => {
            log::debug!("Live query lagged by {} events", missed);
            *stale = true;
            true
        }
        Err(broadcast::error::RecvError::Closed) => false,
    }
}

fn refresh<T, F>(tx: &watch::Sender<T>, query: &F)
where
    T: PartialEq,
    F: Fn() -> Result<T, AppError>,
{
    match query() {
        Ok(value) => {
            tx.send_if_modified(|current| {
                if *current == value {
                    false
                } else {
                    *current = value;
                    true
                }
            });
        }
        Err(e) => log::warn!("Live query refresh failed: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactive::bus::{ChangeBus, ChangeOrigin, ChangeTable};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn scope() -> Scope {
        Scope {
            service_id: "svc-1".into(),
            category: None,
            table: ChangeTable::Fields,
        }
    }

    fn event() -> ChangeEvent {
        ChangeEvent::new("svc-1", None, ChangeTable::Fields, ChangeOrigin::Sync)
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_change_emits_promptly() {
        let bus = ChangeBus::default();
        let gate = Arc::new(SettleGate::new(Duration::from_millis(2500)));
        let source = Arc::new(AtomicUsize::new(1));

        let src = source.clone();
        let mut live = spawn_live_query(bus.subscribe(), gate, scope(), move || {
            Ok(src.load(Ordering::SeqCst))
        })
        .unwrap();
        assert_eq!(live.current(), 1);

        source.store(2, Ordering::SeqCst);
        bus.publish(event());
        assert_eq!(live.changed().await, Some(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unmatched_and_identical_changes_are_silent() {
        let bus = ChangeBus::default();
        let gate = Arc::new(SettleGate::new(Duration::from_millis(2500)));
        let live = spawn_live_query(bus.subscribe(), gate, scope(), || Ok(7u32)).unwrap();
        let mut rx = live.subscribe();

        bus.publish(event());
        bus.publish(ChangeEvent::new("svc-2", None, ChangeTable::Fields, ChangeOrigin::User));
        tokio::time::sleep(Duration::from_secs(5)).await;

        assert!(!rx.has_changed().unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_capture_holds_refresh_until_settled() {
        let bus = ChangeBus::default();
        let gate = Arc::new(SettleGate::new(Duration::from_millis(2500)));
        let source = Arc::new(AtomicUsize::new(0));

        let src = source.clone();
        let live = spawn_live_query(bus.subscribe(), gate.clone(), scope(), move || {
            Ok(src.load(Ordering::SeqCst))
        })
        .unwrap();
        let mut rx = live.subscribe();

        let guard = gate.begin_capture("svc-1").unwrap();
        source.store(1, Ordering::SeqCst);
        bus.publish(event());
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(!rx.has_changed().unwrap());

        drop(guard);
        tokio::time::sleep(Duration::from_millis(1000)).await;
        assert!(!rx.has_changed().unwrap());

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(rx.has_changed().unwrap());
        assert_eq!(*rx.borrow_and_update(), 1);
    }
}
