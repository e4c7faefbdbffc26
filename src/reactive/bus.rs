use tokio::sync::broadcast;

/// Table a change touched
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeTable {
    Fields,
    Images,
    Queue,
}

/// Who caused a change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeOrigin {
    /// A user edit on this device
    User,
    /// The sync worker (remaps, upload results)
    Sync,
    /// Records pulled from the server
    Server,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    pub service_id: String,
    /// `None` when the change spans categories
    pub category: Option<String>,
    pub table: ChangeTable,
    pub origin: ChangeOrigin,
}

impl ChangeEvent {
    pub fn new(
        service_id: impl Into<String>,
        category: Option<String>,
        table: ChangeTable,
        origin: ChangeOrigin,
    ) -> Self {
        Self {
            service_id: service_id.into(),
            category,
            table,
            origin,
        }
    }
}

/// What a live query listens to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Scope {
    pub service_id: String,
    pub category: Option<String>,
    pub table: ChangeTable,
}

impl Scope {
    pub fn matches(&self, event: &ChangeEvent) -> bool {
        if event.service_id != self.service_id || event.table != self.table {
            return false;
        }
        match (&self.category, &event.category) {
            (Some(wanted), Some(changed)) => wanted == changed,
            _ => true,
        }
    }
}

/// Broadcast channel for committed changes
pub struct ChangeBus {
    sender: broadcast::Sender<ChangeEvent>,
}

impl ChangeBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn publish(&self, event: ChangeEvent) {
        log::trace!("change {:?}", event);
        // No subscribers is fine
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.sender.subscribe()
    }
}

impl Default for ChangeBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scope_matching() {
        let scope = Scope {
            service_id: "svc-1".into(),
            category: Some("Roof".into()),
            table: ChangeTable::Fields,
        };
        let ev = |svc: &str, cat: Option<&str>, table| {
            ChangeEvent::new(svc, cat.map(String::from), table, ChangeOrigin::User)
        };

        assert!(scope.matches(&ev("svc-1", Some("Roof"), ChangeTable::Fields)));
        assert!(scope.matches(&ev("svc-1", None, ChangeTable::Fields)));
        assert!(!scope.matches(&ev("svc-1", Some("Walls"), ChangeTable::Fields)));
        assert!(!scope.matches(&ev("svc-2", Some("Roof"), ChangeTable::Fields)));
        assert!(!scope.matches(&ev("svc-1", Some("Roof"), ChangeTable::Images)));
    }

    #[test]
    fn test_publish_without_subscribers() {
        let bus = ChangeBus::default();
        bus.publish(ChangeEvent::new("svc-1", None, ChangeTable::Queue, ChangeOrigin::Sync));

        let mut rx = bus.subscribe();
        bus.publish(ChangeEvent::new("svc-1", None, ChangeTable::Queue, ChangeOrigin::Sync));
        assert_eq!(rx.try_recv().unwrap().table, ChangeTable::Queue);
    }
}
