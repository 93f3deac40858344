//! Invalidation events
//!
//! The surrounding system publishes events on an [`EventBus`] it owns and
//! hands to the cache at construction. Subscriptions hold only a weak
//! reference to their listener and end when the [`Subscription`] is dropped,
//! so the bus never keeps a cache alive.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use tracing::trace;

/// Whoever triggers an administrative cache operation
pub trait Principal: Send + Sync + fmt::Debug {
    /// The caller has administrative rights
    fn is_admin(&self) -> bool;

    /// The call originates from the event system rather than a user
    fn is_event_controlled(&self) -> bool {
        false
    }
}

/// Plain [`Principal`] with fixed answers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Caller {
    /// Administrative rights
    pub admin: bool,
    /// Event-controlled context
    pub event_controlled: bool,
}

impl Caller {
    /// An administrator
    pub const ADMIN: Caller = Caller {
        admin: true,
        event_controlled: false,
    };

    /// An ordinary user
    pub const GUEST: Caller = Caller {
        admin: false,
        event_controlled: false,
    };

    /// The event system itself
    pub const SYSTEM: Caller = Caller {
        admin: false,
        event_controlled: true,
    };
}

impl Principal for Caller {
    fn is_admin(&self) -> bool {
        self.admin
    }

    fn is_event_controlled(&self) -> bool {
        self.event_controlled
    }
}

/// Part of the cache a clear request targets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClearAction {
    /// Keys and entries of both projects
    All,
    /// Entries of both projects, keys stay
    Entries,
    /// Keys and entries of the online project
    OnlineAll,
    /// Entries of the online project
    OnlineEntries,
    /// Keys and entries of the offline project
    OfflineAll,
    /// Entries of the offline project
    OfflineEntries,
}

impl ClearAction {
    /// Numeric action code carried by clear events
    pub fn code(self) -> i32 {
        match self {
            ClearAction::All => 0,
            ClearAction::Entries => 1,
            ClearAction::OnlineAll => 2,
            ClearAction::OnlineEntries => 3,
            ClearAction::OfflineAll => 4,
            ClearAction::OfflineEntries => 5,
        }
    }
}

impl TryFrom<i32> for ClearAction {
    type Error = i32;

    fn try_from(code: i32) -> Result<Self, Self::Error> {
        match code {
            0 => Ok(ClearAction::All),
            1 => Ok(ClearAction::Entries),
            2 => Ok(ClearAction::OnlineAll),
            3 => Ok(ClearAction::OnlineEntries),
            4 => Ok(ClearAction::OfflineAll),
            5 => Ok(ClearAction::OfflineEntries),
            other => Err(other),
        }
    }
}

/// Event published by the surrounding system
#[derive(Debug, Clone)]
pub enum Event {
    /// A project was published
    PublishProject,
    /// All caches should be dropped
    ClearCaches,
    /// Materialized output should be deleted and the cache dropped
    PurgeRepository {
        /// Who asked for the purge
        principal: Arc<dyn Principal>,
    },
    /// Part of the cache should be dropped
    CacheClear {
        /// Who asked for the clear
        principal: Arc<dyn Principal>,
        /// [`ClearAction`] code; unknown codes are ignored
        action: i32,
    },
}

/// Receiver of published events
pub trait EventListener: Send + Sync {
    /// Handle one event; runs on the publishing thread
    fn on_event(&self, event: &Event);
}

/// Fan-out of events to subscribed listeners
#[derive(Default)]
pub struct EventBus {
    next_id: AtomicU64,
    listeners: RwLock<Vec<(u64, Weak<dyn EventListener>)>>,
}

impl EventBus {
    /// Create an empty bus
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a listener until the returned subscription is dropped
    pub fn subscribe(self: &Arc<Self>, listener: Weak<dyn EventListener>) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.listeners.write().push((id, listener));
        trace!(id, "event listener subscribed");
        Subscription {
            bus: Arc::downgrade(self),
            id,
        }
    }

    /// Deliver an event to every live listener, returning how many got it
    pub fn publish(&self, event: &Event) -> usize {
        // Listeners run without the lock held so they may (un)subscribe
        let live: Vec<Arc<dyn EventListener>> = self
            .listeners
            .read()
            .iter()
            .filter_map(|(_, listener)| listener.upgrade())
            .collect();

        for listener in &live {
            listener.on_event(event);
        }
        live.len()
    }

    /// Number of registered subscriptions
    pub fn listener_count(&self) -> usize {
        self.listeners.read().len()
    }

    fn unsubscribe(&self, id: u64) {
        self.listeners.write().retain(|(other, _)| *other != id);
        trace!(id, "event listener unsubscribed");
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("listeners", &self.listener_count())
            .finish()
    }
}

/// Live registration on an [`EventBus`]
#[derive(Debug)]
pub struct Subscription {
    bus: Weak<EventBus>,
    id: u64,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.unsubscribe(self.id);
        }
    }
}
