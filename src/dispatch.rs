//! Event dispatch: priority-ordered handler registry.
//!
//! Handlers register under an event kind with an integer priority; lower
//! priorities fire first, ties preserve registration order within a scope.
//! Global handlers fire for every connection; scoped handlers fire only for
//! their connection, merged with the global list by priority rather than
//! run as a separate pass, with global handlers winning priority ties. Dispatch snapshots the merged list before invoking
//! anything, so a handler may add or remove handlers (itself included)
//! without corrupting the in-flight iteration.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::conn::{Connection, ConnectionId};
use crate::event::Event;

/// Handler callback signature.
///
/// A returned error is caught, reported, and isolated to this handler; the
/// remaining handlers for the event still run.
pub type Handler = Arc<dyn Fn(&Connection, &Event) -> anyhow::Result<()> + Send + Sync>;

/// Identifies a registered handler for removal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

struct Registration {
    id: HandlerId,
    priority: i32,
    seq: u64,
    handler: Handler,
}

#[derive(Default)]
struct Tables {
    global: HashMap<String, Vec<Registration>>,
    scoped: HashMap<(ConnectionId, String), Vec<Registration>>,
}

/// Shared handler registry, one per engine.
#[derive(Default)]
pub struct Dispatcher {
    tables: Mutex<Tables>,
    seq: AtomicU64,
}

impl Dispatcher {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::Relaxed)
    }

    /// Register a handler for every connection's events of `kind`.
    pub fn add_global(&self, kind: &str, priority: i32, handler: Handler) -> HandlerId {
        let seq = self.next_seq();
        let id = HandlerId(seq);
        self.tables
            .lock()
            .global
            .entry(kind.to_owned())
            .or_default()
            .push(Registration {
                id,
                priority,
                seq,
                handler,
            });
        id
    }

    /// Register a handler for one connection's events of `kind`.
    pub fn add_scoped(
        &self,
        conn: ConnectionId,
        kind: &str,
        priority: i32,
        handler: Handler,
    ) -> HandlerId {
        let seq = self.next_seq();
        let id = HandlerId(seq);
        self.tables
            .lock()
            .scoped
            .entry((conn, kind.to_owned()))
            .or_default()
            .push(Registration {
                id,
                priority,
                seq,
                handler,
            });
        id
    }

    /// Remove a handler by id. Returns whether it was found.
    pub fn remove(&self, id: HandlerId) -> bool {
        let mut tables = self.tables.lock();
        for list in tables.global.values_mut() {
            if let Some(pos) = list.iter().position(|r| r.id == id) {
                list.remove(pos);
                return true;
            }
        }
        for list in tables.scoped.values_mut() {
            if let Some(pos) = list.iter().position(|r| r.id == id) {
                list.remove(pos);
                return true;
            }
        }
        false
    }

    /// Drop all handlers scoped to a connection.
    pub fn remove_scoped(&self, conn: ConnectionId) {
        self.tables.lock().scoped.retain(|(c, _), _| *c != conn);
    }

    /// Dispatch an event to the merged global + scoped handler list.
    ///
    /// Returns the handler failures, if any; every snapshot handler runs
    /// regardless of earlier failures.
    pub fn dispatch(&self, conn: &Connection, event: &Event) -> Vec<(HandlerId, anyhow::Error)> {
        // Scope breaks priority ties: global handlers run before scoped
        // handlers of the same priority.
        let snapshot: Vec<(i32, u8, u64, HandlerId, Handler)> = {
            let tables = self.tables.lock();
            let global = tables
                .global
                .get(&event.kind)
                .into_iter()
                .flatten()
                .map(|r| (r.priority, 0u8, r.seq, r.id, r.handler.clone()));
            let scoped = tables
                .scoped
                .get(&(conn.id(), event.kind.clone()))
                .into_iter()
                .flatten()
                .map(|r| (r.priority, 1u8, r.seq, r.id, r.handler.clone()));
            let mut merged: Vec<_> = global.chain(scoped).collect();
            merged.sort_by_key(|&(priority, scope, seq, _, _)| (priority, scope, seq));
            merged
        };

        let mut failures = Vec::new();
        for (_, _, _, id, handler) in snapshot {
            if let Err(err) = handler(conn, event) {
                tracing::warn!(event = %event.kind, error = %err, "handler failed");
                failures.push((id, err));
            }
        }
        failures
    }
}
