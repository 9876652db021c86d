//! The engine: connection registry, event drain, and scheduler pump.
//!
//! A [`Client`] owns the pieces every connection shares: the handler
//! [`Dispatcher`], the [`Scheduler`], and the event queue the connection
//! tasks feed. Events are not dispatched from the reader tasks; they are
//! drained by [`Client::process_once`] (or the [`Client::process_forever`]
//! loop), so handlers always run on the caller's task and never race each
//! other.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::{debug, info, trace};

use crate::config::{ClientConfig, ServerSpec};
use crate::conn::{self, Connection, ConnectionId};
use crate::dispatch::{Dispatcher, Handler, HandlerId};
use crate::error::{ClientError, Result};
use crate::event::Event;
use crate::schedule::Scheduler;

/// One event waiting to be dispatched, paired with its connection.
pub(crate) struct Queued {
    pub(crate) conn: Connection,
    pub(crate) event: Event,
}

/// State shared between the engine and its connection tasks.
pub(crate) struct Shared {
    pub(crate) dispatcher: Dispatcher,
    pub(crate) scheduler: Scheduler,
    pub(crate) events_tx: mpsc::UnboundedSender<Queued>,
    pub(crate) config: ClientConfig,
}

impl Shared {
    pub(crate) fn new(config: ClientConfig) -> (Arc<Self>, mpsc::UnboundedReceiver<Queued>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Self {
            dispatcher: Dispatcher::new(),
            scheduler: Scheduler::new(config.scheduler),
            events_tx,
            config,
        });
        (shared, events_rx)
    }
}

/// The IRC client engine.
pub struct Client {
    shared: Arc<Shared>,
    connections: DashMap<ConnectionId, Connection>,
    events_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Queued>>,
    next_id: AtomicU64,
}

impl Client {
    pub fn new(config: ClientConfig) -> Self {
        let (shared, events_rx) = Shared::new(config);
        Self {
            shared,
            connections: DashMap::new(),
            events_rx: tokio::sync::Mutex::new(events_rx),
            next_id: AtomicU64::new(1),
        }
    }

    /// The shared handler registry.
    pub fn dispatcher(&self) -> &Dispatcher {
        &self.shared.dispatcher
    }

    /// The shared scheduler. Commands run inside `process_once`.
    pub fn scheduler(&self) -> &Scheduler {
        &self.shared.scheduler
    }

    /// Register a handler for `kind` on every connection.
    pub fn add_global_handler(
        &self,
        kind: &str,
        priority: i32,
        handler: impl Fn(&Connection, &Event) -> anyhow::Result<()> + Send + Sync + 'static,
    ) -> HandlerId {
        self.shared
            .dispatcher
            .add_global(kind, priority, Arc::new(handler) as Handler)
    }

    /// Register a handler for `kind` scoped to one connection.
    pub fn add_handler(
        &self,
        conn: ConnectionId,
        kind: &str,
        priority: i32,
        handler: impl Fn(&Connection, &Event) -> anyhow::Result<()> + Send + Sync + 'static,
    ) -> HandlerId {
        self.shared
            .dispatcher
            .add_scoped(conn, kind, priority, Arc::new(handler) as Handler)
    }

    pub fn remove_handler(&self, id: HandlerId) -> bool {
        self.shared.dispatcher.remove(id)
    }

    /// Open a connection to `spec` and start its IO tasks.
    ///
    /// Returns once the transport is up and the handshake is queued;
    /// registration completion arrives as a `registered` event.
    pub async fn connect(&self, spec: ServerSpec) -> Result<Connection> {
        let id = ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        info!(%id, host = %spec.host, port = spec.port, tls = spec.tls, "connecting");
        let conn = Connection::new(id, spec, Arc::clone(&self.shared));
        self.connections.insert(id, conn.clone());
        match conn::start(conn.clone()).await {
            Ok(()) => Ok(conn),
            Err(err) => {
                self.connections.remove(&id);
                Err(err)
            }
        }
    }

    pub fn connection(&self, id: ConnectionId) -> Option<Connection> {
        self.connections.get(&id).map(|c| c.value().clone())
    }

    pub fn connections(&self) -> Vec<Connection> {
        self.connections.iter().map(|c| c.value().clone()).collect()
    }

    /// Drop a closed connection from the registry and remove its scoped
    /// handlers.
    pub fn forget(&self, id: ConnectionId) {
        self.connections.remove(&id);
        self.shared.dispatcher.remove_scoped(id);
    }

    /// Run due scheduled commands, then drain and dispatch queued events.
    ///
    /// With `wait`, blocks up to that long for the first event; without it,
    /// returns immediately after draining whatever is queued. Returns the
    /// number of events dispatched. Fails with
    /// [`ClientError::AlreadyProcessing`] if another task is draining.
    pub async fn process_once(&self, wait: Option<Duration>) -> Result<usize> {
        let mut rx = self
            .events_rx
            .try_lock()
            .map_err(|_| ClientError::AlreadyProcessing)?;
        self.shared.scheduler.run_pending();

        let mut dispatched = 0;
        let first = match wait {
            None => rx.try_recv().ok(),
            Some(wait) => tokio::time::timeout(wait, rx.recv()).await.ok().flatten(),
        };
        if let Some(queued) = first {
            self.deliver(queued);
            dispatched += 1;
        }
        while let Ok(queued) = rx.try_recv() {
            self.deliver(queued);
            dispatched += 1;
        }

        // Handlers may have scheduled work that is already due.
        self.shared.scheduler.run_pending();
        Ok(dispatched)
    }

    /// Drive the engine until an error: pump the scheduler and dispatch
    /// events as they arrive, sleeping no longer than the next due command.
    pub async fn process_forever(&self) -> Result<()> {
        const IDLE_WAIT: Duration = Duration::from_millis(200);
        loop {
            let wait = match self.shared.scheduler.next_due() {
                Some(due) => due
                    .saturating_duration_since(std::time::Instant::now())
                    .min(IDLE_WAIT),
                None => IDLE_WAIT,
            };
            self.process_once(Some(wait)).await?;
        }
    }

    /// Send QUIT on every connection and disable their reconnects.
    pub fn disconnect_all(&self, message: &str) {
        for conn in self.connections.iter() {
            conn.quit(message);
        }
    }

    fn deliver(&self, queued: Queued) {
        trace!(id = %queued.conn.id(), kind = %queued.event.kind, "dispatch");
        let failures = self
            .shared
            .dispatcher
            .dispatch(&queued.conn, &queued.event);
        // Handler failures become error events, except for failures while
        // already handling an error event (no recursion).
        if queued.event.kind != "error" {
            for (id, err) in failures {
                debug!(handler = ?id, %err, kind = %queued.event.kind, "handler failed");
                let event = Event::internal(
                    "error",
                    vec![format!("handler failed during {}: {err}", queued.event.kind)],
                );
                let _ = self.shared.events_tx.send(Queued {
                    conn: queued.conn.clone(),
                    event,
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn harness() -> (Client, Connection) {
        let client = Client::new(ClientConfig::default());
        let id = ConnectionId(client.next_id.fetch_add(1, Ordering::Relaxed));
        let conn = Connection::new(
            id,
            ServerSpec::new("irc.test.invalid", 6667, "tester"),
            Arc::clone(&client.shared),
        );
        client.connections.insert(id, conn.clone());
        (client, conn)
    }

    #[tokio::test]
    async fn drains_queued_events_in_order() {
        let (client, conn) = harness();
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let log = Arc::clone(&seen);
        client.add_global_handler("pubmsg", 0, move |_, ev| {
            log.lock().push(ev.arguments[0].clone());
            Ok(())
        });
        conn.process_line(":a!u@h PRIVMSG #room :one");
        conn.process_line(":a!u@h PRIVMSG #room :two");
        let n = client.process_once(None).await.unwrap();
        // Two raw events plus two pubmsg events.
        assert_eq!(n, 4);
        assert_eq!(*seen.lock(), vec!["one".to_owned(), "two".to_owned()]);
    }

    #[tokio::test]
    async fn handler_failure_becomes_error_event() {
        let (client, conn) = harness();
        client.add_global_handler("pubmsg", 0, |_, _| anyhow::bail!("boom"));
        let errors = Arc::new(AtomicUsize::new(0));
        let count = Arc::clone(&errors);
        client.add_global_handler("error", 0, move |_, _| {
            count.fetch_add(1, Ordering::Relaxed);
            Ok(())
        });
        conn.process_line(":a!u@h PRIVMSG #room :hi");
        client.process_once(None).await.unwrap();
        // The synthesized error event is queued during the drain and is
        // delivered by the same call.
        assert_eq!(errors.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn failing_error_handler_does_not_recurse() {
        let (client, conn) = harness();
        client.add_global_handler("error", 0, |_, _| anyhow::bail!("again"));
        conn.process_line(":prefix-without-command");
        // One pass delivers the raw event and the parse-error event; the
        // failing error handler must not generate more error events.
        let n = client.process_once(None).await.unwrap();
        assert_eq!(n, 2);
        let n = client.process_once(None).await.unwrap();
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn concurrent_drain_is_rejected() {
        let (client, _conn) = harness();
        let guard = client.events_rx.try_lock().unwrap();
        let err = client.process_once(None).await.unwrap_err();
        assert!(matches!(err, ClientError::AlreadyProcessing));
        drop(guard);
        assert!(client.process_once(None).await.is_ok());
    }

    #[tokio::test]
    async fn scheduler_runs_inside_process_once() {
        let (client, _conn) = harness();
        let fired = Arc::new(AtomicUsize::new(0));
        let count = Arc::clone(&fired);
        client.scheduler().after(Duration::ZERO, move || {
            count.fetch_add(1, Ordering::Relaxed);
            Ok(())
        });
        client.process_once(None).await.unwrap();
        assert_eq!(fired.load(Ordering::Relaxed), 1);
    }
}
