//! Async IRC client protocol engine.
//!
//! The engine manages any number of server connections over TCP or TLS,
//! turns inbound lines into typed [`Event`]s, and dispatches them through a
//! priority-ordered handler registry. Alongside dispatch it carries the
//! plumbing a long-lived client needs: a scheduler for periodic commands, a
//! token-bucket pacer for outbound lines, exponential reconnect backoff,
//! ISUPPORT feature tracking, channel membership tracking, and CTCP/DCC
//! sideband sessions.
//!
//! Wire-level concerns (message parsing, CTCP quoting, line decoding) live
//! in the [`slirc_wire`] crate, re-exported here as [`wire`].
//!
//! # Example
//!
//! ```no_run
//! use slirc_client::{Client, ClientConfig, ServerSpec};
//!
//! # async fn run() -> slirc_client::Result<()> {
//! let client = Client::new(ClientConfig::default());
//! client.add_global_handler("registered", 0, |conn, _event| {
//!     conn.join("#rust", None)?;
//!     Ok(())
//! });
//! client.add_global_handler("pubmsg", 0, |_conn, event| {
//!     let who = event.source.as_ref().and_then(|s| s.nick()).unwrap_or("?");
//!     println!("<{}> {}", who, event.arguments[0]);
//!     Ok(())
//! });
//! client
//!     .connect(ServerSpec::new("irc.libera.chat", 6697, "slirc").with_tls(true))
//!     .await?;
//! client.process_forever().await
//! # }
//! ```
//!
//! # Error taxonomy
//!
//! Engine calls fail synchronously with [`ClientError`] (bad outbound line,
//! not connected, TLS setup). Asynchronous failures never surface as
//! `Result`s: transport drops become `disconnect` events, undecodable or
//! unparseable lines become `error` events, and handler failures are
//! collected and re-dispatched as `error` events. A failing handler never
//! prevents later handlers from running.

#![deny(clippy::all)]

pub mod channels;
pub mod client;
pub mod config;
pub mod conn;
pub mod dcc;
pub mod dispatch;
pub mod error;
pub mod event;
pub mod ratelimit;
pub mod reconnect;
pub mod schedule;

pub use slirc_wire as wire;

pub use self::channels::{ChannelState, ChannelTracker, Privilege};
pub use self::client::Client;
pub use self::config::{ClientConfig, KeepaliveConfig, ServerSpec};
pub use self::conn::{ConnState, Connection, ConnectionId};
pub use self::dcc::{DccConnection, PendingDcc};
pub use self::dispatch::{Dispatcher, Handler, HandlerId};
pub use self::error::{ClientError, Result};
pub use self::event::{numeric_name, Event};
pub use self::ratelimit::RateLimit;
pub use self::reconnect::ReconnectPolicy;
pub use self::schedule::{CommandId, Scheduler, SchedulerConfig};
