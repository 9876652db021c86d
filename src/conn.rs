//! One server connection: transport, registration, and event synthesis.
//!
//! A [`Connection`] is a cheap cloneable handle around shared state. The
//! reader task turns every inbound line into one or more [`Event`]s on the
//! engine's queue; the writer task paces outbound lines through the token
//! bucket. Lifecycle transitions (`connect`, `registered`, `disconnect`,
//! `reconnect_scheduled`) are synthesized as events on the same queue, so
//! handlers observe a single ordered stream per connection.
//!
//! Registration completion is announced once: after the welcome numeric and
//! either the first message that is not part of the feature burst or the
//! registration deadline, whichever comes first. This guarantees the feature
//! table is fully populated when the `registered` event fires.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::time::Instant;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig as TlsConfig, RootCertStore};
use tokio_rustls::TlsConnector;
use tokio_util::codec::Framed;
use tracing::{debug, trace, warn};

use slirc_wire::{
    ctcp, irc_eq, is_channel_name, DccOffer, DecodedLine, FeatureTable, LineCodec, Message, Source,
};

use crate::channels::{ChannelState, ChannelTracker};
use crate::client::{Queued, Shared};
use crate::config::ServerSpec;
use crate::dcc::PendingDcc;
use crate::error::{ClientError, Result};
use crate::event::{numeric_name, Event};
use crate::ratelimit::{RateLimit, TokenBucket};
use crate::reconnect::Backoff;
use crate::schedule::CommandId;

/// Identifies one connection for handler scoping and logging.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub(crate) u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Connection lifecycle state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnState {
    /// Transport being established.
    Connecting,
    /// Transport up, handshake sent, waiting for the welcome numeric.
    Registering,
    /// Registration announced; normal operation.
    Active,
    /// Graceful shutdown requested; queued writes are draining.
    Closing,
    /// No transport and no attempt pending.
    Disconnected,
    /// A reconnect attempt is scheduled.
    Reconnecting,
}

#[derive(Default)]
struct RegProgress {
    welcome: bool,
    features_seen: bool,
    announced: bool,
    deadline: Option<CommandId>,
}

enum Outbound {
    Line(String),
    Close,
}

pub(crate) struct ConnInner {
    id: ConnectionId,
    spec: ServerSpec,
    shared: Arc<Shared>,
    state: Mutex<ConnState>,
    nickname: Mutex<String>,
    server_name: Mutex<Option<String>>,
    features: Mutex<FeatureTable>,
    channels: Mutex<ChannelTracker>,
    registration: Mutex<RegProgress>,
    backoff: Mutex<Option<Backoff>>,
    out_tx: Mutex<Option<mpsc::UnboundedSender<Outbound>>>,
    shutdown: Mutex<Option<watch::Sender<bool>>>,
    keepalive: Mutex<Option<CommandId>>,
    last_traffic: Mutex<Instant>,
    local_addr: Mutex<Option<SocketAddr>>,
    pending_dcc: Mutex<Vec<PendingDcc>>,
}

/// Handle to one server connection. Clones share the same state.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnInner>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("host", &self.inner.spec.host)
            .field("state", &self.state())
            .finish()
    }
}

impl Connection {
    pub(crate) fn new(id: ConnectionId, spec: ServerSpec, shared: Arc<Shared>) -> Self {
        let backoff = shared.config.reconnect.map(Backoff::new);
        let nickname = spec.nickname.clone();
        Self {
            inner: Arc::new(ConnInner {
                id,
                spec,
                shared,
                state: Mutex::new(ConnState::Disconnected),
                nickname: Mutex::new(nickname),
                server_name: Mutex::new(None),
                features: Mutex::new(FeatureTable::new()),
                channels: Mutex::new(ChannelTracker::default()),
                registration: Mutex::new(RegProgress::default()),
                backoff: Mutex::new(backoff),
                out_tx: Mutex::new(None),
                shutdown: Mutex::new(None),
                keepalive: Mutex::new(None),
                last_traffic: Mutex::new(Instant::now()),
                local_addr: Mutex::new(None),
                pending_dcc: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.inner.id
    }

    /// The endpoint this connection was created for.
    pub fn server_spec(&self) -> &ServerSpec {
        &self.inner.spec
    }

    pub fn state(&self) -> ConnState {
        *self.inner.state.lock()
    }

    /// Whether the transport is up (registering or active).
    pub fn is_connected(&self) -> bool {
        matches!(self.state(), ConnState::Registering | ConnState::Active)
    }

    /// The nickname currently in effect, tracking server-acknowledged changes.
    pub fn nickname(&self) -> String {
        self.inner.nickname.lock().clone()
    }

    /// The server name learned from message prefixes, falling back to the
    /// configured host.
    pub fn server_name(&self) -> String {
        self.inner
            .server_name
            .lock()
            .clone()
            .unwrap_or_else(|| self.inner.spec.host.clone())
    }

    /// Snapshot of the advertised feature table.
    pub fn features(&self) -> FeatureTable {
        self.inner.features.lock().clone()
    }

    /// Names of the channels this connection is currently joined to.
    pub fn channels(&self) -> Vec<String> {
        self.inner.channels.lock().channels()
    }

    /// Snapshot of one joined channel's membership.
    pub fn channel(&self, name: &str) -> Option<ChannelState> {
        self.inner.channels.lock().get(name).cloned()
    }

    /// DCC offers received and not yet accepted.
    pub fn pending_dcc_offers(&self) -> Vec<PendingDcc> {
        self.inner.pending_dcc.lock().clone()
    }

    pub(crate) fn local_addr(&self) -> Option<SocketAddr> {
        *self.inner.local_addr.lock()
    }

    pub(crate) fn take_dcc_offer(&self, argument: &str) -> Option<PendingDcc> {
        let mut pending = self.inner.pending_dcc.lock();
        let idx = pending.iter().position(|p| p.offer.argument == argument)?;
        Some(pending.remove(idx))
    }

    pub(crate) fn push_event(&self, event: Event) {
        let queued = Queued {
            conn: self.clone(),
            event,
        };
        if self.inner.shared.events_tx.send(queued).is_err() {
            trace!(id = %self.inner.id, "event queue closed, dropping event");
        }
    }

    // ----- outbound command surface -----

    /// Queue one raw line. The line must not contain CR, LF, or NUL and must
    /// fit the configured length limit with its terminator.
    pub fn send_raw(&self, line: &str) -> Result<()> {
        slirc_wire::validate_outbound(line, self.inner.shared.config.max_line_len)?;
        let guard = self.inner.out_tx.lock();
        let tx = guard.as_ref().ok_or(ClientError::NotConnected)?;
        tx.send(Outbound::Line(line.to_owned()))
            .map_err(|_| ClientError::NotConnected)
    }

    fn send_message(&self, message: Message) -> Result<()> {
        self.send_raw(&message.to_string())
    }

    pub fn privmsg(&self, target: &str, text: &str) -> Result<()> {
        self.send_message(Message::privmsg(target, text))
    }

    pub fn notice(&self, target: &str, text: &str) -> Result<()> {
        self.send_message(Message::notice(target, text))
    }

    /// Send a CTCP ACTION ("/me") to a channel or nick.
    pub fn action(&self, target: &str, text: &str) -> Result<()> {
        self.ctcp_request(target, "ACTION", Some(text))
    }

    /// Send a CTCP request (PRIVMSG carrying a tagged chunk).
    pub fn ctcp_request(&self, target: &str, tag: &str, data: Option<&str>) -> Result<()> {
        self.privmsg(target, &ctcp::tagged(tag, data))
    }

    /// Send a CTCP reply (NOTICE carrying a tagged chunk).
    pub fn ctcp_reply(&self, target: &str, tag: &str, data: Option<&str>) -> Result<()> {
        self.notice(target, &ctcp::tagged(tag, data))
    }

    pub fn join(&self, channel: &str, key: Option<&str>) -> Result<()> {
        let mut params = vec![channel.to_owned()];
        if let Some(key) = key {
            params.push(key.to_owned());
        }
        self.send_message(Message::new("JOIN", params))
    }

    pub fn part(&self, channel: &str, reason: Option<&str>) -> Result<()> {
        let mut params = vec![channel.to_owned()];
        if let Some(reason) = reason {
            params.push(reason.to_owned());
        }
        self.send_message(Message::new("PART", params))
    }

    pub fn nick(&self, nickname: &str) -> Result<()> {
        self.send_message(Message::new("NICK", vec![nickname.to_owned()]))
    }

    /// Send PASS. Only meaningful before registration completes.
    pub fn pass(&self, password: &str) -> Result<()> {
        self.send_message(Message::new("PASS", vec![password.to_owned()]))
    }

    /// Send USER. Only meaningful before registration completes.
    pub fn user(&self, username: &str, realname: &str) -> Result<()> {
        self.send_message(Message::new(
            "USER",
            vec![
                username.to_owned(),
                "0".to_owned(),
                "*".to_owned(),
                realname.to_owned(),
            ],
        ))
    }

    /// Request or apply a mode change. `modes` is the whole mode string
    /// including arguments, e.g. `"+o alice"`.
    pub fn mode(&self, target: &str, modes: &str) -> Result<()> {
        let mut params = vec![target.to_owned()];
        params.extend(modes.split_whitespace().map(str::to_owned));
        self.send_message(Message::new("MODE", params))
    }

    pub fn names(&self, channels: Option<&str>) -> Result<()> {
        let params = channels.map(|c| vec![c.to_owned()]).unwrap_or_default();
        self.send_message(Message::new("NAMES", params))
    }

    pub fn topic(&self, channel: &str, new_topic: Option<&str>) -> Result<()> {
        let mut params = vec![channel.to_owned()];
        if let Some(topic) = new_topic {
            params.push(topic.to_owned());
        }
        self.send_message(Message::new("TOPIC", params))
    }

    pub fn who(&self, mask: Option<&str>) -> Result<()> {
        let params = mask.map(|m| vec![m.to_owned()]).unwrap_or_default();
        self.send_message(Message::new("WHO", params))
    }

    pub fn whois(&self, targets: &str) -> Result<()> {
        self.send_message(Message::new("WHOIS", vec![targets.to_owned()]))
    }

    pub fn invite(&self, nick: &str, channel: &str) -> Result<()> {
        self.send_message(Message::new(
            "INVITE",
            vec![nick.to_owned(), channel.to_owned()],
        ))
    }

    pub fn kick(&self, channel: &str, nick: &str, comment: Option<&str>) -> Result<()> {
        let mut params = vec![channel.to_owned(), nick.to_owned()];
        if let Some(comment) = comment {
            params.push(comment.to_owned());
        }
        self.send_message(Message::new("KICK", params))
    }

    pub fn oper(&self, name: &str, password: &str) -> Result<()> {
        self.send_message(Message::new(
            "OPER",
            vec![name.to_owned(), password.to_owned()],
        ))
    }

    /// Request IRCv3 capabilities, space separated.
    pub fn cap_req(&self, caps: &str) -> Result<()> {
        self.send_message(Message::new(
            "CAP",
            vec!["REQ".to_owned(), caps.to_owned()],
        ))
    }

    pub fn ping(&self, target: &str) -> Result<()> {
        self.send_message(Message::new("PING", vec![target.to_owned()]))
    }

    pub fn pong(&self, payload: &str) -> Result<()> {
        self.send_message(Message::pong(payload))
    }

    /// Send QUIT and close. Queued writes (including the QUIT) drain first.
    pub fn quit(&self, message: &str) {
        let _ = self.send_message(Message::new("QUIT", vec![message.to_owned()]));
        self.close();
    }

    /// Close the connection and disable automatic reconnect. Idempotent.
    pub fn close(&self) {
        *self.inner.backoff.lock() = None;
        {
            let mut state = self.inner.state.lock();
            match *state {
                ConnState::Disconnected | ConnState::Closing => return,
                ConnState::Reconnecting => {
                    // Drop the pending attempt; the scheduled callback
                    // checks the state before dialing.
                    *state = ConnState::Disconnected;
                    return;
                }
                _ => *state = ConnState::Closing,
            }
        }
        if let Some(tx) = self.inner.out_tx.lock().as_ref() {
            let _ = tx.send(Outbound::Close);
        }
        if let Some(tx) = self.inner.shutdown.lock().as_ref() {
            let _ = tx.send(true);
        }
    }

    // ----- inbound processing -----

    fn process_decoded(&self, decoded: DecodedLine) {
        match decoded {
            DecodedLine::Line(line) => self.process_line(&line),
            DecodedLine::Invalid(err) => {
                warn!(id = %self.inner.id, %err, "undecodable line");
                self.push_event(Event::internal("error", vec![err.to_string()]));
            }
            DecodedLine::TooLong { actual, limit } => {
                warn!(id = %self.inner.id, actual, limit, "oversized line dropped");
                self.push_event(Event::internal(
                    "error",
                    vec![format!("line of {actual} bytes exceeds limit {limit}")],
                ));
            }
        }
    }

    pub(crate) fn process_line(&self, line: &str) {
        *self.inner.last_traffic.lock() = Instant::now();
        trace!(id = %self.inner.id, line, "recv");
        let server = self.inner.server_name.lock().clone();
        self.push_event(Event::new(
            "all_raw_messages",
            server.map(Source::new),
            None,
            vec![line.to_owned()],
        ));
        if line.is_empty() {
            return;
        }
        match line.parse::<Message>() {
            Ok(message) => self.process_message(message),
            Err(err) => {
                warn!(id = %self.inner.id, %err, line, "unparseable line");
                self.push_event(Event::internal(
                    "error",
                    vec![format!("unparseable line: {err}")],
                ));
            }
        }
    }

    fn process_message(&self, msg: Message) {
        let is_numeric = msg.command.len() == 3 && msg.command.bytes().all(|b| b.is_ascii_digit());
        let kind = if is_numeric {
            numeric_name(&msg.command)
                .map(str::to_owned)
                .unwrap_or_else(|| msg.command.clone())
        } else {
            msg.command.to_ascii_lowercase()
        };

        if let Some(src) = &msg.prefix {
            let mut server = self.inner.server_name.lock();
            if server.is_none() && src.is_server() {
                *server = Some(src.as_str().to_owned());
            }
        }

        self.note_registration(&kind);

        let source = msg.prefix.clone();
        let tags: HashMap<String, String> = msg
            .tags
            .iter()
            .map(|t| (t.0.clone(), t.1.clone().unwrap_or_default()))
            .collect();

        match kind.as_str() {
            "ping" => {
                let payload = msg.params.last().cloned().unwrap_or_default();
                let _ = self.pong(&payload);
                self.push_event(
                    Event::new("ping", source, None, msg.params.clone()).with_tags(tags),
                );
            }
            "privmsg" | "notice" => self.handle_chat(&kind, source, &msg, tags),
            _ => {
                self.track_state(&kind, &source, &msg);
                let kind = if kind == "mode"
                    && !msg.params.first().map(|t| is_channel_name(t)).unwrap_or(false)
                {
                    "umode".to_owned()
                } else {
                    kind
                };
                let (target, arguments) = match kind.as_str() {
                    "quit" => (None, msg.params.clone()),
                    "nick" => (msg.params.first().cloned(), Vec::new()),
                    _ => (
                        msg.params.first().cloned(),
                        msg.params.get(1..).unwrap_or_default().to_vec(),
                    ),
                };
                self.push_event(Event::new(kind, source, target, arguments).with_tags(tags));
            }
        }
    }

    /// Fire `registered` exactly once: after 001, on the first message that
    /// is not part of the 005 feature burst.
    fn note_registration(&self, kind: &str) {
        let fire = {
            let mut reg = self.inner.registration.lock();
            match kind {
                "welcome" => {
                    reg.welcome = true;
                    false
                }
                "featurelist" => {
                    reg.features_seen = true;
                    false
                }
                _ => reg.welcome && reg.features_seen && !reg.announced,
            }
        };
        if fire {
            self.announce_registered();
        }
    }

    fn announce_registered(&self) {
        {
            let mut reg = self.inner.registration.lock();
            if reg.announced || !reg.welcome {
                return;
            }
            reg.announced = true;
            if let Some(id) = reg.deadline.take() {
                self.inner.shared.scheduler.cancel(id);
            }
        }
        *self.inner.state.lock() = ConnState::Active;
        if let Some(backoff) = self.inner.backoff.lock().as_mut() {
            backoff.reset();
        }
        self.start_keepalive();
        let nickname = self.nickname();
        debug!(id = %self.inner.id, %nickname, "registration complete");
        self.push_event(Event::internal("registered", vec![nickname]));
    }

    fn registration_deadline(&self) {
        let welcome = {
            let mut reg = self.inner.registration.lock();
            reg.deadline = None;
            reg.welcome && !reg.announced
        };
        if welcome {
            self.announce_registered();
        } else if self.state() == ConnState::Registering {
            warn!(id = %self.inner.id, "registration timed out");
            self.close_transport();
        }
    }

    // Close the transport without disabling reconnect, so the backoff can
    // schedule a fresh attempt.
    fn close_transport(&self) {
        if let Some(tx) = self.inner.shutdown.lock().as_ref() {
            let _ = tx.send(true);
        }
    }

    fn start_keepalive(&self) {
        let Some(keepalive) = self.inner.shared.config.keepalive else {
            return;
        };
        if self.inner.keepalive.lock().is_some() {
            return;
        }
        let weak = Arc::downgrade(&self.inner);
        let stale_after = keepalive.stale_after;
        let scheduled = self
            .inner
            .shared
            .scheduler
            .every_fixed_delay(keepalive.interval, move || {
                let Some(inner) = weak.upgrade() else {
                    return Ok(());
                };
                let conn = Connection { inner };
                let idle = conn.inner.last_traffic.lock().elapsed();
                if idle >= stale_after {
                    warn!(id = %conn.inner.id, ?idle, "connection stale, closing");
                    conn.close_transport();
                } else if conn.is_connected() {
                    let _ = conn.ping(&conn.server_name());
                }
                Ok(())
            });
        match scheduled {
            Ok(id) => *self.inner.keepalive.lock() = Some(id),
            Err(err) => warn!(id = %self.inner.id, %err, "keepalive disabled"),
        }
    }

    fn handle_chat(
        &self,
        command: &str,
        source: Option<Source>,
        msg: &Message,
        tags: HashMap<String, String>,
    ) {
        let Some(target) = msg.params.first().cloned() else {
            return;
        };
        let text = msg.params.get(1).cloned().unwrap_or_default();
        let is_notice = command == "notice";
        for chunk in ctcp::dequote(&text) {
            match chunk {
                ctcp::Chunk::Text(text) => {
                    let kind = match (is_channel_name(&target), is_notice) {
                        (true, false) => "pubmsg",
                        (false, false) => "privmsg",
                        (true, true) => "pubnotice",
                        (false, true) => "privnotice",
                    };
                    self.push_event(
                        Event::new(kind, source.clone(), Some(target.clone()), vec![text])
                            .with_tags(tags.clone()),
                    );
                }
                ctcp::Chunk::Tagged { tag, data } => {
                    if !is_notice && tag == "DCC" {
                        if let Some(offer) = data.as_deref().and_then(DccOffer::parse) {
                            self.note_dcc_offer(source.clone(), &target, offer, tags.clone());
                            continue;
                        }
                    }
                    let kind = if is_notice { "ctcpreply" } else { "ctcp" };
                    let mut arguments = vec![tag.clone()];
                    if let Some(data) = &data {
                        arguments.push(data.clone());
                    }
                    self.push_event(
                        Event::new(kind, source.clone(), Some(target.clone()), arguments)
                            .with_tags(tags.clone()),
                    );
                    if !is_notice && tag == "ACTION" {
                        self.push_event(
                            Event::new(
                                "action",
                                source.clone(),
                                Some(target.clone()),
                                vec![data.unwrap_or_default()],
                            )
                            .with_tags(tags.clone()),
                        );
                    }
                }
            }
        }
    }

    fn note_dcc_offer(
        &self,
        source: Option<Source>,
        target: &str,
        offer: DccOffer,
        tags: HashMap<String, String>,
    ) {
        debug!(id = %self.inner.id, kind = %offer.kind, argument = %offer.argument, "dcc offer");
        let mut arguments = vec![
            offer.kind.as_str().to_owned(),
            offer.argument.clone(),
            offer.address.to_string(),
            offer.port.to_string(),
        ];
        if let Some(size) = offer.size {
            arguments.push(size.to_string());
        }
        self.inner.pending_dcc.lock().push(PendingDcc {
            source: source.clone(),
            offer,
        });
        self.push_event(
            Event::new("dcc_offer", source, Some(target.to_owned()), arguments).with_tags(tags),
        );
    }

    fn track_state(&self, kind: &str, source: &Option<Source>, msg: &Message) {
        let me = self.nickname();
        let from = source.as_ref().and_then(|s| s.nick()).unwrap_or("");
        match kind {
            "welcome" => {
                if let Some(nick) = msg.params.first() {
                    *self.inner.nickname.lock() = nick.clone();
                }
            }
            "featurelist" => {
                if msg.params.len() > 2 {
                    let tokens = &msg.params[1..msg.params.len() - 1];
                    self.inner
                        .features
                        .lock()
                        .load(tokens.iter().map(String::as_str));
                }
            }
            "join" => {
                let Some(channel) = msg.params.first() else {
                    return;
                };
                let mut channels = self.inner.channels.lock();
                if irc_eq(from, &me) {
                    channels.joined(channel);
                }
                channels.user_joined(channel, from);
            }
            "part" => {
                let Some(channel) = msg.params.first() else {
                    return;
                };
                let mut channels = self.inner.channels.lock();
                if irc_eq(from, &me) {
                    channels.left(channel);
                } else {
                    channels.user_left(channel, from);
                }
            }
            "kick" => {
                let (Some(channel), Some(victim)) = (msg.params.first(), msg.params.get(1)) else {
                    return;
                };
                let mut channels = self.inner.channels.lock();
                if irc_eq(victim, &me) {
                    channels.left(channel);
                } else {
                    channels.user_left(channel, victim);
                }
            }
            "quit" => self.inner.channels.lock().user_quit(from),
            "nick" => {
                let Some(new) = msg.params.first() else {
                    return;
                };
                self.inner.channels.lock().nick_changed(from, new);
                if irc_eq(from, &me) {
                    *self.inner.nickname.lock() = new.clone();
                }
            }
            "namreply" => {
                // Params: our nick, channel symbol, channel, names.
                if let (Some(channel), Some(names)) = (msg.params.get(2), msg.params.get(3)) {
                    let features = self.inner.features.lock();
                    self.inner
                        .channels
                        .lock()
                        .names_reply(features.prefix(), channel, names);
                }
            }
            "mode" => {
                let Some(target) = msg.params.first() else {
                    return;
                };
                if is_channel_name(target) && msg.params.len() >= 2 {
                    let features = self.inner.features.lock();
                    self.inner.channels.lock().mode_changed(
                        features.prefix(),
                        features.chanmodes(),
                        target,
                        &msg.params[1],
                        msg.params.get(2..).unwrap_or_default(),
                    );
                }
            }
            _ => {}
        }
    }

    // ----- disconnect and reconnect -----

    pub(crate) fn handle_disconnect(&self, reason: &str) {
        {
            let mut state = self.inner.state.lock();
            if matches!(
                *state,
                ConnState::Disconnected | ConnState::Reconnecting
            ) {
                return;
            }
            *state = ConnState::Disconnected;
        }
        debug!(id = %self.inner.id, reason, "disconnected");
        self.inner.out_tx.lock().take();
        if let Some(tx) = self.inner.shutdown.lock().take() {
            let _ = tx.send(true);
        }
        if let Some(id) = self.inner.keepalive.lock().take() {
            self.inner.shared.scheduler.cancel(id);
        }
        {
            let mut reg = self.inner.registration.lock();
            if let Some(id) = reg.deadline.take() {
                self.inner.shared.scheduler.cancel(id);
            }
            *reg = RegProgress::default();
        }
        self.inner.channels.lock().clear();
        self.push_event(Event::internal("disconnect", vec![reason.to_owned()]));

        let delay = self.inner.backoff.lock().as_mut().and_then(Backoff::arm);
        if let Some(delay) = delay {
            *self.inner.state.lock() = ConnState::Reconnecting;
            debug!(id = %self.inner.id, ?delay, "reconnect scheduled");
            self.push_event(Event::internal(
                "reconnect_scheduled",
                vec![delay.as_millis().to_string()],
            ));
            let weak = Arc::downgrade(&self.inner);
            self.inner.shared.scheduler.after(delay, move || {
                if let Some(conn) = upgrade(&weak) {
                    conn.attempt_reconnect();
                }
                Ok(())
            });
        }
    }

    fn attempt_reconnect(&self) {
        let proceed = {
            let mut state = self.inner.state.lock();
            if *state == ConnState::Reconnecting {
                *state = ConnState::Connecting;
                true
            } else {
                false
            }
        };
        if !proceed {
            return;
        }
        if let Some(backoff) = self.inner.backoff.lock().as_mut() {
            backoff.fired();
        }
        let conn = self.clone();
        tokio::spawn(async move {
            if let Err(err) = start(conn.clone()).await {
                debug!(id = %conn.inner.id, %err, "reconnect attempt failed");
                // Re-enter the disconnect path so the next backoff arms.
                *conn.inner.state.lock() = ConnState::Connecting;
                conn.handle_disconnect("reconnect failed");
            }
        });
    }
}

fn upgrade(weak: &Weak<ConnInner>) -> Option<Connection> {
    weak.upgrade().map(|inner| Connection { inner })
}

// ----- transport -----

pub(crate) enum Transport {
    Tcp(TcpStream),
    Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

impl Transport {
    fn local_addr(&self) -> Option<SocketAddr> {
        match self {
            Transport::Tcp(s) => s.local_addr().ok(),
            Transport::Tls(s) => s.get_ref().0.local_addr().ok(),
        }
    }
}

impl AsyncRead for Transport {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Transport::Tcp(s) => Pin::new(s).poll_read(cx, buf),
            Transport::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Transport {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            Transport::Tcp(s) => Pin::new(s).poll_write(cx, buf),
            Transport::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Transport::Tcp(s) => Pin::new(s).poll_flush(cx),
            Transport::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Transport::Tcp(s) => Pin::new(s).poll_shutdown(cx),
            Transport::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

async fn open_transport(spec: &ServerSpec) -> Result<Transport> {
    let tcp = TcpStream::connect((spec.host.as_str(), spec.port)).await?;
    tcp.set_nodelay(true)?;
    if !spec.tls {
        return Ok(Transport::Tcp(tcp));
    }
    let mut roots = RootCertStore::empty();
    for cert in rustls_native_certs::load_native_certs().certs {
        let _ = roots.add(cert);
    }
    let config = TlsConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    let connector = TlsConnector::from(Arc::new(config));
    let name = ServerName::try_from(spec.host.clone())
        .map_err(|err| ClientError::Tls(err.to_string()))?;
    let stream = connector
        .connect(name, tcp)
        .await
        .map_err(|err| ClientError::Tls(err.to_string()))?;
    Ok(Transport::Tls(Box::new(stream)))
}

type IrcFramed = Framed<Transport, LineCodec>;

/// Establish the transport, send the handshake, and spawn the IO tasks.
/// Returns once the connection is registering; completion is reported via
/// the `registered` event or a later `disconnect`.
pub(crate) async fn start(conn: Connection) -> Result<()> {
    *conn.inner.state.lock() = ConnState::Connecting;
    *conn.inner.features.lock() = FeatureTable::new();
    *conn.inner.nickname.lock() = conn.inner.spec.nickname.clone();
    *conn.inner.registration.lock() = RegProgress::default();

    let config = &conn.inner.shared.config;
    let codec = LineCodec::new(&config.encoding, config.decode_policy)?
        .with_max_len(config.max_line_len);
    let transport = open_transport(&conn.inner.spec).await?;
    *conn.inner.local_addr.lock() = transport.local_addr();

    let (sink, stream) = Framed::new(transport, codec).split();
    let (out_tx, out_rx) = mpsc::unbounded_channel();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    *conn.inner.out_tx.lock() = Some(out_tx);
    *conn.inner.shutdown.lock() = Some(shutdown_tx);
    *conn.inner.last_traffic.lock() = Instant::now();
    *conn.inner.state.lock() = ConnState::Registering;

    let bucket = TokenBucket::new(
        config
            .rate_limit
            .unwrap_or_else(|| RateLimit::per_second(0.0)),
    );
    tokio::spawn(writer_task(conn.id(), sink, out_rx, bucket));
    tokio::spawn(reader_task(conn.clone(), stream, shutdown_rx));

    let spec = &conn.inner.spec;
    if let Some(password) = &spec.password {
        conn.pass(password)?;
    }
    conn.nick(&spec.nickname)?;
    conn.user(&spec.username, &spec.realname)?;

    let weak = Arc::downgrade(&conn.inner);
    let deadline = conn
        .inner
        .shared
        .scheduler
        .after(config.registration_timeout, move || {
            if let Some(conn) = upgrade(&weak) {
                conn.registration_deadline();
            }
            Ok(())
        });
    conn.inner.registration.lock().deadline = Some(deadline);

    conn.push_event(Event::internal(
        "connect",
        vec![spec.host.clone(), spec.port.to_string()],
    ));
    Ok(())
}

async fn reader_task(
    conn: Connection,
    mut stream: SplitStream<IrcFramed>,
    mut shutdown: watch::Receiver<bool>,
) {
    let reason = loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break "closed".to_owned();
                }
            }
            item = stream.next() => match item {
                Some(Ok(decoded)) => conn.process_decoded(decoded),
                Some(Err(err)) => break format!("read error: {err}"),
                None => break "connection reset by peer".to_owned(),
            },
        }
    };
    conn.handle_disconnect(&reason);
}

async fn writer_task(
    id: ConnectionId,
    mut sink: SplitSink<IrcFramed, String>,
    mut rx: mpsc::UnboundedReceiver<Outbound>,
    mut bucket: TokenBucket,
) {
    while let Some(item) = rx.recv().await {
        match item {
            Outbound::Line(line) => {
                let wait = bucket.reserve();
                if !wait.is_zero() {
                    tokio::time::sleep(wait).await;
                }
                trace!(%id, line = %line, "send");
                if let Err(err) = sink.send(line).await {
                    debug!(%id, %err, "write failed");
                    break;
                }
            }
            Outbound::Close => break,
        }
    }
    let _ = sink.close().await;
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{Queued, Shared};
    use crate::config::ClientConfig;
    use crate::channels::Privilege;
    use tokio::sync::mpsc::UnboundedReceiver;

    fn harness() -> (Connection, UnboundedReceiver<Queued>) {
        let (shared, events) = Shared::new(ClientConfig::default());
        let conn = Connection::new(
            ConnectionId(0),
            ServerSpec::new("irc.test.invalid", 6667, "tester"),
            shared,
        );
        (conn, events)
    }

    fn kinds(rx: &mut UnboundedReceiver<Queued>) -> Vec<String> {
        let mut out = Vec::new();
        while let Ok(q) = rx.try_recv() {
            out.push(q.event.kind);
        }
        out
    }

    #[test]
    fn registered_fires_once_after_feature_burst() {
        let (conn, mut rx) = harness();
        conn.process_line(":irc.test 001 tester :Welcome to the test network");
        conn.process_line(":irc.test 005 tester PREFIX=(ov)@+ CHANTYPES=#& :are supported by this server");
        conn.process_line(":irc.test 005 tester NETWORK=TestNet :are supported by this server");
        conn.process_line(":irc.test 375 tester :- message of the day");
        let seen = kinds(&mut rx);
        let registered: Vec<_> = seen.iter().filter(|k| *k == "registered").collect();
        assert_eq!(registered.len(), 1);
        // Announced before the message that ended the burst is dispatched.
        let reg_pos = seen.iter().position(|k| k == "registered").unwrap();
        let motd_pos = seen.iter().position(|k| k == "motdstart").unwrap();
        assert!(reg_pos < motd_pos);
        assert_eq!(conn.state(), ConnState::Active);
        assert_eq!(
            conn.features().get("NETWORK").and_then(|v| v.as_text()),
            Some("TestNet")
        );
    }

    #[test]
    fn welcome_updates_nickname() {
        let (conn, _rx) = harness();
        conn.process_line(":irc.test 001 tester_ :Welcome");
        assert_eq!(conn.nickname(), "tester_");
    }

    #[test]
    fn privmsg_splits_ctcp_chunks() {
        let (conn, mut rx) = harness();
        conn.process_line(":alice!a@h PRIVMSG #room :before \u{1}ACTION waves\u{1} after");
        let events: Vec<Queued> = std::iter::from_fn(|| rx.try_recv().ok()).collect();
        let kinds: Vec<&str> = events.iter().map(|q| q.event.kind.as_str()).collect();
        assert_eq!(
            kinds,
            vec!["all_raw_messages", "pubmsg", "ctcp", "action", "pubmsg"]
        );
        let action = events.iter().find(|q| q.event.kind == "action").unwrap();
        assert_eq!(action.event.arguments, vec!["waves".to_owned()]);
    }

    #[test]
    fn notice_chunks_are_replies() {
        let (conn, mut rx) = harness();
        conn.process_line(":alice!a@h NOTICE tester :\u{1}VERSION irc 1.0\u{1}");
        let seen = kinds(&mut rx);
        assert!(seen.contains(&"ctcpreply".to_owned()));
        assert!(!seen.contains(&"ctcp".to_owned()));
    }

    #[test]
    fn dcc_offer_is_tracked_and_announced() {
        let (conn, mut rx) = harness();
        conn.process_line(
            ":alice!a@h PRIVMSG tester :\u{1}DCC CHAT chat 2130706433 4000\u{1}",
        );
        let seen = kinds(&mut rx);
        assert!(seen.contains(&"dcc_offer".to_owned()));
        let pending = conn.pending_dcc_offers();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].offer.address.to_string(), "127.0.0.1");
        assert_eq!(pending[0].offer.port, 4000);
        assert!(conn.take_dcc_offer("chat").is_some());
        assert!(conn.pending_dcc_offers().is_empty());
    }

    #[test]
    fn names_reply_populates_membership() {
        let (conn, _rx) = harness();
        conn.process_line(":irc.test 001 tester :Welcome");
        conn.process_line(":tester!t@h JOIN #room");
        conn.process_line(":irc.test 353 tester = #room :@alice +bob carol");
        let chan = conn.channel("#room").unwrap();
        assert!(chan.has_privilege("alice", Privilege::Operator));
        assert!(chan.has_privilege("bob", Privilege::Voice));
        assert!(chan.has_user("carol"));
    }

    #[test]
    fn own_join_records_self_as_member() {
        let (conn, _rx) = harness();
        conn.process_line(":irc.test 001 tester :Welcome");
        conn.process_line(":tester!t@h JOIN #room");
        assert!(conn.channel("#room").unwrap().has_user("tester"));
    }

    #[test]
    fn user_mode_events_are_umode() {
        let (conn, mut rx) = harness();
        conn.process_line(":tester MODE tester :+i");
        let seen = kinds(&mut rx);
        assert!(seen.contains(&"umode".to_owned()));
        conn.process_line(":alice!a@h MODE #room +o bob");
        let seen = kinds(&mut rx);
        assert!(seen.contains(&"mode".to_owned()));
    }

    #[test]
    fn nick_change_follows_own_nick() {
        let (conn, _rx) = harness();
        conn.process_line(":irc.test 001 tester :Welcome");
        conn.process_line(":tester!t@h JOIN #room");
        conn.process_line(":tester!t@h NICK tester2");
        assert_eq!(conn.nickname(), "tester2");
        assert!(conn.channel("#room").unwrap().has_user("tester2"));
    }

    #[test]
    fn kick_of_self_drops_channel() {
        let (conn, _rx) = harness();
        conn.process_line(":irc.test 001 tester :Welcome");
        conn.process_line(":tester!t@h JOIN #room");
        assert_eq!(conn.channels(), vec!["#room".to_owned()]);
        conn.process_line(":alice!a@h KICK #room tester :bye");
        assert!(conn.channels().is_empty());
    }

    #[test]
    fn send_raw_requires_connection() {
        let (conn, _rx) = harness();
        assert!(matches!(
            conn.privmsg("#room", "hi"),
            Err(ClientError::NotConnected)
        ));
    }

    #[test]
    fn unparseable_line_reports_error_event() {
        let (conn, mut rx) = harness();
        conn.process_line(":only_a_prefix");
        let seen = kinds(&mut rx);
        assert_eq!(seen, vec!["all_raw_messages".to_owned(), "error".to_owned()]);
    }
}
