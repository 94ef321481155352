//! Server core — shared state, the accept loop, and the host-facing
//! virtual-user surface.
//!
//! `ServerState` holds the only shared mutable state: the user registry,
//! the nick-binding index, and the channel registry. Connection tasks and
//! host threads all mutate through it; nothing else is shared.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::net::{TcpListener, TcpSocket};
use tracing::info;

use super::channel::{self, Channel};
use super::error::Error;
use super::listener;
use super::message::{irc_lower, Message};
use super::registry::Registry;
use super::user::{self, Mailbox, Sink, User, UserKey, UserKind};
use crate::config::Config;

/// Shared server state: configuration plus the registries.
#[derive(Debug)]
pub struct ServerState {
    pub config: Config,
    /// All participants, keyed by their opaque key.
    pub users: Registry<UserKey, User>,
    /// Lowercased nick → key. Binding goes through `set`, so a taken nick
    /// is detected at bind time.
    pub nicks: Registry<String, UserKey>,
    /// Lowercased channel name → channel.
    pub channels: Registry<String, Channel>,
    conn_seq: AtomicU64,
}

/// Shared, thread-safe server state.
pub type SharedState = Arc<ServerState>;

impl ServerState {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            users: Registry::new(),
            nicks: Registry::new(),
            channels: Registry::new(),
            conn_seq: AtomicU64::new(1),
        }
    }

    /// Fresh key for a new TCP connection.
    pub(crate) fn next_conn_key(&self) -> UserKey {
        format!("conn-{}", self.conn_seq.fetch_add(1, Ordering::Relaxed))
    }

    // ── Virtual-user surface ─────────────────────────────────────

    /// Mount an in-process participant. Messages addressed to it land on
    /// `mbox`. The key is host-assigned and must be unique.
    pub fn register_virtual(
        &self,
        key: impl Into<UserKey>,
        nick: &str,
        username: &str,
        realname: &str,
        hostname: &str,
        mbox: Mailbox,
    ) -> Result<UserKey, Error> {
        self.register(key.into(), nick, username, realname, hostname, UserKind::Virtual, Sink::Mailbox(mbox))
    }

    /// Mount a sink-less observer: it can join channels and send, but
    /// deliveries to it are dropped.
    pub fn register_void(
        &self,
        key: impl Into<UserKey>,
        nick: &str,
        username: &str,
        realname: &str,
        hostname: &str,
    ) -> Result<UserKey, Error> {
        self.register(key.into(), nick, username, realname, hostname, UserKind::Void, Sink::Void)
    }

    fn register(
        &self,
        key: UserKey,
        nick: &str,
        username: &str,
        realname: &str,
        hostname: &str,
        kind: UserKind,
        sink: Sink,
    ) -> Result<UserKey, Error> {
        user::add(
            self,
            User {
                key,
                nick: nick.to_owned(),
                username: username.to_owned(),
                realname: realname.to_owned(),
                hostname: hostname.to_owned(),
                kind,
                sink,
                channels: Default::default(),
                modes: Default::default(),
                pass_ok: true,
            },
        )
    }

    /// Join a hosted user to a channel (created lazily).
    pub fn join(&self, key: &UserKey, channel: &str) -> Result<Channel, Error> {
        channel::add_user(self, key, channel)
    }

    /// Part a hosted user from a channel.
    pub fn part(&self, key: &UserKey, channel: &str, reason: Option<&str>) -> Result<Channel, Error> {
        channel::remove_user(self, key, channel, reason)
    }

    /// Send a PRIVMSG from a hosted user to a channel (`#`-prefixed
    /// target, sender excluded from the fan-out) or to a user by nick.
    pub fn privmsg(&self, from: &UserKey, target: &str, text: &str) -> Result<(), Error> {
        let ident = self
            .users
            .read(from, |u| u.ident())
            .ok_or(Error::NoSuchUser)?;
        let msg = Message {
            prefix: Some(ident),
            command: "PRIVMSG".into(),
            middle: target.to_owned(),
            trailing: Some(text.to_owned()),
        };
        if target.starts_with('#') {
            channel::broadcast(self, target, &msg, Some(from))
        } else {
            let key = self
                .nicks
                .get(&irc_lower(target))
                .ok_or(Error::NoSuchUser)?;
            user::send(self, &key, msg)
        }
    }

    /// Take a hosted user out of the server, with QUIT-equivalent channel
    /// cleanup.
    pub fn unregister(&self, key: &UserKey, reason: &str) -> Result<(), Error> {
        user::remove(self, key, reason)
    }
}

/// The listening server.
pub struct Server {
    state: SharedState,
    listener: TcpListener,
}

impl Server {
    /// Bind the listen socket (`reuseaddr` set) without accepting yet.
    pub fn bind(config: Config) -> io::Result<Self> {
        let addr: SocketAddr = ([0, 0, 0, 0], config.port).into();
        let socket = TcpSocket::new_v4()?;
        socket.set_reuseaddr(true)?;
        socket.bind(addr)?;
        let listener = socket.listen(1024)?;

        info!(addr = %listener.local_addr()?, host = %config.hostname, "cove listening");

        Ok(Self {
            state: Arc::new(ServerState::new(config)),
            listener,
        })
    }

    /// The bound address; useful with port 0.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Handle to the shared state, for mounting virtual users.
    pub fn state(&self) -> SharedState {
        Arc::clone(&self.state)
    }

    /// Accept connections forever, one listener task per connection.
    pub async fn run(self) -> io::Result<()> {
        loop {
            let (socket, addr) = self.listener.accept().await?;
            info!(%addr, "new connection");
            let state = Arc::clone(&self.state);
            tokio::spawn(async move {
                listener::run(socket, addr, state).await;
                info!(%addr, "disconnected");
            });
        }
    }
}
