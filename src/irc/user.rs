//! The unified user model.
//!
//! A user is a TCP client, an in-process virtual participant, or a
//! sink-less observer. All three share one record shape and one delivery
//! path: a [`Sink`] that accepts whole messages. For TCP clients the sink
//! is the outbound queue drained by the connection task (which owns the
//! socket and serializes one queued message per CRLF frame); for virtual
//! users it is the host's mailbox; for void users it drops everything.

use std::collections::HashSet;

use tokio::sync::mpsc;
use tracing::warn;

use super::channel;
use super::error::Error;
use super::message::{irc_lower, valid_nick, Message};
use super::server::ServerState;

/// Opaque unique user identifier. Connection tasks get generated keys;
/// virtual/void keys are host-assigned.
pub type UserKey = String;

/// Host-side handle for delivering messages to a virtual user.
pub type Mailbox = mpsc::UnboundedSender<Message>;

/// Which flavor of participant a user is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UserKind {
    /// A real remote client behind a TCP connection.
    Irc,
    /// An in-process participant with a mailbox.
    Virtual,
    /// A sink-less participant; deliveries are dropped.
    Void,
}

/// Where messages for a user go.
#[derive(Debug, Clone)]
pub enum Sink {
    /// Outbound queue of a TCP connection task.
    Conn(mpsc::UnboundedSender<Message>),
    /// In-process mailbox owned by host code.
    Mailbox(Mailbox),
    /// Bit bucket.
    Void,
}

impl Sink {
    /// Deliver one message. Whole-message granularity, never blocks.
    /// Returns `false` when the receiving side is gone.
    pub fn deliver(&self, msg: Message) -> bool {
        match self {
            Self::Conn(tx) | Self::Mailbox(tx) => tx.send(msg).is_ok(),
            Self::Void => true,
        }
    }

    /// Sink variant and user type must agree (invalid_sink otherwise).
    fn matches(&self, kind: UserKind) -> bool {
        matches!(
            (self, kind),
            (Self::Conn(_), UserKind::Irc)
                | (Self::Mailbox(_), UserKind::Virtual)
                | (Self::Void, UserKind::Void)
        )
    }
}

/// One participant, of any kind.
#[derive(Debug, Clone)]
pub struct User {
    pub key: UserKey,
    /// Display name; unique server-wide (case-insensitive) when non-empty.
    pub nick: String,
    pub username: String,
    pub realname: String,
    pub hostname: String,
    pub kind: UserKind,
    pub sink: Sink,
    /// Channel keys this user is a member of; mirrors `Channel::users`.
    pub channels: HashSet<String>,
    /// User mode letters.
    pub modes: HashSet<char>,
    /// Whether a configured server password has been presented.
    pub pass_ok: bool,
}

impl User {
    /// A connection-time record: only key and sink populated; the
    /// handshake fills in the rest.
    pub fn pre_registered(key: UserKey, sink: Sink) -> Self {
        Self {
            key,
            nick: String::new(),
            username: String::new(),
            realname: String::new(),
            hostname: String::new(),
            kind: UserKind::Irc,
            sink,
            channels: HashSet::new(),
            modes: HashSet::new(),
            pass_ok: false,
        }
    }

    /// All identity fields present.
    pub fn registerable(&self) -> bool {
        !self.key.is_empty()
            && !self.nick.is_empty()
            && !self.username.is_empty()
            && !self.realname.is_empty()
            && !self.hostname.is_empty()
    }

    /// Fully registered: identity complete and, when a server password is
    /// configured, the password presented.
    pub fn registered(&self, password_required: bool) -> bool {
        self.registerable() && (!password_required || self.pass_ok)
    }

    /// `nick!~<first 8 chars of username>@hostname`, used as the prefix on
    /// messages attributed to this user.
    pub fn ident(&self) -> String {
        let short: String = self.username.chars().take(8).collect();
        format!("{}!~{}@{}", self.nick, short, self.hostname)
    }

    /// Current mode letters as `+abc` (sorted).
    pub fn mode_string(&self) -> String {
        let mut letters: Vec<char> = self.modes.iter().copied().collect();
        letters.sort_unstable();
        let mut out = String::from("+");
        out.extend(letters);
        out
    }
}

/// Register a complete user (the host-side path; TCP clients are created
/// pre-registered by their connection task instead).
///
/// Error precedence: missing fields, duplicate username, bad nick syntax,
/// sink/type mismatch, nick taken, key taken.
pub fn add(state: &ServerState, user: User) -> Result<UserKey, Error> {
    if !user.registerable() {
        return Err(Error::NeedMoreParams);
    }
    let duplicate_username = state
        .users
        .dump()
        .iter()
        .any(|(_, existing)| !existing.username.is_empty() && existing.username == user.username);
    if duplicate_username {
        return Err(Error::AlreadyRegistered);
    }
    if !valid_nick(&user.nick) {
        return Err(Error::ErroneousNick);
    }
    if !user.sink.matches(user.kind) {
        return Err(Error::InvalidSink);
    }

    // Compare-and-insert on the nick binding is what detects collisions.
    let bind = irc_lower(&user.nick);
    if !state.nicks.set(bind.clone(), user.key.clone()) {
        return Err(Error::NickInUse);
    }

    let key = user.key.clone();
    if !state.users.set(key.clone(), user) {
        state.nicks.remove(&bind);
        return Err(Error::KeyInUse);
    }
    Ok(key)
}

/// Merge a changeset into the stored record, atomically for this key.
/// Returns the updated record, or `None` when no such user.
pub fn update(state: &ServerState, key: &UserKey, changes: impl FnOnce(&mut User)) -> Option<User> {
    state.users.modify(key, changes)
}

/// Drop the record and its nick binding. Membership cleanup must already
/// have happened; [`remove`] is the usual entry point.
pub fn destroy(state: &ServerState, key: &UserKey) -> bool {
    match state.users.take(key) {
        Some(user) => {
            release_nick(state, &user, key);
            true
        }
        None => false,
    }
}

fn release_nick(state: &ServerState, user: &User, key: &UserKey) {
    let bind = irc_lower(&user.nick);
    if !bind.is_empty() && state.nicks.get(&bind).is_some_and(|holder| &holder == key) {
        state.nicks.remove(&bind);
    }
}

/// Deliver one message to the user's sink.
pub fn send(state: &ServerState, key: &UserKey, msg: Message) -> Result<(), Error> {
    send_all(state, key, [msg])
}

/// Deliver messages to the user's sink in call order.
pub fn send_all(
    state: &ServerState,
    key: &UserKey,
    msgs: impl IntoIterator<Item = Message>,
) -> Result<(), Error> {
    let sink = state
        .users
        .read(key, |user| user.sink.clone())
        .ok_or(Error::NoSuchUser)?;
    for msg in msgs {
        if !sink.deliver(msg) {
            // Receiver went away; the owning task's teardown handles it.
            warn!(user = %key, "delivery failed; sink closed");
        }
    }
    Ok(())
}

/// Deliver a message to the user and to every member of every channel the
/// user is on — once per distinct recipient, honoring each channel's
/// relay set.
pub fn broadcast(state: &ServerState, key: &UserKey, msg: &Message) -> Result<(), Error> {
    let user = state.users.get(key).ok_or(Error::NoSuchUser)?;

    let mut recipients: HashSet<UserKey> = HashSet::new();
    recipients.insert(user.key.clone());
    for chan_key in &user.channels {
        let members = state.channels.read(chan_key, |chan| {
            chan.users
                .iter()
                .filter(|member| {
                    state
                        .users
                        .read(member, |u| chan.relay_to.contains(&u.kind))
                        .unwrap_or(false)
                })
                .cloned()
                .collect::<Vec<_>>()
        });
        if let Some(members) = members {
            recipients.extend(members);
        }
    }

    for recipient in recipients {
        if let Some(sink) = state.users.read(&recipient, |u| u.sink.clone()) {
            if !sink.deliver(msg.clone()) {
                warn!(user = %recipient, command = %msg.command, "delivery failed; sink closed");
            }
        }
    }
    Ok(())
}

/// Rename a user. On success the `NICK` notification (old nick as prefix,
/// new nick as middle) reaches the user and everyone sharing a channel
/// with them *before* the record changes.
pub fn change_nick(state: &ServerState, key: &UserKey, new_nick: &str) -> Result<(), Error> {
    if !valid_nick(new_nick) {
        return Err(Error::ErroneousNick);
    }
    let user = state.users.get(key).ok_or(Error::NoSuchUser)?;

    let new_bind = irc_lower(new_nick);
    let old_bind = irc_lower(&user.nick);

    // Reserve the new binding first; set() refuses if someone holds it.
    // Rebinding our own nick (case change) is allowed.
    if !state.nicks.set(new_bind.clone(), key.clone())
        && !state.nicks.get(&new_bind).is_some_and(|holder| &holder == key)
    {
        return Err(Error::NickInUse);
    }

    if !user.nick.is_empty() {
        let note = Message {
            prefix: Some(user.nick.clone()),
            command: "NICK".into(),
            middle: new_nick.to_owned(),
            trailing: None,
        };
        if let Err(e) = broadcast(state, key, &note) {
            warn!(user = %key, error = %e, "nick change notification failed");
        }
    }

    state.users.modify(key, |u| u.nick = new_nick.to_owned());

    if !old_bind.is_empty() && old_bind != new_bind {
        state.nicks.remove(&old_bind);
    }
    Ok(())
}

/// Take a user out of the server. The record is *claimed* first — a join
/// racing this user finds no record and rolls back, so the claimed
/// `channels` set is the authoritative membership to clean up. Each
/// channel then gets a `PART` (with `reason`) to its remaining members.
/// For TCP users, dropping the record closes the outbound queue, which
/// ends the connection task and with it the socket.
pub fn remove(state: &ServerState, key: &UserKey, reason: &str) -> Result<(), Error> {
    let user = state.users.take(key).ok_or(Error::NoSuchUser)?;
    release_nick(state, &user, key);

    for chan_key in &user.channels {
        channel::drop_member(state, &user, chan_key, reason);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use pretty_assertions::assert_eq;
    use tokio::sync::mpsc::{self, UnboundedReceiver};

    fn state() -> ServerState {
        ServerState::new(Config {
            hostname: "cove.test".into(),
            ..Config::default()
        })
    }

    fn virtual_user(key: &str, nick: &str) -> (User, UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let user = User {
            key: key.into(),
            nick: nick.into(),
            username: nick.into(),
            realname: format!("{nick} realname"),
            hostname: "cove.test".into(),
            kind: UserKind::Virtual,
            sink: Sink::Mailbox(tx),
            channels: HashSet::new(),
            modes: HashSet::new(),
            pass_ok: true,
        };
        (user, rx)
    }

    fn drain(rx: &mut UnboundedReceiver<Message>) -> Vec<Message> {
        let mut out = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            out.push(msg);
        }
        out
    }

    // ── Registration ─────────────────────────────────────────────

    #[test]
    fn add_rejects_incomplete_user() {
        let st = state();
        let (mut user, _rx) = virtual_user("v1", "alpha");
        user.realname = String::new();
        assert_eq!(add(&st, user), Err(Error::NeedMoreParams));
    }

    #[test]
    fn add_rejects_duplicate_username() {
        let st = state();
        let (a, _rx_a) = virtual_user("v1", "alpha");
        add(&st, a).unwrap();

        let (mut b, _rx_b) = virtual_user("v2", "beta");
        b.username = "alpha".into();
        assert_eq!(add(&st, b), Err(Error::AlreadyRegistered));
    }

    #[test]
    fn add_rejects_bad_nick_and_taken_nick() {
        let st = state();
        let (bad, _rx) = virtual_user("v1", "#alpha");
        assert_eq!(add(&st, bad), Err(Error::ErroneousNick));

        let (a, _rx_a) = virtual_user("v2", "alpha");
        add(&st, a).unwrap();
        let (dup, _rx_b) = virtual_user("v3", "Alpha"); // case-insensitive
        assert_eq!(add(&st, dup), Err(Error::NickInUse));
    }

    #[test]
    fn add_rejects_mismatched_sink() {
        let st = state();
        let (mut user, _rx) = virtual_user("v1", "alpha");
        user.sink = Sink::Void;
        assert_eq!(add(&st, user), Err(Error::InvalidSink));
    }

    #[test]
    fn add_rejects_duplicate_key() {
        let st = state();
        let (a, _rx_a) = virtual_user("v1", "alpha");
        add(&st, a).unwrap();
        let (b, _rx_b) = virtual_user("v1", "beta");
        assert_eq!(add(&st, b), Err(Error::KeyInUse));
        // The failed insert must not leave a stray nick binding behind.
        assert_eq!(st.nicks.get(&"beta".to_string()), None);
    }

    // ── Delivery ─────────────────────────────────────────────────

    #[test]
    fn send_preserves_call_order() {
        let st = state();
        let (user, mut rx) = virtual_user("v1", "alpha");
        add(&st, user).unwrap();

        let key: UserKey = "v1".into();
        for text in ["one", "two", "three"] {
            send(
                &st,
                &key,
                Message {
                    command: "PRIVMSG".into(),
                    middle: "alpha".into(),
                    trailing: Some(text.into()),
                    ..Default::default()
                },
            )
            .unwrap();
        }

        let got: Vec<_> = drain(&mut rx)
            .into_iter()
            .filter_map(|m| m.trailing)
            .collect();
        assert_eq!(got, vec!["one", "two", "three"]);
    }

    #[test]
    fn send_to_unknown_user_errors() {
        let st = state();
        let msg = Message {
            command: "PRIVMSG".into(),
            ..Default::default()
        };
        assert_eq!(send(&st, &"ghost".into(), msg), Err(Error::NoSuchUser));
    }

    #[test]
    fn void_user_swallows_messages() {
        let st = state();
        let (mut user, _rx) = virtual_user("v1", "watcher");
        user.kind = UserKind::Void;
        user.sink = Sink::Void;
        add(&st, user).unwrap();

        let msg = Message {
            command: "PRIVMSG".into(),
            middle: "watcher".into(),
            trailing: Some("into the void".into()),
            ..Default::default()
        };
        assert_eq!(send(&st, &"v1".into(), msg), Ok(()));
    }

    // ── Nick changes ─────────────────────────────────────────────

    #[test]
    fn change_nick_collision_leaves_nick_unchanged() {
        let st = state();
        let (alpha, _rx_a) = virtual_user("a", "alpha");
        let (beta, _rx_b) = virtual_user("b", "beta");
        add(&st, alpha).unwrap();
        add(&st, beta).unwrap();

        assert_eq!(
            change_nick(&st, &"a".into(), "beta"),
            Err(Error::NickInUse)
        );
        assert_eq!(
            st.users.get(&"a".into()).map(|u| u.nick),
            Some("alpha".into())
        );
    }

    #[test]
    fn change_nick_notifies_channel_peers_with_old_prefix() {
        let st = state();
        let (alpha, mut rx_a) = virtual_user("a", "alpha");
        let (beta, mut rx_b) = virtual_user("b", "beta");
        add(&st, alpha).unwrap();
        add(&st, beta).unwrap();
        channel::add_user(&st, &"a".into(), "#greek").unwrap();
        channel::add_user(&st, &"b".into(), "#greek").unwrap();
        drain(&mut rx_a);
        drain(&mut rx_b);

        change_nick(&st, &"a".into(), "omega").unwrap();

        for rx in [&mut rx_a, &mut rx_b] {
            let notes = drain(rx);
            assert_eq!(notes.len(), 1);
            assert_eq!(notes[0].command, "NICK");
            assert_eq!(notes[0].prefix.as_deref(), Some("alpha"));
            assert_eq!(notes[0].middle, "omega");
        }

        assert_eq!(st.nicks.get(&"omega".to_string()), Some("a".into()));
        assert_eq!(st.nicks.get(&"alpha".to_string()), None);
    }

    #[test]
    fn change_nick_rejects_bad_syntax() {
        let st = state();
        let (alpha, _rx) = virtual_user("a", "alpha");
        add(&st, alpha).unwrap();
        assert_eq!(
            change_nick(&st, &"a".into(), "la!+mbda"),
            Err(Error::ErroneousNick)
        );
    }

    // ── Identity ─────────────────────────────────────────────────

    #[test]
    fn ident_truncates_username_to_eight() {
        let (mut user, _rx) = virtual_user("v1", "alpha");
        user.username = "abcdefghijkl".into();
        assert_eq!(user.ident(), "alpha!~abcdefgh@cove.test");
    }

    // ── Removal ──────────────────────────────────────────────────

    #[test]
    fn remove_cleans_memberships_and_binding() {
        let st = state();
        let (alpha, _rx_a) = virtual_user("a", "alpha");
        let (beta, _rx_b) = virtual_user("b", "beta");
        add(&st, alpha).unwrap();
        add(&st, beta).unwrap();
        channel::add_user(&st, &"a".into(), "#greek").unwrap();
        channel::add_user(&st, &"b".into(), "#greek").unwrap();

        remove(&st, &"a".into(), "gone").unwrap();

        assert_eq!(st.users.get(&"a".into()).map(|u| u.key), None);
        assert_eq!(st.nicks.get(&"alpha".to_string()), None);
        let members = st
            .channels
            .get(&"#greek".to_string())
            .map(|c| c.users)
            .unwrap_or_default();
        assert!(!members.contains("a"));
        assert!(members.contains("b"));
    }

    #[test]
    fn no_two_users_hold_the_same_nick() {
        let st = state();
        let (alpha, _rx_a) = virtual_user("a", "alpha");
        add(&st, alpha).unwrap();

        // Registration and rename must both refuse the held nick.
        let (dup, _rx_b) = virtual_user("b", "alpha");
        assert_eq!(add(&st, dup), Err(Error::NickInUse));

        let (beta, _rx_c) = virtual_user("c", "beta");
        add(&st, beta).unwrap();
        assert_eq!(change_nick(&st, &"c".into(), "ALPHA"), Err(Error::NickInUse));
    }
}
