//! Command dispatch: one routine per IRC command.
//!
//! Replies never touch the socket directly; they go through the sender's
//! own sink, so the connection task stays the single writer and every
//! reply is a whole frame. Server-originated replies carry the configured
//! hostname as prefix and the sender's nick as the first middle token
//! (001 greets by full ident in its trailing text).

use tracing::warn;

use super::channel;
use super::error::Error;
use super::message::{irc_lower, valid_channel_name, Message};
use super::numerics::*;
use super::server::ServerState;
use super::user::{self, UserKey};

/// User-mode letters this server applies; anything else is 501.
const RECOGNIZED_USER_MODES: &[char] = &['r'];

/// What the listener should do after a command.
#[derive(Debug, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Quit(Option<String>),
}

/// Route one inbound message for the connection owning `key`.
///
/// Before registration completes only PASS/NICK/USER are accepted;
/// everything else is dropped. `peer_host` is the remote address used as
/// the client's hostname at USER time.
pub async fn dispatch(
    state: &ServerState,
    key: &UserKey,
    peer_host: &str,
    msg: &Message,
) -> Flow {
    let cmd = msg.command.to_ascii_uppercase();
    if cmd.is_empty() {
        return Flow::Continue;
    }

    let password_required = state.config.password.is_some();
    let registered = state
        .users
        .read(key, |u| u.registered(password_required))
        .unwrap_or(false);

    if !registered {
        match cmd.as_str() {
            "PASS" => pass(state, key, msg),
            "NICK" => nick(state, key, msg),
            "USER" => user_cmd(state, key, peer_host, msg, false),
            _ => {} // pre-registration gate: everything else is dropped
        }

        let now_registered = state
            .users
            .read(key, |u| u.registered(password_required))
            .unwrap_or(false);
        if now_registered {
            greet(state, key).await;
        }
        return Flow::Continue;
    }

    match cmd.as_str() {
        "PASS" => {} // handshake only; ignored afterwards
        "NICK" => nick(state, key, msg),
        "USER" => user_cmd(state, key, peer_host, msg, true),
        "JOIN" => join(state, key, msg),
        "PART" => part(state, key, msg),
        "PRIVMSG" => privmsg(state, key, msg),
        "TOPIC" => topic(state, key, msg),
        "NAMES" => names(state, key, msg),
        "LIST" => list(state, key, msg),
        "WHOIS" => whois(state, key, msg),
        "MODE" => mode(state, key, msg),
        "PING" => ping(state, key, msg),
        "MOTD" => send_motd(state, key).await,
        "QUIT" => return Flow::Quit(msg.trailing.clone()),
        "CAP" => {} // capabilities: acknowledge by ignoring
        other => {
            warn!(user = %key, command = other, "unknown command");
            reply(
                state,
                key,
                ERR_UNKNOWNCOMMAND,
                format!("{} {other}", nick_of(state, key)),
                "Unknown command",
            );
        }
    }

    Flow::Continue
}

// ── Helpers ──────────────────────────────────────────────────────

/// The sender's nick for reply prefixes, `*` before one is set.
fn nick_of(state: &ServerState, key: &UserKey) -> String {
    state
        .users
        .read(key, |u| u.nick.clone())
        .filter(|nick| !nick.is_empty())
        .unwrap_or_else(|| "*".into())
}

/// Queue a numeric reply onto the sender's sink.
fn reply(
    state: &ServerState,
    key: &UserKey,
    code: &str,
    middle: impl Into<String>,
    trailing: impl Into<String>,
) {
    let msg = Message::numeric(&state.config.hostname, code, middle, trailing);
    // A vanished sender means the connection is tearing down.
    let _ = user::send(state, key, msg);
}

// ── Registration ─────────────────────────────────────────────────

fn pass(state: &ServerState, key: &UserKey, msg: &Message) {
    let Some(expected) = state.config.password.clone() else {
        return;
    };
    let supplied = msg
        .first_middle()
        .map(str::to_owned)
        .or_else(|| msg.trailing.clone());
    let ok = supplied.as_deref() == Some(expected.as_str());
    user::update(state, key, |u| u.pass_ok = ok);
}

fn nick(state: &ServerState, key: &UserKey, msg: &Message) {
    let arg = msg
        .first_middle()
        .or(msg.trailing.as_deref())
        .filter(|n| !n.is_empty());
    let Some(new_nick) = arg else {
        reply(
            state,
            key,
            ERR_NONICKNAMEGIVEN,
            nick_of(state, key),
            "No nickname given",
        );
        return;
    };

    match user::change_nick(state, key, new_nick) {
        Ok(()) => {}
        Err(Error::ErroneousNick) => reply(
            state,
            key,
            ERR_ERRONEUSNICKNAME,
            format!("{} {new_nick}", nick_of(state, key)),
            "Erroneous nickname",
        ),
        Err(Error::NickInUse) => reply(
            state,
            key,
            ERR_NICKNAMEINUSE,
            format!("{} {new_nick}", nick_of(state, key)),
            "Nickname is already in use",
        ),
        Err(_) => {}
    }
}

fn user_cmd(state: &ServerState, key: &UserKey, peer_host: &str, msg: &Message, registered: bool) {
    if registered {
        reply(
            state,
            key,
            ERR_ALREADYREGISTRED,
            nick_of(state, key),
            "You may not reregister",
        );
        return;
    }

    let username = msg.first_middle().unwrap_or_default().to_owned();
    let realname = msg.trailing.clone();
    let (username, realname) = match (username.as_str(), realname) {
        ("", _) | (_, None) => {
            reply(
                state,
                key,
                ERR_NEEDMOREPARAMS,
                format!("{} USER", nick_of(state, key)),
                "Not enough parameters",
            );
            return;
        }
        (u, Some(r)) => (u.to_owned(), r),
    };

    let duplicate = state
        .users
        .dump()
        .iter()
        .any(|(k, u)| k != key && !u.username.is_empty() && u.username == username);
    if duplicate {
        reply(
            state,
            key,
            ERR_ALREADYREGISTRED,
            nick_of(state, key),
            "You may not reregister",
        );
        return;
    }

    user::update(state, key, |u| {
        u.username = username;
        u.realname = realname;
        u.hostname = peer_host.to_owned();
    });
}

/// 001–004 followed by the MOTD; sent once, when the handshake completes.
async fn greet(state: &ServerState, key: &UserKey) {
    let Some(user) = state.users.get(key) else {
        return;
    };
    let host = &state.config.hostname;
    let nick = &user.nick;
    let version = concat!("cove-", env!("CARGO_PKG_VERSION"));

    reply(
        state,
        key,
        RPL_WELCOME,
        nick.clone(),
        format!("Welcome to {}, {}", state.config.network_name(), user.ident()),
    );
    reply(
        state,
        key,
        RPL_YOURHOST,
        nick.clone(),
        format!("Your host is {host}, running {version}"),
    );
    let created = match &state.config.network_created_on {
        Some(date) => format!("This server was created {date}"),
        None => "This server was created today".to_owned(),
    };
    reply(state, key, RPL_CREATED, nick.clone(), created);
    let _ = user::send(
        state,
        key,
        Message {
            prefix: Some(host.clone()),
            command: RPL_MYINFO.into(),
            middle: format!("{nick} {host} {version} r t"),
            trailing: None,
        },
    );

    send_motd(state, key).await;
}

async fn send_motd(state: &ServerState, key: &UserKey) {
    let nick = nick_of(state, key);
    let host = &state.config.hostname;

    let text = match &state.config.motd {
        Some(path) => tokio::fs::read_to_string(path).await.ok(),
        None => None,
    };
    let Some(text) = text else {
        reply(state, key, ERR_NOMOTD, nick, "MOTD File is missing");
        return;
    };

    reply(
        state,
        key,
        RPL_MOTDSTART,
        nick.clone(),
        format!("- {host} Message of the Day -"),
    );
    for line in text.lines() {
        reply(
            state,
            key,
            RPL_MOTD,
            nick.clone(),
            format!("- {}", line.trim()),
        );
    }
    reply(state, key, RPL_ENDOFMOTD, nick, "End of /MOTD command");
}

// ── Channels ─────────────────────────────────────────────────────

fn join(state: &ServerState, key: &UserKey, msg: &Message) {
    let nick = nick_of(state, key);
    let Some(target) = msg.first_middle() else {
        reply(
            state,
            key,
            ERR_NEEDMOREPARAMS,
            format!("{nick} JOIN"),
            "Not enough parameters",
        );
        return;
    };
    if !valid_channel_name(target) {
        reply(
            state,
            key,
            ERR_NOSUCHCHANNEL,
            format!("{nick} {target}"),
            "No such channel",
        );
        return;
    }

    match channel::add_user(state, key, target) {
        Ok(chan) => {
            reply(
                state,
                key,
                RPL_TOPIC,
                format!("{nick} {}", chan.name),
                chan.topic.clone(),
            );
            let member_nicks = channel::names_of(state, target).unwrap_or_default();
            reply(
                state,
                key,
                RPL_NAMREPLY,
                format!("{nick} = {}", chan.name),
                member_nicks,
            );
            reply(
                state,
                key,
                RPL_ENDOFNAMES,
                format!("{nick} {}", chan.name),
                "End of /NAMES list",
            );
        }
        Err(e) => warn!(user = %key, channel = target, error = %e, "join failed"),
    }
}

fn part(state: &ServerState, key: &UserKey, msg: &Message) {
    let nick = nick_of(state, key);
    let malformed = |state: &ServerState| {
        reply(
            state,
            key,
            ERR_NEEDMOREPARAMS,
            format!("{nick} PART"),
            "Not enough parameters",
        )
    };

    let Some(list) = msg.first_middle() else {
        malformed(state);
        return;
    };
    let targets: Vec<&str> = list.split(',').collect();
    if targets.iter().any(|name| name.is_empty()) {
        malformed(state);
        return;
    }

    let reason = msg.trailing.as_deref();
    for name in targets {
        if !valid_channel_name(name) {
            reply(
                state,
                key,
                ERR_NOSUCHCHANNEL,
                format!("{nick} {name}"),
                "No such channel",
            );
            continue;
        }
        match channel::remove_user(state, key, name, reason) {
            Ok(_) => {}
            Err(Error::NotOnChannel) => reply(
                state,
                key,
                ERR_NOTONCHANNEL,
                format!("{nick} {name}"),
                "You're not on that channel",
            ),
            Err(Error::NoSuchChannel) => reply(
                state,
                key,
                ERR_NOSUCHCHANNEL,
                format!("{nick} {name}"),
                "No such channel",
            ),
            Err(_) => {}
        }
    }
}

fn privmsg(state: &ServerState, key: &UserKey, msg: &Message) {
    let nick = nick_of(state, key);
    let (target, text) = match (msg.first_middle(), &msg.trailing) {
        (Some(target), Some(text)) => (target, text.clone()),
        _ => {
            reply(
                state,
                key,
                ERR_NEEDMOREPARAMS,
                format!("{nick} PRIVMSG"),
                "Not enough parameters",
            );
            return;
        }
    };
    let Some(ident) = state.users.read(key, |u| u.ident()) else {
        return;
    };

    let out = Message {
        prefix: Some(ident),
        command: "PRIVMSG".into(),
        middle: target.to_owned(),
        trailing: Some(text),
    };

    let delivered = if target.starts_with('#') {
        channel::broadcast(state, target, &out, Some(key))
    } else {
        match state.nicks.get(&irc_lower(target)) {
            Some(recipient) => user::send(state, &recipient, out),
            None => Err(Error::NoSuchUser),
        }
    };

    if delivered.is_err() {
        reply(
            state,
            key,
            ERR_NOSUCHNICK,
            format!("{nick} {target}"),
            "No such nick/channel",
        );
    }
}

fn topic(state: &ServerState, key: &UserKey, msg: &Message) {
    let nick = nick_of(state, key);
    let Some(target) = msg.first_middle() else {
        reply(
            state,
            key,
            ERR_NEEDMOREPARAMS,
            format!("{nick} TOPIC"),
            "Not enough parameters",
        );
        return;
    };

    let chan_key = irc_lower(target);
    let member = state
        .users
        .read(key, |u| u.channels.contains(&chan_key))
        .unwrap_or(false);
    if !member {
        reply(
            state,
            key,
            ERR_NOTONCHANNEL,
            format!("{nick} {target}"),
            "You're not on that channel",
        );
        return;
    }

    match &msg.trailing {
        Some(new_topic) => {
            let Some(ident) = state.users.read(key, |u| u.ident()) else {
                return;
            };
            if let Err(e) = channel::set_topic(state, target, new_topic, &ident) {
                warn!(user = %key, channel = target, error = %e, "topic change failed");
            }
        }
        None => {
            let current = state
                .channels
                .read(&chan_key, |chan| (chan.name.clone(), chan.topic.clone()));
            if let Some((name, topic)) = current {
                reply(state, key, RPL_TOPIC, format!("{nick} {name}"), topic);
            }
        }
    }
}

fn names(state: &ServerState, key: &UserKey, msg: &Message) {
    let nick = nick_of(state, key);
    let Some(target) = msg.first_middle() else {
        reply(
            state,
            key,
            ERR_NEEDMOREPARAMS,
            format!("{nick} NAMES"),
            "Not enough parameters",
        );
        return;
    };

    if let Ok(member_nicks) = channel::names_of(state, target) {
        reply(
            state,
            key,
            RPL_NAMREPLY,
            format!("{nick} = {target}"),
            member_nicks,
        );
    }
    reply(
        state,
        key,
        RPL_ENDOFNAMES,
        format!("{nick} {target}"),
        "End of /NAMES list",
    );
}

fn list(state: &ServerState, key: &UserKey, msg: &Message) {
    let nick = nick_of(state, key);
    reply(
        state,
        key,
        RPL_LISTSTART,
        format!("{nick} Channel"),
        "Users  Name",
    );

    let one = |chan: &channel::Channel| {
        reply(
            state,
            key,
            RPL_LIST,
            format!("{nick} {} {}", chan.name, chan.users.len()),
            chan.topic.clone(),
        );
    };

    match msg.first_middle() {
        Some(filter) => {
            for name in filter.split(',') {
                // Invalid forms are silently skipped; well-formed unknown
                // names get 401.
                if !valid_channel_name(name) {
                    continue;
                }
                match state.channels.get(&irc_lower(name)) {
                    Some(chan) => one(&chan),
                    None => reply(
                        state,
                        key,
                        ERR_NOSUCHNICK,
                        format!("{nick} {name}"),
                        "No such nick/channel",
                    ),
                }
            }
        }
        None => {
            let mut chans = state.channels.dump();
            chans.sort_by(|(a, _), (b, _)| a.cmp(b));
            for (_, chan) in &chans {
                one(chan);
            }
        }
    }

    reply(state, key, RPL_LISTEND, nick.clone(), "End of /LIST");
}

// ── Queries ──────────────────────────────────────────────────────

fn whois(state: &ServerState, key: &UserKey, msg: &Message) {
    let nick = nick_of(state, key);
    let target = msg
        .first_middle()
        .and_then(|list| list.split(',').next())
        .filter(|t| !t.is_empty());
    let Some(target) = target else {
        reply(state, key, ERR_NONICKNAMEGIVEN, nick, "No nickname given");
        return;
    };

    let found = state
        .nicks
        .get(&irc_lower(target))
        .and_then(|target_key| state.users.get(&target_key));
    match found {
        Some(them) => {
            let short: String = them.username.chars().take(8).collect();
            reply(
                state,
                key,
                RPL_WHOISUSER,
                format!("{nick} {} ~{short} {} *", them.nick, them.hostname),
                them.realname.clone(),
            );
            reply(
                state,
                key,
                RPL_ENDOFWHOIS,
                format!("{nick} {}", them.nick),
                "End of /WHOIS list",
            );
        }
        None => reply(
            state,
            key,
            ERR_NOSUCHNICK,
            format!("{nick} {target}"),
            "No such nick/channel",
        ),
    }
}

fn mode(state: &ServerState, key: &UserKey, msg: &Message) {
    let nick = nick_of(state, key);
    let mut tokens = msg.middle.split(' ').filter(|t| !t.is_empty());
    let Some(target) = tokens.next() else {
        reply(
            state,
            key,
            ERR_NEEDMOREPARAMS,
            format!("{nick} MODE"),
            "Not enough parameters",
        );
        return;
    };

    // Channel modes are not implemented; ignore them quietly.
    if target.starts_with('#') {
        return;
    }

    let self_target = irc_lower(target) == irc_lower(&nick);

    match tokens.next() {
        None => {
            // Bare query: anyone's current modes may be asked for.
            let modes = if self_target {
                state.users.read(key, |u| u.mode_string())
            } else {
                state
                    .nicks
                    .get(&irc_lower(target))
                    .and_then(|target_key| state.users.read(&target_key, |u| u.mode_string()))
            };
            match modes {
                Some(modes) => reply(state, key, RPL_UMODEIS, nick, modes),
                None => reply(
                    state,
                    key,
                    ERR_NOSUCHNICK,
                    format!("{nick} {target}"),
                    "No such nick/channel",
                ),
            }
        }
        Some(change) => {
            // Changes apply to the sender alone.
            if !self_target {
                reply(
                    state,
                    key,
                    ERR_USERSDONTMATCH,
                    nick,
                    "Cant change mode for other users",
                );
                return;
            }

            let mut chars = change.chars().peekable();
            let adding = match chars.peek() {
                Some('+') => {
                    chars.next();
                    true
                }
                Some('-') => {
                    chars.next();
                    false
                }
                _ => true,
            };

            let mut unknown = false;
            for letter in chars {
                if RECOGNIZED_USER_MODES.contains(&letter) {
                    user::update(state, key, |u| {
                        if adding {
                            u.modes.insert(letter);
                        } else {
                            u.modes.remove(&letter);
                        }
                    });
                } else {
                    unknown = true;
                }
            }
            if unknown {
                reply(state, key, ERR_UMODEUNKNOWNFLAG, nick, "Unknown MODE flag");
            }
        }
    }
}

fn ping(state: &ServerState, key: &UserKey, msg: &Message) {
    let token = msg
        .first_middle()
        .map(str::to_owned)
        .or_else(|| msg.trailing.clone())
        .unwrap_or_default();
    let Some(ident) = state.users.read(key, |u| u.ident()) else {
        return;
    };
    let _ = user::send(
        state,
        key,
        Message {
            prefix: Some(state.config.hostname.clone()),
            command: "PONG".into(),
            middle: ident,
            trailing: Some(token),
        },
    );
}
