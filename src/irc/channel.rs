//! Channels: named multicast groups over user keys.
//!
//! Membership is bidirectional with `User::channels`; both sides of a
//! join/part mutate within the same critical section — the channel entry
//! lock is held across the paired user-side update, and neither side is
//! ever inferred by reading the other. Channels are created lazily on
//! first join and destroyed when the last member leaves. Fan-out runs
//! under the same entry guard, so every observer sees broadcasts to one
//! channel in a single order.

use std::collections::HashSet;

use tracing::warn;

use super::error::Error;
use super::message::{irc_lower, Message};
use super::server::ServerState;
use super::user::{User, UserKey, UserKind};

/// A named multicast group.
#[derive(Debug, Clone)]
pub struct Channel {
    /// Display spelling from creation time; the registry key is the
    /// lowercased form.
    pub name: String,
    pub topic: String,
    /// Member user keys; mirrors `User::channels`.
    pub users: HashSet<UserKey>,
    /// User kinds that actually receive broadcasts.
    pub relay_to: HashSet<UserKind>,
}

impl Channel {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            topic: String::new(),
            users: HashSet::new(),
            relay_to: [UserKind::Irc, UserKind::Virtual].into(),
        }
    }
}

/// Join `key` to the channel, creating it when absent. Idempotent for an
/// existing member. Both membership sides and the `JOIN` broadcast happen
/// under the channel entry lock, so the broadcast observes exactly the
/// new membership (joiner included) and no one ever sees half a join.
/// Returns a snapshot of the updated channel.
pub fn add_user(state: &ServerState, key: &UserKey, name: &str) -> Result<Channel, Error> {
    let user = state.users.get(key).ok_or(Error::NoSuchUser)?;
    let chan_key = irc_lower(name);

    let mut joined = false;
    let updated = state
        .channels
        .upsert_with(chan_key.clone(), || Channel::new(name), |chan| {
            // The user may be quitting concurrently: their side goes in
            // first, and a claimed record means the join never happened.
            let user_side = state.users.modify(key, |u| {
                u.channels.insert(chan_key.clone());
            });
            if user_side.is_none() {
                return;
            }
            joined = true;
            chan.users.insert(key.clone());

            let join = Message {
                prefix: Some(user.ident()),
                command: "JOIN".into(),
                middle: chan.name.clone(),
                trailing: None,
            };
            fan_out(state, chan, &join, None);
        });
    if !joined {
        state.channels.remove_if(&chan_key, |chan| chan.users.is_empty());
        return Err(Error::NoSuchUser);
    }

    Ok(updated)
}

/// Part `key` from the channel. The `PART` broadcast goes out *before*
/// the membership changes, so the departing member sees it too; broadcast
/// and both membership sides share the channel entry's critical section.
/// An emptied channel is destroyed.
pub fn remove_user(
    state: &ServerState,
    key: &UserKey,
    name: &str,
    part_msg: Option<&str>,
) -> Result<Channel, Error> {
    let chan_key = irc_lower(name);
    let user = state.users.get(key).ok_or(Error::NoSuchUser)?;

    let updated = state
        .channels
        .with_mut(&chan_key, |chan| {
            if !chan.users.contains(key) {
                return Err(Error::NotOnChannel);
            }

            let part = Message {
                prefix: Some(user.ident()),
                command: "PART".into(),
                middle: chan.name.clone(),
                trailing: part_msg.map(str::to_owned),
            };
            fan_out(state, chan, &part, None);

            chan.users.remove(key);
            state.users.modify(key, |u| {
                u.channels.remove(&chan_key);
            });
            Ok(chan.clone())
        })
        .ok_or(Error::NoSuchChannel)??;

    state.channels.remove_if(&chan_key, |chan| chan.users.is_empty());

    Ok(updated)
}

/// Quit-path removal: the caller has already claimed the user record, so
/// joins racing this user lose and roll back, and the `PART` goes to the
/// remaining members only.
pub(crate) fn drop_member(state: &ServerState, user: &User, chan_key: &str, reason: &str) {
    let chan_key = chan_key.to_owned();
    state.channels.with_mut(&chan_key, |chan| {
        if !chan.users.remove(&user.key) {
            return;
        }
        let part = Message {
            prefix: Some(user.ident()),
            command: "PART".into(),
            middle: chan.name.clone(),
            trailing: Some(reason.to_owned()),
        };
        fan_out(state, chan, &part, None);
    });
    state.channels.remove_if(&chan_key, |chan| chan.users.is_empty());
}

/// Deliver `msg` to every member whose kind is in the channel's relay
/// set, except `exclude`. Each sink is independent: one closed sink is
/// logged and the fan-out continues.
///
/// Fan-out holds the exclusive channel guard, so concurrent broadcasts
/// to one channel serialize and every observer sees the same order.
pub fn broadcast(
    state: &ServerState,
    name: &str,
    msg: &Message,
    exclude: Option<&UserKey>,
) -> Result<(), Error> {
    let chan_key = irc_lower(name);
    state
        .channels
        .with_mut(&chan_key, |chan| fan_out(state, chan, msg, exclude))
        .ok_or(Error::NoSuchChannel)
}

/// Deliver `msg` to the members of `chan`. Callers hold the channel
/// entry guard.
fn fan_out(state: &ServerState, chan: &Channel, msg: &Message, exclude: Option<&UserKey>) {
    for member in &chan.users {
        if exclude == Some(member) {
            continue;
        }
        let Some((kind, sink)) = state.users.read(member, |u| (u.kind, u.sink.clone())) else {
            warn!(channel = %chan.name, member = %member, "member missing from user registry");
            continue;
        };
        if !chan.relay_to.contains(&kind) {
            continue;
        }
        if !sink.deliver(msg.clone()) {
            warn!(channel = %chan.name, member = %member, command = %msg.command,
                "delivery failed; sink closed");
        }
    }
}

/// Replace the topic (empty allowed) and broadcast the `TOPIC` change
/// attributed to `source`.
pub fn set_topic(
    state: &ServerState,
    name: &str,
    topic: &str,
    source: &str,
) -> Result<(), Error> {
    let chan_key = irc_lower(name);
    let updated = state
        .channels
        .modify(&chan_key, |chan| topic.clone_into(&mut chan.topic))
        .ok_or(Error::NoSuchChannel)?;

    let note = Message {
        prefix: Some(source.to_owned()),
        command: "TOPIC".into(),
        middle: updated.name.clone(),
        trailing: Some(topic.to_owned()),
    };
    broadcast(state, &chan_key, &note, None)
}

/// Space-separated member nicks (sorted) for `RPL_NAMREPLY`.
pub fn names_of(state: &ServerState, name: &str) -> Result<String, Error> {
    let chan_key = irc_lower(name);
    let members = state
        .channels
        .read(&chan_key, |chan| {
            chan.users.iter().cloned().collect::<Vec<_>>()
        })
        .ok_or(Error::NoSuchChannel)?;

    let mut nicks: Vec<String> = members
        .iter()
        .filter_map(|key| state.users.read(key, |u| u.nick.clone()))
        .filter(|nick| !nick.is_empty())
        .collect();
    nicks.sort();
    Ok(nicks.join(" "))
}
