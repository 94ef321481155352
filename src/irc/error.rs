//! Validation errors returned by the user/channel registries.
//!
//! These are the library-caller errors; protocol errors that map to IRC
//! numerics are constructed at the handler boundary from these reasons.

use thiserror::Error;

/// Why a user/channel operation was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Error {
    #[error("no such user")]
    NoSuchUser,

    #[error("no such channel")]
    NoSuchChannel,

    #[error("not on that channel")]
    NotOnChannel,

    #[error("nickname is already in use")]
    NickInUse,

    #[error("erroneous nickname")]
    ErroneousNick,

    #[error("not enough parameters")]
    NeedMoreParams,

    #[error("already registered")]
    AlreadyRegistered,

    #[error("sink does not match user type")]
    InvalidSink,

    #[error("key is already in use")]
    KeyInUse,
}

impl Error {
    /// Stable snake_case tag for logging and host-side matching.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::NoSuchUser => "no_such_user",
            Self::NoSuchChannel => "no_such_channel",
            Self::NotOnChannel => "notonchannel",
            Self::NickInUse => "nick_in_use",
            Self::ErroneousNick => "erroneous_nick",
            Self::NeedMoreParams => "needmoreparams",
            Self::AlreadyRegistered => "alreadyregistered",
            Self::InvalidSink => "invalid_sink",
            Self::KeyInUse => "key_in_use",
        }
    }
}
