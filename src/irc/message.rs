/// IRC message parsing and serialization.
///
/// Implements the RFC 1459 §2.3.1 message format:
///   [`:`prefix SPACE] command [SPACE params]
///
/// Params are space-separated tokens; the first token starting with `:`
/// opens the *trailing* parameter, which runs (spaces included) to the end
/// of the line. Everything before it is joined into `middle`.
///
/// Messages are terminated by CR-LF (`\r\n`) on the wire, but parsing
/// operates on the content without the terminator.
use std::fmt;

/// A parsed IRC message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Message {
    /// Optional prefix (server name or `nick!user@host`).
    pub prefix: Option<String>,
    /// The command (e.g. `PRIVMSG`, `NICK`) or a 3-digit numeric (`001`).
    /// Empty for ill-formed input; the dispatcher drops such messages.
    pub command: String,
    /// Space-joined parameters, excluding the trailing one.
    pub middle: String,
    /// The post-`:` parameter. `Some("")` when the colon was present but
    /// empty (`TOPIC #chan :`), `None` when absent.
    pub trailing: Option<String>,
}

impl Message {
    /// Parse a single IRC message from a line (without `\r\n`).
    ///
    /// Never fails: an empty or ill-formed line yields a message with an
    /// empty `command`.
    pub fn parse(input: &str) -> Self {
        let mut prefix = None;
        let mut rest = input;

        if let Some(after) = rest.strip_prefix(':') {
            // Prefix runs until the first space; a prefix without a
            // command is ill-formed.
            match after.split_once(' ') {
                Some((p, tail)) => {
                    prefix = Some(p.to_owned());
                    rest = tail;
                }
                None => return Self::default(),
            }
        }

        let (command, params) = match rest.split_once(' ') {
            Some((cmd, tail)) => (cmd, Some(tail)),
            None => (rest, None),
        };

        let mut middle_tokens: Vec<&str> = Vec::new();
        let mut trailing = None;

        if let Some(mut params) = params {
            loop {
                if let Some(t) = params.strip_prefix(':') {
                    trailing = Some(t.to_owned());
                    break;
                }
                match params.split_once(' ') {
                    Some((token, tail)) => {
                        if !token.is_empty() {
                            middle_tokens.push(token);
                        }
                        params = tail;
                    }
                    None => {
                        if !params.is_empty() {
                            middle_tokens.push(params);
                        }
                        break;
                    }
                }
            }
        }

        Self {
            prefix,
            command: command.to_owned(),
            middle: middle_tokens.join(" "),
            trailing,
        }
    }

    /// Serialize to the IRC wire format (without trailing `\r\n`).
    pub fn to_wire(&self) -> String {
        let mut out = String::new();

        if let Some(ref prefix) = self.prefix {
            out.push(':');
            out.push_str(prefix);
            out.push(' ');
        }

        out.push_str(&self.command);

        if !self.middle.is_empty() {
            out.push(' ');
            out.push_str(&self.middle);
        }

        if let Some(ref trailing) = self.trailing {
            out.push_str(" :");
            out.push_str(trailing);
        }

        out
    }

    /// A server-originated reply: numeric `code` prefixed with the server
    /// hostname.
    pub fn numeric(
        server: &str,
        code: &str,
        middle: impl Into<String>,
        trailing: impl Into<String>,
    ) -> Self {
        Self {
            prefix: Some(server.to_owned()),
            command: code.to_owned(),
            middle: middle.into(),
            trailing: Some(trailing.into()),
        }
    }

    /// The leading token of `middle`, if any. Most commands put their
    /// primary target there.
    pub fn first_middle(&self) -> Option<&str> {
        self.middle.split(' ').next().filter(|t| !t.is_empty())
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_wire())
    }
}

/// Normalize a string for case-insensitive IRC comparison
/// (CASEMAPPING=ascii). Nick bindings and channel keys go through this.
pub(crate) fn irc_lower(s: &str) -> String {
    s.to_ascii_lowercase()
}

// ── Validation ───────────────────────────────────────────────────

/// Specials allowed in nicknames per RFC 1459: `_ - [ ] \ ^ { } | ` `
fn is_nick_special(c: char) -> bool {
    matches!(c, '_' | '-' | '[' | ']' | '\\' | '^' | '{' | '}' | '|' | '`')
}

/// Check nickname syntax: 3–16 chars, first a letter or special,
/// the rest letters, digits, or specials.
pub fn valid_nick(nick: &str) -> bool {
    if !(3..=16).contains(&nick.chars().count()) {
        return false;
    }

    let mut chars = nick.chars();
    let first = match chars.next() {
        Some(c) => c,
        None => return false,
    };

    (first.is_ascii_alphabetic() || is_nick_special(first))
        && chars.all(|c| c.is_ascii_alphanumeric() || is_nick_special(c))
}

/// Check channel-name syntax: `#` followed by one or more word characters.
pub fn valid_channel_name(name: &str) -> bool {
    match name.strip_prefix('#') {
        Some(rest) => {
            !rest.is_empty() && rest.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        None => false,
    }
}
