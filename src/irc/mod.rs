//! The IRC protocol engine: codec, registries, dispatch, and delivery.

pub mod channel;
pub mod codec;
pub mod error;
pub mod handler;
pub mod listener;
pub mod message;
pub mod numerics;
pub mod registry;
pub mod server;
pub mod user;

pub use channel::Channel;
pub use error::Error;
pub use message::Message;
pub use registry::Registry;
pub use server::{Server, ServerState, SharedState};
pub use user::{Mailbox, Sink, User, UserKey, UserKind};
