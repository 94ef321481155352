//! cove — an embeddable IRC (RFC 1459) server.
//!
//! Host applications mount in-process services as IRC participants next
//! to real TCP clients: everyone shares the same registries and
//! channels, and delivery is unified over a [`irc::Sink`] that is either
//! a connection's outbound queue, an in-process mailbox, or nothing.
//!
//! ```no_run
//! use tokio::sync::mpsc;
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let config = cove::Config {
//!     hostname: "irc.example.net".into(),
//!     ..cove::Config::default()
//! };
//! let server = cove::Server::bind(config)?;
//!
//! // Mount a virtual participant before serving.
//! let state = server.state();
//! let (mbox, mut inbox) = mpsc::unbounded_channel();
//! state.register_virtual("helper", "helper", "helper", "Helper Bot", "irc.example.net", mbox)?;
//! state.join(&"helper".into(), "#lobby")?;
//!
//! tokio::spawn(async move {
//!     while let Some(msg) = inbox.recv().await {
//!         // React to PRIVMSGs addressed to the bot or its channels.
//!         let _ = msg;
//!     }
//! });
//!
//! server.run().await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod irc;

pub use config::Config;
pub use irc::{Server, ServerState};
