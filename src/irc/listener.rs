//! Per-connection task.
//!
//! Owns the socket for its whole life: one `select!` loop decodes inbound
//! lines and drains the user's outbound queue into the framed writer, so
//! every message hits the wire as one complete CRLF frame. The user
//! record is created when the first line arrives and torn down on every
//! exit path — read error, EOF, QUIT, or the host removing the user
//! (which closes the queue and lands us in the drain arm).

use std::net::SocketAddr;

use futures::SinkExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_stream::StreamExt;
use tokio_util::codec::Framed;
use tracing::{debug, warn};

use super::codec::IrcCodec;
use super::handler::{self, Flow};
use super::message::Message;
use super::server::SharedState;
use super::user::{self, Sink, User};

/// Drive one TCP connection until it ends, then clean up.
pub async fn run(stream: TcpStream, addr: SocketAddr, state: SharedState) {
    let mut framed = Framed::new(stream, IrcCodec);
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();

    let key = state.next_conn_key();
    let peer_host = addr.ip().to_string();

    // Held until the peer proves itself with a first line; connections
    // that never send anything never touch the registry.
    let mut pending_sink = Some(Sink::Conn(tx));
    let mut quit_reason: Option<String> = None;

    loop {
        tokio::select! {
            frame = framed.next() => {
                let msg = match frame {
                    Some(Ok(msg)) => msg,
                    Some(Err(e)) => {
                        warn!(%addr, "read error: {e}");
                        break;
                    }
                    None => break, // connection closed
                };

                if let Some(sink) = pending_sink.take() {
                    if !state.users.set(key.clone(), User::pre_registered(key.clone(), sink)) {
                        warn!(%addr, user = %key, "connection key collision");
                        break;
                    }
                }

                if msg.command.is_empty() {
                    continue; // ill-formed line
                }

                match handler::dispatch(&state, &key, &peer_host, &msg).await {
                    Flow::Continue => {}
                    Flow::Quit(reason) => {
                        quit_reason = reason;
                        break;
                    }
                }
            }

            outbound = rx.recv() => {
                match outbound {
                    Some(msg) => {
                        if framed.send(msg).await.is_err() {
                            break;
                        }
                    }
                    // Queue closed: the record was dropped host-side.
                    None => break,
                }
            }
        }
    }

    // Unconditional teardown; a no-op when the record is already gone.
    let reason = quit_reason.unwrap_or_else(|| "Connection closed".to_owned());
    if let Err(e) = user::remove(&state, &key, &reason) {
        debug!(user = %key, error = %e, "teardown for unknown user");
    }
}
