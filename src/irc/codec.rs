/// IRC line codec — frames a TCP byte stream into IRC messages.
///
/// Splits on line boundaries (CRLF per RFC 1459, bare LF tolerated on
/// input), parses each line into a [`Message`], and serializes outgoing
/// messages with `\r\n` termination. One encoded message is one complete
/// frame; the writer never splits it.
use bytes::{BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::message::Message;

/// A tokio codec that frames IRC messages on line boundaries.
#[derive(Debug, Default)]
pub struct IrcCodec;

impl Decoder for IrcCodec {
    type Item = Message;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        // Look for LF; a preceding CR is stripped with it. Over-long lines
        // are accepted as-is.
        let lf_pos = src.iter().position(|&b| b == b'\n');

        match lf_pos {
            Some(pos) => {
                let mut line_bytes = src.split_to(pos + 1);
                line_bytes.truncate(pos);
                if line_bytes.last() == Some(&b'\r') {
                    line_bytes.truncate(line_bytes.len() - 1);
                }

                // Non-UTF-8 input degrades to an ill-formed (ignored)
                // message rather than killing the connection.
                let line = String::from_utf8_lossy(&line_bytes);
                Ok(Some(Message::parse(&line)))
            }
            None => Ok(None),
        }
    }
}

impl Encoder<Message> for IrcCodec {
    type Error = std::io::Error;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let wire = item.to_wire();
        dst.reserve(wire.len() + 2);
        dst.put_slice(wire.as_bytes());
        dst.put_slice(b"\r\n");
        Ok(())
    }
}
