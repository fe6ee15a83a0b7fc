//! CRLF line framing over tokio.

use bytes::{BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::ProtocolError;
use crate::message::Message;
use crate::MAX_LINE_LEN;

/// Frames `Message`s onto a byte stream.
///
/// Decoding splits on `\n` (tolerating a missing `\r`), rejects any
/// line longer than 512 bytes including the terminator, and skips
/// empty lines. Encoding appends CRLF and refuses oversize output
/// rather than emitting a truncated frame.
#[derive(Debug, Default)]
pub struct LineCodec {
    /// Set while discarding an oversize inbound line.
    discarding: bool,
}

impl LineCodec {
    pub fn new() -> LineCodec {
        LineCodec { discarding: false }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

impl Decoder for LineCodec {
    type Item = Message;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>, CodecError> {
        loop {
            let Some(pos) = src.iter().position(|&b| b == b'\n') else {
                if src.len() > MAX_LINE_LEN {
                    // Drop the partial oversize line, keep the connection.
                    src.clear();
                    self.discarding = true;
                }
                return Ok(None);
            };

            let line = src.split_to(pos + 1);
            if self.discarding {
                self.discarding = false;
                continue;
            }
            if line.len() > MAX_LINE_LEN {
                return Err(ProtocolError::LineTooLong { max: MAX_LINE_LEN }.into());
            }

            let text = std::str::from_utf8(&line[..line.len() - 1])
                .map_err(|_| ProtocolError::InvalidMessage {
                    string: String::from_utf8_lossy(&line).into_owned(),
                    reason: "not valid UTF-8".into(),
                })?
                .trim_end_matches('\r');
            if text.is_empty() {
                continue;
            }

            return match text.parse::<Message>() {
                Ok(msg) => Ok(Some(msg)),
                Err(e) => Err(e.into()),
            };
        }
    }
}

impl Encoder<&Message> for LineCodec {
    type Error = CodecError;

    fn encode(&mut self, msg: &Message, dst: &mut BytesMut) -> Result<(), CodecError> {
        let line = msg.to_string();
        if line.len() + 2 > MAX_LINE_LEN {
            return Err(ProtocolError::LineTooLong { max: MAX_LINE_LEN }.into());
        }
        dst.reserve(line.len() + 2);
        dst.put_slice(line.as_bytes());
        dst.put_slice(b"\r\n");
        Ok(())
    }
}

impl Encoder<Message> for LineCodec {
    type Error = CodecError;

    fn encode(&mut self, msg: Message, dst: &mut BytesMut) -> Result<(), CodecError> {
        Encoder::<&Message>::encode(self, &msg, dst)
    }
}
