//! Sentinel-framed codecs for the control stream.
//!
//! A frame is the JSON body followed by the `<F2B_END_COMMAND>` sentinel.
//! A body equal to `<F2B_CLOSE_COMMAND>` requests connection close; an empty
//! body is the empty frame. [`FrameCodec`] is the server side (decode
//! commands, encode replies); [`ClientCodec`] is the mirror image, used by
//! clients and the integration tests.

use bytes::{BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::command::{CommandFrame, Reply};
use crate::error::ProtocolError;

/// Terminates every frame on the wire.
pub const END_COMMAND: &[u8] = b"<F2B_END_COMMAND>";

/// Frame body requesting an orderly connection close.
pub const CLOSE_COMMAND: &[u8] = b"<F2B_CLOSE_COMMAND>";

/// Upper bound on a buffered frame before its sentinel arrives.
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

/// One decoded frame from a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientFrame {
    /// A command vector.
    Command(CommandFrame),
    /// The close sentinel.
    Close,
    /// An empty frame (empty byte string body).
    Empty,
}

/// Locate the end sentinel in `src`, returning the body length.
fn find_sentinel(src: &BytesMut) -> Option<usize> {
    if src.len() < END_COMMAND.len() {
        return None;
    }
    src.as_ref()
        .windows(END_COMMAND.len())
        .position(|w| w == END_COMMAND)
}

/// Split the next frame body off `src`, enforcing the size limit.
fn split_body(src: &mut BytesMut) -> Result<Option<BytesMut>, ProtocolError> {
    match find_sentinel(src) {
        Some(at) => {
            let body = src.split_to(at);
            let _ = src.split_to(END_COMMAND.len());
            Ok(Some(body))
        }
        None => {
            if src.len() > MAX_FRAME_LEN {
                return Err(ProtocolError::FrameTooLarge {
                    size: src.len(),
                    limit: MAX_FRAME_LEN,
                });
            }
            Ok(None)
        }
    }
}

fn write_frame(dst: &mut BytesMut, body: &[u8]) {
    dst.reserve(body.len() + END_COMMAND.len());
    dst.put_slice(body);
    dst.put_slice(END_COMMAND);
}

/// Server-side codec: decodes [`ClientFrame`]s, encodes [`Reply`]s.
#[derive(Debug, Default)]
pub struct FrameCodec;

impl Decoder for FrameCodec {
    type Item = ClientFrame;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<ClientFrame>, ProtocolError> {
        let Some(body) = split_body(src)? else {
            return Ok(None);
        };
        if body.is_empty() {
            return Ok(Some(ClientFrame::Empty));
        }
        if body.as_ref() == CLOSE_COMMAND {
            return Ok(Some(ClientFrame::Close));
        }
        let command = serde_json::from_slice(&body)?;
        Ok(Some(ClientFrame::Command(command)))
    }
}

impl Encoder<Reply> for FrameCodec {
    type Error = ProtocolError;

    fn encode(&mut self, reply: Reply, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        let body = serde_json::to_vec(&reply)?;
        write_frame(dst, &body);
        Ok(())
    }
}

/// Client-side codec: encodes [`CommandFrame`]s, decodes [`Reply`]s.
#[derive(Debug, Default)]
pub struct ClientCodec;

impl Decoder for ClientCodec {
    type Item = Reply;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Reply>, ProtocolError> {
        let Some(body) = split_body(src)? else {
            return Ok(None);
        };
        let reply = serde_json::from_slice(&body)?;
        Ok(Some(reply))
    }
}

impl Encoder<CommandFrame> for ClientCodec {
    type Error = ProtocolError;

    fn encode(&mut self, command: CommandFrame, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        let body = serde_json::to_vec(&command)?;
        write_frame(dst, &body);
        Ok(())
    }
}

impl ClientCodec {
    /// Encode the close sentinel as a whole frame.
    pub fn encode_close(dst: &mut BytesMut) {
        write_frame(dst, CLOSE_COMMAND);
    }
}
