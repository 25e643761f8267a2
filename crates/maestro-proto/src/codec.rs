//! Framing for maestro sockets.
//!
//! Old-style messages and HTTP-style messages travel on the same stream;
//! the first token of a frame tells them apart.

use bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::http::{Head, HttpMessage, RESPONSE_PREFIX};
use crate::message::{code, split_args};
use crate::{HttpRequest, HttpResponse, Message, ProtoError};

/// Longest code or size token accepted before the first separator.
const MAX_TOKEN: usize = 64;

/// Head of an HTTP-style frame may not exceed this.
const MAX_HEAD: usize = 64 * 1024;

/// Largest argument list or body accepted in one frame.
pub const MAX_FRAME: usize = 16 * 1024 * 1024;

const METHODS: &[&str] = &["GET", "PUT", "POST", "DELETE"];

/// One unit read from or written to a maestro socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Message(Message),
    Request(HttpRequest),
    Response(HttpResponse),
}

impl From<Message> for Frame {
    fn from(msg: Message) -> Self {
        Self::Message(msg)
    }
}

impl From<HttpRequest> for Frame {
    fn from(req: HttpRequest) -> Self {
        Self::Request(req)
    }
}

impl From<HttpResponse> for Frame {
    fn from(resp: HttpResponse) -> Self {
        Self::Response(resp)
    }
}

/// Codec for maestro sockets.
#[derive(Debug, Default)]
pub struct MaestroCodec {
    _private: (),
}

impl MaestroCodec {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Decoder for MaestroCodec {
    type Item = Frame;
    type Error = ProtoError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, ProtoError> {
        let Some(first_space) = src.iter().position(|&b| b == b' ') else {
            if src.len() > MAX_TOKEN {
                return Err(ProtoError::UnknownCode(preview(src)));
            }
            return Ok(None);
        };

        let first = std::str::from_utf8(&src[..first_space])
            .map_err(|_| ProtoError::UnknownCode(preview(src)))?;

        if first == RESPONSE_PREFIX || METHODS.contains(&first) {
            decode_http(src)
        } else if code::is_known(first) {
            decode_message(src, first_space)
        } else {
            Err(ProtoError::UnknownCode(first.to_string()))
        }
    }
}

fn decode_message(src: &mut BytesMut, first_space: usize) -> Result<Option<Frame>, ProtoError> {
    let size_start = first_space + 1;
    let Some(size_len) = src[size_start..].iter().position(|&b| b == b' ') else {
        if src.len() - size_start > MAX_TOKEN {
            return Err(ProtoError::InvalidSize(preview(&src[size_start..])));
        }
        return Ok(None);
    };

    let size_token = &src[size_start..size_start + size_len];
    let size: usize = std::str::from_utf8(size_token)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| ProtoError::InvalidSize(preview(size_token)))?;
    if size > MAX_FRAME {
        return Err(ProtoError::InvalidSize(format!(
            "{size} exceeds the {MAX_FRAME} byte limit"
        )));
    }

    let args_start = size_start + size_len + 1;
    let frame_len = args_start + size + 1;
    if src.len() < frame_len {
        src.reserve(frame_len - src.len());
        return Ok(None);
    }
    if src[frame_len - 1] != b'\n' {
        return Err(ProtoError::MalformedArguments(
            "message not terminated by a newline".to_string(),
        ));
    }

    let code = String::from_utf8_lossy(&src[..first_space]).into_owned();
    let args = split_args(&src[args_start..args_start + size])?;
    src.advance(frame_len);
    Ok(Some(Frame::Message(Message { code, args })))
}

fn decode_http(src: &mut BytesMut) -> Result<Option<Frame>, ProtoError> {
    let Some(head_end) = src.windows(2).position(|w| w == b"\n\n") else {
        if src.len() > MAX_HEAD {
            return Err(ProtoError::MalformedHttp("head too long".to_string()));
        }
        return Ok(None);
    };

    let head_text = std::str::from_utf8(&src[..head_end])
        .map_err(|_| ProtoError::MalformedHttp("head is not UTF-8".to_string()))?;
    let head = Head::parse(head_text)?;
    let content_length = head.content_length()?;
    if content_length > MAX_FRAME {
        return Err(ProtoError::MalformedHttp(format!(
            "content-length {content_length} exceeds the {MAX_FRAME} byte limit"
        )));
    }
    let body_start = head_end + 2;
    let frame_len = body_start + content_length;
    if src.len() < frame_len {
        src.reserve(frame_len - src.len());
        return Ok(None);
    }

    let body = String::from_utf8(src[body_start..frame_len].to_vec())
        .map_err(|_| ProtoError::MalformedHttp("body is not UTF-8".to_string()))?;
    src.advance(frame_len);

    Ok(Some(match head.into_message(body)? {
        HttpMessage::Request(req) => Frame::Request(req),
        HttpMessage::Response(resp) => Frame::Response(resp),
    }))
}

fn preview(bytes: &[u8]) -> String {
    String::from_utf8_lossy(&bytes[..bytes.len().min(MAX_TOKEN)]).into_owned()
}

impl Encoder<Frame> for MaestroCodec {
    type Error = ProtoError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), ProtoError> {
        let text = match frame {
            Frame::Message(msg) => msg.encode(),
            Frame::Request(req) => req.encode(),
            Frame::Response(resp) => resp.encode(),
        };
        dst.extend_from_slice(text.as_bytes());
        Ok(())
    }
}
