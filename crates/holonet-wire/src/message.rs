//! Wire frames.
//!
//! Each frame is a 4-byte big-endian length, then a 4-byte big-endian
//! opcode, then the payload. The length covers opcode and payload.

use crate::transport::WireError;
use bytes::{BufMut, Bytes, BytesMut};
use holonet_types::envelope::{Envelope, LinkId, OP_HELLO};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Size of the opcode field.
pub const OPCODE_LEN: u32 = 4;

/// One undecoded message as it travels on a link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub opcode: u32,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(opcode: u32, payload: impl Into<Bytes>) -> Self {
        Self {
            opcode,
            payload: payload.into(),
        }
    }

    /// The control frame announcing a node's name.
    pub fn hello(node_name: &str) -> Self {
        Self::new(OP_HELLO, Bytes::copy_from_slice(node_name.as_bytes()))
    }

    /// The node name carried by a hello frame, if this is a valid one.
    pub fn hello_name(&self) -> Option<String> {
        if self.opcode != OP_HELLO {
            return None;
        }
        let name = std::str::from_utf8(&self.payload).ok()?.trim();
        (!name.is_empty()).then(|| name.to_string())
    }

    /// Attach the link it arrived on.
    pub fn into_envelope(self, link: LinkId) -> Envelope {
        Envelope {
            opcode: self.opcode,
            payload: self.payload,
            link,
        }
    }
}

impl From<Envelope> for Frame {
    fn from(envelope: Envelope) -> Self {
        Self {
            opcode: envelope.opcode,
            payload: envelope.payload,
        }
    }
}

/// Encode a frame to bytes (length + opcode + payload).
pub fn encode_frame(frame: &Frame) -> Bytes {
    let len = OPCODE_LEN as usize + frame.payload.len();
    let mut buf = BytesMut::with_capacity(4 + len);
    buf.put_u32(len as u32);
    buf.put_u32(frame.opcode);
    buf.extend_from_slice(&frame.payload);
    buf.freeze()
}

/// Decode the length prefix from a 4-byte header.
pub fn decode_length(header: &[u8; 4]) -> u32 {
    u32::from_be_bytes(*header)
}

/// Write one frame and flush.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    frame: &Frame,
) -> Result<(), WireError> {
    writer.write_all(&encode_frame(frame)).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame. A clean end of stream before a header is `ConnectionClosed`.
pub async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
    max_frame_size: u32,
) -> Result<Frame, WireError> {
    let mut header = [0u8; 4];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(WireError::ConnectionClosed);
        }
        Err(e) => return Err(WireError::Io(e)),
    }

    let len = decode_length(&header);
    if len > max_frame_size {
        return Err(WireError::FrameTooLarge {
            size: len,
            max: max_frame_size,
        });
    }
    if len < OPCODE_LEN {
        return Err(WireError::MalformedFrame(len));
    }

    let mut body = vec![0u8; len as usize];
    reader.read_exact(&mut body).await?;

    let mut opcode = [0u8; 4];
    opcode.copy_from_slice(&body[..4]);
    let mut body = Bytes::from(body);
    let payload = body.split_off(4);

    Ok(Frame {
        opcode: u32::from_be_bytes(opcode),
        payload,
    })
}
