//! Framing: length-prefix (4 bytes LE) + bincode body.

use crate::protocol::Message;

pub const LEN_SIZE: usize = 4;
pub const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024; // 16 MiB

/// Encode a message into a single frame: 4 bytes LE length + bincode body.
pub fn encode_frame(msg: &Message) -> Result<Vec<u8>, FrameEncodeError> {
    let body = bincode::serialize(msg)?;
    let len = u32::try_from(body.len()).map_err(|_| FrameEncodeError::TooLarge)?;
    if len > MAX_FRAME_LEN {
        return Err(FrameEncodeError::TooLarge);
    }
    let mut out = Vec::with_capacity(LEN_SIZE + body.len());
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(&body);
    Ok(out)
}

/// Error encoding a message into a frame.
#[derive(Debug, thiserror::Error)]
pub enum FrameEncodeError {
    #[error("encode error: {0}")]
    Encode(#[from] bincode::Error),
    #[error("frame too large")]
    TooLarge,
}

/// Decode one frame from the front of `bytes`. Returns the message and the number of bytes consumed.
/// On `NeedMore` the caller keeps the buffer and retries once more bytes arrived.
pub fn decode_frame(bytes: &[u8]) -> Result<(Message, usize), FrameDecodeError> {
    let len = match frame_len(bytes)? {
        Some(len) => len,
        None => return Err(FrameDecodeError::NeedMore),
    };
    if bytes.len() < LEN_SIZE + len {
        return Err(FrameDecodeError::NeedMore);
    }
    let msg = decode_body(&bytes[LEN_SIZE..LEN_SIZE + len])?;
    Ok((msg, LEN_SIZE + len))
}

/// Body length announced by a frame header, once the header is complete.
pub fn frame_len(bytes: &[u8]) -> Result<Option<usize>, FrameDecodeError> {
    if bytes.len() < LEN_SIZE {
        return Ok(None);
    }
    let len = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    if len > MAX_FRAME_LEN {
        return Err(FrameDecodeError::TooLarge);
    }
    Ok(Some(len as usize))
}

/// Decode a frame body whose length prefix was already consumed (stream readers).
pub fn decode_body(body: &[u8]) -> Result<Message, FrameDecodeError> {
    Ok(bincode::deserialize(body)?)
}

/// Error decoding a frame.
#[derive(Debug, thiserror::Error)]
pub enum FrameDecodeError {
    #[error("need more bytes")]
    NeedMore,
    #[error("frame too large")]
    TooLarge,
    #[error("decode error: {0}")]
    Decode(#[from] bincode::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Body, NodeId};

    fn samples() -> Vec<Message> {
        let id = NodeId(7);
        vec![
            Message::connect(id, 1),
            Message::request(id, 2),
            Message::reply(id, 3, 2),
            Message::new(id, 4, Body::Reply { round: None }),
            Message::release(id, 5),
            Message::state(id, 6, "PLAYER:7,48,96,down,1|OBJECTS:0:key;"),
        ]
    }

    #[test]
    fn roundtrip_every_kind() {
        for msg in samples() {
            let frame = encode_frame(&msg).unwrap();
            let (decoded, n) = decode_frame(&frame).unwrap();
            assert_eq!(n, frame.len());
            assert_eq!(decoded, msg);
        }
    }

    #[test]
    fn partial_read_need_more() {
        let frame = encode_frame(&Message::request(NodeId(1), 9)).unwrap();
        assert!(matches!(
            decode_frame(&frame[..2]),
            Err(FrameDecodeError::NeedMore)
        ));
        assert!(matches!(
            decode_frame(&frame[..LEN_SIZE]),
            Err(FrameDecodeError::NeedMore)
        ));
        assert!(matches!(
            decode_frame(&frame[..frame.len() - 1]),
            Err(FrameDecodeError::NeedMore)
        ));
    }

    #[test]
    fn multiple_messages() {
        let all = samples();
        let mut buf = Vec::new();
        for msg in &all {
            buf.extend_from_slice(&encode_frame(msg).unwrap());
        }
        let mut offset = 0;
        for msg in &all {
            let (decoded, n) = decode_frame(&buf[offset..]).unwrap();
            assert_eq!(&decoded, msg);
            offset += n;
        }
        assert_eq!(offset, buf.len());
    }

    #[test]
    fn oversized_header_rejected() {
        let mut buf = (MAX_FRAME_LEN + 1).to_le_bytes().to_vec();
        buf.extend_from_slice(&[0u8; 8]);
        assert!(matches!(decode_frame(&buf), Err(FrameDecodeError::TooLarge)));
    }

    #[test]
    fn malformed_body_rejected() {
        let mut buf = 3u32.to_le_bytes().to_vec();
        buf.extend_from_slice(&[0xff, 0xff, 0xff]);
        assert!(matches!(decode_frame(&buf), Err(FrameDecodeError::Decode(_))));
    }
}
