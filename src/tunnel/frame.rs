//! Frame encoding/decoding for the multiplexer
//!
//! Frame format:
//! ```text
//! +--------+--------+--------+--------+
//! |  Type  |     Stream ID (4B) ...   |
//! +--------+--------+--------+--------+
//! |  ...   |   Length (2B)   |
//! +--------+--------+--------+
//! |           Payload             ...
//! +--------+--------+--------+--------+
//! ```

use super::TunnelError;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Frame header size in bytes
pub const FRAME_HEADER_SIZE: usize = 7;

/// Maximum payload carried by one data frame
pub const MAX_PAYLOAD_SIZE: usize = 16 * 1024;

/// Frame types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    /// Data frame
    Data = 0x00,
    /// Stream open request
    Open = 0x01,
    /// Sender will write no more on this stream
    Close = 0x02,
    /// Window update (flow control)
    WindowUpdate = 0x03,
    /// Go away (session closing)
    GoAway = 0x04,
}

impl TryFrom<u8> for FrameType {
    type Error = TunnelError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(FrameType::Data),
            0x01 => Ok(FrameType::Open),
            0x02 => Ok(FrameType::Close),
            0x03 => Ok(FrameType::WindowUpdate),
            0x04 => Ok(FrameType::GoAway),
            _ => Err(TunnelError::InvalidFrame(format!(
                "Unknown frame type: {}",
                value
            ))),
        }
    }
}

/// A multiplexer frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Frame type
    pub frame_type: FrameType,
    /// Stream ID (0 for session-level frames)
    pub stream_id: u32,
    /// Payload data
    pub payload: Bytes,
}

impl Frame {
    /// Create a new data frame
    pub fn data(stream_id: u32, payload: Bytes) -> Self {
        Self {
            frame_type: FrameType::Data,
            stream_id,
            payload,
        }
    }

    /// Create a stream open frame
    pub fn open(stream_id: u32) -> Self {
        Self {
            frame_type: FrameType::Open,
            stream_id,
            payload: Bytes::new(),
        }
    }

    /// Create a stream close frame
    pub fn close(stream_id: u32) -> Self {
        Self {
            frame_type: FrameType::Close,
            stream_id,
            payload: Bytes::new(),
        }
    }

    /// Create a window update frame
    pub fn window_update(stream_id: u32, increment: u32) -> Self {
        let mut payload = BytesMut::with_capacity(4);
        payload.put_u32(increment);
        Self {
            frame_type: FrameType::WindowUpdate,
            stream_id,
            payload: payload.freeze(),
        }
    }

    /// Create a go away frame
    pub fn go_away() -> Self {
        Self {
            frame_type: FrameType::GoAway,
            stream_id: 0,
            payload: Bytes::new(),
        }
    }

    /// Window increment carried by a window update frame
    pub fn increment(&self) -> Result<u32, TunnelError> {
        if self.payload.len() != 4 {
            return Err(TunnelError::InvalidFrame(
                "window update without increment".to_string(),
            ));
        }
        Ok((&self.payload[..]).get_u32())
    }

    /// Append the encoded frame to `buf`
    pub fn encode_into(&self, buf: &mut BytesMut) {
        buf.reserve(self.encoded_size());
        buf.put_u8(self.frame_type as u8);
        buf.put_u32(self.stream_id);
        buf.put_u16(self.payload.len() as u16);
        buf.extend_from_slice(&self.payload);
    }

    /// Encode frame to bytes
    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(self.encoded_size());
        self.encode_into(&mut buf);
        buf
    }

    /// Decode one frame from the front of `buf`, if complete
    pub fn decode(buf: &mut BytesMut) -> Result<Option<Self>, TunnelError> {
        if buf.len() < FRAME_HEADER_SIZE {
            return Ok(None);
        }

        let frame_type = FrameType::try_from(buf[0])?;
        let stream_id = u32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]);
        let payload_len = u16::from_be_bytes([buf[5], buf[6]]) as usize;

        if frame_type == FrameType::Data && payload_len > MAX_PAYLOAD_SIZE {
            return Err(TunnelError::FrameTooLarge(payload_len, MAX_PAYLOAD_SIZE));
        }

        if buf.len() < FRAME_HEADER_SIZE + payload_len {
            return Ok(None);
        }

        buf.advance(FRAME_HEADER_SIZE);
        let payload = buf.split_to(payload_len).freeze();

        Ok(Some(Self {
            frame_type,
            stream_id,
            payload,
        }))
    }

    /// Get the total encoded size of this frame
    pub fn encoded_size(&self) -> usize {
        FRAME_HEADER_SIZE + self.payload.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_encode_decode() {
        let original = Frame::data(42, Bytes::from_static(b"Hello, World!"));
        let mut encoded = original.encode();
        assert_eq!(encoded.len(), FRAME_HEADER_SIZE + 13);

        let decoded = Frame::decode(&mut encoded).unwrap().unwrap();
        assert_eq!(decoded, original);
        assert!(encoded.is_empty());
    }

    #[test]
    fn test_partial_frame_waits() {
        let mut encoded = Frame::data(0x01020304, Bytes::from_static(b"abc")).encode();
        assert_eq!(&encoded[..5], &[0x00, 0x01, 0x02, 0x03, 0x04]);

        let mut partial = encoded.split_to(FRAME_HEADER_SIZE + 1);
        assert!(Frame::decode(&mut partial).unwrap().is_none());
        assert_eq!(partial.len(), FRAME_HEADER_SIZE + 1);
    }

    #[test]
    fn test_back_to_back_frames() {
        let mut buf = BytesMut::new();
        Frame::open(3).encode_into(&mut buf);
        Frame::window_update(3, 1024).encode_into(&mut buf);
        Frame::close(3).encode_into(&mut buf);

        let open = Frame::decode(&mut buf).unwrap().unwrap();
        assert_eq!(open.frame_type, FrameType::Open);

        let update = Frame::decode(&mut buf).unwrap().unwrap();
        assert_eq!(update.increment().unwrap(), 1024);

        let close = Frame::decode(&mut buf).unwrap().unwrap();
        assert_eq!(close.frame_type, FrameType::Close);
        assert!(Frame::decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_rejects_bad_frames() {
        let mut unknown = BytesMut::from(&[0x09u8, 0, 0, 0, 1, 0, 0][..]);
        assert!(Frame::decode(&mut unknown).is_err());

        let mut oversized = BytesMut::from(&[0x00u8, 0, 0, 0, 1, 0xFF, 0xFF][..]);
        assert!(matches!(
            Frame::decode(&mut oversized),
            Err(TunnelError::FrameTooLarge(0xFFFF, MAX_PAYLOAD_SIZE))
        ));
    }
}
