//! PDU encoding and decoding
//!
//! Wire format:
//! ```text
//! +--------+--------+---------+--------+---------------------+------+
//! |  Size (2B, BE)  | Version | Ctrl ID| Correlation id ...  | 0x00 |
//! +--------+--------+---------+--------+---------------------+------+
//! |                 CBOR payload, up to Size bytes in total          |
//! +------------------------------------------------------------------+
//! ```

use super::{generate_id, ControlError};
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Protocol version
pub const PROTOCOL_VERSION: u8 = 0x01;

/// Size, version and control id
const STATIC_HEADER_SIZE: usize = 4;

/// Static header plus an empty correlation id and its terminator
pub const MIN_PDU_SIZE: usize = 6;

/// Control identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ControlId {
    Error = 0x01,
    Inbounds = 0x02,
    InboundsResp = 0x03,
    BindClientToServer = 0x04,
    BindClientToServerResp = 0x05,
    BindServerToClient = 0x06,
    BindServerToClientResp = 0x07,
}

impl ControlId {
    /// Response expected for a request, `None` for anything else
    pub fn response(self) -> Option<ControlId> {
        match self {
            ControlId::Inbounds => Some(ControlId::InboundsResp),
            ControlId::BindClientToServer => Some(ControlId::BindClientToServerResp),
            ControlId::BindServerToClient => Some(ControlId::BindServerToClientResp),
            _ => None,
        }
    }
}

impl TryFrom<u8> for ControlId {
    type Error = ControlError;

    fn try_from(value: u8) -> Result<Self, ControlError> {
        match value {
            0x01 => Ok(ControlId::Error),
            0x02 => Ok(ControlId::Inbounds),
            0x03 => Ok(ControlId::InboundsResp),
            0x04 => Ok(ControlId::BindClientToServer),
            0x05 => Ok(ControlId::BindClientToServerResp),
            0x06 => Ok(ControlId::BindServerToClient),
            0x07 => Ok(ControlId::BindServerToClientResp),
            _ => Err(ControlError::UnknownControlId(value)),
        }
    }
}

impl fmt::Display for ControlId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ControlId::Error => "error",
            ControlId::Inbounds => "inbounds",
            ControlId::InboundsResp => "inbounds_resp",
            ControlId::BindClientToServer => "bind_cs",
            ControlId::BindClientToServerResp => "bind_cs_resp",
            ControlId::BindServerToClient => "bind_sc",
            ControlId::BindServerToClientResp => "bind_sc_resp",
        };
        f.write_str(name)
    }
}

/// Error reported by the peer
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ErrorPayload {
    pub status: u16,
    pub message: String,
}

/// Ask the server for the tunnels it wants the client to expose
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Inbounds {
    pub identifier: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InboundsResp {
    #[serde(deserialize_with = "null_as_empty")]
    pub inbounds: Vec<String>,
}

/// Bind request, in either direction
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Bind {
    pub identifier: String,
    pub address: String,
}

/// Empty acknowledgement payload
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {}

fn null_as_empty<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<Vec<String>>::deserialize(deserializer)?.unwrap_or_default())
}

/// PDU payload, one variant per control id
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Body {
    Error(ErrorPayload),
    Inbounds(Inbounds),
    InboundsResp(InboundsResp),
    BindClientToServer(Bind),
    BindClientToServerResp(Ack),
    BindServerToClient(Bind),
    BindServerToClientResp(Ack),
}

impl Body {
    pub fn control_id(&self) -> ControlId {
        match self {
            Body::Error(_) => ControlId::Error,
            Body::Inbounds(_) => ControlId::Inbounds,
            Body::InboundsResp(_) => ControlId::InboundsResp,
            Body::BindClientToServer(_) => ControlId::BindClientToServer,
            Body::BindClientToServerResp(_) => ControlId::BindClientToServerResp,
            Body::BindServerToClient(_) => ControlId::BindServerToClient,
            Body::BindServerToClientResp(_) => ControlId::BindServerToClientResp,
        }
    }

    fn to_cbor(&self) -> Result<Vec<u8>, ControlError> {
        let mut out = Vec::new();
        let result = match self {
            Body::Error(p) => ciborium::into_writer(p, &mut out),
            Body::Inbounds(p) => ciborium::into_writer(p, &mut out),
            Body::InboundsResp(p) => ciborium::into_writer(p, &mut out),
            Body::BindClientToServer(p) | Body::BindServerToClient(p) => {
                ciborium::into_writer(p, &mut out)
            }
            Body::BindClientToServerResp(p) | Body::BindServerToClientResp(p) => {
                ciborium::into_writer(p, &mut out)
            }
        };
        result.map_err(|e| ControlError::Payload(e.to_string()))?;
        Ok(out)
    }

    fn from_cbor(id: ControlId, payload: &[u8]) -> Result<Self, ControlError> {
        fn parse<T: for<'de> Deserialize<'de>>(payload: &[u8]) -> Result<T, ControlError> {
            let mut reader = payload;
            let value = ciborium::from_reader(&mut reader)
                .map_err(|e| ControlError::Payload(e.to_string()))?;
            if !reader.is_empty() {
                return Err(ControlError::Payload(format!(
                    "{} trailing bytes after payload",
                    reader.len()
                )));
            }
            Ok(value)
        }

        Ok(match id {
            ControlId::Error => Body::Error(parse(payload)?),
            ControlId::Inbounds => Body::Inbounds(parse(payload)?),
            ControlId::InboundsResp => Body::InboundsResp(parse(payload)?),
            ControlId::BindClientToServer => Body::BindClientToServer(parse(payload)?),
            ControlId::BindClientToServerResp => Body::BindClientToServerResp(parse(payload)?),
            ControlId::BindServerToClient => Body::BindServerToClient(parse(payload)?),
            ControlId::BindServerToClientResp => Body::BindServerToClientResp(parse(payload)?),
        })
    }
}

/// PDU header. The control id lives in the body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    /// Total encoded size, set by [`Pdu::encode`] and by decoding
    pub size: u16,
    pub version: u8,
    /// Correlation id
    pub pid: String,
}

impl Header {
    fn encoded_len(&self) -> usize {
        STATIC_HEADER_SIZE + self.pid.len() + 1
    }
}

/// A control PDU
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pdu {
    pub header: Header,
    pub body: Body,
}

impl Pdu {
    pub fn new(pid: impl Into<String>, body: Body) -> Self {
        Self {
            header: Header {
                size: 0,
                version: PROTOCOL_VERSION,
                pid: pid.into(),
            },
            body,
        }
    }

    /// New request with a fresh correlation id
    pub fn request(body: Body) -> Self {
        Self::new(generate_id(), body)
    }

    /// Error response for the request `pid`
    pub fn error(pid: impl Into<String>, status: u16, message: impl Into<String>) -> Self {
        Self::new(
            pid,
            Body::Error(ErrorPayload {
                status,
                message: message.into(),
            }),
        )
    }

    pub fn control_id(&self) -> ControlId {
        self.body.control_id()
    }

    pub fn pid(&self) -> &str {
        &self.header.pid
    }

    /// Encode to bytes, recording the total size in the header
    pub fn encode(&mut self) -> Result<Vec<u8>, ControlError> {
        if self.header.pid.as_bytes().contains(&0) {
            return Err(ControlError::InvalidIdentifier);
        }

        let payload = self.body.to_cbor()?;
        let total = self.header.encoded_len() + payload.len();
        let size = u16::try_from(total).map_err(|_| ControlError::TooLarge(total))?;
        self.header.size = size;

        let mut out = Vec::with_capacity(total);
        out.extend_from_slice(&size.to_be_bytes());
        out.push(self.header.version);
        out.push(self.control_id() as u8);
        out.extend_from_slice(self.header.pid.as_bytes());
        out.push(0x00);
        out.extend_from_slice(&payload);

        Ok(out)
    }

    /// Decode one complete PDU
    pub fn decode(buf: &[u8]) -> Result<Self, ControlError> {
        if buf.len() < MIN_PDU_SIZE {
            return Err(ControlError::TooSmall(buf.len()));
        }

        let size = u16::from_be_bytes([buf[0], buf[1]]);
        if (size as usize) < MIN_PDU_SIZE {
            return Err(ControlError::TooSmall(size as usize));
        }
        if buf.len() != size as usize {
            return Err(ControlError::Payload(format!(
                "declared size {} but got {} bytes",
                size,
                buf.len()
            )));
        }

        let version = buf[2];
        if version != PROTOCOL_VERSION {
            return Err(ControlError::UnsupportedVersion(version));
        }
        let id = ControlId::try_from(buf[3])?;

        let rest = &buf[STATIC_HEADER_SIZE..];
        let nul = rest
            .iter()
            .position(|b| *b == 0x00)
            .ok_or(ControlError::InvalidIdentifier)?;
        let pid = std::str::from_utf8(&rest[..nul])
            .map_err(|_| ControlError::InvalidIdentifier)?
            .to_string();

        let body = Body::from_cbor(id, &rest[nul + 1..])?;

        Ok(Self {
            header: Header { size, version, pid },
            body,
        })
    }
}

/// Read one PDU from `reader`
pub async fn read_pdu<R>(reader: &mut R) -> Result<Pdu, ControlError>
where
    R: AsyncRead + Unpin,
{
    let mut prefix = [0u8; 2];
    reader.read_exact(&mut prefix).await?;

    let size = u16::from_be_bytes(prefix) as usize;
    if size < MIN_PDU_SIZE {
        return Err(ControlError::TooSmall(size));
    }

    let mut buf = vec![0u8; size];
    buf[..2].copy_from_slice(&prefix);
    reader.read_exact(&mut buf[2..]).await?;

    Pdu::decode(&buf)
}

/// Encode `pdu` and write it to `writer`
pub async fn write_pdu<W>(writer: &mut W, pdu: &mut Pdu) -> Result<(), ControlError>
where
    W: AsyncWrite + Unpin,
{
    let encoded = pdu.encode()?;
    writer.write_all(&encoded).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const ERROR_PDU: [u8; 37] = [
        0, 37, 1, 1, b'u', b'n', b'i', b'q', b'u', b'e', b'-', b'i', b'd', 0, 0xa2, 0x66, b's',
        b't', b'a', b't', b'u', b's', 0x19, 0x01, 0x90, 0x67, b'm', b'e', b's', b's', b'a', b'g',
        b'e', 0x63, b'm', b's', b'g',
    ];

    #[test]
    fn test_encode_error_pdu() {
        let mut pdu = Pdu::error("unique-id", 400, "msg");
        let encoded = pdu.encode().unwrap();

        assert_eq!(encoded, ERROR_PDU);
        assert_eq!(pdu.header.size, 37);
    }

    #[test]
    fn test_decode_error_pdu() {
        let pdu = Pdu::decode(&ERROR_PDU).unwrap();

        let mut expected = Pdu::error("unique-id", 400, "msg");
        expected.header.size = 37;
        assert_eq!(pdu, expected);
        assert_eq!(pdu.control_id(), ControlId::Error);
    }

    #[tokio::test]
    async fn test_read_pdu_from_stream() {
        let mut reader = &ERROR_PDU[..];
        let pdu = read_pdu(&mut reader).await.unwrap();
        assert_eq!(pdu.pid(), "unique-id");
        assert!(reader.is_empty());
    }

    #[tokio::test]
    async fn test_write_then_read_bind() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let mut request = Pdu::request(Body::BindClientToServer(Bind {
            identifier: "id-1".to_string(),
            address: "127.0.0.1:22".to_string(),
        }));

        write_pdu(&mut a, &mut request).await.unwrap();
        let received = read_pdu(&mut b).await.unwrap();
        assert_eq!(received, request);
    }

    #[test]
    fn test_ack_payload_is_empty_map() {
        let mut pdu = Pdu::new("x", Body::BindServerToClientResp(Ack {}));
        let encoded = pdu.encode().unwrap();
        assert_eq!(encoded, [0, 7, 1, 7, b'x', 0, 0xa0]);
    }

    #[test]
    fn test_inbounds_resp_null_list() {
        // {"inbounds": null}
        let mut raw = vec![0, 0, 1, 3, b'p', 0, 0xa1, 0x68];
        raw.extend_from_slice(b"inbounds");
        raw.push(0xf6);
        let size = raw.len() as u16;
        raw[..2].copy_from_slice(&size.to_be_bytes());

        let pdu = Pdu::decode(&raw).unwrap();
        assert_eq!(pdu.body, Body::InboundsResp(InboundsResp::default()));
    }

    #[test]
    fn test_decode_rejects_malformed() {
        assert!(matches!(
            Pdu::decode(&[0, 5, 1, 1, 0]),
            Err(ControlError::TooSmall(5))
        ));
        assert!(matches!(
            Pdu::decode(&[0, 6, 1, 0x42, 0, 0xa0]),
            Err(ControlError::UnknownControlId(0x42))
        ));
        assert!(matches!(
            Pdu::decode(&[0, 6, 1, 2, b'a', b'b']),
            Err(ControlError::InvalidIdentifier)
        ));
    }

    #[test]
    fn test_decode_rejects_trailing_bytes() {
        let mut raw = ERROR_PDU.to_vec();
        raw.extend_from_slice(&[0xa0, 0xde, 0xad]);
        let size = raw.len() as u16;
        raw[..2].copy_from_slice(&size.to_be_bytes());

        match Pdu::decode(&raw) {
            Err(ControlError::Payload(message)) => assert!(message.contains("3 trailing bytes")),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_decode_rejects_unknown_version() {
        let mut raw = ERROR_PDU.to_vec();
        raw[2] = 2;
        assert!(matches!(
            Pdu::decode(&raw),
            Err(ControlError::UnsupportedVersion(2))
        ));
    }

    #[test]
    fn test_round_trip_every_body() {
        let bind = Bind {
            identifier: "laptop".to_string(),
            address: "10.0.0.5:5432".to_string(),
        };
        let bodies = vec![
            Body::Error(ErrorPayload {
                status: 404,
                message: "unknown outbound".to_string(),
            }),
            Body::Inbounds(Inbounds {
                identifier: "laptop".to_string(),
            }),
            Body::InboundsResp(InboundsResp {
                inbounds: vec!["127.0.0.1:22".to_string(), "db:5432".to_string()],
            }),
            Body::InboundsResp(InboundsResp::default()),
            Body::BindClientToServer(bind.clone()),
            Body::BindClientToServerResp(Ack {}),
            Body::BindServerToClient(bind),
            Body::BindServerToClientResp(Ack {}),
        ];

        for body in bodies {
            let id = body.control_id();
            let mut pdu = Pdu::request(body);
            let encoded = pdu.encode().unwrap();

            let size = u16::from_be_bytes([encoded[0], encoded[1]]) as usize;
            assert_eq!(size, encoded.len(), "size header of {}", id);
            assert_eq!(encoded[3], id as u8);
            assert_eq!(Pdu::decode(&encoded).unwrap(), pdu, "round trip of {}", id);
        }
    }

    #[tokio::test]
    async fn test_read_pdu_too_small() {
        let mut reader = &[0u8, 3, 1][..];
        assert!(matches!(
            read_pdu(&mut reader).await,
            Err(ControlError::TooSmall(3))
        ));
    }

    #[test]
    fn test_response_ids() {
        assert_eq!(
            ControlId::Inbounds.response(),
            Some(ControlId::InboundsResp)
        );
        assert_eq!(
            ControlId::BindServerToClient.response(),
            Some(ControlId::BindServerToClientResp)
        );
        assert_eq!(ControlId::Error.response(), None);
        assert_eq!(ControlId::BindClientToServer.to_string(), "bind_cs");
    }
}
