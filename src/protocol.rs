//! # Control-channel wire protocol
//!
//! Each message is a 32-bit big-endian length prefix followed by a body. Body
//! layouts are fixed byte formats (not bincode-derived, unlike `doca-cpp`'s
//! `communication` layer) per the external-interfaces section: explicit and
//! unambiguous, so this implementation treats them as authoritative rather than
//! following the original's serializer.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::endpoint::OpKind;
use crate::error::{RdmaError, Result};

const MAX_FRAME_LEN: u32 = 64 * 1024 * 1024;

async fn write_frame<W: AsyncWrite + Unpin>(io: &mut W, body: &[u8]) -> Result<()> {
    io.write_u32(body.len() as u32).await?;
    io.write_all(body).await?;
    io.flush().await?;
    Ok(())
}

async fn read_frame<R: AsyncRead + Unpin>(io: &mut R) -> Result<Vec<u8>> {
    let len = io.read_u32().await?;
    if len > MAX_FRAME_LEN {
        return Err(RdmaError::protocol(format!("frame length {len} exceeds maximum")));
    }
    let mut body = vec![0u8; len as usize];
    io.read_exact(&mut body).await?;
    Ok(body)
}

/// `{ op kind, path, connection id }`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Request {
    pub op: OpKind,
    pub path: String,
    pub connection_id: u32,
}

impl Request {
    fn encode(&self) -> Vec<u8> {
        let path_bytes = self.path.as_bytes();
        let mut out = Vec::with_capacity(1 + 4 + path_bytes.len() + 4);
        out.push(self.op.wire_code());
        out.extend_from_slice(&(path_bytes.len() as u32).to_le_bytes());
        out.extend_from_slice(path_bytes);
        out.extend_from_slice(&self.connection_id.to_le_bytes());
        out
    }

    fn decode(body: &[u8]) -> Result<Request> {
        if body.is_empty() {
            return Err(RdmaError::protocol("empty request body"));
        }
        let op = OpKind::from_wire_code(body[0])?;
        if body.len() < 5 {
            return Err(RdmaError::protocol("request body truncated before path length"));
        }
        let path_len = u32::from_le_bytes(body[1..5].try_into().unwrap()) as usize;
        if body.len() < 5 + path_len + 4 {
            return Err(RdmaError::protocol("request body truncated before connection id"));
        }
        let path = String::from_utf8(body[5..5 + path_len].to_vec())
            .map_err(|e| RdmaError::protocol(format!("request path is not UTF-8: {e}")))?;
        let connection_id =
            u32::from_le_bytes(body[5 + path_len..5 + path_len + 4].try_into().unwrap());
        Ok(Request { op, path, connection_id })
    }

    pub async fn write<W: AsyncWrite + Unpin>(&self, io: &mut W) -> Result<()> {
        write_frame(io, &self.encode()).await
    }

    pub async fn read<R: AsyncRead + Unpin>(io: &mut R) -> Result<Request> {
        Request::decode(&read_frame(io).await?)
    }
}

/// Response codes, per the control protocol's response body layout.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResponseCode {
    Rejected = 1,
    Permitted = 2,
    EndpointNotFound = 3,
    EndpointLocked = 4,
    InternalError = 5,
    ServiceError = 6,
}

impl ResponseCode {
    fn from_byte(b: u8) -> Result<ResponseCode> {
        match b {
            1 => Ok(ResponseCode::Rejected),
            2 => Ok(ResponseCode::Permitted),
            3 => Ok(ResponseCode::EndpointNotFound),
            4 => Ok(ResponseCode::EndpointLocked),
            5 => Ok(ResponseCode::InternalError),
            6 => Ok(ResponseCode::ServiceError),
            other => Err(RdmaError::protocol(format!("unknown response code {other}"))),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Response {
    pub code: ResponseCode,
    pub descriptor: Vec<u8>,
}

impl Response {
    pub fn new(code: ResponseCode) -> Response {
        Response { code, descriptor: Vec::new() }
    }

    pub fn with_descriptor(code: ResponseCode, descriptor: Vec<u8>) -> Response {
        Response { code, descriptor }
    }

    fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(1 + 4 + self.descriptor.len());
        out.push(self.code as u8);
        out.extend_from_slice(&(self.descriptor.len() as u32).to_le_bytes());
        out.extend_from_slice(&self.descriptor);
        out
    }

    fn decode(body: &[u8]) -> Result<Response> {
        if body.len() < 5 {
            return Err(RdmaError::protocol("response body truncated"));
        }
        let code = ResponseCode::from_byte(body[0])?;
        let descriptor_len = u32::from_le_bytes(body[1..5].try_into().unwrap()) as usize;
        if body.len() < 5 + descriptor_len {
            return Err(RdmaError::protocol("response body truncated before descriptor"));
        }
        Ok(Response { code, descriptor: body[5..5 + descriptor_len].to_vec() })
    }

    pub async fn write<W: AsyncWrite + Unpin>(&self, io: &mut W) -> Result<()> {
        write_frame(io, &self.encode()).await
    }

    pub async fn read<R: AsyncRead + Unpin>(io: &mut R) -> Result<Response> {
        Response::decode(&read_frame(io).await?)
    }
}

/// Ack codes, per the control protocol's acknowledge body layout.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AckCode {
    Canceled = 1,
    Interrupted = 2,
    Failed = 3,
    Completed = 4,
}

impl AckCode {
    fn from_byte(b: u8) -> Result<AckCode> {
        match b {
            1 => Ok(AckCode::Canceled),
            2 => Ok(AckCode::Interrupted),
            3 => Ok(AckCode::Failed),
            4 => Ok(AckCode::Completed),
            other => Err(RdmaError::protocol(format!("unknown ack code {other}"))),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Acknowledge {
    pub code: AckCode,
}

impl Acknowledge {
    pub fn new(code: AckCode) -> Acknowledge {
        Acknowledge { code }
    }

    fn encode(&self) -> [u8; 1] {
        [self.code as u8]
    }

    fn decode(body: &[u8]) -> Result<Acknowledge> {
        if body.is_empty() {
            return Err(RdmaError::protocol("empty acknowledge body"));
        }
        Ok(Acknowledge { code: AckCode::from_byte(body[0])? })
    }

    pub async fn write<W: AsyncWrite + Unpin>(&self, io: &mut W) -> Result<()> {
        write_frame(io, &self.encode()).await
    }

    pub async fn read<R: AsyncRead + Unpin>(io: &mut R) -> Result<Acknowledge> {
        Acknowledge::decode(&read_frame(io).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn request_round_trips_through_a_pipe() {
        let (mut client, mut server) = tokio::io::duplex(4096);
        let req = Request { op: OpKind::Write, path: "/rdma/ep0".into(), connection_id: 7 };
        req.write(&mut client).await.unwrap();
        let got = Request::read(&mut server).await.unwrap();
        assert_eq!(got, req);
    }

    #[tokio::test]
    async fn response_with_descriptor_round_trips() {
        let (mut client, mut server) = tokio::io::duplex(4096);
        let resp = Response::with_descriptor(ResponseCode::Permitted, vec![1, 2, 3, 4]);
        resp.write(&mut client).await.unwrap();
        let got = Response::read(&mut server).await.unwrap();
        assert_eq!(got, resp);
    }

    #[tokio::test]
    async fn acknowledge_round_trips() {
        let (mut client, mut server) = tokio::io::duplex(4096);
        Acknowledge::new(AckCode::Completed).write(&mut client).await.unwrap();
        let got = Acknowledge::read(&mut server).await.unwrap();
        assert_eq!(got.code, AckCode::Completed);
    }

    #[tokio::test]
    async fn oversized_frame_is_rejected() {
        let (mut client, mut server) = tokio::io::duplex(16);
        client.write_u32(MAX_FRAME_LEN + 1).await.unwrap();
        let err = read_frame(&mut server).await.unwrap_err();
        assert!(matches!(err, RdmaError::Protocol { .. }));
    }
}
