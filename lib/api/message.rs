//! Framing of the control channel: an 8 byte big endian body length, then the bincode body.

use crate::backend::FileStat;
use crate::error::{Error, Result};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::path::PathBuf;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const HEADER_LENGTH: usize = 8;
pub const MAX_BODY_LENGTH: u64 = 16 << 20;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Request {
    Load { path: PathBuf },
    Unload { path: PathBuf },
    Status,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileStatus {
    pub path: PathBuf,
    pub stat: FileStat,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Status {
    pub backend: String,
    pub capacity: u64,
    pub used: u64,
    pub files: Vec<FileStatus>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Response {
    Done,
    Status(Status),
    /// errno and a readable reason
    Error { errno: i32, reason: String },
}

impl From<&Error> for Response {
    fn from(e: &Error) -> Self {
        Response::Error {
            errno: e.errno(),
            reason: e.to_string(),
        }
    }
}

/// header followed by the serialized body
pub fn encode<T: Serialize>(msg: &T) -> Result<Vec<u8>> {
    let body = bincode::serialize(msg)?;
    if body.len() as u64 > MAX_BODY_LENGTH {
        return Err(Error::MalformedFrame(format!("body of {} bytes exceeds limit", body.len())));
    }
    let mut buf = Vec::with_capacity(HEADER_LENGTH + body.len());
    buf.extend_from_slice(&(body.len() as u64).to_be_bytes());
    buf.extend_from_slice(&body);
    Ok(buf)
}

/// body length announced by `header`
pub fn decode_header(header: &[u8]) -> Result<u64> {
    let raw: [u8; HEADER_LENGTH] = header
        .try_into()
        .map_err(|_| Error::MalformedFrame(format!("header of {} bytes", header.len())))?;
    let len = u64::from_be_bytes(raw);
    if len > MAX_BODY_LENGTH {
        return Err(Error::MalformedFrame(format!("body length {len} exceeds limit")));
    }
    Ok(len)
}

pub fn decode_body<T: DeserializeOwned>(body: &[u8]) -> Result<T> {
    Ok(bincode::deserialize(body)?)
}

/// `None` when the peer closed the stream between messages
pub async fn read_message<R, T>(r: &mut R) -> Result<Option<T>>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut header = [0u8; HEADER_LENGTH];
    match r.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = decode_header(&header)?;
    let mut body = vec![0u8; len as usize];
    r.read_exact(&mut body).await?;
    decode_body(&body).map(Some)
}

pub async fn write_message<W, T>(w: &mut W, msg: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let buf = encode(msg)?;
    w.write_all(&buf).await?;
    w.flush().await?;
    Ok(())
}
