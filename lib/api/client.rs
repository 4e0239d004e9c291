use super::message::{read_message, write_message, Request, Response};
use crate::error::{Error, Result};
use std::path::Path;
use tokio::net::UnixStream;

pub struct Client {
    stream: UnixStream,
}

impl Client {
    pub async fn connect(socket: &Path) -> Result<Self> {
        let stream = UnixStream::connect(socket).await?;
        Ok(Self { stream })
    }

    /// send one request and wait for its response
    pub async fn call(&mut self, req: &Request) -> Result<Response> {
        write_message(&mut self.stream, req).await?;
        read_message(&mut self.stream)
            .await?
            .ok_or_else(|| Error::MalformedFrame("connection closed before response".to_string()))
    }
}
