use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::buffer::{encode_chunk, CHUNK_CLOSE};
use crate::filter::BodySource;
use crate::message::{HttpMessage, Response};

/// Largest body chunk written at once.
pub const MAX_CHUNK_SIZE: usize = 16384;

/// Serializes a locally generated response. Bodies always go out chunked.
#[derive(Debug)]
pub struct ResponseWriter {
    response: Response,
    body: Option<BodySource>,
}

impl ResponseWriter {
    pub fn new(response: Response, body: Option<BodySource>) -> Self {
        Self { response, body }
    }

    /// Writes the head, then the body if there is one. Resolves once the
    /// body source is exhausted.
    pub async fn commit<W>(mut self, stream: &mut W) -> io::Result<()>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        if self.body.is_some() {
            self.response.headers.remove("content-length");
            self.response.headers.replace("Transfer-Encoding", "chunked");
        }
        stream.write_all(&self.response.to_bytes()).await?;

        match self.body {
            None => {}
            Some(BodySource::Bytes(data)) => {
                for chunk in data.chunks(MAX_CHUNK_SIZE) {
                    stream.write_all(&encode_chunk(chunk)).await?;
                }
                stream.write_all(CHUNK_CLOSE).await?;
            }
            Some(BodySource::Stream(mut reader)) => {
                write_stream(&mut reader, stream).await?;
                stream.write_all(CHUNK_CLOSE).await?;
            }
        }
        stream.flush().await
    }
}

async fn write_stream<R, W>(reader: &mut R, stream: &mut W) -> io::Result<()>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut buf = vec![0u8; MAX_CHUNK_SIZE];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        stream.write_all(&encode_chunk(&buf[..n])).await?;
    }
}
