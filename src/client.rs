use bytes::{Bytes, BytesMut};
use futures::SinkExt;
use std::io;
use tokio::io::AsyncReadExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio_util::codec::FramedWrite;

use crate::codec::RequestCodec;

/// Minimal segment client: requests one segment at a time and reads it back in full.
pub struct Client {
    reader: OwnedReadHalf,
    writer: FramedWrite<OwnedWriteHalf, RequestCodec>,
}

impl Client {
    pub async fn connect(addr: impl ToSocketAddrs) -> io::Result<Client> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;

        let (reader, writer) = stream.into_split();

        Ok(Client {
            reader,
            writer: FramedWrite::new(writer, RequestCodec::default()),
        })
    }

    /// Sends a request without waiting for the response.
    pub async fn send_request(&mut self, size: u64) -> io::Result<()> {
        self.writer.send(size).await?;
        Ok(())
    }

    /// Reads exactly `size` response bytes.
    pub async fn read_segment(&mut self, size: u64) -> io::Result<Bytes> {
        let len = usize::try_from(size)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "segment too large"))?;

        let mut segment = BytesMut::zeroed(len);
        self.reader.read_exact(&mut segment).await?;

        Ok(segment.freeze())
    }

    /// Requests a segment of `size` bytes and waits for all of it.
    pub async fn fetch(&mut self, size: u64) -> io::Result<Bytes> {
        self.send_request(size).await?;
        self.read_segment(size).await
    }

    /// Closes the write side; the server sees the connection as closed.
    pub async fn close(mut self) -> io::Result<()> {
        SinkExt::<u64>::close(&mut self.writer).await?;
        Ok(())
    }
}
