// HTTP output: serves the stream to the first client that connects.

use std::io;
use std::net::SocketAddr;

use tokio::io::{AsyncReadExt, AsyncWriteExt, BufWriter};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info};

const MAX_REQUEST_HEAD: usize = 8 * 1024;
const RESPONSE_HEAD: &[u8] = b"HTTP/1.1 200 OK\r\n\
Server: slink\r\n\
Content-Type: video/unknown\r\n\
Connection: close\r\n\r\n";

pub struct HttpServer {
    listener: TcpListener,
}

impl HttpServer {
    /// Binds on all interfaces. Port 0 picks a free port.
    pub async fn bind(port: u16) -> io::Result<Self> {
        let listener = TcpListener::bind(("0.0.0.0", port)).await?;
        Ok(Self { listener })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Waits for a client, consumes its request head and answers with the
    /// response head. The body follows through [`HttpOutput::write`].
    pub async fn accept(&self) -> io::Result<HttpOutput> {
        info!(
            "Starting server, access with one of:\n http://127.0.0.1:{}/",
            self.local_addr()?.port()
        );
        let (mut socket, peer) = self.listener.accept().await?;
        debug!(%peer, "Got HTTP request");

        read_request_head(&mut socket).await?;
        socket.write_all(RESPONSE_HEAD).await?;

        Ok(HttpOutput {
            stream: BufWriter::new(socket),
        })
    }
}

async fn read_request_head(socket: &mut TcpStream) -> io::Result<()> {
    let mut head = Vec::with_capacity(512);
    let mut chunk = [0u8; 1024];
    loop {
        let n = socket.read(&mut chunk).await?;
        if n == 0 {
            return Err(io::Error::from(io::ErrorKind::ConnectionAborted));
        }
        head.extend_from_slice(&chunk[..n]);
        if head.windows(4).any(|w| w == b"\r\n\r\n") {
            return Ok(());
        }
        if head.len() > MAX_REQUEST_HEAD {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "request head too large"));
        }
    }
}

pub struct HttpOutput {
    stream: BufWriter<TcpStream>,
}

impl HttpOutput {
    pub async fn write(&mut self, data: &[u8]) -> io::Result<()> {
        self.stream.write_all(data).await?;
        self.stream.flush().await
    }

    pub async fn close(&mut self) -> io::Result<()> {
        self.stream.flush().await?;
        self.stream.get_mut().shutdown().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn serves_one_client() {
        let server = HttpServer::bind(0).await.unwrap();
        let port = server.local_addr().unwrap().port();

        let client = tokio::spawn(async move {
            let mut socket = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
            socket
                .write_all(b"GET / HTTP/1.1\r\nHost: localhost\r\n\r\n")
                .await
                .unwrap();
            let mut response = Vec::new();
            socket.read_to_end(&mut response).await.unwrap();
            String::from_utf8(response).unwrap()
        });

        let mut output = server.accept().await.unwrap();
        output.write(b"payload").await.unwrap();
        output.close().await.unwrap();

        let response = client.await.unwrap();
        assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(response.contains("Content-Type: video/unknown\r\n"));
        assert!(response.ends_with("\r\n\r\npayload"));
    }
}
