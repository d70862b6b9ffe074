//! Direct peer-to-peer channel: an ordered reliable TCP socket with
//! newline-delimited JSON frames.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;

use crate::error::{NetworkError, NetworkResult};

/// Write half; clones share one underlying socket.
#[derive(Clone)]
pub struct DirectSender {
    writer: Arc<Mutex<OwnedWriteHalf>>,
}

impl DirectSender {
    pub async fn send(&self, frame: &str) -> NetworkResult<()> {
        let mut writer = self.writer.lock().await;
        writer
            .write_all(frame.as_bytes())
            .await
            .map_err(|err| NetworkError::Transport(err.to_string()))?;
        writer
            .write_all(b"\n")
            .await
            .map_err(|err| NetworkError::Transport(err.to_string()))?;
        writer
            .flush()
            .await
            .map_err(|err| NetworkError::Transport(err.to_string()))
    }

    pub async fn close(&self) {
        let _ = self.writer.lock().await.shutdown().await;
    }
}

/// Read half.
pub struct DirectReceiver {
    lines: Lines<BufReader<OwnedReadHalf>>,
}

impl DirectReceiver {
    pub async fn next_frame(&mut self) -> Option<String> {
        loop {
            match self.lines.next_line().await {
                Ok(Some(line)) if line.is_empty() => continue,
                Ok(Some(line)) => return Some(line),
                Ok(None) | Err(_) => return None,
            }
        }
    }
}

/// Dial a peer's direct address. The caller bounds this with the configured
/// connect timeout.
pub async fn connect(addr: SocketAddr) -> NetworkResult<(DirectSender, DirectReceiver)> {
    let stream = TcpStream::connect(addr)
        .await
        .map_err(|err| NetworkError::Transport(format!("dial {addr}: {err}")))?;
    Ok(split(stream))
}

/// Split an established socket into channel halves.
pub fn split(stream: TcpStream) -> (DirectSender, DirectReceiver) {
    let _ = stream.set_nodelay(true);
    let (read, write) = stream.into_split();
    (
        DirectSender {
            writer: Arc::new(Mutex::new(write)),
        },
        DirectReceiver {
            lines: BufReader::new(read).lines(),
        },
    )
}

/// Accept loop endpoint for inbound direct connections.
pub struct DirectListener {
    inner: TcpListener,
}

impl DirectListener {
    pub async fn bind(addr: SocketAddr) -> NetworkResult<Self> {
        let inner = TcpListener::bind(addr)
            .await
            .map_err(|err| NetworkError::Fatal(format!("bind {addr}: {err}")))?;
        Ok(DirectListener { inner })
    }

    /// The bound address; useful when binding port 0.
    pub fn local_addr(&self) -> NetworkResult<SocketAddr> {
        self.inner
            .local_addr()
            .map_err(|err| NetworkError::Fatal(err.to_string()))
    }

    pub async fn accept(&self) -> NetworkResult<(SocketAddr, DirectSender, DirectReceiver)> {
        let (stream, addr) = self
            .inner
            .accept()
            .await
            .map_err(|err| NetworkError::Transport(err.to_string()))?;
        let (sender, receiver) = split(stream);
        Ok((addr, sender, receiver))
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[tokio::test]
    async fn frames_survive_the_socket() {
        let listener = DirectListener::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let addr = listener.local_addr().unwrap();

        let accept = tokio::spawn(async move { listener.accept().await.unwrap() });
        let (sender, mut receiver) = connect(addr).await.unwrap();
        let (_, peer_sender, mut peer_receiver) = accept.await.unwrap();

        sender.send(r#"{"seq":1}"#).await.unwrap();
        sender.send(r#"{"seq":2}"#).await.unwrap();
        assert_eq!(peer_receiver.next_frame().await.unwrap(), r#"{"seq":1}"#);
        assert_eq!(peer_receiver.next_frame().await.unwrap(), r#"{"seq":2}"#);

        peer_sender.send(r#"{"ack":2}"#).await.unwrap();
        assert_eq!(receiver.next_frame().await.unwrap(), r#"{"ack":2}"#);
    }

    #[tokio::test]
    async fn closed_socket_ends_the_stream() {
        let listener = DirectListener::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let addr = listener.local_addr().unwrap();

        let accept = tokio::spawn(async move { listener.accept().await.unwrap() });
        let (sender, _receiver) = connect(addr).await.unwrap();
        let (_, _, mut peer_receiver) = accept.await.unwrap();

        sender.close().await;
        assert_eq!(peer_receiver.next_frame().await, None);
    }
}
