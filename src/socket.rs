//! The UDP socket owned by a connection's reactor.

use std::io::Result;
use std::net::SocketAddr;
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;

/// Socket buffer size requested on bind. Loss recovery works a lot better when the kernel
/// does not drop bursts before we see them.
const RECV_BUFFER_SIZE: usize = 8_000_000;

/// A UDP socket configured for SRT traffic.
#[derive(Debug)]
pub struct UdpTransport {
    socket: UdpSocket,
}

impl UdpTransport {
    /// Binds a non-blocking UDP socket on `addr`.
    pub fn bind(addr: SocketAddr) -> Result<Self> {
        let domain = match addr {
            SocketAddr::V4(_) => Domain::IPV4,
            SocketAddr::V6(_) => Domain::IPV6,
        };

        let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_nonblocking(true)?;
        socket.set_recv_buffer_size(RECV_BUFFER_SIZE)?;
        socket.bind(&addr.into())?;

        let socket = UdpSocket::from_std(socket.into())?;

        Ok(Self { socket })
    }

    #[inline]
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub async fn send_to(&self, buf: &[u8], addr: SocketAddr) -> Result<usize> {
        self.socket.send_to(buf, addr).await
    }

    /// Receives one datagram, waiting at most `timeout`. Returns `None` on timeout.
    ///
    /// This is the single suspension point of the connection reactor.
    pub async fn recv_from_timeout(
        &self,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<Option<(usize, SocketAddr)>> {
        match tokio::time::timeout(timeout, self.socket.recv_from(buf)).await {
            Ok(Ok((len, addr))) => Ok(Some((len, addr))),
            Ok(Err(err)) => Err(err),
            Err(_) => Ok(None),
        }
    }

    /// Receives one datagram, waiting indefinitely.
    pub async fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr)> {
        self.socket.recv_from(buf).await
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::UdpTransport;

    #[tokio::test]
    async fn test_roundtrip_and_timeout() {
        let a = UdpTransport::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let b = UdpTransport::bind("127.0.0.1:0".parse().unwrap()).unwrap();

        let mut buf = [0u8; 64];

        // Nothing pending: the receive times out.
        let received = a
            .recv_from_timeout(&mut buf, Duration::from_millis(10))
            .await
            .unwrap();
        assert!(received.is_none());

        b.send_to(b"ping", a.local_addr().unwrap()).await.unwrap();

        let (len, addr) = a
            .recv_from_timeout(&mut buf, Duration::from_secs(1))
            .await
            .unwrap()
            .expect("datagram expected");
        assert_eq!(&buf[..len], b"ping");
        assert_eq!(addr, b.local_addr().unwrap());
    }
}
