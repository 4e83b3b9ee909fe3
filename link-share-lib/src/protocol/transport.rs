//! Datagram I/O for one [`super::engine::ConnectionContext`], abstracted so
//! engine tests never touch a real socket.

use std::io;
use std::net::{Ipv6Addr, SocketAddr, SocketAddrV6};

use async_trait::async_trait;
use socket2::{Domain, Socket, Type};

#[async_trait]
pub trait Transport: Send + Sync {
    async fn send_to(&self, payload: &[u8], dest: SocketAddr) -> io::Result<()>;
    async fn recv(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)>;
}

pub struct RealTransport {
    socket: tokio::net::UdpSocket,
}

impl RealTransport {
    /// Bind directly to the multicast group and join it on `interface_index`.
    /// Every datagram this socket ever yields is therefore already destined
    /// to the group, which satisfies the "discard as errant" destination
    /// check by construction instead of by parsing `IPV6_PKTINFO` ancillary
    /// data.
    pub fn join(group: Ipv6Addr, port: u16, interface_index: u32) -> io::Result<Self> {
        let socket = Socket::new(Domain::IPV6, Type::DGRAM, None)?;
        socket.set_reuse_address(true)?;
        socket.set_only_v6(true)?;
        let bind_addr: SocketAddr = SocketAddrV6::new(group, port, 0, interface_index).into();
        socket.bind(&bind_addr.into())?;
        socket.join_multicast_v6(&group, interface_index)?;
        socket.set_nonblocking(true)?;
        let std_socket = std::net::UdpSocket::from(socket);
        let socket = tokio::net::UdpSocket::from_std(std_socket)?;
        Ok(Self { socket })
    }
}

#[async_trait]
impl Transport for RealTransport {
    async fn send_to(&self, payload: &[u8], dest: SocketAddr) -> io::Result<()> {
        self.socket.send_to(payload, dest).await?;
        Ok(())
    }

    async fn recv(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        self.socket.recv_from(buf).await
    }
}

#[cfg(test)]
pub mod mocks {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};
    use tokio::sync::Notify;

    #[derive(Default)]
    pub struct MockTransport {
        pub sent: Arc<Mutex<Vec<(Vec<u8>, SocketAddr)>>>,
        inbox: Arc<Mutex<VecDeque<(Vec<u8>, SocketAddr)>>>,
        notify: Arc<Notify>,
    }

    impl MockTransport {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn push_inbound(&self, payload: Vec<u8>, from: SocketAddr) {
            self.inbox.lock().unwrap().push_back((payload, from));
            self.notify.notify_one();
        }

        pub fn sent_count(&self) -> usize {
            self.sent.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl Transport for MockTransport {
        async fn send_to(&self, payload: &[u8], dest: SocketAddr) -> io::Result<()> {
            self.sent.lock().unwrap().push((payload.to_vec(), dest));
            Ok(())
        }

        async fn recv(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
            loop {
                if let Some((payload, from)) = self.inbox.lock().unwrap().pop_front() {
                    buf[..payload.len()].copy_from_slice(&payload);
                    return Ok((payload.len(), from));
                }
                self.notify.notified().await;
            }
        }
    }
}
