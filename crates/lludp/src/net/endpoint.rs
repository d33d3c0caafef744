use std::io;
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};

/// Non-blocking UDP socket bound for one circuit.
pub struct NetworkEndpoint {
    socket: UdpSocket,
    local_addr: SocketAddr,
    remote_addr: Option<SocketAddr>,
    recv_buffer: Vec<u8>,
}

impl NetworkEndpoint {
    pub fn bind<A: ToSocketAddrs>(addr: A, receive_buffer: usize) -> io::Result<Self> {
        let socket = UdpSocket::bind(addr)?;
        socket.set_nonblocking(true)?;

        let local_addr = socket.local_addr()?;

        Ok(Self {
            socket,
            local_addr,
            remote_addr: None,
            recv_buffer: vec![0u8; receive_buffer],
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    pub fn set_remote(&mut self, addr: SocketAddr) {
        self.remote_addr = Some(addr);
    }

    pub fn send(&self, data: &[u8]) -> io::Result<usize> {
        let addr = self
            .remote_addr
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "No remote address set"))?;
        self.socket.send_to(data, addr)
    }

    /// Drains every datagram currently queued on the socket. Datagrams from
    /// anything other than the remote simulator are discarded.
    pub fn receive(&mut self) -> io::Result<Vec<Vec<u8>>> {
        let mut datagrams = Vec::new();

        loop {
            match self.socket.recv_from(&mut self.recv_buffer) {
                Ok((size, addr)) => {
                    if Some(addr) != self.remote_addr {
                        log::debug!("Ignoring {} bytes from unknown peer {}", size, addr);
                        continue;
                    }
                    datagrams.push(self.recv_buffer[..size].to_vec());
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                // ICMP port unreachable from an earlier send on some platforms.
                Err(ref e) if e.kind() == io::ErrorKind::ConnectionReset => continue,
                Err(e) => return Err(e),
            }
        }

        Ok(datagrams)
    }
}

/// Resolves `host:port`, preferring IPv4 since simulators rarely listen on v6.
pub fn resolve(host: &str, port: u16) -> io::Result<SocketAddr> {
    let addrs: Vec<SocketAddr> = (host, port).to_socket_addrs()?.collect();
    addrs
        .iter()
        .find(|addr| addr.is_ipv4())
        .or_else(|| addrs.first())
        .copied()
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::AddrNotAvailable,
                format!("{host}:{port} did not resolve"),
            )
        })
}
