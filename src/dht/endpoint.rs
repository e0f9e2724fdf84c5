use super::error::DhtError;
use super::node::NodeId;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use tokio::net::UdpSocket;

/// Well-known addresses used only to ask the kernel for a route; nothing is
/// ever sent to them.
const ROUTE_PROBE_V4: SocketAddr = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8)), 53);
const ROUTE_PROBE_V6: SocketAddr = SocketAddr::new(
    IpAddr::V6(Ipv6Addr::new(0x2001, 0x4860, 0x4860, 0, 0, 0, 0, 0x8888)),
    53,
);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Family {
    V4,
    V6,
}

impl Family {
    pub fn of(addr: &SocketAddr) -> Self {
        match addr {
            SocketAddr::V4(_) => Family::V4,
            SocketAddr::V6(_) => Family::V6,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Family::V4 => "ipv4",
            Family::V6 => "ipv6",
        }
    }

    /// Local interface address the kernel would use to reach the internet.
    ///
    /// Connecting a UDP socket only selects a route, so no packet leaves the
    /// host.
    pub fn discover_local_ip(self) -> Option<IpAddr> {
        let (bind, probe) = match self {
            Family::V4 => (SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)), ROUTE_PROBE_V4),
            Family::V6 => (SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0)), ROUTE_PROBE_V6),
        };

        let socket = std::net::UdpSocket::bind(bind).ok()?;
        socket.connect(probe).ok()?;
        let ip = socket.local_addr().ok()?.ip();
        (!ip.is_unspecified()).then_some(ip)
    }
}

/// One bound UDP socket and the node id advertised through it.
pub struct Endpoint {
    id: NodeId,
    addr: SocketAddr,
    socket: UdpSocket,
}

impl Endpoint {
    /// Binds `addr`. Must run inside a Tokio runtime, since the socket is
    /// registered with its reactor.
    pub(crate) fn bind(id: NodeId, addr: SocketAddr) -> Result<Self, DhtError> {
        let std_socket = std::net::UdpSocket::bind(addr)?;
        std_socket.set_nonblocking(true)?;
        let socket = UdpSocket::from_std(std_socket)?;
        let addr = socket.local_addr()?;

        Ok(Self { id, addr, socket })
    }

    pub fn id(&self) -> &NodeId {
        &self.id
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn family(&self) -> Family {
        Family::of(&self.addr)
    }

    pub(crate) fn socket(&self) -> &UdpSocket {
        &self.socket
    }
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("id", &self.id)
            .field("addr", &self.addr)
            .finish()
    }
}
