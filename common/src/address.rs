use std::{
    fmt,
    net::{Ipv4Addr, SocketAddr, ToSocketAddrs},
    path::{Path, PathBuf},
    str::FromStr,
};

use crate::{
    config::{SOCKET_PREFIX, SOCKET_SUFFIX, SOCKET_SUFFIX_BYTES},
    error::IpcError,
};

const UNIX_SCHEME: &str = "unix://";
const TCP_SCHEME: &str = "tcp://";

/// Where a server listens: a unix-domain socket path or a TCP address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Address {
    /// Unix domain socket path
    Unix(PathBuf),
    /// Host and port
    Tcp(SocketAddr),
}

impl Address {
    /// Synthesizes a private, collision-resistant listening address.
    ///
    /// On unix this is a fresh socket path under the temp directory; elsewhere
    /// an ephemeral loopback port.
    pub fn synthesize() -> Self {
        #[cfg(unix)]
        {
            let suffix = hex::encode(rand::random::<[u8; SOCKET_SUFFIX_BYTES]>());
            let name = format!("{SOCKET_PREFIX}{suffix}{SOCKET_SUFFIX}");
            Address::Unix(std::env::temp_dir().join(name))
        }

        #[cfg(not(unix))]
        {
            Address::Tcp(SocketAddr::from((Ipv4Addr::LOCALHOST, 0)))
        }
    }

    /// Loopback TCP address with an OS-assigned port.
    pub fn loopback() -> Self {
        Address::Tcp(SocketAddr::from((Ipv4Addr::LOCALHOST, 0)))
    }

    pub fn unix(path: impl Into<PathBuf>) -> Self {
        Address::Unix(path.into())
    }

    pub fn as_path(&self) -> Option<&Path> {
        match self {
            Address::Unix(path) => Some(path),
            Address::Tcp(_) => None,
        }
    }

    pub fn is_unix(&self) -> bool {
        matches!(self, Address::Unix(_))
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Unix(path) => write!(f, "{UNIX_SCHEME}{}", path.display()),
            Address::Tcp(addr) => write!(f, "{TCP_SCHEME}{addr}"),
        }
    }
}

impl FromStr for Address {
    type Err = IpcError;

    /// Accepts `unix:///path`, `tcp://host:port`, a bare `host:port` or a
    /// bare filesystem path.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(IpcError::InvalidAddress("empty address".to_string()));
        }

        if let Some(path) = s.strip_prefix(UNIX_SCHEME) {
            if path.is_empty() {
                return Err(IpcError::InvalidAddress(s.to_string()));
            }
            return Ok(Address::Unix(PathBuf::from(path)));
        }

        if let Some(host) = s.strip_prefix(TCP_SCHEME) {
            return resolve_tcp(host).ok_or_else(|| IpcError::InvalidAddress(s.to_string()));
        }

        if s.contains("://") {
            return Err(IpcError::InvalidAddress(format!("unsupported scheme: {s}")));
        }

        if let Ok(addr) = s.parse::<SocketAddr>() {
            return Ok(Address::Tcp(addr));
        }

        if s.contains('/') || s.contains('\\') || s.ends_with(SOCKET_SUFFIX) {
            return Ok(Address::Unix(PathBuf::from(s)));
        }

        resolve_tcp(s).ok_or_else(|| IpcError::InvalidAddress(s.to_string()))
    }
}

impl From<SocketAddr> for Address {
    fn from(addr: SocketAddr) -> Self {
        Address::Tcp(addr)
    }
}

impl From<PathBuf> for Address {
    fn from(path: PathBuf) -> Self {
        Address::Unix(path)
    }
}

impl From<&Path> for Address {
    fn from(path: &Path) -> Self {
        Address::Unix(path.to_path_buf())
    }
}

fn resolve_tcp(host: &str) -> Option<Address> {
    host.to_socket_addrs().ok()?.next().map(Address::Tcp)
}
