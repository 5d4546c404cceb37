use std::net::Ipv4Addr;

use async_trait::async_trait;
use overlay_model::{OverlayError, OverlayPrefix};

/// The host virtual network interface. A blocking byte-oriented
/// contract, matching how every tun implementation in this space
/// actually behaves under the hood (a file descriptor read/write
/// pair); the node wraps it in its own async tasks rather than
/// requiring the port itself to be async.
#[async_trait]
pub trait Tun: Send + Sync {
    async fn read(&self, buf: &mut [u8]) -> Result<usize, OverlayError>;

    async fn write(&self, buf: &[u8]) -> Result<usize, OverlayError>;

    fn mtu(&self) -> u16;

    async fn configure_ip(&self, address: Ipv4Addr, prefix: OverlayPrefix) -> Result<(), OverlayError>;

    async fn close(&self) -> Result<(), OverlayError>;
}
