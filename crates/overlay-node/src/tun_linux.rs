//! A minimal concrete `Tun` (§6 external collaborator) for Linux,
//! standing in the same role this codebase's own `InMemoryPeerStore`/
//! `StaticTokenValidator` play for the controller: a capability trait
//! stays the real seam, but the binary needs something concrete to
//! actually run against. Modeled on this codebase's own
//! `/dev/net/tun` + `TUNSETIFF` open sequence, with address
//! configuration done through the plain `SIOCSIFADDR`/`SIOCSIFNETMASK`/
//! `SIOCSIFFLAGS` ioctl family rather than a netlink round trip, since
//! route installation beyond "assign this address to this interface"
//! is out of scope here.

use std::ffi::{c_short, c_uchar};
use std::net::Ipv4Addr;
use std::os::fd::{AsRawFd, RawFd};

use async_trait::async_trait;
use overlay_model::{ErrorKind, OverlayError, OverlayPrefix};
use overlay_ports::Tun;
use tokio::io::unix::AsyncFd;

const IFACE_NAME: &str = "overlay0";
const TUN_FILE: &[u8] = b"/dev/net/tun\0";
const TUNSETIFF: libc::c_ulong = 0x4004_54ca;
const SIOCSIFADDR: libc::c_ulong = 0x8916;
const SIOCSIFNETMASK: libc::c_ulong = 0x891b;
const SIOCSIFFLAGS: libc::c_ulong = 0x8914;
const DEFAULT_MTU: u16 = 1380;

#[repr(C)]
union IfrIfru {
    ifru_addr: libc::sockaddr,
    ifru_addr_v4: libc::sockaddr_in,
    ifru_flags: c_short,
}

#[repr(C)]
struct Ifreq {
    ifr_name: [c_uchar; libc::IFNAMSIZ],
    ifr_ifru: IfrIfru,
}

fn iface_name_bytes() -> [c_uchar; libc::IFNAMSIZ] {
    let mut name = [0u8; libc::IFNAMSIZ];
    name[..IFACE_NAME.len()].copy_from_slice(IFACE_NAME.as_bytes());
    name
}

fn ipv4_ifru(addr: Ipv4Addr) -> IfrIfru {
    IfrIfru {
        ifru_addr_v4: libc::sockaddr_in {
            sin_family: libc::AF_INET as libc::sa_family_t,
            sin_port: 0,
            sin_addr: libc::in_addr {
                s_addr: u32::from_ne_bytes(addr.octets()),
            },
            sin_zero: [0; 8],
        },
    }
}

fn io_error(context: &'static str) -> OverlayError {
    OverlayError::new(ErrorKind::Fatal, format!("{context}: {}", std::io::Error::last_os_error()))
}

/// Owns the tun file descriptor; `read`/`write` go through an
/// `AsyncFd` so the non-blocking fd integrates with tokio's reactor
/// instead of needing its own blocking-pool thread.
pub struct LinuxTun {
    fd: AsyncFd<OwnedTunFd>,
    control_socket: RawFd,
}

struct OwnedTunFd(RawFd);

impl AsRawFd for OwnedTunFd {
    fn as_raw_fd(&self) -> RawFd {
        self.0
    }
}

impl Drop for OwnedTunFd {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.0);
        }
    }
}

impl LinuxTun {
    /// Opens `/dev/net/tun`, requests a plain IP tun (no packet
    /// info, single queue) named [`IFACE_NAME`], and sets it
    /// non-blocking so it can be wrapped in an `AsyncFd`.
    pub fn open() -> Result<Self, OverlayError> {
        let raw_fd = unsafe { libc::open(TUN_FILE.as_ptr().cast(), libc::O_RDWR) };
        if raw_fd < 0 {
            return Err(io_error("opening /dev/net/tun"));
        }

        let mut ifr = Ifreq {
            ifr_name: iface_name_bytes(),
            ifr_ifru: IfrIfru {
                ifru_flags: (libc::IFF_TUN | libc::IFF_NO_PI) as c_short,
            },
        };
        if unsafe { libc::ioctl(raw_fd, TUNSETIFF, &mut ifr) } < 0 {
            unsafe { libc::close(raw_fd) };
            return Err(io_error("TUNSETIFF"));
        }

        let flags = unsafe { libc::fcntl(raw_fd, libc::F_GETFL) };
        if flags < 0 || unsafe { libc::fcntl(raw_fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
            unsafe { libc::close(raw_fd) };
            return Err(io_error("setting tun fd non-blocking"));
        }

        let control_socket = unsafe { libc::socket(libc::AF_INET, libc::SOCK_DGRAM, 0) };
        if control_socket < 0 {
            unsafe { libc::close(raw_fd) };
            return Err(io_error("opening ioctl control socket"));
        }

        let fd = AsyncFd::new(OwnedTunFd(raw_fd)).map_err(|_| OverlayError::new(ErrorKind::Fatal, "registering tun fd with reactor"))?;

        Ok(Self { fd, control_socket })
    }

    fn ioctl_with_addr(&self, request: libc::c_ulong, addr: Ipv4Addr) -> Result<(), OverlayError> {
        let mut ifr = Ifreq {
            ifr_name: iface_name_bytes(),
            ifr_ifru: ipv4_ifru(addr),
        };
        if unsafe { libc::ioctl(self.control_socket, request, &mut ifr) } < 0 {
            return Err(io_error("address ioctl"));
        }
        Ok(())
    }

    fn set_up(&self) -> Result<(), OverlayError> {
        let mut ifr = Ifreq {
            ifr_name: iface_name_bytes(),
            ifr_ifru: IfrIfru {
                ifru_flags: (libc::IFF_UP | libc::IFF_RUNNING) as c_short,
            },
        };
        if unsafe { libc::ioctl(self.control_socket, SIOCSIFFLAGS, &mut ifr) } < 0 {
            return Err(io_error("SIOCSIFFLAGS"));
        }
        Ok(())
    }
}

impl Drop for LinuxTun {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.control_socket);
        }
    }
}

#[async_trait]
impl Tun for LinuxTun {
    async fn read(&self, buf: &mut [u8]) -> Result<usize, OverlayError> {
        loop {
            let mut guard = self
                .fd
                .readable()
                .await
                .map_err(|e| OverlayError::new(ErrorKind::Transient, format!("tun fd not readable: {e}")))?;
            match guard.try_io(|inner| {
                let n = unsafe { libc::read(inner.get_ref().as_raw_fd(), buf.as_mut_ptr().cast(), buf.len()) };
                if n < 0 {
                    Err(std::io::Error::last_os_error())
                } else {
                    Ok(n as usize)
                }
            }) {
                Ok(result) => return result.map_err(|e| OverlayError::new(ErrorKind::Transient, format!("tun read: {e}"))),
                Err(_would_block) => continue,
            }
        }
    }

    async fn write(&self, buf: &[u8]) -> Result<usize, OverlayError> {
        loop {
            let mut guard = self
                .fd
                .writable()
                .await
                .map_err(|e| OverlayError::new(ErrorKind::Transient, format!("tun fd not writable: {e}")))?;
            match guard.try_io(|inner| {
                let n = unsafe { libc::write(inner.get_ref().as_raw_fd(), buf.as_ptr().cast(), buf.len()) };
                if n < 0 {
                    Err(std::io::Error::last_os_error())
                } else {
                    Ok(n as usize)
                }
            }) {
                Ok(result) => return result.map_err(|e| OverlayError::new(ErrorKind::Transient, format!("tun write: {e}"))),
                Err(_would_block) => continue,
            }
        }
    }

    fn mtu(&self) -> u16 {
        DEFAULT_MTU
    }

    async fn configure_ip(&self, address: Ipv4Addr, prefix: OverlayPrefix) -> Result<(), OverlayError> {
        let netmask = netmask_from_prefix_len(prefix.netmask());
        self.ioctl_with_addr(SIOCSIFADDR, address)?;
        self.ioctl_with_addr(SIOCSIFNETMASK, netmask)?;
        self.set_up()?;
        Ok(())
    }

    async fn close(&self) -> Result<(), OverlayError> {
        Ok(())
    }
}

fn netmask_from_prefix_len(len: u8) -> Ipv4Addr {
    let bits: u32 = if len == 0 { 0 } else { u32::MAX << (32 - len as u32) };
    Ipv4Addr::from(bits)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn netmask_from_prefix_len_matches_slash_24() {
        assert_eq!(netmask_from_prefix_len(24), Ipv4Addr::new(255, 255, 255, 0));
    }

    #[test]
    fn netmask_from_prefix_len_matches_slash_32() {
        assert_eq!(netmask_from_prefix_len(32), Ipv4Addr::new(255, 255, 255, 255));
    }
}
