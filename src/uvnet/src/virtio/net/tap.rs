use libc::{
    c_char, c_int, ifreq, IFF_NO_PI, IFF_TAP, IFF_VNET_HDR, TUN_F_CSUM, TUN_F_TSO4, TUN_F_UFO,
};
use nix::fcntl::{open, OFlag};
use nix::sys::stat::Mode;
use nix::{ioctl_write_int, ioctl_write_ptr};
use std::fmt;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::{mem, ptr};

use super::HwFeatures;

ioctl_write_ptr!(tunsetiff, b'T', 202, c_int);
ioctl_write_int!(tunsetoffload, b'T', 208);
ioctl_write_ptr!(tunsetvnethdrsz, b'T', 216, c_int);

#[derive(Debug)]
pub enum TapError {
    /// The interface name does not fit in IFNAMSIZ.
    NameTooLong,
    OpenNetTun(nix::Error),
    TunSetIff(nix::Error),
    TunSetVnetHdrSz(nix::Error),
    TunSetOffload(nix::Error),
}

impl fmt::Display for TapError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            TapError::NameTooLong => write!(f, "interface name too long"),
            TapError::OpenNetTun(e) => write!(f, "opening /dev/net/tun: {e}"),
            TapError::TunSetIff(e) => write!(f, "TUNSETIFF: {e}"),
            TapError::TunSetVnetHdrSz(e) => write!(f, "TUNSETVNETHDRSZ: {e}"),
            TapError::TunSetOffload(e) => write!(f, "TUNSETOFFLOAD: {e}"),
        }
    }
}

impl std::error::Error for TapError {}

/// The TAP interface backing the device. The host reads outbound frames
/// from it and writes inbound frames to it; the driver itself only
/// configures it and hands the fd to vhost.
pub(crate) struct Tap {
    fd: OwnedFd,
}

impl Tap {
    /// Open `name` and configure it for virtio-net headers of
    /// `vnet_hdr_len` bytes plus whatever offloads were negotiated.
    pub fn open(name: &str, hw: &HwFeatures, vnet_hdr_len: usize) -> Result<Tap, TapError> {
        if name.len() >= libc::IF_NAMESIZE {
            return Err(TapError::NameTooLong);
        }

        let fd = open(
            "/dev/net/tun",
            OFlag::O_RDWR | OFlag::O_NONBLOCK,
            Mode::empty(),
        )
        .map_err(TapError::OpenNetTun)?;
        let fd = unsafe { OwnedFd::from_raw_fd(fd) };

        let mut req: ifreq = unsafe { mem::zeroed() };
        unsafe {
            ptr::copy_nonoverlapping(
                name.as_ptr() as *const c_char,
                req.ifr_name.as_mut_ptr(),
                name.len(),
            );
        }
        req.ifr_ifru.ifru_flags = IFF_TAP as i16 | IFF_NO_PI as i16 | IFF_VNET_HDR as i16;

        // The kernel only honors segmentation offloads when checksum
        // offload comes with them.
        let mut offload_flags: u64 = 0;
        if hw.tx_csum_offload && hw.rx_csum_offload {
            offload_flags |= TUN_F_CSUM as u64;
            if hw.tx_tso {
                offload_flags |= TUN_F_TSO4 as u64;
            }
            if hw.tx_ufo {
                offload_flags |= TUN_F_UFO as u64;
            }
        }

        unsafe {
            tunsetiff(fd.as_raw_fd(), &mut req as *mut _ as *mut _)
                .map_err(TapError::TunSetIff)?;
            tunsetvnethdrsz(fd.as_raw_fd(), &(vnet_hdr_len as c_int))
                .map_err(TapError::TunSetVnetHdrSz)?;
            tunsetoffload(fd.as_raw_fd(), offload_flags).map_err(TapError::TunSetOffload)?;
        }
        debug!("tap {name} configured, offload flags {offload_flags:#x}");

        Ok(Tap { fd })
    }
}

impl AsRawFd for Tap {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}
