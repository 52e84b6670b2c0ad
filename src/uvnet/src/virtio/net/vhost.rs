use nix::fcntl::{open, OFlag};
use nix::sys::stat::Mode;
use nix::{ioctl_none, ioctl_read, ioctl_write_ptr};
use std::fmt;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use crate::virtio::bindings::{
    VhostMemory, VhostMemoryRegion, VhostVringAddr, VhostVringFile, VhostVringState,
};

const VHOST: u8 = 0xaf;

ioctl_read!(vhost_get_features, VHOST, 0x00, u64);
ioctl_write_ptr!(vhost_set_features, VHOST, 0x00, u64);
ioctl_none!(vhost_set_owner, VHOST, 0x01);
ioctl_write_ptr!(vhost_set_mem_table, VHOST, 0x03, VhostMemory);
ioctl_write_ptr!(vhost_set_vring_num, VHOST, 0x10, VhostVringState);
ioctl_write_ptr!(vhost_set_vring_addr, VHOST, 0x11, VhostVringAddr);
ioctl_write_ptr!(vhost_set_vring_kick, VHOST, 0x20, VhostVringFile);
ioctl_write_ptr!(vhost_set_vring_call, VHOST, 0x21, VhostVringFile);
ioctl_write_ptr!(vhost_net_set_backend, VHOST, 0x30, VhostVringFile);

/// The single memory region announced to vhost: guest-physical addresses
/// are our own virtual addresses, up to the user-space ceiling.
const IDENTITY_REGION_SIZE: u64 = (1u64 << 47) - 4096;

#[derive(Debug)]
pub enum VhostError {
    OpenVhostNet(nix::Error),
    SetOwner(nix::Error),
    GetFeatures(nix::Error),
    SetFeatures(nix::Error),
    SetMemTable(nix::Error),
    SetVringNum(nix::Error),
    SetVringAddr(nix::Error),
    SetVringKick(nix::Error),
    SetVringCall(nix::Error),
    SetBackend(nix::Error),
}

impl fmt::Display for VhostError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use self::VhostError::*;

        match self {
            OpenVhostNet(e) => write!(f, "opening /dev/vhost-net: {e}"),
            SetOwner(e) => write!(f, "VHOST_SET_OWNER: {e}"),
            GetFeatures(e) => write!(f, "VHOST_GET_FEATURES: {e}"),
            SetFeatures(e) => write!(f, "VHOST_SET_FEATURES: {e}"),
            SetMemTable(e) => write!(f, "VHOST_SET_MEM_TABLE: {e}"),
            SetVringNum(e) => write!(f, "VHOST_SET_VRING_NUM: {e}"),
            SetVringAddr(e) => write!(f, "VHOST_SET_VRING_ADDR: {e}"),
            SetVringKick(e) => write!(f, "VHOST_SET_VRING_KICK: {e}"),
            SetVringCall(e) => write!(f, "VHOST_SET_VRING_CALL: {e}"),
            SetBackend(e) => write!(f, "VHOST_NET_SET_BACKEND: {e}"),
        }
    }
}

impl std::error::Error for VhostError {}

/// Control-plane handle on /dev/vhost-net. Data never flows through here;
/// once the rings, eventfds and backend are wired up, the kernel moves
/// frames between the rings and the TAP device on its own.
pub(crate) struct VhostNet {
    fd: OwnedFd,
}

impl VhostNet {
    pub fn open() -> Result<VhostNet, VhostError> {
        let fd = open("/dev/vhost-net", OFlag::O_RDWR, Mode::empty())
            .map_err(VhostError::OpenVhostNet)?;
        let fd = unsafe { OwnedFd::from_raw_fd(fd) };
        Ok(VhostNet { fd })
    }

    pub fn set_owner(&self) -> Result<(), VhostError> {
        unsafe { vhost_set_owner(self.fd.as_raw_fd()) }.map_err(VhostError::SetOwner)?;
        Ok(())
    }

    pub fn get_features(&self) -> Result<u64, VhostError> {
        let mut features = 0u64;
        unsafe { vhost_get_features(self.fd.as_raw_fd(), &mut features) }
            .map_err(VhostError::GetFeatures)?;
        Ok(features)
    }

    pub fn set_features(&self, features: u64) -> Result<(), VhostError> {
        unsafe { vhost_set_features(self.fd.as_raw_fd(), &features) }
            .map_err(VhostError::SetFeatures)?;
        Ok(())
    }

    pub fn set_identity_mem_table(&self) -> Result<(), VhostError> {
        let table = VhostMemory {
            nregions: 1,
            padding: 0,
            regions: [VhostMemoryRegion {
                guest_phys_addr: 0,
                memory_size: IDENTITY_REGION_SIZE,
                userspace_addr: 0,
                flags_padding: 0,
            }],
        };
        unsafe { vhost_set_mem_table(self.fd.as_raw_fd(), &table) }
            .map_err(VhostError::SetMemTable)?;
        Ok(())
    }

    pub fn set_vring_num(&self, index: u32, num: u16) -> Result<(), VhostError> {
        let state = VhostVringState {
            index,
            num: num as u32,
        };
        unsafe { vhost_set_vring_num(self.fd.as_raw_fd(), &state) }
            .map_err(VhostError::SetVringNum)?;
        Ok(())
    }

    pub fn set_vring_addr(
        &self,
        index: u32,
        desc_addr: u64,
        used_addr: u64,
        avail_addr: u64,
    ) -> Result<(), VhostError> {
        let addr = VhostVringAddr {
            index,
            flags: 0,
            desc_user_addr: desc_addr,
            used_user_addr: used_addr,
            avail_user_addr: avail_addr,
            log_guest_addr: 0,
        };
        unsafe { vhost_set_vring_addr(self.fd.as_raw_fd(), &addr) }
            .map_err(VhostError::SetVringAddr)?;
        Ok(())
    }

    pub fn set_vring_kick(&self, index: u32, fd: RawFd) -> Result<(), VhostError> {
        let file = VhostVringFile { index, fd };
        unsafe { vhost_set_vring_kick(self.fd.as_raw_fd(), &file) }
            .map_err(VhostError::SetVringKick)?;
        Ok(())
    }

    pub fn set_vring_call(&self, index: u32, fd: RawFd) -> Result<(), VhostError> {
        let file = VhostVringFile { index, fd };
        unsafe { vhost_set_vring_call(self.fd.as_raw_fd(), &file) }
            .map_err(VhostError::SetVringCall)?;
        Ok(())
    }

    pub fn set_backend(&self, index: u32, fd: RawFd) -> Result<(), VhostError> {
        let file = VhostVringFile { index, fd };
        unsafe { vhost_net_set_backend(self.fd.as_raw_fd(), &file) }
            .map_err(VhostError::SetBackend)?;
        Ok(())
    }
}
