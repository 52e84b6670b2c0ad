//! Kernel ABI for the vhost control plane, from linux/vhost.h.

#![allow(clippy::missing_safety_doc)]

/// Argument of VHOST_SET_VRING_NUM.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct VhostVringState {
    pub index: u32,
    pub num: u32,
}

/// Argument of VHOST_SET_VRING_KICK / _CALL / VHOST_NET_SET_BACKEND.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct VhostVringFile {
    pub index: u32,
    pub fd: i32,
}

/// Argument of VHOST_SET_VRING_ADDR. Addresses are userspace virtual
/// addresses; `flags` and `log_guest_addr` stay zero (no used-ring logging).
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct VhostVringAddr {
    pub index: u32,
    pub flags: u32,
    pub desc_user_addr: u64,
    pub used_user_addr: u64,
    pub avail_user_addr: u64,
    pub log_guest_addr: u64,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct VhostMemoryRegion {
    pub guest_phys_addr: u64,
    pub memory_size: u64,
    pub userspace_addr: u64,
    pub flags_padding: u64,
}

/// Argument of VHOST_SET_MEM_TABLE. The kernel struct ends in a flexible
/// array; this driver always installs exactly one region.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct VhostMemory {
    pub nregions: u32,
    pub padding: u32,
    pub regions: [VhostMemoryRegion; 1],
}
