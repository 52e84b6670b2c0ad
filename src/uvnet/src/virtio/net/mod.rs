use std::io;
use std::mem::size_of;

use thiserror::Error as ThisError;
use vm_memory::ByteValued;

pub mod device;
pub(crate) mod rxq;
pub(crate) mod tap;
pub(crate) mod txq;
pub(crate) mod vhost;

pub use self::device::{Net, NetOptions, Subscription};

pub(crate) mod defs {
    /// vhost-net queue indices: queue 0 receives, queue 1 transmits.
    pub const RX_INDEX: u32 = 0;
    pub const TX_INDEX: u32 = 1;

    /// Size of each host-writable receive buffer.
    pub const RX_BUFFER_SIZE: usize = 4096;

    pub const DEFAULT_RING_SIZE: u16 = 256;

    pub const ETH_HDR_LEN: usize = 14;
    pub const DEFAULT_MTU: usize = 1500;
}

/// Offloads the device ended up with after feature negotiation, as exposed
/// to the layer above.
#[derive(Clone, Copy, Debug)]
pub struct HwFeatures {
    pub tx_csum_offload: bool,
    pub rx_csum_offload: bool,
    pub tx_tso: bool,
    pub tx_ufo: bool,
    pub mtu: usize,
}

impl Default for HwFeatures {
    fn default() -> HwFeatures {
        HwFeatures {
            tx_csum_offload: false,
            rx_csum_offload: false,
            tx_tso: false,
            tx_ufo: false,
            mtu: defs::DEFAULT_MTU,
        }
    }
}

/// Errors from bringing up the device.
#[derive(Debug, ThisError)]
pub enum SetupError {
    #[error("ring size {0} is not a power of two in [1, 32768]")]
    RingSize(u16),
    #[error("failed to create eventfd: {0}")]
    EventFd(io::Error),
    #[error("failed to lay out vring: {0}")]
    Ring(#[from] crate::virtio::ring::Error),
    #[error("failed to set up TAP device: {0}")]
    Tap(#[from] tap::TapError),
    #[error("vhost handshake failed: {0}")]
    Vhost(#[from] vhost::VhostError),
    #[error("receive already started")]
    ReceiveAlreadyStarted,
}

/// Virtio-net header preceding every frame shared with the host. This is
/// the 10-byte plain layout.
#[repr(C)]
#[derive(Clone, Copy, Default, Debug)]
pub(crate) struct VirtioNetHdr {
    pub flags: u8,
    pub gso_type: u8,
    pub hdr_len: u16,
    pub gso_size: u16,
    pub csum_start: u16,
    pub csum_offset: u16,
}

// SAFETY: plain old data with no padding.
unsafe impl ByteValued for VirtioNetHdr {}

/// Merge-able variant: the plain header followed by the number of receive
/// buffers the frame spans.
#[repr(C)]
#[derive(Clone, Copy, Default, Debug)]
pub(crate) struct VirtioNetHdrMrg {
    pub hdr: VirtioNetHdr,
    pub num_buffers: u16,
}

// SAFETY: plain old data with no padding.
unsafe impl ByteValued for VirtioNetHdrMrg {}

/// Length of the header actually on the wire, 12 bytes once merge-able
/// receive buffers are negotiated and 10 otherwise.
pub(crate) fn vnet_hdr_len(mergeable_buffers: bool) -> usize {
    if mergeable_buffers {
        size_of::<VirtioNetHdrMrg>()
    } else {
        size_of::<VirtioNetHdr>()
    }
}
