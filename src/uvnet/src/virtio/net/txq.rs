use std::io;
use std::iter;
use std::sync::Arc;

use tokio::sync::oneshot;
use virtio_bindings::virtio_net::{
    VIRTIO_NET_HDR_F_NEEDS_CSUM, VIRTIO_NET_HDR_GSO_TCPV4, VIRTIO_NET_HDR_GSO_UDP,
};
use vm_memory::ByteValued;

use super::defs::ETH_HDR_LEN;
use super::{HwFeatures, VirtioNetHdrMrg};
use crate::packet::{Fragment, L4Protocol, Packet};
use crate::virtio::ring::{Buffer, BufferChain, Vring};

/// Transmit side: one vring whose chains are outbound frames, each prefixed
/// with a virtio-net header built from the packet's offload metadata.
pub(crate) struct TxQueue {
    ring: Arc<Vring>,
    hw_features: HwFeatures,
    header_len: usize,
}

impl TxQueue {
    pub fn new(ring: Arc<Vring>, hw_features: HwFeatures, header_len: usize) -> TxQueue {
        TxQueue {
            ring,
            hw_features,
            header_len,
        }
    }

    /// Hand one outbound packet to the host. Resolves once the host has
    /// consumed the descriptor chain; the packet's buffers are released at
    /// that point regardless of whether the caller is still waiting.
    pub async fn post(&self, mut packet: Packet) -> io::Result<()> {
        let vhdr = offload_header(&self.hw_features, &packet);
        packet.prepend(Fragment::new(
            vhdr.as_slice()[..self.header_len].to_vec().into_boxed_slice(),
        ));

        let nr_frags = packet.nr_frags();
        debug_assert!(
            nr_frags <= self.ring.size() as usize,
            "packet spans more descriptors than the ring holds"
        );
        match self
            .ring
            .available_descriptors()
            .acquire_many(nr_frags as u32)
            .await
        {
            Ok(permits) => permits.forget(),
            Err(_closed) => {
                return Err(io::Error::new(
                    io::ErrorKind::BrokenPipe,
                    "transmit ring shut down",
                ))
            }
        }

        let buffers = packet
            .fragments()
            .iter()
            .map(|f| Buffer {
                addr: f.guest_addr(),
                len: f.len() as u32,
                writeable: false,
            })
            .collect();
        let (done, consumed) = oneshot::channel();
        let completed: Box<dyn FnOnce(u32) + Send> = Box::new(move |len| {
            // The host is finished with the chain; dropping the packet here
            // releases the fragment buffers it was reading from.
            drop(packet);
            let _ = done.send(len);
        });
        self.ring.post(iter::once(BufferChain { buffers, completed }))?;

        consumed
            .await
            .map(|_| ())
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "device torn down"))
    }
}

/// Build the virtio-net header for `packet` from its offload metadata and
/// the negotiated device features.
fn offload_header(hw: &HwFeatures, packet: &Packet) -> VirtioNetHdrMrg {
    let mut vhdr = VirtioNetHdrMrg::default();
    if !hw.tx_csum_offload {
        return vhdr;
    }

    let oi = packet.offload_info();
    let csum_start = ETH_HDR_LEN as u16 + oi.ip_hdr_len;
    match oi.protocol {
        Some(L4Protocol::Tcp) => {
            vhdr.hdr.flags = VIRTIO_NET_HDR_F_NEEDS_CSUM as u8;
            vhdr.hdr.csum_start = csum_start;
            // Checksum field offset within the TCP header.
            vhdr.hdr.csum_offset = 16;
            if hw.tx_tso && packet.len() > hw.mtu + ETH_HDR_LEN {
                vhdr.hdr.gso_type = VIRTIO_NET_HDR_GSO_TCPV4 as u8;
                vhdr.hdr.hdr_len = csum_start + oi.tcp_hdr_len;
                // Segment payload size after the host re-splits the frame.
                vhdr.hdr.gso_size = hw.mtu as u16 - oi.ip_hdr_len - oi.tcp_hdr_len;
            }
        }
        Some(L4Protocol::Udp) => {
            vhdr.hdr.flags = VIRTIO_NET_HDR_F_NEEDS_CSUM as u8;
            vhdr.hdr.csum_start = csum_start;
            // Checksum field offset within the UDP header.
            vhdr.hdr.csum_offset = 6;
            if hw.tx_ufo && packet.len() > hw.mtu + ETH_HDR_LEN {
                vhdr.hdr.gso_type = VIRTIO_NET_HDR_GSO_UDP as u8;
                vhdr.hdr.hdr_len = csum_start + oi.udp_hdr_len;
                vhdr.hdr.gso_size = hw.mtu as u16 - oi.ip_hdr_len - oi.udp_hdr_len;
            }
        }
        None => {}
    }
    vhdr
}
