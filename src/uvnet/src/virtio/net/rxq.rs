use std::mem::size_of;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use vm_memory::ByteValued;

use super::defs::RX_BUFFER_SIZE;
use super::VirtioNetHdrMrg;
use crate::packet::{virt_to_phys, Fragment, OffloadInfo, Packet};
use crate::virtio::ring::{Buffer, BufferChain, Vring};

/// A receive buffer the host has filled, with the length it reported.
type FilledBuffer = (Box<[u8]>, u32);

/// Receive side: keeps the vring stocked with host-writable buffers and
/// folds merge-able buffer groups back into packets.
pub(crate) struct RxQueue {
    ring: Arc<Vring>,
    header_len: usize,
}

impl RxQueue {
    pub fn new(ring: Arc<Vring>, header_len: usize) -> RxQueue {
        RxQueue { ring, header_len }
    }

    /// Spawn the replenisher and reassembler. Reassembled packets are
    /// delivered through `downstream` in the order the host finished them;
    /// a slow consumer backpressures reassembly and, through the
    /// descriptor semaphore, replenishment.
    pub fn start(self, downstream: mpsc::Sender<Packet>) -> Vec<JoinHandle<()>> {
        let (filled_tx, filled_rx) = mpsc::unbounded_channel();
        vec![
            tokio::spawn(replenish(self.ring, filled_tx)),
            tokio::spawn(reassemble(filled_rx, downstream, self.header_len)),
        ]
    }
}

/// Keep the ring populated with 4 KiB host-writable buffers. Waits for one
/// free descriptor, then opportunistically grabs everything else that is
/// free so a whole batch goes out in one post.
async fn replenish(ring: Arc<Vring>, filled: mpsc::UnboundedSender<FilledBuffer>) {
    loop {
        let sem = ring.available_descriptors();
        match sem.acquire().await {
            Ok(permit) => permit.forget(),
            Err(_closed) => return,
        }
        let mut count = 1;
        let opportunistic = sem.available_permits();
        if opportunistic > 0 {
            if let Ok(more) = sem.try_acquire_many(opportunistic as u32) {
                more.forget();
                count += opportunistic;
            }
        }

        let chains: Vec<BufferChain> = (0..count)
            .map(|_| {
                let buf = vec![0u8; RX_BUFFER_SIZE].into_boxed_slice();
                let addr = virt_to_phys(buf.as_ptr());
                let filled = filled.clone();
                BufferChain {
                    buffers: vec![Buffer {
                        addr,
                        len: RX_BUFFER_SIZE as u32,
                        writeable: true,
                    }],
                    // The closure owns the buffer until the host hands it
                    // back (or the ring is torn down, which drops it here).
                    completed: Box::new(move |len| {
                        let _ = filled.send((buf, len));
                    }),
                }
            })
            .collect();

        trace!("replenishing receive ring with {count} buffers");
        if let Err(e) = ring.post(chains) {
            error!("failed to post receive buffers: {e}");
            return;
        }
    }
}

/// Fold filled buffers into packets. The first buffer of each group starts
/// with a merge-able virtio-net header whose `num_buffers` says how many
/// buffers the frame spans.
async fn reassemble(
    mut filled: mpsc::UnboundedReceiver<FilledBuffer>,
    downstream: mpsc::Sender<Packet>,
    header_len: usize,
) {
    let mut remaining_buffers: u16 = 0;
    let mut fragments: Vec<Fragment> = Vec::new();

    while let Some((buf, len)) = filled.recv().await {
        let mut offset = 0;
        let mut frag_len = len as usize;

        if remaining_buffers == 0 {
            debug_assert!(fragments.is_empty());
            let num_buffers = if header_len >= size_of::<VirtioNetHdrMrg>() {
                let mut hdr = VirtioNetHdrMrg::default();
                hdr.as_mut_slice()
                    .copy_from_slice(&buf[..size_of::<VirtioNetHdrMrg>()]);
                hdr.num_buffers
            } else {
                // Without merge-able buffers every frame fits one buffer
                // and the header carries no count.
                1
            };
            debug_assert!(num_buffers >= 1);
            if num_buffers == 0 {
                warn!("host reported a receive group of zero buffers, dropping");
                continue;
            }
            remaining_buffers = num_buffers;
            offset = header_len;
            frag_len = frag_len.saturating_sub(header_len);
        }

        fragments.push(Fragment::from_parts(buf, offset, frag_len));
        remaining_buffers -= 1;

        if remaining_buffers == 0 {
            let packet = Packet::new(std::mem::take(&mut fragments), OffloadInfo::default());
            trace!(
                "delivering {}-byte packet of {} fragments",
                packet.len(),
                packet.nr_frags()
            );
            if downstream.send(packet).await.is_err() {
                // Subscriber went away; stop delivering.
                return;
            }
        }
    }
}
