// Copyright 2018 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0
//
// Portions Copyright 2017 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the THIRD-PARTY file.

use std::fmt::{self, Debug, Display};
use std::io;
use std::num::Wrapping;
use std::ptr;
use std::sync::atomic::{fence, AtomicU16, Ordering};
use std::sync::{Arc, Mutex};

use tokio::io::unix::AsyncFd;
use tokio::sync::Semaphore;
use utils::eventfd::EventFd;
use utils::mem::AlignedBuffer;
use virtio_bindings::virtio_ring::{VRING_AVAIL_F_NO_INTERRUPT, VRING_USED_F_NO_NOTIFY};
use vm_memory::ByteValued;

/// Size of one descriptor table entry.
pub(crate) const VIRTQ_DESC_ENTRY_SIZE: usize = 16;

/// Size of available ring header: flags (u16) + idx (u16).
pub(crate) const VIRTQ_AVAIL_RING_HEADER_SIZE: usize = 4;

/// Size of one element in the available ring (le16).
pub(crate) const VIRTQ_AVAIL_ELEMENT_SIZE: usize = 2;

/// Size of used ring header: flags (u16) + idx (u16).
pub(crate) const VIRTQ_USED_RING_HEADER_SIZE: usize = 4;

/// Size of one element in the used ring, id (le32) + len (le32).
pub(crate) const VIRTQ_USED_ELEMENT_SIZE: usize = 8;

pub(crate) const VIRTQ_DESC_F_NEXT: u16 = 0x1;
pub(crate) const VIRTQ_DESC_F_WRITE: u16 = 0x2;
/// Offered in the feature word, never set on a descriptor by this driver.
#[allow(dead_code)]
pub(crate) const VIRTQ_DESC_F_INDIRECT: u16 = 0x4;

/// Largest ring this driver accepts. Keeps the in-flight window under half
/// the 16-bit index space, which the kick safety catch relies on.
pub const MAX_RING_SIZE: u16 = 1 << 15;

/// Sentinel terminating the free-descriptor list.
const FREE_LIST_END: u16 = u16::MAX;

/// Vring construction errors.
#[derive(Debug)]
pub enum Error {
    /// Ring size is zero, not a power of two, or above `MAX_RING_SIZE`.
    InvalidSize(u16),
    /// The backing storage cannot hold the ring layout.
    StorageTooSmall { needed: usize, got: usize },
}

impl Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::InvalidSize(size) => write!(
                f,
                "invalid ring size {size}: must be a power of two up to {MAX_RING_SIZE}"
            ),
            Error::StorageTooSmall { needed, got } => {
                write!(f, "ring storage too small: need {needed} bytes, got {got}")
            }
        }
    }
}

impl std::error::Error for Error {}

/// A descriptor table entry, exactly as the host reads it.
#[repr(C)]
#[derive(Clone, Copy, Default)]
struct Descriptor {
    addr: u64,
    len: u32,
    flags: u16,
    next: u16,
}

// SAFETY: plain old data with no padding.
unsafe impl ByteValued for Descriptor {}

/// An element of the used ring, exactly as the host writes it.
#[repr(C)]
#[derive(Clone, Copy, Default, Debug)]
pub(crate) struct VirtqUsedElem {
    pub id: u32,
    pub len: u32,
}

// SAFETY: plain old data with no padding.
unsafe impl ByteValued for VirtqUsedElem {}

/// Callback fired with the host-reported length once the head descriptor of
/// a chain shows up in the used ring. Owns whatever memory the chain's
/// buffers point into, so firing (or dropping on teardown) releases it.
pub type Completion = Box<dyn FnOnce(u32) + Send>;

/// One buffer of a chain about to be posted.
pub struct Buffer {
    /// Guest-physical address (identity-mapped, so a virtual address).
    pub addr: u64,
    pub len: u32,
    /// Host-writable if set, host-readable otherwise.
    pub writeable: bool,
}

/// A logical buffer that becomes one descriptor chain on submission.
pub struct BufferChain {
    pub buffers: Vec<Buffer>,
    pub completed: Completion,
}

/// Ring geometry settled at construction.
#[derive(Clone, Copy, Debug)]
pub struct VringConfig {
    /// Number of descriptors; must be a power of two.
    pub size: u16,
    /// VIRTIO_RING_F_EVENT_IDX negotiated.
    pub event_idx: bool,
}

/// Raw pointers into the shared storage block, resolved once at
/// construction. All cross-party fields are accessed through these.
#[derive(Clone, Copy)]
struct RingLayout {
    descs: *mut u8,
    avail: *mut u8,
    used: *const u8,
    size: u16,
}

impl RingLayout {
    fn mask(&self) -> u16 {
        self.size - 1
    }

    fn desc_ptr(&self, index: u16) -> *mut Descriptor {
        debug_assert!(index < self.size);
        // SAFETY: `index` is within the descriptor table sized at
        // construction.
        unsafe { (self.descs as *mut Descriptor).add(index as usize) }
    }

    fn read_desc(&self, index: u16) -> Descriptor {
        // SAFETY: in-bounds per desc_ptr; the host never writes the
        // descriptor table.
        unsafe { ptr::read_volatile(self.desc_ptr(index)) }
    }

    fn write_desc(&self, index: u16, desc: Descriptor) {
        // SAFETY: in-bounds per desc_ptr; the slot is free (not visible
        // through the avail ring) while the driver writes it.
        unsafe { ptr::write_volatile(self.desc_ptr(index), desc) };
    }

    /// Rewrite only the `next` field, used to thread the free list through
    /// descriptors the host is done with.
    fn write_desc_next(&self, index: u16, next: u16) {
        let mut desc = self.read_desc(index);
        desc.next = next;
        self.write_desc(index, desc);
    }

    fn avail_flags(&self) -> &AtomicU16 {
        // SAFETY: the avail header lives at the start of the (2-byte
        // aligned) avail area and is shared with the host.
        unsafe { &*(self.avail as *const AtomicU16) }
    }

    fn avail_idx(&self) -> &AtomicU16 {
        // SAFETY: as avail_flags, offset 2.
        unsafe { &*(self.avail.add(2) as *const AtomicU16) }
    }

    fn write_avail_slot(&self, slot: u16, head: u16) {
        debug_assert!(slot < self.size);
        let offset = VIRTQ_AVAIL_RING_HEADER_SIZE + VIRTQ_AVAIL_ELEMENT_SIZE * slot as usize;
        // SAFETY: in-bounds of the avail ring array; the slot is not yet
        // published through avail->idx.
        unsafe { ptr::write_volatile(self.avail.add(offset) as *mut u16, head) };
    }

    /// Driver-written notification threshold, trailing the avail ring.
    fn used_event(&self) -> &AtomicU16 {
        let offset = VIRTQ_AVAIL_RING_HEADER_SIZE + VIRTQ_AVAIL_ELEMENT_SIZE * self.size as usize;
        // SAFETY: the trailing event slot is part of the avail area sized at
        // construction.
        unsafe { &*(self.avail.add(offset) as *const AtomicU16) }
    }

    fn used_flags(&self) -> &AtomicU16 {
        // SAFETY: the used header lives at the start of the (4 KiB aligned)
        // used area and is written by the host.
        unsafe { &*(self.used as *const AtomicU16) }
    }

    fn used_idx(&self) -> &AtomicU16 {
        // SAFETY: as used_flags, offset 2.
        unsafe { &*(self.used.add(2) as *const AtomicU16) }
    }

    fn read_used_elem(&self, slot: u16) -> VirtqUsedElem {
        debug_assert!(slot < self.size);
        let offset = VIRTQ_USED_RING_HEADER_SIZE + VIRTQ_USED_ELEMENT_SIZE * slot as usize;
        // SAFETY: in-bounds of the used ring array; the element was
        // published by the acquire load of used->idx.
        unsafe { ptr::read_volatile(self.used.add(offset) as *const VirtqUsedElem) }
    }

    /// Host-written kick threshold, trailing the used ring.
    fn avail_event(&self) -> &AtomicU16 {
        let offset = VIRTQ_USED_RING_HEADER_SIZE + VIRTQ_USED_ELEMENT_SIZE * self.size as usize;
        // SAFETY: the trailing event slot is part of the used area sized at
        // construction.
        unsafe { &*(self.used.add(offset) as *const AtomicU16) }
    }
}

/// Mutable ring state. Touched only under the `Vring` mutex.
struct RingState {
    layout: RingLayout,
    event_idx: bool,
    /// Head of the free list threaded through descriptor `next` fields.
    free_head: u16,
    /// Pending completion per chain-head descriptor index.
    completions: Vec<Option<Completion>>,
    /// Producer cursor; published to avail->idx after each batch.
    avail_head: Wrapping<u16>,
    /// Chains placed on the avail ring since the last kick.
    added_since_kick: u16,
    /// Consumer cursor into the used ring.
    used_tail: Wrapping<u16>,
}

// SAFETY: the raw pointers target the storage owned by the enclosing Vring,
// which outlives the state; mutation is serialized by the Vring mutex.
unsafe impl Send for RingState {}

impl RingState {
    fn allocate_desc(&mut self) -> u16 {
        let id = self.free_head;
        assert_ne!(id, FREE_LIST_END, "free descriptor list underrun");
        self.free_head = self.layout.read_desc(id).next;
        id
    }

    fn push_free(&mut self, id: u16) {
        self.layout.write_desc_next(id, self.free_head);
        self.free_head = id;
    }

    /// Fire the completion for a used element and return the whole chain to
    /// the free list. Returns the number of descriptors freed.
    fn complete_chain(&mut self, elem: &VirtqUsedElem) -> usize {
        debug_assert!(
            (elem.id as usize) < self.completions.len(),
            "used element id {} out of range",
            elem.id
        );
        let completed = self.completions[elem.id as usize].take();
        debug_assert!(
            completed.is_some(),
            "used element id {} has no pending completion",
            elem.id
        );
        if let Some(completed) = completed {
            completed(elem.len);
        }

        let mut id = elem.id as u16;
        let mut freed = 0;
        loop {
            // Copy out before push_free rewrites `next` for the free list.
            let desc = self.layout.read_desc(id);
            self.push_free(id);
            freed += 1;
            debug_assert!(freed <= self.layout.size as usize, "descriptor chain loops");
            if desc.flags & VIRTQ_DESC_F_NEXT == 0 {
                break;
            }
            id = desc.next;
        }
        freed
    }

    fn disable_interrupts(&mut self) {
        if !self.event_idx {
            self.layout
                .avail_flags()
                .store(VRING_AVAIL_F_NO_INTERRUPT as u16, Ordering::Relaxed);
        }
    }

    /// Re-arm host notifications, then report whether the host published
    /// more used elements in the window before the re-arm became visible.
    fn enable_interrupts(&mut self) -> bool {
        let tail = self.used_tail.0;
        if self.event_idx {
            self.layout.used_event().store(tail, Ordering::Relaxed);
        } else {
            self.layout.avail_flags().store(0, Ordering::Relaxed);
        }

        // The re-arm must be visible before the emptiness re-check, or a
        // used element landing in between would be neither drained here nor
        // notified by the host.
        fence(Ordering::SeqCst);

        self.layout.used_idx().load(Ordering::Relaxed) != tail
    }
}

/// One split virtqueue: descriptor table, available ring and used ring over
/// a storage block shared with the host, plus the free-descriptor allocator
/// and the kick/notify plumbing.
///
/// Callers acquire permits from [`Vring::available_descriptors`] (one per
/// descriptor) before posting; permits return as the host consumes chains.
pub struct Vring {
    state: Mutex<RingState>,
    available_descriptors: Semaphore,
    kick_evt: EventFd,
    notified_evt: EventFd,
    event_idx: bool,
    size: u16,
    desc_table_addr: u64,
    avail_ring_addr: u64,
    used_ring_addr: u64,
    _storage: AlignedBuffer,
}

// SAFETY: the raw pointers in `state` target `_storage`, which lives and
// stays pinned as long as the Vring; all mutation goes through the mutex and
// host-shared fields are accessed atomically or volatilely.
unsafe impl Send for Vring {}
unsafe impl Sync for Vring {}

impl Vring {
    /// Bytes of 4 KiB-aligned storage required for a ring of `size`
    /// descriptors. Overestimates slightly.
    pub fn storage_size(size: u16) -> usize {
        3 * 4096
            + size as usize
                * (VIRTQ_DESC_ENTRY_SIZE + VIRTQ_AVAIL_ELEMENT_SIZE + VIRTQ_USED_ELEMENT_SIZE)
    }

    /// Lay the ring out over `storage` and put every descriptor on the free
    /// list. `notified` is signaled by the host when it returns buffers;
    /// `kick` is signaled by the driver when it posts them.
    pub fn new(
        config: VringConfig,
        storage: AlignedBuffer,
        notified: EventFd,
        kick: EventFd,
    ) -> Result<Vring, Error> {
        let size = config.size;
        if size == 0 || !size.is_power_of_two() || size > MAX_RING_SIZE {
            return Err(Error::InvalidSize(size));
        }

        let base = storage.as_ptr();
        let avail_offset = VIRTQ_DESC_ENTRY_SIZE * size as usize;
        let avail_len = VIRTQ_AVAIL_RING_HEADER_SIZE + VIRTQ_AVAIL_ELEMENT_SIZE * size as usize + 2;
        let used_offset = align_up(avail_offset + avail_len, 4096);
        let used_len = VIRTQ_USED_RING_HEADER_SIZE + VIRTQ_USED_ELEMENT_SIZE * size as usize + 2;
        let needed = used_offset + used_len;
        if storage.len() < needed {
            return Err(Error::StorageTooSmall {
                needed,
                got: storage.len(),
            });
        }

        let layout = RingLayout {
            descs: base,
            // SAFETY: offsets are within the storage block, checked above.
            avail: unsafe { base.add(avail_offset) },
            used: unsafe { base.add(used_offset) as *const u8 },
            size,
        };

        let mut state = RingState {
            layout,
            event_idx: config.event_idx,
            free_head: FREE_LIST_END,
            completions: (0..size).map(|_| None).collect(),
            avail_head: Wrapping(0),
            added_since_kick: 0,
            used_tail: Wrapping(0),
        };
        for i in 0..size {
            state.push_free(i);
        }

        Ok(Vring {
            state: Mutex::new(state),
            available_descriptors: Semaphore::new(size as usize),
            kick_evt: kick,
            notified_evt: notified,
            event_idx: config.event_idx,
            size,
            desc_table_addr: base as u64,
            avail_ring_addr: base as u64 + avail_offset as u64,
            used_ring_addr: base as u64 + used_offset as u64,
            _storage: storage,
        })
    }

    /// Total number of descriptors in the ring.
    pub fn size(&self) -> u16 {
        self.size
    }

    /// Counted semaphore tracking free descriptors. Acquire (and forget) N
    /// permits before posting an N-descriptor chain.
    pub fn available_descriptors(&self) -> &Semaphore {
        &self.available_descriptors
    }

    /// Userspace address of the descriptor table, for the host handshake.
    pub fn desc_table_addr(&self) -> u64 {
        self.desc_table_addr
    }

    /// Userspace address of the available ring, for the host handshake.
    pub fn avail_ring_addr(&self) -> u64 {
        self.avail_ring_addr
    }

    /// Userspace address of the used ring, for the host handshake.
    pub fn used_ring_addr(&self) -> u64 {
        self.used_ring_addr
    }

    /// Submit a batch of chains. The whole batch becomes visible to the
    /// host with a single release-publish of avail->idx, after which the
    /// host is kicked if it asked to be.
    ///
    /// The caller must have acquired one semaphore permit per descriptor.
    pub fn post<I>(&self, chains: I) -> io::Result<()>
    where
        I: IntoIterator<Item = BufferChain>,
    {
        let mut state = self.state.lock().unwrap();
        for chain in chains {
            debug_assert!(!chain.buffers.is_empty());

            // Walk the fragments back to front so each descriptor's `next`
            // field is known when it is written.
            let mut has_next = false;
            let mut next_idx = 0u16;
            for buf in chain.buffers.iter().rev() {
                let desc_idx = state.allocate_desc();
                let mut flags = 0u16;
                if buf.writeable {
                    flags |= VIRTQ_DESC_F_WRITE;
                }
                if has_next {
                    flags |= VIRTQ_DESC_F_NEXT;
                }
                state.layout.write_desc(
                    desc_idx,
                    Descriptor {
                        addr: buf.addr,
                        len: buf.len,
                        flags,
                        next: next_idx,
                    },
                );
                has_next = true;
                next_idx = desc_idx;
            }

            let head = next_idx;
            state.completions[head as usize] = Some(chain.completed);
            let slot = state.avail_head.0 & state.layout.mask();
            state.layout.write_avail_slot(slot, head);
            state.avail_head += Wrapping(1);
            state.added_since_kick = state.added_since_kick.wrapping_add(1);
        }

        // Publish the batch: every descriptor and ring slot written above
        // must be visible before the index moves.
        state
            .layout
            .avail_idx()
            .store(state.avail_head.0, Ordering::Release);

        self.kick(&mut state)?;
        // Piggyback a harvest pass; anything the host already finished
        // completes without waiting for a notification.
        self.do_complete(&mut state);
        Ok(())
    }

    /// Harvest any completions the host has already published.
    pub fn complete(&self) {
        let mut state = self.state.lock().unwrap();
        self.do_complete(&mut state);
    }

    /// Drive the ring: harvest completions, then sleep on the notify
    /// eventfd until the host signals again.
    pub async fn run(self: Arc<Self>) -> io::Result<()> {
        let notified = AsyncFd::new(self.notified_evt.try_clone()?)?;
        loop {
            self.complete();
            let mut guard = notified.readable().await?;
            match guard.try_io(|evt| evt.get_ref().read()) {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => return Err(e),
                // Spurious readiness; re-arm and wait again.
                Err(_would_block) => {}
            }
        }
    }

    /// Let the host know new work is on the available ring, unless it asked
    /// not to be told.
    fn kick(&self, state: &mut RingState) -> io::Result<()> {
        // avail->idx must be globally visible before the suppression check.
        fence(Ordering::SeqCst);

        let mut need_kick = true;
        if self.event_idx {
            let avail_idx = state.layout.avail_idx().load(Ordering::Relaxed);
            let avail_event = state.layout.avail_event().load(Ordering::Relaxed);
            need_kick =
                avail_idx.wrapping_sub(avail_event).wrapping_sub(1) < state.added_since_kick;
        } else if state.layout.used_flags().load(Ordering::Relaxed) & VRING_USED_F_NO_NOTIFY as u16
            != 0
        {
            return Ok(());
        }

        // The safety catch bounds the unkicked window to half the 16-bit
        // index space, past which the event-index comparison would wrap.
        if need_kick || state.added_since_kick >= u16::MAX / 2 {
            trace!("kicking host after {} chains", state.added_since_kick);
            self.kick_evt.write(1)?;
            state.added_since_kick = 0;
        }
        Ok(())
    }

    fn do_complete(&self, state: &mut RingState) {
        loop {
            state.disable_interrupts();

            // Pairs with the host's release-publish of used->idx; the
            // elements behind it are visible after this load.
            let used_idx = Wrapping(state.layout.used_idx().load(Ordering::Acquire));
            while state.used_tail != used_idx {
                let slot = state.used_tail.0 & state.layout.mask();
                let elem = state.layout.read_used_elem(slot);
                state.used_tail += Wrapping(1);
                let freed = state.complete_chain(&elem);
                // Permits come back only once the chain is back on the
                // free list.
                self.available_descriptors.add_permits(freed);
            }

            if !state.enable_interrupts() {
                break;
            }
            // More used elements arrived inside the re-arm window; the host
            // may have skipped the notification, so drain again ourselves.
        }
    }
}

impl Debug for Vring {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Vring")
            .field("size", &self.size)
            .field("event_idx", &self.event_idx)
            .finish()
    }
}

fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::mpsc;

    pub(crate) use super::*;

    /// Plays the host's side of a ring: reads descriptors and the avail
    /// ring, writes used elements, sets the suppression knobs.
    #[derive(Clone, Copy)]
    pub(crate) struct MockHost {
        descs: *const u8,
        avail: *const u8,
        used: *mut u8,
        size: u16,
    }

    // SAFETY: test-only handle into storage kept alive by the Arc<Vring>
    // each test holds for the duration.
    unsafe impl Send for MockHost {}

    impl MockHost {
        pub(crate) fn new(ring: &Vring) -> MockHost {
            MockHost {
                descs: ring.desc_table_addr() as *const u8,
                avail: ring.avail_ring_addr() as *const u8,
                used: ring.used_ring_addr() as *mut u8,
                size: ring.size(),
            }
        }

        pub(crate) fn desc(&self, index: u16) -> (u64, u32, u16, u16) {
            assert!(index < self.size);
            let d: Descriptor = unsafe {
                ptr::read_volatile(
                    (self.descs as *const Descriptor).add(index as usize),
                )
            };
            (d.addr, d.len, d.flags, d.next)
        }

        pub(crate) fn avail_flags(&self) -> u16 {
            unsafe { &*(self.avail as *const AtomicU16) }.load(Ordering::Acquire)
        }

        pub(crate) fn avail_idx(&self) -> u16 {
            unsafe { &*(self.avail.add(2) as *const AtomicU16) }.load(Ordering::Acquire)
        }

        pub(crate) fn avail_entry(&self, slot: u16) -> u16 {
            assert!(slot < self.size);
            unsafe {
                ptr::read_volatile(self.avail.add(4 + 2 * slot as usize) as *const u16)
            }
        }

        /// Driver-written interrupt threshold (event-index mode).
        pub(crate) fn used_event(&self) -> u16 {
            unsafe { &*(self.avail.add(4 + 2 * self.size as usize) as *const AtomicU16) }
                .load(Ordering::Acquire)
        }

        pub(crate) fn set_used_flags(&self, val: u16) {
            unsafe { &*(self.used as *const AtomicU16) }.store(val, Ordering::Release);
        }

        /// Host-written kick threshold (event-index mode).
        pub(crate) fn set_avail_event(&self, val: u16) {
            unsafe { &*(self.used.add(4 + 8 * self.size as usize) as *const AtomicU16) }
                .store(val, Ordering::Release);
        }

        fn used_idx_atomic(&self) -> &AtomicU16 {
            unsafe { &*(self.used.add(2) as *const AtomicU16) }
        }

        /// Publish one used element the way the host does: element first,
        /// then a release store of the index.
        pub(crate) fn push_used(&self, id: u32, len: u32) {
            let idx = self.used_idx_atomic().load(Ordering::Relaxed);
            let slot = idx & (self.size - 1);
            unsafe {
                ptr::write_volatile(
                    self.used.add(4 + 8 * slot as usize) as *mut VirtqUsedElem,
                    VirtqUsedElem { id, len },
                );
            }
            self.used_idx_atomic()
                .store(idx.wrapping_add(1), Ordering::Release);
        }

        /// Address of the buffer a posted descriptor points at.
        pub(crate) fn desc_buffer(&self, index: u16) -> *mut u8 {
            self.desc(index).0 as *mut u8
        }
    }

    pub(crate) fn make_vring(
        size: u16,
        event_idx: bool,
    ) -> (Arc<Vring>, MockHost, EventFd, EventFd) {
        let kick = EventFd::new(utils::eventfd::EFD_NONBLOCK).unwrap();
        let kick_host = kick.try_clone().unwrap();
        let notified = EventFd::new(utils::eventfd::EFD_NONBLOCK).unwrap();
        let notify_host = notified.try_clone().unwrap();
        let storage = AlignedBuffer::new(Vring::storage_size(size), 4096);
        let ring = Arc::new(
            Vring::new(VringConfig { size, event_idx }, storage, notified, kick).unwrap(),
        );
        let host = MockHost::new(&ring);
        (ring, host, kick_host, notify_host)
    }

    pub(crate) fn kicked(kick_host: &EventFd) -> bool {
        kick_host.read().is_ok()
    }

    fn ro_chain(bufs: &[(u64, u32)], tx: mpsc::Sender<u32>) -> BufferChain {
        BufferChain {
            buffers: bufs
                .iter()
                .map(|&(addr, len)| Buffer {
                    addr,
                    len,
                    writeable: false,
                })
                .collect(),
            completed: Box::new(move |len| tx.send(len).unwrap()),
        }
    }

    /// Post upholding the caller contract: one permit per descriptor,
    /// acquired up front.
    fn post_chains<I>(ring: &Vring, chains: I)
    where
        I: IntoIterator<Item = BufferChain>,
    {
        let chains: Vec<BufferChain> = chains.into_iter().collect();
        let descriptors: usize = chains.iter().map(|c| c.buffers.len()).sum();
        ring.available_descriptors()
            .try_acquire_many(descriptors as u32)
            .unwrap()
            .forget();
        Vring::post(ring, chains).unwrap();
    }

    #[test]
    fn invalid_sizes_rejected() {
        let mk = |size| {
            Vring::new(
                VringConfig {
                    size,
                    event_idx: false,
                },
                AlignedBuffer::new(Vring::storage_size(if size == 0 { 8 } else { size }), 4096),
                EventFd::new(utils::eventfd::EFD_NONBLOCK).unwrap(),
                EventFd::new(utils::eventfd::EFD_NONBLOCK).unwrap(),
            )
        };
        assert!(matches!(mk(0), Err(Error::InvalidSize(0))));
        assert!(matches!(mk(12), Err(Error::InvalidSize(12))));
        assert!(mk(256).is_ok());
    }

    #[test]
    fn storage_layout() {
        let (ring, _host, _kick, _notify) = make_vring(256, false);
        assert_eq!(
            ring.avail_ring_addr(),
            ring.desc_table_addr() + 16 * 256,
        );
        // The used ring starts on its own page.
        assert_eq!(ring.used_ring_addr() % 4096, 0);
        assert!(ring.used_ring_addr() >= ring.avail_ring_addr() + 2 * 256 + 6);
    }

    #[test]
    fn single_fragment_submission() {
        let (ring, host, kick_host, _notify) = make_vring(8, false);
        let (tx, rx) = mpsc::channel();

        post_chains(&ring, std::iter::once(ro_chain(&[(0x1000, 64)], tx)));

        // The free list hands out the highest index first.
        assert_eq!(host.avail_idx(), 1);
        let head = host.avail_entry(0);
        assert_eq!(head, 7);
        assert_eq!(host.desc(head), (0x1000, 64, 0, 0));
        // used->flags is zero, so the host wants the kick.
        assert!(kicked(&kick_host));
        assert_eq!(ring.available_descriptors().available_permits(), 7);

        host.push_used(head as u32, 64);
        ring.complete();
        assert_eq!(rx.try_recv().unwrap(), 64);
        assert_eq!(ring.available_descriptors().available_permits(), 8);

        // The freed descriptor is reused for the next post.
        let (tx2, _rx2) = mpsc::channel();
        post_chains(&ring, std::iter::once(ro_chain(&[(0x2000, 32)], tx2)));
        assert_eq!(host.avail_entry(1), head);
    }

    #[test]
    fn multi_fragment_chain_links_in_order() {
        let (ring, host, _kick, _notify) = make_vring(8, false);
        let (tx, rx) = mpsc::channel();

        post_chains(&ring, std::iter::once(ro_chain(
            &[(0x1000, 10), (0x2000, 20), (0x3000, 30)],
            tx,
        )));

        let head = host.avail_entry(0);
        let (addr, len, flags, next) = host.desc(head);
        assert_eq!((addr, len), (0x1000, 10));
        assert_eq!(flags, VIRTQ_DESC_F_NEXT);
        let (addr, len, flags, next2) = host.desc(next);
        assert_eq!((addr, len), (0x2000, 20));
        assert_eq!(flags, VIRTQ_DESC_F_NEXT);
        let (addr, len, flags, _) = host.desc(next2);
        assert_eq!((addr, len), (0x3000, 30));
        assert_eq!(flags, 0);

        assert_eq!(ring.available_descriptors().available_permits(), 5);

        // One completion for the whole chain, keyed by its head.
        host.push_used(head as u32, 0);
        ring.complete();
        assert_eq!(rx.try_recv().unwrap(), 0);
        assert!(rx.try_recv().is_err());
        assert_eq!(ring.available_descriptors().available_permits(), 8);
    }

    #[test]
    fn writeable_buffers_flagged() {
        let (ring, host, _kick, _notify) = make_vring(8, false);
        let (tx, _rx) = mpsc::channel::<u32>();
        post_chains(&ring, std::iter::once(BufferChain {
            buffers: vec![Buffer {
                addr: 0x4000,
                len: 4096,
                writeable: true,
            }],
            completed: Box::new(move |len| tx.send(len).unwrap()),
        }));
        let head = host.avail_entry(0);
        assert_eq!(host.desc(head).2, VIRTQ_DESC_F_WRITE);
    }

    #[test]
    fn batch_post_publishes_once() {
        let (ring, host, _kick, _notify) = make_vring(8, false);
        let (tx, _rx) = mpsc::channel();
        let chains = vec![
            ro_chain(&[(0x1000, 1)], tx.clone()),
            ro_chain(&[(0x2000, 2)], tx.clone()),
            ro_chain(&[(0x3000, 3)], tx),
        ];
        post_chains(&ring, chains);
        assert_eq!(host.avail_idx(), 3);
        assert_eq!(host.avail_entry(0), 7);
        assert_eq!(host.avail_entry(1), 6);
        assert_eq!(host.avail_entry(2), 5);
    }

    #[test]
    fn completions_fire_in_host_order() {
        let (ring, host, _kick, _notify) = make_vring(8, false);
        let (tx, rx) = mpsc::channel();
        post_chains(&ring, vec![
            ro_chain(&[(0x1000, 1)], tx.clone()),
            ro_chain(&[(0x2000, 2)], tx),
        ]);
        let first = host.avail_entry(0);
        let second = host.avail_entry(1);

        // Host finishes them out of submission order.
        host.push_used(second as u32, 22);
        host.push_used(first as u32, 11);
        ring.complete();
        assert_eq!(rx.try_recv().unwrap(), 22);
        assert_eq!(rx.try_recv().unwrap(), 11);
    }

    #[test]
    fn flag_mode_no_notify_suppresses_kick() {
        let (ring, host, kick_host, _notify) = make_vring(8, false);
        host.set_used_flags(VRING_USED_F_NO_NOTIFY as u16);
        let (tx, _rx) = mpsc::channel();
        post_chains(&ring, std::iter::once(ro_chain(&[(0x1000, 64)], tx)));
        assert!(!kicked(&kick_host));
    }

    #[test]
    fn flag_mode_reenables_interrupts_after_drain() {
        let (ring, host, _kick, _notify) = make_vring(8, false);
        let (tx, rx) = mpsc::channel();
        post_chains(&ring, std::iter::once(ro_chain(&[(0x1000, 64)], tx)));
        host.push_used(host.avail_entry(0) as u32, 64);
        ring.complete();
        assert_eq!(rx.try_recv().unwrap(), 64);
        // NO_INTERRUPT must be clear once the drain settles.
        assert_eq!(host.avail_flags(), 0);
    }

    #[test]
    fn event_index_kick_suppression() {
        let (ring, host, kick_host, _notify) = make_vring(8, true);
        let (tx, _rx) = mpsc::channel();

        // avail_event = 0: publishing index 1 crosses it.
        post_chains(&ring, std::iter::once(ro_chain(&[(0x1000, 1)], tx.clone())));
        assert!(kicked(&kick_host));

        // Host asks to be told when the index passes 3.
        host.set_avail_event(3);
        post_chains(&ring, std::iter::once(ro_chain(&[(0x1000, 1)], tx.clone())));
        assert!(!kicked(&kick_host)); // idx 2
        post_chains(&ring, std::iter::once(ro_chain(&[(0x1000, 1)], tx.clone())));
        assert!(!kicked(&kick_host)); // idx 3
        post_chains(&ring, std::iter::once(ro_chain(&[(0x1000, 1)], tx)));
        assert!(kicked(&kick_host)); // idx 4 crosses avail_event + 1
    }

    #[test]
    fn event_index_publishes_used_event() {
        let (ring, host, _kick, _notify) = make_vring(8, true);
        let (tx, rx) = mpsc::channel();
        post_chains(&ring, vec![
            ro_chain(&[(0x1000, 1)], tx.clone()),
            ro_chain(&[(0x2000, 1)], tx),
        ]);
        host.push_used(host.avail_entry(0) as u32, 5);
        host.push_used(host.avail_entry(1) as u32, 6);
        ring.complete();
        assert_eq!(rx.try_recv().unwrap(), 5);
        assert_eq!(rx.try_recv().unwrap(), 6);
        // The driver tells the host to interrupt once the used index moves
        // past everything it has already seen.
        assert_eq!(host.used_event(), 2);
    }

    #[test]
    fn used_entry_during_rearm_window_is_drained() {
        let (ring, host, _kick, _notify) = make_vring(8, false);
        let (tx_a, rx_a) = mpsc::channel();
        let (tx_b, rx_b) = mpsc::channel::<u32>();

        // Heads are deterministic: first chain gets 7, second gets 6.
        let chain_a = BufferChain {
            buffers: vec![Buffer {
                addr: 0x1000,
                len: 1,
                writeable: false,
            }],
            // Simulate the race: a new used element lands after the drain
            // emptied the ring but before interrupts are re-enabled.
            completed: Box::new(move |len| {
                host.push_used(6, 99);
                tx_a.send(len).unwrap();
            }),
        };
        let chain_b = BufferChain {
            buffers: vec![Buffer {
                addr: 0x2000,
                len: 1,
                writeable: false,
            }],
            completed: Box::new(move |len| tx_b.send(len).unwrap()),
        };
        post_chains(&ring, vec![chain_a, chain_b]);
        assert_eq!(host.avail_entry(0), 7);
        assert_eq!(host.avail_entry(1), 6);

        host.push_used(7, 1);
        // A single harvest must observe the element pushed mid-drain
        // without waiting for another notification.
        ring.complete();
        assert_eq!(rx_a.try_recv().unwrap(), 1);
        assert_eq!(rx_b.try_recv().unwrap(), 99);
        assert_eq!(ring.available_descriptors().available_permits(), 8);
    }

    #[test]
    fn wraparound_indexing() {
        let (ring, host, kick_host, _notify) = make_vring(4, false);
        let (tx, rx) = mpsc::channel();

        // Push the 16-bit cursors past their wrap point.
        for i in 0u32..70_000 {
            post_chains(&ring, std::iter::once(ro_chain(&[(0x1000, 8)], tx.clone())));
            assert_eq!(host.avail_idx(), (i + 1) as u16);

            let head = host.avail_entry((i as u16) & 3);
            host.push_used(head as u32, 8);
            ring.complete();
            assert_eq!(rx.try_recv().unwrap(), 8);
            assert_eq!(ring.available_descriptors().available_permits(), 4);
            kicked(&kick_host);
        }
        assert_eq!(host.avail_idx(), 70_000u32 as u16);
    }

    #[test]
    fn permits_track_free_descriptors() {
        let (ring, host, _kick, _notify) = make_vring(8, false);
        let sem = ring.available_descriptors();
        let (tx, _rx) = mpsc::channel();

        post_chains(&ring, vec![
            ro_chain(&[(0x1000, 1), (0x1100, 1), (0x1200, 1)], tx.clone()),
            ro_chain(&[(0x2000, 1), (0x2100, 1)], tx),
        ]);
        assert_eq!(sem.available_permits(), 3);

        // Completing the 3-descriptor chain returns exactly 3 permits.
        host.push_used(host.avail_entry(0) as u32, 0);
        ring.complete();
        assert_eq!(sem.available_permits(), 6);

        host.push_used(host.avail_entry(1) as u32, 0);
        ring.complete();
        assert_eq!(sem.available_permits(), 8);
    }
}
