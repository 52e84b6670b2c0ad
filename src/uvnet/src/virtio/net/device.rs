// Copyright 2020 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use std::future::Future;
use std::io;
use std::os::fd::AsRawFd;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use utils::eventfd::{EventFd, EFD_NONBLOCK};
use utils::mem::AlignedBuffer;
use virtio_bindings::virtio_net::{
    VIRTIO_NET_F_CSUM, VIRTIO_NET_F_GUEST_CSUM, VIRTIO_NET_F_GUEST_TSO4, VIRTIO_NET_F_GUEST_UFO,
    VIRTIO_NET_F_HOST_TSO4, VIRTIO_NET_F_HOST_UFO, VIRTIO_NET_F_MRG_RXBUF,
};
use virtio_bindings::virtio_ring::{VIRTIO_RING_F_EVENT_IDX, VIRTIO_RING_F_INDIRECT_DESC};

use super::defs::{DEFAULT_RING_SIZE, RX_INDEX, TX_INDEX};
use super::rxq::RxQueue;
use super::tap::Tap;
use super::txq::TxQueue;
use super::vhost::VhostNet;
use super::{vnet_hdr_len, HwFeatures, SetupError};
use crate::packet::Packet;
use crate::virtio::ring::{Vring, VringConfig, MAX_RING_SIZE};

/// Device configuration. Every offload toggle defaults to on; the host may
/// still decline any of them during feature negotiation.
#[derive(Clone, Copy, Debug)]
pub struct NetOptions {
    /// Offer VIRTIO_RING_F_EVENT_IDX for notification suppression.
    pub event_index: bool,
    /// Offer TX and RX checksum offload.
    pub csum_offload: bool,
    /// Offer TCP segmentation offload (host and guest).
    pub tso: bool,
    /// Offer UDP fragmentation offload (host and guest).
    pub ufo: bool,
    /// Ring size used when event-index is offered; must be a power of two.
    pub ring_size: u16,
}

impl Default for NetOptions {
    fn default() -> NetOptions {
        NetOptions {
            event_index: true,
            csum_offload: true,
            tso: true,
            ufo: true,
            ring_size: DEFAULT_RING_SIZE,
        }
    }
}

/// A running receive subscription. Dropping it stops delivery.
pub struct Subscription {
    task: Option<JoinHandle<io::Result<()>>>,
}

impl Subscription {
    /// Wait for the delivery loop to finish; it ends when the handler
    /// returns an error or the device goes away.
    pub async fn done(mut self) -> io::Result<()> {
        match self.task.take() {
            Some(task) => task.await.unwrap_or(Ok(())),
            None => Ok(()),
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(task) = &self.task {
            task.abort();
        }
    }
}

/// A virtio-net device over vhost-net: a transmit and a receive vring in
/// shared memory, a TAP backend, and the negotiated offload set.
///
/// Construction and `receive` spawn background tasks and must run inside a
/// tokio runtime.
pub struct Net {
    features: u64,
    hw_features: HwFeatures,
    header_len: usize,
    txq: TxQueue,
    rx_ring: Option<Arc<Vring>>,
    tasks: Vec<JoinHandle<()>>,
    // Keep the control and backend fds open for the device lifetime; the
    // kernel tears the queues down when they close.
    _vhost: VhostNet,
    _tap: Tap,
}

impl Net {
    /// Bring up the device on the TAP interface `tap_name`.
    pub fn new(tap_name: &str, opts: &NetOptions) -> Result<Net, SetupError> {
        let ring_size = ring_size(opts)?;

        let vhost = VhostNet::open()?;
        vhost.set_owner()?;

        let offered = driver_features(opts);
        let features = vhost.get_features()? & offered;
        vhost.set_features(features)?;
        let (hw_features, header_len) = apply_features(features);
        debug!("negotiated features {features:#x}, header length {header_len}");

        let tap = Tap::open(tap_name, &hw_features, header_len)?;

        let config = VringConfig {
            size: ring_size,
            event_idx: features & (1 << VIRTIO_RING_F_EVENT_IDX) != 0,
        };
        let mk_eventfd = || EventFd::new(EFD_NONBLOCK).map_err(SetupError::EventFd);
        let rx_notify = mk_eventfd()?;
        let rx_kick = mk_eventfd()?;
        let tx_notify = mk_eventfd()?;
        let tx_kick = mk_eventfd()?;
        // The kernel keeps its own references; the fd numbers just have to
        // be valid for the ioctls below.
        let rx_notify_fd = rx_notify.as_raw_fd();
        let rx_kick_fd = rx_kick.as_raw_fd();
        let tx_notify_fd = tx_notify.as_raw_fd();
        let tx_kick_fd = tx_kick.as_raw_fd();

        let storage = || AlignedBuffer::new(Vring::storage_size(ring_size), 4096);
        let rx_ring = Arc::new(Vring::new(config, storage(), rx_notify, rx_kick)?);
        let tx_ring = Arc::new(Vring::new(config, storage(), tx_notify, tx_kick)?);

        vhost.set_identity_mem_table()?;
        vhost.set_vring_num(RX_INDEX, ring_size)?;
        vhost.set_vring_num(TX_INDEX, ring_size)?;
        vhost.set_vring_addr(
            RX_INDEX,
            rx_ring.desc_table_addr(),
            rx_ring.used_ring_addr(),
            rx_ring.avail_ring_addr(),
        )?;
        vhost.set_vring_addr(
            TX_INDEX,
            tx_ring.desc_table_addr(),
            tx_ring.used_ring_addr(),
            tx_ring.avail_ring_addr(),
        )?;
        vhost.set_vring_kick(RX_INDEX, rx_kick_fd)?;
        vhost.set_vring_call(RX_INDEX, rx_notify_fd)?;
        vhost.set_vring_kick(TX_INDEX, tx_kick_fd)?;
        vhost.set_vring_call(TX_INDEX, tx_notify_fd)?;
        vhost.set_backend(RX_INDEX, tap.as_raw_fd())?;
        vhost.set_backend(TX_INDEX, tap.as_raw_fd())?;

        let txq = TxQueue::new(tx_ring.clone(), hw_features, header_len);
        let tx_driver = tokio::spawn(async move {
            if let Err(e) = tx_ring.run().await {
                error!("transmit ring driver failed: {e}");
            }
        });

        Ok(Net {
            features,
            hw_features,
            header_len,
            txq,
            rx_ring: Some(rx_ring),
            tasks: vec![tx_driver],
            _vhost: vhost,
            _tap: tap,
        })
    }

    /// Hand one outbound packet to the host; resolves once the host has
    /// consumed it.
    pub async fn send(&self, packet: Packet) -> io::Result<()> {
        self.txq.post(packet).await
    }

    /// Start receiving. `handler` is invoked for each inbound packet in
    /// arrival order; if it returns an error, delivery stops and the error
    /// surfaces through [`Subscription::done`].
    pub fn receive<F, Fut>(&mut self, mut handler: F) -> Result<Subscription, SetupError>
    where
        F: FnMut(Packet) -> Fut + Send + 'static,
        Fut: Future<Output = io::Result<()>> + Send,
    {
        let ring = self
            .rx_ring
            .take()
            .ok_or(SetupError::ReceiveAlreadyStarted)?;

        let (packets_tx, mut packets_rx) = mpsc::channel(ring.size() as usize);
        self.tasks
            .extend(RxQueue::new(ring.clone(), self.header_len).start(packets_tx));
        let rx_driver = tokio::spawn(async move {
            if let Err(e) = ring.run().await {
                error!("receive ring driver failed: {e}");
            }
        });
        self.tasks.push(rx_driver);

        let consumer = tokio::spawn(async move {
            while let Some(packet) = packets_rx.recv().await {
                handler(packet).await?;
            }
            Ok(())
        });
        Ok(Subscription {
            task: Some(consumer),
        })
    }

    /// The device's MAC address. Fixed: the driver does not negotiate one.
    pub fn hw_address(&self) -> [u8; 6] {
        [0x12, 0x23, 0x34, 0x56, 0x67, 0x78]
    }

    /// Offloads that survived feature negotiation.
    pub fn hw_features(&self) -> HwFeatures {
        self.hw_features
    }

    /// The negotiated virtio feature word.
    pub fn features(&self) -> u64 {
        self.features
    }
}

impl Drop for Net {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// Feature word this driver offers the host, gated by the options.
fn driver_features(opts: &NetOptions) -> u64 {
    let mut features = 1u64 << VIRTIO_RING_F_INDIRECT_DESC | 1u64 << VIRTIO_NET_F_MRG_RXBUF;
    if opts.event_index {
        features |= 1u64 << VIRTIO_RING_F_EVENT_IDX;
    }
    if opts.csum_offload {
        features |= 1u64 << VIRTIO_NET_F_CSUM | 1u64 << VIRTIO_NET_F_GUEST_CSUM;
    }
    if opts.tso {
        features |= 1u64 << VIRTIO_NET_F_HOST_TSO4 | 1u64 << VIRTIO_NET_F_GUEST_TSO4;
    }
    if opts.ufo {
        features |= 1u64 << VIRTIO_NET_F_HOST_UFO | 1u64 << VIRTIO_NET_F_GUEST_UFO;
    }
    features
}

/// Derive the offload set and net-header length from the negotiated word.
fn apply_features(negotiated: u64) -> (HwFeatures, usize) {
    let hw = HwFeatures {
        tx_csum_offload: negotiated & (1 << VIRTIO_NET_F_CSUM) != 0,
        rx_csum_offload: negotiated & (1 << VIRTIO_NET_F_GUEST_CSUM) != 0,
        tx_tso: negotiated & (1 << VIRTIO_NET_F_HOST_TSO4) != 0,
        tx_ufo: negotiated & (1 << VIRTIO_NET_F_HOST_UFO) != 0,
        ..Default::default()
    };
    let header_len = vnet_hdr_len(negotiated & (1 << VIRTIO_NET_F_MRG_RXBUF) != 0);
    (hw, header_len)
}

fn ring_size(opts: &NetOptions) -> Result<u16, SetupError> {
    let size = if opts.event_index {
        opts.ring_size
    } else {
        DEFAULT_RING_SIZE
    };
    if size == 0 || !size.is_power_of_two() || size > MAX_RING_SIZE {
        return Err(SetupError::RingSize(size));
    }
    Ok(size)
}
