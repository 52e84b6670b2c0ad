// Copyright 2018 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Userspace virtio-net driver.
//!
//! Ships Ethernet frames between an application and a vhost-net backend
//! over a pair of shared-memory split virtqueues, with checksum and
//! segmentation offload negotiated per device.

#[macro_use]
extern crate log;

pub mod packet;
pub mod virtio;

pub use packet::{Fragment, L4Protocol, OffloadInfo, Packet};
pub use virtio::net::{HwFeatures, Net, NetOptions, SetupError, Subscription};
