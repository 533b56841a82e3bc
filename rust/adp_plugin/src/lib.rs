// Copyright (c) Advanced Micro Devices, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Daemon-side pieces of the AMD GPU device plugin: driver-mode
//! configuration and the serving loop over discovered snapshots. The
//! binary in this crate wires these to the command line; the registration
//! adapter consumes them through [`plugin::DeviceSink`].

pub mod config;
pub mod plugin;
