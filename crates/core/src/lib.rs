#![allow(clippy::manual_is_multiple_of)]
// Veriboard - Embedded Board Emulation Platform
// Copyright (C) 2026 The Veriboard Authors
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

//! Core simulation substrate: the bus/memory fabric, the signal network,
//! cycle-driven time, the host I/O reactor and the cross-cutting services
//! every peripheral model is built on. CPU models and peripherals consume
//! these interfaces; they live in plugin modules.
//!
//! Everything here runs on one host thread, cooperatively: timer callbacks,
//! I/O handlers, signal traces and reactor callbacks never overlap, so the
//! context objects are `Rc`-based and lock-free by design.

pub mod bus;
pub mod clock;
pub mod debug;
pub mod devices;
pub mod image;
pub mod reactor;
pub mod registry;
pub mod senseless;
pub mod signal;

pub use bus::{
    AddressSpace, BusDevice, BusError, BusResult, DramCmd, Endian, HostBuf, IoOps, IohFlags,
    MappedDevice, MemFlags, SpecialCycle, SpecialCycleAction,
};
pub use clock::{CycleClock, CycleTimer, Cycles, NO_EXPIRY};
pub use debug::{ContOutcome, DebugBackend, StopOutcome, TargetStat};
pub use image::{DiskImage, ImageError, ImageFlags, ImageResult};
pub use reactor::{EventMask, PollHandle, Reactor, ReactorError, StreamHandle, TcpServer};
pub use registry::{DeviceContext, DeviceRegistry};
pub use senseless::Senseless;
pub use signal::{SigLevel, SigNode, SigTrace, SignalNet};
