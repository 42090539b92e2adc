// Veriboard - Embedded Board Emulation Platform
// Copyright (C) 2026 The Veriboard Authors
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

//! Bus/memory fabric: a flat 32-bit address space with two coexisting
//! backing mechanisms.
//!
//! Direct ranges hand accesses straight to a host buffer; I/O regions and
//! single-register handlers trap every access into device callbacks. Reads
//! and writes route through separate maps, so a read-only direct mapping and
//! a write trap can share a span (the flash program/erase pattern).

use std::cell::RefCell;
use std::collections::{BTreeMap, HashSet};
use std::rc::Rc;

pub type HostBuf = Rc<RefCell<Vec<u8>>>;

#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("region at {0:#010x} overlaps an existing mapping")]
    Overlap(u32),
    #[error("no direct mapping registered at {0:#010x}")]
    NoDirectMapping(u32),
    #[error("special cycle not understood by device")]
    BadSpecialCycle,
}

pub type BusResult<T> = Result<T, BusError>;

bitflags::bitflags! {
    /// Hardware access semantics a mapping exposes to the CPU path.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MemFlags: u32 {
        const READABLE = 1 << 0;
        const WRITABLE = 1 << 1;
    }
}

bitflags::bitflags! {
    /// Width policies for single-register I/O handlers.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct IohFlags: u32 {
        /// Wider accesses split into register-width chunks routed to the
        /// adjacent handlers.
        const SPLIT = 1 << 0;
        /// Narrower writes read the full register, merge, write back.
        const RMW = 1 << 1;
        /// Narrower reads fetch the full register and extract.
        const REG_READ = 1 << 2;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Endian {
    #[default]
    Little,
    Big,
}

/// Callbacks of an I/O region or register handler. Reads receive
/// `(addr, len)`, writes `(value, addr, len)`; absent callbacks leave the
/// corresponding direction unrouted.
#[derive(Default)]
pub struct IoOps {
    pub read: Option<Box<dyn FnMut(u32, u32) -> u32>>,
    pub write: Option<Box<dyn FnMut(u32, u32, u32)>>,
}

impl IoOps {
    pub fn read_only(read: impl FnMut(u32, u32) -> u32 + 'static) -> Self {
        Self {
            read: Some(Box::new(read)),
            write: None,
        }
    }

    pub fn write_only(write: impl FnMut(u32, u32, u32) + 'static) -> Self {
        Self {
            read: None,
            write: Some(Box::new(write)),
        }
    }

    pub fn new(
        read: impl FnMut(u32, u32) -> u32 + 'static,
        write: impl FnMut(u32, u32, u32) + 'static,
    ) -> Self {
        Self {
            read: Some(Box::new(read)),
            write: Some(Box::new(write)),
        }
    }
}

type DirtyCallback = Rc<RefCell<Box<dyn FnMut(u32)>>>;

struct DirtyTrace {
    page_shift: u32,
    dirty: HashSet<u32>,
    callback: DirtyCallback,
}

enum Backing {
    Direct {
        buf: HostBuf,
        buf_size: u32,
        trace: Option<DirtyTrace>,
    },
    Io {
        ops: Rc<RefCell<IoOps>>,
        endian: Endian,
    },
    Reg {
        ops: Rc<RefCell<IoOps>>,
        width: u32,
        flags: IohFlags,
    },
}

struct Region {
    base: u32,
    size: u32,
    backing: Backing,
}

#[derive(Default)]
struct SpaceInner {
    read_map: BTreeMap<u32, Region>,
    write_map: BTreeMap<u32, Region>,
    // Width-mismatch diagnostics fire once per (addr, len) site.
    warned_sites: HashSet<(u32, u32)>,
}

/// Handle on the board's address space. Cheap to clone.
#[derive(Clone, Default)]
pub struct AddressSpace {
    inner: Rc<RefCell<SpaceInner>>,
}

enum Route {
    Direct {
        buf: HostBuf,
        base: u32,
        size: u32,
        buf_size: u32,
    },
    Io {
        ops: Rc<RefCell<IoOps>>,
        endian: Endian,
    },
    Reg {
        ops: Rc<RefCell<IoOps>>,
        base: u32,
        width: u32,
        flags: IohFlags,
    },
    Unmapped,
}

fn overlaps(map: &BTreeMap<u32, Region>, base: u32, size: u32) -> bool {
    let end = base as u64 + size as u64;
    if let Some((_, region)) = map.range(..=base).next_back() {
        if region.base as u64 + region.size as u64 > base as u64 {
            return true;
        }
    }
    map.range(base..).next().is_some_and(|(_, region)| (region.base as u64) < end)
}

fn route(map: &BTreeMap<u32, Region>, addr: u32) -> Route {
    let Some((_, region)) = map.range(..=addr).next_back() else {
        return Route::Unmapped;
    };
    if (addr as u64) >= region.base as u64 + region.size as u64 {
        return Route::Unmapped;
    }
    match &region.backing {
        Backing::Direct { buf, buf_size, .. } => Route::Direct {
            buf: buf.clone(),
            base: region.base,
            size: region.size,
            buf_size: *buf_size,
        },
        Backing::Io { ops, endian } => Route::Io {
            ops: ops.clone(),
            endian: *endian,
        },
        Backing::Reg { ops, width, flags } => Route::Reg {
            ops: ops.clone(),
            base: region.base,
            width: *width,
            flags: *flags,
        },
    }
}

fn swap_value(value: u32, len: u32, endian: Endian) -> u32 {
    match (endian, len) {
        (Endian::Little, _) | (_, 1) => value,
        (Endian::Big, 2) => (value as u16).swap_bytes() as u32,
        (Endian::Big, 4) => value.swap_bytes(),
        (Endian::Big, _) => value,
    }
}

impl AddressSpace {
    pub fn new() -> Self {
        Self::default()
    }

    /// Associate a host buffer with `[base, base+map_size)`. When
    /// `map_size > buf_size` the buffer tiles across the range (address
    /// aliasing). Flags decide which of the read/write paths the mapping
    /// serves.
    pub fn map_range(
        &self,
        base: u32,
        buf: HostBuf,
        buf_size: u32,
        map_size: u32,
        flags: MemFlags,
    ) -> BusResult<()> {
        assert!(buf_size > 0, "direct mapping needs a nonempty buffer");
        let mut inner = self.inner.borrow_mut();
        if flags.contains(MemFlags::READABLE) && overlaps(&inner.read_map, base, map_size) {
            return Err(BusError::Overlap(base));
        }
        if flags.contains(MemFlags::WRITABLE) && overlaps(&inner.write_map, base, map_size) {
            return Err(BusError::Overlap(base));
        }
        if flags.contains(MemFlags::READABLE) {
            inner.read_map.insert(
                base,
                Region {
                    base,
                    size: map_size,
                    backing: Backing::Direct {
                        buf: buf.clone(),
                        buf_size,
                        trace: None,
                    },
                },
            );
        }
        if flags.contains(MemFlags::WRITABLE) {
            inner.write_map.insert(
                base,
                Region {
                    base,
                    size: map_size,
                    backing: Backing::Direct {
                        buf,
                        buf_size,
                        trace: None,
                    },
                },
            );
        }
        Ok(())
    }

    /// Remove every region whose base lies inside `[base, base+size)`, on
    /// both the read and the write path.
    pub fn unmap_range(&self, base: u32, size: u32) {
        let mut inner = self.inner.borrow_mut();
        let end = base as u64 + size as u64;
        let doomed: Vec<u32> = inner
            .read_map
            .range(base..)
            .take_while(|(b, _)| (**b as u64) < end)
            .map(|(b, _)| *b)
            .collect();
        for b in doomed {
            inner.read_map.remove(&b);
        }
        let doomed: Vec<u32> = inner
            .write_map
            .range(base..)
            .take_while(|(b, _)| (**b as u64) < end)
            .map(|(b, _)| *b)
            .collect();
        for b in doomed {
            inner.write_map.remove(&b);
        }
    }

    /// Register trapping callbacks for `[base, base+size)`. The region
    /// joins the read and/or write path depending on which callbacks are
    /// present.
    pub fn io_region(&self, base: u32, size: u32, ops: IoOps, endian: Endian) -> BusResult<()> {
        let has_read = ops.read.is_some();
        let has_write = ops.write.is_some();
        let ops = Rc::new(RefCell::new(ops));
        let mut inner = self.inner.borrow_mut();
        if has_read && overlaps(&inner.read_map, base, size) {
            return Err(BusError::Overlap(base));
        }
        if has_write && overlaps(&inner.write_map, base, size) {
            return Err(BusError::Overlap(base));
        }
        if has_read {
            inner.read_map.insert(
                base,
                Region {
                    base,
                    size,
                    backing: Backing::Io {
                        ops: ops.clone(),
                        endian,
                    },
                },
            );
        }
        if has_write {
            inner.write_map.insert(
                base,
                Region {
                    base,
                    size,
                    backing: Backing::Io { ops, endian },
                },
            );
        }
        Ok(())
    }

    pub fn io_new8(&self, addr: u32, ops: IoOps, flags: IohFlags) {
        self.io_new(addr, 1, ops, flags);
    }

    pub fn io_new16(&self, addr: u32, ops: IoOps, flags: IohFlags) {
        self.io_new(addr, 2, ops, flags);
    }

    pub fn io_new32(&self, addr: u32, ops: IoOps, flags: IohFlags) {
        self.io_new(addr, 4, ops, flags);
    }

    fn io_new(&self, addr: u32, width: u32, ops: IoOps, flags: IohFlags) {
        assert!(
            addr % width == 0,
            "register handler at {addr:#010x} not aligned to its width {width}"
        );
        let has_read = ops.read.is_some();
        let has_write = ops.write.is_some();
        let ops = Rc::new(RefCell::new(ops));
        let mut inner = self.inner.borrow_mut();
        // Overlap here is a wiring bug in a device model; fail loud during
        // bring-up rather than routing surprisingly at run time.
        if (has_read && overlaps(&inner.read_map, addr, width))
            || (has_write && overlaps(&inner.write_map, addr, width))
        {
            panic!("I/O handler overlap at {addr:#010x}");
        }
        if has_read {
            inner.read_map.insert(
                addr,
                Region {
                    base: addr,
                    size: width,
                    backing: Backing::Reg {
                        ops: ops.clone(),
                        width,
                        flags,
                    },
                },
            );
        }
        if has_write {
            inner.write_map.insert(
                addr,
                Region {
                    base: addr,
                    size: width,
                    backing: Backing::Reg { ops, width, flags },
                },
            );
        }
    }

    /// Remove a single-register handler installed with `io_new*`.
    pub fn io_delete(&self, addr: u32) {
        let mut inner = self.inner.borrow_mut();
        if matches!(
            inner.read_map.get(&addr),
            Some(Region {
                backing: Backing::Reg { .. },
                ..
            })
        ) {
            inner.read_map.remove(&addr);
        }
        if matches!(
            inner.write_map.get(&addr),
            Some(Region {
                backing: Backing::Reg { .. },
                ..
            })
        ) {
            inner.write_map.remove(&addr);
        }
    }

    /// Attach a page-granular dirty trace to the direct write mapping at
    /// `base`. The callback fires once per page on the first write since
    /// the last [`AddressSpace::clear_dirty`].
    pub fn trace_range(
        &self,
        base: u32,
        page_shift: u32,
        callback: impl FnMut(u32) + 'static,
    ) -> BusResult<()> {
        let mut inner = self.inner.borrow_mut();
        match inner.write_map.get_mut(&base) {
            Some(Region {
                backing: Backing::Direct { trace, .. },
                ..
            }) => {
                *trace = Some(DirtyTrace {
                    page_shift,
                    dirty: HashSet::new(),
                    callback: Rc::new(RefCell::new(Box::new(callback))),
                });
                Ok(())
            }
            _ => Err(BusError::NoDirectMapping(base)),
        }
    }

    /// Forget dirty-page state so the trace fires again on the next write.
    pub fn clear_dirty(&self, base: u32) -> BusResult<()> {
        let mut inner = self.inner.borrow_mut();
        match inner.write_map.get_mut(&base) {
            Some(Region {
                backing: Backing::Direct {
                    trace: Some(trace), ..
                },
                ..
            }) => {
                trace.dirty.clear();
                Ok(())
            }
            _ => Err(BusError::NoDirectMapping(base)),
        }
    }

    pub fn read8(&self, addr: u32) -> u8 {
        self.read(addr, 1) as u8
    }

    pub fn read16(&self, addr: u32) -> u16 {
        self.read(addr, 2) as u16
    }

    pub fn read32(&self, addr: u32) -> u32 {
        self.read(addr, 4)
    }

    pub fn write8(&self, addr: u32, value: u8) {
        self.write(value as u32, addr, 1);
    }

    pub fn write16(&self, addr: u32, value: u16) {
        self.write(value as u32, addr, 2);
    }

    pub fn write32(&self, addr: u32, value: u32) {
        self.write(value, addr, 4);
    }

    /// Read `len` (1/2/4) bytes at `addr`, little-endian composition.
    /// Unmapped accesses log and read as zero.
    pub fn read(&self, addr: u32, len: u32) -> u32 {
        let routed = route(&self.inner.borrow().read_map, addr);
        match routed {
            Route::Direct {
                buf,
                base,
                size,
                buf_size,
            } => {
                let buf = buf.borrow();
                let mut value = 0u32;
                for i in 0..len {
                    let a = addr.wrapping_add(i);
                    if (a as u64) >= base as u64 + size as u64 {
                        tracing::warn!("read past end of direct mapping at {a:#010x}");
                        break;
                    }
                    let off = ((a - base) % buf_size) as usize;
                    value |= (buf[off] as u32) << (8 * i);
                }
                value
            }
            Route::Io { ops, endian } => {
                let mut ops = ops.borrow_mut();
                match ops.read.as_mut() {
                    Some(read) => swap_value(read(addr, len), len, endian),
                    None => 0,
                }
            }
            Route::Reg {
                ops,
                base,
                width,
                flags,
            } => self.reg_read(ops, base, width, flags, addr, len),
            Route::Unmapped => {
                tracing::warn!("read from unmapped address {addr:#010x} (len {len})");
                0
            }
        }
    }

    /// Write `len` (1/2/4) bytes of `value` at `addr`. Unmapped accesses
    /// log and are dropped.
    pub fn write(&self, value: u32, addr: u32, len: u32) {
        let routed = route(&self.inner.borrow().write_map, addr);
        match routed {
            Route::Direct {
                buf,
                base,
                size,
                buf_size,
            } => {
                {
                    let mut buf = buf.borrow_mut();
                    for i in 0..len {
                        let a = addr.wrapping_add(i);
                        if (a as u64) >= base as u64 + size as u64 {
                            tracing::warn!("write past end of direct mapping at {a:#010x}");
                            break;
                        }
                        let off = ((a - base) % buf_size) as usize;
                        buf[off] = (value >> (8 * i)) as u8;
                    }
                }
                self.mark_dirty(base, addr, len);
            }
            Route::Io { ops, endian } => {
                let mut ops = ops.borrow_mut();
                if let Some(write) = ops.write.as_mut() {
                    write(swap_value(value, len, endian), addr, len);
                }
            }
            Route::Reg {
                ops,
                base,
                width,
                flags,
            } => self.reg_write(ops, base, width, flags, value, addr, len),
            Route::Unmapped => {
                tracing::warn!("write to unmapped address {addr:#010x} (len {len})");
            }
        }
    }

    fn reg_read(
        &self,
        ops: Rc<RefCell<IoOps>>,
        base: u32,
        width: u32,
        flags: IohFlags,
        addr: u32,
        len: u32,
    ) -> u32 {
        if len == width && addr == base {
            let mut ops = ops.borrow_mut();
            return match ops.read.as_mut() {
                Some(read) => read(addr, len),
                None => 0,
            };
        }
        if len < width || addr != base {
            if flags.contains(IohFlags::REG_READ) {
                let full = {
                    let mut ops = ops.borrow_mut();
                    match ops.read.as_mut() {
                        Some(read) => read(base, width),
                        None => 0,
                    }
                };
                let shift = 8 * (addr - base);
                let mask = if len >= 4 { u32::MAX } else { (1u32 << (8 * len)) - 1 };
                return (full >> shift) & mask;
            }
            self.warn_width_once(addr, len, width);
            return 0;
        }
        // len > width
        if flags.contains(IohFlags::SPLIT) {
            let mut value = 0u32;
            let mut off = 0;
            while off < len {
                value |= self.read(addr + off, width) << (8 * off);
                off += width;
            }
            return value;
        }
        self.warn_width_once(addr, len, width);
        0
    }

    #[allow(clippy::too_many_arguments)]
    fn reg_write(
        &self,
        ops: Rc<RefCell<IoOps>>,
        base: u32,
        width: u32,
        flags: IohFlags,
        value: u32,
        addr: u32,
        len: u32,
    ) {
        if len == width && addr == base {
            let mut ops = ops.borrow_mut();
            if let Some(write) = ops.write.as_mut() {
                write(value, addr, len);
            }
            return;
        }
        if len < width || addr != base {
            if flags.contains(IohFlags::RMW) {
                let full = {
                    let mut ops = ops.borrow_mut();
                    match ops.read.as_mut() {
                        Some(read) => read(base, width),
                        None => 0,
                    }
                };
                let shift = 8 * (addr - base);
                let mask = if len >= 4 { u32::MAX } else { (1u32 << (8 * len)) - 1 };
                let merged = (full & !(mask << shift)) | ((value & mask) << shift);
                let mut ops = ops.borrow_mut();
                if let Some(write) = ops.write.as_mut() {
                    write(merged, base, width);
                }
                return;
            }
            self.warn_width_once(addr, len, width);
            return;
        }
        // len > width
        if flags.contains(IohFlags::SPLIT) {
            let mut off = 0;
            while off < len {
                let mask = if width >= 4 { u32::MAX } else { (1u32 << (8 * width)) - 1 };
                self.write((value >> (8 * off)) & mask, addr + off, width);
                off += width;
            }
            return;
        }
        self.warn_width_once(addr, len, width);
    }

    fn warn_width_once(&self, addr: u32, len: u32, width: u32) {
        let mut inner = self.inner.borrow_mut();
        if inner.warned_sites.insert((addr, len)) {
            tracing::warn!(
                "access of length {len} at {addr:#010x} does not match register width {width}"
            );
        }
    }

    fn mark_dirty(&self, base: u32, addr: u32, len: u32) {
        let pending = {
            let mut inner = self.inner.borrow_mut();
            let Some(Region {
                backing: Backing::Direct {
                    trace: Some(trace), ..
                },
                ..
            }) = inner.write_map.get_mut(&base)
            else {
                return;
            };
            let mut pending = Vec::new();
            let first = addr >> trace.page_shift;
            let last = addr.wrapping_add(len.saturating_sub(1)) >> trace.page_shift;
            for page in first..=last {
                if trace.dirty.insert(page) {
                    pending.push((trace.callback.clone(), page << trace.page_shift));
                }
            }
            pending
        };
        for (callback, page_base) in pending {
            (callback.borrow_mut())(page_base);
        }
    }
}

/// A device's view of the fabric: map/unmap hooks invoked for every live
/// mapping, plus the special-cycle side channel.
pub trait BusDevice {
    /// Register regions for one mapping of this device.
    fn map(&mut self, space: &AddressSpace, base: u32, mapsize: u32, flags: MemFlags);

    /// Remove the regions registered by `map`.
    fn unmap(&mut self, space: &AddressSpace, base: u32, mapsize: u32);

    /// Readability/writability the device advertises.
    fn hw_flags(&self) -> MemFlags;

    /// Tagged side-channel message. Devices that do not recognize the
    /// message reply with an error.
    fn special_cycle(&mut self, cycle: &SpecialCycle) -> BusResult<SpecialCycleAction> {
        let _ = cycle;
        Err(BusError::BadSpecialCycle)
    }
}

/// What the fabric should do after a special cycle was accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpecialCycleAction {
    None,
    /// The device changed mode; re-lay every live mapping.
    Remap,
}

/// SDRAM command phases conveyed by a memory-controller model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DramCmd {
    Normal,
    Precharge,
    AutoRefresh,
    SetMode,
    SelfRefresh,
}

/// Special-cycle messages, one variant per magic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpecialCycle {
    DramCommand(DramCmd),
}

struct MappedInner {
    dev: Rc<RefCell<dyn BusDevice>>,
    mappings: RefCell<Vec<(u32, u32)>>,
}

/// A bus device together with its list of live mappings. The list is what
/// [`AddressSpace::update_mappings`] walks when the device changes mode.
#[derive(Clone)]
pub struct MappedDevice {
    inner: Rc<MappedInner>,
}

impl MappedDevice {
    pub fn new(dev: Rc<RefCell<dyn BusDevice>>) -> Self {
        Self {
            inner: Rc::new(MappedInner {
                dev,
                mappings: RefCell::new(Vec::new()),
            }),
        }
    }

    pub fn device(&self) -> &Rc<RefCell<dyn BusDevice>> {
        &self.inner.dev
    }

    pub fn mappings(&self) -> Vec<(u32, u32)> {
        self.inner.mappings.borrow().clone()
    }
}

impl AddressSpace {
    /// Map a device at `base` and record the mapping on its list.
    pub fn add_area(&self, mdev: &MappedDevice, base: u32, mapsize: u32) {
        mdev.inner.mappings.borrow_mut().push((base, mapsize));
        let flags = mdev.inner.dev.borrow().hw_flags();
        mdev.inner.dev.borrow_mut().map(self, base, mapsize, flags);
    }

    /// Unmap one mapping of a device and drop it from the list.
    pub fn remove_area(&self, mdev: &MappedDevice, base: u32, mapsize: u32) {
        let mut mappings = mdev.inner.mappings.borrow_mut();
        if let Some(pos) = mappings.iter().position(|&m| m == (base, mapsize)) {
            mappings.remove(pos);
            drop(mappings);
            mdev.inner.dev.borrow_mut().unmap(self, base, mapsize);
        }
    }

    /// Re-lay every live mapping of a device: unmap then map each, so a
    /// mode change (flash P/E, LCD enable, SDRAM command phase) swaps its
    /// region semantics atomically from the CPU's viewpoint.
    pub fn update_mappings(&self, mdev: &MappedDevice) {
        let mappings = mdev.mappings();
        let flags = mdev.inner.dev.borrow().hw_flags();
        let mut dev = mdev.inner.dev.borrow_mut();
        for (base, mapsize) in mappings {
            dev.unmap(self, base, mapsize);
            dev.map(self, base, mapsize, flags);
        }
    }

    /// Deliver a special cycle to a device, re-laying its mappings when it
    /// asks for it.
    pub fn special_cycle(&self, mdev: &MappedDevice, cycle: &SpecialCycle) -> BusResult<()> {
        let action = mdev.inner.dev.borrow_mut().special_cycle(cycle)?;
        if action == SpecialCycleAction::Remap {
            self.update_mappings(mdev);
        }
        Ok(())
    }
}
