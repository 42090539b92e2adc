// Veriboard - Embedded Board Emulation Platform
// Copyright (C) 2026 The Veriboard Authors
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

use crate::bus::{
    AddressSpace, BusDevice, BusError, BusResult, DramCmd, Endian, HostBuf, IoOps, MappedDevice,
    MemFlags, SpecialCycle, SpecialCycleAction,
};
use crate::registry::DeviceContext;
use std::cell::RefCell;
use std::rc::Rc;
use veriboard_config::parse_memsize;

/// Known SDRAM parts selectable with `[name] type`. Geometry is carried for
/// controllers that want to sanity-check their row/column programming.
struct DRamType {
    name: &'static str,
    size_mbits: u32,
    rowbits: u32,
    colbits: u32,
    banks: u32,
    width: u32,
}

static DRAM_TYPES: &[DRamType] = &[
    DRamType {
        name: "K4S2816F32-TC75",
        size_mbits: 128,
        rowbits: 12,
        colbits: 9,
        banks: 4,
        width: 16,
    },
    DRamType {
        name: "HYE16L256160BF-7.5",
        size_mbits: 256,
        rowbits: 13,
        colbits: 9,
        banks: 4,
        width: 16,
    },
];

/// SDRAM bank. During normal cycles the array is directly mapped; a memory
/// controller switches it into command mode with special cycles, during
/// which accesses trap (mode-register set, precharge and friends travel in
/// the address bits, not the data).
pub struct DRam {
    name: String,
    host_mem: HostBuf,
    size: u32,
    cycletype: DramCmd,
}

impl DRam {
    pub fn new(ctx: &DeviceContext, name: &str) -> anyhow::Result<MappedDevice> {
        let config = ctx.config.borrow();
        let sizestr = config.read_var(name, "size");
        let typestr = config.read_var(name, "type");
        let size = match (sizestr, typestr) {
            (Some(_), Some(_)) => {
                anyhow::bail!("{name}: specify DRAM size or DRAM type, but not both")
            }
            (Some(s), None) => parse_memsize(s)? as u32,
            (None, Some(t)) => {
                let chip = DRAM_TYPES
                    .iter()
                    .find(|d| d.name == t)
                    .ok_or_else(|| anyhow::anyhow!("{name}: unknown DRAM type \"{t}\""))?;
                let chips = config
                    .read_uint32(name, "chips")
                    .map_err(|_| anyhow::anyhow!("{name}: number of chips in DRAM bank is not given"))?;
                if chips == 0 {
                    anyhow::bail!("{name}: number of chips in DRAM bank is not given");
                }
                let per_chip =
                    (1u64 << chip.rowbits) * (1 << chip.colbits) * chip.banks as u64 * chip.width as u64 / 8;
                debug_assert_eq!(per_chip * 8, chip.size_mbits as u64 * 1024 * 1024);
                let size = per_chip * chips as u64;
                if size > u32::MAX as u64 {
                    anyhow::bail!("{name}: {chips} chips of \"{t}\" exceed the 32-bit address space");
                }
                size as u32
            }
            (None, None) => anyhow::bail!("DRAM bank \"{name}\" not present"),
        };
        if size == 0 {
            anyhow::bail!("DRAM bank \"{name}\" not present");
        }
        tracing::info!("DRAM bank \"{}\" with size {}kB", name, size / 1024);
        let dram = DRam {
            name: name.to_string(),
            host_mem: Rc::new(RefCell::new(vec![0; size as usize])),
            size,
            cycletype: DramCmd::Normal,
        };
        Ok(MappedDevice::new(Rc::new(RefCell::new(dram))))
    }
}

impl BusDevice for DRam {
    fn map(&mut self, space: &AddressSpace, base: u32, mapsize: u32, flags: MemFlags) {
        if self.cycletype == DramCmd::Normal {
            let flags = flags & (MemFlags::READABLE | MemFlags::WRITABLE);
            if let Err(e) = space.map_range(base, self.host_mem.clone(), self.size, mapsize, flags)
            {
                tracing::warn!("DRAM \"{}\": {}", self.name, e);
            }
        } else {
            // Command mode: the array is not addressable; trap everything.
            let name_r = self.name.clone();
            let name_w = self.name.clone();
            let ops = IoOps::new(
                move |addr, _len| {
                    tracing::warn!("DRAM \"{}\": read at {addr:#010x} during command cycle", name_r);
                    0
                },
                move |_value, addr, _len| {
                    tracing::warn!(
                        "DRAM \"{}\": strange write at {addr:#010x} during command cycle",
                        name_w
                    );
                },
            );
            if let Err(e) = space.io_region(base, mapsize, ops, Endian::Little) {
                tracing::warn!("DRAM \"{}\": {}", self.name, e);
            }
        }
    }

    fn unmap(&mut self, space: &AddressSpace, base: u32, mapsize: u32) {
        space.unmap_range(base, mapsize);
    }

    fn hw_flags(&self) -> MemFlags {
        MemFlags::READABLE | MemFlags::WRITABLE
    }

    fn special_cycle(&mut self, cycle: &SpecialCycle) -> BusResult<SpecialCycleAction> {
        let SpecialCycle::DramCommand(cmd) = *cycle else {
            tracing::warn!("DRAM \"{}\": unrecognized special cycle", self.name);
            return Err(BusError::BadSpecialCycle);
        };
        if self.cycletype == cmd {
            return Ok(SpecialCycleAction::None);
        }
        let was_normal = self.cycletype == DramCmd::Normal;
        let goes_normal = cmd == DramCmd::Normal;
        self.cycletype = cmd;
        // Only the normal<->command edge changes how the range is backed.
        if was_normal != goes_normal {
            Ok(SpecialCycleAction::Remap)
        } else {
            Ok(SpecialCycleAction::None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context(extra: &str) -> DeviceContext {
        use crate::{clock::CycleClock, reactor::Reactor, signal::SignalNet};
        let mut config = veriboard_config::Config::new();
        config.add_string(extra);
        DeviceContext {
            config: Rc::new(RefCell::new(config)),
            clock: CycleClock::new(1_000_000),
            signals: SignalNet::new(),
            space: AddressSpace::new(),
            reactor: Reactor::new(),
            imagedir: std::env::temp_dir(),
        }
    }

    #[test]
    fn test_size_from_chip_type() {
        let ctx = context("[dram0]\ntype: K4S2816F32-TC75\nchips: 1\n");
        let dev = DRam::new(&ctx, "dram0").unwrap();
        ctx.space.add_area(&dev, 0x0800_0000, 16 * 1024 * 1024);
        ctx.space.write32(0x0800_0000, 0xfeedface);
        assert_eq!(ctx.space.read32(0x0800_0000), 0xfeedface);
    }

    #[test]
    fn test_multi_chip_bank_size() {
        // Two 16MiB chips make one 32MiB bank; the upper half must be
        // real storage, not an alias of the first chip.
        let ctx = context("[dram0]\ntype: K4S2816F32-TC75\nchips: 2\n");
        let dev = DRam::new(&ctx, "dram0").unwrap();
        ctx.space.add_area(&dev, 0x8000_0000, 32 * 1024 * 1024);
        ctx.space.write32(0x8000_0000 + 24 * 1024 * 1024, 0xcafef00d);
        assert_eq!(ctx.space.read32(0x8000_0000 + 24 * 1024 * 1024), 0xcafef00d);
        ctx.space.write8(0x8000_0000, 0x11);
        assert_eq!(ctx.space.read8(0x8000_0000 + 16 * 1024 * 1024), 0);
    }

    #[test]
    fn test_chip_type_without_chip_count_fails() {
        let ctx = context("[dram0]\ntype: K4S2816F32-TC75\n");
        assert!(DRam::new(&ctx, "dram0").is_err());
        let ctx = context("[dram0]\ntype: K4S2816F32-TC75\nchips: 0\n");
        assert!(DRam::new(&ctx, "dram0").is_err());
    }

    #[test]
    fn test_size_and_type_conflict() {
        let ctx = context("[dram0]\ntype: K4S2816F32-TC75\nsize: 16M\nchips: 1\n");
        assert!(DRam::new(&ctx, "dram0").is_err());
    }

    #[test]
    fn test_command_cycle_switches_mapping() {
        let ctx = context("[dram0]\nsize: 1M\n");
        let dev = DRam::new(&ctx, "dram0").unwrap();
        ctx.space.add_area(&dev, 0x0, 0x10_0000);
        ctx.space.write32(0x100, 0x11223344);
        assert_eq!(ctx.space.read32(0x100), 0x11223344);

        // Controller raises a mode-register-set phase: array unreachable.
        ctx.space
            .special_cycle(&dev, &SpecialCycle::DramCommand(DramCmd::SetMode))
            .unwrap();
        assert_eq!(ctx.space.read32(0x100), 0);
        ctx.space.write32(0x100, 0xdeadbeef); // trapped, dropped

        // Back to normal cycles: contents were preserved.
        ctx.space
            .special_cycle(&dev, &SpecialCycle::DramCommand(DramCmd::Normal))
            .unwrap();
        assert_eq!(ctx.space.read32(0x100), 0x11223344);
    }

    #[test]
    fn test_repeated_command_is_idempotent() {
        let ctx = context("[dram0]\nsize: 1M\n");
        let dev = DRam::new(&ctx, "dram0").unwrap();
        ctx.space.add_area(&dev, 0x0, 0x10_0000);
        for _ in 0..2 {
            ctx.space
                .special_cycle(&dev, &SpecialCycle::DramCommand(DramCmd::AutoRefresh))
                .unwrap();
        }
        ctx.space
            .special_cycle(&dev, &SpecialCycle::DramCommand(DramCmd::Normal))
            .unwrap();
        ctx.space.write8(0x0, 0x7e);
        assert_eq!(ctx.space.read8(0x0), 0x7e);
    }
}
