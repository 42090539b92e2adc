// Veriboard - Embedded Board Emulation Platform
// Copyright (C) 2026 The Veriboard Authors
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

use crate::bus::{AddressSpace, BusDevice, HostBuf, MappedDevice, MemFlags};
use crate::registry::DeviceContext;
use anyhow::Context;
use std::cell::RefCell;
use std::rc::Rc;
use veriboard_config::parse_memsize;

/// Static RAM bank. Size comes from `[name] size`; contents power up as
/// 0xFF like a real unprogrammed part.
pub struct SRam {
    name: String,
    host_mem: HostBuf,
    size: u32,
}

impl SRam {
    pub fn new(ctx: &DeviceContext, name: &str) -> anyhow::Result<MappedDevice> {
        let config = ctx.config.borrow();
        let sizestr = config
            .read_var(name, "size")
            .with_context(|| format!("SRAM bank \"{name}\" has no size"))?;
        let size = parse_memsize(sizestr)
            .with_context(|| format!("SRAM bank \"{name}\": bad size"))? as u32;
        if size == 0 {
            anyhow::bail!("SRAM bank \"{name}\" not present");
        }
        tracing::info!("SRAM bank \"{}\" with size {:.1}kB", name, size as f64 / 1024.0);
        let sram = SRam {
            name: name.to_string(),
            host_mem: Rc::new(RefCell::new(vec![0xFF; size as usize])),
            size,
        };
        Ok(MappedDevice::new(Rc::new(RefCell::new(sram))))
    }
}

impl BusDevice for SRam {
    fn map(&mut self, space: &AddressSpace, base: u32, mapsize: u32, flags: MemFlags) {
        let flags = flags & (MemFlags::READABLE | MemFlags::WRITABLE);
        if let Err(e) = space.map_range(base, self.host_mem.clone(), self.size, mapsize, flags) {
            tracing::warn!("SRAM \"{}\": {}", self.name, e);
        }
    }

    fn unmap(&mut self, space: &AddressSpace, base: u32, mapsize: u32) {
        space.unmap_range(base, mapsize);
    }

    fn hw_flags(&self) -> MemFlags {
        MemFlags::READABLE | MemFlags::WRITABLE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context() -> DeviceContext {
        use crate::{clock::CycleClock, reactor::Reactor, signal::SignalNet};
        let mut config = veriboard_config::Config::new();
        config.add_string("[sram0]\nsize: 4k\n");
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
    fn test_powers_up_erased() {
        let ctx = context();
        let dev = SRam::new(&ctx, "sram0").unwrap();
        ctx.space.add_area(&dev, 0x1000, 4096);
        assert_eq!(ctx.space.read8(0x1000), 0xFF);
        ctx.space.write8(0x1000, 0x42);
        assert_eq!(ctx.space.read8(0x1000), 0x42);
    }

    #[test]
    fn test_missing_size_fails() {
        let ctx = context();
        assert!(SRam::new(&ctx, "sram9").is_err());
    }
}
