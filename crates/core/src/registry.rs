// Veriboard - Embedded Board Emulation Platform
// Copyright (C) 2026 The Veriboard Authors
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

//! Device-model factory registry.
//!
//! Boards name device types in configuration; plugins and the built-in
//! models register constructors here at startup. A constructor receives the
//! shared board context and the instance name (its configuration section).

use crate::bus::{AddressSpace, MappedDevice};
use crate::clock::CycleClock;
use crate::reactor::Reactor;
use crate::signal::SignalNet;
use std::cell::RefCell;
use std::collections::HashMap;
use std::path::PathBuf;
use std::rc::Rc;
use veriboard_config::Config;

/// Shared context handed to every device constructor. All handles are
/// cheap clones onto board-global state.
#[derive(Clone)]
pub struct DeviceContext {
    pub config: Rc<RefCell<Config>>,
    pub clock: CycleClock,
    pub signals: SignalNet,
    pub space: AddressSpace,
    pub reactor: Reactor,
    pub imagedir: PathBuf,
}

type Constructor = Box<dyn Fn(&DeviceContext, &str) -> anyhow::Result<MappedDevice>>;

#[derive(Default)]
pub struct DeviceRegistry {
    makers: HashMap<String, Constructor>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry preloaded with the built-in memory models.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("sram", |ctx, name| crate::devices::SRam::new(ctx, name));
        registry.register("dram", |ctx, name| crate::devices::DRam::new(ctx, name));
        registry
    }

    /// Register a constructor for `type_name`. Later registrations replace
    /// earlier ones, so plugins may override built-ins.
    pub fn register(
        &mut self,
        type_name: &str,
        maker: impl Fn(&DeviceContext, &str) -> anyhow::Result<MappedDevice> + 'static,
    ) {
        if self
            .makers
            .insert(type_name.to_string(), Box::new(maker))
            .is_some()
        {
            tracing::info!("device type '{}' re-registered", type_name);
        }
    }

    pub fn knows(&self, type_name: &str) -> bool {
        self.makers.contains_key(type_name)
    }

    /// Instantiate a device of `type_name` named `instance`.
    pub fn create(
        &self,
        ctx: &DeviceContext,
        type_name: &str,
        instance: &str,
    ) -> anyhow::Result<MappedDevice> {
        let maker = self
            .makers
            .get(type_name)
            .ok_or_else(|| anyhow::anyhow!("unknown device type '{type_name}'"))?;
        maker(ctx, instance)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context() -> DeviceContext {
        let mut config = Config::new();
        config.add_string("[ram0]\nsize: 64k\n");
        DeviceContext {
            config: Rc::new(RefCell::new(config)),
            clock: CycleClock::new(1_000_000_000),
            signals: SignalNet::new(),
            space: AddressSpace::new(),
            reactor: Reactor::new(),
            imagedir: std::env::temp_dir(),
        }
    }

    #[test]
    fn test_builtin_sram_constructible() {
        let ctx = context();
        let registry = DeviceRegistry::with_builtins();
        assert!(registry.knows("sram"));
        let dev = registry.create(&ctx, "sram", "ram0").unwrap();
        ctx.space.add_area(&dev, 0x2000_0000, 64 * 1024);
        ctx.space.write32(0x2000_0000, 0x12345678);
        assert_eq!(ctx.space.read32(0x2000_0000), 0x12345678);
    }

    #[test]
    fn test_unknown_type_is_an_error() {
        let ctx = context();
        let registry = DeviceRegistry::with_builtins();
        assert!(registry.create(&ctx, "warpdrive", "w0").is_err());
    }
}
