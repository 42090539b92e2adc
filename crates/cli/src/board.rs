// Veriboard - Embedded Board Emulation Platform
// Copyright (C) 2026 The Veriboard Authors
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

//! Board bring-up: wires the core context objects together, loads plugin
//! modules, instantiates the devices named in configuration and runs the
//! idle loop.

use anyhow::Context;
use std::cell::RefCell;
use std::path::PathBuf;
use std::rc::Rc;
use std::time::{Duration, Instant};
use veriboard_config::{parse_memsize, Config};
use veriboard_core::debug::DebugBackend;
use veriboard_core::registry::{DeviceContext, DeviceRegistry};
use veriboard_core::{
    AddressSpace, CycleClock, MappedDevice, Reactor, Senseless, SignalNet, NO_EXPIRY,
};
use veriboard_gdbstub::GdbServer;
use veriboard_loader::LoadedPlugins;

const DEFAULT_CPU_CLOCK: u64 = 1_000_000_000;
/// Poll bound while no timer is armed.
const IDLE_WAIT: Duration = Duration::from_millis(100);

/// Debug backend offered on the GDB port until a CPU module installs a
/// real one. Every operation is unsupported, so the server answers with
/// protocol stubs.
struct NullBackend;

impl DebugBackend for NullBackend {}

pub struct Board {
    ctx: DeviceContext,
    devices: Vec<(String, MappedDevice)>,
    senseless: Senseless,
    gdb: Option<GdbServer>,
    // Held so plugin code stays mapped for the board's lifetime.
    _plugins: LoadedPlugins,
}

impl Board {
    pub fn from_config(config: Config) -> anyhow::Result<Self> {
        let rate = config
            .read_uint64("global", "cpu_clock")
            .unwrap_or(DEFAULT_CPU_CLOCK);
        let imagedir = config
            .read_var("global", "imagedir")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));

        let clock = CycleClock::new(rate);
        let senseless = Senseless::new(&clock, &config);
        let mut registry = DeviceRegistry::with_builtins();
        let plugins = veriboard_loader::load_from_config(&config, &mut registry)
            .context("loading plugin modules")?;

        let config = Rc::new(RefCell::new(config));
        let ctx = DeviceContext {
            config: config.clone(),
            clock,
            signals: SignalNet::new(),
            space: AddressSpace::new(),
            reactor: Reactor::new(),
            imagedir,
        };

        let devices = Self::create_devices(&ctx, &registry)?;

        let backend: Rc<RefCell<dyn DebugBackend>> = Rc::new(RefCell::new(NullBackend));
        let gdb = GdbServer::from_config(&ctx.config.borrow(), &ctx.reactor, backend)
            .context("starting GDB server")?;

        Ok(Self {
            ctx,
            devices,
            senseless,
            gdb,
            _plugins: plugins,
        })
    }

    /// Instantiate and map every device named in `[devices] order`. Each
    /// instance section carries at least `type` and `base`.
    fn create_devices(
        ctx: &DeviceContext,
        registry: &DeviceRegistry,
    ) -> anyhow::Result<Vec<(String, MappedDevice)>> {
        let order = ctx.config.borrow().read_list("devices", "order");
        let mut devices = Vec::new();
        for name in order {
            let (type_name, base, mapsize) = {
                let config = ctx.config.borrow();
                let type_name = config
                    .read_var(&name, "type")
                    .with_context(|| format!("device \"{name}\" has no type"))?
                    .to_string();
                let base = config
                    .read_uint32(&name, "base")
                    .with_context(|| format!("device \"{name}\" has no base address"))?;
                let mapsize = match config.read_var(&name, "mapsize") {
                    Some(s) => parse_memsize(s)? as u32,
                    None => match config.read_var(&name, "size") {
                        Some(s) => parse_memsize(s)? as u32,
                        None => 0,
                    },
                };
                (type_name, base, mapsize)
            };
            let dev = registry
                .create(ctx, &type_name, &name)
                .with_context(|| format!("creating device \"{name}\""))?;
            if mapsize > 0 {
                ctx.space.add_area(&dev, base, mapsize);
                tracing::info!(
                    "device \"{}\" ({}) mapped at {:#010x}+{:#x}",
                    name,
                    type_name,
                    base,
                    mapsize
                );
            } else {
                tracing::info!("device \"{}\" ({}) created unmapped", name, type_name);
            }
            devices.push((name, dev));
        }
        Ok(devices)
    }

    pub fn context(&self) -> &DeviceContext {
        &self.ctx
    }

    pub fn senseless(&self) -> &Senseless {
        &self.senseless
    }

    pub fn device(&self, name: &str) -> Option<&MappedDevice> {
        self.devices
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, dev)| dev)
    }

    pub fn gdb_addr(&self) -> Option<std::net::SocketAddr> {
        self.gdb.as_ref().and_then(|g| g.local_addr())
    }

    /// The idle loop: wait for host I/O bounded by the next timer expiry,
    /// account the elapsed wall time as cycles, dispatch due timers. A CPU
    /// module replaces this loop with its own stepping; the semantics of
    /// the reactor/timer handshake stay the same.
    pub fn run(&self, limit: Option<Duration>) -> anyhow::Result<()> {
        let started = Instant::now();
        loop {
            if let Some(limit) = limit {
                if started.elapsed() >= limit {
                    return Ok(());
                }
            }
            let clock = &self.ctx.clock;
            let first = clock.first_expiry();
            let timeout = if first == NO_EXPIRY {
                IDLE_WAIT
            } else {
                let pending = first.saturating_sub(clock.now());
                Duration::from_nanos(clock.cycles_to_nsecs(pending)).min(IDLE_WAIT)
            };
            let turn_started = Instant::now();
            self.ctx.reactor.run_once(timeout)?;
            let elapsed = turn_started.elapsed().as_nanos() as u64;
            clock.advance(clock.nsecs_to_cycles(elapsed));
            clock.run_due();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn board_config(extra: &str) -> Config {
        let mut config = Config::new();
        config.add_string(&format!(
            "[global]\ncpu_clock: 1000000\n[devices]\norder: ram0 dram0\n\
             [ram0]\ntype: sram\nbase: 0x20000000\nsize: 16k\n\
             [dram0]\ntype: dram\nbase: 0x80000000\nsize: 1M\n{extra}"
        ));
        config
    }

    #[test]
    fn test_board_brings_up_devices() {
        let board = Board::from_config(board_config("")).unwrap();
        let space = &board.context().space;
        space.write32(0x2000_0000, 0x12345678);
        assert_eq!(space.read32(0x2000_0000), 0x12345678);
        space.write8(0x8000_0000, 0x42);
        assert_eq!(space.read8(0x8000_0000), 0x42);
        assert!(board.device("ram0").is_some());
        assert!(board.device("nope").is_none());
        assert!(board.gdb_addr().is_none());
    }

    #[test]
    fn test_board_with_gdb_port() {
        let board =
            Board::from_config(board_config("[gdebug]\nhost: 127.0.0.1\nport: 0\n")).unwrap();
        assert!(board.gdb_addr().is_some());
    }

    #[test]
    fn test_unknown_device_type_fails() {
        let mut config = Config::new();
        config.add_string("[devices]\norder: x0\n[x0]\ntype: warpdrive\nbase: 0\n");
        assert!(Board::from_config(config).is_err());
    }

    #[test]
    fn test_run_advances_clock_and_fires_timers() {
        use std::cell::Cell;
        let board = Board::from_config(board_config("")).unwrap();
        let fired = Rc::new(Cell::new(false));
        let f = fired.clone();
        let timer = veriboard_core::CycleTimer::new(&board.context().clock, move || f.set(true));
        // 1 ms of simulated time at 1 MHz.
        timer.modify(1_000);
        // A guest-style poll report must never push time past the timer.
        board.senseless().report(100);
        board.run(Some(Duration::from_millis(100))).unwrap();
        assert!(fired.get());
    }
}
