// Veriboard - Embedded Board Emulation Platform
// Copyright (C) 2026 The Veriboard Authors
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

//! End-to-end fabric scenarios: devices switching mapping modes, timers
//! bounding senseless jumps, signal nets driving bus-visible state.

use std::cell::RefCell;
use std::rc::Rc;
use veriboard_core::{
    AddressSpace, BusDevice, CycleClock, CycleTimer, Endian, HostBuf, IoOps, MappedDevice,
    MemFlags, Senseless, SigLevel, SignalNet,
};

/// A NOR-flash-like device: array reads are memory mapped, writes always
/// trap into the command interpreter. In program/erase mode reads trap too.
struct FlashDev {
    array: HostBuf,
    size: u32,
    pe_mode: Rc<RefCell<bool>>,
    write_log: Rc<RefCell<Vec<(u32, u32, u32)>>>,
}

impl BusDevice for FlashDev {
    fn map(&mut self, space: &AddressSpace, base: u32, mapsize: u32, _flags: MemFlags) {
        let log = self.write_log.clone();
        if *self.pe_mode.borrow() {
            let pe = self.pe_mode.clone();
            space
                .io_region(
                    base,
                    mapsize,
                    IoOps::new(
                        move |_addr, _len| if *pe.borrow() { 0x80 } else { 0 },
                        move |value, addr, len| log.borrow_mut().push((value, addr, len)),
                    ),
                    Endian::Little,
                )
                .unwrap();
        } else {
            space
                .map_range(base, self.array.clone(), self.size, mapsize, MemFlags::READABLE)
                .unwrap();
            space
                .io_region(
                    base,
                    mapsize,
                    IoOps::write_only(move |value, addr, len| {
                        log.borrow_mut().push((value, addr, len))
                    }),
                    Endian::Little,
                )
                .unwrap();
        }
    }

    fn unmap(&mut self, space: &AddressSpace, base: u32, mapsize: u32) {
        space.unmap_range(base, mapsize);
    }

    fn hw_flags(&self) -> MemFlags {
        MemFlags::READABLE | MemFlags::WRITABLE
    }
}

#[test]
fn test_flash_mode_switch_via_update_mappings() {
    let space = AddressSpace::new();
    let array: HostBuf = Rc::new(RefCell::new(vec![0x90u8; 0x1000]));
    let pe_mode = Rc::new(RefCell::new(false));
    let write_log = Rc::new(RefCell::new(Vec::new()));
    let dev = MappedDevice::new(Rc::new(RefCell::new(FlashDev {
        array,
        size: 0x1000,
        pe_mode: pe_mode.clone(),
        write_log: write_log.clone(),
    })));
    space.add_area(&dev, 0x0, 0x1000);

    // Array mode: reads come from the host buffer, writes trap.
    assert_eq!(space.read8(0x100), 0x90);
    space.write(0xA0, 0x100, 1);
    assert_eq!(*write_log.borrow(), vec![(0xA0, 0x100, 1)]);

    // The command interpreter enters program/erase and re-lays mappings.
    *pe_mode.borrow_mut() = true;
    space.update_mappings(&dev);
    assert_eq!(space.read8(0x100), 0x80, "status read while busy");

    // Back to array mode.
    *pe_mode.borrow_mut() = false;
    space.update_mappings(&dev);
    assert_eq!(space.read8(0x100), 0x90);
}

#[test]
fn test_senseless_jump_never_skips_timers() {
    let clock = CycleClock::new(1_000_000_000);
    let mut config = veriboard_config::Config::new();
    config.add_string("[poll_detector]\nsensivity: 10\njump_width: 100000\nthreshold: 50\n");
    let detector = Senseless::new(&clock, &config);

    let fired_at = Rc::new(RefCell::new(Vec::new()));
    let f = fired_at.clone();
    let clock2 = clock.clone();
    let timer = CycleTimer::new(&clock, move || f.borrow_mut().push(clock2.now()));
    timer.modify(700);

    // A guest hammering a status register. Every jump must stop at the
    // timer expiry, and dispatch happens before time moves past it.
    for _ in 0..64 {
        detector.report(100);
        if clock.timers_due() {
            clock.run_due();
        }
    }
    assert!(clock.now() >= 700);
    assert_eq!(fired_at.borrow().as_slice(), &[700]);
}

#[test]
fn test_signal_trace_arming_timer() {
    // Interrupt-style wiring: a device drives its irq node, a trace models
    // the interrupt controller latching it after a delay.
    let clock = CycleClock::new(1_000_000);
    let net = SignalNet::new();
    let irq = net.node("dm9000.irq");
    let latched = Rc::new(RefCell::new(false));

    let l = latched.clone();
    let timer = Rc::new(CycleTimer::new(&clock, move || *l.borrow_mut() = true));
    let t = timer.clone();
    let _trace = irq.trace(move |level| {
        if level == SigLevel::Low {
            // Active-low line asserted.
            t.modify(10);
        }
    });

    irq.set(SigLevel::Low);
    assert!(timer.is_active());
    clock.advance(10);
    clock.run_due();
    assert!(*latched.borrow());
}
