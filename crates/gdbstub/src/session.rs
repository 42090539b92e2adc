// Veriboard - Embedded Board Emulation Platform
// Copyright (C) 2026 The Veriboard Authors
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

//! Per-connection protocol state machine.

use std::cell::RefCell;
use std::rc::Rc;
use veriboard_core::debug::{ContOutcome, DebugBackend, StopOutcome, TargetStat};

const CMDBUF_SIZE: usize = 512;
const MAX_REGS: u32 = 40;
const MAX_MEM_CHUNK: u64 = 256;
/// Signal the interrupt byte reports (SIGINT).
const SIG_INT: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CmdState {
    WaitStart,
    WaitData,
    WaitCsum1,
    WaitCsum2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Active,
    /// The session asked to end (detach or fatal frame error); the owner
    /// tears it down and closes the stream.
    Ended,
}

struct BreakPoint {
    addr: u64,
    len: usize,
    backup: [u8; 8],
}

/// One GDB connection: receive state machine, command interpreter and the
/// session's software-breakpoint list. Output leaves through the injected
/// sink so the machine runs the same against a socket or a test buffer.
pub struct GdbSession {
    backend: Rc<RefCell<dyn DebugBackend>>,
    output: Box<dyn FnMut(&[u8])>,
    state: CmdState,
    cmdbuf: Vec<u8>,
    overflowed: bool,
    csum: u8,
    /// Pending delayed stop signal; delivered by the next status poll or
    /// asynchronous notification.
    last_sig: Option<u8>,
    breakpoints: Vec<BreakPoint>,
}

impl GdbSession {
    pub fn new(
        backend: Rc<RefCell<dyn DebugBackend>>,
        output: impl FnMut(&[u8]) + 'static,
    ) -> Self {
        Self {
            backend,
            output: Box::new(output),
            state: CmdState::WaitStart,
            cmdbuf: Vec::with_capacity(CMDBUF_SIZE),
            overflowed: false,
            csum: 0,
            last_sig: None,
            breakpoints: Vec::new(),
        }
    }

    /// Feed inbound bytes; the data sink for the stream's read callback.
    pub fn feed(&mut self, data: &[u8]) -> SessionStatus {
        for &byte in data {
            if self.feed_byte(byte) == SessionStatus::Ended {
                return SessionStatus::Ended;
            }
        }
        SessionStatus::Active
    }

    /// Deliver an asynchronous target-stop event to the debugger.
    pub fn notify(&mut self, sig: u8) {
        let sig = self.last_sig.take().unwrap_or(sig);
        self.reply(&format!("T{sig:02x}thread:0;"));
    }

    /// Restore every remaining breakpoint and drop the list. Safe to call
    /// from within the session's own read path.
    pub fn teardown(&mut self) {
        let mut backend = self.backend.borrow_mut();
        for bkpt in self.breakpoints.drain(..) {
            if backend.set_mem(&bkpt.backup[..bkpt.len], bkpt.addr).is_none() {
                break;
            }
        }
    }

    fn feed_byte(&mut self, byte: u8) -> SessionStatus {
        match self.state {
            CmdState::WaitStart => match byte {
                b'$' => {
                    self.cmdbuf.clear();
                    self.overflowed = false;
                    self.csum = 0;
                    self.state = CmdState::WaitData;
                }
                b'+' => {}
                b'-' => tracing::debug!("got NACK from gdb"),
                0x03 => self.interrupt(),
                other => {
                    tracing::debug!("unexpected byte {other:#04x} outside packet");
                }
            },
            CmdState::WaitData => {
                if byte == b'#' {
                    self.state = CmdState::WaitCsum1;
                } else if self.cmdbuf.len() >= CMDBUF_SIZE {
                    if !self.overflowed {
                        tracing::warn!("message from gdb too long, ignoring");
                        self.overflowed = true;
                    }
                } else {
                    self.cmdbuf.push(byte);
                    self.csum = self.csum.wrapping_add(byte);
                }
            }
            CmdState::WaitCsum1 => match hex_nibble(byte) {
                Some(nibble) => {
                    self.csum ^= nibble << 4;
                    self.state = CmdState::WaitCsum2;
                }
                None => {
                    tracing::warn!("illegal byte {byte:#04x} in checksum");
                    self.state = CmdState::WaitStart;
                }
            },
            CmdState::WaitCsum2 => {
                self.state = CmdState::WaitStart;
                match hex_nibble(byte) {
                    Some(nibble) => {
                        self.csum ^= nibble;
                        if self.csum == 0 && !self.overflowed {
                            self.send(b"+");
                            return self.execute_cmd();
                        }
                        tracing::warn!("checksum error in gdb packet");
                        self.send(b"-");
                    }
                    None => tracing::warn!("illegal byte {byte:#04x} in checksum"),
                }
            }
        }
        SessionStatus::Active
    }

    /// A lone 0x03 between packets: interrupt the target.
    fn interrupt(&mut self) {
        let outcome = self.backend.borrow_mut().stop();
        match outcome {
            None => self.reply("S00"),
            Some(StopOutcome::Stopped(_)) => self.reply(&format!("T{SIG_INT:02x}thread:0;")),
            Some(StopOutcome::Deferred) => self.last_sig = Some(SIG_INT),
        }
    }

    fn execute_cmd(&mut self) -> SessionStatus {
        let cmd = std::mem::take(&mut self.cmdbuf);
        let status = self.dispatch(&cmd);
        self.cmdbuf = cmd;
        status
    }

    fn dispatch(&mut self, cmd: &[u8]) -> SessionStatus {
        let text = String::from_utf8_lossy(cmd).into_owned();
        match cmd.first() {
            Some(b'?') => self.get_status(),
            Some(b's') => {
                match parse_hex_u64(&text[1..]) {
                    Some(addr) => self.step(addr as u32, true),
                    None => self.step(0, false),
                }
            }
            Some(b'c') => self.cont(),
            Some(b'D') => {
                self.cont();
                return SessionStatus::Ended;
            }
            Some(b'p') => match parse_hex_u64(&text[1..]) {
                Some(index) => self.get_reg(index as u32),
                None => self.reply("E00"),
            },
            Some(b'P') => self.set_reg(&text[1..]),
            Some(b'g') => self.get_regs(),
            Some(b'G') => self.reply("OK"),
            Some(b'm') => match parse_addr_len(&text[1..]) {
                Some((addr, len)) => self.get_mem(addr, len),
                None => self.reply("E00"),
            },
            Some(b'M') => self.set_mem(&text[1..]),
            Some(b'Z') => self.add_breakpoint(&text),
            Some(b'z') => self.remove_breakpoint(&text),
            _ => self.long_cmd(&text),
        }
        SessionStatus::Active
    }

    /// Commands longer than one character, including the non-stop queries.
    fn long_cmd(&mut self, cmd: &str) {
        if cmd.starts_with("qSupported") {
            self.reply("QNonStop+");
        } else if cmd.starts_with("QNonStop:") {
            self.reply("OK");
        } else if cmd.starts_with("vStopped") {
            self.reply("OK");
        } else if cmd.starts_with("qC") {
            self.reply("QC0");
        } else if cmd.starts_with("qfThreadInfo") {
            self.reply("m0");
        } else if cmd.starts_with("qsThreadInfo") {
            self.reply("l");
        } else if cmd.starts_with("vCont?") {
            self.reply("vCont;c;s;t");
        } else if cmd.starts_with("vCont") {
            self.vcont(&cmd[5..]);
        } else if cmd.starts_with("qAttached") {
            self.reply("1");
        } else if cmd.starts_with("qTStatus") {
            self.reply("T0");
        } else {
            tracing::debug!("unknown gdb command '{}'", cmd);
            self.reply("");
        }
    }

    fn vcont(&mut self, actions: &str) {
        for action in actions.split(';').filter(|a| !a.is_empty()) {
            match action.as_bytes()[0] {
                b'c' => self.cont(),
                b's' => self.step(0, false),
                b't' => self.interrupt(),
                other => {
                    tracing::warn!("unexpected char {:#04x} in vCont", other);
                }
            }
        }
    }

    fn get_status(&mut self) {
        let status = self.backend.borrow_mut().get_status();
        match status {
            None => self.reply("T00thread:0;"),
            Some(TargetStat::Signal(sig)) => {
                let sig = self.last_sig.take().unwrap_or(sig);
                self.reply(&format!("T{sig:02x}thread:0;"));
            }
            Some(TargetStat::Running) => self.reply("OK"),
        }
    }

    fn step(&mut self, addr: u32, use_addr: bool) {
        let outcome = self.backend.borrow_mut().step(addr, use_addr);
        match outcome {
            None => self.reply("S00"),
            Some(StopOutcome::Stopped(sig)) => self.reply(&format!("T{sig:02x}thread:0;")),
            Some(StopOutcome::Deferred) => self.reply("OK"),
        }
    }

    /// Continue sends no reply until the target stops again.
    fn cont(&mut self) {
        let outcome = self.backend.borrow_mut().cont();
        match outcome {
            None | Some(ContOutcome::Running) => {}
            Some(ContOutcome::Stopped(sig)) => self.reply(&format!("T{sig:02x}thread:0;")),
        }
    }

    fn get_reg(&mut self, index: u32) {
        let mut value = [0u8; 32];
        let len = self.backend.borrow_mut().get_reg(&mut value, index);
        match len {
            None => self.reply("00000000"),
            Some(0) => {
                tracing::warn!("cannot get register R{}", index);
                self.reply("");
            }
            Some(n) => {
                let hex = hex_string(&value[..n]);
                self.reply(&hex);
            }
        }
    }

    fn get_regs(&mut self) {
        let supported = {
            let mut backend = self.backend.borrow_mut();
            let mut probe = [0u8; 32];
            backend.get_reg(&mut probe, 0).is_some()
        };
        if !supported {
            self.reply("00000000");
            return;
        }
        let mut hex = String::new();
        for index in 0..MAX_REGS {
            let mut value = [0u8; 32];
            let len = self.backend.borrow_mut().get_reg(&mut value, index);
            match len {
                Some(n) if n > 0 => hex.push_str(&hex_string(&value[..n])),
                _ => break,
            }
        }
        self.reply(&hex);
    }

    fn set_reg(&mut self, args: &str) {
        let Some((reg_str, val_str)) = args.split_once('=') else {
            self.reply("E00");
            return;
        };
        let Some(reg) = parse_hex_u64(reg_str) else {
            self.reply("E00");
            return;
        };
        let mut value = [0u8; 8];
        let count = hex_parse(val_str, &mut value);
        if count < 1 {
            self.reply("E00");
            return;
        }
        let result = self.backend.borrow_mut().set_reg(&value[..count], reg as u32);
        match result {
            Some(()) => self.reply("OK"),
            None => self.reply("E00"),
        }
    }

    fn get_mem(&mut self, mut addr: u64, len: u64) {
        let mut remaining = len.min(MAX_MEM_CHUNK);
        // A zero-length read only probes for support.
        let mut probe: [u8; 0] = [];
        let supported = self.backend.borrow_mut().get_mem(&mut probe, addr).is_some();
        if !supported {
            self.reply("00000000");
            return;
        }
        let mut hex = String::new();
        while remaining > 0 {
            let chunk = remaining.min(4) as usize;
            let mut buf = [0u8; 4];
            let got = self
                .backend
                .borrow_mut()
                .get_mem(&mut buf[..chunk], addr)
                .unwrap_or(0);
            if got == 0 {
                break;
            }
            hex.push_str(&hex_string(&buf[..got]));
            remaining -= got as u64;
            addr += got as u64;
            if got < chunk {
                break;
            }
        }
        self.reply(&hex);
    }

    fn set_mem(&mut self, args: &str) {
        let Some((spec, data)) = args.split_once(':') else {
            self.reply("E00");
            return;
        };
        let Some((addr, len)) = parse_addr_len(spec) else {
            self.reply("E00");
            return;
        };
        if data.len() < 2 * len as usize {
            self.reply("E00");
            return;
        }
        let mut addr = addr;
        let mut remaining = len as usize;
        let mut data = data;
        while remaining > 0 {
            let chunk = remaining.min(4);
            let mut value = [0u8; 4];
            if hex_parse(&data[..2 * chunk], &mut value[..chunk]) < chunk {
                tracing::warn!("setmem: bad hex near {addr:#010x}");
                self.reply("E00");
                return;
            }
            let result = self.backend.borrow_mut().set_mem(&value[..chunk], addr);
            match result {
                Some(n) if n == chunk => {}
                _ => {
                    self.reply("E00");
                    return;
                }
            }
            data = &data[2 * chunk..];
            addr += chunk as u64;
            remaining -= chunk;
        }
        self.reply("OK");
    }

    /// `Z<type>,<addr>,<len>`: only software breakpoints (type 0) are
    /// supported; anything else gets the empty not-supported reply.
    fn add_breakpoint(&mut self, cmd: &str) {
        let Some((ty, addr, len)) = parse_breakpoint(cmd) else {
            tracing::warn!("gdb breakpoint parse error: \"{}\"", cmd);
            self.reply("E00");
            return;
        };
        if len > 8 {
            tracing::warn!("breakpoint instruction too long ({len})");
            self.reply("E00");
            return;
        }
        if ty != 0 {
            tracing::warn!("breakpoint type {ty} not supported");
            self.reply("");
            return;
        }
        if self
            .breakpoints
            .iter()
            .any(|b| b.addr == addr && b.len == len)
        {
            tracing::warn!("breakpoint already exists at {addr:#010x}");
            self.reply("E00");
            return;
        }
        let mut bkpt_ins = [0u8; 8];
        let mut backup = [0u8; 8];
        let ok = {
            let mut backend = self.backend.borrow_mut();
            backend.get_bkpt_ins(&mut bkpt_ins[..len], addr).is_some()
                && backend.get_mem(&mut backup[..len], addr) == Some(len)
                && backend.set_mem(&bkpt_ins[..len], addr) == Some(len)
        };
        if !ok {
            tracing::warn!("debug backend does not support breakpoints");
            self.reply("");
            return;
        }
        self.breakpoints.push(BreakPoint { addr, len, backup });
        self.reply("OK");
    }

    fn remove_breakpoint(&mut self, cmd: &str) {
        let Some((ty, addr, len)) = parse_breakpoint(cmd) else {
            tracing::warn!("gdb breakpoint parse error: \"{}\"", cmd);
            self.reply("E00");
            return;
        };
        if ty != 0 {
            tracing::warn!("breakpoint type {ty} not supported");
            self.reply("");
            return;
        }
        let Some(pos) = self
            .breakpoints
            .iter()
            .position(|b| b.addr == addr && b.len == len)
        else {
            tracing::warn!("removing nonexistent breakpoint at {addr:#010x}");
            self.reply("E00");
            return;
        };
        let bkpt = self.breakpoints.remove(pos);
        let restored = self
            .backend
            .borrow_mut()
            .set_mem(&bkpt.backup[..bkpt.len], bkpt.addr)
            == Some(bkpt.len);
        if restored {
            self.reply("OK");
        } else {
            self.reply("E00");
        }
    }

    /// Frame a reply: `$payload#checksum`.
    fn reply(&mut self, payload: &str) {
        let csum = payload
            .bytes()
            .fold(0u8, |acc, b| acc.wrapping_add(b));
        let framed = format!("${payload}#{csum:02x}");
        self.send(framed.as_bytes());
    }

    fn send(&mut self, bytes: &[u8]) {
        (self.output)(bytes);
    }

    #[cfg(test)]
    pub(crate) fn breakpoint_count(&self) -> usize {
        self.breakpoints.len()
    }
}

fn hex_nibble(byte: u8) -> Option<u8> {
    match byte {
        b'0'..=b'9' => Some(byte - b'0'),
        b'a'..=b'f' => Some(byte - b'a' + 10),
        b'A'..=b'F' => Some(byte - b'A' + 10),
        _ => None,
    }
}

/// Parse leading hex digits; `None` when there are none.
fn parse_hex_u64(text: &str) -> Option<u64> {
    let digits: String = text
        .chars()
        .take_while(|c| c.is_ascii_hexdigit())
        .collect();
    if digits.is_empty() {
        return None;
    }
    u64::from_str_radix(&digits, 16).ok()
}

/// `<addr>,<len>` with both in hex.
fn parse_addr_len(text: &str) -> Option<(u64, u64)> {
    let (addr, len) = text.split_once(',')?;
    Some((parse_hex_u64(addr)?, parse_hex_u64(len)?))
}

/// `Z0,addr,len` / `z0,addr,len`.
fn parse_breakpoint(cmd: &str) -> Option<(u32, u64, usize)> {
    let mut parts = cmd[1..].split(',');
    let ty = parse_hex_u64(parts.next()?)? as u32;
    let addr = parse_hex_u64(parts.next()?)?;
    let len = parse_hex_u64(parts.next()?)? as usize;
    Some((ty, addr, len))
}

/// Decode pairs of hex digits into `out`; returns the number of bytes
/// decoded, stopping at the first non-hex character.
fn hex_parse(text: &str, out: &mut [u8]) -> usize {
    let bytes = text.as_bytes();
    let mut count = 0;
    while count < out.len() {
        let Some(hi) = bytes.get(2 * count).copied().and_then(hex_nibble) else {
            break;
        };
        let Some(lo) = bytes.get(2 * count + 1).copied().and_then(hex_nibble) else {
            break;
        };
        out[count] = (hi << 4) | lo;
        count += 1;
    }
    count
}

fn hex_string(bytes: &[u8]) -> String {
    use std::fmt::Write as _;
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(s, "{b:02x}");
    }
    s
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Scriptable backend over a flat memory array and a small register
    /// file; records control calls.
    pub struct MockBackend {
        pub mem: Vec<u8>,
        pub regs: Vec<u32>,
        pub stops: u32,
        pub conts: u32,
        pub steps: u32,
        pub defer_stop: bool,
    }

    impl MockBackend {
        pub fn new() -> Self {
            Self {
                mem: vec![0u8; 0x10000],
                regs: vec![0u32; 17],
                stops: 0,
                conts: 0,
                steps: 0,
                defer_stop: false,
            }
        }
    }

    impl DebugBackend for MockBackend {
        fn get_bkpt_ins(&mut self, dst: &mut [u8], _addr: u64) -> Option<()> {
            // ARM-style BKPT placeholder bytes.
            for (i, b) in dst.iter_mut().enumerate() {
                *b = [0xbe, 0x00, 0xbe, 0x00][i % 4];
            }
            Some(())
        }

        fn get_mem(&mut self, dst: &mut [u8], addr: u64) -> Option<usize> {
            let addr = addr as usize;
            if addr >= self.mem.len() {
                return Some(0);
            }
            let n = dst.len().min(self.mem.len() - addr);
            dst[..n].copy_from_slice(&self.mem[addr..addr + n]);
            Some(n)
        }

        fn set_mem(&mut self, src: &[u8], addr: u64) -> Option<usize> {
            let addr = addr as usize;
            if addr >= self.mem.len() {
                return Some(0);
            }
            let n = src.len().min(self.mem.len() - addr);
            self.mem[addr..addr + n].copy_from_slice(&src[..n]);
            Some(n)
        }

        fn get_reg(&mut self, dst: &mut [u8], index: u32) -> Option<usize> {
            match self.regs.get(index as usize) {
                Some(value) => {
                    dst[..4].copy_from_slice(&value.to_le_bytes());
                    Some(4)
                }
                None => Some(0),
            }
        }

        fn set_reg(&mut self, src: &[u8], index: u32) -> Option<()> {
            let mut bytes = [0u8; 4];
            bytes[..src.len().min(4)].copy_from_slice(&src[..src.len().min(4)]);
            if let Some(slot) = self.regs.get_mut(index as usize) {
                *slot = u32::from_le_bytes(bytes);
            }
            Some(())
        }

        fn stop(&mut self) -> Option<StopOutcome> {
            self.stops += 1;
            if self.defer_stop {
                Some(StopOutcome::Deferred)
            } else {
                Some(StopOutcome::Stopped(SIG_INT))
            }
        }

        fn cont(&mut self) -> Option<ContOutcome> {
            self.conts += 1;
            Some(ContOutcome::Running)
        }

        fn step(&mut self, _addr: u32, _use_addr: bool) -> Option<StopOutcome> {
            self.steps += 1;
            Some(StopOutcome::Stopped(5))
        }

        fn get_status(&mut self) -> Option<TargetStat> {
            Some(TargetStat::Signal(5))
        }
    }

    pub fn packet(payload: &str) -> Vec<u8> {
        let csum = payload.bytes().fold(0u8, |acc, b| acc.wrapping_add(b));
        format!("${payload}#{csum:02x}").into_bytes()
    }

    pub struct Harness {
        pub session: GdbSession,
        pub backend: Rc<RefCell<MockBackend>>,
        pub out: Rc<RefCell<Vec<u8>>>,
    }

    impl Harness {
        pub fn new() -> Self {
            let backend = Rc::new(RefCell::new(MockBackend::new()));
            let out: Rc<RefCell<Vec<u8>>> = Rc::new(RefCell::new(Vec::new()));
            let sink = out.clone();
            let session = GdbSession::new(backend.clone(), move |bytes| {
                sink.borrow_mut().extend_from_slice(bytes)
            });
            Self {
                session,
                backend,
                out,
            }
        }

        pub fn send(&mut self, payload: &str) -> SessionStatus {
            self.session.feed(&packet(payload))
        }

        pub fn take_output(&mut self) -> String {
            String::from_utf8(std::mem::take(&mut *self.out.borrow_mut())).unwrap()
        }
    }

    #[test]
    fn test_read_memory() {
        let mut h = Harness::new();
        h.backend.borrow_mut().mem[0x1000..0x1004].copy_from_slice(&[0xde, 0xad, 0xbe, 0xef]);
        h.send("m1000,4");
        assert_eq!(h.take_output(), format!("+{}", String::from_utf8(packet("deadbeef")).unwrap()));
    }

    #[test]
    fn test_write_memory() {
        let mut h = Harness::new();
        h.send("M1000,4:deadbeef");
        assert!(h.take_output().contains("$OK#"));
        assert_eq!(&h.backend.borrow().mem[0x1000..0x1004], &[0xde, 0xad, 0xbe, 0xef]);
    }

    #[test]
    fn test_bad_checksum_naks() {
        let mut h = Harness::new();
        h.session.feed(b"$m1000,4#00");
        assert_eq!(h.take_output(), "-");
    }

    #[test]
    fn test_unknown_command_empty_reply() {
        let mut h = Harness::new();
        h.send("qFancyFeature");
        assert_eq!(h.take_output(), "+$#00");
    }

    #[test]
    fn test_interrupt_byte_stops_target() {
        let mut h = Harness::new();
        h.session.feed(&[0x03]);
        assert_eq!(h.backend.borrow().stops, 1);
        assert!(h.take_output().contains("$T02thread:0;#"));
    }

    #[test]
    fn test_deferred_stop_replies_on_notify() {
        let mut h = Harness::new();
        h.backend.borrow_mut().defer_stop = true;
        h.session.feed(&[0x03]);
        assert_eq!(h.take_output(), "");
        h.session.notify(5);
        // The delayed interrupt signal wins over the notified one.
        assert!(h.take_output().contains("$T02thread:0;#"));
        h.session.notify(5);
        assert!(h.take_output().contains("$T05thread:0;#"));
    }

    #[test]
    fn test_register_round_trip() {
        let mut h = Harness::new();
        h.send("P3=78563412");
        assert!(h.take_output().contains("$OK#"));
        assert_eq!(h.backend.borrow().regs[3], 0x12345678);
        h.send("p3");
        assert!(h.take_output().contains("$78563412#"));
    }

    #[test]
    fn test_get_all_registers() {
        let mut h = Harness::new();
        h.backend.borrow_mut().regs[0] = 0x11111111;
        h.send("g");
        let out = h.take_output();
        // 17 registers, 8 hex chars each.
        let payload = out.trim_start_matches('+');
        assert!(payload.starts_with("$11111111"));
        assert_eq!(payload.len(), 1 + 17 * 8 + 3);
    }

    #[test]
    fn test_breakpoint_insert_hit_remove() {
        let mut h = Harness::new();
        h.backend.borrow_mut().mem[0x2000..0x2002].copy_from_slice(&[0x12, 0x34]);

        h.send("Z0,2000,2");
        assert!(h.take_output().contains("$OK#"));
        assert_eq!(h.session.breakpoint_count(), 1);
        // The break instruction is armed in memory.
        assert_eq!(&h.backend.borrow().mem[0x2000..0x2002], &[0xbe, 0x00]);

        h.send("c");
        assert_eq!(h.backend.borrow().conts, 1);
        assert_eq!(h.take_output(), "+", "continue has no immediate reply");
        // Target hits the breakpoint; the owner pushes the notification.
        h.session.notify(5);
        assert!(h.take_output().contains("$T05thread:0;#"));

        h.send("z0,2000,2");
        assert!(h.take_output().contains("$OK#"));
        assert_eq!(&h.backend.borrow().mem[0x2000..0x2002], &[0x12, 0x34]);
        assert_eq!(h.session.breakpoint_count(), 0);
    }

    #[test]
    fn test_duplicate_breakpoint_rejected() {
        let mut h = Harness::new();
        h.send("Z0,2000,2");
        h.take_output();
        h.send("Z0,2000,2");
        assert!(h.take_output().contains("$E00#"));
    }

    #[test]
    fn test_hardware_breakpoint_unsupported() {
        let mut h = Harness::new();
        h.send("Z1,2000,2");
        assert_eq!(h.take_output(), "+$#00");
    }

    #[test]
    fn test_teardown_restores_breakpoints() {
        let mut h = Harness::new();
        h.backend.borrow_mut().mem[0x2000..0x2002].copy_from_slice(&[0x12, 0x34]);
        h.send("Z0,2000,2");
        h.take_output();
        h.session.teardown();
        assert_eq!(&h.backend.borrow().mem[0x2000..0x2002], &[0x12, 0x34]);
    }

    #[test]
    fn test_detach_ends_session() {
        let mut h = Harness::new();
        let status = h.send("D");
        assert_eq!(status, SessionStatus::Ended);
        assert_eq!(h.backend.borrow().conts, 1);
    }

    #[test]
    fn test_nonstop_queries() {
        let mut h = Harness::new();
        h.send("qSupported:multiprocess+;xmlRegisters=arm");
        assert!(h.take_output().contains("$QNonStop+#"));
        h.send("QNonStop:1");
        assert!(h.take_output().contains("$OK#"));
        h.send("qC");
        assert!(h.take_output().contains("$QC0#"));
        h.send("qfThreadInfo");
        assert!(h.take_output().contains("$m0#"));
        h.send("qsThreadInfo");
        assert!(h.take_output().contains("$l#"));
        h.send("vCont?");
        assert!(h.take_output().contains("$vCont;c;s;t#"));
        h.send("qAttached");
        assert!(h.take_output().contains("$1#"));
        h.send("qTStatus");
        assert!(h.take_output().contains("$T0#"));
    }

    #[test]
    fn test_vcont_actions() {
        let mut h = Harness::new();
        h.send("vCont;s");
        assert_eq!(h.backend.borrow().steps, 1);
        assert!(h.take_output().contains("$T05thread:0;#"));
        h.send("vCont;c");
        assert_eq!(h.backend.borrow().conts, 1);
    }

    #[test]
    fn test_step_with_address() {
        let mut h = Harness::new();
        h.send("s2000");
        assert_eq!(h.backend.borrow().steps, 1);
        assert!(h.take_output().contains("$T05thread:0;#"));
    }

    #[test]
    fn test_status_query() {
        let mut h = Harness::new();
        h.send("?");
        assert!(h.take_output().contains("$T05thread:0;#"));
    }

    #[test]
    fn test_mem_read_clamped() {
        let mut h = Harness::new();
        h.send("m1000,1000");
        let out = h.take_output();
        // 256-byte clamp: 512 hex chars of payload.
        let payload_len = out.len() - "+$".len() - "#xx".len();
        assert_eq!(payload_len, 512);
    }

    #[test]
    fn test_split_packet_delivery() {
        // Packets arriving one byte at a time reassemble correctly.
        let mut h = Harness::new();
        let bytes = packet("m1000,2");
        for b in bytes {
            h.session.feed(&[b]);
        }
        let out = h.take_output();
        assert!(out.starts_with('+'));
        assert!(out.contains("$0000#"));
    }
}
