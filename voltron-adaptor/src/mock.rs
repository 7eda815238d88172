// Mock debugger host
//
// An in-memory stand-in for a stopped x86_64 process: sparse memory map,
// register bank, symbol table, breakpoints, frames and a line table, plus a
// tiny command interpreter. It has no native disassembler, so disassembly
// goes through the capstone fallback.
//
// The `set_*`/`map_*` methods play the part of the debugger itself: tests use
// them to move the simulated process between states.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tracing::debug;

use crate::adaptor::Adaptor;
use crate::arch::Arch;
use crate::deref::{self, DerefLimits, MemorySource};
use crate::error::{AdaptorError, AdaptorResult};
use crate::notify::StateNotifier;
use crate::reader::encode_word;
use crate::types::*;

pub const MOCK_HOST: &str = "mock";

#[derive(Debug, Clone)]
struct Symbol {
    name: String,
    start: u64,
    size: u64,
}

#[derive(Debug, Clone)]
struct LineEntry {
    start: u64,
    end: u64,
    file: String,
    line: u32,
}

/// State of the simulated debuggee
#[derive(Debug, Clone)]
pub struct MockProcess {
    version: String,
    file: String,
    arch: String,
    byte_order: ByteOrder,
    addr_size: u8,
    state: TargetState,
    regions: BTreeMap<u64, Vec<u8>>,
    registers: Vec<(String, RegisterValue)>,
    symbols: Vec<Symbol>,
    breakpoints: Vec<Breakpoint>,
    frames: Vec<Frame>,
    lines: Vec<LineEntry>,
    threads: Vec<ThreadId>,
    selected_thread: ThreadId,
}

pub const DEMO_CODE_BASE: u64 = 0x1_0000_0000;
pub const DEMO_MAIN: u64 = 0x1_0000_0cf0;
pub const DEMO_DATA_BASE: u64 = 0x1_0000_2000;
pub const DEMO_STACK_BASE: u64 = 0x7ffe_efbf_e000;
pub const DEMO_SP: u64 = 0x7ffe_efbf_f8b8;

impl MockProcess {
    /// An empty stopped process with no memory, registers or symbols
    pub fn new(arch: &str, addr_size: u8, byte_order: ByteOrder) -> Self {
        Self {
            version: "mock-1.0".to_string(),
            file: "/tmp/inferior".to_string(),
            arch: arch.to_string(),
            byte_order,
            addr_size,
            state: TargetState::Stopped,
            regions: BTreeMap::new(),
            registers: Vec::new(),
            symbols: Vec::new(),
            breakpoints: Vec::new(),
            frames: Vec::new(),
            lines: Vec::new(),
            threads: vec![1],
            selected_thread: 1,
        }
    }

    /// A small x86_64 program stopped at the top of `main`
    pub fn demo() -> Self {
        let mut p = Self::new("x86_64", 8, ByteOrder::Little);

        // code: nops with a real prologue at main
        p.map(DEMO_CODE_BASE, vec![0x90; 0x1000]);
        let main_code = [
            0x55, // push rbp
            0x48, 0x89, 0xe5, // mov rbp, rsp
            0x48, 0x83, 0xec, 0x40, // sub rsp, 0x40
            0xc7, 0x45, 0xfc, 0x00, 0x00, 0x00, 0x00, // mov dword ptr [rbp - 4], 0
            0x89, 0x7d, 0xf8, // mov dword ptr [rbp - 8], edi
            0x48, 0x89, 0x75, 0xf0, // mov qword ptr [rbp - 0x10], rsi
            0x31, 0xc0, // xor eax, eax
            0xc9, // leave
            0xc3, // ret
        ];
        p.write_unchecked(DEMO_MAIN, &main_code);
        p.add_symbol("start", DEMO_CODE_BASE + 0xc00, 0xf0);
        p.add_symbol("main", DEMO_MAIN, 0x90);

        // data: an ASCII string and a UTF-16 one
        p.map(DEMO_DATA_BASE, vec![0; 0x100]);
        p.write_unchecked(DEMO_DATA_BASE, b"Hello, voltron!\0");
        p.write_unchecked(DEMO_DATA_BASE + 0x40, b"w\0i\0d\0e\0 \0s\0t\0r\0\0\0");

        // stack: [sp] -> string, [sp+8] -> return into main, [sp+0x10] -> itself
        p.map(DEMO_STACK_BASE, vec![0; 0x2000]);
        let words = [DEMO_DATA_BASE, DEMO_MAIN + 0x30, DEMO_SP + 0x10, DEMO_DATA_BASE + 0x40];
        for (i, w) in words.iter().enumerate() {
            let bytes = encode_word(*w, 8, ByteOrder::Little);
            p.write_unchecked(DEMO_SP + i as u64 * 8, &bytes);
        }

        let gprs: [(&str, u64); 18] = [
            ("rax", DEMO_MAIN),
            ("rbx", 0),
            ("rcx", DEMO_SP + 0x38),
            ("rdx", DEMO_SP + 0x30),
            ("rsi", DEMO_SP + 0x20),
            ("rdi", 1),
            ("rbp", DEMO_SP + 0x10),
            ("rsp", DEMO_SP),
            ("r8", 0),
            ("r9", 0),
            ("r10", 0),
            ("r11", 0x246),
            ("r12", 0),
            ("r13", 0),
            ("r14", 0),
            ("r15", 0),
            ("rip", DEMO_MAIN),
            ("rflags", 0x246),
        ];
        for (name, value) in gprs {
            p.set_register(name, RegisterValue::from(value));
        }
        for seg in ["cs", "ss", "ds", "es", "fs", "gs"] {
            p.set_register(seg, RegisterValue::from(if seg == "cs" { 0x2b } else { 0 }));
        }
        for i in 0..16 {
            p.set_register(&format!("xmm{}", i), RegisterValue::Value(0));
        }
        for i in 0..8 {
            p.set_register(&format!("st{}", i), RegisterValue::NotAvailable);
        }

        p.breakpoints.push(Breakpoint {
            id: 1,
            enabled: true,
            one_shot: false,
            hit_count: 1,
            locations: vec![BreakpointLocation {
                address: DEMO_MAIN,
                name: "inferior`main".to_string(),
            }],
        });

        p.frames = vec![
            Frame::new(0, DEMO_MAIN, &p.file, "main", 0),
            Frame::new(1, DEMO_CODE_BASE + 0xc2a, &p.file, "start", 0x2a),
        ];

        p.lines = vec![
            LineEntry {
                start: DEMO_MAIN,
                end: DEMO_MAIN + 0x8,
                file: "inferior.c".to_string(),
                line: 8,
            },
            LineEntry {
                start: DEMO_MAIN + 0x8,
                end: DEMO_MAIN + 0x90,
                file: "inferior.c".to_string(),
                line: 9,
            },
        ];

        p
    }

    pub fn map(&mut self, start: u64, bytes: Vec<u8>) {
        self.regions.insert(start, bytes);
    }

    pub fn add_symbol(&mut self, name: &str, start: u64, size: u64) {
        self.symbols.push(Symbol {
            name: name.to_string(),
            start,
            size,
        });
    }

    pub fn set_register(&mut self, name: &str, value: RegisterValue) {
        match self.registers.iter_mut().find(|(n, _)| n == name) {
            Some((_, v)) => *v = value,
            None => self.registers.push((name.to_string(), value)),
        }
    }

    /// `(region start, offset in region, count)` pieces covering
    /// `[address, address + length)`, or `None` if any byte is unmapped
    fn covered(&self, address: u64, length: u64) -> Option<Vec<(u64, usize, usize)>> {
        let mut pieces = Vec::new();
        let mut cur = address;
        let end = address.checked_add(length)?;

        while cur < end {
            let (start, bytes) = self.regions.range(..=cur).next_back()?;
            let offset = (cur - start) as usize;
            if offset >= bytes.len() {
                return None;
            }
            let count = (bytes.len() - offset).min((end - cur) as usize);
            pieces.push((*start, offset, count));
            cur += count as u64;
        }
        Some(pieces)
    }

    fn read_bytes(&self, address: u64, length: u64) -> Option<Vec<u8>> {
        let pieces = self.covered(address, length)?;
        let mut out = Vec::with_capacity(length as usize);
        for (start, offset, count) in pieces {
            out.extend_from_slice(&self.regions[&start][offset..offset + count]);
        }
        Some(out)
    }

    fn write_bytes(&mut self, address: u64, data: &[u8]) -> bool {
        let pieces = match self.covered(address, data.len() as u64) {
            Some(p) => p,
            None => return false,
        };
        let mut consumed = 0;
        for (start, offset, count) in pieces {
            if let Some(region) = self.regions.get_mut(&start) {
                region[offset..offset + count].copy_from_slice(&data[consumed..consumed + count]);
            }
            consumed += count;
        }
        true
    }

    fn write_unchecked(&mut self, address: u64, data: &[u8]) {
        if !self.write_bytes(address, data) {
            debug!("Dropping write to unmapped address 0x{:x}", address);
        }
    }

    fn symbol_for(&self, address: u64) -> Option<&Symbol> {
        self.symbols
            .iter()
            .find(|s| address >= s.start && address < s.start + s.size)
    }

    fn target_info(&self, target_id: TargetId) -> AdaptorResult<Target> {
        if target_id != 0 {
            return Err(AdaptorError::NoSuchTarget(target_id));
        }
        Ok(Target {
            id: 0,
            file: self.file.clone(),
            arch: self.arch.clone(),
            state: self.state,
            byte_order: self.byte_order,
            addr_size: self.addr_size,
        })
    }

    fn check_thread(&self, thread_id: Option<ThreadId>) -> AdaptorResult<ThreadId> {
        let tid = thread_id.unwrap_or(self.selected_thread);
        if self.threads.contains(&tid) {
            Ok(tid)
        } else {
            Err(AdaptorError::NoSuchThread(tid))
        }
    }

    fn register_value(&self, name: &str) -> Option<RegisterValue> {
        self.registers
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| *v)
    }

    fn pc(&self) -> AdaptorResult<u64> {
        let arch: Arch = self.arch.parse()?;
        self.register_value(arch.pc_name())
            .and_then(|v| v.as_u64())
            .ok_or_else(|| AdaptorError::host("program counter is not readable"))
    }

    fn run_command(&mut self, command: &str) -> AdaptorResult<String> {
        let mut parts = command.split_whitespace();
        let verb = parts
            .next()
            .ok_or_else(|| AdaptorError::host("No command specified"))?;
        let rest: Vec<&str> = parts.collect();

        match verb {
            "version" => Ok(self.version.clone()),
            "echo" => Ok(rest.join(" ")),
            "print" | "p" => {
                let expr = rest
                    .first()
                    .ok_or_else(|| AdaptorError::host("print needs an expression"))?;
                let value = match expr.strip_prefix('$') {
                    Some(reg) => self
                        .register_value(reg)
                        .and_then(|v| v.as_u64())
                        .ok_or_else(|| AdaptorError::host(format!("Invalid register `{}'", reg)))?,
                    None => parse_address(expr)
                        .ok_or_else(|| AdaptorError::host(format!("No symbol \"{}\" in current context.", expr)))?,
                };
                Ok(format!("(unsigned long) $0 = {}", value))
            }
            "info" if rest.first() == Some(&"symbol") => {
                let addr = rest
                    .get(1)
                    .and_then(|a| parse_address(a))
                    .ok_or_else(|| AdaptorError::host("Argument required (address)."))?;
                Ok(match self.symbol_for(addr) {
                    Some(s) => format!("{} + {} in section .text", s.name, addr - s.start),
                    None => format!("No symbol matches 0x{:x}.", addr),
                })
            }
            "break" | "b" => {
                let spec = rest
                    .first()
                    .ok_or_else(|| AdaptorError::host("break needs a location"))?;
                let (address, name) = match self.symbols.iter().find(|s| s.name == *spec) {
                    Some(s) => (s.start, s.name.clone()),
                    None => {
                        let addr = parse_address(spec)
                            .ok_or_else(|| AdaptorError::host(format!("Function \"{}\" not defined.", spec)))?;
                        (addr, format!("0x{:x}", addr))
                    }
                };
                let id = self.breakpoints.iter().map(|b| b.id).max().unwrap_or(0) + 1;
                self.breakpoints.push(Breakpoint {
                    id,
                    enabled: true,
                    one_shot: false,
                    hit_count: 0,
                    locations: vec![BreakpointLocation { address, name }],
                });
                Ok(format!("Breakpoint {} at 0x{:x}", id, address))
            }
            other => Err(AdaptorError::host(format!("Undefined command: \"{}\"", other))),
        }
    }
}

fn parse_address(s: &str) -> Option<u64> {
    match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16).ok(),
        None => s.parse().ok(),
    }
}

impl MemorySource for MockProcess {
    fn addr_size(&self) -> u8 {
        self.addr_size
    }

    fn byte_order(&self) -> ByteOrder {
        self.byte_order
    }

    fn read(&self, address: u64, length: u64) -> Option<Vec<u8>> {
        self.read_bytes(address, length)
    }

    fn symbolicate(&self, address: u64) -> Option<String> {
        self.symbol_for(address)
            .map(|s| format!("{} + 0x{:X}", s.name, address - s.start))
    }
}

/// Adaptor over a [`MockProcess`]
#[derive(Debug)]
pub struct MockAdaptor {
    host: Mutex<MockProcess>,
    notifier: StateNotifier,
    capabilities: Vec<Capability>,
    limits: DerefLimits,
}

impl MockAdaptor {
    pub fn new(process: MockProcess) -> Self {
        Self {
            host: Mutex::new(process),
            notifier: StateNotifier::new(),
            capabilities: Vec::new(),
            limits: DerefLimits::default(),
        }
    }

    pub fn demo() -> Self {
        Self::new(MockProcess::demo())
    }

    pub fn with_capabilities(mut self, capabilities: Vec<Capability>) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn with_limits(mut self, limits: DerefLimits) -> Self {
        self.limits = limits;
        self
    }

    fn lock(&self) -> MutexGuard<'_, MockProcess> {
        self.host.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Simulate the debugger changing the target's state
    pub fn set_state(&self, state: TargetState) {
        self.lock().state = state;
    }

    pub fn set_version(&self, version: &str) {
        self.lock().version = version.to_string();
    }

    pub fn set_register(&self, name: &str, value: RegisterValue) {
        self.lock().set_register(name, value);
    }

    pub fn map(&self, start: u64, bytes: Vec<u8>) {
        self.lock().map(start, bytes);
    }

    pub fn add_symbol(&self, name: &str, start: u64, size: u64) {
        self.lock().add_symbol(name, start, size);
    }
}

impl Adaptor for MockAdaptor {
    fn host(&self) -> &'static str {
        MOCK_HOST
    }

    fn version(&self) -> AdaptorResult<String> {
        Ok(self.lock().version.clone())
    }

    fn target(&self, target_id: TargetId) -> AdaptorResult<Target> {
        self.lock().target_info(target_id)
    }

    fn targets(&self) -> AdaptorResult<Vec<Target>> {
        Ok(vec![self.lock().target_info(0)?])
    }

    fn state(&self, target_id: TargetId) -> AdaptorResult<TargetState> {
        self.validate_target(target_id)?;
        Ok(self.lock().state)
    }

    fn registers(
        &self,
        target_id: TargetId,
        thread_id: Option<ThreadId>,
        names: &[String],
    ) -> AdaptorResult<RegisterSet> {
        self.validate_target(target_id)?;
        self.validate_busy(target_id)?;

        let host = self.lock();
        host.check_thread(thread_id)?;
        let arch: Arch = host.arch.parse()?;
        let names = arch.normalize_registers(names);

        let regs = if names.is_empty() {
            host.registers.iter().cloned().collect()
        } else {
            names
                .into_iter()
                .map(|n| {
                    let value = host.register_value(&n).unwrap_or(RegisterValue::NotAvailable);
                    (n, value)
                })
                .collect()
        };
        Ok(regs)
    }

    fn memory(&self, address: u64, length: u64, target_id: TargetId) -> AdaptorResult<Vec<u8>> {
        self.validate_target(target_id)?;
        self.validate_busy(target_id)?;

        debug!("Reading 0x{:x} bytes of memory at 0x{:x}", length, address);
        self.lock()
            .read_bytes(address, length)
            .ok_or(AdaptorError::FailedRead { address, length })
    }

    fn write_memory(&self, address: u64, data: &[u8], target_id: TargetId) -> AdaptorResult<()> {
        self.validate_target(target_id)?;
        self.validate_busy(target_id)?;

        if self.lock().write_bytes(address, data) {
            Ok(())
        } else {
            Err(AdaptorError::FailedWrite {
                address,
                length: data.len() as u64,
            })
        }
    }

    fn dereference(&self, pointer: u64, target_id: TargetId) -> AdaptorResult<DerefChain> {
        self.validate_target(target_id)?;
        self.validate_busy(target_id)?;

        let host = self.lock();
        deref::dereference(&*host, pointer, self.limits)
    }

    fn command(&self, command: &str) -> AdaptorResult<String> {
        self.lock().run_command(command)
    }

    fn breakpoints(&self, target_id: TargetId) -> AdaptorResult<Vec<Breakpoint>> {
        self.validate_target(target_id)?;
        self.validate_busy(target_id)?;
        Ok(self.lock().breakpoints.clone())
    }

    fn backtrace(&self, target_id: TargetId, thread_id: Option<ThreadId>) -> AdaptorResult<Vec<Frame>> {
        self.validate_target(target_id)?;
        self.validate_busy(target_id)?;

        let host = self.lock();
        host.check_thread(thread_id)?;
        Ok(host.frames.clone())
    }

    fn source_location(
        &self,
        target_id: TargetId,
        address: Option<u64>,
    ) -> AdaptorResult<Option<SourceLocation>> {
        self.validate_target(target_id)?;
        self.validate_busy(target_id)?;

        let host = self.lock();
        let address = match address {
            Some(a) => a,
            None => host.pc()?,
        };
        Ok(host
            .lines
            .iter()
            .find(|l| address >= l.start && address < l.end)
            .map(|l| SourceLocation(l.file.clone(), l.line)))
    }

    fn capabilities(&self) -> Vec<Capability> {
        self.capabilities.clone()
    }

    fn disassembly_flavor(&self) -> AdaptorResult<String> {
        Ok("intel".to_string())
    }

    fn notifier(&self) -> &StateNotifier {
        &self.notifier
    }

    fn deref_limits(&self) -> DerefLimits {
        self.limits
    }
}
