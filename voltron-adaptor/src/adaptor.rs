// The debugger adaptor interface
//
// One implementation exists per debugger host. Every method is callable
// from any thread; implementations serialise access to the host through
// their own lock and must never hold it across calls into the broker.
//
// Target validation (`validate_target` / `validate_busy`) runs before the
// host lock is taken so that bad requests fail early.

use crate::arch::Arch;
use crate::deref::DerefLimits;
use crate::disasm::{self, MAX_INSN_LEN};
use crate::error::{AdaptorError, AdaptorResult};
use crate::notify::StateNotifier;
use crate::types::*;

pub trait Adaptor: Send + Sync {
    /// Registry name of the host ("lldb", "gdb", "mock", ...)
    fn host(&self) -> &'static str;

    /// Host version string, e.g. "lldb-310.2.37"
    fn version(&self) -> AdaptorResult<String>;

    fn target(&self, target_id: TargetId) -> AdaptorResult<Target>;

    fn targets(&self) -> AdaptorResult<Vec<Target>>;

    fn state(&self, target_id: TargetId) -> AdaptorResult<TargetState>;

    /// Read registers. `names` may use the "pc"/"sp" aliases; an empty list
    /// returns the whole register bank. Unreadable registers are `n/a`.
    fn registers(
        &self,
        target_id: TargetId,
        thread_id: Option<ThreadId>,
        names: &[String],
    ) -> AdaptorResult<RegisterSet>;

    /// Read exactly `length` bytes or fail with `FailedRead`
    fn memory(&self, address: u64, length: u64, target_id: TargetId) -> AdaptorResult<Vec<u8>>;

    fn write_memory(&self, _address: u64, _data: &[u8], _target_id: TargetId) -> AdaptorResult<()> {
        Err(AdaptorError::Unsupported("write_memory"))
    }

    fn dereference(&self, pointer: u64, target_id: TargetId) -> AdaptorResult<DerefChain>;

    /// Run a host-native command and return its textual output
    fn command(&self, command: &str) -> AdaptorResult<String>;

    fn breakpoints(&self, target_id: TargetId) -> AdaptorResult<Vec<Breakpoint>>;

    fn backtrace(&self, target_id: TargetId, thread_id: Option<ThreadId>) -> AdaptorResult<Vec<Frame>>;

    fn source_location(
        &self,
        _target_id: TargetId,
        _address: Option<u64>,
    ) -> AdaptorResult<Option<SourceLocation>> {
        Err(AdaptorError::Unsupported("source_location"))
    }

    fn capabilities(&self) -> Vec<Capability> {
        Vec::new()
    }

    /// "intel" or "att"
    fn disassembly_flavor(&self) -> AdaptorResult<String> {
        Err(AdaptorError::Unsupported("disassembly_flavor"))
    }

    /// Listeners waiting for the host's next state change
    fn notifier(&self) -> &StateNotifier;

    fn deref_limits(&self) -> DerefLimits {
        DerefLimits::default()
    }

    fn validate_target(&self, target_id: TargetId) -> AdaptorResult<()> {
        match self.target(target_id) {
            Ok(t) if t.state != TargetState::Invalid => Ok(()),
            _ => Err(AdaptorError::NoSuchTarget(target_id)),
        }
    }

    fn validate_busy(&self, target_id: TargetId) -> AdaptorResult<()> {
        let target = self
            .target(target_id)
            .map_err(|_| AdaptorError::NoSuchTarget(target_id))?;
        if target.state == TargetState::Running {
            return Err(AdaptorError::TargetBusy(target_id));
        }
        Ok(())
    }

    fn arch(&self, target_id: TargetId) -> AdaptorResult<Arch> {
        self.target(target_id)?.arch.parse()
    }

    /// `(register name, value)` of the stack pointer
    fn stack_pointer(&self, target_id: TargetId, thread_id: Option<ThreadId>) -> AdaptorResult<(String, u64)> {
        let name = self.arch(target_id)?.sp_name();
        named_register(self, target_id, thread_id, name)
    }

    /// `(register name, value)` of the program counter
    fn program_counter(&self, target_id: TargetId, thread_id: Option<ThreadId>) -> AdaptorResult<(String, u64)> {
        let name = self.arch(target_id)?.pc_name();
        named_register(self, target_id, thread_id, name)
    }

    /// `length` bytes starting at the stack pointer
    fn stack(&self, length: u64, target_id: TargetId, thread_id: Option<ThreadId>) -> AdaptorResult<Vec<u8>> {
        let (_, sp) = self.stack_pointer(target_id, thread_id)?;
        self.memory(sp, length, target_id)
    }

    /// Disassemble `count` instructions at `address` (default: pc).
    ///
    /// The default implementation decodes with capstone; hosts with a native
    /// disassembler override it.
    fn disassemble(&self, target_id: TargetId, address: Option<u64>, count: u32) -> AdaptorResult<String> {
        let target = self.target(target_id)?;
        let arch: Arch = target.arch.parse()?;
        let address = match address {
            Some(a) => a,
            None => self.program_counter(target_id, None)?.1,
        };

        let code = read_code(self, address, count as u64 * MAX_INSN_LEN, target_id)?;
        disasm::disassemble(arch, target.byte_order, &code, address, count as usize)
    }
}

fn named_register<A: Adaptor + ?Sized>(
    adaptor: &A,
    target_id: TargetId,
    thread_id: Option<ThreadId>,
    name: &str,
) -> AdaptorResult<(String, u64)> {
    let regs = adaptor.registers(target_id, thread_id, &[name.to_string()])?;
    let value = regs
        .get(name)
        .and_then(RegisterValue::as_u64)
        .ok_or_else(|| AdaptorError::host(format!("Register {} is not readable", name)))?;
    Ok((name.to_string(), value))
}

/// Read up to `length` bytes of code, shrinking the read when it runs past
/// the end of a mapping.
fn read_code<A: Adaptor + ?Sized>(
    adaptor: &A,
    address: u64,
    length: u64,
    target_id: TargetId,
) -> AdaptorResult<Vec<u8>> {
    let mut len = length;
    loop {
        match adaptor.memory(address, len, target_id) {
            Ok(code) => return Ok(code),
            Err(AdaptorError::FailedRead { .. }) if len > 1 => len /= 2,
            Err(e) => return Err(e),
        }
    }
}
