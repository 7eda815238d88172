// Request handlers
//
// One handler per request kind. Handlers are synchronous: they run either on
// a blocking worker thread or on the debugger's own thread during a drain,
// and reach the host only through the bound adaptor.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, warn};
use voltron_adaptor::reader::read_words;
use voltron_adaptor::{
    Adaptor, Breakpoint, DerefChain, Frame, RegisterSet, RegisterValue, SourceLocation, Target,
    TargetState,
};

use crate::catalog;
use crate::protocol::{ApiError, ApiResponse, ApiResult, Binary, API_VERSION};
use crate::requests::*;

/// Everything a handler may touch
pub struct HandlerContext<'a> {
    pub adaptor: &'a dyn Adaptor,
    pub hosts: &'a [String],
    pub views: &'a [String],
    /// Envelope timeout, used by `wait` when its payload has none
    pub timeout: Duration,
}

#[derive(Serialize)]
struct Empty {}

#[derive(Serialize)]
struct VersionResponse {
    api_version: f64,
    host_version: String,
}

#[derive(Serialize)]
struct StateResponse {
    state: TargetState,
}

#[derive(Serialize)]
struct TargetsResponse {
    targets: Vec<Target>,
}

#[derive(Serialize)]
struct RegistersResponse {
    registers: RegisterSet,
    deref: BTreeMap<String, DerefChain>,
}

#[derive(Serialize)]
struct MemoryResponse {
    address: u64,
    memory: Binary,
    bytes: u64,
    deref: Option<Vec<DerefChain>>,
}

#[derive(Serialize)]
struct StackResponse {
    memory: Binary,
    stack_pointer: u64,
}

#[derive(Serialize)]
struct DisassembleResponse {
    disassembly: String,
    flavor: String,
    host: String,
}

#[derive(Serialize)]
struct OutputResponse<T: Serialize> {
    output: T,
}

#[derive(Serialize)]
struct BreakpointsResponse {
    breakpoints: Vec<Breakpoint>,
}

#[derive(Serialize)]
struct BacktraceResponse {
    frames: Vec<Frame>,
}

/// Run `request` and always produce a response
pub fn handle(request: &Request, ctx: &HandlerContext) -> ApiResponse {
    let kind = request.kind();
    debug!("Dispatching {} request", kind.name());

    match dispatch(request, ctx) {
        Ok(response) => response,
        Err(e) => {
            warn!("{} request failed: {}", kind.name(), e);
            ApiResponse::error(&e)
        }
    }
}

fn dispatch(request: &Request, ctx: &HandlerContext) -> ApiResult<ApiResponse> {
    let adaptor = ctx.adaptor;

    match request {
        Request::Version => ApiResponse::success(&VersionResponse {
            api_version: API_VERSION,
            host_version: adaptor.version()?,
        }),
        Request::State(r) => ApiResponse::success(&StateResponse {
            state: adaptor.state(r.target_id.unwrap_or(0))?,
        }),
        Request::Targets => ApiResponse::success(&TargetsResponse {
            targets: adaptor.targets()?,
        }),
        Request::Registers(r) => handle_registers(adaptor, r),
        Request::Memory(r) => handle_memory(adaptor, r),
        Request::WriteMemory(r) => handle_write_memory(adaptor, r),
        Request::Stack(r) => handle_stack(adaptor, r),
        Request::Disassemble(r) => handle_disassemble(adaptor, r),
        Request::Command(r) => {
            let command = r.command.as_deref().ok_or(ApiError::MissingField("command"))?;
            ApiResponse::success(&OutputResponse {
                output: adaptor.command(command)?,
            })
        }
        Request::Dereference(r) => {
            let pointer = r.pointer.ok_or(ApiError::MissingField("pointer"))?;
            ApiResponse::success(&OutputResponse {
                output: adaptor.dereference(pointer, r.target_id.unwrap_or(0))?,
            })
        }
        Request::Breakpoints(r) => ApiResponse::success(&BreakpointsResponse {
            breakpoints: adaptor.breakpoints(r.target_id.unwrap_or(0))?,
        }),
        Request::Backtrace(r) => ApiResponse::success(&BacktraceResponse {
            frames: adaptor.backtrace(r.target_id.unwrap_or(0), r.thread_id)?,
        }),
        Request::SourceLocation(r) => {
            let location: Option<SourceLocation> =
                adaptor.source_location(r.target_id.unwrap_or(0), r.address)?;
            ApiResponse::success(&OutputResponse { output: location })
        }
        Request::Plugins => ApiResponse::success(&catalog::plugins(
            ctx.hosts,
            ctx.views,
            &adaptor.capabilities(),
        )),
        Request::Wait(r) => handle_wait(adaptor, r, ctx.timeout),
        Request::Null => ApiResponse::success(&Empty {}),
    }
}

fn handle_registers(adaptor: &dyn Adaptor, r: &RegistersRequest) -> ApiResult<ApiResponse> {
    let target_id = r.target_id.unwrap_or(0);
    let names = r.registers.clone().unwrap_or_default();
    let registers = adaptor.registers(target_id, r.thread_id, &names)?;

    let deref = registers
        .iter()
        .map(|(name, value)| {
            let chain = match value {
                RegisterValue::Value(v) if *v != 0 => u64::try_from(*v)
                    .ok()
                    .and_then(|ptr| adaptor.dereference(ptr, target_id).ok())
                    .unwrap_or_default(),
                _ => DerefChain::new(),
            };
            (name.clone(), chain)
        })
        .collect();

    ApiResponse::success(&RegistersResponse { registers, deref })
}

/// Find the address in a host command's output.
///
/// Tokens are scanned from the end; the first one that parses as an integer
/// wins, trying decimal before hex. Clients depend on this exact rule.
pub fn address_from_output(output: &str) -> Option<u64> {
    output.split_whitespace().rev().find_map(|token| {
        token.parse::<u64>().ok().or_else(|| {
            let hex = token
                .strip_prefix("0x")
                .or_else(|| token.strip_prefix("0X"))
                .unwrap_or(token);
            u64::from_str_radix(hex, 16).ok()
        })
    })
}

fn handle_memory(adaptor: &dyn Adaptor, r: &MemoryRequest) -> ApiResult<ApiResponse> {
    let target_id = r.target_id.unwrap_or(0);
    let target = adaptor.target(target_id)?;
    let addr_size = target.addr_size as u64;

    let base = if let Some(address) = r.address {
        address
    } else if let Some(register) = &r.register {
        let regs = adaptor.registers(target_id, None, &[register.clone()])?;
        regs.values()
            .next()
            .and_then(RegisterValue::as_u64)
            .ok_or_else(|| ApiError::Generic(format!("Register {} is not readable", register)))?
    } else if let Some(command) = &r.command {
        let output = adaptor.command(command)?;
        address_from_output(&output)
            .ok_or_else(|| ApiError::Generic("Command did not return a valid address".to_string()))?
    } else {
        return Err(ApiError::MissingField("address"));
    };

    let offset = match (r.offset, r.words) {
        (Some(offset), Some(_)) => offset.wrapping_mul(addr_size as i64),
        (Some(offset), None) => offset,
        (None, _) => 0,
    };
    let address = base.wrapping_add_signed(offset);

    let length = match (r.words, r.length) {
        (Some(words), _) => words.saturating_mul(addr_size),
        (None, Some(length)) => length,
        (None, None) => return Err(ApiError::MissingField("length")),
    };

    let memory = adaptor.memory(address, length, target_id)?;

    let deref = if r.deref.unwrap_or(false) {
        let words = read_words(&memory, target.addr_size, target.byte_order)?;
        Some(
            words
                .into_iter()
                .map(|w| adaptor.dereference(w, target_id).unwrap_or_default())
                .collect(),
        )
    } else {
        None
    };

    ApiResponse::success(&MemoryResponse {
        address,
        bytes: memory.len() as u64,
        memory: Binary(memory),
        deref,
    })
}

fn handle_write_memory(adaptor: &dyn Adaptor, r: &WriteMemoryRequest) -> ApiResult<ApiResponse> {
    let address = r.address.ok_or(ApiError::MissingField("address"))?;
    let value = r.value.as_ref().ok_or(ApiError::MissingField("value"))?;

    adaptor.write_memory(address, &value.0, r.target_id.unwrap_or(0))?;
    ApiResponse::success(&Empty {})
}

fn handle_stack(adaptor: &dyn Adaptor, r: &StackRequest) -> ApiResult<ApiResponse> {
    let target_id = r.target_id.unwrap_or(0);
    let length = r.length.ok_or(ApiError::MissingField("length"))?;

    let (_, stack_pointer) = adaptor.stack_pointer(target_id, r.thread_id)?;
    let memory = adaptor.memory(stack_pointer, length, target_id)?;

    ApiResponse::success(&StackResponse {
        memory: Binary(memory),
        stack_pointer,
    })
}

fn handle_disassemble(adaptor: &dyn Adaptor, r: &DisassembleRequest) -> ApiResult<ApiResponse> {
    let count = r.count.ok_or(ApiError::MissingField("count"))?;
    let disassembly = adaptor.disassemble(r.target_id.unwrap_or(0), r.address, count)?;

    ApiResponse::success(&DisassembleResponse {
        disassembly,
        flavor: adaptor.disassembly_flavor().unwrap_or_else(|_| "NA".to_string()),
        host: adaptor.host().to_string(),
    })
}

fn handle_wait(adaptor: &dyn Adaptor, r: &WaitRequest, default_timeout: Duration) -> ApiResult<ApiResponse> {
    let target_id = r.target_id.unwrap_or(0);
    let changes = r
        .state_changes
        .clone()
        .unwrap_or_else(|| vec![TargetState::Stopped]);
    let timeout = match r.timeout {
        Some(secs) => Duration::try_from_secs_f64(secs)
            .map_err(|_| ApiError::InvalidRequest(format!("Bad timeout: {}", secs)))?,
        None => default_timeout,
    };

    let subscription = adaptor.notifier().subscribe(&changes);
    if !subscription.wait(Some(timeout)) {
        return Err(ApiError::TimedOut);
    }
    drop(subscription);

    ApiResponse::success(&StateResponse {
        state: adaptor.state(target_id)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;
    use std::sync::Arc;
    use std::thread;
    use voltron_adaptor::mock::{MockAdaptor, DEMO_MAIN, DEMO_SP};

    fn run(adaptor: &dyn Adaptor, kind: RequestKind, data: Value) -> ApiResponse {
        let request = Request::parse(kind, data).unwrap();
        let ctx = HandlerContext {
            adaptor,
            hosts: &[],
            views: &[],
            timeout: Duration::from_secs(10),
        };
        handle(&request, &ctx)
    }

    fn payload(resp: &ApiResponse) -> Value {
        resp.payload().unwrap()
    }

    #[test]
    fn test_address_from_output() {
        assert_eq!(address_from_output("(unsigned long) $0 = 140732920755384"), Some(140732920755384));
        assert_eq!(address_from_output("rsp 0x7ffeefbff8b8 trailing"), Some(0x7ffeefbff8b8));
        assert_eq!(address_from_output("no numbers here"), None);
        // decimal before hex on the same token
        assert_eq!(address_from_output("value 10"), Some(10));
    }

    #[test]
    fn test_version() {
        let adaptor = MockAdaptor::demo();
        adaptor.set_version("lldb-something");
        let resp = run(&adaptor, RequestKind::Version, Value::Null);
        let data = payload(&resp);
        assert_eq!(data["api_version"], 1.1);
        assert_eq!(data["host_version"], "lldb-something");
    }

    #[test]
    fn test_registers_attach_deref() {
        let adaptor = MockAdaptor::demo();
        let resp = run(&adaptor, RequestKind::Registers, serde_json::json!({"registers": ["pc", "rbx"]}));
        let data = payload(&resp);

        assert_eq!(data["registers"]["rip"], DEMO_MAIN);
        assert_eq!(data["deref"]["rip"][0][0], "pointer");
        assert_eq!(data["deref"]["rip"][1], serde_json::json!(["symbol", "main + 0x0"]));
        // zero registers are not dereferenced
        assert_eq!(data["deref"]["rbx"], serde_json::json!([]));
    }

    #[test]
    fn test_memory_by_register_with_words_and_deref() {
        let adaptor = MockAdaptor::demo();
        let resp = run(
            &adaptor,
            RequestKind::Memory,
            serde_json::json!({"register": "sp", "words": 2, "offset": 1, "deref": true}),
        );
        let data = payload(&resp);

        assert_eq!(data["address"], DEMO_SP + 8);
        assert_eq!(data["bytes"], 16);
        let deref = data["deref"].as_array().unwrap();
        assert_eq!(deref.len(), 2);
        assert_eq!(deref[0].as_array().unwrap().last().unwrap()[0], "symbol");
        assert_eq!(deref[1].as_array().unwrap().last().unwrap()[0], "circular");
    }

    #[test]
    fn test_memory_by_command() {
        let adaptor = MockAdaptor::demo();
        let resp = run(
            &adaptor,
            RequestKind::Memory,
            serde_json::json!({"command": "print $rsp", "length": 8}),
        );
        let data = payload(&resp);
        assert_eq!(data["address"], DEMO_SP);
        assert!(data["deref"].is_null());
    }

    #[test]
    fn test_memory_failed_read_is_generic_error() {
        let adaptor = MockAdaptor::demo();
        let resp = run(&adaptor, RequestKind::Memory, serde_json::json!({"address": 16, "length": 8}));
        assert_eq!(resp.error_code(), Some(crate::protocol::GENERIC_ERROR));
    }

    #[test]
    fn test_busy_target() {
        let adaptor = MockAdaptor::demo();
        adaptor.set_state(TargetState::Running);
        let resp = run(&adaptor, RequestKind::Stack, serde_json::json!({"length": 8}));
        assert_eq!(resp.error_code(), Some(crate::protocol::TARGET_BUSY));
    }

    #[test]
    fn test_stack_and_disassemble() {
        let adaptor = MockAdaptor::demo();

        let data = payload(&run(&adaptor, RequestKind::Stack, serde_json::json!({"length": 16})));
        assert_eq!(data["stack_pointer"], DEMO_SP);

        let data = payload(&run(&adaptor, RequestKind::Disassemble, serde_json::json!({"count": 3})));
        assert_eq!(data["disassembly"].as_str().unwrap().lines().count(), 3);
        assert_eq!(data["flavor"], "intel");
        assert_eq!(data["host"], "mock");
    }

    #[test]
    fn test_null_and_source_location() {
        let adaptor = MockAdaptor::demo();
        assert_eq!(payload(&run(&adaptor, RequestKind::Null, Value::Null)), serde_json::json!({}));

        let data = payload(&run(&adaptor, RequestKind::SourceLocation, Value::Null));
        assert_eq!(data["output"], serde_json::json!(["inferior.c", 8]));
    }

    #[test]
    fn test_wait_times_out_and_unsubscribes() {
        let adaptor = MockAdaptor::demo();
        let resp = run(&adaptor, RequestKind::Wait, serde_json::json!({"timeout": 0.05}));
        assert_eq!(resp.error_code(), Some(crate::protocol::TIMED_OUT));
        assert_eq!(adaptor.notifier().listener_count(), 0);
    }

    #[test]
    fn test_wait_returns_state_on_stop() {
        let adaptor = Arc::new(MockAdaptor::demo());
        let waiter = {
            let adaptor = adaptor.clone();
            thread::spawn(move || {
                let resp = run(&*adaptor, RequestKind::Wait, serde_json::json!({"timeout": 5}));
                payload(&resp)
            })
        };

        while adaptor.notifier().listener_count() == 0 {
            thread::sleep(Duration::from_millis(5));
        }
        adaptor.notifier().notify(TargetState::Stopped);
        assert_eq!(waiter.join().unwrap()["state"], "stopped");
    }

    #[test]
    fn test_plugins_report_adaptor_capabilities() {
        let adaptor = MockAdaptor::demo().with_capabilities(vec![voltron_adaptor::Capability::Async]);
        let data = payload(&run(&adaptor, RequestKind::Plugins, Value::Null));
        assert_eq!(data["plugins"]["capabilities"], serde_json::json!(["async"]));
        assert!(data["plugins"]["api"]["wait"].is_object());

        let data = payload(&run(&MockAdaptor::demo(), RequestKind::Plugins, Value::Null));
        assert_eq!(data["plugins"]["capabilities"], serde_json::json!([]));
    }
}
