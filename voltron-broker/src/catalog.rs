// Request catalog
//
// Field listings for every request kind, as reported by the `plugins`
// request so clients can discover what the broker understands.

use serde_json::{json, Map, Value};
use voltron_adaptor::Capability;

use crate::requests::RequestKind;

/// `(request fields, response fields)`, each as `{field: required}`
pub fn fields(kind: RequestKind) -> (Value, Value) {
    match kind {
        RequestKind::Version => (json!({}), json!({"api_version": true, "host_version": true})),
        RequestKind::State => (json!({"target_id": false}), json!({"state": true})),
        RequestKind::Targets => (json!({}), json!({"targets": true})),
        RequestKind::Registers => (
            json!({"target_id": false, "thread_id": false, "registers": false}),
            json!({"registers": true, "deref": false}),
        ),
        RequestKind::Memory => (
            json!({
                "target_id": false,
                "address": false,
                "register": false,
                "command": false,
                "length": false,
                "words": false,
                "offset": false,
                "deref": false
            }),
            json!({"address": true, "memory": true, "bytes": true, "deref": false}),
        ),
        RequestKind::WriteMemory => (
            json!({"target_id": false, "address": true, "value": true}),
            json!({}),
        ),
        RequestKind::Stack => (
            json!({"target_id": false, "thread_id": false, "length": true}),
            json!({"memory": true, "stack_pointer": true}),
        ),
        RequestKind::Disassemble => (
            json!({"target_id": false, "address": false, "count": true}),
            json!({"disassembly": true, "flavor": false, "host": false}),
        ),
        RequestKind::Command => (json!({"command": true}), json!({"output": true})),
        RequestKind::Dereference => (
            json!({"target_id": false, "pointer": true}),
            json!({"output": true}),
        ),
        RequestKind::Breakpoints => (json!({"target_id": false}), json!({"breakpoints": true})),
        RequestKind::Backtrace => (
            json!({"target_id": false, "thread_id": false}),
            json!({"frames": true}),
        ),
        RequestKind::SourceLocation => (
            json!({"target_id": false, "address": false}),
            json!({"output": true}),
        ),
        RequestKind::Plugins => (json!({}), json!({"plugins": true})),
        RequestKind::Wait => (
            json!({"target_id": false, "state_changes": false, "timeout": false}),
            json!({"state": true}),
        ),
        RequestKind::Null => (json!({}), json!({})),
    }
}

/// Binary fields of a kind's request and response, base64 on the wire
pub fn binary_fields(kind: RequestKind) -> &'static [&'static str] {
    match kind {
        RequestKind::WriteMemory => &["value"],
        RequestKind::Memory | RequestKind::Stack => &["memory"],
        _ => &[],
    }
}

/// The full `plugins` payload. `capabilities` are those of the bound
/// adaptor.
pub fn plugins(hosts: &[String], views: &[String], capabilities: &[Capability]) -> Value {
    let mut api = Map::new();
    for kind in RequestKind::ALL {
        let (request, response) = fields(kind);
        api.insert(
            kind.name().to_string(),
            json!({
                "request": request,
                "response": response,
                "binary": binary_fields(kind),
            }),
        );
    }

    json!({
        "plugins": {
            "api": api,
            "debugger": hosts,
            "view": views,
            "capabilities": capabilities,
        }
    })
}
