// Debugger adaptor library
//
// A uniform, thread-safe view of whatever debugger the broker is embedded in:
// - Target, register and memory inspection
// - Pointer-chain dereference
// - Disassembly, with a capstone fallback
// - Stop notifications for `wait` requests

pub mod adaptor;
pub mod arch;
pub mod deref;
pub mod disasm;
pub mod error;
pub mod mock;
pub mod notify;
pub mod reader;
pub mod registry;
pub mod types;

pub use adaptor::Adaptor;
pub use arch::Arch;
pub use deref::{DerefLimits, MemorySource};
pub use error::{AdaptorError, AdaptorResult};
pub use mock::{MockAdaptor, MockProcess};
pub use notify::{StateNotifier, Subscription};
pub use registry::HostRegistry;
pub use types::*;
