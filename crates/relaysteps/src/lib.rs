//! Built-in step executors
//!
//! One executor per step kind, plus the process-backed worker transport.

mod agent;
mod callback;
mod mock;
mod operator;
mod process;
mod script;

pub use agent::{CommandTransport, DelegatedAgentExecutor};
pub use callback::{callback_result, ExternalCallbackExecutor};
pub use mock::MockExecutor;
pub use operator::ScriptedOperatorExecutor;
pub use script::SandboxedScriptExecutor;

use relaycore::WorkerTransport;
use relayruntime::ExecutorRegistry;
use std::sync::Arc;

/// Register every built-in executor with a registry
pub fn register_all(registry: &mut ExecutorRegistry, transport: Arc<dyn WorkerTransport>) {
    registry.register(Arc::new(DelegatedAgentExecutor::new(transport)));
    registry.register(Arc::new(MockExecutor));
    registry.register(Arc::new(ScriptedOperatorExecutor));
    registry.register(Arc::new(SandboxedScriptExecutor));
    registry.register(Arc::new(ExternalCallbackExecutor::new()));
}
