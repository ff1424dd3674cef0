//! Translation of SSA IR modules into stack-based bytecode.
//!
//! Translation runs in two phases over a [`ModuleContext`]: declaration resolves
//! every type, names methods and statics and computes which functions may throw;
//! lowering then builds one [`FunctionContext`] per defined function (blocks,
//! instruction nodes, control and data-flow edges) and emits its method body.

pub mod aggregates;
pub mod block;
pub mod emit;
pub mod error;
pub mod function;
pub mod instruction;
pub mod module;
pub mod naming;
pub mod options;
pub mod runtime;
pub mod types;

pub use error::{Location, Result, StructuralDefect, TranslateError};
pub use function::FunctionContext;
pub use instruction::{InstructionKind, InstructionNode, NodeId, ResultSlot};
pub use module::{CallTarget, MethodEntry, ModuleContext};
pub use options::TranslationOptions;
pub use runtime::{route_symbol, RuntimeRoute};
pub use types::TypeResolver;

use ib_bytecode::TargetModule;
use tracing::info;

/// Translates a whole module. Options are validated before any work is done; on
/// error nothing is produced.
pub fn translate_module(source: &ib_ir::Module, options: &TranslationOptions) -> Result<TargetModule> {
    options.validate()?;
    let context = ModuleContext::declare(source, options)?;
    let module = context.translate()?;
    info!(
        "translated {} into {} ({} methods)",
        source.name,
        module.name,
        module.methods.len()
    );
    Ok(module)
}

/// Parses a JSON-encoded module and translates it.
pub fn translate_json(text: &str, options: &TranslationOptions) -> Result<TargetModule> {
    let source = ib_ir::Module::from_json_str(text)?;
    translate_module(&source, options)
}
