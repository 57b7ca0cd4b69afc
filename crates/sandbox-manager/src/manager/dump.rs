//! Diagnostic snapshot of the manager's state.

use std::fmt;

use serde::Serialize;

use crate::binding::BindingSnapshot;
use crate::identity::CallerId;

/// Extension owners loaded into one caller's worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LoadedSummary {
    /// Caller owning the worker.
    pub caller: CallerId,
    /// Uids of the packages whose extensions are loaded, ascending.
    pub owner_uids: Vec<u32>,
}

/// Point-in-time view of the sandbox, for operators.
///
/// The text rendering is meant for humans and carries no stability promise.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SandboxDump {
    /// Live tokens.
    pub token_count: usize,
    /// Live links.
    pub link_count: usize,
    /// Binding record per caller.
    pub bindings: Vec<BindingSnapshot>,
    /// Callers under instrumentation.
    pub instrumented: Vec<CallerId>,
    /// Loaded extension owners per caller.
    pub loaded: Vec<LoadedSummary>,
}

impl fmt::Display for SandboxDump {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(formatter, "sandbox manager")?;
        writeln!(formatter, "  tokens: {}", self.token_count)?;
        writeln!(formatter, "  links: {}", self.link_count)?;

        writeln!(formatter, "  bindings:")?;
        if self.bindings.is_empty() {
            writeln!(formatter, "    (none)")?;
        }
        for binding in &self.bindings {
            writeln!(
                formatter,
                "    {}: {} (pending loads: {}, retries used: {})",
                binding.caller, binding.status, binding.pending_loads, binding.retries_used
            )?;
        }

        writeln!(formatter, "  loaded:")?;
        if self.loaded.is_empty() {
            writeln!(formatter, "    (none)")?;
        }
        for entry in &self.loaded {
            let uids: Vec<String> = entry.owner_uids.iter().map(ToString::to_string).collect();
            writeln!(formatter, "    {}: [{}]", entry.caller, uids.join(", "))?;
        }

        write!(formatter, "  instrumented:")?;
        if self.instrumented.is_empty() {
            return writeln!(formatter, " (none)");
        }
        writeln!(formatter)?;
        for caller in &self.instrumented {
            writeln!(formatter, "    {caller}")?;
        }
        Ok(())
    }
}
