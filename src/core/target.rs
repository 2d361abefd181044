// This module defines the immutable target configuration passed into every lowering
// call. A Target bundles the capability flags of an output dialect (shared storage,
// workgroup-local buffers, vector loads), its calling-convention attribute, and the
// three hooks that specialize the shared engine: the legalization rule set, the
// selection rule set, and an optional pass-1 prepass. Each constructor builds the base
// rule sets and prepends its own rules, so target rules take priority while arithmetic,
// memory, vector and control-flow rules are inherited unchanged. The handler types are
// plain function pointers; a Target owns no state beyond its rule vectors and can be
// cloned, shared and reused across calls.

//! Target configuration: capability flags plus rule sets.

use std::fmt;

use super::error::CompileResult;
use super::node::{Graph, NodeId};
use super::pattern::{Match, RuleSet};
use super::session::LoweringSession;
use crate::llvm::legalize::Legalizer;
use crate::llvm::rules::Renderer;

/// Legalization handler: `Ok(Some(id))` replaces the matched node with `id`.
pub type LegalizeFn = fn(&mut Legalizer<'_>, &Match) -> CompileResult<Option<NodeId>>;

/// Selection handler: `Ok(Some(text))` is the node's instruction text.
pub type SelectFn = fn(&mut Renderer<'_, '_, '_>, &Match) -> CompileResult<Option<String>>;

/// Runs on every node during pass 1, before any instruction is emitted.
pub type PrepassFn = fn(&mut LoweringSession<'_>, &Graph, NodeId) -> CompileResult<()>;

#[derive(Clone)]
pub struct Target {
    pub name: &'static str,
    pub arch: Option<String>,
    /// Calling convention written after `define`.
    pub abi: Option<&'static str>,
    /// Workgroup-local buffers exist; `DefineLocal` needs this and `has_shared`.
    pub has_local: bool,
    /// Module-level shared storage declarations can be emitted.
    pub has_shared: bool,
    /// Loads and stores may move whole vectors.
    pub supports_float4: bool,
    pub legalize: RuleSet<LegalizeFn>,
    pub select: RuleSet<SelectFn>,
    pub prepass: Option<PrepassFn>,
}

impl Target {
    /// Target names accepted by [`Target::by_name`].
    pub const NAMES: &'static [&'static str] = &["cpu", "cpu-amx", "amdgpu"];

    /// Look a target up by name. `arch` only applies to GPU targets.
    pub fn by_name(name: &str, arch: Option<&str>) -> Option<Target> {
        match name {
            "cpu" => Some(Target::cpu()),
            "cpu-amx" => Some(Target::cpu_amx()),
            "amdgpu" => Some(Target::amdgpu(arch.unwrap_or("gfx1100"))),
            _ => None,
        }
    }
}

impl fmt::Debug for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Target")
            .field("name", &self.name)
            .field("arch", &self.arch)
            .field("abi", &self.abi)
            .field("has_local", &self.has_local)
            .field("has_shared", &self.has_shared)
            .field("supports_float4", &self.supports_float4)
            .field("legalize_rules", &self.legalize.len())
            .field("select_rules", &self.select.len())
            .field("prepass", &self.prepass.is_some())
            .finish()
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.arch {
            Some(arch) => write!(f, "{} ({})", self.name, arch),
            None => f.write_str(self.name),
        }
    }
}
