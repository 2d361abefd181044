// This module defines the sequential CPU target. The plain target has no workgroup
// storage, no barriers and no parallel indices; it inherits the base legalization and
// selection rules unchanged and only picks the calling convention of the host (win64cc
// on Windows, the default elsewhere). The AMX variant adds one selection rule and a
// pass-1 prepass for the matrix-multiply node; see the amx module.

//! Sequential CPU target, optionally with the AMX matrix unit.

pub mod amx;

use crate::core::node::Op;
use crate::core::pattern::{Pattern, RuleSet};
use crate::core::target::Target;
use crate::llvm::{legalize, rules};

impl Target {
    pub fn cpu() -> Target {
        Target {
            name: "cpu",
            arch: None,
            abi: if cfg!(windows) { Some("win64cc") } else { None },
            has_local: false,
            has_shared: false,
            supports_float4: true,
            legalize: legalize::base_rules(),
            select: rules::base_rules(),
            prepass: None,
        }
    }

    /// CPU target that lowers matrix multiplies onto AMX.
    pub fn cpu_amx() -> Target {
        let cpu = Target::cpu();
        Target {
            name: "cpu-amx",
            select: cpu.select.then(RuleSet::new(vec![rules::rule(Pattern::op(Op::Wmma), amx::render_wmma)])),
            prepass: Some(amx::allocate_staging),
            ..cpu
        }
    }
}
