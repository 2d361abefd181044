// This module provides the arena-backed lowering session: the name table and the
// instruction buffer of one lowering call. LoweringSession borrows a bumpalo arena for
// its whole lifetime; every symbol and every emitted instruction string lives in that
// arena, so the table hands out plain &'arena str without cloning. Names are memoized by
// node identity in a hashbrown map and numbered from a single monotonically increasing
// counter shared by all namespaces (temporaries, reserved accumulators, accumulator
// phis, matrix staging buffers). Declared parameters are named from their declaration
// index or variable name instead of the counter. Module-level shared-storage
// declarations and trailing declarations are deduplicated in first-seen order. finish()
// assembles the final program text: shared declarations, function header, body, return,
// trailing declarations and the attribute footer. SessionStats records what was emitted
// for the debug log and the CLI.

//! Arena-backed naming table and instruction buffer.

use bumpalo::Bump;
use hashbrown::{HashMap, HashSet};
use std::fmt;

use super::node::NodeId;

/// Counters gathered while emitting one program.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub nodes_lowered: usize,
    pub instructions: usize,
    pub phis: usize,
    pub blocks: usize,
    pub loops: usize,
    pub accumulators: usize,
}

impl fmt::Display for SessionStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} nodes, {} instructions, {} phis, {} blocks, {} loops, {} accumulators",
            self.nodes_lowered, self.instructions, self.phis, self.blocks, self.loops, self.accumulators
        )
    }
}

/// Ordered set of strings in first-insertion order.
struct Declarations<'arena> {
    order: Vec<&'arena str>,
    seen: HashSet<&'arena str>,
}

impl<'arena> Declarations<'arena> {
    fn new() -> Self {
        Self { order: Vec::new(), seen: HashSet::new() }
    }

    fn insert(&mut self, decl: &'arena str) -> bool {
        if self.seen.insert(decl) {
            self.order.push(decl);
            true
        } else {
            false
        }
    }
}

/// Per-call name table and output buffers.
pub struct LoweringSession<'arena> {
    arena: &'arena Bump,
    names: HashMap<NodeId, &'arena str>,
    scratch: HashMap<NodeId, &'arena str>,
    counter: u32,
    function_name: &'arena str,
    params: Vec<&'arena str>,
    body: Vec<&'arena str>,
    shared: Declarations<'arena>,
    trailing: Declarations<'arena>,
    stats: SessionStats,
}

impl<'arena> LoweringSession<'arena> {
    pub fn new(arena: &'arena Bump) -> Self {
        Self {
            arena,
            names: HashMap::new(),
            scratch: HashMap::new(),
            counter: 0,
            function_name: "test",
            params: Vec::new(),
            body: Vec::new(),
            shared: Declarations::new(),
            trailing: Declarations::new(),
            stats: SessionStats::default(),
        }
    }

    pub fn arena(&self) -> &'arena Bump {
        self.arena
    }

    /// Copy a string into the arena.
    pub fn intern(&self, s: &str) -> &'arena str {
        self.arena.alloc_str(s)
    }

    /// Next value of the shared counter.
    pub fn next_id(&mut self) -> u32 {
        let id = self.counter;
        self.counter += 1;
        id
    }

    /// Fresh `%{prefix}{n}` symbol.
    pub fn fresh(&mut self, prefix: &str) -> &'arena str {
        let n = self.next_id();
        bumpalo::format!(in self.arena, "%{}{}", prefix, n).into_bump_str()
    }

    pub fn lookup(&self, id: NodeId) -> Option<&'arena str> {
        self.names.get(&id).copied()
    }

    /// Bind `id` to `name`, replacing any previous binding.
    pub fn bind(&mut self, id: NodeId, name: &str) -> &'arena str {
        let name = self.intern(name);
        self.names.insert(id, name);
        name
    }

    /// The node's symbol, allocating a fresh temporary on first use.
    pub fn name(&mut self, id: NodeId) -> &'arena str {
        if let Some(name) = self.lookup(id) {
            return name;
        }
        let name = self.fresh("v");
        self.names.insert(id, name);
        name
    }

    /// Record the prefix of helper values a node's lowering owns.
    pub fn bind_scratch(&mut self, id: NodeId, prefix: &'arena str) {
        self.scratch.insert(id, prefix);
    }

    pub fn scratch(&self, id: NodeId) -> Option<&'arena str> {
        self.scratch.get(&id).copied()
    }

    pub fn set_function_name(&mut self, name: &str) {
        self.function_name = self.intern(name);
    }

    pub fn function_name(&self) -> &'arena str {
        self.function_name
    }

    pub fn add_param(&mut self, param: &str) {
        let param = self.intern(param);
        self.params.push(param);
    }

    /// Append instruction text (one or more lines) to the body.
    pub fn emit(&mut self, text: &str) {
        for line in text.lines() {
            if line.ends_with(':') && !line.starts_with(' ') {
                self.stats.blocks += 1;
            } else if line.contains(" = phi ") {
                self.stats.phis += 1;
                self.stats.instructions += 1;
            } else if !line.trim().is_empty() {
                self.stats.instructions += 1;
            }
        }
        let text = self.intern(text);
        self.body.push(text);
    }

    /// Declare module-level shared storage once.
    pub fn declare_shared(&mut self, decl: &str) {
        let decl = self.intern(decl);
        self.shared.insert(decl);
    }

    /// Declare a trailing module item (intrinsic declaration) once.
    pub fn declare_trailing(&mut self, decl: &str) {
        let decl = self.intern(decl);
        self.trailing.insert(decl);
    }

    pub fn stats(&self) -> SessionStats {
        self.stats
    }

    pub fn stats_mut(&mut self) -> &mut SessionStats {
        &mut self.stats
    }

    /// Assemble the final program text.
    pub fn finish(&self, abi: Option<&str>) -> String {
        let mut out = String::new();
        for decl in &self.shared.order {
            out.push_str(decl);
            out.push('\n');
        }
        out.push_str("define");
        if let Some(abi) = abi {
            out.push(' ');
            out.push_str(abi);
        }
        out.push_str(" void @");
        out.push_str(self.function_name);
        out.push('(');
        out.push_str(&self.params.join(","));
        out.push_str(") #0 {\n");
        for text in &self.body {
            out.push_str(text);
            out.push('\n');
        }
        out.push_str("  ret void\n}\n");
        for decl in &self.trailing.order {
            out.push_str(decl);
            out.push('\n');
        }
        out.push_str("attributes #0 = { nounwind \"no-builtins\" \"no-trapping-math\"=\"true\" }\n");
        out
    }
}
