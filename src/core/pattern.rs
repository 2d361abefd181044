//! Structural pattern matching and priority-ordered rule sets.
//!
//! A [`Pattern`] constrains a node's op, its result type and (recursively) its
//! operands, and binds named captures to matched nodes. A [`RuleSet`] is an
//! ordered list of `(pattern, handler)` pairs; callers walk it top to bottom and
//! the first rule whose pattern matches *and* whose handler accepts the node
//! wins. Targets specialize a shared rule set by prepending their own rules.
//!
//! ```ignore
//! // where(a < b, b, a) for any float max
//! let p = Pattern::op(Op::Max).float().src(vec![Pattern::var("a"), Pattern::var("b")]).named("m");
//! ```

use super::dtype::{DType, ScalarType};
use super::node::{Graph, NodeId, Op};

/// Result-type constraint.
#[derive(Debug, Clone, PartialEq)]
pub enum TypeMatch {
    Any,
    Exact(DType),
    /// Any non-pointer float type, scalar or vector.
    Float,
    /// Any type whose scalar kind is this one, pointers included.
    Scalar(ScalarType),
    Ptr,
}

impl TypeMatch {
    fn accepts(&self, dtype: DType) -> bool {
        match self {
            TypeMatch::Any => true,
            TypeMatch::Exact(t) => *t == dtype,
            TypeMatch::Float => dtype.is_float(),
            TypeMatch::Scalar(s) => dtype.scalar == *s,
            TypeMatch::Ptr => dtype.is_ptr(),
        }
    }
}

/// Operand constraint.
#[derive(Debug, Clone)]
pub enum SrcMatch {
    Any,
    /// Exactly these operands.
    Exact(Vec<Pattern>),
    /// At least these leading operands.
    Prefix(Vec<Pattern>),
    /// One or more operands, each matching the same pattern.
    Each(Box<Pattern>),
}

#[derive(Debug, Clone)]
pub struct Pattern {
    ops: Option<Vec<Op>>,
    dtype: TypeMatch,
    src: SrcMatch,
    name: Option<&'static str>,
    any_of: Vec<Pattern>,
}

impl Pattern {
    /// Matches every node.
    pub fn any() -> Self {
        Self { ops: None, dtype: TypeMatch::Any, src: SrcMatch::Any, name: None, any_of: Vec::new() }
    }

    /// Matches every node and captures it as `name`.
    pub fn var(name: &'static str) -> Self {
        Self::any().named(name)
    }

    pub fn op(op: Op) -> Self {
        Self { ops: Some(vec![op]), ..Self::any() }
    }

    pub fn ops(ops: &[Op]) -> Self {
        Self { ops: Some(ops.to_vec()), ..Self::any() }
    }

    /// Matches when any alternative matches.
    pub fn any_of(alternatives: Vec<Pattern>) -> Self {
        Self { any_of: alternatives, ..Self::any() }
    }

    /// Either `self`, or a cast of something matching `self`. The outer node is captured as `name`.
    pub fn or_casted(self, name: &'static str) -> Self {
        let cast = Pattern::op(Op::Cast).src(vec![self.clone()]);
        Pattern::any_of(vec![self, cast]).named(name)
    }

    pub fn named(mut self, name: &'static str) -> Self {
        self.name = Some(name);
        self
    }

    pub fn dtype(mut self, dtype: DType) -> Self {
        self.dtype = TypeMatch::Exact(dtype);
        self
    }

    pub fn float(mut self) -> Self {
        self.dtype = TypeMatch::Float;
        self
    }

    pub fn scalar(mut self, scalar: ScalarType) -> Self {
        self.dtype = TypeMatch::Scalar(scalar);
        self
    }

    pub fn pointer(mut self) -> Self {
        self.dtype = TypeMatch::Ptr;
        self
    }

    pub fn src(mut self, src: Vec<Pattern>) -> Self {
        self.src = SrcMatch::Exact(src);
        self
    }

    pub fn src_prefix(mut self, src: Vec<Pattern>) -> Self {
        self.src = SrcMatch::Prefix(src);
        self
    }

    pub fn src_each(mut self, each: Pattern) -> Self {
        self.src = SrcMatch::Each(Box::new(each));
        self
    }

    /// Try to match `id`. Captures bound twice must bind the same node.
    pub fn match_node(&self, graph: &Graph, id: NodeId) -> Option<Match> {
        let mut captures = Vec::new();
        if self.matches(graph, id, &mut captures) {
            Some(Match { root: id, captures })
        } else {
            None
        }
    }

    fn matches(&self, graph: &Graph, id: NodeId, caps: &mut Vec<(&'static str, NodeId)>) -> bool {
        let mark = caps.len();
        let ok = self.matches_inner(graph, id, caps);
        if !ok {
            caps.truncate(mark);
        }
        ok
    }

    fn matches_inner(&self, graph: &Graph, id: NodeId, caps: &mut Vec<(&'static str, NodeId)>) -> bool {
        let Some(node) = graph.get(id) else {
            return false;
        };
        if let Some(ops) = &self.ops {
            if !ops.contains(&node.op) {
                return false;
            }
        }
        if !self.dtype.accepts(node.dtype) {
            return false;
        }
        if let Some(name) = self.name {
            match caps.iter().find(|(n, _)| *n == name) {
                Some(&(_, bound)) if bound != id => return false,
                Some(_) => {}
                None => caps.push((name, id)),
            }
        }
        if !self.any_of.is_empty() && !self.any_of.iter().any(|alt| alt.matches(graph, id, caps)) {
            return false;
        }
        match &self.src {
            SrcMatch::Any => true,
            SrcMatch::Exact(pats) => {
                pats.len() == node.src.len()
                    && pats.iter().zip(&node.src).all(|(p, &s)| p.matches(graph, s, caps))
            }
            SrcMatch::Prefix(pats) => {
                pats.len() <= node.src.len()
                    && pats.iter().zip(&node.src).all(|(p, &s)| p.matches(graph, s, caps))
            }
            SrcMatch::Each(p) => !node.src.is_empty() && node.src.iter().all(|&s| p.matches(graph, s, caps)),
        }
    }
}

/// A successful match: the root node plus named captures.
#[derive(Debug, Clone, PartialEq)]
pub struct Match {
    pub root: NodeId,
    captures: Vec<(&'static str, NodeId)>,
}

impl Match {
    pub fn get(&self, name: &str) -> Option<NodeId> {
        self.captures.iter().find(|(n, _)| *n == name).map(|&(_, id)| id)
    }
}

impl std::ops::Index<&str> for Match {
    type Output = NodeId;

    /// Panics when the rule's pattern does not bind `name`; that is a bug in the rule table.
    fn index(&self, name: &str) -> &NodeId {
        match self.captures.iter().find(|(n, _)| *n == name) {
            Some((_, id)) => id,
            None => panic!("pattern has no capture named {name:?}"),
        }
    }
}

/// A pattern paired with the handler invoked on a match.
#[derive(Debug, Clone)]
pub struct Rule<H> {
    pub pattern: Pattern,
    pub handler: H,
}

impl<H> Rule<H> {
    pub fn new(pattern: Pattern, handler: H) -> Self {
        Self { pattern, handler }
    }
}

/// Priority-ordered rules: earlier rules win.
#[derive(Debug, Clone)]
pub struct RuleSet<H> {
    rules: Vec<Rule<H>>,
}

impl<H> RuleSet<H> {
    pub fn new(rules: Vec<Rule<H>>) -> Self {
        Self { rules }
    }

    pub fn empty() -> Self {
        Self { rules: Vec::new() }
    }

    /// `self` followed by `lower`; rules in `self` take priority.
    pub fn then(mut self, lower: RuleSet<H>) -> Self {
        self.rules.extend(lower.rules);
        self
    }

    /// `higher` followed by `self`; rules in `higher` take priority.
    pub fn prepend(self, higher: RuleSet<H>) -> Self {
        higher.then(self)
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Rule<H>> {
        self.rules.iter()
    }
}

impl<H> Default for RuleSet<H> {
    fn default() -> Self {
        Self::empty()
    }
}
