//! FileCheck-style test validation for KIR files.
//!
//! A filetest is a node list whose `;` comments carry directives:
//!
//! ```text
//! ; RUN: %kernelgen --target amdgpu --arch gfx1100 %s
//! ; CHECK-LABEL: define amdgpu_kernel void @k(
//! ; CHECK: tail call i32 @llvm.amdgcn.workgroup.id.x()
//! ; CHECK-NOT: alloca
//! ```
//!
//! Every RUN line lowers the node list once and the CHECK directives are
//! matched against the produced text in order.

use std::collections::VecDeque;

use log::debug;

use super::{parse, print};
use crate::core::node::Graph;
use crate::core::target::Target;
use crate::llvm::{legalize, lower_with_stats};

/// A CHECK directive extracted from a KIR file
#[derive(Debug, Clone, PartialEq)]
pub enum CheckDirective {
    /// CHECK: pattern - Match on this or a later line
    Check(String),
    /// CHECK-LABEL: pattern - Label for a section
    CheckLabel(String),
    /// CHECK-NEXT: pattern - Match on the next line
    CheckNext(String),
    /// CHECK-NOT: pattern - Must not occur before the next match
    CheckNot(String),
    /// CHECK-EMPTY - Match empty line
    CheckEmpty,
    /// COM: comment - Comment, ignored
    Comment(String),
}

/// A RUN directive specifying how to execute the test
#[derive(Debug, Clone, PartialEq)]
pub struct RunDirective {
    pub command: String,
    pub args: Vec<String>,
}

impl RunDirective {
    fn value(&self, flag: &str) -> Option<&str> {
        let pos = self.args.iter().position(|a| a == flag)?;
        self.args.get(pos + 1).map(String::as_str)
    }

    fn has(&self, flag: &str) -> bool {
        self.args.iter().any(|a| a == flag)
    }
}

/// Test specification extracted from a KIR file
#[derive(Debug)]
pub struct TestSpec {
    pub run_directives: Vec<RunDirective>,
    pub check_directives: Vec<CheckDirective>,
    pub kir_content: String,
}

const PREFIXES: &[&str] = &["; CHECK-LABEL:", "; CHECK-NEXT:", "; CHECK-NOT:", "; CHECK-EMPTY", "; CHECK:", "; COM:"];

impl TestSpec {
    /// Parse a KIR file to extract test specifications
    pub fn parse(content: &str) -> Result<Self, String> {
        let mut run_directives = Vec::new();
        let mut check_directives = Vec::new();
        let mut kir_lines = Vec::new();

        for (lineno, line) in content.lines().enumerate() {
            let trimmed = line.trim();

            if let Some(run_cmd) = trimmed.strip_prefix("; RUN:") {
                let parts: Vec<&str> = run_cmd.split_whitespace().collect();
                let Some((command, args)) = parts.split_first() else {
                    return Err(format!("line {}: empty RUN directive", lineno + 1));
                };
                run_directives.push(RunDirective {
                    command: command.to_string(),
                    args: args.iter().map(|s| s.to_string()).collect(),
                });
                // Keep line numbers of parse errors aligned with the file.
                kir_lines.push("");
                continue;
            }

            let directive = PREFIXES.iter().find_map(|p| trimmed.strip_prefix(p).map(|rest| (*p, rest.trim())));
            match directive {
                Some(("; CHECK-LABEL:", pattern)) => check_directives.push(CheckDirective::CheckLabel(pattern.to_string())),
                Some(("; CHECK-NEXT:", pattern)) => check_directives.push(CheckDirective::CheckNext(pattern.to_string())),
                Some(("; CHECK-NOT:", pattern)) => check_directives.push(CheckDirective::CheckNot(pattern.to_string())),
                Some(("; CHECK-EMPTY", _)) => check_directives.push(CheckDirective::CheckEmpty),
                Some(("; CHECK:", pattern)) => check_directives.push(CheckDirective::Check(pattern.to_string())),
                Some((_, comment)) => check_directives.push(CheckDirective::Comment(comment.to_string())),
                None => {
                    kir_lines.push(line);
                    continue;
                }
            }
            kir_lines.push("");
        }

        if run_directives.is_empty() {
            return Err("no RUN directive".to_string());
        }

        Ok(TestSpec { run_directives, check_directives, kir_content: kir_lines.join("\n") })
    }
}

/// Test runner that executes KIR tests
pub struct TestRunner {
    verbose: bool,
}

impl TestRunner {
    pub fn new(verbose: bool) -> Self {
        Self { verbose }
    }

    /// Run a KIR test and validate output
    pub fn run_test(&self, spec: &TestSpec) -> Result<(), String> {
        let graph = parse(&spec.kir_content).map_err(|e| e.to_string())?;

        for run_dir in &spec.run_directives {
            let output = self.execute_command(&graph, run_dir)?;
            self.validate_output(&output, &spec.check_directives)
                .map_err(|e| format!("{e}\n--- output of {} {} ---\n{output}", run_dir.command, run_dir.args.join(" ")))?;
        }

        Ok(())
    }

    /// Execute a test command and return the output
    fn execute_command(&self, graph: &Graph, run_dir: &RunDirective) -> Result<String, String> {
        let name = run_dir.value("--target").unwrap_or("cpu");
        let target = Target::by_name(name, run_dir.value("--arch")).ok_or_else(|| format!("unknown target '{name}'"))?;
        debug!("running filetest for {target}");

        if run_dir.has("--print-nodes") {
            let legalized = legalize(graph, &target.legalize).map_err(|e| e.to_string())?;
            return Ok(print(&legalized));
        }

        let lowered = lower_with_stats(graph, &target).map_err(|e| e.to_string())?;
        let mut output = lowered.text;
        if run_dir.has("--stats") {
            output.push_str(&format!("; {}\n", lowered.stats));
        }
        Ok(output)
    }

    /// Validate output against CHECK directives
    pub fn validate_output(&self, output: &str, directives: &[CheckDirective]) -> Result<(), String> {
        let output_lines: VecDeque<_> = output.lines().collect();
        let mut line_idx = 0;
        let mut pending_not: Vec<&str> = Vec::new();

        let check_not = |pending: &mut Vec<&str>, from: usize, to: usize| -> Result<(), String> {
            for pattern in pending.drain(..) {
                if let Some(line) = output_lines.iter().take(to).skip(from).find(|l| l.contains(pattern)) {
                    return Err(format!("CHECK-NOT: pattern '{pattern}' found in '{line}'"));
                }
            }
            Ok(())
        };

        for directive in directives {
            match directive {
                CheckDirective::Comment(_) => continue,

                CheckDirective::CheckNot(pattern) => pending_not.push(pattern.as_str()),

                CheckDirective::Check(pattern) | CheckDirective::CheckLabel(pattern) => {
                    let kind = if matches!(directive, CheckDirective::Check(_)) { "CHECK" } else { "CHECK-LABEL" };
                    let found = output_lines.iter().skip(line_idx).position(|line| line.contains(pattern.as_str()));

                    match found {
                        Some(idx) => {
                            check_not(&mut pending_not, line_idx, line_idx + idx)?;
                            line_idx += idx + 1;
                            if self.verbose {
                                println!("{kind}: '{pattern}' found at line {}", line_idx - 1);
                            }
                        }
                        None => {
                            return Err(format!("{kind}: pattern '{pattern}' not found in output"));
                        }
                    }
                }

                CheckDirective::CheckNext(pattern) => {
                    let Some(line) = output_lines.get(line_idx) else {
                        return Err(format!("CHECK-NEXT: no more lines, expected '{pattern}'"));
                    };
                    if !line.contains(pattern.as_str()) {
                        return Err(format!("CHECK-NEXT: expected '{pattern}' but got '{line}'"));
                    }
                    check_not(&mut pending_not, line_idx, line_idx)?;

                    if self.verbose {
                        println!("CHECK-NEXT: '{pattern}' matches at line {line_idx}");
                    }
                    line_idx += 1;
                }

                CheckDirective::CheckEmpty => {
                    let Some(line) = output_lines.get(line_idx) else {
                        continue; // End of output counts as empty
                    };
                    if !line.trim().is_empty() {
                        return Err(format!("CHECK-EMPTY: expected empty line but got '{line}'"));
                    }

                    if self.verbose {
                        println!("CHECK-EMPTY: matches at line {line_idx}");
                    }
                    line_idx += 1;
                }
            }
        }

        check_not(&mut pending_not, line_idx, output_lines.len())
    }
}
