//! kernelgen - lower a kernel node list to textual IR.
//!
//! Reads the node-list format (see [`kernelgen::text`]) from FILE, or from
//! stdin when FILE is absent, and writes the lowered program.
//!
//! ```text
//! kernelgen kernel.kir --target amdgpu --arch gfx1201 -o kernel.ll
//! RUST_LOG=kernelgen=trace kernelgen kernel.kir --stats
//! ```

use std::fs;
use std::io::{self, Read, Write};
use std::path::PathBuf;

use clap::builder::PossibleValuesParser;
use clap::Parser;
use log::info;

use kernelgen::core::Target;
use kernelgen::llvm::{legalize, lower_with_stats};
use kernelgen::text;

/// Lower a kernel node list to textual IR
#[derive(Parser, Debug)]
#[command(name = "kernelgen")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Node-list file; stdin when absent
    #[arg(value_name = "FILE")]
    input: Option<PathBuf>,

    /// Output dialect
    #[arg(long, default_value = "cpu", value_parser = PossibleValuesParser::new(Target::NAMES.iter().copied()))]
    target: String,

    /// GPU architecture (amdgpu only)
    #[arg(long)]
    arch: Option<String>,

    /// Output file; stdout when absent
    #[arg(short, long, value_name = "OUT")]
    output: Option<PathBuf>,

    /// Print lowering statistics to stderr
    #[arg(long)]
    stats: bool,

    /// Print the legalized node list instead of lowering it
    #[arg(long)]
    print_nodes: bool,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let cli = Cli::parse();

    let source = match &cli.input {
        Some(path) => fs::read_to_string(path)?,
        None => {
            let mut buffer = String::new();
            io::stdin().read_to_string(&mut buffer)?;
            buffer
        }
    };

    let target = Target::by_name(&cli.target, cli.arch.as_deref())
        .ok_or_else(|| format!("unknown target '{}'", cli.target))?;
    let graph = text::parse(&source)?;
    info!("read {} nodes for {}", graph.len(), target);

    let output = if cli.print_nodes {
        text::print(&legalize(&graph, &target.legalize)?)
    } else {
        let lowered = lower_with_stats(&graph, &target)?;
        if cli.stats {
            eprintln!("{}", lowered.stats);
        }
        lowered.text
    };

    match &cli.output {
        Some(path) => fs::write(path, output)?,
        None => io::stdout().write_all(output.as_bytes())?,
    }
    Ok(())
}
