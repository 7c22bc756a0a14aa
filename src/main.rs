use clap::{Args, Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process;

use treebeard::config::RuntimeLibraries;
use treebeard::diagnostic::Diagnostic;
use treebeard::model::header_span;
use treebeard::{lower_forest, Forest, Lowered, LoweringConfig};

#[derive(Parser)]
#[command(
    name = "treebeard",
    version,
    about = "Lower tree ensembles into tiled model buffers"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print the synthesized buffer procedures and predict skeleton
    Lower(LoweringArgs),
    /// Print the layout plan (offsets and lengths per tree)
    Plan(LoweringArgs),
    /// Write the serialized host arrays
    Pack(LoweringArgs),
}

#[derive(Args)]
struct LoweringArgs {
    /// Input .forest model
    input: PathBuf,
    /// Lowering config (treebeard.toml)
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,
    /// Representation: array, sparse, gpu_array or gpu_sparse
    #[arg(long)]
    representation: Option<String>,
    /// Nodes per tile
    #[arg(long)]
    tile_size: Option<u32>,
    /// Print tree index, offset and length at every tree access
    #[arg(long)]
    insert_debug_helpers: bool,
    /// Output file (stdout for lower and plan when absent)
    #[arg(short, long)]
    output: Option<PathBuf>,
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    match cli.command {
        Command::Lower(args) => cmd_lower(args),
        Command::Plan(args) => cmd_plan(args),
        Command::Pack(args) => cmd_pack(args),
    }
}

// --- shared ---

fn read_source(path: &Path) -> String {
    match std::fs::read_to_string(path) {
        Ok(source) => source,
        Err(e) => {
            eprintln!("error: cannot read '{}': {}", path.display(), e);
            process::exit(1);
        }
    }
}

fn fail(diagnostic: &Diagnostic, path: &Path, source: &str) -> ! {
    diagnostic.render(&path.display().to_string(), source);
    process::exit(1);
}

fn resolve_config(args: &LoweringArgs) -> LoweringConfig {
    let mut config = match &args.config {
        Some(path) => {
            let source = read_source(path);
            LoweringConfig::from_toml_str(&source).unwrap_or_else(|d| fail(&d, path, &source))
        }
        None => LoweringConfig::default(),
    };
    if let Some(representation) = &args.representation {
        config.representation = representation.clone();
    }
    if let Some(tile_size) = args.tile_size {
        config.tile_size = tile_size;
    }
    config.insert_debug_helpers |= args.insert_debug_helpers;
    if let Err(d) = config.check() {
        fail(&d, &args.input, "");
    }
    if let Some(dir) = &config.library_dir {
        if let Err(d) = RuntimeLibraries::locate(dir, config.target()) {
            fail(&d, dir, "");
        }
    }
    config
}

fn lower(args: &LoweringArgs) -> Lowered {
    let config = resolve_config(args);
    let source = read_source(&args.input);
    let forest = Forest::deserialize(&source).unwrap_or_else(|d| fail(&d, &args.input, &source));
    if let Err(mut d) = forest.validate() {
        if d.span.is_dummy() {
            d.span = header_span(&source);
        }
        fail(&d, &args.input, &source);
    }
    lower_forest(&forest, &config).unwrap_or_else(|d| fail(&d, &args.input, &source))
}

fn emit(text: &str, output: Option<&Path>) {
    match output {
        Some(path) => {
            if let Err(e) = std::fs::write(path, text) {
                eprintln!("error: cannot write '{}': {}", path.display(), e);
                process::exit(1);
            }
            eprintln!("Wrote {}", path.display());
        }
        None => print!("{}", text),
    }
}

// --- treebeard lower ---

fn cmd_lower(args: LoweringArgs) {
    let lowered = lower(&args);
    emit(&lowered.module.to_string(), args.output.as_deref());
}

// --- treebeard plan ---

fn cmd_plan(args: LoweringArgs) {
    let lowered = lower(&args);
    let mut text = lowered.info.plan.to_string();
    text.push_str(&format!("max tree length: {}\n", lowered.info.max_tree_length));
    emit(&text, args.output.as_deref());
}

// --- treebeard pack ---

fn cmd_pack(args: LoweringArgs) {
    let Some(output) = args.output.clone() else {
        eprintln!("error: pack needs an output file (-o)");
        process::exit(1);
    };
    let lowered = lower(&args);
    if let Err(d) = lowered.model.write_to(&output) {
        fail(&d, &output, "");
    }
    eprintln!(
        "Packed {} tiles into {}",
        lowered.model.num_tiles(),
        output.display()
    );
}
