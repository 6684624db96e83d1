use clap::Parser;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

use cexp::value::Value;
use cexp::{Document, EngineOptions, ExpansionReport};

#[derive(Debug, Clone, clap::ValueEnum)]
enum EmitStage {
    /// Indented effective tree
    Tree,
    /// Replacement list of every composite
    Replacements,
    /// Patches emitted by each update step, as JSON
    Patches,
    /// Graphviz DOT of the structural tree
    Dot,
    /// Effective tree as serialized JSON
    Json,
}

#[derive(Parser, Debug)]
#[command(
    name = "cexp",
    version,
    about = "Composite expansion engine — expands composite components and patches them incrementally"
)]
struct Cli {
    /// Input document (serialized component JSON)
    document: PathBuf,

    /// State updates to apply after expansion: [{component, stateVariable, value}]
    #[arg(short, long)]
    updates: Option<PathBuf>,

    /// Output stage
    #[arg(long, value_enum, default_value_t = EmitStage::Tree)]
    emit: EmitStage,

    /// Engine options JSON
    #[arg(long)]
    config: Option<PathBuf>,

    /// Variant seed (overrides the config file)
    #[arg(long)]
    seed: Option<String>,

    /// Synthesize a placeholder for composites that produce nothing
    #[arg(long)]
    require_replacements: bool,

    /// Print engine phases to stderr
    #[arg(long)]
    verbose: bool,
}

/// One entry of the updates file.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpdateStep {
    component: String,
    state_variable: String,
    value: Value,
}

fn read_or_exit(path: &Path) -> String {
    match std::fs::read_to_string(path) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("cexp: error: {}: {}", path.display(), e);
            std::process::exit(2);
        }
    }
}

fn report_diagnostics(report: &ExpansionReport) -> bool {
    for diag in &report.diagnostics {
        eprintln!("cexp: {}", diag);
    }
    report.has_errors()
}

fn main() {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "cexp=debug" } else { "cexp=warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    // ── Options ──
    let mut options = match &cli.config {
        Some(path) => match EngineOptions::from_json_str(&read_or_exit(path)) {
            Ok(o) => o,
            Err(e) => {
                eprintln!("cexp: error: {}: {}", path.display(), e);
                std::process::exit(2);
            }
        },
        None => EngineOptions::default(),
    };
    if let Some(seed) = &cli.seed {
        options.variant_seed = seed.clone();
    }
    if cli.require_replacements {
        options.composites_must_have_replacement = true;
    }

    // ── Load and expand ──
    let text = read_or_exit(&cli.document);
    let mut doc = match Document::from_json_str(&text, options) {
        Ok(d) => d,
        Err(e) => {
            eprintln!("cexp: error: {}: {}", cli.document.display(), e);
            std::process::exit(2);
        }
    };

    let mut failed = false;
    let mut reports = Vec::new();
    match doc.expand() {
        Ok(report) => {
            failed |= report_diagnostics(&report);
            reports.push(report);
        }
        Err(e) => {
            eprintln!("cexp: error: {}", e);
            std::process::exit(1);
        }
    }

    // ── Updates ──
    let steps: Vec<UpdateStep> = match &cli.updates {
        Some(path) => match serde_json::from_str(&read_or_exit(path)) {
            Ok(s) => s,
            Err(e) => {
                eprintln!("cexp: error: {}: {}", path.display(), e);
                std::process::exit(2);
            }
        },
        None => Vec::new(),
    };
    for step in steps {
        let Some(idx) = doc.lookup(&step.component) else {
            eprintln!("cexp: error: no component named '{}'", step.component);
            std::process::exit(1);
        };
        let result = doc
            .request_update(idx, &step.state_variable, step.value)
            .and_then(|_| doc.update());
        match result {
            Ok(report) => {
                failed |= report_diagnostics(&report);
                reports.push(report);
            }
            Err(e) => {
                eprintln!("cexp: error: {}", e);
                std::process::exit(1);
            }
        }
    }

    // ── Emit ──
    let output = match cli.emit {
        EmitStage::Tree => doc.effective_tree(),
        EmitStage::Dot => cexp::dot::emit_dot(&doc),
        EmitStage::Replacements => {
            let mut out = String::new();
            for c in doc.composites() {
                let reps = doc.replacements(c).unwrap_or(&[]);
                let items: Vec<String> = reps
                    .iter()
                    .filter_map(|&r| doc.get(r))
                    .map(|r| format!("{} {}", r.component_type, doc.identifier(r.idx)))
                    .collect();
                out.push_str(&format!("{}: [{}]", doc.identifier(c), items.join(", ")));
                match doc.replacements_to_withhold(c) {
                    Ok(w) if w > 0 => out.push_str(&format!(" withholding {}\n", w)),
                    _ => out.push('\n'),
                }
            }
            out
        }
        EmitStage::Patches => match serde_json::to_string_pretty(&reports) {
            Ok(s) => s + "\n",
            Err(e) => {
                eprintln!("cexp: error: {}", e);
                std::process::exit(1);
            }
        },
        EmitStage::Json => {
            let json = doc
                .effective_serialized(doc.root())
                .map_err(|e| e.to_string())
                .and_then(|s| serde_json::to_string_pretty(&s).map_err(|e| e.to_string()));
            match json {
                Ok(s) => s + "\n",
                Err(e) => {
                    eprintln!("cexp: error: {}", e);
                    std::process::exit(1);
                }
            }
        }
    };
    print!("{}", output);

    if failed {
        std::process::exit(1);
    }
}
