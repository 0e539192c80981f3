//! `patch-pipeline`: run one generator reply through the patch pipeline.
//!
//! Reads the raw reply from `--input` (or stdin), applies it to the project
//! tree and prints the cycle report as JSON on stdout.
//!
//! ## Exit codes
//!
//! - `0`: the cycle was accepted
//! - `1`: bad arguments, bad configuration or a fatal pipeline error
//! - `2`: the cycle finished without being accepted
//!
//! ## Environment Variables
//!
//! - `LOG_FORMAT=json`: structured JSON logs on stderr
//! - `RUST_LOG=info`: log level filter

use std::path::PathBuf;

use tokio::io::AsyncReadExt;
use tokio_patch_pipeline::{
    config::export_schema, init_tracing, load_from_file, PatchCycle, PipelineConfig,
};
use tracing::{error, info};

/// Parsed CLI arguments.
struct Args {
    /// TOML configuration file.
    config: Option<PathBuf>,
    /// Overrides `project.root`.
    root: Option<PathBuf>,
    /// File holding the generator reply; `None` reads stdin.
    input: Option<PathBuf>,
    /// Print the configuration JSON schema and exit.
    schema: bool,
}

/// Parse command-line arguments manually (no external arg parser dependency).
///
/// # Returns
///
/// - `Ok(Args)` on success
/// - `Err(String)` with a usage message on failure
fn parse_args() -> Result<Args, String> {
    let args: Vec<String> = std::env::args().collect();
    let mut config = None;
    let mut root = None;
    let mut input = None;
    let mut schema = false;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--config" | "-c" => {
                i += 1;
                if i >= args.len() {
                    return Err("--config requires a value".to_string());
                }
                config = Some(PathBuf::from(&args[i]));
            }
            "--root" | "-r" => {
                i += 1;
                if i >= args.len() {
                    return Err("--root requires a value".to_string());
                }
                root = Some(PathBuf::from(&args[i]));
            }
            "--input" | "-i" => {
                i += 1;
                if i >= args.len() {
                    return Err("--input requires a value".to_string());
                }
                if args[i] != "-" {
                    input = Some(PathBuf::from(&args[i]));
                }
            }
            "--schema" => {
                schema = true;
            }
            "--help" | "-h" => {
                return Err(usage());
            }
            other => {
                return Err(format!("unknown argument: {other}\n{}", usage()));
            }
        }
        i += 1;
    }

    Ok(Args {
        config,
        root,
        input,
        schema,
    })
}

/// Usage text.
fn usage() -> String {
    [
        "Usage: patch-pipeline [OPTIONS]",
        "",
        "Options:",
        "  --config, -c <FILE>   Pipeline configuration (TOML)",
        "  --root, -r <DIR>      Project root (overrides project.root)",
        "  --input, -i <FILE>    Generator reply to apply (default: stdin)",
        "  --schema              Print the configuration JSON schema and exit",
        "  --help, -h            Show this help message",
    ]
    .join("\n")
}

async fn read_reply(input: Option<&PathBuf>) -> std::io::Result<String> {
    match input {
        Some(path) => tokio::fs::read_to_string(path).await,
        None => {
            let mut buf = String::new();
            tokio::io::stdin().read_to_string(&mut buf).await?;
            Ok(buf)
        }
    }
}

#[tokio::main]
async fn main() {
    let _ = init_tracing();

    let args = match parse_args() {
        Ok(args) => args,
        Err(msg) => {
            eprintln!("{msg}");
            std::process::exit(1);
        }
    };

    if args.schema {
        match export_schema() {
            Ok(schema) => {
                println!("{schema}");
                return;
            }
            Err(e) => {
                eprintln!("schema export failed: {e}");
                std::process::exit(1);
            }
        }
    }

    let mut config = match &args.config {
        Some(path) => match load_from_file(path) {
            Ok(c) => c,
            Err(e) => {
                eprintln!("{e}");
                std::process::exit(1);
            }
        },
        None => PipelineConfig::default(),
    };
    if let Some(root) = args.root {
        config.project.root = root;
    }

    let cycle = match PatchCycle::from_config(&config) {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "pipeline setup failed");
            eprintln!("{e}");
            std::process::exit(1);
        }
    };

    let raw = match read_reply(args.input.as_ref()).await {
        Ok(raw) => raw,
        Err(e) => {
            eprintln!("failed to read generator reply: {e}");
            std::process::exit(1);
        }
    };

    info!(root = %config.project.root.display(), "running patch cycle");
    let report = match cycle.run_reply(&raw).await {
        Ok(r) => r,
        Err(e) => {
            error!(error = %e, "patch cycle aborted");
            eprintln!("{e}");
            std::process::exit(1);
        }
    };

    match serde_json::to_string_pretty(&report) {
        Ok(json) => println!("{json}"),
        Err(e) => {
            eprintln!("failed to serialize report: {e}");
            std::process::exit(1);
        }
    }

    if !report.outcome.is_accepted() {
        std::process::exit(2);
    }
}
