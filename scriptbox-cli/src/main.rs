mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use scriptbox_common::FileReference;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "scriptbox")]
#[command(about = "Run scripts in a pooled V8 sandbox")]
#[command(version = "0.2.0")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Execute a script and print its result envelope
    Run {
        /// Script file to execute
        script: PathBuf,

        /// JSON file holding an object of global bindings
        #[arg(short, long)]
        globals: Option<PathBuf>,

        /// File proxy to install, as `tree.path=location` (repeatable)
        #[arg(short, long = "file", value_parser = commands::parse_file_reference)]
        files: Vec<FileReference>,

        /// Execution timeout in milliseconds (default: from config)
        #[arg(short, long)]
        timeout_ms: Option<u64>,

        /// Read file proxies from the sandbox working directory
        #[arg(long)]
        local_files: bool,

        /// TOML configuration file
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Verbose logging
        #[arg(short, long)]
        verbose: bool,
    },
}

fn init_logging(verbose: bool) {
    let default = if verbose {
        "scriptbox_sandbox=debug,scriptbox::script=info"
    } else {
        "warn"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            script,
            globals,
            files,
            timeout_ms,
            local_files,
            config,
            verbose,
        } => {
            init_logging(verbose);
            let args = commands::RunArgs {
                script,
                globals,
                files,
                timeout_ms,
                local_files,
                config,
            };
            let code = commands::execute_run(args).await?;
            if code != 0 {
                std::process::exit(code);
            }
            Ok(())
        }
    }
}
