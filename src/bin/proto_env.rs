//! Proto Env CLI
//!
//! Lists the files a reference resolves to, converts images between
//! encodings, and prints the resolved configuration.

use std::io::Write;
use std::sync::Arc;

use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand};
use proto_env::{ConfigResolver, Context, EnvReader, ImageWriter, ReadRequest, SystemContainer};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "proto-env")]
#[command(about = "Resolve schema references and convert schema images")]
struct Cli {
    /// Config override: inline TOML/JSON, or a path to a .toml/.json file
    #[arg(long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List the files a reference resolves to
    LsFiles {
        /// Source or image reference
        #[arg(default_value = ".")]
        input: String,
    },

    /// Convert an image to another encoding
    Convert {
        /// Image reference to read ("-" for stdin)
        input: String,
        /// Output reference ("-" for stdout)
        #[arg(short, long, default_value = "-")]
        output: String,
        /// Only keep these files (and their imports)
        #[arg(long = "path")]
        paths: Vec<String>,
        /// Drop files that are only present as imports
        #[arg(long)]
        exclude_imports: bool,
        /// Drop source code info
        #[arg(long)]
        exclude_source_info: bool,
        /// Write a plain descriptor set without private extensions
        #[arg(long)]
        as_file_descriptor_set: bool,
    },

    /// Print the resolved configuration as TOML
    Config,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    if let Err(e) = run(cli) {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    let ctx = Context::background();
    let configs = Arc::new(ConfigResolver::default());
    let reader = EnvReader::new(configs).with_flag("--input");
    let container = SystemContainer::new(true);

    match cli.command {
        Commands::LsFiles { input } => {
            let files = reader.list_files(&ctx, &container, &input, cli.config.as_deref())?;
            let stdout = std::io::stdout();
            let mut out = stdout.lock();
            for file in files {
                writeln!(out, "{}", file)?;
            }
        }

        Commands::Convert {
            input,
            output,
            paths,
            exclude_imports,
            exclude_source_info,
            as_file_descriptor_set,
        } => {
            let mut request = ReadRequest::new(input)
                .paths(paths)
                .include_imports(!exclude_imports)
                .include_source_info(!exclude_source_info);
            if let Some(config) = cli.config {
                request = request.config_override(config);
            }
            let env = reader.read_image_env(&ctx, &container, &request)?;

            let stdout = std::io::stdout();
            let mut out = stdout.lock();
            ImageWriter::new()
                .with_flag("--output")
                .write_image(&ctx, &mut out, &output, as_file_descriptor_set, &env.image)
                .with_context(|| format!("writing {}", output))?;
        }

        Commands::Config => {
            let config = reader.get_config(&ctx, cli.config.as_deref())?;
            print!("{}", config.to_toml()?);
        }
    }

    Ok(())
}
