mod cli;
mod engine;
mod error;
mod imagebuild;
mod kubectl;
mod manifest;
mod model;
mod output;
mod portforward;
mod replacer;
mod server;

use clap::Parser;
use output::{Level, Output};

/// Diagnostics go to stderr; `RUST_LOG` overrides the level implied by the flags.
fn init_tracing(level: Level) {
    use tracing_subscriber::EnvFilter;

    let default = match level {
        Level::Debug => "kdo=debug",
        Level::Verbose => "kdo=info",
        Level::Normal | Level::Quiet => "kdo=warn",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .compact()
        .try_init();
}

#[tokio::main]
async fn main() {
    let args = cli::Cli::parse();
    init_tracing(args.level());

    let output = Output::console(args.level());
    let code = match cli::run(args, output.clone()).await {
        Ok(code) => code,
        Err(e) => {
            output.error(format!("{e:#}"));
            1
        }
    };
    output.close();
    std::process::exit(code);
}
