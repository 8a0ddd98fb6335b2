use std::path::PathBuf;

use clap::Parser;
use tracing::Level;

mod continuation;
mod handoff;
mod parent;
mod session;

/// In-container process supervisor: becomes PID 1 of a fresh set of
/// namespaces and serves command sessions over a Unix-domain socket.
#[derive(Parser)]
#[command(version, about)]
pub(crate) struct Cli {
    /// Directory where the listening socket is placed
    #[arg(long, default_value = "run")]
    pub(crate) run: PathBuf,

    /// Directory containing the bootstrap hooks
    #[arg(long, default_value = "lib")]
    pub(crate) lib: PathBuf,

    /// Directory that will become root in the new mount namespace
    #[arg(long, default_value = "root")]
    pub(crate) root: PathBuf,

    /// Kernel-visible process title for the serving supervisor
    #[arg(long)]
    pub(crate) title: Option<String>,

    /// Resume after the in-namespace re-exec (internal)
    #[arg(long, hide = true)]
    r#continue: bool,
}

fn main() {
    tracing_subscriber::fmt()
        .with_max_level(if cfg!(debug_assertions) {
            Level::TRACE
        } else {
            Level::INFO
        })
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let result = if cli.r#continue {
        continuation::run()
    } else {
        parent::run(&cli)
    };

    if let Err(e) = result {
        eprintln!("supervisor: {e:#}");
        std::process::exit(1);
    }
}
