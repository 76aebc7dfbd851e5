use clap::Parser;
use std::path::PathBuf;

/// Command-line overrides for the environment-backed configuration.
#[derive(Parser, Debug)]
#[command(name = "plugin-pilot")]
#[command(about = "Plugin lifecycle controller")]
#[command(version)]
pub struct Cli {
    /// Bind address
    #[arg(long, env = "SERVICE_HOST")]
    pub host: Option<String>,

    /// Bind port
    #[arg(long, env = "SERVICE_PORT")]
    pub port: Option<u16>,

    /// Metadata store directory
    #[arg(long, env = "DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Root directory for per-pipeline working trees
    #[arg(long, env = "WORK_ROOT")]
    pub work_root: Option<PathBuf>,
}
