mod edgetunnel;

use clap::Parser;

#[derive(Debug, Parser)]
#[command(
    name = "edgetunnel",
    version,
    about = "edgetunnel - overlay tunnel network between peers"
)]
struct Cli {
    /// Path to edgetunnel config file (.toml/.yaml/.yml). If omitted, uses EDGETUNNEL_CONFIG; then auto-detects edgetunnel.toml > edgetunnel.yaml > edgetunnel.yml from CWD; then falls back to the OS default path (Linux: /etc/edgetunnel/edgetunnel.toml; others: user config dir).
    #[arg(long, env = "EDGETUNNEL_CONFIG")]
    config: Option<std::path::PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    edgetunnel::run(cli.config).await
}
