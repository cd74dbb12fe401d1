mod commands;

use clap::{Parser, Subcommand};
use commands::config::OutputFormat;
use commands::simulate::SimulateArgs;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "armcoord")]
#[command(about = "共有リソースへの変更を、ロックと収束待ちで安全に。", long_about = None)]
struct Cli {
    /// 設定ファイルのパス（省略時は自動検出）
    #[arg(short, long, global = true, env = "ARMCOORD_CONFIG_PATH")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// シミュレートしたネットワークに並行更新をかける
    Simulate(SimulateArgs),
    /// 解決済みの設定を表示
    Config {
        /// 出力形式
        #[arg(short, long, value_enum, default_value_t = OutputFormat::Yaml)]
        format: OutputFormat,
    },
    /// バージョン情報を表示
    Version,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // ログはstderrへ（stdoutは結果出力用）
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    // Versionコマンドは設定ファイル不要
    if matches!(cli.command, Commands::Version) {
        println!("armcoord {}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    let (settings, source) = armcoord_config::load_settings(cli.config.as_deref())?;
    tracing::debug!(source = ?source, "Settings resolved");

    match cli.command {
        Commands::Simulate(args) => commands::simulate::handle(&settings, args).await?,
        Commands::Config { format } => {
            commands::config::handle(&settings, source.as_deref(), format)?
        }
        Commands::Version => {
            unreachable!("Version is handled before config loading");
        }
    }

    Ok(())
}
