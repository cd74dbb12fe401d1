use armcoord_config::Settings;
use clap::ValueEnum;
use colored::Colorize;
use std::path::Path;

#[derive(Debug, Clone, Copy, Default, ValueEnum)]
pub enum OutputFormat {
    #[default]
    Yaml,
    Json,
}

/// 解決済みの設定を表示
pub fn handle(settings: &Settings, source: Option<&Path>, format: OutputFormat) -> anyhow::Result<()> {
    match source {
        Some(path) => eprintln!("設定ファイル: {}", path.display().to_string().cyan()),
        None => eprintln!("設定ファイル: {}", "(defaults)".dimmed()),
    }

    let rendered = match format {
        OutputFormat::Yaml => serde_yaml::to_string(settings)?,
        OutputFormat::Json => serde_json::to_string_pretty(settings)?,
    };
    println!("{}", rendered.trim_end());
    Ok(())
}
