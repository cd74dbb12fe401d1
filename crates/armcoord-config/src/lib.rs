pub mod error;
pub mod settings;

pub use error::*;
pub use settings::{LockSettings, MAX_TIMEOUT_SECS, OperationKind, Settings, Timeouts};

use std::path::{Path, PathBuf};

/// 設定ファイルを直接指定する環境変数
pub const CONFIG_PATH_ENV: &str = "ARMCOORD_CONFIG_PATH";

const CANDIDATES: [&str; 2] = ["armcoord.yaml", ".armcoord.yaml"];

/// ArmCoordのグローバル設定ディレクトリ (`~/.config/armcoord`)
pub fn get_config_dir() -> Result<PathBuf> {
    let config_dir = dirs::config_dir()
        .ok_or(ConfigError::ConfigDirNotFound)?
        .join("armcoord");
    Ok(config_dir)
}

/// 設定ファイルを探す
///
/// 以下の優先順位で設定ファイルを検索:
/// 1. 環境変数 ARMCOORD_CONFIG_PATH (直接パス指定)
/// 2. カレントディレクトリ: armcoord.yaml, .armcoord.yaml
/// 3. ./.armcoord/config.yaml
/// 4. ~/.config/armcoord/config.yaml (グローバル設定)
pub fn find_config_file() -> Result<PathBuf> {
    // 1. 環境変数で直接指定
    if let Ok(config_path) = std::env::var(CONFIG_PATH_ENV) {
        let path = PathBuf::from(config_path);
        if path.exists() {
            return Ok(path);
        }
        tracing::warn!(path = %path.display(), "{CONFIG_PATH_ENV} のファイルが存在しません");
    }

    // 2. カレントディレクトリで検索
    let current_dir = std::env::current_dir()?;
    for filename in &CANDIDATES {
        let path = current_dir.join(filename);
        if path.exists() {
            return Ok(path);
        }
    }

    // 3. ./.armcoord/ ディレクトリで検索
    let local = current_dir.join(".armcoord").join("config.yaml");
    if local.is_file() {
        return Ok(local);
    }

    // 4. グローバル設定ファイル
    if let Ok(config_dir) = get_config_dir() {
        let global_config = config_dir.join("config.yaml");
        if global_config.exists() {
            return Ok(global_config);
        }
    }

    // どの設定ファイルも見つからなかった
    Err(ConfigError::ConfigFileNotFound)
}

/// 設定をロード
///
/// `path` 未指定時は [`find_config_file`] で探し、見つからなければデフォルト値を使う
pub fn load_settings(path: Option<&Path>) -> Result<(Settings, Option<PathBuf>)> {
    let path = match path {
        Some(path) => path.to_path_buf(),
        None => match find_config_file() {
            Ok(path) => path,
            Err(ConfigError::ConfigFileNotFound) => {
                tracing::debug!("設定ファイルなし、デフォルト値を使用");
                return Ok((Settings::default(), None));
            }
            Err(e) => return Err(e),
        },
    };

    let settings = Settings::from_file(&path)?;
    Ok((settings, Some(path)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::fs;

    #[test]
    fn test_get_config_dir() {
        let config_dir = get_config_dir().unwrap();
        assert!(config_dir.ends_with("armcoord"));
    }

    #[test]
    #[serial]
    fn test_find_config_file_in_current_dir() {
        let temp_dir = tempfile::tempdir().unwrap();
        let original_dir = std::env::current_dir().unwrap();

        fs::write(temp_dir.path().join("armcoord.yaml"), "{}").unwrap();

        std::env::set_current_dir(&temp_dir).unwrap();

        let result = find_config_file();
        assert!(result.is_ok());
        assert!(result.unwrap().ends_with("armcoord.yaml"));

        std::env::set_current_dir(original_dir).unwrap();
    }

    #[test]
    #[serial]
    fn test_visible_file_takes_priority_over_hidden() {
        let temp_dir = tempfile::tempdir().unwrap();
        let original_dir = std::env::current_dir().unwrap();

        fs::write(temp_dir.path().join("armcoord.yaml"), "{}").unwrap();
        fs::write(temp_dir.path().join(".armcoord.yaml"), "{}").unwrap();

        std::env::set_current_dir(&temp_dir).unwrap();

        let result = find_config_file().unwrap();
        assert!(result.ends_with("armcoord.yaml"));
        assert!(!result.ends_with(".armcoord.yaml"));

        std::env::set_current_dir(original_dir).unwrap();
    }

    #[test]
    #[serial]
    fn test_find_config_file_in_project_dir() {
        let temp_dir = tempfile::tempdir().unwrap();
        let original_dir = std::env::current_dir().unwrap();

        let project_dir = temp_dir.path().join(".armcoord");
        fs::create_dir(&project_dir).unwrap();
        fs::write(project_dir.join("config.yaml"), "{}").unwrap();

        std::env::set_current_dir(&temp_dir).unwrap();

        let result = find_config_file().unwrap();
        assert!(result.ends_with(".armcoord/config.yaml"));

        std::env::set_current_dir(original_dir).unwrap();
    }

    #[test]
    #[serial]
    fn test_find_config_file_env_var() {
        let temp_dir = tempfile::tempdir().unwrap();
        let config_path = temp_dir.path().join("custom.yaml");
        fs::write(&config_path, "{}").unwrap();

        unsafe {
            std::env::set_var(CONFIG_PATH_ENV, config_path.to_str().unwrap());
        }

        let result = find_config_file().unwrap();
        assert_eq!(result, config_path);

        unsafe {
            std::env::remove_var(CONFIG_PATH_ENV);
        }
    }

    #[test]
    #[serial]
    fn test_load_settings_falls_back_to_defaults() {
        let temp_dir = tempfile::tempdir().unwrap();
        let original_dir = std::env::current_dir().unwrap();

        std::env::set_current_dir(&temp_dir).unwrap();

        let result = find_config_file();
        assert!(matches!(result, Err(ConfigError::ConfigFileNotFound)));

        let (settings, path) = load_settings(None).unwrap();
        assert_eq!(settings, Settings::default());
        assert!(path.is_none());

        std::env::set_current_dir(original_dir).unwrap();
    }

    #[test]
    fn test_load_settings_from_explicit_path() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("settings.yaml");
        fs::write(&path, "polling:\n  poll_interval_ms: 250\n").unwrap();

        let (settings, loaded_from) = load_settings(Some(&path)).unwrap();
        assert_eq!(settings.polling.poll_interval_ms, 250);
        assert_eq!(loaded_from, Some(path));
    }

    #[test]
    fn test_load_settings_reports_parse_errors() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("broken.yaml");
        fs::write(&path, "timeouts: [not, a, map]\n").unwrap();

        let err = load_settings(Some(&path)).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
        assert!(err.to_string().contains("broken.yaml"));
    }
}
