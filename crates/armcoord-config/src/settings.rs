//! 設定ファイルのモデル

use crate::error::{ConfigError, Result};
use armcoord_cloud::PollConfig;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::time::Duration;

/// 操作の種類（タイムアウトの選択に使う）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    Create,
    Read,
    Update,
    Delete,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OperationKind::Create => "create",
            OperationKind::Read => "read",
            OperationKind::Update => "update",
            OperationKind::Delete => "delete",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub timeouts: Timeouts,
    #[serde(default)]
    pub polling: PollConfig,
    #[serde(default)]
    pub locks: LockSettings,
}

/// 操作ごとのタイムアウト（秒）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Timeouts {
    #[serde(default = "default_write_timeout")]
    pub create_secs: u64,
    #[serde(default = "default_read_timeout")]
    pub read_secs: u64,
    #[serde(default = "default_write_timeout")]
    pub update_secs: u64,
    #[serde(default = "default_write_timeout")]
    pub delete_secs: u64,
}

fn default_write_timeout() -> u64 {
    30 * 60
}
fn default_read_timeout() -> u64 {
    5 * 60
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            create_secs: default_write_timeout(),
            read_secs: default_read_timeout(),
            update_secs: default_write_timeout(),
            delete_secs: default_write_timeout(),
        }
    }
}

impl Timeouts {
    pub fn for_operation(&self, kind: OperationKind) -> Duration {
        let secs = match kind {
            OperationKind::Create => self.create_secs,
            OperationKind::Read => self.read_secs,
            OperationKind::Update => self.update_secs,
            OperationKind::Delete => self.delete_secs,
        };
        Duration::from_secs(secs)
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct LockSettings {
    /// ロック取得の待ち時間の上限（未設定なら操作のタイムアウトまで待つ）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acquire_timeout_secs: Option<u64>,
}

impl LockSettings {
    pub fn acquire_timeout(&self) -> Option<Duration> {
        self.acquire_timeout_secs.map(Duration::from_secs)
    }
}

/// 設定できるタイムアウトの上限（7日）
pub const MAX_TIMEOUT_SECS: u64 = 7 * 24 * 60 * 60;

fn invalid(field: &str, reason: &str) -> ConfigError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        reason: reason.to_string(),
    }
}

impl Settings {
    /// 設定ファイルを読み込んで検証
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let settings: Settings =
            serde_yaml::from_str(&content).map_err(|source| ConfigError::Parse {
                path: path.display().to_string(),
                source,
            })?;
        settings.validate()?;
        tracing::debug!(path = %path.display(), "設定をロードしました");
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        for (field, secs) in [
            ("timeouts.create_secs", self.timeouts.create_secs),
            ("timeouts.read_secs", self.timeouts.read_secs),
            ("timeouts.update_secs", self.timeouts.update_secs),
            ("timeouts.delete_secs", self.timeouts.delete_secs),
        ] {
            if secs == 0 {
                return Err(invalid(field, "正の値を指定してください"));
            }
            if secs > MAX_TIMEOUT_SECS {
                return Err(invalid(field, &format!("{MAX_TIMEOUT_SECS} 秒以下を指定してください")));
            }
        }

        let polling = &self.polling;
        if polling.poll_interval_ms == 0 {
            return Err(invalid("polling.poll_interval_ms", "正の値を指定してください"));
        }
        if polling.max_poll_interval_ms < polling.poll_interval_ms {
            return Err(invalid(
                "polling.max_poll_interval_ms",
                "polling.poll_interval_ms 以上を指定してください",
            ));
        }
        if !polling.backoff_multiplier.is_finite() || polling.backoff_multiplier < 1.0 {
            return Err(invalid("polling.backoff_multiplier", "1.0 以上を指定してください"));
        }
        if polling.continuous_target_occurrence == 0 {
            return Err(invalid(
                "polling.continuous_target_occurrence",
                "1 以上を指定してください",
            ));
        }

        match self.locks.acquire_timeout_secs {
            Some(0) => {
                return Err(invalid("locks.acquire_timeout_secs", "正の値を指定してください"));
            }
            Some(secs) if secs > MAX_TIMEOUT_SECS => {
                return Err(invalid(
                    "locks.acquire_timeout_secs",
                    &format!("{MAX_TIMEOUT_SECS} 秒以下を指定してください"),
                ));
            }
            _ => {}
        }
        Ok(())
    }
}
