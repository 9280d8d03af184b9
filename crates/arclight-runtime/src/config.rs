//! トラッカーの設定
//!
//! TOMLファイルから読み込めます。
//!
//! ```toml
//! [arena]
//! initial_capacity = 64
//! max_objects = 1024
//!
//! [diagnostics]
//! log_lifecycle = true
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 設定の読み込みエラー
#[derive(Error, Debug)]
pub enum ConfigError {
    /// 設定ファイルを読み込めない
    #[error("設定ファイル {path} を読み込めません: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// TOMLの構文・型エラー
    #[error("設定の解析に失敗しました: {0}")]
    Parse(#[from] toml::de::Error),

    /// 値が不正
    #[error("不正な設定値: {0}")]
    Invalid(String),
}

/// トラッカーの設定
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackerConfig {
    /// アリーナ設定
    #[serde(default)]
    pub arena: ArenaConfig,

    /// 診断設定
    #[serde(default)]
    pub diagnostics: DiagnosticsConfig,
}

/// アリーナ設定
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArenaConfig {
    /// 最初に確保しておくスロット数
    #[serde(default = "default_initial_capacity")]
    pub initial_capacity: usize,

    /// 同時に生存できるオブジェクト数の上限
    #[serde(default)]
    pub max_objects: Option<usize>,
}

/// 診断設定
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiagnosticsConfig {
    /// 割り当て・破棄をdebugレベルでログ出力する
    #[serde(default = "default_true")]
    pub log_lifecycle: bool,
}

/// 事前確保できるスロット数の上限
pub const MAX_INITIAL_CAPACITY: usize = 1 << 20;

fn default_initial_capacity() -> usize {
    64
}

fn default_true() -> bool {
    true
}

impl Default for ArenaConfig {
    fn default() -> Self {
        Self {
            initial_capacity: default_initial_capacity(),
            max_objects: None,
        }
    }
}

impl Default for DiagnosticsConfig {
    fn default() -> Self {
        Self {
            log_lifecycle: default_true(),
        }
    }
}

impl TrackerConfig {
    /// TOML文字列から設定を読み込む
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        let config: TrackerConfig = toml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    /// 設定ファイルを読み込む
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let source = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        log::debug!("設定ファイルを読み込みました: {}", path.display());
        Self::from_toml_str(&source)
    }

    /// 上限付きの設定を作成
    pub fn with_max_objects(mut self, max_objects: usize) -> Self {
        self.arena.max_objects = Some(max_objects);
        self
    }

    /// 設定値を検証
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.arena.max_objects == Some(0) {
            return Err(ConfigError::Invalid(
                "arena.max_objects は1以上である必要があります".to_string(),
            ));
        }
        if self.arena.initial_capacity > MAX_INITIAL_CAPACITY {
            return Err(ConfigError::Invalid(format!(
                "arena.initial_capacity ({}) は {} 以下である必要があります",
                self.arena.initial_capacity, MAX_INITIAL_CAPACITY
            )));
        }
        if let Some(max) = self.arena.max_objects {
            if self.arena.initial_capacity > max {
                log::warn!(
                    "arena.initial_capacity ({}) が max_objects ({}) を超えています",
                    self.arena.initial_capacity,
                    max
                );
            }
        }
        Ok(())
    }
}
