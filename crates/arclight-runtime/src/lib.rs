//! arclightランタイム
//!
//! 参照カウントによる所有権モデルを提供するライブラリです。
//! 強参照が0になった瞬間にオブジェクトを同期的に破棄し、
//! weak参照・unowned参照による非所有の観測をサポートします。
//!
//! 循環参照の自動回収は行いません。強参照だけで構成された循環は
//! 意図的にリークし、`diagnostics`モジュールで検出のみ行えます。

/// コアモジュール：アリーナ、参照ハンドル、トラッカー
pub mod core;

/// トラッカーの設定
pub mod config;

/// リーク・循環参照の診断
pub mod diagnostics;

pub use crate::config::{ArenaConfig, ConfigError, DiagnosticsConfig, TrackerConfig};
pub use crate::core::{
    AllocationBuilder, ObjectId, Released, Result, Strong, Tracker, TrackerError, TrackerStats,
    Unowned, Weak,
};
pub use crate::diagnostics::{LeakDetector, LeakReport, LeakedCycle, LiveObject, Trace};

/// ライブラリのバージョン情報
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
