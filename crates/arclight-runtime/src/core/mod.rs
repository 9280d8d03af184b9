//! # arclightのコアモジュール
//!
//! オブジェクトを格納するアリーナと、その上に構築された
//! 強参照・weak参照・unowned参照のハンドルを提供します。

/// オブジェクト識別子などの基本型
pub mod types;

/// エラー処理関連の型
pub mod error;

/// スロットと参照カウントの管理
pub(crate) mod arena;

/// 参照ハンドル（Strong / Weak / Unowned）
pub mod memory;

/// トラッカー本体
pub mod tracker;

pub use self::error::{Result, TrackerError};
pub use self::memory::{Strong, Unowned, Weak};
pub use self::tracker::{AllocationBuilder, Tracker, TrackerStats};
pub use self::types::{ObjectId, Released};
