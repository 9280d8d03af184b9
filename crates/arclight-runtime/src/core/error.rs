//! # エラー処理モジュール
//!
//! トラッカーの操作で発生するエラーを定義します。
//! `OutOfMemory`は呼び出し側で回復可能なエラーです。
//! `DoubleRelease`と`UseAfterFree`はプログラマの誤りを表し、
//! 型付きAPIでは即座にパニックとして報告されます。

use thiserror::Error;

use crate::core::types::ObjectId;

/// トラッカーのエラー型
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TrackerError {
    /// アロケーションを続行できない
    #[error("メモリ不足: {reason} (生存オブジェクト数: {live})")]
    OutOfMemory {
        /// 割り当て時点の生存オブジェクト数
        live: usize,
        /// 失敗の理由
        reason: String,
    },

    /// 既に消費された所有権をもう一度解放しようとした
    #[error("二重解放: オブジェクト {0} の所有権は既に解放されています")]
    DoubleRelease(ObjectId),

    /// 破棄済みオブジェクトへのunowned参照アクセス
    #[error("解放後使用: オブジェクト {0} は既に破棄されています")]
    UseAfterFree(ObjectId),

    /// このトラッカーが発行していない識別子
    #[error("無効なハンドル: オブジェクト {0} はこのトラッカーで割り当てられていません")]
    StaleHandle(ObjectId),

    /// ペイロードの型が要求と異なる
    #[error("型の不一致: オブジェクト {0} のペイロード型が要求された型と異なります")]
    TypeMismatch(ObjectId),
}

impl TrackerError {
    /// プログラマの誤りを表すエラーかどうか
    ///
    /// これらは再試行しても解決せず、状態の破損を防ぐため即座に報告されるべきです。
    pub fn is_programmer_error(&self) -> bool {
        matches!(
            self,
            TrackerError::DoubleRelease(_) | TrackerError::UseAfterFree(_)
        )
    }

    /// 対象オブジェクトの識別子
    pub fn object(&self) -> Option<ObjectId> {
        match self {
            TrackerError::OutOfMemory { .. } => None,
            TrackerError::DoubleRelease(id)
            | TrackerError::UseAfterFree(id)
            | TrackerError::StaleHandle(id)
            | TrackerError::TypeMismatch(id) => Some(*id),
        }
    }
}

/// 結果型のエイリアス
pub type Result<T, E = TrackerError> = std::result::Result<T, E>;

/// 型付きAPIで検出されたプログラマの誤りを報告して停止する
#[cold]
#[track_caller]
pub(crate) fn fatal(error: TrackerError) -> ! {
    log::error!("致命的なエラーが発生しました: {}", error);
    panic!("{}", error);
}
