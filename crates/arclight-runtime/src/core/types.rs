//! # 基本型
//!
//! オブジェクトの識別子と、解放操作の結果を表す型を定義します。

use std::fmt;

use serde::{Deserialize, Serialize};

/// オブジェクトの識別子
///
/// アリーナのスロット番号と、そのスロットを占有していた世代の組です。
/// オブジェクトが破棄されるとスロットの世代が進むため、
/// 破棄済みオブジェクトのIDが再利用後の別オブジェクトを指すことはありません。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectId {
    /// スロット番号
    pub index: u32,
    /// 世代
    pub generation: u32,
}

impl ObjectId {
    /// 新しい識別子を作成
    pub const fn new(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}.{}", self.index, self.generation)
    }
}

/// `release`の結果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Released {
    /// まだ強参照が残っている
    Retained {
        /// 残りの強参照数
        remaining: usize,
    },
    /// 強参照が0になり、破棄処理が完了した
    Destroyed,
}

impl Released {
    /// 破棄されたかどうか
    pub fn is_destroyed(&self) -> bool {
        matches!(self, Released::Destroyed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_id_display() {
        assert_eq!(ObjectId::new(3, 7).to_string(), "#3.7");
    }

    #[test]
    fn test_object_id_ordering() {
        let a = ObjectId::new(0, 1);
        let b = ObjectId::new(1, 0);
        assert!(a < b, "スロット番号が優先されるべきです");
    }
}
