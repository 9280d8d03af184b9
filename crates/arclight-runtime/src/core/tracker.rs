//! # 所有権トラッカー
//!
//! アリーナへの共有ハンドルであり、オブジェクトの割り当てと
//! 参照カウント操作の入口です。`Tracker`の複製は同じアリーナを指します。

use std::any::{Any, TypeId};
use std::fmt;
use std::sync::Arc;

use serde::Serialize;

use crate::config::TrackerConfig;
use crate::core::arena::{Arena, Entry, ErasedTeardown, TraceFn};
use crate::core::error::{Result, TrackerError};
use crate::core::memory::{Strong, Unowned, Weak};
use crate::core::types::{ObjectId, Released};
use crate::diagnostics::Trace;

/// トラッカーの統計情報
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TrackerStats {
    /// 生存中のオブジェクト数
    pub live: usize,
    /// これまでに割り当てたオブジェクト数
    pub allocated: u64,
    /// これまでに破棄したオブジェクト数
    pub destroyed: u64,
    /// スロット表の大きさ
    pub slots: usize,
    /// 再利用待ちのスロット数
    pub free_slots: usize,
}

/// 所有権トラッカー
#[derive(Clone)]
pub struct Tracker {
    arena: Arc<Arena>,
}

impl Tracker {
    /// デフォルト設定でトラッカーを作成
    pub fn new() -> Self {
        Self::with_config(TrackerConfig::default())
    }

    /// 設定を指定してトラッカーを作成
    pub fn with_config(config: TrackerConfig) -> Self {
        Self {
            arena: Arc::new(Arena::new(config)),
        }
    }

    /// 現在の設定
    pub fn config(&self) -> &TrackerConfig {
        self.arena.config()
    }

    pub(crate) fn arena(&self) -> &Arena {
        &self.arena
    }

    /// オブジェクトを強参照数1で割り当て、所有する強参照を返す
    ///
    /// `teardown`は強参照数が0になった時点でちょうど一度だけ呼ばれます。
    /// 失敗するのは資源が尽きた場合（`OutOfMemory`）のみです。
    pub fn allocate<T, F>(&self, payload: T, teardown: F) -> Result<Strong<T>>
    where
        T: Send + Sync + 'static,
        F: FnOnce(&T) + Send + 'static,
    {
        self.build(payload).teardown(teardown).allocate()
    }

    /// 診断用のラベルを付けてオブジェクトを割り当てる
    pub fn allocate_labeled<T, F>(
        &self,
        label: impl Into<Arc<str>>,
        payload: T,
        teardown: F,
    ) -> Result<Strong<T>>
    where
        T: Send + Sync + 'static,
        F: FnOnce(&T) + Send + 'static,
    {
        self.build(payload).label(label).teardown(teardown).allocate()
    }

    /// 保持する強参照を列挙できるオブジェクトを割り当てる
    ///
    /// リーク診断で循環参照を検出できるのはこの方法で割り当てたオブジェクトです。
    pub fn allocate_traced<T, F>(&self, payload: T, teardown: F) -> Result<Strong<T>>
    where
        T: Trace + Send + Sync + 'static,
        F: FnOnce(&T) + Send + 'static,
    {
        self.build(payload).teardown(teardown).traced().allocate()
    }

    /// ラベルやteardownを指定して割り当てるためのビルダー
    pub fn build<T>(&self, payload: T) -> AllocationBuilder<'_, T>
    where
        T: Send + Sync + 'static,
    {
        AllocationBuilder {
            tracker: self,
            payload,
            label: None,
            teardown: None,
            trace: None,
        }
    }

    /// 強参照数を1増やし、新しい強参照を返す
    pub fn retain<T: Send + Sync + 'static>(&self, strong: &Strong<T>) -> Strong<T> {
        strong.retain()
    }

    /// 強参照数を1減らし、0になれば破棄する
    pub fn release<T: Send + Sync + 'static>(&self, strong: Strong<T>) -> Released {
        strong.release()
    }

    /// weak参照を作成する
    pub fn downgrade<T: Send + Sync + 'static>(&self, strong: &Strong<T>) -> Weak<T> {
        strong.downgrade()
    }

    /// unowned参照を作成する
    pub fn downgrade_unowned<T: Send + Sync + 'static>(&self, strong: &Strong<T>) -> Unowned<T> {
        strong.downgrade_unowned()
    }

    /// 対象の強参照数（破棄済みなら`None`）
    pub fn strong_count(&self, id: ObjectId) -> Option<usize> {
        let slot = self.arena.slot(id.index)?;
        self.arena.strong_count(&slot, id)
    }

    /// 対象が生存しているか
    pub fn is_alive(&self, id: ObjectId) -> bool {
        self.arena
            .slot(id.index)
            .map_or(false, |slot| self.arena.is_live(&slot, id))
    }

    /// 対象のラベル
    pub fn label(&self, id: ObjectId) -> Option<Arc<str>> {
        let slot = self.arena.slot(id.index)?;
        self.arena.label(&slot, id)
    }

    /// 生の識別子で強参照数を1増やす
    ///
    /// 増えた所有権は[`Tracker::release_raw`]で一度だけ解放します。
    pub fn retain_raw(&self, id: ObjectId) -> Result<()> {
        let slot = self
            .arena
            .slot(id.index)
            .ok_or(TrackerError::StaleHandle(id))?;
        self.arena.retain_raw(&slot, id)
    }

    /// 生の識別子として保持している所有権を解放する
    ///
    /// 既に消費された所有権の解放は`DoubleRelease`として検出され、
    /// カウントは変更されません。
    pub fn release_raw(&self, id: ObjectId) -> Result<Released> {
        let slot = self
            .arena
            .slot(id.index)
            .ok_or(TrackerError::StaleHandle(id))?;
        self.arena.release_raw(&slot, id)
    }

    /// 統計情報を取得
    pub fn stats(&self) -> TrackerStats {
        let counters = self.arena.counters();
        TrackerStats {
            live: counters.live,
            allocated: counters.allocated,
            destroyed: counters.destroyed,
            slots: counters.slots,
            free_slots: counters.free_slots,
        }
    }

    /// 2つのトラッカーが同じアリーナを共有しているか
    pub fn ptr_eq(this: &Self, other: &Self) -> bool {
        Arc::ptr_eq(&this.arena, &other.arena)
    }
}

impl Default for Tracker {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Tracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tracker").field("arena", &self.arena).finish()
    }
}

/// オブジェクト割り当てのビルダー
pub struct AllocationBuilder<'a, T> {
    tracker: &'a Tracker,
    payload: T,
    label: Option<Arc<str>>,
    teardown: Option<ErasedTeardown>,
    trace: Option<TraceFn>,
}

impl<'a, T: Send + Sync + 'static> AllocationBuilder<'a, T> {
    /// 診断用のラベルを付ける
    pub fn label(mut self, label: impl Into<Arc<str>>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// 破棄時に一度だけ呼ばれるアクションを設定する
    pub fn teardown<F>(mut self, teardown: F) -> Self
    where
        F: FnOnce(&T) + Send + 'static,
    {
        self.teardown = Some(Box::new(move |payload: &(dyn Any + Send + Sync)| {
            if let Some(payload) = payload.downcast_ref::<T>() {
                teardown(payload);
            }
        }));
        self
    }

    /// 割り当てを実行する
    pub fn allocate(self) -> Result<Strong<T>> {
        let AllocationBuilder {
            tracker,
            payload,
            label,
            teardown,
            trace,
        } = self;
        let (id, slot, ptr) = tracker.arena.insert(Entry {
            payload: Arc::new(payload),
            type_id: TypeId::of::<T>(),
            teardown,
            trace,
            label,
        })?;
        Ok(Strong::from_parts(tracker.clone(), slot, id, ptr))
    }
}

impl<'a, T: Trace + Send + Sync + 'static> AllocationBuilder<'a, T> {
    /// 保持する強参照をリーク診断に報告する
    pub fn traced(mut self) -> Self {
        self.trace = Some(trace_erased::<T>);
        self
    }
}

fn trace_erased<T: Trace + 'static>(payload: &(dyn Any + Send + Sync), visit: &mut dyn FnMut(ObjectId)) {
    if let Some(payload) = payload.downcast_ref::<T>() {
        payload.trace(visit);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_label() {
        let tracker = Tracker::new();
        let person = tracker.build(42u32).label("Eric").allocate().unwrap();
        assert_eq!(person.label().as_deref(), Some("Eric"));
        assert_eq!(tracker.label(person.id()).as_deref(), Some("Eric"));
        let id = person.id();
        drop(person);
        assert_eq!(tracker.label(id), None);
    }

    #[test]
    fn test_allocate_labeled() {
        let tracker = Tracker::new();
        let john = tracker
            .allocate_labeled("John Appleseed", 7u8, |_| {})
            .unwrap();
        assert_eq!(john.label().as_deref(), Some("John Appleseed"));
        assert_eq!(*john, 7);
    }

    #[test]
    fn test_stats_follow_lifecycle() {
        let tracker = Tracker::new();
        let a = tracker.allocate(1u8, |_| {}).unwrap();
        let b = tracker.allocate(2u8, |_| {}).unwrap();
        assert_eq!(tracker.stats().live, 2);
        tracker.release(a);
        let stats = tracker.stats();
        assert_eq!(stats.live, 1);
        assert_eq!(stats.allocated, 2);
        assert_eq!(stats.destroyed, 1);
        assert_eq!(stats.free_slots, 1);
        drop(b);
        assert_eq!(tracker.stats().live, 0);
    }

    #[test]
    fn test_unknown_index_is_stale() {
        let tracker = Tracker::new();
        let id = ObjectId::new(99, 0);
        assert_eq!(tracker.release_raw(id), Err(TrackerError::StaleHandle(id)));
        assert_eq!(tracker.retain_raw(id), Err(TrackerError::StaleHandle(id)));
        assert!(!tracker.is_alive(id));
        assert_eq!(tracker.strong_count(id), None);
    }

    #[test]
    fn test_clones_share_arena() {
        let tracker = Tracker::new();
        let other = tracker.clone();
        assert!(Tracker::ptr_eq(&tracker, &other));
        assert!(!Tracker::ptr_eq(&tracker, &Tracker::new()));
    }
}
