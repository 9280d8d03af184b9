//! # スロットと参照カウントの管理
//!
//! オブジェクトは世代付きスロットの表に格納されます。
//! 各スロットは自身の状態をMutexで保護しており、
//! カウントの増減・ゼロ判定・破棄の開始はすべてこのロックの中で行われます。
//! 破棄処理（teardownの呼び出しとペイロードの解放）はロックの外で行うため、
//! 連鎖的な解放が同じスロットに再入することはありません。

use std::any::{Any, TypeId};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use log::{debug, trace, warn};
use parking_lot::{Mutex, MutexGuard, RwLock};

use crate::config::TrackerConfig;
use crate::core::error::{Result, TrackerError};
use crate::core::types::{ObjectId, Released};
use crate::diagnostics::LiveObject;

/// 型消去されたペイロード
pub(crate) type Payload = Arc<dyn Any + Send + Sync>;

/// 型消去されたteardownアクション
pub(crate) type ErasedTeardown = Box<dyn FnOnce(&(dyn Any + Send + Sync)) + Send>;

/// ペイロードが保持する強参照を列挙する関数
pub(crate) type TraceFn = fn(&(dyn Any + Send + Sync), &mut dyn FnMut(ObjectId));

/// ペイロードへのポインタ
///
/// 強参照が1つ以上残っている間だけ有効です。
pub(crate) type PayloadPtr = NonNull<dyn Any + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// 未使用（フリーリストに登録済み、または登録待ち）
    Vacant,
    /// 生存中
    Alive,
    /// 破棄処理の実行中
    TearingDown,
}

struct SlotState {
    generation: u32,
    phase: Phase,
    /// 世代を使い切ったスロットは再利用しない
    exhausted: bool,
    strong: usize,
    /// `strong`のうち、生のIDとして外に出ている所有権の数
    raw: usize,
    payload: Option<Payload>,
    type_id: Option<TypeId>,
    teardown: Option<ErasedTeardown>,
    trace: Option<TraceFn>,
    label: Option<Arc<str>>,
}

/// 破棄処理に引き渡す内容
struct Dying {
    payload: Option<Payload>,
    teardown: Option<ErasedTeardown>,
    label: Option<Arc<str>>,
}

impl SlotState {
    fn vacant() -> Self {
        Self {
            generation: 0,
            phase: Phase::Vacant,
            exhausted: false,
            strong: 0,
            raw: 0,
            payload: None,
            type_id: None,
            teardown: None,
            trace: None,
            label: None,
        }
    }

    fn is_live(&self, id: ObjectId) -> bool {
        self.phase == Phase::Alive && self.generation == id.generation
    }

    /// 生存していない識別子を分類する
    ///
    /// 過去の世代なら`dead`のエラー、まだ発行されていない世代なら`StaleHandle`。
    fn classify(&self, id: ObjectId, dead: fn(ObjectId) -> TrackerError) -> TrackerError {
        if id.generation < self.generation || (self.exhausted && id.generation == self.generation)
        {
            dead(id)
        } else {
            TrackerError::StaleHandle(id)
        }
    }

    fn payload_ptr(&self) -> Option<PayloadPtr> {
        self.payload.as_deref().map(NonNull::from)
    }

    fn increment(&mut self, id: ObjectId) {
        // カウントのオーバーフローをチェック
        if self.strong > isize::MAX as usize {
            std::process::abort();
        }
        self.strong += 1;
        trace!("{} retain -> {}", id, self.strong);
    }

    fn begin_teardown(&mut self) -> Dying {
        self.phase = Phase::TearingDown;
        // 以降、この世代のweak/unowned参照は無効
        match self.generation.checked_add(1) {
            Some(next) => self.generation = next,
            None => self.exhausted = true,
        }
        self.raw = 0;
        self.type_id = None;
        self.trace = None;
        Dying {
            payload: self.payload.take(),
            teardown: self.teardown.take(),
            label: self.label.take(),
        }
    }
}

/// アリーナのスロット
pub(crate) struct Slot {
    state: Mutex<SlotState>,
}

impl std::fmt::Debug for Slot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Slot").finish_non_exhaustive()
    }
}

impl Slot {
    fn vacant() -> Self {
        Self {
            state: Mutex::new(SlotState::vacant()),
        }
    }
}

/// 新しいオブジェクトの内容
pub(crate) struct Entry {
    pub(crate) payload: Payload,
    pub(crate) type_id: TypeId,
    pub(crate) teardown: Option<ErasedTeardown>,
    pub(crate) trace: Option<TraceFn>,
    pub(crate) label: Option<Arc<str>>,
}

/// アリーナの統計値
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ArenaCounters {
    pub(crate) live: usize,
    pub(crate) allocated: u64,
    pub(crate) destroyed: u64,
    pub(crate) slots: usize,
    pub(crate) free_slots: usize,
}

/// オブジェクトのアリーナ
pub(crate) struct Arena {
    slots: RwLock<Vec<Arc<Slot>>>,
    free: Mutex<Vec<u32>>,
    live: AtomicUsize,
    allocated: AtomicU64,
    destroyed: AtomicU64,
    config: TrackerConfig,
}

fn describe(label: Option<&Arc<str>>) -> String {
    match label {
        Some(label) => format!(" ({})", label),
        None => String::new(),
    }
}

impl Arena {
    pub(crate) fn new(config: TrackerConfig) -> Self {
        let mut slots = Vec::new();
        if let Err(err) = slots.try_reserve(config.arena.initial_capacity) {
            // 事前確保は省略し、割り当て時に必要な分だけ拡張する
            warn!(
                "スロット表を {} 個分事前確保できません: {}",
                config.arena.initial_capacity, err
            );
        }
        Self {
            slots: RwLock::new(slots),
            free: Mutex::new(Vec::new()),
            live: AtomicUsize::new(0),
            allocated: AtomicU64::new(0),
            destroyed: AtomicU64::new(0),
            config,
        }
    }

    pub(crate) fn config(&self) -> &TrackerConfig {
        &self.config
    }

    pub(crate) fn slot(&self, index: u32) -> Option<Arc<Slot>> {
        self.slots.read().get(index as usize).cloned()
    }

    /// オブジェクトを強参照カウント1で格納する
    pub(crate) fn insert(&self, entry: Entry) -> Result<(ObjectId, Arc<Slot>, PayloadPtr)> {
        self.reserve_live()?;
        let (index, slot) = match self.acquire_slot() {
            Ok(acquired) => acquired,
            Err(err) => {
                self.live.fetch_sub(1, Ordering::AcqRel);
                return Err(err);
            }
        };

        let Entry {
            payload,
            type_id,
            teardown,
            trace,
            label,
        } = entry;
        let ptr = NonNull::from(&*payload);

        let mut state = slot.state.lock();
        state.phase = Phase::Alive;
        state.strong = 1;
        state.raw = 0;
        state.payload = Some(payload);
        state.type_id = Some(type_id);
        state.teardown = teardown;
        state.trace = trace;
        state.label = label;
        let id = ObjectId::new(index, state.generation);
        if self.config.diagnostics.log_lifecycle {
            debug!(
                "オブジェクト {}{} を割り当てました",
                id,
                describe(state.label.as_ref())
            );
        }
        drop(state);

        self.allocated.fetch_add(1, Ordering::Relaxed);
        Ok((id, slot, ptr))
    }

    fn reserve_live(&self) -> Result<()> {
        let limit = match self.config.arena.max_objects {
            Some(limit) => limit,
            None => {
                self.live.fetch_add(1, Ordering::AcqRel);
                return Ok(());
            }
        };

        let mut live = self.live.load(Ordering::Acquire);
        loop {
            if live >= limit {
                warn!("生存オブジェクト数が上限 {} に達しています", limit);
                return Err(TrackerError::OutOfMemory {
                    live,
                    reason: format!("生存オブジェクト数の上限 {} に達しました", limit),
                });
            }
            match self.live.compare_exchange_weak(
                live,
                live + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(()),
                Err(actual) => live = actual,
            }
        }
    }

    fn acquire_slot(&self) -> Result<(u32, Arc<Slot>)> {
        let reused = self.free.lock().pop();
        if let Some(index) = reused {
            if let Some(slot) = self.slot(index) {
                return Ok((index, slot));
            }
        }

        let mut slots = self.slots.write();
        let live = self.live.load(Ordering::Acquire);
        let index = u32::try_from(slots.len()).map_err(|_| TrackerError::OutOfMemory {
            live,
            reason: "スロット番号が上限を超えました".to_string(),
        })?;
        slots
            .try_reserve(1)
            .map_err(|err| TrackerError::OutOfMemory {
                live,
                reason: format!("スロット表を拡張できません: {}", err),
            })?;
        let slot = Arc::new(Slot::vacant());
        slots.push(Arc::clone(&slot));
        Ok((index, slot))
    }

    /// 強参照を1つ増やし、ペイロードを返す
    ///
    /// 対象が破棄済みなら`UseAfterFree`。カウントの変更と生存確認は同じロック内で行う。
    pub(crate) fn retain(&self, slot: &Slot, id: ObjectId) -> Result<PayloadPtr> {
        let mut state = slot.state.lock();
        if !state.is_live(id) {
            return Err(state.classify(id, TrackerError::UseAfterFree));
        }
        let ptr = state.payload_ptr().ok_or(TrackerError::UseAfterFree(id))?;
        state.increment(id);
        Ok(ptr)
    }

    /// 強参照を1つ減らし、0になったら破棄する
    pub(crate) fn release(&self, slot: &Slot, id: ObjectId) -> Result<Released> {
        let state = slot.state.lock();
        if !state.is_live(id) {
            return Err(state.classify(id, TrackerError::DoubleRelease));
        }
        self.decrement(slot, state, id)
    }

    fn decrement(
        &self,
        slot: &Slot,
        mut state: MutexGuard<'_, SlotState>,
        id: ObjectId,
    ) -> Result<Released> {
        if state.strong == 0 {
            return Err(TrackerError::DoubleRelease(id));
        }
        state.strong -= 1;
        if state.strong > 0 {
            trace!("{} release -> {}", id, state.strong);
            return Ok(Released::Retained {
                remaining: state.strong,
            });
        }

        let dying = state.begin_teardown();
        drop(state);
        self.finish_teardown(slot, id, dying);
        Ok(Released::Destroyed)
    }

    fn finish_teardown(&self, slot: &Slot, id: ObjectId, dying: Dying) {
        let Dying {
            payload,
            teardown,
            label,
        } = dying;

        // teardownが失敗してもスロットは必ず回収する
        let outcome = match (teardown, payload.as_deref()) {
            (Some(teardown), Some(payload)) => {
                panic::catch_unwind(AssertUnwindSafe(|| teardown(payload)))
            }
            _ => Ok(()),
        };
        if outcome.is_err() {
            warn!("オブジェクト {}{} のteardownがパニックしました", id, describe(label.as_ref()));
        } else if self.config.diagnostics.log_lifecycle {
            debug!("オブジェクト {}{} を破棄しました", id, describe(label.as_ref()));
        }
        // ペイロードが保持していた強参照はここで連鎖的に解放される
        drop(payload);

        let reusable = {
            let mut state = slot.state.lock();
            state.phase = Phase::Vacant;
            !state.exhausted
        };
        if reusable {
            self.free.lock().push(id.index);
        } else {
            warn!("スロット {} は世代を使い切ったため再利用しません", id.index);
        }
        self.live.fetch_sub(1, Ordering::AcqRel);
        self.destroyed.fetch_add(1, Ordering::Relaxed);

        if let Err(cause) = outcome {
            panic::resume_unwind(cause);
        }
    }

    /// 新しい強参照を生のIDとして外に出す
    pub(crate) fn retain_raw(&self, slot: &Slot, id: ObjectId) -> Result<()> {
        let mut state = slot.state.lock();
        if !state.is_live(id) {
            return Err(state.classify(id, TrackerError::UseAfterFree));
        }
        state.increment(id);
        state.raw += 1;
        Ok(())
    }

    /// 生のIDとして外に出ている強参照を1つ解放する
    pub(crate) fn release_raw(&self, slot: &Slot, id: ObjectId) -> Result<Released> {
        let mut state = slot.state.lock();
        if !state.is_live(id) {
            return Err(state.classify(id, TrackerError::DoubleRelease));
        }
        if state.raw == 0 {
            warn!("{} には解放できる生の所有権が残っていません", id);
            return Err(TrackerError::DoubleRelease(id));
        }
        state.raw -= 1;
        self.decrement(slot, state, id)
    }

    /// 生のIDとして外に出ている強参照を型付きハンドルとして引き取る
    pub(crate) fn claim_raw(&self, slot: &Slot, id: ObjectId, type_id: TypeId) -> Result<PayloadPtr> {
        let mut state = slot.state.lock();
        if !state.is_live(id) {
            return Err(state.classify(id, TrackerError::DoubleRelease));
        }
        if state.type_id != Some(type_id) {
            return Err(TrackerError::TypeMismatch(id));
        }
        if state.raw == 0 {
            return Err(TrackerError::DoubleRelease(id));
        }
        let ptr = state.payload_ptr().ok_or(TrackerError::DoubleRelease(id))?;
        state.raw -= 1;
        Ok(ptr)
    }

    pub(crate) fn strong_count(&self, slot: &Slot, id: ObjectId) -> Option<usize> {
        let state = slot.state.lock();
        state.is_live(id).then_some(state.strong)
    }

    pub(crate) fn is_live(&self, slot: &Slot, id: ObjectId) -> bool {
        slot.state.lock().is_live(id)
    }

    pub(crate) fn label(&self, slot: &Slot, id: ObjectId) -> Option<Arc<str>> {
        let state = slot.state.lock();
        if state.is_live(id) {
            state.label.clone()
        } else {
            None
        }
    }

    pub(crate) fn counters(&self) -> ArenaCounters {
        ArenaCounters {
            live: self.live.load(Ordering::Acquire),
            allocated: self.allocated.load(Ordering::Relaxed),
            destroyed: self.destroyed.load(Ordering::Relaxed),
            slots: self.slots.read().len(),
            free_slots: self.free.lock().len(),
        }
    }

    /// 生存中のオブジェクトと、それが保持する強参照の一覧を取得する
    ///
    /// 各オブジェクトのトレースはそのスロットのロックを保持したまま行う。
    pub(crate) fn snapshot(&self) -> Vec<LiveObject> {
        let slots: Vec<Arc<Slot>> = self.slots.read().clone();
        let mut live = Vec::new();
        for (index, slot) in slots.iter().enumerate() {
            let state = slot.state.lock();
            if state.phase != Phase::Alive {
                continue;
            }
            let id = ObjectId::new(index as u32, state.generation);
            let edges = match (state.trace, state.payload.as_deref()) {
                (Some(trace), Some(payload)) => {
                    let mut edges = Vec::new();
                    trace(payload, &mut |target| edges.push(target));
                    Some(edges)
                }
                _ => None,
            };
            live.push(LiveObject {
                id,
                label: state.label.as_deref().map(str::to_string),
                strong: state.strong,
                edges,
            });
        }
        live
    }
}

impl fmt::Debug for Arena {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let counters = self.counters();
        f.debug_struct("Arena")
            .field("live", &counters.live)
            .field("slot_count", &counters.slots)
            .field("free_count", &counters.free_slots)
            .finish()
    }
}
