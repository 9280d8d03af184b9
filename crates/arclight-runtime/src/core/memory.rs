//! # 参照ハンドル
//!
//! アリーナ上のオブジェクトを指す3種類のハンドルを提供します。
//!
//! - [`Strong`]：所有権を持つ。存在する限り対象は生存する
//! - [`Weak`]：所有権を持たない。対象の破棄後は`load`が`None`を返す
//! - [`Unowned`]：所有権を持たない。対象が先に破棄されているとアクセスは致命的エラー
//!
//! `Strong`は`release(self)`で消費されるため、同じ所有権を二度解放することは
//! 型レベルで起こりません。複製は`retain`（または`Clone`）を通してのみ行えます。

use std::any::TypeId;
use std::fmt;
use std::marker::PhantomData;
use std::mem::ManuallyDrop;
use std::ops::Deref;
use std::ptr::{self, NonNull};
use std::sync::Arc;

use crate::core::arena::{PayloadPtr, Slot};
use crate::core::error::{fatal, Result, TrackerError};
use crate::core::tracker::Tracker;
use crate::core::types::{ObjectId, Released};

/// ハンドルが指すスロット
#[derive(Clone)]
struct Target {
    tracker: Tracker,
    slot: Arc<Slot>,
    id: ObjectId,
}

impl Target {
    fn retain(&self) -> Result<PayloadPtr> {
        self.tracker.arena().retain(&self.slot, self.id)
    }

    fn release(&self) -> Released {
        match self.tracker.arena().release(&self.slot, self.id) {
            Ok(released) => released,
            Err(err) => fatal(err),
        }
    }

    fn is_alive(&self) -> bool {
        self.tracker.arena().is_live(&self.slot, self.id)
    }
}

/// 強参照
///
/// 対象の寿命の一部を所有するハンドルです。
/// スコープを抜けると自動的に解放され（`Drop`）、最後の強参照が解放された瞬間に
/// 対象のteardownが同期的に実行されます。
pub struct Strong<T: 'static> {
    target: Target,
    ptr: NonNull<T>,
    phantom: PhantomData<T>,
}

// SAFETY: ペイロードは`Arc<dyn Any + Send + Sync>`としてスロットに格納されており、
// Strongは共有参照`&T`しか提供しない
unsafe impl<T: Send + Sync + 'static> Send for Strong<T> {}
unsafe impl<T: Send + Sync + 'static> Sync for Strong<T> {}

impl<T: Send + Sync + 'static> Strong<T> {
    pub(crate) fn from_parts(tracker: Tracker, slot: Arc<Slot>, id: ObjectId, ptr: PayloadPtr) -> Self {
        Self {
            target: Target { tracker, slot, id },
            ptr: ptr.cast::<T>(),
            phantom: PhantomData,
        }
    }

    /// 対象の識別子
    pub fn id(&self) -> ObjectId {
        self.target.id
    }

    /// このハンドルを発行したトラッカー
    pub fn tracker(&self) -> &Tracker {
        &self.target.tracker
    }

    /// 対象の現在の強参照数
    pub fn strong_count(&self) -> usize {
        self.target
            .tracker
            .arena()
            .strong_count(&self.target.slot, self.target.id)
            .unwrap_or(0)
    }

    /// 対象のラベル
    pub fn label(&self) -> Option<Arc<str>> {
        self.target
            .tracker
            .arena()
            .label(&self.target.slot, self.target.id)
    }

    /// 2つのハンドルが同じオブジェクトを指しているか
    pub fn ptr_eq(this: &Self, other: &Self) -> bool {
        this.target.id == other.target.id && Arc::ptr_eq(&this.target.slot, &other.target.slot)
    }

    /// 強参照数を1増やし、独立した新しい強参照を返す
    ///
    /// この呼び出しでteardownが実行されることはありません。
    pub fn retain(&self) -> Strong<T> {
        match self.target.retain() {
            Ok(ptr) => Self::from_parts(
                self.target.tracker.clone(),
                Arc::clone(&self.target.slot),
                self.target.id,
                ptr,
            ),
            Err(err) => fatal(err),
        }
    }

    /// 強参照数を1減らす
    ///
    /// 0になった場合はteardownを実行し、ペイロードを解放してから戻ります。
    pub fn release(self) -> Released {
        let this = ManuallyDrop::new(self);
        // SAFETY: `this`は以降使用されずDropも実行されないため、
        // targetの所有権を取り出すのはこの一度だけ
        let target = unsafe { ptr::read(&this.target) };
        target.release()
    }

    /// weak参照を作成する（強参照数は変わらない）
    pub fn downgrade(&self) -> Weak<T> {
        Weak {
            target: self.target.clone(),
            phantom: PhantomData,
        }
    }

    /// unowned参照を作成する（強参照数は変わらない）
    pub fn downgrade_unowned(&self) -> Unowned<T> {
        Unowned {
            target: self.target.clone(),
            phantom: PhantomData,
        }
    }

    /// 型付きハンドルを手放し、所有権を生の識別子として取り出す
    ///
    /// 取り出した所有権は[`Tracker::release_raw`]または[`Strong::from_raw`]で
    /// ちょうど一度だけ消費する必要があります。
    pub fn into_raw(self) -> ObjectId {
        let id = self.target.id;
        if let Err(err) = self.target.tracker.arena().retain_raw(&self.target.slot, id) {
            fatal(err);
        }
        drop(self);
        id
    }

    /// 生の識別子として取り出された所有権を型付きハンドルに戻す
    ///
    /// 既に消費された所有権なら`DoubleRelease`、型が異なれば`TypeMismatch`。
    pub fn from_raw(tracker: &Tracker, id: ObjectId) -> Result<Self> {
        let slot = tracker
            .arena()
            .slot(id.index)
            .ok_or(TrackerError::StaleHandle(id))?;
        let ptr = tracker.arena().claim_raw(&slot, id, TypeId::of::<T>())?;
        Ok(Self::from_parts(tracker.clone(), slot, id, ptr))
    }
}

impl<T: 'static> Deref for Strong<T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        // SAFETY: このハンドルが強参照を1つ保持している間、
        // スロットはペイロードを解放しない
        unsafe { self.ptr.as_ref() }
    }
}

impl<T: Send + Sync + 'static> Clone for Strong<T> {
    fn clone(&self) -> Self {
        self.retain()
    }
}

impl<T: 'static> Drop for Strong<T> {
    fn drop(&mut self) {
        self.target.release();
    }
}

impl<T: Send + Sync + 'static> fmt::Debug for Strong<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Strong")
            .field("id", &self.id())
            .field("strong_count", &self.strong_count())
            .finish()
    }
}

/// weak参照
///
/// 強参照数に影響しない観測用のハンドルです。
/// 対象の破棄後、`load`は必ず`None`を返します。
pub struct Weak<T: 'static> {
    target: Target,
    phantom: PhantomData<fn() -> T>,
}

impl<T: Send + Sync + 'static> Weak<T> {
    /// 対象の識別子
    pub fn id(&self) -> ObjectId {
        self.target.id
    }

    /// 対象がまだ生存しているか
    pub fn is_alive(&self) -> bool {
        self.target.is_alive()
    }

    /// 対象が生存していれば新しい強参照を返す
    ///
    /// 生存確認と強参照数の増加は1つの不可分な操作です。
    /// 最後の`release`と競合した場合も、有効な強参照か`None`のいずれかになります。
    pub fn load(&self) -> Option<Strong<T>> {
        match self.target.retain() {
            Ok(ptr) => Some(Strong::from_parts(
                self.target.tracker.clone(),
                Arc::clone(&self.target.slot),
                self.target.id,
                ptr,
            )),
            Err(err) => {
                log::trace!("weak参照 {} の対象は存在しません: {}", self.target.id, err);
                None
            }
        }
    }
}

impl<T: 'static> Clone for Weak<T> {
    fn clone(&self) -> Self {
        Self {
            target: self.target.clone(),
            phantom: PhantomData,
        }
    }
}

impl<T: Send + Sync + 'static> fmt::Debug for Weak<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Weak")
            .field("id", &self.id())
            .field("alive", &self.is_alive())
            .finish()
    }
}

/// unowned参照
///
/// 強参照数に影響せず、対象がこの参照より長く生存することを前提とするハンドルです。
/// 前提が破られた場合、アクセスは未定義動作ではなく`UseAfterFree`になります。
pub struct Unowned<T: 'static> {
    target: Target,
    phantom: PhantomData<fn() -> T>,
}

impl<T: Send + Sync + 'static> Unowned<T> {
    /// 対象の識別子
    pub fn id(&self) -> ObjectId {
        self.target.id
    }

    /// 対象がまだ生存しているか
    pub fn is_alive(&self) -> bool {
        self.target.is_alive()
    }

    /// 対象にアクセスする
    ///
    /// 返される一時的な強参照がペイロードへの参照を提供し、
    /// 読み取り中に対象が破棄されることを防ぎます。
    /// 対象が既に破棄されていれば`UseAfterFree`。
    pub fn try_access(&self) -> Result<Strong<T>> {
        let ptr = self.target.retain()?;
        Ok(Strong::from_parts(
            self.target.tracker.clone(),
            Arc::clone(&self.target.slot),
            self.target.id,
            ptr,
        ))
    }

    /// 対象にアクセスする
    ///
    /// # Panics
    ///
    /// 対象が既に破棄されている場合、`UseAfterFree`でパニックします。
    #[track_caller]
    pub fn access(&self) -> Strong<T> {
        match self.try_access() {
            Ok(strong) => strong,
            Err(err) => fatal(err),
        }
    }
}

impl<T: 'static> Clone for Unowned<T> {
    fn clone(&self) -> Self {
        Self {
            target: self.target.clone(),
            phantom: PhantomData,
        }
    }
}

impl<T: Send + Sync + 'static> fmt::Debug for Unowned<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Unowned")
            .field("id", &self.id())
            .field("alive", &self.is_alive())
            .finish()
    }
}
