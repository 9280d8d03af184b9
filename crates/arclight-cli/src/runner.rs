/*
 * arclight CLI - シナリオ実行モジュール
 *
 * シナリオの各ステップを所有権トラッカーの操作に変換して実行し、
 * 発生したイベントを記録します。
 */

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use arclight_runtime::{
    LeakDetector, LeakReport, ObjectId, Strong, Trace, Tracker, TrackerConfig, TrackerError,
    TrackerStats, Unowned, Weak,
};
use log::{debug, info};
use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;

use crate::scenario::{LinkKind, Scenario, Step};

/// シナリオ実行時のエラー
#[derive(Error, Debug)]
pub enum ScenarioError {
    #[error("変数 '{0}' は定義されていません")]
    UndefinedVariable(String),

    #[error("変数 '{var}' は{expected}参照ではありません")]
    WrongKind { var: String, expected: &'static str },

    #[error("変数 '{0}' はnilです")]
    Nil(String),

    #[error("ラベル '{0}' のオブジェクトは割り当てられていません")]
    UnknownLabel(String),

    #[error("フィールド '{owner}.{field}' は存在しません")]
    UnknownField { owner: String, field: String },

    #[error("検証に失敗しました: {label} の{what}は {expected} のはずですが {actual} でした")]
    Expectation {
        label: String,
        what: &'static str,
        expected: String,
        actual: String,
    },

    #[error(transparent)]
    Tracker(#[from] TrackerError),
}

/// 失敗したステップ
#[derive(Error, Debug)]
#[error("ステップ {step} で停止しました: {source}")]
pub struct StepError {
    /// 1始まりのステップ番号（スコープ内も通し番号）
    pub step: usize,
    #[source]
    pub source: ScenarioError,
}

/// 実行中に記録されるイベント
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum Event {
    Allocated {
        var: String,
        label: String,
        id: ObjectId,
    },
    Retained {
        from: String,
        into: String,
        label: String,
        count: usize,
    },
    Released {
        var: String,
        label: String,
        remaining: usize,
    },
    TornDown {
        label: String,
    },
    WeakCreated {
        var: String,
        label: String,
    },
    UnownedCreated {
        var: String,
        label: String,
    },
    WeakLoaded {
        var: String,
        label: String,
        count: usize,
    },
    WeakAbsent {
        var: String,
    },
    UnownedAccessed {
        var: String,
        label: String,
        count: usize,
    },
    Linked {
        owner: String,
        field: String,
        target: String,
        kind: LinkKind,
    },
    Unlinked {
        owner: String,
        field: String,
    },
    ScopeEntered {
        depth: usize,
    },
    ScopeExited {
        depth: usize,
    },
    ExpectationPassed {
        label: String,
        alive: bool,
        count: Option<usize>,
    },
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Event::Allocated { var, label, id } => {
                write!(f, "割り当て: {} {} -> {}", label, id, var)
            }
            Event::Retained {
                from,
                into,
                label,
                count,
            } => write!(f, "retain: {} = {} ({} 強参照数 {})", into, from, label, count),
            Event::Released {
                var,
                label,
                remaining,
            } => write!(f, "release: {} = nil ({} 強参照数 {})", var, label, remaining),
            Event::TornDown { label } => write!(f, "{} is being deinitialized", label),
            Event::WeakCreated { var, label } => write!(f, "weak: {} -> {}", var, label),
            Event::UnownedCreated { var, label } => write!(f, "unowned: {} -> {}", var, label),
            Event::WeakLoaded { var, label, count } => {
                write!(f, "load: {} -> {} (強参照数 {})", var, label, count)
            }
            Event::WeakAbsent { var } => write!(f, "load: {} -> nil", var),
            Event::UnownedAccessed { var, label, count } => {
                write!(f, "access: {} -> {} (強参照数 {})", var, label, count)
            }
            Event::Linked {
                owner,
                field,
                target,
                kind,
            } => write!(f, "link: {}.{} = {} ({})", owner, field, target, kind),
            Event::Unlinked { owner, field } => write!(f, "unlink: {}.{} = nil", owner, field),
            Event::ScopeEntered { depth } => write!(f, "スコープ開始 (深さ {})", depth),
            Event::ScopeExited { depth } => write!(f, "スコープ終了 (深さ {})", depth),
            Event::ExpectationPassed {
                label,
                alive,
                count,
            } => match count {
                Some(count) => write!(f, "検証OK: {} alive={} count={}", label, alive, count),
                None => write!(f, "検証OK: {} alive={}", label, alive),
            },
        }
    }
}

/// シナリオで割り当てられるオブジェクト
pub struct Node {
    label: String,
    fields: Mutex<BTreeMap<String, Field>>,
}

enum Field {
    Strong(Strong<Node>),
    Weak(Weak<Node>),
    Unowned(Unowned<Node>),
}

impl Node {
    fn new(label: &str) -> Self {
        Self {
            label: label.to_string(),
            fields: Mutex::new(BTreeMap::new()),
        }
    }
}

impl Trace for Node {
    fn trace(&self, visit: &mut dyn FnMut(ObjectId)) {
        for field in self.fields.lock().values() {
            if let Field::Strong(target) = field {
                visit(target.id());
            }
        }
    }
}

impl fmt::Debug for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Field::Strong(strong) => write!(f, "strong {}", strong.id()),
            Field::Weak(weak) => write!(f, "weak {}", weak.id()),
            Field::Unowned(unowned) => write!(f, "unowned {}", unowned.id()),
        }
    }
}

/// 変数の束縛
enum Binding {
    Strong(Option<Strong<Node>>),
    Weak(Weak<Node>),
    Unowned(Unowned<Node>),
}

/// 実行結果
#[derive(Debug, Serialize)]
pub struct Outcome {
    pub scenario: String,
    pub events: Vec<Event>,
    pub leaks: LeakReport,
    pub stats: TrackerStats,
}

type Transcript = Arc<Mutex<Vec<Event>>>;

/// シナリオ実行器
pub struct Runner {
    tracker: Tracker,
    transcript: Transcript,
    /// 変数のスコープ（先頭がグローバル）
    frames: Vec<Vec<(String, Binding)>>,
    /// ラベルごとの最新のオブジェクト
    objects: BTreeMap<String, Weak<Node>>,
    step: usize,
}

impl Runner {
    /// 新しい実行器を作成
    pub fn new(config: TrackerConfig) -> Self {
        Self {
            tracker: Tracker::with_config(config),
            transcript: Arc::default(),
            frames: vec![Vec::new()],
            objects: BTreeMap::new(),
            step: 0,
        }
    }

    /// これまでに記録されたイベント
    pub fn events(&self) -> Vec<Event> {
        self.transcript.lock().clone()
    }

    /// シナリオのステップを順に実行する
    pub fn run(&mut self, scenario: &Scenario) -> Result<(), StepError> {
        info!(
            "シナリオ '{}' を実行します（{}ステップ）",
            scenario.name,
            scenario.step_count()
        );
        self.execute_all(&scenario.steps)
    }

    /// リーク診断を行い、残っている変数を宣言と逆順に解放して結果を返す
    pub fn finish(mut self, scenario: &Scenario) -> Outcome {
        let leaks = LeakDetector::scan(&self.tracker);
        while let Some(frame) = self.frames.pop() {
            self.release_frame(frame);
        }
        Outcome {
            scenario: scenario.name.clone(),
            events: self.events(),
            leaks,
            stats: self.tracker.stats(),
        }
    }

    /// 失敗したシナリオを打ち切る
    ///
    /// 残っている変数を宣言と逆順に解放し、その解放で起きたイベントを含めて返す。
    pub fn abandon(mut self) -> Vec<Event> {
        while let Some(frame) = self.frames.pop() {
            self.release_frame(frame);
        }
        self.events()
    }

    fn record(&self, event: Event) {
        debug!("{}", event);
        self.transcript.lock().push(event);
    }

    fn execute_all(&mut self, steps: &[Step]) -> Result<(), StepError> {
        for step in steps {
            self.step += 1;
            let index = self.step;
            match step {
                Step::Scope { steps } => self.scope(steps)?,
                _ => self
                    .execute(step)
                    .map_err(|source| StepError { step: index, source })?,
            }
        }
        Ok(())
    }

    fn scope(&mut self, steps: &[Step]) -> Result<(), StepError> {
        self.frames.push(Vec::new());
        let depth = self.frames.len() - 1;
        self.record(Event::ScopeEntered { depth });
        let result = self.execute_all(steps);
        self.record(Event::ScopeExited { depth });
        if let Some(frame) = self.frames.pop() {
            self.release_frame(frame);
        }
        result
    }

    fn execute(&mut self, step: &Step) -> Result<(), ScenarioError> {
        match step {
            Step::Alloc { var, label } => self.alloc(var, label),
            Step::Retain { from, into } => {
                let copy = self.strong(from)?.retain();
                self.record(Event::Retained {
                    from: from.clone(),
                    into: into.clone(),
                    label: copy.label.clone(),
                    count: copy.strong_count(),
                });
                self.bind(into, Binding::Strong(Some(copy)));
                Ok(())
            }
            Step::Release { var } => {
                let taken = match self.binding_mut(var)? {
                    Binding::Strong(slot) => slot.take(),
                    _ => return Err(wrong_kind(var, "強")),
                };
                match taken {
                    Some(strong) => self.release_strong(var, strong),
                    None => debug!("変数 '{}' は既にnilです", var),
                }
                Ok(())
            }
            Step::Weak { from, into } => {
                let weak = self.strong(from)?.downgrade();
                self.record(Event::WeakCreated {
                    var: into.clone(),
                    label: self.strong(from)?.label.clone(),
                });
                self.bind(into, Binding::Weak(weak));
                Ok(())
            }
            Step::Unowned { from, into } => {
                let unowned = self.strong(from)?.downgrade_unowned();
                self.record(Event::UnownedCreated {
                    var: into.clone(),
                    label: self.strong(from)?.label.clone(),
                });
                self.bind(into, Binding::Unowned(unowned));
                Ok(())
            }
            Step::Load { weak, into } => self.load(weak, into.as_deref()),
            Step::Access { unowned } => {
                let handle = match self.binding(unowned)? {
                    Binding::Unowned(handle) => handle.clone(),
                    _ => return Err(wrong_kind(unowned, "unowned")),
                };
                let accessed = handle.try_access()?;
                self.record(Event::UnownedAccessed {
                    var: unowned.clone(),
                    label: accessed.label.clone(),
                    // アクセス中の一時的な強参照を除く
                    count: accessed.strong_count() - 1,
                });
                Ok(())
            }
            Step::Link {
                owner,
                field,
                target,
                kind,
            } => {
                let target_strong = self.strong(target)?;
                let value = match kind {
                    LinkKind::Strong => Field::Strong(target_strong.retain()),
                    LinkKind::Weak => Field::Weak(target_strong.downgrade()),
                    LinkKind::Unowned => Field::Unowned(target_strong.downgrade_unowned()),
                };
                let previous = self.strong(owner)?.fields.lock().insert(field.clone(), value);
                self.record(Event::Linked {
                    owner: owner.clone(),
                    field: field.clone(),
                    target: target.clone(),
                    kind: *kind,
                });
                if let Some(previous) = previous {
                    debug!("{}.{} の以前の値 ({:?}) を破棄します", owner, field, previous);
                }
                Ok(())
            }
            Step::Unlink { owner, field } => {
                let removed = self.strong(owner)?.fields.lock().remove(field);
                let removed = removed.ok_or_else(|| ScenarioError::UnknownField {
                    owner: owner.clone(),
                    field: field.clone(),
                })?;
                self.record(Event::Unlinked {
                    owner: owner.clone(),
                    field: field.clone(),
                });
                drop(removed);
                Ok(())
            }
            Step::Scope { .. } => unreachable!("スコープはexecute_allで処理されます"),
            Step::Expect {
                label,
                alive,
                count,
            } => self.expect(label, *alive, *count),
        }
    }

    fn alloc(&mut self, var: &str, label: &str) -> Result<(), ScenarioError> {
        let transcript = Arc::clone(&self.transcript);
        let strong = self
            .tracker
            .build(Node::new(label))
            .label(label)
            .teardown(move |node: &Node| {
                info!("{} is being deinitialized", node.label);
                transcript.lock().push(Event::TornDown {
                    label: node.label.clone(),
                });
            })
            .traced()
            .allocate()?;

        self.objects.insert(label.to_string(), strong.downgrade());
        self.record(Event::Allocated {
            var: var.to_string(),
            label: label.to_string(),
            id: strong.id(),
        });
        self.bind(var, Binding::Strong(Some(strong)));
        Ok(())
    }

    fn load(&mut self, var: &str, into: Option<&str>) -> Result<(), ScenarioError> {
        let weak = match self.binding(var)? {
            Binding::Weak(weak) => weak.clone(),
            _ => return Err(wrong_kind(var, "weak")),
        };
        match weak.load() {
            Some(strong) => {
                self.record(Event::WeakLoaded {
                    var: var.to_string(),
                    label: strong.label.clone(),
                    count: strong.strong_count(),
                });
                match into {
                    Some(into) => self.bind(into, Binding::Strong(Some(strong))),
                    None => drop(strong),
                }
            }
            None => {
                self.record(Event::WeakAbsent {
                    var: var.to_string(),
                });
                if let Some(into) = into {
                    self.bind(into, Binding::Strong(None));
                }
            }
        }
        Ok(())
    }

    fn expect(&self, label: &str, alive: bool, count: Option<usize>) -> Result<(), ScenarioError> {
        let weak = self
            .objects
            .get(label)
            .ok_or_else(|| ScenarioError::UnknownLabel(label.to_string()))?;

        let actual_alive = weak.is_alive();
        if actual_alive != alive {
            return Err(ScenarioError::Expectation {
                label: label.to_string(),
                what: "生存状態",
                expected: alive.to_string(),
                actual: actual_alive.to_string(),
            });
        }
        if let Some(expected) = count {
            let actual = self.tracker.strong_count(weak.id()).unwrap_or(0);
            if actual != expected {
                return Err(ScenarioError::Expectation {
                    label: label.to_string(),
                    what: "強参照数",
                    expected: expected.to_string(),
                    actual: actual.to_string(),
                });
            }
        }

        self.record(Event::ExpectationPassed {
            label: label.to_string(),
            alive,
            count,
        });
        Ok(())
    }

    fn position(&self, var: &str) -> Option<(usize, usize)> {
        self.frames.iter().enumerate().rev().find_map(|(depth, frame)| {
            frame
                .iter()
                .position(|(name, _)| name == var)
                .map(|index| (depth, index))
        })
    }

    fn binding(&self, var: &str) -> Result<&Binding, ScenarioError> {
        let (depth, index) = self
            .position(var)
            .ok_or_else(|| ScenarioError::UndefinedVariable(var.to_string()))?;
        Ok(&self.frames[depth][index].1)
    }

    fn binding_mut(&mut self, var: &str) -> Result<&mut Binding, ScenarioError> {
        let (depth, index) = self
            .position(var)
            .ok_or_else(|| ScenarioError::UndefinedVariable(var.to_string()))?;
        Ok(&mut self.frames[depth][index].1)
    }

    fn strong(&self, var: &str) -> Result<&Strong<Node>, ScenarioError> {
        match self.binding(var)? {
            Binding::Strong(Some(strong)) => Ok(strong),
            Binding::Strong(None) => Err(ScenarioError::Nil(var.to_string())),
            _ => Err(wrong_kind(var, "強")),
        }
    }

    /// 変数に代入する。既存の変数なら以前の値を解放し、なければ現在のスコープに宣言する
    fn bind(&mut self, var: &str, binding: Binding) {
        let previous = match self.position(var) {
            Some((depth, index)) => Some(std::mem::replace(
                &mut self.frames[depth][index].1,
                binding,
            )),
            None => {
                if let Some(frame) = self.frames.last_mut() {
                    frame.push((var.to_string(), binding));
                }
                None
            }
        };
        if let Some(Binding::Strong(Some(strong))) = previous {
            self.release_strong(var, strong);
        }
    }

    fn release_strong(&self, var: &str, strong: Strong<Node>) {
        self.record(Event::Released {
            var: var.to_string(),
            label: strong.label.clone(),
            remaining: strong.strong_count().saturating_sub(1),
        });
        strong.release();
    }

    fn release_frame(&self, frame: Vec<(String, Binding)>) {
        for (var, binding) in frame.into_iter().rev() {
            if let Binding::Strong(Some(strong)) = binding {
                self.release_strong(&var, strong);
            }
        }
    }
}

fn wrong_kind(var: &str, expected: &'static str) -> ScenarioError {
    ScenarioError::WrongKind {
        var: var.to_string(),
        expected,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(source: &str) -> (Runner, Result<(), StepError>) {
        let scenario = Scenario::from_toml_str(source).unwrap();
        let mut runner = Runner::new(TrackerConfig::default());
        let result = runner.run(&scenario);
        (runner, result)
    }

    fn torn_down(events: &[Event]) -> Vec<String> {
        events
            .iter()
            .filter_map(|event| match event {
                Event::TornDown { label } => Some(label.clone()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_retain_counts_walkthrough() {
        let scenario = Scenario::builtin("retain-counts").unwrap();
        let mut runner = Runner::new(TrackerConfig::default());
        runner.run(&scenario).unwrap();
        assert_eq!(torn_down(&runner.events()), vec!["Eric"]);

        let outcome = runner.finish(&scenario);
        assert!(outcome.leaks.is_clean());
        assert_eq!(torn_down(&outcome.events), vec!["Eric", "Jack"]);
        assert_eq!(outcome.stats.live, 0);
    }

    #[test]
    fn test_scope_releases_in_reverse_order() {
        let (runner, result) = run(
            r#"
            name = "scope"
            [[step]]
            op = "scope"
            [[step.steps]]
            op = "alloc"
            var = "a"
            label = "A"
            [[step.steps]]
            op = "alloc"
            var = "b"
            label = "B"
            "#,
        );
        result.unwrap();
        assert_eq!(torn_down(&runner.events()), vec!["B", "A"]);
    }

    #[test]
    fn test_retain_cycle_is_reported_before_final_release() {
        let scenario = Scenario::builtin("retain-cycle").unwrap();
        let mut runner = Runner::new(TrackerConfig::default());
        runner.run(&scenario).unwrap();
        let outcome = runner.finish(&scenario);

        assert!(torn_down(&outcome.events).is_empty());
        assert_eq!(outcome.leaks.cycles.len(), 1);
        assert_eq!(outcome.leaks.leaked.len(), 2);
        assert_eq!(outcome.stats.live, 2);
    }

    #[test]
    fn test_weak_tenant_tears_down_owner_first() {
        let scenario = Scenario::builtin("weak-tenant").unwrap();
        let mut runner = Runner::new(TrackerConfig::default());
        runner.run(&scenario).unwrap();
        let events = runner.events();
        assert_eq!(torn_down(&events), vec!["John", "Apartment 4A"]);
        assert!(events.contains(&Event::WeakAbsent {
            var: "tenant".to_string()
        }));
    }

    #[test]
    fn test_unowned_crash_stops_with_use_after_free() {
        let scenario = Scenario::builtin("unowned-crash").unwrap();
        let mut runner = Runner::new(TrackerConfig::default());
        let err = runner.run(&scenario).unwrap_err();
        assert!(matches!(
            err.source,
            ScenarioError::Tracker(TrackerError::UseAfterFree(_))
        ));
        assert_eq!(err.step, scenario.step_count());
        assert_eq!(torn_down(&runner.events()), vec!["John", "Card #1234"]);
    }

    #[test]
    fn test_failed_expectation() {
        let (_, result) = run(
            r#"
            name = "expect"
            [[step]]
            op = "alloc"
            var = "a"
            label = "A"
            [[step]]
            op = "expect"
            label = "A"
            alive = true
            count = 3
            "#,
        );
        let err = result.unwrap_err();
        assert_eq!(err.step, 2);
        assert!(matches!(
            err.source,
            ScenarioError::Expectation {
                what: "強参照数",
                ..
            }
        ));
    }

    #[test]
    fn test_abandon_releases_remaining_variables_in_reverse() {
        let (runner, result) = run(
            r#"
            name = "abandon"
            [[step]]
            op = "alloc"
            var = "a"
            label = "A"
            [[step]]
            op = "alloc"
            var = "b"
            label = "B"
            [[step]]
            op = "expect"
            label = "A"
            alive = false
            "#,
        );
        assert_eq!(result.unwrap_err().step, 3);
        assert!(torn_down(&runner.events()).is_empty());

        let events = runner.abandon();
        assert_eq!(torn_down(&events), vec!["B", "A"]);
    }

    #[test]
    fn test_reassignment_releases_previous_value() {
        let (runner, result) = run(
            r#"
            name = "reassign"
            [[step]]
            op = "alloc"
            var = "x"
            label = "First"
            [[step]]
            op = "alloc"
            var = "x"
            label = "Second"
            "#,
        );
        result.unwrap();
        assert_eq!(torn_down(&runner.events()), vec!["First"]);
    }

    #[test]
    fn test_undefined_and_nil_variables() {
        let (_, result) = run(
            r#"
            name = "undefined"
            [[step]]
            op = "retain"
            from = "ghost"
            into = "x"
            "#,
        );
        assert!(matches!(
            result.unwrap_err().source,
            ScenarioError::UndefinedVariable(_)
        ));

        let (_, result) = run(
            r#"
            name = "nil"
            [[step]]
            op = "alloc"
            var = "a"
            label = "A"
            [[step]]
            op = "release"
            var = "a"
            [[step]]
            op = "weak"
            from = "a"
            into = "w"
            "#,
        );
        assert!(matches!(result.unwrap_err().source, ScenarioError::Nil(_)));
    }

    #[test]
    fn test_unlink_breaks_cycle() {
        let (runner, result) = run(
            r#"
            name = "unlink"
            [[step]]
            op = "alloc"
            var = "a"
            label = "A"
            [[step]]
            op = "alloc"
            var = "b"
            label = "B"
            [[step]]
            op = "link"
            owner = "a"
            field = "next"
            target = "b"
            [[step]]
            op = "link"
            owner = "b"
            field = "prev"
            target = "a"
            [[step]]
            op = "unlink"
            owner = "b"
            field = "prev"
            [[step]]
            op = "release"
            var = "a"
            "#,
        );
        result.unwrap();
        assert_eq!(torn_down(&runner.events()), vec!["A"]);
        assert!(LeakDetector::scan(&runner.tracker).is_clean());
    }
}
