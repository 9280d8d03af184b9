//! # リーク診断
//!
//! 参照カウントは循環参照を回収しません。強参照だけで構成された循環は
//! 外部からの強参照がなくなっても強参照数が0にならず、永久に残ります。
//! このモジュールはそうしたオブジェクトを**検出するだけ**で、解放は一切行いません。
//! 対処はweak参照・unowned参照への置き換えで行います。

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt;

use serde::Serialize;

use crate::core::tracker::Tracker;
use crate::core::types::ObjectId;

/// 保持している強参照を列挙するトレイト
///
/// weak参照・unowned参照は報告しません。
/// 実装からトラッカーを呼び出してはいけません（スロットのロックを保持したまま呼ばれます）。
pub trait Trace {
    /// 保持している強参照の対象を`visit`に渡す
    fn trace(&self, visit: &mut dyn FnMut(ObjectId));
}

/// 生存中のオブジェクトの情報
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LiveObject {
    /// 識別子
    pub id: ObjectId,
    /// ラベル
    pub label: Option<String>,
    /// 強参照数
    pub strong: usize,
    /// 保持している強参照（トレース不可能なオブジェクトは`None`）
    pub edges: Option<Vec<ObjectId>>,
}

impl LiveObject {
    /// 表示用の名前
    pub fn name(&self) -> String {
        match &self.label {
            Some(label) => format!("{} ({})", label, self.id),
            None => self.id.to_string(),
        }
    }
}

/// 強参照だけで構成された、外部から到達できない循環
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LeakedCycle {
    /// 循環に含まれるオブジェクト
    pub members: Vec<ObjectId>,
    /// 各オブジェクトのラベル
    pub labels: Vec<String>,
}

/// リーク診断の結果
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LeakReport {
    /// 診断時点で生存していたオブジェクト
    pub live: Vec<LiveObject>,
    /// 外部の強参照から到達できないオブジェクト
    pub leaked: Vec<ObjectId>,
    /// リークしている循環参照
    pub cycles: Vec<LeakedCycle>,
}

impl LeakReport {
    /// リークが見つからなかったか
    pub fn is_clean(&self) -> bool {
        self.leaked.is_empty()
    }

    /// 指定したオブジェクトがリークしているか
    pub fn is_leaked(&self, id: ObjectId) -> bool {
        self.leaked.contains(&id)
    }
}

impl fmt::Display for LeakReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_clean() {
            return write!(
                f,
                "リークは検出されませんでした（生存オブジェクト: {}）",
                self.live.len()
            );
        }
        writeln!(
            f,
            "{}個のオブジェクトがリークしています（循環参照: {}）",
            self.leaked.len(),
            self.cycles.len()
        )?;
        for (i, cycle) in self.cycles.iter().enumerate() {
            writeln!(f, "循環 #{}: {}", i + 1, cycle.labels.join(" -> "))?;
        }
        Ok(())
    }
}

/// リーク検出器
///
/// 各オブジェクトの強参照数から、他の生存オブジェクトが保持している強参照を差し引き、
/// 残りがあるオブジェクトを外部から所有されている根とみなします。
/// 根から強参照をたどって到達できない生存オブジェクトがリークです。
pub struct LeakDetector;

impl LeakDetector {
    /// トラッカーの現在の状態を診断する
    ///
    /// 参照グラフが変化していない状態で呼び出してください。
    pub fn scan(tracker: &Tracker) -> LeakReport {
        let live = tracker.arena().snapshot();
        let report = Self::analyze(live);
        if !report.is_clean() {
            log::warn!("{}", report);
        }
        report
    }

    fn analyze(live: Vec<LiveObject>) -> LeakReport {
        let objects: BTreeMap<ObjectId, &LiveObject> =
            live.iter().map(|object| (object.id, object)).collect();

        // 生存オブジェクト同士の強参照（対象が生存しているものだけ）
        let edges: BTreeMap<ObjectId, Vec<ObjectId>> = live
            .iter()
            .map(|object| {
                let targets = object
                    .edges
                    .iter()
                    .flatten()
                    .copied()
                    .filter(|target| objects.contains_key(target))
                    .collect();
                (object.id, targets)
            })
            .collect();

        let mut internal: HashMap<ObjectId, usize> = HashMap::new();
        for targets in edges.values() {
            for target in targets {
                *internal.entry(*target).or_default() += 1;
            }
        }

        let mut reachable: BTreeSet<ObjectId> = BTreeSet::new();
        let mut stack: Vec<ObjectId> = live
            .iter()
            .filter(|object| object.strong > internal.get(&object.id).copied().unwrap_or(0))
            .map(|object| object.id)
            .collect();
        while let Some(id) = stack.pop() {
            if !reachable.insert(id) {
                continue;
            }
            if let Some(targets) = edges.get(&id) {
                stack.extend(targets.iter().filter(|target| !reachable.contains(*target)));
            }
        }

        let leaked: Vec<ObjectId> = objects
            .keys()
            .copied()
            .filter(|id| !reachable.contains(id))
            .collect();

        let cycles = strongly_connected(&leaked, &edges)
            .into_iter()
            .filter(|component| {
                component.len() > 1
                    || edges
                        .get(&component[0])
                        .map_or(false, |targets| targets.contains(&component[0]))
            })
            .map(|members| {
                let labels = members
                    .iter()
                    .map(|id| objects.get(id).map_or_else(|| id.to_string(), |o| o.name()))
                    .collect();
                LeakedCycle { members, labels }
            })
            .collect();

        LeakReport {
            live,
            leaked,
            cycles,
        }
    }
}

/// Tarjanのアルゴリズムで強連結成分を求める（`nodes`に限定した部分グラフ）
///
/// 長い循環でもスタックを消費しないよう、再帰の代わりに`(node, next_edge)`の作業スタックを使う。
fn strongly_connected(
    nodes: &[ObjectId],
    edges: &BTreeMap<ObjectId, Vec<ObjectId>>,
) -> Vec<Vec<ObjectId>> {
    let members: BTreeSet<ObjectId> = nodes.iter().copied().collect();
    let successors = |v: ObjectId| -> Vec<ObjectId> {
        edges
            .get(&v)
            .map(|targets| {
                targets
                    .iter()
                    .copied()
                    .filter(|target| members.contains(target))
                    .collect()
            })
            .unwrap_or_default()
    };

    let mut next_index = 0;
    let mut indices: HashMap<ObjectId, usize> = HashMap::new();
    let mut lowlink: HashMap<ObjectId, usize> = HashMap::new();
    let mut stack: Vec<ObjectId> = Vec::new();
    let mut on_stack: HashSet<ObjectId> = HashSet::new();
    let mut components: Vec<Vec<ObjectId>> = Vec::new();

    for &root in nodes {
        if indices.contains_key(&root) {
            continue;
        }

        indices.insert(root, next_index);
        lowlink.insert(root, next_index);
        next_index += 1;
        stack.push(root);
        on_stack.insert(root);
        let mut work: Vec<(ObjectId, Vec<ObjectId>, usize)> = vec![(root, successors(root), 0)];

        while let Some((v, targets, next_edge)) = work.last_mut() {
            let v = *v;
            if let Some(&w) = targets.get(*next_edge) {
                *next_edge += 1;
                if !indices.contains_key(&w) {
                    indices.insert(w, next_index);
                    lowlink.insert(w, next_index);
                    next_index += 1;
                    stack.push(w);
                    on_stack.insert(w);
                    work.push((w, successors(w), 0));
                } else if on_stack.contains(&w) {
                    let low = lowlink[&v].min(indices[&w]);
                    lowlink.insert(v, low);
                }
                continue;
            }

            // vの後続をすべて訪問し終えた
            work.pop();
            if lowlink[&v] == indices[&v] {
                let mut component = Vec::new();
                while let Some(w) = stack.pop() {
                    on_stack.remove(&w);
                    component.push(w);
                    if w == v {
                        break;
                    }
                }
                component.sort();
                components.push(component);
            }
            if let Some((parent, _, _)) = work.last() {
                let low = lowlink[parent].min(lowlink[&v]);
                lowlink.insert(*parent, low);
            }
        }
    }

    components.sort();
    components
}
