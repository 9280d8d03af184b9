/*
 * arclight CLI - シナリオ定義モジュール
 *
 * 所有権の操作列をTOMLで記述したシナリオを読み込みます。
 */

use std::fmt;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// 組み込みのウォークスルー
const BUILTINS: &[(&str, &str)] = &[
    ("retain-counts", include_str!("../scenarios/retain-counts.toml")),
    ("local-scope", include_str!("../scenarios/local-scope.toml")),
    ("retain-cycle", include_str!("../scenarios/retain-cycle.toml")),
    ("weak-tenant", include_str!("../scenarios/weak-tenant.toml")),
    ("unowned-crash", include_str!("../scenarios/unowned-crash.toml")),
];

/// 所有権シナリオ
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Scenario {
    /// シナリオ名
    pub name: String,
    /// 説明
    #[serde(default)]
    pub description: String,
    /// 実行するステップ
    #[serde(default, rename = "step")]
    pub steps: Vec<Step>,
}

/// フィールドが保持する参照の種類
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum LinkKind {
    #[default]
    Strong,
    Weak,
    Unowned,
}

impl fmt::Display for LinkKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkKind::Strong => write!(f, "strong"),
            LinkKind::Weak => write!(f, "weak"),
            LinkKind::Unowned => write!(f, "unowned"),
        }
    }
}

/// シナリオの1ステップ
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "op", rename_all = "kebab-case")]
pub enum Step {
    /// オブジェクトを割り当てて強参照変数に束縛する
    Alloc { var: String, label: String },
    /// 強参照変数をコピーする
    Retain { from: String, into: String },
    /// 強参照変数にnilを代入する
    Release { var: String },
    /// weak参照変数を作成する
    Weak { from: String, into: String },
    /// unowned参照変数を作成する
    Unowned { from: String, into: String },
    /// weak参照をロードする（`into`省略時は存在確認のみ）
    Load {
        weak: String,
        #[serde(default)]
        into: Option<String>,
    },
    /// unowned参照を通してアクセスする
    Access { unowned: String },
    /// オブジェクトのフィールドに参照を格納する
    Link {
        owner: String,
        field: String,
        target: String,
        #[serde(default)]
        kind: LinkKind,
    },
    /// オブジェクトのフィールドを空にする
    Unlink { owner: String, field: String },
    /// ネストしたスコープ
    Scope {
        #[serde(default)]
        steps: Vec<Step>,
    },
    /// オブジェクトの状態を検証する
    Expect {
        label: String,
        alive: bool,
        #[serde(default)]
        count: Option<usize>,
    },
}

impl Scenario {
    /// TOML文字列からシナリオを読み込む
    pub fn from_toml_str(source: &str) -> Result<Self> {
        let scenario: Scenario =
            toml::from_str(source).context("シナリオの解析に失敗しました")?;
        Ok(scenario)
    }

    /// ファイルからシナリオを読み込む
    pub fn load(path: &Path) -> Result<Self> {
        let source = std::fs::read_to_string(path)
            .with_context(|| format!("シナリオファイル {} を読み込めません", path.display()))?;
        Self::from_toml_str(&source)
            .with_context(|| format!("{} は有効なシナリオではありません", path.display()))
    }

    /// 組み込みのウォークスルーを取得する
    pub fn builtin(name: &str) -> Result<Self> {
        let (_, source) = BUILTINS
            .iter()
            .find(|(builtin, _)| *builtin == name)
            .ok_or_else(|| {
                anyhow::anyhow!(
                    "ウォークスルー '{}' は存在しません（利用可能: {}）",
                    name,
                    builtin_names().join(", ")
                )
            })?;
        Self::from_toml_str(source)
    }

    /// 全ステップ数（スコープ内を含む）
    pub fn step_count(&self) -> usize {
        fn count(steps: &[Step]) -> usize {
            steps
                .iter()
                .map(|step| match step {
                    Step::Scope { steps } => 1 + count(steps),
                    _ => 1,
                })
                .sum()
        }
        count(&self.steps)
    }
}

/// 組み込みウォークスルーの名前一覧
pub fn builtin_names() -> Vec<&'static str> {
    BUILTINS.iter().map(|(name, _)| *name).collect()
}

/// 組み込みウォークスルーをすべて読み込む
pub fn builtins() -> Result<Vec<Scenario>> {
    BUILTINS
        .iter()
        .map(|(_, source)| Scenario::from_toml_str(source))
        .collect()
}
