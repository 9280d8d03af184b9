/*
 * arclight CLI - 結果表示モジュール
 *
 * シナリオの実行結果をテキストまたはJSONで出力します。
 */

use anyhow::{Context, Result};
use colored::Colorize;
use serde::Serialize;

use crate::runner::{Event, Outcome, StepError};
use crate::scenario::Scenario;

fn event_line(index: usize, event: &Event) -> String {
    let text = event.to_string();
    let text = match event {
        Event::Allocated { .. } => text.green().to_string(),
        Event::TornDown { .. } => text.red().bold().to_string(),
        Event::WeakAbsent { .. } => text.yellow().to_string(),
        Event::ExpectationPassed { .. } => text.cyan().to_string(),
        Event::ScopeEntered { .. } | Event::ScopeExited { .. } => text.dimmed().to_string(),
        _ => text,
    };
    format!("{:>4}  {}", index + 1, text)
}

fn header(scenario: &Scenario) -> String {
    let mut out = format!("{} {}\n", "シナリオ:".bold(), scenario.name.bold());
    if !scenario.description.is_empty() {
        out.push_str(&format!("  {}\n", scenario.description));
    }
    out
}

/// 実行結果をテキストで整形する
pub fn render_text(scenario: &Scenario, outcome: &Outcome) -> String {
    let mut out = header(scenario);
    out.push('\n');
    for (index, event) in outcome.events.iter().enumerate() {
        out.push_str(&event_line(index, event));
        out.push('\n');
    }

    out.push('\n');
    let leaks = outcome.leaks.to_string();
    if outcome.leaks.is_clean() {
        out.push_str(&leaks.green().to_string());
        out.push('\n');
    } else {
        for line in leaks.lines() {
            out.push_str(&line.red().to_string());
            out.push('\n');
        }
    }

    let stats = &outcome.stats;
    out.push_str(&format!(
        "割り当て: {}  破棄: {}  生存: {}\n",
        stats.allocated, stats.destroyed, stats.live
    ));
    out
}

/// 実行結果をJSONで整形する
pub fn render_json(outcome: &Outcome) -> Result<String> {
    serde_json::to_string_pretty(outcome).context("結果をJSONに変換できません")
}

#[derive(Serialize)]
struct FailureReport<'a> {
    scenario: &'a str,
    events: &'a [Event],
    error: String,
}

/// 途中で停止したシナリオのテキスト表示
pub fn render_failure_text(scenario: &Scenario, events: &[Event], error: &StepError) -> String {
    let mut out = header(scenario);
    out.push('\n');
    for (index, event) in events.iter().enumerate() {
        out.push_str(&event_line(index, event));
        out.push('\n');
    }
    out.push_str(&format!("\n{} {}\n", "停止:".red().bold(), error));
    out
}

/// 途中で停止したシナリオのJSON表示
pub fn render_failure_json(scenario: &Scenario, events: &[Event], error: &StepError) -> Result<String> {
    let report = FailureReport {
        scenario: &scenario.name,
        events,
        error: error.to_string(),
    };
    serde_json::to_string_pretty(&report).context("結果をJSONに変換できません")
}
