/*
 * arclight CLI - コマンドライン引数処理モジュール
 *
 * コマンドライン引数を解析し、シナリオの実行と結果の出力を行います。
 */

use std::path::PathBuf;

use anyhow::{Context, Result};
use arclight_runtime::{TrackerConfig, VERSION};
use clap::{Args, Parser, Subcommand, ValueEnum};
use colored::Colorize;
use log::{debug, info};

use crate::report;
use crate::runner::Runner;
use crate::scenario::{self, Scenario};

/// 参照カウントによる所有権シナリオの再生ツール
#[derive(Parser)]
#[command(name = "arclight")]
#[command(version = VERSION)]
#[command(about = "参照カウント所有権シナリオの再生ツール", long_about = None)]
pub struct Cli {
    /// 詳細なログ出力を有効にする
    #[arg(short, long, global = true, default_value = "false")]
    pub verbose: bool,

    /// 不要な出力を抑制する
    #[arg(short, long, global = true, default_value = "false")]
    pub quiet: bool,

    /// トラッカー設定ファイルへのパス
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// カラー表示を無効にする
    #[arg(long, global = true, default_value = "false")]
    pub no_color: bool,

    /// サブコマンド
    #[command(subcommand)]
    pub command: Commands,
}

/// サブコマンド
#[derive(Subcommand)]
pub enum Commands {
    /// シナリオファイルを実行
    Run(RunArgs),

    /// 組み込みのウォークスルーを実行（名前を省略すると一覧を表示）
    Walkthrough(WalkthroughArgs),
}

/// 実行サブコマンドの引数
#[derive(Args)]
pub struct RunArgs {
    /// シナリオファイル（TOML）
    #[arg(required = true)]
    pub scenario: PathBuf,

    /// 出力形式
    #[arg(short, long, value_enum, default_value = "text")]
    pub format: OutputFormat,
}

/// ウォークスルーサブコマンドの引数
#[derive(Args)]
pub struct WalkthroughArgs {
    /// ウォークスルー名
    pub name: Option<String>,

    /// 出力形式
    #[arg(short, long, value_enum, default_value = "text")]
    pub format: OutputFormat,
}

/// 出力形式
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// 人が読むためのテキスト
    Text,
    /// JSON
    Json,
}

/// CLIのコマンドを実行
pub fn run(cli: &Cli) -> Result<()> {
    setup_logging(cli.verbose, cli.quiet)?;
    if cli.no_color {
        colored::control::set_override(false);
    }

    let config = load_config(cli)?;
    match &cli.command {
        Commands::Run(args) => {
            let scenario = Scenario::load(&args.scenario)?;
            replay(&scenario, config, args.format)
        }
        Commands::Walkthrough(args) => match &args.name {
            Some(name) => {
                let scenario = Scenario::builtin(name)?;
                replay(&scenario, config, args.format)
            }
            None => list_walkthroughs(args.format),
        },
    }
}

/// ログ設定を初期化
fn setup_logging(verbose: bool, quiet: bool) -> Result<()> {
    let env = env_logger::Env::default().filter_or(
        "ARCLIGHT_LOG",
        if verbose {
            "debug"
        } else if quiet {
            "error"
        } else {
            "warn"
        },
    );

    env_logger::Builder::from_env(env)
        .format_timestamp(Some(env_logger::TimestampPrecision::Millis))
        .format_module_path(verbose)
        .try_init()
        .context("ロガーを初期化できません")?;

    Ok(())
}

fn load_config(cli: &Cli) -> Result<TrackerConfig> {
    match &cli.config {
        Some(path) => {
            let config = TrackerConfig::load(path)
                .with_context(|| format!("設定ファイル {} の読み込みに失敗しました", path.display()))?;
            debug!("設定を読み込みました: {:?}", config);
            Ok(config)
        }
        None => Ok(TrackerConfig::default()),
    }
}

/// シナリオを実行して結果を出力する
fn replay(scenario: &Scenario, config: TrackerConfig, format: OutputFormat) -> Result<()> {
    let mut runner = Runner::new(config);
    match runner.run(scenario) {
        Ok(()) => {
            let outcome = runner.finish(scenario);
            info!(
                "シナリオ '{}' が完了しました（イベント数: {}）",
                scenario.name,
                outcome.events.len()
            );
            match format {
                OutputFormat::Text => print!("{}", report::render_text(scenario, &outcome)),
                OutputFormat::Json => println!("{}", report::render_json(&outcome)?),
            }
            Ok(())
        }
        Err(err) => {
            let events = runner.abandon();
            match format {
                OutputFormat::Text => {
                    print!("{}", report::render_failure_text(scenario, &events, &err))
                }
                OutputFormat::Json => {
                    println!("{}", report::render_failure_json(scenario, &events, &err)?)
                }
            }
            Err(err).with_context(|| format!("シナリオ '{}' は失敗しました", scenario.name))
        }
    }
}

fn list_walkthroughs(format: OutputFormat) -> Result<()> {
    let scenarios = scenario::builtins()?;
    match format {
        OutputFormat::Text => {
            for scenario in &scenarios {
                println!("{:<16} {}", scenario.name.green(), scenario.description);
            }
        }
        OutputFormat::Json => {
            let listing: Vec<_> = scenarios
                .iter()
                .map(|scenario| {
                    serde_json::json!({
                        "name": scenario.name,
                        "description": scenario.description,
                        "steps": scenario.step_count(),
                    })
                })
                .collect();
            println!("{}", serde_json::to_string_pretty(&listing)?);
        }
    }
    Ok(())
}
