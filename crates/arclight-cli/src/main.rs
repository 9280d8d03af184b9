/*
 * arclight CLI - メインエントリーポイント
 *
 * 所有権シナリオ再生ツールのエントリーポイントです。
 * コマンドライン引数の解析と処理ロジックを呼び出します。
 */

use clap::Parser;

mod cli;
mod report;
mod runner;
mod scenario;

fn main() -> anyhow::Result<()> {
    let cli = cli::Cli::parse();
    cli::run(&cli)
}
