//! bee-core 维护入口
//!
//! 初始化日志与配置，打开持久化的记忆图，跑一遍维护（降级、晋升、压缩、回收），
//! 落盘后以 JSON 打印统计。用法：bee-core [--config path/to/config.toml]

use std::path::PathBuf;

use anyhow::Context;
use bee_core::{
    config::load_config,
    memory::{GraphStore, SharedGraph},
    observability,
};
use chrono::Utc;

fn config_arg() -> Option<PathBuf> {
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--config" {
            return args.next().map(PathBuf::from);
        }
        if let Some(path) = arg.strip_prefix("--config=") {
            return Some(PathBuf::from(path));
        }
    }
    None
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    observability::init();

    let cfg = load_config(config_arg()).context("Failed to load config")?;
    std::fs::create_dir_all(&cfg.app.data_dir)
        .with_context(|| format!("Failed to create data dir {}", cfg.app.data_dir.display()))?;

    let path = cfg.graph_path();
    let graph = SharedGraph::open(GraphStore::new(&path), &cfg.graph)
        .with_context(|| format!("Failed to open memory graph at {}", path.display()))?;

    let report = graph.write().await.run_maintenance_at(Utc::now());
    tracing::info!(
        demoted = report.demoted.len(),
        promoted = report.promoted.len(),
        compacted = report.compacted,
        collected = report.collected.len(),
        "maintenance pass complete"
    );

    graph.save().await.context("Failed to save memory graph")?;

    let stats = graph.read().await.stats();
    let out = serde_json::json!({ "maintenance": report, "stats": stats });
    println!("{}", serde_json::to_string_pretty(&out).context("Failed to render stats")?);
    Ok(())
}
