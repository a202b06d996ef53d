mod app_state;
mod config;
mod engine;
mod error;
mod handlers;
mod influence;
mod mapping;
mod parsers;
mod performance;
mod routes;
mod store;
mod task;
mod utils;

use std::sync::Arc;
use std::time::Duration;

use actix_web::{App, HttpServer, web};
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::utils::parser_registry::ParserRegistry;
use app_state::AppState;
use config::Args;

const DEFAULT_LOG_FILTER: &str = "influence_matrix_backend=info,actix_web=info";

/// 过期任务清理间隔
const CLEANUP_INTERVAL: Duration = Duration::from_secs(5 * 60);

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let args = Args::parse();
    if let Err(e) = args.validate() {
        error!("{}", e);
        return Err(std::io::Error::new(std::io::ErrorKind::InvalidInput, e.to_string()));
    }

    // 初始化解析器注册表
    let parser_registry = Arc::new(ParserRegistry::new());
    info!(extensions = ?parser_registry.supported_extensions(), "已注册的解析器");

    let app_state = web::Data::new(AppState::new(
        parser_registry,
        args.resource_dir.clone(),
        args.scan_defaults(),
        args.task_ttl(),
    ));

    // 定期清理过期的任务与性能记录，避免长期占用内存
    let map_tasks = app_state.map_tasks.clone();
    let scan_tasks = app_state.scan_tasks.clone();
    let performance_store = app_state.performance_store.clone();
    actix_web::rt::spawn(async move {
        let mut interval = actix_web::rt::time::interval(CLEANUP_INTERVAL);
        loop {
            interval.tick().await;
            let maps = map_tasks.cleanup_expired();
            let scans = scan_tasks.cleanup_expired();
            let sessions = performance_store.cleanup_expired();
            if maps + scans + sessions > 0 {
                info!(
                    maps,
                    scans,
                    sessions,
                    remaining_maps = map_tasks.task_count(),
                    remaining_scans = scan_tasks.task_count(),
                    "清理过期任务"
                );
            }
        }
    });

    info!(
        bind = %args.bind,
        port = args.port,
        resource_dir = %args.resource_dir.display(),
        output_dir = %args.output_dir.display(),
        cutoff = args.cutoff,
        export_full = args.export_full,
        index_scheme = ?args.index_scheme,
        task_ttl_minutes = app_state.scan_tasks.default_ttl().as_secs() / 60,
        "服务器启动"
    );

    HttpServer::new(move || {
        App::new()
            .app_data(app_state.clone())
            .configure(routes::configure)
    })
    .bind((args.bind.as_str(), args.port))?
    .run()
    .await
}
