use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::config::ScanDefaults;
use crate::performance::PerformanceStore;
use crate::task::{MapTask, ScanTask, TaskStore};
use crate::utils::parser_registry::ParserRegistry;

/// 全局应用状态，在各个 handler 之间共享解析器、目录与任务表
pub struct AppState {
    pub parser_registry: Arc<ParserRegistry>,
    pub resource_dir: PathBuf,
    pub scan_defaults: ScanDefaults,
    pub map_tasks: Arc<TaskStore<MapTask>>,
    pub scan_tasks: Arc<TaskStore<ScanTask>>,
    pub performance_store: Arc<PerformanceStore>,
    /// 同一时刻只允许一个扫描驱动引擎
    pub scan_lock: Arc<Mutex<()>>,
}

impl AppState {
    pub fn new(
        parser_registry: Arc<ParserRegistry>,
        resource_dir: PathBuf,
        scan_defaults: ScanDefaults,
        task_ttl: std::time::Duration,
    ) -> Self {
        Self {
            parser_registry,
            resource_dir,
            scan_defaults,
            map_tasks: Arc::new(TaskStore::with_ttl(task_ttl)),
            scan_tasks: Arc::new(TaskStore::with_ttl(task_ttl)),
            performance_store: Arc::new(PerformanceStore::with_ttl(task_ttl)),
            scan_lock: Arc::new(Mutex::new(())),
        }
    }
}
