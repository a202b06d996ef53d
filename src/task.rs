use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use serde::Serialize;
use uuid::Uuid;

use crate::influence::{ScanProgress, ScanSummary};

#[derive(Debug, Clone, Serialize)]
pub struct ChunkDescriptor {
    pub index: usize,
    /// 开始位置（包含），单位：元素索引
    pub start: usize,
    /// 结束位置（不包含），单位：元素索引
    pub end: usize,
}

/// 按 `chunk_size` 把 `[0, data_length)` 切成连续的块
pub fn split_chunks(data_length: usize, chunk_size: usize) -> Vec<ChunkDescriptor> {
    let chunk_size = chunk_size.max(1);
    (0..data_length)
        .step_by(chunk_size)
        .enumerate()
        .map(|(index, start)| ChunkDescriptor {
            index,
            start,
            end: (start + chunk_size).min(data_length),
        })
        .collect()
}

/// 体素对应表任务，分块存储计算结果
/// 使用 HashMap 独立存储每个 chunk，允许单独释放
pub struct MapTask {
    /// CT 维度 [nx, ny, nz]
    pub shape: [usize; 3],
    /// 分块描述列表
    pub chunks: Vec<ChunkDescriptor>,
    /// 每个 chunk 的数据，key 是 chunk_index
    /// None 表示正在计算，Some(Vec) 表示已就绪；被请求后移除以释放内存
    chunk_data: RwLock<HashMap<usize, Option<Vec<i32>>>>,
    failure: RwLock<Option<String>>,
}

impl MapTask {
    pub fn new(shape: [usize; 3], chunks: Vec<ChunkDescriptor>) -> Self {
        let chunk_data = chunks.iter().map(|d| (d.index, None)).collect();
        Self {
            shape,
            chunks,
            chunk_data: RwLock::new(chunk_data),
            failure: RwLock::new(None),
        }
    }

    /// 设置指定 chunk 的数据（后台计算完成后调用）
    pub fn set_chunk(&self, chunk_index: usize, data: Vec<i32>) {
        self.chunk_data.write().insert(chunk_index, Some(data));
    }

    /// 获取并移除指定 chunk 的数据
    /// chunk 不存在、尚未就绪或已被请求时返回 None
    pub fn take_chunk(&self, chunk_index: usize) -> Option<Vec<i32>> {
        let mut chunk_data = self.chunk_data.write();
        match chunk_data.get(&chunk_index) {
            Some(Some(_)) => chunk_data.remove(&chunk_index).flatten(),
            _ => None,
        }
    }

    pub fn is_chunk_ready(&self, chunk_index: usize) -> bool {
        self.chunk_data
            .read()
            .get(&chunk_index)
            .is_some_and(Option::is_some)
    }

    /// chunk 尚未被取走（无论是否就绪）
    pub fn has_chunk(&self, chunk_index: usize) -> bool {
        self.chunk_data.read().contains_key(&chunk_index)
    }

    pub fn mark_failed(&self, reason: String) {
        *self.failure.write() = Some(reason);
    }

    pub fn failure(&self) -> Option<String> {
        self.failure.read().clone()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanState {
    Queued,
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScanStatus {
    pub state: ScanState,
    pub progress: Option<ScanProgress>,
    pub summary: Option<ScanSummary>,
    pub error: Option<String>,
}

/// 影响矩阵扫描任务
pub struct ScanTask {
    pub plan_id: String,
    pub plan_dir: PathBuf,
    status: RwLock<ScanStatus>,
}

impl ScanTask {
    pub fn new(plan_id: String, plan_dir: PathBuf) -> Self {
        Self {
            plan_id,
            plan_dir,
            status: RwLock::new(ScanStatus {
                state: ScanState::Queued,
                progress: None,
                summary: None,
                error: None,
            }),
        }
    }

    pub fn status(&self) -> ScanStatus {
        self.status.read().clone()
    }

    pub fn mark_running(&self) {
        self.status.write().state = ScanState::Running;
    }

    pub fn set_progress(&self, progress: ScanProgress) {
        self.status.write().progress = Some(progress);
    }

    pub fn complete(&self, summary: ScanSummary) {
        let mut status = self.status.write();
        status.state = ScanState::Completed;
        status.summary = Some(summary);
    }

    pub fn fail(&self, error: String) {
        let mut status = self.status.write();
        status.state = ScanState::Failed;
        status.error = Some(error);
    }
}

struct TaskEntry<T> {
    data: Arc<T>,
    /// 任务创建时间，用于 TTL 过期检查
    created_at: Instant,
}

/// 带 TTL 的任务表，key 为 uuid v4 字符串
pub struct TaskStore<T> {
    tasks: RwLock<HashMap<String, TaskEntry<T>>>,
    default_ttl: Duration,
}

impl<T> TaskStore<T> {
    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            tasks: RwLock::new(HashMap::new()),
            default_ttl: ttl,
        }
    }

    pub fn insert(&self, data: T) -> (String, Arc<T>) {
        let task_id = Uuid::new_v4().to_string();
        let data = Arc::new(data);
        self.tasks.write().insert(
            task_id.clone(),
            TaskEntry {
                data: data.clone(),
                created_at: Instant::now(),
            },
        );
        (task_id, data)
    }

    pub fn get(&self, task_id: &str) -> Option<Arc<T>> {
        self.tasks.read().get(task_id).map(|entry| entry.data.clone())
    }

    /// 清理过期的任务，返回清理数量
    /// 正在运行的任务仍持有自己的 Arc，移除只影响查询
    pub fn cleanup_expired(&self) -> usize {
        let now = Instant::now();
        let mut tasks = self.tasks.write();
        let before_count = tasks.len();
        tasks.retain(|_, entry| now.duration_since(entry.created_at) < self.default_ttl);
        before_count - tasks.len()
    }

    pub fn task_count(&self) -> usize {
        self.tasks.read().len()
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }
}

impl<T> Default for TaskStore<T> {
    fn default() -> Self {
        // 30 分钟
        Self::with_ttl(Duration::from_secs(30 * 60))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_chunks_covers_range() {
        let chunks = split_chunks(10, 4);
        let bounds: Vec<(usize, usize)> = chunks.iter().map(|c| (c.start, c.end)).collect();
        assert_eq!(bounds, vec![(0, 4), (4, 8), (8, 10)]);
        assert_eq!(chunks[2].index, 2);
        assert!(split_chunks(0, 4).is_empty());
        assert_eq!(split_chunks(3, 0).len(), 3);
    }

    #[test]
    fn chunk_can_be_taken_once() {
        let task = MapTask::new([2, 1, 1], split_chunks(2, 1));
        assert!(!task.is_chunk_ready(0));
        assert_eq!(task.take_chunk(0), None);

        task.set_chunk(0, vec![7]);
        assert!(task.is_chunk_ready(0));
        assert_eq!(task.take_chunk(0), Some(vec![7]));
        assert_eq!(task.take_chunk(0), None);
        assert!(!task.is_chunk_ready(0));
        assert!(!task.has_chunk(0));
        assert!(task.has_chunk(1));
    }

    #[test]
    fn pending_chunk_is_not_removed_by_take() {
        let task = MapTask::new([1, 1, 1], split_chunks(1, 1));
        assert_eq!(task.take_chunk(0), None);
        task.set_chunk(0, vec![3]);
        assert_eq!(task.take_chunk(0), Some(vec![3]));
    }

    #[test]
    fn scan_task_transitions() {
        let task = ScanTask::new("p".to_string(), PathBuf::from("out/p"));
        assert_eq!(task.status().state, ScanState::Queued);
        task.mark_running();
        task.fail("boom".to_string());
        let status = task.status();
        assert_eq!(status.state, ScanState::Failed);
        assert_eq!(status.error.as_deref(), Some("boom"));
    }

    #[test]
    fn store_expires_tasks() {
        let store: TaskStore<u32> = TaskStore::default();
        let (id, value) = store.insert(5);
        assert_eq!(*value, 5);
        assert_eq!(store.get(&id).as_deref(), Some(&5));
        assert_eq!(store.cleanup_expired(), 0);

        let expiring: TaskStore<u32> = TaskStore::with_ttl(Duration::ZERO);
        let (id, _) = expiring.insert(1);
        assert_eq!(expiring.cleanup_expired(), 1);
        assert!(expiring.get(&id).is_none());
        assert_eq!(expiring.task_count(), 0);
    }
}
