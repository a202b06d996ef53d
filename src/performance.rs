use std::collections::HashMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// 性能数据记录
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceRecord {
    /// 开始时间 (Unix 时间戳，毫秒)
    pub start_time: u64,
    /// 结束时间 (Unix 时间戳，毫秒)
    pub end_time: u64,
    /// 行组 (同一行组颜色相同)，例如 "recalculate"、"extract"
    pub channel_group: String,
    /// 行号，例如射束 ID
    pub channel_index: String,
    /// 消息 (hover 时除了时间外的显示信息)
    pub msg: String,
}

impl PerformanceRecord {
    /// 以当前时间为结束时间，按耗时倒推开始时间
    pub fn ending_now(
        elapsed: Duration,
        channel_group: impl Into<String>,
        channel_index: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        let end_time = get_unix_timestamp_ms();
        Self {
            start_time: end_time.saturating_sub(elapsed.as_millis() as u64),
            end_time,
            channel_group: channel_group.into(),
            channel_index: channel_index.into(),
            msg: msg.into(),
        }
    }
}

/// 性能数据存储
/// 按 session_id 存储性能记录，扫描任务以 task_id 作为 session_id
pub struct PerformanceStore {
    /// session_id -> 性能记录列表
    records: RwLock<HashMap<String, Vec<PerformanceRecord>>>,
    default_ttl: Duration,
    /// session_id -> 创建时间
    session_times: RwLock<HashMap<String, SystemTime>>,
}

impl PerformanceStore {
    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            default_ttl: ttl,
            session_times: RwLock::new(HashMap::new()),
        }
    }

    /// 添加性能记录
    pub fn add_record(&self, session_id: &str, record: PerformanceRecord) {
        let mut records = self.records.write();
        records
            .entry(session_id.to_string())
            .or_default()
            .push(record);

        // 记录会话创建时间（如果还没有）
        let mut session_times = self.session_times.write();
        session_times
            .entry(session_id.to_string())
            .or_insert_with(SystemTime::now);
    }

    /// 获取指定会话的所有性能记录
    pub fn get_records(&self, session_id: &str) -> Option<Vec<PerformanceRecord>> {
        self.records.read().get(session_id).cloned()
    }

    /// 清理过期的会话
    pub fn cleanup_expired(&self) -> usize {
        let now = SystemTime::now();
        let mut records = self.records.write();
        let mut session_times = self.session_times.write();
        let before_count = records.len();

        let expired_sessions: Vec<String> = session_times
            .iter()
            .filter(|(_, created_at)| {
                now.duration_since(**created_at).unwrap_or(Duration::ZERO) >= self.default_ttl
            })
            .map(|(session_id, _)| session_id.clone())
            .collect();

        for session_id in &expired_sessions {
            records.remove(session_id);
            session_times.remove(session_id);
        }

        before_count - records.len()
    }
}

impl Default for PerformanceStore {
    fn default() -> Self {
        // 30 分钟
        Self::with_ttl(Duration::from_secs(30 * 60))
    }
}

/// 获取 Unix 时间戳（毫秒），系统时钟早于 1970 年时返回 0
pub fn get_unix_timestamp_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
