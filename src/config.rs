use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use serde::Serialize;

use crate::error::{Error, Result};
use crate::influence::IndexScheme;

/// 命令行参数，每一项都可以用 INFMATRIX_* 环境变量覆盖
#[derive(Parser, Debug, Clone)]
#[command(name = "influence-matrix-backend", version, about = "质子点扫描影响矩阵计算服务")]
pub struct Args {
    /// 监听地址
    #[arg(long, env = "INFMATRIX_BIND", default_value = "127.0.0.1")]
    pub bind: String,

    #[arg(long, env = "INFMATRIX_PORT", default_value_t = 8080)]
    pub port: u16,

    /// 计划目录所在的根目录
    #[arg(long, env = "INFMATRIX_RESOURCE_DIR", default_value = "test/resource")]
    pub resource_dir: PathBuf,

    /// 结果输出根目录，每个计划写入 <output_dir>/<plan_id>
    #[arg(long, env = "INFMATRIX_OUTPUT_DIR", default_value = "results")]
    pub output_dir: PathBuf,

    /// 稀疏矩阵截断阈值（单位权重剂量）
    #[arg(long, env = "INFMATRIX_CUTOFF", default_value_t = 0.015)]
    pub cutoff: f64,

    /// 同时导出完整稠密矩阵
    #[arg(long, env = "INFMATRIX_EXPORT_FULL")]
    pub export_full: bool,

    /// 稀疏行格式: per-beam-flat 或 layer-spot-voxel
    #[arg(long, env = "INFMATRIX_INDEX_SCHEME", default_value = "per-beam-flat")]
    pub index_scheme: IndexScheme,

    /// 任务与性能记录的保留时间（分钟）
    #[arg(long, env = "INFMATRIX_TASK_TTL_MINUTES", default_value_t = 30)]
    pub task_ttl_minutes: u64,
}

/// 扫描请求未指定时使用的默认值
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScanDefaults {
    pub output_dir: PathBuf,
    pub cutoff: f64,
    pub export_full: bool,
    pub index_scheme: IndexScheme,
}

impl Args {
    pub fn validate(&self) -> Result<()> {
        if !self.cutoff.is_finite() || self.cutoff < 0.0 {
            return Err(Error::InvalidConfig(format!(
                "--cutoff 必须为非负数，当前为 {}",
                self.cutoff
            )));
        }
        if self.task_ttl_minutes == 0 {
            return Err(Error::InvalidConfig("--task-ttl-minutes 必须大于 0".to_string()));
        }
        Ok(())
    }

    pub fn scan_defaults(&self) -> ScanDefaults {
        ScanDefaults {
            output_dir: self.output_dir.clone(),
            cutoff: self.cutoff,
            export_full: self.export_full,
            index_scheme: self.index_scheme,
        }
    }

    pub fn task_ttl(&self) -> Duration {
        Duration::from_secs(self.task_ttl_minutes * 60)
    }
}
