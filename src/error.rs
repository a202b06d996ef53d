use thiserror::Error;

/// 服务内部统一的错误类型
#[derive(Debug, Error)]
pub enum Error {
    #[error("I/O 错误: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON 处理失败: {0}")]
    Json(#[from] serde_json::Error),

    /// 读取不存在的数据集，由调用方决定是"首次运行"还是数据损坏
    #[error("数据集不存在: {0}")]
    DatasetNotFound(String),

    #[error("数据集 {name} 不匹配: {details}")]
    DatasetMismatch { name: String, details: String },

    #[error("HDF5 错误: {0}")]
    Hdf5(#[from] hdf5::Error),

    /// 剂量重算失败，整个扫描中止
    #[error("计划 {plan} 剂量计算失败 (层 {layer}, 点 {spot}): {reason}")]
    CalculationFailed {
        plan: String,
        layer: usize,
        spot: usize,
        reason: String,
    },

    #[error("计划 {plan} 射束 {beam} 剂量不存在")]
    DoseMissing { plan: String, beam: String },

    #[error("体素网格无效: {0}")]
    InvalidGrid(String),

    #[error("计划无效: {0}")]
    InvalidPlan(String),

    #[error("配置无效: {0}")]
    InvalidConfig(String),

    #[error("解析文件 {file} 失败: {details}")]
    Parse { file: String, details: String },
}

pub type Result<T> = std::result::Result<T, Error>;
