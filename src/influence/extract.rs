use crate::error::{Error, Result};
use crate::utils::voxel_grid::VoxelGrid;

/// 测量时打开束斑所用的固定权重
pub const ACTIVE_SPOT_WEIGHT: f64 = 100.0;

/// 提取选项
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExtractOptions {
    /// 稀疏矩阵保留的最小单位权重剂量，必须 >= 0
    pub cutoff: f64,
    /// 是否同时输出完整稠密网格
    pub emit_dense: bool,
    /// 引擎输出除以该值得到单位权重剂量
    pub spot_weight: f64,
}

impl ExtractOptions {
    pub fn new(cutoff: f64, emit_dense: bool) -> Self {
        Self {
            cutoff,
            emit_dense,
            spot_weight: ACTIVE_SPOT_WEIGHT,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !self.cutoff.is_finite() || self.cutoff < 0.0 {
            return Err(Error::InvalidConfig(format!(
                "cutoff 必须为非负有限值，当前为 {}",
                self.cutoff
            )));
        }
        if !self.spot_weight.is_finite() || self.spot_weight <= 0.0 {
            return Err(Error::InvalidConfig(format!(
                "spot_weight 必须为正数，当前为 {}",
                self.spot_weight
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DosePoint {
    /// 展平体素索引 z * nx * ny + y * nx + x
    pub voxel: usize,
    pub dose: f64,
}

/// 单个束斑的提取结果
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Extraction {
    pub points: Vec<DosePoint>,
    /// 被截断（0 < dose <= cutoff）剂量的总和，仅用于诊断
    pub sum_below_cutoff: f64,
    pub count_below_cutoff: usize,
    pub dense: Option<Vec<f64>>,
}

/// 将稠密剂量网格转换为稀疏点列表
///
/// 遍历顺序固定为 (z, y, x) 行主序，即网格数据的存储顺序。
pub fn extract(grid: &VoxelGrid, options: &ExtractOptions) -> Extraction {
    let mut extraction = Extraction {
        dense: options.emit_dense.then(|| Vec::with_capacity(grid.len())),
        ..Default::default()
    };

    for (voxel, raw) in grid.data.iter().enumerate() {
        let dose = raw / options.spot_weight;
        if dose > options.cutoff {
            extraction.points.push(DosePoint { voxel, dose });
        } else if dose > 0.0 {
            extraction.sum_below_cutoff += dose;
            extraction.count_below_cutoff += 1;
        }
        if let Some(dense) = extraction.dense.as_mut() {
            dense.push(dose);
        }
    }

    extraction
}
