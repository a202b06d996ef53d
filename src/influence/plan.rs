use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::mapping::{CtGeometry, UniformGrid};
use crate::utils::voxel_grid::VoxelGrid;

/// 单个点扫描束斑
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Spot {
    pub x_mm: f32,
    pub y_mm: f32,
    /// 仅作为开关使用：0 或激活常量
    #[serde(default)]
    pub weight: f64,
}

/// 能量层
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Layer {
    pub energy_mev: f64,
    pub spots: Vec<Spot>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct IsoCenter {
    pub x_mm: f64,
    pub y_mm: f64,
    pub z_mm: f64,
}

/// 射束几何与机器信息，写入射束元数据
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BeamInfo {
    pub id: String,
    #[serde(default)]
    pub gantry_angle: f64,
    #[serde(default)]
    pub couch_angle: f64,
    #[serde(default)]
    pub iso_center: IsoCenter,
    #[serde(default)]
    pub energy_mode: String,
    #[serde(default)]
    pub machine_name: String,
    #[serde(default)]
    pub ssd_mm: Option<f64>,
}

/// 射束：元数据 + 有序能量层
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Beam {
    #[serde(flatten)]
    pub info: BeamInfo,
    pub layers: Vec<Layer>,
}

impl Beam {
    pub fn layer_count(&self) -> usize {
        self.layers.len()
    }

    pub fn spot_count(&self, layer: usize) -> usize {
        self.layers.get(layer).map_or(0, |l| l.spots.len())
    }
}

/// 外部剂量计算引擎 / 治疗计划的访问接口
///
/// 束斑权重先在可编辑参数上修改，`apply_parameters` 之后才对引擎可见；
/// `recalculate` 阻塞直到计算完成。
pub trait PlanProvider {
    fn plan_id(&self) -> &str;

    fn beam_count(&self) -> usize;

    fn beam_info(&self, beam: usize) -> &BeamInfo;

    fn layer_count(&self, beam: usize) -> usize;

    fn spot_count(&self, beam: usize, layer: usize) -> usize;

    /// 束斑参数（可编辑副本）
    fn spot(&self, beam: usize, layer: usize, spot: usize) -> &Spot;

    fn layer_energy_mev(&self, beam: usize, layer: usize) -> f64;

    fn set_spot_weight(&mut self, beam: usize, layer: usize, spot: usize, weight: f64);

    /// 将射束的可编辑参数推送给引擎
    fn apply_parameters(&mut self, beam: usize) -> Result<()>;

    /// 对整个计划重新计算剂量，失败视为致命错误
    fn recalculate(&mut self) -> Result<()>;

    /// 最近一次计算后该射束的剂量网格（引擎原始输出，未除以束斑权重）
    fn beam_dose(&self, beam: usize) -> Result<VoxelGrid>;

    /// 剂量计算网格（优化体素），未知时为 None
    fn dose_geometry(&self) -> Option<UniformGrid> {
        None
    }

    fn ct_geometry(&self) -> Option<CtGeometry> {
        None
    }
}

/// 将所有射束的所有束斑权重置零并推送
pub fn set_all_spots_to_zero<P: PlanProvider + ?Sized>(plan: &mut P) -> Result<()> {
    for beam in 0..plan.beam_count() {
        for layer in 0..plan.layer_count(beam) {
            for spot in 0..plan.spot_count(beam, layer) {
                plan.set_spot_weight(beam, layer, spot, 0.0);
            }
        }
        plan.apply_parameters(beam)?;
    }
    Ok(())
}
