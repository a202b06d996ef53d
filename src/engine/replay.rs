use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Deserialize;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::influence::plan::{Beam, BeamInfo, PlanProvider, Spot};
use crate::mapping::{CtGeometry, UniformGrid};
use crate::utils::parser_registry::ParserRegistry;
use crate::utils::voxel_grid::VoxelGrid;

pub const MANIFEST_FILE: &str = "plan.json";

/// 计划目录下的 `plan.json`
#[derive(Debug, Clone, Deserialize)]
pub struct PlanManifest {
    pub plan_id: String,
    pub beams: Vec<Beam>,
    #[serde(default)]
    pub dose_grid: Option<UniformGrid>,
    #[serde(default)]
    pub ct: Option<CtGeometry>,
}

/// 单位权重束斑剂量文件的文件名（不含扩展名）
pub fn spot_file_stem(layer: usize, spot: usize) -> String {
    format!("layer{}_spot{}", layer, spot)
}

/// 基于预计算束斑剂量的回放引擎
///
/// 每个束斑在 `<plan_dir>/<beam_id>/layer<L>_spot<S>.<ext>` 下有一张单位权重剂量网格，
/// 重算即对已推送权重非零的束斑做加权求和。网格每次从磁盘读取，不做缓存。
pub struct ReplayPlan {
    manifest: PlanManifest,
    /// 已推送给引擎的权重，`apply_parameters` 时从可编辑参数复制
    applied: Vec<Vec<Vec<f64>>>,
    spot_files: Vec<Vec<Vec<PathBuf>>>,
    shape: [usize; 3],
    doses: Vec<Option<VoxelGrid>>,
    registry: Arc<ParserRegistry>,
}

impl ReplayPlan {
    pub fn load(plan_dir: &Path, registry: Arc<ParserRegistry>) -> Result<Self> {
        let text = fs::read_to_string(plan_dir.join(MANIFEST_FILE))?;
        let manifest: PlanManifest = serde_json::from_str(&text)?;
        if manifest.beams.is_empty() {
            return Err(Error::InvalidPlan(format!(
                "计划 {} 没有射束",
                manifest.plan_id
            )));
        }
        if let Some(grid) = &manifest.dose_grid {
            grid.validate()?;
        }
        if let Some(ct) = &manifest.ct {
            ct.validate()?;
        }

        // 步骤 1: 定位全部束斑剂量文件
        let mut spot_files = Vec::with_capacity(manifest.beams.len());
        for beam in &manifest.beams {
            let beam_dir = plan_dir.join(&beam.info.id);
            let mut layers = Vec::with_capacity(beam.layers.len());
            for (l, layer) in beam.layers.iter().enumerate() {
                let mut files = Vec::with_capacity(layer.spots.len());
                for s in 0..layer.spots.len() {
                    let stem = spot_file_stem(l, s);
                    let path = registry.resolve_file(&beam_dir, &stem).ok_or_else(|| {
                        Error::InvalidPlan(format!(
                            "射束 {} 缺少剂量文件 {}/{}.*",
                            beam.info.id,
                            beam_dir.display(),
                            stem
                        ))
                    })?;
                    files.push(path);
                }
                layers.push(files);
            }
            spot_files.push(layers);
        }

        // 步骤 2: 用第一张网格确定剂量形状
        let first = spot_files
            .iter()
            .flatten()
            .flatten()
            .next()
            .ok_or_else(|| Error::InvalidPlan(format!("计划 {} 没有束斑", manifest.plan_id)))?;
        let parser = registry.find_parser_for_file(first).ok_or_else(|| Error::Parse {
            file: first.display().to_string(),
            details: "没有匹配的解析器".to_string(),
        })?;
        let shape = parser.get_shape_from_file(first)?;
        if let Some(grid) = &manifest.dose_grid {
            if grid.shape != shape {
                return Err(Error::InvalidPlan(format!(
                    "dose_grid 形状 {:?} 与剂量文件形状 {:?} 不一致",
                    grid.shape, shape
                )));
            }
        }

        let applied = manifest
            .beams
            .iter()
            .map(|beam| {
                beam.layers
                    .iter()
                    .map(|layer| layer.spots.iter().map(|s| s.weight).collect())
                    .collect()
            })
            .collect();
        let doses = vec![None; manifest.beams.len()];

        info!(
            plan = %manifest.plan_id,
            beams = manifest.beams.len(),
            shape = ?shape,
            "回放计划已加载"
        );

        Ok(Self {
            manifest,
            applied,
            spot_files,
            shape,
            doses,
            registry,
        })
    }

    pub fn total_spots(&self) -> usize {
        self.manifest
            .beams
            .iter()
            .map(|b| (0..b.layer_count()).map(|l| b.spot_count(l)).sum::<usize>())
            .sum()
    }

    fn read_grid(&self, path: &Path) -> Result<VoxelGrid> {
        let parser = self
            .registry
            .find_parser_for_file(path)
            .ok_or_else(|| Error::Parse {
                file: path.display().to_string(),
                details: "没有匹配的解析器".to_string(),
            })?;
        let grid = parser.parse_from_file(path)?;
        if grid.shape != self.shape {
            return Err(Error::InvalidGrid(format!(
                "{} 形状为 {:?}，计划剂量形状为 {:?}",
                path.display(),
                grid.shape,
                self.shape
            )));
        }
        debug!(file = %path.display(), parser = parser.name(), "剂量网格已解析");
        Ok(grid)
    }
}

impl PlanProvider for ReplayPlan {
    fn plan_id(&self) -> &str {
        &self.manifest.plan_id
    }

    fn beam_count(&self) -> usize {
        self.manifest.beams.len()
    }

    fn beam_info(&self, beam: usize) -> &BeamInfo {
        &self.manifest.beams[beam].info
    }

    fn layer_count(&self, beam: usize) -> usize {
        self.manifest.beams[beam].layer_count()
    }

    fn spot_count(&self, beam: usize, layer: usize) -> usize {
        self.manifest.beams[beam].spot_count(layer)
    }

    fn spot(&self, beam: usize, layer: usize, spot: usize) -> &Spot {
        &self.manifest.beams[beam].layers[layer].spots[spot]
    }

    fn layer_energy_mev(&self, beam: usize, layer: usize) -> f64 {
        self.manifest.beams[beam].layers[layer].energy_mev
    }

    fn set_spot_weight(&mut self, beam: usize, layer: usize, spot: usize, weight: f64) {
        self.manifest.beams[beam].layers[layer].spots[spot].weight = weight;
    }

    fn apply_parameters(&mut self, beam: usize) -> Result<()> {
        let layers = &self.manifest.beams[beam].layers;
        for (layer, applied) in layers.iter().zip(self.applied[beam].iter_mut()) {
            for (spot, weight) in layer.spots.iter().zip(applied.iter_mut()) {
                *weight = spot.weight;
            }
        }
        Ok(())
    }

    fn recalculate(&mut self) -> Result<()> {
        for beam in 0..self.manifest.beams.len() {
            let mut dose: Option<VoxelGrid> = None;
            for (l, spots) in self.applied[beam].iter().enumerate() {
                for (s, weight) in spots.iter().enumerate() {
                    if *weight == 0.0 {
                        continue;
                    }
                    let grid = self.read_grid(&self.spot_files[beam][l][s])?;
                    dose.get_or_insert_with(|| VoxelGrid::zeros(self.shape))
                        .add_scaled(&grid, *weight)?;
                }
            }
            self.doses[beam] = dose;
        }
        Ok(())
    }

    fn beam_dose(&self, beam: usize) -> Result<VoxelGrid> {
        self.doses[beam].clone().ok_or_else(|| Error::DoseMissing {
            plan: self.manifest.plan_id.clone(),
            beam: self.manifest.beams[beam].info.id.clone(),
        })
    }

    fn dose_geometry(&self) -> Option<UniformGrid> {
        self.manifest.dose_grid
    }

    fn ct_geometry(&self) -> Option<CtGeometry> {
        self.manifest.ct
    }
}
