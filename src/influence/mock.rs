//! 测试用的内存计划：记录每次重算时处于激活状态的束斑

use crate::error::{Error, Result};
use crate::influence::plan::{Beam, BeamInfo, Layer, PlanProvider, Spot};
use crate::mapping::{CtGeometry, UniformGrid};
use crate::utils::voxel_grid::VoxelGrid;

pub struct MockPlan {
    pub id: String,
    pub beams: Vec<Beam>,
    applied: Vec<Vec<Vec<f64>>>,
    shape: [usize; 3],
    doses: Vec<Option<VoxelGrid>>,
    pub recalculations: usize,
    /// 第 n 次（从 1 开始）重算返回错误
    pub fail_on_call: Option<usize>,
    /// 第 n 次重算起改用新的剂量形状
    pub reshape_on_call: Option<(usize, [usize; 3])>,
    /// 重算后不产生剂量
    pub drop_doses: bool,
    /// 每次重算时权重非零的 (beam, layer, spot)
    pub active_history: Vec<Vec<(usize, usize, usize)>>,
    pub applied_weights_seen: Vec<f64>,
    pub dose_geometry: Option<UniformGrid>,
    pub ct_geometry: Option<CtGeometry>,
}

impl MockPlan {
    /// `spot_counts[b][l]` 为射束 b 第 l 层的束斑数，射束依次命名为 A, B, C...
    pub fn new(spot_counts: &[&[usize]]) -> Self {
        let beams: Vec<Beam> = spot_counts
            .iter()
            .enumerate()
            .map(|(b, layers)| Beam {
                info: BeamInfo {
                    id: char::from(b'A' + b as u8).to_string(),
                    gantry_angle: 90.0 * b as f64,
                    ..Default::default()
                },
                layers: layers
                    .iter()
                    .enumerate()
                    .map(|(l, count)| Layer {
                        energy_mev: 100.0 + 10.0 * l as f64,
                        spots: (0..*count)
                            .map(|s| Spot {
                                x_mm: s as f32,
                                y_mm: -(l as f32),
                                weight: 0.0,
                            })
                            .collect(),
                    })
                    .collect(),
            })
            .collect();

        let applied = beams
            .iter()
            .map(|beam| beam.layers.iter().map(|l| vec![0.0; l.spots.len()]).collect())
            .collect();
        let doses = vec![None; beams.len()];

        Self {
            id: "mock-plan".to_string(),
            beams,
            applied,
            shape: [4, 3, 2],
            doses,
            recalculations: 0,
            fail_on_call: None,
            reshape_on_call: None,
            drop_doses: false,
            active_history: Vec::new(),
            applied_weights_seen: Vec::new(),
            dose_geometry: None,
            ct_geometry: None,
        }
    }

    pub fn voxel_count(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn all_weights_zero(&self) -> bool {
        let editable = self
            .beams
            .iter()
            .flat_map(|b| &b.layers)
            .flat_map(|l| &l.spots)
            .all(|s| s.weight == 0.0);
        let applied = self.applied.iter().flatten().flatten().all(|w| *w == 0.0);
        editable && applied
    }
}

impl PlanProvider for MockPlan {
    fn plan_id(&self) -> &str {
        &self.id
    }

    fn beam_count(&self) -> usize {
        self.beams.len()
    }

    fn beam_info(&self, beam: usize) -> &BeamInfo {
        &self.beams[beam].info
    }

    fn layer_count(&self, beam: usize) -> usize {
        self.beams[beam].layer_count()
    }

    fn spot_count(&self, beam: usize, layer: usize) -> usize {
        self.beams[beam].spot_count(layer)
    }

    fn spot(&self, beam: usize, layer: usize, spot: usize) -> &Spot {
        &self.beams[beam].layers[layer].spots[spot]
    }

    fn layer_energy_mev(&self, beam: usize, layer: usize) -> f64 {
        self.beams[beam].layers[layer].energy_mev
    }

    fn set_spot_weight(&mut self, beam: usize, layer: usize, spot: usize, weight: f64) {
        self.beams[beam].layers[layer].spots[spot].weight = weight;
    }

    fn apply_parameters(&mut self, beam: usize) -> Result<()> {
        for (layer, applied) in self.beams[beam].layers.iter().zip(&mut self.applied[beam]) {
            for (spot, weight) in layer.spots.iter().zip(applied.iter_mut()) {
                *weight = spot.weight;
            }
        }
        Ok(())
    }

    fn recalculate(&mut self) -> Result<()> {
        self.recalculations += 1;
        if self.fail_on_call == Some(self.recalculations) {
            return Err(Error::InvalidPlan("模拟引擎故障".to_string()));
        }
        if let Some((call, shape)) = self.reshape_on_call {
            if call == self.recalculations {
                self.shape = shape;
            }
        }

        let mut active = Vec::new();
        for (b, layers) in self.applied.iter().enumerate() {
            let mut dose: Option<VoxelGrid> = None;
            for (l, spots) in layers.iter().enumerate() {
                for (s, weight) in spots.iter().enumerate() {
                    if *weight == 0.0 {
                        continue;
                    }
                    active.push((b, l, s));
                    self.applied_weights_seen.push(*weight);
                    let grid = dose.get_or_insert_with(|| VoxelGrid::zeros(self.shape));
                    let voxel = (l * 7 + s) % grid.len();
                    grid.data[voxel] += weight * (1.0 + l as f64);
                }
            }
            self.doses[b] = if self.drop_doses { None } else { dose };
        }
        self.active_history.push(active);
        Ok(())
    }

    fn beam_dose(&self, beam: usize) -> Result<VoxelGrid> {
        self.doses[beam].clone().ok_or_else(|| Error::DoseMissing {
            plan: self.id.clone(),
            beam: self.beams[beam].info.id.clone(),
        })
    }

    fn dose_geometry(&self) -> Option<UniformGrid> {
        self.dose_geometry
    }

    fn ct_geometry(&self) -> Option<CtGeometry> {
        self.ct_geometry
    }
}
