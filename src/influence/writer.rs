use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::influence::extract::DosePoint;
use crate::store::{ChunkedStore, Element, STORE_EXTENSION};

pub const SPARSE_DATASET: &str = "/inf_matrix_sparse";
pub const FULL_DATASET: &str = "/inf_matrix_full";
pub const LAYER_SPOT_INDICES_DATASET: &str = "/layer_spot_indices";
pub const SPOT_ID_DATASET: &str = "/spots/id";
pub const SPOT_X_DATASET: &str = "/spots/position_x_mm";
pub const SPOT_Y_DATASET: &str = "/spots/position_y_mm";
pub const SPOT_ENERGY_DATASET: &str = "/spots/energy_layer_MeV";

/// 稀疏矩阵行格式
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IndexScheme {
    /// [voxel, spot_id, dose]
    #[default]
    PerBeamFlat,
    /// [layer, spot, voxel, dose]
    LayerSpotVoxel,
}

impl IndexScheme {
    pub fn columns(self) -> usize {
        match self {
            IndexScheme::PerBeamFlat => 3,
            IndexScheme::LayerSpotVoxel => 4,
        }
    }
}

impl std::str::FromStr for IndexScheme {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "per-beam-flat" => Ok(IndexScheme::PerBeamFlat),
            "layer-spot-voxel" => Ok(IndexScheme::LayerSpotVoxel),
            other => Err(format!(
                "未知的索引格式 {}，可选: per-beam-flat, layer-spot-voxel",
                other
            )),
        }
    }
}

/// 写入时标识一个束斑：射束内连续编号 + 原始层/点序号
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpotKey {
    pub spot_id: usize,
    pub layer: usize,
    pub spot: usize,
}

/// 扫描过程中记录的束斑表，扫描结束后一次性写入
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SpotTable {
    pub ids: Vec<i32>,
    pub x_mm: Vec<f32>,
    pub y_mm: Vec<f32>,
    pub energy_mev: Vec<f64>,
}

impl SpotTable {
    pub fn push(&mut self, spot_id: usize, x_mm: f32, y_mm: f32, energy_mev: f64) {
        self.ids.push(spot_id as i32);
        self.x_mm.push(x_mm);
        self.y_mm.push(y_mm);
        self.energy_mev.push(energy_mev);
    }
}

/// 射束数据文件名，例如 `Beam_G90_Data.h5`
pub fn beam_data_file_name(beam_id: &str) -> String {
    format!("Beam_{}_Data.{}", beam_id, STORE_EXTENSION)
}

/// 单个射束的影响矩阵写入器，独占该射束的数据文件
pub struct SparseMatrixWriter {
    store: ChunkedStore,
    scheme: IndexScheme,
}

impl SparseMatrixWriter {
    /// 在 `dir` 下打开（或创建）射束数据文件
    pub fn open(dir: &Path, beam_id: &str, scheme: IndexScheme) -> Result<Self> {
        let store = ChunkedStore::open(dir.join(beam_data_file_name(beam_id)))?;
        Ok(Self { store, scheme })
    }

    pub fn path(&self) -> PathBuf {
        self.store.path().to_path_buf()
    }

    pub fn store(&self) -> &ChunkedStore {
        &self.store
    }

    /// 追加一个束斑的稀疏行
    pub fn append(&mut self, points: &[DosePoint], key: SpotKey) -> Result<()> {
        let columns = self.scheme.columns();
        let mut rows = Vec::with_capacity(points.len() * columns);
        for point in points {
            match self.scheme {
                IndexScheme::PerBeamFlat => {
                    rows.extend([point.voxel as f64, key.spot_id as f64, point.dose]);
                }
                IndexScheme::LayerSpotVoxel => rows.extend([
                    key.layer as f64,
                    key.spot as f64,
                    point.voxel as f64,
                    point.dose,
                ]),
            }
        }
        self.store.append(SPARSE_DATASET, &[columns], &rows)
    }

    /// 追加一个束斑的完整稠密网格（一行），并记录行与束斑的对应关系
    pub fn append_dense(&mut self, dense: &[f64], key: SpotKey) -> Result<()> {
        let row: Vec<f32> = dense.iter().map(|v| *v as f32).collect();
        self.store.append(FULL_DATASET, &[row.len()], &row)?;
        self.store.append(
            LAYER_SPOT_INDICES_DATASET,
            &[3],
            &[key.spot_id as i32, key.layer as i32, key.spot as i32],
        )
    }

    /// 删除后重建固定大小的数据集
    pub fn overwrite<T: Element>(&mut self, name: &str, row_shape: &[usize], data: &[T]) -> Result<()> {
        self.store.overwrite(name, row_shape, data)
    }

    pub fn write_spot_table(&mut self, table: &SpotTable) -> Result<()> {
        self.overwrite(SPOT_ID_DATASET, &[], &table.ids)?;
        self.overwrite(SPOT_X_DATASET, &[], &table.x_mm)?;
        self.overwrite(SPOT_Y_DATASET, &[], &table.y_mm)?;
        self.overwrite(SPOT_ENERGY_DATASET, &[], &table.energy_mev)
    }
}
