use std::path::Path;

use tracing::info;

use crate::error::Result;
use crate::influence::metadata::{OptimizationVoxelsMetadata, write_json_file};
use crate::mapping::{CtGeometry, UniformGrid, map_uniform_grid};
use crate::store::{ChunkedStore, STORE_EXTENSION};

pub const VOXEL_COORDINATE_DATASET: &str = "/voxel_coordinate_XYZ_mm";
pub const VOXEL_WEIGHT_DATASET: &str = "/voxel_weight_mm3";
pub const CT_MAP_DATASET: &str = "/ct_to_dose_voxel_map";
pub const OPTIMIZATION_METADATA_FILE: &str = "OptimizationVoxels_MetaData.json";

pub fn optimization_data_file_name() -> String {
    format!("OptimizationVoxels_Data.{}", STORE_EXTENSION)
}

/// 导出优化体素：体素中心坐标、体素权重，以及已知 CT 时的 CT→剂量体素对应表
pub fn export_optimization_voxels(
    dir: &Path,
    dose: &UniformGrid,
    ct: Option<&CtGeometry>,
) -> Result<OptimizationVoxelsMetadata> {
    dose.validate()?;
    let file = optimization_data_file_name();
    let mut store = ChunkedStore::open(dir.join(&file))?;

    let centers: Vec<f64> = dose.voxel_centers().into_iter().flatten().collect();
    let point_count = dose.voxel_count();
    store.overwrite(VOXEL_COORDINATE_DATASET, &[3], &centers)?;
    store.overwrite(VOXEL_WEIGHT_DATASET, &[], &vec![1.0f64; point_count])?;

    let map_file = match ct {
        Some(ct) => {
            let table = map_uniform_grid(ct, dose)?;
            // 每行为一个 z 切片
            store.overwrite(CT_MAP_DATASET, &[ct.shape[1], ct.shape[0]], &table.data)?;
            info!(
                ct_voxels = table.data.len(),
                unassigned = table.unassigned_count(),
                "CT 对应表已导出"
            );
            Some(format!("{}{}", file, CT_MAP_DATASET))
        }
        None => None,
    };

    let metadata = OptimizationVoxelsMetadata {
        ct_origin_xyz_mm: ct.map_or([0.0; 3], |ct| ct.origin),
        ct_voxel_resolution_xyz_mm: ct.map_or([0.0; 3], |ct| ct.spacing),
        dose_voxel_resolution_xyz_mm: dose.spacing,
        ct_size_xyz: ct.map_or([0; 3], |ct| ct.shape),
        cal_box_xyz_start: dose.origin,
        cal_box_xyz_end: dose.end(),
        ct_to_dose_voxel_map_file: map_file,
        voxel_coordinate_file: format!("{}{}", file, VOXEL_COORDINATE_DATASET),
        opt_point_cnt: point_count,
    };
    write_json_file(&metadata, &dir.join(OPTIMIZATION_METADATA_FILE))?;
    info!(points = point_count, "优化体素已导出");
    Ok(metadata)
}
