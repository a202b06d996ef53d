use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use serde::Serialize;

use crate::error::Result;
use crate::influence::plan::{BeamInfo, IsoCenter};
use crate::influence::writer::{
    FULL_DATASET, SPARSE_DATASET, SPOT_ENERGY_DATASET, SPOT_ID_DATASET, SPOT_X_DATASET,
    SPOT_Y_DATASET, beam_data_file_name,
};

const SAD_MM: f64 = 100.0;

#[derive(Debug, Clone, Serialize)]
pub struct SpotFiles {
    #[serde(rename = "id_File")]
    pub id: String,
    #[serde(rename = "position_x_mm_File")]
    pub position_x_mm: String,
    #[serde(rename = "position_y_mm_File")]
    pub position_y_mm: String,
    #[serde(rename = "energy_layer_MeV_File")]
    pub energy_layer_mev: String,
}

/// 射束元数据（`Beam_<id>_MetaData.json`）
#[derive(Debug, Clone, Serialize)]
pub struct BeamMetadata {
    #[serde(rename = "ID")]
    pub id: String,
    pub gantry_angle: f64,
    pub couch_angle: f64,
    pub iso_center: IsoCenter,
    pub spots: SpotFiles,
    pub beam_modality: &'static str,
    #[serde(rename = "energy_MV")]
    pub energy_mode: String,
    #[serde(rename = "SSD_mm", skip_serializing_if = "Option::is_none")]
    pub ssd_mm: Option<f64>,
    #[serde(rename = "SAD_mm")]
    pub sad_mm: f64,
    #[serde(rename = "influenceMatrixSparse_File")]
    pub sparse_file: String,
    #[serde(rename = "influenceMatrixSparse_tol")]
    pub sparse_tolerance: f64,
    #[serde(rename = "influenceMatrixFull_File", skip_serializing_if = "Option::is_none")]
    pub full_file: Option<String>,
    pub machine_name: String,
    pub spot_count: usize,
}

impl BeamMetadata {
    pub fn new(info: &BeamInfo, cutoff: f64, export_full: bool, spot_count: usize) -> Self {
        let file = beam_data_file_name(&info.id);
        let reference = |dataset: &str| format!("{}{}", file, dataset);

        Self {
            id: info.id.clone(),
            gantry_angle: info.gantry_angle,
            couch_angle: info.couch_angle,
            iso_center: info.iso_center,
            spots: SpotFiles {
                id: reference(SPOT_ID_DATASET),
                position_x_mm: reference(SPOT_X_DATASET),
                position_y_mm: reference(SPOT_Y_DATASET),
                energy_layer_mev: reference(SPOT_ENERGY_DATASET),
            },
            beam_modality: "Proton",
            energy_mode: info.energy_mode.clone(),
            ssd_mm: info.ssd_mm,
            sad_mm: SAD_MM,
            sparse_file: reference(SPARSE_DATASET),
            sparse_tolerance: cutoff,
            full_file: export_full.then(|| reference(FULL_DATASET)),
            machine_name: info.machine_name.clone(),
            spot_count,
        }
    }
}

/// 优化体素元数据（`OptimizationVoxels_MetaData.json`）
#[derive(Debug, Clone, Serialize)]
pub struct OptimizationVoxelsMetadata {
    pub ct_origin_xyz_mm: [f64; 3],
    pub ct_voxel_resolution_xyz_mm: [f64; 3],
    pub dose_voxel_resolution_xyz_mm: [f64; 3],
    pub ct_size_xyz: [usize; 3],
    pub cal_box_xyz_start: [f64; 3],
    pub cal_box_xyz_end: [f64; 3],
    #[serde(rename = "ct_to_dose_voxel_map_File", skip_serializing_if = "Option::is_none")]
    pub ct_to_dose_voxel_map_file: Option<String>,
    #[serde(rename = "voxel_coordinate_XYZ_mm_File")]
    pub voxel_coordinate_file: String,
    pub opt_point_cnt: usize,
}

/// 以缩进格式写出 JSON 文件
pub fn write_json_file<T: Serialize>(value: &T, path: &Path) -> Result<()> {
    let mut writer = BufWriter::new(File::create(path)?);
    serde_json::to_writer_pretty(&mut writer, value)?;
    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn beam_metadata_uses_persisted_field_names() {
        let info = BeamInfo {
            id: "G90".to_string(),
            gantry_angle: 90.0,
            machine_name: "PROBEAM".to_string(),
            ..Default::default()
        };
        let metadata = BeamMetadata::new(&info, 0.015, false, 12);
        let json = serde_json::to_value(&metadata).unwrap();

        assert_eq!(json["ID"], "G90");
        assert_eq!(json["influenceMatrixSparse_File"], "Beam_G90_Data.h5/inf_matrix_sparse");
        assert_eq!(json["influenceMatrixSparse_tol"], 0.015);
        assert_eq!(json["spots"]["id_File"], "Beam_G90_Data.h5/spots/id");
        assert!(json.get("influenceMatrixFull_File").is_none());
        assert_eq!(json["SAD_mm"], 100.0);
    }

    #[test]
    fn writes_pretty_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("Beam_A_MetaData.json");
        let info = BeamInfo {
            id: "A".to_string(),
            ..Default::default()
        };
        write_json_file(&BeamMetadata::new(&info, 0.0, true, 2), &path).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains('\n'));
        let json: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(json["influenceMatrixFull_File"], "Beam_A_Data.h5/inf_matrix_full");
        assert_eq!(json["spot_count"], 2);
    }
}
