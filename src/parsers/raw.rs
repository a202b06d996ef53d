use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use byteorder::{LittleEndian, ReadBytesExt};

use crate::error::{Error, Result};
use crate::utils::parser::DoseGridParser;
use crate::utils::voxel_grid::{VoxelGrid, checked_voxel_count};

/// 原始二进制剂量网格：3 个 u32 (nx, ny, nz)，随后 nx*ny*nz 个 f64，全部小端
pub struct RawDoseParser;

impl RawDoseParser {
    pub fn new() -> Self {
        RawDoseParser
    }
}

fn read_shape<R: Read>(reader: &mut R) -> std::io::Result<[usize; 3]> {
    let nx = reader.read_u32::<LittleEndian>()? as usize;
    let ny = reader.read_u32::<LittleEndian>()? as usize;
    let nz = reader.read_u32::<LittleEndian>()? as usize;
    Ok([nx, ny, nz])
}

impl DoseGridParser for RawDoseParser {
    fn supported_extensions(&self) -> Vec<&'static str> {
        vec!["rawdose"]
    }

    fn name(&self) -> &'static str {
        "Raw Dose Parser"
    }

    fn get_shape_from_file(&self, file_path: &Path) -> Result<[usize; 3]> {
        let mut reader = BufReader::new(File::open(file_path)?);
        read_shape(&mut reader).map_err(|e| Error::Parse {
            file: file_path.display().to_string(),
            details: format!("无法读取 shape: {}", e),
        })
    }

    fn parse_from_file(&self, file_path: &Path) -> Result<VoxelGrid> {
        let mut reader = BufReader::new(File::open(file_path)?);
        let parse_err = |e: std::io::Error| Error::Parse {
            file: file_path.display().to_string(),
            details: e.to_string(),
        };

        let shape = read_shape(&mut reader).map_err(parse_err)?;
        let count = checked_voxel_count(shape).ok_or_else(|| Error::Parse {
            file: file_path.display().to_string(),
            details: format!("网格过大: {:?}", shape),
        })?;
        let mut data = vec![0.0; count];
        reader
            .read_f64_into::<LittleEndian>(&mut data)
            .map_err(parse_err)?;

        VoxelGrid::new(shape, data)
    }
}

/// 写出原始二进制剂量网格（测试与回放数据准备使用）
#[cfg(test)]
pub fn write_raw_dose(path: &Path, grid: &VoxelGrid) -> std::io::Result<()> {
    use byteorder::WriteBytesExt;

    let mut bytes = Vec::with_capacity(12 + grid.data.len() * 8);
    for dim in grid.shape {
        bytes.write_u32::<LittleEndian>(dim as u32)?;
    }
    for value in &grid.data {
        bytes.write_f64::<LittleEndian>(*value)?;
    }
    std::fs::write(path, bytes)
}
