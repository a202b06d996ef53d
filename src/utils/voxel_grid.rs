use crate::error::{Error, Result};

/// 体素网格数据结构
/// 表示三维规则网格上的标量场数据（剂量网格即为此类型）
#[derive(Debug, Clone, PartialEq)]
pub struct VoxelGrid {
    /// 网格维度 [nx, ny, nz]
    pub shape: [usize; 3],
    /// 数据数组，按 C 语言顺序存储 (x变化最快，y其次，z最慢)
    /// 索引计算: index = z * nx * ny + y * nx + x
    pub data: Vec<f64>,
}

impl VoxelGrid {
    /// 创建新的体素网格
    pub fn new(shape: [usize; 3], data: Vec<f64>) -> Result<Self> {
        let total_elements = checked_voxel_count(shape)
            .ok_or_else(|| Error::InvalidGrid(format!("网格过大: {:?}", shape)))?;

        if data.len() != total_elements {
            return Err(Error::InvalidGrid(format!(
                "数据量不匹配: shape {:?} 需要 {} 个元素，但提供了 {} 个",
                shape,
                total_elements,
                data.len()
            )));
        }

        Ok(VoxelGrid { shape, data })
    }

    /// 创建全零网格
    pub fn zeros(shape: [usize; 3]) -> Self {
        VoxelGrid {
            shape,
            data: vec![0.0; voxel_count(shape)],
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// 累加另一张同形状网格（按权重缩放）
    pub fn add_scaled(&mut self, other: &VoxelGrid, scale: f64) -> Result<()> {
        if other.shape != self.shape {
            return Err(Error::InvalidGrid(format!(
                "网格形状不一致: {:?} vs {:?}",
                self.shape, other.shape
            )));
        }
        for (dst, src) in self.data.iter_mut().zip(&other.data) {
            *dst += src * scale;
        }
        Ok(())
    }
}

/// 单个网格允许的最大体素数
pub const MAX_VOXELS: usize = 1 << 28;

/// 已校验形状的体素数
pub fn voxel_count(shape: [usize; 3]) -> usize {
    shape[0] * shape[1] * shape[2]
}

/// 体素数，乘法溢出或超过 [`MAX_VOXELS`] 时为 None
pub fn checked_voxel_count(shape: [usize; 3]) -> Option<usize> {
    shape
        .iter()
        .try_fold(1usize, |acc, dim| acc.checked_mul(*dim))
        .filter(|count| *count <= MAX_VOXELS)
}

/// (x, y, z) -> 展平后的体素索引
pub fn flatten(shape: [usize; 3], x: usize, y: usize, z: usize) -> usize {
    z * shape[0] * shape[1] + y * shape[0] + x
}

/// 展平索引 -> (x, y, z)
pub fn unflatten(shape: [usize; 3], index: usize) -> (usize, usize, usize) {
    let slice = shape[0] * shape[1];
    let rem = index % slice;
    (rem % shape[0], rem / shape[0], index / slice)
}

#[cfg(test)]
impl VoxelGrid {
    pub fn get(&self, x: usize, y: usize, z: usize) -> f64 {
        self.data[flatten(self.shape, x, y, z)]
    }

    pub fn set(&mut self, x: usize, y: usize, z: usize, value: f64) {
        let index = flatten(self.shape, x, y, z);
        self.data[index] = value;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flatten_round_trips_every_coordinate() {
        let shape = [4, 3, 5];
        let mut expected = 0;
        for z in 0..shape[2] {
            for y in 0..shape[1] {
                for x in 0..shape[0] {
                    let index = flatten(shape, x, y, z);
                    assert_eq!(index, expected);
                    assert_eq!(unflatten(shape, index), (x, y, z));
                    expected += 1;
                }
            }
        }
    }

    #[test]
    fn checked_voxel_count_rejects_huge_shapes() {
        assert_eq!(checked_voxel_count([4, 3, 5]), Some(60));
        assert_eq!(checked_voxel_count([1 << 22; 3]), None);
        assert_eq!(checked_voxel_count([usize::MAX, 2, 1]), None);
        assert_eq!(checked_voxel_count([MAX_VOXELS, 1, 1]), Some(MAX_VOXELS));
        assert_eq!(checked_voxel_count([MAX_VOXELS, 2, 1]), None);
    }

    #[test]
    fn new_rejects_wrong_length() {
        assert!(VoxelGrid::new([2, 2, 2], vec![0.0; 7]).is_err());
        assert!(VoxelGrid::new([2, 2, 2], vec![0.0; 8]).is_ok());
    }

    #[test]
    fn add_scaled_sums_grids() {
        let mut acc = VoxelGrid::zeros([2, 1, 1]);
        let unit = VoxelGrid::new([2, 1, 1], vec![1.0, 2.0]).unwrap();
        acc.add_scaled(&unit, 100.0).unwrap();
        acc.add_scaled(&unit, 1.0).unwrap();
        assert_eq!(acc.data, vec![101.0, 202.0]);
        assert!(acc.add_scaled(&VoxelGrid::zeros([1, 1, 1]), 1.0).is_err());
    }
}
