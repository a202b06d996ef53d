//! CT 体素到优化（剂量）体素的对应表
//!
//! 非均匀点云：每个点落入所在 CT 体素，随后在已赋值体素的包围盒内做最近邻填充。
//! 均匀网格：每个剂量体素直接覆盖整数倍大小的 CT 子块，不需要搜索。

use kiddo::SquaredEuclidean;
use kiddo::immutable::float::kdtree::ImmutableKdTree;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};
use crate::utils::voxel_grid::{MAX_VOXELS, checked_voxel_count, flatten, voxel_count};

/// 未赋值体素
pub const UNASSIGNED: i32 = -1;

fn validate_axes(what: &str, shape: [usize; 3], spacing: [f64; 3]) -> Result<()> {
    if shape.contains(&0) {
        return Err(Error::InvalidGrid(format!("{} 维度不能为 0: {:?}", what, shape)));
    }
    if checked_voxel_count(shape).is_none() {
        return Err(Error::InvalidGrid(format!(
            "{} 体素数超过上限 {}: {:?}",
            what, MAX_VOXELS, shape
        )));
    }
    if spacing.iter().any(|s| !s.is_finite() || *s <= 0.0) {
        return Err(Error::InvalidGrid(format!(
            "{} 分辨率必须为正数: {:?}",
            what, spacing
        )));
    }
    Ok(())
}

/// CT 图像几何，`origin` 为体素 (0,0,0) 的中心
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CtGeometry {
    pub shape: [usize; 3],
    pub origin: [f64; 3],
    pub spacing: [f64; 3],
}

impl CtGeometry {
    pub fn validate(&self) -> Result<()> {
        validate_axes("CT", self.shape, self.spacing)
    }

    pub fn voxel_count(&self) -> usize {
        voxel_count(self.shape)
    }

    /// 包含物理坐标 `p` (mm) 的体素索引，落在体积外返回 None
    pub fn index_of(&self, p: [f64; 3]) -> Option<[usize; 3]> {
        let mut index = [0usize; 3];
        for axis in 0..3 {
            let f = ((p[axis] - self.origin[axis]) / self.spacing[axis]).round();
            if !(f >= 0.0 && f < self.shape[axis] as f64) {
                return None;
            }
            index[axis] = f as usize;
        }
        Some(index)
    }
}

/// 均匀剂量计算网格，`origin` 为计算框的角点
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct UniformGrid {
    pub shape: [usize; 3],
    pub origin: [f64; 3],
    pub spacing: [f64; 3],
}

impl UniformGrid {
    pub fn validate(&self) -> Result<()> {
        validate_axes("剂量网格", self.shape, self.spacing)
    }

    pub fn voxel_count(&self) -> usize {
        voxel_count(self.shape)
    }

    pub fn end(&self) -> [f64; 3] {
        std::array::from_fn(|a| self.origin[a] + self.spacing[a] * self.shape[a] as f64)
    }

    /// 全部体素中心，顺序与展平索引一致
    pub fn voxel_centers(&self) -> Vec<[f64; 3]> {
        let mut centers = Vec::with_capacity(self.voxel_count());
        for z in 0..self.shape[2] {
            for y in 0..self.shape[1] {
                for x in 0..self.shape[0] {
                    let index = [x, y, z];
                    centers.push(std::array::from_fn(|a| {
                        self.origin[a] + (index[a] as f64 + 0.5) * self.spacing[a]
                    }));
                }
            }
        }
        centers
    }
}

/// 体素索引空间中的闭区间包围盒
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct VoxelBox {
    pub min: [usize; 3],
    pub max: [usize; 3],
}

impl VoxelBox {
    fn point(index: [usize; 3]) -> Self {
        Self {
            min: index,
            max: index,
        }
    }

    fn include(&mut self, index: [usize; 3]) {
        for axis in 0..3 {
            self.min[axis] = self.min[axis].min(index[axis]);
            self.max[axis] = self.max[axis].max(index[axis]);
        }
    }

    pub fn volume(&self) -> usize {
        (0..3).map(|a| self.max[a] - self.min[a] + 1).product()
    }
}

/// 与 CT 同形状的对应表，数据按 (z, y, x) 行主序展平
#[derive(Debug, Clone, PartialEq)]
pub struct CorrespondenceTable {
    pub shape: [usize; 3],
    pub data: Vec<i32>,
    bounds: Option<VoxelBox>,
}

impl CorrespondenceTable {
    fn unassigned(shape: [usize; 3]) -> Self {
        Self {
            shape,
            data: vec![UNASSIGNED; voxel_count(shape)],
            bounds: None,
        }
    }

    fn assign(&mut self, index: [usize; 3], value: i32) {
        self.data[flatten(self.shape, index[0], index[1], index[2])] = value;
        match self.bounds.as_mut() {
            Some(bounds) => bounds.include(index),
            None => self.bounds = Some(VoxelBox::point(index)),
        }
    }

    /// 已赋值体素的包围盒；没有任何赋值时为 None
    pub fn bounds(&self) -> Option<VoxelBox> {
        self.bounds
    }

    pub fn unassigned_count(&self) -> usize {
        self.data.iter().filter(|v| **v == UNASSIGNED).count()
    }
}

fn point_index(len: usize) -> Result<i32> {
    i32::try_from(len).map_err(|_| Error::InvalidGrid(format!("点数 {} 超出 i32 范围", len)))
}

/// 非均匀点云：逐点落格（后写覆盖先写），再做包围盒内的最近邻填充
pub fn map_point_cloud(ct: &CtGeometry, points: &[[f64; 3]]) -> Result<CorrespondenceTable> {
    ct.validate()?;
    point_index(points.len())?;

    let mut table = CorrespondenceTable::unassigned(ct.shape);
    let mut outside = 0usize;
    for (i, p) in points.iter().enumerate() {
        match ct.index_of(*p) {
            Some(index) => table.assign(index, i as i32),
            None => outside += 1,
        }
    }
    if outside > 0 {
        debug!(outside, "点落在 CT 体积外，已忽略");
    }

    nearest_fill(&mut table);
    Ok(table)
}

/// 包围盒内每个未赋值体素取最近的已赋值体素（体素索引空间欧氏距离）的值。
/// 距离相同时取展平索引最小的已赋值体素。
fn nearest_fill(table: &mut CorrespondenceTable) {
    let Some(bounds) = table.bounds else {
        return;
    };
    let shape = table.shape;
    let in_bounds = || {
        (bounds.min[2]..=bounds.max[2]).flat_map(move |z| {
            (bounds.min[1]..=bounds.max[1])
                .flat_map(move |y| (bounds.min[0]..=bounds.max[0]).map(move |x| [x, y, z]))
        })
    };

    // 按展平索引递增顺序收集，k-d 树条目序号越小即展平索引越小
    let mut coords = Vec::new();
    let mut values = Vec::new();
    for [x, y, z] in in_bounds() {
        let value = table.data[flatten(shape, x, y, z)];
        if value != UNASSIGNED {
            coords.push([x as f64, y as f64, z as f64]);
            values.push(value);
        }
    }
    if coords.len() == bounds.volume() {
        return;
    }

    // 坐标均为整数格点，同一轴上大量重复值
    let tree: ImmutableKdTree<f64, u64, 3, 32> = ImmutableKdTree::new_from_slice(&coords);
    let mut filled = 0usize;
    for [x, y, z] in in_bounds() {
        let index = flatten(shape, x, y, z);
        if table.data[index] != UNASSIGNED {
            continue;
        }
        let query = [x as f64, y as f64, z as f64];
        let nearest = tree.nearest_one::<SquaredEuclidean>(&query);
        // 整数格点上的平方距离是精确整数，放宽 0.5 恰好收集所有并列者
        let winner = tree
            .within_unsorted::<SquaredEuclidean>(&query, nearest.distance + 0.5)
            .into_iter()
            .map(|n| n.item as usize)
            .min()
            .unwrap_or(nearest.item as usize);
        table.data[index] = values[winner];
        filled += 1;
    }
    debug!(filled, assigned = values.len(), "最近邻填充完成");
}

/// 均匀网格：每个剂量体素覆盖 round(剂量分辨率 / CT 分辨率) 大小的 CT 子块
pub fn map_uniform_grid(ct: &CtGeometry, grid: &UniformGrid) -> Result<CorrespondenceTable> {
    ct.validate()?;
    grid.validate()?;
    point_index(grid.voxel_count())?;

    let block: [usize; 3] =
        std::array::from_fn(|a| ((grid.spacing[a] / ct.spacing[a]).round() as usize).max(1));

    let mut table = CorrespondenceTable::unassigned(ct.shape);
    let mut point = 0i32;
    for z in 0..grid.shape[2] {
        for y in 0..grid.shape[1] {
            for x in 0..grid.shape[0] {
                let index = [x, y, z];
                // 子块起点：第一个中心不小于剂量体素角点的 CT 体素
                let start: [i64; 3] = std::array::from_fn(|a| {
                    let corner = grid.origin[a] + index[a] as f64 * grid.spacing[a];
                    ((corner - ct.origin[a]) / ct.spacing[a] - 1e-6).ceil() as i64
                });
                let range = |a: usize| {
                    let lo = start[a].max(0) as usize;
                    let hi = (start[a] + block[a] as i64).clamp(0, ct.shape[a] as i64) as usize;
                    lo..hi
                };
                for cz in range(2) {
                    for cy in range(1) {
                        for cx in range(0) {
                            table.assign([cx, cy, cz], point);
                        }
                    }
                }
                point += 1;
            }
        }
    }

    Ok(table)
}

#[cfg(test)]
impl VoxelBox {
    pub fn contains(&self, index: [usize; 3]) -> bool {
        (0..3).all(|a| self.min[a] <= index[a] && index[a] <= self.max[a])
    }
}

#[cfg(test)]
impl CorrespondenceTable {
    pub fn get(&self, x: usize, y: usize, z: usize) -> i32 {
        self.data[flatten(self.shape, x, y, z)]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit_ct(shape: [usize; 3]) -> CtGeometry {
        CtGeometry {
            shape,
            origin: [0.0; 3],
            spacing: [1.0; 3],
        }
    }

    #[test]
    fn one_dimensional_two_point_fill() {
        let table =
            map_point_cloud(&unit_ct([5, 1, 1]), &[[0.0, 0.0, 0.0], [4.0, 0.0, 0.0]]).unwrap();
        // 体素 2 与两点等距，取展平索引较小的体素 0
        assert_eq!(table.data, vec![0, 0, 0, 1, 1]);
        assert_eq!(table.unassigned_count(), 0);
    }

    #[test]
    fn two_dimensional_fill_matches_brute_force() {
        let ct = unit_ct([5, 4, 1]);
        let p0 = [0usize, 0];
        let p1 = [4usize, 3];
        let points = [
            [p0[0] as f64, p0[1] as f64, 0.0],
            [p1[0] as f64, p1[1] as f64, 0.0],
        ];
        let table = map_point_cloud(&ct, &points).unwrap();

        let dist2 = |a: [usize; 2], x: usize, y: usize| {
            let dx = a[0] as i64 - x as i64;
            let dy = a[1] as i64 - y as i64;
            dx * dx + dy * dy
        };
        for y in 0..4 {
            for x in 0..5 {
                let expected = if dist2(p1, x, y) < dist2(p0, x, y) { 1 } else { 0 };
                assert_eq!(table.get(x, y, 0), expected, "voxel ({}, {})", x, y);
            }
        }
    }

    #[test]
    fn regular_lattice_fill_matches_brute_force() {
        let ct = unit_ct([24, 24, 12]);
        let mut points = Vec::new();
        for z in (1..12).step_by(3) {
            for y in (1..24).step_by(3) {
                for x in (1..24).step_by(3) {
                    points.push([x as f64, y as f64, z as f64]);
                }
            }
        }
        let table = map_point_cloud(&ct, &points).unwrap();

        let bounds = table.bounds().unwrap();
        assert_eq!(bounds, VoxelBox { min: [1, 1, 1], max: [22, 22, 10] });
        for z in 0..12 {
            for y in 0..24 {
                for x in 0..24 {
                    let voxel = [x, y, z];
                    if !bounds.contains(voxel) {
                        assert_eq!(table.get(x, y, z), UNASSIGNED);
                        continue;
                    }
                    let expected = points
                        .iter()
                        .enumerate()
                        .min_by_key(|(_, p)| {
                            let d2: i64 = (0..3)
                                .map(|a| {
                                    let diff = p[a] as i64 - voxel[a] as i64;
                                    diff * diff
                                })
                                .sum();
                            let index = flatten(ct.shape, p[0] as usize, p[1] as usize, p[2] as usize);
                            (d2, index)
                        })
                        .map(|(i, _)| i as i32)
                        .unwrap();
                    assert_eq!(table.get(x, y, z), expected, "voxel {:?}", voxel);
                }
            }
        }
    }

    #[test]
    fn voxels_outside_bounding_box_stay_unassigned() {
        let ct = unit_ct([6, 3, 2]);
        let table = map_point_cloud(&ct, &[[1.0, 1.0, 0.0], [3.0, 1.0, 0.0]]).unwrap();

        let bounds = table.bounds().unwrap();
        assert_eq!(bounds, VoxelBox { min: [1, 1, 0], max: [3, 1, 0] });
        for z in 0..2 {
            for y in 0..3 {
                for x in 0..6 {
                    let inside = bounds.contains([x, y, z]);
                    assert_eq!(table.get(x, y, z) != UNASSIGNED, inside);
                }
            }
        }
        assert_eq!(table.get(2, 1, 0), 0);
    }

    #[test]
    fn later_point_wins_and_outside_points_are_ignored() {
        let ct = CtGeometry {
            shape: [3, 3, 3],
            origin: [-10.0, -10.0, -10.0],
            spacing: [2.5, 2.5, 2.5],
        };
        let points = [
            [-10.2, -9.9, -10.0],
            [-9.8, -10.1, -10.0],
            [100.0, 0.0, 0.0],
            [-5.0, -5.0, -5.0],
        ];
        let table = map_point_cloud(&ct, &points).unwrap();
        assert_eq!(table.get(0, 0, 0), 1);
        assert_eq!(table.get(2, 2, 2), 3);
        assert!(!table.data.contains(&2));
        assert_eq!(table.unassigned_count(), 0);
    }

    #[test]
    fn empty_point_cloud_leaves_everything_unassigned() {
        let table = map_point_cloud(&unit_ct([2, 2, 2]), &[]).unwrap();
        assert!(table.bounds().is_none());
        assert_eq!(table.unassigned_count(), 8);
    }

    #[test]
    fn uniform_grid_fills_blocks() {
        let ct = unit_ct([4, 4, 2]);
        let grid = UniformGrid {
            shape: [2, 2, 1],
            origin: [-0.5, -0.5, -0.5],
            spacing: [2.0, 2.0, 2.0],
        };
        let table = map_uniform_grid(&ct, &grid).unwrap();

        assert_eq!(table.unassigned_count(), 0);
        assert_eq!(table.get(0, 0, 0), 0);
        assert_eq!(table.get(1, 1, 1), 0);
        assert_eq!(table.get(2, 0, 0), 1);
        assert_eq!(table.get(0, 2, 1), 2);
        assert_eq!(table.get(3, 3, 1), 3);
    }

    #[test]
    fn uniform_grid_is_clipped_to_ct_volume() {
        let ct = unit_ct([3, 1, 1]);
        let grid = UniformGrid {
            shape: [2, 1, 1],
            origin: [0.5, -0.5, -0.5],
            spacing: [2.0, 1.0, 1.0],
        };
        let table = map_uniform_grid(&ct, &grid).unwrap();
        assert_eq!(table.data, vec![UNASSIGNED, 0, 0]);
        assert_eq!(table.bounds().unwrap(), VoxelBox { min: [1, 0, 0], max: [2, 0, 0] });
    }

    #[test]
    fn invalid_geometry_is_rejected() {
        let mut ct = unit_ct([2, 2, 2]);
        ct.spacing[1] = 0.0;
        assert!(map_point_cloud(&ct, &[]).is_err());
        assert!(map_point_cloud(&unit_ct([0, 2, 2]), &[]).is_err());
        assert!(matches!(
            unit_ct([1 << 22; 3]).validate(),
            Err(Error::InvalidGrid(_))
        ));
    }

    #[test]
    fn voxel_centers_follow_flat_order() {
        let grid = UniformGrid {
            shape: [2, 1, 2],
            origin: [0.0, 0.0, 0.0],
            spacing: [1.0, 2.0, 3.0],
        };
        let centers = grid.voxel_centers();
        assert_eq!(centers[1], [1.5, 1.0, 1.5]);
        assert_eq!(centers[2], [0.5, 1.0, 4.5]);
        assert_eq!(grid.end(), [2.0, 2.0, 6.0]);
    }
}
