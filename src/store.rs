//! HDF5 数据集存储
//!
//! 一个 `.h5` 文件保存多个命名数据集。数据集首维（行）不设上限，按行分块并做
//! deflate 压缩；每次追加先把首维扩展到新长度，再写入尾部。固定大小的表通过
//! 删除后重建来覆盖。

use std::path::{Path, PathBuf};

use hdf5::{Dataset, File, H5Type};
use ndarray::{ArrayView1, ArrayView2, ArrayView3, s};
use tracing::debug;

use crate::error::{Error, Result};

/// 存储文件扩展名
pub const STORE_EXTENSION: &str = "h5";

/// 单个分块的目标元素数
const CHUNK_ELEMENTS: usize = 64 * 1024;
const MAX_CHUNK_ROWS: usize = 4096;
const DEFLATE_LEVEL: u8 = 4;

/// 可存入数据集的元素类型
pub trait Element: H5Type + Copy + Default {}

impl Element for f64 {}

impl Element for f32 {}

impl Element for i32 {}

/// 单个 HDF5 文件；写操作需要 `&mut self`，同一文件内的写入因此天然串行
pub struct ChunkedStore {
    path: PathBuf,
    file: File,
}

impl ChunkedStore {
    /// 以读写方式打开，不存在则创建
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::append(&path)?;
        debug!(path = %path.display(), "已打开 HDF5 文件");
        Ok(Self { path, file })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 逐级检查链接，中间组不存在时返回 false
    pub fn contains(&self, name: &str) -> bool {
        let mut prefix = String::new();
        for part in name.split('/').filter(|p| !p.is_empty()) {
            prefix.push('/');
            prefix.push_str(part);
            if !self.file.link_exists(&prefix) {
                return false;
            }
        }
        !prefix.is_empty()
    }

    /// 数据集完整形状，首维为行数
    pub fn shape(&self, name: &str) -> Result<Vec<usize>> {
        Ok(self.dataset(name)?.shape())
    }

    /// 数据集当前行数
    pub fn len(&self, name: &str) -> Result<usize> {
        Ok(self.shape(name)?.first().copied().unwrap_or(0))
    }

    /// 追加行；数据集不存在时先创建。`data.len()` 必须是行长度的整数倍，
    /// 行最多二维
    pub fn append<T: Element>(&mut self, name: &str, row_shape: &[usize], data: &[T]) -> Result<()> {
        let row_len: usize = row_shape.iter().product();
        if row_shape.len() > 2 || row_len == 0 || data.len() % row_len != 0 {
            return Err(Error::DatasetMismatch {
                name: name.to_string(),
                details: format!("{} 个元素无法组成形状为 {:?} 的行", data.len(), row_shape),
            });
        }

        let dataset = if self.contains(name) {
            let dataset = self.file.dataset(name)?;
            check_layout::<T>(name, &dataset, row_shape)?;
            dataset
        } else {
            self.create::<T>(name, row_shape)?
        };

        if data.is_empty() {
            return Ok(());
        }

        let rows = data.len() / row_len;
        let offset = dataset.shape().first().copied().unwrap_or(0);
        write_tail(&dataset, name, row_shape, offset, rows, data)?;
        debug!(dataset = name, rows, total = offset + rows, "追加数据");
        Ok(())
    }

    /// 先删除再重建，用于一次性写入的固定大小表
    pub fn overwrite<T: Element>(
        &mut self,
        name: &str,
        row_shape: &[usize],
        data: &[T],
    ) -> Result<()> {
        if self.contains(name) {
            self.delete(name)?;
        }
        self.append(name, row_shape, data)
    }

    pub fn delete(&mut self, name: &str) -> Result<()> {
        if !self.contains(name) {
            return Err(Error::DatasetNotFound(name.to_string()));
        }
        self.file.unlink(name)?;
        Ok(())
    }

    /// 读回整个数据集（按行展平）
    pub fn read<T: Element>(&self, name: &str) -> Result<Vec<T>> {
        let dataset = self.dataset(name)?;
        let stored = dataset.dtype()?.to_descriptor()?;
        if stored != T::type_descriptor() {
            return Err(Error::DatasetMismatch {
                name: name.to_string(),
                details: format!(
                    "数据集类型为 {:?}，读取类型为 {:?}",
                    stored,
                    T::type_descriptor()
                ),
            });
        }
        Ok(dataset.read_raw::<T>()?)
    }

    fn dataset(&self, name: &str) -> Result<Dataset> {
        if !self.contains(name) {
            return Err(Error::DatasetNotFound(name.to_string()));
        }
        Ok(self.file.dataset(name)?)
    }

    /// 创建首维可扩展、分块压缩的空数据集，缺失的上级组一并创建
    fn create<T: Element>(&self, name: &str, row_shape: &[usize]) -> Result<Dataset> {
        if let Some((parent, _)) = name.trim_start_matches('/').rsplit_once('/') {
            let mut prefix = String::new();
            for part in parent.split('/') {
                prefix.push('/');
                prefix.push_str(part);
                if !self.file.link_exists(&prefix) {
                    self.file.create_group(&prefix)?;
                }
            }
        }

        let row_len: usize = row_shape.iter().product();
        let chunk_rows = (CHUNK_ELEMENTS / row_len).clamp(1, MAX_CHUNK_ROWS);
        let builder = self.file.new_dataset::<T>();
        let builder = match *row_shape {
            [] => builder.shape((0..,)).chunk((chunk_rows,)),
            [cols] => builder.shape((0.., cols)).chunk((chunk_rows, cols)),
            [ny, nx] => builder.shape((0.., ny, nx)).chunk((chunk_rows, ny, nx)),
            _ => {
                return Err(Error::DatasetMismatch {
                    name: name.to_string(),
                    details: format!("不支持的行形状 {:?}", row_shape),
                });
            }
        };
        Ok(builder.deflate(DEFLATE_LEVEL).create(name)?)
    }
}

fn check_layout<T: Element>(name: &str, dataset: &Dataset, row_shape: &[usize]) -> Result<()> {
    let stored = dataset.dtype()?.to_descriptor()?;
    let shape = dataset.shape();
    if stored != T::type_descriptor() || shape.get(1..) != Some(row_shape) {
        return Err(Error::DatasetMismatch {
            name: name.to_string(),
            details: format!(
                "已有 {:?}{:?}，写入 {:?}{:?}",
                stored,
                shape.get(1..).unwrap_or_default(),
                T::type_descriptor(),
                row_shape
            ),
        });
    }
    Ok(())
}

/// 把首维扩展到 `offset + rows`，并把 `data` 写入新增的行
fn write_tail<T: Element>(
    dataset: &Dataset,
    name: &str,
    row_shape: &[usize],
    offset: usize,
    rows: usize,
    data: &[T],
) -> Result<()> {
    let end = offset + rows;
    let shape_err = |e: ndarray::ShapeError| Error::DatasetMismatch {
        name: name.to_string(),
        details: e.to_string(),
    };

    match *row_shape {
        [] => {
            dataset.resize((end,))?;
            dataset.write_slice(ArrayView1::from(data), s![offset..end])?;
        }
        [cols] => {
            dataset.resize((end, cols))?;
            let view = ArrayView2::from_shape((rows, cols), data).map_err(shape_err)?;
            dataset.write_slice(view, s![offset..end, ..])?;
        }
        [ny, nx] => {
            dataset.resize((end, ny, nx))?;
            let view = ArrayView3::from_shape((rows, ny, nx), data).map_err(shape_err)?;
            dataset.write_slice(view, s![offset..end, .., ..])?;
        }
        _ => {
            return Err(Error::DatasetMismatch {
                name: name.to_string(),
                details: format!("不支持的行形状 {:?}", row_shape),
            });
        }
    }
    Ok(())
}
