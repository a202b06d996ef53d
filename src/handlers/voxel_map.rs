use std::time::Instant;

use actix_web::{HttpResponse, Responder, post, web};
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::app_state::AppState;
use crate::mapping::{CtGeometry, UniformGrid, VoxelBox, map_point_cloud, map_uniform_grid};
use crate::task::{ChunkDescriptor, MapTask, split_chunks};

#[derive(Deserialize)]
pub struct VoxelMapRequest {
    pub ct: CtGeometry,
    /// 非均匀优化点（mm），与 `dose_grid` 二选一
    #[serde(default)]
    pub points: Option<Vec<[f64; 3]>>,
    /// 均匀剂量网格，与 `points` 二选一
    #[serde(default)]
    pub dose_grid: Option<UniformGrid>,
    pub chunk_size: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum MapMode {
    PointCloud,
    UniformGrid,
}

enum MapSource {
    Points(Vec<[f64; 3]>),
    Grid(UniformGrid),
}

#[derive(Serialize)]
pub struct VoxelMapResponse {
    pub task_id: String,
    pub mode: MapMode,
    pub shape: [usize; 3],
    pub data_length: usize,
    pub chunk_size: usize,
    pub chunks: Vec<ChunkDescriptor>,
    pub optimization_voxels: usize,
}

#[post("/voxel-map/preprocess")]
pub async fn preprocess_voxel_map(
    data: web::Data<AppState>,
    payload: web::Json<VoxelMapRequest>,
) -> impl Responder {
    match run_preprocess(data.get_ref(), payload.into_inner()) {
        Ok(resp) => HttpResponse::Ok().json(resp),
        Err(err) => err,
    }
}

/// 创建 CT→优化体素对应表任务，并在后台计算
///
/// 响应立即返回分块信息；前端随后通过 `/voxel-map/chunk` 逐块拉取 i32 数据，
/// 未就绪的块返回 202。
pub fn run_preprocess(
    app_state: &AppState,
    request: VoxelMapRequest,
) -> Result<VoxelMapResponse, HttpResponse> {
    // ==================== 步骤 1: 参数验证 ====================
    let chunk_size = request.chunk_size.max(1);
    let ct = request.ct;
    if let Err(e) = ct.validate() {
        return Err(HttpResponse::BadRequest().json(serde_json::json!({
            "error": "CT 几何无效",
            "details": e.to_string(),
        })));
    }

    // ==================== 步骤 2: 确定映射模式 ====================
    let source = match (request.points, request.dose_grid) {
        (Some(points), None) => MapSource::Points(points),
        (None, Some(grid)) => {
            if let Err(e) = grid.validate() {
                return Err(HttpResponse::BadRequest().json(serde_json::json!({
                    "error": "剂量网格无效",
                    "details": e.to_string(),
                })));
            }
            MapSource::Grid(grid)
        }
        _ => {
            return Err(HttpResponse::BadRequest().json(serde_json::json!({
                "error": "points 与 dose_grid 必须且只能提供一个",
            })));
        }
    };
    let (mode, optimization_voxels) = match &source {
        MapSource::Points(points) => (MapMode::PointCloud, points.len()),
        MapSource::Grid(grid) => (MapMode::UniformGrid, grid.voxel_count()),
    };

    // ==================== 步骤 3: 计算分块信息并创建任务 ====================
    let data_length = ct.voxel_count();
    let chunks = split_chunks(data_length, chunk_size);
    let (task_id, task) = app_state
        .map_tasks
        .insert(MapTask::new(ct.shape, chunks.clone()));

    // ==================== 步骤 4: 后台计算对应表 ====================
    let task_id_clone = task_id.clone();
    actix_web::rt::task::spawn_blocking(move || {
        let started = Instant::now();
        let result = match &source {
            MapSource::Points(points) => map_point_cloud(&ct, points),
            MapSource::Grid(grid) => map_uniform_grid(&ct, grid),
        };
        let table = match result {
            Ok(table) => table,
            Err(e) => {
                error!(task = %task_id_clone, "对应表计算失败: {}", e);
                task.mark_failed(e.to_string());
                return;
            }
        };

        info!(
            task = %task_id_clone,
            bounds = ?table.bounds().map(|b: VoxelBox| (b.min, b.max)),
            unassigned = table.unassigned_count(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "对应表计算完成"
        );

        for descriptor in &task.chunks {
            task.set_chunk(descriptor.index, table.data[descriptor.start..descriptor.end].to_vec());
        }
    });

    Ok(VoxelMapResponse {
        task_id,
        mode,
        shape: ct.shape,
        data_length,
        chunk_size,
        chunks,
        optimization_voxels,
    })
}
