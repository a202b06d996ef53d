use actix_web::{HttpResponse, Responder, get, http::header::ContentType, web};
use byteorder::{LittleEndian, WriteBytesExt};
use serde::Deserialize;

use crate::app_state::AppState;

#[derive(Deserialize)]
pub struct ChunkQuery {
    pub task_id: String,
    pub chunk_index: usize,
}

/// 以小端 i32 二进制返回对应表的一个分块，取走后即释放
#[get("/voxel-map/chunk")]
pub async fn get_voxel_map_chunk(
    data: web::Data<AppState>,
    query: web::Query<ChunkQuery>,
) -> impl Responder {
    let Some(task) = data.map_tasks.get(&query.task_id) else {
        return HttpResponse::BadRequest().json(serde_json::json!({
            "error": "无效的 task_id",
            "task_id": query.task_id,
        }));
    };

    let Some(descriptor) = task.chunks.get(query.chunk_index) else {
        return HttpResponse::BadRequest().json(serde_json::json!({
            "error": "无效的 chunk_index",
            "chunk_index": query.chunk_index,
        }));
    };

    if let Some(reason) = task.failure() {
        return HttpResponse::InternalServerError().json(serde_json::json!({
            "error": "对应表计算失败",
            "task_id": query.task_id,
            "details": reason,
        }));
    }

    let Some(chunk_values) = task.take_chunk(query.chunk_index) else {
        // 已被取走返回 400，尚未就绪返回 202
        return if !task.has_chunk(query.chunk_index) {
            HttpResponse::BadRequest().json(serde_json::json!({
                "error": "chunk 已被请求",
                "task_id": query.task_id,
                "chunk_index": query.chunk_index,
            }))
        } else {
            HttpResponse::Accepted().json(serde_json::json!({
                "error": "chunk 正在计算中，请稍后重试",
                "task_id": query.task_id,
                "chunk_index": query.chunk_index,
                "status": "processing",
            }))
        };
    };

    let mut bytes = Vec::with_capacity(chunk_values.len() * std::mem::size_of::<i32>());
    for value in chunk_values {
        if let Err(e) = bytes.write_i32::<LittleEndian>(value) {
            return HttpResponse::InternalServerError().json(serde_json::json!({
                "error": "写入 chunk 数据失败",
                "details": e.to_string(),
            }));
        }
    }

    HttpResponse::Ok()
        .content_type(ContentType::octet_stream())
        .append_header(("X-Chunk-Index", descriptor.index.to_string()))
        .append_header(("X-Chunk-Start", descriptor.start.to_string()))
        .append_header(("X-Chunk-End", descriptor.end.to_string()))
        .append_header((
            "X-Chunk-Length",
            (descriptor.end - descriptor.start).to_string(),
        ))
        .append_header(("X-Chunk-Task", query.task_id.clone()))
        .append_header((
            "X-Map-Shape",
            format!("{},{},{}", task.shape[0], task.shape[1], task.shape[2]),
        ))
        .body(bytes)
}
