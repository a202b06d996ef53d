use actix_web::{HttpResponse, Responder, get, web};

use crate::app_state::AppState;

/// 根路径健康检查/服务说明
#[get("/")]
pub async fn hello(data: web::Data<AppState>) -> impl Responder {
    let supported = data.parser_registry.supported_extensions();
    HttpResponse::Ok().json(serde_json::json!({
        "message": "质子点扫描影响矩阵服务",
        "endpoints": [
            "POST /influence-matrix/scan",
            "GET /influence-matrix/scan/status?task_id=<id>",
            "POST /voxel-map/preprocess",
            "GET /voxel-map/chunk?task_id=<id>&chunk_index=<n>",
            "GET /performance?session_id=<id>",
        ],
        "supported_extensions": supported,
        "resource_dir": data.resource_dir.display().to_string(),
        "scan_defaults": data.scan_defaults,
        "active_scans": data.scan_tasks.task_count(),
    }))
}
