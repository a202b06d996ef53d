use actix_web::{HttpResponse, Responder, get, web};
use serde::Deserialize;
use tracing::debug;

use crate::app_state::AppState;

#[derive(Deserialize)]
pub struct PerformanceQuery {
    pub session_id: String,
}

/// 获取指定会话的性能数据，扫描任务的 session_id 即 task_id
#[get("/performance")]
pub async fn get_performance(
    data: web::Data<AppState>,
    query: web::Query<PerformanceQuery>,
) -> impl Responder {
    let records = data.performance_store.get_records(&query.session_id);
    debug!(
        session = %query.session_id,
        records = records.as_ref().map_or(0, Vec::len),
        "性能数据查询"
    );

    // 没有记录时返回空数组，而不是 404
    HttpResponse::Ok().json(serde_json::json!({
        "session_id": query.session_id,
        "records": records.unwrap_or_default(),
    }))
}
