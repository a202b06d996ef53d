use actix_web::web;

use crate::handlers;

/// 统一注册 HTTP 路由，方便集中管理
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(handlers::hello)
        .service(handlers::start_scan)
        .service(handlers::get_scan_status)
        .service(handlers::preprocess_voxel_map)
        .service(handlers::get_voxel_map_chunk)
        .service(handlers::get_performance);
}
