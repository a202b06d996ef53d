use std::path::{Component, Path};
use std::sync::Arc;
use std::time::Duration;

use actix_web::{HttpResponse, Responder, get, post, web};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::app_state::AppState;
use crate::engine::ReplayPlan;
use crate::error::Error;
use crate::influence::extract::{ExtractOptions, Extraction};
use crate::influence::writer::SpotKey;
use crate::influence::{IndexScheme, PlanProvider, ScanObserver, ScanProgress, ScanRequest, run_scan};
use crate::performance::{PerformanceRecord, PerformanceStore};
use crate::task::ScanTask;

#[derive(Deserialize)]
pub struct ScanRequestBody {
    /// 资源目录下的计划目录名
    pub plan: String,
    pub cutoff: Option<f64>,
    pub export_full: Option<bool>,
    pub index_scheme: Option<IndexScheme>,
    /// 输出根目录下的子目录名，缺省直接写到输出根目录
    pub output_dir: Option<String>,
}

#[derive(Serialize)]
pub struct ScanStartResponse {
    pub task_id: String,
    pub plan_id: String,
    pub plan_dir: String,
    pub beam_count: usize,
    pub spot_count: usize,
    pub request: ScanRequest,
}

#[derive(Deserialize)]
pub struct ScanStatusQuery {
    pub task_id: String,
}

/// 把扫描进度写回任务状态，并记录性能数据（session_id 即 task_id）
struct TaskObserver {
    task_id: String,
    task: Arc<ScanTask>,
    performance: Arc<PerformanceStore>,
}

impl ScanObserver for TaskObserver {
    fn on_calculation(&mut self, layer: usize, spot: usize, elapsed: Duration) {
        self.performance.add_record(
            &self.task_id,
            PerformanceRecord::ending_now(
                elapsed,
                "recalculate",
                self.task.plan_id.as_str(),
                format!("层 {} 点 {}", layer, spot),
            ),
        );
    }

    fn on_spot_written(&mut self, beam_id: &str, key: SpotKey, extraction: &Extraction, elapsed: Duration) {
        self.performance.add_record(
            &self.task_id,
            PerformanceRecord::ending_now(
                elapsed,
                "extract",
                beam_id,
                format!(
                    "束斑 {}: {} 个体素，截断 {} 个",
                    key.spot_id,
                    extraction.points.len(),
                    extraction.count_below_cutoff
                ),
            ),
        );
    }

    fn on_progress(&mut self, progress: &ScanProgress) {
        self.task.set_progress(progress.clone());
    }
}

fn is_plain_name(name: &str) -> bool {
    let mut components = Path::new(name).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    )
}

#[post("/influence-matrix/scan")]
pub async fn start_scan(
    data: web::Data<AppState>,
    payload: web::Json<ScanRequestBody>,
) -> impl Responder {
    match run_start_scan(data.get_ref(), payload.into_inner()) {
        Ok(resp) => HttpResponse::Accepted().json(resp),
        Err(err) => err,
    }
}

/// 创建扫描任务并在阻塞线程池中执行
///
/// 计划在请求线程中加载，缺文件、参数错误等问题直接返回 4xx；
/// 扫描本身在后台运行，同一时刻只有一个扫描持有引擎。
pub fn run_start_scan(
    app_state: &AppState,
    body: ScanRequestBody,
) -> Result<ScanStartResponse, HttpResponse> {
    // ==================== 步骤 1: 校验计划名 ====================
    if !is_plain_name(&body.plan) {
        return Err(HttpResponse::BadRequest().json(serde_json::json!({
            "error": "无效的计划名",
            "plan": body.plan,
        })));
    }

    // ==================== 步骤 2: 合并默认参数 ====================
    let defaults = &app_state.scan_defaults;
    let output_dir = match body.output_dir.as_deref() {
        None => defaults.output_dir.clone(),
        Some(name) if is_plain_name(name) => defaults.output_dir.join(name),
        Some(name) => {
            return Err(HttpResponse::BadRequest().json(serde_json::json!({
                "error": "无效的输出目录",
                "output_dir": name,
            })));
        }
    };
    let request = ScanRequest {
        output_dir,
        cutoff: body.cutoff.unwrap_or(defaults.cutoff),
        export_full: body.export_full.unwrap_or(defaults.export_full),
        index_scheme: body.index_scheme.unwrap_or(defaults.index_scheme),
    };
    if let Err(e) = ExtractOptions::new(request.cutoff, request.export_full).validate() {
        return Err(HttpResponse::BadRequest().json(serde_json::json!({
            "error": "扫描参数无效",
            "details": e.to_string(),
        })));
    }

    // ==================== 步骤 3: 加载计划 ====================
    let plan_dir = app_state.resource_dir.join(&body.plan);
    let plan = match ReplayPlan::load(&plan_dir, app_state.parser_registry.clone()) {
        Ok(plan) => plan,
        Err(Error::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(HttpResponse::NotFound().json(serde_json::json!({
                "error": "计划不存在",
                "plan": body.plan,
                "details": e.to_string(),
            })));
        }
        Err(e) => {
            return Err(HttpResponse::BadRequest().json(serde_json::json!({
                "error": "计划加载失败",
                "plan": body.plan,
                "details": e.to_string(),
            })));
        }
    };

    // ==================== 步骤 4: 创建任务 ====================
    let plan_id = plan.plan_id().to_string();
    let output_dir = request.plan_dir(&plan_id);
    let (task_id, task) = app_state
        .scan_tasks
        .insert(ScanTask::new(plan_id.clone(), output_dir.clone()));
    let response = ScanStartResponse {
        task_id: task_id.clone(),
        plan_id,
        plan_dir: output_dir.display().to_string(),
        beam_count: plan.beam_count(),
        spot_count: plan.total_spots(),
        request: request.clone(),
    };

    // ==================== 步骤 5: 后台执行 ====================
    let scan_lock = app_state.scan_lock.clone();
    let performance = app_state.performance_store.clone();
    let watched = (task.clone(), task_id.clone());
    let handle = actix_web::rt::task::spawn_blocking(move || {
        let mut plan = plan;
        let _engine = scan_lock.lock();
        task.mark_running();
        info!(task = %task_id, plan = %task.plan_id, "扫描任务开始");

        let mut observer = TaskObserver {
            task_id: task_id.clone(),
            task: task.clone(),
            performance,
        };
        match run_scan(&mut plan, &request, &mut observer) {
            Ok(summary) => {
                info!(task = %task_id, calculations = summary.calculations, "扫描任务完成");
                task.complete(summary);
            }
            Err(e) => {
                error!(task = %task_id, "扫描任务失败: {}", e);
                task.fail(e.to_string());
            }
        }
    });
    actix_web::rt::spawn(watch_scan(handle, watched.0, watched.1));

    Ok(response)
}

/// 扫描线程 panic 时任务不会自己结束，这里兜住并标记失败
async fn watch_scan(
    handle: actix_web::rt::task::JoinHandle<()>,
    task: Arc<ScanTask>,
    task_id: String,
) {
    if let Err(e) = handle.await {
        error!(task = %task_id, "扫描线程异常退出: {}", e);
        task.fail(format!("扫描线程异常退出: {}", e));
    }
}

#[get("/influence-matrix/scan/status")]
pub async fn get_scan_status(
    data: web::Data<AppState>,
    query: web::Query<ScanStatusQuery>,
) -> impl Responder {
    let Some(task) = data.scan_tasks.get(&query.task_id) else {
        warn!(task = %query.task_id, "查询未知的扫描任务");
        return HttpResponse::BadRequest().json(serde_json::json!({
            "error": "无效的 task_id",
            "task_id": query.task_id,
        }));
    };

    HttpResponse::Ok().json(serde_json::json!({
        "task_id": query.task_id,
        "plan_id": task.plan_id,
        "plan_dir": task.plan_dir.display().to_string(),
        "status": task.status(),
    }))
}
