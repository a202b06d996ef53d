use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::info;

use crate::error::{Error, Result};
use crate::influence::extract::ExtractOptions;
use crate::influence::metadata::{BeamMetadata, write_json_file};
use crate::influence::optimization::export_optimization_voxels;
use crate::influence::plan::{PlanProvider, set_all_spots_to_zero};
use crate::influence::scan::{ScanObserver, ScanSettings, ScanSummary, SpotScanDriver};
use crate::influence::writer::{IndexScheme, SPARSE_DATASET, SparseMatrixWriter};

pub const BEAMS_DIR: &str = "Beams";

/// 一次完整扫描的输出设置
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScanRequest {
    pub output_dir: PathBuf,
    pub cutoff: f64,
    pub export_full: bool,
    pub index_scheme: IndexScheme,
}

impl ScanRequest {
    /// 计划输出目录 `<output_dir>/<plan_id>`
    pub fn plan_dir(&self, plan_id: &str) -> PathBuf {
        self.output_dir.join(plan_id)
    }
}

pub fn beam_metadata_file_name(beam_id: &str) -> String {
    format!("Beam_{}_MetaData.json", beam_id)
}

fn is_file_name_safe(name: &str) -> bool {
    !(name.is_empty() || name.contains(['/', '\\']) || name == "." || name == "..")
}

/// 计划 ID 与射束 ID 会出现在路径里，必须不含路径分隔符；射束 ID 还必须唯一
fn validate_names<P: PlanProvider + ?Sized>(plan: &P) -> Result<()> {
    if !is_file_name_safe(plan.plan_id()) {
        return Err(Error::InvalidPlan(format!("计划 ID 无效: {:?}", plan.plan_id())));
    }
    if plan.beam_count() == 0 {
        return Err(Error::InvalidPlan(format!("计划 {} 没有射束", plan.plan_id())));
    }
    let mut seen = HashSet::new();
    for beam in 0..plan.beam_count() {
        let id = plan.beam_info(beam).id.as_str();
        if !is_file_name_safe(id) {
            return Err(Error::InvalidPlan(format!("射束 ID 无效: {:?}", id)));
        }
        if !seen.insert(id) {
            return Err(Error::InvalidPlan(format!("射束 ID 重复: {}", id)));
        }
    }
    Ok(())
}

fn prepare_output_dir(plan_dir: &Path) -> Result<PathBuf> {
    if plan_dir.exists() {
        info!(dir = %plan_dir.display(), "清理已有输出目录");
        fs::remove_dir_all(plan_dir)?;
    }
    let beams_dir = plan_dir.join(BEAMS_DIR);
    fs::create_dir_all(&beams_dir)?;
    Ok(beams_dir)
}

/// 对整个计划执行影响矩阵扫描并写出全部结果文件
///
/// 输出目录在开始前清空重建；扫描结束后写入束斑表、射束元数据，
/// 计划提供剂量网格几何时再导出优化体素。
pub fn run_scan<P, O>(plan: &mut P, request: &ScanRequest, observer: &mut O) -> Result<ScanSummary>
where
    P: PlanProvider + ?Sized,
    O: ScanObserver + ?Sized,
{
    let settings = ScanSettings {
        extract: ExtractOptions::new(request.cutoff, request.export_full),
        scheme: request.index_scheme,
    };
    settings.extract.validate()?;
    validate_names(plan)?;

    let plan_dir = request.plan_dir(plan.plan_id());
    let beams_dir = prepare_output_dir(&plan_dir)?;

    set_all_spots_to_zero(plan)?;

    let mut writers = (0..plan.beam_count())
        .map(|beam| SparseMatrixWriter::open(&beams_dir, &plan.beam_info(beam).id, settings.scheme))
        .collect::<Result<Vec<_>>>()?;

    let summary = SpotScanDriver::new(&mut *plan, settings).run(&mut writers, observer)?;

    for (beam, writer) in writers.iter_mut().enumerate() {
        let beam_summary = &summary.beams[beam];
        writer.write_spot_table(&beam_summary.spot_table)?;

        let info = plan.beam_info(beam);
        let metadata = BeamMetadata::new(
            info,
            request.cutoff,
            request.export_full,
            beam_summary.spots_measured,
        );
        write_json_file(&metadata, &beams_dir.join(beam_metadata_file_name(&info.id)))?;
    }

    for (writer, beam_summary) in writers.iter().zip(&summary.beams) {
        info!(
            beam = %beam_summary.beam_id,
            file = %writer.path().display(),
            spots = beam_summary.spots_measured,
            rows = writer.store().len(SPARSE_DATASET).unwrap_or(0),
            "射束数据已写出"
        );
    }

    if let Some(dose) = plan.dose_geometry() {
        let ct = plan.ct_geometry();
        export_optimization_voxels(&plan_dir, &dose, ct.as_ref())?;
    }

    info!(
        plan = %summary.plan_id,
        calculations = summary.calculations,
        dir = %plan_dir.display(),
        "影响矩阵扫描完成"
    );
    Ok(summary)
}
