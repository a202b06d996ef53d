use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::influence::extract::{ExtractOptions, Extraction, extract};
use crate::influence::plan::PlanProvider;
use crate::influence::writer::{IndexScheme, SparseMatrixWriter, SpotKey, SpotTable};
use crate::utils::voxel_grid::unflatten;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScanSettings {
    pub extract: ExtractOptions,
    pub scheme: IndexScheme,
}

/// 每次迭代完成后的进度，层/点均从 1 开始计数
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScanProgress {
    pub layer: usize,
    pub layer_count: usize,
    pub spot: usize,
    pub spot_count: usize,
    pub active_beams: usize,
    pub calculations: usize,
}

/// 扫描过程的观察钩子，不影响扫描结果
pub trait ScanObserver {
    fn on_calculation(&mut self, _layer: usize, _spot: usize, _elapsed: Duration) {}

    fn on_spot_written(
        &mut self,
        _beam_id: &str,
        _key: SpotKey,
        _extraction: &Extraction,
        _elapsed: Duration,
    ) {
    }

    fn on_progress(&mut self, _progress: &ScanProgress) {}
}

pub struct NoopObserver;

impl ScanObserver for NoopObserver {}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BeamScanSummary {
    pub beam_id: String,
    pub spots_measured: usize,
    pub sparse_rows: usize,
    pub sum_below_cutoff: f64,
    pub count_below_cutoff: usize,
    #[serde(skip)]
    pub spot_table: SpotTable,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ScanSummary {
    pub plan_id: String,
    pub calculations: usize,
    pub beams: Vec<BeamScanSummary>,
}

/// 各射束的层/点数量，以及每层在所有射束上的最大点数
#[derive(Debug, Clone, PartialEq)]
pub struct ScanLayout {
    pub spot_counts: Vec<Vec<usize>>,
    pub max_layer_count: usize,
    pub max_spot_count: Vec<usize>,
}

impl ScanLayout {
    pub fn from_plan<P: PlanProvider + ?Sized>(plan: &P) -> Self {
        let spot_counts: Vec<Vec<usize>> = (0..plan.beam_count())
            .map(|beam| {
                (0..plan.layer_count(beam))
                    .map(|layer| plan.spot_count(beam, layer))
                    .collect()
            })
            .collect();

        let max_layer_count = spot_counts.iter().map(Vec::len).max().unwrap_or(0);
        let max_spot_count = (0..max_layer_count)
            .map(|layer| {
                spot_counts
                    .iter()
                    .filter_map(|layers| layers.get(layer).copied())
                    .max()
                    .unwrap_or(0)
            })
            .collect();

        Self {
            spot_counts,
            max_layer_count,
            max_spot_count,
        }
    }

    pub fn has_spot(&self, beam: usize, layer: usize, spot: usize) -> bool {
        self.spot_counts[beam]
            .get(layer)
            .is_some_and(|count| spot < *count)
    }

    pub fn total_spots(&self) -> usize {
        self.spot_counts.iter().flatten().sum()
    }
}

/// 逐点扫描驱动：每个 (层, 点) 序号只打开一个束斑、只请求一次重算
pub struct SpotScanDriver<'a, P: PlanProvider + ?Sized> {
    plan: &'a mut P,
    settings: ScanSettings,
}

impl<'a, P: PlanProvider + ?Sized> SpotScanDriver<'a, P> {
    pub fn new(plan: &'a mut P, settings: ScanSettings) -> Self {
        Self { plan, settings }
    }

    /// 执行完整扫描。`writers[b]` 对应第 b 个射束。
    ///
    /// 重算失败立即返回错误；此前已完成束斑的数据保留在文件中。
    pub fn run<O: ScanObserver + ?Sized>(
        &mut self,
        writers: &mut [SparseMatrixWriter],
        observer: &mut O,
    ) -> Result<ScanSummary> {
        self.settings.extract.validate()?;
        let beam_count = self.plan.beam_count();
        if writers.len() != beam_count {
            return Err(Error::InvalidPlan(format!(
                "射束数 {} 与写入器数 {} 不一致",
                beam_count,
                writers.len()
            )));
        }

        let plan_id = self.plan.plan_id().to_string();
        let layout = ScanLayout::from_plan(&*self.plan);
        info!(
            plan = %plan_id,
            beams = beam_count,
            layers = layout.max_layer_count,
            spots = layout.total_spots(),
            "开始逐点扫描"
        );

        let mut beams: Vec<BeamScanSummary> = (0..beam_count)
            .map(|beam| BeamScanSummary {
                beam_id: self.plan.beam_info(beam).id.clone(),
                ..Default::default()
            })
            .collect();
        let mut calculations = 0usize;
        let mut active = Vec::with_capacity(beam_count);
        // 每个射束以首个束斑的剂量形状为准
        let mut dose_shapes: Vec<Option<[usize; 3]>> = vec![None; beam_count];

        for layer in 0..layout.max_layer_count {
            let spot_count = layout.max_spot_count[layer];
            for spot in 0..spot_count {
                // 打开所有拥有该 (层, 点) 的射束中的这个束斑
                active.clear();
                for beam in 0..beam_count {
                    if !layout.has_spot(beam, layer, spot) {
                        continue;
                    }
                    let params = self.plan.spot(beam, layer, spot);
                    let (x_mm, y_mm) = (params.x_mm, params.y_mm);
                    let energy = self.plan.layer_energy_mev(beam, layer);
                    let summary = &mut beams[beam];
                    summary
                        .spot_table
                        .push(summary.spots_measured, x_mm, y_mm, energy);

                    self.plan
                        .set_spot_weight(beam, layer, spot, self.settings.extract.spot_weight);
                    self.plan.apply_parameters(beam)?;
                    active.push(beam);
                }

                if active.is_empty() {
                    continue;
                }

                let started = Instant::now();
                self.plan
                    .recalculate()
                    .map_err(|e| Error::CalculationFailed {
                        plan: plan_id.clone(),
                        layer,
                        spot,
                        reason: e.to_string(),
                    })?;
                calculations += 1;
                observer.on_calculation(layer, spot, started.elapsed());

                for &beam in &active {
                    let started = Instant::now();
                    let summary = &mut beams[beam];
                    let key = SpotKey {
                        spot_id: summary.spots_measured,
                        layer,
                        spot,
                    };

                    let grid = self.plan.beam_dose(beam)?;
                    match dose_shapes[beam] {
                        None => dose_shapes[beam] = Some(grid.shape),
                        Some(shape) if shape != grid.shape => {
                            return Err(Error::InvalidGrid(format!(
                                "射束 {} 剂量网格形状 {:?} 与首个束斑 {:?} 不一致 (层 {}, 点 {})",
                                summary.beam_id, grid.shape, shape, layer, spot
                            )));
                        }
                        Some(_) => {}
                    }
                    let extraction = extract(&grid, &self.settings.extract);
                    let writer = &mut writers[beam];
                    writer.append(&extraction.points, key)?;
                    if let Some(dense) = extraction.dense.as_deref() {
                        writer.append_dense(dense, key)?;
                    }

                    summary.spots_measured += 1;
                    summary.sparse_rows += extraction.points.len();
                    summary.sum_below_cutoff += extraction.sum_below_cutoff;
                    summary.count_below_cutoff += extraction.count_below_cutoff;
                    let peak = extraction
                        .points
                        .iter()
                        .max_by(|a, b| a.dose.total_cmp(&b.dose))
                        .map(|p| (unflatten(grid.shape, p.voxel), p.dose));
                    debug!(
                        beam = %summary.beam_id,
                        spot_id = key.spot_id,
                        points = extraction.points.len(),
                        peak = ?peak,
                        below_cutoff = extraction.count_below_cutoff,
                        sum_below_cutoff = extraction.sum_below_cutoff,
                        "束斑剂量已写入"
                    );
                    observer.on_spot_written(&summary.beam_id, key, &extraction, started.elapsed());

                    // 关闭该束斑
                    self.plan.set_spot_weight(beam, layer, spot, 0.0);
                    self.plan.apply_parameters(beam)?;
                }

                let progress = ScanProgress {
                    layer: layer + 1,
                    layer_count: layout.max_layer_count,
                    spot: spot + 1,
                    spot_count,
                    active_beams: active.len(),
                    calculations,
                };
                debug!(
                    "进度: 层 {}/{}, 点 {}/{}",
                    progress.layer, progress.layer_count, progress.spot, progress.spot_count
                );
                observer.on_progress(&progress);
            }
            info!(
                plan = %plan_id,
                "能量层 {}/{} 完成",
                layer + 1,
                layout.max_layer_count
            );
        }

        Ok(ScanSummary {
            plan_id,
            calculations,
            beams,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::influence::extract::ACTIVE_SPOT_WEIGHT;
    use crate::influence::mock::MockPlan;
    use crate::influence::plan::set_all_spots_to_zero;
    use crate::influence::writer::SPARSE_DATASET;

    fn settings(cutoff: f64, emit_dense: bool) -> ScanSettings {
        ScanSettings {
            extract: ExtractOptions::new(cutoff, emit_dense),
            scheme: IndexScheme::PerBeamFlat,
        }
    }

    fn writers(dir: &std::path::Path, plan: &MockPlan) -> Vec<SparseMatrixWriter> {
        (0..plan.beam_count())
            .map(|b| {
                SparseMatrixWriter::open(dir, &plan.beam_info(b).id, IndexScheme::PerBeamFlat)
                    .unwrap()
            })
            .collect()
    }

    #[derive(Default)]
    struct Recorder {
        progress: Vec<ScanProgress>,
        written: Vec<(String, SpotKey)>,
    }

    impl ScanObserver for Recorder {
        fn on_spot_written(&mut self, beam_id: &str, key: SpotKey, _: &Extraction, _: Duration) {
            self.written.push((beam_id.to_string(), key));
        }

        fn on_progress(&mut self, progress: &ScanProgress) {
            self.progress.push(progress.clone());
        }
    }

    #[test]
    fn layout_takes_per_layer_maximum() {
        let plan = MockPlan::new(&[&[2, 5], &[3], &[]]);
        let layout = ScanLayout::from_plan(&plan);
        assert_eq!(layout.max_layer_count, 2);
        assert_eq!(layout.max_spot_count, vec![3, 5]);
        assert!(layout.has_spot(0, 1, 4));
        assert!(!layout.has_spot(1, 1, 0));
        assert!(!layout.has_spot(2, 0, 0));
        assert_eq!(layout.total_spots(), 10);
    }

    #[test]
    fn two_beams_with_unequal_spot_counts() {
        let dir = tempfile::tempdir().unwrap();
        let mut plan = MockPlan::new(&[&[2], &[1]]);
        let mut writers = writers(dir.path(), &plan);
        let mut recorder = Recorder::default();

        let summary = SpotScanDriver::new(&mut plan, settings(0.0, false))
            .run(&mut writers, &mut recorder)
            .unwrap();

        assert_eq!(summary.calculations, 2);
        assert_eq!(plan.recalculations, 2);
        assert_eq!(
            plan.active_history,
            vec![vec![(0, 0, 0), (1, 0, 0)], vec![(0, 0, 1)]]
        );
        assert_eq!(writers[0].store().len(SPARSE_DATASET).unwrap(), 2);
        assert_eq!(writers[1].store().len(SPARSE_DATASET).unwrap(), 1);
        assert_eq!(summary.beams[0].spots_measured, 2);
        assert_eq!(summary.beams[1].spots_measured, 1);
        assert_eq!(recorder.progress.len(), 2);
        assert_eq!(recorder.progress[1].spot, 2);
        assert_eq!(recorder.progress[1].active_beams, 1);
        assert!(plan.all_weights_zero());
    }

    #[test]
    fn spot_ids_are_dense_per_beam() {
        let dir = tempfile::tempdir().unwrap();
        let mut plan = MockPlan::new(&[&[1, 3], &[2]]);
        let mut writers = writers(dir.path(), &plan);
        let mut recorder = Recorder::default();

        let summary = SpotScanDriver::new(&mut plan, settings(0.0, false))
            .run(&mut writers, &mut recorder)
            .unwrap();

        // 层 0: 点 0 (A,B), 点 1 (B)；层 1: 点 0..3 (A)
        assert_eq!(summary.calculations, 5);
        let ids_a: Vec<usize> = recorder
            .written
            .iter()
            .filter(|(beam, _)| beam == "A")
            .map(|(_, key)| key.spot_id)
            .collect();
        assert_eq!(ids_a, vec![0, 1, 2, 3]);
        assert_eq!(summary.beams[0].spot_table.ids, vec![0, 1, 2, 3]);
        assert_eq!(summary.beams[0].spot_table.energy_mev, vec![100.0, 110.0, 110.0, 110.0]);

        let rows = writers[0].store().read::<f64>(SPARSE_DATASET).unwrap();
        let spot_column: Vec<f64> = rows.chunks(3).map(|row| row[1]).collect();
        assert_eq!(spot_column, vec![0.0, 1.0, 2.0, 3.0]);
    }

    #[test]
    fn only_measured_spot_is_active_during_calculation() {
        let dir = tempfile::tempdir().unwrap();
        let mut plan = MockPlan::new(&[&[3, 2], &[2, 2]]);
        let mut writers = writers(dir.path(), &plan);

        SpotScanDriver::new(&mut plan, settings(0.0, false))
            .run(&mut writers, &mut NoopObserver)
            .unwrap();

        for active in &plan.active_history {
            let beams: Vec<usize> = active.iter().map(|(beam, _, _)| *beam).collect();
            let mut unique = beams.clone();
            unique.dedup();
            assert_eq!(beams, unique, "每个射束同时只有一个束斑: {:?}", active);
            let (_, layer, spot) = active[0];
            assert!(active.iter().all(|(_, l, s)| *l == layer && *s == spot));
        }
        assert!(plan.applied_weights_seen.iter().all(|w| *w == ACTIVE_SPOT_WEIGHT));
        assert!(plan.all_weights_zero());
    }

    #[test]
    fn failed_calculation_aborts_and_keeps_completed_spots() {
        let dir = tempfile::tempdir().unwrap();
        let mut plan = MockPlan::new(&[&[3]]);
        plan.fail_on_call = Some(2);
        let mut writers = writers(dir.path(), &plan);

        let err = SpotScanDriver::new(&mut plan, settings(0.0, false))
            .run(&mut writers, &mut NoopObserver)
            .unwrap_err();

        assert!(matches!(
            err,
            Error::CalculationFailed { layer: 0, spot: 1, .. }
        ));
        assert_eq!(plan.recalculations, 2);
        assert_eq!(writers[0].store().len(SPARSE_DATASET).unwrap(), 1);
    }

    #[test]
    fn missing_dose_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let mut plan = MockPlan::new(&[&[1]]);
        plan.drop_doses = true;
        let mut writers = writers(dir.path(), &plan);

        let err = SpotScanDriver::new(&mut plan, settings(0.0, false))
            .run(&mut writers, &mut NoopObserver)
            .unwrap_err();
        assert!(matches!(err, Error::DoseMissing { .. }));
    }

    #[test]
    fn layers_without_spots_never_call_the_engine() {
        let dir = tempfile::tempdir().unwrap();
        let mut plan = MockPlan::new(&[&[0, 1], &[0]]);
        let mut writers = writers(dir.path(), &plan);

        let summary = SpotScanDriver::new(&mut plan, settings(0.0, false))
            .run(&mut writers, &mut NoopObserver)
            .unwrap();
        assert_eq!(summary.calculations, 1);
        assert_eq!(summary.beams[1].spots_measured, 0);
        assert!(!writers[1].store().contains(SPARSE_DATASET));
    }

    #[test]
    fn dose_shape_change_within_beam_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut plan = MockPlan::new(&[&[2]]);
        plan.reshape_on_call = Some((2, [2, 2, 2]));
        let mut writers = writers(dir.path(), &plan);

        let result = SpotScanDriver::new(&mut plan, settings(0.0, false))
            .run(&mut writers, &mut NoopObserver);
        assert!(matches!(result, Err(Error::InvalidGrid(_))));
        assert_eq!(plan.recalculations, 2);
    }

    #[test]
    fn dense_export_writes_one_row_per_spot() {
        let dir = tempfile::tempdir().unwrap();
        let mut plan = MockPlan::new(&[&[2]]);
        let mut writers = writers(dir.path(), &plan);

        SpotScanDriver::new(&mut plan, settings(0.0, true))
            .run(&mut writers, &mut NoopObserver)
            .unwrap();

        let store = writers[0].store();
        let full = store.shape(crate::influence::writer::FULL_DATASET).unwrap();
        assert_eq!(full, vec![2, plan.voxel_count()]);
    }

    #[test]
    fn set_all_spots_to_zero_is_idempotent() {
        let mut plan = MockPlan::new(&[&[2, 1], &[3]]);
        plan.set_spot_weight(0, 1, 0, 42.0);
        plan.apply_parameters(0).unwrap();

        set_all_spots_to_zero(&mut plan).unwrap();
        assert!(plan.all_weights_zero());
        let snapshot = plan.beams.clone();

        set_all_spots_to_zero(&mut plan).unwrap();
        assert!(plan.all_weights_zero());
        assert_eq!(plan.beams, snapshot);
        assert_eq!(plan.recalculations, 0);
    }
}
