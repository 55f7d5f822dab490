//! Retrain loop: fingerprint datasets, retrain the ones whose content moved
//! since the last successful train, record the new fingerprints, reload the
//! registry.

use crate::fingerprint::{fingerprint, short};
use crate::kinds::KindRegistry;
use crate::ledger::{ChangeLedger, LedgerError};
use crate::metrics::METRICS;
use crate::registry::ModelRegistry;
use crate::trainer::{Trainer, TrainingJob};
use crate::error_chain;
use parking_lot::Mutex;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, info_span, warn};

#[derive(Debug, Error)]
pub enum TickError {
    #[error("listing datasets in {dir}")]
    Listing { dir: PathBuf, #[source] source: io::Error },
    #[error("fingerprinting {path}")]
    Fingerprint { path: PathBuf, #[source] source: io::Error },
    #[error("reading ledger")]
    Ledger(#[from] LedgerError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureStage { Kind, Train, Ledger }

impl FailureStage {
    pub fn as_str(&self) -> &'static str {
        match self { FailureStage::Kind => "kind", FailureStage::Train => "train", FailureStage::Ledger => "ledger" }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelUpdate {
    pub model: String,
    pub current_hash: String,
    pub previous_hash: String,
}

#[derive(Debug, Clone)]
pub struct ModelFailure {
    pub model: String,
    pub stage: FailureStage,
    pub error: String,
}

#[derive(Debug, Clone, Default)]
pub struct TickReport {
    pub tick_id: String,
    pub updated: Vec<ModelUpdate>,
    pub unchanged: Vec<String>,
    pub failures: Vec<ModelFailure>,
    /// At least one artifact was published, even if its ledger write failed.
    pub published: bool,
    pub reloaded: bool,
}

impl TickReport {
    pub fn any_updated(&self) -> bool { !self.updated.is_empty() }

    pub fn summary_table(&self) -> String {
        let rows: Vec<Vec<String>> = self.updated.iter()
            .map(|u| vec![u.model.clone(), u.current_hash.clone(), u.previous_hash.clone()])
            .collect();
        render_grid(&["model", "current_hash", "previous_hash"], &rows)
    }
}

/// Plain-text grid table with a double rule under the header.
pub fn render_grid(headers: &[&str], rows: &[Vec<String>]) -> String {
    let mut widths: Vec<usize> = headers.iter().map(|h| h.len()).collect();
    for row in rows {
        for (w, cell) in widths.iter_mut().zip(row) { *w = (*w).max(cell.chars().count()); }
    }
    let mut out = vec![grid_rule(&widths, '-'), grid_line(&widths, headers.iter().copied()), grid_rule(&widths, '=')];
    for row in rows {
        out.push(grid_line(&widths, row.iter().map(String::as_str)));
        out.push(grid_rule(&widths, '-'));
    }
    if rows.is_empty() {
        out.pop();
        out.push(grid_rule(&widths, '-'));
    }
    out.join("\n")
}

fn grid_rule(widths: &[usize], c: char) -> String {
    let mut s = String::from("+");
    for &w in widths {
        s.extend(std::iter::repeat(c).take(w + 2));
        s.push('+');
    }
    s
}

fn grid_line<'a>(widths: &[usize], cells: impl Iterator<Item = &'a str>) -> String {
    let mut s = String::from("|");
    for (&w, cell) in widths.iter().zip(cells) {
        s.push_str(&format!(" {cell:<w$} |"));
    }
    s
}

impl fmt::Display for TickReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", self.summary_table())?;
        for failure in &self.failures {
            writeln!(f, "failed {} at {}: {}", failure.model, failure.stage.as_str(), failure.error)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct DatasetEntry {
    pub model: String,
    pub path: PathBuf,
}

/// Regular files in `dir` with extension `ext`, sorted by file name.
pub fn list_datasets(dir: &Path, ext: &str) -> io::Result<Vec<DatasetEntry>> {
    let mut out = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() { continue; }
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some(ext) { continue; }
        if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
            out.push(DatasetEntry { model: stem.to_string(), path });
        }
    }
    out.sort_by(|a, b| a.path.file_name().cmp(&b.path.file_name()));
    Ok(out)
}

pub struct Retrainer {
    datasets_dir: PathBuf,
    dataset_extension: String,
    ridge_alpha: f64,
    kinds: KindRegistry,
    ledger: Arc<dyn ChangeLedger>,
    trainer: Trainer,
    registry: Arc<ModelRegistry>,
    reload_pending: AtomicBool,
    running: Mutex<()>,
}

impl Retrainer {
    pub fn new(
        datasets_dir: impl Into<PathBuf>,
        dataset_extension: impl Into<String>,
        ridge_alpha: f64,
        kinds: KindRegistry,
        ledger: Arc<dyn ChangeLedger>,
        trainer: Trainer,
        registry: Arc<ModelRegistry>,
    ) -> Self {
        Self {
            datasets_dir: datasets_dir.into(),
            dataset_extension: dataset_extension.into(),
            ridge_alpha,
            kinds,
            ledger,
            trainer,
            registry,
            reload_pending: AtomicBool::new(false),
            running: Mutex::new(()),
        }
    }

    pub fn registry(&self) -> &Arc<ModelRegistry> { &self.registry }

    pub fn reload_pending(&self) -> bool { self.reload_pending.load(Ordering::SeqCst) }

    /// One full pass. Blocking: run it off the async runtime. Concurrent calls
    /// are serialized.
    pub fn run_tick(&self) -> Result<TickReport, TickError> {
        let _running = self.running.lock();
        let tick_id = uuid::Uuid::new_v4().to_string();
        let span = info_span!("retrain_tick", tick_id = %tick_id);
        let _enter = span.enter();
        METRICS.retrain.ticks_total.inc();
        let res = self.tick_inner(tick_id);
        if let Err(e) = &res {
            METRICS.retrain.tick_failures_total.inc();
            error!(error = %error_chain(e), "retrain tick aborted");
        }
        res
    }

    /// The loaded artifact was trained as a different kind than the model is
    /// bound to now.
    fn kind_rebound(&self, model: &str) -> bool {
        match (self.kinds.resolve(model), self.registry.get(model)) {
            (Ok(kind), Ok(loaded)) => loaded.manifest.kind != kind,
            _ => false,
        }
    }

    fn tick_inner(&self, tick_id: String) -> Result<TickReport, TickError> {
        info!("checking datasets for changes");
        // ticks never overlap, so any temporary present now is left over
        let swept = self.trainer.store().sweep_temporaries(Duration::ZERO);
        if swept > 0 { info!(swept, "removed leftover artifact temporaries"); }

        let datasets = list_datasets(&self.datasets_dir, &self.dataset_extension)
            .map_err(|source| TickError::Listing { dir: self.datasets_dir.clone(), source })?;
        let mut hashed = Vec::with_capacity(datasets.len());
        for ds in datasets {
            let hash = fingerprint(&ds.path).map_err(|source| TickError::Fingerprint { path: ds.path.clone(), source })?;
            hashed.push((ds, hash));
        }
        let ledger = self.ledger.fetch_all()?;

        let mut report = TickReport { tick_id, ..TickReport::default() };
        for (ds, hash) in hashed {
            let entry = ledger.get(&ds.model);
            let current = entry.map(|e| e.current_hash.as_str()).unwrap_or("");
            if hash == current {
                if !self.kind_rebound(&ds.model) {
                    debug!(model = %ds.model, "no update found");
                    report.unchanged.push(ds.model);
                    continue;
                }
                info!(model = %ds.model, "kind binding changed; retraining");
            } else {
                info!(model = %ds.model, new = short(&hash), old = short(current), "dataset changed; retraining");
            }
            let fail = |report: &mut TickReport, stage: FailureStage, error: String| {
                METRICS.retrain.model_failures_total.with_label_values(&[ds.model.as_str(), stage.as_str()]).inc();
                warn!(model = %ds.model, stage = stage.as_str(), %error, "model retrain failed");
                report.failures.push(ModelFailure { model: ds.model.clone(), stage, error });
            };
            let kind = match self.kinds.resolve(&ds.model) {
                Ok(k) => k,
                Err(e) => { fail(&mut report, FailureStage::Kind, e.to_string()); continue; }
            };
            let job = TrainingJob {
                model_name: ds.model.clone(),
                kind,
                dataset_path: ds.path.clone(),
                dataset_fingerprint: hash.clone(),
                plan: kind.strategy().build_trainer(self.ridge_alpha),
            };
            if let Err(e) = self.trainer.train_and_save(job) {
                fail(&mut report, FailureStage::Train, error_chain(&e));
                continue;
            }
            report.published = true;
            METRICS.retrain.retrains_total.with_label_values(&[ds.model.as_str()]).inc();
            let recorded = match entry {
                None => self.ledger.insert(&ds.model, &hash),
                Some(_) => self.ledger.update(&ds.model, &hash, current),
            };
            if let Err(e) = recorded {
                fail(&mut report, FailureStage::Ledger, error_chain(&e));
                continue;
            }
            report.updated.push(ModelUpdate { model: ds.model.clone(), current_hash: short(&hash).to_string(), previous_hash: short(current).to_string() });
        }

        info!("update summary\n{}", report.summary_table());
        if report.published || self.reload_pending() {
            match self.registry.reload(self.trainer.store()) {
                Ok(_) => { self.reload_pending.store(false, Ordering::SeqCst); report.reloaded = true; }
                Err(_) => self.reload_pending.store(true, Ordering::SeqCst),
            }
        }
        info!(updated = report.updated.len(), unchanged = report.unchanged.len(), failed = report.failures.len(), reloaded = report.reloaded, "retrain tick finished");
        Ok(report)
    }
}

/// Run `run_tick` every `interval` on the blocking pool. The first tick is
/// skipped since startup already ran one.
pub fn spawn_scheduler(retrainer: Arc<Retrainer>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let r = retrainer.clone();
            match tokio::task::spawn_blocking(move || r.run_tick()).await {
                Ok(Ok(report)) if !report.failures.is_empty() => warn!(failed = report.failures.len(), "retrain tick finished with failures"),
                Ok(_) => {}
                Err(e) => error!(error = %e, "retrain tick panicked"),
            }
        }
    })
}
