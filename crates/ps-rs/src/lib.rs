//! # PS-RS: Persistent-State Detection
//!
//! A memory held by synaptic facilitation shows up as short population
//! spikes (PS): brief bursts of synchronous firing in the selective
//! population that holds the item. This crate bins each population's
//! spikes, finds rate peaks above a fixed threshold and classifies them
//! against the stimulation protocol.
//!
//! Two protocols are supported:
//! - Panel A: one item, tested by a nonspecific readout signal. Peaks are
//!   split into before/during/after the readout window.
//! - Panel B: one item held through the delay period by background
//!   input. Peaks are counted and their intervals summarised.
//!
//! Results are written to `PS_data.json`.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;
use tracing::{info, warn};
use wmstp_core::{ParamSet, Time};
use wmstp_spikes::{load_populations, rate_histogram, SpikeError, SpikeTable};

#[derive(Error, Debug)]
pub enum PsError {
    #[error("No item loading signal in the protocol")]
    NoItemLoading,
    #[error("Panel A requires a nonspecific readout signal")]
    NoReadout,
    #[error("Empty delay period: [{start}, {end}]")]
    EmptyDelayPeriod { start: Time, end: Time },
    #[error("Invalid bin width: {0}")]
    InvalidBinWidth(f64),
    #[error("Unknown panel: {0} (expected A or B)")]
    UnknownPanel(String),
    #[error(transparent)]
    Spike(#[from] SpikeError),
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, PsError>;

/// Output file inside a dataset directory
pub const REPORT_FILE: &str = "PS_data.json";

// ============================================================================
// PEAK DETECTION
// ============================================================================

/// Indices of local maxima whose value is at least `height`.
///
/// A peak must be strictly higher than its left neighbour and than the
/// first differing sample on its right; flat tops report their middle
/// sample (rounded down). The first and last samples are never peaks.
pub fn find_peaks(signal: &[f64], height: f64) -> Vec<usize> {
    let mut peaks = Vec::new();
    if signal.len() < 3 {
        return peaks;
    }
    let i_max = signal.len() - 1;
    let mut i = 1;
    while i < i_max {
        if signal[i - 1] < signal[i] {
            let mut ahead = i + 1;
            while ahead < i_max && signal[ahead] == signal[i] {
                ahead += 1;
            }
            if signal[ahead] < signal[i] {
                let mid = (i + ahead - 1) / 2;
                if signal[mid] >= height {
                    peaks.push(mid);
                }
                i = ahead;
            }
        }
        i += 1;
    }
    peaks
}

/// Histogram settings for population-spike detection
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PeakDetector {
    pub bin_width: f64,   // ms
    pub threshold: f64,   // Hz per neuron
}

impl Default for PeakDetector {
    fn default() -> Self {
        Self {
            bin_width: 25.0,
            threshold: 20.0,
        }
    }
}

impl PeakDetector {
    pub fn new(bin_width: f64, threshold: f64) -> Result<Self> {
        if !(bin_width > 0.0) || !bin_width.is_finite() {
            return Err(PsError::InvalidBinWidth(bin_width));
        }
        Ok(Self {
            bin_width,
            threshold,
        })
    }

    /// Left edges (ms) of the bins holding a population spike
    pub fn peak_times(&self, spike_times: &[Time], n_neurons: usize) -> Vec<Time> {
        let histogram = rate_histogram(spike_times, self.bin_width, n_neurons);
        let rates = histogram.rates.to_vec();
        find_peaks(&rates, self.threshold)
            .into_iter()
            .map(|i| histogram.bin_start(i))
            .collect()
    }
}

// ============================================================================
// PROTOCOL WINDOWS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Panel {
    A,
    B,
}

impl FromStr for Panel {
    type Err = PsError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "A" => Ok(Panel::A),
            "B" => Ok(Panel::B),
            _ => Err(PsError::UnknownPanel(s.to_string())),
        }
    }
}

impl fmt::Display for Panel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Panel::A => write!(f, "A"),
            Panel::B => write!(f, "B"),
        }
    }
}

/// Windows against which peaks are classified
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DelayPeriod {
    pub item_onset: Time,
    pub start: Time,                        // Item onset + T_cue
    pub end: Time,
    pub readout: Option<(Time, Time)>,      // [origin, origin + T_reac]
}

impl DelayPeriod {
    pub fn from_params(set: &ParamSet, panel: Panel) -> Result<Self> {
        let (_, origins) = set.protocol.item_loading().ok_or(PsError::NoItemLoading)?;
        let item_onset = *origins.first().ok_or(PsError::NoItemLoading)?;
        let start = item_onset + set.network.stimulation_params.t_cue;

        let readout = set
            .protocol
            .readout_origins()
            .and_then(|o| o.first().copied())
            .map(|origin| (origin, origin + set.network.stimulation_params.t_reac));

        let end = match panel {
            Panel::A => readout.ok_or(PsError::NoReadout)?.0,
            Panel::B => set.simulation.eta_end_origin,
        };
        if !(end > start) {
            return Err(PsError::EmptyDelayPeriod { start, end });
        }

        Ok(Self {
            item_onset,
            start,
            end,
            readout,
        })
    }

    pub fn duration(&self) -> Time {
        self.end - self.start
    }
}

// ============================================================================
// CLASSIFICATION
// ============================================================================

/// Panel-specific part of a population result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PanelDetail {
    Readout {
        ps_before_test: usize,
        /// Peaks after the readout onset, the readout window included
        ps_after_test: usize,
        ps_during_test: usize,
        /// Peaks after the readout window has closed
        #[serde(default)]
        ps_after_readout: usize,
    },
    Rhythm {
        #[serde(rename = "av_dt_PS")]
        av_dt_ps: Option<f64>,
        #[serde(rename = "std_dt_PS")]
        std_dt_ps: Option<f64>,
        #[serde(rename = "PS_per_second")]
        ps_per_second: f64,
    },
}

/// Population-spike statistics of one selective population
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PopulationPs {
    pub ps_before_item: usize,      // 1 if any peak precedes item onset
    pub ps: usize,                  // Peaks after the delay start
    pub time_of_last_ps: Option<Time>,
    pub sim_time: Time,
    #[serde(flatten)]
    pub detail: PanelDetail,
}

fn interval_stats(peaks: &[Time]) -> (Option<f64>, Option<f64>) {
    if peaks.len() < 2 {
        return (None, None);
    }
    let intervals: Vec<f64> = peaks.windows(2).map(|w| w[1] - w[0]).collect();
    let n = intervals.len() as f64;
    let mean = intervals.iter().sum::<f64>() / n;
    let variance = intervals.iter().map(|d| (d - mean).powi(2)).sum::<f64>() / n;
    (Some(mean), Some(variance.sqrt()))
}

/// Classify peak times of one population.
pub fn classify(
    peak_times: &[Time],
    period: &DelayPeriod,
    panel: Panel,
    sim_time: Time,
) -> Result<PopulationPs> {
    let ps_before_item = usize::from(peak_times.iter().any(|&t| t < period.item_onset));
    let delay: Vec<Time> = peak_times.iter().copied().filter(|&t| t > period.start).collect();

    let detail = match panel {
        Panel::A => {
            let (start, stop) = period.readout.ok_or(PsError::NoReadout)?;
            PanelDetail::Readout {
                ps_before_test: delay.iter().filter(|&&t| t < start).count(),
                ps_after_test: delay.iter().filter(|&&t| t > start).count(),
                ps_during_test: delay.iter().filter(|&&t| t >= start && t <= stop).count(),
                ps_after_readout: delay.iter().filter(|&&t| t > stop).count(),
            }
        }
        Panel::B => {
            let (av_dt_ps, std_dt_ps) = interval_stats(&delay);
            PanelDetail::Rhythm {
                av_dt_ps,
                std_dt_ps,
                ps_per_second: 1000.0 * delay.len() as f64 / period.duration(),
            }
        }
    };

    Ok(PopulationPs {
        ps_before_item,
        ps: delay.len(),
        time_of_last_ps: delay.last().copied(),
        sim_time,
        detail,
    })
}

// ============================================================================
// REPORT
// ============================================================================

/// Contents of `PS_data.json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PsReport {
    pub panel: Panel,
    pub amplitude: f64,
    #[serde(rename = "frequence")]
    pub frequency: f64,
    pub targeted_pop: usize,
    #[serde(flatten)]
    pub populations: BTreeMap<String, PopulationPs>,
}

/// Memory retention summary derived from a report
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Performance {
    pub targeted_pop: usize,
    /// Last PS of the targeted population against `t_sim - <dt> - sigma`
    pub survival: Option<Survival>,
    pub ps_before_item: usize,
    pub false_positives: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Survival {
    pub time_of_last_ps: Time,
    pub threshold: Time,
    pub retained: bool,
}

fn population_key(index: usize) -> String {
    format!("pop_{}", index)
}

impl PsReport {
    pub fn population(&self, index: usize) -> Option<&PopulationPs> {
        self.populations.get(&population_key(index))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    /// Survival of the stored item and spurious activity elsewhere.
    pub fn evaluate(&self) -> Performance {
        let survival = self.population(self.targeted_pop).and_then(|pop| {
            let last = pop.time_of_last_ps?;
            match pop.detail {
                PanelDetail::Rhythm {
                    av_dt_ps: Some(av),
                    std_dt_ps: Some(spread),
                    ..
                } => {
                    let threshold = pop.sim_time - av - spread;
                    Some(Survival {
                        time_of_last_ps: last,
                        threshold,
                        retained: last > threshold,
                    })
                }
                _ => None,
            }
        });

        let targeted = population_key(self.targeted_pop);
        Performance {
            targeted_pop: self.targeted_pop,
            survival,
            ps_before_item: self.populations.values().map(|p| p.ps_before_item).sum(),
            false_positives: self
                .populations
                .iter()
                .filter(|(key, _)| **key != targeted)
                .map(|(_, p)| p.ps)
                .sum(),
        }
    }
}

/// Run the persistent-state test over already loaded populations.
pub fn test_ps(tables: &[SpikeTable], set: &ParamSet, panel: Panel) -> Result<PsReport> {
    let (pop_ids, _) = set.protocol.item_loading().ok_or(PsError::NoItemLoading)?;
    let targeted_pop = *pop_ids.first().ok_or(PsError::NoItemLoading)?;
    let period = DelayPeriod::from_params(set, panel)?;
    let detector = PeakDetector::new(set.analysis.ps_bin_width, set.analysis.ps_threshold)?;
    let n_neurons = set.network.population_size();

    info!(
        targeted_pop,
        start = period.start,
        end = period.end,
        "persistent-state test (panel {})",
        panel
    );

    let mut populations = BTreeMap::new();
    for (index, table) in tables.iter().enumerate() {
        let peaks = detector.peak_times(&table.times, n_neurons);
        let result = classify(&peaks, &period, panel, set.simulation.t_sim)?;

        if result.ps_before_item > 0 {
            warn!(population = index, "PS before item loading");
        }
        match &result.detail {
            PanelDetail::Readout {
                ps_before_test,
                ps_during_test,
                ps_after_readout,
                ..
            } => {
                if *ps_before_test > 0 {
                    warn!(population = index, count = ps_before_test, "PS before readout");
                }
                if *ps_after_readout > 0 {
                    warn!(population = index, count = ps_after_readout, "PS after readout");
                }
                info!(population = index, ps = result.ps, during = ps_during_test, "PS during readout");
            }
            PanelDetail::Rhythm {
                av_dt_ps,
                std_dt_ps,
                ps_per_second,
            } => {
                info!(
                    population = index,
                    ps = result.ps,
                    rate = ps_per_second,
                    interval = ?av_dt_ps,
                    interval_std = ?std_dt_ps,
                    "PS during delay period"
                );
            }
        }
        populations.insert(population_key(index), result);
    }

    Ok(PsReport {
        panel,
        amplitude: set.network.a_eta,
        frequency: set.network.fr_eta,
        targeted_pop,
        populations,
    })
}

/// Load `PS_data.json` from the dataset, or compute and write it.
pub fn load_or_compute(set: &ParamSet, panel: Panel, force: bool) -> Result<PsReport> {
    let path = set.data_path.join(REPORT_FILE);
    if path.exists() && !force {
        let stored = PsReport::load(&path)?;
        if stored.panel == panel {
            info!(path = %path.display(), "using stored PS report");
            return Ok(stored);
        }
        warn!(stored = %stored.panel, requested = %panel, "stored PS report is for another panel, recomputing");
    }
    let tables = load_populations(&set.data_path, set.network.p, set.network.overlap)?;
    let report = test_ps(&tables, set, panel)?;
    report.write(&path)?;
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn param_set(dir: &Path) -> ParamSet {
        let network = json!({
            "N_exc": 100,
            "f": 0.1,
            "p": 2,
            "A_eta": 1.1,
            "fr_eta": 20.0,
            "item_loading": {"nstim": 1, "pop_id": [1], "origin": [100.0]},
            "nonspecific_readout_signals": {"nstim": 1, "origin": [2000.0]},
        });
        let simulation = json!({"t_sim": 4000.0, "eta_end_origin": 1450.0});
        ParamSet::from_values(dir, network, simulation, &json!({})).unwrap()
    }

    fn burst(table: &mut SpikeTable, t: Time) {
        for id in 1..=10 {
            table.record(id, t + id as f64);
        }
    }

    #[test]
    fn test_find_peaks() {
        assert_eq!(find_peaks(&[0.0, 30.0, 0.0], 20.0), vec![1]);
        assert_eq!(find_peaks(&[0.0, 10.0, 0.0], 20.0), Vec::<usize>::new());
        // Edges are never peaks
        assert!(find_peaks(&[30.0, 0.0, 30.0], 20.0).is_empty());
        assert!(find_peaks(&[0.0, 25.0], 20.0).is_empty());
    }

    #[test]
    fn test_find_peaks_plateaus() {
        assert_eq!(find_peaks(&[0.0, 25.0, 25.0, 25.0, 0.0], 20.0), vec![2]);
        assert_eq!(find_peaks(&[0.0, 25.0, 25.0, 0.0], 20.0), vec![1]);
        // Plateau running into the last sample
        assert!(find_peaks(&[0.0, 25.0, 25.0], 20.0).is_empty());
        // Shoulder, not a peak
        assert_eq!(find_peaks(&[0.0, 25.0, 25.0, 40.0, 0.0], 20.0), vec![3]);
    }

    #[test]
    fn test_peak_times() {
        let mut table = SpikeTable::new();
        burst(&mut table, 500.0);
        table.record(3, 900.0);
        let detector = PeakDetector::default();
        // 10 spikes in a 25 ms bin for 10 neurons = 40 Hz
        assert_eq!(detector.peak_times(&table.times, 10), vec![500.0]);
        assert!(PeakDetector::new(0.0, 20.0).is_err());
    }

    #[test]
    fn test_panel_parse() {
        assert_eq!("a".parse::<Panel>().unwrap(), Panel::A);
        assert_eq!("B".parse::<Panel>().unwrap(), Panel::B);
        assert!("C".parse::<Panel>().is_err());
    }

    #[test]
    fn test_classify_panel_a() {
        let period = DelayPeriod {
            item_onset: 100.0,
            start: 450.0,
            end: 2000.0,
            readout: Some((2000.0, 2250.0)),
        };
        let peaks = [20.0, 50.0, 500.0, 1000.0, 2100.0, 3000.0];
        let result = classify(&peaks, &period, Panel::A, 4000.0).unwrap();

        // Flag, not a count
        assert_eq!(result.ps_before_item, 1);
        assert_eq!(result.ps, 4);
        assert_eq!(result.time_of_last_ps, Some(3000.0));
        assert_eq!(
            result.detail,
            PanelDetail::Readout {
                ps_before_test: 2,
                ps_after_test: 2,
                ps_during_test: 1,
                ps_after_readout: 1,
            }
        );

        let quiet = classify(&[500.0, 2100.0], &period, Panel::A, 4000.0).unwrap();
        assert_eq!(quiet.ps_before_item, 0);
    }

    #[test]
    fn test_classify_panel_b() {
        let period = DelayPeriod {
            item_onset: 100.0,
            start: 450.0,
            end: 1450.0,
            readout: None,
        };
        let result = classify(&[500.0, 700.0, 1000.0], &period, Panel::B, 4000.0).unwrap();
        match result.detail {
            PanelDetail::Rhythm {
                av_dt_ps,
                std_dt_ps,
                ps_per_second,
            } => {
                assert_eq!(av_dt_ps, Some(250.0));
                assert_eq!(std_dt_ps, Some(50.0));
                assert!((ps_per_second - 3.0).abs() < 1e-12);
            }
            other => panic!("unexpected detail {:?}", other),
        }

        let single = classify(&[500.0], &period, Panel::B, 4000.0).unwrap();
        assert!(matches!(
            single.detail,
            PanelDetail::Rhythm { av_dt_ps: None, std_dt_ps: None, .. }
        ));
        assert!(matches!(
            classify(&[], &period, Panel::A, 4000.0),
            Err(PsError::NoReadout)
        ));
    }

    #[test]
    fn test_delay_period() {
        let dir = TempDir::new().unwrap();
        let set = param_set(dir.path());
        let a = DelayPeriod::from_params(&set, Panel::A).unwrap();
        assert_eq!((a.start, a.end), (450.0, 2000.0));
        assert_eq!(a.readout, Some((2000.0, 2250.0)));
        let b = DelayPeriod::from_params(&set, Panel::B).unwrap();
        assert_eq!(b.end, 1450.0);

        let bare = ParamSet::from_values(dir.path(), json!({}), json!({}), &json!({})).unwrap();
        assert!(matches!(
            DelayPeriod::from_params(&bare, Panel::B),
            Err(PsError::NoItemLoading)
        ));
    }

    #[test]
    fn test_report_and_evaluation() {
        let dir = TempDir::new().unwrap();
        let set = param_set(dir.path());

        let mut quiet = SpikeTable::new();
        quiet.record(1, 600.0);
        quiet.record(2, 1400.0);
        let mut active = SpikeTable::new();
        for t in [500.0, 800.0, 1100.0] {
            burst(&mut active, t);
        }
        active.record(4, 1400.0);

        let report = test_ps(&[quiet, active], &set, Panel::B).unwrap();
        assert_eq!(report.targeted_pop, 1);
        assert_eq!(report.population(0).unwrap().ps, 0);
        let target = report.population(1).unwrap();
        assert_eq!(target.ps, 3);
        assert_eq!(target.time_of_last_ps, Some(1100.0));

        let performance = report.evaluate();
        assert_eq!(performance.false_positives, 0);
        assert_eq!(performance.ps_before_item, 0);
        // Last PS at 1100 ms is far from the end of a 4000 ms run
        assert_eq!(performance.survival.map(|s| s.retained), Some(false));

        let path = dir.path().join(REPORT_FILE);
        report.write(&path).unwrap();
        let value: serde_json::Value = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(value["panel"], json!("B"));
        assert_eq!(value["frequence"], json!(20.0));
        assert_eq!(value["pop_1"]["PS_per_second"], json!(3.0));
        assert_eq!(value["pop_0"]["av_dt_PS"], serde_json::Value::Null);
        assert_eq!(PsReport::load(&path).unwrap(), report);
    }

    #[test]
    fn test_load_or_compute_reads_dataset() {
        let dir = TempDir::new().unwrap();
        let set = param_set(dir.path());
        let mut rows = String::new();
        for t in [500.0, 1000.0] {
            for id in 1..=10 {
                rows.push_str(&format!("{} {}\n", id, t + id as f64));
            }
        }
        rows.push_str("3 1500.0\n");
        fs::write(dir.path().join("spikedata0.dat"), "1 700.0\n").unwrap();
        fs::write(dir.path().join("spikedata1.dat"), rows).unwrap();

        let report = load_or_compute(&set, Panel::A, false).unwrap();
        assert!(dir.path().join(REPORT_FILE).exists());
        assert_eq!(report.population(1).unwrap().ps, 2);

        // A stored report is reused unless forced
        fs::write(dir.path().join("spikedata1.dat"), "1 700.0\n").unwrap();
        assert_eq!(load_or_compute(&set, Panel::A, false).unwrap(), report);
        let fresh = load_or_compute(&set, Panel::A, true).unwrap();
        assert_eq!(fresh.population(1).unwrap().ps, 0);
    }

    #[test]
    fn test_stored_report_of_other_panel_is_recomputed() {
        let dir = TempDir::new().unwrap();
        let set = param_set(dir.path());
        let mut rows = String::new();
        for t in [500.0, 1000.0] {
            for id in 1..=10 {
                rows.push_str(&format!("{} {}\n", id, t + id as f64));
            }
        }
        rows.push_str("3 1500.0\n");
        fs::write(dir.path().join("spikedata0.dat"), "1 700.0\n").unwrap();
        fs::write(dir.path().join("spikedata1.dat"), rows).unwrap();

        let a = load_or_compute(&set, Panel::A, false).unwrap();
        assert_eq!(a.panel, Panel::A);

        let b = load_or_compute(&set, Panel::B, false).unwrap();
        assert_eq!(b.panel, Panel::B);
        assert!(matches!(
            b.population(1).unwrap().detail,
            PanelDetail::Rhythm { .. }
        ));
        assert_eq!(PsReport::load(&dir.path().join(REPORT_FILE)).unwrap().panel, Panel::B);
    }
}
