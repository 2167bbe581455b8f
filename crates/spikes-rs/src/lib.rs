//! # Spikes-RS: Spike Record Ingestion
//!
//! Loads the spike tables written by the spike recorders of a working-memory
//! run (`spikedata{i}.dat`, one per selective population) and turns them
//! into per-unit spike trains.
//!
//! Key features:
//! - Two-column tables: sender id (float encoded) and spike time (ms)
//! - Overlapping populations: global ids relabelled to compact local ids
//!   through `selective_pop_ids.dat`
//! - Spike trains grouped per unit, rounded to the analysis precision
//! - Firing-rate statistics (per-neuron rates, CV of ISI, rate histograms)

use ndarray::{Array1, Array2};
use std::collections::HashMap;
use std::ops::Range;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};
use wmstp_core::{read_dat, round_to, CoreError, Time, UnitId};

#[derive(Error, Debug)]
pub enum SpikeError {
    #[error("Spike file not found: {0}")]
    MissingFile(PathBuf),
    #[error("Bad table shape in {path}: expected {expected} columns, got {got}")]
    BadShape {
        path: PathBuf,
        expected: usize,
        got: usize,
    },
    #[error("Invalid sender id: {0}")]
    InvalidId(f64),
    #[error("Population {index} not in remap table ({available} columns)")]
    PopulationOutOfRange { index: usize, available: usize },
    #[error("Remap column {column} lists id {id} more than once")]
    DuplicateId { column: usize, id: UnitId },
    #[error("Invalid window: [{0}, {1}]")]
    InvalidWindow(Time, Time),
    #[error(transparent)]
    Core(CoreError),
}

impl From<CoreError> for SpikeError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::MissingFile(path) => SpikeError::MissingFile(path),
            other => SpikeError::Core(other),
        }
    }
}

pub type Result<T> = std::result::Result<T, SpikeError>;

fn sender_id(value: f64) -> Result<UnitId> {
    if value.is_finite() && value >= 0.0 && value.fract() == 0.0 {
        Ok(value as UnitId)
    } else {
        Err(SpikeError::InvalidId(value))
    }
}

// ============================================================================
// SPIKE TABLES
// ============================================================================

/// Recorded spike events of one population, in file order
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SpikeTable {
    pub senders: Vec<UnitId>,
    pub times: Vec<Time>,
    /// Rows rewritten to local ids by [`SpikeTable::relabel`]; `None` for
    /// tables still holding raw ids
    pub relabelled: Option<Vec<bool>>,
}

impl SpikeTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, sender: UnitId, time: Time) {
        self.senders.push(sender);
        self.times.push(time);
        if let Some(mask) = &mut self.relabelled {
            mask.push(false);
        }
    }

    pub fn n_events(&self) -> usize {
        self.times.len()
    }

    pub fn is_empty(&self) -> bool {
        self.times.is_empty()
    }

    /// Load `senders times` rows. An empty file is a valid, empty table.
    pub fn load(path: &Path) -> Result<Self> {
        let table = read_dat(path)?;
        Self::from_matrix(&table, path)
    }

    fn from_matrix(table: &Array2<f64>, path: &Path) -> Result<Self> {
        if table.nrows() == 0 {
            return Ok(Self::new());
        }
        if table.ncols() != 2 {
            return Err(SpikeError::BadShape {
                path: path.to_path_buf(),
                expected: 2,
                got: table.ncols(),
            });
        }

        let mut data = Self::new();
        for row in table.rows() {
            data.record(sender_id(row[0])?, row[1]);
        }
        Ok(data)
    }

    /// Relabel senders listed in a remap column.
    ///
    /// Every record is looked up once against its original id, so a
    /// rewritten id is never matched again by a later entry of the column.
    /// Unlisted ids are left untouched.
    pub fn relabel(&mut self, remap: &RemapTable, population: usize) -> Result<usize> {
        if population >= remap.n_populations() {
            return Err(SpikeError::PopulationOutOfRange {
                index: population,
                available: remap.n_populations(),
            });
        }

        let n = self.senders.len();
        let mask = self.relabelled.get_or_insert_with(|| vec![false; n]);
        let mut relabelled = 0;
        for (sender, rewritten) in self.senders.iter_mut().zip(mask.iter_mut()) {
            if *rewritten {
                continue;
            }
            if let Some(local) = remap.local_id(population, *sender) {
                *sender = local;
                *rewritten = true;
                relabelled += 1;
            }
        }
        Ok(relabelled)
    }

    /// Group by sender, times sorted ascending.
    pub fn trains_by_sender(&self) -> HashMap<UnitId, Vec<Time>> {
        let mut trains: HashMap<UnitId, Vec<Time>> = HashMap::new();
        for (&time, &sender) in self.times.iter().zip(self.senders.iter()) {
            trains.entry(sender).or_default().push(time);
        }
        for train in trains.values_mut() {
            train.sort_by(|a, b| a.total_cmp(b));
        }
        trains
    }

    /// Per-unit spike trains of one population.
    ///
    /// Times are rounded to `decimals` and sorted. Senders outside the
    /// population's id range belong to other populations and are dropped.
    /// After a relabel only rewritten rows count: a raw id that happens to
    /// fall in the local range is still a non-selective sender.
    pub fn spike_trains(&self, layout: &PopulationLayout, decimals: u32) -> SpikeTrains {
        let mut trains = vec![Vec::new(); layout.size];
        let mut dropped = 0;

        for (row, (&time, &sender)) in self.times.iter().zip(self.senders.iter()).enumerate() {
            let local = match &self.relabelled {
                Some(mask) => mask[row],
                None => true,
            };
            match layout.local_index(sender).filter(|_| local) {
                Some(unit) => trains[unit].push(round_to(time, decimals)),
                None => dropped += 1,
            }
        }
        for train in &mut trains {
            train.sort_by(|a, b| a.total_cmp(b));
        }

        if dropped > 0 {
            warn!(
                population = layout.index,
                dropped, "spikes from senders outside the population were ignored"
            );
        }

        SpikeTrains { trains, dropped }
    }

    /// Contiguous block of `n_recorded` ids starting at the smallest sender.
    pub fn recorded_ids(&self, n_recorded: usize) -> Option<Range<UnitId>> {
        let first = *self.senders.iter().min()?;
        Some(first..first + n_recorded as UnitId)
    }

    /// Per-neuron firing rate (Hz) over the open window `(t_start, t_stop)`.
    pub fn firing_rates(&self, t_start: Time, t_stop: Time, ids: Range<UnitId>) -> Result<Vec<(UnitId, f64)>> {
        if !(t_stop > t_start) {
            return Err(SpikeError::InvalidWindow(t_start, t_stop));
        }

        let mut counts: HashMap<UnitId, usize> = HashMap::new();
        for (&time, &sender) in self.times.iter().zip(self.senders.iter()) {
            if time > t_start && time < t_stop {
                *counts.entry(sender).or_default() += 1;
            }
        }

        let duration = t_stop - t_start;
        Ok(ids
            .map(|id| {
                let n = counts.get(&id).copied().unwrap_or(0);
                (id, 1000.0 * n as f64 / duration)
            })
            .collect())
    }
}

/// Id layout of one selective population
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PopulationLayout {
    pub size: usize,
    pub index: usize,
    /// Id of the first neuron of population 0
    pub id_base: UnitId,
}

impl PopulationLayout {
    /// NEST node ids start at 1; relabelled overlap ids start at 0.
    pub fn for_dataset(size: usize, index: usize, overlap: bool) -> Self {
        Self {
            size,
            index,
            id_base: if overlap { 0 } else { 1 },
        }
    }

    pub fn first_id(&self) -> UnitId {
        self.id_base + (self.size * self.index) as UnitId
    }

    pub fn local_index(&self, id: UnitId) -> Option<usize> {
        let first = self.first_id();
        if id < first {
            return None;
        }
        let unit = (id - first) as usize;
        (unit < self.size).then_some(unit)
    }
}

/// Spike trains indexed by local unit
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SpikeTrains {
    pub trains: Vec<Vec<Time>>,
    /// Events whose sender fell outside the population
    pub dropped: usize,
}

impl SpikeTrains {
    pub fn from_trains(trains: Vec<Vec<Time>>) -> Self {
        Self { trains, dropped: 0 }
    }

    pub fn len(&self) -> usize {
        self.trains.len()
    }

    pub fn is_empty(&self) -> bool {
        self.trains.is_empty()
    }

    pub fn get(&self, unit: usize) -> Option<&[Time]> {
        self.trains.get(unit).map(|t| t.as_slice())
    }

    pub fn n_spikes(&self) -> usize {
        self.trains.iter().map(|t| t.len()).sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = &[Time]> {
        self.trains.iter().map(|t| t.as_slice())
    }
}

// ============================================================================
// OVERLAPPING POPULATIONS
// ============================================================================

/// Original ids of every selective population, one column per population
#[derive(Debug, Clone, PartialEq)]
pub struct RemapTable {
    /// Sorted ascending
    columns: Vec<Vec<UnitId>>,
    pop_size: usize,
}

impl RemapTable {
    /// `matrix` has shape units-per-population x populations. `id_offset`
    /// is added to every entry (1 when the file stores 0-based positions of
    /// NEST nodes).
    pub fn from_matrix(matrix: &Array2<f64>, id_offset: UnitId) -> Result<Self> {
        let mut columns = Vec::with_capacity(matrix.ncols());
        for (c, column) in matrix.columns().into_iter().enumerate() {
            let mut ids = column
                .iter()
                .map(|&v| sender_id(v).map(|id| id + id_offset))
                .collect::<Result<Vec<_>>>()?;
            ids.sort_unstable();
            if let Some(w) = ids.windows(2).find(|w| w[0] == w[1]) {
                return Err(SpikeError::DuplicateId { column: c, id: w[0] });
            }
            columns.push(ids);
        }

        Ok(Self {
            columns,
            pop_size: matrix.nrows(),
        })
    }

    pub fn load(path: &Path, id_offset: UnitId) -> Result<Self> {
        Self::from_matrix(&read_dat(path)?, id_offset)
    }

    pub fn n_populations(&self) -> usize {
        self.columns.len()
    }

    pub fn pop_size(&self) -> usize {
        self.pop_size
    }

    /// Rank of `original` within the sorted column of `population`.
    pub fn rank(&self, population: usize, original: UnitId) -> Option<usize> {
        self.columns.get(population)?.binary_search(&original).ok()
    }

    /// `rank + pop_size * population`, or `None` for unlisted ids.
    pub fn local_id(&self, population: usize, original: UnitId) -> Option<UnitId> {
        self.rank(population, original)
            .map(|rank| (rank + self.pop_size * population) as UnitId)
    }
}

/// Load `spikedata{i}.dat` for `p` populations.
///
/// With `overlap` set the tables carry global ids and are relabelled with
/// `selective_pop_ids.dat`.
pub fn load_populations(data_path: &Path, p: usize, overlap: bool) -> Result<Vec<SpikeTable>> {
    let mut tables = (0..p)
        .map(|i| SpikeTable::load(&data_path.join(format!("spikedata{}.dat", i))))
        .collect::<Result<Vec<_>>>()?;

    if overlap {
        let remap = RemapTable::load(&data_path.join("selective_pop_ids.dat"), 1)?;
        for (i, table) in tables.iter_mut().enumerate() {
            let n = table.relabel(&remap, i)?;
            debug!(population = i, relabelled = n, events = table.n_events(), "overlap remap");
        }
    }

    info!(populations = p, overlap, "spike tables loaded");
    Ok(tables)
}

// ============================================================================
// FIRING-RATE STATISTICS
// ============================================================================

/// Rate difference per neuron between two windows, matched by id.
pub fn rate_difference(a: &[(UnitId, f64)], b: &[(UnitId, f64)]) -> Vec<(UnitId, f64)> {
    let b: HashMap<UnitId, f64> = b.iter().copied().collect();
    a.iter()
        .filter_map(|&(id, rate)| b.get(&id).map(|other| (id, rate - other)))
        .collect()
}

/// Per-neuron rate in `delay` minus the rate in `baseline`.
///
/// Neurons are the `n_recorded` ids starting at the smallest sender, so
/// silent recorded neurons still contribute. Empty for an empty table.
pub fn rate_change(
    table: &SpikeTable,
    delay: (Time, Time),
    baseline: (Time, Time),
    n_recorded: usize,
) -> Result<Vec<(UnitId, f64)>> {
    let Some(ids) = table.recorded_ids(n_recorded) else {
        return Ok(Vec::new());
    };
    let during = table.firing_rates(delay.0, delay.1, ids.clone())?;
    let before = table.firing_rates(baseline.0, baseline.1, ids)?;
    Ok(rate_difference(&during, &before))
}

/// Mean firing rate (Hz) of a population over `duration` ms
pub fn mean_firing_rate(data: &SpikeTable, n_neurons: usize, duration: f64) -> f64 {
    if n_neurons == 0 || duration <= 0.0 {
        return 0.0;
    }
    (data.n_events() as f64) / (n_neurons as f64) / (duration / 1000.0)
}

/// Coefficient of variation of the inter-spike intervals
pub fn cv_isi(spike_train: &[f64]) -> f64 {
    if spike_train.len() < 2 {
        return 0.0;
    }

    let isis: Vec<f64> = spike_train.windows(2).map(|w| w[1] - w[0]).collect();

    let mean = isis.iter().sum::<f64>() / isis.len() as f64;
    let variance = isis.iter().map(|&x| (x - mean).powi(2)).sum::<f64>() / isis.len() as f64;

    variance.sqrt() / mean
}

/// Average CV of ISI over trains with more than two spikes.
///
/// Trains whose spikes collapse onto one timestamp have no defined CV and
/// are left out. `None` when no train qualifies.
pub fn mean_cv_isi<'a, I>(trains: I) -> Option<f64>
where
    I: IntoIterator<Item = &'a [Time]>,
{
    let cvs: Vec<f64> = trains
        .into_iter()
        .filter(|train| train.len() > 2)
        .map(cv_isi)
        .filter(|cv| cv.is_finite())
        .collect();
    if cvs.is_empty() {
        return None;
    }
    Some(cvs.iter().sum::<f64>() / cvs.len() as f64)
}

/// Population rate in fixed-width bins
#[derive(Debug, Clone, PartialEq)]
pub struct RateHistogram {
    pub bin_width: f64,  // ms
    pub rates: Array1<f64>,  // Hz per neuron
}

impl RateHistogram {
    /// Left edge of bin `i`
    pub fn bin_start(&self, i: usize) -> Time {
        i as f64 * self.bin_width
    }
}

/// Bin spike times from 0 up to the bin holding the latest spike and convert
/// counts to a per-neuron rate.
pub fn rate_histogram(times: &[Time], bin_width: f64, n_neurons: usize) -> RateHistogram {
    let t_max = times.iter().fold(0.0f64, |m, t| m.max(t.abs()));
    let n_bins = if times.is_empty() || bin_width <= 0.0 {
        0
    } else {
        (t_max / bin_width).floor() as usize + 1
    };

    let mut counts: Array1<f64> = Array1::zeros(n_bins);
    for &t in times {
        if t < 0.0 || n_bins == 0 {
            continue;
        }
        let bin = ((t / bin_width).floor() as usize).min(n_bins - 1);
        counts[bin] += 1.0;
    }

    let scale = if n_neurons == 0 {
        0.0
    } else {
        1.0 / (bin_width / 1000.0) / n_neurons as f64
    };

    RateHistogram {
        bin_width,
        rates: counts * scale,
    }
}

// ============================================================================
// TESTS
// ============================================================================
