//! # STP-RS: Short-Term Plasticity Reconstruction
//!
//! Rebuilds the Tsodyks-Markram synaptic state (available resources `x`,
//! utilization `u`) of every recorded unit from its spike train, maps each
//! trajectory onto a shared time grid and reduces the population to a mean
//! and standard deviation trace.
//!
//! Between spikes both variables relax analytically towards their resting
//! values; at a spike `u` is incremented first and `x` is depleted using the
//! incremented `u`. No differential equation is integrated.
//!
//! Key features:
//! - Event-driven, per-unit evolution (closed-form relaxation between events)
//! - Timestamp-based resampling onto a common grid
//! - Flat and two-level (synapse -> neuron -> population) aggregation
//! - Heterogeneous per-synapse parameters and snapshot-anchored traces
//! - Parallel population reconstruction (rayon) with a progress bar
//! - On-disk cache of aggregated traces, keyed on params and spike content

use indicatif::ProgressBar;
use ndarray::{s, Array1, Array2, Axis};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};
use wmstp_core::{
    read_dat_column, round_to, write_dat_column, CoreError, ParamSet, ResampleMode, StpConfig,
    Time, UnitId,
};
use wmstp_spikes::SpikeTrains;

#[derive(Error, Debug)]
pub enum StpError {
    #[error("Invalid time step: {0}")]
    InvalidStep(f64),
    #[error("Time step {dt} is not a multiple of 1e-{decimals}")]
    UnrepresentableStep { dt: f64, decimals: u32 },
    #[error("Empty window: [{t_start}, {t_stop})")]
    EmptyWindow { t_start: Time, t_stop: Time },
    #[error("No units to aggregate")]
    NoUnits,
    #[error("Trajectory has {len} samples, grid needs {required}")]
    TrajectoryTooShort { len: usize, required: usize },
    #[error("Trajectory starts at {first} ms, after grid start {grid_start} ms")]
    GridNotCovered { first: Time, grid_start: Time },
    #[error("Length mismatch: expected {expected}, got {got}")]
    LengthMismatch { expected: usize, got: usize },
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),
    #[error("Cache file not found: {0}")]
    MissingFile(PathBuf),
    #[error("CSV error: {0}")]
    CsvError(#[from] csv::Error),
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error(transparent)]
    Core(CoreError),
}

impl From<CoreError> for StpError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::MissingFile(path) => StpError::MissingFile(path),
            other => StpError::Core(other),
        }
    }
}

pub type Result<T> = std::result::Result<T, StpError>;

// ============================================================================
// MODEL
// ============================================================================

/// Tsodyks-Markram parameters of one synapse
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StpParams {
    pub u_base: f64,  // Baseline utilization U
    pub tau_d: f64,   // Recovery time constant (ms)
    pub tau_f: f64,   // Facilitation time constant (ms)
}

impl Default for StpParams {
    fn default() -> Self {
        Self {
            u_base: 0.19,
            tau_d: 200.0,
            tau_f: 1500.0,
        }
    }
}

impl From<&StpConfig> for StpParams {
    fn from(config: &StpConfig) -> Self {
        Self {
            u_base: config.u_base,
            tau_d: config.tau_d,
            tau_f: config.tau_f,
        }
    }
}

impl StpParams {
    pub fn validate(&self) -> Result<()> {
        if !(self.tau_d > 0.0) || !(self.tau_f > 0.0) {
            return Err(StpError::InvalidParameter(format!(
                "time constants must be positive (tau_D = {}, tau_F = {})",
                self.tau_d, self.tau_f
            )));
        }
        if !(0.0..=1.0).contains(&self.u_base) {
            return Err(StpError::InvalidParameter(format!(
                "U must lie in [0, 1], got {}",
                self.u_base
            )));
        }
        Ok(())
    }
}

/// Synaptic state at a given time
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StpState {
    pub x: f64,
    pub u: f64,
    pub t: Time,
}

impl StpState {
    pub fn new(x: f64, u: f64, t: Time) -> Self {
        Self { x, u, t }
    }

    /// Closed-form relaxation from `self.t` to `t`.
    pub fn relaxed(&self, params: &StpParams, t: Time) -> Self {
        let elapsed = t - self.t;
        Self {
            x: 1.0 + (self.x - 1.0) * (-elapsed / params.tau_d).exp(),
            u: params.u_base + (self.u - params.u_base) * (-elapsed / params.tau_f).exp(),
            t,
        }
    }

    /// Presynaptic spike at the current time: facilitate, then deplete.
    pub fn apply_spike(&mut self, params: &StpParams) {
        self.u += params.u_base * (1.0 - self.u);
        self.x -= self.u * self.x;
    }

    /// Relax to `t` and apply a spike there.
    pub fn on_spike(&self, params: &StpParams, t: Time) -> Self {
        let mut next = self.relaxed(params, t);
        next.apply_spike(params);
        next
    }
}

// ============================================================================
// TIME GRID
// ============================================================================

const GRID_TOLERANCE: f64 = 1e-6;

/// Uniform grid `t_start + k*dt` over `[t_start, t_stop)`, with times
/// rounded to `decimals` places
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimeGrid {
    pub t_start: Time,
    pub t_stop: Time,
    pub dt: f64,
    pub decimals: u32,
}

impl TimeGrid {
    pub fn new(t_start: Time, t_stop: Time, dt: f64, decimals: u32) -> Result<Self> {
        if !(dt > 0.0) || !dt.is_finite() {
            return Err(StpError::InvalidStep(dt));
        }
        // Grid times are rounded, so a finer step would repeat them
        let rounded = round_to(dt, decimals);
        if rounded == 0.0 || (rounded - dt).abs() > GRID_TOLERANCE * dt {
            return Err(StpError::UnrepresentableStep { dt, decimals });
        }
        let t_start = round_to(t_start, decimals);
        let t_stop = round_to(t_stop, decimals);
        if !(t_stop > t_start) {
            return Err(StpError::EmptyWindow { t_start, t_stop });
        }
        Ok(Self {
            t_start,
            t_stop,
            dt,
            decimals,
        })
    }

    /// Number of grid points in `[t_start, t_stop)`
    pub fn len(&self) -> usize {
        let steps = (self.t_stop - self.t_start) / self.dt;
        let nearest = steps.round();
        if (steps - nearest).abs() < GRID_TOLERANCE {
            nearest as usize
        } else {
            steps.ceil() as usize
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// k-th grid time, computed by index to avoid accumulated error
    pub fn time_at(&self, k: usize) -> Time {
        round_to(self.t_start + k as f64 * self.dt, self.decimals)
    }

    pub fn times(&self) -> Array1<f64> {
        Array1::from_iter((0..self.len()).map(|k| self.time_at(k)))
    }

    pub fn round(&self, t: Time) -> Time {
        round_to(t, self.decimals)
    }

    /// Index of the first grid point strictly after `t` (t >= t_start)
    fn first_index_after(&self, t: Time) -> usize {
        let pos = ((t - self.t_start) / self.dt).max(0.0);
        let nearest = pos.round();
        if (pos - nearest).abs() < GRID_TOLERANCE {
            nearest as usize + 1
        } else {
            pos.ceil() as usize
        }
    }
}

// ============================================================================
// TRAJECTORIES
// ============================================================================

/// Reconstructed (t, x, u) samples of one unit
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Trajectory {
    pub times: Vec<Time>,
    pub x: Vec<f64>,
    pub u: Vec<f64>,
}

impl Trajectory {
    pub fn with_capacity(n: usize) -> Self {
        Self {
            times: Vec::with_capacity(n),
            x: Vec::with_capacity(n),
            u: Vec::with_capacity(n),
        }
    }

    pub fn push(&mut self, state: &StpState) {
        self.times.push(state.t);
        self.x.push(state.x);
        self.u.push(state.u);
    }

    pub fn len(&self) -> usize {
        self.times.len()
    }

    pub fn is_empty(&self) -> bool {
        self.times.is_empty()
    }

    pub fn round_times(&mut self, decimals: u32) {
        for t in &mut self.times {
            *t = round_to(*t, decimals);
        }
    }

    /// Drop samples whose time equals the previous one, keeping the first.
    /// Returns the number of removed samples.
    pub fn dedup(&mut self) -> usize {
        if self.times.len() < 2 {
            return 0;
        }
        let mut write = 1;
        for read in 1..self.times.len() {
            if self.times[read] != self.times[write - 1] {
                self.times[write] = self.times[read];
                self.x[write] = self.x[read];
                self.u[write] = self.u[read];
                write += 1;
            }
        }
        let removed = self.times.len() - write;
        self.times.truncate(write);
        self.x.truncate(write);
        self.u.truncate(write);
        removed
    }

    pub fn is_strictly_increasing(&self) -> bool {
        self.times.windows(2).all(|w| w[0] < w[1])
    }
}

enum Event {
    Spike(Time),
    Anchor(StpState),
}

/// Emit `state` at its own time, then the relaxed state at every grid point
/// strictly inside `(state.t, until)`.
fn emit_segment(
    trajectory: &mut Trajectory,
    grid: &TimeGrid,
    params: &StpParams,
    state: &StpState,
    until: Time,
) {
    trajectory.push(state);
    let n = grid.len();
    let mut k = grid.first_index_after(state.t);
    while k < n {
        let t = grid.time_at(k);
        if t >= until {
            break;
        }
        trajectory.push(&state.relaxed(params, t));
        k += 1;
    }
}

fn evolve_events<I>(init: StpState, events: I, params: &StpParams, grid: &TimeGrid) -> Trajectory
where
    I: IntoIterator<Item = Event>,
{
    let mut trajectory = Trajectory::with_capacity(grid.len() + 2);
    let mut state = StpState::new(init.x, init.u, grid.t_start);

    for event in events {
        let t = match &event {
            Event::Spike(t) => grid.round(*t),
            Event::Anchor(anchor) => grid.round(anchor.t),
        };
        if t < grid.t_start {
            // An earlier anchor still fixes the state the window opens with
            if let Event::Anchor(anchor) = event {
                state = StpState::new(anchor.x, anchor.u, t).relaxed(params, grid.t_start);
            }
            continue;
        }
        if t > grid.t_stop || t < state.t {
            continue;
        }
        if t > state.t {
            emit_segment(&mut trajectory, grid, params, &state, t);
        }
        // Coincident events update the state but share one sample
        state = match event {
            Event::Spike(_) => state.on_spike(params, t),
            Event::Anchor(anchor) => StpState::new(anchor.x, anchor.u, t),
        };
    }

    if state.t < grid.t_stop {
        emit_segment(&mut trajectory, grid, params, &state, grid.t_stop);
        trajectory.push(&state.relaxed(params, grid.t_stop));
    } else {
        trajectory.push(&state);
    }

    trajectory.round_times(grid.decimals);
    let removed = trajectory.dedup();
    if removed > 0 {
        debug!(removed, "dropped duplicate trajectory samples");
    }
    trajectory
}

/// Reconstruct one unit over the grid window from its spike times.
///
/// Spike times are rounded to the grid precision; spikes outside
/// `[t_start, t_stop]` are ignored. The trajectory holds the state at the
/// window start, after every spike, at every grid point in between, and
/// the relaxed state at `t_stop`.
pub fn evolve_unit(
    spikes: &[Time],
    x0: f64,
    u0: f64,
    params: &StpParams,
    grid: &TimeGrid,
) -> Trajectory {
    let mut sorted = spikes.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    evolve_events(
        StpState::new(x0, u0, grid.t_start),
        sorted.into_iter().map(Event::Spike),
        params,
        grid,
    )
}

/// Reconstruct one unit from recorded state anchors instead of spikes.
/// Each anchor resets (x, u) at its time; the state relaxes in between.
pub fn evolve_from_anchors(
    init: StpState,
    anchors: &[StpState],
    params: &StpParams,
    grid: &TimeGrid,
) -> Trajectory {
    let mut sorted = anchors.to_vec();
    sorted.sort_by(|a, b| a.t.total_cmp(&b.t));
    evolve_events(init, sorted.into_iter().map(Event::Anchor), params, grid)
}

// ============================================================================
// RESAMPLING
// ============================================================================

/// Map a trajectory onto the grid.
///
/// `ByTimestamp` takes, for every grid time, the last sample at or before
/// it. `ByPosition` keeps the first `grid.len()` samples and is only
/// meaningful when every trajectory shares the grid's start and step.
pub fn resample(
    trajectory: &Trajectory,
    grid: &TimeGrid,
    mode: ResampleMode,
) -> Result<(Array1<f64>, Array1<f64>)> {
    let n = grid.len();
    match mode {
        ResampleMode::ByPosition => {
            if trajectory.len() < n {
                return Err(StpError::TrajectoryTooShort {
                    len: trajectory.len(),
                    required: n,
                });
            }
            Ok((
                Array1::from(trajectory.x[..n].to_vec()),
                Array1::from(trajectory.u[..n].to_vec()),
            ))
        }
        ResampleMode::ByTimestamp => {
            let first = *trajectory.times.first().ok_or(StpError::TrajectoryTooShort {
                len: 0,
                required: n,
            })?;
            let grid_start = grid.time_at(0);
            if first > grid_start {
                return Err(StpError::GridNotCovered { first, grid_start });
            }

            let mut x = Array1::zeros(n);
            let mut u = Array1::zeros(n);
            let mut j = 0;
            for k in 0..n {
                let t = grid.time_at(k);
                while j + 1 < trajectory.len() && trajectory.times[j + 1] <= t {
                    j += 1;
                }
                x[k] = trajectory.x[j];
                u[k] = trajectory.u[j];
            }
            Ok((x, u))
        }
    }
}

/// Resample every trajectory into (units x grid) matrices.
pub fn resample_all(
    trajectories: &[Trajectory],
    grid: &TimeGrid,
    mode: ResampleMode,
) -> Result<(Array2<f64>, Array2<f64>)> {
    let rows = trajectories
        .iter()
        .map(|trajectory| resample(trajectory, grid, mode))
        .collect::<Result<Vec<_>>>()?;
    stack_rows(rows, grid.len())
}

fn stack_rows(
    rows: Vec<(Array1<f64>, Array1<f64>)>,
    n: usize,
) -> Result<(Array2<f64>, Array2<f64>)> {
    let mut x = Array2::zeros((rows.len(), n));
    let mut u = Array2::zeros((rows.len(), n));
    for (i, (row_x, row_u)) in rows.into_iter().enumerate() {
        if row_x.len() != n || row_u.len() != n {
            return Err(StpError::LengthMismatch {
                expected: n,
                got: row_x.len().min(row_u.len()),
            });
        }
        x.row_mut(i).assign(&row_x);
        u.row_mut(i).assign(&row_u);
    }
    Ok((x, u))
}

// ============================================================================
// AGGREGATION
// ============================================================================

/// Traces of one unit kept alongside the population statistics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitSample {
    pub unit: usize,
    pub x: Array1<f64>,
    pub u: Array1<f64>,
}

/// Population mean and standard deviation (ddof = 0) on the grid
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Aggregate {
    pub times: Array1<f64>,
    pub mean_x: Array1<f64>,
    pub mean_u: Array1<f64>,
    pub std_x: Array1<f64>,
    pub std_u: Array1<f64>,
    pub sample: Option<UnitSample>,
}

impl Aggregate {
    pub fn len(&self) -> usize {
        self.times.len()
    }

    pub fn is_empty(&self) -> bool {
        self.times.is_empty()
    }
}

/// Reduce (units x grid) matrices to per-time mean and population std.
pub fn aggregate(
    times: Array1<f64>,
    x: &Array2<f64>,
    u: &Array2<f64>,
    sample: Option<usize>,
) -> Result<Aggregate> {
    if x.dim() != u.dim() {
        return Err(StpError::LengthMismatch {
            expected: x.len(),
            got: u.len(),
        });
    }
    if x.ncols() != times.len() {
        return Err(StpError::LengthMismatch {
            expected: times.len(),
            got: x.ncols(),
        });
    }
    if x.nrows() == 0 {
        return Err(StpError::NoUnits);
    }

    let sample = match sample {
        Some(unit) if unit >= x.nrows() => {
            return Err(StpError::InvalidParameter(format!(
                "sample unit {} out of range ({} units)",
                unit,
                x.nrows()
            )))
        }
        Some(unit) => Some(UnitSample {
            unit,
            x: x.row(unit).to_owned(),
            u: u.row(unit).to_owned(),
        }),
        None => None,
    };

    Ok(Aggregate {
        times,
        mean_x: x.mean_axis(Axis(0)).ok_or(StpError::NoUnits)?,
        mean_u: u.mean_axis(Axis(0)).ok_or(StpError::NoUnits)?,
        std_x: x.std_axis(Axis(0), 0.0),
        std_u: u.std_axis(Axis(0), 0.0),
        sample,
    })
}

/// Resampled traces of the synapses of one neuron (synapses x grid)
#[derive(Debug, Clone, PartialEq)]
pub struct SynapseGroup {
    pub x: Array2<f64>,
    pub u: Array2<f64>,
}

impl SynapseGroup {
    pub fn n_synapses(&self) -> usize {
        self.x.nrows()
    }

    /// Mean trace over the neuron's synapses
    pub fn neuron_mean(&self) -> Result<(Array1<f64>, Array1<f64>)> {
        let x = self.x.mean_axis(Axis(0)).ok_or(StpError::NoUnits)?;
        let u = self.u.mean_axis(Axis(0)).ok_or(StpError::NoUnits)?;
        Ok((x, u))
    }
}

/// Average synapses within each neuron first, then reduce across neurons.
/// Every neuron weighs the same regardless of its synapse count.
pub fn aggregate_two_level(
    times: Array1<f64>,
    groups: &[SynapseGroup],
    sample: Option<usize>,
) -> Result<Aggregate> {
    if groups.is_empty() {
        return Err(StpError::NoUnits);
    }
    let rows = groups
        .iter()
        .map(SynapseGroup::neuron_mean)
        .collect::<Result<Vec<_>>>()?;
    let (x, u) = stack_rows(rows, times.len())?;
    aggregate(times, &x, &u, sample)
}

// ============================================================================
// RECONSTRUCTION PIPELINES
// ============================================================================

/// Per-synapse parameters for heterogeneous reconstructions
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SynapseParams {
    pub source: UnitId,
    pub target: UnitId,
    pub stp: StpParams,
}

/// Settings shared by every unit of one reconstruction
#[derive(Debug, Clone, PartialEq)]
pub struct Reconstruction {
    pub grid: TimeGrid,
    pub params: StpParams,
    pub x0: f64,
    pub u0: f64,
    pub mode: ResampleMode,
    pub sample: Option<usize>,
}

impl Reconstruction {
    pub fn new(grid: TimeGrid, params: StpParams) -> Self {
        Self {
            grid,
            params,
            x0: 1.0,
            u0: params.u_base,
            mode: ResampleMode::ByTimestamp,
            sample: None,
        }
    }

    /// Window, step and model parameters from a resolved parameter set
    pub fn from_params(set: &ParamSet) -> Result<Self> {
        let (t_start, t_stop) = set.window();
        let grid = TimeGrid::new(t_start, t_stop, set.analysis.dt, set.analysis.decimals)?;
        let stp = &set.network.stp_params;
        let params = StpParams::from(stp);
        params.validate()?;
        Ok(Self {
            grid,
            params,
            x0: stp.x0,
            u0: stp.u0,
            mode: set.analysis.resample,
            sample: set.analysis.sample_unit,
        })
    }

    pub fn evolve(&self, spikes: &[Time]) -> Trajectory {
        evolve_unit(spikes, self.x0, self.u0, &self.params, &self.grid)
    }

    /// Evolve one unit with its own parameters and resample it.
    pub fn unit_traces(
        &self,
        spikes: &[Time],
        params: &StpParams,
    ) -> Result<(Array1<f64>, Array1<f64>)> {
        let trajectory = evolve_unit(spikes, self.x0, self.u0, params, &self.grid);
        resample(&trajectory, &self.grid, self.mode)
    }

    /// Mean and std of (x, u) over a population, one unit per spike train.
    pub fn population(&self, trains: &SpikeTrains, progress: &ProgressBar) -> Result<Aggregate> {
        if trains.is_empty() {
            return Err(StpError::NoUnits);
        }
        info!(
            units = trains.len(),
            spikes = trains.n_spikes(),
            points = self.grid.len(),
            "reconstructing population STP"
        );
        // Rows are written in place; no per-unit copy of the population
        let mut x = Array2::zeros((trains.len(), self.grid.len()));
        let mut u = Array2::zeros((trains.len(), self.grid.len()));
        x.axis_iter_mut(Axis(0))
            .into_par_iter()
            .zip(u.axis_iter_mut(Axis(0)).into_par_iter())
            .zip(trains.trains.par_iter())
            .try_for_each(|((mut row_x, mut row_u), spikes)| -> Result<()> {
                let (unit_x, unit_u) = self.unit_traces(spikes, &self.params)?;
                row_x.assign(&unit_x);
                row_u.assign(&unit_u);
                progress.inc(1);
                Ok(())
            })?;
        aggregate(self.grid.times(), &x, &u, self.sample)
    }

    /// Like [`Reconstruction::population`], served from `cache` when its
    /// key matches.
    pub fn population_cached(
        &self,
        npop: usize,
        trains: &SpikeTrains,
        cache: Option<&StpCache>,
        progress: &ProgressBar,
    ) -> Result<Aggregate> {
        let Some(cache) = cache else {
            return self.population(trains, progress);
        };
        let key = CacheKey::new(self, trains);
        if let Some(cached) = cache.load(npop, key)? {
            info!(population = npop, "using cached STP traces");
            return Ok(cached);
        }
        let result = self.population(trains, progress)?;
        cache.store(npop, key, &result)?;
        Ok(result)
    }

    /// Traces of every synapse of one neuron, each with its own parameters.
    pub fn synapse_group(&self, spikes: &[Time], synapses: &[SynapseParams]) -> Result<SynapseGroup> {
        let rows = synapses
            .iter()
            .map(|synapse| self.unit_traces(spikes, &synapse.stp))
            .collect::<Result<Vec<_>>>()?;
        let (x, u) = stack_rows(rows, self.grid.len())?;
        Ok(SynapseGroup { x, u })
    }

    /// Mean and std across the outgoing synapses of a single neuron.
    pub fn neuron_synapses(&self, spikes: &[Time], synapses: &[SynapseParams]) -> Result<Aggregate> {
        if synapses.is_empty() {
            return Err(StpError::NoUnits);
        }
        let group = self.synapse_group(spikes, synapses)?;
        aggregate(self.grid.times(), &group.x, &group.u, self.sample)
    }

    /// Two-level population average over heterogeneous synapses.
    ///
    /// Synapses are grouped by source neuron. With `targets = Some(k)` only
    /// the `k` synapses with the lowest target ids are kept per neuron.
    /// Neurons without recorded spikes still contribute their relaxation.
    pub fn population_synapses(
        &self,
        trains: &HashMap<UnitId, Vec<Time>>,
        synapses: &[SynapseParams],
        targets: Option<usize>,
        progress: &ProgressBar,
    ) -> Result<Aggregate> {
        let by_source = group_by_source(synapses, targets);
        if by_source.is_empty() {
            return Err(StpError::NoUnits);
        }
        info!(
            neurons = by_source.len(),
            synapses = by_source.iter().map(|(_, s)| s.len()).sum::<usize>(),
            "reconstructing synapse STP"
        );
        let groups = by_source
            .par_iter()
            .map(|(source, group)| {
                let spikes = trains.get(source).map(Vec::as_slice).unwrap_or(&[]);
                let result = self.synapse_group(spikes, group);
                progress.inc(1);
                result
            })
            .collect::<Result<Vec<_>>>()?;
        aggregate_two_level(self.grid.times(), &groups, self.sample)
    }
}

/// Group synapses per source in ascending source order, each group sorted
/// by target and truncated to `targets` entries.
pub fn group_by_source(
    synapses: &[SynapseParams],
    targets: Option<usize>,
) -> Vec<(UnitId, Vec<SynapseParams>)> {
    let mut grouped: BTreeMap<UnitId, Vec<SynapseParams>> = BTreeMap::new();
    for synapse in synapses {
        grouped.entry(synapse.source).or_default().push(*synapse);
    }
    grouped
        .into_iter()
        .map(|(source, mut group)| {
            group.sort_by_key(|s| s.target);
            if let Some(k) = targets {
                group.truncate(k);
            }
            (source, group)
        })
        .filter(|(_, group)| !group.is_empty())
        .collect()
}

/// Row of a synapse parameter table; extra columns are ignored
#[derive(Debug, Deserialize)]
struct SynapseRow {
    source: UnitId,
    target: UnitId,
    #[serde(rename = "tau_F", default)]
    tau_f: Option<f64>,
    #[serde(rename = "tau_D", default)]
    tau_d: Option<f64>,
    #[serde(rename = "U", default)]
    u_base: Option<f64>,
}

/// Read distinct synapses from a CSV with `source` and `target` columns
/// and optional `tau_F`, `tau_D` and `U`. Missing values take `defaults`.
pub fn load_synapse_params(path: &Path, defaults: &StpParams) -> Result<Vec<SynapseParams>> {
    if !path.exists() {
        return Err(StpError::MissingFile(path.to_path_buf()));
    }
    let mut reader = csv::Reader::from_path(path)?;
    let mut seen: BTreeMap<(UnitId, UnitId), SynapseParams> = BTreeMap::new();
    for row in reader.deserialize() {
        let row: SynapseRow = row?;
        let stp = StpParams {
            u_base: row.u_base.unwrap_or(defaults.u_base),
            tau_d: row.tau_d.unwrap_or(defaults.tau_d),
            tau_f: row.tau_f.unwrap_or(defaults.tau_f),
        };
        stp.validate()?;
        seen.entry((row.source, row.target)).or_insert(SynapseParams {
            source: row.source,
            target: row.target,
            stp,
        });
    }
    Ok(seen.into_values().collect())
}

// ============================================================================
// SYNAPSE SNAPSHOTS
// ============================================================================

/// One row of a periodic synapse-state recording
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SynapseSnapshot {
    pub time: Time,
    pub source: UnitId,
    pub target: UnitId,
    pub x: f64,
    pub u: f64,
    #[serde(default)]
    pub t_last_spike: Option<Time>,
    #[serde(rename = "tau_F", default)]
    pub tau_f: Option<f64>,
    #[serde(rename = "tau_D", default)]
    pub tau_d: Option<f64>,
    #[serde(rename = "U", default)]
    pub u_base: Option<f64>,
}

/// Periodic (time, source, target, x, u, ...) synapse recordings
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SnapshotTable {
    pub rows: Vec<SynapseSnapshot>,
}

impl SnapshotTable {
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(StpError::MissingFile(path.to_path_buf()));
        }
        let mut reader = csv::Reader::from_path(path)?;
        let rows = reader
            .deserialize()
            .collect::<std::result::Result<Vec<SynapseSnapshot>, _>>()?;
        debug!(path = %path.display(), rows = rows.len(), "loaded synapse snapshots");
        Ok(Self { rows })
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Distinct synapses with their parameters; missing columns fall back
    /// to `defaults`.
    pub fn synapse_params(&self, defaults: &StpParams) -> Vec<SynapseParams> {
        let mut seen: BTreeMap<(UnitId, UnitId), SynapseParams> = BTreeMap::new();
        for row in &self.rows {
            seen.entry((row.source, row.target)).or_insert(SynapseParams {
                source: row.source,
                target: row.target,
                stp: StpParams {
                    u_base: row.u_base.unwrap_or(defaults.u_base),
                    tau_d: row.tau_d.unwrap_or(defaults.tau_d),
                    tau_f: row.tau_f.unwrap_or(defaults.tau_f),
                },
            });
        }
        seen.into_values().collect()
    }

    /// State anchors per synapse, in time order.
    ///
    /// An anchor is taken wherever (x, u) differs from the previous
    /// snapshot (or from the initial state), placed at the last spike time
    /// when recorded and at the snapshot time otherwise.
    pub fn anchors(&self, x0: f64, u0: f64) -> BTreeMap<(UnitId, UnitId), Vec<StpState>> {
        let mut by_synapse: BTreeMap<(UnitId, UnitId), Vec<&SynapseSnapshot>> = BTreeMap::new();
        for row in &self.rows {
            by_synapse.entry((row.source, row.target)).or_default().push(row);
        }

        by_synapse
            .into_iter()
            .map(|(key, mut rows)| {
                rows.sort_by(|a, b| a.time.total_cmp(&b.time));
                let mut anchors: Vec<StpState> = Vec::new();
                let (mut x, mut u) = (x0, u0);
                for row in rows {
                    if row.x != x || row.u != u {
                        let t = row.t_last_spike.unwrap_or(row.time);
                        let t = anchors.last().map_or(t, |prev| t.max(prev.t));
                        anchors.push(StpState::new(row.x, row.u, t));
                        x = row.x;
                        u = row.u;
                    }
                }
                (key, anchors)
            })
            .collect()
    }
}

impl Reconstruction {
    /// Population traces rebuilt from recorded synapse states rather than
    /// spikes.
    pub fn snapshot_population(&self, table: &SnapshotTable) -> Result<Aggregate> {
        let params: HashMap<(UnitId, UnitId), StpParams> = table
            .synapse_params(&self.params)
            .into_iter()
            .map(|s| ((s.source, s.target), s.stp))
            .collect();
        let init = StpState::new(self.x0, self.u0, self.grid.t_start);

        let rows = table
            .anchors(self.x0, self.u0)
            .into_iter()
            .map(|(key, anchors)| {
                let stp = params.get(&key).copied().unwrap_or(self.params);
                let trajectory = evolve_from_anchors(init, &anchors, &stp, &self.grid);
                resample(&trajectory, &self.grid, self.mode)
            })
            .collect::<Result<Vec<_>>>()?;
        if rows.is_empty() {
            return Err(StpError::NoUnits);
        }
        let (x, u) = stack_rows(rows, self.grid.len())?;
        aggregate(self.grid.times(), &x, &u, self.sample)
    }
}

// ============================================================================
// CACHE
// ============================================================================

/// Hash of everything an aggregate depends on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CacheKey(pub u64);

impl CacheKey {
    pub fn new(reconstruction: &Reconstruction, trains: &SpikeTrains) -> Self {
        let mut hasher = DefaultHasher::new();
        let grid = &reconstruction.grid;
        for value in [
            grid.t_start,
            grid.t_stop,
            grid.dt,
            reconstruction.params.u_base,
            reconstruction.params.tau_d,
            reconstruction.params.tau_f,
            reconstruction.x0,
            reconstruction.u0,
        ] {
            value.to_bits().hash(&mut hasher);
        }
        grid.decimals.hash(&mut hasher);
        reconstruction.mode.hash(&mut hasher);
        reconstruction.sample.hash(&mut hasher);
        trains.len().hash(&mut hasher);
        for train in trains.iter() {
            train.len().hash(&mut hasher);
            for t in train {
                t.to_bits().hash(&mut hasher);
            }
        }
        Self(hasher.finish())
    }

    pub fn to_hex(&self) -> String {
        format!("{:016x}", self.0)
    }
}

#[derive(Serialize)]
struct AggregateRow {
    time: f64,
    mean_x: f64,
    mean_u: f64,
    std_x: f64,
    std_u: f64,
}

const SAMPLE_STEMS: [&str; 3] = ["stp_sample_unit", "stp_sample_x", "stp_sample_u"];

/// Aggregated traces stored per population under a cache directory
#[derive(Debug, Clone)]
pub struct StpCache {
    dir: PathBuf,
}

impl StpCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// `<data_path>/stp_params`
    pub fn for_dataset(data_path: &Path) -> Self {
        Self::new(data_path.join("stp_params"))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, stem: &str, npop: usize) -> PathBuf {
        self.dir.join(format!("{}_{}.dat", stem, npop))
    }

    fn key_path(&self, npop: usize) -> PathBuf {
        self.path("stp_key", npop)
    }

    pub fn csv_path(&self, npop: usize) -> PathBuf {
        self.dir.join(format!("stp_aggregate_{}.csv", npop))
    }

    /// Cached aggregate for `npop`, or `None` when absent or stale.
    pub fn load(&self, npop: usize, key: CacheKey) -> Result<Option<Aggregate>> {
        let key_path = self.key_path(npop);
        if !key_path.exists() {
            if self.path("std_x_avg", npop).exists() {
                warn!(population = npop, "cached STP traces have no key, recomputing");
            }
            return Ok(None);
        }
        let stored = fs::read_to_string(&key_path)?;
        if stored.trim() != key.to_hex() {
            warn!(population = npop, "stale STP cache, recomputing");
            return Ok(None);
        }

        let times = read_dat_column(&self.path("stp_time", npop))?;
        let mean_x = read_dat_column(&self.path("std_x_avg", npop))?;
        let mean_u = read_dat_column(&self.path("std_u_avg", npop))?;
        let std_x = read_dat_column(&self.path("std_x_std", npop))?;
        let std_u = read_dat_column(&self.path("std_u_std", npop))?;
        let sample = self.load_sample(npop)?;
        let sample_columns = sample.iter().flat_map(|s| [&s.x, &s.u]);
        for column in [&mean_x, &mean_u, &std_x, &std_u].into_iter().chain(sample_columns) {
            if column.len() != times.len() {
                return Err(StpError::LengthMismatch {
                    expected: times.len(),
                    got: column.len(),
                });
            }
        }
        Ok(Some(Aggregate {
            times,
            mean_x,
            mean_u,
            std_x,
            std_u,
            sample,
        }))
    }

    fn load_sample(&self, npop: usize) -> Result<Option<UnitSample>> {
        let unit_path = self.path("stp_sample_unit", npop);
        if !unit_path.exists() {
            return Ok(None);
        }
        let unit = read_dat_column(&unit_path)?;
        let Some(&unit) = unit.first() else {
            return Err(StpError::LengthMismatch { expected: 1, got: 0 });
        };
        Ok(Some(UnitSample {
            unit: unit as usize,
            x: read_dat_column(&self.path("stp_sample_x", npop))?,
            u: read_dat_column(&self.path("stp_sample_u", npop))?,
        }))
    }

    pub fn store(&self, npop: usize, key: CacheKey, result: &Aggregate) -> Result<()> {
        fs::create_dir_all(&self.dir)?;
        write_dat_column(&self.path("stp_time", npop), &result.times)?;
        write_dat_column(&self.path("std_x_avg", npop), &result.mean_x)?;
        write_dat_column(&self.path("std_u_avg", npop), &result.mean_u)?;
        write_dat_column(&self.path("std_x_std", npop), &result.std_x)?;
        write_dat_column(&self.path("std_u_std", npop), &result.std_u)?;
        match &result.sample {
            Some(sample) => {
                let unit = Array1::from(vec![sample.unit as f64]);
                write_dat_column(&self.path("stp_sample_unit", npop), &unit)?;
                write_dat_column(&self.path("stp_sample_x", npop), &sample.x)?;
                write_dat_column(&self.path("stp_sample_u", npop), &sample.u)?;
            }
            None => self.remove(&SAMPLE_STEMS, npop)?,
        }
        write_aggregate_csv(&self.csv_path(npop), result)?;
        fs::write(self.key_path(npop), key.to_hex())?;
        debug!(population = npop, dir = %self.dir.display(), "stored STP cache");
        Ok(())
    }

    /// Remove every cached file of `npop`.
    pub fn clear(&self, npop: usize) -> Result<()> {
        let stems = ["stp_time", "std_x_avg", "std_u_avg", "std_x_std", "std_u_std", "stp_key"];
        self.remove(&stems, npop)?;
        self.remove(&SAMPLE_STEMS, npop)?;
        let csv = self.csv_path(npop);
        if csv.exists() {
            fs::remove_file(csv)?;
        }
        Ok(())
    }

    fn remove(&self, stems: &[&str], npop: usize) -> Result<()> {
        for stem in stems {
            let path = self.path(stem, npop);
            if path.exists() {
                fs::remove_file(path)?;
            }
        }
        Ok(())
    }
}

/// Write an aggregate as `time,mean_x,mean_u,std_x,std_u` rows.
pub fn write_aggregate_csv(path: &Path, result: &Aggregate) -> Result<()> {
    let mut writer = csv::Writer::from_path(path)?;
    for i in 0..result.len() {
        writer.serialize(AggregateRow {
            time: result.times[i],
            mean_x: result.mean_x[i],
            mean_u: result.mean_u[i],
            std_x: result.std_x[i],
            std_u: result.std_u[i],
        })?;
    }
    writer.flush()?;
    Ok(())
}

/// Values of an aggregate in a time sub-window, e.g. for plotting.
pub fn window_slice(result: &Aggregate, t_start: Time, t_stop: Time) -> Aggregate {
    let lo = result.times.iter().position(|&t| t >= t_start).unwrap_or(result.len());
    let hi = result.times.iter().position(|&t| t >= t_stop).unwrap_or(result.len()).max(lo);
    Aggregate {
        times: result.times.slice(s![lo..hi]).to_owned(),
        mean_x: result.mean_x.slice(s![lo..hi]).to_owned(),
        mean_u: result.mean_u.slice(s![lo..hi]).to_owned(),
        std_x: result.std_x.slice(s![lo..hi]).to_owned(),
        std_u: result.std_u.slice(s![lo..hi]).to_owned(),
        sample: result.sample.as_ref().map(|sample| UnitSample {
            unit: sample.unit,
            x: sample.x.slice(s![lo..hi]).to_owned(),
            u: sample.u.slice(s![lo..hi]).to_owned(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    const TOL: f64 = 1e-12;

    fn params() -> StpParams {
        StpParams {
            u_base: 0.2,
            tau_d: 200.0,
            tau_f: 1500.0,
        }
    }

    fn close(a: f64, b: f64, tol: f64) -> bool {
        (a - b).abs() < tol
    }

    #[test]
    fn test_relaxation_without_spikes() {
        let p = params();
        let grid = TimeGrid::new(0.0, 1000.0, 10.0, 1).unwrap();
        let traj = evolve_unit(&[], 0.3, 0.7, &p, &grid);

        assert_eq!(traj.len(), grid.len() + 1);
        for (i, &t) in traj.times.iter().enumerate() {
            let x = 1.0 + (0.3 - 1.0) * (-t / p.tau_d).exp();
            let u = p.u_base + (0.7 - p.u_base) * (-t / p.tau_f).exp();
            assert!(close(traj.x[i], x, TOL), "x at {}", t);
            assert!(close(traj.u[i], u, TOL), "u at {}", t);
        }
    }

    #[test]
    fn test_jump_order() {
        let p = params();
        let mut state = StpState::new(0.5, 0.3, 0.0);
        state.apply_spike(&p);
        assert!(close(state.u, 0.44, TOL));
        // Depletion uses the facilitated u
        assert!(close(state.x, 0.5 - 0.44 * 0.5, TOL));
    }

    #[test]
    fn test_times_strictly_increasing() {
        let p = params();
        let grid = TimeGrid::new(0.0, 10.0, 0.1, 1).unwrap();
        let spikes = [0.0, 5.04, 5.06, 5.1, 7.33, 10.0];
        let traj = evolve_unit(&spikes, 1.0, 0.2, &p, &grid);

        assert!(traj.is_strictly_increasing());
        assert_eq!(traj.times.first(), Some(&0.0));
        assert_eq!(traj.times.last(), Some(&10.0));
        assert_eq!(traj.times.iter().filter(|&&t| t == 0.0).count(), 1);
        assert_eq!(traj.times.iter().filter(|&&t| t == 10.0).count(), 1);
    }

    #[test]
    fn test_boundary_spikes_counted_once() {
        let p = params();
        let grid = TimeGrid::new(0.0, 400.0, 100.0, 1).unwrap();
        let traj = evolve_unit(&[0.0, 400.0], 1.0, 0.2, &p, &grid);

        assert_eq!(traj.times, vec![0.0, 100.0, 200.0, 300.0, 400.0]);
        // Post-jump state at the window start
        assert!(close(traj.u[0], 0.36, TOL));
        assert!(close(traj.x[0], 0.64, TOL));
    }

    #[test]
    fn test_coincident_spikes_share_a_sample() {
        let p = params();
        let grid = TimeGrid::new(0.0, 400.0, 100.0, 1).unwrap();
        let traj = evolve_unit(&[150.0, 150.0], 1.0, 0.2, &p, &grid);

        assert_eq!(traj.times, vec![0.0, 100.0, 150.0, 200.0, 300.0, 400.0]);
        let mut expected = StpState::new(1.0, 0.2, 0.0).on_spike(&p, 150.0);
        expected.apply_spike(&p);
        assert!(close(traj.x[2], expected.x, TOL));
        assert!(close(traj.u[2], expected.u, TOL));
    }

    #[test]
    fn test_spikes_outside_window_ignored() {
        let p = params();
        let grid = TimeGrid::new(100.0, 300.0, 50.0, 1).unwrap();
        let with_outside = evolve_unit(&[20.0, 150.0, 900.0], 1.0, 0.2, &p, &grid);
        let inside_only = evolve_unit(&[150.0], 1.0, 0.2, &p, &grid);
        assert_eq!(with_outside, inside_only);
    }

    #[test]
    fn test_dedup_keeps_first() {
        let mut traj = Trajectory {
            times: vec![0.0, 1.0, 1.0, 2.0, 2.0, 2.0],
            x: vec![0.0, 1.0, 2.0, 3.0, 4.0, 5.0],
            u: vec![0.0, 0.1, 0.2, 0.3, 0.4, 0.5],
        };
        assert_eq!(traj.dedup(), 3);
        assert_eq!(traj.times, vec![0.0, 1.0, 2.0]);
        assert_eq!(traj.x, vec![0.0, 1.0, 3.0]);
        assert_eq!(traj.u, vec![0.0, 0.1, 0.3]);
    }

    #[test]
    fn test_grid() {
        let grid = TimeGrid::new(0.0, 6000.0, 0.1, 1).unwrap();
        assert_eq!(grid.len(), 60000);
        assert_eq!(grid.time_at(3), 0.3);
        assert_eq!(grid.time_at(59999), 5999.9);

        assert!(matches!(
            TimeGrid::new(0.0, 10.0, 0.0, 1),
            Err(StpError::InvalidStep(_))
        ));
        assert!(matches!(
            TimeGrid::new(10.0, 10.0, 0.1, 1),
            Err(StpError::EmptyWindow { .. })
        ));
    }

    #[test]
    fn test_grid_rejects_step_finer_than_precision() {
        assert!(matches!(
            TimeGrid::new(0.0, 1.0, 0.05, 1),
            Err(StpError::UnrepresentableStep { decimals: 1, .. })
        ));
        assert!(matches!(
            TimeGrid::new(0.0, 1.0, 0.15, 1),
            Err(StpError::UnrepresentableStep { .. })
        ));

        let grid = TimeGrid::new(0.0, 1.0, 0.05, 2).unwrap();
        let times = grid.times().to_vec();
        assert_eq!(times.len(), 20);
        assert!(times.windows(2).all(|w| w[1] > w[0]));
        assert_eq!(times[19], 0.95);
    }

    #[test]
    fn test_reference_scenario() {
        let p = params();
        let grid = TimeGrid::new(0.0, 400.0, 100.0, 1).unwrap();
        let traj = evolve_unit(&[100.0, 300.0], 1.0, 0.2, &p, &grid);
        let (x, u) = resample(&traj, &grid, ResampleMode::ByTimestamp).unwrap();

        // Hand-computed
        let u_100 = 0.2 + 0.2 * 0.8;
        let x_100 = 1.0 - u_100;
        let x_200 = 1.0 + (x_100 - 1.0) * (-0.5f64).exp();
        let u_200 = 0.2 + (u_100 - 0.2) * (-100.0f64 / 1500.0).exp();
        let x_300_pre = 1.0 + (x_100 - 1.0) * (-1.0f64).exp();
        let u_300_pre = 0.2 + (u_100 - 0.2) * (-200.0f64 / 1500.0).exp();
        let u_300 = u_300_pre + 0.2 * (1.0 - u_300_pre);
        let x_300 = x_300_pre - u_300 * x_300_pre;

        let expected_x = [1.0, x_100, x_200, x_300];
        let expected_u = [0.2, u_100, u_200, u_300];
        for k in 0..4 {
            assert!(close(x[k], expected_x[k], 1e-6), "x[{}]", k);
            assert!(close(u[k], expected_u[k], 1e-6), "u[{}]", k);
        }

        let x_400 = 1.0 + (x_300 - 1.0) * (-0.5f64).exp();
        assert!(close(*traj.x.last().unwrap(), x_400, 1e-6));
    }

    #[test]
    fn test_resample_off_grid_spike() {
        let p = params();
        let grid = TimeGrid::new(0.0, 400.0, 100.0, 1).unwrap();
        let traj = evolve_unit(&[150.0], 1.0, 0.2, &p, &grid);
        assert_eq!(traj.len(), 6);

        let (x, _) = resample(&traj, &grid, ResampleMode::ByTimestamp).unwrap();
        let after = StpState::new(1.0, 0.2, 0.0).on_spike(&p, 150.0);
        assert!(close(x[1], 1.0, TOL));
        assert!(close(x[2], after.relaxed(&p, 200.0).x, TOL));

        // Position-based sampling picks the spike sample instead of t = 200
        let (x_pos, _) = resample(&traj, &grid, ResampleMode::ByPosition).unwrap();
        assert!(close(x_pos[2], after.x, TOL));
    }

    #[test]
    fn test_resample_errors() {
        let grid = TimeGrid::new(0.0, 400.0, 100.0, 1).unwrap();
        let short = Trajectory {
            times: vec![0.0, 100.0],
            x: vec![1.0, 1.0],
            u: vec![0.2, 0.2],
        };
        assert!(matches!(
            resample(&short, &grid, ResampleMode::ByPosition),
            Err(StpError::TrajectoryTooShort { len: 2, required: 4 })
        ));

        let late = Trajectory {
            times: vec![50.0, 100.0],
            x: vec![1.0, 1.0],
            u: vec![0.2, 0.2],
        };
        assert!(matches!(
            resample(&late, &grid, ResampleMode::ByTimestamp),
            Err(StpError::GridNotCovered { .. })
        ));
    }

    #[test]
    fn test_grid_length_invariant() {
        let p = params();
        let grid = TimeGrid::new(0.0, 1000.0, 1.0, 1).unwrap();
        let trains = SpikeTrains::from_trains(vec![
            vec![],
            vec![10.55, 20.0],
            vec![1.0, 2.0, 3.0, 500.25, 999.99],
        ]);
        let mut recon = Reconstruction::new(grid, p);
        recon.sample = Some(2);
        let result = recon.population(&trains, &ProgressBar::hidden()).unwrap();
        assert_eq!(result.len(), grid.len());
        assert_eq!(result.mean_x.len(), grid.len());
        assert_eq!(result.std_u.len(), grid.len());

        // Rows filled in parallel stay in unit order
        let (x, u) = recon.unit_traces(trains.get(2).unwrap(), &p).unwrap();
        let sample = result.sample.unwrap();
        assert_eq!(sample.x, x);
        assert_eq!(sample.u, u);
    }

    #[test]
    fn test_aggregate_population_std() {
        let times = Array1::from(vec![0.0, 1.0]);
        let x = Array2::from_shape_vec((2, 2), vec![0.0, 1.0, 2.0, 1.0]).unwrap();
        let u = x.clone();
        let result = aggregate(times, &x, &u, Some(1)).unwrap();
        assert_eq!(result.mean_x.to_vec(), vec![1.0, 1.0]);
        assert_eq!(result.std_x.to_vec(), vec![1.0, 0.0]);
        assert_eq!(result.sample.unwrap().x.to_vec(), vec![2.0, 1.0]);
    }

    #[test]
    fn test_no_units() {
        let times = Array1::from(vec![0.0, 1.0]);
        let empty = Array2::<f64>::zeros((0, 2));
        assert!(matches!(
            aggregate(times.clone(), &empty, &empty, None),
            Err(StpError::NoUnits)
        ));
        assert!(matches!(
            aggregate_two_level(times, &[], None),
            Err(StpError::NoUnits)
        ));

        let grid = TimeGrid::new(0.0, 10.0, 1.0, 1).unwrap();
        let recon = Reconstruction::new(grid, params());
        assert!(matches!(
            recon.population(&SpikeTrains::default(), &ProgressBar::hidden()),
            Err(StpError::NoUnits)
        ));
    }

    #[test]
    fn test_two_level_weighting() {
        let times = Array1::from(vec![0.0, 1.0, 2.0]);
        let a = SynapseGroup {
            x: Array2::from_elem((1, 3), 1.0),
            u: Array2::from_elem((1, 3), 1.0),
        };
        let b = SynapseGroup {
            x: Array2::zeros((3, 3)),
            u: Array2::zeros((3, 3)),
        };

        let two_level = aggregate_two_level(times.clone(), &[a.clone(), b.clone()], None).unwrap();
        assert!(two_level.mean_x.iter().all(|&v| close(v, 0.5, TOL)));

        let flat_x = ndarray::concatenate(Axis(0), &[a.x.view(), b.x.view()]).unwrap();
        let flat = aggregate(times, &flat_x, &flat_x, None).unwrap();
        assert!(flat.mean_x.iter().all(|&v| close(v, 0.25, TOL)));
    }

    #[test]
    fn test_heterogeneous_synapses() {
        let grid = TimeGrid::new(0.0, 500.0, 10.0, 1).unwrap();
        let recon = Reconstruction::new(grid, params());
        let fast = StpParams { tau_d: 50.0, ..params() };
        let synapses = vec![
            SynapseParams { source: 1, target: 9, stp: fast },
            SynapseParams { source: 1, target: 4, stp: params() },
            SynapseParams { source: 2, target: 5, stp: params() },
        ];

        let group = recon.synapse_group(&[100.0], &synapses[..2]).unwrap();
        assert_eq!(group.n_synapses(), 2);
        // Faster recovery brings x back up sooner
        assert!(group.x[[0, 20]] > group.x[[1, 20]]);

        let grouped = group_by_source(&synapses, Some(1));
        assert_eq!(grouped.len(), 2);
        assert_eq!(grouped[0].1.len(), 1);
        assert_eq!(grouped[0].1[0].target, 4);

        let mut trains = HashMap::new();
        trains.insert(1, vec![100.0]);
        let result = recon
            .population_synapses(&trains, &synapses, Some(1), &ProgressBar::hidden())
            .unwrap();
        assert_eq!(result.len(), grid.len());
        // Source 2 never spikes and stays at rest
        let single = recon.neuron_synapses(&[100.0], &synapses[1..2]).unwrap();
        let k = 20;
        assert!(close(result.mean_x[k], (single.mean_x[k] + 1.0) / 2.0, TOL));
    }

    #[test]
    fn test_snapshot_anchors() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("stp_0.csv");
        let mut file = fs::File::create(&path).unwrap();
        writeln!(file, "time,source,target,x,u,t_last_spike").unwrap();
        writeln!(file, "50,1,7,1.0,0.2,").unwrap();
        writeln!(file, "150,1,7,0.64,0.36,100").unwrap();
        writeln!(file, "250,1,7,0.64,0.36,100").unwrap();
        writeln!(file, "50,2,8,1.0,0.2,").unwrap();
        drop(file);

        let table = SnapshotTable::load(&path).unwrap();
        assert_eq!(table.len(), 4);
        let anchors = table.anchors(1.0, 0.2);
        assert_eq!(anchors[&(1, 7)], vec![StpState::new(0.64, 0.36, 100.0)]);
        assert!(anchors[&(2, 8)].is_empty());

        let synapses = table.synapse_params(&params());
        assert_eq!(synapses.len(), 2);
        assert_eq!(synapses[0].stp, params());

        // Anchored trace matches the spike-driven one for the same event
        let grid = TimeGrid::new(0.0, 400.0, 100.0, 1).unwrap();
        let mut recon = Reconstruction::new(grid, params());
        recon.u0 = 0.2;
        let from_anchors = recon.snapshot_population(&table).unwrap();
        let spiking = recon.evolve(&[100.0]);
        let (x, _) = resample(&spiking, &grid, ResampleMode::ByTimestamp).unwrap();
        for k in 0..grid.len() {
            assert!(close(from_anchors.mean_x[k], (x[k] + 1.0) / 2.0, 1e-9));
        }
    }

    #[test]
    fn test_load_synapse_params() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("synapses.csv");
        fs::write(
            &path,
            "source,target,tau_F,tau_D,U\n3,12,1200,150,0.25\n3,10,,,\n3,12,1,1,0.5\n",
        )
        .unwrap();

        let synapses = load_synapse_params(&path, &params()).unwrap();
        assert_eq!(synapses.len(), 2);
        assert_eq!(synapses[0].target, 10);
        assert_eq!(synapses[0].stp, params());
        assert_eq!(
            synapses[1].stp,
            StpParams { u_base: 0.25, tau_d: 150.0, tau_f: 1200.0 }
        );

        fs::write(&path, "source,target,tau_D\n1,2,0\n").unwrap();
        assert!(matches!(
            load_synapse_params(&path, &params()),
            Err(StpError::InvalidParameter(_))
        ));
    }

    #[test]
    fn test_anchor_before_window() {
        let p = params();
        let grid = TimeGrid::new(100.0, 300.0, 100.0, 1).unwrap();
        let anchor = StpState::new(0.5, 0.4, 50.0);
        let init = StpState::new(1.0, 0.2, 100.0);
        let traj = evolve_from_anchors(init, &[anchor], &p, &grid);

        let opened = anchor.relaxed(&p, 100.0);
        assert_eq!(traj.times, vec![100.0, 200.0, 300.0]);
        assert!(close(traj.x[0], opened.x, TOL));
        assert!(close(traj.u[2], anchor.relaxed(&p, 300.0).u, TOL));
    }

    #[test]
    fn test_snapshot_missing_file() {
        let dir = TempDir::new().unwrap();
        assert!(matches!(
            SnapshotTable::load(&dir.path().join("none.csv")),
            Err(StpError::MissingFile(_))
        ));
    }

    #[test]
    fn test_cache_invalidation() {
        let dir = TempDir::new().unwrap();
        let cache = StpCache::for_dataset(dir.path());
        let grid = TimeGrid::new(0.0, 100.0, 10.0, 1).unwrap();
        let recon = Reconstruction::new(grid, params());
        let trains = SpikeTrains::from_trains(vec![vec![20.0], vec![55.0]]);
        let progress = ProgressBar::hidden();

        let key = CacheKey::new(&recon, &trains);
        assert!(cache.load(0, key).unwrap().is_none());

        let first = recon.population_cached(0, &trains, Some(&cache), &progress).unwrap();
        assert!(cache.path("std_x_avg", 0).exists());
        assert!(cache.csv_path(0).exists());

        let hit = cache.load(0, key).unwrap().unwrap();
        assert_eq!(hit.times, first.times);
        for k in 0..hit.len() {
            assert!(close(hit.mean_x[k], first.mean_x[k], 1e-12));
        }

        // Different spikes change the key and force a recompute
        let other = SpikeTrains::from_trains(vec![vec![30.0], vec![55.0]]);
        let other_key = CacheKey::new(&recon, &other);
        assert_ne!(key, other_key);
        assert!(cache.load(0, other_key).unwrap().is_none());
        let recomputed = recon.population_cached(0, &other, Some(&cache), &progress).unwrap();
        assert_ne!(recomputed.mean_x, first.mean_x);
        assert!(cache.load(0, other_key).unwrap().is_some());

        cache.clear(0).unwrap();
        assert!(!cache.path("stp_key", 0).exists());
    }

    #[test]
    fn test_cache_keeps_sample_unit() {
        let dir = TempDir::new().unwrap();
        let cache = StpCache::for_dataset(dir.path());
        let grid = TimeGrid::new(0.0, 100.0, 10.0, 1).unwrap();
        let mut recon = Reconstruction::new(grid, params());
        recon.sample = Some(1);
        let trains = SpikeTrains::from_trains(vec![vec![20.0], vec![55.0]]);
        let progress = ProgressBar::hidden();

        let first = recon.population_cached(0, &trains, Some(&cache), &progress).unwrap();
        let second = recon.population_cached(0, &trains, Some(&cache), &progress).unwrap();
        let (fresh, cached) = (first.sample.unwrap(), second.sample.unwrap());
        assert_eq!(cached.unit, 1);
        for k in 0..fresh.x.len() {
            assert!(close(cached.x[k], fresh.x[k], 1e-12));
            assert!(close(cached.u[k], fresh.u[k], 1e-12));
        }

        // Dropping the sample changes the key and the stored sample goes away
        recon.sample = None;
        let plain = recon.population_cached(0, &trains, Some(&cache), &progress).unwrap();
        assert!(plain.sample.is_none());
        assert!(!cache.path("stp_sample_x", 0).exists());
        assert!(cache.load(0, CacheKey::new(&recon, &trains)).unwrap().unwrap().sample.is_none());
    }

    #[test]
    fn test_window_slice() {
        let grid = TimeGrid::new(0.0, 100.0, 10.0, 1).unwrap();
        let recon = Reconstruction::new(grid, params());
        let trains = SpikeTrains::from_trains(vec![vec![20.0]]);
        let result = recon.population(&trains, &ProgressBar::hidden()).unwrap();
        let part = window_slice(&result, 30.0, 60.0);
        assert_eq!(part.times.to_vec(), vec![30.0, 40.0, 50.0]);
    }
}
