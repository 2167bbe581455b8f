//! # WMSTP Core
//!
//! Shared types for the working-memory STP analysis toolkit.
//!
//! The datasets analysed here are produced by a NEST run of the
//! Mongillo et al. working-memory network: one spike table per selective
//! population, the network/simulation parameter dictionaries saved as JSON,
//! and optional per-synapse STP snapshots.
//!
//! ## Contents
//!
//! | Area | What lives here |
//! |------|-----------------|
//! | Errors | [`CoreError`] and the crate [`Result`] |
//! | Tables | whitespace-delimited `.dat` readers and writers |
//! | Parameters | typed network, simulation and analysis parameters |
//! | Stimuli | the [`Stimulus`] variants and the resolved [`Protocol`] |
//! | Overrides | structural merge of custom parameters onto defaults |

use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Common errors
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("Parse error in {path}:{line}: {message}")]
    ParseError {
        path: PathBuf,
        line: usize,
        message: String,
    },

    #[error("File not found: {0}")]
    MissingFile(PathBuf),

    #[error("Custom key {0} not used")]
    UnknownKey(String),

    #[error("Type mismatch for {key}: expected {expected}, got {found}")]
    TypeMismatch {
        key: String,
        expected: &'static str,
        found: &'static str,
    },

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, CoreError>;

/// Time point (ms)
pub type Time = f64;

/// Sender id as written by the spike recorder
pub type UnitId = u64;

/// Round to a fixed number of decimals so that equal grid times compare equal.
pub fn round_to(value: f64, decimals: u32) -> f64 {
    let scale = 10f64.powi(decimals as i32);
    (value * scale).round() / scale
}

// ============================================================================
// NUMERIC TABLES (.dat)
// ============================================================================

/// Read a whitespace-delimited numeric table.
///
/// Lines may carry `#` comments. An empty file yields a `0 x 0` array.
pub fn read_dat(path: &Path) -> Result<Array2<f64>> {
    if !path.exists() {
        return Err(CoreError::MissingFile(path.to_path_buf()));
    }
    let content = fs::read_to_string(path)?;

    let mut values = Vec::new();
    let mut n_cols: Option<usize> = None;
    let mut n_rows = 0;

    for (i, line) in content.lines().enumerate() {
        let line = line.split('#').next().unwrap_or("").trim();
        if line.is_empty() {
            continue;
        }

        let row = line
            .split_whitespace()
            .map(|tok| {
                tok.parse::<f64>().map_err(|e| CoreError::ParseError {
                    path: path.to_path_buf(),
                    line: i + 1,
                    message: format!("{}: {}", tok, e),
                })
            })
            .collect::<Result<Vec<f64>>>()?;

        let expected = *n_cols.get_or_insert(row.len());
        if expected != row.len() {
            return Err(CoreError::ParseError {
                path: path.to_path_buf(),
                line: i + 1,
                message: format!("expected {} columns, found {}", expected, row.len()),
            });
        }

        values.extend(row);
        n_rows += 1;
    }

    Array2::from_shape_vec((n_rows, n_cols.unwrap_or(0)), values).map_err(|e| {
        CoreError::ParseError {
            path: path.to_path_buf(),
            line: 0,
            message: e.to_string(),
        }
    })
}

/// Read a single-column table as a vector.
pub fn read_dat_column(path: &Path) -> Result<Array1<f64>> {
    let table = read_dat(path)?;
    match table.ncols() {
        0 => Ok(Array1::zeros(0)),
        1 => Ok(table.column(0).to_owned()),
        n => Err(CoreError::ParseError {
            path: path.to_path_buf(),
            line: 0,
            message: format!("expected a single column, found {}", n),
        }),
    }
}

/// Write one value per line, full precision.
pub fn write_dat_column(path: &Path, values: &Array1<f64>) -> Result<()> {
    let mut out = BufWriter::new(File::create(path)?);
    for v in values {
        writeln!(out, "{:.18e}", v)?;
    }
    out.flush()?;
    Ok(())
}

/// Write a matrix, one row per line, space separated.
pub fn write_dat(path: &Path, table: &Array2<f64>) -> Result<()> {
    let mut out = BufWriter::new(File::create(path)?);
    for row in table.rows() {
        let line = row
            .iter()
            .map(|v| format!("{:.18e}", v))
            .collect::<Vec<_>>()
            .join(" ");
        writeln!(out, "{}", line)?;
    }
    out.flush()?;
    Ok(())
}

// ============================================================================
// NETWORK PARAMETERS
// ============================================================================

/// Tsodyks-Markram parameters of the E->E synapses
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StpConfig {
    #[serde(rename = "U")]
    pub u_base: f64,      // Baseline utilization
    pub u0: f64,          // u at the start of the observation window
    pub x0: f64,          // x at the start of the observation window
    #[serde(rename = "tau_F")]
    pub tau_f: f64,       // Facilitation time constant (ms)
    #[serde(rename = "tau_D")]
    pub tau_d: f64,       // Recovery time constant (ms)
}

impl Default for StpConfig {
    fn default() -> Self {
        Self {
            u_base: 0.19,
            u0: 0.19,
            x0: 1.0,
            tau_f: 1500.0,
            tau_d: 200.0,
        }
    }
}

/// Durations and contrasts of the external signals
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StimulationParams {
    #[serde(rename = "T_cue")]
    pub t_cue: f64,           // Item loading duration (ms)
    #[serde(rename = "A_cue")]
    pub a_cue: f64,
    #[serde(rename = "T_reac")]
    pub t_reac: f64,          // Readout duration (ms)
    #[serde(rename = "A_reac")]
    pub a_reac: f64,
    #[serde(rename = "T_period_reac")]
    pub t_period_reac: f64,
    pub period: f64,
    #[serde(rename = "A_period_reac")]
    pub a_period_reac: f64,
    pub dt_external_stim: f64,
}

impl Default for StimulationParams {
    fn default() -> Self {
        Self {
            t_cue: 350.0,
            a_cue: 1.15,
            t_reac: 250.0,
            a_reac: 1.05,
            t_period_reac: 100.0,
            period: 300.0,
            a_period_reac: 1.075,
            dt_external_stim: 1.0,
        }
    }
}

/// Network-level parameters consumed by the analysis
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkParams {
    pub f: f64,               // Coding level
    pub overlap: bool,
    pub p: usize,             // Number of memories
    #[serde(rename = "N_exc")]
    pub n_exc: usize,
    #[serde(rename = "N_inh")]
    pub n_inh: usize,
    pub fr_eta: f64,
    #[serde(rename = "A_eta")]
    pub a_eta: f64,
    pub stp_params: StpConfig,
    pub stimulation_params: StimulationParams,
}

impl Default for NetworkParams {
    fn default() -> Self {
        Self {
            f: 0.10,
            overlap: false,
            p: 5,
            n_exc: 8000,
            n_inh: 2000,
            fr_eta: 15.0,
            a_eta: 1.05,
            stp_params: StpConfig::default(),
            stimulation_params: StimulationParams::default(),
        }
    }
}

impl NetworkParams {
    /// Neurons per selective population (`N_exc * f`)
    pub fn population_size(&self) -> usize {
        (self.n_exc as f64 * self.f).round() as usize
    }
}

// ============================================================================
// SIMULATION PARAMETERS
// ============================================================================

/// Populations whose spikes were saved
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PopRecorded {
    /// The literal "all"
    Named(String),
    List(Vec<usize>),
}

impl Default for PopRecorded {
    fn default() -> Self {
        PopRecorded::Named("all".into())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpikeRecordingParams {
    pub start: f64,
}

impl Default for SpikeRecordingParams {
    fn default() -> Self {
        Self { start: 50.0 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecordingParams {
    pub fraction_pop_recorded: f64,
    pub pop_recorded: PopRecorded,
    pub spike_recording_params: SpikeRecordingParams,
    pub save_to_file: bool,
    pub stp_recording: bool,
    pub stp_record_interval: f64,    // ms
    pub stp_pop_recorded: Vec<usize>,
    pub stp_fraction_recorded: f64,
}

impl Default for RecordingParams {
    fn default() -> Self {
        Self {
            fraction_pop_recorded: 0.1,
            pop_recorded: PopRecorded::default(),
            spike_recording_params: SpikeRecordingParams::default(),
            save_to_file: true,
            stp_recording: false,
            stp_record_interval: 10.0,
            stp_pop_recorded: vec![0],
            stp_fraction_recorded: 0.1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationParams {
    pub master_seed: u64,
    pub threads: usize,
    pub dt: f64,                 // Simulation step (ms)
    pub t_sim: f64,              // Simulated time (ms)
    #[serde(alias = "mu_end_origin")]
    pub eta_end_origin: f64,     // Return to the spontaneous state (ms)
    pub recording_params: RecordingParams,
}

impl Default for SimulationParams {
    fn default() -> Self {
        Self {
            master_seed: 143202461,
            threads: 8,
            dt: 0.05,
            t_sim: 6000.0,
            eta_end_origin: 5200.0,
            recording_params: RecordingParams::default(),
        }
    }
}

// ============================================================================
// ANALYSIS PARAMETERS
// ============================================================================

/// How a reconstructed trajectory is mapped onto the shared grid
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResampleMode {
    /// Look samples up by their (rounded) timestamp
    #[default]
    ByTimestamp,
    /// Keep the first N samples, assuming a shared start and step
    ByPosition,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisParams {
    pub dt: f64,                     // Reconstruction step (ms)
    pub decimals: u32,               // Time precision used for equality
    pub t_start: f64,
    pub t_stop: Option<f64>,         // Defaults to t_sim
    pub resample: ResampleMode,
    pub sample_unit: Option<usize>,
    pub targets: Option<usize>,      // Synapses kept per neuron
    pub ps_bin_width: f64,           // ms
    pub ps_threshold: f64,           // Hz
    pub use_cache: bool,
}

impl Default for AnalysisParams {
    fn default() -> Self {
        Self {
            dt: 0.1,
            decimals: 1,
            t_start: 0.0,
            t_stop: None,
            resample: ResampleMode::ByTimestamp,
            sample_unit: None,
            targets: None,
            ps_bin_width: 25.0,
            ps_threshold: 20.0,
            use_cache: true,
        }
    }
}

impl AnalysisParams {
    /// Observation window, falling back to the simulated interval.
    pub fn window(&self, sim: &SimulationParams) -> (Time, Time) {
        (self.t_start, self.t_stop.unwrap_or(sim.t_sim))
    }
}

// ============================================================================
// STIMULI
// ============================================================================

/// External signals applied during the run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stimulus {
    #[serde(rename = "background_input")]
    Background { start: Time, stop: Time },

    ItemLoading { pop_id: Vec<usize>, origin: Vec<Time> },

    SeqItemLoading { pop_id: Vec<usize>, origin: Vec<Time> },

    #[serde(rename = "nonspecific_readout_signals")]
    NonspecificReadout { origin: Vec<Time> },

    NonspecificNoise { origin: Vec<Time>, frac: f64 },

    PeriodicSequence { times: Vec<Time> },
}

impl Stimulus {
    /// Keys under which stimuli are stored in `network_params.json`
    pub const KEYS: [&'static str; 6] = [
        "background_input",
        "item_loading",
        "seq_item_loading",
        "nonspecific_readout_signals",
        "nonspecific_noise",
        "periodic_sequence",
    ];

    fn from_entry(key: &str, value: &Value) -> Result<Self> {
        let mut tagged = Map::new();
        tagged.insert(key.to_string(), value.clone());
        let stimulus: Stimulus = serde_json::from_value(Value::Object(tagged))?;

        if let Stimulus::ItemLoading { pop_id, origin }
        | Stimulus::SeqItemLoading { pop_id, origin } = &stimulus
        {
            if pop_id.len() != origin.len() {
                return Err(CoreError::InvalidParameter(format!(
                    "{}: pop_id and origin must have the same dimension",
                    key
                )));
            }
        }
        Ok(stimulus)
    }
}

/// Stimuli resolved once at load time
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Protocol {
    pub stimuli: Vec<Stimulus>,
}

impl Protocol {
    /// Pick every recognised stimulus out of a raw network dictionary.
    pub fn from_network_value(network: &Value) -> Result<Self> {
        let mut stimuli = Vec::new();
        if let Value::Object(map) = network {
            for key in Stimulus::KEYS {
                if let Some(value) = map.get(key) {
                    stimuli.push(Stimulus::from_entry(key, value)?);
                }
            }
        }
        Ok(Self { stimuli })
    }

    /// Targeted populations and onsets of the item loading signal.
    /// A plain item loading signal wins over a sequential one.
    pub fn item_loading(&self) -> Option<(&[usize], &[Time])> {
        let plain = self.stimuli.iter().find_map(|s| match s {
            Stimulus::ItemLoading { pop_id, origin } => Some((pop_id.as_slice(), origin.as_slice())),
            _ => None,
        });
        plain.or_else(|| {
            self.stimuli.iter().find_map(|s| match s {
                Stimulus::SeqItemLoading { pop_id, origin } => {
                    Some((pop_id.as_slice(), origin.as_slice()))
                }
                _ => None,
            })
        })
    }

    pub fn readout_origins(&self) -> Option<&[Time]> {
        self.stimuli.iter().find_map(|s| match s {
            Stimulus::NonspecificReadout { origin } => Some(origin.as_slice()),
            _ => None,
        })
    }

    pub fn noise_origins(&self) -> Option<&[Time]> {
        self.stimuli.iter().find_map(|s| match s {
            Stimulus::NonspecificNoise { origin, .. } => Some(origin.as_slice()),
            _ => None,
        })
    }

    /// End of the delay period: the first readout or noise signal,
    /// whichever comes first, else the return to the spontaneous state.
    pub fn delay_period_end(&self, eta_end_origin: Time) -> Time {
        let readout = self.readout_origins().and_then(|o| o.first().copied());
        let noise = self.noise_origins().and_then(|o| o.first().copied());
        match (readout, noise) {
            (Some(r), Some(n)) => r.min(n),
            (Some(t), None) | (None, Some(t)) => t,
            (None, None) => eta_end_origin,
        }
    }
}

// ============================================================================
// PARAMETER OVERRIDES
// ============================================================================

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(n) if n.is_f64() => "float",
        Value::Number(_) => "integer",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn join_key(prefix: &str, key: &str) -> String {
    if prefix.is_empty() {
        key.to_string()
    } else {
        format!("{}.{}", prefix, key)
    }
}

/// Structural check of custom parameters against a defaults tree.
///
/// Every custom key must exist in the defaults and carry a value of the
/// same JSON kind. Integers are accepted where floats are expected, and a
/// `null` default accepts anything. Numeric ranges are not checked.
pub fn check_params(custom: &Value, defaults: &Value, prefix: &str) -> Result<()> {
    let custom_map = match custom {
        Value::Object(map) => map,
        Value::Null => return Ok(()),
        other => {
            return Err(CoreError::TypeMismatch {
                key: if prefix.is_empty() { "<root>".into() } else { prefix.into() },
                expected: "object",
                found: json_kind(other),
            })
        }
    };

    for (key, value) in custom_map {
        let path = join_key(prefix, key);
        let default = match defaults.get(key) {
            Some(d) => d,
            None => return Err(CoreError::UnknownKey(path)),
        };

        match (default, value) {
            (Value::Object(_), Value::Object(_)) => check_params(value, default, &path)?,
            (Value::Null, _) => {}
            (d, v) => {
                let expected = json_kind(d);
                let found = json_kind(v);
                let compatible = expected == found || (expected == "float" && found == "integer");
                if !compatible {
                    return Err(CoreError::TypeMismatch { key: path, expected, found });
                }
            }
        }
    }
    Ok(())
}

/// Recursive update: nested objects merge, leaves replace.
pub fn update_params(target: &mut Value, custom: &Value) {
    if let (Value::Object(target_map), Value::Object(custom_map)) = (&mut *target, custom) {
        for (key, value) in custom_map {
            match target_map.get_mut(key) {
                Some(existing) if existing.is_object() && value.is_object() => {
                    update_params(existing, value);
                }
                _ => {
                    target_map.insert(key.clone(), value.clone());
                }
            }
        }
    }
}

/// Validate and merge in one step.
pub fn merge_params(defaults: &Value, custom: &Value) -> Result<Value> {
    check_params(custom, defaults, "")?;
    let mut merged = defaults.clone();
    update_params(&mut merged, custom);
    Ok(merged)
}

/// Parse a `dotted.key=value` pair into a nested JSON object.
///
/// The value is read as JSON when possible and as a bare string otherwise.
pub fn parse_override(pair: &str) -> Result<Value> {
    let (key, raw) = pair
        .split_once('=')
        .ok_or_else(|| CoreError::InvalidParameter(format!("expected key=value, got '{}'", pair)))?;
    let key = key.trim();
    if key.is_empty() || key.split('.').any(|part| part.is_empty()) {
        return Err(CoreError::InvalidParameter(format!("malformed key '{}'", key)));
    }

    let raw = raw.trim();
    let mut value = serde_json::from_str::<Value>(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
    for part in key.rsplit('.') {
        let mut map = Map::new();
        map.insert(part.to_string(), value);
        value = Value::Object(map);
    }
    Ok(value)
}

// ============================================================================
// PARAMETER SET
// ============================================================================

/// Everything an analysis pass needs, resolved once
#[derive(Debug, Clone)]
pub struct ParamSet {
    pub network: NetworkParams,
    pub simulation: SimulationParams,
    pub analysis: AnalysisParams,
    pub protocol: Protocol,
    pub data_path: PathBuf,
}

impl ParamSet {
    /// Load `network_params.json` and `simulation_params.json` from a
    /// dataset directory. Missing files fall back to the model defaults.
    pub fn load(data_path: &Path, overrides: &Value) -> Result<Self> {
        let network = read_json_over(
            &data_path.join("network_params.json"),
            serde_json::to_value(NetworkParams::default())?,
        )?;
        let simulation = read_json_over(
            &data_path.join("simulation_params.json"),
            serde_json::to_value(SimulationParams::default())?,
        )?;
        Self::from_values(data_path, network, simulation, overrides)
    }

    /// Resolve from raw dictionaries. Overrides are an object with optional
    /// `network`, `simulation` and `analysis` sections.
    pub fn from_values(
        data_path: &Path,
        network: Value,
        simulation: Value,
        overrides: &Value,
    ) -> Result<Self> {
        let analysis_defaults = serde_json::to_value(AnalysisParams::default())?;
        let defaults = serde_json::json!({
            "network": network,
            "simulation": simulation,
            "analysis": analysis_defaults,
        });
        let merged = merge_params(&defaults, overrides)?;

        let protocol = Protocol::from_network_value(&merged["network"])?;
        let network: NetworkParams = serde_json::from_value(merged["network"].clone())?;
        let simulation: SimulationParams = serde_json::from_value(merged["simulation"].clone())?;
        let analysis: AnalysisParams = serde_json::from_value(merged["analysis"].clone())?;

        Ok(Self {
            network,
            simulation,
            analysis,
            protocol,
            data_path: data_path.to_path_buf(),
        })
    }

    /// Observation window of the reconstruction
    pub fn window(&self) -> (Time, Time) {
        self.analysis.window(&self.simulation)
    }

    /// Spontaneous and delay-period windows of the first item loading.
    ///
    /// The spontaneous state runs from the start of spike recording to item
    /// onset; the delay period from the end of the cue to the first readout
    /// or noise signal.
    pub fn rate_windows(&self) -> Option<RateWindows> {
        let (_, origins) = self.protocol.item_loading()?;
        let onset = *origins.first()?;
        let recording_start = self.simulation.recording_params.spike_recording_params.start;
        Some(RateWindows {
            spontaneous: (recording_start, onset),
            delay: (
                onset + self.network.stimulation_params.t_cue,
                self.protocol.delay_period_end(self.simulation.eta_end_origin),
            ),
        })
    }

    /// Neurons per population covered by the spike recorders
    pub fn n_recorded(&self) -> usize {
        (self.network.population_size() as f64
            * self.simulation.recording_params.fraction_pop_recorded) as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateWindows {
    pub spontaneous: (Time, Time),
    pub delay: (Time, Time),
}

/// Dataset JSON laid over the model defaults, so that keys absent from
/// older files can still be overridden.
fn read_json_over(path: &Path, mut defaults: Value) -> Result<Value> {
    if path.exists() {
        let content = fs::read_to_string(path)?;
        let mut stored: Value = serde_json::from_str(&content)?;
        if let Value::Object(map) = &mut stored {
            if let Some(value) = map.remove("mu_end_origin") {
                map.entry("eta_end_origin").or_insert(value);
            }
        }
        update_params(&mut defaults, &stored);
    }
    Ok(defaults)
}
