//! # wmstp CLI
//!
//! Command-line interface for analysing working-memory simulation datasets.

use anyhow::{anyhow, Context};
use clap::{ArgAction, Parser, Subcommand};
use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use serde_json::{json, Value};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;
use tracing_subscriber::EnvFilter;
use ndarray::Array2;
use wmstp_core::{parse_override, update_params, write_dat, ParamSet, UnitId};
use wmstp_ps::{load_or_compute, Panel, PanelDetail};
use wmstp_spikes::{
    load_populations, mean_cv_isi, mean_firing_rate, rate_change, PopulationLayout, SpikeTable,
};
use wmstp_stp::{
    group_by_source, load_synapse_params, write_aggregate_csv, Aggregate, Reconstruction,
    SnapshotTable, StpCache,
};

#[derive(Parser)]
#[command(name = "wmstp")]
#[command(author = "Francisco Molina")]
#[command(version = "0.1.0")]
#[command(about = "Synaptic working-memory analysis toolkit", long_about = None)]
struct Cli {
    /// Dataset directory
    #[arg(short, long, global = true, default_value = "data")]
    data: PathBuf,

    /// JSON file with parameter overrides ({"network": {...}, "analysis": {...}})
    #[arg(long, global = true)]
    overrides: Option<PathBuf>,

    /// Single override, e.g. analysis.dt=0.5
    #[arg(long = "set", global = true, value_name = "KEY=VALUE")]
    set: Vec<String>,

    /// Increase log verbosity (-v info, -vv debug)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Reconstruct population STP traces from spike records
    Stp {
        /// Populations to process (default: all)
        #[arg(short, long)]
        pop: Vec<usize>,
        /// Recompute even if cached traces match
        #[arg(long)]
        no_cache: bool,
        /// Directory for aggregate CSV files
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Reconstruct STP over synapses with individual parameters
    Synapses {
        /// CSV with source, target and optionally tau_F, tau_D, U
        table: PathBuf,
        /// Population whose spikes drive the synapses
        #[arg(short, long, default_value_t = 0)]
        pop: usize,
        /// Restrict to the synapses of one presynaptic neuron
        #[arg(short, long)]
        neuron: Option<UnitId>,
        /// Aggregate CSV file
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Rebuild STP traces from recorded synapse snapshots
    Snapshots {
        /// CSV with time, source, target, x, u and optionally t_last_spike
        table: PathBuf,
        /// Aggregate CSV file
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Detect population spikes and write PS_data.json
    Ps {
        /// Protocol: A (readout) or B (delay period)
        #[arg(short, long, default_value = "A")]
        panel: Panel,
        /// Recompute even if PS_data.json exists
        #[arg(long)]
        force: bool,
    },

    /// Firing-rate summary per population
    Rates {
        /// Window start (ms), default analysis.t_start
        #[arg(long)]
        t_start: Option<f64>,
        /// Window stop (ms), default t_sim
        #[arg(long)]
        t_stop: Option<f64>,
        /// Directory for per-neuron delay minus spontaneous rates (delta_fr_{n}.dat)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Print the resolved parameters
    Params,
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn collect_overrides(file: Option<&Path>, pairs: &[String]) -> anyhow::Result<Value> {
    let mut overrides = match file {
        Some(path) => {
            let content = fs::read_to_string(path)
                .with_context(|| format!("reading overrides {}", path.display()))?;
            serde_json::from_str(&content)?
        }
        None => json!({}),
    };
    for pair in pairs {
        update_params(&mut overrides, &parse_override(pair)?);
    }
    Ok(overrides)
}

fn progress_bar(len: u64, label: String) -> ProgressBar {
    let bar = ProgressBar::new(len);
    if let Ok(style) =
        ProgressStyle::with_template("{msg} [{bar:40.cyan/blue}] {pos}/{len} ({eta})")
    {
        bar.set_style(style.progress_chars("=> "));
    }
    bar.set_message(label);
    bar
}

fn range(values: &[f64]) -> (f64, f64) {
    values
        .iter()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| (lo.min(v), hi.max(v)))
}

fn print_summary(title: &str, result: &Aggregate) {
    println!("{}", title.green().bold());
    if result.is_empty() {
        println!("  {}", "empty grid".yellow());
        return;
    }
    let first = result.times[0];
    let last = result.times[result.len() - 1];
    println!("  Grid: {} points, {} to {} ms", result.len(), first, last);

    let (x_lo, x_hi) = range(result.mean_x.as_slice().unwrap_or(&[]));
    let (u_lo, u_hi) = range(result.mean_u.as_slice().unwrap_or(&[]));
    println!("  {}  mean in [{:.4}, {:.4}]", "x".cyan(), x_lo, x_hi);
    println!("  {}  mean in [{:.4}, {:.4}]", "u".cyan(), u_lo, u_hi);
    if let Some(sample) = &result.sample {
        println!("  Sample unit: {}", sample.unit);
    }
}

fn write_output(path: Option<&Path>, result: &Aggregate) -> anyhow::Result<()> {
    if let Some(path) = path {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        write_aggregate_csv(path, result)?;
        println!("  Written: {}", path.display());
    }
    Ok(())
}

fn run_stp(
    set: &ParamSet,
    pops: Vec<usize>,
    no_cache: bool,
    output: Option<PathBuf>,
) -> anyhow::Result<()> {
    let recon = Reconstruction::from_params(set)?;
    let tables = load_populations(&set.data_path, set.network.p, set.network.overlap)?;
    let pops = if pops.is_empty() {
        (0..tables.len()).collect()
    } else {
        pops
    };
    let cache = (set.analysis.use_cache && !no_cache).then(|| StpCache::for_dataset(&set.data_path));
    let size = set.network.population_size();

    for npop in pops {
        let table = tables
            .get(npop)
            .ok_or_else(|| anyhow!("population {} not recorded", npop))?;
        let layout = PopulationLayout::for_dataset(size, npop, set.network.overlap);
        let trains = table.spike_trains(&layout, set.analysis.decimals);

        let bar = progress_bar(trains.len() as u64, format!("pop {}", npop));
        let result = recon.population_cached(npop, &trains, cache.as_ref(), &bar)?;
        bar.finish_and_clear();

        print_summary(&format!("Population {} ({} units)", npop, trains.len()), &result);
        let csv = output
            .as_ref()
            .map(|dir| dir.join(format!("stp_aggregate_{}.csv", npop)));
        write_output(csv.as_deref(), &result)?;
    }
    Ok(())
}

fn run_synapses(
    set: &ParamSet,
    table: &Path,
    npop: usize,
    neuron: Option<UnitId>,
    output: Option<PathBuf>,
) -> anyhow::Result<()> {
    let recon = Reconstruction::from_params(set)?;
    let synapses = load_synapse_params(table, &recon.params)?;
    let spikes = SpikeTable::load(&set.data_path.join(format!("spikedata{}.dat", npop)))?;
    let trains = spikes.trains_by_sender();

    let (title, result) = match neuron {
        Some(source) => {
            let own: Vec<_> = synapses.iter().copied().filter(|s| s.source == source).collect();
            let group = group_by_source(&own, set.analysis.targets)
                .into_iter()
                .next()
                .map(|(_, group)| group)
                .ok_or_else(|| anyhow!("no synapses from neuron {}", source))?;
            let train = trains.get(&source).map(Vec::as_slice).unwrap_or(&[]);
            info!(neuron = source, synapses = group.len(), spikes = train.len(), "single neuron");
            (
                format!("Neuron {} ({} synapses)", source, group.len()),
                recon.neuron_synapses(train, &group)?,
            )
        }
        None => {
            let n_sources = group_by_source(&synapses, set.analysis.targets).len();
            let bar = progress_bar(n_sources as u64, format!("pop {}", npop));
            let result =
                recon.population_synapses(&trains, &synapses, set.analysis.targets, &bar)?;
            bar.finish_and_clear();
            (
                format!("Population {} ({} neurons, {} synapses)", npop, n_sources, synapses.len()),
                result,
            )
        }
    };

    print_summary(&title, &result);
    write_output(output.as_deref(), &result)
}

fn run_snapshots(set: &ParamSet, table: &Path, output: Option<PathBuf>) -> anyhow::Result<()> {
    let recon = Reconstruction::from_params(set)?;
    let snapshots = SnapshotTable::load(table)?;
    let result = recon.snapshot_population(&snapshots)?;
    print_summary(
        &format!("Snapshots ({} rows)", snapshots.len()),
        &result,
    );
    write_output(output.as_deref(), &result)
}

fn run_ps(set: &ParamSet, panel: Panel, force: bool) -> anyhow::Result<()> {
    let report = load_or_compute(set, panel, force)?;
    println!(
        "{} panel {}, targeted population {}",
        "Persistent-state test:".green().bold(),
        report.panel,
        report.targeted_pop
    );

    for (key, pop) in &report.populations {
        let last = pop
            .time_of_last_ps
            .map(|t| format!("{} ms", t))
            .unwrap_or_else(|| "-".into());
        let mut line = format!("  {}: {} PS, last {}", key.cyan(), pop.ps, last);
        match &pop.detail {
            PanelDetail::Readout {
                ps_before_test,
                ps_during_test,
                ps_after_readout,
                ..
            } => line.push_str(&format!(
                ", readout before/during/after {}/{}/{}",
                ps_before_test, ps_during_test, ps_after_readout
            )),
            PanelDetail::Rhythm {
                av_dt_ps,
                std_dt_ps,
                ps_per_second,
            } => {
                line.push_str(&format!(", {:.2} PS/s", ps_per_second));
                if let (Some(av), Some(sd)) = (av_dt_ps, std_dt_ps) {
                    line.push_str(&format!(", interval {:.1} +/- {:.1} ms", av, sd));
                }
            }
        }
        if pop.ps_before_item > 0 {
            line.push_str(&format!(" {}", "(PS before item loading)".yellow()));
        }
        println!("{}", line);
    }

    let performance = report.evaluate();
    match performance.survival {
        Some(survival) if survival.retained => {
            println!("  {}", "Memory correctly stored".green())
        }
        Some(survival) => println!(
            "  {} after {} ms in a {} ms run",
            "Memory lost".red(),
            survival.time_of_last_ps,
            set.simulation.t_sim
        ),
        None => {}
    }
    println!(
        "  PS before item loading: {}, false positives: {}",
        performance.ps_before_item, performance.false_positives
    );
    Ok(())
}

fn run_rates(
    set: &ParamSet,
    t_start: Option<f64>,
    t_stop: Option<f64>,
    output: Option<PathBuf>,
) -> anyhow::Result<()> {
    let (default_start, default_stop) = set.window();
    let t_start = t_start.unwrap_or(default_start);
    let t_stop = t_stop.unwrap_or(default_stop);
    let tables = load_populations(&set.data_path, set.network.p, set.network.overlap)?;
    let size = set.network.population_size();
    let windows = set.rate_windows();
    if let Some(dir) = &output {
        fs::create_dir_all(dir)?;
    }

    println!(
        "{} {} to {} ms",
        "Firing rates:".green().bold(),
        t_start,
        t_stop
    );
    for (npop, table) in tables.iter().enumerate() {
        let layout = PopulationLayout::for_dataset(size, npop, set.network.overlap);
        let ids = layout.first_id()..layout.first_id() + size as UnitId;
        let rates = table.firing_rates(t_start, t_stop, ids)?;
        let mean = mean_firing_rate(table, size, set.simulation.t_sim);
        let window_mean = if rates.is_empty() {
            0.0
        } else {
            rates.iter().map(|(_, r)| r).sum::<f64>() / rates.len() as f64
        };

        let trains = table.spike_trains(&layout, set.analysis.decimals);
        let cv = mean_cv_isi(trains.iter()).unwrap_or(0.0);

        println!(
            "  {}: {:.2} Hz in window, {:.2} Hz over run, CV(ISI) {:.3}",
            format!("pop {}", npop).cyan(),
            window_mean,
            mean,
            cv
        );

        let Some(windows) = windows else {
            continue;
        };
        let change = rate_change(table, windows.delay, windows.spontaneous, set.n_recorded())?;
        if change.is_empty() {
            continue;
        }
        let deltas = Array2::from_shape_fn((change.len(), 2), |(i, j)| match j {
            0 => change[i].0 as f64,
            _ => change[i].1,
        });
        let column = deltas.column(1);
        println!(
            "    delay vs spontaneous: {:+.2} +/- {:.2} Hz over {} neurons",
            column.mean().unwrap_or(0.0),
            column.std(0.0),
            change.len()
        );
        if let Some(dir) = &output {
            let path = dir.join(format!("delta_fr_{}.dat", npop));
            write_dat(&path, &deltas)?;
            info!(path = %path.display(), "rate change written");
        }
    }
    if windows.is_none() {
        println!("  {}", "No item loading: rate change skipped".yellow());
    }
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let overrides = collect_overrides(cli.overrides.as_deref(), &cli.set)?;
    let set = ParamSet::load(&cli.data, &overrides)
        .with_context(|| format!("loading parameters from {}", cli.data.display()))?;

    match cli.command {
        Commands::Stp {
            pop,
            no_cache,
            output,
        } => run_stp(&set, pop, no_cache, output)?,

        Commands::Synapses {
            table,
            pop,
            neuron,
            output,
        } => run_synapses(&set, &table, pop, neuron, output)?,

        Commands::Snapshots { table, output } => run_snapshots(&set, &table, output)?,

        Commands::Ps { panel, force } => run_ps(&set, panel, force)?,

        Commands::Rates {
            t_start,
            t_stop,
            output,
        } => run_rates(&set, t_start, t_stop, output)?,

        Commands::Params => {
            let resolved = json!({
                "network": set.network,
                "simulation": set.simulation,
                "analysis": set.analysis,
                "protocol": set.protocol,
            });
            println!("{}", serde_json::to_string_pretty(&resolved)?);
        }
    }

    Ok(())
}
