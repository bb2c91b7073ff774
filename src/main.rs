//! Run one calibration sweep against the simulated bench.
//!
//! ```text
//! ivy_run --rs 1e5 --gain 1e6 --data-file IVY_RunData.json --fast
//! ivy_run --config ivy.toml --log-level debug
//! ```
//!
//! Ctrl-C aborts the run; the source is returned to 0 V and standby either way.

use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use tracing::{error, info};

use ivy_daq::config::{DelaySettings, RunSettings};
use ivy_daq::experiment::{RunOutcome, SequenceController};
use ivy_daq::instrument::sim::SimulatedRig;
use ivy_daq::logging::{self, LogFormat};
use ivy_daq::messages::{event_channel, RunEvent, StatusField};
use ivy_daq::DaqError;

#[derive(Parser, Debug)]
#[command(name = "ivy_run")]
#[command(about = "Acquisition sequence controller for the I-V converter calibration rig")]
struct Args {
    /// TOML run settings. `IVY_*` environment variables override file values.
    #[arg(long)]
    config: Option<PathBuf>,

    /// DUC input resistor (ohms), when no config file is given
    #[arg(long, default_value_t = 1e5)]
    rs: f64,

    /// DUC gain (V/A), when no config file is given
    #[arg(long, default_value_t = 1e6)]
    gain: f64,

    /// Run file, when no config file is given
    #[arg(long, default_value = "IVY_RunData.json")]
    data_file: PathBuf,

    /// Store the run under this id instead of a generated one
    #[arg(long)]
    run_id: Option<String>,

    /// Override the DUC name used in generated run ids
    #[arg(long)]
    duc_name: Option<String>,

    /// Free-text comment stored with the run
    #[arg(long)]
    comment: Option<String>,

    /// Skip settle delays (useful with a simulated bench)
    #[arg(long)]
    fast: bool,

    /// Put every simulated instrument into demo mode
    #[arg(long)]
    demo: bool,

    /// Log level for this crate, ignored when RUST_LOG is set
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Emit logs as JSON
    #[arg(long)]
    json_logs: bool,
}

impl Args {
    fn settings(&self) -> anyhow::Result<RunSettings> {
        let mut settings = match &self.config {
            Some(path) => RunSettings::load_from(path)
                .with_context(|| format!("Loading run settings from {}", path.display()))?,
            None => RunSettings::new(self.rs, self.gain, self.data_file.clone()),
        };
        if let Some(id) = &self.run_id {
            settings.run_id = Some(id.clone());
        }
        if let Some(name) = &self.duc_name {
            settings.duc_name = name.clone();
        }
        if let Some(comment) = &self.comment {
            settings.comment = comment.clone();
        }
        if self.fast {
            settings.settle_delay_secs = 0.0;
            settings.delays = DelaySettings::none();
        }
        settings.validate()?;
        Ok(settings)
    }
}

fn print_event(event: &RunEvent) {
    match event {
        RunEvent::Status(status) if status.message.is_empty() => {}
        RunEvent::Status(status) => match status.field {
            StatusField::Primary | StatusField::Both => println!("{}", status.message),
            StatusField::Secondary => println!("    {}", status.message),
        },
        RunEvent::Progress(progress) => info!("Progress {:.1}%", progress.percent),
        RunEvent::Reading(reading) => println!(
            "    row {:>2} {:<3} mean = {:+.9e}  sd = {:.3e}  ({})",
            reading.row,
            reading.channel.as_str(),
            reading.mean,
            reading.sd,
            reading.time
        ),
        RunEvent::PlotPoints(_) | RunEvent::ClearPlot => {}
        RunEvent::Finished(finished) => info!("Run finished (aborted: {})", finished.aborted),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let format = if args.json_logs {
        LogFormat::Json
    } else {
        LogFormat::Text
    };
    logging::init(&args.log_level, format)?;

    let settings = args.settings()?;
    let rig = SimulatedRig::new(settings.rs, settings.duc_gain);
    if args.demo {
        rig.set_all_demo();
    }

    let (events, mut rx) = event_channel();
    let controller = SequenceController::new(settings, rig.registry(), events)?;
    println!("Run id: {}", controller.run_id());
    let handle = controller.spawn();

    let abort = handle.abort_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Ctrl-C received, aborting run");
            abort.abort();
        }
    });

    // the channel closes when the controller task drops its senders
    while let Some(event) = rx.recv().await {
        print_event(&event);
    }

    match handle.join().await {
        Ok(RunOutcome::Completed { run_id, record }) => {
            println!("Saved '{}' ({} rows)", run_id, record.rows());
            if record.has_synthetic_data() {
                println!("Note: some readings were simulated");
            }
            Ok(())
        }
        Ok(RunOutcome::Aborted { run_id, partial }) => {
            println!("Run '{}' aborted after {} rows; not saved", run_id, partial.rows());
            Ok(())
        }
        Err(DaqError::Unsaved {
            run_id,
            record,
            source,
        }) => {
            error!("Run '{}' could not be saved: {}", run_id, source);
            let dump = serde_json::to_string_pretty(&record)?;
            eprintln!("{}", dump);
            Err(anyhow::anyhow!("Run '{}' completed but was not saved", run_id))
        }
        Err(e) => Err(e.into()),
    }
}
