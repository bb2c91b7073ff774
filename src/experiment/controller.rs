//! Acquisition sequence controller.
//!
//! Executes one calibration run on a tokio task: settle, initialise every role,
//! then walk the sweep matrix (output level → input node → polarity mask),
//! taking `nreads` paired readings of the selected input node and the DUC output
//! at each point. Each point is aggregated, appended to the [`RunRecord`] and
//! reported through the event channel.
//!
//! # Lifecycle
//!
//! ```text
//! Idle → Settling → Initializing → Sweeping → Finishing → Terminal
//!            └──────────┴──────────────┴────→ Aborting ──┘
//! ```
//!
//! Cancellation is cooperative. The [`AbortHandle`] flips a watch channel that is
//! checked at every pause and after every read pair; a pause in progress wakes
//! immediately. Every exit path (completion, abort, fatal error) drives the
//! source to 0 V and standby before the task ends.
//!
//! # Failure handling
//!
//! - Out-of-scope output levels are skipped; progress advances as if executed.
//! - Instrument failures degrade the role to simulated readings (see
//!   [`station`](super::station)).
//! - Sample-count, polarity and range-readback violations end the run with an error.
//! - A completed run that cannot be saved is returned inside
//!   [`DaqError::Unsaved`].
//! - An aborted run is not saved; the partial record is returned in
//!   [`RunOutcome::Aborted`].

use chrono::{Local, Utc};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, warn};

use crate::config::RunSettings;
use crate::data::storage::RunStore;
use crate::error::{AppResult, DaqError};
use crate::error_recovery::{retry_blocking, RetryPolicy};
use crate::experiment::plan::{
    CalibrationPoint, LevelPlan, Node, Polarity, Progress, SweepPlan,
};
use crate::experiment::record::{RecordRow, RunId, RunRecord};
use crate::experiment::station::{ProbeStation, Station};
use crate::instrument::{Instrument, InstrumentRegistry, Quantity, Role};
use crate::measurement::{
    aggregate, simulated_reading, voltmeter_spread, AggregatedBlock, SampleBatch,
};
use crate::messages::{
    EventSender, PlotPointsEvent, ReadingChannel, ReadingEvent, RunEvent, RunFinishedEvent,
    StatusField,
};

/// Nominal Pt-100 reading substituted when DVMT is unavailable (ohms).
const PT_DVM_NOMINAL: f64 = 108.0;
const PT_DVM_SPREAD: f64 = 1.0e-2;

/// Controller lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    /// Created, not started
    Idle,
    /// Waiting out the pre-run settle delay
    Settling,
    /// Opening and initialising instruments
    Initializing,
    /// Walking the sweep matrix
    Sweeping,
    /// Saving the completed run
    Finishing,
    /// Shutting down after an abort or a fatal error
    Aborting,
    /// Done; the source is at 0 V and in standby
    Terminal,
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RunState::Idle => "Idle",
            RunState::Settling => "Settling",
            RunState::Initializing => "Initializing",
            RunState::Sweeping => "Sweeping",
            RunState::Finishing => "Finishing",
            RunState::Aborting => "Aborting",
            RunState::Terminal => "Terminal",
        };
        f.write_str(name)
    }
}

/// How a run ended when it did not fail.
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    /// Every level visited and the run saved.
    Completed {
        /// Key the run was saved under
        run_id: RunId,
        /// The saved record
        record: RunRecord,
    },
    /// Stopped on request. Nothing was saved.
    Aborted {
        /// Key the run would have been saved under
        run_id: RunId,
        /// Rows recorded before the abort
        partial: RunRecord,
    },
}

impl RunOutcome {
    /// True for [`RunOutcome::Aborted`].
    pub fn is_aborted(&self) -> bool {
        matches!(self, RunOutcome::Aborted { .. })
    }

    /// Run identifier.
    pub fn run_id(&self) -> &RunId {
        match self {
            RunOutcome::Completed { run_id, .. } | RunOutcome::Aborted { run_id, .. } => run_id,
        }
    }

    /// The record, complete or partial.
    pub fn record(&self) -> &RunRecord {
        match self {
            RunOutcome::Completed { record, .. } => record,
            RunOutcome::Aborted { partial, .. } => partial,
        }
    }
}

/// Requests cancellation of a running sequence. Cheap to clone.
#[derive(Debug, Clone)]
pub struct AbortHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl AbortHandle {
    /// Ask the run to stop at its next suspension point.
    pub fn abort(&self) {
        self.tx.send_replace(true);
    }

    /// True once [`AbortHandle::abort`] has been called.
    pub fn is_aborted(&self) -> bool {
        *self.tx.borrow()
    }
}

/// The controller's side of an [`AbortHandle`].
#[derive(Debug)]
pub struct AbortSignal {
    rx: watch::Receiver<bool>,
}

/// Create a connected abort handle and signal.
pub fn abort_pair() -> (AbortHandle, AbortSignal) {
    let (tx, rx) = watch::channel(false);
    (
        AbortHandle { tx: Arc::new(tx) },
        AbortSignal { rx },
    )
}

impl AbortSignal {
    /// `Err(Aborted)` if an abort has been requested.
    pub fn check(&self) -> AppResult<()> {
        if *self.rx.borrow() {
            Err(DaqError::Aborted)
        } else {
            Ok(())
        }
    }

    /// Sleep for `secs`, waking early on abort. Checks before and after.
    pub async fn pause(&mut self, secs: f64) -> AppResult<()> {
        self.check()?;
        if secs > 0.0 {
            let deadline = Duration::try_from_secs_f64(secs)
                .ok()
                .and_then(|d| Instant::now().checked_add(d))
                .ok_or_else(|| {
                    DaqError::Configuration(format!("Delay of {} s is out of range", secs))
                })?;
            loop {
                tokio::select! {
                    _ = sleep_until(deadline) => break,
                    changed = self.rx.changed() => {
                        if changed.is_err() {
                            // every handle dropped: nobody can abort any more
                            sleep_until(deadline).await;
                            break;
                        }
                        if *self.rx.borrow() {
                            break;
                        }
                    }
                }
            }
        }
        self.check()
    }

    /// [`AbortSignal::pause`] when `wait` is set, otherwise only check.
    pub async fn pause_if(&mut self, wait: bool, secs: f64) -> AppResult<()> {
        if wait {
            self.pause(secs).await
        } else {
            self.check()
        }
    }
}

/// Handle to a sequence running on a tokio task.
#[derive(Debug)]
pub struct RunHandle {
    join: JoinHandle<AppResult<RunOutcome>>,
    abort: AbortHandle,
    state: watch::Receiver<RunState>,
}

impl RunHandle {
    /// Request a cooperative abort.
    pub fn abort(&self) {
        self.abort.abort();
    }

    /// A clonable abort handle, e.g. for a Ctrl-C handler.
    pub fn abort_handle(&self) -> AbortHandle {
        self.abort.clone()
    }

    /// Latest controller state.
    pub fn state(&self) -> RunState {
        *self.state.borrow()
    }

    /// Watch controller state changes.
    pub fn subscribe_state(&self) -> watch::Receiver<RunState> {
        self.state.clone()
    }

    /// True once the task has ended.
    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Wait for the run to end.
    pub async fn join(self) -> AppResult<RunOutcome> {
        self.join
            .await
            .map_err(|e| DaqError::Task(e.to_string()))?
    }
}

/// Executes one calibration run.
pub struct SequenceController {
    settings: RunSettings,
    run_id: RunId,
    events: EventSender,
    store: RunStore,
    retry: RetryPolicy,
    src: Station,
    dvm12: Station,
    dvm3: Station,
    dvmt: Station,
    iv_box: Station,
    gmh: ProbeStation,
    gmh_room: ProbeStation,
    record: RunRecord,
    progress: Progress,
    row: usize,
    state: Arc<watch::Sender<RunState>>,
}

impl SequenceController {
    /// Prepare a run.
    ///
    /// Fails if the settings are invalid or the registry does not bind every role.
    /// The controller takes over the registry's devices for the run.
    pub fn new(
        settings: RunSettings,
        registry: InstrumentRegistry,
        events: EventSender,
    ) -> AppResult<Self> {
        settings.validate()?;
        registry.validate_complete()?;

        let run_id = match &settings.run_id {
            Some(id) if !id.trim().is_empty() => RunId::new(id.clone()),
            _ => RunId::generate(
                env!("CARGO_PKG_VERSION"),
                &settings.duc_name,
                settings.duc_gain,
                settings.rs,
                Local::now(),
            ),
        };

        let station = |role: Role| -> AppResult<Station> {
            Ok(Station::new(role, registry.instrument(role)?, events.clone()))
        };
        let probe = |role: Role| -> AppResult<ProbeStation> {
            Ok(ProbeStation::new(role, registry.probe(role)?, events.clone()))
        };
        let src = station(Role::Src)?;
        let dvm12 = station(Role::Dvm12)?;
        let dvm3 = station(Role::Dvm3)?;
        let dvmt = station(Role::Dvmt)?;
        let iv_box = station(Role::IvBox)?;
        let gmh = probe(Role::Gmh)?;
        let gmh_room = probe(Role::GmhRoom)?;

        let record = RunRecord {
            comment: settings.comment.clone(),
            rs: settings.rs,
            duc_gain: settings.duc_gain,
            settle_delay: settings.settle_delay_secs,
            vset_delay: settings.delays.vset_secs,
            azero_delay: settings.delays.azero_secs,
            dvm12_init: dvm12.device().init_string().to_string(),
            dvm3_init: dvm3.device().init_string().to_string(),
            instruments: registry.descriptions(),
            nreads: settings.nreads,
            ..Default::default()
        };

        let (state, _) = watch::channel(RunState::Idle);
        Ok(Self {
            store: RunStore::new(settings.data_file.clone()),
            progress: Progress::new(settings.nreads),
            retry: RetryPolicy::default(),
            settings,
            run_id,
            events,
            src,
            dvm12,
            dvm3,
            dvmt,
            iv_box,
            gmh,
            gmh_room,
            record,
            row: 1,
            state: Arc::new(state),
        })
    }

    /// Override the run-file write retry policy.
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    /// Identifier the run will be stored under.
    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    /// Start the run on a new tokio task.
    ///
    /// If the run task panics, a supervising task still drives the source to
    /// its safe state and reports the run as failed.
    pub fn spawn(self) -> RunHandle {
        let (abort, signal) = abort_pair();
        let state = self.state.subscribe();
        let recovery = PanicRecovery {
            run_id: self.run_id.clone(),
            source: self.src.device().clone(),
            events: self.events.clone(),
            state: self.state.clone(),
        };
        let run = tokio::spawn(self.run(signal));
        let join = tokio::spawn(async move {
            match run.await {
                Ok(result) => result,
                Err(e) => Err(recovery.recover(e).await),
            }
        });
        RunHandle { join, abort, state }
    }

    /// Execute the run on the current task.
    pub async fn run(mut self, mut signal: AbortSignal) -> AppResult<RunOutcome> {
        info!("Run '{}' started", self.run_id);
        self.events.emit(RunEvent::ClearPlot);

        match self.execute(&mut signal).await {
            Ok(()) => self.finish().await,
            Err(DaqError::Aborted) => Ok(self.abort_run().await),
            Err(e) => {
                self.fail(&e).await;
                Err(e)
            }
        }
    }

    fn transition(&mut self, next: RunState) {
        let previous = self.state.send_replace(next);
        info!("Run state {} -> {}", previous, next);
    }

    async fn execute(&mut self, signal: &mut AbortSignal) -> AppResult<()> {
        self.transition(RunState::Settling);
        self.events
            .status("Waiting to settle...", StatusField::Secondary);
        signal.pause(self.settings.settle_delay_secs).await?;

        self.transition(RunState::Initializing);
        self.initialise(signal).await?;
        self.events.status("", StatusField::Both);

        self.transition(RunState::Sweeping);
        let plan = SweepPlan::new(self.settings.rs, self.settings.duc_gain);
        info!(
            "Sweep planned: {} of {} points in scope",
            plan.executed_points(),
            self.progress.max() / self.settings.nreads
        );
        for level in plan.levels() {
            signal.check()?;
            if let Some(reason) = level.skip {
                warn!("Output level {} V: {}", level.level, reason);
                self.events
                    .status(reason.to_string(), StatusField::Secondary);
                self.progress.skip_level();
                self.events.progress(self.progress.percent());
                continue;
            }
            self.events.progress(self.progress.percent());
            self.sweep_level(level, signal).await?;
        }
        Ok(())
    }

    async fn initialise(&mut self, signal: &mut AbortSignal) -> AppResult<()> {
        self.events
            .status("Initialising instruments...", StatusField::Primary);
        let init_secs = self.settings.delays.init_secs;

        for role in Role::ALL {
            let (description, live) = match role {
                Role::Gmh | Role::GmhRoom => {
                    let probe = match role {
                        Role::Gmh => &self.gmh,
                        _ => &self.gmh_room,
                    };
                    info!("{} already open", probe.description());
                    (probe.description().to_string(), probe.is_live())
                }
                _ => {
                    let station = self.station_mut(role);
                    station.open_and_init().await;
                    (station.description().to_string(), station.is_live())
                }
            };
            self.events.status(description, StatusField::Secondary);
            signal.pause_if(live, init_secs).await?;
        }

        self.events.status("Done", StatusField::Primary);
        Ok(())
    }

    fn station_mut(&mut self, role: Role) -> &mut Station {
        match role {
            Role::Src => &mut self.src,
            Role::Dvm12 => &mut self.dvm12,
            Role::Dvm3 => &mut self.dvm3,
            Role::Dvmt => &mut self.dvmt,
            _ => &mut self.iv_box,
        }
    }

    async fn sweep_level(&mut self, level: &LevelPlan, signal: &mut AbortSignal) -> AppResult<()> {
        info!(
            "Output level {} V (V1_nom = {} V, I_nom = {:e} A)",
            level.level, level.v1_nom, level.i_nom
        );
        let mut negative_v3 = None;
        for point in SweepPlan::points(level.level) {
            if point.mask_index == 0 {
                self.select_node(point.node, signal).await?;
                negative_v3 = None;
            }
            let v3 = self.measure_point(level, &point, signal).await?;
            match point.polarity {
                Polarity::Negative => negative_v3 = Some(v3),
                Polarity::Positive => check_polarity(&point, negative_v3, v3)?,
                Polarity::Zero => {}
            }
        }
        Ok(())
    }

    async fn select_node(&mut self, node: Node, signal: &mut AbortSignal) -> AppResult<()> {
        info!("Node = {}", node);
        self.events
            .status(format!("Node = {}", node), StatusField::Secondary);
        self.iv_box.command(node.switch_command()).await;
        signal
            .pause_if(self.iv_box.is_live(), self.settings.delays.node_switch_secs)
            .await
    }

    /// Measure one calibration point and record it. Returns the V3 mean.
    async fn measure_point(
        &mut self,
        level: &LevelPlan,
        point: &CalibrationPoint,
        signal: &mut AbortSignal,
    ) -> AppResult<f64> {
        let delays = self.settings.delays.clone();
        let nreads = self.settings.nreads;
        let v_out = point.v_out();
        let v1_set = point.v_in(self.settings.rs, self.settings.duc_gain);
        let node = point.node;

        debug!("Row {}: I/P test-V = {}, O/P test-V = {}", self.row, v1_set, v_out);
        self.events
            .status(format!("Row {}", self.row), StatusField::Primary);
        self.events.status(
            format!("I/P test-V = {}. O/P test-V = {}", v1_set, v_out),
            StatusField::Secondary,
        );

        if let Some(err) = self.src.check_and_clear_error().await {
            info!("Cleared {} error: \"{}\"", self.src.description(), err.trim());
        }
        signal
            .pause_if(self.src.is_live(), delays.error_check_secs)
            .await?;

        // lock ranges so the DVMs cannot autorange mid-block
        self.dvm12.command(&format!("DCV {}", level.v1_nom)).await;
        self.dvm3.command(&format!("DCV {}", level.level)).await;
        let dvms_live = self.dvm12.is_live() || self.dvm3.is_live();
        signal.pause_if(dvms_live, delays.range_secs).await?;

        self.src.set_voltage(v1_set).await;
        signal
            .pause_if(self.src.is_live(), delays.source_secs)
            .await?;
        // OPER even at 0 V, which the source would otherwise leave in standby
        self.src.enable_output().await;
        signal
            .pause_if(self.src.is_live(), delays.source_secs)
            .await?;
        signal.pause_if(self.src.is_live(), delays.vset_secs).await?;

        self.events
            .status("Preparing DVMs...", StatusField::Secondary);
        self.dvm12.command("LFREQ LINE").await;
        self.dvm3.command("LFREQ LINE").await;
        let dvms_live = self.dvm12.is_live() || self.dvm3.is_live();
        signal.pause_if(dvms_live, delays.line_freq_secs).await?;

        self.dvm12.command("AZERO ONCE").await;
        self.dvm3.command("AZERO ON").await;
        let dvms_live = self.dvm12.is_live() || self.dvm3.is_live();
        signal.pause_if(dvms_live, delays.azero_secs).await?;

        let message = format!(
            "Making {} measurements each of {} and V3 (V1_nom = {} V)",
            nreads, node, level.v1_nom
        );
        info!("{}", message);
        self.events.status(message, StatusField::Secondary);

        let node_nominal = match node {
            Node::V1 => v1_set,
            Node::V2 => 0.0,
        };
        let mut node_batch = SampleBatch::new(node.as_str(), nreads);
        let mut v3_batch = SampleBatch::new("V3", nreads);
        for _ in 0..nreads {
            let (value, synthetic) = match self.dvm12.read_value().await {
                Some(v) => (v, false),
                None => (
                    simulated_reading(node_nominal, voltmeter_spread(v1_set)),
                    true,
                ),
            };
            let at = Utc::now();
            let (v3, v3_synthetic) = match self.dvm3.read_value().await {
                Some(v) => (v, false),
                None => (simulated_reading(v_out, voltmeter_spread(v_out)), true),
            };
            node_batch.push(value, at, synthetic);
            v3_batch.push(v3, at, v3_synthetic);

            self.progress.tick();
            self.events.progress(self.progress.percent());
            signal.check()?;
        }
        signal.pause(delays.post_read_secs).await?;

        let input = aggregate(&node_batch, nreads)?;
        let output = aggregate(&v3_batch, nreads)?;
        info!("V12m[{}] = {:.6}", node, input.mean);
        self.emit_reading(ReadingChannel::Input(node), &input);
        let input_range = range_readback(&mut self.dvm12, level.v1_nom.abs()).await?;

        // hold the results on screen before they are replaced
        signal.pause(delays.display_secs).await?;

        self.emit_reading(ReadingChannel::Output, &output);
        let (t_gmh, t_gmh_synthetic) = self.gmh.measure(Quantity::Temperature).await;
        let output_range = range_readback(&mut self.dvm3, level.level).await?;
        signal.check()?;

        self.events
            .status("Recording room conditions", StatusField::Secondary);
        let (room_t, t_synthetic) = self.gmh_room.measure(Quantity::Temperature).await;
        let (room_p, p_synthetic) = self.gmh_room.measure(Quantity::Pressure).await;
        let (room_rh, rh_synthetic) = self
            .gmh_room
            .measure(Quantity::RelativeHumidity)
            .await;

        let (pt_dvm, pt_dvm_synthetic) = match self.dvmt.read_value().await {
            Some(v) => (v, false),
            None => (simulated_reading(PT_DVM_NOMINAL, PT_DVM_SPREAD), true),
        };

        self.record.push_row(RecordRow {
            node,
            nom_vout: v_out,
            input,
            input_range,
            output,
            output_range,
            t_gmh,
            pt_dvm,
            room_t,
            room_p,
            room_rh,
            pt_dvm_synthetic,
            t_gmh_synthetic,
            room_synthetic: t_synthetic || p_synthetic || rh_synthetic,
            source_synthetic: !self.src.is_live(),
            switch_synthetic: !self.iv_box.is_live(),
        });
        self.events.emit(RunEvent::PlotPoints(PlotPointsEvent {
            times: node_batch.timestamps().to_vec(),
            node_values: node_batch.values().to_vec(),
            v3_values: v3_batch.values().to_vec(),
            clear: self.row == 1,
            node,
        }));

        signal.pause(delays.row_secs).await?;
        self.row += 1;
        Ok(output.mean)
    }

    fn emit_reading(&self, channel: ReadingChannel, block: &AggregatedBlock) {
        self.events.emit(RunEvent::Reading(ReadingEvent {
            channel,
            mean: block.mean,
            sd: block.sd,
            time: block.formatted_time(),
            row: self.row,
        }));
    }

    async fn safe_state(&mut self) {
        drive_to_safe_state(self.src.device().as_ref()).await;
    }

    async fn finish(mut self) -> AppResult<RunOutcome> {
        self.transition(RunState::Finishing);
        info!(
            "Adding run '{}' to {}",
            self.run_id,
            self.store.path().display()
        );
        let saved = self.persist().await;
        self.safe_state().await;

        self.progress.complete();
        self.events.progress(self.progress.percent());
        match &saved {
            Ok(()) => self
                .events
                .status("_________RUN COMPLETED_________", StatusField::Primary),
            Err(e) => {
                error!("Run '{}' completed but was not saved: {}", self.run_id, e);
                self.events
                    .status(format!("RUN COMPLETED, NOT SAVED: {}", e), StatusField::Primary)
            }
        }
        self.events.status("", StatusField::Secondary);
        self.events
            .emit(RunEvent::Finished(RunFinishedEvent { aborted: false }));
        self.transition(RunState::Terminal);

        let record = std::mem::take(&mut self.record);
        match saved {
            Ok(()) => Ok(RunOutcome::Completed {
                run_id: self.run_id,
                record,
            }),
            Err(e) => Err(DaqError::Unsaved {
                run_id: self.run_id.to_string(),
                record: Box::new(record),
                source: Box::new(e),
            }),
        }
    }

    async fn persist(&self) -> AppResult<()> {
        let store = self.store.clone();
        let run_id = self.run_id.clone();
        let record = self.record.clone();
        retry_blocking(&self.retry, "Saving run file", move || {
            store.merge_and_save(&run_id, record.clone()).map(|_| ())
        })
        .await
    }

    async fn abort_run(mut self) -> RunOutcome {
        self.transition(RunState::Aborting);
        warn!(
            "Run '{}' aborted after {} row(s)",
            self.run_id,
            self.record.rows()
        );
        self.safe_state().await;

        self.progress.complete();
        self.events.progress(self.progress.percent());
        self.events.status("RUN ABORTED", StatusField::Primary);
        self.events.status("", StatusField::Secondary);
        self.events
            .emit(RunEvent::Finished(RunFinishedEvent { aborted: true }));
        self.transition(RunState::Terminal);

        RunOutcome::Aborted {
            run_id: self.run_id,
            partial: self.record,
        }
    }

    async fn fail(&mut self, err: &DaqError) {
        self.transition(RunState::Aborting);
        error!("Run '{}' failed: {}", self.run_id, err);
        self.safe_state().await;

        self.events
            .status(format!("RUN FAILED: {}", err), StatusField::Primary);
        self.events.status("", StatusField::Secondary);
        self.events
            .emit(RunEvent::Finished(RunFinishedEvent { aborted: true }));
        self.transition(RunState::Terminal);
    }
}

/// Drive the source to 0 V and standby. Runs on every exit path, so failures
/// are logged rather than propagated.
async fn drive_to_safe_state(source: &dyn Instrument) {
    info!("Source to 0 V, standby");
    if let Err(e) = source.set_voltage(0.0).await {
        error!("Could not set {} to 0 V: {:#}", source.description(), e);
    }
    if let Err(e) = source.disable_output().await {
        error!("Could not put {} in standby: {:#}", source.description(), e);
    }
}

/// What the supervising task needs to shut down after the run task panicked.
struct PanicRecovery {
    run_id: RunId,
    source: Arc<dyn Instrument>,
    events: EventSender,
    state: Arc<watch::Sender<RunState>>,
}

impl PanicRecovery {
    async fn recover(self, err: JoinError) -> DaqError {
        self.state.send_replace(RunState::Aborting);
        error!("Run '{}' task failed: {}", self.run_id, err);
        drive_to_safe_state(self.source.as_ref()).await;

        self.events
            .status(format!("RUN FAILED: {}", err), StatusField::Primary);
        self.events.status("", StatusField::Secondary);
        self.events
            .emit(RunEvent::Finished(RunFinishedEvent { aborted: true }));
        self.state.send_replace(RunState::Terminal);
        DaqError::Task(err.to_string())
    }
}

/// Read back a voltmeter's range and check it covers `nominal`.
///
/// A demo, degraded or unreadable voltmeter records a range of 0.
async fn range_readback(station: &mut Station, nominal: f64) -> AppResult<f64> {
    if !station.is_live() {
        return Ok(0.0);
    }
    let Some(reply) = station.command("RANGE?").await else {
        return Ok(0.0);
    };
    match reply.trim().parse::<f64>() {
        Ok(range) if range >= nominal => Ok(range),
        Ok(range) => Err(DaqError::RangeReadback {
            channel: station.role().to_string(),
            range,
            nominal,
        }),
        Err(e) => {
            station.degrade(&format!("unreadable range '{}': {}", reply.trim(), e));
            Ok(0.0)
        }
    }
}

/// The two non-zero mask points of a block must give outputs of opposite sign.
fn check_polarity(point: &CalibrationPoint, negative: Option<f64>, positive: f64) -> AppResult<()> {
    match negative {
        Some(negative) if negative * positive >= 0.0 => Err(DaqError::PolaritySign {
            node: point.node.to_string(),
            level: point.output_level,
            negative,
            positive,
        }),
        _ => Ok(()),
    }
}
