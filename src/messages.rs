//! Events sent from a running sequence to its observer.
//!
//! The controller is the only producer. Events travel over an unbounded tokio
//! mpsc channel, so delivery order matches emission order and the controller never
//! waits on a slow consumer. A dropped receiver is not an error: the run carries on
//! and its events are discarded.

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

use crate::experiment::plan::Node;

/// Status bar field a message is meant for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusField {
    /// Main status text
    Primary,
    /// Detail text
    Secondary,
    /// Both fields
    Both,
}

/// A line of status text.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusEvent {
    /// Text to display
    pub message: String,
    /// Where to display it
    pub field: StatusField,
}

/// Run progress as a percentage of the planned reads.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgressEvent {
    /// Value in `[0, 100]`
    pub percent: f64,
}

/// Channel a [`ReadingEvent`] refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadingChannel {
    /// Input node measured by DVM12
    Input(Node),
    /// DUC output measured by DVM3
    Output,
}

impl ReadingChannel {
    /// Channel name (`"V1"`, `"V2"` or `"V3"`).
    pub fn as_str(&self) -> &'static str {
        match self {
            ReadingChannel::Input(node) => node.as_str(),
            ReadingChannel::Output => "V3",
        }
    }
}

/// Aggregated result for one channel at one calibration point.
#[derive(Debug, Clone, PartialEq)]
pub struct ReadingEvent {
    /// Channel measured
    pub channel: ReadingChannel,
    /// Mean value
    pub mean: f64,
    /// Sample standard deviation
    pub sd: f64,
    /// Mean time, formatted `dd/mm/YYYY HH:MM:SS`
    pub time: String,
    /// 1-based row number in the run
    pub row: usize,
}

/// Raw readings of one calibration point for plotting.
#[derive(Debug, Clone, PartialEq)]
pub struct PlotPointsEvent {
    /// Reading timestamps
    pub times: Vec<DateTime<Utc>>,
    /// Input node readings
    pub node_values: Vec<f64>,
    /// Output readings
    pub v3_values: Vec<f64>,
    /// Discard previously plotted points first
    pub clear: bool,
    /// Input node the readings belong to
    pub node: Node,
}

/// Final event of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunFinishedEvent {
    /// True if the run ended on an abort request or a fatal error
    pub aborted: bool,
}

/// Everything a running sequence reports.
#[derive(Debug, Clone, PartialEq)]
pub enum RunEvent {
    /// Status text
    Status(StatusEvent),
    /// Progress update
    Progress(ProgressEvent),
    /// Aggregated reading
    Reading(ReadingEvent),
    /// Raw points for plotting
    PlotPoints(PlotPointsEvent),
    /// Clear the plot
    ClearPlot,
    /// Run has ended
    Finished(RunFinishedEvent),
}

impl RunEvent {
    /// Status text for one field.
    pub fn status(message: impl Into<String>, field: StatusField) -> Self {
        RunEvent::Status(StatusEvent {
            message: message.into(),
            field,
        })
    }

    /// Progress update.
    pub fn progress(percent: f64) -> Self {
        RunEvent::Progress(ProgressEvent { percent })
    }
}

/// Receiving end of a run's event stream.
pub type EventReceiver = mpsc::UnboundedReceiver<RunEvent>;

/// Sending end of a run's event stream.
#[derive(Debug, Clone)]
pub struct EventSender {
    tx: mpsc::UnboundedSender<RunEvent>,
}

impl EventSender {
    /// Queue an event. Silently dropped if the receiver has gone away.
    pub fn emit(&self, event: RunEvent) {
        let _ = self.tx.send(event);
    }

    /// Queue a status message.
    pub fn status(&self, message: impl Into<String>, field: StatusField) {
        self.emit(RunEvent::status(message, field));
    }

    /// Queue a progress update.
    pub fn progress(&self, percent: f64) {
        self.emit(RunEvent::progress(percent));
    }

    /// True once the receiver has been dropped.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Create a FIFO event channel for one run.
pub fn event_channel() -> (EventSender, EventReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (EventSender { tx }, rx)
}
