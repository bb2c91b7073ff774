//! Common helpers for sequence controller integration tests.

#![allow(dead_code)] // not every test file uses every helper

use std::path::Path;

use ivy_daq::config::{DelaySettings, RunSettings};
use ivy_daq::messages::{EventReceiver, RunEvent};

/// Mid-range DUC: every output level is in scope.
pub const RS: f64 = 1e5;
pub const GAIN: f64 = 1e6;

/// Settings with a fixed run id and no settle delays.
pub fn fast_settings(data_file: impl AsRef<Path>) -> RunSettings {
    let mut settings = RunSettings::new(RS, GAIN, data_file.as_ref());
    settings.run_id = Some("IVY.test run".to_string());
    settings.delays = DelaySettings::none();
    settings
}

/// Receive every event until the controller drops its senders.
pub async fn drain(rx: &mut EventReceiver) -> Vec<RunEvent> {
    let mut events = Vec::new();
    while let Some(event) = rx.recv().await {
        events.push(event);
    }
    events
}

/// Progress percentages in emission order.
pub fn progress_values(events: &[RunEvent]) -> Vec<f64> {
    events
        .iter()
        .filter_map(|e| match e {
            RunEvent::Progress(p) => Some(p.percent),
            _ => None,
        })
        .collect()
}

/// Status messages in emission order.
pub fn status_messages(events: &[RunEvent]) -> Vec<String> {
    events
        .iter()
        .filter_map(|e| match e {
            RunEvent::Status(s) => Some(s.message.clone()),
            _ => None,
        })
        .collect()
}

/// Assert the last two source commands put it at 0 V then in standby.
pub fn assert_safe_state(src_commands: &[String]) {
    let n = src_commands.len();
    assert!(n >= 2, "source received {:?}", src_commands);
    assert_eq!(src_commands[n - 2], "set_voltage 0");
    assert_eq!(src_commands[n - 1], "disable_output");
}
