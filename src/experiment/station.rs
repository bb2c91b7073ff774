//! Per-role wrappers used by the sequence controller.
//!
//! A station forwards calls to the bound device and absorbs failures. The first
//! failure on a role degrades it for the rest of the run: no further commands are
//! sent to it and its readings are replaced by simulated values, which the
//! controller tags as synthetic in the run record.

use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::instrument::{InitStatus, Instrument, Probe, Quantity, Role};
use crate::measurement::ProbeReading;
use crate::messages::{EventSender, StatusField};

/// Reading recorded when a probe cannot be measured.
pub const NO_PROBE_READING: (f64, &str) = (0.0, "NO UNIT");

fn degrade(role: Role, description: &str, events: &EventSender, reason: &dyn fmt::Display) {
    warn!(
        "{} ({}) failed, using simulated readings for the rest of the run: {}",
        role, description, reason
    );
    events.status(
        format!("{} unavailable, readings simulated", description),
        StatusField::Secondary,
    );
}

/// A command/response device bound to a role.
pub struct Station {
    role: Role,
    device: Arc<dyn Instrument>,
    events: EventSender,
    degraded: bool,
}

impl Station {
    /// Wrap a device.
    pub fn new(role: Role, device: Arc<dyn Instrument>, events: EventSender) -> Self {
        Self {
            role,
            device,
            events,
            degraded: false,
        }
    }

    /// Role served.
    pub fn role(&self) -> Role {
        self.role
    }

    /// Description of the bound device.
    pub fn description(&self) -> &str {
        self.device.description()
    }

    /// True while the device is real and has not failed this run.
    pub fn is_live(&self) -> bool {
        !self.degraded && !self.device.is_demo()
    }

    /// True once a failure has been absorbed.
    pub fn is_degraded(&self) -> bool {
        self.degraded
    }

    /// The bound device, bypassing degradation. Used for the safe state.
    pub fn device(&self) -> &Arc<dyn Instrument> {
        &self.device
    }

    /// Stop using the device for the rest of the run.
    pub fn degrade(&mut self, reason: &dyn fmt::Display) {
        if !self.degraded {
            self.degraded = true;
            degrade(self.role, self.device.description(), &self.events, reason);
        }
    }

    fn absorb<T>(&mut self, what: &str, result: anyhow::Result<T>) -> Option<T> {
        match result {
            Ok(value) => Some(value),
            Err(e) => {
                self.degrade(&format!("{}: {:#}", what, e));
                None
            }
        }
    }

    /// Open the session and send the init string.
    pub async fn open_and_init(&mut self) {
        let descr = self.device.description().to_string();
        if self.device.open().await {
            info!("Opened {}", descr);
        } else {
            info!("{} not found, running in demo mode", descr);
        }
        let status = self.device.init().await;
        match self.absorb("init", status) {
            Some(InitStatus::Initialised) => {
                debug!("{} initialised with '{}'", descr, self.device.init_string())
            }
            Some(InitStatus::NothingToSend) => debug!("{}: no init string", descr),
            Some(InitStatus::Demo) => debug!("{}: demo, init skipped", descr),
            None => {}
        }
    }

    /// Send a raw command. `None` if the station is degraded or the command failed.
    pub async fn command(&mut self, cmd: &str) -> Option<String> {
        if self.degraded {
            return None;
        }
        let reply = self.device.send_command(cmd).await;
        self.absorb(cmd, reply)
    }

    /// Program the output voltage.
    pub async fn set_voltage(&mut self, volts: f64) {
        if self.degraded {
            return;
        }
        let result = self.device.set_voltage(volts).await;
        self.absorb("set_voltage", result);
    }

    /// Connect the output terminals.
    pub async fn enable_output(&mut self) {
        if self.degraded {
            return;
        }
        let result = self.device.enable_output().await;
        self.absorb("enable_output", result);
    }

    /// Read and clear the device error queue.
    pub async fn check_and_clear_error(&mut self) -> Option<String> {
        if self.degraded {
            return None;
        }
        let result = self.device.check_and_clear_error().await;
        self.absorb("check_and_clear_error", result)
    }

    /// Take one numeric reading.
    ///
    /// `None` means the caller must substitute a simulated value: the device is a
    /// demo device, the station is degraded, or this read failed.
    pub async fn read_value(&mut self) -> Option<f64> {
        if !self.is_live() {
            return None;
        }
        let reply = self.device.read().await;
        let reply = self.absorb("read", reply)?;
        match reply.trim().parse::<f64>() {
            Ok(value) => Some(value),
            Err(e) => {
                self.degrade(&format!("unreadable reply '{}': {}", reply.trim(), e));
                None
            }
        }
    }
}

/// An environmental probe bound to a role.
pub struct ProbeStation {
    role: Role,
    device: Arc<dyn Probe>,
    events: EventSender,
    degraded: bool,
}

impl ProbeStation {
    /// Wrap a probe.
    pub fn new(role: Role, device: Arc<dyn Probe>, events: EventSender) -> Self {
        Self {
            role,
            device,
            events,
            degraded: false,
        }
    }

    /// Description of the bound probe.
    pub fn description(&self) -> &str {
        self.device.description()
    }

    /// True while the probe is real and has not failed this run.
    pub fn is_live(&self) -> bool {
        !self.degraded && !self.device.is_demo()
    }

    /// Measure one quantity.
    ///
    /// Returns the reading and whether it is synthetic. A failed probe yields
    /// [`NO_PROBE_READING`].
    pub async fn measure(&mut self, quantity: Quantity) -> (ProbeReading, bool) {
        let fallback = || ProbeReading::new(NO_PROBE_READING.0, NO_PROBE_READING.1);
        if self.degraded {
            return (fallback(), true);
        }
        match self.device.measure(quantity).await {
            Ok((value, unit)) => (ProbeReading::new(value, unit), self.device.is_demo()),
            Err(e) => {
                self.degraded = true;
                degrade(
                    self.role,
                    self.device.description(),
                    &self.events,
                    &format!("measure {}: {:#}", quantity.alias(), e),
                );
                (fallback(), true)
            }
        }
    }
}
