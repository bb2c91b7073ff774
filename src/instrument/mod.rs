//! Instrument capabilities and the role registry.
//!
//! The calibration bench is described by seven fixed roles. Each role is bound to a
//! device implementing one of two capabilities:
//!
//! - [`Instrument`]: command/response devices (voltage source, voltmeters, switch box)
//! - [`Probe`]: environmental sensors returning a value and unit per quantity
//!
//! Wire protocols (VISA, GPIB, vendor DLLs) live behind these traits and are not part
//! of this crate. A device that cannot be reached is expected to report
//! [`Instrument::is_demo`] and answer with synthetic replies.
//!
//! # Registry
//!
//! [`InstrumentRegistry`] is constructed once by the caller and handed to the
//! sequence controller, which has exclusive use of it for the duration of a run.
//! Binding a role checks that the device variant matches the role's [`RoleKind`].

pub mod sim;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::error::{AppResult, DaqError};

/// Function served by a role on the bench.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Role {
    /// Calibrator driving the DUC input.
    #[serde(rename = "SRC")]
    Src,
    /// Voltmeter on the selected input node (V1 or V2).
    #[serde(rename = "DVM12")]
    Dvm12,
    /// Voltmeter on the DUC output (V3).
    #[serde(rename = "DVM3")]
    Dvm3,
    /// Voltmeter reading the Pt-100 resistance near the input resistors.
    #[serde(rename = "DVMT")]
    Dvmt,
    /// Temperature probe at the DUC.
    #[serde(rename = "GMH")]
    Gmh,
    /// Room temperature, pressure and humidity probe.
    #[serde(rename = "GMHroom")]
    GmhRoom,
    /// Relay box selecting the input node.
    #[serde(rename = "IVbox")]
    IvBox,
}

impl Role {
    /// All roles in initialisation order.
    pub const ALL: [Role; 7] = [
        Role::Src,
        Role::Dvm12,
        Role::Dvm3,
        Role::Dvmt,
        Role::Gmh,
        Role::GmhRoom,
        Role::IvBox,
    ];

    /// Name used in persisted records and status text.
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Src => "SRC",
            Role::Dvm12 => "DVM12",
            Role::Dvm3 => "DVM3",
            Role::Dvmt => "DVMT",
            Role::Gmh => "GMH",
            Role::GmhRoom => "GMHroom",
            Role::IvBox => "IVbox",
        }
    }

    /// The kind of device this role must be bound to.
    pub fn kind(&self) -> RoleKind {
        match self {
            Role::Src => RoleKind::Source,
            Role::Dvm12 | Role::Dvm3 | Role::Dvmt => RoleKind::Voltmeter,
            Role::Gmh | Role::GmhRoom => RoleKind::Probe,
            Role::IvBox => RoleKind::Switch,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Capability class a role belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RoleKind {
    /// Programmable voltage source
    Source,
    /// Digital multimeter
    Voltmeter,
    /// Environmental probe
    Probe,
    /// Relay switch box
    Switch,
}

impl fmt::Display for RoleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Source => write!(f, "source"),
            Self::Voltmeter => write!(f, "voltmeter"),
            Self::Probe => write!(f, "probe"),
            Self::Switch => write!(f, "switch"),
        }
    }
}

/// Result of sending an instrument its initialisation string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitStatus {
    /// Init string written to the device.
    Initialised,
    /// Device has no init string configured.
    NothingToSend,
    /// Device is simulated; nothing was sent.
    Demo,
}

/// Command/response device capability.
///
/// Mirrors the operations the acquisition sequence needs from a bench instrument.
/// Not every operation is meaningful for every role: a voltmeter has no output to
/// enable. Implementations return an error for operations they do not support.
#[async_trait]
pub trait Instrument: Send + Sync {
    /// Catalogue description (e.g. `"DVM_3458A:s/n452"`).
    fn description(&self) -> &str;

    /// True while the instrument answers with synthetic replies.
    fn is_demo(&self) -> bool;

    /// Initialisation command string sent by [`Instrument::init`].
    fn init_string(&self) -> &str {
        ""
    }

    /// Open the session. Returns false if the device fell back to demo mode.
    async fn open(&self) -> bool;

    /// Close the session.
    async fn close(&self);

    /// Send the initialisation string.
    async fn init(&self) -> Result<InitStatus>;

    /// Program the output voltage (sources) or range (voltmeters).
    async fn set_voltage(&self, volts: f64) -> Result<()>;

    /// Send a raw command. Queries return the reply; writes return an empty string.
    async fn send_command(&self, cmd: &str) -> Result<String>;

    /// Trigger and fetch one reading.
    async fn read(&self) -> Result<String>;

    /// Connect the output terminals (OPER).
    async fn enable_output(&self) -> Result<()>;

    /// Disconnect the output terminals (STBY).
    async fn disable_output(&self) -> Result<()>;

    /// Fetch the last error message and clear the error queue.
    async fn check_and_clear_error(&self) -> Result<String>;
}

/// Quantity measured by a [`Probe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Quantity {
    /// Temperature
    #[serde(rename = "T")]
    Temperature,
    /// Barometric pressure
    #[serde(rename = "P")]
    Pressure,
    /// Relative humidity
    #[serde(rename = "RH")]
    RelativeHumidity,
}

impl Quantity {
    /// Short alias understood by the sensors.
    pub fn alias(&self) -> &'static str {
        match self {
            Self::Temperature => "T",
            Self::Pressure => "P",
            Self::RelativeHumidity => "RH",
        }
    }
}

/// Environmental sensor capability.
#[async_trait]
pub trait Probe: Send + Sync {
    /// Catalogue description.
    fn description(&self) -> &str;

    /// True while the probe answers with synthetic values.
    fn is_demo(&self) -> bool;

    /// Measure a quantity, returning `(value, unit)`.
    async fn measure(&self, quantity: Quantity) -> Result<(f64, String)>;
}

/// A device bound to a role.
#[derive(Clone)]
pub enum Binding {
    /// Voltage source
    Source(Arc<dyn Instrument>),
    /// Digital multimeter
    Voltmeter(Arc<dyn Instrument>),
    /// Environmental probe
    Probe(Arc<dyn Probe>),
    /// Relay switch box
    Switch(Arc<dyn Instrument>),
}

impl Binding {
    /// Capability class of the bound device.
    pub fn kind(&self) -> RoleKind {
        match self {
            Binding::Source(_) => RoleKind::Source,
            Binding::Voltmeter(_) => RoleKind::Voltmeter,
            Binding::Probe(_) => RoleKind::Probe,
            Binding::Switch(_) => RoleKind::Switch,
        }
    }

    /// Description of the bound device.
    pub fn description(&self) -> &str {
        match self {
            Binding::Source(i) | Binding::Voltmeter(i) | Binding::Switch(i) => i.description(),
            Binding::Probe(p) => p.description(),
        }
    }

    /// Demo status of the bound device.
    pub fn is_demo(&self) -> bool {
        match self {
            Binding::Source(i) | Binding::Voltmeter(i) | Binding::Switch(i) => i.is_demo(),
            Binding::Probe(p) => p.is_demo(),
        }
    }

    /// The command/response handle, if this is not a probe.
    pub fn as_instrument(&self) -> Option<Arc<dyn Instrument>> {
        match self {
            Binding::Source(i) | Binding::Voltmeter(i) | Binding::Switch(i) => Some(i.clone()),
            Binding::Probe(_) => None,
        }
    }

    /// The probe handle, if this is a probe.
    pub fn as_probe(&self) -> Option<Arc<dyn Probe>> {
        match self {
            Binding::Probe(p) => Some(p.clone()),
            _ => None,
        }
    }
}

impl fmt::Debug for Binding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Binding")
            .field("kind", &self.kind())
            .field("description", &self.description())
            .finish()
    }
}

/// Role → device bindings for one bench.
#[derive(Debug, Clone, Default)]
pub struct InstrumentRegistry {
    bindings: BTreeMap<Role, Binding>,
}

impl InstrumentRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a device to a role, replacing any previous binding.
    ///
    /// Fails if the device kind does not match the role.
    pub fn bind(&mut self, role: Role, binding: Binding) -> AppResult<()> {
        if binding.kind() != role.kind() {
            return Err(DaqError::RoleMismatch {
                role,
                expected: role.kind(),
            });
        }
        self.bindings.insert(role, binding);
        Ok(())
    }

    /// Builder form of [`InstrumentRegistry::bind`].
    pub fn with(mut self, role: Role, binding: Binding) -> AppResult<Self> {
        self.bind(role, binding)?;
        Ok(self)
    }

    /// Binding for a role.
    pub fn get(&self, role: Role) -> AppResult<&Binding> {
        self.bindings.get(&role).ok_or(DaqError::MissingRole(role))
    }

    /// Command/response handle for a non-probe role.
    pub fn instrument(&self, role: Role) -> AppResult<Arc<dyn Instrument>> {
        self.get(role)?
            .as_instrument()
            .ok_or(DaqError::RoleMismatch {
                role,
                expected: role.kind(),
            })
    }

    /// Probe handle for a probe role.
    pub fn probe(&self, role: Role) -> AppResult<Arc<dyn Probe>> {
        self.get(role)?.as_probe().ok_or(DaqError::RoleMismatch {
            role,
            expected: RoleKind::Probe,
        })
    }

    /// Check that every role is bound.
    pub fn validate_complete(&self) -> AppResult<()> {
        match Role::ALL.iter().find(|r| !self.bindings.contains_key(r)) {
            Some(role) => Err(DaqError::MissingRole(*role)),
            None => Ok(()),
        }
    }

    /// Role → description map for the run record.
    ///
    /// The switch box is recorded as `"IV_box"` whatever its catalogue description.
    pub fn descriptions(&self) -> BTreeMap<String, String> {
        self.bindings
            .iter()
            .map(|(role, binding)| {
                let descr = match role {
                    Role::IvBox => "IV_box".to_string(),
                    _ => binding.description().to_string(),
                };
                (role.as_str().to_string(), descr)
            })
            .collect()
    }

    /// Iterate bindings in initialisation order.
    pub fn iter(&self) -> impl Iterator<Item = (Role, &Binding)> {
        Role::ALL
            .iter()
            .filter_map(|role| self.bindings.get(role).map(|b| (*role, b)))
    }
}
