//! Simulated calibration bench.
//!
//! Provides an in-process stand-in for the whole rig: a voltage source driving the
//! DUC input, a relay box selecting node V1 or V2, voltmeters on the input node, the
//! DUC output and the Pt-100 sensor, plus the two environmental probes.
//!
//! All devices share one [`RigState`] so that the voltmeters see what the source is
//! driving. The DUC is modelled as an ideal inverting converter:
//!
//! ```text
//! V1 = source output, V2 ≈ 0 (virtual earth), V3 = -V1 * gain / Rs
//! ```
//!
//! Every command is logged so tests can check what reached the hardware, and faults
//! can be injected per role to exercise the controller's degradation paths.

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use rand::Rng;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

use super::{Binding, InitStatus, Instrument, InstrumentRegistry, Probe, Quantity, Role};

/// Standard DC voltage ranges of the simulated voltmeters.
const DCV_RANGES: [f64; 5] = [0.1, 1.0, 10.0, 100.0, 1000.0];

/// Faults that can be injected into the simulated bench.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RigFault {
    /// Every `read()` on the role fails.
    ReadError(Role),
    /// Every command on the role fails.
    CommandError(Role),
    /// DVM3 reports the magnitude of the output, losing its sign.
    RectifiedOutput,
    /// The role's voltmeter always reports this range.
    RangeStuck(Role, f64),
}

/// One command that reached a simulated device.
#[derive(Debug, Clone, PartialEq)]
pub struct LoggedCommand {
    /// Role of the device
    pub role: Role,
    /// Operation and argument, e.g. `"set_voltage 0"`
    pub command: String,
}

/// Shared electrical state of the bench.
#[derive(Debug)]
pub struct RigState {
    rs: f64,
    gain: f64,
    source_volts: f64,
    output_enabled: bool,
    node: u8,
    dvm12_range: f64,
    dvm3_range: f64,
    faults: Vec<RigFault>,
    log: Vec<LoggedCommand>,
}

impl RigState {
    fn node_voltage(&self) -> f64 {
        let v1 = if self.output_enabled {
            self.source_volts
        } else {
            0.0
        };
        match self.node {
            2 => 0.0,
            _ => v1,
        }
    }

    fn output_voltage(&self) -> f64 {
        let v1 = if self.output_enabled {
            self.source_volts
        } else {
            0.0
        };
        let v3 = -v1 * self.gain / self.rs;
        if self.faults.contains(&RigFault::RectifiedOutput) {
            v3.abs()
        } else {
            v3
        }
    }

    fn stuck_range(&self, role: Role) -> Option<f64> {
        self.faults.iter().find_map(|f| match f {
            RigFault::RangeStuck(r, range) if *r == role => Some(*range),
            _ => None,
        })
    }

    fn has_fault(&self, fault: RigFault) -> bool {
        self.faults.contains(&fault)
    }
}

fn noisy(value: f64) -> f64 {
    let scale = 1.0e-6 * value.abs() + 1.0e-7;
    value + rand::thread_rng().gen_range(-scale..=scale)
}

fn range_for(volts: f64) -> f64 {
    DCV_RANGES
        .iter()
        .copied()
        .find(|r| *r >= volts.abs())
        .unwrap_or(DCV_RANGES[DCV_RANGES.len() - 1])
}

/// A simulated command/response device bound to one role.
pub struct SimInstrument {
    role: Role,
    description: String,
    init_string: String,
    demo: AtomicBool,
    state: Arc<Mutex<RigState>>,
}

impl SimInstrument {
    fn log(&self, state: &mut RigState, command: String) -> Result<()> {
        state.log.push(LoggedCommand {
            role: self.role,
            command: command.clone(),
        });
        if state.has_fault(RigFault::CommandError(self.role)) {
            bail!("{}: no response to '{}'", self.description, command);
        }
        Ok(())
    }

    fn demo_reply(&self, cmd: &str) -> String {
        format!("{} - DEMO resp. to {}.", self.description, cmd)
    }
}

#[async_trait]
impl Instrument for SimInstrument {
    fn description(&self) -> &str {
        &self.description
    }

    fn is_demo(&self) -> bool {
        self.demo.load(Ordering::SeqCst)
    }

    fn init_string(&self) -> &str {
        &self.init_string
    }

    async fn open(&self) -> bool {
        let mut state = self.state.lock().await;
        state.log.push(LoggedCommand {
            role: self.role,
            command: "open".to_string(),
        });
        !self.is_demo()
    }

    async fn close(&self) {
        let mut state = self.state.lock().await;
        state.log.push(LoggedCommand {
            role: self.role,
            command: "close".to_string(),
        });
    }

    async fn init(&self) -> Result<InitStatus> {
        if self.is_demo() {
            return Ok(InitStatus::Demo);
        }
        let mut state = self.state.lock().await;
        self.log(&mut state, format!("init {}", self.init_string))?;
        if self.init_string.is_empty() {
            Ok(InitStatus::NothingToSend)
        } else {
            Ok(InitStatus::Initialised)
        }
    }

    async fn set_voltage(&self, volts: f64) -> Result<()> {
        let mut state = self.state.lock().await;
        self.log(&mut state, format!("set_voltage {}", volts))?;
        match self.role {
            Role::Src => state.source_volts = volts,
            Role::Dvm12 => state.dvm12_range = range_for(volts),
            Role::Dvm3 => state.dvm3_range = range_for(volts),
            _ => bail!("Invalid function for {}", self.description),
        }
        Ok(())
    }

    async fn send_command(&self, cmd: &str) -> Result<String> {
        if self.is_demo() {
            return Ok(self.demo_reply(cmd));
        }
        let mut state = self.state.lock().await;
        self.log(&mut state, cmd.to_string())?;

        match (self.role, cmd.trim()) {
            (Role::IvBox, "1") => state.node = 1,
            (Role::IvBox, "2") => state.node = 2,
            (Role::Dvm12 | Role::Dvm3, "RANGE?") => {
                let range = state.stuck_range(self.role).unwrap_or(match self.role {
                    Role::Dvm12 => state.dvm12_range,
                    _ => state.dvm3_range,
                });
                return Ok(format!("{:E}", range));
            }
            (Role::Dvm12 | Role::Dvm3, c) if c.starts_with("DCV ") => {
                let volts: f64 = c[4..]
                    .trim()
                    .parse()
                    .map_err(|e| anyhow!("{}: bad range '{}': {}", self.description, c, e))?;
                match self.role {
                    Role::Dvm12 => state.dvm12_range = range_for(volts),
                    _ => state.dvm3_range = range_for(volts),
                }
            }
            _ => {}
        }
        Ok(String::new())
    }

    async fn read(&self) -> Result<String> {
        if self.is_demo() {
            return Ok(format!("{} - DEMO resp.", self.description));
        }
        let mut state = self.state.lock().await;
        self.log(&mut state, "read".to_string())?;
        if state.has_fault(RigFault::ReadError(self.role)) {
            bail!("{}: read timed out", self.description);
        }
        let value = match self.role {
            Role::Dvm12 => noisy(state.node_voltage()),
            Role::Dvm3 => noisy(state.output_voltage()),
            Role::Dvmt => noisy(108.0),
            _ => bail!("Invalid function for {}", self.description),
        };
        Ok(format!("{:E}", value))
    }

    async fn enable_output(&self) -> Result<()> {
        if self.role != Role::Src {
            bail!("Invalid function for {}", self.description);
        }
        let mut state = self.state.lock().await;
        self.log(&mut state, "enable_output".to_string())?;
        state.output_enabled = true;
        Ok(())
    }

    async fn disable_output(&self) -> Result<()> {
        if self.role != Role::Src {
            bail!("Invalid function for {}", self.description);
        }
        let mut state = self.state.lock().await;
        self.log(&mut state, "disable_output".to_string())?;
        state.output_enabled = false;
        Ok(())
    }

    async fn check_and_clear_error(&self) -> Result<String> {
        if self.is_demo() {
            return Ok("0".to_string());
        }
        let mut state = self.state.lock().await;
        self.log(&mut state, "check_and_clear_error".to_string())?;
        Ok("0,No Error".to_string())
    }
}

/// A simulated environmental probe.
pub struct SimProbe {
    role: Role,
    description: String,
    demo: AtomicBool,
    state: Arc<Mutex<RigState>>,
}

#[async_trait]
impl Probe for SimProbe {
    fn description(&self) -> &str {
        &self.description
    }

    fn is_demo(&self) -> bool {
        self.demo.load(Ordering::SeqCst)
    }

    async fn measure(&self, quantity: Quantity) -> Result<(f64, String)> {
        let mut state = self.state.lock().await;
        state.log.push(LoggedCommand {
            role: self.role,
            command: format!("measure {}", quantity.alias()),
        });
        if state.has_fault(RigFault::ReadError(self.role)) {
            bail!("{}: sensor not responding", self.description);
        }
        let reading = match (self.role, quantity) {
            (Role::Gmh, Quantity::Temperature) => (20.51, "deg C"),
            (_, Quantity::Temperature) => (20.83, "deg C"),
            (_, Quantity::Pressure) => (1013.2, "hPa"),
            (_, Quantity::RelativeHumidity) => (45.3, "%RH"),
        };
        Ok((reading.0, reading.1.to_string()))
    }
}

/// Handle to a complete simulated bench.
#[derive(Clone)]
pub struct SimulatedRig {
    state: Arc<Mutex<RigState>>,
    source: Arc<SimInstrument>,
    dvm12: Arc<SimInstrument>,
    dvm3: Arc<SimInstrument>,
    dvmt: Arc<SimInstrument>,
    iv_box: Arc<SimInstrument>,
    gmh: Arc<SimProbe>,
    gmh_room: Arc<SimProbe>,
}

impl SimulatedRig {
    /// Build a bench whose DUC has the given series resistance and gain.
    pub fn new(rs: f64, gain: f64) -> Self {
        let state = Arc::new(Mutex::new(RigState {
            rs,
            gain,
            source_volts: 0.0,
            output_enabled: false,
            node: 1,
            dvm12_range: 1000.0,
            dvm3_range: 1000.0,
            faults: Vec::new(),
            log: Vec::new(),
        }));
        let instrument = |role: Role, description: &str, init_string: &str| {
            Arc::new(SimInstrument {
                role,
                description: description.to_string(),
                init_string: init_string.to_string(),
                demo: AtomicBool::new(false),
                state: state.clone(),
            })
        };
        let probe = |role: Role, description: &str| {
            Arc::new(SimProbe {
                role,
                description: description.to_string(),
                demo: AtomicBool::new(false),
                state: state.clone(),
            })
        };

        Self {
            source: instrument(Role::Src, "SRC_F5520A", "*RST"),
            dvm12: instrument(Role::Dvm12, "DVM_3458A:s/n452", "DCV AUTO; NPLC 20"),
            dvm3: instrument(Role::Dvm3, "DVM_3458A:s/n382", "DCV AUTO; NPLC 20"),
            dvmt: instrument(Role::Dvmt, "DVM_34401A:s/n976", "FUNC OHMF; OHMF 100"),
            iv_box: instrument(Role::IvBox, "IV_box", ""),
            gmh: probe(Role::Gmh, "GMH:s/n627"),
            gmh_room: probe(Role::GmhRoom, "GMH:s/n367"),
            state,
        }
    }

    /// The voltage source.
    pub fn source(&self) -> Arc<dyn Instrument> {
        self.source.clone()
    }

    /// The output (V3) voltmeter.
    pub fn dvm3(&self) -> Arc<dyn Instrument> {
        self.dvm3.clone()
    }

    /// Registry binding every role to this bench.
    pub fn registry(&self) -> InstrumentRegistry {
        let mut registry = InstrumentRegistry::new();
        let bindings = [
            (Role::Src, Binding::Source(self.source.clone())),
            (Role::Dvm12, Binding::Voltmeter(self.dvm12.clone())),
            (Role::Dvm3, Binding::Voltmeter(self.dvm3.clone())),
            (Role::Dvmt, Binding::Voltmeter(self.dvmt.clone())),
            (Role::Gmh, Binding::Probe(self.gmh.clone())),
            (Role::GmhRoom, Binding::Probe(self.gmh_room.clone())),
            (Role::IvBox, Binding::Switch(self.iv_box.clone())),
        ];
        for (role, binding) in bindings {
            // kinds are fixed above and always match
            let _ = registry.bind(role, binding);
        }
        registry
    }

    /// Put one role into demo mode.
    pub fn set_demo(&self, role: Role, demo: bool) {
        let flag = match role {
            Role::Src => &self.source.demo,
            Role::Dvm12 => &self.dvm12.demo,
            Role::Dvm3 => &self.dvm3.demo,
            Role::Dvmt => &self.dvmt.demo,
            Role::IvBox => &self.iv_box.demo,
            Role::Gmh => &self.gmh.demo,
            Role::GmhRoom => &self.gmh_room.demo,
        };
        flag.store(demo, Ordering::SeqCst);
    }

    /// Put every role into demo mode.
    pub fn set_all_demo(&self) {
        for role in Role::ALL {
            self.set_demo(role, true);
        }
    }

    /// Inject a fault.
    pub async fn inject(&self, fault: RigFault) {
        self.state.lock().await.faults.push(fault);
    }

    /// Commands received so far by one role.
    pub async fn commands(&self, role: Role) -> Vec<String> {
        self.state
            .lock()
            .await
            .log
            .iter()
            .filter(|c| c.role == role)
            .map(|c| c.command.clone())
            .collect()
    }

    /// Current source setpoint and output state.
    pub async fn source_state(&self) -> (f64, bool) {
        let state = self.state.lock().await;
        (state.source_volts, state.output_enabled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn output_follows_inverting_model() {
        let rig = SimulatedRig::new(1e5, 1e6);
        let source = rig.source();
        source.set_voltage(0.1).await.unwrap();
        source.enable_output().await.unwrap();

        let v3: f64 = rig.dvm3().read().await.unwrap().parse().unwrap();
        assert!((v3 + 1.0).abs() < 1e-4, "V3 = {}", v3);
    }

    #[tokio::test]
    async fn node_two_sits_at_virtual_earth() {
        let rig = SimulatedRig::new(1e5, 1e6);
        let registry = rig.registry();
        rig.source().set_voltage(0.5).await.unwrap();
        rig.source().enable_output().await.unwrap();
        registry
            .instrument(Role::IvBox)
            .unwrap()
            .send_command("2")
            .await
            .unwrap();

        let dvm12 = registry.instrument(Role::Dvm12).unwrap();
        let v2: f64 = dvm12.read().await.unwrap().parse().unwrap();
        assert!(v2.abs() < 1e-6);
    }

    #[tokio::test]
    async fn range_lock_and_readback() {
        let rig = SimulatedRig::new(1e5, 1e6);
        let dvm3 = rig.dvm3();
        dvm3.send_command("DCV 1").await.unwrap();
        let range: f64 = dvm3.send_command("RANGE?").await.unwrap().parse().unwrap();
        assert_eq!(range, 1.0);

        dvm3.send_command("DCV 0.05").await.unwrap();
        let range: f64 = dvm3.send_command("RANGE?").await.unwrap().parse().unwrap();
        assert_eq!(range, 0.1);
    }

    #[tokio::test]
    async fn demo_device_answers_with_placeholder() {
        let rig = SimulatedRig::new(1e5, 1e6);
        rig.set_demo(Role::Dvm3, true);
        let dvm3 = rig.dvm3();
        assert!(!dvm3.open().await);
        let reply = dvm3.read().await.unwrap();
        assert!(reply.contains("DEMO"));
        assert!(reply.parse::<f64>().is_err());
    }

    #[tokio::test]
    async fn injected_read_fault_surfaces_as_error() {
        let rig = SimulatedRig::new(1e5, 1e6);
        rig.inject(RigFault::ReadError(Role::Dvm3)).await;
        assert!(rig.dvm3().read().await.is_err());
    }

    #[tokio::test]
    async fn voltmeter_has_no_output_terminals() {
        let rig = SimulatedRig::new(1e5, 1e6);
        assert!(rig.dvm3().enable_output().await.is_err());
    }

    #[tokio::test]
    async fn commands_are_logged_per_role() {
        let rig = SimulatedRig::new(1e5, 1e6);
        rig.source().set_voltage(0.0).await.unwrap();
        rig.source().disable_output().await.unwrap();
        assert_eq!(
            rig.commands(Role::Src).await,
            vec!["set_voltage 0".to_string(), "disable_output".to_string()]
        );
        assert!(rig.commands(Role::Dvm3).await.is_empty());
    }
}
