//! The sequence engine.
//!
//! A [`TestProgram`] owns a [`Sequence`] of [`Step`]s. The [`Engine`] runs
//! the enabled steps for one UUT position at a time, passing each step a
//! [`Context`] with the bench devices, sensors, measurements and subtests.
//! Whatever happens in the steps, the program's safety teardown runs once
//! per run before the result is built.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{error, info, warn};

use crate::config::BenchConfig;
use crate::console::{CanTunnel, Console, ConsoleError, Dialect, ParameterTable, SharedConsole};
use crate::limits::{LimitError, SharedLimit};
use crate::measurement::{Measurement, MeasurementError, MeasurementResult};
use crate::programmer::{
    JLinkBackend, NordicBackend, PicBackend, Programmer, ProgrammerError, SharedRunner, SimRunner, SystemRunner,
};
use crate::results::{ResultCode, ResultLog, ResultsError, UutResult};
use crate::safety::SafetyManager;
use crate::sensors::instrument::{lock, InstrumentError};
use crate::sensors::{
    self, MirrorSensor, Sensor, SharedInstrument, SharedOperator, SharedRelay, SharedSensor, SharedStimulus,
};
use crate::serial::{ByteStream, HardwareSerial, SerialError, SimSerial};
use crate::signals::{Signal, SignalBus, SignalKind, SubscriptionId};
use crate::timing::{sim_clock, system_clock, SharedClock};

#[derive(Debug, Error)]
pub enum StepError {
    #[error(transparent)]
    Console(#[from] ConsoleError),
    #[error(transparent)]
    Instrument(#[from] InstrumentError),
    #[error(transparent)]
    Measurement(#[from] MeasurementError),
    #[error(transparent)]
    Programmer(#[from] ProgrammerError),
    #[error(transparent)]
    Limit(#[from] LimitError),
    #[error(transparent)]
    Serial(#[from] SerialError),
    #[error("fixture not locked: {0}")]
    Fixture(String),
    #[error("cancelled by operator")]
    Cancelled,
    #[error("panicked: {0}")]
    Panicked(String),
    #[error("no {kind} named {name}")]
    Unknown { kind: &'static str, name: String },
    #[error("{0}")]
    Failed(String),
}

impl StepError {
    fn unknown(kind: &'static str, name: &str) -> Self {
        StepError::Unknown {
            kind,
            name: name.to_string(),
        }
    }

    fn from_panic(payload: &(dyn Any + Send)) -> Self {
        let message = if let Some(text) = payload.downcast_ref::<&str>() {
            (*text).to_string()
        } else if let Some(text) = payload.downcast_ref::<String>() {
            text.clone()
        } else {
            "unknown payload".to_string()
        };
        StepError::Panicked(message)
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("program {program} failed to open: {source}")]
    Open {
        program: String,
        #[source]
        source: StepError,
    },
    #[error("program {program} failed to close: {source}")]
    Close {
        program: String,
        #[source]
        source: StepError,
    },
    #[error(transparent)]
    Results(#[from] ResultsError),
}

pub type StepFn = Box<dyn FnMut(&mut Context) -> Result<(), StepError>>;

pub struct Step {
    pub name: String,
    pub enabled: bool,
    run: StepFn,
}

impl Step {
    pub fn new<F>(name: &str, run: F) -> Self
    where
        F: FnMut(&mut Context) -> Result<(), StepError> + 'static,
    {
        Self {
            name: name.to_string(),
            enabled: true,
            run: Box::new(run),
        }
    }
}

impl fmt::Debug for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Step")
            .field("name", &self.name)
            .field("enabled", &self.enabled)
            .finish()
    }
}

#[derive(Debug, Default)]
pub struct Sequence {
    steps: Vec<Step>,
}

impl Sequence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn step<F>(mut self, name: &str, run: F) -> Self
    where
        F: FnMut(&mut Context) -> Result<(), StepError> + 'static,
    {
        self.steps.push(Step::new(name, run));
        self
    }

    pub fn push(&mut self, step: Step) {
        self.steps.push(step);
    }

    pub fn set_enabled(&mut self, name: &str, enabled: bool) -> bool {
        match self.steps.iter_mut().find(|s| s.name == name) {
            Some(step) => {
                step.enabled = enabled;
                true
            }
            None => false,
        }
    }

    pub fn enabled_names(&self) -> Vec<String> {
        self.steps.iter().filter(|s| s.enabled).map(|s| s.name.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

/// A product's test program.
pub trait TestProgram {
    fn name(&self) -> &str;

    fn sequence(&mut self) -> &mut Sequence;

    /// Build devices, sensors and measurements into the context.
    fn open(&mut self, ctx: &mut Context) -> Result<(), StepError>;

    /// Return the bench to a safe state. Runs after every run.
    fn safety(&mut self, ctx: &mut Context, safety: &mut SafetyManager);

    fn close(&mut self, _ctx: &mut Context) -> Result<(), StepError> {
        Ok(())
    }
}

/// Bench hardware, real or simulated depending on the configuration.
pub struct Devices {
    pub instruments: HashMap<String, SharedInstrument>,
    pub stimuli: HashMap<String, SharedStimulus>,
    pub relays: HashMap<String, SharedRelay>,
    pub consoles: HashMap<String, SharedConsole>,
    pub programmers: HashMap<String, Programmer>,
    pub operator: Option<SharedOperator>,
    console_order: Vec<String>,
    config: BenchConfig,
    sim_ports: HashMap<String, SimSerial>,
    sim_runner: SimRunner,
}

impl Devices {
    fn new(config: BenchConfig) -> Self {
        Self {
            instruments: HashMap::new(),
            stimuli: HashMap::new(),
            relays: HashMap::new(),
            consoles: HashMap::new(),
            programmers: HashMap::new(),
            operator: None,
            console_order: Vec::new(),
            config,
            sim_ports: HashMap::new(),
            sim_runner: SimRunner::new(),
        }
    }

    /// A port for logical name `name`. In FIFO mode every call for the same
    /// name shares one simulated buffer.
    pub fn port(&mut self, name: &str) -> Box<dyn ByteStream> {
        if self.config.fifo {
            let port = self.sim_ports.entry(name.to_string()).or_insert_with(|| SimSerial::new(name));
            return Box::new(port.clone());
        }
        let settings = self.config.port(name);
        Box::new(HardwareSerial::new(name, &settings.device, settings.baud, settings.timeout()))
    }

    /// Test-side handle on a simulated port, created on first use.
    pub fn sim_port(&mut self, name: &str) -> SimSerial {
        self.sim_ports
            .entry(name.to_string())
            .or_insert_with(|| SimSerial::new(name))
            .clone()
    }

    pub fn runner(&self) -> SharedRunner {
        if self.config.fifo {
            self.sim_runner.shared()
        } else {
            SystemRunner::shared()
        }
    }

    pub fn sim_runner(&self) -> &SimRunner {
        &self.sim_runner
    }

    /// `nrfjprog` on this bench's runner with the configured timeout.
    pub fn nordic(&self, image: &Path) -> NordicBackend {
        NordicBackend::new(self.runner(), image).timeout(self.config.programmer_timeout())
    }

    pub fn pic(&self, device: &str, image: &Path) -> PicBackend {
        PicBackend::new(self.runner(), device, image).timeout(self.config.programmer_timeout())
    }

    pub fn jlink(&self, device: &str, script: &Path) -> JLinkBackend {
        JLinkBackend::new(self.runner(), device, script).timeout(self.config.programmer_timeout())
    }

    fn insert_console(&mut self, name: &str, console: SharedConsole) {
        self.console_order.retain(|n| n != name);
        self.console_order.push(name.to_string());
        self.consoles.insert(name.to_string(), console);
    }

    /// Consoles newest first, so a tunnel closes before its gateway.
    /// Consoles inserted into the map directly follow, by name.
    pub fn consoles_for_teardown(&self) -> Vec<(&String, &SharedConsole)> {
        let mut ordered: Vec<(&String, &SharedConsole)> = self
            .console_order
            .iter()
            .rev()
            .filter_map(|name| self.consoles.get_key_value(name))
            .collect();
        let mut rest: Vec<(&String, &SharedConsole)> = self
            .consoles
            .iter()
            .filter(|(name, _)| !self.console_order.contains(*name))
            .collect();
        rest.sort_by(|a, b| a.0.cmp(b.0));
        ordered.extend(rest);
        ordered
    }

    fn clear_consoles(&mut self) {
        self.consoles.clear();
        self.console_order.clear();
    }

    pub fn instrument(&self, name: &str) -> Result<SharedInstrument, StepError> {
        self.instruments.get(name).cloned().ok_or_else(|| StepError::unknown("instrument", name))
    }

    pub fn stimulus(&self, name: &str) -> Result<SharedStimulus, StepError> {
        self.stimuli.get(name).cloned().ok_or_else(|| StepError::unknown("stimulus", name))
    }

    pub fn relay(&self, name: &str) -> Result<SharedRelay, StepError> {
        self.relays.get(name).cloned().ok_or_else(|| StepError::unknown("relay", name))
    }

    pub fn console(&self, name: &str) -> Result<SharedConsole, StepError> {
        self.consoles.get(name).cloned().ok_or_else(|| StepError::unknown("console", name))
    }

    pub fn operator(&self) -> Result<SharedOperator, StepError> {
        self.operator.clone().ok_or_else(|| StepError::unknown("operator", "operator"))
    }
}

#[derive(Default)]
pub struct Sensors {
    entries: HashMap<String, SharedSensor>,
    mirrors: HashMap<String, MirrorSensor>,
}

impl Sensors {
    pub fn add<S: Sensor + 'static>(&mut self, name: &str, sensor: S) -> SharedSensor {
        let shared = sensors::shared(sensor);
        self.entries.insert(name.to_string(), Arc::clone(&shared));
        shared
    }

    /// The mirror named `name`, created on first use.
    pub fn mirror(&mut self, name: &str) -> MirrorSensor {
        if let Some(mirror) = self.mirrors.get(name) {
            return mirror.clone();
        }
        let mirror = MirrorSensor::new(name);
        self.entries.insert(name.to_string(), sensors::shared(mirror.clone()));
        self.mirrors.insert(name.to_string(), mirror.clone());
        mirror
    }

    pub fn get(&self, name: &str) -> Option<SharedSensor> {
        self.entries.get(name).cloned()
    }

    pub fn reset_transients(&self) {
        for sensor in self.entries.values() {
            lock(sensor).reset_transients();
        }
    }
}

/// One entry of a reusable subtest.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    Relay { name: String, on: bool },
    Output { stimulus: String, value: f64 },
    Delay(Duration),
    Measure(Vec<String>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Subtest {
    pub name: String,
    pub actions: Vec<Action>,
}

impl Subtest {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            actions: Vec::new(),
        }
    }

    pub fn relay(mut self, name: &str, on: bool) -> Self {
        self.actions.push(Action::Relay {
            name: name.to_string(),
            on,
        });
        self
    }

    pub fn output(mut self, stimulus: &str, value: f64) -> Self {
        self.actions.push(Action::Output {
            stimulus: stimulus.to_string(),
            value,
        });
        self
    }

    pub fn delay(mut self, delay: Duration) -> Self {
        self.actions.push(Action::Delay(delay));
        self
    }

    pub fn measure(mut self, names: &[&str]) -> Self {
        self.actions.push(Action::Measure(names.iter().map(|n| n.to_string()).collect()));
        self
    }
}

/// Everything a step can reach.
pub struct Context {
    pub devices: Devices,
    pub sensors: Sensors,
    pub measurements: HashMap<String, Measurement>,
    pub subtests: HashMap<String, Subtest>,
    position: usize,
    clock: SharedClock,
    bus: Arc<SignalBus>,
    readings: Vec<MeasurementResult>,
    cancel: Arc<AtomicBool>,
    config: BenchConfig,
}

impl Context {
    pub fn new(config: BenchConfig, clock: SharedClock, bus: Arc<SignalBus>) -> Self {
        Self {
            devices: Devices::new(config.clone()),
            sensors: Sensors::default(),
            measurements: HashMap::new(),
            subtests: HashMap::new(),
            position: 1,
            clock,
            bus,
            readings: Vec::new(),
            cancel: Arc::new(AtomicBool::new(false)),
            config,
        }
    }

    pub fn config(&self) -> &BenchConfig {
        &self.config
    }

    pub fn fifo(&self) -> bool {
        self.config.fifo
    }

    pub fn position(&self) -> usize {
        self.position
    }

    pub fn clock(&self) -> SharedClock {
        Arc::clone(&self.clock)
    }

    pub fn bus(&self) -> &Arc<SignalBus> {
        &self.bus
    }

    pub fn sleep(&self, duration: Duration) {
        self.clock.sleep(duration);
    }

    pub fn readings(&self) -> &[MeasurementResult] {
        &self.readings
    }

    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    /// A measurement polled at the configured retry interval.
    pub fn measurement(&self, name: &str, limit: SharedLimit, sensor: SharedSensor) -> Measurement {
        Measurement::new(name, limit, sensor).retry_interval(self.config.retry_interval())
    }

    pub fn add_measurement(&mut self, measurement: Measurement) {
        self.measurements.insert(measurement.name().to_string(), measurement);
    }

    pub fn add_subtest(&mut self, subtest: Subtest) {
        self.subtests.insert(subtest.name.clone(), subtest);
    }

    pub fn add_programmer(&mut self, programmer: Programmer) {
        self.devices.programmers.insert(programmer.name().to_string(), programmer);
    }

    /// Build, open and register a console on the port `port`.
    pub fn open_console(
        &mut self,
        name: &str,
        port: &str,
        dialect: Dialect,
        params: ParameterTable,
    ) -> Result<SharedConsole, StepError> {
        let stream = self.devices.port(port);
        self.register_console(name, stream, dialect, params)
    }

    /// Build, open and register a console tunnelled through `gateway`.
    pub fn open_tunnel_console(
        &mut self,
        name: &str,
        gateway: &str,
        target: u16,
        local: u16,
        dialect: Dialect,
        params: ParameterTable,
    ) -> Result<SharedConsole, StepError> {
        let gateway = self.devices.console(gateway)?;
        let tunnel = CanTunnel::new(gateway, target, local);
        self.register_console(name, Box::new(tunnel), dialect, params)
    }

    fn register_console(
        &mut self,
        name: &str,
        stream: Box<dyn ByteStream>,
        dialect: Dialect,
        params: ParameterTable,
    ) -> Result<SharedConsole, StepError> {
        let mut console = Console::new(name, stream, dialect, params).with_clock(self.clock());
        console.open()?;
        let shared = console.shared();
        self.devices.insert_console(name, Arc::clone(&shared));
        Ok(shared)
    }

    /// A registered console, reopened if an earlier teardown closed it.
    pub fn console(&mut self, name: &str) -> Result<SharedConsole, StepError> {
        let console = self.devices.console(name)?;
        lock(&console).open()?;
        Ok(console)
    }

    /// Record a result and publish it.
    pub fn record(&mut self, result: MeasurementResult) {
        self.bus.publish(&Signal::Result(result.clone()));
        self.readings.push(result);
    }

    pub fn measure(&mut self, name: &str) -> Result<MeasurementResult, StepError> {
        let outcome = self
            .measurements
            .get(name)
            .ok_or_else(|| StepError::unknown("measurement", name))?
            .measure(self.clock.as_ref());
        match outcome {
            Ok(result) => {
                self.record(result.clone());
                Ok(result)
            }
            Err(e) => {
                self.record((*e.result).clone());
                Err(e.into())
            }
        }
    }

    /// Measure several in order; stops at the first error.
    pub fn measure_all(&mut self, names: &[&str]) -> Result<Vec<MeasurementResult>, StepError> {
        names.iter().map(|name| self.measure(name)).collect()
    }

    /// Measure the fixture lock and abort the run unless it passes.
    pub fn fixture_lock(&mut self, name: &str) -> Result<(), StepError> {
        let result = self.measure(name)?;
        if result.is_pass() {
            Ok(())
        } else {
            Err(StepError::Fixture(format!("{}: {}", name, result.verdict)))
        }
    }

    /// Run a programmer and measure its outcome.
    pub fn program(&mut self, name: &str) -> Result<MeasurementResult, StepError> {
        let clock = self.clock();
        let programmer = self
            .devices
            .programmers
            .get_mut(name)
            .ok_or_else(|| StepError::unknown("programmer", name))?;
        programmer.program();
        let outcome = programmer.result_check(clock.as_ref());
        match outcome {
            Ok(result) => {
                self.record(result.clone());
                Ok(result)
            }
            Err(e) => {
                self.record((*e.result).clone());
                Err(e.into())
            }
        }
    }

    pub fn subtest(&mut self, name: &str) -> Result<(), StepError> {
        let subtest = self
            .subtests
            .get(name)
            .cloned()
            .ok_or_else(|| StepError::unknown("subtest", name))?;
        info!(subtest = %subtest.name, "subtest");
        for action in &subtest.actions {
            match action {
                Action::Relay { name, on } => lock(&*self.devices.relay(name)?).set(*on)?,
                Action::Output { stimulus, value } => lock(&*self.devices.stimulus(stimulus)?).output(*value)?,
                Action::Delay(delay) => self.sleep(*delay),
                Action::Measure(names) => {
                    for measurement in names {
                        self.measure(measurement)?;
                    }
                }
            }
        }
        Ok(())
    }

    fn begin_run(&mut self, position: usize) {
        self.position = position;
        self.readings.clear();
        self.cancel.store(false, Ordering::SeqCst);
    }

    fn reset_transients(&mut self) {
        self.sensors.reset_transients();
        for programmer in self.devices.programmers.values() {
            programmer.mirror().clear();
        }
    }

    /// The program's safety actions, then every console closed.
    fn teardown(&mut self, program: &mut dyn TestProgram) {
        let mut safety = SafetyManager::new();
        program.safety(self, &mut safety);
        safety.close_consoles(self.devices.consoles_for_teardown());
        if !safety.all_succeeded() {
            warn!(failures = safety.failures(), "safety teardown incomplete");
        }
    }
}

pub struct Engine {
    context: Context,
    log: ResultLog,
    subscription: SubscriptionId,
}

impl Engine {
    /// FIFO configurations get a simulated clock. Events go to the
    /// process-wide bus.
    pub fn new(config: BenchConfig) -> Self {
        let clock: SharedClock = if config.fifo { sim_clock() } else { system_clock() };
        Self::with_parts(config, clock, SignalBus::global())
    }

    pub fn with_parts(config: BenchConfig, clock: SharedClock, bus: Arc<SignalBus>) -> Self {
        let context = Context::new(config, clock, Arc::clone(&bus));
        // An observer publishing a verdict-less stop is an operator cancel.
        let cancel = Arc::clone(&context.cancel);
        let subscription = bus.subscribe(SignalKind::Stop, move |signal| {
            if let Signal::Stop { code: None, .. } = signal {
                cancel.store(true, Ordering::SeqCst);
            }
        });
        Self {
            context,
            log: ResultLog::new(),
            subscription,
        }
    }

    pub fn context(&self) -> &Context {
        &self.context
    }

    pub fn context_mut(&mut self) -> &mut Context {
        &mut self.context
    }

    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.context.cancel)
    }

    pub fn results(&self) -> &ResultLog {
        &self.log
    }

    /// Build the program's bench. If that fails part way, whatever was
    /// already driven is made safe and the consoles are closed.
    pub fn open(&mut self, program: &mut dyn TestProgram) -> Result<(), EngineError> {
        info!(program = program.name(), fifo = self.context.fifo(), "opening program");
        if let Err(source) = program.open(&mut self.context) {
            error!(program = program.name(), error = %source, "open failed");
            self.context.teardown(program);
            self.context.devices.clear_consoles();
            return Err(EngineError::Open {
                program: program.name().to_string(),
                source,
            });
        }
        Ok(())
    }

    pub fn close(&mut self, program: &mut dyn TestProgram) -> Result<(), EngineError> {
        let result = program.close(&mut self.context);
        let mut safety = SafetyManager::new();
        safety.close_consoles(self.context.devices.consoles_for_teardown());
        self.context.devices.clear_consoles();
        info!(program = program.name(), "program closed");
        result.map_err(|source| EngineError::Close {
            program: program.name().to_string(),
            source,
        })
    }

    /// Run the enabled steps for one UUT position.
    pub fn run(&mut self, program: &mut dyn TestProgram, position: usize) -> UutResult {
        let ctx = &mut self.context;
        ctx.begin_run(position);
        info!(program = program.name(), position, "run started");
        ctx.bus.publish(&Signal::Start { position });

        let mut executed = Vec::new();
        let mut abort_reason = None;
        for step in program.sequence().steps.iter_mut().filter(|s| s.enabled) {
            if ctx.is_cancelled() {
                abort_reason = Some(StepError::Cancelled.to_string());
                break;
            }
            info!(step = %step.name, position, "step");
            ctx.bus.publish(&Signal::Step {
                position,
                name: step.name.clone(),
            });
            executed.push(step.name.clone());
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| (step.run)(&mut *ctx)))
                .unwrap_or_else(|payload| Err(StepError::from_panic(&*payload)));
            if let Err(e) = outcome {
                error!(step = %step.name, error = %e, "step aborted");
                abort_reason = Some(format!("{}: {}", step.name, e));
                ctx.reset_transients();
                break;
            }
        }
        if abort_reason.is_none() && ctx.is_cancelled() {
            abort_reason = Some(StepError::Cancelled.to_string());
        }

        ctx.teardown(program);

        let code = if abort_reason.is_some() {
            ResultCode::Abort
        } else if ctx.readings.iter().any(MeasurementResult::is_counting_failure) {
            ResultCode::Fail
        } else {
            ResultCode::Pass
        };

        ctx.reset_transients();
        ctx.bus.publish(&Signal::Stop {
            position,
            code: Some(code),
        });
        info!(program = program.name(), position, code = %code, "run finished");

        let result = UutResult {
            position,
            code,
            readings: std::mem::take(&mut ctx.readings),
            steps: executed,
            abort_reason,
        };
        self.log.record(result.clone());
        result
    }

    /// Open, run every position, close, and export results if configured.
    pub fn execute(&mut self, program: &mut dyn TestProgram, positions: &[usize]) -> Result<Vec<UutResult>, EngineError> {
        self.open(program)?;
        let results: Vec<UutResult> = positions.iter().map(|&p| self.run(program, p)).collect();
        self.close(program)?;
        if let Some(path) = self.context.config.results_path.clone() {
            self.log.export_json(&path)?;
        }
        Ok(results)
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.context.bus.unsubscribe(self.subscription);
    }
}
