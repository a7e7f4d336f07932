use std::sync::Arc;
use std::time::Duration;

use testexec::console::{Console, Dialect, Parameter, ParameterTable};
use testexec::limits::Limit;
use testexec::measurement::{ErrorKind, Measurement, Verdict};
use testexec::sensors::{
    self, AdjustAnalogSensor, ChannelConfig, ConsoleSensor, DataEntrySensor, InstrumentSensor, MirrorSensor, Quantity,
    RampSensor, ReadingValue, SensorError, SimInstrument, SimOperator, YesNoSensor,
};
use testexec::serial::SimSerial;
use testexec::timing::{sim_clock, SimClock};

fn vout(dmm: &SimInstrument) -> InstrumentSensor {
    InstrumentSensor::new("Vout", dmm.shared(), ChannelConfig::new(Quantity::Voltage, 1))
}

fn ocp_ramp(load: &SimInstrument, dmm: &SimInstrument, clock: &Arc<SimClock>) -> RampSensor {
    RampSensor::new(
        "OCP",
        load.shared_stimulus(),
        Box::new(vout(dmm)),
        Limit::upper("VoutDrop", 11.6).shared(),
        4.0,
        10.0,
        0.5,
        Duration::from_millis(100),
        clock.clone(),
    )
}

#[test]
fn test_ramp_to_ocp() {
    let clock = sim_clock();
    let load = SimInstrument::new("load");
    let dmm = SimInstrument::new("dmm");
    dmm.stage(Quantity::Voltage, 1, &[14.4; 6]);
    dmm.stage(Quantity::Voltage, 1, &[10.0]);

    let ramp = sensors::shared(ocp_ramp(&load, &dmm, &clock));
    let ocp = Measurement::new("OCP", Limit::between("OCP", 6.0, 9.0).unwrap().shared(), ramp);
    let result = ocp.measure(clock.as_ref()).unwrap();

    assert!(result.is_pass());
    assert_eq!(result.reading, Some(ReadingValue::Number(7.0)));
    // Seven steps, then back to the starting level.
    assert_eq!(load.outputs(), vec![4.0, 4.5, 5.0, 5.5, 6.0, 6.5, 7.0, 0.0]);
    assert_eq!(clock.elapsed(), Duration::from_millis(700));
}

#[test]
fn test_ramp_detects_on_first_step() {
    let clock = sim_clock();
    let load = SimInstrument::new("load");
    let dmm = SimInstrument::new("dmm");
    dmm.stage(Quantity::Voltage, 1, &[9.0]);

    let ramp = sensors::shared(ocp_ramp(&load, &dmm, &clock));
    let ocp = Measurement::new("OCP", Limit::between("OCP", 6.0, 9.0).unwrap().shared(), ramp);
    let result = ocp.measure(clock.as_ref()).unwrap();

    assert_eq!(result.reading, Some(ReadingValue::Number(4.0)));
    assert!(matches!(result.verdict, Verdict::Fail(_)));
}

#[test]
fn test_ramp_detects_on_last_step() {
    let clock = sim_clock();
    let load = SimInstrument::new("load");
    let dmm = SimInstrument::new("dmm");
    dmm.stage(Quantity::Voltage, 1, &[14.4; 12]);
    dmm.stage(Quantity::Voltage, 1, &[11.0]);

    let mut ramp = ocp_ramp(&load, &dmm, &clock).reset(false);
    let value = testexec::sensors::Sensor::read(&mut ramp).unwrap();
    assert_eq!(value, ReadingValue::Number(10.0));
    assert_eq!(load.outputs().len(), 13);
    assert_eq!(dmm.remaining(Quantity::Voltage, 1), 0);
}

#[test]
fn test_ramp_without_detection_reads_stop() {
    let clock = sim_clock();
    let load = SimInstrument::new("load");
    let dmm = SimInstrument::new("dmm");
    dmm.stage(Quantity::Voltage, 1, &[14.4; 13]);

    let ramp = sensors::shared(ocp_ramp(&load, &dmm, &clock));
    let ocp = Measurement::new("OCP", Limit::between("OCP", 6.0, 9.0).unwrap().shared(), ramp);
    let result = ocp.measure(clock.as_ref()).unwrap();

    assert_eq!(result.reading, Some(ReadingValue::Number(10.0)));
    assert!(!result.is_pass());
    assert_eq!(load.outputs().last(), Some(&0.0));
}

#[test]
fn test_polls_until_pass() {
    let clock = sim_clock();
    let dmm = SimInstrument::new("dmm");
    dmm.stage(Quantity::Voltage, 1, &[11.0, 11.2, 12.0, 12.1]);

    let limit = Limit::between("Vout", 11.5, 12.5).unwrap().shared();
    let measurement = Measurement::new("Vout", limit, sensors::shared(vout(&dmm))).timeout(Duration::from_secs(1));
    let result = measurement.measure(clock.as_ref()).unwrap();

    assert!(result.is_pass());
    assert_eq!(result.reading, Some(ReadingValue::Number(12.0)));
    assert_eq!(clock.elapsed(), Duration::from_millis(400));
    assert_eq!(dmm.remaining(Quantity::Voltage, 1), 1);
    assert_eq!(dmm.configured().len(), 1);
}

#[test]
fn test_timeout_reports_last_reading() {
    let clock = sim_clock();
    let dmm = SimInstrument::new("dmm");
    dmm.stage(Quantity::Voltage, 1, &[11.0; 10]);

    let limit = Limit::between("Vout", 11.5, 12.5).unwrap().shared();
    let measurement = Measurement::new("Vout", limit, sensors::shared(vout(&dmm)))
        .timeout(Duration::from_secs(1))
        .retry_interval(Duration::from_millis(200));
    let result = measurement.measure(clock.as_ref()).unwrap();

    assert!(matches!(result.verdict, Verdict::Fail(_)));
    assert_eq!(result.reading, Some(ReadingValue::Number(11.0)));
    assert_eq!(dmm.remaining(Quantity::Voltage, 1), 4);
    assert!(result.counts);
}

#[test]
fn test_no_timeout_reads_once() {
    let clock = sim_clock();
    let dmm = SimInstrument::new("dmm");
    dmm.stage(Quantity::Resistance, 2, &[30.0, 10.0]);

    let sensor = InstrumentSensor::new("FanShort", dmm.shared(), ChannelConfig::new(Quantity::Resistance, 2));
    let limit = Limit::upper("FanShort", 20.0).shared();
    let result = Measurement::new("FanShort", limit, sensors::shared(sensor))
        .measure(clock.as_ref())
        .unwrap();

    assert!(!result.is_pass());
    assert_eq!(dmm.remaining(Quantity::Resistance, 2), 1);
    assert_eq!(clock.elapsed(), Duration::ZERO);
}

#[test]
fn test_scaled_channel() {
    let clock = sim_clock();
    let dmm = SimInstrument::new("dmm");
    dmm.stage(Quantity::Current, 3, &[0.5]);

    let config = ChannelConfig::new(Quantity::Current, 3).scale(100.0).range(1.0);
    let sensor = InstrumentSensor::new("Iin", dmm.shared(), config);
    let limit = Limit::percent("Iin", 50.0, 5.0).shared();
    let result = Measurement::new("Iin", limit, sensors::shared(sensor))
        .measure(clock.as_ref())
        .unwrap();

    assert!(result.is_pass());
    assert_eq!(dmm.configured()[0].range, Some(1.0));
}

#[test]
fn test_mirror_is_never_polled() {
    let clock = sim_clock();
    let mirror = MirrorSensor::new("ProgramResult");
    mirror.store("Error 5");

    let limit = Limit::regex("ProgramOk", "^ok$").unwrap().shared();
    let measurement =
        Measurement::new("Program", limit, sensors::shared(mirror.clone())).timeout(Duration::from_secs(30));
    let result = measurement.measure(clock.as_ref()).unwrap();

    assert!(matches!(result.verdict, Verdict::Fail(_)));
    assert_eq!(result.reading, Some(ReadingValue::Text("Error 5".into())));
    assert!(mirror.is_empty());
    assert_eq!(clock.elapsed(), Duration::ZERO);
}

#[test]
fn test_empty_mirror_is_no_value_error() {
    let clock = sim_clock();
    let limit = Limit::regex("ProgramOk", "^ok$").unwrap().shared();
    let measurement = Measurement::new("Program", limit, sensors::shared(MirrorSensor::new("ProgramResult")));
    let result = measurement.measure(clock.as_ref()).unwrap();

    assert!(matches!(result.verdict, Verdict::Error { kind: ErrorKind::NoValue, .. }));
    assert!(result.reading.is_none());
    assert!(result.is_counting_failure());
}

fn silent_console(fail_on_error: bool) -> testexec::console::SharedConsole {
    let port = SimSerial::new("uut");
    port.set_echo(true);
    let params = ParameterTable::new().with("VOUT", Parameter::float("VOUT", 1000.0));
    let mut console = Console::new("uut", Box::new(port), Dialect::BulkUart, params).with_clock(sim_clock());
    console.set_measurement_fail_on_error(fail_on_error);
    console.open().unwrap();
    console.shared()
}

#[test]
fn test_console_timeout_becomes_error_verdict() {
    let clock = sim_clock();
    let sensor = ConsoleSensor::new("Vout", silent_console(true), "VOUT");
    let limit = Limit::between("Vout", 11.5, 12.5).unwrap().shared();
    let result = Measurement::new("Vout", limit, sensors::shared(sensor))
        .measure(clock.as_ref())
        .unwrap();

    assert!(matches!(result.verdict, Verdict::Error { kind: ErrorKind::Protocol, .. }));
}

#[test]
fn test_console_timeout_propagates_when_configured() {
    let clock = sim_clock();
    let sensor = ConsoleSensor::new("Vout", silent_console(false), "VOUT");
    let limit = Limit::between("Vout", 11.5, 12.5).unwrap().shared();
    let err = Measurement::new("Vout", limit, sensors::shared(sensor))
        .measure(clock.as_ref())
        .unwrap_err();

    assert!(matches!(err.result.verdict, Verdict::Abort(_)));
    assert!(matches!(err.source, SensorError::Console { .. }));
}

#[test]
fn test_unknown_console_key_fails_at_configure() {
    let clock = sim_clock();
    let sensor = ConsoleSensor::new("Nope", silent_console(true), "NOPE");
    let limit = Limit::boolean("Nope", true).shared();
    let err = Measurement::new("Nope", limit, sensors::shared(sensor))
        .measure(clock.as_ref())
        .unwrap_err();

    assert!(err.to_string().contains("unknown parameter NOPE"));
}

#[test]
fn test_instrument_error_aborts() {
    let clock = sim_clock();
    let dmm = SimInstrument::new("dmm");
    let limit = Limit::between("Vout", 11.5, 12.5).unwrap().shared();
    let err = Measurement::new("Vout", limit, sensors::shared(vout(&dmm)))
        .timeout(Duration::from_secs(1))
        .measure(clock.as_ref())
        .unwrap_err();

    assert!(matches!(err.source, SensorError::Instrument(_)));
    assert_eq!(err.result.measurement, "Vout");
    assert!(err.result.reading.is_none());
}

#[test]
fn test_operator_dialogs() {
    let clock = sim_clock();
    let operator = SimOperator::new();
    operator.answer(Some(true));
    operator.enter(Some("SN12345"));

    let led = YesNoSensor::new("LedOn", operator.shared(), "Is the green LED on?");
    let result = Measurement::new("LedOn", Limit::boolean("LedOn", true).shared(), sensors::shared(led))
        .measure(clock.as_ref())
        .unwrap();
    assert!(result.is_pass());

    let serial = DataEntrySensor::new("Serial", operator.shared(), "Scan the serial label");
    let limit = Limit::regex("Serial", "^SN[0-9]{5}$").unwrap().shared();
    let result = Measurement::new("Serial", limit, sensors::shared(serial))
        .measure(clock.as_ref())
        .unwrap();
    assert!(result.is_pass());
    assert_eq!(operator.prompts().len(), 2);
}

#[test]
fn test_operator_cancel_aborts() {
    let clock = sim_clock();
    let operator = SimOperator::new();
    operator.answer(None);

    let led = YesNoSensor::new("LedOn", operator.shared(), "Is the green LED on?");
    let err = Measurement::new("LedOn", Limit::boolean("LedOn", true).shared(), sensors::shared(led))
        .timeout(Duration::from_secs(5))
        .measure(clock.as_ref())
        .unwrap_err();
    assert!(matches!(err.source, SensorError::Cancelled(_)));
    assert_eq!(operator.prompts().len(), 1);
}

#[test]
fn test_adjust_until_in_window() {
    let clock = sim_clock();
    let dmm = SimInstrument::new("dmm");
    dmm.stage(Quantity::Voltage, 1, &[3.0, 4.0, 5.1]);
    let operator = SimOperator::new();
    operator.keep_adjusting(true);
    operator.keep_adjusting(true);

    let adjust = AdjustAnalogSensor::new("Trim", operator.shared(), Box::new(vout(&dmm)), 5.0, 5.5, clock.clone());
    let result = Measurement::new("Trim", Limit::boolean("Trim", true).shared(), sensors::shared(adjust))
        .measure(clock.as_ref())
        .unwrap();

    assert!(result.is_pass());
    assert_eq!(operator.prompts().len(), 2);
    assert_eq!(clock.elapsed(), Duration::from_millis(400));
}

#[test]
fn test_adjust_gives_up() {
    let clock = sim_clock();
    let dmm = SimInstrument::new("dmm");
    dmm.stage(Quantity::Voltage, 1, &[3.0]);
    let operator = SimOperator::new();

    let adjust = AdjustAnalogSensor::new("Trim", operator.shared(), Box::new(vout(&dmm)), 5.0, 5.5, clock.clone());
    let result = Measurement::new("Trim", Limit::boolean("Trim", true).shared(), sensors::shared(adjust))
        .measure(clock.as_ref())
        .unwrap();

    assert_eq!(result.reading, Some(ReadingValue::Bool(false)));
    assert!(!result.is_pass());
}
