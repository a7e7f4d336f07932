use std::time::Duration;

use testexec::console::{
    Console, ConsoleError, Dialect, HwVersion, OverrideState, ParamValue, Parameter, ParameterTable, StatusFlags,
};
use testexec::serial::SimSerial;
use testexec::timing::sim_clock;

fn uut_params() -> ParameterTable {
    ParameterTable::new()
        .with("BLE-MAC", Parameter::string("BLE-MAC").read_format("{0}?"))
        .with("STATUS", Parameter::hex("STATUS", 0xFFFF_FFFF).writable())
        .with("VOUT", Parameter::float("VOUT", 1000.0).writable().range(0.0, 15.0))
        .with("RELAY", Parameter::boolean("RELAY").writable())
        .with("FAN", Parameter::override_state("FAN"))
        .with("FW", Parameter::raw(firmware))
}

fn firmware(console: &mut Console) -> Result<ParamValue, ConsoleError> {
    console.firmware_version().map(ParamValue::Str)
}

fn console_on(dialect: Dialect, echo: bool) -> (Console, SimSerial) {
    let port = SimSerial::new("uut");
    port.set_echo(echo);
    let console = Console::new("uut", Box::new(port.clone()), dialect, uut_params()).with_clock(sim_clock());
    (console, port)
}

fn open_bulk() -> (Console, SimSerial) {
    let (mut console, port) = console_on(Dialect::BulkUart, true);
    console.open().unwrap();
    (console, port)
}

#[test]
fn test_read_ble_mac() {
    let (mut console, port) = open_bulk();
    port.stage("001EC030BC15\r\n> ");

    assert_eq!(console.get_string("BLE-MAC").unwrap(), "001EC030BC15");
    assert_eq!(port.output_text(), "BLE-MAC?\r");
}

#[test]
fn test_float_read_is_scaled() {
    let (mut console, port) = open_bulk();
    port.stage("12000\r\n> ");

    assert_eq!(console.get_f64("VOUT").unwrap(), 12.0);
    assert_eq!(port.output_text(), "\"VOUT XN?\r");
}

#[test]
fn test_float_write_boundaries() {
    let (mut console, port) = open_bulk();
    port.stage("> ");
    port.stage("> ");

    console.set_f64("VOUT", 15.0).unwrap();
    console.set_f64("VOUT", 0.0).unwrap();
    assert_eq!(port.output_text(), "15000 \"VOUT XN!\r0 \"VOUT XN!\r");

    // Rejected before anything is sent.
    assert!(matches!(
        console.set_f64("VOUT", 15.5),
        Err(ConsoleError::OutOfRange { .. })
    ));
    assert!(matches!(
        console.set_f64("VOUT", -0.1),
        Err(ConsoleError::OutOfRange { .. })
    ));
    assert!(matches!(
        console.set_f64("VOUT", f64::NAN),
        Err(ConsoleError::OutOfRange { .. })
    ));
    assert_eq!(port.output_text(), "15000 \"VOUT XN!\r0 \"VOUT XN!\r");
}

#[test]
fn test_boolean_and_override_writes() {
    let (mut console, port) = open_bulk();
    port.stage("1\r\n> ");
    port.stage("> ");
    port.stage("> ");

    assert!(console.get_bool("RELAY").unwrap());
    console.set_bool("RELAY", false).unwrap();
    console.set_override("FAN", OverrideState::ForceOn).unwrap();
    assert!(port.output_text().ends_with("0 \"RELAY XN!\r2 \"FAN XN!\r"));
}

#[test]
fn test_access_rules() {
    let (mut console, _port) = open_bulk();

    assert!(matches!(console.get("NOPE"), Err(ConsoleError::UnknownParameter(_))));
    assert!(matches!(console.set_string("BLE-MAC", "x"), Err(ConsoleError::NotWritable(_))));
    assert!(matches!(console.get("FAN"), Err(ConsoleError::NotReadable(_))));
    assert!(matches!(
        console.set("VOUT", ParamValue::Bool(true)),
        Err(ConsoleError::WrongValueType { .. })
    ));
}

#[test]
fn test_raw_parameter_runs_function() {
    let (mut console, port) = open_bulk();
    port.stage("v2.4.1\r\n> ");

    assert_eq!(console.get("FW").unwrap(), ParamValue::Str("v2.4.1".into()));
    assert_eq!(port.output_text(), "SW-VERSION?\r");
}

#[test]
fn test_test_mode_sets_status_bit() {
    let (mut console, port) = open_bulk();
    port.stage("$20000001\r\n> ");
    port.stage("> ");

    console.test_mode(true).unwrap();
    assert_eq!(port.output_text(), "\"STATUS XN?\r$A0000001 \"STATUS XN!\r");
}

#[test]
fn test_status_flags() {
    let (mut console, port) = open_bulk();
    port.stage("$30000000\r\n> ");

    let status = console.status().unwrap();
    assert!(status.contains(StatusFlags::CAN_BOUND | StatusFlags::CAN_PRINT));
    assert!(!status.contains(StatusFlags::TEST_MODE));
}

#[test]
fn test_brand_command_order() {
    let (mut console, port) = open_bulk();
    for _ in 0..5 {
        port.stage("> ");
    }

    console.brand(&HwVersion::new(2, 1, "C"), "SN0001").unwrap();
    assert_eq!(
        port.output_text(),
        "$DEADBEA7 UNLOCK\r2 1 \"C SET-HW-VER\r\"SN0001 SET-SERIAL-ID\rNV-DEFAULT\rNV-WRITE\r"
    );
}

#[test]
fn test_wrong_line_count_is_response_error() {
    let (mut console, port) = open_bulk();
    port.stage("a\r\nb\r\n> ");

    let err = console.action("DUMP", Duration::ZERO, 1).unwrap_err();
    assert!(matches!(err, ConsoleError::Response { .. }));
    assert!(err.is_protocol_error());
}

#[test]
fn test_action_returns_lines() {
    let (mut console, port) = open_bulk();
    port.stage("a\r\nb\r\n> ");

    let response = console.action("DUMP", Duration::from_millis(100), 2).unwrap();
    assert_eq!(response.lines(), vec!["a".to_string(), "b".to_string()]);
}

#[test]
fn test_silent_uut_times_out() {
    let (mut console, _port) = open_bulk();

    match console.query("SW-VERSION?") {
        Err(ConsoleError::Response { reason, .. }) => assert!(reason.contains("timeout")),
        other => panic!("expected response error, got {:?}", other),
    }
}

#[test]
fn test_missing_echo_is_response_error() {
    let (mut console, _port) = console_on(Dialect::BulkUart, false);
    console.open().unwrap();

    assert!(matches!(console.query("X"), Err(ConsoleError::Response { .. })));
}

#[test]
fn test_bad_uart_checks_each_byte() {
    let (mut console, port) = console_on(Dialect::BadUart, true);
    console.open().unwrap();
    port.stage("42\r\n> ");

    assert_eq!(console.query("N?").unwrap(), vec!["42"]);
    assert_eq!(port.output_text(), "N?\r");
}

#[test]
fn test_bad_uart_echo_mismatch() {
    let (mut console, port) = console_on(Dialect::BadUart, false);
    console.open().unwrap();
    port.stage("Z");

    match console.query("AB") {
        Err(ConsoleError::Command { sent, echoed, .. }) => {
            assert_eq!(sent, "A");
            assert_eq!(echoed, "Z");
        }
        other => panic!("expected command error, got {:?}", other),
    }
    // Nothing after the bad byte was transmitted.
    assert_eq!(port.output_text(), "A");
}

#[test]
fn test_can_packet_chunks_command() {
    let (mut console, port) = console_on(Dialect::CanPacket, true);
    console.open().unwrap();
    port.stage("ok\r\n> ");

    assert_eq!(console.query("0123456789AB").unwrap(), vec!["ok"]);
    assert_eq!(port.output_text(), "0123456789AB\r");
}

#[test]
fn test_gen2_setup_and_framing() {
    let (mut console, port) = console_on(Dialect::Gen2, false);
    port.stage("OK\r\n");
    port.stage("OK\r\n");
    console.open().unwrap();

    port.stage("1.2.3\r\nOK\r\n");
    assert_eq!(console.firmware_version().unwrap(), "1.2.3");
    assert_eq!(port.output_text(), "\"OK\\n\" PROMPT\r0 ECHO\rSW-VERSION?\r");
}

#[test]
fn test_buffered_uart_strips_echo() {
    let (mut console, port) = console_on(Dialect::BufferedUart { prompt: "> ".into() }, true);
    port.stage("\r\n>\r\n");
    console.open().unwrap();

    port.stage(" -> 7\r\n>\r\n");
    assert_eq!(console.query("VER?").unwrap(), vec!["7"]);
}

#[test]
fn test_buffered_uart_bad_echo() {
    let (mut console, port) = console_on(Dialect::BufferedUart { prompt: "> ".into() }, false);
    port.stage(">\r\n");
    console.open().unwrap();

    port.stage("JUNK\r\n>\r\n");
    assert!(matches!(console.query("VER?"), Err(ConsoleError::Command { .. })));
}

#[test]
fn test_closed_console_refuses() {
    let (mut console, port) = console_on(Dialect::BulkUart, true);
    assert!(matches!(console.query("X"), Err(ConsoleError::NotOpen(_))));

    console.open().unwrap();
    console.close().unwrap();
    assert!(!console.is_open());
    assert!(matches!(console.get("BLE-MAC"), Err(ConsoleError::NotOpen(_))));
    assert!(port.output().is_empty());
}

#[test]
fn test_read_line_quiet_port() {
    let (mut console, port) = open_bulk();
    port.stage("RRC,32,4,1,48\r\n");

    assert_eq!(console.read_line().unwrap().as_deref(), Some("RRC,32,4,1,48"));
    assert_eq!(console.read_line().unwrap(), None);
}
