use testexec::console::tunnel::parse_rrc;
use testexec::console::{CanTunnel, Console, Dialect, Parameter, ParameterTable, SharedConsole};
use testexec::serial::{ByteStream, SimSerial};
use testexec::timing::sim_clock;

fn gateway() -> (SharedConsole, SimSerial) {
    let port = SimSerial::new("gateway");
    port.set_echo(true);
    let console = Console::new("gateway", Box::new(port.clone()), Dialect::BulkUart, ParameterTable::new())
        .with_clock(sim_clock())
        .shared();
    (console, port)
}

#[test]
fn test_parse_rrc_frames() {
    assert_eq!(parse_rrc("RRC,32,4,2,81,63", 32), Some(vec![81, 63]));
    assert_eq!(parse_rrc("noise RRC,32,4,1,48", 32), Some(vec![48]));
    assert_eq!(parse_rrc("RRC,33,4,1,48", 32), None);
    assert_eq!(parse_rrc("RRC,32,3,1,48", 32), None);
    assert_eq!(parse_rrc("RRC,32,4,3,1,2", 32), None);
    assert_eq!(parse_rrc("TCC,32,4,1,48", 32), None);
}

#[test]
fn test_tunnel_open_and_close_commands() {
    let (gateway, port) = gateway();
    port.stage("> ");
    port.stage("> ");
    port.stage("> ");

    let mut tunnel = CanTunnel::new(gateway, 32, 5);
    tunnel.open().unwrap();
    assert!(tunnel.is_open());
    tunnel.close().unwrap();
    assert!(!tunnel.is_open());

    assert_eq!(
        port.output_text(),
        "\"RF,ALL CAN\r\"TCC,32,3,5,1 CAN\r\"TCC,32,3,5,0 CAN\r"
    );
}

#[test]
fn test_write_splits_into_frames() {
    let (gateway, port) = gateway();
    for _ in 0..4 {
        port.stage("> ");
    }

    let mut tunnel = CanTunnel::new(gateway, 32, 5);
    tunnel.open().unwrap();
    port.take_output();

    tunnel.write(b"0123456789").unwrap();
    assert_eq!(
        port.output_text(),
        "\"TCC,32,4,8,48,49,50,51,52,53,54,55 CAN\r\"TCC,32,4,2,56,57 CAN\r"
    );
}

#[test]
fn test_read_keeps_only_target_frames() {
    let (gateway, port) = gateway();
    port.stage("> ");
    port.stage("> ");

    let mut tunnel = CanTunnel::new(gateway, 32, 5);
    tunnel.open().unwrap();

    port.stage_then_flush("RRC,7,4,1,65\r\nRRC,32,4,2,79,75\r\n");
    assert_eq!(tunnel.read(2).unwrap(), b"OK".to_vec());
    assert!(tunnel.read(1).unwrap().is_empty());
}

#[test]
fn test_console_over_tunnel() {
    let (gateway, port) = gateway();
    // RF and TCC open.
    port.stage("> ");
    port.stage("> ");
    // The frame carrying "Q?", then its echo from the target.
    port.stage("> ");
    port.stage_then_flush("RRC,32,4,2,81,63\r\n");
    // The frame carrying the terminator, then the reply.
    port.stage("> ");
    port.stage_then_flush("RRC,32,4,1,48\r\nRRC,32,4,4,13,10,62,32\r\n");

    let params = ParameterTable::new().with("STATUS", Parameter::float("Q", 1.0).read_format("{0}?"));
    let tunnel = CanTunnel::new(gateway, 32, 5);
    let mut inner = Console::new("uut", Box::new(tunnel), Dialect::CanPacket, params).with_clock(sim_clock());
    inner.open().unwrap();

    assert_eq!(inner.get_f64("STATUS").unwrap(), 0.0);
    let sent = port.output_text();
    assert!(sent.contains("\"TCC,32,4,2,81,63 CAN\r"));
    assert!(sent.contains("\"TCC,32,4,1,13 CAN\r"));
}
