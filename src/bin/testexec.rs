use clap::{App, AppSettings, Arg, ArgMatches, SubCommand};
use colored::*;
use std::path::Path;
use std::time::Duration;

use testexec::config::BenchConfig;
use testexec::console::{Console, Dialect, Parameter, ParameterTable};
use testexec::engine::{Context, Engine, Sequence, StepError, Subtest, TestProgram};
use testexec::limits::Limit;
use testexec::measurement::MeasurementResult;
use testexec::programmer::{JLinkBackend, NordicBackend, PicBackend, Programmer, ProgrammerBackend, SystemRunner};
use testexec::results::{ResultCode, UutResult};
use testexec::safety::SafetyManager;
use testexec::sensors::{ChannelConfig, ConsoleSensor, InstrumentSensor, Quantity, Relay, SimInstrument, SimRelay};
use testexec::serial::HardwareSerial;
use testexec::timing::SystemClock;

type CliResult<T> = Result<T, Box<dyn std::error::Error>>;

fn main() -> CliResult<()> {
    let matches = App::new("testexec")
        .version("0.1.0")
        .author("Production Test Engineering Team")
        .about("Production test executive - consoles, programmers and sequences")
        .setting(AppSettings::SubcommandRequiredElseHelp)
        .arg(
            Arg::with_name("config")
                .short("c")
                .long("config")
                .value_name("FILE")
                .help("Bench configuration (JSON)")
                .takes_value(true)
                .global(true),
        )
        .arg(
            Arg::with_name("format")
                .short("f")
                .long("format")
                .value_name("FORMAT")
                .help("Output format")
                .takes_value(true)
                .possible_values(&["json", "table"])
                .default_value("table")
                .global(true),
        )
        .arg(
            Arg::with_name("verbose")
                .short("v")
                .long("verbose")
                .help("Enable verbose output")
                .global(true),
        )
        .subcommand(
            SubCommand::with_name("console")
                .about("Send commands to a UUT console")
                .arg(
                    Arg::with_name("device")
                        .help("Serial device, e.g. /dev/ttyUSB0")
                        .required(true),
                )
                .arg(
                    Arg::with_name("dialect")
                        .short("d")
                        .long("dialect")
                        .takes_value(true)
                        .possible_values(&["bulk", "bad", "can", "buffered", "gen2"])
                        .default_value("bulk"),
                )
                .arg(
                    Arg::with_name("prompt")
                        .long("prompt")
                        .help("Prompt for the buffered dialect")
                        .takes_value(true)
                        .default_value("> "),
                )
                .arg(
                    Arg::with_name("baud")
                        .short("b")
                        .long("baud")
                        .takes_value(true)
                        .validator(|v| match v.parse::<u32>() {
                            Ok(_) => Ok(()),
                            Err(_) => Err("Baud rate must be a number".into()),
                        }),
                )
                .arg(
                    Arg::with_name("commands")
                        .help("Commands to send, in order")
                        .required(true)
                        .multiple(true),
                ),
        )
        .subcommand(
            SubCommand::with_name("nrf")
                .about("Program an nRF52 with nrfjprog")
                .arg(Arg::with_name("image").help("Hex image").required(true))
                .arg(
                    Arg::with_name("serial")
                        .short("s")
                        .long("serial")
                        .help("Debugger serial number")
                        .takes_value(true),
                ),
        )
        .subcommand(
            SubCommand::with_name("pic")
                .about("Program a PIC with picprogrammer")
                .arg(Arg::with_name("device").help("PIC part name").required(true))
                .arg(Arg::with_name("image").help("Hex image").required(true)),
        )
        .subcommand(
            SubCommand::with_name("jlink")
                .about("Run a J-Link Commander script")
                .arg(Arg::with_name("device").help("Target device name").required(true))
                .arg(Arg::with_name("script").help("Commander script").required(true))
                .arg(
                    Arg::with_name("speed")
                        .long("speed")
                        .help("SWD speed in kHz")
                        .takes_value(true)
                        .default_value("4000"),
                ),
        )
        .subcommand(
            SubCommand::with_name("selftest")
                .about("Run the built-in sequence against simulated hardware")
                .arg(
                    Arg::with_name("positions")
                        .short("n")
                        .long("positions")
                        .help("Number of UUT positions")
                        .takes_value(true)
                        .default_value("2"),
                ),
        )
        .get_matches();

    tracing_subscriber::fmt::init();

    let config = match matches.value_of("config") {
        Some(path) => BenchConfig::load(Path::new(path))?,
        None => BenchConfig::default(),
    };
    let format = matches.value_of("format").unwrap_or("table");
    let verbose = matches.is_present("verbose");

    if verbose {
        println!("{}", "testexec - production test executive".bright_blue().bold());
    }

    match matches.subcommand() {
        ("console", Some(sub_matches)) => handle_console(sub_matches, &config, format)?,
        ("nrf", Some(sub_matches)) => {
            let image = Path::new(required(sub_matches, "image")?);
            let mut backend = NordicBackend::new(SystemRunner::shared(), image).timeout(config.programmer_timeout());
            if let Some(serial) = sub_matches.value_of("serial") {
                backend = backend.serial(serial);
            }
            handle_program("nrf", Box::new(backend), format)?;
        }
        ("pic", Some(sub_matches)) => {
            let device = required(sub_matches, "device")?;
            let image = Path::new(required(sub_matches, "image")?);
            let backend = PicBackend::new(SystemRunner::shared(), device, image).timeout(config.programmer_timeout());
            handle_program("pic", Box::new(backend), format)?;
        }
        ("jlink", Some(sub_matches)) => {
            let device = required(sub_matches, "device")?;
            let script = Path::new(required(sub_matches, "script")?);
            let speed = required(sub_matches, "speed")?.parse::<u32>()?;
            let backend = JLinkBackend::new(SystemRunner::shared(), device, script)
                .speed(speed)
                .timeout(config.programmer_timeout());
            handle_program("jlink", Box::new(backend), format)?;
        }
        ("selftest", Some(sub_matches)) => {
            let positions = required(sub_matches, "positions")?.parse::<usize>()?;
            handle_selftest(positions, format)?;
        }
        _ => {
            println!("{}", "No command specified. Use --help for usage information.".yellow());
        }
    }

    Ok(())
}

fn required<'a>(matches: &'a ArgMatches<'_>, name: &str) -> CliResult<&'a str> {
    matches
        .value_of(name)
        .ok_or_else(|| format!("missing argument <{}>", name).into())
}

fn parse_dialect(name: &str, prompt: &str) -> CliResult<Dialect> {
    match name {
        "bulk" => Ok(Dialect::BulkUart),
        "bad" => Ok(Dialect::BadUart),
        "can" => Ok(Dialect::CanPacket),
        "buffered" => Ok(Dialect::BufferedUart {
            prompt: prompt.to_string(),
        }),
        "gen2" => Ok(Dialect::Gen2),
        other => Err(format!("unknown dialect {}", other).into()),
    }
}

fn handle_console(matches: &ArgMatches<'_>, config: &BenchConfig, format: &str) -> CliResult<()> {
    let device = required(matches, "device")?;
    let dialect = parse_dialect(required(matches, "dialect")?, required(matches, "prompt")?)?;
    let mut settings = config.port(device);
    if let Some(baud) = matches.value_of("baud") {
        settings.baud = baud.parse()?;
    }

    let port = HardwareSerial::new("console", &settings.device, settings.baud, settings.timeout());
    let mut console = Console::new("console", Box::new(port), dialect, ParameterTable::new());
    console.open()?;

    let mut transcript = Vec::new();
    for command in matches.values_of("commands").into_iter().flatten() {
        let lines = console.query(command);
        match (&lines, format) {
            (Ok(lines), "json") => transcript.push(serde_json::json!({ "command": command, "reply": lines })),
            (Ok(lines), _) => {
                println!("{} {}", ">".bright_cyan(), command.bright_white());
                for line in lines {
                    println!("  {}", line);
                }
            }
            (Err(e), "json") => transcript.push(serde_json::json!({ "command": command, "error": e.to_string() })),
            (Err(e), _) => println!("{} {} {}", "❌".red(), command, e.to_string().as_str().bright_red()),
        }
    }
    console.close()?;

    if format == "json" {
        println!("{}", serde_json::to_string_pretty(&transcript)?);
    }
    Ok(())
}

fn handle_program(name: &str, backend: Box<dyn ProgrammerBackend>, format: &str) -> CliResult<()> {
    let mut programmer = Programmer::new(name, backend)?;
    programmer.program();
    let result = match programmer.result_check(&SystemClock) {
        Ok(result) => result,
        Err(e) => *e.result,
    };
    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&result)?),
        _ => print_reading(&result),
    }
    if !result.is_pass() {
        return Err(format!("{} programming failed", name).into());
    }
    Ok(())
}

fn print_reading(result: &MeasurementResult) {
    let reading = result.reading.as_ref().map_or_else(|| "-".to_string(), ToString::to_string);
    let verdict = if result.is_pass() {
        "PASS".bright_green()
    } else {
        result.verdict.to_string().as_str().bright_red()
    };
    println!(
        "  {:<16} {:<20} {:<28} {}",
        result.measurement.as_str().bright_white(),
        reading,
        result.limit.as_str().dimmed(),
        verdict
    );
}

fn print_uut(result: &UutResult) {
    let code = match result.code {
        ResultCode::Pass => "P".bright_green().bold(),
        ResultCode::Fail => "F".bright_red().bold(),
        ResultCode::Abort => "A".yellow().bold(),
    };
    println!("{} {} {}", "Position".bright_blue(), result.position, code);
    for reading in &result.readings {
        print_reading(reading);
    }
    if let Some(reason) = &result.abort_reason {
        println!("  {} {}", "aborted:".yellow(), reason);
    }
}

/// Simulated bench exercising an instrument, a relay and a UUT console.
struct SelfTest {
    sequence: Sequence,
    dmm: SimInstrument,
    ac: SimRelay,
    positions: usize,
}

impl SelfTest {
    fn new(positions: usize) -> Self {
        let sequence = Sequence::new()
            .step("PowerOn", |ctx| ctx.subtest("PowerOn"))
            .step("Identify", |ctx| {
                ctx.console("uut")?;
                ctx.measure("BleMac")?;
                Ok(())
            });
        Self {
            sequence,
            dmm: SimInstrument::new("dmm"),
            ac: SimRelay::new("ac"),
            positions,
        }
    }
}

impl TestProgram for SelfTest {
    fn name(&self) -> &str {
        "selftest"
    }

    fn sequence(&mut self) -> &mut Sequence {
        &mut self.sequence
    }

    fn open(&mut self, ctx: &mut Context) -> Result<(), StepError> {
        ctx.devices.relays.insert("ac".to_string(), self.ac.shared());
        ctx.devices.instruments.insert("dmm".to_string(), self.dmm.shared());

        // Output settles on the second reading of every run.
        for _ in 0..self.positions {
            self.dmm.stage(Quantity::Voltage, 1, &[11.2, 12.02]);
        }
        let vout = ctx.sensors.add(
            "Vout",
            InstrumentSensor::new("Vout", self.dmm.shared(), ChannelConfig::new(Quantity::Voltage, 1)),
        );
        let limit = Limit::between("Vout", 11.5, 12.5)?.with_doc("Output voltage").shared();
        let vout = ctx.measurement("Vout", limit, vout).timeout(Duration::from_secs(2));
        ctx.add_measurement(vout);

        let uut = ctx.devices.sim_port("uut");
        uut.set_echo(true);
        for _ in 0..self.positions {
            uut.stage("001EC030BC15\r\n> ");
        }
        let params = ParameterTable::new().with("BLE-MAC", Parameter::string("BLE-MAC").read_format("{0}?"));
        let console = ctx.open_console("uut", "uut", Dialect::BulkUart, params)?;
        let mac = ctx.sensors.add("BleMac", ConsoleSensor::new("BleMac", console, "BLE-MAC"));
        let limit = Limit::regex("BleMac", "^[0-9A-F]{12}$")?.shared();
        let mac = ctx.measurement("BleMac", limit, mac);
        ctx.add_measurement(mac);

        ctx.add_subtest(
            Subtest::new("PowerOn")
                .relay("ac", true)
                .delay(Duration::from_millis(500))
                .measure(&["Vout"]),
        );
        Ok(())
    }

    fn safety(&mut self, ctx: &mut Context, safety: &mut SafetyManager) {
        let result = ctx.devices.relay("ac").map_err(|e| e.to_string()).and_then(|relay| match relay.lock() {
            Ok(mut relay) => relay.set(false).map_err(|e| e.to_string()),
            Err(_) => Err("relay lock poisoned".to_string()),
        });
        safety.attempt("ac off", result);
    }
}

fn handle_selftest(positions: usize, format: &str) -> CliResult<()> {
    let mut program = SelfTest::new(positions);
    let mut engine = Engine::new(BenchConfig::fifo());
    let positions: Vec<usize> = (1..=positions).collect();
    let results = engine.execute(&mut program, &positions)?;

    match format {
        "json" => println!("{}", engine.results().to_json()?),
        _ => {
            println!("{}", "Self-test".bright_blue().bold());
            for result in &results {
                print_uut(result);
            }
        }
    }
    if results.iter().all(UutResult::passed) {
        Ok(())
    } else {
        Err("self-test failed".into())
    }
}
