use clap::{App, Arg, ArgMatches, SubCommand};
use colored::*;
use rfbus::framing::{encode_frame, pad_to_sector};
use rfbus::opcodes::{Opcode, PatternCtl, SECTOR_SIZE};
use rfbus::status::{ResponseVersion, StatusResponse};
use rfbus::StateFlags;
use std::process::Command;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: &str = "4950";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let matches = App::new("rfbus")
        .version("0.1.0")
        .about("📡 RF Instrument Bus - command-line host for the opcode protocol")
        .arg(
            Arg::with_name("host")
                .short("H")
                .long("host")
                .value_name("HOST")
                .help("Instrument host address")
                .takes_value(true)
                .default_value(DEFAULT_HOST)
                .global(true),
        )
        .arg(
            Arg::with_name("port")
                .short("p")
                .long("port")
                .value_name("PORT")
                .help("Instrument port")
                .takes_value(true)
                .default_value(DEFAULT_PORT)
                .global(true),
        )
        .arg(
            Arg::with_name("format")
                .short("f")
                .long("format")
                .value_name("FORMAT")
                .help("Output format")
                .takes_value(true)
                .possible_values(&["json", "table", "compact"])
                .default_value("table")
                .global(true),
        )
        .arg(
            Arg::with_name("response-size")
                .long("response-size")
                .value_name("BYTES")
                .help("Fixed response size the instrument is configured for")
                .takes_value(true)
                .possible_values(&["26", "48"])
                .default_value("48")
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
            SubCommand::with_name("status")
                .about("📊 Query the state register and alarm vector")
                .long_about("Sends a STATUS opcode and decodes the fixed-size response"),
        )
        .subcommand(
            SubCommand::with_name("reset")
                .about("🔄 Reset the instrument")
                .long_about("Clears every busy flag, alarm latch, and the pattern engine"),
        )
        .subcommand(
            SubCommand::with_name("freq")
                .about("📻 Tune the synthesizer")
                .arg(
                    Arg::with_name("hz")
                        .help("Target frequency in Hz (2.4 to 2.5 GHz, 100 kHz raster)")
                        .required(true)
                        .validator(|v| {
                            v.parse::<u32>()
                                .map(|_| ())
                                .map_err(|_| "Frequency must be a number in Hz".into())
                        }),
                ),
        )
        .subcommand(
            SubCommand::with_name("power")
                .about("🔋 Set output power for one channel")
                .arg(
                    Arg::with_name("channel")
                        .help("Channel number (0-3)")
                        .required(true)
                        .possible_values(&["0", "1", "2", "3"]),
                )
                .arg(
                    Arg::with_name("dbm")
                        .help("Output power in dBm (5.0 to 41.0)")
                        .required(true)
                        .validator(|v| {
                            v.parse::<f32>()
                                .map(|_| ())
                                .map_err(|_| "Power must be a number in dBm".into())
                        }),
                ),
        )
        .subcommand(
            SubCommand::with_name("phase")
                .about("🧭 Set phase for one channel")
                .arg(
                    Arg::with_name("channel")
                        .help("Channel number (0-3)")
                        .required(true)
                        .possible_values(&["0", "1", "2", "3"]),
                )
                .arg(
                    Arg::with_name("degrees")
                        .help("Phase in degrees (0.0 to 359.9)")
                        .required(true)
                        .validator(|v| {
                            v.parse::<f32>()
                                .map(|_| ())
                                .map_err(|_| "Phase must be a number in degrees".into())
                        }),
                ),
        )
        .subcommand(
            SubCommand::with_name("bias")
                .about("⚡ Switch PA bias for one channel")
                .arg(
                    Arg::with_name("channel")
                        .help("Channel number (0-3)")
                        .required(true)
                        .possible_values(&["0", "1", "2", "3"]),
                )
                .arg(
                    Arg::with_name("state")
                        .help("Bias state")
                        .required(true)
                        .possible_values(&["on", "off"]),
                ),
        )
        .subcommand(
            SubCommand::with_name("pulse")
                .about("⏱️  Configure pulse timing for one channel")
                .arg(
                    Arg::with_name("channel")
                        .help("Channel number (0-3)")
                        .required(true)
                        .possible_values(&["0", "1", "2", "3"]),
                )
                .arg(
                    Arg::with_name("width")
                        .help("Pulse width in 100 ns units")
                        .required(true)
                        .validator(parse_u32),
                )
                .arg(
                    Arg::with_name("measure-at")
                        .help("Z-monitor measurement point, offset from the rising edge")
                        .required(true)
                        .validator(parse_u32),
                ),
        )
        .subcommand(
            SubCommand::with_name("length")
                .about("📏 Negotiate the fixed response size")
                .arg(
                    Arg::with_name("bytes")
                        .help("Response size in bytes")
                        .required(true)
                        .possible_values(&["26", "48"]),
                ),
        )
        .subcommand(
            SubCommand::with_name("alarms")
                .about("🚨 Alarm enable and latch management")
                .subcommand(
                    SubCommand::with_name("enable")
                        .about("Set the alarm enable mask")
                        .arg(
                            Arg::with_name("mask")
                                .help("Bit mask of enabled alarm conditions (0-255)")
                                .required(true)
                                .validator(parse_u8),
                        ),
                )
                .subcommand(
                    SubCommand::with_name("clear")
                        .about("Clear latched alarm conditions")
                        .arg(
                            Arg::with_name("mask")
                                .help("Bit mask of latches to clear (0-255)")
                                .required(true)
                                .validator(parse_u8),
                        ),
                ),
        )
        .subcommand(
            SubCommand::with_name("pattern")
                .about("🎼 Pattern sequencer control")
                .subcommand(SubCommand::with_name("run").about("Start pattern playback"))
                .subcommand(SubCommand::with_name("stop").about("Stop at the current word"))
                .subcommand(SubCommand::with_name("step").about("Force one word, ignoring its tick"))
                .subcommand(SubCommand::with_name("abort").about("Kill playback immediately"))
                .subcommand(SubCommand::with_name("clear").about("Wipe the pattern RAM"))
                .subcommand(
                    SubCommand::with_name("addr")
                        .about("Set the load and start address")
                        .arg(
                            Arg::with_name("address")
                                .help("Word address (0-4095)")
                                .required(true)
                                .validator(parse_u16),
                        ),
                ),
        )
        .subcommand(
            SubCommand::with_name("meas")
                .about("📐 Trigger a Z-monitor measurement")
                .arg(
                    Arg::with_name("channel")
                        .help("Channel number (0-3)")
                        .required(true)
                        .possible_values(&["0", "1", "2", "3"]),
                )
                .arg(
                    Arg::with_name("type")
                        .help("Measurement type")
                        .required(true)
                        .possible_values(&["calibrate", "adc", "volts", "dbm"]),
                ),
        )
        .subcommand(
            SubCommand::with_name("server")
                .about("🚀 Start the instrument server")
                .arg(
                    Arg::with_name("background")
                        .short("b")
                        .long("background")
                        .help("Run server in background"),
                ),
        )
        .get_matches();

    let host = matches.value_of("host").unwrap();
    let port = matches.value_of("port").unwrap().parse::<u16>()?;
    let format = matches.value_of("format").unwrap();
    let verbose = matches.is_present("verbose");
    let version = match matches.value_of("response-size").unwrap() {
        "26" => ResponseVersion::Rev1,
        _ => ResponseVersion::Rev2,
    };

    if verbose {
        println!("{}", "📡 rfbus - RF Instrument Bus host".bright_blue().bold());
        println!("{} {}:{}", "Connecting to".dimmed(), host, port);
    }

    let ctx = Ctx {
        host: host.to_string(),
        port,
        format: format.to_string(),
        version,
    };

    match matches.subcommand() {
        ("status", _) => {
            let rsp = send_opcode(&ctx, Opcode::Status, &[]).await?;
            print_status(&rsp, &ctx.format);
        }
        ("reset", _) => {
            let rsp = send_opcode(&ctx, Opcode::Reset, &[]).await?;
            print_command_result("Reset", "issued", &rsp, &ctx.format);
        }
        ("freq", Some(sub_matches)) => {
            let hz: u32 = sub_matches.value_of("hz").unwrap().parse()?;
            let rsp = send_opcode(&ctx, Opcode::Freq, &hz.to_le_bytes()).await?;
            print_command_result("Frequency", &format!("{} Hz", hz), &rsp, &ctx.format);
        }
        ("power", Some(sub_matches)) => {
            let channel: u8 = sub_matches.value_of("channel").unwrap().parse()?;
            let dbm: f32 = sub_matches.value_of("dbm").unwrap().parse()?;
            let q8 = (dbm * 256.0).round() as u16;
            let mut payload = [0u8; 3];
            payload[0] = channel;
            payload[1..3].copy_from_slice(&q8.to_le_bytes());
            let rsp = send_opcode(&ctx, Opcode::Power, &payload).await?;
            print_command_result(
                "Power",
                &format!("ch{} = {} dBm", channel, dbm),
                &rsp,
                &ctx.format,
            );
        }
        ("phase", Some(sub_matches)) => {
            let channel: u8 = sub_matches.value_of("channel").unwrap().parse()?;
            let degrees: f32 = sub_matches.value_of("degrees").unwrap().parse()?;
            let decideg = (degrees * 10.0).round() as u16;
            let mut payload = [0u8; 3];
            payload[0] = channel;
            payload[1..3].copy_from_slice(&decideg.to_le_bytes());
            let rsp = send_opcode(&ctx, Opcode::Phase, &payload).await?;
            print_command_result(
                "Phase",
                &format!("ch{} = {}°", channel, degrees),
                &rsp,
                &ctx.format,
            );
        }
        ("bias", Some(sub_matches)) => {
            let channel: u8 = sub_matches.value_of("channel").unwrap().parse()?;
            let on = sub_matches.value_of("state").unwrap() == "on";
            let rsp = send_opcode(&ctx, Opcode::Bias, &[channel, u8::from(on)]).await?;
            print_command_result(
                "Bias",
                &format!("ch{} {}", channel, if on { "ON" } else { "OFF" }),
                &rsp,
                &ctx.format,
            );
        }
        ("pulse", Some(sub_matches)) => {
            let channel: u8 = sub_matches.value_of("channel").unwrap().parse()?;
            let width: u32 = sub_matches.value_of("width").unwrap().parse()?;
            let measure_at: u32 = sub_matches.value_of("measure-at").unwrap().parse()?;
            let mut payload = [0u8; 9];
            payload[0] = channel;
            payload[1..5].copy_from_slice(&width.to_le_bytes());
            payload[5..9].copy_from_slice(&measure_at.to_le_bytes());
            let rsp = send_opcode(&ctx, Opcode::Pulse, &payload).await?;
            print_command_result(
                "Pulse",
                &format!("ch{} width {}00 ns", channel, width),
                &rsp,
                &ctx.format,
            );
        }
        ("length", Some(sub_matches)) => {
            let bytes: u16 = sub_matches.value_of("bytes").unwrap().parse()?;
            let rsp = send_opcode(&ctx, Opcode::Length, &bytes.to_le_bytes()).await?;
            print_command_result("Response size", &format!("{} bytes", bytes), &rsp, &ctx.format);
        }
        ("alarms", Some(sub_matches)) => {
            handle_alarms_command(sub_matches, &ctx).await?;
        }
        ("pattern", Some(sub_matches)) => {
            handle_pattern_command(sub_matches, &ctx).await?;
        }
        ("meas", Some(sub_matches)) => {
            let channel: u8 = sub_matches.value_of("channel").unwrap().parse()?;
            let meas_type = match sub_matches.value_of("type").unwrap() {
                "calibrate" => 0u8,
                "adc" => 1,
                "volts" => 2,
                _ => 3,
            };
            let rsp = send_opcode(&ctx, Opcode::Meas, &[channel, meas_type]).await?;
            print_measurement(&rsp, &ctx.format);
        }
        ("server", Some(sub_matches)) => {
            handle_server(sub_matches, port)?;
        }
        _ => {
            println!(
                "{}",
                "No command specified. Use --help for usage information.".yellow()
            );
            println!("{}", "Quick start:".bright_green());
            println!("  {} Start the instrument server", "rfbus server".bright_cyan());
            println!("  {} Query the state register", "rfbus status".bright_cyan());
            println!("  {} Tune to 2.45 GHz", "rfbus freq 2450000000".bright_cyan());
        }
    }

    Ok(())
}

struct Ctx {
    host: String,
    port: u16,
    format: String,
    version: ResponseVersion,
}

async fn handle_alarms_command(
    matches: &ArgMatches<'_>,
    ctx: &Ctx,
) -> Result<(), Box<dyn std::error::Error>> {
    match matches.subcommand() {
        ("enable", Some(sub_matches)) => {
            let mask: u8 = sub_matches.value_of("mask").unwrap().parse()?;
            let rsp = send_opcode(ctx, Opcode::Alarms, &[0, mask]).await?;
            print_command_result("Alarm enables", &format!("{:#04x}", mask), &rsp, &ctx.format);
        }
        ("clear", Some(sub_matches)) => {
            let mask: u8 = sub_matches.value_of("mask").unwrap().parse()?;
            let rsp = send_opcode(ctx, Opcode::Alarms, &[1, mask]).await?;
            print_command_result("Alarm latches cleared", &format!("{:#04x}", mask), &rsp, &ctx.format);
        }
        _ => {
            println!(
                "{}",
                "Alarms subcommand required. Use 'rfbus alarms --help' for options.".yellow()
            );
        }
    }
    Ok(())
}

async fn handle_pattern_command(
    matches: &ArgMatches<'_>,
    ctx: &Ctx,
) -> Result<(), Box<dyn std::error::Error>> {
    match matches.subcommand() {
        ("run", _) => {
            let rsp = send_opcode(ctx, Opcode::PatCtl, &[PatternCtl::RUN]).await?;
            print_command_result("Pattern", "RUN", &rsp, &ctx.format);
        }
        ("stop", _) => {
            let rsp = send_opcode(ctx, Opcode::PatCtl, &[PatternCtl::STOP]).await?;
            print_command_result("Pattern", "STOP", &rsp, &ctx.format);
        }
        ("step", _) => {
            let rsp = send_opcode(ctx, Opcode::PatCtl, &[PatternCtl::STEP]).await?;
            print_command_result("Pattern", "STEP", &rsp, &ctx.format);
        }
        ("abort", _) => {
            let rsp = send_opcode(ctx, Opcode::PatCtl, &[PatternCtl::ABORT]).await?;
            print_command_result("Pattern", "ABORT", &rsp, &ctx.format);
        }
        ("clear", _) => {
            let rsp = send_opcode(ctx, Opcode::PatCtl, &[PatternCtl::RESET]).await?;
            print_command_result("Pattern", "CLEAR", &rsp, &ctx.format);
        }
        ("addr", Some(sub_matches)) => {
            let address: u16 = sub_matches.value_of("address").unwrap().parse()?;
            let rsp = send_opcode(ctx, Opcode::PatAdr, &address.to_le_bytes()).await?;
            print_command_result("Pattern address", &address.to_string(), &rsp, &ctx.format);
        }
        _ => {
            println!(
                "{}",
                "Pattern subcommand required. Use 'rfbus pattern --help' for options.".yellow()
            );
        }
    }
    Ok(())
}

fn handle_server(matches: &ArgMatches<'_>, port: u16) -> Result<(), Box<dyn std::error::Error>> {
    let background = matches.is_present("background");

    println!("{}", "🚀 Starting RF instrument server...".bright_green().bold());

    let mut cmd = Command::new("cargo");
    cmd.args(&["run", "--bin", "rfbus-instrument"]);

    if background {
        cmd.spawn()?;
        println!("{} Server started in background on port {}", "✅".green(), port);
    } else {
        println!(
            "{} Server starting on port {} (Press Ctrl+C to stop)",
            "🌐".bright_blue(),
            port
        );
        cmd.status()?;
    }

    Ok(())
}

// Helper functions

fn parse_u8(v: String) -> Result<(), String> {
    v.parse::<u8>()
        .map(|_| ())
        .map_err(|_| "Value must be 0-255".into())
}

fn parse_u16(v: String) -> Result<(), String> {
    v.parse::<u16>()
        .map(|_| ())
        .map_err(|_| "Value must be a 16-bit number".into())
}

fn parse_u32(v: String) -> Result<(), String> {
    v.parse::<u32>()
        .map(|_| ())
        .map_err(|_| "Value must be a 32-bit number".into())
}

async fn send_opcode(
    ctx: &Ctx,
    opcode: Opcode,
    payload: &[u8],
) -> Result<StatusResponse, Box<dyn std::error::Error>> {
    let addr = format!("{}:{}", ctx.host, ctx.port);
    let mut stream = match TcpStream::connect(&addr).await {
        Ok(stream) => stream,
        Err(e) => {
            eprintln!(
                "{} Failed to connect to instrument at {}",
                "❌".red(),
                addr.bright_white()
            );

            if e.kind() == std::io::ErrorKind::ConnectionRefused {
                eprintln!("{} Server is not running. Start it with:", "💡".yellow());
                eprintln!("   {}", "rfbus server".bright_cyan());
                eprintln!("   or");
                eprintln!("   {}", "cargo run --bin rfbus-instrument".bright_cyan());
            } else {
                eprintln!("{} Network error: {}", "🔌".yellow(), e.to_string().bright_red());
            }

            return Err(e.into());
        }
    };

    // Commands travel as whole sectors: frame, terminator, zero padding
    let mut block = encode_frame(opcode, payload);
    block.extend_from_slice(&encode_frame(Opcode::Terminator, &[]));
    pad_to_sector(&mut block);
    let size = ctx.version.size();

    match tokio::time::timeout(std::time::Duration::from_secs(5), async {
        stream.write_all(&block).await?;

        // Responses arrive one per padded sector; the fixed-size response
        // sits at the head
        let mut sector = vec![0u8; SECTOR_SIZE];
        stream.read_exact(&mut sector).await?;
        Ok::<_, std::io::Error>(sector)
    })
    .await
    {
        Ok(result) => {
            let sector = result?;
            let rsp = StatusResponse::decode(&sector[..size], ctx.version)
                .map_err(|e| format!("Bad response: {}", e))?;
            Ok(rsp)
        }
        Err(_) => {
            eprintln!("{} Command timed out after 5 seconds", "⏰".yellow());
            eprintln!(
                "{} Check that --response-size matches the instrument configuration",
                "💡".yellow()
            );
            Err("Command timeout".into())
        }
    }
}

fn print_command_result(action: &str, value: &str, rsp: &StatusResponse, format: &str) {
    match format {
        "json" => print_json(rsp),
        "compact" => {
            if rsp.error.is_success() {
                println!("{}", "OK".bright_green());
            } else {
                println!("{} {:?}", "ERR".bright_red(), rsp.error);
            }
        }
        _ => {
            if rsp.error.is_success() {
                println!(
                    "{} {} {}",
                    "✅".green(),
                    action.bright_white(),
                    value.bright_cyan()
                );
            } else {
                println!(
                    "{} {} failed: {:?}",
                    "❌".red(),
                    action.bright_white(),
                    rsp.error
                );
                if rsp.state.intersects(StateFlags::INITIALIZING) {
                    println!(
                        "{} Instrument is still initializing; retry shortly",
                        "💡".yellow()
                    );
                }
            }
        }
    }
}

fn print_status(rsp: &StatusResponse, format: &str) {
    match format {
        "json" => print_json(rsp),
        "compact" => {
            let state = if rsp.state.contains(StateFlags::INITIALIZED) {
                "READY".bright_green()
            } else {
                "INIT".yellow()
            };
            println!("{} | state {:#06x} | latch {:#04x}", state, rsp.state.bits(), rsp.alarms.latch);
        }
        _ => {
            println!("{}", "📊 Instrument Status".bright_blue().bold());
            println!("{}", "═══════════════════".bright_blue());
            println!(
                "State register: {}",
                format!("{:#06x}", rsp.state.bits()).bright_cyan()
            );
            print_flag("Initialized", rsp.state.contains(StateFlags::INITIALIZED));
            print_flag("Frequency busy", rsp.state.contains(StateFlags::FRQ_BUSY));
            print_flag("Power busy", rsp.state.contains(StateFlags::PWR_BUSY));
            print_flag("Phase busy", rsp.state.contains(StateFlags::PHS_BUSY));
            print_flag("Bias busy", rsp.state.contains(StateFlags::BIAS_BUSY));
            print_flag("Pattern running", rsp.state.contains(StateFlags::PTN_BUSY));
            print_flag("Bus active", rsp.state.contains(StateFlags::SPI_BUSY));
            println!("\n{}", "🚨 Alarms".bright_white().bold());
            println!("Enable: {:#04x}  Read: {:#04x}  Latch: {:#04x}",
                rsp.alarms.enable, rsp.alarms.read, rsp.alarms.latch);
        }
    }
}

fn print_measurement(rsp: &StatusResponse, format: &str) {
    match format {
        "json" => print_json(rsp),
        _ => {
            if rsp.error.is_success() && rsp.payload.len() >= 6 {
                let magnitude = u16::from_le_bytes([rsp.payload[2], rsp.payload[3]]);
                let phase = u16::from_le_bytes([rsp.payload[4], rsp.payload[5]]);
                println!(
                    "{} ch{}: magnitude {} ({:.1} dBm), phase {:.1}°",
                    "📐".bright_blue(),
                    rsp.payload[0],
                    magnitude,
                    f32::from(magnitude) / 256.0,
                    f32::from(phase) / 10.0
                );
            } else {
                println!("{} Measurement failed: {:?}", "❌".red(), rsp.error);
            }
        }
    }
}

fn print_flag(name: &str, set: bool) {
    let value = if set { "YES".bright_yellow() } else { " no".dimmed() };
    println!("  {:<16} {}", name, value);
}

fn print_json(rsp: &StatusResponse) {
    match serde_json::to_string(rsp) {
        Ok(json) => println!("{}", json),
        Err(e) => eprintln!("{} Failed to serialize response: {}", "❌".red(), e),
    }
}
