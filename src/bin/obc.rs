use clap::{App, AppSettings, Arg, ArgMatches, SubCommand};
use colored::*;
use eps::command::{
    decode_component_status, decode_fault_chunk, decode_health, decode_redundancy_telemetry, Command, NackReason,
    TLM_REDUNDANCY,
};
use eps::fault::SystemHealth;
use eps::link::ReassemblyContext;
use eps::logging::{LogEntry, LogLevel};
use eps::packet::{MessageType, Packet};
use eps::redundancy::{Component, FaultSummary};
use eps::subsystems::PowerProfile;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{self, Instant};

const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: &str = "7101";
const DEFAULT_TIMEOUT_MS: &str = "2000";

type BoxError = Box<dyn std::error::Error>;

struct Session {
    stream: TcpStream,
    rx: ReassemblyContext,
    sequence: u16,
    json: bool,
    verbose: bool,
    timeout: Duration,
}

impl Session {
    async fn connect(matches: &ArgMatches<'_>) -> Result<Self, BoxError> {
        let host = matches.value_of("host").unwrap_or(DEFAULT_HOST);
        let port: u16 = matches.value_of("port").unwrap_or(DEFAULT_PORT).parse()?;
        let timeout_ms: u64 = matches.value_of("timeout").unwrap_or(DEFAULT_TIMEOUT_MS).parse()?;
        let verbose = matches.is_present("verbose");
        if verbose {
            println!("{} {}:{}", "Connecting to".dimmed(), host, port);
        }
        Ok(Self {
            stream: TcpStream::connect((host, port)).await?,
            rx: ReassemblyContext::new(),
            sequence: 0,
            json: matches.value_of("format") == Some("json"),
            verbose,
            timeout: Duration::from_millis(timeout_ms),
        })
    }

    async fn send(&mut self, command: Command) -> Result<(), BoxError> {
        let packet = command.to_packet(self.sequence);
        self.sequence = self.sequence.wrapping_add(1);
        let frame = packet.to_frame()?;
        if self.verbose {
            println!("{} {:?} ({} bytes)", "->".dimmed(), command, frame.len());
        }
        self.stream.write_all(&frame).await?;
        Ok(())
    }

    /// Reads until `done` accepts a packet or the timeout expires. Packets
    /// that `done` does not claim (telemetry, logs) are printed on the side.
    async fn collect<F>(&mut self, mut done: F) -> Result<Vec<Packet>, BoxError>
    where
        F: FnMut(&Packet) -> Option<bool>,
    {
        let deadline = Instant::now() + self.timeout;
        let mut replies = Vec::new();
        let mut buf = [0u8; 512];
        loop {
            let n = match time::timeout_at(deadline, self.stream.read(&mut buf)).await {
                Ok(read) => read?,
                Err(_) => return Err("timed out waiting for the EPS".into()),
            };
            if n == 0 {
                return Err("connection closed by the EPS".into());
            }
            for &byte in &buf[..n] {
                match self.rx.push_byte(byte) {
                    Some(Ok(packet)) => match done(&packet) {
                        Some(finished) => {
                            replies.push(packet);
                            if finished {
                                return Ok(replies);
                            }
                        }
                        None => self.print_unsolicited(&packet),
                    },
                    Some(Err(err)) if self.verbose => println!("{} {}", "rx error:".yellow(), err),
                    _ => {}
                }
            }
        }
    }

    /// Sends `command` and waits for its reply, or for every chunk of it.
    async fn request(&mut self, command: Command) -> Result<Vec<Packet>, BoxError> {
        self.send(command).await?;
        let id = command.id();
        self.collect(|p| {
            let is_reply = p.command_id == id
                && matches!(p.message_type, MessageType::Response | MessageType::Ack | MessageType::Nack);
            is_reply.then_some(p.is_last_chunk || p.message_type != MessageType::Response)
        })
        .await
    }

    fn print_unsolicited(&self, packet: &Packet) {
        match packet.message_type {
            MessageType::Log => print_logs(packet, self.json),
            MessageType::Telemetry => print_telemetry(packet, self.json),
            _ if self.verbose => println!("{} {:?}", "unsolicited".dimmed(), packet),
            _ => {}
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    let matches = App::new("eps-obc")
        .version("0.1.0")
        .about("Ground-side OBC client for the EPS node")
        .setting(AppSettings::SubcommandRequiredElseHelp)
        .arg(
            Arg::with_name("host")
                .short("H")
                .long("host")
                .value_name("HOST")
                .takes_value(true)
                .default_value(DEFAULT_HOST)
                .global(true),
        )
        .arg(
            Arg::with_name("port")
                .short("p")
                .long("port")
                .value_name("PORT")
                .help("UART bridge port (primary 7101, secondary 7102)")
                .takes_value(true)
                .default_value(DEFAULT_PORT)
                .global(true),
        )
        .arg(
            Arg::with_name("format")
                .short("f")
                .long("format")
                .takes_value(true)
                .possible_values(&["table", "json"])
                .default_value("table")
                .global(true),
        )
        .arg(
            Arg::with_name("timeout")
                .long("timeout")
                .value_name("MS")
                .takes_value(true)
                .default_value(DEFAULT_TIMEOUT_MS)
                .global(true),
        )
        .arg(Arg::with_name("verbose").short("v").long("verbose").global(true))
        .subcommand(
            SubCommand::with_name("ping")
                .about("Round-trip test")
                .arg(Arg::with_name("data").help("Bytes to echo").index(1)),
        )
        .subcommand(SubCommand::with_name("health").about("System health snapshot"))
        .subcommand(
            SubCommand::with_name("component")
                .about("Health of one redundant component")
                .arg(Arg::with_name("id").required(true).help("0=UART A 1=UART B 2=5V bus 3=3V3 bus 4=battery")),
        )
        .subcommand(SubCommand::with_name("faults").about("List active faults"))
        .subcommand(
            SubCommand::with_name("clear")
                .about("Clear one fault")
                .arg(Arg::with_name("source").required(true).help("0=battery 1=mppt 2=rail 3=sensor 4=uart"))
                .arg(Arg::with_name("code").required(true).help("Fault code, decimal or 0x-prefixed")),
        )
        .subcommand(SubCommand::with_name("clear-all").about("Clear every fault"))
        .subcommand(
            SubCommand::with_name("recover")
                .about("Mark a component recovered")
                .arg(Arg::with_name("id").required(true)),
        )
        .subcommand(
            SubCommand::with_name("rail")
                .about("Switch a power rail")
                .arg(Arg::with_name("state").required(true).possible_values(&["on", "off"]))
                .arg(Arg::with_name("index").required(true)),
        )
        .subcommand(
            SubCommand::with_name("mppt")
                .about("Switch a solar charge channel")
                .arg(Arg::with_name("state").required(true).possible_values(&["on", "off"]))
                .arg(Arg::with_name("channel").required(true)),
        )
        .subcommand(
            SubCommand::with_name("profile")
                .about("Select the power profile")
                .arg(Arg::with_name("name").required(true).possible_values(&["nominal", "safe"])),
        )
        .subcommand(SubCommand::with_name("flush-logs").about("Request a flight log downlink"))
        .subcommand(
            SubCommand::with_name("log-level")
                .about("Set the flight log threshold")
                .arg(
                    Arg::with_name("level")
                        .required(true)
                        .possible_values(&["debug", "info", "warn", "error", "fatal"]),
                ),
        )
        .subcommand(
            SubCommand::with_name("monitor")
                .about("Print telemetry and log packets as they arrive")
                .arg(Arg::with_name("duration").short("d").long("duration").value_name("SECONDS").takes_value(true)),
        )
        .get_matches();

    let (name, sub) = matches.subcommand();
    let sub = sub.unwrap_or(&matches);
    let mut session = Session::connect(sub).await?;

    match name {
        "ping" => {
            let data = sub.value_of("data").unwrap_or("");
            if !data.is_empty() {
                // The echo payload rides on the raw packet.
                let mut packet = Command::Ping.to_packet(session.sequence);
                packet.payload = eps::packet::Payload::from_slice(data.as_bytes()).map_err(|()| "ping data too long")?;
                session.stream.write_all(&packet.to_frame()?).await?;
                session.sequence = session.sequence.wrapping_add(1);
                let replies = session.collect(|p| (p.message_type == MessageType::Ack).then_some(true)).await?;
                print_ack(&replies, &session);
            } else {
                let replies = session.request(Command::Ping).await?;
                print_ack(&replies, &session);
            }
        }
        "health" => {
            let replies = session.request(Command::GetHealth).await?;
            for p in expect_response(&replies)? {
                let snapshot = decode_health(&p.payload).ok_or("malformed health response")?;
                if session.json {
                    println!("{}", serde_json::to_string(&snapshot)?);
                } else {
                    println!("{} {}", "Health:".bright_white(), health_label(snapshot.health));
                    println!("{} {}", "Active faults:".bright_white(), snapshot.active_faults);
                    println!("{} {} ms", "Uptime:".bright_white(), snapshot.timestamp_ms);
                }
            }
        }
        "component" => {
            let component_id = parse_u8(sub.value_of("id"))?;
            let replies = session.request(Command::GetComponentStatus { component_id }).await?;
            for p in expect_response(&replies)? {
                let status = decode_component_status(&p.payload).ok_or("malformed component status")?;
                if session.json {
                    println!("{}", serde_json::to_string(&status)?);
                } else {
                    let state = if status.healthy { "healthy".bright_green() } else { "DEGRADED".bright_red() };
                    print!("{} {:?}: {}", "Component".bright_white(), status.component, state);
                    match status.fault_source {
                        Some(source) => println!(" (last fault from {:?})", source),
                        None => println!(),
                    }
                }
            }
        }
        "faults" => {
            let replies = session.request(Command::GetFaultList).await?;
            let mut faults: Vec<FaultSummary> = Vec::new();
            let mut total = 0;
            for p in expect_response(&replies)? {
                let chunk = decode_fault_chunk(&p.payload).ok_or("malformed fault list chunk")?;
                total = chunk.total_faults;
                faults.extend(chunk.faults);
            }
            if session.json {
                println!("{}", serde_json::to_string(&faults)?);
            } else {
                println!("{} {} active", "Faults:".bright_blue().bold(), total);
                for f in &faults {
                    println!(
                        "  {:<8} {:#06x}  {:<9} x{:<5} since {} ms",
                        format!("{:?}", f.source),
                        f.code,
                        format!("{:?}", f.severity),
                        f.occurrence_count,
                        f.first_seen_ms
                    );
                }
            }
        }
        "clear" => {
            let source_id = parse_u8(sub.value_of("source"))?;
            let code = parse_u32(sub.value_of("code"))?;
            let replies = session.request(Command::ClearFault { source_id, code }).await?;
            for p in expect_response(&replies)? {
                let cleared = p.payload.get(5).is_some_and(|&b| b != 0);
                if cleared {
                    println!("{} fault {}/{:#x} cleared", "OK".bright_green(), source_id, code);
                } else {
                    println!("{} no active fault {}/{:#x}", "--".yellow(), source_id, code);
                }
            }
        }
        "clear-all" => {
            let replies = session.request(Command::ClearAllFaults).await?;
            for p in expect_response(&replies)? {
                println!("{} {} faults cleared", "OK".bright_green(), p.payload.first().copied().unwrap_or(0));
            }
        }
        "recover" => {
            let id = parse_u8(sub.value_of("id"))?;
            let component = Component::from_id(id).ok_or("unknown component id")?;
            let replies = session.request(Command::RecoverComponent { component }).await?;
            print_ack(&replies, &session);
        }
        "rail" => {
            let rail = parse_u8(sub.value_of("index"))?;
            let command = if sub.value_of("state") == Some("on") {
                Command::EnableRail { rail }
            } else {
                Command::DisableRail { rail }
            };
            let replies = session.request(command).await?;
            for p in expect_response(&replies)? {
                match p.payload[..] {
                    [rail, enabled, 1] => println!(
                        "{} rail {} {}",
                        "OK".bright_green(),
                        rail,
                        if enabled != 0 { "enabled" } else { "disabled" }
                    ),
                    _ => println!("{} rail request refused", "FAIL".bright_red()),
                }
            }
        }
        "mppt" => {
            let channel = parse_u8(sub.value_of("channel"))?;
            let command = if sub.value_of("state") == Some("on") {
                Command::EnableMppt { channel }
            } else {
                Command::DisableMppt { channel }
            };
            let replies = session.request(command).await?;
            for p in expect_response(&replies)? {
                match p.payload[..] {
                    [channel, enabled, 1] => println!(
                        "{} MPPT channel {} {}",
                        "OK".bright_green(),
                        channel,
                        if enabled != 0 { "enabled" } else { "disabled" }
                    ),
                    _ => println!("{} MPPT request refused", "FAIL".bright_red()),
                }
            }
        }
        "profile" => {
            let profile = if sub.value_of("name") == Some("safe") {
                PowerProfile::Safe
            } else {
                PowerProfile::Nominal
            };
            let replies = session.request(Command::SetPowerProfile { profile }).await?;
            print_ack(&replies, &session);
        }
        "flush-logs" => {
            let replies = session.request(Command::FlushLogs).await?;
            print_ack(&replies, &session);
            // Log packets follow the ack; show whatever arrives in time.
            let _ = session.collect(|_| None).await;
        }
        "log-level" => {
            let level = match sub.value_of("level") {
                Some("debug") => LogLevel::Debug,
                Some("warn") => LogLevel::Warn,
                Some("error") => LogLevel::Error,
                Some("fatal") => LogLevel::Fatal,
                _ => LogLevel::Info,
            };
            let replies = session.request(Command::SetLogLevel { level }).await?;
            print_ack(&replies, &session);
        }
        "monitor" => {
            if let Some(secs) = sub.value_of("duration") {
                session.timeout = Duration::from_secs(secs.parse()?);
            } else {
                session.timeout = Duration::from_secs(u64::from(u32::MAX));
            }
            println!("{}", "Monitoring EPS downlink (Ctrl+C to stop)".bright_blue());
            match session.collect(|_| None).await {
                Err(e) if e.to_string().starts_with("timed out") => {}
                Err(e) => return Err(e),
                Ok(_) => {}
            }
        }
        _ => unreachable!("clap enforces a subcommand"),
    }
    Ok(())
}

fn expect_response(replies: &[Packet]) -> Result<&[Packet], BoxError> {
    if let Some(nack) = replies.iter().find(|p| p.message_type == MessageType::Nack) {
        let reason = nack.payload.first().copied().and_then(NackReason::from_u8);
        return Err(format!("EPS rejected the command: {reason:?}").into());
    }
    Ok(replies)
}

fn print_ack(replies: &[Packet], session: &Session) {
    for p in replies {
        match p.message_type {
            MessageType::Ack if session.json => println!(r#"{{"ack":true,"command":{}}}"#, p.command_id),
            MessageType::Ack if !p.payload.is_empty() => {
                println!("{} {}", "ACK".bright_green(), String::from_utf8_lossy(&p.payload));
            }
            MessageType::Ack => println!("{}", "ACK".bright_green()),
            _ => {
                let reason = p.payload.first().copied().and_then(NackReason::from_u8);
                println!("{} {:?}", "NACK".bright_red(), reason);
            }
        }
    }
}

fn print_logs(packet: &Packet, json: bool) {
    for entry in LogEntry::decode_all(&packet.payload) {
        if json {
            if let Ok(line) = serde_json::to_string(&entry) {
                println!("{line}");
            }
            continue;
        }
        let level = match entry.level {
            LogLevel::Debug => "DEBUG".dimmed(),
            LogLevel::Info => "INFO ".normal(),
            LogLevel::Warn => "WARN ".yellow(),
            LogLevel::Error => "ERROR".red(),
            LogLevel::Fatal => "FATAL".bright_red().bold(),
        };
        println!("[{:>10}] {} {:#04x} {}", entry.timestamp_ms, level, entry.component, entry.message);
    }
}

fn print_telemetry(packet: &Packet, json: bool) {
    if packet.command_id != TLM_REDUNDANCY {
        println!("{} {:#04x} {:02x?}", "TLM".dimmed(), packet.command_id, &packet.payload[..]);
        return;
    }
    let Some(t) = decode_redundancy_telemetry(&packet.payload) else {
        return;
    };
    if json {
        if let Ok(line) = serde_json::to_string(&t) {
            println!("{line}");
        }
    } else {
        println!(
            "{} {} active={} lifetime={} degraded={:#07b} t={}ms",
            "TLM".bright_cyan(),
            health_label(t.health),
            t.active_faults,
            t.lifetime_faults,
            t.degraded_components,
            t.timestamp_ms
        );
    }
}

fn health_label(health: SystemHealth) -> ColoredString {
    match health {
        SystemHealth::Ok => "OK".bright_green(),
        SystemHealth::Degraded => "DEGRADED".yellow(),
        SystemHealth::Fault => "FAULT".bright_red().bold(),
    }
}

fn parse_u8(value: Option<&str>) -> Result<u8, BoxError> {
    Ok(u8::try_from(parse_u32(value)?)?)
}

fn parse_u32(value: Option<&str>) -> Result<u32, BoxError> {
    let value = value.ok_or("missing argument")?;
    let parsed = match value.strip_prefix("0x") {
        Some(hex) => u32::from_str_radix(hex, 16)?,
        None => value.parse()?,
    };
    Ok(parsed)
}
