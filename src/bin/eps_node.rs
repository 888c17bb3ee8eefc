use clap::{App, Arg};
use eps::config::EpsConfig;
use eps::link::ChannelId;
use eps::subsystems::{BatteryReading, RailReading, SimulatedSensors};
use eps::transport::{LineError, MemoryPort};
use eps::EpsNode;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::time;
use tracing::{error, info, warn, Level};

const DEFAULT_PRIMARY_PORT: &str = "7101";
const DEFAULT_SECONDARY_PORT: &str = "7102";
const TX_FORWARD_PERIOD_MS: u64 = 5;
const SCENARIO_START_TICK: u64 = 200;
const SCENARIO_END_TICK: u64 = 800;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Scenario {
    Nominal,
    /// Battery sags into critical-low, forcing the safe profile, then
    /// recharges fully.
    Brownout,
    /// The 5 V bus rail draws past its limit for a while.
    Overcurrent,
    /// Noise burst on the primary UART forces a failover.
    UartNoise,
}

impl Scenario {
    fn parse(name: &str) -> Self {
        match name {
            "brownout" => Scenario::Brownout,
            "overcurrent" => Scenario::Overcurrent,
            "uart-noise" => Scenario::UartNoise,
            _ => Scenario::Nominal,
        }
    }

    fn apply(self, tick: u64, node: &mut EpsNode<MemoryPort, SimulatedSensors>, primary: &MemoryPort) {
        match (self, tick) {
            (Scenario::Brownout, SCENARIO_START_TICK) => {
                info!("scenario: battery brown-out");
                node.sensors_mut().set_battery(BatteryReading {
                    voltage_mv: 3200,
                    current_ma: -800,
                    temperature_c: 18.0,
                });
            }
            (Scenario::Brownout, SCENARIO_END_TICK) => {
                info!("scenario: battery recharged");
                node.sensors_mut().set_battery(BatteryReading {
                    voltage_mv: 4180,
                    current_ma: 600,
                    temperature_c: 21.0,
                });
            }
            (Scenario::Overcurrent, SCENARIO_START_TICK) => {
                info!("scenario: 5V bus overcurrent");
                node.sensors_mut().set_rail(
                    5,
                    RailReading {
                        voltage_mv: 4900,
                        current_ma: 6200,
                    },
                );
            }
            (Scenario::Overcurrent, SCENARIO_END_TICK) => {
                info!("scenario: 5V bus load removed");
                node.sensors_mut().restore_rail(5);
            }
            (Scenario::UartNoise, SCENARIO_START_TICK) => {
                info!("scenario: noise on primary UART");
                primary.rx_line().on_line_error(LineError::Noise);
            }
            _ => {}
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let matches = App::new("eps-node")
        .version("0.1.0")
        .about("EPS resilience core running against simulated sensors")
        .arg(
            Arg::with_name("config")
                .short("c")
                .long("config")
                .value_name("FILE")
                .help("JSON configuration file")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("primary")
                .long("primary-port")
                .value_name("PORT")
                .help("TCP port standing in for the primary UART")
                .takes_value(true)
                .default_value(DEFAULT_PRIMARY_PORT),
        )
        .arg(
            Arg::with_name("secondary")
                .long("secondary-port")
                .value_name("PORT")
                .help("TCP port standing in for the secondary UART")
                .takes_value(true)
                .default_value(DEFAULT_SECONDARY_PORT),
        )
        .arg(
            Arg::with_name("scenario")
                .short("s")
                .long("scenario")
                .value_name("NAME")
                .help("Scripted fault scenario")
                .takes_value(true)
                .possible_values(&["nominal", "brownout", "overcurrent", "uart-noise"])
                .default_value("nominal"),
        )
        .arg(
            Arg::with_name("ticks")
                .short("t")
                .long("ticks")
                .value_name("COUNT")
                .help("Stop after this many ticks (default: run until Ctrl+C)")
                .takes_value(true),
        )
        .arg(Arg::with_name("verbose").short("v").long("verbose").help("Debug logging"))
        .get_matches();

    let level = if matches.is_present("verbose") { Level::DEBUG } else { Level::INFO };
    tracing_subscriber::fmt().with_max_level(level).init();

    let config = match matches.value_of("config") {
        Some(path) => EpsConfig::from_json(&std::fs::read_to_string(path)?)?,
        None => EpsConfig::default(),
    };
    let primary_port: u16 = matches.value_of("primary").unwrap_or(DEFAULT_PRIMARY_PORT).parse()?;
    let secondary_port: u16 = matches.value_of("secondary").unwrap_or(DEFAULT_SECONDARY_PORT).parse()?;
    let scenario = Scenario::parse(matches.value_of("scenario").unwrap_or("nominal"));
    let max_ticks = matches.value_of("ticks").map(str::parse::<u64>).transpose()?;

    println!("EPS node");
    println!("========");

    let primary = MemoryPort::new();
    let secondary = MemoryPort::new();
    // No ground station yet.
    primary.set_ready(false);
    secondary.set_ready(false);

    let sensors = SimulatedSensors::new(&config.rails);
    let tick_period = Duration::from_millis(u64::from(config.tick_period_ms));
    let mut node = EpsNode::new(config, primary.clone(), secondary.clone(), sensors)?;

    let uarts = [
        tokio::spawn(serve_uart(ChannelId::Primary, primary_port, primary.clone())),
        tokio::spawn(serve_uart(ChannelId::Secondary, secondary_port, secondary.clone())),
    ];

    info!(?scenario, period_ms = tick_period.as_millis() as u64, "main loop starting");
    let mut interval = time::interval(tick_period);
    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted");
                break;
            }
        }

        let tick = node.ticks() + 1;
        scenario.apply(tick, &mut node, &primary);
        node.tick();

        if max_ticks.is_some_and(|max| node.ticks() >= max) {
            break;
        }
    }

    let telemetry = node.redundancy().telemetry();
    info!(
        health = ?telemetry.health,
        active = telemetry.active_faults,
        lifetime = telemetry.lifetime_faults,
        degraded = format_args!("{:#07b}", telemetry.degraded_components),
        active_channel = ?node.failover().active(),
        profile = ?node.profiles().current(),
        "node stopped"
    );
    for task in uarts {
        task.abort();
    }
    Ok(())
}

/// Accepts one ground connection at a time on `port` and bridges it to the
/// in-memory UART: inbound bytes go to the receive line, the node's writes
/// are forwarded back.
async fn serve_uart(channel: ChannelId, port: u16, uart: MemoryPort) {
    let listener = match TcpListener::bind(("127.0.0.1", port)).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(?channel, port, "cannot bind UART listener: {}", e);
            return;
        }
    };
    info!(?channel, port, "UART listening");

    loop {
        let (stream, addr) = match listener.accept().await {
            Ok(conn) => conn,
            Err(e) => {
                warn!(?channel, "accept failed: {}", e);
                continue;
            }
        };
        info!(?channel, %addr, "ground station connected");
        let (mut reader, mut writer) = stream.into_split();
        let rx = uart.rx_line();
        uart.set_ready(true);

        let forward_uart = uart.clone();
        let forward = tokio::spawn(async move {
            let mut interval = time::interval(Duration::from_millis(TX_FORWARD_PERIOD_MS));
            loop {
                interval.tick().await;
                let bytes = forward_uart.take_tx();
                if !bytes.is_empty() && writer.write_all(&bytes).await.is_err() {
                    break;
                }
            }
        });

        let mut buf = [0u8; 256];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => rx.on_bytes(&buf[..n]),
                Err(e) => {
                    warn!(?channel, "read failed: {}", e);
                    rx.on_line_error(LineError::Framing);
                    break;
                }
            }
        }

        forward.abort();
        uart.set_ready(false);
        // Drop anything queued for the departed client.
        let _ = uart.take_tx();
        info!(?channel, %addr, "ground station disconnected");
    }
}
