use eps::command::*;
use eps::config::EpsConfig;
use eps::bus::Event;
use eps::fault::{FaultSource, Severity, SystemHealth, MAX_ACTIVE_FAULTS};
use eps::link::{ChannelId, ReassemblyContext};
use eps::logging::LogEntry;
use eps::node::NodeError;
use eps::packet::*;
use eps::redundancy::Component;
use eps::subsystems::{BatteryReading, PowerProfile, RailReading, RailStatus, SimulatedSensors};
use eps::transport::{LineError, MemoryPort};
use eps::EpsNode;

struct Harness {
    node: EpsNode<MemoryPort, SimulatedSensors>,
    primary: MemoryPort,
    secondary: MemoryPort,
    sequence: u16,
}

impl Harness {
    fn new() -> Self {
        let config = EpsConfig::default();
        let sensors = SimulatedSensors::new(&config.rails);
        let primary = MemoryPort::new();
        let secondary = MemoryPort::new();
        let node = EpsNode::new(config, primary.clone(), secondary.clone(), sensors).unwrap();
        Self {
            node,
            primary,
            secondary,
            sequence: 0,
        }
    }

    fn port(&self, channel: ChannelId) -> &MemoryPort {
        match channel {
            ChannelId::Primary => &self.primary,
            ChannelId::Secondary => &self.secondary,
        }
    }

    fn uplink(&mut self, channel: ChannelId, command: Command) {
        let frame = command.to_packet(self.sequence).to_frame().unwrap();
        self.sequence += 1;
        self.port(channel).rx_line().on_bytes(&frame);
    }

    /// Sends a command, runs one tick and returns what came back.
    fn request(&mut self, channel: ChannelId, command: Command) -> Vec<Packet> {
        self.uplink(channel, command);
        self.node.tick();
        self.downlink(channel)
    }

    fn downlink(&self, channel: ChannelId) -> Vec<Packet> {
        let mut ctx = ReassemblyContext::new();
        self.port(channel)
            .take_tx()
            .into_iter()
            .filter_map(|b| ctx.push_byte(b))
            .map(Result::unwrap)
            .collect()
    }
}

#[test]
fn test_health_query_round_trip() {
    let mut h = Harness::new();
    let replies = h.request(ChannelId::Primary, Command::GetHealth);

    assert_eq!(replies.len(), 1);
    let reply = &replies[0];
    assert_eq!(reply.message_type, MessageType::Response);
    assert_eq!(reply.command_id, CMD_GET_HEALTH);
    assert_eq!(reply.destination, ADDR_OBC);
    let snapshot = decode_health(&reply.payload).unwrap();
    assert_eq!(snapshot.health, SystemHealth::Ok);
    assert_eq!(snapshot.active_faults, 0);
    assert_eq!(snapshot.timestamp_ms, 10);
}

#[test]
fn test_ping_echoes_payload() {
    let mut h = Harness::new();
    let ping = Packet::new(ADDR_EPS, ADDR_OBC, MessageType::Command, CMD_PING, b"hello").unwrap();
    h.primary.rx_line().on_bytes(&ping.to_frame().unwrap());
    h.node.tick();

    let replies = h.downlink(ChannelId::Primary);
    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0].message_type, MessageType::Ack);
    assert_eq!(&replies[0].payload[..], b"hello");
}

#[test]
fn test_command_burst_is_answered_across_ticks() {
    let mut h = Harness::new();
    let mut burst = Vec::new();
    for i in 0..30u8 {
        let ping = Packet::new(ADDR_EPS, ADDR_OBC, MessageType::Command, CMD_PING, &[i])
            .unwrap()
            .with_sequence(u16::from(i));
        burst.extend(ping.to_frame().unwrap());
    }
    h.primary.rx_line().on_bytes(&burst);

    h.node.run_ticks(4);
    let replies = h.downlink(ChannelId::Primary);
    assert_eq!(replies.len(), 30);
    assert!(replies
        .iter()
        .enumerate()
        .all(|(i, r)| r.message_type == MessageType::Ack && r.payload[..] == [i as u8]));
    assert_eq!(h.node.bus().queue().dropped(), 0);
}

#[test]
fn test_malformed_commands_are_nacked() {
    let mut h = Harness::new();
    let unknown = Packet::new(ADDR_EPS, ADDR_OBC, MessageType::Command, 0x7F, &[]).unwrap();
    h.primary.rx_line().on_bytes(&unknown.to_frame().unwrap());
    h.node.tick();
    let replies = h.downlink(ChannelId::Primary);
    assert_eq!(replies[0].message_type, MessageType::Nack);
    assert_eq!(replies[0].payload[..], [NackReason::UnknownCommand as u8]);

    let replies = h.request(ChannelId::Primary, Command::GetComponentStatus { component_id: 9 });
    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0].message_type, MessageType::Nack);
    assert_eq!(replies[0].command_id, CMD_GET_COMPONENT_STATUS);
    assert_eq!(replies[0].payload[..], [NackReason::InvalidParameter as u8, 9]);
}

#[test]
fn test_packets_for_other_nodes_are_ignored() {
    let mut h = Harness::new();
    let foreign = Packet::new(0x07, ADDR_OBC, MessageType::Command, CMD_GET_HEALTH, &[]).unwrap();
    h.primary.rx_line().on_bytes(&foreign.to_frame().unwrap());
    h.node.tick();
    assert!(h.downlink(ChannelId::Primary).is_empty());
}

#[test]
fn test_rail_overcurrent_flows_into_fault_list() {
    let mut h = Harness::new();
    h.node.sensors_mut().set_rail(
        5,
        RailReading {
            voltage_mv: 5000,
            current_ma: 6500,
        },
    );
    h.node.run_ticks(10);

    assert_eq!(h.node.rails().state(5).unwrap().status, RailStatus::Overcurrent);
    assert_eq!(h.node.redundancy().health(), SystemHealth::Degraded);
    assert!(!h.node.redundancy().is_component_healthy(Component::Bus5V));

    let replies = h.request(ChannelId::Primary, Command::GetFaultList);
    assert_eq!(replies.len(), 1);
    assert!(replies[0].is_last_chunk);
    let chunk = decode_fault_chunk(&replies[0].payload).unwrap();
    assert_eq!(chunk.total_faults, 1);
    assert_eq!(chunk.faults[0].source, FaultSource::Rail);
    assert_eq!(chunk.faults[0].code, 0x0105);

    let replies = h.request(ChannelId::Primary, Command::GetComponentStatus { component_id: 2 });
    let status = decode_component_status(&replies[0].payload).unwrap();
    assert_eq!(status.component, Component::Bus5V);
    assert!(!status.healthy);
    assert_eq!(status.fault_source, Some(FaultSource::Rail));
}

#[test]
fn test_fault_list_spans_multiple_packets() {
    let mut h = Harness::new();
    for rail in 0..5 {
        h.node.sensors_mut().set_rail(
            rail,
            RailReading {
                voltage_mv: 100,
                current_ma: 0,
            },
        );
    }
    h.node.run_ticks(10);
    assert_eq!(h.node.redundancy().faults().active_count(), 5);

    let replies = h.request(ChannelId::Primary, Command::GetFaultList);
    assert_eq!(replies.len(), 2);
    assert_eq!(replies.iter().map(|p| p.is_last_chunk).collect::<Vec<_>>(), [false, true]);
    let counts: Vec<u8> = replies
        .iter()
        .map(|p| decode_fault_chunk(&p.payload).unwrap().faults_in_chunk)
        .collect();
    assert_eq!(counts, [4, 1]);
}

#[test]
fn test_primary_line_error_fails_over_and_recovers() {
    let mut h = Harness::new();
    h.primary.rx_line().on_line_error(LineError::Noise);
    h.node.tick();

    assert_eq!(h.node.failover().active(), ChannelId::Secondary);
    assert_eq!(h.node.redundancy().health(), SystemHealth::Degraded);
    assert_eq!(h.node.link(ChannelId::Primary).stats().line_errors, 1);

    // Replies now leave on the secondary, whichever channel the request used.
    let replies = h.request(ChannelId::Primary, Command::GetHealth);
    assert!(replies.is_empty());
    let replies = h.downlink(ChannelId::Secondary);
    assert_eq!(decode_health(&replies[0].payload).unwrap().health, SystemHealth::Degraded);

    let replies = h.request(
        ChannelId::Secondary,
        Command::RecoverComponent {
            component: Component::UartPrimary,
        },
    );
    assert_eq!(replies[0].message_type, MessageType::Ack);
    assert_eq!(h.node.failover().active(), ChannelId::Primary);
    assert!(h.node.redundancy().is_component_healthy(Component::UartPrimary));

    // The fault itself stays until cleared.
    let code = u32::from(LineError::Noise as u8);
    let replies = h.request(
        ChannelId::Primary,
        Command::ClearFault {
            source_id: FaultSource::Uart as u8,
            code,
        },
    );
    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0].payload[5], 1);
    assert_eq!(h.node.redundancy().health(), SystemHealth::Ok);
}

#[test]
fn test_clear_all_command_reports_count() {
    let mut h = Harness::new();
    h.primary.rx_line().on_line_error(LineError::Overrun);
    h.secondary.rx_line().on_line_error(LineError::Parity);
    h.node.tick();
    assert_eq!(h.node.redundancy().faults().active_count(), 2);

    // The primary failed first, while the secondary was still healthy.
    assert_eq!(h.node.failover().active(), ChannelId::Secondary);
    assert_eq!(h.node.redundancy().degraded_bitmap(), 0b11);

    // Clearing recovers the primary before the response leaves.
    h.uplink(ChannelId::Secondary, Command::ClearAllFaults);
    h.node.tick();
    let replies = h.downlink(ChannelId::Primary);
    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0].command_id, CMD_CLEAR_ALL_FAULTS);
    assert_eq!(replies[0].payload[..], [2]);
    assert_eq!(h.node.redundancy().health(), SystemHealth::Ok);
    assert_eq!(h.node.redundancy().degraded_bitmap(), 0);
    assert_eq!(h.node.failover().active(), ChannelId::Primary);
}

#[test]
fn test_rail_commands_switch_power() {
    let mut h = Harness::new();
    let replies = h.request(ChannelId::Primary, Command::DisableRail { rail: 3 });
    assert_eq!(replies[0].command_id, CMD_DISABLE_RAIL);
    assert_eq!(replies[0].payload[..], [3, 0, 1]);
    assert!(!h.node.rails().state(3).unwrap().enabled);

    let replies = h.request(ChannelId::Primary, Command::EnableRail { rail: 3 });
    assert_eq!(replies[0].payload[..], [3, 1, 1]);
    assert!(h.node.rails().state(3).unwrap().enabled);

    let replies = h.request(ChannelId::Primary, Command::EnableRail { rail: 42 });
    assert_eq!(replies[0].command_id, CMD_ENABLE_RAIL);
    assert_eq!(replies[0].payload[..], [42, 0, 0]);
}

#[test]
fn test_flush_logs_downlinks_recorded_events() {
    let mut h = Harness::new();
    h.node.sensors_mut().set_rail(
        6,
        RailReading {
            voltage_mv: 3300,
            current_ma: 4500,
        },
    );
    h.node.run_ticks(10);
    assert!(h.node.log().pending_count() > 0);
    let _ = h.downlink(ChannelId::Primary);

    let replies = h.request(ChannelId::Primary, Command::FlushLogs);
    assert_eq!(replies[0].message_type, MessageType::Ack);
    let logs: Vec<&Packet> = replies.iter().filter(|p| p.message_type == MessageType::Log).collect();
    assert!(!logs.is_empty());
    assert!(logs.last().unwrap().is_last_chunk);
    let entries: Vec<LogEntry> = logs.iter().flat_map(|p| LogEntry::decode_all(&p.payload)).collect();
    assert!(!entries.is_empty());
    assert_eq!(h.node.log().pending_count(), 0);
}

#[test]
fn test_logs_wait_while_no_link_is_ready() {
    let mut h = Harness::new();
    h.primary.set_ready(false);
    h.node.sensors_mut().set_rail(
        6,
        RailReading {
            voltage_mv: 2000,
            current_ma: 0,
        },
    );
    h.node.run_ticks(10);
    let pending = h.node.log().pending_count();
    assert!(pending > 0);

    h.uplink(ChannelId::Primary, Command::FlushLogs);
    h.node.tick();
    assert_eq!(h.node.log().pending_count(), pending);
    assert!(h.primary.take_tx().is_empty());
}

#[test]
fn test_periodic_redundancy_telemetry() {
    let mut h = Harness::new();
    h.node.run_ticks(300);
    let telemetry: Vec<Packet> = h
        .downlink(ChannelId::Primary)
        .into_iter()
        .filter(|p| p.message_type == MessageType::Telemetry && p.command_id == TLM_REDUNDANCY)
        .collect();
    assert_eq!(telemetry.len(), 1);
    let t = decode_redundancy_telemetry(&telemetry[0].payload).unwrap();
    assert_eq!(t.health, SystemHealth::Ok);
    assert_eq!(t.timestamp_ms, 3000);
    assert_eq!(t.degraded_components, 0);
}

#[test]
fn test_invalid_config_is_rejected() {
    let mut config = EpsConfig::default();
    config.tick_period_ms = 0;
    let sensors = SimulatedSensors::new(&config.rails);
    let result = EpsNode::new(config, MemoryPort::new(), MemoryPort::new(), sensors);
    assert!(matches!(result, Err(NodeError::Config(_))));
}

#[test]
fn test_full_fault_table_does_not_degrade_bus() {
    let mut h = Harness::new();
    for code in 0..MAX_ACTIVE_FAULTS as u32 {
        h.node.publish(Event::FaultReported {
            source: FaultSource::Sensor,
            code,
            severity: Severity::Warning,
            component: None,
        });
    }
    h.node.process();
    assert_eq!(h.node.redundancy().faults().active_count(), MAX_ACTIVE_FAULTS);

    h.node.sensors_mut().set_rail(
        5,
        RailReading {
            voltage_mv: 5000,
            current_ma: 7000,
        },
    );
    h.node.run_ticks(10);

    assert!(!h.node.rails().state(5).unwrap().enabled);
    assert!(h.node.redundancy().is_component_healthy(Component::Bus5V));
    assert_eq!(h.node.redundancy().table_full_drops(), 1);
}

#[test]
fn test_brownout_sheds_to_safe_profile_until_full_charge() {
    let mut h = Harness::new();
    h.node.sensors_mut().set_battery(BatteryReading {
        voltage_mv: 3200,
        current_ma: -800,
        temperature_c: 18.0,
    });
    h.node.run_ticks(10);

    assert_eq!(h.node.profiles().current(), PowerProfile::Safe);
    assert!(h.node.rails().state(0).unwrap().enabled);
    for rail in 1..=3 {
        assert!(!h.node.rails().state(rail).unwrap().enabled);
    }
    let switched: Vec<Packet> = h
        .downlink(ChannelId::Primary)
        .into_iter()
        .filter(|p| p.message_type == MessageType::Telemetry && p.command_id == TLM_POWER_PROFILE)
        .collect();
    assert_eq!(switched.len(), 1);
    assert_eq!(switched[0].payload[..], [PowerProfile::Nominal as u8, PowerProfile::Safe as u8]);

    // Recovering to an ordinary voltage is not enough to leave safe mode.
    h.node.sensors_mut().set_battery(BatteryReading::default());
    h.node.run_ticks(10);
    assert_eq!(h.node.profiles().current(), PowerProfile::Safe);

    h.node.sensors_mut().set_battery(BatteryReading {
        voltage_mv: 4180,
        current_ma: 600,
        temperature_c: 21.0,
    });
    h.node.run_ticks(10);
    assert_eq!(h.node.profiles().current(), PowerProfile::Nominal);
    assert!((0..=3).all(|rail| h.node.rails().state(rail).unwrap().enabled));
    assert_eq!(h.node.profiles().switch_count(), 2);
}

#[test]
fn test_power_profile_and_mppt_commands() {
    let mut h = Harness::new();
    let replies = h.request(ChannelId::Primary, Command::SetPowerProfile { profile: PowerProfile::Safe });
    let kinds: Vec<(MessageType, u8)> = replies.iter().map(|p| (p.message_type, p.command_id)).collect();
    assert_eq!(
        kinds,
        [
            (MessageType::Ack, CMD_SET_POWER_PROFILE),
            (MessageType::Telemetry, TLM_POWER_PROFILE),
        ]
    );
    assert!(!h.node.rails().state(1).unwrap().enabled);

    // Asking again is acknowledged but switches nothing.
    let replies = h.request(ChannelId::Primary, Command::SetPowerProfile { profile: PowerProfile::Safe });
    assert_eq!(replies.len(), 1);

    let replies = h.request(ChannelId::Primary, Command::DisableMppt { channel: 0 });
    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0].command_id, CMD_DISABLE_MPPT);
    assert_eq!(replies[0].payload[..], [0, 0, 1]);
    assert!(!h.node.mppt().state(0).unwrap().enabled);

    let replies = h.request(ChannelId::Primary, Command::EnableMppt { channel: 9 });
    assert_eq!(replies[0].command_id, CMD_ENABLE_MPPT);
    assert_eq!(replies[0].payload[..], [9, 0, 0]);
}
