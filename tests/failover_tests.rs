use eps::bus::{Event, EventQueue};
use eps::failover::FailoverPolicy;
use eps::fault::FaultSource;
use eps::link::{ChannelId, ReassemblyContext, SerialLink};
use eps::logging::{FlightLog, LogConfig, LogLevel, COMPONENT_MAIN};
use eps::packet::*;
use eps::redundancy::{Component, ComponentDegradation, RedundancyManager};
use eps::transport::{LineError, MemoryPort};

fn links() -> ([SerialLink<MemoryPort>; 2], MemoryPort, MemoryPort) {
    let primary = MemoryPort::new();
    let secondary = MemoryPort::new();
    let links = [
        SerialLink::new(ChannelId::Primary, primary.clone()),
        SerialLink::new(ChannelId::Secondary, secondary.clone()),
    ];
    (links, primary, secondary)
}

fn degraded(component: Component, fallback_available: bool) -> Event {
    Event::ComponentDegraded(ComponentDegradation {
        component,
        source: FaultSource::Uart,
        fallback_available,
    })
}

fn telemetry(seq: u16) -> Packet {
    Packet::new(ADDR_OBC, ADDR_EPS, MessageType::Telemetry, 0x40, &[seq as u8])
        .unwrap()
        .with_sequence(seq)
}

fn decode_all(bytes: &[u8]) -> Vec<Packet> {
    let mut ctx = ReassemblyContext::new();
    bytes.iter().filter_map(|&b| ctx.push_byte(b)).map(Result::unwrap).collect()
}

#[test]
fn test_sends_follow_degradation_and_recovery() {
    let (mut links, primary, secondary) = links();
    let mut policy = FailoverPolicy::new();
    assert_eq!(policy.active(), ChannelId::Primary);

    assert!(policy.send(&mut links, &telemetry(1)));
    assert_eq!(decode_all(&primary.take_tx()).len(), 1);

    assert!(policy.on_event(&degraded(Component::UartPrimary, true)));
    assert_eq!(policy.active(), ChannelId::Secondary);
    assert!(policy.send(&mut links, &telemetry(2)));
    assert!(primary.take_tx().is_empty());
    assert_eq!(decode_all(&secondary.take_tx())[0].sequence, 2);

    assert!(policy.on_event(&Event::ComponentRecovered {
        component: Component::UartPrimary
    }));
    assert_eq!(policy.active(), ChannelId::Primary);
    assert!(policy.send(&mut links, &telemetry(3)));
    assert_eq!(decode_all(&primary.take_tx())[0].sequence, 3);
    assert_eq!(policy.switch_count(), 2);
}

#[test]
fn test_no_fallback_means_no_switch() {
    let mut policy = FailoverPolicy::new();
    assert!(!policy.on_event(&degraded(Component::UartPrimary, false)));
    assert_eq!(policy.active(), ChannelId::Primary);
}

#[test]
fn test_unrelated_components_are_ignored() {
    let mut policy = FailoverPolicy::new();
    assert!(!policy.on_event(&degraded(Component::UartSecondary, true)));
    assert!(!policy.on_event(&degraded(Component::Bus5V, true)));
    assert!(!policy.on_event(&Event::ComponentRecovered {
        component: Component::UartSecondary
    }));
    assert_eq!(policy.active(), ChannelId::Primary);
    assert_eq!(policy.switch_count(), 0);
}

#[test]
fn test_recovery_switches_back_unconditionally() {
    let (mut links, _primary, _secondary) = links();
    let mut policy = FailoverPolicy::new();
    policy.on_event(&degraded(Component::UartPrimary, true));

    // Primary is not even ready; recovery still moves the route.
    links[0].set_initialized(false);
    policy.on_event(&Event::ComponentRecovered {
        component: Component::UartPrimary,
    });
    assert_eq!(policy.active(), ChannelId::Primary);
    assert!(!policy.is_route_ready(&links));
}

#[test]
fn test_send_on_unready_route_is_silent_noop() {
    let (mut links, primary, secondary) = links();
    let policy = FailoverPolicy::new();
    primary.set_ready(false);

    assert!(!policy.send(&mut links, &telemetry(1)));
    assert!(primary.take_tx().is_empty());
    assert!(secondary.take_tx().is_empty());
    assert_eq!(links[0].stats().send_dropped, 1);
}

#[test]
fn test_queued_logs_survive_unready_route() {
    let (mut links, primary, secondary) = links();
    let mut policy = FailoverPolicy::new();
    let mut log = FlightLog::new(LogConfig {
        min_level: LogLevel::Debug,
        ..LogConfig::default()
    });
    for i in 0..5 {
        log.record(LogLevel::Info, COMPONENT_MAIN, format_args!("entry {i}"));
    }

    primary.set_ready(false);
    assert_eq!(log.flush(&policy, &mut links), 0);
    assert_eq!(log.pending_count(), 5);

    policy.on_event(&degraded(Component::UartPrimary, true));
    assert_eq!(log.flush(&policy, &mut links), 5);
    assert_eq!(log.pending_count(), 0);

    let packets = decode_all(&secondary.take_tx());
    assert_eq!(packets.len(), 1);
    assert_eq!(packets[0].message_type, MessageType::Log);
    assert!(packets[0].is_last_chunk);
}

#[test]
fn test_engine_events_drive_the_policy() {
    let mut engine = RedundancyManager::default();
    let mut policy = FailoverPolicy::new();
    let mut queue = EventQueue::new();

    engine.on_line_error(ChannelId::Primary, LineError::Overrun, &mut queue);
    while let Some(event) = queue.pop() {
        policy.on_event(&event);
    }
    assert_eq!(policy.active(), ChannelId::Secondary);

    engine.report_component_recovered(Component::UartPrimary, &mut queue);
    while let Some(event) = queue.pop() {
        policy.on_event(&event);
    }
    assert_eq!(policy.active(), ChannelId::Primary);
}
