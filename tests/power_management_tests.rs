use eps::bus::{Event, EventQueue};
use eps::fault::{FaultSource, Severity};
use eps::subsystems::mppt::mppt_fault_code;
use eps::subsystems::*;

const PAYLOAD_1: u8 = 3;
const PAYLOAD_2: u8 = 4;

fn powered_rails() -> RailController {
    let mut rails = RailController::new(RailsConfig::default());
    rails.enable_all();
    rails
}

fn enabled(rails: &RailController) -> Vec<u8> {
    (0..rails.rail_count() as u8)
        .filter(|&r| rails.state(r).is_some_and(|s| s.enabled))
        .collect()
}

fn drain(queue: &mut EventQueue) -> Vec<Event> {
    std::iter::from_fn(|| queue.pop()).collect()
}

#[test]
fn test_safe_profile_sheds_nominal_only_rails() {
    let mut rails = powered_rails();
    let mut profiles = PowerProfiles::default();
    let mut queue = EventQueue::new();

    assert!(profiles.on_request(PowerProfile::Safe, &mut rails, &mut queue));
    assert_eq!(profiles.current(), PowerProfile::Safe);
    // Radio, GPS and payload 1 go dark; rails outside both sets keep power.
    assert_eq!(enabled(&rails), [0, 4, 5, 6]);
    assert_eq!(rails.state(1).unwrap().status, RailStatus::Disabled);
    assert_eq!(
        drain(&mut queue),
        [Event::PowerProfileChanged {
            previous: PowerProfile::Nominal,
            current: PowerProfile::Safe,
        }]
    );
}

#[test]
fn test_nominal_profile_restores_its_rails() {
    let mut rails = powered_rails();
    rails.disable(PAYLOAD_2).unwrap();
    let mut profiles = PowerProfiles::default();
    let mut queue = EventQueue::new();

    profiles.on_request(PowerProfile::Safe, &mut rails, &mut queue);
    profiles.on_request(PowerProfile::Nominal, &mut rails, &mut queue);

    assert_eq!(profiles.current(), PowerProfile::Nominal);
    assert_eq!(profiles.switch_count(), 2);
    assert_eq!(enabled(&rails), [0, 1, 2, 3, 5, 6]);
    assert!(!rails.state(PAYLOAD_2).unwrap().enabled);
    assert_eq!(rails.state(PAYLOAD_1).unwrap().status, RailStatus::Ok);
}

#[test]
fn test_requesting_the_active_profile_changes_nothing() {
    let mut rails = powered_rails();
    rails.disable(PAYLOAD_1).unwrap();
    let mut profiles = PowerProfiles::default();
    let mut queue = EventQueue::new();

    assert!(!profiles.on_request(PowerProfile::Nominal, &mut rails, &mut queue));
    assert!(queue.is_empty());
    assert_eq!(profiles.switch_count(), 0);
    // A rail the operator switched off stays off.
    assert!(!rails.state(PAYLOAD_1).unwrap().enabled);
}

#[test]
fn test_profile_naming_a_missing_rail_still_switches() {
    let mut rails = powered_rails();
    let config = ProfilesConfig {
        nominal: [0, 1].into_iter().collect(),
        safe: [0, 7].into_iter().collect(),
    };
    let mut profiles = PowerProfiles::new(config);
    let mut queue = EventQueue::new();

    assert!(profiles.on_request(PowerProfile::Safe, &mut rails, &mut queue));
    assert!(!rails.state(1).unwrap().enabled);
    assert!(rails.state(0).unwrap().enabled);
}

#[test]
fn test_policy_maps_battery_events_to_profiles() {
    let mut policy = PowerPolicy::new();
    let mut queue = EventQueue::new();

    let critical = Event::BatteryAlert {
        status: BatteryStatus::CriticalLow,
        voltage_mv: 3200,
    };
    assert_eq!(policy.on_event(&critical, &mut queue), Some(PowerProfile::Safe));

    let low = Event::BatteryAlert {
        status: BatteryStatus::Low,
        voltage_mv: 3450,
    };
    assert_eq!(policy.on_event(&low, &mut queue), None);

    let full = Event::BatteryFullyCharged { voltage_mv: 4180 };
    assert_eq!(policy.on_event(&full, &mut queue), Some(PowerProfile::Nominal));

    assert_eq!(policy.request_count(), 2);
    assert_eq!(
        drain(&mut queue),
        [
            Event::PowerProfileRequest(PowerProfile::Safe),
            Event::PowerProfileRequest(PowerProfile::Nominal),
        ]
    );
}

#[test]
fn test_full_charge_is_announced_on_the_rising_edge() {
    let mut battery = BatteryMonitor::default();
    let mut queue = EventQueue::new();
    let at = |voltage_mv| BatteryReading {
        voltage_mv,
        current_ma: 400,
        temperature_c: 20.0,
    };

    battery.evaluate(at(4100), &mut queue);
    battery.evaluate(at(4160), &mut queue);
    battery.evaluate(at(4200), &mut queue);
    battery.evaluate(at(4000), &mut queue);
    battery.evaluate(at(4150), &mut queue);

    let full: Vec<u16> = drain(&mut queue)
        .into_iter()
        .filter_map(|e| match e {
            Event::BatteryFullyCharged { voltage_mv } => Some(voltage_mv),
            _ => None,
        })
        .collect();
    assert_eq!(full, [4160, 4150]);
}

fn mppt() -> (MpptController, SimulatedSensors) {
    let sensors = SimulatedSensors::new(&RailsConfig::default());
    (MpptController::default(), sensors)
}

#[test]
fn test_mppt_fault_is_reported_once_per_status_change() {
    let (mut mppt, mut sensors) = mppt();
    let mut queue = EventQueue::new();
    let shaded = MpptReading {
        input_mv: 3000,
        ..MpptReading::default()
    };
    sensors.set_mppt(2, shaded);

    mppt.evaluate(&mut sensors, &mut queue);
    mppt.evaluate(&mut sensors, &mut queue);

    let code = mppt_fault_code(2, MpptStatus::Undervolt).unwrap();
    assert_eq!(code, 0x0202);
    assert_eq!(
        drain(&mut queue),
        [
            Event::FaultReported {
                source: FaultSource::Mppt,
                code,
                severity: Severity::Degraded,
                component: None,
            },
            Event::MpptFault {
                channel: 2,
                status: MpptStatus::Undervolt,
            },
        ]
    );
    // The channel keeps harvesting while faulted.
    assert!(mppt.state(2).unwrap().enabled);

    sensors.restore_mppt(2);
    mppt.evaluate(&mut sensors, &mut queue);
    assert!(queue.is_empty());
    assert_eq!(mppt.state(2).unwrap().status, MpptStatus::Ok);
}

#[test]
fn test_mppt_status_priority() {
    let config = MpptConfig::default();
    let dead = MpptReading {
        pgood: false,
        input_mv: 1000,
        temperature_c: 95.0,
        ..MpptReading::default()
    };
    assert_eq!(config.check(&dead), MpptStatus::Fault);
    let hot_and_dim = MpptReading {
        input_mv: 4000,
        temperature_c: 95.0,
        ..MpptReading::default()
    };
    assert_eq!(config.check(&hot_and_dim), MpptStatus::Undervolt);
    let hot = MpptReading {
        temperature_c: 90.0,
        ..MpptReading::default()
    };
    assert_eq!(config.check(&hot), MpptStatus::Overtemp);
    assert_eq!(mppt_fault_code(5, MpptStatus::Overtemp), Some(0x0305));
    assert_eq!(mppt_fault_code(5, MpptStatus::Disabled), None);
}

#[test]
fn test_mppt_requests_and_telemetry() {
    let (mut mppt, mut sensors) = mppt();
    let mut queue = EventQueue::new();

    mppt.on_request(1, false, &mut queue);
    mppt.on_request(6, true, &mut queue);
    assert_eq!(
        drain(&mut queue),
        [
            Event::MpptResponse {
                channel: 1,
                enable: false,
                enabled: false,
                accepted: true,
            },
            Event::MpptResponse {
                channel: 6,
                enable: true,
                enabled: false,
                accepted: false,
            },
        ]
    );

    // A disabled channel is neither sampled nor reported.
    sensors.set_mppt(
        1,
        MpptReading {
            pgood: false,
            ..MpptReading::default()
        },
    );
    mppt.evaluate(&mut sensors, &mut queue);
    assert!(queue.is_empty());
    assert_eq!(mppt.state(1).unwrap().status, MpptStatus::Disabled);

    mppt.publish_telemetry(&mut queue);
    let channels: Vec<u8> = drain(&mut queue)
        .into_iter()
        .filter_map(|e| match e {
            Event::MpptTelemetry(t) => Some(t.channel),
            _ => None,
        })
        .collect();
    assert_eq!(channels, [0, 2, 3, 4, 5]);
    assert_eq!(mppt.telemetry(0).unwrap().power_mw, 3690);
    assert_eq!(mppt.total_power_mw(), 5 * 3690);

    mppt.on_request(1, true, &mut queue);
    assert_eq!(mppt.state(1).unwrap().status, MpptStatus::Ok);
}

#[test]
fn test_mppt_sampling_cadence() {
    let config = MpptConfig {
        update_interval_ticks: 2,
        telemetry_interval_ticks: 4,
        ..MpptConfig::default()
    };
    let mut mppt = MpptController::new(config);
    let mut sensors = SimulatedSensors::new(&RailsConfig::default());
    sensors.set_mppt(
        0,
        MpptReading {
            temperature_c: 99.0,
            ..MpptReading::default()
        },
    );
    let mut queue = EventQueue::new();

    mppt.on_tick(&mut sensors, &mut queue);
    assert!(queue.is_empty());
    mppt.on_tick(&mut sensors, &mut queue);
    assert!(queue.iter().any(|e| matches!(e, Event::MpptFault { channel: 0, .. })));
    drain(&mut queue);

    mppt.on_tick(&mut sensors, &mut queue);
    mppt.on_tick(&mut sensors, &mut queue);
    let telemetry = queue.iter().filter(|e| matches!(e, Event::MpptTelemetry(_))).count();
    assert_eq!(telemetry, MAX_MPPT_CHANNELS);
}
