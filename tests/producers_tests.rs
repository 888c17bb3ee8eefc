use eps::bus::{Event, EventQueue};
use eps::fault::{FaultSource, Severity};
use eps::redundancy::{Component, ComponentDegradation};
use eps::subsystems::battery::{FAULT_CRITICAL_LOW, FAULT_LOW};
use eps::subsystems::rails::rail_fault_code;
use eps::subsystems::*;

const BUS_5V: u8 = 5;

fn controller() -> (RailController, SimulatedSensors) {
    let config = RailsConfig::default();
    let sensors = SimulatedSensors::new(&config);
    let mut rails = RailController::new(config);
    rails.enable_all();
    (rails, sensors)
}

fn low_battery(voltage_mv: u16) -> BatteryReading {
    BatteryReading {
        voltage_mv,
        current_ma: -500,
        temperature_c: 15.0,
    }
}

#[test]
fn test_nominal_rails_stay_quiet() {
    let (mut rails, mut sensors) = controller();
    let mut queue = EventQueue::new();
    rails.evaluate(&mut sensors, &mut queue);
    assert!(queue.is_empty());
    for rail in 0..rails.rail_count() as u8 {
        let state = rails.state(rail).unwrap();
        assert!(state.enabled);
        assert_eq!(state.status, RailStatus::Ok);
    }
}

#[test]
fn test_overcurrent_disables_rail_and_reports() {
    let (mut rails, mut sensors) = controller();
    let mut queue = EventQueue::new();
    sensors.set_rail(
        usize::from(BUS_5V),
        RailReading {
            voltage_mv: 5000,
            current_ma: 7000,
        },
    );
    rails.evaluate(&mut sensors, &mut queue);

    let state = rails.state(BUS_5V).unwrap();
    assert!(!state.enabled);
    assert_eq!(state.status, RailStatus::Overcurrent);

    let events: Vec<Event> = std::iter::from_fn(|| queue.pop()).collect();
    assert_eq!(
        events,
        vec![
            Event::FaultReported {
                source: FaultSource::Rail,
                code: 0x0105,
                severity: Severity::Degraded,
                component: Some(Component::Bus5V),
            },
            Event::ComponentFaultReport(ComponentDegradation {
                component: Component::Bus5V,
                source: FaultSource::Rail,
                fallback_available: false,
            }),
            Event::RailFault {
                rail: BUS_5V,
                status: RailStatus::Overcurrent,
            },
        ]
    );

    // Disabled rails are not sampled again.
    let mut again = EventQueue::new();
    rails.evaluate(&mut sensors, &mut again);
    assert!(again.is_empty());
}

#[test]
fn test_voltage_bounds_and_fault_codes() {
    let (mut rails, mut sensors) = controller();
    let mut queue = EventQueue::new();
    sensors.set_rail(0, RailReading { voltage_mv: 2800, current_ma: 100 });
    sensors.set_rail(2, RailReading { voltage_mv: 3700, current_ma: 100 });
    rails.evaluate(&mut sensors, &mut queue);

    assert_eq!(rails.state(0).unwrap().status, RailStatus::Undervoltage);
    assert_eq!(rails.state(2).unwrap().status, RailStatus::Overvoltage);
    let codes: Vec<u32> = queue
        .iter()
        .filter_map(|e| match e {
            Event::FaultReported { code, component: None, .. } => Some(*code),
            _ => None,
        })
        .collect();
    assert_eq!(codes, [0x0200, 0x0302]);
    assert_eq!(rail_fault_code(3, RailStatus::Ok), None);
}

#[test]
fn test_status_returns_to_ok_after_reenable() {
    let (mut rails, mut sensors) = controller();
    let mut queue = EventQueue::new();
    sensors.set_rail(1, RailReading { voltage_mv: 4000, current_ma: 10 });
    rails.evaluate(&mut sensors, &mut queue);
    assert_eq!(rails.state(1).unwrap().status, RailStatus::Undervoltage);

    sensors.restore_rail(1);
    rails.on_request(1, true, &mut queue);
    // Still faulted until a reading confirms the rail.
    assert_eq!(rails.state(1).unwrap().status, RailStatus::Undervoltage);

    rails.evaluate(&mut sensors, &mut queue);
    let state = rails.state(1).unwrap();
    assert!(state.enabled);
    assert_eq!(state.status, RailStatus::Ok);
    assert!(queue.iter().any(|e| *e
        == Event::RailResponse {
            rail: 1,
            enable: true,
            enabled: true,
            accepted: true
        }));
}

#[test]
fn test_unknown_rail_request_is_refused() {
    let (mut rails, _) = controller();
    let mut queue = EventQueue::new();
    rails.on_request(42, false, &mut queue);
    assert_eq!(
        queue.pop(),
        Some(Event::RailResponse {
            rail: 42,
            enable: false,
            enabled: false,
            accepted: false
        })
    );

    rails.on_request(42, true, &mut queue);
    assert_eq!(
        queue.pop(),
        Some(Event::RailResponse {
            rail: 42,
            enable: true,
            enabled: false,
            accepted: false
        })
    );
}

#[test]
fn test_rail_sampling_and_telemetry_cadence() {
    let (mut rails, mut sensors) = controller();
    let mut queue = EventQueue::new();
    sensors.set_rail(4, RailReading { voltage_mv: 6000, current_ma: 10 });
    for _ in 0..9 {
        rails.on_tick(&mut sensors, &mut queue);
    }
    assert!(queue.is_empty());
    rails.on_tick(&mut sensors, &mut queue);
    assert!(!queue.is_empty());
    assert_eq!(rails.telemetry(4).unwrap().voltage_mv, 6000);
}

#[test]
fn test_battery_classification_order() {
    let config = BatteryConfig::default();
    assert_eq!(config.classify(&BatteryReading::default()), BatteryStatus::Ok);
    assert_eq!(config.classify(&low_battery(3400)), BatteryStatus::Low);
    assert_eq!(config.classify(&low_battery(3200)), BatteryStatus::CriticalLow);
    assert_eq!(config.classify(&low_battery(4300)), BatteryStatus::OverVoltage);
    let hot = BatteryReading {
        temperature_c: 65.0,
        ..low_battery(3400)
    };
    assert_eq!(config.classify(&hot), BatteryStatus::OverTemperature);
}

#[test]
fn test_battery_alarm_reports_once_per_transition() {
    let mut battery = BatteryMonitor::default();
    let mut queue = EventQueue::new();
    battery.evaluate(low_battery(3450), &mut queue);
    battery.evaluate(low_battery(3440), &mut queue);

    let faults: Vec<_> = queue
        .iter()
        .filter_map(|e| match e {
            Event::FaultReported { code, severity, .. } => Some((*code, *severity)),
            _ => None,
        })
        .collect();
    assert_eq!(faults, [(FAULT_LOW, Severity::Warning)]);
    assert_eq!(battery.status(), BatteryStatus::Low);
    assert!(!battery.in_protect_mode());
}

#[test]
fn test_critical_low_enters_and_leaves_protect_mode() {
    let mut battery = BatteryMonitor::default();
    let mut queue = EventQueue::new();
    battery.evaluate(low_battery(3250), &mut queue);

    assert!(battery.in_protect_mode());
    assert!(!battery.is_charging());
    let events: Vec<Event> = std::iter::from_fn(|| queue.pop()).collect();
    let fault_at = events
        .iter()
        .position(|e| matches!(e, Event::FaultReported { code, .. } if *code == FAULT_CRITICAL_LOW))
        .unwrap();
    let degrade_at = events
        .iter()
        .position(|e| matches!(e, Event::ComponentFaultReport(d) if d.component == Component::BatteryPack))
        .unwrap();
    assert!(fault_at < degrade_at);

    // Still below the low threshold: protection holds.
    battery.evaluate(low_battery(3400), &mut queue);
    assert!(battery.in_protect_mode());

    battery.evaluate(BatteryReading::default(), &mut queue);
    assert!(!battery.in_protect_mode());
    assert!(battery.is_charging());
    assert_eq!(battery.status(), BatteryStatus::Ok);
    assert_eq!(battery.telemetry().voltage_mv, BatteryReading::default().voltage_mv);
}
