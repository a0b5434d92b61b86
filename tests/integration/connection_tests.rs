//! Connection lifecycle against a mock peripheral, in paused time.

use std::sync::Arc;
use std::time::Duration;

use solar_monitor_lib::core::bluetooth::{
    BatteryMonitorCommands, ChainOutcome, ConnectionHandle, SolarChargerCommands, ENABLE_NOTIFICATION_VALUE,
    UUID_BATTERY_MONITOR_CONF_CHAR, UUID_BATTERY_MONITOR_DATA_CHAR, UUID_CCCD, UUID_MODEL_NUMBER,
    UUID_SOLAR_CHARGER_DATA_CHAR,
};
use solar_monitor_lib::core::telemetry::{
    BatteryMonitorField, ConnectionState, DeviceType, EventSink, MonitorEvent, SolarChargerField,
};
use solar_monitor_lib::{MonitorConfig, MonitorError};
use tokio::sync::mpsc;

use crate::mock_peripheral::{
    battery_service, drain, solar_service, wait_for, MockCall, MockPeripheral,
};

fn spawn(mock: &Arc<MockPeripheral>) -> (ConnectionHandle, mpsc::UnboundedReceiver<MonitorEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let sink: Arc<dyn EventSink> = Arc::new(tx);
    let handle = ConnectionHandle::spawn(mock.clone(), &MonitorConfig::default(), sink);
    (handle, rx)
}

async fn connect_typed(
    mock: &Arc<MockPeripheral>,
) -> (ConnectionHandle, mpsc::UnboundedReceiver<MonitorEvent>) {
    let (handle, mut rx) = spawn(mock);
    handle.connect().await.unwrap();
    wait_for(&mut rx, |e| matches!(e, MonitorEvent::DeviceTyped { .. })).await;
    (handle, rx)
}

#[tokio::test(start_paused = true)]
async fn solar_charger_is_typed_and_alternates_queries() {
    let mock = MockPeripheral::solar_charger("solar-1");
    let (handle, mut rx) = spawn(&mock);
    handle.connect().await.unwrap();

    let connected = wait_for(&mut rx, |e| matches!(e, MonitorEvent::ConnectionStateChanged { .. })).await;
    assert_eq!(
        connected,
        MonitorEvent::ConnectionStateChanged {
            device: "solar-1".to_string(),
            state: ConnectionState::Connected,
        }
    );
    let typed = wait_for(&mut rx, |e| matches!(e, MonitorEvent::DeviceTyped { .. })).await;
    assert_eq!(
        typed,
        MonitorEvent::DeviceTyped {
            device: "solar-1".to_string(),
            device_type: DeviceType::SolarCharger,
        }
    );

    let model = wait_for(&mut rx, |e| matches!(e, MonitorEvent::DeviceModel { .. })).await;
    assert!(matches!(model, MonitorEvent::DeviceModel { model, .. } if model == "BT-TH-1"));

    wait_for(&mut rx, |e| {
        matches!(e, MonitorEvent::SolarCharger { field: SolarChargerField::ChargeVoltage(v), .. } if *v == 26.4)
    })
    .await;
    wait_for(&mut rx, |e| {
        matches!(e, MonitorEvent::SolarCharger { field: SolarChargerField::History(h), .. } if h.day_index == 0)
    })
    .await;
    wait_for(&mut rx, |e| {
        matches!(e, MonitorEvent::SolarCharger { field: SolarChargerField::TotalChargeEnergy(_), .. })
    })
    .await;

    let calls = mock.calls();
    assert!(calls.contains(&MockCall::Read(UUID_MODEL_NUMBER)));
    assert!(calls.contains(&MockCall::Subscribe(UUID_SOLAR_CHARGER_DATA_CHAR)));
    assert!(calls.contains(&MockCall::WriteDescriptor(UUID_CCCD, ENABLE_NOTIFICATION_VALUE.to_vec())));

    let writes = mock.writes_to(UUID_SOLAR_CHARGER_DATA_CHAR);
    assert!(writes.len() >= 3);
    assert_eq!(writes[0], SolarChargerCommands::HOME_DATA.to_vec());
    assert_eq!(writes[1], SolarChargerCommands::CHART_DATA.to_vec());
    assert_eq!(writes[2], SolarChargerCommands::HOME_DATA.to_vec());
    assert_eq!(mock.max_in_flight(), 1);

    let snapshot = handle.snapshot();
    assert_eq!(snapshot.state, ConnectionState::Connected);
    assert_eq!(snapshot.device_type, DeviceType::SolarCharger);
    handle.close().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn first_matching_service_types_the_device() {
    let mock = Arc::new(MockPeripheral::new("dual", vec![battery_service(), solar_service()]));
    let (handle, mut rx) = connect_typed(&mock).await;
    assert_eq!(handle.device_type(), DeviceType::BatteryMonitor);

    tokio::time::sleep(Duration::from_secs(3)).await;
    let typed = drain(&mut rx)
        .into_iter()
        .filter(|e| matches!(e, MonitorEvent::DeviceTyped { .. }))
        .count();
    assert_eq!(typed, 0);
    assert!(mock.writes_to(UUID_SOLAR_CHARGER_DATA_CHAR).is_empty());
    assert_eq!(
        mock.writes_to(UUID_BATTERY_MONITOR_CONF_CHAR)[0],
        BatteryMonitorCommands::HOME_DATA.to_vec()
    );
    assert!(!mock.calls().contains(&MockCall::Subscribe(UUID_SOLAR_CHARGER_DATA_CHAR)));

    // Commands for the other device type are refused
    let err = handle.load_charger_history(1).await.unwrap_err();
    assert!(matches!(
        err,
        MonitorError::WrongDeviceType {
            expected: DeviceType::SolarCharger,
            actual: DeviceType::BatteryMonitor,
            ..
        }
    ));
    handle.close().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn battery_packets_are_reassembled_across_notifications() {
    let mock = MockPeripheral::battery_monitor("battery-1");
    let (handle, mut rx) = connect_typed(&mock).await;

    let current = wait_for(&mut rx, |e| matches!(e, MonitorEvent::BatteryMonitor { .. })).await;
    assert_eq!(
        current,
        MonitorEvent::BatteryMonitor {
            device: "battery-1".to_string(),
            field: BatteryMonitorField::Current(20.43),
        }
    );
    let power = wait_for(&mut rx, |e| matches!(e, MonitorEvent::BatteryMonitor { .. })).await;
    assert!(matches!(
        power,
        MonitorEvent::BatteryMonitor { field: BatteryMonitorField::Power(p), .. } if p == 529.54
    ));
    handle.close().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn unanswered_action_times_out_and_queue_moves_on() {
    let mock = MockPeripheral::battery_monitor("battery-2");
    let (handle, _rx) = connect_typed(&mock).await;
    tokio::time::sleep(Duration::from_secs(1)).await;
    mock.clear_responder();

    // Acknowledged but never answered
    let waiting = handle
        .write_command(vec![0xBB, 0x01, 0xB5, 0x0C, 0xEE], Duration::from_millis(1500), true)
        .await
        .unwrap();
    let plain = handle
        .write_command(vec![0xBB, 0x02, 0xB6, 0x0C, 0xEE], Duration::from_millis(5000), false)
        .await
        .unwrap();

    let started = tokio::time::Instant::now();
    assert_eq!(waiting.wait().await, None);
    assert!(started.elapsed() >= Duration::from_millis(1500));
    assert_eq!(plain.wait().await, Some(Vec::new()));
    assert_eq!(mock.max_in_flight(), 1);
    handle.close().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn hung_transport_operation_is_abandoned_on_timeout() {
    let mock = MockPeripheral::battery_monitor("battery-3");
    let (handle, _rx) = connect_typed(&mock).await;
    tokio::time::sleep(Duration::from_secs(1)).await;

    mock.hang_writes(1);
    let hung = handle
        .write_command(vec![0xBB, 0x01, 0xB5, 0x0C, 0xEE], Duration::from_millis(2000), false)
        .await
        .unwrap();
    let next = handle
        .write_command(vec![0xBB, 0x02, 0xB6, 0x0C, 0xEE], Duration::from_millis(5000), false)
        .await
        .unwrap();
    assert_eq!(hung.wait().await, None);
    assert_eq!(next.wait().await, Some(Vec::new()));
    assert_eq!(mock.max_in_flight(), 1);
    handle.close().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn stale_connection_flushes_queue_and_resyncs() {
    let mock = MockPeripheral::battery_monitor("battery-4");
    mock.clear_responder();
    let (handle, _rx) = connect_typed(&mock).await;

    // Initial sync after half a period, nothing is ever decoded
    tokio::time::sleep(Duration::from_millis(600)).await;
    assert_eq!(mock.writes_to(UUID_BATTERY_MONITOR_CONF_CHAR).len(), 1);

    // Watchdog fires once more than three periods have passed
    tokio::time::sleep(Duration::from_millis(4000)).await;
    let polls = mock
        .writes_to(UUID_BATTERY_MONITOR_CONF_CHAR)
        .into_iter()
        .filter(|w| *w == BatteryMonitorCommands::HOME_DATA.to_vec())
        .count();
    assert_eq!(polls, 2);
    handle.close().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn write_all_commands_runs_strictly_in_sequence() {
    let mock = MockPeripheral::battery_monitor("battery-5");
    mock.set_delays(vec![
        Duration::from_millis(40),
        Duration::from_millis(5),
        Duration::from_millis(25),
        Duration::from_millis(1),
    ]);
    let (handle, _rx) = connect_typed(&mock).await;

    let commands = vec![
        vec![0xBB, 0x01, 0xB5, 0x0C, 0xEE],
        vec![0xBB, 0x02, 0xB6, 0x0C, 0xEE],
        vec![0xBB, 0x03, 0xB7, 0x0C, 0xEE],
    ];
    let outcome = handle
        .write_all_commands(commands.clone(), Duration::from_millis(3000))
        .await
        .unwrap();
    assert_eq!(outcome, ChainOutcome::Completed);

    let chain: Vec<Vec<u8>> = mock
        .writes_to(UUID_BATTERY_MONITOR_CONF_CHAR)
        .into_iter()
        .filter(|w| commands.contains(w))
        .collect();
    assert_eq!(chain, commands);
    assert_eq!(mock.max_in_flight(), 1);
    handle.close().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn chain_stops_at_first_timeout() {
    let mock = MockPeripheral::battery_monitor("battery-6");
    let (handle, _rx) = connect_typed(&mock).await;
    tokio::time::sleep(Duration::from_secs(1)).await;

    mock.hang_writes(1);
    let outcome = handle
        .write_all_commands(
            vec![vec![0xBB, 0x01, 0xB5, 0x0C, 0xEE], vec![0xBB, 0x02, 0xB6, 0x0C, 0xEE]],
            Duration::from_millis(1000),
        )
        .await
        .unwrap();
    assert_eq!(outcome, ChainOutcome::Aborted { index: 0 });
    assert!(!mock
        .writes_to(UUID_BATTERY_MONITOR_CONF_CHAR)
        .contains(&vec![0xBB, 0x02, 0xB6, 0x0C, 0xEE]));
    handle.close().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn close_resolves_queued_actions_and_disconnects() {
    let mock = MockPeripheral::battery_monitor("battery-7");
    let (handle, mut rx) = connect_typed(&mock).await;
    tokio::time::sleep(Duration::from_secs(1)).await;

    mock.hang_writes(1);
    let first = handle
        .write_command(vec![0xBB, 0x01, 0xB5, 0x0C, 0xEE], Duration::from_secs(60), false)
        .await
        .unwrap();
    let second = handle
        .write_command(vec![0xBB, 0x02, 0xB6, 0x0C, 0xEE], Duration::from_secs(60), false)
        .await
        .unwrap();

    handle.close().await.unwrap();
    assert_eq!(first.wait().await, None);
    assert_eq!(second.wait().await, None);
    assert_eq!(mock.count(&MockCall::Disconnect), 1);
    wait_for(&mut rx, |e| {
        matches!(e, MonitorEvent::ConnectionStateChanged { state: ConnectionState::Disconnected, .. })
    })
    .await;

    assert!(handle.is_closed());
    assert!(matches!(handle.sync().await, Err(MonitorError::ConnectionClosed(_))));
}

#[tokio::test(start_paused = true)]
async fn dropped_link_reports_disconnect_and_reconnect_keeps_type() {
    let mock = MockPeripheral::battery_monitor("battery-8");
    let (handle, mut rx) = connect_typed(&mock).await;
    tokio::time::sleep(Duration::from_secs(1)).await;

    mock.drop_link();
    wait_for(&mut rx, |e| {
        matches!(e, MonitorEvent::ConnectionStateChanged { state: ConnectionState::Disconnected, .. })
    })
    .await;
    assert_eq!(handle.state(), ConnectionState::Disconnected);
    assert!(matches!(handle.start_recording().await, Err(MonitorError::NotConnected(_))));

    handle.connect().await.unwrap();
    let next = wait_for(&mut rx, |e| {
        matches!(
            e,
            MonitorEvent::DeviceTyped { .. }
                | MonitorEvent::BatteryMonitor { field: BatteryMonitorField::Current(_), .. }
        )
    })
    .await;
    assert!(matches!(next, MonitorEvent::BatteryMonitor { .. }));
    assert_eq!(handle.device_type(), DeviceType::BatteryMonitor);
    assert_eq!(mock.count(&MockCall::Connect), 2);
    assert_eq!(mock.count(&MockCall::Subscribe(UUID_BATTERY_MONITOR_DATA_CHAR)), 2);
    handle.close().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn connect_is_idempotent() {
    let mock = MockPeripheral::solar_charger("solar-2");
    let (handle, _rx) = connect_typed(&mock).await;
    handle.connect().await.unwrap();
    handle.connect().await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(mock.count(&MockCall::Connect), 1);
    assert_eq!(mock.count(&MockCall::Discover), 1);
    handle.close().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn extra_charger_queries_do_not_speed_up_polling() {
    let mock = MockPeripheral::solar_charger("solar-3");
    let (handle, _rx) = connect_typed(&mock).await;
    tokio::time::sleep(Duration::from_secs(2)).await;

    let writes = || mock.writes_to(UUID_SOLAR_CHARGER_DATA_CHAR).len();
    let before = writes();
    tokio::time::sleep(Duration::from_secs(10)).await;
    let steady = writes() - before;
    assert!(steady >= 10, "only {steady} polls in 10s");

    for day in 1..=4 {
        let history = handle.load_charger_history(day).await.unwrap();
        assert!(history.wait().await.is_some());
    }
    let sync = handle.sync().await.unwrap().unwrap();
    assert!(sync.wait().await.is_some());
    tokio::time::sleep(Duration::from_secs(2)).await;

    let before = writes();
    tokio::time::sleep(Duration::from_secs(10)).await;
    let after = writes() - before;
    assert!(after <= steady + 1, "polling went from {steady} to {after} writes per 10s");
    assert_eq!(mock.max_in_flight(), 1);
    handle.close().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn abort_removes_queued_action_but_not_the_one_in_flight() {
    let mock = MockPeripheral::battery_monitor("battery-9");
    let (handle, _rx) = connect_typed(&mock).await;
    tokio::time::sleep(Duration::from_secs(1)).await;

    mock.hang_writes(1);
    let in_flight_payload = vec![0xBB, 0x01, 0xB5, 0x0C, 0xEE];
    let queued_payload = vec![0xBB, 0x02, 0xB6, 0x0C, 0xEE];
    let in_flight = handle
        .write_command(in_flight_payload.clone(), Duration::from_millis(2000), false)
        .await
        .unwrap();
    let queued = handle
        .write_command(queued_payload.clone(), Duration::from_millis(5000), false)
        .await
        .unwrap();
    let started = tokio::time::Instant::now();

    handle.abort_action(queued.id()).await.unwrap();
    assert_eq!(queued.wait().await, None);
    assert!(started.elapsed() < Duration::from_millis(100));

    handle.abort_action(in_flight.id()).await.unwrap();
    assert_eq!(in_flight.wait().await, None);
    assert!(started.elapsed() >= Duration::from_millis(1900));

    let writes = mock.writes_to(UUID_BATTERY_MONITOR_CONF_CHAR);
    assert!(writes.contains(&in_flight_payload));
    assert!(!writes.contains(&queued_payload));

    // The queue keeps going afterwards
    let next = handle
        .write_command(vec![0xBB, 0x03, 0xB7, 0x0C, 0xEE], Duration::from_millis(2000), false)
        .await
        .unwrap();
    assert_eq!(next.wait().await, Some(Vec::new()));
    assert_eq!(mock.max_in_flight(), 1);
    handle.close().await.unwrap();
}
