use bubble_core::{CalibrationState, DeviceRole, LinkState, SimulatedMotorController};
use bubble_io::{LinkError, LinkEvent, MotorLink, MotorLinkConfig};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

async fn connected(sim: &SimulatedMotorController) -> MotorLink {
    let link = MotorLink::new(Arc::new(sim.clone()), MotorLinkConfig::default());
    link.connect("SIM-MOTOR").await.unwrap();
    link
}

#[tokio::test(start_paused = true)]
async fn position_commands_need_calibration() {
    let sim = SimulatedMotorController::new();
    let link = connected(&sim).await;
    assert!(sim.is_started());
    sleep(Duration::from_millis(30)).await;
    assert_eq!(link.status().calibration, CalibrationState::Uncalibrated);

    assert!(matches!(
        link.move_to_position(12_800).await,
        Err(LinkError::NotCalibrated)
    ));
    assert!(matches!(link.ascent().await, Err(LinkError::NotCalibrated)));
    assert!(matches!(
        link.get_top_position().await,
        Err(LinkError::NotCalibrated)
    ));
    assert!(!sim.written().iter().any(|b| matches!(b, b'p' | b'u' | b'o')));
    assert_eq!(sim.position(), 0);

    link.reset().await;
}

#[tokio::test(start_paused = true)]
async fn calibration_then_moves() {
    let sim = SimulatedMotorController::new();
    let link = connected(&sim).await;
    let mut rx = link.subscribe();

    link.calibrate().await.unwrap();
    assert_eq!(link.status().calibration, CalibrationState::Calibrating);
    sleep(Duration::from_millis(30)).await;
    assert!(link.is_calibrated());
    assert!(link.is_ready());
    assert_eq!(link.get_top_position().await.unwrap(), 64_000);

    link.move_to_target(2.5).await.unwrap();
    assert_eq!(sim.position(), 16_000);
    sleep(Duration::from_millis(30)).await;
    assert_eq!(link.get_current_position().await.unwrap(), 16_000);
    assert_eq!(link.position_mm(), Some(7.5));

    link.move_to_position(6_400).await.unwrap();
    sleep(Duration::from_millis(30)).await;
    assert_eq!(link.position_mm(), Some(9.0));

    link.to_top().await.unwrap();
    sleep(Duration::from_millis(30)).await;
    assert_eq!(link.position_mm(), Some(0.0));

    let mut saw_calibrated = false;
    let mut saw_position = false;
    while let Ok(event) = rx.try_recv() {
        match event {
            LinkEvent::Calibration(CalibrationState::Calibrated) => saw_calibrated = true,
            LinkEvent::Position { .. } => saw_position = true,
            _ => {}
        }
    }
    assert!(saw_calibrated);
    assert!(saw_position);

    link.reset().await;
    assert_eq!(link.state(), LinkState::Disconnected);
    assert_eq!(link.status().calibration, CalibrationState::Uncalibrated);
    assert!(!sim.is_started());
}

#[tokio::test(start_paused = true)]
async fn silent_motor_is_reset_by_poller() {
    let sim = SimulatedMotorController::calibrated();
    let link = connected(&sim).await;
    let mut rx = link.subscribe();
    sleep(Duration::from_millis(30)).await;
    assert!(link.is_ready());

    sim.set_silent(true);
    sleep(Duration::from_secs(1)).await;
    assert_eq!(link.state(), LinkState::Disconnected);
    assert!(!link.is_ready());

    let mut lost = 0;
    while let Ok(event) = rx.try_recv() {
        if matches!(event, LinkEvent::LinkLost { role: DeviceRole::Motor, .. }) {
            lost += 1;
        }
    }
    assert_eq!(lost, 1);
    assert!(matches!(
        link.move_to_position(0).await,
        Err(LinkError::NotConnected(DeviceRole::Motor))
    ));

    sim.set_silent(false);
    link.connect("SIM-MOTOR").await.unwrap();
    sleep(Duration::from_millis(30)).await;
    assert!(link.is_ready());
    link.reset().await;
}
