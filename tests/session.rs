use odrive_sine::session::{self, ExitReason, SessionConfig};
use odrive_sine::sim::SimulatedODrive;
use odrive_sine::sine::SineWave;
use odrive_sine::{AxisState, ControlMode, Error, InputMode, ODrive, ODriveError, ProcedureResult};
use std::sync::atomic::AtomicBool;
use std::time::Duration;

fn fast_config(amplitude: f32, frequency_hz: f32) -> anyhow::Result<SessionConfig> {
    let mut config = SessionConfig::new(SineWave::new(amplitude, frequency_hz, 0.)?);
    config.period = Duration::from_millis(1);
    config.poll_interval = Duration::from_millis(1);
    config.calibration_timeout = Duration::from_secs(1);
    config.state_timeout = Duration::from_millis(200);
    Ok(config)
}

#[test]
fn runs_the_whole_sequence() -> anyhow::Result<()> {
    let mut config = fast_config(2., 1.)?;
    config.duration = Some(Duration::from_millis(30));
    let mut odrive = ODrive::new(SimulatedODrive::new(), false);
    let stop = AtomicBool::new(false);
    let mut seen = Vec::new();

    let report = session::run(&mut odrive, &config, &stop, |_, setpoint| seen.push(setpoint))?;

    assert_eq!(report.exit, ExitReason::DurationElapsed);
    assert!(report.setpoints_sent > 0);
    assert_eq!(report.setpoints_sent, seen.len());
    assert!(report.errors.is_clean());
    assert_eq!(report.serial_number, 0x3867_3358_3431);

    let sim = odrive.into_inner();
    assert_eq!(
        sim.requested_states(),
        &[
            AxisState::FullCalibrationSequence,
            AxisState::ClosedLoopControl,
            AxisState::Idle
        ]
    );
    assert_eq!(sim.current_state(), AxisState::Idle);
    assert_eq!(sim.control_mode(), ControlMode::Velocity);
    assert_eq!(sim.input_mode(), InputMode::Passthrough);
    assert_eq!(sim.setpoints().len(), seen.len());
    for (sent, received) in seen.iter().zip(sim.setpoints()) {
        assert!((sent - received).abs() < 1e-3);
        assert!(sent.abs() <= 2. + 1e-6);
    }
    Ok(())
}

#[test]
fn stops_streaming_when_the_axis_disarms() -> anyhow::Result<()> {
    let config = fast_config(1., 2.)?;
    let sim = SimulatedODrive::new().with_fault_after(5, ODriveError::SPINOUT_DETECTED);
    let mut odrive = ODrive::new(sim, true);
    let stop = AtomicBool::new(false);

    let report = session::run(&mut odrive, &config, &stop, |_, _| {})?;

    assert_eq!(report.exit, ExitReason::LeftClosedLoop(AxisState::Idle));
    assert_eq!(report.setpoints_sent, 5);
    assert!(report
        .errors
        .active_errors
        .contains(ODriveError::SPINOUT_DETECTED));
    assert_eq!(report.errors.procedure_result, ProcedureResult::Disarmed);
    assert_eq!(
        odrive.transport().requested_states().last(),
        Some(&AxisState::Idle)
    );
    Ok(())
}

#[test]
fn velocity_limit_violation_ends_the_run() -> anyhow::Result<()> {
    let config = fast_config(50., 5.)?;
    let sim = SimulatedODrive::new().with_vel_limit(10.);
    let mut odrive = ODrive::new(sim, false);
    let stop = AtomicBool::new(false);

    let report = session::run(&mut odrive, &config, &stop, |_, _| {})?;

    assert!(matches!(report.exit, ExitReason::LeftClosedLoop(_)));
    assert!(report
        .errors
        .disarm_reason
        .contains(ODriveError::VELOCITY_LIMIT_VIOLATION));
    Ok(())
}

#[test]
fn failed_calibration_still_returns_to_idle() -> anyhow::Result<()> {
    let config = fast_config(1., 1.)?;
    let sim =
        SimulatedODrive::new().with_calibration_outcome(ProcedureResult::PhaseResistanceOutOfRange);
    let mut odrive = ODrive::new(sim, false);
    let stop = AtomicBool::new(false);

    let err = session::run(&mut odrive, &config, &stop, |_, _| {}).unwrap_err();

    match err {
        Error::CalibrationFailed { result, errors } => {
            assert_eq!(result, ProcedureResult::PhaseResistanceOutOfRange);
            assert!(errors.contains(ODriveError::CALIBRATION_ERROR));
        }
        other => panic!("unexpected error: {other}"),
    }
    let sim = odrive.into_inner();
    assert_eq!(
        sim.requested_states(),
        &[AxisState::FullCalibrationSequence, AxisState::Idle]
    );
    assert!(sim.setpoints().is_empty());
    Ok(())
}

#[test]
fn stop_during_calibration_skips_closed_loop() -> anyhow::Result<()> {
    let config = fast_config(1., 1.)?;
    let sim = SimulatedODrive::new().with_calibration_ticks(100);
    let mut odrive = ODrive::new(sim, false);
    let stop = AtomicBool::new(true);

    let report = session::run(&mut odrive, &config, &stop, |_, _| {})?;

    assert_eq!(report.exit, ExitReason::Stopped);
    assert_eq!(report.setpoints_sent, 0);
    assert_eq!(
        odrive.transport().requested_states(),
        &[AxisState::FullCalibrationSequence, AxisState::Idle]
    );
    Ok(())
}

#[test]
fn leftover_errors_are_cleared_before_calibrating() -> anyhow::Result<()> {
    let mut config = fast_config(1., 1.)?;
    config.duration = Some(Duration::from_millis(5));
    let sim = SimulatedODrive::new().with_latched_errors(ODriveError::DC_BUS_UNDER_VOLTAGE);
    let mut odrive = ODrive::new(sim, false);
    let stop = AtomicBool::new(false);

    let report = session::run(&mut odrive, &config, &stop, |_, _| {})?;

    assert_eq!(report.exit, ExitReason::DurationElapsed);
    assert!(report.errors.is_clean());
    Ok(())
}

#[test]
fn refused_closed_loop_reports_the_disarm_reason() -> anyhow::Result<()> {
    let config = fast_config(1., 1.)?;
    let sim = SimulatedODrive::new().with_closed_loop_refusal(ODriveError::BRAKE_RESISTOR_DISARMED);
    let mut odrive = ODrive::new(sim, false);
    let stop = AtomicBool::new(false);

    let err = session::run(&mut odrive, &config, &stop, |_, _| {}).unwrap_err();

    match err {
        Error::Disarmed {
            requested,
            state,
            reason,
        } => {
            assert_eq!(requested, AxisState::ClosedLoopControl);
            assert_eq!(state, AxisState::Idle);
            assert!(reason.contains(ODriveError::BRAKE_RESISTOR_DISARMED));
        }
        other => panic!("unexpected error: {other}"),
    }
    let sim = odrive.into_inner();
    assert_eq!(sim.requested_states().last(), Some(&AxisState::Idle));
    assert!(sim.setpoints().is_empty());
    Ok(())
}

#[test]
fn calibration_that_never_finishes_times_out() -> anyhow::Result<()> {
    let mut config = fast_config(1., 1.)?;
    config.calibration_timeout = Duration::from_millis(20);
    let sim = SimulatedODrive::new().with_calibration_ticks(u32::MAX);
    let mut odrive = ODrive::new(sim, false);
    let stop = AtomicBool::new(false);

    let err = session::run(&mut odrive, &config, &stop, |_, _| {}).unwrap_err();

    match err {
        Error::StateTimeout { expected, last, .. } => {
            assert_eq!(expected, "calibration to finish");
            assert!(last.is_calibrating());
        }
        other => panic!("unexpected error: {other}"),
    }
    let sim = odrive.into_inner();
    assert_eq!(
        sim.requested_states(),
        &[AxisState::FullCalibrationSequence, AxisState::Idle]
    );
    assert_eq!(sim.current_state(), AxisState::Idle);
    Ok(())
}

#[test]
fn sequence_error_wins_over_failed_idle() -> anyhow::Result<()> {
    let mut config = fast_config(1., 1.)?;
    config.calibration_timeout = Duration::from_millis(20);
    config.state_timeout = Duration::from_millis(20);
    let sim = SimulatedODrive::new()
        .with_calibration_ticks(u32::MAX)
        .with_idle_ignored();
    let mut odrive = ODrive::new(sim, false);
    let stop = AtomicBool::new(false);

    let err = session::run(&mut odrive, &config, &stop, |_, _| {}).unwrap_err();

    match err {
        Error::StateTimeout { expected, .. } => assert_eq!(expected, "calibration to finish"),
        other => panic!("unexpected error: {other}"),
    }
    let sim = odrive.into_inner();
    assert_eq!(sim.requested_states().last(), Some(&AxisState::Idle));
    assert!(sim.current_state().is_calibrating());
    Ok(())
}

#[test]
fn stale_procedure_result_does_not_fail_calibration() -> anyhow::Result<()> {
    let mut config = fast_config(1., 1.)?;
    config.duration = Some(Duration::from_millis(5));
    let sim = SimulatedODrive::new()
        .with_procedure_result(ProcedureResult::Disarmed)
        .with_calibration_start_polls(2);
    let mut odrive = ODrive::new(sim, false);
    let stop = AtomicBool::new(false);

    let report = session::run(&mut odrive, &config, &stop, |_, _| {})?;

    assert_eq!(report.exit, ExitReason::DurationElapsed);
    assert!(report.errors.is_clean());
    assert_eq!(
        odrive.transport().requested_states(),
        &[
            AxisState::FullCalibrationSequence,
            AxisState::ClosedLoopControl,
            AxisState::Idle
        ]
    );
    Ok(())
}
