//! The whole control sequence: clear faults, calibrate, enter closed-loop velocity control,
//! stream the sine setpoint, and put the axis back to idle however the run ends.

use crate::sine::SineWave;
use crate::{
    format_serial, AxisState, ControlMode, Error, ErrorReport, InputMode, ODrive,
    ProcedureResult, Result, Transport,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub axis: u8,
    pub wave: SineWave,
    /// Delay between two setpoints.
    pub period: Duration,
    pub calibration_timeout: Duration,
    /// How long to wait for the axis to enter closed-loop control, or to go back to idle.
    pub state_timeout: Duration,
    pub poll_interval: Duration,
    /// Stop streaming after this long. `None` runs until stopped or disarmed.
    pub duration: Option<Duration>,
}

impl SessionConfig {
    pub fn new(wave: SineWave) -> SessionConfig {
        SessionConfig {
            axis: 0,
            wave,
            period: Duration::from_millis(10),
            calibration_timeout: Duration::from_secs(30),
            state_timeout: Duration::from_secs(2),
            poll_interval: Duration::from_millis(100),
            duration: None,
        }
    }
}

/// Why the setpoint stream ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    Stopped,
    DurationElapsed,
    /// The firmware dropped out of closed-loop control on its own, usually after a fault.
    LeftClosedLoop(AxisState),
}

#[derive(Debug, Clone)]
pub struct SessionReport {
    pub serial_number: u64,
    pub setpoints_sent: usize,
    pub streamed_for: Duration,
    pub exit: ExitReason,
    /// Fault state read after the axis went back to idle.
    pub errors: ErrorReport,
}

/// Runs the full sequence on `odrive`. `on_setpoint` sees every setpoint right after it was sent.
///
/// Once the board has answered, the axis is always asked to go idle before returning and the
/// final error report is logged, whether the run succeeded or not.
pub fn run<T, F>(
    odrive: &mut ODrive<T>,
    config: &SessionConfig,
    stop: &AtomicBool,
    on_setpoint: F,
) -> Result<SessionReport>
where
    T: Transport,
    F: FnMut(Duration, f32),
{
    let axis = config.axis;
    let serial_number = odrive.serial_number()?;
    log::info!("found ODrive {}", format_serial(serial_number));

    let outcome = drive(odrive, config, stop, on_setpoint);

    log::info!("returning axis{axis} to idle");
    let idle = odrive.request_state(axis, AxisState::Idle).and_then(|()| {
        odrive.wait_for_state(
            axis,
            "idle",
            config.state_timeout,
            config.poll_interval,
            |state| state == AxisState::Idle,
        )
    });
    let errors = odrive.dump_errors(axis);
    match &errors {
        Ok(report) if report.is_clean() => log::info!("{report}"),
        Ok(report) => log::warn!("{report}"),
        Err(err) => log::error!("could not read errors: {err}"),
    }

    match outcome {
        Ok((setpoints_sent, streamed_for, exit)) => {
            idle?;
            Ok(SessionReport {
                serial_number,
                setpoints_sent,
                streamed_for,
                exit,
                errors: errors?,
            })
        }
        Err(err) => {
            if let Err(idle_err) = idle {
                log::error!("axis{axis} did not return to idle: {idle_err}");
            }
            Err(err)
        }
    }
}

fn drive<T, F>(
    odrive: &mut ODrive<T>,
    config: &SessionConfig,
    stop: &AtomicBool,
    on_setpoint: F,
) -> Result<(usize, Duration, ExitReason)>
where
    T: Transport,
    F: FnMut(Duration, f32),
{
    log::info!("clearing pre-existing errors");
    odrive.clear_errors()?;

    if calibrate(odrive, config, stop)?.is_none() {
        log::info!("stop requested during calibration");
        return Ok((0, Duration::ZERO, ExitReason::Stopped));
    }

    enter_closed_loop(odrive, config)?;
    stream(odrive, config, stop, on_setpoint)
}

/// `None` when a stop was requested before calibration finished.
fn calibrate<T: Transport>(
    odrive: &mut ODrive<T>,
    config: &SessionConfig,
    stop: &AtomicBool,
) -> Result<Option<ErrorReport>> {
    let axis = config.axis;
    log::info!("running calibration on axis{axis}, the motor will move");
    odrive.request_state(axis, AxisState::FullCalibrationSequence)?;

    let start = Instant::now();
    // Right after the request the axis can still read idle; only trust idle once calibration
    // was seen running, or when the firmware already reports a disarm reason.
    let mut started = false;
    loop {
        let state = odrive.current_state(axis)?;
        if state.is_calibrating() {
            if !started {
                log::debug!("axis{axis}: calibration started");
            }
            started = true;
        } else {
            let report = odrive.dump_errors(axis)?;
            // Until calibration was seen running, procedure_result may still describe an
            // earlier procedure.
            let refused = !report.disarm_reason.is_empty()
                || (started
                    && !(report.procedure_result.is_success()
                        || report.procedure_result == ProcedureResult::Busy));
            if refused {
                log::warn!("calibration failed: {report}");
                return Err(Error::CalibrationFailed {
                    result: report.procedure_result,
                    errors: report.active_errors | report.disarm_reason,
                });
            }
            if started {
                log::info!("calibration successful: {report}");
                return Ok(Some(report));
            }
        }

        if stop.load(Ordering::SeqCst) {
            return Ok(None);
        }
        let waited = start.elapsed();
        if waited >= config.calibration_timeout {
            return Err(Error::StateTimeout {
                expected: "calibration to finish",
                last: state,
                waited,
            });
        }
        std::thread::sleep(config.poll_interval);
    }
}

fn enter_closed_loop<T: Transport>(odrive: &mut ODrive<T>, config: &SessionConfig) -> Result {
    let axis = config.axis;
    log::info!("entering closed-loop velocity control");
    odrive.set_input_mode(axis, InputMode::Passthrough)?;
    odrive.set_control_mode(axis, ControlMode::Velocity)?;
    odrive.request_state(axis, AxisState::ClosedLoopControl)?;

    let start = Instant::now();
    loop {
        let state = odrive.current_state(axis)?;
        if state == AxisState::ClosedLoopControl {
            log::info!("closed-loop control activated");
            return Ok(());
        }
        let report = odrive.dump_errors(axis)?;
        if !report.disarm_reason.is_empty() {
            return Err(Error::Disarmed {
                requested: AxisState::ClosedLoopControl,
                state,
                reason: report.disarm_reason,
            });
        }

        let waited = start.elapsed();
        if waited >= config.state_timeout {
            return Err(Error::StateTimeout {
                expected: "closed-loop control",
                last: state,
                waited,
            });
        }
        std::thread::sleep(config.poll_interval);
    }
}

fn stream<T, F>(
    odrive: &mut ODrive<T>,
    config: &SessionConfig,
    stop: &AtomicBool,
    mut on_setpoint: F,
) -> Result<(usize, Duration, ExitReason)>
where
    T: Transport,
    F: FnMut(Duration, f32),
{
    let axis = config.axis;
    let wave = &config.wave;
    log::info!(
        "running sine wave: amplitude={} turns/s, frequency={} Hz, center={} turns/s, peak={} turns/s",
        wave.amplitude(),
        wave.frequency_hz(),
        wave.center(),
        wave.peak()
    );

    let t0 = Instant::now();
    let mut sent = 0;
    loop {
        let elapsed = t0.elapsed();
        if stop.load(Ordering::SeqCst) {
            log::info!("stop requested");
            return Ok((sent, elapsed, ExitReason::Stopped));
        }
        if config.duration.is_some_and(|limit| elapsed >= limit) {
            return Ok((sent, elapsed, ExitReason::DurationElapsed));
        }

        let state = odrive.current_state(axis)?;
        if state != AxisState::ClosedLoopControl {
            log::warn!("axis{axis} left closed-loop control, now {state:?}");
            return Ok((sent, elapsed, ExitReason::LeftClosedLoop(state)));
        }

        let setpoint = wave.setpoint(elapsed);
        odrive.set_input_vel(axis, setpoint)?;
        sent += 1;
        on_setpoint(elapsed, setpoint);

        std::thread::sleep(config.period);
    }
}
