//! In-memory stand-in for a board. It answers the same ASCII requests a real board does and
//! runs a small version of the axis state machine, enough to walk through calibration,
//! closed-loop control and fault handling without hardware.

use crate::commands::checksum;
use crate::enums::{AxisState, ControlMode, InputMode, ODriveError, ProcedureResult};
use crate::transport::Transport;
use crate::{Error, Result};
use std::collections::VecDeque;

#[derive(Debug, Clone)]
struct SimAxis {
    current_state: AxisState,
    calibrated: bool,
    calibration_ticks_left: u32,
    /// Polls left before a requested calibration actually starts.
    calibration_start_in: Option<u32>,
    procedure_result: ProcedureResult,
    active_errors: ODriveError,
    disarm_reason: ODriveError,
    control_mode: ControlMode,
    input_mode: InputMode,
    input_vel: f32,
    vel_limit: f32,
    pos_estimate: f32,
}

impl Default for SimAxis {
    fn default() -> Self {
        SimAxis {
            current_state: AxisState::Idle,
            calibrated: false,
            calibration_ticks_left: 0,
            calibration_start_in: None,
            procedure_result: ProcedureResult::Success,
            active_errors: ODriveError::empty(),
            disarm_reason: ODriveError::empty(),
            control_mode: ControlMode::Position,
            input_mode: InputMode::Passthrough,
            input_vel: 0.0,
            vel_limit: 10.0,
            pos_estimate: 0.0,
        }
    }
}

pub struct SimulatedODrive {
    serial_number: u64,
    vbus_voltage: f32,
    axis: SimAxis,
    calibration_ticks: u32,
    calibration_start_polls: u32,
    calibration_outcome: ProcedureResult,
    closed_loop_refusal: Option<ODriveError>,
    ignore_idle: bool,
    fault_after: Option<(usize, ODriveError)>,
    pending: VecDeque<String>,
    setpoints: Vec<f32>,
    requested_states: Vec<AxisState>,
}

impl Default for SimulatedODrive {
    fn default() -> Self {
        SimulatedODrive::new()
    }
}

impl SimulatedODrive {
    pub fn new() -> SimulatedODrive {
        SimulatedODrive {
            serial_number: 0x3867_3358_3431,
            vbus_voltage: 24.0,
            axis: SimAxis::default(),
            calibration_ticks: 3,
            calibration_start_polls: 0,
            calibration_outcome: ProcedureResult::Success,
            closed_loop_refusal: None,
            ignore_idle: false,
            fault_after: None,
            pending: VecDeque::new(),
            setpoints: Vec::new(),
            requested_states: Vec::new(),
        }
    }

    /// Number of `current_state` polls a calibration takes before it finishes.
    pub fn with_calibration_ticks(mut self, ticks: u32) -> Self {
        self.calibration_ticks = ticks;
        self
    }

    /// Number of `current_state` polls between the calibration request and the axis entering
    /// calibration. Until then the axis reads idle with its old `procedure_result`.
    pub fn with_calibration_start_polls(mut self, polls: u32) -> Self {
        self.calibration_start_polls = polls;
        self
    }

    /// `procedure_result` left over from an earlier run. `sc` does not reset it.
    pub fn with_procedure_result(mut self, result: ProcedureResult) -> Self {
        self.axis.procedure_result = result;
        self
    }

    /// Closed-loop requests disarm the axis with `reason` instead of being accepted.
    pub fn with_closed_loop_refusal(mut self, reason: ODriveError) -> Self {
        self.closed_loop_refusal = Some(reason);
        self
    }

    /// Idle requests are ignored, leaving the axis in whatever state it is in.
    pub fn with_idle_ignored(mut self) -> Self {
        self.ignore_idle = true;
        self
    }

    /// Makes the next calibration end with `result` instead of success.
    pub fn with_calibration_outcome(mut self, result: ProcedureResult) -> Self {
        self.calibration_outcome = result;
        self
    }

    /// Trips `error` and disarms the axis once `count` velocity setpoints have arrived.
    pub fn with_fault_after(mut self, count: usize, error: ODriveError) -> Self {
        self.fault_after = Some((count, error));
        self
    }

    pub fn with_vel_limit(mut self, vel_limit: f32) -> Self {
        self.axis.vel_limit = vel_limit;
        self
    }

    /// Latches errors as if they were left over from an earlier run.
    pub fn with_latched_errors(mut self, errors: ODriveError) -> Self {
        self.axis.active_errors = errors;
        self.axis.disarm_reason = errors;
        self
    }

    /// Every velocity setpoint received, in order.
    pub fn setpoints(&self) -> &[f32] {
        &self.setpoints
    }

    /// Every state requested through `requested_state`, in order.
    pub fn requested_states(&self) -> &[AxisState] {
        &self.requested_states
    }

    pub fn current_state(&self) -> AxisState {
        self.axis.current_state
    }

    pub fn control_mode(&self) -> ControlMode {
        self.axis.control_mode
    }

    pub fn input_mode(&self) -> InputMode {
        self.axis.input_mode
    }

    fn reply(&mut self, text: String, with_checksum: bool) {
        if with_checksum {
            let cs = checksum(text.as_bytes());
            self.pending.push_back(format!("{text}*{cs}"));
        } else {
            self.pending.push_back(text);
        }
    }

    fn disarm(&mut self, error: ODriveError, result: ProcedureResult) {
        log::debug!("sim: disarming with {error}");
        self.axis.active_errors |= error;
        self.axis.disarm_reason |= error;
        self.axis.procedure_result = result;
        self.axis.current_state = AxisState::Idle;
        self.axis.input_vel = 0.0;
    }

    fn tick_calibration(&mut self) {
        if let Some(polls) = self.axis.calibration_start_in {
            if polls > 0 {
                self.axis.calibration_start_in = Some(polls - 1);
            } else {
                self.axis.calibration_start_in = None;
                self.start_calibration();
            }
            return;
        }
        if !self.axis.current_state.is_calibrating() {
            return;
        }
        if self.axis.calibration_ticks_left > 0 {
            self.axis.calibration_ticks_left -= 1;
            // Motor calibration runs first, encoder offset after.
            if self.axis.calibration_ticks_left < self.calibration_ticks / 2 {
                self.axis.current_state = AxisState::EncoderOffsetCalibration;
            } else {
                self.axis.current_state = AxisState::MotorCalibration;
            }
            return;
        }
        let outcome = self.calibration_outcome;
        if outcome.is_success() {
            self.axis.calibrated = true;
            self.axis.procedure_result = outcome;
            self.axis.current_state = AxisState::Idle;
        } else {
            self.axis.calibrated = false;
            self.disarm(ODriveError::CALIBRATION_ERROR, outcome);
        }
    }

    fn start_calibration(&mut self) {
        self.axis.current_state = AxisState::FullCalibrationSequence;
        self.axis.calibration_ticks_left = self.calibration_ticks;
        self.axis.procedure_result = ProcedureResult::Busy;
    }

    fn request_state(&mut self, state: AxisState) {
        self.requested_states.push(state);
        match state {
            AxisState::Idle if self.ignore_idle => {}
            AxisState::Idle => {
                self.axis.calibration_start_in = None;
                self.axis.current_state = AxisState::Idle;
                self.axis.input_vel = 0.0;
            }
            AxisState::FullCalibrationSequence => {
                if !self.axis.active_errors.is_empty() {
                    self.axis.procedure_result = ProcedureResult::Disarmed;
                    return;
                }
                if self.calibration_start_polls > 0 {
                    self.axis.calibration_start_in = Some(self.calibration_start_polls);
                } else {
                    self.start_calibration();
                }
            }
            AxisState::ClosedLoopControl => {
                if !self.axis.active_errors.is_empty() {
                    self.axis.procedure_result = ProcedureResult::Disarmed;
                } else if let Some(reason) = self.closed_loop_refusal {
                    self.disarm(reason, ProcedureResult::Disarmed);
                } else if !self.axis.calibrated {
                    self.disarm(ODriveError::MISSING_ESTIMATE, ProcedureResult::NotCalibrated);
                } else {
                    self.axis.current_state = AxisState::ClosedLoopControl;
                    self.axis.procedure_result = ProcedureResult::Success;
                }
            }
            _ => self.axis.procedure_result = ProcedureResult::InvalidState,
        }
    }

    fn apply_setpoint(&mut self, velocity: f32) {
        if self.axis.current_state != AxisState::ClosedLoopControl {
            return;
        }
        self.setpoints.push(velocity);
        if velocity.abs() > self.axis.vel_limit {
            self.disarm(
                ODriveError::VELOCITY_LIMIT_VIOLATION,
                ProcedureResult::Disarmed,
            );
            return;
        }
        if let Some((count, error)) = self.fault_after {
            if self.setpoints.len() >= count {
                self.fault_after = None;
                self.disarm(error, ProcedureResult::Disarmed);
                return;
            }
        }
        self.axis.input_vel = velocity;
        self.axis.pos_estimate += velocity * 0.01;
    }

    fn read(&mut self, path: &str) -> Option<String> {
        let value = match path {
            "serial_number" => self.serial_number.to_string(),
            "fw_version_major" => "0".to_string(),
            "fw_version_minor" => "6".to_string(),
            "fw_version_revision" => "10".to_string(),
            "vbus_voltage" => format!("{:.6}", self.vbus_voltage),
            "axis0.current_state" => {
                self.tick_calibration();
                self.axis.current_state.code().to_string()
            }
            "axis0.requested_state" => AxisState::Undefined.code().to_string(),
            "axis0.procedure_result" => self.axis.procedure_result.code().to_string(),
            "axis0.active_errors" => self.axis.active_errors.bits().to_string(),
            "axis0.disarm_reason" => self.axis.disarm_reason.bits().to_string(),
            "axis0.is_calibrated" => u8::from(self.axis.calibrated).to_string(),
            "axis0.controller.config.control_mode" => self.axis.control_mode.code().to_string(),
            "axis0.controller.config.input_mode" => self.axis.input_mode.code().to_string(),
            "axis0.controller.config.vel_limit" => format!("{:.6}", self.axis.vel_limit),
            "axis0.controller.input_vel" => format!("{:.6}", self.axis.input_vel),
            _ => return None,
        };
        Some(value)
    }

    fn write(&mut self, path: &str, value: &str) -> Result {
        let code = || -> Result<u8> {
            value.parse().map_err(|_| Error::Parse {
                what: path.to_string(),
                value: value.to_string(),
            })
        };
        let float = || -> Result<f32> {
            value.parse().map_err(|_| Error::Parse {
                what: path.to_string(),
                value: value.to_string(),
            })
        };
        match path {
            "axis0.requested_state" => {
                let state = AxisState::from_code(code()?)?;
                self.request_state(state);
            }
            "axis0.controller.config.control_mode" => {
                self.axis.control_mode = ControlMode::from_code(code()?)?;
            }
            "axis0.controller.config.input_mode" => {
                self.axis.input_mode = InputMode::from_code(code()?)?;
            }
            "axis0.controller.config.vel_limit" => self.axis.vel_limit = float()?,
            "axis0.controller.input_vel" => {
                let velocity = float()?;
                self.apply_setpoint(velocity);
            }
            _ => return Err(Error::Device("invalid property".to_string())),
        }
        Ok(())
    }

    fn handle(&mut self, line: &str, with_checksum: bool) {
        let mut parts = line.split_whitespace();
        match (parts.next(), parts.next(), parts.next()) {
            (Some("r"), Some(path), None) => {
                let value = self
                    .read(path)
                    .unwrap_or_else(|| "invalid property".to_string());
                self.reply(value, with_checksum);
            }
            (Some("w"), Some(path), Some(value)) => {
                // The client never reads replies to writes, so rejected writes only get logged.
                if let Err(err) = self.write(path, value) {
                    log::warn!("sim: rejected `{line}`: {err}");
                }
            }
            (Some("sc"), None, None) => {
                self.axis.active_errors = ODriveError::empty();
                self.axis.disarm_reason = ODriveError::empty();
            }
            (Some("v"), Some("0"), Some(velocity)) => match velocity.parse() {
                Ok(velocity) => self.apply_setpoint(velocity),
                Err(_) => log::warn!("sim: bad velocity in `{line}`"),
            },
            (Some("f"), Some("0"), None) => {
                let text = format!(
                    "{:.6} {:.6}",
                    self.axis.pos_estimate, self.axis.input_vel
                );
                self.reply(text, with_checksum);
            }
            (Some("v" | "f"), Some(_), _) => {
                self.reply("invalid motor".to_string(), with_checksum);
            }
            _ => self.reply("unknown command".to_string(), with_checksum),
        }
    }
}

impl Transport for SimulatedODrive {
    fn send_line(&mut self, line: &str) -> Result {
        let (body, with_checksum) = match line.rsplit_once('*') {
            Some((body, cs)) => {
                if cs.parse::<u8>().ok() != Some(checksum(body.as_bytes())) {
                    // The firmware silently drops lines with a bad checksum.
                    log::warn!("sim: dropping `{line}` with bad checksum");
                    return Ok(());
                }
                (body, true)
            }
            None => (line, false),
        };
        self.handle(body.trim(), with_checksum);
        Ok(())
    }

    fn recv_line(&mut self) -> Result<String> {
        self.pending.pop_front().ok_or(Error::Timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read(sim: &mut SimulatedODrive, path: &str) -> String {
        sim.send_line(&format!("r {path}")).unwrap();
        sim.recv_line().unwrap()
    }

    #[test]
    fn calibration_runs_through_substates() {
        let mut sim = SimulatedODrive::new().with_calibration_ticks(4);
        sim.send_line("w axis0.requested_state 3").unwrap();
        let mut seen = Vec::new();
        loop {
            let state = read(&mut sim, "axis0.current_state");
            let state = AxisState::from_code(state.parse().unwrap()).unwrap();
            seen.push(state);
            if state == AxisState::Idle {
                break;
            }
        }
        assert!(seen.contains(&AxisState::MotorCalibration));
        assert!(seen.contains(&AxisState::EncoderOffsetCalibration));
        assert_eq!(read(&mut sim, "axis0.procedure_result"), "0");
        assert_eq!(read(&mut sim, "axis0.is_calibrated"), "1");
    }

    #[test]
    fn closed_loop_requires_calibration() {
        let mut sim = SimulatedODrive::new();
        sim.send_line("w axis0.requested_state 8").unwrap();
        assert_eq!(sim.current_state(), AxisState::Idle);
        assert_eq!(
            read(&mut sim, "axis0.procedure_result"),
            ProcedureResult::NotCalibrated.code().to_string()
        );
        assert_ne!(read(&mut sim, "axis0.disarm_reason"), "0");
        sim.send_line("sc").unwrap();
        assert_eq!(read(&mut sim, "axis0.active_errors"), "0");
    }

    #[test]
    fn unknown_requests_get_error_replies() {
        let mut sim = SimulatedODrive::new();
        assert_eq!(read(&mut sim, "axis7.current_state"), "invalid property");
        sim.send_line("x").unwrap();
        assert_eq!(sim.recv_line().unwrap(), "unknown command");
        sim.send_line("f 1").unwrap();
        assert_eq!(sim.recv_line().unwrap(), "invalid motor");
        assert!(matches!(sim.recv_line(), Err(Error::Timeout)));
    }

    #[test]
    fn drops_lines_with_bad_checksum() {
        let mut sim = SimulatedODrive::new();
        sim.send_line("r vbus_voltage*0").unwrap();
        assert!(matches!(sim.recv_line(), Err(Error::Timeout)));
    }
}
