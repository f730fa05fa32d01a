use crate::commands::{
    decode_response, encode_command, ClearErrors, Command, Feedback, ReadProperty, SetVelocity,
    WriteProperty,
};
use std::fmt;
use std::str::FromStr;
use std::time::{Duration, Instant};

mod commands;
mod enums;
pub mod session;
pub mod sim;
pub mod sine;
pub mod transport;

pub use crate::commands::FeedbackResponse;
pub use crate::enums::{AxisState, ControlMode, InputMode, ODriveError, ProcedureResult};
pub use crate::transport::{find_any, Discovery, SerialTransport, Transport};

/// A single board reached through some [`Transport`]. Only one axis is driven at a time, but the
/// axis index is passed explicitly so boards with two axes still work.
pub struct ODrive<T> {
    transport: T,
    checksum: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("serial port error: {0}")]
    Serial(#[from] serialport::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("timed out waiting for a reply from the board")]
    Timeout,
    #[error("no board found on the USB bus")]
    NotFound,
    #[error("stopped while waiting for a board")]
    Interrupted,
    #[error("reply checksum mismatch, expected {expected}, got {actual}")]
    Checksum { expected: u8, actual: u8 },
    #[error("board rejected the request: {0}")]
    Device(String),
    #[error("could not parse {what} from {value:?}")]
    Parse { what: String, value: String },
    #[error("unknown {kind} code {code}")]
    UnknownEnum { kind: &'static str, code: u32 },
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),
    #[error("axis stayed in {last:?} for {waited:?} while waiting for {expected}")]
    StateTimeout {
        expected: &'static str,
        last: AxisState,
        waited: Duration,
    },
    #[error("calibration failed with {result}, errors: {errors}")]
    CalibrationFailed {
        result: ProcedureResult,
        errors: ODriveError,
    },
    #[error("axis refused {requested:?} and is in {state:?}, disarm reason: {reason}")]
    Disarmed {
        requested: AxisState,
        state: AxisState,
        reason: ODriveError,
    },
}

pub type Result<T = (), E = Error> = std::result::Result<T, E>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FirmwareVersion {
    pub major: u8,
    pub minor: u8,
    pub revision: u8,
}

impl fmt::Display for FirmwareVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.revision)
    }
}

/// Snapshot of the fault state of one axis, the equivalent of the vendor `dump_errors` output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErrorReport {
    pub axis: u8,
    pub active_errors: ODriveError,
    pub disarm_reason: ODriveError,
    pub procedure_result: ProcedureResult,
}

impl ErrorReport {
    pub fn is_clean(&self) -> bool {
        self.active_errors.is_empty() && self.disarm_reason.is_empty()
    }
}

impl fmt::Display for ErrorReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_clean() {
            return write!(
                f,
                "axis{}: no errors (last procedure: {})",
                self.axis, self.procedure_result
            );
        }
        write!(
            f,
            "axis{}: active_errors: {}, disarm_reason: {}, last procedure: {}",
            self.axis, self.active_errors, self.disarm_reason, self.procedure_result
        )
    }
}

impl<T: Transport> ODrive<T> {
    pub fn new(transport: T, checksum: bool) -> ODrive<T> {
        ODrive {
            transport,
            checksum,
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn into_inner(self) -> T {
        self.transport
    }

    pub fn serial_number(&mut self) -> Result<u64> {
        self.read("serial_number")
    }

    pub fn firmware_version(&mut self) -> Result<FirmwareVersion> {
        Ok(FirmwareVersion {
            major: self.read("fw_version_major")?,
            minor: self.read("fw_version_minor")?,
            revision: self.read("fw_version_revision")?,
        })
    }

    pub fn vbus_voltage(&mut self) -> Result<f32> {
        self.read("vbus_voltage")
    }

    pub fn clear_errors(&mut self) -> Result {
        log::debug!("clearing errors");
        self.write_command(&ClearErrors)
    }

    pub fn current_state(&mut self, axis: u8) -> Result<AxisState> {
        let code = self.read(&format!("axis{axis}.current_state"))?;
        AxisState::from_code(code)
    }

    /// Asks the firmware to move the axis into `state`. The request only takes effect once the
    /// firmware accepts it; see [`ODrive::wait_for_state`].
    pub fn request_state(&mut self, axis: u8, state: AxisState) -> Result {
        log::debug!("axis{axis}: requesting {state:?}");
        self.write(&format!("axis{axis}.requested_state"), state.code())
    }

    /// Polls `current_state` until `done` accepts it or `timeout` runs out.
    pub fn wait_for_state<F>(
        &mut self,
        axis: u8,
        expected: &'static str,
        timeout: Duration,
        poll: Duration,
        mut done: F,
    ) -> Result<AxisState>
    where
        F: FnMut(AxisState) -> bool,
    {
        let start = Instant::now();
        let mut last = self.current_state(axis)?;
        loop {
            if done(last) {
                return Ok(last);
            }
            let waited = start.elapsed();
            if waited >= timeout {
                return Err(Error::StateTimeout {
                    expected,
                    last,
                    waited,
                });
            }
            std::thread::sleep(poll);
            let state = self.current_state(axis)?;
            if state != last {
                log::debug!("axis{axis}: {last:?} -> {state:?}");
            }
            last = state;
        }
    }

    pub fn control_mode(&mut self, axis: u8) -> Result<ControlMode> {
        let code = self.read(&format!("axis{axis}.controller.config.control_mode"))?;
        ControlMode::from_code(code)
    }

    pub fn set_control_mode(&mut self, axis: u8, mode: ControlMode) -> Result {
        self.write(
            &format!("axis{axis}.controller.config.control_mode"),
            mode.code(),
        )
    }

    pub fn input_mode(&mut self, axis: u8) -> Result<InputMode> {
        let code = self.read(&format!("axis{axis}.controller.config.input_mode"))?;
        InputMode::from_code(code)
    }

    pub fn set_input_mode(&mut self, axis: u8, mode: InputMode) -> Result {
        self.write(
            &format!("axis{axis}.controller.config.input_mode"),
            mode.code(),
        )
    }

    /// Velocity setpoint in turns/s, applied directly in passthrough input mode.
    pub fn set_input_vel(&mut self, axis: u8, velocity: f32) -> Result {
        if !velocity.is_finite() {
            return Err(Error::InvalidParameter(format!(
                "velocity setpoint {velocity} is not finite"
            )));
        }
        self.write_command(&SetVelocity {
            axis,
            velocity,
            torque_ff: 0.0,
        })
    }

    pub fn feedback(&mut self, axis: u8) -> Result<FeedbackResponse> {
        self.query(&Feedback { axis })
    }

    pub fn dump_errors(&mut self, axis: u8) -> Result<ErrorReport> {
        let active: u32 = self.read(&format!("axis{axis}.active_errors"))?;
        let disarm: u32 = self.read(&format!("axis{axis}.disarm_reason"))?;
        let procedure: u8 = self.read(&format!("axis{axis}.procedure_result"))?;
        Ok(ErrorReport {
            axis,
            active_errors: ODriveError::from_bits_retain(active),
            disarm_reason: ODriveError::from_bits_retain(disarm),
            procedure_result: ProcedureResult::from_code(procedure)?,
        })
    }

    fn read<V: FromStr>(&mut self, path: &str) -> Result<V> {
        let value = self.query(&ReadProperty { path })?;
        value.parse().map_err(|_| Error::Parse {
            what: path.to_string(),
            value,
        })
    }

    fn write<V: fmt::Display>(&mut self, path: &str, value: V) -> Result {
        let cmd = WriteProperty {
            path,
            value: value.to_string(),
        };
        self.write_command(&cmd)
    }

    fn write_command<C: Command>(&mut self, cmd: &C) -> Result {
        let line = encode_command(cmd, self.checksum);
        self.transport.send_line(&line)
    }

    fn query<C: Command>(&mut self, cmd: &C) -> Result<C::Response> {
        debug_assert!(cmd.expects_response());
        self.write_command(cmd)?;
        let line = self.transport.recv_line()?;
        decode_response(cmd, &line)
    }
}

/// Serial number the way the vendor tools print it.
pub fn format_serial(serial_number: u64) -> String {
    format!("{serial_number:012X}")
}
