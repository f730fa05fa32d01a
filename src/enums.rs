use bitflags::Flags;
use std::fmt;

use crate::{Error, Result};

/// Axis state machine of the firmware. The program only ever requests [`AxisState::Idle`],
/// [`AxisState::FullCalibrationSequence`] and [`AxisState::ClosedLoopControl`], the rest show up
/// while reading back `current_state`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AxisState {
    Undefined,
    Idle,
    StartupSequence,
    FullCalibrationSequence,
    MotorCalibration,
    EncoderIndexSearch,
    EncoderOffsetCalibration,
    ClosedLoopControl,
    LockinSpin,
    EncoderDirFind,
    Homing,
    EncoderHallPolarityCalibration,
    EncoderHallPhaseCalibration,
    AnticoggingCalibration,
}

impl AxisState {
    pub fn code(&self) -> u8 {
        match self {
            AxisState::Undefined => 0,
            AxisState::Idle => 1,
            AxisState::StartupSequence => 2,
            AxisState::FullCalibrationSequence => 3,
            AxisState::MotorCalibration => 4,
            AxisState::EncoderIndexSearch => 6,
            AxisState::EncoderOffsetCalibration => 7,
            AxisState::ClosedLoopControl => 8,
            AxisState::LockinSpin => 9,
            AxisState::EncoderDirFind => 10,
            AxisState::Homing => 11,
            AxisState::EncoderHallPolarityCalibration => 12,
            AxisState::EncoderHallPhaseCalibration => 13,
            AxisState::AnticoggingCalibration => 14,
        }
    }

    pub fn from_code(code: u8) -> Result<AxisState> {
        Ok(match code {
            0 => AxisState::Undefined,
            1 => AxisState::Idle,
            2 => AxisState::StartupSequence,
            3 => AxisState::FullCalibrationSequence,
            4 => AxisState::MotorCalibration,
            6 => AxisState::EncoderIndexSearch,
            7 => AxisState::EncoderOffsetCalibration,
            8 => AxisState::ClosedLoopControl,
            9 => AxisState::LockinSpin,
            10 => AxisState::EncoderDirFind,
            11 => AxisState::Homing,
            12 => AxisState::EncoderHallPolarityCalibration,
            13 => AxisState::EncoderHallPhaseCalibration,
            14 => AxisState::AnticoggingCalibration,
            code => {
                return Err(Error::UnknownEnum {
                    kind: "AxisState",
                    code: code.into(),
                })
            }
        })
    }

    /// True for every state the firmware passes through while a calibration sequence runs.
    pub fn is_calibrating(&self) -> bool {
        matches!(
            self,
            AxisState::FullCalibrationSequence
                | AxisState::MotorCalibration
                | AxisState::EncoderIndexSearch
                | AxisState::EncoderOffsetCalibration
                | AxisState::EncoderDirFind
                | AxisState::EncoderHallPolarityCalibration
                | AxisState::EncoderHallPhaseCalibration
                | AxisState::AnticoggingCalibration
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ControlMode {
    Voltage,
    Torque,
    Velocity,
    Position,
}

impl ControlMode {
    pub fn code(&self) -> u8 {
        match self {
            ControlMode::Voltage => 0,
            ControlMode::Torque => 1,
            ControlMode::Velocity => 2,
            ControlMode::Position => 3,
        }
    }

    pub fn from_code(code: u8) -> Result<ControlMode> {
        Ok(match code {
            0 => ControlMode::Voltage,
            1 => ControlMode::Torque,
            2 => ControlMode::Velocity,
            3 => ControlMode::Position,
            code => {
                return Err(Error::UnknownEnum {
                    kind: "ControlMode",
                    code: code.into(),
                })
            }
        })
    }
}

/// How the controller treats incoming setpoints. [`InputMode::Passthrough`] applies
/// `input_vel` directly, without ramping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InputMode {
    Inactive,
    Passthrough,
    VelRamp,
    PosFilter,
    MixChannels,
    TrapTraj,
    TorqueRamp,
    Mirror,
    Tuning,
}

impl InputMode {
    pub fn code(&self) -> u8 {
        match self {
            InputMode::Inactive => 0,
            InputMode::Passthrough => 1,
            InputMode::VelRamp => 2,
            InputMode::PosFilter => 3,
            InputMode::MixChannels => 4,
            InputMode::TrapTraj => 5,
            InputMode::TorqueRamp => 6,
            InputMode::Mirror => 7,
            InputMode::Tuning => 8,
        }
    }

    pub fn from_code(code: u8) -> Result<InputMode> {
        Ok(match code {
            0 => InputMode::Inactive,
            1 => InputMode::Passthrough,
            2 => InputMode::VelRamp,
            3 => InputMode::PosFilter,
            4 => InputMode::MixChannels,
            5 => InputMode::TrapTraj,
            6 => InputMode::TorqueRamp,
            7 => InputMode::Mirror,
            8 => InputMode::Tuning,
            code => {
                return Err(Error::UnknownEnum {
                    kind: "InputMode",
                    code: code.into(),
                })
            }
        })
    }
}

/// Outcome of the last procedure (calibration, state change) the axis ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProcedureResult {
    Success,
    Busy,
    Cancelled,
    Disarmed,
    NoResponse,
    PolePairCprMismatch,
    PhaseResistanceOutOfRange,
    PhaseInductanceOutOfRange,
    UnbalancedPhases,
    InvalidMotorType,
    IllegalHallState,
    Timeout,
    HomingWithoutEndstop,
    InvalidState,
    NotCalibrated,
    NotConverging,
}

impl ProcedureResult {
    const ALL: [ProcedureResult; 16] = [
        ProcedureResult::Success,
        ProcedureResult::Busy,
        ProcedureResult::Cancelled,
        ProcedureResult::Disarmed,
        ProcedureResult::NoResponse,
        ProcedureResult::PolePairCprMismatch,
        ProcedureResult::PhaseResistanceOutOfRange,
        ProcedureResult::PhaseInductanceOutOfRange,
        ProcedureResult::UnbalancedPhases,
        ProcedureResult::InvalidMotorType,
        ProcedureResult::IllegalHallState,
        ProcedureResult::Timeout,
        ProcedureResult::HomingWithoutEndstop,
        ProcedureResult::InvalidState,
        ProcedureResult::NotCalibrated,
        ProcedureResult::NotConverging,
    ];

    pub fn code(&self) -> u8 {
        *self as u8
    }

    pub fn from_code(code: u8) -> Result<ProcedureResult> {
        Self::ALL
            .get(usize::from(code))
            .copied()
            .ok_or(Error::UnknownEnum {
                kind: "ProcedureResult",
                code: code.into(),
            })
    }

    pub fn is_success(&self) -> bool {
        *self == ProcedureResult::Success
    }
}

impl fmt::Display for ProcedureResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProcedureResult::Success => "SUCCESS",
            ProcedureResult::Busy => "BUSY",
            ProcedureResult::Cancelled => "CANCELLED",
            ProcedureResult::Disarmed => "DISARMED",
            ProcedureResult::NoResponse => "NO_RESPONSE",
            ProcedureResult::PolePairCprMismatch => "POLE_PAIR_CPR_MISMATCH",
            ProcedureResult::PhaseResistanceOutOfRange => "PHASE_RESISTANCE_OUT_OF_RANGE",
            ProcedureResult::PhaseInductanceOutOfRange => "PHASE_INDUCTANCE_OUT_OF_RANGE",
            ProcedureResult::UnbalancedPhases => "UNBALANCED_PHASES",
            ProcedureResult::InvalidMotorType => "INVALID_MOTOR_TYPE",
            ProcedureResult::IllegalHallState => "ILLEGAL_HALL_STATE",
            ProcedureResult::Timeout => "TIMEOUT",
            ProcedureResult::HomingWithoutEndstop => "HOMING_WITHOUT_ENDSTOP",
            ProcedureResult::InvalidState => "INVALID_STATE",
            ProcedureResult::NotCalibrated => "NOT_CALIBRATED",
            ProcedureResult::NotConverging => "NOT_CONVERGING",
        };
        f.write_str(name)
    }
}

bitflags::bitflags! {
    /// Fault word reported in `axis.active_errors` and `axis.disarm_reason`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ODriveError: u32 {
        const INITIALIZING = 0x0000_0001;
        const SYSTEM_LEVEL = 0x0000_0002;
        const TIMING_ERROR = 0x0000_0004;
        const MISSING_ESTIMATE = 0x0000_0008;
        const BAD_CONFIG = 0x0000_0010;
        const DRV_FAULT = 0x0000_0020;
        const MISSING_INPUT = 0x0000_0040;
        const DC_BUS_OVER_VOLTAGE = 0x0000_0100;
        const DC_BUS_UNDER_VOLTAGE = 0x0000_0200;
        const DC_BUS_OVER_CURRENT = 0x0000_0400;
        const DC_BUS_OVER_REGEN_CURRENT = 0x0000_0800;
        const CURRENT_LIMIT_VIOLATION = 0x0000_1000;
        const MOTOR_OVER_TEMP = 0x0000_2000;
        const INVERTER_OVER_TEMP = 0x0000_4000;
        const VELOCITY_LIMIT_VIOLATION = 0x0000_8000;
        const POSITION_LIMIT_VIOLATION = 0x0001_0000;
        const WATCHDOG_TIMER_EXPIRED = 0x0100_0000;
        const ESTOP_REQUESTED = 0x0200_0000;
        const SPINOUT_DETECTED = 0x0400_0000;
        const BRAKE_RESISTOR_DISARMED = 0x0800_0000;
        const THERMISTOR_DISCONNECTED = 0x1000_0000;
        const CALIBRATION_ERROR = 0x4000_0000;

        // Newer firmware may set bits this table doesn't know about.
        const _ = !0;
    }
}

impl fmt::Display for ODriveError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("none");
        }
        let mut first = true;
        for (name, _) in self.iter_names() {
            if !first {
                f.write_str(" | ")?;
            }
            f.write_str(name)?;
            first = false;
        }
        let unnamed = self.bits() & !ODriveError::all_named().bits();
        if unnamed != 0 {
            if !first {
                f.write_str(" | ")?;
            }
            write!(f, "UNKNOWN(0x{unnamed:08X})")?;
        }
        Ok(())
    }
}

impl ODriveError {
    fn all_named() -> ODriveError {
        ODriveError::FLAGS
            .iter()
            .filter(|flag| flag.is_named())
            .fold(ODriveError::empty(), |acc, flag| acc | *flag.value())
    }
}
