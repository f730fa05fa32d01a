use crate::{Error, Result};

/// A single request of the line-based ASCII protocol the board speaks on its USB serial port.
pub trait Command {
    type Response;

    /// Request text, without checksum or line terminator.
    fn encode(&self) -> String;

    /// Parses the response line, already stripped of its checksum.
    fn decode(&self, line: &str) -> Result<Self::Response>;

    /// Writes and motion commands are fire-and-forget; the board sends nothing back.
    fn expects_response(&self) -> bool {
        true
    }
}

macro_rules! no_response {
    () => {
        fn decode(&self, _line: &str) -> Result<()> {
            Ok(())
        }

        fn expects_response(&self) -> bool {
            false
        }
    };
}

/// `r <path>`: reads one property, e.g. `axis0.current_state`.
pub struct ReadProperty<'a> {
    pub path: &'a str,
}
impl Command for ReadProperty<'_> {
    type Response = String;

    fn encode(&self) -> String {
        format!("r {}", self.path)
    }

    fn decode(&self, line: &str) -> Result<String> {
        Ok(line.trim().to_string())
    }
}

/// `w <path> <value>`
pub struct WriteProperty<'a> {
    pub path: &'a str,
    pub value: String,
}
impl Command for WriteProperty<'_> {
    type Response = ();

    fn encode(&self) -> String {
        format!("w {} {}", self.path, self.value)
    }

    no_response!();
}

/// `sc`: clears all latched errors on the board.
pub struct ClearErrors;
impl Command for ClearErrors {
    type Response = ();

    fn encode(&self) -> String {
        "sc".to_string()
    }

    no_response!();
}

/// `v <axis> <velocity> <torque_ff>`: velocity setpoint in turns/s, feed-forward in Nm.
pub struct SetVelocity {
    pub axis: u8,
    pub velocity: f32,
    pub torque_ff: f32,
}
impl Command for SetVelocity {
    type Response = ();

    fn encode(&self) -> String {
        format!("v {} {:.4} {:.4}", self.axis, self.velocity, self.torque_ff)
    }

    no_response!();
}

/// `f <axis>`: estimated position (turns) and velocity (turns/s).
pub struct Feedback {
    pub axis: u8,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FeedbackResponse {
    pub position: f32,
    pub velocity: f32,
}

impl Command for Feedback {
    type Response = FeedbackResponse;

    fn encode(&self) -> String {
        format!("f {}", self.axis)
    }

    fn decode(&self, line: &str) -> Result<FeedbackResponse> {
        let mut parts = line.split_whitespace();
        let mut next = || -> Result<f32> {
            parts
                .next()
                .and_then(|part| part.parse().ok())
                .ok_or_else(|| Error::Parse {
                    what: "feedback".to_string(),
                    value: line.to_string(),
                })
        };
        let position = next()?;
        let velocity = next()?;
        Ok(FeedbackResponse { position, velocity })
    }
}

/// XOR of every byte, which is what the firmware appends after `*`.
pub fn checksum(data: &[u8]) -> u8 {
    data.iter().fold(0, |acc, b| acc ^ b)
}

pub fn encode_command<C: Command>(cmd: &C, with_checksum: bool) -> String {
    let text = cmd.encode();
    if with_checksum {
        let cs = checksum(text.as_bytes());
        format!("{text}*{cs}")
    } else {
        text
    }
}

/// Replies the firmware sends instead of a value when it rejects a request.
const DEVICE_ERRORS: [&str; 4] = [
    "invalid property",
    "invalid command format",
    "unknown command",
    "invalid motor",
];

pub fn decode_response<C: Command>(cmd: &C, line: &str) -> Result<C::Response> {
    let body = match line.rsplit_once('*') {
        Some((body, cs)) => {
            let actual: u8 = cs.trim().parse().map_err(|_| Error::Parse {
                what: "checksum".to_string(),
                value: line.to_string(),
            })?;
            let expected = checksum(body.as_bytes());
            if expected != actual {
                return Err(Error::Checksum { expected, actual });
            }
            body
        }
        None => line,
    };
    let body = body.trim();
    if DEVICE_ERRORS.contains(&body) {
        return Err(Error::Device(body.to_string()));
    }
    cmd.decode(body)
}
