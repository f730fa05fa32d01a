use crate::{Error, Result};
use serialport::{ClearBuffer, SerialPort, SerialPortInfo, SerialPortType};
use std::io::{BufRead, BufReader, ErrorKind, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// USB vendor id the board enumerates with.
pub const ODRIVE_USB_VID: u16 = 0x1209;
/// USB product id of the board's CDC interface.
pub const ODRIVE_USB_PID: u16 = 0x0D32;

/// Line-oriented link to a board. Implemented by [`SerialTransport`] for real hardware and by
/// [`crate::sim::SimulatedODrive`] for tests and dry runs.
pub trait Transport {
    fn send_line(&mut self, line: &str) -> Result;
    fn recv_line(&mut self) -> Result<String>;
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn send_line(&mut self, line: &str) -> Result {
        (**self).send_line(line)
    }

    fn recv_line(&mut self) -> Result<String> {
        (**self).recv_line()
    }
}

/// Byte source whose not-yet-read input can be thrown away.
trait InputPort: Read {
    fn discard_input(&mut self) -> Result;
}

impl InputPort for Box<dyn SerialPort> {
    fn discard_input(&mut self) -> Result {
        self.clear(ClearBuffer::Input)?;
        Ok(())
    }
}

/// Reads one reply line. On timeout every byte already received is discarded, so a reply that
/// arrives late can't be taken for the answer to the next request.
fn read_reply<P: InputPort>(reader: &mut BufReader<P>) -> Result<String> {
    let mut line = String::new();
    let timed_out = match reader.read_line(&mut line) {
        Ok(0) => true,
        Ok(_) => !line.ends_with('\n'),
        Err(err) if err.kind() == ErrorKind::TimedOut => true,
        Err(err) => return Err(err.into()),
    };
    if timed_out {
        let buffered = reader.buffer().len();
        reader.consume(buffered);
        reader.get_mut().discard_input()?;
        return Err(Error::Timeout);
    }
    Ok(line.trim_end_matches(['\r', '\n']).to_string())
}

pub struct SerialTransport {
    name: String,
    port: BufReader<Box<dyn SerialPort>>,
}

impl SerialTransport {
    pub fn open(path: &str, baud_rate: u32, timeout: Duration) -> Result<SerialTransport> {
        let port = serialport::new(path, baud_rate).timeout(timeout).open()?;
        // Drop anything a previous session left unread.
        port.clear(ClearBuffer::All)?;
        log::debug!("opened {path} at {baud_rate} baud");
        Ok(SerialTransport {
            name: path.to_string(),
            port: BufReader::new(port),
        })
    }
}

impl Transport for SerialTransport {
    fn send_line(&mut self, line: &str) -> Result {
        log::trace!("{} <- {line}", self.name);
        let port = self.port.get_mut();
        port.write_all(line.as_bytes())?;
        port.write_all(b"\n")?;
        port.flush()?;
        Ok(())
    }

    fn recv_line(&mut self) -> Result<String> {
        let line = read_reply(&mut self.port)?;
        log::trace!("{} -> {line}", self.name);
        Ok(line)
    }
}

fn is_odrive_usb(vid: u16, pid: u16) -> bool {
    vid == ODRIVE_USB_VID && pid == ODRIVE_USB_PID
}

fn is_odrive(info: &SerialPortInfo) -> bool {
    matches!(&info.port_type, SerialPortType::UsbPort(usb) if is_odrive_usb(usb.vid, usb.pid))
}

/// Serial ports that belong to a connected board.
pub fn ports() -> Result<Vec<SerialPortInfo>> {
    let ports = serialport::available_ports()?;
    Ok(ports.into_iter().filter(is_odrive).collect())
}

/// Options for [`find_any`].
#[derive(Debug, Clone)]
pub struct Discovery {
    pub baud_rate: u32,
    pub timeout: Duration,
    pub poll_interval: Duration,
    /// `None` blocks until a board shows up or a stop is requested.
    pub deadline: Option<Duration>,
}

impl Default for Discovery {
    fn default() -> Self {
        Discovery {
            baud_rate: 115_200,
            timeout: Duration::from_millis(500),
            poll_interval: Duration::from_millis(500),
            deadline: None,
        }
    }
}

/// Calls `scan` every poll interval until it names a port, the deadline passes or `stop` is set.
fn wait_for_port<S>(discovery: &Discovery, stop: &AtomicBool, mut scan: S) -> Result<String>
where
    S: FnMut() -> Result<Option<String>>,
{
    let start = Instant::now();
    loop {
        if stop.load(Ordering::SeqCst) {
            return Err(Error::Interrupted);
        }
        if let Some(port) = scan()? {
            return Ok(port);
        }
        if let Some(deadline) = discovery.deadline {
            if start.elapsed() >= deadline {
                return Err(Error::NotFound);
            }
        }
        std::thread::sleep(discovery.poll_interval);
    }
}

/// Opens the first board found on the USB bus, polling until one is plugged in or `stop` is set.
pub fn find_any(discovery: &Discovery, stop: &AtomicBool) -> Result<SerialTransport> {
    let port = wait_for_port(discovery, stop, || {
        Ok(ports()?.into_iter().next().map(|info| info.port_name))
    })?;
    log::info!("found board on {port}");
    SerialTransport::open(&port, discovery.baud_rate, discovery.timeout)
}

/// Opens `port` when given, otherwise waits for a board with [`find_any`].
pub fn open(
    port: Option<&str>,
    discovery: &Discovery,
    stop: &AtomicBool,
) -> Result<SerialTransport> {
    match port {
        Some(path) => SerialTransport::open(path, discovery.baud_rate, discovery.timeout),
        None => find_any(discovery, stop),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::io;

    #[test]
    fn matches_board_usb_ids_only() {
        assert!(is_odrive_usb(0x1209, 0x0D32));
        assert!(!is_odrive_usb(0x0403, 0x6001));
        assert!(!is_odrive_usb(0x1209, 0x0D33));
        assert!(!is_odrive(&SerialPortInfo {
            port_name: "/dev/ttyS0".to_string(),
            port_type: SerialPortType::Unknown,
        }));
    }

    fn fast_discovery(deadline: Option<Duration>) -> Discovery {
        Discovery {
            poll_interval: Duration::from_millis(1),
            deadline,
            ..Discovery::default()
        }
    }

    #[test]
    fn discovery_returns_first_port_that_shows_up() {
        let stop = AtomicBool::new(false);
        let mut scans = 0;
        let port = wait_for_port(&fast_discovery(None), &stop, || {
            scans += 1;
            Ok((scans == 3).then(|| "/dev/ttyACM0".to_string()))
        })
        .unwrap();
        assert_eq!(port, "/dev/ttyACM0");
        assert_eq!(scans, 3);
    }

    #[test]
    fn discovery_gives_up_after_deadline() {
        let stop = AtomicBool::new(false);
        let err = wait_for_port(
            &fast_discovery(Some(Duration::from_millis(5))),
            &stop,
            || Ok(None),
        )
        .unwrap_err();
        assert!(matches!(err, Error::NotFound));
    }

    #[test]
    fn discovery_without_deadline_stops_on_request() {
        let stop = AtomicBool::new(false);
        let mut scans = 0;
        let err = wait_for_port(&fast_discovery(None), &stop, || {
            scans += 1;
            if scans == 4 {
                stop.store(true, Ordering::SeqCst);
            }
            Ok(None)
        })
        .unwrap_err();
        assert!(matches!(err, Error::Interrupted));
        assert_eq!(scans, 4);
    }

    enum Chunk {
        Data(&'static [u8]),
        TimedOut,
    }

    /// Replays chunks as successive reads; `discard_input` drops whatever is still queued.
    #[derive(Default)]
    struct ScriptedPort {
        chunks: VecDeque<Chunk>,
    }

    impl Read for ScriptedPort {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            match self.chunks.pop_front() {
                Some(Chunk::Data(data)) => {
                    buf[..data.len()].copy_from_slice(data);
                    Ok(data.len())
                }
                Some(Chunk::TimedOut) | None => {
                    Err(io::Error::new(ErrorKind::TimedOut, "timeout"))
                }
            }
        }
    }

    impl InputPort for ScriptedPort {
        fn discard_input(&mut self) -> Result {
            self.chunks.clear();
            Ok(())
        }
    }

    #[test]
    fn reads_reply_lines() {
        let mut reader = BufReader::new(ScriptedPort::default());
        reader.get_mut().chunks.push_back(Chunk::Data(b"8\r\n"));
        assert_eq!(read_reply(&mut reader).unwrap(), "8");
    }

    #[test]
    fn late_reply_is_not_mistaken_for_the_next_one() {
        let mut reader = BufReader::new(ScriptedPort::default());
        reader.get_mut().chunks.extend([
            Chunk::Data(b"24."),
            Chunk::TimedOut,
            Chunk::Data(b"01\n"),
        ]);
        assert!(matches!(read_reply(&mut reader), Err(Error::Timeout)));

        reader.get_mut().chunks.push_back(Chunk::Data(b"8\n"));
        assert_eq!(read_reply(&mut reader).unwrap(), "8");
    }
}
