//! Byte transport underneath the AT protocol.
//!
//! [`Transport`] is the only thing the correlator and dispatcher know about the
//! wire: write bytes, ask whether a byte is waiting, read one byte. There is no
//! line framing and no blocking read. [`SerialTransport`] implements it over a
//! tty opened raw 8N1 with `O_NONBLOCK`, so polling never stalls the caller.

use std::collections::VecDeque;
use std::io::Write;
use std::os::fd::BorrowedFd;
use std::os::unix::io::RawFd;
use std::time::Duration;

use nix::fcntl::{self, OFlag};
use nix::sys::stat::Mode;
use nix::sys::termios::{self, BaudRate, SetArg, SpecialCharacterIndices};
use nix::unistd;
use tracing::{debug, info, warn};

/// Read-ahead chunk size (AT traffic is small).
const READ_BUF_SIZE: usize = 256;

/// Back-off while the kernel output queue is full.
const WRITE_RETRY_DELAY: Duration = Duration::from_millis(1);

/// Duplex byte channel to the modem.
pub trait Transport {
    /// Write all of `bytes`.
    fn write(&mut self, bytes: &[u8]) -> Result<(), String>;

    /// Whether at least one byte can be read without blocking.
    fn byte_available(&mut self) -> bool;

    /// Read one byte, or `None` when nothing is waiting. Never blocks.
    fn read_byte(&mut self) -> Option<u8>;

    /// `Err` once the channel has failed for good (device unplugged, fd
    /// invalidated). A failed transport reads nothing.
    fn health(&self) -> Result<(), String> {
        Ok(())
    }
}

/// Helper to get a `BorrowedFd` from a `RawFd` for nix termios calls.
///
/// # Safety
/// The caller must ensure `fd` is a valid open file descriptor.
unsafe fn borrow_fd(fd: RawFd) -> BorrowedFd<'static> {
    BorrowedFd::borrow_raw(fd)
}

/// A serial tty in raw mode.
///
/// Reads are non-blocking; bytes pulled from the fd by [`Transport::byte_available`]
/// are kept in a small read-ahead queue until [`Transport::read_byte`] takes them.
pub struct SerialTransport {
    fd: RawFd,
    device: String,
    pending: VecDeque<u8>,
    /// First hard read/write error; sticky.
    failure: Option<String>,
}

impl SerialTransport {
    /// Open a serial device path (e.g. `/dev/ttyUSB2`) at `baud`, raw 8N1.
    ///
    /// Returns `Err` if the device cannot be opened, the baud rate is not
    /// supported, or termios configuration fails.
    pub fn open(device: &str, baud: u32) -> Result<Self, String> {
        let speed = baud_rate(baud)?;

        let fd = fcntl::open(
            device,
            OFlag::O_RDWR | OFlag::O_NOCTTY | OFlag::O_NONBLOCK,
            Mode::empty(),
        )
        .map_err(|e| format!("open {device}: {e}"))?;

        if let Err(e) = configure_termios(fd, speed) {
            let _ = unistd::close(fd);
            return Err(format!("{device}: {e}"));
        }

        // SAFETY: fd is valid, we just opened it
        unsafe {
            termios::tcflush(borrow_fd(fd), termios::FlushArg::TCIOFLUSH)
                .map_err(|e| format!("tcflush {device}: {e}"))?;
        }

        info!("Serial {device}: opened ({baud} 8N1, non-blocking)");

        Ok(Self {
            fd,
            device: device.to_string(),
            pending: VecDeque::with_capacity(READ_BUF_SIZE),
            failure: None,
        })
    }

    /// Pull whatever the kernel has buffered into the read-ahead queue.
    fn fill(&mut self) {
        if self.failure.is_some() {
            return;
        }
        let mut buf = [0u8; READ_BUF_SIZE];
        match unistd::read(self.fd, &mut buf) {
            Ok(n) => self.pending.extend(&buf[..n]),
            Err(nix::errno::Errno::EAGAIN | nix::errno::Errno::EINTR) => {}
            Err(e) => self.fail(format!("read {}: {e}", self.device)),
        }
    }

    fn fail(&mut self, reason: String) {
        if self.failure.is_none() {
            warn!("Serial port failed: {reason}");
            self.failure = Some(reason);
        }
    }
}

impl Transport for SerialTransport {
    fn write(&mut self, bytes: &[u8]) -> Result<(), String> {
        if let Some(reason) = &self.failure {
            return Err(reason.clone());
        }
        // SAFETY: fd is valid for the lifetime of self
        let bfd = unsafe { borrow_fd(self.fd) };
        let mut remaining = bytes;
        while !remaining.is_empty() {
            match unistd::write(bfd, remaining) {
                Ok(n) => remaining = &remaining[n..],
                Err(nix::errno::Errno::EAGAIN | nix::errno::Errno::EINTR) => {
                    std::thread::sleep(WRITE_RETRY_DELAY);
                }
                Err(e) => {
                    let reason = format!("write {}: {e}", self.device);
                    self.fail(reason.clone());
                    return Err(reason);
                }
            }
        }
        Ok(())
    }

    fn byte_available(&mut self) -> bool {
        if self.pending.is_empty() {
            self.fill();
        }
        !self.pending.is_empty()
    }

    fn read_byte(&mut self) -> Option<u8> {
        if self.pending.is_empty() {
            self.fill();
        }
        self.pending.pop_front()
    }

    fn health(&self) -> Result<(), String> {
        match &self.failure {
            Some(reason) => Err(reason.clone()),
            None => Ok(()),
        }
    }
}

impl Drop for SerialTransport {
    fn drop(&mut self) {
        debug!("Serial {}: closing", self.device);
        let _ = unistd::close(self.fd);
    }
}

fn baud_rate(baud: u32) -> Result<BaudRate, String> {
    Ok(match baud {
        9600 => BaudRate::B9600,
        19200 => BaudRate::B19200,
        38400 => BaudRate::B38400,
        57600 => BaudRate::B57600,
        115_200 => BaudRate::B115200,
        230_400 => BaudRate::B230400,
        460_800 => BaudRate::B460800,
        921_600 => BaudRate::B921600,
        other => return Err(format!("unsupported baud rate {other}")),
    })
}

/// Configure termios: raw mode, given baud, 8N1, no flow control.
/// VMIN=0, VTIME=0 → reads return immediately.
fn configure_termios(fd: RawFd, speed: BaudRate) -> Result<(), String> {
    // SAFETY: fd is valid, caller just opened it
    let borrowed = unsafe { borrow_fd(fd) };

    let mut tio = termios::tcgetattr(borrowed).map_err(|e| format!("tcgetattr: {e}"))?;

    termios::cfmakeraw(&mut tio);

    termios::cfsetispeed(&mut tio, speed).map_err(|e| format!("cfsetispeed: {e}"))?;
    termios::cfsetospeed(&mut tio, speed).map_err(|e| format!("cfsetospeed: {e}"))?;

    tio.control_flags |= termios::ControlFlags::CLOCAL | termios::ControlFlags::CREAD;
    tio.control_flags &= !termios::ControlFlags::CRTSCTS;

    tio.control_chars[SpecialCharacterIndices::VMIN as usize] = 0;
    tio.control_chars[SpecialCharacterIndices::VTIME as usize] = 0;

    termios::tcsetattr(borrowed, SetArg::TCSANOW, &tio).map_err(|e| format!("tcsetattr: {e}"))?;

    Ok(())
}

/// Secondary output that mirrors every received byte.
///
/// Purely for observability; write errors are ignored.
#[derive(Default)]
pub struct Echo {
    sink: Option<Box<dyn Write + Send>>,
}

impl Echo {
    /// Echo disabled.
    #[must_use]
    pub fn none() -> Self {
        Self::default()
    }

    /// Mirror received bytes to stderr.
    #[must_use]
    pub fn stderr() -> Self {
        Self::to(std::io::stderr())
    }

    /// Mirror received bytes to an arbitrary writer.
    pub fn to(sink: impl Write + Send + 'static) -> Self {
        Self {
            sink: Some(Box::new(sink)),
        }
    }

    /// Forward one received byte.
    pub fn byte(&mut self, b: u8) {
        if let Some(sink) = self.sink.as_mut() {
            let _ = sink.write_all(&[b]);
            if b == b'\n' {
                let _ = sink.flush();
            }
        }
    }
}

#[cfg(test)]
pub(crate) use mock::{MockTransport, SharedBuf};

#[cfg(test)]
mod mock {
    use std::collections::VecDeque;
    use std::io::Write;
    use std::sync::{Arc, Mutex};

    use super::Transport;

    /// Cloneable in-memory writer for capturing echo output.
    #[derive(Clone, Default)]
    pub(crate) struct SharedBuf(pub Arc<Mutex<Vec<u8>>>);

    impl SharedBuf {
        pub fn contents(&self) -> String {
            String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
        }
    }

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    /// In-memory transport: bytes queued with [`MockTransport::feed`] are read
    /// back, writes are recorded, and a scripted reply is queued the first time
    /// a write contains its trigger.
    #[derive(Default)]
    pub(crate) struct MockTransport {
        pub rx: VecDeque<u8>,
        pub written: Vec<u8>,
        script: Vec<(String, String)>,
        pub fail_writes: bool,
        pub failure: Option<String>,
    }

    impl MockTransport {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn feed(&mut self, data: &str) {
            self.rx.extend(data.as_bytes());
        }

        pub fn reply_to(&mut self, trigger: &str, reply: &str) {
            self.script.push((trigger.to_string(), reply.to_string()));
        }

        pub fn written_str(&self) -> String {
            String::from_utf8_lossy(&self.written).into_owned()
        }
    }

    impl Transport for MockTransport {
        fn write(&mut self, bytes: &[u8]) -> Result<(), String> {
            if self.fail_writes {
                return Err("mock write failure".into());
            }
            self.written.extend_from_slice(bytes);
            let chunk = String::from_utf8_lossy(bytes);
            if let Some(pos) = self
                .script
                .iter()
                .position(|(trigger, _)| chunk.contains(trigger.as_str()))
            {
                let (_, reply) = self.script.remove(pos);
                self.rx.extend(reply.as_bytes());
            }
            Ok(())
        }

        fn byte_available(&mut self) -> bool {
            !self.rx.is_empty()
        }

        fn read_byte(&mut self) -> Option<u8> {
            self.rx.pop_front()
        }

        fn health(&self) -> Result<(), String> {
            self.failure.clone().map_or(Ok(()), Err)
        }
    }
}
