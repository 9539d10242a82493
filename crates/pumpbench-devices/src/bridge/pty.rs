/*!
 * Virtual serial endpoints backed by a pseudo-terminal pair.
 *
 * The slave side is configured with the endpoint's UART framing and published
 * under a stable path through a symlink; the bridge serves the master side.
 */
use std::fs::File;
use std::os::fd::{AsFd, AsRawFd, OwnedFd};
use std::path::{Path, PathBuf};

use nix::pty::openpty;
use nix::sys::termios::{self, BaudRate, ControlFlags, SetArg};
use tracing::{debug, info, warn};

use pumpbench_core::config::{Parity, UartConfig};

use crate::error::{DeviceError, Result};

/// A pseudo-terminal published at a fixed path
#[derive(Debug)]
pub struct VirtualSerial {
    master: Option<File>,
    // held open so the master never sees a hangup between clients
    slave: Option<OwnedFd>,
    slave_name: PathBuf,
    path: PathBuf,
}

impl VirtualSerial {
    /// Create the pair and publish its slave side at `path`
    ///
    /// Any existing file at `path` is replaced.
    pub fn open<P: AsRef<Path>>(path: P, uart: &UartConfig) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let pty = openpty(None, None)?;
        configure(&pty.slave, uart)?;

        let slave_name = std::fs::read_link(format!("/proc/self/fd/{}", pty.slave.as_raw_fd()))?;
        if path.symlink_metadata().is_ok() {
            std::fs::remove_file(&path)?;
        }
        std::os::unix::fs::symlink(&slave_name, &path)?;
        info!(
            path = %path.display(),
            slave = %slave_name.display(),
            baud_rate = uart.baud_rate,
            "Virtual serial port created"
        );

        Ok(Self {
            master: Some(File::from(pty.master)),
            slave: Some(pty.slave),
            slave_name,
            path,
        })
    }

    /// The published path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The pty device the path points at
    pub fn slave_name(&self) -> &Path {
        &self.slave_name
    }

    /// Take the master side to serve it
    pub fn take_master(&mut self) -> Option<File> {
        self.master.take()
    }

    /// Close both sides and remove the published path
    pub fn close(&mut self) {
        self.master = None;
        self.slave = None;
        if self.path.symlink_metadata().is_ok() {
            match std::fs::remove_file(&self.path) {
                Ok(()) => debug!(path = %self.path.display(), "Virtual serial port removed"),
                Err(e) => warn!(path = %self.path.display(), "Failed to remove virtual serial port: {}", e),
            }
        }
    }
}

impl Drop for VirtualSerial {
    fn drop(&mut self) {
        if self.slave.is_some() {
            self.close();
        }
    }
}

fn configure<F: AsFd>(fd: F, uart: &UartConfig) -> Result<()> {
    let mut attrs = termios::tcgetattr(fd.as_fd())?;
    termios::cfmakeraw(&mut attrs);
    termios::cfsetspeed(&mut attrs, baud_rate(uart.baud_rate)?)?;

    let flags = &mut attrs.control_flags;
    flags.remove(ControlFlags::CSIZE | ControlFlags::PARENB | ControlFlags::PARODD | ControlFlags::CSTOPB);
    flags.insert(match uart.data_bits {
        5 => ControlFlags::CS5,
        6 => ControlFlags::CS6,
        7 => ControlFlags::CS7,
        8 => ControlFlags::CS8,
        other => return Err(DeviceError::validation(format!("Unsupported data bits {}", other))),
    });
    match uart.parity {
        Parity::None => {}
        Parity::Even => flags.insert(ControlFlags::PARENB),
        Parity::Odd => flags.insert(ControlFlags::PARENB | ControlFlags::PARODD),
    }
    if uart.stop_bits == 2 {
        flags.insert(ControlFlags::CSTOPB);
    }
    flags.insert(ControlFlags::CREAD | ControlFlags::CLOCAL);

    termios::tcsetattr(fd.as_fd(), SetArg::TCSANOW, &attrs)?;
    Ok(())
}

fn baud_rate(baud: u32) -> Result<BaudRate> {
    Ok(match baud {
        1200 => BaudRate::B1200,
        2400 => BaudRate::B2400,
        4800 => BaudRate::B4800,
        9600 => BaudRate::B9600,
        19200 => BaudRate::B19200,
        38400 => BaudRate::B38400,
        57600 => BaudRate::B57600,
        115200 => BaudRate::B115200,
        230400 => BaudRate::B230400,
        other => return Err(DeviceError::validation(format!("Unsupported baud rate {}", other))),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_baud_rates() {
        assert!(matches!(baud_rate(57600), Ok(BaudRate::B57600)));
        assert!(baud_rate(12345).is_err());
    }

    #[test]
    fn test_open_publishes_and_close_removes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ttySIM_test");
        std::fs::write(&path, b"stale").unwrap();

        let mut port = VirtualSerial::open(&path, &UartConfig::new(19200, Parity::Even)).unwrap();
        assert_eq!(std::fs::read_link(&path).unwrap(), port.slave_name());
        assert!(port.take_master().is_some());

        port.close();
        assert!(path.symlink_metadata().is_err());
    }
}
