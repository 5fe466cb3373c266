//! Control-descriptor channel over the kernel cros_ec character device
//!
//! One open descriptor carries both directions of the protocol: host
//! commands go through an ioctl transaction, hardware events arrive by
//! making the descriptor readable.

use std::io;
use std::os::fd::{AsRawFd, OwnedFd};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::unix::AsyncFd;
use tracing::{debug, info, trace, warn};

use fpmcu_core::{ControlChannel, EcResult, Error, Reply, Request, Result, MAX_PACKET_SIZE};

/// Well-known control descriptor path of the fingerprint MCU.
pub const CROS_FP_PATH: &str = "/dev/cros_fp";

/// Device node protocol version the kernel driver reports on first read.
const DEV_VERSION: &str = "1.0.0";

/// Event type tag for fingerprint events in the next-event payload.
const EVENT_TYPE_FINGERPRINT: u8 = 5;

// ioctl numbers of the cros_ec character device: _IOWR(0xEC, 0, xcmd)
// for command transactions, _IO(0xEC, 2) for the event mask.
const IOC_WRITE: libc::c_ulong = 1;
const IOC_READ: libc::c_ulong = 2;

const fn ioc(dir: libc::c_ulong, ty: libc::c_ulong, nr: libc::c_ulong, size: libc::c_ulong) -> libc::c_ulong {
    (dir << 30) | (size << 16) | (ty << 8) | nr
}

const IOC_XCMD: libc::c_ulong = ioc(
    IOC_READ | IOC_WRITE,
    0xEC,
    0,
    std::mem::size_of::<RawTransaction>() as libc::c_ulong,
);
const IOC_EVENT_MASK: libc::c_ulong = ioc(0, 0xEC, 2, 0);

/// In-kernel layout of one command transaction.
#[repr(C)]
struct RawTransaction {
    version: u32,
    command: u32,
    outsize: u32,
    insize: u32,
    result: u32,
    data: [u8; MAX_PACKET_SIZE],
}

/// Control channel backed by the `/dev` descriptor.
///
/// Commands run synchronously inside the owning task; they are
/// individually short, bounded by the kernel ioctl timeout. Events are
/// awaited through readiness on the same descriptor.
pub struct DevChannel {
    path: PathBuf,
    fd: AsyncFd<OwnedFd>,
}

impl DevChannel {
    /// Open the well-known fingerprint MCU descriptor.
    pub fn open_default() -> Result<Self> {
        Self::open(CROS_FP_PATH)
    }

    /// Open a control descriptor, verify the device-node protocol
    /// version and subscribe to fingerprint events.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(&path)?;
        let fd: OwnedFd = file.into();

        Self::check_dev_version(&fd, &path)?;

        // Ask the kernel to only surface fingerprint events on read.
        let mask: libc::c_ulong = 1 << EVENT_TYPE_FINGERPRINT;
        let rc = unsafe { libc::ioctl(fd.as_raw_fd(), IOC_EVENT_MASK, mask) };
        if rc < 0 {
            return Err(Error::Io(io::Error::last_os_error()));
        }

        info!(path = %path.display(), "opened fingerprint control descriptor");
        Ok(Self {
            path,
            fd: AsyncFd::new(fd).map_err(Error::Io)?,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// First read on a fresh descriptor returns the device-node version
    /// string. It is known to hit a spurious timeout while the MCU
    /// serves its first request, so the read gets a second attempt.
    fn check_dev_version(fd: &OwnedFd, path: &Path) -> Result<()> {
        let mut buf = [0u8; 80];
        let mut read = 0usize;
        for attempt in 1..=fpmcu_core::MAX_IO_ATTEMPTS {
            let n = unsafe {
                libc::read(fd.as_raw_fd(), buf.as_mut_ptr() as *mut libc::c_void, buf.len() - 1)
            };
            if n > 0 {
                if attempt > 1 {
                    info!(attempt, "device version read succeeded after retry");
                }
                read = n as usize;
                break;
            }
            let err = io::Error::last_os_error();
            warn!(path = %path.display(), attempt, %err, "failed to read device version");
            if err.raw_os_error() != Some(libc::ETIMEDOUT) {
                return Err(Error::Io(err));
            }
        }
        if read == 0 {
            return Err(Error::Timeout);
        }

        let version = String::from_utf8_lossy(&buf[..read]);
        let version = version.split('\n').next().unwrap_or_default();
        debug!(version, "device node version");
        if version != DEV_VERSION {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unsupported device node version: {version}"),
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl ControlChannel for DevChannel {
    async fn transact(&mut self, request: &Request) -> Result<Reply> {
        if request.payload.len() > MAX_PACKET_SIZE {
            return Err(Error::PayloadTooLarge {
                size: request.payload.len(),
                max: MAX_PACKET_SIZE,
            });
        }

        let mut raw = RawTransaction {
            version: request.version as u32,
            command: u16::from(request.opcode) as u32,
            outsize: request.payload.len() as u32,
            insize: request.response_len as u32,
            result: EcResult::UNSET_RAW as u32,
            data: [0; MAX_PACKET_SIZE],
        };
        raw.data[..request.payload.len()].copy_from_slice(&request.payload);

        trace!(opcode = %request.opcode, outsize = raw.outsize, insize = raw.insize, "ioctl transaction");

        let rc = unsafe { libc::ioctl(self.fd.as_raw_fd(), IOC_XCMD, &mut raw) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::ETIMEDOUT) {
                return Err(Error::Timeout);
            }
            return Err(Error::Io(err));
        }

        let transferred = (rc as usize).min(MAX_PACKET_SIZE);
        Ok(Reply {
            result: EcResult::from_raw(raw.result as u16),
            payload: Bytes::copy_from_slice(&raw.data[..transferred]),
        })
    }

    async fn next_event(&mut self) -> Result<u32> {
        // Event payload: one type byte followed by the 32-bit fingerprint
        // event word. Other event types are discarded.
        loop {
            let mut guard = self.fd.readable().await.map_err(Error::Io)?;
            let read = guard.try_io(|fd| {
                let mut buf = [0u8; 16];
                let n = unsafe {
                    libc::read(fd.as_raw_fd(), buf.as_mut_ptr() as *mut libc::c_void, buf.len())
                };
                if n < 0 {
                    Err(io::Error::last_os_error())
                } else {
                    Ok((buf, n as usize))
                }
            });

            match read {
                Ok(Ok((buf, n))) => {
                    if n < 5 || buf[0] != EVENT_TYPE_FINGERPRINT {
                        trace!(len = n, "discarding non-fingerprint event");
                        continue;
                    }
                    let word = u32::from_le_bytes([buf[1], buf[2], buf[3], buf[4]]);
                    return Ok(word);
                }
                Ok(Err(err)) => return Err(Error::Io(err)),
                Err(_would_block) => continue,
            }
        }
    }
}

impl std::fmt::Debug for DevChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DevChannel")
            .field("path", &self.path)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_missing_device() {
        let result = DevChannel::open("/nonexistent/cros_fp");
        assert!(result.is_err());
    }

    #[test]
    fn test_ioc_encoding_stable() {
        // The transaction ioctl must stay _IOWR(0xEC, 0, sizeof(xcmd)).
        let size = std::mem::size_of::<RawTransaction>() as libc::c_ulong;
        assert_eq!(IOC_XCMD, (3 << 30) | (size << 16) | (0xEC << 8));
    }
}
