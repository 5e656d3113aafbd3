//! Unix-domain socket transport to the device processes.
//!
//! The PHY listens on one socket; every device connects and greets with its
//! device number as a little-endian `u32`. Once all devices are connected,
//! messages flow with the codec in [`crate::codec`]. Closing the connection
//! tells a device the simulation is over.

use crate::codec::{decode_request, encode_response};
use bytes::BytesMut;
use p2g4_phy::{DeviceLink, LinkError, Request, Response};
use std::io::{Read, Write};
use std::net::Shutdown;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

const READ_CHUNK: usize = 4096;

struct DeviceConn {
    stream: UnixStream,
    rx_buf: BytesMut,
}

/// Listening socket waiting for the devices.
pub struct SocketListener {
    listener: UnixListener,
    path: PathBuf,
}

impl SocketListener {
    /// Bind the PHY socket at `path`, replacing a stale one.
    pub fn bind(path: impl AsRef<Path>) -> Result<Self, LinkError> {
        let path = path.as_ref().to_path_buf();
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        if path.exists() {
            debug!("Removing stale socket {}", path.display());
            std::fs::remove_file(&path)?;
        }
        let listener = UnixListener::bind(&path)?;
        info!("Listening for devices on {}", path.display());
        Ok(Self { listener, path })
    }

    /// Socket path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Block until `n_devs` devices connected and greeted.
    pub fn accept_devices(self, n_devs: usize) -> Result<SocketLink, LinkError> {
        let mut devices: Vec<Option<DeviceConn>> = (0..n_devs).map(|_| None).collect();
        let mut connected = 0;
        while connected < n_devs {
            let (mut stream, _) = self.listener.accept()?;
            let mut greeting = [0u8; 4];
            stream.read_exact(&mut greeting)?;
            let d = u32::from_le_bytes(greeting) as usize;
            if d >= n_devs {
                return Err(LinkError::Malformed {
                    device: d,
                    reason: format!("device number out of range (only {} devices)", n_devs),
                });
            }
            if devices[d].is_some() {
                return Err(LinkError::Malformed {
                    device: d,
                    reason: "device connected twice".to_string(),
                });
            }
            debug!("Device {} connected", d);
            devices[d] = Some(DeviceConn {
                stream,
                rx_buf: BytesMut::with_capacity(READ_CHUNK),
            });
            connected += 1;
        }
        info!("All {} devices connected", n_devs);
        Ok(SocketLink {
            devices,
            path: Some(self.path),
        })
    }
}

/// [`DeviceLink`] over connected Unix sockets.
pub struct SocketLink {
    devices: Vec<Option<DeviceConn>>,
    path: Option<PathBuf>,
}

impl SocketLink {
    fn conn(&mut self, device: usize) -> Result<&mut DeviceConn, LinkError> {
        self.devices
            .get_mut(device)
            .and_then(Option::as_mut)
            .ok_or(LinkError::NotConnected(device))
    }

    fn remove_socket(&mut self) {
        if let Some(path) = self.path.take() {
            if let Err(e) = std::fs::remove_file(&path) {
                debug!("Could not remove socket {}: {}", path.display(), e);
            }
        }
    }
}

impl DeviceLink for SocketLink {
    fn recv(&mut self, device: usize) -> Result<Request, LinkError> {
        let conn = self.conn(device)?;
        loop {
            match decode_request(&mut conn.rx_buf) {
                Ok(Some(req)) => return Ok(req),
                Ok(None) => {}
                Err(e) => {
                    return Err(LinkError::Malformed {
                        device,
                        reason: e.to_string(),
                    })
                }
            }
            let mut chunk = [0u8; READ_CHUNK];
            let n = conn.stream.read(&mut chunk)?;
            if n == 0 {
                return Err(LinkError::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    format!("device {} closed its connection", device),
                )));
            }
            conn.rx_buf.extend_from_slice(&chunk[..n]);
        }
    }

    fn send(&mut self, device: usize, response: Response) -> Result<(), LinkError> {
        let conn = self.conn(device)?;
        let mut out = BytesMut::new();
        encode_response(&response, &mut out);
        conn.stream.write_all(&out)?;
        Ok(())
    }

    fn disconnect(&mut self, device: usize) {
        if let Some(conn) = self.devices.get_mut(device).and_then(Option::take) {
            let _ = conn.stream.shutdown(Shutdown::Both);
        }
    }

    fn terminate_all(&mut self) {
        for (d, slot) in self.devices.iter_mut().enumerate() {
            if let Some(conn) = slot.take() {
                debug!("Closing connection to device {}", d);
                if let Err(e) = conn.stream.shutdown(Shutdown::Both) {
                    warn!("Closing device {}: {}", d, e);
                }
            }
        }
        self.remove_socket();
    }
}

impl Drop for SocketLink {
    fn drop(&mut self) {
        self.remove_socket();
    }
}
