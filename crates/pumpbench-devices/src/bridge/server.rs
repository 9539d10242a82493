/*!
 * RTU server loop.
 *
 * The server owns no register memory; every decoded request goes to a
 * [`RequestHandler`]. Frames are delimited by their declared length, and a
 * silent poll interval discards any partial frame.
 */
use std::io::{Read, Write};
use std::os::fd::AsFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use bytes::BytesMut;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use tracing::{debug, trace, warn};

use crate::error::Result;
use crate::protocol::{encode_exception, rtu, ExceptionCode, Request, Response};

/// How often the loop checks its stop flag while idle
pub const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Serves decoded requests
pub trait RequestHandler: Send + Sync {
    /// Produce the response, or the exception to answer with
    fn handle(&self, request: &Request) -> std::result::Result<Response, ExceptionCode>;
}

/// An RTU server for one unit id
pub struct RtuServer<H> {
    unit_id: u8,
    handler: H,
}

impl<H: RequestHandler> RtuServer<H> {
    /// Server answering as `unit_id`
    pub fn new(unit_id: u8, handler: H) -> Self {
        Self { unit_id, handler }
    }

    /// The handler requests are passed to
    pub fn handler(&self) -> &H {
        &self.handler
    }

    /// Serve `stream` until `stop` is set or the peer hangs up
    pub fn serve<S: Read + Write + AsFd>(&self, stream: &mut S, stop: &AtomicBool) -> Result<()> {
        let mut pending: Vec<u8> = Vec::with_capacity(rtu::MAX_FRAME_LEN);
        let mut chunk = [0u8; rtu::MAX_FRAME_LEN];

        while !stop.load(Ordering::SeqCst) {
            if !readable(stream, POLL_INTERVAL)? {
                if !pending.is_empty() {
                    debug!(bytes = pending.len(), "Discarding incomplete frame");
                    pending.clear();
                }
                continue;
            }

            let read = match stream.read(&mut chunk) {
                Ok(0) => {
                    debug!("Serial peer closed");
                    return Ok(());
                }
                Ok(read) => read,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            };
            pending.extend_from_slice(&chunk[..read]);

            while let Some(len) = rtu::request_frame_len(&pending) {
                if len > rtu::MAX_FRAME_LEN {
                    warn!(len, "Oversized frame, resynchronizing");
                    pending.clear();
                    break;
                }
                if pending.len() < len {
                    break;
                }
                let frame: Vec<u8> = pending.drain(..len).collect();
                if let Some(reply) = self.process(&frame) {
                    stream.write_all(&reply)?;
                    stream.flush()?;
                }
            }
        }
        Ok(())
    }

    /// Answer one complete frame; `None` when no reply is due
    pub fn process(&self, frame: &[u8]) -> Option<BytesMut> {
        trace!(frame = %rtu::hex(frame), "RTU request");
        let (unit_id, pdu) = match rtu::decode_frame(frame) {
            Ok(decoded) => decoded,
            Err(e) => {
                debug!("Dropping frame: {}", e);
                return None;
            }
        };
        if unit_id != self.unit_id {
            trace!(unit_id, "Frame for another unit");
            return None;
        }

        let function = pdu.first().copied().unwrap_or(0);
        let mut reply = BytesMut::new();
        match Request::decode(pdu).and_then(|request| self.handler.handle(&request)) {
            Ok(response) => response.encode(&mut reply),
            Err(exception) => {
                debug!(function, %exception, "Answering with exception");
                encode_exception(function, exception, &mut reply);
            }
        }
        Some(rtu::encode_frame(self.unit_id, &reply))
    }
}

fn readable<S: AsFd>(stream: &S, timeout: Duration) -> Result<bool> {
    let millis = u16::try_from(timeout.as_millis()).unwrap_or(u16::MAX);
    let mut fds = [PollFd::new(stream.as_fd(), PollFlags::POLLIN)];
    match poll(&mut fds, PollTimeout::from(millis)) {
        Ok(0) => Ok(false),
        Ok(_) => Ok(true),
        Err(nix::errno::Errno::EINTR) => Ok(false),
        Err(e) => Err(e.into()),
    }
}
