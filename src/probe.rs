use std::io;
use std::time::Duration;
use std::time::Instant;

use anyhow::bail;
use anyhow::Context;
use anyhow::Result;

use crate::misc::close_fd;

/// Bytes the probe reads from the region base on every request.
pub const PROBE_WINDOW: usize = 1024;

/// Bytes sent back on the response pipe.
pub const PROBE_REPLY: usize = 64;

/// Round trips slower than this get flagged.
pub const LATENCY_WARN_MS: u64 = 100;

/// One request/response pipe pair linking the supervisor to a worker's
/// latency probe. Created without CLOEXEC so the fds survive the exec into
/// the worker subcommand; the worker passes them on to the forked probe.
pub struct ProbeChannel {
    pub request_read: i32,
    pub request_write: i32,
    pub response_read: i32,
    pub response_write: i32,
}

impl ProbeChannel {
    pub fn new() -> Result<Self> {
        let (request_read, request_write) = make_pipe().context("request pipe")?;
        let (response_read, response_write) = make_pipe().context("response pipe")?;
        Ok(Self {
            request_read,
            request_write,
            response_read,
            response_write,
        })
    }
}

fn make_pipe() -> io::Result<(i32, i32)> {
    let mut fds = [0i32; 2];
    let ret = unsafe { libc::pipe2(fds.as_mut_ptr(), 0) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok((fds[0], fds[1]))
}

/// The supervisor's end of a probe channel. Owns the two fds and closes
/// them on drop, which is what eventually signals the probe to exit.
pub struct ProbeHandle {
    request_write: i32,
    response_read: i32,
}

impl ProbeHandle {
    pub fn new(request_write: i32, response_read: i32) -> Self {
        Self {
            request_write,
            response_read,
        }
    }

    /// One latency measurement: write the go byte, block until the full
    /// reply arrives, return the elapsed wall time.
    ///
    /// There is deliberately no timeout on the response read; a hung probe
    /// stalls the supervision cycle and is itself a visible symptom.
    pub fn round_trip(&self, reply: &mut [u8; PROBE_REPLY]) -> Result<Duration> {
        let start = Instant::now();

        let go = [1u8];
        let nw = unsafe { libc::write(self.request_write, go.as_ptr() as *const libc::c_void, 1) };
        if nw != 1 {
            bail!(
                "probe request write failed: {}",
                io::Error::last_os_error()
            );
        }

        let mut got = 0usize;
        while got < PROBE_REPLY {
            let n = unsafe {
                libc::read(
                    self.response_read,
                    reply[got..].as_mut_ptr() as *mut libc::c_void,
                    PROBE_REPLY - got,
                )
            };
            if n < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                bail!("probe response read failed: {}", err);
            }
            if n == 0 {
                bail!(
                    "probe response pipe closed after {} of {} bytes",
                    got,
                    PROBE_REPLY
                );
            }
            got += n as usize;
        }

        Ok(start.elapsed())
    }
}

impl Drop for ProbeHandle {
    fn drop(&mut self) {
        close_fd(self.request_write);
        close_fd(self.response_read);
    }
}

/// Probe body. Strictly a responder: blocks on the request pipe, and each
/// request byte (the value is irrelevant) triggers one read of PROBE_WINDOW
/// bytes from the region base followed by one PROBE_REPLY-byte reply.
///
/// Returns when the request pipe reports end-of-stream or an unrecoverable
/// error; that is the normal shutdown path, not a failure.
pub fn serve(request_read: i32, response_write: i32, base: *const u8) {
    let mut window = [0u8; PROBE_WINDOW];
    loop {
        let mut req = [0u8; 1];
        let n = unsafe {
            libc::read(
                request_read,
                req.as_mut_ptr() as *mut libc::c_void,
                1,
            )
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return;
        }
        if n == 0 {
            return;
        }

        // Sample the live, possibly merged pages.
        unsafe { std::ptr::copy_nonoverlapping(base, window.as_mut_ptr(), PROBE_WINDOW) };

        let mut sent = 0usize;
        while sent < PROBE_REPLY {
            let n = unsafe {
                libc::write(
                    response_write,
                    window[sent..].as_ptr() as *const libc::c_void,
                    PROBE_REPLY - sent,
                )
            };
            if n < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return;
            }
            if n == 0 {
                return;
            }
            sent += n as usize;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spawn_serve(chan: &ProbeChannel, base: *const u8) -> std::thread::JoinHandle<()> {
        let (rr, rw) = (chan.request_read, chan.response_write);
        let addr = base as usize;
        std::thread::spawn(move || serve(rr, rw, addr as *const u8))
    }

    #[test]
    fn reply_is_the_head_of_the_sampled_window() {
        let buf: Vec<u8> = (0..PROBE_WINDOW).map(|i| (i * 7 % 256) as u8).collect();

        let chan = ProbeChannel::new().unwrap();
        let server = spawn_serve(&chan, buf.as_ptr());
        let handle = ProbeHandle::new(chan.request_write, chan.response_read);

        let mut reply = [0u8; PROBE_REPLY];
        let elapsed = handle.round_trip(&mut reply).unwrap();
        assert_eq!(&reply[..], &buf[..PROBE_REPLY]);
        assert!(elapsed < Duration::from_secs(5));

        // the probe goes back to Idle and answers again
        let mut second = [0u8; PROBE_REPLY];
        handle.round_trip(&mut second).unwrap();
        assert_eq!(&second[..], &buf[..PROBE_REPLY]);

        // closing the request pipe terminates the serve loop
        drop(handle);
        server.join().unwrap();
        drop(buf);
    }

    #[test]
    fn reply_tracks_region_mutation() {
        let mut buf = vec![0u8; PROBE_WINDOW];

        let chan = ProbeChannel::new().unwrap();
        let server = spawn_serve(&chan, buf.as_ptr());
        let handle = ProbeHandle::new(chan.request_write, chan.response_read);

        let mut reply = [0u8; PROBE_REPLY];
        handle.round_trip(&mut reply).unwrap();
        assert_eq!(reply, [0u8; PROBE_REPLY]);

        buf[0] = 0x5a;
        handle.round_trip(&mut reply).unwrap();
        assert_eq!(reply[0], 0x5a);

        drop(handle);
        server.join().unwrap();
    }

    #[test]
    fn closed_response_pipe_is_an_error_not_a_hang() {
        let buf = vec![0u8; PROBE_WINDOW];

        let chan = ProbeChannel::new().unwrap();
        // no server; close the write end so the read sees EOF immediately
        close_fd(chan.request_read);
        close_fd(chan.response_write);
        let handle = ProbeHandle::new(chan.request_write, chan.response_read);

        let mut reply = [0u8; PROBE_REPLY];
        let err = handle.round_trip(&mut reply);
        assert!(err.is_err());
        drop(buf);
    }
}
