use std::fs::File;
use std::io::{self, Read, Write};
use std::mem;
use std::time::Instant;

use crate::posix;

fn as_pollfd(f: Option<&File>, for_read: bool) -> posix::PollFd<'_> {
    let events = if for_read {
        posix::POLLIN
    } else {
        posix::POLLOUT
    };
    posix::PollFd::new(f, events)
}

fn maybe_poll(
    fin: Option<&File>,
    fout: Option<&File>,
    deadline: Option<Instant>,
) -> io::Result<(bool, bool)> {
    // When only reading, without a timeout, we can skip the poll() syscall and just let
    // the blocking read provide backpressure. This doesn't apply to stdin because it's
    // non-blocking, so a write without poll would busy-loop on WouldBlock.
    if fin.is_none() && fout.is_some() && deadline.is_none() {
        return Ok((false, true));
    }

    let timeout = deadline.map(|d| d.saturating_duration_since(Instant::now()));

    let mut fds = [as_pollfd(fin, false), as_pollfd(fout, true)];
    if posix::poll(&mut fds, timeout)? == 0 {
        return Err(io::Error::new(io::ErrorKind::TimedOut, "timeout"));
    }

    // A closed peer shows up as POLLHUP or POLLERR; the following read or write
    // reports it properly.
    Ok((
        fds[0].test(posix::POLLOUT | posix::POLLHUP | posix::POLLERR),
        fds[1].test(posix::POLLIN | posix::POLLHUP | posix::POLLERR),
    ))
}

/// Feed input to the head of a pipeline and collect the output of its tail, without
/// deadlock.
///
/// Writing all input before reading any output would deadlock as soon as the pipeline
/// produces more than a pipe buffer of output while still consuming input. Like a shell
/// waiting on `cmd <<< text | ...`, the communicator interleaves both directions using
/// `poll()`. Once the input is exhausted, stdin is closed so the head stage sees EOF.
#[derive(Debug)]
pub(crate) struct Communicator {
    stdin: Option<File>,
    stdout: Option<File>,
    input: Vec<u8>,
    input_pos: usize,
    output: Vec<u8>,
}

impl Communicator {
    pub fn new(
        stdin: Option<File>,
        stdout: Option<File>,
        input: Vec<u8>,
    ) -> io::Result<Communicator> {
        // Stdin must be non-blocking despite using poll(). poll() only tells us
        // *some* pipe space is free, not how much. With a blocking fd, write() of
        // more than PIPE_BUF bytes blocks until all data is written, which deadlocks
        // when the tail's stdout pipe is also full. A non-blocking fd returns a
        // partial write count, allowing the poll loop to make progress.
        if let Some(ref f) = stdin {
            posix::set_nonblocking(f)?;
        }
        Ok(Communicator {
            stdin,
            stdout,
            input,
            input_pos: 0,
            output: vec![],
        })
    }

    fn do_write(&mut self) -> io::Result<()> {
        if self.input_pos >= self.input.len() {
            // close stdin when done writing, so the child receives EOF
            self.stdin.take();
            return Ok(());
        }
        let Some(stdin) = self.stdin.as_mut() else {
            return Ok(());
        };
        match stdin.write(&self.input[self.input_pos..]) {
            Ok(nwritten) => {
                self.input_pos += nwritten;
                if self.input_pos >= self.input.len() {
                    self.stdin.take();
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) if e.kind() == io::ErrorKind::BrokenPipe => {
                // The head stage stopped reading; the rest of the input is dropped,
                // as a shell would.
                self.stdin.take();
            }
            Err(e) => return Err(e),
        }
        Ok(())
    }

    fn do_read(&mut self) -> io::Result<()> {
        let Some(stdout) = self.stdout.as_mut() else {
            return Ok(());
        };
        let mut buf = [0u8; 4096];
        match stdout.read(&mut buf) {
            Ok(0) => {
                self.stdout.take();
            }
            Ok(n) => self.output.extend_from_slice(&buf[..n]),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
        Ok(())
    }

    /// Exchange data until the input is written and the output reaches EOF.
    ///
    /// Returns the collected output, which is empty if stdout was not a pipe. On
    /// timeout, an error of kind `io::ErrorKind::TimedOut` is returned; the exchange
    /// can then be resumed by calling `read` again, and output collected so far is
    /// kept.
    pub fn read(&mut self, deadline: Option<Instant>) -> io::Result<Vec<u8>> {
        loop {
            if self.stdin.is_none() && self.stdout.is_none() {
                // When no stream remains, we are done.
                break;
            }
            let (in_ready, out_ready) =
                maybe_poll(self.stdin.as_ref(), self.stdout.as_ref(), deadline)?;
            if in_ready {
                self.do_write()?;
            }
            if out_ready {
                self.do_read()?;
            }
        }
        Ok(mem::take(&mut self.output))
    }
}

/// Like String::from_utf8_lossy(), but takes `Vec<u8>` and reuses its storage if possible.
pub(crate) fn from_utf8_lossy(v: Vec<u8>) -> String {
    match String::from_utf8(v) {
        Ok(s) => s,
        Err(e) => String::from_utf8_lossy(e.as_bytes()).into(),
    }
}
