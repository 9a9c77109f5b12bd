//! Transport seam between the protocol engine and the serial port
//!
//! The engine only needs byte I/O plus parity, timeout and buffer control,
//! so it is written against this trait instead of a concrete port. Tests
//! drive it with a scripted mock.

use std::io;
use std::time::Duration;

use serialport::{ClearBuffer, Parity, SerialPort};

use crate::error::Result;

/// Operations the protocol engine needs from a serial link
pub trait WirePort: io::Read + io::Write {
    fn parity(&self) -> Result<Parity>;
    fn set_parity(&mut self, parity: Parity) -> Result<()>;
    fn set_timeout(&mut self, timeout: Duration) -> Result<()>;
    /// Discard anything pending in both directions
    fn clear_buffers(&mut self) -> Result<()>;
}

impl WirePort for Box<dyn SerialPort> {
    fn parity(&self) -> Result<Parity> {
        Ok(self.as_ref().parity()?)
    }

    fn set_parity(&mut self, parity: Parity) -> Result<()> {
        Ok(self.as_mut().set_parity(parity)?)
    }

    fn set_timeout(&mut self, timeout: Duration) -> Result<()> {
        Ok(self.as_mut().set_timeout(timeout)?)
    }

    fn clear_buffers(&mut self) -> Result<()> {
        Ok(self.as_ref().clear(ClearBuffer::All)?)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::collections::VecDeque;

    /// Scripted in-memory port: reads pop from `input`, writes append to
    /// `written`. An empty input queue reads as a timeout.
    pub struct MockPort {
        pub input: VecDeque<u8>,
        pub written: Vec<u8>,
        pub parity: Parity,
        pub cleared: usize,
    }

    impl MockPort {
        pub fn new(input: &[u8]) -> Self {
            Self {
                input: input.iter().copied().collect(),
                written: Vec::new(),
                parity: Parity::None,
                cleared: 0,
            }
        }
    }

    impl io::Read for MockPort {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if buf.is_empty() {
                return Ok(0);
            }
            let mut n = 0;
            while n < buf.len() {
                match self.input.pop_front() {
                    Some(byte) => {
                        buf[n] = byte;
                        n += 1;
                    }
                    None => break,
                }
            }
            if n == 0 {
                // Deadline loops treat this as "nothing arrived yet"; the
                // scripted queue never refills, so callers hit their own
                // timeout handling instead of blocking.
                Err(io::Error::new(io::ErrorKind::BrokenPipe, "mock input drained"))
            } else {
                Ok(n)
            }
        }
    }

    impl io::Write for MockPort {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.written.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl WirePort for MockPort {
        fn parity(&self) -> Result<Parity> {
            Ok(self.parity)
        }

        fn set_parity(&mut self, parity: Parity) -> Result<()> {
            self.parity = parity;
            Ok(())
        }

        fn set_timeout(&mut self, _timeout: Duration) -> Result<()> {
            Ok(())
        }

        fn clear_buffers(&mut self) -> Result<()> {
            self.cleared += 1;
            Ok(())
        }
    }
}
