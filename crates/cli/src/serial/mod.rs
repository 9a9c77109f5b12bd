//! Serial session: port ownership, background reader, byte counters
//!
//! One `SerialSession` exists per process. The background reader renders
//! incoming bytes as terminal output; foreground protocol work raises the
//! pause gate, takes the port mutex and drives the wire exclusively until
//! the guard drops.

mod reader;
mod session;

pub use reader::spawn_reader;
pub use session::{PauseGuard, SerialSession};
