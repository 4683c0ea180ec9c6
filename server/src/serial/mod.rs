pub mod discovery;
pub mod driver;
pub mod envelope;
pub mod wire;

pub use driver::{resolve_nickname, SerialDriver};
pub use envelope::{CommandKind, DEFAULT_TIMEOUT, MOTION_SLACK};
