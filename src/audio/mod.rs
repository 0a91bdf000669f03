mod error;
#[cfg(test)]
mod memory;
mod meter;
mod pulse;
mod session;

pub use error::AudioResult;
#[cfg(test)]
pub use memory::MemorySessions;
pub use pulse::PulseSessions;
pub use session::{SessionAccessor, SessionBackend};
