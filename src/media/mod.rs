pub mod args;
pub mod probe;
pub mod relay;
pub mod trim;

pub use args::RelayParams;
pub use probe::{BlackFrameProbe, ProbeOutcome, ProbeSettings, StartOffset};
pub use relay::Relay;
pub use trim::{TrimError, Trimmer};
