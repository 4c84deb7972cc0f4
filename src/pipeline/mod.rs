pub mod session;
pub mod sink;
pub mod slot;
pub mod state;

pub use session::{ScanSession, ScanStats};
pub use sink::{ChannelSink, ResultSink, ScanOutcome};
pub use slot::{FrameSlot, Offer, SlotStats};
pub use state::{DecodedPayload, ScanState};
