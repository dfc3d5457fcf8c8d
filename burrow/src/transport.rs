pub mod envelope;
pub mod socket;

pub use envelope::{Codec, Envelope, EnvelopeError, EnvelopeKind};
pub use socket::{Pump, SocketCommand, SocketEvent, SocketHandle};
