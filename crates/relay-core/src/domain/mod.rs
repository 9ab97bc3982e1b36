//! Domain model (ids, message, errors, state, events).

pub mod errors;
pub mod events;
pub mod ids;
pub mod message;
pub mod state;

pub use self::errors::{ErrorKind, FlowError};
pub use self::events::{CircuitEvent, FlowEvent, GroupEvent, RetryEvent};
pub use self::ids::{CorrelationId, MessageId};
pub use self::message::{Headers, Message, SequenceDetails};
pub use self::state::CircuitState;
