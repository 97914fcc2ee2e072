pub mod channel;
pub mod error;
pub mod select;

pub use channel::{BoundedChannel, Iter};
pub use error::{
    CloseError, RecvTimeoutError, SendError, SendTimeoutError, TryRecvError, TrySendError,
};
pub use select::{Select, SelectEvent, Selected};
