//! Wire protocol: message catalogue, bit-packed datagram and frame
//! codecs, the acknowledgement interval set and the wrap-safe counters
//! they are built on.

pub mod ack;
pub mod datagram;
pub mod frame;
pub mod message;
pub mod number;
pub mod offline;
pub mod reliability;

pub use ack::AckSet;
pub use datagram::{Datagram, DatagramHeader, DATA_HEADER_BYTES};
pub use frame::{Frame, FrameMeta, SplitInfo};
pub use message::{MessageId, OFFLINE_MAGIC};
pub use number::U24;
pub use offline::OfflineMessage;
pub use reliability::{Priority, Reliability};
