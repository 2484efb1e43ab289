pub mod model;
pub mod rpc;
pub mod time;

pub use model::{
    ConversationMatch, ConversationSummary, ConversationType, ServiceKind, TimelineMessage,
};
pub use time::{Clock, FixedClock, NativeTimestamp, SystemClock, TimeCodec};
