pub mod context;
pub mod feed;

pub use context::{
    AutonomousSystem, Client, Concentration, IPContext, IPContextV6, Location, Tunnel,
};
pub use feed::{FeedInfoEnvelope, FeedType, RealtimeWatermark, SnapshotWatermark, UnknownFeedType};
