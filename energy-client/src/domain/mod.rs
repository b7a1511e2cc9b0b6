pub mod bucket;
pub mod reading;

pub use bucket::{Bucket, BucketKey, BucketWindow, ChannelStats, ChargeFold, Extrema, PowerFold, Resolution};
pub use reading::{
    Channel, ChannelReading, ChargeSample, EnergyCounters, InstantReading, Reading, Sample,
};
