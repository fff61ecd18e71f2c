// Market data domain
pub mod calendar;
pub mod data_point;
pub mod live_feed;
pub mod resolution;
pub mod slice;
pub mod subscription;
