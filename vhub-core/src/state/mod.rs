pub mod connection;
pub mod device;

pub use connection::ConnectionPhase;
pub use device::{DeviceState, DeviceUpdate, RouteRequest, StatusMeta, StatusSnapshot};
