pub mod connection;
pub mod probe;

pub use connection::{
    ConnectOptions, Connection, ConnectionInfo, Dialer, LoopExit, TcpDialer,
};
pub use probe::{LivenessProbe, PingProbe, ProbeLink};
