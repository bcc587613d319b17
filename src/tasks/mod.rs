mod connectivity;
mod idle_sweep;

pub use connectivity::{AlwaysOnline, ConnectivityCheck, ConnectivityProbe};
pub use idle_sweep::IdleSweepTask;
