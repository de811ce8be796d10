// Engine execution host
//
// Runs the liveprobe engine on its own thread so probe configuration changes
// and capture work never block the host application's primary execution
// path. The host talks to the engine only through ack-correlated message
// passing.

mod controller;

pub use controller::{spawn_engine, EngineHandle};
