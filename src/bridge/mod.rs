mod builder;
mod orchestrator;

pub use builder::{BridgeHandle, BridgeRuntime, DoorbellBridgeBuilder, ShutdownSignal};
