mod agent;
mod auth;
mod registrar;
mod state;
mod utils;

pub use agent::SipAgent;
pub use state::SipEvent;
