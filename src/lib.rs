pub mod compile;
pub mod engine;
pub mod fact;
pub mod goals;
pub mod history;
pub mod location;
pub mod node;
pub mod registry;
pub mod rule;
pub mod store;
pub mod term;
pub mod trace;
pub mod transport;
pub mod wire;
