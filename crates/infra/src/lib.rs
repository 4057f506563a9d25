//! Infrastructure layer: event store, dispatcher, read models, collaborators,
//! configuration and the engine services.

pub mod collaborators;
pub mod command_dispatcher;
pub mod config;
pub mod event_bus;
pub mod event_store;
pub mod notifications;
pub mod projections;
pub mod read_model;
pub mod services;
pub mod workers;

pub use command_dispatcher::{CommandDispatcher, DispatchError};
pub use config::EngineConfig;
pub use services::Engine;
