pub mod decision;
pub mod engine;
pub mod event_bus;
pub mod history;
pub mod loop_control;
pub mod response;
pub mod state;
