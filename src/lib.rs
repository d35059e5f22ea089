pub mod arbitration;
pub mod audio;
pub mod console;
pub mod credential;
pub mod error;
pub mod event_log;
pub mod provider;
pub mod scheduler;
pub mod settings;
pub mod state;
pub mod transport;
