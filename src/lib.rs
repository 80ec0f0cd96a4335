pub mod classify;
pub mod config;
pub mod db;
pub mod deferred;
pub mod delta;
pub mod error;
pub mod frontend;
pub mod gateway;
pub mod guard;
pub mod handlers;
pub mod model;
pub mod sync;
pub mod wfm;
