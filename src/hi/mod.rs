pub mod connection;
pub mod handler;
pub mod management;
pub mod request;
pub mod response;
pub mod service;
pub mod state;
