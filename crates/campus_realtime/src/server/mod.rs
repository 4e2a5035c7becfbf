#![forbid(unsafe_code)]

pub mod auth;
pub mod connection;
pub mod gateway;
pub mod health;
pub mod hub;
pub mod publisher;
pub mod service;



#[cfg(test)]
mod publisher_tests;
