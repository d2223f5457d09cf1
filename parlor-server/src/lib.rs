//! HTTP service over the reactive entity store: sessions, rooms, votes,
//! and long-poll change delivery.

pub mod api;
pub mod config;
pub mod poll;
pub mod room;
pub mod session;
pub mod user;
pub mod vote;
