#[path = "../common/mod.rs"]
mod common;

mod alerts;
mod data;
mod handshake;
mod renegotiation;
mod resumption;
