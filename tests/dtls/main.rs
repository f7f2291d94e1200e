#[path = "../common/mod.rs"]
mod common;

mod data;
mod handshake;
mod records;
mod renegotiation;
mod retransmit;
