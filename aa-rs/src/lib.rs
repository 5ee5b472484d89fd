//! ERC-4337 user operation pipeline for EntryPoint v0.6 and v0.7: build a
//! user operation from account intent, estimate and price it through a
//! middleware chain, sign it, submit it to a bundler and track it until it is
//! mined (or drop and replace it when it is not).

pub mod account;
pub mod bundler;
pub mod client;
pub mod config;
pub mod encoding;
pub mod entrypoint;
pub mod error;
pub mod fees;
pub mod middleware;
pub mod multisig;
pub mod paymaster;
pub mod rpc;
pub mod signer;
pub mod types;
pub mod wait;

pub use client::SmartAccountClient;
pub use error::{AaError, Result};
