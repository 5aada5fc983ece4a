/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! A Rust implementation of the Tendermint BFT consensus core.
//!
//! A replica is assembled from pluggable parts supplied by the user: the [block
//! executor](app::BlockExecutor), the [block store, mempool, and evidence pool](pluggables), the
//! [network](networking::network::Network), and optionally a [signer](privval::PrivValidator). See
//! [`replica`] for how to build and start one.

pub mod app;

pub mod consensus;

pub mod events;

pub(crate) mod event_bus;

pub mod logging;

pub mod networking;

pub mod pluggables;

pub mod privval;

pub(crate) mod reactor;

pub mod replica;

pub mod timeout_ticker;

pub mod types;

pub mod votes;

pub mod wal;
