/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Types that are used across multiple components of the consensus core.
//!
//! Types that are specific to a single component, e.g., [`crate::consensus::round_state`], live in
//! that component's module.

pub mod bit_array;

pub mod block;

pub mod commit;

pub mod crypto_primitives;

pub mod data_types;

pub mod evidence;

pub mod merkle;

pub mod params;

pub mod part_set;

pub mod proposal;

pub mod state;

pub mod validator_set;

pub mod vote;
