/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Vote collection.
//!
//! A [`VoteSet`](vote_set::VoteSet) tallies the votes of one type in one round. A
//! [`HeightVoteSet`](height_vote_set::HeightVoteSet) keeps the prevote and precommit sets of every round
//! of a height that consensus has seen votes for.

pub mod height_vote_set;

pub mod vote_set;
