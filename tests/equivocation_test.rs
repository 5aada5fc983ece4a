/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

use std::time::Duration;

use ed25519_dalek::{Signer, SigningKey};
use log::LevelFilter;
use tendermint_rs::{
    networking::messages::{Message, VoteMessage},
    types::{
        block::BlockID,
        data_types::{Address, CryptoHash, Height, Round, SignatureBytes, Timestamp},
        part_set::PartSetHeader,
        validator_set::ValidatorSet,
        vote::{Vote, VoteType},
    },
};

mod common;

use crate::common::{
    logging::setup_logger,
    network::mock_network,
    node::{genesis_state, peer_id, validators, wait_until, Node, NodeSpec, CHAIN_ID},
};

fn prevote(key: &SigningKey, validator_set: &ValidatorSet, height: Height, block_id: BlockID) -> Vote {
    let address = Address::from_verifying_key(&key.verifying_key());
    let (index, _) = validator_set.get_by_address(&address).unwrap();
    let mut vote = Vote {
        vote_type: VoteType::Prevote,
        height,
        round: Round::new(0),
        block_id,
        timestamp: Timestamp::now(),
        validator_address: address,
        validator_index: index as i32,
        signature: SignatureBytes::zero(),
        extension: Vec::new(),
        extension_signature: None,
    };
    vote.signature = SignatureBytes::new(key.sign(&vote.sign_bytes(CHAIN_ID)).to_bytes());
    vote
}

#[test]
fn conflicting_prevotes_are_reported_and_consensus_goes_on() {
    setup_logger(LevelFilter::Debug);

    // 1. Create 4 validators. The last one is byzantine: it runs no replica and only sends votes.
    let (validator_set, mut keys) = validators(4);
    let byzantine_key = keys.pop().unwrap();
    let mut network_stubs = mock_network(
        keys.iter()
            .chain(std::iter::once(&byzantine_key))
            .map(peer_id),
    );
    let byzantine_network = network_stubs.pop().unwrap();

    // 2. Start the 3 honest replicas, which hold more than two-thirds of the voting power.
    let genesis = genesis_state(validator_set.clone());
    let nodes: Vec<Node> = keys
        .into_iter()
        .zip(network_stubs)
        .map(|(key, network)| Node::start(NodeSpec::new(Some(key), network, genesis.clone())).unwrap())
        .collect();

    // 3. Send each honest replica two different prevotes for round 0 of the height it is working on,
    // until every one of them has caught the equivocation.
    let fake_block_id = BlockID::new(
        CryptoHash::digest(b"fake block"),
        PartSetHeader {
            total: 1,
            hash: CryptoHash::digest(b"fake part"),
        },
    );
    wait_until(Duration::from_secs(60), "every replica reported evidence", || {
        for node in &nodes {
            if !node.evidence().is_empty() {
                continue;
            }
            let height = node.consensus_height();
            for block_id in [fake_block_id, BlockID::nil()] {
                let vote = prevote(&byzantine_key, &validator_set, height, block_id);
                byzantine_network.inject(node.peer_id(), Message::Vote(VoteMessage { vote }));
            }
        }
        nodes.iter().all(|node| !node.evidence().is_empty())
    });

    let byzantine_address = Address::from_verifying_key(&byzantine_key.verifying_key());
    for node in &nodes {
        let evidence = &node.evidence()[0];
        assert_eq!(evidence.address(), byzantine_address);
        assert_ne!(evidence.vote_a.block_id, evidence.vote_b.block_id);
        assert_eq!(evidence.vote_a.vote_type, VoteType::Prevote);
    }

    // 4. The honest replicas keep committing the same blocks.
    wait_until(Duration::from_secs(60), "every replica committed 3 blocks", || {
        nodes.iter().all(|node| node.committed_height() >= Height::new(3))
    });
    for height in 1..=3 {
        let height = Height::new(height);
        assert_eq!(nodes[1].block_hash(height), nodes[0].block_hash(height));
        assert_eq!(nodes[2].block_hash(height), nodes[0].block_hash(height));
    }
}
