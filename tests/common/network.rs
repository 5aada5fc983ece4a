/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

use std::{
    collections::HashMap,
    sync::{
        mpsc::{self, Receiver, Sender, TryRecvError},
        Arc, Mutex,
    },
};

use tendermint_rs::{
    networking::{
        messages::Message,
        network::{Network, NetworkEvent},
    },
    types::data_types::PeerID,
};

/// What travels between stubs: messages cross as encoded bytes, and are decoded by the receiver.
enum WireEvent {
    Connected(PeerID),
    Bytes(PeerID, Vec<u8>),
}

/// A mock network stub which passes messages from and to threads using channels. Every peer starts
/// out connected to every other peer.
#[derive(Clone)]
pub(crate) struct NetworkStub {
    my_peer_id: PeerID,
    all_peers: HashMap<PeerID, Sender<WireEvent>>,
    inbox: Arc<Mutex<Receiver<WireEvent>>>,
    disconnected: Arc<Mutex<Vec<(PeerID, String)>>>,
}

impl NetworkStub {
    pub(crate) fn peer_id(&self) -> PeerID {
        self.my_peer_id
    }

    /// Peers that this node dropped for misbehaving, with the reasons.
    pub(crate) fn disconnected(&self) -> Vec<(PeerID, String)> {
        self.disconnected.lock().unwrap().clone()
    }

    /// Deliver `message` to `peer` as if this node had sent it, bypassing the node's reactor.
    pub(crate) fn inject(&self, peer: PeerID, message: Message) {
        self.inject_bytes(peer, message.encode());
    }

    /// Deliver raw bytes to `peer` as if this node had sent them.
    pub(crate) fn inject_bytes(&self, peer: PeerID, bytes: Vec<u8>) {
        if let Some(inbox) = self.all_peers.get(&peer) {
            let _ = inbox.send(WireEvent::Bytes(self.my_peer_id, bytes));
        }
    }
}

impl Network for NetworkStub {
    fn broadcast(&mut self, message: Message) {
        let bytes = message.encode();
        for (peer, inbox) in &self.all_peers {
            if *peer != self.my_peer_id {
                let _ = inbox.send(WireEvent::Bytes(self.my_peer_id, bytes.clone()));
            }
        }
    }

    fn send(&mut self, peer: PeerID, message: Message) {
        self.inject(peer, message);
    }

    fn recv(&mut self) -> Option<NetworkEvent> {
        loop {
            let event = match self.inbox.lock().unwrap().try_recv() {
                Ok(event) => event,
                Err(TryRecvError::Empty) => return None,
                Err(TryRecvError::Disconnected) => panic!(),
            };
            match event {
                WireEvent::Connected(peer) => return Some(NetworkEvent::PeerConnected(peer)),
                WireEvent::Bytes(peer, bytes) => match Message::decode(&bytes) {
                    Ok(message) => return Some(NetworkEvent::Message(peer, message)),
                    Err(err) => self.disconnect(peer, format!("undecodable message: {}", err)),
                },
            }
        }
    }

    fn disconnect(&mut self, peer: PeerID, reason: String) {
        self.disconnected.lock().unwrap().push((peer, reason));
    }
}

pub(crate) fn mock_network(peers: impl Iterator<Item = PeerID>) -> Vec<NetworkStub> {
    let mut all_peers = HashMap::new();
    let peer_and_inboxes: Vec<(PeerID, Receiver<WireEvent>)> = peers
        .map(|peer| {
            let (sender, receiver) = mpsc::channel();
            all_peers.insert(peer, sender);

            (peer, receiver)
        })
        .collect();

    for (peer, inbox) in &all_peers {
        for other in all_peers.keys().filter(|other| *other != peer) {
            let _ = inbox.send(WireEvent::Connected(*other));
        }
    }

    peer_and_inboxes
        .into_iter()
        .map(|(my_peer_id, inbox)| NetworkStub {
            my_peer_id,
            all_peers: all_peers.clone(),
            inbox: Arc::new(Mutex::new(inbox)),
            disconnected: Arc::new(Mutex::new(Vec::new())),
        })
        .collect()
}
