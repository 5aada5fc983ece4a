/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

use crate::types::data_types::PeerID;

use super::messages::Message;

/// Something that happened on the peer-to-peer network.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NetworkEvent {
    PeerConnected(PeerID),
    PeerDisconnected(PeerID),
    Message(PeerID, Message),
}

pub trait Network: Clone + Send {
    /// Send a message to all connected peers without blocking.
    fn broadcast(&mut self, message: Message);

    /// Send a message to the specified peer without blocking.
    fn send(&mut self, peer: PeerID, message: Message);

    /// Receive the next network event. Returns immediately with a None if no event is available now.
    fn recv(&mut self) -> Option<NetworkEvent>;

    /// Drop the connection to `peer` because it misbehaved.
    fn disconnect(&mut self, peer: PeerID, reason: String);
}
