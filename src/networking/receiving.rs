/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Functions for receiving events from the P2P network.

use std::{
    sync::mpsc::{Receiver, Sender, TryRecvError},
    thread::{self, JoinHandle},
};

use super::network::{Network, NetworkEvent};

/// Spawn the poller thread, which polls the [`Network`] for events and forwards them to the
/// [reactor](crate::reactor), in the order they were received.
pub(crate) fn start_polling<N: Network + 'static, T: From<NetworkEvent> + Send + 'static>(
    mut network: N,
    shutdown_signal: Receiver<()>,
    to_reactor: Sender<T>,
) -> JoinHandle<()> {
    thread::spawn(move || loop {
        match shutdown_signal.try_recv() {
            Ok(()) => return,
            Err(TryRecvError::Empty) => (),
            Err(TryRecvError::Disconnected) => {
                log::error!("Poller thread disconnected from main thread");
                return;
            }
        }

        if let Some(event) = network.recv() {
            if to_reactor.send(T::from(event)).is_err() {
                return;
            }
        } else {
            thread::yield_now()
        }
    })
}
