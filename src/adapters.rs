//! Driver/monitor adapters over a model.
//!
//! A [`Model`]'s `input`/`output` methods need exclusive access; these
//! wrappers serialize concurrent callers through a fair async mutex, so a
//! test harness can fire transactions from several tasks and they appear on
//! the wire in call order.

use tokio::sync::Mutex;

use crate::error::Result;
use crate::model::{Behavior, Model, Txn};
use crate::sim::Tick;

/// Transmit-side adapter: queues logical transactions onto the wires.
pub struct Driver<B: Behavior> {
    model: Mutex<Model<B>>,
}

impl<B: Behavior> Driver<B> {
    pub fn new(model: Model<B>) -> Self {
        Self {
            model: Mutex::new(model),
        }
    }

    /// Sends one transaction; concurrent senders complete in FIFO order.
    pub async fn send<T: Tick>(&self, txn: Txn, tick: &T) -> Result<()> {
        let mut model = self.model.lock().await;
        model.input(txn, tick).await
    }

    /// True while a send is in progress.
    pub fn busy(&self) -> bool {
        match self.model.try_lock() {
            Ok(model) => model.busy(),
            Err(_) => true,
        }
    }

    /// Exclusive access for setup between transactions.
    pub fn model_mut(&mut self) -> &mut Model<B> {
        self.model.get_mut()
    }
}

/// Receive-side adapter: yields recognized transactions.
pub struct Monitor<B: Behavior> {
    model: Mutex<Model<B>>,
}

impl<B: Behavior> Monitor<B> {
    pub fn new(model: Model<B>) -> Self {
        Self {
            model: Mutex::new(model),
        }
    }

    /// Receives one transaction; concurrent receivers complete in FIFO
    /// order.
    pub async fn recv<T: Tick>(&self, tick: &T) -> Result<Txn> {
        let mut model = self.model.lock().await;
        model.output(tick).await
    }

    pub fn busy(&self) -> bool {
        match self.model.try_lock() {
            Ok(model) => model.busy(),
            Err(_) => true,
        }
    }

    pub fn model_mut(&mut self) -> &mut Model<B> {
        self.model.get_mut()
    }
}
