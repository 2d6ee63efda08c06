//! Store-and-Forward Delivery
//!
//! ## State Machine
//!
//! ```text
//!               reachable, send ok
//!            ┌────────────────────┐
//!            ▼                    │
//!        ┌────────┐  unreachable   ┌─────────────────┐
//!  ──────▶ ONLINE │───or send ────▶│ OFFLINE_PENDING │◀──┐ unreachable,
//!        └────────┘    failed      └─────────────────┘───┘ or drain failed
//!            ▲                              │
//!            └──── reachable, drain ok ─────┘
//! ```
//!
//! Every call to [`DeliveryOrchestrator::save`] handles exactly one new reading:
//!
//! | Reachable | Backlog  | Action                                          |
//! |-----------|----------|-------------------------------------------------|
//! | no        | any      | append to buffer                                |
//! | yes       | empty    | send `[reading]`; append on failure             |
//! | yes       | non-empty| send backlog + reading in chunks; clear on success, append on failure |
//!
//! ## Ordering
//!
//! The backlog always goes out before (or in the same chunk as) the newest
//! reading, and chunks are sent in order. The first failed chunk stops the
//! drain. The buffer is only cleared after every chunk was accepted, so a
//! partial drain leaves all earlier rows in place; chunks that did get through
//! are sent again on the next drain and deduplicated by the broker.

use edgerelay_connectors::{Publisher, Reachability};
use edgerelay_core::{BatchSplitter, LogContext, Reading};
use edgerelay_store::{LocalBuffer, StorageResult};
use log::{debug, error, info, warn};
use std::fmt;

/// Delivery mode, tracked across calls to `save`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryState {
    /// Last reading was delivered; nothing waits in the buffer
    Online,
    /// Readings are parked in the buffer awaiting a drain
    OfflinePending,
}

impl fmt::Display for DeliveryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeliveryState::Online => f.write_str("ONLINE"),
            DeliveryState::OfflinePending => f.write_str("OFFLINE_PENDING"),
        }
    }
}

/// Routes each new reading to the broker or the local buffer
pub struct DeliveryOrchestrator<P, R> {
    publisher: P,
    reachability: R,
    buffer: LocalBuffer,
    splitter: BatchSplitter,
    state: DeliveryState,
    log: LogContext,
}

impl<P: Publisher, R: Reachability> DeliveryOrchestrator<P, R> {
    pub fn new(
        publisher: P,
        reachability: R,
        buffer: LocalBuffer,
        splitter: BatchSplitter,
        log: LogContext,
    ) -> Self {
        Self {
            publisher,
            reachability,
            buffer,
            splitter,
            state: DeliveryState::Online,
            log,
        }
    }

    pub fn state(&self) -> DeliveryState {
        self.state
    }

    /// Number of buffered readings awaiting delivery
    pub fn pending(&self) -> StorageResult<usize> {
        self.buffer.count()
    }

    /// Buffered readings in insertion order
    pub fn buffered(&self) -> StorageResult<Vec<Reading>> {
        self.buffer.all()
    }

    pub fn publisher(&self) -> &P {
        &self.publisher
    }

    pub fn publisher_mut(&mut self) -> &mut P {
        &mut self.publisher
    }

    /// Deliver or buffer one reading
    ///
    /// Connectivity problems are absorbed. Only a failed buffer operation is
    /// returned. When the backlog cannot be read the new reading is still
    /// appended before the error is returned.
    pub async fn save(&mut self, reading: Reading) -> StorageResult<DeliveryState> {
        if !self.reachability.is_reachable().await {
            info!(target: self.log.target(), "network unreachable, buffering reading");
            return self.park(&reading);
        }

        let backlog = match self.backlog() {
            Ok(backlog) => backlog,
            Err(err) => {
                error!(target: self.log.target(), "cannot read backlog: {err}");
                self.park(&reading)?;
                return Err(err);
            }
        };

        if backlog.is_empty() {
            if self.publisher.send(std::slice::from_ref(&reading)).await {
                debug!(target: self.log.target(), "reading delivered");
                self.state = DeliveryState::Online;
                return Ok(self.state);
            }
            warn!(target: self.log.target(), "delivery failed, buffering reading");
            return self.park(&reading);
        }

        let mut batch = backlog;
        info!(
            target: self.log.target(),
            "draining {} buffered readings with the new one",
            batch.len()
        );
        batch.push(reading.clone());

        if self.drain(&batch).await {
            self.buffer.clear()?;
            info!(target: self.log.target(), "backlog delivered, buffer cleared");
            self.state = DeliveryState::Online;
            return Ok(self.state);
        }

        self.park(&reading)
    }

    /// Buffered rows, skipping the full read when the buffer is empty
    fn backlog(&self) -> StorageResult<Vec<Reading>> {
        if self.buffer.is_empty()? {
            return Ok(Vec::new());
        }
        self.buffer.all()
    }

    /// Send `batch` chunk by chunk; false at the first rejected chunk
    async fn drain(&mut self, batch: &[Reading]) -> bool {
        let chunks = self.splitter.split(batch);
        let total = chunks.len();
        for (index, chunk) in chunks.into_iter().enumerate() {
            if !self.publisher.send(chunk).await {
                warn!(
                    target: self.log.target(),
                    "drain stopped at chunk {}/{total}, keeping backlog",
                    index + 1
                );
                return false;
            }
            debug!(
                target: self.log.target(),
                "chunk {}/{total} sent ({} readings)",
                index + 1,
                chunk.len()
            );
        }
        true
    }

    fn park(&mut self, reading: &Reading) -> StorageResult<DeliveryState> {
        self.buffer.append(reading)?;
        self.state = DeliveryState::OfflinePending;
        Ok(self.state)
    }
}
