use super::engine::Dht;
use super::message::{Message, TransactionId};
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::time::Instant;

/// How an outbound query resolved.
#[derive(Debug)]
pub enum Outcome<'a> {
    Response(&'a Message),
    Error(&'a Message),
    Timeout,
}

/// Invoked exactly once per transaction: on the matching reply or on expiry.
pub type TransactionCallback = Box<dyn FnOnce(&mut Dht, Outcome<'_>) + Send>;

pub struct Transaction {
    remote: SocketAddr,
    id: u32,
    expiration: Instant,
    callback: TransactionCallback,
}

impl Transaction {
    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn expiration(&self) -> Instant {
        self.expiration
    }

    /// Hands `outcome` to the callback.
    ///
    /// Only transactions already removed from the table can be completed, and
    /// completing consumes them, so no callback runs twice.
    pub fn complete(self, dht: &mut Dht, outcome: Outcome<'_>) {
        (self.callback)(dht, outcome);
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("remote", &self.remote)
            .field("id", &self.id)
            .field("expiration", &self.expiration)
            .finish_non_exhaustive()
    }
}

/// Outstanding queries, keyed by transaction id alone.
///
/// Ids are unique across all peers while outstanding; replies are further
/// checked against the address the query was sent to.
pub struct TransactionTable {
    next_id: u32,
    pending: HashMap<u32, Transaction>,
}

impl TransactionTable {
    pub fn new() -> Self {
        Self {
            next_id: 1,
            pending: HashMap::new(),
        }
    }

    #[cfg(test)]
    pub(crate) fn rewind_to(&mut self, next_id: u32) {
        self.next_id = next_id;
    }

    /// Registers a new outstanding query and returns its id.
    ///
    /// The counter wraps at `u32::MAX`; ids still in flight are skipped.
    pub fn begin(
        &mut self,
        remote: SocketAddr,
        expiration: Instant,
        callback: TransactionCallback,
    ) -> u32 {
        let mut id = self.next_id;
        while self.pending.contains_key(&id) {
            id = id.wrapping_add(1);
        }
        self.next_id = id.wrapping_add(1);

        self.pending.insert(
            id,
            Transaction {
                remote,
                id,
                expiration,
                callback,
            },
        );
        id
    }

    /// Removes and returns the transaction a reply belongs to.
    ///
    /// A reply from an address other than the one queried does not match and
    /// leaves the transaction in place.
    pub fn take_match(
        &mut self,
        transaction_id: &TransactionId,
        remote: SocketAddr,
    ) -> Option<Transaction> {
        let id = transaction_id.as_u32()?;
        let transaction = self.pending.get(&id)?;
        if transaction.remote != remote {
            return None;
        }
        self.pending.remove(&id)
    }

    /// Removes every transaction whose deadline is `<= now`,
    /// oldest deadline first.
    pub fn sweep(&mut self, now: Instant) -> Vec<Transaction> {
        let expired: Vec<u32> = self
            .pending
            .values()
            .filter(|t| t.expiration <= now)
            .map(|t| t.id)
            .collect();

        let mut swept: Vec<Transaction> = expired
            .iter()
            .filter_map(|id| self.pending.remove(id))
            .collect();
        swept.sort_by_key(|t| t.expiration);
        swept
    }

    /// Forgets a transaction without running its callback.
    pub fn cancel(&mut self, id: u32) -> bool {
        self.pending.remove(&id).is_some()
    }

    pub fn contains(&self, id: u32) -> bool {
        self.pending.contains_key(&id)
    }

    pub fn get(&self, id: u32) -> Option<&Transaction> {
        self.pending.get(&id)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Drops every pending transaction; callbacks are not run.
    pub(crate) fn clear(&mut self) -> usize {
        let dropped = self.pending.len();
        self.pending.clear();
        dropped
    }
}

impl Default for TransactionTable {
    fn default() -> Self {
        Self::new()
    }
}
