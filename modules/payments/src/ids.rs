//! Sortable identifiers.
//!
//! Every internal entity id in this module is a 26-character Crockford
//! base32 ULID rather than a plain v4 UUID, because ledger entries for a
//! given account need to be totally ordered by id, and a lexicographically
//! sortable-by-creation-time id makes that ordering free.
//!
//! [`IdGenerator`] wraps `ulid::Generator`, which is monotonic within the
//! same millisecond, so two ids minted back-to-back inside one
//! transaction (e.g. the DEBIT then CREDIT ledger entries) sort in
//! insertion order even when the wall clock doesn't advance between them.

use std::sync::Mutex;
use ulid::Ulid;

pub struct IdGenerator {
    inner: Mutex<ulid::Generator>,
}

impl IdGenerator {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(ulid::Generator::new()),
        }
    }

    /// Mint a new id, guaranteed greater than any id this generator has
    /// returned before at the same millisecond.
    pub fn next(&self) -> Ulid {
        let mut gen = self.inner.lock().expect("id generator mutex poisoned");
        loop {
            match gen.generate() {
                Ok(id) => return id,
                // Exhausted the monotonic counter for this millisecond. The
                // clock will have advanced by the time we retry.
                Err(_) => std::thread::yield_now(),
            }
        }
    }
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self::new()
    }
}
