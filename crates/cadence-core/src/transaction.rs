//! The single in-flight enqueue transaction (Begin/Add/Commit).

use thiserror::Error;

use crate::connection::ConnKey;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TransactionError {
    #[error("locked")]
    Locked,
    #[error("no transaction is open")]
    NotOpen,
}

#[derive(Debug, Default)]
pub struct Transaction {
    owner: Option<ConnKey>,
    scratch: Vec<String>,
}

impl Transaction {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn owner(&self) -> Option<ConnKey> {
        self.owner
    }

    pub fn is_open(&self) -> bool {
        self.owner.is_some()
    }

    pub fn begin(&mut self, owner: ConnKey) -> Result<(), TransactionError> {
        if self.owner.is_some() {
            return Err(TransactionError::Locked);
        }
        self.owner = Some(owner);
        self.scratch.clear();
        Ok(())
    }

    pub fn add(&mut self, owner: ConnKey, path: String) -> Result<(), TransactionError> {
        match self.owner {
            Some(o) if o == owner => {
                self.scratch.push(path);
                Ok(())
            }
            Some(_) => Err(TransactionError::Locked),
            None => Err(TransactionError::NotOpen),
        }
    }

    /// Atomically hand back the accumulated scratch list and reset.
    /// Observers either see none of the `Add`s (before this call) or all
    /// of them (once the caller splices the result into the live
    /// playlist).
    pub fn commit(&mut self, owner: ConnKey) -> Result<Vec<String>, TransactionError> {
        match self.owner {
            Some(o) if o == owner => {
                self.owner = None;
                Ok(std::mem::take(&mut self.scratch))
            }
            Some(_) => Err(TransactionError::Locked),
            None => Err(TransactionError::NotOpen),
        }
    }

    /// Implicit abort on connection close: drop the
    /// scratch playlist, leaving the live playlist untouched.
    pub fn abort_if_owned_by(&mut self, owner: ConnKey) {
        if self.owner == Some(owner) {
            self.owner = None;
            self.scratch.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(index: usize) -> ConnKey {
        ConnKey { index, generation: 0 }
    }

    #[test]
    fn second_begin_is_locked() {
        let mut tx = Transaction::new();
        tx.begin(key(0)).unwrap();
        assert_eq!(tx.begin(key(1)), Err(TransactionError::Locked));
    }

    #[test]
    fn non_owner_add_is_locked() {
        let mut tx = Transaction::new();
        tx.begin(key(0)).unwrap();
        assert_eq!(tx.add(key(1), "/x".into()), Err(TransactionError::Locked));
    }

    #[test]
    fn commit_returns_all_adds_and_resets() {
        let mut tx = Transaction::new();
        tx.begin(key(0)).unwrap();
        tx.add(key(0), "/a".into()).unwrap();
        tx.add(key(0), "/b".into()).unwrap();
        let committed = tx.commit(key(0)).unwrap();
        assert_eq!(committed, vec!["/a".to_string(), "/b".to_string()]);
        assert!(!tx.is_open());
    }

    #[test]
    fn abort_on_close_drops_scratch() {
        let mut tx = Transaction::new();
        tx.begin(key(0)).unwrap();
        tx.add(key(0), "/p".into()).unwrap();
        tx.abort_if_owned_by(key(0));
        assert!(!tx.is_open());
        // A fresh Begin from anyone succeeds; the old scratch is gone.
        tx.begin(key(2)).unwrap();
        assert_eq!(tx.commit(key(2)).unwrap(), Vec::<String>::new());
    }
}
