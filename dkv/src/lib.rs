#![allow(non_camel_case_types)]

//! `dkv` is a distributed key-value store: a log-structured storage engine
//! under a change journal that stamps every committed write batch with a
//! strictly monotonic change number, an asynchronous master/slave
//! replication pipeline that ships those change records with bounded lag,
//! a thin cluster controller over the embedded consensus membership, and a
//! discovery service tracking per-shard region status across data centers.
//! [Author fengyang]
//!
//! ## Getting started
//!
//! ```rust
//! use dkv::error::CResult;
//! use dkv::store::{ChangeApplier, ChangePropagator, Store};
//!
//! fn main() {
//!     run().unwrap();
//! }
//!
//! fn run() -> CResult<()> {
//!     let mut master = Store::memory();
//!     master.put(b"hello", b"world".to_vec())?;
//!     master.put(b"hallo", b"welt".to_vec())?;
//!     master.delete(b"hallo")?;
//!
//!     // A fresh replica replays the master's change stream and converges.
//!     let mut slave = Store::memory();
//!     let records = master.load_changes(1, 100)?;
//!     let applied = slave.save_changes(&records)?;
//!
//!     assert_eq!(applied, master.latest_change_number());
//!     assert_eq!(slave.get(b"hello")?, Some(b"world".to_vec()));
//!     assert_eq!(slave.get(b"hallo")?, None);
//!
//!     Ok(())
//! }
//! ```

pub mod changes;
pub mod cluster;
pub mod discovery;
pub mod error;
pub mod replication;
pub mod router;
pub mod server;
pub mod storage;
pub mod store;

#[cfg(test)]
mod test {
    use crate::error::CResult;
    use crate::store::{ChangeApplier, ChangePropagator, Store};

    #[test]
    fn run() -> CResult<()> {
        let mut master = Store::memory();
        master.put(b"hello", b"world".to_vec())?;
        master.put(b"hallo", b"welt".to_vec())?;
        master.delete(b"hallo")?;

        let mut slave = Store::memory();
        let records = master.load_changes(1, 100)?;
        let applied = slave.save_changes(&records)?;

        assert_eq!(applied, master.latest_change_number());
        assert_eq!(slave.get(b"hello")?, Some(b"world".to_vec()));
        assert_eq!(slave.get(b"hallo")?, None);

        Ok(())
    }
}
