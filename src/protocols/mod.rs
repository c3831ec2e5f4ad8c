//! QuorumKV's replication protocols.

pub mod pbft;
