//! meshkv — a distributed, in-memory key-value cache.
//!
//! Peers discover each other through gossip and split a single logical
//! keyspace by hash slot. Any node accepts `get`/`set`/`delete` for any key;
//! non-local operations are micro-batched and forwarded to the key's owner
//! over a MsgPack RPC transport.

pub mod batcher;
pub mod bytespool;
pub mod cluster;
pub mod discovery;
pub mod rpc;
pub mod store;

pub use cluster::{
    Cluster, ClusterConfig, ClusterError, DeleteError, GetError, KeyOwnerError, Member,
    MemberList, MemberListConfig, NodeAddress, SetError, SlotRange, slot,
};
pub use discovery::{Discovery, Endpoint, Localhost};
pub use rpc::{Client, Codec, MsgpackCodec, Server};
pub use store::{Store, StoreConfig, StoreError};
