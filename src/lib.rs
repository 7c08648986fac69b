pub mod config;
pub mod consistent;
pub mod error;
pub mod freshness;
pub mod gossip;
pub mod item;
pub mod messages;
pub mod registry;
pub mod stm;
pub mod store;
pub mod transport;
pub mod types;
pub mod vector;
pub mod versioned;

pub use config::{DirectMailMode, GossipConfig};
pub use consistent::{
    ConsistentNode, ConsistentTx, PreparedTransaction, ReadStamp, TransactionInfo, TxChange,
    TRANSACTION_PREFIX,
};
pub use error::{Error, Result};
pub use item::ItemInfo;
pub use messages::Message;
pub use registry::Registry;
pub use stm::{atomic, retry, Tx, TxCell, TxDict, TxLocal};
pub use store::{ChangedEvent, GossipNode, NodeStatus};
pub use transport::Transport;
pub use types::{Mergeable, Relationship, ServerId, VersionHash};
pub use vector::{
    CountVector, TransactionState, TransactionVector, Vector, VectorClock, VectorItem, VectorValue,
};
pub use versioned::{Multiple, Versioned};

#[cfg(test)]
mod tests;
