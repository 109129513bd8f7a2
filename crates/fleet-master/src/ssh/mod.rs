//! Bidirectional SSH trust subsystem
//!
//! Two independently owned roles: the key store holds device public keys
//! so SUTs can reach the Master, and the master key manager owns the
//! Master's single identity for reaching any SUT. The directions are
//! asymmetric on purpose — device keys arrive over the already-open
//! control-plane connection, while the Master's key is pushed out and
//! confirmed by explicit device acknowledgment.

mod key_store;
mod master_key;
mod remote;

pub use key_store::{KeyRegistration, KeyStore, TrustedKey};
pub use master_key::{MasterKeyInfo, MasterKeyManager, MASTER_KEY_NAME};
pub use remote::{ExecOutput, RemoteShell};
