//! Fixed-width identifiers with total ordering.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Replica manager identifier.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RmId(pub u32);

impl fmt::Debug for RmId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "rm{}", self.0)
    }
}

impl fmt::Display for RmId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "rm{}", self.0)
    }
}

/// Process boot counter. Zero marks a passive allocation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BootCount(pub u32);

impl BootCount {
    pub const PASSIVE: BootCount = BootCount(0);

    #[must_use]
    pub fn is_active(self) -> bool {
        self.0 != 0
    }
}

/// Variable uuid: 16 opaque bytes with total ordering.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct VarUuid([u8; 16]);

/// The variable holding cluster membership.
pub const TOPOLOGY_VAR_UUID: VarUuid = VarUuid([0; 16]);

/// The root object every client navigates from.
pub const ROOT_VAR_UUID: VarUuid = VarUuid([0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1]);

impl VarUuid {
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl AsRef<[u8]> for VarUuid {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for VarUuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v:{}", bs58::encode(&self.0[8..]).into_string())
    }
}

impl fmt::Display for VarUuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Transaction id: 16 opaque bytes with total ordering.
///
/// Layout: bytes 0..8 are the submitter's unique payload, 8..12 the
/// big-endian connection number, 12..16 the big-endian submitter [`RmId`].
/// The trailing eight bytes therefore identify the submitting client.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TxnId([u8; 16]);

impl TxnId {
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    #[must_use]
    pub fn new(unique: u64, connection: u32, submitter: RmId) -> Self {
        let mut bytes = [0u8; 16];
        bytes[..8].copy_from_slice(&unique.to_be_bytes());
        bytes[8..12].copy_from_slice(&connection.to_be_bytes());
        bytes[12..].copy_from_slice(&submitter.0.to_be_bytes());
        Self(bytes)
    }

    #[must_use]
    pub fn submitter(&self) -> RmId {
        let mut raw = [0u8; 4];
        raw.copy_from_slice(&self.0[12..]);
        RmId(u32::from_be_bytes(raw))
    }

    #[must_use]
    pub fn connection(&self) -> u32 {
        let mut raw = [0u8; 4];
        raw.copy_from_slice(&self.0[8..12]);
        u32::from_be_bytes(raw)
    }

    /// The subscriber identity of the client that submitted this txn.
    #[must_use]
    pub fn client_id(&self) -> ClientId {
        ClientId {
            rm_id: self.submitter(),
            connection: self.connection(),
        }
    }
}

impl AsRef<[u8]> for TxnId {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for TxnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "t:{}", bs58::encode(&self.0[..8]).into_string())
    }
}

impl fmt::Display for TxnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// A client subscribed to variable writes: the connection of a submitter
/// on its home replica manager.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ClientId {
    pub rm_id: RmId,
    pub connection: u32,
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/c{}", self.rm_id, self.connection)
    }
}

/// Replica placement hint carried on Var records and references.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Positions(pub Vec<u8>);

impl Positions {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}
