//! Cluster membership, itself stored as a variable.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use cairn_core::{CodecError, Positions, RmId, TxnId, VarIdPos, VarUuid, codec};

/// The root object reference carried with a topology.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RootVar {
    pub uuid: Option<VarUuid>,
    pub positions: Option<Positions>,
}

/// Cluster membership and placement. The body (version, hosts, members)
/// is what goes into the topology variable's value; the database version
/// and root reference travel in the transaction itself.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Topology {
    pub version: u32,
    pub hosts: Vec<String>,
    pub all_rms: Vec<RmId>,
    /// The txn id of the last committed topology write.
    pub db_version: TxnId,
    pub root: RootVar,
}

#[derive(Serialize, Deserialize)]
struct TopologyBody {
    version: u32,
    hosts: Vec<String>,
    all_rms: Vec<RmId>,
}

impl Topology {
    /// The blank topology of a cluster that has never committed one.
    #[must_use]
    pub fn blank(hosts: Vec<String>) -> Self {
        Self {
            version: 1,
            hosts,
            all_rms: Vec::new(),
            db_version: TxnId::from_bytes([0; 16]),
            root: RootVar::default(),
        }
    }

    #[must_use]
    pub fn contains(&self, rm_id: RmId) -> bool {
        self.all_rms.contains(&rm_id)
    }

    /// The write quorum size for this membership.
    #[must_use]
    pub fn f_inc(&self) -> usize {
        self.hosts.len() / 2 + 1
    }

    pub fn serialize(&self) -> Result<Bytes, CodecError> {
        codec::encode(&TopologyBody {
            version: self.version,
            hosts: self.hosts.clone(),
            all_rms: self.all_rms.clone(),
        })
    }

    pub fn deserialize(
        db_version: TxnId,
        root: Option<&VarIdPos>,
        value: &[u8],
    ) -> Result<Self, CodecError> {
        let body: TopologyBody = codec::decode(value)?;
        Ok(Self {
            version: body.version,
            hosts: body.hosts,
            all_rms: body.all_rms,
            db_version,
            root: RootVar {
                uuid: root.map(|r| r.id),
                positions: root.map(|r| r.positions.clone()),
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn body_round_trips_with_txn_carried_fields_reattached() {
        let mut topology = Topology::blank(vec!["a:1".into(), "b:2".into(), "c:3".into()]);
        topology.all_rms = vec![RmId(1), RmId(2)];
        let value = topology.serialize().unwrap();

        let db_version = TxnId::new(9, 0, RmId(1));
        let root = VarIdPos {
            id: cairn_core::ROOT_VAR_UUID,
            positions: Positions(vec![0, 1]),
        };
        let parsed = Topology::deserialize(db_version, Some(&root), &value).unwrap();
        assert_eq!(parsed.hosts, topology.hosts);
        assert_eq!(parsed.all_rms, topology.all_rms);
        assert_eq!(parsed.db_version, db_version);
        assert_eq!(parsed.root.uuid, Some(cairn_core::ROOT_VAR_UUID));
    }

    #[test]
    fn f_inc_is_a_majority_of_hosts() {
        assert_eq!(Topology::blank(vec!["a".into()]).f_inc(), 1);
        assert_eq!(Topology::blank(vec!["a".into(), "b".into()]).f_inc(), 2);
        assert_eq!(
            Topology::blank(vec!["a".into(), "b".into(), "c".into()]).f_inc(),
            2
        );
    }
}
