use conode_crypto::{bft_threshold, point_to_bytes, Hash256, Point};
use serde::{Deserialize, Serialize};

/// Identifier of a server: SHA-256 of its compressed public key.
pub type ServerId = Hash256;

/// Public identity of a conode.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerIdentity {
    pub id: ServerId,
    pub public: Point,
    /// Routing address on the transport
    pub address: String,
    pub description: String,
}

impl ServerIdentity {
    pub fn new(public: Point, address: impl Into<String>) -> Self {
        ServerIdentity {
            id: Hash256::digest(&point_to_bytes(&public)),
            public,
            address: address.into(),
            description: String::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

/// Ordered list of servers authorized for a chain or a protocol round.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Roster {
    pub id: Hash256,
    pub list: Vec<ServerIdentity>,
    /// Sum of all public keys
    pub aggregate: Point,
}

impl Roster {
    pub fn new(list: Vec<ServerIdentity>) -> Self {
        let id = Self::compute_id(&list);
        let aggregate = list.iter().map(|si| si.public).sum();
        Roster { id, list, aggregate }
    }

    pub fn compute_id(list: &[ServerIdentity]) -> Hash256 {
        let bytes: Vec<u8> = list
            .iter()
            .flat_map(|si| point_to_bytes(&si.public))
            .collect();
        Hash256::digest(&bytes)
    }

    /// True when id and aggregate match the member list.
    pub fn is_consistent(&self) -> bool {
        let aggregate: Point = self.list.iter().map(|si| si.public).sum();
        self.id == Self::compute_id(&self.list) && self.aggregate == aggregate
    }

    pub fn len(&self) -> usize {
        self.list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }

    pub fn search(&self, id: &ServerId) -> Option<(usize, &ServerIdentity)> {
        self.list.iter().enumerate().find(|(_, si)| &si.id == id)
    }

    pub fn contains(&self, id: &ServerId) -> bool {
        self.search(id).is_some()
    }

    pub fn index_of_public(&self, public: &Point) -> Option<usize> {
        self.list.iter().position(|si| &si.public == public)
    }

    pub fn publics(&self) -> Vec<Point> {
        self.list.iter().map(|si| si.public).collect()
    }

    /// Byzantine quorum for this roster.
    pub fn threshold(&self) -> usize {
        bft_threshold(self.len())
    }

    /// Members of `self` followed by the members of `other` not yet present.
    pub fn concat(&self, other: &Roster) -> Roster {
        let mut list = self.list.clone();
        for si in &other.list {
            if !list.iter().any(|known| known.id == si.id) {
                list.push(si.clone());
            }
        }
        Roster::new(list)
    }
}
