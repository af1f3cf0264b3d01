use std::collections::{BTreeMap, BTreeSet, VecDeque};

use serde::{Deserialize, Serialize};

use crate::fingerprint::Fingerprint;
use crate::lsh::{IndexError, LshIndex, LshParams};
use crate::minhash::MinHasher;

/// How far a cluster grows from its seed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum ClusterMode {
    /// Accepted members are expanded in turn: clusters are the connected
    /// components of "LSH candidate and within threshold".
    #[default]
    Transitive,
    /// Only direct neighbours of the seed join its cluster. Not
    /// threshold-monotone: a higher threshold can let an earlier seed claim
    /// an id and break up the cluster it used to seed.
    SingleHop,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Cluster {
    /// Ascending; the first entry is the seed.
    pub members: Vec<i64>,
}

impl Cluster {
    pub fn is_duplicate(&self) -> bool {
        self.members.len() > 1
    }
}

pub fn build_index(
    params: LshParams,
    hasher: &MinHasher,
    fingerprints: &BTreeMap<i64, Fingerprint>,
) -> Result<LshIndex, IndexError> {
    let mut index = LshIndex::new(params);
    for (id, fp) in fingerprints {
        index.insert(*id, &hasher.signature(fp))?;
    }
    Ok(index)
}

/// Partition `fingerprints` into clusters. Ids are seeded in ascending order
/// and candidates are always confirmed with the exact Hamming distance.
pub fn build_clusters(
    fingerprints: &BTreeMap<i64, Fingerprint>,
    hasher: &MinHasher,
    index: &LshIndex,
    threshold: u32,
    mode: ClusterMode,
) -> Result<Vec<Cluster>, IndexError> {
    let mut visited: BTreeSet<i64> = BTreeSet::new();
    let mut clusters = Vec::new();

    for &seed in fingerprints.keys() {
        if !visited.insert(seed) {
            continue;
        }
        let mut members = vec![seed];
        let mut frontier = VecDeque::from([seed]);

        while let Some(current) = frontier.pop_front() {
            let current_fp = fingerprints[&current];
            for candidate in index.query(&hasher.signature(&current_fp))? {
                if visited.contains(&candidate) {
                    continue;
                }
                let Some(fp) = fingerprints.get(&candidate) else { continue };
                if current_fp.distance(fp) <= threshold {
                    visited.insert(candidate);
                    members.push(candidate);
                    if mode == ClusterMode::Transitive {
                        frontier.push_back(candidate);
                    }
                }
            }
        }

        members.sort_unstable();
        clusters.push(Cluster { members });
    }

    Ok(clusters)
}
