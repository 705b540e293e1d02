//! Read preference and server-selection predicates (§4.7).

use std::{collections::HashMap, sync::Arc, time::Duration};

use crate::{
    error::{ErrorKind, Result},
    sdam::description::{ServerDescription, ServerType, TopologyDescription, TopologyType},
};

/// A set of tags a replica-set member must carry for `TagSet`-filtered read preferences.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TagSet(pub HashMap<String, String>);

impl TagSet {
    pub fn parse(s: &str) -> Self {
        let map = s
            .split(',')
            .filter_map(|pair| pair.split_once(':'))
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        TagSet(map)
    }

    fn matches(&self, tags: &HashMap<String, String>) -> bool {
        self.0.iter().all(|(k, v)| tags.get(k) == Some(v))
    }
}

/// The five standard read preference modes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReadPreference {
    Primary,
    PrimaryPreferred {
        tag_sets: Vec<TagSet>,
        max_staleness: Option<Duration>,
    },
    Secondary {
        tag_sets: Vec<TagSet>,
        max_staleness: Option<Duration>,
    },
    SecondaryPreferred {
        tag_sets: Vec<TagSet>,
        max_staleness: Option<Duration>,
    },
    Nearest {
        tag_sets: Vec<TagSet>,
        max_staleness: Option<Duration>,
    },
}

impl ReadPreference {
    pub fn parse(mode: &str) -> Result<Self> {
        Ok(match mode {
            "primary" => ReadPreference::Primary,
            "primaryPreferred" => ReadPreference::PrimaryPreferred {
                tag_sets: Vec::new(),
                max_staleness: None,
            },
            "secondary" => ReadPreference::Secondary {
                tag_sets: Vec::new(),
                max_staleness: None,
            },
            "secondaryPreferred" => ReadPreference::SecondaryPreferred {
                tag_sets: Vec::new(),
                max_staleness: None,
            },
            "nearest" => ReadPreference::Nearest {
                tag_sets: Vec::new(),
                max_staleness: None,
            },
            other => {
                return Err(ErrorKind::InvalidArgument {
                    message: format!("unknown read preference mode: {other}"),
                }
                .into())
            }
        })
    }

    fn tag_sets(&self) -> &[TagSet] {
        match self {
            ReadPreference::Primary => &[],
            ReadPreference::PrimaryPreferred { tag_sets, .. }
            | ReadPreference::Secondary { tag_sets, .. }
            | ReadPreference::SecondaryPreferred { tag_sets, .. }
            | ReadPreference::Nearest { tag_sets, .. } => tag_sets,
        }
    }
}

/// A pure predicate over the topology, the unit of composition for server selection (§4.7).
/// Boxed behind an `Arc<dyn Fn>` rather than a trait object method so closures (tests, composite
/// selectors) can be built without a dedicated type per predicate.
pub type Predicate = Arc<dyn Fn(&TopologyDescription, &[ServerDescription]) -> Vec<ServerDescription> + Send + Sync>;

#[derive(Clone)]
pub enum SelectionCriteria {
    ReadPreference(ReadPreference),
    Predicate(Predicate),
}

impl std::fmt::Debug for SelectionCriteria {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SelectionCriteria::ReadPreference(rp) => write!(f, "ReadPreference({rp:?})"),
            SelectionCriteria::Predicate(_) => write!(f, "Predicate(..)"),
        }
    }
}

impl SelectionCriteria {
    /// A selector accepting only the current primary, or any mongos/standalone in a topology
    /// that has no concept of a primary (§4.7 `WriteSelector`).
    pub fn write() -> Self {
        SelectionCriteria::Predicate(Arc::new(|topology, candidates| {
            match topology.kind {
                TopologyType::Sharded => candidates.to_vec(),
                _ => candidates
                    .iter()
                    .filter(|s| s.server_type == ServerType::RSPrimary || s.server_type == ServerType::Standalone)
                    .cloned()
                    .collect(),
            }
        }))
    }

    /// Intersects `selectors` left-to-right: each selector in turn narrows the candidate list the
    /// previous one produced, so the result matches every selector at once (§4.7
    /// `CompositeSelector`). Short-circuits once the candidate list is empty.
    pub fn composite(selectors: Vec<SelectionCriteria>) -> Self {
        SelectionCriteria::Predicate(Arc::new(move |topology, candidates| {
            let mut current = candidates.to_vec();
            for selector in &selectors {
                if current.is_empty() {
                    break;
                }
                current = selector.select(topology, &current);
            }
            current
        }))
    }

    pub(crate) fn select(
        &self,
        topology: &TopologyDescription,
        candidates: &[ServerDescription],
    ) -> Vec<ServerDescription> {
        match self {
            SelectionCriteria::ReadPreference(rp) => select_by_read_preference(rp, topology, candidates),
            SelectionCriteria::Predicate(f) => f(topology, candidates),
        }
    }
}

fn select_by_read_preference(
    rp: &ReadPreference,
    topology: &TopologyDescription,
    candidates: &[ServerDescription],
) -> Vec<ServerDescription> {
    // Outside a replica set, every mode other than explicit exclusion matches any data-bearing
    // server; read preference only meaningfully discriminates within a replica set.
    if topology.kind != TopologyType::ReplicaSetWithPrimary
        && topology.kind != TopologyType::ReplicaSetNoPrimary
    {
        return candidates.to_vec();
    }

    let primaries: Vec<ServerDescription> = candidates
        .iter()
        .filter(|s| s.server_type == ServerType::RSPrimary)
        .cloned()
        .collect();
    let secondaries: Vec<ServerDescription> = candidates
        .iter()
        .filter(|s| s.server_type == ServerType::RSSecondary)
        .filter(|s| rp.tag_sets().is_empty() || rp.tag_sets().iter().any(|ts| ts.matches(&s.tags)))
        .cloned()
        .collect();

    match rp {
        ReadPreference::Primary => primaries,
        ReadPreference::PrimaryPreferred { .. } => {
            if !primaries.is_empty() {
                primaries
            } else {
                secondaries
            }
        }
        ReadPreference::Secondary { .. } => secondaries,
        ReadPreference::SecondaryPreferred { .. } => {
            if !secondaries.is_empty() {
                secondaries
            } else {
                primaries
            }
        }
        ReadPreference::Nearest { .. } => {
            let mut all = primaries;
            all.extend(secondaries);
            all
        }
    }
}

/// Filters `candidates` down to those within `localThreshold` of the fastest RTT observed among
/// them (§4.7 `LatencySelector`).
pub(crate) fn apply_latency_window(
    candidates: Vec<ServerDescription>,
    local_threshold: Duration,
) -> Vec<ServerDescription> {
    let min_rtt = candidates
        .iter()
        .filter_map(|s| s.average_rtt)
        .min();
    let Some(min_rtt) = min_rtt else {
        return candidates;
    };
    candidates
        .into_iter()
        .filter(|s| match s.average_rtt {
            Some(rtt) => rtt <= min_rtt + local_threshold,
            None => false,
        })
        .collect()
}

#[cfg(test)]
mod test {
    use super::*;

    fn desc(server_type: ServerType, rtt_ms: u64) -> ServerDescription {
        let mut d = ServerDescription::unknown(crate::options::ServerAddress::Tcp {
            host: "h".into(),
            port: 27017,
        });
        d.server_type = server_type;
        d.average_rtt = Some(Duration::from_millis(rtt_ms));
        d
    }

    #[test]
    fn latency_window_keeps_only_near_servers() {
        let candidates = vec![desc(ServerType::RSSecondary, 5), desc(ServerType::RSSecondary, 50)];
        let kept = apply_latency_window(candidates, Duration::from_millis(15));
        assert_eq!(kept.len(), 1);
    }

    #[test]
    fn tag_set_matches_subset() {
        let ts = TagSet::parse("dc:east,rack:1");
        let mut tags = HashMap::new();
        tags.insert("dc".to_string(), "east".to_string());
        tags.insert("rack".to_string(), "1".to_string());
        tags.insert("extra".to_string(), "x".to_string());
        assert!(ts.matches(&tags));
    }

    fn topology(kind: TopologyType) -> TopologyDescription {
        let options = crate::options::parse("mongodb://localhost/").unwrap();
        let mut desc = TopologyDescription::new(&options);
        desc.kind = kind;
        desc
    }

    #[test]
    fn composite_intersects_selectors_left_to_right() {
        let near: SelectionCriteria = SelectionCriteria::Predicate(Arc::new(|_topology, candidates| {
            apply_latency_window(candidates.to_vec(), Duration::from_millis(15))
        }));
        let secondaries_only: SelectionCriteria = SelectionCriteria::Predicate(Arc::new(|_topology, candidates| {
            candidates
                .iter()
                .filter(|s| s.server_type == ServerType::RSSecondary)
                .cloned()
                .collect()
        }));

        let candidates = vec![
            desc(ServerType::RSPrimary, 5),
            desc(ServerType::RSSecondary, 5),
            desc(ServerType::RSSecondary, 50),
        ];
        let composite = SelectionCriteria::composite(vec![near, secondaries_only]);
        let topology = topology(TopologyType::ReplicaSetWithPrimary);

        let matched = composite.select(&topology, &candidates);
        assert_eq!(matched.len(), 1);
        assert_eq!(matched[0].server_type, ServerType::RSSecondary);
        assert_eq!(matched[0].average_rtt, Some(Duration::from_millis(5)));
    }

    #[test]
    fn composite_short_circuits_once_empty() {
        let none: SelectionCriteria = SelectionCriteria::Predicate(Arc::new(|_topology, _candidates| Vec::new()));
        let panics_if_called: SelectionCriteria =
            SelectionCriteria::Predicate(Arc::new(|_topology, _candidates| panic!("should not be reached")));

        let candidates = vec![desc(ServerType::RSSecondary, 5)];
        let composite = SelectionCriteria::composite(vec![none, panics_if_called]);
        let topology = topology(TopologyType::ReplicaSetWithPrimary);

        assert!(composite.select(&topology, &candidates).is_empty());
    }
}
