use crate::model::{Resource, ResourceId, ResourceKind};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};

/// How a predicate constrains a resource's episode set.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum EpisodeRule {
    #[default]
    Any,
    /// Every listed episode is present on the resource.
    Contains(BTreeSet<u32>),
    /// The resource's episode set equals the listed set.
    Exactly(BTreeSet<u32>),
}

impl EpisodeRule {
    fn matches(&self, episodes: &BTreeSet<u32>) -> bool {
        match self {
            EpisodeRule::Any => true,
            EpisodeRule::Contains(want) => want.is_subset(episodes),
            EpisodeRule::Exactly(want) => want == episodes,
        }
    }
}

/// Selection rule for one bundle group.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct BundlePredicate {
    pub name: String,
    #[serde(default)]
    pub required_tags: BTreeSet<String>,
    #[serde(default)]
    pub excluded_tags: BTreeSet<String>,
    #[serde(default)]
    pub episodes: EpisodeRule,
    /// Only resources without any tag match.
    #[serde(default)]
    pub require_no_tags: bool,
    /// Only resources without any episode match.
    #[serde(default)]
    pub require_no_episodes: bool,
}

impl BundlePredicate {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn require_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required_tags.extend(tags.into_iter().map(Into::into));
        self
    }

    pub fn exclude_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.excluded_tags.extend(tags.into_iter().map(Into::into));
        self
    }

    pub fn episodes(mut self, rule: EpisodeRule) -> Self {
        self.episodes = rule;
        self
    }

    pub fn matches(&self, resource: &Resource) -> bool {
        if self.require_no_tags && !resource.tags.is_empty() {
            return false;
        }
        if self.require_no_episodes && !resource.episodes.is_empty() {
            return false;
        }
        self.required_tags.is_subset(&resource.tags)
            && self.excluded_tags.is_disjoint(&resource.tags)
            && self.episodes.matches(&resource.episodes)
    }
}

/// Resources matched by one predicate, in input order.
#[derive(Debug, Clone)]
pub struct BundleGroup<'a> {
    pub predicate: &'a BundlePredicate,
    pub members: Vec<&'a Resource>,
}

impl BundleGroup<'_> {
    pub fn name(&self) -> &str {
        &self.predicate.name
    }

    pub fn ids(&self) -> Vec<ResourceId> {
        self.members.iter().map(|r| r.id).collect()
    }
}

/// Partitions image resources by `predicates`, one group per predicate in declaration order.
///
/// With `dedup`, a resource claimed by an earlier predicate is not offered to later ones.
pub fn group<'a>(
    resources: &'a [Resource],
    predicates: &'a [BundlePredicate],
    dedup: bool,
) -> Vec<BundleGroup<'a>> {
    let mut claimed: HashSet<ResourceId> = HashSet::new();
    let mut groups = Vec::with_capacity(predicates.len());
    for predicate in predicates {
        let members: Vec<&Resource> = resources
            .iter()
            .filter(|r| r.kind == ResourceKind::Image)
            .filter(|r| !(dedup && claimed.contains(&r.id)))
            .filter(|r| predicate.matches(r))
            .collect();
        if dedup {
            claimed.extend(members.iter().map(|r| r.id));
        }
        groups.push(BundleGroup { predicate, members });
    }
    groups
}
