//! Annotator grouping by document assignment.
//!
//! Annotators who rated exactly the same set of documents form a group.
//! Groups are the atomic unit for every resampling procedure so that a
//! subsample keeps the blocked structure of the original design.

use itertools::Itertools;
use rand::Rng;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::annotations::AnnotationTable;

/// Annotators sharing an identical document set. Members are sorted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AnnotatorGroup {
    members: Vec<usize>,
}

impl AnnotatorGroup {
    pub fn new(mut members: Vec<usize>) -> Self {
        members.sort_unstable();
        members.dedup();
        Self { members }
    }

    pub fn members(&self) -> &[usize] {
        &self.members
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

/// Partition the annotators of `table` by their sorted unique document set.
///
/// Groups come back ordered by their smallest member.
pub fn get_annotator_groups(table: &AnnotationTable) -> Vec<AnnotatorGroup> {
    let mut documents: BTreeMap<usize, BTreeSet<usize>> = BTreeMap::new();
    for row in table.rows() {
        documents
            .entry(row.annotator)
            .or_default()
            .insert(row.document);
    }

    let mut by_fingerprint: HashMap<Vec<usize>, usize> = HashMap::new();
    let mut groups: Vec<Vec<usize>> = Vec::new();
    for (annotator, docs) in documents {
        let fingerprint: Vec<usize> = docs.into_iter().collect();
        let idx = *by_fingerprint.entry(fingerprint).or_insert_with(|| {
            groups.push(Vec::new());
            groups.len() - 1
        });
        groups[idx].push(annotator);
    }

    groups.into_iter().map(AnnotatorGroup::new).collect()
}

/// Map every annotator to the index of its group.
pub fn group_assignment(groups: &[AnnotatorGroup]) -> HashMap<usize, usize> {
    groups
        .iter()
        .enumerate()
        .flat_map(|(idx, g)| g.members().iter().map(move |&a| (a, idx)))
        .collect()
}

/// Annotators drawn from a selection of groups.
///
/// Crossed selections take every member; nested selections take one random
/// member per group.
pub fn select_members<'a, R: Rng + ?Sized>(
    groups: impl IntoIterator<Item = &'a AnnotatorGroup>,
    nested: bool,
    rng: &mut R,
) -> Vec<usize> {
    let mut selected = Vec::new();
    for group in groups {
        if nested {
            if let Some(&member) = group.members().choose(rng) {
                selected.push(member);
            }
        } else {
            selected.extend_from_slice(group.members());
        }
    }
    selected
}

/// A group-preserving subsample of an annotation table.
#[derive(Debug, Clone)]
pub struct GroupSample {
    pub table: AnnotationTable,
    pub annotator_count: usize,
}

/// Enumerate subsamples built from every `size`-combination of groups.
///
/// Combinations are produced lazily in lexicographic order of group index.
pub fn generate_samples<'a, R: Rng + ?Sized>(
    table: &'a AnnotationTable,
    groups: &'a [AnnotatorGroup],
    size: usize,
    nested: bool,
    rng: &'a mut R,
) -> impl Iterator<Item = GroupSample> + 'a {
    groups.iter().combinations(size).map(move |combo| {
        let annotators = select_members(combo, nested, rng);
        GroupSample {
            table: table.select_annotators(&annotators),
            annotator_count: annotators.len(),
        }
    })
}
