//! Metadata aggregation.
//!
//! Decodes every changed archive in parallel and splits each result into
//! the scalar record, the four-level group path, and the relation name
//! lists. Everything the batch refers to is merged into one
//! [`PendingForeignKeys`], deduplicated, with forward counts max-reduced.
//! Decode failures are set aside and take no part in later phases.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use rayon::prelude::*;

use crate::metadata::{ComicFields, ComicMetadata, MetadataDecoder};
use crate::model::{CreditKey, GroupLevel, GroupName, NamedKind, StatTuple};

/// Group names from the publisher down to one level, inclusive.
pub type GroupPath = Vec<GroupName>;

/// A decoded comic, ready to be written once its keys are resolved.
#[derive(Debug, Clone, PartialEq)]
pub struct ComicRecord {
    pub path: PathBuf,
    pub name: String,
    pub stat: Option<StatTuple>,
    pub fields: ComicFields,
    /// Publisher, imprint, series, volume
    pub groups: [GroupName; 4],
}

impl ComicRecord {
    /// The group path identifying this comic's group at `level`.
    pub fn group_path(&self, level: GroupLevel) -> GroupPath {
        self.groups[..=level as usize].to_vec()
    }

    pub fn size(&self) -> i64 {
        self.stat.map(|s| s.size as i64).unwrap_or(0)
    }
}

/// Relation names of one comic.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelationLists {
    pub named: BTreeMap<NamedKind, BTreeSet<String>>,
    pub credits: BTreeSet<CreditKey>,
}

/// A path that failed to decode.
#[derive(Debug, Clone, PartialEq)]
pub struct FailedRecord {
    pub path: PathBuf,
    pub name: String,
    pub stat: Option<StatTuple>,
    pub reason: String,
}

/// Every entity a batch refers to, before knowing which exist.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PendingForeignKeys {
    /// Group path to the largest forward count seen (series and volumes)
    pub groups: BTreeMap<GroupPath, Option<i64>>,
    pub named: BTreeMap<NamedKind, BTreeSet<String>>,
    pub credits: BTreeSet<CreditKey>,
    pub folders: BTreeSet<PathBuf>,
}

impl PendingForeignKeys {
    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
            && self.named.values().all(BTreeSet::is_empty)
            && self.credits.is_empty()
            && self.folders.is_empty()
    }

    pub fn add_group(&mut self, path: GroupPath, count: Option<i64>) {
        let entry = self.groups.entry(path).or_insert(None);
        *entry = (*entry).max(count);
    }

    /// Add a decoded comic's groups and relations.
    pub fn add_comic(&mut self, record: &ComicRecord, relations: &RelationLists, counts: GroupCounts) {
        for level in GroupLevel::ALL {
            let count = match level {
                GroupLevel::Series => counts.series_volume_count,
                GroupLevel::Volume => counts.volume_issue_count,
                _ => None,
            };
            self.add_group(record.group_path(level), count);
        }
        for (kind, names) in &relations.named {
            self.named
                .entry(*kind)
                .or_default()
                .extend(names.iter().cloned());
        }
        self.credits.extend(relations.credits.iter().cloned());
    }

    /// Add every folder between `root` (exclusive) and `path` (exclusive).
    pub fn add_ancestors(&mut self, root: &Path, path: &Path) {
        self.folders.extend(ancestors(root, path));
    }

    /// Distinct credit person names.
    pub fn persons(&self) -> BTreeSet<String> {
        self.credits.iter().map(|c| c.person.clone()).collect()
    }

    /// Distinct credit role names.
    pub fn roles(&self) -> BTreeSet<String> {
        self.credits.iter().filter_map(|c| c.role.clone()).collect()
    }
}

/// Forward counts reported by one comic.
#[derive(Debug, Clone, Copy, Default)]
pub struct GroupCounts {
    pub series_volume_count: Option<i64>,
    pub volume_issue_count: Option<i64>,
}

/// Folders strictly between `root` and `path`, nearest first.
pub fn ancestors(root: &Path, path: &Path) -> Vec<PathBuf> {
    path.ancestors()
        .skip(1)
        .take_while(|a| *a != root && a.starts_with(root))
        .map(Path::to_path_buf)
        .collect()
}

/// The aggregated result of decoding a batch.
#[derive(Debug, Default)]
pub struct Aggregate {
    pub records: BTreeMap<PathBuf, ComicRecord>,
    pub relations: BTreeMap<PathBuf, RelationLists>,
    pub pending: PendingForeignKeys,
    pub failed: BTreeMap<PathBuf, FailedRecord>,
}

enum Outcome {
    Decoded(ComicRecord, RelationLists, GroupCounts),
    Failed(FailedRecord),
}

/// Decode `paths` in parallel and merge the results.
///
/// `extra_paths` are entries that are not decoded but whose ancestor
/// folders must exist, such as move destinations.
pub fn aggregate(
    decoder: &dyn MetadataDecoder,
    root: &Path,
    paths: &BTreeSet<PathBuf>,
    extra_paths: &BTreeSet<PathBuf>,
) -> Aggregate {
    let outcomes: Vec<Outcome> = paths.par_iter().map(|p| decode_one(decoder, p)).collect();

    let mut agg = Aggregate::default();
    for outcome in outcomes {
        match outcome {
            Outcome::Decoded(record, relations, counts) => {
                agg.pending.add_comic(&record, &relations, counts);
                agg.pending.add_ancestors(root, &record.path);
                agg.relations.insert(record.path.clone(), relations);
                agg.records.insert(record.path.clone(), record);
            }
            Outcome::Failed(failed) => {
                tracing::debug!(target: "importer", path = %failed.path.display(), reason = %failed.reason, "Decode failed");
                agg.pending.add_ancestors(root, &failed.path);
                agg.failed.insert(failed.path.clone(), failed);
            }
        }
    }
    for path in extra_paths {
        agg.pending.add_ancestors(root, path);
    }
    agg
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn decode_one(decoder: &dyn MetadataDecoder, path: &Path) -> Outcome {
    let stat = StatTuple::from_path(path).ok();
    match decoder.decode(path) {
        Ok(meta) => {
            let (record, relations, counts) = split(path, stat, meta);
            Outcome::Decoded(record, relations, counts)
        }
        Err(e) => Outcome::Failed(FailedRecord {
            path: path.to_path_buf(),
            name: file_name(path),
            stat,
            reason: e.reason(),
        }),
    }
}

fn clean_names(names: Vec<String>) -> BTreeSet<String> {
    names
        .into_iter()
        .map(|n| n.trim().to_string())
        .filter(|n| !n.is_empty())
        .collect()
}

/// Split decoder output into record fields, group path and relations.
pub fn split(
    path: &Path,
    stat: Option<StatTuple>,
    meta: ComicMetadata,
) -> (ComicRecord, RelationLists, GroupCounts) {
    let groups = [
        GroupName::from_metadata(GroupLevel::Publisher, meta.publisher.as_deref()),
        GroupName::from_metadata(GroupLevel::Imprint, meta.imprint.as_deref()),
        GroupName::from_metadata(GroupLevel::Series, meta.series.as_deref()),
        GroupName::from_metadata(GroupLevel::Volume, meta.volume.as_deref()),
    ];

    let mut named = BTreeMap::new();
    for (kind, names) in [
        (NamedKind::Tag, meta.tags),
        (NamedKind::Character, meta.characters),
        (NamedKind::Genre, meta.genres),
        (NamedKind::Location, meta.locations),
        (NamedKind::Team, meta.teams),
        (NamedKind::StoryArc, meta.story_arcs),
        (NamedKind::SeriesGroup, meta.series_groups),
    ] {
        let names = clean_names(names);
        if !names.is_empty() {
            named.insert(kind, names);
        }
    }

    let credits = meta
        .credits
        .into_iter()
        .filter_map(|c| {
            let person = c.person.trim();
            if person.is_empty() {
                return None;
            }
            let role = c.role.map(|r| r.trim().to_string()).filter(|r| !r.is_empty());
            Some(CreditKey::new(person, role))
        })
        .collect();

    // Counts must be positive to mean anything
    let counts = GroupCounts {
        series_volume_count: meta.series_volume_count.filter(|c| *c > 0),
        volume_issue_count: meta.volume_issue_count.filter(|c| *c > 0),
    };

    let record = ComicRecord {
        path: path.to_path_buf(),
        name: file_name(path),
        stat,
        fields: meta.fields,
        groups,
    };
    (record, RelationLists { named, credits }, counts)
}
