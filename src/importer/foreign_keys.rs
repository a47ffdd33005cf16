//! Foreign-key resolution and creation.
//!
//! Given a batch's [`PendingForeignKeys`], find which groups, named
//! entities, credits and folders are not stored yet, create them in
//! dependency order, and load the ids every later phase needs.
//!
//! Every lookup binds at most `cap` parameters per statement. Groups are
//! resolved one level at a time, each level scoped by its parents' ids;
//! folders are created breadth first so a parent always exists before its
//! children. Existing series and volumes whose observed count exceeds the
//! stored one get a count-only update. Running the same pending set twice
//! creates nothing the second time.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};

use sqlx::{QueryBuilder, Sqlite, SqliteConnection, SqlitePool};

use super::aggregate::{GroupPath, PendingForeignKeys};
use super::batches;
use crate::db::path_str;
use crate::error::{Result, ResultExt};
use crate::model::{CreditKey, GroupLevel, GroupName, GroupRow, NamedKind, StatTuple};

/// What a pending set refers to that is not stored yet.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MissingForeignKeys {
    /// Groups to create, with the count to store
    pub groups: BTreeMap<GroupPath, Option<i64>>,
    /// Existing series or volumes whose count must rise: (level, id) to count
    pub count_updates: BTreeMap<(GroupLevel, i64), i64>,
    pub named: BTreeMap<NamedKind, BTreeSet<String>>,
    pub persons: BTreeSet<String>,
    pub roles: BTreeSet<String>,
    pub credits: BTreeSet<CreditKey>,
    pub folders: BTreeSet<PathBuf>,
}

impl MissingForeignKeys {
    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
            && self.count_updates.is_empty()
            && self.named.values().all(BTreeSet::is_empty)
            && self.persons.is_empty()
            && self.roles.is_empty()
            && self.credits.is_empty()
            && self.folders.is_empty()
    }

    /// Number of rows to create or update.
    pub fn len(&self) -> usize {
        self.groups.len()
            + self.count_updates.len()
            + self.named.values().map(BTreeSet::len).sum::<usize>()
            + self.persons.len()
            + self.roles.len()
            + self.credits.len()
            + self.folders.len()
    }
}

/// Ids of everything a batch refers to.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolvedKeys {
    pub groups: HashMap<GroupPath, i64>,
    pub named: HashMap<NamedKind, HashMap<String, i64>>,
    pub credits: HashMap<CreditKey, i64>,
    pub folders: HashMap<PathBuf, i64>,
}

// ============================================================================
// Lookups
// ============================================================================

/// Stored groups for `paths`, with their current count.
///
/// A path whose parent is not stored is simply absent from the result.
async fn lookup_groups(
    conn: &mut SqliteConnection,
    paths: &BTreeSet<GroupPath>,
    cap: usize,
) -> Result<HashMap<GroupPath, (i64, Option<i64>)>> {
    let mut found: HashMap<GroupPath, (i64, Option<i64>)> = HashMap::new();

    for level in GroupLevel::ALL {
        let depth = level as usize + 1;
        let at_level: Vec<&GroupPath> = paths.iter().filter(|p| p.len() == depth).collect();
        if at_level.is_empty() {
            continue;
        }

        let rows = match level.parent_column() {
            None => {
                let names: Vec<String> = at_level
                    .iter()
                    .map(|p| p[0].name.clone())
                    .collect::<BTreeSet<_>>()
                    .into_iter()
                    .collect();
                let mut rows = Vec::new();
                for chunk in batches(&names, cap, 1, 0) {
                    let mut qb = QueryBuilder::<Sqlite>::new(
                        "SELECT id, NULL AS parent_id, name, is_default, NULL AS count \
                         FROM publishers WHERE name IN (",
                    );
                    let mut sep = qb.separated(", ");
                    for name in chunk {
                        sep.push_bind(name.clone());
                    }
                    sep.push_unseparated(")");
                    rows.extend(qb.build_query_as::<GroupRow>().fetch_all(&mut *conn).await?);
                }
                rows
            }
            Some(parent_column) => {
                let parent_ids: Vec<i64> = at_level
                    .iter()
                    .filter_map(|p| found.get(&p[..depth - 1]).map(|(id, _)| *id))
                    .collect::<BTreeSet<_>>()
                    .into_iter()
                    .collect();
                let count = level.count_column().unwrap_or("NULL");
                let mut rows = Vec::new();
                for chunk in batches(&parent_ids, cap, 1, 0) {
                    let mut qb = QueryBuilder::<Sqlite>::new(format!(
                        "SELECT id, {parent_column} AS parent_id, name, is_default, {count} AS count \
                         FROM {} WHERE {parent_column} IN (",
                        level.table()
                    ));
                    let mut sep = qb.separated(", ");
                    for id in chunk {
                        sep.push_bind(*id);
                    }
                    sep.push_unseparated(")");
                    rows.extend(qb.build_query_as::<GroupRow>().fetch_all(&mut *conn).await?);
                }
                rows
            }
        };

        let index: HashMap<(Option<i64>, GroupName), (i64, Option<i64>)> = rows
            .into_iter()
            .map(|r| {
                let name = GroupName {
                    name: r.name,
                    is_default: r.is_default,
                };
                ((r.parent_id, name), (r.id, r.count))
            })
            .collect();

        for path in at_level {
            let parent_id = if depth == 1 {
                None
            } else {
                match found.get(&path[..depth - 1]) {
                    Some((id, _)) => Some(*id),
                    None => continue,
                }
            };
            if let Some(hit) = index.get(&(parent_id, path[depth - 1].clone())) {
                found.insert(path.clone(), *hit);
            }
        }
    }
    Ok(found)
}

/// Every prefix of every path, so lookups can walk down level by level.
fn with_prefixes<'a>(paths: impl IntoIterator<Item = &'a GroupPath>) -> BTreeSet<GroupPath> {
    let mut all = BTreeSet::new();
    for path in paths {
        for depth in 1..=path.len() {
            all.insert(path[..depth].to_vec());
        }
    }
    all
}

/// Stored ids of simple unique-by-name rows.
async fn lookup_names(
    conn: &mut SqliteConnection,
    table: &str,
    names: &BTreeSet<String>,
    cap: usize,
) -> Result<HashMap<String, i64>> {
    let names: Vec<&String> = names.iter().collect();
    let mut found = HashMap::with_capacity(names.len());
    for chunk in batches(&names, cap, 1, 0) {
        let mut qb = QueryBuilder::<Sqlite>::new(format!("SELECT id, name FROM {table} WHERE name IN ("));
        let mut sep = qb.separated(", ");
        for name in chunk {
            sep.push_bind((*name).clone());
        }
        sep.push_unseparated(")");
        let rows: Vec<(i64, String)> = qb.build_query_as().fetch_all(&mut *conn).await?;
        found.extend(rows.into_iter().map(|(id, name)| (name, id)));
    }
    Ok(found)
}

/// Stored credit ids, given person and role ids.
async fn lookup_credits(
    conn: &mut SqliteConnection,
    credits: &BTreeSet<CreditKey>,
    persons: &HashMap<String, i64>,
    roles: &HashMap<String, i64>,
    cap: usize,
) -> Result<HashMap<CreditKey, i64>> {
    let person_ids: Vec<i64> = credits
        .iter()
        .filter_map(|c| persons.get(&c.person).copied())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();

    let mut stored: HashMap<(i64, Option<i64>), i64> = HashMap::new();
    for chunk in batches(&person_ids, cap, 1, 0) {
        let mut qb = QueryBuilder::<Sqlite>::new("SELECT id, person_id, role_id FROM credits WHERE person_id IN (");
        let mut sep = qb.separated(", ");
        for id in chunk {
            sep.push_bind(*id);
        }
        sep.push_unseparated(")");
        let rows: Vec<(i64, i64, Option<i64>)> = qb.build_query_as().fetch_all(&mut *conn).await?;
        stored.extend(rows.into_iter().map(|(id, person, role)| ((person, role), id)));
    }

    let mut found = HashMap::new();
    for credit in credits {
        let Some(person_id) = persons.get(&credit.person) else {
            continue;
        };
        let role_id = match &credit.role {
            Some(role) => match roles.get(role) {
                Some(id) => Some(*id),
                None => continue,
            },
            None => None,
        };
        if let Some(id) = stored.get(&(*person_id, role_id)) {
            found.insert(credit.clone(), *id);
        }
    }
    Ok(found)
}

/// Stored folder ids of a library.
pub async fn lookup_folders(
    conn: &mut SqliteConnection,
    library_id: i64,
    paths: &BTreeSet<PathBuf>,
    cap: usize,
) -> Result<HashMap<PathBuf, i64>> {
    let paths: Vec<String> = paths.iter().map(|p| path_str(p)).collect();
    let mut found = HashMap::with_capacity(paths.len());
    for chunk in batches(&paths, cap, 1, 1) {
        let mut qb = QueryBuilder::<Sqlite>::new("SELECT id, path FROM folders WHERE library_id = ");
        qb.push_bind(library_id);
        qb.push(" AND path IN (");
        let mut sep = qb.separated(", ");
        for path in chunk {
            sep.push_bind(path.clone());
        }
        sep.push_unseparated(")");
        let rows: Vec<(i64, String)> = qb.build_query_as().fetch_all(&mut *conn).await?;
        found.extend(rows.into_iter().map(|(id, path)| (PathBuf::from(path), id)));
    }
    Ok(found)
}

// ============================================================================
// Resolution
// ============================================================================

/// Work out which referenced entities are not stored yet.
pub async fn find_missing(
    pool: &SqlitePool,
    library_id: i64,
    pending: &PendingForeignKeys,
    cap: usize,
) -> Result<MissingForeignKeys> {
    let mut conn = pool.acquire().await?;
    let conn = &mut *conn;
    let mut missing = MissingForeignKeys::default();

    let stored = lookup_groups(conn, &with_prefixes(pending.groups.keys()), cap).await?;
    for (path, count) in &pending.groups {
        match stored.get(path) {
            None => {
                missing.groups.insert(path.clone(), *count);
            }
            Some((id, stored_count)) => {
                if let Some(count) = count
                    && Some(*count) > *stored_count
                {
                    let level = GroupLevel::ALL[path.len() - 1];
                    missing.count_updates.insert((level, *id), *count);
                }
            }
        }
    }

    for (kind, names) in &pending.named {
        let stored = lookup_names(conn, kind.table(), names, cap).await?;
        let absent: BTreeSet<String> = names.iter().filter(|n| !stored.contains_key(*n)).cloned().collect();
        if !absent.is_empty() {
            missing.named.insert(*kind, absent);
        }
    }

    let persons = lookup_names(conn, "credit_persons", &pending.persons(), cap).await?;
    let roles = lookup_names(conn, "credit_roles", &pending.roles(), cap).await?;
    missing.persons = pending
        .persons()
        .into_iter()
        .filter(|p| !persons.contains_key(p))
        .collect();
    missing.roles = pending
        .roles()
        .into_iter()
        .filter(|r| !roles.contains_key(r))
        .collect();
    let credits = lookup_credits(conn, &pending.credits, &persons, &roles, cap).await?;
    missing.credits = pending
        .credits
        .iter()
        .filter(|c| !credits.contains_key(*c))
        .cloned()
        .collect();

    let folders = lookup_folders(conn, library_id, &pending.folders, cap).await?;
    missing.folders = pending
        .folders
        .iter()
        .filter(|f| !folders.contains_key(*f))
        .cloned()
        .collect();

    Ok(missing)
}

// ============================================================================
// Creation
// ============================================================================

/// Create everything in `missing`, in dependency order, in one transaction.
///
/// Returns the number of rows created or updated.
pub async fn create_missing(
    pool: &SqlitePool,
    library_id: i64,
    missing: &MissingForeignKeys,
    cap: usize,
) -> Result<u64> {
    if missing.is_empty() {
        return Ok(0);
    }

    let mut tx = pool.begin().await?;
    let mut changed = 0;

    changed += create_groups(&mut tx, &missing.groups, cap).await?;
    changed += update_counts(&mut tx, &missing.count_updates).await?;

    for (kind, names) in &missing.named {
        changed += insert_names(&mut tx, kind.table(), names, cap).await?;
    }
    changed += insert_names(&mut tx, "credit_persons", &missing.persons, cap).await?;
    changed += insert_names(&mut tx, "credit_roles", &missing.roles, cap).await?;
    changed += create_credits(&mut tx, &missing.credits, cap).await?;

    changed += create_folders(&mut tx, library_id, &missing.folders, cap).await?;

    tx.commit().await.with_context("committing new foreign keys")?;

    tracing::debug!(target: "importer::fk", library = library_id, changed, "Foreign keys created");
    Ok(changed)
}

async fn create_groups(
    conn: &mut SqliteConnection,
    groups: &BTreeMap<GroupPath, Option<i64>>,
    cap: usize,
) -> Result<u64> {
    let mut changed = 0;
    for level in GroupLevel::ALL {
        let depth = level as usize + 1;
        let at_level: Vec<(&GroupPath, Option<i64>)> = groups
            .iter()
            .filter(|(p, _)| p.len() == depth)
            .map(|(p, c)| (p, *c))
            .collect();
        if at_level.is_empty() {
            continue;
        }

        // Parents were created by the previous iteration
        let parents = if depth == 1 {
            HashMap::new()
        } else {
            let parent_paths: Vec<GroupPath> =
                at_level.iter().map(|(p, _)| p[..depth - 1].to_vec()).collect();
            lookup_groups(conn, &with_prefixes(parent_paths.iter()), cap).await?
        };

        let mut rows: Vec<(Option<i64>, &GroupName, Option<i64>)> = Vec::with_capacity(at_level.len());
        for (path, count) in at_level {
            let parent_id = if depth == 1 {
                None
            } else {
                match parents.get(&path[..depth - 1]) {
                    Some((id, _)) => Some(*id),
                    None => {
                        tracing::warn!(target: "importer::fk", level = ?level, name = %path[depth - 1].name, "Parent group missing, skipping");
                        continue;
                    }
                }
            };
            rows.push((parent_id, &path[depth - 1], count));
        }

        let mut columns = vec!["name", "is_default"];
        if let Some(parent) = level.parent_column() {
            columns.push(parent);
        }
        if let Some(count) = level.count_column() {
            columns.push(count);
        }

        for chunk in batches(&rows, cap, columns.len(), 0) {
            let mut qb = QueryBuilder::<Sqlite>::new(format!(
                "INSERT OR IGNORE INTO {} ({}) ",
                level.table(),
                columns.join(", ")
            ));
            qb.push_values(chunk, |mut b, (parent_id, name, count)| {
                b.push_bind(name.name.clone()).push_bind(name.is_default);
                if level.parent_column().is_some() {
                    b.push_bind(*parent_id);
                }
                if level.count_column().is_some() {
                    b.push_bind(*count);
                }
            });
            changed += qb.build().execute(&mut *conn).await?.rows_affected();
        }
    }
    Ok(changed)
}

/// Raise stored counts; never lowers them.
async fn update_counts(
    conn: &mut SqliteConnection,
    updates: &BTreeMap<(GroupLevel, i64), i64>,
) -> Result<u64> {
    let mut changed = 0;
    for ((level, id), count) in updates {
        let Some(column) = level.count_column() else {
            continue;
        };
        let sql = format!(
            "UPDATE {} SET {column} = ?1 WHERE id = ?2 AND ({column} IS NULL OR {column} < ?1)",
            level.table()
        );
        changed += sqlx::query(&sql)
            .bind(count)
            .bind(id)
            .execute(&mut *conn)
            .await?
            .rows_affected();
    }
    Ok(changed)
}

async fn insert_names(
    conn: &mut SqliteConnection,
    table: &str,
    names: &BTreeSet<String>,
    cap: usize,
) -> Result<u64> {
    let names: Vec<&String> = names.iter().collect();
    let mut changed = 0;
    for chunk in batches(&names, cap, 1, 0) {
        let mut qb = QueryBuilder::<Sqlite>::new(format!("INSERT OR IGNORE INTO {table} (name) "));
        qb.push_values(chunk, |mut b, name| {
            b.push_bind((*name).clone());
        });
        changed += qb.build().execute(&mut *conn).await?.rows_affected();
    }
    Ok(changed)
}

async fn create_credits(
    conn: &mut SqliteConnection,
    credits: &BTreeSet<CreditKey>,
    cap: usize,
) -> Result<u64> {
    if credits.is_empty() {
        return Ok(0);
    }
    let person_names: BTreeSet<String> = credits.iter().map(|c| c.person.clone()).collect();
    let role_names: BTreeSet<String> = credits.iter().filter_map(|c| c.role.clone()).collect();
    let persons = lookup_names(conn, "credit_persons", &person_names, cap).await?;
    let roles = lookup_names(conn, "credit_roles", &role_names, cap).await?;

    let rows: Vec<(i64, Option<i64>)> = credits
        .iter()
        .filter_map(|c| {
            let person = *persons.get(&c.person)?;
            let role = match &c.role {
                Some(r) => Some(*roles.get(r)?),
                None => None,
            };
            Some((person, role))
        })
        .collect();

    let mut changed = 0;
    for chunk in batches(&rows, cap, 2, 0) {
        let mut qb = QueryBuilder::<Sqlite>::new("INSERT OR IGNORE INTO credits (person_id, role_id) ");
        qb.push_values(chunk, |mut b, (person, role)| {
            b.push_bind(*person).push_bind(*role);
        });
        changed += qb.build().execute(&mut *conn).await?.rows_affected();
    }
    Ok(changed)
}

/// Create folders shallowest first, linking each to its parent.
///
/// Folders directly under the library root have no parent row.
pub async fn create_folders(
    conn: &mut SqliteConnection,
    library_id: i64,
    folders: &BTreeSet<PathBuf>,
    cap: usize,
) -> Result<u64> {
    let mut by_depth: BTreeMap<usize, Vec<&PathBuf>> = BTreeMap::new();
    for folder in folders {
        by_depth
            .entry(folder.components().count())
            .or_default()
            .push(folder);
    }

    let mut changed = 0;
    for (_, level) in by_depth {
        let parent_paths: BTreeSet<PathBuf> = level
            .iter()
            .filter_map(|f| f.parent().map(Path::to_path_buf))
            .collect();
        let parents = lookup_folders(conn, library_id, &parent_paths, cap).await?;

        let rows: Vec<(String, String, Option<i64>, Option<String>)> = level
            .iter()
            .map(|f| {
                let name = f
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default();
                let parent_id = f.parent().and_then(|p| parents.get(p).copied());
                let stat = StatTuple::from_path(f).ok().map(|s| s.to_json());
                (path_str(f), name, parent_id, stat)
            })
            .collect();

        for chunk in batches(&rows, cap, 5, 0) {
            let mut qb = QueryBuilder::<Sqlite>::new(
                "INSERT OR IGNORE INTO folders (library_id, path, name, parent_folder_id, stat) ",
            );
            qb.push_values(chunk, |mut b, (path, name, parent_id, stat)| {
                b.push_bind(library_id)
                    .push_bind(path.clone())
                    .push_bind(name.clone())
                    .push_bind(*parent_id)
                    .push_bind(stat.clone());
            });
            changed += qb.build().execute(&mut *conn).await?.rows_affected();
        }
    }
    Ok(changed)
}

/// Create any of `folders` that do not exist yet.
pub async fn ensure_folders(
    conn: &mut SqliteConnection,
    library_id: i64,
    folders: &BTreeSet<PathBuf>,
    cap: usize,
) -> Result<u64> {
    let stored = lookup_folders(conn, library_id, folders, cap).await?;
    let absent: BTreeSet<PathBuf> = folders.iter().filter(|f| !stored.contains_key(*f)).cloned().collect();
    if absent.is_empty() {
        return Ok(0);
    }
    create_folders(conn, library_id, &absent, cap).await
}

/// Load the ids of everything a pending set refers to.
pub async fn load_keys(
    pool: &SqlitePool,
    library_id: i64,
    pending: &PendingForeignKeys,
    cap: usize,
) -> Result<ResolvedKeys> {
    let mut conn = pool.acquire().await?;
    let conn = &mut *conn;

    let groups = lookup_groups(conn, &with_prefixes(pending.groups.keys()), cap)
        .await?
        .into_iter()
        .map(|(path, (id, _))| (path, id))
        .collect();

    let mut named = HashMap::new();
    for (kind, names) in &pending.named {
        named.insert(*kind, lookup_names(conn, kind.table(), names, cap).await?);
    }

    let persons = lookup_names(conn, "credit_persons", &pending.persons(), cap).await?;
    let roles = lookup_names(conn, "credit_roles", &pending.roles(), cap).await?;
    let credits = lookup_credits(conn, &pending.credits, &persons, &roles, cap).await?;
    let folders = lookup_folders(conn, library_id, &pending.folders, cap).await?;

    Ok(ResolvedKeys {
        groups,
        named,
        credits,
        folders,
    })
}
