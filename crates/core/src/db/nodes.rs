//! Node layers and move links.
//!
//! Every tracked path has one or more rows in `nodes`, keyed by
//! `(local_relpath, op_depth)`. Depth 0 is BASE; a working layer rooted at a
//! path of depth `d` lives at `op_depth = d`, and a higher op-depth overrides a
//! lower one for the same path. A move records `moved_to` on the lowest
//! deletion row of the source root and `moved_here` on the copied destination
//! rows.

use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::debug;

use crate::errors::DatabaseError;
use crate::models::{Checksum, Depth, NodeKind, Presence, Props};
use crate::relpath;

/// One row of the `nodes` table.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeRow {
    pub local_relpath: String,
    pub op_depth: i64,
    pub parent_relpath: Option<String>,
    pub repos_id: Option<i64>,
    pub repos_path: Option<String>,
    pub revision: Option<i64>,
    pub presence: Presence,
    pub kind: NodeKind,
    pub properties: Option<Props>,
    pub depth: Option<Depth>,
    pub checksum: Option<Checksum>,
    pub moved_here: bool,
    pub moved_to: Option<String>,
    pub translated_size: Option<i64>,
    pub last_mod_time: Option<i64>,
}

impl NodeRow {
    /// A row with the parent derived from `local_relpath` and everything
    /// optional left unset.
    pub fn new(local_relpath: &str, op_depth: i64, presence: Presence, kind: NodeKind) -> Self {
        Self {
            local_relpath: local_relpath.to_string(),
            op_depth,
            parent_relpath: parent_of(local_relpath),
            repos_id: None,
            repos_path: None,
            revision: None,
            presence,
            kind,
            properties: None,
            depth: None,
            checksum: None,
            moved_here: false,
            moved_to: None,
            translated_size: None,
            last_mod_time: None,
        }
    }
}

/// Summary of the lowest working layer above some op-depth.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkingLayer {
    pub op_depth: i64,
    pub presence: Presence,
    pub kind: NodeKind,
    pub moved_to: Option<String>,
}

/// Where the move covering a path leads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MoveLink {
    /// Destination of the queried path itself.
    pub dst_relpath: String,
    /// Destination of the move root.
    pub dst_op_root_relpath: String,
    /// Path whose deletion row carries `moved_to`.
    pub src_root_relpath: String,
    /// Root of the deletion layer the move lives in.
    pub src_op_root_relpath: String,
}

/// A move found while bumping: the source node, where it went, the op-depth
/// of the deletion that records the move, and the source kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MovedPair {
    pub src_relpath: String,
    pub dst_relpath: String,
    pub src_op_depth: i64,
    pub src_kind: NodeKind,
}

const NODE_COLUMNS: &str = "local_relpath, op_depth, parent_relpath, repos_id, repos_path, \
     revision, presence, kind, properties, depth, checksum, moved_here, moved_to, \
     translated_size, last_mod_time";

fn parent_of(local_relpath: &str) -> Option<String> {
    if local_relpath.is_empty() {
        None
    } else {
        Some(relpath::dirname(local_relpath).to_string())
    }
}

fn decode_props(idx: usize, raw: Option<String>) -> rusqlite::Result<Option<Props>> {
    raw.map(|text| {
        serde_json::from_str(&text)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
    })
    .transpose()
}

pub(crate) fn encode_props(props: Option<&Props>) -> Result<Option<String>, DatabaseError> {
    Ok(props.map(serde_json::to_string).transpose()?)
}

fn node_from_row(row: &Row<'_>) -> rusqlite::Result<NodeRow> {
    Ok(NodeRow {
        local_relpath: row.get(0)?,
        op_depth: row.get(1)?,
        parent_relpath: row.get(2)?,
        repos_id: row.get(3)?,
        repos_path: row.get(4)?,
        revision: row.get(5)?,
        presence: row.get(6)?,
        kind: row.get(7)?,
        properties: decode_props(8, row.get(8)?)?,
        depth: row.get(9)?,
        checksum: row.get(10)?,
        moved_here: row.get::<_, Option<bool>>(11)?.unwrap_or(false),
        moved_to: row.get(12)?,
        translated_size: row.get(13)?,
        last_mod_time: row.get(14)?,
    })
}

// ---------------------------------------------------------------------------
// Repository
// ---------------------------------------------------------------------------

/// Return the id of the repository row for `root`, inserting it if needed.
pub fn ensure_repos(conn: &Connection, root: &str, uuid: &str) -> Result<i64, DatabaseError> {
    conn.execute(
        "INSERT OR IGNORE INTO repository (root, uuid) VALUES (?1, ?2)",
        params![root, uuid],
    )?;
    let id = conn.query_row(
        "SELECT id FROM repository WHERE root = ?1",
        params![root],
        |row| row.get(0),
    )?;
    Ok(id)
}

/// Root URL and UUID of the repository with `repos_id`.
pub fn fetch_repos_info(conn: &Connection, repos_id: i64) -> Result<(String, String), DatabaseError> {
    conn.query_row(
        "SELECT root, uuid FROM repository WHERE id = ?1",
        params![repos_id],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )
    .optional()?
    .ok_or_else(|| DatabaseError::NotFound {
        entity: "repository".into(),
        id: repos_id.to_string(),
    })
}

// ---------------------------------------------------------------------------
// Point lookups
// ---------------------------------------------------------------------------

/// Insert or replace a layer row.
pub fn insert_node(conn: &Connection, node: &NodeRow) -> Result<(), DatabaseError> {
    conn.execute(
        &format!(
            "INSERT OR REPLACE INTO nodes ({NODE_COLUMNS}) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)"
        ),
        params![
            node.local_relpath,
            node.op_depth,
            node.parent_relpath,
            node.repos_id,
            node.repos_path,
            node.revision,
            node.presence,
            node.kind,
            encode_props(node.properties.as_ref())?,
            node.depth,
            node.checksum,
            node.moved_here.then_some(1i64),
            node.moved_to,
            node.translated_size,
            node.last_mod_time,
        ],
    )?;
    Ok(())
}

/// The row for `local_relpath` at exactly `op_depth`.
pub fn depth_get_info(
    conn: &Connection,
    local_relpath: &str,
    op_depth: i64,
) -> Result<Option<NodeRow>, DatabaseError> {
    let row = conn
        .query_row(
            &format!("SELECT {NODE_COLUMNS} FROM nodes WHERE local_relpath = ?1 AND op_depth = ?2"),
            params![local_relpath, op_depth],
            node_from_row,
        )
        .optional()?;
    Ok(row)
}

/// The BASE row for `local_relpath`.
pub fn base_get_info(conn: &Connection, local_relpath: &str) -> Result<Option<NodeRow>, DatabaseError> {
    depth_get_info(conn, local_relpath, 0)
}

/// The highest layer for `local_relpath`, BASE included.
pub fn top_layer(conn: &Connection, local_relpath: &str) -> Result<Option<NodeRow>, DatabaseError> {
    let row = conn
        .query_row(
            &format!(
                "SELECT {NODE_COLUMNS} FROM nodes WHERE local_relpath = ?1 \
                 ORDER BY op_depth DESC LIMIT 1"
            ),
            params![local_relpath],
            node_from_row,
        )
        .optional()?;
    Ok(row)
}

/// Op-depth of the highest working layer (op-depth > 0) for `local_relpath`.
pub fn working_op_depth(conn: &Connection, local_relpath: &str) -> Result<Option<i64>, DatabaseError> {
    let depth = conn
        .query_row(
            "SELECT op_depth FROM nodes WHERE local_relpath = ?1 AND op_depth > 0 \
             ORDER BY op_depth DESC LIMIT 1",
            params![local_relpath],
            |row| row.get(0),
        )
        .optional()?;
    Ok(depth)
}

/// The lowest layer for `local_relpath` strictly above `op_depth`.
pub fn lowest_working_node(
    conn: &Connection,
    local_relpath: &str,
    op_depth: i64,
) -> Result<Option<WorkingLayer>, DatabaseError> {
    let layer = conn
        .query_row(
            "SELECT op_depth, presence, kind, moved_to FROM nodes \
             WHERE local_relpath = ?1 AND op_depth > ?2 ORDER BY op_depth LIMIT 1",
            params![local_relpath, op_depth],
            |row| {
                Ok(WorkingLayer {
                    op_depth: row.get(0)?,
                    presence: row.get(1)?,
                    kind: row.get(2)?,
                    moved_to: row.get(3)?,
                })
            },
        )
        .optional()?;
    Ok(layer)
}

/// Op-depth of the highest layer for `local_relpath` strictly below `op_depth`.
pub fn highest_layer_below(
    conn: &Connection,
    local_relpath: &str,
    op_depth: i64,
) -> Result<Option<i64>, DatabaseError> {
    let depth = conn
        .query_row(
            "SELECT op_depth FROM nodes WHERE local_relpath = ?1 AND op_depth < ?2 \
             ORDER BY op_depth DESC LIMIT 1",
            params![local_relpath, op_depth],
            |row| row.get(0),
        )
        .optional()?;
    Ok(depth)
}

/// True if `local_relpath` has a layer strictly between `low` and `high`.
pub fn has_layer_between(
    conn: &Connection,
    local_relpath: &str,
    low: i64,
    high: i64,
) -> Result<bool, DatabaseError> {
    let found = conn
        .query_row(
            "SELECT 1 FROM nodes WHERE local_relpath = ?1 AND op_depth > ?2 AND op_depth < ?3",
            params![local_relpath, low, high],
            |_| Ok(()),
        )
        .optional()?;
    Ok(found.is_some())
}

// ---------------------------------------------------------------------------
// Enumeration
// ---------------------------------------------------------------------------

/// Names of the children of `local_relpath` present at `op_depth`, sorted.
pub fn present_children(
    conn: &Connection,
    local_relpath: &str,
    op_depth: i64,
) -> Result<Vec<String>, DatabaseError> {
    let mut stmt = conn.prepare(
        "SELECT local_relpath FROM nodes \
         WHERE parent_relpath = ?1 AND op_depth = ?2 AND presence IN ('normal', 'incomplete') \
         ORDER BY local_relpath",
    )?;
    let children = stmt
        .query_map(params![local_relpath, op_depth], |row| row.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(children
        .iter()
        .map(|child| relpath::basename(child).to_string())
        .collect())
}

/// True if `local_relpath` has any child at `op_depth` that is not a
/// base-deleted marker.
pub fn has_children(conn: &Connection, local_relpath: &str, op_depth: i64) -> Result<bool, DatabaseError> {
    let found = conn
        .query_row(
            "SELECT 1 FROM nodes WHERE parent_relpath = ?1 AND op_depth = ?2 \
             AND presence != 'base-deleted' LIMIT 1",
            params![local_relpath, op_depth],
            |_| Ok(()),
        )
        .optional()?;
    Ok(found.is_some())
}

/// True if `local_relpath` has a child at `op_depth` that is not a file.
pub fn has_non_file_children(
    conn: &Connection,
    local_relpath: &str,
    op_depth: i64,
) -> Result<bool, DatabaseError> {
    let found = conn
        .query_row(
            "SELECT 1 FROM nodes WHERE parent_relpath = ?1 AND op_depth = ?2 \
             AND kind != 'file' LIMIT 1",
            params![local_relpath, op_depth],
            |_| Ok(()),
        )
        .optional()?;
    Ok(found.is_some())
}

/// True if `local_relpath` has any node two or more levels below it at `op_depth`.
pub fn has_grandchildren(
    conn: &Connection,
    local_relpath: &str,
    op_depth: i64,
) -> Result<bool, DatabaseError> {
    let found = conn
        .query_row(
            "SELECT 1 FROM nodes WHERE op_depth = ?2 \
             AND ((?1 = '' AND parent_relpath != '') \
                  OR (parent_relpath > ?1 || '/' AND parent_relpath < ?1 || '0')) \
             LIMIT 1",
            params![local_relpath, op_depth],
            |_| Ok(()),
        )
        .optional()?;
    Ok(found.is_some())
}

/// `local_relpath` and its descendants at `op_depth`, in lexical order.
pub fn subtree_at_op_depth(
    conn: &Connection,
    local_relpath: &str,
    op_depth: i64,
) -> Result<Vec<(String, NodeKind)>, DatabaseError> {
    let mut stmt = conn.prepare(
        "SELECT local_relpath, kind FROM nodes WHERE op_depth = ?2 \
         AND (?1 = '' OR local_relpath = ?1 \
              OR (local_relpath > ?1 || '/' AND local_relpath < ?1 || '0')) \
         ORDER BY local_relpath",
    )?;
    let rows = stmt
        .query_map(params![local_relpath, op_depth], |row| Ok((row.get(0)?, row.get(1)?)))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Proper descendants of `local_relpath` at `op_depth`, deepest paths first.
pub fn descendants_at_op_depth_rev(
    conn: &Connection,
    local_relpath: &str,
    op_depth: i64,
) -> Result<Vec<(String, NodeKind)>, DatabaseError> {
    let mut stmt = conn.prepare(
        "SELECT local_relpath, kind FROM nodes WHERE op_depth = ?2 \
         AND ((?1 = '' AND local_relpath != '') \
              OR (local_relpath > ?1 || '/' AND local_relpath < ?1 || '0')) \
         ORDER BY local_relpath DESC",
    )?;
    let rows = stmt
        .query_map(params![local_relpath, op_depth], |row| Ok((row.get(0)?, row.get(1)?)))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Every distinct path at or below `local_relpath`, in any layer.
pub fn subtree_relpaths(conn: &Connection, local_relpath: &str) -> Result<Vec<String>, DatabaseError> {
    let mut stmt = conn.prepare(
        "SELECT DISTINCT local_relpath FROM nodes \
         WHERE ?1 = '' OR local_relpath = ?1 \
               OR (local_relpath > ?1 || '/' AND local_relpath < ?1 || '0') \
         ORDER BY local_relpath",
    )?;
    let rows = stmt
        .query_map(params![local_relpath], |row| row.get(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// `(relpath, repos_path, revision)` for every BASE row at or below `local_relpath`.
pub fn base_repos_locations(
    conn: &Connection,
    local_relpath: &str,
) -> Result<Vec<(String, Option<String>, Option<i64>)>, DatabaseError> {
    let mut stmt = conn.prepare(
        "SELECT local_relpath, repos_path, revision FROM nodes WHERE op_depth = 0 \
         AND (?1 = '' OR local_relpath = ?1 \
              OR (local_relpath > ?1 || '/' AND local_relpath < ?1 || '0')) \
         ORDER BY local_relpath",
    )?;
    let rows = stmt
        .query_map(params![local_relpath], |row| {
            Ok((row.get(0)?, row.get(1)?, row.get(2)?))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

// ---------------------------------------------------------------------------
// Layer rewrites
// ---------------------------------------------------------------------------

/// Move the rows at `from_op_depth` at or below `local_relpath` to
/// `to_op_depth`, dropping their `moved_here` flag. A moved-here subtree
/// becomes an ordinary local copy.
pub fn shift_op_depth(
    conn: &Connection,
    local_relpath: &str,
    from_op_depth: i64,
    to_op_depth: i64,
) -> Result<usize, DatabaseError> {
    let changed = conn.execute(
        "UPDATE nodes SET op_depth = ?3, moved_here = NULL WHERE op_depth = ?2 \
         AND (?1 = '' OR local_relpath = ?1 \
              OR (local_relpath > ?1 || '/' AND local_relpath < ?1 || '0'))",
        params![local_relpath, from_op_depth, to_op_depth],
    )?;
    debug!(relpath = %local_relpath, from_op_depth, to_op_depth, changed, "shifted layer");
    Ok(changed)
}

/// Delete every row at or below `local_relpath` above `op_depth`.
pub fn delete_above(conn: &Connection, local_relpath: &str, op_depth: i64) -> Result<usize, DatabaseError> {
    let deleted = conn.execute(
        "DELETE FROM nodes WHERE op_depth > ?2 \
         AND (?1 = '' OR local_relpath = ?1 \
              OR (local_relpath > ?1 || '/' AND local_relpath < ?1 || '0'))",
        params![local_relpath, op_depth],
    )?;
    Ok(deleted)
}

/// Delete every row at or below `local_relpath` at exactly `op_depth`.
pub fn delete_at(conn: &Connection, local_relpath: &str, op_depth: i64) -> Result<usize, DatabaseError> {
    let deleted = conn.execute(
        "DELETE FROM nodes WHERE op_depth = ?2 \
         AND (?1 = '' OR local_relpath = ?1 \
              OR (local_relpath > ?1 || '/' AND local_relpath < ?1 || '0'))",
        params![local_relpath, op_depth],
    )?;
    Ok(deleted)
}

/// Delete the rows at `op_depth` at or below `local_relpath` that have no
/// present row at `lower_op_depth` to shadow.
pub fn delete_no_lower_layer(
    conn: &Connection,
    local_relpath: &str,
    op_depth: i64,
    lower_op_depth: i64,
) -> Result<usize, DatabaseError> {
    let deleted = conn.execute(
        "DELETE FROM nodes WHERE op_depth = ?2 \
         AND (?1 = '' OR local_relpath = ?1 \
              OR (local_relpath > ?1 || '/' AND local_relpath < ?1 || '0')) \
         AND NOT EXISTS (SELECT 1 FROM nodes n \
                         WHERE n.local_relpath = nodes.local_relpath AND n.op_depth = ?3 \
                           AND n.presence IN ('normal', 'incomplete', 'not-present'))",
        params![local_relpath, op_depth, lower_op_depth],
    )?;
    Ok(deleted)
}

/// Turn the rows at `op_depth` at or below `local_relpath` into base-deleted
/// markers, keeping kind and move information.
pub fn replace_with_base_deleted(
    conn: &Connection,
    local_relpath: &str,
    op_depth: i64,
) -> Result<usize, DatabaseError> {
    let replaced = conn.execute(
        "INSERT OR REPLACE INTO nodes \
             (local_relpath, op_depth, parent_relpath, kind, moved_to, presence) \
         SELECT local_relpath, op_depth, parent_relpath, kind, moved_to, 'base-deleted' \
         FROM nodes WHERE op_depth = ?2 \
         AND (?1 = '' OR local_relpath = ?1 \
              OR (local_relpath > ?1 || '/' AND local_relpath < ?1 || '0'))",
        params![local_relpath, op_depth],
    )?;
    Ok(replaced)
}

pub fn delete_node(conn: &Connection, local_relpath: &str, op_depth: i64) -> Result<(), DatabaseError> {
    conn.execute(
        "DELETE FROM nodes WHERE local_relpath = ?1 AND op_depth = ?2",
        params![local_relpath, op_depth],
    )?;
    Ok(())
}

/// Shadow `local_relpath` with a base-deleted row at `op_depth`.
pub fn install_working_node_for_delete(
    conn: &Connection,
    local_relpath: &str,
    op_depth: i64,
    kind: NodeKind,
) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT OR REPLACE INTO nodes (local_relpath, op_depth, parent_relpath, presence, kind) \
         VALUES (?1, ?2, ?3, 'base-deleted', ?4)",
        params![local_relpath, op_depth, parent_of(local_relpath), kind],
    )?;
    Ok(())
}

/// When a node appears at `op_depth` below a parent that is deleted at a
/// higher layer, extend that deletion over the new node.
pub fn extend_parent_delete(
    conn: &Connection,
    local_relpath: &str,
    kind: NodeKind,
    op_depth: i64,
) -> Result<(), DatabaseError> {
    let parent_relpath = relpath::dirname(local_relpath);
    let Some(parent) = lowest_working_node(conn, parent_relpath, op_depth)? else {
        return Ok(());
    };

    let existing = lowest_working_node(conn, local_relpath, op_depth)?;
    if existing.map_or(true, |layer| parent.op_depth < layer.op_depth) {
        debug!(relpath = %local_relpath, op_depth = parent.op_depth, "extending parent delete");
        install_working_node_for_delete(conn, local_relpath, parent.op_depth, kind)?;
    }
    Ok(())
}

/// Undo [`extend_parent_delete`] once the node at `op_depth` is gone.
pub fn retract_parent_delete(
    conn: &Connection,
    local_relpath: &str,
    op_depth: i64,
) -> Result<(), DatabaseError> {
    let Some(layer) = lowest_working_node(conn, local_relpath, op_depth)? else {
        return Ok(());
    };

    if let Some(moved_to) = &layer.moved_to {
        // The destination stays behind as a plain copy.
        clear_moved_here_recursive(conn, moved_to, relpath::depth(moved_to))?;
    }

    if layer.presence == Presence::BaseDeleted {
        debug!(relpath = %local_relpath, op_depth = layer.op_depth, "retracting parent delete");
        delete_node(conn, local_relpath, layer.op_depth)?;
    } else if layer.moved_to.is_some() {
        clear_moved_to(conn, local_relpath, layer.op_depth)?;
    }
    Ok(())
}

/// Copy the row at `(src_relpath, src_op_depth)` to `(dst_relpath,
/// dst_op_depth)`, marking it moved-here. The destination keeps its own
/// `moved_to`, and its recorded file info while the checksum is unchanged.
pub fn copy_node_move(
    conn: &Connection,
    src_relpath: &str,
    src_op_depth: i64,
    dst_relpath: &str,
    dst_op_depth: i64,
) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT OR REPLACE INTO nodes \
             (local_relpath, op_depth, parent_relpath, repos_id, repos_path, revision, presence, \
              depth, kind, checksum, properties, translated_size, last_mod_time, moved_here, \
              moved_to) \
         SELECT ?3, ?4, ?5, s.repos_id, s.repos_path, s.revision, s.presence, \
                s.depth, s.kind, s.checksum, s.properties, \
                CASE WHEN d.checksum = s.checksum THEN d.translated_size END, \
                CASE WHEN d.checksum = s.checksum THEN d.last_mod_time END, \
                1, d.moved_to \
         FROM nodes s \
         LEFT JOIN nodes d ON d.local_relpath = ?3 AND d.op_depth = ?4 \
         WHERE s.local_relpath = ?1 AND s.op_depth = ?2",
        params![
            src_relpath,
            src_op_depth,
            dst_relpath,
            dst_op_depth,
            parent_of(dst_relpath)
        ],
    )?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Move links
// ---------------------------------------------------------------------------

/// Follow the move covering `local_relpath` from the first layer above
/// `op_depth`, walking up through ancestors deleted in the same layer.
pub fn op_depth_moved_to(
    conn: &Connection,
    op_depth: i64,
    local_relpath: &str,
) -> Result<Option<MoveLink>, DatabaseError> {
    let mut current = local_relpath;
    loop {
        let Some(layer) = lowest_working_node(conn, current, op_depth)? else {
            return Ok(None);
        };

        if let Some(moved_to) = layer.moved_to {
            let below = relpath::skip_ancestor(current, local_relpath).unwrap_or("");
            return Ok(Some(MoveLink {
                dst_relpath: relpath::join(&moved_to, below),
                src_root_relpath: current.to_string(),
                src_op_root_relpath: relpath::ancestor_at_depth(current, layer.op_depth)
                    .to_string(),
                dst_op_root_relpath: moved_to,
            }));
        }

        if current.is_empty() {
            return Ok(None);
        }
        current = relpath::dirname(current);
        if layer.op_depth > relpath::depth(current) {
            return Ok(None);
        }
    }
}

/// Moves recorded on the first layer above `op_depth` for nodes at or below
/// `local_relpath` present at `op_depth`.
pub fn moved_pairs(
    conn: &Connection,
    local_relpath: &str,
    op_depth: i64,
) -> Result<Vec<MovedPair>, DatabaseError> {
    let mut stmt = conn.prepare(
        "SELECT n.local_relpath, d.moved_to, d.op_depth, n.kind \
         FROM nodes n \
         JOIN nodes d ON d.local_relpath = n.local_relpath \
          AND d.op_depth = (SELECT MIN(dd.op_depth) FROM nodes dd \
                            WHERE dd.local_relpath = n.local_relpath AND dd.op_depth > ?2) \
         WHERE n.op_depth = ?2 AND d.moved_to IS NOT NULL \
           AND (?1 = '' OR n.local_relpath = ?1 \
                OR (n.local_relpath > ?1 || '/' AND n.local_relpath < ?1 || '0')) \
         ORDER BY n.local_relpath",
    )?;
    let pairs = stmt
        .query_map(params![local_relpath, op_depth], |row| {
            Ok(MovedPair {
                src_relpath: row.get(0)?,
                dst_relpath: row.get(1)?,
                src_op_depth: row.get(2)?,
                src_kind: row.get(3)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(pairs)
}

/// `(src_relpath, kind, dst_relpath, repos_path)` for every proper descendant
/// of `local_relpath` whose row at `op_depth` records a move. Kind and
/// repository path come from the layer below.
pub fn op_depth_moved_pairs(
    conn: &Connection,
    local_relpath: &str,
    op_depth: i64,
) -> Result<Vec<(String, NodeKind, String, Option<String>)>, DatabaseError> {
    let mut stmt = conn.prepare(
        "SELECT n.local_relpath, p.kind, n.moved_to, p.repos_path \
         FROM nodes n \
         JOIN nodes p ON p.local_relpath = n.local_relpath \
          AND p.op_depth = (SELECT MAX(v.op_depth) FROM nodes v \
                            WHERE v.local_relpath = n.local_relpath AND v.op_depth < ?2) \
         WHERE n.op_depth = ?2 AND n.moved_to IS NOT NULL \
           AND ((?1 = '' AND n.local_relpath != '') \
                OR (n.local_relpath > ?1 || '/' AND n.local_relpath < ?1 || '0')) \
         ORDER BY n.local_relpath",
    )?;
    let pairs = stmt
        .query_map(params![local_relpath, op_depth], |row| {
            Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(pairs)
}

/// `(src_relpath, dst_relpath, src_op_depth)` for proper descendants of
/// `local_relpath` at `op_depth` whose first higher layer records a move.
pub fn moved_descendants(
    conn: &Connection,
    local_relpath: &str,
    op_depth: i64,
) -> Result<Vec<(String, String, i64)>, DatabaseError> {
    let mut stmt = conn.prepare(
        "SELECT n.local_relpath, h.moved_to, h.op_depth \
         FROM nodes n \
         JOIN nodes h ON h.local_relpath = n.local_relpath \
          AND h.op_depth = (SELECT MIN(o.op_depth) FROM nodes o \
                            WHERE o.local_relpath = n.local_relpath AND o.op_depth > ?2) \
         WHERE n.op_depth = ?2 AND h.moved_to IS NOT NULL \
           AND ((?1 = '' AND n.local_relpath != '') \
                OR (n.local_relpath > ?1 || '/' AND n.local_relpath < ?1 || '0')) \
         ORDER BY n.local_relpath",
    )?;
    let rows = stmt
        .query_map(params![local_relpath, op_depth], |row| {
            Ok((row.get(0)?, row.get(1)?, row.get(2)?))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// `(src_relpath, dst_relpath, op_depth)` for moves recorded at or above
/// `op_depth` inside `local_relpath` whose destination lies outside it.
pub fn moved_outside(
    conn: &Connection,
    local_relpath: &str,
    op_depth: i64,
) -> Result<Vec<(String, String, i64)>, DatabaseError> {
    let mut stmt = conn.prepare(
        "SELECT local_relpath, moved_to, op_depth FROM nodes \
         WHERE op_depth >= ?2 AND moved_to IS NOT NULL \
           AND (?1 = '' OR local_relpath = ?1 \
                OR (local_relpath > ?1 || '/' AND local_relpath < ?1 || '0')) \
           AND NOT ((?1 = '' AND moved_to != '') \
                    OR (moved_to > ?1 || '/' AND moved_to < ?1 || '0')) \
         ORDER BY local_relpath",
    )?;
    let rows = stmt
        .query_map(params![local_relpath, op_depth], |row| {
            Ok((row.get(0)?, row.get(1)?, row.get(2)?))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn clear_moved_to(conn: &Connection, local_relpath: &str, op_depth: i64) -> Result<(), DatabaseError> {
    conn.execute(
        "UPDATE nodes SET moved_to = NULL WHERE local_relpath = ?1 AND op_depth = ?2",
        params![local_relpath, op_depth],
    )?;
    Ok(())
}

/// Clear `moved_here` on every row at `op_depth` at or below `local_relpath`.
pub fn clear_moved_here_recursive(
    conn: &Connection,
    local_relpath: &str,
    op_depth: i64,
) -> Result<(), DatabaseError> {
    conn.execute(
        "UPDATE nodes SET moved_here = NULL WHERE op_depth = ?2 \
         AND (?1 = '' OR local_relpath = ?1 \
              OR (local_relpath > ?1 || '/' AND local_relpath < ?1 || '0'))",
        params![local_relpath, op_depth],
    )?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Recorded file info
// ---------------------------------------------------------------------------

/// Record the size and mtime of the installed working file on the top layer.
pub fn set_recorded_info(
    conn: &Connection,
    local_relpath: &str,
    translated_size: Option<i64>,
    last_mod_time: Option<i64>,
) -> Result<(), DatabaseError> {
    conn.execute(
        "UPDATE nodes SET translated_size = ?2, last_mod_time = ?3 \
         WHERE local_relpath = ?1 \
           AND op_depth = (SELECT MAX(op_depth) FROM nodes WHERE local_relpath = ?1)",
        params![local_relpath, translated_size, last_mod_time],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;

    fn db() -> Database {
        let db = Database::in_memory().unwrap();
        db.initialize().unwrap();
        db
    }

    fn base(conn: &Connection, relpath: &str, kind: NodeKind) {
        let mut row = NodeRow::new(relpath, 0, Presence::Normal, kind);
        row.repos_path = Some(relpath.to_string());
        row.revision = Some(1);
        insert_node(conn, &row).unwrap();
    }

    #[test]
    fn test_insert_and_lookup() {
        let db = db();
        let conn = db.conn();
        let mut row = NodeRow::new("A/f", 0, Presence::Normal, NodeKind::File);
        row.properties = Some(Props::from([("p".to_string(), "v".to_string())]));
        row.checksum = Some(Checksum("abc".into()));
        insert_node(&conn, &row).unwrap();

        let found = depth_get_info(&conn, "A/f", 0).unwrap().unwrap();
        assert_eq!(found, row);
        assert_eq!(found.parent_relpath.as_deref(), Some("A"));
        assert!(depth_get_info(&conn, "A/f", 1).unwrap().is_none());
    }

    #[test]
    fn test_present_children_sorted() {
        let db = db();
        let conn = db.conn();
        base(&conn, "A", NodeKind::Dir);
        base(&conn, "A/z", NodeKind::File);
        base(&conn, "A/b", NodeKind::File);
        base(&conn, "A/b/deep", NodeKind::File);
        let mut gone = NodeRow::new("A/m", 0, Presence::NotPresent, NodeKind::File);
        gone.repos_path = Some("A/m".into());
        insert_node(&conn, &gone).unwrap();

        assert_eq!(present_children(&conn, "A", 0).unwrap(), vec!["b", "z"]);
        assert!(has_children(&conn, "A", 0).unwrap());
        assert!(has_grandchildren(&conn, "A", 0).unwrap());
        assert!(!has_grandchildren(&conn, "A/b", 0).unwrap());
        assert!(!has_non_file_children(&conn, "A", 0).unwrap());
    }

    #[test]
    fn test_op_depth_moved_to_from_descendant() {
        let db = db();
        let conn = db.conn();
        base(&conn, "A", NodeKind::Dir);
        base(&conn, "A/B", NodeKind::Dir);
        let mut root = NodeRow::new("A", 1, Presence::BaseDeleted, NodeKind::Dir);
        root.moved_to = Some("X".into());
        insert_node(&conn, &root).unwrap();
        insert_node(&conn, &NodeRow::new("A/B", 1, Presence::BaseDeleted, NodeKind::Dir)).unwrap();

        let link = op_depth_moved_to(&conn, 0, "A/B").unwrap().unwrap();
        assert_eq!(link.dst_relpath, "X/B");
        assert_eq!(link.dst_op_root_relpath, "X");
        assert_eq!(link.src_root_relpath, "A");
        assert_eq!(link.src_op_root_relpath, "A");

        assert!(op_depth_moved_to(&conn, 1, "A/B").unwrap().is_none());
    }

    #[test]
    fn test_extend_and_retract_parent_delete() {
        let db = db();
        let conn = db.conn();
        // X is deleted at depth 2 above a layer at depth 1.
        insert_node(&conn, &NodeRow::new("P/X", 1, Presence::Normal, NodeKind::Dir)).unwrap();
        insert_node(&conn, &NodeRow::new("P/X", 2, Presence::BaseDeleted, NodeKind::Dir)).unwrap();
        insert_node(&conn, &NodeRow::new("P/X/new", 1, Presence::Normal, NodeKind::File)).unwrap();

        extend_parent_delete(&conn, "P/X/new", NodeKind::File, 1).unwrap();
        let marker = depth_get_info(&conn, "P/X/new", 2).unwrap().unwrap();
        assert_eq!(marker.presence, Presence::BaseDeleted);

        delete_node(&conn, "P/X/new", 1).unwrap();
        retract_parent_delete(&conn, "P/X/new", 1).unwrap();
        assert!(depth_get_info(&conn, "P/X/new", 2).unwrap().is_none());
    }

    #[test]
    fn test_copy_node_move_keeps_dst_moved_to() {
        let db = db();
        let conn = db.conn();
        let mut src = NodeRow::new("A/f", 0, Presence::Normal, NodeKind::File);
        src.revision = Some(2);
        src.checksum = Some(Checksum("new".into()));
        insert_node(&conn, &src).unwrap();
        let mut dst = NodeRow::new("X/f", 1, Presence::Normal, NodeKind::File);
        dst.checksum = Some(Checksum("old".into()));
        dst.translated_size = Some(3);
        dst.moved_to = Some("Y".into());
        insert_node(&conn, &dst).unwrap();

        copy_node_move(&conn, "A/f", 0, "X/f", 1).unwrap();
        let copied = depth_get_info(&conn, "X/f", 1).unwrap().unwrap();
        assert_eq!(copied.revision, Some(2));
        assert_eq!(copied.checksum, Some(Checksum("new".into())));
        assert!(copied.moved_here);
        assert_eq!(copied.moved_to.as_deref(), Some("Y"));
        assert_eq!(copied.translated_size, None);
        assert_eq!(copied.parent_relpath.as_deref(), Some("X"));
    }

    #[test]
    fn test_moved_outside() {
        let db = db();
        let conn = db.conn();
        let mut moved = NodeRow::new("A/B", 2, Presence::BaseDeleted, NodeKind::Dir);
        moved.moved_to = Some("X".into());
        insert_node(&conn, &moved).unwrap();
        let mut inside = NodeRow::new("A/C", 2, Presence::BaseDeleted, NodeKind::Dir);
        inside.moved_to = Some("A/D".into());
        insert_node(&conn, &inside).unwrap();

        let outside = moved_outside(&conn, "A", 0).unwrap();
        assert_eq!(outside, vec![("A/B".to_string(), "X".to_string(), 2)]);
    }
}
