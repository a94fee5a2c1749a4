//! Category tree storage and its transitive closure.
//!
//! The provider ships categories as a nested tree. [`flatten`] turns it into
//! plain category rows plus one [`ClosureEdge`] per (category, ancestor)
//! pair, self included at depth 0, so relation lookups never recurse at
//! read time. The closure is only ever replaced wholesale.

use std::collections::HashSet;

use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::errors::AppResult;
use crate::store::{Page, Pagination};

/// One node of the provider's category tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoryNode {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub plural_name: Option<String>,
    #[serde(default)]
    pub icon_url: Option<String>,
    #[serde(default)]
    pub children: Vec<CategoryNode>,
}

impl CategoryNode {
    pub fn leaf(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            plural_name: None,
            icon_url: None,
            children: Vec::new(),
        }
    }

    pub fn with_children(mut self, children: Vec<CategoryNode>) -> Self {
        self.children = children;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Category {
    pub category_id: String,
    pub name: String,
    pub plural_name: Option<String>,
    pub parent_id: Option<String>,
    pub icon_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClosureEdge {
    pub category_id: String,
    pub ancestor_id: String,
    pub depth: u32,
}

/// A category reached through the closure, with its depth below the
/// ancestor the lookup was anchored on.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RelatedCategory {
    pub category_id: String,
    pub name: String,
    pub parent_id: Option<String>,
    pub depth: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ClosureStats {
    pub categories: usize,
    pub edges: usize,
    pub skipped: usize,
}

#[derive(Debug, Default)]
pub struct FlattenedTree {
    pub categories: Vec<Category>,
    pub edges: Vec<ClosureEdge>,
    pub skipped: usize,
}

/// Depth-first walk emitting every category and its closure edges.
///
/// The walk is iterative. `path` always holds the ancestors of the node
/// being visited, root first, so an ancestor at `path[i]` sits
/// `depth - i` hops above it. A category id seen twice is skipped along
/// with its subtree.
pub fn flatten(tree: &[CategoryNode]) -> FlattenedTree {
    let mut out = FlattenedTree::default();
    let mut seen: HashSet<&str> = HashSet::new();
    let mut path: Vec<&str> = Vec::new();
    let mut stack: Vec<(&CategoryNode, usize)> = tree.iter().rev().map(|node| (node, 0)).collect();

    while let Some((node, depth)) = stack.pop() {
        path.truncate(depth);

        if !seen.insert(node.id.as_str()) {
            warn!(
                target: "closure",
                category_id = %node.id,
                depth,
                "category id repeated in provider tree; skipping subtree"
            );
            out.skipped += 1;
            continue;
        }

        out.categories.push(Category {
            category_id: node.id.clone(),
            name: node.name.clone(),
            plural_name: node.plural_name.clone(),
            parent_id: path.last().map(|id| id.to_string()),
            icon_url: node.icon_url.clone(),
        });
        out.edges.push(ClosureEdge {
            category_id: node.id.clone(),
            ancestor_id: node.id.clone(),
            depth: 0,
        });
        for (index, ancestor) in path.iter().enumerate() {
            out.edges.push(ClosureEdge {
                category_id: node.id.clone(),
                ancestor_id: ancestor.to_string(),
                depth: (depth - index) as u32,
            });
        }

        path.push(node.id.as_str());
        for child in node.children.iter().rev() {
            stack.push((child, depth + 1));
        }
    }

    out
}

pub fn is_category_table_empty(conn: &Connection) -> AppResult<bool> {
    let exists: bool = conn.query_row("SELECT EXISTS(SELECT 1 FROM categories)", [], |row| {
        row.get(0)
    })?;
    Ok(!exists)
}

/// Replaces the category table and its closure with `tree`.
pub fn rebuild(conn: &mut Connection, tree: &[CategoryNode]) -> AppResult<ClosureStats> {
    let flattened = flatten(tree);
    let tx = conn.transaction()?;
    tx.execute("DELETE FROM category_closure", [])?;
    tx.execute("DELETE FROM categories", [])?;
    {
        let mut insert_category = tx.prepare(
            "INSERT INTO categories (category_id, name, plural_name, parent_id, icon_url)
            VALUES (?1, ?2, ?3, ?4, ?5)",
        )?;
        for category in &flattened.categories {
            insert_category.execute(params![
                category.category_id,
                category.name,
                category.plural_name,
                category.parent_id,
                category.icon_url,
            ])?;
        }

        let mut insert_edge = tx.prepare(
            "INSERT INTO category_closure (category_id, ancestor_id, depth) VALUES (?1, ?2, ?3)",
        )?;
        for edge in &flattened.edges {
            insert_edge.execute(params![edge.category_id, edge.ancestor_id, edge.depth])?;
        }
    }
    tx.commit()?;

    let stats = ClosureStats {
        categories: flattened.categories.len(),
        edges: flattened.edges.len(),
        skipped: flattened.skipped,
    };
    info!(
        target: "closure",
        categories = stats.categories,
        edges = stats.edges,
        skipped = stats.skipped,
        "category closure rebuilt"
    );
    Ok(stats)
}

pub fn category(conn: &Connection, category_id: &str) -> AppResult<Option<Category>> {
    let found = conn
        .query_row(
            "SELECT category_id, name, plural_name, parent_id, icon_url
            FROM categories WHERE category_id = ?1",
            [category_id],
            parse_category,
        )
        .optional()?;
    Ok(found)
}

pub fn closure_edges(conn: &Connection, category_id: &str) -> AppResult<Vec<ClosureEdge>> {
    let mut stmt = conn.prepare(
        "SELECT category_id, ancestor_id, depth FROM category_closure
        WHERE category_id = ?1 ORDER BY depth ASC",
    )?;
    let edges = stmt
        .query_map([category_id], |row| {
            Ok(ClosureEdge {
                category_id: row.get(0)?,
                ancestor_id: row.get(1)?,
                depth: row.get(2)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(edges)
}

/// Ancestors of `category_id`, nearest first, excluding itself.
pub fn ancestors(conn: &Connection, category_id: &str) -> AppResult<Vec<RelatedCategory>> {
    let mut stmt = conn.prepare(
        "SELECT c.category_id, c.name, c.parent_id, cc.depth
        FROM category_closure cc
        JOIN categories c ON c.category_id = cc.ancestor_id
        WHERE cc.category_id = ?1 AND cc.depth > 0
        ORDER BY cc.depth ASC",
    )?;
    let rows = stmt
        .query_map([category_id], parse_related)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Every category below `category_id`, excluding itself.
pub fn descendants(conn: &Connection, category_id: &str) -> AppResult<Vec<RelatedCategory>> {
    let mut stmt = conn.prepare(
        "SELECT c.category_id, c.name, c.parent_id, cc.depth
        FROM category_closure cc
        JOIN categories c ON c.category_id = cc.category_id
        WHERE cc.ancestor_id = ?1 AND cc.depth > 0
        ORDER BY cc.depth ASC, c.name ASC",
    )?;
    let rows = stmt
        .query_map([category_id], parse_related)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Categories sharing the root of `category_id`, ordered by depth below
/// that root and then by name.
pub fn related_categories(
    conn: &Connection,
    category_id: &str,
    pagination: Pagination,
) -> AppResult<Page<RelatedCategory>> {
    const ROOT: &str = "(SELECT ancestor_id FROM category_closure
        WHERE category_id = ?1 ORDER BY depth DESC LIMIT 1)";

    let total: i64 = conn.query_row(
        &format!(
            "SELECT COUNT(*) FROM category_closure
            WHERE ancestor_id = {ROOT} AND category_id != ?1"
        ),
        [category_id],
        |row| row.get(0),
    )?;
    let total = total as usize;
    let pagination = pagination.with_total(total);

    let mut stmt = conn.prepare(&format!(
        "SELECT c.category_id, c.name, c.parent_id, cc.depth
        FROM category_closure cc
        JOIN categories c ON c.category_id = cc.category_id
        WHERE cc.ancestor_id = {ROOT} AND cc.category_id != ?1
        ORDER BY cc.depth ASC, c.name ASC
        LIMIT ?2 OFFSET ?3"
    ))?;
    let rows = stmt
        .query_map(
            params![category_id, pagination.limit(), pagination.offset()],
            parse_related,
        )?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Page::new(rows, total, pagination))
}

fn parse_category(row: &Row<'_>) -> rusqlite::Result<Category> {
    Ok(Category {
        category_id: row.get(0)?,
        name: row.get(1)?,
        plural_name: row.get(2)?,
        parent_id: row.get(3)?,
        icon_url: row.get(4)?,
    })
}

fn parse_related(row: &Row<'_>) -> rusqlite::Result<RelatedCategory> {
    Ok(RelatedCategory {
        category_id: row.get(0)?,
        name: row.get(1)?,
        parent_id: row.get(2)?,
        depth: row.get(3)?,
    })
}
