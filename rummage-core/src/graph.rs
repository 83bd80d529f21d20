//! Persistent knowledge graph: named nodes, typed links, and facts.
//!
//! Every mutation flushes the whole graph to SQLite inside one transaction
//! before the call returns, so an acknowledged write is a durable write.

use rusqlite::{Connection, params};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::sync::{Mutex, RwLock};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Error, Debug)]
pub enum GraphError {
    #[error("link references missing node: {0}")]
    MissingNode(String),

    #[error("node not found: {0}")]
    NodeNotFound(String),

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("snapshot corrupt: {0}")]
    Corrupt(String),
}

pub type Result<T> = std::result::Result<T, GraphError>;

/// A named entity with an insertion-ordered, deduplicated fact list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphNode {
    pub name: String,
    #[serde(rename = "type")]
    pub node_type: String,
    #[serde(default)]
    pub facts: Vec<String>,
}

/// A directed typed relation; identity is the whole triple.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphLink {
    pub from: String,
    pub to: String,
    pub relation: String,
}

/// Facts to append to or remove from one node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FactUpdate {
    pub node_name: String,
    pub facts: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphSnapshot {
    pub nodes: Vec<GraphNode>,
    pub links: Vec<GraphLink>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchMatches {
    pub nodes: Vec<GraphNode>,
    pub links: Vec<GraphLink>,
    pub matched: usize,
}

#[derive(Debug, Default)]
struct GraphState {
    nodes: Vec<GraphNode>,
    links: Vec<GraphLink>,
}

impl GraphState {
    fn find_node(&self, name: &str) -> Option<usize> {
        self.nodes.iter().position(|n| n.name == name)
    }

    fn has_node(&self, name: &str) -> bool {
        self.find_node(name).is_some()
    }
}

pub struct GraphStore {
    state: RwLock<GraphState>,
    conn: Mutex<Connection>,
}

impl GraphStore {
    /// Opens (or creates) the store at `path`. A missing or corrupt snapshot
    /// starts an empty store instead of failing.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = match Self::open_connection(path) {
            Ok(conn) => conn,
            Err(e) => {
                warn!(
                    "Graph snapshot at {} unusable ({e}), starting empty",
                    path.display()
                );
                std::fs::remove_file(path).ok();
                Self::open_connection(path)?
            }
        };

        let state = match Self::load_state(&conn) {
            Ok(state) => {
                debug!(
                    "Loaded graph snapshot: {} nodes, {} links",
                    state.nodes.len(),
                    state.links.len()
                );
                state
            }
            Err(e) => {
                warn!("Graph snapshot corrupt ({e}), starting empty");
                GraphState::default()
            }
        };

        Ok(Self {
            state: RwLock::new(state),
            conn: Mutex::new(conn),
        })
    }

    pub fn exists(path: &Path) -> bool {
        path.exists()
    }

    fn open_connection(path: &Path) -> Result<Connection> {
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA foreign_keys = ON;
            ",
        )?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS nodes (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL UNIQUE,
                node_type TEXT NOT NULL,
                facts TEXT NOT NULL  -- JSON array, insertion order preserved
            );

            CREATE TABLE IF NOT EXISTS links (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                from_node TEXT NOT NULL,
                to_node TEXT NOT NULL,
                relation TEXT NOT NULL,
                UNIQUE(from_node, to_node, relation)
            );
            ",
        )?;
        Ok(conn)
    }

    fn load_state(conn: &Connection) -> Result<GraphState> {
        let mut state = GraphState::default();

        let mut stmt = conn.prepare("SELECT name, node_type, facts FROM nodes ORDER BY id")?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?;
        for row in rows {
            let (name, node_type, facts_json) = row?;
            let facts: Vec<String> = serde_json::from_str(&facts_json)
                .map_err(|e| GraphError::Corrupt(format!("facts for node {name}: {e}")))?;
            state.nodes.push(GraphNode {
                name,
                node_type,
                facts,
            });
        }

        let mut stmt = conn.prepare("SELECT from_node, to_node, relation FROM links ORDER BY id")?;
        let rows = stmt.query_map([], |row| {
            Ok(GraphLink {
                from: row.get(0)?,
                to: row.get(1)?,
                relation: row.get(2)?,
            })
        })?;
        for row in rows {
            state.links.push(row?);
        }

        Ok(state)
    }

    /// Write-before-ack: replaces both tables with the in-memory graph in one
    /// transaction.
    fn flush(&self, state: &GraphState) -> Result<()> {
        let mut conn = self.conn.lock().expect("graph connection lock poisoned");
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM links", [])?;
        tx.execute("DELETE FROM nodes", [])?;
        {
            let mut insert =
                tx.prepare("INSERT INTO nodes (name, node_type, facts) VALUES (?1, ?2, ?3)")?;
            for node in &state.nodes {
                let facts = serde_json::to_string(&node.facts)
                    .map_err(|e| GraphError::Corrupt(format!("facts for {}: {e}", node.name)))?;
                insert.execute(params![node.name, node.node_type, facts])?;
            }
        }
        {
            let mut insert =
                tx.prepare("INSERT INTO links (from_node, to_node, relation) VALUES (?1, ?2, ?3)")?;
            for link in &state.links {
                insert.execute(params![link.from, link.to, link.relation])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Creates nodes; an existing name unions facts (first-seen order kept)
    /// and takes the latest type. Returns affected names.
    pub fn add_nodes(&self, nodes: Vec<GraphNode>) -> Result<Vec<String>> {
        let mut state = self.state.write().expect("graph state lock poisoned");
        let mut affected = Vec::new();

        for incoming in nodes {
            let GraphNode {
                name,
                node_type,
                facts,
            } = incoming;
            match state.find_node(&name) {
                Some(idx) => {
                    let existing = &mut state.nodes[idx];
                    existing.node_type = node_type;
                    for fact in facts {
                        if !existing.facts.contains(&fact) {
                            existing.facts.push(fact);
                        }
                    }
                }
                None => {
                    state.nodes.push(GraphNode {
                        name: name.clone(),
                        node_type,
                        facts: dedup_facts(facts),
                    });
                }
            }
            if !affected.contains(&name) {
                affected.push(name);
            }
        }

        self.flush(&state)?;
        Ok(affected)
    }

    /// Adds links; both endpoints must exist. Exact duplicate triples are
    /// silent no-ops. Returns the links actually added.
    pub fn add_links(&self, links: Vec<GraphLink>) -> Result<Vec<GraphLink>> {
        let mut state = self.state.write().expect("graph state lock poisoned");

        for link in &links {
            if !state.has_node(&link.from) {
                return Err(GraphError::MissingNode(link.from.clone()));
            }
            if !state.has_node(&link.to) {
                return Err(GraphError::MissingNode(link.to.clone()));
            }
        }

        let mut added = Vec::new();
        for link in links {
            if !state.links.contains(&link) {
                state.links.push(link.clone());
                added.push(link);
            }
        }

        if !added.is_empty() {
            self.flush(&state)?;
        }
        Ok(added)
    }

    /// Appends facts to existing nodes; duplicates are dropped. Returns the
    /// facts actually added per node.
    pub fn add_facts(&self, appends: Vec<FactUpdate>) -> Result<Vec<FactUpdate>> {
        let mut state = self.state.write().expect("graph state lock poisoned");

        for append in &appends {
            if !state.has_node(&append.node_name) {
                return Err(GraphError::NodeNotFound(append.node_name.clone()));
            }
        }

        let mut applied = Vec::new();
        for append in appends {
            let Some(idx) = state.find_node(&append.node_name) else {
                continue;
            };
            let node = &mut state.nodes[idx];
            let mut added = Vec::new();
            for fact in append.facts {
                if !node.facts.contains(&fact) {
                    node.facts.push(fact.clone());
                    added.push(fact);
                }
            }
            applied.push(FactUpdate {
                node_name: append.node_name,
                facts: added,
            });
        }

        self.flush(&state)?;
        Ok(applied)
    }

    /// Deletes nodes and every link touching them; unknown names are ignored.
    pub fn remove_nodes(&self, names: &[String]) -> Result<()> {
        let mut state = self.state.write().expect("graph state lock poisoned");
        let targets: HashSet<&str> = names.iter().map(String::as_str).collect();

        let nodes_before = state.nodes.len();
        state.nodes.retain(|n| !targets.contains(n.name.as_str()));
        state
            .links
            .retain(|l| !targets.contains(l.from.as_str()) && !targets.contains(l.to.as_str()));

        if state.nodes.len() != nodes_before {
            self.flush(&state)?;
        }
        Ok(())
    }

    /// Removes listed facts where present; absent facts and nodes are ignored.
    pub fn remove_facts(&self, removals: Vec<FactUpdate>) -> Result<()> {
        let mut state = self.state.write().expect("graph state lock poisoned");

        let mut changed = false;
        for removal in removals {
            let Some(idx) = state.find_node(&removal.node_name) else {
                continue;
            };
            let node = &mut state.nodes[idx];
            let before = node.facts.len();
            node.facts.retain(|f| !removal.facts.contains(f));
            changed |= node.facts.len() != before;
        }

        if changed {
            self.flush(&state)?;
        }
        Ok(())
    }

    /// Removes listed link triples where present; absent links are ignored.
    pub fn remove_links(&self, links: &[GraphLink]) -> Result<()> {
        let mut state = self.state.write().expect("graph state lock poisoned");

        let before = state.links.len();
        state.links.retain(|l| !links.contains(l));

        if state.links.len() != before {
            self.flush(&state)?;
        }
        Ok(())
    }

    /// Case-insensitive substring search over node names and fact text.
    /// Returns matched nodes, every link touching a match, and a match count.
    pub fn search_nodes(&self, query: &str) -> SearchMatches {
        let state = self.state.read().expect("graph state lock poisoned");
        let needle = query.to_lowercase();

        let nodes: Vec<GraphNode> = state
            .nodes
            .iter()
            .filter(|n| {
                n.name.to_lowercase().contains(&needle)
                    || n.facts.iter().any(|f| f.to_lowercase().contains(&needle))
            })
            .cloned()
            .collect();

        let names: HashSet<&str> = nodes.iter().map(|n| n.name.as_str()).collect();
        let links = state
            .links
            .iter()
            .filter(|l| names.contains(l.from.as_str()) || names.contains(l.to.as_str()))
            .cloned()
            .collect();

        SearchMatches {
            matched: nodes.len(),
            nodes,
            links,
        }
    }

    pub fn get_full_store(&self) -> GraphSnapshot {
        let state = self.state.read().expect("graph state lock poisoned");
        GraphSnapshot {
            nodes: state.nodes.clone(),
            links: state.links.clone(),
        }
    }

    /// Selected nodes plus the links running between them.
    pub fn get_specific_nodes(&self, names: &[String]) -> GraphSnapshot {
        let state = self.state.read().expect("graph state lock poisoned");
        let wanted: HashSet<&str> = names.iter().map(String::as_str).collect();

        let nodes: Vec<GraphNode> = state
            .nodes
            .iter()
            .filter(|n| wanted.contains(n.name.as_str()))
            .cloned()
            .collect();
        let selected: HashSet<&str> = nodes.iter().map(|n| n.name.as_str()).collect();
        let links = state
            .links
            .iter()
            .filter(|l| selected.contains(l.from.as_str()) && selected.contains(l.to.as_str()))
            .cloned()
            .collect();

        GraphSnapshot { nodes, links }
    }

    pub fn node_count(&self) -> usize {
        self.state.read().expect("graph state lock poisoned").nodes.len()
    }

    pub fn link_count(&self) -> usize {
        self.state.read().expect("graph state lock poisoned").links.len()
    }
}

fn dedup_facts(facts: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    facts.into_iter().filter(|f| seen.insert(f.clone())).collect()
}
