//! Stream resolver
//!
//! Streams are a purely derived view: any task carrying stream metadata
//! contributes to the stream named by its `stream_id`, and a stream
//! exists only while at least one task references it. The resolver
//! groups member tasks into aggregate rows, computes execution layers
//! over the declared dependencies, and names dependency cycles when
//! layering cannot make progress.

use anyhow::Result;
use serde::Serialize;
use std::collections::{HashMap, HashSet};

use crate::db::repositories::task::{Task, TaskStatus};
use crate::db::TaskRepository;

/// Aggregate view over every task sharing one stream id.
#[derive(Debug, Clone, Serialize)]
pub struct Stream {
    pub id: String,
    pub name: Option<String>,
    pub depends_on: Vec<String>,
    pub files: Vec<String>,
    pub total: u32,
    pub completed: u32,
    pub in_progress: u32,
    pub blocked: u32,
    /// True when every member task is archived.
    pub archived: bool,
}

impl Stream {
    /// Whole-percent completion, 0 for an empty stream.
    pub fn progress_percent(&self) -> u32 {
        if self.total == 0 {
            return 0;
        }
        ((self.completed as f64 / self.total as f64) * 100.0).round() as u32
    }
}

/// Result of topological layering. Streams left in `unresolved` sit on
/// a dependency cycle (or behind one).
#[derive(Debug, Clone, Serialize)]
pub struct LayerPlan {
    pub layers: Vec<Vec<String>>,
    pub unresolved: Vec<String>,
}

pub struct StreamResolver {
    tasks: TaskRepository,
}

impl StreamResolver {
    pub fn new(tasks: TaskRepository) -> Self {
        Self { tasks }
    }

    /// All streams derived from current task rows. Without
    /// `include_archived` only non-archived member tasks contribute, so
    /// a fully archived stream disappears from the default listing.
    pub async fn list(&self, include_archived: bool) -> Result<Vec<Stream>> {
        let tasks = self.tasks.streamed(include_archived).await?;
        Ok(group_streams(&tasks))
    }

    /// One stream by id
    pub async fn get(&self, stream_id: &str, include_archived: bool) -> Result<Option<Stream>> {
        let streams = self.list(include_archived).await?;
        Ok(streams.into_iter().find(|s| s.id == stream_id))
    }

    /// Execution layers over active streams: everything in layer N only
    /// depends on streams in layers before N.
    pub async fn execution_layers(&self) -> Result<LayerPlan> {
        let streams = self.list(false).await?;
        Ok(layer_streams(&streams))
    }

    /// Explicit cycle check over active streams, independent of
    /// layering. Returns the member ids of each cycle found.
    pub async fn find_cycles(&self) -> Result<Vec<Vec<String>>> {
        let streams = self.list(false).await?;
        Ok(detect_cycles(&streams))
    }

    /// Every other active stream declaring overlap with any of the
    /// candidate paths. Used to keep two parallel streams off the same
    /// files.
    pub async fn conflict_check(
        &self,
        paths: &[String],
        exclude_stream: Option<&str>,
    ) -> Result<Vec<Stream>> {
        let candidates: HashSet<&str> = paths.iter().map(String::as_str).collect();
        let streams = self.list(false).await?;

        Ok(streams
            .into_iter()
            .filter(|stream| Some(stream.id.as_str()) != exclude_stream)
            .filter(|stream| stream.files.iter().any(|f| candidates.contains(f.as_str())))
            .collect())
    }
}

/// Group streamed tasks (ordered oldest first) into streams. The oldest
/// member task is the authority for the declared dependency list, name
/// and file set; later members only contribute counts.
pub fn group_streams(tasks: &[Task]) -> Vec<Stream> {
    let mut order: Vec<String> = Vec::new();
    let mut streams: HashMap<String, Stream> = HashMap::new();

    for task in tasks {
        let Some(meta) = &task.stream else { continue };

        let stream = streams.entry(meta.id.clone()).or_insert_with(|| {
            order.push(meta.id.clone());
            Stream {
                id: meta.id.clone(),
                name: meta.name.clone(),
                depends_on: meta.depends_on.clone(),
                files: meta.files.clone(),
                total: 0,
                completed: 0,
                in_progress: 0,
                blocked: 0,
                archived: true,
            }
        });

        stream.total += 1;
        match task.status {
            TaskStatus::Completed => stream.completed += 1,
            TaskStatus::InProgress => stream.in_progress += 1,
            TaskStatus::Blocked => stream.blocked += 1,
            TaskStatus::Pending | TaskStatus::Cancelled => {}
        }
        if !task.archived {
            stream.archived = false;
        }
        for file in &meta.files {
            if !stream.files.contains(file) {
                stream.files.push(file.clone());
            }
        }
    }

    order
        .into_iter()
        .filter_map(|id| streams.remove(&id))
        .collect()
}

/// Repeatedly collect every stream whose dependencies all sit in prior
/// layers; stop when a pass adds nothing. Dependencies on unknown
/// stream ids are treated as satisfied so a dangling reference cannot
/// masquerade as a cycle.
pub fn layer_streams(streams: &[Stream]) -> LayerPlan {
    let known: HashSet<&str> = streams.iter().map(|s| s.id.as_str()).collect();
    let mut placed: HashSet<String> = HashSet::new();
    let mut layers: Vec<Vec<String>> = Vec::new();

    loop {
        let mut layer: Vec<String> = Vec::new();
        for stream in streams {
            if placed.contains(&stream.id) {
                continue;
            }
            let ready = stream
                .depends_on
                .iter()
                .filter(|dep| known.contains(dep.as_str()))
                .all(|dep| placed.contains(dep.as_str()));
            if ready {
                layer.push(stream.id.clone());
            }
        }
        if layer.is_empty() {
            break;
        }
        placed.extend(layer.iter().cloned());
        layers.push(layer);
    }

    let unresolved = streams
        .iter()
        .filter(|s| !placed.contains(s.id.as_str()))
        .map(|s| s.id.clone())
        .collect();

    LayerPlan { layers, unresolved }
}

/// Depth-first search with a visited set and an on-path set; meeting an
/// on-path node again means the path from that node forms a cycle.
pub fn detect_cycles(streams: &[Stream]) -> Vec<Vec<String>> {
    let graph: HashMap<&str, &Stream> = streams.iter().map(|s| (s.id.as_str(), s)).collect();
    let mut visited: HashSet<String> = HashSet::new();
    let mut cycles: Vec<Vec<String>> = Vec::new();
    let mut seen_cycles: HashSet<Vec<String>> = HashSet::new();

    for stream in streams {
        let mut path: Vec<String> = Vec::new();
        let mut on_path: HashSet<String> = HashSet::new();
        walk(
            stream.id.as_str(),
            &graph,
            &mut visited,
            &mut path,
            &mut on_path,
            &mut cycles,
            &mut seen_cycles,
        );
    }

    cycles
}

fn walk(
    id: &str,
    graph: &HashMap<&str, &Stream>,
    visited: &mut HashSet<String>,
    path: &mut Vec<String>,
    on_path: &mut HashSet<String>,
    cycles: &mut Vec<Vec<String>>,
    seen_cycles: &mut HashSet<Vec<String>>,
) {
    if on_path.contains(id) {
        let start = path.iter().position(|p| p == id).unwrap_or(0);
        let cycle: Vec<String> = path[start..].to_vec();
        let mut key = cycle.clone();
        key.sort();
        if seen_cycles.insert(key) {
            cycles.push(cycle);
        }
        return;
    }
    if visited.contains(id) {
        return;
    }
    let Some(stream) = graph.get(id) else { return };

    path.push(id.to_string());
    on_path.insert(id.to_string());
    for dep in &stream.depends_on {
        walk(dep, graph, visited, path, on_path, cycles, seen_cycles);
    }
    on_path.remove(id);
    path.pop();
    visited.insert(id.to_string());
}
