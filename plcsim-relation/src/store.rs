//! Relation file persistence.

use crate::document::RelationDocument;
use crate::error::RelationError;
use crate::graph::RelationGraph;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

/// Reads and writes the relation file.
#[derive(Debug, Clone)]
pub struct RelationStore {
    path: PathBuf,
}

impl RelationStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Reads the relation document.
    pub fn load_document(&self) -> Result<RelationDocument, RelationError> {
        if !self.path.exists() {
            return Err(RelationError::ConfigurationMissing(self.path.clone()));
        }

        let file = File::open(&self.path)?;
        let document: RelationDocument = serde_json::from_reader(BufReader::new(file))?;
        Ok(document)
    }

    /// Loads the relation graph.
    pub fn load(&self) -> Result<RelationGraph, RelationError> {
        let document = self.load_document()?;
        let graph = RelationGraph::from_document(&document);

        tracing::info!(
            "Loaded {} relations ({} nodes) from {}",
            graph.edges().len(),
            graph.len(),
            self.path.display()
        );
        Ok(graph)
    }

    /// Writes the graph, replacing the file atomically.
    pub fn save(&self, graph: &RelationGraph) -> Result<(), RelationError> {
        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir)?;
        }

        let tmp_path = self.path.with_extension("json.tmp");
        {
            let file = File::create(&tmp_path)?;
            let mut writer = BufWriter::new(file);
            serde_json::to_writer_pretty(&mut writer, &graph.to_document())?;
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }
        fs::rename(&tmp_path, &self.path)?;

        tracing::debug!("Saved relation file {}", self.path.display());
        Ok(())
    }
}
