//! Schema persistence.
//!
//! One JSON file per schema-phase round plus the final schema, written
//! under `<run>/schemas/`. Files are pretty-printed with field order
//! preserved, so they are directly editable by hand.

use std::{
    fs,
    path::{Path, PathBuf},
};

use crate::error::{PipelineError, Result};
use crate::schema::Schema;

pub struct SchemaStore {
    dir: PathBuf,
}

impl SchemaStore {
    /// Open a store rooted at `dir`, creating the directory if needed.
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|e| PipelineError::io(&dir, e))?;
        Ok(Self { dir })
    }

    fn round_path(&self, round: usize) -> PathBuf {
        self.dir.join(format!("merged_schema_round_{round}.json"))
    }

    pub fn final_path(&self) -> PathBuf {
        self.dir.join("final_schema.json")
    }

    pub fn save_round(&self, round: usize, schema: &Schema) -> Result<PathBuf> {
        let path = self.round_path(round);
        self.write(&path, schema)?;
        Ok(path)
    }

    pub fn save_final(&self, schema: &Schema) -> Result<PathBuf> {
        let path = self.final_path();
        self.write(&path, schema)?;
        Ok(path)
    }

    pub fn load(&self, path: &Path) -> Result<Schema> {
        let content = fs::read_to_string(path).map_err(|e| PipelineError::io(path, e))?;
        Schema::from_json_str(&content)
    }

    /// Load every `merged_schema_round_<i>.json` in round order.
    pub fn load_intermediates(&self) -> Result<Vec<Schema>> {
        let mut schemas = Vec::new();
        for round in 0.. {
            let path = self.round_path(round);
            if !path.exists() {
                break;
            }
            schemas.push(self.load(&path)?);
        }
        Ok(schemas)
    }

    fn write(&self, path: &Path, schema: &Schema) -> Result<()> {
        fs::write(path, schema.to_pretty_json()?).map_err(|e| PipelineError::io(path, e))
    }
}
