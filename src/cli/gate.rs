//! Interactive schema edit gate.
//!
//! Writes the learned schema to a file, waits for the user to edit it in
//! whatever editor they like, and reloads it on Enter. This is the CLI's
//! implementation of the edit capability; embedders supply their own gate
//! or keep the identity default.

use std::io::{BufRead, Write};
use std::path::Path;

use colored::Colorize;

use crate::error::{PipelineError, Result};
use crate::schema::{Schema, SchemaEditGate};

pub struct InteractiveGate;

impl SchemaEditGate for InteractiveGate {
    fn edit(&self, schema_path: &Path, _schema: &Schema) -> Result<Schema> {
        let mut stderr = std::io::stderr().lock();
        let _ = writeln!(stderr, "{}", "Schema ready for editing.".bold());
        let _ = writeln!(stderr, "  1. Edit the file: {}", schema_path.display());
        let _ = writeln!(stderr, "  2. Save it");
        let _ = writeln!(stderr, "  3. Press Enter here to continue");

        let mut line = String::new();
        std::io::stdin()
            .lock()
            .read_line(&mut line)
            .map_err(|e| PipelineError::io(schema_path, e))?;

        let content = std::fs::read_to_string(schema_path)
            .map_err(|e| PipelineError::io(schema_path, e))?;
        Schema::from_json_str(&content)
    }
}
