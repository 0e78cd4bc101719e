use std::{fs, io, path::Path};

/// Class-id to human readable label table.
#[derive(Debug, Clone, Default)]
pub struct LabelMap {
    names: Vec<String>,
}

impl LabelMap {
    /// Load one label per line, skipping blank lines and `#` comments.
    pub fn from_file<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let contents = fs::read_to_string(path.as_ref())?;
        let labels = Self::parse(&contents);
        tracing::debug!(
            path = %path.as_ref().display(),
            classes = labels.len(),
            "loaded label map"
        );
        Ok(labels)
    }

    pub fn parse(contents: &str) -> Self {
        let names = contents
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .map(str::to_string)
            .collect();
        Self { names }
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Label for `class_id`, falling back to `class{id}` for unknown ids.
    pub fn name(&self, class_id: usize) -> String {
        self.names
            .get(class_id)
            .cloned()
            .unwrap_or_else(|| format!("class{class_id}"))
    }
}
