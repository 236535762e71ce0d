use crate::{FilesystemKind, PartitionFormatter};
use std::collections::HashMap;
use std::sync::Arc;

pub struct FormatterRegistry {
    formatters: HashMap<FilesystemKind, Arc<dyn PartitionFormatter>>,
}

impl FormatterRegistry {
    pub fn new() -> Self {
        Self {
            formatters: HashMap::new(),
        }
    }

    pub fn register(&mut self, formatter: Arc<dyn PartitionFormatter>) {
        self.formatters.insert(formatter.filesystem(), formatter);
    }

    pub fn get_formatter(&self, kind: FilesystemKind) -> Option<Arc<dyn PartitionFormatter>> {
        self.formatters.get(&kind).cloned()
    }

    pub fn list_formatters(&self) -> Vec<&'static str> {
        self.formatters.values().map(|f| f.name()).collect()
    }

    pub fn is_supported(&self, kind: FilesystemKind) -> bool {
        self.formatters.contains_key(&kind)
    }
}

impl Default for FormatterRegistry {
    fn default() -> Self {
        Self::new()
    }
}
