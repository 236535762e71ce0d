use crate::fat::FatFormatter;
use bootforge_core::{FilesystemKind, FormatterRegistry, PartitionFormatter};
use log::debug;
use std::sync::Arc;

/// Register every formatter this crate ships.
pub fn register_builtin_formatters(registry: &mut FormatterRegistry) {
    registry.register(Arc::new(FatFormatter::new()) as Arc<dyn PartitionFormatter>);
    debug!("Registered formatters: {:?}", registry.list_formatters());
}

/// A registry holding the built-in formatters.
pub fn builtin_registry() -> FormatterRegistry {
    let mut registry = FormatterRegistry::new();
    register_builtin_formatters(&mut registry);
    registry
}

/// Filesystems that can be laid down natively.
pub fn list_available_formatters(registry: &FormatterRegistry) -> Vec<FilesystemKind> {
    [FilesystemKind::Fat, FilesystemKind::Ntfs]
        .into_iter()
        .filter(|kind| registry.is_supported(*kind))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_fat_is_built_in() {
        let registry = builtin_registry();
        assert!(registry.is_supported(FilesystemKind::Fat));
        assert!(!registry.is_supported(FilesystemKind::Ntfs));
        assert_eq!(list_available_formatters(&registry), vec![FilesystemKind::Fat]);
        assert_eq!(registry.get_formatter(FilesystemKind::Fat).unwrap().name(), "fat");
    }
}
